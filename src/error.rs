//! Top-level error aggregator. Mirrors `zfs::errors::Error` wrapping
//! `NvError`/`io::Error`: one `quick_error!` enum with a variant per
//! component error type, each reachable via `?` through `from()`.

use crate::config::ConfigError;
use crate::pool::fsops::FsOpsError;
use crate::pool::strategy::StrategyError;
use crate::pool::PoolError;
use crate::preclear::PreclearError;
use crate::swap::SwapError;
use crate::tool::ToolError;
use crate::zram::ZramError;

/// Coarse classification a caller can branch on without matching every
/// component variant (spec.md §7 taxonomy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Precondition,
    Tool,
    Io,
    Transient,
    Fatal,
}

quick_error! {
    #[derive(Debug)]
    pub enum CoreError {
        Tool(err: ToolError) {
            display("{}", err)
            from()
        }
        Config(err: ConfigError) {
            display("{}", err)
            from()
        }
        Strategy(err: StrategyError) {
            display("{}", err)
            from()
        }
        Pool(err: PoolError) {
            display("{}", err)
            from()
        }
        Preclear(err: PreclearError) {
            display("{}", err)
            from()
        }
        Zram(err: ZramError) {
            display("{}", err)
            from()
        }
        Swap(err: SwapError) {
            display("{}", err)
            from()
        }
        FsOps(err: FsOpsError) {
            display("{}", err)
            from()
        }
        Io(err: std::io::Error) {
            display("I/O error: {}", err)
            from()
        }
        Json(err: serde_json::Error) {
            display("JSON error: {}", err)
            from()
        }
        Validation(message: String) {
            display("validation error: {}", message)
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Reason code accompanying the human message (spec.md §7:
    /// "a single error carrying a human message plus a reason code").
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Validation(_) => ErrorKind::Validation,
            CoreError::Tool(ToolError::Timeout(..)) => ErrorKind::Transient,
            CoreError::Tool(_) => ErrorKind::Tool,
            CoreError::Config(_) | CoreError::Io(_) | CoreError::Json(_) => ErrorKind::Io,
            CoreError::Strategy(StrategyError::MissingCredential)
            | CoreError::Strategy(StrategyError::WeakPassphrase) => ErrorKind::Validation,
            CoreError::Strategy(_) => ErrorKind::Fatal,
            CoreError::Pool(PoolError::Precondition(_)) => ErrorKind::Precondition,
            CoreError::Pool(PoolError::Validation(_)) => ErrorKind::Validation,
            CoreError::Pool(_) => ErrorKind::Tool,
            CoreError::Preclear(PreclearError::Validation(_)) => ErrorKind::Validation,
            CoreError::Preclear(PreclearError::SystemDisk) => ErrorKind::Validation,
            CoreError::Preclear(PreclearError::ReadCheckFailed(_)) => ErrorKind::Fatal,
            CoreError::Preclear(_) => ErrorKind::Tool,
            CoreError::Zram(ZramError::MountSafety(_)) => ErrorKind::Precondition,
            CoreError::Zram(_) => ErrorKind::Tool,
            CoreError::Swap(SwapError::Busy) => ErrorKind::Precondition,
            CoreError::Swap(SwapError::Validation(_)) => ErrorKind::Validation,
            CoreError::Swap(_) => ErrorKind::Tool,
            CoreError::FsOps(_) => ErrorKind::Tool,
        }
    }
}
