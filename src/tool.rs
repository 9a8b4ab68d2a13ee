//! Tool Invoker (spec.md §4.B): a thin async wrapper around external
//! commands (`smartctl`, `hdparm`, `lsblk`, `blkid`, `cryptsetup`, `mkfs.*`,
//! `mount`, `umount`, `parted`, `wipefs`, `dd`, `cmp`, `zramctl`, `btrfs`,
//! `df`, ...). Every invocation gets a wall-clock timeout, captures
//! stdout/stderr as UTF-8, and preserves the exit status; it never swallows
//! errors, it returns a tagged result and leaves severity to the caller.
//!
//! Grounded in `zpool::open3` (one `Command` builder per
//! operation, `debug!` logged immediately before `.output()`), generalized
//! from a single fixed `zpool` binary to an arbitrary roster of tools and
//! from `std::process::Command` to `tokio::process::Command` per the
//! cooperative-suspension scheduling model in spec.md §5.

use std::ffi::OsStr;
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use slog::Logger;
use tokio::process::Command;
use tokio::sync::Notify;
use tokio::time::timeout;

use crate::GlobalLogger;

/// Grace period between SIGTERM and SIGKILL when cancelling a running child
/// (spec.md §5 "Cancellation").
pub const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Default wall-clock timeout for most external tools (spec.md §4.B).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// `df` gets a much shorter timeout since it must never block on a sleeping
/// disk's mount point for long.
pub const DF_TIMEOUT: Duration = Duration::from_secs(5);

quick_error! {
    #[derive(Debug)]
    pub enum ToolError {
        /// The executable could not be found/spawned at all.
        Spawn(cmd: String, err: std::io::Error) {
            display("failed to spawn {}: {}", cmd, err)
        }
        /// The command ran past its allotted timeout and was killed.
        Timeout(cmd: String, after: Duration) {
            display("{} timed out after {:?}", cmd, after)
        }
        /// The command exited non-zero and no benign pattern matched.
        NonZeroExit(cmd: String, code: Option<i32>, stderr: String) {
            display("{} exited with {:?}: {}", cmd, code, stderr)
        }
    }
}

pub type ToolResult<T> = Result<T, ToolError>;

/// Outcome of running an external command, before any caller-side
/// interpretation of exit codes.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    fn from_std(out: Output) -> Self {
        CommandOutput {
            status_code: out.status.code(),
            success: out.status.success(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        }
    }
}

/// Abstraction over "run an external command", so every component that
/// shells out can be driven by a `MockInvoker` in tests — the async
/// analogue of `ZpoolEngine`'s trait-based design ("Using trait here, so I
/// can mock it in unit tests").
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[&OsStr],
        timeout_dur: Duration,
    ) -> ToolResult<CommandOutput>;

    /// Convenience wrapper using [`DEFAULT_TIMEOUT`].
    async fn run_default(&self, program: &str, args: &[&OsStr]) -> ToolResult<CommandOutput> {
        self.run(program, args, DEFAULT_TIMEOUT).await
    }

    /// Like [`run`](Self::run), but races the child against `cancel`: when
    /// `cancel` fires before the child exits, the child is sent SIGTERM,
    /// given [`CANCEL_GRACE`] to exit, then SIGKILLed (spec.md §5). Invokers
    /// with nothing to cancel (the mock, most callers) can ignore `cancel`
    /// and just delegate to `run`.
    async fn run_cancellable(
        &self,
        program: &str,
        args: &[&OsStr],
        timeout_dur: Duration,
        cancel: Arc<Notify>,
    ) -> ToolResult<CommandOutput> {
        let _ = cancel;
        self.run(program, args, timeout_dur).await
    }
}

/// Real process-spawning invoker, backing every component in production.
#[derive(Clone)]
pub struct ProcessInvoker {
    logger: Logger,
}

impl Default for ProcessInvoker {
    fn default() -> Self {
        ProcessInvoker { logger: GlobalLogger::global().new(o!("module" => "tool")) }
    }
}

impl ProcessInvoker {
    pub fn new(logger: Logger) -> Self { ProcessInvoker { logger } }
}

#[async_trait]
impl ToolInvoker for ProcessInvoker {
    async fn run(
        &self,
        program: &str,
        args: &[&OsStr],
        timeout_dur: Duration,
    ) -> ToolResult<CommandOutput> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        debug!(self.logger, "executing"; "cmd" => program, "args" => format_args!("{:?}", args));

        let child = cmd.output();
        let out = match timeout(timeout_dur, child).await {
            Ok(Ok(out)) => out,
            Ok(Err(err)) => return Err(ToolError::Spawn(program.to_string(), err)),
            Err(_) => return Err(ToolError::Timeout(program.to_string(), timeout_dur)),
        };
        let out = CommandOutput::from_std(out);
        debug!(self.logger, "completed"; "cmd" => program, "success" => out.success, "code" => out.status_code);
        Ok(out)
    }

    async fn run_cancellable(
        &self,
        program: &str,
        args: &[&OsStr],
        timeout_dur: Duration,
        cancel: Arc<Notify>,
    ) -> ToolResult<CommandOutput> {
        use std::process::Stdio;
        use tokio::io::AsyncReadExt;

        let mut cmd = Command::new(program);
        cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
        debug!(self.logger, "executing (cancellable)"; "cmd" => program, "args" => format_args!("{:?}", args));

        let mut child = cmd.spawn().map_err(|err| ToolError::Spawn(program.to_string(), err))?;
        let pid = child.id();
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let wait_result = tokio::select! {
            result = timeout(timeout_dur, child.wait()) => result,
            _ = cancel.notified() => {
                if let Some(pid) = pid {
                    let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGTERM);
                }
                let graced = timeout(CANCEL_GRACE, child.wait()).await;
                if graced.is_err() {
                    let _ = child.start_kill();
                }
                debug!(self.logger, "cancelled"; "cmd" => program);
                Ok(child.wait().await)
            },
        };

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(mut pipe) = stdout_pipe.take() {
            let _ = pipe.read_to_string(&mut stdout).await;
        }
        if let Some(mut pipe) = stderr_pipe.take() {
            let _ = pipe.read_to_string(&mut stderr).await;
        }

        let status = match wait_result {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => return Err(ToolError::Spawn(program.to_string(), err)),
            Err(_) => return Err(ToolError::Timeout(program.to_string(), timeout_dur)),
        };

        let out = CommandOutput { status_code: status.code(), success: status.success(), stdout, stderr };
        debug!(self.logger, "completed"; "cmd" => program, "success" => out.success, "code" => out.status_code);
        Ok(out)
    }
}

/// Known-benign exit patterns, classified the way `Error::from_stderr`
/// sniffs stderr before falling back to a generic
/// error (spec.md §7 "Tool" taxonomy entry).
pub fn is_benign_dd_exit(out: &CommandOutput) -> bool {
    out.success || (out.status_code == Some(1) && out.stderr.contains("No space left"))
}

/// smartctl exit code 2 combined with the standby message means "didn't
/// wake the disk, it's asleep" — success, not failure (spec.md §4.C).
pub fn is_smartctl_standby_exit(out: &CommandOutput) -> bool {
    out.status_code == Some(2) || out.stdout.contains("STANDBY")
}

/// `test` for in-crate unit tests, `test-util` so the `tests/` integration
/// suite can drive the same double against the normally-built library.
#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Records every invocation it receives and replays scripted responses
    /// in order — used to assert property 1 (standby safety) and property 6
    /// (LUKS rollback) by inspecting `invocations()` after a run. `Clone`
    /// shares the underlying state (`Arc`) so a cloned invoker handed to a
    /// sub-strategy (the way `PoolEngine` clones its invoker into a
    /// `LuksStrategy`) still records into the same invocation log.
    #[derive(Default, Clone)]
    pub struct MockInvoker {
        scripted: Arc<Mutex<VecDeque<ToolResult<CommandOutput>>>>,
        invocations: Arc<Mutex<Vec<(String, Vec<String>)>>>,
    }

    impl MockInvoker {
        pub fn new() -> Self { Self::default() }

        pub fn push(&self, result: ToolResult<CommandOutput>) {
            self.scripted.lock().unwrap().push_back(result);
        }

        pub fn push_success(&self, stdout: &str) {
            self.push(Ok(CommandOutput {
                status_code: Some(0),
                success: true,
                stdout: stdout.to_string(),
                stderr: String::new(),
            }));
        }

        pub fn invocations(&self) -> Vec<(String, Vec<String>)> {
            self.invocations.lock().unwrap().clone()
        }

        pub fn was_invoked(&self, program: &str) -> bool {
            self.invocations().iter().any(|(p, _)| p == program)
        }
    }

    #[async_trait]
    impl ToolInvoker for MockInvoker {
        async fn run(
            &self,
            program: &str,
            args: &[&OsStr],
            _timeout_dur: Duration,
        ) -> ToolResult<CommandOutput> {
            self.invocations.lock().unwrap().push((
                program.to_string(),
                args.iter().map(|a| a.to_string_lossy().into_owned()).collect(),
            ));
            self.scripted
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ToolError::NonZeroExit(program.to_string(), Some(1), "no script".into())))
        }
    }
}
