//! `PreclearJob` data model and pass algebra (spec.md §3, §4.I, property 4).
//! Kept separate from the engine's process-driving code the way the
//! teacher separates `zpool::vdev::Disk` (shape) from `zpool::open3`
//! (behavior).

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Zero,
    Ff,
    Random,
    OneZero,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassPattern {
    Zero,
    Ff,
    Random,
}

impl Algorithm {
    /// The pattern run for a given 1-based pass index.
    pub fn pattern_for_pass(self, pass: u32) -> PassPattern {
        match self {
            Algorithm::Zero => PassPattern::Zero,
            Algorithm::Ff => PassPattern::Ff,
            Algorithm::Random => PassPattern::Random,
            Algorithm::OneZero => {
                if pass % 2 == 1 {
                    PassPattern::Ff
                } else {
                    PassPattern::Zero
                }
            },
        }
    }

    /// A `readCheck` is only valid when the algorithm's *final* pass
    /// pattern is zero (property 4).
    pub fn ends_in_zero(self, total_passes: u32) -> bool {
        matches!(self.pattern_for_pass(total_passes.max(1)), PassPattern::Zero)
    }

    pub fn validate_pass_count(self, total_passes: u32) -> Result<(), String> {
        if total_passes == 0 || total_passes > 4 {
            return Err(format!("pass count must be 1-4, got {total_passes}"));
        }
        if self == Algorithm::OneZero && total_passes % 2 != 0 {
            return Err("one-zero requires an even pass count".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Starting,
    WipingPass(u32),
    ReadCheck,
    Done,
    Aborted,
    Error,
}

#[derive(Debug, Clone)]
pub struct PreclearJob {
    pub device: String,
    pub algorithm: Algorithm,
    pub total_passes: u32,
    pub current_pass: u32,
    pub read_check: bool,
    pub log_enabled: bool,
    pub started_at: Instant,
    pub aborted: bool,
    pub state: JobState,
    /// Fired by `abort()` to wake the child currently being awaited via
    /// `ToolInvoker::run_cancellable` (spec.md §5).
    pub cancel: Arc<Notify>,
}

impl PreclearJob {
    pub fn new(device: impl Into<String>, algorithm: Algorithm, total_passes: u32, read_check: bool, log_enabled: bool) -> Result<Self, String> {
        algorithm.validate_pass_count(total_passes)?;
        if read_check && !algorithm.ends_in_zero(total_passes) {
            return Err("readCheck requires an algorithm whose final pass is zero".into());
        }
        Ok(PreclearJob {
            device: device.into(),
            algorithm,
            total_passes,
            current_pass: 0,
            read_check,
            log_enabled,
            started_at: Instant::now(),
            aborted: false,
            state: JobState::Idle,
            cancel: Arc::new(Notify::new()),
        })
    }
}
