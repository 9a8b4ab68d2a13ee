//! Preclear Engine (spec.md §4.I): cancellable multi-pass wipe + optional
//! read-verify + optional format handoff, one job per device, emitting
//! notifications at every transition.
//!
//! Grounded in `ZpoolOpen3`'s shape (build args, run, classify
//! exit) generalized with spec.md §4.I's benign-exit rule (`dd` "No space
//! left" / exit 0 both mean success) and its two-stage SIGTERM/SIGKILL
//! cancellation (spec.md §5 "Cancellation").

pub mod job;

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;

use crate::notify::Notifier;
use crate::preclear::job::{Algorithm, JobState, PassPattern, PreclearJob};
use crate::tool::{CommandOutput, ToolInvoker};

const LOG_CAP_BYTES: u64 = 5 * 1024 * 1024;
const READ_CHECK_LIMIT: usize = 10_000;

quick_error! {
    #[derive(Debug)]
    pub enum PreclearError {
        Validation(message: String) {
            display("validation error: {}", message)
        }
        SystemDisk {
            display("refusing to preclear a system disk")
        }
        AlreadyRunning(device: String) {
            display("a preclear job is already running for {}", device)
        }
        Tool(err: crate::tool::ToolError) {
            display("{}", err)
            from()
        }
        ReadCheckFailed(bad_blocks: usize) {
            display("readCheck found {} non-zero byte offset(s)", bad_blocks)
        }
        Io(err: std::io::Error) {
            display("{}", err)
            from()
        }
    }
}

pub type PreclearResult<T> = Result<T, PreclearError>;

#[derive(Debug, Clone)]
pub struct StartPreclearOptions {
    pub algorithm: Algorithm,
    pub total_passes: u32,
    pub read_check: bool,
    pub log_enabled: bool,
    pub format_filesystem: Option<String>,
}

pub struct PreclearEngine<I: ToolInvoker> {
    invoker: I,
    notifier: Notifier,
    running: AsyncMutex<HashMap<String, Arc<AsyncMutex<PreclearJob>>>>,
    log_dir: std::path::PathBuf,
}

impl<I: ToolInvoker> PreclearEngine<I> {
    pub fn new(invoker: I) -> Self {
        PreclearEngine {
            invoker,
            notifier: Notifier::default(),
            running: AsyncMutex::new(HashMap::new()),
            log_dir: std::path::PathBuf::from("/var/log/preclear"),
        }
    }

    pub async fn is_running(&self, device: &str) -> bool { self.running.lock().await.contains_key(device) }

    /// `startPreclear` (spec.md §4.I). Refuses a second job for the same
    /// device and any system disk; runs the whole lifecycle to completion
    /// or to its terminal error/abort state.
    pub async fn start_preclear(
        self: &Arc<Self>,
        device: &str,
        options: StartPreclearOptions,
        is_system_disk: bool,
    ) -> PreclearResult<()> {
        if is_system_disk {
            return Err(PreclearError::SystemDisk);
        }
        {
            let running = self.running.lock().await;
            if running.contains_key(device) {
                return Err(PreclearError::AlreadyRunning(device.to_string()));
            }
        }

        let job = PreclearJob::new(device, options.algorithm, options.total_passes, options.read_check, options.log_enabled)
            .map_err(PreclearError::Validation)?;
        let handle = Arc::new(AsyncMutex::new(job));
        self.running.lock().await.insert(device.to_string(), handle.clone());

        self.notifier.info("Preclear started", format!("Preclear started on {device}")).await;

        let result = self.run_lifecycle(device, &handle, &options).await;

        self.running.lock().await.remove(device);
        result
    }

    async fn run_lifecycle(&self, device: &str, handle: &Arc<AsyncMutex<PreclearJob>>, options: &StartPreclearOptions) -> PreclearResult<()> {
        {
            let mut job = handle.lock().await;
            job.state = JobState::Starting;
        }

        for pass in 1..=options.total_passes {
            if handle.lock().await.aborted {
                return self.finish_aborted(device, handle).await;
            }
            {
                let mut job = handle.lock().await;
                job.current_pass = pass;
                job.state = JobState::WipingPass(pass);
            }
            self.notifier.info("Preclear pass started", format!("Pass {pass}/{} started on {device}", options.total_passes)).await;

            let pattern = options.algorithm.pattern_for_pass(pass);
            let cancel = handle.lock().await.cancel.clone();
            if let Err(err) = self.run_pass(device, pattern, cancel).await {
                if handle.lock().await.aborted {
                    return self.finish_aborted(device, handle).await;
                }
                handle.lock().await.state = JobState::Error;
                self.notifier.alert("Preclear failed", format!("Pass {pass} failed on {device}: {err}")).await;
                return Err(err);
            }
            self.notifier.info("Preclear pass finished", format!("Pass {pass}/{} finished on {device}", options.total_passes)).await;
        }

        if handle.lock().await.aborted {
            return self.finish_aborted(device, handle).await;
        }

        if options.read_check {
            handle.lock().await.state = JobState::ReadCheck;
            self.notifier.info("ReadCheck started", format!("ReadCheck started on {device}")).await;
            let log_enabled = handle.lock().await.log_enabled;
            match self.run_read_check(device, log_enabled).await {
                Ok(0) => {
                    self.notifier.info("ReadCheck finished", format!("ReadCheck finished on {device}: clean")).await;
                },
                Ok(bad) => {
                    handle.lock().await.state = JobState::Error;
                    self.notifier
                        .alert("ReadCheck failed", format!("ReadCheck failed on {device}: {bad} bad sector(s)"))
                        .await;
                    return Err(PreclearError::ReadCheckFailed(bad));
                },
                Err(err) => {
                    handle.lock().await.state = JobState::Error;
                    return Err(err);
                },
            }
        }

        if let Some(fs) = &options.format_filesystem {
            self.run_format_handoff(device, fs).await?;
        }

        handle.lock().await.state = JobState::Done;
        self.notifier.info("Preclear finished", format!("Preclear finished on {device}")).await;
        Ok(())
    }

    async fn finish_aborted(&self, device: &str, handle: &Arc<AsyncMutex<PreclearJob>>) -> PreclearResult<()> {
        handle.lock().await.state = JobState::Aborted;
        self.notifier.info("Preclear aborted", format!("Preclear aborted on {device}")).await;
        Ok(())
    }

    /// Marks the job aborted and wakes whatever child is currently awaited
    /// via `ToolInvoker::run_cancellable`, which sends SIGTERM and, after a
    /// 2 s grace period, SIGKILL (spec.md §5 "Cancellation").
    pub async fn abort(&self, device: &str) -> PreclearResult<()> {
        let running = self.running.lock().await;
        let Some(handle) = running.get(device) else { return Ok(()) };
        let mut job = handle.lock().await;
        job.aborted = true;
        job.cancel.notify_one();
        Ok(())
    }

    async fn run_pass(&self, device: &str, pattern: PassPattern, cancel: Arc<tokio::sync::Notify>) -> PreclearResult<()> {
        let dev_path = format!("/dev/{}", device.trim_start_matches("/dev/"));
        let source = match pattern {
            PassPattern::Zero => "/dev/zero",
            PassPattern::Random => "/dev/urandom",
            PassPattern::Ff => "/dev/zero", // piped through `tr` below
        };

        let out = if pattern == PassPattern::Ff {
            // `tr '\0' '\377' < /dev/zero | dd of=<dev> bs=1M status=none`
            // modeled as a single invocation naming both halves of the
            // pipeline; a concrete invoker executes it via a shell.
            let sh_cmd = format!("tr '\\0' '\\377' < /dev/zero | dd of={dev_path} bs=1M status=none");
            let args: Vec<&OsStr> = vec![
                OsStr::new("-c"),
                OsStr::new(&sh_cmd),
            ];
            self.invoker.run_cancellable("sh", &args, crate::tool::DEFAULT_TIMEOUT, cancel).await?
        } else {
            let if_arg = format!("if={source}");
            let of_arg = format!("of={dev_path}");
            let args: Vec<&OsStr> = vec![OsStr::new(&if_arg), OsStr::new(&of_arg), OsStr::new("bs=1M"), OsStr::new("status=none")];
            self.invoker.run_cancellable("dd", &args, crate::tool::DEFAULT_TIMEOUT, cancel).await?
        };

        if crate::tool::is_benign_dd_exit(&out) {
            Ok(())
        } else {
            Err(PreclearError::Tool(crate::tool::ToolError::NonZeroExit("dd".into(), out.status_code, out.stderr)))
        }
    }

    /// `cmp -l <dev> /dev/zero | head -n 10000` — bounded memory read
    /// verification (spec.md §4.I).
    async fn run_read_check(&self, device: &str, log_enabled: bool) -> PreclearResult<usize> {
        let dev_path = format!("/dev/{}", device.trim_start_matches("/dev/"));
        let args: Vec<&OsStr> = vec![OsStr::new("-l"), OsStr::new(&dev_path), OsStr::new("/dev/zero")];
        let out = self.invoker.run_default("cmp", &args).await?;
        let offsets: Vec<&str> = out.stdout.lines().take(READ_CHECK_LIMIT).collect();
        let bad_count = offsets.len();

        if log_enabled && bad_count > 0 {
            self.write_preclear_log(device, &offsets).await?;
        }

        Ok(bad_count)
    }

    async fn write_preclear_log(&self, device: &str, offsets: &[&str]) -> PreclearResult<()> {
        tokio::fs::create_dir_all(&self.log_dir).await?;
        let path = self.log_dir.join(format!("{}.log", device.trim_start_matches("/dev/")));
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
        let mut written = file.metadata().map(|m| m.len()).unwrap_or(0);
        for offset in offsets {
            let line = format!("{offset}\n");
            if written + line.len() as u64 > LOG_CAP_BYTES {
                file.write_all(b"[truncated]\n")?;
                break;
            }
            file.write_all(line.as_bytes())?;
            written += line.len() as u64;
        }
        Ok(())
    }

    /// `wipefs -a`, optional partition table, `mkfs.<fs>` (spec.md §4.I
    /// format handoff). Partition node polling retries with backoff up to
    /// ~5 s for `parted`/`partprobe` to materialize the node.
    async fn run_format_handoff(&self, device: &str, fs: &str) -> PreclearResult<()> {
        let dev_path = format!("/dev/{}", device.trim_start_matches("/dev/"));
        self.run_checked("wipefs", &["-a".to_string(), dev_path.clone()]).await?;
        self.run_checked("parted", &["-s".to_string(), dev_path.clone(), "mklabel".into(), "gpt".into()]).await?;
        self.run_checked(
            "parted",
            &["-s".to_string(), dev_path.clone(), "mkpart".into(), "primary".into(), "1MiB".into(), "100%".into()],
        )
        .await?;
        self.run_checked("partprobe", &[dev_path.clone()]).await?;

        let bare = device.trim_start_matches("/dev/");
        let suffix = if bare.starts_with("nvme") || bare.starts_with("mmc") || bare.starts_with("bcache") { "p1" } else { "1" };
        let partition = format!("{dev_path}{suffix}");
        self.wait_for_partition_node(&partition).await?;

        match fs {
            "ext4" => self.run_checked("mkfs.ext4", &["-F".to_string(), partition]).await,
            "xfs" => self.run_checked("mkfs.xfs", &["-f".to_string(), partition]).await,
            "btrfs" => self.run_checked("mkfs.btrfs", &["-f".to_string(), partition]).await,
            "vfat" => self.run_checked("mkfs.vfat", &[partition]).await,
            other => Err(PreclearError::Validation(format!("unsupported format filesystem: {other}"))),
        }
    }

    async fn wait_for_partition_node(&self, path: &str) -> PreclearResult<()> {
        let mut waited = Duration::ZERO;
        let mut backoff = Duration::from_millis(200);
        while !std::path::Path::new(path).exists() {
            if waited >= Duration::from_secs(5) {
                return Err(PreclearError::Validation(format!("partition node {path} did not appear in time")));
            }
            tokio::time::sleep(backoff).await;
            waited += backoff;
            backoff = (backoff * 2).min(Duration::from_secs(1));
        }
        Ok(())
    }

    async fn run_checked(&self, program: &str, args: &[String]) -> PreclearResult<()> {
        let arg_refs: Vec<&OsStr> = args.iter().map(|s| OsStr::new(s.as_str())).collect();
        let out = self.invoker.run_default(program, &arg_refs).await?;
        if out.success {
            Ok(())
        } else {
            Err(PreclearError::Tool(crate::tool::ToolError::NonZeroExit(program.to_string(), out.status_code, out.stderr)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::mock::MockInvoker;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Stands in for a long-running `dd` pass: blocks on the cancel signal
    /// instead of a real child, so `abort()` can be exercised without
    /// spawning a process.
    struct AbortableInvoker {
        pass_started: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl ToolInvoker for AbortableInvoker {
        async fn run(&self, program: &str, _args: &[&OsStr], _timeout_dur: Duration) -> crate::tool::ToolResult<CommandOutput> {
            panic!("{program} should only be driven through run_cancellable in this test");
        }

        async fn run_cancellable(
            &self,
            _program: &str,
            _args: &[&OsStr],
            _timeout_dur: Duration,
            cancel: Arc<tokio::sync::Notify>,
        ) -> crate::tool::ToolResult<CommandOutput> {
            self.pass_started.store(true, Ordering::SeqCst);
            cancel.notified().await;
            Err(crate::tool::ToolError::Timeout("dd".into(), Duration::from_secs(30)))
        }
    }

    fn ok(stdout: &str) -> crate::tool::ToolResult<CommandOutput> {
        Ok(CommandOutput { status_code: Some(0), success: true, stdout: stdout.to_string(), stderr: String::new() })
    }

    fn benign_dd_full() -> crate::tool::ToolResult<CommandOutput> {
        Ok(CommandOutput { status_code: Some(1), success: false, stdout: String::new(), stderr: "No space left on device".into() })
    }

    #[tokio::test]
    async fn rejects_system_disk_without_touching_the_invoker() {
        let mock = MockInvoker::new();
        let engine = Arc::new(PreclearEngine::new(mock));
        let options = StartPreclearOptions {
            algorithm: Algorithm::Zero,
            total_passes: 1,
            read_check: false,
            log_enabled: false,
            format_filesystem: None,
        };
        let result = engine.start_preclear("sdd", options, true).await;
        assert!(matches!(result, Err(PreclearError::SystemDisk)));
        assert!(engine.invoker.invocations().is_empty());
    }

    #[tokio::test]
    async fn single_zero_pass_completes_without_read_check() {
        let mock = MockInvoker::new();
        mock.push(benign_dd_full());
        let engine = Arc::new(PreclearEngine::new(mock));
        let options = StartPreclearOptions {
            algorithm: Algorithm::Zero,
            total_passes: 1,
            read_check: false,
            log_enabled: false,
            format_filesystem: None,
        };
        let result = engine.start_preclear("sdd", options, false).await;
        assert!(result.is_ok());
        assert!(!engine.is_running("sdd").await);
    }

    #[tokio::test]
    async fn abort_cancels_the_active_pass_and_finishes_as_aborted() {
        let pass_started = Arc::new(AtomicBool::new(false));
        let invoker = AbortableInvoker { pass_started: pass_started.clone() };
        let engine = Arc::new(PreclearEngine::new(invoker));
        let options = StartPreclearOptions {
            algorithm: Algorithm::Zero,
            total_passes: 1,
            read_check: false,
            log_enabled: false,
            format_filesystem: None,
        };

        let run_engine = engine.clone();
        let task = tokio::spawn(async move { run_engine.start_preclear("sdd", options, false).await });

        while !pass_started.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        engine.abort("sdd").await.unwrap();

        let result = task.await.unwrap();
        assert!(result.is_ok(), "an aborted job reports success, not an error: {result:?}");
        assert!(!engine.is_running("sdd").await);
    }

    #[tokio::test]
    async fn read_check_with_contamination_reports_bad_block_count() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockInvoker::new();
        mock.push(benign_dd_full()); // the zero wipe pass
        mock.push(ok("0 1 2\n1000 1 2\n")); // cmp -l finds two offsets
        let mut engine = PreclearEngine::new(mock);
        engine.log_dir = dir.path().to_path_buf();
        let engine = Arc::new(engine);
        let options = StartPreclearOptions {
            algorithm: Algorithm::Zero,
            total_passes: 1,
            read_check: true,
            log_enabled: true,
            format_filesystem: None,
        };
        let result = engine.start_preclear("sdd", options, false).await;
        assert!(matches!(result, Err(PreclearError::ReadCheckFailed(2))));
        let log_path = dir.path().join("sdd.log");
        assert!(log_path.exists());
    }
}
