//! Swap/Zswap Controller (spec.md §4.K): `applyIntent(current, next)`
//! validates a swapfile intent, then either tears it down or creates it on
//! a background task while the caller gets an immediate `{status:"creating"}`
//! acknowledgement. Zswap parameters are written with the disable/grace/
//! re-enable dance the kernel requires when the compressor or shrinker
//! changes.
//!
//! Grounded in `zpool::open3::ZpoolOpen3::create` (validate, then shell
//! out, rolling back nothing further since that create is a single atomic
//! command) generalized to a validate-then-spawn shape
//! since swapfile creation here is genuinely long-running and must not
//! block the caller.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use slog::Logger;
use tokio::sync::Mutex as AsyncMutex;

use crate::notify::Notifier;
use crate::pool::description::{Pool, PoolType, RaidProfile};
use crate::tool::ToolInvoker;
use crate::util::parse_size;
use crate::GlobalLogger;

const MIN_HEADROOM_BYTES: u64 = 1024 * 1024 * 1024;
const ZSWAP_PARAMS: &str = "/sys/module/zswap/parameters";
const ZSWAP_GRACE: Duration = Duration::from_millis(100);

quick_error! {
    #[derive(Debug)]
    pub enum SwapError {
        Validation(message: String) {
            display("validation error: {}", message)
        }
        Busy {
            display("a swap operation is already in progress")
        }
        Tool(err: crate::tool::ToolError) {
            display("{}", err)
            from()
        }
        Io(err: std::io::Error) {
            display("{}", err)
            from()
        }
    }
}

pub type SwapResult<T> = Result<T, SwapError>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZswapConfig {
    pub zswap: bool,
    pub shrinker: bool,
    pub max_pool_percent: u32,
    pub compressor: String,
    pub accept_threshold_percent: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwapfileIntent {
    pub enabled: bool,
    pub path: String,
    pub size: String,
    pub priority: i32,
    pub config: ZswapConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyStatus {
    Creating,
    Removed,
    Unchanged,
}

pub struct SwapController<I: ToolInvoker> {
    invoker: I,
    notifier: Notifier,
    busy: AsyncMutex<()>,
    logger: Logger,
}

impl<I: ToolInvoker + Send + Sync + 'static> SwapController<I> {
    pub fn new(invoker: I) -> Self {
        SwapController {
            invoker,
            notifier: Notifier::default(),
            busy: AsyncMutex::new(()),
            logger: GlobalLogger::global().new(o!("module" => "swap")),
        }
    }

    /// `applyIntent(current, next)` (spec.md §4.K). Runs validation and the
    /// disable path synchronously; a swapfile creation is handed to a
    /// background task and the caller observes `ApplyStatus::Creating`
    /// immediately (spec.md §5: "cannot be cancelled, reports completion
    /// via notification").
    pub async fn apply_intent(self: &Arc<Self>, current: &SwapfileIntent, next: &SwapfileIntent, pools: &[Pool]) -> SwapResult<ApplyStatus> {
        let _guard = self.busy.try_lock().map_err(|_| SwapError::Busy)?;

        if !next.enabled {
            if current.enabled {
                self.disable(current).await?;
            }
            return Ok(ApplyStatus::Removed);
        }

        if current.enabled && current.path == next.path && current.size == next.size && current.priority == next.priority {
            self.apply_zswap(&current.config, &next.config).await?;
            return Ok(ApplyStatus::Unchanged);
        }

        self.validate_intent(next, pools).await?;
        if current.enabled {
            self.disable(current).await?;
        }

        let controller = Arc::clone(self);
        let next = next.clone();
        tokio::spawn(async move {
            if let Err(err) = controller.create_swapfile(&next).await {
                error!(controller.logger, "swapfile creation failed"; "error" => format_args!("{}", err));
                controller.notifier.alert("Swap", format!("failed to create swapfile at {}: {}", next.path, err)).await;
                return;
            }
            if let Err(err) = controller.apply_zswap(&ZswapConfig::default(), &next.config).await {
                error!(controller.logger, "zswap configuration failed"; "error" => format_args!("{}", err));
            }
            controller.notifier.info("Swap", format!("swapfile ready at {}", next.path)).await;
        });

        Ok(ApplyStatus::Creating)
    }

    async fn disable(&self, current: &SwapfileIntent) -> SwapResult<()> {
        let _ = self.invoker.run_default("swapoff", &[std::ffi::OsStr::new(&current.path)]).await;
        let _ = tokio::fs::remove_file(&current.path).await;
        self.disable_zswap().await
    }

    /// Path validation (spec.md §4.K): must live under `/mnt/<pool>/…` or
    /// `/var/mergerfs/<pool>/<diskN>/…`, the owning pool must be mounted,
    /// a BTRFS pool must not be RAID, and free space must cover size + 1 GiB.
    async fn validate_intent(&self, intent: &SwapfileIntent, pools: &[Pool]) -> SwapResult<()> {
        let size = parse_size(&intent.size).ok_or_else(|| SwapError::Validation(format!("invalid size: {}", intent.size)))?;

        let pool_name = extract_pool_name(&intent.path).ok_or_else(|| {
            SwapError::Validation("path must be under /mnt/<pool>/... or /var/mergerfs/<pool>/<diskN>/...".into())
        })?;

        let pool = pools
            .iter()
            .find(|p| p.name() == &pool_name)
            .ok_or_else(|| SwapError::Validation(format!("unknown pool: {pool_name}")))?;

        if !*pool.status().mounted() {
            return Err(SwapError::Validation(format!("pool {pool_name} is not mounted")));
        }

        if pool.filesystem() == "btrfs" {
            if let Some(raid_level) = *pool.config().raid_level() {
                if raid_level != RaidProfile::Single && *pool.pool_type() != PoolType::Single {
                    return Err(SwapError::Validation("swapfile not permitted on a RAID BTRFS pool".into()));
                }
            }
        }

        let mount_root = Path::new(&intent.path).parent().map(|p| p.to_path_buf()).unwrap_or_else(|| Path::new("/").to_path_buf());
        let free = self.free_space(&mount_root).await?;
        if free < size + MIN_HEADROOM_BYTES {
            return Err(SwapError::Validation(format!(
                "insufficient free space: need {} bytes, have {} bytes",
                size + MIN_HEADROOM_BYTES,
                free
            )));
        }

        Ok(())
    }

    async fn free_space(&self, path: &Path) -> SwapResult<u64> {
        let path_str = path.to_string_lossy().into_owned();
        let args: Vec<&std::ffi::OsStr> =
            vec![std::ffi::OsStr::new("-B1"), std::ffi::OsStr::new("--output=avail"), std::ffi::OsStr::new(&path_str)];
        let out = self.invoker.run(DF_PROGRAM, &args, crate::tool::DF_TIMEOUT).await?;
        out.stdout
            .lines()
            .nth(1)
            .and_then(|l| l.trim().parse::<u64>().ok())
            .ok_or_else(|| SwapError::Validation("could not determine free space".into()))
    }

    async fn create_swapfile(&self, intent: &SwapfileIntent) -> SwapResult<()> {
        let size = parse_size(&intent.size).ok_or_else(|| SwapError::Validation(format!("invalid size: {}", intent.size)))?;
        let path = intent.path.clone();
        let is_btrfs = self.path_is_btrfs(&path).await;

        if is_btrfs {
            self.run_checked("truncate", &["-s".into(), "0".into(), path.clone()]).await?;
            self.run_checked("chattr", &["+C".into(), path.clone()]).await?;
            self.run_checked("fallocate", &["-l".into(), size.to_string(), path.clone()]).await?;
        } else {
            let count_mib = size.div_ceil(1024 * 1024);
            self.run_checked(
                "dd",
                &["if=/dev/zero".into(), format!("of={path}"), "bs=1M".into(), format!("count={count_mib}")],
            )
            .await?;
        }

        self.run_checked("chmod", &["600".into(), path.clone()]).await?;
        self.run_checked("mkswap", &[path.clone()]).await?;
        self.run_checked("swapon", &["--priority".into(), intent.priority.to_string(), path]).await
    }

    async fn path_is_btrfs(&self, path: &str) -> bool {
        let parent = Path::new(path).parent().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();
        let args: Vec<&std::ffi::OsStr> = vec![std::ffi::OsStr::new("-f"), std::ffi::OsStr::new("-c"), std::ffi::OsStr::new("%T"), std::ffi::OsStr::new(&parent)];
        matches!(self.invoker.run_default("stat", &args).await, Ok(out) if out.stdout.trim() == "btrfs")
    }

    /// Writes zswap parameters (spec.md §4.K): `compressor`/`shrinker`
    /// changes require `enabled=N`, a 100 ms grace period, the new values,
    /// then `enabled=Y`; other parameters are live-tunable.
    async fn apply_zswap(&self, before: &ZswapConfig, after: &ZswapConfig) -> SwapResult<()> {
        if !after.zswap {
            return self.disable_zswap().await;
        }

        let needs_restart = before.compressor != after.compressor || before.shrinker != after.shrinker;
        if needs_restart {
            self.write_zswap_param("enabled", "N").await?;
            tokio::time::sleep(ZSWAP_GRACE).await;
            self.write_zswap_param("compressor", &after.compressor).await?;
            self.write_zswap_param("shrinker_enabled", if after.shrinker { "Y" } else { "N" }).await?;
        }
        self.write_zswap_param("max_pool_percent", &after.max_pool_percent.to_string()).await?;
        self.write_zswap_param("accept_threshold_percent", &after.accept_threshold_percent.to_string()).await?;
        self.write_zswap_param("enabled", "Y").await?;
        Ok(())
    }

    async fn disable_zswap(&self) -> SwapResult<()> { self.write_zswap_param("enabled", "N").await }

    async fn write_zswap_param(&self, name: &str, value: &str) -> SwapResult<()> {
        let path = format!("{ZSWAP_PARAMS}/{name}");
        tokio::fs::write(&path, value).await.map_err(SwapError::Io)
    }

    async fn run_checked(&self, program: &str, args: &[String]) -> SwapResult<()> {
        let arg_refs: Vec<&std::ffi::OsStr> = args.iter().map(|s| std::ffi::OsStr::new(s.as_str())).collect();
        let out = self.invoker.run_default(program, &arg_refs).await?;
        if out.success {
            Ok(())
        } else {
            Err(SwapError::Tool(crate::tool::ToolError::NonZeroExit(program.to_string(), out.status_code, out.stderr)))
        }
    }
}

const DF_PROGRAM: &str = "df";

/// Extracts `<pool>` from `/mnt/<pool>/...` or `/var/mergerfs/<pool>/<diskN>/...`.
fn extract_pool_name(path: &str) -> Option<String> {
    let components: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    match components.as_slice() {
        ["mnt", pool, ..] => Some((*pool).to_string()),
        ["var", "mergerfs", pool, ..] => Some((*pool).to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::description::{Pool, PoolConfig, PoolHealth, PoolStatus, PoolType};
    use crate::tool::mock::MockInvoker;

    fn mounted_pool(name: &str) -> Pool {
        Pool::builder()
            .name(name)
            .id("p1")
            .pool_type(PoolType::Single)
            .filesystem("btrfs")
            .data_devices(Vec::new())
            .config(PoolConfig::builder().build().unwrap())
            .status(PoolStatus::builder().mounted(true).health(PoolHealth::Healthy).build().unwrap())
            .build()
            .unwrap()
    }

    #[test]
    fn extracts_pool_name_from_mnt_path() {
        assert_eq!(extract_pool_name("/mnt/pool1/swap"), Some("pool1".to_string()));
        assert_eq!(extract_pool_name("/var/mergerfs/pool1/disk2/swap"), Some("pool1".to_string()));
        assert_eq!(extract_pool_name("/etc/fstab"), None);
    }

    #[tokio::test]
    async fn disabling_is_a_no_op_when_not_currently_enabled() {
        let mock = MockInvoker::new();
        let controller = Arc::new(SwapController::new(mock));
        let current = SwapfileIntent::default();
        let next = SwapfileIntent::default();
        let status = controller.apply_intent(&current, &next, &[mounted_pool("pool1")]).await.unwrap();
        assert_eq!(status, ApplyStatus::Removed);
    }

    #[tokio::test]
    async fn rejects_path_outside_mnt_or_mergerfs() {
        let mock = MockInvoker::new();
        let controller = Arc::new(SwapController::new(mock));
        let current = SwapfileIntent::default();
        let next = SwapfileIntent { enabled: true, path: "/etc/swapfile".into(), size: "4G".into(), priority: -2, config: ZswapConfig::default() };
        let err = controller.apply_intent(&current, &next, &[mounted_pool("pool1")]).await.unwrap_err();
        assert!(matches!(err, SwapError::Validation(_)));
    }

    #[tokio::test]
    async fn rejects_unmounted_pool() {
        let mock = MockInvoker::new();
        let controller = Arc::new(SwapController::new(mock));
        let mut pool = mounted_pool("pool1");
        pool = Pool::builder()
            .name(pool.name().clone())
            .id(pool.id().clone())
            .pool_type(*pool.pool_type())
            .filesystem(pool.filesystem().clone())
            .data_devices(pool.data_devices().clone())
            .config(pool.config().clone())
            .status(PoolStatus::builder().mounted(false).build().unwrap())
            .build()
            .unwrap();
        let current = SwapfileIntent::default();
        let next = SwapfileIntent { enabled: true, path: "/mnt/pool1/swap".into(), size: "4G".into(), priority: -2, config: ZswapConfig::default() };
        let err = controller.apply_intent(&current, &next, &[pool]).await.unwrap_err();
        assert!(matches!(err, SwapError::Validation(_)));
    }
}
