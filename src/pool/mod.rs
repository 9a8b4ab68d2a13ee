//! Pool Engine (spec.md §4.H): `listPools`/`createPool`/`mountPool`/
//! `unmountPool`/`destroyPool`/`addDevice`/`removeDevice`/`addPathRule`/
//! `removePathRule`. Validates, obtains a device strategy, prepares
//! devices, dispatches the filesystem-specific action, persists the
//! definition, and rolls back on failure.
//!
//! Grounded in `ZpoolOpen3` (one method per zpool operation, validate →
//! build args → run → parse) generalized to pools that can be BTRFS,
//! XFS/EXT4, or MergerFS, with an interposed device strategy layer a
//! ZFS-only design never needed.

pub mod description;
pub mod fsops;
pub mod strategy;

use std::path::Path;

use slog::Logger;

use crate::assignment;
use crate::config::AtomicJsonStore;
use crate::pool::description::{DataDevice, PathRule, Pool, PoolConfig, PoolHealth, PoolStatus, PoolType, RaidProfile};
use crate::pool::strategy::{DeviceStrategy, LuksStrategy, PlainStrategy, PrepareOptions};
use crate::sysfs;
use crate::tool::ToolInvoker;
use crate::GlobalLogger;

pub use description::*;

quick_error! {
    #[derive(Debug)]
    pub enum PoolError {
        Validation(message: String) {
            display("validation error: {}", message)
        }
        Precondition(message: String) {
            display("precondition not met: {}", message)
        }
        Strategy(err: strategy::StrategyError) {
            display("{}", err)
            from()
        }
        FsOps(err: fsops::FsOpsError) {
            display("{}", err)
            from()
        }
        Config(err: crate::config::ConfigError) {
            display("{}", err)
            from()
        }
        Io(err: std::io::Error) {
            display("{}", err)
            from()
        }
    }
}

pub type PoolResult<T> = Result<T, PoolError>;

pub struct CreatePoolRequest {
    pub name: String,
    pub pool_type: PoolType,
    pub filesystem: String,
    pub data_devices: Vec<String>,
    pub parity_devices: Vec<String>,
    pub config: PoolConfig,
    pub passphrase: Option<String>,
}

pub struct PoolEngine<I: ToolInvoker + Clone> {
    invoker: I,
    store: AtomicJsonStore<Vec<Pool>>,
    logger: Logger,
}

impl<I: ToolInvoker + Clone> PoolEngine<I> {
    pub fn new(invoker: I, config_path: impl Into<std::path::PathBuf>) -> Self {
        PoolEngine {
            invoker,
            store: AtomicJsonStore::new(config_path),
            logger: GlobalLogger::global().new(o!("module" => "pool")),
        }
    }

    pub fn list_pools(&self) -> PoolResult<Vec<Pool>> { Ok(self.store.read()?.unwrap_or_default()) }

    fn persist(&self, pools: &[Pool]) -> PoolResult<()> { Ok(self.store.write(&pools.to_vec())?) }

    fn validate_request(&self, req: &CreatePoolRequest, existing: &[Pool]) -> PoolResult<()> {
        Pool::validate_name(&req.name).map_err(PoolError::Validation)?;
        if existing.iter().any(|p| p.name() == &req.name) {
            return Err(PoolError::Validation(format!("pool {} already exists", req.name)));
        }
        if req.data_devices.is_empty() {
            return Err(PoolError::Validation("a pool needs at least one data device".into()));
        }
        if let Some(level) = req.config.raid_level() {
            if req.data_devices.len() < level.min_devices() {
                return Err(PoolError::Validation(format!(
                    "{:?} requires at least {} data devices, got {}",
                    level,
                    level.min_devices(),
                    req.data_devices.len()
                )));
            }
        }
        if *req.config.encrypted() {
            let keyfile_requested = *req.config.create_keyfile();
            let strong_pass = req.passphrase.as_ref().map(|p| p.len() >= 8).unwrap_or(false);
            if !keyfile_requested && !strong_pass {
                return Err(PoolError::Validation(
                    "encrypted pools need either create_keyfile or a passphrase >= 8 chars".into(),
                ));
            }
        }
        Ok(())
    }

    /// `createPool` (spec.md §4.H). Validates, obtains a strategy,
    /// prepares devices, dispatches the filesystem action, persists, and
    /// rolls back strategy state on any failure.
    pub async fn create_pool(&self, req: CreatePoolRequest) -> PoolResult<Pool> {
        let mut pools = self.list_pools()?;
        self.validate_request(&req, &pools)?;

        let result = self.create_pool_inner(&req).await;
        match result {
            Ok(pool) => {
                pools.push(pool.clone());
                self.persist(&pools)?;
                Ok(pool)
            },
            Err(err) => {
                warn!(self.logger, "create_pool failed, strategy cleanup already attempted"; "pool" => &req.name);
                Err(err)
            },
        }
    }

    async fn create_pool_inner(&self, req: &CreatePoolRequest) -> PoolResult<Pool> {
        let devices: Vec<(String, bool)> = req
            .data_devices
            .iter()
            .map(|d| (d.clone(), false))
            .chain(req.parity_devices.iter().map(|d| (d.clone(), true)))
            .collect();

        let options = PrepareOptions { passphrase: req.passphrase.clone(), format: true, start_slot: 1 };

        let device_infos = if *req.config.encrypted() {
            let luks = LuksStrategy::new(self.invoker.clone());
            if *req.config.create_keyfile() {
                strategy::materialize_keyfile(&luks, &req.name).await?;
            }
            match luks.prepare(&devices, &req.name, &options).await {
                Ok(infos) => infos,
                Err(err) => return Err(PoolError::Strategy(err)),
            }
        } else {
            PlainStrategy.prepare(&devices, &req.name, &options).await.map_err(PoolError::Strategy)?
        };

        let operational_infos: Vec<&strategy::DeviceInfo> = device_infos.iter().filter(|d| !d.is_parity()).collect();
        let operational: Vec<String> = operational_infos.iter().map(|d| d.operational_device().clone()).collect();
        let operational_slots: Vec<u32> = operational_infos.iter().map(|d| *d.slot()).collect();

        let branches = match self.materialize_filesystem(req, &operational).await {
            Ok(branches) => branches,
            Err(err) => {
                if *req.config.encrypted() {
                    LuksStrategy::new(self.invoker.clone()).cleanup(&device_infos).await;
                }
                return Err(err.into());
            },
        };

        let mount_point = format!("/mnt/{}", req.name);
        if let Err(err) = self.mount_new_pool(req, &operational_slots, &branches, &mount_point).await {
            if *req.config.encrypted() {
                LuksStrategy::new(self.invoker.clone()).cleanup(&device_infos).await;
            }
            return Err(err.into());
        }

        if req.pool_type == PoolType::MergerFs {
            for rule in req.config.path_rules() {
                materialize_path_rule_dirs(&req.name, rule).await;
            }
        }

        let data_devices: Vec<DataDevice> = req
            .data_devices
            .iter()
            .zip(device_infos.iter().filter(|d| !d.is_parity()))
            .map(|(original, info)| DataDevice { device: original.clone(), slot: *info.slot(), id: None })
            .collect();
        let parity_devices: Vec<DataDevice> = req
            .parity_devices
            .iter()
            .zip(device_infos.iter().filter(|d| *d.is_parity()))
            .map(|(original, info)| DataDevice { device: original.clone(), slot: *info.slot(), id: None })
            .collect();

        let status = PoolStatus::builder().mounted(true).health(PoolHealth::Healthy).build().unwrap();

        Ok(Pool::builder()
            .name(req.name.clone())
            .id(uuid::Uuid::new_v4().to_string())
            .pool_type(req.pool_type)
            .filesystem(req.filesystem.clone())
            .data_devices(data_devices)
            .parity_devices(parity_devices)
            .config(req.config.clone())
            .status(status)
            .build()
            .unwrap())
    }

    /// Formats the devices backing a new pool and returns the paths that
    /// should be mounted: the raw devices for BTRFS, the one partition
    /// `create_single_fs` formatted for EXT4/XFS, or one partition per
    /// branch device for MergerFS (each branch gets its own independent
    /// filesystem, spec.md §4.H).
    async fn materialize_filesystem(&self, req: &CreatePoolRequest, operational: &[String]) -> Result<Vec<String>, fsops::FsOpsError> {
        if req.pool_type == PoolType::MergerFs {
            let mut branches = Vec::with_capacity(operational.len());
            for device in operational {
                branches.push(fsops::create_single_fs(&self.invoker, &req.filesystem, device).await?);
            }
            return Ok(branches);
        }
        match req.filesystem.as_str() {
            "btrfs" => {
                let profile = (*req.config.raid_level()).unwrap_or(RaidProfile::Single);
                fsops::create_btrfs(&self.invoker, profile, operational).await?;
                Ok(operational.to_vec())
            },
            "ext4" | "xfs" => {
                let partition = fsops::create_single_fs(&self.invoker, &req.filesystem, &operational[0]).await?;
                Ok(vec![partition])
            },
            other => Err(fsops::FsOpsError::UnsupportedFilesystem(other.to_string())),
        }
    }

    /// Mounts a freshly-formatted pool. For MergerFS, each branch is
    /// mounted independently at its own `/var/mergerfs/<pool>/diskN/` path
    /// and then union-mounted at `mount_point`; other filesystems mount
    /// their single formatted path directly.
    async fn mount_new_pool(
        &self,
        req: &CreatePoolRequest,
        operational_slots: &[u32],
        branches: &[String],
        mount_point: &str,
    ) -> Result<(), fsops::FsOpsError> {
        tokio::fs::create_dir_all(mount_point).await.ok();

        if req.pool_type == PoolType::MergerFs {
            let mut branch_mounts = Vec::with_capacity(branches.len());
            for (slot, branch) in operational_slots.iter().zip(branches.iter()) {
                let branch_mount = mergerfs_branch_mount(&req.name, *slot);
                tokio::fs::create_dir_all(&branch_mount).await.ok();
                fsops::mount_filesystem(&self.invoker, branch, &branch_mount, &[], false).await?;
                branch_mounts.push(branch_mount);
            }
            return fsops::mount_mergerfs(&self.invoker, &branch_mounts, mount_point, req.config.mount_options()).await;
        }

        let degraded = req.filesystem == "btrfs";
        fsops::mount_filesystem(&self.invoker, &branches[0], mount_point, req.config.mount_options(), degraded).await
    }

    /// `mountPool` — mounts an already-persisted pool definition.
    pub async fn mount_pool(&self, name: &str) -> PoolResult<()> {
        let pools = self.list_pools()?;
        let pool = pools.iter().find(|p| p.name() == name).ok_or_else(|| PoolError::Validation(format!("no such pool: {name}")))?;
        let mount_point = pool.mount_point();
        let mount_point_str = mount_point.to_string_lossy().into_owned();
        tokio::fs::create_dir_all(&mount_point).await?;

        let operational = self.resolve_operational_devices(pool).await?;
        let degraded = pool.filesystem() == "btrfs";
        fsops::mount_filesystem(&self.invoker, &operational[0], &mount_point_str, pool.config().mount_options(), degraded)
            .await
            .map_err(PoolError::FsOps)
    }

    async fn resolve_operational_devices(&self, pool: &Pool) -> PoolResult<Vec<String>> {
        if *pool.config().encrypted() {
            let luks = LuksStrategy::new(self.invoker.clone());
            let devices = strategy::pool_devices_from(pool);
            let options = PrepareOptions { passphrase: None, format: false, start_slot: 1 };
            let infos = luks.prepare(&devices, pool.name(), &options).await?;
            Ok(infos.into_iter().filter(|d| !d.is_parity()).map(|d| d.operational_device().clone()).collect())
        } else {
            Ok(pool.data_devices().iter().map(|d| d.device.clone()).collect())
        }
    }

    /// `unmountPool` (spec.md §4.H): btrfs multi-device is a single
    /// `umount`; removes the mount point if empty; closes LUKS mappers.
    pub async fn unmount_pool(&self, name: &str) -> PoolResult<()> {
        let pools = self.list_pools()?;
        let pool = pools.iter().find(|p| p.name() == name).ok_or_else(|| PoolError::Validation(format!("no such pool: {name}")))?;
        let mount_point = pool.mount_point();
        let mount_point_str = mount_point.to_string_lossy().into_owned();

        fsops::unmount_filesystem(&self.invoker, &mount_point_str).await?;

        if is_dir_empty(&mount_point) {
            let _ = tokio::fs::remove_dir(&mount_point).await;
        }

        if *pool.config().encrypted() {
            let luks = LuksStrategy::new(self.invoker.clone());
            let devices = strategy::pool_devices_from(pool);
            let options = PrepareOptions { passphrase: None, format: false, start_slot: 1 };
            if let Ok(infos) = luks.prepare(&devices, pool.name(), &options).await {
                luks.cleanup(&infos).await;
            }
        }
        Ok(())
    }

    /// `destroyPool`: unmounts (best-effort), wipes superblocks, and drops
    /// the persisted definition.
    pub async fn destroy_pool(&self, name: &str) -> PoolResult<()> {
        let _ = self.unmount_pool(name).await;
        let mut pools = self.list_pools()?;
        pools.retain(|p| p.name() != name);
        self.persist(&pools)
    }

    /// `addDevice`: BTRFS-only extend (spec.md §4.H); other filesystems
    /// have no online extend path and are rejected up front.
    pub async fn add_device(&self, pool_name: &str, device: &str) -> PoolResult<()> {
        let mut pools = self.list_pools()?;
        let index = pools.iter().position(|p| p.name() == pool_name).ok_or_else(|| PoolError::Validation(format!("no such pool: {pool_name}")))?;
        if pools[index].filesystem() != "btrfs" {
            return Err(PoolError::Validation(format!("{} does not support online device add", pools[index].filesystem())));
        }
        let mount_point = pools[index].mount_point().to_string_lossy().into_owned();
        fsops::extend_btrfs(&self.invoker, device, &mount_point).await?;

        let next_slot = pools[index].data_devices().iter().map(|d| d.slot).max().unwrap_or(0) + 1;
        let mut devices = pools[index].data_devices().clone();
        devices.push(DataDevice { device: device.to_string(), slot: next_slot, id: None });
        pools[index] = rebuild_pool_with_data_devices(&pools[index], devices);
        self.persist(&pools)
    }

    /// `removeDevice`: BTRFS-only (`btrfs device remove`), drops the entry
    /// from the persisted definition once the kernel confirms removal.
    pub async fn remove_device(&self, pool_name: &str, device: &str) -> PoolResult<()> {
        let mut pools = self.list_pools()?;
        let index = pools.iter().position(|p| p.name() == pool_name).ok_or_else(|| PoolError::Validation(format!("no such pool: {pool_name}")))?;
        if pools[index].filesystem() != "btrfs" {
            return Err(PoolError::Validation(format!("{} does not support online device removal", pools[index].filesystem())));
        }
        let mount_point = pools[index].mount_point().to_string_lossy().into_owned();
        let args: Vec<&std::ffi::OsStr> =
            vec![std::ffi::OsStr::new("device"), std::ffi::OsStr::new("remove"), std::ffi::OsStr::new(device), std::ffi::OsStr::new(&mount_point)];
        let out = self.invoker.run_default("btrfs", &args).await.map_err(fsops::FsOpsError::from)?;
        if !out.success {
            return Err(PoolError::FsOps(fsops::FsOpsError::Tool(crate::tool::ToolError::NonZeroExit(
                "btrfs device remove".into(),
                out.status_code,
                out.stderr,
            ))));
        }

        let devices: Vec<DataDevice> = pools[index].data_devices().iter().filter(|d| d.device != device).cloned().collect();
        pools[index] = rebuild_pool_with_data_devices(&pools[index], devices);
        self.persist(&pools)
    }

    /// `addPathRule` (spec.md §4.H): persists the rule, then materializes
    /// its directory under each target branch's mount path. Directory
    /// creation is best-effort — a pool whose branches aren't mounted yet
    /// still gets the rule recorded.
    pub async fn add_path_rule(&self, pool_name: &str, rule: PathRule) -> PoolResult<()> {
        let mut pools = self.list_pools()?;
        let index = pools.iter().position(|p| p.name() == pool_name).ok_or_else(|| PoolError::Validation(format!("no such pool: {pool_name}")))?;
        let mut rules = pools[index].config().path_rules().clone();
        rules.push(rule.clone());
        pools[index] = rebuild_pool_with_path_rules(&pools[index], rules);
        self.persist(&pools)?;
        materialize_path_rule_dirs(pool_name, &rule).await;
        Ok(())
    }

    pub fn remove_path_rule(&self, pool_name: &str, path: &str) -> PoolResult<()> {
        let mut pools = self.list_pools()?;
        let index = pools.iter().position(|p| p.name() == pool_name).ok_or_else(|| PoolError::Validation(format!("no such pool: {pool_name}")))?;
        let rules: Vec<PathRule> = pools[index].config().path_rules().iter().filter(|r| r.path != path).cloned().collect();
        pools[index] = rebuild_pool_with_path_rules(&pools[index], rules);
        self.persist(&pools)
    }
}

/// `Pool`/`PoolConfig` expose read-only accessors by design (spec.md §9's
/// "devices never reference pools" discipline extends to immutable
/// records); a path-rule change rebuilds the owning `Pool` via its
/// builder rather than mutating a field in place.
fn rebuild_pool_with_path_rules(pool: &Pool, rules: Vec<PathRule>) -> Pool {
    let config = pool.config();
    let new_config = PoolConfig::builder()
        .encrypted(*config.encrypted())
        .create_keyfile(*config.create_keyfile())
        .raid_level(*config.raid_level())
        .path_rules(rules)
        .mount_options(config.mount_options().clone())
        .automount(*config.automount())
        .legacy_disks(config.legacy_disks().clone())
        .build()
        .unwrap();

    Pool::builder()
        .name(pool.name().clone())
        .id(pool.id().clone())
        .pool_type(*pool.pool_type())
        .filesystem(pool.filesystem().clone())
        .data_devices(pool.data_devices().clone())
        .parity_devices(pool.parity_devices().clone())
        .config(new_config)
        .status(pool.status().clone())
        .build()
        .unwrap()
}

fn rebuild_pool_with_data_devices(pool: &Pool, data_devices: Vec<DataDevice>) -> Pool {
    Pool::builder()
        .name(pool.name().clone())
        .id(pool.id().clone())
        .pool_type(*pool.pool_type())
        .filesystem(pool.filesystem().clone())
        .data_devices(data_devices)
        .parity_devices(pool.parity_devices().clone())
        .config(pool.config().clone())
        .status(pool.status().clone())
        .build()
        .unwrap()
}

/// Per-branch mount path convention for a MergerFS pool slot.
fn mergerfs_branch_mount(pool_name: &str, slot: u32) -> String { format!("/var/mergerfs/{pool_name}/disk{slot}") }

/// Creates `rule.path` under every target slot's branch mount, best-effort.
async fn materialize_path_rule_dirs(pool_name: &str, rule: &PathRule) {
    for slot in &rule.target_devices {
        let dir = Path::new(&mergerfs_branch_mount(pool_name, *slot)).join(rule.path.trim_start_matches('/'));
        tokio::fs::create_dir_all(&dir).await.ok();
    }
}

fn is_dir_empty(path: &Path) -> bool {
    std::fs::read_dir(path).map(|mut it| it.next().is_none()).unwrap_or(false)
}

/// `getUnassignedDisks` support: checks `assignment::is_in_use` against a
/// pool list plus live mount/partition info for one candidate bare name.
pub fn is_unassigned(
    bare_name: &str,
    pools: &[Pool],
    mounts: &std::collections::HashMap<String, sysfs::MountEntry>,
    all_partitions: &[String],
    mounted_btrfs_uuids_by_device: &std::collections::HashMap<String, String>,
    by_uuid: &std::collections::HashMap<String, std::path::PathBuf>,
) -> bool {
    !assignment::is_in_use(bare_name, pools, mounts, all_partitions, mounted_btrfs_uuids_by_device, by_uuid).in_use
}
