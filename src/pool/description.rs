//! Pool data model (spec.md §3): `Pool`, `PoolConfig`, `PathRule`, device
//! records. Grounded in `zpool::description::Zpool` / `zpool::vdev::Disk`
//! (Getters + Builder, `Option<T>` for fields that only appear in certain
//! states) and `zpool::properties::Health` for the status enum shape.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const RESERVED_POOL_NAME: &str = "remotes";
pub const RESERVED_MOUNT_PREFIXES: &[&str] = &["/mnt/system", "/mnt/remotes"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolType {
    Single,
    MultiBtrfs,
    MultiZfs,
    MergerFs,
    Nonraid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaidProfile {
    Single,
    Raid0,
    Raid1,
    Raid10,
}

impl RaidProfile {
    pub fn min_devices(self) -> usize {
        match self {
            RaidProfile::Single => 1,
            RaidProfile::Raid0 => 2,
            RaidProfile::Raid1 => 2,
            RaidProfile::Raid10 => 4,
        }
    }

    pub fn as_btrfs_arg(self) -> &'static str {
        match self {
            RaidProfile::Single => "single",
            RaidProfile::Raid0 => "raid0",
            RaidProfile::Raid1 => "raid1",
            RaidProfile::Raid10 => "raid10",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolHealth {
    Healthy,
    Degraded,
    Missing,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataDevice {
    pub device: String,
    pub slot: u32,
    /// Filesystem UUID of the encrypted container for LUKS, of the
    /// filesystem otherwise (spec.md §6 config-write invariant).
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRule {
    pub path: String,
    pub target_devices: Vec<u32>,
}

#[derive(Debug, Clone, Getters, Builder, Serialize, Deserialize)]
#[builder(setter(into))]
#[get = "pub"]
pub struct PoolConfig {
    #[builder(default = "false")]
    encrypted: bool,
    #[builder(default = "false")]
    create_keyfile: bool,
    #[builder(default)]
    raid_level: Option<RaidProfile>,
    #[builder(default)]
    path_rules: Vec<PathRule>,
    #[builder(default)]
    mount_options: Vec<String>,
    #[builder(default = "true")]
    automount: bool,
    /// Legacy `disks` array carried forward from older configs (spec.md §4.F
    /// check 2).
    #[builder(default)]
    legacy_disks: Vec<String>,
}

impl PoolConfig {
    pub fn builder() -> PoolConfigBuilder { PoolConfigBuilder::default() }
}

#[derive(Debug, Clone, Getters, Builder, Serialize, Deserialize)]
#[builder(setter(into))]
#[get = "pub"]
pub struct PoolStatus {
    #[builder(default = "false")]
    mounted: bool,
    #[builder(default = "0")]
    total_space: u64,
    #[builder(default = "0")]
    free_space: u64,
    #[builder(default = "0")]
    used_space: u64,
    #[builder(default = "PoolHealth::Unknown")]
    health: PoolHealth,
}

impl PoolStatus {
    pub fn builder() -> PoolStatusBuilder { PoolStatusBuilder::default() }
}

impl Default for PoolStatus {
    fn default() -> Self { PoolStatus::builder().build().unwrap() }
}

#[derive(Debug, Clone, Getters, Builder, Serialize, Deserialize)]
#[builder(setter(into))]
#[get = "pub"]
pub struct Pool {
    name: String,
    id: String,
    pool_type: PoolType,
    filesystem: String,
    data_devices: Vec<DataDevice>,
    #[builder(default)]
    parity_devices: Vec<DataDevice>,
    config: PoolConfig,
    #[builder(default)]
    status: PoolStatus,
}

impl Pool {
    pub fn builder() -> PoolBuilder { PoolBuilder::default() }

    pub fn mount_point(&self) -> PathBuf { PathBuf::from(format!("/mnt/{}", self.name)) }

    /// spec.md §3 name invariant: `[A-Za-z0-9_-]{1,255}`, not the reserved
    /// name, and not colliding with a reserved mount prefix.
    pub fn validate_name(name: &str) -> Result<(), String> {
        if name.is_empty() || name.len() > 255 {
            return Err(format!("pool name must be 1-255 chars, got {}", name.len()));
        }
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(format!("pool name {name} contains invalid characters"));
        }
        if name == RESERVED_POOL_NAME {
            return Err(format!("pool name {RESERVED_POOL_NAME} is reserved"));
        }
        let mount = format!("/mnt/{name}");
        if RESERVED_MOUNT_PREFIXES.iter().any(|p| mount.starts_with(p)) {
            return Err(format!("pool name {name} collides with a reserved mount prefix"));
        }
        Ok(())
    }
}
