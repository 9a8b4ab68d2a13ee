//! `ZramDevice` data model (spec.md §3). `id` and `uuid` (for ramdisks)
//! are immutable once assigned; duplicate indices are rejected by the
//! reconciler before any kernel state changes.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZramDeviceType {
    Swap,
    Ramdisk,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ZramDeviceConfig {
    pub priority: Option<i32>,
    pub uuid: Option<String>,
    pub filesystem: Option<String>,
}

#[derive(Debug, Clone, Getters, Builder, Serialize, Deserialize, PartialEq)]
#[builder(setter(into))]
#[get = "pub"]
pub struct ZramDevice {
    id: String,
    name: String,
    index: u32,
    #[builder(default = "true")]
    enabled: bool,
    #[builder(default = "ZramDeviceType::Swap")]
    device_type: ZramDeviceType,
    algorithm: String,
    /// Size in bytes.
    size: u64,
    #[builder(default)]
    config: ZramDeviceConfig,
}

impl ZramDevice {
    pub fn builder() -> ZramDeviceBuilder { ZramDeviceBuilder::default() }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ZramConfig {
    pub enabled: bool,
    pub devices: Vec<ZramDevice>,
}

impl ZramConfig {
    /// Invariant validation before any reconcile runs: unique indices,
    /// uuid/id immutability is enforced by the reconciler comparing
    /// against the previous persisted config, not here.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.index()) {
                return Err(format!("duplicate zram index {}", device.index()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_duplicate_indices() {
        let make = |id: &str, index: u32| {
            ZramDevice::builder().id(id).name(id).index(index).algorithm("zstd").size(1_073_741_824u64).build().unwrap()
        };
        let config = ZramConfig { enabled: true, devices: vec![make("a", 0), make("b", 0)] };
        assert!(config.validate().is_err());
    }

    #[test]
    fn accepts_unique_indices() {
        let make = |id: &str, index: u32| {
            ZramDevice::builder().id(id).name(id).index(index).algorithm("zstd").size(1_073_741_824u64).build().unwrap()
        };
        let config = ZramConfig { enabled: true, devices: vec![make("a", 0), make("b", 1)] };
        assert!(config.validate().is_ok());
    }
}
