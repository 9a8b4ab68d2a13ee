//! Data model for spec.md §3: `PhysicalDevice`, `Partition`, and the device
//! `class` enum. Every struct exposes `getset`-style read accessors and a
//! `derive_builder` builder, mirroring `zpool::vdev::{Disk, Vdev}` and
//! `zpool::description::Zpool`.

use std::path::PathBuf;

use crate::power::PowerStatus;
use crate::sysfs::UsbInfo;
use crate::throughput::ThroughputSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotational {
    Rotational,
    SolidState,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Hdd,
    Ssd,
    Nvme,
    Emmc,
    Usb,
    Md,
    Ramdisk,
    Unknown,
}

#[derive(Debug, Clone, Getters, Builder)]
#[builder(setter(into))]
#[get = "pub"]
pub struct Partition {
    device: String,
    /// 1-based partition index.
    index: u32,
    size: u64,
    #[builder(default)]
    label: Option<String>,
    #[builder(default)]
    fs_uuid: Option<String>,
    #[builder(default)]
    fs_type: Option<String>,
    #[builder(default)]
    mount_point: Option<String>,
    #[builder(default = "false")]
    is_whole_disk: bool,
}

impl Partition {
    pub fn builder() -> PartitionBuilder { PartitionBuilder::default() }

    /// spec.md §3 invariant: a partition's base disk is deducible from its
    /// own device path alone.
    pub fn base_disk_name(&self) -> String {
        let bare = self.device.trim_start_matches("/dev/");
        crate::util::base_disk(bare)
    }
}

#[derive(Debug, Clone, Getters, Builder)]
#[builder(setter(into))]
#[get = "pub"]
pub struct PhysicalDevice {
    path: String,
    #[builder(default)]
    model: Option<String>,
    #[builder(default)]
    serial: Option<String>,
    size: u64,
    #[builder(default = "Rotational::Unknown")]
    rotational: Rotational,
    #[builder(default = "false")]
    removable: bool,
    #[builder(default)]
    transport: Option<String>,
    #[builder(default)]
    usb_info: Option<UsbInfo>,
    class: DeviceClass,
    #[builder(default)]
    partitions: Vec<Partition>,
    #[builder(default = "PowerStatus::Unknown")]
    power_status: PowerStatus,
    #[builder(default)]
    temperature: Option<f64>,
    #[builder(default)]
    throughput: Option<ThroughputSample>,
    #[builder(default = "false")]
    standby_skipped: bool,
}

impl PhysicalDevice {
    pub fn builder() -> PhysicalDeviceBuilder { PhysicalDeviceBuilder::default() }

    pub fn bare_name(&self) -> &str { self.path.trim_start_matches("/dev/") }
}

/// Classify a device by its bare kernel name, per spec.md §3's class
/// derivation (this is the syntactic part; rotational/usb refine ambiguous
/// cases between hdd/ssd/usb in the inventory pipeline).
pub fn classify(bare_name: &str) -> DeviceClass {
    if bare_name.starts_with("nvme") {
        DeviceClass::Nvme
    } else if bare_name.starts_with("mmcblk") {
        DeviceClass::Emmc
    } else if bare_name.starts_with("md") {
        DeviceClass::Md
    } else if bare_name.starts_with("zram") {
        DeviceClass::Ramdisk
    } else if bare_name.starts_with("sd") {
        DeviceClass::Hdd // refined to Ssd/Usb by the inventory pipeline
    } else {
        DeviceClass::Unknown
    }
}

pub fn path_for(bare_name: &str) -> PathBuf { PathBuf::from(format!("/dev/{bare_name}")) }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_base_disk_matches_util() {
        let p = Partition::builder().device("/dev/sda1").index(1u32).size(1024u64).build().unwrap();
        assert_eq!(p.base_disk_name(), "sda");
    }

    #[test]
    fn classify_recognizes_known_prefixes() {
        assert_eq!(classify("nvme0n1"), DeviceClass::Nvme);
        assert_eq!(classify("mmcblk0"), DeviceClass::Emmc);
        assert_eq!(classify("md0"), DeviceClass::Md);
        assert_eq!(classify("zram0"), DeviceClass::Ramdisk);
    }
}
