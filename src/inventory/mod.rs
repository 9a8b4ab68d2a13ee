//! Disk Inventory (spec.md §4.D): `listDisks`/`getUnassignedDisks`.
//! Enumerates physical disks, fans out power-state probes concurrently,
//! and fills partition/mount/throughput detail for every disk that isn't
//! asleep. `getUnassignedDisks` additionally excludes ZFS vdev members
//! (`zpool status -P`) and bcache backing/cache devices, on top of the
//! mosctl pool/mount/btrfs checks in `assignment::is_in_use`. Sits atop the
//! Sysfs/Proc Reader, Tool Invoker, Power-State Oracle, and Throughput
//! Sampler.
//!
//! Grounded in `Zpool::from_pest_pair`'s aggregation style
//! (several independently-sourced fields folded into one record) and in
//! spec.md §5's explicit fan-out model ("launches one power-state probe
//! per device concurrently"), implemented with `futures::future::join_all`.

pub mod device;

use std::collections::HashMap;
use std::ffi::OsStr;

use serde::Deserialize;

use crate::inventory::device::{self as dev, DeviceClass, PhysicalDevice, Rotational};
use crate::pool::description::Pool;
use crate::power::{PowerOracle, PowerStatus};
use crate::sysfs;
use crate::throughput::ThroughputSampler;
use crate::tool::ToolInvoker;

quick_error! {
    #[derive(Debug)]
    pub enum InventoryError {
        Tool(err: crate::tool::ToolError) {
            display("{}", err)
            from()
        }
        Parse(message: String) {
            display("failed to parse tool output: {}", message)
        }
    }
}

pub type InventoryResult<T> = Result<T, InventoryError>;

#[derive(Debug, Default, Clone, Copy)]
pub struct ListDisksOptions {
    pub skip_standby: bool,
}

fn is_eligible_name(name: &str) -> bool {
    if name.starts_with("loop") || name.starts_with("ram") || name.starts_with("dm-") || name.starts_with("sr")
        || name.starts_with("nbd") || name.starts_with("nmd")
    {
        return false;
    }
    name.starts_with("sd") || name.starts_with("nvme") || name.starts_with("mmc") || name.starts_with("md")
}

/// Enumerate candidate physical disk names from `/dev/disk/by-diskseq/`,
/// filtered per spec.md §4.D step 1.
pub fn enumerate_candidate_disks() -> Vec<String> { enumerate_candidate_disks_from("/dev/disk/by-diskseq") }

fn enumerate_candidate_disks_from(dir: &str) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else { return Vec::new() };
    let mut names: Vec<String> = entries
        .flatten()
        .filter_map(|e| std::fs::canonicalize(e.path()).ok())
        .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .filter(|name| is_eligible_name(name))
        .collect();
    names.sort();
    names.dedup();
    names
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    size: Option<String>,
    fstype: Option<String>,
    mountpoint: Option<String>,
    uuid: Option<String>,
    label: Option<String>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

pub struct DiskInventory<I: ToolInvoker> {
    invoker: I,
    oracle: PowerOracle<I>,
}

impl<I: ToolInvoker + Clone> DiskInventory<I> {
    pub fn new(invoker: I) -> Self {
        let oracle = PowerOracle::new(invoker.clone());
        DiskInventory { invoker, oracle }
    }

    /// `listDisks(opts)` (spec.md §4.D).
    pub async fn list_disks(&self, opts: ListDisksOptions, sampler: &ThroughputSampler) -> InventoryResult<Vec<PhysicalDevice>> {
        let names = enumerate_candidate_disks();

        let power_states: Vec<PowerStatus> =
            futures::future::join_all(names.iter().map(|n| self.oracle.get_power_state(n))).await;

        let mut result = Vec::with_capacity(names.len());
        for (name, power) in names.into_iter().zip(power_states) {
            let device = if power == PowerStatus::Standby && opts.skip_standby {
                self.skeleton_record(&name, power)
            } else {
                self.full_record(&name, power, sampler).await?
            };
            result.push(device);
        }

        result.extend(self.zram_ramdisk_entries().await);
        Ok(result)
    }

    fn skeleton_record(&self, name: &str, power: PowerStatus) -> PhysicalDevice {
        PhysicalDevice::builder()
            .path(dev::path_for(name).to_string_lossy().into_owned())
            .class(dev::classify(name))
            .power_status(power)
            .standby_skipped(true)
            .size(0u64)
            .build()
            .unwrap()
    }

    async fn full_record(&self, name: &str, power: PowerStatus, sampler: &ThroughputSampler) -> InventoryResult<PhysicalDevice> {
        let rotational = match sysfs::read_rotational(name) {
            Some(true) => Rotational::Rotational,
            Some(false) => Rotational::SolidState,
            None => Rotational::Unknown,
        };
        let removable = sysfs::read_removable(name);
        let usb_info = sysfs::read_usb_info(name);
        let transport = Some(sysfs::read_transport(name));

        let mut class = dev::classify(name);
        if class == DeviceClass::Hdd {
            if usb_info.is_some() {
                class = DeviceClass::Usb;
            } else if rotational == Rotational::SolidState {
                class = DeviceClass::Ssd;
            }
        }

        let temperature = self.oracle.get_temperature(name).await.unwrap_or(None);
        let throughput = sampler.get(name);

        let (size, model, serial, partitions) = self.lsblk_detail(name).await?;

        Ok(PhysicalDevice::builder()
            .path(dev::path_for(name).to_string_lossy().into_owned())
            .model(model)
            .serial(serial)
            .size(size)
            .rotational(rotational)
            .removable(removable)
            .transport(transport)
            .usb_info(usb_info)
            .class(class)
            .partitions(partitions)
            .power_status(power)
            .temperature(temperature)
            .throughput(throughput)
            .standby_skipped(false)
            .build()
            .unwrap())
    }

    async fn lsblk_detail(&self, name: &str) -> InventoryResult<(u64, Option<String>, Option<String>, Vec<dev::Partition>)> {
        let dev_path = format!("/dev/{name}");
        let args: Vec<&OsStr> = vec![
            OsStr::new("-J"),
            OsStr::new("-b"),
            OsStr::new("-o"),
            OsStr::new("NAME,SIZE,FSTYPE,MOUNTPOINT,UUID,LABEL,MODEL,SERIAL"),
            OsStr::new(&dev_path),
        ];
        let out = self.invoker.run_default("lsblk", &args).await?;
        if !out.success {
            return Ok((0, None, None, Vec::new()));
        }
        let parsed: LsblkOutput =
            serde_json::from_str(&out.stdout).map_err(|e| InventoryError::Parse(e.to_string()))?;
        let Some(root) = parsed.blockdevices.into_iter().next() else { return Ok((0, None, None, Vec::new())) };

        let size = root.size.as_deref().and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);
        let partitions = root
            .children
            .iter()
            .enumerate()
            .map(|(i, child)| {
                dev::Partition::builder()
                    .device(format!("/dev/{}", child.name))
                    .index((i + 1) as u32)
                    .size(child.size.as_deref().and_then(|s| s.parse::<u64>().ok()).unwrap_or(0))
                    .label(child.label.clone())
                    .fs_uuid(child.uuid.clone())
                    .fs_type(child.fstype.clone())
                    .mount_point(child.mountpoint.clone())
                    .build()
                    .unwrap()
            })
            .collect();

        Ok((size, None, None, partitions))
    }

    /// Append synthetic entries for ZRAM ramdisks (not swap devices),
    /// per spec.md §4.D step 4.
    async fn zram_ramdisk_entries(&self) -> Vec<PhysicalDevice> {
        let swaps = sysfs::read_swaps();
        let Ok(entries) = std::fs::read_dir("/sys/block") else { return Vec::new() };
        entries
            .flatten()
            .filter_map(|e| e.file_name().to_str().map(|s| s.to_string()))
            .filter(|name| name.starts_with("zram"))
            .filter(|name| !swaps.contains(&format!("/dev/{name}")))
            .map(|name| {
                PhysicalDevice::builder()
                    .path(format!("/dev/{name}"))
                    .class(DeviceClass::Ramdisk)
                    .power_status(PowerStatus::Active)
                    .size(0u64)
                    .build()
                    .unwrap()
            })
            .collect()
    }

    /// Devices reported as members of any imported ZFS pool, keyed by bare
    /// device name (spec.md §4.D: `zpool status -P` membership blocks a
    /// vdev from ever showing up as unassigned). Swallows tool failure the
    /// way the rest of this probe stack treats unreadable state as "none".
    async fn zfs_member_devices(&self) -> std::collections::HashSet<String> {
        let mut set = std::collections::HashSet::new();
        let args: Vec<&OsStr> = vec![OsStr::new("status"), OsStr::new("-P")];
        let Ok(out) = self.invoker.run_default("zpool", &args).await else { return set };
        if !out.success {
            return set;
        }
        for line in out.stdout.lines() {
            if let Some(first) = line.trim().split_whitespace().next() {
                if let Some(bare) = first.strip_prefix("/dev/") {
                    set.insert(bare.to_string());
                }
            }
        }
        set
    }

    /// `getUnassignedDisks(opts)` (spec.md §4.D). The *boot* disk only
    /// surfaces partitions numbered >= 3 (first two reserved for EFI/root).
    pub async fn get_unassigned_disks(
        &self,
        opts: ListDisksOptions,
        sampler: &ThroughputSampler,
        pools: &[Pool],
        boot_disk: Option<&str>,
    ) -> InventoryResult<Vec<PhysicalDevice>> {
        let disks = self.list_disks(opts, sampler).await?;
        let mounts = sysfs::read_mounts();
        let swaps = sysfs::read_swaps();
        let by_uuid = sysfs::read_by_uuid();
        let zfs_members = self.zfs_member_devices().await;

        let all_partitions: Vec<String> =
            disks.iter().flat_map(|d| d.partitions().iter().map(|p| p.device().trim_start_matches("/dev/").to_string())).collect();

        let mounted_btrfs_uuids: HashMap<String, String> = disks
            .iter()
            .filter(|d| *d.class() != DeviceClass::Ramdisk)
            .flat_map(|d| d.partitions().iter())
            .filter(|p| p.fs_type().as_deref() == Some("btrfs") && p.mount_point().is_some())
            .filter_map(|p| p.fs_uuid().clone().map(|uuid| (p.device().trim_start_matches("/dev/").to_string(), uuid)))
            .collect();

        let mut unassigned = Vec::new();
        for disk in &disks {
            if *disk.class() == DeviceClass::Ramdisk {
                continue;
            }
            let bare = disk.bare_name();
            let is_boot = boot_disk.map(|b| b == bare).unwrap_or(false);

            if disk.partitions().is_empty() {
                if crate::pool::is_unassigned(bare, pools, &mounts, &all_partitions, &mounted_btrfs_uuids, &by_uuid)
                    && !swaps.contains(&format!("/dev/{bare}"))
                    && !zfs_members.contains(bare)
                    && !sysfs::has_bcache_role(bare)
                {
                    unassigned.push(disk.clone());
                }
                continue;
            }

            for partition in disk.partitions() {
                if is_boot && *partition.index() < 3 {
                    continue;
                }
                let part_bare = partition.device().trim_start_matches("/dev/");
                if swaps.contains(&format!("/dev/{part_bare}")) {
                    continue;
                }
                if zfs_members.contains(part_bare) || sysfs::has_bcache_role(part_bare) {
                    continue;
                }
                if crate::pool::is_unassigned(part_bare, pools, &mounts, &all_partitions, &mounted_btrfs_uuids, &by_uuid) {
                    let mut synthetic = disk.clone();
                    let clone_partitions = vec![partition.clone()];
                    synthetic = PhysicalDevice::builder()
                        .path(partition.device().clone())
                        .model(synthetic.model().clone())
                        .serial(synthetic.serial().clone())
                        .size(*partition.size())
                        .rotational(*synthetic.rotational())
                        .removable(*synthetic.removable())
                        .transport(synthetic.transport().clone())
                        .usb_info(synthetic.usb_info().clone())
                        .class(*synthetic.class())
                        .partitions(clone_partitions)
                        .power_status(*synthetic.power_status())
                        .temperature(*synthetic.temperature())
                        .throughput(*synthetic.throughput())
                        .standby_skipped(*synthetic.standby_skipped())
                        .build()
                        .unwrap();
                    unassigned.push(synthetic);
                }
            }
        }
        Ok(unassigned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eligible_names_accept_expected_prefixes_and_reject_virtual() {
        assert!(is_eligible_name("sda"));
        assert!(is_eligible_name("nvme0n1"));
        assert!(is_eligible_name("mmcblk0"));
        assert!(is_eligible_name("md0"));
        assert!(!is_eligible_name("loop0"));
        assert!(!is_eligible_name("dm-0"));
        assert!(!is_eligible_name("nmd0"));
        assert!(!is_eligible_name("sr0"));
    }
}
