//! Assignment Graph (spec.md §4.F): given a candidate device, answers "is
//! it in use?" by walking pool membership (by path, filesystem UUID, and
//! device-mapper resolution), the mount table, BTRFS multi-device
//! membership, and legacy config shapes. Short-circuits on first hit.
//!
//! Grounded in the multi-source matching style of
//! `zpool::description::Zpool::from_pest_pair` (several independent field
//! sources folded into one record) generalized to several independent
//! *sources of truth* folded into one in-use decision.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::pool::description::Pool;
use crate::sysfs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InUseReason {
    InPoolData,
    InPoolDataViaMapper,
    InPoolParity,
    InPoolParityViaMapper,
    InPoolLegacy,
    MountedWholeDisk,
    MountedPartition,
    MountedViaMapper,
    MountedPartitionViaMapper,
    BtrfsMultiDevice,
}

#[derive(Debug, Clone)]
pub struct InUseResult {
    pub in_use: bool,
    pub reason: Option<InUseReason>,
    pub mapper_device: Option<String>,
    pub physical_device: String,
}

impl InUseResult {
    fn not_in_use(device: &str) -> Self {
        InUseResult { in_use: false, reason: None, mapper_device: None, physical_device: device.to_string() }
    }

    fn hit(device: &str, reason: InUseReason, mapper: Option<String>) -> Self {
        InUseResult { in_use: true, reason: Some(reason), mapper_device: mapper, physical_device: device.to_string() }
    }
}

/// Partitions of `device` per the base-disk rule, given the set of known
/// partition bare-names across the system (callers typically pass in the
/// lsblk-derived partition list).
fn partitions_of<'a>(device_bare: &str, all_partitions: &'a [String]) -> Vec<&'a str> {
    all_partitions.iter().filter(|p| crate::util::base_disk(p) == device_bare).map(|s| s.as_str()).collect()
}

/// Resolve a mounted mapper device's ultimate backing devices by walking
/// `/sys/block/<dmX>/slaves/*` (spec.md §4.F 1c / 5).
fn mapper_backs(device_bare: &str, mapper_name: &str, all_partitions: &[String]) -> bool {
    let slaves = sysfs::resolve_dm_slaves(mapper_name);
    slaves.iter().any(|s| s == device_bare) || {
        let parts = partitions_of(device_bare, all_partitions);
        slaves.iter().any(|s| parts.contains(&s.as_str()))
    }
}

/// Resolve a pool device's recorded filesystem UUID (`DataDevice.id`/
/// `ParityDevice.id`) against the live `/dev/disk/by-uuid/` map (spec.md
/// §4.F step 1b), catching membership that survived a `/dev/sdX`
/// renumbering that broke the direct path match.
fn uuid_resolves_to_device(uuid: &str, by_uuid: &HashMap<String, PathBuf>, bare: &str, parts: &[&str]) -> bool {
    let Some(real) = by_uuid.get(uuid) else { return false };
    let Some(real_name) = real.file_name().and_then(|n| n.to_str()) else { return false };
    real_name == bare || parts.contains(&real_name)
}

/// `isInUse(device)` per spec.md §4.F. `device` is a bare name (`sdb`) or
/// `/dev/`-prefixed path; `all_partitions` lists every known partition bare
/// name in the system (as produced by the disk inventory), needed to
/// resolve "any of its partitions" checks without re-probing the kernel.
/// `by_uuid` is the `/dev/disk/by-uuid/` symlink map (`sysfs::read_by_uuid`).
pub fn is_in_use(
    device: &str,
    pools: &[Pool],
    mounts: &HashMap<String, sysfs::MountEntry>,
    all_partitions: &[String],
    mounted_btrfs_uuids_by_device: &HashMap<String, String>,
    by_uuid: &HashMap<String, PathBuf>,
) -> InUseResult {
    let bare = device.trim_start_matches("/dev/");
    let dev_path = format!("/dev/{bare}");
    let parts = partitions_of(bare, all_partitions);

    // 1a/1b/1c + 2: pool data/parity membership.
    for pool in pools {
        for dd in pool.data_devices() {
            if direct_or_partition_match(&dd.device, bare, &parts) {
                return InUseResult::hit(device, InUseReason::InPoolData, None);
            }
            if dd.id.as_deref().is_some_and(|id| uuid_resolves_to_device(id, by_uuid, bare, &parts)) {
                return InUseResult::hit(device, InUseReason::InPoolData, None);
            }
            if is_mapper_path(&dd.device) {
                let mapper_name = mapper_basename(&dd.device);
                if mapper_backs(bare, &mapper_name, all_partitions) {
                    return InUseResult::hit(device, InUseReason::InPoolDataViaMapper, Some(dd.device.clone()));
                }
            }
        }
        for pd in pool.parity_devices() {
            if direct_or_partition_match(&pd.device, bare, &parts) {
                return InUseResult::hit(device, InUseReason::InPoolParity, None);
            }
            if pd.id.as_deref().is_some_and(|id| uuid_resolves_to_device(id, by_uuid, bare, &parts)) {
                return InUseResult::hit(device, InUseReason::InPoolParity, None);
            }
            if is_mapper_path(&pd.device) {
                let mapper_name = mapper_basename(&pd.device);
                if mapper_backs(bare, &mapper_name, all_partitions) {
                    return InUseResult::hit(device, InUseReason::InPoolParityViaMapper, Some(pd.device.clone()));
                }
            }
        }
        for legacy in pool.config().legacy_disks() {
            if direct_or_partition_match(legacy, bare, &parts) {
                return InUseResult::hit(device, InUseReason::InPoolLegacy, None);
            }
        }
    }

    // 3: direct mount of the whole disk.
    if mounts.contains_key(&dev_path) {
        return InUseResult::hit(device, InUseReason::MountedWholeDisk, None);
    }

    // 4: mount of any partition.
    for p in &parts {
        if mounts.contains_key(&format!("/dev/{p}")) {
            return InUseResult::hit(device, InUseReason::MountedPartition, None);
        }
    }

    // 5: mount via mapper.
    for (mount_dev, _entry) in mounts.iter() {
        if is_mapper_path(mount_dev) {
            let mapper_name = mapper_basename(mount_dev);
            if sysfs::resolve_dm_slaves(&mapper_name).iter().any(|s| s == bare) {
                return InUseResult::hit(device, InUseReason::MountedViaMapper, Some(mount_dev.clone()));
            }
            if parts.iter().any(|p| sysfs::resolve_dm_slaves(&mapper_name).iter().any(|s| s == p)) {
                return InUseResult::hit(device, InUseReason::MountedPartitionViaMapper, Some(mount_dev.clone()));
            }
        }
    }

    // 6: btrfs multi-device, mounted sibling shares the filesystem UUID.
    if let Some(uuid) = mounted_btrfs_uuids_by_device.get(bare) {
        let shares_uuid = mounted_btrfs_uuids_by_device
            .iter()
            .any(|(other, other_uuid)| other != bare && other_uuid == uuid);
        if shares_uuid {
            return InUseResult::hit(device, InUseReason::BtrfsMultiDevice, None);
        }
    }

    InUseResult::not_in_use(device)
}

fn direct_or_partition_match(configured: &str, bare: &str, parts: &[&str]) -> bool {
    let configured_bare = configured.trim_start_matches("/dev/");
    configured_bare == bare || parts.contains(&configured_bare)
}

fn is_mapper_path(path: &str) -> bool { path.starts_with("/dev/mapper/") }

fn mapper_basename(path: &str) -> String { path.trim_start_matches("/dev/mapper/").to_string() }

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::description::{DataDevice, Pool, PoolConfig, PoolType};

    fn pool_with_data(devices: &[&str]) -> Pool {
        let config = PoolConfig::builder().encrypted(false).create_keyfile(false).build().unwrap();
        Pool::builder()
            .name("tank")
            .id("id-1")
            .pool_type(PoolType::Single)
            .filesystem("btrfs")
            .data_devices(devices.iter().map(|d| DataDevice { device: d.to_string(), slot: 1, id: None }).collect::<Vec<_>>())
            .parity_devices(vec![])
            .config(config)
            .build()
            .unwrap()
    }

    #[test]
    fn not_in_use_when_no_source_matches() {
        let result = is_in_use("/dev/sde", &[], &HashMap::new(), &[], &HashMap::new(), &HashMap::new());
        assert!(!result.in_use);
    }

    #[test]
    fn direct_pool_membership_hit() {
        let pools = vec![pool_with_data(&["/dev/sdb"])];
        let result = is_in_use("/dev/sdb", &pools, &HashMap::new(), &[], &HashMap::new(), &HashMap::new());
        assert!(result.in_use);
        assert_eq!(result.reason, Some(InUseReason::InPoolData));
    }

    #[test]
    fn uuid_pool_membership_hit_after_renumbering() {
        let config = PoolConfig::builder().encrypted(false).create_keyfile(false).build().unwrap();
        let pool = Pool::builder()
            .name("tank")
            .id("id-1")
            .pool_type(PoolType::Single)
            .filesystem("btrfs")
            .data_devices(vec![DataDevice { device: "/dev/sdb".to_string(), slot: 1, id: Some("uuid-1".to_string()) }])
            .parity_devices(vec![])
            .config(config)
            .build()
            .unwrap();
        // The pool's configured path (`/dev/sdb`) no longer matches the
        // queried device (`/dev/sdc`) after a renumbering; only the
        // filesystem-UUID map still resolves it.
        let mut by_uuid = HashMap::new();
        by_uuid.insert("uuid-1".to_string(), PathBuf::from("/dev/sdc"));
        let result = is_in_use("/dev/sdc", &[pool], &HashMap::new(), &[], &HashMap::new(), &by_uuid);
        assert!(result.in_use);
        assert_eq!(result.reason, Some(InUseReason::InPoolData));
    }

    #[test]
    fn mounted_whole_disk_hit() {
        let mut mounts = HashMap::new();
        mounts.insert("/dev/sdc".to_string(), sysfs::MountEntry { mountpoint: "/mnt/x".into(), fstype: "ext4".into() });
        let result = is_in_use("/dev/sdc", &[], &mounts, &[], &HashMap::new(), &HashMap::new());
        assert_eq!(result.reason, Some(InUseReason::MountedWholeDisk));
    }

    #[test]
    fn mounted_partition_hit() {
        let mut mounts = HashMap::new();
        mounts.insert("/dev/sdd1".to_string(), sysfs::MountEntry { mountpoint: "/".into(), fstype: "ext4".into() });
        let parts = vec!["sdd1".to_string()];
        let result = is_in_use("/dev/sdd", &[], &mounts, &parts, &HashMap::new(), &HashMap::new());
        assert_eq!(result.reason, Some(InUseReason::MountedPartition));
    }

    #[test]
    fn btrfs_multi_device_hit_only_when_sibling_mounted() {
        let mut uuids = HashMap::new();
        uuids.insert("sde".to_string(), "uuid-1".to_string());
        uuids.insert("sdf".to_string(), "uuid-1".to_string());
        let result = is_in_use("/dev/sde", &[], &HashMap::new(), &[], &uuids, &HashMap::new());
        assert_eq!(result.reason, Some(InUseReason::BtrfsMultiDevice));
    }
}
