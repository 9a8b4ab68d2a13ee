//! Sysfs/Proc Reader (spec.md §4.A): pure-read probes of `/sys/block/*`,
//! `/proc/diskstats`, `/proc/mounts`, `/proc/swaps`, and `/dev/disk/by-*/`
//! symlinks. Never issues I/O to a device; non-existent paths yield
//! "unknown" rather than an error.
//!
//! Grounded in `other_examples/860b1ce4_..._lsblk.rs.rs` (serde-based
//! parsing of structured kernel-adjacent output) and
//! `other_examples/05dcd1de_soerenmeier-linux-info__src-storage.rs.rs`
//! (direct `/proc`/`/sys` reads with graceful missing-file handling).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

const SYS_BLOCK: &str = "/sys/block";
const PROC_DISKSTATS: &str = "/proc/diskstats";
const PROC_MOUNTS: &str = "/proc/mounts";
const PROC_SWAPS: &str = "/proc/swaps";
const DEV_BY_UUID: &str = "/dev/disk/by-uuid";

/// USB transport details, populated only when the device's `device` symlink
/// resolves through a USB host chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbInfo {
    pub vendor_id: String,
    pub product_id: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub speed: Option<String>,
}

/// Raw diskstats counters for one device (fields 3/7 of `/proc/diskstats`:
/// sectors read/written; converted to bytes by the throughput sampler).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub sectors_read: u64,
    pub sectors_written: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mountpoint: String,
    pub fstype: String,
}

/// Read `/sys/block/<dev>/queue/rotational`. `None` if unreadable.
pub fn read_rotational(dev: &str) -> Option<bool> {
    let path = format!("{SYS_BLOCK}/{dev}/queue/rotational");
    std::fs::read_to_string(path).ok().and_then(|s| match s.trim() {
        "0" => Some(false),
        "1" => Some(true),
        _ => None,
    })
}

/// Read `/sys/block/<dev>/removable`. Defaults to `false` when unreadable —
/// matching the pure-function contract ("unknown rather than errors")
/// collapsed to the safer default for a boolean flag.
pub fn read_removable(dev: &str) -> bool {
    let path = format!("{SYS_BLOCK}/{dev}/removable");
    std::fs::read_to_string(path).ok().and_then(|s| s.trim().parse::<u8>().ok()).map(|v| v == 1).unwrap_or(false)
}

/// Follow `/sys/block/<dev>/device` and look for a USB path fragment
/// (`/usb` segment in the resolved realpath). Returns `None` for non-USB
/// or unreadable devices.
pub fn read_usb_info(dev: &str) -> Option<UsbInfo> {
    let device_link = format!("{SYS_BLOCK}/{dev}/device");
    let real = std::fs::canonicalize(&device_link).ok()?;
    let real_str = real.to_string_lossy();
    if !real_str.contains("/usb") {
        return None;
    }
    // Walk upward from the device node looking for the USB interface
    // directory that carries idVendor/idProduct.
    let mut cur: &Path = &real;
    loop {
        let vendor = cur.join("idVendor");
        let product = cur.join("idProduct");
        if vendor.exists() && product.exists() {
            let vendor_id = std::fs::read_to_string(&vendor).ok()?.trim().to_string();
            let product_id = std::fs::read_to_string(&product).ok()?.trim().to_string();
            let manufacturer = std::fs::read_to_string(cur.join("manufacturer")).ok().map(|s| s.trim().to_string());
            let product_name = std::fs::read_to_string(cur.join("product")).ok().map(|s| s.trim().to_string());
            let speed = std::fs::read_to_string(cur.join("speed")).ok().map(|s| s.trim().to_string());
            return Some(UsbInfo {
                vendor_id,
                product_id,
                manufacturer,
                product: product_name,
                speed,
            });
        }
        cur = cur.parent()?;
        if cur == Path::new("/") {
            return None;
        }
    }
}

/// Classify the transport of a device by resolving its `device` symlink
/// target path (sata/ata/usb/pcie/nvme/mmc/scsi/unknown).
pub fn read_transport(dev: &str) -> String {
    if dev.starts_with("nvme") {
        return "nvme".to_string();
    }
    if dev.starts_with("mmcblk") {
        return "mmc".to_string();
    }
    if read_usb_info(dev).is_some() {
        return "usb".to_string();
    }
    let device_link = format!("{SYS_BLOCK}/{dev}/device");
    if let Ok(real) = std::fs::canonicalize(&device_link) {
        let s = real.to_string_lossy();
        if s.contains("ata") {
            return "ata".to_string();
        }
        if s.contains("scsi") {
            return "scsi".to_string();
        }
    }
    "unknown".to_string()
}

/// Parse `/proc/diskstats` into per-device sector counters.
pub fn read_diskstats() -> HashMap<String, Counters> {
    read_diskstats_from(PROC_DISKSTATS)
}

fn read_diskstats_from(path: &str) -> HashMap<String, Counters> {
    let mut map = HashMap::new();
    let Ok(content) = std::fs::read_to_string(path) else { return map };
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 14 {
            continue;
        }
        let name = fields[2].to_string();
        let sectors_read = fields[5].parse().unwrap_or(0);
        let sectors_written = fields[9].parse().unwrap_or(0);
        map.insert(name, Counters { sectors_read, sectors_written });
    }
    map
}

/// Parse `/proc/mounts` into a map of device path -> mount entry.
pub fn read_mounts() -> HashMap<String, MountEntry> { read_mounts_from(PROC_MOUNTS) }

fn read_mounts_from(path: &str) -> HashMap<String, MountEntry> {
    let mut map = HashMap::new();
    let Ok(content) = std::fs::read_to_string(path) else { return map };
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            continue;
        }
        let device = fields[0].to_string();
        if !device.starts_with("/dev/") {
            continue;
        }
        map.insert(device, MountEntry { mountpoint: fields[1].to_string(), fstype: fields[2].to_string() });
    }
    map
}

/// Parse `/proc/swaps` into the set of active swap device paths.
pub fn read_swaps() -> HashSet<String> { read_swaps_from(PROC_SWAPS) }

fn read_swaps_from(path: &str) -> HashSet<String> {
    let mut set = HashSet::new();
    let Ok(content) = std::fs::read_to_string(path) else { return set };
    for line in content.lines().skip(1) {
        if let Some(dev) = line.split_whitespace().next() {
            set.insert(dev.to_string());
        }
    }
    set
}

/// Read `/dev/disk/by-uuid/*` symlinks into a map of uuid -> resolved real
/// device path.
pub fn read_by_uuid() -> HashMap<String, PathBuf> {
    let mut map = HashMap::new();
    let Ok(entries) = std::fs::read_dir(DEV_BY_UUID) else { return map };
    for entry in entries.flatten() {
        let uuid = entry.file_name().to_string_lossy().into_owned();
        if let Ok(real) = std::fs::canonicalize(entry.path()) {
            map.insert(uuid, real);
        }
    }
    map
}

/// Resolve the slave devices backing a device-mapper name by reading
/// `/sys/block/<dmX>/slaves/*`.
pub fn resolve_dm_slaves(dm_name: &str) -> Vec<String> {
    let dmx = resolve_dm_name_to_dmx(dm_name).unwrap_or_else(|| dm_name.to_string());
    let slaves_dir = format!("{SYS_BLOCK}/{dmx}/slaves");
    let Ok(entries) = std::fs::read_dir(&slaves_dir) else { return Vec::new() };
    entries.flatten().map(|e| e.file_name().to_string_lossy().into_owned()).collect()
}

/// Whether `dev` has a bcache role, backing or caching (spec.md §4.D):
/// once bound to a cache set or registered as backing storage, both sides
/// expose `/sys/block/<dev>/bcache/`.
pub fn has_bcache_role(dev: &str) -> bool {
    Path::new(&format!("{SYS_BLOCK}/{dev}/bcache")).exists()
}

/// Resolve a `/dev/mapper/<name>` to its `dm-N` kernel name by reading
/// `/sys/class/block/dm-*/dm/name`.
pub fn resolve_dm_name_to_dmx(name: &str) -> Option<String> {
    let bare = name.trim_start_matches("/dev/mapper/");
    let entries = std::fs::read_dir("/sys/class/block").ok()?;
    for entry in entries.flatten() {
        let fname = entry.file_name().to_string_lossy().into_owned();
        if !fname.starts_with("dm-") {
            continue;
        }
        let name_path = entry.path().join("dm/name");
        if let Ok(content) = std::fs::read_to_string(&name_path) {
            if content.trim() == bare {
                return Some(fname);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diskstats_parses_minimal_line() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "   8       0 sda 100 0 2000 0 50 0 4000 0 0 0 0\n").unwrap();
        let stats = read_diskstats_from(tmp.path().to_str().unwrap());
        let sda = stats.get("sda").unwrap();
        assert_eq!(sda.sectors_read, 2000);
        assert_eq!(sda.sectors_written, 4000);
    }

    #[test]
    fn mounts_filters_non_dev_sources() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            tmp.path(),
            "/dev/sda1 /boot/efi vfat rw 0 0\nproc /proc proc rw 0 0\n",
        )
        .unwrap();
        let mounts = read_mounts_from(tmp.path().to_str().unwrap());
        assert_eq!(mounts.len(), 1);
        assert!(mounts.contains_key("/dev/sda1"));
    }

    #[test]
    fn swaps_skips_header() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "Filename Type Size Used Priority\n/dev/zram0 partition 2097148 0 100\n").unwrap();
        let swaps = read_swaps_from(tmp.path().to_str().unwrap());
        assert!(swaps.contains("/dev/zram0"));
        assert_eq!(swaps.len(), 1);
    }

    #[test]
    fn missing_paths_yield_empty_not_errors() {
        assert!(read_diskstats_from("/nonexistent/diskstats").is_empty());
        assert!(read_mounts_from("/nonexistent/mounts").is_empty());
        assert!(read_swaps_from("/nonexistent/swaps").is_empty());
        assert_eq!(read_rotational("nonexistent-device"), None);
    }
}
