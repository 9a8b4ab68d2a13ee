//! Small pure helpers shared across components: size formatting, base-disk
//! derivation (property 2 in spec.md §8) and pool-relative path handling.

use std::path::{Path, PathBuf};

const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

/// Render a byte count as a human string, e.g. `formatSize`. Picks the
/// largest unit such that the value is >= 1 (falls back to bytes for 0).
pub fn format_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0 B".to_string();
    }
    let mut value = bytes as f64;
    let mut unit_idx = 0;
    while value >= 1024.0 && unit_idx < UNITS.len() - 1 {
        value /= 1024.0;
        unit_idx += 1;
    }
    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit_idx])
    }
}

/// Parse a string produced by [`format_size`] back into a byte count.
/// Also accepts a bare integer (bytes) and simple suffixes like `4G`/`512M`
/// the way pool/zram/swap size fields are typically authored.
pub fn parse_size(input: &str) -> Option<u64> {
    let input = input.trim();
    if let Ok(n) = input.parse::<u64>() {
        return Some(n);
    }
    let mut split_at = input.len();
    for (i, c) in input.char_indices() {
        if !(c.is_ascii_digit() || c == '.') {
            split_at = i;
            break;
        }
    }
    let (number, rest) = input.split_at(split_at);
    let number: f64 = number.parse().ok()?;
    let rest = rest.trim();
    let multiplier = match rest.to_ascii_uppercase().as_str() {
        "" | "B" => 1.0,
        "K" | "KB" | "KIB" => 1024.0,
        "M" | "MB" | "MIB" => 1024.0f64.powi(2),
        "G" | "GB" | "GIB" => 1024.0f64.powi(3),
        "T" | "TB" | "TIB" => 1024.0f64.powi(4),
        "P" | "PB" | "PIB" => 1024.0f64.powi(5),
        _ => return None,
    };
    Some((number * multiplier).round() as u64)
}

/// Derive the whole-disk name for a device or partition name (bare, no
/// `/dev/` prefix), per spec.md §3's Partition invariant and §8 property 2:
/// NVMe, mmcblk, and bcache strip a trailing `pN`; everything else strips
/// trailing digits. Whole-disk names are the identity.
pub fn base_disk(name: &str) -> String {
    if let Some(stripped) = strip_nvme_or_bcache_partition(name) {
        return stripped;
    }
    let trimmed = name.trim_end_matches(|c: char| c.is_ascii_digit());
    trimmed.to_string()
}

fn strip_nvme_or_bcache_partition(name: &str) -> Option<String> {
    let is_nvme = name.starts_with("nvme");
    let is_bcache = name.starts_with("bcache");
    let is_mmc = name.starts_with("mmcblk");
    if !is_nvme && !is_bcache && !is_mmc {
        return None;
    }
    let digits_end = name.len();
    let mut idx = digits_end;
    for (i, c) in name.char_indices().rev() {
        if c.is_ascii_digit() {
            idx = i;
        } else {
            break;
        }
    }
    if idx == digits_end {
        // No trailing digits at all: whole device already.
        return Some(name.to_string());
    }
    if name.as_bytes().get(idx.wrapping_sub(1)) == Some(&b'p') {
        return Some(name[..idx - 1].to_string());
    }
    // Trailing digits with no `p` separator (e.g. "nvme0n1" itself): whole disk.
    Some(name.to_string())
}

/// Strip `base` (a pool mount root) from `full`, returning the remainder
/// with no leading separator. Inverse of `Path::join` for any non-empty
/// relative component (property 7 round-trip).
pub fn extract_relative_path(base: &Path, full: &Path) -> Option<PathBuf> {
    full.strip_prefix(base).ok().map(|p| p.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_disk_whole_disks_are_identity() {
        for d in ["sda", "sdz", "nvme0n1", "nvme12n3", "mmcblk0", "bcache0"] {
            assert_eq!(base_disk(d), d, "whole disk {d} must be identity");
        }
    }

    #[test]
    fn base_disk_partitions() {
        assert_eq!(base_disk("sda1"), "sda");
        assert_eq!(base_disk("sdz9"), "sdz");
        assert_eq!(base_disk("nvme0n1p1"), "nvme0n1");
        assert_eq!(base_disk("nvme12n3p99"), "nvme12n3");
        assert_eq!(base_disk("mmcblk0p1"), "mmcblk0");
        assert_eq!(base_disk("bcache0p3"), "bcache0");
    }

    #[test]
    fn size_round_trips() {
        for n in [0u64, 1, 1023, 1024, 10 * (1u64 << 30)] {
            let formatted = format_size(n);
            let parsed = parse_size(&formatted).expect("must parse own output");
            assert_eq!(parsed, n, "round trip failed for {n} -> {formatted}");
        }
    }

    #[test]
    fn parse_size_accepts_suffixes() {
        assert_eq!(parse_size("4G"), Some(4 * 1024u64.pow(3)));
        assert_eq!(parse_size("512M"), Some(512 * 1024u64.pow(2)));
        assert_eq!(parse_size("1024"), Some(1024));
    }

    #[test]
    fn relative_path_round_trips() {
        let base = Path::new("/mnt/data");
        for rel in ["swap/swapfile", "a", "nested/deep/path"] {
            let full = base.join(rel);
            let extracted = extract_relative_path(base, &full).unwrap();
            assert_eq!(extracted, PathBuf::from(rel));
        }
    }
}
