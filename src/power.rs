//! Power-State Oracle (spec.md §4.C): classifies each device as
//! active/standby/unknown using only commands proven not to wake a
//! sleeping disk, with a short TTL cache and rules that skip classes
//! known never to standby. Gatekeeper for all further per-device
//! operations (property 1: standby safety).

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::tool::{CommandOutput, ToolInvoker, ToolResult};

/// TTL for the power-state cache (spec.md §4.C step 2).
pub const POWER_TTL: Duration = Duration::from_secs(15);
/// TTL for the independent temperature cache.
pub const TEMP_TTL: Duration = Duration::from_secs(12);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerStatus {
    Active,
    Standby,
    Unknown,
}

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: T,
    at: Instant,
}

/// Device classes that are always reported active without a probe
/// (spec.md §4.C step 3).
fn never_standby(class_hint: &str) -> bool {
    matches!(class_hint, "nvme" | "emmc" | "md" | "nmd")
}

fn is_partition_name(name: &str) -> bool {
    let last = name.chars().last();
    last.map(|c| c.is_ascii_digit()).unwrap_or(false) && !name.starts_with("md") && !name.starts_with("nmd")
}

pub struct PowerOracle<I: ToolInvoker> {
    invoker: I,
    power_cache: Mutex<HashMap<String, CacheEntry<PowerStatus>>>,
    temp_cache: Mutex<HashMap<String, CacheEntry<Option<f64>>>>,
}

impl<I: ToolInvoker> PowerOracle<I> {
    pub fn new(invoker: I) -> Self {
        PowerOracle { invoker, power_cache: Mutex::new(HashMap::new()), temp_cache: Mutex::new(HashMap::new()) }
    }

    fn normalize(device: &str) -> (String, String) {
        let bare = device.trim_start_matches("/dev/").to_string();
        (format!("/dev/{bare}"), bare)
    }

    fn class_hint(bare: &str) -> &'static str {
        if bare.starts_with("nvme") {
            "nvme"
        } else if bare.starts_with("mmcblk") {
            "emmc"
        } else if bare.starts_with("nmd") {
            "nmd"
        } else if bare.starts_with("md") {
            "md"
        } else {
            "other"
        }
    }

    /// Implements `getPowerState(device)` exactly per spec.md §4.C.
    pub async fn get_power_state(&self, device: &str) -> PowerStatus {
        let (key, bare) = Self::normalize(device);

        if let Some(cached) = self.cached_power(&key) {
            return cached;
        }

        let class = Self::class_hint(&bare);
        if never_standby(class) {
            return self.store_power(key, PowerStatus::Active);
        }

        if is_partition_name(&bare) {
            let base = crate::util::base_disk(&bare);
            if base != bare {
                let base_status = Box::pin(self.get_power_state(&base)).await;
                return self.store_power(key, base_status);
            }
        }

        let status = self.probe_smartctl_standby(&bare).await;
        self.store_power(key, status)
    }

    async fn probe_smartctl_standby(&self, bare: &str) -> PowerStatus {
        let dev_path = format!("/dev/{bare}");
        let args: Vec<&OsStr> =
            vec![OsStr::new("-n"), OsStr::new("standby"), OsStr::new("-i"), OsStr::new(&dev_path)];
        match self.invoker.run_default("smartctl", &args).await {
            Ok(out) => classify_smartctl_power(&out),
            Err(_) => PowerStatus::Unknown,
        }
    }

    fn cached_power(&self, key: &str) -> Option<PowerStatus> {
        let cache = self.power_cache.lock().unwrap();
        cache.get(key).filter(|e| e.at.elapsed() < POWER_TTL).map(|e| e.value)
    }

    fn store_power(&self, key: String, value: PowerStatus) -> PowerStatus {
        self.power_cache.lock().unwrap().insert(key, CacheEntry { value, at: Instant::now() });
        value
    }

    /// `smartctl -n standby -A <dev>`, never `hdparm -C` which may wake the
    /// disk on some controllers (spec.md §4.C).
    pub async fn get_temperature(&self, device: &str) -> ToolResult<Option<f64>> {
        let (key, bare) = Self::normalize(device);
        {
            let cache = self.temp_cache.lock().unwrap();
            if let Some(e) = cache.get(&key) {
                if e.at.elapsed() < TEMP_TTL {
                    return Ok(e.value);
                }
            }
        }
        let dev_path = format!("/dev/{bare}");
        let args: Vec<&OsStr> =
            vec![OsStr::new("-n"), OsStr::new("standby"), OsStr::new("-A"), OsStr::new(&dev_path)];
        let out = self.invoker.run_default("smartctl", &args).await?;
        let temp = parse_temperature(&out.stdout);
        self.temp_cache.lock().unwrap().insert(key, CacheEntry { value: temp, at: Instant::now() });
        Ok(temp)
    }
}

fn classify_smartctl_power(out: &CommandOutput) -> PowerStatus {
    if out.status_code == Some(2) || out.stdout.contains("STANDBY mode") || out.stdout.contains("SLEEP") {
        return PowerStatus::Standby;
    }
    if out.stdout.contains("ACTIVE") || out.stdout.contains("IDLE") {
        return PowerStatus::Active;
    }
    if out.stdout.contains("does not support") || out.stdout.contains("Unable to detect")
        || out.stdout.contains("Unknown USB bridge")
    {
        return PowerStatus::Active;
    }
    if out.success {
        return PowerStatus::Active;
    }
    PowerStatus::Unknown
}

fn parse_temperature(stdout: &str) -> Option<f64> {
    for line in stdout.lines() {
        if line.to_ascii_lowercase().contains("temperature") {
            for token in line.split_whitespace() {
                if let Ok(v) = token.parse::<f64>() {
                    return Some(v);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::mock::MockInvoker;

    fn ok(stdout: &str) -> ToolResult<CommandOutput> {
        Ok(CommandOutput { status_code: Some(0), success: true, stdout: stdout.to_string(), stderr: String::new() })
    }

    #[tokio::test]
    async fn nvme_is_always_active_without_probing() {
        let mock = MockInvoker::new();
        let oracle = PowerOracle::new(mock);
        let status = oracle.get_power_state("/dev/nvme0n1").await;
        assert_eq!(status, PowerStatus::Active);
        assert!(!oracle.invoker.was_invoked("smartctl"), "must not probe nvme");
    }

    #[tokio::test]
    async fn standby_disk_classified_from_exit_code_2() {
        let mock = MockInvoker::new();
        mock.push(Ok(CommandOutput {
            status_code: Some(2),
            success: false,
            stdout: "Device is in STANDBY mode".to_string(),
            stderr: String::new(),
        }));
        let oracle = PowerOracle::new(mock);
        let status = oracle.get_power_state("/dev/sdb").await;
        assert_eq!(status, PowerStatus::Standby);
    }

    #[tokio::test]
    async fn cache_hit_avoids_second_probe() {
        let mock = MockInvoker::new();
        mock.push(ok("ACTIVE"));
        let oracle = PowerOracle::new(mock);
        let first = oracle.get_power_state("/dev/sdc").await;
        let second = oracle.get_power_state("/dev/sdc").await;
        assert_eq!(first, PowerStatus::Active);
        assert_eq!(second, PowerStatus::Active);
        assert_eq!(oracle.invoker.invocations().len(), 1, "second call must hit cache");
    }

    #[tokio::test]
    async fn partition_inherits_base_disk_state() {
        let mock = MockInvoker::new();
        mock.push(Ok(CommandOutput {
            status_code: Some(2),
            success: false,
            stdout: "Device is in STANDBY mode".to_string(),
            stderr: String::new(),
        }));
        let oracle = PowerOracle::new(mock);
        let status = oracle.get_power_state("/dev/sdd1").await;
        assert_eq!(status, PowerStatus::Standby);
        assert_eq!(oracle.invoker.invocations().len(), 1, "partition probes its base disk once");
    }

    #[tokio::test]
    async fn unsupported_bridge_treated_as_active_not_woken() {
        let mock = MockInvoker::new();
        mock.push(ok("Unknown USB bridge"));
        let oracle = PowerOracle::new(mock);
        assert_eq!(oracle.get_power_state("/dev/sde").await, PowerStatus::Active);
    }
}
