//! Throughput Sampler (spec.md §2.E / §5): a single process-wide background
//! task that periodically reads `/proc/diskstats` and maintains per-device
//! rolling rates. One sample at a time, strictly monotonic timestamps; a
//! rate read observes either the pre- or post-sample value atomically.
//!
//! Grounded in the single-writer cache discipline used for the power cache in
//! `zpool/open3.rs`) generalized to a periodic `tokio::time::interval` task
//! per spec.md §5's concurrency model.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::sysfs::{self, Counters};

const SECTOR_BYTES: u64 = 512;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputSample {
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_rate: f64,
    pub write_rate: f64,
}

#[derive(Debug, Clone)]
struct Snapshot {
    at: Instant,
    counters: Counters,
}

/// Holds the last snapshot per base disk and the last computed rate.
pub struct ThroughputSampler {
    state: Mutex<HashMap<String, (Snapshot, ThroughputSample)>>,
}

impl Default for ThroughputSampler {
    fn default() -> Self { ThroughputSampler { state: Mutex::new(HashMap::new()) } }
}

impl ThroughputSampler {
    pub fn new() -> Self { Self::default() }

    /// Take one sample pass: read `/proc/diskstats` once and fold it into
    /// every tracked device's rolling rate. Exposed separately from the
    /// background loop so tests can drive it deterministically.
    pub fn sample_once(&self) { self.sample_with(sysfs::read_diskstats()) }

    fn sample_with(&self, counters: HashMap<String, Counters>) {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        for (dev, c) in counters {
            let new_snapshot = Snapshot { at: now, counters: c };
            match state.get(&dev) {
                Some((prev, _)) => {
                    let elapsed = now.saturating_duration_since(prev.at).as_secs_f64().max(f64::EPSILON);
                    let read_bytes = c.sectors_read.saturating_mul(SECTOR_BYTES);
                    let write_bytes = c.sectors_written.saturating_mul(SECTOR_BYTES);
                    let prev_read = prev.counters.sectors_read.saturating_mul(SECTOR_BYTES);
                    let prev_write = prev.counters.sectors_written.saturating_mul(SECTOR_BYTES);
                    // Clamp non-negative to tolerate counter resets (spec.md §3).
                    let delta_read = read_bytes.saturating_sub(prev_read) as f64;
                    let delta_write = write_bytes.saturating_sub(prev_write) as f64;
                    let sample = ThroughputSample {
                        read_bytes,
                        write_bytes,
                        read_rate: delta_read / elapsed,
                        write_rate: delta_write / elapsed,
                    };
                    state.insert(dev, (new_snapshot, sample));
                },
                None => {
                    let sample = ThroughputSample {
                        read_bytes: c.sectors_read.saturating_mul(SECTOR_BYTES),
                        write_bytes: c.sectors_written.saturating_mul(SECTOR_BYTES),
                        read_rate: 0.0,
                        write_rate: 0.0,
                    };
                    state.insert(dev, (new_snapshot, sample));
                },
            }
        }
    }

    pub fn get(&self, base_disk: &str) -> Option<ThroughputSample> {
        self.state.lock().unwrap().get(base_disk).map(|(_, s)| *s)
    }

    /// Spawn the periodic background task. Intended to be called once at
    /// process startup (spec.md §2.E "Single process-wide background task").
    pub fn spawn(self: std::sync::Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                self.sample_once();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_has_zero_rate() {
        let sampler = ThroughputSampler::new();
        let mut counters = HashMap::new();
        counters.insert("sda".to_string(), Counters { sectors_read: 100, sectors_written: 200 });
        sampler.sample_with(counters);
        let sample = sampler.get("sda").unwrap();
        assert_eq!(sample.read_rate, 0.0);
        assert_eq!(sample.write_rate, 0.0);
        assert_eq!(sample.read_bytes, 100 * SECTOR_BYTES);
    }

    #[test]
    fn counter_reset_clamps_to_non_negative() {
        let sampler = ThroughputSampler::new();
        let mut first = HashMap::new();
        first.insert("sda".to_string(), Counters { sectors_read: 1000, sectors_written: 1000 });
        sampler.sample_with(first);

        std::thread::sleep(Duration::from_millis(5));

        let mut second = HashMap::new();
        second.insert("sda".to_string(), Counters { sectors_read: 10, sectors_written: 10 });
        sampler.sample_with(second);

        let sample = sampler.get("sda").unwrap();
        assert!(sample.read_rate >= 0.0);
        assert!(sample.write_rate >= 0.0);
    }

    #[test]
    fn rate_increases_with_monotonic_growth() {
        let sampler = ThroughputSampler::new();
        let mut first = HashMap::new();
        first.insert("sda".to_string(), Counters { sectors_read: 0, sectors_written: 0 });
        sampler.sample_with(first);

        std::thread::sleep(Duration::from_millis(10));

        let mut second = HashMap::new();
        second.insert("sda".to_string(), Counters { sectors_read: 2000, sectors_written: 0 });
        sampler.sample_with(second);

        let sample = sampler.get("sda").unwrap();
        assert!(sample.read_rate > 0.0);
    }
}
