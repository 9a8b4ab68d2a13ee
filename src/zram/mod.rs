//! ZRAM Reconciler (spec.md §4.J): declarative apply of a ZRAM
//! configuration across four phases with a pre-flight mount-safety check,
//! fully serialized (spec.md §5: "at most one reconcile runs").
//!
//! Grounded in `ZpoolOpen3`'s validate-then-execute operation shape,
//! generalized from a single `zpool create` call to a four-phase
//! tear-down/build-up sequence with its own kernel-state pre-check.

pub mod device;

use std::ffi::OsStr;

use tokio::sync::Mutex as AsyncMutex;

use crate::config::AtomicJsonStore;
use crate::sysfs;
use crate::tool::ToolInvoker;
use crate::zram::device::{ZramConfig, ZramDevice};

quick_error! {
    #[derive(Debug)]
    pub enum ZramError {
        Validation(message: String) {
            display("validation error: {}", message)
        }
        MountSafety(mountpoint: String) {
            display("zram device still mounted at {}, refusing to reconcile", mountpoint)
        }
        Busy {
            display("a zram reconcile is already running")
        }
        Tool(err: crate::tool::ToolError) {
            display("{}", err)
            from()
        }
        Config(err: crate::config::ConfigError) {
            display("{}", err)
            from()
        }
    }
}

pub type ZramResult<T> = Result<T, ZramError>;

/// Whether `mounted_device` (e.g. `/dev/zram0p1`) is a partition of
/// `base` (`/dev/zram0`): `base` followed by `pN`.
fn is_partition_of(mounted_device: &str, base: &str) -> bool {
    mounted_device.strip_prefix(base).is_some_and(|rest| {
        rest.len() > 1 && rest.starts_with('p') && rest[1..].chars().all(|c| c.is_ascii_digit())
    })
}

pub struct ZramReconciler<I: ToolInvoker> {
    invoker: I,
    store: AtomicJsonStore<ZramConfig>,
    busy: AsyncMutex<()>,
}

impl<I: ToolInvoker> ZramReconciler<I> {
    pub fn new(invoker: I, config_path: impl Into<std::path::PathBuf>) -> Self {
        ZramReconciler { invoker, store: AtomicJsonStore::new(config_path), busy: AsyncMutex::new(()) }
    }

    pub fn get_config(&self) -> ZramResult<ZramConfig> { Ok(self.store.read()?.unwrap_or_default()) }

    /// `applyConfig(next)` (spec.md §4.J). Serialized via `busy`; any
    /// concurrent caller observes `ZramError::Busy` rather than blocking
    /// indefinitely (`try_lock`, matching the swap controller's single-slot
    /// discipline).
    pub async fn apply_config(&self, next: ZramConfig) -> ZramResult<()> {
        next.validate().map_err(ZramError::Validation)?;
        let _guard = self.busy.try_lock().map_err(|_| ZramError::Busy)?;

        let current = self.get_config()?;
        self.preflight_mount_safety(&current)?;

        if current == next {
            // Property 5 (idempotent reconcile): nothing to do, no
            // tear-down/build-up, no persisted-config write.
            return Ok(());
        }

        self.teardown_swaps(&current).await?;
        self.teardown_reset(&current).await?;

        // Enabling the whole system loads the module with num_devices=<count>;
        // disabling unloads it after the tear-down above (spec.md §4.J).
        if current.enabled && !next.enabled {
            self.run_checked("modprobe", &["-r".into(), "zram".into()]).await?;
        } else if !current.enabled && next.enabled {
            self.run_checked("modprobe", &["zram".into(), format!("num_devices={}", next.devices.len())]).await?;
        }

        if next.enabled {
            self.build_up(&next).await?;
        }
        self.shrink_unneeded(&current, &next).await?;

        Ok(self.store.write(&next)?)
    }

    /// Refuses to reconcile while a configured device, or any of its
    /// partitions (a ramdisk device can carry a partition table), is still
    /// mounted (spec.md §4.J step 0).
    fn preflight_mount_safety(&self, current: &ZramConfig) -> ZramResult<()> {
        let mounts = sysfs::read_mounts();
        for device in current.devices.iter().filter(|d| *d.enabled()) {
            let dev_path = format!("/dev/zram{}", device.index());
            for (mounted_device, entry) in &mounts {
                if mounted_device == &dev_path || is_partition_of(mounted_device, &dev_path) {
                    return Err(ZramError::MountSafety(entry.mountpoint.clone()));
                }
            }
        }
        Ok(())
    }

    async fn teardown_swaps(&self, current: &ZramConfig) -> ZramResult<()> {
        let swaps = sysfs::read_swaps();
        for device in &current.devices {
            let dev_path = format!("/dev/zram{}", device.index());
            if swaps.contains(&dev_path) {
                self.run_checked("swapoff", &[dev_path]).await?;
            }
        }
        Ok(())
    }

    async fn teardown_reset(&self, current: &ZramConfig) -> ZramResult<()> {
        for device in &current.devices {
            let reset_path = format!("/sys/block/zram{}/reset", device.index());
            let _ = tokio::fs::write(&reset_path, "1").await;
        }
        Ok(())
    }

    async fn build_up(&self, next: &ZramConfig) -> ZramResult<()> {
        for device in next.devices.iter().filter(|d| *d.enabled()) {
            self.ensure_kernel_index(*device.index()).await?;
            self.configure_device(device).await?;
            match device.device_type() {
                device::ZramDeviceType::Swap => self.prepare_swap(device).await?,
                device::ZramDeviceType::Ramdisk => self.prepare_ramdisk(device).await?,
            }
        }
        Ok(())
    }

    async fn ensure_kernel_index(&self, index: u32) -> ZramResult<()> {
        let device_path = format!("/sys/block/zram{index}");
        let mut attempts = 0;
        while !std::path::Path::new(&device_path).exists() {
            let _ = tokio::fs::write("/sys/class/zram-control/hot_add", "").await;
            attempts += 1;
            if attempts > 64 {
                return Err(ZramError::Validation(format!("zram index {index} did not appear after hot_add")));
            }
        }
        Ok(())
    }

    async fn configure_device(&self, device: &ZramDevice) -> ZramResult<()> {
        let dev_path = format!("/dev/zram{}", device.index());
        let size_arg = device.size().to_string();
        let args: Vec<&OsStr> = vec![
            OsStr::new("--algorithm"),
            OsStr::new(device.algorithm()),
            OsStr::new("--size"),
            OsStr::new(&size_arg),
            OsStr::new(&dev_path),
        ];
        self.run_checked_ref("zramctl", &args).await
    }

    async fn prepare_swap(&self, device: &ZramDevice) -> ZramResult<()> {
        let dev_path = format!("/dev/zram{}", device.index());
        self.run_checked("mkswap", &[dev_path.clone()]).await?;
        let priority = device.config().priority.unwrap_or(100).to_string();
        self.run_checked("swapon", &["--discard".into(), "--priority".into(), priority, dev_path]).await
    }

    async fn prepare_ramdisk(&self, device: &ZramDevice) -> ZramResult<()> {
        let dev_path = format!("/dev/zram{}", device.index());
        self.run_checked("wipefs", &["-a".into(), dev_path.clone()]).await?;
        let fs = device.config().filesystem.clone().unwrap_or_else(|| "ext4".into());
        match fs.as_str() {
            "ext4" => self.run_checked("mkfs.ext4", &["-F".into(), dev_path]).await,
            "xfs" => self.run_checked("mkfs.xfs", &["-f".into(), dev_path]).await,
            "btrfs" => self.run_checked("mkfs.btrfs", &["-f".into(), dev_path]).await,
            other => Err(ZramError::Validation(format!("unsupported ramdisk filesystem: {other}"))),
        }
    }

    async fn shrink_unneeded(&self, current: &ZramConfig, next: &ZramConfig) -> ZramResult<()> {
        let needed_max = next.devices.iter().filter(|d| *d.enabled()).map(|d| *d.index()).max();
        for device in &current.devices {
            let above_needed = match needed_max {
                Some(max) => *device.index() > max,
                None => true,
            };
            if above_needed {
                let _ = tokio::fs::write("/sys/class/zram-control/hot_remove", device.index().to_string()).await;
            }
        }
        Ok(())
    }

    /// Incremental `addDevice`/`updateDevice`/`deleteDevice`: rebuild only
    /// the affected index by delegating to `apply_config` with a config
    /// differing in exactly one device, per spec.md §4.J. `updateDevice`
    /// forbids changes to `id`, `index`, `uuid`.
    pub async fn update_device(&self, updated: ZramDevice) -> ZramResult<()> {
        let current = self.get_config()?;
        let existing = current.devices.iter().find(|d| d.index() == updated.index());
        if let Some(existing) = existing {
            if existing.id() != updated.id() {
                return Err(ZramError::Validation("id is immutable".into()));
            }
            if existing.config().uuid != updated.config().uuid {
                return Err(ZramError::Validation("uuid is immutable".into()));
            }
        }
        let mut next = current.clone();
        match next.devices.iter_mut().find(|d| d.index() == updated.index()) {
            Some(slot) => *slot = updated,
            None => next.devices.push(updated),
        }
        self.apply_config(next).await
    }

    pub async fn delete_device(&self, index: u32) -> ZramResult<()> {
        let mut next = self.get_config()?;
        next.devices.retain(|d| *d.index() != index);
        self.apply_config(next).await
    }

    async fn run_checked(&self, program: &str, args: &[String]) -> ZramResult<()> {
        let arg_refs: Vec<&OsStr> = args.iter().map(|s| OsStr::new(s.as_str())).collect();
        self.run_checked_ref(program, &arg_refs).await
    }

    async fn run_checked_ref(&self, program: &str, args: &[&OsStr]) -> ZramResult<()> {
        let out = self.invoker.run_default(program, args).await?;
        if out.success {
            Ok(())
        } else {
            Err(ZramError::Tool(crate::tool::ToolError::NonZeroExit(program.to_string(), out.status_code, out.stderr)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::mock::MockInvoker;
    use crate::zram::device::ZramDeviceType;

    fn device(index: u32, size: u64) -> ZramDevice {
        ZramDevice::builder()
            .id(format!("zram-{index}"))
            .name(format!("zram{index}"))
            .index(index)
            .device_type(ZramDeviceType::Swap)
            .algorithm("zstd")
            .size(size)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn identical_config_skips_tool_invocations() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockInvoker::new();
        let reconciler = ZramReconciler::new(mock, dir.path().join("zram.json"));
        let config = ZramConfig { enabled: true, devices: vec![device(0, 1_073_741_824)] };

        reconciler.store.write(&config).unwrap();
        reconciler.apply_config(config).await.unwrap();

        assert!(reconciler.invoker.invocations().is_empty(), "identical config must not touch the kernel");
    }

    #[test]
    fn partition_of_recognizes_only_numbered_p_suffixes() {
        assert!(is_partition_of("/dev/zram0p1", "/dev/zram0"));
        assert!(is_partition_of("/dev/zram0p12", "/dev/zram0"));
        assert!(!is_partition_of("/dev/zram0", "/dev/zram0"));
        assert!(!is_partition_of("/dev/zram01", "/dev/zram0"));
        assert!(!is_partition_of("/dev/zram1", "/dev/zram0"));
    }

    #[tokio::test]
    async fn enabling_the_system_loads_the_module_with_device_count() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockInvoker::new();
        mock.push_success(""); // modprobe zram num_devices=1
        let reconciler = ZramReconciler::new(mock, dir.path().join("zram.json"));
        reconciler.store.write(&ZramConfig { enabled: false, devices: vec![] }).unwrap();

        // ensure_kernel_index polls real /sys paths that don't exist in a
        // test sandbox and eventually errors out; the modprobe call is
        // issued before build_up runs, so its invocation is still asserted
        // regardless of how the rest of the reconcile resolves.
        let next = ZramConfig { enabled: true, devices: vec![device(0, 1_073_741_824)] };
        let _ = reconciler.apply_config(next).await;

        let invocations = reconciler.invoker.invocations();
        let modprobe_call = invocations.iter().find(|(p, _)| p == "modprobe");
        assert_eq!(modprobe_call.map(|(_, args)| args.clone()), Some(vec!["zram".to_string(), "num_devices=1".to_string()]));
    }

    #[tokio::test]
    async fn deleting_unknown_index_is_a_no_op_reconcile() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockInvoker::new();
        let reconciler = ZramReconciler::new(mock, dir.path().join("zram.json"));
        let config = ZramConfig { enabled: true, devices: vec![device(0, 1_073_741_824)] };
        reconciler.store.write(&config).unwrap();

        reconciler.delete_device(7).await.unwrap();

        assert!(reconciler.invoker.invocations().is_empty(), "deleting an absent index must not touch the kernel");
    }
}
