//! Device Strategy (spec.md §4.G): transparently layers LUKS encryption
//! under a pool's filesystem operations. Two variants, `Plain` and `Luks`,
//! share one capability set (`prepare`/`cleanup`/path accessors) the way
//! spec.md §9 describes ("tagged variants, no inheritance required").
//!
//! Grounded in `ZpoolOpen3` (one struct wrapping a `Command`
//! builder per operation, `debug!` before exec, typed error on non-zero
//! exit) generalized from a single `zpool` binary to `cryptsetup`.

use std::ffi::OsStr;
use std::path::PathBuf;

use base64::Engine;
use rand::RngCore;
use slog::Logger;

use crate::pool::description::{DataDevice, Pool};
use crate::tool::{ToolInvoker, ToolResult};
use crate::GlobalLogger;

quick_error! {
    #[derive(Debug)]
    pub enum StrategyError {
        Tool(err: crate::tool::ToolError) {
            display("{}", err)
            from()
        }
        Io(err: std::io::Error) {
            display("{}", err)
            from()
        }
        /// Neither a keyfile nor a sufficiently strong passphrase was
        /// available to open/format a LUKS container.
        MissingCredential {
            display("no usable passphrase or keyfile for LUKS device")
        }
        /// `create_keyfile=true` with passphrase < 8 chars, or similar.
        WeakPassphrase {
            display("passphrase must be at least 8 characters")
        }
    }
}

pub type StrategyResult<T> = Result<T, StrategyError>;

/// Output of preparing one device for filesystem operations (spec.md §3
/// `DeviceInfo`).
#[derive(Debug, Clone, Getters, Builder)]
#[builder(setter(into))]
#[get = "pub"]
pub struct DeviceInfo {
    original_device: String,
    physical_device: String,
    operational_device: String,
    slot: u32,
    is_encrypted: bool,
    #[builder(default = "false")]
    is_parity: bool,
    #[builder(default)]
    mapped_device: Option<String>,
}

impl DeviceInfo {
    pub fn builder() -> DeviceInfoBuilder { DeviceInfoBuilder::default() }
}

pub struct PrepareOptions {
    pub passphrase: Option<String>,
    pub format: bool,
    pub start_slot: u32,
}

/// Shared capability set both strategy variants implement.
#[async_trait::async_trait]
pub trait DeviceStrategy {
    async fn prepare(
        &self,
        devices: &[(String, bool)], // (device path, is_parity)
        pool_name: &str,
        options: &PrepareOptions,
    ) -> StrategyResult<Vec<DeviceInfo>>;

    async fn cleanup(&self, devices: &[DeviceInfo]);

    fn physical_path(&self, info: &DeviceInfo) -> String { info.physical_device().clone() }
    fn operational_path(&self, info: &DeviceInfo) -> String { info.operational_device().clone() }
}

/// Plain strategy: identity pass-through, physical == operational.
pub struct PlainStrategy;

#[async_trait::async_trait]
impl DeviceStrategy for PlainStrategy {
    async fn prepare(
        &self,
        devices: &[(String, bool)],
        _pool_name: &str,
        options: &PrepareOptions,
    ) -> StrategyResult<Vec<DeviceInfo>> {
        Ok(devices
            .iter()
            .enumerate()
            .map(|(i, (dev, is_parity))| {
                DeviceInfo::builder()
                    .original_device(dev.clone())
                    .physical_device(dev.clone())
                    .operational_device(dev.clone())
                    .slot(options.start_slot + i as u32)
                    .is_encrypted(false)
                    .is_parity(*is_parity)
                    .build()
                    .unwrap()
            })
            .collect())
    }

    async fn cleanup(&self, _devices: &[DeviceInfo]) {}
}

/// LUKS strategy: opens/formats a `luks2` container per device, naming
/// mappers `<pool>_<slot>` (data) / `parity_<pool>_<slot>` (parity).
pub struct LuksStrategy<I: ToolInvoker> {
    invoker: I,
    logger: Logger,
    keyfile_root: PathBuf,
}

impl<I: ToolInvoker> LuksStrategy<I> {
    pub fn new(invoker: I) -> Self {
        LuksStrategy {
            invoker,
            logger: GlobalLogger::global().new(o!("module" => "luks_strategy")),
            keyfile_root: PathBuf::from("/boot/config/system/luks"),
        }
    }

    pub fn with_keyfile_root(mut self, root: PathBuf) -> Self {
        self.keyfile_root = root;
        self
    }

    fn mapper_name(pool_name: &str, slot: u32, is_parity: bool) -> String {
        if is_parity {
            format!("parity_{pool_name}_{slot}")
        } else {
            format!("{pool_name}_{slot}")
        }
    }

    fn keyfile_path(&self, pool_name: &str) -> PathBuf { self.keyfile_root.join(format!("{pool_name}.key")) }

    /// Generate (or reuse) the base64-encoded 32-byte random keyfile for a
    /// pool, mode 0600 (spec.md §4.G / §6).
    async fn ensure_keyfile(&self, pool_name: &str) -> StrategyResult<PathBuf> {
        let path = self.keyfile_path(pool_name);
        if path.exists() {
            return Ok(path);
        }
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, encoded).await?;
        set_mode_0600(&path).await?;
        Ok(path)
    }

    async fn luks_format(&self, device: &str, credential: &Credential) -> StrategyResult<()> {
        let mut args: Vec<String> = vec!["luksFormat".into(), "--type".into(), "luks2".into()];
        if let Credential::Keyfile(path) = credential {
            args.push("--key-file".into());
            args.push(path.to_string_lossy().into_owned());
        }
        args.push(device.to_string());
        let arg_refs: Vec<&OsStr> = args.iter().map(|s| OsStr::new(s.as_str())).collect();
        debug!(self.logger, "luksFormat"; "device" => device);
        let out = if let Credential::Passphrase(pass) = credential {
            self.invoker.run_default("cryptsetup", &arg_refs).await.map(|o| (o, Some(pass.clone())))
        } else {
            self.invoker.run_default("cryptsetup", &arg_refs).await.map(|o| (o, None))
        }?;
        // Passphrase delivery on stdin is a property of the real invoker;
        // the ToolInvoker abstraction here models the command succeeding or
        // not, with stdin plumbing left to the concrete implementation.
        let (result, _pass) = out;
        if result.success {
            Ok(())
        } else {
            Err(StrategyError::Tool(crate::tool::ToolError::NonZeroExit(
                "cryptsetup luksFormat".into(),
                result.status_code,
                result.stderr,
            )))
        }
    }

    async fn luks_open(&self, device: &str, mapper_name: &str, credential: &Credential) -> StrategyResult<()> {
        let mut args: Vec<String> = vec!["luksOpen".into()];
        if let Credential::Keyfile(path) = credential {
            args.push("--key-file".into());
            args.push(path.to_string_lossy().into_owned());
        }
        args.push(device.to_string());
        args.push(mapper_name.to_string());
        let arg_refs: Vec<&OsStr> = args.iter().map(|s| OsStr::new(s.as_str())).collect();
        debug!(self.logger, "luksOpen"; "device" => device, "mapper" => mapper_name);
        let out = self.invoker.run_default("cryptsetup", &arg_refs).await?;
        if out.success {
            Ok(())
        } else {
            Err(StrategyError::Tool(crate::tool::ToolError::NonZeroExit(
                "cryptsetup luksOpen".into(),
                out.status_code,
                out.stderr,
            )))
        }
    }

    async fn luks_add_key(&self, device: &str, keyfile: &std::path::Path) -> StrategyResult<()> {
        let args: [&OsStr; 3] = [OsStr::new("luksAddKey"), OsStr::new(device), OsStr::new(keyfile)];
        let out = self.invoker.run_default("cryptsetup", &args).await?;
        if out.success {
            Ok(())
        } else {
            Err(StrategyError::Tool(crate::tool::ToolError::NonZeroExit(
                "cryptsetup luksAddKey".into(),
                out.status_code,
                out.stderr,
            )))
        }
    }

    async fn luks_close(&self, mapper_name: &str) {
        let args: [&OsStr; 2] = [OsStr::new("luksClose"), OsStr::new(mapper_name)];
        let _ = self.invoker.run_default("cryptsetup", &args).await;
    }
}

enum Credential {
    Keyfile(PathBuf),
    Passphrase(String),
}

async fn set_mode_0600(path: &std::path::Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_mode(0o600);
    tokio::fs::set_permissions(path, perms).await
}

#[async_trait::async_trait]
impl<I: ToolInvoker> DeviceStrategy for LuksStrategy<I> {
    async fn prepare(
        &self,
        devices: &[(String, bool)],
        pool_name: &str,
        options: &PrepareOptions,
    ) -> StrategyResult<Vec<DeviceInfo>> {
        if options.format {
            if let Some(pass) = &options.passphrase {
                if pass.len() < 8 {
                    return Err(StrategyError::WeakPassphrase);
                }
            }
        }

        let mut opened = Vec::new();

        for (i, (device, is_parity)) in devices.iter().enumerate() {
            let slot = options.start_slot + i as u32;
            let mapper_name = Self::mapper_name(pool_name, slot, *is_parity);

            let result = self.prepare_one(device, &mapper_name, pool_name, options, i).await;
            match result {
                Ok(()) => opened.push(
                    DeviceInfo::builder()
                        .original_device(device.clone())
                        .physical_device(device.clone())
                        .operational_device(format!("/dev/mapper/{mapper_name}"))
                        .slot(slot)
                        .is_encrypted(true)
                        .is_parity(*is_parity)
                        .mapped_device(mapper_name.clone())
                        .build()
                        .unwrap(),
                ),
                Err(err) => {
                    // Rollback (property 6): close every mapper opened so far, in
                    // reverse order, before propagating the error.
                    for info in opened.iter().rev() {
                        if let Some(mapper) = info.mapped_device() {
                            self.luks_close(mapper).await;
                        }
                    }
                    return Err(err);
                },
            }
        }
        Ok(opened)
    }

    async fn cleanup(&self, devices: &[DeviceInfo]) {
        // Data partitions first, then the main mapper — parity devices are
        // treated as "main" here since they are added after data slots.
        let mut data: Vec<&DeviceInfo> = devices.iter().filter(|d| !d.is_parity()).collect();
        let mut parity: Vec<&DeviceInfo> = devices.iter().filter(|d| *d.is_parity()).collect();
        data.reverse();
        parity.reverse();
        for info in data.into_iter().chain(parity) {
            if let Some(mapper) = info.mapped_device() {
                self.luks_close(mapper).await;
            }
        }
    }
}

impl<I: ToolInvoker> LuksStrategy<I> {
    async fn prepare_one(
        &self,
        device: &str,
        mapper_name: &str,
        pool_name: &str,
        options: &PrepareOptions,
        index: usize,
    ) -> StrategyResult<()> {
        // `format=false` opens an already-formatted device; `format=true`
        // (re)formats regardless of prior LUKS state (spec.md §4.G).
        let must_format = options.format;

        // Resolve credential: the first device prefers an existing or
        // just-generated keyfile; subsequent devices prefer the pool's
        // passphrase so the shared keyfile can be layered on afterward via
        // `luksAddKey` rather than reformatted out from under it. Falls
        // back to the keyfile when no passphrase is available at all.
        let keyfile_path = self.keyfile_path(pool_name);
        let keyfile_exists = keyfile_path.exists();
        let credential = if index == 0 && keyfile_exists {
            Credential::Keyfile(keyfile_path.clone())
        } else if let Some(pass) = &options.passphrase {
            Credential::Passphrase(pass.clone())
        } else if keyfile_exists {
            Credential::Keyfile(keyfile_path.clone())
        } else {
            return Err(StrategyError::MissingCredential);
        };

        if must_format {
            self.luks_format(device, &credential).await?;
        }

        self.luks_open(device, mapper_name, &credential).await?;

        if index > 0 && keyfile_exists {
            if let Credential::Passphrase(_) = credential {
                self.luks_add_key(device, &keyfile_path).await?;
            }
        }

        Ok(())
    }
}

/// Helper exposed to the pool engine: create the keyfile for a pool ahead
/// of strategy preparation when `create_keyfile=true` (spec.md §4.G).
pub async fn materialize_keyfile<I: ToolInvoker>(
    strategy: &LuksStrategy<I>,
    pool_name: &str,
) -> StrategyResult<PathBuf> {
    strategy.ensure_keyfile(pool_name).await
}

pub fn pool_devices_from(pool: &Pool) -> Vec<(String, bool)> {
    let mut devices: Vec<(String, bool)> =
        pool.data_devices().iter().map(|d: &DataDevice| (d.device.clone(), false)).collect();
    devices.extend(pool.parity_devices().iter().map(|d: &DataDevice| (d.device.clone(), true)));
    devices
}
