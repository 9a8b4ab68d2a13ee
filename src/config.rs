//! Atomic JSON configuration persistence (spec.md §6, §9: "write-temp-then-
//! rename to guarantee atomicity"). Each persisted store (pool list, ZRAM
//! config, swap/system settings) wraps one of these, single-writer
//! discipline enforced by an internal mutex, the way `ZPOOL_CMD`/tool
//! paths are treated as immutable process-wide configuration
//! (spec.md §9 "Global state").

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;

quick_error! {
    #[derive(Debug)]
    pub enum ConfigError {
        Io(err: std::io::Error) {
            display("config I/O error: {}", err)
            from()
        }
        Serialize(err: serde_json::Error) {
            display("failed to serialize config: {}", err)
            from()
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// A JSON-backed store at `path`, written atomically via a sibling
/// `.tmp` file and `rename` (property 8: config atomicity — a reader sees
/// the full previous version or the full new version, never a partial
/// write, because POSIX `rename` is atomic within a filesystem).
pub struct AtomicJsonStore<T> {
    path: PathBuf,
    lock: Mutex<()>,
    _marker: PhantomData<T>,
}

impl<T> AtomicJsonStore<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        AtomicJsonStore { path: path.into(), lock: Mutex::new(()), _marker: PhantomData }
    }

    pub fn path(&self) -> &Path { &self.path }

    /// Returns `None` if the file does not exist yet (first run).
    pub fn read(&self) -> ConfigResult<Option<T>> {
        let _guard = self.lock.lock().unwrap();
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(ConfigError::Io(err)),
        }
    }

    pub fn write(&self, value: &T) -> ConfigResult<()> {
        let _guard = self.lock.lock().unwrap();
        let serialized = serde_json::to_string_pretty(value)?;
        let tmp_path = self.path.with_extension("tmp");
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&tmp_path, serialized)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        value: u32,
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store: AtomicJsonStore<Sample> = AtomicJsonStore::new(dir.path().join("cfg.json"));
        assert!(store.read().unwrap().is_none());
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store: AtomicJsonStore<Sample> = AtomicJsonStore::new(dir.path().join("cfg.json"));
        store.write(&Sample { value: 42 }).unwrap();
        let read_back = store.read().unwrap().unwrap();
        assert_eq!(read_back, Sample { value: 42 });
        // no stray temp file left behind
        assert!(!dir.path().join("cfg.tmp").exists());
    }

    #[test]
    fn second_write_fully_replaces_first() {
        let dir = tempfile::tempdir().unwrap();
        let store: AtomicJsonStore<Sample> = AtomicJsonStore::new(dir.path().join("cfg.json"));
        store.write(&Sample { value: 1 }).unwrap();
        store.write(&Sample { value: 2 }).unwrap();
        assert_eq!(store.read().unwrap().unwrap(), Sample { value: 2 });
    }
}
