//! End-to-end exercise of `ZramReconciler`'s incremental API (spec.md
//! §4.J) through its public surface: `id`/`uuid` immutability on update,
//! and that deleting an already-absent index stays a no-op without ever
//! touching the kernel. Seeds "current" state by writing the JSON file
//! `AtomicJsonStore` itself would produce, the same way a real daemon
//! restart would find a config left over from a previous run — calling
//! `apply_config` for the initial seed would require real zram/root
//! privileges this suite doesn't have.

use mosctl_core::tool::mock::MockInvoker;
use mosctl_core::zram::device::{ZramConfig, ZramDevice, ZramDeviceConfig, ZramDeviceType};
use mosctl_core::zram::ZramReconciler;

fn device(id: &str, index: u32, size: u64) -> ZramDevice {
    ZramDevice::builder().id(id).name(format!("zram{index}")).index(index).device_type(ZramDeviceType::Swap).algorithm("zstd").size(size).build().unwrap()
}

fn device_with_uuid(id: &str, index: u32, size: u64, uuid: &str) -> ZramDevice {
    ZramDevice::builder()
        .id(id)
        .name(format!("zram{index}"))
        .index(index)
        .device_type(ZramDeviceType::Swap)
        .algorithm("zstd")
        .size(size)
        .config(ZramDeviceConfig { priority: None, uuid: Some(uuid.to_string()), filesystem: None })
        .build()
        .unwrap()
}

fn seed(path: &std::path::Path, config: &ZramConfig) {
    std::fs::write(path, serde_json::to_string_pretty(config).unwrap()).unwrap();
}

#[tokio::test]
async fn update_device_rejects_an_id_change_without_touching_the_kernel() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("zram.json");
    seed(&path, &ZramConfig { enabled: true, devices: vec![device("zram-0", 0, 1_073_741_824)] });

    let mock = MockInvoker::new();
    let observer = mock.clone();
    let reconciler = ZramReconciler::new(mock, path);

    let renamed = device("different-id", 0, 1_073_741_824);
    let result = reconciler.update_device(renamed).await;

    assert!(result.is_err(), "changing the immutable id on an existing index must be rejected");
    assert!(observer.invocations().is_empty(), "a rejected update must never reach the kernel");
}

#[tokio::test]
async fn update_device_rejects_a_uuid_change_without_touching_the_kernel() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("zram.json");
    let original = device_with_uuid("zram-0", 0, 1_073_741_824, "uuid-a");
    seed(&path, &ZramConfig { enabled: true, devices: vec![original] });

    let mock = MockInvoker::new();
    let observer = mock.clone();
    let reconciler = ZramReconciler::new(mock, path);

    let changed = device_with_uuid("zram-0", 0, 1_073_741_824, "uuid-b");
    let result = reconciler.update_device(changed).await;

    assert!(result.is_err(), "changing the immutable uuid on an existing index must be rejected");
    assert!(observer.invocations().is_empty());
}

#[tokio::test]
async fn deleting_an_absent_index_through_the_public_api_touches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("zram.json");
    seed(&path, &ZramConfig { enabled: true, devices: vec![device("zram-0", 0, 1_073_741_824)] });

    let mock = MockInvoker::new();
    let observer = mock.clone();
    let reconciler = ZramReconciler::new(mock, path);

    reconciler.delete_device(99).await.unwrap();

    assert!(observer.invocations().is_empty(), "deleting an index that was never there must not touch the kernel");
    assert_eq!(reconciler.get_config().unwrap().devices.len(), 1, "the existing device must be untouched");
}

#[tokio::test]
async fn reconciling_an_identical_config_through_the_public_api_touches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("zram.json");
    let config = ZramConfig { enabled: true, devices: vec![device("zram-0", 0, 1_073_741_824)] };
    seed(&path, &config);

    let mock = MockInvoker::new();
    let observer = mock.clone();
    let reconciler = ZramReconciler::new(mock, path);

    reconciler.apply_config(config).await.unwrap();

    assert!(observer.invocations().is_empty(), "reapplying the already-current config must be a no-op");
}
