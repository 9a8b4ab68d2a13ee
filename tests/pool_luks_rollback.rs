//! End-to-end rollback check for `PoolEngine::create_pool` (spec.md §4.H,
//! property 6): when filesystem creation fails partway through an
//! encrypted pool's setup, the LUKS mapper opened for the one data device
//! must be closed and the pool must never be persisted. `strategy.rs`
//! checks the same rollback discipline at the `LuksStrategy` layer; this
//! drives it one level up, through the engine that actually decides
//! whether to persist.

use mosctl_core::pool::description::{PoolConfig, PoolType};
use mosctl_core::pool::{CreatePoolRequest, PoolEngine};
use mosctl_core::tool::mock::MockInvoker;
use mosctl_core::tool::{CommandOutput, ToolError};

fn ok() -> Result<CommandOutput, ToolError> {
    Ok(CommandOutput { status_code: Some(0), success: true, stdout: String::new(), stderr: String::new() })
}

fn fail(stderr: &str) -> Result<CommandOutput, ToolError> {
    Ok(CommandOutput { status_code: Some(1), success: false, stdout: String::new(), stderr: stderr.into() })
}

#[tokio::test]
async fn failed_mkfs_rolls_back_the_opened_luks_mapper_and_skips_persistence() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockInvoker::new();

    // LuksStrategy::prepare for the single data device.
    mock.push(ok()); // luksFormat sdb
    mock.push(ok()); // luksOpen sdb tank_1
    // materialize_filesystem (ext4 -> create_single_fs).
    mock.push(ok()); // parted mklabel
    mock.push(ok()); // parted mkpart
    mock.push(fail("No space left on device")); // mkfs.ext4 fails
    // rollback cleanup.
    mock.push(ok()); // luksClose tank_1

    // `MockInvoker::clone` shares its recorded-invocation state (it's
    // `Arc`-backed), so this handle still observes every call the engine
    // makes through its own internal clones of `mock` (e.g. into
    // `LuksStrategy` for rollback cleanup).
    let observer = mock.clone();
    let engine = PoolEngine::new(mock, dir.path().join("pools.json"));
    // `create_keyfile: false` with a passphrase avoids `materialize_keyfile`,
    // which would otherwise try to create the real `/boot/config/system/luks`
    // directory this sandbox has neither the path nor the permission for;
    // the credential-resolution path this exercises (`luksFormat` →
    // `luksOpen` with a passphrase credential, no keyfile present) is
    // identical either way.
    let config = PoolConfig::builder()
        .encrypted(true)
        .create_keyfile(false)
        .build()
        .unwrap();
    let request = CreatePoolRequest {
        name: "tank".to_string(),
        pool_type: PoolType::Single,
        filesystem: "ext4".to_string(),
        data_devices: vec!["/dev/sdb".to_string()],
        parity_devices: vec![],
        config,
        passphrase: Some("correct horse battery staple".to_string()),
    };

    let result = engine.create_pool(request).await;

    assert!(result.is_err(), "mkfs failure must surface as an error, not a partially-created pool");
    assert!(engine.list_pools().unwrap().is_empty(), "a rolled-back pool must never be persisted");

    let close_calls = observer
        .invocations()
        .into_iter()
        .filter(|(program, args)| program == "cryptsetup" && args.first().map(String::as_str) == Some("luksClose"))
        .count();
    assert_eq!(close_calls, 1, "exactly the one opened mapper must be closed on rollback");
}
