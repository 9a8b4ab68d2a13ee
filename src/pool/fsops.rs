//! Filesystem-specific create/extend/mount helpers (spec.md §4.H). Each
//! pool type dispatches to one of these; grounded in
//! `ZpoolOpen3::create`/`ZpoolOpen3::destroy`'s shape (build an arg vector,
//! run it, map the output to a typed result) generalized from `zpool` to
//! `mkfs.*`/`btrfs`/`mount`.

use std::ffi::OsStr;

use crate::pool::description::RaidProfile;
use crate::tool::ToolInvoker;

quick_error! {
    #[derive(Debug)]
    pub enum FsOpsError {
        Tool(err: crate::tool::ToolError) {
            display("{}", err)
            from()
        }
        UnsupportedFilesystem(fs: String) {
            display("unsupported filesystem: {}", fs)
        }
        PartitionNodeTimeout(device: String) {
            display("partition node for {} did not appear in time", device)
        }
    }
}

pub type FsOpsResult<T> = Result<T, FsOpsError>;

/// `mkfs.btrfs -f -d <profile> -m <profile> <operational…>`.
pub async fn create_btrfs<I: ToolInvoker>(
    invoker: &I,
    profile: RaidProfile,
    devices: &[String],
) -> FsOpsResult<()> {
    let mut args: Vec<String> =
        vec!["-f".into(), "-d".into(), profile.as_btrfs_arg().into(), "-m".into(), profile.as_btrfs_arg().into()];
    args.extend(devices.iter().cloned());
    run_checked(invoker, "mkfs.btrfs", &args).await
}

/// `btrfs device add <device> <mount_point>` — extend an existing pool.
pub async fn extend_btrfs<I: ToolInvoker>(invoker: &I, device: &str, mount_point: &str) -> FsOpsResult<()> {
    run_checked(invoker, "btrfs", &["device".into(), "add".into(), device.into(), mount_point.into()]).await
}

/// Partition a single device with a GPT label and one primary partition
/// spanning it, then create `ext4`/`xfs` on the resulting partition node.
/// Partition suffix is `p1` for nvme/mmc/bcache, else `1` (spec.md §4.I).
pub async fn create_single_fs<I: ToolInvoker>(invoker: &I, fs: &str, device: &str) -> FsOpsResult<String> {
    run_checked(invoker, "parted", &["-s".into(), device.into(), "mklabel".into(), "gpt".into()]).await?;
    run_checked(
        invoker,
        "parted",
        &["-s".into(), device.into(), "mkpart".into(), "primary".into(), "1MiB".into(), "100%".into()],
    )
    .await?;
    let bare = device.trim_start_matches("/dev/");
    let suffix = if bare.starts_with("nvme") || bare.starts_with("mmc") || bare.starts_with("bcache") {
        "p1"
    } else {
        "1"
    };
    let partition = format!("{device}{suffix}");

    match fs {
        "ext4" => run_checked(invoker, "mkfs.ext4", &["-F".into(), partition.clone()]).await?,
        "xfs" => run_checked(invoker, "mkfs.xfs", &["-f".into(), partition.clone()]).await?,
        other => return Err(FsOpsError::UnsupportedFilesystem(other.to_string())),
    }
    Ok(partition)
}

pub async fn mount_filesystem<I: ToolInvoker>(
    invoker: &I,
    device: &str,
    mount_point: &str,
    options: &[String],
    degraded: bool,
) -> FsOpsResult<()> {
    let mut opts = options.to_vec();
    if degraded {
        opts.push("degraded".into());
    }
    let mut args: Vec<String> = Vec::new();
    if !opts.is_empty() {
        args.push("-o".into());
        args.push(opts.join(","));
    }
    args.push(device.into());
    args.push(mount_point.into());
    run_checked(invoker, "mount", &args).await?;
    run_checked(invoker, "mount", &["--make-shared".into(), mount_point.into()]).await
}

/// Union-mount already-formatted branch directories with `mergerfs`
/// (spec.md §4.H): `mergerfs -o <opts> <branch1>:<branch2>:... <mount_point>`.
pub async fn mount_mergerfs<I: ToolInvoker>(
    invoker: &I,
    branches: &[String],
    mount_point: &str,
    options: &[String],
) -> FsOpsResult<()> {
    let branch_spec = branches.join(":");
    let mut args: Vec<String> = vec!["-o".into(), options.join(",")];
    args.push(branch_spec);
    args.push(mount_point.into());
    run_checked(invoker, "mergerfs", &args).await?;
    run_checked(invoker, "mount", &["--make-shared".into(), mount_point.into()]).await
}

pub async fn unmount_filesystem<I: ToolInvoker>(invoker: &I, mount_point: &str) -> FsOpsResult<()> {
    run_checked(invoker, "umount", &[mount_point.into()]).await
}

async fn run_checked<I: ToolInvoker>(invoker: &I, program: &str, args: &[String]) -> FsOpsResult<()> {
    let arg_refs: Vec<&OsStr> = args.iter().map(|s| OsStr::new(s.as_str())).collect();
    let out = invoker.run_default(program, &arg_refs).await?;
    if out.success {
        Ok(())
    } else {
        Err(FsOpsError::Tool(crate::tool::ToolError::NonZeroExit(program.to_string(), out.status_code, out.stderr)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::mock::MockInvoker;

    #[tokio::test]
    async fn create_btrfs_passes_raid_profile_to_both_flags() {
        let mock = MockInvoker::new();
        mock.push_success("");
        create_btrfs(&mock, RaidProfile::Raid1, &["/dev/mapper/data_1".to_string()]).await.unwrap();
        let invocations = mock.invocations();
        let (_, args) = &invocations[0];
        assert!(args.contains(&"raid1".to_string()));
    }

    #[tokio::test]
    async fn single_fs_uses_p1_suffix_for_nvme() {
        let mock = MockInvoker::new();
        mock.push_success(""); // parted mklabel
        mock.push_success(""); // parted mkpart
        mock.push_success(""); // mkfs.ext4
        let partition = create_single_fs(&mock, "ext4", "/dev/nvme0n1").await.unwrap();
        assert_eq!(partition, "/dev/nvme0n1p1");
    }
}
