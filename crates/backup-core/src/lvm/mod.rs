//! Detects the logical volume underlying a set of input paths, and drives
//! the create/mount/archive/unmount/remove snapshot lifecycle.

mod mounts;
mod volume;

use std::path::{Path, PathBuf};

use crate::{Error, Result};

const DEFAULT_SNAPSHOT_FRACTION: f64 = 0.1;
const MOUNT_DIR_PREFIX: &str = "backup-";
const CORRUPTION_THRESHOLD_PERCENT: f64 = 99.0;

/// `--snapshot auto|forced|disabled` policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotPolicy {
    Auto,
    Forced,
    Disabled,
}

impl SnapshotPolicy {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(SnapshotPolicy::Auto),
            "forced" => Ok(SnapshotPolicy::Forced),
            "disabled" => Ok(SnapshotPolicy::Disabled),
            other => Err(Error::input(format!(
                "unknown snapshot policy '{other}': expected auto, forced or disabled"
            ))),
        }
    }
}

pub struct LvmOptions {
    pub policy: SnapshotPolicy,
    pub sudo: bool,
    pub snapshot_fraction: f64,
    pub mount_dir: Option<PathBuf>,
}

impl Default for LvmOptions {
    fn default() -> Self {
        LvmOptions {
            policy: SnapshotPolicy::Auto,
            sudo: false,
            snapshot_fraction: DEFAULT_SNAPSHOT_FRACTION,
            mount_dir: None,
        }
    }
}

/// What the archiver should actually read from: either the original inputs
/// unchanged, or the inputs rewritten relative to a mounted snapshot, plus
/// the teardown handle that must run on every exit path.
pub enum Detection {
    Plain {
        inputs: Vec<PathBuf>,
    },
    Snapshotted {
        inputs: Vec<PathBuf>,
        base: PathBuf,
        original_lv_uuid: String,
        teardown: SnapshotTeardown,
    },
}

/// Owns the snapshot LV and (if allocated here) the mount directory for the
/// duration of one archive operation. Every field needed to tear down is
/// captured at construction time so teardown never has to re-derive state.
pub struct SnapshotTeardown {
    sudo: bool,
    mount_dir: PathBuf,
    mount_dir_owned: bool,
    snapshot_lv: PathBuf,
}

impl SnapshotTeardown {
    /// Unmounts, removes the mount directory if it was created for this
    /// run, and removes the snapshot LV. Always attempts every step even
    /// if an earlier one fails; failures are logged but the first error
    /// encountered is what gets returned, since the original spec treats
    /// teardown errors as loggable, not as masking the primary failure.
    pub fn run(self) -> Result<()> {
        let mut first_err = None;

        if let Err(e) = volume::umount(self.sudo, &self.mount_dir) {
            tracing::warn!(error = %e, "failed to unmount snapshot mount point");
            first_err.get_or_insert(e);
        }

        if self.mount_dir_owned {
            if let Err(e) = std::fs::remove_dir(&self.mount_dir) {
                tracing::warn!(error = %e, "failed to remove temporary mount directory");
            }
        }

        if let Err(e) = volume::lvremove(self.sudo, &self.snapshot_lv) {
            tracing::warn!(error = %e, "failed to remove snapshot logical volume");
            first_err.get_or_insert(e);
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Checks the snapshot's `snap_percent` allocation before the archive
    /// is considered complete; `>= 99%` means the snapshot has filled its
    /// copy-on-write space and the data read from it may be corrupted.
    pub fn check_not_corrupted(&self) -> Result<()> {
        let percent = volume::snap_percent(self.sudo, &self.snapshot_lv)?;
        if percent >= CORRUPTION_THRESHOLD_PERCENT {
            return Err(Error::snapshot(format!(
                "snapshot allocation at {percent:.1}%, exceeding the corruption threshold"
            )));
        }
        Ok(())
    }
}

/// Runs LVM detection for `inputs` under `options.policy` and returns
/// either a plain pass-through or a mounted, ready-to-archive snapshot.
pub fn detect_and_prepare(inputs: &[PathBuf], options: &LvmOptions) -> Result<Detection> {
    if options.policy == SnapshotPolicy::Disabled {
        return Ok(Detection::Plain {
            inputs: inputs.to_vec(),
        });
    }

    let common = mounts::common_mount(inputs)?;
    let lv = match &common {
        Some(entry) => mounts::device_mapper_lv_info(&entry.device)?,
        None => None,
    };

    let (mount_entry, lv) = match (common, lv) {
        (Some(entry), Some(lv)) => (entry, lv),
        _ => {
            return match options.policy {
                SnapshotPolicy::Forced => Err(Error::precondition(
                    "inputs do not resolve to a single logical volume under forced snapshot policy",
                )),
                SnapshotPolicy::Auto | SnapshotPolicy::Disabled => Ok(Detection::Plain {
                    inputs: inputs.to_vec(),
                }),
            };
        }
    };

    let origin = volume::lvdisplay(options.sudo, &lv_device_path(&mount_entry.device, &lv))?;
    let vg = volume::vgdisplay(options.sudo, &origin.vg_name)?;

    let snapshot_name = format!("{}-snapshot-{}", lv.lv_name, uuid::Uuid::new_v4());
    let snapshot_path =
        volume::lvcreate_snapshot(options.sudo, &origin, &vg, &snapshot_name, options.snapshot_fraction)?;

    let (mount_dir, mount_dir_owned) = match &options.mount_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| Error::io(e, dir))?;
            (dir.clone(), false)
        }
        None => {
            let tmp = tempfile::Builder::new()
                .prefix(MOUNT_DIR_PREFIX)
                .tempdir()
                .map_err(|e| Error::snapshot(format!("failed to create mount directory: {e}")))?;
            (tmp.keep(), true)
        }
    };

    if let Err(e) = volume::mount_ro(options.sudo, &snapshot_path, &mount_dir) {
        // Mount failed: the snapshot still needs removing before we return.
        let _ = volume::lvremove(options.sudo, &snapshot_path);
        if mount_dir_owned {
            let _ = std::fs::remove_dir(&mount_dir);
        }
        return Err(e);
    }

    let teardown = SnapshotTeardown {
        sudo: options.sudo,
        mount_dir: mount_dir.clone(),
        mount_dir_owned,
        snapshot_lv: snapshot_path,
    };

    let rewritten: Vec<PathBuf> = inputs
        .iter()
        .map(|p| mount_dir.join(p.strip_prefix(&mount_entry.mount_point).unwrap_or(p)))
        .collect();

    Ok(Detection::Snapshotted {
        inputs: rewritten,
        base: mount_dir,
        original_lv_uuid: lv.uuid,
        teardown,
    })
}

/// `lvdisplay` needs the LV's device-mapper path, which may differ from
/// the mount source (e.g. `/dev/mapper/vg-lv` vs `/dev/dm-3`); both point
/// at the same LV, so either resolves correctly through `dm/name`.
fn lv_device_path(mount_device: &Path, lv: &mounts::DeviceMapperLv) -> PathBuf {
    if mount_device.starts_with("/dev/mapper") {
        mount_device.to_path_buf()
    } else {
        PathBuf::from("/dev/mapper").join(&lv.lv_name)
    }
}
