//! `/proc/mounts` parsing and logical-volume detection via `/sys/block`.

use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// One parsed `/proc/mounts` line: device path and mount point.
#[derive(Debug, Clone)]
pub struct MountEntry {
    pub device: PathBuf,
    pub mount_point: PathBuf,
}

fn parse_mounts(contents: &str) -> Vec<MountEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            Some(MountEntry {
                device: PathBuf::from(device),
                mount_point: PathBuf::from(mount_point.replace("\\040", " ")),
            })
        })
        .collect()
}

fn read_mounts() -> Result<Vec<MountEntry>> {
    let contents = std::fs::read_to_string("/proc/mounts").map_err(|e| Error::io(e, "/proc/mounts"))?;
    Ok(parse_mounts(&contents))
}

/// Finds the mount entry whose mount point is the longest prefix of `path`,
/// i.e. the filesystem that actually contains it.
pub fn containing_mount(path: &Path) -> Result<Option<MountEntry>> {
    let mut entries = read_mounts()?;
    entries.sort_by_key(|e| std::cmp::Reverse(e.mount_point.as_os_str().len()));
    Ok(entries.into_iter().find(|e| path.starts_with(&e.mount_point)))
}

/// If all of `paths` resolve to the same mount point, returns it; otherwise
/// `None` (multiple mounts, or no common containing mount).
pub fn common_mount(paths: &[PathBuf]) -> Result<Option<MountEntry>> {
    let mut common: Option<MountEntry> = None;
    for path in paths {
        let entry = match containing_mount(path)? {
            Some(e) => e,
            None => return Ok(None),
        };
        match &common {
            None => common = Some(entry),
            Some(existing) if existing.mount_point == entry.mount_point => {}
            Some(_) => return Ok(None),
        }
    }
    Ok(common)
}

/// Identifies the LV backing a device-mapper device, read from
/// `/sys/block/<name>/dm/{uuid,name}`. An LV is identified by a `dm/uuid`
/// value beginning with `LVM-`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMapperLv {
    pub lv_name: String,
    pub uuid: String,
}

pub fn device_mapper_lv_info(device: &Path) -> Result<Option<DeviceMapperLv>> {
    // `/proc/mounts` typically names the device `/dev/mapper/<vg>-<lv>`, a
    // symlink to the real `/dev/dm-N` node; `/sys/block` is keyed by the
    // latter, so the symlink must be resolved before taking `file_name()`.
    let resolved = match std::fs::canonicalize(device) {
        Ok(p) => p,
        Err(_) => return Ok(None),
    };
    let dm_name = match resolved.file_name().and_then(|n| n.to_str()) {
        Some(n) => n,
        None => return Ok(None),
    };
    let sys_dir = PathBuf::from("/sys/block").join(dm_name).join("dm");
    let uuid_path = sys_dir.join("uuid");
    if !uuid_path.exists() {
        return Ok(None);
    }
    let uuid = std::fs::read_to_string(&uuid_path)
        .map_err(|e| Error::io(e, &uuid_path))?
        .trim()
        .to_string();
    if !uuid.starts_with("LVM-") {
        return Ok(None);
    }
    let name_path = sys_dir.join("name");
    let lv_name = std::fs::read_to_string(&name_path)
        .map_err(|e| Error::io(e, &name_path))?
        .trim()
        .to_string();
    Ok(Some(DeviceMapperLv { lv_name, uuid }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mounts_with_escaped_spaces() {
        let sample = "/dev/mapper/vg0-data /var/lib/data ext4 rw,relatime 0 0\n\
                       tmpfs /run/mount\\040point tmpfs rw 0 0\n";
        let entries = parse_mounts(sample);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].mount_point, PathBuf::from("/run/mount point"));
    }

    #[test]
    fn device_mapper_lv_info_is_none_for_an_unresolvable_device() {
        // `/dev/mapper/vg0-data` can't be canonicalized when it doesn't
        // exist, so this must report "not an LV" rather than erroring —
        // the same outcome a real, non-device-mapper block device hits.
        let info = device_mapper_lv_info(Path::new("/dev/mapper/vg0-data")).unwrap();
        assert!(info.is_none());
    }

    #[test]
    fn longest_prefix_wins_for_nested_mounts() {
        let sample = "/dev/sda1 / ext4 rw 0 0\n\
                       /dev/mapper/vg0-var /var ext4 rw 0 0\n";
        let entries = parse_mounts(sample);
        let mut sorted = entries.clone();
        sorted.sort_by_key(|e| std::cmp::Reverse(e.mount_point.as_os_str().len()));
        assert_eq!(sorted[0].mount_point, PathBuf::from("/var"));
    }
}
