//! Shells out to `lvdisplay`, `vgdisplay`, `lvcreate`, `lvremove`, `lvs`,
//! `mount` and `umount`, and parses their colon-separated output.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::{Error, Result};

fn run(sudo: bool, program: &str, args: &[&str]) -> Result<String> {
    let (program, full_args): (&str, Vec<&str>) = if sudo {
        let mut v = vec![program];
        v.extend_from_slice(args);
        ("sudo", v)
    } else {
        (program, args.to_vec())
    };
    tracing::debug!(program, args = ?full_args, "invoking external command");
    let output = Command::new(program)
        .args(&full_args)
        .output()
        .map_err(|e| Error::snapshot(format!("failed to spawn '{program}': {e}")))?;
    if !output.status.success() {
        return Err(Error::snapshot(format!(
            "'{program} {}' exited with status {}: {}",
            full_args.join(" "),
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Fields of an `lvdisplay -c <lv_path>` line, in their fixed colon-
/// separated order.
#[derive(Debug, Clone)]
pub struct LogicalVolumeInfo {
    pub lv_path: PathBuf,
    pub vg_name: String,
    pub lv_size_extents: u64,
}

fn parse_lvdisplay(output: &str) -> Result<LogicalVolumeInfo> {
    let line = output
        .lines()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| Error::snapshot("lvdisplay produced no output"))?;
    let fields: Vec<&str> = line.trim().split(':').collect();
    // lv_path:vg_name:lv_access:lv_status:lv_#open:lv_#open:lv_size_in_sectors:
    // lv_extents:lv_alloc_extents:...
    if fields.len() < 8 {
        return Err(Error::snapshot(format!(
            "unexpected lvdisplay -c output: '{line}'"
        )));
    }
    let lv_extents: u64 = fields[7]
        .parse()
        .map_err(|_| Error::snapshot(format!("could not parse lv_extents from '{line}'")))?;
    Ok(LogicalVolumeInfo {
        lv_path: PathBuf::from(fields[0]),
        vg_name: fields[1].to_string(),
        lv_size_extents: lv_extents,
    })
}

/// The subset of `vgdisplay -c <vg>` fields this orchestrator needs: the
/// physical extent size, in kilobytes.
#[derive(Debug, Clone)]
pub struct VolumeGroupInfo {
    pub extent_size_kb: u64,
}

fn parse_vgdisplay(output: &str) -> Result<VolumeGroupInfo> {
    let line = output
        .lines()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| Error::snapshot("vgdisplay produced no output"))?;
    let fields: Vec<&str> = line.trim().split(':').collect();
    // vg_name:vg_access:vg_status:vg_#:vg_max_lv:vg_cur_lv:vg_open_lv:
    // vg_max_lv_size:vg_max_pv:vg_cur_pv:vg_act_pv:vg_size:vg_extent_size:...
    if fields.len() < 13 {
        return Err(Error::snapshot(format!(
            "unexpected vgdisplay -c output: '{line}'"
        )));
    }
    let extent_size_kb: u64 = fields[12]
        .parse()
        .map_err(|_| Error::snapshot(format!("could not parse vg_extent_size from '{line}'")))?;
    Ok(VolumeGroupInfo { extent_size_kb })
}

pub fn lvdisplay(sudo: bool, lv_path: &Path) -> Result<LogicalVolumeInfo> {
    let out = run(sudo, "lvdisplay", &["-c", &lv_path.to_string_lossy()])?;
    parse_lvdisplay(&out)
}

pub fn vgdisplay(sudo: bool, vg_name: &str) -> Result<VolumeGroupInfo> {
    let out = run(sudo, "vgdisplay", &["-c", vg_name])?;
    parse_vgdisplay(&out)
}

/// Creates a read-only snapshot named `snapshot_name` of `origin`, sized as
/// `extents * extent_size_kb * fraction` kilobytes.
pub fn lvcreate_snapshot(
    sudo: bool,
    origin: &LogicalVolumeInfo,
    vg: &VolumeGroupInfo,
    snapshot_name: &str,
    fraction: f64,
) -> Result<PathBuf> {
    let size_kb = (origin.lv_size_extents as f64 * vg.extent_size_kb as f64 * fraction) as u64;
    let size_kb = size_kb.max(1);
    let size_arg = format!("{size_kb}K");
    run(
        sudo,
        "lvcreate",
        &[
            "-L",
            &size_arg,
            "-s",
            "-n",
            snapshot_name,
            "-p",
            "r",
            &origin.lv_path.to_string_lossy(),
        ],
    )?;
    Ok(origin
        .lv_path
        .parent()
        .map(|p| p.join(snapshot_name))
        .unwrap_or_else(|| PathBuf::from(snapshot_name)))
}

pub fn lvremove(sudo: bool, lv_path: &Path) -> Result<()> {
    run(sudo, "lvremove", &["-f", &lv_path.to_string_lossy()]).map(|_| ())
}

pub fn mount_ro(sudo: bool, device: &Path, mount_dir: &Path) -> Result<()> {
    run(
        sudo,
        "mount",
        &["-o", "ro", &device.to_string_lossy(), &mount_dir.to_string_lossy()],
    )
    .map(|_| ())
}

pub fn umount(sudo: bool, mount_dir: &Path) -> Result<()> {
    run(sudo, "umount", &[&mount_dir.to_string_lossy()]).map(|_| ())
}

/// Returns the snapshot's `snap_percent` allocation, parsed from
/// `lvs -o snap_percent --noheadings`. The decimal separator may be a comma
/// or a dot.
pub fn snap_percent(sudo: bool, lv_path: &Path) -> Result<f64> {
    let out = run(
        sudo,
        "lvs",
        &["-o", "snap_percent", "--noheadings", &lv_path.to_string_lossy()],
    )?;
    let trimmed = out.trim().replace(',', ".");
    trimmed
        .parse()
        .map_err(|_| Error::snapshot(format!("could not parse snap_percent from '{trimmed}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lvdisplay_colon_fields() {
        let line = "/dev/vg0/data:vg0:rw:6:-1:0:2097152:256:-1:0:-1:253:4";
        let info = parse_lvdisplay(line).unwrap();
        assert_eq!(info.lv_path, PathBuf::from("/dev/vg0/data"));
        assert_eq!(info.vg_name, "vg0");
        assert_eq!(info.lv_size_extents, 256);
    }

    #[test]
    fn parses_vgdisplay_colon_fields() {
        let line = "vg0:wz--n-:0:-1:0:1:1:255:4096:1024:1024:4194304:4096:1024:0:1024";
        let info = parse_vgdisplay(line).unwrap();
        assert_eq!(info.extent_size_kb, 4096);
    }

    #[test]
    fn snapshot_size_uses_fraction_not_percentage() {
        let origin = LogicalVolumeInfo {
            lv_path: PathBuf::from("/dev/vg0/data"),
            vg_name: "vg0".to_string(),
            lv_size_extents: 1000,
        };
        let vg = VolumeGroupInfo { extent_size_kb: 4 };
        // 1000 extents * 4 KB/extent * 0.1 = 400 KB, not divided by 100 again.
        let size_kb = (origin.lv_size_extents as f64 * vg.extent_size_kb as f64 * 0.1) as u64;
        assert_eq!(size_kb, 400);
    }

    #[test]
    fn snap_percent_accepts_comma_decimal() {
        assert!((1.5_f64 - "1,5".replace(',', ".").parse::<f64>().unwrap()).abs() < f64::EPSILON);
    }
}
