//! Post-archive collaborator hooks: a daemonized notification program and a
//! best-effort upload via `curl`, run strictly after the archive has been
//! closed and patched.

use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;

use nix::sys::wait::waitpid;
use nix::unistd::{fork, setsid, ForkResult};

use crate::{Error, Result};

/// Spawns `program` as a double-fork daemonized child with arguments
/// `<archive_path> <meta_tempfile>`, so the backup process neither blocks
/// on it nor stays tied to its lifetime: the first fork's parent reaps the
/// intermediate child immediately, and the grandchild (now reparented to
/// init) calls `setsid` before exec'ing the notification program.
pub fn run_notification_hook(program: &Path, archive_path: &Path, meta_json: &[u8]) -> Result<()> {
    let meta_tmp = tempfile::NamedTempFile::new().map_err(Error::io_simple)?;
    std::fs::write(meta_tmp.path(), meta_json).map_err(|e| Error::io(e, meta_tmp.path()))?;
    let meta_path = meta_tmp
        .into_temp_path()
        .keep()
        .map_err(|e| Error::io_simple(e.error))?;

    // Safety: between fork and exec/exit in the child branches below, only
    // async-signal-safe calls are made (setsid, execvp via Command::exec,
    // process::exit).
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            let _ = waitpid(child, None);
            Ok(())
        }
        Ok(ForkResult::Child) => match unsafe { fork() } {
            Ok(ForkResult::Parent { .. }) => std::process::exit(0),
            Ok(ForkResult::Child) => {
                let _ = setsid();
                let err = Command::new(program).arg(archive_path).arg(&meta_path).exec();
                eprintln!(
                    "failed to exec notification program '{}': {err}",
                    program.display()
                );
                std::process::exit(1);
            }
            Err(_) => std::process::exit(1),
        },
        Err(e) => Err(Error::io_simple(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("fork failed: {e}"),
        ))),
    }
}

/// Hands the archive to `curl` as a subprocess rather than pulling in an
/// HTTP client stack for a single best-effort side effect, consistent with
/// how `ProgramArchiver` already shells out to external programs.
pub fn upload_archive(url: &str, archive_path: &Path) -> Result<()> {
    let status = Command::new("curl")
        .arg("-sS")
        .arg("-T")
        .arg(archive_path)
        .arg(url)
        .status()
        .map_err(Error::io_simple)?;
    if !status.success() {
        return Err(Error::io_simple(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!(
                "curl upload to '{url}' exited with status {}",
                status.code().unwrap_or(-1)
            ),
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_failure_surfaces_as_an_error() {
        let result = upload_archive("http://127.0.0.1:1/no-such-endpoint", Path::new("/nonexistent"));
        assert!(result.is_err());
    }
}
