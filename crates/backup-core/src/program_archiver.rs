//! Runs an external program and streams its stdout into the chain as a
//! single tar member.

use std::io::{Read, Write};
use std::process::{Command, Stdio};

use crate::{Error, Result};

/// Turns a program command line into a tar member name: keep alphanumerics,
/// dots, dashes and underscores; replace everything else (spaces,
/// slashes, pipes) with `_`.
pub fn sanitize_program_name(command: &str) -> String {
    let sanitized: String = command
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = sanitized.trim_matches('_');
    if trimmed.is_empty() {
        "program".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Spawns `command` through `/bin/sh -c`, streams its stdout into `builder`
/// as a tar member named after the sanitized command line, and forwards
/// stderr lines to the tracing subscriber. Fails the whole backup on a
/// non-zero exit or an I/O error reading the pipe.
pub fn archive_program<W: Write>(
    builder: &mut tar::Builder<W>,
    command: &str,
    member_name: &str,
) -> Result<()> {
    let mut child = Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::io_simple(e))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::input("child process did not provide a stdout pipe"))?;

    // Drain stderr on its own thread: a child that interleaves stdout and
    // stderr output can fill the stderr pipe's buffer and block on it while
    // this thread is still reading stdout, deadlocking the backup otherwise.
    let mut stderr = child.stderr.take();
    let command_for_stderr = command.to_string();
    let stderr_thread = std::thread::spawn(move || {
        if let Some(pipe) = stderr.as_mut() {
            let mut err_buf = String::new();
            if pipe.read_to_string(&mut err_buf).is_ok() && !err_buf.trim().is_empty() {
                for line in err_buf.lines() {
                    tracing::warn!(program = %command_for_stderr, "{line}");
                }
            }
        }
    });

    let mut buffer = Vec::new();
    stdout
        .read_to_end(&mut buffer)
        .map_err(|e| Error::io_simple(e))?;
    let _ = stderr_thread.join();

    let status = child.wait().map_err(Error::io_simple)?;
    if !status.success() {
        return Err(Error::io_simple(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!(
                "program '{command}' exited with status {}",
                status.code().unwrap_or(-1)
            ),
        )));
    }

    let mut header = tar::Header::new_gnu();
    header
        .set_path(member_name)
        .map_err(Error::io_simple)?;
    header.set_size(buffer.len() as u64);
    header.set_mode(0o660);
    header.set_mtime(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
    );
    header.set_cksum();
    builder
        .append(&header, buffer.as_slice())
        .map_err(|e| Error::from_write_boundary(e, None))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_spaces_and_pipes() {
        assert_eq!(sanitize_program_name("mysqldump -u root db"), "mysqldump_-u_root_db");
        assert_eq!(sanitize_program_name("cat /etc/passwd | gzip"), "cat__etc_passwd___gzip");
    }

    #[test]
    fn empty_sanitized_name_falls_back() {
        assert_eq!(sanitize_program_name("///"), "program");
    }

    #[test]
    fn captures_stdout_as_a_single_tar_member() {
        let mut out = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut out);
            archive_program(&mut builder, "echo -n hello", "archive.tar").unwrap();
            builder.finish().unwrap();
        }
        let mut archive = tar::Archive::new(out.as_slice());
        let mut entries = archive.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"hello");
    }

    #[test]
    fn nonzero_exit_fails_the_backup() {
        let mut out = Vec::new();
        let mut builder = tar::Builder::new(&mut out);
        let err = archive_program(&mut builder, "exit 7", "archive.tar").unwrap_err();
        assert!(err.to_string().contains("exited with status 7"));
    }
}
