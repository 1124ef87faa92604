//! Walks a set of input paths and emits tar entries for them, tracking the
//! last-added path for progress reporting.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::{Error, Result};

/// Shared "most recently archived path" field, read by a controlling
/// collaborator from another thread while the archive is being written.
#[derive(Clone, Default)]
pub struct LastFile(Arc<Mutex<Option<String>>>);

impl LastFile {
    pub fn new() -> Self {
        LastFile::default()
    }

    pub fn get(&self) -> Option<String> {
        self.0.lock().expect("last-file mutex poisoned").clone()
    }

    fn set(&self, name: &str) {
        *self.0.lock().expect("last-file mutex poisoned") = Some(name.to_string());
    }
}

/// Walks `inputs` recursively and writes tar entries for every file,
/// directory and symlink found, in directory-traversal order.
///
/// When `base` is `Some`, every input is first made relative to it (the
/// snapshot-mounted case); otherwise inputs are stored with their absolute
/// path, minus the leading `/`, as their tar member name.
///
/// Returns the list of archived path names, in the order they were added,
/// for the `archived_files` metadata field.
pub fn archive_paths<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    inputs: &[PathBuf],
    base: Option<&Path>,
    last_file: &LastFile,
) -> Result<Vec<String>> {
    let mut archived = Vec::new();
    for input in inputs {
        let name = entry_name(input, base);
        append_recursive(builder, input, &name, last_file, &mut archived)?;
    }
    Ok(archived)
}

fn entry_name(path: &Path, base: Option<&Path>) -> String {
    let relative = match base {
        Some(base) => path.strip_prefix(base).unwrap_or(path),
        None => path.strip_prefix("/").unwrap_or(path),
    };
    relative.to_string_lossy().replace('\\', "/")
}

fn append_recursive<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    path: &Path,
    name: &str,
    last_file: &LastFile,
    archived: &mut Vec<String>,
) -> Result<()> {
    let metadata = std::fs::symlink_metadata(path).map_err(|e| Error::io(e, path))?;

    if metadata.file_type().is_symlink() {
        let target = std::fs::read_link(path).map_err(|e| Error::io(e, path))?;
        let mut header = symlink_header(name, &metadata)?;
        builder
            .append_link(&mut header, name, &target)
            .map_err(|e| Error::from_write_boundary(e, Some(path)))?;
        archived.push(name.to_string());
        last_file.set(name);
    } else if metadata.is_dir() {
        builder
            .append_dir(name, path)
            .map_err(|e| Error::from_write_boundary(e, Some(path)))?;
        archived.push(name.to_string());
        last_file.set(name);

        let mut children: Vec<_> = std::fs::read_dir(path)
            .map_err(|e| Error::io(e, path))?
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::io(e, path))?;
        children.sort_by_key(|e| e.file_name());

        for child in children {
            let child_path = child.path();
            let child_name = format!("{}/{}", name, child.file_name().to_string_lossy());
            append_recursive(builder, &child_path, &child_name, last_file, archived)?;
        }
    } else {
        let mut file = File::open(path).map_err(|e| Error::io(e, path))?;
        builder
            .append_file(name, &mut file)
            .map_err(|e| Error::from_write_boundary(e, Some(path)))?;
        archived.push(name.to_string());
        last_file.set(name);
    }

    Ok(())
}

fn symlink_header(name: &str, metadata: &std::fs::Metadata) -> Result<tar::Header> {
    let mut header = tar::Header::new_gnu();
    header
        .set_path(name)
        .map_err(Error::io_simple)?;
    header.set_size(0);
    header.set_entry_type(tar::EntryType::Symlink);
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        header.set_mode(metadata.mode() & 0o777);
        header.set_mtime(metadata.mtime() as u64);
    }
    #[cfg(not(unix))]
    {
        header.set_mode(0o777);
    }
    header.set_cksum();
    Ok(header)
}
