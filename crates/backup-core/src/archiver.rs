//! Top-level orchestration for one archive operation: wires the writer
//! chain, compression, tar emission and the LVM orchestrator together and
//! owns the cleanup contract that runs on every exit path.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::compression::CompressingWriter;
use crate::file_archiver::{self, LastFile};
use crate::lvm::{self, Detection, LvmOptions, SnapshotTeardown};
use crate::meta::{ArchivedMeta, CompressionMode, HashAlgorithm, MetaRecord};
use crate::program_archiver;
use crate::tar_patcher::{assemble_meta_record, TarPatcher};
use crate::writer::{ChainOptions, CipherSpec, WriterChain};
use crate::{hooks, Error, Result};

/// What to archive: a set of filesystem paths, or the stdout of a program.
pub enum InputSource {
    Files(Vec<PathBuf>),
    Program(String),
}

/// Already-validated, already-typed options for one `create` call. The CLI
/// layer is responsible for parsing raw strings (rate suffixes, cipher
/// names) into these types before the core ever sees them.
pub struct CreateOptions {
    pub inputs: InputSource,
    pub output: PathBuf,
    pub lvm: LvmOptions,
    pub compression: Option<CompressionMode>,
    pub cipher: Option<CipherSpec>,
    pub hash_algorithm: HashAlgorithm,
    pub io_write_rate: Option<u64>,
    pub cancel_flag: Option<Arc<AtomicBool>>,
    pub notification_program: Option<PathBuf>,
    pub upload_url: Option<String>,
}

/// Owns the shared `last_file` progress handle for the duration of one
/// [`create`](Archiver::create) call; the CLI layer owns this.
pub struct Archiver {
    last_file: LastFile,
}

impl Default for Archiver {
    fn default() -> Self {
        Self::new()
    }
}

impl Archiver {
    pub fn new() -> Self {
        Archiver {
            last_file: LastFile::new(),
        }
    }

    /// A handle a controlling collaborator can poll from another thread
    /// while [`create`](Archiver::create) runs on this one.
    pub fn last_file_handle(&self) -> LastFile {
        self.last_file.clone()
    }

    pub fn create(&self, options: CreateOptions) -> Result<MetaRecord> {
        match &options.inputs {
            InputSource::Files(paths) => {
                for path in paths {
                    if !path.exists() {
                        return Err(Error::input(format!(
                            "input path '{}' does not exist",
                            path.display()
                        )));
                    }
                }
                let paths = paths.clone();
                self.create_from_files(paths, options)
            }
            InputSource::Program(command) => {
                let command = command.clone();
                self.create_from_program(command, options)
            }
        }
    }

    fn create_from_files(&self, paths: Vec<PathBuf>, options: CreateOptions) -> Result<MetaRecord> {
        let detection = lvm::detect_and_prepare(&paths, &options.lvm)?;

        let (archive_inputs, base, snapshot_used, original_lv_uuid, teardown) = match detection {
            Detection::Plain { inputs } => (inputs, None, false, String::new(), None),
            Detection::Snapshotted {
                inputs,
                base,
                original_lv_uuid,
                teardown,
            } => (inputs, Some(base), true, original_lv_uuid, Some(teardown)),
        };

        tracing::info!(inputs = archive_inputs.len(), snapshot_used, "starting file archive");

        let last_file = self.last_file.clone();
        let result = build_archive(&options, snapshot_used, original_lv_uuid, |builder| {
            let archived =
                file_archiver::archive_paths(builder, &archive_inputs, base.as_deref(), &last_file)?;
            Ok(ArchivedMeta::Files(archived))
        });

        self.finish(options, result, teardown)
    }

    fn create_from_program(&self, command: String, options: CreateOptions) -> Result<MetaRecord> {
        tracing::info!(command = %command, "starting program archive");
        let result = build_archive(&options, false, String::new(), |builder| {
            let member_name = program_archiver::sanitize_program_name(&command);
            program_archiver::archive_program(builder, &command, &member_name)?;
            Ok(ArchivedMeta::Program(command.clone()))
        });
        self.finish(options, result, None)
    }

    /// Runs the cleanup contract shared by both input sources: on success,
    /// checks the snapshot for corruption before tearing it down and firing
    /// hooks; on any failure, unlinks the partial archive and still tears
    /// down the snapshot, logging (but not returning) teardown errors.
    fn finish(
        &self,
        options: CreateOptions,
        result: Result<MetaRecord>,
        teardown: Option<SnapshotTeardown>,
    ) -> Result<MetaRecord> {
        match result {
            Ok(meta) => {
                if let Some(teardown) = teardown {
                    if let Err(e) = teardown.check_not_corrupted() {
                        tracing::error!(error = %e, "snapshot corrupted, discarding archive");
                        let _ = std::fs::remove_file(&options.output);
                        if let Err(teardown_err) = teardown.run() {
                            tracing::warn!(error = %teardown_err, "snapshot teardown failed after corruption abort");
                        }
                        return Err(e);
                    }
                    teardown.run()?;
                }
                tracing::info!(output = %options.output.display(), "archive created");
                self.run_hooks(&options, &meta)?;
                Ok(meta)
            }
            Err(e) => {
                tracing::error!(error = %e, "archive failed, cleaning up");
                let _ = std::fs::remove_file(&options.output);
                if let Some(teardown) = teardown {
                    if let Err(teardown_err) = teardown.run() {
                        tracing::warn!(error = %teardown_err, "snapshot teardown failed while handling a prior error");
                    }
                }
                Err(e)
            }
        }
    }

    fn run_hooks(&self, options: &CreateOptions, meta: &MetaRecord) -> Result<()> {
        if let Some(program) = &options.notification_program {
            let json = meta.to_json_bytes()?;
            if let Err(e) = hooks::run_notification_hook(program, &options.output, &json) {
                tracing::warn!(error = %e, "notification hook failed");
            }
        }
        if let Some(url) = &options.upload_url {
            if let Err(e) = hooks::upload_archive(url, &options.output) {
                tracing::warn!(error = %e, "upload hook failed");
            }
        }
        Ok(())
    }
}

fn inside_filename(compression: Option<CompressionMode>) -> String {
    let mut name = format!("{}.tar", crate::meta::BASIC_INSIDE_FILENAME);
    if let Some(mode) = compression {
        name.push('.');
        name.push_str(mode.extension());
    }
    name
}

/// Creates the archive file, runs `emit` to populate the inner tar stream,
/// and patches in the final metadata. `emit` returns the `archived_files`
/// or `archived_program` fragment, since only the caller knows which kind
/// of input it just walked.
fn build_archive<F>(
    options: &CreateOptions,
    snapshot_used: bool,
    original_lv_uuid: String,
    emit: F,
) -> Result<MetaRecord>
where
    F: FnOnce(&mut tar::Builder<CompressingWriter>) -> Result<ArchivedMeta>,
{
    let name = inside_filename(options.compression);
    let (sink, patcher) = TarPatcher::create(&options.output, &name)?;

    let chain_options = ChainOptions {
        hash_algorithm: options.hash_algorithm,
        cipher: options.cipher.clone(),
        io_write_rate: options.io_write_rate,
        cancel_flag: options.cancel_flag.clone(),
    };
    let chain = WriterChain::new(sink, chain_options)?;
    let writer = CompressingWriter::new(chain, options.compression);
    let mut builder = tar::Builder::new(writer);

    let archived = emit(&mut builder)?;

    builder
        .finish()
        .map_err(|e| Error::from_write_boundary(e, None))?;
    let writer = builder
        .into_inner()
        .map_err(|e| Error::from_write_boundary(e, None))?;
    let mut chain = writer.finish()?;
    chain.close()?;
    let chain_meta = chain.meta();

    let meta = assemble_meta_record(
        name,
        archived,
        options.compression,
        snapshot_used,
        original_lv_uuid,
        chain_meta,
    );
    patcher.patch(&meta)?;
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lvm::SnapshotPolicy;

    fn base_options(output: PathBuf, inputs: Vec<PathBuf>) -> CreateOptions {
        CreateOptions {
            inputs: InputSource::Files(inputs),
            output,
            lvm: LvmOptions {
                policy: SnapshotPolicy::Disabled,
                ..LvmOptions::default()
            },
            compression: None,
            cipher: None,
            hash_algorithm: HashAlgorithm::Md5,
            io_write_rate: None,
            cancel_flag: None,
            notification_program: None,
            upload_url: None,
        }
    }

    #[test]
    fn creates_a_plain_archive_from_a_single_file() {
        let src = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(src.path(), b"hello backup").unwrap();
        let out = tempfile::NamedTempFile::new().unwrap();

        let archiver = Archiver::new();
        let options = base_options(out.path().to_path_buf(), vec![src.path().to_path_buf()]);
        let meta = archiver.create(options).unwrap();

        assert_eq!(meta.inside_filename, "archive.tar");
        assert!(!meta.snapshot_used);
        assert!(!meta.hash_value.is_empty());
        assert!(matches!(meta.archived, ArchivedMeta::Files(ref f) if f.len() == 1));

        let len = std::fs::metadata(out.path()).unwrap().len();
        assert_eq!(len % (20 * 512), 0);
    }

    #[test]
    fn missing_input_path_fails_before_touching_the_output() {
        let out = tempfile::NamedTempFile::new().unwrap();
        let archiver = Archiver::new();
        let options = base_options(
            out.path().to_path_buf(),
            vec![PathBuf::from("/no/such/path/for/this/test")],
        );
        let err = archiver.create(options).unwrap_err();
        assert!(err.to_string().contains("invalid input"));
    }

    #[test]
    fn failed_archive_unlinks_the_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.tar");
        let archiver = Archiver::new();
        // A cancel flag set before the first write guarantees a failure
        // partway through, after TarPatcher has already created the file.
        let cancel = Arc::new(AtomicBool::new(true));
        let src = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(src.path(), b"data").unwrap();
        let mut options = base_options(out.clone(), vec![src.path().to_path_buf()]);
        options.cancel_flag = Some(cancel);
        let err = archiver.create(options).unwrap_err();
        assert!(err.is_cancelled());
        assert!(!out.exists());
    }

    #[test]
    fn program_backup_records_the_command_in_metadata() {
        let out = tempfile::NamedTempFile::new().unwrap();
        let archiver = Archiver::new();
        let options = CreateOptions {
            inputs: InputSource::Program("echo -n hi".to_string()),
            ..base_options(out.path().to_path_buf(), vec![])
        };
        let meta = archiver.create(options).unwrap();
        assert!(matches!(meta.archived, ArchivedMeta::Program(ref c) if c == "echo -n hi"));
    }
}
