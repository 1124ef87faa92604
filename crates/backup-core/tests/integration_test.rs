//! End-to-end tests for the archive pipeline: create, then verify.
//!
//! These exercise the full `Archiver` -> `TarPatcher` -> `Verifier` round
//! trip without touching LVM, since that requires a real volume group and
//! is exercised manually (see DESIGN.md).

use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use backup_core::archiver::{Archiver, CreateOptions, InputSource};
use backup_core::lvm::{LvmOptions, SnapshotPolicy};
use backup_core::meta::{ArchivedMeta, CompressionMode, HashAlgorithm};
use backup_core::verifier::{verify, VerifyOutcome};
use backup_core::writer::CipherSpec;

fn disabled_lvm() -> LvmOptions {
    LvmOptions {
        policy: SnapshotPolicy::Disabled,
        ..LvmOptions::default()
    }
}

fn base_options(output: PathBuf, inputs: Vec<PathBuf>) -> CreateOptions {
    CreateOptions {
        inputs: InputSource::Files(inputs),
        output,
        lvm: disabled_lvm(),
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
fn plain_archive_round_trips_through_the_verifier() {
    let src = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(src.path(), b"a small file worth backing up").unwrap();
    let out = tempfile::NamedTempFile::new().unwrap();

    let archiver = Archiver::new();
    let meta = archiver
        .create(base_options(out.path().to_path_buf(), vec![src.path().to_path_buf()]))
        .unwrap();

    assert_eq!(meta.inside_filename, "archive.tar");
    assert!(!meta.snapshot_used);
    assert!(matches!(meta.archived, ArchivedMeta::Files(ref f) if f.len() == 1));

    let len = std::fs::metadata(out.path()).unwrap().len();
    assert_eq!(len % (20 * 512), 0, "archive must be a multiple of one tar record");

    assert_eq!(verify(out.path()).unwrap(), VerifyOutcome::Pass { cipher_algorithm: None });
}

#[test]
fn gzip_compressed_archive_names_the_member_with_its_extension() {
    let dir = tempfile::tempdir().unwrap();
    let payload = dir.path().join("payload.bin");
    std::fs::write(&payload, vec![b'x'; 64 * 1024]).unwrap();
    let out = tempfile::NamedTempFile::new().unwrap();

    let archiver = Archiver::new();
    let mut options = base_options(out.path().to_path_buf(), vec![payload]);
    options.compression = Some(CompressionMode::Gzip);
    let meta = archiver.create(options).unwrap();

    assert_eq!(meta.inside_filename, "archive.tar.gz");
    assert_eq!(meta.compression_mode.as_deref(), Some("gz"));
    assert_eq!(verify(out.path()).unwrap(), VerifyOutcome::Pass { cipher_algorithm: None });
}

#[test]
fn encrypted_archive_records_pbkdf2_parameters_and_still_verifies() {
    let src = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(src.path(), b"secret payload contents").unwrap();
    let out = tempfile::NamedTempFile::new().unwrap();

    let archiver = Archiver::new();
    let mut options = base_options(out.path().to_path_buf(), vec![src.path().to_path_buf()]);
    options.cipher = Some(CipherSpec::parse("AES-256-CBC", "s3cret").unwrap());
    let meta = archiver.create(options).unwrap();

    assert_eq!(meta.cipher_algorithm.as_deref(), Some("AES-256-CBC"));
    assert!(meta.pbkdf2_salt.as_ref().unwrap().len() >= 16);
    assert!(meta.pbkdf2_iterations_count.unwrap() >= 10_000);

    // The verifier recomputes the hash over ciphertext bytes and needs no
    // password to do so.
    assert!(verify(out.path()).unwrap().is_pass());
}

#[test]
fn empty_input_with_disabled_snapshot_produces_an_empty_but_valid_tar() {
    let out = tempfile::NamedTempFile::new().unwrap();
    let archiver = Archiver::new();
    let meta = archiver
        .create(base_options(out.path().to_path_buf(), vec![]))
        .unwrap();
    assert!(matches!(meta.archived, ArchivedMeta::Files(ref f) if f.is_empty()));
    assert!(verify(out.path()).unwrap().is_pass());
}

#[test]
fn cancellation_leaves_no_partial_archive_behind() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src.txt");
    std::fs::write(&src, b"some data to archive").unwrap();
    let out = dir.path().join("out.tar");

    let cancel = Arc::new(AtomicBool::new(true));
    let mut options = base_options(out.clone(), vec![src]);
    options.cancel_flag = Some(cancel);

    let archiver = Archiver::new();
    let err = archiver.create(options).unwrap_err();
    assert!(err.is_cancelled());
    assert!(!out.exists());
}

#[test]
fn truncating_the_payload_is_caught_as_a_hash_mismatch() {
    let src = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(src.path(), b"payload for a truncation test").unwrap();
    let out = tempfile::NamedTempFile::new().unwrap();

    let archiver = Archiver::new();
    archiver
        .create(base_options(out.path().to_path_buf(), vec![src.path().to_path_buf()]))
        .unwrap();

    let mut file = std::fs::OpenOptions::new().write(true).open(out.path()).unwrap();
    file.seek(SeekFrom::Start(513)).unwrap();
    file.write_all(&[0xff]).unwrap();

    match verify(out.path()).unwrap() {
        VerifyOutcome::Fail(reason) => assert!(reason.contains("hash mismatch")),
        VerifyOutcome::Pass { .. } => panic!("corrupted payload should not verify"),
    }
}

#[test]
fn program_backup_is_recorded_and_verifies() {
    let out = tempfile::NamedTempFile::new().unwrap();
    let archiver = Archiver::new();
    let options = CreateOptions {
        inputs: InputSource::Program("printf hello-from-program".to_string()),
        ..base_options(out.path().to_path_buf(), vec![])
    };
    let meta = archiver.create(options).unwrap();
    assert!(matches!(meta.archived, ArchivedMeta::Program(ref c) if c.contains("hello-from-program")));
    assert!(verify(out.path()).unwrap().is_pass());
}

#[test]
fn failing_program_backup_unlinks_the_archive() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.tar");
    let archiver = Archiver::new();
    let options = CreateOptions {
        inputs: InputSource::Program("exit 3".to_string()),
        ..base_options(out.clone(), vec![])
    };
    assert!(archiver.create(options).is_err());
    assert!(!out.exists());
}
