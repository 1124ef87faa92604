//! CLI for creating and verifying LVM-aware, optionally encrypted and
//! compressed, rate-limited backup archives.
//!
//! This binary is the thin collaborator described by the core library's
//! external interface: it parses arguments into already-validated,
//! already-typed options (§6 of the design notes), wires up a logger and a
//! cancel flag, and hands everything off to [`backup_core::archiver`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use backup_core::archiver::{Archiver, CreateOptions, InputSource};
use backup_core::lvm::{LvmOptions, SnapshotPolicy};
use backup_core::meta::{CompressionMode, HashAlgorithm};
use backup_core::verifier::{self, VerifyOutcome};
use backup_core::writer::CipherSpec;

#[derive(Parser)]
#[command(name = "backup")]
#[command(version, about = "LVM-snapshot-aware, encrypted, rate-limited tar archives", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Archive a set of filesystem paths.
    #[command(alias = "file-backup")]
    Create(CreateArgs),

    /// Archive the standard output of an external program.
    ProgramBackup(ProgramBackupArgs),

    /// Verify the integrity of an existing archive.
    Check(CheckArgs),
}

#[derive(Parser)]
struct CreateArgs {
    /// One or more source paths.
    #[arg(long = "input", required = true)]
    input: Vec<PathBuf>,

    /// Archive file to write.
    #[arg(long)]
    output: PathBuf,

    /// Allow privilege elevation for LVM/mount calls.
    #[arg(long)]
    sudo: bool,

    /// Snapshot policy: auto, forced or disabled.
    #[arg(long, default_value = "auto")]
    snapshot: String,

    /// Fraction of the origin volume's extents to allocate to the snapshot.
    #[arg(long, default_value_t = 0.1)]
    snapshot_volume_size: f64,

    /// Explicit directory to mount the snapshot at.
    #[arg(long)]
    snapshot_mount_dir: Option<PathBuf>,

    /// Compression applied to the payload: gzip, bzip2 or disabled.
    #[arg(long, default_value = "disabled")]
    compression: String,

    /// Password enabling encryption of the payload.
    #[arg(long)]
    password: Option<String>,

    /// Cipher used when `--password` is set.
    #[arg(long, default_value = "AES-256-CBC")]
    cipher_algorithm: String,

    /// Byte-rate cap, e.g. `1M`, `512K`, `2G`.
    #[arg(long)]
    io_write_rate: Option<String>,

    /// Program to notify on completion, invoked as `<archive> <meta_tempfile>`.
    #[arg(long)]
    notification_program: Option<PathBuf>,

    /// URL to upload the finished archive to via `curl -T`.
    #[arg(long)]
    upload_url: Option<String>,
}

#[derive(Parser)]
struct ProgramBackupArgs {
    /// External program whose stdout is archived.
    #[arg(long = "input-program")]
    input_program: String,

    /// Archive file to write.
    #[arg(long)]
    output: PathBuf,

    /// Compression applied to the payload: gzip, bzip2 or disabled.
    #[arg(long, default_value = "disabled")]
    compression: String,

    /// Password enabling encryption of the payload.
    #[arg(long)]
    password: Option<String>,

    /// Cipher used when `--password` is set.
    #[arg(long, default_value = "AES-256-CBC")]
    cipher_algorithm: String,

    /// Byte-rate cap, e.g. `1M`, `512K`, `2G`.
    #[arg(long)]
    io_write_rate: Option<String>,

    /// Program to notify on completion, invoked as `<archive> <meta_tempfile>`.
    #[arg(long)]
    notification_program: Option<PathBuf>,

    /// URL to upload the finished archive to via `curl -T`.
    #[arg(long)]
    upload_url: Option<String>,
}

#[derive(Parser)]
struct CheckArgs {
    /// Archive file to verify.
    #[arg(long)]
    archive: PathBuf,

    /// Unused by the verifier itself; accepted so `check` can report
    /// "encrypted" without ever touching plaintext, since the hash it
    /// recomputes already covers ciphertext bytes.
    #[arg(long)]
    password: Option<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Create(args) => run_create(args),
        Commands::ProgramBackup(args) => run_program_backup(args),
        Commands::Check(args) => run_check(&args.archive),
    };

    if let Err(e) = &result {
        tracing::error!(error = %e, "backup command failed");
    }
    result
}

/// Parses a byte-rate suffix (`K`/`M`/`G`/`T`, binary multiples) into a
/// plain byte count. A bare number with no suffix is bytes per second.
fn parse_rate(s: &str) -> anyhow::Result<u64> {
    let s = s.trim();
    let (digits, multiplier) = match s.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => {
            let multiplier = match c.to_ascii_uppercase() {
                'K' => 1024u64,
                'M' => 1024 * 1024,
                'G' => 1024 * 1024 * 1024,
                'T' => 1024u64 * 1024 * 1024 * 1024,
                other => bail!("unknown rate suffix '{other}': expected one of K, M, G, T"),
            };
            (&s[..s.len() - 1], multiplier)
        }
        _ => (s, 1),
    };
    let value: u64 = digits
        .parse()
        .with_context(|| format!("invalid io-write-rate value '{s}'"))?;
    Ok(value * multiplier)
}

fn build_cipher(password: Option<String>, cipher_algorithm: &str) -> anyhow::Result<Option<CipherSpec>> {
    match password {
        None => Ok(None),
        Some(password) => {
            let spec = CipherSpec::parse(cipher_algorithm, password)
                .with_context(|| format!("invalid --cipher-algorithm '{cipher_algorithm}'"))?;
            Ok(Some(spec))
        }
    }
}

fn build_compression(compression: &str) -> anyhow::Result<Option<CompressionMode>> {
    match compression.to_ascii_lowercase().as_str() {
        "gzip" => Ok(Some(CompressionMode::Gzip)),
        "bzip2" => Ok(Some(CompressionMode::Bzip2)),
        "disabled" => Ok(None),
        other => bail!("unknown --compression value '{other}': expected gzip, bzip2 or disabled"),
    }
}

/// Registers a Ctrl-C handler that flips the shared cancel flag exactly
/// once; a second Ctrl-C falls through to the process default so an
/// operator is never stuck waiting on a non-preemptible suspension point.
fn install_cancel_handler() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = flag.clone();
    let _ = ctrlc::set_handler(move || {
        if handler_flag.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        tracing::warn!("cancellation requested, finishing the current write and cleaning up");
    });
    flag
}

fn run_create(args: CreateArgs) -> anyhow::Result<()> {
    for path in &args.input {
        if !path.exists() {
            bail!("input path '{}' does not exist", path.display());
        }
    }

    let policy = SnapshotPolicy::parse(&args.snapshot)?;
    if args.snapshot_volume_size <= 0.0 {
        bail!("--snapshot-volume-size must be greater than 0");
    }
    let compression = build_compression(&args.compression)?;
    let cipher = build_cipher(args.password, &args.cipher_algorithm)?;
    let io_write_rate = args.io_write_rate.as_deref().map(parse_rate).transpose()?;
    let cancel_flag = install_cancel_handler();

    let options = CreateOptions {
        inputs: InputSource::Files(args.input),
        output: args.output.clone(),
        lvm: LvmOptions {
            policy,
            sudo: args.sudo,
            snapshot_fraction: args.snapshot_volume_size,
            mount_dir: args.snapshot_mount_dir,
        },
        compression,
        cipher,
        hash_algorithm: HashAlgorithm::default(),
        io_write_rate,
        cancel_flag: Some(cancel_flag),
        notification_program: args.notification_program,
        upload_url: args.upload_url,
    };

    let archiver = Archiver::new();
    let last_file = archiver.last_file_handle();
    let spinner = spawn_progress_spinner(last_file);
    let outcome = archiver
        .create(options)
        .with_context(|| format!("failed to create archive '{}'", args.output.display()));
    spinner.finish_and_clear();
    outcome?;
    println!("Archive \"{}\" was created successfully", args.output.display());
    Ok(())
}

/// A background spinner that polls the archiver's shared "last file"
/// progress field, matching how a controlling collaborator is expected to
/// read `status()`/`last_file` from another thread while archiving runs.
fn spawn_progress_spinner(last_file: backup_core::file_archiver::LastFile) -> indicatif::ProgressBar {
    let bar = indicatif::ProgressBar::new_spinner();
    bar.set_style(
        indicatif::ProgressStyle::with_template("{spinner} archiving {wide_msg}")
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_spinner()),
    );
    bar.enable_steady_tick(std::time::Duration::from_millis(120));
    let tick = bar.clone();
    std::thread::spawn(move || loop {
        if tick.is_finished() {
            return;
        }
        if let Some(name) = last_file.get() {
            tick.set_message(name);
        }
        std::thread::sleep(std::time::Duration::from_millis(150));
    });
    bar
}

fn run_program_backup(args: ProgramBackupArgs) -> anyhow::Result<()> {
    let compression = build_compression(&args.compression)?;
    let cipher = build_cipher(args.password, &args.cipher_algorithm)?;
    let io_write_rate = args.io_write_rate.as_deref().map(parse_rate).transpose()?;
    let cancel_flag = install_cancel_handler();

    let options = CreateOptions {
        inputs: InputSource::Program(args.input_program),
        output: args.output.clone(),
        lvm: LvmOptions {
            policy: SnapshotPolicy::Disabled,
            ..LvmOptions::default()
        },
        compression,
        cipher,
        hash_algorithm: HashAlgorithm::default(),
        io_write_rate,
        cancel_flag: Some(cancel_flag),
        notification_program: args.notification_program,
        upload_url: args.upload_url,
    };

    let archiver = Archiver::new();
    archiver
        .create(options)
        .with_context(|| format!("failed to create archive '{}'", args.output.display()))?;
    println!("Archive \"{}\" was created successfully", args.output.display());
    Ok(())
}

fn run_check(archive: &std::path::Path) -> anyhow::Result<()> {
    match verifier::verify(archive)? {
        VerifyOutcome::Pass { cipher_algorithm } => {
            match cipher_algorithm {
                Some(alg) => println!("PASS: archive is valid (encrypted with {alg})"),
                None => println!("PASS: archive is valid"),
            }
            Ok(())
        }
        VerifyOutcome::Fail(reason) => {
            bail!("FAIL: {reason}");
        }
    }
}
