//! Core library for LVM-snapshot-aware, optionally encrypted and
//! compressed, rate-limited tar archive creation and verification.
//!
//! # Modules
//!
//! - `error` - error types and the `Result` alias
//! - `meta` - the in-archive `meta.json` record and its enums
//! - `tar_patcher` - placeholder-header-then-patch tar writing
//! - `writer` - the composable hash/cipher/throttle/cancel byte-sink chain
//! - `compression` - the gzip/bzip2 wrapper outside the writer chain
//! - `file_archiver` - walks filesystem inputs into tar entries
//! - `program_archiver` - captures a program's stdout as a tar member
//! - `lvm` - snapshot detection, creation, mount and teardown
//! - `archiver` - top-level orchestration and the cleanup contract
//! - `verifier` - archive integrity verification
//! - `hooks` - post-archive notification and upload side effects

pub mod archiver;
pub mod compression;
pub mod error;
pub mod file_archiver;
pub mod hooks;
pub mod lvm;
pub mod meta;
pub mod program_archiver;
pub mod tar_patcher;
pub mod verifier;
pub mod writer;

pub use error::{Error, Result};
