//! Reads an existing archive and confirms its integrity: parses the tar
//! header for member 1, recomputes the hash recorded in `meta.json` over
//! exactly the declared payload bytes, and compares.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use digest::Digest;
use md5::Md5;
use sha2::Sha256;

use crate::meta::{HashAlgorithm, MetaRecord};
use crate::Result;

/// The result of [`verify`]: a structured PASS carrying the cipher
/// algorithm name if the archive is encrypted (so `check --password` can
/// report "yes, encrypted" without the verifier ever touching plaintext),
/// or a FAIL with a human-readable reason (hash mismatch, truncated
/// archive, missing or malformed meta, unsupported algorithm).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Pass { cipher_algorithm: Option<String> },
    Fail(String),
}

impl VerifyOutcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, VerifyOutcome::Pass { .. })
    }
}

/// Verifies `path`. Never mutates the archive. Any failure short of an
/// inability to even open the file is reported as `Fail` with a reason
/// rather than a hard `Err`, since "why did this fail" is exactly what the
/// `check` subcommand needs to print.
pub fn verify(path: &Path) -> Result<VerifyOutcome> {
    match verify_inner(path) {
        Ok(outcome) => Ok(outcome),
        Err(reason) => Ok(VerifyOutcome::Fail(reason)),
    }
}

fn verify_inner(path: &Path) -> std::result::Result<VerifyOutcome, String> {
    let file = File::open(path).map_err(|e| format!("cannot open archive: {e}"))?;
    let mut archive = tar::Archive::new(file);
    let mut entries = archive
        .entries()
        .map_err(|e| format!("cannot read tar entries: {e}"))?;

    let mut first = match entries.next() {
        Some(entry) => entry.map_err(|e| format!("truncated or corrupt archive: {e}"))?,
        None => return Ok(VerifyOutcome::Fail("archive has no members".to_string())),
    };
    let mut payload = Vec::new();
    first
        .read_to_end(&mut payload)
        .map_err(|e| format!("truncated or corrupt archive: {e}"))?;
    drop(first);

    let mut second = match entries.next() {
        Some(entry) => entry.map_err(|e| format!("truncated or corrupt archive: {e}"))?,
        None => return Ok(VerifyOutcome::Fail("archive is missing meta.json".to_string())),
    };
    let mut meta_bytes = Vec::new();
    second
        .read_to_end(&mut meta_bytes)
        .map_err(|e| format!("truncated or corrupt archive: {e}"))?;

    let meta = MetaRecord::from_json_bytes(&meta_bytes).map_err(|e| e.to_string())?;

    let algorithm = match HashAlgorithm::parse(&meta.hash_algorithm) {
        Some(a) => a,
        None => {
            return Ok(VerifyOutcome::Fail(format!(
                "unsupported hash algorithm '{}'",
                meta.hash_algorithm
            )))
        }
    };

    let recomputed = match algorithm {
        HashAlgorithm::Md5 => hex::encode(Md5::digest(&payload)),
        HashAlgorithm::Sha256 => hex::encode(Sha256::digest(&payload)),
    };

    if recomputed != meta.hash_value {
        return Ok(VerifyOutcome::Fail(format!(
            "hash mismatch: recorded {} but recomputed {recomputed}",
            meta.hash_value
        )));
    }

    Ok(VerifyOutcome::Pass {
        cipher_algorithm: meta.cipher_algorithm,
    })
}
