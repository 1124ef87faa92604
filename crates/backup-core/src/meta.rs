//! The in-archive metadata record and the small enums it is built from.

use serde::{Deserialize, Serialize};

pub const META_FILENAME: &str = "meta.json";
pub const MAXIMUM_META_FILESIZE: u64 = 50 * 1024 * 1024;
pub const BASIC_INSIDE_FILENAME: &str = "archive";

/// Compression applied to member 1 before it reaches the writer chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMode {
    Gzip,
    Bzip2,
}

impl CompressionMode {
    /// The tar-member-name suffix this mode contributes, e.g. `.gz`.
    pub fn extension(self) -> &'static str {
        match self {
            CompressionMode::Gzip => "gz",
            CompressionMode::Bzip2 => "bz2",
        }
    }

    /// The string stored in `meta.json`'s `compression_mode` field.
    pub fn as_meta_str(self) -> &'static str {
        self.extension()
    }
}

/// The digest algorithm used by `HashLink`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha256,
}

impl HashAlgorithm {
    pub fn as_meta_str(self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "MD5",
            HashAlgorithm::Sha256 => "SHA256",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "MD5" => Some(HashAlgorithm::Md5),
            "SHA256" => Some(HashAlgorithm::Sha256),
            _ => None,
        }
    }
}

impl Default for HashAlgorithm {
    fn default() -> Self {
        HashAlgorithm::Md5
    }
}

/// The trailing `meta.json` record embedded as member 2 of every archive.
///
/// Field names match the stable keys of the metadata record; unknown keys
/// encountered while deserializing an archive written by a newer or older
/// version of this tool are preserved in `extra` and re-emitted unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaRecord {
    pub inside_filename: String,

    #[serde(flatten)]
    pub archived: ArchivedMeta,

    pub compression_mode: Option<String>,

    pub hash_algorithm: String,
    pub hash_value: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cipher_algorithm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pbkdf2_salt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pbkdf2_prf: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pbkdf2_iterations_count: Option<u32>,

    pub snapshot_used: bool,
    pub original_lv_uuid: String,

    pub io_write_rate: Option<u64>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// `archived_files` or `archived_program`, flattened into [`MetaRecord`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ArchivedMeta {
    #[serde(rename = "archived_files")]
    Files(Vec<String>),
    #[serde(rename = "archived_program")]
    Program(String),
}

impl MetaRecord {
    /// Serialize to the exact UTF-8 JSON bytes written as the `meta.json`
    /// tar member.
    pub fn to_json_bytes(&self) -> crate::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| crate::Error::integrity(format!("failed to serialize meta.json: {e}")))
    }

    /// Parse a `meta.json` member's bytes back into a record.
    pub fn from_json_bytes(bytes: &[u8]) -> crate::Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| crate::Error::integrity(format!("malformed meta.json: {e}")))
    }
}
