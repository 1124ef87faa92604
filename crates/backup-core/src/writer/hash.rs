use digest::Digest;
use md5::Md5;
use sha2::Sha256;

use super::{fold_chain, MetaMap, WriterLink};
use crate::meta::HashAlgorithm;
use crate::Result;

enum Hasher {
    Md5(Md5),
    Sha256(Sha256),
}

impl Hasher {
    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => Digest::update(h, data),
            Hasher::Sha256(h) => Digest::update(h, data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Hasher::Md5(h) => hex::encode(h.finalize()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

/// Member 1's declared size is always a multiple of this many bytes.
const ALIGN: u64 = 512;

/// Streaming cryptographic digest over every byte it forwards downstream.
///
/// The digest is finalized on [`close`](WriterLink::close); `meta()` before
/// close reports no hash fields at all rather than an interim value. Since
/// this is the last stage downstream of compression and encryption but
/// upstream of the file sink, `close` also pads the stream with NUL bytes
/// up to the next 512-byte boundary *through* the hasher and the downstream
/// links, so the digest covers exactly the bytes `TarPatcher` later declares
/// as member 1's size — not a truncated prefix of them.
pub struct HashLink {
    next: Box<dyn WriterLink>,
    algorithm: HashAlgorithm,
    hasher: Option<Hasher>,
    total_len: u64,
    finalized: Option<String>,
}

impl HashLink {
    pub fn new(next: Box<dyn WriterLink>, algorithm: HashAlgorithm) -> Self {
        let hasher = match algorithm {
            HashAlgorithm::Md5 => Hasher::Md5(Md5::new()),
            HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
        };
        HashLink {
            next,
            algorithm,
            hasher: Some(hasher),
            total_len: 0,
            finalized: None,
        }
    }
}

impl WriterLink for HashLink {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(buf);
        }
        self.total_len += buf.len() as u64;
        self.next.write(buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.next.flush()
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut hasher) = self.hasher.take() {
            let pad_len = (ALIGN - (self.total_len % ALIGN)) % ALIGN;
            if pad_len > 0 {
                let pad = vec![0u8; pad_len as usize];
                hasher.update(&pad);
                self.next.write(&pad)?;
            }
            self.finalized = Some(hasher.finalize_hex());
        }
        self.next.close()
    }

    fn meta(&self) -> MetaMap {
        let mut m = MetaMap::new();
        if let Some(value) = &self.finalized {
            m.insert(
                "hash_algorithm".to_string(),
                self.algorithm.as_meta_str().into(),
            );
            m.insert("hash_value".to_string(), value.clone().into());
        }
        m
    }

    fn meta_chain(&self) -> MetaMap {
        fold_chain(self.meta(), self.next.meta_chain())
    }

    fn status_chain(&self) -> Option<String> {
        self.next.status_chain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tar_patcher::FileSinkLink;

    #[test]
    fn finalizes_only_on_close() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let sink = FileSinkLink::create_for_test(tmp.path()).unwrap();
        let mut link = HashLink::new(Box::new(sink), HashAlgorithm::Md5);
        link.write(b"abc").unwrap();
        assert!(link.meta().is_empty());
        link.close().unwrap();
        let meta = link.meta();
        // close() pads to the next 512-byte boundary through the hasher, so
        // the digest covers "abc" plus 509 NUL bytes, matching what
        // TarPatcher declares as member 1's size.
        let mut padded = [0u8; 512];
        padded[..3].copy_from_slice(b"abc");
        let want = hex::encode(Md5::digest(padded));
        assert_eq!(meta.get("hash_value").unwrap().as_str().unwrap(), want);
    }

    #[test]
    fn sha256_variant_is_selectable() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let sink = FileSinkLink::create_for_test(tmp.path()).unwrap();
        let mut link = HashLink::new(Box::new(sink), HashAlgorithm::Sha256);
        link.write(b"abc").unwrap();
        link.close().unwrap();
        let meta = link.meta();
        assert_eq!(meta.get("hash_algorithm").unwrap(), "SHA256");
        let mut padded = [0u8; 512];
        padded[..3].copy_from_slice(b"abc");
        let want = hex::encode(Sha256::digest(padded));
        assert_eq!(
            meta.get("hash_value").unwrap().as_str().unwrap(),
            want
        );
    }
}
