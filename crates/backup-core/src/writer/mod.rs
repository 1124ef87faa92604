//! The composable byte-sink pipeline: [`WriterLink`] is the stage contract,
//! [`WriterChain`] assembles a concrete stack of stages in front of the
//! archive file.

mod cancel;
mod cipher;
mod hash;
mod throttle;

pub use cancel::CancelLink;
pub use cipher::{CipherLink, CipherSpec};
pub use hash::HashLink;
pub use throttle::ThrottleLink;

use std::collections::HashMap;
use std::io;

use crate::meta::HashAlgorithm;
use crate::tar_patcher::FileSinkLink;
use crate::Result;

/// A single map of metadata fragments contributed by writer chain stages.
pub type MetaMap = HashMap<String, serde_json::Value>;

/// Common contract for a stackable byte-sink stage.
///
/// A link forwards bytes to its downstream link after applying its own
/// transform. `close` is idempotent and cascades downstream exactly once.
pub trait WriterLink: Send {
    fn write(&mut self, buf: &[u8]) -> Result<usize>;
    fn flush(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;

    /// Metadata this stage alone contributes, not including downstream links.
    fn meta(&self) -> MetaMap {
        MetaMap::new()
    }

    /// Human-readable one-line progress, if this stage tracks any.
    fn status(&self) -> Option<String> {
        None
    }

    /// This stage's own fragment, folded with every downstream stage's
    /// fragment, downstream entries winning on key collision.
    fn meta_chain(&self) -> MetaMap {
        self.meta()
    }

    fn status_chain(&self) -> Option<String> {
        self.status()
    }
}

/// Options used to assemble a [`WriterChain`] in front of a [`FileSinkLink`].
pub struct ChainOptions {
    pub hash_algorithm: HashAlgorithm,
    pub cipher: Option<CipherSpec>,
    pub io_write_rate: Option<u64>,
    pub cancel_flag: Option<std::sync::Arc<std::sync::atomic::AtomicBool>>,
}

impl Default for ChainOptions {
    fn default() -> Self {
        ChainOptions {
            hash_algorithm: HashAlgorithm::default(),
            cipher: None,
            io_write_rate: None,
            cancel_flag: None,
        }
    }
}

/// The assembled pipeline: tar entries are written to `head`, the outermost
/// link, which cascades through whichever optional stages are configured
/// down to the file sink.
///
/// Stage application order, innermost first: sink, throttle (optional),
/// hash, cipher (optional), cancel (optional). Writes enter at the
/// outermost configured stage and cascade down to the sink, so the sink's
/// `write` is always the last one called for a given chunk of bytes.
pub struct WriterChain {
    head: Box<dyn WriterLink>,
}

impl WriterChain {
    pub fn new(sink: FileSinkLink, options: ChainOptions) -> Result<Self> {
        let mut head: Box<dyn WriterLink> = Box::new(sink);

        if let Some(rate) = options.io_write_rate {
            head = Box::new(ThrottleLink::new(head, rate));
        }

        head = Box::new(HashLink::new(head, options.hash_algorithm));

        if let Some(spec) = options.cipher {
            head = Box::new(CipherLink::new(head, spec)?);
        }

        if let Some(flag) = options.cancel_flag {
            head = Box::new(CancelLink::new(head, flag));
        }

        Ok(WriterChain { head })
    }

    /// The metadata fragments contributed by every configured stage, merged
    /// into one map.
    pub fn meta(&self) -> MetaMap {
        self.head.meta_chain()
    }

    /// The most specific status string any stage in the chain currently
    /// reports, if any.
    pub fn status(&self) -> Option<String> {
        self.head.status_chain()
    }

    /// Flush and close every stage, innermost write path first (the same
    /// direction writes travel).
    pub fn close(&mut self) -> Result<()> {
        self.head.close()
    }
}

impl io::Write for WriterChain {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.head
            .write(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.head
            .flush()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

/// Shared helper so wrapper links only have to implement their own
/// transform and can delegate the rest to the link they own.
pub(crate) fn fold_chain(own: MetaMap, mut next: MetaMap) -> MetaMap {
    next.extend(own);
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn build_sink() -> (FileSinkLink, tempfile::NamedTempFile) {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let sink = FileSinkLink::create_for_test(tmp.path()).unwrap();
        (sink, tmp)
    }

    #[test]
    fn chain_without_optional_stages_still_hashes() {
        let (sink, _tmp) = build_sink();
        let mut chain = WriterChain::new(sink, ChainOptions::default()).unwrap();
        chain.write_all(b"hello world").unwrap();
        chain.close().unwrap();
        let meta = chain.meta();
        assert!(meta.contains_key("hash_value"));
        assert_eq!(meta.get("hash_algorithm").unwrap(), "MD5");
    }

    #[test]
    fn cancel_link_aborts_before_any_further_writes() {
        let (sink, _tmp) = build_sink();
        let flag = Arc::new(AtomicBool::new(true));
        let opts = ChainOptions {
            cancel_flag: Some(flag),
            ..ChainOptions::default()
        };
        let mut chain = WriterChain::new(sink, opts).unwrap();
        let err = chain.head.write(b"x").unwrap_err();
        assert!(err.is_cancelled());
    }
}
