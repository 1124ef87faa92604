use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{MetaMap, WriterLink};
use crate::{Error, Result};

/// Polls a shared "stop requested" flag before every write and fails with
/// [`Error::Cancelled`] once it is observed set.
///
/// The flag is passed in explicitly by the caller, never read from process-
/// global state.
pub struct CancelLink {
    next: Box<dyn WriterLink>,
    flag: Arc<AtomicBool>,
}

impl CancelLink {
    pub fn new(next: Box<dyn WriterLink>, flag: Arc<AtomicBool>) -> Self {
        CancelLink { next, flag }
    }

    fn check(&self) -> Result<()> {
        if self.flag.load(Ordering::Relaxed) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

impl WriterLink for CancelLink {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.check()?;
        self.next.write(buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.next.flush()
    }

    fn close(&mut self) -> Result<()> {
        self.next.close()
    }

    fn meta(&self) -> MetaMap {
        MetaMap::new()
    }

    fn meta_chain(&self) -> MetaMap {
        self.next.meta_chain()
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
    fn forwards_writes_while_flag_is_clear() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let sink = FileSinkLink::create_for_test(tmp.path()).unwrap();
        let flag = Arc::new(AtomicBool::new(false));
        let mut link = CancelLink::new(Box::new(sink), flag);
        assert_eq!(link.write(b"data").unwrap(), 4);
    }

    #[test]
    fn fails_with_cancelled_once_flag_is_set() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let sink = FileSinkLink::create_for_test(tmp.path()).unwrap();
        let flag = Arc::new(AtomicBool::new(false));
        let mut link = CancelLink::new(Box::new(sink), flag.clone());
        link.write(b"before").unwrap();
        flag.store(true, Ordering::Relaxed);
        let err = link.write(b"after").unwrap_err();
        assert!(err.is_cancelled());
    }
}
