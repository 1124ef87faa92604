//! Wraps the writer chain's `Write` side with an optional gzip or bzip2
//! encoder.
//!
//! Compression sits *outside* the [`WriterChain`](crate::writer::WriterChain)
//! stack rather than as another [`WriterLink`](crate::writer::WriterLink):
//! it transforms the tar stream before any of hashing, encryption or
//! throttling ever sees it, so it is plain composition over `io::Write`, not
//! a stage with its own metadata contribution.

use std::io::{self, Write};

use bzip2::write::BzEncoder;
use bzip2::Compression as BzCompression;
use flate2::write::GzEncoder;
use flate2::Compression as GzCompression;

use crate::meta::CompressionMode;
use crate::writer::WriterChain;
use crate::{Error, Result};

/// The tar entry emitter's actual `io::Write` target: the writer chain,
/// optionally wrapped in a streaming compressor.
pub enum CompressingWriter {
    Plain(WriterChain),
    Gzip(GzEncoder<WriterChain>),
    Bzip2(BzEncoder<WriterChain>),
}

impl CompressingWriter {
    pub fn new(chain: WriterChain, mode: Option<CompressionMode>) -> Self {
        match mode {
            None => CompressingWriter::Plain(chain),
            Some(CompressionMode::Gzip) => {
                CompressingWriter::Gzip(GzEncoder::new(chain, GzCompression::default()))
            }
            Some(CompressionMode::Bzip2) => {
                CompressingWriter::Bzip2(BzEncoder::new(chain, BzCompression::default()))
            }
        }
    }

    /// Flushes the compressor's trailer, if any, and hands back the chain
    /// underneath so the caller can `close()` it and read its metadata.
    pub fn finish(self) -> Result<WriterChain> {
        match self {
            CompressingWriter::Plain(chain) => Ok(chain),
            CompressingWriter::Gzip(enc) => enc.finish().map_err(Error::io_simple),
            CompressingWriter::Bzip2(enc) => enc.finish().map_err(Error::io_simple),
        }
    }
}

impl Write for CompressingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            CompressingWriter::Plain(w) => w.write(buf),
            CompressingWriter::Gzip(w) => w.write(buf),
            CompressingWriter::Bzip2(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            CompressingWriter::Plain(w) => w.flush(),
            CompressingWriter::Gzip(w) => w.flush(),
            CompressingWriter::Bzip2(w) => w.flush(),
        }
    }
}
