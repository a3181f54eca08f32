//! C7 — SHA-256 over a stream, hex codec.

use std::io::{self, Read, Write};

use sha2::{Digest, Sha256};

/// Streaming hasher so the indexer (C10) and the upload session manager
/// (C11) can hash a blob without buffering it in memory.
#[derive(Default)]
pub struct StreamHasher {
    inner: Sha256,
}

impl StreamHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    pub fn finish(self) -> Vec<u8> {
        self.inner.finalize().to_vec()
    }

    /// Hashes everything readable from `reader`, consuming it.
    pub fn hash_reader(mut reader: impl Read) -> io::Result<Vec<u8>> {
        let mut hasher = Self::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finish())
    }
}

impl Write for StreamHasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn to_hex(hash: &[u8]) -> String {
    hex::encode(hash)
}

pub fn from_hex(hex_str: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(hex_str)
}
