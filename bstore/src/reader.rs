use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use crate::error;
use crate::pair::{fnv1a_init, fnv1a_update, Pair};

/// A read-only stream over one value region. Each reader owns its own file
/// handle and seek position, independent of any writer or other reader.
pub struct DataReader {
    file: File,
    pair: Pair,
    remaining: i64,
    hash: u64,
}

impl DataReader {
    pub(crate) fn open(path: &Path, pair: Pair) -> io::Result<Self> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(pair.value as u64))?;
        Ok(Self {
            file,
            pair,
            remaining: pair.size,
            hash: fnv1a_init(),
        })
    }

    pub fn pair(&self) -> &Pair {
        &self.pair
    }

    pub fn size(&self) -> i64 {
        self.pair.size
    }

    /// Verification only happens on full consumption; a partial `Read` that
    /// gets dropped early is unverified.
    pub fn read_to_vec(mut self) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; self.remaining.max(0) as usize];
        self.file.read_exact(&mut buf)?;
        fnv1a_update(&mut self.hash, &buf);
        self.remaining = 0;
        if self.hash != self.pair.hash {
            return Err(error::corrupt("value hash mismatch"));
        }
        Ok(buf)
    }
}

impl Read for DataReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let cap = out.len().min(self.remaining.max(0) as usize);
        if cap == 0 {
            return Ok(0);
        }
        let n = self.file.read(&mut out[..cap])?;
        fnv1a_update(&mut self.hash, &out[..n]);
        self.remaining -= n as i64;
        Ok(n)
    }
}
