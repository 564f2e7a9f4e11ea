//! Fixed-length records.

use std::cmp::Ordering;
use std::fmt;
use std::slice::ChunksExact;

use crate::error::NetSortError;

/// Record length in bytes.
pub const RECORD_SIZE: usize = 100;
/// Sort key length in bytes. The key is the record prefix.
pub const KEY_SIZE: usize = 10;

/// A single 100-byte record: 10-byte key followed by 90 bytes of opaque payload.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Record([u8; RECORD_SIZE]);

impl Record {
    /// Creates a record from its raw bytes.
    pub fn new(bytes: [u8; RECORD_SIZE]) -> Self {
        Record(bytes)
    }

    /// Creates a record from a slice. Returns [`None`] if the slice is not exactly one record long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Record)
    }

    /// Returns the sort key.
    pub fn key(&self) -> &[u8] {
        &self.0[..KEY_SIZE]
    }

    /// Returns the payload following the key.
    pub fn payload(&self) -> &[u8] {
        &self.0[KEY_SIZE..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Record(")?;
        for byte in self.key() {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

/// Compares records by key as unsigned byte sequences.
pub fn compare_keys(a: &Record, b: &Record) -> Ordering {
    a.key().cmp(b.key())
}

/// Iterator over the records of a flat binary buffer.
pub struct Records<'a> {
    chunks: ChunksExact<'a, u8>,
}

impl<'a> Records<'a> {
    /// Splits `data` into records.
    ///
    /// # Arguments
    /// * `data` - Concatenated records
    /// * `strict` - If set a trailing partial record is an error, otherwise it is dropped
    pub fn split(data: &'a [u8], strict: bool) -> Result<Self, NetSortError> {
        let trailing = data.len() % RECORD_SIZE;
        if trailing != 0 {
            if strict {
                return Err(NetSortError::MalformedInput {
                    len: data.len(),
                    trailing,
                });
            }
            log::warn!(
                "input length {} is not a multiple of {}, dropping {} trailing bytes",
                data.len(),
                RECORD_SIZE,
                trailing
            );
        }

        return Ok(Records {
            chunks: data.chunks_exact(RECORD_SIZE),
        });
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = Record;

    fn next(&mut self) -> Option<Self::Item> {
        self.chunks.next().and_then(Record::from_slice)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}
