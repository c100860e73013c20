//! WriteBatch holds a collection of updates to apply atomically to a DB.
//!
//! The updates are applied in the order in which they are added to the
//! batch. For example, the value of "key" will be "v3" after the
//! following batch is written:
//!
//! ```ignore
//! batch.put(b"key", b"v1");
//! batch.delete(b"key");
//! batch.put(b"key", b"v2");
//! batch.put(b"key", b"v3");
//! ```
//!
//! The representation is also the write-ahead log record format:
//!
//! ```text
//! sequence: fixed64
//! count: fixed32
//! data: record[count]
//! record :=
//!    Value    varstring varstring
//!    Deletion varstring
//! varstring :=
//!    len: varint32
//!    data: uint8[len]
//! ```

use crate::coding::{
    decode_fixed32, decode_fixed64, encode_fixed32, encode_fixed64, put_length_prefixed_slice,
    Decoder,
};
use crate::db::key_types::{SequenceNumber, ValueType};
use crate::error::LsmKvError;
use crate::memory::MemTable;
use crate::Result;

/// WriteBatch header has an 8-byte sequence number followed by a 4-byte count.
pub(crate) const HEADER_SIZE: usize = 12;

#[derive(Clone)]
pub struct WriteBatch {
    rep: Vec<u8>,
}

/// Callbacks for [`WriteBatch::iterate`].
pub trait WriteBatchHandler {
    fn put(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
}

/// One decoded update. `head` is the encoded record up to, but not
/// including, the value bytes, so `head ++ value` is the whole record.
pub(crate) struct Record<'a> {
    pub value_type: ValueType,
    pub key: &'a [u8],
    pub value: &'a [u8],
    pub head: &'a [u8],
}

pub(crate) struct Records<'a> {
    input: &'a [u8],
    remaining: u32,
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<Record<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.input.is_empty() {
            if self.remaining != 0 {
                self.remaining = 0;
                return Some(Err(LsmKvError::corruption("WriteBatch has wrong count")));
            }
            return None;
        }
        let record = self.decode_record();
        if record.is_err() {
            self.input = &[];
            self.remaining = 0;
        } else {
            self.remaining = self.remaining.wrapping_sub(1);
        }
        Some(record)
    }
}

impl<'a> Records<'a> {
    fn decode_record(&mut self) -> Result<Record<'a>> {
        let start = self.input;
        let mut decoder = Decoder::new(start);
        let tag = decoder
            .byte()
            .ok_or_else(|| LsmKvError::corruption("truncated WriteBatch record"))?;
        let record = match ValueType::from_u8(tag) {
            Some(ValueType::Value) => {
                let key = decoder
                    .length_prefixed_slice()
                    .ok_or_else(|| LsmKvError::corruption("bad WriteBatch Put"))?;
                let value = decoder
                    .length_prefixed_slice()
                    .ok_or_else(|| LsmKvError::corruption("bad WriteBatch Put"))?;
                let value_offset = start.len() - decoder.remaining().len() - value.len();
                Record {
                    value_type: ValueType::Value,
                    key,
                    value,
                    head: &start[..value_offset],
                }
            }
            Some(ValueType::Deletion) => {
                let key = decoder
                    .length_prefixed_slice()
                    .ok_or_else(|| LsmKvError::corruption("bad WriteBatch Delete"))?;
                let len = start.len() - decoder.remaining().len();
                Record {
                    value_type: ValueType::Deletion,
                    key,
                    value: &[],
                    head: &start[..len],
                }
            }
            None => return Err(LsmKvError::corruption("unknown WriteBatch tag")),
        };
        self.input = decoder.remaining();
        Ok(record)
    }
}

impl Default for WriteBatch {
    fn default() -> Self {
        WriteBatch::new()
    }
}

impl WriteBatch {
    pub fn new() -> WriteBatch {
        WriteBatch {
            rep: vec![0; HEADER_SIZE],
        }
    }

    /// Store the mapping "key->value" in the database.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::Value as u8);
        put_length_prefixed_slice(&mut self.rep, key);
        put_length_prefixed_slice(&mut self.rep, value);
    }

    /// If the database contains a mapping for "key", erase it. Else do nothing.
    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::Deletion as u8);
        put_length_prefixed_slice(&mut self.rep, key);
    }

    /// Clear all updates buffered in this batch.
    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(HEADER_SIZE, 0);
    }

    /// The size of the database changes caused by this batch.
    ///
    /// This number is tied to implementation details, and may change across
    /// releases. It is intended for usage metrics.
    #[inline]
    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    /// Number of entries in the batch.
    #[inline]
    pub fn count(&self) -> u32 {
        decode_fixed32(&self.rep[8..])
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Copies the operations in `source` to this batch.
    pub fn append(&mut self, source: &WriteBatch) {
        self.set_count(self.count() + source.count());
        self.rep.extend_from_slice(&source.rep[HEADER_SIZE..]);
    }

    /// Support for iterating over the contents of a batch.
    pub fn iterate(&self, handler: &mut dyn WriteBatchHandler) -> Result<()> {
        for record in self.records() {
            let record = record?;
            match record.value_type {
                ValueType::Value => handler.put(record.key, record.value),
                ValueType::Deletion => handler.delete(record.key),
            }
        }
        Ok(())
    }

    pub(crate) fn records(&self) -> Records<'_> {
        Records {
            input: &self.rep[HEADER_SIZE..],
            remaining: self.count(),
        }
    }

    #[inline]
    pub(crate) fn sequence(&self) -> SequenceNumber {
        decode_fixed64(&self.rep)
    }

    pub(crate) fn set_sequence(&mut self, seq: SequenceNumber) {
        encode_fixed64(&mut self.rep, seq)
    }

    fn set_count(&mut self, n: u32) {
        encode_fixed32(&mut self.rep[8..], n)
    }

    #[inline]
    pub(crate) fn contents(&self) -> &[u8] {
        &self.rep
    }

    /// Replace the batch with a record read back from the log.
    pub(crate) fn set_contents(&mut self, contents: &[u8]) -> Result<()> {
        if contents.len() < HEADER_SIZE {
            return Err(LsmKvError::corruption("log record too small"));
        }
        self.rep.clear();
        self.rep.extend_from_slice(contents);
        Ok(())
    }

    /// Apply every update to `mem`, numbering them from the batch sequence.
    pub(crate) fn insert_into(&self, mem: &MemTable) -> Result<()> {
        let mut sequence = self.sequence();
        for record in self.records() {
            let record = record?;
            mem.add(sequence, record.value_type, record.key, record.value);
            sequence += 1;
        }
        Ok(())
    }
}
