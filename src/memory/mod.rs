//! Memory table
//!
//! Recent writes live in a skip list keyed by internal key. Each entry is a
//! single arena allocation:
//!
//! ```text
//! varint32(internal_key.len()) internal_key varint32(value.len()) value
//! ```

use crate::coding::{get_length_prefixed_slice, get_varint32, put_varint32, varint_length};
use crate::collections::skip_list::skiplist::{EntryHandle, KeyComparator, Position, SkipList};
use crate::comparator::Comparator;
use crate::db::key_types::{
    pack_sequence_and_type, InternalKeyComparator, LookupKey, SequenceNumber, ValueType,
    TRAILER_LEN,
};
use crate::iterator::KvIterator;
use crate::Result;
use std::cmp::Ordering;
use std::sync::Arc;

struct MemKeyComparator(InternalKeyComparator);

impl KeyComparator for MemKeyComparator {
    fn compare_key(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.0.compare(internal_key_of(a), internal_key_of(b))
    }
}

#[inline]
fn internal_key_of(entry: &[u8]) -> &[u8] {
    match get_length_prefixed_slice(entry) {
        Some((key, _)) => key,
        None => &[],
    }
}

#[inline]
fn value_of(entry: &[u8]) -> &[u8] {
    let (key_len, n) = get_varint32(entry).unwrap_or((0, 0));
    match get_length_prefixed_slice(&entry[n + key_len as usize..]) {
        Some((value, _)) => value,
        None => &[],
    }
}

/// Outcome of a memtable lookup.
#[derive(Debug, PartialEq, Eq)]
pub enum LookupResult {
    Value(Vec<u8>),
    /// A deletion masks any older entry for the key.
    Deleted,
    NotFound,
}

/// Table in Memory
pub struct MemTable {
    comparator: InternalKeyComparator,
    table: SkipList<MemKeyComparator>,
}

/// An entry just added to a [`MemTable`].
pub struct MemEntry<'a> {
    handle: EntryHandle<'a>,
}

impl<'a> MemEntry<'a> {
    /// The value bytes as stored in the arena.
    pub fn value(&self) -> &'a [u8] {
        value_of(self.handle.key())
    }

    /// Hide the entry from all readers, used to undo a failed write.
    pub fn rollback(&self) {
        self.handle.mark_dead()
    }
}

impl MemTable {
    pub fn new(comparator: InternalKeyComparator) -> MemTable {
        MemTable {
            table: SkipList::new(MemKeyComparator(comparator.clone())),
            comparator,
        }
    }

    pub fn approximate_memory_usage(&self) -> usize {
        self.table.memory_usage()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Add an entry that maps `key` to `value` at `sequence`.
    /// Typically `value` is empty if `value_type` is `Deletion`.
    pub fn add(
        &self,
        sequence: SequenceNumber,
        value_type: ValueType,
        key: &[u8],
        value: &[u8],
    ) -> MemEntry<'_> {
        let internal_key_len = key.len() + TRAILER_LEN;
        let encoded_len = varint_length(internal_key_len as u64)
            + internal_key_len
            + varint_length(value.len() as u64)
            + value.len();
        let handle = self.table.insert_with(encoded_len, |buf| {
            let mut header = Vec::with_capacity(10);
            put_varint32(&mut header, internal_key_len as u32);
            let mut offset = header.len();
            buf[..offset].copy_from_slice(&header);
            buf[offset..offset + key.len()].copy_from_slice(key);
            offset += key.len();
            buf[offset..offset + TRAILER_LEN]
                .copy_from_slice(&pack_sequence_and_type(sequence, value_type).to_le_bytes());
            offset += TRAILER_LEN;
            header.clear();
            put_varint32(&mut header, value.len() as u32);
            buf[offset..offset + header.len()].copy_from_slice(&header);
            offset += header.len();
            buf[offset..].copy_from_slice(value);
        });
        MemEntry { handle }
    }

    /// Look up the newest entry for `key` visible at the key's sequence.
    pub fn get(&self, key: &LookupKey) -> LookupResult {
        let pos = self.table.seek(key.memtable_key());
        if !pos.is_valid() {
            return LookupResult::NotFound;
        }
        // The entry found is the first one at or after the probe, so it can
        // only belong to a different user key or be an older version of it.
        let entry = self.table.key(pos);
        let internal_key = internal_key_of(entry);
        if internal_key.len() < TRAILER_LEN
            || self.comparator.user_comparator().compare(
                &internal_key[..internal_key.len() - TRAILER_LEN],
                key.user_key(),
            ) != Ordering::Equal
        {
            return LookupResult::NotFound;
        }
        let tag = crate::db::key_types::extract_tag(internal_key);
        match ValueType::from_u8((tag & 0xff) as u8) {
            Some(ValueType::Value) => LookupResult::Value(value_of(entry).to_vec()),
            Some(ValueType::Deletion) => LookupResult::Deleted,
            None => LookupResult::NotFound,
        }
    }

    pub fn iter(self: &Arc<Self>) -> MemTableIterator {
        MemTableIterator {
            mem: self.clone(),
            pos: Position::INVALID,
            tmp: Vec::new(),
        }
    }
}

/// Iterator over a memtable. Keys are internal keys.
pub struct MemTableIterator {
    mem: Arc<MemTable>,
    pos: Position,
    tmp: Vec<u8>,
}

impl KvIterator for MemTableIterator {
    fn valid(&self) -> bool {
        self.pos.is_valid()
    }

    fn seek_to_first(&mut self) {
        self.pos = self.mem.table.seek_to_first();
    }

    fn seek_to_last(&mut self) {
        self.pos = self.mem.table.seek_to_last();
    }

    fn seek(&mut self, target: &[u8]) {
        self.tmp.clear();
        put_varint32(&mut self.tmp, target.len() as u32);
        self.tmp.extend_from_slice(target);
        self.pos = self.mem.table.seek(&self.tmp);
    }

    fn next(&mut self) {
        self.pos = self.mem.table.next(self.pos);
    }

    fn prev(&mut self) {
        self.pos = self.mem.table.prev(self.pos);
    }

    fn key(&self) -> &[u8] {
        internal_key_of(self.mem.table.key(self.pos))
    }

    fn value(&self) -> &[u8] {
        value_of(self.mem.table.key(self.pos))
    }

    fn status(&self) -> Result<()> {
        Ok(())
    }
}
