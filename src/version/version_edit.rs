use crate::coding::{put_length_prefixed_slice, put_varint32, put_varint64, Decoder};
use crate::db::key_types::{InternalKey, SequenceNumber};
use crate::db::options::NUM_LEVELS;
use crate::error::LsmKvError;
use crate::Result;
use std::collections::BTreeSet;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicI64, Ordering};

/// Tag numbers for serialized VersionEdit. These numbers are written to
/// disk and should not be changed.
mod tag {
    pub const COMPARATOR: u32 = 1;
    pub const LOG_NUMBER: u32 = 2;
    pub const NEXT_FILE_NUMBER: u32 = 3;
    pub const LAST_SEQUENCE: u32 = 4;
    pub const COMPACT_POINTER: u32 = 5;
    pub const DELETED_FILE: u32 = 6;
    pub const NEW_FILE: u32 = 7;
    // 8 was used for large value refs
    pub const PREV_LOG_NUMBER: u32 = 9;
}

pub struct FileMetaData {
    pub number: u64,
    /// File size in bytes
    pub file_size: u64,
    /// Smallest internal key served by table
    pub smallest: InternalKey,
    /// Largest internal key served by table
    pub largest: InternalKey,
    /// Seeks allowed until compaction
    pub allowed_seeks: AtomicI64,
}

impl FileMetaData {
    pub fn new(number: u64, file_size: u64, smallest: InternalKey, largest: InternalKey) -> FileMetaData {
        FileMetaData {
            number,
            file_size,
            smallest,
            largest,
            allowed_seeks: AtomicI64::new(1 << 30),
        }
    }
}

impl Clone for FileMetaData {
    fn clone(&self) -> Self {
        FileMetaData {
            number: self.number,
            file_size: self.file_size,
            smallest: self.smallest.clone(),
            largest: self.largest.clone(),
            allowed_seeks: AtomicI64::new(self.allowed_seeks.load(Ordering::Relaxed)),
        }
    }
}

impl Debug for FileMetaData {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "#{}({} bytes) [{:?} .. {:?}]",
            self.number, self.file_size, self.smallest, self.largest
        )
    }
}

/// A delta applied to a version: files added and removed per level,
/// plus bookkeeping numbers. Persisted as one manifest record.
#[derive(Default)]
pub struct VersionEdit {
    pub comparator: Option<String>,
    pub log_number: Option<u64>,
    pub prev_log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<SequenceNumber>,
    pub compact_pointers: Vec<(usize, InternalKey)>,
    pub deleted_files: BTreeSet<(usize, u64)>,
    pub new_files: Vec<(usize, FileMetaData)>,
}

impl VersionEdit {
    pub fn set_comparator_name(&mut self, name: &str) {
        self.comparator = Some(name.to_string());
    }

    pub fn set_log_number(&mut self, num: u64) {
        self.log_number = Some(num);
    }

    pub fn set_prev_log_number(&mut self, num: u64) {
        self.prev_log_number = Some(num);
    }

    pub fn set_next_file(&mut self, num: u64) {
        self.next_file_number = Some(num);
    }

    pub fn set_last_sequence(&mut self, seq: SequenceNumber) {
        self.last_sequence = Some(seq);
    }

    pub fn set_compact_pointer(&mut self, level: usize, key: InternalKey) {
        self.compact_pointers.push((level, key));
    }

    /// Add the specified file at the specified level.
    /// REQUIRES: "smallest" and "largest" are smallest and largest keys in file
    pub fn add_file(
        &mut self,
        level: usize,
        number: u64,
        file_size: u64,
        smallest: InternalKey,
        largest: InternalKey,
    ) {
        self.new_files
            .push((level, FileMetaData::new(number, file_size, smallest, largest)));
    }

    /// Delete the specified "file" from the specified "level".
    pub fn delete_file(&mut self, level: usize, number: u64) {
        self.deleted_files.insert((level, number));
    }

    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        if let Some(name) = &self.comparator {
            put_varint32(dst, tag::COMPARATOR);
            put_length_prefixed_slice(dst, name.as_bytes());
        }
        if let Some(n) = self.log_number {
            put_varint32(dst, tag::LOG_NUMBER);
            put_varint64(dst, n);
        }
        if let Some(n) = self.prev_log_number {
            put_varint32(dst, tag::PREV_LOG_NUMBER);
            put_varint64(dst, n);
        }
        if let Some(n) = self.next_file_number {
            put_varint32(dst, tag::NEXT_FILE_NUMBER);
            put_varint64(dst, n);
        }
        if let Some(s) = self.last_sequence {
            put_varint32(dst, tag::LAST_SEQUENCE);
            put_varint64(dst, s);
        }
        for (level, key) in &self.compact_pointers {
            put_varint32(dst, tag::COMPACT_POINTER);
            put_varint32(dst, *level as u32);
            put_length_prefixed_slice(dst, key.encode());
        }
        for (level, number) in &self.deleted_files {
            put_varint32(dst, tag::DELETED_FILE);
            put_varint32(dst, *level as u32);
            put_varint64(dst, *number);
        }
        for (level, f) in &self.new_files {
            put_varint32(dst, tag::NEW_FILE);
            put_varint32(dst, *level as u32);
            put_varint64(dst, f.number);
            put_varint64(dst, f.file_size);
            put_length_prefixed_slice(dst, f.smallest.encode());
            put_length_prefixed_slice(dst, f.largest.encode());
        }
    }

    pub fn decode_from(src: &[u8]) -> Result<VersionEdit> {
        fn level(decoder: &mut Decoder) -> Option<usize> {
            decoder
                .varint32()
                .map(|l| l as usize)
                .filter(|l| *l < NUM_LEVELS)
        }
        fn internal_key(decoder: &mut Decoder) -> Option<InternalKey> {
            decoder
                .length_prefixed_slice()
                .map(InternalKey::decode_from)
        }
        let err = |field: &str| {
            LsmKvError::corruption(format!("VersionEdit: {}", field))
        };

        let mut edit = VersionEdit::default();
        let mut decoder = Decoder::new(src);
        while !decoder.is_empty() {
            let t = decoder.varint32().ok_or_else(|| err("invalid tag"))?;
            match t {
                tag::COMPARATOR => {
                    let name = decoder
                        .length_prefixed_slice()
                        .and_then(|s| std::str::from_utf8(s).ok())
                        .ok_or_else(|| err("comparator name"))?;
                    edit.comparator = Some(name.to_string());
                }
                tag::LOG_NUMBER => {
                    edit.log_number = Some(decoder.varint64().ok_or_else(|| err("log number"))?);
                }
                tag::PREV_LOG_NUMBER => {
                    edit.prev_log_number =
                        Some(decoder.varint64().ok_or_else(|| err("previous log number"))?);
                }
                tag::NEXT_FILE_NUMBER => {
                    edit.next_file_number =
                        Some(decoder.varint64().ok_or_else(|| err("next file number"))?);
                }
                tag::LAST_SEQUENCE => {
                    edit.last_sequence =
                        Some(decoder.varint64().ok_or_else(|| err("last sequence number"))?);
                }
                tag::COMPACT_POINTER => {
                    let l = level(&mut decoder).ok_or_else(|| err("compaction pointer"))?;
                    let key = internal_key(&mut decoder).ok_or_else(|| err("compaction pointer"))?;
                    edit.compact_pointers.push((l, key));
                }
                tag::DELETED_FILE => {
                    let l = level(&mut decoder).ok_or_else(|| err("deleted file"))?;
                    let number = decoder.varint64().ok_or_else(|| err("deleted file"))?;
                    edit.deleted_files.insert((l, number));
                }
                tag::NEW_FILE => {
                    let l = level(&mut decoder).ok_or_else(|| err("new-file entry"))?;
                    let number = decoder.varint64().ok_or_else(|| err("new-file entry"))?;
                    let size = decoder.varint64().ok_or_else(|| err("new-file entry"))?;
                    let smallest = internal_key(&mut decoder).ok_or_else(|| err("new-file entry"))?;
                    let largest = internal_key(&mut decoder).ok_or_else(|| err("new-file entry"))?;
                    edit.new_files
                        .push((l, FileMetaData::new(number, size, smallest, largest)));
                }
                _ => return Err(err("unknown tag")),
            }
        }
        Ok(edit)
    }
}

impl Debug for VersionEdit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "VersionEdit {{")?;
        if let Some(name) = &self.comparator {
            write!(f, "\n  Comparator: {}", name)?;
        }
        if let Some(n) = self.log_number {
            write!(f, "\n  LogNumber: {}", n)?;
        }
        if let Some(n) = self.prev_log_number {
            write!(f, "\n  PrevLogNumber: {}", n)?;
        }
        if let Some(n) = self.next_file_number {
            write!(f, "\n  NextFile: {}", n)?;
        }
        if let Some(s) = self.last_sequence {
            write!(f, "\n  LastSeq: {}", s)?;
        }
        for (level, key) in &self.compact_pointers {
            write!(f, "\n  CompactPointer: {} {:?}", level, key)?;
        }
        for (level, number) in &self.deleted_files {
            write!(f, "\n  RemoveFile: {} {}", level, number)?;
        }
        for (level, file) in &self.new_files {
            write!(f, "\n  AddFile: {} {:?}", level, file)?;
        }
        write!(f, "\n}}")
    }
}

#[cfg(test)]
mod tests {
    use crate::db::key_types::{InternalKey, ValueType};
    use crate::version::version_edit::VersionEdit;

    fn encode(edit: &VersionEdit) -> Vec<u8> {
        let mut encoded = vec![];
        edit.encode_to(&mut encoded);
        encoded
    }

    #[test]
    fn test_encode_decode() {
        const BIG: u64 = 1 << 50;
        let mut edit = VersionEdit::default();
        for i in 0..4u64 {
            edit.add_file(
                3,
                BIG + 300 + i,
                BIG + 400 + i,
                InternalKey::new(b"foo", BIG + 500 + i, ValueType::Value),
                InternalKey::new(b"zoo", BIG + 600 + i, ValueType::Deletion),
            );
            edit.delete_file(4, BIG + 700 + i);
            edit.set_compact_pointer(i as usize, InternalKey::new(b"x", BIG + 900 + i, ValueType::Value));
        }
        edit.set_comparator_name("foo");
        edit.set_log_number(BIG + 100);
        edit.set_next_file(BIG + 200);
        edit.set_last_sequence(BIG + 1000);

        let encoded = encode(&edit);
        let parsed = VersionEdit::decode_from(&encoded).unwrap();
        assert_eq!(encoded, encode(&parsed));
        assert_eq!(parsed.comparator.as_deref(), Some("foo"));
        assert_eq!(parsed.new_files.len(), 4);
        assert_eq!(parsed.new_files[2].1.number, BIG + 302);
        assert_eq!(parsed.new_files[2].1.largest.user_key(), b"zoo");
        assert!(parsed.deleted_files.contains(&(4, BIG + 701)));
        assert!(parsed.prev_log_number.is_none());
    }

    #[test]
    fn test_decode_errors() {
        let mut edit = VersionEdit::default();
        edit.add_file(
            1,
            7,
            100,
            InternalKey::new(b"a", 1, ValueType::Value),
            InternalKey::new(b"b", 2, ValueType::Value),
        );
        let encoded = encode(&edit);
        for len in 1..encoded.len() {
            assert!(VersionEdit::decode_from(&encoded[..len])
                .unwrap_err()
                .is_corruption());
        }
        // unknown tag
        assert!(VersionEdit::decode_from(&[8, 1]).is_err());
        // level out of range
        assert!(VersionEdit::decode_from(&[6, 7, 1]).is_err());
    }
}
