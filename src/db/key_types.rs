//! Internal key layout.
//!
//! An internal key is `user_key ++ fixed64(sequence << 8 | type)`. Internal
//! keys order by ascending user key, then by descending sequence, so the
//! newest version of a user key is met first.

use crate::coding::{decode_fixed64, put_fixed64, put_varint32, varint_length};
use crate::comparator::Comparator;
use std::cmp::Ordering;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

pub type SequenceNumber = u64;

/// Sequence numbers use 56 bits so that sequence and type pack into 64 bits.
pub const MAX_SEQUENCE_NUMBER: SequenceNumber = (1 << 56) - 1;

/// Size of the `(sequence, type)` trailer.
pub const TRAILER_LEN: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ValueType {
    Deletion = 0,
    Value = 1,
}

/// `ValueType` used when building a probe key for seeking. Types sort in
/// descending order after sequences, so this must be the highest type.
pub const VALUE_TYPE_FOR_SEEK: ValueType = ValueType::Value;

impl ValueType {
    pub fn from_u8(b: u8) -> Option<ValueType> {
        match b {
            0 => Some(ValueType::Deletion),
            1 => Some(ValueType::Value),
            _ => None,
        }
    }
}

#[inline]
pub fn pack_sequence_and_type(sequence: SequenceNumber, value_type: ValueType) -> u64 {
    debug_assert!(sequence <= MAX_SEQUENCE_NUMBER);
    (sequence << 8) | value_type as u64
}

pub fn append_internal_key(
    dst: &mut Vec<u8>,
    user_key: &[u8],
    sequence: SequenceNumber,
    value_type: ValueType,
) {
    dst.extend_from_slice(user_key);
    put_fixed64(dst, pack_sequence_and_type(sequence, value_type));
}

#[inline]
pub fn extract_user_key(internal_key: &[u8]) -> &[u8] {
    debug_assert!(internal_key.len() >= TRAILER_LEN);
    &internal_key[..internal_key.len() - TRAILER_LEN]
}

#[inline]
pub fn extract_tag(internal_key: &[u8]) -> u64 {
    decode_fixed64(&internal_key[internal_key.len() - TRAILER_LEN..])
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ParsedInternalKey<'a> {
    pub user_key: &'a [u8],
    pub sequence: SequenceNumber,
    pub value_type: ValueType,
}

impl<'a> ParsedInternalKey<'a> {
    pub fn new(user_key: &'a [u8], sequence: SequenceNumber, value_type: ValueType) -> Self {
        ParsedInternalKey {
            user_key,
            sequence,
            value_type,
        }
    }

    /// Returns `None` if `internal_key` is malformed.
    pub fn parse(internal_key: &'a [u8]) -> Option<ParsedInternalKey<'a>> {
        if internal_key.len() < TRAILER_LEN {
            return None;
        }
        let tag = extract_tag(internal_key);
        let value_type = ValueType::from_u8((tag & 0xff) as u8)?;
        Some(ParsedInternalKey {
            user_key: extract_user_key(internal_key),
            sequence: tag >> 8,
            value_type,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.user_key.len() + TRAILER_LEN);
        append_internal_key(&mut buf, self.user_key, self.sequence, self.value_type);
        buf
    }
}

impl Debug for ParsedInternalKey<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "'{}' @ {} : {:?}",
            String::from_utf8_lossy(self.user_key),
            self.sequence,
            self.value_type
        )
    }
}

/// Owned, encoded internal key.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct InternalKey(Vec<u8>);

impl InternalKey {
    pub fn new(user_key: &[u8], sequence: SequenceNumber, value_type: ValueType) -> InternalKey {
        let mut rep = Vec::with_capacity(user_key.len() + TRAILER_LEN);
        append_internal_key(&mut rep, user_key, sequence, value_type);
        InternalKey(rep)
    }

    pub fn decode_from(encoded: &[u8]) -> InternalKey {
        InternalKey(encoded.to_vec())
    }

    #[inline]
    pub fn encode(&self) -> &[u8] {
        &self.0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn user_key(&self) -> &[u8] {
        extract_user_key(&self.0)
    }

    pub fn set_from(&mut self, parsed: &ParsedInternalKey) {
        self.0.clear();
        append_internal_key(&mut self.0, parsed.user_key, parsed.sequence, parsed.value_type);
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

impl Debug for InternalKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match ParsedInternalKey::parse(&self.0) {
            Some(parsed) => parsed.fmt(f),
            None => write!(f, "(bad){:?}", self.0),
        }
    }
}

/// Orders internal keys by user key with the wrapped comparator, breaking
/// ties by descending sequence number and type.
#[derive(Clone)]
pub struct InternalKeyComparator {
    user_comparator: Arc<dyn Comparator>,
}

impl InternalKeyComparator {
    pub fn new(user_comparator: Arc<dyn Comparator>) -> InternalKeyComparator {
        InternalKeyComparator { user_comparator }
    }

    #[inline]
    pub fn user_comparator(&self) -> &Arc<dyn Comparator> {
        &self.user_comparator
    }

    pub fn compare_internal_key(&self, a: &InternalKey, b: &InternalKey) -> Ordering {
        self.compare(a.encode(), b.encode())
    }
}

impl Comparator for InternalKeyComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self
            .user_comparator
            .compare(extract_user_key(a), extract_user_key(b))
        {
            Ordering::Equal => extract_tag(b).cmp(&extract_tag(a)),
            o => o,
        }
    }

    fn name(&self) -> &'static str {
        "leveldb.InternalKeyComparator"
    }

    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]) {
        // attempt to shorten the user portion of the key
        let user_start = extract_user_key(start);
        let user_limit = extract_user_key(limit);
        let mut tmp = user_start.to_vec();
        self.user_comparator
            .find_shortest_separator(&mut tmp, user_limit);
        if tmp.len() < user_start.len()
            && self.user_comparator.compare(user_start, &tmp) == Ordering::Less
        {
            // User key has become shorter physically, but larger logically.
            // Tack on the earliest possible number to the shortened user key.
            put_fixed64(
                &mut tmp,
                pack_sequence_and_type(MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK),
            );
            debug_assert_eq!(self.compare(start, &tmp), Ordering::Less);
            debug_assert_eq!(self.compare(&tmp, limit), Ordering::Less);
            *start = tmp;
        }
    }

    fn find_short_successor(&self, key: &mut Vec<u8>) {
        let user_key = extract_user_key(key);
        let mut tmp = user_key.to_vec();
        self.user_comparator.find_short_successor(&mut tmp);
        if tmp.len() < user_key.len()
            && self.user_comparator.compare(user_key, &tmp) == Ordering::Less
        {
            put_fixed64(
                &mut tmp,
                pack_sequence_and_type(MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK),
            );
            debug_assert_eq!(self.compare(key, &tmp), Ordering::Less);
            *key = tmp;
        }
    }
}

/// Probe key for point lookups in the memtable and in tables.
///
/// Layout: `varint32(internal_key_len) ++ user_key ++ tag`. The memtable
/// stores entries with the same length prefix, tables store bare internal
/// keys, so both views are kept.
pub struct LookupKey {
    data: Vec<u8>,
    key_start: usize,
}

impl LookupKey {
    pub fn new(user_key: &[u8], sequence: SequenceNumber) -> LookupKey {
        let internal_len = user_key.len() + TRAILER_LEN;
        let mut data = Vec::with_capacity(varint_length(internal_len as u64) + internal_len);
        put_varint32(&mut data, internal_len as u32);
        let key_start = data.len();
        append_internal_key(&mut data, user_key, sequence, VALUE_TYPE_FOR_SEEK);
        LookupKey { data, key_start }
    }

    /// Key suitable for seeking in a memtable.
    #[inline]
    pub fn memtable_key(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn internal_key(&self) -> &[u8] {
        &self.data[self.key_start..]
    }

    #[inline]
    pub fn user_key(&self) -> &[u8] {
        &self.data[self.key_start..self.data.len() - TRAILER_LEN]
    }
}

#[cfg(test)]
mod tests {
    use crate::comparator::{BytewiseComparator, Comparator};
    use crate::db::key_types::*;
    use std::sync::Arc;

    fn ikey(user_key: &[u8], seq: SequenceNumber, t: ValueType) -> Vec<u8> {
        InternalKey::new(user_key, seq, t).encode().to_vec()
    }

    fn shorten(s: &[u8], l: &[u8]) -> Vec<u8> {
        let mut result = s.to_vec();
        comparator().find_shortest_separator(&mut result, l);
        result
    }

    fn short_successor(s: &[u8]) -> Vec<u8> {
        let mut result = s.to_vec();
        comparator().find_short_successor(&mut result);
        result
    }

    fn comparator() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    #[test]
    fn test_encode_decode() {
        let keys: [&[u8]; 4] = [b"", b"k", b"hello", b"longggggggggggggggggggggg"];
        let seqs = [
            1,
            2,
            3,
            (1u64 << 8) - 1,
            1 << 8,
            (1 << 8) + 1,
            (1 << 32) - 1,
            1 << 32,
            MAX_SEQUENCE_NUMBER,
        ];
        for k in keys {
            for s in seqs {
                for t in [ValueType::Value, ValueType::Deletion] {
                    let encoded = ikey(k, s, t);
                    let decoded = ParsedInternalKey::parse(&encoded).unwrap();
                    assert_eq!(k, decoded.user_key);
                    assert_eq!(s, decoded.sequence);
                    assert_eq!(t, decoded.value_type);
                }
            }
        }
        assert!(ParsedInternalKey::parse(b"bar").is_none());
        let mut bad_type = ikey(b"foo", 1, ValueType::Value);
        let n = bad_type.len();
        bad_type[n - 8] = 0x7;
        assert!(ParsedInternalKey::parse(&bad_type).is_none());
    }

    #[test]
    fn test_ordering() {
        let cmp = comparator();
        let a = ikey(b"a", 100, ValueType::Value);
        let a_old = ikey(b"a", 99, ValueType::Value);
        let a_del = ikey(b"a", 100, ValueType::Deletion);
        let b = ikey(b"b", 1, ValueType::Value);
        assert_eq!(cmp.compare(&a, &a_old), Ordering::Less);
        assert_eq!(cmp.compare(&a, &a_del), Ordering::Less);
        assert_eq!(cmp.compare(&a_old, &b), Ordering::Less);
        assert_eq!(cmp.compare(&b, &b), Ordering::Equal);
    }

    #[test]
    fn test_short_separator() {
        let foo = ikey(b"foo", 100, ValueType::Value);
        // when user keys are same
        assert_eq!(foo, shorten(&foo, &ikey(b"foo", 99, ValueType::Value)));
        assert_eq!(foo, shorten(&foo, &ikey(b"foo", 101, ValueType::Value)));
        assert_eq!(foo, shorten(&foo, &ikey(b"foo", 100, ValueType::Deletion)));

        // when user keys are misordered
        assert_eq!(foo, shorten(&foo, &ikey(b"bar", 99, ValueType::Value)));

        // when user keys are different, but correctly ordered
        assert_eq!(
            ikey(b"g", MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK),
            shorten(&foo, &ikey(b"hello", 200, ValueType::Value))
        );

        // when start user key is prefix of limit user key
        assert_eq!(foo, shorten(&foo, &ikey(b"foobar", 200, ValueType::Value)));

        // when limit user key is prefix of start user key
        assert_eq!(
            ikey(b"foobar", 100, ValueType::Value),
            shorten(
                &ikey(b"foobar", 100, ValueType::Value),
                &ikey(b"foo", 200, ValueType::Value)
            )
        );
    }

    #[test]
    fn test_short_successor() {
        assert_eq!(
            ikey(b"g", MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK),
            short_successor(&ikey(b"foo", 100, ValueType::Value))
        );
        let ff = ikey(&[0xff, 0xff], 100, ValueType::Value);
        assert_eq!(ff, short_successor(&ff));
    }

    #[test]
    fn test_lookup_key() {
        let key = LookupKey::new(b"user", 42);
        assert_eq!(key.user_key(), b"user");
        assert_eq!(key.internal_key(), &ikey(b"user", 42, VALUE_TYPE_FOR_SEEK)[..]);
        assert_eq!(key.memtable_key()[0] as usize, key.internal_key().len());
    }
}
