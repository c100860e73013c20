//! Orderings over user keys.
//!
//! A comparator must stay the same across the lifetime of a database: its
//! name is recorded in the manifest and checked again on every open.

use std::borrow::Cow;
use std::cmp::Ordering;

pub trait Comparator: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Name persisted in the manifest.
    fn name(&self) -> &'static str;

    /// If `start < limit`, change `start` to a short key in `[start, limit)`.
    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]);

    /// Change `key` to a short key that is `>= key`.
    fn find_short_successor(&self, key: &mut Vec<u8>);

    /// The bytes a filter policy sees for `key`. Keys that compare equal
    /// must map to the same bytes.
    fn filter_key<'a>(&self, key: &'a [u8]) -> Cow<'a, [u8]> {
        Cow::Borrowed(key)
    }
}

#[derive(Default, Clone, Copy)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    #[inline]
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn name(&self) -> &'static str {
        "leveldb.BytewiseComparator"
    }

    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]) {
        let min_len = start.len().min(limit.len());
        let diff_index = start
            .iter()
            .zip(limit.iter())
            .take_while(|(a, b)| a == b)
            .count();

        if diff_index >= min_len {
            // one is a prefix of the other
            return;
        }
        let diff_byte = start[diff_index];
        if diff_byte < 0xff && diff_byte + 1 < limit[diff_index] {
            start[diff_index] += 1;
            start.truncate(diff_index + 1);
            debug_assert_eq!(self.compare(start, limit), Ordering::Less);
        }
    }

    fn find_short_successor(&self, key: &mut Vec<u8>) {
        // find first character that can be incremented
        if let Some(i) = key.iter().position(|b| *b != 0xff) {
            key[i] += 1;
            key.truncate(i + 1);
        }
        // `key` is a run of 0xffs, leave it alone.
    }
}

/// ASCII case-insensitive ordering. Keys that differ only by case compare
/// equal, so they address the same entry.
#[derive(Default, Clone, Copy)]
pub struct CaseInsensitiveComparator;

impl CaseInsensitiveComparator {
    #[inline]
    fn fold(b: u8) -> u8 {
        b.to_ascii_lowercase()
    }
}

impl Comparator for CaseInsensitiveComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.iter()
            .map(|c| Self::fold(*c))
            .cmp(b.iter().map(|c| Self::fold(*c)))
    }

    fn name(&self) -> &'static str {
        "lsmkv.CaseInsensitiveComparator"
    }

    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]) {
        let min_len = start.len().min(limit.len());
        let diff_index = start
            .iter()
            .zip(limit.iter())
            .take_while(|(a, b)| Self::fold(**a) == Self::fold(**b))
            .count();
        if diff_index >= min_len {
            return;
        }
        let diff_byte = Self::fold(start[diff_index]);
        let limit_byte = Self::fold(limit[diff_index]);
        // stay clear of the upper-case range, which folds onto lower case
        if diff_byte < 0xff && diff_byte + 1 < limit_byte && !(diff_byte + 1).is_ascii_uppercase()
        {
            start[diff_index] = diff_byte + 1;
            start.truncate(diff_index + 1);
            debug_assert_eq!(self.compare(start, limit), Ordering::Less);
        }
    }

    fn find_short_successor(&self, key: &mut Vec<u8>) {
        if let Some(i) = key.iter().position(|b| *b != 0xff) {
            let next = Self::fold(key[i]) + 1;
            if next.is_ascii_uppercase() {
                return;
            }
            key[i] = next;
            key.truncate(i + 1);
        }
    }

    fn filter_key<'a>(&self, key: &'a [u8]) -> Cow<'a, [u8]> {
        if key.iter().any(u8::is_ascii_uppercase) {
            Cow::Owned(key.to_ascii_lowercase())
        } else {
            Cow::Borrowed(key)
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::comparator::{BytewiseComparator, CaseInsensitiveComparator, Comparator};
    use std::cmp::Ordering;

    #[test]
    fn test_bytewise_compare() {
        let c = BytewiseComparator;
        assert_eq!(c.compare(b"a", b"b"), Ordering::Less);
        assert_eq!(c.compare(b"ab", b"a"), Ordering::Greater);
        assert_eq!(c.compare(b"", b""), Ordering::Equal);
        assert_eq!(c.compare(b"\xff", b"a"), Ordering::Greater);
    }

    #[test]
    fn test_bytewise_separator() {
        let c = BytewiseComparator;
        let mut start = b"abcdefg".to_vec();
        c.find_shortest_separator(&mut start, b"abzzz");
        assert_eq!(start, b"abd");

        // prefix
        let mut start = b"abc".to_vec();
        c.find_shortest_separator(&mut start, b"abcdef");
        assert_eq!(start, b"abc");

        // adjacent bytes cannot be shortened
        let mut start = b"abc1".to_vec();
        c.find_shortest_separator(&mut start, b"abd");
        assert_eq!(start, b"abc1");

        let mut start = b"foo".to_vec();
        c.find_shortest_separator(&mut start, b"foo");
        assert_eq!(start, b"foo");
    }

    #[test]
    fn test_bytewise_successor() {
        let c = BytewiseComparator;
        let mut key = b"abc".to_vec();
        c.find_short_successor(&mut key);
        assert_eq!(key, b"b");

        let mut key = vec![0xff, 0xff, 0x10];
        c.find_short_successor(&mut key);
        assert_eq!(key, vec![0xff, 0xff, 0x11]);

        let mut key = vec![0xff, 0xff];
        c.find_short_successor(&mut key);
        assert_eq!(key, vec![0xff, 0xff]);
    }

    #[test]
    fn test_case_insensitive() {
        let c = CaseInsensitiveComparator;
        assert_eq!(c.compare(b"Hello", b"hello"), Ordering::Equal);
        assert_eq!(c.compare(b"APPLE", b"banana"), Ordering::Less);
        assert_eq!(c.compare(b"Zoo", b"apple"), Ordering::Greater);

        let mut start = b"Abc".to_vec();
        c.find_shortest_separator(&mut start, b"axe");
        assert_eq!(c.compare(&start, b"Abc"), Ordering::Greater);
        assert_eq!(c.compare(&start, b"axe"), Ordering::Less);

        let mut key = b"Key".to_vec();
        c.find_short_successor(&mut key);
        assert_ne!(c.compare(&key, b"Key"), Ordering::Less);
    }

    #[test]
    fn test_filter_key_folds_equal_keys() {
        let c = CaseInsensitiveComparator;
        assert_eq!(&*c.filter_key(b"MiXeD"), b"mixed");
        assert_eq!(c.filter_key(b"MiXeD"), c.filter_key(b"mixed"));
        assert!(matches!(c.filter_key(b"lower"), std::borrow::Cow::Borrowed(_)));
        assert_eq!(&*BytewiseComparator.filter_key(b"MiXeD"), b"MiXeD");
    }
}
