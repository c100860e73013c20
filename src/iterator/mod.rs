//! Cursor-style iterators over sorted key/value sequences.
//!
//! Memtables, blocks, tables, levels and the merged database view all
//! expose this interface, which lets them be stacked on top of each other.

mod merging;
mod two_level;

pub use merging::MergingIterator;
pub use two_level::{BlockIterBuilder, TwoLevelIterator};

use crate::Result;

pub trait KvIterator: Send {
    /// An iterator is either positioned at a key/value pair, or not valid.
    fn valid(&self) -> bool;

    /// Position at the first key in the source.
    fn seek_to_first(&mut self);

    /// Position at the last key in the source.
    fn seek_to_last(&mut self);

    /// Position at the first key in the source that is at or past `target`.
    fn seek(&mut self, target: &[u8]);

    /// REQUIRES: `valid()`
    fn next(&mut self);

    /// REQUIRES: `valid()`
    fn prev(&mut self);

    /// REQUIRES: `valid()`
    fn key(&self) -> &[u8];

    /// REQUIRES: `valid()`
    fn value(&self) -> &[u8];

    /// The first error met while iterating, if any.
    fn status(&self) -> Result<()>;
}

pub type BoxedIterator = Box<dyn KvIterator>;

impl KvIterator for BoxedIterator {
    fn valid(&self) -> bool {
        (**self).valid()
    }
    fn seek_to_first(&mut self) {
        (**self).seek_to_first()
    }
    fn seek_to_last(&mut self) {
        (**self).seek_to_last()
    }
    fn seek(&mut self, target: &[u8]) {
        (**self).seek(target)
    }
    fn next(&mut self) {
        (**self).next()
    }
    fn prev(&mut self) {
        (**self).prev()
    }
    fn key(&self) -> &[u8] {
        (**self).key()
    }
    fn value(&self) -> &[u8] {
        (**self).value()
    }
    fn status(&self) -> Result<()> {
        (**self).status()
    }
}

/// Iterator over nothing, optionally carrying an error.
#[derive(Default)]
pub struct EmptyIterator {
    status: Option<crate::error::LsmKvError>,
}

impl EmptyIterator {
    pub fn with_error(err: crate::error::LsmKvError) -> EmptyIterator {
        EmptyIterator { status: Some(err) }
    }
}

impl KvIterator for EmptyIterator {
    fn valid(&self) -> bool {
        false
    }
    fn seek_to_first(&mut self) {}
    fn seek_to_last(&mut self) {}
    fn seek(&mut self, _target: &[u8]) {}
    fn next(&mut self) {
        debug_assert!(false, "next() on empty iterator");
    }
    fn prev(&mut self) {
        debug_assert!(false, "prev() on empty iterator");
    }
    fn key(&self) -> &[u8] {
        &[]
    }
    fn value(&self) -> &[u8] {
        &[]
    }
    fn status(&self) -> Result<()> {
        match &self.status {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::comparator::Comparator;
    use crate::iterator::KvIterator;
    use crate::Result;
    use std::cmp::Ordering;
    use std::sync::Arc;

    /// In-memory iterator over sorted pairs, used to test the combinators.
    pub(crate) struct VecIterator {
        comparator: Arc<dyn Comparator>,
        entries: Vec<(Vec<u8>, Vec<u8>)>,
        pos: usize,
    }

    impl VecIterator {
        pub(crate) fn new(
            comparator: Arc<dyn Comparator>,
            entries: Vec<(Vec<u8>, Vec<u8>)>,
        ) -> VecIterator {
            let pos = entries.len();
            VecIterator {
                comparator,
                entries,
                pos,
            }
        }
    }

    impl KvIterator for VecIterator {
        fn valid(&self) -> bool {
            self.pos < self.entries.len()
        }
        fn seek_to_first(&mut self) {
            self.pos = 0;
        }
        fn seek_to_last(&mut self) {
            self.pos = if self.entries.is_empty() {
                0
            } else {
                self.entries.len() - 1
            };
        }
        fn seek(&mut self, target: &[u8]) {
            self.pos = self
                .entries
                .iter()
                .position(|(k, _)| self.comparator.compare(k, target) != Ordering::Less)
                .unwrap_or(self.entries.len());
        }
        fn next(&mut self) {
            self.pos += 1;
        }
        fn prev(&mut self) {
            self.pos = if self.pos == 0 {
                self.entries.len()
            } else {
                self.pos - 1
            };
        }
        fn key(&self) -> &[u8] {
            &self.entries[self.pos].0
        }
        fn value(&self) -> &[u8] {
            &self.entries[self.pos].1
        }
        fn status(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Collect `(key, value)` pairs by walking forward from the first entry.
    pub(crate) fn collect_forward(iter: &mut dyn KvIterator) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut result = vec![];
        iter.seek_to_first();
        while iter.valid() {
            result.push((iter.key().to_vec(), iter.value().to_vec()));
            iter.next();
        }
        result
    }

    pub(crate) fn collect_backward(iter: &mut dyn KvIterator) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut result = vec![];
        iter.seek_to_last();
        while iter.valid() {
            result.push((iter.key().to_vec(), iter.value().to_vec()));
            iter.prev();
        }
        result
    }
}
