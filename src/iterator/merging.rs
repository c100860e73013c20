use crate::comparator::Comparator;
use crate::iterator::{BoxedIterator, KvIterator};
use crate::Result;
use std::cmp::Ordering;
use std::sync::Arc;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// Yields the union of its children in comparator order. Equal keys
/// from different children are all yielded, in no particular order.
pub struct MergingIterator {
    comparator: Arc<dyn Comparator>,
    children: Vec<BoxedIterator>,
    /// Index of the child at the current position.
    current: Option<usize>,
    /// Which direction the children are positioned for. When moving
    /// forward, every non-current child is at its first key after
    /// `key()`; when moving backward, at its last key before `key()`.
    direction: Direction,
}

impl MergingIterator {
    pub fn new(comparator: Arc<dyn Comparator>, children: Vec<BoxedIterator>) -> MergingIterator {
        MergingIterator {
            comparator,
            children,
            current: None,
            direction: Direction::Forward,
        }
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            smallest = match smallest {
                Some(s)
                    if self.comparator.compare(child.key(), self.children[s].key())
                        != Ordering::Less =>
                {
                    Some(s)
                }
                _ => Some(i),
            };
        }
        self.current = smallest;
    }

    fn find_largest(&mut self) {
        let mut largest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate().rev() {
            if !child.valid() {
                continue;
            }
            largest = match largest {
                Some(l)
                    if self.comparator.compare(child.key(), self.children[l].key())
                        != Ordering::Greater =>
                {
                    Some(l)
                }
                _ => Some(i),
            };
        }
        self.current = largest;
    }
}

impl KvIterator for MergingIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        for child in self.children.iter_mut() {
            child.seek_to_first();
        }
        self.find_smallest();
        self.direction = Direction::Forward;
    }

    fn seek_to_last(&mut self) {
        for child in self.children.iter_mut() {
            child.seek_to_last();
        }
        self.find_largest();
        self.direction = Direction::Reverse;
    }

    fn seek(&mut self, target: &[u8]) {
        for child in self.children.iter_mut() {
            child.seek(target);
        }
        self.find_smallest();
        self.direction = Direction::Forward;
    }

    fn next(&mut self) {
        let current = match self.current {
            Some(c) => c,
            None => return,
        };

        // Ensure that all children are positioned after key(). If we are
        // moving in the forward direction, it is already true for all of
        // the non-current children since current is the smallest child
        // and key() == current.key(). Otherwise, we explicitly position
        // the non-current children.
        if self.direction != Direction::Forward {
            let key = self.children[current].key().to_vec();
            for (i, child) in self.children.iter_mut().enumerate() {
                if i == current {
                    continue;
                }
                child.seek(&key);
                if child.valid() && self.comparator.compare(&key, child.key()) == Ordering::Equal {
                    child.next();
                }
            }
            self.direction = Direction::Forward;
        }

        self.children[current].next();
        self.find_smallest();
    }

    fn prev(&mut self) {
        let current = match self.current {
            Some(c) => c,
            None => return,
        };

        // Ensure that all children are positioned before key(). If we are
        // moving in the reverse direction, it is already true for all of
        // the non-current children since current is the largest child and
        // key() == current.key(). Otherwise, we explicitly position the
        // non-current children.
        if self.direction != Direction::Reverse {
            let key = self.children[current].key().to_vec();
            for (i, child) in self.children.iter_mut().enumerate() {
                if i == current {
                    continue;
                }
                child.seek(&key);
                if child.valid() {
                    // Child is at first entry >= key(). Step back one to be < key()
                    child.prev();
                } else {
                    // Child has no entries >= key(). Position at last entry.
                    child.seek_to_last();
                }
            }
            self.direction = Direction::Reverse;
        }

        self.children[current].prev();
        self.find_largest();
    }

    fn key(&self) -> &[u8] {
        match self.current {
            Some(c) => self.children[c].key(),
            None => &[],
        }
    }

    fn value(&self) -> &[u8] {
        match self.current {
            Some(c) => self.children[c].value(),
            None => &[],
        }
    }

    fn status(&self) -> Result<()> {
        for child in &self.children {
            child.status()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::comparator::{BytewiseComparator, Comparator};
    use crate::iterator::tests::{collect_backward, collect_forward, VecIterator};
    use crate::iterator::{BoxedIterator, EmptyIterator, KvIterator, MergingIterator};
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;

    fn cmp() -> Arc<dyn Comparator> {
        Arc::new(BytewiseComparator)
    }

    fn child(keys: &[&str]) -> BoxedIterator {
        Box::new(VecIterator::new(
            cmp(),
            keys.iter()
                .map(|k| (k.as_bytes().to_vec(), format!("v_{}", k).into_bytes()))
                .collect(),
        ))
    }

    fn keys(entries: Vec<(Vec<u8>, Vec<u8>)>) -> Vec<String> {
        entries
            .into_iter()
            .map(|(k, _)| String::from_utf8(k).unwrap())
            .collect()
    }

    #[test]
    fn test_empty() {
        let mut iter = MergingIterator::new(cmp(), vec![]);
        iter.seek_to_first();
        assert!(!iter.valid());
        let mut iter = MergingIterator::new(cmp(), vec![Box::new(EmptyIterator::default())]);
        iter.seek(b"a");
        assert!(!iter.valid());
        assert!(iter.status().is_ok());
    }

    #[test]
    fn test_merge_both_ways() {
        let mut iter = MergingIterator::new(
            cmp(),
            vec![child(&["a", "d", "g"]), child(&["b", "e"]), child(&["c", "f", "h"])],
        );
        let expected = vec!["a", "b", "c", "d", "e", "f", "g", "h"];
        assert_eq!(keys(collect_forward(&mut iter)), expected);
        let mut backward = keys(collect_backward(&mut iter));
        backward.reverse();
        assert_eq!(backward, expected);
    }

    #[test]
    fn test_direction_switch() {
        let mut iter = MergingIterator::new(
            cmp(),
            vec![child(&["a", "c", "e"]), child(&["b", "d", "f"])],
        );
        iter.seek(b"c");
        assert_eq!(iter.key(), b"c");
        assert_eq!(iter.value(), b"v_c");
        iter.prev();
        assert_eq!(iter.key(), b"b");
        iter.prev();
        assert_eq!(iter.key(), b"a");
        iter.next();
        assert_eq!(iter.key(), b"b");
        iter.next();
        assert_eq!(iter.key(), b"c");
        iter.next();
        assert_eq!(iter.key(), b"d");
        iter.seek_to_last();
        assert_eq!(iter.key(), b"f");
        iter.prev();
        assert_eq!(iter.key(), b"e");
        iter.next();
        assert_eq!(iter.key(), b"f");
        iter.next();
        assert!(!iter.valid());
    }

    #[test]
    fn test_error_is_reported() {
        let err = crate::error::LsmKvError::corruption("bad");
        let mut iter = MergingIterator::new(
            cmp(),
            vec![child(&["a"]), Box::new(EmptyIterator::with_error(err.clone()))],
        );
        iter.seek_to_first();
        assert_eq!(iter.key(), b"a");
        assert_eq!(iter.status().unwrap_err(), err);
    }

    #[test]
    fn test_random_against_sorted_union() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(17);
        for _ in 0..20 {
            let mut all = vec![];
            let mut children = vec![];
            for c in 0..rng.gen_range(1..6) {
                let mut entries: Vec<(Vec<u8>, Vec<u8>)> = (0..rng.gen_range(0..50))
                    .map(|_| {
                        let k = format!("{:05}-{}", rng.gen_range(0..100000), c).into_bytes();
                        (k, vec![c as u8])
                    })
                    .collect();
                entries.sort();
                entries.dedup_by(|a, b| a.0 == b.0);
                all.extend(entries.iter().cloned());
                children.push(Box::new(VecIterator::new(cmp(), entries)) as BoxedIterator);
            }
            all.sort();
            let mut iter = MergingIterator::new(cmp(), children);
            assert_eq!(collect_forward(&mut iter), all);
            let mut backward = collect_backward(&mut iter);
            backward.reverse();
            assert_eq!(backward, all);
        }
    }
}
