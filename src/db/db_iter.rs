use crate::comparator::Comparator;
use crate::db::key_types::{
    append_internal_key, extract_user_key, ParsedInternalKey, SequenceNumber, ValueType,
    VALUE_TYPE_FOR_SEEK,
};
use crate::db::options::READ_BYTES_PERIOD;
use crate::error::LsmKvError;
use crate::iterator::{BoxedIterator, KvIterator};
use crate::Result;
use rand::Rng;
use std::cmp::Ordering;
use std::sync::Arc;

/// Receives the internal keys sampled while iterating, so that files
/// which are read past often can be scheduled for compaction.
pub(crate) trait ReadSampler: Send + Sync {
    fn record_read_sample(&self, internal_key: &[u8]);
}

/// Which direction is the iterator currently moving?
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Direction {
    /// When moving forward, the internal iterator is positioned at the
    /// exact entry that yields `self.key()`, `self.value()`
    Forward,
    /// When moving backwards, the internal iterator is positioned just
    /// before all entries whose user key == `self.key()`.
    Reverse,
}

/// Iterator over the contents of a database as of a sequence number.
///
/// Converts the internal key stream of memtables and tables into user
/// keys: for each user key, only the newest entry visible at the
/// sequence is yielded, and deleted keys are skipped.
pub struct DBIterator {
    ucmp: Arc<dyn Comparator>,
    iter: BoxedIterator,
    sampler: Arc<dyn ReadSampler>,
    sequence: SequenceNumber,
    status: Result<()>,
    /// == current key when direction == Reverse
    saved_key: Vec<u8>,
    /// == current raw value when direction == Reverse
    saved_value: Vec<u8>,
    direction: Direction,
    valid: bool,
    bytes_until_read_sampling: usize,
}

fn random_compaction_period() -> usize {
    rand::thread_rng().gen_range(0..2 * READ_BYTES_PERIOD as usize)
}

impl DBIterator {
    pub(crate) fn new(
        ucmp: Arc<dyn Comparator>,
        iter: BoxedIterator,
        sequence: SequenceNumber,
        sampler: Arc<dyn ReadSampler>,
    ) -> DBIterator {
        DBIterator {
            ucmp,
            iter,
            sampler,
            sequence,
            status: Ok(()),
            saved_key: vec![],
            saved_value: vec![],
            direction: Direction::Forward,
            valid: false,
            bytes_until_read_sampling: random_compaction_period(),
        }
    }

    /// Sample the current entry and decode its sequence and type.
    fn parse_key(&mut self) -> Option<(SequenceNumber, ValueType)> {
        let bytes_read = self.iter.key().len() + self.iter.value().len();
        while self.bytes_until_read_sampling < bytes_read {
            self.bytes_until_read_sampling += random_compaction_period();
            self.sampler.record_read_sample(self.iter.key());
        }
        debug_assert!(self.bytes_until_read_sampling >= bytes_read);
        self.bytes_until_read_sampling -= bytes_read;

        match ParsedInternalKey::parse(self.iter.key()) {
            Some(ikey) => Some((ikey.sequence, ikey.value_type)),
            None => {
                self.status = Err(LsmKvError::corruption("corrupted internal key in DBIter"));
                None
            }
        }
    }

    #[inline]
    fn save_user_key(&mut self) {
        self.saved_key.clear();
        self.saved_key
            .extend_from_slice(extract_user_key(self.iter.key()));
    }

    #[inline]
    fn clear_saved_value(&mut self) {
        if self.saved_value.capacity() > 1048576 {
            self.saved_value = vec![];
        } else {
            self.saved_value.clear();
        }
    }

    fn find_next_user_entry(&mut self, mut skipping: bool) {
        // Loop until we hit an acceptable entry to yield
        debug_assert!(self.iter.valid());
        debug_assert_eq!(self.direction, Direction::Forward);
        loop {
            if let Some((sequence, value_type)) = self.parse_key() {
                if sequence <= self.sequence {
                    match value_type {
                        ValueType::Deletion => {
                            // Arrange to skip all upcoming entries for this key
                            // since they are hidden by this deletion.
                            self.save_user_key();
                            skipping = true;
                        }
                        ValueType::Value => {
                            let hidden = skipping
                                && self
                                    .ucmp
                                    .compare(extract_user_key(self.iter.key()), &self.saved_key)
                                    != Ordering::Greater;
                            if !hidden {
                                self.valid = true;
                                self.saved_key.clear();
                                return;
                            }
                        }
                    }
                }
            }
            self.iter.next();
            if !self.iter.valid() {
                break;
            }
        }
        self.saved_key.clear();
        self.valid = false;
    }

    fn find_prev_user_entry(&mut self) {
        debug_assert_eq!(self.direction, Direction::Reverse);

        let mut value_type = ValueType::Deletion;
        if self.iter.valid() {
            loop {
                if let Some((sequence, t)) = self.parse_key() {
                    if sequence <= self.sequence {
                        if value_type != ValueType::Deletion
                            && self
                                .ucmp
                                .compare(extract_user_key(self.iter.key()), &self.saved_key)
                                == Ordering::Less
                        {
                            // We encountered a non-deleted value in entries for previous keys,
                            break;
                        }
                        value_type = t;
                        if value_type == ValueType::Deletion {
                            self.saved_key.clear();
                            self.clear_saved_value();
                        } else {
                            self.save_user_key();
                            self.clear_saved_value();
                            self.saved_value.extend_from_slice(self.iter.value());
                        }
                    }
                }
                self.iter.prev();
                if !self.iter.valid() {
                    break;
                }
            }
        }

        if value_type == ValueType::Deletion {
            // End
            self.valid = false;
            self.saved_key.clear();
            self.clear_saved_value();
            self.direction = Direction::Forward;
        } else {
            self.valid = true;
        }
    }
}

impl KvIterator for DBIterator {
    #[inline]
    fn valid(&self) -> bool {
        self.valid
    }

    fn seek_to_first(&mut self) {
        self.direction = Direction::Forward;
        self.clear_saved_value();
        self.iter.seek_to_first();
        if self.iter.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    fn seek_to_last(&mut self) {
        self.direction = Direction::Reverse;
        self.clear_saved_value();
        self.iter.seek_to_last();
        self.find_prev_user_entry();
    }

    fn seek(&mut self, target: &[u8]) {
        self.direction = Direction::Forward;
        self.clear_saved_value();
        self.saved_key.clear();
        append_internal_key(&mut self.saved_key, target, self.sequence, VALUE_TYPE_FOR_SEEK);
        self.iter.seek(&self.saved_key);
        if self.iter.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    fn next(&mut self) {
        debug_assert!(self.valid);

        if self.direction == Direction::Reverse {
            // Switch directions?
            self.direction = Direction::Forward;
            // iter is pointing just before the entries for self.key(),
            // so advance into the range of entries for self.key() and then
            // use the normal skipping code below.
            if !self.iter.valid() {
                self.iter.seek_to_first();
            } else {
                self.iter.next();
            }
            if !self.iter.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
            // saved_key already contains the key to skip past.
        } else {
            // Store in saved_key the current key so we skip it below.
            self.save_user_key();

            // iter is pointing to current key. We can now safely move to the next to
            // avoid checking current key.
            self.iter.next();
            if !self.iter.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
        }

        self.find_next_user_entry(true);
    }

    fn prev(&mut self) {
        debug_assert!(self.valid);

        if self.direction == Direction::Forward {
            // Switch directions?
            // iter is pointing at the current entry. Scan backwards until
            // the key changes so we can use the normal reverse scanning code.
            debug_assert!(self.iter.valid());
            self.save_user_key();
            loop {
                self.iter.prev();
                if !self.iter.valid() {
                    self.valid = false;
                    self.saved_key.clear();
                    self.clear_saved_value();
                    return;
                }
                if self
                    .ucmp
                    .compare(extract_user_key(self.iter.key()), &self.saved_key)
                    == Ordering::Less
                {
                    break;
                }
            }
            self.direction = Direction::Reverse;
        }

        self.find_prev_user_entry();
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => extract_user_key(self.iter.key()),
            Direction::Reverse => &self.saved_key,
        }
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => self.iter.value(),
            Direction::Reverse => &self.saved_value,
        }
    }

    fn status(&self) -> Result<()> {
        match &self.status {
            Ok(()) => self.iter.status(),
            Err(e) => Err(e.clone()),
        }
    }
}
