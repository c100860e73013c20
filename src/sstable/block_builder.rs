//! Builds blocks where keys are prefix-compressed.
//!
//! When we store a key, we drop the prefix shared with the previous
//! string. This helps reduce the space requirement significantly.
//! Furthermore, once every K keys, we do not apply the prefix
//! compression and store the entire key. We call this a "restart
//! point". The tail end of the block stores the offsets of all of the
//! restart points, and can be used to do a binary search when looking
//! for a particular key. Values are stored as-is (without compression)
//! immediately following the corresponding key.
//!
//! An entry for a particular key-value pair has the form:
//!
//! ```text
//!     shared_bytes: varint32
//!     unshared_bytes: varint32
//!     value_length: varint32
//!     key_delta: char[unshared_bytes]
//!     value: char[value_length]
//! ```
//!
//! shared_bytes == 0 for restart points.
//!
//! The trailer of the block has the form:
//!
//! ```text
//!     restarts: uint32[num_restarts]
//!     num_restarts: uint32
//! ```

use crate::coding::{put_fixed32, put_varint32};
use crate::comparator::Comparator;
use std::cmp::Ordering;
use std::sync::Arc;

pub struct BlockBuilder {
    comparator: Arc<dyn Comparator>,
    block_restart_interval: usize,
    /// Destination buffer
    buffer: Vec<u8>,
    /// Restart points
    restarts: Vec<u32>,
    /// Number of entries emitted since restart
    counter: usize,
    /// Has finish() been called?
    finished: bool,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new(comparator: Arc<dyn Comparator>, block_restart_interval: usize) -> BlockBuilder {
        debug_assert!(block_restart_interval >= 1);
        BlockBuilder {
            comparator,
            block_restart_interval,
            buffer: vec![],
            // First restart point is at offset 0
            restarts: vec![0],
            counter: 0,
            finished: false,
            last_key: vec![],
        }
    }

    /// Reset the contents as if the BlockBuilder was just constructed.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.restarts.clear();
        self.restarts.push(0);
        self.counter = 0;
        self.finished = false;
        self.last_key.clear();
    }

    /// REQUIRES: `finish()` has not been called since the last call to `reset()`.
    /// REQUIRES: `key` is larger than any previously added key
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(!self.finished);
        debug_assert!(self.counter <= self.block_restart_interval);
        debug_assert!(
            self.buffer.is_empty()
                || self.comparator.compare(key, &self.last_key) == Ordering::Greater,
            "keys added to a block must be strictly increasing"
        );

        let mut shared = 0;
        if self.counter < self.block_restart_interval {
            // See how much sharing to do with previous string
            shared = self
                .last_key
                .iter()
                .zip(key.iter())
                .take_while(|(a, b)| a == b)
                .count();
        } else {
            // Restart compression
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
        }
        let non_shared = key.len() - shared;

        // Add "<shared><non_shared><value_size>" to buffer
        put_varint32(&mut self.buffer, shared as u32);
        put_varint32(&mut self.buffer, non_shared as u32);
        put_varint32(&mut self.buffer, value.len() as u32);

        // Add string delta to buffer followed by value
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        // Update state
        self.last_key.truncate(shared);
        self.last_key.extend_from_slice(&key[shared..]);
        debug_assert_eq!(self.last_key, key);
        self.counter += 1;
    }

    /// Finish building the block and return a slice that refers to the
    /// block contents. The returned slice will remain valid for the
    /// lifetime of this builder or until `reset()` is called.
    pub fn finish(&mut self) -> &[u8] {
        // Append restart array
        for i in 0..self.restarts.len() {
            put_fixed32(&mut self.buffer, self.restarts[i]);
        }
        put_fixed32(&mut self.buffer, self.restarts.len() as u32);
        self.finished = true;
        &self.buffer
    }

    /// Estimate of the current (uncompressed) size of the block being built.
    pub fn current_size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    /// Return true iff no entries have been added since the last `reset()`.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
