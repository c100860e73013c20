//! A filter block is stored near the end of a table file. It contains
//! filters (e.g. bloom filters) for all data blocks in the table
//! combined into a single filter block.
//!
//! ```text
//! [filter 0] ... [filter N-1]
//! [offset of filter 0]: fixed32
//! ...
//! [offset of filter N-1]: fixed32
//! [offset of beginning of offset array]: fixed32
//! lg(base): uint8
//! ```

use crate::coding::{decode_fixed32, put_fixed32};
use crate::filter::FilterPolicy;
use std::sync::Arc;

/// Generate new filter every 2KB of data
const FILTER_BASE_LG: u8 = 11;
const FILTER_BASE: u64 = 1 << FILTER_BASE_LG;

/// Constructs all of the filters for a particular table. The sequence
/// of calls must match the regexp `(start_block add_key*)* finish`.
pub struct FilterBlockBuilder {
    policy: Arc<dyn FilterPolicy>,
    /// Flattened key contents
    keys: Vec<u8>,
    /// Starting index in keys of each key
    start: Vec<usize>,
    /// Filter data computed so far
    result: Vec<u8>,
    filter_offsets: Vec<u32>,
}

impl FilterBlockBuilder {
    pub fn new(policy: Arc<dyn FilterPolicy>) -> FilterBlockBuilder {
        FilterBlockBuilder {
            policy,
            keys: vec![],
            start: vec![],
            result: vec![],
            filter_offsets: vec![],
        }
    }

    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = block_offset / FILTER_BASE;
        debug_assert!(filter_index >= self.filter_offsets.len() as u64);
        while filter_index > self.filter_offsets.len() as u64 {
            self.generate_filter();
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        self.start.push(self.keys.len());
        self.keys.extend_from_slice(key);
    }

    pub fn finish(&mut self) -> &[u8] {
        if !self.start.is_empty() {
            self.generate_filter();
        }

        // Append array of per-filter offsets
        let array_offset = self.result.len() as u32;
        for i in 0..self.filter_offsets.len() {
            put_fixed32(&mut self.result, self.filter_offsets[i]);
        }
        put_fixed32(&mut self.result, array_offset);
        // Save encoding parameter in result
        self.result.push(FILTER_BASE_LG);
        &self.result
    }

    fn generate_filter(&mut self) {
        self.filter_offsets.push(self.result.len() as u32);
        if self.start.is_empty() {
            // Fast path if there are no keys for this filter
            return;
        }

        // Make list of keys from flattened key structure
        let num_keys = self.start.len();
        self.start.push(self.keys.len()); // Simplify length computation
        let key_list: Vec<&[u8]> = (0..num_keys)
            .map(|i| &self.keys[self.start[i]..self.start[i + 1]])
            .collect();

        // Generate filter for current set of keys and append to result.
        self.policy.create_filter(&key_list, &mut self.result);

        self.keys.clear();
        self.start.clear();
    }
}

pub struct FilterBlockReader {
    policy: Arc<dyn FilterPolicy>,
    data: Vec<u8>,
    /// Offset of the beginning of the offset array (at the end of data)
    offset: usize,
    /// Number of entries in offset array
    num: usize,
    /// Encoding parameter (see FILTER_BASE_LG)
    base_lg: u8,
}

impl FilterBlockReader {
    /// A malformed block yields a reader that lets every key through.
    pub fn new(policy: Arc<dyn FilterPolicy>, data: Vec<u8>) -> FilterBlockReader {
        let mut reader = FilterBlockReader {
            policy,
            data,
            offset: 0,
            num: 0,
            base_lg: 0,
        };
        let n = reader.data.len();
        if n < 5 {
            // 1 byte for base_lg and 4 for start of offset array
            return reader;
        }
        reader.base_lg = reader.data[n - 1];
        let last_word = decode_fixed32(&reader.data[n - 5..]) as usize;
        if last_word > n - 5 {
            return reader;
        }
        reader.offset = last_word;
        reader.num = (n - 5 - last_word) / 4;
        reader
    }

    pub fn key_may_match(&self, block_offset: u64, key: &[u8]) -> bool {
        let index = (block_offset >> self.base_lg) as usize;
        if index < self.num {
            let start = decode_fixed32(&self.data[self.offset + index * 4..]) as usize;
            let limit = decode_fixed32(&self.data[self.offset + index * 4 + 4..]) as usize;
            if start <= limit && limit <= self.offset {
                let filter = &self.data[start..limit];
                return self.policy.key_may_match(key, filter);
            } else if start == limit {
                // Empty filters do not match any keys
                return false;
            }
        }
        // Errors are treated as potential matches
        true
    }
}
