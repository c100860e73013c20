use crate::coding::{decode_fixed32, get_varint32};
use crate::collections::buffer_pool::BufferPool;
use crate::comparator::Comparator;
use crate::error::LsmKvError;
use crate::iterator::KvIterator;
use crate::Result;
use std::cmp::Ordering;
use std::sync::Arc;

/// A decoded, immutable block. See `block_builder` for the layout.
pub struct Block {
    data: Vec<u8>,
    /// Offset in data of restart array
    restart_offset: usize,
    num_restarts: usize,
    /// Receives `data` back when the block is dropped
    pool: Option<Arc<BufferPool>>,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Result<Block> {
        if data.len() < 4 {
            return Err(LsmKvError::corruption("bad block contents"));
        }
        let num_restarts = decode_fixed32(&data[data.len() - 4..]) as usize;
        let max_restarts_allowed = (data.len() - 4) / 4;
        if num_restarts > max_restarts_allowed || num_restarts == 0 {
            // The size is too small for num_restarts()
            return Err(LsmKvError::corruption("bad block contents"));
        }
        let restart_offset = data.len() - (1 + num_restarts) * 4;
        let restarts_in_bounds = data[restart_offset..data.len() - 4]
            .chunks_exact(4)
            .all(|r| decode_fixed32(r) as usize <= restart_offset);
        if !restarts_in_bounds {
            return Err(LsmKvError::corruption("bad restart point in block"));
        }
        Ok(Block {
            data,
            restart_offset,
            num_restarts,
            pool: None,
        })
    }

    /// Like `new`, for contents acquired from `pool`.
    pub fn with_pool(data: Vec<u8>, pool: Arc<BufferPool>) -> Result<Block> {
        let mut block = Block::new(data)?;
        block.pool = Some(pool);
        Ok(block)
    }

    /// Bytes used by the block, for cache accounting.
    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn iter(self: &Arc<Self>, comparator: Arc<dyn Comparator>) -> BlockIterator {
        BlockIterator {
            block: self.clone(),
            comparator,
            current: self.restart_offset,
            restart_index: self.num_restarts,
            key: vec![],
            value_range: (self.restart_offset, self.restart_offset),
            status: None,
        }
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release(std::mem::take(&mut self.data));
        }
    }
}

/// Decode the next block entry starting at `offset`, returning
/// `(shared, non_shared, value_length, header_length)`. Returns `None`
/// if the entry is malformed or runs past `limit`.
#[inline]
fn decode_entry(data: &[u8], offset: usize, limit: usize) -> Option<(usize, usize, usize, usize)> {
    let p = data.get(offset..limit)?;
    if p.len() < 3 {
        return None;
    }
    let (shared, non_shared, value_length, header_len) = if (p[0] | p[1] | p[2]) < 128 {
        // Fast path: all three values are encoded in one byte each
        (p[0] as usize, p[1] as usize, p[2] as usize, 3)
    } else {
        let (shared, n1) = get_varint32(p)?;
        let (non_shared, n2) = get_varint32(&p[n1..])?;
        let (value_length, n3) = get_varint32(&p[n1 + n2..])?;
        (
            shared as usize,
            non_shared as usize,
            value_length as usize,
            n1 + n2 + n3,
        )
    };
    if p.len() - header_len < non_shared + value_length {
        return None;
    }
    Some((shared, non_shared, value_length, header_len))
}

pub struct BlockIterator {
    block: Arc<Block>,
    comparator: Arc<dyn Comparator>,
    /// offset in data of current entry. >= restart_offset if !valid
    current: usize,
    /// Index of restart block in which current falls
    restart_index: usize,
    key: Vec<u8>,
    value_range: (usize, usize),
    status: Option<LsmKvError>,
}

impl BlockIterator {
    #[inline]
    fn restarts(&self) -> usize {
        self.block.restart_offset
    }

    /// Return the offset in data just past the end of the current entry.
    #[inline]
    fn next_entry_offset(&self) -> usize {
        self.value_range.1
    }

    #[inline]
    fn restart_point(&self, index: usize) -> usize {
        debug_assert!(index < self.block.num_restarts);
        decode_fixed32(&self.block.data[self.restarts() + index * 4..]) as usize
    }

    fn seek_to_restart_point(&mut self, index: usize) {
        self.key.clear();
        self.restart_index = index;
        // current will be fixed by parse_next_key()

        // parse_next_key() starts at the end of value, so set value accordingly
        let offset = self.restart_point(index);
        self.value_range = (offset, offset);
    }

    fn mark_invalid(&mut self) {
        self.current = self.restarts();
        self.restart_index = self.block.num_restarts;
    }

    fn corruption_error(&mut self) {
        self.mark_invalid();
        self.status = Some(LsmKvError::corruption("bad entry in block"));
        self.key.clear();
        self.value_range = (self.current, self.current);
    }

    fn parse_next_key(&mut self) -> bool {
        self.current = self.next_entry_offset();
        let limit = self.restarts();
        if self.current >= limit {
            // No more entries to return. Mark as invalid.
            self.mark_invalid();
            return false;
        }

        // Decode next entry
        match decode_entry(&self.block.data, self.current, limit) {
            Some((shared, non_shared, value_length, header_len)) if self.key.len() >= shared => {
                let key_start = self.current + header_len;
                self.key.truncate(shared);
                self.key
                    .extend_from_slice(&self.block.data[key_start..key_start + non_shared]);
                let value_start = key_start + non_shared;
                self.value_range = (value_start, value_start + value_length);
                while self.restart_index + 1 < self.block.num_restarts
                    && self.restart_point(self.restart_index + 1) < self.current
                {
                    self.restart_index += 1;
                }
                true
            }
            _ => {
                self.corruption_error();
                false
            }
        }
    }
}

impl KvIterator for BlockIterator {
    fn valid(&self) -> bool {
        self.current < self.restarts()
    }

    fn seek_to_first(&mut self) {
        self.seek_to_restart_point(0);
        self.parse_next_key();
    }

    fn seek_to_last(&mut self) {
        self.seek_to_restart_point(self.block.num_restarts - 1);
        while self.parse_next_key() && self.next_entry_offset() < self.restarts() {
            // Keep skipping
        }
    }

    fn seek(&mut self, target: &[u8]) {
        // Binary search in restart array to find the last restart point
        // with a key < target
        let mut left = 0;
        let mut right = self.block.num_restarts - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            let region_offset = self.restart_point(mid);
            match decode_entry(&self.block.data, region_offset, self.restarts()) {
                Some((0, non_shared, _, header_len)) => {
                    let key_start = region_offset + header_len;
                    let mid_key = &self.block.data[key_start..key_start + non_shared];
                    if self.comparator.compare(mid_key, target) == Ordering::Less {
                        // Key at "mid" is smaller than "target". Therefore all
                        // blocks before "mid" are uninteresting.
                        left = mid;
                    } else {
                        // Key at "mid" is >= "target". Therefore all blocks at or
                        // after "mid" are uninteresting.
                        right = mid - 1;
                    }
                }
                _ => {
                    self.corruption_error();
                    return;
                }
            }
        }

        // Linear search (within restart block) for first key >= target
        self.seek_to_restart_point(left);
        loop {
            if !self.parse_next_key() {
                return;
            }
            if self.comparator.compare(&self.key, target) != Ordering::Less {
                return;
            }
        }
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.parse_next_key();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());

        // Scan backwards to a restart point before current
        let original = self.current;
        while self.restart_point(self.restart_index) >= original {
            if self.restart_index == 0 {
                // No more entries
                self.mark_invalid();
                return;
            }
            self.restart_index -= 1;
        }

        self.seek_to_restart_point(self.restart_index);
        // Loop until end of current entry hits the start of original entry
        while self.parse_next_key() && self.next_entry_offset() < original {}
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.key
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.block.data[self.value_range.0..self.value_range.1]
    }

    fn status(&self) -> Result<()> {
        match &self.status {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}
