//! Pool of reusable byte buffers, bucketed by power-of-two capacity.

use std::sync::Mutex;

const MIN_CLASS_BITS: u32 = 8;
const MAX_CLASS_BITS: u32 = 22;
const NUM_CLASSES: usize = (MAX_CLASS_BITS - MIN_CLASS_BITS + 1) as usize;
const MAX_BUFFERS_PER_CLASS: usize = 16;

/// Buffers handed out by [`BufferPool::acquire`] have a capacity that is a
/// power of two no smaller than the requested length. Buffers larger than
/// the biggest class are allocated directly and never kept.
pub struct BufferPool {
    classes: Vec<Mutex<Vec<Vec<u8>>>>,
}

impl Default for BufferPool {
    fn default() -> Self {
        BufferPool {
            classes: (0..NUM_CLASSES).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }
}

#[inline]
fn class_of(capacity: usize) -> Option<usize> {
    let bits = capacity.max(1).next_power_of_two().trailing_zeros();
    let bits = bits.max(MIN_CLASS_BITS);
    if bits > MAX_CLASS_BITS {
        None
    } else {
        Some((bits - MIN_CLASS_BITS) as usize)
    }
}

impl BufferPool {
    /// Get a zero-filled buffer of exactly `len` bytes.
    pub fn acquire(&self, len: usize) -> Vec<u8> {
        let mut buf = match class_of(len) {
            Some(class) => {
                let pooled = self.classes[class].lock().unwrap().pop();
                pooled.unwrap_or_else(|| Vec::with_capacity(1 << (class as u32 + MIN_CLASS_BITS)))
            }
            None => Vec::with_capacity(len),
        };
        buf.clear();
        buf.resize(len, 0);
        buf
    }

    /// Hand a buffer back to the pool.
    pub fn release(&self, buf: Vec<u8>) {
        let capacity = buf.capacity();
        if !capacity.is_power_of_two() {
            return;
        }
        if let Some(class) = class_of(capacity) {
            if (1 << (class as u32 + MIN_CLASS_BITS)) != capacity {
                return;
            }
            let mut guard = self.classes[class].lock().unwrap();
            if guard.len() < MAX_BUFFERS_PER_CLASS {
                guard.push(buf);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pooled(&self) -> usize {
        self.classes.iter().map(|c| c.lock().unwrap().len()).sum()
    }
}
