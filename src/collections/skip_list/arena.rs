use std::alloc::Layout;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub(crate) const BLOCK_SIZE: usize = 4096;

/// Alignment of every block handed out by the arena.
const BLOCK_ALIGN: usize = 8;

struct AllocState {
    alloc_ptr: *mut u8,
    alloc_bytes_remaining: usize,
    // Array of allocated memory blocks
    blocks: Vec<(NonNull<u8>, usize)>,
}

/// Append-only allocator for memtable nodes and entries.
///
/// Memory handed out stays valid and never moves until the arena is
/// dropped, which frees every block at once. Allocation takes `&self` so the
/// arena can be shared with lock-free readers of the memory it returned.
pub struct Arena {
    state: Mutex<AllocState>,
    memory_usage: AtomicUsize,
}

unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Default for Arena {
    fn default() -> Self {
        Arena {
            state: Mutex::new(AllocState {
                alloc_ptr: std::ptr::null_mut(),
                alloc_bytes_remaining: 0,
                blocks: Vec::with_capacity(2),
            }),
            memory_usage: AtomicUsize::new(0),
        }
    }
}

impl Arena {
    /// Allocate `bytes` bytes with no alignment guarantee.
    pub fn allocate(&self, bytes: usize) -> *mut u8 {
        debug_assert!(bytes > 0);
        let mut state = self.state.lock().unwrap();
        self.allocate_locked(&mut state, bytes)
    }

    pub fn allocate_with_layout(&self, layout: Layout) -> *mut u8 {
        debug_assert!(layout.align() <= BLOCK_ALIGN);
        let mut state = self.state.lock().unwrap();
        let current_mod = state.alloc_ptr as usize & (layout.align() - 1);
        let slop = if current_mod == 0 {
            0
        } else {
            layout.align() - current_mod
        };
        let needed = layout.size() + slop;
        if needed <= state.alloc_bytes_remaining {
            let result = unsafe { state.alloc_ptr.add(slop) };
            state.alloc_ptr = unsafe { state.alloc_ptr.add(needed) };
            state.alloc_bytes_remaining -= needed;
            result
        } else {
            // blocks are always aligned to BLOCK_ALIGN
            self.allocate_fallback(&mut state, layout.size())
        }
    }

    #[inline]
    pub fn memory_usage(&self) -> usize {
        self.memory_usage.load(Ordering::Acquire)
    }

    fn allocate_locked(&self, state: &mut AllocState, bytes: usize) -> *mut u8 {
        if bytes <= state.alloc_bytes_remaining {
            let result = state.alloc_ptr;
            unsafe {
                state.alloc_ptr = state.alloc_ptr.add(bytes);
            }
            state.alloc_bytes_remaining -= bytes;
            result
        } else {
            self.allocate_fallback(state, bytes)
        }
    }

    fn allocate_fallback(&self, state: &mut AllocState, bytes: usize) -> *mut u8 {
        if bytes > BLOCK_SIZE / 4 {
            // Object is more than a quarter of our block size.  Allocate it separately
            // to avoid wasting too much space in leftover bytes.
            return self.allocate_new_block(state, bytes);
        }

        // We waste the remaining space in the current block.
        state.alloc_ptr = self.allocate_new_block(state, BLOCK_SIZE);
        state.alloc_bytes_remaining = BLOCK_SIZE;

        let result = state.alloc_ptr;
        unsafe {
            state.alloc_ptr = state.alloc_ptr.add(bytes);
        }
        state.alloc_bytes_remaining -= bytes;
        result
    }

    fn allocate_new_block(&self, state: &mut AllocState, bytes: usize) -> *mut u8 {
        let layout = Self::layout_by_bytes(bytes);
        let ptr = unsafe { std::alloc::alloc(layout) };
        let ptr = match NonNull::new(ptr) {
            Some(p) => p,
            None => std::alloc::handle_alloc_error(layout),
        };
        state.blocks.push((ptr, bytes));
        self.memory_usage
            .fetch_add(bytes + size_of::<*mut u8>(), Ordering::AcqRel);
        ptr.as_ptr()
    }

    #[inline]
    fn layout_by_bytes(bytes: usize) -> Layout {
        // size is never zero and BLOCK_ALIGN is a power of two
        unsafe { Layout::from_size_align_unchecked(bytes, BLOCK_ALIGN) }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        for &(ptr, bytes) in &state.blocks {
            unsafe {
                std::alloc::dealloc(ptr.as_ptr(), Self::layout_by_bytes(bytes));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::collections::skip_list::arena::{Arena, BLOCK_SIZE};
    use rand::Rng;
    use std::alloc::Layout;

    #[test]
    fn test_empty() {
        let arena = Arena::default();
        assert_eq!(arena.memory_usage(), 0);
    }

    #[test]
    fn test_simple() {
        let arena = Arena::default();
        let mut allocated: Vec<(usize, *mut u8)> = vec![];
        let mut bytes = 0;
        let mut rng = rand::thread_rng();
        const N: usize = 100000;
        for i in 0..N {
            let mut s = if i % (N / 10) == 0 {
                i
            } else if rng.gen_ratio(1, 4000) {
                rng.gen_range(0..6000)
            } else if rng.gen_ratio(1, 10) {
                rng.gen_range(0..100)
            } else {
                rng.gen_range(0..20)
            };
            if s == 0 {
                // Our arena disallows size 0 allocations.
                s = 1;
            }
            let r = if rng.gen_ratio(1, 10) {
                arena.allocate_with_layout(Layout::from_size_align(s, 8).unwrap())
            } else {
                arena.allocate(s)
            };
            for b in 0..s {
                // Fill the "i"th allocation with a known bit pattern
                unsafe { *r.add(b) = (i % 256) as u8 };
            }
            bytes += s;
            allocated.push((s, r));
            assert!(arena.memory_usage() >= bytes);
            if i > N / 10 {
                assert!(arena.memory_usage() as f64 <= bytes as f64 * 1.10);
            }
        }
        for (i, (num_bytes, p)) in allocated.into_iter().enumerate() {
            for b in 0..num_bytes {
                // Check the "i"th allocation for the known bit pattern
                assert_eq!(unsafe { *p.add(b) } as usize & 0xff, i % 256);
            }
        }
    }

    #[test]
    fn test_layout() {
        let arena = Arena::default();
        arena.allocate(1);
        let layout = Layout::from_size_align(5, 4).unwrap();
        assert_eq!(arena.allocate_with_layout(layout) as usize % 4, 0);
        arena.allocate(3);
        let layout = Layout::from_size_align(19, 2).unwrap();
        assert_eq!(arena.allocate_with_layout(layout) as usize % 2, 0);
        let layout = Layout::from_size_align(22, 8).unwrap();
        assert_eq!(arena.allocate_with_layout(layout) as usize % 8, 0);
        let layout = Layout::from_size_align(BLOCK_SIZE * 2, 8).unwrap();
        assert_eq!(arena.allocate_with_layout(layout) as usize % 8, 0);
    }
}
