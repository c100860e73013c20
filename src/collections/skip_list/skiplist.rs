//! Concurrent skip list over byte strings stored in an [`Arena`].
//!
//! Writes are serialized by an internal lock. Reads never lock: a node is
//! fully initialized before it is published with a release store, and nodes
//! are never unlinked or freed until the list itself is dropped.
//!
//! A node may be marked dead after insertion, which hides it from every
//! read path while keeping the list structure intact.

use crate::collections::skip_list::arena::Arena;
use crate::collections::skip_list::{rand_height, MAX_LEVEL};
use std::alloc::Layout;
use std::marker::PhantomData;
use std::cmp::Ordering as CmpOrdering;
use std::mem::{align_of, size_of};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Mutex;

pub trait KeyComparator: Send + Sync {
    fn compare_key(&self, a: &[u8], b: &[u8]) -> CmpOrdering;
}

#[repr(C)]
struct Node {
    key: *const u8,
    key_len: usize,
    dead: AtomicBool,
    height: usize,
    /// the actual length is `height`
    next: [AtomicPtr<Node>; 0],
}

impl Node {
    fn layout(height: usize) -> Layout {
        let size = size_of::<Node>() + height * size_of::<AtomicPtr<Node>>();
        // size is non-zero and the alignment is that of a pointer
        unsafe { Layout::from_size_align_unchecked(size, align_of::<Node>()) }
    }

    /// # Safety
    /// `node` points to a live node and `level < (*node).height`
    #[inline]
    unsafe fn next_slot<'a>(node: *const Node, level: usize) -> &'a AtomicPtr<Node> {
        debug_assert!(level < (*node).height);
        let base = ptr::addr_of!((*node).next) as *const AtomicPtr<Node>;
        &*base.add(level)
    }

    #[inline]
    unsafe fn next(node: *const Node, level: usize) -> *mut Node {
        Self::next_slot(node, level).load(Ordering::Acquire)
    }

    #[inline]
    unsafe fn set_next(node: *const Node, level: usize, x: *mut Node) {
        Self::next_slot(node, level).store(x, Ordering::Release)
    }

    #[inline]
    unsafe fn no_barrier_set_next(node: *const Node, level: usize, x: *mut Node) {
        Self::next_slot(node, level).store(x, Ordering::Relaxed)
    }

    #[inline]
    unsafe fn key<'a>(node: *const Node) -> &'a [u8] {
        std::slice::from_raw_parts((*node).key, (*node).key_len)
    }

    #[inline]
    unsafe fn is_dead(node: *const Node) -> bool {
        (*node).dead.load(Ordering::Acquire)
    }
}

/// Opaque cursor into a [`SkipList`]. A null position is "not valid".
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Position(*const Node);

impl Position {
    pub const INVALID: Position = Position(ptr::null());

    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.0.is_null()
    }
}

unsafe impl Send for Position {}
unsafe impl Sync for Position {}

/// Handle to an inserted entry, used to read it back or to mark it dead.
#[derive(Clone, Copy)]
pub struct EntryHandle<'a> {
    node: *const Node,
    _marker: PhantomData<&'a Node>,
}

pub struct SkipList<C> {
    comparator: C,
    arena: Arena,
    head: *const Node,
    max_height: AtomicUsize,
    len: AtomicUsize,
    write_lock: Mutex<()>,
}

unsafe impl<C: Send> Send for SkipList<C> {}
unsafe impl<C: Sync> Sync for SkipList<C> {}

impl<C: KeyComparator> SkipList<C> {
    pub fn new(comparator: C) -> SkipList<C> {
        let arena = Arena::default();
        let head = Self::new_node(&arena, ptr::NonNull::<u8>::dangling().as_ptr(), 0, MAX_LEVEL);
        SkipList {
            comparator,
            arena,
            head,
            max_height: AtomicUsize::new(1),
            len: AtomicUsize::new(0),
            write_lock: Mutex::new(()),
        }
    }

    fn new_node(arena: &Arena, key: *const u8, key_len: usize, height: usize) -> *const Node {
        let node = arena.allocate_with_layout(Node::layout(height)) as *mut Node;
        unsafe {
            ptr::write(
                node,
                Node {
                    key,
                    key_len,
                    dead: AtomicBool::new(false),
                    height,
                    next: [],
                },
            );
            let base = ptr::addr_of_mut!((*node).next) as *mut AtomicPtr<Node>;
            for i in 0..height {
                ptr::write(base.add(i), AtomicPtr::new(ptr::null_mut()));
            }
        }
        node
    }

    #[inline]
    pub fn memory_usage(&self) -> usize {
        self.arena.memory_usage()
    }

    /// Number of inserted entries, dead ones included.
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn max_height(&self) -> usize {
        self.max_height.load(Ordering::Relaxed)
    }

    #[inline]
    fn key_is_after_node(&self, key: &[u8], node: *const Node) -> bool {
        !node.is_null() && self.comparator.compare_key(unsafe { Node::key(node) }, key).is_lt()
    }

    /// Return the first node whose key is greater or equal than `key`, dead
    /// or alive. If `prev` is given, it is filled with the predecessor at
    /// every level.
    fn find_greater_or_equal(
        &self,
        key: &[u8],
        mut prev: Option<&mut [*const Node; MAX_LEVEL]>,
    ) -> *const Node {
        let mut x = self.head;
        let mut level = self.max_height() - 1;
        loop {
            let next = unsafe { Node::next(x, level) };
            if self.key_is_after_node(key, next) {
                // keep searching in this list
                x = next;
            } else {
                if let Some(ref mut p) = prev {
                    p[level] = x;
                }
                if level == 0 {
                    return next;
                }
                level -= 1;
            }
        }
    }

    /// Return the latest node with a key < `key`, or head if there is none.
    fn find_less_than(&self, key: &[u8]) -> *const Node {
        let mut x = self.head;
        let mut level = self.max_height() - 1;
        loop {
            debug_assert!(x == self.head || self.key_is_after_node(key, x));
            let next = unsafe { Node::next(x, level) };
            if next.is_null()
                || !self
                    .comparator
                    .compare_key(unsafe { Node::key(next) }, key)
                    .is_lt()
            {
                if level == 0 {
                    return x;
                }
                level -= 1;
            } else {
                x = next;
            }
        }
    }

    /// Return the last node in the list, or head if the list is empty.
    fn find_last(&self) -> *const Node {
        let mut x = self.head;
        let mut level = self.max_height() - 1;
        loop {
            let next = unsafe { Node::next(x, level) };
            if next.is_null() {
                if level == 0 {
                    return x;
                }
                level -= 1;
            } else {
                x = next;
            }
        }
    }

    /// Allocate `len` bytes for a key, let `fill` write it, and link it into
    /// the list. Keys must be unique among live entries.
    pub fn insert_with(&self, len: usize, fill: impl FnOnce(&mut [u8])) -> EntryHandle<'_> {
        let _guard = self.write_lock.lock().unwrap();

        let key_ptr = self.arena.allocate(len.max(1));
        let key = unsafe { std::slice::from_raw_parts_mut(key_ptr, len) };
        fill(key);
        let key: &[u8] = key;

        let mut prev = [ptr::null::<Node>(); MAX_LEVEL];
        let x = self.find_greater_or_equal(key, Some(&mut prev));
        debug_assert!(
            x.is_null()
                || unsafe { Node::is_dead(x) }
                || !self.comparator.compare_key(key, unsafe { Node::key(x) }).is_eq(),
            "duplicate live key inserted into skip list"
        );

        let height = rand_height();
        let max_height = self.max_height();
        if height > max_height {
            for p in prev.iter_mut().take(height).skip(max_height) {
                *p = self.head;
            }
            // It is ok to mutate max_height without any synchronization with
            // concurrent readers. A reader that observes the new value sees
            // either null or the new node in the new levels of head.
            self.max_height.store(height, Ordering::Relaxed);
        }

        let node = Self::new_node(&self.arena, key.as_ptr(), len, height);
        for (i, p) in prev.iter().enumerate().take(height) {
            unsafe {
                // no barrier needed since we publish a pointer to `node` in prev[i] next
                Node::no_barrier_set_next(node, i, Node::next(*p, i));
                Node::set_next(*p, i, node as *mut Node);
            }
        }
        self.len.fetch_add(1, Ordering::AcqRel);

        EntryHandle {
            node,
            _marker: PhantomData,
        }
    }

    /// Returns true if a live entry equal to `key` is in the list.
    pub fn contains(&self, key: &[u8]) -> bool {
        let pos = self.seek(key);
        pos.is_valid() && self.comparator.compare_key(self.key(pos), key).is_eq()
    }

    // Cursor operations. Dead nodes are skipped by all of them.

    #[inline]
    fn skip_dead_forward(&self, mut x: *const Node) -> Position {
        while !x.is_null() && unsafe { Node::is_dead(x) } {
            x = unsafe { Node::next(x, 0) };
        }
        Position(x)
    }

    fn skip_dead_backward(&self, mut x: *const Node) -> Position {
        while x != self.head && unsafe { Node::is_dead(x) } {
            x = self.find_less_than(unsafe { Node::key(x) });
        }
        if x == self.head {
            Position::INVALID
        } else {
            Position(x)
        }
    }

    pub fn seek_to_first(&self) -> Position {
        self.skip_dead_forward(unsafe { Node::next(self.head, 0) })
    }

    pub fn seek_to_last(&self) -> Position {
        self.skip_dead_backward(self.find_last())
    }

    /// First live position with a key >= `target`.
    pub fn seek(&self, target: &[u8]) -> Position {
        self.skip_dead_forward(self.find_greater_or_equal(target, None))
    }

    pub fn next(&self, pos: Position) -> Position {
        debug_assert!(pos.is_valid());
        self.skip_dead_forward(unsafe { Node::next(pos.0, 0) })
    }

    pub fn prev(&self, pos: Position) -> Position {
        // Instead of using explicit "prev" links, we just search for the
        // last node that falls before key.
        debug_assert!(pos.is_valid());
        self.skip_dead_backward(self.find_less_than(self.key(pos)))
    }

    /// Key at `pos`. The position must come from this list.
    #[inline]
    pub fn key(&self, pos: Position) -> &[u8] {
        debug_assert!(pos.is_valid());
        unsafe { Node::key(pos.0) }
    }
}

impl<'a> EntryHandle<'a> {
    #[inline]
    pub fn key(&self) -> &'a [u8] {
        unsafe { Node::key(self.node) }
    }

    /// Hide the entry from every reader. Irreversible.
    pub fn mark_dead(&self) {
        unsafe { (*self.node).dead.store(true, Ordering::Release) }
    }
}

#[cfg(test)]
mod tests {
    use crate::collections::skip_list::skiplist::{KeyComparator, SkipList};
    use rand::Rng;
    use std::cmp::Ordering;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::sync::Arc;

    struct U64Comparator;

    impl KeyComparator for U64Comparator {
        fn compare_key(&self, a: &[u8], b: &[u8]) -> Ordering {
            decode(a).cmp(&decode(b))
        }
    }

    fn decode(b: &[u8]) -> u64 {
        u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
    }

    fn insert(list: &SkipList<U64Comparator>, key: u64) {
        list.insert_with(8, |buf| buf.copy_from_slice(&key.to_be_bytes()));
    }

    #[test]
    fn test_empty() {
        let list = SkipList::new(U64Comparator);
        assert!(!list.contains(&10u64.to_be_bytes()));
        assert!(!list.seek_to_first().is_valid());
        assert!(!list.seek(&100u64.to_be_bytes()).is_valid());
        assert!(!list.seek_to_last().is_valid());
    }

    #[test]
    fn test_insert_and_lookup() {
        const N: usize = 2000;
        const R: u64 = 5000;
        let mut rng = rand::thread_rng();
        let mut keys = BTreeSet::new();
        let list = SkipList::new(U64Comparator);
        for _ in 0..N {
            let key = rng.gen_range(0..R);
            if keys.insert(key) {
                insert(&list, key);
            }
        }
        assert_eq!(keys.len(), list.len());

        for i in 0..R {
            assert_eq!(keys.contains(&i), list.contains(&i.to_be_bytes()));
        }

        // simple iterator tests
        let pos = list.seek(&0u64.to_be_bytes());
        assert!(pos.is_valid());
        assert_eq!(*keys.iter().next().unwrap(), decode(list.key(pos)));

        let pos = list.seek_to_first();
        assert_eq!(*keys.iter().next().unwrap(), decode(list.key(pos)));

        let pos = list.seek_to_last();
        assert_eq!(*keys.iter().next_back().unwrap(), decode(list.key(pos)));

        // forward iteration test
        for i in 0..R {
            let mut pos = list.seek(&i.to_be_bytes());
            let mut model = keys.range(i..);
            for _ in 0..3 {
                match model.next() {
                    Some(k) => {
                        assert!(pos.is_valid());
                        assert_eq!(*k, decode(list.key(pos)));
                        pos = list.next(pos);
                    }
                    None => {
                        assert!(!pos.is_valid());
                        break;
                    }
                }
            }
        }

        // backward iteration test
        let mut pos = list.seek_to_last();
        for k in keys.iter().rev() {
            assert!(pos.is_valid());
            assert_eq!(*k, decode(list.key(pos)));
            pos = list.prev(pos);
        }
        assert!(!pos.is_valid());
    }

    #[test]
    fn test_dead_entries_are_hidden() {
        let list = SkipList::new(U64Comparator);
        let mut handles = vec![];
        for k in 0..10u64 {
            handles.push(list.insert_with(8, |buf| buf.copy_from_slice(&k.to_be_bytes())));
        }
        for k in [0usize, 4, 5, 9] {
            handles[k].mark_dead();
        }
        let mut seen = vec![];
        let mut pos = list.seek_to_first();
        while pos.is_valid() {
            seen.push(decode(list.key(pos)));
            pos = list.next(pos);
        }
        assert_eq!(seen, vec![1, 2, 3, 6, 7, 8]);

        assert_eq!(decode(list.key(list.seek(&4u64.to_be_bytes()))), 6);
        assert_eq!(decode(list.key(list.seek_to_last())), 8);
        let pos = list.prev(list.seek(&6u64.to_be_bytes()));
        assert_eq!(decode(list.key(pos)), 3);
        assert!(!list.prev(list.seek_to_first()).is_valid());

        // a dead key may be inserted again
        insert(&list, 4);
        assert!(list.contains(&4u64.to_be_bytes()));
    }

    #[test]
    fn test_concurrent_read_while_insert() {
        let list = Arc::new(SkipList::new(U64Comparator));
        let done = Arc::new(AtomicBool::new(false));
        let mut readers = vec![];
        for _ in 0..4 {
            let list = list.clone();
            let done = done.clone();
            readers.push(std::thread::spawn(move || {
                while !done.load(AtomicOrdering::Acquire) {
                    // keys are inserted in increasing order, so any snapshot of
                    // the list must be sorted and gap-free from zero.
                    let mut expected = 0;
                    let mut pos = list.seek_to_first();
                    while pos.is_valid() {
                        assert_eq!(expected, decode(list.key(pos)));
                        expected += 1;
                        pos = list.next(pos);
                    }
                }
            }));
        }
        for k in 0..20000u64 {
            insert(&list, k);
        }
        done.store(true, AtomicOrdering::Release);
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(list.len(), 20000);
    }
}
