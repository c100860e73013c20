use crate::db::key_types::SequenceNumber;
use std::sync::{Arc, Weak};

/// A consistent read view pinned at a sequence number.
///
/// A snapshot stays live as long as any clone of it exists; dropping the
/// last clone releases it.
#[derive(Clone, Debug)]
pub struct Snapshot {
    inner: Arc<SnapshotInner>,
}

#[derive(Debug)]
struct SnapshotInner {
    sequence: SequenceNumber,
}

impl Snapshot {
    #[inline]
    pub fn sequence(&self) -> SequenceNumber {
        self.inner.sequence
    }
}

/// Snapshots handed out by a database, in creation order.
#[derive(Default)]
pub(crate) struct SnapshotList {
    list: Vec<Weak<SnapshotInner>>,
}

impl SnapshotList {
    pub(crate) fn create(&mut self, sequence: SequenceNumber) -> Snapshot {
        // released snapshots leave dead entries behind
        self.prune();
        debug_assert!(self.newest().map_or(true, |s| s <= sequence));
        let inner = Arc::new(SnapshotInner { sequence });
        self.list.push(Arc::downgrade(&inner));
        Snapshot { inner }
    }

    fn prune(&mut self) {
        self.list.retain(|s| s.strong_count() > 0);
    }

    pub(crate) fn is_empty(&mut self) -> bool {
        self.prune();
        self.list.is_empty()
    }

    /// Sequence of the oldest live snapshot.
    pub(crate) fn oldest(&mut self) -> Option<SequenceNumber> {
        self.prune();
        self.list
            .first()
            .and_then(|s| s.upgrade())
            .map(|s| s.sequence)
    }

    fn newest(&self) -> Option<SequenceNumber> {
        self.list
            .iter()
            .rev()
            .find_map(|s| s.upgrade())
            .map(|s| s.sequence)
    }
}
