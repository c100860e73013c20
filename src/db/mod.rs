//! The database: write path, read path, background compaction and the
//! files a database keeps on disk.

mod db_impl;
pub mod db_iter;
pub mod filename;
pub mod key_types;
pub mod options;
pub mod snapshot;
pub mod statistics;
pub mod write_batch;

use crate::db::db_impl::{destroy_db, DBImpl};
use crate::db::db_iter::DBIterator;
use crate::db::options::{Options, ReadOptions, WriteOptions};
use crate::db::snapshot::Snapshot;
use crate::db::statistics::Statistics;
use crate::db::write_batch::WriteBatch;
use crate::Result;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

/// A persistent ordered map from keys to values.
///
/// A `DB` is safe for concurrent access from multiple threads without
/// any external synchronization. Dropping it waits for the running
/// background compaction and stops the compaction thread.
pub struct DB {
    inner: Arc<DBImpl>,
    compaction_handle: Option<JoinHandle<()>>,
}

impl DB {
    /// Open the database stored at `path`.
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<DB> {
        let (inner, handle) = DBImpl::open(path.as_ref(), &options)?;
        Ok(DB {
            inner,
            compaction_handle: Some(handle),
        })
    }

    /// Stop background work and release the database lock once every
    /// iterator created from this database is dropped.
    pub fn close(self) {}

    /// Set the database entry for `key` to `value`.
    pub fn put(&self, options: &WriteOptions, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(options, batch)
    }

    /// Remove the database entry (if any) for `key`. It is not an error
    /// if `key` did not exist in the database.
    pub fn delete(&self, options: &WriteOptions, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(options, batch)
    }

    /// Apply the specified updates to the database atomically.
    pub fn write(&self, options: &WriteOptions, batch: WriteBatch) -> Result<()> {
        self.inner.write(options, batch)
    }

    /// Read the latest value of `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get(&ReadOptions::default(), key)
    }

    /// Read the value of `key` as seen by `options.snapshot`, or the
    /// latest value if no snapshot is set.
    pub fn read(&self, options: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get(options, key)
    }

    /// Return an iterator over the contents of the database. The iterator
    /// is initially invalid; the caller must call one of the seek methods
    /// before using it.
    pub fn iter(&self, options: &ReadOptions) -> DBIterator {
        self.inner.iter(options)
    }

    /// A handle to the current state. Reads through the handle observe
    /// this state until every clone of it is dropped.
    pub fn snapshot(&self) -> Snapshot {
        self.inner.snapshot()
    }

    pub fn release_snapshot(&self, snapshot: Snapshot) {
        drop(snapshot);
    }

    /// Compact the underlying storage for the key range `[begin, end]`.
    /// `None` is treated as a key before (or after) all keys.
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        self.inner.compact_range(begin, end)
    }

    /// Compact the files of one level overlapping `[begin, end]` into
    /// the next level.
    pub fn compact_level(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<()> {
        self.inner.compact_level(level, begin, end)
    }

    /// Flush the memtable to a table file and wait for it to be installed.
    pub fn compact_memtable(&self) -> Result<()> {
        self.inner.compact_memtable()
    }

    /// Return the value of a database property, or `None` if `property`
    /// is not understood. Supported properties:
    ///
    /// - `lsmkv.num-files-at-level<N>`: number of files at level `N`
    /// - `lsmkv.stats`: a multi-line table of per-level statistics
    /// - `lsmkv.sstables`: the files of every level
    /// - `lsmkv.approximate-memory-usage`: bytes used by memtables and
    ///   the block cache
    pub fn get_property(&self, property: &str) -> Option<String> {
        self.inner.get_property(property)
    }

    pub fn get_statistics(&self) -> Statistics {
        self.inner.get_statistics()
    }

    /// For each `(start, limit)` range, the approximate file system
    /// space used by keys in `[start, limit)`.
    pub fn get_approximate_sizes(&self, ranges: &[(&[u8], &[u8])]) -> Vec<u64> {
        self.inner.get_approximate_sizes(ranges)
    }

    /// Destroy the contents of the database at `path`.
    pub fn destroy(path: impl AsRef<Path>) -> Result<()> {
        destroy_db(path.as_ref())
    }
}

impl Drop for DB {
    fn drop(&mut self) {
        self.inner.shutdown();
        if let Some(handle) = self.compaction_handle.take() {
            if handle.join().is_err() {
                error!("compaction thread panicked");
            }
        }
    }
}
