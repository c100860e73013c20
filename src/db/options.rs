use crate::comparator::{BytewiseComparator, Comparator};
use crate::db::snapshot::Snapshot;
use crate::filter::FilterPolicy;
use std::sync::Arc;

/// Number of levels in the tree.
pub const NUM_LEVELS: usize = 7;

/// Level-0 compaction is started when we hit this many files.
pub const L0_COMPACTION_TRIGGER: usize = 4;

/// Soft limit on number of level-0 files. We slow down writes at this point.
pub const L0_SLOWDOWN_WRITES_TRIGGER: usize = 8;

/// Maximum number of level-0 files. We stop writes at this point.
pub const L0_STOP_WRITES_TRIGGER: usize = 12;

/// Maximum level to which a new compacted memtable is pushed if it
/// does not create overlap. We try to push to level 2 to avoid the
/// relatively expensive level 0=>1 compactions and to avoid some
/// expensive manifest file operations. We do not push all the way to
/// the largest level since that can generate a lot of wasted disk
/// space if the same key space is being repeatedly overwritten.
pub const MAX_MEM_COMPACT_LEVEL: usize = 2;

/// Approximate gap in bytes between samples of data read during iteration.
pub const READ_BYTES_PERIOD: u64 = 1048576;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionType {
    None = 0,
    Snappy = 1,
}

impl CompressionType {
    pub fn from_u8(b: u8) -> Option<CompressionType> {
        match b {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Snappy),
            _ => None,
        }
    }
}

impl Default for CompressionType {
    fn default() -> Self {
        #[cfg(feature = "snappy_compression")]
        {
            CompressionType::Snappy
        }
        #[cfg(not(feature = "snappy_compression"))]
        {
            CompressionType::None
        }
    }
}

/// Options used when opening a database.
#[derive(Clone)]
pub struct Options {
    /// Comparator used to define the order of keys in the table.
    /// The same comparator must be used for every open of a database.
    pub comparator: Arc<dyn Comparator>,

    pub create_if_missing: bool,

    pub error_if_exists: bool,

    /// Fail open on any corruption met while replaying logs, and verify
    /// every block read by compactions.
    pub paranoid_checks: bool,

    /// Amount of data to build up in memory (backed by an unsorted log
    /// on disk) before converting to a sorted on-disk file.
    pub write_buffer_size: usize,

    /// Number of open files that can be used by the database.
    pub max_open_files: usize,

    /// Bytes of uncompressed blocks kept in the block cache. Zero disables
    /// the cache.
    pub block_cache_capacity: usize,

    /// Approximate size of user data packed per block.
    pub block_size: usize,

    /// Number of keys between restart points for delta encoding of keys.
    pub block_restart_interval: usize,

    /// Bytes written to a file before switching to a new one.
    pub max_file_size: usize,

    pub compression: CompressionType,

    pub filter_policy: Option<Arc<dyn FilterPolicy>>,

    /// Append to existing log and manifest files on open instead of
    /// starting new ones.
    pub reuse_logs: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            comparator: Arc::new(BytewiseComparator),
            create_if_missing: true,
            error_if_exists: false,
            paranoid_checks: true,
            write_buffer_size: 4 * 1024 * 1024,
            max_open_files: 1000,
            block_cache_capacity: 8 * 1024 * 1024,
            block_size: 4 * 1024,
            block_restart_interval: 16,
            max_file_size: 2 * 1024 * 1024,
            compression: CompressionType::default(),
            filter_policy: None,
            reuse_logs: false,
        }
    }
}

impl Options {
    /// Clip every size option into a workable range.
    pub(crate) fn sanitize(&self) -> Options {
        fn clip(v: usize, min: usize, max: usize) -> usize {
            v.clamp(min, max)
        }
        let mut result = self.clone();
        result.max_open_files = clip(result.max_open_files, 64 + 10, 50000);
        result.write_buffer_size = clip(result.write_buffer_size, 64 << 10, 1 << 30);
        result.max_file_size = clip(result.max_file_size, 1 << 20, 1 << 30);
        result.block_size = clip(result.block_size, 1 << 10, 4 << 20);
        result.block_restart_interval = result.block_restart_interval.max(1);
        result
    }
}

/// Options that control read operations.
#[derive(Clone)]
pub struct ReadOptions {
    /// If true, all data read from underlying storage will be
    /// verified against corresponding checksums.
    pub verify_checksums: bool,

    /// Should the data read for this iteration be cached in memory?
    /// Callers may wish to set this field to false for bulk scans.
    pub fill_cache: bool,

    /// If set, read as of the supplied snapshot. Otherwise read the state
    /// at the beginning of the operation.
    pub snapshot: Option<Snapshot>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        ReadOptions {
            verify_checksums: false,
            fill_cache: true,
            snapshot: None,
        }
    }
}

#[derive(Clone, Copy, Default)]
pub struct WriteOptions {
    /// If true, the write will be flushed from the operating system
    /// buffer cache before the write is considered complete.
    pub sync: bool,
}
