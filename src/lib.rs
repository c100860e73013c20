#[macro_use]
extern crate log;

pub use comparator::{BytewiseComparator, CaseInsensitiveComparator, Comparator};
pub use db::db_iter::DBIterator;
pub use db::options::{CompressionType, Options, ReadOptions, WriteOptions};
pub use db::snapshot::Snapshot;
pub use db::statistics::Statistics;
pub use db::write_batch::{WriteBatch, WriteBatchHandler};
pub use db::DB;
pub use error::LsmKvError;
pub use filter::{BloomFilterPolicy, FilterPolicy};
pub use iterator::KvIterator;

mod cache;
mod coding;
pub mod collections;
mod compaction;
pub mod comparator;
mod crc;
pub mod db;
mod env;
pub mod error;
pub mod filter;
mod hash;
mod ioutils;
pub mod iterator;
pub mod memory;
pub mod sstable;
mod version;
mod wal;

pub type Result<T> = std::result::Result<T, error::LsmKvError>;
