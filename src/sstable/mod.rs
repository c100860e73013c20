//! Sorted String Table, an immutable sorted map stored in one file.
//!
//! ```text
//! +-------------------------+ (offset 0)
//! | Data Block 1            |<-+
//! +-------------------------+  |
//! | Data Block 2            |<-+
//! +-------------------------+  |
//! | ...                     |  |
//! +-------------------------+  |
//! | Data Block n            |<-+
//! +-------------------------+  |
//! | Filter Block (optional) |<-|-+
//! +-------------------------+  | |
//! | Meta-index Block        |--|-+
//! +-------------------------+  |
//! | Index Block             |--+
//! +-------------------------+
//! | Footer                  |
//! +-------------------------+
//! ```
//!
//! Data, index and meta-index blocks share the prefix-compressed layout
//! described in [`block_builder`]. Each index entry maps a key that is
//! `>=` the last key of a data block (and `<` the first key of the next
//! one) to the handle of that block. The meta-index maps
//! `filter.<policy name>` to the filter block.

pub mod block;
pub mod block_builder;
pub mod filter_block;
pub mod format;
pub mod table;
pub mod table_builder;
pub mod table_cache;

use crate::collections::buffer_pool::BufferPool;
use crate::cache::ShardLRUCache;
use crate::comparator::Comparator;
use crate::db::key_types::InternalKeyComparator;
use crate::db::options::{CompressionType, Options};
use crate::filter::{FilterPolicy, InternalFilterPolicy};
use block::Block;
use std::sync::Arc;

/// Decoded data blocks keyed by `(table cache id, block offset)`.
pub type BlockCache = ShardLRUCache<(u64, u64), Block>;

/// A block cache holding up to `capacity` bytes of blocks. An evicted
/// block hands its buffer back to the pool once no iterator reads it.
pub fn new_block_cache(capacity: usize) -> BlockCache {
    ShardLRUCache::new(capacity).with_eviction_callback(Box::new(
        |key: &(u64, u64), block: &Arc<Block>| {
            trace!(
                "block at offset {} of table cache id {} evicted ({} bytes)",
                key.1,
                key.0,
                block.size()
            );
        },
    ))
}

/// Everything a table needs to be built or read.
#[derive(Clone)]
pub struct TableOptions {
    /// Orders the keys stored in the table.
    pub comparator: Arc<dyn Comparator>,
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,
    pub block_cache: Option<Arc<BlockCache>>,
    pub buffer_pool: Arc<BufferPool>,
    /// Verify the index and meta blocks when a table is opened.
    pub paranoid_checks: bool,
    pub block_size: usize,
    pub block_restart_interval: usize,
    pub compression: CompressionType,
}

impl TableOptions {
    pub fn new(comparator: Arc<dyn Comparator>) -> TableOptions {
        let defaults = Options::default();
        TableOptions {
            comparator,
            filter_policy: None,
            block_cache: None,
            buffer_pool: Arc::new(BufferPool::default()),
            paranoid_checks: defaults.paranoid_checks,
            block_size: defaults.block_size,
            block_restart_interval: defaults.block_restart_interval,
            compression: defaults.compression,
        }
    }

    /// Options for the tables of a database, whose keys are internal keys.
    pub(crate) fn for_database(
        options: &Options,
        icmp: &InternalKeyComparator,
        block_cache: Option<Arc<BlockCache>>,
        buffer_pool: Arc<BufferPool>,
    ) -> TableOptions {
        TableOptions {
            comparator: Arc::new(icmp.clone()),
            filter_policy: options
                .filter_policy
                .clone()
                .map(|p| {
                    let user_comparator = icmp.user_comparator().clone();
                    Arc::new(InternalFilterPolicy::new(p, user_comparator)) as Arc<dyn FilterPolicy>
                }),
            block_cache,
            buffer_pool,
            paranoid_checks: options.paranoid_checks,
            block_size: options.block_size,
            block_restart_interval: options.block_restart_interval,
            compression: options.compression,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::collections::buffer_pool::BufferPool;
    use crate::comparator::BytewiseComparator;
    use crate::sstable::block::Block;
    use crate::sstable::block_builder::BlockBuilder;
    use crate::sstable::new_block_cache;
    use std::sync::Arc;

    fn pooled_block(pool: &Arc<BufferPool>, contents: &[u8]) -> Block {
        let mut buf = pool.acquire(contents.len());
        buf.copy_from_slice(contents);
        Block::with_pool(buf, pool.clone()).unwrap()
    }

    #[test]
    fn test_evicted_block_returns_buffer_to_pool() {
        let _ = env_logger::try_init();
        let pool = Arc::new(BufferPool::default());
        let mut builder = BlockBuilder::new(Arc::new(BytewiseComparator), 16);
        builder.add(b"key", b"value");
        let contents = builder.finish().to_vec();

        // every shard holds exactly one block
        let cache = new_block_cache(16 * contents.len());
        let first = cache.insert((1, 0), pooled_block(&pool, &contents), contents.len(), 0);
        drop(cache.insert((1, 100), pooled_block(&pool, &contents), contents.len(), 0));
        assert!(cache.look_up(&(1, 0), 0).is_none());

        // still read through `first`
        assert_eq!(pool.pooled(), 0);
        drop(first);
        assert_eq!(pool.pooled(), 1);

        cache.prune();
        assert_eq!(pool.pooled(), 2);
    }
}
