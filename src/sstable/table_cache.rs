use crate::cache::ShardLRUCache;
use crate::db::filename::table_file_name;
use crate::db::options::ReadOptions;
use crate::env::file_system::FileSystem;
use crate::hash::hash;
use crate::iterator::{BoxedIterator, EmptyIterator};
use crate::sstable::table::Table;
use crate::sstable::TableOptions;
use crate::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[inline]
fn file_number_hash(file_number: u64) -> u32 {
    hash(&file_number.to_le_bytes(), 0)
}

/// Bounded cache of open tables keyed by file number.
pub struct TableCache {
    dbname: PathBuf,
    options: TableOptions,
    cache: ShardLRUCache<u64, Table>,
}

impl TableCache {
    pub fn new(dbname: &Path, options: TableOptions, entries: usize) -> TableCache {
        let cache = ShardLRUCache::new(entries).with_eviction_callback(Box::new(
            |file_number: &u64, _table: &Arc<Table>| {
                debug!("table #{} closed by table cache", file_number);
            },
        ));
        TableCache {
            dbname: dbname.to_path_buf(),
            options,
            cache,
        }
    }

    #[inline]
    pub fn options(&self) -> &TableOptions {
        &self.options
    }

    pub fn find_table(&self, file_number: u64, file_size: u64) -> Result<Arc<Table>> {
        let h = file_number_hash(file_number);
        if let Some(table) = self.cache.look_up(&file_number, h) {
            return Ok(table);
        }
        let path = table_file_name(&self.dbname, file_number);
        let file = FileSystem::open_random_access_file(&path)?;
        // Errors are not cached, so a transient failure or a repaired
        // file is retried on the next lookup.
        let table = Table::open(self.options.clone(), file, file_size)?;
        Ok(self.cache.insert(file_number, table, 1, h))
    }

    /// Iterator for the specified file number. If the table cannot be
    /// opened, the returned iterator is empty and carries the error.
    pub fn iter(&self, options: &ReadOptions, file_number: u64, file_size: u64) -> BoxedIterator {
        match self.find_table(file_number, file_size) {
            Ok(table) => table.iter(options.clone()),
            Err(e) => Box::new(EmptyIterator::with_error(e)),
        }
    }

    /// Seek `internal_key` in the specified file, returning the entry
    /// found at or after it.
    pub fn get(
        &self,
        options: &ReadOptions,
        file_number: u64,
        file_size: u64,
        internal_key: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let table = self.find_table(file_number, file_size)?;
        table.internal_get(options, internal_key)
    }

    pub fn approximate_offset_of(&self, file_number: u64, file_size: u64, key: &[u8]) -> Result<u64> {
        let table = self.find_table(file_number, file_size)?;
        Ok(table.approximate_offset_of(key))
    }

    /// Evict any entry for the specified file number.
    pub fn evict(&self, file_number: u64) {
        self.cache.erase(&file_number, file_number_hash(file_number));
    }
}

#[cfg(test)]
mod tests {
    use crate::comparator::BytewiseComparator;
    use crate::db::filename::table_file_name;
    use crate::db::options::ReadOptions;
    use crate::env::file_system::FileSystem;
    use crate::iterator::KvIterator;
    use crate::sstable::table_builder::TableBuilder;
    use crate::sstable::table_cache::TableCache;
    use crate::sstable::TableOptions;
    use std::sync::Arc;

    #[test]
    fn test_table_cache() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let options = TableOptions::new(Arc::new(BytewiseComparator));
        let mut sizes = vec![];
        for number in 1..=5u64 {
            let file = FileSystem::create_writable_file(&table_file_name(temp_dir.path(), number))
                .unwrap();
            let mut builder = TableBuilder::new(options.clone(), file);
            builder
                .add(format!("key{}", number).as_bytes(), b"value")
                .unwrap();
            builder.finish().unwrap();
            builder.sync().unwrap();
            sizes.push(builder.file_size());
        }

        let cache = TableCache::new(temp_dir.path(), options, 2);
        let read_options = ReadOptions::default();
        for round in 0..2 {
            for number in 1..=5u64 {
                let key = format!("key{}", number);
                let (k, v) = cache
                    .get(&read_options, number, sizes[number as usize - 1], key.as_bytes())
                    .unwrap()
                    .unwrap();
                assert_eq!(k, key.as_bytes(), "round {}", round);
                assert_eq!(v, b"value");
            }
        }

        // a deleted table stays readable while cached, and fails once evicted
        let table = cache.find_table(3, sizes[2]).unwrap();
        std::fs::remove_file(table_file_name(temp_dir.path(), 3)).unwrap();
        cache.evict(3);
        let mut iter = table.iter(read_options.clone());
        iter.seek_to_first();
        assert_eq!(iter.key(), b"key3");
        drop(iter);
        let mut iter = cache.iter(&read_options, 3, sizes[2]);
        iter.seek_to_first();
        assert!(!iter.valid());
        assert!(iter.status().unwrap_err().is_io_error());
    }
}
