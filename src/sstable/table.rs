use crate::coding::encode_fixed64;
use crate::comparator::BytewiseComparator;
use crate::db::options::ReadOptions;
use crate::env::file_system::RandomAccessFile;
use crate::error::LsmKvError;
use crate::filter::FilterPolicy;
use crate::hash::hash;
use crate::iterator::{BoxedIterator, KvIterator, TwoLevelIterator};
use crate::sstable::block::{Block, BlockIterator};
use crate::sstable::filter_block::FilterBlockReader;
use crate::sstable::format::{read_block, BlockHandle, Footer};
use crate::sstable::TableOptions;
use crate::Result;
use std::sync::Arc;

/// A sorted map from keys to values, opened from a table file.
/// Tables are immutable and persistent, and safe to share across threads.
pub struct Table {
    options: TableOptions,
    file: Box<dyn RandomAccessFile>,
    cache_id: u64,
    filter: Option<FilterBlockReader>,
    metaindex_handle: BlockHandle,
    index_block: Arc<Block>,
}

#[inline]
fn block_cache_hash(key: &(u64, u64)) -> u32 {
    let mut buf = [0u8; 16];
    encode_fixed64(&mut buf, key.0);
    encode_fixed64(&mut buf[8..], key.1);
    hash(&buf, 0)
}

impl Table {
    /// Open the table stored in bytes `[0..file_size)` of `file`, reading
    /// the metadata needed to retrieve data from it.
    pub fn open(options: TableOptions, file: Box<dyn RandomAccessFile>, size: u64) -> Result<Table> {
        if size < Footer::ENCODED_LENGTH as u64 {
            return Err(LsmKvError::corruption("file is too short to be an sstable"));
        }

        let mut footer_space = [0u8; Footer::ENCODED_LENGTH];
        file.read_exact_at(&mut footer_space, size - Footer::ENCODED_LENGTH as u64)?;
        let footer = Footer::decode_from(&footer_space)?;

        // Read the index block
        let read_options = ReadOptions {
            verify_checksums: options.paranoid_checks,
            ..Default::default()
        };
        let index_contents = read_block(
            file.as_ref(),
            &read_options,
            &footer.index_handle,
            &options.buffer_pool,
        )?;
        let index_block = Arc::new(Block::with_pool(
            index_contents,
            options.buffer_pool.clone(),
        )?);

        let cache_id = options.block_cache.as_ref().map_or(0, |c| c.new_id());
        let mut table = Table {
            options,
            file,
            cache_id,
            filter: None,
            metaindex_handle: footer.metaindex_handle,
            index_block,
        };
        table.read_meta(&read_options, &footer);
        Ok(table)
    }

    /// Errors here are not propagated since meta info is not needed for
    /// operation; a table whose filter cannot be read is simply probed
    /// without it.
    fn read_meta(&mut self, read_options: &ReadOptions, footer: &Footer) {
        let policy = match &self.options.filter_policy {
            Some(p) => p.clone(),
            None => return,
        };
        let meta = match read_block(
            self.file.as_ref(),
            read_options,
            &footer.metaindex_handle,
            &self.options.buffer_pool,
        )
        .and_then(|contents| Block::with_pool(contents, self.options.buffer_pool.clone()))
        {
            Ok(block) => Arc::new(block),
            Err(e) => {
                warn!("failed to read table meta-index block: {}", e);
                return;
            }
        };

        let mut iter = meta.iter(Arc::new(BytewiseComparator));
        let key = format!("filter.{}", policy.name());
        iter.seek(key.as_bytes());
        if iter.valid() && iter.key() == key.as_bytes() {
            self.read_filter(read_options, policy, iter.value());
        }
    }

    fn read_filter(
        &mut self,
        read_options: &ReadOptions,
        policy: Arc<dyn FilterPolicy>,
        filter_handle_value: &[u8],
    ) {
        let handle = match BlockHandle::decode_from(filter_handle_value) {
            Ok((handle, _)) => handle,
            Err(_) => return,
        };
        match read_block(
            self.file.as_ref(),
            read_options,
            &handle,
            &self.options.buffer_pool,
        ) {
            Ok(data) => self.filter = Some(FilterBlockReader::new(policy, data)),
            Err(e) => warn!("failed to read table filter block: {}", e),
        }
    }

    /// Convert an index iterator value (an encoded block handle) into an
    /// iterator over the contents of the corresponding block.
    fn block_reader(&self, options: &ReadOptions, index_value: &[u8]) -> Result<BlockIterator> {
        let (handle, _) = BlockHandle::decode_from(index_value)?;
        let read = || -> Result<Block> {
            let contents = read_block(
                self.file.as_ref(),
                options,
                &handle,
                &self.options.buffer_pool,
            )?;
            Block::with_pool(contents, self.options.buffer_pool.clone())
        };

        let block = match &self.options.block_cache {
            Some(cache) => {
                let key = (self.cache_id, handle.offset);
                let h = block_cache_hash(&key);
                match cache.look_up(&key, h) {
                    Some(block) => block,
                    None => {
                        let block = read()?;
                        if options.fill_cache {
                            let charge = block.size();
                            cache.insert(key, block, charge, h)
                        } else {
                            Arc::new(block)
                        }
                    }
                }
            }
            None => Arc::new(read()?),
        };
        Ok(block.iter(self.options.comparator.clone()))
    }

    /// Iterator over the table contents. The result is initially invalid;
    /// the caller must call one of the seek methods before using it.
    pub fn iter(self: &Arc<Self>, options: ReadOptions) -> BoxedIterator {
        let table = self.clone();
        let index_iter = self.index_block.iter(self.options.comparator.clone());
        Box::new(TwoLevelIterator::new(
            Box::new(index_iter),
            move |index_value: &[u8]| -> Result<BoxedIterator> {
                Ok(Box::new(table.block_reader(&options, index_value)?))
            },
        ))
    }

    /// Find the first entry at or after `key`, if it could be in the
    /// block the index points at. Returns its key and value.
    pub fn internal_get(
        &self,
        options: &ReadOptions,
        key: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut index_iter = self.index_block.iter(self.options.comparator.clone());
        index_iter.seek(key);
        if index_iter.valid() {
            let handle_value = index_iter.value();
            if let Some(filter) = &self.filter {
                if let Ok((handle, _)) = BlockHandle::decode_from(handle_value) {
                    if !filter.key_may_match(handle.offset, key) {
                        // Not found
                        return Ok(None);
                    }
                }
            }
            let mut block_iter = self.block_reader(options, handle_value)?;
            block_iter.seek(key);
            if block_iter.valid() {
                return Ok(Some((block_iter.key().to_vec(), block_iter.value().to_vec())));
            }
            block_iter.status()?;
        }
        index_iter.status()?;
        Ok(None)
    }

    /// Approximate offset in the file where the data for `key` begins (or
    /// would begin if the key were present). The approximation includes
    /// compression effects.
    pub fn approximate_offset_of(&self, key: &[u8]) -> u64 {
        let mut index_iter = self.index_block.iter(self.options.comparator.clone());
        index_iter.seek(key);
        if index_iter.valid() {
            if let Ok((handle, _)) = BlockHandle::decode_from(index_iter.value()) {
                return handle.offset;
            }
            // Strange: we can't decode the block handle in the index block.
            // We'll just return the offset of the metaindex block, which is
            // close to the whole file size for this case.
        }
        // key is past the last key in the file. Approximate the offset
        // by returning the offset of the metaindex block (which is right
        // near the end of the file).
        self.metaindex_handle.offset
    }

    #[cfg(test)]
    pub(crate) fn has_filter(&self) -> bool {
        self.filter.is_some()
    }
}

#[cfg(test)]
mod tests {
    use crate::comparator::{BytewiseComparator, Comparator};
    use crate::db::key_types::{InternalKey, InternalKeyComparator, ValueType};
    use crate::db::options::{CompressionType, ReadOptions};
    use crate::env::file_system::FileSystem;
    use crate::filter::{BloomFilterPolicy, FilterPolicy, InternalFilterPolicy};
    use crate::iterator::tests::{collect_backward, collect_forward};
    use crate::iterator::KvIterator;
    use crate::sstable::table::Table;
    use crate::sstable::table_builder::TableBuilder;
    use crate::sstable::{BlockCache, TableOptions};
    use std::path::Path;
    use std::sync::Arc;

    fn build_table(path: &Path, options: &TableOptions, entries: &[(Vec<u8>, Vec<u8>)]) -> u64 {
        let file = FileSystem::create_writable_file(path).unwrap();
        let mut builder = TableBuilder::new(options.clone(), file);
        for (k, v) in entries {
            builder.add(k, v).unwrap();
        }
        builder.finish().unwrap();
        builder.sync().unwrap();
        assert_eq!(builder.num_entries(), entries.len() as u64);
        let size = builder.file_size();
        assert_eq!(size, FileSystem::file_size(path).unwrap());
        size
    }

    fn open_table(path: &Path, options: &TableOptions, size: u64) -> Arc<Table> {
        let file = FileSystem::open_random_access_file(path).unwrap();
        Arc::new(Table::open(options.clone(), file, size).unwrap())
    }

    fn test_entries() -> Vec<(Vec<u8>, Vec<u8>)> {
        (0..10)
            .map(|i| {
                (
                    format!("tests/{:04}", i).into_bytes(),
                    format!("value{}", i).into_bytes(),
                )
            })
            .collect()
    }

    fn check_round_trip(options: TableOptions, expect_filter: bool) {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("000001.sst");
        let entries = test_entries();
        let size = build_table(&path, &options, &entries);

        let table = open_table(&path, &options, size);
        assert_eq!(table.has_filter(), expect_filter);
        let read_options = ReadOptions::default();
        for (k, v) in &entries {
            let (found_key, found_value) = table.internal_get(&read_options, k).unwrap().unwrap();
            assert_eq!(&found_key, k);
            assert_eq!(&found_value, v);
        }

        let mut iter = table.iter(read_options);
        for (k, v) in &entries {
            iter.seek(k);
            assert!(iter.valid());
            assert_eq!(iter.key(), &k[..]);
            assert_eq!(iter.value(), &v[..]);
        }
        iter.seek(b"tests/0009a");
        assert!(!iter.valid());
        assert!(iter.status().is_ok());
    }

    #[test]
    fn test_round_trip_without_filter() {
        check_round_trip(TableOptions::new(Arc::new(BytewiseComparator)), false);
    }

    #[test]
    fn test_round_trip_with_filter() {
        let mut options = TableOptions::new(Arc::new(BytewiseComparator));
        options.filter_policy = Some(Arc::new(BloomFilterPolicy::new(10)));
        check_round_trip(options, true);
    }

    #[test]
    fn test_many_blocks_with_cache_and_compression() {
        let _ = env_logger::try_init();
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("000002.sst");

        let mut options = TableOptions::new(Arc::new(BytewiseComparator));
        options.block_size = 256;
        options.block_restart_interval = 4;
        options.compression = CompressionType::Snappy;
        options.block_cache = Some(Arc::new(BlockCache::new(1 << 20)));
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..2000)
            .map(|i| {
                (
                    format!("key{:08}", i).into_bytes(),
                    format!("{:0>100}", i).into_bytes(),
                )
            })
            .collect();
        let size = build_table(&path, &options, &entries);
        // highly compressible values
        assert!(size < 2000 * 100);

        let table = open_table(&path, &options, size);
        let read_options = ReadOptions {
            verify_checksums: true,
            ..Default::default()
        };
        let mut iter = table.iter(read_options.clone());
        assert_eq!(collect_forward(&mut iter), entries);
        let mut backward = collect_backward(&mut iter);
        backward.reverse();
        assert_eq!(backward, entries);
        assert!(options.block_cache.as_ref().unwrap().total_charge() > 0);

        assert!(table
            .internal_get(&read_options, b"key99999999")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_internal_keys_and_filter() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("000003.sst");
        let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
        let mut options = TableOptions::new(Arc::new(icmp.clone()));
        options.filter_policy = Some(Arc::new(InternalFilterPolicy::new(
            Arc::new(BloomFilterPolicy::new(10)),
            Arc::new(BytewiseComparator),
        )) as Arc<dyn FilterPolicy>);

        let mut entries = vec![];
        for i in 0..100 {
            let user_key = format!("user{:03}", i);
            // two versions of every key, newest first
            for seq in [200 + i as u64, i as u64] {
                let ikey = InternalKey::new(user_key.as_bytes(), seq, ValueType::Value);
                entries.push((ikey.encode().to_vec(), format!("{}@{}", user_key, seq).into_bytes()));
            }
        }
        assert!(entries
            .windows(2)
            .all(|w| icmp.compare(&w[0].0, &w[1].0) == std::cmp::Ordering::Less));
        let size = build_table(&path, &options, &entries);
        let table = open_table(&path, &options, size);

        let read_options = ReadOptions::default();
        let lookup = InternalKey::new(b"user042", 100, ValueType::Value);
        let (key, value) = table
            .internal_get(&read_options, lookup.encode())
            .unwrap()
            .unwrap();
        assert_eq!(
            key,
            InternalKey::new(b"user042", 42, ValueType::Value).encode()
        );
        assert_eq!(value, b"user042@42");

        let missing = InternalKey::new(b"user042x", 100, ValueType::Value);
        match table.internal_get(&read_options, missing.encode()).unwrap() {
            // the filter may let it through; then the next key is returned
            Some((key, _)) => assert_ne!(crate::db::key_types::extract_user_key(&key), b"user042x"),
            None => {}
        }
    }

    #[test]
    fn test_approximate_offset_of() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("000004.sst");
        let mut options = TableOptions::new(Arc::new(BytewiseComparator));
        options.block_size = 1024;
        options.compression = CompressionType::None;
        let entries = vec![
            (b"k01".to_vec(), b"hello".to_vec()),
            (b"k02".to_vec(), b"hello2".to_vec()),
            (b"k03".to_vec(), vec![b'x'; 10000]),
            (b"k04".to_vec(), vec![b'x'; 200000]),
            (b"k05".to_vec(), vec![b'x'; 300000]),
            (b"k06".to_vec(), b"hello3".to_vec()),
            (b"k07".to_vec(), vec![b'x'; 100000]),
        ];
        let size = build_table(&path, &options, &entries);
        let table = open_table(&path, &options, size);

        let between = |v: u64, low: u64, high: u64| v >= low && v <= high + 200;
        assert!(between(table.approximate_offset_of(b"abc"), 0, 0));
        assert!(between(table.approximate_offset_of(b"k01"), 0, 0));
        assert!(between(table.approximate_offset_of(b"k01a"), 0, 0));
        assert!(between(table.approximate_offset_of(b"k02"), 0, 0));
        assert!(between(table.approximate_offset_of(b"k03"), 0, 0));
        assert!(between(table.approximate_offset_of(b"k04"), 10000, 11000));
        assert!(between(table.approximate_offset_of(b"k04a"), 210000, 211000));
        assert!(between(table.approximate_offset_of(b"k05"), 210000, 211000));
        assert!(between(table.approximate_offset_of(b"k06"), 510000, 511000));
        assert!(between(table.approximate_offset_of(b"k07"), 510000, 511000));
        assert!(between(table.approximate_offset_of(b"xyz"), 610000, 612000));
    }

    #[test]
    fn test_corrupted_table() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("000005.sst");
        let options = TableOptions::new(Arc::new(BytewiseComparator));
        let size = build_table(&path, &options, &test_entries());

        let file = FileSystem::open_random_access_file(&path).unwrap();
        assert!(Table::open(options.clone(), file, 10)
            .err()
            .unwrap()
            .is_corruption());

        // flip a byte in the first data block
        let mut contents = std::fs::read(&path).unwrap();
        contents[3] ^= 0x55;
        std::fs::write(&path, &contents).unwrap();
        let table = open_table(&path, &options, size);
        let read_options = ReadOptions {
            verify_checksums: true,
            ..Default::default()
        };
        let err = table
            .internal_get(&read_options, b"tests/0000")
            .unwrap_err();
        assert!(err.is_corruption());
        let mut iter = table.iter(read_options);
        iter.seek_to_first();
        assert!(!iter.valid());
        assert!(iter.status().unwrap_err().is_corruption());
    }
}
