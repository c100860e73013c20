use crate::compaction::Compaction;
use crate::db::filename::table_file_name;
use crate::db::key_types::{InternalKey, ParsedInternalKey, SequenceNumber, ValueType, MAX_SEQUENCE_NUMBER};
use crate::db::options::ReadOptions;
use crate::db::statistics::CompactionStats;
use crate::env::file_system::FileSystem;
use crate::error::LsmKvError;
use crate::ioutils::BufWriterWithPos;
use crate::iterator::KvIterator;
use crate::sstable::table_builder::TableBuilder;
use crate::sstable::table_cache::TableCache;
use crate::version::version_edit::FileMetaData;
use crate::version::total_file_size;
use crate::Result;
use std::cmp::Ordering;
use std::fs::File;
use std::path::Path;
use std::time::Instant;

/// What a running compaction needs from the database that owns it.
pub trait CompactionContext {
    /// Allocate a file number for a new output and protect it from
    /// deletion until the compaction is installed.
    fn new_output_file_number(&self) -> u64;

    fn is_shutting_down(&self) -> bool;

    /// Flush the immutable memtable if there is one, so that writers
    /// waiting on it are not stalled behind a long compaction.
    fn compact_pending_memtable(&self);
}

/// Check that a freshly written table can be opened and iterated.
fn verify_table(table_cache: &TableCache, number: u64, file_size: u64) -> Result<()> {
    let iter = table_cache.iter(&ReadOptions::default(), number, file_size);
    iter.status()
}

/// Build a table file from the contents of `iter`. The generated file
/// will be named according to `meta.number`. On success, the rest of
/// `meta` will be filled with metadata about the generated table. If no
/// data is present in `iter`, `meta.file_size` will be set to zero, and
/// no table file will be produced.
pub fn build_table(
    dbname: &Path,
    table_cache: &TableCache,
    iter: &mut dyn KvIterator,
    meta: &mut FileMetaData,
) -> Result<()> {
    meta.file_size = 0;
    iter.seek_to_first();

    let path = table_file_name(dbname, meta.number);
    let mut result = Ok(());
    if iter.valid() {
        result = write_table(&path, table_cache, iter, meta)
            .and_then(|_| verify_table(table_cache, meta.number, meta.file_size));
    }

    // Check for input iterator errors
    if result.is_ok() {
        result = iter.status();
    }

    if result.is_err() || meta.file_size == 0 {
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("cannot remove table {}: {}", path.display(), e);
            }
        }
    }
    result
}

fn write_table(
    path: &Path,
    table_cache: &TableCache,
    iter: &mut dyn KvIterator,
    meta: &mut FileMetaData,
) -> Result<()> {
    let file = FileSystem::create_writable_file(path)?;
    let mut builder = TableBuilder::new(table_cache.options().clone(), file);
    meta.smallest = InternalKey::decode_from(iter.key());
    while iter.valid() {
        let key = iter.key();
        meta.largest = InternalKey::decode_from(key);
        builder.add(key, iter.value())?;
        iter.next();
    }

    builder.finish()?;
    meta.file_size = builder.file_size();
    debug_assert!(meta.file_size > 0);
    builder.sync()
}

/// Merges the inputs of a [`Compaction`] into new tables at
/// `level + 1`, dropping entries no snapshot can observe.
pub struct Compactor<'a, C: CompactionContext> {
    dbname: &'a Path,
    table_cache: &'a TableCache,
    ctx: &'a C,
    compaction: &'a mut Compaction,

    /// Sequence numbers < smallest_snapshot are not significant since we
    /// will never have to service a snapshot below smallest_snapshot.
    /// Therefore if we have seen a sequence number S <= smallest_snapshot,
    /// we can drop all entries for the same key with sequence numbers < S.
    smallest_snapshot: SequenceNumber,

    outputs: Vec<FileMetaData>,
    builder: Option<TableBuilder<BufWriterWithPos<File>>>,
    stats: CompactionStats,
}

impl<'a, C: CompactionContext> Compactor<'a, C> {
    pub fn new(
        dbname: &'a Path,
        table_cache: &'a TableCache,
        ctx: &'a C,
        compaction: &'a mut Compaction,
        smallest_snapshot: SequenceNumber,
    ) -> Compactor<'a, C> {
        Compactor {
            dbname,
            table_cache,
            ctx,
            compaction,
            smallest_snapshot,
            outputs: vec![],
            builder: None,
            stats: CompactionStats::default(),
        }
    }

    /// Tables written so far. Their numbers are still protected from
    /// deletion and have to be released by the caller, whatever the
    /// outcome of [`run`](Compactor::run).
    #[inline]
    pub fn outputs(&self) -> &[FileMetaData] {
        &self.outputs
    }

    #[inline]
    pub fn stats(&self) -> CompactionStats {
        self.stats
    }

    pub fn run(&mut self, input: &mut dyn KvIterator) -> Result<()> {
        let start = Instant::now();
        let c = &*self.compaction;
        info!(
            "compacting {}@{} + {}@{} files",
            c.num_input_files(0),
            c.level(),
            c.num_input_files(1),
            c.level() + 1
        );
        debug_assert!(c.num_input_files(0) > 0);
        debug_assert!(self.builder.is_none());
        debug_assert!(self.outputs.is_empty());

        let result = self.merge(input);
        if let Some(mut builder) = self.builder.take() {
            builder.abandon();
        }

        self.stats.micros = start.elapsed().as_micros() as u64;
        self.stats.bytes_read =
            total_file_size(&self.compaction.inputs[0]) + total_file_size(&self.compaction.inputs[1]);
        self.stats.bytes_written = self.outputs.iter().map(|f| f.file_size).sum();
        result
    }

    fn merge(&mut self, input: &mut dyn KvIterator) -> Result<()> {
        input.seek_to_first();
        let ucmp = self.compaction.icmp().user_comparator().clone();
        let mut current_user_key: Option<Vec<u8>> = None;
        let mut last_sequence_for_key = MAX_SEQUENCE_NUMBER;

        while input.valid() && !self.ctx.is_shutting_down() {
            // Prioritize immutable compaction work
            self.ctx.compact_pending_memtable();

            let key = input.key();
            if self.compaction.should_stop_before(key) && self.builder.is_some() {
                self.finish_output_file(input)?;
            }

            // Handle key/value, add to state, etc.
            let mut drop = false;
            match ParsedInternalKey::parse(key) {
                None => {
                    // Do not hide error keys
                    current_user_key = None;
                    last_sequence_for_key = MAX_SEQUENCE_NUMBER;
                }
                Some(ikey) => {
                    let first_occurrence = match &current_user_key {
                        Some(k) => ucmp.compare(ikey.user_key, k) != Ordering::Equal,
                        None => true,
                    };
                    if first_occurrence {
                        // First occurrence of this user key
                        current_user_key = Some(ikey.user_key.to_vec());
                        last_sequence_for_key = MAX_SEQUENCE_NUMBER;
                    }

                    if last_sequence_for_key <= self.smallest_snapshot {
                        // Hidden by a newer entry for same user key
                        drop = true;
                    } else if ikey.value_type == ValueType::Deletion
                        && ikey.sequence <= self.smallest_snapshot
                        && self.compaction.is_base_level_for_key(ikey.user_key)
                    {
                        // For this user key:
                        // (1) there is no data in higher levels
                        // (2) data in lower levels will have larger sequence numbers
                        // (3) data in layers that are being compacted here and have
                        //     smaller sequence numbers will be dropped in the next
                        //     few iterations of this loop (by the rule above).
                        // Therefore this deletion marker is obsolete and can be dropped.
                        drop = true;
                    }

                    last_sequence_for_key = ikey.sequence;
                }
            }

            if !drop {
                // Open output file if necessary
                if self.builder.is_none() {
                    self.open_output_file()?;
                }
                let builder = match self.builder.as_mut() {
                    Some(builder) => builder,
                    None => return Err(LsmKvError::Custom("no compaction output".to_string())),
                };
                let meta = self
                    .outputs
                    .last_mut()
                    .ok_or_else(|| LsmKvError::Custom("no compaction output".to_string()))?;
                if builder.num_entries() == 0 {
                    meta.smallest = InternalKey::decode_from(key);
                }
                meta.largest = InternalKey::decode_from(key);
                builder.add(key, input.value())?;

                // Close output file if it is big enough
                if builder.file_size() >= self.compaction.max_output_file_size() {
                    self.finish_output_file(input)?;
                }
            }

            input.next();
        }

        if self.ctx.is_shutting_down() {
            return Err(LsmKvError::ShutDown);
        }
        if self.builder.is_some() {
            self.finish_output_file(input)?;
        }
        input.status()
    }

    fn open_output_file(&mut self) -> Result<()> {
        let number = self.ctx.new_output_file_number();
        self.outputs.push(FileMetaData::new(
            number,
            0,
            InternalKey::default(),
            InternalKey::default(),
        ));
        let path = table_file_name(self.dbname, number);
        let file = FileSystem::create_writable_file(&path)?;
        self.builder = Some(TableBuilder::new(self.table_cache.options().clone(), file));
        Ok(())
    }

    fn finish_output_file(&mut self, input: &dyn KvIterator) -> Result<()> {
        let mut builder = match self.builder.take() {
            Some(builder) => builder,
            None => return Ok(()),
        };
        let meta = self
            .outputs
            .last_mut()
            .ok_or_else(|| LsmKvError::Custom("no compaction output".to_string()))?;
        debug_assert_ne!(meta.number, 0);

        // Check for iterator errors
        let current_entries = builder.num_entries();
        if let Err(e) = input.status() {
            builder.abandon();
            return Err(e);
        }
        builder.finish()?;
        meta.file_size = builder.file_size();
        builder.sync()?;

        if current_entries > 0 {
            // Verify that the table is usable
            verify_table(self.table_cache, meta.number, meta.file_size)?;
            info!(
                "generated table #{}@{}: {} keys, {} bytes",
                meta.number,
                self.compaction.level(),
                current_entries,
                meta.file_size
            );
        }
        Ok(())
    }
}
