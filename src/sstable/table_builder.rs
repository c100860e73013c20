use crate::coding::encode_fixed32;
use crate::comparator::BytewiseComparator;
use crate::crc;
use crate::db::options::CompressionType;
use crate::env::file_system::WritableFile;
use crate::sstable::block_builder::BlockBuilder;
use crate::sstable::filter_block::FilterBlockBuilder;
use crate::sstable::format::{BlockHandle, Footer, BLOCK_TRAILER_SIZE};
use crate::sstable::TableOptions;
use crate::Result;
use std::cmp::Ordering;
use std::sync::Arc;

/// Appends blocks with their trailers to a table file, tracking the
/// current file offset.
struct BlockWriter<W: WritableFile> {
    file: W,
    offset: u64,
    compressed_output: Vec<u8>,
}

impl<W: WritableFile> BlockWriter<W> {
    fn write_block(&mut self, raw: &[u8], compression: CompressionType) -> Result<BlockHandle> {
        match compression {
            CompressionType::None => self.write_raw_block(raw, CompressionType::None),
            CompressionType::Snappy => {
                let mut compressed = std::mem::take(&mut self.compressed_output);
                compressed.resize(snap::raw::max_compress_len(raw.len()), 0);
                let result = match snap::raw::Encoder::new().compress(raw, &mut compressed) {
                    // Use the compressed form only if it saves at least 12.5%
                    Ok(n) if n < raw.len() - (raw.len() / 8) => {
                        self.write_raw_block(&compressed[..n], CompressionType::Snappy)
                    }
                    _ => self.write_raw_block(raw, CompressionType::None),
                };
                self.compressed_output = compressed;
                result
            }
        }
    }

    fn write_raw_block(&mut self, contents: &[u8], ctype: CompressionType) -> Result<BlockHandle> {
        let handle = BlockHandle::new(self.offset, contents.len() as u64);
        self.file.write_all(contents)?;
        let mut trailer = [0u8; BLOCK_TRAILER_SIZE];
        trailer[0] = ctype as u8;
        // Extend crc to cover block type
        let crc = crc::extend(crc::value(contents), &trailer[..1]);
        encode_fixed32(&mut trailer[1..], crc::mask(crc));
        self.file.write_all(&trailer)?;
        self.offset += (contents.len() + BLOCK_TRAILER_SIZE) as u64;
        Ok(handle)
    }
}

/// Builds a table file. Keys must be added in strictly increasing order.
pub struct TableBuilder<W: WritableFile> {
    options: TableOptions,
    writer: BlockWriter<W>,
    data_block: BlockBuilder,
    index_block: BlockBuilder,
    last_key: Vec<u8>,
    num_entries: u64,
    closed: bool,
    filter_block: Option<FilterBlockBuilder>,

    /// We do not emit the index entry for a block until we have seen the
    /// first key for the next data block. This allows us to use shorter
    /// keys in the index block. For example, consider a block boundary
    /// between the keys "the quick brown fox" and "the who". We can use
    /// "the r" as the key for the index block entry since it is >= all
    /// entries in the first block and < all entries in subsequent
    /// blocks.
    ///
    /// Invariant: `pending_index_entry` is true only if `data_block` is empty.
    pending_index_entry: bool,
    /// Handle to add to index block
    pending_handle: BlockHandle,
}

impl<W: WritableFile> TableBuilder<W> {
    pub fn new(options: TableOptions, file: W) -> TableBuilder<W> {
        let mut filter_block = options
            .filter_policy
            .as_ref()
            .map(|p| FilterBlockBuilder::new(p.clone()));
        if let Some(fb) = filter_block.as_mut() {
            fb.start_block(0);
        }
        TableBuilder {
            data_block: BlockBuilder::new(options.comparator.clone(), options.block_restart_interval),
            index_block: BlockBuilder::new(options.comparator.clone(), 1),
            options,
            writer: BlockWriter {
                file,
                offset: 0,
                compressed_output: vec![],
            },
            last_key: vec![],
            num_entries: 0,
            closed: false,
            filter_block,
            pending_index_entry: false,
            pending_handle: BlockHandle::default(),
        }
    }

    /// Add `key, value` to the table being constructed.
    /// REQUIRES: `key` is after any previously added key according to the comparator.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        debug_assert!(!self.closed);
        debug_assert!(
            self.num_entries == 0
                || self.options.comparator.compare(key, &self.last_key) == Ordering::Greater
        );

        if self.pending_index_entry {
            debug_assert!(self.data_block.is_empty());
            self.options
                .comparator
                .find_shortest_separator(&mut self.last_key, key);
            self.index_block
                .add(&self.last_key, &self.pending_handle.encode());
            self.pending_index_entry = false;
        }

        if let Some(fb) = self.filter_block.as_mut() {
            fb.add_key(key);
        }

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;
        self.data_block.add(key, value);

        if self.data_block.current_size_estimate() >= self.options.block_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Write any buffered key/value pairs to a data block. Mostly useful
    /// to make sure two adjacent entries never live in the same block.
    pub fn flush(&mut self) -> Result<()> {
        debug_assert!(!self.closed);
        if self.data_block.is_empty() {
            return Ok(());
        }
        debug_assert!(!self.pending_index_entry);
        self.pending_handle = self
            .writer
            .write_block(self.data_block.finish(), self.options.compression)?;
        self.data_block.reset();
        self.pending_index_entry = true;
        self.writer.file.flush()?;
        if let Some(fb) = self.filter_block.as_mut() {
            fb.start_block(self.writer.offset);
        }
        Ok(())
    }

    /// Finish building the table. Stops using the file after this
    /// function returns; the caller is responsible for syncing it.
    pub fn finish(&mut self) -> Result<()> {
        self.flush()?;
        debug_assert!(!self.closed);
        self.closed = true;

        // Write filter block
        let mut filter_block_handle = None;
        if let Some(fb) = self.filter_block.as_mut() {
            filter_block_handle = Some(
                self.writer
                    .write_raw_block(fb.finish(), CompressionType::None)?,
            );
        }

        // Write metaindex block
        let mut meta_index_block = BlockBuilder::new(
            Arc::new(BytewiseComparator),
            self.options.block_restart_interval,
        );
        if let (Some(handle), Some(policy)) = (filter_block_handle, &self.options.filter_policy) {
            let key = format!("filter.{}", policy.name());
            meta_index_block.add(key.as_bytes(), &handle.encode());
        }
        let metaindex_handle = self
            .writer
            .write_block(meta_index_block.finish(), self.options.compression)?;

        // Write index block
        if self.pending_index_entry {
            self.options
                .comparator
                .find_short_successor(&mut self.last_key);
            self.index_block
                .add(&self.last_key, &self.pending_handle.encode());
            self.pending_index_entry = false;
        }
        let index_handle = self
            .writer
            .write_block(self.index_block.finish(), self.options.compression)?;

        // Write footer
        let footer = Footer {
            metaindex_handle,
            index_handle,
        };
        let mut footer_encoding = Vec::with_capacity(Footer::ENCODED_LENGTH);
        footer.encode_to(&mut footer_encoding);
        self.writer.file.write_all(&footer_encoding)?;
        self.writer.offset += footer_encoding.len() as u64;
        self.writer.file.flush()?;
        Ok(())
    }

    /// Indicate that the contents of this builder should be abandoned.
    /// The caller deletes the partially written file.
    pub fn abandon(&mut self) {
        debug_assert!(!self.closed);
        self.closed = true;
    }

    /// Number of calls to `add()` so far.
    #[inline]
    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Size of the file generated so far. If invoked after a successful
    /// `finish()` call, returns the size of the final generated file.
    #[inline]
    pub fn file_size(&self) -> u64 {
        self.writer.offset
    }

    pub fn sync(&mut self) -> Result<()> {
        self.writer.file.sync()
    }

    pub fn into_inner(self) -> W {
        self.writer.file
    }
}
