use crate::crc;
use crate::env::file_system::WritableFile;
use crate::wal::{RecordType, BLOCK_SIZE, HEADER_SIZE, MAX_RECORD_TYPE};
use crate::Result;

/// Appends records to a log file.
pub struct Writer<W: WritableFile> {
    dest: W,
    /// Current offset in block
    block_offset: usize,
    /// crc32c values for all supported record types. These are
    /// pre-computed to reduce the overhead of computing the crc of the
    /// record type stored in the header.
    type_crc: [u32; MAX_RECORD_TYPE as usize + 1],
}

impl<W: WritableFile> Writer<W> {
    /// Create a writer that will append data to `dest`, which must be empty.
    pub fn new(dest: W) -> Writer<W> {
        Self::with_offset(dest, 0)
    }

    /// Create a writer that will append data to `dest`, which already holds
    /// `dest_length` bytes of log.
    pub fn with_offset(dest: W, dest_length: u64) -> Writer<W> {
        let mut type_crc = [0u32; MAX_RECORD_TYPE as usize + 1];
        for (t, crc) in type_crc.iter_mut().enumerate() {
            *crc = crc::value(&[t as u8]);
        }
        Writer {
            dest,
            block_offset: (dest_length % BLOCK_SIZE as u64) as usize,
            type_crc,
        }
    }

    pub fn add_record(&mut self, record: &[u8]) -> Result<()> {
        self.add_record_slices(&[record])
    }

    /// Append one logical record made of the concatenation of `slices`.
    pub fn add_record_slices(&mut self, slices: &[&[u8]]) -> Result<()> {
        let mut left: usize = slices.iter().map(|s| s.len()).sum();
        let mut cursor = SliceCursor::new(slices);

        // Fragment the record if necessary and emit it. Note that if the
        // record is empty, we still want to iterate once to emit a single
        // zero-length record.
        let mut begin = true;
        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                // Switch to a new block
                if leftover > 0 {
                    // Fill the trailer
                    self.dest.write_all(&[0u8; HEADER_SIZE][..leftover])?;
                }
                self.block_offset = 0;
            }

            // Invariant: we never leave < HEADER_SIZE bytes in a block.
            debug_assert!(BLOCK_SIZE - self.block_offset >= HEADER_SIZE);

            let avail = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_length = left.min(avail);
            let end = left == fragment_length;
            let record_type = match (begin, end) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, true) => RecordType::Last,
                (false, false) => RecordType::Middle,
            };

            let pieces = cursor.take(fragment_length);
            self.emit_physical_record(record_type, &pieces, fragment_length)?;
            left -= fragment_length;
            begin = false;
            if left == 0 {
                break;
            }
        }
        Ok(())
    }

    fn emit_physical_record(
        &mut self,
        record_type: RecordType,
        pieces: &[&[u8]],
        length: usize,
    ) -> Result<()> {
        debug_assert!(length <= 0xffff);
        debug_assert!(self.block_offset + HEADER_SIZE + length <= BLOCK_SIZE);

        // Compute the crc of the record type and the payload.
        let mut crc = self.type_crc[record_type as usize];
        for piece in pieces {
            crc = crc::extend(crc, piece);
        }
        let crc = crc::mask(crc);

        let mut header = [0u8; HEADER_SIZE];
        header[..4].copy_from_slice(&crc.to_le_bytes());
        header[4] = (length & 0xff) as u8;
        header[5] = (length >> 8) as u8;
        header[6] = record_type as u8;

        self.dest.write_all(&header)?;
        for piece in pieces {
            self.dest.write_all(piece)?;
        }
        self.dest.flush()?;
        self.block_offset += HEADER_SIZE + length;
        Ok(())
    }

    /// Force written records to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.dest.sync()
    }

    pub fn into_inner(self) -> W {
        self.dest
    }
}

/// Walks a list of slices as if they were one contiguous buffer.
struct SliceCursor<'a> {
    slices: &'a [&'a [u8]],
    index: usize,
    offset: usize,
}

impl<'a> SliceCursor<'a> {
    fn new(slices: &'a [&'a [u8]]) -> SliceCursor<'a> {
        SliceCursor {
            slices,
            index: 0,
            offset: 0,
        }
    }

    /// The next `n` bytes, as sub-slices of the input.
    fn take(&mut self, mut n: usize) -> Vec<&'a [u8]> {
        let mut pieces = vec![];
        while n > 0 {
            let slice = self.slices[self.index];
            let available = slice.len() - self.offset;
            if available == 0 {
                self.index += 1;
                self.offset = 0;
                continue;
            }
            let len = available.min(n);
            pieces.push(&slice[self.offset..self.offset + len]);
            self.offset += len;
            n -= len;
        }
        pieces
    }
}
