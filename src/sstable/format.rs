//! On-disk layout shared by the table builder and reader.
//!
//! ```text
//! [data block 1] ... [data block N]
//! [filter block]          (optional)
//! [meta-index block]
//! [index block]
//! [footer]                (fixed size, at the end of the file)
//! ```
//!
//! Every block is followed by a 5-byte trailer: one compression type byte
//! and the masked crc32c of the block contents plus that type byte.

use crate::coding::{decode_fixed32, decode_fixed64, get_varint64, put_fixed64, put_varint64};
use crate::collections::buffer_pool::BufferPool;
use crate::crc;
use crate::db::options::{CompressionType, ReadOptions};
use crate::env::file_system::RandomAccessFile;
use crate::error::LsmKvError;
use crate::Result;

/// 1-byte type + 32-bit crc
pub const BLOCK_TRAILER_SIZE: usize = 5;

/// Picked by running `echo http://code.google.com/p/leveldb/ | sha1sum`
/// and taking the leading 64 bits.
pub const TABLE_MAGIC_NUMBER: u64 = 0xdb4775248b80fb57;

/// Pointer to the extent of a file that stores a block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    /// Maximum encoding length of a BlockHandle
    pub const MAX_ENCODED_LENGTH: usize = 10 + 10;

    pub fn new(offset: u64, size: u64) -> BlockHandle {
        BlockHandle { offset, size }
    }

    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        put_varint64(dst, self.offset);
        put_varint64(dst, self.size);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(Self::MAX_ENCODED_LENGTH);
        self.encode_to(&mut v);
        v
    }

    /// Decode a handle from the front of `src`, returning it with the
    /// number of bytes consumed.
    pub fn decode_from(src: &[u8]) -> Result<(BlockHandle, usize)> {
        let (offset, n1) =
            get_varint64(src).ok_or_else(|| LsmKvError::corruption("bad block handle"))?;
        let (size, n2) =
            get_varint64(&src[n1..]).ok_or_else(|| LsmKvError::corruption("bad block handle"))?;
        Ok((BlockHandle { offset, size }, n1 + n2))
    }
}

/// Fixed information stored at the tail end of every table file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Footer {
    pub metaindex_handle: BlockHandle,
    pub index_handle: BlockHandle,
}

impl Footer {
    /// Encoded length of a Footer. It consists of two block handles,
    /// padded to their maximum length, and a magic number.
    pub const ENCODED_LENGTH: usize = 2 * BlockHandle::MAX_ENCODED_LENGTH + 8;

    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        let original_size = dst.len();
        self.metaindex_handle.encode_to(dst);
        self.index_handle.encode_to(dst);
        // Padding
        dst.resize(original_size + 2 * BlockHandle::MAX_ENCODED_LENGTH, 0);
        put_fixed64(dst, TABLE_MAGIC_NUMBER);
        debug_assert_eq!(dst.len(), original_size + Self::ENCODED_LENGTH);
    }

    pub fn decode_from(src: &[u8]) -> Result<Footer> {
        if src.len() < Self::ENCODED_LENGTH {
            return Err(LsmKvError::corruption("file is too short to be an sstable"));
        }
        let magic = decode_fixed64(&src[Self::ENCODED_LENGTH - 8..]);
        if magic != TABLE_MAGIC_NUMBER {
            return Err(LsmKvError::corruption("not an sstable (bad magic number)"));
        }
        let (metaindex_handle, n) = BlockHandle::decode_from(src)?;
        let (index_handle, _) = BlockHandle::decode_from(&src[n..])?;
        Ok(Footer {
            metaindex_handle,
            index_handle,
        })
    }
}

/// Read the block identified by `handle` from `file`, verify it if asked
/// to and return its uncompressed contents.
pub fn read_block(
    file: &dyn RandomAccessFile,
    options: &ReadOptions,
    handle: &BlockHandle,
    pool: &BufferPool,
) -> Result<Vec<u8>> {
    // Read the block contents as well as the type/crc footer.
    let n = handle.size as usize;
    let mut buf = pool.acquire(n + BLOCK_TRAILER_SIZE);
    if let Err(e) = file.read_exact_at(&mut buf, handle.offset) {
        pool.release(buf);
        return Err(match e {
            LsmKvError::IOError(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                LsmKvError::corruption("truncated block read")
            }
            e => e,
        });
    }

    if options.verify_checksums {
        let expected = crc::unmask(decode_fixed32(&buf[n + 1..]));
        let actual = crc::value(&buf[..n + 1]);
        if actual != expected {
            pool.release(buf);
            return Err(LsmKvError::corruption("block checksum mismatch"));
        }
    }

    match CompressionType::from_u8(buf[n]) {
        Some(CompressionType::None) => {
            buf.truncate(n);
            Ok(buf)
        }
        Some(CompressionType::Snappy) => {
            let result = decompress_block(&buf[..n], pool);
            pool.release(buf);
            result
        }
        None => {
            pool.release(buf);
            Err(LsmKvError::corruption("bad block type"))
        }
    }
}

fn decompress_block(src: &[u8], pool: &BufferPool) -> Result<Vec<u8>> {
    let corrupted = |_: snap::Error| LsmKvError::corruption("corrupted compressed block contents");
    let len = snap::raw::decompress_len(src).map_err(corrupted)?;
    let mut out = pool.acquire(len);
    match snap::raw::Decoder::new().decompress(src, &mut out) {
        Ok(written) => {
            out.truncate(written);
            Ok(out)
        }
        Err(e) => {
            pool.release(out);
            Err(corrupted(e))
        }
    }
}
