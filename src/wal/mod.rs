//! Write-ahead log format.
//!
//! The log is a sequence of 32 KiB blocks. Each block holds physical
//! records with a 7-byte header:
//!
//! ```text
//! masked crc32c (4 bytes) | length (2 bytes) | type (1 byte) | payload
//! ```
//!
//! The crc covers the type byte and the payload. A logical record too big
//! for the rest of a block is split into a `First` fragment, any number of
//! `Middle` fragments and a `Last` fragment. A block tail shorter than a
//! header is zero-filled and skipped by readers.

pub mod reader;
pub mod writer;

pub use reader::{LogReporter, Reader, Reporter};
pub use writer::Writer;

pub const BLOCK_SIZE: usize = 32768;

/// Header is checksum (4 bytes), length (2 bytes), type (1 byte).
pub const HEADER_SIZE: usize = 4 + 2 + 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Reserved for preallocated files
    Zero = 0,
    Full = 1,
    First = 2,
    Middle = 3,
    Last = 4,
}

pub const MAX_RECORD_TYPE: u8 = RecordType::Last as u8;

impl RecordType {
    fn from_u8(b: u8) -> Option<RecordType> {
        match b {
            0 => Some(RecordType::Zero),
            1 => Some(RecordType::Full),
            2 => Some(RecordType::First),
            3 => Some(RecordType::Middle),
            4 => Some(RecordType::Last),
            _ => None,
        }
    }
}
