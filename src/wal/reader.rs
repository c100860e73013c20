use crate::coding::decode_fixed32;
use crate::crc;
use crate::error::LsmKvError;
use crate::wal::{RecordType, BLOCK_SIZE, HEADER_SIZE};
use std::io::{ErrorKind, Read};

/// Receives notice of dropped log data.
pub trait Reporter {
    /// Some corruption was detected. `bytes` is the approximate number of
    /// bytes dropped due to the corruption.
    fn corruption(&mut self, bytes: usize, reason: LsmKvError);
}

/// Reporter that logs every drop and keeps the first error.
#[derive(Default)]
pub struct LogReporter {
    pub log_number: u64,
    pub dropped_bytes: usize,
    pub error: Option<LsmKvError>,
}

impl LogReporter {
    pub fn new(log_number: u64) -> LogReporter {
        LogReporter {
            log_number,
            ..Default::default()
        }
    }
}

impl Reporter for LogReporter {
    fn corruption(&mut self, bytes: usize, reason: LsmKvError) {
        warn!(
            "log #{}: dropping {} bytes; {}",
            self.log_number, bytes, reason
        );
        self.dropped_bytes += bytes;
        if self.error.is_none() {
            self.error = Some(reason);
        }
    }
}

enum Physical {
    Record(RecordType, usize, usize),
    Eof,
    /// Returned when a physical record is invalid or skipped on purpose.
    BadRecord,
    UnknownType(u8, usize),
}

/// Reads logical records back from a log.
pub struct Reader<R: Read, P: Reporter> {
    file: R,
    reporter: P,
    checksum: bool,
    backing_store: Vec<u8>,
    /// live bytes of the current block are `backing_store[buf_start..buf_end]`
    buf_start: usize,
    buf_end: usize,
    /// Last read indicated EOF by returning < BLOCK_SIZE
    eof: bool,
}

impl<R: Read, P: Reporter> Reader<R, P> {
    /// If `checksum` is true, verify checksums if available.
    pub fn new(file: R, reporter: P, checksum: bool) -> Reader<R, P> {
        Reader {
            file,
            reporter,
            checksum,
            backing_store: vec![0; BLOCK_SIZE],
            buf_start: 0,
            buf_end: 0,
            eof: false,
        }
    }

    pub fn into_reporter(self) -> P {
        self.reporter
    }

    #[inline]
    fn buffer_len(&self) -> usize {
        self.buf_end - self.buf_start
    }

    /// Read the next logical record. Returns `None` at end of input.
    pub fn read_record(&mut self) -> Option<Vec<u8>> {
        let mut scratch: Vec<u8> = vec![];
        let mut in_fragmented_record = false;

        loop {
            match self.read_physical_record() {
                Physical::Record(record_type, start, end) => match record_type {
                    RecordType::Full => {
                        if in_fragmented_record && !scratch.is_empty() {
                            self.report(scratch.len(), "partial record without end(1)");
                        }
                        return Some(self.backing_store[start..end].to_vec());
                    }
                    RecordType::First => {
                        if in_fragmented_record && !scratch.is_empty() {
                            self.report(scratch.len(), "partial record without end(2)");
                        }
                        scratch.clear();
                        scratch.extend_from_slice(&self.backing_store[start..end]);
                        in_fragmented_record = true;
                    }
                    RecordType::Middle => {
                        if !in_fragmented_record {
                            self.report(end - start, "missing start of fragmented record(1)");
                        } else {
                            scratch.extend_from_slice(&self.backing_store[start..end]);
                        }
                    }
                    RecordType::Last => {
                        if !in_fragmented_record {
                            self.report(end - start, "missing start of fragmented record(2)");
                        } else {
                            scratch.extend_from_slice(&self.backing_store[start..end]);
                            return Some(scratch);
                        }
                    }
                    RecordType::Zero => {
                        // read_physical_record never hands out zero records
                        self.report(end - start, "unexpected zero record");
                    }
                },
                Physical::Eof => {
                    // This can be caused by the writer dying immediately
                    // after writing a physical record but before completing
                    // the next one; don't treat it as a corruption, just
                    // ignore the entire logical record.
                    return None;
                }
                Physical::BadRecord => {
                    if in_fragmented_record {
                        self.report(scratch.len(), "error in middle of record");
                        in_fragmented_record = false;
                        scratch.clear();
                    }
                }
                Physical::UnknownType(t, len) => {
                    let dropped = len + if in_fragmented_record { scratch.len() } else { 0 };
                    self.report(dropped, &format!("unknown record type {}", t));
                    in_fragmented_record = false;
                    scratch.clear();
                }
            }
        }
    }

    fn report(&mut self, bytes: usize, reason: &str) {
        self.reporter
            .corruption(bytes, LsmKvError::corruption(reason.to_string()));
    }

    /// Fill the buffer with the next block. Returns false on a read error,
    /// which is reported and treated as end of file.
    fn read_block(&mut self) -> bool {
        self.buf_start = 0;
        self.buf_end = 0;
        while self.buf_end < BLOCK_SIZE {
            match self.file.read(&mut self.backing_store[self.buf_end..]) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => self.buf_end += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.buf_end = 0;
                    self.eof = true;
                    self.reporter.corruption(BLOCK_SIZE, e.into());
                    return false;
                }
            }
        }
        true
    }

    fn read_physical_record(&mut self) -> Physical {
        loop {
            if self.buffer_len() < HEADER_SIZE {
                if !self.eof {
                    // Last read was a full read, so this is a trailer to skip
                    if !self.read_block() {
                        return Physical::Eof;
                    }
                    continue;
                }
                // Note that if buffer is non-empty, we have a truncated header
                // at the end of the file, which can be caused by the writer
                // crashing in the middle of writing the header. Instead of
                // considering this an error, just report EOF.
                self.buf_start = self.buf_end;
                return Physical::Eof;
            }

            // Parse the header
            let header = &self.backing_store[self.buf_start..self.buf_start + HEADER_SIZE];
            let a = header[4] as usize;
            let b = header[5] as usize;
            let type_byte = header[6];
            let length = a | (b << 8);
            let expected_crc = crc::unmask(decode_fixed32(header));

            if HEADER_SIZE + length > self.buffer_len() {
                let drop_size = self.buffer_len();
                self.buf_start = self.buf_end;
                if !self.eof {
                    self.report(drop_size, "bad record length");
                    return Physical::BadRecord;
                }
                // If the end of the file has been reached without reading
                // `length` bytes of payload, assume the writer died in the
                // middle of writing the record. Don't report a corruption.
                return Physical::Eof;
            }

            if type_byte == RecordType::Zero as u8 && length == 0 {
                // Skip zero length record without reporting any drops since
                // such records are produced by the mmap based writing code
                // that preallocates file regions.
                self.buf_start = self.buf_end;
                return Physical::BadRecord;
            }

            let payload_start = self.buf_start + HEADER_SIZE;
            let payload_end = payload_start + length;

            // Check crc
            if self.checksum {
                let actual_crc = crc::value(&self.backing_store[payload_start - 1..payload_end]);
                if actual_crc != expected_crc {
                    // Drop the rest of the buffer since "length" itself may
                    // have been corrupted and if we trust it, we could find
                    // some fragment of a real log record that just happens
                    // to look like a valid log record.
                    let drop_size = self.buffer_len();
                    self.buf_start = self.buf_end;
                    self.report(drop_size, "checksum mismatch");
                    return Physical::BadRecord;
                }
            }

            self.buf_start = payload_end;
            return match RecordType::from_u8(type_byte) {
                Some(RecordType::Zero) | None => Physical::UnknownType(type_byte, length),
                Some(t) => Physical::Record(t, payload_start, payload_end),
            };
        }
    }
}
