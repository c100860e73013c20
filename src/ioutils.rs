use crate::Result;
use std::io;
use std::io::{BufWriter, Seek, SeekFrom, Write};

/// Buffered writer that knows how many bytes the underlying file holds,
/// including what is still buffered.
pub struct BufWriterWithPos<W: Write + Seek> {
    writer: BufWriter<W>,
    pos: u64,
}

impl<W: Write + Seek> BufWriterWithPos<W> {
    pub fn new(mut inner: W) -> Result<Self> {
        let pos = inner.seek(SeekFrom::End(0))?;
        Ok(BufWriterWithPos {
            writer: BufWriter::new(inner),
            pos,
        })
    }

    #[inline]
    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn get_ref(&self) -> &W {
        self.writer.get_ref()
    }
}

impl<W: Write + Seek> Write for BufWriterWithPos<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = self.writer.write(buf)?;
        self.pos += len as u64;
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use crate::ioutils::BufWriterWithPos;
    use std::fs::OpenOptions;
    use std::io::Write;

    #[test]
    fn test_positions() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("file");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .unwrap();
        let mut writer = BufWriterWithPos::new(file).unwrap();
        assert_eq!(writer.pos(), 0);
        writer.write_all(b"hello").unwrap();
        writer.write_all(b" world").unwrap();
        assert_eq!(writer.pos(), 11);
        writer.flush().unwrap();

        let file = OpenOptions::new().append(true).open(&path).unwrap();
        let writer = BufWriterWithPos::new(file).unwrap();
        assert_eq!(writer.pos(), 11);

        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }
}
