use crate::ioutils::BufWriterWithPos;
use crate::Result;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::Path;

/// Sink for log and table files.
pub trait WritableFile: Write + Send {
    /// Flush buffered data and force it to stable storage.
    fn sync(&mut self) -> Result<()>;
}

impl WritableFile for BufWriterWithPos<File> {
    fn sync(&mut self) -> Result<()> {
        self.flush()?;
        self.get_ref().sync_data()?;
        Ok(())
    }
}

impl<W: WritableFile + ?Sized> WritableFile for Box<W> {
    fn sync(&mut self) -> Result<()> {
        (**self).sync()
    }
}

impl WritableFile for Vec<u8> {
    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

/// File that supports positioned reads from many threads at once.
pub trait RandomAccessFile: Send + Sync {
    /// Read exactly `buf.len()` bytes starting at `offset`.
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()>;
}

pub struct FileSystem {}

impl FileSystem {
    /// Create a new empty file, truncating any existing one.
    pub fn create_writable_file(path: &Path) -> Result<BufWriterWithPos<File>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        BufWriterWithPos::new(file)
    }

    /// Open a file for appending, creating it if needed.
    pub fn create_appendable_file(path: &Path) -> Result<BufWriterWithPos<File>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        BufWriterWithPos::new(file)
    }

    pub fn open_sequential_file(path: &Path) -> Result<BufReader<File>> {
        Ok(BufReader::new(File::open(path)?))
    }

    pub fn open_random_access_file(path: &Path) -> Result<Box<dyn RandomAccessFile>> {
        #[cfg(feature = "mmap")]
        {
            Ok(Box::new(mmap::MmapFile::open(path)?))
        }
        #[cfg(not(feature = "mmap"))]
        {
            Ok(Box::new(PositionalFile::open(path)?))
        }
    }

    pub fn file_size(path: &Path) -> Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }

    /// Names of the entries in `dir`. Names that are not valid UTF-8 are skipped.
    pub fn children(dir: &Path) -> Result<Vec<String>> {
        let mut result = vec![];
        for entry in std::fs::read_dir(dir)? {
            if let Some(name) = entry?.file_name().to_str() {
                result.push(name.to_string());
            }
        }
        Ok(result)
    }

    pub fn read_file_to_string(path: &Path) -> Result<String> {
        let mut contents = String::new();
        File::open(path)?.read_to_string(&mut contents)?;
        Ok(contents)
    }

    pub fn write_string_to_file_sync(data: &str, path: &Path) -> Result<()> {
        let mut file = Self::create_writable_file(path)?;
        let result = match file.write_all(data.as_bytes()) {
            Ok(()) => file.sync(),
            Err(e) => Err(e.into()),
        };
        if result.is_err() {
            let _ = std::fs::remove_file(path);
        }
        result
    }

    /// Persist directory entries, so that a rename or create survives a crash.
    pub fn sync_dir(dir: &Path) -> Result<()> {
        #[cfg(unix)]
        {
            File::open(dir)?.sync_all()?;
        }
        #[cfg(not(unix))]
        {
            let _ = dir;
        }
        Ok(())
    }
}

#[cfg(not(feature = "mmap"))]
struct PositionalFile {
    #[cfg(unix)]
    file: File,
    #[cfg(not(unix))]
    file: std::sync::Mutex<File>,
}

#[cfg(not(feature = "mmap"))]
impl PositionalFile {
    fn open(path: &Path) -> Result<PositionalFile> {
        let file = File::open(path)?;
        #[cfg(not(unix))]
        let file = std::sync::Mutex::new(file);
        Ok(PositionalFile { file })
    }
}

#[cfg(not(feature = "mmap"))]
impl RandomAccessFile for PositionalFile {
    #[cfg(unix)]
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        use std::io::{Seek, SeekFrom};
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }
}

#[cfg(feature = "mmap")]
pub mod mmap {
    use crate::env::file_system::RandomAccessFile;
    use crate::Result;
    use memmap::{Mmap, MmapOptions};
    use std::fs::File;
    use std::io;
    use std::path::Path;

    pub struct MmapFile {
        mmap: Option<Mmap>,
    }

    impl MmapFile {
        pub fn open(path: &Path) -> Result<MmapFile> {
            let file = File::open(path)?;
            // an empty file cannot be mapped
            let mmap = if file.metadata()?.len() == 0 {
                None
            } else {
                Some(unsafe { MmapOptions::new().map(&file)? })
            };
            Ok(MmapFile { mmap })
        }
    }

    impl RandomAccessFile for MmapFile {
        fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
            let data: &[u8] = match &self.mmap {
                Some(m) => m,
                None => &[],
            };
            let start = offset as usize;
            let end = start.checked_add(buf.len());
            match end {
                Some(end) if end <= data.len() => {
                    buf.copy_from_slice(&data[start..end]);
                    Ok(())
                }
                _ => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of file").into()),
            }
        }
    }
}
