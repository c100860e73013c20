//! Names of the files a database keeps in its directory.

use crate::env::file_system::FileSystem;
use crate::Result;
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    Log,
    DBLock,
    Table,
    Descriptor,
    Current,
    Temp,
    InfoLog,
}

fn make_file_name(dbname: &Path, number: u64, suffix: &str) -> PathBuf {
    dbname.join(format!("{:06}.{}", number, suffix))
}

pub fn log_file_name(dbname: &Path, number: u64) -> PathBuf {
    debug_assert!(number > 0);
    make_file_name(dbname, number, "log")
}

pub fn table_file_name(dbname: &Path, number: u64) -> PathBuf {
    debug_assert!(number > 0);
    make_file_name(dbname, number, "sst")
}

pub fn descriptor_file_name(dbname: &Path, number: u64) -> PathBuf {
    debug_assert!(number > 0);
    dbname.join(format!("MANIFEST-{:06}", number))
}

pub fn current_file_name(dbname: &Path) -> PathBuf {
    dbname.join("CURRENT")
}

pub fn lock_file_name(dbname: &Path) -> PathBuf {
    dbname.join("LOCK")
}

pub fn temp_file_name(dbname: &Path, number: u64) -> PathBuf {
    debug_assert!(number > 0);
    make_file_name(dbname, number, "dbtmp")
}

pub fn info_log_file_name(dbname: &Path) -> PathBuf {
    dbname.join("LOG")
}

/// Parse a file name, returning its number (zero for unnumbered files)
/// and type. Owned filenames have the form:
///
/// ```text
///    dbname/CURRENT
///    dbname/LOCK
///    dbname/LOG
///    dbname/LOG.old
///    dbname/MANIFEST-[0-9]+
///    dbname/[0-9]+.(log|sst|dbtmp)
/// ```
pub fn parse_file_name(filename: &str) -> Option<(u64, FileType)> {
    match filename {
        "CURRENT" => return Some((0, FileType::Current)),
        "LOCK" => return Some((0, FileType::DBLock)),
        "LOG" | "LOG.old" => return Some((0, FileType::InfoLog)),
        _ => {}
    }
    if let Some(rest) = filename.strip_prefix("MANIFEST-") {
        return parse_number(rest).map(|n| (n, FileType::Descriptor));
    }
    let (number, suffix) = filename.split_once('.')?;
    let number = parse_number(number)?;
    let file_type = match suffix {
        "log" => FileType::Log,
        "sst" => FileType::Table,
        "dbtmp" => FileType::Temp,
        _ => return None,
    };
    Some((number, file_type))
}

fn parse_number(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Make the CURRENT file point to the descriptor file with the
/// specified number.
pub fn set_current_file(dbname: &Path, descriptor_number: u64) -> Result<()> {
    // CURRENT holds the bare manifest name followed by a newline
    let contents = format!("MANIFEST-{:06}\n", descriptor_number);
    let tmp = temp_file_name(dbname, descriptor_number);
    let result = FileSystem::write_string_to_file_sync(&contents, &tmp)
        .and_then(|_| Ok(std::fs::rename(&tmp, current_file_name(dbname))?));
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

#[cfg(test)]
mod tests {
    use crate::db::filename::*;
    use std::path::Path;

    #[test]
    fn test_parse() {
        let cases = [
            ("100.log", 100, FileType::Log),
            ("0.log", 0, FileType::Log),
            ("0.sst", 0, FileType::Table),
            ("CURRENT", 0, FileType::Current),
            ("LOCK", 0, FileType::DBLock),
            ("MANIFEST-2", 2, FileType::Descriptor),
            ("MANIFEST-7", 7, FileType::Descriptor),
            ("LOG", 0, FileType::InfoLog),
            ("LOG.old", 0, FileType::InfoLog),
            ("18446744073709551615.log", u64::MAX, FileType::Log),
            ("000123.dbtmp", 123, FileType::Temp),
        ];
        for (name, number, file_type) in cases {
            assert_eq!(Some((number, file_type)), parse_file_name(name), "{}", name);
        }

        let errors = [
            "",
            "foo",
            "foo-dx-100.log",
            ".log",
            "manifest",
            "CURREN",
            "CURRENTX",
            "MANIFES",
            "MANIFEST",
            "MANIFEST-",
            "XMANIFEST-3",
            "MANIFEST-3x",
            "LOC",
            "LOCKx",
            "LO",
            "LOGx",
            "18446744073709551616.log",
            "184467440737095516150.log",
            "100",
            "100.",
            "100.lop",
        ];
        for name in errors {
            assert_eq!(None, parse_file_name(name), "{}", name);
        }
    }

    #[test]
    fn test_construction() {
        let db = Path::new("foo");
        let check = |path: std::path::PathBuf, number: u64, file_type: FileType| {
            assert_eq!(path.parent().unwrap(), db);
            let name = path.file_name().unwrap().to_str().unwrap();
            assert_eq!(Some((number, file_type)), parse_file_name(name));
        };
        check(current_file_name(db), 0, FileType::Current);
        check(lock_file_name(db), 0, FileType::DBLock);
        check(log_file_name(db, 192), 192, FileType::Log);
        check(table_file_name(db, 200), 200, FileType::Table);
        check(descriptor_file_name(db, 100), 100, FileType::Descriptor);
        check(temp_file_name(db, 999), 999, FileType::Temp);
        check(info_log_file_name(db), 0, FileType::InfoLog);
        assert_eq!(log_file_name(db, 7), db.join("000007.log"));
    }

    #[test]
    fn test_set_current_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        set_current_file(temp_dir.path(), 5).unwrap();
        let current = std::fs::read_to_string(current_file_name(temp_dir.path())).unwrap();
        assert_eq!(current, "MANIFEST-000005\n");
        assert!(!temp_file_name(temp_dir.path(), 5).exists());
    }
}
