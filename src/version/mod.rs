//! Versions of the set of live table files.
//!
//! A [`Version`] is an immutable snapshot of which files exist at which
//! level. Readers hold an `Arc<Version>` for as long as they read from its
//! files; the [`VersionSet`](version_set::VersionSet) produces new versions
//! by applying [`VersionEdit`](version_edit::VersionEdit)s and keeps track
//! of which ones are still in use.

pub mod version_edit;
pub mod version_set;

use crate::comparator::Comparator;
use crate::db::key_types::{
    InternalKey, InternalKeyComparator, LookupKey, ParsedInternalKey, ValueType,
    MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK,
};
use crate::db::options::{ReadOptions, MAX_MEM_COMPACT_LEVEL, NUM_LEVELS};
use crate::error::LsmKvError;
use crate::iterator::{BoxedIterator, KvIterator, TwoLevelIterator};
use crate::sstable::table_cache::TableCache;
use crate::Result;
use std::cmp::Ordering;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::{Arc, Mutex};
use version_edit::FileMetaData;

pub(crate) fn total_file_size(files: &[Arc<FileMetaData>]) -> u64 {
    files.iter().map(|f| f.file_size).sum()
}

/// Maximum bytes of overlaps in grandparent (i.e., level+2) before we
/// stop building a single file in a level->level+1 compaction.
pub(crate) fn max_grand_parent_overlap_bytes(max_file_size: usize) -> u64 {
    10 * max_file_size as u64
}

/// Maximum number of bytes in all compacted files. We avoid expanding
/// the lower level file set of a compaction if it would make the
/// total compaction cover more than this many bytes.
pub(crate) fn expanded_compaction_byte_size_limit(max_file_size: usize) -> u64 {
    25 * max_file_size as u64
}

/// Return the smallest index i such that `files[i].largest >= key`.
/// Return `files.len()` if there is no such file.
/// REQUIRES: `files` contains a sorted list of non-overlapping files.
pub(crate) fn find_file(icmp: &InternalKeyComparator, files: &[Arc<FileMetaData>], key: &[u8]) -> usize {
    files.partition_point(|f| icmp.compare(f.largest.encode(), key) == Ordering::Less)
}

fn after_file(ucmp: &dyn Comparator, user_key: Option<&[u8]>, f: &FileMetaData) -> bool {
    // None user_key occurs before all keys and is therefore never after f
    matches!(user_key, Some(k) if ucmp.compare(k, f.largest.user_key()) == Ordering::Greater)
}

fn before_file(ucmp: &dyn Comparator, user_key: Option<&[u8]>, f: &FileMetaData) -> bool {
    // None user_key occurs after all keys and is therefore never before f
    matches!(user_key, Some(k) if ucmp.compare(k, f.smallest.user_key()) == Ordering::Less)
}

/// Returns true iff some file in `files` overlaps the user key range
/// `[smallest_user_key, largest_user_key]`. `None` stands for a key
/// smaller (respectively larger) than all keys in the DB.
/// REQUIRES: if `disjoint_sorted_files`, `files` contains disjoint
/// ranges in sorted order.
pub(crate) fn some_file_overlaps_range(
    icmp: &InternalKeyComparator,
    disjoint_sorted_files: bool,
    files: &[Arc<FileMetaData>],
    smallest_user_key: Option<&[u8]>,
    largest_user_key: Option<&[u8]>,
) -> bool {
    let ucmp = icmp.user_comparator().as_ref();
    if !disjoint_sorted_files {
        // Need to check against all files
        return files.iter().any(|f| {
            !(after_file(ucmp, smallest_user_key, f) || before_file(ucmp, largest_user_key, f))
        });
    }

    // Binary search over file list
    let index = match smallest_user_key {
        Some(k) => {
            // Find the earliest possible internal key for smallest_user_key
            let small_key = InternalKey::new(k, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
            find_file(icmp, files, small_key.encode())
        }
        None => 0,
    };

    if index >= files.len() {
        // beginning of range is after all files, so no overlap.
        return false;
    }
    !before_file(ucmp, largest_user_key, &files[index])
}

/// Iterator over the entries of a sorted run of disjoint files, opening
/// each table lazily.
pub(crate) fn concatenating_iterator(
    icmp: &InternalKeyComparator,
    table_cache: &Arc<TableCache>,
    options: &ReadOptions,
    files: Vec<Arc<FileMetaData>>,
) -> BoxedIterator {
    let index_iter = LevelFileNumIterator::new(icmp.clone(), files);
    let table_cache = table_cache.clone();
    let options = options.clone();
    Box::new(TwoLevelIterator::new(
        Box::new(index_iter),
        move |file_value: &[u8]| -> Result<BoxedIterator> {
            let (number, size) = LevelFileNumIterator::decode_value(file_value)?;
            Ok(table_cache.iter(&options, number, size))
        },
    ))
}

/// File charged for a lookup that had to consult more than one file.
#[derive(Default)]
pub struct GetStats {
    pub seek_file: Option<(Arc<FileMetaData>, usize)>,
}

pub struct Version {
    icmp: InternalKeyComparator,
    table_cache: Arc<TableCache>,
    max_file_size: usize,

    /// List of files per level
    pub(crate) files: Vec<Vec<Arc<FileMetaData>>>,

    /// Next file to compact based on seek stats.
    file_to_compact: Mutex<Option<(Arc<FileMetaData>, usize)>>,

    /// Level that should be compacted next and its compaction score.
    /// Score < 1 means compaction is not strictly needed. These fields
    /// are initialized by `VersionSet::finalize`.
    pub(crate) compaction_score: f64,
    pub(crate) compaction_level: usize,
}

impl Version {
    pub(crate) fn new(
        icmp: InternalKeyComparator,
        table_cache: Arc<TableCache>,
        max_file_size: usize,
    ) -> Version {
        Version {
            icmp,
            table_cache,
            max_file_size,
            files: vec![vec![]; NUM_LEVELS],
            file_to_compact: Mutex::new(None),
            compaction_score: -1.0,
            compaction_level: 0,
        }
    }

    #[inline]
    pub fn files(&self, level: usize) -> &[Arc<FileMetaData>] {
        &self.files[level]
    }

    pub(crate) fn file_to_compact(&self) -> Option<(Arc<FileMetaData>, usize)> {
        self.file_to_compact.lock().unwrap().clone()
    }

    /// Append to `iters` a sequence of iterators that will yield the
    /// contents of this Version when merged together.
    pub fn add_iterators(&self, options: &ReadOptions, iters: &mut Vec<BoxedIterator>) {
        // Merge all level zero files together since they may overlap
        for f in &self.files[0] {
            iters.push(self.table_cache.iter(options, f.number, f.file_size));
        }

        // For levels > 0, we can use a concatenating iterator that
        // sequentially walks through the non-overlapping files in the
        // level, opening them lazily.
        for level in 1..NUM_LEVELS {
            if !self.files[level].is_empty() {
                iters.push(self.concatenating_iterator(options, level));
            }
        }
    }

    pub(crate) fn concatenating_iterator(&self, options: &ReadOptions, level: usize) -> BoxedIterator {
        concatenating_iterator(
            &self.icmp,
            &self.table_cache,
            options,
            self.files[level].clone(),
        )
    }

    /// Call `func(level, f)` for every file that overlaps `user_key`, in
    /// order from newest to oldest. Stops when `func` returns false.
    fn for_each_overlapping<F>(&self, user_key: &[u8], internal_key: &[u8], mut func: F)
    where
        F: FnMut(usize, &Arc<FileMetaData>) -> bool,
    {
        let ucmp = self.icmp.user_comparator();

        // Search level-0 in order from newest to oldest.
        let mut tmp: Vec<&Arc<FileMetaData>> = self.files[0]
            .iter()
            .filter(|f| {
                ucmp.compare(user_key, f.smallest.user_key()) != Ordering::Less
                    && ucmp.compare(user_key, f.largest.user_key()) != Ordering::Greater
            })
            .collect();
        tmp.sort_by(|a, b| b.number.cmp(&a.number));
        for f in tmp {
            if !func(0, f) {
                return;
            }
        }

        // Search other levels.
        for level in 1..NUM_LEVELS {
            let files = &self.files[level];
            if files.is_empty() {
                continue;
            }
            // Binary search to find earliest index whose largest key >= internal_key.
            let index = find_file(&self.icmp, files, internal_key);
            if index < files.len() {
                let f = &files[index];
                if ucmp.compare(user_key, f.smallest.user_key()) != Ordering::Less
                    && !func(level, f)
                {
                    return;
                }
            }
        }
    }

    /// Look up the value for `key`. Returns `Ok(None)` when the key is
    /// absent or deleted. Fills `stats` with the file to charge for the
    /// lookup, if any.
    pub fn get(
        &self,
        options: &ReadOptions,
        key: &LookupKey,
        stats: &mut GetStats,
    ) -> Result<Option<Vec<u8>>> {
        let ucmp = self.icmp.user_comparator().clone();
        let user_key = key.user_key();
        let internal_key = key.internal_key();

        let mut last_file_read: Option<(Arc<FileMetaData>, usize)> = None;
        let mut result: Result<Option<Vec<u8>>> = Ok(None);
        self.for_each_overlapping(user_key, internal_key, |level, f| {
            if stats.seek_file.is_none() && last_file_read.is_some() {
                // We have had more than one seek for this read. Charge the 1st file.
                stats.seek_file = last_file_read.take();
            }
            last_file_read = Some((f.clone(), level));

            match self
                .table_cache
                .get(options, f.number, f.file_size, internal_key)
            {
                Ok(Some((found_key, value))) => match ParsedInternalKey::parse(&found_key) {
                    None => {
                        result = Err(LsmKvError::corruption(format!(
                            "corrupted key in table #{}",
                            f.number
                        )));
                        false
                    }
                    Some(parsed) => {
                        if ucmp.compare(parsed.user_key, user_key) != Ordering::Equal {
                            // Keep searching in other files
                            return true;
                        }
                        result = match parsed.value_type {
                            ValueType::Value => Ok(Some(value)),
                            ValueType::Deletion => Ok(None),
                        };
                        false
                    }
                },
                Ok(None) => true,
                Err(e) => {
                    result = Err(e);
                    false
                }
            }
        });
        result
    }

    /// Charge a seek to the file named in `stats`. Returns true if a new
    /// compaction may need to be triggered.
    pub fn update_stats(&self, stats: &GetStats) -> bool {
        if let Some((f, level)) = &stats.seek_file {
            let remaining = f.allowed_seeks.fetch_sub(1, AtomicOrdering::Relaxed) - 1;
            let mut file_to_compact = self.file_to_compact.lock().unwrap();
            if remaining <= 0 && file_to_compact.is_none() {
                *file_to_compact = Some((f.clone(), *level));
                return true;
            }
        }
        false
    }

    /// Record a sample of bytes read at the specified internal key.
    /// Samples are taken approximately once every `READ_BYTES_PERIOD`
    /// bytes. Returns true if a new compaction may need to be triggered.
    pub fn record_read_sample(&self, internal_key: &[u8]) -> bool {
        let parsed = match ParsedInternalKey::parse(internal_key) {
            Some(p) => p,
            None => return false,
        };

        let mut stats = GetStats::default();
        let mut matches = 0;
        self.for_each_overlapping(parsed.user_key, internal_key, |level, f| {
            matches += 1;
            if matches == 1 {
                // Remember first match.
                stats.seek_file = Some((f.clone(), level));
            }
            // We can stop iterating once we have a second match.
            matches < 2
        });

        // Must have at least two matches since we want to merge across
        // files. But what if we have a single file that contains many
        // overwrites and deletions? Should we have another mechanism for
        // finding such a file?
        if matches >= 2 {
            return self.update_stats(&stats);
        }
        false
    }

    /// Returns true iff some file in the specified level overlaps some
    /// part of `[smallest_user_key, largest_user_key]`.
    pub fn overlap_in_level(
        &self,
        level: usize,
        smallest_user_key: Option<&[u8]>,
        largest_user_key: Option<&[u8]>,
    ) -> bool {
        some_file_overlaps_range(
            &self.icmp,
            level > 0,
            &self.files[level],
            smallest_user_key,
            largest_user_key,
        )
    }

    /// Return the level at which we should place a new memtable
    /// compaction result that covers the range
    /// `[smallest_user_key, largest_user_key]`.
    pub fn pick_level_for_memtable_output(
        &self,
        smallest_user_key: &[u8],
        largest_user_key: &[u8],
    ) -> usize {
        let mut level = 0;
        if !self.overlap_in_level(0, Some(smallest_user_key), Some(largest_user_key)) {
            // Push to next level if there is no overlap in next level,
            // and the #bytes overlapping in the level after that are limited.
            let start = InternalKey::new(smallest_user_key, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
            let limit = InternalKey::new(largest_user_key, 0, ValueType::Deletion);
            while level < MAX_MEM_COMPACT_LEVEL {
                if self.overlap_in_level(level + 1, Some(smallest_user_key), Some(largest_user_key)) {
                    break;
                }
                if level + 2 < NUM_LEVELS {
                    // Check that file does not overlap too many grandparent bytes.
                    let overlaps = self.get_overlapping_inputs(level + 2, Some(&start), Some(&limit));
                    if total_file_size(&overlaps) > max_grand_parent_overlap_bytes(self.max_file_size) {
                        break;
                    }
                }
                level += 1;
            }
        }
        level
    }

    /// Return all files in `level` that overlap `[begin, end]`. `None`
    /// bounds are open.
    pub fn get_overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Vec<Arc<FileMetaData>> {
        debug_assert!(level < NUM_LEVELS);
        let ucmp = self.icmp.user_comparator();
        let mut user_begin = begin.map(|k| k.user_key().to_vec());
        let mut user_end = end.map(|k| k.user_key().to_vec());
        let mut inputs = vec![];
        let mut i = 0;
        while i < self.files[level].len() {
            let f = &self.files[level][i];
            i += 1;
            let file_start = f.smallest.user_key();
            let file_limit = f.largest.user_key();
            if matches!(&user_begin, Some(b) if ucmp.compare(file_limit, b) == Ordering::Less) {
                // "f" is completely before specified range; skip it
            } else if matches!(&user_end, Some(e) if ucmp.compare(file_start, e) == Ordering::Greater) {
                // "f" is completely after specified range; skip it
            } else {
                inputs.push(f.clone());
                if level == 0 {
                    // Level-0 files may overlap each other. So check if the
                    // newly added file has expanded the range. If so, restart
                    // search.
                    if matches!(&user_begin, Some(b) if ucmp.compare(file_start, b) == Ordering::Less) {
                        user_begin = Some(file_start.to_vec());
                        inputs.clear();
                        i = 0;
                    } else if matches!(&user_end, Some(e) if ucmp.compare(file_limit, e) == Ordering::Greater) {
                        user_end = Some(file_limit.to_vec());
                        inputs.clear();
                        i = 0;
                    }
                }
            }
        }
        inputs
    }

    /// A human readable string that describes this version's contents.
    pub fn debug_string(&self) -> String {
        let mut r = String::new();
        for (level, files) in self.files.iter().enumerate() {
            // E.g.,
            //   --- level 1 ---
            //   17:123['a' .. 'd']
            //   20:43['e' .. 'g']
            r.push_str(&format!("--- level {} ---\n", level));
            for f in files {
                r.push_str(&format!(
                    " {}:{}[{:?} .. {:?}]\n",
                    f.number, f.file_size, f.smallest, f.largest
                ));
            }
        }
        r
    }
}

/// An internal iterator. For a given version/level pair, yields
/// information about the files in the level. For a given entry, `key()`
/// is the largest key that occurs in the file, and `value()` is a
/// 16-byte value containing the file number and file size, both encoded
/// using fixed64.
pub(crate) struct LevelFileNumIterator {
    icmp: InternalKeyComparator,
    files: Vec<Arc<FileMetaData>>,
    index: usize,
    value_buf: [u8; 16],
}

impl LevelFileNumIterator {
    pub(crate) fn new(icmp: InternalKeyComparator, files: Vec<Arc<FileMetaData>>) -> Self {
        let index = files.len();
        LevelFileNumIterator {
            icmp,
            files,
            // Marks as invalid
            index,
            value_buf: [0; 16],
        }
    }

    fn fill_value(&mut self) {
        if let Some(f) = self.files.get(self.index) {
            self.value_buf[..8].copy_from_slice(&f.number.to_le_bytes());
            self.value_buf[8..].copy_from_slice(&f.file_size.to_le_bytes());
        }
    }

    pub(crate) fn decode_value(value: &[u8]) -> Result<(u64, u64)> {
        if value.len() != 16 {
            return Err(LsmKvError::corruption(
                "FileReader invoked with unexpected value",
            ));
        }
        Ok((
            crate::coding::decode_fixed64(value),
            crate::coding::decode_fixed64(&value[8..]),
        ))
    }
}

impl KvIterator for LevelFileNumIterator {
    fn valid(&self) -> bool {
        self.index < self.files.len()
    }

    fn seek_to_first(&mut self) {
        self.index = 0;
        self.fill_value();
    }

    fn seek_to_last(&mut self) {
        self.index = if self.files.is_empty() {
            0
        } else {
            self.files.len() - 1
        };
        self.fill_value();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index = find_file(&self.icmp, &self.files, target);
        self.fill_value();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.index += 1;
        self.fill_value();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        self.index = if self.index == 0 {
            // Marks as invalid
            self.files.len()
        } else {
            self.index - 1
        };
        self.fill_value();
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        self.files[self.index].largest.encode()
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.value_buf
    }

    fn status(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::comparator::BytewiseComparator;
    use crate::db::key_types::{InternalKey, InternalKeyComparator, ValueType};
    use crate::version::version_edit::FileMetaData;
    use crate::version::{find_file, some_file_overlaps_range};
    use std::sync::Arc;

    struct FindFileTest {
        disjoint_sorted_files: bool,
        files: Vec<Arc<FileMetaData>>,
        icmp: InternalKeyComparator,
    }

    impl FindFileTest {
        fn new() -> FindFileTest {
            FindFileTest {
                disjoint_sorted_files: true,
                files: vec![],
                icmp: InternalKeyComparator::new(Arc::new(BytewiseComparator)),
            }
        }

        fn add_seq(&mut self, smallest: &str, largest: &str, smallest_seq: u64, largest_seq: u64) {
            let number = self.files.len() as u64 + 1;
            self.files.push(Arc::new(FileMetaData::new(
                number,
                0,
                InternalKey::new(smallest.as_bytes(), smallest_seq, ValueType::Value),
                InternalKey::new(largest.as_bytes(), largest_seq, ValueType::Value),
            )));
        }

        fn add(&mut self, smallest: &str, largest: &str) {
            self.add_seq(smallest, largest, 100, 100);
        }

        fn find(&self, key: &str) -> usize {
            let target = InternalKey::new(key.as_bytes(), 100, ValueType::Value);
            find_file(&self.icmp, &self.files, target.encode())
        }

        fn overlaps(&self, smallest: Option<&str>, largest: Option<&str>) -> bool {
            some_file_overlaps_range(
                &self.icmp,
                self.disjoint_sorted_files,
                &self.files,
                smallest.map(|s| s.as_bytes()),
                largest.map(|s| s.as_bytes()),
            )
        }
    }

    #[test]
    fn test_empty() {
        let t = FindFileTest::new();
        assert_eq!(0, t.find("foo"));
        assert!(!t.overlaps(Some("a"), Some("z")));
        assert!(!t.overlaps(None, Some("z")));
        assert!(!t.overlaps(Some("a"), None));
        assert!(!t.overlaps(None, None));
    }

    #[test]
    fn test_single() {
        let mut t = FindFileTest::new();
        t.add("p", "q");
        assert_eq!(0, t.find("a"));
        assert_eq!(0, t.find("p"));
        assert_eq!(0, t.find("p1"));
        assert_eq!(0, t.find("q"));
        assert_eq!(1, t.find("q1"));
        assert_eq!(1, t.find("z"));

        assert!(!t.overlaps(Some("a"), Some("b")));
        assert!(!t.overlaps(Some("z1"), Some("z2")));
        assert!(t.overlaps(Some("a"), Some("p")));
        assert!(t.overlaps(Some("a"), Some("q")));
        assert!(t.overlaps(Some("a"), Some("z")));
        assert!(t.overlaps(Some("p"), Some("p1")));
        assert!(t.overlaps(Some("p"), Some("q")));
        assert!(t.overlaps(Some("p"), Some("z")));
        assert!(t.overlaps(Some("p1"), Some("p2")));
        assert!(t.overlaps(Some("p1"), Some("z")));
        assert!(t.overlaps(Some("q"), Some("q")));
        assert!(t.overlaps(Some("q"), Some("q1")));

        assert!(!t.overlaps(None, Some("j")));
        assert!(!t.overlaps(Some("r"), None));
        assert!(t.overlaps(None, Some("p")));
        assert!(t.overlaps(None, Some("p1")));
        assert!(t.overlaps(Some("q"), None));
        assert!(t.overlaps(None, None));
    }

    #[test]
    fn test_multiple() {
        let mut t = FindFileTest::new();
        t.add("150", "200");
        t.add("200", "250");
        t.add("300", "350");
        t.add("400", "450");
        assert_eq!(0, t.find("100"));
        assert_eq!(0, t.find("150"));
        assert_eq!(0, t.find("151"));
        assert_eq!(0, t.find("199"));
        assert_eq!(0, t.find("200"));
        assert_eq!(1, t.find("201"));
        assert_eq!(1, t.find("249"));
        assert_eq!(1, t.find("250"));
        assert_eq!(2, t.find("251"));
        assert_eq!(2, t.find("299"));
        assert_eq!(2, t.find("300"));
        assert_eq!(2, t.find("349"));
        assert_eq!(2, t.find("350"));
        assert_eq!(3, t.find("351"));
        assert_eq!(3, t.find("400"));
        assert_eq!(3, t.find("450"));
        assert_eq!(4, t.find("451"));

        assert!(!t.overlaps(Some("100"), Some("149")));
        assert!(!t.overlaps(Some("251"), Some("299")));
        assert!(!t.overlaps(Some("451"), Some("500")));
        assert!(!t.overlaps(Some("351"), Some("399")));

        assert!(t.overlaps(Some("100"), Some("150")));
        assert!(t.overlaps(Some("100"), Some("200")));
        assert!(t.overlaps(Some("100"), Some("300")));
        assert!(t.overlaps(Some("100"), Some("400")));
        assert!(t.overlaps(Some("100"), Some("500")));
        assert!(t.overlaps(Some("375"), Some("400")));
        assert!(t.overlaps(Some("450"), Some("450")));
        assert!(t.overlaps(Some("450"), Some("500")));
    }

    #[test]
    fn test_overlap_sequence_checks() {
        let mut t = FindFileTest::new();
        t.add_seq("200", "200", 5000, 3000);
        assert!(!t.overlaps(Some("199"), Some("199")));
        assert!(!t.overlaps(Some("201"), Some("300")));
        assert!(t.overlaps(Some("200"), Some("200")));
        assert!(t.overlaps(Some("190"), Some("200")));
        assert!(t.overlaps(Some("200"), Some("210")));
    }

    #[test]
    fn test_overlapping_files() {
        let mut t = FindFileTest::new();
        t.add("150", "600");
        t.add("400", "500");
        t.disjoint_sorted_files = false;
        assert!(!t.overlaps(Some("100"), Some("149")));
        assert!(!t.overlaps(Some("601"), Some("700")));
        assert!(t.overlaps(Some("100"), Some("150")));
        assert!(t.overlaps(Some("100"), Some("200")));
        assert!(t.overlaps(Some("100"), Some("300")));
        assert!(t.overlaps(Some("100"), Some("400")));
        assert!(t.overlaps(Some("100"), Some("500")));
        assert!(t.overlaps(Some("375"), Some("400")));
        assert!(t.overlaps(Some("450"), Some("450")));
        assert!(t.overlaps(Some("450"), Some("500")));
        assert!(t.overlaps(Some("450"), Some("700")));
        assert!(t.overlaps(Some("600"), Some("700")));
    }
}
