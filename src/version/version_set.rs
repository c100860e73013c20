use crate::compaction::Compaction;
use crate::comparator::Comparator;
use crate::db::filename::{
    current_file_name, descriptor_file_name, parse_file_name, set_current_file, FileType,
};
use crate::db::key_types::{InternalKey, InternalKeyComparator, SequenceNumber};
use crate::db::options::{Options, ReadOptions, L0_COMPACTION_TRIGGER, NUM_LEVELS};
use crate::env::file_system::FileSystem;
use crate::error::LsmKvError;
use crate::ioutils::BufWriterWithPos;
use crate::iterator::{BoxedIterator, MergingIterator};
use crate::sstable::table_cache::TableCache;
use crate::version::version_edit::{FileMetaData, VersionEdit};
use crate::version::{
    concatenating_iterator, expanded_compaction_byte_size_limit, total_file_size, Version,
};
use crate::wal;
use crate::Result;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

fn max_bytes_for_level(mut level: usize) -> f64 {
    // Note: the result for level zero is not really used since we set
    // the level-0 compaction threshold based on number of files.

    // Result for both level-0 and level-1
    let mut result = 10.0 * 1048576.0;
    while level > 1 {
        result *= 10.0;
        level -= 1;
    }
    result
}

/// Finds the largest key in a vector of files.
fn find_largest_key<'a>(icmp: &InternalKeyComparator, files: &'a [Arc<FileMetaData>]) -> Option<&'a InternalKey> {
    files
        .iter()
        .map(|f| &f.largest)
        .max_by(|a, b| icmp.compare(a.encode(), b.encode()))
}

/// Finds the minimum file in `level_files` which fulfils
/// `f.smallest > largest_key` and
/// `user_key(f.smallest) == user_key(largest_key)`.
fn find_smallest_boundary_file(
    icmp: &InternalKeyComparator,
    level_files: &[Arc<FileMetaData>],
    largest_key: &InternalKey,
) -> Option<Arc<FileMetaData>> {
    let ucmp = icmp.user_comparator();
    let mut smallest_boundary_file: Option<&Arc<FileMetaData>> = None;
    for f in level_files {
        if icmp.compare(f.smallest.encode(), largest_key.encode()) == Ordering::Greater
            && ucmp.compare(f.smallest.user_key(), largest_key.user_key()) == Ordering::Equal
        {
            let smaller = match smallest_boundary_file {
                None => true,
                Some(s) => icmp.compare(f.smallest.encode(), s.smallest.encode()) == Ordering::Less,
            };
            if smaller {
                smallest_boundary_file = Some(f);
            }
        }
    }
    smallest_boundary_file.cloned()
}

/// Extracts the largest file b1 from `compaction_files` and then searches
/// for a b2 in `level_files` for which `user_key(u1) = user_key(l2)`. If
/// it finds such a file b2 (known as a boundary file) it adds it to
/// `compaction_files` and then searches again using this new upper bound.
///
/// If there are two blocks, b1=(l1, u1) and b2=(l2, u2) and
/// `user_key(u1) = user_key(l2)`, and if we compact b1 but not b2 then a
/// subsequent get operation will yield an incorrect result because it
/// will return the record from b2 in level i rather than from b1 because
/// it searches level by level for records matching the supplied user key.
fn add_boundary_inputs(
    icmp: &InternalKeyComparator,
    level_files: &[Arc<FileMetaData>],
    compaction_files: &mut Vec<Arc<FileMetaData>>,
) {
    let mut largest_key = match find_largest_key(icmp, compaction_files) {
        Some(k) => k.clone(),
        // Quick return if compaction_files is empty.
        None => return,
    };
    while let Some(f) = find_smallest_boundary_file(icmp, level_files, &largest_key) {
        largest_key = f.largest.clone();
        compaction_files.push(f);
    }
}

/// Smallest and largest key in `inputs`. REQUIRES: `inputs` is not empty.
fn get_range(icmp: &InternalKeyComparator, inputs: &[Arc<FileMetaData>]) -> (InternalKey, InternalKey) {
    debug_assert!(!inputs.is_empty());
    let mut smallest = &inputs[0].smallest;
    let mut largest = &inputs[0].largest;
    for f in &inputs[1..] {
        if icmp.compare(f.smallest.encode(), smallest.encode()) == Ordering::Less {
            smallest = &f.smallest;
        }
        if icmp.compare(f.largest.encode(), largest.encode()) == Ordering::Greater {
            largest = &f.largest;
        }
    }
    (smallest.clone(), largest.clone())
}

#[derive(Default)]
struct LevelState {
    deleted_files: HashSet<u64>,
    added_files: Vec<Arc<FileMetaData>>,
}

/// Helper that accumulates a sequence of edits on top of a base version
/// without creating the intermediate versions.
struct Builder<'a> {
    icmp: &'a InternalKeyComparator,
    base: Arc<Version>,
    levels: Vec<LevelState>,
}

impl<'a> Builder<'a> {
    fn new(icmp: &'a InternalKeyComparator, base: Arc<Version>) -> Builder<'a> {
        Builder {
            icmp,
            base,
            levels: (0..NUM_LEVELS).map(|_| LevelState::default()).collect(),
        }
    }

    /// Apply all of the edits in `edit` to the current state.
    fn apply(&mut self, edit: &VersionEdit, compact_pointer: &mut [Vec<u8>]) {
        // Update compaction pointers
        for (level, key) in &edit.compact_pointers {
            compact_pointer[*level] = key.encode().to_vec();
        }

        // Delete files
        for (level, number) in &edit.deleted_files {
            self.levels[*level].deleted_files.insert(*number);
        }

        // Add new files
        for (level, f) in &edit.new_files {
            let f = f.clone();
            // We arrange to automatically compact this file after a
            // certain number of seeks. Let's assume:
            //   (1) One seek costs 10ms
            //   (2) Writing or reading 1MB costs 10ms (100MB/s)
            //   (3) A compaction of 1MB does 25MB of IO:
            //         1MB read from this level
            //         10-12MB read from next level (boundaries may be misaligned)
            //         10-12MB written to next level
            // This implies that 25 seeks cost the same as the compaction
            // of 1MB of data. I.e., one seek costs approximately the same
            // as the compaction of 40KB of data. We are a little
            // conservative and allow approximately one seek for every 16KB
            // of data before triggering a compaction.
            let allowed_seeks = ((f.file_size / 16384) as i64).max(100);
            f.allowed_seeks
                .store(allowed_seeks, std::sync::atomic::Ordering::Relaxed);
            self.levels[*level].deleted_files.remove(&f.number);
            self.levels[*level].added_files.push(Arc::new(f));
        }
    }

    /// Save the current state in `v`.
    fn save_to(&self, v: &mut Version) {
        for level in 0..NUM_LEVELS {
            let state = &self.levels[level];
            let mut files: Vec<Arc<FileMetaData>> = self.base.files[level]
                .iter()
                .chain(state.added_files.iter())
                .filter(|f| !state.deleted_files.contains(&f.number))
                .cloned()
                .collect();
            // Sort by smallest key, breaking ties by file number
            files.sort_by(|a, b| {
                match self.icmp.compare(a.smallest.encode(), b.smallest.encode()) {
                    Ordering::Equal => a.number.cmp(&b.number),
                    o => o,
                }
            });

            if level > 0 {
                // Make sure there is no overlap in levels > 0
                debug_assert!(files.windows(2).all(|w| self
                    .icmp
                    .compare(w[0].largest.encode(), w[1].smallest.encode())
                    == Ordering::Less));
            }
            v.files[level] = files;
        }
    }
}

/// The set of versions of a database, plus the bookkeeping numbers that
/// are persisted in the manifest.
pub struct VersionSet {
    dbname: PathBuf,
    options: Arc<Options>,
    icmp: InternalKeyComparator,
    table_cache: Arc<TableCache>,
    next_file_number: u64,
    manifest_file_number: u64,
    last_sequence: SequenceNumber,
    log_number: u64,
    /// 0 or backing store for memtable being compacted
    prev_log_number: u64,

    descriptor_log: Option<wal::Writer<BufWriterWithPos<File>>>,
    current: Arc<Version>,
    /// Every version handed out, so that files of versions still being
    /// read are kept alive.
    versions: Vec<Weak<Version>>,

    /// Per-level key at which the next compaction at that level should
    /// start. Either an empty string, or a valid internal key.
    compact_pointer: Vec<Vec<u8>>,
}

impl VersionSet {
    pub fn new(
        dbname: &Path,
        options: Arc<Options>,
        table_cache: Arc<TableCache>,
        icmp: InternalKeyComparator,
    ) -> VersionSet {
        let current = Arc::new(Version::new(icmp.clone(), table_cache.clone(), options.max_file_size));
        VersionSet {
            dbname: dbname.to_path_buf(),
            options,
            icmp,
            table_cache,
            next_file_number: 2,
            manifest_file_number: 0, // Filled by recover()
            last_sequence: 0,
            log_number: 0,
            prev_log_number: 0,
            descriptor_log: None,
            versions: vec![Arc::downgrade(&current)],
            current,
            compact_pointer: vec![vec![]; NUM_LEVELS],
        }
    }

    #[inline]
    pub fn current(&self) -> Arc<Version> {
        self.current.clone()
    }

    #[inline]
    pub fn manifest_file_number(&self) -> u64 {
        self.manifest_file_number
    }

    /// Allocate and return a new file number
    #[inline]
    pub fn new_file_number(&mut self) -> u64 {
        let n = self.next_file_number;
        self.next_file_number += 1;
        n
    }

    /// Arrange to reuse `file_number` unless a newer file number has
    /// already been allocated.
    /// REQUIRES: `file_number` was returned by a call to `new_file_number()`.
    pub fn reuse_file_number(&mut self, file_number: u64) {
        if self.next_file_number == file_number + 1 {
            self.next_file_number = file_number;
        }
    }

    /// Mark the specified file number as used.
    pub fn mark_file_number_used(&mut self, number: u64) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }

    #[inline]
    pub fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence
    }

    pub fn set_last_sequence(&mut self, s: SequenceNumber) {
        debug_assert!(s >= self.last_sequence);
        self.last_sequence = s;
    }

    /// The current log file number.
    #[inline]
    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    /// The log file number of the log that is currently being compacted,
    /// or zero if there is no such log file.
    #[inline]
    pub fn prev_log_number(&self) -> u64 {
        self.prev_log_number
    }

    pub fn num_level_files(&self, level: usize) -> usize {
        self.current.files[level].len()
    }

    pub fn num_level_bytes(&self, level: usize) -> u64 {
        total_file_size(&self.current.files[level])
    }

    /// Summary of the number of files per level, e.g. `files[ 2 0 1 0 0 0 0 ]`.
    pub fn level_summary(&self) -> String {
        let counts: Vec<String> = self
            .current
            .files
            .iter()
            .map(|f| f.len().to_string())
            .collect();
        format!("files[ {} ]", counts.join(" "))
    }

    /// Returns true iff some level needs a compaction.
    pub fn needs_compaction(&self) -> bool {
        self.current.compaction_score >= 1.0 || self.current.file_to_compact().is_some()
    }

    fn append_version(&mut self, v: Arc<Version>) {
        self.versions.retain(|w| w.strong_count() > 0);
        self.versions.push(Arc::downgrade(&v));
        self.current = v;
    }

    /// Apply `edit` to the current version to form a new descriptor that
    /// is both saved to persistent state and installed as the new
    /// current version.
    pub fn log_and_apply(&mut self, edit: &mut VersionEdit) -> Result<()> {
        match edit.log_number {
            Some(n) => {
                debug_assert!(n >= self.log_number);
                debug_assert!(n < self.next_file_number);
            }
            None => edit.set_log_number(self.log_number),
        }
        if edit.prev_log_number.is_none() {
            edit.set_prev_log_number(self.prev_log_number);
        }
        edit.set_next_file(self.next_file_number);
        edit.set_last_sequence(self.last_sequence);

        let mut v = Version::new(self.icmp.clone(), self.table_cache.clone(), self.options.max_file_size);
        {
            let mut builder = Builder::new(&self.icmp, self.current.clone());
            builder.apply(edit, &mut self.compact_pointer);
            builder.save_to(&mut v);
        }
        self.finalize(&mut v);

        // Initialize new descriptor log file if necessary by creating a
        // temporary file that contains a snapshot of the current version.
        let mut new_manifest_file = None;
        if self.descriptor_log.is_none() {
            let path = descriptor_file_name(&self.dbname, self.manifest_file_number);
            let file = FileSystem::create_writable_file(&path).map_err(manifest_error)?;
            let mut log = wal::Writer::new(file);
            if let Err(e) = self.write_snapshot(&mut log) {
                let _ = std::fs::remove_file(&path);
                return Err(manifest_error(e));
            }
            self.descriptor_log = Some(log);
            new_manifest_file = Some(path);
        }

        // Write new record to MANIFEST log
        let mut record = vec![];
        edit.encode_to(&mut record);
        let result = match self.descriptor_log.as_mut() {
            Some(log) => log.add_record(&record).and_then(|_| log.sync()),
            None => Err(LsmKvError::ManifestFile("descriptor log is not open".to_string())),
        }
        // If we just created a new descriptor file, install it by writing
        // a new CURRENT file that points to it.
        .and_then(|_| match new_manifest_file {
            Some(_) => set_current_file(&self.dbname, self.manifest_file_number),
            None => Ok(()),
        });

        match result {
            Ok(()) => {
                debug!("manifest #{} applied {:?}", self.manifest_file_number, edit);
                self.append_version(Arc::new(v));
                self.log_number = edit.log_number.unwrap_or(self.log_number);
                self.prev_log_number = edit.prev_log_number.unwrap_or(self.prev_log_number);
                Ok(())
            }
            Err(e) => {
                error!("manifest write failed: {}", e);
                if let Some(path) = new_manifest_file {
                    self.descriptor_log = None;
                    let _ = std::fs::remove_file(path);
                }
                Err(manifest_error(e))
            }
        }
    }

    /// Recover the last saved descriptor from persistent storage.
    /// Returns whether a new manifest has to be written.
    pub fn recover(&mut self) -> Result<bool> {
        // Read "CURRENT" file, which contains a pointer to the current manifest file
        let current = FileSystem::read_file_to_string(&current_file_name(&self.dbname))?;
        if current.is_empty() || !current.ends_with('\n') {
            return Err(LsmKvError::corruption("CURRENT file does not end with newline"));
        }
        let current_name = current.trim_end_matches('\n');

        let dscname = self.dbname.join(current_name);
        let file = match FileSystem::open_sequential_file(&dscname) {
            Ok(file) => file,
            Err(LsmKvError::IOError(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LsmKvError::corruption(
                    "CURRENT points to a non-existent file",
                ));
            }
            Err(e) => return Err(e),
        };

        let mut log_number = None;
        let mut prev_log_number = None;
        let mut next_file = None;
        let mut last_sequence = None;
        let mut read_records = 0;

        let mut v = Version::new(self.icmp.clone(), self.table_cache.clone(), self.options.max_file_size);
        {
            let mut builder = Builder::new(&self.icmp, self.current.clone());
            let mut reader = wal::Reader::new(file, wal::LogReporter::new(0), true);
            while let Some(record) = reader.read_record() {
                read_records += 1;
                let edit = VersionEdit::decode_from(&record)?;
                if let Some(name) = &edit.comparator {
                    if name != self.icmp.user_comparator().name() {
                        return Err(LsmKvError::InvalidArgument(format!(
                            "{} does not match existing comparator {}",
                            name,
                            self.icmp.user_comparator().name()
                        )));
                    }
                }

                builder.apply(&edit, &mut self.compact_pointer);

                log_number = edit.log_number.or(log_number);
                prev_log_number = edit.prev_log_number.or(prev_log_number);
                next_file = edit.next_file_number.or(next_file);
                last_sequence = edit.last_sequence.or(last_sequence);
            }
            if let Some(e) = reader.into_reporter().error {
                return Err(e);
            }
            builder.save_to(&mut v);
        }

        let next_file = next_file.ok_or_else(|| LsmKvError::corruption("no meta-nextfile entry in descriptor"))?;
        let log_number = log_number.ok_or_else(|| LsmKvError::corruption("no meta-lognumber entry in descriptor"))?;
        let last_sequence = last_sequence.ok_or_else(|| LsmKvError::corruption("no last-sequence-number entry in descriptor"))?;
        let prev_log_number = prev_log_number.unwrap_or(0);

        self.mark_file_number_used(prev_log_number);
        self.mark_file_number_used(log_number);

        // Install recovered version
        self.finalize(&mut v);
        self.append_version(Arc::new(v));
        self.manifest_file_number = next_file;
        self.next_file_number = next_file + 1;
        self.last_sequence = last_sequence;
        self.log_number = log_number;
        self.prev_log_number = prev_log_number;

        info!(
            "recovered manifest {} ({} records): {}, next file {}, last sequence {}",
            current_name,
            read_records,
            self.level_summary(),
            self.next_file_number,
            self.last_sequence
        );

        // See if we can reuse the existing MANIFEST file.
        if self.reuse_manifest(&dscname, current_name)? {
            Ok(false)
        } else {
            Ok(true)
        }
    }

    fn reuse_manifest(&mut self, dscname: &Path, dscbase: &str) -> Result<bool> {
        if !self.options.reuse_logs {
            return Ok(false);
        }
        let manifest_number = match parse_file_name(dscbase) {
            Some((number, FileType::Descriptor)) => number,
            _ => return Ok(false),
        };
        let manifest_size = FileSystem::file_size(dscname)?;
        // Make new compacted MANIFEST if old one is too big
        if manifest_size >= self.options.max_file_size as u64 {
            return Ok(false);
        }
        let file = match FileSystem::create_appendable_file(dscname) {
            Ok(file) => file,
            Err(e) => {
                warn!("reuse MANIFEST failed: {}", e);
                return Ok(false);
            }
        };
        info!("reusing MANIFEST {}", dscname.display());
        self.descriptor_log = Some(wal::Writer::with_offset(file, manifest_size));
        self.manifest_file_number = manifest_number;
        Ok(true)
    }

    /// Precomputed best level for next compaction.
    fn finalize(&self, v: &mut Version) {
        let mut best_level = 0;
        let mut best_score = -1.0;

        for level in 0..NUM_LEVELS - 1 {
            let score = if level == 0 {
                // We treat level-0 specially by bounding the number of files
                // instead of number of bytes for two reasons:
                //
                // (1) With larger write-buffer sizes, it is nice not to do too
                // many level-0 compactions.
                //
                // (2) The files in level-0 are merged on every read and
                // therefore we wish to avoid too many files when the individual
                // file size is small (perhaps because of a small write-buffer
                // setting, or very high compression ratios, or lots of
                // overwrites/deletions).
                v.files[level].len() as f64 / L0_COMPACTION_TRIGGER as f64
            } else {
                // Compute the ratio of current size to size limit.
                total_file_size(&v.files[level]) as f64 / max_bytes_for_level(level)
            };

            if score > best_score {
                best_level = level;
                best_score = score;
            }
        }

        v.compaction_level = best_level;
        v.compaction_score = best_score;
    }

    /// Save current contents to `log`.
    fn write_snapshot(&self, log: &mut wal::Writer<BufWriterWithPos<File>>) -> Result<()> {
        let mut edit = VersionEdit::default();
        edit.set_comparator_name(self.icmp.user_comparator().name());

        // Save compaction pointers
        for (level, key) in self.compact_pointer.iter().enumerate() {
            if !key.is_empty() {
                edit.set_compact_pointer(level, InternalKey::decode_from(key));
            }
        }

        // Save files
        for level in 0..NUM_LEVELS {
            for f in &self.current.files[level] {
                edit.add_file(level, f.number, f.file_size, f.smallest.clone(), f.largest.clone());
            }
        }

        let mut record = vec![];
        edit.encode_to(&mut record);
        log.add_record(&record)
    }

    /// Add all files listed in any live version to `live`.
    pub fn add_live_files(&mut self, live: &mut HashSet<u64>) {
        self.versions.retain(|w| w.strong_count() > 0);
        for v in self.versions.iter().filter_map(|w| w.upgrade()) {
            for files in &v.files {
                live.extend(files.iter().map(|f| f.number));
            }
        }
    }

    /// Return the approximate offset in the database of the data for
    /// `key` as of version `v`.
    pub fn approximate_offset_of(&self, v: &Version, ikey: &InternalKey) -> u64 {
        let mut result = 0;
        for level in 0..NUM_LEVELS {
            for f in &v.files[level] {
                if self.icmp.compare(f.largest.encode(), ikey.encode()) != Ordering::Greater {
                    // Entire file is before "ikey", so just add the file size
                    result += f.file_size;
                } else if self.icmp.compare(f.smallest.encode(), ikey.encode()) == Ordering::Greater {
                    // Entire file is after "ikey", so ignore
                    if level > 0 {
                        // Files other than level 0 are sorted by smallest,
                        // so no further files in this level will contain
                        // data for "ikey".
                        break;
                    }
                } else {
                    // "ikey" falls in the range for this table. Add the
                    // approximate offset of "ikey" within the table.
                    match self
                        .table_cache
                        .approximate_offset_of(f.number, f.file_size, ikey.encode())
                    {
                        Ok(offset) => result += offset,
                        Err(e) => warn!("cannot size table #{}: {}", f.number, e),
                    }
                }
            }
        }
        result
    }

    /// Create an iterator that reads over the compaction inputs for `c`.
    pub fn make_input_iterator(&self, c: &Compaction) -> BoxedIterator {
        let options = ReadOptions {
            verify_checksums: self.options.paranoid_checks,
            fill_cache: false,
            snapshot: None,
        };

        // Level-0 files have to be merged together. For other levels,
        // we will make a concatenating iterator per level.
        let mut list: Vec<BoxedIterator> = vec![];
        for which in 0..2 {
            if c.inputs[which].is_empty() {
                continue;
            }
            if c.level() + which == 0 {
                for f in &c.inputs[which] {
                    list.push(self.table_cache.iter(&options, f.number, f.file_size));
                }
            } else {
                list.push(concatenating_iterator(
                    &self.icmp,
                    &self.table_cache,
                    &options,
                    c.inputs[which].clone(),
                ));
            }
        }
        Box::new(MergingIterator::new(Arc::new(self.icmp.clone()), list))
    }

    /// Pick level and inputs for a new compaction.
    /// Returns `None` if there is no compaction to be done.
    pub fn pick_compaction(&mut self) -> Option<Compaction> {
        let current = self.current.clone();

        // We prefer compactions triggered by too much data in a level over
        // the compactions triggered by seeks.
        let size_compaction = current.compaction_score >= 1.0;
        let seek_compaction = current.file_to_compact();

        let mut c;
        if size_compaction {
            let level = current.compaction_level;
            debug_assert!(level + 1 < NUM_LEVELS);
            c = Compaction::new(self.icmp.clone(), self.options.max_file_size, level, current.clone());

            // Pick the first file that comes after compact_pointer[level]
            let picked = current.files[level]
                .iter()
                .find(|f| {
                    self.compact_pointer[level].is_empty()
                        || self
                            .icmp
                            .compare(f.largest.encode(), &self.compact_pointer[level])
                            == Ordering::Greater
                })
                // Wrap-around to the beginning of the key space
                .or_else(|| current.files[level].first())?;
            c.inputs[0].push(picked.clone());
        } else if let Some((f, level)) = seek_compaction {
            c = Compaction::new(self.icmp.clone(), self.options.max_file_size, level, current.clone());
            c.inputs[0].push(f);
        } else {
            return None;
        }

        // Files in level 0 may overlap each other, so pick up all overlapping ones
        if c.level() == 0 {
            let (smallest, largest) = get_range(&self.icmp, &c.inputs[0]);
            // Note that the next call will discard the file we placed in
            // c.inputs[0] earlier and replace it with an overlapping set
            // which will include the picked file.
            c.inputs[0] = current.get_overlapping_inputs(0, Some(&smallest), Some(&largest));
            debug_assert!(!c.inputs[0].is_empty());
        }

        self.setup_other_inputs(&mut c);
        Some(c)
    }

    fn setup_other_inputs(&mut self, c: &mut Compaction) {
        let level = c.level();
        let current = c.input_version().clone();

        add_boundary_inputs(&self.icmp, &current.files[level], &mut c.inputs[0]);
        let (smallest, mut largest) = get_range(&self.icmp, &c.inputs[0]);

        c.inputs[1] = current.get_overlapping_inputs(level + 1, Some(&smallest), Some(&largest));
        add_boundary_inputs(&self.icmp, &current.files[level + 1], &mut c.inputs[1]);

        // Get entire range covered by compaction
        let all: Vec<Arc<FileMetaData>> = c.inputs[0].iter().chain(c.inputs[1].iter()).cloned().collect();
        let (mut all_start, mut all_limit) = get_range(&self.icmp, &all);

        // See if we can grow the number of inputs in "level" without
        // changing the number of "level+1" files we pick up.
        if !c.inputs[1].is_empty() {
            let mut expanded0 = current.get_overlapping_inputs(level, Some(&all_start), Some(&all_limit));
            add_boundary_inputs(&self.icmp, &current.files[level], &mut expanded0);
            let inputs0_size = total_file_size(&c.inputs[0]);
            let inputs1_size = total_file_size(&c.inputs[1]);
            let expanded0_size = total_file_size(&expanded0);
            if expanded0.len() > c.inputs[0].len()
                && inputs1_size + expanded0_size
                    < expanded_compaction_byte_size_limit(self.options.max_file_size)
            {
                let (new_start, new_limit) = get_range(&self.icmp, &expanded0);
                let mut expanded1 = current.get_overlapping_inputs(level + 1, Some(&new_start), Some(&new_limit));
                add_boundary_inputs(&self.icmp, &current.files[level + 1], &mut expanded1);
                if expanded1.len() == c.inputs[1].len() {
                    info!(
                        "expanding@{} {}+{} ({}+{} bytes) to {}+{} ({}+{} bytes)",
                        level,
                        c.inputs[0].len(),
                        c.inputs[1].len(),
                        inputs0_size,
                        inputs1_size,
                        expanded0.len(),
                        expanded1.len(),
                        expanded0_size,
                        inputs1_size
                    );
                    largest = new_limit;
                    c.inputs[0] = expanded0;
                    c.inputs[1] = expanded1;
                    let all: Vec<Arc<FileMetaData>> =
                        c.inputs[0].iter().chain(c.inputs[1].iter()).cloned().collect();
                    let range = get_range(&self.icmp, &all);
                    all_start = range.0;
                    all_limit = range.1;
                }
            }
        }

        // Compute the set of grandparent files that overlap this compaction
        // (parent == level+1; grandparent == level+2)
        if level + 2 < NUM_LEVELS {
            c.grandparents = current.get_overlapping_inputs(level + 2, Some(&all_start), Some(&all_limit));
        }

        // Update the place where we will do the next compaction for this
        // level. We update this immediately instead of waiting for the
        // VersionEdit to be applied so that if the compaction fails, we
        // will try a different key range next time.
        self.compact_pointer[level] = largest.encode().to_vec();
        c.edit.set_compact_pointer(level, largest);
    }

    /// Return a compaction object for compacting the range `[begin, end]`
    /// in the specified level. Returns `None` if there is nothing in that
    /// level that overlaps the specified range.
    pub fn compact_range(
        &mut self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Option<Compaction> {
        let current = self.current.clone();
        let mut inputs = current.get_overlapping_inputs(level, begin, end);
        if inputs.is_empty() {
            return None;
        }

        // Avoid compacting too much in one shot in case the range is large.
        // But we cannot do this for level-0 since level-0 files can overlap
        // and we must not pick one file and drop another older file if the
        // two files overlap.
        if level > 0 {
            let limit = self.options.max_file_size as u64;
            let mut total = 0;
            for i in 0..inputs.len() {
                total += inputs[i].file_size;
                if total >= limit {
                    inputs.truncate(i + 1);
                    break;
                }
            }
        }

        let mut c = Compaction::new(self.icmp.clone(), self.options.max_file_size, level, current);
        c.inputs[0] = inputs;
        self.setup_other_inputs(&mut c);
        Some(c)
    }
}

/// Failures to persist version edits are reported as manifest errors.
fn manifest_error(e: LsmKvError) -> LsmKvError {
    match e {
        LsmKvError::ManifestFile(_) => e,
        e => LsmKvError::ManifestFile(e.to_string()),
    }
}
