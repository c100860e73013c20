use crate::coding::{encode_fixed32, encode_fixed64};
use crate::collections::buffer_pool::BufferPool;
use crate::compaction::compactor::{build_table, CompactionContext, Compactor};
use crate::compaction::Compaction;
use crate::db::db_iter::{DBIterator, ReadSampler};
use crate::db::filename::{
    current_file_name, descriptor_file_name, lock_file_name, log_file_name, parse_file_name,
    set_current_file, table_file_name, FileType,
};
use crate::db::key_types::{
    InternalKey, InternalKeyComparator, LookupKey, SequenceNumber, ValueType,
    MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK,
};
use crate::db::options::{
    Options, ReadOptions, WriteOptions, L0_SLOWDOWN_WRITES_TRIGGER, L0_STOP_WRITES_TRIGGER,
    NUM_LEVELS,
};
use crate::db::snapshot::{Snapshot, SnapshotList};
use crate::db::statistics::{CompactionStats, Statistics};
use crate::db::write_batch::{WriteBatch, HEADER_SIZE};
use crate::env::file_lock::FileLock;
use crate::env::file_system::{FileSystem, WritableFile};
use crate::error::LsmKvError;
use crate::iterator::{BoxedIterator, MergingIterator};
use crate::memory::{LookupResult, MemEntry, MemTable};
use crate::sstable::table_cache::TableCache;
use crate::sstable::{new_block_cache, BlockCache, TableOptions};
use crate::version::version_edit::{FileMetaData, VersionEdit};
use crate::version::version_set::VersionSet;
use crate::version::{GetStats, Version};
use crate::wal;
use crate::Result;
use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, Sender};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

type LogWriter = wal::Writer<Box<dyn WritableFile>>;

/// Number of open files reserved for other uses than the table cache.
const NUM_NON_TABLE_CACHE_FILES: usize = 10;

/// What readers need to find the newest data without taking the lock.
/// Replaced as a whole whenever the memtables or the current version
/// change.
struct ReadView {
    mem: Arc<MemTable>,
    imm: Option<Arc<MemTable>>,
    version: Arc<Version>,
}

/// A write waiting in the queue. `batch` is `None` for a request to
/// make room by switching memtables.
struct Writer {
    batch: Option<WriteBatch>,
    sync: bool,
    result: Mutex<Option<Result<()>>>,
}

impl Writer {
    fn is_done(&self) -> bool {
        self.result.lock().unwrap().is_some()
    }
}

/// Information for a manual compaction
struct ManualCompaction {
    id: u64,
    level: usize,
    done: bool,
    /// `None` means beginning of key range
    begin: Option<InternalKey>,
    /// `None` means end of key range
    end: Option<InternalKey>,
}

/// State guarded by the database mutex.
struct DbState {
    versions: VersionSet,
    mem: Arc<MemTable>,
    /// Memtable being compacted
    imm: Option<Arc<MemTable>>,
    logfile_number: u64,

    /// Queue of writers.
    writers: VecDeque<Arc<Writer>>,
    snapshots: SnapshotList,

    /// Set of table files to protect from deletion because they are
    /// part of ongoing compactions.
    pending_outputs: HashSet<u64>,

    /// Has a background compaction been scheduled or is running?
    bg_compaction_scheduled: bool,
    manual_compaction: Option<ManualCompaction>,
    next_manual_id: u64,

    /// Have we encountered a background error in paranoid mode?
    bg_error: Option<LsmKvError>,
    stats: [CompactionStats; NUM_LEVELS],

    bg_sender: Option<Sender<()>>,
}

pub(crate) struct DBImpl {
    dbname: PathBuf,
    options: Arc<Options>,
    icmp: InternalKeyComparator,
    table_cache: Arc<TableCache>,
    block_cache: Option<Arc<BlockCache>>,
    _db_lock: FileLock,

    state: Mutex<DbState>,
    /// Signalled when background work finishes
    bg_cv: Condvar,
    /// Signalled when a write group is done
    writers_cv: Condvar,

    log: Mutex<LogWriter>,
    read_view: ArcSwap<ReadView>,
    last_sequence: AtomicU64,
    has_imm: AtomicBool,
    shutting_down: AtomicBool,
}

/// Log files replayed at open, plus the memtable and log left to keep
/// using when `reuse_logs` is set.
struct Recovered {
    versions: VersionSet,
    edit: VersionEdit,
    save_manifest: bool,
    reused: Option<(Arc<MemTable>, LogWriter, u64)>,
}

impl DBImpl {
    /// Open the database and start its background compaction thread.
    pub(crate) fn open(path: &Path, options: &Options) -> Result<(Arc<DBImpl>, JoinHandle<()>)> {
        let options = Arc::new(options.sanitize());
        if options.create_if_missing {
            std::fs::create_dir_all(path)?;
        }
        let db_lock = FileLock::lock(&lock_file_name(path))?;

        let icmp = InternalKeyComparator::new(options.comparator.clone());
        let block_cache = if options.block_cache_capacity > 0 {
            Some(Arc::new(new_block_cache(options.block_cache_capacity)))
        } else {
            None
        };
        let table_options = TableOptions::for_database(
            &options,
            &icmp,
            block_cache.clone(),
            Arc::new(BufferPool::default()),
        );
        let table_cache = Arc::new(TableCache::new(
            path,
            table_options,
            options.max_open_files - NUM_NON_TABLE_CACHE_FILES,
        ));

        let versions = VersionSet::new(path, options.clone(), table_cache.clone(), icmp.clone());
        let recovered = Self::recover(path, &options, &icmp, &table_cache, versions)?;
        let Recovered {
            mut versions,
            mut edit,
            save_manifest,
            reused,
        } = recovered;

        let (mem, log, logfile_number, new_log) = match reused {
            Some((mem, log, number)) => (mem, log, number, false),
            None => {
                let number = versions.new_file_number();
                let file = FileSystem::create_writable_file(&log_file_name(path, number))?;
                let log: LogWriter = wal::Writer::new(Box::new(file) as Box<dyn WritableFile>);
                (Arc::new(MemTable::new(icmp.clone())), log, number, true)
            }
        };
        if save_manifest || new_log {
            // Earlier logs no longer needed
            edit.set_prev_log_number(0);
            edit.set_log_number(logfile_number);
            versions.log_and_apply(&mut edit)?;
        }

        let last_sequence = versions.last_sequence();
        let read_view = ReadView {
            mem: mem.clone(),
            imm: None,
            version: versions.current(),
        };
        let (sender, receiver) = crossbeam_channel::unbounded();
        let db = Arc::new(DBImpl {
            dbname: path.to_path_buf(),
            options,
            icmp,
            table_cache,
            block_cache,
            _db_lock: db_lock,
            state: Mutex::new(DbState {
                versions,
                mem,
                imm: None,
                logfile_number,
                writers: VecDeque::new(),
                snapshots: SnapshotList::default(),
                pending_outputs: HashSet::new(),
                bg_compaction_scheduled: false,
                manual_compaction: None,
                next_manual_id: 0,
                bg_error: None,
                stats: [CompactionStats::default(); NUM_LEVELS],
                bg_sender: Some(sender),
            }),
            bg_cv: Condvar::new(),
            writers_cv: Condvar::new(),
            log: Mutex::new(log),
            read_view: ArcSwap::from_pointee(read_view),
            last_sequence: AtomicU64::new(last_sequence),
            has_imm: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        });

        let handle = Self::start_compaction_task(db.clone(), receiver)?;
        {
            let mut state = db.state.lock().unwrap();
            db.delete_obsolete_files(&mut state);
            db.maybe_schedule_compaction(&mut state);
            info!(
                "opened {}: {}, last sequence {}",
                path.display(),
                state.versions.level_summary(),
                last_sequence
            );
        }
        Ok((db, handle))
    }

    fn start_compaction_task(db: Arc<DBImpl>, recv: Receiver<()>) -> Result<JoinHandle<()>> {
        let handle = thread::Builder::new()
            .name("lsmkv compaction".to_owned())
            .spawn(move || {
                info!("thread `{}` start!", thread::current().name().unwrap_or(""));
                while let Ok(()) = recv.recv() {
                    db.background_call();
                }
                info!("thread `{}` exit!", thread::current().name().unwrap_or(""));
            })?;
        Ok(handle)
    }

    /// Stop background work: wait for the running compaction and close
    /// the channel so the compaction thread exits.
    pub(crate) fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let mut state = self.state.lock().unwrap();
        while state.bg_compaction_scheduled {
            state = self.bg_cv.wait(state).unwrap();
        }
        state.bg_sender.take();
    }

    fn new_db(path: &Path, icmp: &InternalKeyComparator) -> Result<()> {
        let mut new_db = VersionEdit::default();
        new_db.set_comparator_name(icmp.user_comparator().name());
        new_db.set_log_number(0);
        new_db.set_next_file(2);
        new_db.set_last_sequence(0);

        let manifest = descriptor_file_name(path, 1);
        let file = FileSystem::create_writable_file(&manifest)?;
        let mut log = wal::Writer::new(file);
        let mut record = vec![];
        new_db.encode_to(&mut record);
        let result = log
            .add_record(&record)
            .and_then(|_| log.sync())
            .and_then(|_| set_current_file(path, 1));
        if result.is_err() {
            let _ = std::fs::remove_file(&manifest);
        }
        result
    }

    fn recover(
        path: &Path,
        options: &Options,
        icmp: &InternalKeyComparator,
        table_cache: &TableCache,
        mut versions: VersionSet,
    ) -> Result<Recovered> {
        if !current_file_name(path).exists() {
            if options.create_if_missing {
                info!("creating db {}", path.display());
                Self::new_db(path, icmp)?;
            } else {
                return Err(LsmKvError::InvalidArgument(format!(
                    "{} does not exist (create_if_missing is false)",
                    path.display()
                )));
            }
        } else if options.error_if_exists {
            return Err(LsmKvError::InvalidArgument(format!(
                "{} exists (error_if_exists is true)",
                path.display()
            )));
        }

        let mut save_manifest = versions.recover()?;

        // Recover from all newer log files than the ones named in the
        // descriptor (new log files may have been added by the previous
        // incarnation without registering them in the descriptor).
        //
        // Note that prev_log_number() is no longer used, but we pay
        // attention to it in case we are recovering a database
        // produced by an older version.
        let min_log = versions.log_number();
        let prev_log = versions.prev_log_number();
        let mut expected = HashSet::new();
        versions.add_live_files(&mut expected);
        let mut logs = vec![];
        for filename in FileSystem::children(path)? {
            if let Some((number, file_type)) = parse_file_name(&filename) {
                expected.remove(&number);
                if file_type == FileType::Log && (number >= min_log || number == prev_log) {
                    logs.push(number);
                }
            }
        }
        if let Some(missing) = expected.iter().next() {
            return Err(LsmKvError::corruption(format!(
                "{} missing files; e.g. {}",
                expected.len(),
                table_file_name(path, *missing).display()
            )));
        }

        // Recover in the order in which the logs were generated
        logs.sort_unstable();
        let mut edit = VersionEdit::default();
        let mut max_sequence = 0;
        let mut reused = None;
        for (i, log_number) in logs.iter().enumerate() {
            let mut replay = LogReplay {
                path,
                options,
                icmp,
                table_cache,
                versions: &mut versions,
                edit: &mut edit,
                save_manifest: &mut save_manifest,
                max_sequence: &mut max_sequence,
            };
            reused = replay.recover_log_file(*log_number, i == logs.len() - 1)?;

            // The previous incarnation may not have written any MANIFEST
            // records after allocating this log number. So we manually
            // update the file number allocation counter in VersionSet.
            versions.mark_file_number_used(*log_number);
        }

        if versions.last_sequence() < max_sequence {
            versions.set_last_sequence(max_sequence);
        }

        Ok(Recovered {
            versions,
            edit,
            save_manifest,
            reused,
        })
    }

    fn record_background_error(&self, state: &mut DbState, e: LsmKvError) {
        if state.bg_error.is_none() {
            error!("background error: {}", e);
            state.bg_error = Some(e);
            self.bg_cv.notify_all();
        }
    }

    fn install_read_view(&self, state: &DbState) {
        self.read_view.store(Arc::new(ReadView {
            mem: state.mem.clone(),
            imm: state.imm.clone(),
            version: state.versions.current(),
        }));
    }

    /// Delete any unneeded files and stale in-memory entries.
    fn delete_obsolete_files(&self, state: &mut DbState) {
        if state.bg_error.is_some() {
            // After a background error, we don't know whether a new version may
            // or may not have been committed, so we cannot safely garbage collect.
            return;
        }

        // Make a set of all of the live files
        let mut live = state.pending_outputs.clone();
        state.versions.add_live_files(&mut live);

        let filenames = match FileSystem::children(&self.dbname) {
            Ok(filenames) => filenames,
            Err(e) => {
                warn!("cannot list {}: {}", self.dbname.display(), e);
                return;
            }
        };
        let log_number = state.versions.log_number();
        let prev_log_number = state.versions.prev_log_number();
        let manifest_file_number = state.versions.manifest_file_number();
        for filename in filenames {
            let (number, file_type) = match parse_file_name(&filename) {
                Some(parsed) => parsed,
                None => continue,
            };
            let keep = match file_type {
                FileType::Log => number >= log_number || number == prev_log_number,
                // Keep my manifest file, and any newer incarnations'
                // (in case there is a race that allows other incarnations)
                FileType::Descriptor => number >= manifest_file_number,
                FileType::Table => live.contains(&number),
                // Any temp files that are currently being written to must
                // be recorded in pending_outputs, which is inserted into "live"
                FileType::Temp => live.contains(&number),
                FileType::Current | FileType::DBLock | FileType::InfoLog => true,
            };
            if keep {
                continue;
            }
            if file_type == FileType::Table {
                self.table_cache.evict(number);
            }
            info!("delete type={:?} #{}", file_type, number);
            if let Err(e) = std::fs::remove_file(self.dbname.join(&filename)) {
                // Retried on the next cleanup pass
                warn!("cannot delete {}: {}", filename, e);
            }
        }
    }

    fn maybe_schedule_compaction(&self, state: &mut DbState) {
        if state.bg_compaction_scheduled {
            // Already scheduled
        } else if self.shutting_down.load(Ordering::Acquire) {
            // DB is being deleted; no more background compactions
        } else if state.bg_error.is_some() {
            // Already got an error; no more changes
        } else if state.imm.is_none()
            && !matches!(&state.manual_compaction, Some(m) if !m.done)
            && !state.versions.needs_compaction()
        {
            // No work to be done
        } else if let Some(sender) = &state.bg_sender {
            match sender.send(()) {
                Ok(()) => state.bg_compaction_scheduled = true,
                Err(e) => warn!("cannot schedule compaction: {}", e),
            }
        }
    }

    fn background_call(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.bg_compaction_scheduled {
            return;
        }
        if self.shutting_down.load(Ordering::Acquire) {
            // No more background work when shutting down.
        } else if state.bg_error.is_some() {
            // No more background work after a background error.
        } else {
            let (s, result) = self.background_compaction(state);
            state = s;
            if let Err(e) = result {
                if self.shutting_down.load(Ordering::Acquire) {
                    // Ignore compaction errors found during shutting down
                } else if let LsmKvError::ManifestFile(_) = e {
                    self.record_background_error(&mut state, e);
                } else {
                    // Wait a little bit before retrying background compaction
                    // in case this is an environmental problem and we do not
                    // want to chew up resources for failed compactions for
                    // the duration of the problem.
                    error!("waiting after background compaction error: {}", e);
                    self.bg_cv.notify_all();
                    drop(state);
                    thread::sleep(Duration::from_secs(1));
                    state = self.state.lock().unwrap();
                }
            }
        }

        state.bg_compaction_scheduled = false;

        // Previous compaction may have produced too many files in a level,
        // so reschedule another compaction if needed.
        self.maybe_schedule_compaction(&mut state);
        self.bg_cv.notify_all();
    }

    fn background_compaction<'a>(
        &'a self,
        mut state: MutexGuard<'a, DbState>,
    ) -> (MutexGuard<'a, DbState>, Result<()>) {
        if state.imm.is_some() {
            return self.compact_imm_memtable(state);
        }

        let mut manual_end = None;
        let mut manual_id = None;
        let st = &mut *state;
        let c = match st.manual_compaction.as_mut().filter(|m| !m.done) {
            Some(m) => {
                manual_id = Some(m.id);
                let c = st
                    .versions
                    .compact_range(m.level, m.begin.as_ref(), m.end.as_ref());
                m.done = c.is_none();
                if let Some(c) = &c {
                    manual_end = c.inputs[0].last().map(|f| f.largest.clone());
                }
                info!(
                    "manual compaction at level-{} from {:?} .. {:?}; will stop at {:?}",
                    m.level, m.begin, m.end, manual_end
                );
                c
            }
            None => st.versions.pick_compaction(),
        };

        let mut result = Ok(());
        match c {
            None => {
                // Nothing to do
            }
            Some(mut c) if manual_id.is_none() && c.is_trivial_move() => {
                // Move file to next level
                let level = c.level();
                let f = c.inputs[0][0].clone();
                c.edit.delete_file(level, f.number);
                c.edit.add_file(
                    level + 1,
                    f.number,
                    f.file_size,
                    f.smallest.clone(),
                    f.largest.clone(),
                );
                result = state.versions.log_and_apply(&mut c.edit);
                self.install_read_view(&state);
                info!(
                    "moved #{} to level-{} {} bytes {}: {}",
                    f.number,
                    level + 1,
                    f.file_size,
                    if result.is_ok() { "ok" } else { "failed" },
                    state.versions.level_summary()
                );
            }
            Some(c) => {
                let (s, r) = self.do_compaction_work(state, c);
                state = s;
                result = r;
                self.delete_obsolete_files(&mut state);
            }
        }

        if let (Some(id), Some(m)) = (manual_id, state.manual_compaction.as_mut()) {
            if m.id == id {
                if result.is_err() {
                    m.done = true;
                }
                if !m.done {
                    // We only compacted part of the requested range. Update
                    // the begin key to continue from where we stopped.
                    m.begin = manual_end;
                }
            }
        }
        (state, result)
    }

    /// Compact the in-memory write buffer to disk. Switches to a new
    /// log file and memtable and writes a new descriptor iff successful.
    fn compact_imm_memtable<'a>(
        &'a self,
        state: MutexGuard<'a, DbState>,
    ) -> (MutexGuard<'a, DbState>, Result<()>) {
        let imm = match state.imm.clone() {
            Some(imm) => imm,
            None => return (state, Ok(())),
        };

        // Save the contents of the memtable as a new Table
        let mut edit = VersionEdit::default();
        let base = state.versions.current();
        let (mut state, mut result) = self.write_level0_table(state, &imm, &mut edit, &base);

        if result.is_ok() && self.shutting_down.load(Ordering::Acquire) {
            result = Err(LsmKvError::ShutDown);
        }

        // Replace immutable memtable with the generated Table
        if result.is_ok() {
            edit.set_prev_log_number(0);
            // Earlier logs no longer needed
            edit.set_log_number(state.logfile_number);
            result = state.versions.log_and_apply(&mut edit);
        }

        if result.is_ok() {
            // Commit to the new state
            state.imm = None;
            self.has_imm.store(false, Ordering::Release);
            self.install_read_view(&state);
            self.delete_obsolete_files(&mut state);
        }
        (state, result)
    }

    fn write_level0_table<'a>(
        &'a self,
        mut state: MutexGuard<'a, DbState>,
        mem: &Arc<MemTable>,
        edit: &mut VersionEdit,
        base: &Version,
    ) -> (MutexGuard<'a, DbState>, Result<()>) {
        let start = Instant::now();
        let mut meta = FileMetaData::new(
            state.versions.new_file_number(),
            0,
            InternalKey::default(),
            InternalKey::default(),
        );
        state.pending_outputs.insert(meta.number);
        info!("level-0 table #{}: started", meta.number);

        drop(state);
        let mut iter = mem.iter();
        let result = build_table(&self.dbname, &self.table_cache, &mut iter, &mut meta);
        let mut state = self.state.lock().unwrap();

        info!(
            "level-0 table #{}: {} bytes {}",
            meta.number,
            meta.file_size,
            match &result {
                Ok(()) => "ok".to_string(),
                Err(e) => e.to_string(),
            }
        );
        state.pending_outputs.remove(&meta.number);

        // Note that if file_size is zero, the file has been deleted and
        // should not be added to the manifest.
        let mut level = 0;
        if result.is_ok() && meta.file_size > 0 {
            level = base.pick_level_for_memtable_output(
                meta.smallest.user_key(),
                meta.largest.user_key(),
            );
            edit.add_file(
                level,
                meta.number,
                meta.file_size,
                meta.smallest.clone(),
                meta.largest.clone(),
            );
        }

        state.stats[level] += CompactionStats {
            micros: start.elapsed().as_micros() as u64,
            bytes_read: 0,
            bytes_written: meta.file_size,
        };
        (state, result)
    }

    fn do_compaction_work<'a>(
        &'a self,
        state: MutexGuard<'a, DbState>,
        mut c: Compaction,
    ) -> (MutexGuard<'a, DbState>, Result<()>) {
        let mut state = state;
        debug_assert!(state.versions.num_level_files(c.level()) > 0);
        let smallest_snapshot = state
            .snapshots
            .oldest()
            .unwrap_or_else(|| self.last_sequence.load(Ordering::Acquire));
        let mut input = state.versions.make_input_iterator(&c);

        // Release mutex while we're actually doing the compaction work
        drop(state);

        let ctx = DbCompactionContext { db: self };
        let mut compactor = Compactor::new(
            &self.dbname,
            &self.table_cache,
            &ctx,
            &mut c,
            smallest_snapshot,
        );
        let mut result = compactor.run(&mut input);
        let outputs = compactor.outputs().to_vec();
        let stats = compactor.stats();
        drop(compactor);
        drop(input);

        let mut state = self.state.lock().unwrap();
        state.stats[c.level() + 1] += stats;

        if result.is_ok() {
            result = self.install_compaction_results(&mut state, &mut c, &outputs);
        }
        for output in &outputs {
            state.pending_outputs.remove(&output.number);
        }
        info!("compacted to: {}", state.versions.level_summary());
        (state, result)
    }

    fn install_compaction_results(
        &self,
        state: &mut DbState,
        c: &mut Compaction,
        outputs: &[FileMetaData],
    ) -> Result<()> {
        info!(
            "compacted {}@{} + {}@{} files => {} bytes",
            c.num_input_files(0),
            c.level(),
            c.num_input_files(1),
            c.level() + 1,
            outputs.iter().map(|o| o.file_size).sum::<u64>()
        );

        // Add compaction outputs
        c.add_input_deletions();
        let level = c.level();
        for output in outputs {
            c.edit.add_file(
                level + 1,
                output.number,
                output.file_size,
                output.smallest.clone(),
                output.largest.clone(),
            );
        }
        let result = state.versions.log_and_apply(&mut c.edit);
        self.install_read_view(state);
        result
    }

    /// REQUIRES: this thread is currently at the front of the writer queue
    fn make_room_for_write<'a>(
        &'a self,
        mut state: MutexGuard<'a, DbState>,
        mut force: bool,
    ) -> (MutexGuard<'a, DbState>, Result<()>) {
        // Yield previous error
        let mut allow_delay = !force;
        loop {
            if let Some(e) = &state.bg_error {
                let e = e.clone();
                return (state, Err(e));
            } else if allow_delay && state.versions.num_level_files(0) >= L0_SLOWDOWN_WRITES_TRIGGER {
                // We are getting close to hitting a hard limit on the number of
                // L0 files. Rather than delaying a single write by several
                // seconds when we hit the hard limit, start delaying each
                // individual write by 1ms to reduce latency variance. Also,
                // this delay hands over some CPU to the compaction thread in
                // case it is sharing the same core as the writer.
                drop(state);
                thread::sleep(Duration::from_millis(1));
                // Do not delay a single write more than once
                allow_delay = false;
                state = self.state.lock().unwrap();
            } else if !force && state.mem.approximate_memory_usage() <= self.options.write_buffer_size {
                // There is room in current memtable
                break;
            } else if state.imm.is_some() {
                // We have filled up the current memtable, but the previous
                // one is still being compacted, so we wait.
                info!("current memtable full; waiting...");
                state = self.bg_cv.wait(state).unwrap();
            } else if state.versions.num_level_files(0) >= L0_STOP_WRITES_TRIGGER {
                // There are too many level-0 files.
                info!("too many L0 files; waiting...");
                state = self.bg_cv.wait(state).unwrap();
            } else {
                // Attempt to switch to a new memtable and trigger compaction of old
                let new_log_number = state.versions.new_file_number();
                let path = log_file_name(&self.dbname, new_log_number);
                let file = match FileSystem::create_writable_file(&path) {
                    Ok(file) => file,
                    Err(e) => {
                        // Avoid chewing through file number space in a tight loop.
                        state.versions.reuse_file_number(new_log_number);
                        return (state, Err(e));
                    }
                };
                *self.log.lock().unwrap() = wal::Writer::new(Box::new(file) as Box<dyn WritableFile>);
                state.logfile_number = new_log_number;
                let imm = std::mem::replace(
                    &mut state.mem,
                    Arc::new(MemTable::new(self.icmp.clone())),
                );
                debug!(
                    "memtable frozen: {} entries, {} bytes, new log #{}",
                    imm.len(),
                    imm.approximate_memory_usage(),
                    new_log_number
                );
                state.imm = Some(imm);
                self.has_imm.store(true, Ordering::Release);
                self.install_read_view(&state);
                // Do not force another compaction if have room
                force = false;
                self.maybe_schedule_compaction(&mut state);
            }
        }
        (state, Ok(()))
    }

    /// REQUIRES: writer list must be non-empty
    /// REQUIRES: first writer must have a non-empty batch
    fn build_batch_group(state: &DbState) -> Vec<Arc<Writer>> {
        let first = &state.writers[0];
        let mut size = first.batch.as_ref().map_or(0, |b| b.approximate_size());

        // Allow the group to grow up to a maximum size, but if the
        // original write is small, limit the growth so we do not slow
        // down the small write too much.
        let max_size = if size <= (128 << 10) {
            size + (128 << 10)
        } else {
            1 << 20
        };

        let mut group = vec![first.clone()];
        for w in state.writers.iter().skip(1) {
            if w.sync && !first.sync {
                // Do not include a sync write into a batch handled by a non-sync write.
                break;
            }
            let batch = match &w.batch {
                Some(batch) => batch,
                // Do not include a request to make room in the group
                None => break,
            };
            size += batch.approximate_size();
            if size > max_size {
                // Do not make batch too big
                break;
            }
            group.push(w.clone());
        }
        group
    }

    /// Apply the batches of `group` to `mem`, then append them to the log
    /// as one record that streams the values back from the memtable. On
    /// failure every insertion of the group is rolled back.
    fn write_group(
        &self,
        group: &[Arc<Writer>],
        first_sequence: SequenceNumber,
        mem: &MemTable,
        sync: bool,
    ) -> Result<u64> {
        let count: u32 = group
            .iter()
            .filter_map(|w| w.batch.as_ref())
            .map(|b| b.count())
            .sum();
        let mut header = [0u8; HEADER_SIZE];
        encode_fixed64(&mut header, first_sequence);
        encode_fixed32(&mut header[8..], count);

        let mut entries: Vec<MemEntry> = Vec::with_capacity(count as usize);
        let mut slices: Vec<&[u8]> = Vec::with_capacity(1 + 2 * count as usize);
        slices.push(&header);
        let mut sequence = first_sequence;
        for batch in group.iter().filter_map(|w| w.batch.as_ref()) {
            for record in batch.records() {
                let record = match record {
                    Ok(record) => record,
                    Err(e) => {
                        entries.iter().for_each(|e| e.rollback());
                        return Err(e);
                    }
                };
                let entry = mem.add(sequence, record.value_type, record.key, record.value);
                slices.push(record.head);
                if record.value_type == ValueType::Value {
                    slices.push(entry.value());
                }
                entries.push(entry);
                sequence += 1;
            }
        }

        let result = {
            let mut log = self.log.lock().unwrap();
            log.add_record_slices(&slices).and_then(|_| {
                if sync {
                    log.sync()
                } else {
                    Ok(())
                }
            })
        };
        if let Err(e) = result {
            entries.iter().for_each(|e| e.rollback());
            return Err(LsmKvError::LogWriter(e.to_string()));
        }
        Ok(count as u64)
    }

    fn write_impl(&self, options: &WriteOptions, batch: Option<WriteBatch>) -> Result<()> {
        let w = Arc::new(Writer {
            batch,
            sync: options.sync,
            result: Mutex::new(None),
        });

        let mut state = self.state.lock().unwrap();
        state.writers.push_back(w.clone());
        while !w.is_done() && !Arc::ptr_eq(&state.writers[0], &w) {
            state = self.writers_cv.wait(state).unwrap();
        }
        if let Some(result) = w.result.lock().unwrap().take() {
            return result;
        }

        // May temporarily unlock and wait.
        let (s, mut result) = self.make_room_for_write(state, w.batch.is_none());
        state = s;
        let mut group = vec![w.clone()];
        if result.is_ok() && w.batch.is_some() {
            group = Self::build_batch_group(&state);
            let last_sequence = self.last_sequence.load(Ordering::Acquire);
            let mem = state.mem.clone();
            let sync = w.sync;

            // Add to log and apply to memtable. We can release the lock
            // during this phase since `w` is currently responsible for
            // logging and protects against concurrent loggers and
            // concurrent writes into the memtable.
            drop(state);
            let written = self.write_group(&group, last_sequence + 1, &mem, sync);
            state = self.state.lock().unwrap();

            match written {
                Ok(count) => {
                    let last_sequence = last_sequence + count;
                    self.last_sequence.store(last_sequence, Ordering::Release);
                    state.versions.set_last_sequence(last_sequence);
                }
                Err(e) => {
                    // The state of the log file is indeterminate: the log
                    // record we just added may or may not show up when the
                    // DB is re-opened. So we force the DB into a mode where
                    // all future writes fail.
                    if let LsmKvError::LogWriter(_) = e {
                        self.record_background_error(&mut state, e.clone());
                    }
                    result = Err(e);
                }
            }
        }

        let last_writer = group.last().cloned().unwrap_or_else(|| w.clone());
        while let Some(ready) = state.writers.pop_front() {
            if !Arc::ptr_eq(&ready, &w) {
                *ready.result.lock().unwrap() = Some(result.clone());
            }
            if Arc::ptr_eq(&ready, &last_writer) {
                break;
            }
        }
        // Notify new head of write queue
        self.writers_cv.notify_all();
        result
    }

    pub(crate) fn write(&self, options: &WriteOptions, batch: WriteBatch) -> Result<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(LsmKvError::ShutDown);
        }
        self.write_impl(options, Some(batch))
    }

    /// Pin the current read view, then pick the sequence to read at. The
    /// view must be loaded first: every entry visible at the sequence is
    /// then reachable through the pinned memtables and version.
    fn read_view_at(&self, options: &ReadOptions) -> (Arc<ReadView>, SequenceNumber) {
        let view = self.read_view.load_full();
        let sequence = match &options.snapshot {
            Some(snapshot) => snapshot.sequence(),
            None => self.last_sequence.load(Ordering::Acquire),
        };
        (view, sequence)
    }

    pub(crate) fn get(&self, options: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (view, sequence) = self.read_view_at(options);

        // First look in the memtable, then in the immutable memtable (if any).
        let lkey = LookupKey::new(key, sequence);
        for mem in std::iter::once(&view.mem).chain(view.imm.iter()) {
            match mem.get(&lkey) {
                LookupResult::Value(value) => return Ok(Some(value)),
                LookupResult::Deleted => return Ok(None),
                LookupResult::NotFound => {}
            }
        }

        let mut stats = GetStats::default();
        let result = view.version.get(options, &lkey, &mut stats);
        if view.version.update_stats(&stats) {
            let mut state = self.state.lock().unwrap();
            self.maybe_schedule_compaction(&mut state);
        }
        result
    }

    pub(crate) fn iter(self: &Arc<Self>, options: &ReadOptions) -> DBIterator {
        let (view, sequence) = self.read_view_at(options);

        // Collect together all needed child iterators
        let mut list: Vec<BoxedIterator> = vec![Box::new(view.mem.iter())];
        if let Some(imm) = &view.imm {
            list.push(Box::new(imm.iter()));
        }
        view.version.add_iterators(options, &mut list);
        let internal = MergingIterator::new(Arc::new(self.icmp.clone()), list);
        let sampler = Arc::new(IterSampler {
            db: self.clone(),
            version: view.version.clone(),
        });
        DBIterator::new(
            self.icmp.user_comparator().clone(),
            Box::new(internal),
            sequence,
            sampler,
        )
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        let mut state = self.state.lock().unwrap();
        state
            .snapshots
            .create(self.last_sequence.load(Ordering::Acquire))
    }

    /// Force the current memtable contents to be compacted.
    pub(crate) fn compact_memtable(&self) -> Result<()> {
        // `None` batch means just wait for earlier writes to be done
        self.write_impl(&WriteOptions::default(), None)?;
        // Wait until the compaction completes
        let mut state = self.state.lock().unwrap();
        while state.imm.is_some() && state.bg_error.is_none() {
            state = self.bg_cv.wait(state).unwrap();
        }
        match &state.bg_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    pub(crate) fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        let mut max_level_with_files = 1;
        {
            let state = self.state.lock().unwrap();
            let base = state.versions.current();
            for level in 1..NUM_LEVELS {
                if base.overlap_in_level(level, begin, end) {
                    max_level_with_files = level;
                }
            }
        }
        self.compact_memtable()?;
        for level in 0..max_level_with_files {
            self.compact_level(level, begin, end)?;
        }
        Ok(())
    }

    /// Compact any files in the named level that overlap `[begin, end]`.
    pub(crate) fn compact_level(&self, level: usize, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        debug_assert!(level + 1 < NUM_LEVELS);

        let begin = begin.map(|k| InternalKey::new(k, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK));
        let end = end.map(|k| InternalKey::new(k, 0, ValueType::Deletion));

        let mut state = self.state.lock().unwrap();
        let id = state.next_manual_id;
        state.next_manual_id += 1;
        let mut manual = Some(ManualCompaction {
            id,
            level,
            done: false,
            begin,
            end,
        });
        loop {
            if self.shutting_down.load(Ordering::Acquire) || state.bg_error.is_some() {
                break;
            }
            match &state.manual_compaction {
                Some(m) if m.id == id => {
                    if m.done {
                        break;
                    }
                    // Running my compaction
                    state = self.bg_cv.wait(state).unwrap();
                }
                // Running another manual compaction
                Some(_) => state = self.bg_cv.wait(state).unwrap(),
                None => match manual.take() {
                    Some(m) => {
                        // Idle
                        state.manual_compaction = Some(m);
                        self.maybe_schedule_compaction(&mut state);
                    }
                    None => break,
                },
            }
        }
        if matches!(&state.manual_compaction, Some(m) if m.id == id) {
            state.manual_compaction = None;
            // Let waiting manual compactions proceed
            self.bg_cv.notify_all();
        }
        match &state.bg_error {
            Some(e) => Err(e.clone()),
            None if self.shutting_down.load(Ordering::Acquire) => Err(LsmKvError::ShutDown),
            None => Ok(()),
        }
    }

    pub(crate) fn get_statistics(&self) -> Statistics {
        let state = self.state.lock().unwrap();
        let mut statistics = Statistics::default();
        for (level, stats) in statistics.levels.iter_mut().enumerate() {
            stats.files = state.versions.num_level_files(level);
            stats.bytes = state.versions.num_level_bytes(level);
            stats.compaction = state.stats[level];
        }
        statistics.memtable_bytes = state.mem.approximate_memory_usage()
            + state.imm.as_ref().map_or(0, |imm| imm.approximate_memory_usage());
        statistics
    }

    pub(crate) fn get_property(&self, property: &str) -> Option<String> {
        let property = property.strip_prefix("lsmkv.")?;
        if let Some(level) = property.strip_prefix("num-files-at-level") {
            let level: usize = level.parse().ok()?;
            if level >= NUM_LEVELS {
                return None;
            }
            let state = self.state.lock().unwrap();
            return Some(state.versions.num_level_files(level).to_string());
        }
        match property {
            "stats" => Some(self.get_statistics().to_table()),
            "sstables" => {
                let state = self.state.lock().unwrap();
                Some(state.versions.current().debug_string())
            }
            "approximate-memory-usage" => {
                let mut total = self.get_statistics().memtable_bytes;
                if let Some(cache) = &self.block_cache {
                    total += cache.total_charge();
                }
                Some(total.to_string())
            }
            _ => None,
        }
    }

    pub(crate) fn get_approximate_sizes(&self, ranges: &[(&[u8], &[u8])]) -> Vec<u64> {
        let state = self.state.lock().unwrap();
        let v = state.versions.current();
        ranges
            .iter()
            .map(|(start, limit)| {
                // Convert user keys into corresponding internal keys.
                let k1 = InternalKey::new(start, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
                let k2 = InternalKey::new(limit, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
                let start = state.versions.approximate_offset_of(&v, &k1);
                let limit = state.versions.approximate_offset_of(&v, &k2);
                limit.saturating_sub(start)
            })
            .collect()
    }

    fn record_read_sample(&self, version: &Version, internal_key: &[u8]) {
        if version.record_read_sample(internal_key) {
            let mut state = self.state.lock().unwrap();
            self.maybe_schedule_compaction(&mut state);
        }
    }

    #[cfg(test)]
    fn replace_log_writer(&self, dest: Box<dyn WritableFile>) {
        *self.log.lock().unwrap() = wal::Writer::new(dest);
    }
}

/// Remove every engine file under `path`, then the directory if empty.
pub(crate) fn destroy_db(path: &Path) -> Result<()> {
    let filenames = match FileSystem::children(path) {
        Ok(filenames) => filenames,
        // Ignore error in case directory does not exist
        Err(_) => return Ok(()),
    };

    let lock_name = lock_file_name(path);
    let lock = FileLock::lock(&lock_name)?;
    let mut result = Ok(());
    for filename in filenames {
        match parse_file_name(&filename) {
            Some((_, FileType::DBLock)) | None => {}
            Some(_) => {
                if let Err(e) = std::fs::remove_file(path.join(&filename)) {
                    if result.is_ok() {
                        result = Err(e.into());
                    }
                }
            }
        }
    }
    drop(lock);
    // Ignore error since state is already gone
    let _ = std::fs::remove_file(&lock_name);
    let _ = std::fs::remove_dir(path);
    result
}

struct DbCompactionContext<'a> {
    db: &'a DBImpl,
}

impl CompactionContext for DbCompactionContext<'_> {
    fn new_output_file_number(&self) -> u64 {
        let mut state = self.db.state.lock().unwrap();
        let number = state.versions.new_file_number();
        state.pending_outputs.insert(number);
        number
    }

    fn is_shutting_down(&self) -> bool {
        self.db.shutting_down.load(Ordering::Acquire)
    }

    fn compact_pending_memtable(&self) {
        if !self.db.has_imm.load(Ordering::Acquire) {
            return;
        }
        let state = self.db.state.lock().unwrap();
        if state.imm.is_some() {
            let (mut state, result) = self.db.compact_imm_memtable(state);
            if let Err(e) = result {
                if let LsmKvError::ManifestFile(_) = e {
                    self.db.record_background_error(&mut state, e);
                } else {
                    warn!("memtable compaction failed: {}", e);
                }
            }
            // Wake up make_room_for_write() if necessary.
            self.db.bg_cv.notify_all();
        }
    }
}

/// Charges sampled reads of an iterator to the version it reads from.
struct IterSampler {
    db: Arc<DBImpl>,
    version: Arc<Version>,
}

impl ReadSampler for IterSampler {
    fn record_read_sample(&self, internal_key: &[u8]) {
        self.db.record_read_sample(&self.version, internal_key);
    }
}

/// Replays one log file into memtables during recovery.
struct LogReplay<'a> {
    path: &'a Path,
    options: &'a Options,
    icmp: &'a InternalKeyComparator,
    table_cache: &'a TableCache,
    versions: &'a mut VersionSet,
    edit: &'a mut VersionEdit,
    save_manifest: &'a mut bool,
    max_sequence: &'a mut SequenceNumber,
}

impl LogReplay<'_> {
    fn recover_log_file(
        &mut self,
        log_number: u64,
        last_log: bool,
    ) -> Result<Option<(Arc<MemTable>, LogWriter, u64)>> {
        // Open the log file
        let path = log_file_name(self.path, log_number);
        let file = FileSystem::open_sequential_file(&path)?;

        // We intentionally make the log reader do checksumming even if
        // paranoid_checks is false so that corruptions cause entire
        // commits to be skipped instead of propagating bad information
        // (like overly large sequence numbers).
        let mut reader = wal::Reader::new(file, wal::LogReporter::new(log_number), true);
        info!("recovering log #{}", log_number);

        // Read all the records and add to a memtable
        let mut batch = WriteBatch::new();
        let mut mem: Option<Arc<MemTable>> = None;
        let mut compactions = 0;
        while let Some(record) = reader.read_record() {
            let applied = batch.set_contents(&record).and_then(|_| {
                let mem = mem.get_or_insert_with(|| Arc::new(MemTable::new(self.icmp.clone())));
                batch.insert_into(mem)
            });
            if let Err(e) = applied {
                if self.options.paranoid_checks {
                    return Err(e);
                }
                warn!("log #{}: ignoring error {}", log_number, e);
                continue;
            }

            let last_sequence = (batch.sequence() + batch.count() as u64).saturating_sub(1);
            if last_sequence > *self.max_sequence {
                *self.max_sequence = last_sequence;
            }

            if let Some(full) = mem.as_ref() {
                if full.approximate_memory_usage() > self.options.write_buffer_size {
                    compactions += 1;
                    *self.save_manifest = true;
                    self.write_level0_table(full)?;
                    mem = None;
                }
            }
        }

        if let Some(e) = reader.into_reporter().error {
            if self.options.paranoid_checks {
                return Err(e);
            }
            warn!("log #{}: ignoring error {}", log_number, e);
        }

        // See if we should keep reusing the last log file.
        if self.options.reuse_logs && last_log && compactions == 0 {
            match FileSystem::create_appendable_file(&path) {
                Ok(file) => {
                    info!("reusing old log {}", path.display());
                    let size = file.pos();
                    let log: LogWriter =
                        wal::Writer::with_offset(Box::new(file) as Box<dyn WritableFile>, size);
                    let mem = mem.unwrap_or_else(|| Arc::new(MemTable::new(self.icmp.clone())));
                    return Ok(Some((mem, log, log_number)));
                }
                Err(e) => warn!("cannot reuse log {}: {}", path.display(), e),
            }
        }

        if let Some(mem) = mem {
            // mem did not get reused; compact it.
            *self.save_manifest = true;
            self.write_level0_table(&mem)?;
        }
        Ok(None)
    }

    fn write_level0_table(&mut self, mem: &Arc<MemTable>) -> Result<()> {
        let mut meta = FileMetaData::new(
            self.versions.new_file_number(),
            0,
            InternalKey::default(),
            InternalKey::default(),
        );
        info!("level-0 table #{}: started", meta.number);
        let mut iter = mem.iter();
        build_table(self.path, self.table_cache, &mut iter, &mut meta)?;
        info!("level-0 table #{}: {} bytes", meta.number, meta.file_size);
        if meta.file_size > 0 {
            self.edit.add_file(
                0,
                meta.number,
                meta.file_size,
                meta.smallest.clone(),
                meta.largest.clone(),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::db::db_impl::{destroy_db, DBImpl};
    use crate::db::options::{Options, ReadOptions, WriteOptions};
    use crate::db::write_batch::WriteBatch;
    use crate::env::file_system::WritableFile;
    use crate::error::LsmKvError;
    use crate::iterator::KvIterator;
    use std::io::Write;
    use std::sync::Arc;

    struct FailingFile;

    impl Write for FailingFile {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl WritableFile for FailingFile {
        fn sync(&mut self) -> crate::Result<()> {
            Ok(())
        }
    }

    fn put(db: &DBImpl, key: &str, value: &str) -> crate::Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key.as_bytes(), value.as_bytes());
        db.write(&WriteOptions::default(), batch)
    }

    fn get(db: &DBImpl, key: &str) -> Option<Vec<u8>> {
        db.get(&ReadOptions::default(), key.as_bytes()).unwrap()
    }

    #[test]
    fn test_failed_log_write_rolls_back_group() {
        let _ = env_logger::try_init();
        let temp_dir = tempfile::TempDir::new().unwrap();
        let (db, handle) = DBImpl::open(temp_dir.path(), &Options::default()).unwrap();

        put(&db, "k1", "v1").unwrap();
        db.replace_log_writer(Box::new(FailingFile));

        let mut batch = WriteBatch::new();
        batch.put(b"k1", b"v2");
        batch.put(b"k2", b"v2");
        batch.delete(b"k1");
        match db.write(&WriteOptions::default(), batch) {
            Err(LsmKvError::LogWriter(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }

        // nothing of the failed batch is visible
        assert_eq!(get(&db, "k1"), Some(b"v1".to_vec()));
        assert_eq!(get(&db, "k2"), None);
        let mut iter = db.iter(&ReadOptions::default());
        iter.seek_to_first();
        assert_eq!(iter.key(), b"k1");
        assert_eq!(iter.value(), b"v1");
        iter.next();
        assert!(!iter.valid());
        drop(iter);

        // the error is sticky
        assert!(matches!(put(&db, "k3", "v3"), Err(LsmKvError::LogWriter(_))));

        db.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn test_open_twice_fails_on_lock() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let (db, handle) = DBImpl::open(temp_dir.path(), &Options::default()).unwrap();
        assert!(DBImpl::open(temp_dir.path(), &Options::default()).is_err());
        db.shutdown();
        handle.join().unwrap();
        drop(db);
        // the lock is released once the last handle is gone
        let (db, handle) = DBImpl::open(temp_dir.path(), &Options::default()).unwrap();
        db.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn test_destroy() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("db");
        {
            let (db, handle) = DBImpl::open(&path, &Options::default()).unwrap();
            put(&db, "k", "v").unwrap();
            db.compact_memtable().unwrap();
            db.shutdown();
            handle.join().unwrap();
            assert!(Arc::strong_count(&db) == 1);
        }
        destroy_db(&path).unwrap();
        assert!(!path.exists());

        // destroying a missing database is not an error
        destroy_db(&path).unwrap();
    }
}
