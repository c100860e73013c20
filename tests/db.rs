use lsmkv::{
    BloomFilterPolicy, CaseInsensitiveComparator, KvIterator, LsmKvError, Options, ReadOptions,
    WriteBatch, WriteOptions, DB,
};
use rand::Rng;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};

fn open(path: &Path) -> DB {
    DB::open(path, Options::default()).unwrap()
}

fn small_buffer_options() -> Options {
    Options {
        write_buffer_size: 64 << 10,
        ..Options::default()
    }
}

fn files_at_level(db: &DB, level: usize) -> usize {
    db.get_property(&format!("lsmkv.num-files-at-level{}", level))
        .unwrap()
        .parse()
        .unwrap()
}

fn put(db: &DB, key: &str, value: &str) {
    db.put(&WriteOptions::default(), key.as_bytes(), value.as_bytes())
        .unwrap();
}

fn get(db: &DB, key: &str) -> Option<String> {
    db.get(key.as_bytes())
        .unwrap()
        .map(|v| String::from_utf8(v).unwrap())
}

#[test]
fn test_read_your_writes() {
    let _ = env_logger::try_init();
    let temp_dir = tempfile::TempDir::new().unwrap();
    let db = open(temp_dir.path());

    assert_eq!(get(&db, "foo"), None);
    put(&db, "foo", "v1");
    assert_eq!(get(&db, "foo").as_deref(), Some("v1"));
    put(&db, "foo", "v2");
    assert_eq!(get(&db, "foo").as_deref(), Some("v2"));
    db.delete(&WriteOptions::default(), b"foo").unwrap();
    assert_eq!(get(&db, "foo"), None);
    // deleting a missing key is not an error
    db.delete(&WriteOptions::default(), b"missing").unwrap();

    let mut batch = WriteBatch::new();
    batch.put(b"a", b"1");
    batch.put(b"b", b"2");
    batch.delete(b"a");
    db.write(&WriteOptions { sync: true }, batch).unwrap();
    assert_eq!(get(&db, "a"), None);
    assert_eq!(get(&db, "b").as_deref(), Some("2"));
}

#[test]
fn test_recovery() {
    let _ = env_logger::try_init();
    let temp_dir = tempfile::TempDir::new().unwrap();
    let path = temp_dir.path();

    for round in 0..3 {
        let db = DB::open(path, small_buffer_options()).unwrap();
        if round > 0 {
            for i in 0..2000 {
                let expected = if i % 3 == 0 {
                    None
                } else {
                    Some(format!("value{}_{}", i, round - 1))
                };
                assert_eq!(get(&db, &format!("key{:05}", i)), expected, "key{}", i);
            }
        }
        for i in 0..2000 {
            put(&db, &format!("key{:05}", i), &format!("value{}_{}", i, round));
        }
        for i in (0..2000).step_by(3) {
            db.delete(&WriteOptions::default(), format!("key{:05}", i).as_bytes())
                .unwrap();
        }
    }

    let db = open(path);
    let mut iter = db.iter(&ReadOptions::default());
    iter.seek_to_first();
    let mut count = 0;
    while iter.valid() {
        count += 1;
        iter.next();
    }
    assert!(iter.status().is_ok());
    assert_eq!(count, 2000 - (2000 + 2) / 3);
}

#[test]
fn test_error_if_exists_and_missing() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let path = temp_dir.path().join("db");

    std::fs::create_dir_all(&path).unwrap();
    let options = Options {
        create_if_missing: false,
        ..Options::default()
    };
    assert!(matches!(
        DB::open(&path, options),
        Err(LsmKvError::InvalidArgument(_))
    ));

    drop(open(&path));
    let options = Options {
        error_if_exists: true,
        ..Options::default()
    };
    assert!(matches!(
        DB::open(&path, options),
        Err(LsmKvError::InvalidArgument(_))
    ));
}

#[test]
fn test_memtable_output_placement_and_compact_range() {
    let _ = env_logger::try_init();
    let temp_dir = tempfile::TempDir::new().unwrap();
    let db = open(temp_dir.path());

    // nothing overlaps, so the flush is pushed down to level 2
    put(&db, "p", "begin");
    put(&db, "q", "end");
    db.compact_memtable().unwrap();
    assert_eq!(files_at_level(&db, 0), 0);
    assert_eq!(files_at_level(&db, 2), 1);

    for round in 0..3 {
        put(&db, "p", &format!("begin{}", round));
        put(&db, "q", &format!("end{}", round));
        db.compact_memtable().unwrap();
    }
    assert_eq!(db.get_statistics().total_files(), 4);

    db.compact_range(None, None).unwrap();
    assert_eq!(files_at_level(&db, 0), 0);
    assert_eq!(files_at_level(&db, 1), 0);
    assert_eq!(files_at_level(&db, 2), 1);
    assert_eq!(get(&db, "p").as_deref(), Some("begin2"));
    assert_eq!(get(&db, "q").as_deref(), Some("end2"));
}

#[test]
fn test_snapshot_isolation() {
    let _ = env_logger::try_init();
    let temp_dir = tempfile::TempDir::new().unwrap();
    let db = open(temp_dir.path());

    put(&db, "key1", "test1");
    let snapshot = db.snapshot();
    put(&db, "key1", "test2");
    db.delete(&WriteOptions::default(), b"key1").unwrap();
    put(&db, "key1", "test3");

    let read_options = ReadOptions {
        snapshot: Some(snapshot.clone()),
        ..ReadOptions::default()
    };
    assert_eq!(db.read(&read_options, b"key1").unwrap(), Some(b"test1".to_vec()));
    assert_eq!(get(&db, "key1").as_deref(), Some("test3"));

    // the older entries survive flushing and compaction while the snapshot lives
    db.compact_memtable().unwrap();
    db.compact_range(None, None).unwrap();
    assert_eq!(db.read(&read_options, b"key1").unwrap(), Some(b"test1".to_vec()));
    assert_eq!(get(&db, "key1").as_deref(), Some("test3"));

    let mut iter = db.iter(&read_options);
    iter.seek_to_first();
    assert!(iter.valid());
    assert_eq!(iter.key(), b"key1");
    assert_eq!(iter.value(), b"test1");
    drop(iter);

    drop(read_options);
    db.release_snapshot(snapshot);
    db.compact_range(None, None).unwrap();
    assert_eq!(get(&db, "key1").as_deref(), Some("test3"));
}

#[test]
fn test_iterator_seek_then_prev() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let db = open(temp_dir.path());
    put(&db, "A", "a");
    put(&db, "B", "b");
    put(&db, "D", "d");

    let mut iter = db.iter(&ReadOptions::default());
    iter.seek(b"C");
    assert!(iter.valid());
    assert_eq!(iter.key(), b"D");
    iter.prev();
    assert!(iter.valid());
    assert_eq!(iter.key(), b"B");
    assert_eq!(iter.value(), b"b");

    iter.seek_to_last();
    assert_eq!(iter.key(), b"D");
    iter.next();
    assert!(!iter.valid());
}

#[test]
fn test_second_open_fails_on_lock() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let db = open(temp_dir.path());
    assert!(DB::open(temp_dir.path(), Options::default()).is_err());
    db.close();
    drop(open(temp_dir.path()));
}

fn corrupt_newest_log(path: &Path) {
    let mut logs: Vec<_> = std::fs::read_dir(path)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|p| p.extension().map_or(false, |ext| ext == "log"))
        .collect();
    logs.sort();
    let log = logs.last().unwrap();
    let mut contents = std::fs::read(log).unwrap();
    // a payload byte of the first record
    contents[10] ^= 0xff;
    std::fs::write(log, contents).unwrap();
}

#[test]
fn test_log_corruption() {
    let _ = env_logger::try_init();
    let temp_dir = tempfile::TempDir::new().unwrap();
    let path = temp_dir.path();
    {
        let db = open(path);
        for i in 0..10 {
            put(&db, &format!("k{}", i), "v");
        }
    }
    corrupt_newest_log(path);

    match DB::open(path, Options::default()) {
        Err(e) => assert!(e.is_corruption(), "{}", e),
        Ok(_) => panic!("corrupted log must fail a paranoid open"),
    }

    let options = Options {
        paranoid_checks: false,
        ..Options::default()
    };
    let db = DB::open(path, options).unwrap();
    // the damaged block is skipped
    assert_eq!(get(&db, "k0"), None);
    put(&db, "k0", "again");
    assert_eq!(get(&db, "k0").as_deref(), Some("again"));
}

#[test]
fn test_concurrent_writers() {
    let _ = env_logger::try_init();
    const THREADS: usize = 4;
    const KEYS: usize = 1000;

    let temp_dir = tempfile::TempDir::new().unwrap();
    let db = Arc::new(DB::open(temp_dir.path(), small_buffer_options()).unwrap());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let db = db.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                for i in 0..KEYS {
                    let value = format!("{}_{}_{}", t, i, "x".repeat(100));
                    db.put(
                        &WriteOptions { sync: i % 100 == 0 },
                        format!("t{}_{:04}", t, i).as_bytes(),
                        value.as_bytes(),
                    )
                    .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for t in 0..THREADS {
        for i in 0..KEYS {
            let value = get(&db, &format!("t{}_{:04}", t, i)).unwrap();
            assert!(value.starts_with(&format!("{}_{}_", t, i)));
        }
    }
    assert!(db.get_statistics().total_files() > 0);
}

#[test]
fn test_destroy() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let path = temp_dir.path().join("db");
    {
        let db = open(&path);
        put(&db, "k", "v");
        db.compact_memtable().unwrap();
    }
    DB::destroy(&path).unwrap();
    assert!(!path.exists());

    let db = open(&path);
    assert_eq!(get(&db, "k"), None);
}

#[test]
fn test_properties_and_approximate_sizes() {
    let _ = env_logger::try_init();
    let temp_dir = tempfile::TempDir::new().unwrap();
    let db = open(temp_dir.path());
    let mut rng = rand::thread_rng();

    for i in 0..100 {
        let value: Vec<u8> = (0..10000).map(|_| rng.gen()).collect();
        db.put(&WriteOptions::default(), format!("k{:03}", i).as_bytes(), &value)
            .unwrap();
    }
    let memory: usize = db
        .get_property("lsmkv.approximate-memory-usage")
        .unwrap()
        .parse()
        .unwrap();
    assert!(memory > 1_000_000);

    db.compact_memtable().unwrap();
    let sizes = db.get_approximate_sizes(&[
        (&b"k000"[..], &b"k050"[..]),
        (&b"k000"[..], &b"k100"[..]),
        (&b"z1"[..], &b"z2"[..]),
    ]);
    assert!(sizes[0] > 400_000 && sizes[0] < 600_000, "{:?}", sizes);
    assert!(sizes[1] > 900_000 && sizes[1] < 1_100_000, "{:?}", sizes);
    assert_eq!(sizes[2], 0);

    let stats = db.get_property("lsmkv.stats").unwrap();
    assert!(stats.contains("Level"));
    assert!(db.get_property("lsmkv.sstables").unwrap().contains("level"));
    assert!(db.get_property("lsmkv.num-files-at-level9").is_none());
    assert!(db.get_property("lsmkv.unknown").is_none());
    assert_eq!(db.get_statistics().total_files(), 1);
}

fn count_entries(db: &DB) -> usize {
    let mut iter = db.iter(&ReadOptions::default());
    iter.seek_to_first();
    let mut count = 0;
    while iter.valid() {
        count += 1;
        iter.next();
    }
    assert!(iter.status().is_ok());
    count
}

#[test]
fn test_bloom_filter_reads_from_tables() {
    let _ = env_logger::try_init();
    let temp_dir = tempfile::TempDir::new().unwrap();
    let options = Options {
        filter_policy: Some(Arc::new(BloomFilterPolicy::new(10))),
        ..small_buffer_options()
    };
    let db = DB::open(temp_dir.path(), options).unwrap();

    for i in 0..500 {
        put(&db, &format!("key{:04}", i), &format!("v{}", i));
    }
    db.compact_memtable().unwrap();
    for i in 0..500 {
        assert_eq!(get(&db, &format!("key{:04}", i)), Some(format!("v{}", i)));
        assert_eq!(get(&db, &format!("missing{:04}", i)), None);
    }
    assert_eq!(count_entries(&db), 500);

    for i in (0..500).step_by(2) {
        put(&db, &format!("key{:04}", i), &format!("w{}", i));
    }
    db.compact_memtable().unwrap();
    db.compact_range(None, None).unwrap();
    assert_eq!(files_at_level(&db, 0), 0);
    for i in 0..500 {
        let expected = if i % 2 == 0 {
            format!("w{}", i)
        } else {
            format!("v{}", i)
        };
        assert_eq!(get(&db, &format!("key{:04}", i)), Some(expected));
    }
    assert_eq!(count_entries(&db), 500);
}

#[test]
fn test_case_insensitive_keys_across_levels() {
    let _ = env_logger::try_init();
    let temp_dir = tempfile::TempDir::new().unwrap();
    let options = Options {
        comparator: Arc::new(CaseInsensitiveComparator),
        filter_policy: Some(Arc::new(BloomFilterPolicy::new(10))),
        ..Options::default()
    };
    let db = DB::open(temp_dir.path(), options).unwrap();

    put(&db, "Foo", "v1");
    assert_eq!(get(&db, "foo").as_deref(), Some("v1"));
    db.compact_memtable().unwrap();
    for variant in ["foo", "FOO", "Foo", "fOo"] {
        assert_eq!(get(&db, variant).as_deref(), Some("v1"), "{}", variant);
    }

    put(&db, "fOO", "v2");
    db.compact_memtable().unwrap();
    assert_eq!(get(&db, "Foo").as_deref(), Some("v2"));

    // overlaps the files below, so this flush stays in level 0
    put(&db, "foo", "v3");
    db.compact_memtable().unwrap();
    assert_eq!(files_at_level(&db, 0), 1);
    assert_eq!(db.get_statistics().total_files(), 3);
    assert_eq!(get(&db, "FOO").as_deref(), Some("v3"));

    put(&db, "BAR", "b");
    db.compact_range(None, None).unwrap();
    assert_eq!(files_at_level(&db, 0), 0);
    assert_eq!(get(&db, "fOo").as_deref(), Some("v3"));
    assert_eq!(get(&db, "bar").as_deref(), Some("b"));

    db.delete(&WriteOptions::default(), b"FoO").unwrap();
    assert_eq!(get(&db, "foo"), None);

    let mut iter = db.iter(&ReadOptions::default());
    iter.seek(b"bAR");
    assert!(iter.valid());
    assert_eq!(iter.key(), b"BAR");
    iter.next();
    assert!(!iter.valid());
}

#[test]
fn test_reads_during_flush_and_compaction() {
    let _ = env_logger::try_init();
    const KEYS: usize = 100;
    let temp_dir = tempfile::TempDir::new().unwrap();
    let db = Arc::new(DB::open(temp_dir.path(), small_buffer_options()).unwrap());
    let value = "x".repeat(1000);
    for i in 0..KEYS {
        put(&db, &format!("k{:03}", i), &value);
    }

    let stop = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..2)
        .map(|_| {
            let db = db.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    for i in 0..KEYS {
                        assert!(get(&db, &format!("k{:03}", i)).is_some(), "k{:03}", i);
                    }
                    assert_eq!(count_entries(&db), KEYS);
                }
            })
        })
        .collect();

    for round in 0..20 {
        for i in 0..KEYS {
            put(&db, &format!("k{:03}", i), &format!("{}{}", round, value));
        }
        if round % 5 == 4 {
            db.compact_range(None, None).unwrap();
        }
    }
    stop.store(true, Ordering::Release);
    for reader in readers {
        reader.join().unwrap();
    }
    assert!(get(&db, "k000").unwrap().starts_with("19"));
}
