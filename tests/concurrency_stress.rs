//! Concurrent readers/writers stress tests

use nestar_rs::{Access, FsBuilder, FsConfig, FsManager, SyncOptions};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

fn p(dir: &TempDir, rel: &str) -> String {
    dir.path().join(rel).display().to_string()
}

fn fs(parallel: bool) -> Arc<FsManager> {
    let mut config = FsConfig::default();
    config.sync.parallel = parallel;
    Arc::new(FsBuilder::new().config(config).build().unwrap())
}

#[test]
fn test_8_concurrent_readers_4_writers_one_archive() {
    let dir = Arc::new(TempDir::new().unwrap());
    let fs = fs(false);

    // Pre-populate
    for i in 0..50 {
        fs.write(p(&dir, &format!("a.sar/file{}.txt", i)), format!("data{}", i).as_bytes())
            .unwrap();
    }
    fs.sync(SyncOptions::SYNC).unwrap();

    let handles: Vec<_> = (0..12)
        .map(|thread_id| {
            let fs = Arc::clone(&fs);
            let dir = Arc::clone(&dir);
            std::thread::spawn(move || {
                if thread_id < 4 {
                    for i in 0..25 {
                        let name = format!("a.sar/writer{}/{}.txt", thread_id, i);
                        fs.write(p(&dir, &name), name.as_bytes()).unwrap();
                    }
                } else {
                    for _ in 0..200 {
                        let idx = rand::random::<usize>() % 50;
                        let data = fs.read(p(&dir, &format!("a.sar/file{}.txt", idx))).unwrap();
                        assert_eq!(data, format!("data{}", idx).as_bytes());
                    }
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    fs.umount().unwrap();

    // Verify integrity
    assert_eq!(fs.list(p(&dir, "a.sar")).unwrap().len(), 50 + 4);
    for t in 0..4 {
        let writer = format!("a.sar/writer{}", t);
        assert_eq!(fs.list(p(&dir, &writer)).unwrap().len(), 25);
        let name = format!("{}/7.txt", writer);
        assert_eq!(fs.read(p(&dir, &name)).unwrap(), name.as_bytes());
    }
}

#[test]
fn test_sync_races_with_writers() {
    let dir = Arc::new(TempDir::new().unwrap());
    let fs = fs(false);
    let done = Arc::new(AtomicBool::new(false));
    let synced = Arc::new(AtomicUsize::new(0));

    let syncer = {
        let fs = Arc::clone(&fs);
        let done = Arc::clone(&done);
        let synced = Arc::clone(&synced);
        std::thread::spawn(move || {
            while !done.load(Ordering::SeqCst) {
                // Busy mounts are expected while streams are open
                if fs.sync(SyncOptions::SYNC).is_ok() {
                    synced.fetch_add(1, Ordering::SeqCst);
                }
                std::thread::yield_now();
            }
        })
    };

    let writers: Vec<_> = (0..4)
        .map(|thread_id| {
            let fs = Arc::clone(&fs);
            let dir = Arc::clone(&dir);
            std::thread::spawn(move || {
                for i in 0..50 {
                    let name = format!("s.sar/t{}_{}", thread_id, i);
                    fs.write(p(&dir, &name), &vec![thread_id as u8; 100 + i]).unwrap();
                }
            })
        })
        .collect();
    for h in writers {
        h.join().unwrap();
    }
    done.store(true, Ordering::SeqCst);
    syncer.join().unwrap();
    fs.umount().unwrap();

    assert_eq!(fs.list(p(&dir, "s.sar")).unwrap().len(), 200);
    for t in 0..4u8 {
        for i in [0usize, 25, 49] {
            let data = fs.read(p(&dir, &format!("s.sar/t{}_{}", t, i))).unwrap();
            assert_eq!(data, vec![t; 100 + i]);
        }
    }
}

#[test]
fn test_many_archives_parallel_umount() {
    let dir = Arc::new(TempDir::new().unwrap());
    let fs = fs(true);

    let handles: Vec<_> = (0..6)
        .map(|thread_id| {
            let fs = Arc::clone(&fs);
            let dir = Arc::clone(&dir);
            std::thread::spawn(move || {
                for i in 0..20 {
                    let name = format!("arc{}.sar/inner.sar/{}.bin", thread_id, i);
                    fs.write(p(&dir, &name), &vec![i as u8; 1024]).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(fs.mounts().len(), 12);

    fs.sync(SyncOptions::UMOUNT).unwrap();
    assert!(fs.mounts().is_empty());
    assert_eq!(fs.pool().stats().active, 0);

    for t in 0..6 {
        let inner = format!("arc{}.sar/inner.sar", t);
        assert_eq!(fs.list(p(&dir, &inner)).unwrap().len(), 20);
        assert_eq!(
            fs.read(p(&dir, &format!("{}/19.bin", inner))).unwrap(),
            vec![19u8; 1024]
        );
    }
}

#[test]
fn test_unlink_and_set_time_race_with_sync() {
    let dir = Arc::new(TempDir::new().unwrap());
    let fs = fs(false);
    for i in 0..60 {
        fs.write(p(&dir, &format!("m.sar/f{}", i)), format!("data{}", i).as_bytes())
            .unwrap();
    }
    fs.sync(SyncOptions::SYNC).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let syncer = {
        let fs = Arc::clone(&fs);
        let done = Arc::clone(&done);
        std::thread::spawn(move || {
            while !done.load(Ordering::SeqCst) {
                fs.sync(SyncOptions::SYNC).unwrap();
                std::thread::yield_now();
            }
        })
    };

    let deleter = {
        let fs = Arc::clone(&fs);
        let dir = Arc::clone(&dir);
        std::thread::spawn(move || {
            for i in (0..60).step_by(2) {
                fs.delete(p(&dir, &format!("m.sar/f{}", i))).unwrap();
            }
        })
    };
    let toucher = {
        let fs = Arc::clone(&fs);
        let dir = Arc::clone(&dir);
        std::thread::spawn(move || {
            for i in (1..60).step_by(2) {
                fs.set_time(p(&dir, &format!("m.sar/f{}", i)), Access::WRITE, 1_000 + i)
                    .unwrap();
            }
        })
    };
    deleter.join().unwrap();
    toucher.join().unwrap();
    done.store(true, Ordering::SeqCst);
    syncer.join().unwrap();
    fs.umount().unwrap();

    let mut names = fs.list(p(&dir, "m.sar")).unwrap();
    names.sort();
    let mut expected: Vec<String> = (1..60).step_by(2).map(|i| format!("f{}", i)).collect();
    expected.sort();
    assert_eq!(names, expected);
    for i in (1..60).step_by(2) {
        let path = p(&dir, &format!("m.sar/f{}", i));
        assert_eq!(fs.stat(&path).unwrap().time(Access::WRITE), Some(1_000 + i));
        assert_eq!(fs.read(&path).unwrap(), format!("data{}", i).as_bytes());
    }
}
