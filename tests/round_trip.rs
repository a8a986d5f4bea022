//! Write, sync, remount and read back through host-level archives

use nestar_rs::{Access, FsBuilder, FsError, FsManager, SyncOptions};
use tempfile::TempDir;

fn fs() -> FsManager {
    FsBuilder::new().build().unwrap()
}

fn p(dir: &TempDir, rel: &str) -> String {
    dir.path().join(rel).display().to_string()
}

#[test]
fn test_files_survive_remount() {
    let dir = TempDir::new().unwrap();
    {
        let fs = fs();
        fs.write(p(&dir, "a.sar/readme.txt"), b"hello").unwrap();
        fs.write(p(&dir, "a.sar/docs/guide/intro.md"), b"# Intro").unwrap();
        fs.write(p(&dir, "a.sar/big.bin"), &vec![7u8; 200_000]).unwrap();
        fs.umount().unwrap();
        assert!(fs.mounts().is_empty());
    }

    let fs = fs();
    assert_eq!(fs.read(p(&dir, "a.sar/readme.txt")).unwrap(), b"hello");
    assert_eq!(fs.read(p(&dir, "a.sar/docs/guide/intro.md")).unwrap(), b"# Intro");
    assert_eq!(fs.read(p(&dir, "a.sar/big.bin")).unwrap().len(), 200_000);
    assert_eq!(
        fs.list(p(&dir, "a.sar")).unwrap(),
        vec!["big.bin", "docs", "readme.txt"]
    );
    assert!(fs.stat(p(&dir, "a.sar/docs/guide")).unwrap().is_directory());
    assert_eq!(fs.stat(p(&dir, "a.sar/readme.txt")).unwrap().size(), Some(5));
    assert!(fs.stat(p(&dir, "a.sar")).unwrap().is_directory());
}

#[test]
fn test_read_back_before_sync() {
    let dir = TempDir::new().unwrap();
    let fs = fs();
    fs.write(p(&dir, "a.sar/x.txt"), b"first").unwrap();
    // Implicit sync of the written entry
    assert_eq!(fs.read(p(&dir, "a.sar/x.txt")).unwrap(), b"first");
    assert!(dir.path().join("a.sar").is_file());

    fs.write(p(&dir, "a.sar/x.txt"), b"second").unwrap();
    assert_eq!(fs.read(p(&dir, "a.sar/x.txt")).unwrap(), b"second");
}

#[test]
fn test_missing_archive_and_entry() {
    let dir = TempDir::new().unwrap();
    let fs = fs();
    assert!(matches!(
        fs.read(p(&dir, "nope.sar/x")),
        Err(FsError::NotFound(_))
    ));
    assert!(matches!(fs.list(p(&dir, "nope.sar")), Err(FsError::NotFound(_))));

    fs.write(p(&dir, "a.sar/x"), b"1").unwrap();
    fs.sync(SyncOptions::SYNC).unwrap();
    assert!(matches!(fs.read(p(&dir, "a.sar/y")), Err(FsError::NotFound(_))));
    assert!(matches!(
        fs.list(p(&dir, "a.sar/x")),
        Err(FsError::NotADirectory(_))
    ));
}

#[test]
fn test_mkdir_creates_empty_archive() {
    let dir = TempDir::new().unwrap();
    let fs = fs();
    fs.mkdir(p(&dir, "empty.sar"), false).unwrap();
    assert!(matches!(
        fs.mkdir(p(&dir, "empty.sar"), false),
        Err(FsError::AlreadyExists(_))
    ));
    fs.umount().unwrap();

    assert!(dir.path().join("empty.sar").is_file());
    assert!(fs.list(p(&dir, "empty.sar")).unwrap().is_empty());
    assert!(matches!(
        fs.mkdir(p(&dir, "empty.sar"), false),
        Err(FsError::AlreadyExists(_))
    ));
}

#[test]
fn test_mkdir_inside_archive() {
    let dir = TempDir::new().unwrap();
    let fs = fs();
    assert!(matches!(
        fs.mkdir(p(&dir, "a.sar/x/y"), false),
        Err(FsError::NotFound(_))
    ));
    fs.mkdir(p(&dir, "a.sar/x/y"), true).unwrap();
    assert!(matches!(
        fs.mkdir(p(&dir, "a.sar/x"), false),
        Err(FsError::AlreadyExists(_))
    ));
    fs.umount().unwrap();
    assert_eq!(fs.list(p(&dir, "a.sar/x")).unwrap(), vec!["y"]);
}

#[test]
fn test_delete_entries() {
    let dir = TempDir::new().unwrap();
    let fs = fs();
    fs.write(p(&dir, "a.sar/d/one"), b"1").unwrap();
    fs.write(p(&dir, "a.sar/two"), b"2").unwrap();
    fs.umount().unwrap();

    assert!(matches!(
        fs.delete(p(&dir, "a.sar/d")),
        Err(FsError::DirectoryNotEmpty(_))
    ));
    fs.delete(p(&dir, "a.sar/d/one")).unwrap();
    fs.delete(p(&dir, "a.sar/d")).unwrap();
    fs.umount().unwrap();

    assert_eq!(fs.list(p(&dir, "a.sar")).unwrap(), vec!["two"]);
    assert_eq!(fs.read(p(&dir, "a.sar/two")).unwrap(), b"2");
}

#[test]
fn test_delete_written_entry_syncs_first() {
    let dir = TempDir::new().unwrap();
    let fs = fs();
    fs.write(p(&dir, "a.sar/keep"), b"k").unwrap();
    fs.write(p(&dir, "a.sar/gone"), b"g").unwrap();
    fs.delete(p(&dir, "a.sar/gone")).unwrap();
    fs.umount().unwrap();

    assert_eq!(fs.list(p(&dir, "a.sar")).unwrap(), vec!["keep"]);
}

#[test]
fn test_delete_archive() {
    let dir = TempDir::new().unwrap();
    let fs = fs();
    fs.write(p(&dir, "a.sar/x"), b"1").unwrap();
    fs.umount().unwrap();

    assert!(matches!(
        fs.delete(p(&dir, "a.sar")),
        Err(FsError::DirectoryNotEmpty(_))
    ));
    fs.delete(p(&dir, "a.sar/x")).unwrap();
    fs.delete(p(&dir, "a.sar")).unwrap();
    assert!(!dir.path().join("a.sar").exists());
    assert!(fs.mounts().is_empty());
}

#[test]
fn test_set_time_persists() {
    let dir = TempDir::new().unwrap();
    let fs = fs();
    fs.write(p(&dir, "a.sar/x"), b"1").unwrap();
    assert!(fs.set_time(p(&dir, "a.sar/x"), Access::WRITE, 1_000).unwrap());
    assert!(!fs.set_time(p(&dir, "a.sar/x"), Access::WRITE, 1_000).unwrap());
    fs.umount().unwrap();

    let entry = fs.stat(p(&dir, "a.sar/x")).unwrap();
    assert_eq!(entry.time(Access::WRITE), Some(1_000));
    assert_eq!(fs.read(p(&dir, "a.sar/x")).unwrap(), b"1");
}

#[test]
fn test_abort_discards_changes() {
    let dir = TempDir::new().unwrap();
    let fs = fs();
    fs.write(p(&dir, "a.sar/x"), b"1").unwrap();
    fs.umount().unwrap();

    fs.write(p(&dir, "a.sar/y"), b"2").unwrap();
    fs.delete(p(&dir, "a.sar/x")).unwrap();
    fs.sync(SyncOptions::ABORT).unwrap();

    assert_eq!(fs.list(p(&dir, "a.sar")).unwrap(), vec!["x"]);
}

#[test]
fn test_copy_between_archives_skips_decoding() {
    let dir = TempDir::new().unwrap();
    let fs = fs();
    let data = b"compress me ".repeat(1000);
    fs.write(p(&dir, "a.sar/src.txt"), &data).unwrap();
    fs.set_time(p(&dir, "a.sar/src.txt"), Access::WRITE, 42_000).unwrap();

    // Same format, no key: payload moves verbatim
    assert_eq!(
        fs.copy(p(&dir, "a.sar/src.txt"), p(&dir, "b.sar/dst.txt")).unwrap(),
        0
    );
    // Same mount works as well
    assert_eq!(
        fs.copy(p(&dir, "a.sar/src.txt"), p(&dir, "a.sar/copy.txt")).unwrap(),
        0
    );
    // Host destinations get decoded bytes
    assert_eq!(
        fs.copy(p(&dir, "a.sar/src.txt"), p(&dir, "plain.txt")).unwrap(),
        data.len() as u64
    );
    fs.umount().unwrap();

    assert_eq!(fs.read(p(&dir, "b.sar/dst.txt")).unwrap(), data);
    assert_eq!(fs.read(p(&dir, "a.sar/copy.txt")).unwrap(), data);
    assert_eq!(std::fs::read(dir.path().join("plain.txt")).unwrap(), data);
    assert_eq!(
        fs.stat(p(&dir, "b.sar/dst.txt")).unwrap().time(Access::WRITE),
        Some(42_000)
    );
}

#[test]
fn test_host_paths_pass_through() {
    let dir = TempDir::new().unwrap();
    let fs = fs();
    fs.mkdir(p(&dir, "plain/sub"), true).unwrap();
    fs.write(p(&dir, "plain/sub/f.txt"), b"host").unwrap();
    assert_eq!(std::fs::read(dir.path().join("plain/sub/f.txt")).unwrap(), b"host");
    assert_eq!(fs.list(p(&dir, "plain")).unwrap(), vec!["sub"]);
    assert!(fs.set_time(p(&dir, "plain/sub/f.txt"), Access::WRITE, 1_000_000).unwrap());
    assert_eq!(
        fs.stat(p(&dir, "plain/sub/f.txt")).unwrap().time(Access::WRITE),
        Some(1_000_000)
    );
    fs.delete(p(&dir, "plain/sub/f.txt")).unwrap();
    assert!(!fs.exists(p(&dir, "plain/sub/f.txt")));
}

#[test]
fn test_directory_named_like_archive() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir(dir.path().join("looks.sar")).unwrap();
    let fs = fs();
    fs.write(p(&dir, "looks.sar/f.txt"), b"plain").unwrap();
    assert!(dir.path().join("looks.sar/f.txt").is_file());
    assert!(fs.mounts().is_empty());
}

#[test]
fn test_remounted_listing_matches_model() {
    let dir = TempDir::new().unwrap();
    let names = ["a.sar/x.txt", "a.sar/d", "a.sar/d/y.bin", "a.sar/d/e/z"];
    let describe = |fs: &FsManager| {
        names
            .iter()
            .map(|n| {
                let e = fs.stat(p(&dir, n)).unwrap();
                (
                    e.name().to_string(),
                    e.entry_type(),
                    e.size(),
                    e.time(Access::WRITE),
                    e.time(Access::CREATE),
                )
            })
            .collect::<Vec<_>>()
    };

    let before = {
        let fs = fs();
        fs.write(p(&dir, "a.sar/x.txt"), b"text").unwrap();
        fs.write(p(&dir, "a.sar/d/y.bin"), &[1u8; 300]).unwrap();
        fs.write(p(&dir, "a.sar/d/e/z"), b"").unwrap();
        let listing = describe(&fs);
        fs.umount().unwrap();
        listing
    };

    let fs = fs();
    assert_eq!(describe(&fs), before);
}
