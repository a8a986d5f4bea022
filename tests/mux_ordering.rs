//! Entry order in formats with a required head entry

use nestar_rs::{
    ArchiveDriver, FsBuilder, FsManager, Location, NoKeys, OutputStream, SarDriver,
};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn p(dir: &TempDir, rel: &str) -> String {
    dir.path().join(rel).display().to_string()
}

fn fs() -> FsManager {
    FsBuilder::new()
        .driver("pkg", Arc::new(SarDriver::with_head("mimetype").named("pkg")))
        .build()
        .unwrap()
}

/// Entry names as stored in the container
fn container_order(path: &Path) -> Vec<String> {
    let file = File::open(path).unwrap();
    SarDriver::with_head("mimetype")
        .new_input("t.pkg", Box::new(file), &NoKeys)
        .unwrap()
        .entries()
        .iter()
        .map(|e| e.name().to_string())
        .collect()
}

#[test]
fn test_head_written_first_then_request_order() {
    let dir = TempDir::new().unwrap();
    let fs = fs();

    let b = fs.output(p(&dir, "book.pkg/B"), None).unwrap();
    let mut b = b.stream().unwrap();
    b.write_all(b"bbb").unwrap();
    let a = fs.output(p(&dir, "book.pkg/A"), None).unwrap();
    let mut a = a.stream().unwrap();
    a.write_all(b"aaa").unwrap();

    fs.write(p(&dir, "book.pkg/mimetype"), b"application/x-test")
        .unwrap();
    a.close().unwrap();
    b.close().unwrap();
    fs.umount().unwrap();

    assert_eq!(
        container_order(&dir.path().join("book.pkg")),
        vec!["mimetype", "B", "A"]
    );
    assert_eq!(fs.read(p(&dir, "book.pkg/A")).unwrap(), b"aaa");
    assert_eq!(fs.read(p(&dir, "book.pkg/B")).unwrap(), b"bbb");
}

#[test]
fn test_missing_head_still_writes_entries() {
    let dir = TempDir::new().unwrap();
    let fs = fs();
    fs.write(p(&dir, "book.pkg/second"), b"2").unwrap();
    fs.write(p(&dir, "book.pkg/first"), b"1").unwrap();
    fs.umount().unwrap();

    assert_eq!(
        container_order(&dir.path().join("book.pkg")),
        vec!["second", "first"]
    );
}

#[test]
fn test_head_kept_first_across_updates() {
    let dir = TempDir::new().unwrap();
    {
        let fs = fs();
        fs.write(p(&dir, "book.pkg/mimetype"), b"application/x-test")
            .unwrap();
        fs.write(p(&dir, "book.pkg/ch1"), b"one").unwrap();
        fs.umount().unwrap();
    }

    let fs = fs();
    fs.write(p(&dir, "book.pkg/ch2"), b"two").unwrap();
    fs.umount().unwrap();

    let order = container_order(&dir.path().join("book.pkg"));
    assert_eq!(order[0], "mimetype");
    let mut rest = order[1..].to_vec();
    rest.sort();
    assert_eq!(rest, vec!["ch1", "ch2"]);
    assert_eq!(fs.read(p(&dir, "book.pkg/ch1")).unwrap(), b"one");
}

#[test]
fn test_mount_busy_until_head_written() {
    let dir = TempDir::new().unwrap();
    let fs = fs();
    fs.write(p(&dir, "book.pkg/ch1"), b"one").unwrap();
    let controller = match fs.resolve(p(&dir, "book.pkg")).unwrap() {
        Location::Archive { controller, .. } => controller,
        Location::Host(_) => panic!("not an archive"),
    };
    // ch1 waits for the head
    assert!(controller.is_busy());

    fs.write(p(&dir, "book.pkg/mimetype"), b"application/x-test")
        .unwrap();
    assert!(!controller.is_busy());

    fs.umount().unwrap();
    assert!(!controller.is_busy());
    assert_eq!(
        container_order(&dir.path().join("book.pkg")),
        vec!["mimetype", "ch1"]
    );
}
