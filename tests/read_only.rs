//! Read-only mounts

use nestar_rs::{Access, FsBuilder, FsError};
use tempfile::TempDir;

fn p(dir: &TempDir, rel: &str) -> String {
    dir.path().join(rel).display().to_string()
}

#[test]
fn test_read_only_mount_rejects_changes() {
    let dir = TempDir::new().unwrap();
    let fs = FsBuilder::new().build().unwrap();
    fs.write(p(&dir, "ro.sar/a.txt"), b"a").unwrap();
    fs.write(p(&dir, "ro.sar/inner.sar/b.txt"), b"b").unwrap();

    // Flushes the pending changes before switching
    fs.mount_read_only(p(&dir, "ro.sar")).unwrap();

    assert_eq!(fs.read(p(&dir, "ro.sar/a.txt")).unwrap(), b"a");
    assert!(matches!(
        fs.write(p(&dir, "ro.sar/new.txt"), b"x"),
        Err(FsError::ReadOnly(_))
    ));
    assert!(matches!(
        fs.delete(p(&dir, "ro.sar/a.txt")),
        Err(FsError::ReadOnly(_))
    ));
    assert!(matches!(
        fs.mkdir(p(&dir, "ro.sar/d"), false),
        Err(FsError::ReadOnly(_))
    ));
    assert!(matches!(
        fs.set_time(p(&dir, "ro.sar/a.txt"), Access::WRITE, 1),
        Err(FsError::ReadOnly(_))
    ));

    // Nested mounts inherit it
    assert_eq!(fs.read(p(&dir, "ro.sar/inner.sar/b.txt")).unwrap(), b"b");
    assert!(matches!(
        fs.write(p(&dir, "ro.sar/inner.sar/c.txt"), b"c"),
        Err(FsError::ReadOnly(_))
    ));
    fs.umount().unwrap();
}

#[test]
fn test_read_only_missing_archive_is_not_created() {
    let dir = TempDir::new().unwrap();
    let fs = FsBuilder::new().build().unwrap();
    fs.mount_read_only(p(&dir, "none.sar")).unwrap();
    assert!(matches!(
        fs.write(p(&dir, "none.sar/x"), b"x"),
        Err(FsError::ReadOnly(_))
    ));
    fs.umount().unwrap();
    assert!(!dir.path().join("none.sar").exists());
}
