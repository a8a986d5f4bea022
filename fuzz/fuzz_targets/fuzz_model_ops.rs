#![no_main]
use libfuzzer_sys::{arbitrary::{Arbitrary, Unstructured}, fuzz_target};
use nestar_rs::core::entry::DefaultEntryFactory;
use nestar_rs::{Access, ArchiveFileSystem, EntryType, MknodOptions};
use std::sync::Arc;

#[derive(Debug, Arbitrary)]
enum Op {
    Mknod { name: String, dir: bool, parents: bool, exclusive: bool },
    Unlink(String),
    SetTime(String, i64),
}

// Arbitrary operation sequences must keep every entry below a directory
fuzz_target!(|input: &[u8]| {
    let mut u = Unstructured::new(input);
    let ops: Vec<Op> = match u.arbitrary() {
        Ok(ops) => ops,
        Err(_) => return,
    };

    let fs = ArchiveFileSystem::new_empty(Arc::new(DefaultEntryFactory), false);
    for op in ops {
        let _ = match op {
            Op::Mknod { name, dir, parents, exclusive } => {
                let ty = if dir { EntryType::Directory } else { EntryType::File };
                let options = MknodOptions { create_parents: parents, exclusive };
                fs.mknod(&name, ty, options, None).and_then(|m| m.commit()).map(|_| ())
            }
            Op::Unlink(name) => fs.unlink(&name),
            Op::SetTime(name, value) => fs.set_time(&name, Access::WRITE, value).map(|_| ()),
        };
    }

    for entry in fs.entries() {
        if let Some(parent) = nestar_rs::core::entry::parent_of(entry.name()) {
            let parent = fs.entry(parent).expect("entry without parent");
            assert!(parent.is_directory());
        }
    }
});
