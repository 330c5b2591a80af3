use std::ffi::OsStr;
use std::sync::{Arc, Barrier};
use std::thread;

use stackfs_core::lower::memory::MemoryLower;
use stackfs_core::lower::LowerFs;
use stackfs_core::{CreateAttr, LookupFlags, MountOptions, NodeKind, StackError, StackFs};

fn mount(fs: &Arc<MemoryLower>) -> StackFs {
    StackFs::mount_lower(fs.clone(), MountOptions::default()).unwrap()
}

#[test]
fn test_concurrent_lookups_share_one_node() {
    let fs = MemoryLower::new("tmpfs");
    let lower = fs.add_file("/shared", b"contents", 0o644).unwrap();
    let stack = mount(&fs);
    let root = stack.root().unwrap();

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let stack = stack.clone();
            let root = Arc::clone(&root);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                stack
                    .lookup(&root, OsStr::new("shared"), LookupFlags::NONE)
                    .unwrap()
                    .node()
                    .unwrap()
            })
        })
        .collect();
    let nodes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    for node in &nodes[1..] {
        assert!(Arc::ptr_eq(node, &nodes[0]));
    }
    assert_eq!(lower.pin_count(), 1);
}

#[test]
fn test_negative_entry_becomes_positive() {
    let fs = MemoryLower::new("tmpfs");
    let stack = mount(&fs);
    let root = stack.root().unwrap();

    let negative = stack
        .lookup(&root, OsStr::new("missing.txt"), LookupFlags::CREATE)
        .unwrap();
    assert!(negative.is_negative());

    let created = stack
        .create(&root, OsStr::new("missing.txt"), &CreateAttr::regular(0o644))
        .unwrap();
    assert!(Arc::ptr_eq(&negative, &created));
    let node = negative.node().unwrap();
    assert_eq!(node.kind(), NodeKind::Regular);
    assert_eq!(node.attr().perm(), 0o644);
    assert!(negative.get_lower_path().unwrap().is_positive());
}

#[test]
fn test_workdir_bootstrap_is_idempotent() {
    let fs = MemoryLower::new("tmpfs");
    let first = mount(&fs);
    let base = fs.resolve("/._stackfs").unwrap();
    assert_eq!(base.attr().perm(), 0o700);
    assert!(fs.resolve("/._stackfs/data").unwrap().kind().is_dir());
    assert!(fs.resolve("/._stackfs/meta").unwrap().kind().is_dir());
    assert!(first.detach());
    drop(first);

    let nodes = fs.node_count();
    let second = mount(&fs);
    assert_eq!(fs.node_count(), nodes);
    assert!(Arc::ptr_eq(&fs.resolve("/._stackfs").unwrap(), &base));
    assert!(second.superblock().work().is_some());
}

#[test]
fn test_require_overlay_refuses_plain_lower() {
    let fs = MemoryLower::new("ext4");
    let options = MountOptions::builder().require_overlay(true).build();
    let err = StackFs::mount_lower(fs.clone(), options).unwrap_err();
    assert!(matches!(err, StackError::UnsupportedLower { .. }));
    assert_eq!(fs.instance().active_count(), 0);
    assert!(fs.resolve("/._stackfs").is_err());
}

#[test]
fn test_overlay_lower_gets_triad_in_upper_layer() {
    let (merged, upper) = MemoryLower::overlay();
    let stack = mount(&merged);
    let root = stack.root().unwrap();
    assert!(!root.is_negative());
    assert!(root.get_lower_path().unwrap().is_positive());
    drop(root);
    assert!(upper.resolve("/._stackfs/data").is_ok());
    assert!(merged.resolve("/._stackfs").is_err());
    assert!(stack.detach());
}

#[test]
fn test_lower_path_swap_and_reset() {
    let fs = MemoryLower::new("tmpfs");
    fs.add_file("/a", b"", 0o644).unwrap();
    fs.add_file("/b", b"", 0o644).unwrap();
    let stack = mount(&fs);
    let root = stack.root().unwrap();
    let a = stack.lookup_existing(&root, OsStr::new("a")).unwrap();
    let b = stack.lookup_existing(&root, OsStr::new("b")).unwrap();

    let b_path = b.get_lower_path().unwrap();
    let previous = a.set_lower_path(b_path.clone()).unwrap();
    assert!(a.get_lower_path().unwrap().same_as(&b_path));

    let taken = a.reset_lower_path().unwrap();
    assert!(taken.same_as(&b_path));
    assert!(matches!(a.lower_path(), Err(StackError::Stale { .. })));

    assert!(a.set_lower_path(previous).is_none());
}

#[test]
fn test_cross_device_name_is_refused() {
    let fs = MemoryLower::new("tmpfs");
    let foreign = MemoryLower::new("proc");
    foreign.add_file("/version", b"1", 0o444).unwrap();
    fs.graft("/proc", &foreign).unwrap();
    let stack = mount(&fs);
    let root = stack.root().unwrap();

    let err = stack
        .lookup(&root, OsStr::new("proc"), LookupFlags::NONE)
        .unwrap_err();
    assert!(matches!(err, StackError::CrossDevice { .. }));
    assert_eq!(err.errno(), libc::EXDEV);
    assert_eq!(foreign.root().unwrap().pin_count(), 0);
    assert_eq!(stack.stats().snapshot().cross_device, 1);
}

#[test]
fn test_references_balance_after_detach() {
    let fs = MemoryLower::new("tmpfs");
    let files: Vec<_> = (0..16)
        .map(|i| fs.add_file(&format!("/f{}", i), b"x", 0o644).unwrap())
        .collect();
    fs.add_dir("/d", 0o755).unwrap();
    let stack = mount(&fs);
    let root = stack.root().unwrap();

    let mut entries = Vec::new();
    for i in 0..16 {
        let name = format!("f{}", i);
        entries.push(stack.lookup_existing(&root, OsStr::new(&name)).unwrap());
    }
    let dir = stack.lookup_existing(&root, OsStr::new("d")).unwrap();
    entries.push(stack.lookup(&dir, OsStr::new("nothing"), LookupFlags::NONE).unwrap());
    entries.push(dir);
    assert!(files.iter().all(|inode| inode.pin_count() == 1));

    drop(entries);
    assert!(files.iter().all(|inode| inode.pin_count() == 0));

    drop(root);
    assert!(stack.detach());
    assert!(!stack.detach());
    assert_eq!(fs.instance().active_count(), 0);
    assert_eq!(fs.root().unwrap().pin_count(), 0);
    assert!(stack.superblock().cache().is_empty());
}

#[test]
fn test_rename_then_reopen() {
    let fs = MemoryLower::new("tmpfs");
    fs.add_file("/draft", b"text", 0o644).unwrap();
    let stack = mount(&fs);
    let root = stack.root().unwrap();

    let moved = stack
        .rename(&root, OsStr::new("draft"), &root, OsStr::new("final"), 0)
        .unwrap();
    let handle = stack.open(&moved, stackfs_core::OpenFlags::READ).unwrap();
    assert_eq!(&handle.read(16).unwrap()[..], b"text");
    assert_eq!(stack.stats().snapshot().open_handles, 1);
}

#[test]
fn test_create_of_evicted_file_reports_not_found() {
    let fs = MemoryLower::new("tmpfs");
    let stack = mount(&fs);
    let root = stack.root().unwrap();
    fs.set_evict_created(true);

    let err = stack
        .create(&root, OsStr::new("fleeting"), &CreateAttr::regular(0o644))
        .unwrap_err();
    assert_eq!(err.errno(), libc::ENOENT);
    let entry = stack
        .lookup(&root, OsStr::new("fleeting"), LookupFlags::CREATE)
        .unwrap();
    assert!(entry.is_negative());
    assert!(!entry.get_lower_path().unwrap().is_positive());
}
