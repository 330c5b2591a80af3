#![cfg(target_os = "linux")]

use std::ffi::OsStr;
use std::fs;
use std::io::SeekFrom;

use stackfs_core::lower::host::HostLower;
use stackfs_core::{CreateAttr, LookupFlags, MountOptions, OpenFlags, StackFs, STACKFS_SUPER_MAGIC};

fn mount(dir: &tempfile::TempDir) -> StackFs {
    let lower = HostLower::open_plain(dir.path()).unwrap();
    StackFs::mount_lower(lower, MountOptions::default()).unwrap()
}

#[test]
fn test_mount_bootstraps_working_triad() {
    let dir = tempfile::tempdir().unwrap();
    let stack = mount(&dir);

    assert!(dir.path().join("._stackfs/data").is_dir());
    assert!(dir.path().join("._stackfs/meta").is_dir());
    assert_eq!(stack.statfs().unwrap().fs_type, STACKFS_SUPER_MAGIC);
    assert!(stack.show_options().contains("lower="));
}

#[test]
fn test_read_and_write_through_host() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("notes.txt"), b"first line\n").unwrap();
    let stack = mount(&dir);
    let root = stack.root().unwrap();

    let entry = stack.lookup_existing(&root, OsStr::new("notes.txt")).unwrap();
    let handle = stack
        .open(&entry, OpenFlags::READ_WRITE | OpenFlags::APPEND)
        .unwrap();
    assert_eq!(&handle.read(64).unwrap()[..], b"first line\n");
    handle.write(b"second line\n").unwrap();
    handle.fsync(false).unwrap();
    assert_eq!(entry.node().unwrap().attr().size, 23);

    handle.llseek(SeekFrom::Start(0)).unwrap();
    assert_eq!(handle.read(5).unwrap().len(), 5);
    drop(handle);

    let on_disk = fs::read(dir.path().join("notes.txt")).unwrap();
    assert_eq!(on_disk, b"first line\nsecond line\n");
}

#[test]
fn test_namespace_changes_reach_host() {
    let dir = tempfile::tempdir().unwrap();
    let stack = mount(&dir);
    let root = stack.root().unwrap();

    let sub = stack.mkdir(&root, OsStr::new("sub"), 0o755).unwrap();
    stack
        .create(&sub, OsStr::new("a"), &CreateAttr::regular(0o600))
        .unwrap();
    assert!(dir.path().join("sub/a").is_file());

    stack
        .rename(&sub, OsStr::new("a"), &root, OsStr::new("b"), 0)
        .unwrap();
    assert!(dir.path().join("b").is_file());
    assert!(!dir.path().join("sub/a").exists());

    stack.unlink(&root, OsStr::new("b")).unwrap();
    stack.rmdir(&root, OsStr::new("sub")).unwrap();
    assert!(!dir.path().join("b").exists());
    assert!(!dir.path().join("sub").exists());
    assert!(stack
        .lookup(&root, OsStr::new("sub"), LookupFlags::NONE)
        .unwrap()
        .is_negative());
}

#[test]
fn test_remount_twice_reuses_triad() {
    let dir = tempfile::tempdir().unwrap();
    let first = mount(&dir);
    assert!(first.detach());
    drop(first);

    let second = mount(&dir);
    let names: Vec<_> = second
        .readdir(&second.root().unwrap().node().unwrap())
        .unwrap()
        .into_iter()
        .map(|entry| entry.name)
        .collect();
    assert_eq!(names.iter().filter(|name| *name == "._stackfs").count(), 1);
}

#[test]
fn test_exchange_rename_leaves_both_names() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("a"), b"AAAA").unwrap();
    fs::write(dir.path().join("b"), b"BB").unwrap();
    let stack = mount(&dir);
    let root = stack.root().unwrap();
    let a = stack.lookup_existing(&root, OsStr::new("a")).unwrap();

    let err = stack
        .rename(&root, OsStr::new("a"), &root, OsStr::new("b"), libc::RENAME_EXCHANGE)
        .unwrap_err();
    assert_eq!(err.errno(), libc::EOPNOTSUPP);
    assert_eq!(fs::read(dir.path().join("a")).unwrap(), b"AAAA");
    assert_eq!(fs::read(dir.path().join("b")).unwrap(), b"BB");
    assert!(!a.is_negative());
    let handle = stack.open(&a, OpenFlags::READ).unwrap();
    assert_eq!(&handle.read(16).unwrap()[..], b"AAAA");
}
