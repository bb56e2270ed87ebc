//! End-to-end navigation tests over in-memory ext2 images.

use e2v_block::{FileByteDevice, MemByteDevice};
use e2v_core::{Ext2Fs, OpenOptions};
use e2v_error::E2Error;
use e2v_harness::ImageBuilder;
use e2v_types::InodeNumber;
use std::io::Write;

/// `/etc/config/settings.ini` plus a small file at the root.
fn nested_image() -> Ext2Fs {
    let mut builder = ImageBuilder::new(512);
    let root = builder.root();

    let readme = builder.add_file(b"read me first\n").unwrap();
    builder.link(root, "README", readme).unwrap();

    let etc = builder.add_dir(root, "etc").unwrap();
    let config = builder.add_dir(etc, "config").unwrap();
    let settings = builder.add_file(b"[core]\nanswer = 42\n").unwrap();
    builder.link(config, "settings.ini", settings).unwrap();

    builder.open().unwrap()
}

#[test]
fn resolves_three_level_path() {
    let fs = nested_image();
    let (ino, inode) = fs.resolve_path("/etc/config/settings.ini").unwrap();
    assert!(inode.is_regular());

    let data = fs.read_file(ino).unwrap();
    assert_eq!(data, b"[core]\nanswer = 42\n");
}

#[test]
fn lists_root_in_on_disk_order() {
    let fs = nested_image();
    let (_, root) = fs.resolve_path("/").unwrap();
    let names: Vec<String> = fs
        .read_dir(&root)
        .unwrap()
        .iter()
        .map(e2v_ondisk::Ext2DirEntry::name_str)
        .collect();
    assert_eq!(names, vec![".", "..", "README", "etc"]);
}

#[test]
fn dot_and_dotdot_resolve_as_ordinary_entries() {
    let fs = nested_image();
    let (etc_ino, _) = fs.resolve_path("/etc").unwrap();
    let (via_dots, _) = fs.resolve_path("/etc/config/../config/./..").unwrap();
    assert_eq!(via_dots, etc_ino);

    // `..` at the root points back to the root.
    let (ino, _) = fs.resolve_path("/..").unwrap();
    assert_eq!(ino, InodeNumber::ROOT);
}

#[test]
fn missing_component_names_the_culprit() {
    let fs = nested_image();
    match fs.resolve_path("/etc/missing/settings.ini") {
        Err(E2Error::NotFound(name)) => assert_eq!(name, "missing"),
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[test]
fn descending_through_a_file_is_not_a_directory() {
    let fs = nested_image();
    let err = fs.resolve_path("/README/nope").unwrap_err();
    assert!(matches!(err, E2Error::NotDirectory));
    assert_eq!(err.to_errno(), libc::ENOTDIR);
}

#[test]
fn final_component_may_be_a_directory() {
    let fs = nested_image();
    let (_, inode) = fs.resolve_path("/etc/config").unwrap();
    assert!(inode.is_dir());
}

#[test]
fn direct_blocks_round_trip() {
    // Exactly twelve blocks, no indirection.
    let content: Vec<u8> = (0..12 * 1024).map(|i| (i % 251) as u8).collect();
    let mut builder = ImageBuilder::new(512);
    let ino = builder.add_file(&content).unwrap();
    builder.link(builder.root(), "twelve", ino).unwrap();
    let fs = builder.open().unwrap();

    let (ino, _) = fs.resolve_path("/twelve").unwrap();
    assert_eq!(fs.read_file(ino).unwrap(), content);
}

#[test]
fn single_indirect_round_trip_with_partial_tail() {
    // 12 direct + 3 indirect blocks, last one partial.
    let len = 15 * 1024 + 137;
    let content: Vec<u8> = (0..len).map(|i| (i % 199) as u8).collect();
    let mut builder = ImageBuilder::new(512);
    let ino = builder.add_file(&content).unwrap();
    builder.link(builder.root(), "medium", ino).unwrap();
    let fs = builder.open().unwrap();

    let (ino, inode) = fs.resolve_path("/medium").unwrap();
    assert_eq!(inode.size as usize, len);
    assert_ne!(inode.single_indirect(), 0);
    assert_eq!(fs.read_file(ino).unwrap(), content);
}

#[test]
fn double_indirect_round_trip() {
    // 12 + 256 + 3 blocks crosses into the double-indirect range.
    let len = (12 + 256 + 3) * 1024;
    let content: Vec<u8> = (0..len).map(|i| (i % 241) as u8).collect();
    let mut builder = ImageBuilder::new(1024);
    let ino = builder.add_file(&content).unwrap();
    builder.link(builder.root(), "large", ino).unwrap();
    let fs = builder.open().unwrap();

    let (ino, inode) = fs.resolve_path("/large").unwrap();
    assert_ne!(inode.double_indirect(), 0);
    assert_eq!(fs.read_file(ino).unwrap(), content);
}

#[test]
fn triple_indirect_reaches_mapped_block() {
    // One mapped block deep in the triple-indirect range; the rest holes.
    let mapped_lb = 12 + 256 + 256 * 256 + 300;
    let size = (mapped_lb + 1) * 1024;
    let mut builder = ImageBuilder::new(512);
    let ino = builder
        .add_sparse_file(size, &[(mapped_lb, vec![0x5A; 1024])])
        .unwrap();
    builder.link(builder.root(), "huge", ino).unwrap();
    let fs = builder.open().unwrap();

    let (_, inode) = fs.resolve_path("/huge").unwrap();
    assert_ne!(inode.triple_indirect(), 0);

    let mut buf = [0_u8; 16];
    let n = fs
        .read_file_data(&inode, u64::from(mapped_lb) * 1024, &mut buf)
        .unwrap();
    assert_eq!(n, 16);
    assert_eq!(buf, [0x5A; 16]);

    // A neighboring unmapped block in the same range reads as zeroes.
    let n = fs
        .read_file_data(&inode, u64::from(mapped_lb - 1) * 1024, &mut buf)
        .unwrap();
    assert_eq!(n, 16);
    assert_eq!(buf, [0_u8; 16]);
}

#[test]
fn holes_between_direct_blocks_read_as_zeroes() {
    let mut builder = ImageBuilder::new(512);
    // Blocks 0 and 2 mapped, block 1 a hole.
    let ino = builder
        .add_sparse_file(3 * 1024, &[(0, vec![b'a'; 1024]), (2, vec![b'c'; 1024])])
        .unwrap();
    builder.link(builder.root(), "gappy", ino).unwrap();
    let fs = builder.open().unwrap();

    let (ino, inode) = fs.resolve_path("/gappy").unwrap();
    assert!(inode.sparse_hint());
    let data = fs.read_file(ino).unwrap();
    assert_eq!(data.len(), 3 * 1024);
    assert!(data[..1024].iter().all(|b| *b == b'a'));
    assert!(data[1024..2048].iter().all(|b| *b == 0));
    assert!(data[2048..].iter().all(|b| *b == b'c'));
}

#[test]
fn cat_of_a_directory_is_rejected() {
    let fs = nested_image();
    let (ino, _) = fs.resolve_path("/etc").unwrap();
    let err = fs.read_file(ino).unwrap_err();
    assert!(matches!(err, E2Error::IsDirectory));
    assert_eq!(err.to_errno(), libc::EISDIR);
}

#[test]
fn corrupted_magic_fails_open() {
    let mut builder = ImageBuilder::new(256);
    let f = builder.add_file(b"x").unwrap();
    builder.link(builder.root(), "f", f).unwrap();
    let mut image = builder.finish().unwrap();
    image[1024 + 0x38] = 0x00;
    image[1024 + 0x39] = 0x00;

    let err = Ext2Fs::from_device(
        Box::new(MemByteDevice::new(image)),
        &OpenOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, E2Error::Format(_)));
    assert_eq!(err.to_errno(), libc::EINVAL);
}

#[test]
fn truncated_image_is_a_short_read() {
    let builder = ImageBuilder::new(256);
    let mut image = builder.finish().unwrap();
    image.truncate(1500);

    let err = Ext2Fs::from_device(
        Box::new(MemByteDevice::new(image)),
        &OpenOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, E2Error::ShortRead { .. }));
    assert_eq!(err.to_errno(), libc::EIO);
}

#[test]
fn summary_counts_match_builder() {
    let mut builder = ImageBuilder::new(300);
    builder.set_volume_name("navtest");
    let f = builder.add_file(b"hello").unwrap();
    builder.link(builder.root(), "hello", f).unwrap();
    let fs = builder.open().unwrap();

    let summary = fs.summary();
    assert_eq!(summary.volume_name, "navtest");
    assert_eq!(summary.blocks_count, 300);
    assert_eq!(summary.block_size, 1024);
    assert_eq!(summary.groups_count, 1);
    assert_eq!(summary.inodes_per_block, 8);
    assert_eq!(summary.fs_bytes, 300 * 1024);
    assert_eq!(summary.groups[0].inode_table, 5);
    assert!(summary.free_blocks_count < 300);
}

#[test]
fn owner_and_mtime_surface_through_inode() {
    let mut builder = ImageBuilder::new(256);
    let f = builder.add_file(b"owned").unwrap();
    builder.set_owner(f, 1000, 100).unwrap();
    builder.set_mtime(f, 1_600_000_000).unwrap();
    builder.link(builder.root(), "owned", f).unwrap();
    let fs = builder.open().unwrap();

    let (_, inode) = fs.resolve_path("/owned").unwrap();
    assert_eq!(inode.uid, 1000);
    assert_eq!(inode.gid, 100);
    assert_eq!(inode.mtime, 1_600_000_000);
}

#[test]
fn opens_image_from_a_real_file() {
    let mut builder = ImageBuilder::new(256);
    let f = builder.add_file(b"from disk\n").unwrap();
    builder.link(builder.root(), "disk.txt", f).unwrap();
    let image = builder.finish().unwrap();

    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(&image).unwrap();
    tmp.flush().unwrap();

    let dev = FileByteDevice::open(tmp.path()).unwrap();
    let fs = Ext2Fs::from_device(Box::new(dev), &OpenOptions::default()).unwrap();
    let (ino, _) = fs.resolve_path("/disk.txt").unwrap();
    assert_eq!(fs.read_file(ino).unwrap(), b"from disk\n");
}
