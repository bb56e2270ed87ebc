#![forbid(unsafe_code)]
//! Byte-level parsers for the classic (non-64-bit) ext2 on-disk format.
//!
//! Everything in this crate operates on borrowed byte slices and returns
//! `ParseError` on malformed input; no I/O happens here. Device-backed
//! reads live in `e2v-core`.

mod ext2;

pub use ext2::{
    dir_entries, lookup_in_dir_block, parse_dir_block, DirBlockEntries, Ext2DirEntry,
    Ext2FileType, Ext2GroupDesc, Ext2Inode, Ext2Superblock, InodeLocation,
};
