#![forbid(unsafe_code)]
//! Test harness: builds valid ext2 images entirely in memory.
//!
//! [`ImageBuilder`] produces single-group images with 1K blocks and 128-byte
//! inodes, enough to exercise every navigation path: nested directories,
//! direct and 1x/2x/3x indirect block chains, and sparse files with holes.
//! No external mkfs tooling is involved, so tests run hermetically.

use anyhow::{bail, ensure, Context, Result};
use e2v_types::{EXT2_SUPER_MAGIC, S_IFDIR, S_IFMT, S_IFREG};
use std::collections::BTreeMap;

const BLOCK_SIZE: usize = 1024;
const INODE_SIZE: usize = 128;
const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;
const POINTERS_PER_BLOCK: u32 = (BLOCK_SIZE / 4) as u32;

/// First logical block addressed through the single-indirect pointer.
const IND_BASE: u32 = 12;
/// First logical block addressed through the double-indirect pointer.
const DIND_BASE: u32 = IND_BASE + POINTERS_PER_BLOCK;
/// First logical block addressed through the triple-indirect pointer.
const TIND_BASE: u32 = DIND_BASE + POINTERS_PER_BLOCK * POINTERS_PER_BLOCK;

/// Fixed layout: boot block, superblock, descriptor table, bitmaps, then the
/// inode table starting at block 5.
const INODE_TABLE_BLOCK: u32 = 5;

#[derive(Debug, Clone, Default)]
struct InodeRecord {
    mode: u16,
    uid: u16,
    gid: u16,
    size: u32,
    links_count: u16,
    blocks: u32,
    mtime: u32,
    block: [u32; 15],
}

#[derive(Debug, Clone)]
struct DirEnt {
    inode: u32,
    file_type: u8,
    name: Vec<u8>,
}

/// Builds a single-group 1K-block ext2 image in memory.
///
/// Inode 2 is the root directory; further inodes are handed out from 11
/// (the classic first non-reserved inode) upward. Directory data blocks are
/// materialized by [`finish`](Self::finish) so entries can keep being added
/// until then.
#[derive(Debug)]
pub struct ImageBuilder {
    total_blocks: u32,
    inodes_count: u32,
    next_block: u32,
    next_ino: u32,
    volume_name: String,
    inodes: BTreeMap<u32, InodeRecord>,
    dirs: BTreeMap<u32, Vec<DirEnt>>,
    data: BTreeMap<u32, Vec<u8>>,
}

impl ImageBuilder {
    /// Start a new image of `total_blocks` 1K blocks with the root directory
    /// already in place.
    #[must_use]
    pub fn new(total_blocks: u32) -> Self {
        let inodes_count = 128;
        let inode_table_blocks = inodes_count / INODES_PER_BLOCK as u32;
        let first_data = INODE_TABLE_BLOCK + inode_table_blocks;

        let mut builder = Self {
            total_blocks,
            inodes_count,
            next_block: first_data,
            next_ino: 11,
            volume_name: "e2v-test".to_owned(),
            inodes: BTreeMap::new(),
            dirs: BTreeMap::new(),
            data: BTreeMap::new(),
        };

        builder.inodes.insert(
            2,
            InodeRecord {
                mode: S_IFDIR | 0o755,
                links_count: 2,
                ..InodeRecord::default()
            },
        );
        builder.dirs.insert(
            2,
            vec![
                DirEnt {
                    inode: 2,
                    file_type: 2,
                    name: b".".to_vec(),
                },
                DirEnt {
                    inode: 2,
                    file_type: 2,
                    name: b"..".to_vec(),
                },
            ],
        );
        builder
    }

    /// Set the volume label written to the superblock.
    pub fn set_volume_name(&mut self, name: &str) {
        self.volume_name = name.to_owned();
    }

    /// The root directory's inode number.
    #[must_use]
    pub fn root(&self) -> u32 {
        2
    }

    fn alloc_block(&mut self) -> Result<u32> {
        ensure!(
            self.next_block < self.total_blocks,
            "image full: {} blocks",
            self.total_blocks
        );
        let block = self.next_block;
        self.next_block += 1;
        Ok(block)
    }

    fn alloc_inode(&mut self) -> Result<u32> {
        ensure!(
            self.next_ino <= self.inodes_count,
            "inode table full: {} inodes",
            self.inodes_count
        );
        let ino = self.next_ino;
        self.next_ino += 1;
        Ok(ino)
    }

    fn write_data_block(&mut self, content: &[u8]) -> Result<u32> {
        ensure!(content.len() <= BLOCK_SIZE, "block content too large");
        let block = self.alloc_block()?;
        let mut buf = content.to_vec();
        buf.resize(BLOCK_SIZE, 0);
        self.data.insert(block, buf);
        Ok(block)
    }

    /// Add a regular file with dense contents; indirection blocks are built
    /// automatically as the file grows past the twelve direct pointers.
    pub fn add_file(&mut self, contents: &[u8]) -> Result<u32> {
        self.add_file_with_mode(contents, S_IFREG | 0o644)
    }

    /// Add a regular file with an explicit mode.
    pub fn add_file_with_mode(&mut self, contents: &[u8], mode: u16) -> Result<u32> {
        let size = u32::try_from(contents.len()).context("file size exceeds u32")?;
        let mut mapped = Vec::new();
        for (lb, chunk) in contents.chunks(BLOCK_SIZE).enumerate() {
            mapped.push((u32::try_from(lb)?, chunk.to_vec()));
        }
        self.add_sparse_file_with_mode(size, &mapped, mode)
    }

    /// Add a regular file of `size` bytes where only the listed logical
    /// blocks are mapped; everything else is a hole (zero pointer).
    pub fn add_sparse_file(&mut self, size: u32, mapped: &[(u32, Vec<u8>)]) -> Result<u32> {
        self.add_sparse_file_with_mode(size, mapped, S_IFREG | 0o644)
    }

    fn add_sparse_file_with_mode(
        &mut self,
        size: u32,
        mapped: &[(u32, Vec<u8>)],
        mode: u16,
    ) -> Result<u32> {
        ensure!(mode & S_IFMT != S_IFDIR, "use add_dir for directories");

        // Write the data blocks first, recording logical -> physical.
        let mut phys: BTreeMap<u32, u32> = BTreeMap::new();
        for (lb, content) in mapped {
            let block = self.write_data_block(content)?;
            ensure!(phys.insert(*lb, block).is_none(), "duplicate logical block {lb}");
        }

        let (block, chain_blocks) = self.build_block_pointers(&phys)?;
        let data_blocks = u32::try_from(phys.len())?;

        let ino = self.alloc_inode()?;
        self.inodes.insert(
            ino,
            InodeRecord {
                mode,
                size,
                links_count: 1,
                blocks: (data_blocks + chain_blocks) * 2,
                block,
                ..InodeRecord::default()
            },
        );
        Ok(ino)
    }

    /// Build the fifteen-slot pointer array for a logical-to-physical map,
    /// allocating indirection blocks only for subtrees that hold a mapping.
    ///
    /// Returns the pointer array and the count of chain blocks allocated.
    fn build_block_pointers(&mut self, phys: &BTreeMap<u32, u32>) -> Result<([u32; 15], u32)> {
        let mut block = [0_u32; 15];
        let mut chain_blocks = 0_u32;

        let mut single: BTreeMap<u32, u32> = BTreeMap::new();
        let mut double: BTreeMap<u32, BTreeMap<u32, u32>> = BTreeMap::new();
        let mut triple: BTreeMap<u32, BTreeMap<u32, BTreeMap<u32, u32>>> = BTreeMap::new();

        for (&lb, &pb) in phys {
            if lb < IND_BASE {
                block[lb as usize] = pb;
            } else if lb < DIND_BASE {
                single.insert(lb - IND_BASE, pb);
            } else if lb < TIND_BASE {
                let rel = lb - DIND_BASE;
                double
                    .entry(rel / POINTERS_PER_BLOCK)
                    .or_default()
                    .insert(rel % POINTERS_PER_BLOCK, pb);
            } else {
                let rel = lb - TIND_BASE;
                let per_dind = POINTERS_PER_BLOCK * POINTERS_PER_BLOCK;
                triple
                    .entry(rel / per_dind)
                    .or_default()
                    .entry((rel % per_dind) / POINTERS_PER_BLOCK)
                    .or_default()
                    .insert(rel % POINTERS_PER_BLOCK, pb);
            }
        }

        if !single.is_empty() {
            block[12] = self.write_pointer_block(&single)?;
            chain_blocks += 1;
        }

        if !double.is_empty() {
            let mut dind: BTreeMap<u32, u32> = BTreeMap::new();
            for (slot, leaves) in &double {
                dind.insert(*slot, self.write_pointer_block(leaves)?);
                chain_blocks += 1;
            }
            block[13] = self.write_pointer_block(&dind)?;
            chain_blocks += 1;
        }

        if !triple.is_empty() {
            let mut tind: BTreeMap<u32, u32> = BTreeMap::new();
            for (slot0, dinds) in &triple {
                let mut dind: BTreeMap<u32, u32> = BTreeMap::new();
                for (slot1, leaves) in dinds {
                    dind.insert(*slot1, self.write_pointer_block(leaves)?);
                    chain_blocks += 1;
                }
                tind.insert(*slot0, self.write_pointer_block(&dind)?);
                chain_blocks += 1;
            }
            block[14] = self.write_pointer_block(&tind)?;
            chain_blocks += 1;
        }

        Ok((block, chain_blocks))
    }

    fn write_pointer_block(&mut self, slots: &BTreeMap<u32, u32>) -> Result<u32> {
        let mut buf = vec![0_u8; BLOCK_SIZE];
        for (&slot, &target) in slots {
            let off = slot as usize * 4;
            ensure!(off + 4 <= BLOCK_SIZE, "pointer slot {slot} out of range");
            buf[off..off + 4].copy_from_slice(&target.to_le_bytes());
        }
        let block = self.alloc_block()?;
        self.data.insert(block, buf);
        Ok(block)
    }

    /// Add an empty subdirectory under `parent`; `.` and `..` are created.
    pub fn add_dir(&mut self, parent: u32, name: &str) -> Result<u32> {
        ensure!(self.dirs.contains_key(&parent), "parent {parent} is not a directory");

        let ino = self.alloc_inode()?;
        self.inodes.insert(
            ino,
            InodeRecord {
                mode: S_IFDIR | 0o755,
                links_count: 2,
                ..InodeRecord::default()
            },
        );
        self.dirs.insert(
            ino,
            vec![
                DirEnt {
                    inode: ino,
                    file_type: 2,
                    name: b".".to_vec(),
                },
                DirEnt {
                    inode: parent,
                    file_type: 2,
                    name: b"..".to_vec(),
                },
            ],
        );
        self.link_raw(parent, name, ino, 2)?;
        if let Some(parent_rec) = self.inodes.get_mut(&parent) {
            parent_rec.links_count += 1;
        }
        Ok(ino)
    }

    /// Link an existing inode into a directory under `name`.
    pub fn link(&mut self, dir: u32, name: &str, child: u32) -> Result<u32> {
        let mode = self
            .inodes
            .get(&child)
            .with_context(|| format!("inode {child} does not exist"))?
            .mode;
        let file_type = match mode & S_IFMT {
            S_IFDIR => 2,
            S_IFREG => 1,
            _ => 0,
        };
        self.link_raw(dir, name, child, file_type)?;
        Ok(child)
    }

    fn link_raw(&mut self, dir: u32, name: &str, child: u32, file_type: u8) -> Result<()> {
        ensure!(!name.is_empty() && name.len() <= 255, "bad entry name");
        let entries = self
            .dirs
            .get_mut(&dir)
            .with_context(|| format!("inode {dir} is not a directory"))?;
        entries.push(DirEnt {
            inode: child,
            file_type,
            name: name.as_bytes().to_vec(),
        });
        Ok(())
    }

    /// Set owner fields on an inode.
    pub fn set_owner(&mut self, ino: u32, uid: u16, gid: u16) -> Result<()> {
        let rec = self
            .inodes
            .get_mut(&ino)
            .with_context(|| format!("inode {ino} does not exist"))?;
        rec.uid = uid;
        rec.gid = gid;
        Ok(())
    }

    /// Set the modification timestamp on an inode.
    pub fn set_mtime(&mut self, ino: u32, mtime: u32) -> Result<()> {
        let rec = self
            .inodes
            .get_mut(&ino)
            .with_context(|| format!("inode {ino} does not exist"))?;
        rec.mtime = mtime;
        Ok(())
    }

    /// Materialize the image.
    ///
    /// Packs every directory's entries into data blocks (the final entry of
    /// each block stretches its `rec_len` to the block boundary), then writes
    /// the superblock, descriptor table, bitmaps, inode table, and data.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        // Directory blocks are allocated last so files keep stable layouts.
        let dirs: Vec<(u32, Vec<DirEnt>)> = self.dirs.iter().map(|(k, v)| (*k, v.clone())).collect();
        for (ino, entries) in dirs {
            let blocks = pack_dir_blocks(&entries)?;
            let mut pointers = [0_u32; 15];
            ensure!(blocks.len() <= 12, "directory too large for direct blocks");
            for (i, content) in blocks.iter().enumerate() {
                let block = self.alloc_block()?;
                self.data.insert(block, content.clone());
                pointers[i] = block;
            }
            let size = u32::try_from(blocks.len() * BLOCK_SIZE)?;
            let blocks_512 = u32::try_from(blocks.len() * 2)?;
            let rec = self
                .inodes
                .get_mut(&ino)
                .with_context(|| format!("directory inode {ino} missing"))?;
            rec.size = size;
            rec.blocks = blocks_512;
            rec.block = pointers;
        }

        let mut image = vec![0_u8; self.total_blocks as usize * BLOCK_SIZE];

        self.write_superblock(&mut image)?;
        self.write_group_desc(&mut image);
        self.write_bitmaps(&mut image);
        self.write_inode_table(&mut image)?;

        for (block, content) in &self.data {
            let base = *block as usize * BLOCK_SIZE;
            ensure!(base + BLOCK_SIZE <= image.len(), "block {block} beyond image");
            image[base..base + BLOCK_SIZE].copy_from_slice(content);
        }

        Ok(image)
    }

    /// Build the image and hand it straight to the navigation engine.
    pub fn open(self) -> Result<e2v_core::Ext2Fs> {
        let image = self.finish()?;
        let dev = e2v_block::MemByteDevice::new(image);
        e2v_core::Ext2Fs::from_device(Box::new(dev), &e2v_core::OpenOptions::default())
            .context("open built image")
    }

    fn write_superblock(&self, image: &mut [u8]) -> Result<()> {
        let sb = 1024;
        let used_blocks = self.next_block;
        let free_blocks = self.total_blocks.saturating_sub(used_blocks);
        let free_inodes = self.inodes_count - u32::try_from(self.inodes.len())?;

        put32(image, sb + 0x00, self.inodes_count);
        put32(image, sb + 0x04, self.total_blocks);
        put32(image, sb + 0x0C, free_blocks);
        put32(image, sb + 0x10, free_inodes);
        put32(image, sb + 0x14, 1); // first_data_block
        put32(image, sb + 0x18, 0); // log_block_size -> 1024
        put32(image, sb + 0x20, 8192); // blocks_per_group
        put32(image, sb + 0x28, self.inodes_count); // inodes_per_group
        put32(image, sb + 0x2C, 1_700_000_000); // mtime
        put32(image, sb + 0x30, 1_700_000_000); // wtime
        put16(image, sb + 0x38, EXT2_SUPER_MAGIC);
        put16(image, sb + 0x3A, 1); // state: clean
        put32(image, sb + 0x4C, 1); // rev_level
        put32(image, sb + 0x54, 11); // first_ino
        put16(image, sb + 0x58, u16::try_from(INODE_SIZE)?);
        for (i, b) in (0x11_u8..0x21).enumerate() {
            image[sb + 0x68 + i] = b; // uuid
        }
        let name = self.volume_name.as_bytes();
        ensure!(name.len() <= 16, "volume name too long");
        image[sb + 0x78..sb + 0x78 + name.len()].copy_from_slice(name);
        Ok(())
    }

    fn write_group_desc(&self, image: &mut [u8]) {
        let gd = 2 * BLOCK_SIZE;
        put32(image, gd + 0x00, 3); // block_bitmap
        put32(image, gd + 0x04, 4); // inode_bitmap
        put32(image, gd + 0x08, INODE_TABLE_BLOCK);
        let free_blocks = self.total_blocks.saturating_sub(self.next_block);
        put16(image, gd + 0x0C, u16::try_from(free_blocks.min(0xFFFF)).unwrap_or(0));
        let free_inodes = self.inodes_count - self.inodes.len() as u32;
        put16(image, gd + 0x0E, u16::try_from(free_inodes.min(0xFFFF)).unwrap_or(0));
        put16(image, gd + 0x10, u16::try_from(self.dirs.len().min(0xFFFF)).unwrap_or(0));
    }

    fn write_bitmaps(&self, image: &mut [u8]) {
        // Blocks 0..next_block allocated; inodes 1..=10 reserved plus live ones.
        for block in 0..self.next_block {
            set_bit(&mut image[3 * BLOCK_SIZE..4 * BLOCK_SIZE], block as usize);
        }
        for ino in 1..=10_u32 {
            set_bit(&mut image[4 * BLOCK_SIZE..5 * BLOCK_SIZE], (ino - 1) as usize);
        }
        for &ino in self.inodes.keys() {
            set_bit(&mut image[4 * BLOCK_SIZE..5 * BLOCK_SIZE], (ino - 1) as usize);
        }
    }

    fn write_inode_table(&self, image: &mut [u8]) -> Result<()> {
        for (&ino, rec) in &self.inodes {
            let off = INODE_TABLE_BLOCK as usize * BLOCK_SIZE + (ino as usize - 1) * INODE_SIZE;
            put16(image, off + 0x00, rec.mode);
            put16(image, off + 0x02, rec.uid);
            put32(image, off + 0x04, rec.size);
            put32(image, off + 0x10, rec.mtime);
            put16(image, off + 0x18, rec.gid);
            put16(image, off + 0x1A, rec.links_count);
            put32(image, off + 0x1C, rec.blocks);
            for (i, b) in rec.block.iter().enumerate() {
                put32(image, off + 0x28 + i * 4, *b);
            }
        }
        Ok(())
    }
}

/// Pack directory entries into 1K blocks with valid `rec_len` chaining.
fn pack_dir_blocks(entries: &[DirEnt]) -> Result<Vec<Vec<u8>>> {
    let mut blocks: Vec<Vec<u8>> = Vec::new();
    let mut current = vec![0_u8; BLOCK_SIZE];
    let mut off = 0_usize;
    let mut last_entry_off: Option<usize> = None;

    for entry in entries {
        let min_len = (8 + entry.name.len() + 3) & !3;
        if off + min_len > BLOCK_SIZE {
            stretch_last(&mut current, last_entry_off)?;
            blocks.push(current);
            current = vec![0_u8; BLOCK_SIZE];
            off = 0;
            last_entry_off = None;
        }

        put32(&mut current, off, entry.inode);
        put16(&mut current, off + 4, u16::try_from(min_len)?);
        current[off + 6] = u8::try_from(entry.name.len())?;
        current[off + 7] = entry.file_type;
        current[off + 8..off + 8 + entry.name.len()].copy_from_slice(&entry.name);
        last_entry_off = Some(off);
        off += min_len;
    }

    stretch_last(&mut current, last_entry_off)?;
    blocks.push(current);
    Ok(blocks)
}

/// Stretch the final entry's `rec_len` so the block tiles exactly.
fn stretch_last(block: &mut [u8], last_entry_off: Option<usize>) -> Result<()> {
    let Some(off) = last_entry_off else {
        bail!("directory block has no entries");
    };
    put16(block, off + 4, u16::try_from(BLOCK_SIZE - off)?);
    Ok(())
}

fn set_bit(bitmap: &mut [u8], index: usize) {
    bitmap[index / 8] |= 1 << (index % 8);
}

fn put16(bytes: &mut [u8], off: usize, v: u16) {
    bytes[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put32(bytes: &mut [u8], off: usize, v: u32) {
    bytes[off..off + 4].copy_from_slice(&v.to_le_bytes());
}
