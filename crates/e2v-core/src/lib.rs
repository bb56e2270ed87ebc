#![forbid(unsafe_code)]
//! Read-only ext2 navigation engine.
//!
//! [`Ext2Fs`] opens a classic ext2 image over any [`ByteDevice`], caches the
//! parsed superblock and group descriptor table, and exposes inode reads,
//! directory enumeration, absolute path resolution, and file content reads
//! through the direct and 1x/2x/3x indirect block chains.

use e2v_block::{read_superblock_region, ByteDevice, FileByteDevice};
use e2v_error::{E2Error, Result};
use e2v_ondisk::{
    dir_entries, lookup_in_dir_block, Ext2DirEntry, Ext2GroupDesc, Ext2Inode, Ext2Superblock,
};
use e2v_types::{
    read_le_u32, BlockNumber, BlockSize, ByteOffset, GroupNumber, InodeNumber, ParseError,
    EXT2_NDIR_BLOCKS,
};
use serde::Serialize;
use std::path::Path;
use tracing::{debug, trace};

/// Convert a parse-layer error into the user-facing error type.
///
/// The mapping policy is documented in `e2v-error`'s crate docs.
fn parse_to_e2(err: &ParseError) -> E2Error {
    match err {
        ParseError::InsufficientData { needed, offset, .. } => E2Error::ShortRead {
            offset: u64::try_from(*offset).unwrap_or(u64::MAX),
            needed: *needed,
        },
        ParseError::InvalidMagic { .. } | ParseError::InvalidField { .. } => {
            E2Error::Format(err.to_string())
        }
        ParseError::IntegerConversion { .. } => E2Error::Parse(err.to_string()),
    }
}

/// Options controlling how an image is opened.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Skip geometry validation after the superblock parses.
    ///
    /// The magic check always runs; this only disables the structural checks
    /// (group sizes, inode size, first data block).
    pub skip_validation: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            skip_validation: false,
        }
    }
}

/// Derived filesystem geometry, computed once at open time.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub block_size: BlockSize,
    pub blocks_count: u32,
    pub inodes_count: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub first_data_block: u32,
    pub groups_count: u32,
}

/// An opened ext2 filesystem.
///
/// The superblock and the full group descriptor table are read and parsed at
/// open time; everything else is read from the device on demand.
pub struct Ext2Fs {
    sb: Ext2Superblock,
    geometry: Geometry,
    group_descs: Vec<Ext2GroupDesc>,
    dev: Box<dyn ByteDevice>,
}

impl std::fmt::Debug for Ext2Fs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ext2Fs")
            .field("geometry", &self.geometry)
            .field("groups", &self.group_descs.len())
            .finish_non_exhaustive()
    }
}

impl Ext2Fs {
    /// Open an ext2 image at `path` with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, &OpenOptions::default())
    }

    /// Open an ext2 image with custom options.
    pub fn open_with_options(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Self> {
        let dev = FileByteDevice::open(path.as_ref())?;
        Self::from_device(Box::new(dev), options)
    }

    /// Open an ext2 filesystem from an already-opened device.
    pub fn from_device(dev: Box<dyn ByteDevice>, options: &OpenOptions) -> Result<Self> {
        let region = read_superblock_region(&*dev)?;
        let sb = Ext2Superblock::parse_superblock_region(&region).map_err(|e| parse_to_e2(&e))?;

        if !options.skip_validation {
            sb.validate_geometry()
                .map_err(|e| E2Error::InvalidGeometry(e.to_string()))?;
        }

        let block_size = BlockSize::new(sb.block_size).map_err(|e| parse_to_e2(&e))?;
        let geometry = Geometry {
            block_size,
            blocks_count: sb.blocks_count,
            inodes_count: sb.inodes_count,
            blocks_per_group: sb.blocks_per_group,
            inodes_per_group: sb.inodes_per_group,
            inode_size: sb.inode_size,
            first_data_block: sb.first_data_block,
            groups_count: sb.groups_count(),
        };

        // The descriptor table is contiguous after the superblock; load it
        // whole so later inode reads need no device round-trip for it.
        let mut group_descs = Vec::with_capacity(geometry.groups_count as usize);
        for group in 0..geometry.groups_count {
            let offset = sb
                .group_desc_offset(GroupNumber(group))
                .ok_or_else(|| E2Error::InvalidGeometry("group desc offset overflow".into()))?;
            let mut buf = [0_u8; e2v_types::EXT2_GROUP_DESC_SIZE];
            dev.read_exact_at(offset, &mut buf)?;
            group_descs.push(Ext2GroupDesc::parse_from_bytes(&buf).map_err(|e| parse_to_e2(&e))?);
        }

        debug!(
            block_size = geometry.block_size.get(),
            blocks = geometry.blocks_count,
            inodes = geometry.inodes_count,
            groups = geometry.groups_count,
            "opened ext2 image"
        );

        Ok(Self {
            sb,
            geometry,
            group_descs,
            dev,
        })
    }

    /// The parsed superblock.
    #[must_use]
    pub fn superblock(&self) -> &Ext2Superblock {
        &self.sb
    }

    /// Derived geometry.
    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Block size in bytes.
    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.geometry.block_size.get()
    }

    /// Device length in bytes.
    #[must_use]
    pub fn device_len(&self) -> u64 {
        self.dev.len_bytes()
    }

    /// The cached group descriptor for `group`.
    pub fn group_desc(&self, group: GroupNumber) -> Result<&Ext2GroupDesc> {
        self.group_descs
            .get(group.0 as usize)
            .ok_or_else(|| E2Error::InvalidGeometry(format!("group {group} out of range")))
    }

    /// All cached group descriptors, in group order.
    #[must_use]
    pub fn group_descs(&self) -> &[Ext2GroupDesc] {
        &self.group_descs
    }

    /// Read a full filesystem block from the device.
    pub fn read_block(&self, block: BlockNumber) -> Result<Vec<u8>> {
        if block.0 >= self.geometry.blocks_count {
            return Err(E2Error::Format(format!(
                "block {} out of range (blocks_count={})",
                block.0, self.geometry.blocks_count
            )));
        }
        e2v_block::read_block(&*self.dev, self.geometry.block_size, block)
    }

    /// Read an inode by number.
    ///
    /// Locates the record via pure address arithmetic (group, index, block,
    /// byte), reads it through the cached group descriptor's inode table
    /// pointer, and parses the 128-byte base record.
    pub fn read_inode(&self, ino: InodeNumber) -> Result<Ext2Inode> {
        if ino.0 == 0 || ino.0 > self.geometry.inodes_count {
            return Err(E2Error::InvalidInode(ino.0));
        }

        let loc = self.sb.locate_inode(ino).map_err(|e| parse_to_e2(&e))?;
        let gd = self.group_desc(loc.group)?;
        let abs_offset = self
            .sb
            .inode_device_offset(&loc, gd.inode_table)
            .map_err(|e| parse_to_e2(&e))?;

        trace!(ino = ino.0, group = loc.group.0, offset = abs_offset, "read inode");

        let mut buf = vec![0_u8; usize::from(self.geometry.inode_size)];
        self.dev.read_exact_at(abs_offset, &mut buf)?;
        Ext2Inode::parse_from_bytes(&buf).map_err(|e| parse_to_e2(&e))
    }

    // ── Block chain resolution ────────────────────────────────────────

    /// Resolve a logical file block to a physical block number through the
    /// inode's direct and indirect pointers.
    ///
    /// Returns `Ok(None)` when the logical block falls in a hole: a zero
    /// pointer at any level of the chain terminates resolution without error.
    pub fn resolve_block(&self, inode: &Ext2Inode, logical_block: u32) -> Result<Option<BlockNumber>> {
        let ppb = self.geometry.block_size.pointers_per_block();
        let lb = logical_block;

        // Direct pointers cover logical blocks 0..12.
        if (lb as usize) < EXT2_NDIR_BLOCKS {
            return Ok(nonzero_block(inode.block[lb as usize]));
        }
        let lb = lb - EXT2_NDIR_BLOCKS as u32;

        // Single indirect: one pointer block.
        if lb < ppb {
            return self.walk_chain(inode.single_indirect(), &[lb]);
        }
        let lb = lb - ppb;

        // Double indirect: ppb^2 blocks.
        if let Some(limit) = ppb.checked_mul(ppb) {
            if lb < limit {
                return self.walk_chain(inode.double_indirect(), &[lb / ppb, lb % ppb]);
            }
            let lb = lb - limit;

            // Triple indirect: ppb^3 blocks. The index math stays in u64 to
            // survive 4K blocks where ppb^3 overflows u32.
            let lb = u64::from(lb);
            let ppb64 = u64::from(ppb);
            let limit3 = ppb64 * ppb64 * ppb64;
            if lb < limit3 {
                let i0 = u32::try_from(lb / (ppb64 * ppb64))
                    .map_err(|_| E2Error::Parse("triple-indirect index overflow".into()))?;
                let rem = lb % (ppb64 * ppb64);
                let i1 = u32::try_from(rem / ppb64)
                    .map_err(|_| E2Error::Parse("triple-indirect index overflow".into()))?;
                let i2 = u32::try_from(rem % ppb64)
                    .map_err(|_| E2Error::Parse("triple-indirect index overflow".into()))?;
                return self.walk_chain(inode.triple_indirect(), &[i0, i1, i2]);
            }
        }

        Err(E2Error::Format(format!(
            "logical block {logical_block} beyond triple-indirect range"
        )))
    }

    /// Follow a chain of pointer blocks, one index per level.
    ///
    /// `start` is the inode's indirect pointer for this chain; each index in
    /// `indices` selects a u32 slot in the pointer block at that level.
    fn walk_chain(&self, start: u32, indices: &[u32]) -> Result<Option<BlockNumber>> {
        let mut current = start;
        for idx in indices {
            if current == 0 {
                return Ok(None);
            }
            let block = self.read_block(BlockNumber(current))?;
            current = read_le_u32(&block, (*idx as usize) * 4).map_err(|e| parse_to_e2(&e))?;
        }
        Ok(nonzero_block(current))
    }

    // ── File content reading ──────────────────────────────────────────

    /// Read file data starting at `offset` into `buf`.
    ///
    /// Reads stop at the inode's declared size. Holes (zero pointers at any
    /// chain level) read as zeroes. Returns the number of bytes read.
    pub fn read_file_data(&self, inode: &Ext2Inode, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let file_size = u64::from(inode.size);
        if offset >= file_size {
            return Ok(0);
        }

        let available = file_size - offset;
        let buf_len = u64::try_from(buf.len()).unwrap_or(u64::MAX);
        let to_read = usize::try_from(available.min(buf_len))
            .map_err(|_| E2Error::Parse("read length overflows usize".into()))?;

        let bs = u64::from(self.block_size());
        let bs_usize = self.block_size() as usize;
        let mut bytes_read = 0_usize;

        while bytes_read < to_read {
            let current_offset = offset + bytes_read as u64;
            let logical_block = u32::try_from(current_offset / bs)
                .map_err(|_| E2Error::Parse("logical block number overflow".into()))?;
            let offset_in_block = (current_offset % bs) as usize;
            let remaining_in_block = bs_usize - offset_in_block;
            let chunk_size = remaining_in_block.min(to_read - bytes_read);

            match self.resolve_block(inode, logical_block)? {
                Some(phys) => {
                    let block_data = self.read_block(phys)?;
                    buf[bytes_read..bytes_read + chunk_size].copy_from_slice(
                        &block_data[offset_in_block..offset_in_block + chunk_size],
                    );
                }
                None => {
                    buf[bytes_read..bytes_read + chunk_size].fill(0);
                }
            }

            bytes_read += chunk_size;
        }

        Ok(bytes_read)
    }

    /// Read a file's full contents by inode number.
    ///
    /// Returns `E2Error::IsDirectory` if the inode is a directory.
    pub fn read_file(&self, ino: InodeNumber) -> Result<Vec<u8>> {
        let inode = self.read_inode(ino)?;
        if inode.is_dir() {
            return Err(E2Error::IsDirectory);
        }
        let len = inode.size as usize;
        let mut buf = vec![0_u8; len];
        let n = self.read_file_data(&inode, 0, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    // ── Directory operations ──────────────────────────────────────────

    /// Read all live directory entries from a directory inode, in on-disk
    /// order across the directory's data blocks.
    ///
    /// Unused slots (`inode == 0`) are filtered out.
    pub fn read_dir(&self, inode: &Ext2Inode) -> Result<Vec<Ext2DirEntry>> {
        if !inode.is_dir() {
            return Err(E2Error::NotDirectory);
        }

        let num_blocks = dir_block_count(u64::from(inode.size), u64::from(self.block_size()))?;
        let mut all_entries = Vec::new();

        for lb in 0..num_blocks {
            let Some(phys) = self.resolve_block(inode, lb)? else {
                continue;
            };
            let block_data = self.read_block(phys)?;
            for entry in dir_entries(&block_data) {
                let entry = entry.map_err(|e| parse_to_e2(&e))?;
                if !entry.is_unused() {
                    all_entries.push(entry);
                }
            }
        }

        Ok(all_entries)
    }

    /// Look up a single name in a directory inode.
    ///
    /// The first live entry with an exact byte-for-byte name match wins.
    pub fn lookup_name(&self, dir_inode: &Ext2Inode, name: &[u8]) -> Result<Option<Ext2DirEntry>> {
        let num_blocks = dir_block_count(u64::from(dir_inode.size), u64::from(self.block_size()))?;

        for lb in 0..num_blocks {
            let Some(phys) = self.resolve_block(dir_inode, lb)? else {
                continue;
            };
            let block_data = self.read_block(phys)?;
            if let Some(entry) =
                lookup_in_dir_block(&block_data, name).map_err(|e| parse_to_e2(&e))?
            {
                return Ok(Some(entry));
            }
        }

        Ok(None)
    }

    // ── Path resolution ───────────────────────────────────────────────

    /// Resolve an absolute path to an inode number and parsed inode.
    ///
    /// Walks from the root directory (inode 2), looking up each component.
    /// Empty components (leading, trailing, or doubled slashes) are skipped,
    /// so `/`, `//a`, and `/a/` behave like their normalized forms. `.` and
    /// `..` resolve through the directory's own on-disk entries.
    ///
    /// Returns `E2Error::NotFound` naming the missing component, or
    /// `E2Error::NotDirectory` when a lookup would descend through a
    /// non-directory.
    pub fn resolve_path(&self, path: &str) -> Result<(InodeNumber, Ext2Inode)> {
        if !path.starts_with('/') {
            return Err(E2Error::Format("path must be absolute (start with /)".into()));
        }

        let mut current_ino = InodeNumber::ROOT;
        let mut current_inode = self.read_inode(current_ino)?;

        for component in path.split('/').filter(|c| !c.is_empty()) {
            if !current_inode.is_dir() {
                return Err(E2Error::NotDirectory);
            }

            trace!(component, ino = current_ino.0, "resolve path component");

            let entry = self
                .lookup_name(&current_inode, component.as_bytes())?
                .ok_or_else(|| E2Error::NotFound(component.to_owned()))?;

            current_ino = InodeNumber(entry.inode);
            current_inode = self.read_inode(current_ino)?;
        }

        Ok((current_ino, current_inode))
    }

    // ── Summary views ─────────────────────────────────────────────────

    /// Build the diagnostic summary of the superblock and every group
    /// descriptor, for the `info` presentation.
    #[must_use]
    pub fn summary(&self) -> FsSummary {
        FsSummary {
            volume_name: self.sb.volume_name.clone(),
            uuid: hex_uuid(&self.sb.uuid),
            block_size: self.block_size(),
            blocks_count: self.sb.blocks_count,
            inodes_count: self.sb.inodes_count,
            free_blocks_count: self.sb.free_blocks_count,
            free_inodes_count: self.sb.free_inodes_count,
            first_data_block: self.sb.first_data_block,
            blocks_per_group: self.sb.blocks_per_group,
            inodes_per_group: self.sb.inodes_per_group,
            inode_size: self.sb.inode_size,
            inodes_per_block: self.sb.inodes_per_block(),
            fs_bytes: u64::from(self.sb.blocks_count) * u64::from(self.block_size()),
            groups_count: self.geometry.groups_count,
            rev_level: self.sb.rev_level,
            state: self.sb.state,
            mtime: self.sb.mtime,
            wtime: self.sb.wtime,
            last_mounted: self.sb.last_mounted.clone(),
            groups: self
                .group_descs
                .iter()
                .enumerate()
                .map(|(i, gd)| GroupSummary {
                    group: u32::try_from(i).unwrap_or(u32::MAX),
                    block_bitmap: gd.block_bitmap,
                    inode_bitmap: gd.inode_bitmap,
                    inode_table: gd.inode_table,
                    free_blocks_count: gd.free_blocks_count,
                    free_inodes_count: gd.free_inodes_count,
                    used_dirs_count: gd.used_dirs_count,
                })
                .collect(),
        }
    }

    /// Byte offset of a block, for diagnostics.
    #[must_use]
    pub fn block_offset(&self, block: BlockNumber) -> ByteOffset {
        self.geometry.block_size.block_to_byte(block)
    }
}

#[inline]
fn nonzero_block(raw: u32) -> Option<BlockNumber> {
    (raw != 0).then_some(BlockNumber(raw))
}

/// Number of logical blocks spanned by a directory of `file_size` bytes.
fn dir_block_count(file_size: u64, block_size: u64) -> Result<u32> {
    let num = file_size.div_ceil(block_size);
    u32::try_from(num).map_err(|_| E2Error::Parse("directory block count overflow".into()))
}

fn hex_uuid(uuid: &[u8; 16]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(36);
    for (i, byte) in uuid.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            out.push('-');
        }
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Serializable superblock + group descriptor summary for the `info` view.
#[derive(Debug, Clone, Serialize)]
pub struct FsSummary {
    pub volume_name: String,
    pub uuid: String,
    pub block_size: u32,
    pub blocks_count: u32,
    pub inodes_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub inodes_per_block: u32,
    pub fs_bytes: u64,
    pub groups_count: u32,
    pub rev_level: u32,
    pub state: u16,
    pub mtime: u32,
    pub wtime: u32,
    pub last_mounted: String,
    pub groups: Vec<GroupSummary>,
}

/// One group descriptor's summary row.
#[derive(Debug, Clone, Serialize)]
pub struct GroupSummary {
    pub group: u32,
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}
