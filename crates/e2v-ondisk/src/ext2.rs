#![forbid(unsafe_code)]

use e2v_types::{
    ensure_slice, inode_index_in_group, inode_to_group, read_fixed, read_le_u16, read_le_u32,
    trim_nul_padded, GroupNumber, InodeNumber, ParseError, EXT2_GOOD_OLD_INODE_SIZE,
    EXT2_GOOD_OLD_REV, EXT2_GROUP_DESC_SIZE, EXT2_N_BLOCKS, EXT2_SUPERBLOCK_OFFSET,
    EXT2_SUPERBLOCK_SIZE, EXT2_SUPER_MAGIC, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT,
    S_IFREG, S_IFSOCK,
};
use serde::{Deserialize, Serialize};

/// Parsed ext2 superblock.
///
/// Field names follow the on-disk `s_*` naming minus the prefix. `block_size`
/// is derived from `s_log_block_size` at parse time (`1024 << shift`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2Superblock {
    // ── Core geometry ────────────────────────────────────────────────────
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub r_blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub block_size: u32,
    pub blocks_per_group: u32,
    pub frags_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub first_ino: u32,

    // ── Identity ─────────────────────────────────────────────────────────
    pub magic: u16,
    pub uuid: [u8; 16],
    pub volume_name: String,
    pub last_mounted: String,

    // ── Revision & OS ────────────────────────────────────────────────────
    pub rev_level: u32,
    pub minor_rev_level: u16,
    pub creator_os: u32,

    // ── State ────────────────────────────────────────────────────────────
    pub state: u16,
    pub errors: u16,
    pub mnt_count: u16,
    pub max_mnt_count: u16,

    // ── Timestamps ───────────────────────────────────────────────────────
    pub mtime: u32,
    pub wtime: u32,
    pub lastcheck: u32,
    pub checkinterval: u32,
}

impl Ext2Superblock {
    /// Parse an ext2 superblock from a 1024-byte superblock region.
    ///
    /// The region starts at byte 1024 of the image (after the boot block).
    /// The magic signature is validated first; a mismatch is
    /// `ParseError::InvalidMagic` with no fallback parsing.
    pub fn parse_superblock_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < EXT2_SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: EXT2_SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u16(region, 0x38)?;
        if magic != EXT2_SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: EXT2_SUPER_MAGIC,
                actual: magic,
            });
        }

        let log_block_size = read_le_u32(region, 0x18)?;
        if log_block_size > 2 {
            return Err(ParseError::InvalidField {
                field: "s_log_block_size",
                reason: "unsupported block size (classic ext2 is 1K/2K/4K)",
            });
        }
        let block_size = 1024_u32 << log_block_size;

        let rev_level = read_le_u32(region, 0x4C)?;
        // Revision 0 predates dynamic inode sizes; the s_inode_size field
        // is not meaningful there.
        let inode_size = if rev_level == EXT2_GOOD_OLD_REV {
            EXT2_GOOD_OLD_INODE_SIZE
        } else {
            read_le_u16(region, 0x58)?
        };

        Ok(Self {
            inodes_count: read_le_u32(region, 0x00)?,
            blocks_count: read_le_u32(region, 0x04)?,
            r_blocks_count: read_le_u32(region, 0x08)?,
            free_blocks_count: read_le_u32(region, 0x0C)?,
            free_inodes_count: read_le_u32(region, 0x10)?,
            first_data_block: read_le_u32(region, 0x14)?,
            block_size,
            blocks_per_group: read_le_u32(region, 0x20)?,
            frags_per_group: read_le_u32(region, 0x24)?,
            inodes_per_group: read_le_u32(region, 0x28)?,
            inode_size,
            first_ino: read_le_u32(region, 0x54)?,

            magic,
            uuid: read_fixed::<16>(region, 0x68)?,
            volume_name: trim_nul_padded(&read_fixed::<16>(region, 0x78)?),
            last_mounted: trim_nul_padded(&read_fixed::<64>(region, 0x88)?),

            rev_level,
            minor_rev_level: read_le_u16(region, 0x3E)?,
            creator_os: read_le_u32(region, 0x48)?,

            state: read_le_u16(region, 0x3A)?,
            errors: read_le_u16(region, 0x3C)?,
            mnt_count: read_le_u16(region, 0x34)?,
            max_mnt_count: read_le_u16(region, 0x36)?,

            mtime: read_le_u32(region, 0x2C)?,
            wtime: read_le_u32(region, 0x30)?,
            lastcheck: read_le_u32(region, 0x40)?,
            checkinterval: read_le_u32(region, 0x44)?,
        })
    }

    /// Parse an ext2 superblock from a full disk image.
    pub fn parse_from_image(image: &[u8]) -> Result<Self, ParseError> {
        let end = EXT2_SUPERBLOCK_OFFSET + EXT2_SUPERBLOCK_SIZE;
        if image.len() < end {
            return Err(ParseError::InsufficientData {
                needed: EXT2_SUPERBLOCK_SIZE,
                offset: EXT2_SUPERBLOCK_OFFSET,
                actual: image.len().saturating_sub(EXT2_SUPERBLOCK_OFFSET),
            });
        }
        Self::parse_superblock_region(&image[EXT2_SUPERBLOCK_OFFSET..end])
    }

    /// Number of inode records per filesystem block.
    #[must_use]
    pub fn inodes_per_block(&self) -> u32 {
        self.block_size / u32::from(self.inode_size)
    }

    /// Number of block groups in this filesystem.
    ///
    /// Computed as `ceil((blocks_count - first_data_block) / blocks_per_group)`.
    /// The two historical formulas for this value disagreed; this crate uses
    /// the ceiling form exclusively.
    #[must_use]
    pub fn groups_count(&self) -> u32 {
        if self.blocks_per_group == 0 {
            return 0;
        }
        let data_blocks = self.blocks_count.saturating_sub(self.first_data_block);
        data_blocks.div_ceil(self.blocks_per_group)
    }

    /// First block of the group descriptor table.
    ///
    /// The table occupies the block immediately after the superblock:
    /// block 2 for 1K blocks (where the superblock is block 1), block 1
    /// for larger block sizes (where the superblock sits inside block 0).
    #[must_use]
    pub fn group_desc_start_block(&self) -> u32 {
        self.first_data_block + 1
    }

    /// Byte offset of a group descriptor within the image.
    #[must_use]
    pub fn group_desc_offset(&self, group: GroupNumber) -> Option<u64> {
        let table_start =
            u64::from(self.group_desc_start_block()).checked_mul(u64::from(self.block_size))?;
        let desc_offset = u64::from(group.0).checked_mul(EXT2_GROUP_DESC_SIZE as u64)?;
        table_start.checked_add(desc_offset)
    }

    /// Locate an inode record within its group's inode table.
    ///
    /// Pure address arithmetic; rejects out-of-range inode numbers (zero or
    /// greater than `inodes_count`) before computing anything.
    pub fn locate_inode(&self, ino: InodeNumber) -> Result<InodeLocation, ParseError> {
        if ino.0 == 0 || ino.0 > self.inodes_count {
            return Err(ParseError::InvalidField {
                field: "inode_number",
                reason: "zero or exceeds inodes_count",
            });
        }
        if self.inodes_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "cannot be zero",
            });
        }

        let group = inode_to_group(ino, self.inodes_per_group);
        let index_in_group = inode_index_in_group(ino, self.inodes_per_group);
        let block_in_group = index_in_group / self.inodes_per_block();
        let byte_in_block =
            u64::from(index_in_group % self.inodes_per_block()) * u64::from(self.inode_size);

        Ok(InodeLocation {
            group,
            index_in_group,
            block_in_group,
            byte_in_block,
        })
    }

    /// Absolute byte offset of an inode record, given the inode table's
    /// starting block from the group descriptor.
    pub fn inode_device_offset(
        &self,
        loc: &InodeLocation,
        inode_table_block: u32,
    ) -> Result<u64, ParseError> {
        let table_block = u64::from(inode_table_block)
            .checked_add(u64::from(loc.block_in_group))
            .ok_or(ParseError::IntegerConversion {
                field: "inode_table_block",
            })?;
        table_block
            .checked_mul(u64::from(self.block_size))
            .and_then(|base| base.checked_add(loc.byte_in_block))
            .ok_or(ParseError::IntegerConversion {
                field: "inode_offset",
            })
    }

    /// Validate basic geometry: group sizes, inode size, first data block.
    pub fn validate_geometry(&self) -> Result<(), ParseError> {
        if self.blocks_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "cannot be zero",
            });
        }
        if self.blocks_per_group > self.block_size.saturating_mul(8) {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "exceeds block_size * 8 (block bitmap capacity)",
            });
        }
        if self.inodes_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "cannot be zero",
            });
        }
        if self.inodes_per_group > self.block_size.saturating_mul(8) {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "exceeds block_size * 8 (inode bitmap capacity)",
            });
        }
        if self.inode_size < 128 || !self.inode_size.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "must be a power of two >= 128",
            });
        }
        if u32::from(self.inode_size) > self.block_size {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "inode_size exceeds block_size",
            });
        }
        if self.block_size == 1024 && self.first_data_block != 1 {
            return Err(ParseError::InvalidField {
                field: "s_first_data_block",
                reason: "must be 1 for 1K block size",
            });
        }
        if self.block_size > 1024 && self.first_data_block != 0 {
            return Err(ParseError::InvalidField {
                field: "s_first_data_block",
                reason: "must be 0 for block sizes > 1K",
            });
        }
        if self.first_data_block >= self.blocks_count {
            return Err(ParseError::InvalidField {
                field: "s_first_data_block",
                reason: "first_data_block >= blocks_count",
            });
        }
        if self.groups_count() == 0 {
            return Err(ParseError::InvalidField {
                field: "s_blocks_count",
                reason: "zero block groups (blocks_count too small)",
            });
        }
        Ok(())
    }
}

/// Where an inode record lives, relative to its group's inode table.
///
/// Produced by [`Ext2Superblock::locate_inode`]; the caller reads the group
/// descriptor to find the inode table's starting block, then computes the
/// absolute offset via [`Ext2Superblock::inode_device_offset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeLocation {
    pub group: GroupNumber,
    pub index_in_group: u32,
    pub block_in_group: u32,
    pub byte_in_block: u64,
}

/// Parsed ext2 group descriptor (32 bytes on disk).
///
/// The engine consumes only `inode_table`; the bitmap fields are parsed for
/// the diagnostic summary view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2GroupDesc {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}

impl Ext2GroupDesc {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < EXT2_GROUP_DESC_SIZE {
            return Err(ParseError::InsufficientData {
                needed: EXT2_GROUP_DESC_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }

        Ok(Self {
            block_bitmap: read_le_u32(bytes, 0x00)?,
            inode_bitmap: read_le_u32(bytes, 0x04)?,
            inode_table: read_le_u32(bytes, 0x08)?,
            free_blocks_count: read_le_u16(bytes, 0x0C)?,
            free_inodes_count: read_le_u16(bytes, 0x0E)?,
            used_dirs_count: read_le_u16(bytes, 0x10)?,
        })
    }
}

/// Parsed ext2 inode record.
///
/// The fifteen `block` pointers are the raw on-disk values: indices 0-11
/// address data blocks directly, 12 is single-indirect, 13 double-indirect,
/// 14 triple-indirect. A zero pointer means "unallocated/hole".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2Inode {
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    pub size: u32,
    pub links_count: u16,
    /// Allocated block count in 512-byte units (not filesystem blocks).
    pub blocks: u32,
    pub flags: u32,
    pub generation: u32,

    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,

    pub block: [u32; EXT2_N_BLOCKS],
}

impl Ext2Inode {
    /// Parse an ext2 inode from raw bytes (requires the base 128 bytes).
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < 128 {
            return Err(ParseError::InsufficientData {
                needed: 128,
                offset: 0,
                actual: bytes.len(),
            });
        }

        let mut block = [0_u32; EXT2_N_BLOCKS];
        for (i, slot) in block.iter_mut().enumerate() {
            *slot = read_le_u32(bytes, 0x28 + i * 4)?;
        }

        Ok(Self {
            mode: read_le_u16(bytes, 0x00)?,
            uid: read_le_u16(bytes, 0x02)?,
            gid: read_le_u16(bytes, 0x18)?,
            size: read_le_u32(bytes, 0x04)?,
            links_count: read_le_u16(bytes, 0x1A)?,
            blocks: read_le_u32(bytes, 0x1C)?,
            flags: read_le_u32(bytes, 0x20)?,
            generation: read_le_u32(bytes, 0x64)?,

            atime: read_le_u32(bytes, 0x08)?,
            ctime: read_le_u32(bytes, 0x0C)?,
            mtime: read_le_u32(bytes, 0x10)?,
            dtime: read_le_u32(bytes, 0x14)?,

            block,
        })
    }

    /// Extract the file type bits from the mode field.
    #[must_use]
    pub fn file_type_mode(&self) -> u16 {
        self.mode & S_IFMT
    }

    /// Whether this inode is a regular file.
    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.file_type_mode() == S_IFREG
    }

    /// Whether this inode is a directory.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.file_type_mode() == S_IFDIR
    }

    /// Whether this inode is a symbolic link.
    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.file_type_mode() == S_IFLNK
    }

    /// Permission bits (lower 12 bits of mode).
    #[must_use]
    pub fn permission_bits(&self) -> u16 {
        self.mode & 0o7777
    }

    /// The twelve direct block pointers.
    #[must_use]
    pub fn direct_blocks(&self) -> &[u32] {
        &self.block[..e2v_types::EXT2_NDIR_BLOCKS]
    }

    /// Single-indirect pointer (slot 12).
    #[must_use]
    pub fn single_indirect(&self) -> u32 {
        self.block[e2v_types::EXT2_IND_BLOCK]
    }

    /// Double-indirect pointer (slot 13).
    #[must_use]
    pub fn double_indirect(&self) -> u32 {
        self.block[e2v_types::EXT2_DIND_BLOCK]
    }

    /// Triple-indirect pointer (slot 14).
    #[must_use]
    pub fn triple_indirect(&self) -> u32 {
        self.block[e2v_types::EXT2_TIND_BLOCK]
    }

    /// Advisory sparse-file hint: declared size exceeds what the allocated
    /// 512-byte sectors can hold.
    ///
    /// This is unreliable — `i_blocks` also counts indirection blocks, so a
    /// large fully-allocated file can trip it in either direction. Reported
    /// as metadata only; block-chain reading never consults it.
    #[must_use]
    pub fn sparse_hint(&self) -> bool {
        u64::from(self.size) > u64::from(self.blocks) * 512
    }
}

// ── Directory entry parsing ─────────────────────────────────────────────────

/// File type tag stored in a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Ext2FileType {
    Unknown = 0,
    RegFile = 1,
    Dir = 2,
    Chrdev = 3,
    Blkdev = 4,
    Fifo = 5,
    Sock = 6,
    Symlink = 7,
}

impl Ext2FileType {
    #[must_use]
    pub fn from_raw(val: u8) -> Self {
        match val {
            1 => Self::RegFile,
            2 => Self::Dir,
            3 => Self::Chrdev,
            4 => Self::Blkdev,
            5 => Self::Fifo,
            6 => Self::Sock,
            7 => Self::Symlink,
            _ => Self::Unknown,
        }
    }

    /// Map an inode mode's type bits to the directory entry tag.
    #[must_use]
    pub fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            S_IFREG => Self::RegFile,
            S_IFDIR => Self::Dir,
            S_IFCHR => Self::Chrdev,
            S_IFBLK => Self::Blkdev,
            S_IFIFO => Self::Fifo,
            S_IFSOCK => Self::Sock,
            S_IFLNK => Self::Symlink,
            _ => Self::Unknown,
        }
    }
}

/// A parsed ext2 directory entry (`ext2_dir_entry_2`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2DirEntry {
    pub inode: u32,
    /// Byte span of this entry including padding; consecutive spans in a
    /// block sum exactly to the block size.
    pub rec_len: u16,
    pub name_len: u8,
    pub file_type: Ext2FileType,
    pub name: Vec<u8>,
}

impl Ext2DirEntry {
    /// Whether this slot is unused (deleted entry or padding); such entries
    /// are surfaced by the enumerator but carry no live child.
    #[must_use]
    pub fn is_unused(&self) -> bool {
        self.inode == 0
    }

    /// Return the name as a UTF-8 string (lossy).
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// On-disk directory entry header size.
const DIR_ENTRY_HEADER_LEN: usize = 8;

/// Lazy iterator over the directory entries of a single data block.
///
/// Restartable: construct a fresh iterator to traverse again. Termination is
/// driven by the cursor reaching the end of the block (the final entry's
/// `rec_len` spans to the block boundary); there is no sentinel entry.
/// Unused slots (`inode == 0`) are yielded so callers can skip them.
#[derive(Debug, Clone)]
pub struct DirBlockEntries<'a> {
    block: &'a [u8],
    offset: usize,
    failed: bool,
}

/// Iterate the directory entries of one directory data block.
///
/// The slice must be exactly one block long; the block boundary is the
/// authoritative end condition.
#[must_use]
pub fn dir_entries(block: &[u8]) -> DirBlockEntries<'_> {
    DirBlockEntries {
        block,
        offset: 0,
        failed: false,
    }
}

impl<'a> Iterator for DirBlockEntries<'a> {
    type Item = Result<Ext2DirEntry, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.block.len() {
            return None;
        }
        match self.parse_next() {
            Ok(entry) => Some(Ok(entry)),
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

impl<'a> DirBlockEntries<'a> {
    fn parse_next(&mut self) -> Result<Ext2DirEntry, ParseError> {
        let off = self.offset;
        let inode = read_le_u32(self.block, off)?;
        let rec_len = read_le_u16(self.block, off + 4)?;
        let name_len = ensure_slice(self.block, off + 6, 1)?[0];
        let file_type_raw = ensure_slice(self.block, off + 7, 1)?[0];

        let rec_len_usize = usize::from(rec_len);
        if rec_len_usize < DIR_ENTRY_HEADER_LEN || rec_len_usize % 4 != 0 {
            return Err(ParseError::InvalidField {
                field: "rec_len",
                reason: "must be a 4-byte-aligned value >= 8",
            });
        }
        let entry_end = off + rec_len_usize;
        if entry_end > self.block.len() {
            return Err(ParseError::InvalidField {
                field: "rec_len",
                reason: "entry extends past block boundary",
            });
        }
        if DIR_ENTRY_HEADER_LEN + usize::from(name_len) > rec_len_usize {
            return Err(ParseError::InvalidField {
                field: "name_len",
                reason: "name does not fit in rec_len",
            });
        }

        let name =
            ensure_slice(self.block, off + DIR_ENTRY_HEADER_LEN, usize::from(name_len))?.to_vec();

        self.offset = entry_end;

        Ok(Ext2DirEntry {
            inode,
            rec_len,
            name_len,
            file_type: Ext2FileType::from_raw(file_type_raw),
            name,
        })
    }
}

/// Collect all directory entries from a single directory data block.
pub fn parse_dir_block(block: &[u8]) -> Result<Vec<Ext2DirEntry>, ParseError> {
    dir_entries(block).collect()
}

/// Look up a name in a single directory data block.
///
/// Unused slots are skipped; the first live entry with a matching name wins.
pub fn lookup_in_dir_block(block: &[u8], name: &[u8]) -> Result<Option<Ext2DirEntry>, ParseError> {
    for entry in dir_entries(block) {
        let entry = entry?;
        if !entry.is_unused() && entry.name == name {
            return Ok(Some(entry));
        }
    }
    Ok(None)
}
