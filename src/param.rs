//! Geometry of the simulated device and the fixed limits shared by every
//! subsystem. All of these values are observable in the on-disk formats,
//! so changing one changes the file layouts.

use static_assertions::const_assert;

/// Block number. Disk blocks are identified by index into the data file.
pub type BNum = u32;

/// Inode number.
pub type INum = u32;

/// Line number within a block.
pub type LNum = u8;

/// "No value" marker for block numbers.
pub const SENTINEL_BNUM: BNum = 0xFFFF_FFFF;

/// "No value" marker for inode numbers.
pub const SENTINEL_INUM: INum = 0xFFFF_FFFF;

/// Bytes per disk block.
pub const BLOCK_BYTES: usize = 4096;

/// Bytes per page (the in-memory image of a block).
pub const BYTES_PER_PAGE: usize = BLOCK_BYTES;

/// Bits per page.
pub const BITS_PER_PAGE: usize = BYTES_PER_PAGE * 8;

/// Bytes per line, the unit of modification.
pub const BYTES_PER_LINE: usize = 64;

/// Payload lines per page. The 64th line holds tail bytes and the CRC.
pub const LINES_PER_PAGE: usize = 63;

/// Bytes of the CRC trailer at the end of each block.
pub const CRC_BYTES: usize = 4;

/// Number of blocks on the simulated disk. Must be a multiple of 8.
pub const NUM_DISK_BLOCKS: usize = 256;

/// Number of page slots in the memory pool.
pub const NUM_MEM_SLOTS: usize = 32;

/// Pages worth of space in the journal file.
pub const PAGES_PER_JRNL: usize = 16;

/// Size of the journal file in bytes.
pub const JRNL_SIZE: usize = PAGES_PER_JRNL * BYTES_PER_PAGE;

/// Blocks of inode records in the inode table file.
pub const NUM_INODE_TBL_BLOCKS: usize = 2;

/// Inode records per table block.
pub const INODES_PER_BLOCK: usize = 64;

/// Total inode count.
pub const NUM_INODES: usize = NUM_INODE_TBL_BLOCKS * INODES_PER_BLOCK;

/// Direct block slots per inode.
pub const CT_INODE_BNUMS: usize = 9;

/// Indirect block slots per inode.
pub const CT_INODE_INDIRECTS: usize = 3;

/// Pages of bitmap in the free-list file (per bitmap).
pub const NUM_FREE_LIST_BLOCKS: usize = 1;

/// Pages of bitmap in the wipe list.
pub const NUM_WIPE_PAGES: usize = 1;

/// Dirty-block count at which the wipe list is ripe for a purge.
pub const DIRTY_BEFORE_WIPE: usize = 16;

/// Upper bound on blocks held by one file.
pub const MAX_BLOCKS_PER_FILE: usize = NUM_MEM_SLOTS * 2 - NUM_MEM_SLOTS / 2;

/// Change-log size at which a journal write is forced.
pub const CG_LOG_FULL: usize = BYTES_PER_PAGE * 2;

const_assert!(NUM_DISK_BLOCKS % 8 == 0);
const_assert!(BLOCK_BYTES == LINES_PER_PAGE * BYTES_PER_LINE + BYTES_PER_LINE);
const_assert!(JRNL_SIZE == 16 * 4096);
const_assert!(NUM_INODES == 128);
