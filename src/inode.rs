//! Inodes.
//!
//! A file here is an unnamed bag of blocks identified by its inode
//! number. The table is fixed: an availability bitmap followed by
//! `NUM_INODES` 64-byte records, each holding the direct block slots, a
//! lock owner, a creation time, the indirect slots, and the record's own
//! number. The whole table lives in RAM and is persisted wholesale via
//! the atomic-replace discipline whenever it has been modified.
//!
//! Record layout (all little-endian):
//! `b_nums[9] u32 | lkd u32 | cr_time u64 | indirect[3] u32 | i_num u32`

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{info, warn};
use static_assertions::const_assert;

use crate::clock::Clock;
use crate::error::Result;
use crate::param::{
    BNum, INum, BLOCK_BYTES, CT_INODE_BNUMS, CT_INODE_INDIRECTS, INODES_PER_BLOCK,
    NUM_INODE_TBL_BLOCKS, NUM_INODES, SENTINEL_BNUM, SENTINEL_INUM,
};
use crate::status::replace_file;
use crate::util::BitArray;

/// On-disk size of one inode record.
pub const INODE_REC_BYTES: usize = 4 * CT_INODE_BNUMS + 4 + 8 + 4 * CT_INODE_INDIRECTS + 4;

const_assert!(INODE_REC_BYTES == 64);
const_assert!(INODE_REC_BYTES * INODES_PER_BLOCK == BLOCK_BYTES);

/// Byte length of the availability bitmap in the table file.
pub const AVAIL_BYTES: usize = NUM_INODES / 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Inode {
    pub b_nums: [BNum; CT_INODE_BNUMS],
    pub lkd: INum,
    pub cr_time: u64,
    pub indirect: [BNum; CT_INODE_INDIRECTS],
    pub i_num: INum,
}

impl Inode {
    pub fn new() -> Self {
        Inode {
            b_nums: [SENTINEL_BNUM; CT_INODE_BNUMS],
            lkd: SENTINEL_INUM,
            cr_time: 0,
            indirect: [SENTINEL_BNUM; CT_INODE_INDIRECTS],
            i_num: SENTINEL_INUM,
        }
    }
}

impl Default for Inode {
    fn default() -> Self {
        Inode::new()
    }
}

pub struct InodeTable {
    path: PathBuf,
    avail: BitArray,
    tbl: Vec<Inode>,
    modified: bool,
    clock: Clock,
}

impl InodeTable {
    /// Loads the table from its file, or starts fresh (every inode
    /// available) when the file does not exist yet.
    pub fn new(path: &Path, clock: Clock) -> Result<Self> {
        let mut avail =
            BitArray::new(NUM_INODE_TBL_BLOCKS, INODES_PER_BLOCK).expect("table dimensions are fixed");
        avail.set_all();
        let mut table = InodeTable {
            path: path.to_path_buf(),
            avail,
            tbl: vec![Inode::new(); NUM_INODES],
            modified: false,
            clock,
        };
        if path.exists() {
            table.load()?;
        } else {
            info!(
                "inode table file not found, starting with all inodes available"
            );
        }
        Ok(table)
    }

    fn load(&mut self) -> Result<()> {
        let mut r = BufReader::new(File::open(&self.path)?);
        let mut avail_bytes = [0u8; AVAIL_BYTES];
        r.read_exact(&mut avail_bytes)?;
        self.avail = BitArray::from_bytes(&avail_bytes, NUM_INODE_TBL_BLOCKS, INODES_PER_BLOCK)?;
        for node in &mut self.tbl {
            for b in &mut node.b_nums {
                *b = r.read_u32::<LittleEndian>()?;
            }
            node.lkd = r.read_u32::<LittleEndian>()?;
            node.cr_time = r.read_u64::<LittleEndian>()?;
            for b in &mut node.indirect {
                *b = r.read_u32::<LittleEndian>()?;
            }
            node.i_num = r.read_u32::<LittleEndian>()?;
        }
        Ok(())
    }

    /// Persists the bitmap and every record through a tmp+rename replace.
    pub fn store(&mut self) -> Result<()> {
        let avail_bytes = self.avail.to_bytes();
        let tbl = &self.tbl;
        replace_file(&self.path, |f| {
            let mut w = BufWriter::new(f);
            w.write_all(&avail_bytes)?;
            for node in tbl {
                for b in &node.b_nums {
                    w.write_u32::<LittleEndian>(*b)?;
                }
                w.write_u32::<LittleEndian>(node.lkd)?;
                w.write_u64::<LittleEndian>(node.cr_time)?;
                for b in &node.indirect {
                    w.write_u32::<LittleEndian>(*b)?;
                }
                w.write_u32::<LittleEndian>(node.i_num)?;
            }
            w.flush()
        })?;
        info!("inode table stored");
        Ok(())
    }

    /// Persists only if something changed since the last store.
    pub fn ensure_stored(&mut self) -> Result<()> {
        if self.modified {
            self.store()?;
            self.modified = false;
        }
        Ok(())
    }

    pub fn node(&self, i_num: INum) -> &Inode {
        &self.tbl[i_num as usize]
    }

    /// Reserves the lowest available inode, stamping its creation time.
    /// Returns the sentinel when the table is full.
    pub fn assign_inode(&mut self) -> INum {
        for ix in 0..NUM_INODES {
            if self.avail.test(ix) {
                self.avail.reset(ix);
                let now = self.clock.now_epoch_ms();
                let node = &mut self.tbl[ix];
                node.cr_time = now;
                node.i_num = ix as INum;
                self.modified = true;
                return ix as INum;
            }
        }
        warn!("no available inodes");
        SENTINEL_INUM
    }

    /// Returns an inode to the available pool, dropping its block
    /// references. A sentinel argument is a no-op.
    pub fn release_inode(&mut self, i_num: INum) {
        if i_num == SENTINEL_INUM {
            return;
        }
        let node = &mut self.tbl[i_num as usize];
        node.b_nums = [SENTINEL_BNUM; CT_INODE_BNUMS];
        node.indirect = [SENTINEL_BNUM; CT_INODE_INDIRECTS];
        node.cr_time = 0;
        self.avail.set(i_num as usize);
        self.modified = true;
    }

    /// Writes `blk` into the first free direct slot. False if the inode
    /// already holds its maximum.
    pub fn assign_block(&mut self, i_num: INum, blk: BNum) -> bool {
        assert_ne!(i_num, SENTINEL_INUM);
        assert!(!self.avail.test(i_num as usize));
        let node = &mut self.tbl[i_num as usize];
        for slot in &mut node.b_nums {
            if *slot == SENTINEL_BNUM {
                *slot = blk;
                self.modified = true;
                return true;
            }
        }
        false
    }

    /// Clears the direct slot holding `tgt`. False if it is not there.
    pub fn release_block(&mut self, i_num: INum, tgt: BNum) -> bool {
        if i_num == SENTINEL_INUM {
            return false;
        }
        let node = &mut self.tbl[i_num as usize];
        for slot in &mut node.b_nums {
            if *slot == tgt {
                *slot = SENTINEL_BNUM;
                info!("releasing block {} from inode {}", tgt, i_num);
                self.modified = true;
                return true;
            }
        }
        false
    }

    /// The inode's direct blocks, in slot order.
    pub fn list_blocks(&self, i_num: INum) -> Vec<BNum> {
        if i_num == SENTINEL_INUM {
            warn!("list_blocks called with the sentinel inode");
            return Vec::new();
        }
        self.tbl[i_num as usize]
            .b_nums
            .iter()
            .copied()
            .filter(|b| *b != SENTINEL_BNUM)
            .collect()
    }

    pub fn is_in_use(&self, i_num: INum) -> bool {
        if i_num == SENTINEL_INUM {
            return false;
        }
        !self.avail.test(i_num as usize)
    }

    pub fn is_locked(&self, i_num: INum) -> bool {
        assert_ne!(i_num, SENTINEL_INUM);
        self.tbl[i_num as usize].lkd != SENTINEL_INUM
    }

    /// Count of inodes currently in use.
    pub fn in_use_count(&self) -> usize {
        NUM_INODES - self.avail.count()
    }
}
