//! Persistent free-block bitmap with two-phase reclamation.
//!
//! Allocation serves ascending block numbers from `bits_from` behind a
//! cursor; frees land in `bits_to` and only return to circulation when
//! the cursor exhausts the allocation set and `refresh` folds `bits_to`
//! back in. The gap between free and reusable is what keeps a freed
//! block from being re-allocated while a journaled change for it still
//! exists.
//!
//! File layout: `bits_from` bytes, `bits_to` bytes, cursor (u32 LE).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, error, info};

use crate::error::Result;
use crate::param::{BNum, BITS_PER_PAGE, NUM_DISK_BLOCKS, NUM_FREE_LIST_BLOCKS, SENTINEL_BNUM};
use crate::util::BitArray;

fn fresh_bitmap() -> BitArray {
    BitArray::new(NUM_FREE_LIST_BLOCKS, BITS_PER_PAGE).expect("free bitmap dimensions are fixed")
}

pub struct FreeList {
    path: PathBuf,
    file: File,
    bits_from: BitArray,
    bits_to: BitArray,
    from_posn: BNum,
}

impl FreeList {
    /// Opens the free-list file, creating and initializing it (all disk
    /// blocks free, cursor at zero) if it does not exist.
    pub fn new(path: &Path) -> Result<Self> {
        let exists = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let mut list = FreeList {
            path: path.to_path_buf(),
            file,
            bits_from: fresh_bitmap(),
            bits_to: fresh_bitmap(),
            from_posn: 0,
        };
        if exists {
            list.load()?;
        } else {
            info!("free list file not found, initializing {}", path.display());
            for b in 0..NUM_DISK_BLOCKS {
                list.bits_from.set(b);
            }
            list.store()?;
        }
        Ok(list)
    }

    fn load(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        let byte_ct = self.bits_from.size() / 8;
        let mut buf = vec![0u8; byte_ct];
        self.file.read_exact(&mut buf)?;
        self.bits_from = BitArray::from_bytes(&buf, NUM_FREE_LIST_BLOCKS, BITS_PER_PAGE)?;
        self.file.read_exact(&mut buf)?;
        self.bits_to = BitArray::from_bytes(&buf, NUM_FREE_LIST_BLOCKS, BITS_PER_PAGE)?;
        self.from_posn = self.file.read_u32::<LittleEndian>()?;
        Ok(())
    }

    /// Writes the full list state back to its file.
    pub fn store(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.bits_from.to_bytes())?;
        self.file.write_all(&self.bits_to.to_bytes())?;
        self.file.write_u32::<LittleEndian>(self.from_posn)?;
        self.file.flush()?;
        debug!("free list stored to {}", self.path.display());
        Ok(())
    }

    /// Allocates the next free block, or the sentinel when the disk is
    /// full. Reclaims freed blocks first if the allocation set is spent.
    pub fn get_block(&mut self) -> BNum {
        for _ in 0..2 {
            self.advance_to_set();
            if (self.from_posn as usize) < NUM_DISK_BLOCKS {
                let b = self.from_posn;
                self.bits_from.reset(b as usize);
                self.from_posn += 1;
                debug!("got block {}", b);
                return b;
            }
            if self.bits_to.any() {
                self.refresh();
            } else {
                break;
            }
        }
        SENTINEL_BNUM
    }

    /// Returns `b` to the pending set. It becomes allocatable again only
    /// after the next `refresh`.
    pub fn put_block(&mut self, b: BNum) {
        assert!((b as usize) < NUM_DISK_BLOCKS);
        self.bits_to.set(b as usize);
    }

    /// Folds the pending set into the allocation set and rewinds the
    /// cursor to the lowest free block.
    pub fn refresh(&mut self) {
        self.bits_from
            .or_with(&self.bits_to)
            .expect("free bitmaps share dimensions");
        self.bits_to.reset_all();
        self.from_posn = 0;
        self.advance_to_set();
    }

    /// Moves the cursor to the next set bit; an allocation must never
    /// hand out a block whose bit is clear.
    fn advance_to_set(&mut self) {
        while (self.from_posn as usize) < NUM_DISK_BLOCKS
            && !self.bits_from.test(self.from_posn as usize)
        {
            self.from_posn += 1;
        }
    }

    pub fn is_free(&self, b: BNum) -> bool {
        self.bits_from.test(b as usize)
    }

    pub fn is_pending(&self, b: BNum) -> bool {
        self.bits_to.test(b as usize)
    }
}

impl Drop for FreeList {
    fn drop(&mut self) {
        if let Err(e) = self.store() {
            error!("cannot store free list {}: {}", self.path.display(), e);
        }
    }
}
