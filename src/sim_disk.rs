//! The simulated disk: creation and validation of the backing files.
//!
//! Four files back the engine: the data file (all disk blocks,
//! CRC-trailered), the journal file, the free-list file, and the inode
//! table file. On startup each is created with a valid initial image if
//! missing, or size-checked (and, for the data file, CRC-scanned) if
//! present. A wrong size is a fatal configuration error; a CRC mismatch
//! in a data block is reported and left for recovery to repair.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};
use log::{info, warn};

use crate::crc;
use crate::error::{Error, Result};
use crate::inode::AVAIL_BYTES;
use crate::param::{
    BNum, BLOCK_BYTES, BITS_PER_PAGE, CT_INODE_BNUMS, CT_INODE_INDIRECTS, JRNL_SIZE,
    NUM_DISK_BLOCKS, NUM_FREE_LIST_BLOCKS, NUM_INODES, NUM_INODE_TBL_BLOCKS, SENTINEL_INUM,
};
use crate::status::Status;

/// Data file length.
pub const DISK_BYTES: u64 = (NUM_DISK_BLOCKS * BLOCK_BYTES) as u64;

/// Free-list file length: two bitmaps plus the cursor.
pub const FREE_FILE_BYTES: u64 = (2 * NUM_FREE_LIST_BLOCKS * BITS_PER_PAGE / 8 + 4) as u64;

/// Inode table file length: availability bitmap plus the records.
pub const NODE_FILE_BYTES: u64 = (AVAIL_BYTES + NUM_INODE_TBL_BLOCKS * BLOCK_BYTES) as u64;

pub struct SimDisk {
    d_path: PathBuf,
    ds: File,
    err_blocks: Vec<BNum>,
}

impl SimDisk {
    pub fn new(
        status: &mut Status,
        d_path: &Path,
        j_path: &Path,
        f_path: &Path,
        n_path: &Path,
    ) -> Result<Self> {
        status.write("Initializing")?;

        let mut err_blocks = Vec::new();
        Self::read_or_create(d_path, DISK_BYTES, FileKind::Disk, &mut err_blocks)?;
        Self::read_or_create(j_path, JRNL_SIZE as u64, FileKind::Jrnl, &mut err_blocks)?;
        Self::read_or_create(f_path, FREE_FILE_BYTES, FileKind::Free, &mut err_blocks)?;
        Self::read_or_create(n_path, NODE_FILE_BYTES, FileKind::Node, &mut err_blocks)?;

        let ds = OpenOptions::new().read(true).write(true).open(d_path)?;
        for b in &err_blocks {
            warn!("found data error in block {} on startup", b);
        }
        Ok(SimDisk {
            d_path: d_path.to_path_buf(),
            ds,
            err_blocks,
        })
    }

    /// The open data-file handle.
    pub fn file(&mut self) -> &mut File {
        &mut self.ds
    }

    pub fn data_path(&self) -> &Path {
        &self.d_path
    }

    /// Blocks whose CRC failed the startup scan.
    pub fn err_blocks(&self) -> &[BNum] {
        &self.err_blocks
    }

    /// Reads block `b` from the data file.
    pub fn read_block(&mut self, b: BNum, buf: &mut [u8; BLOCK_BYTES]) -> Result<()> {
        self.ds.seek(SeekFrom::Start(b as u64 * BLOCK_BYTES as u64))?;
        self.ds.read_exact(buf)?;
        Ok(())
    }

    /// Writes block `b` to the data file.
    pub fn write_block(&mut self, b: BNum, buf: &[u8; BLOCK_BYTES]) -> Result<()> {
        self.ds.seek(SeekFrom::Start(b as u64 * BLOCK_BYTES as u64))?;
        self.ds.write_all(buf)?;
        Ok(())
    }

    /// Fills `buf` with a valid fresh block image: zeros plus the CRC
    /// trailer.
    pub fn create_block(buf: &mut [u8; BLOCK_BYTES]) {
        buf.fill(0);
        crc::seal_page(buf);
    }

    fn read_or_create(
        path: &Path,
        size: u64,
        kind: FileKind,
        err_blocks: &mut Vec<BNum>,
    ) -> Result<()> {
        if path.exists() {
            let actual = path.metadata()?.len();
            if actual != size {
                return Err(Error::BadFileSize {
                    path: path.to_path_buf(),
                    expected: size,
                    actual,
                });
            }
            if let FileKind::Disk = kind {
                Self::err_scan(path, err_blocks)?;
            }
            info!("opened {}", path.display());
        } else {
            let f = File::create(path)?;
            let mut w = BufWriter::new(f);
            match kind {
                FileKind::Disk => Self::create_d_file(&mut w)?,
                FileKind::Jrnl => Self::create_j_file(&mut w)?,
                FileKind::Free => Self::create_f_file(&mut w)?,
                FileKind::Node => Self::create_n_file(&mut w)?,
            }
            w.flush()?;
            info!("created {}", path.display());
        }
        Ok(())
    }

    fn create_d_file(w: &mut impl Write) -> Result<()> {
        let mut block = [0u8; BLOCK_BYTES];
        Self::create_block(&mut block);
        for _ in 0..NUM_DISK_BLOCKS {
            w.write_all(&block)?;
        }
        Ok(())
    }

    fn create_j_file(w: &mut impl Write) -> Result<()> {
        let page = [0u8; BLOCK_BYTES];
        for _ in 0..JRNL_SIZE / BLOCK_BYTES {
            w.write_all(&page)?;
        }
        Ok(())
    }

    fn create_f_file(w: &mut impl Write) -> Result<()> {
        let bitmap_bytes = NUM_FREE_LIST_BLOCKS * BITS_PER_PAGE / 8;
        let mut bits_from = vec![0u8; bitmap_bytes];
        bits_from[..NUM_DISK_BLOCKS / 8].fill(0xFF);
        w.write_all(&bits_from)?;
        w.write_all(&vec![0u8; bitmap_bytes])?;
        w.write_u32::<LittleEndian>(0)?;
        Ok(())
    }

    fn create_n_file(w: &mut impl Write) -> Result<()> {
        w.write_all(&[0xFF; AVAIL_BYTES])?;
        for ix in 0..NUM_INODES {
            for _ in 0..CT_INODE_BNUMS {
                w.write_u32::<LittleEndian>(SENTINEL_INUM)?;
            }
            w.write_u32::<LittleEndian>(SENTINEL_INUM)?;
            w.write_u64::<LittleEndian>(0)?;
            for _ in 0..CT_INODE_INDIRECTS {
                w.write_u32::<LittleEndian>(SENTINEL_INUM)?;
            }
            w.write_u32::<LittleEndian>(ix as u32)?;
        }
        Ok(())
    }

    /// Verifies the trailer of every data block.
    fn err_scan(path: &Path, err_blocks: &mut Vec<BNum>) -> Result<()> {
        let mut f = File::open(path)?;
        let mut block = [0u8; BLOCK_BYTES];
        for b in 0..NUM_DISK_BLOCKS as BNum {
            f.read_exact(&mut block)?;
            if !crc::page_is_valid(&block) {
                err_blocks.push(b);
            }
        }
        Ok(())
    }
}

enum FileKind {
    Disk,
    Jrnl,
    Free,
    Node,
}
