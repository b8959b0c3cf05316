//! The circular write-ahead journal.
//!
//! The journal file is a fixed 64 KiB: a 24-byte metadata header (read
//! cursor, write cursor, and live byte count as i64 little-endian, with
//! `meta_get == -1` meaning empty) followed by a circular byte region.
//! An append frames the accumulated change log as
//!
//! ```text
//! START_TAG(8, BE) | cg_bytes(8, BE) | records | END_TAG(8, BE)
//! ```
//!
//! where each record is `block(4, LE) | timestamp(8, BE) | selectors |
//! lines` and `cg_bytes` counts the record bytes between the size field
//! and the end tag. Writes that run past the file end wrap back to the
//! first byte after the header. The append only becomes visible when the
//! metadata is rewritten afterward, so an interrupted append leaves the
//! prior frame reachable.
//!
//! Because every append re-emits the whole change log accumulated since
//! the last drain, the newest frame supersedes the older ones; a drain
//! (`purge_jrnl`) replays just the frame at `meta_get`: it rebuilds the
//! changes, folds them into the current disk images, re-seals each
//! block's CRC, and writes the results back in 16-page batches. Blocks
//! marked in the wipe list are written as zeros instead, and the drain
//! finishes by resetting the metadata to empty.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use arrayvec::ArrayVec;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use itertools::Itertools;
use log::{debug, info, warn};

use crate::change::{Change, ChangeLog, Selector, SELECT_BYTES};
use crate::clock::Clock;
use crate::crc;
use crate::error::{Error, Result};
use crate::memory::Page;
use crate::param::{
    BNum, BLOCK_BYTES, BYTES_PER_LINE, JRNL_SIZE, LINES_PER_PAGE, NUM_DISK_BLOCKS, SENTINEL_BNUM,
};
use crate::sim_disk::SimDisk;
use crate::status::{CrashChk, Status};
use crate::util::BitArray;
use crate::wipe_list::WipeList;

/// Opens a journal frame.
pub const START_TAG: u64 = 0xF185_ACEF_50F9_A00F;

/// Closes a journal frame.
pub const END_TAG: u64 = 0x3A5F_CA0F_0F85_432E;

/// Bytes of metadata at the head of the file; the circular region starts
/// here.
pub const META_LEN: u64 = 24;

/// Pages buffered between disk writes during a drain.
const NUM_PGS_JRNL_BUF: usize = 16;

pub struct Journal {
    path: PathBuf,
    js: std::fs::File,
    meta_get: i64,
    meta_put: i64,
    meta_sz: i64,
    /// Running byte count for the frame being written or read.
    ttl_bytes: usize,
    blks_in_jrnl: BitArray,
    wipers: WipeList,
    /// Stamped by the orchestrator after each drain; drives the purge
    /// timer.
    pub last_purge_time: u64,
    clock: Clock,
}

impl Journal {
    /// Opens or creates the journal file, runs crash recovery if the
    /// previous run's status demands it, then resets the metadata.
    pub fn new(
        path: &Path,
        disk: &mut SimDisk,
        cg_log: &mut ChangeLog,
        status: &mut Status,
        crash_chk: &CrashChk,
        clock: Clock,
    ) -> Result<Self> {
        let existed = path.exists();
        let mut js = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let mut len = js.seek(SeekFrom::End(0))?;
        if len < JRNL_SIZE as u64 {
            let pad = vec![0u8; (JRNL_SIZE as u64 - len) as usize];
            js.write_all(&pad)?;
            len = js.seek(SeekFrom::End(0))?;
        }
        if len != JRNL_SIZE as u64 {
            return Err(Error::BadFileSize {
                path: path.to_path_buf(),
                expected: JRNL_SIZE as u64,
                actual: len,
            });
        }
        js.seek(SeekFrom::Start(0))?;
        info!(
            "journal file {}: {}",
            if existed { "opened" } else { "created" },
            path.display()
        );

        let mut journal = Journal {
            path: path.to_path_buf(),
            js,
            meta_get: 0,
            meta_put: 0,
            meta_sz: 0,
            ttl_bytes: 0,
            blks_in_jrnl: BitArray::new(1, NUM_DISK_BLOCKS).expect("disk block count is fixed"),
            wipers: WipeList::new(),
            last_purge_time: 0,
            clock,
        };

        if crash_chk.crashed() {
            journal.purge_jrnl(disk, cg_log, status, true, true)?;
            status.write("Last change log recovered")?;
        }
        journal.init()?;
        Ok(journal)
    }

    /// Marks the journal empty: `{get: -1, put: 24, sz: 0}`.
    pub fn init(&mut self) -> Result<()> {
        self.meta_get = -1;
        self.meta_put = META_LEN as i64;
        self.meta_sz = 0;
        self.wrt_metadata()
    }

    pub fn is_in_jrnl(&self, b_num: BNum) -> bool {
        self.blks_in_jrnl.test(b_num as usize)
    }

    pub fn set_wiper_dirty(&mut self, b_num: BNum) {
        self.wipers.set_dirty(b_num);
    }

    /// True when adding `b_num` must be preceded by a drain: either this
    /// very block awaits a wipe, or enough freed blocks have piled up.
    pub fn wipe_pending(&self, b_num: BNum) -> bool {
        self.wipers.is_dirty(b_num) || self.wipers.is_ripe()
    }

    pub fn clear_wipers(&mut self) {
        self.wipers.clear_array();
    }

    /// Appends the accumulated change log as one frame at `meta_put`.
    /// No-op while the log's line counter is zero.
    pub fn wrt_cg_log_to_jrnl(&mut self, cg_log: &mut ChangeLog, status: &mut Status) -> Result<()> {
        if cg_log.line_ct() == 0 {
            return Ok(());
        }
        info!(
            "saving change log: {} blocks, {} lines",
            cg_log.log_size(),
            cg_log.line_ct()
        );

        self.rd_metadata()?;
        let orig_p_pos = self.meta_put as u64;
        debug_assert!(orig_p_pos >= META_LEN);
        self.js.seek(SeekFrom::Start(orig_p_pos))?;

        self.ttl_bytes = 0;
        self.wrt_field(&START_TAG.to_be_bytes(), true)?;
        let cg_bytes_pos = self.js.stream_position()?;
        // Reserve the size field; it is rewritten once the frame is out.
        self.wrt_field(&0u64.to_be_bytes(), true)?;

        for (b_num, changes) in cg_log.iter() {
            self.blks_in_jrnl.set(b_num as usize);
            for cg in changes {
                self.wrt_field(&cg.block_num.to_le_bytes(), true)?;
                self.wrt_field(&cg.time_stamp.to_be_bytes(), true)?;
                for s in cg.selectors() {
                    self.wrt_field(s.as_bytes(), true)?;
                }
                for d in cg.data() {
                    self.wrt_field(d, true)?;
                }
            }
        }
        self.wrt_field(&END_TAG.to_be_bytes(), true)?;

        let ttl = self.ttl_bytes;
        if ttl > JRNL_SIZE - META_LEN as usize {
            warn!("journal frame of {} bytes overruns the circular region", ttl);
        }
        let cg_bytes = (ttl - 24) as u64;
        let final_p_pos = self.js.stream_position()?;
        self.js.seek(SeekFrom::Start(cg_bytes_pos))?;
        self.wrt_field(&cg_bytes.to_be_bytes(), false)?;
        self.js.seek(SeekFrom::Start(final_p_pos))?;

        self.meta_get = orig_p_pos as i64;
        self.meta_put = final_p_pos as i64;
        self.meta_sz += ttl as i64;
        self.wrt_metadata()?;
        debug!(
            "journal metadata: get={} put={} sz={}",
            self.meta_get, self.meta_put, self.meta_sz
        );

        cg_log.reset_line_ct();
        info!("change log written to journal at time {}", self.clock.now());
        status.write("Change log written")?;
        self.js.sync_all()?;
        Ok(())
    }

    /// Drains the journal into the data file.
    ///
    /// Replays the frame at `meta_get` onto the current disk images,
    /// zero-fills every block awaiting a wipe, then resets the journal to
    /// empty. With `keep_going` false this is the shutdown drain and the
    /// status marker is left at "Finishing". `had_crash` forces a replay
    /// attempt even though no append has happened in this process.
    pub fn purge_jrnl(
        &mut self,
        disk: &mut SimDisk,
        cg_log: &mut ChangeLog,
        status: &mut Status,
        keep_going: bool,
        had_crash: bool,
    ) -> Result<()> {
        info!(
            "purging journal{}",
            if had_crash { " (after crash)" } else { "" }
        );

        if self.blks_in_jrnl.none() && self.wipers.none_dirty() && !had_crash {
            info!("journal is empty: nothing to purge");
        } else {
            let mut j_cg_log = ChangeLog::new();
            self.rd_last_jrnl(&mut j_cg_log)?;
            if j_cg_log.is_empty() {
                info!("no changes found in the journal");
            } else {
                self.apply_journal(disk, &j_cg_log)?;
            }
            self.wipe_dirty_blocks(disk)?;
            self.blks_in_jrnl.reset_all();
            cg_log.clear();
            self.init()?;
            self.js.sync_all()?;
        }

        status.write(if keep_going { "Purged journal" } else { "Finishing" })?;
        Ok(())
    }

    /// Folds a parsed frame into the disk images, block-major, buffering
    /// up to `NUM_PGS_JRNL_BUF` finished pages between write bursts.
    fn apply_journal(&mut self, disk: &mut SimDisk, j_cg_log: &ChangeLog) -> Result<()> {
        let mut buf: ArrayVec<(BNum, Page), NUM_PGS_JRNL_BUF> = ArrayVec::new();
        for (b_num, changes) in j_cg_log.iter() {
            let mut pg = Page::new();
            disk.read_block(b_num, &mut pg.dat)?;
            for cg in changes {
                cg.apply_to(&mut pg.dat);
            }
            crc::seal_page(&mut pg.dat);
            if buf.is_full() {
                self.empty_purge_jrnl_buf(disk, &mut buf)?;
            }
            buf.push((b_num, pg));
        }
        self.empty_purge_jrnl_buf(disk, &mut buf)?;
        Ok(())
    }

    /// Writes the buffered pages out. A page that fails its CRC check is
    /// skipped (the disk keeps its old image); a page whose block awaits
    /// a wipe is written as zeros instead.
    fn empty_purge_jrnl_buf(
        &mut self,
        disk: &mut SimDisk,
        buf: &mut ArrayVec<(BNum, Page), NUM_PGS_JRNL_BUF>,
    ) -> Result<()> {
        let mut zeros = [0u8; BLOCK_BYTES];
        SimDisk::create_block(&mut zeros);

        for (b_num, pg) in buf.drain(..) {
            if !crc::page_is_valid(&pg.dat) {
                warn!("page for block {} fails its CRC check, skipping", b_num);
                continue;
            }
            if self.wipers.is_dirty(b_num) {
                info!("overwriting dirty block {}", b_num);
                disk.write_block(b_num, &zeros)?;
            } else {
                info!("writing page {:3} to disk", b_num);
                disk.write_block(b_num, &pg.dat)?;
            }
        }
        Ok(())
    }

    /// Zero-fills every block marked for wiping so freed data cannot
    /// outlive a drain, whether or not the block appeared in the frame.
    fn wipe_dirty_blocks(&mut self, disk: &mut SimDisk) -> Result<()> {
        if self.wipers.none_dirty() {
            return Ok(());
        }
        let blocks: Vec<BNum> = self.wipers.dirty_blocks().collect();
        debug!("zero-filling freed blocks {}", blocks.iter().format(", "));
        let mut zeros = [0u8; BLOCK_BYTES];
        SimDisk::create_block(&mut zeros);
        for b in blocks {
            disk.write_block(b, &zeros)?;
        }
        Ok(())
    }

    /// Parses the frame at `meta_get` into `out`. Corruption empties
    /// `out` and is reported, never propagated.
    fn rd_last_jrnl(&mut self, out: &mut ChangeLog) -> Result<()> {
        self.rd_metadata()?;
        if self.meta_get == -1 {
            warn!("no journal metadata: journal is empty");
            return Ok(());
        }
        if (self.meta_get as u64) < META_LEN || self.meta_get as u64 >= JRNL_SIZE as u64 {
            warn!("invalid journal metadata: get={}", self.meta_get);
            return Ok(());
        }
        self.js.seek(SeekFrom::Start(self.meta_get as u64))?;
        match self.rd_jrnl(out) {
            Ok(()) => Ok(()),
            Err(Error::CorruptFrame { offset, reason }) => {
                warn!("corrupt journal frame at offset {}: {}", offset, reason);
                out.clear();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn rd_jrnl(&mut self, out: &mut ChangeLog) -> Result<()> {
        let frame_off = self.js.stream_position()?;
        self.ttl_bytes = 0;

        let start = self.rd_u64_be()?;
        if start != START_TAG {
            return Err(Error::CorruptFrame {
                offset: frame_off,
                reason: format!("start tag {:#018X}", start),
            });
        }
        let cg_bytes = self.rd_u64_be()? as usize;

        while self.ttl_bytes < cg_bytes + 16 {
            let b_num = self.rd_u32_le()?;
            if b_num == SENTINEL_BNUM {
                break;
            }
            if b_num as usize >= NUM_DISK_BLOCKS {
                return Err(Error::CorruptFrame {
                    offset: frame_off,
                    reason: format!("block number {} out of range", b_num),
                });
            }
            let mut cg = Change::parsed(b_num);
            cg.time_stamp = self.rd_u64_be()?;
            let num_lines = self.rd_selectors(&mut cg, cg_bytes, frame_off)?;
            for _ in 0..num_lines {
                let mut line = [0u8; BYTES_PER_LINE];
                self.rd_field(&mut line)?;
                cg.push_line(line);
            }
            out.add(cg);
        }

        let end = self.rd_u64_be()?;
        if end != END_TAG {
            return Err(Error::CorruptFrame {
                offset: frame_off,
                reason: format!("end tag {:#018X}", end),
            });
        }
        Ok(())
    }

    /// Reads a record's selector run, returning how many data lines
    /// follow. Selectors keep arriving while each is full; the run ends
    /// at the first partially-filled one.
    fn rd_selectors(
        &mut self,
        cg: &mut Change,
        cg_bytes: usize,
        frame_off: u64,
    ) -> Result<usize> {
        let mut num_lines = 0;
        loop {
            if self.ttl_bytes > cg_bytes + 16 {
                return Err(Error::CorruptFrame {
                    offset: frame_off,
                    reason: "selector terminator never arrived".into(),
                });
            }
            let mut raw = [0u8; SELECT_BYTES];
            self.rd_field(&mut raw)?;
            let sel = Selector::from_bytes(raw);
            for ix in sel.lines() {
                if ix as usize >= LINES_PER_PAGE {
                    return Err(Error::CorruptFrame {
                        offset: frame_off,
                        reason: format!("selector holds line index {}", ix),
                    });
                }
            }
            num_lines += sel.line_count();
            let full = sel.is_full();
            cg.push_selector(sel);
            if !full {
                return Ok(num_lines);
            }
        }
    }

    fn rd_metadata(&mut self) -> Result<()> {
        self.js.seek(SeekFrom::Start(0))?;
        self.meta_get = self.js.read_i64::<LittleEndian>()?;
        self.meta_put = self.js.read_i64::<LittleEndian>()?;
        self.meta_sz = self.js.read_i64::<LittleEndian>()?;
        Ok(())
    }

    fn wrt_metadata(&mut self) -> Result<()> {
        self.js.seek(SeekFrom::Start(0))?;
        self.js.write_i64::<LittleEndian>(self.meta_get)?;
        self.js.write_i64::<LittleEndian>(self.meta_put)?;
        self.js.write_i64::<LittleEndian>(self.meta_sz)?;
        Ok(())
    }

    /// Writes `data` at the current position, wrapping past the file end
    /// back to the first byte after the metadata. Counts the bytes into
    /// the frame total when `do_ct` is set (the size-field rewrite must
    /// not count twice).
    fn wrt_field(&mut self, data: &[u8], do_ct: bool) -> Result<()> {
        let p_pos = self.js.stream_position()?;
        let end_pt = p_pos as usize + data.len();
        if end_pt > JRNL_SIZE {
            let under = JRNL_SIZE - p_pos as usize;
            self.js.write_all(&data[..under])?;
            self.js.seek(SeekFrom::Start(META_LEN))?;
            self.js.write_all(&data[under..])?;
        } else {
            self.js.write_all(data)?;
            if end_pt == JRNL_SIZE {
                self.js.seek(SeekFrom::Start(META_LEN))?;
            }
        }
        if do_ct {
            self.ttl_bytes += data.len();
        }
        Ok(())
    }

    /// Wrap-aware counterpart of `wrt_field`.
    fn rd_field(&mut self, buf: &mut [u8]) -> Result<()> {
        let g_pos = self.js.stream_position()?;
        let end_pt = g_pos as usize + buf.len();
        if end_pt > JRNL_SIZE {
            let under = JRNL_SIZE - g_pos as usize;
            self.js.read_exact(&mut buf[..under])?;
            self.js.seek(SeekFrom::Start(META_LEN))?;
            self.js.read_exact(&mut buf[under..])?;
        } else {
            self.js.read_exact(buf)?;
            if end_pt == JRNL_SIZE {
                self.js.seek(SeekFrom::Start(META_LEN))?;
            }
        }
        self.ttl_bytes += buf.len();
        Ok(())
    }

    fn rd_u64_be(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        self.rd_field(&mut raw)?;
        Ok(u64::from_be_bytes(raw))
    }

    fn rd_u32_le(&mut self) -> Result<u32> {
        let mut raw = [0u8; 4];
        self.rd_field(&mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    /// Re-reads and returns `(meta_get, meta_put, meta_sz)`.
    pub fn metadata(&mut self) -> Result<(i64, i64, i64)> {
        self.rd_metadata()?;
        Ok((self.meta_get, self.meta_put, self.meta_sz))
    }

    #[cfg(test)]
    pub(crate) fn force_put(&mut self, put: i64) -> Result<()> {
        self.rd_metadata()?;
        self.meta_put = put;
        self.wrt_metadata()
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        if let Err(e) = self.js.sync_all() {
            warn!("cannot sync journal {}: {}", self.path.display(), e);
        }
    }
}
