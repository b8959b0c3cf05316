//! File-level operations: the glue between the inode table, the free
//! list, the cache, and the journal.
//!
//! Files are unnamed; a client holds inode numbers. Every mutating
//! operation checks the inode's lock first and reports refusal through
//! its return value. Freed blocks go back to the free list's pending set
//! and are marked for wiping so their bytes cannot resurface under a new
//! owner.

use itertools::Itertools;
use log::{info, warn};

use crate::change::Change;
use crate::clock::Clock;
use crate::error::Result;
use crate::free_list::FreeList;
use crate::inode::{Inode, InodeTable};
use crate::mem_man::MemMan;
use crate::param::{BNum, INum, SENTINEL_BNUM, SENTINEL_INUM};
use std::path::Path;

pub struct FileMan {
    itbl: InodeTable,
    free_list: FreeList,
    pub mem_man: MemMan,
    clock: Clock,
}

impl FileMan {
    pub fn new(node_path: &Path, free_path: &Path, mem_man: MemMan, clock: Clock) -> Result<Self> {
        Ok(FileMan {
            itbl: InodeTable::new(node_path, clock.clone())?,
            free_list: FreeList::new(free_path)?,
            mem_man,
            clock,
        })
    }

    /// Creates a file, returning its inode number (sentinel when the
    /// table is full).
    pub fn create_file(&mut self) -> INum {
        let ret = self.itbl.assign_inode();
        if ret == SENTINEL_INUM {
            warn!("cannot create file: inode limit reached");
        } else {
            info!("file created with inode #{}", ret);
        }
        ret
    }

    /// Deletes a file, returning its blocks to the free list and marking
    /// them for wiping.
    pub fn delete_file(&mut self, cli_id: u32, i_num: INum) -> bool {
        if i_num != SENTINEL_INUM && self.itbl.is_locked(i_num) {
            warn!(
                "cannot delete file {} for client {} at time {}: file locked",
                i_num,
                cli_id,
                self.clock.now()
            );
            return false;
        }
        if !self.file_exists(i_num) {
            warn!(
                "cannot delete file {} for client {} at time {}: no such file",
                i_num,
                cli_id,
                self.clock.now()
            );
            return false;
        }

        let blocks = self.itbl.list_blocks(i_num);
        info!(
            "deleting inode #{} for client {} (blocks {})",
            i_num,
            cli_id,
            blocks.iter().format(", ")
        );
        for b in &blocks {
            self.remv_block_clean(*b);
            self.itbl.release_block(i_num, *b);
        }
        self.itbl.release_inode(i_num);
        info!(
            "file deleted with inode #{} for client {} at time {}",
            i_num,
            cli_id,
            self.clock.now()
        );
        true
    }

    pub fn count_files(&self) -> usize {
        self.itbl.in_use_count()
    }

    pub fn count_blocks(&self, i_num: INum) -> usize {
        self.itbl.list_blocks(i_num).len()
    }

    pub fn file_exists(&self, i_num: INum) -> bool {
        i_num != SENTINEL_INUM && self.itbl.is_in_use(i_num)
    }

    pub fn block_exists(&self, i_num: INum, b_num: BNum) -> bool {
        if i_num == SENTINEL_INUM || b_num == SENTINEL_BNUM || !self.file_exists(i_num) {
            return false;
        }
        self.itbl.node(i_num).b_nums.contains(&b_num)
    }

    /// Allocates a block for `i_num`, wiping residue first if the block
    /// or the wipe list demands it. Sentinel when refused or exhausted.
    pub fn add_block(&mut self, cli_id: u32, i_num: INum) -> Result<BNum> {
        if self.itbl.is_locked(i_num) {
            warn!(
                "cannot add block to file {} for client {} at time {}: file locked",
                i_num,
                cli_id,
                self.clock.now()
            );
            return Ok(SENTINEL_BNUM);
        }

        let b_num = self.free_list.get_block();
        if b_num == SENTINEL_BNUM {
            warn!(
                "cannot add block to inode {} for client {} at time {}: no free blocks",
                i_num,
                cli_id,
                self.clock.now()
            );
            return Ok(SENTINEL_BNUM);
        }

        if self.itbl.assign_block(i_num, b_num) {
            self.do_wipe_routine(b_num)?;
            info!(
                "block {} added to inode {} for client {} at time {}",
                b_num,
                i_num,
                cli_id,
                self.clock.now()
            );
            Ok(b_num)
        } else {
            warn!(
                "cannot add block to inode {} for client {} at time {}: no space in inode",
                i_num,
                cli_id,
                self.clock.now()
            );
            self.free_list.put_block(b_num);
            Ok(SENTINEL_BNUM)
        }
    }

    /// Removes `tgt` from `i_num`, freeing and marking it.
    pub fn remv_block(&mut self, cli_id: u32, i_num: INum, tgt: BNum) -> bool {
        if self.itbl.is_locked(i_num) {
            warn!(
                "cannot remove block {} from inode {} for client {} at time {}: file locked",
                tgt,
                i_num,
                cli_id,
                self.clock.now()
            );
            return false;
        }
        if !self.itbl.is_in_use(i_num) {
            warn!(
                "cannot remove block {} from inode {} for client {} at time {}: inode not in use",
                tgt,
                i_num,
                cli_id,
                self.clock.now()
            );
            return false;
        }

        if self.itbl.release_block(i_num, tgt) {
            self.remv_block_clean(tgt);
            info!(
                "block {} removed from inode {} for client {} at time {}",
                tgt,
                i_num,
                cli_id,
                self.clock.now()
            );
            true
        } else {
            warn!(
                "cannot remove block {} from inode {} for client {} at time {}: block not in inode",
                tgt,
                i_num,
                cli_id,
                self.clock.now()
            );
            false
        }
    }

    /// Common tail of every block free: back to the pending set, out of
    /// the cache, and marked so its disk bytes are scrubbed before reuse.
    fn remv_block_clean(&mut self, tgt: BNum) {
        self.free_list.put_block(tgt);
        self.mem_man.evict_this_page(tgt);
        if self.mem_man.change_log.contains_block(tgt) || self.mem_man.journal.is_in_jrnl(tgt) {
            info!("block {} still has pending changes, wiping on reuse", tgt);
        }
        self.mem_man.journal.set_wiper_dirty(tgt);
    }

    /// Before handing out `b_num`: if it (or the accumulated wipe list)
    /// needs scrubbing, persist the allocators and run a full
    /// append-plus-drain, then start the wipe list fresh.
    fn do_wipe_routine(&mut self, b_num: BNum) -> Result<()> {
        if self.mem_man.journal.wipe_pending(b_num) {
            self.itbl.ensure_stored()?;
            self.free_list.store()?;
            info!("saving change log and purging journal before adding new block");
            self.mem_man.flush_and_purge(true)?;
            self.mem_man.journal.clear_wipers();
        }
        Ok(())
    }

    pub fn inode(&self, i_num: INum) -> &Inode {
        assert_ne!(i_num, SENTINEL_INUM);
        self.itbl.node(i_num)
    }

    pub fn inode_table(&self) -> &InodeTable {
        &self.itbl
    }

    pub fn free_list(&self) -> &FreeList {
        &self.free_list
    }

    /// Routes a read or write request into the cache, unless the file is
    /// locked.
    pub fn submit_request(
        &mut self,
        _do_wrt: bool,
        _cli_id: u32,
        i_num: INum,
        cg: Change,
    ) -> Result<()> {
        if !self.itbl.is_locked(i_num) {
            self.mem_man
                .process_request(cg, &mut self.itbl, &mut self.free_list)?;
        }
        Ok(())
    }

    /// Flushes everything and leaves the clean "Finishing" marker.
    pub fn shutdown(&mut self) -> Result<()> {
        self.itbl.ensure_stored()?;
        self.free_list.store()?;
        self.mem_man.shutdown()
    }
}
