//! Request orchestration: the write-back page cache in front of the
//! journal.
//!
//! Every client request lands here. The target block is brought into a
//! memory slot if it is not cached (evicting the LRU page when the pool
//! is full, then replaying any still-pending changes into the fresh
//! image so memory reflects the journaled state). Writes are recorded in
//! the change log; both reads and writes refresh the block's access time
//! in the eviction heap. After each request the flush timers run: a full
//! change log or an expired purge timer forces an append-plus-drain, a
//! shorter write-all timer forces an append alone.

use std::collections::HashMap;

use log::{debug, error, info};

use crate::change::{Change, ChangeLog};
use crate::clock::Clock;
use crate::error::Result;
use crate::free_list::FreeList;
use crate::inode::InodeTable;
use crate::journal::Journal;
use crate::memory::Memory;
use crate::page_table::{PageTable, PgTabEntry};
use crate::param::{BNum, BYTES_PER_LINE, CG_LOG_FULL, NUM_DISK_BLOCKS, NUM_MEM_SLOTS};
use crate::sim_disk::SimDisk;
use crate::status::Status;
use crate::util::BitArray;

/// Change log older than this (µs) is appended to the journal.
pub const WRITEALL_DELAY_USEC: u64 = 25_000;

/// Journal unpurged longer than this (µs) is drained to disk.
pub const JRNL_PURGE_DELAY_USEC: u64 = 100_000;

/// Fixed framing overhead of one change in the journal.
pub const CG_OHEAD: usize = 16;

/// Fixed framing overhead of one journal frame.
pub const JRNL_ENTRY_OHEAD: usize = 24;

pub struct MemMan {
    page_table: PageTable,
    memory: Memory,
    blks_in_mem: BitArray,
    blk_locs_in_mem: HashMap<BNum, usize>,
    pub change_log: ChangeLog,
    pub journal: Journal,
    pub sim_disk: SimDisk,
    pub status: Status,
    clock: Clock,
    verbose: bool,
    shut_down: bool,
}

impl MemMan {
    pub fn new(
        memory: Memory,
        sim_disk: SimDisk,
        journal: Journal,
        mut change_log: ChangeLog,
        mut status: Status,
        clock: Clock,
        verbose: bool,
    ) -> Result<Self> {
        // The write timer starts now, not at process start, so a slow
        // startup does not trigger an immediate flush.
        change_log.last_cg_wrt_time = clock.now();
        status.write("Running")?;
        Ok(MemMan {
            page_table: PageTable::new(),
            memory,
            blks_in_mem: BitArray::new(1, NUM_DISK_BLOCKS).expect("disk block count is fixed"),
            blk_locs_in_mem: HashMap::new(),
            change_log,
            journal,
            sim_disk,
            status,
            clock,
            verbose,
            shut_down: false,
        })
    }

    /// Serves one read or write request against the cache.
    pub fn process_request(
        &mut self,
        mut cg: Change,
        itbl: &mut InodeTable,
        flist: &mut FreeList,
    ) -> Result<()> {
        debug_assert_eq!(self.page_table.len(), self.memory.slots_in_use());

        let b_num = cg.block_num;
        assert!((b_num as usize) < NUM_DISK_BLOCKS);

        let in_mem = self.blks_in_mem.test(b_num as usize);
        let a_write = cg.lines_altered();
        cg.time_stamp = self.clock.now();
        info!(
            "request for {} block {} {} memory at time {}",
            if a_write { "write to" } else { "read from" },
            b_num,
            if in_mem { "in" } else { "not in" },
            cg.time_stamp
        );

        if !in_mem {
            let slot = self.setup_pg(b_num)?;
            self.update_pg_in_mem(b_num, slot);
        }

        if a_write {
            self.wrt_in_slot(cg);
        } else {
            self.rd_in_slot(b_num);
        }

        self.timed_acts(itbl, flist)
    }

    /// Finds a slot for `b_num` and reads its block in, evicting the LRU
    /// page if the pool is full.
    fn setup_pg(&mut self, b_num: BNum) -> Result<usize> {
        let mut slot = self.memory.first_available();
        if slot == NUM_MEM_SLOTS {
            slot = self.evict_lru_page();
        }
        self.rd_pg_frm_dsk(b_num, slot)?;
        Ok(slot)
    }

    /// Replays changes already pending for `b_num` into its freshly
    /// loaded page, so the cached image matches the journaled state.
    fn update_pg_in_mem(&mut self, b_num: BNum, slot: usize) {
        if let Some(changes) = self.change_log.changes_for(b_num) {
            let pg = self.memory.page_mut(slot);
            for cg in changes {
                cg.apply_to(&mut pg.dat);
            }
        }
    }

    /// Pops the LRU victim and returns its freed slot.
    fn evict_lru_page(&mut self) -> usize {
        debug_assert!(self.page_table.check_heap());
        let victim = self
            .page_table
            .pop()
            .expect("memory full but page table empty");
        let slot = self
            .blk_locs_in_mem
            .remove(&victim.block_num)
            .expect("cached block has no slot");
        debug_assert_eq!(slot, victim.mem_slot);
        self.blks_in_mem.reset(victim.block_num as usize);
        self.memory.make_available(slot);
        info!(
            "evicted page {} from memory slot {} at time {}",
            victim.block_num,
            slot,
            self.clock.now()
        );
        debug_assert!(self.page_table.check_heap());
        slot
    }

    /// Drops `b_num` from the cache (used when its block is released).
    /// Zeroing its access time floats the entry to the root for the pop.
    pub fn evict_this_page(&mut self, b_num: BNum) {
        let slot = match self.blk_locs_in_mem.get(&b_num) {
            Some(slot) => *slot,
            None => return,
        };
        debug_assert!(self.page_table.check_heap());
        let pos = self
            .page_table
            .slot_for_mem_slot(slot)
            .expect("cached block missing from page table");
        self.page_table.reset_access(pos);
        let entry = self.page_table.pop().expect("page table emptied underfoot");
        debug_assert_eq!(entry.block_num, b_num);
        self.blk_locs_in_mem.remove(&b_num);
        self.blks_in_mem.reset(b_num as usize);
        self.memory.make_available(slot);
        info!(
            "evicted page {} from memory slot {} at time {}",
            b_num,
            slot,
            self.clock.now()
        );
        debug_assert!(self.page_table.check_heap());
    }

    fn rd_pg_frm_dsk(&mut self, b_num: BNum, slot: usize) -> Result<()> {
        debug_assert!(self.page_table.check_heap());
        if slot == NUM_MEM_SLOTS - 1 {
            self.page_table.set_full();
        }
        info!(
            "moving page {} into memory slot {} at time {}",
            b_num,
            slot,
            self.clock.now()
        );
        self.sim_disk
            .read_block(b_num, &mut self.memory.page_mut(slot).dat)?;
        self.blks_in_mem.set(b_num as usize);
        self.blk_locs_in_mem.insert(b_num, slot);
        self.memory.take_slot(slot);
        self.page_table.push(PgTabEntry {
            block_num: b_num,
            mem_slot: slot,
            acc_time: self.clock.now(),
        });
        debug_assert!(self.page_table.check_heap());
        Ok(())
    }

    fn rd_in_slot(&mut self, b_num: BNum) {
        let slot = self.blk_locs_in_mem[&b_num];
        let pos = self
            .page_table
            .slot_for_mem_slot(slot)
            .expect("cached block missing from page table");
        self.page_table.update_access(pos, self.clock.now());
        info!("reading from page {} in memory slot {}", b_num, slot);
    }

    fn wrt_in_slot(&mut self, cg: Change) {
        debug_assert!(cg.lines_altered());
        let b_num = cg.block_num;
        let slot = self.blk_locs_in_mem[&b_num];
        let pos = self
            .page_table
            .slot_for_mem_slot(slot)
            .expect("cached block missing from page table");
        self.page_table.update_access(pos, self.clock.now());
        info!("writing to page {} in memory slot {}", b_num, slot);
        self.change_log.add(cg);
    }

    /// Runs the flush timers after a request.
    fn timed_acts(&mut self, itbl: &mut InodeTable, flist: &mut FreeList) -> Result<()> {
        if self.verbose {
            self.debug_display();
        }

        let bytes_to_jrnl = self.sz_jrnl_wrt();
        if bytes_to_jrnl >= CG_LOG_FULL {
            info!("change log at {} bytes is full (>= {})", bytes_to_jrnl, CG_LOG_FULL);
        }
        let cur = self.clock.now();
        let elapsed = cur.saturating_sub(self.journal.last_purge_time);
        if elapsed > JRNL_PURGE_DELAY_USEC {
            info!("{} usec since last purge (> {})", elapsed, JRNL_PURGE_DELAY_USEC);
        }

        if elapsed > JRNL_PURGE_DELAY_USEC || bytes_to_jrnl >= CG_LOG_FULL {
            itbl.ensure_stored()?;
            flist.store()?;
            self.flush_and_purge(true)?;
        } else {
            let delay = cur.saturating_sub(self.change_log.last_cg_wrt_time);
            if delay > WRITEALL_DELAY_USEC {
                info!("{} usec since last log write (> {})", delay, WRITEALL_DELAY_USEC);
                self.change_log.last_cg_wrt_time = cur;
                self.journal
                    .wrt_cg_log_to_jrnl(&mut self.change_log, &mut self.status)?;
            }
        }
        Ok(())
    }

    /// Appends the change log and drains the journal to the data file.
    pub fn flush_and_purge(&mut self, keep_going: bool) -> Result<()> {
        let cur = self.clock.now();
        self.change_log.last_cg_wrt_time = cur;
        self.journal
            .wrt_cg_log_to_jrnl(&mut self.change_log, &mut self.status)?;
        self.journal.last_purge_time = cur;
        self.journal.purge_jrnl(
            &mut self.sim_disk,
            &mut self.change_log,
            &mut self.status,
            keep_going,
            false,
        )
    }

    /// Bytes the current change log would occupy in the journal.
    fn sz_jrnl_wrt(&self) -> usize {
        let num_data_lines = self.change_log.line_ct();
        let data_bytes = num_data_lines * BYTES_PER_LINE;
        let select_bytes = (num_data_lines >> 3) + 8;
        data_bytes + select_bytes + CG_OHEAD + JRNL_ENTRY_OHEAD
    }

    /// Leaves a clean on-disk state: residual change log appended and the
    /// journal drained, with the status marker at "Finishing".
    pub fn shutdown(&mut self) -> Result<()> {
        if !self.shut_down {
            self.shut_down = true;
            info!("program exiting");
            self.flush_and_purge(false)?;
        }
        Ok(())
    }

    pub fn is_cached(&self, b_num: BNum) -> bool {
        self.blks_in_mem.test(b_num as usize)
    }

    pub fn cached_slot(&self, b_num: BNum) -> Option<usize> {
        self.blk_locs_in_mem.get(&b_num).copied()
    }

    pub fn cached_count(&self) -> usize {
        self.blk_locs_in_mem.len()
    }

    /// The cache bijection: every cached block has exactly one slot and
    /// one heap entry agreeing on that slot.
    pub fn check_cache(&self) -> bool {
        if self.page_table.len() != self.blk_locs_in_mem.len() {
            return false;
        }
        self.blk_locs_in_mem.iter().all(|(b, slot)| {
            self.blks_in_mem.test(*b as usize)
                && self
                    .page_table
                    .slot_for_mem_slot(*slot)
                    .map(|pos| self.page_table.entry(pos).block_num == *b)
                    .unwrap_or(false)
        })
    }

    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    fn debug_display(&self) {
        debug!("BLOCK   MSLOT   atime");
        debug!("=====   =====   =====");
        for b in 0..NUM_DISK_BLOCKS as BNum {
            if self.blks_in_mem.test(b as usize) {
                let slot = self.blk_locs_in_mem[&b];
                let atime = self
                    .page_table
                    .slot_for_mem_slot(slot)
                    .map(|pos| self.page_table.entry(pos).acc_time)
                    .unwrap_or(0);
                debug!("{:5}   {:5}   {:5}", b, slot, atime);
            }
        }
    }
}

impl Drop for MemMan {
    fn drop(&mut self) {
        if !self.shut_down {
            if let Err(e) = self.shutdown() {
                error!("shutdown flush failed: {}", e);
            }
        }
    }
}
