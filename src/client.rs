//! Random workload generator.
//!
//! Stands in for real users: drives the file manager with a mixed stream
//! of create/delete, add/remove-block, and read/write requests. In test
//! mode the generator is seeded and the first edited line of every write
//! names its block, which makes the resulting disk image recognizable.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::change::{Change, Line};
use crate::clock::Clock;
use crate::error::Result;
use crate::file_man::FileMan;
use crate::param::{
    BNum, INum, LNum, BYTES_PER_LINE, CT_INODE_BNUMS, LINES_PER_PAGE, NUM_INODES, PAGES_PER_JRNL,
    SENTINEL_BNUM, SENTINEL_INUM,
};

/// Requests per short run.
const SHORT_RUN: usize = 256;

/// Long runs issue this many requests per journal page, enough to wrap
/// the journal file.
const RUN_FACTOR: usize = 112;

/// Percentage of r/w requests that are reads.
const RD_PCT: u32 = 60;

/// Upper bound on the random inter-request delay, in µs.
const MAX_DELAY_USEC: u64 = 850;

/// Most lines one write request touches.
const MAX_LINES_CHANGED: usize = 15;

pub struct Client {
    my_id: u32,
    rng: StdRng,
    num_requests: usize,
    test_mode: bool,
    clock: Clock,
}

impl Client {
    pub fn new(my_id: u32, test_mode: bool, long_run: bool, seed: u64, clock: Clock) -> Self {
        let rng = if test_mode {
            StdRng::seed_from_u64(seed)
        } else {
            StdRng::from_entropy()
        };
        let num_requests = if long_run {
            RUN_FACTOR * PAGES_PER_JRNL
        } else {
            SHORT_RUN
        };
        Client {
            my_id,
            rng,
            num_requests,
            test_mode,
            clock,
        }
    }

    /// Issues the whole request stream against `fm`.
    pub fn make_requests(&mut self, fm: &mut FileMan) -> Result<()> {
        for _ in 0..self.num_requests {
            self.rnd_delay();
            let act: u32 = self.rng.gen_range(0..=99);
            if act < 5 {
                self.create_or_delete(fm);
            } else if act < 6 {
                self.delete_or_create(fm);
            } else if act < 20 {
                self.add_rnd_block(fm)?;
            } else if act < 23 {
                self.remv_rnd_block(fm);
            } else {
                self.make_rw_request(fm)?;
            }
        }
        Ok(())
    }

    /// Creates while there is room, deletes a random inode otherwise.
    fn create_or_delete(&mut self, fm: &mut FileMan) {
        if fm.count_files() < NUM_INODES - 1 {
            fm.create_file();
        } else {
            let tgt = self.rng.gen_range(0..NUM_INODES as INum);
            fm.delete_file(self.my_id, tgt);
        }
    }

    /// Deletes an existing file if any, creates one otherwise.
    fn delete_or_create(&mut self, fm: &mut FileMan) {
        let tgt = self.rnd_file_num(fm);
        if tgt != SENTINEL_INUM {
            fm.delete_file(self.my_id, tgt);
        } else {
            fm.create_file();
        }
    }

    fn add_rnd_block(&mut self, fm: &mut FileMan) -> Result<()> {
        let tgt = self.rnd_file_num(fm);
        if tgt != SENTINEL_INUM && fm.count_blocks(tgt) < CT_INODE_BNUMS - 1 {
            fm.add_block(self.my_id, tgt)?;
        }
        Ok(())
    }

    fn remv_rnd_block(&mut self, fm: &mut FileMan) {
        let tgt_nd = self.rnd_file_num(fm);
        if tgt_nd != SENTINEL_INUM {
            let tgt_blk = self.rnd_blk_num(fm, tgt_nd);
            if tgt_blk != SENTINEL_BNUM {
                fm.remv_block(self.my_id, tgt_nd, tgt_blk);
            }
        }
    }

    fn make_rw_request(&mut self, fm: &mut FileMan) -> Result<()> {
        let tgt_nd = self.rnd_file_num(fm);
        if tgt_nd == SENTINEL_INUM {
            return Ok(());
        }
        let tgt_blk = self.rnd_blk_num(fm, tgt_nd);
        if tgt_blk == SENTINEL_BNUM {
            return Ok(());
        }
        let do_wrt = self.rng.gen_range(0..=99) >= RD_PCT;
        let mut cg = Change::new(tgt_blk);
        if do_wrt {
            self.set_up_cgs(&mut cg);
        }
        fm.submit_request(do_wrt, self.my_id, tgt_nd, cg)
    }

    /// A uniformly chosen existing file, or the sentinel when none exist.
    fn rnd_file_num(&mut self, fm: &FileMan) -> INum {
        if fm.count_files() == 0 {
            return SENTINEL_INUM;
        }
        loop {
            let tgt = self.rng.gen_range(0..NUM_INODES as INum);
            if fm.file_exists(tgt) {
                return tgt;
            }
        }
    }

    /// A uniformly chosen block of the file, or the sentinel.
    fn rnd_blk_num(&mut self, fm: &FileMan, i_num: INum) -> BNum {
        if fm.count_blocks(i_num) == 0 {
            return SENTINEL_BNUM;
        }
        let node = fm.inode(i_num);
        let valid: Vec<BNum> = node
            .b_nums
            .iter()
            .copied()
            .filter(|b| *b != SENTINEL_BNUM)
            .collect();
        valid.choose(&mut self.rng).copied().unwrap_or(SENTINEL_BNUM)
    }

    /// Fills a write request with 1..=15 random line edits. In test mode
    /// the first edit is line 0 naming the block.
    fn set_up_cgs(&mut self, cg: &mut Change) {
        let num_cgs = self.rng.gen_range(1..=MAX_LINES_CHANGED);
        for i in 0..num_cgs {
            let (lin_num, text) = if self.test_mode && i == 0 {
                (0usize, format!("Block {}\n", cg.block_num))
            } else {
                let lo = if self.test_mode { 1 } else { 0 };
                let n = self.rng.gen_range(lo..LINES_PER_PAGE);
                (n, format!("Line {}\n", n))
            };
            cg.add_line(lin_num as LNum, line_from(&text));
        }
    }

    /// Spins out a random pause between requests; under the counter
    /// clock the spin itself advances time.
    fn rnd_delay(&mut self) {
        let delay = self.rng.gen_range(0..=MAX_DELAY_USEC);
        let end = self.clock.now() + delay;
        while self.clock.now() < end {}
    }
}

/// Packs ASCII text into a line: zero-padded, with the text length in
/// the final byte.
fn line_from(s: &str) -> Line {
    let bytes = s.as_bytes();
    assert!(bytes.len() < BYTES_PER_LINE);
    let mut line = [0u8; BYTES_PER_LINE];
    line[..bytes.len()].copy_from_slice(bytes);
    line[BYTES_PER_LINE - 1] = bytes.len() as u8;
    line
}
