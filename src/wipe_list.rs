//! Blocks whose disk contents must be zeroed before reuse.
//!
//! Freed blocks keep their old bytes in the data file. Handing such a
//! block to a new file would leak the previous owner's data, so frees
//! mark the block here and the journal zero-fills marked blocks during a
//! drain. `is_ripe` throttles how long marks may accumulate before a
//! drain is forced.

use crate::param::{BNum, BITS_PER_PAGE, DIRTY_BEFORE_WIPE, NUM_WIPE_PAGES};
use crate::util::BitArray;

pub struct WipeList {
    dirty: BitArray,
}

impl WipeList {
    pub fn new() -> Self {
        WipeList {
            dirty: BitArray::new(NUM_WIPE_PAGES, BITS_PER_PAGE)
                .expect("wipe list dimensions are fixed"),
        }
    }

    pub fn set_dirty(&mut self, b_num: BNum) {
        self.dirty.set(b_num as usize);
    }

    pub fn is_dirty(&self, b_num: BNum) -> bool {
        self.dirty.test(b_num as usize)
    }

    pub fn clear_array(&mut self) {
        self.dirty.reset_all();
    }

    pub fn none_dirty(&self) -> bool {
        self.dirty.none()
    }

    /// Dirty blocks currently marked, in ascending order.
    pub fn dirty_blocks(&self) -> impl Iterator<Item = BNum> + '_ {
        (0..self.dirty.size() as BNum).filter(|b| self.dirty.test(*b as usize))
    }

    /// True once enough blocks are marked to warrant a forced drain.
    pub fn is_ripe(&self) -> bool {
        self.dirty.count() >= DIRTY_BEFORE_WIPE
    }
}

impl Default for WipeList {
    fn default() -> Self {
        WipeList::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marks_and_queries() {
        let mut wl = WipeList::new();
        wl.set_dirty(5);
        wl.set_dirty(10);
        assert!(wl.is_dirty(5));
        assert!(!wl.is_dirty(7));
        assert!(!wl.is_ripe());
        wl.clear_array();
        assert!(!wl.is_dirty(5));
        assert!(wl.none_dirty());
    }

    #[test]
    fn ripeness_threshold() {
        let mut wl = WipeList::new();
        for b in 0..DIRTY_BEFORE_WIPE as BNum - 1 {
            wl.set_dirty(b);
        }
        assert!(!wl.is_ripe());
        wl.set_dirty(DIRTY_BEFORE_WIPE as BNum - 1);
        assert!(wl.is_ripe());
    }

    #[test]
    fn dirty_blocks_enumerates_marks() {
        let mut wl = WipeList::new();
        wl.set_dirty(3);
        wl.set_dirty(200);
        let marked: Vec<_> = wl.dirty_blocks().collect();
        assert_eq!(marked, vec![3, 200]);
    }
}
