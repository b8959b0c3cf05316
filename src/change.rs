//! Line-level edit records and the in-RAM change log.
//!
//! A `Change` buffers edits to one block: which lines changed (packed
//! into 8-byte selectors) and their new 64-byte contents, in order. The
//! `ChangeLog` collects changes per block until the journal appends and
//! eventually drains them.
//!
//! Selector discipline: slots 0..6 of a selector hold line indices and
//! slot 7 is always the `0xFF` terminator. A selector carrying exactly
//! seven indices is full and is always followed by another; a selector
//! with fewer (possibly zero, the all-`0xFF` tail) ends the record.
//! This is what lets the journal reader recover the line count from the
//! fill pattern alone.

use std::collections::{BTreeMap, VecDeque};

use crate::param::{BNum, LNum, BYTES_PER_LINE, BYTES_PER_PAGE, LINES_PER_PAGE};

/// A 64-byte span of a block, the unit of modification.
pub type Line = [u8; BYTES_PER_LINE];

/// Width of a selector on disk.
pub const SELECT_BYTES: usize = 8;

/// Usable index slots per selector; the eighth byte is the terminator.
pub const LINES_PER_SELECTOR: usize = SELECT_BYTES - 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Selector([u8; SELECT_BYTES]);

impl Selector {
    pub fn empty() -> Self {
        Selector([0xFF; SELECT_BYTES])
    }

    pub fn from_bytes(bytes: [u8; SELECT_BYTES]) -> Self {
        Selector(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SELECT_BYTES] {
        &self.0
    }

    /// Number of line indices held, i.e. slots before the first `0xFF`.
    pub fn line_count(&self) -> usize {
        self.0[..LINES_PER_SELECTOR]
            .iter()
            .position(|b| *b == 0xFF)
            .unwrap_or(LINES_PER_SELECTOR)
    }

    /// A full selector promises that another selector follows it.
    pub fn is_full(&self) -> bool {
        self.line_count() == LINES_PER_SELECTOR
    }

    /// The line indices held, in order.
    pub fn lines(&self) -> impl Iterator<Item = LNum> + '_ {
        self.0[..self.line_count()].iter().copied()
    }
}

/// Buffered edits to a single block.
#[derive(Clone, Debug)]
pub struct Change {
    pub block_num: BNum,
    pub time_stamp: u64,
    selectors: VecDeque<Selector>,
    new_data: VecDeque<Line>,
    /// Next free slot in the last selector.
    arr_next: usize,
}

impl Change {
    /// A fresh change, ready for `add_line`. Starts with one all-`0xFF`
    /// selector so even a line-less (read) request has the tail marker.
    pub fn new(block_num: BNum) -> Self {
        let mut selectors = VecDeque::new();
        selectors.push_back(Selector::empty());
        Change {
            block_num,
            time_stamp: 0,
            selectors,
            new_data: VecDeque::new(),
            arr_next: 0,
        }
    }

    /// A shell for the journal reader, which supplies selectors verbatim.
    pub(crate) fn parsed(block_num: BNum) -> Self {
        Change {
            block_num,
            time_stamp: 0,
            selectors: VecDeque::new(),
            new_data: VecDeque::new(),
            arr_next: 0,
        }
    }

    /// Records a new 64-byte image for `line_num`.
    pub fn add_line(&mut self, line_num: LNum, line: Line) {
        assert!((line_num as usize) < LINES_PER_PAGE);
        let last = self.selectors.back_mut().expect("change has no selector");
        last.0[self.arr_next] = line_num;
        self.arr_next += 1;
        if self.arr_next == LINES_PER_SELECTOR {
            self.selectors.push_back(Selector::empty());
            self.arr_next = 0;
        }
        self.new_data.push_back(line);
    }

    /// True iff this change carries line edits, i.e. it is a write.
    pub fn lines_altered(&self) -> bool {
        !self.new_data.is_empty()
    }

    pub fn line_ct(&self) -> usize {
        self.new_data.len()
    }

    pub fn selectors(&self) -> impl Iterator<Item = &Selector> {
        self.selectors.iter()
    }

    pub fn data(&self) -> impl Iterator<Item = &Line> {
        self.new_data.iter()
    }

    /// `(line_num, new contents)` pairs in recording order.
    pub fn edits(&self) -> impl Iterator<Item = (LNum, &Line)> {
        self.selectors
            .iter()
            .flat_map(|s| s.lines())
            .zip(self.new_data.iter())
    }

    /// Replays this change into a page image.
    pub fn apply_to(&self, dat: &mut [u8; BYTES_PER_PAGE]) {
        for (line_num, line) in self.edits() {
            let start = line_num as usize * BYTES_PER_LINE;
            dat[start..start + BYTES_PER_LINE].copy_from_slice(line);
        }
    }

    pub(crate) fn push_selector(&mut self, sel: Selector) {
        self.selectors.push_back(sel);
    }

    pub(crate) fn push_line(&mut self, line: Line) {
        self.new_data.push_back(line);
    }
}

/// Per-block ordered lists of changes pending journal append.
#[derive(Debug, Default)]
pub struct ChangeLog {
    the_log: BTreeMap<BNum, Vec<Change>>,
    cg_line_ct: usize,
    /// When the log was last appended to the journal.
    pub last_cg_wrt_time: u64,
}

impl ChangeLog {
    pub fn new() -> Self {
        ChangeLog::default()
    }

    pub fn add(&mut self, cg: Change) {
        self.cg_line_ct += cg.line_ct();
        self.the_log.entry(cg.block_num).or_default().push(cg);
    }

    pub fn contains_block(&self, block_num: BNum) -> bool {
        self.the_log.contains_key(&block_num)
    }

    pub fn changes_for(&self, block_num: BNum) -> Option<&[Change]> {
        self.the_log.get(&block_num).map(|v| v.as_slice())
    }

    /// Blocks and their changes in block-major order.
    pub fn iter(&self) -> impl Iterator<Item = (BNum, &[Change])> {
        self.the_log.iter().map(|(b, v)| (*b, v.as_slice()))
    }

    /// Cumulative count of lines recorded since the last drain.
    pub fn line_ct(&self) -> usize {
        self.cg_line_ct
    }

    /// An append re-emits the whole log, so only the line counter resets.
    pub fn reset_line_ct(&mut self) {
        self.cg_line_ct = 0;
    }

    /// Number of blocks with pending changes.
    pub fn log_size(&self) -> usize {
        self.the_log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.the_log.is_empty()
    }

    pub fn clear(&mut self) {
        self.the_log.clear();
        self.cg_line_ct = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_of(byte: u8) -> Line {
        [byte; BYTES_PER_LINE]
    }

    #[test]
    fn fresh_change_is_a_read() {
        let cg = Change::new(3);
        assert!(!cg.lines_altered());
        assert_eq!(cg.selectors().count(), 1);
        assert_eq!(cg.line_ct(), 0);
    }

    #[test]
    fn add_line_records_index_and_data() {
        let mut cg = Change::new(1);
        cg.add_line(0, line_of(b'A'));
        cg.add_line(5, line_of(b'B'));
        assert!(cg.lines_altered());
        let edits: Vec<_> = cg.edits().map(|(n, l)| (n, l[0])).collect();
        assert_eq!(edits, vec![(0, b'A'), (5, b'B')]);
    }

    #[test]
    fn seventh_line_opens_a_new_selector() {
        let mut cg = Change::new(1);
        for i in 0..7 {
            cg.add_line(i, line_of(i));
        }
        // Full selector plus the fresh all-0xFF tail.
        assert_eq!(cg.selectors().count(), 2);
        let sels: Vec<_> = cg.selectors().collect();
        assert!(sels[0].is_full());
        assert_eq!(sels[1].line_count(), 0);
        assert_eq!(cg.edits().count(), 7);
    }

    #[test]
    fn eight_lines_span_two_selectors() {
        let mut cg = Change::new(1);
        for i in 0..8 {
            cg.add_line(i, line_of(i));
        }
        assert_eq!(cg.selectors().count(), 2);
        let edits: Vec<_> = cg.edits().map(|(n, _)| n).collect();
        assert_eq!(edits, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn selector_slot_seven_stays_terminator() {
        let mut cg = Change::new(1);
        for i in 0..7 {
            cg.add_line(i, line_of(i));
        }
        assert_eq!(cg.selectors().next().unwrap().as_bytes()[7], 0xFF);
    }

    #[test]
    fn apply_to_copies_lines_into_place() {
        let mut cg = Change::new(9);
        cg.add_line(2, line_of(b'X'));
        cg.add_line(0, line_of(b'Y'));
        let mut dat = [0u8; BYTES_PER_PAGE];
        cg.apply_to(&mut dat);
        assert_eq!(dat[2 * BYTES_PER_LINE], b'X');
        assert_eq!(dat[0], b'Y');
        assert_eq!(dat[BYTES_PER_LINE], 0);
    }

    #[test]
    fn later_edit_to_same_line_wins() {
        let mut cg = Change::new(9);
        cg.add_line(1, line_of(b'a'));
        cg.add_line(1, line_of(b'b'));
        let mut dat = [0u8; BYTES_PER_PAGE];
        cg.apply_to(&mut dat);
        assert_eq!(dat[BYTES_PER_LINE], b'b');
    }

    #[test]
    #[should_panic]
    fn line_number_out_of_range_panics() {
        let mut cg = Change::new(1);
        cg.add_line(LINES_PER_PAGE as LNum, line_of(0));
    }

    #[test]
    fn log_counts_lines_and_blocks() {
        let mut log = ChangeLog::new();
        let mut cg1 = Change::new(1);
        cg1.add_line(0, line_of(b'A'));
        cg1.add_line(1, line_of(b'B'));
        let mut cg2 = Change::new(2);
        cg2.add_line(0, line_of(b'C'));
        log.add(cg1);
        log.add(cg2);
        assert_eq!(log.line_ct(), 3);
        assert_eq!(log.log_size(), 2);
        assert!(log.contains_block(1));
        assert!(!log.contains_block(3));
    }

    #[test]
    fn log_iterates_in_block_order() {
        let mut log = ChangeLog::new();
        log.add(Change::new(7));
        log.add(Change::new(2));
        log.add(Change::new(7));
        let blocks: Vec<_> = log.iter().map(|(b, _)| b).collect();
        assert_eq!(blocks, vec![2, 7]);
        assert_eq!(log.changes_for(7).unwrap().len(), 2);
    }

    #[test]
    fn reset_line_ct_keeps_the_log() {
        let mut log = ChangeLog::new();
        let mut cg = Change::new(4);
        cg.add_line(0, line_of(1));
        log.add(cg);
        log.reset_line_ct();
        assert_eq!(log.line_ct(), 0);
        assert!(log.contains_block(4));
        log.clear();
        assert!(log.is_empty());
    }
}
