//! End-to-end scenarios: full write round-trips through cache, change
//! log, journal, and data file, plus eviction, wrap-around, crash
//! recovery, and wipe-on-reuse behavior.

use std::path::Path;

use tempfile::{tempdir, TempDir};

use jrnldisk::change::{Change, ChangeLog, Line};
use jrnldisk::clock::Clock;
use jrnldisk::client::Client;
use jrnldisk::crc;
use jrnldisk::file_man::FileMan;
use jrnldisk::journal::{Journal, META_LEN};
use jrnldisk::mem_man::MemMan;
use jrnldisk::memory::Memory;
use jrnldisk::param::{
    BNum, BLOCK_BYTES, BYTES_PER_LINE, JRNL_SIZE, NUM_DISK_BLOCKS, NUM_INODES, NUM_MEM_SLOTS,
    SENTINEL_BNUM, SENTINEL_INUM,
};
use jrnldisk::sim_disk::SimDisk;
use jrnldisk::status::{CrashChk, Status};

fn build_file_man(p: &Path) -> FileMan {
    let clock = Clock::counter();
    let crash_chk = CrashChk::new(&p.join("status.txt"));
    let mut status = Status::new(p.join("status.txt"));
    let mut disk = SimDisk::new(
        &mut status,
        &p.join("disk_file.bin"),
        &p.join("jrnl_file.bin"),
        &p.join("free_file.bin"),
        &p.join("node_file.bin"),
    )
    .unwrap();
    let mut cg_log = ChangeLog::new();
    let journal = Journal::new(
        &p.join("jrnl_file.bin"),
        &mut disk,
        &mut cg_log,
        &mut status,
        &crash_chk,
        clock.clone(),
    )
    .unwrap();
    let mem_man = MemMan::new(
        Memory::new(),
        disk,
        journal,
        cg_log,
        status,
        clock.clone(),
        false,
    )
    .unwrap();
    FileMan::new(
        &p.join("node_file.bin"),
        &p.join("free_file.bin"),
        mem_man,
        clock,
    )
    .unwrap()
}

fn rig() -> (TempDir, FileMan) {
    let dir = tempdir().unwrap();
    let fm = build_file_man(dir.path());
    (dir, fm)
}

fn line_from(text: &[u8]) -> Line {
    let mut line = [0u8; BYTES_PER_LINE];
    line[..text.len()].copy_from_slice(text);
    line
}

fn read_disk_block(fm: &mut FileMan, b: BNum) -> [u8; BLOCK_BYTES] {
    let mut block = [0u8; BLOCK_BYTES];
    fm.mem_man.sim_disk.read_block(b, &mut block).unwrap();
    block
}

/// Free blocks must not be referenced by any inode, and every cached
/// block must map to exactly one consistent page-table entry.
fn assert_consistent(fm: &FileMan) {
    assert!(fm.mem_man.check_cache());
    for i in 0..NUM_INODES as u32 {
        if !fm.inode_table().is_in_use(i) {
            continue;
        }
        for b in fm.inode_table().list_blocks(i) {
            assert!(
                !fm.free_list().is_free(b),
                "block {} owned by inode {} but marked free",
                b,
                i
            );
        }
    }
}

#[test]
fn single_write_round_trip() {
    let (_dir, mut fm) = rig();
    let i = fm.create_file();
    let b = fm.add_block(1, i).unwrap();
    assert_ne!(b, SENTINEL_BNUM);

    let mut cg = Change::new(b);
    cg.add_line(5, line_from(b"hello"));
    fm.submit_request(true, 1, i, cg).unwrap();
    fm.mem_man.flush_and_purge(true).unwrap();

    let block = read_disk_block(&mut fm, b);
    assert_eq!(&block[5 * BYTES_PER_LINE..5 * BYTES_PER_LINE + 5], b"hello");
    assert!(crc::page_is_valid(&block));
    assert_consistent(&fm);
}

#[test]
fn multi_line_changes_latest_wins() {
    let (_dir, mut fm) = rig();
    let i = fm.create_file();
    let b = fm.add_block(1, i).unwrap();

    let mut cg1 = Change::new(b);
    cg1.add_line(0, line_from(b"zero"));
    cg1.add_line(1, line_from(b"one"));
    cg1.add_line(2, line_from(b"two"));
    fm.submit_request(true, 1, i, cg1).unwrap();

    let mut cg2 = Change::new(b);
    cg2.add_line(3, line_from(b"three"));
    cg2.add_line(1, line_from(b"ONE!"));
    fm.submit_request(true, 1, i, cg2).unwrap();

    fm.mem_man.flush_and_purge(true).unwrap();

    let block = read_disk_block(&mut fm, b);
    assert_eq!(&block[..4], b"zero");
    assert_eq!(&block[BYTES_PER_LINE..BYTES_PER_LINE + 4], b"ONE!");
    assert_eq!(&block[2 * BYTES_PER_LINE..2 * BYTES_PER_LINE + 3], b"two");
    assert_eq!(&block[3 * BYTES_PER_LINE..3 * BYTES_PER_LINE + 5], b"three");
    // Untouched lines keep the prior (zeroed) disk image.
    for line in 4..62 {
        assert!(block[line * BYTES_PER_LINE..(line + 1) * BYTES_PER_LINE]
            .iter()
            .all(|byte| *byte == 0));
    }
    assert!(crc::page_is_valid(&block));
}

#[test]
fn cache_fills_then_evicts_lru() {
    let (_dir, mut fm) = rig();
    let i = fm.create_file();

    // Read blocks 0..=32 in order; the 33rd miss must push out block 0.
    for b in 0..NUM_MEM_SLOTS as BNum + 1 {
        fm.submit_request(false, 1, i, Change::new(b)).unwrap();
        assert_consistent(&fm);
    }

    assert_eq!(fm.mem_man.cached_count(), NUM_MEM_SLOTS);
    assert!(!fm.mem_man.is_cached(0));
    for b in 1..NUM_MEM_SLOTS as BNum + 1 {
        assert!(fm.mem_man.is_cached(b), "block {} missing from cache", b);
    }
    assert!(fm.mem_man.page_table().check_heap());

    // The next miss evicts block 1, now the oldest.
    fm.submit_request(false, 1, i, Change::new(40)).unwrap();
    assert!(!fm.mem_man.is_cached(1));
    assert!(fm.mem_man.is_cached(40));
}

#[test]
fn journal_wraps_and_drains() {
    let (_dir, mut fm) = rig();
    let mut wrapped = false;

    for round in 0..60u32 {
        let b = round % 8;
        let mut cg = Change::new(b);
        cg.add_line((round % 60) as u8, line_from(format!("round {}", round).as_bytes()));
        let mm = &mut fm.mem_man;
        mm.change_log.add(cg);
        mm.journal
            .wrt_cg_log_to_jrnl(&mut mm.change_log, &mut mm.status)
            .unwrap();
        let (get, put, _sz) = mm.journal.metadata().unwrap();
        if put < get {
            wrapped = true;
            break;
        }
    }
    assert!(wrapped, "appends never wrapped the journal");

    let mm = &mut fm.mem_man;
    mm.journal
        .purge_jrnl(&mut mm.sim_disk, &mut mm.change_log, &mut mm.status, true, false)
        .unwrap();
    assert_eq!(
        mm.journal.metadata().unwrap(),
        (-1, META_LEN as i64, 0)
    );

    // The drained frame carried every accumulated change; each touched
    // block must be CRC-valid on disk.
    for b in 0..8 {
        let block = read_disk_block(&mut fm, b);
        assert!(crc::page_is_valid(&block));
    }
}

#[test]
fn crash_recovery_replays_last_frame() {
    let dir = tempdir().unwrap();
    let p = dir.path();

    {
        let mut fm = build_file_man(p);
        let i = fm.create_file();
        let b = fm.add_block(1, i).unwrap();
        assert_eq!(b, 0);
        let mut cg = Change::new(b);
        cg.add_line(0, line_from(b"ABC"));
        fm.submit_request(true, 1, i, cg).unwrap();
        // Force the append, then die without draining.
        let mm = &mut fm.mem_man;
        mm.journal
            .wrt_cg_log_to_jrnl(&mut mm.change_log, &mut mm.status)
            .unwrap();
        assert_eq!(mm.status.read().unwrap(), "Change log written");
        std::mem::forget(fm);
    }

    // Nothing reached the data file before the crash.
    let raw = std::fs::read(p.join("disk_file.bin")).unwrap();
    assert_eq!(raw[0], 0);

    let crash_chk = CrashChk::new(&p.join("status.txt"));
    assert!(crash_chk.crashed());

    // Startup detects the marker and replays the journal.
    let mut fm = build_file_man(p);
    let block = read_disk_block(&mut fm, 0);
    assert_eq!(&block[..3], b"ABC");
    assert!(crc::page_is_valid(&block));

    let status = Status::new(p.join("status.txt"));
    assert_eq!(status.read().unwrap(), "Last change log recovered");
}

#[test]
fn freed_block_is_wiped_before_reuse() {
    let (_dir, mut fm) = rig();

    // First owner writes recognizable residue and drains it to disk.
    let i1 = fm.create_file();
    let b = fm.add_block(1, i1).unwrap();
    assert_eq!(b, 0);
    let mut cg = Change::new(b);
    cg.add_line(0, line_from(&[b'X'; BYTES_PER_LINE]));
    fm.submit_request(true, 1, i1, cg).unwrap();
    fm.mem_man.flush_and_purge(true).unwrap();
    assert_eq!(read_disk_block(&mut fm, b)[0], b'X');

    assert!(fm.delete_file(1, i1));
    assert!(fm.mem_man.journal.wipe_pending(b));

    // Allocate until the freed block comes around again.
    let i2 = fm.create_file();
    let mut owner = i2;
    let mut reused = SENTINEL_BNUM;
    loop {
        let got = fm.add_block(1, owner).unwrap();
        if got == b {
            reused = got;
            break;
        }
        if got == SENTINEL_BNUM || fm.count_blocks(owner) >= 8 {
            owner = fm.create_file();
            assert_ne!(owner, SENTINEL_INUM);
        }
    }
    assert_eq!(reused, b);

    // Before any new content lands, the reused block must read as
    // zeros under a fresh valid CRC.
    let block = read_disk_block(&mut fm, b);
    assert!(block[..BLOCK_BYTES - 4].iter().all(|byte| *byte == 0));
    assert!(crc::page_is_valid(&block));
    assert!(!fm.mem_man.journal.wipe_pending(b));
}

#[test]
fn deterministic_workload_leaves_consistent_state() {
    let dir = tempdir().unwrap();
    let mut fm = build_file_man(dir.path());
    let clock = Clock::counter();

    let mut client = Client::new(1, true, false, 7900, clock);
    client.make_requests(&mut fm).unwrap();
    assert_consistent(&fm);
    fm.shutdown().unwrap();

    assert_eq!(
        fm.mem_man.status.read().unwrap(),
        "Finishing"
    );

    // CRC totality: every block of the final disk image verifies.
    let raw = std::fs::read(dir.path().join("disk_file.bin")).unwrap();
    assert_eq!(raw.len(), NUM_DISK_BLOCKS * BLOCK_BYTES);
    for b in 0..NUM_DISK_BLOCKS {
        let mut block = [0u8; BLOCK_BYTES];
        block.copy_from_slice(&raw[b * BLOCK_BYTES..(b + 1) * BLOCK_BYTES]);
        assert!(crc::page_is_valid(&block), "block {} fails its CRC", b);
    }

    // Journal drained: metadata reset to the empty state.
    let jraw = std::fs::read(dir.path().join("jrnl_file.bin")).unwrap();
    assert_eq!(jraw.len(), JRNL_SIZE);
    assert_eq!(i64::from_le_bytes(jraw[0..8].try_into().unwrap()), -1);
    assert_eq!(i64::from_le_bytes(jraw[8..16].try_into().unwrap()), META_LEN as i64);
    assert_eq!(i64::from_le_bytes(jraw[16..24].try_into().unwrap()), 0);
}
