//! Driver: parses the command line, sets up logging, assembles the
//! engine, runs the client workload, and shuts down cleanly.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use clap::Parser;
use log::LevelFilter;

use jrnldisk::change::ChangeLog;
use jrnldisk::clock::Clock;
use jrnldisk::client::Client;
use jrnldisk::file_man::FileMan;
use jrnldisk::journal::Journal;
use jrnldisk::mem_man::MemMan;
use jrnldisk::memory::Memory;
use jrnldisk::sim_disk::SimDisk;
use jrnldisk::status::{CrashChk, Status};

/// Simulated journaled block-storage engine.
///
/// Runs a randomized request stream against a disk simulated in a set
/// of backing files in the working directory, journaling every change
/// for crash recovery.
#[derive(Parser, Debug)]
#[command(name = "jrnldisk", version)]
struct Opts {
    /// Send extra debugging information to the operational log.
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Deterministic run: seeded generator, counter clock, and each
    /// written block's first line holds its block number.
    #[arg(short = 't', long)]
    test: bool,

    /// Seed for the request generator (used in test mode).
    #[arg(short = 's', long, default_value_t = 7900)]
    seed: u64,

    /// Long run: issue enough requests to wrap the journal file.
    #[arg(short = 'l', short_alias = 'L', long)]
    long_run: bool,
}

const D_FILE_NAME: &str = "disk_file.bin";
const J_FILE_NAME: &str = "jrnl_file.bin";
const F_FILE_NAME: &str = "free_file.bin";
const N_FILE_NAME: &str = "node_file.bin";
const S_FILE_NAME: &str = "status.txt";
const LOG_FILE_NAME: &str = "output.txt";

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    let mut log_file = File::create(LOG_FILE_NAME)
        .with_context(|| format!("cannot open {}", LOG_FILE_NAME))?;
    let argv: Vec<String> = std::env::args().collect();
    let epoch_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    writeln!(log_file, "OUTPUT: {}: {}", argv.join(" "), epoch_secs)?;

    env_logger::Builder::new()
        .filter_level(if opts.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .init();

    let clock = if opts.test {
        Clock::counter()
    } else {
        Clock::real()
    };

    // The crash checker must read the previous run's marker before
    // anything below overwrites it.
    let crash_chk = CrashChk::new(Path::new(S_FILE_NAME));
    let mut status = Status::new(S_FILE_NAME);

    let mut sim_disk = SimDisk::new(
        &mut status,
        Path::new(D_FILE_NAME),
        Path::new(J_FILE_NAME),
        Path::new(F_FILE_NAME),
        Path::new(N_FILE_NAME),
    )
    .context("backing file setup failed")?;

    let mut change_log = ChangeLog::new();
    let journal = Journal::new(
        Path::new(J_FILE_NAME),
        &mut sim_disk,
        &mut change_log,
        &mut status,
        &crash_chk,
        clock.clone(),
    )
    .context("journal setup failed")?;

    let mem_man = MemMan::new(
        Memory::new(),
        sim_disk,
        journal,
        change_log,
        status,
        clock.clone(),
        opts.verbose,
    )?;

    let mut file_man = FileMan::new(
        Path::new(N_FILE_NAME),
        Path::new(F_FILE_NAME),
        mem_man,
        clock.clone(),
    )?;

    let mut client = Client::new(1, opts.test, opts.long_run, opts.seed, clock);
    client.make_requests(&mut file_man)?;

    file_man.shutdown()?;
    Ok(())
}
