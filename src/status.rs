//! Persistent status marker and crash detection.
//!
//! The engine records where it is in its lifecycle as a single ASCII line
//! in the status file, replaced atomically (write a sibling `.tmp`, then
//! rename over the original). On startup the previous run's marker is the
//! recovery signal: any value beginning with `'C'` ("Change log written",
//! "Crash during ...") means the journal holds changes that never reached
//! the data file.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use log::error;

use crate::error::Result;

/// Sibling path used for the atomic replace.
fn tmp_path(path: &Path) -> PathBuf {
    path.with_extension("tmp")
}

/// Replaces `path` by writing through a temporary sibling file. If the
/// writer produces no bytes, the original is left untouched.
pub fn replace_file<F>(path: &Path, write_fn: F) -> Result<()>
where
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let tmp = tmp_path(path);
    let mut f = File::create(&tmp)?;
    write_fn(&mut f)?;
    f.sync_all()?;
    if f.metadata()?.len() == 0 {
        drop(f);
        fs::remove_file(&tmp)?;
        return Ok(());
    }
    drop(f);
    fs::rename(&tmp, path)?;
    Ok(())
}

pub struct Status {
    path: PathBuf,
}

impl Status {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Status { path: path.into() }
    }

    /// First line of the marker, trimmed.
    pub fn read(&self) -> Result<String> {
        let f = File::open(&self.path)?;
        let mut line = String::new();
        BufReader::new(f).read_line(&mut line)?;
        Ok(line.trim_end().to_string())
    }

    /// Replaces the marker with `msg`. Creates the file directly if it
    /// does not exist yet; otherwise goes through the tmp+rename path so
    /// a crash mid-write cannot leave a truncated marker.
    pub fn write(&mut self, msg: &str) -> Result<()> {
        if self.path.exists() {
            replace_file(&self.path, |f| writeln!(f, "{}", msg))
        } else {
            let mut f = File::create(&self.path)?;
            writeln!(f, "{}", msg)?;
            Ok(())
        }
    }
}

/// Reads the previous run's marker at startup.
///
/// If the status file is missing, a partial replace may have left only
/// the tmp sibling; fall back to it before concluding there is no
/// history.
pub struct CrashChk {
    last_status: String,
}

impl CrashChk {
    pub fn new(status_path: &Path) -> Self {
        let last_status = read_first_line(status_path)
            .or_else(|| read_first_line(&tmp_path(status_path)))
            .unwrap_or_default();
        CrashChk { last_status }
    }

    pub fn last_status(&self) -> &str {
        &self.last_status
    }

    /// True iff the previous run stopped after writing its change log to
    /// the journal but before draining it.
    pub fn crashed(&self) -> bool {
        self.last_status.starts_with('C')
    }
}

fn read_first_line(path: &Path) -> Option<String> {
    match File::open(path) {
        Ok(f) => {
            let mut line = String::new();
            if let Err(e) = BufReader::new(f).read_line(&mut line) {
                error!("cannot read status marker {}: {}", path.display(), e);
                return None;
            }
            Some(line.trim_end().to_string())
        }
        Err(_) => None,
    }
}
