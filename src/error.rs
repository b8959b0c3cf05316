use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the storage engine.
///
/// Capacity exhaustion and lock rejection are deliberately absent: those
/// are reported through sentinel values and `false` returns so the caller
/// can retry or move on. Everything here either aborts the operation in
/// progress (I/O) or marks data that must not be trusted (corrupt frames).
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("bad size for {}: expected {expected} bytes, found {actual}", path.display())]
    BadFileSize {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("journal frame corrupt at offset {offset}: {reason}")]
    CorruptFrame { offset: u64, reason: String },

    #[error("bit array dimensions {array_size}x{bitset_size} invalid")]
    BadBitDims {
        array_size: usize,
        bitset_size: usize,
    },

    #[error("bit array size mismatch: {left} bits vs {right} bits")]
    BitSizeMismatch { left: usize, right: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
