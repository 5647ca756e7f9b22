//! Fatal error taxonomy (spec.md §7).
//!
//! Recoverable conditions — RSB-full-at-call, RSB-mispredict-at-ret,
//! indirect-cache miss — are *not* modeled here: they are handled inline by
//! the terminator that hits them and never escape as an `Err`. Everything
//! in this enum is a condition spec.md §7 calls fatal (modulo `-g`, which
//! is a presentation choice handled by the caller of
//! [`crate::patcher::Patcher::run`], not by this type).

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("failed to decode instruction at {addr:#x}: bytes {bytes:02x?}")]
    Decode { addr: u64, bytes: Vec<u8> },

    #[error("no relocation case applied to instruction at {addr:#x} (moving to {new_addr:#x})")]
    Relocate { addr: u64, new_addr: u64 },

    #[error("{pool} pool exhausted: requested {requested} bytes, {remaining} remaining")]
    PoolExhausted {
        pool: &'static str,
        requested: usize,
        remaining: usize,
    },

    #[error("unexpected signal {signal} in tracee at pc {pc:#x}")]
    UnexpectedSignal { signal: i32, pc: u64 },

    #[error("taint violation: {detail}")]
    TaintViolation { detail: String },

    #[error("checksum divergence: {detail}")]
    ChecksumDivergence { detail: String },

    #[error("block pool address map is inconsistent for original address {addr:#x}")]
    DuplicateBlock { addr: u64 },

    #[error("could not open log file {path:?}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Ptrace(#[from] nix::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed ELF for traced binary: {0}")]
    Elf(String),

    #[error("remote syscall failed: {0}")]
    Remote(String),
}

pub type Result<T> = std::result::Result<T, HarnessError>;
