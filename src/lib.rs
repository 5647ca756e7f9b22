//! Dynamic binary instrumentation harness that detects uninitialized-memory
//! reads in an unmodified x86-64 Linux tracee (spec.md §1).
//!
//! [`patcher::Patcher`] is the entry point for embedding the harness;
//! `src/main.rs` is a thin CLI wrapper around it.

pub mod block;
pub mod checksum_mix;
pub mod cli;
pub mod config;
pub mod elf_info;
pub mod error;
pub mod instruction;
pub mod log_setup;
pub mod memcheck;
pub mod page_tracker;
pub mod patcher;
pub mod pool;
pub mod proc_maps;
pub mod registers;
pub mod sequence_point;
pub mod snapshot;
pub mod state;
pub mod syscall_checker;
pub mod syscall_table;
pub mod terminator;
pub mod tracee;
pub mod transformer;
