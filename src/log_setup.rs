//! Logger initialization (SPEC_FULL.md §A.1).
//!
//! All harness diagnostics — execution traces, breakpoint dispatch, Jcc
//! mismatches, taint violations — go through the `log` facade. `-l FILE`
//! redirects the installed logger's output stream to a file instead of
//! stderr; it does not introduce a second logging mechanism.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use env_logger::{Builder, Target};

use crate::error::HarnessError;

pub fn init(log_file: Option<&Path>, verbose: bool) -> Result<(), HarnessError> {
    let mut builder = Builder::new();
    let level = if verbose {
        log::LevelFilter::Trace
    } else {
        log::LevelFilter::Info
    };
    builder.filter_level(level);

    if let Some(path) = log_file {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|source| HarnessError::LogFile {
                path: path.to_path_buf(),
                source,
            })?;
        builder.target(Target::Pipe(Box::new(file) as Box<dyn Write + Send>));
    }

    // In test binaries env_logger may already be installed by an earlier
    // test in the same process; ignore the resulting error rather than
    // panicking the whole test run.
    let _ = builder.try_init();
    Ok(())
}
