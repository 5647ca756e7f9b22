//! Command-line surface (spec.md §6): `memcheck [flags...] program [args...]`.

use std::path::PathBuf;
use structopt::StructOpt;

use crate::config::{Config, PredictionMode};

#[derive(StructOpt, Debug)]
#[structopt(
    name = "memcheck",
    about = "Detect uninitialized-memory reads in an unmodified x86-64 Linux program \
             via dynamic binary instrumentation."
)]
pub struct Opt {
    /// Transfer control to GDB on a fatal error instead of aborting the tracee.
    #[structopt(short = "g")]
    pub gdb: bool,

    /// Enable profiling: log coarse timing/throughput counters at exit.
    #[structopt(short = "p")]
    pub profile: bool,

    /// Force single-step of the tracee (debugging the translator itself).
    #[structopt(short = "s")]
    pub singlestep: bool,

    /// Print a per-instruction execution trace.
    #[structopt(short = "x")]
    pub execution_trace: bool,

    /// With -x, format the execution trace for use with `diff`.
    #[structopt(short = "d")]
    pub execution_trace_diff: bool,

    /// Dump single-step/breakpoint dispatch events.
    #[structopt(short = "b")]
    pub dump_ss_bkpts: bool,

    /// Dump conditional-jump prediction/resolution events.
    #[structopt(short = "j")]
    pub dump_jcc_info: bool,

    /// Open a log file (truncated) and send all diagnostics there.
    #[structopt(short = "l", parse(from_os_str))]
    pub log_file: Option<PathBuf>,

    /// Branch prediction policy for conditional-jump terminators.
    #[structopt(long = "prediction-mode", default_value = "direction")]
    pub prediction_mode: PredictionMode,

    /// Destination for the SIGINT /proc/<pid>/maps dump.
    #[structopt(long = "map-file", parse(from_os_str))]
    pub map_file: Option<PathBuf>,

    /// Shim library to inject into the tracee via LD_PRELOAD.
    #[structopt(long = "preload", parse(from_os_str))]
    pub preload: Option<PathBuf>,

    /// Taint the shadow-stack scratch region above SP at round start
    /// (see SPEC_FULL.md Open Question D.2; default is not to).
    #[structopt(long = "taint-shadow-stack")]
    pub taint_shadow_stack: bool,

    /// The program to run under instrumentation, and its arguments.
    #[structopt(required = true)]
    pub command: Vec<String>,
}

impl Opt {
    pub fn to_config(&self) -> Config {
        Config {
            gdb: self.gdb,
            profile: self.profile,
            singlestep: self.singlestep,
            execution_trace: self.execution_trace,
            execution_trace_diff: self.execution_trace_diff,
            dump_ss_bkpts: self.dump_ss_bkpts,
            dump_jcc_info: self.dump_jcc_info,
            prediction_mode: self.prediction_mode,
            map_file: self.map_file.clone(),
            preload: self.preload.clone(),
            taint_shadow_stack: self.taint_shadow_stack,
            ..Config::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_invocation() {
        let opt = Opt::from_iter(&["memcheck", "/bin/true"]);
        assert_eq!(opt.command, vec!["/bin/true".to_string()]);
        assert!(!opt.gdb);
        assert_eq!(opt.prediction_mode, PredictionMode::Direction);
    }

    #[test]
    fn parses_flags_and_trailing_args() {
        let opt = Opt::from_iter(&[
            "memcheck",
            "-g",
            "-x",
            "--prediction-mode=iclass",
            "--",
            "/bin/echo",
            "hi",
            "-n",
        ]);
        assert!(opt.gdb);
        assert!(opt.execution_trace);
        assert_eq!(opt.prediction_mode, PredictionMode::IClass);
        assert_eq!(
            opt.command,
            vec!["/bin/echo".to_string(), "hi".to_string(), "-n".to_string()]
        );
    }
}
