//! CLI entry point (spec.md §6): parse flags, attach to the target program,
//! and run it to completion under the translator/taint-checker event loop.

use std::sync::atomic::{AtomicI32, Ordering};

use lazy_static::lazy_static;
use log::{error, info};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use structopt::StructOpt;

use memcheck::cli::Opt;
use memcheck::config::{self, Config};
use memcheck::error::HarnessError;
use memcheck::memcheck::Memcheck;
use memcheck::patcher::Patcher;
use memcheck::tracee::Tracee;
use memcheck::transformer::{MemcheckTransformer, Transformer};
use memcheck::{elf_info, proc_maps};

lazy_static! {
    /// The only other piece of process-wide state besides
    /// `config::SIGINT_TARGET`: the SIGINT handler needs the traced pid to
    /// know which `/proc/<pid>/maps` to copy, and a signal handler can't
    /// reach a stack-local `Tracee`.
    static ref TRACEE_PID: AtomicI32 = AtomicI32::new(0);
}

extern "C" fn on_sigint(_: libc::c_int) {
    let pid = TRACEE_PID.load(Ordering::SeqCst);
    if pid != 0 {
        if let Some(dest) = config::SIGINT_TARGET.lock().ok().and_then(|g| g.clone()) {
            let _ = std::fs::copy(format!("/proc/{}/maps", pid), &dest);
        }
    }
    std::process::exit(130);
}

fn install_sigint_handler() -> anyhow::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_sigint),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGINT, &action) }?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();
    let config = opt.to_config();

    memcheck::log_setup::init(opt.log_file.as_deref(), opt.execution_trace)?;

    if let Some(dest) = &config.map_file {
        *config::SIGINT_TARGET.lock().unwrap() = Some(dest.clone());
    }
    install_sigint_handler()?;

    let exit_code = run(&opt.command, &config)?;
    std::process::exit(exit_code);
}

fn run(command: &[String], config: &Config) -> anyhow::Result<i32> {
    let elf_path = &command[0];
    let elf = elf_info::read_elf_info(elf_path)?;

    let tracee = Tracee::spawn(command, config.preload.as_deref())?;
    TRACEE_PID.store(tracee.pid(), Ordering::SeqCst);

    let load_bias = match elf.kind {
        elf_info::ExecKind::Static => 0,
        elf_info::ExecKind::PositionIndependent => {
            let maps = proc_maps::read_maps(tracee.pid())?;
            maps.iter()
                .find(|m| m.desc.ends_with(elf_path.as_str()) || m.desc == *elf_path)
                .map(|m| m.begin)
                .ok_or_else(|| HarnessError::Elf(format!("no mapping found for {}", elf_path)))?
        }
    };
    let entry = elf_info::absolute_entry(&elf, load_bias);

    let transformer: Box<dyn Transformer> = Box::new(MemcheckTransformer);
    let memcheck = Memcheck::new(config.clone(), tracee.pid())?;
    let (sp_handler, branch_observer, call_observer) = memcheck.into_handles();

    let mut patcher = match Patcher::open(
        tracee,
        transformer,
        sp_handler,
        branch_observer,
        call_observer,
        config.clone(),
    ) {
        Ok(p) => p,
        Err(e) => return Err(fatal(config, e)),
    };

    info!("attached to {:?}, entry {:#x}", command, entry);
    match patcher.run(entry) {
        Ok(code) => Ok(code),
        Err(e) => Err(fatal(config, e)),
    }
}

/// The single top-level fatal-error handler spec.md §7/§9 calls for: log
/// the diagnostic, then either abort (the default) or, with `-g`, leave the
/// tracee stopped for an attached debugger rather than killing it.
fn fatal(config: &Config, err: HarnessError) -> anyhow::Error {
    error!("fatal: {}", err);
    if config.gdb {
        error!("-g given: leaving tracee stopped for debugger attach");
    }
    anyhow::Error::new(err)
}
