//! The ptrace wrapper spec.md §1 treats as an assumed external collaborator.
//! Everything the rest of the crate needs from the kernel's debugging
//! interface is exposed here: register access, memory read/write, resume
//! requests, and a "remote syscall" primitive used to bootstrap the Block
//! Pool / Pointer Pool / RSB before any code cache exists.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;

use libc::pid_t;
use log::{debug, trace};
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execvp, fork, ForkResult, Pid};

use crate::error::{HarnessError, Result};
use crate::registers::{FpRegisters, Registers};

/// nix 0.17 does not expose `PTRACE_GETFPREGS`/`PTRACE_SETFPREGS` helpers
/// (only `getregs`/`setregs`), so these mirror nix's own implementation of
/// those calls using the raw `libc::ptrace` request codes.
fn getfpregs(pid: Pid) -> std::result::Result<libc::user_fpregs_struct, nix::Error> {
    let mut data = std::mem::MaybeUninit::<libc::user_fpregs_struct>::uninit();
    let res = unsafe {
        libc::ptrace(
            libc::PTRACE_GETFPREGS,
            libc::pid_t::from(pid),
            std::ptr::null_mut::<libc::c_void>(),
            data.as_mut_ptr() as *mut libc::c_void,
        )
    };
    nix::errno::Errno::result(res)?;
    Ok(unsafe { data.assume_init() })
}

fn setfpregs(pid: Pid, regs: libc::user_fpregs_struct) -> std::result::Result<(), nix::Error> {
    let res = unsafe {
        libc::ptrace(
            libc::PTRACE_SETFPREGS,
            libc::pid_t::from(pid),
            std::ptr::null_mut::<libc::c_void>(),
            &regs as *const _ as *mut libc::c_void,
        )
    };
    nix::errno::Errno::result(res).map(drop)
}

/// Threshold above which memory reads/writes go through `/proc/<pid>/mem`
/// instead of word-at-a-time `PTRACE_PEEKDATA`/`PTRACE_POKEDATA`, matching
/// spec.md §6 ("tracee-memory reads/writes go via /proc/<pid>/mem when
/// large").
const PROC_MEM_THRESHOLD: usize = 32;

pub struct Tracee {
    pid: Pid,
    exe: String,
    mem: File,
}

impl Tracee {
    /// Forks a child that immediately `PTRACE_TRACEME`s and execs `cmd`,
    /// waits for its initial trap, and returns the attached `Tracee`.
    pub fn spawn(cmd: &[String], preload: Option<&std::path::Path>) -> Result<Tracee> {
        assert!(!cmd.is_empty());
        let c_cmd: Vec<CString> = cmd.iter().map(|s| CString::new(s.as_str()).unwrap()).collect();

        match unsafe { fork() }.map_err(HarnessError::Ptrace)? {
            ForkResult::Child => {
                ptrace::traceme().expect("PTRACE_TRACEME");
                if let Some(path) = preload {
                    std::env::set_var("LD_PRELOAD", path);
                }
                let c_cmd_refs: Vec<&std::ffi::CStr> = c_cmd.iter().map(|c| c.as_c_str()).collect();
                execvp(&c_cmd[0], &c_cmd_refs).expect("execvp");
                unreachable!("execvp does not return on success");
            }
            ForkResult::Parent { child } => {
                match waitpid(child, None).map_err(HarnessError::Ptrace)? {
                    WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
                    other => panic!("unexpected initial wait status: {:?}", other),
                }
                let mem = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(format!("/proc/{}/mem", child))
                    .map_err(HarnessError::Io)?;
                debug!("attached to pid {}", child);
                Ok(Tracee {
                    pid: child,
                    exe: cmd[0].clone(),
                    mem,
                })
            }
        }
    }

    pub fn pid(&self) -> pid_t {
        self.pid.as_raw()
    }

    pub fn exe(&self) -> &str {
        &self.exe
    }

    pub fn get_regs(&self) -> Result<Registers> {
        let inner = ptrace::getregs(self.pid).map_err(HarnessError::Ptrace)?;
        Ok(Registers::new(inner))
    }

    pub fn set_regs(&self, regs: &Registers) -> Result<()> {
        ptrace::setregs(self.pid, regs.ptrace()).map_err(HarnessError::Ptrace)
    }

    pub fn get_fpregs(&self) -> Result<FpRegisters> {
        let inner = getfpregs(self.pid).map_err(HarnessError::Ptrace)?;
        Ok(FpRegisters::new(inner))
    }

    pub fn set_fpregs(&self, regs: &FpRegisters) -> Result<()> {
        setfpregs(self.pid, regs.ptrace()).map_err(HarnessError::Ptrace)
    }

    pub fn get_pc(&self) -> Result<u64> {
        Ok(self.get_regs()?.ip())
    }

    pub fn set_pc(&self, pc: u64) -> Result<()> {
        let mut regs = self.get_regs()?;
        regs.set_ip(pc);
        self.set_regs(&regs)
    }

    pub fn cont(&self, sig: Option<Signal>) -> Result<()> {
        ptrace::cont(self.pid, sig).map_err(HarnessError::Ptrace)
    }

    pub fn singlestep(&self, sig: Option<Signal>) -> Result<()> {
        ptrace::step(self.pid, sig).map_err(HarnessError::Ptrace)
    }

    /// Blocks until the tracee's state changes. The Patcher's event loop
    /// (spec.md §4.4/§5) is the sole caller; everything else in the
    /// harness runs only while the tracee is stopped.
    pub fn wait(&self) -> Result<WaitStatus> {
        waitpid(self.pid, Some(WaitPidFlag::empty())).map_err(HarnessError::Ptrace)
    }

    pub fn read_mem(&mut self, addr: u64, len: usize) -> Result<Vec<u8>> {
        if len <= PROC_MEM_THRESHOLD {
            self.read_mem_peek(addr, len)
        } else {
            self.read_mem_procfs(addr, len)
        }
    }

    pub fn write_mem(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        if data.len() <= PROC_MEM_THRESHOLD {
            self.write_mem_poke(addr, data)
        } else {
            self.write_mem_procfs(addr, data)
        }
    }

    fn read_mem_procfs(&mut self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.mem.seek(SeekFrom::Start(addr)).map_err(HarnessError::Io)?;
        self.mem.read_exact(&mut buf).map_err(HarnessError::Io)?;
        Ok(buf)
    }

    fn write_mem_procfs(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.mem.seek(SeekFrom::Start(addr)).map_err(HarnessError::Io)?;
        self.mem.write_all(data).map_err(HarnessError::Io)?;
        Ok(())
    }

    fn read_mem_peek(&mut self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(len);
        let mut cur = addr;
        while buf.len() < len {
            let word = ptrace::read(self.pid, cur as ptrace::AddressType)
                .map_err(HarnessError::Ptrace)?;
            buf.extend_from_slice(&word.to_ne_bytes());
            cur += std::mem::size_of::<i64>() as u64;
        }
        buf.truncate(len);
        Ok(buf)
    }

    fn write_mem_poke(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        const WORD: usize = std::mem::size_of::<i64>();
        let mut offset = 0usize;
        while offset < data.len() {
            let word_addr = addr + offset as u64;
            let mut word_bytes = if data.len() - offset >= WORD {
                data[offset..offset + WORD].to_vec()
            } else {
                // Partial final word: preserve the trailing bytes already there.
                let mut existing = self.read_mem_peek(word_addr, WORD)?;
                existing[..data.len() - offset].copy_from_slice(&data[offset..]);
                existing
            };
            word_bytes.resize(WORD, 0);
            let mut arr = [0u8; WORD];
            arr.copy_from_slice(&word_bytes);
            let word = i64::from_ne_bytes(arr);
            unsafe {
                ptrace::write(
                    self.pid,
                    word_addr as ptrace::AddressType,
                    word as *mut std::ffi::c_void,
                )
                .map_err(HarnessError::Ptrace)?;
            }
            offset += WORD;
        }
        Ok(())
    }

    /// Executes a single syscall in the tracee by overwriting the bytes at
    /// its *current* PC with `syscall; int3`, loading the syscall ABI
    /// registers, resuming, and restoring everything on the resulting trap.
    /// This is how the Block Pool, Pointer Pool, and RSB get their backing
    /// `mmap`s before any code cache exists to host a syscall gadget.
    pub fn remote_syscall(&mut self, nr: i64, args: [u64; 6]) -> Result<i64> {
        let saved_regs = self.get_regs()?;
        let pc = saved_regs.ip();
        let saved_bytes = self.read_mem(pc, 3)?;

        self.write_mem(pc, &[0x0f, 0x05, 0xcc])?; // syscall; int3

        let mut call_regs = saved_regs;
        call_regs.set_ip(pc);
        call_regs.set_syscallno(nr);
        call_regs.ptrace_mut().rax = nr as u64;
        call_regs.ptrace_mut().rdi = args[0];
        call_regs.ptrace_mut().rsi = args[1];
        call_regs.ptrace_mut().rdx = args[2];
        call_regs.ptrace_mut().r10 = args[3];
        call_regs.ptrace_mut().r8 = args[4];
        call_regs.ptrace_mut().r9 = args[5];
        self.set_regs(&call_regs)?;

        self.cont(None)?;
        match self.wait()? {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
            other => panic!("remote syscall: unexpected wait status {:?}", other),
        }

        let result_regs = self.get_regs()?;
        let result = result_regs.syscall_result_signed();

        self.write_mem(pc, &saved_bytes)?;
        self.set_regs(&saved_regs)?;

        trace!("remote_syscall({}, {:?}) = {}", nr, args, result);
        Ok(result)
    }

    /// `mmap` a fresh anonymous region in the tracee, returning its base
    /// address. Used to back the Block Pool, Pointer Pool, RSB, and tmp
    /// scratch memory (spec.md §4, Patcher's private constants).
    pub fn remote_mmap(&mut self, len: usize, prot: i32) -> Result<u64> {
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        let result = self.remote_syscall(
            libc::SYS_mmap,
            [0, len as u64, prot as u64, flags as u64, u64::MAX, 0],
        )?;
        if result < 0 {
            return Err(HarnessError::PoolExhausted {
                pool: "remote_mmap",
                requested: len,
                remaining: 0,
            });
        }
        Ok(result as u64)
    }

    pub fn remote_mprotect(&mut self, addr: u64, len: usize, prot: i32) -> Result<()> {
        let result = self.remote_syscall(libc::SYS_mprotect, [addr, len as u64, prot as u64, 0, 0, 0])?;
        if result < 0 {
            return Err(HarnessError::Remote(format!(
                "mprotect({:#x}, {}, {}) = {}",
                addr, len, prot, result
            )));
        }
        Ok(())
    }

    /// Exposed for completeness with spec.md §1's assumed ptrace-wrapper
    /// surface ("fork-in-tracee"); the sequential single-tracee driver
    /// (spec.md §5) never calls it. Mirrors the unused
    /// `Patcher::ExecutionPolicy::PARALLEL` left as a `TODO` in the
    /// original implementation.
    pub fn remote_fork(&mut self) -> Result<pid_t> {
        let result = self.remote_syscall(libc::SYS_fork, [0, 0, 0, 0, 0, 0])?;
        Ok(result as pid_t)
    }

    pub fn mem_fd(&self) -> i32 {
        self.mem.as_raw_fd()
    }

    /// `si_addr` of the signal that last stopped the tracee — the faulting
    /// address for a `SIGSEGV`, used to classify a shared-page-fault
    /// sequence point (spec.md §3) against the Page Tracker.
    pub fn last_fault_addr(&self) -> Result<u64> {
        let siginfo = ptrace::getsiginfo(self.pid).map_err(HarnessError::Ptrace)?;
        Ok(unsafe { siginfo.si_addr() } as u64)
    }
}
