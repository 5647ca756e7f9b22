//! Syscall Checker (spec.md §4.6): validates, at the pre-syscall sequence
//! point, that every buffer a syscall is about to read is fully
//! initialized per the live taint mask, and at the post-syscall point
//! clears taint on every buffer the syscall just wrote (the kernel fully
//! determines those bytes now, regardless of what was there before).
//! Grounded on `original_source/src/bak/syscall-check.hh`'s two-pass
//! pre/post structure.

use crate::error::{HarnessError, Result};
use crate::registers::Registers;
use crate::snapshot::Snapshot;
use crate::syscall_table::{classify, ArgKind};
use crate::tracee::Tracee;

/// Runs before the syscall actually executes: every `Read`/`String`
/// argument must be untainted in `taint_mask`, or this is a genuine
/// uninitialized-memory-read finding (spec.md Testable Property P2).
pub fn check_pre(
    tracee: &mut Tracee,
    regs: &Registers,
    taint_mask: &Snapshot,
) -> Result<()> {
    let nr = regs.syscallno();
    let args = regs.syscall_args();
    let spec = match classify(nr) {
        Some(spec) => spec,
        None => return Ok(()),
    };

    for arg in &spec {
        let (addr, len) = match arg.kind {
            ArgKind::Read => (args[0], resolve_len(&args, arg)),
            ArgKind::String => (args[0], None),
            _ => continue,
        };
        if addr == 0 {
            continue;
        }
        let len = match len {
            Some(len) => len,
            None => string_len(tracee, addr)?,
        };
        if len == 0 {
            continue;
        }
        if region_tainted(taint_mask, addr, len) {
            return Err(HarnessError::TaintViolation {
                detail: format!(
                    "syscall {} reads {} uninitialized bytes at {:#x}",
                    nr, len, addr
                ),
            });
        }
    }
    Ok(())
}

/// Runs after the syscall returns: clears taint on every `Write`
/// argument's destination, since the kernel just fully determined those
/// bytes.
pub fn apply_post(
    regs_pre: &Registers,
    result: i64,
    taint_mask: &mut Snapshot,
) -> Result<()> {
    let nr = regs_pre.syscallno();
    let args = regs_pre.syscall_args();
    let spec = match classify(nr) {
        Some(spec) => spec,
        None => return Ok(()),
    };

    for arg in &spec {
        let write = match arg.kind {
            ArgKind::Write => true,
            ArgKind::Struct { write: true } => true,
            _ => false,
        };
        if !write {
            continue;
        }
        let addr = args[0];
        if addr == 0 {
            continue;
        }
        let len = resolve_len(&args, arg).unwrap_or_else(|| result.max(0) as u64);
        untaint_region(taint_mask, addr, len);
    }
    Ok(())
}

fn resolve_len(args: &[u64; 6], arg: &crate::syscall_table::ArgSpec) -> Option<u64> {
    arg.len_arg.map(|i| args[i])
}

fn string_len(tracee: &mut Tracee, addr: u64) -> Result<u64> {
    const CHUNK: usize = 256;
    let mut offset = 0u64;
    loop {
        let bytes = tracee.read_mem(addr + offset, CHUNK)?;
        if let Some(pos) = memchr::memchr(0, &bytes) {
            return Ok(offset + pos as u64 + 1);
        }
        offset += CHUNK as u64;
        if offset > 1 << 20 {
            return Err(HarnessError::TaintViolation {
                detail: format!("string argument at {:#x} has no NUL within 1MiB", addr),
            });
        }
    }
}

fn region_tainted(taint_mask: &Snapshot, addr: u64, len: u64) -> bool {
    use crate::page_tracker::PAGE_SIZE;
    let mut cur = addr;
    let end = addr + len;
    while cur < end {
        let base = cur - cur % PAGE_SIZE;
        if let Some(page) = taint_mask.page(base) {
            let start = (cur - base) as usize;
            let stop = ((end.min(base + PAGE_SIZE)) - base) as usize;
            if page[start..stop].iter().any(|&b| b != 0) {
                return true;
            }
        }
        cur = base + PAGE_SIZE;
    }
    false
}

fn untaint_region(taint_mask: &mut Snapshot, addr: u64, len: u64) {
    use crate::page_tracker::PAGE_SIZE;
    let mut cur = addr;
    let end = addr + len;
    while cur < end {
        let base = cur - cur % PAGE_SIZE;
        if taint_mask.page(base).is_none() {
            taint_mask.insert_page(base, vec![0u8; PAGE_SIZE as usize]);
        }
        cur = base + PAGE_SIZE;
    }
    // Re-borrow mutably page by page now every touched page exists.
    let mut cur = addr;
    while cur < end {
        let base = cur - cur % PAGE_SIZE;
        let start = (cur - base) as usize;
        let stop = ((end.min(base + PAGE_SIZE)) - base) as usize;
        if let Some(page) = taint_mask.page(base) {
            let mut updated = page.to_vec();
            for b in &mut updated[start..stop] {
                *b = 0;
            }
            taint_mask.insert_page(base, updated);
        }
        cur = base + PAGE_SIZE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_tracker::PAGE_SIZE;

    #[test]
    fn region_tainted_detects_set_bit() {
        let mut mask = Snapshot::new();
        let mut page = vec![0u8; PAGE_SIZE as usize];
        page[10] = 0xff;
        mask.insert_page(0x1000, page);
        assert!(region_tainted(&mask, 0x1000 + 5, 10));
        assert!(!region_tainted(&mask, 0x1000 + 20, 10));
    }

    #[test]
    fn untaint_region_clears_bytes() {
        let mut mask = Snapshot::new();
        let mut page = vec![0xffu8; PAGE_SIZE as usize];
        mask.insert_page(0x1000, page.clone());
        untaint_region(&mut mask, 0x1000 + 5, 10);
        page = mask.page(0x1000).unwrap().to_vec();
        assert!(page[5..15].iter().all(|&b| b == 0));
        assert!(page[0..5].iter().all(|&b| b == 0xff));
    }
}
