//! Tracee-resident memory regions the translator needs before, during, and
//! independently of any code cache: the Block Pool (bump-allocated
//! executable arena holding translated blocks, terminator stubs, and —
//! since both need a plain RIP-relative operand to reach them from code
//! already living here — indirect-jump inline-cache slots and the in-core
//! Jcc checksum accumulator), the Pointer Pool (fixed-size 8-byte slots,
//! not executable, backing the Return-Stack Buffer), and the
//! Return-Stack Buffer itself (paired original/pool address arrays,
//! spec.md §4.3 "Return").
//!
//! All three are `mmap`ed inside the tracee via [`crate::tracee::Tracee::remote_mmap`]
//! the same way the original harness bootstraps scratch memory before a
//! single byte of translated code exists to host a syscall gadget.

use crate::error::{HarnessError, Result};
use crate::tracee::Tracee;

/// Default size of the Block Pool's backing mapping. Generous relative to
/// any test fixture; real targets can grow this via `Config` in a later
/// revision if it turns out to matter in practice.
pub const BLOCK_POOL_SIZE: usize = 16 * 1024 * 1024;

pub const POINTER_POOL_SLOTS: usize = 4096;
const POINTER_SLOT_SIZE: u64 = 8;

/// Depth of the Return-Stack Buffer. Matches typical hardware RSB depth;
/// deeper call chains fall back to the Return terminator's mispredict path
/// (spec.md §4.3) rather than growing this unboundedly.
pub const RSB_DEPTH: usize = 32;

/// Bump-allocated executable arena for translated blocks and terminator
/// stubs. Never reclaims — blocks live for the process's whole translated
/// lifetime (spec.md Invariant B2: once created, a Block's pool address is
/// stable).
pub struct BlockPool {
    base: u64,
    size: usize,
    cursor: usize,
}

impl BlockPool {
    pub fn new(tracee: &mut Tracee) -> Result<BlockPool> {
        let prot = libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC;
        let base = tracee.remote_mmap(BLOCK_POOL_SIZE, prot)?;
        Ok(BlockPool {
            base,
            size: BLOCK_POOL_SIZE,
            cursor: 0,
        })
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn remaining(&self) -> usize {
        self.size - self.cursor
    }

    /// Reserves `len` bytes, returning their pool address. Callers
    /// (`Block::create`, the terminator constructors) write the actual
    /// machine code via `Tracee::write_mem` after reserving.
    pub fn alloc(&mut self, len: usize) -> Result<u64> {
        if len > self.remaining() {
            return Err(HarnessError::PoolExhausted {
                pool: "block",
                requested: len,
                remaining: self.remaining(),
            });
        }
        let addr = self.base + self.cursor as u64;
        self.cursor += len;
        Ok(addr)
    }
}

/// Fixed-size array of 8-byte pointer slots, read/write but not
/// executable. Backs the Return-Stack Buffer below.
pub struct PointerPool {
    base: u64,
    cursor: usize,
}

impl PointerPool {
    pub fn new(tracee: &mut Tracee) -> Result<PointerPool> {
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let base = tracee.remote_mmap(POINTER_POOL_SLOTS * POINTER_SLOT_SIZE as usize, prot)?;
        Ok(PointerPool { base, cursor: 0 })
    }

    pub fn alloc_slot(&mut self) -> Result<u64> {
        if self.cursor >= POINTER_POOL_SLOTS {
            return Err(HarnessError::PoolExhausted {
                pool: "pointer",
                requested: 1,
                remaining: 0,
            });
        }
        let addr = self.base + (self.cursor as u64) * POINTER_SLOT_SIZE;
        self.cursor += 1;
        Ok(addr)
    }

    /// Reserves `n` contiguous slots, e.g. for an indirect jump's N-way
    /// cache (orig-address/pool-address pairs interleaved).
    pub fn alloc_slots(&mut self, n: usize) -> Result<u64> {
        if self.cursor + n > POINTER_POOL_SLOTS {
            return Err(HarnessError::PoolExhausted {
                pool: "pointer",
                requested: n,
                remaining: POINTER_POOL_SLOTS - self.cursor,
            });
        }
        let addr = self.base + (self.cursor as u64) * POINTER_SLOT_SIZE;
        self.cursor += n;
        Ok(addr)
    }
}

/// Paired original/pool-address arrays predicting translated return
/// targets, plus a top-of-stack index cell, all tracee-resident so the
/// Call/Return terminators' inline machine code can manipulate them
/// without trapping back into the harness on the fast path. The harness
/// side only ever writes here (`push`, on a call); every read —
/// top-of-stack, the predicted entry, the eviction — happens in the
/// Return terminator's own native pop/compare/jump sequence (spec.md
/// §4.3), never in Rust.
pub struct Rsb {
    orig_base: u64,
    pool_base: u64,
    top_addr: u64,
}

impl Rsb {
    pub fn new(tracee: &mut Tracee, pointer_pool: &mut PointerPool) -> Result<Rsb> {
        let orig_base = pointer_pool.alloc_slots(RSB_DEPTH)?;
        let pool_base = pointer_pool.alloc_slots(RSB_DEPTH)?;
        let top_addr = pointer_pool.alloc_slot()?;
        tracee.write_mem(top_addr, &0u64.to_ne_bytes())?;
        Ok(Rsb {
            orig_base,
            pool_base,
            top_addr,
        })
    }

    pub fn orig_base(&self) -> u64 {
        self.orig_base
    }

    pub fn pool_base(&self) -> u64 {
        self.pool_base
    }

    pub fn top_addr(&self) -> u64 {
        self.top_addr
    }

    pub fn slot_addr(base: u64, index: usize) -> u64 {
        base + (index % RSB_DEPTH) as u64 * POINTER_SLOT_SIZE
    }

    fn read_u64(tracee: &mut Tracee, addr: u64) -> Result<u64> {
        let bytes = tracee.read_mem(addr, 8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(&bytes);
        Ok(u64::from_ne_bytes(arr))
    }

    fn write_u64(tracee: &mut Tracee, addr: u64, value: u64) -> Result<()> {
        tracee.write_mem(addr, &value.to_ne_bytes())
    }

    fn top(&self, tracee: &mut Tracee) -> Result<usize> {
        Ok(Self::read_u64(tracee, self.top_addr)? as usize)
    }

    /// Harness-side counterpart of `crate::terminator`'s native RSB push
    /// prologue: records the prediction the pop stub's native code will
    /// later check against the live return address.
    pub fn push(&self, tracee: &mut Tracee, orig_ret: u64, pool_ret: u64) -> Result<()> {
        let top = self.top(tracee)?;
        Self::write_u64(tracee, Self::slot_addr(self.orig_base, top), orig_ret)?;
        Self::write_u64(tracee, Self::slot_addr(self.pool_base, top), pool_ret)?;
        Self::write_u64(tracee, self.top_addr, (top + 1) as u64)
    }
}
