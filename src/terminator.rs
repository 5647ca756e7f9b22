//! Terminators (spec.md §4.3): the translated replacement for each branch
//! instruction that ends a Block. Every terminator starts life pointing
//! at an unresolved-link breakpoint; the first time control reaches it,
//! `crate::patcher::Patcher` resolves (translating the target Block if
//! necessary) and patches the stub in place with a direct `jmp`/`call` to
//! the target's pool address, so every subsequent hit runs natively with
//! no trap. This lazy-linking is the same "chain blocks together as they
//! are discovered" idea spec.md describes for direct jumps, specialised
//! per terminator kind below. Conditional jumps additionally get a
//! translation-time prediction (`prediction`) that can skip the lazy stub
//! on one or both sides entirely, and an N-way inline cache (spec.md §4.3
//! "Indirect jump") stands in for the lazy stub on indirect branches.

pub mod prediction;

use iced_x86::{Code, Encoder, Instruction as IcedInstruction, Register};

use crate::checksum_mix::branch_mix;
use crate::config::Config;
use crate::error::{HarnessError, Result};
use crate::instruction::Instruction;
use crate::pool::{BlockPool, PointerPool, Rsb, RSB_DEPTH};
use crate::tracee::Tracee;

/// A single unresolved or resolved outgoing edge: the pool address of the
/// stub that currently either traps (`int3`, unresolved) or jumps
/// straight to a target Block's pool address (resolved).
#[derive(Clone, Debug)]
pub struct Link {
    pub orig_dst: u64,
    pub stub_addr: u64,
    resolved: bool,
}

impl Link {
    fn new(stub_addr: u64, orig_dst: u64) -> Link {
        Link {
            orig_dst,
            stub_addr,
            resolved: false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    /// Overwrites the stub with a direct jump to `target_pool_addr`. Used
    /// for every "direct" edge: direct jump, taken/not-taken sides of a
    /// Jcc, and the call-target side of a direct call.
    pub fn resolve(&mut self, tracee: &mut Tracee, target_pool_addr: u64) -> Result<()> {
        let jmp = IcedInstruction::with_branch(Code::Jmp_rel32_64, target_pool_addr).expect("valid branch instruction");
        let mut encoder = Encoder::new(64);
        encoder
            .encode(&jmp, self.stub_addr)
            .map_err(|_| HarnessError::Relocate {
                addr: self.orig_dst,
                new_addr: target_pool_addr,
            })?;
        tracee.write_mem(self.stub_addr, &encoder.take_buffer())?;
        self.resolved = true;
        Ok(())
    }
}

/// One N-way slot of an indirect jump's inline cache (spec.md §4.3
/// "Indirect jump"): two tracee-resident 8-byte cells co-located with the
/// cache's own generated code in the Block Pool, so the native `cmp`/`jmp`
/// sequence can reach them with a plain RIP-relative operand regardless of
/// where the Pointer Pool's separate mapping happens to sit. `key_addr`
/// holds the original branch target last recorded in this slot; a miss
/// writes the live target there and the newly-translated pool address into
/// `target_addr`. Evicted FIFO (`Terminator::IndirectCall`/`IndirectJump`'s
/// `next` cursor) when full.
#[derive(Clone, Debug)]
pub struct IndirectCacheSlot {
    pub key_addr: u64,
    pub target_addr: u64,
}

#[derive(Clone, Debug)]
pub enum Terminator {
    DirectJump {
        link: Link,
    },
    DirectConditionalJump {
        taken: Link,
        not_taken: Link,
        /// Decided once, at translation time, by `prediction::predict`
        /// (spec.md §4.3, `--prediction-mode`). A side with `predicted ==
        /// true` is resolved straight to a direct jump below instead of
        /// ever registering a lazy `Link` stub.
        predicted: prediction::Prediction,
        /// Pool address of the natively-executing `Jcc`/`jmp` pair that
        /// actually decides the branch (the real condition flags drive
        /// this, not harness mediation): taken falls into `taken.stub_addr`,
        /// not-taken falls into `not_taken.stub_addr`, each independently
        /// lazily linked the same way a direct jump is (unless predicted).
        native_addr: u64,
        /// Original address of the `Jcc`, for `crate::sequence_point::BranchObserver`.
        orig_addr: u64,
    },
    DirectCall {
        link: Link,
        /// Start of the natively-executing `movabs r11, orig_ret; push r11`
        /// pair — the real return address the original `call` would have
        /// pushed, baked in as an immediate since `orig_ret` is a compile-time
        /// constant (the original post-call address). This is what makes
        /// `Terminator::Return`'s `[rsp]` read meaningful downstream.
        entry_addr: u64,
        /// Trap right after the push, where the harness records
        /// `(orig_ret, pool_ret)` into the RSB before falling through into
        /// `link`'s stub (at `rsb_push_stub + 1`).
        rsb_push_stub: u64,
    },
    IndirectCall {
        cache: Vec<IndirectCacheSlot>,
        /// Start of the native `cmp`/`je` chain (what the relocated block
        /// body falls through into).
        entry_addr: u64,
        /// `int3` right after the last `je`: every cache miss traps here.
        miss_bkpt: u64,
        /// FIFO eviction cursor into `cache`.
        next: usize,
    },
    IndirectJump {
        cache: Vec<IndirectCacheSlot>,
        entry_addr: u64,
        miss_bkpt: u64,
        next: usize,
    },
    Return {
        /// Start of the native pop/compare/jump sequence (spec.md §4.3
        /// "Return"): on a matching, non-empty RSB entry this jumps
        /// straight to the predicted pool address without ever trapping.
        rsb_pop_stub: u64,
        /// Harness-mediated fallback for an empty RSB or a mismatched
        /// entry; the real return address is read off `[rsp]` there.
        mispredict_bkpt: u64,
    },
}

impl Terminator {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        tracee: &mut Tracee,
        block_pool: &mut BlockPool,
        _pointer_pool: &mut PointerPool,
        rsb: &Rsb,
        branch: &Instruction,
        config: &Config,
        checksum_slot: u64,
        last_mnemonic: Option<iced_x86::Mnemonic>,
    ) -> Result<Terminator> {
        use crate::instruction::BranchKind::*;
        match branch.branch_kind() {
            DirectJump => {
                let dst = branch.branch_dst().expect("direct jump has a destination");
                let stub_addr = emit_unresolved_stub(tracee, block_pool)?;
                Ok(Terminator::DirectJump {
                    link: Link::new(stub_addr, dst),
                })
            }
            DirectConditionalJump => {
                let dst = branch.branch_dst().expect("direct jcc has a destination");
                let fallthrough = branch.after_pc();
                let cc = branch.iced().condition_code();
                let dir = prediction::Direction::of(dst, fallthrough);
                let predicted = prediction::predict(config.prediction_mode, cc, dir, last_mnemonic);

                let (native_addr, taken_stub, not_taken_stub) = emit_native_jcc(
                    tracee,
                    block_pool,
                    branch,
                    checksum_slot,
                    !predicted.taken,
                    !predicted.not_taken,
                )?;
                Ok(Terminator::DirectConditionalJump {
                    taken: Link::new(taken_stub, dst),
                    not_taken: Link::new(not_taken_stub, fallthrough),
                    predicted,
                    native_addr,
                    orig_addr: branch.pc(),
                })
            }
            DirectCall => {
                let dst = branch.branch_dst().expect("direct call has a destination");
                let orig_ret = branch.after_pc();
                let (entry_addr, rsb_push_stub) =
                    emit_rsb_push_prologue(tracee, block_pool, orig_ret)?;
                let stub_addr = rsb_push_stub + 1; // past the trailing int3
                let _ = rsb;
                Ok(Terminator::DirectCall {
                    link: Link::new(stub_addr, dst),
                    entry_addr,
                    rsb_push_stub,
                })
            }
            IndirectCall => {
                let (cache, entry_addr, miss_bkpt) =
                    emit_indirect_cache(tracee, block_pool, config.indirect_cache_len)?;
                Ok(Terminator::IndirectCall {
                    cache,
                    entry_addr,
                    miss_bkpt,
                    next: 0,
                })
            }
            IndirectJump => {
                let (cache, entry_addr, miss_bkpt) =
                    emit_indirect_cache(tracee, block_pool, config.indirect_cache_len)?;
                Ok(Terminator::IndirectJump {
                    cache,
                    entry_addr,
                    miss_bkpt,
                    next: 0,
                })
            }
            Return => {
                let (rsb_pop_stub, mispredict_bkpt) = emit_rsb_pop_stub(tracee, block_pool, rsb)?;
                Ok(Terminator::Return {
                    rsb_pop_stub,
                    mispredict_bkpt,
                })
            }
            None => unreachable!("Block::create only hands branches to Terminator::create"),
        }
    }

    /// Entry address the relocated block body falls through into.
    pub fn entry_addr(&self) -> u64 {
        match self {
            Terminator::DirectJump { link } => link.stub_addr,
            Terminator::DirectConditionalJump { native_addr, .. } => *native_addr,
            Terminator::DirectCall { entry_addr, .. } => *entry_addr,
            Terminator::IndirectCall { entry_addr, .. } => *entry_addr,
            Terminator::IndirectJump { entry_addr, .. } => *entry_addr,
            Terminator::Return { rsb_pop_stub, .. } => *rsb_pop_stub,
        }
    }

    #[cfg(test)]
    pub fn test_stub(addr: u64) -> Terminator {
        Terminator::DirectJump {
            link: Link::new(addr, addr),
        }
    }
}

fn mem_base(base: Register) -> iced_x86::MemoryOperand {
    iced_x86::MemoryOperand::new(base, Register::None, 1, 0, 0, false, Register::None)
}

/// A `[rip+disp32]` operand resolving to the absolute address `addr`,
/// regardless of where the referencing instruction itself ends up —
/// matches how `crate::block::emit_capture_to_r11` treats an existing
/// RIP-relative operand's `memory_displacement64()`.
fn mem_rip(addr: u64) -> iced_x86::MemoryOperand {
    iced_x86::MemoryOperand::new(Register::RIP, Register::None, 1, addr as i64, 4, false, Register::None)
}

/// Maps a decoded condition code to its rel32 (long-form, 64-bit mode)
/// `Jcc` opcode, regardless of whether the original instruction used the
/// short (rel8) encoding — the relocated copy always needs the long form
/// since the stub it targets can be arbitrarily far away in the Block Pool.
fn jcc_rel32_64(cc: iced_x86::ConditionCode) -> Code {
    use iced_x86::ConditionCode::*;
    match cc {
        o => Code::Jo_rel32_64,
        no => Code::Jno_rel32_64,
        b => Code::Jb_rel32_64,
        ae => Code::Jae_rel32_64,
        e => Code::Je_rel32_64,
        ne => Code::Jne_rel32_64,
        be => Code::Jbe_rel32_64,
        a => Code::Ja_rel32_64,
        s => Code::Js_rel32_64,
        ns => Code::Jns_rel32_64,
        p => Code::Jp_rel32_64,
        np => Code::Jnp_rel32_64,
        l => Code::Jl_rel32_64,
        ge => Code::Jge_rel32_64,
        le => Code::Jle_rel32_64,
        g => Code::Jg_rel32_64,
    }
}

/// Emits a natively-executing `Jcc rel32` followed immediately by `jmp
/// rel32` (spec.md §4.1 relocation case (a): the original `Jcc` is
/// promoted to its long form, re-targeted at a stub address instead of its
/// original destination). Between the decision and each side's stub sits
/// that side's independent in-core checksum update (spec.md §4.5): `rol
/// qword [checksum_slot], 5` / `movabs r11, mix` / `xor qword
/// [checksum_slot], r11`, the exact formula `crate::checksum_mix::fold`
/// implements host-side. A side already eagerly predicted (its `update_*`
/// flag false) skips the update entirely, since an eagerly-resolved edge
/// never reaches the breakpoint-form observer either — both checksum forms
/// stay defined over exactly the same set of dynamic edges. Returns
/// `(native_addr, taken_stub_addr, not_taken_stub_addr)`.
fn emit_native_jcc(
    tracee: &mut Tracee,
    block_pool: &mut BlockPool,
    branch: &Instruction,
    checksum_slot: u64,
    update_taken: bool,
    update_not_taken: bool,
) -> Result<(u64, u64, u64)> {
    let long_form_code = jcc_rel32_64(branch.iced().condition_code());
    let probe_addr = block_pool.base();

    let jcc_len = encode_len(&IcedInstruction::with_branch(long_form_code, probe_addr).expect("valid branch instruction"), probe_addr, branch.pc())?;
    let jmp_len = encode_len(&IcedInstruction::with_branch(Code::Jmp_rel32_64, probe_addr).expect("valid branch instruction"), probe_addr, branch.pc())?;
    let update_len = checksum_update_len(probe_addr)?;

    let native_addr = block_pool.alloc(0)?; // peek
    let jmp_addr = native_addr + jcc_len as u64;
    let taken_update_addr = jmp_addr + jmp_len as u64;
    let taken_stub_addr = taken_update_addr + if update_taken { update_len as u64 } else { 0 };
    let not_taken_update_addr = taken_stub_addr + 1;
    let not_taken_stub_addr = not_taken_update_addr + if update_not_taken { update_len as u64 } else { 0 };
    let total_len = (not_taken_stub_addr + 1 - native_addr) as usize;

    let reserved = block_pool.alloc(total_len)?;
    debug_assert_eq!(reserved, native_addr);

    let jcc = IcedInstruction::with_branch(long_form_code, taken_update_addr).expect("valid branch instruction");
    let jcc_bytes = encode_at(&jcc, native_addr, branch.pc())?;
    tracee.write_mem(native_addr, &jcc_bytes)?;

    let jmp = IcedInstruction::with_branch(Code::Jmp_rel32_64, not_taken_update_addr).expect("valid branch instruction");
    let jmp_bytes = encode_at(&jmp, jmp_addr, branch.pc())?;
    tracee.write_mem(jmp_addr, &jmp_bytes)?;

    if update_taken {
        emit_checksum_update(tracee, taken_update_addr, checksum_slot, branch_mix(branch.pc(), true))?;
    }
    tracee.write_mem(taken_stub_addr, &[0xcc])?;

    if update_not_taken {
        emit_checksum_update(tracee, not_taken_update_addr, checksum_slot, branch_mix(branch.pc(), false))?;
    }
    tracee.write_mem(not_taken_stub_addr, &[0xcc])?;

    Ok((native_addr, taken_stub_addr, not_taken_stub_addr))
}

fn checksum_update_instructions(checksum_slot: u64, mix: u64) -> [IcedInstruction; 3] {
    let rol = IcedInstruction::with2(Code::Rol_rm64_imm8, mem_rip(checksum_slot), 5u32)
        .expect("rol qword [rip+disp32], imm8 always encodes");
    let movabs = IcedInstruction::with2(Code::Mov_r64_imm64, Register::R11, mix)
        .expect("movabs r11, imm64 always encodes");
    let xor = IcedInstruction::with2(Code::Xor_rm64_r64, mem_rip(checksum_slot), Register::R11)
        .expect("xor qword [rip+disp32], r11 always encodes");
    [rol, movabs, xor]
}

fn checksum_update_len(probe_addr: u64) -> Result<usize> {
    let insts = checksum_update_instructions(probe_addr, 0);
    let mut total = 0;
    for inst in &insts {
        total += encode_len(inst, probe_addr, probe_addr)?;
    }
    Ok(total)
}

fn emit_checksum_update(tracee: &mut Tracee, at: u64, checksum_slot: u64, mix: u64) -> Result<()> {
    let insts = checksum_update_instructions(checksum_slot, mix);
    let mut cursor = at;
    for inst in &insts {
        let bytes = encode_at(inst, cursor, cursor)?;
        tracee.write_mem(cursor, &bytes)?;
        cursor += bytes.len() as u64;
    }
    Ok(())
}

fn encode_len(inst: &IcedInstruction, at: u64, orig_addr: u64) -> Result<usize> {
    Ok(encode_at(inst, at, orig_addr)?.len())
}

fn encode_at(inst: &IcedInstruction, at: u64, orig_addr: u64) -> Result<Vec<u8>> {
    let mut encoder = Encoder::new(64);
    encoder
        .encode(inst, at)
        .map_err(|_| HarnessError::Relocate {
            addr: orig_addr,
            new_addr: at,
        })?;
    Ok(encoder.take_buffer())
}

/// Reserves one `int3` at the current Block Pool cursor: the "not yet
/// resolved" state every `Link` and cache-miss trap starts in.
fn emit_unresolved_stub(tracee: &mut Tracee, block_pool: &mut BlockPool) -> Result<u64> {
    let addr = block_pool.alloc(1)?;
    tracee.write_mem(addr, &[0xcc])?;
    Ok(addr)
}

/// Emits `movabs r11, orig_ret; push r11` — the real return address the
/// original `call` would have pushed, baked in as an immediate since
/// `orig_ret` (the original post-call address) is known at translation
/// time — immediately followed by two `int3`s: the first is where the
/// harness records `(orig_ret, pool_ret)` into the RSB (spec.md §4.3's
/// "pushes (orig_ra, new_ra) onto the RSB"); the second is the call
/// target's own unresolved `Link` stub, patched to a direct jump the same
/// way every other edge is. Returns `(entry_addr, rsb_push_trap_addr)`.
fn emit_rsb_push_prologue(
    tracee: &mut Tracee,
    block_pool: &mut BlockPool,
    orig_ret: u64,
) -> Result<(u64, u64)> {
    let movabs = IcedInstruction::with2(Code::Mov_r64_imm64, Register::R11, orig_ret)
        .expect("movabs r11, imm64 always encodes");
    let push = IcedInstruction::with1(Code::Push_r64, Register::R11)
        .expect("push r11 always encodes");

    let probe_addr = block_pool.base();
    let movabs_len = encode_len(&movabs, probe_addr, orig_ret)?;
    let push_len = encode_len(&push, probe_addr, orig_ret)?;

    let entry_addr = block_pool.alloc(0)?; // peek; reserved in one shot below
    let movabs_bytes = encode_at(&movabs, entry_addr, orig_ret)?;
    let push_bytes = encode_at(&push, entry_addr + movabs_len as u64, orig_ret)?;
    block_pool.alloc(movabs_bytes.len() + push_bytes.len())?;
    tracee.write_mem(entry_addr, &movabs_bytes)?;
    tracee.write_mem(entry_addr + movabs_bytes.len() as u64, &push_bytes)?;

    let trap_addr = entry_addr + movabs_len as u64 + push_len as u64;
    let reserved = block_pool.alloc(2)?;
    debug_assert_eq!(reserved, trap_addr);
    tracee.write_mem(trap_addr, &[0xcc, 0xcc])?; // [0]=RsbPush trap, [1]=call-target Link stub

    Ok((entry_addr, trap_addr))
}

/// Emits the N-way indirect-branch inline cache (spec.md §4.3 "Indirect
/// jump"): `ways` back-to-back `cmp [rip+key_i], r11` / `je hit_i` checks
/// (r11 already holds the live branch target, captured by
/// `crate::block::emit_capture_to_r11` just before this code runs), an
/// `int3` miss trap, then `ways` `jmp [rip+target_i]` hit blocks. A hit
/// jumps straight to the cached pool address with no trap at all; a miss
/// falls into the harness, which records the live target into the next
/// slot (FIFO) and retargets there. Returns `(slots, entry_addr,
/// miss_bkpt)`.
fn emit_indirect_cache(
    tracee: &mut Tracee,
    block_pool: &mut BlockPool,
    ways: usize,
) -> Result<(Vec<IndirectCacheSlot>, u64, u64)> {
    let mut slots = Vec::with_capacity(ways);
    for _ in 0..ways {
        let key_addr = block_pool.alloc(8)?;
        tracee.write_mem(key_addr, &0u64.to_ne_bytes())?;
        let target_addr = block_pool.alloc(8)?;
        tracee.write_mem(target_addr, &0u64.to_ne_bytes())?;
        slots.push(IndirectCacheSlot { key_addr, target_addr });
    }

    let probe_addr = block_pool.base();
    let cmp_probe = IcedInstruction::with2(Code::Cmp_rm64_r64, mem_rip(probe_addr), Register::R11)
        .expect("cmp [rip+disp32], r11 always encodes");
    let cmp_len = encode_len(&cmp_probe, probe_addr, probe_addr)?;
    let je_probe = IcedInstruction::with_branch(Code::Je_rel32_64, probe_addr).expect("valid branch instruction");
    let je_len = encode_len(&je_probe, probe_addr, probe_addr)?;
    let jmp_probe = IcedInstruction::with1(Code::Jmp_rm64, mem_rip(probe_addr))
        .expect("jmp [rip+disp32] always encodes");
    let jmp_len = encode_len(&jmp_probe, probe_addr, probe_addr)?;

    let per_way_check_len = (cmp_len + je_len) as u64;
    let entry_addr = block_pool.alloc(0)?; // peek
    let miss_bkpt = entry_addr + per_way_check_len * ways as u64;
    let hit_bases: Vec<u64> = (0..ways)
        .map(|i| miss_bkpt + 1 + jmp_len as u64 * i as u64)
        .collect();

    let total_len = (per_way_check_len * ways as u64 + 1 + jmp_len as u64 * ways as u64) as usize;
    let reserved = block_pool.alloc(total_len)?;
    debug_assert_eq!(reserved, entry_addr);

    let mut cursor = entry_addr;
    for (i, slot) in slots.iter().enumerate() {
        let cmp = IcedInstruction::with2(Code::Cmp_rm64_r64, mem_rip(slot.key_addr), Register::R11)
            .expect("cmp [rip+disp32], r11 always encodes");
        let cmp_bytes = encode_at(&cmp, cursor, cursor)?;
        tracee.write_mem(cursor, &cmp_bytes)?;
        cursor += cmp_bytes.len() as u64;

        let je = IcedInstruction::with_branch(Code::Je_rel32_64, hit_bases[i]).expect("valid branch instruction");
        let je_bytes = encode_at(&je, cursor, cursor)?;
        tracee.write_mem(cursor, &je_bytes)?;
        cursor += je_bytes.len() as u64;
    }
    debug_assert_eq!(cursor, miss_bkpt);
    tracee.write_mem(miss_bkpt, &[0xcc])?;
    cursor += 1;

    for (i, slot) in slots.iter().enumerate() {
        debug_assert_eq!(cursor, hit_bases[i]);
        let jmp = IcedInstruction::with1(Code::Jmp_rm64, mem_rip(slot.target_addr))
            .expect("jmp [rip+disp32] always encodes");
        let jmp_bytes = encode_at(&jmp, cursor, cursor)?;
        tracee.write_mem(cursor, &jmp_bytes)?;
        cursor += jmp_bytes.len() as u64;
    }

    Ok((slots, entry_addr, miss_bkpt))
}

/// Emits the native RSB pop/compare/jump sequence (spec.md §4.3 "Return",
/// §5 "RSB pushes and pops are performed by tracee-side code"): read the
/// top-of-stack index, decrement and commit it (matching
/// `crate::pool::Rsb::pop`'s unconditional decrement), fetch the predicted
/// original and pool addresses at that index, and compare the predicted
/// original return against the live one still sitting on the real stack.
/// On a match, pop it for real and jump straight to the predicted pool
/// address — no trap. On an empty RSB or a mismatch, fall through to
/// `mispredict_bkpt` with the stack untouched beyond the already-committed
/// index, where the harness reads the real `[rsp]` and resolves normally.
///
/// Uses `r10` in addition to the usual `r11` scratch register: SysV has no
/// blanket guarantee that either survives a `ret`, but this codebase
/// already leans on `r11` being dead at every call/indirect-branch
/// boundary (`crate::block::emit_capture_to_r11`,
/// `emit_rsb_push_prologue`); extending the same assumption to `r10`
/// specifically for a return is no riskier, and a second register is the
/// only way to hold both the computed slot index and a base pointer at
/// once. Returns `(entry_addr, mispredict_bkpt)`.
fn emit_rsb_pop_stub(tracee: &mut Tracee, block_pool: &mut BlockPool, rsb: &Rsb) -> Result<(u64, u64)> {
    let mask = (RSB_DEPTH - 1) as u32;
    let mem_r11 = mem_base(Register::R11);
    let mem_r10 = mem_base(Register::R10);
    let mem_rsp = mem_base(Register::RSP);

    let load_top = IcedInstruction::with2(Code::Mov_r64_imm64, Register::R11, rsb.top_addr())
        .expect("movabs r11, imm64 always encodes");
    let deref_top = IcedInstruction::with2(Code::Mov_r64_rm64, Register::R11, mem_r11)
        .expect("mov r11, [r11] always encodes");
    let test_top = IcedInstruction::with2(Code::Test_rm64_r64, Register::R11, Register::R11)
        .expect("test r11, r11 always encodes");
    let dec_top = IcedInstruction::with1(Code::Dec_rm64, Register::R11).expect("dec r11 always encodes");
    let reload_top_addr = IcedInstruction::with2(Code::Mov_r64_imm64, Register::R10, rsb.top_addr())
        .expect("movabs r10, imm64 always encodes");
    let commit_top = IcedInstruction::with2(Code::Mov_rm64_r64, mem_r10.clone(), Register::R11)
        .expect("mov [r10], r11 always encodes");
    let mask_idx =
        IcedInstruction::with2(Code::And_rm64_imm8, Register::R11, mask).expect("and r11, imm8 always encodes");
    let scale_idx =
        IcedInstruction::with2(Code::Shl_rm64_imm8, Register::R11, 3u32).expect("shl r11, imm8 always encodes");
    let load_orig_base = IcedInstruction::with2(Code::Mov_r64_imm64, Register::R10, rsb.orig_base())
        .expect("movabs r10, imm64 always encodes");
    let add_idx_orig =
        IcedInstruction::with2(Code::Add_r64_rm64, Register::R10, Register::R11).expect("add r10, r11 always encodes");
    let deref_orig = IcedInstruction::with2(Code::Mov_r64_rm64, Register::R10, mem_r10.clone())
        .expect("mov r10, [r10] always encodes");
    let cmp_ret = IcedInstruction::with2(Code::Cmp_r64_rm64, Register::R10, mem_rsp)
        .expect("cmp r10, [rsp] always encodes");
    let load_pool_base = IcedInstruction::with2(Code::Mov_r64_imm64, Register::R10, rsb.pool_base())
        .expect("movabs r10, imm64 always encodes");
    let add_idx_pool =
        IcedInstruction::with2(Code::Add_r64_rm64, Register::R10, Register::R11).expect("add r10, r11 always encodes");
    let deref_pool = IcedInstruction::with2(Code::Mov_r64_rm64, Register::R10, mem_r10)
        .expect("mov r10, [r10] always encodes");
    let pop_ret =
        IcedInstruction::with2(Code::Add_rm64_imm8, Register::RSP, 8u32).expect("add rsp, imm8 always encodes");
    let jmp_target = IcedInstruction::with1(Code::Jmp_rm64, Register::R10).expect("jmp r10 always encodes");

    let probe_addr = block_pool.base();
    let fixed = [
        &load_top,
        &deref_top,
        &test_top,
        &dec_top,
        &reload_top_addr,
        &commit_top,
        &mask_idx,
        &scale_idx,
        &load_orig_base,
        &add_idx_orig,
        &deref_orig,
        &cmp_ret,
        &load_pool_base,
        &add_idx_pool,
        &deref_pool,
        &pop_ret,
        &jmp_target,
    ];
    let mut fixed_lens = Vec::with_capacity(fixed.len());
    for inst in &fixed {
        fixed_lens.push(encode_len(inst, probe_addr, probe_addr)?);
    }

    // The two forward branches (empty RSB / mismatched entry) both target
    // the harness-mediated fallback right after this sequence; their
    // length doesn't depend on the real target (always the rel32 long
    // form), so probe with a placeholder first.
    let jz_len = encode_len(&IcedInstruction::with_branch(Code::Je_rel32_64, probe_addr).expect("valid branch instruction"), probe_addr, probe_addr)?;
    let jne_len = encode_len(&IcedInstruction::with_branch(Code::Jne_rel32_64, probe_addr).expect("valid branch instruction"), probe_addr, probe_addr)?;

    let entry_addr = block_pool.alloc(0)?; // peek
    let mut cursor = entry_addr;
    cursor += fixed_lens[0] as u64; // load_top
    cursor += fixed_lens[1] as u64; // deref_top
    cursor += fixed_lens[2] as u64; // test_top
    let jz_addr = cursor;
    cursor += jz_len as u64;
    cursor += fixed_lens[3] as u64; // dec_top
    cursor += fixed_lens[4] as u64; // reload_top_addr
    cursor += fixed_lens[5] as u64; // commit_top
    cursor += fixed_lens[6] as u64; // mask_idx
    cursor += fixed_lens[7] as u64; // scale_idx
    cursor += fixed_lens[8] as u64; // load_orig_base
    cursor += fixed_lens[9] as u64; // add_idx_orig
    cursor += fixed_lens[10] as u64; // deref_orig
    cursor += fixed_lens[11] as u64; // cmp_ret
    let jne_addr = cursor;
    cursor += jne_len as u64;
    cursor += fixed_lens[12] as u64; // load_pool_base
    cursor += fixed_lens[13] as u64; // add_idx_pool
    cursor += fixed_lens[14] as u64; // deref_pool
    cursor += fixed_lens[15] as u64; // pop_ret
    cursor += fixed_lens[16] as u64; // jmp_target
    let mispredict_bkpt = cursor;

    let total_len = (mispredict_bkpt + 1 - entry_addr) as usize;
    let reserved = block_pool.alloc(total_len)?;
    debug_assert_eq!(reserved, entry_addr);

    let jz = IcedInstruction::with_branch(Code::Je_rel32_64, mispredict_bkpt).expect("valid branch instruction");
    let jne = IcedInstruction::with_branch(Code::Jne_rel32_64, mispredict_bkpt).expect("valid branch instruction");

    let mut at = entry_addr;
    macro_rules! emit {
        ($inst:expr) => {{
            let bytes = encode_at(&$inst, at, at)?;
            tracee.write_mem(at, &bytes)?;
            at += bytes.len() as u64;
        }};
    }
    emit!(load_top);
    emit!(deref_top);
    emit!(test_top);
    debug_assert_eq!(at, jz_addr);
    emit!(jz);
    emit!(dec_top);
    emit!(reload_top_addr);
    emit!(commit_top);
    emit!(mask_idx);
    emit!(scale_idx);
    emit!(load_orig_base);
    emit!(add_idx_orig);
    emit!(deref_orig);
    emit!(cmp_ret);
    debug_assert_eq!(at, jne_addr);
    emit!(jne);
    emit!(load_pool_base);
    emit!(add_idx_pool);
    emit!(deref_pool);
    emit!(pop_ret);
    emit!(jmp_target);
    debug_assert_eq!(at, mispredict_bkpt);
    tracee.write_mem(mispredict_bkpt, &[0xcc])?;

    Ok((entry_addr, mispredict_bkpt))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_starts_unresolved() {
        let link = Link::new(0x3000, 0x1000);
        assert!(!link.is_resolved());
        assert_eq!(link.orig_dst, 0x1000);
    }

    #[test]
    fn indirect_cache_slots_are_addressable_and_distinct() {
        let slots = vec![
            IndirectCacheSlot { key_addr: 0x1000, target_addr: 0x1008 },
            IndirectCacheSlot { key_addr: 0x1010, target_addr: 0x1018 },
        ];
        assert_eq!(slots.len(), 2);
        assert_ne!(slots[0].key_addr, slots[1].key_addr);
        assert_ne!(slots[0].key_addr, slots[0].target_addr);
    }
}
