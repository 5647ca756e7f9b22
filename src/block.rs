//! Block discovery and translation (spec.md §4.1/§4.4).
//!
//! A Block covers one maximal straight-line run of original instructions:
//! decode forward from an original address until the first branch,
//! relocating each non-branch instruction into the Block Pool (bracketing
//! sequence points with `int3`s per `crate::transformer::Transformer`),
//! then handing the terminating branch to `crate::terminator::Terminator::create`.
//! Invariant B1 (spec.md §4.1): every Block's pool address is looked up
//! via the original-address map maintained by `crate::patcher::Patcher`,
//! never recomputed. Invariant B2: a Block, once created, never moves or
//! is rewritten except for its terminator's lazily-patched jump target.

use crate::config::Config;
use crate::error::Result;
use crate::instruction::{BranchKind, Instruction};
use crate::pool::{BlockPool, PointerPool, Rsb};
use crate::sequence_point::{Phase, SequencePointSite};
use crate::terminator::Terminator;
use crate::tracee::Tracee;
use crate::transformer::Transformer;

/// Instructions read and discarded past this point are almost certainly a
/// decoder desync (garbage bytes, or a branch classifier miss); treated as
/// a fatal translation error rather than looping forever.
const MAX_BLOCK_INSTRUCTIONS: usize = 4096;

pub struct Block {
    pub orig_addr: u64,
    pub orig_len: u64,
    pub pool_addr: u64,
    pub terminator: Terminator,
}

impl Block {
    pub fn orig_end(&self) -> u64 {
        self.orig_addr + self.orig_len
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create(
        tracee: &mut Tracee,
        block_pool: &mut BlockPool,
        pointer_pool: &mut PointerPool,
        rsb: &Rsb,
        orig_addr: u64,
        transformer: &dyn Transformer,
        config: &Config,
        checksum_slot: u64,
    ) -> Result<(Block, Vec<SequencePointSite>)> {
        let mut sites = Vec::new();
        let mut cursor = orig_addr;
        let mut pool_entry = None;
        let mut branch_inst = None;
        let mut last_mnemonic = None;

        for _ in 0..MAX_BLOCK_INSTRUCTIONS {
            let inst = fetch_instruction(tracee, cursor)?;
            let kind = transformer.classify(&inst);

            if let Some(kind) = kind {
                let bkpt_addr = emit_breakpoint(tracee, block_pool)?;
                if pool_entry.is_none() {
                    pool_entry = Some(bkpt_addr);
                }
                sites.push(SequencePointSite {
                    orig_addr: inst.pc(),
                    bkpt_pool_addr: bkpt_addr,
                    kind,
                    phase: Phase::Pre,
                });
            }

            if inst.branch_kind() != BranchKind::None {
                use crate::instruction::BranchKind;
                if matches!(
                    inst.branch_kind(),
                    BranchKind::IndirectJump | BranchKind::IndirectCall
                ) {
                    // The original instruction is never executed as a
                    // branch (it would jump straight out of the code
                    // cache): capture whatever it would have jumped to
                    // into r11 instead, so the trap this terminator falls
                    // into can read the real runtime target.
                    let capture_addr = emit_capture_to_r11(tracee, block_pool, &inst)?;
                    if pool_entry.is_none() {
                        pool_entry = Some(capture_addr);
                    }
                } else if pool_entry.is_none() {
                    pool_entry = Some(block_pool.alloc(0)?);
                }
                branch_inst = Some(inst);
                break;
            }

            let relocated = relocate_and_emit(tracee, block_pool, &inst)?;
            if pool_entry.is_none() {
                pool_entry = Some(relocated.pc());
            }
            last_mnemonic = Some(inst.mnemonic());

            if let Some(kind) = kind {
                let bkpt_addr = emit_breakpoint(tracee, block_pool)?;
                sites.push(SequencePointSite {
                    orig_addr: inst.pc(),
                    bkpt_pool_addr: bkpt_addr,
                    kind,
                    phase: Phase::Post,
                });
            }

            cursor = inst.after_pc();
        }

        let branch_inst = branch_inst.ok_or_else(|| crate::error::HarnessError::Decode {
            addr: orig_addr,
            bytes: Vec::new(),
        })?;

        let terminator = Terminator::create(
            tracee,
            block_pool,
            pointer_pool,
            rsb,
            &branch_inst,
            config,
            checksum_slot,
            last_mnemonic,
        )?;

        Ok((
            Block {
                orig_addr,
                orig_len: branch_inst.after_pc() - orig_addr,
                pool_addr: pool_entry.expect("at least the terminator was emitted"),
                terminator,
            },
            sites,
        ))
    }
}

fn fetch_instruction(tracee: &mut Tracee, pc: u64) -> Result<Instruction> {
    let bytes = tracee.read_mem(pc, crate::instruction::MAX_INST_LEN)?;
    Instruction::decode(pc, &bytes)
}

fn relocate_and_emit(
    tracee: &mut Tracee,
    block_pool: &mut BlockPool,
    inst: &Instruction,
) -> Result<Instruction> {
    let probe = inst.relocate(block_pool.base())?; // length probe; real addr assigned below
    let addr = block_pool.alloc(probe.len())?;
    let relocated = inst.relocate(addr)?;
    tracee.write_mem(addr, relocated.bytes())?;
    Ok(relocated)
}

fn emit_breakpoint(tracee: &mut Tracee, block_pool: &mut BlockPool) -> Result<u64> {
    let addr = block_pool.alloc(1)?;
    tracee.write_mem(addr, &[0xcc])?;
    Ok(addr)
}

/// Builds `mov r11, <op0 of inst>` targeting the same register or memory
/// operand an indirect jump/call would have branched through, so the
/// harness can read the live target out of `r11` at the trap that follows
/// instead of letting the branch actually execute.
fn emit_capture_to_r11(
    tracee: &mut Tracee,
    block_pool: &mut BlockPool,
    inst: &Instruction,
) -> Result<u64> {
    use iced_x86::{Code, Instruction as IcedInstruction, MemoryOperand, OpKind, Register};

    let iced_inst = inst.iced();
    let synthetic = match iced_inst.op0_kind() {
        OpKind::Register => {
            IcedInstruction::with2(Code::Mov_r64_rm64, Register::R11, iced_inst.op0_register())
                .expect("register-to-register mov always encodes")
        }
        OpKind::Memory => {
            let mem = MemoryOperand::new(
                iced_inst.memory_base(),
                iced_inst.memory_index(),
                iced_inst.memory_index_scale(),
                iced_inst.memory_displacement64() as i64,
                iced_inst.memory_displ_size(),
                false,
                iced_inst.segment_prefix(),
            );
            IcedInstruction::with2(Code::Mov_r64_rm64, Register::R11, mem)
                .expect("memory-operand mov always encodes")
        }
        other => panic!("unsupported indirect branch operand kind {:?}", other),
    };

    let probe_addr = block_pool.base();
    let mut encoder = iced_x86::Encoder::new(64);
    encoder
        .encode(&synthetic, probe_addr)
        .map_err(|_| crate::error::HarnessError::Relocate {
            addr: inst.pc(),
            new_addr: probe_addr,
        })?;
    let probe_len = encoder.take_buffer().len();

    let addr = block_pool.alloc(probe_len)?;
    let mut encoder = iced_x86::Encoder::new(64);
    encoder
        .encode(&synthetic, addr)
        .map_err(|_| crate::error::HarnessError::Relocate {
            addr: inst.pc(),
            new_addr: addr,
        })?;
    tracee.write_mem(addr, &encoder.take_buffer())?;
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orig_end_matches_branch_tail() {
        let block = Block {
            orig_addr: 0x1000,
            orig_len: 10,
            pool_addr: 0x2000,
            terminator: Terminator::test_stub(0x2000),
        };
        assert_eq!(block.orig_end(), 0x100a);
    }
}
