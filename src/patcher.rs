//! The Patcher (spec.md §4.4): the top-level translator event loop.
//! Owns the tracee, the Block Pool/Pointer Pool/RSB, the original-address
//! → Block map (Invariant B1: looked up, never recomputed), and every
//! breakpoint currently standing in for something unresolved — a lazy
//! link, an indirect-cache miss, or a sequence point. `run` is the only
//! place that ever calls `Tracee::cont`/`Tracee::wait`; everything else in
//! the crate executes synchronously in response to a trap this loop
//! dispatches.

use std::collections::{HashMap, HashSet};

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

use crate::block::Block;
use crate::config::Config;
use crate::error::{HarnessError, Result};
use crate::page_tracker::{PageTier, PageTracker, PAGE_SIZE};
use crate::pool::{BlockPool, PointerPool, Rsb};
use crate::sequence_point::{
    BranchObserver, CallObserver, Phase, SequencePointHandler, SequencePointKind,
    SequencePointSite,
};
use crate::terminator::Terminator;
use crate::tracee::Tracee;
use crate::transformer::Transformer;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum LinkWhich {
    Jump,
    Taken,
    NotTaken,
    Call,
}

enum StubKind {
    Link { block_orig: u64, which: LinkWhich },
    IndirectMiss { block_orig: u64 },
    RsbPush { block_orig: u64 },
    RsbPop { block_orig: u64 },
    SequencePoint(SequencePointSite),
}

pub struct Patcher {
    tracee: Tracee,
    block_pool: BlockPool,
    pointer_pool: PointerPool,
    rsb: Rsb,
    blocks: HashMap<u64, Block>,
    stubs: HashMap<u64, StubKind>,
    transformer: Box<dyn Transformer>,
    sp_handler: Box<dyn SequencePointHandler>,
    page_tracker: PageTracker,
    branch_observer: Box<dyn BranchObserver>,
    call_observer: Box<dyn CallObserver>,
    config: Config,
    /// Original addresses currently mid-translation, so an indirect or
    /// eagerly-predicted edge that loops back into a block still being
    /// built (spec.md §4.1 self/mutually-recursive blocks) falls back to a
    /// lazy link instead of recursing into `Block::create` forever.
    in_progress: HashSet<u64>,
    /// Tracee-resident accumulator the in-core Jcc checksum trampoline
    /// arithmetic writes into (spec.md §4.5).
    checksum_slot: u64,
}

/// How many `ReadWriteUnlocked` pages get promoted to write-protected
/// `ReadWriteLocked` per round (SPEC_FULL.md §D decisions / spec.md §4.2).
const PAGE_LOCK_BUDGET: usize = 16;

impl Patcher {
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        mut tracee: Tracee,
        transformer: Box<dyn Transformer>,
        sp_handler: Box<dyn SequencePointHandler>,
        mut branch_observer: Box<dyn BranchObserver>,
        call_observer: Box<dyn CallObserver>,
        config: Config,
    ) -> Result<Patcher> {
        let mut block_pool = BlockPool::new(&mut tracee)?;
        let mut pointer_pool = PointerPool::new(&mut tracee)?;
        let rsb = Rsb::new(&mut tracee, &mut pointer_pool)?;
        let checksum_slot = block_pool.alloc(8)?;
        tracee.write_mem(checksum_slot, &0u64.to_ne_bytes())?;
        branch_observer.set_incore_slot(checksum_slot);
        let mut page_tracker = PageTracker::new(PAGE_LOCK_BUDGET);
        let maps = crate::proc_maps::read_maps(tracee.pid()).map_err(HarnessError::Io)?;
        page_tracker.refresh(&maps);
        let mut patcher = Patcher {
            tracee,
            block_pool,
            pointer_pool,
            rsb,
            blocks: HashMap::new(),
            stubs: HashMap::new(),
            transformer,
            sp_handler,
            page_tracker,
            branch_observer,
            call_observer,
            config,
            in_progress: HashSet::new(),
            checksum_slot,
        };
        patcher.apply_page_protections()?;
        Ok(patcher)
    }

    /// Physically applies the Page Tracker's tiering via `mprotect`:
    /// `Shared` pages become `PROT_NONE` so any access is itself the
    /// shared-page-fault sequence point; `ReadWriteLocked` pages become
    /// read-only so a write traps. Call at every round boundary — the
    /// memcheck driver re-derives tiers each round (spec.md §5) and the
    /// protections must track that.
    pub fn apply_page_protections(&mut self) -> Result<()> {
        let targets: Vec<(u64, PageTier)> = self
            .page_tracker
            .pages()
            .map(|p| (p.base, p.tier))
            .collect();
        for (base, tier) in targets {
            let prot = match tier {
                PageTier::Shared => libc::PROT_NONE,
                PageTier::ReadWriteLocked => libc::PROT_READ,
                PageTier::ReadOnly | PageTier::ReadWriteUnlocked => continue,
            };
            self.tracee.remote_mprotect(base, PAGE_SIZE as usize, prot)?;
        }
        Ok(())
    }

    pub fn page_tracker_mut(&mut self) -> &mut PageTracker {
        &mut self.page_tracker
    }

    pub fn tracee(&self) -> &Tracee {
        &self.tracee
    }

    pub fn tracee_mut(&mut self) -> &mut Tracee {
        &mut self.tracee
    }

    /// Looks up the Block translating `orig_addr`, creating it on first
    /// reference (Invariant B1/B2: afterward, this is the only place that
    /// hands out its pool address).
    fn lookup_block(&mut self, orig_addr: u64) -> Result<u64> {
        if let Some(block) = self.blocks.get(&orig_addr) {
            return Ok(block.pool_addr);
        }
        self.in_progress.insert(orig_addr);
        let result = self.lookup_block_uncached(orig_addr);
        self.in_progress.remove(&orig_addr);
        result
    }

    fn lookup_block_uncached(&mut self, orig_addr: u64) -> Result<u64> {
        let (block, sites) = Block::create(
            &mut self.tracee,
            &mut self.block_pool,
            &mut self.pointer_pool,
            &self.rsb,
            orig_addr,
            self.transformer.as_ref(),
            &self.config,
            self.checksum_slot,
        )?;
        let pool_addr = block.pool_addr;
        let block = self.register_stubs(block, &sites)?;
        self.blocks.insert(orig_addr, block);
        Ok(pool_addr)
    }

    /// Registers every trap this block's terminator and sequence points
    /// still need, eagerly resolving a `DirectConditionalJump` side the
    /// translation-time prediction policy (spec.md §4.3,
    /// `crate::terminator::prediction`) marked predicted: that side never
    /// gets a lazy `Link` stub at all, matching the original implementation
    /// pre-resolving predicted edges at construction instead of waiting for
    /// the first hit. `in_progress` breaks the recursion a
    /// self/mutually-recursive predicted edge would otherwise cause by
    /// falling back to a lazy link for any target still mid-translation.
    fn register_stubs(&mut self, mut block: Block, sites: &[SequencePointSite]) -> Result<Block> {
        let orig = block.orig_addr;
        for site in sites {
            self.stubs
                .insert(site.bkpt_pool_addr, StubKind::SequencePoint(site.clone()));
        }
        match &mut block.terminator {
            Terminator::DirectJump { link } => {
                self.stubs.insert(
                    link.stub_addr,
                    StubKind::Link {
                        block_orig: orig,
                        which: LinkWhich::Jump,
                    },
                );
            }
            Terminator::DirectConditionalJump {
                taken,
                not_taken,
                predicted,
                ..
            } => {
                if predicted.taken && !self.in_progress.contains(&taken.orig_dst) {
                    let target_pool = self.lookup_block(taken.orig_dst)?;
                    taken.resolve(&mut self.tracee, target_pool)?;
                } else {
                    self.stubs.insert(
                        taken.stub_addr,
                        StubKind::Link {
                            block_orig: orig,
                            which: LinkWhich::Taken,
                        },
                    );
                }
                if predicted.not_taken && !self.in_progress.contains(&not_taken.orig_dst) {
                    let target_pool = self.lookup_block(not_taken.orig_dst)?;
                    not_taken.resolve(&mut self.tracee, target_pool)?;
                } else {
                    self.stubs.insert(
                        not_taken.stub_addr,
                        StubKind::Link {
                            block_orig: orig,
                            which: LinkWhich::NotTaken,
                        },
                    );
                }
            }
            Terminator::DirectCall {
                link,
                rsb_push_stub,
                ..
            } => {
                self.stubs.insert(
                    link.stub_addr,
                    StubKind::Link {
                        block_orig: orig,
                        which: LinkWhich::Call,
                    },
                );
                self.stubs
                    .insert(*rsb_push_stub, StubKind::RsbPush { block_orig: orig });
            }
            Terminator::IndirectCall { miss_bkpt, .. } | Terminator::IndirectJump { miss_bkpt, .. } => {
                self.stubs
                    .insert(*miss_bkpt, StubKind::IndirectMiss { block_orig: orig });
            }
            Terminator::Return { mispredict_bkpt, .. } => {
                self.stubs
                    .insert(*mispredict_bkpt, StubKind::RsbPop { block_orig: orig });
            }
        }
        Ok(block)
    }

    /// Runs the tracee to completion, translating and chaining blocks as
    /// control reaches new original addresses, dispatching every trap to
    /// the right stub handler. Returns the tracee's exit status.
    pub fn run(&mut self, entry: u64) -> Result<i32> {
        let pool_entry = self.lookup_block(entry)?;
        self.tracee.set_pc(pool_entry)?;
        self.tracee.cont(None)?;

        loop {
            match self.tracee.wait()? {
                WaitStatus::Exited(_, code) => return Ok(code),
                WaitStatus::Signaled(_, sig, _) => return Ok(128 + sig as i32),
                WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                    self.handle_trap()?;
                }
                WaitStatus::Stopped(_, Signal::SIGSEGV) => {
                    self.handle_segv()?;
                }
                WaitStatus::Stopped(_, other) => {
                    let pc = self.tracee.get_pc()?;
                    return Err(HarnessError::UnexpectedSignal {
                        signal: other as i32,
                        pc,
                    });
                }
                other => panic!("unexpected wait status: {:?}", other),
            }
        }
    }

    fn handle_trap(&mut self) -> Result<()> {
        let regs = self.tracee.get_regs()?;
        let trap_addr = regs.ip() - 1; // int3 reports pc just past the trapping byte
        let stub = match self.stubs.get(&trap_addr) {
            Some(_) => trap_addr,
            None => regs.ip(), // some stubs resume exactly at regs.ip(); see below
        };
        self.dispatch_stub(stub)
    }

    fn dispatch_stub(&mut self, stub_addr: u64) -> Result<()> {
        let kind = match self.stubs.remove(&stub_addr) {
            Some(k) => k,
            None => {
                return Err(HarnessError::UnexpectedSignal {
                    signal: libc::SIGTRAP,
                    pc: stub_addr,
                })
            }
        };
        match &kind {
            StubKind::SequencePoint(site) => {
                self.sp_handler.handle(&mut self.tracee, site)?;
                self.stubs.insert(stub_addr, kind);
                self.tracee.cont(None)?;
            }
            StubKind::Link { block_orig, which } => {
                let (target_orig, jcc_orig_addr) = {
                    let block = &self.blocks[block_orig];
                    match (&block.terminator, which) {
                        (Terminator::DirectJump { link }, LinkWhich::Jump) => (link.orig_dst, None),
                        (
                            Terminator::DirectConditionalJump {
                                taken, orig_addr, ..
                            },
                            LinkWhich::Taken,
                        ) => (taken.orig_dst, Some(*orig_addr)),
                        (
                            Terminator::DirectConditionalJump {
                                not_taken,
                                orig_addr,
                                ..
                            },
                            LinkWhich::NotTaken,
                        ) => (not_taken.orig_dst, Some(*orig_addr)),
                        (Terminator::DirectCall { link, .. }, LinkWhich::Call) => {
                            (link.orig_dst, None)
                        }
                        _ => unreachable!("stub registry matches terminator shape"),
                    }
                };
                if let Some(orig_addr) = jcc_orig_addr {
                    // Breakpoint-form half of the branch-checksum duplication
                    // (spec.md §3): resolving a Taken/NotTaken edge for the
                    // first time is itself the observation that the Jcc took
                    // that side, since the native Jcc/jmp pair only falls
                    // into whichever stub matches the real condition flags.
                    self.branch_observer
                        .observe(orig_addr, matches!(which, LinkWhich::Taken));
                }
                let target_pool = self.lookup_block(target_orig)?;
                let block = self.blocks.get_mut(block_orig).unwrap();
                let link = match (&mut block.terminator, which) {
                    (Terminator::DirectJump { link }, LinkWhich::Jump) => link,
                    (Terminator::DirectConditionalJump { taken, .. }, LinkWhich::Taken) => taken,
                    (Terminator::DirectConditionalJump { not_taken, .. }, LinkWhich::NotTaken) => {
                        not_taken
                    }
                    (Terminator::DirectCall { link, .. }, LinkWhich::Call) => link,
                    _ => unreachable!(),
                };
                link.resolve(&mut self.tracee, target_pool)?;
                let mut regs = self.tracee.get_regs()?;
                regs.set_ip(stub_addr);
                self.tracee.set_regs(&regs)?;
                self.tracee.cont(None)?;
            }
            StubKind::IndirectMiss { block_orig } => {
                // `crate::block` captures the would-be branch target into
                // r11 right before this trap (the real indirect
                // instruction is never executed, since it would jump
                // straight out of the code cache). Every hit that actually
                // matches one of the cache's slots runs the native
                // `cmp`/`je`/`jmp [rip+target]` chain with no trap at all
                // (`crate::terminator::emit_indirect_cache`); reaching this
                // trap means every slot missed, so the FIFO-next slot gets
                // retargeted at the live (target_orig, target_pool) pair.
                let regs = self.tracee.get_regs()?;
                let target_orig = regs.ptrace().r11;
                let is_call = matches!(
                    self.blocks[block_orig].terminator,
                    Terminator::IndirectCall { .. }
                );
                if is_call {
                    let orig_ret = self.blocks[block_orig].orig_end();
                    let pool_ret = self.lookup_block(orig_ret)?;
                    self.rsb.push(&mut self.tracee, orig_ret, pool_ret)?;
                    self.call_observer.on_call();
                }
                let target_pool = self.lookup_block(target_orig)?;

                let block = self.blocks.get_mut(block_orig).unwrap();
                let (key_addr, target_addr) = match &mut block.terminator {
                    Terminator::IndirectCall { cache, next, .. }
                    | Terminator::IndirectJump { cache, next, .. } => {
                        let slot = &cache[*next];
                        let addrs = (slot.key_addr, slot.target_addr);
                        *next = (*next + 1) % cache.len();
                        addrs
                    }
                    _ => unreachable!("stub registry matches terminator shape"),
                };
                self.tracee.write_mem(key_addr, &target_orig.to_ne_bytes())?;
                self.tracee.write_mem(target_addr, &target_pool.to_ne_bytes())?;

                let mut regs = self.tracee.get_regs()?;
                regs.set_ip(target_pool);
                self.tracee.set_regs(&regs)?;
                self.stubs.insert(stub_addr, kind);
                self.tracee.cont(None)?;
            }
            StubKind::RsbPush { block_orig } => {
                // The real return address was already pushed onto the
                // tracee's actual stack by the natively-executing
                // `movabs r11, orig_ret; push r11` pair just before this
                // trap (see `crate::terminator::emit_rsb_push_prologue`);
                // this hop only maintains the harness-side RSB prediction
                // table. The call-target jump lives one byte past this
                // trap (the Link stub patched in place of the second
                // reserved `int3`).
                let orig_ret = self.blocks[block_orig].orig_end();
                // Resolved (and translated, if necessary) right now rather
                // than lazily: the harness mediates every call/return here
                // (see DESIGN.md), so there is no benefit to deferring it
                // the way a fully inlined fast path would have to.
                let pool_ret = self.lookup_block(orig_ret)?;
                self.rsb.push(&mut self.tracee, orig_ret, pool_ret)?;
                self.call_observer.on_call();
                let mut regs = self.tracee.get_regs()?;
                regs.set_ip(stub_addr + 1);
                self.tracee.set_regs(&regs)?;
                self.stubs.insert(stub_addr, kind);
                self.tracee.cont(None)?;
            }
            StubKind::RsbPop { .. } => {
                // Reached only when `crate::terminator::emit_rsb_pop_stub`'s
                // native sequence found the RSB empty or its predicted
                // entry didn't match the live return address; either way
                // that native code already committed the top-of-stack
                // decrement itself (matching `Rsb::pop`'s unconditional
                // decrement), so this fallback must not pop again — it just
                // resolves the real address still sitting at [rsp].
                let regs = self.tracee.get_regs()?;
                let ret_bytes = self.tracee.read_mem(regs.sp(), 8)?;
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&ret_bytes);
                let live_ret = u64::from_ne_bytes(arr);

                self.call_observer.on_return();
                let target_pool = self.lookup_block(live_ret)?;
                let mut regs = self.tracee.get_regs()?;
                regs.set_sp(regs.sp() + 8);
                regs.set_ip(target_pool);
                self.tracee.set_regs(&regs)?;
                self.stubs.insert(stub_addr, kind);
                self.tracee.cont(None)?;
            }
        }
        Ok(())
    }

    /// SHARED-page faults (spec.md §3 "shared-page-fault" sequence
    /// point): any access to a `PROT_NONE`-trapped shared page is itself
    /// the sequence point. `crate::memcheck::Memcheck` resolves it by
    /// single-stepping the faulting instruction with the real protection
    /// temporarily restored; this loop just dispatches the page-fault
    /// address through the same handler sequence points use.
    fn handle_segv(&mut self) -> Result<()> {
        let regs = self.tracee.get_regs()?;
        let fault_addr = self.tracee.last_fault_addr()?;
        let base = fault_addr - fault_addr % PAGE_SIZE;
        if self.page_tracker.tier_of(base) != Some(PageTier::Shared) {
            return Err(HarnessError::UnexpectedSignal {
                signal: libc::SIGSEGV,
                pc: regs.ip(),
            });
        }

        let site = SequencePointSite {
            orig_addr: regs.ip(),
            bkpt_pool_addr: 0,
            kind: SequencePointKind::SharedPageFault,
            phase: Phase::Pre,
        };
        self.sp_handler.handle(&mut self.tracee, &site)?;

        self.tracee
            .remote_mprotect(base, PAGE_SIZE as usize, libc::PROT_READ | libc::PROT_WRITE)?;
        self.tracee.singlestep(None)?;
        match self.tracee.wait()? {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
            _ => {
                return Err(HarnessError::UnexpectedSignal {
                    signal: libc::SIGTRAP,
                    pc: fault_addr,
                })
            }
        }
        self.tracee
            .remote_mprotect(base, PAGE_SIZE as usize, libc::PROT_NONE)?;
        self.page_tracker.record_fault(base);

        let site_post = SequencePointSite {
            phase: Phase::Post,
            ..site
        };
        self.sp_handler.handle(&mut self.tracee, &site_post)?;

        self.tracee.cont(None)?;
        Ok(())
    }
}
