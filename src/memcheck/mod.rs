//! The differential taint checker (spec.md §4.5): the round/subround state
//! machine that drives everything else in this crate. A round is the
//! interval between two sequence points; each round is replayed
//! `SUBROUNDS` times from the same starting state, each subround filling
//! newly-exposed stack memory with a different pattern
//! ([`FILL_PATTERNS`]). Divergence between subrounds' post-states, masked
//! by what has ever diverged before, is an uninitialized-memory read
//! (Testable Property P2); divergence between subrounds' branch-decision
//! checksums is the same finding observed a different way (Property P3).
//!
//! `Memcheck` itself holds all the round state; since
//! `crate::patcher::Patcher` wants a `SequencePointHandler`, a
//! `BranchObserver`, and a `CallObserver` as three separately-typed trait
//! objects, [`Memcheck::into_handles`] wraps one shared `Rc<RefCell<_>>` in
//! three thin delegates rather than splitting the state three ways.

mod call_tracker;
mod checksum;
mod stack_tracker;

use std::cell::RefCell;
use std::rc::Rc;

use crate::config::{Config, SUBROUNDS};
use crate::error::{HarnessError, Result};
use crate::page_tracker::{PageTracker, PAGE_SIZE};
use crate::registers::{FpRegisters, Registers};
use crate::sequence_point::{
    BranchObserver, CallObserver, Phase, SequencePointHandler, SequencePointKind,
    SequencePointSite,
};
use crate::snapshot::Snapshot;
use crate::state::State;
use crate::tracee::Tracee;

pub use call_tracker::CallTracker;
pub use checksum::Checksum;
pub use stack_tracker::StackTracker;

/// Fill byte used for each subround's replay (spec.md §9: "N >= 2" fill
/// patterns). Sized off `SUBROUNDS` so raising that constant needs a
/// matching entry here.
pub const FILL_PATTERNS: [u8; SUBROUNDS] = [0x00, 0xFF];

/// Same budget `crate::patcher::Patcher` applies via `mprotect`; kept here
/// too since `Memcheck` tiers pages independently for its own snapshotting
/// (see the module-level note on why it doesn't share the Patcher's
/// tracker instance).
const PAGE_LOCK_BUDGET: usize = 16;

/// Bytes below `sp` treated as live scratch space (the x86-64 System V red
/// zone) that Open Question D.2 (SPEC_FULL.md §D) says to taint
/// unconditionally on the very first round.
const SHADOW_STACK_SCRATCH: u64 = 128;

pub struct Memcheck {
    config: Config,
    page_tracker: PageTracker,
    stack_tracker: StackTracker,
    call_tracker: CallTracker,
    /// Cumulative OR of every round's divergence so far — taint never
    /// un-marks a byte once a round has shown it can vary (Invariant S1).
    taint: State,
    pre_state: Option<State>,
    post_states: Vec<Option<State>>,
    checksums: Vec<Checksum>,
    live_checksum: Checksum,
    subround: usize,
    first_round: bool,
    /// Pre-syscall registers captured when the last subround's Pre hook
    /// ran, so the matching Post hook can hand `crate::syscall_checker`
    /// the original arguments without re-deriving them.
    last_syscall_regs: Option<Registers>,
    /// Tracee address of the in-core Jcc checksum accumulator
    /// (spec.md §4.5), set once by `crate::patcher::Patcher::open` via
    /// `BranchObserver::set_incore_slot`. `None` until then (and in tests
    /// that never wire a live tracee up at all).
    incore_slot: Option<u64>,
}

impl Memcheck {
    pub fn new(config: Config, pid: libc::pid_t) -> Result<Memcheck> {
        let maps = crate::proc_maps::read_maps(pid).map_err(HarnessError::Io)?;
        let mut page_tracker = PageTracker::new(PAGE_LOCK_BUDGET);
        page_tracker.refresh(&maps);
        Ok(Memcheck {
            config,
            page_tracker,
            stack_tracker: StackTracker::new(),
            call_tracker: CallTracker::new(),
            taint: State::new(Registers::zeroed(), FpRegisters::zeroed(), Snapshot::new()),
            pre_state: None,
            post_states: vec![None; SUBROUNDS],
            checksums: vec![Checksum::new(); SUBROUNDS],
            live_checksum: Checksum::new(),
            subround: 0,
            first_round: true,
            last_syscall_regs: None,
            incore_slot: None,
        })
    }

    pub fn call_depth(&self) -> u64 {
        self.call_tracker.depth()
    }

    pub fn taint_mask(&self) -> &State {
        &self.taint
    }

    /// Splits one `Memcheck` into the three trait objects
    /// `crate::patcher::Patcher::open` wants, all backed by the same
    /// shared state.
    pub fn into_handles(
        self,
    ) -> (
        Box<dyn SequencePointHandler>,
        Box<dyn BranchObserver>,
        Box<dyn CallObserver>,
    ) {
        let shared = Rc::new(RefCell::new(self));
        (
            Box::new(SequencePointHandle(shared.clone())),
            Box::new(BranchObserverHandle(shared.clone())),
            Box::new(CallObserverHandle(shared)),
        )
    }

    fn handle(&mut self, tracee: &mut Tracee, site: &SequencePointSite) -> Result<()> {
        match site.phase {
            Phase::Pre => self.handle_pre(tracee, site),
            Phase::Post => self.handle_post(tracee, site),
        }
    }

    fn handle_pre(&mut self, tracee: &mut Tracee, site: &SequencePointSite) -> Result<()> {
        if self.pre_state.is_none() {
            self.begin_round(tracee)?;
        }

        let post = self.snapshot_state(tracee)?;
        if site.kind == SequencePointKind::Syscall {
            self.last_syscall_regs = Some(post.gp_regs);
        }
        self.post_states[self.subround] = Some(post);
        if let Some(addr) = self.incore_slot {
            let value = read_u64(tracee, addr)?;
            self.live_checksum.set_incore(value);
            write_u64(tracee, addr, 0)?;
        }
        self.checksums[self.subround] = std::mem::replace(&mut self.live_checksum, Checksum::new());

        if self.subround + 1 < SUBROUNDS {
            self.subround += 1;
            self.restore_pre_state(tracee)?;
            let sp = self.pre_state.as_ref().expect("set by begin_round").gp_regs.sp();
            self.stack_tracker.reset(sp);
            return Ok(());
        }

        self.finalize_round(tracee, site)
    }

    fn handle_post(&mut self, tracee: &mut Tracee, site: &SequencePointSite) -> Result<()> {
        match site.kind {
            SequencePointKind::Syscall => {
                if let Some(regs_pre) = self.last_syscall_regs.take() {
                    let result = tracee.get_regs()?.syscall_result_signed();
                    crate::syscall_checker::apply_post(&regs_pre, result, &mut self.taint.snapshot)?;
                }
            }
            SequencePointKind::StackGrow => {
                let sp = tracee.get_regs()?.sp();
                let pattern = FILL_PATTERNS[self.subround];
                self.stack_tracker.on_grow(tracee, sp, pattern)?;
            }
            SequencePointKind::Lock | SequencePointKind::Rdtsc | SequencePointKind::Rtm
            | SequencePointKind::SharedPageFault => {}
        }
        // The real instruction has now executed; its outcome is the
        // natural starting point for the next round.
        self.begin_round(tracee)
    }

    fn begin_round(&mut self, tracee: &mut Tracee) -> Result<()> {
        let maps = crate::proc_maps::read_maps(tracee.pid()).map_err(HarnessError::Io)?;
        self.page_tracker.refresh(&maps);

        let state = self.snapshot_state(tracee)?;
        self.stack_tracker.reset(state.gp_regs.sp());
        if self.first_round || self.config.taint_shadow_stack {
            self.taint_region_above_sp(state.gp_regs.sp());
            self.first_round = false;
        }

        self.pre_state = Some(state);
        self.post_states = vec![None; SUBROUNDS];
        self.checksums = vec![Checksum::new(); SUBROUNDS];
        self.live_checksum = Checksum::new();
        self.subround = 0;
        if let Some(addr) = self.incore_slot {
            // Whatever ran between the previous round's `finalize_round`
            // and here (the single real instruction at the sequence
            // point) must not leak its native checksum contribution into
            // this round's first subround.
            write_u64(tracee, addr, 0)?;
        }
        Ok(())
    }

    fn finalize_round(&mut self, tracee: &mut Tracee, site: &SequencePointSite) -> Result<()> {
        for i in 1..SUBROUNDS {
            if self.config.jcc_checksum_bkpt || self.config.jcc_checksum_incore {
                self.checksums[0].agrees_with(&self.checksums[i])?;
            }
        }

        let base = self.post_states[0].clone().expect("subround 0 always runs");
        let mut round_taint = base.clone();
        round_taint.zero();
        for i in 1..SUBROUNDS {
            let mut diff = base.clone();
            diff.xor_assign(self.post_states[i].as_ref().expect("every subround runs"));
            round_taint.or_assign(&diff);
        }
        self.taint.gp_regs.or_assign(&round_taint.gp_regs);
        self.taint.fp_regs.or_assign(&round_taint.fp_regs);
        self.merge_taint_snapshot(&round_taint.snapshot);

        if site.kind == SequencePointKind::Syscall {
            let regs = self.last_syscall_regs.clone().unwrap_or_else(|| base.gp_regs);
            crate::syscall_checker::check_pre(tracee, &regs, &self.taint.snapshot)?;
        }
        Ok(())
    }

    fn snapshot_state(&mut self, tracee: &mut Tracee) -> Result<State> {
        let gp_regs = tracee.get_regs()?;
        let fp_regs = tracee.get_fpregs()?;
        let targets: Vec<u64> = self
            .page_tracker
            .pages()
            .filter(|p| PageTracker::needs_snapshot(p.tier))
            .map(|p| p.base)
            .collect();
        let mut snapshot = Snapshot::new();
        for base in targets {
            let bytes = tracee.read_mem(base, PAGE_SIZE as usize)?;
            snapshot.insert_page(base, bytes);
        }
        Ok(State::new(gp_regs, fp_regs, snapshot))
    }

    /// Restores the round's starting state for the next subround's replay.
    /// When `change_pre_state` is set (spec.md §4.5), bytes the cumulative
    /// taint mask has already implicated get overwritten with the next
    /// subround's fill pattern instead of their captured pre-state value —
    /// otherwise a byte found tainted in an earlier round would silently
    /// stop diverging once every subround started restoring it to the same
    /// snapshot value.
    fn restore_pre_state(&mut self, tracee: &mut Tracee) -> Result<()> {
        let mut pre = self.pre_state.clone().expect("begin_round always runs first");
        if self.config.change_pre_state {
            self.apply_taint_pattern(&mut pre, FILL_PATTERNS[self.subround]);
        }
        tracee.set_regs(&pre.gp_regs)?;
        tracee.set_fpregs(&pre.fp_regs)?;
        for (&base, bytes) in pre.snapshot.pages() {
            tracee.write_mem(base, bytes)?;
        }
        Ok(())
    }

    fn apply_taint_pattern(&self, state: &mut State, pattern: u8) {
        let pages: Vec<(u64, Vec<u8>)> = self
            .taint
            .snapshot
            .pages()
            .map(|(&b, v)| (b, v.clone()))
            .collect();
        for (base, mask) in pages {
            if let Some(page) = state.snapshot.page(base) {
                let mut updated = page.to_vec();
                for (b, &m) in updated.iter_mut().zip(mask.iter()) {
                    if m != 0 {
                        *b = pattern;
                    }
                }
                state.snapshot.insert_page(base, updated);
            }
        }
    }

    fn merge_taint_snapshot(&mut self, addition: &Snapshot) {
        let pages: Vec<(u64, Vec<u8>)> = addition.pages().map(|(&b, v)| (b, v.clone())).collect();
        for (base, bytes) in pages {
            let merged = match self.taint.snapshot.page(base) {
                Some(existing) => existing
                    .iter()
                    .zip(bytes.iter())
                    .map(|(&a, &b)| a | b)
                    .collect(),
                None => bytes,
            };
            self.taint.snapshot.insert_page(base, merged);
        }
    }

    fn taint_region_above_sp(&mut self, sp: u64) {
        let begin = sp.saturating_sub(SHADOW_STACK_SCRATCH);
        let mut cur = begin;
        while cur < sp {
            let base = cur - cur % PAGE_SIZE;
            let mut page = self
                .taint
                .snapshot
                .page(base)
                .map(|p| p.to_vec())
                .unwrap_or_else(|| vec![0u8; PAGE_SIZE as usize]);
            let start = (cur.max(base) - base) as usize;
            let stop = (sp.min(base + PAGE_SIZE) - base) as usize;
            for b in &mut page[start..stop] {
                *b = 0xff;
            }
            self.taint.snapshot.insert_page(base, page);
            cur = base + PAGE_SIZE;
        }
    }
}

struct SequencePointHandle(Rc<RefCell<Memcheck>>);

impl SequencePointHandler for SequencePointHandle {
    fn handle(&mut self, tracee: &mut Tracee, site: &SequencePointSite) -> Result<()> {
        self.0.borrow_mut().handle(tracee, site)
    }
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

struct BranchObserverHandle(Rc<RefCell<Memcheck>>);

impl BranchObserver for BranchObserverHandle {
    fn observe(&mut self, orig_branch_addr: u64, taken: bool) {
        self.0
            .borrow_mut()
            .live_checksum
            .observe(orig_branch_addr, taken);
    }

    fn set_incore_slot(&mut self, addr: u64) {
        self.0.borrow_mut().incore_slot = Some(addr);
    }
}

struct CallObserverHandle(Rc<RefCell<Memcheck>>);

impl CallObserver for CallObserverHandle {
    fn on_call(&mut self) {
        self.0.borrow_mut().call_tracker.on_call();
    }

    fn on_return(&mut self) {
        self.0.borrow_mut().call_tracker.on_return();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_patterns_sized_to_subrounds() {
        assert_eq!(FILL_PATTERNS.len(), SUBROUNDS);
        assert_ne!(FILL_PATTERNS[0], FILL_PATTERNS[1]);
    }

    #[test]
    fn taint_region_above_sp_marks_red_zone() {
        let mut mc = Memcheck {
            config: Config::default(),
            page_tracker: PageTracker::new(PAGE_LOCK_BUDGET),
            stack_tracker: StackTracker::new(),
            call_tracker: CallTracker::new(),
            taint: State::new(Registers::zeroed(), FpRegisters::zeroed(), Snapshot::new()),
            pre_state: None,
            post_states: vec![None; SUBROUNDS],
            checksums: vec![Checksum::new(); SUBROUNDS],
            live_checksum: Checksum::new(),
            subround: 0,
            first_round: true,
            last_syscall_regs: None,
            incore_slot: None,
        };
        let sp = 0x7fff_ffff_e000u64;
        mc.taint_region_above_sp(sp);
        let base = sp - sp % PAGE_SIZE;
        let page = mc.taint.snapshot.page(base).unwrap();
        let off = (sp - 8 - base) as usize;
        assert_eq!(page[off], 0xff);
    }
}
