//! Sequence points (spec.md §3): the five points in a translated block's
//! body where the differential taint checker compares subround state —
//! syscalls, atomic (`lock`-prefixed) instructions, `rdtsc`/`rdtscp`, RTM
//! (`xbegin`/`xend`/`xabort`), and SHARED-page faults. Block discovery
//! (`crate::block`) brackets each with an `int3` the harness resolves the
//! first time it is actually hit; which `int3` fired tells the memcheck
//! driver which kind of point it's handling and which phase (entering or
//! leaving the instrumented instruction).

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SequencePointKind {
    Syscall,
    Lock,
    Rdtsc,
    Rtm,
    SharedPageFault,
    /// Not a full sequence point (SPEC_FULL.md §C.1 `StackTracker`): any
    /// instruction that decrements `rsp` outside of `push`/`call`. Hooked
    /// only at `Phase::Post` to fill the newly-exposed stack bytes with
    /// the current subround's pattern before they can be read.
    StackGrow,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Phase {
    Pre,
    Post,
}

/// Ties an in-block breakpoint back to the original instruction it
/// brackets. Produced by `crate::block::Block::create`, consumed by
/// `crate::patcher::Patcher` to dispatch into the memcheck driver.
#[derive(Clone, Debug)]
pub struct SequencePointSite {
    pub orig_addr: u64,
    pub bkpt_pool_addr: u64,
    pub kind: SequencePointKind,
    pub phase: Phase,
}

/// Implemented by `crate::memcheck::Memcheck`; `crate::patcher::Patcher`
/// calls into this on every sequence-point breakpoint hit rather than
/// knowing anything about taint checking itself.
pub trait SequencePointHandler {
    fn handle(
        &mut self,
        tracee: &mut crate::tracee::Tracee,
        site: &SequencePointSite,
    ) -> crate::error::Result<()>;
}

/// Does nothing. Pairs with `crate::transformer::IdentityTransformer` for
/// the pure-JIT-overhead baseline (spec.md §8).
pub struct NoopSequencePointHandler;

impl SequencePointHandler for NoopSequencePointHandler {
    fn handle(
        &mut self,
        _tracee: &mut crate::tracee::Tracee,
        _site: &SequencePointSite,
    ) -> crate::error::Result<()> {
        Ok(())
    }
}

/// Called by `crate::patcher::Patcher` the first time a non-predicted
/// conditional jump's taken or not-taken edge resolves — the
/// breakpoint-form half of spec.md's branch-checksum duplication (§3).
/// `set_incore_slot` wires up the other, independent half: the tracee
/// address `crate::terminator::emit_native_jcc` accumulates into directly,
/// which `crate::memcheck::checksum::Checksum::set_incore` reads back each
/// sequence point.
pub trait BranchObserver {
    fn observe(&mut self, orig_branch_addr: u64, taken: bool);

    fn set_incore_slot(&mut self, addr: u64) {
        let _ = addr;
    }
}

pub struct NoopBranchObserver;

impl BranchObserver for NoopBranchObserver {
    fn observe(&mut self, _orig_branch_addr: u64, _taken: bool) {}
}

/// Called by `crate::patcher::Patcher` at every RSB push/pop dispatch
/// (SPEC_FULL.md §C.1 `CallTracker`) — bookkeeping only; the pushed
/// return address itself is a compile-time constant baked into native
/// code by `crate::terminator::emit_rsb_push_prologue`; it needs no
/// fill-pattern seeding of its own, but call depth still feeds the `-p`
/// profiling counters.
pub trait CallObserver {
    fn on_call(&mut self);
    fn on_return(&mut self);
}

pub struct NoopCallObserver;

impl CallObserver for NoopCallObserver {
    fn on_call(&mut self) {}
    fn on_return(&mut self) {}
}
