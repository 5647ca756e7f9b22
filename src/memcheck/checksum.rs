//! Branch-decision checksums (spec.md §3/§4.5): every conditional jump
//! resolved during a subround's replay is folded into two independently
//! computed accumulators — an ordered breakpoint-form log, built host-side
//! from `BranchObserver::observe`, and a scalar in-core form, accumulated by
//! `crate::terminator::emit_native_jcc`'s natively-executing `rol`/`xor`
//! trampoline arithmetic and only ever read back here — so a bug in one
//! representation doesn't silently pass the other. Two subrounds of the
//! same round must produce identical checksums; divergence means the
//! branch took a different side under a different uninitialized-memory
//! fill pattern, which is itself a finding (spec.md Testable Property P3).

use crate::checksum_mix::fold;
use crate::error::{HarnessError, Result};
use crate::sequence_point::BranchObserver;

#[derive(Clone, Debug, Default)]
pub struct Checksum {
    breakpoint_form: Vec<(u64, bool)>,
    incore_form: u64,
    /// Whether `set_incore` has ever been called. Stays `false` for
    /// checksums built without a live tracee (unit tests, anything that
    /// never wires a `crate::patcher::Patcher`'s checksum slot up) so
    /// `self_consistent` doesn't spuriously fail against an in-core
    /// accumulator that was never given a chance to run.
    incore_known: bool,
}

impl Checksum {
    pub fn new() -> Checksum {
        Checksum::default()
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoint_form.is_empty()
    }

    /// Records the tracee-resident accumulator's value at sequence-point
    /// time, read back by `crate::memcheck::Memcheck::handle_pre` from the
    /// checksum slot `crate::patcher::Patcher::open` hands
    /// `BranchObserver::set_incore_slot`. Only covers edges
    /// `crate::terminator::prediction` left non-predicted — the same set
    /// `observe` below covers — so the two forms stay comparable.
    pub fn set_incore(&mut self, value: u64) {
        self.incore_form = value;
        self.incore_known = true;
    }

    pub fn self_consistent(&self) -> bool {
        if !self.incore_known {
            return true;
        }
        let recomputed = self
            .breakpoint_form
            .iter()
            .fold(0u64, |acc, &(addr, taken)| fold(acc, addr, taken));
        recomputed == self.incore_form
    }

    /// Two subrounds of the same round must have visited the same branches
    /// in the same order and taken the same sides. Returns the first
    /// mismatching position as a `ChecksumDivergence`, or `Ok` if they
    /// agree exactly.
    pub fn agrees_with(&self, other: &Checksum) -> Result<()> {
        if !self.self_consistent() || !other.self_consistent() {
            return Err(HarnessError::ChecksumDivergence {
                detail: "breakpoint-form and in-core checksum forms disagree within a subround"
                    .to_string(),
            });
        }
        if self.breakpoint_form.len() != other.breakpoint_form.len() {
            return Err(HarnessError::ChecksumDivergence {
                detail: format!(
                    "branch counts diverged across subrounds: {} vs {}",
                    self.breakpoint_form.len(),
                    other.breakpoint_form.len()
                ),
            });
        }
        for (i, (a, b)) in self
            .breakpoint_form
            .iter()
            .zip(other.breakpoint_form.iter())
            .enumerate()
        {
            if a != b {
                return Err(HarnessError::ChecksumDivergence {
                    detail: format!(
                        "branch #{} diverged across subrounds: {:#x}/{} vs {:#x}/{}",
                        i, a.0, a.1, b.0, b.1
                    ),
                });
            }
        }
        Ok(())
    }
}

impl BranchObserver for Checksum {
    fn observe(&mut self, orig_branch_addr: u64, taken: bool) {
        self.breakpoint_form.push((orig_branch_addr, taken));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_checksums_agree() {
        let a = Checksum::new();
        let b = Checksum::new();
        assert!(a.agrees_with(&b).is_ok());
    }

    #[test]
    fn identical_sequences_agree() {
        let mut a = Checksum::new();
        let mut b = Checksum::new();
        for (addr, taken) in [(0x1000u64, true), (0x1010, false), (0x1020, true)] {
            a.observe(addr, taken);
            b.observe(addr, taken);
        }
        assert!(a.agrees_with(&b).is_ok());
        assert!(a.self_consistent());
    }

    #[test]
    fn diverging_branch_is_detected() {
        let mut a = Checksum::new();
        let mut b = Checksum::new();
        a.observe(0x1000, true);
        b.observe(0x1000, false);
        assert!(a.agrees_with(&b).is_err());
    }

    #[test]
    fn diverging_branch_count_is_detected() {
        let mut a = Checksum::new();
        let mut b = Checksum::new();
        a.observe(0x1000, true);
        a.observe(0x1010, true);
        b.observe(0x1000, true);
        assert!(a.agrees_with(&b).is_err());
    }

    #[test]
    fn matching_incore_value_is_self_consistent() {
        let mut c = Checksum::new();
        c.observe(0x1000, true);
        c.observe(0x1010, false);
        let expected = fold(fold(0, 0x1000, true), 0x1010, false);
        c.set_incore(expected);
        assert!(c.self_consistent());
    }

    #[test]
    fn mismatching_incore_value_breaks_self_consistency() {
        let mut c = Checksum::new();
        c.observe(0x1000, true);
        c.set_incore(0xdead_beef);
        assert!(!c.self_consistent());
    }

    #[test]
    fn unset_incore_value_does_not_affect_consistency() {
        let mut c = Checksum::new();
        c.observe(0x1000, true);
        assert!(c.self_consistent());
    }
}
