//! State (spec.md §4.5): register file + FP state + per-page snapshot,
//! composing the same XOR/OR/zero/fill/compare algebra each piece already
//! provides (Invariant S1, Testable Property P4: `a == b` iff
//! `(a^b).is_zero()` holds for the composed State exactly when it holds
//! for each component).

use crate::registers::{FpRegisters, Registers};
use crate::snapshot::Snapshot;

#[derive(Clone, Debug)]
pub struct State {
    pub gp_regs: Registers,
    pub fp_regs: FpRegisters,
    pub snapshot: Snapshot,
}

impl State {
    pub fn new(gp_regs: Registers, fp_regs: FpRegisters, snapshot: Snapshot) -> State {
        State {
            gp_regs,
            fp_regs,
            snapshot,
        }
    }

    pub fn zero(&mut self) {
        self.gp_regs.zero();
        self.fp_regs.zero();
        self.snapshot.zero();
    }

    pub fn is_zero(&self) -> bool {
        self.gp_regs.is_zero() && self.fp_regs.is_zero() && self.snapshot.is_zero()
    }

    pub fn xor_assign(&mut self, other: &State) {
        self.gp_regs.xor_assign(&other.gp_regs);
        self.fp_regs.xor_assign(&other.fp_regs);
        self.snapshot.xor_assign(&other.snapshot);
    }

    pub fn or_assign(&mut self, other: &State) {
        self.gp_regs.or_assign(&other.gp_regs);
        self.fp_regs.or_assign(&other.fp_regs);
        self.snapshot.or_assign(&other.snapshot);
    }

    /// `a == b` masked by which bytes/bits `mask` says were ever tainted.
    /// Used to compare two subrounds' post-states: divergence only where
    /// the mask says a byte was touched by uninitialized data indicates a
    /// real bug; divergence elsewhere would indicate the checker itself
    /// is unsound.
    pub fn similar(&self, other: &State, mask: &State) -> bool {
        self.gp_regs.similar(&other.gp_regs, &mask.gp_regs)
            && self.fp_regs.similar(&other.fp_regs, &mask.fp_regs)
            && self.snapshot.similar(&other.snapshot, &mask.snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::FpRegisters as Fp;

    fn zero_state() -> State {
        State::new(
            Registers::zeroed(),
            Fp::zeroed(),
            Snapshot::new(),
        )
    }

    #[test]
    fn xor_self_is_zero() {
        let mut a = zero_state();
        let b = a.clone();
        a.xor_assign(&b);
        assert!(a.is_zero());
    }
}
