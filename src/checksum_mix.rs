//! The per-edge mixing function shared by the Jcc checksum's two
//! independently-computed forms (spec.md §3/§4.5): `crate::terminator`'s
//! natively-executing trampoline arithmetic (`rol`/`movabs`/`xor` emitted
//! straight into the tracee) and `crate::memcheck::checksum::Checksum`'s
//! host-side breakpoint-form fold. Kept in one free-standing module so
//! neither has to depend on the other's crate layer just to agree on what a
//! branch decision contributes.

/// One branch decision's contribution to a running checksum accumulator.
pub fn branch_mix(orig_branch_addr: u64, taken: bool) -> u64 {
    orig_branch_addr
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add(taken as u64)
}

/// Folds one more decision into a running accumulator: rotate left 5, then
/// XOR in the mixed value. `crate::terminator::emit_native_jcc` emits this
/// exact sequence (`rol qword [slot], 5` / `movabs r11, mix` / `xor qword
/// [slot], r11`) so the two forms are bit-for-bit comparable.
pub fn fold(acc: u64, orig_branch_addr: u64, taken: bool) -> u64 {
    acc.rotate_left(5) ^ branch_mix(orig_branch_addr, taken)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_is_order_sensitive() {
        let a = fold(fold(0, 0x1000, true), 0x2000, false);
        let b = fold(fold(0, 0x2000, false), 0x1000, true);
        assert_ne!(a, b);
    }

    #[test]
    fn fold_distinguishes_taken_from_not_taken() {
        assert_ne!(fold(0, 0x1000, true), fold(0, 0x1000, false));
    }
}
