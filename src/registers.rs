//! A thin, byte-addressable wrapper over the tracee's general-purpose and
//! floating-point register files.
//!
//! `Registers` is reused for two very different purposes: it is the type
//! `Tracee::get_regs`/`set_regs` exchange with the kernel, and it is also
//! treated as a flat array of 8-byte lanes so that [`crate::state::State`]
//! can XOR/OR two register files together when deriving a taint mask (see
//! `I-S1` in spec.md §3). Both uses are implemented here so the rest of the
//! crate never has to reach into `libc::user_regs_struct` directly.

use libc::user_regs_struct;
use std::mem::size_of;

/// Number of 64-bit lanes in `user_regs_struct`. Asserted against the real
/// struct size below so a libc ABI change fails loudly instead of silently
/// under- or over-reading.
const GP_LANES: usize = size_of::<user_regs_struct>() / size_of::<u64>();

static_assertions::const_assert_eq!(size_of::<user_regs_struct>() % size_of::<u64>(), 0);

#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct Registers {
    inner: user_regs_struct,
}

impl Default for Registers {
    fn default() -> Self {
        // `user_regs_struct` has no `Default` impl in libc; zero-initialize.
        unsafe { std::mem::zeroed() }
    }
}

impl Registers {
    pub fn new(inner: user_regs_struct) -> Registers {
        Registers { inner }
    }

    pub fn ptrace(&self) -> user_regs_struct {
        self.inner
    }

    pub fn ptrace_mut(&mut self) -> &mut user_regs_struct {
        &mut self.inner
    }

    pub fn ip(&self) -> u64 {
        self.inner.rip
    }

    pub fn set_ip(&mut self, pc: u64) {
        self.inner.rip = pc;
    }

    pub fn sp(&self) -> u64 {
        self.inner.rsp
    }

    pub fn set_sp(&mut self, sp: u64) {
        self.inner.rsp = sp;
    }

    /// `orig_rax` is how the kernel reports which syscall was entered;
    /// `rax` is overwritten with the return value on syscall-exit.
    pub fn syscallno(&self) -> i64 {
        self.inner.orig_rax as i64
    }

    pub fn set_syscallno(&mut self, no: i64) {
        self.inner.orig_rax = no as u64;
    }

    pub fn syscall_result(&self) -> u64 {
        self.inner.rax
    }

    pub fn syscall_result_signed(&self) -> i64 {
        self.inner.rax as i64
    }

    pub fn set_syscall_result(&mut self, result: u64) {
        self.inner.rax = result;
    }

    /// The six argument registers used by the Linux x86-64 syscall ABI, in
    /// order. Consumed directly by the Syscall Checker (spec.md §4.6).
    pub fn syscall_args(&self) -> [u64; 6] {
        [
            self.inner.rdi,
            self.inner.rsi,
            self.inner.rdx,
            self.inner.r10,
            self.inner.r8,
            self.inner.r9,
        ]
    }

    pub fn flags(&self) -> u64 {
        self.inner.eflags
    }

    pub fn set_flags(&mut self, value: u64) {
        self.inner.eflags = value;
    }

    fn lanes(&self) -> &[u64; GP_LANES] {
        unsafe { &*(&self.inner as *const user_regs_struct as *const [u64; GP_LANES]) }
    }

    fn lanes_mut(&mut self) -> &mut [u64; GP_LANES] {
        unsafe { &mut *(&mut self.inner as *mut user_regs_struct as *mut [u64; GP_LANES]) }
    }

    pub fn zero(&mut self) {
        for lane in self.lanes_mut() {
            *lane = 0;
        }
    }

    pub fn is_zero(&self) -> bool {
        self.lanes().iter().all(|&lane| lane == 0)
    }

    pub fn xor_assign(&mut self, other: &Registers) {
        for (a, b) in self.lanes_mut().iter_mut().zip(other.lanes().iter()) {
            *a ^= b;
        }
    }

    pub fn or_assign(&mut self, other: &Registers) {
        for (a, b) in self.lanes_mut().iter_mut().zip(other.lanes().iter()) {
            *a |= b;
        }
    }

    pub fn zeroed() -> Registers {
        Registers {
            inner: unsafe { std::mem::zeroed() },
        }
    }

    /// Lane-wise: `self` and `other` agree everywhere `mask` is zero.
    pub fn similar(&self, other: &Registers, mask: &Registers) -> bool {
        self.lanes()
            .iter()
            .zip(other.lanes().iter())
            .zip(mask.lanes().iter())
            .all(|((&a, &b), &m)| m != 0 || a == b)
    }
}

impl PartialEq for Registers {
    fn eq(&self, other: &Registers) -> bool {
        self.lanes() == other.lanes()
    }
}

/// The subset of FP/SSE state the harness snapshots. Like `Registers`, this
/// is also treated as a lane array for the taint XOR (rarely interesting in
/// practice: the most common source of FP taint is an uninitialized XMM
/// register used as a memcpy source, which the algebra below catches the
/// same way GP-register taint is caught).
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct FpRegisters {
    inner: libc::user_fpregs_struct,
}

impl Default for FpRegisters {
    fn default() -> Self {
        // `user_fpregs_struct` has no `Default` impl in libc; zero-initialize.
        unsafe { std::mem::zeroed() }
    }
}

const FP_BYTES: usize = size_of::<libc::user_fpregs_struct>();

impl FpRegisters {
    pub fn new(inner: libc::user_fpregs_struct) -> FpRegisters {
        FpRegisters { inner }
    }

    pub fn ptrace(&self) -> libc::user_fpregs_struct {
        self.inner
    }

    pub fn xmm(&self, idx: usize) -> &[u8] {
        let start = idx * 16;
        &self.bytes()[start..start + 16]
    }

    fn bytes(&self) -> &[u8; FP_BYTES] {
        unsafe { &*(&self.inner as *const _ as *const [u8; FP_BYTES]) }
    }

    fn bytes_mut(&mut self) -> &mut [u8; FP_BYTES] {
        unsafe { &mut *(&mut self.inner as *mut _ as *mut [u8; FP_BYTES]) }
    }

    pub fn zero(&mut self) {
        for b in self.bytes_mut() {
            *b = 0;
        }
    }

    pub fn is_zero(&self) -> bool {
        self.bytes().iter().all(|&b| b == 0)
    }

    pub fn xor_assign(&mut self, other: &FpRegisters) {
        let rhs = *other.bytes();
        for (a, b) in self.bytes_mut().iter_mut().zip(rhs.iter()) {
            *a ^= b;
        }
    }

    pub fn or_assign(&mut self, other: &FpRegisters) {
        let rhs = *other.bytes();
        for (a, b) in self.bytes_mut().iter_mut().zip(rhs.iter()) {
            *a |= b;
        }
    }

    pub fn zeroed() -> FpRegisters {
        FpRegisters::default()
    }

    pub fn similar(&self, other: &FpRegisters, mask: &FpRegisters) -> bool {
        self.bytes()
            .iter()
            .zip(other.bytes().iter())
            .zip(mask.bytes().iter())
            .all(|((&a, &b), &m)| m != 0 || a == b)
    }
}

impl PartialEq for FpRegisters {
    fn eq(&self, other: &FpRegisters) -> bool {
        self.bytes() == other.bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regs_with_rax(rax: u64) -> Registers {
        let mut inner: user_regs_struct = unsafe { std::mem::zeroed() };
        inner.rax = rax;
        Registers::new(inner)
    }

    #[test]
    fn xor_self_is_zero() {
        let mut a = regs_with_rax(0xdead_beef);
        let b = a;
        a.xor_assign(&b);
        assert!(a.is_zero());
    }

    #[test]
    fn xor_is_commutative() {
        let a = regs_with_rax(0x1234);
        let b = regs_with_rax(0x8765_4321);
        let mut ab = a;
        ab.xor_assign(&b);
        let mut ba = b;
        ba.xor_assign(&a);
        assert_eq!(ab, ba);
    }

    #[test]
    fn eq_iff_xor_zero() {
        let a = regs_with_rax(42);
        let b = regs_with_rax(42);
        let c = regs_with_rax(43);
        assert_eq!(a, b);
        assert_ne!(a, c);
        let mut axc = a;
        axc.xor_assign(&c);
        assert!(!axc.is_zero());
    }

    #[test]
    fn syscall_args_order() {
        let mut inner: user_regs_struct = unsafe { std::mem::zeroed() };
        inner.rdi = 1;
        inner.rsi = 2;
        inner.rdx = 3;
        inner.r10 = 4;
        inner.r8 = 5;
        inner.r9 = 6;
        let regs = Registers::new(inner);
        assert_eq!(regs.syscall_args(), [1, 2, 3, 4, 5, 6]);
    }
}
