//! Call-depth bookkeeping (SPEC_FULL.md §C.1), wired to
//! `crate::sequence_point::CallObserver`. In the original implementation
//! the tracked slot mattered because the shadow return address itself
//! needed fill-pattern seeding; here `crate::terminator::DirectCall` pushes
//! a real, compile-time-constant return address directly onto the
//! tracee's stack, so ordinary stack-snapshot taint algebra already covers
//! it and this tracker's only remaining job is the depth counter `-p`
//! reports at exit.

use crate::sequence_point::CallObserver;

#[derive(Default)]
pub struct CallTracker {
    depth: u64,
    calls: u64,
    returns: u64,
}

impl CallTracker {
    pub fn new() -> CallTracker {
        CallTracker::default()
    }

    pub fn depth(&self) -> u64 {
        self.depth
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }

    pub fn returns(&self) -> u64 {
        self.returns
    }
}

impl CallObserver for CallTracker {
    fn on_call(&mut self) {
        self.depth += 1;
        self.calls += 1;
    }

    fn on_return(&mut self) {
        self.depth = self.depth.saturating_sub(1);
        self.returns += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_tracks_call_return_pairs() {
        let mut t = CallTracker::new();
        t.on_call();
        t.on_call();
        assert_eq!(t.depth(), 2);
        t.on_return();
        assert_eq!(t.depth(), 1);
    }

    #[test]
    fn depth_never_underflows() {
        let mut t = CallTracker::new();
        t.on_return();
        assert_eq!(t.depth(), 0);
    }
}
