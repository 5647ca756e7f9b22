//! Tracks the stack's low-water mark so newly-exposed bytes (`rsp`
//! decrementing below anywhere it has been this round) get filled with the
//! current subround's pattern before the tracee can read them as
//! leftover data from a shallower frame. Grounded on the same idea as
//! `crate::page_tracker`'s snapshot-on-first-touch policy, applied to the
//! stack instead of the heap.

use crate::error::Result;
use crate::tracee::Tracee;

pub struct StackTracker {
    low_water_mark: Option<u64>,
}

impl StackTracker {
    pub fn new() -> StackTracker {
        StackTracker {
            low_water_mark: None,
        }
    }

    /// Re-anchors the mark to `sp` at the start of a round/subround replay,
    /// since nothing below the replay's starting `sp` is "newly exposed" —
    /// it was already part of `pre_state`.
    pub fn reset(&mut self, sp: u64) {
        self.low_water_mark = Some(sp);
    }

    /// Called from the `StackGrow` sequence point's `Phase::Post` handler
    /// once the instruction that dropped `sp` has executed for real. Fills
    /// `[new_sp, old_mark)` with `pattern` if `sp` moved past the mark.
    pub fn on_grow(&mut self, tracee: &mut Tracee, new_sp: u64, pattern: u8) -> Result<()> {
        let mark = self.low_water_mark.unwrap_or(new_sp);
        if new_sp < mark {
            let len = (mark - new_sp) as usize;
            tracee.write_mem(new_sp, &vec![pattern; len])?;
            self.low_water_mark = Some(new_sp);
        }
        Ok(())
    }
}

impl Default for StackTracker {
    fn default() -> Self {
        StackTracker::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_anchors_mark() {
        let mut t = StackTracker::new();
        t.reset(0x7fff_0000);
        assert_eq!(t.low_water_mark, Some(0x7fff_0000));
    }
}
