//! Static, translation-time Jcc prediction policy (spec.md §4.3 "Indirect
//! jump"'s sibling feature for conditional jumps, spec.md §6
//! `--prediction-mode`). Every mode here is a pure function of information
//! already available when `crate::terminator::Terminator::create` builds a
//! `DirectConditionalJump` — no dynamic history is consulted or recorded,
//! matching the original implementation's `get_prediction` family
//! (`block-term.cc`), which decides both sides once, at construction, and
//! never revisits the decision.
//!
//! `IClass`/`IForm` are grounded on `get_bias_iclass`'s per-condition-code
//! table rather than the original's probability tables: those
//! (`jcc_iclass.inc`/`jcc_iform.inc`, thresholded at 0.8) aren't part of the
//! retrievable source; the bias table is the closest surviving equivalent
//! and is documented as a deliberate substitution in DESIGN.md.

use iced_x86::{ConditionCode, Mnemonic};

use crate::config::PredictionMode;

/// Whether a Jcc's destination lies before or after the branch itself.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub fn of(branch_dst: u64, after_pc: u64) -> Direction {
        if branch_dst >= after_pc {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }
}

/// Which side(s) of a Jcc get eagerly resolved to a direct jump at
/// construction instead of staying a lazy, harness-mediated link. The two
/// fields are independent: both can be true (both sides resolved, nothing
/// left lazy) or both false (fully lazy, the `PredictionMode::None`
/// behavior).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct Prediction {
    pub taken: bool,
    pub not_taken: bool,
}

/// Per-condition-code static lean used by `IClass`/`IForm` (`get_bias_iclass`,
/// `block-term.cc:195-219`).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Bias {
    None,
    Jcc,
    Fallthru,
}

fn bias(cc: ConditionCode) -> Bias {
    match cc {
        ConditionCode::ns => Bias::Jcc,
        ConditionCode::s
        | ConditionCode::l
        | ConditionCode::g
        | ConditionCode::ge
        | ConditionCode::ne
        | ConditionCode::o
        | ConditionCode::b
        | ConditionCode::a
        | ConditionCode::ae
        | ConditionCode::le => Bias::Fallthru,
        ConditionCode::e | ConditionCode::be => Bias::None,
        // np/p/no have no entry in the surviving table; treat them the same
        // as the other two-sided cases the table omits (no lean either way).
        ConditionCode::p | ConditionCode::np | ConditionCode::no => Bias::None,
    }
}

fn predict_bias(cc: ConditionCode) -> Prediction {
    match bias(cc) {
        Bias::None => Prediction {
            taken: false,
            not_taken: false,
        },
        Bias::Jcc => Prediction {
            taken: true,
            not_taken: false,
        },
        Bias::Fallthru => Prediction {
            taken: false,
            not_taken: true,
        },
    }
}

fn predict_direction(dir: Direction) -> Prediction {
    match dir {
        Direction::Backward => Prediction {
            taken: true,
            not_taken: true,
        },
        Direction::Forward => Prediction {
            taken: false,
            not_taken: false,
        },
    }
}

/// `get_prediction_last_iclass`, `block-term.cc:163-177`: keyed by the
/// mnemonic of the instruction immediately preceding the Jcc in program
/// order, not by any runtime history.
fn predict_last_iclass(last: Option<Mnemonic>) -> Prediction {
    let (taken, not_taken) = match last {
        Some(Mnemonic::Xor) => (false, true),
        Some(Mnemonic::Sub) => (true, true),
        Some(Mnemonic::Sar) => (true, false),
        Some(Mnemonic::Add) => (false, true),
        Some(Mnemonic::Push) => (false, true),
        Some(Mnemonic::Movzx) => (true, false),
        Some(Mnemonic::Dec) => (true, false),
        Some(Mnemonic::Cmpxchg) => (true, false),
        Some(Mnemonic::Mov) => (false, true),
        Some(Mnemonic::Cmp) => (false, true),
        _ => (false, false),
    };
    Prediction { taken, not_taken }
}

/// Top-level dispatcher `crate::terminator::Terminator::create` calls for
/// every `DirectConditionalJump`.
pub fn predict(
    mode: PredictionMode,
    cc: ConditionCode,
    dir: Direction,
    last_mnemonic: Option<Mnemonic>,
) -> Prediction {
    match mode {
        PredictionMode::None => Prediction::default(),
        PredictionMode::Direction => predict_direction(dir),
        PredictionMode::IClass | PredictionMode::IForm => predict_bias(cc),
        PredictionMode::LastIClass => predict_last_iclass(last_mnemonic),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_mode_never_predicts() {
        let p = predict(PredictionMode::None, ConditionCode::e, Direction::Backward, None);
        assert!(!p.taken && !p.not_taken);
    }

    #[test]
    fn direction_mode_predicts_both_sides_of_a_backward_branch() {
        let p = predict(PredictionMode::Direction, ConditionCode::e, Direction::Backward, None);
        assert!(p.taken && p.not_taken);
    }

    #[test]
    fn direction_mode_predicts_neither_side_of_a_forward_branch() {
        let p = predict(PredictionMode::Direction, ConditionCode::e, Direction::Forward, None);
        assert!(!p.taken && !p.not_taken);
    }

    #[test]
    fn last_iclass_mode_keys_off_preceding_mnemonic() {
        let p = predict(
            PredictionMode::LastIClass,
            ConditionCode::e,
            Direction::Forward,
            Some(Mnemonic::Dec),
        );
        assert!(p.taken && !p.not_taken);

        let none = predict(
            PredictionMode::LastIClass,
            ConditionCode::e,
            Direction::Forward,
            Some(Mnemonic::Nop),
        );
        assert!(!none.taken && !none.not_taken);
    }

    #[test]
    fn iclass_mode_uses_bias_table() {
        let jcc = predict(PredictionMode::IClass, ConditionCode::ns, Direction::Forward, None);
        assert!(jcc.taken && !jcc.not_taken);

        let fallthru = predict(PredictionMode::IClass, ConditionCode::le, Direction::Forward, None);
        assert!(!fallthru.taken && fallthru.not_taken);

        let none = predict(PredictionMode::IClass, ConditionCode::e, Direction::Forward, None);
        assert!(!none.taken && !none.not_taken);
    }
}
