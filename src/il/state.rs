//! The component state lattice.

use enum_primitive_derive::Primitive;

/// A component lifecycle state.
///
/// The lattice is `Loaded` ⇄ `Idle` ⇄ `Executing` ⇄ `Paused`, plus
/// `WaitForResources` reachable only from `Loaded`.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Primitive, Default)]
pub enum IlState {
    /// Constructed; no buffers allocated.
    #[default]
    Loaded = 1,
    /// Resources and buffers allocated; not processing.
    Idle = 2,
    /// Buffers flowing.
    Executing = 3,
    /// Processing suspended; buffers retained.
    Paused = 4,
    /// Parked awaiting resources before moving to Idle.
    WaitForResources = 5,
}

impl IlState {
    fn table_index(self) -> usize {
        self as usize - 1
    }
}

/// What a `StateSet` command means for a given (current, requested) pair.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransitionVerdict {
    /// Run the transition handler.
    Run,
    /// Accept and complete immediately, without running a handler.
    NoOp,
    /// Reject with `IncorrectStateTransition`.
    Reject,
}

use TransitionVerdict::{NoOp, Reject, Run};

/// The transition matrix. Rows are the current state, columns the requested
/// state, both in `IlState` declaration order. Do not re-order.
const TRANSITION_TABLE: [[TransitionVerdict; 5]; 5] = [
    // From Loaded:          Loaded  Idle    Exe     Paused  WaitForRes
    /* Loaded */ [NoOp, Run, Reject, Reject, Run],
    /* Idle */ [Run, NoOp, Run, Run, Reject],
    /* Executing */ [Reject, Run, Run, Run, Reject],
    /* Paused */ [Reject, Run, Run, NoOp, Reject],
    /* WaitForRes */ [Run, Reject, Reject, Reject, NoOp],
];

/// Classifies a requested state transition against the lattice.
pub fn classify(current: IlState, requested: IlState) -> TransitionVerdict {
    TRANSITION_TABLE[current.table_index()][requested.table_index()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_state_is_a_no_op() {
        for s in [
            IlState::Loaded,
            IlState::Idle,
            IlState::Executing,
            IlState::Paused,
            IlState::WaitForResources,
        ] {
            // Executing -> Executing runs a (trivial) handler; every other
            // self-transition completes immediately.
            if s == IlState::Executing {
                assert_eq!(classify(s, s), Run);
            } else {
                assert_eq!(classify(s, s), NoOp);
            }
        }
    }

    #[test]
    fn adjacent_transitions_run() {
        assert_eq!(classify(IlState::Loaded, IlState::Idle), Run);
        assert_eq!(classify(IlState::Idle, IlState::Loaded), Run);
        assert_eq!(classify(IlState::Idle, IlState::Executing), Run);
        assert_eq!(classify(IlState::Executing, IlState::Idle), Run);
        assert_eq!(classify(IlState::Executing, IlState::Paused), Run);
        assert_eq!(classify(IlState::Paused, IlState::Executing), Run);
        assert_eq!(classify(IlState::Paused, IlState::Idle), Run);
        assert_eq!(classify(IlState::Idle, IlState::Paused), Run);
        assert_eq!(classify(IlState::Loaded, IlState::WaitForResources), Run);
        assert_eq!(classify(IlState::WaitForResources, IlState::Loaded), Run);
    }

    #[test]
    fn non_adjacent_transitions_reject() {
        assert_eq!(classify(IlState::Loaded, IlState::Executing), Reject);
        assert_eq!(classify(IlState::Loaded, IlState::Paused), Reject);
        assert_eq!(classify(IlState::Executing, IlState::Loaded), Reject);
        assert_eq!(classify(IlState::Paused, IlState::Loaded), Reject);
        assert_eq!(classify(IlState::Idle, IlState::WaitForResources), Reject);
        assert_eq!(classify(IlState::WaitForResources, IlState::Idle), Reject);
        assert_eq!(
            classify(IlState::WaitForResources, IlState::Executing),
            Reject
        );
    }
}
