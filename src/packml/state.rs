//! The closed `PackMLState` set (ISA-TR88) and its wire-string mapping.
//!
//! Grounded on `PackML::State`/`PackML::stateToString` used throughout
//! `original_source/BT_Controller/src/BehaviorTreeController.cpp` and
//! `PackML_Stations/Physical-Stations/include/PackMLStateMachine.h`: a
//! closed enum with a bidirectional string mapping table rather than
//! reflection (see SPEC_FULL.md §9's "magic-enum" design note).

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PackMlState {
    Idle,
    Starting,
    Execute,
    Completing,
    Complete,
    Resetting,
    Holding,
    Held,
    Unholding,
    Suspending,
    Suspended,
    Unsuspending,
    Aborting,
    Aborted,
    Clearing,
    Stopping,
    Stopped,
}

impl PackMlState {
    /// A behavior-tree handle exists iff the controller is in one of these
    /// states (SPEC_FULL.md §3's controller-state invariant).
    pub fn is_armed(self) -> bool {
        matches!(
            self,
            PackMlState::Starting
                | PackMlState::Execute
                | PackMlState::Suspended
                | PackMlState::Completing
                | PackMlState::Complete
                | PackMlState::Stopping
                | PackMlState::Aborting
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PackMlState::Idle => "IDLE",
            PackMlState::Starting => "STARTING",
            PackMlState::Execute => "EXECUTE",
            PackMlState::Completing => "COMPLETING",
            PackMlState::Complete => "COMPLETE",
            PackMlState::Resetting => "RESETTING",
            PackMlState::Holding => "HOLDING",
            PackMlState::Held => "HELD",
            PackMlState::Unholding => "UNHOLDING",
            PackMlState::Suspending => "SUSPENDING",
            PackMlState::Suspended => "SUSPENDED",
            PackMlState::Unsuspending => "UNSUSPENDING",
            PackMlState::Aborting => "ABORTING",
            PackMlState::Aborted => "ABORTED",
            PackMlState::Clearing => "CLEARING",
            PackMlState::Stopping => "STOPPING",
            PackMlState::Stopped => "STOPPED",
        }
    }

    pub fn from_str_exact(s: &str) -> Option<Self> {
        Some(match s {
            "IDLE" => PackMlState::Idle,
            "STARTING" => PackMlState::Starting,
            "EXECUTE" => PackMlState::Execute,
            "COMPLETING" => PackMlState::Completing,
            "COMPLETE" => PackMlState::Complete,
            "RESETTING" => PackMlState::Resetting,
            "HOLDING" => PackMlState::Holding,
            "HELD" => PackMlState::Held,
            "UNHOLDING" => PackMlState::Unholding,
            "SUSPENDING" => PackMlState::Suspending,
            "SUSPENDED" => PackMlState::Suspended,
            "UNSUSPENDING" => PackMlState::Unsuspending,
            "ABORTING" => PackMlState::Aborting,
            "ABORTED" => PackMlState::Aborted,
            "CLEARING" => PackMlState::Clearing,
            "STOPPING" => PackMlState::Stopping,
            "STOPPED" => PackMlState::Stopped,
            _ => return None,
        })
    }
}

impl fmt::Display for PackMlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_state_round_trips_through_its_string() {
        let all = [
            PackMlState::Idle,
            PackMlState::Starting,
            PackMlState::Execute,
            PackMlState::Completing,
            PackMlState::Complete,
            PackMlState::Resetting,
            PackMlState::Holding,
            PackMlState::Held,
            PackMlState::Unholding,
            PackMlState::Suspending,
            PackMlState::Suspended,
            PackMlState::Unsuspending,
            PackMlState::Aborting,
            PackMlState::Aborted,
            PackMlState::Clearing,
            PackMlState::Stopping,
            PackMlState::Stopped,
        ];
        for state in all {
            assert_eq!(PackMlState::from_str_exact(state.as_str()), Some(state));
        }
    }

    #[test]
    fn unknown_string_is_none() {
        assert_eq!(PackMlState::from_str_exact("BOGUS"), None);
    }

    #[test]
    fn armed_iff_tree_handle_states() {
        assert!(PackMlState::Execute.is_armed());
        assert!(PackMlState::Suspended.is_armed());
        assert!(!PackMlState::Idle.is_armed());
        assert!(!PackMlState::Resetting.is_armed());
    }
}
