//! Execution lifecycle state machine.

use crate::error::StateTransitionError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Pending,
    Starting,
    Running,
    Completing,
    Completed,
    Failed,
    Timeout,
    Cancelled,
    Dead,
}

impl ExecutionState {
    pub const ALL: [ExecutionState; 9] = [
        ExecutionState::Pending,
        ExecutionState::Starting,
        ExecutionState::Running,
        ExecutionState::Completing,
        ExecutionState::Completed,
        ExecutionState::Failed,
        ExecutionState::Timeout,
        ExecutionState::Cancelled,
        ExecutionState::Dead,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Completed
                | ExecutionState::Failed
                | ExecutionState::Timeout
                | ExecutionState::Cancelled
                | ExecutionState::Dead
        )
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    ///
    /// `Dead` is reachable from every non-terminal state (forced kill).
    pub fn can_transition_to(self, next: ExecutionState) -> bool {
        use ExecutionState::*;

        if self.is_terminal() {
            return false;
        }
        if next == Dead {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Starting)
                | (Starting, Running)
                | (Running, Completing)
                | (Running, Failed)
                | (Running, Timeout)
                | (Running, Cancelled)
                | (Completing, Completed)
        )
    }

    pub fn transition(self, next: ExecutionState) -> Result<ExecutionState, StateTransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(StateTransitionError { from: self, to: next })
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionState::Pending => "PENDING",
            ExecutionState::Starting => "STARTING",
            ExecutionState::Running => "RUNNING",
            ExecutionState::Completing => "COMPLETING",
            ExecutionState::Completed => "COMPLETED",
            ExecutionState::Failed => "FAILED",
            ExecutionState::Timeout => "TIMEOUT",
            ExecutionState::Cancelled => "CANCELLED",
            ExecutionState::Dead => "DEAD",
        }
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use ExecutionState::*;

    #[test]
    fn test_happy_path() {
        let mut state = Pending;
        for next in [Starting, Running, Completing, Completed] {
            state = state.transition(next).unwrap();
        }
        assert_eq!(state, Completed);
        assert!(state.is_terminal());
    }

    #[test]
    fn test_running_failure_edges() {
        for next in [Failed, Timeout, Cancelled] {
            assert!(Running.can_transition_to(next));
        }
        assert!(!Starting.can_transition_to(Timeout));
        assert!(!Pending.can_transition_to(Running));
        assert!(!Completing.can_transition_to(Failed));
    }

    #[test]
    fn test_dead_from_any_non_terminal() {
        for state in [Pending, Starting, Running, Completing] {
            assert_eq!(state.transition(Dead).unwrap(), Dead);
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        let err = Completed.transition(Dead).unwrap_err();
        assert_eq!(err.from, Completed);
        assert_eq!(err.to, Dead);
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(serde_json::to_string(&Completing).unwrap(), "\"COMPLETING\"");
        assert_eq!(Timeout.to_string(), "TIMEOUT");
    }

    fn any_state() -> impl Strategy<Value = ExecutionState> {
        (0..ExecutionState::ALL.len()).prop_map(|i| ExecutionState::ALL[i])
    }

    proptest! {
        #[test]
        fn prop_terminal_has_no_outgoing_edges(from in any_state(), to in any_state()) {
            if from.is_terminal() {
                prop_assert!(from.transition(to).is_err());
            }
        }

        #[test]
        fn prop_random_walk_stays_on_graph(steps in proptest::collection::vec(any_state(), 0..20)) {
            let mut state = Pending;
            for next in steps {
                match state.transition(next) {
                    Ok(s) => {
                        prop_assert!(state.can_transition_to(s));
                        state = s;
                    }
                    Err(e) => prop_assert_eq!(e.from, state),
                }
            }
            prop_assert!(ExecutionState::ALL.contains(&state));
        }
    }
}
