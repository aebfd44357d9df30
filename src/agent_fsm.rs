//! Agent FSM (C6) — a pure state-transition function over agent turn states.
//!
//! Deliberately small and effect-free: the Agent Runner (C7) is the
//! imperative layer that decides what to do at each state, not this module.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    WaitingForModel,
    WaitingForToolResult,
    WaitingForModelFinal,
    Complete,
    Aborted,
}

impl AgentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Aborted)
    }
}

#[derive(Debug, Clone)]
pub enum AgentEvent {
    UserMessage,
    ModelToolCall { tool_use_id: String },
    ToolFinished,
    ModelFinal,
    AbortRequested,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid transition: {state:?} + {event}")]
pub struct InvalidTransition {
    pub state: AgentState,
    pub event: String,
}

/// Pure transition function: `(state, event) -> state'`.
///
/// Any `(state, event)` pair not named in spec §4.6 is a programmer error
/// and fails with `InvalidTransition` rather than silently staying put.
pub fn transition(
    state: AgentState,
    event: &AgentEvent,
) -> Result<AgentState, InvalidTransition> {
    use AgentEvent::*;
    use AgentState::*;

    // ABORT_REQUESTED is legal from any non-terminal state.
    if matches!(event, AbortRequested) {
        return if state.is_terminal() {
            Err(InvalidTransition {
                state,
                event: event_name(event),
            })
        } else {
            Ok(Aborted)
        };
    }

    match (state, event) {
        (Idle, UserMessage) => Ok(WaitingForModel),
        (WaitingForModel, ModelToolCall { .. }) => Ok(WaitingForToolResult),
        (WaitingForModel, ModelFinal) => Ok(Complete),
        (WaitingForToolResult, ToolFinished) => Ok(WaitingForModelFinal),
        (WaitingForModelFinal, ModelToolCall { .. }) => Ok(WaitingForToolResult),
        (WaitingForModelFinal, ModelFinal) => Ok(Complete),
        (state, event) => Err(InvalidTransition {
            state,
            event: event_name(event),
        }),
    }
}

fn event_name(event: &AgentEvent) -> String {
    match event {
        AgentEvent::UserMessage => "USER_MESSAGE".to_string(),
        AgentEvent::ModelToolCall { tool_use_id } => format!("MODEL_TOOL_CALL({tool_use_id})"),
        AgentEvent::ToolFinished => "TOOL_FINISHED".to_string(),
        AgentEvent::ModelFinal => "MODEL_FINAL".to_string(),
        AgentEvent::AbortRequested => "ABORT_REQUESTED".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_no_tools() {
        let s = transition(AgentState::Idle, &AgentEvent::UserMessage).unwrap();
        assert_eq!(s, AgentState::WaitingForModel);
        let s = transition(s, &AgentEvent::ModelFinal).unwrap();
        assert_eq!(s, AgentState::Complete);
        assert!(s.is_terminal());
    }

    #[test]
    fn single_tool_round_trip() {
        let s = transition(AgentState::Idle, &AgentEvent::UserMessage).unwrap();
        let s = transition(
            s,
            &AgentEvent::ModelToolCall {
                tool_use_id: "u1".into(),
            },
        )
        .unwrap();
        assert_eq!(s, AgentState::WaitingForToolResult);
        let s = transition(s, &AgentEvent::ToolFinished).unwrap();
        assert_eq!(s, AgentState::WaitingForModelFinal);
        let s = transition(s, &AgentEvent::ModelFinal).unwrap();
        assert_eq!(s, AgentState::Complete);
    }

    #[test]
    fn multi_step_reasoning_loops_back_into_tool_result() {
        let s = AgentState::WaitingForModelFinal;
        let s = transition(
            s,
            &AgentEvent::ModelToolCall {
                tool_use_id: "u2".into(),
            },
        )
        .unwrap();
        assert_eq!(s, AgentState::WaitingForToolResult);
    }

    #[test]
    fn abort_from_any_nonterminal_state() {
        for state in [
            AgentState::Idle,
            AgentState::WaitingForModel,
            AgentState::WaitingForToolResult,
            AgentState::WaitingForModelFinal,
        ] {
            let s = transition(state, &AgentEvent::AbortRequested).unwrap();
            assert_eq!(s, AgentState::Aborted);
        }
    }

    #[test]
    fn terminal_states_reject_every_event() {
        for state in [AgentState::Complete, AgentState::Aborted] {
            assert!(transition(state, &AgentEvent::UserMessage).is_err());
            assert!(transition(state, &AgentEvent::AbortRequested).is_err());
        }
    }

    #[test]
    fn illegal_edge_is_invalid_transition() {
        let err = transition(AgentState::Idle, &AgentEvent::ToolFinished).unwrap_err();
        assert_eq!(err.state, AgentState::Idle);
    }

    #[cfg(test)]
    mod proptests {
        use super::super::*;
        use proptest::prelude::*;

        fn any_event() -> impl Strategy<Value = AgentEvent> {
            prop_oneof![
                Just(AgentEvent::UserMessage),
                "[a-z0-9]{1,8}".prop_map(|id| AgentEvent::ModelToolCall { tool_use_id: id }),
                Just(AgentEvent::ToolFinished),
                Just(AgentEvent::ModelFinal),
                Just(AgentEvent::AbortRequested),
            ]
        }

        fn any_state() -> impl Strategy<Value = AgentState> {
            prop_oneof![
                Just(AgentState::Idle),
                Just(AgentState::WaitingForModel),
                Just(AgentState::WaitingForToolResult),
                Just(AgentState::WaitingForModelFinal),
                Just(AgentState::Complete),
                Just(AgentState::Aborted),
            ]
        }

        proptest! {
            #[test]
            fn terminal_states_never_transition(state in any_state(), event in any_event()) {
                if state.is_terminal() {
                    prop_assert!(transition(state, &event).is_err());
                }
            }

            #[test]
            fn successful_transition_changes_terminality_monotonically(
                state in any_state(), event in any_event()
            ) {
                if let Ok(next) = transition(state, &event) {
                    // A non-terminal state can only reach terminal via an
                    // explicit MODEL_FINAL or ABORT_REQUESTED edge.
                    if next.is_terminal() && !state.is_terminal() {
                        prop_assert!(matches!(
                            event,
                            AgentEvent::ModelFinal | AgentEvent::AbortRequested
                        ));
                    }
                }
            }
        }
    }
}
