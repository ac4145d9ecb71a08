//! Execution states shared by workflow, task and action executions.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::AppError;

/// Lifecycle state of an execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    /// Created, not yet scheduled.
    Idle,
    /// Join task blocked on its inbound tasks.
    Waiting,
    Running,
    /// Waiting for a retry or a timer.
    Delayed,
    Paused,
    Success,
    Cancelled,
    Error,
}

impl State {
    pub const COMPLETED: [State; 3] = [State::Success, State::Error, State::Cancelled];

    pub const INCOMPLETE: [State; 5] = [
        State::Idle,
        State::Running,
        State::Waiting,
        State::Delayed,
        State::Paused,
    ];

    pub fn is_completed(self) -> bool {
        Self::COMPLETED.contains(&self)
    }

    pub fn is_incomplete(self) -> bool {
        !self.is_completed()
    }

    pub fn is_success(self) -> bool {
        self == State::Success
    }

    pub fn is_error(self) -> bool {
        self == State::Error
    }

    pub fn is_cancelled(self) -> bool {
        self == State::Cancelled
    }

    pub fn is_running(self) -> bool {
        self == State::Running
    }

    pub fn is_paused(self) -> bool {
        self == State::Paused
    }

    /// Transitions allowed for a workflow execution.
    ///
    /// `IDLE -> RUNNING -> {PAUSED <-> RUNNING} -> {SUCCESS | ERROR | CANCELLED}`;
    /// an idle or paused workflow may also be stopped directly.
    pub fn workflow_transition_allowed(self, to: State) -> bool {
        use State::*;
        match (self, to) {
            (from, _) if from.is_completed() => false,
            (Idle, Running) | (Running, Paused) | (Paused, Running) => true,
            (Idle | Running | Paused, Success | Error | Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Idle => "IDLE",
            State::Waiting => "WAITING",
            State::Running => "RUNNING",
            State::Delayed => "DELAYED",
            State::Paused => "PAUSED",
            State::Success => "SUCCESS",
            State::Cancelled => "CANCELLED",
            State::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for State {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "IDLE" => Ok(State::Idle),
            "WAITING" => Ok(State::Waiting),
            "RUNNING" => Ok(State::Running),
            "DELAYED" => Ok(State::Delayed),
            "PAUSED" => Ok(State::Paused),
            "SUCCESS" => Ok(State::Success),
            "CANCELLED" | "CANCELED" => Ok(State::Cancelled),
            "ERROR" => Ok(State::Error),
            other => Err(AppError::Parse(format!("unknown state '{}'", other))),
        }
    }
}

impl TryFrom<String> for State {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, AppError> {
        value.parse()
    }
}

/// Outbound clause that produced a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransitionEvent {
    #[serde(rename = "on-success")]
    OnSuccess,
    #[serde(rename = "on-error")]
    OnError,
    #[serde(rename = "on-complete")]
    OnComplete,
}

impl std::fmt::Display for TransitionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OnSuccess => write!(f, "on-success"),
            Self::OnError => write!(f, "on-error"),
            Self::OnComplete => write!(f, "on-complete"),
        }
    }
}

/// Provenance of a task: which execution fired which clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggeredBy {
    pub task_id: String,
    pub event: TransitionEvent,
}

/// Join cardinality of a task spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Join {
    /// Every inbound task must trigger the join.
    All,
    /// At least this many inbound tasks must trigger the join.
    Count(u32),
}

/// Result of evaluating a join precondition.
#[derive(Debug, Clone, PartialEq)]
pub struct LogicState {
    pub state: State,
    pub state_info: Option<String>,
    pub triggered_by: Vec<TriggeredBy>,
    /// Remaining inbound triggers required before the join may run.
    pub cardinality: u32,
}

impl LogicState {
    pub fn new(state: State) -> Self {
        Self {
            state,
            state_info: None,
            triggered_by: Vec::new(),
            cardinality: 0,
        }
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.state_info = Some(info.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_states() {
        assert!(State::Success.is_completed());
        assert!(State::Error.is_completed());
        assert!(State::Cancelled.is_completed());
        for state in State::INCOMPLETE {
            assert!(state.is_incomplete(), "{} should be incomplete", state);
        }
    }

    #[test]
    fn test_state_round_trip() {
        assert_eq!("RUNNING".parse::<State>().unwrap(), State::Running);
        assert_eq!(State::Delayed.to_string(), "DELAYED");
        assert_eq!(serde_json::to_value(State::Waiting).unwrap(), "WAITING");
        assert!("FINISHED".parse::<State>().is_err());
    }

    #[test]
    fn test_state_try_from_string() {
        assert_eq!(State::try_from("ERROR".to_string()).unwrap(), State::Error);
        assert!(matches!(State::try_from("LOST".to_string()), Err(AppError::Parse(_))));
    }

    #[test]
    fn test_workflow_transitions() {
        assert!(State::Idle.workflow_transition_allowed(State::Running));
        assert!(State::Running.workflow_transition_allowed(State::Paused));
        assert!(State::Paused.workflow_transition_allowed(State::Running));
        assert!(State::Paused.workflow_transition_allowed(State::Cancelled));
        assert!(!State::Success.workflow_transition_allowed(State::Running));
        assert!(!State::Idle.workflow_transition_allowed(State::Paused));
    }

    #[test]
    fn test_transition_event_serialization() {
        let pair = ("b".to_string(), TransitionEvent::OnComplete);
        assert_eq!(
            serde_json::to_value(&pair).unwrap(),
            serde_json::json!(["b", "on-complete"])
        );
    }
}
