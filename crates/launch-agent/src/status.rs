//! Canonical run state shared by every backend.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a submitted run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Unknown,
    Starting,
    Running,
    Stopping,
    Finished,
    Failed,
    Preempted,
}

impl State {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Preempted => "preempted",
        }
    }

    /// Finished, failed and preempted end a run from the agent's point of view.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Preempted)
    }

    /// Position along the starting → running → stopping path.
    const fn progress(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Starting => 1,
            Self::Running => 2,
            Self::Stopping => 3,
            Self::Finished | Self::Failed | Self::Preempted => 4,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable snapshot of a run's state plus any user-facing messages
/// (scheduling warnings and the like) collected along the way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub state: State,
    #[serde(default)]
    pub messages: Vec<String>,
}

impl Status {
    #[must_use]
    pub const fn new(state: State) -> Self {
        Self {
            state,
            messages: Vec::new(),
        }
    }

    #[must_use]
    pub const fn unknown() -> Self {
        Self::new(State::Unknown)
    }

    /// Whether moving from the current state to `next` is allowed.
    ///
    /// `Unknown` never overwrites anything and `Finished` is final. `Failed`
    /// and `Preempted` may only resolve to `Finished`, so a Job failure that
    /// follows an eviction does not hide the preemption. Live states only
    /// move forward, while any of them may end in a terminal state.
    #[must_use]
    pub const fn accepts(&self, next: State) -> bool {
        match (self.state, next) {
            (_, State::Unknown) | (State::Finished, _) => false,
            (State::Failed | State::Preempted, next) => matches!(next, State::Finished),
            (current, next) => next.is_terminal() || next.progress() > current.progress(),
        }
    }

    /// Append a message unless the same text is already present.
    pub fn push_message(&mut self, message: impl Into<String>) -> bool {
        let message = message.into();
        if self.messages.contains(&message) {
            return false;
        }
        self.messages.push(message);
        true
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::unknown()
    }
}

impl From<State> for Status {
    fn from(state: State) -> Self {
        Self::new(state)
    }
}

/// Phase or condition type reported by a custom-resource job (Kubeflow,
/// Volcano, JobSet, ...), matched case-insensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrdPhase {
    Created,
    Pending,
    Running,
    Completing,
    Succeeded,
    Completed,
    Failed,
    Aborted,
    Timeout,
    Terminated,
    Terminating,
    Unrecognized,
}

impl CrdPhase {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "pending" => Self::Pending,
            "running" => Self::Running,
            "completing" => Self::Completing,
            "succeeded" => Self::Succeeded,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "aborted" => Self::Aborted,
            "timeout" => Self::Timeout,
            "terminated" => Self::Terminated,
            "terminating" => Self::Terminating,
            _ => Self::Unrecognized,
        }
    }

    /// Canonical state for this phase; `None` means "no transition".
    #[must_use]
    pub const fn state(self) -> Option<State> {
        match self {
            Self::Created | Self::Pending => Some(State::Starting),
            Self::Running | Self::Completing => Some(State::Running),
            Self::Succeeded | Self::Completed => Some(State::Finished),
            Self::Failed | Self::Aborted | Self::Timeout | Self::Terminated => Some(State::Failed),
            Self::Terminating => Some(State::Stopping),
            Self::Unrecognized => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_never_overwrites() {
        let status = Status::new(State::Running);
        assert!(!status.accepts(State::Unknown));
        assert!(Status::unknown().accepts(State::Starting));
    }

    #[test]
    fn completed_runs_ignore_preemption() {
        assert!(!Status::new(State::Finished).accepts(State::Preempted));
        assert!(!Status::new(State::Failed).accepts(State::Preempted));
        assert!(Status::new(State::Running).accepts(State::Preempted));
    }

    #[test]
    fn stopping_and_preempted_still_resolve() {
        let stopping = Status::new(State::Stopping);
        assert!(stopping.accepts(State::Finished));
        assert!(stopping.accepts(State::Failed));

        let preempted = Status::new(State::Preempted);
        assert!(preempted.accepts(State::Finished));
        assert!(!preempted.accepts(State::Failed));
        assert!(!preempted.accepts(State::Running));
    }

    #[test]
    fn live_states_only_move_forward() {
        assert!(Status::new(State::Starting).accepts(State::Running));
        assert!(Status::new(State::Running).accepts(State::Stopping));
        assert!(Status::new(State::Starting).accepts(State::Stopping));
        assert!(!Status::new(State::Running).accepts(State::Starting));
        assert!(!Status::new(State::Stopping).accepts(State::Running));
        assert!(!Status::new(State::Stopping).accepts(State::Starting));
        assert!(Status::new(State::Stopping).accepts(State::Preempted));
    }

    #[test]
    fn failed_can_only_become_finished() {
        let failed = Status::new(State::Failed);
        assert!(failed.accepts(State::Finished));
        assert!(!failed.accepts(State::Running));
        assert!(!Status::new(State::Finished).accepts(State::Failed));
    }

    #[test]
    fn messages_are_deduplicated() {
        let mut status = Status::new(State::Starting);
        assert!(status.push_message("0/3 nodes are available"));
        assert!(!status.push_message("0/3 nodes are available"));
        assert_eq!(status.messages.len(), 1);
    }

    #[test]
    fn crd_phases_map_case_insensitively() {
        assert_eq!(CrdPhase::parse("Pending").state(), Some(State::Starting));
        assert_eq!(CrdPhase::parse("COMPLETING").state(), Some(State::Running));
        assert_eq!(CrdPhase::parse("Completed").state(), Some(State::Finished));
        assert_eq!(CrdPhase::parse("timeout").state(), Some(State::Failed));
        assert_eq!(CrdPhase::parse("Terminating").state(), Some(State::Stopping));
        assert_eq!(CrdPhase::parse("Restarting"), CrdPhase::Unrecognized);
        assert_eq!(CrdPhase::parse("Restarting").state(), None);
    }

    #[test]
    fn state_serializes_lowercase() {
        let json = serde_json::to_string(&State::Preempted).unwrap();
        assert_eq!(json, "\"preempted\"");
    }
}
