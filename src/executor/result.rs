use crate::core::State;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One transition taken during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedTransition {
    pub step: String,
    pub from: State,
    pub to: State,
    /// The step reported it had nothing to do; the state advanced anyway.
    pub skipped: bool,
}

/// Outcome of a successful [`Upgrader::execute`](super::Upgrader::execute).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutedPlanResult {
    pub plan: String,
    pub initial_state: State,
    pub final_state: State,
    pub completed_transitions: Vec<CompletedTransition>,
    pub skipped_steps: Vec<String>,
    pub post_migrations: Vec<String>,
    pub rebuild_cache_requested: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutedPlanResult {
    /// Steps whose `migrate` actually ran.
    pub fn executed_steps(&self) -> Vec<&str> {
        self.completed_transitions
            .iter()
            .filter(|transition| !transition.skipped)
            .map(|transition| transition.step.as_str())
            .collect()
    }

    /// `true` when the run found the plan already at its final state.
    pub fn is_noop(&self) -> bool {
        self.completed_transitions.is_empty()
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// Where a plan stands compared to what the running code expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeStatus {
    pub plan: String,
    /// Raw stored value, `None` when nothing was recorded yet.
    pub stored: Option<State>,
    pub current: State,
    pub final_state: State,
    pub needs_upgrade: bool,
    pub pending_steps: Vec<String>,
}
