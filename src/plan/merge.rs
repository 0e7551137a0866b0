use super::graph::Transition;
use crate::core::{MigrationError, Result, State};
use crate::storage::DataStore;
use std::collections::HashSet;
use uuid::Uuid;

/// An open `merge()` group: alternative branches from one origin.
pub(crate) struct MergeGroup<S: DataStore> {
    pub origin: State,
    pub branches: Vec<Vec<Transition<S>>>,
}

impl<S: DataStore> MergeGroup<S> {
    pub fn new(origin: State) -> Self {
        Self {
            origin,
            branches: vec![Vec::new()],
        }
    }

    pub fn current_branch(&mut self) -> &mut Vec<Transition<S>> {
        if self.branches.is_empty() {
            self.branches.push(Vec::new());
        }
        let last = self.branches.len() - 1;
        &mut self.branches[last]
    }

    /// Closes the group at `joined` and returns the expanded transitions.
    ///
    /// Branch 1 keeps its transitions from the origin. Every other branch
    /// keeps its internal transitions only. A branch that already ends at
    /// `joined` has converged; from every other branch tail the steps of all
    /// other branches are replayed in declaration order, ending at `joined`,
    /// so every state keeps a single outgoing transition.
    pub fn close(self, joined: &State) -> Result<Vec<Transition<S>>> {
        if self.branches.len() < 2 {
            return Err(MigrationError::Configuration(format!(
                "merge at '{}' needs at least two branches",
                self.origin
            )));
        }
        if let Some(index) = self.branches.iter().position(Vec::is_empty) {
            return Err(MigrationError::Configuration(format!(
                "merge at '{}' has an empty branch #{}",
                self.origin,
                index + 1
            )));
        }

        // A branch may end at `joined` itself; no other branch state may.
        let mut branch_states = HashSet::new();
        branch_states.insert(self.origin.clone());
        for branch in &self.branches {
            let internal = &branch[..branch.len().saturating_sub(1)];
            branch_states.extend(internal.iter().map(|t| t.to.clone()));
        }
        if branch_states.contains(joined) {
            return Err(MigrationError::Configuration(format!(
                "merge joined state '{}' may only be the last state of a branch",
                joined
            )));
        }

        let mut expanded = Vec::new();
        for (index, branch) in self.branches.iter().enumerate() {
            let internal = if index == 0 { &branch[..] } else { &branch[1..] };
            expanded.extend(
                internal
                    .iter()
                    .map(|t| t.retarget(t.from.clone(), t.to.clone())),
            );
        }

        for (index, branch) in self.branches.iter().enumerate() {
            let Some(tail) = branch.last().map(|t| t.to.clone()) else {
                continue;
            };
            if &tail == joined {
                continue;
            }
            let replay: Vec<&Transition<S>> = self
                .branches
                .iter()
                .enumerate()
                .filter(|(other, _)| *other != index)
                .flat_map(|(_, steps)| steps.iter())
                .collect();

            let mut cursor = tail.clone();
            for (position, step) in replay.iter().enumerate() {
                let next = if position + 1 == replay.len() {
                    joined.clone()
                } else {
                    replay_state(joined, &tail, position + 1)
                };
                expanded.push(step.retarget(cursor, next.clone()));
                cursor = next;
            }
        }

        Ok(expanded)
    }
}

/// Stable identifier of an intermediate state on a replay path.
pub(crate) fn replay_state(joined: &State, tail: &State, position: usize) -> State {
    let name = format!("{}/{}/{}", joined.as_str(), tail.as_str(), position);
    State::from(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string())
}
