use crate::core::{MigrationError, Result, State};
use crate::step::{MigrationContext, MigrationStep, PostMigrationFn, StepDescriptor, StepFactory};
use crate::storage::DataStore;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// `from --step--> to`, owned by its plan.
pub struct Transition<S: DataStore> {
    pub from: State,
    pub to: State,
    pub descriptor: StepDescriptor,
    factory: StepFactory<S>,
}

impl<S: DataStore> Transition<S> {
    pub fn new(
        from: State,
        to: State,
        descriptor: StepDescriptor,
        factory: StepFactory<S>,
    ) -> Self {
        Self {
            from,
            to,
            descriptor,
            factory,
        }
    }

    pub fn step_name(&self) -> &str {
        &self.descriptor.name
    }

    /// Builds a fresh step instance for this run.
    pub fn build_step(&self, ctx: &MigrationContext<S>) -> Box<dyn MigrationStep<S>> {
        (self.factory)(ctx)
    }

    /// Same step, re-targeted between other states.
    pub(crate) fn retarget(&self, from: State, to: State) -> Self {
        Self {
            from,
            to,
            descriptor: self.descriptor.clone(),
            factory: self.factory.clone(),
        }
    }
}

impl<S: DataStore> fmt::Debug for Transition<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("step", &self.descriptor.name)
            .finish()
    }
}

/// Named hook run once after a plan run that advanced the state.
pub struct PostMigration<S: DataStore> {
    pub name: String,
    pub(crate) run: PostMigrationFn<S>,
}

impl<S: DataStore> fmt::Debug for PostMigration<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostMigration")
            .field("name", &self.name)
            .finish()
    }
}

/// A validated, immutable migration plan.
pub struct PlanGraph<S: DataStore> {
    pub(crate) name: String,
    pub(crate) initial_state: State,
    pub(crate) ignore_current_state: bool,
    pub(crate) final_state: State,
    pub(crate) transitions: HashMap<State, Transition<S>>,
    pub(crate) post_migrations: Vec<PostMigration<S>>,
}

impl<S: DataStore> PlanGraph<S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// State assumed when nothing has been recorded for this plan.
    pub fn initial_state(&self) -> &State {
        &self.initial_state
    }

    /// Whether runs always start at the initial state, whatever is stored.
    pub fn ignore_current_state(&self) -> bool {
        self.ignore_current_state
    }

    /// The terminal every chain of this plan ends at.
    pub fn final_state(&self) -> &State {
        &self.final_state
    }

    pub fn transition_from(&self, state: &State) -> Option<&Transition<S>> {
        self.transitions.get(state)
    }

    pub fn contains_state(&self, state: &State) -> bool {
        state == &self.initial_state
            || state == &self.final_state
            || self.transitions.contains_key(state)
    }

    /// Every state the plan knows, sorted.
    pub fn known_states(&self) -> Vec<State> {
        let mut states = BTreeSet::new();
        states.insert(self.initial_state.clone());
        for transition in self.transitions.values() {
            states.insert(transition.from.clone());
            states.insert(transition.to.clone());
        }
        states.into_iter().collect()
    }

    pub fn transition_count(&self) -> usize {
        self.transitions.len()
    }

    pub fn post_migrations(&self) -> &[PostMigration<S>] {
        &self.post_migrations
    }

    /// Transitions that would run starting at `state`, in order.
    pub fn path_from(&self, state: &State) -> Result<Vec<&Transition<S>>> {
        if !self.contains_state(state) {
            return Err(MigrationError::UnknownState {
                plan: self.name.clone(),
                state: state.to_string(),
            });
        }

        let mut path = Vec::new();
        let mut cursor = state;
        while let Some(transition) = self.transitions.get(cursor) {
            path.push(transition);
            cursor = &transition.to;
        }
        Ok(path)
    }
}

impl<S: DataStore> fmt::Debug for PlanGraph<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlanGraph")
            .field("name", &self.name)
            .field("initial_state", &self.initial_state)
            .field("final_state", &self.final_state)
            .field("ignore_current_state", &self.ignore_current_state)
            .field("transitions", &self.transitions.len())
            .field("post_migrations", &self.post_migrations)
            .finish()
    }
}
