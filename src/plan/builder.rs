use super::graph::{PlanGraph, PostMigration, Transition};
use super::merge::MergeGroup;
use crate::core::{MigrationError, Result, State};
use crate::step::{MigrationContext, MigrationStep, StepDescriptor, StepFactory, step_factory};
use crate::storage::DataStore;
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Fluent, ordered declaration of a plan.
///
/// Declaration errors are kept until [`build`](Self::build), which reports the
/// first one.
///
/// ```
/// # use rustmigrator::plan::PlanBuilder;
/// # use rustmigrator::storage::InMemoryStore;
/// # use rustmigrator::step::{MigrationContext, MigrationStep};
/// # use rustmigrator::storage::MemoryScope;
/// # struct Noop;
/// # #[async_trait::async_trait]
/// # impl MigrationStep<InMemoryStore> for Noop {
/// #     async fn migrate(&self, _: &mut MigrationContext<InMemoryStore>, _: &mut MemoryScope)
/// #         -> rustmigrator::Result<()> { Ok(()) }
/// # }
/// let plan = PlanBuilder::<InMemoryStore>::new("core")
///     .from("s0")
///     .to("Step1", |_| Noop, "s1")
///     .merge()
///         .to("StepA", |_| Noop, "sa")
///     .with()
///         .to("StepB", |_| Noop, "sb")
///     .as_state("joined")
///     .to("Step2", |_| Noop, "s2")
///     .build()
///     .unwrap();
///
/// assert_eq!(plan.final_state().as_str(), "s2");
/// assert_eq!(plan.path_from(&"s0".into()).unwrap().len(), 4);
/// ```
pub struct PlanBuilder<S: DataStore> {
    name: String,
    initial_state: Option<State>,
    ignore_current_state: bool,
    cursor: Option<State>,
    transitions: Vec<Transition<S>>,
    merge: Option<MergeGroup<S>>,
    post_migrations: Vec<PostMigration<S>>,
    error: Option<MigrationError>,
}

impl<S: DataStore> PlanBuilder<S> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            initial_state: None,
            ignore_current_state: false,
            cursor: None,
            transitions: Vec::new(),
            merge: None,
            post_migrations: Vec::new(),
            error: None,
        }
    }

    /// State assumed when nothing is recorded. Defaults to the first `from`.
    pub fn initial_state(mut self, state: impl Into<State>) -> Self {
        self.initial_state = Some(state.into());
        self
    }

    /// Always start at the initial state (pre-migration plans).
    pub fn ignore_current_state(mut self, ignore: bool) -> Self {
        self.ignore_current_state = ignore;
        self
    }

    /// Moves the cursor to `state`.
    pub fn from(mut self, state: impl Into<State>) -> Self {
        let state = state.into();
        if self.merge.is_some() {
            return self.fail("from() is not allowed inside a merge".to_string());
        }
        if state.is_empty() && !self.transitions.is_empty() {
            return self.fail("the empty state can only start a plan".to_string());
        }
        if self.initial_state.is_none() {
            self.initial_state = Some(state.clone());
        }
        self.cursor = Some(state);
        self
    }

    /// Declares `cursor --step--> next` and advances the cursor.
    pub fn to<F, M>(self, step: impl Into<StepDescriptor>, build: F, next: impl Into<State>) -> Self
    where
        F: Fn(&MigrationContext<S>) -> M + Send + Sync + 'static,
        M: MigrationStep<S> + 'static,
    {
        self.to_factory(step, step_factory(build), next)
    }

    /// [`to`](Self::to) with a prebuilt factory.
    pub fn to_factory(
        mut self,
        step: impl Into<StepDescriptor>,
        factory: StepFactory<S>,
        next: impl Into<State>,
    ) -> Self {
        let descriptor = step.into();
        let next = next.into();

        let Some(from) = self.cursor.clone() else {
            return self.fail(format!(
                "step '{}' declared before any from()",
                descriptor.name
            ));
        };
        if next.is_empty() {
            return self.fail(format!(
                "step '{}' targets the empty state",
                descriptor.name
            ));
        }
        if next == from {
            return self.fail(format!(
                "step '{}' transitions '{}' to itself",
                descriptor.name, from
            ));
        }

        let transition = Transition::new(from, next.clone(), descriptor, factory);
        match self.merge.as_mut() {
            Some(group) => group.current_branch().push(transition),
            None => self.transitions.push(transition),
        }
        self.cursor = Some(next);
        self
    }

    /// Opens a merge group at the cursor; the first branch starts here.
    pub fn merge(mut self) -> Self {
        if self.merge.is_some() {
            return self.fail("merge groups cannot be nested".to_string());
        }
        let Some(origin) = self.cursor.clone() else {
            return self.fail("merge() declared before any from()".to_string());
        };
        self.merge = Some(MergeGroup::new(origin));
        self
    }

    /// Starts another branch from the merge origin.
    pub fn with(mut self) -> Self {
        let Some(group) = self.merge.as_mut() else {
            return self.fail("with() outside of a merge".to_string());
        };
        if group.current_branch().is_empty() {
            let message = format!(
                "merge at '{}' has an empty branch #{}",
                group.origin,
                group.branches.len()
            );
            return self.fail(message);
        }
        group.branches.push(Vec::new());
        self.cursor = Some(group.origin.clone());
        self
    }

    /// Closes the merge group; all branches converge on `joined`.
    pub fn as_state(mut self, joined: impl Into<State>) -> Self {
        let joined = joined.into();
        let Some(group) = self.merge.take() else {
            return self.fail("as_state() outside of a merge".to_string());
        };
        if joined.is_empty() {
            return self.fail("merge joined state cannot be empty".to_string());
        }
        match group.close(&joined) {
            Ok(expanded) => {
                self.transitions.extend(expanded);
                self.cursor = Some(joined);
                self
            }
            Err(err) => self.fail_with(err),
        }
    }

    /// Registers a hook run once after a run that advanced the plan state.
    pub fn post_migration<F>(mut self, name: impl Into<String>, run: F) -> Self
    where
        F: for<'a> Fn(&'a mut MigrationContext<S>, &'a mut S::Scope) -> BoxFuture<'a, Result<()>>
            + Send
            + Sync
            + 'static,
    {
        self.post_migrations.push(PostMigration {
            name: name.into(),
            run: Arc::new(run),
        });
        self
    }

    /// Validates the declarations and freezes them into a [`PlanGraph`].
    pub fn build(self) -> Result<PlanGraph<S>> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if let Some(group) = &self.merge {
            return Err(MigrationError::Configuration(format!(
                "plan '{}': merge at '{}' was never closed with as_state()",
                self.name, group.origin
            )));
        }
        if self.transitions.is_empty() {
            return Err(MigrationError::Configuration(format!(
                "plan '{}' declares no transitions",
                self.name
            )));
        }

        let mut names = HashSet::new();
        for hook in &self.post_migrations {
            if !names.insert(hook.name.as_str()) {
                return Err(MigrationError::Configuration(format!(
                    "plan '{}': duplicate post-migration '{}'",
                    self.name, hook.name
                )));
            }
        }

        let mut by_from: HashMap<State, Transition<S>> = HashMap::new();
        for transition in self.transitions {
            if let Some(existing) = by_from.get(&transition.from) {
                return Err(MigrationError::Configuration(format!(
                    "plan '{}': state '{}' already transitions to '{}' via '{}'; \
                     '{}' to '{}' would make the next state ambiguous",
                    self.name,
                    transition.from,
                    existing.to,
                    existing.descriptor.name,
                    transition.descriptor.name,
                    transition.to
                )));
            }
            by_from.insert(transition.from.clone(), transition);
        }

        let final_state = resolve_final_state(&self.name, &by_from)?;
        let initial_state = self.initial_state.unwrap_or_else(State::empty);
        if initial_state != final_state && !by_from.contains_key(&initial_state) {
            return Err(MigrationError::Configuration(format!(
                "plan '{}': initial state '{}' is not part of the plan",
                self.name, initial_state
            )));
        }

        Ok(PlanGraph {
            name: self.name,
            initial_state,
            ignore_current_state: self.ignore_current_state,
            final_state,
            transitions: by_from,
            post_migrations: self.post_migrations,
        })
    }

    fn fail(self, message: String) -> Self {
        let message = format!("plan '{}': {}", self.name, message);
        self.fail_with(MigrationError::Configuration(message))
    }

    fn fail_with(mut self, err: MigrationError) -> Self {
        if self.error.is_none() {
            self.error = Some(err);
        }
        self
    }
}

/// Walks every chain to its terminal, rejecting cycles and requiring one
/// common terminal.
fn resolve_final_state<S: DataStore>(
    plan: &str,
    by_from: &HashMap<State, Transition<S>>,
) -> Result<State> {
    let mut terminal_of: HashMap<&State, State> = HashMap::new();
    let mut starts: Vec<&State> = by_from.keys().collect();
    starts.sort();

    for start in starts {
        let mut walked: Vec<&State> = Vec::new();
        let mut on_path: HashSet<&State> = HashSet::new();
        let mut cursor = start;

        let terminal = loop {
            if let Some(terminal) = terminal_of.get(cursor) {
                break terminal.clone();
            }
            if !on_path.insert(cursor) {
                return Err(MigrationError::Configuration(format!(
                    "plan '{}': cycle through state '{}'",
                    plan, cursor
                )));
            }
            walked.push(cursor);
            match by_from.get(cursor) {
                Some(transition) => cursor = &transition.to,
                None => break cursor.clone(),
            }
        };

        for state in walked {
            terminal_of.insert(state, terminal.clone());
        }
    }

    let terminals: HashSet<&State> = terminal_of.values().collect();
    let mut terminals: Vec<&State> = terminals.into_iter().collect();
    terminals.sort();
    match terminals.as_slice() {
        [single] => Ok((*single).clone()),
        _ => Err(MigrationError::Configuration(format!(
            "plan '{}': chains end at different states ({}); expected one final state",
            plan,
            terminals
                .iter()
                .map(|state| state.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}
