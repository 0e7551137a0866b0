use super::result::{CompletedTransition, ExecutedPlanResult, UpgradeStatus};
use super::signal::StopSignal;
use crate::config::MigrationConfig;
use crate::core::{MigrationError, Result, State};
use crate::plan::{PlanGraph, Transition};
use crate::state::StateStore;
use crate::step::MigrationContext;
use crate::storage::{DataStore, StoreScope};
use chrono::Utc;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{Instrument, Level, Span, event, info_span};

/// Walks a plan from the stored state to its final state.
///
/// Transitions run strictly one after another, each in its own scope. The
/// stored state never runs ahead of what was committed: it is written at the
/// end of the run, after a failed step (up to the last committed step), on
/// cancellation, and after every step when `commit_each_step` is set.
pub struct Upgrader<S: DataStore> {
    plan: PlanGraph<S>,
    states: Arc<dyn StateStore>,
    store: Arc<S>,
    config: MigrationConfig,
    stop: StopSignal,
}

impl<S: DataStore> Upgrader<S> {
    pub fn new(plan: PlanGraph<S>, states: Arc<dyn StateStore>, store: Arc<S>) -> Self {
        Self {
            plan,
            states,
            store,
            config: MigrationConfig::default(),
            stop: StopSignal::new(),
        }
    }

    pub fn with_config(mut self, config: MigrationConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses an externally owned stop signal.
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn plan(&self) -> &PlanGraph<S> {
        &self.plan
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Compares the stored state with the plan's final state without running
    /// anything.
    pub async fn status(&self) -> Result<UpgradeStatus> {
        let stored = self.states.get(self.plan.name()).await?;
        let current = self.origin(stored.as_ref());
        let pending_steps = self
            .plan
            .path_from(&current)?
            .into_iter()
            .map(|transition| transition.step_name().to_string())
            .collect::<Vec<_>>();

        Ok(UpgradeStatus {
            plan: self.plan.name().to_string(),
            stored,
            needs_upgrade: &current != self.plan.final_state(),
            current,
            final_state: self.plan.final_state().clone(),
            pending_steps,
        })
    }

    /// Runs every transition between the current and the final state.
    pub async fn execute(&self) -> Result<ExecutedPlanResult> {
        self.config.validate()?;
        let span = info_span!("migration.plan.execute", plan = %self.plan.name());
        self.run().instrument(span).await
    }

    /// Where a run starts. An empty stored state counts as nothing stored.
    fn origin(&self, stored: Option<&State>) -> State {
        match stored {
            Some(state) if !state.is_empty() && !self.plan.ignore_current_state() => state.clone(),
            _ => self.plan.initial_state().clone(),
        }
    }

    async fn run(&self) -> Result<ExecutedPlanResult> {
        let started_at = Utc::now();
        let plan_name = self.plan.name();

        let stored = self.states.get(plan_name).await?;
        let origin = self.origin(stored.as_ref());
        if !self.plan.contains_state(&origin) {
            event!(Level::ERROR, state = %origin, "stored state is not part of the plan");
            return Err(MigrationError::UnknownState {
                plan: plan_name.to_string(),
                state: origin.to_string(),
            });
        }
        event!(
            Level::INFO,
            origin = %origin,
            final_state = %self.plan.final_state(),
            ignore_current_state = self.plan.ignore_current_state(),
            "plan state read"
        );

        let mut ctx = MigrationContext::new(
            self.store.clone(),
            plan_name,
            self.config.clone(),
            Span::current(),
        );
        let mut persisted = stored;
        let mut current = origin.clone();
        let mut completed = Vec::new();
        let mut skipped_steps = Vec::new();

        while let Some(transition) = self.plan.transition_from(&current) {
            if self.stop.is_stopped() {
                event!(Level::WARN, state = %current, "stop requested; ending run");
                if current != origin {
                    self.persist(&mut persisted, &current).await?;
                }
                return Err(MigrationError::Cancelled {
                    plan: plan_name.to_string(),
                    state: current.to_string(),
                });
            }

            let executed = match self.run_transition(&mut ctx, transition).await {
                Ok(executed) => executed,
                Err(err) => {
                    event!(
                        Level::ERROR,
                        step = %transition.step_name(),
                        from = %transition.from,
                        to = %transition.to,
                        error = %err,
                        "step failed; scope rolled back"
                    );
                    if current != origin {
                        if let Err(persist_err) = self.persist(&mut persisted, &current).await {
                            event!(
                                Level::ERROR,
                                state = %current,
                                error = %persist_err,
                                "failed to record last committed state"
                            );
                        }
                    }
                    return Err(MigrationError::StepExecution {
                        plan: plan_name.to_string(),
                        step: transition.step_name().to_string(),
                        from: transition.from.to_string(),
                        to: transition.to.to_string(),
                        source: Box::new(err),
                    });
                }
            };

            if !executed {
                skipped_steps.push(transition.step_name().to_string());
            }
            completed.push(CompletedTransition {
                step: transition.step_name().to_string(),
                from: transition.from.clone(),
                to: transition.to.clone(),
                skipped: !executed,
            });
            current = transition.to.clone();

            if self.config.commit_each_step {
                self.persist(&mut persisted, &current).await?;
            }
        }

        if current != origin {
            self.persist(&mut persisted, &current).await?;
        }

        let mut post_migrations = Vec::new();
        if !completed.is_empty() {
            post_migrations = self.run_post_migrations(&mut ctx).await?;
        }

        event!(
            Level::INFO,
            from = %origin,
            to = %current,
            transitions = completed.len(),
            skipped = skipped_steps.len(),
            "plan run complete"
        );

        Ok(ExecutedPlanResult {
            plan: plan_name.to_string(),
            initial_state: origin,
            final_state: current,
            completed_transitions: completed,
            skipped_steps,
            post_migrations,
            rebuild_cache_requested: ctx.rebuild_cache_requested(),
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Runs one transition in a fresh scope. Returns `false` when the step
    /// reported nothing to do.
    async fn run_transition(
        &self,
        ctx: &mut MigrationContext<S>,
        transition: &Transition<S>,
    ) -> Result<bool> {
        let span = info_span!(
            "migration.step",
            step = %transition.step_name(),
            from = %transition.from,
            to = %transition.to
        );

        async move {
            let step = transition.build_step(ctx);
            let mut scope = self.store.begin().await?;

            let required = match step.requires_execution(ctx, &mut scope).await {
                Ok(required) => required,
                Err(err) => {
                    discard(scope).await;
                    return Err(err);
                }
            };
            if !required {
                scope.commit().await?;
                event!(Level::INFO, "step not required; skipped");
                return Ok(false);
            }

            let outcome = match self.config.step_timeout_duration() {
                Some(limit) => timeout(limit, step.migrate(ctx, &mut scope))
                    .await
                    .unwrap_or_else(|_| {
                        Err(MigrationError::Timeout(
                            u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                        ))
                    }),
                None => step.migrate(ctx, &mut scope).await,
            };

            match outcome {
                Ok(()) => {
                    scope.commit().await?;
                    event!(Level::INFO, "step committed");
                    Ok(true)
                }
                Err(err) => {
                    discard(scope).await;
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_post_migrations(&self, ctx: &mut MigrationContext<S>) -> Result<Vec<String>> {
        let mut ran = Vec::new();
        for hook in self.plan.post_migrations() {
            let mut scope = self.store.begin().await?;
            if let Err(err) = (hook.run)(ctx, &mut scope).await {
                discard(scope).await;
                event!(Level::ERROR, hook = %hook.name, error = %err, "post-migration failed");
                return Err(MigrationError::PostMigration {
                    name: hook.name.clone(),
                    source: Box::new(err),
                });
            }
            scope.commit().await.map_err(|err| MigrationError::PostMigration {
                name: hook.name.clone(),
                source: Box::new(err),
            })?;
            event!(Level::INFO, hook = %hook.name, "post-migration complete");
            ran.push(hook.name.clone());
        }
        Ok(ran)
    }

    async fn persist(&self, persisted: &mut Option<State>, state: &State) -> Result<()> {
        if persisted.as_ref() == Some(state) {
            return Ok(());
        }
        self.states
            .set_guarded(self.plan.name(), persisted.as_ref(), state)
            .await?;
        event!(Level::INFO, state = %state, "plan state recorded");
        *persisted = Some(state.clone());
        Ok(())
    }
}

async fn discard<T: StoreScope>(scope: T) {
    let id = scope.id();
    if let Err(err) = scope.rollback().await {
        event!(Level::WARN, scope = %id, error = %err, "rollback failed");
    }
}
