//! The unit of migration work.
//!
//! A step runs entirely inside one scope opened by the executor. Steps are
//! registered as a factory plus a [`StepDescriptor`]; the factory builds a
//! fresh step for each run from the run's [`MigrationContext`].

pub mod context;

pub use context::MigrationContext;

use crate::core::Result;
use crate::storage::DataStore;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[async_trait]
pub trait MigrationStep<S: DataStore>: Send + Sync {
    /// Performs the step's work in `scope`. Must be safe to retry from the
    /// same starting state: the scope is discarded on any error.
    async fn migrate(&self, ctx: &mut MigrationContext<S>, scope: &mut S::Scope) -> Result<()>;

    /// Returning `false` skips `migrate`; the state still advances.
    async fn requires_execution(
        &self,
        _ctx: &MigrationContext<S>,
        _scope: &mut S::Scope,
    ) -> Result<bool> {
        Ok(true)
    }
}

/// Builds a step for one run.
pub type StepFactory<S> =
    Arc<dyn Fn(&MigrationContext<S>) -> Box<dyn MigrationStep<S>> + Send + Sync>;

/// Hook run after a plan run that advanced the state.
pub type PostMigrationFn<S> = Arc<
    dyn for<'a> Fn(
            &'a mut MigrationContext<S>,
            &'a mut <S as DataStore>::Scope,
        ) -> BoxFuture<'a, Result<()>>
        + Send
        + Sync,
>;

/// Wraps a closure as a [`StepFactory`].
pub fn step_factory<S, F, M>(build: F) -> StepFactory<S>
where
    S: DataStore,
    F: Fn(&MigrationContext<S>) -> M + Send + Sync + 'static,
    M: MigrationStep<S> + 'static,
{
    Arc::new(move |ctx: &MigrationContext<S>| {
        Box::new(build(ctx)) as Box<dyn MigrationStep<S>>
    })
}

/// Metadata of a step, shown in logs and results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub name: String,
    pub description: Option<String>,
    /// Display ordering hint among steps of one plan.
    pub order: Option<i32>,
}

impl StepDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            order: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = Some(order);
        self
    }
}

impl From<&str> for StepDescriptor {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for StepDescriptor {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for StepDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{} ({})", self.name, description),
            None => write!(f, "{}", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MigrationConfig;
    use crate::storage::{InMemoryStore, MemoryScope, RecordScope, StoreScope};
    use tracing::Span;

    struct CreateTable(&'static str);

    #[async_trait]
    impl MigrationStep<InMemoryStore> for CreateTable {
        async fn migrate(
            &self,
            _ctx: &mut MigrationContext<InMemoryStore>,
            scope: &mut MemoryScope,
        ) -> Result<()> {
            scope.create_table_if_not_exists(self.0).await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_factory_builds_runnable_step() {
        let store = Arc::new(InMemoryStore::new());
        let mut ctx = MigrationContext::new(
            store.clone(),
            "core",
            MigrationConfig::default(),
            Span::none(),
        );
        let factory: StepFactory<InMemoryStore> = step_factory(|_ctx| CreateTable("audit"));

        let step = factory(&ctx);
        let mut scope = store.begin().await.unwrap();
        assert!(step.requires_execution(&ctx, &mut scope).await.unwrap());
        step.migrate(&mut ctx, &mut scope).await.unwrap();
        scope.commit().await.unwrap();

        assert_eq!(store.table_names().await, vec!["audit".to_string()]);
    }

    #[test]
    fn test_descriptor_display() {
        let descriptor = StepDescriptor::new("AddAuditTable")
            .with_description("creates the audit table")
            .with_order(3);
        assert_eq!(descriptor.to_string(), "AddAuditTable (creates the audit table)");
        assert_eq!(StepDescriptor::from("Plain").to_string(), "Plain");
    }
}
