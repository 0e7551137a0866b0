use super::{StateStore, display_state, ensure_expected};
use crate::config::{DEFAULT_STATE_KEY_PREFIX, MigrationConfig};
use crate::core::{MigrationError, Record, Result, State};
use crate::storage::{DataStore, RecordScope, StoreScope};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{Level, event};

/// Table holding plan states alongside the data the plans migrate.
pub const KEY_VALUE_TABLE: &str = "key_value";

const VALUE_FIELD: &str = "value";
const UPDATED_FIELD: &str = "updated";

/// State store backed by a `key_value` table in the migrated data store.
///
/// Each plan is stored under `{prefix}{plan}`. Every call runs in its own
/// short scope, never inside a step's scope.
pub struct KeyValueStateStore<S: DataStore> {
    store: Arc<S>,
    key_prefix: String,
}

impl<S> KeyValueStateStore<S>
where
    S: DataStore,
    S::Scope: RecordScope,
{
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            key_prefix: DEFAULT_STATE_KEY_PREFIX.to_string(),
        }
    }

    /// Store keyed by the configured `state_key_prefix`.
    pub fn with_config(store: Arc<S>, config: &MigrationConfig) -> Self {
        Self::new(store).with_key_prefix(config.state_key_prefix.clone())
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Key under which the state of `plan` is stored.
    pub fn state_key(&self, plan: &str) -> String {
        format!("{}{}", self.key_prefix, plan)
    }

    async fn read(scope: &mut S::Scope, key: &str) -> Result<Option<State>> {
        if !scope.table_exists(KEY_VALUE_TABLE).await? {
            return Ok(None);
        }
        let record = scope.get(KEY_VALUE_TABLE, key).await?;
        Ok(record
            .as_ref()
            .and_then(|record| record.text(VALUE_FIELD))
            .map(State::from))
    }

    async fn write(scope: &mut S::Scope, key: &str, state: &State) -> Result<()> {
        scope.create_table_if_not_exists(KEY_VALUE_TABLE).await?;
        let record = Record::new(key)
            .with(VALUE_FIELD, state.as_str())
            .with(UPDATED_FIELD, Utc::now().to_rfc3339());
        scope.upsert(KEY_VALUE_TABLE, record).await
    }
}

#[async_trait]
impl<S> StateStore for KeyValueStateStore<S>
where
    S: DataStore,
    S::Scope: RecordScope,
{
    async fn get(&self, plan: &str) -> Result<Option<State>> {
        let mut scope = self.store.begin().await?;
        let state = Self::read(&mut scope, &self.state_key(plan)).await?;
        scope.rollback().await?;
        Ok(state)
    }

    async fn set(&self, plan: &str, state: &State) -> Result<()> {
        let mut scope = self.store.begin().await?;
        Self::write(&mut scope, &self.state_key(plan), state).await?;
        scope.commit().await?;
        event!(Level::DEBUG, plan = %plan, state = %state, "plan state stored");
        Ok(())
    }

    async fn set_guarded(
        &self,
        plan: &str,
        expected: Option<&State>,
        state: &State,
    ) -> Result<()> {
        let key = self.state_key(plan);
        let mut scope = self.store.begin().await?;
        let current = Self::read(&mut scope, &key).await?;
        ensure_expected(plan, expected, current.as_ref())?;
        Self::write(&mut scope, &key, state).await?;

        // A writer that slipped in between our read and commit shows up as a
        // write conflict on the state record.
        scope.commit().await.map_err(|err| match err {
            MigrationError::WriteConflict(_) => MigrationError::ConcurrentStateChange {
                plan: plan.to_string(),
                expected: display_state(expected),
                actual: "<changed during commit>".to_string(),
            },
            other => other,
        })?;
        event!(Level::DEBUG, plan = %plan, state = %state, "plan state stored (guarded)");
        Ok(())
    }
}
