use crate::config::MigrationConfig;
use crate::core::Result;
use crate::storage::DataStore;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::Span;

/// Per-run context handed to every step and post-migration.
///
/// Lives for one `execute` call. Steps can leave values in the post-migration
/// bag for hooks that run after the plan, and raise the cache-rebuild flag
/// when they rewrite data that derived caches are built from.
pub struct MigrationContext<S: DataStore> {
    store: Arc<S>,
    plan: String,
    config: MigrationConfig,
    span: Span,
    post_migration_state: HashMap<String, serde_json::Value>,
    rebuild_cache: bool,
}

impl<S: DataStore> MigrationContext<S> {
    pub fn new(store: Arc<S>, plan: impl Into<String>, config: MigrationConfig, span: Span) -> Self {
        Self {
            store,
            plan: plan.into(),
            config,
            span,
            post_migration_state: HashMap::new(),
            rebuild_cache: false,
        }
    }

    /// The data store the plan runs against.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn plan_name(&self) -> &str {
        &self.plan
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Span of the current run; steps may enter it from spawned work.
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn set_post_migration_value<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.post_migration_state.insert(key.to_string(), value);
        Ok(())
    }

    pub fn post_migration_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.post_migration_state.get(key)
    }

    /// Typed read of a post-migration value; `None` when the key is absent.
    pub fn post_migration_value_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.post_migration_state
            .get(key)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(Into::into)
    }

    pub fn post_migration_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.post_migration_state.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn request_cache_rebuild(&mut self) {
        self.rebuild_cache = true;
    }

    pub fn rebuild_cache_requested(&self) -> bool {
        self.rebuild_cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;

    fn context() -> MigrationContext<InMemoryStore> {
        MigrationContext::new(
            Arc::new(InMemoryStore::new()),
            "core",
            MigrationConfig::default(),
            Span::none(),
        )
    }

    #[test]
    fn test_post_migration_bag() {
        let mut ctx = context();
        ctx.set_post_migration_value("migrated_types", &vec!["grid", "rte"])
            .unwrap();
        ctx.set_post_migration_value("count", &2u32).unwrap();

        let types: Option<Vec<String>> = ctx.post_migration_value_as("migrated_types").unwrap();
        assert_eq!(types, Some(vec!["grid".to_string(), "rte".to_string()]));
        assert_eq!(ctx.post_migration_value_as::<u32>("missing").unwrap(), None);
        assert!(ctx.post_migration_value_as::<String>("count").is_err());
        assert_eq!(ctx.post_migration_keys(), vec!["count", "migrated_types"]);
    }

    #[test]
    fn test_cache_rebuild_flag() {
        let mut ctx = context();
        assert!(!ctx.rebuild_cache_requested());
        ctx.request_cache_rebuild();
        assert!(ctx.rebuild_cache_requested());
        assert_eq!(ctx.plan_name(), "core");
    }
}
