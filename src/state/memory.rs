use super::{StateStore, ensure_expected};
use crate::core::{Result, State};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

/// Process-local state store, for tests and throwaway installations.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: Mutex<HashMap<String, State>>,
    writes: AtomicU64,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with one plan state.
    pub fn with_state(plan: &str, state: impl Into<State>) -> Self {
        let mut store = Self::new();
        store
            .states
            .get_mut()
            .insert(plan.to_string(), state.into());
        store
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, plan: &str) -> Result<Option<State>> {
        Ok(self.states.lock().await.get(plan).cloned())
    }

    async fn set(&self, plan: &str, state: &State) -> Result<()> {
        self.states
            .lock()
            .await
            .insert(plan.to_string(), state.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_guarded(
        &self,
        plan: &str,
        expected: Option<&State>,
        state: &State,
    ) -> Result<()> {
        let mut states = self.states.lock().await;
        ensure_expected(plan, expected, states.get(plan))?;
        states.insert(plan.to_string(), state.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
