//! Durable "last completed state" per named plan.
//!
//! Stores know nothing about graphs or steps. The guarded setter detects a
//! second writer racing the same plan; it is a tripwire, not a lock.

pub mod file;
pub mod key_value;
pub mod memory;

pub use file::{FileStateStore, StateEntry};
pub use key_value::{KEY_VALUE_TABLE, KeyValueStateStore};
pub use memory::MemoryStateStore;

use crate::core::{MigrationError, Result, State};
use async_trait::async_trait;

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Last recorded state of `plan`, `None` when nothing was ever recorded.
    async fn get(&self, plan: &str) -> Result<Option<State>>;

    async fn set(&self, plan: &str, state: &State) -> Result<()>;

    /// Sets `state` only if the stored value still equals `expected`
    /// (`None` meaning "nothing recorded").
    async fn set_guarded(&self, plan: &str, expected: Option<&State>, state: &State)
    -> Result<()>;
}

pub(crate) fn ensure_expected(
    plan: &str,
    expected: Option<&State>,
    actual: Option<&State>,
) -> Result<()> {
    if expected == actual {
        return Ok(());
    }
    Err(MigrationError::ConcurrentStateChange {
        plan: plan.to_string(),
        expected: display_state(expected),
        actual: display_state(actual),
    })
}

pub(crate) fn display_state(state: Option<&State>) -> String {
    state.map_or_else(|| "<none>".to_string(), State::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_expected() {
        let a = State::from("a");
        let b = State::from("b");

        assert!(ensure_expected("p", None, None).is_ok());
        assert!(ensure_expected("p", Some(&a), Some(&a)).is_ok());

        let err = ensure_expected("p", Some(&a), Some(&b)).unwrap_err();
        assert!(matches!(
            err,
            MigrationError::ConcurrentStateChange { ref expected, ref actual, .. }
                if expected == "a" && actual == "b"
        ));
        assert!(ensure_expected("p", None, Some(&b)).is_err());
    }
}
