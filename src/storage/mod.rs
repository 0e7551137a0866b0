//! The data-store capability the engine runs against.
//!
//! The engine only needs to open a scope and commit or roll it back; it never
//! sees a query dialect. Steps that know their concrete store get at the
//! store-specific API through the associated `Scope` type. [`RecordScope`] is
//! the record-level API used by the key-value state store and the default
//! batch sink.

pub mod memory;
pub mod table;

pub use memory::{InMemoryStore, MemoryScope};
pub use table::{Table, VersionedRecord};

use crate::core::{Record, Result};
use crate::transaction::ScopeId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What a backing store can tolerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCapabilities {
    /// Several scopes may write at once without lock contention.
    /// Single-file embedded engines report `false`.
    pub concurrent_writers: bool,
}

impl Default for StoreCapabilities {
    fn default() -> Self {
        Self {
            concurrent_writers: true,
        }
    }
}

/// A store that can open transactional scopes.
#[async_trait]
pub trait DataStore: Send + Sync + 'static {
    type Scope: StoreScope;

    fn capabilities(&self) -> StoreCapabilities;

    /// Opens a fresh scope. Scopes never inherit another scope's transaction.
    async fn begin(&self) -> Result<Self::Scope>;
}

/// One transactional unit of work. Dropping an uncommitted scope discards it.
#[async_trait]
pub trait StoreScope: Send + 'static {
    fn id(&self) -> ScopeId;

    async fn commit(self) -> Result<()>;

    async fn rollback(self) -> Result<()>;
}

/// Record-level access inside a scope.
#[async_trait]
pub trait RecordScope: StoreScope {
    async fn table_exists(&mut self, table: &str) -> Result<bool>;

    /// Returns `true` when the table was created by this call.
    async fn create_table_if_not_exists(&mut self, table: &str) -> Result<bool>;

    /// Returns `true` when a table was dropped.
    async fn drop_table_if_exists(&mut self, table: &str) -> Result<bool>;

    async fn get(&mut self, table: &str, key: &str) -> Result<Option<Record>>;

    async fn scan(&mut self, table: &str) -> Result<Vec<Record>>;

    async fn insert(&mut self, table: &str, record: Record) -> Result<()>;

    async fn upsert(&mut self, table: &str, record: Record) -> Result<()>;

    /// Overwrites existing records only; returns the number of rows affected.
    async fn update_many(&mut self, table: &str, records: &[Record]) -> Result<usize>;

    async fn delete(&mut self, table: &str, key: &str) -> Result<bool>;
}
