// ============================================================================
// RustMigrator Library
// ============================================================================

//! Versioned, forward-only schema and data migrations.
//!
//! A [`PlanGraph`] declares states and the steps between them; the
//! [`Upgrader`] reads where an installation stands from a [`StateStore`],
//! runs each remaining step in its own scope of a [`DataStore`], and records
//! how far it got. [`BatchTransformer`] covers the common "load, rewrite,
//! write back" data step.
//!
//! # Examples
//!
//! ```
//! use rustmigrator::prelude::*;
//! use std::sync::Arc;
//!
//! struct AddAuditTable;
//!
//! #[async_trait::async_trait]
//! impl MigrationStep<InMemoryStore> for AddAuditTable {
//!     async fn migrate(
//!         &self,
//!         _ctx: &mut MigrationContext<InMemoryStore>,
//!         scope: &mut MemoryScope,
//!     ) -> Result<()> {
//!         scope.create_table_if_not_exists("audit").await?;
//!         Ok(())
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let plan = PlanBuilder::<InMemoryStore>::new("core")
//!     .from("")
//!     .to("AddAuditTable", |_| AddAuditTable, "8a1f7c2e-audit")
//!     .build()?;
//!
//! let store = Arc::new(InMemoryStore::new());
//! let states = Arc::new(MemoryStateStore::new());
//! let result = Upgrader::new(plan, states, store.clone()).execute().await?;
//!
//! assert_eq!(result.final_state.as_str(), "8a1f7c2e-audit");
//! assert_eq!(store.table_names().await, vec!["audit".to_string()]);
//! # Ok::<(), MigrationError>(())
//! # }).unwrap();
//! ```

pub mod batch;
pub mod config;
pub mod core;
pub mod executor;
pub mod plan;
pub mod prelude;
pub mod state;
pub mod step;
pub mod storage;
pub mod transaction;

pub use batch::{
    BatchMode, BatchReport, BatchSink, BatchTransformer, RecordTransform, RecordUpdateSink,
    TransformOutcome, transform_fn,
};
pub use config::{BatchConfig, MigrationConfig};
pub use core::{MigrationError, Record, Result, State, Value};
pub use executor::{ExecutedPlanResult, StopSignal, UpgradeStatus, Upgrader};
pub use plan::{PlanBuilder, PlanGraph, Transition};
pub use state::{FileStateStore, KeyValueStateStore, MemoryStateStore, StateStore};
pub use step::{MigrationContext, MigrationStep, StepDescriptor, StepFactory, step_factory};
pub use storage::{DataStore, InMemoryStore, RecordScope, StoreCapabilities, StoreScope};

/// Crate version, as recorded in tool output.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
