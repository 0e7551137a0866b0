//! Everything a host needs to declare and run plans.
//!
//! Store internals (tables, change logs) stay under their modules.

pub use crate::batch::{
    BatchMode, BatchReport, BatchSink, BatchTransformer, RecordTransform, RecordUpdateSink,
    TransformOutcome, transform_fn,
};
pub use crate::config::{BatchConfig, MigrationConfig};
pub use crate::core::{MigrationError, Record, Result, State, Value};
pub use crate::executor::{ExecutedPlanResult, StopSignal, UpgradeStatus, Upgrader};
pub use crate::plan::{PlanBuilder, PlanGraph};
pub use crate::state::{FileStateStore, KeyValueStateStore, MemoryStateStore, StateStore};
pub use crate::step::{MigrationContext, MigrationStep, StepDescriptor};
pub use crate::storage::{
    DataStore, InMemoryStore, MemoryScope, RecordScope, StoreCapabilities, StoreScope,
};
