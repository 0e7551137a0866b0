//! Runs plans against a data store, one committed transition at a time.

pub mod result;
pub mod signal;
pub mod upgrader;

pub use result::{CompletedTransition, ExecutedPlanResult, UpgradeStatus};
pub use signal::StopSignal;
pub use upgrader::Upgrader;
