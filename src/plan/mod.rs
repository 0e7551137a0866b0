//! Declarative migration plans.
//!
//! A plan is a graph of states joined by transitions, declared in order with
//! [`PlanBuilder`] and validated once into an immutable [`PlanGraph`]. Every
//! state has at most one outgoing transition, so the path from any known
//! state to the final state is fixed.

pub mod builder;
pub mod graph;
mod merge;

pub use crate::core::State;
pub use builder::PlanBuilder;
pub use graph::{PlanGraph, PostMigration, Transition};
