//! Load, transform, write back: the batch data-rewrite pattern.
//!
//! Candidates are loaded by the caller, transformed one by one (on a bounded
//! worker pool when the store tolerates concurrent writers), and the changed
//! ones are written back in fixed-size chunks inside the caller's scope.

pub mod transformer;

pub use transformer::BatchTransformer;

use crate::core::{Record, Result};
use crate::storage::{DataStore, RecordScope};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

/// Result of transforming one candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformOutcome<T> {
    Changed(T),
    Unchanged,
}

impl<T> TransformOutcome<T> {
    pub fn is_changed(&self) -> bool {
        matches!(self, Self::Changed(_))
    }
}

/// Per-candidate transformation.
///
/// Receives a scope to read related data: a freshly opened one per record in
/// parallel mode, the caller's scope in sequential mode.
#[async_trait]
pub trait RecordTransform<S: DataStore, T>: Send + Sync {
    async fn transform(&self, item: T, scope: &mut S::Scope) -> Result<TransformOutcome<T>>;
}

/// Adapter for transforms that need no store access.
pub struct FnTransform<F, T> {
    f: F,
    _item: PhantomData<fn(T) -> T>,
}

/// Wraps a plain closure as a [`RecordTransform`].
pub fn transform_fn<T, F>(f: F) -> FnTransform<F, T>
where
    F: Fn(T) -> Result<TransformOutcome<T>> + Send + Sync,
{
    FnTransform {
        f,
        _item: PhantomData,
    }
}

#[async_trait]
impl<S, T, F> RecordTransform<S, T> for FnTransform<F, T>
where
    S: DataStore,
    T: Send + 'static,
    F: Fn(T) -> Result<TransformOutcome<T>> + Send + Sync,
{
    async fn transform(&self, item: T, _scope: &mut S::Scope) -> Result<TransformOutcome<T>> {
        (self.f)(item)
    }
}

/// Writes a chunk of changed items; returns the number of rows affected.
#[async_trait]
pub trait BatchSink<S: DataStore, T>: Send + Sync {
    async fn apply_batch(&self, scope: &mut S::Scope, chunk: &[T]) -> Result<usize>;
}

/// Sink that overwrites existing records of one table.
#[derive(Debug, Clone)]
pub struct RecordUpdateSink {
    table: String,
}

impl RecordUpdateSink {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }
}

#[async_trait]
impl<S> BatchSink<S, Record> for RecordUpdateSink
where
    S: DataStore,
    S::Scope: RecordScope,
{
    async fn apply_batch(&self, scope: &mut S::Scope, chunk: &[Record]) -> Result<usize> {
        scope.update_many(&self.table, chunk).await
    }
}

/// How the transform phase ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchMode {
    Parallel,
    Sequential,
}

/// A candidate whose transform failed and was left out of the apply set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    /// Position in the candidate list.
    pub index: usize,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub candidates: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub failed: usize,
    /// Rows written back by the sink.
    pub applied: usize,
    pub apply_calls: usize,
    pub mode: BatchMode,
    pub failures: Vec<BatchFailure>,
}
