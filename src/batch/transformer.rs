use super::{BatchFailure, BatchMode, BatchReport, BatchSink, RecordTransform, TransformOutcome};
use crate::config::BatchConfig;
use crate::core::{MigrationError, Result};
use crate::storage::{DataStore, StoreScope};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tracing::{Instrument, Level, Span, event};

type Outcome<T> = (usize, Result<TransformOutcome<T>>);

/// Runs a [`RecordTransform`] over candidates and writes the changed ones
/// back through a [`BatchSink`].
pub struct BatchTransformer<S: DataStore> {
    store: Arc<S>,
    config: BatchConfig,
}

impl<S: DataStore> BatchTransformer<S> {
    pub fn new(store: Arc<S>, config: BatchConfig) -> Self {
        Self { store, config }
    }

    /// Mode the next `transform` call will use.
    pub fn mode(&self) -> BatchMode {
        if self.config.force_sequential
            || self.config.max_workers <= 1
            || !self.store.capabilities().concurrent_writers
        {
            BatchMode::Sequential
        } else {
            BatchMode::Parallel
        }
    }

    /// Transforms every candidate, then applies the changed ones in chunks
    /// of `batch_size` inside `scope`.
    ///
    /// A failing candidate is logged and excluded; the rest continue. A sink
    /// reporting a row count different from its chunk length aborts with
    /// [`MigrationError::InvariantViolation`].
    pub async fn transform<T, R, K>(
        &self,
        scope: &mut S::Scope,
        candidates: Vec<T>,
        per_item: R,
        sink: &K,
    ) -> Result<BatchReport>
    where
        T: Send + Sync + 'static,
        R: RecordTransform<S, T> + 'static,
        K: BatchSink<S, T>,
    {
        self.config.validate()?;
        let mode = self.mode();
        let total = candidates.len();
        let per_item = Arc::new(per_item);

        let outcomes = match mode {
            BatchMode::Parallel => self.transform_parallel(candidates, per_item).await?,
            BatchMode::Sequential => {
                let mut outcomes = Vec::with_capacity(total);
                for (index, item) in candidates.into_iter().enumerate() {
                    outcomes.push((index, per_item.transform(item, scope).await));
                }
                outcomes
            }
        };

        let mut changed = Vec::new();
        let mut unchanged = 0;
        let mut failures = Vec::new();
        for (index, outcome) in outcomes {
            match outcome {
                Ok(TransformOutcome::Changed(item)) => changed.push(item),
                Ok(TransformOutcome::Unchanged) => unchanged += 1,
                Err(err) => {
                    event!(
                        Level::WARN,
                        index,
                        error = %err,
                        "record transform failed; record left unchanged"
                    );
                    failures.push(BatchFailure {
                        index,
                        error: err.to_string(),
                    });
                }
            }
        }

        let mut applied = 0;
        let mut apply_calls = 0;
        for chunk in changed.chunks(self.config.batch_size) {
            let affected = sink.apply_batch(scope, chunk).await?;
            apply_calls += 1;
            if affected != chunk.len() {
                return Err(MigrationError::InvariantViolation(format!(
                    "batch write #{} affected {} rows, expected {}",
                    apply_calls,
                    affected,
                    chunk.len()
                )));
            }
            applied += affected;
        }

        let report = BatchReport {
            candidates: total,
            changed: changed.len(),
            unchanged,
            failed: failures.len(),
            applied,
            apply_calls,
            mode,
            failures,
        };
        event!(
            Level::INFO,
            candidates = report.candidates,
            applied = report.applied,
            failed = report.failed,
            mode = ?report.mode,
            "batch transform complete"
        );
        Ok(report)
    }

    /// One fresh scope per candidate, at most `max_workers` at a time.
    /// Outcomes come back in candidate order.
    async fn transform_parallel<T, R>(
        &self,
        candidates: Vec<T>,
        per_item: Arc<R>,
    ) -> Result<Vec<Outcome<T>>>
    where
        T: Send + Sync + 'static,
        R: RecordTransform<S, T> + 'static,
    {
        let total = candidates.len();
        let workers = Arc::new(Semaphore::new(self.config.max_workers));
        let mut tasks = JoinSet::new();
        let mut index_of: HashMap<task::Id, usize> = HashMap::with_capacity(total);

        for (index, item) in candidates.into_iter().enumerate() {
            let permit = workers
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| MigrationError::LockError("batch worker pool closed".to_string()))?;
            let store = self.store.clone();
            let per_item = per_item.clone();

            let handle = tasks.spawn(
                async move {
                    let _permit = permit;
                    transform_in_own_scope(store, per_item, item).await
                }
                .instrument(Span::current()),
            );
            index_of.insert(handle.id(), index);
        }

        let mut outcomes = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next_with_id().await {
            let (id, outcome) = match joined {
                Ok((id, outcome)) => (id, outcome),
                Err(err) => (
                    err.id(),
                    Err(MigrationError::Execution(format!("batch worker panicked: {}", err))),
                ),
            };
            let Some(index) = index_of.remove(&id) else {
                return Err(MigrationError::InvariantViolation(format!(
                    "batch worker {} has no candidate",
                    id
                )));
            };
            outcomes.push((index, outcome));
        }
        outcomes.sort_by_key(|(index, _)| *index);
        Ok(outcomes)
    }
}

async fn transform_in_own_scope<S, T, R>(
    store: Arc<S>,
    per_item: Arc<R>,
    item: T,
) -> Result<TransformOutcome<T>>
where
    S: DataStore,
    T: Send + 'static,
    R: RecordTransform<S, T>,
{
    let mut scope = store.begin().await?;
    match per_item.transform(item, &mut scope).await {
        Ok(outcome) => {
            scope.commit().await?;
            Ok(outcome)
        }
        Err(err) => {
            let id = scope.id();
            if let Err(rollback_err) = scope.rollback().await {
                event!(Level::WARN, scope = %id, error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{RecordUpdateSink, transform_fn};
    use crate::core::Record;
    use crate::storage::{InMemoryStore, RecordScope};

    async fn seed(store: &InMemoryStore, count: usize) {
        let mut scope = store.begin().await.unwrap();
        scope.create_table_if_not_exists("nodes").await.unwrap();
        for i in 0..count {
            scope
                .insert("nodes", Record::new(format!("{:04}", i)).with("n", i as i64))
                .await
                .unwrap();
        }
        scope.commit().await.unwrap();
    }

    #[test]
    fn test_mode_selection() {
        let config = BatchConfig::default();
        let shared = BatchTransformer::new(Arc::new(InMemoryStore::new()), config.clone());
        let single = BatchTransformer::new(Arc::new(InMemoryStore::single_writer()), config.clone());
        let forced = BatchTransformer::new(
            Arc::new(InMemoryStore::new()),
            config.force_sequential(true),
        );

        assert_eq!(shared.mode(), BatchMode::Parallel);
        assert_eq!(single.mode(), BatchMode::Sequential);
        assert_eq!(forced.mode(), BatchMode::Sequential);
    }

    #[tokio::test]
    async fn test_zero_batch_size_is_rejected() {
        let store = Arc::new(InMemoryStore::new());
        seed(&store, 1).await;
        let transformer = BatchTransformer::new(store.clone(), BatchConfig::default().batch_size(0));
        let mut scope = store.begin().await.unwrap();
        let candidates = scope.scan("nodes").await.unwrap();

        let result = transformer
            .transform(
                &mut scope,
                candidates,
                transform_fn(|record: Record| Ok(TransformOutcome::Changed(record))),
                &RecordUpdateSink::new("nodes"),
            )
            .await;

        assert!(matches!(result, Err(MigrationError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_parallel_outcomes_keep_candidate_order() {
        let store = Arc::new(InMemoryStore::new());
        seed(&store, 40).await;
        let transformer = BatchTransformer::new(
            store.clone(),
            BatchConfig::default().batch_size(7).max_workers(8),
        );
        let mut scope = store.begin().await.unwrap();
        let candidates = scope.scan("nodes").await.unwrap();

        let report = transformer
            .transform(
                &mut scope,
                candidates,
                transform_fn(|record: Record| {
                    let n = record.get("n").and_then(|v| v.as_i64()).unwrap_or_default();
                    if n == 13 {
                        return Err(MigrationError::Execution("unlucky".to_string()));
                    }
                    Ok(TransformOutcome::Changed(record.with("n", n * 10)))
                }),
                &RecordUpdateSink::new("nodes"),
            )
            .await
            .unwrap();
        scope.commit().await.unwrap();

        assert_eq!(report.mode, BatchMode::Parallel);
        assert_eq!(report.applied, 39);
        assert_eq!(report.apply_calls, 6);
        assert_eq!(report.failures[0].index, 13);

        let records = store.committed_records("nodes").await.unwrap();
        assert_eq!(records[12].get("n").and_then(|v| v.as_i64()), Some(120));
        assert_eq!(records[13].get("n").and_then(|v| v.as_i64()), Some(13));
    }
}
