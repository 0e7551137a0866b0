/// Batch transformer tests
///
/// Transform/apply behaviour, chunking, failure isolation, the sequential
/// fallback on single-writer stores, and a full data-rewrite step.
/// Run with: cargo test --test batch_transformer_tests

use async_trait::async_trait;
use rustmigrator::prelude::*;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::assert_ok;

async fn seed_nodes(store: &InMemoryStore, count: usize) {
    let mut scope = store.begin().await.unwrap();
    scope.create_table_if_not_exists("nodes").await.unwrap();
    for i in 0..count {
        scope
            .insert(
                "nodes",
                Record::new(format!("{:05}", i)).with("title", format!("node {}", i)),
            )
            .await
            .unwrap();
    }
    scope.commit().await.unwrap();
}

/// Records the size of every chunk it is handed.
#[derive(Default)]
struct CountingSink {
    chunks: Mutex<Vec<usize>>,
}

impl CountingSink {
    fn chunk_sizes(&self) -> Vec<usize> {
        self.chunks.lock().unwrap().clone()
    }
}

#[async_trait]
impl BatchSink<InMemoryStore, Record> for CountingSink {
    async fn apply_batch(&self, scope: &mut MemoryScope, chunk: &[Record]) -> Result<usize> {
        self.chunks.lock().unwrap().push(chunk.len());
        scope.update_many("nodes", chunk).await
    }
}

fn uppercase_titles() -> impl RecordTransform<InMemoryStore, Record> {
    transform_fn(|mut record: Record| {
        let title = record.text("title").unwrap_or_default().to_uppercase();
        if record.set("title", title) {
            Ok(TransformOutcome::Changed(record))
        } else {
            Ok(TransformOutcome::Unchanged)
        }
    })
}

#[tokio::test]
async fn test_all_changed_are_applied() {
    let store = Arc::new(InMemoryStore::new());
    seed_nodes(&store, 30).await;
    let transformer = BatchTransformer::new(store.clone(), BatchConfig::default());

    let mut scope = store.begin().await.unwrap();
    let candidates = scope.scan("nodes").await.unwrap();
    let report = transformer
        .transform(
            &mut scope,
            candidates,
            uppercase_titles(),
            &RecordUpdateSink::new("nodes"),
        )
        .await
        .unwrap();
    scope.commit().await.unwrap();

    assert_eq!(report.candidates, 30);
    assert_eq!(report.changed, 30);
    assert_eq!(report.applied, 30);
    assert_eq!(report.apply_calls, 1);
    let record = store.committed_record("nodes", "00007").await.unwrap().unwrap();
    assert_eq!(record.text("title"), Some("NODE 7"));
}

#[tokio::test]
async fn test_all_unchanged_apply_nothing() {
    let store = Arc::new(InMemoryStore::new());
    seed_nodes(&store, 10).await;
    let transformer = BatchTransformer::new(store.clone(), BatchConfig::default());
    let sink = CountingSink::default();

    let mut scope = store.begin().await.unwrap();
    let candidates = scope.scan("nodes").await.unwrap();
    let report = transformer
        .transform(
            &mut scope,
            candidates,
            transform_fn(|_record: Record| Ok(TransformOutcome::Unchanged)),
            &sink,
        )
        .await
        .unwrap();

    assert_eq!(report.unchanged, 10);
    assert_eq!(report.applied, 0);
    assert_eq!(report.apply_calls, 0);
    assert!(sink.chunk_sizes().is_empty());
    assert_eq!(scope.pending_changes(), 0);
}

#[tokio::test]
async fn test_changed_records_are_written_in_chunks() {
    let store = Arc::new(InMemoryStore::new());
    seed_nodes(&store, 250).await;
    let transformer =
        BatchTransformer::new(store.clone(), BatchConfig::default().batch_size(100));
    let sink = CountingSink::default();

    let mut scope = store.begin().await.unwrap();
    let candidates = scope.scan("nodes").await.unwrap();
    let report = transformer
        .transform(&mut scope, candidates, uppercase_titles(), &sink)
        .await
        .unwrap();
    scope.commit().await.unwrap();

    assert_eq!(report.applied, 250);
    assert_eq!(report.apply_calls, 3);
    assert_eq!(sink.chunk_sizes(), vec![100, 100, 50]);
}

#[tokio::test]
async fn test_only_changed_rows_reach_the_sink() {
    let store = Arc::new(InMemoryStore::new());
    seed_nodes(&store, 3).await;
    let transformer = BatchTransformer::new(store.clone(), BatchConfig::default());
    let sink = CountingSink::default();

    let mut scope = store.begin().await.unwrap();
    let candidates = scope.scan("nodes").await.unwrap();
    let report = transformer
        .transform(
            &mut scope,
            candidates,
            transform_fn(|record: Record| {
                if record.key == "00001" {
                    return Ok(TransformOutcome::Unchanged);
                }
                Ok(TransformOutcome::Changed(record.with("migrated", true)))
            }),
            &sink,
        )
        .await
        .unwrap();
    scope.commit().await.unwrap();

    assert_eq!(report.applied, 2);
    assert_eq!(sink.chunk_sizes(), vec![2]);
    let untouched = store.committed_record("nodes", "00001").await.unwrap().unwrap();
    assert!(untouched.get("migrated").is_none());
}

#[tokio::test]
async fn test_failing_record_is_excluded() {
    let store = Arc::new(InMemoryStore::new());
    seed_nodes(&store, 5).await;
    let transformer = BatchTransformer::new(store.clone(), BatchConfig::default());

    let mut scope = store.begin().await.unwrap();
    let candidates = scope.scan("nodes").await.unwrap();
    let report = transformer
        .transform(
            &mut scope,
            candidates,
            transform_fn(|record: Record| {
                if record.key == "00002" {
                    return Err(MigrationError::Serialization("malformed config".to_string()));
                }
                Ok(TransformOutcome::Changed(record.with("migrated", true)))
            }),
            &RecordUpdateSink::new("nodes"),
        )
        .await
        .unwrap();
    scope.commit().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.applied, 4);
    assert_eq!(report.failures[0].index, 2);
    assert!(report.failures[0].error.contains("malformed config"));
    let failed = store.committed_record("nodes", "00002").await.unwrap().unwrap();
    assert!(failed.get("migrated").is_none());
}

#[tokio::test]
async fn test_panicking_record_does_not_abort_parallel_batch() {
    let store = Arc::new(InMemoryStore::new());
    seed_nodes(&store, 5).await;
    let transformer = BatchTransformer::new(store.clone(), BatchConfig::default());
    assert_eq!(transformer.mode(), BatchMode::Parallel);

    let mut scope = store.begin().await.unwrap();
    let candidates = scope.scan("nodes").await.unwrap();
    let report = transformer
        .transform(
            &mut scope,
            candidates,
            transform_fn(|record: Record| {
                if record.key == "00002" {
                    panic!("bad record");
                }
                Ok(TransformOutcome::Changed(record.with("migrated", true)))
            }),
            &RecordUpdateSink::new("nodes"),
        )
        .await
        .unwrap();
    scope.commit().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.applied, 4);
    assert_eq!(report.failures[0].index, 2);
    assert!(report.failures[0].error.contains("panicked"));
    let skipped = store.committed_record("nodes", "00002").await.unwrap().unwrap();
    assert!(skipped.get("migrated").is_none());
    let migrated = store.committed_record("nodes", "00003").await.unwrap().unwrap();
    assert!(migrated.get("migrated").is_some());
}

#[tokio::test]
async fn test_row_count_mismatch_is_an_invariant_violation() {
    let store = Arc::new(InMemoryStore::new());
    seed_nodes(&store, 2).await;
    let transformer = BatchTransformer::new(store.clone(), BatchConfig::default());

    let mut scope = store.begin().await.unwrap();
    let mut candidates = scope.scan("nodes").await.unwrap();
    // Deleted by someone else between load and write-back.
    candidates.push(Record::new("ghost").with("title", "ghost"));

    let result = transformer
        .transform(
            &mut scope,
            candidates,
            uppercase_titles(),
            &RecordUpdateSink::new("nodes"),
        )
        .await;

    assert!(matches!(result, Err(MigrationError::InvariantViolation(_))));
}

#[tokio::test]
async fn test_single_writer_store_falls_back_to_sequential() {
    let store = Arc::new(
        InMemoryStore::single_writer().with_lock_timeout(Duration::from_millis(50)),
    );
    seed_nodes(&store, 20).await;
    let transformer = BatchTransformer::new(store.clone(), BatchConfig::default().max_workers(8));
    assert_eq!(transformer.mode(), BatchMode::Sequential);

    let mut scope = store.begin().await.unwrap();
    let opened = store.scopes_opened();
    let candidates = scope.scan("nodes").await.unwrap();
    let report = assert_ok!(
        transformer
            .transform(
                &mut scope,
                candidates,
                uppercase_titles(),
                &RecordUpdateSink::new("nodes"),
            )
            .await
    );
    scope.commit().await.unwrap();

    assert_eq!(report.mode, BatchMode::Sequential);
    assert_eq!(report.applied, 20);
    assert_eq!(store.scopes_opened(), opened);
}

/// Resolves a referenced label through a lookup table, inside the scope the
/// transformer hands over.
struct ResolveLabel;

#[async_trait]
impl RecordTransform<InMemoryStore, Record> for ResolveLabel {
    async fn transform(
        &self,
        mut record: Record,
        scope: &mut MemoryScope,
    ) -> Result<TransformOutcome<Record>> {
        let Some(label_key) = record.text("label_ref").map(str::to_string) else {
            return Ok(TransformOutcome::Unchanged);
        };
        let label = scope
            .get("labels", &label_key)
            .await?
            .ok_or_else(|| MigrationError::RecordNotFound("labels".to_string(), label_key))?;
        let text = label.text("text").unwrap_or_default().to_string();
        record.set("label", text);
        record.remove("label_ref");
        Ok(TransformOutcome::Changed(record))
    }
}

#[tokio::test]
async fn test_parallel_units_read_through_their_own_scope() {
    let store = Arc::new(InMemoryStore::new());
    {
        let mut scope = store.begin().await.unwrap();
        scope.create_table_if_not_exists("labels").await.unwrap();
        scope.create_table_if_not_exists("nodes").await.unwrap();
        scope
            .insert("labels", Record::new("l1").with("text", "Welcome"))
            .await
            .unwrap();
        for i in 0..12 {
            let mut node = Record::new(format!("n{:02}", i));
            if i % 3 != 0 {
                node.set("label_ref", "l1");
            }
            if i == 11 {
                node.set("label_ref", "missing");
            }
            scope.insert("nodes", node).await.unwrap();
        }
        scope.commit().await.unwrap();
    }
    let transformer = BatchTransformer::new(store.clone(), BatchConfig::default().max_workers(3));

    let mut scope = store.begin().await.unwrap();
    let candidates = scope.scan("nodes").await.unwrap();
    let report = transformer
        .transform(
            &mut scope,
            candidates,
            ResolveLabel,
            &RecordUpdateSink::new("nodes"),
        )
        .await
        .unwrap();
    scope.commit().await.unwrap();

    assert_eq!(report.mode, BatchMode::Parallel);
    assert_eq!(report.unchanged, 4);
    assert_eq!(report.failed, 1);
    assert_eq!(report.applied, 7);
    let node = store.committed_record("nodes", "n01").await.unwrap().unwrap();
    assert_eq!(node.text("label"), Some("Welcome"));
    assert!(node.get("label_ref").is_none());
}

/// Re-encodes legacy data type configurations (a JSON array of prevalues)
/// into the keyed object format, as a plan step.
struct MigrateDataTypeConfigurations;

#[async_trait]
impl MigrationStep<InMemoryStore> for MigrateDataTypeConfigurations {
    async fn migrate(
        &self,
        ctx: &mut MigrationContext<InMemoryStore>,
        scope: &mut MemoryScope,
    ) -> Result<()> {
        let candidates: Vec<Record> = scope
            .scan("data_types")
            .await?
            .into_iter()
            .filter(|record| {
                record
                    .get("config")
                    .and_then(Value::as_json)
                    .is_some_and(serde_json::Value::is_array)
            })
            .collect();

        let transformer = BatchTransformer::new(ctx.store().clone(), ctx.config().batch.clone());
        let report = transformer
            .transform(
                scope,
                candidates,
                transform_fn(|mut record: Record| {
                    let Some(prevalues) = record
                        .get("config")
                        .and_then(Value::as_json)
                        .and_then(serde_json::Value::as_array)
                        .cloned()
                    else {
                        return Ok(TransformOutcome::Unchanged);
                    };
                    let mut config = serde_json::Map::new();
                    for prevalue in prevalues {
                        let alias = prevalue
                            .get("alias")
                            .and_then(serde_json::Value::as_str)
                            .ok_or_else(|| {
                                MigrationError::Serialization(format!(
                                    "data type {} has a prevalue without alias",
                                    record.key
                                ))
                            })?;
                        let value = prevalue.get("value").cloned().unwrap_or_default();
                        config.insert(alias.to_string(), value);
                    }
                    record.set("config", serde_json::Value::Object(config));
                    Ok(TransformOutcome::Changed(record))
                }),
                &RecordUpdateSink::new("data_types"),
            )
            .await?;

        if report.applied > 0 {
            ctx.request_cache_rebuild();
        }
        ctx.set_post_migration_value("data_types_migrated", &report.applied)?;
        Ok(())
    }
}

#[tokio::test]
async fn test_data_type_rewrite_step_inside_a_plan() {
    let store = Arc::new(InMemoryStore::single_writer());
    {
        let mut scope = store.begin().await.unwrap();
        scope.create_table_if_not_exists("data_types").await.unwrap();
        scope
            .insert(
                "data_types",
                Record::new("1046").with(
                    "config",
                    json!([{ "alias": "maxChars", "value": 120 }, { "alias": "rows", "value": 4 }]),
                ),
            )
            .await
            .unwrap();
        scope
            .insert(
                "data_types",
                Record::new("1047").with("config", json!({ "already": "keyed" })),
            )
            .await
            .unwrap();
        scope
            .insert(
                "data_types",
                Record::new("1048").with("config", json!([{ "value": "no alias" }])),
            )
            .await
            .unwrap();
        scope.commit().await.unwrap();
    }

    let plan = PlanBuilder::<InMemoryStore>::new("core")
        .from("8.0.0")
        .to(
            StepDescriptor::new("MigrateDataTypeConfigurations").with_order(1),
            |_| MigrateDataTypeConfigurations,
            "8.1.0",
        )
        .post_migration("ReportMigratedDataTypes", |ctx, _scope| {
            Box::pin(async move {
                let migrated: Option<usize> = ctx.post_migration_value_as("data_types_migrated")?;
                if migrated != Some(1) {
                    return Err(MigrationError::Execution(format!(
                        "unexpected migrated count {:?}",
                        migrated
                    )));
                }
                Ok::<(), MigrationError>(())
            })
        })
        .build()
        .unwrap();
    let states = Arc::new(MemoryStateStore::new());
    let upgrader = Upgrader::new(plan, states, store.clone());

    let result = upgrader.execute().await.unwrap();

    assert!(result.rebuild_cache_requested);
    assert_eq!(result.post_migrations, vec!["ReportMigratedDataTypes"]);
    let migrated = store.committed_record("data_types", "1046").await.unwrap().unwrap();
    assert_eq!(
        migrated.get("config").and_then(Value::as_json),
        Some(&json!({ "maxChars": 120, "rows": 4 }))
    );
    let broken = store.committed_record("data_types", "1048").await.unwrap().unwrap();
    assert_eq!(
        broken.get("config").and_then(Value::as_json),
        Some(&json!([{ "value": "no alias" }]))
    );
}
