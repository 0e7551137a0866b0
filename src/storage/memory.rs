use super::{DataStore, RecordScope, StoreCapabilities, StoreScope, Table};
use crate::core::{MigrationError, Record, Result};
use crate::transaction::{BaseVersion, Change, ScopeId, ScopeLog};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::time::timeout;
use tracing::{Level, event};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// In-memory transactional record store.
///
/// Committed tables live behind one lock; each scope works on private copies
/// of the tables it touches and replays its change log on commit. A
/// single-writer store admits one open scope at a time, the way an embedded
/// single-file engine does, and fails with a lock error when a second scope
/// cannot get in before the lock timeout.
pub struct InMemoryStore {
    tables: Arc<RwLock<HashMap<String, Table>>>,
    capabilities: StoreCapabilities,
    writer_gate: Option<Arc<Semaphore>>,
    lock_timeout: Duration,
    scopes_opened: Arc<AtomicU64>,
}

impl InMemoryStore {
    /// Store that tolerates concurrent writers.
    pub fn new() -> Self {
        Self {
            tables: Arc::new(RwLock::new(HashMap::new())),
            capabilities: StoreCapabilities {
                concurrent_writers: true,
            },
            writer_gate: None,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            scopes_opened: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Store that admits a single open scope at a time.
    pub fn single_writer() -> Self {
        Self {
            capabilities: StoreCapabilities {
                concurrent_writers: false,
            },
            writer_gate: Some(Arc::new(Semaphore::new(1))),
            ..Self::new()
        }
    }

    /// How long `begin` waits for the writer slot on a single-writer store.
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Number of scopes opened since the store was created.
    pub fn scopes_opened(&self) -> u64 {
        self.scopes_opened.load(Ordering::SeqCst)
    }

    /// Committed records of a table, outside of any scope.
    pub async fn committed_records(&self, table: &str) -> Result<Vec<Record>> {
        let tables = self.tables.read().await;
        tables
            .get(table)
            .map(Table::scan)
            .ok_or_else(|| MigrationError::TableNotFound(table.to_string()))
    }

    pub async fn committed_record(&self, table: &str, key: &str) -> Result<Option<Record>> {
        let tables = self.tables.read().await;
        let table_ref = tables
            .get(table)
            .ok_or_else(|| MigrationError::TableNotFound(table.to_string()))?;
        Ok(table_ref.get(key).cloned())
    }

    pub async fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    async fn acquire_writer_slot(&self) -> Result<Option<OwnedSemaphorePermit>> {
        let Some(gate) = &self.writer_gate else {
            return Ok(None);
        };
        let timeout_ms = self.lock_timeout.as_millis();

        timeout(self.lock_timeout, gate.clone().acquire_owned())
            .await
            .map_err(|_| {
                MigrationError::LockError(format!(
                    "database is locked: no writer slot within {}ms",
                    timeout_ms
                ))
            })?
            .map(Some)
            .map_err(|_| MigrationError::LockError("writer gate closed".to_string()))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataStore for InMemoryStore {
    type Scope = MemoryScope;

    fn capabilities(&self) -> StoreCapabilities {
        self.capabilities
    }

    async fn begin(&self) -> Result<MemoryScope> {
        let writer_slot = self.acquire_writer_slot().await?;
        self.scopes_opened.fetch_add(1, Ordering::SeqCst);

        let scope = MemoryScope {
            log: ScopeLog::new(ScopeId::new()),
            tables: self.tables.clone(),
            working: HashMap::new(),
            bases: HashMap::new(),
            _writer_slot: writer_slot,
        };
        event!(Level::TRACE, scope = %scope.log.id(), "scope opened");
        Ok(scope)
    }
}

/// A scope over [`InMemoryStore`].
pub struct MemoryScope {
    log: ScopeLog,
    tables: Arc<RwLock<HashMap<String, Table>>>,
    // Private copies of touched tables; `None` means absent in this scope.
    working: HashMap<String, Option<Table>>,
    // Committed version of each record at the time this scope first wrote it.
    bases: HashMap<(String, String), BaseVersion>,
    _writer_slot: Option<OwnedSemaphorePermit>,
}

impl MemoryScope {
    async fn load(&mut self, table: &str) -> Result<&mut Option<Table>> {
        self.log.ensure_active()?;
        if !self.working.contains_key(table) {
            let committed = self.tables.read().await.get(table).cloned();
            self.working.insert(table.to_string(), committed);
        }
        self.working
            .get_mut(table)
            .ok_or_else(|| MigrationError::TableNotFound(table.to_string()))
    }

    async fn existing_table(&mut self, table: &str) -> Result<&mut Table> {
        self.load(table)
            .await?
            .as_mut()
            .ok_or_else(|| MigrationError::TableNotFound(table.to_string()))
    }

    async fn base_version(&mut self, table: &str, key: &str) -> Result<BaseVersion> {
        let current = self.existing_table(table).await?.version_of(key);
        Ok(*self
            .bases
            .entry((table.to_string(), key.to_string()))
            .or_insert(current))
    }

    async fn write_record(&mut self, table: &str, record: Record) -> Result<()> {
        let base_version = self.base_version(table, &record.key).await?;
        self.existing_table(table).await?.upsert(record.clone());
        self.log.record_change(Change::Upsert {
            table: table.to_string(),
            record,
            base_version,
        })
    }

    /// Number of changes buffered so far.
    pub fn pending_changes(&self) -> usize {
        self.log.change_count()
    }
}

fn apply_change(staged: &mut HashMap<String, Option<Table>>, change: Change) -> Result<()> {
    let slot = staged
        .get_mut(change.table_name())
        .ok_or_else(|| MigrationError::TableNotFound(change.table_name().to_string()))?;

    match change {
        Change::CreateTable {
            name,
            if_not_exists,
        } => {
            if slot.is_some() {
                if !if_not_exists {
                    return Err(MigrationError::TableExists(name));
                }
            } else {
                *slot = Some(Table::new(name));
            }
        }
        Change::DropTable { .. } => {
            *slot = None;
        }
        Change::Upsert { table, record, .. } => {
            slot.as_mut()
                .ok_or(MigrationError::TableNotFound(table))?
                .upsert(record);
        }
        Change::Delete { table, key, .. } => {
            slot.as_mut()
                .ok_or(MigrationError::TableNotFound(table))?
                .delete(&key);
        }
    }
    Ok(())
}

#[async_trait]
impl StoreScope for MemoryScope {
    fn id(&self) -> ScopeId {
        self.log.id()
    }

    async fn commit(mut self) -> Result<()> {
        let changes = self.log.commit()?;
        if changes.is_empty() {
            return Ok(());
        }

        let mut tables = self.tables.write().await;
        for ((table, key), base) in &self.bases {
            let current = tables.get(table).and_then(|t| t.version_of(key));
            if current != *base {
                return Err(MigrationError::WriteConflict(format!("{}/{}", table, key)));
            }
        }

        // Replay on copies first so a failing change leaves nothing half-applied.
        let mut staged: HashMap<String, Option<Table>> = HashMap::new();
        for change in &changes {
            let name = change.table_name();
            if !staged.contains_key(name) {
                staged.insert(name.to_string(), tables.get(name).cloned());
            }
        }
        let change_count = changes.len();
        for change in changes {
            apply_change(&mut staged, change)?;
        }
        for (name, table) in staged {
            match table {
                Some(table) => {
                    tables.insert(name, table);
                }
                None => {
                    tables.remove(&name);
                }
            }
        }

        event!(Level::TRACE, scope = %self.log.id(), changes = change_count, "scope committed");
        Ok(())
    }

    async fn rollback(mut self) -> Result<()> {
        self.log.rollback()?;
        self.working.clear();
        event!(Level::TRACE, scope = %self.log.id(), "scope rolled back");
        Ok(())
    }
}

impl Drop for MemoryScope {
    fn drop(&mut self) {
        if self.log.state().is_active() && self.log.change_count() > 0 {
            event!(
                Level::DEBUG,
                scope = %self.log.id(),
                changes = self.log.change_count(),
                "scope dropped without commit; changes discarded"
            );
        }
    }
}

#[async_trait]
impl RecordScope for MemoryScope {
    async fn table_exists(&mut self, table: &str) -> Result<bool> {
        Ok(self.load(table).await?.is_some())
    }

    async fn create_table_if_not_exists(&mut self, table: &str) -> Result<bool> {
        let slot = self.load(table).await?;
        if slot.is_some() {
            return Ok(false);
        }
        *slot = Some(Table::new(table));
        self.log.record_change(Change::CreateTable {
            name: table.to_string(),
            if_not_exists: true,
        })?;
        Ok(true)
    }

    async fn drop_table_if_exists(&mut self, table: &str) -> Result<bool> {
        let slot = self.load(table).await?;
        if slot.is_none() {
            return Ok(false);
        }
        *slot = None;
        self.log.record_change(Change::DropTable {
            name: table.to_string(),
        })?;
        Ok(true)
    }

    async fn get(&mut self, table: &str, key: &str) -> Result<Option<Record>> {
        Ok(self.existing_table(table).await?.get(key).cloned())
    }

    async fn scan(&mut self, table: &str) -> Result<Vec<Record>> {
        Ok(self.existing_table(table).await?.scan())
    }

    async fn insert(&mut self, table: &str, record: Record) -> Result<()> {
        if self.existing_table(table).await?.contains(&record.key) {
            return Err(MigrationError::DuplicateKey(table.to_string(), record.key));
        }
        self.write_record(table, record).await
    }

    async fn upsert(&mut self, table: &str, record: Record) -> Result<()> {
        self.write_record(table, record).await
    }

    async fn update_many(&mut self, table: &str, records: &[Record]) -> Result<usize> {
        let mut affected = 0;
        for record in records {
            if self.existing_table(table).await?.contains(&record.key) {
                self.write_record(table, record.clone()).await?;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn delete(&mut self, table: &str, key: &str) -> Result<bool> {
        if !self.existing_table(table).await?.contains(key) {
            return Ok(false);
        }
        let base_version = self.base_version(table, key).await?;
        self.existing_table(table).await?.delete(key);
        self.log.record_change(Change::Delete {
            table: table.to_string(),
            key: key.to_string(),
            base_version,
        })?;
        Ok(true)
    }
}
