use super::{StateStore, ensure_expected};
use crate::core::{MigrationError, Result, State};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{Level, event};

/// One recorded plan state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    pub state: State,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateDocument {
    #[serde(default)]
    plans: BTreeMap<String, StateEntry>,
}

/// State store persisted as a JSON document on disk.
///
/// Writes go to a temp file that is renamed over the document, so a crash
/// leaves either the old or the new document.
pub struct FileStateStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within the process.
    guard: Mutex<()>,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All recorded plans, ordered by name.
    pub async fn entries(&self) -> Result<Vec<(String, StateEntry)>> {
        let _guard = self.guard.lock().await;
        Ok(self.load().await?.plans.into_iter().collect())
    }

    async fn load(&self) -> Result<StateDocument> {
        match fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(StateDocument::default()),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|err| {
                MigrationError::Serialization(format!(
                    "Failed to parse state file '{}': {}",
                    self.path.display(),
                    err
                ))
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(StateDocument::default()),
            Err(err) => Err(MigrationError::Io(format!(
                "Failed to read state file '{}': {}",
                self.path.display(),
                err
            ))),
        }
    }

    async fn store(&self, document: &StateDocument) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(document)?;
        atomic_write(&self.path, &bytes).await
    }

    async fn write_entry(&self, mut document: StateDocument, plan: &str, state: &State) -> Result<()> {
        document.plans.insert(
            plan.to_string(),
            StateEntry {
                state: state.clone(),
                updated_at: Utc::now(),
            },
        );
        self.store(&document).await?;
        event!(
            Level::DEBUG,
            plan = %plan,
            state = %state,
            path = %self.path.display(),
            "plan state written"
        );
        Ok(())
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get(&self, plan: &str) -> Result<Option<State>> {
        let _guard = self.guard.lock().await;
        Ok(self.load().await?.plans.remove(plan).map(|entry| entry.state))
    }

    async fn set(&self, plan: &str, state: &State) -> Result<()> {
        let _guard = self.guard.lock().await;
        let document = self.load().await?;
        self.write_entry(document, plan, state).await
    }

    async fn set_guarded(
        &self,
        plan: &str,
        expected: Option<&State>,
        state: &State,
    ) -> Result<()> {
        let _guard = self.guard.lock().await;
        let document = self.load().await?;
        ensure_expected(
            plan,
            expected,
            document.plans.get(plan).map(|entry| &entry.state),
        )?;
        self.write_entry(document, plan, state).await
    }
}

async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await.map_err(|err| {
            MigrationError::Io(format!(
                "Failed to create parent directory '{}': {}",
                parent.display(),
                err
            ))
        })?;
    }

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).await.map_err(|err| {
        MigrationError::Io(format!(
            "Failed to write temp file '{}': {}",
            tmp.display(),
            err
        ))
    })?;

    fs::rename(&tmp, path).await.map_err(|err| {
        MigrationError::Io(format!(
            "Failed to rename temp file '{}' -> '{}': {}",
            tmp.display(),
            path.display(),
            err
        ))
    })?;
    Ok(())
}
