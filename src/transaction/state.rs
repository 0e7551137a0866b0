// ============================================================================
// Scope State Management
// ============================================================================
//
// A scope moves through Active -> Committed/Aborted exactly once. The change
// log is only appendable while the scope is active.
//
// ============================================================================

use super::Change;
use crate::core::{MigrationError, Result};
use std::sync::atomic::{AtomicU64, Ordering};

/// Global scope ID counter
static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub u64);

impl ScopeId {
    /// Generate a new unique scope ID
    pub fn new() -> Self {
        ScopeId(NEXT_SCOPE_ID.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for ScopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "scope_{}", self.0)
    }
}

/// Scope lifecycle
///
/// ```text
/// Active ──commit──> Committed
///   │
///   └──rollback──> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    Active,
    Committed,
    Aborted,
}

impl ScopeState {
    pub fn is_active(&self) -> bool {
        matches!(self, ScopeState::Active)
    }
}

impl std::fmt::Display for ScopeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScopeState::Active => write!(f, "ACTIVE"),
            ScopeState::Committed => write!(f, "COMMITTED"),
            ScopeState::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Change log of one scope.
#[derive(Debug)]
pub struct ScopeLog {
    id: ScopeId,
    state: ScopeState,
    changes: Vec<Change>,
}

impl ScopeLog {
    pub fn new(id: ScopeId) -> Self {
        Self {
            id,
            state: ScopeState::Active,
            changes: Vec::new(),
        }
    }

    pub fn id(&self) -> ScopeId {
        self.id
    }

    pub fn state(&self) -> ScopeState {
        self.state
    }

    pub fn change_count(&self) -> usize {
        self.changes.len()
    }

    /// Fails unless the scope can still read or write.
    pub fn ensure_active(&self) -> Result<()> {
        if !self.state.is_active() {
            return Err(MigrationError::ScopeClosed(format!("{} ({})", self.id, self.state)));
        }
        Ok(())
    }

    pub fn record_change(&mut self, change: Change) -> Result<()> {
        self.ensure_active()?;
        self.changes.push(change);
        Ok(())
    }

    /// Marks the scope committed and hands the log over for replay.
    pub fn commit(&mut self) -> Result<Vec<Change>> {
        self.ensure_active()?;
        self.state = ScopeState::Committed;
        Ok(std::mem::take(&mut self.changes))
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.changes.clear();
        self.state = ScopeState::Aborted;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Record;

    #[test]
    fn test_scope_id_generation() {
        let id1 = ScopeId::new();
        let id2 = ScopeId::new();
        assert!(id2 > id1);
        assert!(id1.to_string().starts_with("scope_"));
    }

    #[test]
    fn test_scope_lifecycle() {
        let mut log = ScopeLog::new(ScopeId::new());
        assert!(log.state().is_active());

        log.record_change(Change::CreateTable {
            name: "t".into(),
            if_not_exists: false,
        })
        .unwrap();
        let changes = log.commit().unwrap();

        assert_eq!(changes.len(), 1);
        assert_eq!(log.change_count(), 0);
        assert_eq!(log.state(), ScopeState::Committed);
        assert!(log.commit().is_err());
    }

    #[test]
    fn test_rollback_clears_changes() {
        let mut log = ScopeLog::new(ScopeId::new());
        log.record_change(Change::Upsert {
            table: "t".into(),
            record: Record::new("1"),
            base_version: None,
        })
        .unwrap();

        log.rollback().unwrap();
        assert_eq!(log.change_count(), 0);
        assert_eq!(log.state(), ScopeState::Aborted);
        assert!(matches!(
            log.record_change(Change::DropTable { name: "t".into() }),
            Err(MigrationError::ScopeClosed(_))
        ));
    }
}
