// ============================================================================
// Scope Change Tracking
// ============================================================================
//
// Every write made inside a scope is recorded as a Change. Nothing touches the
// committed tables until COMMIT replays the log; ROLLBACK (or dropping the
// scope) simply discards it.
//
// ============================================================================

use crate::core::Record;

/// Committed version of a record observed when the scope first touched it.
/// `None` means the record did not exist yet.
pub type BaseVersion = Option<u64>;

/// A single replayable change recorded by a scope.
#[derive(Debug, Clone)]
pub enum Change {
    /// Create a table (no-op on replay when it already exists and `if_not_exists` is set)
    CreateTable { name: String, if_not_exists: bool },

    /// Drop a table and every record in it
    DropTable { name: String },

    /// Insert or replace a record
    Upsert {
        table: String,
        record: Record,
        base_version: BaseVersion,
    },

    /// Delete a record by key
    Delete {
        table: String,
        key: String,
        base_version: BaseVersion,
    },
}

impl Change {
    /// Get the table name affected by this change
    pub fn table_name(&self) -> &str {
        match self {
            Change::CreateTable { name, .. } => name,
            Change::DropTable { name } => name,
            Change::Upsert { table, .. } => table,
            Change::Delete { table, .. } => table,
        }
    }

    /// Record key plus the version the scope based its write on, for DML changes.
    pub fn guarded_key(&self) -> Option<(&str, BaseVersion)> {
        match self {
            Change::Upsert {
                record,
                base_version,
                ..
            } => Some((&record.key, *base_version)),
            Change::Delete {
                key, base_version, ..
            } => Some((key, *base_version)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_table_name() {
        let change = Change::Upsert {
            table: "data_types".to_string(),
            record: Record::new("1"),
            base_version: None,
        };
        assert_eq!(change.table_name(), "data_types");
        assert_eq!(change.guarded_key(), Some(("1", None)));
    }

    #[test]
    fn test_change_classification() {
        let create = Change::CreateTable {
            name: "key_value".to_string(),
            if_not_exists: true,
        };
        assert!(create.guarded_key().is_none());

        let delete = Change::Delete {
            table: "key_value".to_string(),
            key: "k".to_string(),
            base_version: Some(3),
        };
        assert_eq!(delete.guarded_key(), Some(("k", Some(3))));
    }
}
