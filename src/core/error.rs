use thiserror::Error;

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Plan '{plan}' has no state '{state}'; the stored state must be inspected and repaired")]
    UnknownState { plan: String, state: String },

    #[error("Plan '{plan}' step '{step}' ({from} -> {to}) failed: {source}")]
    StepExecution {
        plan: String,
        step: String,
        from: String,
        to: String,
        #[source]
        source: Box<MigrationError>,
    },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("State of plan '{plan}' changed concurrently: expected '{expected}', found '{actual}'")]
    ConcurrentStateChange {
        plan: String,
        expected: String,
        actual: String,
    },

    #[error("Post-migration '{name}' failed: {source}")]
    PostMigration {
        name: String,
        #[source]
        source: Box<MigrationError>,
    },

    #[error("Plan '{plan}' cancelled at state '{state}'")]
    Cancelled { plan: String, state: String },

    #[error("Timed out after {0}ms")]
    Timeout(u64),

    #[error("Table '{0}' already exists")]
    TableExists(String),

    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Record '{1}' not found in table '{0}'")]
    RecordNotFound(String, String),

    #[error("Record '{1}' already exists in table '{0}'")]
    DuplicateKey(String, String),

    #[error("Write conflict on '{0}': record changed by another scope")]
    WriteConflict(String),

    #[error("Scope {0} is no longer active")]
    ScopeClosed(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("I/O error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, MigrationError>;

impl MigrationError {
    /// Walks `StepExecution`/`PostMigration` wrappers down to the original failure.
    pub fn root_cause(&self) -> &MigrationError {
        match self {
            Self::StepExecution { source, .. } | Self::PostMigration { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }

    /// Errors that must stop the host from starting against the store.
    pub fn is_fatal_for_startup(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::UnknownState { .. }
                | Self::ConcurrentStateChange { .. }
        )
    }
}

impl<T> From<std::sync::PoisonError<T>> for MigrationError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<serde_json::Error> for MigrationError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for MigrationError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
