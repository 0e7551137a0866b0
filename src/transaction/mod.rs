// ============================================================================
// Scope Transaction Module
// ============================================================================
//
// Scopes buffer their writes as a change log (Command Pattern) and replay it
// atomically on commit, after checking that no record they based a write on
// was changed by another scope in the meantime (optimistic concurrency).
//
// ============================================================================

pub mod change;
pub mod state;

pub use change::{BaseVersion, Change};
pub use state::{ScopeId, ScopeLog, ScopeState};
