pub mod error;
pub mod types;
pub mod value;

pub use error::{MigrationError, Result};
pub use types::{Record, State};
pub use value::Value;
