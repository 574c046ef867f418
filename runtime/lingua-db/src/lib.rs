//! Connection pooling and SQLite connectors for the Lingua engine.

mod pool;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use pool::{AcquireError, Pool, Pooled};
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteConn, sqlite_pool};
