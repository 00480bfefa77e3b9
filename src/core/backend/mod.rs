//! Backend Capability Module
//!
//! The pool, connections, statements and result sets never talk to a
//! database directly. They go through the traits below, implemented once
//! per database protocol and selected when the pool is created.
//!
//! ## Architecture
//!
//! - [`Driver`] opens sessions for one [`Scheme`]
//! - [`BackendConnection`] is one open session
//! - [`BackendStatement`] is a compiled statement with positional parameters
//! - [`BackendCursor`] yields the rows of a query one at a time
//!
//! Drivers are looked up in a [`DriverRegistry`]. The default registry holds
//! the bundled SQLite driver when the `sqlite` feature is enabled; drivers
//! for other protocols are registered by the application.
#[cfg(feature = "sqlite")]
pub mod sqlite;

use crate::core::types::Value;
use crate::core::url::{Scheme, Url};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Error reported by a backend.
///
/// `fatal` marks a session that cannot be used any more (lost connection,
/// unreachable server). The pool reports fatal errors to its abort handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
    pub fatal: bool,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        BackendError {
            message: message.into(),
            fatal: false,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        BackendError {
            message: message.into(),
            fatal: true,
        }
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Row counters reported after a non-query statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteOutcome {
    pub rows_changed: i64,
    /// Only meaningful for backends with row ids (SQLite, MySQL)
    pub last_insert_id: i64,
}

/// Opens backend sessions for one database protocol.
pub trait Driver: Send + Sync {
    fn scheme(&self) -> Scheme;

    fn connect(&self, url: &Url) -> BackendResult<Box<dyn BackendConnection>>;
}

/// An open backend session.
pub trait BackendConnection: Send {
    /// Runs a statement that returns no rows. `?` placeholders are bound from `params`.
    fn execute(&mut self, sql: &str, params: &[Value]) -> BackendResult<ExecuteOutcome>;

    /// Runs a query and returns a cursor positioned before the first row.
    fn query(&mut self, sql: &str, params: &[Value]) -> BackendResult<Box<dyn BackendCursor>>;

    fn prepare(&mut self, sql: &str) -> BackendResult<Box<dyn BackendStatement>>;

    fn begin(&mut self) -> BackendResult<()>;

    fn commit(&mut self) -> BackendResult<()>;

    fn rollback(&mut self) -> BackendResult<()>;

    /// Hint for how many rows to fetch per round trip.
    fn set_prefetch_rows(&mut self, _rows: usize) {}

    /// Checks that the session is still usable.
    fn ping(&mut self) -> bool;

    /// Message of the last error reported by the session, if any.
    fn last_error(&self) -> Option<String>;

    fn close(&mut self);
}

/// A compiled statement.
pub trait BackendStatement: Send {
    fn parameter_count(&self) -> usize;

    /// Binds the 1-based parameter `index`.
    fn bind(&mut self, index: usize, value: &Value) -> BackendResult<()>;

    fn execute(&mut self) -> BackendResult<ExecuteOutcome>;

    fn query(&mut self) -> BackendResult<Box<dyn BackendCursor>>;
}

/// Forward-only row source.
///
/// Rows are fetched on demand. A cursor may borrow its session while open,
/// so it stays on the thread that created it.
pub trait BackendCursor {
    fn columns(&self) -> &[String];

    /// Next row, or `None` at end of data.
    fn fetch_row(&mut self) -> BackendResult<Option<Vec<Value>>>;

    fn set_fetch_size(&mut self, _rows: usize) {}

    /// Releases the session early once no more rows will be read.
    fn finish(&mut self) {}
}

/// Maps URL schemes to drivers.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<Scheme, Arc<dyn Driver>>,
}

impl DriverRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the drivers compiled into this crate.
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();
        #[cfg(feature = "sqlite")]
        registry.register(Arc::new(sqlite::SqliteDriver));
        registry
    }

    /// Registers `driver` for its scheme, replacing any previous one.
    pub fn register(&mut self, driver: Arc<dyn Driver>) {
        self.drivers.insert(driver.scheme(), driver);
    }

    pub fn get(&self, scheme: Scheme) -> Option<Arc<dyn Driver>> {
        self.drivers.get(&scheme).cloned()
    }

    pub fn supports(&self, scheme: Scheme) -> bool {
        self.drivers.contains_key(&scheme)
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let schemes: Vec<&str> = Scheme::ALL
            .iter()
            .filter(|s| self.supports(**s))
            .map(|s| s.as_str())
            .collect();
        f.debug_struct("DriverRegistry").field("schemes", &schemes).finish()
    }
}

static DEFAULT_REGISTRY: Lazy<DriverRegistry> = Lazy::new(DriverRegistry::with_defaults);

/// The registry used by `ConnectionPool::new`.
pub fn default_registry() -> &'static DriverRegistry {
    &DEFAULT_REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_constructors() {
        let err = BackendError::new("no such table: zild_t");
        assert!(!err.fatal);
        assert_eq!(err.to_string(), "no such table: zild_t");
        assert!(BackendError::fatal("server has gone away").fatal);
    }

    #[test]
    fn test_empty_registry() {
        let registry = DriverRegistry::new();
        assert!(!registry.supports(Scheme::MySql));
        assert!(registry.get(Scheme::Oracle).is_none());
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn test_default_registry_has_sqlite() {
        assert!(default_registry().supports(Scheme::Sqlite));
        assert!(!default_registry().supports(Scheme::PostgreSql));
        assert!(format!("{:?}", default_registry()).contains("sqlite"));
    }
}
