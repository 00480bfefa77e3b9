//! dbkit: a thread-safe database connection pool with a uniform API over
//! SQLite, MySQL, PostgreSQL and Oracle backends.

// Core infrastructure modules
pub mod core;

// Feature-specific modules
pub mod config;

#[cfg(test)]
mod test_utils;

pub use crate::core::backend::{default_registry, Driver, DriverRegistry};
pub use crate::core::db::{
    ColumnInfo, Connection, ConnectionPool, ConnectionSettings, PoolConfig, PreparedStatement, ResultSet,
    TransactionState,
};
pub use crate::core::types::{DateTime, Value};
pub use crate::core::url::{Scheme, Url};
pub use crate::core::{DbError, ErrorKind, Result};
