//! Database Module
//!
//! This module provides the pooled connection layer, organized into focused
//! submodules.
//!
//! ## Architecture
//!
//! - **Pool** (`pool.rs`): Opens, hands out, takes back and closes backend sessions
//! - **Reaper** (`reaper.rs`): Background thread closing idle sessions above the pool minimum
//! - **Connection** (`connection.rs`): Per-checkout session state and transactions
//! - **Statement** (`statement.rs`): Prepared statements with 1-based parameters
//! - **Result set** (`result_set.rs`): Forward-only row access with typed getters
//! - **Buffer** (`buffer.rs`): Growable storage for string and blob columns
//!
//! ## Error Handling
//!
//! All operations return the crate's `DbError`. Backend messages are kept verbatim.
//!
//! ## Ownership
//!
//! Statements and result sets borrow the connection that created them and
//! cannot outlive it. Dropping a connection returns it to the pool.
pub mod buffer;
pub mod connection;
pub mod pool;
pub(crate) mod reaper;
pub mod result_set;
pub mod statement;

pub use connection::{Connection, ConnectionSettings, TransactionState};
pub use pool::{AbortHandler, ConnectionPool, PoolConfig};
pub use result_set::{ColumnInfo, ResultSet};
pub use statement::PreparedStatement;
