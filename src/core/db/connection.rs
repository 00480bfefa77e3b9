/// Connection Module
///
/// A [`Connection`] is one session checked out of a [`ConnectionPool`]. It
/// owns the per-checkout state (transaction, row limit, prefetch, row
/// counters, last error) and hands out prepared statements and result sets
/// that borrow it, so none of them can outlive the checkout.
///
/// [`ConnectionPool`]: crate::core::db::pool::ConnectionPool
use crate::core::backend::{BackendConnection, BackendResult, ExecuteOutcome};
use crate::core::db::pool::PoolShared;
use crate::core::db::result_set::ResultSet;
use crate::core::db::statement::PreparedStatement;
use crate::core::types::Value;
use crate::core::{DbError, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Backend session shared between a pool slot and the caller holding it.
///
/// `None` once the session has been closed.
pub(crate) type BackendHandle = Arc<Mutex<Option<Box<dyn BackendConnection>>>>;

/// Closes the session behind `handle` if it is still open.
pub(crate) fn close_handle(handle: &BackendHandle) {
    let backend = handle.lock().take();
    if let Some(mut backend) = backend {
        backend.close();
    }
}

/// Represents database transaction states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionState {
    /// No active transaction (autocommit mode)
    #[default]
    Autocommit,
    /// Transaction in progress
    Transaction,
}

/// Settings applied to every connection handed out by a pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Row limit for queries, 0 for unlimited
    pub max_rows: usize,
    /// Rows the backend should fetch per round trip, 0 for the backend default
    pub row_prefetch: usize,
    /// Log every SQL statement at debug level
    pub trace_sql: bool,
}

/// A checked-out database session.
///
/// Dropping the connection (or calling [`Connection::close`]) returns it to
/// its pool. A transaction still open at that point is rolled back.
pub struct Connection {
    pool: Arc<PoolShared>,
    slot_id: u64,
    handle: BackendHandle,
    trace_sql: bool,
    transaction: Cell<TransactionState>,
    max_rows: Cell<usize>,
    prefetch_rows: Cell<usize>,
    rows_changed: Cell<i64>,
    last_insert_id: Cell<i64>,
    last_error: RefCell<Option<String>>,
}

impl Connection {
    pub(crate) fn new(
        pool: Arc<PoolShared>,
        slot_id: u64,
        handle: BackendHandle,
        settings: &ConnectionSettings,
    ) -> Self {
        let conn = Connection {
            pool,
            slot_id,
            handle,
            trace_sql: settings.trace_sql,
            transaction: Cell::new(TransactionState::Autocommit),
            max_rows: Cell::new(settings.max_rows),
            prefetch_rows: Cell::new(0),
            rows_changed: Cell::new(0),
            last_insert_id: Cell::new(0),
            last_error: RefCell::new(None),
        };
        conn.set_default_row_prefetch(settings.row_prefetch);
        conn
    }

    /// Runs `f` against the backend session.
    ///
    /// Backend errors are recorded as the connection's last error and
    /// returned as `DbError::SqlExecution`; fatal ones are also reported to
    /// the pool's abort handler.
    pub(crate) fn with_backend<T>(
        &self,
        f: impl FnOnce(&mut dyn BackendConnection) -> BackendResult<T>,
    ) -> Result<T> {
        let mut guard = self.handle.lock();
        let backend = guard
            .as_mut()
            .ok_or_else(|| DbError::Connection("connection is closed".to_string()))?;
        match f(backend.as_mut()) {
            Ok(value) => Ok(value),
            Err(e) => {
                let message = if e.message.is_empty() {
                    backend
                        .last_error()
                        .unwrap_or_else(|| "unknown backend error".to_string())
                } else {
                    e.message
                };
                drop(guard);
                *self.last_error.borrow_mut() = Some(message.clone());
                if e.fatal {
                    self.pool.report_fatal(&message);
                }
                Err(DbError::SqlExecution(message))
            }
        }
    }

    pub(crate) fn record_outcome(&self, outcome: ExecuteOutcome) {
        self.rows_changed.set(outcome.rows_changed);
        self.last_insert_id.set(outcome.last_insert_id);
    }

    pub(crate) fn trace(&self, sql: &str) {
        if self.trace_sql {
            debug!(connection = self.slot_id, "{}", sql);
        }
    }

    /// Executes a statement that returns no rows.
    ///
    /// `?` placeholders in `sql` are bound from `params` in order.
    ///
    /// # Errors
    ///
    /// Returns `DbError::SqlExecution` with the backend's message if the
    /// statement fails. The connection stays usable.
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<()> {
        self.trace(sql);
        let outcome = self.with_backend(|backend| backend.execute(sql, params))?;
        self.record_outcome(outcome);
        Ok(())
    }

    /// Executes a query and returns a result set positioned before the first row.
    pub fn execute_query(&self, sql: &str, params: &[Value]) -> Result<ResultSet<'_>> {
        self.trace(sql);
        let cursor = self.with_backend(|backend| backend.query(sql, params))?;
        Ok(ResultSet::new(self, cursor))
    }

    /// Compiles `sql` into a reusable statement with `?` placeholders.
    pub fn prepare_statement(&self, sql: &str) -> Result<PreparedStatement<'_>> {
        self.trace(sql);
        let statement = self.with_backend(|backend| backend.prepare(sql))?;
        Ok(PreparedStatement::new(self, sql, statement))
    }

    pub fn begin_transaction(&self) -> Result<()> {
        if self.in_transaction() {
            return Err(DbError::SqlExecution("transaction already in progress".to_string()));
        }
        self.with_backend(|backend| backend.begin())?;
        self.transaction.set(TransactionState::Transaction);
        debug!(connection = self.slot_id, "transaction started");
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        if !self.in_transaction() {
            return Err(DbError::SqlExecution("no transaction in progress".to_string()));
        }
        self.with_backend(|backend| backend.commit())?;
        self.transaction.set(TransactionState::Autocommit);
        debug!(connection = self.slot_id, "transaction committed");
        Ok(())
    }

    pub fn rollback(&self) -> Result<()> {
        if !self.in_transaction() {
            return Err(DbError::SqlExecution("no transaction in progress".to_string()));
        }
        let result = self.with_backend(|backend| backend.rollback());
        self.transaction.set(TransactionState::Autocommit);
        debug!(connection = self.slot_id, "transaction rolled back");
        result
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.get() == TransactionState::Transaction
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.transaction.get()
    }

    /// Limits the rows any later result set on this connection yields. 0 means no limit.
    pub fn set_max_rows(&self, max_rows: usize) {
        self.max_rows.set(max_rows);
    }

    pub fn max_rows(&self) -> usize {
        self.max_rows.get()
    }

    /// Asks the backend to fetch `rows` rows per round trip.
    pub fn set_default_row_prefetch(&self, rows: usize) {
        self.prefetch_rows.set(rows);
        if let Some(backend) = self.handle.lock().as_mut() {
            backend.set_prefetch_rows(rows);
        }
    }

    pub fn default_row_prefetch(&self) -> usize {
        self.prefetch_rows.get()
    }

    /// Rows changed by the last `execute` on this connection or its statements.
    pub fn rows_changed(&self) -> i64 {
        self.rows_changed.get()
    }

    /// Row id of the last inserted row.
    ///
    /// Only SQLite and MySQL report row ids; on other backends the value
    /// carries no meaning.
    pub fn last_row_id(&self) -> i64 {
        self.last_insert_id.get()
    }

    /// Message of the last error reported by the backend.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.borrow().clone()
    }

    /// Checks that the backend session is alive.
    pub fn ping(&self) -> bool {
        self.handle
            .lock()
            .as_mut()
            .map_or(false, |backend| backend.ping())
    }

    /// True once the pool has force-closed the session.
    pub fn is_closed(&self) -> bool {
        self.handle.lock().is_none()
    }

    /// Returns the connection to its pool.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.in_transaction() {
            warn!(connection = self.slot_id, "rolling back unfinished transaction");
            if let Err(e) = self.rollback() {
                warn!(connection = self.slot_id, "rollback on return failed: {}", e);
            }
        }
        self.pool.return_connection(self.slot_id, &self.handle);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("slot_id", &self.slot_id)
            .field("transaction", &self.transaction.get())
            .field("max_rows", &self.max_rows.get())
            .field("prefetch_rows", &self.prefetch_rows.get())
            .field("rows_changed", &self.rows_changed.get())
            .finish()
    }
}
