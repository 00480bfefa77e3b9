//! SQLite backend built on rusqlite.
//!
//! URL form: `sqlite:///path/to/file.db[?pragma=value&...]`. The path
//! `/:memory:` opens a private in-memory database. Query parameters other
//! than `user`/`password` are applied as `PRAGMA key = value`; `heap_limit`
//! is given in kilobytes and maps to `soft_heap_limit`.
//!
//! A query steps its statement lazily, one fetch batch at a time. While a
//! cursor is open it holds the session's rusqlite connection, so other
//! statements on that session fail as busy until the cursor reaches end of
//! data, fails, or is dropped.

use super::{
    BackendConnection, BackendCursor, BackendError, BackendResult, BackendStatement, Driver,
    ExecuteOutcome,
};
use crate::core::types::Value;
use crate::core::url::{Scheme, Url};
use ouroboros::self_referencing;
use parking_lot::Mutex;
use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{CachedStatement, Connection, ErrorCode, Rows, Statement};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// How long a statement waits on a locked database file.
const BUSY_TIMEOUT: Duration = Duration::from_secs(3);

const MEMORY_PATH: &str = ":memory:";

/// Rows stepped per batch when no prefetch size was set.
const DEFAULT_FETCH_SIZE: usize = 100;

const BUSY_MESSAGE: &str = "connection is busy with an open result set";

impl From<rusqlite::Error> for BackendError {
    fn from(e: rusqlite::Error) -> Self {
        let fatal = match &e {
            rusqlite::Error::SqliteFailure(failure, _) => matches!(
                failure.code,
                ErrorCode::CannotOpen
                    | ErrorCode::NotADatabase
                    | ErrorCode::DatabaseCorrupt
                    | ErrorCode::SystemIoFailure
            ),
            _ => false,
        };
        BackendError {
            message: e.to_string(),
            fatal,
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Int(v) | Value::Timestamp(v) => ToSqlOutput::Owned(SqlValue::Integer(*v)),
            Value::Double(v) => ToSqlOutput::Owned(SqlValue::Real(*v)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

fn from_value_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Double(f),
        ValueRef::Text(t) => match std::str::from_utf8(t) {
            Ok(text) => Value::Text(text.to_string()),
            // Keep the stored bytes rather than a lossy rewrite
            Err(_) => Value::Blob(t.to_vec()),
        },
        ValueRef::Blob(b) => Value::Blob(b.to_vec()),
    }
}

/// Driver for `sqlite://` URLs.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDriver;

impl Driver for SqliteDriver {
    fn scheme(&self) -> Scheme {
        Scheme::Sqlite
    }

    fn connect(&self, url: &Url) -> BackendResult<Box<dyn BackendConnection>> {
        let path = database_path(url);
        debug!("Opening SQLite database {}", path);
        let conn = if path == MEMORY_PATH {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(|e| BackendError::fatal(format!("cannot open '{}': {}", path, e)))?;

        conn.busy_timeout(BUSY_TIMEOUT)?;
        // Forces the file to be opened and read now rather than on first use
        conn.query_row("PRAGMA schema_version", [], |row| row.get::<_, i64>(0))
            .map_err(|e| BackendError::fatal(format!("cannot open '{}': {}", path, e)))?;
        apply_pragmas(&conn, url)?;

        Ok(Box::new(SqliteConnection::new(conn)))
    }
}

fn database_path(url: &Url) -> &str {
    match url.path() {
        "/:memory:" | MEMORY_PATH => MEMORY_PATH,
        path => path,
    }
}

fn is_pragma_token(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

fn apply_pragmas(conn: &Connection, url: &Url) -> BackendResult<()> {
    for (key, value) in url.parameters() {
        if key == "user" || key == "password" {
            continue;
        }
        if !is_pragma_token(key) || !is_pragma_token(value) {
            return Err(BackendError::new(format!(
                "invalid SQLite option '{}={}'",
                key, value
            )));
        }
        let sql = if key == "heap_limit" {
            let kb: i64 = value.parse().map_err(|_| {
                BackendError::new(format!("heap_limit must be a number, got '{}'", value))
            })?;
            let bytes = kb.checked_mul(1024).ok_or_else(|| {
                BackendError::new(format!("heap_limit {} KB is out of range", kb))
            })?;
            format!("PRAGMA soft_heap_limit = {}", bytes)
        } else {
            format!("PRAGMA {} = {}", key, value)
        };
        conn.execute_batch(&sql)?;
    }
    Ok(())
}

enum SessionState {
    Open(Connection),
    /// The connection is on loan to an open cursor
    Streaming,
    Closed,
}

/// State shared between a session and the statements prepared on it.
struct Session {
    state: SessionState,
    last_error: Option<String>,
    prefetch_rows: usize,
}

type SharedSession = Arc<Mutex<Session>>;

fn closed_error() -> BackendError {
    BackendError::fatal("database connection is closed")
}

fn with_session<T>(
    session: &SharedSession,
    f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
) -> BackendResult<T> {
    let mut guard = session.lock();
    let result = match &guard.state {
        SessionState::Open(conn) => f(conn).map_err(BackendError::from),
        SessionState::Streaming => Err(BackendError::new(BUSY_MESSAGE)),
        SessionState::Closed => Err(closed_error()),
    };
    if let Err(e) = &result {
        guard.last_error = Some(e.message.clone());
    }
    result
}

fn close_connection(conn: Connection) {
    if let Err((_, e)) = conn.close() {
        warn!("Error closing SQLite connection: {}", e);
    }
}

/// Hands a connection back from a cursor. If the session was closed while
/// the cursor held it, the connection is closed instead.
fn return_to_session(session: &SharedSession, conn: Connection, error: Option<&BackendError>) {
    let mut guard = session.lock();
    if let Some(e) = error {
        guard.last_error = Some(e.message.clone());
    }
    if matches!(guard.state, SessionState::Streaming) {
        guard.state = SessionState::Open(conn);
    } else {
        close_connection(conn);
    }
}

fn bind_all(stmt: &mut Statement<'_>, params: &[Value]) -> rusqlite::Result<()> {
    let expected = stmt.parameter_count();
    if params.len() > expected {
        return Err(rusqlite::Error::InvalidParameterCount(params.len(), expected));
    }
    for (i, value) in params.iter().enumerate() {
        stmt.raw_bind_parameter(i + 1, value)?;
    }
    Ok(())
}

fn run_execute(conn: &Connection, sql: &str, params: &[Value]) -> rusqlite::Result<ExecuteOutcome> {
    let mut stmt = conn.prepare_cached(sql)?;
    bind_all(&mut stmt, params)?;
    if stmt.column_count() > 0 {
        // Statements such as PRAGMA return rows; drain them
        let mut rows = stmt.raw_query();
        while rows.next()?.is_some() {}
        return Ok(ExecuteOutcome {
            rows_changed: 0,
            last_insert_id: conn.last_insert_rowid(),
        });
    }
    let changed = stmt.raw_execute()?;
    Ok(ExecuteOutcome {
        rows_changed: changed as i64,
        last_insert_id: conn.last_insert_rowid(),
    })
}

/// A connection on loan from its session, with a statement stepping over it.
#[self_referencing]
struct OpenQuery {
    conn: Connection,
    #[borrows(conn)]
    #[not_covariant]
    stmt: CachedStatement<'this>,
    #[borrows(mut stmt)]
    #[not_covariant]
    rows: Rows<'this>,
}

fn open_query(session: &SharedSession, sql: &str, params: &[Value]) -> BackendResult<SqliteCursor> {
    let (conn, prefetch_rows) = {
        let mut guard = session.lock();
        match std::mem::replace(&mut guard.state, SessionState::Streaming) {
            SessionState::Open(conn) => (conn, guard.prefetch_rows),
            other => {
                let err = match other {
                    SessionState::Closed => closed_error(),
                    _ => BackendError::new(BUSY_MESSAGE),
                };
                guard.state = other;
                guard.last_error = Some(err.message.clone());
                return Err(err);
            }
        }
    };

    let mut columns = Vec::new();
    let opened = OpenQuery::try_new_or_recover(
        conn,
        |conn| conn.prepare_cached(sql),
        |stmt| {
            bind_all(stmt, params)?;
            columns = stmt.column_names().into_iter().map(String::from).collect();
            Ok(stmt.raw_query())
        },
    );
    match opened {
        Ok(query) => Ok(SqliteCursor {
            session: Arc::clone(session),
            columns,
            query: Some(query),
            buffered: VecDeque::new(),
            pending_error: None,
            fetch_size: if prefetch_rows == 0 {
                DEFAULT_FETCH_SIZE
            } else {
                prefetch_rows
            },
        }),
        Err((e, heads)) => {
            let err = BackendError::from(e);
            return_to_session(session, heads.conn, Some(&err));
            Err(err)
        }
    }
}

fn step(rows: &mut Rows<'_>, width: usize) -> rusqlite::Result<Option<Vec<Value>>> {
    match rows.next()? {
        Some(row) => {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(from_value_ref(row.get_ref(i)?));
            }
            Ok(Some(values))
        }
        None => Ok(None),
    }
}

/// An open SQLite session.
pub struct SqliteConnection {
    session: SharedSession,
}

impl SqliteConnection {
    fn new(conn: Connection) -> Self {
        SqliteConnection {
            session: Arc::new(Mutex::new(Session {
                state: SessionState::Open(conn),
                last_error: None,
                prefetch_rows: 0,
            })),
        }
    }
}

impl BackendConnection for SqliteConnection {
    fn execute(&mut self, sql: &str, params: &[Value]) -> BackendResult<ExecuteOutcome> {
        with_session(&self.session, |conn| run_execute(conn, sql, params))
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> BackendResult<Box<dyn BackendCursor>> {
        Ok(Box::new(open_query(&self.session, sql, params)?))
    }

    fn prepare(&mut self, sql: &str) -> BackendResult<Box<dyn BackendStatement>> {
        let parameter_count =
            with_session(&self.session, |conn| Ok(conn.prepare_cached(sql)?.parameter_count()))?;
        Ok(Box::new(SqliteStatement {
            session: Arc::clone(&self.session),
            sql: sql.to_string(),
            params: vec![Value::Null; parameter_count],
        }))
    }

    fn begin(&mut self) -> BackendResult<()> {
        with_session(&self.session, |conn| conn.execute_batch("BEGIN TRANSACTION"))
    }

    fn commit(&mut self) -> BackendResult<()> {
        with_session(&self.session, |conn| conn.execute_batch("COMMIT TRANSACTION"))
    }

    fn rollback(&mut self) -> BackendResult<()> {
        with_session(&self.session, |conn| conn.execute_batch("ROLLBACK TRANSACTION"))
    }

    fn set_prefetch_rows(&mut self, rows: usize) {
        self.session.lock().prefetch_rows = rows;
    }

    fn ping(&mut self) -> bool {
        match &self.session.lock().state {
            SessionState::Open(conn) => conn.query_row("SELECT 1", [], |_| Ok(())).is_ok(),
            SessionState::Streaming => true,
            SessionState::Closed => false,
        }
    }

    fn last_error(&self) -> Option<String> {
        self.session.lock().last_error.clone()
    }

    fn close(&mut self) {
        let state = std::mem::replace(&mut self.session.lock().state, SessionState::Closed);
        // A streaming connection is closed by its cursor when handed back
        if let SessionState::Open(conn) = state {
            close_connection(conn);
        }
    }
}

impl Drop for SqliteConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// A statement compiled through the session's statement cache.
pub struct SqliteStatement {
    session: SharedSession,
    sql: String,
    params: Vec<Value>,
}

impl BackendStatement for SqliteStatement {
    fn parameter_count(&self) -> usize {
        self.params.len()
    }

    fn bind(&mut self, index: usize, value: &Value) -> BackendResult<()> {
        let count = self.params.len();
        let slot = index
            .checked_sub(1)
            .and_then(|i| self.params.get_mut(i))
            .ok_or_else(|| {
                BackendError::new(format!("parameter index {} out of range [1, {}]", index, count))
            })?;
        *slot = value.clone();
        Ok(())
    }

    fn execute(&mut self) -> BackendResult<ExecuteOutcome> {
        with_session(&self.session, |conn| run_execute(conn, &self.sql, &self.params))
    }

    fn query(&mut self) -> BackendResult<Box<dyn BackendCursor>> {
        Ok(Box::new(open_query(&self.session, &self.sql, &self.params)?))
    }
}

/// Rows of a query, stepped in batches of the fetch size.
///
/// A step error is held back until the rows stepped before it have been
/// handed out.
pub struct SqliteCursor {
    session: SharedSession,
    columns: Vec<String>,
    query: Option<OpenQuery>,
    buffered: VecDeque<Vec<Value>>,
    pending_error: Option<BackendError>,
    fetch_size: usize,
}

impl SqliteCursor {
    fn fill(&mut self) {
        let width = self.columns.len();
        let mut done = false;
        if let Some(query) = self.query.as_mut() {
            while self.buffered.len() < self.fetch_size {
                match query.with_rows_mut(|rows| step(rows, width)) {
                    Ok(Some(row)) => self.buffered.push_back(row),
                    Ok(None) => {
                        done = true;
                        break;
                    }
                    Err(e) => {
                        self.pending_error = Some(BackendError::from(e));
                        done = true;
                        break;
                    }
                }
            }
        }
        if done {
            self.release();
        }
    }

    fn release(&mut self) {
        if let Some(query) = self.query.take() {
            let conn = query.into_heads().conn;
            return_to_session(&self.session, conn, self.pending_error.as_ref());
        }
    }
}

impl BackendCursor for SqliteCursor {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn fetch_row(&mut self) -> BackendResult<Option<Vec<Value>>> {
        if self.buffered.is_empty() {
            self.fill();
        }
        match self.buffered.pop_front() {
            Some(row) => Ok(Some(row)),
            None => match self.pending_error.take() {
                Some(e) => Err(e),
                None => Ok(None),
            },
        }
    }

    fn set_fetch_size(&mut self, rows: usize) {
        self.fetch_size = rows.max(1);
    }

    fn finish(&mut self) {
        self.buffered.clear();
        self.release();
    }
}

impl Drop for SqliteCursor {
    fn drop(&mut self) {
        self.release();
    }
}
