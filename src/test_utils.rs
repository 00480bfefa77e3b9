/// # Test Utilities Module
///
/// Scripted in-memory backend for exercising the pool, connections,
/// statements and result sets without a database.
///
/// This module provides:
/// - [`MockDriver`], a driver whose sessions record what they were asked to do
/// - failure injection for connects, pings and statements
/// - [`mock_pool`], a pool wired to a mock driver
///
/// SQL text drives the mock sessions: a statement starting with `fail: `
/// fails with the rest of the text as its message, one starting with
/// `fatal: ` fails fatally. Everything else succeeds and changes one row.
use crate::core::backend::{
    BackendConnection, BackendCursor, BackendError, BackendResult, BackendStatement, Driver, ExecuteOutcome,
};
use crate::core::db::pool::{ConnectionPool, PoolConfig};
use crate::core::types::Value;
use crate::core::url::{Scheme, Url};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

#[derive(Default)]
struct MockState {
    connects: usize,
    open: usize,
    connect_limit: Option<usize>,
    dead: HashSet<usize>,
    executed: Vec<String>,
    bound: Vec<(usize, Value)>,
    rollbacks: usize,
    prefetch: usize,
    fetch_size: usize,
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
    last_row_id: i64,
}

/// Driver handing out scripted sessions. Clones share their state.
#[derive(Clone, Default)]
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows returned by every query.
    pub fn set_rows(&self, columns: &[&str], rows: Vec<Vec<Value>>) {
        let mut state = self.state.lock();
        state.columns = columns.iter().map(|c| c.to_string()).collect();
        state.rows = rows;
    }

    /// Lets `n` connects succeed in total; later ones fail.
    pub fn fail_connect_after(&self, n: usize) {
        self.state.lock().connect_limit = Some(n);
    }

    /// Makes every session opened so far fail its pings.
    pub fn kill_open_connections(&self) {
        let mut state = self.state.lock();
        let opened = state.connects;
        state.dead.extend(1..=opened);
    }

    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    /// Sessions opened and not yet closed.
    pub fn open_connections(&self) -> usize {
        self.state.lock().open
    }

    pub fn executed(&self) -> Vec<String> {
        self.state.lock().executed.clone()
    }

    pub fn bound(&self) -> Vec<(usize, Value)> {
        self.state.lock().bound.clone()
    }

    pub fn rollbacks(&self) -> usize {
        self.state.lock().rollbacks
    }

    pub fn prefetch(&self) -> usize {
        self.state.lock().prefetch
    }

    pub fn fetch_size(&self) -> usize {
        self.state.lock().fetch_size
    }
}

impl Driver for MockDriver {
    fn scheme(&self) -> Scheme {
        Scheme::Sqlite
    }

    fn connect(&self, _url: &Url) -> BackendResult<Box<dyn BackendConnection>> {
        let mut state = self.state.lock();
        if state.connect_limit.map_or(false, |limit| state.connects >= limit) {
            return Err(BackendError::fatal("unable to open database"));
        }
        state.connects += 1;
        state.open += 1;
        Ok(Box::new(MockConnection {
            id: state.connects,
            state: Arc::clone(&self.state),
            closed: false,
        }))
    }
}

/// Builds a stopped pool over `driver` with `config`.
pub fn mock_pool(driver: &MockDriver, config: PoolConfig) -> ConnectionPool {
    let url = Url::parse("sqlite:///tmp/mock.db").unwrap();
    let pool = ConnectionPool::with_driver(url, Arc::new(driver.clone())).unwrap();
    pool.configure(config);
    pool
}

fn scripted_failure(sql: &str) -> Option<BackendError> {
    if let Some(message) = sql.strip_prefix("fail: ") {
        Some(BackendError::new(message))
    } else {
        sql.strip_prefix("fatal: ").map(BackendError::fatal)
    }
}

fn run(state: &Mutex<MockState>, sql: &str) -> BackendResult<ExecuteOutcome> {
    if let Some(err) = scripted_failure(sql) {
        return Err(err);
    }
    let mut state = state.lock();
    state.executed.push(sql.to_string());
    state.last_row_id += 1;
    Ok(ExecuteOutcome {
        rows_changed: 1,
        last_insert_id: state.last_row_id,
    })
}

fn cursor(state: &Arc<Mutex<MockState>>, sql: &str) -> BackendResult<Box<dyn BackendCursor>> {
    if let Some(err) = scripted_failure(sql) {
        return Err(err);
    }
    let state_ref = state.lock();
    Ok(Box::new(MockCursor {
        columns: state_ref.columns.clone(),
        rows: state_ref.rows.iter().cloned().collect(),
        state: Arc::clone(state),
    }))
}

struct MockConnection {
    id: usize,
    state: Arc<Mutex<MockState>>,
    closed: bool,
}

impl BackendConnection for MockConnection {
    fn execute(&mut self, sql: &str, _params: &[Value]) -> BackendResult<ExecuteOutcome> {
        run(&self.state, sql)
    }

    fn query(&mut self, sql: &str, _params: &[Value]) -> BackendResult<Box<dyn BackendCursor>> {
        cursor(&self.state, sql)
    }

    fn prepare(&mut self, sql: &str) -> BackendResult<Box<dyn BackendStatement>> {
        if let Some(err) = scripted_failure(sql) {
            return Err(err);
        }
        Ok(Box::new(MockStatement {
            sql: sql.to_string(),
            parameter_count: sql.matches('?').count(),
            state: Arc::clone(&self.state),
        }))
    }

    fn begin(&mut self) -> BackendResult<()> {
        Ok(())
    }

    fn commit(&mut self) -> BackendResult<()> {
        Ok(())
    }

    fn rollback(&mut self) -> BackendResult<()> {
        self.state.lock().rollbacks += 1;
        Ok(())
    }

    fn set_prefetch_rows(&mut self, rows: usize) {
        self.state.lock().prefetch = rows;
    }

    fn ping(&mut self) -> bool {
        !self.closed && !self.state.lock().dead.contains(&self.id)
    }

    fn last_error(&self) -> Option<String> {
        None
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.lock().open -= 1;
        }
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.close();
    }
}

struct MockStatement {
    sql: String,
    parameter_count: usize,
    state: Arc<Mutex<MockState>>,
}

impl BackendStatement for MockStatement {
    fn parameter_count(&self) -> usize {
        self.parameter_count
    }

    fn bind(&mut self, index: usize, value: &Value) -> BackendResult<()> {
        self.state.lock().bound.push((index, value.clone()));
        Ok(())
    }

    fn execute(&mut self) -> BackendResult<ExecuteOutcome> {
        run(&self.state, &self.sql)
    }

    fn query(&mut self) -> BackendResult<Box<dyn BackendCursor>> {
        cursor(&self.state, &self.sql)
    }
}

struct MockCursor {
    columns: Vec<String>,
    rows: VecDeque<Vec<Value>>,
    state: Arc<Mutex<MockState>>,
}

impl BackendCursor for MockCursor {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn fetch_row(&mut self) -> BackendResult<Option<Vec<Value>>> {
        Ok(self.rows.pop_front())
    }

    fn set_fetch_size(&mut self, rows: usize) {
        self.state.lock().fetch_size = rows;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_limit() {
        let driver = MockDriver::new();
        driver.fail_connect_after(1);
        let url = Url::parse("sqlite:///tmp/mock.db").unwrap();
        let first = driver.connect(&url);
        assert!(first.is_ok());
        let err = driver.connect(&url).err().unwrap();
        assert!(err.fatal);
        drop(first);
        assert_eq!(driver.open_connections(), 0);
    }

    #[test]
    fn test_scripted_failures() {
        let driver = MockDriver::new();
        let url = Url::parse("sqlite:///tmp/mock.db").unwrap();
        let mut con = driver.connect(&url).unwrap();
        assert_eq!(con.execute("fail: boom", &[]).unwrap_err(), BackendError::new("boom"));
        assert!(con.execute("fatal: gone", &[]).unwrap_err().fatal);
        assert_eq!(con.execute("insert", &[]).unwrap().last_insert_id, 1);
    }
}
