/// Prepared Statement Module
///
/// A [`PreparedStatement`] is compiled once and executed any number of
/// times with different parameter values. Parameters use 1-based indexes
/// that match the `?` placeholders of the SQL text. Bound values persist
/// across executions until they are replaced or cleared.
use crate::core::backend::{BackendResult, BackendStatement};
use crate::core::db::connection::Connection;
use crate::core::db::result_set::ResultSet;
use crate::core::types::Value;
use crate::core::{DbError, Result};
use std::fmt;

pub struct PreparedStatement<'c> {
    connection: &'c Connection,
    sql: String,
    statement: Box<dyn BackendStatement>,
    parameters: Vec<Value>,
    rows_changed: i64,
}

impl<'c> PreparedStatement<'c> {
    pub(crate) fn new(connection: &'c Connection, sql: &str, statement: Box<dyn BackendStatement>) -> Self {
        let count = statement.parameter_count();
        PreparedStatement {
            connection,
            sql: sql.to_string(),
            statement,
            parameters: vec![Value::Null; count],
            rows_changed: 0,
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Number of `?` placeholders in the statement.
    pub fn parameter_count(&self) -> usize {
        self.parameters.len()
    }

    /// Binds `value` to the 1-based parameter `index`.
    ///
    /// # Errors
    ///
    /// Returns `DbError::ParameterIndex` if `index` is outside
    /// `1..=parameter_count()`. Nothing is sent to the backend.
    pub fn set_value(&mut self, index: usize, value: impl Into<Value>) -> Result<()> {
        let count = self.parameters.len();
        match index.checked_sub(1).and_then(|i| self.parameters.get_mut(i)) {
            Some(slot) => {
                *slot = value.into();
                Ok(())
            }
            None => Err(DbError::ParameterIndex { index, count }),
        }
    }

    /// Binds text. `None` binds SQL NULL.
    pub fn set_string(&mut self, index: usize, value: Option<&str>) -> Result<()> {
        self.set_value(index, value)
    }

    pub fn set_int(&mut self, index: usize, value: i32) -> Result<()> {
        self.set_value(index, value)
    }

    pub fn set_long(&mut self, index: usize, value: i64) -> Result<()> {
        self.set_value(index, value)
    }

    pub fn set_double(&mut self, index: usize, value: f64) -> Result<()> {
        self.set_value(index, value)
    }

    /// Binds bytes. `None` binds SQL NULL.
    pub fn set_blob(&mut self, index: usize, value: Option<&[u8]>) -> Result<()> {
        self.set_value(index, value)
    }

    /// Binds epoch seconds as a timestamp.
    pub fn set_timestamp(&mut self, index: usize, value: i64) -> Result<()> {
        self.set_value(index, Value::Timestamp(value))
    }

    pub fn set_null(&mut self, index: usize) -> Result<()> {
        self.set_value(index, Value::Null)
    }

    /// Resets every parameter to NULL.
    pub fn clear_parameters(&mut self) {
        self.parameters.iter_mut().for_each(|p| *p = Value::Null);
    }

    /// Executes the statement with the current parameters.
    ///
    /// Updates both this statement's and the connection's row counters.
    pub fn execute(&mut self) -> Result<()> {
        let connection = self.connection;
        connection.trace(&self.sql);
        let statement = &mut self.statement;
        let parameters = &self.parameters;
        let outcome = connection.with_backend(|_| {
            bind_parameters(statement.as_mut(), parameters)?;
            statement.execute()
        })?;
        self.rows_changed = outcome.rows_changed;
        connection.record_outcome(outcome);
        Ok(())
    }

    /// Executes the statement as a query.
    ///
    /// The result set borrows the connection, not the statement, so the
    /// statement can be rebound and executed again while it is open.
    pub fn execute_query(&mut self) -> Result<ResultSet<'c>> {
        let connection = self.connection;
        connection.trace(&self.sql);
        let statement = &mut self.statement;
        let parameters = &self.parameters;
        let cursor = connection.with_backend(|_| {
            bind_parameters(statement.as_mut(), parameters)?;
            statement.query()
        })?;
        Ok(ResultSet::new(connection, cursor))
    }

    /// Rows changed by the last `execute` of this statement.
    pub fn rows_changed(&self) -> i64 {
        self.rows_changed
    }
}

fn bind_parameters(statement: &mut dyn BackendStatement, parameters: &[Value]) -> BackendResult<()> {
    for (i, value) in parameters.iter().enumerate() {
        statement.bind(i + 1, value)?;
    }
    Ok(())
}

impl fmt::Debug for PreparedStatement<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedStatement")
            .field("sql", &self.sql)
            .field("parameters", &self.parameters)
            .field("rows_changed", &self.rows_changed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::core::db::pool::PoolConfig;
    use crate::core::{DbError, ErrorKind};
    use crate::test_utils::{mock_pool, MockDriver};

    #[test]
    fn test_parameter_index_checked_locally() {
        let driver = MockDriver::new();
        let pool = mock_pool(&driver, PoolConfig::new(1, 1));
        pool.start().unwrap();
        let con = pool.get_connection().unwrap();
        let mut stmt = con.prepare_statement("insert into t values (?, ?)").unwrap();

        assert_eq!(stmt.parameter_count(), 2);
        assert!(stmt.set_int(1, 7).is_ok());
        assert!(stmt.set_string(2, Some("x")).is_ok());
        let err = stmt.set_int(3, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParameterIndex);
        assert!(matches!(stmt.set_null(0), Err(DbError::ParameterIndex { index: 0, count: 2 })));
    }

    #[test]
    fn test_execute_binds_all_parameters() {
        let driver = MockDriver::new();
        let pool = mock_pool(&driver, PoolConfig::new(1, 1));
        pool.start().unwrap();
        let con = pool.get_connection().unwrap();
        let mut stmt = con.prepare_statement("update t set a = ? where b = ?").unwrap();
        stmt.set_long(1, 42).unwrap();
        stmt.set_blob(2, None).unwrap();
        stmt.execute().unwrap();

        assert_eq!(stmt.rows_changed(), 1);
        assert_eq!(con.rows_changed(), 1);
        let bound = driver.bound();
        assert_eq!(bound.len(), 2);
        assert_eq!(bound[0], (1, crate::core::types::Value::Int(42)));
        assert_eq!(bound[1], (2, crate::core::types::Value::Null));
    }
}
