use crate::error::Result;
use crate::schema::Schema;
use crate::value::{RawRow, SqlValue};
use async_trait::async_trait;

/// SQL text plus its bound parameters, in storage form.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<SqlValue>,
    /// Fetch the rows the statement produces (SELECT, RETURNING).
    pub returning: bool,
}

impl SqlStatement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            returning: false,
        }
    }

    pub fn with_params(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
            returning: false,
        }
    }

    pub fn returning(mut self, returning: bool) -> Self {
        self.returning = returning;
        self
    }
}

/// Result of executing one statement on the write handle.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExecOutcome {
    pub rows_affected: u64,
    /// Rowid of the last inserted row, when the engine reports one.
    pub last_insert_id: Option<i64>,
    /// Rows produced by a `RETURNING` clause.
    pub rows: Vec<RawRow>,
}

/// Storage engine behind the execution layer.
///
/// `query` runs on the read handle and may be called concurrently. Every
/// other operation touches the write handle; callers serialize them through
/// the executor's writer lock, backends do not lock on their own.
#[async_trait]
pub trait DatabaseBackend: Send + Sync {
    /// Run a read-only statement and return its rows.
    async fn query(&self, statement: &SqlStatement) -> Result<Vec<RawRow>>;

    /// Run one mutating statement.
    async fn execute(&self, statement: &SqlStatement) -> Result<ExecOutcome>;

    /// Run all statements inside a single transaction. Nothing is applied if
    /// any statement fails.
    async fn execute_batch(&self, statements: &[SqlStatement]) -> Result<Vec<ExecOutcome>>;

    /// Open a transaction on a reserved write connection.
    async fn begin(&self) -> Result<Box<dyn BackendTransaction>>;

    /// Compile `sql` without running it.
    async fn prepare(&self, sql: &str) -> Result<()>;

    /// Read the live schema.
    async fn introspect(&self) -> Result<Schema>;

    /// Apply migration DDL atomically.
    async fn apply_migration(&self, statements: &[String]) -> Result<()> {
        let statements: Vec<SqlStatement> = statements.iter().map(SqlStatement::new).collect();
        self.execute_batch(&statements).await?;
        Ok(())
    }

    /// Check if connected
    fn is_connected(&self) -> bool;

    /// Close every connection. Later calls fail.
    async fn close(&self) -> Result<()>;
}

/// Open transaction on a backend connection.
///
/// Dropping it without `commit` rolls the transaction back.
#[async_trait]
pub trait BackendTransaction: Send {
    async fn query(&mut self, statement: &SqlStatement) -> Result<Vec<RawRow>>;

    async fn execute(&mut self, statement: &SqlStatement) -> Result<ExecOutcome>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory recording backend for tests that only observe SQL traffic.

    use super::*;
    use crate::error::OrmError;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    pub(crate) struct Recorded {
        pub statements: Vec<SqlStatement>,
        pub batches: usize,
        pub fail_on: Option<String>,
    }

    #[derive(Debug, Default, Clone)]
    pub(crate) struct MockBackend {
        pub recorded: Arc<Mutex<Recorded>>,
    }

    impl MockBackend {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        /// Fail any statement whose SQL contains `needle`.
        pub(crate) fn fail_on(&self, needle: &str) {
            self.recorded.lock().unwrap().fail_on = Some(needle.to_string());
        }

        pub(crate) fn sql(&self) -> Vec<String> {
            self.recorded
                .lock()
                .unwrap()
                .statements
                .iter()
                .map(|s| s.sql.clone())
                .collect()
        }

        fn record(&self, statement: &SqlStatement) -> Result<ExecOutcome> {
            let mut recorded = self.recorded.lock().unwrap();
            if let Some(needle) = &recorded.fail_on {
                if statement.sql.contains(needle.as_str()) {
                    return Err(OrmError::Execution {
                        message: format!("rejected: {}", statement.sql),
                        code: None,
                    });
                }
            }
            recorded.statements.push(statement.clone());
            Ok(ExecOutcome {
                rows_affected: 1,
                last_insert_id: Some(recorded.statements.len() as i64),
                rows: Vec::new(),
            })
        }
    }

    pub(crate) struct MockTransaction {
        backend: MockBackend,
        pending: Vec<SqlStatement>,
    }

    #[async_trait]
    impl BackendTransaction for MockTransaction {
        async fn query(&mut self, _statement: &SqlStatement) -> Result<Vec<RawRow>> {
            Ok(Vec::new())
        }

        async fn execute(&mut self, statement: &SqlStatement) -> Result<ExecOutcome> {
            let fail = self.backend.recorded.lock().unwrap().fail_on.clone();
            if let Some(needle) = fail {
                if statement.sql.contains(needle.as_str()) {
                    return Err(OrmError::Execution {
                        message: format!("rejected: {}", statement.sql),
                        code: None,
                    });
                }
            }
            self.pending.push(statement.clone());
            Ok(ExecOutcome {
                rows_affected: 1,
                ..Default::default()
            })
        }

        async fn commit(self: Box<Self>) -> Result<()> {
            let MockTransaction { backend, pending } = *self;
            backend.recorded.lock().unwrap().statements.extend(pending);
            Ok(())
        }

        async fn rollback(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl DatabaseBackend for MockBackend {
        async fn query(&self, _statement: &SqlStatement) -> Result<Vec<RawRow>> {
            Ok(Vec::new())
        }

        async fn execute(&self, statement: &SqlStatement) -> Result<ExecOutcome> {
            self.record(statement)
        }

        async fn execute_batch(&self, statements: &[SqlStatement]) -> Result<Vec<ExecOutcome>> {
            let mut tx = MockTransaction {
                backend: self.clone(),
                pending: Vec::new(),
            };
            let mut outcomes = Vec::with_capacity(statements.len());
            for statement in statements {
                outcomes.push(tx.execute(statement).await?);
            }
            self.recorded.lock().unwrap().batches += 1;
            Box::new(tx).commit().await?;
            Ok(outcomes)
        }

        async fn begin(&self) -> Result<Box<dyn BackendTransaction>> {
            Ok(Box::new(MockTransaction {
                backend: self.clone(),
                pending: Vec::new(),
            }))
        }

        async fn prepare(&self, _sql: &str) -> Result<()> {
            Ok(())
        }

        async fn introspect(&self) -> Result<Schema> {
            Ok(Schema::new())
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockBackend;
    use super::*;

    #[tokio::test]
    async fn test_default_apply_migration_runs_one_batch() {
        let backend = MockBackend::new();
        backend
            .apply_migration(&["CREATE TABLE a (x TEXT)".to_string(), "DROP TABLE b".to_string()])
            .await
            .unwrap();
        assert_eq!(backend.sql(), vec!["CREATE TABLE a (x TEXT)", "DROP TABLE b"]);
        assert_eq!(backend.recorded.lock().unwrap().batches, 1);
    }

    #[tokio::test]
    async fn test_failed_batch_applies_nothing() {
        let backend = MockBackend::new();
        backend.fail_on("DROP");
        let statements = vec![SqlStatement::new("CREATE TABLE a (x TEXT)"), SqlStatement::new("DROP TABLE b")];
        assert!(backend.execute_batch(&statements).await.is_err());
        assert!(backend.sql().is_empty());
    }
}
