//! Remote-sync backend.
//!
//! [`RemoteSyncBackend`] serves every call from a local replica and journals
//! each committed write. [`RemoteSyncBackend::sync`] replays the journal on
//! the remote backend, one committed unit at a time, each unit in its own
//! remote transaction. The remote is assumed to be written only through
//! this replica, so replayed inserts produce the same keys.

use crate::backend::{BackendTransaction, DatabaseBackend, ExecOutcome, SqlStatement};
use crate::error::{OrmError, Result};
use crate::schema::Schema;
use crate::value::RawRow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// One committed unit of local writes.
#[derive(Debug, Clone, PartialEq)]
pub enum JournalEntry {
    Statements(Vec<SqlStatement>),
    Migration(Vec<String>),
}

impl JournalEntry {
    pub fn len(&self) -> usize {
        match self {
            JournalEntry::Statements(s) => s.len(),
            JournalEntry::Migration(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Configuration for remote sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Retries per journal entry after a connection failure
    pub max_retries: usize,
    /// Delay before the first retry; doubles on each further retry
    pub retry_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 100,
        }
    }
}

/// What one `sync` call pushed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub entries: usize,
    pub statements: usize,
    /// Retries spent on connection failures.
    pub retries: usize,
}

type Journal = Arc<Mutex<Vec<JournalEntry>>>;

/// Local replica plus a journal of writes still to push to `remote`.
pub struct RemoteSyncBackend<L, R> {
    local: L,
    remote: R,
    journal: Journal,
    sync_lock: Mutex<()>,
    config: SyncConfig,
}

impl<L: DatabaseBackend, R: DatabaseBackend> RemoteSyncBackend<L, R> {
    pub fn new(local: L, remote: R) -> Self {
        Self::with_config(local, remote, SyncConfig::default())
    }

    pub fn with_config(local: L, remote: R, config: SyncConfig) -> Self {
        Self {
            local,
            remote,
            journal: Arc::new(Mutex::new(Vec::new())),
            sync_lock: Mutex::new(()),
            config,
        }
    }

    pub fn local(&self) -> &L {
        &self.local
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Number of journaled units not yet pushed.
    pub async fn pending(&self) -> usize {
        self.journal.lock().await.len()
    }

    async fn record(&self, entry: JournalEntry) {
        if !entry.is_empty() {
            self.journal.lock().await.push(entry);
        }
    }

    async fn push(&self, entry: &JournalEntry) -> Result<()> {
        match entry {
            JournalEntry::Statements(statements) => {
                self.remote.execute_batch(statements).await?;
            }
            JournalEntry::Migration(statements) => {
                self.remote.apply_migration(statements).await?;
            }
        }
        Ok(())
    }

    async fn push_with_retry(&self, entry: &JournalEntry, report: &mut SyncReport) -> Result<()> {
        let mut delay = Duration::from_millis(self.config.retry_delay_ms);
        let mut attempt = 0;
        loop {
            match self.push(entry).await {
                Ok(()) => return Ok(()),
                Err(OrmError::Connection(msg)) if attempt < self.config.max_retries => {
                    attempt += 1;
                    report.retries += 1;
                    warn!(attempt, error = %msg, "remote unreachable, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Push the journal to the remote. Entries are removed only once the
    /// remote has committed them; a failure leaves the rest in place.
    pub async fn sync(&self) -> Result<SyncReport> {
        let _guard = self.sync_lock.lock().await;
        let snapshot: Vec<JournalEntry> = self.journal.lock().await.clone();
        let mut report = SyncReport::default();
        if snapshot.is_empty() {
            return Ok(report);
        }

        info!(entries = snapshot.len(), "syncing to remote");
        for entry in &snapshot {
            if let Err(err) = self.push_with_retry(entry, &mut report).await {
                warn!(
                    pushed = report.entries,
                    remaining = snapshot.len() - report.entries,
                    error = %err,
                    "sync failed"
                );
                return Err(OrmError::Sync(format!(
                    "pushed {} of {} journal entries: {}",
                    report.entries,
                    snapshot.len(),
                    err
                )));
            }
            // Concurrent writers only append, so the pushed entry is first.
            self.journal.lock().await.remove(0);
            report.entries += 1;
            report.statements += entry.len();
        }
        debug!(
            entries = report.entries,
            statements = report.statements,
            "sync complete"
        );
        Ok(report)
    }
}

/// Transaction on the local replica; journaled when it commits.
struct SyncTransaction {
    inner: Box<dyn BackendTransaction>,
    recorded: Vec<SqlStatement>,
    journal: Journal,
}

#[async_trait]
impl BackendTransaction for SyncTransaction {
    async fn query(&mut self, statement: &SqlStatement) -> Result<Vec<RawRow>> {
        self.inner.query(statement).await
    }

    async fn execute(&mut self, statement: &SqlStatement) -> Result<ExecOutcome> {
        let outcome = self.inner.execute(statement).await?;
        self.recorded.push(statement.clone());
        Ok(outcome)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let SyncTransaction {
            inner,
            recorded,
            journal,
        } = *self;
        inner.commit().await?;
        if !recorded.is_empty() {
            journal.lock().await.push(JournalEntry::Statements(recorded));
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.inner.rollback().await
    }
}

#[async_trait]
impl<L, R> DatabaseBackend for RemoteSyncBackend<L, R>
where
    L: DatabaseBackend + 'static,
    R: DatabaseBackend + 'static,
{
    async fn query(&self, statement: &SqlStatement) -> Result<Vec<RawRow>> {
        self.local.query(statement).await
    }

    async fn execute(&self, statement: &SqlStatement) -> Result<ExecOutcome> {
        let outcome = self.local.execute(statement).await?;
        self.record(JournalEntry::Statements(vec![statement.clone()])).await;
        Ok(outcome)
    }

    async fn execute_batch(&self, statements: &[SqlStatement]) -> Result<Vec<ExecOutcome>> {
        let outcomes = self.local.execute_batch(statements).await?;
        self.record(JournalEntry::Statements(statements.to_vec())).await;
        Ok(outcomes)
    }

    async fn begin(&self) -> Result<Box<dyn BackendTransaction>> {
        Ok(Box::new(SyncTransaction {
            inner: self.local.begin().await?,
            recorded: Vec::new(),
            journal: self.journal.clone(),
        }))
    }

    async fn prepare(&self, sql: &str) -> Result<()> {
        self.local.prepare(sql).await
    }

    async fn introspect(&self) -> Result<Schema> {
        self.local.introspect().await
    }

    async fn apply_migration(&self, statements: &[String]) -> Result<()> {
        self.local.apply_migration(statements).await?;
        self.record(JournalEntry::Migration(statements.to_vec())).await;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.local.is_connected()
    }

    async fn close(&self) -> Result<()> {
        self.local.close().await?;
        self.remote.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;

    fn backend() -> (MockBackend, RemoteSyncBackend<MockBackend, MockBackend>) {
        let remote = MockBackend::new();
        let sync = RemoteSyncBackend::with_config(
            MockBackend::new(),
            remote.clone(),
            SyncConfig {
                max_retries: 0,
                retry_delay_ms: 1,
            },
        );
        (remote, sync)
    }

    #[tokio::test]
    async fn test_writes_are_journaled_until_sync() {
        let (remote, sync) = backend();
        sync.execute(&SqlStatement::new("INSERT INTO t DEFAULT VALUES"))
            .await
            .unwrap();
        sync.apply_migration(&["CREATE INDEX i ON t (x)".to_string()])
            .await
            .unwrap();
        sync.query(&SqlStatement::new("SELECT 1")).await.unwrap();

        assert_eq!(sync.pending().await, 2);
        assert!(remote.sql().is_empty());

        let report = sync.sync().await.unwrap();
        assert_eq!(report.entries, 2);
        assert_eq!(report.statements, 2);
        assert_eq!(sync.pending().await, 0);
        assert_eq!(remote.sql(), vec!["INSERT INTO t DEFAULT VALUES", "CREATE INDEX i ON t (x)"]);
    }

    #[tokio::test]
    async fn test_failed_push_keeps_journal() {
        let (remote, sync) = backend();
        sync.execute(&SqlStatement::new("INSERT INTO a DEFAULT VALUES")).await.unwrap();
        sync.execute(&SqlStatement::new("INSERT INTO b DEFAULT VALUES")).await.unwrap();

        remote.fail_on("INTO b");
        let err = sync.sync().await.unwrap_err();
        assert!(matches!(err, OrmError::Sync(_)));
        assert_eq!(sync.pending().await, 1);
        assert_eq!(remote.sql(), vec!["INSERT INTO a DEFAULT VALUES"]);

        remote.recorded.lock().unwrap().fail_on = None;
        let report = sync.sync().await.unwrap();
        assert_eq!(report.entries, 1);
        assert_eq!(remote.sql().len(), 2);
    }

    #[tokio::test]
    async fn test_transactions_journal_on_commit_only() {
        let (_remote, sync) = backend();
        let mut tx = sync.begin().await.unwrap();
        tx.execute(&SqlStatement::new("INSERT INTO t DEFAULT VALUES")).await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(sync.pending().await, 0);

        let mut tx = sync.begin().await.unwrap();
        tx.execute(&SqlStatement::new("INSERT INTO t DEFAULT VALUES")).await.unwrap();
        tx.execute(&SqlStatement::new("UPDATE t SET x = 1")).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(sync.pending().await, 1);
        let report = sync.sync().await.unwrap();
        assert_eq!(report.statements, 2);
    }

    #[tokio::test]
    async fn test_empty_sync_is_a_no_op() {
        let (_remote, sync) = backend();
        assert_eq!(sync.sync().await.unwrap(), SyncReport::default());
    }
}
