//! Execution layer.
//!
//! Reads go straight to the backend's read handle. Every write, DDL
//! statement, transaction and batch commit first takes the [`WriterLock`],
//! so at most one of them is in flight per [`Executor`]. Waiting on the lock
//! is latency, never an error.

use crate::backend::{BackendTransaction, DatabaseBackend, ExecOutcome, SqlStatement};
use crate::builder::Insert;
use crate::compiler::{CompiledQuery, QueryCompiler};
use crate::error::{OrmError, Result};
use crate::mapper::ResultMapper;
use crate::migration::{MigrateOptions, MigrationPlan};
use crate::schema::Schema;
use crate::value::MappedRow;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Serializes writers. Waiters are granted the lock in arrival order.
#[derive(Debug, Clone, Default)]
pub struct WriterLock {
    inner: Arc<Mutex<()>>,
}

/// Held for the duration of one write.
pub type WriterGuard = OwnedMutexGuard<()>;

impl WriterLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self) -> WriterGuard {
        if let Ok(guard) = self.inner.clone().try_lock_owned() {
            return guard;
        }
        let started = Instant::now();
        let guard = self.inner.clone().lock_owned().await;
        debug!(
            waited_ms = started.elapsed().as_millis() as u64,
            "writer lock acquired after wait"
        );
        guard
    }

    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

/// Transaction life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Active,
    /// Statements are recorded, not run.
    Batching,
    Committed,
    RolledBack,
}

impl TransactionState {
    pub fn is_finished(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::RolledBack)
    }
}

/// Outcome of a mutating statement, with mapped `RETURNING` rows.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WriteResult {
    pub rows_affected: u64,
    pub last_insert_id: Option<i64>,
    pub rows: Vec<MappedRow>,
}

impl WriteResult {
    fn merge(results: impl IntoIterator<Item = WriteResult>) -> WriteResult {
        results.into_iter().fold(WriteResult::default(), |mut acc, r| {
            acc.rows_affected += r.rows_affected;
            acc.last_insert_id = r.last_insert_id.or(acc.last_insert_id);
            acc.rows.extend(r.rows);
            acc
        })
    }
}

fn to_statement(mapper: &ResultMapper, query: &CompiledQuery) -> Result<SqlStatement> {
    Ok(SqlStatement {
        sql: query.sql.clone(),
        params: mapper.registry().params(&query.params)?,
        returning: query.returning,
    })
}

fn to_result(mapper: &ResultMapper, outcome: ExecOutcome, query: &CompiledQuery) -> Result<WriteResult> {
    Ok(WriteResult {
        rows_affected: outcome.rows_affected,
        last_insert_id: outcome.last_insert_id,
        rows: mapper.map_rows(outcome.rows, query)?,
    })
}

/// Statements for an insert: one JSON-array statement when the rows allow
/// it, one statement per row otherwise.
pub(crate) fn plan_insert(
    compiler: &QueryCompiler<'_>,
    insert: &Insert,
    mapper: &ResultMapper,
    bulk_threshold: usize,
) -> Result<Vec<CompiledQuery>> {
    if insert.rows.len() >= bulk_threshold.max(1) && !mapper.registry().is_customized() {
        if let Some(bulk) = compiler.compile_bulk_insert(insert)? {
            debug!(table = %insert.table, rows = insert.rows.len(), "bulk insert");
            return Ok(vec![bulk]);
        }
    }
    compiler.compile_insert(insert)
}

/// Owns the backend and the writer lock shared by everything it opens.
#[derive(Clone)]
pub struct Executor {
    backend: Arc<dyn DatabaseBackend>,
    lock: WriterLock,
    mapper: Arc<ResultMapper>,
    bulk_threshold: usize,
}

impl Executor {
    pub fn new(backend: Arc<dyn DatabaseBackend>) -> Self {
        Self {
            backend,
            lock: WriterLock::new(),
            mapper: Arc::new(ResultMapper::default()),
            bulk_threshold: 2,
        }
    }

    pub fn with_bulk_threshold(mut self, rows: usize) -> Self {
        self.bulk_threshold = rows;
        self
    }

    pub fn backend(&self) -> &Arc<dyn DatabaseBackend> {
        &self.backend
    }

    pub fn writer_lock(&self) -> &WriterLock {
        &self.lock
    }

    pub fn mapper(&self) -> &ResultMapper {
        &self.mapper
    }

    /// Transactions and batches already open keep the mapper they started
    /// with.
    pub fn mapper_mut(&mut self) -> &mut ResultMapper {
        Arc::make_mut(&mut self.mapper)
    }

    pub async fn read(&self, query: &CompiledQuery) -> Result<Vec<MappedRow>> {
        let statement = to_statement(&self.mapper, query)?;
        let rows = self.backend.query(&statement).await?;
        self.mapper.map_rows(rows, query)
    }

    pub async fn write(&self, query: &CompiledQuery) -> Result<WriteResult> {
        let statement = to_statement(&self.mapper, query)?;
        let outcome = {
            let _guard = self.lock.acquire().await;
            self.backend.execute(&statement).await?
        };
        to_result(&self.mapper, outcome, query)
    }

    /// Run all queries in one transaction under one lock acquisition.
    pub async fn write_all(&self, queries: &[CompiledQuery]) -> Result<Vec<WriteResult>> {
        match queries {
            [] => Ok(Vec::new()),
            [only] => Ok(vec![self.write(only).await?]),
            _ => {
                let statements = queries
                    .iter()
                    .map(|q| to_statement(&self.mapper, q))
                    .collect::<Result<Vec<_>>>()?;
                let outcomes = {
                    let _guard = self.lock.acquire().await;
                    self.backend.execute_batch(&statements).await?
                };
                outcomes
                    .into_iter()
                    .zip(queries)
                    .map(|(outcome, query)| to_result(&self.mapper, outcome, query))
                    .collect()
            }
        }
    }

    pub async fn insert(&self, compiler: &QueryCompiler<'_>, insert: &Insert) -> Result<WriteResult> {
        let queries = plan_insert(compiler, insert, &self.mapper, self.bulk_threshold)?;
        Ok(WriteResult::merge(self.write_all(&queries).await?))
    }

    /// Apply a plan atomically, refusing unacknowledged destructive steps.
    pub async fn migrate(&self, plan: &MigrationPlan, options: &MigrateOptions) -> Result<()> {
        plan.check(options)?;
        if plan.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.acquire().await;
        info!(
            steps = plan.len(),
            rebuild = plan.requires_rebuild(),
            destructive = plan.is_destructive(),
            "applying migration"
        );
        self.backend.apply_migration(&plan.statements()).await
    }

    pub async fn introspect(&self) -> Result<Schema> {
        self.backend.introspect().await
    }

    pub async fn prepare(&self, sql: &str) -> Result<()> {
        self.backend.prepare(sql).await
    }

    /// Open a transaction; it holds the writer lock until it finishes.
    pub async fn begin(&self) -> Result<Transaction> {
        let guard = self.lock.acquire().await;
        let mut tx = Transaction {
            inner: None,
            state: TransactionState::Idle,
            mapper: self.mapper.clone(),
            guard: Some(guard),
            bulk_threshold: self.bulk_threshold,
        };
        tx.inner = Some(self.backend.begin().await?);
        tx.state = TransactionState::Active;
        debug!("transaction started");
        Ok(tx)
    }

    pub fn batch(&self) -> Batch {
        Batch {
            executor: self.clone(),
            queries: Vec::new(),
            state: TransactionState::Batching,
        }
    }
}

/// Transaction bound to one reserved write connection.
///
/// An execution error rolls it back on the spot; later calls fail with
/// [`OrmError::Transaction`]. Dropping an active transaction rolls it back.
pub struct Transaction {
    inner: Option<Box<dyn BackendTransaction>>,
    state: TransactionState,
    mapper: Arc<ResultMapper>,
    guard: Option<WriterGuard>,
    bulk_threshold: usize,
}

impl Transaction {
    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state {
            TransactionState::Active => Ok(()),
            state => Err(OrmError::Transaction(format!(
                "transaction is {:?}, not active",
                state
            ))),
        }
    }

    async fn abort(&mut self, err: OrmError) -> OrmError {
        if let Some(tx) = self.inner.take() {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "rollback failed");
            }
        }
        self.state = TransactionState::RolledBack;
        self.guard = None;
        warn!(error = %err, "transaction rolled back after error");
        err
    }

    pub async fn read(&mut self, query: &CompiledQuery) -> Result<Vec<MappedRow>> {
        self.ensure_active()?;
        let statement = to_statement(&self.mapper, query)?;
        let result = match self.inner.as_mut() {
            Some(tx) => tx.query(&statement).await,
            None => return Err(OrmError::Transaction("transaction has no connection".into())),
        };
        match result {
            Ok(rows) => self.mapper.map_rows(rows, query),
            Err(err) => Err(self.abort(err).await),
        }
    }

    pub async fn write(&mut self, query: &CompiledQuery) -> Result<WriteResult> {
        self.ensure_active()?;
        let statement = to_statement(&self.mapper, query)?;
        let result = match self.inner.as_mut() {
            Some(tx) => tx.execute(&statement).await,
            None => return Err(OrmError::Transaction("transaction has no connection".into())),
        };
        match result {
            Ok(outcome) => to_result(&self.mapper, outcome, query),
            Err(err) => Err(self.abort(err).await),
        }
    }

    pub async fn insert(&mut self, compiler: &QueryCompiler<'_>, insert: &Insert) -> Result<WriteResult> {
        self.ensure_active()?;
        let queries = plan_insert(compiler, insert, &self.mapper, self.bulk_threshold)?;
        let mut results = Vec::with_capacity(queries.len());
        for query in &queries {
            results.push(self.write(query).await?);
        }
        Ok(WriteResult::merge(results))
    }

    pub async fn commit(mut self) -> Result<()> {
        self.ensure_active()?;
        let tx = self
            .inner
            .take()
            .ok_or_else(|| OrmError::Transaction("transaction has no connection".into()))?;
        let result = tx.commit().await;
        self.guard = None;
        match result {
            Ok(()) => {
                self.state = TransactionState::Committed;
                debug!("transaction committed");
                Ok(())
            }
            Err(err) => {
                self.state = TransactionState::RolledBack;
                warn!(error = %err, "commit failed");
                Err(err)
            }
        }
    }

    pub async fn rollback(mut self) -> Result<()> {
        self.ensure_active()?;
        self.state = TransactionState::RolledBack;
        let result = match self.inner.take() {
            Some(tx) => tx.rollback().await,
            None => Ok(()),
        };
        self.guard = None;
        debug!("transaction rolled back");
        result
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TransactionState::Active {
            // The backend rolls back when its transaction is dropped.
            warn!("transaction dropped while active, rolling back");
        }
    }
}

/// Deferred statement group. Recording holds neither the writer lock nor a
/// connection; `commit` runs everything in one transaction.
pub struct Batch {
    executor: Executor,
    queries: Vec<CompiledQuery>,
    state: TransactionState,
}

impl Batch {
    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn push(&mut self, query: CompiledQuery) {
        self.queries.push(query);
    }

    pub fn extend(&mut self, queries: impl IntoIterator<Item = CompiledQuery>) {
        self.queries.extend(queries);
    }

    /// Record an insert, collapsed into one statement where possible.
    pub fn insert(&mut self, compiler: &QueryCompiler<'_>, insert: &Insert) -> Result<()> {
        let queries = plan_insert(
            compiler,
            insert,
            &self.executor.mapper,
            self.executor.bulk_threshold,
        )?;
        self.queries.extend(queries);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn queries(&self) -> &[CompiledQuery] {
        &self.queries
    }

    pub async fn commit(mut self) -> Result<Vec<WriteResult>> {
        let queries = std::mem::take(&mut self.queries);
        match self.executor.write_all(&queries).await {
            Ok(results) => {
                self.state = TransactionState::Committed;
                debug!(statements = queries.len(), "batch committed");
                Ok(results)
            }
            Err(err) => {
                self.state = TransactionState::RolledBack;
                warn!(error = %err, statements = queries.len(), "batch rolled back");
                Err(err)
            }
        }
    }

    /// Drop every recorded statement.
    pub fn discard(mut self) {
        self.queries.clear();
        self.state = TransactionState::RolledBack;
    }
}
