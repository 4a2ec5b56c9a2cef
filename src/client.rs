//! Client operation surface.
//!
//! A [`Client`] owns the declared [`Schema`] and an [`Executor`]. Per-table
//! operations go through [`TableClient`]; the same operations are available
//! inside a transaction ([`ClientTransaction::table`]) and recorded into a
//! batch ([`ClientBatch::table`]).

use crate::backend::DatabaseBackend;
use crate::builder::{Delete, Insert, Projection, Select, Statement, Update};
use crate::compiler::{CompiledQuery, QueryCompiler};
use crate::error::{OrmError, Result};
use crate::executor::{Batch, Executor, Transaction, TransactionState, WriteResult};
use crate::expr::{self, lit, Expr, SortDirection, TableRef, Tables};
use crate::mapper::ConverterRegistry;
use crate::migration::{self, MigrateOptions, MigrationPlan};
use crate::schema::{Schema, TableSchema};
use crate::value::{MappedRow, QueryRow, Value, Values};
use std::sync::Arc;
use tracing::info;

#[cfg(feature = "sqlite")]
use crate::config::ClientConfig;
#[cfg(feature = "sqlite")]
use crate::sqlite::SqliteBackend;

/// Filtering, ordering and paging for [`TableClient::many`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManyOptions {
    pub filter: Option<Expr>,
    pub order: Vec<(Expr, SortDirection)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub distinct: bool,
}

impl ManyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, condition: Expr) -> Self {
        self.filter = Some(condition);
        self
    }

    pub fn order_asc(mut self, expr: Expr) -> Self {
        self.order.push((expr, SortDirection::Asc));
        self
    }

    pub fn order_desc(mut self, expr: Expr) -> Self {
        self.order.push((expr, SortDirection::Desc));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }
}

/// Builds and compiles the statements behind the per-table operations.
struct TableQueries<'s> {
    compiler: QueryCompiler<'s>,
    table: &'s TableSchema,
    handle: TableRef,
}

impl<'s> TableQueries<'s> {
    fn new(schema: &'s Schema, name: &str) -> Result<Self> {
        let table = schema
            .table(name)
            .ok_or_else(|| OrmError::compile(format!("unknown table {}", name)))?;
        Ok(Self {
            compiler: QueryCompiler::new(schema),
            table,
            handle: TableRef::new(name),
        })
    }

    fn select(&self) -> Select {
        Select::from(&self.handle)
    }

    fn filtered(&self, select: Select, filter: Option<Expr>) -> Select {
        match filter {
            Some(condition) => select.filter(condition),
            None => select,
        }
    }

    fn insert(&self, values: Values) -> Insert {
        Insert::into(self.table.name.clone()).row(values).returning()
    }

    fn insert_many(&self, rows: impl IntoIterator<Item = Values>) -> Insert {
        Insert::into(self.table.name.clone()).rows(rows)
    }

    /// Conflicting rows get every supplied column except the target.
    fn upsert(&self, values: Values, target: &[&str]) -> Insert {
        let mut update: Vec<String> = values
            .keys()
            .filter(|k| !target.contains(&k.as_str()))
            .cloned()
            .collect();
        update.sort();
        Insert::into(self.table.name.clone())
            .row(values)
            .on_conflict(target.iter().copied(), update)
            .returning()
    }

    fn update(&self, values: Values, filter: Expr) -> Result<CompiledQuery> {
        if values.is_empty() {
            return Err(OrmError::compile(format!(
                "update of {} sets no columns",
                self.table.name
            )));
        }
        self.compiler
            .compile_update(&Update::table(self.table.name.clone()).set_values(values).filter(filter))
    }

    fn delete(&self, filter: Expr) -> Result<CompiledQuery> {
        self.compiler
            .compile_delete(&Delete::from(self.table.name.clone()).filter(filter))
    }

    fn get(&self, filter: Expr) -> Result<CompiledQuery> {
        self.compiler
            .compile_select(&self.select().filter(filter).limit(1))
    }

    fn many(&self, options: &ManyOptions) -> Result<CompiledQuery> {
        let mut select = self.filtered(self.select(), options.filter.clone());
        for (expr, direction) in &options.order {
            select = select.order_by(expr.clone(), *direction);
        }
        if let Some(limit) = options.limit {
            select = select.limit(limit);
        }
        if let Some(offset) = options.offset {
            select = select.offset(offset);
        }
        if options.distinct {
            select = select.distinct();
        }
        self.compiler.compile_select(&select)
    }

    fn exists(&self, filter: Expr) -> Result<CompiledQuery> {
        self.compiler
            .compile_select(&self.select().select([lit(1)]).filter(filter).limit(1))
    }

    fn aggregate(&self, expr: Expr, filter: Option<Expr>) -> Result<CompiledQuery> {
        let select = self.filtered(self.select().select([expr]), filter);
        self.compiler.compile_select(&select)
    }

    fn group_by(
        &self,
        keys: &[&str],
        aggregates: impl IntoIterator<Item = Projection>,
        filter: Option<Expr>,
    ) -> Result<CompiledQuery> {
        let key_exprs: Vec<Expr> = keys.iter().map(|k| self.handle.col(*k)).collect();
        let mut projections: Vec<Projection> = key_exprs.iter().cloned().map(Projection::from).collect();
        projections.extend(aggregates);
        let select = self
            .filtered(self.select(), filter)
            .select(projections)
            .group_by(key_exprs.clone());
        let select = key_exprs.into_iter().fold(select, |s, k| s.order_asc(k));
        self.compiler.compile_select(&select)
    }
}

fn rows(mapped: Vec<MappedRow>) -> Vec<QueryRow> {
    mapped.into_iter().filter_map(MappedRow::into_row).collect()
}

fn first_row(mapped: Vec<MappedRow>) -> Option<QueryRow> {
    rows(mapped).into_iter().next()
}

fn scalar(mapped: Vec<MappedRow>) -> Value {
    mapped
        .into_iter()
        .next()
        .and_then(MappedRow::into_scalar)
        .unwrap_or(Value::Null)
}

fn count_value(mapped: Vec<MappedRow>) -> i64 {
    scalar(mapped).as_i64().unwrap_or(0)
}

/// ORM client over one backend and one declared schema.
pub struct Client {
    schema: Schema,
    executor: Executor,
}

impl Client {
    /// Open the SQLite database described by `config`.
    #[cfg(feature = "sqlite")]
    pub async fn connect(config: &ClientConfig, schema: Schema) -> Result<Self> {
        let backend = SqliteBackend::connect(config).await?;
        let client = Self::new(backend, schema);
        Ok(Self {
            executor: client.executor.with_bulk_threshold(config.bulk_insert_threshold),
            schema: client.schema,
        })
    }

    pub fn new(backend: impl DatabaseBackend + 'static, schema: Schema) -> Self {
        Self::from_shared(Arc::new(backend), schema)
    }

    pub fn from_shared(backend: Arc<dyn DatabaseBackend>, schema: Schema) -> Self {
        info!(tables = schema.len(), "client ready");
        Self {
            schema,
            executor: Executor::new(backend),
        }
    }

    /// The declared, normalized schema.
    pub fn get_schema(&self) -> &Schema {
        &self.schema
    }

    pub fn backend(&self) -> &Arc<dyn DatabaseBackend> {
        self.executor.backend()
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn compiler(&self) -> QueryCompiler<'_> {
        QueryCompiler::new(&self.schema)
    }

    pub fn converters_mut(&mut self) -> &mut ConverterRegistry {
        self.executor.mapper_mut().registry_mut()
    }

    pub fn table(&self, name: &str) -> Result<TableClient<'_>> {
        Ok(TableClient {
            client: self,
            queries: TableQueries::new(&self.schema, name)?,
        })
    }

    /// Run a structural query built from table handles.
    pub async fn query<F>(&self, build: F) -> Result<Vec<MappedRow>>
    where
        F: FnOnce(&Tables) -> Select,
    {
        self.select(&build(&Tables)).await
    }

    pub async fn select(&self, select: &Select) -> Result<Vec<MappedRow>> {
        let query = self.compiler().compile_select(select)?;
        self.executor.read(&query).await
    }

    /// Run any statement. Selects return their rows in `rows`.
    pub async fn execute(&self, statement: impl Into<Statement>) -> Result<WriteResult> {
        let compiler = self.compiler();
        match statement.into() {
            Statement::Select(select) => Ok(WriteResult {
                rows: self.select(&select).await?,
                ..Default::default()
            }),
            Statement::Insert(insert) => self.executor.insert(&compiler, &insert).await,
            Statement::Update(update) => self.executor.write(&compiler.compile_update(&update)?).await,
            Statement::Delete(delete) => self.executor.write(&compiler.compile_delete(&delete)?).await,
        }
    }

    /// The live schema as stored by the engine.
    pub async fn introspect(&self) -> Result<Schema> {
        self.executor.introspect().await
    }

    /// Plan from `previous` to the declared schema.
    pub fn diff(&self, previous: &Schema) -> Result<MigrationPlan> {
        migration::diff(previous, &self.schema)
    }

    pub async fn migrate(&self, plan: &MigrationPlan, options: &MigrateOptions) -> Result<()> {
        self.executor.migrate(plan, options).await
    }

    /// Bring the live schema in line with the declared one; returns the
    /// applied plan.
    pub async fn push(&self, options: &MigrateOptions) -> Result<MigrationPlan> {
        let live = self.introspect().await?;
        let plan = self.diff(&live)?;
        self.migrate(&plan, options).await?;
        Ok(plan)
    }

    pub async fn begin(&self) -> Result<ClientTransaction<'_>> {
        Ok(ClientTransaction {
            client: self,
            tx: self.executor.begin().await?,
        })
    }

    pub fn batch(&self) -> ClientBatch<'_> {
        ClientBatch {
            client: self,
            batch: self.executor.batch(),
        }
    }

    /// Record statements with `f`, then commit them as one transaction.
    pub async fn batch_with<F>(&self, f: F) -> Result<Vec<WriteResult>>
    where
        F: FnOnce(&mut ClientBatch<'_>) -> Result<()>,
    {
        let mut batch = self.batch();
        f(&mut batch)?;
        batch.commit().await
    }

    /// Check `sql` for errors without running it.
    pub async fn prepare(&self, sql: &str) -> Result<()> {
        self.executor.prepare(sql).await
    }

    pub async fn close(&self) -> Result<()> {
        self.executor.backend().close().await
    }
}

/// Operations on one declared table.
pub struct TableClient<'c> {
    client: &'c Client,
    queries: TableQueries<'c>,
}

impl<'c> TableClient<'c> {
    pub fn name(&self) -> &str {
        &self.queries.table.name
    }

    /// Column handle for building filters.
    pub fn col(&self, name: &str) -> Expr {
        self.queries.handle.col(name)
    }

    /// Insert one row and return it as stored, defaults included.
    pub async fn insert(&self, values: Values) -> Result<QueryRow> {
        let result = self
            .client
            .executor
            .insert(&self.queries.compiler, &self.queries.insert(values))
            .await?;
        first_row(result.rows).ok_or_else(|| OrmError::Execution {
            message: format!("insert into {} returned no row", self.name()),
            code: None,
        })
    }

    /// Insert rows, collapsed into one statement when they qualify.
    pub async fn insert_many(&self, rows: impl IntoIterator<Item = Values>) -> Result<u64> {
        let insert = self.queries.insert_many(rows);
        if insert.rows.is_empty() {
            return Ok(0);
        }
        let result = self
            .client
            .executor
            .insert(&self.queries.compiler, &insert)
            .await?;
        Ok(result.rows_affected)
    }

    pub async fn update(&self, values: Values, filter: Expr) -> Result<u64> {
        let query = self.queries.update(values, filter)?;
        Ok(self.client.executor.write(&query).await?.rows_affected)
    }

    /// Insert, or update the row conflicting on `target`. `None` when the
    /// conflicting row was left as is.
    pub async fn upsert(&self, values: Values, target: &[&str]) -> Result<Option<QueryRow>> {
        let result = self
            .client
            .executor
            .insert(&self.queries.compiler, &self.queries.upsert(values, target))
            .await?;
        Ok(first_row(result.rows))
    }

    pub async fn delete(&self, filter: Expr) -> Result<u64> {
        let query = self.queries.delete(filter)?;
        Ok(self.client.executor.write(&query).await?.rows_affected)
    }

    pub async fn get(&self, filter: Expr) -> Result<Option<QueryRow>> {
        let query = self.queries.get(filter)?;
        Ok(first_row(self.client.executor.read(&query).await?))
    }

    pub async fn many(&self, options: ManyOptions) -> Result<Vec<QueryRow>> {
        let query = self.queries.many(&options)?;
        Ok(rows(self.client.executor.read(&query).await?))
    }

    pub async fn all(&self) -> Result<Vec<QueryRow>> {
        self.many(ManyOptions::default()).await
    }

    pub async fn exists(&self, filter: Expr) -> Result<bool> {
        let query = self.queries.exists(filter)?;
        Ok(!self.client.executor.read(&query).await?.is_empty())
    }

    pub async fn count(&self, filter: Option<Expr>) -> Result<i64> {
        let query = self.queries.aggregate(expr::count(), filter)?;
        Ok(count_value(self.client.executor.read(&query).await?))
    }

    pub async fn sum(&self, column: &str, filter: Option<Expr>) -> Result<Value> {
        self.aggregate(expr::sum(self.col(column)), filter).await
    }

    pub async fn avg(&self, column: &str, filter: Option<Expr>) -> Result<Value> {
        self.aggregate(expr::avg(self.col(column)), filter).await
    }

    pub async fn min(&self, column: &str, filter: Option<Expr>) -> Result<Value> {
        self.aggregate(expr::min(self.col(column)), filter).await
    }

    pub async fn max(&self, column: &str, filter: Option<Expr>) -> Result<Value> {
        self.aggregate(expr::max(self.col(column)), filter).await
    }

    async fn aggregate(&self, expr: Expr, filter: Option<Expr>) -> Result<Value> {
        let query = self.queries.aggregate(expr, filter)?;
        Ok(scalar(self.client.executor.read(&query).await?))
    }

    /// One row per distinct key, ordered by the keys.
    pub async fn group_by(
        &self,
        keys: &[&str],
        aggregates: impl IntoIterator<Item = Projection>,
        filter: Option<Expr>,
    ) -> Result<Vec<QueryRow>> {
        let query = self.queries.group_by(keys, aggregates, filter)?;
        Ok(rows(self.client.executor.read(&query).await?))
    }
}

/// Transaction opened by [`Client::begin`]. Holds the writer lock until
/// `commit` or `rollback`.
pub struct ClientTransaction<'c> {
    client: &'c Client,
    tx: Transaction,
}

impl<'c> ClientTransaction<'c> {
    pub fn state(&self) -> TransactionState {
        self.tx.state()
    }

    pub fn table(&mut self, name: &str) -> Result<TransactionTable<'_, 'c>> {
        let client: &'c Client = self.client;
        Ok(TransactionTable {
            tx: &mut self.tx,
            queries: TableQueries::new(&client.schema, name)?,
        })
    }

    pub async fn query<F>(&mut self, build: F) -> Result<Vec<MappedRow>>
    where
        F: FnOnce(&Tables) -> Select,
    {
        let query = self.client.compiler().compile_select(&build(&Tables))?;
        self.tx.read(&query).await
    }

    pub async fn execute(&mut self, statement: impl Into<Statement>) -> Result<WriteResult> {
        let compiler = self.client.compiler();
        match statement.into() {
            Statement::Select(select) => Ok(WriteResult {
                rows: self.tx.read(&compiler.compile_select(&select)?).await?,
                ..Default::default()
            }),
            Statement::Insert(insert) => self.tx.insert(&compiler, &insert).await,
            Statement::Update(update) => self.tx.write(&compiler.compile_update(&update)?).await,
            Statement::Delete(delete) => self.tx.write(&compiler.compile_delete(&delete)?).await,
        }
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await
    }
}

/// Table operations routed through an open transaction.
pub struct TransactionTable<'t, 'c> {
    tx: &'t mut Transaction,
    queries: TableQueries<'c>,
}

impl<'t, 'c> TransactionTable<'t, 'c> {
    pub async fn insert(&mut self, values: Values) -> Result<QueryRow> {
        let insert = self.queries.insert(values);
        let result = self.tx.insert(&self.queries.compiler, &insert).await?;
        first_row(result.rows).ok_or_else(|| OrmError::Execution {
            message: format!("insert into {} returned no row", self.queries.table.name),
            code: None,
        })
    }

    pub async fn insert_many(&mut self, rows: impl IntoIterator<Item = Values>) -> Result<u64> {
        let insert = self.queries.insert_many(rows);
        if insert.rows.is_empty() {
            return Ok(0);
        }
        Ok(self.tx.insert(&self.queries.compiler, &insert).await?.rows_affected)
    }

    pub async fn update(&mut self, values: Values, filter: Expr) -> Result<u64> {
        let query = self.queries.update(values, filter)?;
        Ok(self.tx.write(&query).await?.rows_affected)
    }

    pub async fn upsert(&mut self, values: Values, target: &[&str]) -> Result<Option<QueryRow>> {
        let insert = self.queries.upsert(values, target);
        let result = self.tx.insert(&self.queries.compiler, &insert).await?;
        Ok(first_row(result.rows))
    }

    pub async fn delete(&mut self, filter: Expr) -> Result<u64> {
        let query = self.queries.delete(filter)?;
        Ok(self.tx.write(&query).await?.rows_affected)
    }

    pub async fn get(&mut self, filter: Expr) -> Result<Option<QueryRow>> {
        let query = self.queries.get(filter)?;
        Ok(first_row(self.tx.read(&query).await?))
    }

    pub async fn many(&mut self, options: ManyOptions) -> Result<Vec<QueryRow>> {
        let query = self.queries.many(&options)?;
        Ok(rows(self.tx.read(&query).await?))
    }

    pub async fn count(&mut self, filter: Option<Expr>) -> Result<i64> {
        let query = self.queries.aggregate(expr::count(), filter)?;
        Ok(count_value(self.tx.read(&query).await?))
    }
}

/// Batch opened by [`Client::batch`]. Statements are compiled when
/// recorded and run on `commit`.
pub struct ClientBatch<'c> {
    client: &'c Client,
    batch: Batch,
}

impl<'c> ClientBatch<'c> {
    pub fn table(&mut self, name: &str) -> Result<BatchTable<'_, 'c>> {
        let client: &'c Client = self.client;
        Ok(BatchTable {
            batch: &mut self.batch,
            queries: TableQueries::new(&client.schema, name)?,
        })
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub async fn commit(self) -> Result<Vec<WriteResult>> {
        self.batch.commit().await
    }

    pub fn discard(self) {
        self.batch.discard();
    }
}

/// Table operations recorded into a batch.
pub struct BatchTable<'b, 'c> {
    batch: &'b mut Batch,
    queries: TableQueries<'c>,
}

impl<'b, 'c> BatchTable<'b, 'c> {
    pub fn insert(&mut self, values: Values) -> Result<()> {
        let insert = Insert::into(self.queries.table.name.clone()).row(values);
        self.batch.insert(&self.queries.compiler, &insert)
    }

    pub fn insert_many(&mut self, rows: impl IntoIterator<Item = Values>) -> Result<()> {
        let insert = self.queries.insert_many(rows);
        if insert.rows.is_empty() {
            return Ok(());
        }
        self.batch.insert(&self.queries.compiler, &insert)
    }

    pub fn update(&mut self, values: Values, filter: Expr) -> Result<()> {
        let query = self.queries.update(values, filter)?;
        self.batch.push(query);
        Ok(())
    }

    pub fn upsert(&mut self, values: Values, target: &[&str]) -> Result<()> {
        let mut insert = self.queries.upsert(values, target);
        insert.returning = false;
        self.batch.insert(&self.queries.compiler, &insert)
    }

    pub fn delete(&mut self, filter: Expr) -> Result<()> {
        let query = self.queries.delete(filter)?;
        self.batch.push(query);
        Ok(())
    }
}
