use crate::backend::{BackendTransaction, DatabaseBackend, ExecOutcome, SqlStatement};
use crate::config::ClientConfig;
use crate::ddl::{split_definitions, unquote};
use crate::error::{OrmError, Result};
use crate::migration::parse_default;
use crate::schema::{
    ColumnDef, ColumnType, ForeignKey, FullTextConfig, IndexDef, Schema, TableSchema, DEFAULT_TOKENIZER,
};
use crate::value::{RawRow, SqlValue};
use async_trait::async_trait;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{Column, Connection, Executor as _, Row, Sqlite, TypeInfo, ValueRef};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Shadow tables fts5 creates next to every full-text table.
const FTS_SHADOW_SUFFIXES: [&str; 5] = ["_data", "_idx", "_content", "_docsize", "_config"];

/// Embedded SQLite backend.
///
/// Every database gets a single-connection write pool and a read-only read
/// pool. In-memory databases share one cache between the two; their readers
/// see uncommitted writes.
pub struct SqliteBackend {
    reader: SqlitePool,
    writer: SqlitePool,
    foreign_keys: bool,
}

impl SqliteBackend {
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let base = SqliteConnectOptions::from_str(&config.url)?
            .foreign_keys(config.foreign_keys)
            .busy_timeout(config.busy_timeout());

        if config.is_memory() {
            // One shared-cache database behind both pools. It lives as long
            // as the writer's pinned connection. Readers skip table locks
            // so they never wait on an open write transaction.
            let base = base.shared_cache(true);
            let writer = SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(base.clone())
                .await?;
            let reader = SqlitePoolOptions::new()
                .max_connections(config.max_read_connections.max(1))
                .connect_with(
                    base.pragma("read_uncommitted", "ON")
                        .pragma("query_only", "ON"),
                )
                .await?;
            info!(url = %config.url, readers = config.max_read_connections, "opened in-memory database");
            return Ok(Self {
                reader,
                writer,
                foreign_keys: config.foreign_keys,
            });
        }

        let journal = if config.wal {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };
        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(base.clone().create_if_missing(true).journal_mode(journal))
            .await?;
        let reader = SqlitePoolOptions::new()
            .max_connections(config.max_read_connections.max(1))
            .connect_with(base.read_only(true))
            .await?;

        info!(
            url = %config.url,
            readers = config.max_read_connections,
            wal = config.wal,
            "opened database"
        );
        Ok(Self {
            reader,
            writer,
            foreign_keys: config.foreign_keys,
        })
    }

    /// Create an in-memory SQLite database
    pub async fn memory() -> Result<Self> {
        Self::connect(&ClientConfig::memory()).await
    }

    /// Create a file-based SQLite database
    pub async fn file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Self::connect(&ClientConfig::file(path)).await
    }

    /// Names of user tables, including full-text shadow tables.
    pub async fn list_tables(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&self.reader)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("name").map_err(OrmError::from))
            .collect()
    }

    /// Get table info
    pub async fn table_info(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let rows = sqlx::query(
            "SELECT cid, name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid",
        )
        .bind(table)
        .fetch_all(&self.reader)
        .await?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            columns.push(ColumnInfo {
                cid: row.try_get("cid")?,
                name: row.try_get("name")?,
                type_name: row.try_get("type")?,
                not_null: row.try_get::<i64, _>("notnull")? != 0,
                default_value: row.try_get("dflt_value")?,
                primary_key: row.try_get("pk")?,
            });
        }
        Ok(columns)
    }

    async fn foreign_keys_of(&self, table: &str) -> Result<HashMap<String, ForeignKey>> {
        let rows = sqlx::query("SELECT \"table\", \"from\", \"to\", on_delete FROM pragma_foreign_key_list(?1)")
            .bind(table)
            .fetch_all(&self.reader)
            .await?;

        let mut out = HashMap::new();
        for row in rows {
            let from: String = row.try_get("from")?;
            let on_delete: String = row.try_get("on_delete")?;
            out.insert(
                from,
                ForeignKey {
                    table: row.try_get("table")?,
                    column: row.try_get::<Option<String>, _>("to")?.unwrap_or_default(),
                    on_delete_cascade: on_delete.eq_ignore_ascii_case("CASCADE"),
                },
            );
        }
        Ok(out)
    }

    /// Indexes created with `CREATE INDEX`; constraint indexes are part of
    /// the table definition.
    async fn indexes_of(&self, table: &str) -> Result<Vec<IndexDef>> {
        let rows = sqlx::query("SELECT name, \"unique\" FROM pragma_index_list(?1) WHERE origin = 'c' ORDER BY name")
            .bind(table)
            .fetch_all(&self.reader)
            .await?;

        let mut indexes = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("name")?;
            let unique: i64 = row.try_get("unique")?;
            let columns = sqlx::query("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")
                .bind(&name)
                .fetch_all(&self.reader)
                .await?
                .iter()
                .map(|r| r.try_get::<String, _>("name"))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            indexes.push(IndexDef {
                name,
                columns,
                unique: unique != 0,
            });
        }
        Ok(indexes)
    }

    async fn introspect_table(&self, name: &str, sql: &str) -> Result<TableSchema> {
        let info = self.table_info(name).await?;
        let foreign_keys = self.foreign_keys_of(name).await?;

        let mut definitions = HashMap::new();
        let mut constraints = Vec::new();
        for part in split_definitions(sql) {
            match leading_identifier(&part) {
                Some(ident) if info.iter().any(|c| c.name == ident) => {
                    definitions.insert(ident, part);
                }
                _ => constraints.push(part),
            }
        }

        let mut key: Vec<&ColumnInfo> = info.iter().filter(|c| c.primary_key > 0).collect();
        key.sort_by_key(|c| c.primary_key);
        let column_key = match key.as_slice() {
            [only] => definitions
                .get(&only.name)
                .map(|d| d.to_ascii_uppercase().contains("PRIMARY KEY"))
                .unwrap_or(false),
            _ => false,
        };

        let mut table = TableSchema::new(name);
        for column in &info {
            let definition = definitions.remove(&column.name);
            let upper = definition.as_deref().map(str::to_ascii_uppercase).unwrap_or_default();
            let mut def = ColumnDef::new(column.name.clone(), ColumnType::from_declared(&column.type_name));
            def.primary_key = column_key && column.primary_key > 0;
            def.nullable = !column.not_null && !def.is_rowid_alias();
            def.unique = upper.contains(" UNIQUE");
            def.default = column.default_value.as_deref().and_then(parse_default);
            def.references = foreign_keys.get(&column.name).cloned();
            def.definition = definition;
            table.columns.push(def);
        }
        if !column_key {
            table.primary_key = key.iter().map(|c| c.name.clone()).collect();
        }
        for constraint in &constraints {
            if constraint.to_ascii_uppercase().starts_with("UNIQUE") {
                table.uniques.push(split_definitions(constraint).iter().map(|c| unquote(c)).collect());
            }
        }
        table.constraint_definitions = Some(constraints);
        table.indexes = self.indexes_of(name).await?;
        Ok(table)
    }
}

/// Column information from PRAGMA table_info
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub cid: i64,
    pub name: String,
    pub type_name: String,
    pub not_null: bool,
    pub default_value: Option<String>,
    /// Position in the primary key, 0 when not part of it.
    pub primary_key: i64,
}

/// Column name a definition fragment starts with, `None` for table
/// constraints.
fn leading_identifier(fragment: &str) -> Option<String> {
    let fragment = fragment.trim_start();
    let first = fragment.chars().next()?;
    let close = match first {
        '"' => Some('"'),
        '`' => Some('`'),
        '[' => Some(']'),
        _ => None,
    };
    if let Some(close) = close {
        let mut end = None;
        let mut chars = fragment.char_indices().skip(1).peekable();
        while let Some((i, c)) = chars.next() {
            if c == close {
                // Doubled quote inside a quoted identifier.
                if close != ']' && chars.peek().map(|(_, n)| *n == close).unwrap_or(false) {
                    chars.next();
                    continue;
                }
                end = Some(i);
                break;
            }
        }
        return end.map(|e| unquote(&fragment[..=e]));
    }

    let token: String = fragment
        .chars()
        .take_while(|c| !c.is_whitespace() && *c != '(')
        .collect();
    let upper = token.to_ascii_uppercase();
    if matches!(upper.as_str(), "PRIMARY" | "UNIQUE" | "CHECK" | "FOREIGN" | "CONSTRAINT") {
        None
    } else {
        Some(token)
    }
}

fn is_full_text_sql(sql: &str) -> bool {
    let upper = sql.to_ascii_uppercase();
    upper.starts_with("CREATE VIRTUAL TABLE") && upper.contains("USING FTS5")
}

fn is_shadow_table(name: &str, virtual_tables: &[String]) -> bool {
    virtual_tables.iter().any(|vt| {
        name.strip_prefix(vt.as_str())
            .map(|rest| FTS_SHADOW_SUFFIXES.contains(&rest))
            .unwrap_or(false)
    })
}

fn parse_full_text(name: &str, sql: &str) -> TableSchema {
    let mut table = TableSchema::new(name);
    let mut config = FullTextConfig {
        content: None,
        content_rowid: None,
        tokenizer: DEFAULT_TOKENIZER.to_string(),
    };
    for arg in split_definitions(sql) {
        match arg.split_once('=') {
            Some((key, value)) => {
                let value = unquote(value);
                match key.trim().to_ascii_lowercase().as_str() {
                    "content" if !value.is_empty() => config.content = Some(value),
                    "content_rowid" => config.content_rowid = Some(value),
                    "tokenize" => config.tokenizer = value,
                    _ => {}
                }
            }
            None => {
                let column = arg.split_whitespace().next().map(unquote).unwrap_or_default();
                let mut def = ColumnDef::new(column, ColumnType::Text);
                def.nullable = true;
                table.columns.push(def);
            }
        }
    }
    if config.content.is_none() {
        config.content_rowid = None;
    }
    table.full_text = Some(config);
    table
}

fn bind_params<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &[SqlValue],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for param in params {
        query = match param {
            SqlValue::Null => query.bind(None::<i64>),
            SqlValue::Integer(i) => query.bind(*i),
            SqlValue::Real(r) => query.bind(*r),
            SqlValue::Text(s) => query.bind(s.clone()),
            SqlValue::Blob(b) => query.bind(b.clone()),
        };
    }
    query
}

/// Convert SQLite row to a raw row, by storage class.
fn convert_row(row: &SqliteRow) -> Result<RawRow> {
    let mut raw = RawRow {
        columns: Vec::with_capacity(row.len()),
        values: Vec::with_capacity(row.len()),
    };
    for (index, column) in row.columns().iter().enumerate() {
        raw.columns.push(column.name().to_string());
        let value = row.try_get_raw(index)?;
        if value.is_null() {
            raw.values.push(SqlValue::Null);
            continue;
        }
        let storage = value.type_info().name().to_string();
        raw.values.push(match storage.as_str() {
            "INTEGER" | "BOOLEAN" => SqlValue::Integer(row.try_get(index)?),
            "REAL" | "NUMERIC" => SqlValue::Real(row.try_get(index)?),
            "BLOB" => SqlValue::Blob(row.try_get(index)?),
            _ => SqlValue::Text(row.try_get(index)?),
        });
    }
    Ok(raw)
}

async fn run<'c, E>(executor: E, statement: &'c SqlStatement) -> Result<ExecOutcome>
where
    E: sqlx::Executor<'c, Database = Sqlite> + 'c,
{
    debug!(sql = %statement.sql, params = statement.params.len(), "execute");
    let query = bind_params(sqlx::query(&statement.sql), &statement.params);
    if statement.returning {
        let rows = query.fetch_all(executor).await?;
        let rows = rows.iter().map(convert_row).collect::<Result<Vec<_>>>()?;
        Ok(ExecOutcome {
            rows_affected: rows.len() as u64,
            last_insert_id: None,
            rows,
        })
    } else {
        let done = query.execute(executor).await?;
        Ok(ExecOutcome {
            rows_affected: done.rows_affected(),
            last_insert_id: Some(done.last_insert_rowid()),
            rows: Vec::new(),
        })
    }
}

async fn fetch<'c, E>(executor: E, statement: &'c SqlStatement) -> Result<Vec<RawRow>>
where
    E: sqlx::Executor<'c, Database = Sqlite> + 'c,
{
    debug!(sql = %statement.sql, params = statement.params.len(), "query");
    let rows = bind_params(sqlx::query(&statement.sql), &statement.params)
        .fetch_all(executor)
        .await?;
    rows.iter().map(convert_row).collect()
}

/// Runs migration DDL in one transaction with foreign keys deferred, then
/// verifies referential integrity before committing.
async fn apply_deferred(conn: &mut SqliteConnection, statements: &[String]) -> Result<()> {
    let mut tx = conn.begin().await?;
    sqlx::query("PRAGMA defer_foreign_keys = ON").execute(&mut *tx).await?;

    for sql in statements {
        debug!(sql = %sql, "migration statement");
        if let Err(err) = sqlx::query(sql).execute(&mut *tx).await {
            tx.rollback().await?;
            return Err(err.into());
        }
    }

    let violations = sqlx::query("PRAGMA foreign_key_check").fetch_all(&mut *tx).await?;
    if let Some(first) = violations.first() {
        let table: String = first.try_get(0)?;
        let count = violations.len();
        tx.rollback().await?;
        return Err(OrmError::Execution {
            message: format!(
                "migration leaves {} foreign key violation(s), first in table {}",
                count, table
            ),
            code: None,
        });
    }

    tx.commit().await?;
    Ok(())
}

struct SqliteTransaction {
    tx: sqlx::Transaction<'static, Sqlite>,
}

#[async_trait]
impl BackendTransaction for SqliteTransaction {
    async fn query(&mut self, statement: &SqlStatement) -> Result<Vec<RawRow>> {
        fetch(&mut *self.tx, statement).await
    }

    async fn execute(&mut self, statement: &SqlStatement) -> Result<ExecOutcome> {
        run(&mut *self.tx, statement).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl DatabaseBackend for SqliteBackend {
    async fn query(&self, statement: &SqlStatement) -> Result<Vec<RawRow>> {
        fetch(&self.reader, statement).await
    }

    async fn execute(&self, statement: &SqlStatement) -> Result<ExecOutcome> {
        run(&self.writer, statement).await
    }

    async fn execute_batch(&self, statements: &[SqlStatement]) -> Result<Vec<ExecOutcome>> {
        let mut tx = self.writer.begin().await?;
        let mut outcomes = Vec::with_capacity(statements.len());
        for statement in statements {
            match run(&mut *tx, statement).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    warn!(error = %err, sql = %statement.sql, "batch statement failed, rolling back");
                    tx.rollback().await?;
                    return Err(err);
                }
            }
        }
        tx.commit().await?;
        Ok(outcomes)
    }

    async fn begin(&self) -> Result<Box<dyn BackendTransaction>> {
        let tx = self.writer.begin().await?;
        Ok(Box::new(SqliteTransaction { tx }))
    }

    async fn prepare(&self, sql: &str) -> Result<()> {
        (&self.reader).prepare(sql).await?;
        Ok(())
    }

    async fn introspect(&self) -> Result<Schema> {
        let rows = sqlx::query(
            "SELECT name, sql FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND sql IS NOT NULL ORDER BY name",
        )
        .fetch_all(&self.reader)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            entries.push((row.try_get::<String, _>("name")?, row.try_get::<String, _>("sql")?));
        }
        let virtual_tables: Vec<String> = entries
            .iter()
            .filter(|(_, sql)| sql.to_ascii_uppercase().starts_with("CREATE VIRTUAL TABLE"))
            .map(|(name, _)| name.clone())
            .collect();

        let mut schema = Schema::new();
        for (name, sql) in &entries {
            if is_shadow_table(name, &virtual_tables) {
                continue;
            }
            if is_full_text_sql(sql) {
                schema.insert(parse_full_text(name, sql));
            } else if !virtual_tables.contains(name) {
                schema.insert(self.introspect_table(name, sql).await?);
            }
        }
        debug!(tables = schema.len(), "introspected schema");
        Ok(schema)
    }

    async fn apply_migration(&self, statements: &[String]) -> Result<()> {
        let mut conn = self.writer.acquire().await?;
        // No effect inside a transaction, so it brackets the whole migration.
        sqlx::query("PRAGMA foreign_keys = OFF").execute(&mut *conn).await?;
        let result = apply_deferred(&mut conn, statements).await;
        if self.foreign_keys {
            sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
        }
        result
    }

    fn is_connected(&self) -> bool {
        !self.writer.is_closed()
    }

    async fn close(&self) -> Result<()> {
        self.reader.close().await;
        self.writer.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::diff;
    use crate::schema::{Column, FtsBlueprint, TableBlueprint};

    fn stmt(sql: &str, params: Vec<SqlValue>) -> SqlStatement {
        SqlStatement::with_params(sql, params)
    }

    async fn create(backend: &SqliteBackend, schema: &Schema) {
        let plan = diff(&Schema::new(), schema).unwrap();
        backend.apply_migration(&plan.statements()).await.unwrap();
    }

    #[tokio::test]
    async fn test_sqlite_memory() {
        let backend = SqliteBackend::memory().await;
        assert!(backend.is_ok());
        assert!(backend.unwrap().is_connected());
    }

    #[tokio::test]
    async fn test_memory_reads_do_not_wait_for_open_transaction() {
        let backend = SqliteBackend::memory().await.unwrap();
        backend
            .execute(&SqlStatement::new("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)"))
            .await
            .unwrap();

        let mut tx = backend.begin().await.unwrap();
        tx.execute(&stmt("INSERT INTO t (v) VALUES (?1)", vec![SqlValue::Text("x".into())]))
            .await
            .unwrap();
        let read = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            backend.query(&SqlStatement::new("SELECT count(*) FROM t")),
        )
        .await
        .expect("read waited for the open transaction");
        assert!(read.is_ok());
        tx.rollback().await.unwrap();

        let rows = backend.query(&SqlStatement::new("SELECT count(*) FROM t")).await.unwrap();
        assert_eq!(rows[0].values, vec![SqlValue::Integer(0)]);
        // The read handle is query-only.
        assert!(backend.query(&SqlStatement::new("DELETE FROM t")).await.is_err());
    }

    #[tokio::test]
    async fn test_sqlite_insert_query() {
        let backend = SqliteBackend::memory().await.unwrap();
        backend
            .execute(&SqlStatement::new("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)"))
            .await
            .unwrap();

        let outcome = backend
            .execute(&stmt(
                "INSERT INTO users (name, age) VALUES (?1, ?2)",
                vec![SqlValue::Text("Alice".into()), SqlValue::Integer(30)],
            ))
            .await
            .unwrap();
        assert_eq!(outcome.rows_affected, 1);
        assert_eq!(outcome.last_insert_id, Some(1));

        let rows = backend
            .query(&stmt("SELECT id, name, age FROM users WHERE age > ?1", vec![SqlValue::Integer(18)]))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].columns, vec!["id", "name", "age"]);
        assert_eq!(
            rows[0].values,
            vec![SqlValue::Integer(1), SqlValue::Text("Alice".into()), SqlValue::Integer(30)]
        );
    }

    #[tokio::test]
    async fn test_sqlite_returning() {
        let backend = SqliteBackend::memory().await.unwrap();
        backend
            .execute(&SqlStatement::new("CREATE TABLE t (id INTEGER PRIMARY KEY, v REAL)"))
            .await
            .unwrap();
        let outcome = backend
            .execute(&stmt("INSERT INTO t (v) VALUES (?1) RETURNING id, v", vec![SqlValue::Real(1.5)]).returning(true))
            .await
            .unwrap();
        assert_eq!(outcome.rows.len(), 1);
        assert_eq!(outcome.rows[0].values, vec![SqlValue::Integer(1), SqlValue::Real(1.5)]);
    }

    #[tokio::test]
    async fn test_sqlite_blob_and_null() {
        let backend = SqliteBackend::memory().await.unwrap();
        backend
            .execute(&SqlStatement::new("CREATE TABLE files (id INTEGER PRIMARY KEY, data BLOB, note TEXT)"))
            .await
            .unwrap();
        backend
            .execute(&stmt(
                "INSERT INTO files (data, note) VALUES (?1, ?2)",
                vec![SqlValue::Blob(b"Hello".to_vec()), SqlValue::Null],
            ))
            .await
            .unwrap();

        let rows = backend.query(&SqlStatement::new("SELECT data, note FROM files")).await.unwrap();
        assert_eq!(rows[0].values, vec![SqlValue::Blob(b"Hello".to_vec()), SqlValue::Null]);
    }

    #[tokio::test]
    async fn test_failed_batch_is_rolled_back() {
        let backend = SqliteBackend::memory().await.unwrap();
        backend
            .execute(&SqlStatement::new("CREATE TABLE accounts (id INTEGER PRIMARY KEY, balance INTEGER NOT NULL)"))
            .await
            .unwrap();

        let result = backend
            .execute_batch(&[
                stmt("INSERT INTO accounts (balance) VALUES (?1)", vec![SqlValue::Integer(100)]),
                stmt("INSERT INTO accounts (balance) VALUES (?1)", vec![SqlValue::Null]),
            ])
            .await;
        assert!(result.is_err());

        let rows = backend.query(&SqlStatement::new("SELECT count(*) FROM accounts")).await.unwrap();
        assert_eq!(rows[0].values, vec![SqlValue::Integer(0)]);
    }

    #[tokio::test]
    async fn test_transaction_rollback() {
        let backend = SqliteBackend::memory().await.unwrap();
        backend
            .execute(&SqlStatement::new("CREATE TABLE t (id INTEGER PRIMARY KEY)"))
            .await
            .unwrap();

        let mut tx = backend.begin().await.unwrap();
        tx.execute(&SqlStatement::new("INSERT INTO t DEFAULT VALUES")).await.unwrap();
        let inside = tx.query(&SqlStatement::new("SELECT count(*) FROM t")).await.unwrap();
        assert_eq!(inside[0].values, vec![SqlValue::Integer(1)]);
        tx.rollback().await.unwrap();

        let rows = backend.query(&SqlStatement::new("SELECT count(*) FROM t")).await.unwrap();
        assert_eq!(rows[0].values, vec![SqlValue::Integer(0)]);
    }

    #[tokio::test]
    async fn test_prepare_reports_errors_without_running() {
        let backend = SqliteBackend::memory().await.unwrap();
        assert!(backend.prepare("SELECT 1").await.is_ok());
        assert!(backend.prepare("SELEC 1").await.is_err());
        assert!(backend.prepare("SELECT * FROM missing").await.is_err());
        assert!(backend.list_tables().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_introspection_matches_declared_schema() {
        let backend = SqliteBackend::memory().await.unwrap();
        let schema = Schema::from_blueprints(
            [
                TableBlueprint::new("users")
                    .column(Column::text("email").unique())
                    .column(Column::boolean("active").default(true))
                    .column(Column::date("joined").default_now()),
                TableBlueprint::new("posts")
                    .column(Column::integer("user_id").references("users", "id").on_delete_cascade())
                    .column(Column::text("order").nullable())
                    .column(Column::json("meta").nullable())
                    .unique(["user_id", "order"])
                    .index(["user_id"]),
            ],
            [FtsBlueprint::new("posts_fts").columns(["order"]).content("posts")],
        )
        .unwrap();
        create(&backend, &schema).await;

        let live = backend.introspect().await.unwrap();
        assert_eq!(live.table_names(), vec!["posts", "posts_fts", "users"]);
        assert!(diff(&live, &schema).unwrap().is_empty());

        let posts = live.table("posts").unwrap();
        assert_eq!(posts.uniques, vec![vec!["user_id".to_string(), "order".to_string()]]);
        assert_eq!(posts.indexes[0].columns, vec!["user_id"]);
        let fk = posts.column("user_id").unwrap().references.as_ref().unwrap();
        assert!(fk.on_delete_cascade);

        let fts = live.table("posts_fts").unwrap().full_text.as_ref().unwrap();
        assert_eq!(fts.content.as_deref(), Some("posts"));
        assert_eq!(fts.tokenizer, DEFAULT_TOKENIZER);
    }

    #[tokio::test]
    async fn test_migration_rejects_dangling_references() {
        let backend = SqliteBackend::memory().await.unwrap();
        backend
            .apply_migration(&[
                "CREATE TABLE parent (id INTEGER PRIMARY KEY)".to_string(),
                "CREATE TABLE child (id INTEGER PRIMARY KEY, parent_id INTEGER REFERENCES parent(id))".to_string(),
            ])
            .await
            .unwrap();

        let err = backend
            .apply_migration(&["INSERT INTO child (parent_id) VALUES (7)".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, OrmError::Execution { .. }));

        let rows = backend.query(&SqlStatement::new("SELECT count(*) FROM child")).await.unwrap();
        assert_eq!(rows[0].values, vec![SqlValue::Integer(0)]);

        // Foreign keys are enforced again afterwards.
        assert!(backend
            .execute(&SqlStatement::new("INSERT INTO child (parent_id) VALUES (7)"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_file_database_uses_separate_handles() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::file(dir.path().join("app.db")).await.unwrap();
        backend
            .execute(&SqlStatement::new("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)"))
            .await
            .unwrap();
        backend
            .execute(&stmt("INSERT INTO t (v) VALUES (?1)", vec![SqlValue::Text("x".into())]))
            .await
            .unwrap();

        let rows = backend.query(&SqlStatement::new("SELECT v FROM t")).await.unwrap();
        assert_eq!(rows[0].values, vec![SqlValue::Text("x".into())]);
        // The read handle is read-only.
        assert!(backend.query(&SqlStatement::new("DELETE FROM t")).await.is_err());
        backend.close().await.unwrap();
        assert!(!backend.is_connected());
    }

    #[test]
    fn test_leading_identifier() {
        assert_eq!(leading_identifier("name TEXT NOT NULL"), Some("name".to_string()));
        assert_eq!(leading_identifier("\"order\" TEXT"), Some("order".to_string()));
        assert_eq!(leading_identifier("\"a\"\"b\" TEXT"), Some("a\"b".to_string()));
        assert_eq!(leading_identifier("PRIMARY KEY (a, b)"), None);
        assert_eq!(leading_identifier("UNIQUE (a)"), None);
    }

    #[test]
    fn test_shadow_tables() {
        let vts = vec!["docs_fts".to_string()];
        assert!(is_shadow_table("docs_fts_data", &vts));
        assert!(is_shadow_table("docs_fts_config", &vts));
        assert!(!is_shadow_table("docs", &vts));
        assert!(!is_shadow_table("docs_fts_extra", &vts));
    }
}
