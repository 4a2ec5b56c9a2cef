//! tx2-orm - Schema-driven ORM engine for embedded SQLite
//!
//! Tables are declared once as blueprints, normalized into a [`Schema`], and
//! every query, DDL statement and migration is derived from that schema.
//!
//! # Architecture
//!
//! - **Schema**: blueprints are validated and normalized ([`schema`]), then
//!   rendered as DDL ([`ddl`])
//! - **Queries**: structural statements ([`builder`], [`expr`]) compile to
//!   parameterized SQL with typed output columns ([`compiler`])
//! - **Migrations**: schema snapshots are diffed into ordered plans that
//!   apply atomically ([`migration`])
//! - **Execution**: one writer at a time, transactions and batches over a
//!   [`DatabaseBackend`] ([`executor`]), with typed results ([`mapper`])
//! - **Sync**: a local replica that journals writes and replays them on a
//!   remote backend ([`sync`])
//!
//! # Example
//!
//! ```rust,no_run
//! use tx2_orm::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let schema = Schema::from_blueprints(
//!         [TableBlueprint::new("items")
//!             .column(Column::text("name"))
//!             .column(Column::integer("count").default(0))],
//!         [],
//!     )?;
//!
//!     let client = Client::connect(&ClientConfig::memory(), schema).await?;
//!     client.push(&MigrateOptions::default()).await?;
//!
//!     let items = client.table("items")?;
//!     let row = items.insert(values([("name", "a")])).await?;
//!     assert_eq!(row.get_i64("count"), Some(0));
//!
//!     let top = items
//!         .many(ManyOptions::new().order_desc(col("count")).limit(10))
//!         .await?;
//!     println!("Top items: {:?}", top);
//!     Ok(())
//! }
//! ```
//!
//! # Backend Support
//!
//! The SQLite backend is enabled by the default `sqlite` feature. Other
//! engines plug in by implementing [`DatabaseBackend`].

pub mod backend;
pub mod builder;
pub mod client;
pub mod compiler;
pub mod config;
pub mod ddl;
pub mod error;
pub mod executor;
pub mod expr;
pub mod mapper;
pub mod migration;
pub mod schema;
pub mod sync;
pub mod value;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use backend::{BackendTransaction, DatabaseBackend, ExecOutcome, SqlStatement};
pub use builder::{Delete, Insert, JoinType, Projection, Select, Statement, Update};
pub use client::{Client, ClientBatch, ClientTransaction, ManyOptions, TableClient};
pub use compiler::{CompiledQuery, OutputColumn, QueryCompiler};
pub use config::ClientConfig;
pub use error::{OrmError, Result};
pub use executor::{Batch, Executor, Transaction, TransactionState, WriteResult, WriterLock};
pub use expr::{Expr, SortDirection, TableRef, Tables};
pub use mapper::{ConverterRegistry, ResultMapper, TypeConverter};
pub use migration::{MigrateOptions, MigrationPlan, MigrationStep};
pub use schema::{
    Column, ColumnDef, ColumnType, FtsBlueprint, IndexDef, Schema, SchemaProcessor,
    TableBlueprint, TableSchema,
};
pub use sync::{RemoteSyncBackend, SyncConfig, SyncReport};
pub use value::{values, MappedRow, QueryRow, SqlValue, Value, Values};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;

/// Prelude for common imports
pub mod prelude {
    pub use crate::builder::{Delete, Insert, Select, Update};
    pub use crate::client::{Client, ManyOptions};
    pub use crate::config::ClientConfig;
    pub use crate::error::{OrmError, Result};
    pub use crate::expr::{col, count, lit, SortDirection, Tables};
    pub use crate::migration::MigrateOptions;
    pub use crate::schema::{Column, FtsBlueprint, Schema, TableBlueprint};
    pub use crate::value::{values, MappedRow, QueryRow, Value};

    #[cfg(feature = "sqlite")]
    pub use crate::sqlite::SqliteBackend;
}
