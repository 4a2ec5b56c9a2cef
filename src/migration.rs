//! Schema diffing.
//!
//! [`diff`] compares two schema snapshots and produces an ordered
//! [`MigrationPlan`]. The plan is plain SQL text; applying it is the
//! executor's job.
//!
//! SQLite's `ALTER TABLE` can add and drop simple columns but cannot change a
//! column's constraints in place, so any change to a column definition or to
//! the table-level constraints rebuilds the table: create a new table, copy
//! the rows, drop the old table and rename.

use crate::ddl;
use crate::error::{OrmError, Result};
use crate::schema::{ColumnDef, ColumnDefault, IndexDef, Schema, TableSchema};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

/// Suffix of the temporary table used while rebuilding.
const REBUILD_SUFFIX: &str = "__new";

/// One DDL operation of a migration plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MigrationStep {
    CreateTable {
        table: String,
        sql: String,
    },
    DropTable {
        table: String,
        sql: String,
        /// Full-text index over an external content table; its rows come
        /// back from the base table, so dropping it loses nothing.
        rebuildable: bool,
    },
    AddColumn {
        table: String,
        column: String,
        sql: String,
    },
    DropColumn {
        table: String,
        column: String,
        sql: String,
    },
    CreateIndex {
        table: String,
        index: String,
        sql: String,
    },
    DropIndex {
        index: String,
        sql: String,
    },
    /// Create-new, copy rows, drop-old, rename; applied as one unit.
    RebuildTable {
        table: String,
        reason: String,
        statements: Vec<String>,
    },
    CreateFullText {
        table: String,
        sql: String,
    },
    CreateTrigger {
        table: String,
        sql: String,
    },
    DropTrigger {
        sql: String,
    },
    /// Repopulate an external-content full-text index.
    RebuildFullText {
        table: String,
        sql: String,
    },
}

impl MigrationStep {
    pub fn statements(&self) -> Vec<&str> {
        match self {
            MigrationStep::RebuildTable { statements, .. } => {
                statements.iter().map(String::as_str).collect()
            }
            MigrationStep::CreateTable { sql, .. }
            | MigrationStep::DropTable { sql, .. }
            | MigrationStep::AddColumn { sql, .. }
            | MigrationStep::DropColumn { sql, .. }
            | MigrationStep::CreateIndex { sql, .. }
            | MigrationStep::DropIndex { sql, .. }
            | MigrationStep::CreateFullText { sql, .. }
            | MigrationStep::CreateTrigger { sql, .. }
            | MigrationStep::DropTrigger { sql }
            | MigrationStep::RebuildFullText { sql, .. } => vec![sql.as_str()],
        }
    }

    /// Steps that can lose data and need explicit acknowledgement.
    pub fn is_destructive(&self) -> bool {
        match self {
            MigrationStep::RebuildTable { .. } | MigrationStep::DropColumn { .. } => true,
            MigrationStep::DropTable { rebuildable, .. } => !rebuildable,
            _ => false,
        }
    }
}

impl fmt::Display for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationStep::CreateTable { table, .. } => write!(f, "create table {}", table),
            MigrationStep::DropTable { table, .. } => write!(f, "drop table {}", table),
            MigrationStep::AddColumn { table, column, .. } => {
                write!(f, "add column {}.{}", table, column)
            }
            MigrationStep::DropColumn { table, column, .. } => {
                write!(f, "drop column {}.{}", table, column)
            }
            MigrationStep::CreateIndex { index, .. } => write!(f, "create index {}", index),
            MigrationStep::DropIndex { index, .. } => write!(f, "drop index {}", index),
            MigrationStep::RebuildTable { table, reason, .. } => {
                write!(f, "rebuild table {} ({})", table, reason)
            }
            MigrationStep::CreateFullText { table, .. } => {
                write!(f, "create full-text table {}", table)
            }
            MigrationStep::CreateTrigger { table, .. } => {
                write!(f, "create full-text trigger for {}", table)
            }
            MigrationStep::DropTrigger { sql } => write!(f, "{}", sql),
            MigrationStep::RebuildFullText { table, .. } => {
                write!(f, "repopulate full-text table {}", table)
            }
        }
    }
}

/// Ordered DDL transforming one schema into another.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MigrationPlan {
    steps: Vec<MigrationStep>,
}

impl MigrationPlan {
    pub fn new(steps: Vec<MigrationStep>) -> Self {
        Self { steps }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn steps(&self) -> &[MigrationStep] {
        &self.steps
    }

    /// Every SQL statement of the plan, in order.
    pub fn statements(&self) -> Vec<String> {
        self.steps
            .iter()
            .flat_map(|s| s.statements())
            .map(String::from)
            .collect()
    }

    pub fn requires_rebuild(&self) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s, MigrationStep::RebuildTable { .. }))
    }

    pub fn is_destructive(&self) -> bool {
        self.steps.iter().any(MigrationStep::is_destructive)
    }

    /// The plan as a script, one statement per line.
    pub fn to_sql(&self) -> String {
        self.statements()
            .iter()
            .map(|s| format!("{};", s))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Reject destructive steps the caller has not acknowledged.
    pub fn check(&self, options: &MigrateOptions) -> Result<()> {
        if options.allow_destructive {
            return Ok(());
        }
        let destructive: Vec<String> = self
            .steps
            .iter()
            .filter(|s| s.is_destructive())
            .map(|s| s.to_string())
            .collect();
        if destructive.is_empty() {
            Ok(())
        } else {
            Err(OrmError::MigrationConflict(format!(
                "plan contains destructive steps: {}",
                destructive.join("; ")
            )))
        }
    }
}

/// Options for applying a migration plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateOptions {
    /// Permit rebuilds, table drops and column drops.
    pub allow_destructive: bool,
}

impl MigrateOptions {
    pub fn destructive() -> Self {
        Self {
            allow_destructive: true,
        }
    }
}

fn addable(column: &ColumnDef) -> bool {
    if column.primary_key || column.unique {
        return false;
    }
    let constant_default = matches!(&column.default, Some(ColumnDefault::Value(v)) if !v.is_null());
    if matches!(column.default, Some(ColumnDefault::Now)) {
        return false;
    }
    if column.references.is_some() && !column.nullable {
        return false;
    }
    column.nullable || constant_default
}

fn droppable(table: &TableSchema, column: &ColumnDef) -> bool {
    !column.primary_key
        && !column.unique
        && column.references.is_none()
        && !table.primary_key.contains(&column.name)
        && !table.uniques.iter().any(|u| u.contains(&column.name))
        && !table.indexes.iter().any(|i| i.columns.contains(&column.name))
}

/// Outcome of comparing one regular table present in both schemas.
enum TableChange {
    Unchanged,
    Alter {
        add: Vec<String>,
        drop: Vec<String>,
    },
    Rebuild(String),
}

fn compare_table(old: &TableSchema, new: &TableSchema) -> Result<TableChange> {
    if ddl::table_constraints(old)? != ddl::table_constraints(new)? {
        return Ok(TableChange::Rebuild("table constraints changed".to_string()));
    }

    let mut old_columns = HashMap::new();
    for column in old.stored_columns() {
        old_columns.insert(column.name.as_str(), ddl::column_sql(column)?);
    }

    let mut add = Vec::new();
    let mut seen = HashSet::new();
    for column in new.stored_columns() {
        seen.insert(column.name.as_str());
        let sql = ddl::column_sql(column)?;
        match old_columns.get(column.name.as_str()) {
            Some(old_sql) if *old_sql == sql => {}
            Some(_) => {
                return Ok(TableChange::Rebuild(format!(
                    "column {} changed",
                    column.name
                )))
            }
            None if addable(column) => add.push(column.name.clone()),
            None => {
                return Ok(TableChange::Rebuild(format!(
                    "column {} cannot be added in place",
                    column.name
                )))
            }
        }
    }

    let mut drop = Vec::new();
    for column in old.stored_columns() {
        if seen.contains(column.name.as_str()) {
            continue;
        }
        if droppable(old, column) {
            drop.push(column.name.clone());
        } else {
            return Ok(TableChange::Rebuild(format!(
                "column {} cannot be dropped in place",
                column.name
            )));
        }
    }

    if add.is_empty() && drop.is_empty() {
        Ok(TableChange::Unchanged)
    } else {
        Ok(TableChange::Alter { add, drop })
    }
}

fn rebuild_statements(old: &TableSchema, new: &TableSchema) -> Result<Vec<String>> {
    let temp = format!("{}{}", new.name, REBUILD_SUFFIX);
    let old_names: HashSet<&str> = old.stored_columns().map(|c| c.name.as_str()).collect();
    let common: Vec<String> = new
        .stored_columns()
        .filter(|c| old_names.contains(c.name.as_str()))
        .map(|c| c.name.clone())
        .collect();

    let mut statements = vec![ddl::create_table(new, Some(&temp))?];
    if !common.is_empty() {
        let list = ddl::ident_list(&common);
        statements.push(format!(
            "INSERT INTO {} ({}) SELECT {} FROM {}",
            ddl::quote_ident(&temp),
            list,
            list,
            ddl::quote_ident(&old.name)
        ));
    }
    statements.push(ddl::drop_table(&old.name));
    statements.push(ddl::rename_table(&temp, &new.name));
    Ok(statements)
}

fn full_text_changed(old: &TableSchema, new: &TableSchema) -> bool {
    let names = |t: &TableSchema| -> Vec<String> { t.columns.iter().map(|c| c.name.clone()).collect() };
    old.full_text != new.full_text || names(old) != names(new)
}

/// Regular tables in creation order: referenced tables before the tables
/// that reference them. Cycles fall back to name order.
fn creation_order<'a>(tables: &[&'a TableSchema]) -> Vec<&'a TableSchema> {
    let pending: BTreeMap<&str, &TableSchema> = tables.iter().map(|&t| (t.name.as_str(), t)).collect();
    let mut placed: BTreeSet<&str> = BTreeSet::new();
    let mut order = Vec::with_capacity(tables.len());

    while order.len() < pending.len() {
        let ready: Vec<&TableSchema> = pending
            .values()
            .filter(|t| !placed.contains(t.name.as_str()))
            .filter(|t| {
                t.columns.iter().all(|c| match &c.references {
                    Some(fk) => {
                        fk.table == t.name
                            || !pending.contains_key(fk.table.as_str())
                            || placed.contains(fk.table.as_str())
                    }
                    None => true,
                })
            })
            .copied()
            .collect();
        let next = if ready.is_empty() {
            pending
                .values()
                .filter(|t| !placed.contains(t.name.as_str()))
                .copied()
                .take(1)
                .collect()
        } else {
            ready
        };
        for table in next {
            placed.insert(table.name.as_str());
            order.push(table);
        }
    }
    order
}

fn index_steps(table: &TableSchema, indexes: &[&IndexDef]) -> Vec<MigrationStep> {
    indexes
        .iter()
        .map(|i| MigrationStep::CreateIndex {
            table: table.name.clone(),
            index: i.name.clone(),
            sql: ddl::create_index(&table.name, i),
        })
        .collect()
}

/// Compute the plan that turns `old` into `new`.
pub fn diff(old: &Schema, new: &Schema) -> Result<MigrationPlan> {
    let mut drop_triggers = Vec::new();
    let mut drop_indexes = Vec::new();
    let mut drop_tables = Vec::new();
    let mut create_tables = Vec::new();
    let mut alters = Vec::new();
    let mut create_indexes = Vec::new();
    let mut full_text = Vec::new();

    // Regular tables whose column set is created or changed this migration.
    let mut touched: HashSet<String> = HashSet::new();

    for old_table in old.tables() {
        match new.table(&old_table.name) {
            Some(t) if t.is_full_text() == old_table.is_full_text() => {}
            _ => {
                if old_table.is_full_text() {
                    drop_triggers.extend(ddl::drop_full_text_triggers(&old_table.name));
                }
                drop_tables.push(old_table);
            }
        }
    }

    let mut new_regular = Vec::new();
    for new_table in new.tables().filter(|t| !t.is_full_text()) {
        match old.table(&new_table.name).filter(|t| !t.is_full_text()) {
            None => {
                new_regular.push(new_table);
                touched.insert(new_table.name.clone());
            }
            Some(old_table) => match compare_table(old_table, new_table)? {
                TableChange::Unchanged => {
                    diff_indexes(old_table, new_table, &mut drop_indexes, &mut create_indexes);
                }
                TableChange::Alter { add, drop } => {
                    touched.insert(new_table.name.clone());
                    diff_indexes(old_table, new_table, &mut drop_indexes, &mut create_indexes);
                    for name in add {
                        if let Some(column) = new_table.column(&name) {
                            alters.push(MigrationStep::AddColumn {
                                table: new_table.name.clone(),
                                sql: ddl::add_column(&new_table.name, column)?,
                                column: name,
                            });
                        }
                    }
                    for name in drop {
                        alters.push(MigrationStep::DropColumn {
                            table: new_table.name.clone(),
                            sql: ddl::drop_column(&new_table.name, &name),
                            column: name,
                        });
                    }
                }
                TableChange::Rebuild(reason) => {
                    touched.insert(new_table.name.clone());
                    alters.push(MigrationStep::RebuildTable {
                        table: new_table.name.clone(),
                        reason,
                        statements: rebuild_statements(old_table, new_table)?,
                    });
                    let all: Vec<&IndexDef> = new_table.indexes.iter().collect();
                    create_indexes.extend(index_steps(new_table, &all));
                }
            },
        }
    }

    for table in creation_order(&new_regular) {
        create_tables.push(MigrationStep::CreateTable {
            table: table.name.clone(),
            sql: ddl::create_table(table, None)?,
        });
        let all: Vec<&IndexDef> = table.indexes.iter().collect();
        create_indexes.extend(index_steps(table, &all));
    }

    for fts in new.tables().filter(|t| t.is_full_text()) {
        let config = fts.full_text.as_ref();
        let base_touched = config
            .and_then(|c| c.content.as_ref())
            .map(|c| touched.contains(c))
            .unwrap_or(false);
        let existing = old.table(&fts.name).filter(|t| t.is_full_text());

        let recreate = match existing {
            None => true,
            Some(old_fts) if full_text_changed(old_fts, fts) => {
                drop_triggers.extend(ddl::drop_full_text_triggers(&fts.name));
                drop_tables.push(old_fts);
                true
            }
            Some(_) => false,
        };
        if !recreate && !base_touched {
            continue;
        }
        if recreate {
            full_text.push(MigrationStep::CreateFullText {
                table: fts.name.clone(),
                sql: ddl::create_full_text(fts),
            });
        } else {
            drop_triggers.extend(ddl::drop_full_text_triggers(&fts.name));
        }
        let triggers = ddl::full_text_triggers(fts);
        if !triggers.is_empty() {
            for sql in triggers {
                full_text.push(MigrationStep::CreateTrigger {
                    table: fts.name.clone(),
                    sql,
                });
            }
            full_text.push(MigrationStep::RebuildFullText {
                table: fts.name.clone(),
                sql: ddl::full_text_rebuild(&fts.name),
            });
        }
    }

    let mut steps: Vec<MigrationStep> = drop_triggers
        .into_iter()
        .map(|sql| MigrationStep::DropTrigger { sql })
        .collect();
    steps.extend(drop_indexes);

    // Full-text tables go first so nothing mirrors a dropped base table.
    drop_tables.sort_by_key(|t| (!t.is_full_text(), t.name.clone()));
    for table in drop_tables {
        let rebuildable = table
            .full_text
            .as_ref()
            .map(|c| c.content.is_some())
            .unwrap_or(false);
        steps.push(MigrationStep::DropTable {
            table: table.name.clone(),
            sql: ddl::drop_table(&table.name),
            rebuildable,
        });
    }

    steps.extend(create_tables);
    steps.extend(alters);
    steps.extend(create_indexes);
    steps.extend(full_text);

    Ok(MigrationPlan::new(steps))
}

fn diff_indexes(
    old: &TableSchema,
    new: &TableSchema,
    drops: &mut Vec<MigrationStep>,
    creates: &mut Vec<MigrationStep>,
) {
    let old_signatures: HashSet<(Vec<String>, bool)> = old.indexes.iter().map(IndexDef::signature).collect();
    let new_signatures: HashSet<(Vec<String>, bool)> = new.indexes.iter().map(IndexDef::signature).collect();

    for index in &old.indexes {
        if !new_signatures.contains(&index.signature()) {
            drops.push(MigrationStep::DropIndex {
                index: index.name.clone(),
                sql: ddl::drop_index(&index.name),
            });
        }
    }
    let added: Vec<&IndexDef> = new
        .indexes
        .iter()
        .filter(|i| !old_signatures.contains(&i.signature()))
        .collect();
    creates.extend(index_steps(new, &added));
}

/// Default value recovered from `PRAGMA table_info`.
pub(crate) fn parse_default(text: &str) -> Option<ColumnDefault> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("NULL") {
        return None;
    }
    if text.starts_with('(') || text.to_ascii_lowercase().starts_with("strftime") {
        return Some(ColumnDefault::Now);
    }
    if text.starts_with('\'') {
        return Some(ColumnDefault::Value(Value::Text(ddl::unquote(text))));
    }
    if let Ok(i) = text.parse::<i64>() {
        return Some(ColumnDefault::Value(Value::Integer(i)));
    }
    text.parse::<f64>()
        .ok()
        .map(|r| ColumnDefault::Value(Value::Real(r)))
}
