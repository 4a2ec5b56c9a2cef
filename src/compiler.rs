//! Query compiler: structural descriptions to parameterized SQLite SQL.
//!
//! Caller values always become numbered parameters (`?1`, `?2`, ...), in the
//! order they are compiled. CTEs and derived tables compile before the
//! select list that reads from them.

use crate::builder::{Delete, Insert, JoinType, OnConflict, Projection, Select, Source, Statement, Update};
use crate::ddl::{self, quote_ident, quote_str};
use crate::error::{OrmError, Result};
use crate::expr::{AggregateFunc, BinaryOp, ColumnRef, Expr, LogicalOp, Over, UnaryOp, WindowFunc, WindowSpec};
use crate::schema::{ColumnDef, ColumnType, Schema, TableSchema};
use crate::value::{Value, Values};
use chrono::{DateTime, Utc};
use std::fmt;

/// Name and semantic type of one result column.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputColumn {
    pub name: String,
    /// `None` when the type cannot be inferred (bare JSON paths, NULL).
    pub column_type: Option<ColumnType>,
}

/// Compiled statement, ready for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<Value>,
    pub columns: Vec<OutputColumn>,
    /// The select list is exactly one expression; rows map to bare values.
    pub scalar: bool,
    /// The statement produces rows (SELECT or DML with RETURNING).
    pub returning: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Clause {
    Select,
    Where,
    On,
    GroupBy,
    Having,
    Window,
    OrderBy,
    Dml,
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Clause::Select => "select list",
            Clause::Where => "WHERE",
            Clause::On => "JOIN ON",
            Clause::GroupBy => "GROUP BY",
            Clause::Having => "HAVING",
            Clause::Window => "window definition",
            Clause::OrderBy => "ORDER BY",
            Clause::Dml => "data modification",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy)]
struct Ctx {
    clause: Clause,
    in_aggregate: bool,
}

impl Ctx {
    fn new(clause: Clause) -> Self {
        Self {
            clause,
            in_aggregate: false,
        }
    }
}

#[derive(Debug, Clone)]
struct ScopeColumn {
    name: String,
    column_type: Option<ColumnType>,
    computed: Option<Expr>,
    stored_json: bool,
    /// Addressable but not part of the default select list.
    hidden: bool,
}

#[derive(Debug, Clone)]
struct SourceScope {
    alias: String,
    table: String,
    columns: Vec<ScopeColumn>,
    full_text: bool,
}

impl SourceScope {
    fn for_table(table: &TableSchema, alias: &str) -> Self {
        let mut columns: Vec<ScopeColumn> = table
            .columns
            .iter()
            .map(|c| ScopeColumn {
                name: c.name.clone(),
                column_type: Some(c.column_type),
                computed: c.computed.clone(),
                stored_json: c.column_type == ColumnType::Json && !c.is_computed(),
                hidden: false,
            })
            .collect();
        if table.is_full_text() {
            for (name, ty) in [("rowid", ColumnType::Integer), ("rank", ColumnType::Real)] {
                columns.push(ScopeColumn {
                    name: name.to_string(),
                    column_type: Some(ty),
                    computed: None,
                    stored_json: false,
                    hidden: true,
                });
            }
        }
        Self {
            alias: alias.to_string(),
            table: table.name.clone(),
            columns,
            full_text: table.is_full_text(),
        }
    }

    fn for_outputs(name: &str, alias: &str, outputs: &[OutputColumn]) -> Self {
        Self {
            alias: alias.to_string(),
            table: name.to_string(),
            columns: outputs
                .iter()
                .map(|o| ScopeColumn {
                    name: o.name.clone(),
                    column_type: o.column_type,
                    computed: None,
                    stored_json: false,
                    hidden: false,
                })
                .collect(),
            full_text: false,
        }
    }
}

#[derive(Debug, Default)]
struct Frame {
    sources: Vec<SourceScope>,
    qualify: bool,
    outputs: Vec<OutputColumn>,
    windows: Vec<String>,
}

type Typed = (String, Option<ColumnType>);

fn literal_type(value: &Value) -> Option<ColumnType> {
    match value {
        Value::Null => None,
        Value::Bool(_) => Some(ColumnType::Boolean),
        Value::Integer(_) => Some(ColumnType::Integer),
        Value::Real(_) => Some(ColumnType::Real),
        Value::Text(_) => Some(ColumnType::Text),
        Value::Blob(_) => Some(ColumnType::Blob),
        Value::Date(_) => Some(ColumnType::Date),
        Value::Json(_) => Some(ColumnType::Json),
    }
}

fn compatible(a: Option<ColumnType>, b: Option<ColumnType>) -> bool {
    use ColumnType::*;
    match (a, b) {
        (None, _) | (_, None) => true,
        (Some(x), Some(y)) if x == y => true,
        (Some(x), Some(y)) if x.is_numeric() && y.is_numeric() => true,
        (Some(Json), _) | (_, Some(Json)) => true,
        (Some(Date), Some(Text)) | (Some(Text), Some(Date)) => true,
        (Some(Boolean), Some(Integer)) | (Some(Integer), Some(Boolean)) => true,
        _ => false,
    }
}

fn type_name(ty: Option<ColumnType>) -> &'static str {
    ty.map(|t| t.name()).unwrap_or("unknown")
}

fn numeric_or_unknown(ty: Option<ColumnType>) -> bool {
    ty.map(|t| t.is_numeric()).unwrap_or(true)
}

fn wrap_operand(expr: &Expr, sql: String) -> String {
    match expr {
        Expr::Binary { .. } | Expr::Logical { .. } => format!("({})", sql),
        _ => sql,
    }
}

fn column_label(c: &ColumnRef) -> String {
    match &c.table {
        Some(t) => format!("{}.{}", t, c.column),
        None => c.column.clone(),
    }
}

fn output_name(expr: &Expr, index: usize) -> String {
    match expr {
        Expr::Column(c) => c.column.clone(),
        Expr::JsonPath { expr, .. } => output_name(expr, index),
        Expr::Aggregate { func, .. } => func.name().to_ascii_lowercase(),
        Expr::WindowFunction { func, .. } => func.name().to_ascii_lowercase(),
        Expr::Windowed { call, .. } => output_name(call, index),
        _ => format!("column{}", index + 1),
    }
}

fn aliased(sql: String, name: &str) -> String {
    let quoted = quote_ident(name);
    if sql == quoted {
        sql
    } else {
        format!("{} AS {}", sql, quoted)
    }
}

fn stored_column<'t>(table: &'t TableSchema, name: &str) -> Result<&'t ColumnDef> {
    match table.column(name) {
        Some(c) if c.is_computed() => Err(OrmError::compile(format!(
            "cannot write computed column {}.{}",
            table.name, name
        ))),
        Some(c) => Ok(c),
        None => Err(OrmError::compile(format!(
            "unknown column {}.{}",
            table.name, name
        ))),
    }
}

/// Value as it will be written to `column`. Date text is parsed and
/// normalized so every stored date reads back.
fn stored_value(table: &TableSchema, column: &ColumnDef, value: &Value) -> Result<Value> {
    if !column.column_type.accepts(value) {
        return Err(OrmError::compile(format!(
            "cannot store {} in {} column {}.{}",
            value.kind(),
            column.column_type.name(),
            table.name,
            column.name
        )));
    }
    match (column.column_type, value) {
        (ColumnType::Date, Value::Text(text)) => DateTime::parse_from_rfc3339(text)
            .map(|d| Value::Date(d.with_timezone(&Utc)))
            .map_err(|e| {
                OrmError::conversion(format!(
                    "column {}.{}: malformed date {:?}: {}",
                    table.name, column.name, text, e
                ))
            }),
        _ => Ok(value.clone()),
    }
}

/// Compiles structural statements against one schema.
#[derive(Debug, Clone, Copy)]
pub struct QueryCompiler<'s> {
    schema: &'s Schema,
}

impl<'s> QueryCompiler<'s> {
    pub fn new(schema: &'s Schema) -> Self {
        Self { schema }
    }

    fn session(&self) -> Compilation<'s> {
        Compilation {
            schema: self.schema,
            params: Vec::new(),
            frames: Vec::new(),
            ctes: Vec::new(),
        }
    }

    pub fn compile_select(&self, select: &Select) -> Result<CompiledQuery> {
        let mut session = self.session();
        let (sql, columns) = session.select(select)?;
        let scalar = matches!(select.projections.as_slice(), [Projection::Expr { .. }]);
        Ok(CompiledQuery {
            sql,
            params: session.params,
            columns,
            scalar,
            returning: true,
        })
    }

    /// One statement per row.
    pub fn compile_insert(&self, insert: &Insert) -> Result<Vec<CompiledQuery>> {
        let table = self.table(&insert.table)?;
        let mut out = Vec::with_capacity(insert.rows.len());
        for row in &insert.rows {
            let mut session = self.session();
            let query = session.with_frame(Frame::dml(table), |s| {
                s.insert_row(table, row, insert.on_conflict.as_ref(), insert.returning)
            })?;
            out.push(query);
        }
        Ok(out)
    }

    /// Single statement expanding a JSON array server-side, or `None` when
    /// the rows do not qualify (differing column sets, binary values).
    pub fn compile_bulk_insert(&self, insert: &Insert) -> Result<Option<CompiledQuery>> {
        let table = self.table(&insert.table)?;
        let Some(first) = insert.rows.first() else {
            return Ok(None);
        };
        let mut names: Vec<&String> = first.keys().collect();
        names.sort();
        if names.is_empty() || insert.returning {
            return Ok(None);
        }
        for row in &insert.rows {
            if row.len() != names.len() || names.iter().any(|n| !row.contains_key(*n)) {
                return Ok(None);
            }
            if row.values().any(|v| matches!(v, Value::Blob(_))) {
                return Ok(None);
            }
        }

        let mut columns = Vec::with_capacity(names.len());
        let mut selects = Vec::with_capacity(names.len());
        let mut stored = insert.rows.clone();
        for name in &names {
            let column = stored_column(table, name)?;
            for row in stored.iter_mut() {
                if let Some(value) = row.get_mut(name.as_str()) {
                    *value = stored_value(table, column, value)?;
                }
            }
            let path = quote_str(&format!("$.\"{}\"", name));
            columns.push(quote_ident(name));
            selects.push(if column.column_type == ColumnType::Json {
                format!("jsonb(nullif(value -> {}, 'null'))", path)
            } else {
                format!("value ->> {}", path)
            });
        }

        let rows: Vec<serde_json::Value> = stored
            .iter()
            .map(|row| {
                let object = names
                    .iter()
                    .map(|n| (n.to_string(), ddl::json_value(&row[*n])))
                    .collect::<serde_json::Map<_, _>>();
                serde_json::Value::Object(object)
            })
            .collect();

        let mut sql = format!(
            "INSERT INTO {} ({}) SELECT {} FROM json_each(?1)",
            quote_ident(&table.name),
            columns.join(", "),
            selects.join(", ")
        );
        if let Some(conflict) = &insert.on_conflict {
            // WHERE disambiguates ON CONFLICT from a join constraint.
            sql.push_str(" WHERE true");
            sql.push_str(&conflict_clause(table, conflict)?);
        }

        Ok(Some(CompiledQuery {
            sql,
            params: vec![Value::Text(serde_json::Value::Array(rows).to_string())],
            columns: Vec::new(),
            scalar: false,
            returning: false,
        }))
    }

    pub fn compile_update(&self, update: &Update) -> Result<CompiledQuery> {
        let table = self.table(&update.table)?;
        let mut session = self.session();
        let (sql, columns) = session.with_frame(Frame::dml(table), |s| s.update(table, update))?;
        Ok(CompiledQuery {
            sql,
            params: session.params,
            columns,
            scalar: false,
            returning: update.returning,
        })
    }

    pub fn compile_delete(&self, delete: &Delete) -> Result<CompiledQuery> {
        let table = self.table(&delete.table)?;
        let mut session = self.session();
        let (sql, columns) = session.with_frame(Frame::dml(table), |s| {
            let mut sql = format!("DELETE FROM {}", quote_ident(&table.name));
            if let Some(filter) = &delete.filter {
                let (cond, _) = s.expr(filter, Ctx::new(Clause::Where))?;
                sql.push_str(&format!(" WHERE {}", cond));
            }
            let mut columns = Vec::new();
            if delete.returning {
                let (list, outputs) = s.returning_list()?;
                sql.push_str(&format!(" RETURNING {}", list));
                columns = outputs;
            }
            Ok((sql, columns))
        })?;
        Ok(CompiledQuery {
            sql,
            params: session.params,
            columns,
            scalar: false,
            returning: delete.returning,
        })
    }

    pub fn compile(&self, statement: &Statement) -> Result<Vec<CompiledQuery>> {
        match statement {
            Statement::Select(s) => Ok(vec![self.compile_select(s)?]),
            Statement::Insert(i) => self.compile_insert(i),
            Statement::Update(u) => Ok(vec![self.compile_update(u)?]),
            Statement::Delete(d) => Ok(vec![self.compile_delete(d)?]),
        }
    }

    fn table(&self, name: &str) -> Result<&'s TableSchema> {
        self.schema
            .table(name)
            .ok_or_else(|| OrmError::compile(format!("unknown table {}", name)))
    }
}

fn conflict_clause(table: &TableSchema, conflict: &OnConflict) -> Result<String> {
    for column in &conflict.target {
        stored_column(table, column)?;
    }
    if !table.is_unique_set(&conflict.target) {
        return Err(OrmError::compile(format!(
            "conflict target ({}) on {} is neither a primary key nor unique",
            conflict.target.join(", "),
            table.name
        )));
    }
    let target = ddl::ident_list(&conflict.target);
    if conflict.update.is_empty() {
        return Ok(format!(" ON CONFLICT ({}) DO NOTHING", target));
    }
    let mut sets = Vec::with_capacity(conflict.update.len());
    for column in &conflict.update {
        stored_column(table, column)?;
        let name = quote_ident(column);
        sets.push(format!("{} = excluded.{}", name, name));
    }
    Ok(format!(
        " ON CONFLICT ({}) DO UPDATE SET {}",
        target,
        sets.join(", ")
    ))
}

impl Frame {
    fn dml(table: &TableSchema) -> Self {
        Frame {
            sources: vec![SourceScope::for_table(table, &table.name)],
            ..Frame::default()
        }
    }
}

struct Compilation<'s> {
    schema: &'s Schema,
    params: Vec<Value>,
    frames: Vec<Frame>,
    ctes: Vec<(String, Vec<OutputColumn>)>,
}

impl<'s> Compilation<'s> {
    fn param(&mut self, value: Value) -> String {
        self.params.push(value);
        format!("?{}", self.params.len())
    }

    /// Parameter destined for storage in a column of `column_type`.
    fn storage_param(&mut self, column_type: ColumnType, value: Value) -> String {
        match (column_type, value) {
            (ColumnType::Json, Value::Null) => self.param(Value::Null),
            (ColumnType::Json, v) => {
                let p = self.param(Value::Json(ddl::json_value(&v)));
                format!("jsonb({})", p)
            }
            (_, v) => self.param(v),
        }
    }

    fn with_frame<T>(&mut self, frame: Frame, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.frames.push(frame);
        let result = f(self);
        self.frames.pop();
        result
    }

    fn frame(&self) -> Result<&Frame> {
        self.frames
            .last()
            .ok_or_else(|| OrmError::compile("expression outside of a query"))
    }

    fn frame_mut(&mut self) -> Result<&mut Frame> {
        self.frames
            .last_mut()
            .ok_or_else(|| OrmError::compile("expression outside of a query"))
    }

    fn select(&mut self, select: &Select) -> Result<(String, Vec<OutputColumn>)> {
        let mark = self.ctes.len();
        let result = self.select_with_ctes(select);
        self.ctes.truncate(mark);
        result
    }

    fn select_with_ctes(&mut self, select: &Select) -> Result<(String, Vec<OutputColumn>)> {
        let mut sql = String::new();
        if !select.ctes.is_empty() {
            let mut parts = Vec::with_capacity(select.ctes.len());
            for cte in &select.ctes {
                let (body, columns) = self.select(&cte.select)?;
                parts.push(format!("{} AS ({})", quote_ident(&cte.name), body));
                self.ctes.push((cte.name.clone(), columns));
            }
            sql.push_str(&format!("WITH {} ", parts.join(", ")));
        }

        let (from_sql, from_scope) = self.source(&select.from)?;
        let mut sources = vec![from_scope];
        let mut join_sql = Vec::with_capacity(select.joins.len());
        for join in &select.joins {
            let (source_sql, scope) = self.source(&join.source)?;
            if sources.iter().any(|s| s.alias == scope.alias) {
                return Err(OrmError::compile(format!(
                    "table alias {} is used twice; alias one of the tables",
                    scope.alias
                )));
            }
            sources.push(scope);
            join_sql.push(source_sql);
        }

        let frame = Frame {
            sources,
            qualify: !select.joins.is_empty(),
            outputs: Vec::new(),
            windows: select.windows.iter().map(|(n, _)| n.clone()).collect(),
        };
        let (body, columns) =
            self.with_frame(frame, |s| s.select_body(select, from_sql, join_sql))?;
        sql.push_str(&body);
        Ok((sql, columns))
    }

    fn source(&mut self, source: &Source) -> Result<(String, SourceScope)> {
        match source {
            Source::Table { table, alias } => {
                let sql = if alias == table {
                    quote_ident(table)
                } else {
                    format!("{} AS {}", quote_ident(table), quote_ident(alias))
                };
                if let Some((_, columns)) = self.ctes.iter().rev().find(|(n, _)| n == table) {
                    return Ok((sql, SourceScope::for_outputs(table, alias, columns)));
                }
                let schema_table = self
                    .schema
                    .table(table)
                    .ok_or_else(|| OrmError::compile(format!("unknown table {}", table)))?;
                Ok((sql, SourceScope::for_table(schema_table, alias)))
            }
            Source::Subquery { select, alias } => {
                let (body, columns) = self.select(select)?;
                Ok((
                    format!("({}) AS {}", body, quote_ident(alias)),
                    SourceScope::for_outputs(alias, alias, &columns),
                ))
            }
        }
    }

    fn select_body(
        &mut self,
        select: &Select,
        from_sql: String,
        join_sql: Vec<String>,
    ) -> Result<(String, Vec<OutputColumn>)> {
        let (list, columns) = self.projections(select)?;
        self.frame_mut()?.outputs = columns.clone();

        let mut sql = format!(
            "SELECT {}{} FROM {}",
            if select.distinct { "DISTINCT " } else { "" },
            list,
            from_sql
        );

        for (join, source_sql) in select.joins.iter().zip(join_sql) {
            sql.push_str(&format!(" {} {}", join.join_type, source_sql));
            match (&join.on, join.join_type) {
                (Some(on), _) => {
                    let (cond, _) = self.expr(on, Ctx::new(Clause::On))?;
                    sql.push_str(&format!(" ON {}", cond));
                }
                (None, JoinType::Cross) => {}
                (None, _) => {
                    return Err(OrmError::compile(format!(
                        "{} on {} needs an ON condition",
                        join.join_type,
                        join.source.alias()
                    )))
                }
            }
        }

        if let Some(filter) = &select.filter {
            let (cond, _) = self.expr(filter, Ctx::new(Clause::Where))?;
            sql.push_str(&format!(" WHERE {}", cond));
        }

        if !select.group_by.is_empty() {
            let terms = self.expr_list(&select.group_by, Ctx::new(Clause::GroupBy))?;
            sql.push_str(&format!(" GROUP BY {}", terms.join(", ")));
        }

        if let Some(having) = &select.having {
            let (cond, _) = self.expr(having, Ctx::new(Clause::Having))?;
            sql.push_str(&format!(" HAVING {}", cond));
        }

        if !select.windows.is_empty() {
            let mut defs = Vec::with_capacity(select.windows.len());
            for (name, spec) in &select.windows {
                defs.push(format!("{} AS ({})", quote_ident(name), self.window_spec(spec)?));
            }
            sql.push_str(&format!(" WINDOW {}", defs.join(", ")));
        }

        if !select.order_by.is_empty() {
            let mut terms = Vec::with_capacity(select.order_by.len());
            for term in &select.order_by {
                let (e, _) = self.expr(&term.expr, Ctx::new(Clause::OrderBy))?;
                terms.push(format!("{} {}", e, term.direction));
            }
            sql.push_str(&format!(" ORDER BY {}", terms.join(", ")));
        }

        match (select.limit, select.offset) {
            (Some(limit), offset) => {
                let p = self.param(Value::Integer(limit as i64));
                sql.push_str(&format!(" LIMIT {}", p));
                if let Some(offset) = offset {
                    let p = self.param(Value::Integer(offset as i64));
                    sql.push_str(&format!(" OFFSET {}", p));
                }
            }
            (None, Some(offset)) => {
                let p = self.param(Value::Integer(offset as i64));
                sql.push_str(&format!(" LIMIT -1 OFFSET {}", p));
            }
            (None, None) => {}
        }

        Ok((sql, columns))
    }

    fn projections(&mut self, select: &Select) -> Result<(String, Vec<OutputColumn>)> {
        let mut items = Vec::new();
        let mut columns = Vec::new();

        if select.projections.is_empty() {
            let sources = self.frame()?.sources.clone();
            for source in &sources {
                self.all_columns(source, &select.omit, &mut items, &mut columns)?;
            }
        }

        for (index, projection) in select.projections.iter().enumerate() {
            match projection {
                Projection::AllOf(alias) => {
                    let source = self
                        .frame()?
                        .sources
                        .iter()
                        .find(|s| &s.alias == alias)
                        .cloned()
                        .ok_or_else(|| {
                            OrmError::compile(format!("unknown table alias {}", alias))
                        })?;
                    self.all_columns(&source, &select.omit, &mut items, &mut columns)?;
                }
                Projection::Expr { expr, alias } => {
                    let (sql, column_type) = self.expr(expr, Ctx::new(Clause::Select))?;
                    let name = alias.clone().unwrap_or_else(|| output_name(expr, index));
                    items.push(aliased(sql, &name));
                    columns.push(OutputColumn { name, column_type });
                }
            }
        }

        if items.is_empty() {
            return Err(OrmError::compile("select list is empty"));
        }
        Ok((items.join(", "), columns))
    }

    fn all_columns(
        &mut self,
        source: &SourceScope,
        omit: &[String],
        items: &mut Vec<String>,
        columns: &mut Vec<OutputColumn>,
    ) -> Result<()> {
        let qualify = self.frame()?.qualify;
        for column in source.columns.iter().filter(|c| !c.hidden) {
            let name = if qualify {
                format!("{}.{}", source.alias, column.name)
            } else {
                column.name.clone()
            };
            if omit.iter().any(|o| *o == name || *o == column.name) {
                continue;
            }
            let sql = self.column_sql(&source.alias, column, qualify, true)?;
            items.push(aliased(sql, &name));
            columns.push(OutputColumn {
                name,
                column_type: column.column_type,
            });
        }
        Ok(())
    }

    /// Default projection of the single DML target, unqualified.
    fn returning_list(&mut self) -> Result<(String, Vec<OutputColumn>)> {
        let source = self
            .frame()?
            .sources
            .first()
            .cloned()
            .ok_or_else(|| OrmError::compile("RETURNING without a target table"))?;
        let mut items = Vec::new();
        let mut columns = Vec::new();
        self.all_columns(&source, &[], &mut items, &mut columns)?;
        Ok((items.join(", "), columns))
    }

    fn column_sql(
        &self,
        alias: &str,
        column: &ScopeColumn,
        qualify: bool,
        json_text: bool,
    ) -> Result<String> {
        if let Some(expr) = &column.computed {
            // Qualified in every clause.
            let inline = ddl::render_inline_expr(expr, Some(alias))
                .map_err(|e| OrmError::compile(e.to_string()))?;
            return Ok(format!("({})", inline));
        }
        let base = if qualify {
            format!("{}.{}", quote_ident(alias), quote_ident(&column.name))
        } else {
            quote_ident(&column.name)
        };
        if json_text && column.stored_json {
            Ok(format!("json({})", base))
        } else {
            Ok(base)
        }
    }

    /// Resolve a column marker to (frame depth, source alias, column).
    fn resolve(&self, column: &ColumnRef) -> Result<(usize, String, ScopeColumn)> {
        for (depth, frame) in self.frames.iter().enumerate().rev() {
            match &column.table {
                Some(alias) => {
                    if let Some(source) = frame.sources.iter().find(|s| &s.alias == alias) {
                        return source
                            .columns
                            .iter()
                            .find(|c| c.name == column.column)
                            .map(|c| (depth, source.alias.clone(), c.clone()))
                            .ok_or_else(|| {
                                OrmError::compile(format!(
                                    "unknown column {}",
                                    column_label(column)
                                ))
                            });
                    }
                }
                None => {
                    let mut found = frame.sources.iter().filter_map(|s| {
                        s.columns
                            .iter()
                            .find(|c| c.name == column.column)
                            .map(|c| (s, c))
                    });
                    if let Some((source, c)) = found.next() {
                        if found.next().is_some() {
                            return Err(OrmError::compile(format!(
                                "column {} is ambiguous; qualify it with a table",
                                column.column
                            )));
                        }
                        return Ok((depth, source.alias.clone(), c.clone()));
                    }
                }
            }
        }
        Err(OrmError::compile(format!(
            "unknown column {}",
            column_label(column)
        )))
    }

    fn column(&mut self, column: &ColumnRef, json_text: bool) -> Result<Typed> {
        let (depth, alias, scope_column) = self.resolve(column)?;
        // Correlated references always carry their alias.
        let qualify = depth + 1 != self.frames.len() || self.frames[depth].qualify;
        let sql = self.column_sql(&alias, &scope_column, qualify, json_text)?;
        Ok((sql, scope_column.column_type))
    }

    fn expr_list(&mut self, exprs: &[Expr], ctx: Ctx) -> Result<Vec<String>> {
        exprs
            .iter()
            .map(|e| self.expr(e, ctx).map(|(sql, _)| sql))
            .collect()
    }

    fn expr(&mut self, expr: &Expr, ctx: Ctx) -> Result<Typed> {
        match expr {
            Expr::Column(c) => self.column(c, true),
            Expr::Literal(v) => {
                let ty = literal_type(v);
                Ok((self.param(v.clone()), ty))
            }
            Expr::Output(name) => {
                if !matches!(ctx.clause, Clause::OrderBy | Clause::Having) {
                    return Err(OrmError::compile(format!(
                        "select alias {} can only be used in ORDER BY or HAVING",
                        name
                    )));
                }
                let column_type = self
                    .frame()?
                    .outputs
                    .iter()
                    .find(|o| &o.name == name)
                    .map(|o| o.column_type)
                    .ok_or_else(|| {
                        OrmError::compile(format!("unknown select alias {}", name))
                    })?;
                Ok((quote_ident(name), column_type))
            }
            Expr::Unary { op, expr: inner } => {
                let (sql, ty) = self.expr(inner, ctx)?;
                let sql = wrap_operand(inner, sql);
                match op {
                    UnaryOp::Not => Ok((format!("NOT {}", sql), Some(ColumnType::Boolean))),
                    UnaryOp::Neg => {
                        if !numeric_or_unknown(ty) {
                            return Err(OrmError::compile(format!(
                                "cannot negate a {} value",
                                type_name(ty)
                            )));
                        }
                        Ok((format!("-{}", sql), ty))
                    }
                    UnaryOp::IsNull => Ok((format!("{} IS NULL", sql), Some(ColumnType::Boolean))),
                    UnaryOp::IsNotNull => {
                        Ok((format!("{} IS NOT NULL", sql), Some(ColumnType::Boolean)))
                    }
                }
            }
            Expr::Binary { left, op, right } => self.binary(left, *op, right, ctx),
            Expr::Logical { op, operands } => {
                if operands.is_empty() {
                    let empty = match op {
                        LogicalOp::And => "1",
                        LogicalOp::Or => "0",
                    };
                    return Ok((empty.to_string(), Some(ColumnType::Boolean)));
                }
                let mut parts = Vec::with_capacity(operands.len());
                for operand in operands {
                    let (sql, _) = self.expr(operand, ctx)?;
                    parts.push(match operand {
                        Expr::Logical { .. } => format!("({})", sql),
                        _ => sql,
                    });
                }
                Ok((parts.join(&format!(" {} ", op)), Some(ColumnType::Boolean)))
            }
            Expr::InList {
                expr: inner,
                list,
                negated,
            } => {
                let (left, ty) = self.expr(inner, ctx)?;
                let mut items = Vec::with_capacity(list.len());
                for item in list {
                    let (sql, item_ty) = self.operand(item, ty, true, ctx)?;
                    if !compatible(ty, item_ty) {
                        return Err(OrmError::compile(format!(
                            "IN list mixes {} with {}",
                            type_name(ty),
                            type_name(item_ty)
                        )));
                    }
                    items.push(sql);
                }
                Ok((
                    format!(
                        "{} {}IN ({})",
                        wrap_operand(inner, left),
                        if *negated { "NOT " } else { "" },
                        items.join(", ")
                    ),
                    Some(ColumnType::Boolean),
                ))
            }
            Expr::InSubquery {
                expr: inner,
                subquery,
                negated,
            } => {
                let (left, ty) = self.expr(inner, ctx)?;
                let (sub, columns) = self.select(subquery)?;
                let sub_ty = single_column(&columns, "IN")?;
                if !compatible(ty, sub_ty) {
                    return Err(OrmError::compile(format!(
                        "IN subquery compares {} with {}",
                        type_name(ty),
                        type_name(sub_ty)
                    )));
                }
                Ok((
                    format!(
                        "{} {}IN ({})",
                        wrap_operand(inner, left),
                        if *negated { "NOT " } else { "" },
                        sub
                    ),
                    Some(ColumnType::Boolean),
                ))
            }
            Expr::Exists { subquery, negated } => {
                let (sub, _) = self.select(subquery)?;
                Ok((
                    format!("{}EXISTS ({})", if *negated { "NOT " } else { "" }, sub),
                    Some(ColumnType::Boolean),
                ))
            }
            Expr::Subquery(select) => {
                let (sub, columns) = self.select(select)?;
                let ty = single_column(&columns, "scalar")?;
                Ok((format!("({})", sub), ty))
            }
            Expr::JsonPath { expr: inner, path } => {
                let (base, ty) = match inner.as_ref() {
                    Expr::Column(c) => self.column(c, false)?,
                    other => self.expr(other, ctx)?,
                };
                if ty != Some(ColumnType::Json) {
                    return Err(OrmError::compile(format!(
                        "JSON path {} applied to a {} value",
                        path,
                        type_name(ty)
                    )));
                }
                let p = self.param(Value::Text(path.clone()));
                Ok((format!("json_extract({}, {})", base, p), None))
            }
            Expr::Aggregate {
                func,
                arg,
                distinct,
            } => self.aggregate(*func, arg.as_deref(), *distinct, ctx),
            Expr::WindowFunction { func, .. } => Err(OrmError::compile(format!(
                "window function {} requires over()",
                func.name()
            ))),
            Expr::Windowed { call, over } => self.windowed(call, over, ctx),
            Expr::Match { table, query } => self.full_text_match(table, query, ctx),
        }
    }

    /// Compile one side of a comparison. Literals take their treatment from
    /// the type on the other side.
    fn operand(
        &mut self,
        expr: &Expr,
        other: Option<ColumnType>,
        comparison: bool,
        ctx: Ctx,
    ) -> Result<Typed> {
        match expr {
            Expr::Literal(v) if comparison && other == Some(ColumnType::Json) && !v.is_null() => {
                let p = self.param(Value::Json(ddl::json_value(v)));
                Ok((format!("json({})", p), Some(ColumnType::Json)))
            }
            _ => self.expr(expr, ctx),
        }
    }

    fn binary(&mut self, left: &Expr, op: BinaryOp, right: &Expr, ctx: Ctx) -> Result<Typed> {
        let comparison = op.is_comparison();
        // Compile the non-literal side first so a literal can adopt its type.
        let ((l, lt), (r, rt)) = if matches!(left, Expr::Literal(_)) && !matches!(right, Expr::Literal(_)) {
            let rhs = self.expr(right, ctx)?;
            let lhs = self.operand(left, rhs.1, comparison, ctx)?;
            (lhs, rhs)
        } else {
            let lhs = self.expr(left, ctx)?;
            let rhs = self.operand(right, lhs.1, comparison, ctx)?;
            (lhs, rhs)
        };

        let result = if comparison {
            if !compatible(lt, rt) {
                return Err(OrmError::compile(format!(
                    "cannot compare {} with {} using {}",
                    type_name(lt),
                    type_name(rt),
                    op
                )));
            }
            if op.is_ordering() {
                for ty in [lt, rt] {
                    if matches!(ty, Some(ColumnType::Blob) | Some(ColumnType::Json)) {
                        return Err(OrmError::compile(format!(
                            "{} is not defined for {} values",
                            op,
                            type_name(ty)
                        )));
                    }
                }
            }
            Some(ColumnType::Boolean)
        } else if op.is_pattern() {
            let text_like = |ty: Option<ColumnType>| {
                matches!(ty, None | Some(ColumnType::Text) | Some(ColumnType::Date))
            };
            if !text_like(lt) || !text_like(rt) {
                return Err(OrmError::compile(format!(
                    "{} needs text operands, got {} and {}",
                    op,
                    type_name(lt),
                    type_name(rt)
                )));
            }
            Some(ColumnType::Boolean)
        } else if op.is_arithmetic() {
            if !numeric_or_unknown(lt) || !numeric_or_unknown(rt) {
                return Err(OrmError::compile(format!(
                    "{} needs numeric operands, got {} and {}",
                    op,
                    type_name(lt),
                    type_name(rt)
                )));
            }
            match (lt, rt) {
                (Some(ColumnType::Integer), Some(ColumnType::Integer)) => Some(ColumnType::Integer),
                (None, None) => None,
                _ => Some(ColumnType::Real),
            }
        } else {
            Some(ColumnType::Text)
        };

        Ok((
            format!("{} {} {}", wrap_operand(left, l), op, wrap_operand(right, r)),
            result,
        ))
    }

    fn aggregate(
        &mut self,
        func: AggregateFunc,
        arg: Option<&Expr>,
        distinct: bool,
        ctx: Ctx,
    ) -> Result<Typed> {
        if !matches!(ctx.clause, Clause::Select | Clause::Having) {
            return Err(OrmError::compile(format!(
                "aggregate {} is not allowed in {}",
                func.name(),
                ctx.clause
            )));
        }
        if ctx.in_aggregate {
            return Err(OrmError::compile(format!(
                "aggregate {} cannot be nested inside another aggregate",
                func.name()
            )));
        }
        let inner = Ctx {
            in_aggregate: true,
            ..ctx
        };
        let Some(arg) = arg else {
            if func != AggregateFunc::Count {
                return Err(OrmError::compile(format!("{} needs an argument", func.name())));
            }
            return Ok(("COUNT(*)".to_string(), Some(ColumnType::Integer)));
        };

        let (sql, ty) = self.expr(arg, inner)?;
        let result = match func {
            AggregateFunc::Count => Some(ColumnType::Integer),
            AggregateFunc::Sum | AggregateFunc::Avg => {
                if !numeric_or_unknown(ty) {
                    return Err(OrmError::compile(format!(
                        "{} needs a numeric argument, got {}",
                        func.name(),
                        type_name(ty)
                    )));
                }
                if func == AggregateFunc::Avg {
                    Some(ColumnType::Real)
                } else {
                    ty
                }
            }
            AggregateFunc::Min | AggregateFunc::Max => ty,
            AggregateFunc::GroupConcat => Some(ColumnType::Text),
        };
        Ok((
            format!(
                "{}({}{})",
                func.name(),
                if distinct { "DISTINCT " } else { "" },
                sql
            ),
            result,
        ))
    }

    fn windowed(&mut self, call: &Expr, over: &Over, ctx: Ctx) -> Result<Typed> {
        if ctx.clause != Clause::Select {
            return Err(OrmError::compile(format!(
                "window functions are not allowed in {}",
                ctx.clause
            )));
        }
        let (call_sql, ty) = match call {
            Expr::WindowFunction { func, args } => {
                let mut parts = Vec::with_capacity(args.len());
                let mut first_ty = None;
                for (i, arg) in args.iter().enumerate() {
                    let (sql, t) = self.expr(arg, ctx)?;
                    if i == 0 {
                        first_ty = t;
                    }
                    parts.push(sql);
                }
                let ty = match func {
                    WindowFunc::RowNumber | WindowFunc::Rank | WindowFunc::DenseRank | WindowFunc::Ntile => {
                        Some(ColumnType::Integer)
                    }
                    WindowFunc::PercentRank | WindowFunc::CumeDist => Some(ColumnType::Real),
                    WindowFunc::Lag | WindowFunc::Lead | WindowFunc::FirstValue | WindowFunc::LastValue => {
                        first_ty
                    }
                };
                (format!("{}({})", func.name(), parts.join(", ")), ty)
            }
            Expr::Aggregate { .. } => self.expr(call, ctx)?,
            other => {
                return Err(OrmError::compile(format!(
                    "over() applies to aggregate or window functions, not {:?}",
                    other
                )))
            }
        };

        let window = match over {
            Over::Named(name) => {
                if !self.frame()?.windows.contains(name) {
                    return Err(OrmError::compile(format!("unknown window {}", name)));
                }
                quote_ident(name)
            }
            Over::Spec(spec) => format!("({})", self.window_spec(spec)?),
        };
        Ok((format!("{} OVER {}", call_sql, window), ty))
    }

    fn window_spec(&mut self, spec: &WindowSpec) -> Result<String> {
        let ctx = Ctx::new(Clause::Window);
        let mut parts = Vec::new();
        if !spec.partition_by.is_empty() {
            let terms = self.expr_list(&spec.partition_by, ctx)?;
            parts.push(format!("PARTITION BY {}", terms.join(", ")));
        }
        if !spec.order_by.is_empty() {
            let mut terms = Vec::with_capacity(spec.order_by.len());
            for term in &spec.order_by {
                let (sql, _) = self.expr(&term.expr, ctx)?;
                terms.push(format!("{} {}", sql, term.direction));
            }
            parts.push(format!("ORDER BY {}", terms.join(", ")));
        }
        Ok(parts.join(" "))
    }

    fn full_text_match(&mut self, alias: &str, query: &Expr, ctx: Ctx) -> Result<Typed> {
        if !matches!(ctx.clause, Clause::Where | Clause::On) {
            return Err(OrmError::compile(format!(
                "full-text match is not allowed in {}",
                ctx.clause
            )));
        }
        let source = self
            .frames
            .iter()
            .rev()
            .find_map(|f| f.sources.iter().find(|s| s.alias == alias))
            .cloned()
            .ok_or_else(|| OrmError::compile(format!("unknown table alias {}", alias)))?;
        if !source.full_text {
            return Err(OrmError::compile(format!(
                "{} is not a full-text table",
                source.table
            )));
        }
        let (q, ty) = self.expr(query, ctx)?;
        if !matches!(ty, None | Some(ColumnType::Text)) {
            return Err(OrmError::compile(format!(
                "full-text query must be text, got {}",
                type_name(ty)
            )));
        }
        let target = if source.alias == source.table {
            quote_ident(&source.table)
        } else {
            format!("{}.{}", quote_ident(&source.alias), quote_ident(&source.table))
        };
        Ok((format!("{} MATCH {}", target, q), Some(ColumnType::Boolean)))
    }

    fn insert_row(
        &mut self,
        table: &TableSchema,
        row: &Values,
        on_conflict: Option<&OnConflict>,
        returning: bool,
    ) -> Result<CompiledQuery> {
        let mut names: Vec<&String> = row.keys().collect();
        names.sort();

        let mut columns = Vec::with_capacity(names.len());
        let mut values = Vec::with_capacity(names.len());
        for name in names {
            let column = stored_column(table, name)?;
            let value = stored_value(table, column, &row[name])?;
            columns.push(quote_ident(name));
            values.push(self.storage_param(column.column_type, value));
        }

        let mut sql = if columns.is_empty() {
            if on_conflict.is_some() {
                return Err(OrmError::compile(format!(
                    "upsert into {} needs at least one column",
                    table.name
                )));
            }
            format!("INSERT INTO {} DEFAULT VALUES", quote_ident(&table.name))
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(&table.name),
                columns.join(", "),
                values.join(", ")
            )
        };
        if let Some(conflict) = on_conflict {
            sql.push_str(&conflict_clause(table, conflict)?);
        }

        let mut output = Vec::new();
        if returning {
            let (list, outputs) = self.returning_list()?;
            sql.push_str(&format!(" RETURNING {}", list));
            output = outputs;
        }

        Ok(CompiledQuery {
            sql,
            params: std::mem::take(&mut self.params),
            columns: output,
            scalar: false,
            returning,
        })
    }

    fn update(&mut self, table: &TableSchema, update: &Update) -> Result<(String, Vec<OutputColumn>)> {
        if update.assignments.is_empty() {
            return Err(OrmError::compile(format!(
                "update of {} sets no columns",
                table.name
            )));
        }
        let mut sets = Vec::with_capacity(update.assignments.len());
        for (name, value) in &update.assignments {
            let column = stored_column(table, name)?;
            let sql = match value {
                Expr::Literal(v) => {
                    let v = stored_value(table, column, v)?;
                    self.storage_param(column.column_type, v)
                }
                other => {
                    let (sql, ty) = self.expr(other, Ctx::new(Clause::Dml))?;
                    if !compatible(Some(column.column_type), ty) {
                        return Err(OrmError::compile(format!(
                            "cannot assign {} to {} column {}.{}",
                            type_name(ty),
                            column.column_type.name(),
                            table.name,
                            name
                        )));
                    }
                    if column.column_type == ColumnType::Json {
                        format!("jsonb({})", sql)
                    } else {
                        sql
                    }
                }
            };
            sets.push(format!("{} = {}", quote_ident(name), sql));
        }

        let mut sql = format!("UPDATE {} SET {}", quote_ident(&table.name), sets.join(", "));
        if let Some(filter) = &update.filter {
            let (cond, _) = self.expr(filter, Ctx::new(Clause::Where))?;
            sql.push_str(&format!(" WHERE {}", cond));
        }
        let mut columns = Vec::new();
        if update.returning {
            let (list, outputs) = self.returning_list()?;
            sql.push_str(&format!(" RETURNING {}", list));
            columns = outputs;
        }
        Ok((sql, columns))
    }
}

fn single_column(columns: &[OutputColumn], what: &str) -> Result<Option<ColumnType>> {
    match columns {
        [only] => Ok(only.column_type),
        _ => Err(OrmError::compile(format!(
            "{} subquery must select exactly one column, got {}",
            what,
            columns.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{col, count, lit, output, row_number, sum, Tables, TableRef};
    use crate::schema::{Column, FtsBlueprint, TableBlueprint};
    use chrono::TimeZone;
    use crate::value::values;

    fn schema() -> Schema {
        Schema::from_blueprints(
            [
                TableBlueprint::new("items")
                    .column(Column::text("name"))
                    .column(Column::integer("count").default(0))
                    .column(Column::real("price").default(0.0))
                    .column(Column::json("meta").nullable())
                    .column(Column::boolean("active").default(true))
                    .column(Column::computed(
                        "total",
                        ColumnType::Real,
                        col("price").mul(col("count")),
                    )),
                TableBlueprint::new("tags")
                    .column(Column::integer("item_id").references("items", "id"))
                    .column(Column::text("label").unique()),
                TableBlueprint::new("docs").column(Column::text("body")),
            ],
            [FtsBlueprint::new("docs_fts").columns(["body"]).content("docs")],
        )
        .unwrap()
    }

    #[test]
    fn test_scalar_projection() {
        let schema = schema();
        let items = Tables.table("items");
        let select = Select::from(&items)
            .select([items.col("count")])
            .filter(items.col("id").eq(1));
        let q = QueryCompiler::new(&schema).compile_select(&select).unwrap();
        assert_eq!(q.sql, "SELECT count FROM items WHERE id = ?1");
        assert_eq!(q.params, vec![Value::Integer(1)]);
        assert!(q.scalar);
    }

    #[test]
    fn test_default_projection_expands_computed_and_json() {
        let schema = schema();
        let items = TableRef::new("items");
        let q = QueryCompiler::new(&schema)
            .compile_select(&Select::from(&items).omit(["active"]))
            .unwrap();
        assert_eq!(
            q.sql,
            "SELECT id, name, count, price, json(meta) AS meta, (items.price * items.count) AS total FROM items"
        );
        assert!(!q.scalar);
        assert_eq!(q.columns.len(), 6);
    }

    #[test]
    fn test_computed_expansion_is_identical_everywhere() {
        let schema = schema();
        let items = TableRef::new("items");
        let select = Select::from(&items)
            .select([items.col("name")])
            .filter(items.col("total").gt(10))
            .order_desc(items.col("total"));
        let q = QueryCompiler::new(&schema).compile_select(&select).unwrap();
        assert_eq!(
            q.sql,
            "SELECT name FROM items WHERE (items.price * items.count) > ?1 \
             ORDER BY (items.price * items.count) DESC"
        );

        let q = QueryCompiler::new(&schema)
            .compile_delete(&Delete::from("items").filter(col("total").lt(1)))
            .unwrap();
        assert_eq!(q.sql, "DELETE FROM items WHERE (items.price * items.count) < ?1");
    }

    #[test]
    fn test_join_qualifies_columns() {
        let schema = schema();
        let i = TableRef::aliased("items", "i");
        let t = TableRef::aliased("tags", "t");
        let select = Select::from(&i)
            .select([i.col("name"), t.col("label")])
            .inner_join(&t, t.col("item_id").eq(i.col("id")))
            .filter(i.col("count").gt(2).and(t.col("label").like("a%")));
        let q = QueryCompiler::new(&schema).compile_select(&select).unwrap();
        assert_eq!(
            q.sql,
            "SELECT i.name AS name, t.label AS label FROM items AS i INNER JOIN tags AS t \
             ON t.item_id = i.id WHERE i.count > ?1 AND t.label LIKE ?2"
        );
        assert_eq!(q.params, vec![Value::Integer(2), Value::Text("a%".into())]);
    }

    #[test]
    fn test_json_comparison_and_path() {
        let schema = schema();
        let items = TableRef::new("items");
        let select = Select::from(&items)
            .select([items.col("id")])
            .filter(
                items
                    .col("meta")
                    .eq(serde_json::json!({"a": 1}))
                    .or(items.col("meta").json("$.a").eq(2)),
            );
        let q = QueryCompiler::new(&schema).compile_select(&select).unwrap();
        assert_eq!(
            q.sql,
            "SELECT id FROM items WHERE json(meta) = json(?1) OR json_extract(meta, ?2) = ?3"
        );
        assert_eq!(q.params[1], Value::Text("$.a".into()));
    }

    #[test]
    fn test_unknown_column_and_type_errors() {
        let schema = schema();
        let compiler = QueryCompiler::new(&schema);
        let items = TableRef::new("items");

        let err = compiler
            .compile_select(&Select::from(&items).filter(items.col("missing").eq(1)))
            .unwrap_err();
        assert!(matches!(err, OrmError::QueryCompilation(_)));

        let err = compiler
            .compile_select(&Select::from(&items).filter(items.col("count").like("x%")))
            .unwrap_err();
        assert!(matches!(err, OrmError::QueryCompilation(_)));

        let err = compiler
            .compile_select(&Select::from(&items).filter(items.col("name").eq(3)))
            .unwrap_err();
        assert!(matches!(err, OrmError::QueryCompilation(_)));

        let err = compiler
            .compile_select(&Select::from(&items).filter(items.col("meta").json("$.a").eq(1).and(items.col("name").json("$.x").eq(1))))
            .unwrap_err();
        assert!(matches!(err, OrmError::QueryCompilation(_)));
    }

    #[test]
    fn test_aggregate_misuse() {
        let schema = schema();
        let compiler = QueryCompiler::new(&schema);
        let items = TableRef::new("items");

        let err = compiler
            .compile_select(&Select::from(&items).filter(count().gt(1)))
            .unwrap_err();
        assert!(err.to_string().contains("not allowed in WHERE"));

        let err = compiler
            .compile_select(&Select::from(&items).select([row_number()]))
            .unwrap_err();
        assert!(err.to_string().contains("requires over()"));

        let err = compiler
            .compile_select(&Select::from(&items).order_asc(sum(items.col("count"))))
            .unwrap_err();
        assert!(matches!(err, OrmError::QueryCompilation(_)));
    }

    #[test]
    fn test_group_by_having_with_alias() {
        let schema = schema();
        let items = TableRef::new("items");
        let select = Select::from(&items)
            .select([items.col("name").into(), count().alias("n")])
            .group_by([items.col("name")])
            .having(count().gt(1))
            .order_desc(output("n"))
            .limit(10);
        let q = QueryCompiler::new(&schema).compile_select(&select).unwrap();
        assert_eq!(
            q.sql,
            "SELECT name, COUNT(*) AS n FROM items GROUP BY name HAVING COUNT(*) > ?1 \
             ORDER BY n DESC LIMIT ?2"
        );
        assert_eq!(q.columns[1].column_type, Some(ColumnType::Integer));
    }

    #[test]
    fn test_window_functions() {
        let schema = schema();
        let items = TableRef::new("items");
        let select = Select::from(&items)
            .select([
                items.col("name").into(),
                row_number()
                    .over(WindowSpec::new().order_desc(items.col("count")))
                    .alias("pos"),
                sum(items.col("count")).over("w").alias("running"),
            ])
            .window("w", WindowSpec::new().partition_by(items.col("active")));
        let q = QueryCompiler::new(&schema).compile_select(&select).unwrap();
        assert_eq!(
            q.sql,
            "SELECT name, ROW_NUMBER() OVER (ORDER BY count DESC) AS pos, \
             SUM(count) OVER w AS running FROM items WINDOW w AS (PARTITION BY active)"
        );
    }

    #[test]
    fn test_cte_and_subqueries_number_parameters_in_order() {
        let schema = schema();
        let items = TableRef::new("items");
        let cheap = TableRef::new("cheap");
        let tags = TableRef::new("tags");
        let select = Select::from(&cheap)
            .with(
                "cheap",
                Select::from(&items)
                    .select([items.col("id"), items.col("name")])
                    .filter(items.col("price").lt(5.0)),
            )
            .select([cheap.col("name")])
            .filter(cheap.col("id").in_subquery(
                Select::from(&tags)
                    .select([tags.col("item_id")])
                    .filter(tags.col("label").eq("sale")),
            ));
        let q = QueryCompiler::new(&schema).compile_select(&select).unwrap();
        assert_eq!(
            q.sql,
            "WITH cheap AS (SELECT id, name FROM items WHERE price < ?1) \
             SELECT name FROM cheap WHERE id IN (SELECT item_id FROM tags WHERE label = ?2)"
        );
        assert_eq!(q.params, vec![Value::Real(5.0), Value::Text("sale".into())]);
    }

    #[test]
    fn test_correlated_exists() {
        let schema = schema();
        let items = TableRef::new("items");
        let tags = TableRef::new("tags");
        let select = Select::from(&items)
            .select([items.col("name")])
            .filter(crate::expr::exists(
                Select::from(&tags)
                    .select([tags.col("id")])
                    .filter(tags.col("item_id").eq(items.col("id"))),
            ));
        let q = QueryCompiler::new(&schema).compile_select(&select).unwrap();
        assert_eq!(
            q.sql,
            "SELECT name FROM items WHERE EXISTS (SELECT id FROM tags WHERE item_id = items.id)"
        );
    }

    #[test]
    fn test_full_text_match() {
        let schema = schema();
        let fts = TableRef::new("docs_fts");
        let select = Select::from(&fts)
            .select([fts.col("rowid")])
            .filter(fts.matches("hello"))
            .order_asc(fts.col("rank"));
        let q = QueryCompiler::new(&schema).compile_select(&select).unwrap();
        assert_eq!(
            q.sql,
            "SELECT rowid FROM docs_fts WHERE docs_fts MATCH ?1 ORDER BY rank ASC"
        );

        let items = TableRef::new("items");
        let err = QueryCompiler::new(&schema)
            .compile_select(&Select::from(&items).filter(items.matches("x")))
            .unwrap_err();
        assert!(matches!(err, OrmError::QueryCompilation(_)));
    }

    #[test]
    fn test_insert_returning_and_json_storage() {
        let schema = schema();
        let insert = Insert::into("items")
            .row(values([
                ("name", Value::from("a")),
                ("meta", Value::from(serde_json::json!({"k": "v"}))),
            ]))
            .returning();
        let q = QueryCompiler::new(&schema).compile_insert(&insert).unwrap().remove(0);
        assert_eq!(
            q.sql,
            "INSERT INTO items (meta, name) VALUES (jsonb(?1), ?2) RETURNING id, name, count, \
             price, json(meta) AS meta, active, (items.price * items.count) AS total"
        );
        assert!(q.returning);
    }

    #[test]
    fn test_insert_rejects_bad_values() {
        let schema = schema();
        let compiler = QueryCompiler::new(&schema);
        let err = compiler
            .compile_insert(&Insert::into("items").row(values([("count", "many")])))
            .unwrap_err();
        assert!(matches!(err, OrmError::QueryCompilation(_)));
        let err = compiler
            .compile_insert(&Insert::into("items").row(values([("total", 1.0)])))
            .unwrap_err();
        assert!(err.to_string().contains("computed"));
    }

    #[test]
    fn test_date_text_is_normalized_or_rejected() {
        let schema = Schema::from_blueprints(
            [TableBlueprint::new("events").column(Column::date("seen"))],
            [],
        )
        .unwrap();
        let compiler = QueryCompiler::new(&schema);

        let q = compiler
            .compile_insert(&Insert::into("events").row(values([("seen", "2023-11-14T23:13:20+01:00")])))
            .unwrap()
            .remove(0);
        let expected = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert_eq!(q.params, vec![Value::Date(expected)]);

        let err = compiler
            .compile_insert(&Insert::into("events").row(values([("seen", "yesterday")])))
            .unwrap_err();
        assert!(matches!(err, OrmError::TypeConversion(_)));

        let rows = (0..2).map(|_| values([("seen", "yesterday")]));
        let err = compiler
            .compile_bulk_insert(&Insert::into("events").rows(rows))
            .unwrap_err();
        assert!(matches!(err, OrmError::TypeConversion(_)));

        let err = compiler
            .compile_update(&Update::table("events").set("seen", lit("soon")))
            .unwrap_err();
        assert!(matches!(err, OrmError::TypeConversion(_)));
    }

    #[test]
    fn test_upsert_requires_unique_target() {
        let schema = schema();
        let compiler = QueryCompiler::new(&schema);
        let ok = compiler
            .compile_insert(
                &Insert::into("tags")
                    .row(values([("item_id", Value::from(1)), ("label", Value::from("x"))]))
                    .on_conflict(["label"], ["item_id"]),
            )
            .unwrap();
        assert_eq!(
            ok[0].sql,
            "INSERT INTO tags (item_id, label) VALUES (?1, ?2) \
             ON CONFLICT (label) DO UPDATE SET item_id = excluded.item_id"
        );

        let err = compiler
            .compile_insert(
                &Insert::into("tags")
                    .row(values([("item_id", 1)]))
                    .on_conflict(["item_id"], Vec::<String>::new()),
            )
            .unwrap_err();
        assert!(matches!(err, OrmError::QueryCompilation(_)));
    }

    #[test]
    fn test_bulk_insert() {
        let schema = schema();
        let compiler = QueryCompiler::new(&schema);
        let rows = (0..3i64).map(|i| values([("name", Value::from(format!("n{}", i))), ("count", Value::from(i))]));
        let q = compiler
            .compile_bulk_insert(&Insert::into("items").rows(rows))
            .unwrap()
            .unwrap();
        assert_eq!(
            q.sql,
            "INSERT INTO items (count, name) SELECT value ->> '$.\"count\"', \
             value ->> '$.\"name\"' FROM json_each(?1)"
        );
        assert_eq!(q.params.len(), 1);

        let mixed = Insert::into("items")
            .row(values([("name", "a")]))
            .row(values([("name", Value::from("b")), ("count", Value::from(1))]));
        assert!(compiler.compile_bulk_insert(&mixed).unwrap().is_none());

        let blobs = Insert::into("items").row(values([("name", Value::Blob(vec![1]))]));
        assert!(compiler.compile_bulk_insert(&blobs).unwrap().is_none());
    }

    #[test]
    fn test_update_and_delete() {
        let schema = schema();
        let compiler = QueryCompiler::new(&schema);
        let q = compiler
            .compile_update(
                &Update::table("items")
                    .set("count", col("count").add(1))
                    .set("active", false)
                    .filter(col("id").eq(7)),
            )
            .unwrap();
        assert_eq!(
            q.sql,
            "UPDATE items SET count = count + ?1, active = ?2 WHERE id = ?3"
        );
        assert_eq!(q.params[1], Value::Bool(false));

        let q = compiler
            .compile_delete(&Delete::from("items").filter(col("name").in_list(["a", "b"])))
            .unwrap();
        assert_eq!(q.sql, "DELETE FROM items WHERE name IN (?1, ?2)");
        assert!(!q.returning);
    }

    #[test]
    fn test_keywords_are_quoted() {
        let schema = Schema::from_blueprints(
            [TableBlueprint::new("order").column(Column::text("group"))],
            [],
        )
        .unwrap();
        let order = TableRef::new("order");
        let q = QueryCompiler::new(&schema)
            .compile_select(&Select::from(&order).select([order.col("group")]))
            .unwrap();
        assert_eq!(q.sql, "SELECT \"group\" FROM \"order\"");
    }
}
