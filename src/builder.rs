//! Structural query descriptions.
//!
//! Builders only record intent; nothing is validated until the description is
//! handed to the [`QueryCompiler`](crate::compiler::QueryCompiler).

use crate::expr::{Expr, LogicalOp, OrderBy, SortDirection, TableRef, WindowSpec};
use crate::value::Values;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Join type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinType::Inner => write!(f, "INNER JOIN"),
            JoinType::Left => write!(f, "LEFT JOIN"),
            JoinType::Right => write!(f, "RIGHT JOIN"),
            JoinType::Full => write!(f, "FULL JOIN"),
            JoinType::Cross => write!(f, "CROSS JOIN"),
        }
    }
}

/// One entry of a select list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Projection {
    Expr { expr: Expr, alias: Option<String> },
    /// Every column of the aliased source.
    AllOf(String),
}

impl From<Expr> for Projection {
    fn from(expr: Expr) -> Self {
        Projection::Expr { expr, alias: None }
    }
}

impl Expr {
    /// Name this expression in the select list.
    pub fn alias(self, name: impl Into<String>) -> Projection {
        Projection::Expr {
            expr: self,
            alias: Some(name.into()),
        }
    }
}

/// Row source in FROM or JOIN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Source {
    /// A declared table or a CTE, looked up by name.
    Table { table: String, alias: String },
    /// Derived table.
    Subquery { select: Box<Select>, alias: String },
}

impl Source {
    pub fn alias(&self) -> &str {
        match self {
            Source::Table { alias, .. } | Source::Subquery { alias, .. } => alias,
        }
    }
}

impl From<&TableRef> for Source {
    fn from(t: &TableRef) -> Self {
        Source::Table {
            table: t.table().to_string(),
            alias: t.alias().to_string(),
        }
    }
}

/// Join clause
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Join {
    pub join_type: JoinType,
    pub source: Source,
    pub on: Option<Expr>,
}

/// Common table expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cte {
    pub name: String,
    pub select: Select,
}

/// SELECT description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Select {
    pub ctes: Vec<Cte>,
    pub from: Source,
    pub projections: Vec<Projection>,
    pub omit: Vec<String>,
    pub distinct: bool,
    pub joins: Vec<Join>,
    pub filter: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub windows: Vec<(String, WindowSpec)>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl Select {
    fn with_source(from: Source) -> Self {
        Self {
            ctes: Vec::new(),
            from,
            projections: Vec::new(),
            omit: Vec::new(),
            distinct: false,
            joins: Vec::new(),
            filter: None,
            group_by: Vec::new(),
            having: None,
            windows: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    /// Select from a table (or CTE) marker.
    pub fn from(table: &TableRef) -> Self {
        Self::with_source(table.into())
    }

    /// Select from a derived table.
    pub fn from_subquery(select: Select, alias: impl Into<String>) -> Self {
        Self::with_source(Source::Subquery {
            select: Box::new(select),
            alias: alias.into(),
        })
    }

    /// Add a common table expression, referenced by name as a table.
    pub fn with(mut self, name: impl Into<String>, select: Select) -> Self {
        self.ctes.push(Cte {
            name: name.into(),
            select,
        });
        self
    }

    /// Replace the select list
    pub fn select<I, P>(mut self, projections: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Projection>,
    {
        self.projections = projections.into_iter().map(Into::into).collect();
        self
    }

    /// Append to the select list
    pub fn add_column(mut self, projection: impl Into<Projection>) -> Self {
        self.projections.push(projection.into());
        self
    }

    /// Select every column of every source (the default)
    pub fn select_all(mut self) -> Self {
        self.projections.clear();
        self
    }

    /// Drop columns from the default select list
    pub fn omit<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.omit.extend(columns.into_iter().map(Into::into));
        self
    }

    /// Use DISTINCT
    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// Set the WHERE condition
    pub fn filter(mut self, condition: Expr) -> Self {
        self.filter = Some(condition);
        self
    }

    /// Add an AND condition to existing WHERE
    pub fn and_where(mut self, condition: Expr) -> Self {
        self.filter = Some(combine(self.filter.take(), LogicalOp::And, condition));
        self
    }

    /// Add an OR condition to existing WHERE
    pub fn or_where(mut self, condition: Expr) -> Self {
        self.filter = Some(combine(self.filter.take(), LogicalOp::Or, condition));
        self
    }

    /// Add a JOIN clause
    pub fn join(mut self, join_type: JoinType, table: &TableRef, on: Expr) -> Self {
        self.joins.push(Join {
            join_type,
            source: table.into(),
            on: Some(on),
        });
        self
    }

    /// Add an INNER JOIN
    pub fn inner_join(self, table: &TableRef, on: Expr) -> Self {
        self.join(JoinType::Inner, table, on)
    }

    /// Add a LEFT JOIN
    pub fn left_join(self, table: &TableRef, on: Expr) -> Self {
        self.join(JoinType::Left, table, on)
    }

    /// Add a CROSS JOIN
    pub fn cross_join(mut self, table: &TableRef) -> Self {
        self.joins.push(Join {
            join_type: JoinType::Cross,
            source: table.into(),
            on: None,
        });
        self
    }

    /// Join a derived table
    pub fn join_subquery(
        mut self,
        join_type: JoinType,
        select: Select,
        alias: impl Into<String>,
        on: Expr,
    ) -> Self {
        self.joins.push(Join {
            join_type,
            source: Source::Subquery {
                select: Box::new(select),
                alias: alias.into(),
            },
            on: Some(on),
        });
        self
    }

    /// Set GROUP BY expressions
    pub fn group_by(mut self, exprs: impl IntoIterator<Item = Expr>) -> Self {
        self.group_by = exprs.into_iter().collect();
        self
    }

    /// Set the HAVING condition
    pub fn having(mut self, condition: Expr) -> Self {
        self.having = Some(condition);
        self
    }

    /// Declare a named window for `expr.over("name")`
    pub fn window(mut self, name: impl Into<String>, spec: WindowSpec) -> Self {
        self.windows.push((name.into(), spec));
        self
    }

    /// Add ORDER BY
    pub fn order_by(mut self, expr: Expr, direction: SortDirection) -> Self {
        self.order_by.push(OrderBy { expr, direction });
        self
    }

    /// Add ascending ORDER BY
    pub fn order_asc(self, expr: Expr) -> Self {
        self.order_by(expr, SortDirection::Asc)
    }

    /// Add descending ORDER BY
    pub fn order_desc(self, expr: Expr) -> Self {
        self.order_by(expr, SortDirection::Desc)
    }

    /// Set LIMIT
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set OFFSET
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }
}

fn combine(existing: Option<Expr>, op: LogicalOp, condition: Expr) -> Expr {
    match (existing, op) {
        (None, _) => condition,
        (Some(e), LogicalOp::And) => e.and(condition),
        (Some(e), LogicalOp::Or) => e.or(condition),
    }
}

/// Conflict clause of an upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnConflict {
    /// Primary key or unique column set that identifies the conflicting row.
    pub target: Vec<String>,
    /// Columns overwritten from the proposed row; empty means DO NOTHING.
    pub update: Vec<String>,
}

/// INSERT description
#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub table: String,
    pub rows: Vec<Values>,
    pub on_conflict: Option<OnConflict>,
    pub returning: bool,
}

impl Insert {
    pub fn into(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            rows: Vec::new(),
            on_conflict: None,
            returning: false,
        }
    }

    pub fn row(mut self, values: Values) -> Self {
        self.rows.push(values);
        self
    }

    pub fn rows(mut self, rows: impl IntoIterator<Item = Values>) -> Self {
        self.rows.extend(rows);
        self
    }

    pub fn on_conflict<T, U, S1, S2>(mut self, target: T, update: U) -> Self
    where
        T: IntoIterator<Item = S1>,
        U: IntoIterator<Item = S2>,
        S1: Into<String>,
        S2: Into<String>,
    {
        self.on_conflict = Some(OnConflict {
            target: target.into_iter().map(Into::into).collect(),
            update: update.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn returning(mut self) -> Self {
        self.returning = true;
        self
    }
}

/// UPDATE description
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub table: String,
    pub assignments: Vec<(String, Expr)>,
    pub filter: Option<Expr>,
    pub returning: bool,
}

impl Update {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            assignments: Vec::new(),
            filter: None,
            returning: false,
        }
    }

    /// Set a column value
    pub fn set(mut self, column: impl Into<String>, value: impl Into<Expr>) -> Self {
        self.assignments.push((column.into(), value.into()));
        self
    }

    /// Set multiple column values
    pub fn set_values(mut self, values: Values) -> Self {
        let mut values: Vec<_> = values.into_iter().collect();
        values.sort_by(|a, b| a.0.cmp(&b.0));
        for (col, val) in values {
            self.assignments.push((col, Expr::Literal(val)));
        }
        self
    }

    pub fn filter(mut self, condition: Expr) -> Self {
        self.filter = Some(condition);
        self
    }

    pub fn returning(mut self) -> Self {
        self.returning = true;
        self
    }
}

/// DELETE description
#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    pub table: String,
    pub filter: Option<Expr>,
    pub returning: bool,
}

impl Delete {
    pub fn from(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: None,
            returning: false,
        }
    }

    pub fn filter(mut self, condition: Expr) -> Self {
        self.filter = Some(condition);
        self
    }

    pub fn returning(mut self) -> Self {
        self.returning = true;
        self
    }
}

/// Any statement the compiler accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(Select),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
}

impl From<Select> for Statement {
    fn from(s: Select) -> Self {
        Statement::Select(s)
    }
}

impl From<Insert> for Statement {
    fn from(s: Insert) -> Self {
        Statement::Insert(s)
    }
}

impl From<Update> for Statement {
    fn from(s: Update) -> Self {
        Statement::Update(s)
    }
}

impl From<Delete> for Statement {
    fn from(s: Delete) -> Self {
        Statement::Delete(s)
    }
}
