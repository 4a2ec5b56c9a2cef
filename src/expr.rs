//! Expression trees for filters, projections and computed columns.
//!
//! Column markers are plain [`ColumnRef`] values: a table alias plus a column
//! name. They carry no identity of their own and are resolved against the
//! [`Schema`](crate::schema::Schema) when a query is compiled, so an unknown
//! column surfaces as a compilation error rather than at execution time.

use crate::builder::{Projection, Select};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference to a column, optionally qualified by a table alias.
///
/// Unqualified references resolve against the single table a statement
/// targets, or the table that owns a computed column or check constraint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnRef {
    pub table: Option<String>,
    pub column: String,
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Neg,
    IsNull,
    IsNotNull,
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    NotLike,
    Add,
    Sub,
    Mul,
    Div,
    Concat,
}

impl BinaryOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub fn is_ordering(&self) -> bool {
        matches!(self, BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge)
    }

    pub fn is_arithmetic(&self) -> bool {
        matches!(self, BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div)
    }

    pub fn is_pattern(&self) -> bool {
        matches!(self, BinaryOp::Like | BinaryOp::NotLike)
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinaryOp::Eq => write!(f, "="),
            BinaryOp::Ne => write!(f, "!="),
            BinaryOp::Lt => write!(f, "<"),
            BinaryOp::Le => write!(f, "<="),
            BinaryOp::Gt => write!(f, ">"),
            BinaryOp::Ge => write!(f, ">="),
            BinaryOp::Like => write!(f, "LIKE"),
            BinaryOp::NotLike => write!(f, "NOT LIKE"),
            BinaryOp::Add => write!(f, "+"),
            BinaryOp::Sub => write!(f, "-"),
            BinaryOp::Mul => write!(f, "*"),
            BinaryOp::Div => write!(f, "/"),
            BinaryOp::Concat => write!(f, "||"),
        }
    }
}

/// Logical operators for combining conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalOp {
    And,
    Or,
}

impl fmt::Display for LogicalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalOp::And => write!(f, "AND"),
            LogicalOp::Or => write!(f, "OR"),
        }
    }
}

/// Aggregate function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    GroupConcat,
}

impl AggregateFunc {
    pub fn name(&self) -> &'static str {
        match self {
            AggregateFunc::Count => "COUNT",
            AggregateFunc::Sum => "SUM",
            AggregateFunc::Avg => "AVG",
            AggregateFunc::Min => "MIN",
            AggregateFunc::Max => "MAX",
            AggregateFunc::GroupConcat => "GROUP_CONCAT",
        }
    }
}

/// Ranking and navigation functions that only exist inside a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowFunc {
    RowNumber,
    Rank,
    DenseRank,
    PercentRank,
    CumeDist,
    Ntile,
    Lag,
    Lead,
    FirstValue,
    LastValue,
}

impl WindowFunc {
    pub fn name(&self) -> &'static str {
        match self {
            WindowFunc::RowNumber => "ROW_NUMBER",
            WindowFunc::Rank => "RANK",
            WindowFunc::DenseRank => "DENSE_RANK",
            WindowFunc::PercentRank => "PERCENT_RANK",
            WindowFunc::CumeDist => "CUME_DIST",
            WindowFunc::Ntile => "NTILE",
            WindowFunc::Lag => "LAG",
            WindowFunc::Lead => "LEAD",
            WindowFunc::FirstValue => "FIRST_VALUE",
            WindowFunc::LastValue => "LAST_VALUE",
        }
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortDirection::Asc => write!(f, "ASC"),
            SortDirection::Desc => write!(f, "DESC"),
        }
    }
}

/// ORDER BY term
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub expr: Expr,
    pub direction: SortDirection,
}

/// PARTITION BY / ORDER BY of a window.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WindowSpec {
    pub partition_by: Vec<Expr>,
    pub order_by: Vec<OrderBy>,
}

impl WindowSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partition_by(mut self, expr: Expr) -> Self {
        self.partition_by.push(expr);
        self
    }

    pub fn order_by(mut self, expr: Expr, direction: SortDirection) -> Self {
        self.order_by.push(OrderBy { expr, direction });
        self
    }

    pub fn order_asc(self, expr: Expr) -> Self {
        self.order_by(expr, SortDirection::Asc)
    }

    pub fn order_desc(self, expr: Expr) -> Self {
        self.order_by(expr, SortDirection::Desc)
    }
}

/// Window a windowed call runs over: inline, or a named `WINDOW` clause entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Over {
    Named(String),
    Spec(WindowSpec),
}

impl From<WindowSpec> for Over {
    fn from(spec: WindowSpec) -> Self {
        Over::Spec(spec)
    }
}

impl From<&str> for Over {
    fn from(name: &str) -> Self {
        Over::Named(name.to_string())
    }
}

/// Expression tree node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Column(ColumnRef),
    Literal(Value),
    /// Reference to a select-list alias (ORDER BY / HAVING only).
    Output(String),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Logical {
        op: LogicalOp,
        operands: Vec<Expr>,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    InSubquery {
        expr: Box<Expr>,
        subquery: Box<Select>,
        negated: bool,
    },
    Exists {
        subquery: Box<Select>,
        negated: bool,
    },
    Subquery(Box<Select>),
    JsonPath {
        expr: Box<Expr>,
        path: String,
    },
    Aggregate {
        func: AggregateFunc,
        arg: Option<Box<Expr>>,
        distinct: bool,
    },
    WindowFunction {
        func: WindowFunc,
        args: Vec<Expr>,
    },
    Windowed {
        call: Box<Expr>,
        over: Over,
    },
    /// Full-text match against a full-text table in scope.
    Match {
        table: String,
        query: Box<Expr>,
    },
}

impl Expr {
    fn binary(self, op: BinaryOp, right: impl Into<Expr>) -> Expr {
        Expr::Binary {
            left: Box::new(self),
            op,
            right: Box::new(right.into()),
        }
    }

    fn unary(self, op: UnaryOp) -> Expr {
        Expr::Unary {
            op,
            expr: Box::new(self),
        }
    }

    pub fn eq(self, other: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Eq, other)
    }

    pub fn ne(self, other: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Ne, other)
    }

    pub fn lt(self, other: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Lt, other)
    }

    pub fn le(self, other: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Le, other)
    }

    pub fn gt(self, other: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Gt, other)
    }

    pub fn ge(self, other: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Ge, other)
    }

    pub fn between(self, low: impl Into<Expr>, high: impl Into<Expr>) -> Expr {
        self.clone().ge(low).and(self.le(high))
    }

    pub fn like(self, pattern: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Like, pattern)
    }

    pub fn not_like(self, pattern: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::NotLike, pattern)
    }

    pub fn add(self, other: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Add, other)
    }

    pub fn sub(self, other: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Sub, other)
    }

    pub fn mul(self, other: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Mul, other)
    }

    pub fn div(self, other: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Div, other)
    }

    pub fn concat(self, other: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Concat, other)
    }

    pub fn in_list<I, V>(self, values: I) -> Expr
    where
        I: IntoIterator<Item = V>,
        V: Into<Expr>,
    {
        Expr::InList {
            expr: Box::new(self),
            list: values.into_iter().map(Into::into).collect(),
            negated: false,
        }
    }

    pub fn not_in<I, V>(self, values: I) -> Expr
    where
        I: IntoIterator<Item = V>,
        V: Into<Expr>,
    {
        Expr::InList {
            expr: Box::new(self),
            list: values.into_iter().map(Into::into).collect(),
            negated: true,
        }
    }

    pub fn in_subquery(self, subquery: Select) -> Expr {
        Expr::InSubquery {
            expr: Box::new(self),
            subquery: Box::new(subquery),
            negated: false,
        }
    }

    pub fn not_in_subquery(self, subquery: Select) -> Expr {
        Expr::InSubquery {
            expr: Box::new(self),
            subquery: Box::new(subquery),
            negated: true,
        }
    }

    pub fn is_null(self) -> Expr {
        self.unary(UnaryOp::IsNull)
    }

    pub fn is_not_null(self) -> Expr {
        self.unary(UnaryOp::IsNotNull)
    }

    pub fn not(self) -> Expr {
        self.unary(UnaryOp::Not)
    }

    pub fn neg(self) -> Expr {
        self.unary(UnaryOp::Neg)
    }

    /// AND with another condition, flattening nested ANDs.
    pub fn and(self, other: Expr) -> Expr {
        self.combine(LogicalOp::And, other)
    }

    /// OR with another condition, flattening nested ORs.
    pub fn or(self, other: Expr) -> Expr {
        self.combine(LogicalOp::Or, other)
    }

    fn combine(self, op: LogicalOp, other: Expr) -> Expr {
        let mut operands = match self {
            Expr::Logical { op: o, operands } if o == op => operands,
            e => vec![e],
        };
        match other {
            Expr::Logical { op: o, operands: more } if o == op => operands.extend(more),
            e => operands.push(e),
        }
        Expr::Logical { op, operands }
    }

    /// Address a value inside a JSON column, e.g. `$.address.city`.
    pub fn json(self, path: impl Into<String>) -> Expr {
        Expr::JsonPath {
            expr: Box::new(self),
            path: path.into(),
        }
    }

    /// Run an aggregate or window function over a window.
    pub fn over(self, over: impl Into<Over>) -> Expr {
        Expr::Windowed {
            call: Box::new(self),
            over: over.into(),
        }
    }

    /// Visit every node in the tree, depth first, without entering subqueries.
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::Column(_) | Expr::Literal(_) | Expr::Output(_) => {}
            Expr::Unary { expr, .. } | Expr::JsonPath { expr, .. } => expr.walk(f),
            Expr::Binary { left, right, .. } => {
                left.walk(f);
                right.walk(f);
            }
            Expr::Logical { operands, .. } => {
                for e in operands {
                    e.walk(f);
                }
            }
            Expr::InList { expr, list, .. } => {
                expr.walk(f);
                for e in list {
                    e.walk(f);
                }
            }
            Expr::InSubquery { expr, .. } => expr.walk(f),
            Expr::Exists { .. } | Expr::Subquery(_) => {}
            Expr::Aggregate { arg, .. } => {
                if let Some(arg) = arg {
                    arg.walk(f);
                }
            }
            Expr::WindowFunction { args, .. } => {
                for e in args {
                    e.walk(f);
                }
            }
            Expr::Windowed { call, over } => {
                call.walk(f);
                if let Over::Spec(spec) = over {
                    for e in &spec.partition_by {
                        e.walk(f);
                    }
                    for o in &spec.order_by {
                        o.expr.walk(f);
                    }
                }
            }
            Expr::Match { query, .. } => query.walk(f),
        }
    }

    /// Column references in this tree, outside subqueries.
    pub fn column_refs(&self) -> Vec<&ColumnRef> {
        let mut refs = Vec::new();
        self.walk(&mut |e| {
            if let Expr::Column(c) = e {
                refs.push(c);
            }
        });
        refs
    }

    /// True when the tree uses constructs only valid inside a query
    /// (aggregates, windows, subqueries, select aliases, full-text match).
    pub fn is_query_only(&self) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if matches!(
                e,
                Expr::Aggregate { .. }
                    | Expr::WindowFunction { .. }
                    | Expr::Windowed { .. }
                    | Expr::Subquery(_)
                    | Expr::InSubquery { .. }
                    | Expr::Exists { .. }
                    | Expr::Output(_)
                    | Expr::Match { .. }
            ) {
                found = true;
            }
        });
        found
    }
}

macro_rules! literal_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Expr {
                fn from(v: $ty) -> Self {
                    Expr::Literal(v.into())
                }
            }
        )*
    };
}

literal_from!(
    Value,
    bool,
    i32,
    i64,
    u32,
    f64,
    &str,
    String,
    Vec<u8>,
    chrono::DateTime<chrono::Utc>,
    serde_json::Value,
);

/// Unqualified column marker.
pub fn col(name: impl Into<String>) -> Expr {
    Expr::Column(ColumnRef {
        table: None,
        column: name.into(),
    })
}

/// Literal value.
pub fn lit(value: impl Into<Value>) -> Expr {
    Expr::Literal(value.into())
}

/// Reference a select-list alias from ORDER BY or HAVING.
pub fn output(alias: impl Into<String>) -> Expr {
    Expr::Output(alias.into())
}

pub fn and_all(exprs: impl IntoIterator<Item = Expr>) -> Expr {
    Expr::Logical {
        op: LogicalOp::And,
        operands: exprs.into_iter().collect(),
    }
}

pub fn or_any(exprs: impl IntoIterator<Item = Expr>) -> Expr {
    Expr::Logical {
        op: LogicalOp::Or,
        operands: exprs.into_iter().collect(),
    }
}

fn aggregate(func: AggregateFunc, arg: Option<Expr>, distinct: bool) -> Expr {
    Expr::Aggregate {
        func,
        arg: arg.map(Box::new),
        distinct,
    }
}

/// `COUNT(*)`
pub fn count() -> Expr {
    aggregate(AggregateFunc::Count, None, false)
}

pub fn count_of(expr: Expr) -> Expr {
    aggregate(AggregateFunc::Count, Some(expr), false)
}

pub fn count_distinct(expr: Expr) -> Expr {
    aggregate(AggregateFunc::Count, Some(expr), true)
}

pub fn sum(expr: Expr) -> Expr {
    aggregate(AggregateFunc::Sum, Some(expr), false)
}

pub fn avg(expr: Expr) -> Expr {
    aggregate(AggregateFunc::Avg, Some(expr), false)
}

pub fn min(expr: Expr) -> Expr {
    aggregate(AggregateFunc::Min, Some(expr), false)
}

pub fn max(expr: Expr) -> Expr {
    aggregate(AggregateFunc::Max, Some(expr), false)
}

pub fn group_concat(expr: Expr) -> Expr {
    aggregate(AggregateFunc::GroupConcat, Some(expr), false)
}

fn window(func: WindowFunc, args: Vec<Expr>) -> Expr {
    Expr::WindowFunction { func, args }
}

pub fn row_number() -> Expr {
    window(WindowFunc::RowNumber, vec![])
}

pub fn rank() -> Expr {
    window(WindowFunc::Rank, vec![])
}

pub fn dense_rank() -> Expr {
    window(WindowFunc::DenseRank, vec![])
}

pub fn percent_rank() -> Expr {
    window(WindowFunc::PercentRank, vec![])
}

pub fn cume_dist() -> Expr {
    window(WindowFunc::CumeDist, vec![])
}

pub fn ntile(buckets: i64) -> Expr {
    window(WindowFunc::Ntile, vec![lit(buckets)])
}

pub fn lag(expr: Expr, offset: i64) -> Expr {
    window(WindowFunc::Lag, vec![expr, lit(offset)])
}

pub fn lead(expr: Expr, offset: i64) -> Expr {
    window(WindowFunc::Lead, vec![expr, lit(offset)])
}

pub fn first_value(expr: Expr) -> Expr {
    window(WindowFunc::FirstValue, vec![expr])
}

pub fn last_value(expr: Expr) -> Expr {
    window(WindowFunc::LastValue, vec![expr])
}

pub fn exists(subquery: Select) -> Expr {
    Expr::Exists {
        subquery: Box::new(subquery),
        negated: false,
    }
}

pub fn not_exists(subquery: Select) -> Expr {
    Expr::Exists {
        subquery: Box::new(subquery),
        negated: true,
    }
}

/// Scalar subquery.
pub fn subquery(select: Select) -> Expr {
    Expr::Subquery(Box::new(select))
}

/// Marker-bearing accessor for one table (or CTE / derived table) in a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    table: String,
    alias: String,
}

impl TableRef {
    pub fn new(table: impl Into<String>) -> Self {
        let table = table.into();
        Self {
            alias: table.clone(),
            table,
        }
    }

    pub fn aliased(table: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            alias: alias.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Marker for one column of this table.
    pub fn col(&self, name: impl Into<String>) -> Expr {
        Expr::Column(ColumnRef {
            table: Some(self.alias.clone()),
            column: name.into(),
        })
    }

    /// Every column of this table, as a projection.
    pub fn all(&self) -> Projection {
        Projection::AllOf(self.alias.clone())
    }

    /// Full-text match on this table.
    pub fn matches(&self, query: impl Into<Expr>) -> Expr {
        Expr::Match {
            table: self.alias.clone(),
            query: Box::new(query.into()),
        }
    }
}

/// Accessor handed to query-construction callbacks.
#[derive(Debug, Default, Clone, Copy)]
pub struct Tables;

impl Tables {
    pub fn table(&self, name: &str) -> TableRef {
        TableRef::new(name)
    }

    pub fn alias(&self, name: &str, alias: &str) -> TableRef {
        TableRef::aliased(name, alias)
    }
}
