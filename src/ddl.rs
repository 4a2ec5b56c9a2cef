//! DDL rendering for SQLite.
//!
//! Everything here is rendered from blueprint data, never from caller values,
//! so literals are inlined (escaped) rather than bound. The same rendering is
//! used for computed-column expansion inside queries, which keeps every
//! expansion of a given column textually identical.

use crate::error::{OrmError, Result};
use crate::expr::{Expr, UnaryOp};
use crate::schema::{ColumnDef, ColumnDefault, ColumnType, IndexDef, TableSchema};
use crate::value::{format_date, Value};

/// SQLite keywords; identifiers matching one of these are quoted.
const KEYWORDS: &[&str] = &[
    "ABORT", "ACTION", "ADD", "AFTER", "ALL", "ALTER", "ALWAYS", "ANALYZE", "AND", "AS", "ASC",
    "ATTACH", "AUTOINCREMENT", "BEFORE", "BEGIN", "BETWEEN", "BY", "CASCADE", "CASE", "CAST",
    "CHECK", "COLLATE", "COLUMN", "COMMIT", "CONFLICT", "CONSTRAINT", "CREATE", "CROSS",
    "CURRENT", "CURRENT_DATE", "CURRENT_TIME", "CURRENT_TIMESTAMP", "DATABASE", "DEFAULT",
    "DEFERRABLE", "DEFERRED", "DELETE", "DESC", "DETACH", "DISTINCT", "DO", "DROP", "EACH",
    "ELSE", "END", "ESCAPE", "EXCEPT", "EXCLUDE", "EXCLUSIVE", "EXISTS", "EXPLAIN", "FAIL",
    "FILTER", "FIRST", "FOLLOWING", "FOR", "FOREIGN", "FROM", "FULL", "GENERATED", "GLOB",
    "GROUP", "GROUPS", "HAVING", "IF", "IGNORE", "IMMEDIATE", "IN", "INDEX", "INDEXED",
    "INITIALLY", "INNER", "INSERT", "INSTEAD", "INTERSECT", "INTO", "IS", "ISNULL", "JOIN",
    "KEY", "LAST", "LEFT", "LIKE", "LIMIT", "MATCH", "MATERIALIZED", "NATURAL", "NO", "NOT",
    "NOTHING", "NOTNULL", "NULL", "NULLS", "OF", "OFFSET", "ON", "OR", "ORDER", "OTHERS",
    "OUTER", "OVER", "PARTITION", "PLAN", "PRAGMA", "PRECEDING", "PRIMARY", "QUERY", "RAISE",
    "RANGE", "RECURSIVE", "REFERENCES", "REGEXP", "REINDEX", "RELEASE", "RENAME", "REPLACE",
    "RESTRICT", "RETURNING", "RIGHT", "ROLLBACK", "ROW", "ROWS", "SAVEPOINT", "SELECT", "SET",
    "TABLE", "TEMP", "TEMPORARY", "THEN", "TIES", "TO", "TRANSACTION", "TRIGGER", "UNBOUNDED",
    "UNION", "UNIQUE", "UPDATE", "USING", "VACUUM", "VALUES", "VIEW", "VIRTUAL", "WHEN",
    "WHERE", "WINDOW", "WITH", "WITHOUT",
];

pub fn is_keyword(name: &str) -> bool {
    KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(name))
}

fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Quote an identifier if it collides with a keyword or is not a plain
/// identifier; otherwise return it unchanged.
pub fn quote_ident(name: &str) -> String {
    if is_plain_identifier(name) && !is_keyword(name) {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// Single-quoted SQL string literal.
pub fn quote_str(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Inline rendering of a blueprint literal.
pub fn render_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => (if *b { "1" } else { "0" }).to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Real(r) => {
            let text = r.to_string();
            if text.contains(['.', 'e', 'E']) || !r.is_finite() {
                text
            } else {
                format!("{}.0", text)
            }
        }
        Value::Text(s) => quote_str(s),
        Value::Blob(b) => {
            let hex: String = b.iter().map(|byte| format!("{:02X}", byte)).collect();
            format!("X'{}'", hex)
        }
        Value::Date(d) => quote_str(&format_date(d)),
        Value::Json(j) => quote_str(&j.to_string()),
    }
}

fn wrap(expr: &Expr, text: String) -> String {
    match expr {
        Expr::Binary { .. } | Expr::Logical { .. } => format!("({})", text),
        _ => text,
    }
}

/// Render a blueprint expression (computed column or check) with every
/// literal inlined. Column references are qualified with `qualifier` when
/// one is given.
pub fn render_inline_expr(expr: &Expr, qualifier: Option<&str>) -> Result<String> {
    let text = match expr {
        Expr::Column(c) => match qualifier {
            Some(q) => format!("{}.{}", quote_ident(q), quote_ident(&c.column)),
            None => quote_ident(&c.column),
        },
        Expr::Literal(v) => render_literal(v),
        Expr::Unary { op, expr: inner } => {
            let operand = wrap(inner, render_inline_expr(inner, qualifier)?);
            match op {
                UnaryOp::Not => format!("NOT {}", operand),
                UnaryOp::Neg => format!("-{}", operand),
                UnaryOp::IsNull => format!("{} IS NULL", operand),
                UnaryOp::IsNotNull => format!("{} IS NOT NULL", operand),
            }
        }
        Expr::Binary { left, op, right } => format!(
            "{} {} {}",
            wrap(left, render_inline_expr(left, qualifier)?),
            op,
            wrap(right, render_inline_expr(right, qualifier)?)
        ),
        Expr::Logical { op, operands } => {
            let parts = operands
                .iter()
                .map(|e| render_inline_expr(e, qualifier).map(|s| wrap(e, s)))
                .collect::<Result<Vec<_>>>()?;
            parts.join(&format!(" {} ", op))
        }
        Expr::InList { expr: inner, list, negated } => {
            let items = list
                .iter()
                .map(|e| render_inline_expr(e, qualifier))
                .collect::<Result<Vec<_>>>()?;
            format!(
                "{} {}IN ({})",
                wrap(inner, render_inline_expr(inner, qualifier)?),
                if *negated { "NOT " } else { "" },
                items.join(", ")
            )
        }
        Expr::JsonPath { expr: inner, path } => format!(
            "json_extract({}, {})",
            render_inline_expr(inner, qualifier)?,
            quote_str(path)
        ),
        other => {
            return Err(OrmError::schema(format!(
                "expression cannot be stored in a table definition: {:?}",
                other
            )))
        }
    };
    Ok(text)
}

/// Column definition as generated from a normalized column.
pub fn column_definition(column: &ColumnDef) -> Result<String> {
    let mut sql = format!("{} {}", quote_ident(&column.name), column.column_type.to_sql());

    if column.primary_key {
        sql.push_str(" PRIMARY KEY");
    }
    if !column.nullable && !column.is_rowid_alias() {
        sql.push_str(" NOT NULL");
    }
    if column.unique && !column.primary_key {
        sql.push_str(" UNIQUE");
    }
    match &column.default {
        Some(ColumnDefault::Value(v)) => {
            let literal = match (column.column_type, v) {
                (ColumnType::Json, Value::Json(_)) => render_literal(v),
                (ColumnType::Json, Value::Null) => render_literal(v),
                (ColumnType::Json, other) => render_literal(&Value::Json(json_value(other))),
                _ => render_literal(v),
            };
            sql.push_str(&format!(" DEFAULT {}", literal));
        }
        Some(ColumnDefault::Now) => {
            sql.push_str(" DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))");
        }
        None => {}
    }
    if let Some(check) = &column.check {
        sql.push_str(&format!(" CHECK ({})", render_inline_expr(check, None)?));
    }
    if let Some(fk) = &column.references {
        sql.push_str(&format!(
            " REFERENCES {}({})",
            quote_ident(&fk.table),
            quote_ident(&fk.column)
        ));
        if fk.on_delete_cascade {
            sql.push_str(" ON DELETE CASCADE");
        }
    }
    Ok(sql)
}

/// Column definition as stored, falling back to the generated form.
pub fn column_sql(column: &ColumnDef) -> Result<String> {
    match &column.definition {
        Some(def) => Ok(def.clone()),
        None => column_definition(column),
    }
}

/// Table-level constraints (composite key, uniques, checks).
pub fn table_constraints(table: &TableSchema) -> Result<Vec<String>> {
    if let Some(stored) = &table.constraint_definitions {
        return Ok(stored.clone());
    }
    let mut out = Vec::new();
    if !table.primary_key.is_empty() {
        out.push(format!("PRIMARY KEY ({})", ident_list(&table.primary_key)));
    }
    for unique in &table.uniques {
        out.push(format!("UNIQUE ({})", ident_list(unique)));
    }
    for check in &table.checks {
        out.push(format!("CHECK ({})", render_inline_expr(check, None)?));
    }
    Ok(out)
}

pub fn ident_list(names: &[String]) -> String {
    names
        .iter()
        .map(|n| quote_ident(n))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `CREATE TABLE` for a regular table, optionally under another name (used
/// by rebuilds).
pub fn create_table(table: &TableSchema, name: Option<&str>) -> Result<String> {
    let mut parts = Vec::new();
    for column in table.stored_columns() {
        parts.push(column_sql(column)?);
    }
    parts.extend(table_constraints(table)?);
    Ok(format!(
        "CREATE TABLE {} ({})",
        quote_ident(name.unwrap_or(&table.name)),
        parts.join(", ")
    ))
}

pub fn drop_table(name: &str) -> String {
    format!("DROP TABLE {}", quote_ident(name))
}

pub fn add_column(table: &str, column: &ColumnDef) -> Result<String> {
    Ok(format!(
        "ALTER TABLE {} ADD COLUMN {}",
        quote_ident(table),
        column_sql(column)?
    ))
}

pub fn drop_column(table: &str, column: &str) -> String {
    format!(
        "ALTER TABLE {} DROP COLUMN {}",
        quote_ident(table),
        quote_ident(column)
    )
}

pub fn rename_table(from: &str, to: &str) -> String {
    format!("ALTER TABLE {} RENAME TO {}", quote_ident(from), quote_ident(to))
}

pub fn create_index(table: &str, index: &IndexDef) -> String {
    format!(
        "CREATE {}INDEX {} ON {} ({})",
        if index.unique { "UNIQUE " } else { "" },
        quote_ident(&index.name),
        quote_ident(table),
        ident_list(&index.columns)
    )
}

pub fn drop_index(name: &str) -> String {
    format!("DROP INDEX IF EXISTS {}", quote_ident(name))
}

/// `CREATE VIRTUAL TABLE ... USING fts5(...)`.
pub fn create_full_text(table: &TableSchema) -> String {
    let mut args: Vec<String> = table.columns.iter().map(|c| quote_ident(&c.name)).collect();
    if let Some(fts) = &table.full_text {
        if let Some(content) = &fts.content {
            args.push(format!("content={}", quote_str(content)));
        }
        if let Some(rowid) = &fts.content_rowid {
            args.push(format!("content_rowid={}", quote_str(rowid)));
        }
        args.push(format!("tokenize={}", quote_str(&fts.tokenizer)));
    }
    format!(
        "CREATE VIRTUAL TABLE {} USING fts5({})",
        quote_ident(&table.name),
        args.join(", ")
    )
}

fn trigger_names(fts: &str) -> [String; 3] {
    [
        format!("{}_ai", fts),
        format!("{}_ad", fts),
        format!("{}_au", fts),
    ]
}

/// Triggers keeping an external-content full-text table in step with its
/// base table. Empty for tables that store their own content.
pub fn full_text_triggers(table: &TableSchema) -> Vec<String> {
    let Some(fts) = &table.full_text else {
        return Vec::new();
    };
    let (Some(content), Some(rowid)) = (&fts.content, &fts.content_rowid) else {
        return Vec::new();
    };

    let name = quote_ident(&table.name);
    let base = quote_ident(content);
    let rowid = quote_ident(rowid);
    let columns: Vec<String> = table.columns.iter().map(|c| quote_ident(&c.name)).collect();
    let column_list = columns.join(", ");
    let values = |prefix: &str| {
        columns
            .iter()
            .map(|c| format!("{}.{}", prefix, c))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let [ai, ad, au] = trigger_names(&table.name);

    let insert = format!(
        "INSERT INTO {name}(rowid, {column_list}) VALUES (new.{rowid}, {});",
        values("new")
    );
    let delete = format!(
        "INSERT INTO {name}({name}, rowid, {column_list}) VALUES ('delete', old.{rowid}, {});",
        values("old")
    );

    vec![
        format!(
            "CREATE TRIGGER {} AFTER INSERT ON {} BEGIN {} END",
            quote_ident(&ai),
            base,
            insert
        ),
        format!(
            "CREATE TRIGGER {} AFTER DELETE ON {} BEGIN {} END",
            quote_ident(&ad),
            base,
            delete
        ),
        format!(
            "CREATE TRIGGER {} AFTER UPDATE ON {} BEGIN {} {} END",
            quote_ident(&au),
            base,
            delete,
            insert
        ),
    ]
}

pub fn drop_full_text_triggers(fts: &str) -> Vec<String> {
    trigger_names(fts)
        .iter()
        .map(|t| format!("DROP TRIGGER IF EXISTS {}", quote_ident(t)))
        .collect()
}

/// Repopulate an external-content full-text index from its base table.
pub fn full_text_rebuild(fts: &str) -> String {
    let name = quote_ident(fts);
    format!("INSERT INTO {name}({name}) VALUES ('rebuild')")
}

/// JSON form of a semantic value, used for JSON-typed storage.
pub(crate) fn json_value(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Integer(i) => serde_json::Value::from(*i),
        Value::Real(r) => serde_json::Number::from_f64(*r)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::Blob(b) => serde_json::Value::Array(b.iter().map(|x| (*x).into()).collect()),
        Value::Date(d) => serde_json::Value::String(format_date(d)),
        Value::Json(j) => j.clone(),
    }
}

/// Split a parenthesized, comma-separated definition body at top level,
/// honoring nested parentheses and quoted sections. Used to recover column
/// and constraint definitions from stored `CREATE` statements.
pub(crate) fn split_definitions(sql: &str) -> Vec<String> {
    let (Some(start), Some(end)) = (sql.find('('), sql.rfind(')')) else {
        return Vec::new();
    };
    if end <= start {
        return Vec::new();
    }
    let body = &sql[start + 1..end];

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for ch in body.chars() {
        if let Some(q) = quote {
            current.push(ch);
            if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' | '`' => {
                quote = Some(ch);
                current.push(ch);
            }
            '[' => {
                quote = Some(']');
                current.push(ch);
            }
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            ',' if depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

/// Strip one level of identifier or string quoting.
pub(crate) fn unquote(text: &str) -> String {
    let text = text.trim();
    let bytes = text.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') || (first == b'`' && last == b'`') {
            let inner = &text[1..text.len() - 1];
            let q = first as char;
            return inner.replace(&format!("{q}{q}"), &q.to_string());
        }
        if first == b'[' && last == b']' {
            return text[1..text.len() - 1].to_string();
        }
    }
    text.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::col;
    use crate::schema::{Column, FtsBlueprint, Schema, TableBlueprint};

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("name"), "name");
        assert_eq!(quote_ident("order"), "\"order\"");
        assert_eq!(quote_ident("Group"), "\"Group\"");
        assert_eq!(quote_ident("i.name"), "\"i.name\"");
    }

    #[test]
    fn test_render_literal() {
        assert_eq!(render_literal(&Value::Text("it's".into())), "'it''s'");
        assert_eq!(render_literal(&Value::Real(2.0)), "2.0");
        assert_eq!(render_literal(&Value::Bool(true)), "1");
        assert_eq!(render_literal(&Value::Blob(vec![0xab, 0x01])), "X'AB01'");
    }

    #[test]
    fn test_create_table() {
        let schema = Schema::from_blueprints(
            [TableBlueprint::new("items")
                .column(Column::text("name").unique())
                .column(Column::integer("count").default(0).check(col("count").ge(0)))
                .column(Column::text("order").nullable())],
            [],
        )
        .unwrap();
        let sql = create_table(schema.table("items").unwrap(), None).unwrap();
        assert_eq!(
            sql,
            "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE, \
             count INTEGER NOT NULL DEFAULT 0 CHECK (count >= 0), \"order\" TEXT)"
        );
    }

    #[test]
    fn test_split_definitions_roundtrip() {
        let sql = "CREATE TABLE t (a TEXT DEFAULT 'x, y', b INTEGER CHECK (b IN (1, 2)), PRIMARY KEY (a, b))";
        assert_eq!(
            split_definitions(sql),
            vec![
                "a TEXT DEFAULT 'x, y'",
                "b INTEGER CHECK (b IN (1, 2))",
                "PRIMARY KEY (a, b)"
            ]
        );
        assert_eq!(unquote("\"order\""), "order");
        assert_eq!(unquote("'unicode61 remove_diacritics 2'"), "unicode61 remove_diacritics 2");
    }

    #[test]
    fn test_full_text_ddl() {
        let schema = Schema::from_blueprints(
            [TableBlueprint::new("docs").column(Column::text("body"))],
            [FtsBlueprint::new("docs_fts").columns(["body"]).content("docs")],
        )
        .unwrap();
        let fts = schema.table("docs_fts").unwrap();
        assert_eq!(
            create_full_text(fts),
            "CREATE VIRTUAL TABLE docs_fts USING fts5(body, content='docs', content_rowid='id', \
             tokenize='unicode61 remove_diacritics 2')"
        );
        let triggers = full_text_triggers(fts);
        assert_eq!(triggers.len(), 3);
        assert!(triggers[0].starts_with("CREATE TRIGGER docs_fts_ai AFTER INSERT ON docs"));
        assert!(triggers[1].contains("VALUES ('delete', old.id, old.body)"));
        assert_eq!(
            full_text_rebuild("docs_fts"),
            "INSERT INTO docs_fts(docs_fts) VALUES ('rebuild')"
        );
    }
}
