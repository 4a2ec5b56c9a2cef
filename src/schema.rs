use crate::error::{OrmError, Result};
use crate::expr::Expr;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Tokenizer used by full-text tables unless a blueprint overrides it.
pub const DEFAULT_TOKENIZER: &str = "unicode61 remove_diacritics 2";

/// Name of the implicit integer key added to tables without a primary key.
pub const IMPLICIT_KEY: &str = "id";

/// Semantic column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Blob,
    Boolean,
    Date,
    Json,
}

impl ColumnType {
    /// Declared type written into DDL. Each semantic type gets its own name so
    /// the type survives a round trip through the engine's catalog.
    pub fn to_sql(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Blob => "BLOB",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Date => "DATE",
            ColumnType::Json => "JSON",
        }
    }

    /// Map a declared type read back from the engine.
    pub fn from_declared(declared: &str) -> Self {
        match declared.trim().to_ascii_uppercase().as_str() {
            "INTEGER" | "INT" | "BIGINT" => ColumnType::Integer,
            "REAL" | "DOUBLE" | "FLOAT" => ColumnType::Real,
            "BLOB" => ColumnType::Blob,
            "BOOLEAN" => ColumnType::Boolean,
            "DATE" | "DATETIME" | "TIMESTAMP" => ColumnType::Date,
            "JSON" | "JSONB" => ColumnType::Json,
            _ => ColumnType::Text,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Integer => "integer",
            ColumnType::Real => "real",
            ColumnType::Blob => "blob",
            ColumnType::Boolean => "boolean",
            ColumnType::Date => "date",
            ColumnType::Json => "json",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Real)
    }

    /// Whether a caller value may be stored in (or compared with) this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (ColumnType::Text, Value::Text(_)) => true,
            (ColumnType::Integer, Value::Integer(_)) => true,
            (ColumnType::Real, Value::Real(_) | Value::Integer(_)) => true,
            (ColumnType::Blob, Value::Blob(_)) => true,
            (ColumnType::Boolean, Value::Bool(_)) => true,
            (ColumnType::Date, Value::Date(_) | Value::Text(_)) => true,
            (ColumnType::Json, Value::Blob(_)) => false,
            (ColumnType::Json, _) => true,
            _ => false,
        }
    }
}

/// Column default
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnDefault {
    Value(Value),
    /// Current time at insertion.
    Now,
}

/// Foreign key reference, resolved against the target table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub table: String,
    pub column: String,
    pub on_delete_cascade: bool,
}

/// Declared column, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    name: String,
    column_type: Option<ColumnType>,
    nullable: bool,
    default: Option<ColumnDefault>,
    primary_key: bool,
    unique: bool,
    indexed: bool,
    references: Option<(String, String)>,
    on_delete_cascade: bool,
    check: Option<Expr>,
    computed: Option<Expr>,
}

impl Column {
    /// Column with no declared type; normalizes to text.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column_type: None,
            nullable: false,
            default: None,
            primary_key: false,
            unique: false,
            indexed: false,
            references: None,
            on_delete_cascade: false,
            check: None,
            computed: None,
        }
    }

    pub fn of_type(name: impl Into<String>, column_type: ColumnType) -> Self {
        let mut column = Self::new(name);
        column.column_type = Some(column_type);
        column
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::of_type(name, ColumnType::Text)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::of_type(name, ColumnType::Integer)
    }

    pub fn real(name: impl Into<String>) -> Self {
        Self::of_type(name, ColumnType::Real)
    }

    pub fn blob(name: impl Into<String>) -> Self {
        Self::of_type(name, ColumnType::Blob)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::of_type(name, ColumnType::Boolean)
    }

    pub fn date(name: impl Into<String>) -> Self {
        Self::of_type(name, ColumnType::Date)
    }

    pub fn json(name: impl Into<String>) -> Self {
        Self::of_type(name, ColumnType::Json)
    }

    /// Query-time column derived from other columns of the same table.
    pub fn computed(name: impl Into<String>, result_type: ColumnType, expr: Expr) -> Self {
        let mut column = Self::of_type(name, result_type);
        column.computed = Some(expr);
        column
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(ColumnDefault::Value(value.into()));
        self
    }

    pub fn default_now(mut self) -> Self {
        self.default = Some(ColumnDefault::Now);
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn references(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.references = Some((table.into(), column.into()));
        self
    }

    pub fn on_delete_cascade(mut self) -> Self {
        self.on_delete_cascade = true;
        self
    }

    pub fn check(mut self, condition: Expr) -> Self {
        self.check = Some(condition);
        self
    }
}

/// Declared shape of one table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableBlueprint {
    name: String,
    columns: Vec<Column>,
    primary_key: Vec<String>,
    uniques: Vec<Vec<String>>,
    indexes: Vec<(Vec<String>, bool)>,
    checks: Vec<Expr>,
}

impl TableBlueprint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            uniques: Vec::new(),
            indexes: Vec::new(),
            checks: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn columns(mut self, columns: impl IntoIterator<Item = Column>) -> Self {
        self.columns.extend(columns);
        self
    }

    /// Composite primary key
    pub fn primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Multi-column uniqueness constraint
    pub fn unique<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.uniques
            .push(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn index<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.indexes
            .push((columns.into_iter().map(Into::into).collect(), false));
        self
    }

    pub fn unique_index<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.indexes
            .push((columns.into_iter().map(Into::into).collect(), true));
        self
    }

    /// Table-level check constraint
    pub fn check(mut self, condition: Expr) -> Self {
        self.checks.push(condition);
        self
    }
}

/// Declared full-text table, optionally mirroring an external base table.
#[derive(Debug, Clone, PartialEq)]
pub struct FtsBlueprint {
    name: String,
    columns: Vec<String>,
    content: Option<String>,
    tokenizer: Option<String>,
}

impl FtsBlueprint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            content: None,
            tokenizer: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns.extend(columns.into_iter().map(Into::into));
        self
    }

    /// Index the rows of an existing table instead of storing text itself.
    pub fn content(mut self, table: impl Into<String>) -> Self {
        self.content = Some(table.into());
        self
    }

    pub fn tokenizer(mut self, tokenizer: impl Into<String>) -> Self {
        self.tokenizer = Some(tokenizer.into());
        self
    }
}

/// Normalized column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub default: Option<ColumnDefault>,
    pub primary_key: bool,
    pub unique: bool,
    pub references: Option<ForeignKey>,
    pub check: Option<Expr>,
    pub computed: Option<Expr>,
    /// Definition text as stored by the engine, for introspected schemas.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
            default: None,
            primary_key: false,
            unique: false,
            references: None,
            check: None,
            computed: None,
            definition: None,
        }
    }

    pub fn is_computed(&self) -> bool {
        self.computed.is_some()
    }

    /// Integer primary key aliasing the engine's rowid.
    pub fn is_rowid_alias(&self) -> bool {
        self.primary_key && self.column_type == ColumnType::Integer
    }
}

/// Index definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

impl IndexDef {
    /// Columns plus uniqueness; two indexes with equal signatures are the same
    /// index regardless of name.
    pub fn signature(&self) -> (Vec<String>, bool) {
        (self.columns.clone(), self.unique)
    }

    pub(crate) fn generated(table: &str, columns: Vec<String>, unique: bool) -> Self {
        let prefix = if unique { "uidx" } else { "idx" };
        Self {
            name: format!("{}_{}_{}", prefix, table, columns.join("_")),
            columns,
            unique,
        }
    }
}

/// Full-text configuration of a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullTextConfig {
    /// External content table, if any.
    pub content: Option<String>,
    /// Integer key of the content table mapped to the full-text rowid.
    pub content_rowid: Option<String>,
    pub tokenizer: String,
}

/// Normalized table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    /// Table-level (composite) primary key.
    pub primary_key: Vec<String>,
    pub uniques: Vec<Vec<String>>,
    pub checks: Vec<Expr>,
    pub indexes: Vec<IndexDef>,
    pub full_text: Option<FullTextConfig>,
    /// Table constraint text as stored by the engine, for introspected schemas.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraint_definitions: Option<Vec<String>>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            uniques: Vec::new(),
            checks: Vec::new(),
            indexes: Vec::new(),
            full_text: None,
            constraint_definitions: None,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn is_full_text(&self) -> bool {
        self.full_text.is_some()
    }

    /// Columns that exist in storage (everything but computed columns).
    pub fn stored_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter().filter(|c| !c.is_computed())
    }

    /// Primary key columns, whether declared per column or per table.
    pub fn primary_key_columns(&self) -> Vec<&str> {
        if !self.primary_key.is_empty() {
            return self.primary_key.iter().map(String::as_str).collect();
        }
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Single integer key aliasing the rowid, if the table has one.
    pub fn rowid_column(&self) -> Option<&ColumnDef> {
        if !self.primary_key.is_empty() {
            return None;
        }
        self.columns.iter().find(|c| c.is_rowid_alias())
    }

    /// Whether `columns` exactly matches the primary key or a uniqueness
    /// constraint, i.e. can serve as an upsert conflict target.
    pub fn is_unique_set(&self, columns: &[String]) -> bool {
        let wanted: HashSet<&str> = columns.iter().map(String::as_str).collect();
        let same = |set: Vec<&str>| -> bool {
            set.len() == wanted.len() && set.iter().all(|c| wanted.contains(c))
        };
        if same(self.primary_key_columns()) {
            return true;
        }
        if columns.len() == 1 {
            if let Some(c) = self.column(&columns[0]) {
                if c.unique {
                    return true;
                }
            }
        }
        self.uniques
            .iter()
            .any(|u| same(u.iter().map(String::as_str).collect()))
            || self
                .indexes
                .iter()
                .any(|i| i.unique && same(i.columns.iter().map(String::as_str).collect()))
    }
}

/// Normalized, validated schema for a set of blueprints.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Schema {
    tables: BTreeMap<String, TableSchema>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schema from blueprints in one step.
    pub fn from_blueprints(
        tables: impl IntoIterator<Item = TableBlueprint>,
        full_text: impl IntoIterator<Item = FtsBlueprint>,
    ) -> Result<Self> {
        let mut processor = SchemaProcessor::new();
        for table in tables {
            processor.register(table)?;
        }
        for fts in full_text {
            processor.register_full_text(fts)?;
        }
        processor.process()
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.values()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub(crate) fn insert(&mut self, table: TableSchema) {
        self.tables.insert(table.name.clone(), table);
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_identifier(kind: &str, name: &str) -> Result<()> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(OrmError::schema(format!(
            "{} name '{}' is not an ASCII identifier",
            kind, name
        )))
    }
}

/// Schema processor: normalizes blueprints into a [`Schema`].
#[derive(Debug, Default)]
pub struct SchemaProcessor {
    tables: Vec<TableBlueprint>,
    full_text: Vec<FtsBlueprint>,
    names: HashSet<String>,
}

impl SchemaProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table blueprint
    pub fn register(&mut self, blueprint: TableBlueprint) -> Result<()> {
        self.claim_name(blueprint.name())?;
        self.tables.push(blueprint);
        Ok(())
    }

    /// Register a full-text table blueprint
    pub fn register_full_text(&mut self, blueprint: FtsBlueprint) -> Result<()> {
        self.claim_name(blueprint.name())?;
        self.full_text.push(blueprint);
        Ok(())
    }

    fn claim_name(&mut self, name: &str) -> Result<()> {
        check_identifier("Table", name)?;
        if !self.names.insert(name.to_string()) {
            return Err(OrmError::schema(format!(
                "Table {} already registered",
                name
            )));
        }
        Ok(())
    }

    /// Normalize and validate every registered blueprint.
    pub fn process(&self) -> Result<Schema> {
        let mut schema = Schema::new();

        for blueprint in &self.tables {
            schema.insert(normalize_table(blueprint)?);
        }

        resolve_foreign_keys(&schema)?;

        for blueprint in &self.full_text {
            let table = normalize_full_text(blueprint, &schema)?;
            schema.insert(table);
        }

        Ok(schema)
    }
}

fn is_finite(value: &Value) -> bool {
    match value {
        Value::Real(r) => r.is_finite(),
        _ => true,
    }
}

fn has_non_finite_literal(expr: &Expr) -> bool {
    let mut found = false;
    expr.walk(&mut |e| {
        if let Expr::Literal(v) = e {
            found |= !is_finite(v);
        }
    });
    found
}

fn normalize_table(blueprint: &TableBlueprint) -> Result<TableSchema> {
    let name = &blueprint.name;
    let mut table = TableSchema::new(name.clone());
    let mut seen = HashSet::new();

    let declares_key = !blueprint.primary_key.is_empty()
        || blueprint.columns.iter().any(|c| c.primary_key);
    if !declares_key {
        let mut id = ColumnDef::new(IMPLICIT_KEY, ColumnType::Integer);
        id.primary_key = true;
        seen.insert(IMPLICIT_KEY.to_string());
        table.columns.push(id);
    }

    if blueprint.columns.iter().filter(|c| c.primary_key).count() > 1 {
        return Err(OrmError::schema(format!(
            "Table {} declares more than one primary key column; use a table-level key",
            name
        )));
    }
    if !blueprint.primary_key.is_empty() && blueprint.columns.iter().any(|c| c.primary_key) {
        return Err(OrmError::schema(format!(
            "Table {} declares both column and table primary keys",
            name
        )));
    }

    for column in &blueprint.columns {
        check_identifier("Column", &column.name)?;
        if !seen.insert(column.name.clone()) {
            return Err(OrmError::schema(format!(
                "Duplicate column {} in table {}",
                column.name, name
            )));
        }

        let column_type = column.column_type.unwrap_or(ColumnType::Text);
        if let Some(ColumnDefault::Value(v)) = &column.default {
            if !column_type.accepts(v) {
                return Err(OrmError::schema(format!(
                    "Default for {}.{} is {} but the column is {}",
                    name,
                    column.name,
                    v.kind(),
                    column_type.name()
                )));
            }
        }
        let inline = [column.check.as_ref(), column.computed.as_ref()];
        let non_finite = matches!(&column.default, Some(ColumnDefault::Value(v)) if !is_finite(v))
            || inline.into_iter().flatten().any(has_non_finite_literal);
        if non_finite {
            return Err(OrmError::schema(format!(
                "Column {}.{} uses a NaN or infinite literal, which SQL cannot express",
                name, column.name
            )));
        }
        if matches!(column.default, Some(ColumnDefault::Now)) && column_type != ColumnType::Date {
            return Err(OrmError::schema(format!(
                "Column {}.{} defaults to the current time but is not a date",
                name, column.name
            )));
        }

        let mut def = ColumnDef::new(column.name.clone(), column_type);
        def.nullable = column.nullable;
        def.default = column.default.clone();
        def.primary_key = column.primary_key;
        def.unique = column.unique;
        def.check = column.check.clone();
        def.computed = column.computed.clone();
        def.references = column
            .references
            .as_ref()
            .map(|(t, c)| ForeignKey {
                table: t.clone(),
                column: c.clone(),
                on_delete_cascade: column.on_delete_cascade,
            });

        if def.is_computed()
            && (def.primary_key
                || def.unique
                || column.indexed
                || def.references.is_some()
                || def.default.is_some()
                || def.check.is_some())
        {
            return Err(OrmError::schema(format!(
                "Computed column {}.{} cannot carry storage constraints",
                name, column.name
            )));
        }

        table.columns.push(def);
    }

    if table.stored_columns().count() == 0 {
        return Err(OrmError::schema(format!("Table {} has no stored columns", name)));
    }

    // Expressions are checked once every column is known.
    for column in &table.columns {
        if let Some(expr) = &column.computed {
            check_table_expr(&table, expr, "computed column", &column.name)?;
        }
        if let Some(expr) = &column.check {
            check_table_expr(&table, expr, "check on", &column.name)?;
        }
    }
    for expr in &blueprint.checks {
        check_table_expr(&table, expr, "check on", name)?;
        if has_non_finite_literal(expr) {
            return Err(OrmError::schema(format!(
                "Check on {} uses a NaN or infinite literal, which SQL cannot express",
                name
            )));
        }
    }
    table.checks = blueprint.checks.clone();

    table.primary_key = stored_column_list(&table, &blueprint.primary_key, "primary key")?;
    for unique in &blueprint.uniques {
        let cols = stored_column_list(&table, unique, "unique constraint")?;
        table.uniques.push(cols);
    }

    let mut signatures = HashSet::new();
    let column_indexes = blueprint
        .columns
        .iter()
        .filter(|c| c.indexed)
        .map(|c| (vec![c.name.clone()], false));
    for (columns, unique) in column_indexes.chain(blueprint.indexes.iter().cloned()) {
        let columns = stored_column_list(&table, &columns, "index")?;
        if columns.is_empty() {
            return Err(OrmError::schema(format!("Empty index on table {}", name)));
        }
        if signatures.insert((columns.clone(), unique)) {
            table
                .indexes
                .push(IndexDef::generated(name, columns, unique));
        }
    }

    Ok(table)
}

fn stored_column_list(table: &TableSchema, columns: &[String], what: &str) -> Result<Vec<String>> {
    let mut out = Vec::with_capacity(columns.len());
    for column in columns {
        match table.column(column) {
            Some(c) if !c.is_computed() => out.push(column.clone()),
            Some(_) => {
                return Err(OrmError::schema(format!(
                    "{} on {} uses computed column {}",
                    what, table.name, column
                )))
            }
            None => {
                return Err(OrmError::schema(format!(
                    "{} on {} references unknown column {}",
                    what, table.name, column
                )))
            }
        }
    }
    Ok(out)
}

fn check_table_expr(table: &TableSchema, expr: &Expr, what: &str, owner: &str) -> Result<()> {
    if expr.is_query_only() {
        return Err(OrmError::schema(format!(
            "{} {} may not use aggregates, windows or subqueries",
            what, owner
        )));
    }
    for column in expr.column_refs() {
        if let Some(qualifier) = &column.table {
            if qualifier != &table.name {
                return Err(OrmError::schema(format!(
                    "{} {} references another table ({})",
                    what, owner, qualifier
                )));
            }
        }
        match table.column(&column.column) {
            Some(c) if !c.is_computed() => {}
            Some(_) => {
                return Err(OrmError::schema(format!(
                    "{} {} references computed column {}",
                    what, owner, column.column
                )))
            }
            None => {
                return Err(OrmError::schema(format!(
                    "{} {} references unknown column {}",
                    what, owner, column.column
                )))
            }
        }
    }
    Ok(())
}

fn resolve_foreign_keys(schema: &Schema) -> Result<()> {
    for table in schema.tables() {
        for column in &table.columns {
            let Some(fk) = &column.references else { continue };
            let target = schema.table(&fk.table).ok_or_else(|| {
                OrmError::schema(format!(
                    "{}.{} references undeclared table {}",
                    table.name, column.name, fk.table
                ))
            })?;
            let target_column = target.column(&fk.column).ok_or_else(|| {
                OrmError::schema(format!(
                    "{}.{} references unknown column {}.{}",
                    table.name, column.name, fk.table, fk.column
                ))
            })?;
            if !target.is_unique_set(std::slice::from_ref(&target_column.name)) {
                return Err(OrmError::schema(format!(
                    "{}.{} references {}.{}, which is neither a primary key nor unique",
                    table.name, column.name, fk.table, fk.column
                )));
            }
        }
    }
    Ok(())
}

fn normalize_full_text(blueprint: &FtsBlueprint, schema: &Schema) -> Result<TableSchema> {
    let name = &blueprint.name;
    if blueprint.columns.is_empty() {
        return Err(OrmError::schema(format!(
            "Full-text table {} declares no columns",
            name
        )));
    }

    let mut table = TableSchema::new(name.clone());
    let mut seen = HashSet::new();
    for column in &blueprint.columns {
        check_identifier("Column", column)?;
        if !seen.insert(column.clone()) {
            return Err(OrmError::schema(format!(
                "Duplicate column {} in table {}",
                column, name
            )));
        }
        let mut def = ColumnDef::new(column.clone(), ColumnType::Text);
        def.nullable = true;
        table.columns.push(def);
    }

    let mut content_rowid = None;
    if let Some(content) = &blueprint.content {
        let base = schema
            .table(content)
            .filter(|t| !t.is_full_text())
            .ok_or_else(|| {
                OrmError::schema(format!(
                    "Full-text table {} mirrors undeclared table {}",
                    name, content
                ))
            })?;
        let by_name: HashMap<&str, &ColumnDef> =
            base.stored_columns().map(|c| (c.name.as_str(), c)).collect();
        for column in &blueprint.columns {
            if !by_name.contains_key(column.as_str()) {
                return Err(OrmError::schema(format!(
                    "Full-text table {} indexes {}.{}, which does not exist",
                    name, content, column
                )));
            }
        }
        let rowid = base.rowid_column().ok_or_else(|| {
            OrmError::schema(format!(
                "Full-text table {} needs {} to have an integer primary key",
                name, content
            ))
        })?;
        content_rowid = Some(rowid.name.clone());
    }

    table.full_text = Some(FullTextConfig {
        content: blueprint.content.clone(),
        content_rowid,
        tokenizer: blueprint
            .tokenizer
            .clone()
            .unwrap_or_else(|| DEFAULT_TOKENIZER.to_string()),
    });

    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::col;

    fn items() -> TableBlueprint {
        TableBlueprint::new("items")
            .column(Column::text("name"))
            .column(Column::integer("count").default(0))
    }

    #[test]
    fn test_implicit_key_and_default_type() {
        let schema = Schema::from_blueprints(
            [items().column(Column::new("note").nullable())],
            [],
        )
        .unwrap();

        let table = schema.table("items").unwrap();
        let names: Vec<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "name", "count", "note"]);
        assert!(table.columns[0].is_rowid_alias());
        assert_eq!(table.column("note").unwrap().column_type, ColumnType::Text);
        assert_eq!(table.rowid_column().unwrap().name, "id");
    }

    #[test]
    fn test_declared_key_suppresses_implicit_id() {
        let schema = Schema::from_blueprints(
            [TableBlueprint::new("tags").column(Column::text("slug").primary_key())],
            [],
        )
        .unwrap();
        let table = schema.table("tags").unwrap();
        assert!(table.column("id").is_none());
        assert_eq!(table.primary_key_columns(), vec!["slug"]);
    }

    #[test]
    fn test_duplicate_column_rejected() {
        let err = Schema::from_blueprints(
            [TableBlueprint::new("t")
                .column(Column::text("a"))
                .column(Column::integer("a"))],
            [],
        )
        .unwrap_err();
        assert!(matches!(err, OrmError::SchemaValidation(_)));
    }

    #[test]
    fn test_non_ascii_identifier_rejected() {
        let err = Schema::from_blueprints(
            [TableBlueprint::new("t").column(Column::text("naïve"))],
            [],
        )
        .unwrap_err();
        assert!(matches!(err, OrmError::SchemaValidation(_)));
    }

    #[test]
    fn test_foreign_key_requires_declared_table() {
        let err = Schema::from_blueprints(
            [TableBlueprint::new("orders").column(Column::integer("user_id").references("users", "id"))],
            [],
        )
        .unwrap_err();
        assert!(err.to_string().contains("undeclared table users"));

        let schema = Schema::from_blueprints(
            [
                TableBlueprint::new("users").column(Column::text("email").unique()),
                TableBlueprint::new("orders").column(
                    Column::integer("user_id")
                        .references("users", "id")
                        .on_delete_cascade(),
                ),
            ],
            [],
        )
        .unwrap();
        let fk = schema
            .table("orders")
            .unwrap()
            .column("user_id")
            .unwrap()
            .references
            .clone()
            .unwrap();
        assert!(fk.on_delete_cascade);
    }

    #[test]
    fn test_indexes_are_deduplicated() {
        let schema = Schema::from_blueprints(
            [items()
                .index(["name"])
                .index(["name"])
                .unique_index(["name", "count"])],
            [],
        )
        .unwrap();
        let table = schema.table("items").unwrap();
        assert_eq!(table.indexes.len(), 2);
        assert_eq!(table.indexes[0].name, "idx_items_name");
        assert_eq!(table.indexes[1].name, "uidx_items_name_count");
        assert!(table.is_unique_set(&["name".to_string(), "count".to_string()]));
    }

    #[test]
    fn test_index_on_unknown_column_rejected() {
        let err = Schema::from_blueprints([items().index(["missing"])], []).unwrap_err();
        assert!(matches!(err, OrmError::SchemaValidation(_)));
    }

    #[test]
    fn test_computed_column_validation() {
        let ok = Schema::from_blueprints(
            [TableBlueprint::new("lines")
                .column(Column::real("price"))
                .column(Column::integer("qty"))
                .column(Column::computed(
                    "total",
                    ColumnType::Real,
                    col("price").mul(col("qty")),
                ))],
            [],
        );
        assert!(ok.is_ok());

        let err = Schema::from_blueprints(
            [TableBlueprint::new("lines")
                .column(Column::real("price"))
                .column(Column::computed("total", ColumnType::Real, col("nope").mul(2)))],
            [],
        )
        .unwrap_err();
        assert!(matches!(err, OrmError::SchemaValidation(_)));
    }

    #[test]
    fn test_empty_full_text_rejected() {
        let mut processor = SchemaProcessor::new();
        processor.register(items()).unwrap();
        processor
            .register_full_text(FtsBlueprint::new("items_fts").content("items"))
            .unwrap();
        let err = processor.process().unwrap_err();
        assert!(matches!(err, OrmError::SchemaValidation(_)));
    }

    #[test]
    fn test_full_text_defaults() {
        let schema = Schema::from_blueprints(
            [items()],
            [FtsBlueprint::new("items_fts").columns(["name"]).content("items")],
        )
        .unwrap();
        let fts = schema.table("items_fts").unwrap().full_text.clone().unwrap();
        assert_eq!(fts.tokenizer, DEFAULT_TOKENIZER);
        assert_eq!(fts.content.as_deref(), Some("items"));
        assert_eq!(fts.content_rowid.as_deref(), Some("id"));
    }

    #[test]
    fn test_duplicate_table_rejected() {
        let mut processor = SchemaProcessor::new();
        processor.register(items()).unwrap();
        assert!(processor.register(items()).is_err());
    }

    #[test]
    fn test_default_type_mismatch_rejected() {
        let err = Schema::from_blueprints(
            [TableBlueprint::new("t").column(Column::integer("n").default("x"))],
            [],
        )
        .unwrap_err();
        assert!(matches!(err, OrmError::SchemaValidation(_)));
    }

    #[test]
    fn test_non_finite_literals_rejected() {
        for blueprint in [
            TableBlueprint::new("t").column(Column::real("r").default(f64::NAN)),
            TableBlueprint::new("t").column(Column::real("r").default(f64::INFINITY)),
            TableBlueprint::new("t")
                .column(Column::real("r"))
                .column(Column::computed("s", ColumnType::Real, col("r").mul(f64::NEG_INFINITY))),
            TableBlueprint::new("t")
                .column(Column::real("r"))
                .check(col("r").lt(f64::INFINITY)),
        ] {
            let err = Schema::from_blueprints([blueprint], []).unwrap_err();
            assert!(matches!(err, OrmError::SchemaValidation(_)), "{}", err);
        }

        let ok = Schema::from_blueprints(
            [TableBlueprint::new("t").column(Column::real("r").default(1.5))],
            [],
        );
        assert!(ok.is_ok());
    }
}
