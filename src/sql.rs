use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input. The owner of a reservation is never part of
/// the statement; the wire layer fills it in from the session user.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertReservation {
        id: Option<Ulid>,
        resource_id: String,
        start: Ms,
        end: Ms,
        ttl_ms: Option<Ms>,
        metadata: Metadata,
        returning: bool,
    },
    Confirm {
        id: Ulid,
        appointment_id: String,
        returning: bool,
    },
    Cancel {
        id: Ulid,
        returning: bool,
    },
    Cleanup {
        older_than_ms: Ms,
    },
    SelectReservations {
        filter: ReservationFilter,
    },
    SelectConflicts {
        resource_id: String,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    },
    SelectSlots {
        resource_id: String,
        start: Ms,
        end: Ms,
        duration: Ms,
        step: Option<Ms>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported("multiple statements".into()));
    }

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    let values = extract_insert_values(insert)?;
    if columns.is_empty() {
        return Err(SqlError::Parse(format!("{table}: column list is required")));
    }
    if columns.len() != values.len() {
        return Err(SqlError::WrongArity(columns.len(), values.len()));
    }
    let row = InsertRow { columns, values };
    let returning = insert.returning.is_some();

    match table.as_str() {
        "reservations" => {
            row.check_columns(&["id", "resource_id", "start", "end", "ttl", "metadata"])?;
            Ok(Command::InsertReservation {
                id: row.get("id").map(parse_ulid_or_null).transpose()?.flatten(),
                resource_id: parse_string(row.require("resource_id")?)?,
                start: parse_i64(row.require("start")?)?,
                end: parse_i64(row.require("end")?)?,
                ttl_ms: row.get("ttl").map(parse_i64_or_null).transpose()?.flatten(),
                metadata: row.get("metadata").map(parse_metadata).transpose()?.unwrap_or_default(),
                returning,
            })
        }
        "confirmations" => {
            row.check_columns(&["id", "appointment_id"])?;
            Ok(Command::Confirm {
                id: parse_ulid(row.require("id")?)?,
                appointment_id: parse_string(row.require("appointment_id")?)?,
                returning,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "reservations" {
        return Err(SqlError::UnknownTable(table));
    }
    let selection = delete.selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    let predicates = collect_predicates(selection)?;

    match predicates.as_slice() {
        [p] if p.column == "id" && p.op == BinaryOperator::Eq => Ok(Command::Cancel {
            id: parse_ulid(p.value)?,
            returning: delete.returning.is_some(),
        }),
        [p] if p.column == "age" && p.op == BinaryOperator::GtEq => Ok(Command::Cleanup {
            older_than_ms: parse_i64(p.value)?,
        }),
        _ => Err(SqlError::Unsupported(
            "DELETE FROM reservations needs WHERE id = .. or WHERE age >= ..".into(),
        )),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let predicates = match &select.selection {
        Some(selection) => collect_predicates(selection)?,
        None => Vec::new(),
    };

    match table.as_str() {
        "reservations" => {
            let mut filter = ReservationFilter::default();
            for p in &predicates {
                match (p.column.as_str(), &p.op) {
                    ("id", BinaryOperator::Eq) => filter.id = Some(parse_ulid(p.value)?),
                    ("status", BinaryOperator::Eq) => {
                        let s = parse_string(p.value)?;
                        filter.status = Some(s.parse().map_err(SqlError::Parse)?);
                    }
                    ("resource_id", BinaryOperator::Eq) => {
                        filter.resource_id = Some(parse_string(p.value)?)
                    }
                    ("start", BinaryOperator::GtEq) => filter.start = Some(parse_i64(p.value)?),
                    ("end", BinaryOperator::LtEq) => filter.end = Some(parse_i64(p.value)?),
                    _ => return Err(p.unsupported()),
                }
            }
            Ok(Command::SelectReservations { filter })
        }
        "conflicts" => {
            let (mut resource_id, mut start, mut end, mut exclude) = (None, None, None, None);
            for p in &predicates {
                match (p.column.as_str(), &p.op) {
                    ("resource_id", BinaryOperator::Eq) => resource_id = Some(parse_string(p.value)?),
                    ("start", BinaryOperator::GtEq) => start = Some(parse_i64(p.value)?),
                    ("end", BinaryOperator::LtEq) => end = Some(parse_i64(p.value)?),
                    ("exclude_id", BinaryOperator::Eq) => exclude = parse_ulid_or_null(p.value)?,
                    _ => return Err(p.unsupported()),
                }
            }
            Ok(Command::SelectConflicts {
                resource_id: resource_id.ok_or(SqlError::MissingFilter("resource_id"))?,
                start: start.ok_or(SqlError::MissingFilter("start"))?,
                end: end.ok_or(SqlError::MissingFilter("end"))?,
                exclude,
            })
        }
        "slots" => {
            let (mut resource_id, mut start, mut end, mut duration, mut step) = (None, None, None, None, None);
            for p in &predicates {
                match (p.column.as_str(), &p.op) {
                    ("resource_id", BinaryOperator::Eq) => resource_id = Some(parse_string(p.value)?),
                    ("start", BinaryOperator::GtEq) => start = Some(parse_i64(p.value)?),
                    ("end", BinaryOperator::LtEq) => end = Some(parse_i64(p.value)?),
                    ("duration", BinaryOperator::Eq) => duration = Some(parse_i64(p.value)?),
                    ("step", BinaryOperator::Eq) => step = Some(parse_i64(p.value)?),
                    _ => return Err(p.unsupported()),
                }
            }
            Ok(Command::SelectSlots {
                resource_id: resource_id.ok_or(SqlError::MissingFilter("resource_id"))?,
                start: start.ok_or(SqlError::MissingFilter("start"))?,
                end: end.ok_or(SqlError::MissingFilter("end"))?,
                duration: duration.ok_or(SqlError::MissingFilter("duration"))?,
                step,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Helpers ───────────────────────────────────────────────────

/// A single INSERT row, addressed by column name.
struct InsertRow {
    columns: Vec<String>,
    values: Vec<Expr>,
}

impl InsertRow {
    fn get(&self, column: &str) -> Option<&Expr> {
        self.columns.iter().position(|c| c == column).map(|i| &self.values[i])
    }

    fn require(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }

    fn check_columns(&self, allowed: &[&str]) -> Result<(), SqlError> {
        match self.columns.iter().find(|c| !allowed.contains(&c.as_str())) {
            Some(unknown) => Err(SqlError::UnknownColumn(unknown.clone())),
            None => Ok(()),
        }
    }
}

/// `column <op> value`, one leaf of an AND-only WHERE clause.
struct Predicate<'a> {
    column: String,
    op: BinaryOperator,
    value: &'a Expr,
}

impl Predicate<'_> {
    fn unsupported(&self) -> SqlError {
        SqlError::Unsupported(format!("filter {} {}", self.column, self.op))
    }
}

fn collect_predicates(expr: &Expr) -> Result<Vec<Predicate<'_>>, SqlError> {
    let mut out = Vec::new();
    push_predicates(expr, &mut out)?;
    Ok(out)
}

fn push_predicates<'a>(expr: &'a Expr, out: &mut Vec<Predicate<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => push_predicates(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            push_predicates(left, out)?;
            push_predicates(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push(Predicate {
                column,
                op: op.clone(),
                value: right,
            });
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid(expr).map(Some)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_i64(expr).map(Some)
}

/// The metadata column is a JSON object. String values are kept as-is; any
/// other JSON value is stored in its JSON text form.
fn parse_metadata(expr: &Expr) -> Result<Metadata, SqlError> {
    if is_null(expr) {
        return Ok(Metadata::new());
    }
    let text = parse_string(expr)?;
    let object: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(&text).map_err(|e| SqlError::Parse(format!("bad metadata JSON: {e}")))?;
    Ok(object
        .into_iter()
        .map(|(k, v)| match v {
            serde_json::Value::String(s) => (k, s),
            other => (k, other.to_string()),
        })
        .collect())
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    MissingColumn(&'static str),
    WrongArity(usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::MissingColumn(c) => write!(f, "missing column: {c}"),
            SqlError::WrongArity(columns, values) => {
                write!(f, "{columns} columns but {values} values")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
