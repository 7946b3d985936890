use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject,
    Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRoom {
        name: String,
        description: Option<String>,
    },
    SelectRooms {
        id: Option<RoomId>,
    },
    UpdateRoom {
        id: RoomId,
        patch: RoomPatch,
    },
    DeleteRoom {
        id: RoomId,
    },
    InsertReservation {
        room_id: RoomId,
        from_reserve: Ms,
        to_reserve: Ms,
    },
    /// `room_id: None` lists every reservation (administrators only).
    SelectReservations {
        room_id: Option<RoomId>,
    },
    SelectMyReservations,
    UpdateReservation {
        id: ReservationId,
        patch: ReservationPatch,
    },
    DeleteReservation {
        id: ReservationId,
    },
    InsertUser {
        email: String,
        password: String,
        is_superuser: bool,
    },
    SelectUsers {
        id: Option<UserId>,
    },
    UpdateUser {
        id: UserId,
        patch: UserPatch,
    },
}

pub const ROOMS: &str = "meeting_rooms";
pub const RESERVATIONS: &str = "reservations";
pub const MY_RESERVATIONS: &str = "my_reservations";
pub const USERS: &str = "users";

/// Column order used when an INSERT has no column list.
const ROOM_INSERT_COLUMNS: &[&str] = &["name", "description"];
const RESERVATION_INSERT_COLUMNS: &[&str] = &["meetingroom_id", "from_reserve", "to_reserve"];
const USER_INSERT_COLUMNS: &[&str] = &["email", "password", "is_superuser"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [stmt] => stmt,
        _ => return Err(SqlError::Unsupported("multiple statements".into())),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Table a statement targets, without interpreting its values. Used to
/// describe prepared statements whose `$N` parameters are still unbound.
pub fn statement_table(sql: &str) -> Option<String> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).ok()?;
    match stmts.first()? {
        Statement::Insert(insert) => insert_table_name(insert).ok(),
        Statement::Delete(delete) => delete_table_name(delete).ok(),
        Statement::Update { table, .. } => table_factor_name(&table.relation).ok(),
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => table_factor_name(&select.from.first()?.relation).ok(),
            _ => None,
        },
        _ => None,
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        ROOMS => {
            let mut row = insert_row(insert, ROOMS, ROOM_INSERT_COLUMNS)?;
            let name = row
                .remove("name")
                .ok_or(SqlError::MissingColumn("name"))?;
            Ok(Command::InsertRoom {
                name: parse_string(&name)?,
                description: row.remove("description").map(|e| parse_string_or_null(&e)).transpose()?.flatten(),
            })
        }
        RESERVATIONS => {
            let mut row = insert_row(insert, RESERVATIONS, RESERVATION_INSERT_COLUMNS)?;
            let mut take = |col: &'static str| row.remove(col).ok_or(SqlError::MissingColumn(col));
            Ok(Command::InsertReservation {
                room_id: parse_i64(&take("meetingroom_id")?)?,
                from_reserve: parse_timestamp(&take("from_reserve")?)?,
                to_reserve: parse_timestamp(&take("to_reserve")?)?,
            })
        }
        USERS => {
            let mut row = insert_row(insert, USERS, USER_INSERT_COLUMNS)?;
            let email = row.remove("email").ok_or(SqlError::MissingColumn("email"))?;
            let password = row.remove("password").ok_or(SqlError::MissingColumn("password"))?;
            Ok(Command::InsertUser {
                email: parse_string(&email)?,
                password: parse_string(&password)?,
                is_superuser: row.remove("is_superuser").map(|e| parse_bool(&e)).transpose()?.unwrap_or(false),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        ROOMS => Ok(Command::DeleteRoom { id }),
        RESERVATIONS => Ok(Command::DeleteReservation { id }),
        USERS => Err(SqlError::Unsupported("users cannot be deleted".into())),
        _ => Err(SqlError::UnknownTable(table)),
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
    let filter = |column: &'static str| match &select.selection {
        Some(expr) => extract_eq_filter(expr, column),
        None => Ok(None),
    };

    match table.as_str() {
        ROOMS => Ok(Command::SelectRooms { id: filter("id")? }),
        RESERVATIONS => Ok(Command::SelectReservations {
            room_id: filter("meetingroom_id")?,
        }),
        MY_RESERVATIONS => Ok(Command::SelectMyReservations),
        USERS => Ok(Command::SelectUsers { id: filter("id")? }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;
    let mut set = HashMap::new();
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        set.insert(column, assignment.value.clone());
    }

    match table.as_str() {
        ROOMS => {
            check_columns(&set, ROOMS, &["name", "description"])?;
            Ok(Command::UpdateRoom {
                id,
                patch: RoomPatch {
                    name: set.get("name").map(parse_string).transpose()?,
                    description: set.get("description").map(parse_string_or_null).transpose()?,
                },
            })
        }
        RESERVATIONS => {
            check_columns(&set, RESERVATIONS, &["from_reserve", "to_reserve"])?;
            Ok(Command::UpdateReservation {
                id,
                patch: ReservationPatch {
                    from_reserve: set.get("from_reserve").map(parse_timestamp).transpose()?,
                    to_reserve: set.get("to_reserve").map(parse_timestamp).transpose()?,
                },
            })
        }
        USERS => {
            check_columns(&set, USERS, &["password", "is_active", "is_superuser"])?;
            Ok(Command::UpdateUser {
                id,
                patch: UserPatch {
                    password: set.get("password").map(parse_string).transpose()?,
                    is_active: set.get("is_active").map(parse_bool).transpose()?,
                    is_superuser: set.get("is_superuser").map(parse_bool).transpose()?,
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Helpers ───────────────────────────────────────────────────

/// Columns the server owns. Clients may name them in neither INSERT nor UPDATE.
fn is_read_only(table: &str, column: &str) -> bool {
    matches!(
        (table, column),
        (_, "id") | (RESERVATIONS, "user_id") | (RESERVATIONS, "meetingroom_id") | (USERS, "email")
    )
}

fn check_columns(set: &HashMap<String, Expr>, table: &str, writable: &[&str]) -> Result<(), SqlError> {
    for column in set.keys() {
        if writable.contains(&column.as_str()) {
            continue;
        }
        if is_read_only(table, column) {
            return Err(SqlError::ReadOnlyColumn(column.clone()));
        }
        return Err(SqlError::UnknownColumn(column.clone()));
    }
    Ok(())
}

/// The single VALUES row keyed by column name. Without a column list, values
/// map positionally onto `positional`.
fn insert_row(insert: &ast::Insert, table: &str, positional: &[&str]) -> Result<HashMap<String, Expr>, SqlError> {
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = if insert.columns.is_empty() {
        if values.len() > positional.len() {
            return Err(SqlError::WrongArity(positional.len(), values.len()));
        }
        positional.iter().map(|c| c.to_string()).collect()
    } else {
        if insert.columns.len() != values.len() {
            return Err(SqlError::WrongArity(insert.columns.len(), values.len()));
        }
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };

    let row: HashMap<String, Expr> = columns.into_iter().zip(values).collect();
    // INSERT columns are the positional set; `meetingroom_id` is writable here.
    for column in row.keys() {
        if !positional.contains(&column.as_str()) {
            return Err(if is_read_only(table, column) {
                SqlError::ReadOnlyColumn(column.clone())
            } else {
                SqlError::UnknownColumn(column.clone())
            });
        }
    }
    Ok(row)
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

fn extract_where_id(selection: &Option<Expr>) -> Result<i64, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    extract_eq_filter(sel, "id")?.ok_or(SqlError::MissingFilter("id"))
}

/// Value of `column = N` anywhere in an AND chain.
fn extract_eq_filter(expr: &Expr, column: &str) -> Result<Option<i64>, SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => match extract_eq_filter(left, column)? {
            Some(v) => Ok(Some(v)),
            None => extract_eq_filter(right, column),
        },
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some(column) => Ok(Some(parse_i64(right)?)),
        Expr::Nested(inner) => extract_eq_filter(inner, column),
        _ => Ok(None),
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

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

/// Unix milliseconds, or a quoted ISO-8601 timestamp. Naive times are UTC.
fn parse_timestamp(expr: &Expr) -> Result<Ms, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => parse_timestamp_str(s),
        _ => parse_i64(expr),
    }
}

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

pub fn parse_timestamp_str(s: &str) -> Result<Ms, SqlError> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<i64>() {
        return Ok(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc().timestamp_millis())
        .ok_or_else(|| SqlError::Parse(format!("bad timestamp {s:?}")))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    ReadOnlyColumn(String),
    /// (expected, got)
    WrongArity(usize, usize),
    MissingColumn(&'static str),
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
            SqlError::ReadOnlyColumn(c) => write!(f, "column {c} cannot be written"),
            SqlError::WrongArity(expected, got) => {
                write!(f, "expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing value for column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
