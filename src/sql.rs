use chrono::{NaiveDate, Weekday};
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// `INSERT INTO schedules (...)` — create or replace a salon's schedule.
    UpsertSchedule {
        salon_id: Ulid,
        schedule: SalonSchedule,
    },
    SelectSchedule {
        salon_id: Ulid,
    },
    SelectAvailability {
        salon_id: Ulid,
        date: NaiveDate,
    },
    /// `INSERT INTO bookings (...)` — reserve a slot.
    InsertBooking {
        id: Ulid,
        salon_id: Ulid,
        date: NaiveDate,
        start: Minutes,
        end: Minutes,
        customer_id: Ulid,
    },
    /// `UPDATE bookings SET status = 'confirmed' WHERE id = .. AND customer_id = ..`
    ConfirmBooking {
        id: Ulid,
        customer_id: Ulid,
    },
    /// `UPDATE .. SET status = 'cancelled'` or `DELETE FROM bookings WHERE ..`
    CancelBooking {
        id: Ulid,
        customer_id: Ulid,
    },
    SelectBookings {
        salon_id: Option<Ulid>,
        customer_id: Option<Ulid>,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if trimmed.to_uppercase().starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches(';').to_string();
        return Ok(Command::Listen { channel });
    }
    if trimmed.to_uppercase().starts_with("UNLISTEN") {
        let channel = trimmed[8..].trim().trim_matches(';').to_string();
        return Ok(Command::Unlisten { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        // (salon_id, working_days, start_time, end_time,
        //  break_start_time, break_end_time, slot_duration, max_bookings_per_slot)
        "schedules" => {
            if values.len() < 8 {
                return Err(SqlError::WrongArity("schedules", 8, values.len()));
            }
            Ok(Command::UpsertSchedule {
                salon_id: parse_ulid(&values[0])?,
                schedule: SalonSchedule {
                    working_days: parse_weekdays(&values[1])?,
                    start_time: parse_minutes(&values[2])?,
                    end_time: parse_minutes(&values[3])?,
                    break_start_time: parse_minutes(&values[4])?,
                    break_end_time: parse_minutes(&values[5])?,
                    slot_duration: parse_u16(&values[6])?,
                    max_bookings_per_slot: parse_u32(&values[7])?,
                },
            })
        }
        // (id, salon_id, date, start_time, end_time, customer_id)
        "bookings" => {
            if values.len() < 6 {
                return Err(SqlError::WrongArity("bookings", 6, values.len()));
            }
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                salon_id: parse_ulid(&values[1])?,
                date: parse_date(&values[2])?,
                start: parse_minutes(&values[3])?,
                end: parse_minutes(&values[4])?,
                customer_id: parse_ulid(&values[5])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }

    let mut status = None;
    for assignment in assignments {
        let col = match &assignment.target {
            ast::AssignmentTarget::ColumnName(name) => object_name_last(name),
            _ => None,
        };
        if col.as_deref() == Some("status") {
            status = Some(parse_string(&assignment.value)?);
        }
    }
    let status = status.ok_or(SqlError::MissingFilter("status"))?;

    let filters = extract_eq_filters(selection)?;
    let id = filters
        .ulid("id")?
        .ok_or(SqlError::MissingFilter("id"))?;
    let customer_id = filters
        .ulid("customer_id")?
        .ok_or(SqlError::MissingFilter("customer_id"))?;

    match status.to_lowercase().as_str() {
        "confirmed" => Ok(Command::ConfirmBooking { id, customer_id }),
        "cancelled" => Ok(Command::CancelBooking { id, customer_id }),
        other => Err(SqlError::Unsupported(format!("status '{other}'"))),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }

    let filters = extract_eq_filters(&delete.selection)?;
    let id = filters
        .ulid("id")?
        .ok_or(SqlError::MissingFilter("id"))?;
    let customer_id = filters
        .ulid("customer_id")?
        .ok_or(SqlError::MissingFilter("customer_id"))?;
    Ok(Command::CancelBooking { id, customer_id })
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
    let filters = extract_eq_filters(&select.selection)?;

    match table.as_str() {
        "availability" => Ok(Command::SelectAvailability {
            salon_id: filters
                .ulid("salon_id")?
                .ok_or(SqlError::MissingFilter("salon_id"))?,
            date: filters
                .date("date")?
                .ok_or(SqlError::MissingFilter("date"))?,
        }),
        "schedules" => Ok(Command::SelectSchedule {
            salon_id: filters
                .ulid("salon_id")?
                .ok_or(SqlError::MissingFilter("salon_id"))?,
        }),
        "bookings" => {
            let salon_id = filters.ulid("salon_id")?;
            let customer_id = filters.ulid("customer_id")?;
            if salon_id.is_none() && customer_id.is_none() {
                return Err(SqlError::MissingFilter("salon_id or customer_id"));
            }
            Ok(Command::SelectBookings {
                salon_id,
                customer_id,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE clause ──────────────────────────────────────────────

/// Equality filters from a WHERE clause: `col = value [AND ...]`.
struct EqFilters(Vec<(String, Expr)>);

impl EqFilters {
    fn get(&self, col: &str) -> Option<&Expr> {
        self.0.iter().find(|(c, _)| c == col).map(|(_, e)| e)
    }

    fn ulid(&self, col: &str) -> Result<Option<Ulid>, SqlError> {
        self.get(col).map(parse_ulid).transpose()
    }

    fn date(&self, col: &str) -> Result<Option<NaiveDate>, SqlError> {
        self.get(col).map(parse_date).transpose()
    }
}

fn extract_eq_filters(selection: &Option<Expr>) -> Result<EqFilters, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        collect_eq(expr, &mut out)?;
    }
    Ok(EqFilters(out))
}

fn collect_eq(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq(left, out)?;
            collect_eq(right, out)?;
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if let Some(col) = expr_column_name(left) {
                out.push((col, (**right).clone()));
            }
        }
        Expr::Nested(inner) => collect_eq(inner, out)?,
        other => return Err(SqlError::Unsupported(format!("WHERE clause: {other}"))),
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────

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
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows[0].clone())
        }
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad number: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_u16(expr: &Expr) -> Result<u16, SqlError> {
    let v = parse_i64(expr)?;
    u16::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u16 range")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

/// `'HH:MM'` or a bare minute-of-day number.
fn parse_minutes(expr: &Expr) -> Result<Minutes, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && let Some((h, m)) = s.split_once(':')
    {
        let h: u16 = h
            .parse()
            .map_err(|_| SqlError::Parse(format!("bad time: {s}")))?;
        let m: u16 = m
            .parse()
            .map_err(|_| SqlError::Parse(format!("bad time: {s}")))?;
        if h > 24 || m >= 60 {
            return Err(SqlError::Parse(format!("bad time: {s}")));
        }
        return Ok(h * 60 + m);
    }
    parse_u16(expr)
}

/// `'YYYY-MM-DD'`.
fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date: {e}")))
}

/// Comma-separated weekday names: `'mon,tue,fri'`.
fn parse_weekdays(expr: &Expr) -> Result<WeekdaySet, SqlError> {
    let s = parse_string(expr)?;
    let mut set = WeekdaySet::empty();
    for token in s.split(',') {
        let day = match token.trim().to_lowercase().as_str() {
            "mon" => Weekday::Mon,
            "tue" => Weekday::Tue,
            "wed" => Weekday::Wed,
            "thu" => Weekday::Thu,
            "fri" => Weekday::Fri,
            "sat" => Weekday::Sat,
            "sun" => Weekday::Sun,
            other => return Err(SqlError::Parse(format!("bad weekday: {other}"))),
        };
        set.insert(day);
    }
    Ok(set)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
