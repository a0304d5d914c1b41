use chrono::{NaiveDate, NaiveDateTime, Timelike};
use chrono_tz::Tz;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::schedule::local_minute_to_ms;
use crate::engine::Actor;
use crate::model::*;

/// A booking start as written by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAt {
    /// Unix milliseconds.
    Instant(Ms),
    /// Wall-clock time in the business time zone.
    Local(NaiveDateTime),
}

impl StartAt {
    /// `None` when a local time falls in a DST gap.
    pub fn resolve(self, tz: &Tz) -> Option<Ms> {
        match self {
            StartAt::Instant(ms) => Some(ms),
            StartAt::Local(dt) => {
                let minute = dt.hour() * 60 + dt.minute();
                local_minute_to_ms(tz, dt.date(), minute)
            }
        }
    }
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SelectSlots {
        service_id: ServiceId,
        agent_id: Option<AgentId>,
        date: NaiveDate,
    },
    SelectBookingById {
        id: Ulid,
    },
    SelectBookingByToken {
        token: String,
    },
    InsertBooking {
        service_id: ServiceId,
        agent_id: Option<AgentId>,
        start: StartAt,
        customer_id: String,
        status: BookingStatus,
    },
    CancelByToken {
        token: String,
    },
    SetStatusByToken {
        token: String,
        status: BookingStatus,
    },
    RescheduleByToken {
        token: String,
        start: StartAt,
    },
    TransitionById {
        id: Ulid,
        status: BookingStatus,
        actor: Actor,
    },
    CompleteElapsed {
        before: Ms,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection.as_ref()),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

const INSERT_COLUMNS: [&str; 5] = ["service_id", "agent_id", "start", "customer_id", "status"];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }
    let rows = extract_insert_rows(insert)?;
    if rows.len() != 1 {
        return Err(SqlError::Unsupported("one booking per INSERT".into()));
    }
    let values = &rows[0];

    // Named columns, or positional in the documented order.
    let columns: Vec<String> = if insert.columns.is_empty() {
        INSERT_COLUMNS.iter().take(values.len()).map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if columns.len() != values.len() {
        return Err(SqlError::WrongArity("bookings", columns.len(), values.len()));
    }

    let (mut service_id, mut agent_id, mut start, mut customer_id, mut status) = (None, None, None, None, None);
    for (col, value) in columns.iter().zip(values) {
        match col.as_str() {
            "service_id" => service_id = Some(parse_u32(value)?),
            "agent_id" => agent_id = parse_u32_or_null(value)?,
            "start" => start = Some(parse_start(value)?),
            "customer_id" => customer_id = Some(parse_string(value)?),
            "status" => status = Some(parse_status(value)?),
            other => return Err(SqlError::UnknownColumn(other.to_string())),
        }
    }

    Ok(Command::InsertBooking {
        service_id: service_id.ok_or(SqlError::MissingValue("service_id"))?,
        agent_id,
        start: start.ok_or(SqlError::MissingValue("start"))?,
        customer_id: customer_id.ok_or(SqlError::MissingValue("customer_id"))?,
        status: status.unwrap_or(BookingStatus::Confirmed),
    })
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }

    let (mut status, mut start, mut actor) = (None, None, None);
    for a in assignments {
        let col = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Parse("unsupported SET target".into()))?;
        match col.as_str() {
            "status" => status = Some(parse_status(&a.value)?),
            "start" => start = Some(parse_start(&a.value)?),
            "actor" => {
                let s = parse_string(&a.value)?;
                actor = Some(s.parse::<Actor>().map_err(SqlError::Parse)?);
            }
            other => return Err(SqlError::UnknownColumn(other.to_string())),
        }
    }

    let filter = selection.ok_or(SqlError::MissingFilter("id, manage_token or end"))?;
    let (col, op, right) = single_comparison(filter)?;

    match (col.as_str(), op) {
        ("manage_token", ast::BinaryOperator::Eq) => {
            if actor.is_some() {
                return Err(SqlError::Unsupported("actor with a manage token".into()));
            }
            let token = parse_string(right)?;
            match (status, start) {
                (Some(BookingStatus::Cancelled), None) => Ok(Command::CancelByToken { token }),
                (Some(status), None) => Ok(Command::SetStatusByToken { token, status }),
                (None, Some(start)) => Ok(Command::RescheduleByToken { token, start }),
                (Some(_), Some(_)) => Err(SqlError::Unsupported("SET status and start together".into())),
                (None, None) => Err(SqlError::MissingValue("status or start")),
            }
        }
        ("id", ast::BinaryOperator::Eq) => {
            if start.is_some() {
                return Err(SqlError::Unsupported("reschedule by id; use the manage token".into()));
            }
            Ok(Command::TransitionById {
                id: parse_ulid_expr(right)?,
                status: status.ok_or(SqlError::MissingValue("status"))?,
                actor: actor.unwrap_or(Actor::Admin),
            })
        }
        ("end", ast::BinaryOperator::LtEq) => {
            if status != Some(BookingStatus::Completed) || start.is_some() || actor.is_some() {
                return Err(SqlError::Unsupported("bulk update other than status = 'completed'".into()));
            }
            Ok(Command::CompleteElapsed {
                before: parse_i64_expr(right)?,
            })
        }
        _ => Err(SqlError::MissingFilter("id, manage_token or end")),
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

    match table.as_str() {
        "slots" => {
            let (mut service_id, mut agent_id, mut date) = (None, None, None);
            if let Some(selection) = &select.selection {
                extract_slot_filters(selection, &mut service_id, &mut agent_id, &mut date)?;
            }
            Ok(Command::SelectSlots {
                service_id: service_id.ok_or(SqlError::MissingFilter("service_id"))?,
                agent_id,
                date: date.ok_or(SqlError::MissingFilter("date"))?,
            })
        }
        "bookings" => {
            let filter = select
                .selection
                .as_ref()
                .ok_or(SqlError::MissingFilter("id or manage_token"))?;
            match single_comparison(filter)? {
                (col, ast::BinaryOperator::Eq, right) if col == "id" => Ok(Command::SelectBookingById {
                    id: parse_ulid_expr(right)?,
                }),
                (col, ast::BinaryOperator::Eq, right) if col == "manage_token" => {
                    Ok(Command::SelectBookingByToken {
                        token: parse_string(right)?,
                    })
                }
                _ => Err(SqlError::MissingFilter("id or manage_token")),
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_slot_filters(
    expr: &Expr,
    service_id: &mut Option<ServiceId>,
    agent_id: &mut Option<AgentId>,
    date: &mut Option<NaiveDate>,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_slot_filters(inner, service_id, agent_id, date)?,
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_slot_filters(left, service_id, agent_id, date)?;
                extract_slot_filters(right, service_id, agent_id, date)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("service_id") => *service_id = Some(parse_u32(right)?),
                Some("agent_id") => *agent_id = parse_u32_or_null(right)?,
                Some("date") => {
                    let s = parse_string(right)?;
                    let d = NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                        .map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))?;
                    *date = Some(d);
                }
                _ => {}
            },
            _ => {}
        },
        _ => {}
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────

/// `column <op> value`, with nothing else in the WHERE clause.
fn single_comparison(expr: &Expr) -> Result<(String, ast::BinaryOperator, &Expr), SqlError> {
    match expr {
        Expr::Nested(inner) => single_comparison(inner),
        Expr::BinaryOp { left, op, right } => {
            let col = expr_column_name(left).ok_or_else(|| SqlError::Parse("expected column on the left".into()))?;
            Ok((col, op.clone(), right.as_ref()))
        }
        _ => Err(SqlError::Parse("expected a single comparison".into())),
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

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(&values.rows),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
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

fn parse_status(expr: &Expr) -> Result<BookingStatus, SqlError> {
    parse_string(expr)?.parse().map_err(SqlError::Parse)
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => Ok(Some(parse_u32(expr)?)),
    }
}

/// Unix ms as a number or string, or `'YYYY-MM-DD HH:MM'` local time.
fn parse_start(expr: &Expr) -> Result<StartAt, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && s.parse::<i64>().is_err()
    {
        return ["%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
            .map(StartAt::Local)
            .ok_or_else(|| SqlError::Parse(format!("bad start time: {s}")));
    }
    parse_i64_expr(expr).map(StartAt::Instant)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    MissingValue(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingValue(col) => write!(f, "missing value: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
