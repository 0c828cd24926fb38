use chrono::{Days, NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::MAX_QUERY_WINDOW_DAYS;
use crate::model::*;

/// One row of `INSERT INTO schedules`; the provider comes from the session.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleRow {
    pub day_of_week: u8,
    pub enabled: bool,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub hourly_rate: Money,
}

impl RuleRow {
    pub fn into_rule(self, provider_id: ActorId) -> WeeklyScheduleRule {
        WeeklyScheduleRule {
            provider_id,
            day_of_week: self.day_of_week,
            enabled: self.enabled,
            start: self.start,
            end: self.end,
            hourly_rate: self.hourly_rate,
        }
    }
}

/// Filters accepted by slot listings. `until` is exclusive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlotFilter {
    pub provider_id: Option<Ulid>,
    pub from: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
}

impl SlotFilter {
    /// Date window implied by the filter; an open side extends to the widest
    /// window a query may scan.
    pub fn window(&self) -> Option<DateWindow> {
        let span = Days::new(MAX_QUERY_WINDOW_DAYS as u64);
        match (self.from, self.until) {
            (None, None) => None,
            (Some(from), Some(until)) => Some(DateWindow::new(from, until)),
            (Some(from), None) => Some(DateWindow::new(from, from.checked_add_days(span).unwrap_or(from))),
            (None, Some(until)) => Some(DateWindow::new(until.checked_sub_days(span).unwrap_or(until), until)),
        }
    }
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    PublishSchedule {
        rules: Vec<RuleRow>,
    },
    InsertSlot {
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        hourly_rate: Money,
    },
    DeleteSlot {
        id: Ulid,
    },
    InsertBooking {
        slot_id: Ulid,
        start: Option<NaiveTime>,
        end: Option<NaiveTime>,
        duration_minutes: Option<i64>,
    },
    DeleteBooking {
        id: Ulid,
    },
    InsertReschedule {
        booking_id: Ulid,
        slot_id: Ulid,
        start: NaiveTime,
        end: NaiveTime,
    },
    SelectSlots {
        filter: SlotFilter,
    },
    SelectBookableSlots {
        filter: SlotFilter,
    },
    SelectBookings {
        slot_id: Option<Ulid>,
    },
    SelectFreeRanges {
        slot_id: Ulid,
    },
    SelectSchedule {
        provider_id: Option<Ulid>,
    },
    SelectProviders,
}

/// Shape of the rows a statement returns, known before values are bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    Slots,
    Bookings,
    FreeRanges,
    Schedule,
    Providers,
    /// Single `id` column naming the created row.
    Id,
    None,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let stmt = parse_statement(sql)?;
    match &stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Result shape for the extended protocol's describe step. Works on
/// statements that still contain `$n` placeholders.
pub fn describe(sql: &str) -> ResultShape {
    let Ok(stmt) = parse_statement(sql) else {
        return ResultShape::None;
    };
    match &stmt {
        Statement::Insert(insert) => match insert_table_name(insert).as_deref() {
            Ok("slots") | Ok("bookings") | Ok("reschedules") => ResultShape::Id,
            _ => ResultShape::None,
        },
        Statement::Query(query) => {
            let SetExpr::Select(select) = query.body.as_ref() else {
                return ResultShape::None;
            };
            let Some(from) = select.from.first() else {
                return ResultShape::None;
            };
            match table_factor_name(&from.relation).as_deref() {
                Ok("slots") | Ok("bookable_slots") => ResultShape::Slots,
                Ok("bookings") => ResultShape::Bookings,
                Ok("free_ranges") => ResultShape::FreeRanges,
                Ok("schedules") => ResultShape::Schedule,
                Ok("providers") => ResultShape::Providers,
                _ => ResultShape::None,
            }
        }
        _ => ResultShape::None,
    }
}

fn parse_statement(sql: &str) -> Result<Statement, SqlError> {
    let dialect = PostgreSqlDialect {};
    let mut stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    Ok(stmts.swap_remove(0))
}

// ── INSERT ────────────────────────────────────────────────────

/// A VALUES row addressed by column name. Without an explicit column list the
/// table's default order applies.
struct Row<'a> {
    table: &'static str,
    columns: &'a [String],
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn new(table: &'static str, columns: &'a [String], values: &'a [Expr]) -> Self {
        Self { table, columns, values }
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.values.get(idx).filter(|e| !is_null(e))
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(self.table, column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let (table, defaults): (&'static str, &[&str]) = match table.as_str() {
        "schedules" => ("schedules", &["day_of_week", "enabled", "start", "end", "hourly_rate"]),
        "slots" => ("slots", &["date", "start", "end", "hourly_rate"]),
        "bookings" => ("bookings", &["slot_id", "start", "end", "duration"]),
        "reschedules" => ("reschedules", &["booking_id", "slot_id", "start", "end"]),
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    let rows = extract_all_insert_rows(insert)?;
    if table != "schedules" && rows.len() != 1 {
        return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}")));
    }
    let row = |values| Row::new(table, &columns, values);

    match table {
        "schedules" => {
            let mut rules = Vec::with_capacity(rows.len());
            for (i, values) in rows.iter().enumerate() {
                let r = row(values);
                let rule = parse_rule_row(&r).map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?;
                rules.push(rule);
            }
            Ok(Command::PublishSchedule { rules })
        }
        "slots" => {
            let r = row(&rows[0]);
            Ok(Command::InsertSlot {
                date: parse_date(r.require("date")?)?,
                start: parse_time(r.require("start")?)?,
                end: parse_time(r.require("end")?)?,
                hourly_rate: r.get("hourly_rate").map(parse_money).transpose()?.unwrap_or_default(),
            })
        }
        "bookings" => {
            let r = row(&rows[0]);
            Ok(Command::InsertBooking {
                slot_id: parse_ulid_expr(r.require("slot_id")?)?,
                start: r.get("start").map(parse_time).transpose()?,
                end: r.get("end").map(parse_time).transpose()?,
                duration_minutes: r.get("duration").map(parse_i64_expr).transpose()?,
            })
        }
        _ => {
            let r = row(&rows[0]);
            Ok(Command::InsertReschedule {
                booking_id: parse_ulid_expr(r.require("booking_id")?)?,
                slot_id: parse_ulid_expr(r.require("slot_id")?)?,
                start: parse_time(r.require("start")?)?,
                end: parse_time(r.require("end")?)?,
            })
        }
    }
}

fn parse_rule_row(r: &Row<'_>) -> Result<RuleRow, SqlError> {
    let dow = parse_i64_expr(r.require("day_of_week")?)?;
    Ok(RuleRow {
        day_of_week: u8::try_from(dow).map_err(|_| SqlError::Parse(format!("day_of_week {dow} out of range")))?,
        enabled: r.get("enabled").map(parse_bool).transpose()?.unwrap_or(true),
        start: parse_time(r.require("start")?)?,
        end: parse_time(r.require("end")?)?,
        hourly_rate: r.get("hourly_rate").map(parse_money).transpose()?.unwrap_or_default(),
    })
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "slots" => Ok(Command::DeleteSlot { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut predicates = Vec::new();
    if let Some(selection) = &select.selection {
        collect_predicates(selection, &mut predicates)?;
    }

    match table.as_str() {
        "slots" => Ok(Command::SelectSlots {
            filter: slot_filter(&predicates)?,
        }),
        "bookable_slots" => Ok(Command::SelectBookableSlots {
            filter: slot_filter(&predicates)?,
        }),
        "bookings" => Ok(Command::SelectBookings {
            slot_id: eq_ulid(&predicates, "slot_id")?,
        }),
        "free_ranges" => Ok(Command::SelectFreeRanges {
            slot_id: eq_ulid(&predicates, "slot_id")?.ok_or(SqlError::MissingFilter("slot_id"))?,
        }),
        "schedules" => Ok(Command::SelectSchedule {
            provider_id: eq_ulid(&predicates, "provider_id")?,
        }),
        "providers" => Ok(Command::SelectProviders),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

type Predicate<'a> = (String, BinaryOperator, &'a Expr);

/// Flatten an AND-chain of `column <op> value` comparisons.
fn collect_predicates<'a>(expr: &'a Expr, out: &mut Vec<Predicate<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_predicates(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_predicates(left, out)?;
            collect_predicates(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("predicate {expr}")))?;
            out.push((col, op.clone(), right.as_ref()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("predicate {other}"))),
    }
}

fn eq_ulid(predicates: &[Predicate<'_>], column: &str) -> Result<Option<Ulid>, SqlError> {
    predicates
        .iter()
        .find(|(c, op, _)| c == column && *op == BinaryOperator::Eq)
        .map(|(_, _, v)| parse_ulid_expr(v))
        .transpose()
}

fn slot_filter(predicates: &[Predicate<'_>]) -> Result<SlotFilter, SqlError> {
    let mut filter = SlotFilter {
        provider_id: eq_ulid(predicates, "provider_id")?,
        ..SlotFilter::default()
    };
    for (col, op, value) in predicates {
        if col != "date" {
            continue;
        }
        let date = parse_date(value)?;
        let next = date.succ_opt().unwrap_or(date);
        match op {
            BinaryOperator::Eq => {
                filter.from = Some(date);
                filter.until = Some(next);
            }
            BinaryOperator::GtEq => filter.from = Some(date),
            BinaryOperator::Gt => filter.from = Some(next),
            BinaryOperator::Lt => filter.until = Some(date),
            BinaryOperator::LtEq => filter.until = Some(next),
            other => return Err(SqlError::Unsupported(format!("date {other}"))),
        }
    }
    Ok(filter)
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

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
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

/// String or bare number literal as text.
fn extract_text(expr: &Expr) -> Result<&str, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.as_str()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = extract_text(expr)?;
    Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64_expr(expr)?);
    }
    let s = extract_text(expr)?;
    s.trim().parse().map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = extract_text(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

/// `HH:MM` or `HH:MM:SS`.
fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = extract_text(expr)?.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|e| SqlError::Parse(format!("bad time {s:?}: {e}")))
}

fn parse_money(expr: &Expr) -> Result<Money, SqlError> {
    let s = extract_text(expr)?;
    Money::parse(s).map_err(|e| SqlError::Parse(e.to_string()))
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
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing value for {c}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
