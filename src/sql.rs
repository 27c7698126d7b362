use chrono::{NaiveDate, Weekday};
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::engine::EventUpdate;
use crate::limits::MINUTES_PER_DAY;
use crate::model::*;

/// One console command.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// Toggle slots on; one per VALUES row.
    InsertSlots {
        slots: Vec<(WorkerId, SlotAnchor, Min)>,
    },
    DeleteSlot {
        id: SlotId,
    },
    DeleteWorker {
        id: WorkerId,
    },
    InsertEvent {
        draft: NewEvent,
    },
    Reschedule {
        event_id: EventId,
        update: EventUpdate,
    },
    DeleteEvent {
        id: EventId,
    },
    SelectAvailability {
        worker_id: WorkerId,
        date: NaiveDate,
        from: Min,
        to: Min,
    },
    /// Dry-run booking check.
    SelectReserve {
        worker_id: WorkerId,
        date: NaiveDate,
        from: Min,
        to: Min,
    },
    SelectSchedule {
        event_id: EventId,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(first) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match first {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;

    match table.as_str() {
        "slots" => {
            let slots = rows
                .iter()
                .map(|values| parse_slot_row(values))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Command::InsertSlots { slots })
        }
        "events" => {
            let values = single_row(&rows, "events")?;
            if values.len() < 6 {
                return Err(SqlError::WrongArity("events", 6, values.len()));
            }
            Ok(Command::InsertEvent {
                draft: NewEvent {
                    worker_id: parse_u64(&values[0])?,
                    patient_id: parse_u64(&values[1])?,
                    date: parse_date(&values[2])?,
                    span: Span::new(parse_time(&values[3])?, parse_time(&values[4])?),
                    title: parse_string(&values[5])?,
                    location: values.get(6).map(parse_string_or_null).transpose()?.flatten(),
                },
            })
        }
        "reschedules" => {
            let values = single_row(&rows, "reschedules")?;
            let Some(event_id) = values.first() else {
                return Err(SqlError::WrongArity("reschedules", 1, 0));
            };
            let column = |i: usize| values.get(i);
            Ok(Command::Reschedule {
                event_id: parse_u64(event_id)?,
                update: EventUpdate {
                    date: nullable(column(1), parse_date)?,
                    from: nullable(column(2), parse_time)?,
                    to: nullable(column(3), parse_time)?,
                    title: nullable(column(4), parse_string)?,
                    location: nullable(column(5), parse_location)?,
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `(worker_id, day, on_date, from_time)`; `day` may be NULL when `on_date`
/// is given and must agree with it otherwise.
fn parse_slot_row(values: &[Expr]) -> Result<(WorkerId, SlotAnchor, Min), SqlError> {
    if values.len() < 4 {
        return Err(SqlError::WrongArity("slots", 4, values.len()));
    }
    let worker_id = parse_u64(&values[0])?;
    let day = nullable(Some(&values[1]), parse_weekday)?;
    let date = nullable(Some(&values[2]), parse_date)?;
    let from = parse_time(&values[3])?;

    let anchor = match (day, date) {
        (_, Some(date)) => {
            let anchor = SlotAnchor::On(date);
            if let Some(day) = day
                && day != anchor.day()
            {
                return Err(SqlError::Parse(format!("{date} is not a {day}")));
            }
            anchor
        }
        (Some(day), None) => SlotAnchor::Weekly(day),
        (None, None) => return Err(SqlError::Parse("slot needs a day or an on_date".into())),
    };
    Ok((worker_id, anchor, from))
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "slots" => Ok(Command::DeleteSlot { id }),
        "workers" => Ok(Command::DeleteWorker { id }),
        "events" => Ok(Command::DeleteEvent { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from_table) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from_table.relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        filters.collect(selection)?;
    }

    match table.as_str() {
        "availability" => Ok(Command::SelectAvailability {
            worker_id: filters.worker_id.ok_or(SqlError::MissingFilter("worker_id"))?,
            date: filters.date.ok_or(SqlError::MissingFilter("on_date"))?,
            from: filters.from.unwrap_or(0),
            to: filters.to.unwrap_or(MINUTES_PER_DAY),
        }),
        "reserve" => Ok(Command::SelectReserve {
            worker_id: filters.worker_id.ok_or(SqlError::MissingFilter("worker_id"))?,
            date: filters.date.ok_or(SqlError::MissingFilter("on_date"))?,
            from: filters.from.ok_or(SqlError::MissingFilter("from_time"))?,
            to: filters.to.ok_or(SqlError::MissingFilter("to_time"))?,
        }),
        "schedule" => Ok(Command::SelectSchedule {
            event_id: filters.event_id.ok_or(SqlError::MissingFilter("event_id"))?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// WHERE-clause conjuncts understood by the SELECT tables.
#[derive(Default)]
struct Filters {
    worker_id: Option<WorkerId>,
    event_id: Option<EventId>,
    date: Option<NaiveDate>,
    from: Option<Min>,
    to: Option<Min>,
}

impl Filters {
    fn collect(&mut self, expr: &Expr) -> Result<(), SqlError> {
        let Expr::BinaryOp { left, op, right } = expr else {
            return Ok(());
        };
        let col = expr_column_name(left);
        match (op, col.as_deref()) {
            (ast::BinaryOperator::And, _) => {
                self.collect(left)?;
                self.collect(right)?;
            }
            (ast::BinaryOperator::Eq, Some("worker_id")) => self.worker_id = Some(parse_u64(right)?),
            (ast::BinaryOperator::Eq, Some("event_id")) => self.event_id = Some(parse_u64(right)?),
            (ast::BinaryOperator::Eq, Some("on_date")) => self.date = Some(parse_date(right)?),
            (ast::BinaryOperator::GtEq, Some("from_time")) => self.from = Some(parse_time(right)?),
            (ast::BinaryOperator::LtEq, Some("to_time")) => self.to = Some(parse_time(right)?),
            _ => {}
        }
        Ok(())
    }
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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
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

fn single_row<'a>(rows: &'a [Vec<Expr>], table: &'static str) -> Result<&'a [Expr], SqlError> {
    match rows {
        [row] => Ok(row),
        _ => Err(SqlError::Unsupported(format!("multi-row INSERT into {table}"))),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<u64, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_u64(right),
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

/// `None` for a missing column or NULL, otherwise `parse`.
/// Reschedule location: `''` clears it.
fn parse_location(expr: &Expr) -> Result<Option<String>, SqlError> {
    let location = parse_string(expr)?;
    Ok((!location.is_empty()).then_some(location))
}

fn nullable<T>(
    expr: Option<&Expr>,
    parse: impl Fn(&Expr) -> Result<T, SqlError>,
) -> Result<Option<T>, SqlError> {
    match expr {
        None => Ok(None),
        Some(e) if matches!(extract_value(e), Some(Value::Null)) => Ok(None),
        Some(e) => parse(e).map(Some),
    }
}

fn parse_u64(expr: &Expr) -> Result<u64, SqlError> {
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad id {s}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    nullable(Some(expr), parse_string)
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))
}

fn parse_time(expr: &Expr) -> Result<Min, SqlError> {
    let s = parse_string(expr)?;
    parse_hhmm(&s).ok_or_else(|| SqlError::Parse(format!("bad time {s}, expected HH:MM")))
}

fn parse_weekday(expr: &Expr) -> Result<Weekday, SqlError> {
    let s = parse_string(expr)?;
    s.parse()
        .map_err(|_| SqlError::Parse(format!("bad day {s}, expected mon..sun")))
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
            SqlError::Empty => write!(f, "empty command"),
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
