use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime, Timelike};
use rust_decimal::Decimal;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertField {
        id: Ulid,
        name: Option<String>,
        price_per_hour: Decimal,
        working_hours: Option<String>,
    },
    DeleteField {
        id: Ulid,
    },
    InsertBooking {
        id: Ulid,
        field_id: Ulid,
        user_id: Ulid,
        date: NaiveDate,
        start: TimeOfDay,
        end: TimeOfDay,
    },
    /// Cancels; the row stays visible with status CANCELLED.
    DeleteBooking {
        id: Ulid,
    },
    SelectFields,
    SelectFieldBookings {
        field_id: Ulid,
        date: NaiveDate,
    },
    SelectUserBookings {
        user_id: Ulid,
    },
    SelectAvailability {
        field_id: Ulid,
        date: NaiveDate,
    },
    SelectAdmissibility {
        field_id: Ulid,
        date: NaiveDate,
        start: TimeOfDay,
        end: TimeOfDay,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "fields" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("fields", 3, values.len()));
            }
            let working_hours = match values.get(3) {
                Some(expr) => parse_string_or_null(expr)?,
                None => None,
            };
            Ok(Command::InsertField {
                id: parse_ulid(&values[0])?,
                name: parse_string_or_null(&values[1])?,
                price_per_hour: parse_decimal(&values[2])?,
                working_hours,
            })
        }
        "bookings" => {
            if values.len() < 6 {
                return Err(SqlError::WrongArity("bookings", 6, values.len()));
            }
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                field_id: parse_ulid(&values[1])?,
                user_id: parse_ulid(&values[2])?,
                date: parse_date(&values[3])?,
                start: parse_time(&values[4])?,
                end: parse_time(&values[5])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "fields" => Ok(Command::DeleteField { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Equality filters collected from a `WHERE a = x AND b = y ...` clause.
#[derive(Default)]
struct Filters<'a> {
    pairs: Vec<(String, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn collect(expr: &'a Expr, out: &mut Self) -> Result<(), SqlError> {
        match expr {
            Expr::BinaryOp { left, op, right } => match op {
                ast::BinaryOperator::And => {
                    Self::collect(left, out)?;
                    Self::collect(right, out)
                }
                ast::BinaryOperator::Eq => {
                    let col = expr_column_name(left)
                        .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
                    out.pairs.push((col, right.as_ref()));
                    Ok(())
                }
                other => Err(SqlError::Unsupported(format!("operator {other} in WHERE"))),
            },
            Expr::Nested(inner) => Self::collect(inner, out),
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    fn get(&self, col: &str) -> Option<&'a Expr> {
        self.pairs.iter().find(|(c, _)| c == col).map(|(_, e)| *e)
    }

    fn require(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingFilter(col))
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

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        Filters::collect(selection, &mut filters)?;
    }

    match table.as_str() {
        "fields" => Ok(Command::SelectFields),
        "bookings" => {
            if let Some(user) = filters.get("user_id") {
                return Ok(Command::SelectUserBookings {
                    user_id: parse_ulid(user)?,
                });
            }
            Ok(Command::SelectFieldBookings {
                field_id: parse_ulid(filters.require("field_id")?)?,
                date: parse_date(filters.require("date")?)?,
            })
        }
        "availability" => Ok(Command::SelectAvailability {
            field_id: parse_ulid(filters.require("field_id")?)?,
            date: parse_date(filters.require("date")?)?,
        }),
        "admissibility" => Ok(Command::SelectAdmissibility {
            field_id: parse_ulid(filters.require("field_id")?)?,
            date: parse_date(filters.require("date")?)?,
            start: parse_time(filters.require("start_time")?)?,
            end: parse_time(filters.require("end_time")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Table a SELECT reads from, without interpreting its filters.
///
/// Used to describe a prepared statement before its `$n` parameters are bound.
pub fn select_table(sql: &str) -> Option<String> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    let Statement::Query(query) = stmts.first()? else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    table_factor_name(&select.from.first()?.relation).ok()
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

/// First VALUES row. Multi-row inserts are refused so a partial batch can't be admitted.
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

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
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

/// Literal text of a quoted string or bare number.
fn literal_text(expr: &Expr) -> Result<&str, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s),
        Some(value) => Err(SqlError::Parse(format!("expected literal, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = literal_text(expr)?;
    Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string or NULL, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_decimal(expr: &Expr) -> Result<Decimal, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_decimal(expr)?);
    }
    let s = literal_text(expr)?;
    Decimal::from_str(s.trim()).map_err(|e| SqlError::Parse(format!("bad decimal {s:?}: {e}")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = literal_text(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?} (expected YYYY-MM-DD): {e}")))
}

/// `HH:MM`, or `HH:MM:SS` with zero seconds as sent by Postgres drivers.
fn parse_time(expr: &Expr) -> Result<TimeOfDay, SqlError> {
    let s = literal_text(expr)?;
    if let Ok(t) = TimeOfDay::from_str(s) {
        return Ok(t);
    }
    match NaiveTime::parse_from_str(s.trim(), "%H:%M:%S") {
        Ok(t) if t.second() == 0 => Ok(TimeOfDay::from_naive(t)),
        _ => Err(SqlError::Parse(format!("bad time {s:?} (expected HH:MM)"))),
    }
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

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const FIELD: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";
    const USER: &str = "01BX5ZZKBKACTAV9WEVGEMMVS0";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    #[test]
    fn parse_insert_field() {
        let sql = format!(
            r#"INSERT INTO fields (id, name, price_per_hour, working_hours) VALUES ('{ID}', 'Pitch 1', 45.50, '{{"monday": {{"open": "09:00", "close": "22:00"}}}}')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertField { id, name, price_per_hour, working_hours } => {
                assert_eq!(id, ulid(ID));
                assert_eq!(name.as_deref(), Some("Pitch 1"));
                assert_eq!(price_per_hour, Decimal::new(4550, 2));
                assert!(working_hours.unwrap().contains("monday"));
            }
            cmd => panic!("expected InsertField, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_field_nulls_and_quoted_price() {
        let sql = format!("INSERT INTO fields (id, name, price_per_hour) VALUES ('{ID}', NULL, '50')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertField {
                id: ulid(ID),
                name: None,
                price_per_hour: Decimal::from(50),
                working_hours: None,
            }
        );
    }

    #[test]
    fn parse_insert_field_too_few_values() {
        let sql = format!("INSERT INTO fields (id, name) VALUES ('{ID}', 'x')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::WrongArity("fields", 3, 2))));
    }

    #[test]
    fn parse_insert_booking() {
        let sql = format!(
            "INSERT INTO bookings (id, field_id, user_id, date, start_time, end_time) VALUES ('{ID}', '{FIELD}', '{USER}', '2026-10-20', '18:00', '20:00')"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertBooking {
                id: ulid(ID),
                field_id: ulid(FIELD),
                user_id: ulid(USER),
                date: NaiveDate::from_ymd_opt(2026, 10, 20).unwrap(),
                start: TimeOfDay::from_hm(18, 0).unwrap(),
                end: TimeOfDay::from_hm(20, 0).unwrap(),
            }
        );
    }

    #[test]
    fn parse_time_with_seconds() {
        let sql = format!(
            "INSERT INTO bookings (id, field_id, user_id, date, start_time, end_time) VALUES ('{ID}', '{FIELD}', '{USER}', '2026-10-20', '18:00:00', '19:30:00')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBooking { start, end, .. } => {
                assert_eq!(start.to_string(), "18:00");
                assert_eq!(end.to_string(), "19:30");
            }
            cmd => panic!("expected InsertBooking, got {cmd:?}"),
        }

        let bad = sql.replace("19:30:00", "19:30:15");
        assert!(matches!(parse_sql(&bad), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_booking_bad_date() {
        let sql = format!(
            "INSERT INTO bookings (id, field_id, user_id, date, start_time, end_time) VALUES ('{ID}', '{FIELD}', '{USER}', '20/10/2026', '18:00', '20:00')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn multi_row_insert_refused() {
        let row = format!("('{ID}', '{FIELD}', '{USER}', '2026-10-20', '18:00', '20:00')");
        let sql = format!(
            "INSERT INTO bookings (id, field_id, user_id, date, start_time, end_time) VALUES {row}, {row}"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_deletes() {
        let cmd = parse_sql(&format!("DELETE FROM fields WHERE id = '{ID}'")).unwrap();
        assert_eq!(cmd, Command::DeleteField { id: ulid(ID) });
        let cmd = parse_sql(&format!("DELETE FROM bookings WHERE id = '{ID}'")).unwrap();
        assert_eq!(cmd, Command::DeleteBooking { id: ulid(ID) });
        assert!(matches!(
            parse_sql("DELETE FROM bookings"),
            Err(SqlError::MissingFilter("id"))
        ));
    }

    #[test]
    fn parse_selects() {
        assert_eq!(parse_sql("SELECT * FROM fields").unwrap(), Command::SelectFields);

        let date = NaiveDate::from_ymd_opt(2026, 10, 20).unwrap();
        let cmd = parse_sql(&format!(
            "SELECT * FROM bookings WHERE field_id = '{FIELD}' AND date = '2026-10-20'"
        ))
        .unwrap();
        assert_eq!(cmd, Command::SelectFieldBookings { field_id: ulid(FIELD), date });

        let cmd = parse_sql(&format!("SELECT * FROM bookings WHERE user_id = '{USER}'")).unwrap();
        assert_eq!(cmd, Command::SelectUserBookings { user_id: ulid(USER) });

        let cmd = parse_sql(&format!(
            "SELECT * FROM availability WHERE date = '2026-10-20' AND field_id = '{FIELD}'"
        ))
        .unwrap();
        assert_eq!(cmd, Command::SelectAvailability { field_id: ulid(FIELD), date });
    }

    #[test]
    fn parse_select_admissibility() {
        let sql = format!(
            "SELECT * FROM admissibility WHERE field_id = '{FIELD}' AND date = '2026-10-20' AND start_time = '18:00' AND end_time = '20:00'"
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectAdmissibility { start, end, .. } => {
                assert_eq!(start.to_string(), "18:00");
                assert_eq!(end.to_string(), "20:00");
            }
            cmd => panic!("expected SelectAdmissibility, got {cmd:?}"),
        }
    }

    #[test]
    fn select_missing_filter() {
        let sql = format!("SELECT * FROM availability WHERE field_id = '{FIELD}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("date"))));
        assert!(matches!(
            parse_sql("SELECT * FROM bookings"),
            Err(SqlError::MissingFilter("field_id"))
        ));
    }

    #[test]
    fn range_filters_are_unsupported() {
        let sql = format!("SELECT * FROM bookings WHERE field_id = '{FIELD}' AND date >= '2026-10-20'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_bad_ulid() {
        let sql = "DELETE FROM bookings WHERE id = 'not-a-ulid'";
        assert!(matches!(parse_sql(sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn select_table_ignores_placeholders() {
        assert_eq!(
            select_table("SELECT * FROM availability WHERE field_id = $1 AND date = $2").as_deref(),
            Some("availability")
        );
        assert_eq!(select_table("SELECT * FROM Fields").as_deref(), Some("fields"));
        assert_eq!(select_table("DELETE FROM bookings WHERE id = $1"), None);
        assert_eq!(select_table("not sql"), None);
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
