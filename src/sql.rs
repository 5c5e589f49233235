use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input. The acting user is implied by the session.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertReservation(ReservationRequest),
    DeleteReservation {
        date: NaiveDate,
    },
    SelectReservations {
        date: Option<NaiveDate>,
    },
    SelectUpcoming,
    SelectSlots {
        floor: String,
        date: NaiveDate,
    },
    SelectFloorCounts {
        date: NaiveDate,
    },
    InsertSlotStatus {
        floor: String,
        slot: SlotNo,
        date: NaiveDate,
        expected: SlotStatus,
        new: SlotStatus,
    },
    InsertUser(ProfileFields),
    SelectUser,
    InsertVehicle {
        brand: String,
        model: String,
        plate: String,
    },
    DeleteVehicle {
        id: Ulid,
    },
    SelectVehicles,
    SelectDocuments,
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

/// Strip the keyword and any quoting from a LISTEN/UNLISTEN target.
/// Channel names are case-sensitive (user ids are).
fn channel_arg(rest: &str) -> String {
    rest.trim()
        .trim_end_matches(';')
        .trim()
        .trim_matches('"')
        .to_string()
}

fn strip_keyword<'a>(sql: &'a str, keyword: &str) -> Option<&'a str> {
    let head = sql.get(..keyword.len())?;
    let rest = &sql[keyword.len()..];
    (head.eq_ignore_ascii_case(keyword) && rest.starts_with(char::is_whitespace)).then_some(rest)
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if let Some(rest) = strip_keyword(trimmed, "LISTEN") {
        let channel = channel_arg(rest);
        if channel.is_empty() {
            return Err(SqlError::Parse("LISTEN without channel".into()));
        }
        return Ok(Command::Listen { channel });
    }
    if let Some(rest) = strip_keyword(trimmed, "UNLISTEN") {
        let channel = channel_arg(rest);
        return match channel.as_str() {
            "*" => Ok(Command::UnlistenAll),
            "" => Err(SqlError::Parse("UNLISTEN without channel".into())),
            _ => Ok(Command::Unlisten { channel }),
        };
    }

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
        "reservations" => {
            expect_arity("reservations", 6, &values)?;
            Ok(Command::InsertReservation(ReservationRequest {
                floor: parse_text(&values[0])?,
                slot: parse_slot(&values[1])?,
                date: parse_date_expr(&values[2])?,
                start: parse_time_expr(&values[3])?,
                end: parse_time_expr(&values[4])?,
                plate: parse_text(&values[5])?,
            }))
        }
        "slot_status" => {
            expect_arity("slot_status", 5, &values)?;
            Ok(Command::InsertSlotStatus {
                floor: parse_text(&values[0])?,
                slot: parse_slot(&values[1])?,
                date: parse_date_expr(&values[2])?,
                expected: parse_status(&values[3])?,
                new: parse_status(&values[4])?,
            })
        }
        "users" => parse_insert_user(insert, &values),
        "vehicles" => {
            expect_arity("vehicles", 3, &values)?;
            Ok(Command::InsertVehicle {
                brand: parse_text(&values[0])?,
                model: parse_text(&values[1])?,
                plate: parse_text(&values[2])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `INSERT INTO users [(cols)] VALUES (...)`. Without a column list the
/// order is `username, email, phone[, notifications]`. NULL leaves a field
/// untouched.
fn parse_insert_user(insert: &ast::Insert, values: &[Expr]) -> Result<Command, SqlError> {
    const DEFAULT_COLUMNS: [&str; 4] = ["username", "email", "phone", "notifications"];

    let columns: Vec<String> = if insert.columns.is_empty() {
        DEFAULT_COLUMNS.iter().take(values.len()).map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if columns.len() != values.len() {
        return Err(SqlError::WrongArity("users", columns.len(), values.len()));
    }

    let mut fields = ProfileFields::default();
    for (column, expr) in columns.iter().zip(values) {
        if is_null(expr) {
            continue;
        }
        match column.as_str() {
            "username" => fields.username = Some(parse_text(expr)?),
            "email" => fields.email = Some(parse_text(expr)?),
            "phone" => fields.phone = Some(parse_text(expr)?),
            "notifications" => fields.notifications = Some(parse_bool(expr)?),
            other => return Err(SqlError::UnknownColumn(other.to_string())),
        }
    }
    Ok(Command::InsertUser(fields))
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = where_filters(delete.selection.as_ref())?;

    match table.as_str() {
        "reservations" => Ok(Command::DeleteReservation {
            date: parse_date_expr(required(&filters, "date")?)?,
        }),
        "vehicles" => Ok(Command::DeleteVehicle {
            id: parse_ulid_expr(required(&filters, "id")?)?,
        }),
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
    let filters = where_filters(select.selection.as_ref())?;

    match table.as_str() {
        "reservations" => Ok(Command::SelectReservations {
            date: optional(&filters, "date").map(parse_date_expr).transpose()?,
        }),
        "upcoming" => Ok(Command::SelectUpcoming),
        "slots" => Ok(Command::SelectSlots {
            floor: parse_text(required(&filters, "floor")?)?,
            date: parse_date_expr(required(&filters, "date")?)?,
        }),
        "floor_counts" => Ok(Command::SelectFloorCounts {
            date: parse_date_expr(required(&filters, "date")?)?,
        }),
        "users" => Ok(Command::SelectUser),
        "vehicles" => Ok(Command::SelectVehicles),
        "documents" => Ok(Command::SelectDocuments),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Helpers ───────────────────────────────────────────────────

/// `col = value` pairs from a WHERE clause made of equalities joined by AND.
fn where_filters(selection: Option<&Expr>) -> Result<Vec<(String, &Expr)>, SqlError> {
    fn walk<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => walk(inner, out),
            Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
                walk(left, out)?;
                walk(right, out)
            }
            Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.push((col, &**right));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    let mut out = Vec::new();
    if let Some(expr) = selection {
        walk(expr, &mut out)?;
    }
    Ok(out)
}

fn optional<'a>(filters: &[(String, &'a Expr)], col: &str) -> Option<&'a Expr> {
    filters.iter().find(|(c, _)| c == col).map(|(_, e)| *e)
}

fn required<'a>(filters: &[(String, &'a Expr)], col: &'static str) -> Result<&'a Expr, SqlError> {
    optional(filters, col).ok_or(SqlError::MissingFilter(col))
}

fn expect_arity(table: &'static str, expected: usize, values: &[Expr]) -> Result<(), SqlError> {
    if values.len() != expected {
        return Err(SqlError::WrongArity(table, expected, values.len()));
    }
    Ok(())
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

/// The single VALUES row of an INSERT.
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

/// A string literal, or a bare number taken as its text.
fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_text(expr)?;
    parse_date(&s).ok_or_else(|| SqlError::Parse(format!("bad date (want yyyy-MM-dd): {s}")))
}

fn parse_time_expr(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_text(expr)?;
    parse_time(&s).ok_or_else(|| SqlError::Parse(format!("bad time (want HH:mm): {s}")))
}

fn parse_slot(expr: &Expr) -> Result<SlotNo, SqlError> {
    parse_text(expr)?.parse().map_err(SqlError::Parse)
}

fn parse_status(expr: &Expr) -> Result<SlotStatus, SqlError> {
    parse_text(expr)?.parse().map_err(SqlError::Parse)
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
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
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
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

    fn d(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    #[test]
    fn parse_insert_reservation() {
        let sql = "INSERT INTO reservations VALUES ('floor1', 'slot3', '2024-06-01', '09:00', '10:00', 'ABC123')";
        match parse_sql(sql).unwrap() {
            Command::InsertReservation(req) => {
                assert_eq!(req.floor, "floor1");
                assert_eq!(req.slot, SlotNo(3));
                assert_eq!(req.date, d("2024-06-01"));
                assert_eq!(format_time(req.start), "09:00");
                assert_eq!(format_time(req.end), "10:00");
                assert_eq!(req.plate, "ABC123");
            }
            cmd => panic!("expected InsertReservation, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_reservation_numeric_slot() {
        let sql = "INSERT INTO reservations (floor, slot_id, date, start_time, end_time, plate) VALUES ('floor2', 7, '2024-06-01', '13:30', '15:00', 'XYZ789')";
        match parse_sql(sql).unwrap() {
            Command::InsertReservation(req) => assert_eq!(req.slot, SlotNo(7)),
            cmd => panic!("expected InsertReservation, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_reservation_bad_values() {
        let bad_date = "INSERT INTO reservations VALUES ('floor1', 'slot3', '06/01/2024', '09:00', '10:00', 'ABC123')";
        assert!(matches!(parse_sql(bad_date), Err(SqlError::Parse(_))));
        let bad_time = "INSERT INTO reservations VALUES ('floor1', 'slot3', '2024-06-01', '9am', '10:00', 'ABC123')";
        assert!(matches!(parse_sql(bad_time), Err(SqlError::Parse(_))));
        let short = "INSERT INTO reservations VALUES ('floor1', 'slot3', '2024-06-01')";
        assert!(matches!(parse_sql(short), Err(SqlError::WrongArity("reservations", 6, 3))));
    }

    #[test]
    fn parse_delete_reservation() {
        let cmd = parse_sql("DELETE FROM reservations WHERE date = '2024-06-01'").unwrap();
        assert_eq!(cmd, Command::DeleteReservation { date: d("2024-06-01") });
        assert!(matches!(
            parse_sql("DELETE FROM reservations"),
            Err(SqlError::MissingFilter("date"))
        ));
    }

    #[test]
    fn parse_select_reservations() {
        assert_eq!(
            parse_sql("SELECT * FROM reservations").unwrap(),
            Command::SelectReservations { date: None }
        );
        assert_eq!(
            parse_sql("SELECT * FROM reservations WHERE date = '2024-06-01'").unwrap(),
            Command::SelectReservations { date: Some(d("2024-06-01")) }
        );
        assert_eq!(parse_sql("SELECT * FROM upcoming").unwrap(), Command::SelectUpcoming);
    }

    #[test]
    fn parse_select_slots() {
        let cmd = parse_sql("SELECT * FROM slots WHERE floor = 'floor1' AND date = '2024-06-01'").unwrap();
        assert_eq!(
            cmd,
            Command::SelectSlots {
                floor: "floor1".into(),
                date: d("2024-06-01")
            }
        );
        assert!(matches!(
            parse_sql("SELECT * FROM slots WHERE floor = 'floor1'"),
            Err(SqlError::MissingFilter("date"))
        ));
        assert!(matches!(
            parse_sql("SELECT * FROM slots WHERE floor = 'floor1' OR date = '2024-06-01'"),
            Err(SqlError::Unsupported(_))
        ));
    }

    #[test]
    fn parse_select_floor_counts() {
        let cmd = parse_sql("SELECT * FROM floor_counts WHERE date = '2024-06-01'").unwrap();
        assert_eq!(cmd, Command::SelectFloorCounts { date: d("2024-06-01") });
    }

    #[test]
    fn parse_slot_status_cas() {
        let sql = "INSERT INTO slot_status VALUES ('floor1', 'slot7', '2024-06-01', 'available', 'occupied')";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::InsertSlotStatus {
                floor: "floor1".into(),
                slot: SlotNo(7),
                date: d("2024-06-01"),
                expected: SlotStatus::Available,
                new: SlotStatus::Reserved,
            }
        );
        let bad = "INSERT INTO slot_status VALUES ('floor1', 'slot7', '2024-06-01', 'available', 'broken')";
        assert!(parse_sql(bad).is_err());
    }

    #[test]
    fn parse_insert_user_positional() {
        let sql = "INSERT INTO users VALUES ('ana', 'ana@example.com', '09171234567')";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::InsertUser(ProfileFields {
                username: Some("ana".into()),
                email: Some("ana@example.com".into()),
                phone: Some("09171234567".into()),
                notifications: None,
            })
        );
    }

    #[test]
    fn parse_insert_user_named_columns() {
        let sql = "INSERT INTO users (notifications, username) VALUES (false, 'ana2')";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::InsertUser(ProfileFields {
                username: Some("ana2".into()),
                notifications: Some(false),
                ..Default::default()
            })
        );

        let with_null = "INSERT INTO users (username, phone) VALUES ('ana', NULL)";
        match parse_sql(with_null).unwrap() {
            Command::InsertUser(fields) => assert!(fields.phone.is_none()),
            cmd => panic!("expected InsertUser, got {cmd:?}"),
        }

        let unknown = "INSERT INTO users (password) VALUES ('hunter2')";
        assert!(matches!(parse_sql(unknown), Err(SqlError::UnknownColumn(_))));
        let mismatch = "INSERT INTO users (username, email) VALUES ('ana')";
        assert!(parse_sql(mismatch).is_err());
    }

    #[test]
    fn parse_vehicles() {
        assert_eq!(
            parse_sql("INSERT INTO vehicles VALUES ('Toyota', 'Vios', 'ABC123')").unwrap(),
            Command::InsertVehicle {
                brand: "Toyota".into(),
                model: "Vios".into(),
                plate: "ABC123".into(),
            }
        );
        let cmd = parse_sql("DELETE FROM vehicles WHERE id = '01ARZ3NDEKTSV4RRFFQ69G5FAV'").unwrap();
        match cmd {
            Command::DeleteVehicle { id } => assert_eq!(id.to_string(), "01ARZ3NDEKTSV4RRFFQ69G5FAV"),
            cmd => panic!("expected DeleteVehicle, got {cmd:?}"),
        }
        assert_eq!(parse_sql("SELECT * FROM vehicles").unwrap(), Command::SelectVehicles);
    }

    #[test]
    fn parse_user_and_documents() {
        assert_eq!(parse_sql("SELECT * FROM users").unwrap(), Command::SelectUser);
        assert_eq!(parse_sql("select * from documents;").unwrap(), Command::SelectDocuments);
    }

    #[test]
    fn parse_listen_and_unlisten() {
        assert_eq!(
            parse_sql("LISTEN slots_floor1").unwrap(),
            Command::Listen { channel: "slots_floor1".into() }
        );
        assert_eq!(
            parse_sql("listen \"user_AbC123\";").unwrap(),
            Command::Listen { channel: "user_AbC123".into() }
        );
        assert_eq!(
            parse_sql("UNLISTEN slots_floor1").unwrap(),
            Command::Unlisten { channel: "slots_floor1".into() }
        );
        assert_eq!(parse_sql("UNLISTEN *").unwrap(), Command::UnlistenAll);
        assert!(parse_sql("LISTEN ").is_err());
    }

    #[test]
    fn listen_prefix_needs_word_boundary() {
        // "LISTENER" is not a LISTEN statement
        assert!(parse_sql("LISTENER foo").is_err());
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = "INSERT INTO parking_lots VALUES ('x')";
        assert!(matches!(parse_sql(sql), Err(SqlError::UnknownTable(_))));
        assert!(matches!(parse_sql("SELECT * FROM bookings"), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn multi_row_insert_rejected() {
        let sql = "INSERT INTO vehicles VALUES ('Toyota', 'Vios', 'A1'), ('Honda', 'City', 'B2')";
        assert!(matches!(parse_sql(sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
