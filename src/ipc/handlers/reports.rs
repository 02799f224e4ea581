use crate::ipc::error::ok;
use crate::ipc::helpers::{
    bad_params, db_conn, get_optional_str, get_required_str, not_found, parse_date, query_failed,
    require_session, row_exists, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::ledger::{self, FeeCategory, LedgerTotals};
use rusqlite::Connection;
use serde_json::json;
use std::collections::{HashMap, HashSet};

use super::attendance::is_working_day;

fn csv_field(raw: &str) -> String {
    if raw.contains(',') || raw.contains('"') || raw.contains('\n') {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

fn date_range(params: &serde_json::Value) -> Result<(String, String), HandlerErr> {
    let from = parse_date(&get_required_str(params, "from")?)?
        .format("%Y-%m-%d")
        .to_string();
    let to = parse_date(&get_required_str(params, "to")?)?
        .format("%Y-%m-%d")
        .to_string();
    if from > to {
        return Err(bad_params("from must not be after to"));
    }
    Ok((from, to))
}

fn working_dates_in_range(
    conn: &Connection,
    from: &str,
    to: &str,
) -> Result<Vec<String>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT date FROM working_days
             WHERE working = 1 AND date >= ? AND date <= ?
             ORDER BY date",
        )
        .map_err(query_failed)?;
    stmt.query_map((from, to), |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)
}

#[derive(Debug, Clone)]
struct AbsenteeRow {
    student_id: String,
    student_name: String,
    register_no: Option<String>,
    class_id: String,
    class_name: String,
}

fn absentees_for_date(
    conn: &Connection,
    date: &str,
    class_id: Option<&str>,
    department_id: Option<&str>,
) -> Result<Vec<AbsenteeRow>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.name, s.register_no, c.id, c.name
             FROM attendance_records ar
             JOIN students s ON s.id = ar.student_id
             JOIN classes c ON c.id = ar.class_id
             WHERE ar.date = ?1
               AND (?2 IS NULL OR ar.class_id = ?2)
               AND (?3 IS NULL OR c.department_id = ?3)
             ORDER BY c.name, s.name",
        )
        .map_err(query_failed)?;
    stmt.query_map((date, class_id, department_id), |r| {
        Ok(AbsenteeRow {
            student_id: r.get(0)?,
            student_name: r.get(1)?,
            register_no: r.get(2)?,
            class_id: r.get(3)?,
            class_name: r.get(4)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(query_failed)
}

fn attendance_absentees(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let date = parse_date(&get_required_str(params, "date")?)?
        .format("%Y-%m-%d")
        .to_string();
    let class_id = get_optional_str(params, "classId")?;
    let department_id = get_optional_str(params, "departmentId")?;
    if !is_working_day(conn, &date)? {
        return Err(HandlerErr::new(
            "not_working_day",
            format!("{} is not marked as a working day", date),
        ));
    }
    let rows = absentees_for_date(conn, &date, class_id.as_deref(), department_id.as_deref())?;
    let absentees: Vec<serde_json::Value> = rows
        .iter()
        .map(|row| {
            json!({
                "studentId": row.student_id,
                "studentName": row.student_name,
                "registerNo": row.register_no,
                "classId": row.class_id,
                "className": row.class_name
            })
        })
        .collect();
    Ok(json!({ "date": date, "absentees": absentees }))
}

fn attendance_student_report(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let (from, to) = date_range(params)?;
    if !row_exists(conn, "SELECT 1 FROM students WHERE id = ?", [&student_id])? {
        return Err(not_found("student not found"));
    }

    let working = working_dates_in_range(conn, &from, &to)?;
    let working_set: HashSet<&str> = working.iter().map(|s| s.as_str()).collect();

    let mut stmt = conn
        .prepare(
            "SELECT date FROM attendance_records
             WHERE student_id = ? AND date >= ? AND date <= ?
             ORDER BY date",
        )
        .map_err(query_failed)?;
    let raw_absent: Vec<String> = stmt
        .query_map((&student_id, &from, &to), |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;
    // A date un-marked as working after the fact drops out of the report.
    let absent_dates: Vec<String> = raw_absent
        .into_iter()
        .filter(|d| working_set.contains(d.as_str()))
        .collect();

    let working_count = working.len();
    let absent_count = absent_dates.len();
    let absence_percent = if working_count > 0 {
        ledger::round_one_decimal(100.0 * absent_count as f64 / working_count as f64)
    } else {
        0.0
    };

    Ok(json!({
        "studentId": student_id,
        "from": from,
        "to": to,
        "workingDayCount": working_count,
        "absentCount": absent_count,
        "absencePercent": absence_percent,
        "absentDates": absent_dates
    }))
}

fn attendance_class_summary(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let (from, to) = date_range(params)?;
    if !row_exists(conn, "SELECT 1 FROM classes WHERE id = ?", [&class_id])? {
        return Err(not_found("class not found"));
    }

    let working = working_dates_in_range(conn, &from, &to)?;
    let working_set: HashSet<&str> = working.iter().map(|s| s.as_str()).collect();
    let working_count = working.len();

    let mut absent_by_student: HashMap<String, i64> = HashMap::new();
    let mut stmt = conn
        .prepare(
            "SELECT student_id, date FROM attendance_records
             WHERE class_id = ? AND date >= ? AND date <= ?",
        )
        .map_err(query_failed)?;
    let rows: Vec<(String, String)> = stmt
        .query_map((&class_id, &from, &to), |r| Ok((r.get(0)?, r.get(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;
    for (student_id, date) in rows {
        if working_set.contains(date.as_str()) {
            *absent_by_student.entry(student_id).or_insert(0) += 1;
        }
    }

    let mut stmt = conn
        .prepare(
            "SELECT id, name, register_no FROM students
             WHERE class_id = ?
             ORDER BY name",
        )
        .map_err(query_failed)?;
    let students: Vec<(String, String, Option<String>)> = stmt
        .query_map([&class_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    let rows_json: Vec<serde_json::Value> = students
        .into_iter()
        .map(|(id, name, register_no)| {
            let absent = absent_by_student.get(&id).copied().unwrap_or(0);
            let percent = if working_count > 0 {
                ledger::round_one_decimal(100.0 * absent as f64 / working_count as f64)
            } else {
                0.0
            };
            json!({
                "studentId": id,
                "studentName": name,
                "registerNo": register_no,
                "absentCount": absent,
                "absencePercent": percent
            })
        })
        .collect();

    Ok(json!({
        "classId": class_id,
        "from": from,
        "to": to,
        "workingDayCount": working_count,
        "rows": rows_json
    }))
}

fn fee_register_csv(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    if !row_exists(conn, "SELECT 1 FROM classes WHERE id = ?", [&class_id])? {
        return Err(not_found("class not found"));
    }

    let mut select_cols = vec![
        "s.name".to_string(),
        "s.register_no".to_string(),
    ];
    let mut header = vec!["Student".to_string(), "Register No".to_string()];
    for category in FeeCategory::ALL {
        let (total, paid, balance) = crate::db::fee_columns(category);
        for col in [total, paid, balance] {
            select_cols.push(format!("COALESCE(f.{}, 0)", col));
        }
        let label = category.label();
        header.push(format!("{} Total", label));
        header.push(format!("{} Paid", label));
        header.push(format!("{} Balance", label));
    }
    for col in ["total_amount", "total_paid", "total_balance"] {
        select_cols.push(format!("COALESCE(f.{}, 0)", col));
    }
    header.extend([
        "Total Amount".to_string(),
        "Total Paid".to_string(),
        "Total Balance".to_string(),
        "Status".to_string(),
    ]);

    let sql = format!(
        "SELECT {} FROM students s
         LEFT JOIN fees f ON f.student_id = s.id
         WHERE s.class_id = ?
         ORDER BY s.name",
        select_cols.join(", ")
    );
    let mut stmt = conn.prepare(&sql).map_err(query_failed)?;
    let rows: Vec<Vec<String>> = stmt
        .query_map([&class_id], |r| {
            let name: String = r.get(0)?;
            let register_no: Option<String> = r.get(1)?;
            let mut fields = vec![name, register_no.unwrap_or_default()];
            let mut idx = 2;
            for _ in 0..(FeeCategory::ALL.len() * 3 + 3) {
                let v: f64 = r.get(idx)?;
                fields.push(format!("{:.2}", v));
                idx += 1;
            }
            let totals = LedgerTotals {
                total_amount: r.get(idx - 3)?,
                total_paid: r.get(idx - 2)?,
                total_balance: r.get(idx - 1)?,
            };
            fields.push(ledger::classify(&totals).as_str().to_string());
            Ok(fields)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    let mut csv = header
        .iter()
        .map(|h| csv_field(h))
        .collect::<Vec<_>>()
        .join(",");
    csv.push('\n');
    for fields in rows {
        csv.push_str(
            &fields
                .iter()
                .map(|f| csv_field(f))
                .collect::<Vec<_>>()
                .join(","),
        );
        csv.push('\n');
    }
    Ok(json!({ "csv": csv }))
}

fn absentees_csv(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let date = parse_date(&get_required_str(params, "date")?)?
        .format("%Y-%m-%d")
        .to_string();
    let class_id = get_optional_str(params, "classId")?;
    if !is_working_day(conn, &date)? {
        return Err(HandlerErr::new(
            "not_working_day",
            format!("{} is not marked as a working day", date),
        ));
    }
    let rows = absentees_for_date(conn, &date, class_id.as_deref(), None)?;

    let mut csv = String::from("Date,Class,Student,Register No\n");
    for row in rows {
        csv.push_str(&format!(
            "{},{},{},{}\n",
            csv_field(&date),
            csv_field(&row.class_name),
            csv_field(&row.student_name),
            csv_field(row.register_no.as_deref().unwrap_or(""))
        ));
    }
    Ok(json!({ "date": date, "csv": csv }))
}

fn dispatch(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    require_session(state)?;
    match req.method.as_str() {
        "attendance.absentees" => attendance_absentees(conn, &req.params),
        "attendance.studentReport" => attendance_student_report(conn, &req.params),
        "attendance.classSummary" => attendance_class_summary(conn, &req.params),
        "reports.feeRegisterCsv" => fee_register_csv(conn, &req.params),
        "reports.absenteesCsv" => absentees_csv(conn, &req.params),
        other => Err(HandlerErr::new(
            "not_implemented",
            format!("unknown method: {}", other),
        )),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.absentees"
        | "attendance.studentReport"
        | "attendance.classSummary"
        | "reports.feeRegisterCsv"
        | "reports.absenteesCsv" => Some(match dispatch(state, req) {
            Ok(result) => ok(&req.id, result),
            Err(error) => error.response(&req.id),
        }),
        _ => None,
    }
}
