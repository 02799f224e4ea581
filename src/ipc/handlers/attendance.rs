use crate::ipc::error::ok;
use crate::ipc::helpers::{
    bad_params, commit_failed, db_conn, forbidden, get_optional_str, get_required_str, not_found,
    parse_date, query_failed, require_session, row_exists, tx_failed, update_failed, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::session::StaffSession;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub fn is_working_day(conn: &Connection, date: &str) -> Result<bool, HandlerErr> {
    // Dates default to holiday; only an explicit opt-in makes a working day.
    let working: Option<i64> = conn
        .query_row(
            "SELECT working FROM working_days WHERE date = ?",
            [date],
            |r| r.get(0),
        )
        .optional()
        .map_err(query_failed)?;
    Ok(working == Some(1))
}

fn working_days_set(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let date_raw = get_required_str(params, "date")?;
    let date = parse_date(&date_raw)?;
    let working = params
        .get("working")
        .and_then(|v| v.as_bool())
        .ok_or_else(|| bad_params("missing working"))?;
    let description = get_optional_str(params, "description")?;

    let key = date.format("%Y-%m-%d").to_string();
    conn.execute(
        "INSERT INTO working_days(date, working, description)
         VALUES(?, ?, ?)
         ON CONFLICT(date) DO UPDATE SET
           working = excluded.working,
           description = excluded.description",
        (&key, working as i64, &description),
    )
    .map_err(|e| update_failed(e, "working_days"))?;
    Ok(json!({ "date": key, "working": working }))
}

fn working_days_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let from = parse_date(&get_required_str(params, "from")?)?
        .format("%Y-%m-%d")
        .to_string();
    let to = parse_date(&get_required_str(params, "to")?)?
        .format("%Y-%m-%d")
        .to_string();
    if from > to {
        return Err(bad_params("from must not be after to"));
    }
    let mut stmt = conn
        .prepare(
            "SELECT date, working, description
             FROM working_days
             WHERE date >= ? AND date <= ?
             ORDER BY date",
        )
        .map_err(query_failed)?;
    let rows = stmt
        .query_map((&from, &to), |r| {
            let date: String = r.get(0)?;
            let working: i64 = r.get(1)?;
            let description: Option<String> = r.get(2)?;
            Ok(json!({
                "date": date,
                "working": working != 0,
                "description": description
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;
    Ok(json!({ "days": rows }))
}

/// Replace a class's absentee rows for one working day. Absence-only:
/// students not listed have no row and count as present.
fn attendance_mark(
    conn: &Connection,
    session: &StaffSession,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let date = parse_date(&get_required_str(params, "date")?)?
        .format("%Y-%m-%d")
        .to_string();
    let Some(absentees_json) = params.get("absentees").and_then(|v| v.as_array()) else {
        return Err(bad_params("missing absentees"));
    };
    let absentees: Vec<String> = absentees_json
        .iter()
        .map(|v| {
            v.as_str()
                .map(|s| s.to_string())
                .ok_or_else(|| bad_params("absentees must be student ids"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let submit = params
        .get("submit")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    if !row_exists(conn, "SELECT 1 FROM classes WHERE id = ?", [&class_id])? {
        return Err(not_found("class not found"));
    }
    if !is_working_day(conn, &date)? {
        return Err(HandlerErr::new(
            "not_working_day",
            format!("{} is not marked as a working day", date),
        ));
    }
    for student_id in &absentees {
        if !row_exists(
            conn,
            "SELECT 1 FROM students WHERE class_id = ? AND id = ?",
            (&class_id, student_id),
        )? {
            return Err(HandlerErr {
                code: "bad_params",
                message: "absentee is not a student of this class".to_string(),
                details: Some(json!({ "studentId": student_id })),
            });
        }
    }

    let tx = conn.unchecked_transaction().map_err(tx_failed)?;
    tx.execute(
        "DELETE FROM attendance_records WHERE class_id = ? AND date = ?",
        (&class_id, &date),
    )
    .map_err(|e| update_failed(e, "attendance_records"))?;
    for student_id in &absentees {
        let record_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO attendance_records(id, class_id, student_id, date, recorded_by)
             VALUES(?, ?, ?, ?, ?)",
            (&record_id, &class_id, student_id, &date, &session.name),
        )
        .map_err(|e| update_failed(e, "attendance_records"))?;
    }
    if submit {
        let submitted_at = chrono::Utc::now().to_rfc3339();
        tx.execute(
            "INSERT INTO attendance_submissions(class_id, date, submitted_by, submitted_at)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(class_id, date) DO UPDATE SET
               submitted_by = excluded.submitted_by,
               submitted_at = excluded.submitted_at",
            (&class_id, &date, &session.name, &submitted_at),
        )
        .map_err(|e| update_failed(e, "attendance_submissions"))?;
    }
    tx.commit().map_err(commit_failed)?;

    Ok(json!({
        "classId": class_id,
        "date": date,
        "absentCount": absentees.len(),
        "submitted": submit
    }))
}

fn attendance_open(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let date = parse_date(&get_required_str(params, "date")?)?
        .format("%Y-%m-%d")
        .to_string();
    if !row_exists(conn, "SELECT 1 FROM classes WHERE id = ?", [&class_id])? {
        return Err(not_found("class not found"));
    }
    let working = is_working_day(conn, &date)?;

    let mut stmt = conn
        .prepare(
            "SELECT student_id FROM attendance_records
             WHERE class_id = ? AND date = ?
             ORDER BY student_id",
        )
        .map_err(query_failed)?;
    let absentees: Vec<String> = stmt
        .query_map((&class_id, &date), |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    let submission: Option<(String, String)> = conn
        .query_row(
            "SELECT submitted_by, submitted_at FROM attendance_submissions
             WHERE class_id = ? AND date = ?",
            (&class_id, &date),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(query_failed)?;

    Ok(json!({
        "classId": class_id,
        "date": date,
        "working": working,
        "absentees": absentees,
        "submission": submission.map(|(by, at)| json!({
            "submittedBy": by,
            "submittedAt": at
        }))
    }))
}

fn dispatch(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let session = require_session(state)?;
    match req.method.as_str() {
        "workingDays.set" => {
            if !session.role.can_edit_fees() {
                // Calendar management sits with admins and deans.
                return Err(forbidden("manage the working-day calendar"));
            }
            working_days_set(conn, &req.params)
        }
        "workingDays.list" => working_days_list(conn, &req.params),
        "attendance.mark" => {
            if !session.role.can_mark_attendance() {
                return Err(forbidden("mark attendance"));
            }
            attendance_mark(conn, session, &req.params)
        }
        "attendance.open" => attendance_open(conn, &req.params),
        other => Err(HandlerErr::new(
            "not_implemented",
            format!("unknown method: {}", other),
        )),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "workingDays.set" | "workingDays.list" | "attendance.mark" | "attendance.open" => {
            Some(match dispatch(state, req) {
                Ok(result) => ok(&req.id, result),
                Err(error) => error.response(&req.id),
            })
        }
        _ => None,
    }
}
