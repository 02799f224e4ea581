use crate::ipc::error::ok;
use crate::ipc::helpers::{
    bad_params, db_conn, forbidden, get_optional_str, get_required_str, not_found, query_failed,
    require_session, row_exists, update_failed, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::session::Role;
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

fn departments_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT
               d.id,
               d.name,
               (SELECT COUNT(*) FROM classes c WHERE c.department_id = d.id) AS class_count
             FROM departments d
             ORDER BY d.name",
        )
        .map_err(query_failed)?;
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let class_count: i64 = row.get(2)?;
            Ok(json!({
                "id": id,
                "name": name,
                "classCount": class_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;
    Ok(json!({ "departments": rows }))
}

fn departments_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(bad_params("name must not be empty"));
    }
    let department_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO departments(id, name) VALUES(?, ?)",
        (&department_id, &name),
    )
    .map_err(|e| update_failed(e, "departments"))?;
    Ok(json!({ "departmentId": department_id, "name": name }))
}

fn classes_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let department_id = get_optional_str(params, "departmentId")?;
    let sql = "SELECT
                 c.id,
                 c.department_id,
                 c.name,
                 (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count
               FROM classes c
               WHERE (?1 IS NULL OR c.department_id = ?1)
               ORDER BY c.name";
    let mut stmt = conn.prepare(sql).map_err(query_failed)?;
    let rows = stmt
        .query_map([&department_id], |row| {
            let id: String = row.get(0)?;
            let dep: String = row.get(1)?;
            let name: String = row.get(2)?;
            let student_count: i64 = row.get(3)?;
            Ok(json!({
                "id": id,
                "departmentId": dep,
                "name": name,
                "studentCount": student_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;
    Ok(json!({ "classes": rows }))
}

fn classes_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let department_id = get_required_str(params, "departmentId")?;
    let name = get_required_str(params, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(bad_params("name must not be empty"));
    }
    if !row_exists(
        conn,
        "SELECT 1 FROM departments WHERE id = ?",
        [&department_id],
    )? {
        return Err(not_found("department not found"));
    }
    let class_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classes(id, department_id, name) VALUES(?, ?, ?)",
        (&class_id, &department_id, &name),
    )
    .map_err(|e| update_failed(e, "classes"))?;
    Ok(json!({ "classId": class_id, "name": name }))
}

fn students_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    if !row_exists(conn, "SELECT 1 FROM classes WHERE id = ?", [&class_id])? {
        return Err(not_found("class not found"));
    }
    let mut stmt = conn
        .prepare(
            "SELECT id, name, register_no, active
             FROM students
             WHERE class_id = ?
             ORDER BY name",
        )
        .map_err(query_failed)?;
    let rows = stmt
        .query_map([&class_id], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let register_no: Option<String> = row.get(2)?;
            let active: i64 = row.get(3)?;
            Ok(json!({
                "id": id,
                "name": name,
                "registerNo": register_no,
                "active": active != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;
    Ok(json!({ "students": rows }))
}

fn students_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let name = get_required_str(params, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(bad_params("name must not be empty"));
    }
    let register_no = get_optional_str(params, "registerNo")?;
    if !row_exists(conn, "SELECT 1 FROM classes WHERE id = ?", [&class_id])? {
        return Err(not_found("class not found"));
    }
    let student_id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO students(id, class_id, name, register_no, active, updated_at)
         VALUES(?, ?, ?, ?, 1, ?)",
        (&student_id, &class_id, &name, &register_no, &now),
    )
    .map_err(|e| update_failed(e, "students"))?;
    Ok(json!({ "studentId": student_id, "name": name }))
}

fn students_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    if !row_exists(conn, "SELECT 1 FROM students WHERE id = ?", [&student_id])? {
        return Err(not_found("student not found"));
    }
    let name = get_optional_str(params, "name")?;
    let register_no = get_optional_str(params, "registerNo")?;
    let active = match params.get("active") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => Some(
            v.as_bool()
                .ok_or_else(|| bad_params("active must be a boolean"))?,
        ),
    };
    if let Some(name) = &name {
        let t = name.trim();
        if t.is_empty() {
            return Err(bad_params("name must not be empty"));
        }
        conn.execute(
            "UPDATE students SET name = ? WHERE id = ?",
            (t, &student_id),
        )
        .map_err(|e| update_failed(e, "students"))?;
    }
    if let Some(register_no) = &register_no {
        conn.execute(
            "UPDATE students SET register_no = ? WHERE id = ?",
            (register_no, &student_id),
        )
        .map_err(|e| update_failed(e, "students"))?;
    }
    if let Some(active) = active {
        conn.execute(
            "UPDATE students SET active = ? WHERE id = ?",
            (active as i64, &student_id),
        )
        .map_err(|e| update_failed(e, "students"))?;
    }
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE students SET updated_at = ? WHERE id = ?",
        (&now, &student_id),
    )
    .map_err(|e| update_failed(e, "students"))?;
    Ok(json!({ "studentId": student_id }))
}

fn students_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    if !row_exists(conn, "SELECT 1 FROM students WHERE id = ?", [&student_id])? {
        return Err(not_found("student not found"));
    }
    // A student with ledger or attendance history is deactivated, never
    // hard-deleted; the audit trail must keep resolving.
    let referenced = row_exists(
        conn,
        "SELECT 1 FROM fees WHERE student_id = ?",
        [&student_id],
    )? || row_exists(
        conn,
        "SELECT 1 FROM attendance_records WHERE student_id = ?",
        [&student_id],
    )?;
    if referenced {
        return Err(HandlerErr::new(
            "in_use",
            "student has fee or attendance history; deactivate instead",
        ));
    }
    conn.execute("DELETE FROM students WHERE id = ?", [&student_id])
        .map_err(|e| update_failed(e, "students"))?;
    Ok(json!({ "deleted": true }))
}

fn guarded(
    state: &AppState,
    mutating: bool,
    f: impl FnOnce(&Connection) -> Result<serde_json::Value, HandlerErr>,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let session = require_session(state)?;
    if mutating && session.role != Role::Admin {
        return Err(forbidden("manage the roster"));
    }
    f(conn)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "departments.list" => guarded(state, false, departments_list),
        "departments.create" => guarded(state, true, |c| departments_create(c, &req.params)),
        "classes.list" => guarded(state, false, |c| classes_list(c, &req.params)),
        "classes.create" => guarded(state, true, |c| classes_create(c, &req.params)),
        "students.list" => guarded(state, false, |c| students_list(c, &req.params)),
        "students.create" => guarded(state, true, |c| students_create(c, &req.params)),
        "students.update" => guarded(state, true, |c| students_update(c, &req.params)),
        "students.delete" => guarded(state, true, |c| students_delete(c, &req.params)),
        _ => return None,
    };
    Some(match result {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    })
}
