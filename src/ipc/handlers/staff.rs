use crate::ipc::error::ok;
use crate::ipc::helpers::{
    bad_params, db_conn, forbidden, get_optional_str, get_required_str, not_found, query_failed,
    require_session, row_exists, update_failed, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::session::{self, Role};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

fn staff_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.username, s.name, s.role, s.department_id, d.name
             FROM staff s
             LEFT JOIN departments d ON d.id = s.department_id
             ORDER BY s.username",
        )
        .map_err(query_failed)?;
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let username: String = row.get(1)?;
            let name: String = row.get(2)?;
            let role: String = row.get(3)?;
            let department_id: Option<String> = row.get(4)?;
            let department_name: Option<String> = row.get(5)?;
            Ok(json!({
                "id": id,
                "username": username,
                "name": name,
                "role": role,
                "departmentId": department_id,
                "departmentName": department_name
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;
    Ok(json!({ "staff": rows }))
}

fn staff_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let username = get_required_str(params, "username")?.trim().to_string();
    let password = get_required_str(params, "password")?;
    let name = get_required_str(params, "name")?.trim().to_string();
    let role_raw = get_required_str(params, "role")?;
    let department_id = get_optional_str(params, "departmentId")?;

    if username.is_empty() || name.is_empty() {
        return Err(bad_params("username and name must not be empty"));
    }
    if password.len() < 4 {
        return Err(bad_params("password must be at least 4 characters"));
    }
    let role = Role::parse(&role_raw)
        .ok_or_else(|| bad_params("role must be one of: admin, dean, teacher, viewer"))?;
    if let Some(dep) = &department_id {
        if !row_exists(conn, "SELECT 1 FROM departments WHERE id = ?", [dep])? {
            return Err(not_found("department not found"));
        }
    }
    if row_exists(conn, "SELECT 1 FROM staff WHERE username = ?", [&username])? {
        return Err(bad_params("username already taken"));
    }

    let staff_id = Uuid::new_v4().to_string();
    let digest = session::password_digest(&staff_id, &password);
    conn.execute(
        "INSERT INTO staff(id, username, pass_digest, name, role, department_id)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &staff_id,
            &username,
            &digest,
            &name,
            role.as_str(),
            &department_id,
        ),
    )
    .map_err(|e| update_failed(e, "staff"))?;
    Ok(json!({ "staffId": staff_id, "username": username }))
}

fn staff_delete(
    conn: &Connection,
    acting_staff_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let staff_id = get_required_str(params, "staffId")?;
    if staff_id == acting_staff_id {
        return Err(bad_params("cannot delete the logged-in account"));
    }
    if !row_exists(conn, "SELECT 1 FROM staff WHERE id = ?", [&staff_id])? {
        return Err(not_found("staff not found"));
    }
    conn.execute("DELETE FROM staff WHERE id = ?", [&staff_id])
        .map_err(|e| update_failed(e, "staff"))?;
    Ok(json!({ "deleted": true }))
}

fn dispatch(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let session = require_session(state)?;
    match req.method.as_str() {
        "staff.list" => staff_list(conn),
        "staff.create" => {
            if !session.role.can_manage_staff() {
                return Err(forbidden("manage staff accounts"));
            }
            staff_create(conn, &req.params)
        }
        "staff.delete" => {
            if !session.role.can_manage_staff() {
                return Err(forbidden("manage staff accounts"));
            }
            staff_delete(conn, &session.staff_id, &req.params)
        }
        other => Err(HandlerErr::new(
            "not_implemented",
            format!("unknown method: {}", other),
        )),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "staff.list" | "staff.create" | "staff.delete" => Some(match dispatch(state, req) {
            Ok(result) => ok(&req.id, result),
            Err(error) => error.response(&req.id),
        }),
        _ => None,
    }
}
