use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::session::{Role, StaffSession};
use rusqlite::OptionalExtension;
use serde_json::json;
use std::path::PathBuf;

fn session_json(session: Option<&StaffSession>) -> serde_json::Value {
    match session {
        Some(s) => json!({
            "staffId": s.staff_id,
            "name": s.name,
            "role": s.role.as_str(),
            "departmentId": s.department_id,
        }),
        None => serde_json::Value::Null,
    }
}

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "session": session_json(state.session.as_ref()),
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match db::open_db(&path) {
        Ok(conn) => {
            state.workspace = Some(path.clone());
            state.db = Some(conn);
            // A session belongs to one workspace's staff table.
            state.session = None;
            ok(&req.id, json!({ "workspacePath": path.to_string_lossy() }))
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

fn login(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let username = get_required_str(params, "username")?;
    let password = get_required_str(params, "password")?;
    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;

    let row: Option<(String, String, String, String, Option<String>)> = conn
        .query_row(
            "SELECT id, pass_digest, name, role, department_id
             FROM staff
             WHERE username = ?",
            [username.trim()],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    let Some((staff_id, pass_digest, name, role_raw, department_id)) = row else {
        return Err(HandlerErr::new("auth_failed", "invalid username or password"));
    };
    if crate::session::password_digest(&staff_id, &password) != pass_digest {
        return Err(HandlerErr::new("auth_failed", "invalid username or password"));
    }
    let role = Role::parse(&role_raw)
        .ok_or_else(|| HandlerErr::new("db_query_failed", format!("unknown role: {}", role_raw)))?;

    let session = StaffSession {
        staff_id,
        name,
        role,
        department_id,
    };
    let payload = session_json(Some(&session));
    state.session = Some(session);
    Ok(json!({ "session": payload }))
}

fn handle_auth_login(state: &mut AppState, req: &Request) -> serde_json::Value {
    let params = req.params.clone();
    match login(state, &params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_auth_logout(state: &mut AppState, req: &Request) -> serde_json::Value {
    state.session = None;
    ok(&req.id, json!({ "loggedOut": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "auth.login" => Some(handle_auth_login(state, req)),
        "auth.logout" => Some(handle_auth_logout(state, req)),
        _ => None,
    }
}
