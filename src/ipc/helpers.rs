use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::ipc::error::err;
use crate::ipc::types::AppState;
use crate::session::StaffSession;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        HandlerErr {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn bad_params(message: impl Into<String>) -> HandlerErr {
    HandlerErr::new("bad_params", message)
}

pub fn not_found(message: impl Into<String>) -> HandlerErr {
    HandlerErr::new("not_found", message)
}

pub fn query_failed(e: impl ToString) -> HandlerErr {
    HandlerErr::new("db_query_failed", e.to_string())
}

pub fn update_failed(e: impl ToString, table: &str) -> HandlerErr {
    HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": table })),
    }
}

pub fn tx_failed(e: impl ToString) -> HandlerErr {
    HandlerErr::new("db_tx_failed", e.to_string())
}

pub fn commit_failed(e: impl ToString) -> HandlerErr {
    HandlerErr::new("db_commit_failed", e.to_string())
}

pub fn db_conn<'a>(state: &'a AppState) -> Result<&'a Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn require_session<'a>(state: &'a AppState) -> Result<&'a StaffSession, HandlerErr> {
    state
        .session
        .as_ref()
        .ok_or_else(|| HandlerErr::new("not_logged_in", "log in first"))
}

pub fn forbidden(action: &str) -> HandlerErr {
    HandlerErr {
        code: "forbidden",
        message: format!("role not permitted to {}", action),
        details: None,
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| bad_params(format!("missing {}", key)))
}

pub fn get_optional_str(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| bad_params(format!("{} must be a string", key))),
    }
}

pub fn parse_date(raw: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| bad_params("date must be YYYY-MM-DD"))
}

pub fn row_exists(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<bool, HandlerErr> {
    conn.query_row(sql, params, |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
        .map_err(query_failed)
}
