use crate::backup;
use crate::ipc::error::ok;
use crate::ipc::helpers::{forbidden, get_required_str, require_session, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn bundle_export(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let session = require_session(state)?;
    if !session.role.can_manage_staff() {
        return Err(forbidden("export workspace bundles"));
    }
    let workspace = state
        .workspace
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
    let out_path = PathBuf::from(get_required_str(params, "outPath")?);

    match backup::export_workspace_bundle(workspace, &out_path) {
        Ok(summary) => Ok(json!({
            "outPath": out_path.to_string_lossy(),
            "bundleFormat": summary.bundle_format,
            "dbSha256": summary.db_sha256
        })),
        Err(e) => Err(HandlerErr::new("export_failed", format!("{e:?}"))),
    }
}

fn bundle_import(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let session = require_session(state)?;
    if !session.role.can_manage_staff() {
        return Err(forbidden("import workspace bundles"));
    }
    let workspace = state
        .workspace
        .as_ref()
        .cloned()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
    let in_path = PathBuf::from(get_required_str(params, "inPath")?);

    // Close the live connection before the file swap, then reopen.
    state.db = None;
    let summary = backup::import_workspace_bundle(&in_path, &workspace)
        .map_err(|e| HandlerErr::new("import_failed", format!("{e:?}")))?;
    match crate::db::open_db(&workspace) {
        Ok(conn) => {
            state.db = Some(conn);
            // Accounts may differ in the imported database.
            state.session = None;
            Ok(json!({
                "bundleFormatDetected": summary.bundle_format_detected
            }))
        }
        Err(e) => Err(HandlerErr::new("db_open_failed", format!("{e:?}"))),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "bundle.export" => Some(match bundle_export(state, &req.params) {
            Ok(result) => ok(&req.id, result),
            Err(error) => error.response(&req.id),
        }),
        "bundle.import" => Some(match bundle_import(state, &req.params) {
            Ok(result) => ok(&req.id, result),
            Err(error) => error.response(&req.id),
        }),
        _ => None,
    }
}
