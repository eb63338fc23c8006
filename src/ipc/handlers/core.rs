use crate::db;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::params::{self, respond, Ctx};
use crate::ipc::types::{AppState, Request};
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
        }),
    )
}

/// Opens (creating if needed) the workspace database and makes it current.
pub fn open_workspace(state: &mut AppState, path: &Path) -> anyhow::Result<()> {
    let conn = db::open_db(path, state.config.db.busy_timeout_ms)?;
    db::settings_set_json(
        &conn,
        "workspace.lastOpenedAt",
        &json!(db::now_rfc3339()),
    )?;
    state.workspace = Some(path.to_path_buf());
    state.db = Some(conn);
    tracing::info!(workspace = %path.display(), "workspace opened");
    Ok(())
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

    match open_workspace(state, &path) {
        Ok(()) => ok(&req.id, json!({ "workspacePath": path.to_string_lossy() })),
        Err(e) => {
            tracing::warn!(workspace = %path.display(), "workspace open failed: {e:#}");
            err(&req.id, "db_open_failed", format!("{e:#}"), None)
        }
    }
}

#[derive(Deserialize)]
struct SettingsKeyParams {
    key: String,
}

#[derive(Deserialize)]
struct SettingsSetParams {
    key: String,
    value: serde_json::Value,
}

fn settings_get(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: SettingsKeyParams = params::parse(params)?;
    let key = params::required_text("key", &p.key)?;
    let value = db::settings_get_json(ctx.conn, &key)
        .map_err(|e| HandlerErr::new("db_query_failed", format!("{e:#}")))?;
    Ok(json!({ "key": key, "value": value }))
}

fn settings_set(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: SettingsSetParams = params::parse(params)?;
    let key = params::required_text("key", &p.key)?;
    db::settings_set_json(ctx.conn, &key, &p.value).map_err(|e| {
        HandlerErr::new("db_update_failed", format!("{e:#}"))
            .with_details(json!({ "table": "settings" }))
    })?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "settings.get" => Some(respond(state, req, settings_get)),
        "settings.set" => Some(respond(state, req, settings_set)),
        _ => None,
    }
}
