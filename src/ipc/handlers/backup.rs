use crate::backup;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::handlers::core::open_workspace;
use crate::ipc::params;
use crate::ipc::types::{AppState, Request};
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportParams {
    workspace_path: Option<PathBuf>,
    out_path: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImportParams {
    workspace_path: Option<PathBuf>,
    in_path: String,
}

fn target_workspace(state: &AppState, given: Option<PathBuf>) -> Result<PathBuf, HandlerErr> {
    given
        .filter(|p| !p.as_os_str().is_empty())
        .or_else(|| state.workspace.clone())
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(x), Ok(y)) => x == y,
        _ => a == b,
    }
}

fn export_bundle(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let p: ExportParams = params::parse(&req.params)?;
    let out_path = params::required_text("outPath", &p.out_path)?;
    let workspace_path = target_workspace(state, p.workspace_path)?;

    let export = backup::export_workspace_bundle(&workspace_path, Path::new(&out_path))
        .map_err(|e| {
            HandlerErr::new("backup_failed", format!("{e:#}"))
                .with_details(json!({ "path": out_path }))
        })?;

    tracing::info!(workspace = %workspace_path.display(), out = %out_path, "workspace exported");
    Ok(json!({
        "ok": true,
        "path": out_path,
        "bundleFormat": export.bundle_format,
        "entryCount": export.entry_count,
        "dbSha256": export.db_sha256,
    }))
}

fn import_bundle(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let p: ImportParams = params::parse(&req.params)?;
    let in_path = PathBuf::from(params::required_text("inPath", &p.in_path)?);
    let workspace_path = target_workspace(state, p.workspace_path)?;
    if !in_path.is_file() {
        return Err(HandlerErr::not_found("bundle file")
            .with_details(json!({ "path": in_path.to_string_lossy() })));
    }

    let is_current = state
        .workspace
        .as_deref()
        .is_some_and(|cur| same_path(cur, &workspace_path));
    if is_current {
        // The open handle must go before its file is replaced.
        state.db = None;
    }

    let imported = backup::import_workspace_bundle(&in_path, &workspace_path);
    let reopened = if is_current {
        open_workspace(state, &workspace_path)
            .map_err(|e| HandlerErr::new("db_open_failed", format!("{e:#}")))
    } else {
        Ok(())
    };
    let import = imported.map_err(|e| {
        HandlerErr::new("backup_failed", format!("{e:#}"))
            .with_details(json!({ "path": in_path.to_string_lossy() }))
    })?;
    reopened?;

    tracing::info!(
        workspace = %workspace_path.display(),
        format = %import.bundle_format_detected,
        "workspace imported"
    );
    Ok(json!({
        "ok": true,
        "workspacePath": workspace_path.to_string_lossy(),
        "bundleFormatDetected": import.bundle_format_detected,
        "reopened": is_current,
    }))
}

fn reply(
    state: &mut AppState,
    req: &Request,
    f: fn(&mut AppState, &Request) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    match f(state, req) {
        Ok(v) => ok(&req.id, v),
        Err(e) => {
            tracing::warn!(method = %req.method, code = e.code, "{}", e.message);
            e.response(&req.id)
        }
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(reply(state, req, export_bundle)),
        "backup.importWorkspaceBundle" => Some(reply(state, req, import_bundle)),
        _ => None,
    }
}
