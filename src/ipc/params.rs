use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde::de::{Deserialize, DeserializeOwned, Deserializer};
use serde_json::json;

use crate::attendance;
use crate::config::SchoolConfig;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::types::{AppState, Request};

/// What a data handler gets to work with once a workspace is open.
pub struct Ctx<'a> {
    pub conn: &'a Connection,
    pub config: &'a SchoolConfig,
}

/// Runs `f` against the open workspace and shapes the response envelope.
pub fn respond<F>(state: &AppState, req: &Request, f: F) -> serde_json::Value
where
    F: FnOnce(&Ctx<'_>, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
{
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let ctx = Ctx {
        conn,
        config: &state.config,
    };
    match f(&ctx, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => {
            tracing::warn!(
                id = %req.id,
                method = %req.method,
                code = error.code,
                "request failed: {}",
                error.message
            );
            error.response(&req.id)
        }
    }
}

pub fn parse<T: DeserializeOwned>(params: &serde_json::Value) -> Result<T, HandlerErr> {
    let value = if params.is_null() {
        json!({})
    } else {
        params.clone()
    };
    serde_json::from_value(value).map_err(|e| HandlerErr::bad_params(e.to_string()))
}

pub fn required_text(field: &str, value: &str) -> Result<String, HandlerErr> {
    let t = value.trim();
    if t.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", field)));
    }
    Ok(t.to_string())
}

/// Trims and maps blank strings to `None`.
pub fn optional_text(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn date_param(field: &str, value: &str) -> Result<NaiveDate, HandlerErr> {
    attendance::parse_date(value)
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", field)))
}

pub fn optional_date_param(field: &str, value: Option<&str>) -> Result<Option<NaiveDate>, HandlerErr> {
    match value {
        Some(v) if !v.trim().is_empty() => date_param(field, v).map(Some),
        _ => Ok(None),
    }
}

pub fn row_exists(conn: &Connection, table: &'static str, id: &str) -> Result<bool, HandlerErr> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    Ok(conn
        .query_row(&sql, [id], |r| r.get::<_, i64>(0))
        .optional()?
        .is_some())
}

pub fn ensure_exists(
    conn: &Connection,
    table: &'static str,
    what: &str,
    id: &str,
) -> Result<(), HandlerErr> {
    if row_exists(conn, table, id)? {
        Ok(())
    } else {
        Err(HandlerErr::not_found(what))
    }
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Patch field where an absent key leaves the value alone and `null` clears it.
/// Use with `#[serde(default, deserialize_with = "params::nullable")]`.
pub fn nullable<'de, D, T>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}
