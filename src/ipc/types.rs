use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::config::SchoolConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub config: SchoolConfig,
}

impl AppState {
    pub fn new(config: SchoolConfig) -> Self {
        Self {
            workspace: None,
            db: None,
            config,
        }
    }
}
