//! Layered daemon configuration.
//!
//! Sources, lowest to highest priority:
//! 1. built-in defaults
//! 2. `<config_dir>/schoold/config.toml`
//! 3. `./schoold.toml`
//! 4. `SCHOOLD_*` environment variables, `__` separating sections
//!    (`SCHOOLD_ATTENDANCE__FALLBACK_TO_PREVIOUS_DAY=false`)

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::attendance::AttendanceStatus;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Figment(#[from] Box<figment::Error>),

    #[error("invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

fn default_log() -> String {
    "warn".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchoolConfig {
    /// Workspace opened at start-up, if any.
    #[serde(default)]
    pub workspace: Option<PathBuf>,

    /// `tracing` filter directive, overridden by `SCHOOLD_LOG`.
    #[serde(default = "default_log")]
    pub log: String,

    #[serde(default)]
    pub attendance: AttendanceConfig,

    #[serde(default)]
    pub db: DbConfig,

    #[serde(default)]
    pub stats: StatsConfig,
}

impl Default for SchoolConfig {
    fn default() -> Self {
        Self {
            workspace: None,
            log: default_log(),
            attendance: AttendanceConfig::default(),
            db: DbConfig::default(),
            stats: StatsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AttendanceConfig {
    /// Show the previous day's marks when a day has none recorded.
    #[serde(default = "default_true")]
    pub fallback_to_previous_day: bool,

    #[serde(default)]
    pub default_status: AttendanceStatus,
}

impl Default for AttendanceConfig {
    fn default() -> Self {
        Self {
            fallback_to_previous_day: true,
            default_status: AttendanceStatus::Absent,
        }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_busy_timeout_ms() -> u64 {
    15_000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DbConfig {
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

const fn default_upcoming_days() -> u32 {
    7
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StatsConfig {
    #[serde(default = "default_upcoming_days")]
    pub upcoming_days: u32,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            upcoming_days: default_upcoming_days(),
        }
    }
}

impl SchoolConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let config: Self = Self::figment().extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn figment() -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(global_path) = dirs::config_dir().map(|p| p.join("schoold").join("config.toml"))
        {
            if global_path.exists() {
                figment = figment.merge(Toml::file(global_path));
            }
        }

        let local_path = PathBuf::from("schoold.toml");
        if local_path.exists() {
            figment = figment.merge(Toml::file(local_path));
        }

        figment.merge(Env::prefixed("SCHOOLD_").split("__"))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.stats.upcoming_days == 0 {
            return Err(ConfigError::InvalidValue {
                field: "stats.upcoming_days".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_are_correct() {
        let config = SchoolConfig::default();
        assert!(config.workspace.is_none());
        assert_eq!(config.log, "warn");
        assert!(config.attendance.fallback_to_previous_day);
        assert_eq!(config.attendance.default_status, AttendanceStatus::Absent);
        assert_eq!(config.db.busy_timeout_ms, 15_000);
        assert_eq!(config.stats.upcoming_days, 7);
    }

    #[test]
    fn toml_and_env_layers_override_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "schoold.toml",
                r#"
                    log = "debug"

                    [attendance]
                    fallback_to_previous_day = false
                "#,
            )?;
            jail.set_env("SCHOOLD_STATS__UPCOMING_DAYS", "14");
            jail.set_env("SCHOOLD_ATTENDANCE__DEFAULT_STATUS", "leave");

            let config: SchoolConfig = SchoolConfig::figment().extract()?;
            assert_eq!(config.log, "debug");
            assert!(!config.attendance.fallback_to_previous_day);
            assert_eq!(config.attendance.default_status, AttendanceStatus::Leave);
            assert_eq!(config.stats.upcoming_days, 14);
            assert_eq!(config.db.busy_timeout_ms, 15_000);
            Ok(())
        });
    }

    #[test]
    fn zero_upcoming_days_is_rejected() {
        let mut config = SchoolConfig::default();
        config.stats.upcoming_days = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
