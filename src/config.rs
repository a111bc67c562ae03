use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::limits::RETENTION_DAYS;
use crate::model::SuperAdmins;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Process settings, read from the environment (and `.env` if present).
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub super_admins: SuperAdmins,
    pub retention_days: i64,
    pub sweep_interval: Duration,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            super_admins: SuperAdmins::default(),
            retention_days: RETENTION_DAYS,
            sweep_interval: Duration::from_secs(3600),
            compact_threshold: 1000,
            metrics_port: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!("ignoring .env: {e}");
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup. Unset keys keep their
    /// defaults; set but unparsable keys are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let data_dir = lookup("VISITAS_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir);
        let super_admins = lookup("VISITAS_SUPER_ADMINS")
            .map(|raw| SuperAdmins::new(raw.split(',')))
            .unwrap_or(defaults.super_admins);
        let retention_days = parse(&lookup, "VISITAS_RETENTION_DAYS")?.unwrap_or(defaults.retention_days);
        let sweep_interval = parse(&lookup, "VISITAS_SWEEP_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.sweep_interval);
        let compact_threshold =
            parse(&lookup, "VISITAS_COMPACT_THRESHOLD")?.unwrap_or(defaults.compact_threshold);
        let metrics_port = parse(&lookup, "VISITAS_METRICS_PORT")?;

        Ok(Self {
            data_dir,
            super_admins,
            retention_days,
            sweep_interval,
            compact_threshold,
            metrics_port,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("visitas.wal")
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}
