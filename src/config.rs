//! Configuration module for Datalink Hub.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::time::Duration;

use crate::listener::{DecoderType, Endpoint};

/// Hub configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Path to the SQLite database file (default: "datalinkhub.db")
    pub db_path: String,
    /// Optional path to a mirrored backup database
    pub db_backup_path: Option<String>,
    /// Days of message history to keep (default: 1095)
    pub retention_days: u32,
    /// Delay between reconnect attempts (default: 1000 ms)
    pub reconnect_delay: Duration,
    /// Configured feed sources, one per enabled decoder
    pub sources: Vec<(DecoderType, Endpoint)>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            db_path: "datalinkhub.db".to_string(),
            db_backup_path: None,
            retention_days: 1095,
            reconnect_delay: Duration::from_millis(1000),
            sources: Vec::new(),
        }
    }
}

impl HubConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `DLH_DB_PATH`: Database file path (default: "datalinkhub.db")
    /// - `DLH_DB_BACKUP_PATH`: Optional backup database path
    /// - `DLH_RETENTION_DAYS`: Days of history to keep (default: 1095)
    /// - `DLH_RECONNECT_DELAY_MS`: Reconnect delay in ms (default: 1000)
    /// - `DLH_<DECODER>_SOURCE`: Feed endpoint per decoder, e.g.
    ///   `DLH_VDLM2_SOURCE=udp://0.0.0.0:15555`. Unset disables the
    ///   decoder; a malformed value logs a warning and disables it.
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(db_path) = env::var("DLH_DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Ok(backup) = env::var("DLH_DB_BACKUP_PATH") {
            if !backup.is_empty() {
                cfg.db_backup_path = Some(backup);
            }
        }
        if let Ok(days_str) = env::var("DLH_RETENTION_DAYS") {
            match days_str.parse() {
                Ok(days) => cfg.retention_days = days,
                Err(_) => tracing::warn!(
                    "Config: invalid DLH_RETENTION_DAYS {:?}, using {}",
                    days_str,
                    cfg.retention_days
                ),
            }
        }
        if let Ok(ms_str) = env::var("DLH_RECONNECT_DELAY_MS") {
            match ms_str.parse() {
                Ok(ms) => cfg.reconnect_delay = Duration::from_millis(ms),
                Err(_) => tracing::warn!(
                    "Config: invalid DLH_RECONNECT_DELAY_MS {:?}, using default",
                    ms_str
                ),
            }
        }

        for decoder in DecoderType::ALL {
            let key = format!("DLH_{}_SOURCE", decoder.config_name());
            let Ok(raw) = env::var(&key) else {
                continue;
            };
            match Endpoint::parse(&raw) {
                Some(endpoint) => cfg.sources.push((decoder, endpoint)),
                None => {
                    tracing::warn!("Config: malformed {} {:?}, {} disabled", key, raw, decoder);
                }
            }
        }

        cfg
    }
}
