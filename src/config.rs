//! Process configuration loaded from the environment.
//!
//! This is the narrow interface to the config-loading collaborator that
//! spec.md names out of scope: a typed [`Config`] plus [`Config::from_env`].
//! There is no file-based config, hot reload, or remote config service here —
//! those belong to the external system this core is embedded in.

use std::env;
use std::time::Duration;

use crate::error::{AgentError, Result};

/// Environment variable names, canonical per spec.md §6.
mod keys {
    pub const SERIAL_PORT: &str = "MMD_SERIAL_PORT";
    pub const SERIAL_BAUD: &str = "MMD_SERIAL_BAUD";
    pub const LINES_URL: &str = "MMD_LINES_URL";
    pub const TRANSACTIONS_URL: &str = "MMD_TRANSACTIONS_URL";
    pub const BATCH_LINES: &str = "MMD_BATCH_LINES";
    pub const NVR_BASE_URL: &str = "MMD_NVR_BASE_URL";
    pub const NVR_CAMERA: &str = "MMD_NVR_CAMERA";
    pub const NVR_LABEL: &str = "MMD_NVR_LABEL";
    pub const NVR_DURATION_SECS: &str = "MMD_NVR_DURATION_SECS";
    pub const NVR_REMOTE_ROLE: &str = "MMD_NVR_REMOTE_ROLE";
    pub const STORE_ID: &str = "MMD_STORE_ID";
    pub const DRAWER_ID: &str = "MMD_DRAWER_ID";
    pub const DEVICE_ID_OVERRIDE: &str = "MMD_DEVICE_ID";
    pub const DEVICE_NAME: &str = "MMD_DEVICE_NAME";
    pub const POS_TYPE: &str = "MMD_POS_TYPE";
    pub const PARSER_VERSION: &str = "MMD_PARSER_VERSION";
    pub const QUEUE_DB_PATH: &str = "MMD_QUEUE_DB_PATH";
    pub const QUEUE_MAX_BYTES: &str = "MMD_QUEUE_MAX_BYTES";
    pub const QUEUE_MAX_AGE_SECS: &str = "MMD_QUEUE_MAX_AGE_SECS";
    pub const QUEUE_TRIM_BATCH_SIZE: &str = "MMD_QUEUE_TRIM_BATCH_SIZE";
    pub const HEALTH_HOST: &str = "MMD_HEALTH_HOST";
    pub const HEALTH_PORT: &str = "MMD_HEALTH_PORT";
}

/// Default candidate serial device paths probed when no explicit port is
/// configured (spec.md §4.6 auto-detect precedence).
pub const DEFAULT_KNOWN_PORT_PATHS: &[&str] = &[
    "/dev/ttyUSB0",
    "/dev/ttyUSB1",
    "/dev/ttyACM0",
    "/dev/ttyS0",
];

/// `/dev` entry prefixes considered when no known path is readable.
pub const DEFAULT_DEV_PREFIXES: &[&str] = &["ttyUSB", "ttyACM", "ttyS"];

#[derive(Debug, Clone)]
pub struct Config {
    pub serial_port: Option<String>,
    pub serial_baud: u32,

    pub lines_url: String,
    pub transactions_url: String,
    pub batch_lines: bool,

    pub nvr_base_url: Option<String>,
    pub nvr_camera: String,
    pub nvr_label: String,
    pub nvr_duration_secs: u64,
    pub nvr_remote_role: Option<String>,

    pub store_id: Option<String>,
    pub drawer_id: Option<String>,
    pub device_id_override: Option<String>,
    pub device_name: String,
    pub pos_type: String,
    pub parser_version: String,

    pub queue_db_path: String,
    pub queue_max_bytes: u64,
    pub queue_max_age: Duration,
    pub queue_trim_batch_size: usize,

    pub health_host: String,
    pub health_port: u16,
}

impl Config {
    /// Load configuration from the environment. Fails fast (spec.md §7,
    /// "Configuration invalid: fatal at startup only") when a required
    /// variable is missing or malformed; never re-evaluated once running.
    pub fn from_env() -> Result<Self> {
        let lines_url = require(keys::LINES_URL)?;
        let transactions_url = require(keys::TRANSACTIONS_URL)?;

        Ok(Config {
            serial_port: env::var(keys::SERIAL_PORT).ok().filter(|s| !s.is_empty()),
            serial_baud: parse_or(keys::SERIAL_BAUD, 9600)?,

            lines_url,
            transactions_url,
            batch_lines: parse_bool_or(keys::BATCH_LINES, true)?,

            nvr_base_url: env::var(keys::NVR_BASE_URL)
                .ok()
                .filter(|s| !s.is_empty()),
            nvr_camera: env::var(keys::NVR_CAMERA).unwrap_or_else(|_| "pos".to_string()),
            nvr_label: env::var(keys::NVR_LABEL).unwrap_or_else(|_| "transaction".to_string()),
            nvr_duration_secs: parse_or(keys::NVR_DURATION_SECS, 120)?,
            nvr_remote_role: env::var(keys::NVR_REMOTE_ROLE)
                .ok()
                .filter(|s| !s.is_empty()),

            store_id: env::var(keys::STORE_ID).ok().filter(|s| !s.is_empty()),
            drawer_id: env::var(keys::DRAWER_ID).ok().filter(|s| !s.is_empty()),
            device_id_override: env::var(keys::DEVICE_ID_OVERRIDE)
                .ok()
                .filter(|s| !s.is_empty()),
            device_name: env::var(keys::DEVICE_NAME).unwrap_or_else(|_| "mmd-rv1".to_string()),
            pos_type: env::var(keys::POS_TYPE)
                .unwrap_or_else(|_| "verifone_commander".to_string()),
            parser_version: env::var(keys::PARSER_VERSION)
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),

            queue_db_path: env::var(keys::QUEUE_DB_PATH)
                .unwrap_or_else(|_| "queue.sqlite3".to_string()),
            queue_max_bytes: parse_or(keys::QUEUE_MAX_BYTES, 256 * 1024 * 1024)?,
            queue_max_age: Duration::from_secs(parse_or(keys::QUEUE_MAX_AGE_SECS, 7 * 24 * 3600)?),
            queue_trim_batch_size: parse_or(keys::QUEUE_TRIM_BATCH_SIZE, 100)?,

            health_host: env::var(keys::HEALTH_HOST).unwrap_or_else(|_| "0.0.0.0".to_string()),
            health_port: parse_or(keys::HEALTH_PORT, 9102)?,
        })
    }
}

fn require(key: &str) -> Result<String> {
    env::var(key)
        .ok()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AgentError::Config(format!("missing required environment variable {key}")))
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) if !raw.is_empty() => raw
            .parse::<T>()
            .map_err(|_| AgentError::Config(format!("{key} is not a valid number: {raw}"))),
        _ => Ok(default),
    }
}

fn parse_bool_or(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(raw) if !raw.is_empty() => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(AgentError::Config(format!(
                "{key} is not a valid boolean: {other}"
            ))),
        },
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            keys::SERIAL_PORT,
            keys::SERIAL_BAUD,
            keys::LINES_URL,
            keys::TRANSACTIONS_URL,
            keys::BATCH_LINES,
            keys::NVR_BASE_URL,
            keys::QUEUE_DB_PATH,
            keys::HEALTH_PORT,
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn missing_required_url_is_fatal() {
        clear_env();
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[test]
    #[serial]
    fn defaults_apply_when_optional_vars_absent() {
        clear_env();
        env::set_var(keys::LINES_URL, "https://intake.example/lines");
        env::set_var(keys::TRANSACTIONS_URL, "https://intake.example/transactions");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.serial_baud, 9600);
        assert!(cfg.batch_lines);
        assert_eq!(cfg.health_port, 9102);
        assert!(cfg.serial_port.is_none());
        clear_env();
    }

    #[test]
    #[serial]
    fn malformed_number_is_fatal() {
        clear_env();
        env::set_var(keys::LINES_URL, "https://intake.example/lines");
        env::set_var(keys::TRANSACTIONS_URL, "https://intake.example/transactions");
        env::set_var(keys::SERIAL_BAUD, "not-a-number");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
        clear_env();
    }
}
