use std::path::PathBuf;
use std::time::Duration;

use crate::error::{RecorderError, Result};
use crate::store::default_store_path;
use crate::types::DISPLAY_BUFFER_DEFAULT;

pub const DEFAULT_COLLECTOR_URL: &str = "http://127.0.0.1:5001";
pub const DEFAULT_PANEL_KEY: &str = "panelTabId";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Largest display buffer accepted from the environment.
pub const MAX_DISPLAY_BUFFER: usize = 10_000;

pub const ENV_COLLECTOR_URL: &str = "STEP_RECORDER_COLLECTOR_URL";
pub const ENV_DISPLAY_BUFFER: &str = "STEP_RECORDER_DISPLAY_BUFFER";
pub const ENV_STORE: &str = "STEP_RECORDER_STORE";
pub const ENV_TIMEOUT_MS: &str = "STEP_RECORDER_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq)]
pub struct RecorderConfig {
    /// Base URL of the collector the sink pushes to.
    pub collector_url: String,
    /// Steps kept for UI observers.
    pub display_buffer: usize,
    /// Metadata key recording which context owns the control panel.
    pub panel_key: String,
    /// Where session metadata lives. `None` keeps it in memory.
    pub store_path: Option<PathBuf>,
    pub request_timeout: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            collector_url: DEFAULT_COLLECTOR_URL.to_string(),
            display_buffer: DISPLAY_BUFFER_DEFAULT,
            panel_key: DEFAULT_PANEL_KEY.to_string(),
            store_path: default_store_path(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl RecorderConfig {
    /// Defaults overridden by the process environment (and `.env`, if present).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(url) = lookup(ENV_COLLECTOR_URL) {
            config.collector_url = url.trim_end_matches('/').to_string();
        }
        if let Some(raw) = lookup(ENV_DISPLAY_BUFFER) {
            config.display_buffer = parse_display_buffer(&raw)?;
        }
        if let Some(path) = lookup(ENV_STORE) {
            config.store_path = Some(PathBuf::from(path));
        }
        if let Some(raw) = lookup(ENV_TIMEOUT_MS) {
            config.request_timeout = Duration::from_millis(parse_number(ENV_TIMEOUT_MS, &raw)?);
        }
        Ok(config)
    }
}

fn parse_number(key: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse()
        .map_err(|_| RecorderError::Config(format!("{key} must be a non-negative integer, got {raw:?}")))
}

fn parse_display_buffer(raw: &str) -> Result<usize> {
    let value = parse_number(ENV_DISPLAY_BUFFER, raw)?;
    usize::try_from(value)
        .ok()
        .filter(|&size| size <= MAX_DISPLAY_BUFFER)
        .ok_or_else(|| {
            RecorderError::Config(format!(
                "{ENV_DISPLAY_BUFFER} must be at most {MAX_DISPLAY_BUFFER}, got {value}"
            ))
        })
}
