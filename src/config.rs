//! Sync service configuration
//!
//! Defaults, overridden by an optional TOML file, overridden by environment
//! variables. Invalid environment values are ignored rather than fatal.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};
use tracing::warn;

pub const DEFAULT_FORECAST_YEARS: u32 = 3;
/// Largest forecast horizon accepted from any source
pub const MAX_FORECAST_YEARS: u32 = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Realtime Database root, e.g. https://<db>.firebasedatabase.app
    pub database_url: Option<String>,
    /// Database secret or ID token appended as `auth=`
    pub auth_token: Option<String>,
    /// Base record hierarchy (year -> month -> bid id -> fields)
    pub bids_path: String,
    /// User overrides keyed by bid id
    pub overrides_path: String,
    /// Number of future years to synthesize (0 disables forecasting)
    pub forecast_years: u32,
    /// Written into every override record we touch
    pub modifier_tag: String,
    pub request_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// How often the service logs a status line (0 = never)
    pub status_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            auth_token: None,
            bids_path: "/bids".to_string(),
            overrides_path: "/user_inputs".to_string(),
            forecast_years: DEFAULT_FORECAST_YEARS,
            modifier_tag: "dashboard_user".to_string(),
            request_timeout_ms: 10_000,
            reconnect_base_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
            status_interval_secs: 60,
        }
    }
}

impl SyncConfig {
    /// Load from a TOML file. Missing keys take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.forecast_years > MAX_FORECAST_YEARS {
            bail!(
                "forecast_years = {} exceeds the maximum of {}",
                self.forecast_years,
                MAX_FORECAST_YEARS
            );
        }
        Ok(())
    }

    /// Period of the status log line; None when disabled
    pub fn status_interval(&self) -> Option<Duration> {
        (self.status_interval_secs > 0).then(|| Duration::from_secs(self.status_interval_secs))
    }

    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("FIREBASE_DATABASE_URL") {
            if !v.trim().is_empty() {
                self.database_url = Some(v.trim().trim_end_matches('/').to_string());
            }
        }
        if let Ok(v) = std::env::var("FIREBASE_AUTH_TOKEN") {
            if !v.trim().is_empty() {
                self.auth_token = Some(v.trim().to_string());
            }
        }
        if let Ok(v) = std::env::var("BIDBOARD_BIDS_PATH") {
            if !v.trim().is_empty() {
                self.bids_path = v.trim().to_string();
            }
        }
        if let Ok(v) = std::env::var("BIDBOARD_OVERRIDES_PATH") {
            if !v.trim().is_empty() {
                self.overrides_path = v.trim().to_string();
            }
        }
        if let Ok(v) = std::env::var("BIDBOARD_FORECAST_YEARS") {
            match v.trim().parse::<u32>() {
                Ok(years) if years <= MAX_FORECAST_YEARS => self.forecast_years = years,
                _ => warn!(value = %v, "Ignoring invalid BIDBOARD_FORECAST_YEARS"),
            }
        }
        if let Ok(v) = std::env::var("BIDBOARD_MODIFIER_TAG") {
            if !v.trim().is_empty() {
                self.modifier_tag = v.trim().to_string();
            }
        }
        if let Ok(v) = std::env::var("BIDBOARD_REQUEST_TIMEOUT_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                if ms > 0 {
                    self.request_timeout_ms = ms;
                }
            }
        }
        if let Ok(v) = std::env::var("BIDBOARD_RECONNECT_BASE_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                if ms > 0 {
                    self.reconnect_base_delay_ms = ms;
                }
            }
        }
        if let Ok(v) = std::env::var("BIDBOARD_RECONNECT_MAX_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                if ms > 0 {
                    self.reconnect_max_delay_ms = ms;
                }
            }
        }
        if let Ok(v) = std::env::var("BIDBOARD_STATUS_INTERVAL_SECS") {
            if let Ok(secs) = v.parse() {
                self.status_interval_secs = secs;
            }
        }

        self
    }
}
