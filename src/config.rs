use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

pub const DEFAULT_HTTP_URL: &str = "http://127.0.0.1:5611";
pub const DEFAULT_WS_URL: &str = "ws://127.0.0.1:5611/ws";
pub const DEFAULT_USERNAME: &str = "default";
pub const DEFAULT_INITIAL_CAPITAL: f64 = 100_000.0;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3_000;
pub const DEFAULT_INITIAL_CONNECT_RETRY_MS: u64 = 5_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_POLL_BACKOFF_MS: u64 = 30_000;
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 500;
pub const DEFAULT_REFRESH_DELAY_MS: u64 = 500;
pub const DEFAULT_LOOKBACK_DAYS: u32 = 5;
pub const DEFAULT_EVENT_CAPACITY: usize = 256;
pub const DEFAULT_DB_FILENAME: &str = "dashboard.db";
pub const MIN_DELAY_MS: u64 = 10;
pub const MAX_DELAY_MS: u64 = 600_000;
pub const MAX_LOOKBACK_DAYS: u32 = 365;
pub const MIN_EVENT_CAPACITY: usize = 16;
pub const MAX_EVENT_CAPACITY: usize = 65_536;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeArgs {
    pub http_url: Option<String>,
    pub ws_url: Option<String>,
    pub username: Option<String>,
    pub initial_capital: Option<f64>,
    pub reconnect_delay_ms: Option<u64>,
    pub initial_connect_retry_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub poll_backoff_ms: Option<u64>,
    pub settle_delay_ms: Option<u64>,
    pub refresh_delay_ms: Option<u64>,
    pub lookback_days: Option<u32>,
    pub event_capacity: Option<usize>,
    pub db_filename: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub http_url: String,
    pub ws_url: String,
    pub username: String,
    pub initial_capital: f64,
    pub reconnect_delay_ms: u64,
    pub initial_connect_retry_ms: u64,
    pub poll_interval_ms: u64,
    pub poll_backoff_ms: u64,
    pub settle_delay_ms: u64,
    pub refresh_delay_ms: u64,
    pub lookback_days: u32,
    pub event_capacity: usize,
    pub db_filename: String,
}

/// Settings consumed by the push connection driver.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: String,
    pub username: String,
    pub initial_capital: f64,
    pub reconnect_delay: Duration,
    pub initial_connect_retry: Duration,
    pub event_capacity: usize,
}

/// Cadences used by the replay clock controller.
#[derive(Debug, Clone, Copy)]
pub struct ReplayTiming {
    pub poll_interval: Duration,
    pub poll_backoff: Duration,
    pub settle_delay: Duration,
    pub refresh_delay: Duration,
}

impl Default for ReplayTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            poll_backoff: Duration::from_millis(DEFAULT_POLL_BACKOFF_MS),
            settle_delay: Duration::from_millis(DEFAULT_SETTLE_DELAY_MS),
            refresh_delay: Duration::from_millis(DEFAULT_REFRESH_DELAY_MS),
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_string(name).and_then(|value| value.parse().ok())
}

fn validate_delay(name: &str, value: u64) -> Result<u64, AppError> {
    if !(MIN_DELAY_MS..=MAX_DELAY_MS).contains(&value) {
        return Err(AppError::InvalidArgument(format!(
            "{name} must be between {MIN_DELAY_MS} and {MAX_DELAY_MS}"
        )));
    }
    Ok(value)
}

fn validate_url(name: &str, value: String, schemes: &[&str]) -> Result<String, AppError> {
    let trimmed = value.trim().trim_end_matches('/').to_string();
    if !schemes
        .iter()
        .any(|scheme| trimmed.starts_with(&format!("{scheme}://")))
    {
        return Err(AppError::InvalidArgument(format!(
            "{name} must use one of the schemes {}",
            schemes.join(", ")
        )));
    }
    Ok(trimmed)
}

impl RuntimeArgs {
    /// Reads overrides from `DASHBOARD_*` environment variables. Unparseable values
    /// are treated as unset.
    pub fn from_env() -> Self {
        Self {
            http_url: env_string("DASHBOARD_HTTP_URL"),
            ws_url: env_string("DASHBOARD_WS_URL"),
            username: env_string("DASHBOARD_USERNAME"),
            initial_capital: env_parsed("DASHBOARD_INITIAL_CAPITAL"),
            reconnect_delay_ms: env_parsed("DASHBOARD_RECONNECT_DELAY_MS"),
            initial_connect_retry_ms: None,
            poll_interval_ms: env_parsed("DASHBOARD_POLL_INTERVAL_MS"),
            poll_backoff_ms: env_parsed("DASHBOARD_POLL_BACKOFF_MS"),
            settle_delay_ms: None,
            refresh_delay_ms: None,
            lookback_days: env_parsed("DASHBOARD_LOOKBACK_DAYS"),
            event_capacity: None,
            db_filename: env_string("DASHBOARD_DB_FILENAME"),
        }
    }

    pub fn normalize(self) -> Result<RuntimeConfig, AppError> {
        let http_url = validate_url(
            "httpUrl",
            self.http_url.unwrap_or_else(|| DEFAULT_HTTP_URL.to_string()),
            &["http", "https"],
        )?;
        let ws_url = validate_url(
            "wsUrl",
            self.ws_url.unwrap_or_else(|| DEFAULT_WS_URL.to_string()),
            &["ws", "wss"],
        )?;

        let username = self
            .username
            .unwrap_or_else(|| DEFAULT_USERNAME.to_string())
            .trim()
            .to_string();
        if username.is_empty() {
            return Err(AppError::InvalidArgument(
                "username must be non-empty".to_string(),
            ));
        }

        let initial_capital = self.initial_capital.unwrap_or(DEFAULT_INITIAL_CAPITAL);
        if !initial_capital.is_finite() || initial_capital <= 0.0 {
            return Err(AppError::InvalidArgument(
                "initialCapital must be a finite positive number".to_string(),
            ));
        }

        let reconnect_delay_ms = validate_delay(
            "reconnectDelayMs",
            self.reconnect_delay_ms.unwrap_or(DEFAULT_RECONNECT_DELAY_MS),
        )?;
        let initial_connect_retry_ms = validate_delay(
            "initialConnectRetryMs",
            self.initial_connect_retry_ms
                .unwrap_or(DEFAULT_INITIAL_CONNECT_RETRY_MS),
        )?;
        let poll_interval_ms = validate_delay(
            "pollIntervalMs",
            self.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
        )?;
        let poll_backoff_ms = validate_delay(
            "pollBackoffMs",
            self.poll_backoff_ms.unwrap_or(DEFAULT_POLL_BACKOFF_MS),
        )?;
        if poll_backoff_ms < poll_interval_ms {
            return Err(AppError::InvalidArgument(
                "pollBackoffMs must not be shorter than pollIntervalMs".to_string(),
            ));
        }
        let settle_delay_ms = validate_delay(
            "settleDelayMs",
            self.settle_delay_ms.unwrap_or(DEFAULT_SETTLE_DELAY_MS),
        )?;
        let refresh_delay_ms = validate_delay(
            "refreshDelayMs",
            self.refresh_delay_ms.unwrap_or(DEFAULT_REFRESH_DELAY_MS),
        )?;

        let lookback_days = self.lookback_days.unwrap_or(DEFAULT_LOOKBACK_DAYS);
        if lookback_days > MAX_LOOKBACK_DAYS {
            return Err(AppError::InvalidArgument(format!(
                "lookbackDays must be at most {MAX_LOOKBACK_DAYS}"
            )));
        }

        let event_capacity = self.event_capacity.unwrap_or(DEFAULT_EVENT_CAPACITY);
        if !(MIN_EVENT_CAPACITY..=MAX_EVENT_CAPACITY).contains(&event_capacity) {
            return Err(AppError::InvalidArgument(format!(
                "eventCapacity must be between {MIN_EVENT_CAPACITY} and {MAX_EVENT_CAPACITY}"
            )));
        }

        let db_filename = self
            .db_filename
            .unwrap_or_else(|| DEFAULT_DB_FILENAME.to_string());

        Ok(RuntimeConfig {
            http_url,
            ws_url,
            username,
            initial_capital,
            reconnect_delay_ms,
            initial_connect_retry_ms,
            poll_interval_ms,
            poll_backoff_ms,
            settle_delay_ms,
            refresh_delay_ms,
            lookback_days,
            event_capacity,
            db_filename,
        })
    }
}

impl RuntimeConfig {
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            url: self.ws_url.clone(),
            username: self.username.clone(),
            initial_capital: self.initial_capital,
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            initial_connect_retry: Duration::from_millis(self.initial_connect_retry_ms),
            event_capacity: self.event_capacity,
        }
    }

    pub fn replay_timing(&self) -> ReplayTiming {
        ReplayTiming {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            poll_backoff: Duration::from_millis(self.poll_backoff_ms),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            refresh_delay: Duration::from_millis(self.refresh_delay_ms),
        }
    }
}
