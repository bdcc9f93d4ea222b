use crate::error::AppError;
use crate::series::types::{ChartArgs, SeriesTimeframe, DEFAULT_SYMBOL};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const SECONDS_PER_DAY: i64 = 86_400;
pub const DEFAULT_SPEED_MULTIPLIER: f64 = 1.0;
pub const MAX_SPEED_MULTIPLIER: f64 = 1_000.0;
pub const DEFAULT_TRADING_INTERVAL: TradingInterval = TradingInterval::Daily;
pub const MIN_AUTO_ADVANCE_PERIOD_MS: u64 = 50;
/// Percentage points a reported progress may drift before it is logged.
const PROGRESS_TOLERANCE: f64 = 0.5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReplayPhase {
    Idle,
    Configuring,
    Active,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "u32", into = "u32")]
pub enum TradingInterval {
    Daily,
    Weekly,
}

impl TradingInterval {
    pub fn from_days(days: u32) -> Result<Self, AppError> {
        match days {
            1 => Ok(Self::Daily),
            7 => Ok(Self::Weekly),
            other => Err(AppError::InvalidArgument(format!(
                "trading interval must be 1 or 7 days, got {other}"
            ))),
        }
    }

    pub fn days(self) -> u32 {
        match self {
            Self::Daily => 1,
            Self::Weekly => 7,
        }
    }

    pub fn seconds(self) -> i64 {
        i64::from(self.days()) * SECONDS_PER_DAY
    }
}

impl TryFrom<u32> for TradingInterval {
    type Error = AppError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::from_days(value)
    }
}

impl From<TradingInterval> for u32 {
    fn from(value: TradingInterval) -> Self {
        value.days()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplayWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ReplayWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, AppError> {
        if start >= end {
            return Err(AppError::InvalidWindow(
                "start must be strictly before end".to_string(),
            ));
        }
        Ok(Self { start, end })
    }

    /// Fraction of the window covered by `current`, in percent and clamped.
    pub fn progress_percent(&self, current: DateTime<Utc>) -> f64 {
        let span_ms = (self.end - self.start).num_milliseconds();
        if span_ms <= 0 {
            return 0.0;
        }
        let elapsed_ms = (current - self.start).num_milliseconds();
        (elapsed_ms as f64 / span_ms as f64 * 100.0).clamp(0.0, 100.0)
    }
}

/// Local mirror of the server-owned simulation clock.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplayState {
    pub active: bool,
    pub window: Option<ReplayWindow>,
    pub current: Option<DateTime<Utc>>,
    pub speed_multiplier: f64,
    pub interval: TradingInterval,
    pub progress: Option<f64>,
}

impl Default for ReplayState {
    fn default() -> Self {
        Self::inactive()
    }
}

impl ReplayState {
    pub fn inactive() -> Self {
        Self {
            active: false,
            window: None,
            current: None,
            speed_multiplier: DEFAULT_SPEED_MULTIPLIER,
            interval: DEFAULT_TRADING_INTERVAL,
            progress: None,
        }
    }

    pub fn progress_percent(&self) -> Option<f64> {
        if let Some(progress) = self.progress {
            return Some(progress.clamp(0.0, 100.0));
        }
        match (self.window, self.current) {
            (Some(window), Some(current)) => Some(window.progress_percent(current)),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        match (self.window, self.current) {
            (Some(window), Some(current)) => self.active && current >= window.end,
            _ => false,
        }
    }
}

/// Accepts RFC 3339, naive ISO datetimes (taken as UTC) and bare dates.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, AppError> {
    let trimmed = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(parsed.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }
    Err(AppError::InvalidArgument(format!(
        "unrecognized timestamp '{trimmed}'"
    )))
}

pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn default_speed_multiplier() -> f64 {
    DEFAULT_SPEED_MULTIPLIER
}

fn default_trading_interval_days() -> u32 {
    DEFAULT_TRADING_INTERVAL.days()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayStateWire {
    pub start_date: String,
    pub end_date: String,
    #[serde(default)]
    pub current_date: Option<String>,
    #[serde(default = "default_speed_multiplier")]
    pub speed_multiplier: f64,
    #[serde(default = "default_trading_interval_days")]
    pub trading_interval_days: u32,
    #[serde(default)]
    pub progress: Option<f64>,
}

impl TryFrom<ReplayStateWire> for ReplayState {
    type Error = AppError;

    fn try_from(value: ReplayStateWire) -> Result<Self, Self::Error> {
        let malformed = |error: AppError| AppError::MalformedResponse(error.to_string());

        let start = parse_timestamp(&value.start_date).map_err(malformed)?;
        let end = parse_timestamp(&value.end_date).map_err(malformed)?;
        let window = ReplayWindow::new(start, end).map_err(malformed)?;
        let current = match value.current_date.as_deref() {
            Some(raw) => parse_timestamp(raw).map_err(malformed)?,
            None => start,
        };
        if !value.speed_multiplier.is_finite() || value.speed_multiplier <= 0.0 {
            return Err(AppError::MalformedResponse(
                "speed_multiplier must be positive".to_string(),
            ));
        }
        let interval = TradingInterval::from_days(value.trading_interval_days).map_err(malformed)?;
        let progress = window.progress_percent(current);
        if let Some(reported) = value.progress {
            if !reported.is_finite() || (reported - progress).abs() > PROGRESS_TOLERANCE {
                tracing::debug!(reported, derived = progress, "server progress disagrees with clock");
            }
        }

        Ok(Self {
            active: true,
            window: Some(window),
            current: Some(current),
            speed_multiplier: value.speed_multiplier,
            interval,
            progress: Some(progress),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayStateResponse {
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub state: Option<ReplayStateWire>,
}

impl TryFrom<ReplayStateResponse> for ReplayState {
    type Error = AppError;

    fn try_from(value: ReplayStateResponse) -> Result<Self, Self::Error> {
        match (value.active, value.state) {
            (true, Some(state)) => state.try_into(),
            (true, None) => Err(AppError::MalformedResponse(
                "active replay without state".to_string(),
            )),
            (false, _) => Ok(Self::inactive()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartReplayResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub state: Option<ReplayStateWire>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StopReplayResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdvanceReplayResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub current_date: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartReplayArgs {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub speed_multiplier: Option<f64>,
    pub trading_interval_days: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StartReplayRequest {
    pub window: ReplayWindow,
    pub speed_multiplier: f64,
    pub interval: TradingInterval,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StartReplayBody {
    pub start_date: String,
    pub end_date: String,
    pub speed_multiplier: f64,
    pub trading_interval_days: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindowEdge {
    Start,
    End,
}

fn parse_window_edge(value: Option<&str>, edge: WindowEdge) -> Result<DateTime<Utc>, AppError> {
    let raw = value.map(str::trim).unwrap_or_default();
    let label = match edge {
        WindowEdge::Start => "start",
        WindowEdge::End => "end",
    };
    if raw.is_empty() {
        return Err(AppError::InvalidWindow(format!("{label} date is required")));
    }

    // Bare dates cover the whole day: midnight for the start, last second for the end.
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let edge_time = match edge {
            WindowEdge::Start => date.and_hms_opt(0, 0, 0),
            WindowEdge::End => date.and_hms_opt(23, 59, 59),
        };
        return edge_time
            .map(|value| value.and_utc())
            .ok_or_else(|| AppError::InvalidWindow(format!("{label} date is out of range")));
    }

    parse_timestamp(raw)
        .map_err(|_| AppError::InvalidWindow(format!("{label} date '{raw}' is not a valid instant")))
}

impl StartReplayArgs {
    pub fn normalize(self) -> Result<StartReplayRequest, AppError> {
        let start = parse_window_edge(self.start_date.as_deref(), WindowEdge::Start)?;
        let end = parse_window_edge(self.end_date.as_deref(), WindowEdge::End)?;
        let window = ReplayWindow::new(start, end)?;

        let speed_multiplier = self.speed_multiplier.unwrap_or(DEFAULT_SPEED_MULTIPLIER);
        if !speed_multiplier.is_finite()
            || speed_multiplier <= 0.0
            || speed_multiplier > MAX_SPEED_MULTIPLIER
        {
            return Err(AppError::InvalidArgument(format!(
                "speedMultiplier must be in (0, {MAX_SPEED_MULTIPLIER}]"
            )));
        }

        let interval = match self.trading_interval_days {
            Some(days) => TradingInterval::from_days(days)?,
            None => DEFAULT_TRADING_INTERVAL,
        };

        Ok(StartReplayRequest {
            window,
            speed_multiplier,
            interval,
        })
    }
}

impl StartReplayRequest {
    pub fn body(&self) -> StartReplayBody {
        StartReplayBody {
            start_date: format_timestamp(self.window.start),
            end_date: format_timestamp(self.window.end),
            speed_multiplier: self.speed_multiplier,
            trading_interval_days: self.interval.days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplayPreferencesSnapshot {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub speed_multiplier: f64,
    pub trading_interval_days: u32,
    pub symbol: String,
    pub market: String,
    pub timeframe: SeriesTimeframe,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SaveReplayPreferencesArgs {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub speed_multiplier: Option<f64>,
    pub trading_interval_days: Option<u32>,
    pub symbol: Option<String>,
    pub market: Option<String>,
    pub timeframe: Option<SeriesTimeframe>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayPreferences {
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub speed_multiplier: f64,
    pub interval: TradingInterval,
    pub symbol: String,
    pub market: String,
    pub timeframe: SeriesTimeframe,
}

impl SaveReplayPreferencesArgs {
    pub fn normalize(self) -> Result<ReplayPreferences, AppError> {
        let start_date = match self.start_date.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => Some(parse_window_edge(Some(raw), WindowEdge::Start)?),
            _ => None,
        };
        let end_date = match self.end_date.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => Some(parse_window_edge(Some(raw), WindowEdge::End)?),
            _ => None,
        };
        if let (Some(start), Some(end)) = (start_date, end_date) {
            ReplayWindow::new(start, end)?;
        }

        let speed_multiplier = self.speed_multiplier.unwrap_or(DEFAULT_SPEED_MULTIPLIER);
        if !speed_multiplier.is_finite()
            || speed_multiplier <= 0.0
            || speed_multiplier > MAX_SPEED_MULTIPLIER
        {
            return Err(AppError::InvalidArgument(format!(
                "speedMultiplier must be in (0, {MAX_SPEED_MULTIPLIER}]"
            )));
        }
        let interval = match self.trading_interval_days {
            Some(days) => TradingInterval::from_days(days)?,
            None => DEFAULT_TRADING_INTERVAL,
        };

        let chart = ChartArgs {
            symbol: Some(self.symbol.unwrap_or_else(|| DEFAULT_SYMBOL.to_string())),
            market: self.market,
            timeframe: self.timeframe,
            count: None,
        }
        .normalize()?;

        Ok(ReplayPreferences {
            start_date,
            end_date,
            speed_multiplier,
            interval,
            symbol: chart.symbol,
            market: chart.market,
            timeframe: chart.timeframe,
        })
    }
}

impl SaveReplayPreferencesArgs {
    /// Captures the window of a replay that just started, keeping the chart selection.
    pub fn from_started(request: &StartReplayRequest, previous: &ReplayPreferencesSnapshot) -> Self {
        Self {
            start_date: Some(format_timestamp(request.window.start)),
            end_date: Some(format_timestamp(request.window.end)),
            speed_multiplier: Some(request.speed_multiplier),
            trading_interval_days: Some(request.interval.days()),
            symbol: Some(previous.symbol.clone()),
            market: Some(previous.market.clone()),
            timeframe: Some(previous.timeframe),
        }
    }
}

/// Wall-clock cadence of the auto-advance timer and the simulated step per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoAdvancePlan {
    pub period: Duration,
    pub step_seconds: i64,
}

impl AutoAdvancePlan {
    /// `interval_days * 86400 / speed`, read as milliseconds.
    pub fn new(speed_multiplier: f64, interval: TradingInterval) -> Self {
        let raw_ms = interval.seconds() as f64 / speed_multiplier;
        let period_ms = if raw_ms.is_finite() {
            (raw_ms.round() as u64).max(MIN_AUTO_ADVANCE_PERIOD_MS)
        } else {
            MIN_AUTO_ADVANCE_PERIOD_MS
        };

        Self {
            period: Duration::from_millis(period_ms),
            step_seconds: interval.seconds(),
        }
    }
}
