use crate::error::AppError;
use crate::replay::api::{HistoricalSeriesSource, ReplayApi};
use crate::replay::types::{
    format_timestamp, AdvanceReplayResponse, ReplayState, ReplayWindow, StartReplayRequest,
    StartReplayResponse, StopReplayResponse, TradingInterval,
};
use crate::series::types::{PricePoint, SeriesRequest};
use crate::session::reconciler::RefreshTrigger;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
struct FakeClock {
    active: bool,
    window: Option<ReplayWindow>,
    current: Option<DateTime<Utc>>,
    speed_multiplier: f64,
    interval: Option<TradingInterval>,
}

/// In-process replay backend: advances by `seconds * speed`, capped at the end.
#[derive(Debug, Default)]
pub(crate) struct FakeReplayServer {
    clock: Mutex<FakeClock>,
    failing: AtomicBool,
    state_latency: Mutex<Duration>,
    state_calls: AtomicUsize,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    advance_calls: AtomicUsize,
}

impl FakeReplayServer {
    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn set_state_latency(&self, latency: Duration) {
        *self.state_latency.lock() = latency;
    }

    pub(crate) fn set_speed(&self, speed_multiplier: f64) {
        self.clock.lock().speed_multiplier = speed_multiplier;
    }

    pub(crate) fn end_replay(&self) {
        *self.clock.lock() = FakeClock::default();
    }

    pub(crate) fn state_calls(&self) -> usize {
        self.state_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn advance_calls(&self) -> usize {
        self.advance_calls.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> ReplayState {
        let clock = self.clock.lock();
        if !clock.active {
            return ReplayState::inactive();
        }
        ReplayState {
            active: true,
            window: clock.window,
            current: clock.current,
            speed_multiplier: clock.speed_multiplier,
            interval: clock.interval.unwrap_or(TradingInterval::Daily),
            progress: None,
        }
    }
}

#[async_trait]
impl ReplayApi for FakeReplayServer {
    async fn replay_state(&self) -> Result<ReplayState, AppError> {
        self.state_calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.state_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::Rejected("backend unavailable".to_string()));
        }
        Ok(self.snapshot())
    }

    async fn start_replay(
        &self,
        request: &StartReplayRequest,
    ) -> Result<StartReplayResponse, AppError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        let mut clock = self.clock.lock();
        if clock.active {
            return Err(AppError::Rejected(
                "Replay mode is already active. Stop it first.".to_string(),
            ));
        }
        *clock = FakeClock {
            active: true,
            window: Some(request.window),
            current: Some(request.window.start),
            speed_multiplier: request.speed_multiplier,
            interval: Some(request.interval),
        };
        Ok(StartReplayResponse {
            success: true,
            message: Some("Replay mode started".to_string()),
            state: None,
        })
    }

    async fn stop_replay(&self) -> Result<StopReplayResponse, AppError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        *self.clock.lock() = FakeClock::default();
        Ok(StopReplayResponse {
            success: true,
            message: Some("Replay mode stopped".to_string()),
        })
    }

    async fn advance_replay(&self, seconds: i64) -> Result<AdvanceReplayResponse, AppError> {
        self.advance_calls.fetch_add(1, Ordering::SeqCst);
        let mut clock = self.clock.lock();
        let (Some(window), Some(current)) = (clock.window, clock.current) else {
            return Err(AppError::Rejected("Replay mode is not active".to_string()));
        };
        if !clock.active {
            return Err(AppError::Rejected("Replay mode is not active".to_string()));
        }

        let scaled = (seconds as f64 * clock.speed_multiplier) as i64;
        let next = (current + chrono::Duration::seconds(scaled)).min(window.end);
        clock.current = Some(next);

        Ok(AdvanceReplayResponse {
            success: true,
            current_date: Some(format_timestamp(next)),
            message: Some(format!("Replay advanced by {seconds} seconds")),
        })
    }
}

/// Serves a fixed series and records what was asked for.
#[derive(Debug, Default)]
pub(crate) struct FakeSeriesSource {
    pub(crate) points: Vec<PricePoint>,
    pub(crate) requests: Mutex<Vec<SeriesRequest>>,
}

#[async_trait]
impl HistoricalSeriesSource for FakeSeriesSource {
    async fn historical_series(
        &self,
        request: &SeriesRequest,
    ) -> Result<Vec<PricePoint>, AppError> {
        self.requests.lock().push(request.clone());
        Ok(self.points.clone())
    }
}

#[derive(Debug, Default)]
pub(crate) struct CountingRefresh {
    count: AtomicUsize,
}

impl CountingRefresh {
    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl RefreshTrigger for CountingRefresh {
    fn request_refresh(&self) -> bool {
        self.count.fetch_add(1, Ordering::SeqCst);
        true
    }
}
