use crate::config::ReplayTiming;
use crate::error::{AppError, ErrorKind};
use crate::replay::api::ReplayApi;
use crate::replay::types::{
    parse_timestamp, AutoAdvancePlan, ReplayPhase, ReplayState, StartReplayArgs,
    StartReplayRequest,
};
use crate::scheduler::{Scheduler, TimerHandle};
use crate::session::reconciler::RefreshTrigger;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimerDirective {
    #[default]
    Keep,
    /// Cancel whatever is armed and arm this plan.
    Arm(AutoAdvancePlan),
    Disarm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Transition {
    pub timer: TimerDirective,
    pub phase_changed: bool,
    pub finished: bool,
}

/// Pure Idle/Configuring/Active state machine mirroring the server clock.
/// Timers and network calls live in [`ReplayController`].
#[derive(Debug, Clone)]
pub struct ClockMachine {
    phase: ReplayPhase,
    clock: ReplayState,
    armed: Option<AutoAdvancePlan>,
    finished_emitted: bool,
}

impl Default for ClockMachine {
    fn default() -> Self {
        Self {
            phase: ReplayPhase::Idle,
            clock: ReplayState::inactive(),
            armed: None,
            finished_emitted: false,
        }
    }
}

impl ClockMachine {
    pub fn phase(&self) -> ReplayPhase {
        self.phase
    }

    pub fn clock(&self) -> &ReplayState {
        &self.clock
    }

    pub fn armed(&self) -> Option<AutoAdvancePlan> {
        self.armed
    }

    pub fn configure(&mut self) -> Result<Transition, AppError> {
        match self.phase {
            ReplayPhase::Idle => {
                self.phase = ReplayPhase::Configuring;
                Ok(Transition {
                    phase_changed: true,
                    ..Default::default()
                })
            }
            ReplayPhase::Configuring => Ok(Transition::default()),
            ReplayPhase::Active => Err(AppError::InvalidArgument(
                "replay is already active".to_string(),
            )),
        }
    }

    pub fn cancel_configure(&mut self) -> Transition {
        if self.phase != ReplayPhase::Configuring {
            return Transition::default();
        }
        self.phase = ReplayPhase::Idle;
        Transition {
            phase_changed: true,
            ..Default::default()
        }
    }

    /// Enters Active after a successful start. `reported` is the server echo, if any.
    pub fn activate(
        &mut self,
        request: &StartReplayRequest,
        reported: Option<ReplayState>,
    ) -> Transition {
        let mut transition = Transition {
            phase_changed: self.phase != ReplayPhase::Active,
            ..Default::default()
        };

        let clock = match reported {
            Some(state) if state.active => state,
            _ => ReplayState {
                active: true,
                window: Some(request.window),
                current: Some(request.window.start),
                speed_multiplier: request.speed_multiplier,
                interval: request.interval,
                progress: Some(0.0),
            },
        };

        self.phase = ReplayPhase::Active;
        self.clock = ReplayState {
            speed_multiplier: request.speed_multiplier,
            interval: request.interval,
            ..clock
        };
        self.finished_emitted = false;
        self.armed = None;
        self.sync_timer(&mut transition);
        transition
    }

    pub fn observe(&mut self, reported: ReplayState) -> Transition {
        let mut transition = Transition::default();

        if !reported.active {
            if self.phase == ReplayPhase::Active {
                self.phase = ReplayPhase::Idle;
                transition.phase_changed = true;
            }
            self.clock = ReplayState::inactive();
            self.finished_emitted = false;
            if self.armed.take().is_some() {
                transition.timer = TimerDirective::Disarm;
            }
            return transition;
        }

        let same_window = self.clock.active && self.clock.window == reported.window;
        let mut next = reported;
        if same_window {
            if let (Some(previous), Some(current)) = (self.clock.current, next.current) {
                if current < previous {
                    tracing::debug!(%previous, %current, "ignoring regressing replay clock");
                    next.current = Some(previous);
                }
            }
        } else {
            self.finished_emitted = false;
        }
        if let (Some(window), Some(current)) = (next.window, next.current) {
            next.progress = Some(window.progress_percent(current));
        }

        if self.phase != ReplayPhase::Active {
            self.phase = ReplayPhase::Active;
            transition.phase_changed = true;
        }
        self.clock = next;
        self.sync_timer(&mut transition);
        transition
    }

    /// Folds the `current_date` returned by an advance into the mirror.
    pub fn apply_advance(&mut self, current: DateTime<Utc>) -> Transition {
        let mut transition = Transition::default();
        if self.phase != ReplayPhase::Active || !self.clock.active {
            return transition;
        }
        if self.clock.current.is_some_and(|previous| current <= previous) {
            return transition;
        }

        self.clock.current = Some(current);
        self.clock.progress = self
            .clock
            .window
            .map(|window| window.progress_percent(current));
        self.sync_timer(&mut transition);
        transition
    }

    pub fn reset(&mut self) -> Transition {
        let transition = Transition {
            phase_changed: self.phase != ReplayPhase::Idle,
            timer: if self.armed.take().is_some() {
                TimerDirective::Disarm
            } else {
                TimerDirective::Keep
            },
            finished: false,
        };
        self.phase = ReplayPhase::Idle;
        self.clock = ReplayState::inactive();
        self.finished_emitted = false;
        transition
    }

    fn sync_timer(&mut self, transition: &mut Transition) {
        if self.clock.is_finished() {
            if self.armed.take().is_some() {
                transition.timer = TimerDirective::Disarm;
            }
            if !self.finished_emitted {
                self.finished_emitted = true;
                transition.finished = true;
            }
            return;
        }

        let plan = AutoAdvancePlan::new(self.clock.speed_multiplier, self.clock.interval);
        if self.armed != Some(plan) {
            self.armed = Some(plan);
            transition.timer = TimerDirective::Arm(plan);
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplayStatusSnapshot {
    pub phase: ReplayPhase,
    pub state: ReplayState,
    pub progress: Option<f64>,
    pub auto_advance_period_ms: Option<u64>,
    pub auto_advance_step_seconds: Option<i64>,
    pub finished: bool,
    pub consecutive_poll_failures: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ReplayEvent {
    StateChanged(ReplayStatusSnapshot),
    Finished,
    /// Transient, user-facing notification.
    Notice(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Succeeded { active: bool },
    Failed,
    Skipped,
}

/// Clears the in-flight flag when the poll future completes or is dropped.
struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

struct ControllerInner {
    api: Arc<dyn ReplayApi>,
    refresh: Arc<dyn RefreshTrigger>,
    timing: ReplayTiming,
    scheduler: Scheduler,
    machine: Mutex<ClockMachine>,
    poll_in_flight: AtomicBool,
    consecutive_poll_failures: AtomicU32,
    last_error: Mutex<Option<String>>,
    auto_advance: Mutex<Option<TimerHandle>>,
    poll_loop: Mutex<Option<TimerHandle>>,
    events: broadcast::Sender<ReplayEvent>,
}

#[derive(Clone)]
pub struct ReplayController {
    inner: Arc<ControllerInner>,
}

impl std::fmt::Debug for ReplayController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayController")
            .field("machine", &*self.inner.machine.lock())
            .finish_non_exhaustive()
    }
}

impl ReplayController {
    pub fn new(
        api: Arc<dyn ReplayApi>,
        refresh: Arc<dyn RefreshTrigger>,
        timing: ReplayTiming,
        event_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            inner: Arc::new(ControllerInner {
                api,
                refresh,
                timing,
                scheduler: Scheduler::new(),
                machine: Mutex::new(ClockMachine::default()),
                poll_in_flight: AtomicBool::new(false),
                consecutive_poll_failures: AtomicU32::new(0),
                last_error: Mutex::new(None),
                auto_advance: Mutex::new(None),
                poll_loop: Mutex::new(None),
                events,
            }),
        }
    }

    fn from_inner(inner: Arc<ControllerInner>) -> Self {
        Self { inner }
    }

    fn downgrade(&self) -> Weak<ControllerInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReplayEvent> {
        self.inner.events.subscribe()
    }

    pub fn phase(&self) -> ReplayPhase {
        self.inner.machine.lock().phase()
    }

    pub fn clock(&self) -> ReplayState {
        self.inner.machine.lock().clock().clone()
    }

    pub fn status(&self) -> ReplayStatusSnapshot {
        let machine = self.inner.machine.lock();
        let plan = machine.armed();
        ReplayStatusSnapshot {
            phase: machine.phase(),
            state: machine.clock().clone(),
            progress: machine.clock().progress_percent(),
            auto_advance_period_ms: plan.map(|plan| plan.period.as_millis() as u64),
            auto_advance_step_seconds: plan.map(|plan| plan.step_seconds),
            finished: machine.clock().is_finished(),
            consecutive_poll_failures: self
                .inner
                .consecutive_poll_failures
                .load(Ordering::Relaxed),
            last_error: self.inner.last_error.lock().clone(),
        }
    }

    pub fn configure(&self) -> Result<ReplayStatusSnapshot, AppError> {
        let transition = self.inner.machine.lock().configure()?;
        self.apply_transition(transition);
        Ok(self.status())
    }

    pub fn cancel_configuration(&self) -> ReplayStatusSnapshot {
        let transition = self.inner.machine.lock().cancel_configure();
        self.apply_transition(transition);
        self.status()
    }

    /// Fetches the server clock once. A poll already in flight makes this a no-op.
    pub async fn poll(&self) -> PollOutcome {
        let Some(_guard) = InFlightGuard::acquire(&self.inner.poll_in_flight) else {
            tracing::debug!("replay poll already in flight, skipping");
            return PollOutcome::Skipped;
        };
        if self.inner.scheduler.is_disposed() {
            return PollOutcome::Skipped;
        }

        let result = self.inner.api.replay_state().await;
        if self.inner.scheduler.is_disposed() {
            return PollOutcome::Skipped;
        }

        match result {
            Ok(reported) => {
                self.inner
                    .consecutive_poll_failures
                    .store(0, Ordering::Relaxed);
                let active = reported.active;
                let transition = self.inner.machine.lock().observe(reported);
                self.apply_transition(transition);
                if active {
                    self.inner.refresh.request_refresh();
                }
                PollOutcome::Succeeded { active }
            }
            Err(error) => {
                let failures = self
                    .inner
                    .consecutive_poll_failures
                    .fetch_add(1, Ordering::Relaxed)
                    .saturating_add(1);
                tracing::warn!(error = %error, failures, "replay state poll failed");
                *self.inner.last_error.lock() = Some(error.to_string());
                PollOutcome::Failed
            }
        }
    }

    /// Steady polling: immediately, then every poll interval, or the backoff
    /// interval after a failure. Idempotent while the loop is alive.
    pub fn spawn_poll_loop(&self) {
        let mut slot = self.inner.poll_loop.lock();
        if slot.as_ref().is_some_and(|timer| !timer.is_finished()) {
            return;
        }

        let weak = self.downgrade();
        let timing = self.inner.timing;
        let timer = self.inner.scheduler.repeat(Duration::ZERO, move || {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return timing.poll_interval;
                };
                match ReplayController::from_inner(inner).poll().await {
                    PollOutcome::Failed => timing.poll_backoff,
                    PollOutcome::Succeeded { .. } | PollOutcome::Skipped => timing.poll_interval,
                }
            }
        });
        *slot = Some(timer);
    }

    pub async fn start(&self, args: StartReplayArgs) -> Result<ReplayStatusSnapshot, AppError> {
        let request = args.normalize()?;

        let response = self
            .inner
            .api
            .start_replay(&request)
            .await
            .map_err(|error| self.report(error))?;
        if !response.success {
            let reason = response
                .message
                .unwrap_or_else(|| "replay start rejected".to_string());
            return Err(self.report(AppError::Rejected(reason)));
        }

        if !self.inner.scheduler.sleep(self.inner.timing.settle_delay).await {
            return Ok(self.status());
        }

        let reported = response
            .state
            .and_then(|wire| ReplayState::try_from(wire).ok());
        let transition = self.inner.machine.lock().activate(&request, reported);
        tracing::info!(
            start = %request.window.start,
            end = %request.window.end,
            speed = request.speed_multiplier,
            interval_days = request.interval.days(),
            "replay started"
        );
        self.apply_transition(transition);

        self.poll().await;
        Ok(self.status())
    }

    pub async fn stop(&self) -> Result<ReplayStatusSnapshot, AppError> {
        let response = self
            .inner
            .api
            .stop_replay()
            .await
            .map_err(|error| self.report(error))?;
        if self.inner.scheduler.is_disposed() {
            return Ok(self.status());
        }
        if !response.success {
            let reason = response
                .message
                .unwrap_or_else(|| "replay stop rejected".to_string());
            return Err(self.report(AppError::Rejected(reason)));
        }

        let transition = self.inner.machine.lock().reset();
        tracing::info!("replay stopped");
        self.apply_transition(transition);
        self.schedule_refresh();
        Ok(self.status())
    }

    /// Asks the server to move the clock `seconds` forward (scaled server-side by
    /// the speed multiplier), then re-polls and schedules a delayed refresh.
    pub async fn advance(&self, seconds: i64) -> Result<ReplayStatusSnapshot, AppError> {
        if seconds <= 0 {
            return Err(AppError::InvalidArgument(
                "advance seconds must be positive".to_string(),
            ));
        }

        let response = self
            .inner
            .api
            .advance_replay(seconds)
            .await
            .map_err(|error| self.report(error))?;
        if self.inner.scheduler.is_disposed() {
            return Ok(self.status());
        }
        if !response.success {
            let reason = response
                .message
                .unwrap_or_else(|| "replay advance rejected".to_string());
            return Err(self.report(AppError::Rejected(reason)));
        }

        if let Some(current) = response
            .current_date
            .as_deref()
            .and_then(|raw| parse_timestamp(raw).ok())
        {
            let transition = self.inner.machine.lock().apply_advance(current);
            self.apply_transition(transition);
        }

        self.poll().await;
        self.schedule_refresh();
        Ok(self.status())
    }

    /// Cancels every timer; calls resolving afterwards leave no trace.
    pub fn dispose(&self) {
        self.inner.scheduler.dispose();
        if let Some(timer) = self.inner.auto_advance.lock().take() {
            timer.cancel();
        }
        if let Some(timer) = self.inner.poll_loop.lock().take() {
            timer.cancel();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.scheduler.is_disposed()
    }

    fn apply_transition(&self, transition: Transition) {
        match transition.timer {
            TimerDirective::Keep => {}
            TimerDirective::Arm(plan) => self.arm_auto_advance(plan),
            TimerDirective::Disarm => self.disarm_auto_advance(),
        }

        let status = self.status();
        if transition.phase_changed {
            tracing::info!(phase = ?status.phase, "replay phase changed");
        }
        let _ = self.inner.events.send(ReplayEvent::StateChanged(status));

        if transition.finished {
            tracing::info!("replay reached end of window");
            let _ = self.inner.events.send(ReplayEvent::Finished);
        }
    }

    fn arm_auto_advance(&self, plan: AutoAdvancePlan) {
        let weak = self.downgrade();
        let step_seconds = plan.step_seconds;
        let timer = self.inner.scheduler.every(plan.period, move || {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if let Err(error) = ReplayController::from_inner(inner)
                    .advance(step_seconds)
                    .await
                {
                    tracing::debug!(error = %error, "auto-advance tick failed");
                }
            }
        });

        if let Some(previous) = self.inner.auto_advance.lock().replace(timer) {
            previous.cancel();
        }
        tracing::info!(
            period_ms = plan.period.as_millis() as u64,
            step_seconds,
            "auto-advance armed"
        );
    }

    fn disarm_auto_advance(&self) {
        if let Some(timer) = self.inner.auto_advance.lock().take() {
            timer.cancel();
            tracing::info!("auto-advance disarmed");
        }
    }

    fn schedule_refresh(&self) {
        let weak = self.downgrade();
        // Dropping the handle detaches the timer; disposal still cancels it.
        let _ = self
            .inner
            .scheduler
            .after(self.inner.timing.refresh_delay, async move {
                if let Some(inner) = weak.upgrade() {
                    inner.refresh.request_refresh();
                }
            });
    }

    fn report(&self, error: AppError) -> AppError {
        tracing::warn!(error = %error, "replay request failed");
        *self.inner.last_error.lock() = Some(error.to_string());
        if error.kind() == ErrorKind::Request || error.kind() == ErrorKind::Transport {
            let _ = self.inner.events.send(ReplayEvent::Notice(error.to_string()));
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::testing::{CountingRefresh, FakeReplayServer};
    use crate::replay::types::{ReplayWindow, TradingInterval};

    fn at(value: &str) -> DateTime<Utc> {
        parse_timestamp(value).expect("fixture timestamp should parse")
    }

    fn args(start: &str, end: &str, speed: f64, interval_days: u32) -> StartReplayArgs {
        StartReplayArgs {
            start_date: Some(start.to_string()),
            end_date: Some(end.to_string()),
            speed_multiplier: Some(speed),
            trading_interval_days: Some(interval_days),
        }
    }

    fn controller(
        server: &Arc<FakeReplayServer>,
        refresh: &Arc<CountingRefresh>,
    ) -> ReplayController {
        ReplayController::new(
            Arc::clone(server) as Arc<dyn ReplayApi>,
            Arc::clone(refresh) as Arc<dyn RefreshTrigger>,
            ReplayTiming::default(),
            4_096,
        )
    }

    fn active_state(current: &str) -> ReplayState {
        let window = ReplayWindow::new(at("2024-01-01"), at("2024-01-11"))
            .expect("fixture window should be valid");
        ReplayState {
            active: true,
            window: Some(window),
            current: Some(at(current)),
            speed_multiplier: 1.0,
            interval: TradingInterval::Daily,
            progress: None,
        }
    }

    #[test]
    fn machine_moves_through_configuring() {
        let mut machine = ClockMachine::default();
        assert!(machine.configure().expect("idle can configure").phase_changed);
        assert_eq!(machine.phase(), ReplayPhase::Configuring);
        assert!(machine.cancel_configure().phase_changed);
        assert_eq!(machine.phase(), ReplayPhase::Idle);
        assert_eq!(machine.cancel_configure(), Transition::default());
    }

    #[test]
    fn machine_adopts_server_clock_and_ignores_regression() {
        let mut machine = ClockMachine::default();
        let adopted = machine.observe(active_state("2024-01-05"));
        assert!(adopted.phase_changed);
        assert!(matches!(adopted.timer, TimerDirective::Arm(_)));

        let regressed = machine.observe(active_state("2024-01-03"));
        assert_eq!(regressed.timer, TimerDirective::Keep);
        assert_eq!(machine.clock().current, Some(at("2024-01-05")));
        assert_eq!(machine.clock().progress_percent(), Some(40.0));
    }

    #[test]
    fn machine_derives_progress_from_reported_clock() {
        let mut machine = ClockMachine::default();
        let mut reported = active_state("2024-01-05");
        reported.progress = Some(90.0);

        machine.observe(reported);
        assert_eq!(machine.clock().progress, Some(40.0));

        let mut moved = active_state("2024-01-06");
        moved.progress = Some(5.0);
        machine.observe(moved);
        assert_eq!(machine.clock().progress_percent(), Some(50.0));
    }

    #[test]
    fn machine_treats_inactive_report_as_completion() {
        let mut machine = ClockMachine::default();
        machine.observe(active_state("2024-01-02"));

        let completed = machine.observe(ReplayState::inactive());
        assert!(completed.phase_changed);
        assert_eq!(completed.timer, TimerDirective::Disarm);
        assert_eq!(machine.phase(), ReplayPhase::Idle);
    }

    #[test]
    fn machine_finishes_once_at_window_end() {
        let mut machine = ClockMachine::default();
        machine.observe(active_state("2024-01-10"));

        let finished = machine.apply_advance(at("2024-01-11"));
        assert!(finished.finished);
        assert_eq!(finished.timer, TimerDirective::Disarm);
        assert!(machine.armed().is_none());

        let again = machine.observe(active_state("2024-01-11"));
        assert!(!again.finished);
        assert_eq!(again.timer, TimerDirective::Keep);
    }

    #[test]
    fn machine_refuses_configure_while_active() {
        let mut machine = ClockMachine::default();
        machine.observe(active_state("2024-01-02"));
        assert!(machine.configure().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn valid_start_then_poll_reports_active() {
        let server = Arc::new(FakeReplayServer::default());
        let refresh = Arc::new(CountingRefresh::default());
        let controller = controller(&server, &refresh);

        let status = controller
            .start(args("2024-01-01", "2024-01-31", 1.0, 1))
            .await
            .expect("start should succeed");

        assert_eq!(status.phase, ReplayPhase::Active);
        assert!(status.state.active);
        assert_eq!(server.start_calls(), 1);
        assert_eq!(server.state_calls(), 1);
        assert_eq!(refresh.count(), 1);
        controller.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_window_never_reaches_network() {
        let server = Arc::new(FakeReplayServer::default());
        let refresh = Arc::new(CountingRefresh::default());
        let controller = controller(&server, &refresh);

        let result = controller
            .start(args("2024-02-01", "2024-01-01", 1.0, 1))
            .await;

        assert!(matches!(result, Err(AppError::InvalidWindow(_))));
        assert_eq!(server.start_calls(), 0);
        assert_eq!(controller.phase(), ReplayPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_polls_make_one_call() {
        let server = Arc::new(FakeReplayServer::default());
        server.set_state_latency(Duration::from_secs(1));
        let refresh = Arc::new(CountingRefresh::default());
        let controller = controller(&server, &refresh);

        let (first, second) = tokio::join!(controller.poll(), controller.poll());

        assert_eq!(first, PollOutcome::Succeeded { active: false });
        assert_eq!(second, PollOutcome::Skipped);
        assert_eq!(server.state_calls(), 1);

        assert_eq!(controller.poll().await, PollOutcome::Succeeded { active: false });
        assert_eq!(server.state_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_loop_backs_off_after_failure() {
        let server = Arc::new(FakeReplayServer::default());
        server.set_failing(true);
        let refresh = Arc::new(CountingRefresh::default());
        let controller = controller(&server, &refresh);

        controller.spawn_poll_loop();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(server.state_calls(), 1);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(server.state_calls(), 1);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(server.state_calls(), 2);
        assert_eq!(controller.status().consecutive_poll_failures, 2);

        server.set_failing(false);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(server.state_calls(), 3);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(server.state_calls(), 4);
        assert_eq!(controller.status().consecutive_poll_failures, 0);

        controller.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn speed_change_rearms_without_double_firing() {
        let server = Arc::new(FakeReplayServer::default());
        let refresh = Arc::new(CountingRefresh::default());
        let controller = controller(&server, &refresh);

        let status = controller
            .start(args("2020-01-01", "2023-12-31", 2.0, 7))
            .await
            .expect("start should succeed");
        assert_eq!(status.auto_advance_period_ms, Some(302_400));

        server.set_speed(1.0);
        controller.poll().await;
        assert_eq!(controller.status().auto_advance_period_ms, Some(604_800));

        tokio::time::sleep(Duration::from_millis(604_000)).await;
        assert_eq!(server.advance_calls(), 0);

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(server.advance_calls(), 1);
        controller.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_returns_to_idle_and_refreshes_later() {
        let server = Arc::new(FakeReplayServer::default());
        let refresh = Arc::new(CountingRefresh::default());
        let controller = controller(&server, &refresh);

        controller
            .start(args("2024-01-01", "2024-03-01", 1.0, 1))
            .await
            .expect("start should succeed");
        let refreshes_after_start = refresh.count();

        let status = controller.stop().await.expect("stop should succeed");
        assert_eq!(server.stop_calls(), 1);
        assert_eq!(status.phase, ReplayPhase::Idle);
        assert_eq!(status.auto_advance_period_ms, None);
        assert_eq!(status.state, ReplayState::inactive());
        assert_eq!(refresh.count(), refreshes_after_start);

        tokio::time::sleep(Duration::from_millis(501)).await;
        assert_eq!(refresh.count(), refreshes_after_start + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_advance_leaves_state_unchanged() {
        let server = Arc::new(FakeReplayServer::default());
        let refresh = Arc::new(CountingRefresh::default());
        let controller = controller(&server, &refresh);
        let mut events = controller.subscribe();

        let result = controller.advance(86_400).await;

        assert!(matches!(result, Err(AppError::Rejected(_))));
        assert_eq!(controller.phase(), ReplayPhase::Idle);
        let mut saw_notice = false;
        while let Ok(event) = events.try_recv() {
            saw_notice |= matches!(event, ReplayEvent::Notice(_));
        }
        assert!(saw_notice);
    }

    #[tokio::test(start_paused = true)]
    async fn server_side_completion_returns_to_idle() {
        let server = Arc::new(FakeReplayServer::default());
        let refresh = Arc::new(CountingRefresh::default());
        let controller = controller(&server, &refresh);

        controller
            .start(args("2024-01-01", "2024-03-01", 1.0, 1))
            .await
            .expect("start should succeed");
        server.end_replay();

        assert_eq!(
            controller.poll().await,
            PollOutcome::Succeeded { active: false }
        );
        assert_eq!(controller.phase(), ReplayPhase::Idle);
        assert_eq!(controller.status().auto_advance_period_ms, None);
    }

    #[tokio::test(start_paused = true)]
    async fn thirty_day_replay_reaches_end_with_monotonic_progress() {
        let server = Arc::new(FakeReplayServer::default());
        let refresh = Arc::new(CountingRefresh::default());
        let controller = controller(&server, &refresh);
        let mut events = controller.subscribe();

        controller
            .start(args("2024-01-01T00:00:00Z", "2024-01-31T00:00:00Z", 1.0, 1))
            .await
            .expect("start should succeed");
        controller.spawn_poll_loop();

        // 30 daily steps at 86.4 s each, plus slack.
        tokio::time::sleep(Duration::from_secs(2_700)).await;

        let mut progress = Vec::new();
        let mut finished_events = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                ReplayEvent::StateChanged(status) => progress.extend(status.progress),
                ReplayEvent::Finished => finished_events += 1,
                ReplayEvent::Notice(_) => {}
            }
        }

        assert_eq!(server.advance_calls(), 30);
        assert_eq!(finished_events, 1);
        assert!(progress.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(progress.first().copied(), Some(0.0));
        assert_eq!(progress.last().copied(), Some(100.0));

        let status = controller.status();
        assert!(status.finished);
        assert_eq!(status.state.current, Some(at("2024-01-31T00:00:00Z")));
        assert_eq!(status.auto_advance_period_ms, None);
        controller.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_stops_auto_advance() {
        let server = Arc::new(FakeReplayServer::default());
        let refresh = Arc::new(CountingRefresh::default());
        let controller = controller(&server, &refresh);

        controller
            .start(args("2024-01-01", "2024-12-31", 1.0, 1))
            .await
            .expect("start should succeed");
        controller.dispose();

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(server.advance_calls(), 0);
        assert!(controller.is_disposed());
    }
}
