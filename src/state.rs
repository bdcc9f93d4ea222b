use crate::config::RuntimeConfig;
use crate::error::AppError;
use crate::replay::api::{HistoricalSeriesSource, HttpBackend, ReplayApi};
use crate::replay::ReplayController;
use crate::series::SeriesService;
use crate::session::{ConnectionManager, RefreshTrigger, SnapshotReconciler};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct SessionPumpHandle {
    pub cancellation_token: CancellationToken,
    pub join_handle: JoinHandle<()>,
}

pub struct AppState {
    pub started_at: Instant,
    pub config: RuntimeConfig,
    pub db_pool: SqlitePool,
    pub connection: ConnectionManager,
    pub reconciler: Arc<SnapshotReconciler>,
    pub replay: ReplayController,
    pub series: SeriesService,
    pub session_pump: Mutex<Option<SessionPumpHandle>>,
}

impl AppState {
    pub fn new(config: RuntimeConfig, db_pool: SqlitePool) -> Result<Self, AppError> {
        let backend = Arc::new(HttpBackend::new(config.http_url.clone())?);
        Ok(Self::with_backends(
            config,
            db_pool,
            backend.clone(),
            backend,
        ))
    }

    pub fn with_backends(
        config: RuntimeConfig,
        db_pool: SqlitePool,
        replay_api: Arc<dyn ReplayApi>,
        series_source: Arc<dyn HistoricalSeriesSource>,
    ) -> Self {
        let connection = ConnectionManager::new(config.connection());
        let reconciler = Arc::new(SnapshotReconciler::new(
            connection.handle(),
            config.event_capacity,
        ));
        let refresh: Arc<dyn RefreshTrigger> = reconciler.clone();
        let replay = ReplayController::new(
            replay_api,
            refresh,
            config.replay_timing(),
            config.event_capacity,
        );
        let series = SeriesService::new(series_source, config.lookback_days);

        Self {
            started_at: Instant::now(),
            config,
            db_pool,
            connection,
            reconciler,
            replay,
            series,
            session_pump: Mutex::new(None),
        }
    }

    /// Starts the reconciler pump if it is not already running.
    pub async fn ensure_session_pump(&self) {
        let mut pump = self.session_pump.lock().await;
        if pump
            .as_ref()
            .is_some_and(|handle| !handle.join_handle.is_finished())
        {
            return;
        }

        let cancellation_token = CancellationToken::new();
        let join_handle = self.reconciler.spawn_pump(cancellation_token.clone());
        *pump = Some(SessionPumpHandle {
            cancellation_token,
            join_handle,
        });
    }

    pub async fn stop_session_pump(&self) {
        let handle = self.session_pump.lock().await.take();
        if let Some(handle) = handle {
            handle.cancellation_token.cancel();
            if let Err(error) = handle.join_handle.await {
                tracing::warn!(error = %error, "session pump ended abnormally");
            }
        }
    }

    /// Tears down timers, the pump and the push connection.
    pub async fn shutdown(&self) {
        self.replay.dispose();
        self.stop_session_pump().await;
        self.connection.disconnect().await;
        self.db_pool.close().await;
    }
}
