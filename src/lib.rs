pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod replay;
pub mod scheduler;
pub mod series;
pub mod session;
pub mod state;

use config::RuntimeConfig;
use db::initialize_pool;
use error::AppError;
use replay::ReplayEvent;
use state::AppState;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

/// Headless runtime: opens the push session, follows the replay clock and logs
/// what a UI would display until ctrl-c.
pub async fn run(config: RuntimeConfig) -> Result<(), AppError> {
    let db_pool = initialize_pool(&config).await?;
    let state = AppState::new(config, db_pool)?;

    tracing::info!(
        http_url = %state.config.http_url,
        ws_url = %state.config.ws_url,
        username = %state.config.username,
        "replay dashboard starting"
    );

    commands::session::connect_session(&state).await?;
    state.replay.spawn_poll_loop();

    let shutdown = CancellationToken::new();
    let notices = tokio::spawn(log_replay_events(
        state.replay.subscribe(),
        shutdown.clone(),
    ));

    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %error, "failed to listen for ctrl-c, shutting down");
    }

    tracing::info!("replay dashboard shutting down");
    shutdown.cancel();
    let _ = notices.await;
    state.shutdown().await;
    Ok(())
}

async fn log_replay_events(
    mut events: tokio::sync::broadcast::Receiver<ReplayEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(ReplayEvent::StateChanged(status)) => {
                tracing::debug!(
                    phase = ?status.phase,
                    progress = status.progress.unwrap_or_default(),
                    "replay state changed"
                );
            }
            Ok(ReplayEvent::Finished) => tracing::info!("replay reached the end of its window"),
            Ok(ReplayEvent::Notice(message)) => tracing::warn!(%message, "replay notice"),
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "replay event log lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
