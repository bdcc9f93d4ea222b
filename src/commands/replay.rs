use crate::error::AppError;
use crate::replay::persistence::{get_replay_preferences, save_replay_preferences};
use crate::replay::types::{ReplayPreferencesSnapshot, SaveReplayPreferencesArgs, StartReplayArgs};
use crate::replay::ReplayStatusSnapshot;
use crate::state::AppState;
use serde::Serialize;

/// What the Configuring step needs: the current phase plus the last used settings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayConfiguration {
    pub status: ReplayStatusSnapshot,
    pub preferences: ReplayPreferencesSnapshot,
}

pub async fn configure_replay(state: &AppState) -> Result<ReplayConfiguration, AppError> {
    let status = state.replay.configure()?;
    let preferences = get_replay_preferences(&state.db_pool).await?;
    Ok(ReplayConfiguration {
        status,
        preferences,
    })
}

pub async fn cancel_replay_configuration(
    state: &AppState,
) -> Result<ReplayStatusSnapshot, AppError> {
    Ok(state.replay.cancel_configuration())
}

pub async fn start_replay(
    state: &AppState,
    args: StartReplayArgs,
) -> Result<ReplayStatusSnapshot, AppError> {
    let request = args.clone().normalize()?;
    let status = state.replay.start(args).await?;

    let remembered = match get_replay_preferences(&state.db_pool).await {
        Ok(previous) => {
            save_replay_preferences(
                &state.db_pool,
                SaveReplayPreferencesArgs::from_started(&request, &previous),
            )
            .await
        }
        Err(error) => Err(error),
    };
    if let Err(error) = remembered {
        tracing::warn!(error = %error, "failed to remember replay settings");
    }

    Ok(status)
}

pub async fn stop_replay(state: &AppState) -> Result<ReplayStatusSnapshot, AppError> {
    state.replay.stop().await
}

pub async fn advance_replay(
    state: &AppState,
    seconds: i64,
) -> Result<ReplayStatusSnapshot, AppError> {
    state.replay.advance(seconds).await
}

pub async fn replay_status(state: &AppState) -> Result<ReplayStatusSnapshot, AppError> {
    Ok(state.replay.status())
}
