use crate::error::AppError;
use crate::replay::persistence::{get_replay_preferences, save_replay_preferences};
use crate::replay::types::{ReplayPreferencesSnapshot, SaveReplayPreferencesArgs};
use crate::state::AppState;

pub async fn replay_preferences_get(
    state: &AppState,
) -> Result<ReplayPreferencesSnapshot, AppError> {
    get_replay_preferences(&state.db_pool).await
}

pub async fn replay_preferences_save(
    state: &AppState,
    args: SaveReplayPreferencesArgs,
) -> Result<ReplayPreferencesSnapshot, AppError> {
    save_replay_preferences(&state.db_pool, args).await
}
