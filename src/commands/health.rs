use crate::replay::types::ReplayPhase;
use crate::session::ConnectionState;
use crate::{error::AppError, state::AppState};
use serde::Serialize;
use sqlx::SqlitePool;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub db: &'static str,
    pub connection: ConnectionState,
    pub replay_phase: ReplayPhase,
}

pub async fn build_health_response(
    started_at: Instant,
    pool: &SqlitePool,
    connection: ConnectionState,
    replay_phase: ReplayPhase,
) -> HealthResponse {
    let db_status = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(pool)
        .await
    {
        Ok(_) => "ok",
        Err(_) => "error",
    };

    HealthResponse {
        status: if db_status == "ok" { "ok" } else { "degraded" },
        uptime_ms: started_at.elapsed().as_millis(),
        db: db_status,
        connection,
        replay_phase,
    }
}

pub async fn health(state: &AppState) -> Result<HealthResponse, AppError> {
    Ok(build_health_response(
        state.started_at,
        &state.db_pool,
        state.connection.state(),
        state.replay.phase(),
    )
    .await)
}
