use crate::error::AppError;
use crate::replay::types::{
    format_timestamp, ReplayPreferencesSnapshot, SaveReplayPreferencesArgs,
    DEFAULT_SPEED_MULTIPLIER, DEFAULT_TRADING_INTERVAL,
};
use crate::series::types::{SeriesTimeframe, DEFAULT_MARKET, DEFAULT_SYMBOL, DEFAULT_TIMEFRAME};
use sqlx::{Row, SqlitePool};
use std::time::{SystemTime, UNIX_EPOCH};

fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}

fn map_preferences_row(
    row: &sqlx::sqlite::SqliteRow,
) -> Result<ReplayPreferencesSnapshot, AppError> {
    let timeframe_raw: String = row.try_get("timeframe")?;
    let interval_days: i64 = row.try_get("trading_interval_days")?;

    Ok(ReplayPreferencesSnapshot {
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        speed_multiplier: row.try_get("speed_multiplier")?,
        trading_interval_days: u32::try_from(interval_days).map_err(|_| {
            AppError::InvalidArgument(format!("stored interval {interval_days} is invalid"))
        })?,
        symbol: row.try_get("symbol")?,
        market: row.try_get("market")?,
        timeframe: SeriesTimeframe::parse_str(&timeframe_raw)?,
        updated_at_ms: row.try_get("updated_at_ms")?,
    })
}

async fn ensure_replay_preferences_seed(pool: &SqlitePool) -> Result<(), AppError> {
    sqlx::query(
        "INSERT OR IGNORE INTO replay_preferences (id, start_date, end_date, speed_multiplier, trading_interval_days, symbol, market, timeframe, updated_at_ms) \
         VALUES (1, NULL, NULL, ?, ?, ?, ?, ?, ?)",
    )
    .bind(DEFAULT_SPEED_MULTIPLIER)
    .bind(i64::from(DEFAULT_TRADING_INTERVAL.days()))
    .bind(DEFAULT_SYMBOL)
    .bind(DEFAULT_MARKET)
    .bind(DEFAULT_TIMEFRAME.as_str())
    .bind(now_unix_ms())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_replay_preferences(
    pool: &SqlitePool,
) -> Result<ReplayPreferencesSnapshot, AppError> {
    ensure_replay_preferences_seed(pool).await?;

    let row = sqlx::query(
        "SELECT start_date, end_date, speed_multiplier, trading_interval_days, symbol, market, timeframe, updated_at_ms \
         FROM replay_preferences WHERE id = 1",
    )
    .fetch_one(pool)
    .await?;

    map_preferences_row(&row)
}

pub async fn save_replay_preferences(
    pool: &SqlitePool,
    args: SaveReplayPreferencesArgs,
) -> Result<ReplayPreferencesSnapshot, AppError> {
    let normalized = args.normalize()?;

    sqlx::query(
        "INSERT INTO replay_preferences (id, start_date, end_date, speed_multiplier, trading_interval_days, symbol, market, timeframe, updated_at_ms) \
         VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET \
           start_date=excluded.start_date, \
           end_date=excluded.end_date, \
           speed_multiplier=excluded.speed_multiplier, \
           trading_interval_days=excluded.trading_interval_days, \
           symbol=excluded.symbol, \
           market=excluded.market, \
           timeframe=excluded.timeframe, \
           updated_at_ms=excluded.updated_at_ms",
    )
    .bind(normalized.start_date.map(format_timestamp))
    .bind(normalized.end_date.map(format_timestamp))
    .bind(normalized.speed_multiplier)
    .bind(i64::from(normalized.interval.days()))
    .bind(normalized.symbol)
    .bind(normalized.market)
    .bind(normalized.timeframe.as_str())
    .bind(now_unix_ms())
    .execute(pool)
    .await?;

    get_replay_preferences(pool).await
}
