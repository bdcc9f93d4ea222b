use crate::error::AppError;
use crate::replay::persistence::get_replay_preferences;
use crate::series::types::ChartArgs;
use crate::series::AlignedChart;
use crate::state::AppState;

/// Missing chart selection falls back to the stored preferences.
pub async fn load_chart(
    state: &AppState,
    args: Option<ChartArgs>,
) -> Result<AlignedChart, AppError> {
    let mut args = args.unwrap_or_default();
    if args.symbol.is_none() || args.market.is_none() || args.timeframe.is_none() {
        let preferences = get_replay_preferences(&state.db_pool).await?;
        args.symbol.get_or_insert(preferences.symbol);
        args.market.get_or_insert(preferences.market);
        args.timeframe.get_or_insert(preferences.timeframe);
    }

    let clock = state.replay.clock();
    let trades = state.reconciler.trades();
    state.series.load(args, &clock, &trades).await
}
