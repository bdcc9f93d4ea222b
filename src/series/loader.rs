use crate::error::AppError;
use crate::replay::api::HistoricalSeriesSource;
use crate::replay::types::ReplayState;
use crate::series::alignment::{
    align, filter_window, replay_series_count, sanitize_series, AlignmentResult, WindowBounds,
};
use crate::series::types::{trade_events_from_records, ChartArgs, PricePoint, SeriesTimeframe};
use crate::session::protocol::TradeRecord;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AlignedChart {
    pub symbol: String,
    pub market: String,
    pub timeframe: SeriesTimeframe,
    pub requested_count: u16,
    pub window: Option<WindowBounds>,
    pub points: Vec<PricePoint>,
    pub markers: AlignmentResult,
}

/// Fetches a series, clips it to the replay clock and lays the account's trades over it.
#[derive(Clone)]
pub struct SeriesService {
    source: Arc<dyn HistoricalSeriesSource>,
    lookback_days: u32,
}

impl std::fmt::Debug for SeriesService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeriesService")
            .field("lookback_days", &self.lookback_days)
            .finish_non_exhaustive()
    }
}

impl SeriesService {
    pub fn new(source: Arc<dyn HistoricalSeriesSource>, lookback_days: u32) -> Self {
        Self {
            source,
            lookback_days,
        }
    }

    /// An explicit `count` wins; during replay the count otherwise follows the clock.
    pub async fn load(
        &self,
        args: ChartArgs,
        clock: &ReplayState,
        trades: &[TradeRecord],
    ) -> Result<AlignedChart, AppError> {
        let explicit_count = args.count.is_some();
        let mut request = args.normalize()?;
        if !explicit_count {
            if let Some(count) = replay_series_count(clock, request.timeframe) {
                request.count = count;
            }
        }

        let raw = self.source.historical_series(&request).await?;
        let fetched = raw.len();
        let series = sanitize_series(raw);
        let window = WindowBounds::from_clock(clock);
        let points = filter_window(&series, window, self.lookback_days);

        let events = trade_events_from_records(trades);
        let markers = align(&points, &events, &request.symbol);

        debug!(
            symbol = %request.symbol,
            timeframe = request.timeframe.as_str(),
            fetched,
            visible = points.len(),
            markers = markers.len(),
            "chart aligned"
        );

        Ok(AlignedChart {
            symbol: request.symbol,
            market: request.market,
            timeframe: request.timeframe,
            requested_count: request.count,
            window,
            points,
            markers,
        })
    }
}
