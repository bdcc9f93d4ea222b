use crate::replay::types::{ReplayState, SECONDS_PER_DAY};
use crate::series::types::{MarkerChannel, PricePoint, SeriesTimeframe, TradeEvent, TradeSide};
use serde::Serialize;
use std::collections::BTreeMap;

pub const REPLAY_SERIES_BUFFER: i64 = 5;
pub const MIN_REPLAY_SERIES_COUNT: u16 = 20;
pub const MAX_REPLAY_SERIES_COUNT: u16 = 500;

/// Visible slice of the replay: `[start - lookback, current]`, unix seconds.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WindowBounds {
    pub start: i64,
    pub current: i64,
}

impl WindowBounds {
    pub fn from_clock(clock: &ReplayState) -> Option<Self> {
        if !clock.active {
            return None;
        }
        let window = clock.window?;
        let current = clock.current?;
        Some(Self {
            start: window.start.timestamp(),
            current: current.timestamp(),
        })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TradeMarker {
    pub trade_index: usize,
    pub point_index: usize,
    pub side: TradeSide,
    pub price: f64,
    pub quantity: f64,
    pub trade_time: i64,
}

/// Trades keyed by the price point they landed on. Colliding trades are all kept.
#[derive(Debug, Clone, Serialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AlignmentResult {
    pub buys: BTreeMap<usize, Vec<TradeMarker>>,
    pub sells: BTreeMap<usize, Vec<TradeMarker>>,
    pub by_trade: BTreeMap<usize, usize>,
}

impl AlignmentResult {
    pub fn point_for_trade(&self, trade_index: usize) -> Option<usize> {
        self.by_trade.get(&trade_index).copied()
    }

    pub fn len(&self) -> usize {
        self.by_trade.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_trade.is_empty()
    }
}

/// Drops invalid points, sorts ascending and keeps the first of any duplicate timestamp.
pub fn sanitize_series(mut points: Vec<PricePoint>) -> Vec<PricePoint> {
    points.retain(PricePoint::is_valid);
    points.sort_by_key(|point| point.timestamp);
    points.dedup_by_key(|point| point.timestamp);
    points
}

/// Outside replay the full series is returned.
pub fn filter_window(
    series: &[PricePoint],
    bounds: Option<WindowBounds>,
    lookback_days: u32,
) -> Vec<PricePoint> {
    let Some(bounds) = bounds else {
        return series.to_vec();
    };

    let lower = bounds
        .start
        .saturating_sub(i64::from(lookback_days) * SECONDS_PER_DAY);
    series
        .iter()
        .filter(|point| point.timestamp >= lower && point.timestamp <= bounds.current)
        .cloned()
        .collect()
}

/// Index of the point closest to `target`; ties go to the lowest index.
/// `series` must be ascending by timestamp.
pub fn nearest_index(series: &[PricePoint], target: i64) -> Option<usize> {
    let last = series.last()?;
    let first_at = |timestamp: i64| series.partition_point(|point| point.timestamp < timestamp);

    let after = first_at(target);
    if after == series.len() {
        return Some(first_at(last.timestamp));
    }
    if after == 0 {
        return Some(0);
    }

    let before_timestamp = series[after - 1].timestamp;
    let before_distance = target.abs_diff(before_timestamp);
    let after_distance = series[after].timestamp.abs_diff(target);
    if before_distance <= after_distance {
        Some(first_at(before_timestamp))
    } else {
        Some(after)
    }
}

pub fn align(series: &[PricePoint], trades: &[TradeEvent], symbol: &str) -> AlignmentResult {
    let mut result = AlignmentResult::default();

    for (trade_index, trade) in trades.iter().enumerate() {
        if !trade.symbol.eq_ignore_ascii_case(symbol) {
            continue;
        }
        let Some(point_index) = nearest_index(series, trade.trade_time) else {
            break;
        };

        let marker = TradeMarker {
            trade_index,
            point_index,
            side: trade.side,
            price: trade.price,
            quantity: trade.quantity,
            trade_time: trade.trade_time,
        };
        let channel = match trade.side.channel() {
            MarkerChannel::Buy => &mut result.buys,
            MarkerChannel::Sell => &mut result.sells,
        };
        channel.entry(point_index).or_default().push(marker);
        result.by_trade.insert(trade_index, point_index);
    }

    result
}

/// Candles needed to cover the replay from its start to the current clock, plus
/// a small buffer. `None` outside replay.
pub fn replay_series_count(clock: &ReplayState, timeframe: SeriesTimeframe) -> Option<u16> {
    let bounds = WindowBounds::from_clock(clock)?;
    let span = bounds.current.saturating_sub(bounds.start).max(0);
    let step = timeframe.duration_secs();
    let candles = span / step + 1 + REPLAY_SERIES_BUFFER;
    let clamped = candles.clamp(
        i64::from(MIN_REPLAY_SERIES_COUNT),
        i64::from(MAX_REPLAY_SERIES_COUNT),
    );
    u16::try_from(clamped).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::types::{parse_timestamp, ReplayWindow, TradingInterval};

    fn point(timestamp: i64) -> PricePoint {
        PricePoint {
            timestamp,
            close: Some(10.0),
            ..Default::default()
        }
    }

    fn series(timestamps: &[i64]) -> Vec<PricePoint> {
        timestamps.iter().copied().map(point).collect()
    }

    fn trade(symbol: &str, side: TradeSide, trade_time: i64) -> TradeEvent {
        TradeEvent {
            symbol: symbol.to_string(),
            side,
            price: 10.0,
            quantity: 1.0,
            trade_time,
        }
    }

    #[test]
    fn nearest_index_picks_closest_point() {
        let points = series(&[100, 200, 300]);
        assert_eq!(nearest_index(&points, 180), Some(1));
        assert_eq!(nearest_index(&points, 0), Some(0));
        assert_eq!(nearest_index(&points, 10_000), Some(2));
        assert_eq!(nearest_index(&points, 300), Some(2));
    }

    #[test]
    fn nearest_index_breaks_ties_toward_lowest_index() {
        assert_eq!(nearest_index(&series(&[100, 200]), 150), Some(0));
        assert_eq!(nearest_index(&series(&[100, 200, 200, 300]), 210), Some(1));
        assert_eq!(nearest_index(&series(&[100, 300, 300]), 1_000), Some(1));
    }

    #[test]
    fn nearest_index_of_empty_series_is_none() {
        assert_eq!(nearest_index(&[], 42), None);
    }

    #[test]
    fn filter_window_keeps_start_through_current() {
        let points = series(&[50, 100, 150, 250, 300]);
        let bounds = WindowBounds {
            start: 100,
            current: 250,
        };

        let visible: Vec<i64> = filter_window(&points, Some(bounds), 0)
            .iter()
            .map(|point| point.timestamp)
            .collect();

        assert_eq!(visible, vec![100, 150, 250]);
    }

    #[test]
    fn filter_window_pads_with_lookback_days() {
        let day = SECONDS_PER_DAY;
        let points = series(&[0, 3 * day, 5 * day, 10 * day, 11 * day]);
        let bounds = WindowBounds {
            start: 10 * day,
            current: 10 * day,
        };

        let visible = filter_window(&points, Some(bounds), 5);
        assert_eq!(visible.len(), 2);
        assert_eq!(visible[0].timestamp, 5 * day);
    }

    #[test]
    fn filter_window_outside_replay_returns_everything() {
        let points = series(&[1, 2, 3]);
        assert_eq!(filter_window(&points, None, 5), points);
    }

    #[test]
    fn sanitize_drops_invalid_and_sorts() {
        let mut invalid = point(5);
        invalid.close = Some(-1.0);
        let raw = vec![point(30), invalid, point(10), point(30), point(20)];

        let cleaned: Vec<i64> = sanitize_series(raw)
            .iter()
            .map(|point| point.timestamp)
            .collect();

        assert_eq!(cleaned, vec![10, 20, 30]);
    }

    #[test]
    fn align_routes_sides_and_keeps_collisions() {
        let points = series(&[100, 200, 300]);
        let trades = vec![
            trade("BTC", TradeSide::Buy, 190),
            trade("BTC", TradeSide::Long, 210),
            trade("BTC", TradeSide::Short, 290),
            trade("ETH", TradeSide::Sell, 100),
            trade("btc", TradeSide::Sell, 90),
        ];

        let result = align(&points, &trades, "BTC");

        assert_eq!(result.buys.get(&1).map(Vec::len), Some(2));
        assert_eq!(result.sells.get(&2).map(Vec::len), Some(1));
        assert_eq!(result.sells.get(&0).map(Vec::len), Some(1));
        assert_eq!(result.point_for_trade(3), None);
        assert_eq!(result.point_for_trade(4), Some(0));
        assert_eq!(result.len(), 4);
    }

    #[test]
    fn align_against_empty_series_is_empty() {
        let trades = vec![trade("BTC", TradeSide::Buy, 1)];
        assert!(align(&[], &trades, "BTC").is_empty());
    }

    #[test]
    fn replay_series_count_covers_span_with_buffer() {
        let start = parse_timestamp("2024-01-01").expect("fixture should parse");
        let window = ReplayWindow::new(
            start,
            parse_timestamp("2024-12-31").expect("fixture should parse"),
        )
        .expect("window should be valid");
        let mut clock = ReplayState {
            active: true,
            window: Some(window),
            current: Some(parse_timestamp("2024-01-31").expect("fixture should parse")),
            speed_multiplier: 1.0,
            interval: TradingInterval::Daily,
            progress: None,
        };

        assert_eq!(replay_series_count(&clock, SeriesTimeframe::D1), Some(36));

        clock.current = Some(start);
        assert_eq!(replay_series_count(&clock, SeriesTimeframe::D1), Some(20));

        clock.current = Some(window.end);
        assert_eq!(replay_series_count(&clock, SeriesTimeframe::H1), Some(500));

        assert_eq!(
            replay_series_count(&ReplayState::inactive(), SeriesTimeframe::D1),
            None
        );
    }
}
