use crate::error::AppError;
use crate::replay::types::parse_timestamp;
use crate::session::protocol::TradeRecord;
use serde::{Deserialize, Serialize};

pub const DEFAULT_SYMBOL: &str = "BTC";
pub const DEFAULT_MARKET: &str = "CRYPTO";
pub const DEFAULT_TIMEFRAME: SeriesTimeframe = SeriesTimeframe::D1;
pub const DEFAULT_SERIES_COUNT: u16 = 100;
pub const MIN_SERIES_COUNT: u16 = 1;
pub const MAX_SERIES_COUNT: u16 = 500;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SeriesTimeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
}

impl SeriesTimeframe {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
            Self::W1 => "1w",
        }
    }

    pub fn parse_str(value: &str) -> Result<Self, AppError> {
        match value.trim() {
            "1m" => Ok(Self::M1),
            "5m" => Ok(Self::M5),
            "15m" => Ok(Self::M15),
            "1h" => Ok(Self::H1),
            "4h" => Ok(Self::H4),
            "1d" => Ok(Self::D1),
            "1w" => Ok(Self::W1),
            other => Err(AppError::InvalidArgument(format!(
                "unsupported timeframe '{other}'"
            ))),
        }
    }

    pub fn duration_secs(self) -> i64 {
        match self {
            Self::M1 => 60,
            Self::M5 => 300,
            Self::M15 => 900,
            Self::H1 => 3_600,
            Self::H4 => 14_400,
            Self::D1 => 86_400,
            Self::W1 => 604_800,
        }
    }
}

/// One candle of a historical series. Timestamps are unix seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PricePoint {
    pub timestamp: i64,
    #[serde(default)]
    pub open: Option<f64>,
    #[serde(default)]
    pub high: Option<f64>,
    #[serde(default)]
    pub low: Option<f64>,
    #[serde(default)]
    pub close: Option<f64>,
    #[serde(default)]
    pub volume: Option<f64>,
}

impl PricePoint {
    /// `close`, falling back to `open`.
    pub fn price(&self) -> Option<f64> {
        self.close.or(self.open)
    }

    pub fn is_valid(&self) -> bool {
        self.price()
            .map(|price| price.is_finite() && price > 0.0)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum MarkerChannel {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn parse_str(value: &str) -> Result<Self, AppError> {
        match value.trim().to_ascii_uppercase().as_str() {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            "LONG" => Ok(Self::Long),
            "SHORT" => Ok(Self::Short),
            other => Err(AppError::InvalidArgument(format!(
                "unsupported trade side '{other}'"
            ))),
        }
    }

    pub fn channel(self) -> MarkerChannel {
        match self {
            Self::Buy | Self::Long => MarkerChannel::Buy,
            Self::Sell | Self::Short => MarkerChannel::Sell,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TradeEvent {
    pub symbol: String,
    pub side: TradeSide,
    pub price: f64,
    pub quantity: f64,
    /// Unix seconds.
    pub trade_time: i64,
}

impl TryFrom<&TradeRecord> for TradeEvent {
    type Error = AppError;

    fn try_from(value: &TradeRecord) -> Result<Self, Self::Error> {
        let side = TradeSide::parse_str(&value.side)?;
        if !value.price.is_finite() || value.price <= 0.0 {
            return Err(AppError::InvalidArgument(
                "trade price must be finite and positive".to_string(),
            ));
        }
        if !value.quantity.is_finite() || value.quantity <= 0.0 {
            return Err(AppError::InvalidArgument(
                "trade quantity must be finite and positive".to_string(),
            ));
        }
        let trade_time = parse_timestamp(&value.trade_time)?.timestamp();

        Ok(Self {
            symbol: value.symbol.trim().to_ascii_uppercase(),
            side,
            price: value.price,
            quantity: value.quantity,
            trade_time,
        })
    }
}

/// Converts snapshot trade rows, skipping rows that fail validation.
pub fn trade_events_from_records(records: &[TradeRecord]) -> Vec<TradeEvent> {
    records
        .iter()
        .filter_map(|record| match TradeEvent::try_from(record) {
            Ok(event) => Some(event),
            Err(error) => {
                tracing::debug!(trade_id = record.id, error = %error, "skipping trade row");
                None
            }
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChartArgs {
    pub symbol: Option<String>,
    pub market: Option<String>,
    pub timeframe: Option<SeriesTimeframe>,
    pub count: Option<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesRequest {
    pub symbol: String,
    pub market: String,
    pub timeframe: SeriesTimeframe,
    pub count: u16,
}

impl ChartArgs {
    pub fn normalize(self) -> Result<SeriesRequest, AppError> {
        let symbol = self.symbol.unwrap_or_default().trim().to_ascii_uppercase();
        if symbol.is_empty()
            || !symbol
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '/' | '-' | '.' | '_'))
        {
            return Err(AppError::InvalidArgument(
                "symbol must be non-empty ASCII".to_string(),
            ));
        }

        let market = self
            .market
            .unwrap_or_else(|| DEFAULT_MARKET.to_string())
            .trim()
            .to_ascii_uppercase();
        if market.is_empty()
            || !market
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_'))
        {
            return Err(AppError::InvalidArgument(
                "market must be non-empty alphanumeric".to_string(),
            ));
        }

        let count = self.count.unwrap_or(DEFAULT_SERIES_COUNT);
        if !(MIN_SERIES_COUNT..=MAX_SERIES_COUNT).contains(&count) {
            return Err(AppError::InvalidArgument(format!(
                "count must be between {MIN_SERIES_COUNT} and {MAX_SERIES_COUNT}"
            )));
        }

        Ok(SeriesRequest {
            symbol,
            market,
            timeframe: self.timeframe.unwrap_or(DEFAULT_TIMEFRAME),
            count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(side: &str, price: f64, quantity: f64) -> TradeRecord {
        TradeRecord {
            id: 1,
            symbol: "btc".to_string(),
            side: side.to_string(),
            price,
            quantity,
            trade_time: "2024-03-01T12:00:00".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn point_validity_falls_back_to_open() {
        let point = PricePoint {
            timestamp: 1,
            open: Some(10.0),
            ..Default::default()
        };
        assert!(point.is_valid());

        let broken = PricePoint {
            timestamp: 2,
            close: Some(f64::NAN),
            open: Some(10.0),
            ..Default::default()
        };
        assert!(!broken.is_valid());

        let zero = PricePoint {
            timestamp: 3,
            close: Some(0.0),
            ..Default::default()
        };
        assert!(!zero.is_valid());
    }

    #[test]
    fn maps_sides_to_marker_channels() {
        assert_eq!(TradeSide::Buy.channel(), MarkerChannel::Buy);
        assert_eq!(TradeSide::Long.channel(), MarkerChannel::Buy);
        assert_eq!(TradeSide::Sell.channel(), MarkerChannel::Sell);
        assert_eq!(TradeSide::Short.channel(), MarkerChannel::Sell);
        assert_eq!(TradeSide::parse_str("short").ok(), Some(TradeSide::Short));
    }

    #[test]
    fn converts_trade_record_into_event() {
        let event = TradeEvent::try_from(&record("buy", 42_000.0, 0.5))
            .expect("trade record should convert");

        assert_eq!(event.symbol, "BTC");
        assert_eq!(event.side, TradeSide::Buy);
        assert_eq!(event.trade_time, 1_709_294_400);
    }

    #[test]
    fn rejects_non_positive_trade_values() {
        assert!(TradeEvent::try_from(&record("BUY", 0.0, 1.0)).is_err());
        assert!(TradeEvent::try_from(&record("SELL", 1.0, -1.0)).is_err());
        assert!(TradeEvent::try_from(&record("HOLD", 1.0, 1.0)).is_err());
        assert_eq!(
            trade_events_from_records(&[record("BUY", 1.0, 1.0), record("HOLD", 1.0, 1.0)])
                .len(),
            1
        );
    }

    #[test]
    fn normalizes_chart_args() {
        let request = ChartArgs {
            symbol: Some(" eth ".to_string()),
            ..Default::default()
        }
        .normalize()
        .expect("chart args should be valid");

        assert_eq!(request.symbol, "ETH");
        assert_eq!(request.market, DEFAULT_MARKET);
        assert_eq!(request.timeframe, DEFAULT_TIMEFRAME);
        assert_eq!(request.count, DEFAULT_SERIES_COUNT);
    }

    #[test]
    fn caps_series_count() {
        let result = ChartArgs {
            symbol: Some("BTC".to_string()),
            count: Some(501),
            ..Default::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn rejects_market_that_would_smuggle_query_params() {
        let smuggled = ChartArgs {
            symbol: Some("BTC".to_string()),
            market: Some("CRYPTO&count=5000".to_string()),
            ..Default::default()
        }
        .normalize();
        assert!(matches!(smuggled, Err(AppError::InvalidArgument(_))));

        let request = ChartArgs {
            symbol: Some("BTC".to_string()),
            market: Some(" us_stock ".to_string()),
            ..Default::default()
        }
        .normalize()
        .expect("plain market should be valid");
        assert_eq!(request.market, "US_STOCK");
    }
}
