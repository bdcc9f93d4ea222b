use crate::error::AppError;
use serde::{Deserialize, Serialize};

pub const MAX_ORDER_QUANTITY: f64 = 1_000_000_000.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct UserInfo {
    pub id: i64,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AccountInfo {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub initial_capital: f64,
    pub current_cash: f64,
    pub frozen_cash: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AccountOverview {
    pub account: Option<AccountInfo>,
    pub total_assets: f64,
    pub positions_value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Position {
    pub id: i64,
    pub account_id: i64,
    pub symbol: String,
    pub name: String,
    pub market: String,
    pub quantity: f64,
    pub available_quantity: f64,
    pub avg_cost: f64,
    pub last_price: Option<f64>,
    pub market_value: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Order {
    pub id: i64,
    pub order_no: String,
    pub symbol: String,
    pub name: String,
    pub market: String,
    pub side: String,
    pub order_type: String,
    pub price: Option<f64>,
    pub quantity: f64,
    pub filled_quantity: f64,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct TradeRecord {
    pub id: i64,
    pub order_id: i64,
    pub symbol: String,
    pub name: String,
    pub market: String,
    pub side: String,
    pub price: f64,
    pub quantity: f64,
    pub commission: f64,
    pub trade_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AiDecision {
    pub id: i64,
    pub account_id: i64,
    pub decision_time: String,
    pub reason: String,
    pub operation: String,
    pub symbol: Option<String>,
    pub prev_portion: f64,
    pub target_portion: f64,
    pub total_balance: f64,
}

/// One sample of an account's asset curve.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct EquityPoint {
    pub timestamp: i64,
    pub datetime_str: String,
    pub account_id: i64,
    pub user_id: i64,
    pub username: String,
    pub total_assets: f64,
    pub initial_capital: f64,
    pub profit: f64,
    pub profit_percentage: f64,
    pub cash: f64,
    pub positions_value: f64,
    pub is_active: bool,
}

/// Every slice is optional; an absent slice means "unchanged", not "empty".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SnapshotPayload {
    pub overview: Option<AccountOverview>,
    pub positions: Option<Vec<Position>>,
    pub orders: Option<Vec<Order>>,
    pub trades: Option<Vec<TradeRecord>>,
    pub ai_decisions: Option<Vec<AiDecision>>,
    pub all_asset_curves: Option<Vec<EquityPoint>>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    BootstrapOk {
        #[serde(default)]
        user: Option<UserInfo>,
        #[serde(default)]
        account: Option<AccountInfo>,
    },
    Snapshot(SnapshotPayload),
    SnapshotFull(SnapshotPayload),
    SnapshotFast(SnapshotPayload),
    Trades {
        #[serde(default)]
        trades: Vec<TradeRecord>,
    },
    OrderFilled {
        #[serde(default)]
        order_id: Option<i64>,
        #[serde(default)]
        symbol: Option<String>,
    },
    OrderPending {
        #[serde(default)]
        order_id: Option<i64>,
        #[serde(default)]
        symbol: Option<String>,
    },
    UserSwitched {
        #[serde(default)]
        user: Option<UserInfo>,
    },
    AccountSwitched {
        #[serde(default)]
        account: Option<AccountInfo>,
    },
    Error {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Unknown,
}

impl InboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BootstrapOk { .. } => "bootstrap_ok",
            Self::Snapshot(_) => "snapshot",
            Self::SnapshotFull(_) => "snapshot_full",
            Self::SnapshotFast(_) => "snapshot_fast",
            Self::Trades { .. } => "trades",
            Self::OrderFilled { .. } => "order_filled",
            Self::OrderPending { .. } => "order_pending",
            Self::UserSwitched { .. } => "user_switched",
            Self::AccountSwitched { .. } => "account_switched",
            Self::Error { .. } => "error",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PlaceOrderRequest {
    pub symbol: String,
    pub name: String,
    pub market: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    pub quantity: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Bootstrap { username: String, initial_capital: f64 },
    GetSnapshot,
    PlaceOrder(PlaceOrderRequest),
    SwitchUser { username: String },
    SwitchAccount { account_id: i64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderArgs {
    pub symbol: Option<String>,
    pub name: Option<String>,
    pub market: Option<String>,
    pub side: Option<OrderSide>,
    pub order_type: Option<OrderType>,
    pub price: Option<f64>,
    pub quantity: Option<f64>,
}

impl PlaceOrderArgs {
    pub fn normalize(self) -> Result<PlaceOrderRequest, AppError> {
        let symbol = self.symbol.unwrap_or_default().trim().to_ascii_uppercase();
        if symbol.is_empty() {
            return Err(AppError::InvalidArgument("symbol is required".to_string()));
        }

        let side = self
            .side
            .ok_or_else(|| AppError::InvalidArgument("side is required".to_string()))?;
        let order_type = self.order_type.unwrap_or(OrderType::Market);

        let quantity = self.quantity.unwrap_or_default();
        if !quantity.is_finite() || quantity <= 0.0 || quantity > MAX_ORDER_QUANTITY {
            return Err(AppError::InvalidArgument(
                "quantity must be finite and positive".to_string(),
            ));
        }

        let price = match (order_type, self.price) {
            (OrderType::Limit, Some(price)) if price.is_finite() && price > 0.0 => Some(price),
            (OrderType::Limit, _) => {
                return Err(AppError::InvalidArgument(
                    "limit orders need a positive price".to_string(),
                ))
            }
            (OrderType::Market, _) => None,
        };

        Ok(PlaceOrderRequest {
            name: self
                .name
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| symbol.clone()),
            market: self
                .market
                .map(|market| market.trim().to_ascii_uppercase())
                .filter(|market| !market.is_empty())
                .unwrap_or_else(|| "CRYPTO".to_string()),
            symbol,
            side,
            order_type,
            price,
            quantity,
        })
    }
}

pub fn parse_inbound_payload(payload: &mut [u8]) -> Result<InboundMessage, AppError> {
    let message: InboundMessage = simd_json::serde::from_slice(payload)?;
    Ok(message)
}

pub fn encode_outbound(message: &OutboundMessage) -> Result<String, AppError> {
    Ok(simd_json::serde::to_string(message)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<InboundMessage, AppError> {
        let mut owned = text.as_bytes().to_vec();
        parse_inbound_payload(owned.as_mut_slice())
    }

    #[test]
    fn parses_partial_snapshot_without_touching_absent_slices() {
        let message = parse(
            r#"{"type":"snapshot_fast","positions":[{"id":1,"symbol":"BTC","quantity":0.5}]}"#,
        )
        .expect("snapshot should parse");

        let InboundMessage::SnapshotFast(payload) = message else {
            panic!("expected snapshot_fast");
        };
        assert_eq!(payload.positions.as_ref().map(Vec::len), Some(1));
        assert!(payload.overview.is_none());
        assert!(payload.trades.is_none());
    }

    #[test]
    fn defaults_missing_numeric_fields_to_zero() {
        let message = parse(r#"{"type":"trades","trades":[{"id":7,"symbol":"ETH","side":"BUY"}]}"#)
            .expect("trades should parse");

        let InboundMessage::Trades { trades } = message else {
            panic!("expected trades");
        };
        assert_eq!(trades[0].price, 0.0);
        assert_eq!(trades[0].trade_time, "");
    }

    #[test]
    fn unknown_message_types_are_tolerated() {
        let message = parse(r#"{"type":"heartbeat","seq":3}"#).expect("unknown should parse");
        assert_eq!(message, InboundMessage::Unknown);
    }

    #[test]
    fn rejects_payload_without_type_tag() {
        assert!(parse(r#"{"positions":[]}"#).is_err());
        assert!(parse("not json").is_err());
    }

    #[test]
    fn encodes_outbound_with_snake_case_tag() {
        let bootstrap = encode_outbound(&OutboundMessage::Bootstrap {
            username: "alice".to_string(),
            initial_capital: 100_000.0,
        })
        .expect("bootstrap should encode");
        assert!(bootstrap.contains(r#""type":"bootstrap""#));
        assert!(bootstrap.contains(r#""username":"alice""#));

        let refresh = encode_outbound(&OutboundMessage::GetSnapshot).expect("should encode");
        assert_eq!(refresh, r#"{"type":"get_snapshot"}"#);

        let switch = encode_outbound(&OutboundMessage::SwitchAccount { account_id: 4 })
            .expect("should encode");
        assert!(switch.contains(r#""account_id":4"#));
    }

    #[test]
    fn place_order_requires_price_for_limit_orders() {
        let missing_price = PlaceOrderArgs {
            symbol: Some("btc".to_string()),
            side: Some(OrderSide::Buy),
            order_type: Some(OrderType::Limit),
            quantity: Some(1.0),
            ..Default::default()
        }
        .normalize();
        assert!(missing_price.is_err());

        let market = PlaceOrderArgs {
            symbol: Some("btc".to_string()),
            side: Some(OrderSide::Sell),
            price: Some(10.0),
            quantity: Some(1.0),
            ..Default::default()
        }
        .normalize()
        .expect("market order should normalize");
        assert_eq!(market.symbol, "BTC");
        assert_eq!(market.name, "BTC");
        assert_eq!(market.price, None);
    }
}
