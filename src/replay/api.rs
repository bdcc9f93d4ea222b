use crate::error::AppError;
use crate::replay::types::{
    AdvanceReplayResponse, ReplayState, ReplayStateResponse, StartReplayRequest,
    StartReplayResponse, StopReplayResponse,
};
use crate::series::types::{PricePoint, SeriesRequest};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const REQUEST_TIMEOUT_SECS: u64 = 15;
/// Timestamps above this are treated as milliseconds.
const MILLIS_TIMESTAMP_THRESHOLD: f64 = 100_000_000_000.0;

/// Server-owned replay clock endpoints.
#[async_trait]
pub trait ReplayApi: Send + Sync {
    async fn replay_state(&self) -> Result<ReplayState, AppError>;
    async fn start_replay(
        &self,
        request: &StartReplayRequest,
    ) -> Result<StartReplayResponse, AppError>;
    async fn stop_replay(&self) -> Result<StopReplayResponse, AppError>;
    async fn advance_replay(&self, seconds: i64) -> Result<AdvanceReplayResponse, AppError>;
}

#[async_trait]
pub trait HistoricalSeriesSource: Send + Sync {
    async fn historical_series(&self, request: &SeriesRequest)
        -> Result<Vec<PricePoint>, AppError>;
}

fn replay_state_endpoint(base_url: &str) -> String {
    format!("{base_url}/api/replay/state")
}

fn replay_start_endpoint(base_url: &str) -> String {
    format!("{base_url}/api/replay/start")
}

fn replay_stop_endpoint(base_url: &str) -> String {
    format!("{base_url}/api/replay/stop")
}

fn replay_advance_endpoint(base_url: &str) -> String {
    format!("{base_url}/api/replay/advance")
}

fn kline_endpoint(base_url: &str, symbol: &str) -> String {
    format!("{base_url}/api/market/kline/{}", symbol.to_ascii_uppercase())
}

/// Query pairs for the kline endpoint; reqwest encodes them.
fn kline_query(request: &SeriesRequest) -> [(&'static str, String); 3] {
    [
        ("market", request.market.clone()),
        ("period", request.timeframe.as_str().to_string()),
        ("count", request.count.to_string()),
    ]
}

#[derive(Debug, Serialize)]
struct AdvanceReplayBody {
    seconds: i64,
}

#[derive(Debug, Deserialize)]
struct ErrorBodyWire {
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KlineResponseWire {
    #[serde(default)]
    data: Vec<KlineWire>,
}

#[derive(Debug, Deserialize)]
struct KlineWire {
    timestamp: f64,
    #[serde(default)]
    open: Option<f64>,
    #[serde(default)]
    high: Option<f64>,
    #[serde(default)]
    low: Option<f64>,
    #[serde(default)]
    close: Option<f64>,
    #[serde(default)]
    volume: Option<f64>,
}

impl From<KlineWire> for PricePoint {
    fn from(value: KlineWire) -> Self {
        let seconds = if value.timestamp.abs() >= MILLIS_TIMESTAMP_THRESHOLD {
            value.timestamp / 1_000.0
        } else {
            value.timestamp
        };
        Self {
            timestamp: seconds.floor() as i64,
            open: value.open,
            high: value.high,
            low: value.low,
            close: value.close,
            volume: value.volume,
        }
    }
}

fn error_detail(body: &str) -> Option<String> {
    let mut owned = body.as_bytes().to_vec();
    let wire: ErrorBodyWire = simd_json::serde::from_slice(owned.as_mut_slice()).ok()?;
    wire.detail
        .or(wire.message)
        .filter(|detail| !detail.trim().is_empty())
}

/// Non-2xx responses become `Rejected` carrying the server's `detail`.
async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, AppError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }

    let body = response.text().await.unwrap_or_default();
    let detail = error_detail(&body).unwrap_or_else(|| format!("HTTP {status}"));
    Err(AppError::Rejected(detail))
}

/// reqwest-backed implementation of both backend seams.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ReplayApi for HttpBackend {
    async fn replay_state(&self) -> Result<ReplayState, AppError> {
        let response = self
            .client
            .get(replay_state_endpoint(&self.base_url))
            .send()
            .await?;
        let payload = read_json::<ReplayStateResponse>(response).await?;
        payload.try_into()
    }

    async fn start_replay(
        &self,
        request: &StartReplayRequest,
    ) -> Result<StartReplayResponse, AppError> {
        let response = self
            .client
            .post(replay_start_endpoint(&self.base_url))
            .json(&request.body())
            .send()
            .await?;
        read_json(response).await
    }

    async fn stop_replay(&self) -> Result<StopReplayResponse, AppError> {
        let response = self
            .client
            .post(replay_stop_endpoint(&self.base_url))
            .send()
            .await?;
        read_json(response).await
    }

    async fn advance_replay(&self, seconds: i64) -> Result<AdvanceReplayResponse, AppError> {
        let response = self
            .client
            .post(replay_advance_endpoint(&self.base_url))
            .json(&AdvanceReplayBody { seconds })
            .send()
            .await?;
        read_json(response).await
    }
}

#[async_trait]
impl HistoricalSeriesSource for HttpBackend {
    async fn historical_series(
        &self,
        request: &SeriesRequest,
    ) -> Result<Vec<PricePoint>, AppError> {
        let response = self
            .client
            .get(kline_endpoint(&self.base_url, &request.symbol))
            .query(&kline_query(request))
            .send()
            .await?;
        let payload = read_json::<KlineResponseWire>(response).await?;
        Ok(payload.data.into_iter().map(PricePoint::from).collect())
    }
}
