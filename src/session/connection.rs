use crate::config::ConnectionConfig;
use crate::error::AppError;
use crate::session::protocol::{
    encode_outbound, parse_inbound_payload, InboundMessage, OutboundMessage,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_NO_STATUS: u16 = 1005;
pub const CLOSE_ABNORMAL: u16 = 1006;

type PushStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Opened,
    Message(InboundMessage),
    Closed { code: u16 },
    TransportError(String),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatusSnapshot {
    pub state: ConnectionState,
    pub url: String,
    pub username: String,
    pub connect_attempts: u64,
    pub last_close_code: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReconnectPlan {
    Stop,
    After(Duration),
}

/// 1000/1001 and caller-requested closes end the session; everything else
/// (including 1006 for a dropped transport or failed connect) gets one retry.
pub(crate) fn reconnect_plan(close_code: u16, requested: bool, delay: Duration) -> ReconnectPlan {
    if requested || close_code == CLOSE_NORMAL || close_code == CLOSE_GOING_AWAY {
        ReconnectPlan::Stop
    } else {
        ReconnectPlan::After(delay)
    }
}

#[derive(Debug)]
struct ConnectionShared {
    config: ConnectionConfig,
    state: RwLock<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    connect_attempts: AtomicU64,
    last_close_code: Mutex<Option<u16>>,
}

impl ConnectionShared {
    fn new(config: ConnectionConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        Self {
            config,
            state: RwLock::new(ConnectionState::Disconnected),
            events,
            outbound: Mutex::new(None),
            connect_attempts: AtomicU64::new(0),
            last_close_code: Mutex::new(None),
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = std::mem::replace(&mut *self.state.write(), next);
        if previous != next {
            tracing::debug!(from = ?previous, to = ?next, "push connection state changed");
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine; events are fire-and-forget.
        let _ = self.events.send(event);
    }
}

/// Read-state/send-only view of the push connection handed to other components.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    shared: Arc<ConnectionShared>,
}

impl ConnectionHandle {
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    pub fn send(&self, message: &OutboundMessage) -> Result<(), AppError> {
        if !self.is_open() {
            return Err(AppError::NotConnected);
        }

        let payload = encode_outbound(message)?;
        let outbound = self.shared.outbound.lock();
        match outbound.as_ref() {
            Some(sender) => sender.send(payload).map_err(|_| AppError::NotConnected),
            None => Err(AppError::NotConnected),
        }
    }

    pub fn status(&self) -> ConnectionStatusSnapshot {
        ConnectionStatusSnapshot {
            state: self.state(),
            url: self.shared.config.url.clone(),
            username: self.shared.config.username.clone(),
            connect_attempts: self.shared.connect_attempts.load(Ordering::Relaxed),
            last_close_code: *self.shared.last_close_code.lock(),
        }
    }
}

#[derive(Debug)]
struct DriverHandle {
    token: CancellationToken,
    join_handle: JoinHandle<()>,
}

/// Owns the single logical push connection and its reconnect driver.
#[derive(Debug)]
pub struct ConnectionManager {
    shared: Arc<ConnectionShared>,
    driver: tokio::sync::Mutex<Option<DriverHandle>>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            shared: Arc::new(ConnectionShared::new(config)),
            driver: tokio::sync::Mutex::new(None),
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// Starts the connection driver unless one is already pending or open.
    pub async fn connect(&self) {
        let mut driver = self.driver.lock().await;
        if let Some(existing) = driver.as_ref() {
            if !existing.join_handle.is_finished() {
                tracing::debug!("push connection already active, ignoring connect");
                return;
            }
        }

        let token = CancellationToken::new();
        let shared = Arc::clone(&self.shared);
        let driver_token = token.clone();
        let join_handle = tokio::spawn(async move {
            run_connection_driver(shared, driver_token).await;
        });

        *driver = Some(DriverHandle { token, join_handle });
    }

    /// Sends a normal close and stops reconnecting.
    pub async fn disconnect(&self) {
        let handle = self.driver.lock().await.take();
        let Some(handle) = handle else {
            return;
        };

        handle.token.cancel();
        if let Err(error) = handle.join_handle.await {
            tracing::warn!(error = %error, "push connection driver ended abnormally");
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }
}

fn ws_config() -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(64 << 20),
        max_frame_size: Some(16 << 20),
        ..Default::default()
    }
}

async fn run_connection_driver(shared: Arc<ConnectionShared>, cancel_token: CancellationToken) {
    let mut request_retry_used = false;

    while !cancel_token.is_cancelled() {
        shared.set_state(ConnectionState::Connecting);
        shared.connect_attempts.fetch_add(1, Ordering::Relaxed);

        let request = match shared.config.url.as_str().into_client_request() {
            Ok(request) => request,
            Err(error) => {
                if !retry_request_construction(&shared, &cancel_token, &mut request_retry_used, error)
                    .await
                {
                    break;
                }
                continue;
            }
        };

        let connected = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            result = connect_async_with_config(request, Some(ws_config()), true) => result,
        };

        let close_code = match connected {
            Ok((stream, _)) => {
                request_retry_used = false;
                run_session(&shared, stream, &cancel_token).await
            }
            Err(error @ WsError::Url(_)) => {
                if !retry_request_construction(&shared, &cancel_token, &mut request_retry_used, error)
                    .await
                {
                    break;
                }
                continue;
            }
            Err(error) => {
                tracing::warn!(url = %shared.config.url, error = %error, "push connect failed");
                shared.emit(ConnectionEvent::TransportError(error.to_string()));
                CLOSE_ABNORMAL
            }
        };

        shared.outbound.lock().take();
        *shared.last_close_code.lock() = Some(close_code);
        shared.set_state(ConnectionState::Disconnected);
        shared.emit(ConnectionEvent::Closed { code: close_code });

        match reconnect_plan(
            close_code,
            cancel_token.is_cancelled(),
            shared.config.reconnect_delay,
        ) {
            ReconnectPlan::Stop => {
                tracing::info!(code = close_code, "push connection closed");
                break;
            }
            ReconnectPlan::After(delay) => {
                tracing::info!(
                    code = close_code,
                    delay_ms = delay.as_millis() as u64,
                    "push connection lost, scheduling reconnect"
                );
                tokio::select! {
                    biased;
                    _ = cancel_token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    shared.outbound.lock().take();
    shared.set_state(ConnectionState::Disconnected);
}

/// Request construction failures get exactly one retry after the longer delay.
async fn retry_request_construction(
    shared: &ConnectionShared,
    cancel_token: &CancellationToken,
    retry_used: &mut bool,
    error: WsError,
) -> bool {
    tracing::warn!(url = %shared.config.url, error = %error, "push request could not be built");
    shared.emit(ConnectionEvent::TransportError(error.to_string()));
    shared.set_state(ConnectionState::Disconnected);

    if *retry_used {
        return false;
    }
    *retry_used = true;

    tokio::select! {
        biased;
        _ = cancel_token.cancelled() => false,
        _ = tokio::time::sleep(shared.config.initial_connect_retry) => true,
    }
}

async fn run_session(
    shared: &ConnectionShared,
    stream: PushStream,
    cancel_token: &CancellationToken,
) -> u16 {
    let (mut sink, mut source) = stream.split();

    let bootstrap = OutboundMessage::Bootstrap {
        username: shared.config.username.clone(),
        initial_capital: shared.config.initial_capital,
    };
    let handshake = match encode_outbound(&bootstrap) {
        Ok(payload) => sink.send(Message::Text(payload)).await.map_err(AppError::from),
        Err(error) => Err(error),
    };
    if let Err(error) = handshake {
        tracing::warn!(error = %error, "failed to send bootstrap handshake");
        shared.emit(ConnectionEvent::TransportError(error.to_string()));
        return CLOSE_ABNORMAL;
    }

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    *shared.outbound.lock() = Some(outbound_tx);
    shared.set_state(ConnectionState::Open);
    shared.emit(ConnectionEvent::Opened);
    tracing::info!(url = %shared.config.url, "push connection open");

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                shared.set_state(ConnectionState::Closing);
                let close = Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client disconnect".into(),
                }));
                if let Err(error) = sink.send(close).await {
                    tracing::debug!(error = %error, "close frame not delivered");
                }
                return CLOSE_NORMAL;
            }
            Some(payload) = outbound_rx.recv() => {
                if let Err(error) = sink.send(Message::Text(payload)).await {
                    tracing::warn!(error = %error, "push send failed");
                    shared.emit(ConnectionEvent::TransportError(error.to_string()));
                    return CLOSE_ABNORMAL;
                }
            }
            frame = source.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => dispatch_payload(shared, text.into_bytes()),
                    Some(Ok(Message::Binary(bytes))) => dispatch_payload(shared, bytes),
                    Some(Ok(Message::Close(frame))) => {
                        return frame
                            .map(|frame| u16::from(frame.code))
                            .unwrap_or(CLOSE_NO_STATUS);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        tracing::warn!(error = %error, "push frame error");
                        shared.emit(ConnectionEvent::TransportError(error.to_string()));
                        return CLOSE_ABNORMAL;
                    }
                    None => return CLOSE_ABNORMAL,
                }
            }
        }
    }
}

fn dispatch_payload(shared: &ConnectionShared, mut payload: Vec<u8>) {
    match parse_inbound_payload(payload.as_mut_slice()) {
        Ok(message) => shared.emit(ConnectionEvent::Message(message)),
        Err(error) => {
            tracing::warn!(error = %error, "dropping malformed push payload");
        }
    }
}
