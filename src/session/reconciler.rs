use crate::error::AppError;
use crate::session::connection::{ConnectionEvent, ConnectionHandle};
use crate::session::protocol::{
    AccountInfo, AccountOverview, AiDecision, EquityPoint, InboundMessage, Order,
    OutboundMessage, PlaceOrderArgs, Position, SnapshotPayload, TradeRecord, UserInfo,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Anything that can ask the backend for a fresh snapshot.
pub trait RefreshTrigger: Send + Sync {
    /// Returns `true` when a request was actually sent.
    fn request_refresh(&self) -> bool;
}

#[derive(Debug, Clone, Serialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DashboardView {
    pub user: Option<UserInfo>,
    pub account: Option<AccountInfo>,
    pub overview: Option<AccountOverview>,
    pub positions: Vec<Position>,
    pub orders: Vec<Order>,
    pub trades: Vec<TradeRecord>,
    pub ai_decisions: Vec<AiDecision>,
    pub equity_curves: Vec<EquityPoint>,
    pub last_error: Option<String>,
    pub revision: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Updated,
    RefreshRequested,
    Ignored,
}

#[derive(Debug)]
pub struct SnapshotReconciler {
    connection: ConnectionHandle,
    /// Set by `bootstrap_ok`, cleared whenever the socket opens or closes.
    bootstrapped: AtomicBool,
    view: RwLock<DashboardView>,
    changes: broadcast::Sender<u64>,
}

impl SnapshotReconciler {
    pub fn new(connection: ConnectionHandle, capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            connection,
            bootstrapped: AtomicBool::new(false),
            view: RwLock::new(DashboardView::default()),
            changes,
        }
    }

    pub fn view(&self) -> DashboardView {
        self.view.read().clone()
    }

    pub fn trades(&self) -> Vec<TradeRecord> {
        self.view.read().trades.clone()
    }

    /// Emits the new view revision after every mutation.
    pub fn subscribe(&self) -> broadcast::Receiver<u64> {
        self.changes.subscribe()
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped.load(Ordering::Acquire)
    }

    pub fn apply_push(&self, message: InboundMessage) -> ReconcileOutcome {
        tracing::debug!(kind = message.kind(), "applying push message");
        match message {
            InboundMessage::BootstrapOk { user, account } => {
                self.mutate(|view| {
                    view.user = user;
                    view.account = account;
                    view.last_error = None;
                });
                self.bootstrapped.store(true, Ordering::Release);
                self.request_refresh();
                ReconcileOutcome::RefreshRequested
            }
            InboundMessage::Snapshot(payload)
            | InboundMessage::SnapshotFull(payload)
            | InboundMessage::SnapshotFast(payload) => {
                self.mutate(|view| merge_snapshot(view, payload));
                ReconcileOutcome::Updated
            }
            InboundMessage::Trades { trades } => {
                self.mutate(|view| view.trades = trades);
                ReconcileOutcome::Updated
            }
            InboundMessage::OrderFilled { order_id, .. }
            | InboundMessage::OrderPending { order_id, .. } => {
                tracing::debug!(?order_id, "order event, requesting snapshot");
                self.request_refresh();
                ReconcileOutcome::RefreshRequested
            }
            InboundMessage::UserSwitched { user } => {
                self.mutate(|view| {
                    view.user = user;
                    view.account = None;
                });
                self.request_refresh();
                ReconcileOutcome::RefreshRequested
            }
            InboundMessage::AccountSwitched { account } => {
                self.mutate(|view| view.account = account);
                self.request_refresh();
                ReconcileOutcome::RefreshRequested
            }
            InboundMessage::Error { message } => {
                tracing::warn!(message = %message, "backend reported error");
                self.mutate(|view| view.last_error = Some(message));
                ReconcileOutcome::Updated
            }
            InboundMessage::Unknown => ReconcileOutcome::Ignored,
        }
    }

    pub fn switch_user(&self, username: &str) -> Result<(), AppError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(AppError::InvalidArgument(
                "username must be non-empty".to_string(),
            ));
        }
        self.connection.send(&OutboundMessage::SwitchUser {
            username: username.to_string(),
        })
    }

    pub fn switch_account(&self, account_id: i64) -> Result<(), AppError> {
        if account_id <= 0 {
            return Err(AppError::InvalidArgument(
                "account id must be positive".to_string(),
            ));
        }
        self.connection
            .send(&OutboundMessage::SwitchAccount { account_id })
    }

    pub fn place_order(&self, args: PlaceOrderArgs) -> Result<(), AppError> {
        let request = args.normalize()?;
        self.connection.send(&OutboundMessage::PlaceOrder(request))
    }

    /// Feeds connection events into `apply_push` until cancelled. Subscribes
    /// before returning so nothing emitted after this call is missed.
    pub fn spawn_pump(self: &Arc<Self>, cancel_token: CancellationToken) -> JoinHandle<()> {
        let mut events = self.connection.subscribe();
        let reconciler = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel_token.cancelled() => break,
                    event = events.recv() => event,
                };

                match event {
                    Ok(ConnectionEvent::Message(message)) => {
                        reconciler.apply_push(message);
                    }
                    Ok(ConnectionEvent::Opened) => {
                        reconciler.bootstrapped.store(false, Ordering::Release);
                    }
                    Ok(ConnectionEvent::Closed { code }) => {
                        reconciler.bootstrapped.store(false, Ordering::Release);
                        tracing::debug!(code, "reconciler keeps last view across disconnect");
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "reconciler lagged behind push events");
                        reconciler.request_refresh();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn mutate(&self, apply: impl FnOnce(&mut DashboardView)) {
        let revision = {
            let mut view = self.view.write();
            apply(&mut view);
            view.revision = view.revision.wrapping_add(1);
            view.revision
        };
        let _ = self.changes.send(revision);
    }
}

impl RefreshTrigger for SnapshotReconciler {
    /// Refuses until the backend has acknowledged the bootstrap on this socket.
    fn request_refresh(&self) -> bool {
        if !self.connection.is_open() || !self.is_bootstrapped() {
            return false;
        }
        match self.connection.send(&OutboundMessage::GetSnapshot) {
            Ok(()) => true,
            Err(error) => {
                tracing::debug!(error = %error, "snapshot refresh not sent");
                false
            }
        }
    }
}

fn merge_snapshot(view: &mut DashboardView, payload: SnapshotPayload) {
    if let Some(overview) = payload.overview {
        if let Some(account) = overview.account.clone() {
            view.account = Some(account);
        }
        view.overview = Some(overview);
    }
    if let Some(positions) = payload.positions {
        view.positions = positions;
    }
    if let Some(orders) = payload.orders {
        view.orders = orders;
    }
    if let Some(trades) = payload.trades {
        view.trades = trades;
    }
    if let Some(ai_decisions) = payload.ai_decisions {
        view.ai_decisions = ai_decisions;
    }
    if let Some(curves) = payload.all_asset_curves {
        view.equity_curves = curves;
    }
}
