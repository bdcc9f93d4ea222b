use crate::error::AppError;
use crate::session::connection::ConnectionStatusSnapshot;
use crate::session::protocol::PlaceOrderArgs;
use crate::session::DashboardView;
use crate::state::AppState;

pub async fn connect_session(state: &AppState) -> Result<ConnectionStatusSnapshot, AppError> {
    state.ensure_session_pump().await;
    state.connection.connect().await;
    Ok(state.connection.handle().status())
}

pub async fn disconnect_session(state: &AppState) -> Result<ConnectionStatusSnapshot, AppError> {
    state.connection.disconnect().await;
    Ok(state.connection.handle().status())
}

pub async fn session_status(state: &AppState) -> Result<ConnectionStatusSnapshot, AppError> {
    Ok(state.connection.handle().status())
}

pub async fn switch_user(state: &AppState, username: String) -> Result<(), AppError> {
    state.reconciler.switch_user(&username)
}

pub async fn switch_account(state: &AppState, account_id: i64) -> Result<(), AppError> {
    state.reconciler.switch_account(account_id)
}

pub async fn place_order(state: &AppState, args: PlaceOrderArgs) -> Result<(), AppError> {
    state.reconciler.place_order(args)
}

pub async fn dashboard_view(state: &AppState) -> Result<DashboardView, AppError> {
    Ok(state.reconciler.view())
}
