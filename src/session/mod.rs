pub mod connection;
pub mod protocol;
pub mod reconciler;

pub use connection::{ConnectionEvent, ConnectionHandle, ConnectionManager, ConnectionState};
pub use reconciler::{DashboardView, RefreshTrigger, SnapshotReconciler};
