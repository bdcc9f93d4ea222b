pub mod chart;
pub mod health;
pub mod preferences;
pub mod replay;
pub mod session;
