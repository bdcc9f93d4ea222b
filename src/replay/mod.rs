pub mod api;
pub mod controller;
pub mod persistence;
#[cfg(test)]
pub(crate) mod testing;
pub mod types;

pub use controller::{ReplayController, ReplayEvent, ReplayStatusSnapshot};
