pub mod alignment;
pub mod loader;
pub mod types;

pub use loader::{AlignedChart, SeriesService};
