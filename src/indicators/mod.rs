// Technical indicators module
// Rolling moving average and deviation signal

pub mod deviation;
pub mod moving_average;

pub use deviation::{DeviationIndicator, RefreshMode};
pub use moving_average::deviation_pct;
