// Trading strategy module
pub mod mean_reversion;

pub use mean_reversion::{
    EntryPriceBasis, MeanReversionConfig, MeanReversionStrategy, ProfitTarget,
};

use rust_decimal::Decimal;

use crate::execution::Position;
use crate::models::{PriceEvent, Signal};

/// Market state handed to a strategy for one evaluation
#[derive(Debug, Clone, Copy)]
pub struct MarketView<'a> {
    pub event: &'a PriceEvent,
    /// Deviation from the mean in percent, None while warming up
    pub deviation: Option<Decimal>,
    pub mean: Option<Decimal>,
}

/// Base trait for trading strategies
pub trait Strategy: Send + Sync {
    /// Decide what to do with the current position given the latest market view
    fn evaluate(&self, view: &MarketView<'_>, position: &Position) -> Signal;

    /// Get strategy name
    fn name(&self) -> &str;
}
