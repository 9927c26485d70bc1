use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::execution::Position;
use crate::models::{Direction, ExitReason, Signal};
use crate::strategy::{MarketView, Strategy};
use crate::Result;

/// Deviation-from-mean trading strategy
///
/// Buys when price is stretched below the moving average and sells short when
/// it is stretched above it, expecting a snap back to the mean.
///
/// Entry: deviation below `-threshold_pct` (long) or above `threshold_pct` (short).
///
/// Exit, first match wins:
/// - Profit target reached
/// - Stop crossed (initial stop, or entry once break-even is applied)
/// - Price back at the mean (only with `exit_on_mean_reversion`)
#[derive(Debug, Clone)]
pub struct MeanReversionStrategy {
    config: MeanReversionConfig,
}

/// How the profit target is placed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ProfitTarget {
    /// Stop distance times `multiple` away from entry
    RiskMultiple { multiple: Decimal },
    /// Fixed percent away from entry (0.8 = 0.8%)
    Percent { percent: Decimal },
}

/// Which price stop and target levels are anchored to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntryPriceBasis {
    /// Mid-price when the signal fired
    #[default]
    SignalMid,
    /// Average fill price reported by the exchange
    ExecutionPrice,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeanReversionConfig {
    /// Deviation from the mean that triggers an entry, in percent
    pub threshold_pct: Decimal,

    /// Stop distance from entry, in percent
    pub stop_loss_pct: Decimal,

    pub profit_target: ProfitTarget,

    /// Favorable move, in stop distances, that moves the stop to entry
    pub break_even_multiple: Decimal,

    /// Close when price returns to the moving average
    pub exit_on_mean_reversion: bool,

    pub entry_price_basis: EntryPriceBasis,
}

impl Default for MeanReversionConfig {
    fn default() -> Self {
        Self {
            threshold_pct: dec!(0.2),
            stop_loss_pct: dec!(0.2),
            profit_target: ProfitTarget::RiskMultiple { multiple: dec!(4) },
            break_even_multiple: dec!(2),
            exit_on_mean_reversion: false,
            entry_price_basis: EntryPriceBasis::SignalMid,
        }
    }
}

impl MeanReversionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.threshold_pct <= Decimal::ZERO {
            return Err("strategy.threshold_pct must be positive".into());
        }
        if self.stop_loss_pct <= Decimal::ZERO {
            return Err("strategy.stop_loss_pct must be positive".into());
        }
        let target_ok = match &self.profit_target {
            ProfitTarget::RiskMultiple { multiple } => *multiple > Decimal::ZERO,
            ProfitTarget::Percent { percent } => *percent > Decimal::ZERO,
        };
        if !target_ok {
            return Err("strategy.profit_target must be positive".into());
        }
        if self.break_even_multiple <= Decimal::ZERO {
            return Err("strategy.break_even_multiple must be positive".into());
        }
        Ok(())
    }
}

impl MeanReversionStrategy {
    pub fn new(config: MeanReversionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MeanReversionConfig {
        &self.config
    }

    /// Direction a deviation reading asks for, if it clears the threshold
    pub fn entry_direction(&self, deviation: Decimal) -> Option<Direction> {
        if deviation < -self.config.threshold_pct {
            Some(Direction::Long)
        } else if deviation > self.config.threshold_pct {
            Some(Direction::Short)
        } else {
            None
        }
    }

    /// Initial risk distance for a position entered at `entry`
    pub fn stop_distance(&self, entry: Decimal) -> Decimal {
        entry * self.config.stop_loss_pct / Decimal::ONE_HUNDRED
    }

    /// Initial (stop, profit target) prices
    pub fn levels(&self, direction: Direction, entry: Decimal) -> (Decimal, Decimal) {
        let stop_distance = self.stop_distance(entry);
        let target_distance = match &self.config.profit_target {
            ProfitTarget::RiskMultiple { multiple } => stop_distance * multiple,
            ProfitTarget::Percent { percent } => entry * percent / Decimal::ONE_HUNDRED,
        };

        match direction {
            Direction::Long => (entry - stop_distance, entry + target_distance),
            Direction::Short => (entry + stop_distance, entry - target_distance),
        }
    }

    /// Has `price` moved far enough in favor to move the stop to entry
    pub fn break_even_reached(&self, position: &Position, price: Decimal) -> bool {
        let (Some(direction), Some(entry)) = (position.side, position.effective_entry_price)
        else {
            return false;
        };

        let trigger_distance = self.stop_distance(entry) * self.config.break_even_multiple;
        match direction {
            Direction::Long => price >= entry + trigger_distance,
            Direction::Short => price <= entry - trigger_distance,
        }
    }

    /// First exit rule `price` triggers for an open position
    pub fn exit_reason(
        &self,
        position: &Position,
        price: Decimal,
        mean: Option<Decimal>,
    ) -> Option<ExitReason> {
        let direction = position.side?;

        let favorable = |level: Decimal| match direction {
            Direction::Long => price >= level,
            Direction::Short => price <= level,
        };
        let adverse = |level: Decimal| match direction {
            Direction::Long => price <= level,
            Direction::Short => price >= level,
        };

        if position.profit_target_price.is_some_and(favorable) {
            return Some(ExitReason::ProfitTarget);
        }
        if position.stop_price.is_some_and(adverse) {
            return Some(ExitReason::StopLoss);
        }
        if self.config.exit_on_mean_reversion && mean.is_some_and(favorable) {
            return Some(ExitReason::MeanReversion);
        }
        None
    }
}

impl Default for MeanReversionStrategy {
    fn default() -> Self {
        Self::new(MeanReversionConfig::default())
    }
}

impl Strategy for MeanReversionStrategy {
    fn evaluate(&self, view: &MarketView<'_>, position: &Position) -> Signal {
        match position.side {
            None => {
                let Some(deviation) = view.deviation else {
                    return Signal::Hold;
                };

                match self.entry_direction(deviation) {
                    Some(direction) => {
                        tracing::info!(
                            "🎯 {} signal: price {} is {:.3}% from mean {:?}",
                            direction,
                            view.event.price,
                            deviation,
                            view.mean
                        );
                        Signal::Enter {
                            direction,
                            deviation,
                        }
                    }
                    None => Signal::Hold,
                }
            }
            Some(direction) => {
                let price = view.event.exit_price(direction);
                match self.exit_reason(position, price, view.mean) {
                    Some(reason) => Signal::Exit { reason },
                    None => Signal::Hold,
                }
            }
        }
    }

    fn name(&self) -> &str {
        "Mean Reversion"
    }
}
