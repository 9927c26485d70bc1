use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::models::{Direction, ExitReason, TradeAction, TradeRecord};
use crate::risk::{CooldownClock, EntryBlock, LossThrottle};
use crate::strategy::MeanReversionStrategy;

/// Lifecycle state of the single position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionState {
    Flat,
    Entering,
    Open,
    Exiting,
}

/// The one position an engine trades
///
/// `side` is None exactly when `quantity` is zero and there is no entry price.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub side: Option<Direction>,
    pub quantity: Decimal,
    pub effective_entry_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub profit_target_price: Option<Decimal>,
    pub break_even_applied: bool,
    pub opened_at_sample_index: u64,
}

impl Position {
    pub fn is_flat(&self) -> bool {
        self.side.is_none()
    }
}

/// Result of a filled entry order
#[derive(Debug, Clone)]
pub struct EntryFill {
    pub direction: Direction,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub stop_price: Decimal,
    pub profit_target_price: Decimal,
    pub deviation: Decimal,
    pub time: DateTime<Utc>,
}

/// State machine move requested from the wrong state
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransitionError {
    #[error("expected Flat, position is {0:?}")]
    NotFlat(PositionState),
    #[error("expected Open, position is {0:?}")]
    NotOpen(PositionState),
    #[error("expected Entering, position is {0:?}")]
    NotEntering(PositionState),
    #[error("expected Exiting, position is {0:?}")]
    NotExiting(PositionState),
}

/// Owns the position lifecycle and the risk state that gates it
///
/// Flat -> Entering -> Open -> Exiting -> Flat. A failed entry returns to
/// Flat without touching cooldown or loss counters. A failed exit returns to
/// Open with the unfilled remainder and halts new entries until cleared.
pub struct PositionManager {
    state: PositionState,
    position: Position,
    pending_direction: Option<Direction>,
    throttle: LossThrottle,
    cooldown: CooldownClock,
    sample_index: u64,
    halted: bool,
    unresolved_exit: Option<ExitReason>,
    break_even_check_interval: Duration,
    last_break_even_check: Option<DateTime<Utc>>,
    trade_log: Vec<TradeRecord>,
}

impl PositionManager {
    pub fn new(
        throttle: LossThrottle,
        cooldown: CooldownClock,
        break_even_check_interval: Duration,
    ) -> Self {
        Self {
            state: PositionState::Flat,
            position: Position::default(),
            pending_direction: None,
            throttle,
            cooldown,
            sample_index: 0,
            halted: false,
            unresolved_exit: None,
            break_even_check_interval,
            last_break_even_check: None,
            trade_log: Vec::new(),
        }
    }

    pub fn state(&self) -> PositionState {
        self.state
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    pub fn throttle(&self) -> &LossThrottle {
        &self.throttle
    }

    pub fn cooldown(&self) -> &CooldownClock {
        &self.cooldown
    }

    pub fn sample_index(&self) -> u64 {
        self.sample_index
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Exit reason still waiting to be completed after a failed exit
    pub fn unresolved_exit(&self) -> Option<ExitReason> {
        self.unresolved_exit
    }

    pub fn trade_log(&self) -> &[TradeRecord] {
        &self.trade_log
    }

    /// Count one evaluated price sample; returns its index
    pub fn record_sample(&mut self) -> u64 {
        self.sample_index += 1;
        self.sample_index
    }

    /// Check whether an entry signal in `direction` may be acted on
    ///
    /// A signal always clears the opposing loss streak, even when the entry
    /// itself is refused.
    pub fn check_entry(&mut self, direction: Direction) -> Result<(), EntryBlock> {
        if self.state == PositionState::Flat && self.throttle.record_signal(direction) {
            tracing::info!(
                "{} signal resets the {} stop-loss streak",
                direction,
                direction.opposite()
            );
        }

        if self.state != PositionState::Flat {
            return Err(EntryBlock::PositionBusy);
        }
        if self.halted {
            return Err(EntryBlock::Halted);
        }

        let remaining = self.cooldown.remaining(self.sample_index);
        if remaining > 0 {
            return Err(EntryBlock::Cooldown { remaining });
        }

        if !self.throttle.allows(direction) {
            return Err(EntryBlock::LossStreak {
                direction,
                losses: self.throttle.consecutive_losses(direction),
            });
        }

        Ok(())
    }

    /// Flat -> Entering
    pub fn begin_entry(&mut self, direction: Direction) -> Result<(), TransitionError> {
        if self.state != PositionState::Flat {
            return Err(TransitionError::NotFlat(self.state));
        }
        self.state = PositionState::Entering;
        self.pending_direction = Some(direction);
        Ok(())
    }

    /// Entering -> Open with the filled quantity
    ///
    /// A zero fill is treated as a failed entry.
    pub fn complete_entry(&mut self, fill: EntryFill) -> Result<(), TransitionError> {
        if self.state != PositionState::Entering {
            return Err(TransitionError::NotEntering(self.state));
        }
        if fill.quantity <= Decimal::ZERO {
            return self.abort_entry();
        }

        self.position = Position {
            side: Some(fill.direction),
            quantity: fill.quantity,
            effective_entry_price: Some(fill.entry_price),
            stop_price: Some(fill.stop_price),
            profit_target_price: Some(fill.profit_target_price),
            break_even_applied: false,
            opened_at_sample_index: self.sample_index,
        };
        self.state = PositionState::Open;
        self.pending_direction = None;
        self.last_break_even_check = None;

        self.trade_log.push(TradeRecord {
            time: fill.time,
            action: TradeAction::Enter,
            direction: fill.direction,
            price: fill.entry_price,
            quantity: fill.quantity,
            sample_index: self.sample_index,
            deviation: Some(fill.deviation),
            exit_reason: None,
        });

        tracing::info!(
            "✅ Entered {} {} @ {} (stop {}, target {})",
            fill.direction,
            fill.quantity,
            fill.entry_price,
            fill.stop_price,
            fill.profit_target_price
        );
        Ok(())
    }

    /// Entering -> Flat; no cooldown, no risk counter change
    pub fn abort_entry(&mut self) -> Result<(), TransitionError> {
        if self.state != PositionState::Entering {
            return Err(TransitionError::NotEntering(self.state));
        }
        tracing::warn!(
            "Entry {:?} aborted, staying flat",
            self.pending_direction
        );
        self.state = PositionState::Flat;
        self.pending_direction = None;
        Ok(())
    }

    /// Move the stop to entry once price has run far enough in favor
    ///
    /// Checks are spaced at least `break_even_check_interval` apart on event
    /// time. Returns true only on the check that applies the promotion.
    pub fn apply_break_even(
        &mut self,
        strategy: &MeanReversionStrategy,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> bool {
        if self.state != PositionState::Open || self.position.break_even_applied {
            return false;
        }

        if let Some(last) = self.last_break_even_check {
            // Negative elapsed (clock went backwards) fails to_std, run the check
            let due = (now - last)
                .to_std()
                .map(|elapsed| elapsed >= self.break_even_check_interval)
                .unwrap_or(true);
            if !due {
                return false;
            }
        }
        self.last_break_even_check = Some(now);

        if !strategy.break_even_reached(&self.position, price) {
            return false;
        }

        self.position.stop_price = self.position.effective_entry_price;
        self.position.break_even_applied = true;
        tracing::info!(
            "🛡️ Break-even: stop moved to entry {:?} at price {}",
            self.position.effective_entry_price,
            price
        );
        true
    }

    /// Open -> Exiting; returns the quantity to flatten
    pub fn begin_exit(&mut self, reason: ExitReason) -> Result<Decimal, TransitionError> {
        if self.state != PositionState::Open {
            return Err(TransitionError::NotOpen(self.state));
        }
        tracing::info!(
            "Exiting {:?} {} - {}",
            self.position.side,
            self.position.quantity,
            reason
        );
        self.state = PositionState::Exiting;
        Ok(self.position.quantity)
    }

    /// Exiting -> Flat; starts the cooldown and updates loss counters
    pub fn complete_exit(
        &mut self,
        reason: ExitReason,
        price: Decimal,
        time: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if self.state != PositionState::Exiting {
            return Err(TransitionError::NotExiting(self.state));
        }

        if let Some(direction) = self.position.side {
            match reason {
                ExitReason::StopLoss => {
                    let losses = self.throttle.record_stop_loss(direction);
                    tracing::info!("{} stop loss count is now {}", direction, losses);
                }
                ExitReason::ProfitTarget => self.throttle.record_profit(direction),
                ExitReason::MeanReversion => {}
            }

            self.trade_log.push(TradeRecord {
                time,
                action: TradeAction::Exit,
                direction,
                price,
                quantity: self.position.quantity,
                sample_index: self.sample_index,
                deviation: None,
                exit_reason: Some(reason),
            });

            tracing::info!("🚀 Exited {} at {} - {}", direction, price, reason);
        }

        self.reset_to_flat();
        Ok(())
    }

    /// Exiting -> Open after the exit could not be completed
    ///
    /// The position keeps only the unfilled `remaining` quantity, new entries
    /// are halted and the exit stays pending for the next evaluation.
    pub fn fail_exit(
        &mut self,
        reason: ExitReason,
        remaining: Decimal,
    ) -> Result<(), TransitionError> {
        if self.state != PositionState::Exiting {
            return Err(TransitionError::NotExiting(self.state));
        }
        self.position.quantity = remaining;
        self.state = PositionState::Open;
        self.halted = true;
        self.unresolved_exit = Some(reason);
        tracing::error!(
            "🚨 Exit incomplete: {} still open, entries halted until cleared",
            remaining
        );
        Ok(())
    }

    /// Operator acknowledgment after resolving exposure on the exchange
    ///
    /// If an exit was left unresolved, the remainder is considered flattened
    /// externally and the position is reset.
    pub fn clear_halt(&mut self) {
        if self.unresolved_exit.is_some() && self.state == PositionState::Open {
            tracing::warn!(
                "Halt cleared with {} {:?} outstanding, treating it as closed externally",
                self.position.quantity,
                self.position.side
            );
            self.reset_to_flat();
        }
        self.halted = false;
        tracing::info!("Trading halt cleared");
    }

    fn reset_to_flat(&mut self) {
        self.position = Position::default();
        self.state = PositionState::Flat;
        self.unresolved_exit = None;
        self.last_break_even_check = None;
        self.cooldown.record_close(self.sample_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use rust_decimal_macros::dec;

    fn manager(cooldown: u64) -> PositionManager {
        PositionManager::new(
            LossThrottle::new(2),
            CooldownClock::new(cooldown),
            Duration::ZERO,
        )
    }

    fn long_fill(strategy: &MeanReversionStrategy, entry: Decimal) -> EntryFill {
        let (stop, target) = strategy.levels(Direction::Long, entry);
        EntryFill {
            direction: Direction::Long,
            quantity: dec!(0.5),
            entry_price: entry,
            stop_price: stop,
            profit_target_price: target,
            deviation: dec!(-0.3),
            time: Utc::now(),
        }
    }

    fn open_long(pm: &mut PositionManager, strategy: &MeanReversionStrategy) {
        pm.check_entry(Direction::Long).unwrap();
        pm.begin_entry(Direction::Long).unwrap();
        pm.complete_entry(long_fill(strategy, dec!(1000))).unwrap();
    }

    #[test]
    fn test_entry_lifecycle() {
        let strategy = MeanReversionStrategy::default();
        let mut pm = manager(0);
        pm.record_sample();

        open_long(&mut pm, &strategy);

        assert_eq!(pm.state(), PositionState::Open);
        let position = pm.position();
        assert_eq!(position.side, Some(Direction::Long));
        assert_eq!(position.quantity, dec!(0.5));
        assert_eq!(position.effective_entry_price, Some(dec!(1000)));
        assert_eq!(position.stop_price, Some(dec!(998)));
        assert_eq!(position.profit_target_price, Some(dec!(1008)));
        assert_eq!(position.opened_at_sample_index, 1);
        assert_eq!(pm.trade_log().len(), 1);

        assert_eq!(pm.check_entry(Direction::Long), Err(EntryBlock::PositionBusy));
    }

    #[test]
    fn test_failed_entry_stays_flat_without_cooldown() {
        let mut pm = manager(5);
        pm.record_sample();

        pm.begin_entry(Direction::Short).unwrap();
        assert_eq!(pm.state(), PositionState::Entering);
        assert!(pm.begin_entry(Direction::Short).is_err());

        pm.abort_entry().unwrap();
        assert_eq!(pm.state(), PositionState::Flat);
        assert!(pm.position().is_flat());
        assert_eq!(pm.cooldown().last_close(), None);
        assert!(pm.check_entry(Direction::Short).is_ok());
        assert!(pm.trade_log().is_empty());
    }

    #[test]
    fn test_zero_fill_entry_is_an_abort() {
        let strategy = MeanReversionStrategy::default();
        let mut pm = manager(0);
        pm.begin_entry(Direction::Long).unwrap();

        let mut fill = long_fill(&strategy, dec!(1000));
        fill.quantity = Decimal::ZERO;
        pm.complete_entry(fill).unwrap();

        assert_eq!(pm.state(), PositionState::Flat);
        assert_eq!(pm.position(), &Position::default());
    }

    #[test]
    fn test_break_even_is_idempotent() {
        let strategy = MeanReversionStrategy::default();
        let mut pm = manager(0);
        open_long(&mut pm, &strategy);
        let now = Utc::now();

        assert!(!pm.apply_break_even(&strategy, dec!(1003), now));
        assert_eq!(pm.position().stop_price, Some(dec!(998)));

        assert!(pm.apply_break_even(&strategy, dec!(1004), now));
        assert!(pm.position().break_even_applied);
        assert_eq!(pm.position().stop_price, Some(dec!(1000)));

        for price in [dec!(1005), dec!(1007), dec!(1004.5)] {
            assert!(!pm.apply_break_even(&strategy, price, now));
            assert_eq!(pm.position().stop_price, pm.position().effective_entry_price);
        }
    }

    #[test]
    fn test_break_even_checks_are_rate_limited() {
        let strategy = MeanReversionStrategy::default();
        let mut pm = PositionManager::new(
            LossThrottle::new(2),
            CooldownClock::new(0),
            Duration::from_secs(300),
        );
        open_long(&mut pm, &strategy);
        let start = Utc::now();

        // First check runs immediately but the move is too small
        assert!(!pm.apply_break_even(&strategy, dec!(1001), start));

        // Within the interval the check is skipped even though price qualifies
        assert!(!pm.apply_break_even(&strategy, dec!(1005), start + TimeDelta::seconds(60)));
        assert!(!pm.position().break_even_applied);

        // Once the interval has passed it runs
        assert!(pm.apply_break_even(&strategy, dec!(1005), start + TimeDelta::seconds(300)));
        assert_eq!(pm.position().stop_price, Some(dec!(1000)));
    }

    #[test]
    fn test_exit_updates_risk_state_and_cooldown() {
        let strategy = MeanReversionStrategy::default();
        let mut pm = manager(3);
        pm.record_sample();
        open_long(&mut pm, &strategy);

        pm.record_sample();
        assert_eq!(pm.begin_exit(ExitReason::StopLoss).unwrap(), dec!(0.5));
        assert_eq!(pm.state(), PositionState::Exiting);
        pm.complete_exit(ExitReason::StopLoss, dec!(998), Utc::now())
            .unwrap();

        assert_eq!(pm.state(), PositionState::Flat);
        assert!(pm.position().is_flat());
        assert_eq!(pm.throttle().consecutive_losses(Direction::Long), 1);
        assert_eq!(pm.cooldown().last_close(), Some(2));
        assert_eq!(
            pm.check_entry(Direction::Long),
            Err(EntryBlock::Cooldown { remaining: 3 })
        );

        let exit = pm.trade_log().last().unwrap();
        assert_eq!(exit.action, TradeAction::Exit);
        assert_eq!(exit.exit_reason, Some(ExitReason::StopLoss));
    }

    #[test]
    fn test_loss_streak_blocks_until_reversal() {
        let strategy = MeanReversionStrategy::default();
        let mut pm = manager(0);

        for _ in 0..2 {
            open_long(&mut pm, &strategy);
            pm.begin_exit(ExitReason::StopLoss).unwrap();
            pm.complete_exit(ExitReason::StopLoss, dec!(998), Utc::now())
                .unwrap();
        }

        assert_eq!(
            pm.check_entry(Direction::Long),
            Err(EntryBlock::LossStreak {
                direction: Direction::Long,
                losses: 2
            })
        );

        // Short signal fires: resets the long streak
        assert!(pm.check_entry(Direction::Short).is_ok());
        assert_eq!(pm.throttle().consecutive_losses(Direction::Long), 0);
        assert!(pm.check_entry(Direction::Long).is_ok());
    }

    #[test]
    fn test_profit_exit_resets_streak() {
        let strategy = MeanReversionStrategy::default();
        let mut pm = manager(0);

        open_long(&mut pm, &strategy);
        pm.begin_exit(ExitReason::StopLoss).unwrap();
        pm.complete_exit(ExitReason::StopLoss, dec!(998), Utc::now())
            .unwrap();
        assert_eq!(pm.throttle().consecutive_losses(Direction::Long), 1);

        open_long(&mut pm, &strategy);
        pm.begin_exit(ExitReason::ProfitTarget).unwrap();
        pm.complete_exit(ExitReason::ProfitTarget, dec!(1008), Utc::now())
            .unwrap();
        assert_eq!(pm.throttle().consecutive_losses(Direction::Long), 0);
    }

    #[test]
    fn test_failed_exit_halts_entries() {
        let strategy = MeanReversionStrategy::default();
        let mut pm = manager(0);
        open_long(&mut pm, &strategy);

        pm.begin_exit(ExitReason::StopLoss).unwrap();
        pm.fail_exit(ExitReason::StopLoss, dec!(0.2)).unwrap();

        assert_eq!(pm.state(), PositionState::Open);
        assert_eq!(pm.position().quantity, dec!(0.2));
        assert!(pm.is_halted());
        assert_eq!(pm.unresolved_exit(), Some(ExitReason::StopLoss));

        // A later exit that succeeds flattens but keeps the halt
        pm.begin_exit(ExitReason::StopLoss).unwrap();
        pm.complete_exit(ExitReason::StopLoss, dec!(997), Utc::now())
            .unwrap();
        assert!(pm.position().is_flat());
        assert_eq!(pm.unresolved_exit(), None);
        assert_eq!(pm.check_entry(Direction::Long), Err(EntryBlock::Halted));

        pm.clear_halt();
        assert!(pm.check_entry(Direction::Long).is_ok());
    }

    #[test]
    fn test_clear_halt_with_outstanding_exposure() {
        let strategy = MeanReversionStrategy::default();
        let mut pm = manager(0);
        open_long(&mut pm, &strategy);
        pm.begin_exit(ExitReason::ProfitTarget).unwrap();
        pm.fail_exit(ExitReason::ProfitTarget, dec!(0.5)).unwrap();

        pm.clear_halt();
        assert!(!pm.is_halted());
        assert_eq!(pm.state(), PositionState::Flat);
        assert!(pm.position().is_flat());
    }

    #[test]
    fn test_invalid_transitions() {
        let mut pm = manager(0);
        assert!(matches!(
            pm.begin_exit(ExitReason::StopLoss),
            Err(TransitionError::NotOpen(PositionState::Flat))
        ));
        assert!(pm.abort_entry().is_err());
        assert!(pm
            .complete_exit(ExitReason::StopLoss, dec!(1), Utc::now())
            .is_err());
    }
}
