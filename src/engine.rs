use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant};

use crate::api::Brokerage;
use crate::config::{BotConfig, SignalSource};
use crate::error::{EngineError, ExecutionError};
use crate::execution::{
    EntryFill, FillPolicy, OrderExecutor, OrderKind, PositionManager, PositionState, RetryPolicy,
};
use crate::indicators::{DeviationIndicator, RefreshMode};
use crate::models::{Direction, ExitReason, PriceEvent, Signal, TradeRecord};
use crate::risk::{CooldownClock, EntryBlock, LossThrottle};
use crate::strategy::{EntryPriceBasis, MarketView, MeanReversionStrategy, Strategy};

/// Messages drained by the engine actor, one at a time
#[derive(Debug, Clone)]
pub enum EngineCommand {
    Price(PriceEvent),
    /// Timer tick for periodic mean refresh
    RefreshIndicator,
    /// Operator acknowledgment of a fatal exposure alert
    ClearHalt,
}

/// Conditions an operator has to act on
#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    FatalExposureMismatch {
        direction: Direction,
        executed: Decimal,
        remaining: Decimal,
    },
}

/// What one price event led to
#[derive(Debug, Clone, PartialEq)]
pub enum EngineOutcome {
    /// Intra-bar update in bar-close mode
    Ignored,
    Held,
    Entered {
        direction: Direction,
        quantity: Decimal,
        entry_price: Decimal,
    },
    EntrySkipped(EntryBlock),
    EntryFailed(EngineError),
    Exited {
        reason: ExitReason,
        price: Decimal,
    },
    ExitFailed(EngineError),
}

/// Single-position trading engine
///
/// Owns the indicator, strategy, position state and order executor. All
/// mutation happens through `on_price_event` and `handle`, which the actor
/// loop in `run` calls sequentially.
pub struct TradingEngine {
    indicator: DeviationIndicator,
    strategy: MeanReversionStrategy,
    positions: PositionManager,
    executor: OrderExecutor,
    brokerage: Arc<dyn Brokerage>,
    quote_asset: String,
    signal_source: SignalSource,
    risk_per_trade_pct: Decimal,
    alerts: Option<mpsc::UnboundedSender<Alert>>,
}

impl TradingEngine {
    pub fn new(config: &BotConfig, brokerage: Arc<dyn Brokerage>, step_size: Decimal) -> Self {
        let executor = OrderExecutor::new(
            brokerage.clone(),
            config.symbol.clone(),
            step_size,
            RetryPolicy::from_config(&config.execution),
            FillPolicy::from_config(&config.execution),
        )
        .with_rate_limit(config.execution.max_orders_per_second);

        let positions = PositionManager::new(
            LossThrottle::new(config.risk.max_consecutive_losses),
            CooldownClock::new(config.risk.cooldown_samples),
            config.risk.break_even_check_interval(),
        );

        Self {
            indicator: DeviationIndicator::new(
                config.indicator.window_length,
                config.indicator.refresh_mode,
            ),
            strategy: MeanReversionStrategy::new(config.strategy.clone()),
            positions,
            executor,
            brokerage,
            quote_asset: config.quote_asset.clone(),
            signal_source: config.indicator.signal_source,
            risk_per_trade_pct: config.risk.risk_per_trade_pct,
            alerts: None,
        }
    }

    /// Build an engine using the exchange's step size for `config.symbol`
    pub async fn connect(
        config: &BotConfig,
        brokerage: Arc<dyn Brokerage>,
    ) -> Result<Self, EngineError> {
        let step_size = brokerage.step_size(&config.symbol).await?;
        if step_size <= Decimal::ZERO {
            return Err(EngineError::DataGap(format!(
                "invalid step size {} for {}",
                step_size, config.symbol
            )));
        }
        tracing::info!("{} step size: {}", config.symbol, step_size);
        Ok(Self::new(config, brokerage, step_size))
    }

    pub fn with_alerts(mut self, alerts: mpsc::UnboundedSender<Alert>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn indicator(&self) -> &DeviationIndicator {
        &self.indicator
    }

    pub fn positions(&self) -> &PositionManager {
        &self.positions
    }

    pub fn trade_log(&self) -> &[TradeRecord] {
        self.positions.trade_log()
    }

    /// Actor loop: drain commands until shutdown or every sender is gone
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<EngineCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Self {
        tracing::info!(
            "💹 Trading engine started ({}, window {})",
            self.strategy.name(),
            self.indicator.window_length()
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                command = commands.recv() => match command {
                    Some(command) => {
                        self.handle(command).await;
                    }
                    None => break,
                },
            }
        }

        tracing::info!(
            "Trading engine stopped after {} samples, {} journal entries",
            self.positions.sample_index(),
            self.trade_log().len()
        );
        self
    }

    pub async fn handle(&mut self, command: EngineCommand) -> Option<EngineOutcome> {
        match command {
            EngineCommand::Price(event) => Some(self.on_price_event(event).await),
            EngineCommand::RefreshIndicator => {
                match self.indicator.refresh() {
                    Some(mean) => tracing::debug!(
                        %mean,
                        deviation = ?self.indicator.last_deviation(),
                        "Moving average refreshed"
                    ),
                    None => tracing::debug!(
                        "Refresh skipped, window {}/{}",
                        self.indicator.len(),
                        self.indicator.window_length()
                    ),
                }
                None
            }
            EngineCommand::ClearHalt => {
                self.positions.clear_halt();
                None
            }
        }
    }

    /// Run one price event through indicator, risk rules and execution
    pub async fn on_price_event(&mut self, event: PriceEvent) -> EngineOutcome {
        if self.signal_source == SignalSource::BarClose && !event.is_final {
            return EngineOutcome::Ignored;
        }

        let sample_index = self.positions.record_sample();
        let deviation = self.indicator.observe_at(event.price, event.received_at);
        tracing::debug!(
            sample = sample_index,
            price = %event.price,
            mean = ?self.indicator.current_mean(),
            deviation = ?deviation,
            "Price observed"
        );

        if let Some(direction) = self.positions.position().side {
            self.positions.apply_break_even(
                &self.strategy,
                event.exit_price(direction),
                event.received_at,
            );
        }

        if let Some(reason) = self.positions.unresolved_exit() {
            tracing::warn!("Re-attempting unresolved exit ({})", reason);
            return self.exit(reason, &event).await;
        }

        let view = MarketView {
            event: &event,
            deviation,
            mean: self.indicator.current_mean(),
        };
        let signal = self.strategy.evaluate(&view, self.positions.position());
        self.dispatch(signal, &event).await
    }

    async fn dispatch(&mut self, signal: Signal, event: &PriceEvent) -> EngineOutcome {
        match signal {
            Signal::Hold => EngineOutcome::Held,
            Signal::Enter {
                direction,
                deviation,
            } => self.enter(direction, deviation, event).await,
            Signal::Exit { reason } => self.exit(reason, event).await,
        }
    }

    async fn enter(
        &mut self,
        direction: Direction,
        deviation: Decimal,
        event: &PriceEvent,
    ) -> EngineOutcome {
        if let Err(block) = self.positions.check_entry(direction) {
            tracing::info!("⏸️  {} entry skipped: {}", direction, block);
            return EngineOutcome::EntrySkipped(block);
        }

        if let Err(err) = self.positions.begin_entry(direction) {
            return EngineOutcome::EntryFailed(err.into());
        }

        match self.open_position(direction, deviation, event).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!("❌ {} entry failed: {}", direction, err);
                if let Err(transition) = self.positions.abort_entry() {
                    return EngineOutcome::EntryFailed(transition.into());
                }
                EngineOutcome::EntryFailed(err)
            }
        }
    }

    async fn open_position(
        &mut self,
        direction: Direction,
        deviation: Decimal,
        event: &PriceEvent,
    ) -> Result<EngineOutcome, EngineError> {
        let signal_price = event.price;
        let quantity = self.position_size(signal_price).await?;

        let report = self
            .executor
            .execute(direction.entry_side(), quantity, OrderKind::Entry)
            .await?;

        let entry_price = match self.strategy.config().entry_price_basis {
            EntryPriceBasis::SignalMid => signal_price,
            EntryPriceBasis::ExecutionPrice => report.average_price.unwrap_or(signal_price),
        };
        let (stop_price, profit_target_price) = self.strategy.levels(direction, entry_price);

        self.positions.complete_entry(EntryFill {
            direction,
            quantity: report.executed_quantity,
            entry_price,
            stop_price,
            profit_target_price,
            deviation,
            time: event.received_at,
        })?;

        Ok(EngineOutcome::Entered {
            direction,
            quantity: report.executed_quantity,
            entry_price,
        })
    }

    /// Risk a fixed share of the quote balance over the stop distance
    async fn position_size(&self, entry_price: Decimal) -> Result<Decimal, EngineError> {
        let balance = self
            .brokerage
            .account_balance(&self.quote_asset)
            .await
            .map_err(|err| EngineError::DataGap(format!("{} balance: {}", self.quote_asset, err)))?;

        let risk_amount = balance * self.risk_per_trade_pct / Decimal::ONE_HUNDRED;
        let stop_distance = self.strategy.stop_distance(entry_price);
        if stop_distance <= Decimal::ZERO {
            return Err(EngineError::DataGap(format!(
                "no stop distance at price {}",
                entry_price
            )));
        }

        let quantity = self.executor.round_to_step(risk_amount / stop_distance);
        tracing::debug!(%balance, %risk_amount, %stop_distance, %quantity, "Position sized");

        if quantity <= Decimal::ZERO {
            return Err(EngineError::InsufficientBalance {
                balance,
                step_size: self.executor.step_size(),
            });
        }
        Ok(quantity)
    }

    async fn exit(&mut self, reason: ExitReason, event: &PriceEvent) -> EngineOutcome {
        let Some(direction) = self.positions.position().side else {
            return EngineOutcome::Held;
        };

        let quantity = match self.positions.begin_exit(reason) {
            Ok(quantity) => quantity,
            Err(err) => return EngineOutcome::ExitFailed(err.into()),
        };
        let fallback_price = event.exit_price(direction);

        let result = self
            .executor
            .execute(direction.exit_side(), quantity, OrderKind::Exit)
            .await;

        let price = match result {
            Ok(report) => report.average_price.unwrap_or(fallback_price),
            Err(ExecutionError::ZeroQuantity { requested, .. }) => {
                tracing::warn!(
                    "Remaining {} is below the step size, treating position as closed",
                    requested
                );
                fallback_price
            }
            Err(ExecutionError::FatalExposureMismatch {
                executed,
                remaining,
            }) => {
                return self.fail_exit(reason, direction, executed, remaining);
            }
            Err(err) => {
                tracing::error!("Exit order failed: {}", err);
                return self.fail_exit(reason, direction, Decimal::ZERO, quantity);
            }
        };

        if let Err(err) = self.positions.complete_exit(reason, price, event.received_at) {
            return EngineOutcome::ExitFailed(err.into());
        }
        self.log_balance().await;
        EngineOutcome::Exited { reason, price }
    }

    async fn log_balance(&self) {
        match self.brokerage.account_balance(&self.quote_asset).await {
            Ok(balance) => tracing::info!("💰 {} balance: {}", self.quote_asset, balance),
            Err(err) => tracing::warn!("Failed to fetch {} balance: {}", self.quote_asset, err),
        }
    }

    fn fail_exit(
        &mut self,
        reason: ExitReason,
        direction: Direction,
        executed: Decimal,
        remaining: Decimal,
    ) -> EngineOutcome {
        if let Err(err) = self.positions.fail_exit(reason, remaining) {
            return EngineOutcome::ExitFailed(err.into());
        }

        tracing::error!(
            "🚨 FATAL: {} exit left {} exposed after executing {}",
            direction,
            remaining,
            executed
        );
        if let Some(alerts) = &self.alerts {
            let alert = Alert::FatalExposureMismatch {
                direction,
                executed,
                remaining,
            };
            if alerts.send(alert).is_err() {
                tracing::error!("Alert channel closed, operator not notified");
            }
        }

        EngineOutcome::ExitFailed(
            ExecutionError::FatalExposureMismatch {
                executed,
                remaining,
            }
            .into(),
        )
    }

    pub fn state(&self) -> PositionState {
        self.positions.state()
    }
}

/// Feed `RefreshIndicator` into the engine mailbox on a fixed period
///
/// Only meaningful with `RefreshMode::Periodic`; the first refresh fires one
/// full period after start.
pub async fn refresh_timer(
    period: Duration,
    sink: mpsc::Sender<EngineCommand>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if sink.send(EngineCommand::RefreshIndicator).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Whether `config` needs the refresh timer running
pub fn needs_refresh_timer(config: &BotConfig) -> bool {
    config.indicator.refresh_mode == RefreshMode::Periodic
}
