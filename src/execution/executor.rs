use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{Quota, RateLimiter};
use rust_decimal::Decimal;
use tokio::time::Instant;
use uuid::Uuid;

use super::retry::{FillPolicy, RetryPolicy};
use crate::api::Brokerage;
use crate::error::{ExchangeError, ExecutionError};
use crate::models::{Order, OrderHandle, OrderReport, OrderSide, OrderStatus};

type OrderRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    /// A partial fill is accepted as the new position size
    Entry,
    /// Must flatten the full quantity; unfilled remainders are re-ordered
    Exit,
}

/// Outcome of one `execute` call, possibly spanning several orders
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub kind: OrderKind,
    pub side: OrderSide,
    pub requested_quantity: Decimal,
    pub executed_quantity: Decimal,
    pub status: OrderStatus,
    /// Volume-weighted over all fills
    pub average_price: Option<Decimal>,
    pub orders: Vec<Order>,
}

/// Places market orders with step rounding, retries and fill polling
pub struct OrderExecutor {
    brokerage: Arc<dyn Brokerage>,
    symbol: String,
    step_size: Decimal,
    retry: RetryPolicy,
    fill: FillPolicy,
    rate_limiter: Option<Arc<OrderRateLimiter>>,
}

impl OrderExecutor {
    pub fn new(
        brokerage: Arc<dyn Brokerage>,
        symbol: impl Into<String>,
        step_size: Decimal,
        retry: RetryPolicy,
        fill: FillPolicy,
    ) -> Self {
        Self {
            brokerage,
            symbol: symbol.into(),
            step_size,
            retry,
            fill,
            rate_limiter: None,
        }
    }

    /// Cap order placements per second; 0 leaves placement unthrottled
    pub fn with_rate_limit(mut self, orders_per_second: u32) -> Self {
        self.rate_limiter = NonZeroU32::new(orders_per_second)
            .map(|rate| Arc::new(RateLimiter::direct(Quota::per_second(rate))));
        self
    }

    pub fn step_size(&self) -> Decimal {
        self.step_size
    }

    /// Round down to a whole number of steps
    pub fn round_to_step(&self, quantity: Decimal) -> Decimal {
        if self.step_size <= Decimal::ZERO {
            return quantity;
        }
        ((quantity / self.step_size).floor() * self.step_size).normalize()
    }

    /// Execute a market order for `quantity`
    ///
    /// Entries accept whatever filled (at least something). Exits keep
    /// ordering the unfilled remainder until flat, and report
    /// `FatalExposureMismatch` if that cannot be achieved.
    pub async fn execute(
        &self,
        side: OrderSide,
        quantity: Decimal,
        kind: OrderKind,
    ) -> Result<ExecutionReport, ExecutionError> {
        let requested = self.round_to_step(quantity);
        if requested <= Decimal::ZERO {
            return Err(ExecutionError::ZeroQuantity {
                requested: quantity,
                step_size: self.step_size,
            });
        }

        match kind {
            OrderKind::Entry => self.execute_entry(side, requested).await,
            OrderKind::Exit => self.execute_exit(side, requested).await,
        }
    }

    async fn execute_entry(
        &self,
        side: OrderSide,
        requested: Decimal,
    ) -> Result<ExecutionReport, ExecutionError> {
        let order = self.submit(side, requested).await?;

        if order.executed_quantity <= Decimal::ZERO {
            tracing::warn!("Entry {:?} {} did not fill", side, requested);
            return Err(ExecutionError::Unfilled { requested });
        }
        if order.executed_quantity < requested {
            tracing::info!(
                "Entry partially filled: {} of {}",
                order.executed_quantity,
                requested
            );
        }

        Ok(summarize(OrderKind::Entry, side, requested, vec![order]))
    }

    async fn execute_exit(
        &self,
        side: OrderSide,
        requested: Decimal,
    ) -> Result<ExecutionReport, ExecutionError> {
        let mut orders: Vec<Order> = Vec::new();
        let mut executed = Decimal::ZERO;
        let mut empty_rounds = 0u32;

        loop {
            let remaining = self.round_to_step(requested - executed);
            if remaining <= Decimal::ZERO {
                break;
            }

            let order = match self.submit(side, remaining).await {
                Ok(order) => order,
                Err(err) => {
                    tracing::error!("Exit order failed: {}", err);
                    return Err(ExecutionError::FatalExposureMismatch {
                        executed,
                        remaining,
                    });
                }
            };

            let filled = order.executed_quantity.min(remaining);
            executed += filled;
            orders.push(order);

            if filled <= Decimal::ZERO {
                empty_rounds += 1;
                tracing::warn!(
                    "Exit order for {} filled nothing ({}/{})",
                    remaining,
                    empty_rounds,
                    self.retry.max_attempts
                );
                if empty_rounds >= self.retry.max_attempts {
                    return Err(ExecutionError::FatalExposureMismatch {
                        executed,
                        remaining,
                    });
                }
                tokio::time::sleep(self.retry.delay(empty_rounds)).await;
                continue;
            }

            empty_rounds = 0;
            if executed < requested {
                tracing::info!(
                    "Exit partially filled: {} of {}, re-ordering remainder",
                    executed,
                    requested
                );
            }
        }

        Ok(summarize(OrderKind::Exit, side, requested, orders))
    }

    /// Place one order (with retries) and wait for it to settle
    async fn submit(&self, side: OrderSide, quantity: Decimal) -> Result<Order, ExecutionError> {
        let mut order = Order::market(side, quantity);
        let handle = self.place_with_retry(&order).await?;
        order.exchange_order_id = Some(handle.order_id.clone());

        let report = self.await_fill(&handle).await;
        order.apply(&report);

        tracing::debug!(
            order_id = %handle.order_id,
            status = %order.status,
            executed = %order.executed_quantity,
            "Order settled"
        );
        Ok(order)
    }

    async fn place_with_retry(&self, order: &Order) -> Result<OrderHandle, ExecutionError> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            if let Some(limiter) = &self.rate_limiter {
                limiter.until_ready().await;
            }

            match self
                .brokerage
                .place_market_order(&self.symbol, order.side, order.requested_quantity, order.id)
                .await
            {
                Ok(handle) => return Ok(handle),
                Err(err) if attempt >= self.retry.max_attempts => {
                    return Err(ExecutionError::RetriesExhausted {
                        attempts: attempt,
                        last_error: err,
                    });
                }
                Err(err) => {
                    let delay = self.retry.delay(attempt);
                    tracing::warn!(
                        "Order placement attempt {}/{} failed: {} - retrying in {:?}",
                        attempt,
                        self.retry.max_attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Poll until the order is terminal or the wait budget is spent
    ///
    /// Always polls at least once; returns the last status seen.
    async fn await_fill(&self, handle: &OrderHandle) -> OrderReport {
        let deadline = Instant::now() + self.fill.max_wait;
        let mut last = OrderReport::pending();

        loop {
            match self.brokerage.order_status(&self.symbol, handle).await {
                Ok(report) => {
                    let terminal =
                        matches!(report.status, OrderStatus::Filled | OrderStatus::Failed);
                    last = report;
                    if terminal {
                        break;
                    }
                }
                Err(err) => log_poll_error(handle, &err),
            }

            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.fill.poll_interval).await;
        }

        last
    }
}

fn log_poll_error(handle: &OrderHandle, err: &ExchangeError) {
    tracing::warn!(order_id = %handle.order_id, "Order status poll failed: {}", err);
}

fn summarize(
    kind: OrderKind,
    side: OrderSide,
    requested: Decimal,
    orders: Vec<Order>,
) -> ExecutionReport {
    let executed: Decimal = orders.iter().map(|o| o.executed_quantity).sum();

    let notional: Decimal = orders
        .iter()
        .filter_map(|o| o.average_price.map(|price| price * o.executed_quantity))
        .sum();
    let average_price = if executed > Decimal::ZERO && notional > Decimal::ZERO {
        Some(notional / executed)
    } else {
        None
    };

    let status = if executed >= requested {
        OrderStatus::Filled
    } else if executed > Decimal::ZERO {
        OrderStatus::PartiallyFilled
    } else {
        OrderStatus::Failed
    };

    ExecutionReport {
        kind,
        side,
        requested_quantity: requested,
        executed_quantity: executed,
        status,
        average_price,
        orders,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{PaperExchange, PaperFill};
    use crate::config::PaperConfig;
    use rust_decimal_macros::dec;

    fn exchange() -> Arc<PaperExchange> {
        let config = PaperConfig {
            starting_price: dec!(100),
            step_size: dec!(0.01),
            ..Default::default()
        };
        Arc::new(PaperExchange::new(&config, "USDT"))
    }

    fn executor(exchange: &Arc<PaperExchange>) -> OrderExecutor {
        OrderExecutor::new(
            exchange.clone(),
            "BTCUSDT",
            dec!(0.01),
            RetryPolicy::default(),
            FillPolicy::default(),
        )
    }

    #[test]
    fn test_round_to_step() {
        let exchange = exchange();
        let executor = executor(&exchange);
        assert_eq!(executor.round_to_step(dec!(1.239)), dec!(1.23));
        assert_eq!(executor.round_to_step(dec!(0.5)), dec!(0.5));
        assert_eq!(executor.round_to_step(dec!(0.009)), dec!(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_quantity_rejected_before_placement() {
        let exchange = exchange();
        let executor = executor(&exchange);

        let err = executor
            .execute(OrderSide::Buy, dec!(0.004), OrderKind::Entry)
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutionError::ZeroQuantity { .. }));
        assert!(exchange.placed_orders().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_without_quantity_rejected_before_placement() {
        let exchange = exchange();
        let executor = executor(&exchange);

        for quantity in [Decimal::ZERO, dec!(-0.5)] {
            let err = executor
                .execute(OrderSide::Sell, quantity, OrderKind::Exit)
                .await
                .unwrap_err();
            assert_eq!(
                err,
                ExecutionError::ZeroQuantity {
                    requested: quantity,
                    step_size: dec!(0.01),
                }
            );
        }
        assert!(exchange.placed_orders().is_empty());
        assert!(exchange.placement_attempts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_full_fill() {
        let exchange = exchange();
        let executor = executor(&exchange);

        let report = executor
            .execute(OrderSide::Buy, dec!(1.005), OrderKind::Entry)
            .await
            .unwrap();

        assert_eq!(report.requested_quantity, dec!(1));
        assert_eq!(report.executed_quantity, dec!(1));
        assert_eq!(report.status, OrderStatus::Filled);
        assert_eq!(report.average_price, Some(dec!(100)));
        assert_eq!(report.orders.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_partial_fill_is_accepted() {
        let exchange = exchange();
        exchange.script_fills([PaperFill::Fraction(dec!(0.6))]);
        let executor = executor(&exchange);

        let report = executor
            .execute(OrderSide::Sell, dec!(1), OrderKind::Entry)
            .await
            .unwrap();

        assert_eq!(report.executed_quantity, dec!(0.6));
        assert_eq!(report.status, OrderStatus::PartiallyFilled);
        assert_eq!(exchange.placed_orders().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_without_fill_fails() {
        let exchange = exchange();
        exchange.script_fills([PaperFill::Nothing]);
        let executor = executor(&exchange);

        let err = executor
            .execute(OrderSide::Buy, dec!(1), OrderKind::Entry)
            .await
            .unwrap_err();

        assert_eq!(err, ExecutionError::Unfilled { requested: dec!(1) });
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_reorders_remainder_until_flat() {
        let exchange = exchange();
        exchange.script_fills([
            PaperFill::Quantity(dec!(0.4)),
            PaperFill::Quantity(dec!(0.35)),
            PaperFill::Full,
        ]);
        let executor = executor(&exchange);

        let report = executor
            .execute(OrderSide::Sell, dec!(1), OrderKind::Exit)
            .await
            .unwrap();

        assert_eq!(report.executed_quantity, dec!(1));
        assert_eq!(report.status, OrderStatus::Filled);
        assert_eq!(report.orders.len(), 3);

        let quantities: Vec<Decimal> = exchange
            .placed_orders()
            .iter()
            .map(|order| order.quantity)
            .collect();
        assert_eq!(quantities, vec![dec!(1), dec!(0.6), dec!(0.25)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let exchange = exchange();
        exchange.fail_next_placements(1, ExchangeError::Transport("timeout".into()));
        let executor = executor(&exchange);

        let started = Instant::now();
        let report = executor
            .execute(OrderSide::Buy, dec!(1), OrderKind::Entry)
            .await
            .unwrap();

        assert_eq!(report.executed_quantity, dec!(1));
        assert!(started.elapsed() >= std::time::Duration::from_secs(1));

        // Both attempts reuse the same client order id
        let attempts = exchange.placement_attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0], attempts[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_retries_exhausted() {
        let exchange = exchange();
        exchange.fail_next_placements(3, ExchangeError::Transport("down".into()));
        let executor = executor(&exchange);

        let err = executor
            .execute(OrderSide::Buy, dec!(1), OrderKind::Entry)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ExecutionError::RetriesExhausted {
                attempts: 3,
                last_error: ExchangeError::Transport("down".into()),
            }
        );
        assert!(exchange.placed_orders().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_failure_is_fatal_with_remaining_exposure() {
        let exchange = exchange();
        exchange.script_fills([PaperFill::Quantity(dec!(0.3))]);
        let executor = executor(&exchange);

        // First order fills 0.3, then every placement fails
        exchange.fail_placements_after(1, ExchangeError::Rejected("margin".into()));

        let err = executor
            .execute(OrderSide::Buy, dec!(1), OrderKind::Exit)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ExecutionError::FatalExposureMismatch {
                executed: dec!(0.3),
                remaining: dec!(0.7),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_gives_up_after_repeated_empty_fills() {
        let exchange = exchange();
        exchange.script_fills([PaperFill::Nothing, PaperFill::Nothing, PaperFill::Nothing]);
        let executor = executor(&exchange);

        let err = executor
            .execute(OrderSide::Sell, dec!(0.5), OrderKind::Exit)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ExecutionError::FatalExposureMismatch { remaining, .. } if remaining == dec!(0.5)
        ));
        assert_eq!(exchange.placed_orders().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_progress_resets_empty_fill_count() {
        let exchange = exchange();
        exchange.script_fills([
            PaperFill::Nothing,
            PaperFill::Nothing,
            PaperFill::Quantity(dec!(0.4)),
            PaperFill::Nothing,
            PaperFill::Full,
        ]);
        let executor = executor(&exchange);

        let report = executor
            .execute(OrderSide::Sell, dec!(1), OrderKind::Exit)
            .await
            .unwrap();

        assert_eq!(report.executed_quantity, dec!(1));
        assert_eq!(report.status, OrderStatus::Filled);
        assert_eq!(report.orders.len(), 5);
        assert_eq!(exchange.net_quantity(), dec!(-1));
    }
}
