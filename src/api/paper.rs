use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::{Brokerage, PriceFeed, PriceStream};
use crate::config::PaperConfig;
use crate::error::ExchangeError;
use crate::models::{OrderHandle, OrderReport, OrderSide, OrderStatus, PriceEvent};

/// How the next placed order fills
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PaperFill {
    Full,
    /// Share of the requested quantity, 0..=1
    Fraction(Decimal),
    /// Absolute quantity, capped at the requested quantity
    Quantity(Decimal),
    /// Accepted but never executes
    Nothing,
}

/// Order accepted by the paper exchange
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedOrder {
    pub order_id: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub client_order_id: Uuid,
}

#[derive(Debug)]
struct PaperState {
    mark_price: Decimal,
    cash: Decimal,
    net_quantity: Decimal,
    fill_script: VecDeque<PaperFill>,
    placement_failures: VecDeque<ExchangeError>,
    fail_after: Option<(usize, ExchangeError)>,
    placement_attempts: Vec<Uuid>,
    placed: Vec<PlacedOrder>,
    reports: HashMap<String, OrderReport>,
    sessions: u64,
}

/// In-process exchange: random-walk quotes plus instant market fills
///
/// Fills are scripted per order (full by default) and priced at the mark,
/// which follows the last quote streamed or `set_mark_price`. The quote
/// balance is reported as equity: cash plus the open quantity at mark.
#[derive(Debug, Clone)]
pub struct PaperExchange {
    config: PaperConfig,
    quote_asset: String,
    state: Arc<Mutex<PaperState>>,
}

impl PaperExchange {
    pub fn new(config: &PaperConfig, quote_asset: impl Into<String>) -> Self {
        let state = PaperState {
            mark_price: config.starting_price,
            cash: config.starting_balance,
            net_quantity: Decimal::ZERO,
            fill_script: VecDeque::new(),
            placement_failures: VecDeque::new(),
            fail_after: None,
            placement_attempts: Vec::new(),
            placed: Vec::new(),
            reports: HashMap::new(),
            sessions: 0,
        };
        Self {
            config: config.clone(),
            quote_asset: quote_asset.into(),
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Queue fill behavior for the next orders, in placement order
    pub fn script_fills(&self, fills: impl IntoIterator<Item = PaperFill>) {
        self.lock().fill_script.extend(fills);
    }

    /// Make the next `count` placement attempts fail with `error`
    pub fn fail_next_placements(&self, count: usize, error: ExchangeError) {
        let mut state = self.lock();
        for _ in 0..count {
            state.placement_failures.push_back(error.clone());
        }
    }

    /// Fail every placement once `accepted` orders have gone through
    pub fn fail_placements_after(&self, accepted: usize, error: ExchangeError) {
        self.lock().fail_after = Some((accepted, error));
    }

    /// Let placements succeed again after `fail_placements_after`
    pub fn restore_placements(&self) {
        self.lock().fail_after = None;
    }

    pub fn set_mark_price(&self, price: Decimal) {
        self.lock().mark_price = price;
    }

    pub fn set_balance(&self, balance: Decimal) {
        let mut state = self.lock();
        let open_value = state.net_quantity * state.mark_price;
        state.cash = balance - open_value;
    }

    /// Signed open quantity (positive long)
    pub fn net_quantity(&self) -> Decimal {
        self.lock().net_quantity
    }

    pub fn placed_orders(&self) -> Vec<PlacedOrder> {
        self.lock().placed.clone()
    }

    /// Client order id of every placement attempt, failed ones included
    pub fn placement_attempts(&self) -> Vec<Uuid> {
        self.lock().placement_attempts.clone()
    }

    fn lock(&self) -> MutexGuard<'_, PaperState> {
        // Every update is a single assignment, so a poisoned guard is still usable
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn quote_around(&self, mid: Decimal) -> PriceEvent {
        let half_spread = mid * to_decimal(self.config.spread_pct) / Decimal::from(200);
        PriceEvent::quote(mid - half_spread, mid + half_spread, Utc::now())
    }
}

fn to_decimal(value: f64) -> Decimal {
    Decimal::try_from(value).unwrap_or(Decimal::ZERO)
}

fn fill_quantity(fill: PaperFill, requested: Decimal) -> Decimal {
    let quantity = match fill {
        PaperFill::Full => requested,
        PaperFill::Fraction(share) => requested * share,
        PaperFill::Quantity(quantity) => quantity,
        PaperFill::Nothing => Decimal::ZERO,
    };
    quantity.max(Decimal::ZERO).min(requested)
}

#[async_trait]
impl Brokerage for PaperExchange {
    async fn account_balance(&self, asset: &str) -> Result<Decimal, ExchangeError> {
        if asset != self.quote_asset {
            return Err(ExchangeError::DataGap(format!("no {} balance", asset)));
        }
        let state = self.lock();
        Ok(state.cash + state.net_quantity * state.mark_price)
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        client_order_id: Uuid,
    ) -> Result<OrderHandle, ExchangeError> {
        let mut state = self.lock();
        state.placement_attempts.push(client_order_id);

        if let Some(error) = state.placement_failures.pop_front() {
            return Err(error);
        }
        if let Some((accepted, error)) = &state.fail_after {
            if state.placed.len() >= *accepted {
                return Err(error.clone());
            }
        }
        if quantity <= Decimal::ZERO {
            return Err(ExchangeError::Rejected(format!(
                "invalid quantity {} for {}",
                quantity, symbol
            )));
        }

        let fill = state.fill_script.pop_front().unwrap_or(PaperFill::Full);
        let executed = fill_quantity(fill, quantity);
        let price = state.mark_price;

        let signed = match side {
            OrderSide::Buy => executed,
            OrderSide::Sell => -executed,
        };
        state.net_quantity += signed;
        state.cash -= signed * price;

        let order_id = format!("paper-{}", state.placed.len() + 1);
        let report = OrderReport {
            status: if executed >= quantity {
                OrderStatus::Filled
            } else if executed > Decimal::ZERO {
                OrderStatus::PartiallyFilled
            } else {
                OrderStatus::Pending
            },
            executed_quantity: executed,
            average_price: (executed > Decimal::ZERO).then_some(price),
        };
        state.reports.insert(order_id.clone(), report);
        state.placed.push(PlacedOrder {
            order_id: order_id.clone(),
            side,
            quantity,
            client_order_id,
        });

        tracing::debug!(%order_id, ?side, %quantity, %executed, %price, "Paper order placed");
        Ok(OrderHandle {
            order_id,
            client_order_id,
        })
    }

    async fn order_status(
        &self,
        _symbol: &str,
        handle: &OrderHandle,
    ) -> Result<OrderReport, ExchangeError> {
        self.lock()
            .reports
            .get(&handle.order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::Rejected(format!("unknown order {}", handle.order_id)))
    }

    async fn step_size(&self, _symbol: &str) -> Result<Decimal, ExchangeError> {
        Ok(self.config.step_size)
    }
}

#[async_trait]
impl PriceFeed for PaperExchange {
    async fn subscribe(&self, symbol: &str) -> Result<PriceStream, ExchangeError> {
        let session = {
            let mut state = self.lock();
            state.sessions += 1;
            state.sessions
        };
        tracing::info!("📡 Paper feed session {} for {}", session, symbol);

        let rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(session));
        let exchange = self.clone();
        let interval = Duration::from_millis(self.config.tick_interval_ms);
        let volatility = self.config.volatility_pct.abs();
        let disconnect_after = self.config.disconnect_after;

        let ticks = stream::unfold((rng, 0u64), move |(mut rng, sent)| {
            let exchange = exchange.clone();
            async move {
                if disconnect_after.is_some_and(|limit| sent >= limit) {
                    return None;
                }
                tokio::time::sleep(interval).await;

                let change = if volatility > 0.0 {
                    rng.gen_range(-volatility..volatility) / 100.0
                } else {
                    0.0
                };
                let mid = {
                    let mut state = exchange.lock();
                    let next = state.mark_price * (Decimal::ONE + to_decimal(change));
                    state.mark_price = next.round_dp(8);
                    state.mark_price
                };
                Some((Ok(exchange.quote_around(mid)), (rng, sent + 1)))
            }
        });

        // A dropped connection surfaces as one error after the last tick
        let stream = match disconnect_after {
            Some(_) => ticks
                .chain(stream::once(async { Err(ExchangeError::Disconnected) }))
                .boxed(),
            None => ticks.boxed(),
        };
        Ok(stream)
    }
}
