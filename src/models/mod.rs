use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Direction of a trading position
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn opposite(&self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }

    /// Order side that opens a position in this direction
    pub fn entry_side(&self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Buy,
            Self::Short => OrderSide::Sell,
        }
    }

    /// Order side that flattens a position in this direction
    pub fn exit_side(&self) -> OrderSide {
        self.entry_side().opposite()
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// One update from the exchange price stream
///
/// Book-ticker updates carry best bid/ask and `price` is their mid.
/// Trade and kline updates only carry `price`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceEvent {
    pub price: Decimal,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    /// True for a confirmed bar close, false for intra-bar updates
    pub is_final: bool,
    pub received_at: DateTime<Utc>,
}

impl PriceEvent {
    /// Plain last-trade tick
    pub fn tick(price: Decimal, received_at: DateTime<Utc>) -> Self {
        Self {
            price,
            best_bid: None,
            best_ask: None,
            is_final: false,
            received_at,
        }
    }

    /// Best bid/ask update, priced at the mid
    pub fn quote(best_bid: Decimal, best_ask: Decimal, received_at: DateTime<Utc>) -> Self {
        Self {
            price: (best_bid + best_ask) / Decimal::TWO,
            best_bid: Some(best_bid),
            best_ask: Some(best_ask),
            is_final: false,
            received_at,
        }
    }

    /// Confirmed bar close
    pub fn bar_close(close: Decimal, received_at: DateTime<Utc>) -> Self {
        Self {
            is_final: true,
            ..Self::tick(close, received_at)
        }
    }

    /// Price a position in `direction` could be closed at
    ///
    /// Longs sell into the bid, shorts buy from the ask.
    pub fn exit_price(&self, direction: Direction) -> Decimal {
        match direction {
            Direction::Long => self.best_bid.unwrap_or(self.price),
            Direction::Short => self.best_ask.unwrap_or(self.price),
        }
    }
}

/// Price retained in the indicator window
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PriceSample {
    pub price: Decimal,
    pub received_at: DateTime<Utc>,
}

/// Why an open position is being closed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExitReason {
    ProfitTarget,
    StopLoss,
    MeanReversion,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProfitTarget => write!(f, "Profit target reached"),
            Self::StopLoss => write!(f, "Stop loss hit"),
            Self::MeanReversion => write!(f, "Price reverted to mean"),
        }
    }
}

/// Trading decision produced for one evaluated price event
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Enter {
        direction: Direction,
        deviation: Decimal,
    },
    Exit {
        reason: ExitReason,
    },
    Hold,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    PartiallyFilled,
    Filled,
    Failed,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::PartiallyFilled => write!(f, "PARTIAL"),
            Self::Filled => write!(f, "FILLED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Exchange acknowledgment of a placed order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderHandle {
    pub order_id: String,
    pub client_order_id: Uuid,
}

/// Order state as reported by the exchange
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderReport {
    pub status: OrderStatus,
    pub executed_quantity: Decimal,
    pub average_price: Option<Decimal>,
}

impl OrderReport {
    pub fn pending() -> Self {
        Self {
            status: OrderStatus::Pending,
            executed_quantity: Decimal::ZERO,
            average_price: None,
        }
    }
}

/// Single market order tracked by the order executor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub exchange_order_id: Option<String>,
    pub side: OrderSide,
    pub requested_quantity: Decimal,
    pub executed_quantity: Decimal,
    pub average_price: Option<Decimal>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn market(side: OrderSide, quantity: Decimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            exchange_order_id: None,
            side,
            requested_quantity: quantity,
            executed_quantity: Decimal::ZERO,
            average_price: None,
            status: OrderStatus::Pending,
            created_at: Utc::now(),
        }
    }

    /// Fold an exchange report into the order
    pub fn apply(&mut self, report: &OrderReport) {
        self.status = report.status;
        self.executed_quantity = report.executed_quantity;
        self.average_price = report.average_price;
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TradeAction {
    Enter,
    Exit,
}

/// Trade journal entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub time: DateTime<Utc>,
    pub action: TradeAction,
    pub direction: Direction,
    pub price: Decimal,
    pub quantity: Decimal,
    pub sample_index: u64,
    pub deviation: Option<Decimal>,
    pub exit_reason: Option<ExitReason>,
}
