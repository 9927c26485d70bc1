// Exchange collaborator interfaces
pub mod paper;

pub use paper::{PaperExchange, PaperFill, PlacedOrder};

use async_trait::async_trait;
use futures::stream::BoxStream;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::ExchangeError;
use crate::models::{OrderHandle, OrderReport, OrderSide, PriceEvent};

/// Infinite stream of price updates for one subscription
///
/// Dropping the stream releases the underlying connection.
pub type PriceStream = BoxStream<'static, Result<PriceEvent, ExchangeError>>;

/// Source of live price updates
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Open a new subscription for `symbol`
    async fn subscribe(&self, symbol: &str) -> Result<PriceStream, ExchangeError>;
}

/// Account and order-placement side of an exchange
#[async_trait]
pub trait Brokerage: Send + Sync {
    async fn account_balance(&self, asset: &str) -> Result<Decimal, ExchangeError>;

    /// Submit a market order
    ///
    /// `client_order_id` stays the same across retries of one logical order.
    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        client_order_id: Uuid,
    ) -> Result<OrderHandle, ExchangeError>;

    async fn order_status(
        &self,
        symbol: &str,
        handle: &OrderHandle,
    ) -> Result<OrderReport, ExchangeError>;

    /// Quantity increment accepted for `symbol`
    async fn step_size(&self, symbol: &str) -> Result<Decimal, ExchangeError>;
}
