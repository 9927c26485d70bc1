// Order execution, position lifecycle and price feed supervision
pub mod executor;
pub mod position_manager;
pub mod price_feed;
pub mod retry;

pub use executor::{ExecutionReport, OrderExecutor, OrderKind};
pub use position_manager::{EntryFill, Position, PositionManager, PositionState, TransitionError};
pub use price_feed::{FeedStats, FeedSupervisor};
pub use retry::{Backoff, FillPolicy, RetryPolicy};
