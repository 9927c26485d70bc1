use rust_decimal::Decimal;
use thiserror::Error;

use crate::execution::TransitionError;

/// Failures reported by exchange collaborators
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExchangeError {
    /// Network or connection level failure, safe to retry
    #[error("transport error: {0}")]
    Transport(String),

    /// Exchange refused the request
    #[error("order rejected: {0}")]
    Rejected(String),

    /// Price stream ended or the socket dropped
    #[error("stream disconnected")]
    Disconnected,

    /// Balance or order data missing from the response
    #[error("missing data: {0}")]
    DataGap(String),
}

/// Failures of the order executor
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutionError {
    /// Quantity rounded to zero (or below) under the step size
    #[error("order quantity {requested} rounds to zero under step size {step_size}")]
    ZeroQuantity { requested: Decimal, step_size: Decimal },

    /// Every placement attempt failed
    #[error("order placement failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        last_error: ExchangeError,
    },

    /// Order was accepted but nothing executed within the fill wait
    #[error("order for {requested} did not fill")]
    Unfilled { requested: Decimal },

    /// An exit could not flatten the position; exchange exposure remains
    #[error("exit left {remaining} unfilled after executing {executed}")]
    FatalExposureMismatch { executed: Decimal, remaining: Decimal },
}

/// Failures surfaced by the trading engine for a single action
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("data gap: {0}")]
    DataGap(String),

    #[error("insufficient balance for a {step_size} step order (balance {balance})")]
    InsufficientBalance { balance: Decimal, step_size: Decimal },

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}
