use thiserror::Error;

use crate::gateway::GatewayError;
use crate::order::OrderState;

#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Order type or instrument the connector cannot trade.
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("instrument {actual} is not supported, only {expected} is")]
    WrongInstrument { expected: String, actual: String },

    /// Submit on an order that already left `Initial`.
    #[error("order already processed (state {0:?})")]
    AlreadyProcessed(OrderState),

    /// Cancel on an order that is no longer open.
    #[error("stale order: {0}")]
    StaleOrder(String),

    /// Synchronous gateway failure on submit or cancel.
    #[error("gateway error: {0}")]
    Gateway(#[source] GatewayError),

    #[error("failed to refresh balances: {0}")]
    BalanceRefresh(#[source] GatewayError),

    /// Broken internal bookkeeping. Never recoverable.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl ExecutionError {
    /// Errors that must halt the dispatch loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolation(_) | Self::BalanceRefresh(_))
    }
}
