use connector_core::ConnectorError;
use execution_core::ExecutionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("connector error: {0}")]
    Connector(#[from] ConnectorError),

    /// The stop flag is set; the broker no longer dispatches or trades.
    #[error("broker is stopped")]
    Stopped,
}

impl BrokerError {
    /// Errors after which the registry can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        match self {
            BrokerError::Execution(e) => e.is_fatal(),
            BrokerError::Connector(_) | BrokerError::Stopped => false,
        }
    }
}
