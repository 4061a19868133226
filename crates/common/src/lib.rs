//! Shared utilities: reconnect/retry backoff, venue environment selection
//! and logging setup.

mod backoff;
mod environment;
mod logging;

pub use backoff::ExponentialBackoff;
pub use environment::{BinanceEnvironment, ParseEnvironmentError};
pub use logging::init_logging;
