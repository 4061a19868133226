//! Binance spot connector.
//!
//! [`BinanceStream`] runs the public market session (trades and depth,
//! kept consistent by an [`orderbook::BookSynchronizer`]) and the user data
//! session (order status changes) for a single symbol. The translators turn
//! raw frames into venue-neutral types and can be used on their own.

mod market_stream;
mod parser;
mod session;
mod stream;
mod user_data_parser;
mod user_data_stream;

pub use parser::BinanceMarketTranslator;
pub use stream::BinanceStream;
pub use user_data_parser::BinanceUserDataTranslator;
