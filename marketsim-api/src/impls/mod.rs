//! Shared market data implementation
//!
//! The gRPC and Connect front-ends are thin wrappers around
//! [`MarketDataApiImpl`]; every method takes and returns proto types.

pub mod market_data;

pub use market_data::{MarketDataApiImpl, MarketDataConfig, StreamKind, StreamSession};
