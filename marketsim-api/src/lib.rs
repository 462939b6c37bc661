// MarketSim API Library
//
// Serves the market data service over gRPC (plus gRPC-Web) and over the
// Connect protocol, backed by one shared handler.

pub mod bridge;
pub mod connect;
pub mod error;
pub mod grpc;
pub mod http;
pub mod impls;
pub mod observability;

// Re-export commonly used types
pub use http::AppState;
pub use impls::MarketDataApiImpl;
