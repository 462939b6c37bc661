pub mod circuit_breaker;
pub mod connector;
pub mod manager;
pub mod metrics;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerSnapshot, CircuitState};
pub use connector::{Connection, Connector, GrpcConnector, HttpConnector, Transport};
pub use manager::{
    CallStats, ClientManager, ClientSnapshot, ManagerConfig, ServiceClient, AUDIT_CORRELATOR,
    EXCHANGE_SIMULATOR, RISK_MONITOR, TEST_COORDINATOR, TRADING_ENGINE,
};
pub use metrics::ClientMetrics;
