//! Inter-service plumbing: service registry, circuit breaking and pooled clients

pub mod client;
pub mod discovery;
pub mod error;
pub mod protocol;

pub use client::{CircuitBreaker, CircuitState, ClientManager, ManagerConfig, ServiceClient};
pub use discovery::{
    HealthState, MemoryStore, RedisStore, RegistryConfig, RegistryStore, ServiceInfo,
    ServiceRegistration, ServiceRegistry,
};
pub use error::{Error, Result};
pub use protocol::Protocol;
