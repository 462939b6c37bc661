pub mod registry;
pub mod store;

pub use registry::{
    filter_by_metadata, filter_by_tag, HealthState, InstanceStatus, RegistryConfig, RegistryMetrics,
    ServiceInfo, ServiceRegistration, ServiceRegistry,
};
pub use store::{MemoryStore, RedisStore, RegistryStore};
