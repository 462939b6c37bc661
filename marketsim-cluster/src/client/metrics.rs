//! Prometheus metrics owned by one client manager

use prometheus::{IntCounter, IntGauge, Registry};

/// Counters and gauges for one [`ClientManager`](super::ClientManager)
///
/// Each manager owns its own set; [`ClientMetrics::register`] exposes them on
/// a registry.
#[derive(Clone)]
pub struct ClientMetrics {
    pub connection_errors: IntCounter,
    pub circuit_open_rejections: IntCounter,
    pub active_connections: IntGauge,
    pub pool_size: IntGauge,
    pub requests_total: IntCounter,
    pub requests_succeeded: IntCounter,
    pub requests_failed: IntCounter,
}

impl ClientMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            connection_errors: IntCounter::new(
                "client_connection_errors_total",
                "Failed attempts to obtain an inter-service client",
            )?,
            circuit_open_rejections: IntCounter::new(
                "client_circuit_open_rejections_total",
                "Calls rejected by an open circuit breaker",
            )?,
            active_connections: IntGauge::new(
                "client_active_connections",
                "Pooled connections currently marked healthy",
            )?,
            pool_size: IntGauge::new("client_pool_size", "Number of pooled inter-service clients")?,
            requests_total: IntCounter::new(
                "client_requests_total",
                "Inter-service calls attempted",
            )?,
            requests_succeeded: IntCounter::new(
                "client_requests_succeeded_total",
                "Inter-service calls that succeeded",
            )?,
            requests_failed: IntCounter::new(
                "client_requests_failed_total",
                "Inter-service calls that failed",
            )?,
        })
    }

    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.connection_errors.clone()))?;
        registry.register(Box::new(self.circuit_open_rejections.clone()))?;
        registry.register(Box::new(self.active_connections.clone()))?;
        registry.register(Box::new(self.pool_size.clone()))?;
        registry.register(Box::new(self.requests_total.clone()))?;
        registry.register(Box::new(self.requests_succeeded.clone()))?;
        registry.register(Box::new(self.requests_failed.clone()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::TextEncoder;

    #[test]
    fn test_register_exposes_metrics() {
        let registry = Registry::new();
        let metrics = ClientMetrics::new().unwrap();
        metrics.register(&registry).unwrap();
        metrics.connection_errors.inc();

        let families = registry.gather();
        assert_eq!(families.len(), 7);

        let text = TextEncoder::new().encode_to_string(&families).unwrap();
        assert!(text.contains("client_connection_errors_total 1"));
    }

    #[test]
    fn test_separate_managers_do_not_share_counters() {
        let a = ClientMetrics::new().unwrap();
        let b = ClientMetrics::new().unwrap();
        a.requests_total.inc();
        assert_eq!(b.requests_total.get(), 0);
    }
}
