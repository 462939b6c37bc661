//! Pooled clients for calling other services
//!
//! One [`ServiceClient`] per (service, protocol) pair, created lazily from a
//! registry lookup and kept until it goes idle, fails its health check or the
//! manager is closed. Every client carries its own circuit breaker.

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use marketsim_core::config::ClientConfig;

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerSnapshot};
use super::connector::{Connection, Connector, GrpcConnector, HttpConnector, Transport};
use super::metrics::ClientMetrics;
use crate::discovery::ServiceRegistry;
use crate::error::{Error, Result};
use crate::protocol::Protocol;

pub const RISK_MONITOR: &str = "risk-monitor";
pub const AUDIT_CORRELATOR: &str = "audit-correlator";
pub const EXCHANGE_SIMULATOR: &str = "exchange-simulator";
pub const TRADING_ENGINE: &str = "trading-engine";
pub const TEST_COORDINATOR: &str = "test-coordinator";

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub dial_timeout: Duration,
    pub probe_timeout: Duration,
    pub idle_timeout: Duration,
    pub breaker_threshold: u64,
    pub breaker_timeout: Duration,
    pub health_check_interval: Duration,
    pub cleanup_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

impl ManagerConfig {
    #[must_use]
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            dial_timeout: Duration::from_secs(config.dial_timeout_seconds),
            probe_timeout: Duration::from_secs(config.probe_timeout_seconds),
            idle_timeout: Duration::from_secs(config.idle_timeout_seconds),
            breaker_threshold: config.breaker_failure_threshold,
            breaker_timeout: Duration::from_secs(config.breaker_timeout_seconds),
            health_check_interval: Duration::from_secs(config.health_check_interval_seconds),
            cleanup_interval: Duration::from_secs(config.idle_cleanup_interval_seconds),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CallStats {
    pub requests: u64,
    pub successes: u64,
    pub errors: u64,
    /// Mean latency over all recorded requests
    pub avg_response_time: Duration,
}

/// Observability view of one pooled client
#[derive(Debug, Clone, Serialize)]
pub struct ClientSnapshot {
    pub service_name: String,
    pub protocol: Protocol,
    pub instance_id: String,
    pub endpoint: String,
    pub healthy: bool,
    pub idle_secs: f64,
    pub stats: CallStats,
    pub circuit_breaker: CircuitBreakerSnapshot,
}

/// Connection to one instance of another service
pub struct ServiceClient {
    service_name: String,
    protocol: Protocol,
    instance_id: String,
    endpoint: String,
    connection: Box<dyn Connection>,
    breaker: CircuitBreaker,
    healthy: AtomicBool,
    last_used: Mutex<Instant>,
    stats: Mutex<CallStats>,
    metrics: ClientMetrics,
}

impl ServiceClient {
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Channel or HTTP client for issuing calls
    #[must_use]
    pub fn transport(&self) -> Option<Transport> {
        self.connection.transport()
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    #[must_use]
    pub fn stats(&self) -> CallStats {
        *self.stats.lock()
    }

    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }

    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    /// Record the outcome of a call made over this client
    pub fn record_request(&self, latency: Duration, success: bool) {
        {
            let mut stats = self.stats.lock();
            stats.requests += 1;
            if success {
                stats.successes += 1;
            } else {
                stats.errors += 1;
            }
            let previous = stats.avg_response_time.as_nanos() * u128::from(stats.requests - 1);
            let mean = (previous + latency.as_nanos()) / u128::from(stats.requests);
            stats.avg_response_time = Duration::from_nanos(u64::try_from(mean).unwrap_or(u64::MAX));
        }

        self.metrics.requests_total.inc();
        if success {
            self.breaker.record_success();
            self.metrics.requests_succeeded.inc();
        } else {
            self.breaker.record_failure();
            self.metrics.requests_failed.inc();
        }
    }

    /// Run a call through the circuit breaker
    ///
    /// An open circuit fails fast with [`Error::CircuitOpen`] without running
    /// `f`. Otherwise the latency and outcome are recorded.
    pub async fn call<T, E, F, Fut>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        if !self.breaker.allow_request() {
            self.metrics.circuit_open_rejections.inc();
            return Err(Error::CircuitOpen {
                service: self.service_name.clone(),
            }
            .into());
        }

        self.touch();
        let started = Instant::now();
        let result = f().await;
        self.record_request(started.elapsed(), result.is_ok());
        result
    }

    #[must_use]
    pub fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot {
            service_name: self.service_name.clone(),
            protocol: self.protocol,
            instance_id: self.instance_id.clone(),
            endpoint: self.endpoint.clone(),
            healthy: self.is_healthy(),
            idle_secs: self.idle_for().as_secs_f64(),
            stats: self.stats(),
            circuit_breaker: self.breaker.snapshot(),
        }
    }

    async fn close(&self) {
        if let Err(e) = self.connection.close().await {
            tracing::warn!(
                service = %self.service_name,
                protocol = %self.protocol,
                error = %e,
                "Failed to close connection"
            );
        }
    }
}

type PoolKey = (String, Protocol);

/// Pool of inter-service clients
pub struct ClientManager {
    registry: Arc<ServiceRegistry>,
    connectors: HashMap<Protocol, Arc<dyn Connector>>,
    pool: RwLock<HashMap<PoolKey, Arc<ServiceClient>>>,
    /// One creation lock per pool key; held across discovery, dial and probe
    creating: Mutex<HashMap<PoolKey, Arc<AsyncMutex<()>>>>,
    config: ManagerConfig,
    metrics: ClientMetrics,
}

impl ClientManager {
    /// Manager with the tonic and reqwest connectors
    pub fn new(registry: Arc<ServiceRegistry>, config: ManagerConfig) -> prometheus::Result<Self> {
        let http = HttpConnector::new(config.probe_timeout);
        Ok(Self {
            registry,
            connectors: HashMap::from([
                (Protocol::Grpc, Arc::new(GrpcConnector) as Arc<dyn Connector>),
                (Protocol::Http, Arc::new(http) as Arc<dyn Connector>),
            ]),
            pool: RwLock::new(HashMap::new()),
            creating: Mutex::new(HashMap::new()),
            config,
            metrics: ClientMetrics::new()?,
        })
    }

    /// Replace the connector used for `protocol`
    #[must_use]
    pub fn with_connector(mut self, protocol: Protocol, connector: Arc<dyn Connector>) -> Self {
        self.connectors.insert(protocol, connector);
        self
    }

    #[must_use]
    pub fn metrics(&self) -> &ClientMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.pool.read().len()
    }

    /// Snapshots of every pooled client
    #[must_use]
    pub fn snapshot(&self) -> Vec<ClientSnapshot> {
        self.pool.read().values().map(|c| c.snapshot()).collect()
    }

    /// Pooled client for a service, connecting to a healthy instance if needed
    ///
    /// Concurrent callers for the same service and protocol share one
    /// connection attempt; the ones that waited reuse its client.
    pub async fn get_client(&self, service: &str, protocol: Protocol) -> Result<Arc<ServiceClient>> {
        if let Some(client) = self.pooled(service, protocol) {
            return Ok(client);
        }

        let lock = self.creation_lock(service, protocol);
        let _creating = lock.lock().await;
        if let Some(client) = self.pooled(service, protocol) {
            return Ok(client);
        }

        match self.create_client(service, protocol).await {
            Ok(client) => Ok(client),
            Err(e) => {
                self.metrics.connection_errors.inc();
                tracing::warn!(service = %service, protocol = %protocol, error = %e, "Failed to get client");
                Err(e)
            }
        }
    }

    pub async fn risk_monitor_client(&self) -> Result<Arc<ServiceClient>> {
        self.get_client(RISK_MONITOR, Protocol::Grpc).await
    }

    pub async fn audit_correlator_client(&self) -> Result<Arc<ServiceClient>> {
        self.get_client(AUDIT_CORRELATOR, Protocol::Grpc).await
    }

    pub async fn exchange_simulator_client(&self) -> Result<Arc<ServiceClient>> {
        self.get_client(EXCHANGE_SIMULATOR, Protocol::Grpc).await
    }

    pub async fn trading_engine_client(&self) -> Result<Arc<ServiceClient>> {
        self.get_client(TRADING_ENGINE, Protocol::Grpc).await
    }

    pub async fn test_coordinator_client(&self) -> Result<Arc<ServiceClient>> {
        self.get_client(TEST_COORDINATOR, Protocol::Grpc).await
    }

    fn creation_lock(&self, service: &str, protocol: Protocol) -> Arc<AsyncMutex<()>> {
        Arc::clone(
            self.creating
                .lock()
                .entry((service.to_string(), protocol))
                .or_default(),
        )
    }

    fn pooled(&self, service: &str, protocol: Protocol) -> Option<Arc<ServiceClient>> {
        let pool = self.pool.read();
        let client = pool.get(&(service.to_string(), protocol))?;
        if client.is_healthy() && client.breaker.allow_request() {
            client.touch();
            Some(Arc::clone(client))
        } else {
            None
        }
    }

    async fn create_client(&self, service: &str, protocol: Protocol) -> Result<Arc<ServiceClient>> {
        let instances = self
            .registry
            .get_healthy_instances(service)
            .await
            .map_err(|e| Error::unavailable(service, format!("discovery failed: {e}")))?;
        let Some(instance) = instances.into_iter().next() else {
            return Err(Error::unavailable(service, "no healthy instances"));
        };

        let connector = self
            .connectors
            .get(&protocol)
            .ok_or_else(|| Error::Configuration(format!("no connector for {protocol}")))?;

        let endpoint = instance.endpoint(protocol);
        let dial = self.config.dial_timeout;
        let connection = timeout(dial, connector.connect(&endpoint, dial))
            .await
            .map_err(|_| Error::Connection(format!("dial to {endpoint} timed out")))??;

        let probe = timeout(self.config.probe_timeout, connection.probe()).await;
        let probe = match probe {
            Ok(result) => result,
            Err(_) => Err(Error::Connection(format!("health probe to {endpoint} timed out"))),
        };
        if let Err(e) = probe {
            if let Err(close_err) = connection.close().await {
                tracing::debug!(endpoint = %endpoint, error = %close_err, "Failed to close rejected connection");
            }
            return Err(e);
        }

        let client = Arc::new(ServiceClient {
            service_name: service.to_string(),
            protocol,
            instance_id: instance.instance_id.clone(),
            endpoint: endpoint.clone(),
            connection,
            breaker: CircuitBreaker::new(self.config.breaker_threshold, self.config.breaker_timeout),
            healthy: AtomicBool::new(true),
            last_used: Mutex::new(Instant::now()),
            stats: Mutex::new(CallStats::default()),
            metrics: self.metrics.clone(),
        });

        // callers only get here after `pooled` rejected the entry under the
        // creation lock, so a replaced client is unhealthy or behind an open breaker
        let replaced = self
            .pool
            .write()
            .insert((service.to_string(), protocol), Arc::clone(&client));
        if let Some(old) = replaced {
            tracing::debug!(
                service = %service,
                protocol = %protocol,
                instance_id = %old.instance_id,
                "Closing replaced stale client"
            );
            old.close().await;
        }
        self.refresh_gauges();

        tracing::info!(
            service = %service,
            protocol = %protocol,
            instance_id = %instance.instance_id,
            endpoint = %endpoint,
            "Created inter-service client"
        );
        Ok(client)
    }

    /// Probe every pooled client concurrently, feeding results to its breaker
    pub async fn perform_health_checks(&self) {
        let clients: Vec<Arc<ServiceClient>> = self.pool.read().values().cloned().collect();
        let probe_timeout = self.config.probe_timeout;

        join_all(clients.iter().map(|client| async move {
            let outcome = match timeout(probe_timeout, client.connection.probe()).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(format!("health probe to {}", client.endpoint))),
            };

            match outcome {
                Ok(()) => {
                    client.set_healthy(true);
                    client.breaker.record_success();
                }
                Err(e) => {
                    client.set_healthy(false);
                    client.breaker.record_failure();
                    tracing::warn!(
                        service = %client.service_name,
                        endpoint = %client.endpoint,
                        error = %e,
                        "Health check failed"
                    );
                }
            }
        }))
        .await;

        self.refresh_gauges();
    }

    /// Evict and close clients unused for longer than the idle timeout
    pub async fn cleanup_idle_connections(&self) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let mut evicted = Vec::new();
        self.pool.write().retain(|_, client| {
            if client.idle_for() > idle_timeout {
                evicted.push(Arc::clone(client));
                false
            } else {
                true
            }
        });

        for client in &evicted {
            tracing::info!(
                service = %client.service_name,
                protocol = %client.protocol,
                "Closing idle connection"
            );
            client.close().await;
        }
        self.refresh_gauges();
        evicted.len()
    }

    /// Close every pooled connection and empty the pool
    pub async fn close(&self) {
        let clients: Vec<Arc<ServiceClient>> = self.pool.write().drain().map(|(_, c)| c).collect();
        for client in &clients {
            client.close().await;
        }
        self.refresh_gauges();
        tracing::info!(closed = clients.len(), "Client manager closed");
    }

    /// Run health checks and idle cleanup until `cancel` fires
    pub fn spawn_maintenance(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let hc_period = manager.config.health_check_interval;
        let cleanup_period = manager.config.cleanup_interval;

        tokio::spawn(async move {
            let mut health_timer = interval_at(Instant::now() + hc_period, hc_period);
            health_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut cleanup_timer = interval_at(Instant::now() + cleanup_period, cleanup_period);
            cleanup_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        tracing::info!("Client maintenance shutting down");
                        return;
                    }
                    _ = health_timer.tick() => manager.perform_health_checks().await,
                    _ = cleanup_timer.tick() => {
                        let evicted = manager.cleanup_idle_connections().await;
                        if evicted > 0 {
                            tracing::debug!(evicted, "Idle connections cleaned up");
                        }
                    }
                }
            }
        })
    }

    fn refresh_gauges(&self) {
        let pool = self.pool.read();
        let healthy = pool.values().filter(|c| c.is_healthy()).count();
        self.metrics.pool_size.set(i64::try_from(pool.len()).unwrap_or(i64::MAX));
        self.metrics
            .active_connections
            .set(i64::try_from(healthy).unwrap_or(i64::MAX));
    }
}
