//! Service registry for inter-service discovery
//!
//! Each instance writes an expiring record under `services:{name}:{instance}`
//! and keeps it alive with a heartbeat loop. Discovery scans the records of a
//! service and classifies those with an old heartbeat as stale; the store's TTL
//! is the real expiry mechanism.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use marketsim_core::Config;

use super::store::RegistryStore;
use crate::error::{Error, Result};
use crate::protocol::Protocol;

const SERVICES_PREFIX: &str = "services";
const SERVICE_LIST_PREFIX: &str = "service_list";

/// Instance id suffix alphabet, kept free of `-` so ids split cleanly
const ID_ALPHABET: [char; 36] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h',
    'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Active,
    Stale,
}

/// Record stored for one running instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub service_name: String,
    pub service_version: String,
    pub instance_id: String,
    pub address: String,
    /// Primary port, same as `http_port`
    pub port: u16,
    pub grpc_port: u16,
    pub http_port: u16,
    pub health: HealthState,
    pub status: InstanceStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Another instance's registration as seen by a discoverer
///
/// Health and status may be overridden locally when the heartbeat is old;
/// the override is never written back.
pub type ServiceInfo = ServiceRegistration;

impl ServiceRegistration {
    /// Time since the last heartbeat
    #[must_use]
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.last_heartbeat)
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.health == HealthState::Healthy && self.status == InstanceStatus::Active
    }

    /// Dial target for the given protocol
    #[must_use]
    pub fn endpoint(&self, protocol: Protocol) -> String {
        match protocol {
            Protocol::Grpc => format!("{}:{}", self.address, self.grpc_port),
            Protocol::Http => format!("http://{}:{}", self.address, self.http_port),
        }
    }

    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Instances carrying `tag`
#[must_use]
pub fn filter_by_tag(instances: &[ServiceInfo], tag: &str) -> Vec<ServiceInfo> {
    instances.iter().filter(|i| i.has_tag(tag)).cloned().collect()
}

/// Instances whose metadata maps `key` to `value`
#[must_use]
pub fn filter_by_metadata(instances: &[ServiceInfo], key: &str, value: &str) -> Vec<ServiceInfo> {
    instances
        .iter()
        .filter(|i| i.metadata.get(key).is_some_and(|v| v == value))
        .cloned()
        .collect()
}

fn instance_key(service: &str, instance_id: &str) -> String {
    format!("{SERVICES_PREFIX}:{service}:{instance_id}")
}

fn service_list_key(service: &str) -> String {
    format!("{SERVICE_LIST_PREFIX}:{service}")
}

/// Registry settings for this instance
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub service_name: String,
    pub service_version: String,
    pub address: String,
    pub grpc_port: u16,
    pub http_port: u16,
    pub metadata: HashMap<String, String>,
    pub tags: Vec<String>,
    pub registration_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub stale_after: chrono::Duration,
    pub cleanup_after: chrono::Duration,
    pub operation_timeout: Duration,
}

impl RegistryConfig {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let metadata = HashMap::from([
            ("environment".to_string(), config.service.environment.clone()),
            ("region".to_string(), "local".to_string()),
            ("datacenter".to_string(), "local".to_string()),
        ]);
        let tags = ["market-data", "simulator", "grpc", "http"]
            .into_iter()
            .map(String::from)
            .collect();

        Self {
            service_name: config.service.name.clone(),
            service_version: config.service.version.clone(),
            address: config.service.advertise_address.clone(),
            grpc_port: config.server.grpc_port,
            http_port: config.server.http_port,
            metadata,
            tags,
            registration_ttl: config.discovery.registration_ttl(),
            heartbeat_interval: config.discovery.heartbeat_interval(),
            stale_after: chrono::Duration::seconds(config.discovery.stale_after_seconds),
            cleanup_after: chrono::Duration::seconds(config.discovery.cleanup_after_seconds),
            operation_timeout: config.discovery.operation_timeout(),
        }
    }
}

/// Point-in-time view of registry activity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryMetrics {
    pub registrations: u64,
    pub deregistrations: u64,
    pub heartbeats: u64,
    pub heartbeat_failures: u64,
    pub discoveries: u64,
    pub healthy_instances: u64,
    pub unhealthy_instances: u64,
    pub errors: u64,
    pub connected: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Counters {
    registrations: AtomicU64,
    deregistrations: AtomicU64,
    heartbeats: AtomicU64,
    heartbeat_failures: AtomicU64,
    discoveries: AtomicU64,
    healthy_instances: AtomicU64,
    unhealthy_instances: AtomicU64,
    errors: AtomicU64,
    connected: AtomicBool,
    last_heartbeat: parking_lot::Mutex<Option<DateTime<Utc>>>,
}

impl Counters {
    fn store_ok(&self) {
        self.connected.store(true, Ordering::Relaxed);
    }

    fn store_failed(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
    }

    fn snapshot(&self) -> RegistryMetrics {
        RegistryMetrics {
            registrations: self.registrations.load(Ordering::Relaxed),
            deregistrations: self.deregistrations.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            heartbeat_failures: self.heartbeat_failures.load(Ordering::Relaxed),
            discoveries: self.discoveries.load(Ordering::Relaxed),
            healthy_instances: self.healthy_instances.load(Ordering::Relaxed),
            unhealthy_instances: self.unhealthy_instances.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            connected: self.connected.load(Ordering::Relaxed),
            last_heartbeat: *self.last_heartbeat.lock(),
        }
    }
}

struct HeartbeatTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl HeartbeatTask {
    /// Cancel the loop and wait until it has exited
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "Heartbeat task ended abnormally");
        }
    }
}

enum Lifecycle {
    Unregistered,
    Registered { heartbeat: HeartbeatTask },
}

/// State shared with the heartbeat loop
struct Shared {
    store: Arc<dyn RegistryStore>,
    config: RegistryConfig,
    record: Mutex<ServiceRegistration>,
    counters: Counters,
}

impl Shared {
    fn key(&self, instance_id: &str) -> String {
        instance_key(&self.config.service_name, instance_id)
    }

    async fn with_timeout<T>(
        &self,
        what: &str,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        let result = match timeout(self.config.operation_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!("registry {what} timed out"))),
        };
        match &result {
            Ok(_) => self.counters.store_ok(),
            Err(_) => self.counters.store_failed(),
        }
        result
    }

    /// Refresh `last_heartbeat`, optionally change health, and rewrite the record
    ///
    /// The record lock is held through the write so concurrent rewrites land in
    /// the order their state was produced.
    async fn rewrite(&self, health: Option<HealthState>) -> Result<()> {
        let mut record = self.record.lock().await;
        let now = Utc::now().max(record.last_heartbeat);
        record.last_heartbeat = now;
        if let Some(health) = health {
            record.health = health;
        }
        let json = serde_json::to_string(&*record)?;
        let key = self.key(&record.instance_id);

        self.with_timeout(
            "write",
            self.store.set_ex(&key, &json, self.config.registration_ttl),
        )
        .await?;

        *self.counters.last_heartbeat.lock() = Some(now);
        Ok(())
    }

    async fn heartbeat_loop(self: Arc<Self>, cancel: CancellationToken) {
        let period = self.config.heartbeat_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::debug!(service = %self.config.service_name, "Heartbeat loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    match self.rewrite(None).await {
                        Ok(()) => {
                            self.counters.heartbeats.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            self.counters.heartbeat_failures.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(
                                service = %self.config.service_name,
                                error = %e,
                                "Heartbeat failed"
                            );
                        }
                    }
                }
            }
        }
    }
}

/// Registers this instance and discovers others through a [`RegistryStore`]
pub struct ServiceRegistry {
    shared: Arc<Shared>,
    instance_id: String,
    lifecycle: Mutex<Lifecycle>,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new(store: Arc<dyn RegistryStore>, config: RegistryConfig) -> Self {
        let now = Utc::now();
        let instance_id = format!(
            "{}-{}-{}",
            config.service_name,
            now.timestamp(),
            nanoid::nanoid!(6, &ID_ALPHABET)
        );

        let record = ServiceRegistration {
            service_name: config.service_name.clone(),
            service_version: config.service_version.clone(),
            instance_id: instance_id.clone(),
            address: config.address.clone(),
            port: config.http_port,
            grpc_port: config.grpc_port,
            http_port: config.http_port,
            health: HealthState::Healthy,
            status: InstanceStatus::Active,
            registered_at: now,
            last_heartbeat: now,
            metadata: config.metadata.clone(),
            tags: config.tags.clone(),
        };

        Self {
            shared: Arc::new(Shared {
                store,
                config,
                record: Mutex::new(record),
                counters: Counters::default(),
            }),
            instance_id,
            lifecycle: Mutex::new(Lifecycle::Unregistered),
        }
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.shared.config.service_name
    }

    pub async fn is_registered(&self) -> bool {
        matches!(*self.lifecycle.lock().await, Lifecycle::Registered { .. })
    }

    /// Snapshot of this instance's own record
    pub async fn registration(&self) -> ServiceInfo {
        self.shared.record.lock().await.clone()
    }

    #[must_use]
    pub fn metrics(&self) -> RegistryMetrics {
        self.shared.counters.snapshot()
    }

    /// Write this instance's record and start the heartbeat loop
    pub async fn register(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if matches!(*lifecycle, Lifecycle::Registered { .. }) {
            return Err(Error::AlreadyRegistered);
        }

        let shared = &self.shared;
        shared.with_timeout("ping", shared.store.ping()).await?;

        let json = {
            let mut record = shared.record.lock().await;
            let now = Utc::now();
            record.registered_at = now;
            record.last_heartbeat = now.max(record.last_heartbeat);
            record.health = HealthState::Healthy;
            record.status = InstanceStatus::Active;
            serde_json::to_string(&*record)?
        };

        let key = shared.key(&self.instance_id);
        shared
            .with_timeout(
                "register",
                shared.store.set_ex(&key, &json, shared.config.registration_ttl),
            )
            .await?;

        let list_key = service_list_key(&shared.config.service_name);
        if let Err(e) = shared
            .with_timeout("index", shared.store.sadd(&list_key, &self.instance_id))
            .await
        {
            tracing::warn!(key = %list_key, error = %e, "Failed to add instance to service list");
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(shared).heartbeat_loop(cancel.clone()));
        *lifecycle = Lifecycle::Registered {
            heartbeat: HeartbeatTask { cancel, handle },
        };

        shared.counters.registrations.fetch_add(1, Ordering::Relaxed);
        *shared.counters.last_heartbeat.lock() = Some(Utc::now());

        tracing::info!(
            service = %shared.config.service_name,
            instance_id = %self.instance_id,
            address = %shared.config.address,
            grpc_port = shared.config.grpc_port,
            http_port = shared.config.http_port,
            "Service registered"
        );
        Ok(())
    }

    /// Stop heartbeating and remove this instance's record
    ///
    /// The heartbeat loop has fully exited before the record is deleted, so no
    /// late heartbeat can resurrect it.
    pub async fn deregister(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        let Lifecycle::Registered { heartbeat } =
            std::mem::replace(&mut *lifecycle, Lifecycle::Unregistered)
        else {
            return Err(Error::NotRegistered);
        };

        heartbeat.stop().await;

        let shared = &self.shared;
        let key = shared.key(&self.instance_id);
        if let Err(e) = shared.with_timeout("delete", shared.store.del(&key)).await {
            tracing::warn!(key = %key, error = %e, "Failed to delete service record");
        }

        let list_key = service_list_key(&shared.config.service_name);
        if let Err(e) = shared
            .with_timeout("unindex", shared.store.srem(&list_key, &self.instance_id))
            .await
        {
            tracing::warn!(key = %list_key, error = %e, "Failed to remove instance from service list");
        }

        shared.counters.deregistrations.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            service = %shared.config.service_name,
            instance_id = %self.instance_id,
            "Service deregistered"
        );
        Ok(())
    }

    /// Change the advertised health of this instance
    pub async fn update_health(&self, health: HealthState) -> Result<()> {
        let lifecycle = self.lifecycle.lock().await;
        if matches!(*lifecycle, Lifecycle::Unregistered) {
            return Err(Error::NotRegistered);
        }
        self.shared.rewrite(Some(health)).await?;
        drop(lifecycle);

        tracing::info!(instance_id = %self.instance_id, ?health, "Service health updated");
        Ok(())
    }

    /// All readable instances of `service_name`, stale ones marked unhealthy
    pub async fn discover_service(&self, service_name: &str) -> Result<Vec<ServiceInfo>> {
        let shared = &self.shared;
        let pattern = format!("{SERVICES_PREFIX}:{service_name}:*");
        let keys = shared.with_timeout("scan", shared.store.scan(&pattern)).await?;

        let now = Utc::now();
        let mut instances = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(mut info) = self.read_record(&key).await else {
                continue;
            };
            if info.heartbeat_age(now) > shared.config.stale_after {
                info.health = HealthState::Unhealthy;
                info.status = InstanceStatus::Stale;
            }
            instances.push(info);
        }

        let healthy = instances.iter().filter(|i| i.is_available()).count() as u64;
        let counters = &shared.counters;
        counters.discoveries.fetch_add(1, Ordering::Relaxed);
        counters.healthy_instances.store(healthy, Ordering::Relaxed);
        counters
            .unhealthy_instances
            .store(instances.len() as u64 - healthy, Ordering::Relaxed);

        tracing::debug!(
            service = %service_name,
            total = instances.len(),
            healthy,
            "Discovered service instances"
        );
        Ok(instances)
    }

    /// Healthy, active instances of `service_name`
    pub async fn get_healthy_instances(&self, service_name: &str) -> Result<Vec<ServiceInfo>> {
        let instances = self.discover_service(service_name).await?;
        Ok(instances.into_iter().filter(ServiceInfo::is_available).collect())
    }

    /// Delete records whose heartbeat is older than the cleanup threshold
    ///
    /// Returns the number of removed records. Failures on individual records
    /// are logged and skipped.
    pub async fn cleanup_stale_services(&self) -> Result<usize> {
        let shared = &self.shared;
        let pattern = format!("{SERVICES_PREFIX}:*");
        let keys = shared.with_timeout("scan", shared.store.scan(&pattern)).await?;

        let now = Utc::now();
        let mut removed = 0;
        for key in keys {
            let Some(info) = self.read_record(&key).await else {
                continue;
            };
            if info.heartbeat_age(now) <= shared.config.cleanup_after {
                continue;
            }

            if let Err(e) = shared.with_timeout("delete", shared.store.del(&key)).await {
                tracing::warn!(key = %key, error = %e, "Failed to remove stale service");
                continue;
            }
            let list_key = service_list_key(&info.service_name);
            if let Err(e) = shared
                .with_timeout("unindex", shared.store.srem(&list_key, &info.instance_id))
                .await
            {
                tracing::warn!(key = %list_key, error = %e, "Failed to unindex stale service");
            }

            tracing::info!(
                service = %info.service_name,
                instance_id = %info.instance_id,
                "Removed stale service instance"
            );
            removed += 1;
        }

        Ok(removed)
    }

    /// Deregister if registered
    pub async fn close(&self) -> Result<()> {
        match self.deregister().await {
            Ok(()) | Err(Error::NotRegistered) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn read_record(&self, key: &str) -> Option<ServiceInfo> {
        let shared = &self.shared;
        let json = match shared.with_timeout("read", shared.store.get(key)).await {
            Ok(Some(json)) => json,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to read service record");
                return None;
            }
        };

        match serde_json::from_str::<ServiceInfo>(&json) {
            Ok(info) => Some(info),
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "Skipping unreadable service record");
                None
            }
        }
    }
}
