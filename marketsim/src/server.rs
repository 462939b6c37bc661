//! Process wiring: store, registry, client pool, handler and both servers

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};

use marketsim_api::grpc::{self, GrpcOptions, HealthHandle};
use marketsim_api::http::{self, create_router, AppState};
use marketsim_api::impls::{MarketDataApiImpl, MarketDataConfig};
use marketsim_api::observability::metrics;
use marketsim_cluster::{
    ClientManager, ManagerConfig, MemoryStore, RedisStore, RegistryConfig, RegistryStore, ServiceRegistry,
};
use marketsim_core::simulation::SimulatedPriceSource;
use marketsim_core::Config;

pub struct MarketSimServer {
    config: Config,
    api: Arc<MarketDataApiImpl>,
    registry: Arc<ServiceRegistry>,
    clients: Arc<ClientManager>,
}

impl MarketSimServer {
    pub async fn build(config: Config) -> Result<Self> {
        let store = create_store(&config).await;
        let registry = Arc::new(ServiceRegistry::new(store, RegistryConfig::from_config(&config)));

        let clients = Arc::new(ClientManager::new(
            registry.clone(),
            ManagerConfig::from_config(&config.client),
        )?);
        clients.metrics().register(metrics::registry())?;

        let api = Arc::new(MarketDataApiImpl::new(
            Arc::new(SimulatedPriceSource::new()),
            MarketDataConfig::from(&config),
        ));

        Ok(Self {
            config,
            api,
            registry,
            clients,
        })
    }

    pub async fn run(self) -> Result<()> {
        let grpc_listener = TcpListener::bind(self.config.grpc_address()).await?;
        let http_listener = TcpListener::bind(self.config.http_address()).await?;

        let shutdown = CancellationToken::new();
        let (health, health_service) = HealthHandle::new().await;

        let mut grpc_task = tokio::spawn(
            grpc::serve(
                grpc_listener,
                self.api.clone(),
                GrpcOptions::from(&self.config),
                health_service,
                shutdown.clone(),
            )
            .in_current_span(),
        );

        let router = create_router(AppState {
            api: self.api.clone(),
            registry: Some(self.registry.clone()),
            service_name: self.config.service.name.clone(),
            service_version: self.config.service.version.clone(),
            channel_capacity: self.config.streaming.channel_capacity,
        });
        let mut http_task = tokio::spawn(http::serve(http_listener, router, shutdown.clone()).in_current_span());

        health.set_serving().await;

        // Registration failure leaves the instance serving but undiscoverable
        match self.registry.register().await {
            Ok(()) => info!(instance_id = %self.registry.instance_id(), "Registered with service registry"),
            Err(e) => warn!("Service registration failed, running in degraded mode: {}", e),
        }

        let maintenance = CancellationToken::new();
        let client_task = self.clients.spawn_maintenance(maintenance.clone());
        let sweep_task = spawn_stale_sweep(
            self.registry.clone(),
            stale_sweep_period(&self.config),
            maintenance.clone(),
        );

        info!("MarketSim is running");

        tokio::select! {
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
            }
            res = &mut grpc_task => {
                error!("gRPC server exited unexpectedly: {:?}", res);
            }
            res = &mut http_task => {
                error!("HTTP server exited unexpectedly: {:?}", res);
            }
        }

        // 1. Stop advertising
        health.set_not_serving().await;
        if self.registry.is_registered().await {
            if let Err(e) = self.registry.deregister().await {
                warn!("Failed to deregister: {}", e);
            }
        }

        // 2. Background work and outbound connections
        maintenance.cancel();
        for task in [client_task, sweep_task] {
            if let Err(e) = task.await {
                warn!("Maintenance task failed: {}", e);
            }
        }
        self.clients.close().await;

        // 3. Open streams, then the servers themselves
        let cancelled = self.api.cancel_all_streams();
        if cancelled > 0 {
            info!(cancelled, "Cancelled open streams");
        }
        shutdown.cancel();

        let grace = Duration::from_secs(self.config.server.shutdown_timeout_seconds);
        let servers = async {
            for (name, task) in [("gRPC", grpc_task), ("HTTP", http_task)] {
                if task.is_finished() {
                    continue;
                }
                match task.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("{} server error during shutdown: {}", name, e),
                    Err(e) => error!("{} server task failed: {}", name, e),
                }
            }
        };
        if tokio::time::timeout(grace, servers).await.is_err() {
            warn!("Servers did not stop within {:?}", grace);
        }

        info!("MarketSim stopped");
        Ok(())
    }
}

/// Redis-backed store, or an in-process one when Redis is unset or unreachable
async fn create_store(config: &Config) -> Arc<dyn RegistryStore> {
    let op_timeout = Duration::from_secs(config.redis.connect_timeout_seconds);

    match config.redis_url() {
        Some(url) => match RedisStore::connect(url, op_timeout).await {
            Ok(store) => {
                info!("Using Redis service registry");
                Arc::new(store)
            }
            Err(e) => {
                warn!("Redis unavailable ({}), falling back to local-only registry", e);
                Arc::new(MemoryStore::new())
            }
        },
        None => {
            info!("No Redis URL configured, using local-only registry");
            Arc::new(MemoryStore::new())
        }
    }
}

fn stale_sweep_period(config: &Config) -> Duration {
    let secs = u64::try_from(config.discovery.stale_after_seconds).unwrap_or(60).max(1);
    Duration::from_secs(secs)
}

/// Periodically remove registrations whose owners stopped heartbeating
fn spawn_stale_sweep(registry: Arc<ServiceRegistry>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    let sweep = async move {
        let mut timer = interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = timer.tick() => match registry.cleanup_stale_services().await {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "Removed stale registrations"),
                    Err(e) => warn!("Stale registration sweep failed: {}", e),
                },
            }
        }
    };
    tokio::spawn(sweep.in_current_span())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C signal");
            }
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
