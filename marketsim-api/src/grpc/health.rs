//! Standard gRPC health reporting

use marketsim_proto::MARKET_DATA_SERVICE;
use tonic_health::pb::health_server::{Health, HealthServer};
use tonic_health::server::HealthReporter;
use tonic_health::ServingStatus;

/// Health entry for the market data capability
pub const MARKET_DATA_HEALTH_NAME: &str = "market-data";

/// Handle for flipping the reported serving status
#[derive(Clone)]
pub struct HealthHandle {
    reporter: HealthReporter,
}

impl HealthHandle {
    /// Create the reporter and the service it drives
    ///
    /// Every entry starts as NOT_SERVING until [`HealthHandle::set_serving`].
    pub async fn new() -> (Self, HealthServer<impl Health>) {
        let (reporter, service) = tonic_health::server::health_reporter();
        let handle = Self { reporter };
        handle.set_all(ServingStatus::NotServing).await;
        (handle, service)
    }

    pub async fn set_serving(&self) {
        self.set_all(ServingStatus::Serving).await;
        tracing::info!("gRPC health set to SERVING");
    }

    pub async fn set_not_serving(&self) {
        self.set_all(ServingStatus::NotServing).await;
        tracing::info!("gRPC health set to NOT_SERVING");
    }

    async fn set_all(&self, status: ServingStatus) {
        for name in ["", MARKET_DATA_HEALTH_NAME, MARKET_DATA_SERVICE] {
            self.reporter.set_service_status(name, status).await;
        }
    }
}
