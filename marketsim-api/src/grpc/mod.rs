//! gRPC front-end
//!
//! Serves the market data service, the standard health service and (when
//! enabled) reflection. gRPC-Web is accepted on the same port over HTTP/1.1.

pub mod health;
pub mod service;

use marketsim_proto::v1::market_data_service_server::MarketDataServiceServer;
use marketsim_proto::FILE_DESCRIPTOR_SET;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic_health::pb::health_server::{Health, HealthServer};
use tonic_reflection::server::Builder as ReflectionBuilder;
use tonic_web::GrpcWebLayer;

use crate::impls::MarketDataApiImpl;

pub use health::{HealthHandle, MARKET_DATA_HEALTH_NAME};
pub use service::{GrpcSink, MarketDataGrpcService};

#[derive(Debug, Clone)]
pub struct GrpcOptions {
    pub enable_reflection: bool,
    pub channel_capacity: usize,
}

impl From<&marketsim_core::Config> for GrpcOptions {
    fn from(config: &marketsim_core::Config) -> Self {
        Self {
            enable_reflection: config.server.enable_reflection,
            channel_capacity: config.streaming.channel_capacity,
        }
    }
}

/// Run the gRPC server on `listener` until `shutdown` fires
pub async fn serve<H: Health>(
    listener: TcpListener,
    api: Arc<MarketDataApiImpl>,
    options: GrpcOptions,
    health_service: HealthServer<H>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!("Starting gRPC server on {}", addr);

    // Add reflection if enabled
    let reflection_service = if options.enable_reflection {
        let reflection = ReflectionBuilder::configure()
            .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
            .build_v1()
            .map_err(|e| anyhow::anyhow!("Failed to build reflection service: {}", e))?;

        tracing::info!("gRPC reflection enabled");
        Some(reflection)
    } else {
        None
    };

    let market_data = MarketDataGrpcService::new(api, options.channel_capacity);

    Server::builder()
        .accept_http1(true)
        .layer(GrpcWebLayer::new())
        .add_service(health_service)
        .add_service(MarketDataServiceServer::new(market_data))
        .add_optional_service(reflection_service)
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown.cancelled_owned())
        .await
        .map_err(|e| anyhow::anyhow!("gRPC server error: {}", e))?;

    tracing::info!("gRPC server stopped");
    Ok(())
}
