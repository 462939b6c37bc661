//! gRPC front-end over a real socket

use marketsim_api::grpc::{self, GrpcOptions, HealthHandle, MARKET_DATA_HEALTH_NAME};
use marketsim_api::impls::{MarketDataApiImpl, MarketDataConfig};
use marketsim_core::simulation::SimulatedPriceSource;
use marketsim_proto::v1::market_data_service_client::MarketDataServiceClient;
use marketsim_proto::v1::{GetPriceRequest, HealthCheckRequest, HealthStatus, StreamPricesRequest};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;

struct TestServer {
    addr: SocketAddr,
    api: Arc<MarketDataApiImpl>,
    health: HealthHandle,
    shutdown: CancellationToken,
    handle: JoinHandle<anyhow::Result<()>>,
}

async fn start() -> TestServer {
    start_with(true).await
}

async fn start_with(serving: bool) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let api = Arc::new(MarketDataApiImpl::new(
        Arc::new(SimulatedPriceSource::new().with_price("AAPL", 150.0)),
        MarketDataConfig::default(),
    ));
    let (health, health_service) = HealthHandle::new().await;
    if serving {
        health.set_serving().await;
    }

    let shutdown = CancellationToken::new();
    let options = GrpcOptions {
        enable_reflection: true,
        channel_capacity: 4,
    };
    let handle = tokio::spawn(grpc::serve(listener, api.clone(), options, health_service, shutdown.clone()));

    TestServer {
        addr,
        api,
        health,
        shutdown,
        handle,
    }
}

async fn channel(addr: SocketAddr) -> Channel {
    Channel::from_shared(format!("http://{addr}"))
        .unwrap()
        .connect()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_unary_calls() {
    let server = start().await;
    let mut client = MarketDataServiceClient::new(channel(server.addr).await);

    let price = client
        .get_price(GetPriceRequest { symbol: "AAPL".into() })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(price.price, 150.0);

    let health = client.health_check(HealthCheckRequest::default()).await.unwrap().into_inner();
    assert_eq!(health.status(), HealthStatus::Serving);

    let err = client
        .get_price(GetPriceRequest { symbol: String::new() })
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::InvalidArgument);

    drop(client);
    server.shutdown.cancel();
    server.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stream_cancelled_by_client() {
    let server = start().await;
    let mut client = MarketDataServiceClient::new(channel(server.addr).await);

    let mut stream = client
        .stream_prices(StreamPricesRequest {
            symbols: vec!["AAPL".into()],
            update_interval_ms: 100,
        })
        .await
        .unwrap()
        .into_inner();

    let first = stream.message().await.unwrap().unwrap();
    assert_eq!(first.symbol, "AAPL");
    assert_eq!(server.api.active_streams(), 1);

    drop(stream);
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.api.active_streams() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("handler still running after the client cancelled");

    drop(client);
    server.shutdown.cancel();
    server.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_health_service_follows_handle() {
    let server = start().await;
    let mut health = HealthClient::new(channel(server.addr).await);

    for service in ["", MARKET_DATA_HEALTH_NAME] {
        let resp = health
            .check(tonic_health::pb::HealthCheckRequest {
                service: service.to_string(),
            })
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.status(), ServingStatus::Serving);
    }

    server.health.set_not_serving().await;
    let resp = health
        .check(tonic_health::pb::HealthCheckRequest {
            service: MARKET_DATA_HEALTH_NAME.to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(resp.status(), ServingStatus::NotServing);

    drop(health);
    server.shutdown.cancel();
    server.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_health_starts_not_serving() {
    let server = start_with(false).await;
    let mut health = HealthClient::new(channel(server.addr).await);

    for service in ["", MARKET_DATA_HEALTH_NAME] {
        let resp = health
            .check(tonic_health::pb::HealthCheckRequest {
                service: service.to_string(),
            })
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.status(), ServingStatus::NotServing);
    }

    server.health.set_serving().await;
    let resp = health
        .check(tonic_health::pb::HealthCheckRequest {
            service: String::new(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(resp.status(), ServingStatus::Serving);

    drop(health);
    server.shutdown.cancel();
    server.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_cancels_open_streams() {
    let server = start().await;
    let mut client = MarketDataServiceClient::new(channel(server.addr).await);

    let mut stream = client
        .stream_prices(StreamPricesRequest {
            symbols: vec!["AAPL".into()],
            update_interval_ms: 100,
        })
        .await
        .unwrap()
        .into_inner();
    stream.message().await.unwrap();

    assert_eq!(server.api.cancel_all_streams(), 1);
    // remaining buffered updates may arrive before the final status
    let status = loop {
        match stream.message().await {
            Ok(Some(_)) => continue,
            Ok(None) => panic!("stream ended without a status"),
            Err(status) => break status,
        }
    };
    assert_eq!(status.code(), tonic::Code::Cancelled);

    drop(client);
    server.shutdown.cancel();
    server.handle.await.unwrap().unwrap();
}
