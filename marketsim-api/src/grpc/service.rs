//! tonic binding of the market data service

use marketsim_proto::v1::market_data_service_server::MarketDataService;
use marketsim_proto::v1::{
    GetPriceRequest, GetPriceResponse, HealthCheckRequest, HealthCheckResponse, PriceUpdate, ScenarioRequest,
    SimulationRequest, SimulationResponse, StreamPricesRequest,
};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use crate::bridge::{spawn_bridged, ServerStream, StreamSink};
use crate::impls::MarketDataApiImpl;

pub type UpdateStream = ReceiverStream<Result<PriceUpdate, Status>>;

/// Writes into the channel tonic drains for a streaming response
pub struct GrpcSink<T>(mpsc::Sender<Result<T, Status>>);

impl<T> GrpcSink<T> {
    pub fn new(tx: mpsc::Sender<Result<T, Status>>) -> Self {
        Self(tx)
    }
}

#[async_trait]
impl<T: Send + 'static> StreamSink<T> for GrpcSink<T> {
    async fn send(&mut self, msg: T) -> Result<(), Status> {
        self.0
            .send(Ok(msg))
            .await
            .map_err(|_| Status::cancelled("client disconnected"))
    }

    async fn closed(&self) {
        self.0.closed().await;
    }

    async fn finish(&mut self, result: Result<(), Status>) {
        if let Err(status) = result {
            // client may already be gone
            let _ = self.0.send(Err(status)).await;
        }
    }
}

#[derive(Clone)]
pub struct MarketDataGrpcService {
    api: Arc<MarketDataApiImpl>,
    channel_capacity: usize,
}

impl MarketDataGrpcService {
    #[must_use]
    pub fn new(api: Arc<MarketDataApiImpl>, channel_capacity: usize) -> Self {
        Self { api, channel_capacity }
    }

    fn bridge<F, Fut>(&self, handler: F) -> UpdateStream
    where
        F: FnOnce(ServerStream<PriceUpdate>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.channel_capacity.max(1));
        // the response stream is dropped when the client goes away, which
        // closes the sink and cancels this token
        spawn_bridged(CancellationToken::new(), self.channel_capacity, GrpcSink::new(tx), handler);
        ReceiverStream::new(rx)
    }
}

#[tonic::async_trait]
impl MarketDataService for MarketDataGrpcService {
    type StreamPricesStream = UpdateStream;
    type StreamScenarioStream = UpdateStream;

    async fn get_price(&self, request: Request<GetPriceRequest>) -> Result<Response<GetPriceResponse>, Status> {
        self.api.get_price(request.into_inner()).await.map(Response::new)
    }

    async fn stream_prices(
        &self,
        request: Request<StreamPricesRequest>,
    ) -> Result<Response<Self::StreamPricesStream>, Status> {
        let req = request.into_inner();
        let api = self.api.clone();
        Ok(Response::new(
            self.bridge(move |stream| async move { api.stream_prices(req, stream).await }),
        ))
    }

    async fn generate_simulation(
        &self,
        request: Request<SimulationRequest>,
    ) -> Result<Response<SimulationResponse>, Status> {
        self.api.generate_simulation(request.into_inner()).await.map(Response::new)
    }

    async fn stream_scenario(
        &self,
        request: Request<ScenarioRequest>,
    ) -> Result<Response<Self::StreamScenarioStream>, Status> {
        let req = request.into_inner();
        let api = self.api.clone();
        Ok(Response::new(
            self.bridge(move |stream| async move { api.stream_scenario(req, stream).await }),
        ))
    }

    async fn health_check(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        self.api.health_check(request.into_inner()).await.map(Response::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::MarketDataConfig;
    use marketsim_core::simulation::SimulatedPriceSource;
    use std::time::Duration;
    use tokio_stream::StreamExt;

    fn service() -> MarketDataGrpcService {
        let api = MarketDataApiImpl::new(Arc::new(SimulatedPriceSource::new()), MarketDataConfig::default());
        MarketDataGrpcService::new(Arc::new(api), 4)
    }

    #[tokio::test]
    async fn test_unary_passthrough() {
        let resp = service()
            .get_price(Request::new(GetPriceRequest { symbol: "msft".into() }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.symbol, "msft");
        assert_eq!(resp.price, 100.0);
    }

    #[tokio::test]
    async fn test_stream_error_is_delivered_in_band() {
        let mut stream = service()
            .stream_prices(Request::new(StreamPricesRequest::default()))
            .await
            .unwrap()
            .into_inner();

        let item = stream.next().await.unwrap();
        assert_eq!(item.unwrap_err().code(), tonic::Code::InvalidArgument);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_response_stream_ends_session() {
        let service = service();
        let mut stream = service
            .stream_prices(Request::new(StreamPricesRequest {
                symbols: vec!["AAPL".into()],
                update_interval_ms: 100,
            }))
            .await
            .unwrap()
            .into_inner();

        assert!(stream.next().await.unwrap().is_ok());
        assert_eq!(service.api.active_streams(), 1);

        drop(stream);
        tokio::time::timeout(Duration::from_secs(1), async {
            while service.api.active_streams() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
