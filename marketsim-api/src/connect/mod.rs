//! Connect front-end
//!
//! Unary methods take a bare JSON or protobuf body; server-streaming methods
//! take one enveloped message and answer with enveloped messages followed by
//! an end-of-stream envelope. Both call into [`MarketDataApiImpl`].
//!
//! [`MarketDataApiImpl`]: crate::impls::MarketDataApiImpl

pub mod codec;
pub mod envelope;
pub mod error;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, StatusCode};
use marketsim_proto::v1::{
    GetPriceRequest, HealthCheckRequest, PriceUpdate, ScenarioRequest, SimulationRequest, StreamPricesRequest,
};
use marketsim_proto::MARKET_DATA_SERVICE;
use prost::Message;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Status;

use crate::bridge::{spawn_bridged, ServerStream, StreamSink};
use crate::http::AppState;

pub use codec::Codec;
pub use error::{connect_code, error_response};

pub const TIMEOUT_HEADER: &str = "connect-timeout-ms";
pub const PROTOCOL_VERSION_HEADER: &str = "connect-protocol-version";

pub type Frame = Result<Bytes, Infallible>;

/// Connect routes for the market data service
pub fn create_connect_router() -> Router<AppState> {
    let path = |method: &str| format!("/{MARKET_DATA_SERVICE}/{method}");

    Router::new()
        .route(&path("GetPrice"), post(get_price))
        .route(&path("StreamPrices"), post(stream_prices))
        .route(&path("GenerateSimulation"), post(generate_simulation))
        .route(&path("StreamScenario"), post(stream_scenario))
        .route(&path("HealthCheck"), post(health_check))
}

async fn get_price(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    unary(&headers, body, |req: GetPriceRequest| async move { state.api.get_price(req).await }).await
}

async fn generate_simulation(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    unary(&headers, body, |req: SimulationRequest| async move {
        state.api.generate_simulation(req).await
    })
    .await
}

async fn health_check(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    unary(&headers, body, |req: HealthCheckRequest| async move { state.api.health_check(req).await }).await
}

async fn stream_prices(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let api = state.api.clone();
    server_stream(&state, &headers, body, move |req: StreamPricesRequest, stream| async move {
        api.stream_prices(req, stream).await
    })
}

async fn stream_scenario(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let api = state.api.clone();
    server_stream(&state, &headers, body, move |req: ScenarioRequest, stream| async move {
        api.stream_scenario(req, stream).await
    })
}

/// Parse `Connect-Timeout-Ms` (at most 10 digits)
pub fn parse_timeout(headers: &HeaderMap) -> Result<Option<Duration>, Status> {
    let Some(value) = headers.get(TIMEOUT_HEADER) else {
        return Ok(None);
    };

    let value = value
        .to_str()
        .map_err(|_| Status::invalid_argument("Connect-Timeout-Ms is not valid ASCII"))?;
    if value.is_empty() || value.len() > 10 || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Status::invalid_argument(format!("invalid Connect-Timeout-Ms: {value}")));
    }

    value
        .parse::<u64>()
        .map(|ms| Some(Duration::from_millis(ms)))
        .map_err(|e| Status::invalid_argument(format!("invalid Connect-Timeout-Ms: {e}")))
}

fn unsupported(content_type: &str) -> Response {
    (
        StatusCode::UNSUPPORTED_MEDIA_TYPE,
        format!("unsupported content type {content_type:?}"),
    )
        .into_response()
}

async fn unary<Req, Resp, F, Fut>(headers: &HeaderMap, body: Bytes, call: F) -> Response
where
    Req: Message + DeserializeOwned + Default,
    Resp: Message + Serialize,
    F: FnOnce(Req) -> Fut,
    Fut: Future<Output = Result<Resp, Status>>,
{
    let codec = match Codec::for_unary(headers) {
        Ok(codec) => codec,
        Err(codec::UnsupportedMediaType(content_type)) => return unsupported(&content_type),
    };

    let result = async {
        let timeout = parse_timeout(headers)?;
        let req: Req = codec.decode(&body)?;

        let resp = match timeout {
            Some(limit) => tokio::time::timeout(limit, call(req))
                .await
                .map_err(|_| Status::deadline_exceeded("deadline exceeded"))??,
            None => call(req).await?,
        };
        codec.encode(&resp)
    }
    .await;

    match result {
        Ok(bytes) => ([(CONTENT_TYPE, codec.unary_content_type())], bytes).into_response(),
        Err(status) => {
            tracing::debug!(code = connect_code(status.code()), "Connect call failed: {}", status.message());
            error_response(&status)
        }
    }
}

fn server_stream<Req, F, Fut>(state: &AppState, headers: &HeaderMap, body: Bytes, call: F) -> Response
where
    Req: Message + DeserializeOwned + Default + Send + 'static,
    F: FnOnce(Req, ServerStream<PriceUpdate>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), Status>> + Send + 'static,
{
    let codec = match Codec::for_stream(headers) {
        Ok(codec) => codec,
        Err(codec::UnsupportedMediaType(content_type)) => return unsupported(&content_type),
    };

    let capacity = state.channel_capacity.max(1);
    let (tx, rx) = mpsc::channel::<Frame>(capacity);
    let mut sink = ConnectSink::new(tx, codec);

    let parsed = parse_timeout(headers).and_then(|timeout| {
        let payload = envelope::decode_single(body)?;
        Ok((timeout, codec.decode::<Req>(&payload)?))
    });

    match parsed {
        Ok((timeout, req)) => {
            let ctx = CancellationToken::new();
            if let Some(limit) = timeout {
                watch_deadline(ctx.clone(), limit, sink.deadline_flag());
            }
            spawn_bridged(ctx, capacity, sink, move |stream| call(req, stream));
        }
        Err(status) => {
            tokio::spawn(async move { sink.finish(Err(status)).await });
        }
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, codec.stream_content_type())
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|e| error_response(&Status::internal(e.to_string())))
}

/// Cancel `ctx` once `limit` has passed, unless it ends first
fn watch_deadline(ctx: CancellationToken, limit: Duration, fired: Arc<AtomicBool>) {
    tokio::spawn(async move {
        tokio::select! {
            () = ctx.cancelled() => {}
            () = tokio::time::sleep(limit) => {
                fired.store(true, Ordering::SeqCst);
                ctx.cancel();
            }
        }
    });
}

/// Writes enveloped messages into an HTTP response body
pub struct ConnectSink<T> {
    tx: mpsc::Sender<Frame>,
    codec: Codec,
    deadline_exceeded: Arc<AtomicBool>,
    _message: PhantomData<fn(T)>,
}

impl<T> ConnectSink<T> {
    pub fn new(tx: mpsc::Sender<Frame>, codec: Codec) -> Self {
        Self {
            tx,
            codec,
            deadline_exceeded: Arc::new(AtomicBool::new(false)),
            _message: PhantomData,
        }
    }

    /// Set when the request deadline cancelled the stream
    pub fn deadline_flag(&self) -> Arc<AtomicBool> {
        self.deadline_exceeded.clone()
    }
}

#[async_trait]
impl<T> StreamSink<T> for ConnectSink<T>
where
    T: Message + Serialize + Send + 'static,
{
    async fn send(&mut self, msg: T) -> Result<(), Status> {
        let frame = envelope::encode(0, &self.codec.encode(&msg)?)?;
        self.tx
            .send(Ok(frame))
            .await
            .map_err(|_| Status::cancelled("client disconnected"))
    }

    async fn closed(&self) {
        self.tx.closed().await;
    }

    async fn finish(&mut self, result: Result<(), Status>) {
        let result = match result {
            Err(status) if self.deadline_exceeded.load(Ordering::SeqCst) => {
                tracing::debug!("Stream ended by Connect deadline: {}", status.message());
                Err(Status::deadline_exceeded("deadline exceeded"))
            }
            other => other,
        };

        match envelope::encode(envelope::FLAG_END_STREAM, &error::end_of_stream_payload(&result)) {
            Ok(frame) => {
                // client may already be gone
                let _ = self.tx.send(Ok(frame)).await;
            }
            Err(status) => tracing::warn!("Failed to encode end-of-stream envelope: {}", status.message()),
        }
    }
}
