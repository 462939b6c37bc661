use chrono::{DateTime, Utc};
use dashmap::DashMap;
use marketsim_core::simulation::{
    historical_series, random_walk_step, scenario_multiplier, similarity_metrics, simulate_series, Candle,
    PriceSource, ScenarioKind, SimilarityMetrics, SimulationKind, SimulationParams, DEFAULT_PRICE,
};
use marketsim_proto::v1::{
    GetPriceRequest, GetPriceResponse, HealthCheckRequest, HealthCheckResponse, HealthStatus, PriceChangeInfo,
    PricePoint, PriceUpdate, ScenarioRequest, ScenarioType, SimulationRequest, SimulationResponse, SimulationType,
    StatisticalMetrics, StreamPricesRequest,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tonic::Status;

use crate::bridge::ServerStream;
use crate::error::status_from_core;
use crate::observability::metrics;

/// Source tag on live price updates
pub const PRICE_SOURCE: &str = "market-data-simulator";
/// Source tag on scenario updates
pub const SCENARIO_SOURCE: &str = "scenario-simulator";
/// Real time between scenario ticks; each tick advances simulated time by the same amount
pub const SCENARIO_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct MarketDataConfig {
    pub service_name: String,
    pub service_version: String,
    /// Lower bound applied to requested update intervals
    pub min_update_interval: Duration,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            service_name: "market-data-simulator".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            min_update_interval: Duration::from_millis(100),
        }
    }
}

impl From<&marketsim_core::Config> for MarketDataConfig {
    fn from(config: &marketsim_core::Config) -> Self {
        Self {
            service_name: config.service.name.clone(),
            service_version: config.service.version.clone(),
            min_update_interval: Duration::from_millis(config.streaming.min_update_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Prices,
    Scenario,
}

impl StreamKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Prices => "stream_prices",
            Self::Scenario => "stream_scenario",
        }
    }
}

/// Entry in the active-stream table
#[derive(Debug, Clone)]
pub struct StreamSession {
    pub id: String,
    pub kind: StreamKind,
    pub symbols: Vec<String>,
    pub update_interval: Duration,
    pub started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

impl StreamSession {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Keeps a session listed for as long as its stream runs
struct SessionGuard<'a> {
    sessions: &'a DashMap<String, StreamSession>,
    id: String,
    kind: StreamKind,
}

impl<'a> SessionGuard<'a> {
    fn insert(sessions: &'a DashMap<String, StreamSession>, session: StreamSession) -> Self {
        let id = session.id.clone();
        let kind = session.kind;
        sessions.insert(id.clone(), session);
        metrics::STREAMS_ACTIVE.with_label_values(&[kind.as_str()]).inc();
        Self { sessions, id, kind }
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.sessions.remove(&self.id);
        metrics::STREAMS_ACTIVE.with_label_values(&[self.kind.as_str()]).dec();
    }
}

/// Market data operations shared by every front-end
pub struct MarketDataApiImpl {
    prices: Arc<dyn PriceSource>,
    config: MarketDataConfig,
    sessions: DashMap<String, StreamSession>,
}

impl MarketDataApiImpl {
    #[must_use]
    pub fn new(prices: Arc<dyn PriceSource>, config: MarketDataConfig) -> Self {
        Self {
            prices,
            config,
            sessions: DashMap::new(),
        }
    }

    pub fn active_streams(&self) -> usize {
        self.sessions.len()
    }

    pub fn sessions(&self) -> Vec<StreamSession> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Cancel every running stream, returning how many were signalled
    pub fn cancel_all_streams(&self) -> usize {
        let mut count = 0;
        for entry in &self.sessions {
            entry.value().cancel();
            count += 1;
        }
        count
    }

    fn price_or_default(&self, symbol: &str) -> f64 {
        self.prices.current_price(symbol).unwrap_or_else(|e| {
            tracing::warn!(symbol, error = %e, "No price available, using default");
            DEFAULT_PRICE
        })
    }

    pub async fn get_price(&self, req: GetPriceRequest) -> Result<GetPriceResponse, Status> {
        let price = self.prices.current_price(&req.symbol).map_err(status_from_core)?;

        Ok(GetPriceResponse {
            symbol: req.symbol,
            price,
            timestamp_ms: Utc::now().timestamp_millis(),
            source: PRICE_SOURCE.to_string(),
        })
    }

    /// Emit one random-walk update per symbol every interval until cancelled
    pub async fn stream_prices(
        &self,
        req: StreamPricesRequest,
        stream: ServerStream<PriceUpdate>,
    ) -> Result<(), Status> {
        let symbols: Vec<String> = req
            .symbols
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if symbols.is_empty() {
            return Err(Status::invalid_argument("at least one symbol is required"));
        }

        let requested = Duration::from_millis(u64::try_from(req.update_interval_ms).unwrap_or(0));
        let update_interval = requested.max(self.config.min_update_interval);

        let session_id = format!("stream_{}", nanoid::nanoid!(12));
        let _guard = SessionGuard::insert(
            &self.sessions,
            StreamSession {
                id: session_id.clone(),
                kind: StreamKind::Prices,
                symbols: symbols.clone(),
                update_interval,
                started_at: Utc::now(),
                cancel: stream.context().clone(),
            },
        );

        let mut last_prices: HashMap<String, f64> = symbols
            .iter()
            .map(|symbol| (symbol.clone(), self.price_or_default(symbol)))
            .collect();

        tracing::info!(
            session_id = %session_id,
            symbols = ?symbols,
            interval_ms = update_interval.as_millis() as u64,
            "Price stream started"
        );

        let mut ticker = interval_at(Instant::now() + update_interval, update_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = stream.context().cancelled() => {
                    tracing::info!(session_id = %session_id, "Price stream cancelled");
                    return Err(stream.send_error().unwrap_or_else(|| Status::cancelled("price stream cancelled")));
                }
                _ = ticker.tick() => {
                    let updates = {
                        let mut rng = rand::rng();
                        symbols
                            .iter()
                            .map(|symbol| {
                                let last = last_prices.get(symbol).copied().unwrap_or(DEFAULT_PRICE);
                                let (price, volume) = random_walk_step(last, &mut rng);
                                last_prices.insert(symbol.clone(), price);
                                price_update(symbol, price, volume, last, Utc::now().timestamp_millis(), PRICE_SOURCE)
                            })
                            .collect::<Vec<_>>()
                    };

                    for update in updates {
                        if let Err(status) = stream.send(update).await {
                            tracing::debug!(session_id = %session_id, "Price stream send failed: {}", status.message());
                            return Err(status);
                        }
                    }
                }
            }
        }
    }

    pub async fn generate_simulation(&self, req: SimulationRequest) -> Result<SimulationResponse, Status> {
        let symbol = req.symbol.trim();
        if symbol.is_empty() {
            return Err(Status::invalid_argument("symbol is required"));
        }

        let kind = match req.simulation_type() {
            SimulationType::StatisticalSimilarity => SimulationKind::StatisticalSimilarity,
            SimulationType::MonteCarlo => SimulationKind::MonteCarlo,
            SimulationType::Unspecified => SimulationKind::Passthrough,
        };
        let params = req.parameters.map_or_else(SimulationParams::default, |p| SimulationParams {
            volatility_factor: p.volatility_factor,
            trend_factor: p.trend_factor,
        });

        tracing::info!(
            symbol,
            simulation_type = ?kind,
            start_ms = req.start_time_ms,
            end_ms = req.end_time_ms,
            "Generating simulation"
        );

        let (historical, simulated) = {
            let mut rng = rand::rng();
            let historical = historical_series(req.start_time_ms, req.end_time_ms, &mut rng);
            let simulated = simulate_series(&historical, kind, params, &mut rng);
            (historical, simulated)
        };
        let metrics = similarity_metrics(&historical, &simulated);

        Ok(SimulationResponse {
            symbol: symbol.to_string(),
            historical_data: historical.iter().map(price_point).collect(),
            simulated_data: simulated.iter().map(price_point).collect(),
            similarity_metrics: Some(statistical_metrics(&metrics)),
            simulation_id: format!("sim_{symbol}_{}", Utc::now().timestamp()),
        })
    }

    /// Replay a scenario against the current price, one simulated second per tick
    pub async fn stream_scenario(&self, req: ScenarioRequest, stream: ServerStream<PriceUpdate>) -> Result<(), Status> {
        let symbol = req.symbol.trim().to_string();
        if symbol.is_empty() {
            return Err(Status::invalid_argument("symbol is required"));
        }

        let kind = match req.scenario_type() {
            ScenarioType::Rally => ScenarioKind::Rally,
            ScenarioType::Crash => ScenarioKind::Crash,
            ScenarioType::Divergence => ScenarioKind::Divergence,
            ScenarioType::MeanReverting => ScenarioKind::MeanReverting,
            ScenarioType::Unspecified => ScenarioKind::Unspecified,
        };
        let intensity = req.parameters.map_or(1.0, |p| p.intensity);
        let start_ms = if req.start_time_ms > 0 {
            req.start_time_ms
        } else {
            Utc::now().timestamp_millis()
        };
        let duration_ms = i64::from(req.duration_minutes.max(0)) * 60_000;
        let end_ms = start_ms + duration_ms;
        let base_price = self.price_or_default(&symbol);

        let session_id = format!("scenario_{}", nanoid::nanoid!(12));
        let _guard = SessionGuard::insert(
            &self.sessions,
            StreamSession {
                id: session_id.clone(),
                kind: StreamKind::Scenario,
                symbols: vec![symbol.clone()],
                update_interval: SCENARIO_TICK,
                started_at: Utc::now(),
                cancel: stream.context().clone(),
            },
        );

        tracing::info!(
            session_id = %session_id,
            symbol = %symbol,
            scenario = ?kind,
            duration_minutes = req.duration_minutes,
            "Scenario stream started"
        );

        let tick_ms = SCENARIO_TICK.as_millis() as i64;
        let mut ticker = interval_at(Instant::now() + SCENARIO_TICK, SCENARIO_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut current_ms = start_ms;

        while current_ms < end_ms {
            tokio::select! {
                biased;
                () = stream.context().cancelled() => {
                    tracing::info!(session_id = %session_id, "Scenario stream cancelled");
                    return Err(stream.send_error().unwrap_or_else(|| Status::cancelled("scenario stream cancelled")));
                }
                _ = ticker.tick() => {
                    let progress = (current_ms - start_ms) as f64 / duration_ms as f64;
                    let price = base_price * scenario_multiplier(kind, intensity, progress);
                    let volume = 1000.0 + rand::random::<f64>() * 9000.0 * intensity;
                    let update = price_update(&symbol, price, volume, base_price, current_ms, SCENARIO_SOURCE);

                    stream.send(update).await?;
                    current_ms += tick_ms;
                }
            }
        }

        tracing::info!(session_id = %session_id, "Scenario stream completed");
        Ok(())
    }

    pub async fn health_check(&self, _req: HealthCheckRequest) -> Result<HealthCheckResponse, Status> {
        let details = HashMap::from([
            ("service_name".to_string(), self.config.service_name.clone()),
            ("service_version".to_string(), self.config.service_version.clone()),
            ("active_streams".to_string(), self.active_streams().to_string()),
        ]);

        Ok(HealthCheckResponse {
            status: HealthStatus::Serving as i32,
            message: "Market Data Service is healthy".to_string(),
            timestamp_ms: Utc::now().timestamp_millis(),
            details,
        })
    }
}

fn price_update(symbol: &str, price: f64, volume: f64, reference: f64, timestamp_ms: i64, source: &str) -> PriceUpdate {
    let change_amount = price - reference;
    PriceUpdate {
        symbol: symbol.to_string(),
        price,
        volume,
        timestamp_ms,
        source: source.to_string(),
        change_info: Some(PriceChangeInfo {
            change_amount,
            change_percentage: change_amount / reference * 100.0,
            daily_high: price * 1.02,
            daily_low: price * 0.98,
            daily_volume: volume * 100.0,
        }),
    }
}

fn price_point(candle: &Candle) -> PricePoint {
    PricePoint {
        timestamp_ms: candle.timestamp_ms,
        open: candle.open,
        high: candle.high,
        low: candle.low,
        close: candle.close,
        volume: candle.volume,
    }
}

fn statistical_metrics(metrics: &SimilarityMetrics) -> StatisticalMetrics {
    StatisticalMetrics {
        correlation_coefficient: metrics.correlation_coefficient,
        volatility_similarity: metrics.volatility_similarity,
        return_distribution_similarity: metrics.return_distribution_similarity,
        trend_similarity: metrics.trend_similarity,
        confidence_score: metrics.confidence_score,
    }
}
