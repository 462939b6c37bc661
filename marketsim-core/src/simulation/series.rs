use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{standard_normal, DEFAULT_PRICE};

/// Spacing between generated candles
pub const CANDLE_INTERVAL_MS: i64 = 60 * 60 * 1000;

/// Upper bound on candles per request (a bit over a year of hourly data)
pub const MAX_CANDLES: usize = 10_000;

/// OHLCV candle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    fn flat(timestamp_ms: i64, price: f64, volume: f64) -> Self {
        Self {
            timestamp_ms,
            open: price,
            high: price * 1.005,
            low: price * 0.995,
            close: price,
            volume,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulationKind {
    /// Small noise around each historical close
    StatisticalSimilarity,
    /// Log-normal shock per candle
    MonteCarlo,
    /// Copy of the historical series
    Passthrough,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationParams {
    pub volatility_factor: f64,
    pub trend_factor: f64,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            volatility_factor: 1.0,
            trend_factor: 0.0,
        }
    }
}

/// Hourly random walk (±1% per candle) starting at the default price
pub fn historical_series<R: Rng + ?Sized>(start_ms: i64, end_ms: i64, rng: &mut R) -> Vec<Candle> {
    let mut candles = Vec::new();
    let mut price = DEFAULT_PRICE;
    let mut current = start_ms;

    while current < end_ms && candles.len() < MAX_CANDLES {
        price *= 1.0 + (rng.random::<f64>() - 0.5) * 0.02;
        let volume = 1000.0 + rng.random::<f64>() * 5000.0;
        candles.push(Candle::flat(current, price, volume));
        current += CANDLE_INTERVAL_MS;
    }

    candles
}

/// Derive a simulated series aligned candle-for-candle with `history`
pub fn simulate_series<R: Rng + ?Sized>(
    history: &[Candle],
    kind: SimulationKind,
    params: SimulationParams,
    rng: &mut R,
) -> Vec<Candle> {
    let mut simulated = Vec::with_capacity(history.len());

    for (i, candle) in history.iter().enumerate() {
        let price = match kind {
            SimulationKind::StatisticalSimilarity => {
                let noise = (rng.random::<f64>() - 0.5) * 0.01 * params.volatility_factor;
                candle.close * (1.0 + noise)
            }
            SimulationKind::MonteCarlo => {
                let drift = 0.001;
                let diffusion = 0.02 * params.volatility_factor;
                candle.close * (drift + diffusion * standard_normal(rng)).exp()
            }
            SimulationKind::Passthrough => candle.close,
        };

        let volume = candle.volume * (0.8 + rng.random::<f64>() * 0.4);
        let mut point = Candle::flat(candle.timestamp_ms, price, volume);
        if i > 0 {
            point.close *= 1.0 + params.trend_factor * 0.001;
        }
        simulated.push(point);
    }

    simulated
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_historical_series_is_hourly() {
        let mut rng = StdRng::seed_from_u64(1);
        let series = historical_series(0, 24 * CANDLE_INTERVAL_MS, &mut rng);

        assert_eq!(series.len(), 24);
        assert_eq!(series[1].timestamp_ms - series[0].timestamp_ms, CANDLE_INTERVAL_MS);
        assert!(series.iter().all(|c| c.high > c.low));
    }

    #[test]
    fn test_inverted_range_is_empty() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(historical_series(10, 0, &mut rng).is_empty());
    }

    #[test]
    fn test_series_is_capped() {
        let mut rng = StdRng::seed_from_u64(1);
        let series = historical_series(0, i64::MAX / 2, &mut rng);
        assert_eq!(series.len(), MAX_CANDLES);
    }

    #[test]
    fn test_simulated_series_aligns_with_history() {
        let mut rng = StdRng::seed_from_u64(9);
        let history = historical_series(0, 48 * CANDLE_INTERVAL_MS, &mut rng);

        for kind in [
            SimulationKind::StatisticalSimilarity,
            SimulationKind::MonteCarlo,
            SimulationKind::Passthrough,
        ] {
            let simulated = simulate_series(&history, kind, SimulationParams::default(), &mut rng);
            assert_eq!(simulated.len(), history.len());
            for (h, s) in history.iter().zip(&simulated) {
                assert_eq!(h.timestamp_ms, s.timestamp_ms);
                assert!(s.close > 0.0);
            }
        }
    }

    #[test]
    fn test_passthrough_without_trend_copies_closes() {
        let mut rng = StdRng::seed_from_u64(3);
        let history = historical_series(0, 5 * CANDLE_INTERVAL_MS, &mut rng);
        let simulated = simulate_series(&history, SimulationKind::Passthrough, SimulationParams::default(), &mut rng);

        for (h, s) in history.iter().zip(&simulated) {
            assert!((h.close - s.close).abs() < f64::EPSILON);
        }
    }
}
