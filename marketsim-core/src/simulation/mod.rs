//! Price simulation primitives
//!
//! The RPC layer only sees [`PriceSource`] and the pure functions in the
//! submodules; the formulas themselves are placeholders for a real pricing
//! model and carry no statistical guarantees.

pub mod scenario;
pub mod series;
pub mod similarity;

use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;

use crate::error::{Error, Result};

pub use scenario::{scenario_multiplier, ScenarioKind};
pub use series::{historical_series, simulate_series, Candle, SimulationKind, SimulationParams};
pub use similarity::{similarity_metrics, SimilarityMetrics};

/// Price used when a symbol has never been quoted
pub const DEFAULT_PRICE: f64 = 100.0;

/// Source of the latest known price per symbol
pub trait PriceSource: Send + Sync {
    fn current_price(&self, symbol: &str) -> Result<f64>;
}

/// In-memory price book seeded with a flat default
#[derive(Debug, Default)]
pub struct SimulatedPriceSource {
    prices: RwLock<HashMap<String, f64>>,
}

impl SimulatedPriceSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a symbol with an explicit price
    #[must_use]
    pub fn with_price(self, symbol: &str, price: f64) -> Self {
        self.prices.write().insert(symbol.to_uppercase(), price);
        self
    }

    /// Record the latest traded price for a symbol
    pub fn set_price(&self, symbol: &str, price: f64) {
        self.prices.write().insert(symbol.to_uppercase(), price);
    }
}

impl PriceSource for SimulatedPriceSource {
    fn current_price(&self, symbol: &str) -> Result<f64> {
        let symbol = symbol.trim();
        if symbol.is_empty() {
            return Err(Error::InvalidInput("symbol is required".to_string()));
        }
        Ok(self
            .prices
            .read()
            .get(&symbol.to_uppercase())
            .copied()
            .unwrap_or(DEFAULT_PRICE))
    }
}

/// One random-walk step: a move of at most ±0.5% plus a volume in [1000, 10000)
pub fn random_walk_step<R: Rng + ?Sized>(last_price: f64, rng: &mut R) -> (f64, f64) {
    let change = (rng.random::<f64>() - 0.5) * 0.01;
    let volume = 1000.0 + rng.random::<f64>() * 9000.0;
    (last_price * (1.0 + change), volume)
}

/// Standard normal sample (Box-Muller)
pub(crate) fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    let u1 = rng.random::<f64>().max(f64::MIN_POSITIVE);
    let u2 = rng.random::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}
