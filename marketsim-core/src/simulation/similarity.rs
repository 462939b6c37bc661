//! Similarity between a historical and a simulated series
//!
//! Every score except the correlation lies in [0, 1]; the confidence score is
//! the mean of the four component scores with negative correlation counted
//! as zero.

use serde::{Deserialize, Serialize};

use super::series::Candle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SimilarityMetrics {
    pub correlation_coefficient: f64,
    pub volatility_similarity: f64,
    pub return_distribution_similarity: f64,
    pub trend_similarity: f64,
    pub confidence_score: f64,
}

#[must_use]
pub fn similarity_metrics(historical: &[Candle], simulated: &[Candle]) -> SimilarityMetrics {
    let len = historical.len().min(simulated.len());
    if len < 2 {
        return SimilarityMetrics::default();
    }

    let h_close: Vec<f64> = historical[..len].iter().map(|c| c.close).collect();
    let s_close: Vec<f64> = simulated[..len].iter().map(|c| c.close).collect();
    let h_ret = log_returns(&h_close);
    let s_ret = log_returns(&s_close);

    let correlation = pearson(&h_close, &s_close);

    let (h_mean, h_std) = mean_std(&h_ret);
    let (s_mean, s_std) = mean_std(&s_ret);

    let volatility = if h_std == 0.0 && s_std == 0.0 {
        1.0
    } else {
        h_std.min(s_std) / h_std.max(s_std)
    };

    let spread = h_std + s_std;
    let distribution = if spread == 0.0 {
        if (h_mean - s_mean).abs() < f64::EPSILON { 1.0 } else { 0.0 }
    } else {
        (1.0 - (h_mean - s_mean).abs() / spread).clamp(0.0, 1.0)
    };

    let agreeing = h_ret
        .iter()
        .zip(&s_ret)
        .filter(|(h, s)| h.signum() == s.signum())
        .count();
    let trend = agreeing as f64 / h_ret.len() as f64;

    SimilarityMetrics {
        correlation_coefficient: correlation,
        volatility_similarity: volatility,
        return_distribution_similarity: distribution,
        trend_similarity: trend,
        confidence_score: (correlation.max(0.0) + volatility + distribution + trend) / 4.0,
    }
}

fn log_returns(prices: &[f64]) -> Vec<f64> {
    prices
        .windows(2)
        .map(|w| if w[0] > 0.0 && w[1] > 0.0 { (w[1] / w[0]).ln() } else { 0.0 })
        .collect()
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let (a_mean, a_std) = mean_std(a);
    let (b_mean, b_std) = mean_std(b);
    if a_std == 0.0 || b_std == 0.0 {
        return 0.0;
    }
    let cov = a
        .iter()
        .zip(b)
        .map(|(x, y)| (x - a_mean) * (y - b_mean))
        .sum::<f64>()
        / a.len() as f64;
    (cov / (a_std * b_std)).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candles(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                timestamp_ms: i as i64,
                open: close,
                high: close,
                low: close,
                close,
                volume: 1.0,
            })
            .collect()
    }

    #[test]
    fn test_identical_series_scores_one() {
        let series = candles(&[100.0, 101.0, 99.0, 102.0, 103.0]);
        let metrics = similarity_metrics(&series, &series);

        assert!((metrics.correlation_coefficient - 1.0).abs() < 1e-9);
        assert!((metrics.volatility_similarity - 1.0).abs() < 1e-9);
        assert!((metrics.return_distribution_similarity - 1.0).abs() < 1e-9);
        assert!((metrics.trend_similarity - 1.0).abs() < 1e-9);
        assert!((metrics.confidence_score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_mirrored_series_is_anticorrelated() {
        let up = candles(&[100.0, 101.0, 102.0, 103.0]);
        let down = candles(&[103.0, 102.0, 101.0, 100.0]);
        let metrics = similarity_metrics(&up, &down);

        assert!(metrics.correlation_coefficient < -0.99);
        assert_eq!(metrics.trend_similarity, 0.0);
        assert!(metrics.confidence_score < 0.75);
    }

    #[test]
    fn test_short_series_yield_zeroes() {
        let one = candles(&[100.0]);
        assert_eq!(similarity_metrics(&one, &one), SimilarityMetrics::default());
        assert_eq!(similarity_metrics(&[], &[]), SimilarityMetrics::default());
    }
}
