use std::f64::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioKind {
    Rally,
    Crash,
    Divergence,
    MeanReverting,
    /// Flat line at the base price
    Unspecified,
}

/// Price multiplier relative to the base price at `progress` ∈ [0, 1]
#[must_use]
pub fn scenario_multiplier(kind: ScenarioKind, intensity: f64, progress: f64) -> f64 {
    let progress = progress.clamp(0.0, 1.0);
    let excess = intensity - 1.0;

    match kind {
        // fast early growth that flattens
        ScenarioKind::Rally => 1.0 + excess * progress.sqrt(),
        ScenarioKind::Crash => 1.0 - excess * progress * 0.5,
        ScenarioKind::Divergence => 1.0 + excess * 0.1 * (progress * PI * 4.0).sin(),
        ScenarioKind::MeanReverting => {
            let deviation = excess * 0.2 * (progress * PI * 2.0).sin();
            1.0 + deviation * (-progress * 3.0).exp()
        }
        ScenarioKind::Unspecified => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_scenarios_start_at_base() {
        for kind in [
            ScenarioKind::Rally,
            ScenarioKind::Crash,
            ScenarioKind::Divergence,
            ScenarioKind::MeanReverting,
            ScenarioKind::Unspecified,
        ] {
            assert!((scenario_multiplier(kind, 1.5, 0.0) - 1.0).abs() < 1e-9, "{kind:?}");
        }
    }

    #[test]
    fn test_rally_rises_and_crash_falls() {
        assert!((scenario_multiplier(ScenarioKind::Rally, 1.5, 1.0) - 1.5).abs() < 1e-9);
        assert!((scenario_multiplier(ScenarioKind::Crash, 1.5, 1.0) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_unit_intensity_is_flat() {
        assert!((scenario_multiplier(ScenarioKind::Divergence, 1.0, 0.3) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_progress_is_clamped() {
        assert_eq!(
            scenario_multiplier(ScenarioKind::Rally, 2.0, 5.0),
            scenario_multiplier(ScenarioKind::Rally, 2.0, 1.0)
        );
    }
}
