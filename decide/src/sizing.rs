//! 📏 Fractional-Kelly position sizing.
//!
//! `f* = p_win − (1 − p_win)/R_ratio`, scaled by the configured Kelly
//! fraction and the regime multiplier, capped by the per-position risk
//! limit. With too little episode history the sizer ignores Kelly entirely
//! and uses the flat fallback percentage.

use serde::Serialize;

use crate::config::KellyConfig;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SizingInputs {
    pub p_win: f64,
    pub r_ratio: f64,
    pub equity_usd: f64,
    /// Closed episodes backing the estimate.
    pub episode_count: i64,
    pub regime_kelly_multiplier: f64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SizingResult {
    pub notional_usd: f64,
    pub equity_fraction: f64,
    pub used_fallback: bool,
}

/// Raw Kelly fraction; negative when the edge does not cover the odds.
pub fn kelly_raw(p_win: f64, r_ratio: f64) -> f64 {
    if r_ratio <= 0.0 {
        return 0.0;
    }
    p_win - (1.0 - p_win) / r_ratio
}

/// Position notional in USD.
pub fn position_size(inputs: &SizingInputs, config: &KellyConfig, max_position_pct: f64) -> SizingResult {
    let fallback = || SizingResult {
        notional_usd: inputs.equity_usd * config.fallback_pct.min(max_position_pct),
        equity_fraction: config.fallback_pct.min(max_position_pct),
        used_fallback: true,
    };

    if !config.enabled || inputs.episode_count < config.min_episodes {
        return fallback();
    }

    let raw = kelly_raw(inputs.p_win, inputs.r_ratio).max(0.0);
    let fraction =
        (raw * config.fraction * inputs.regime_kelly_multiplier).clamp(0.0, max_position_pct);
    if fraction <= 0.0 {
        // No edge: fall back to the flat floor rather than zero so the
        // later EV-recompute gate (not the sizer) makes the final call.
        return fallback();
    }

    SizingResult {
        notional_usd: inputs.equity_usd * fraction,
        equity_fraction: fraction,
        used_fallback: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> KellyConfig {
        KellyConfig {
            enabled: true,
            fraction: 0.25,
            min_episodes: 30,
            fallback_pct: 0.01,
        }
    }

    fn inputs(p: f64, episodes: i64) -> SizingInputs {
        SizingInputs {
            p_win: p,
            r_ratio: 2.0,
            equity_usd: 100_000.0,
            episode_count: episodes,
            regime_kelly_multiplier: 1.0,
        }
    }

    #[test]
    fn kelly_raw_formula() {
        // p=0.6, R=2 → 0.6 − 0.4/2 = 0.4.
        assert!((kelly_raw(0.6, 2.0) - 0.4).abs() < 1e-12);
        // Coin flip at even odds has no edge.
        assert!((kelly_raw(0.5, 1.0)).abs() < 1e-12);
        // Losing proposition is negative.
        assert!(kelly_raw(0.4, 1.0) < 0.0);
    }

    #[test]
    fn fraction_scales_and_caps() {
        let result = position_size(&inputs(0.6, 100), &config(), 0.02);
        // 0.4 · 0.25 = 0.10 → capped at 2%.
        assert!((result.equity_fraction - 0.02).abs() < 1e-12);
        assert!((result.notional_usd - 2_000.0).abs() < 1e-9);
        assert!(!result.used_fallback);
    }

    #[test]
    fn regime_multiplier_shrinks_size() {
        let mut input = inputs(0.55, 100);
        input.regime_kelly_multiplier = 0.5;
        let half = position_size(&input, &config(), 0.10);
        input.regime_kelly_multiplier = 1.0;
        let full = position_size(&input, &config(), 0.10);
        assert!((half.equity_fraction - full.equity_fraction / 2.0).abs() < 1e-12);
    }

    #[test]
    fn thin_history_uses_fallback() {
        let result = position_size(&inputs(0.8, 10), &config(), 0.02);
        assert!(result.used_fallback);
        assert!((result.notional_usd - 1_000.0).abs() < 1e-9);
    }

    #[test]
    fn disabled_kelly_uses_fallback() {
        let mut cfg = config();
        cfg.enabled = false;
        let result = position_size(&inputs(0.8, 1_000), &cfg, 0.02);
        assert!(result.used_fallback);
    }

    #[test]
    fn no_edge_falls_back_instead_of_zero() {
        let result = position_size(&inputs(0.5, 100), &config(), 0.02);
        assert!(result.used_fallback);
        assert!(result.notional_usd > 0.0);
    }

    #[test]
    fn fallback_respects_position_cap() {
        let mut cfg = config();
        cfg.fallback_pct = 0.05;
        let result = position_size(&inputs(0.5, 0), &cfg, 0.02);
        assert!((result.equity_fraction - 0.02).abs() < 1e-12);
    }
}
