//! Online per-market statistics: exponentially weighted mean/variance over
//! price and volume delta, with pre-update Z-scores.

use crate::config::{Config, EWMA_SPAN, MIN_STD_PRICE, MIN_STD_VOLUME};
use crate::types::Tick;

/// EWMA smoothing factor.
pub const ALPHA: f64 = 2.0 / (EWMA_SPAN + 1.0);

/// Estimator state for one market. `Default` is the zero sentinel
/// (`tick_count == 0`, nothing consumed).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EwmaState {
    pub price_mean: f64,
    pub price_var: f64,
    pub volume_mean: f64,
    pub volume_var: f64,
    /// Price of the most recently consumed live tick, not the mean.
    /// Stays 0 through cold-start seeding.
    pub last_price: f64,
    /// Updates applied since the zero sentinel, seed observations included.
    pub tick_count: i64,
}

impl EwmaState {
    /// Consume one live tick: advance both moment pairs, record the price,
    /// bump the count.
    pub fn update(&mut self, price: f64, delta_volume: f64) {
        self.observe(price, delta_volume);
        self.last_price = price;
    }

    fn observe(&mut self, price: f64, delta_volume: f64) {
        if self.tick_count == 0 {
            self.price_mean = price;
            self.volume_mean = delta_volume;
            self.price_var = 0.0;
            self.volume_var = 0.0;
        } else {
            update_moments(&mut self.price_mean, &mut self.price_var, price);
            update_moments(&mut self.volume_mean, &mut self.volume_var, delta_volume);
        }
        self.tick_count += 1;
    }

    /// Rebuild state from filtered history, oldest first. Moments and the
    /// tick count advance; `last_price` does not, so the first live tick after
    /// a cold start is consumed without a detection decision.
    pub fn seed(history: &[Tick]) -> Self {
        let mut state = Self::default();
        for t in history {
            state.observe(t.yes_price, t.delta_volume);
        }
        state
    }

    /// Z-scores of an observation against the current (pre-update) moments.
    pub fn zscores(&self, price: f64, delta_volume: f64) -> (f64, f64) {
        (
            zscore(price, self.price_mean, self.price_var, MIN_STD_PRICE),
            zscore(delta_volume, self.volume_mean, self.volume_var, MIN_STD_VOLUME),
        )
    }
}

fn update_moments(mean: &mut f64, var: &mut f64, x: f64) {
    let d = x - *mean;
    *mean += ALPHA * d;
    *var = (1.0 - ALPHA) * (*var + ALPHA * d * d);
}

/// Z against floored sigma, so quiet markets don't produce runaway scores.
pub fn zscore(x: f64, mean: f64, var: f64, min_std: f64) -> f64 {
    let sigma = var.max(0.0).sqrt().max(min_std);
    (x - mean) / sigma
}

/// `1 + max(0, z_vol - 1) * beta`: volume activity amplifies the price
/// score but can never shrink it.
pub fn volume_boost(volume_z: f64, beta: f64) -> f64 {
    1.0 + (volume_z - 1.0).max(0.0) * beta
}

pub fn adjusted_score(price_z: f64, volume_z: f64, beta: f64) -> f64 {
    price_z.abs() * volume_boost(volume_z, beta)
}

/// Minimum |Δ| required before a tick can trigger, keyed on the zone of the
/// previous price (the baseline side of the move). Collapses to the single
/// configured floor when adaptive thresholds are off.
pub fn min_price_change(prev_price: f64, cfg: &Config) -> f64 {
    if !cfg.use_adaptive_thresholds {
        return cfg.min_abs_price_change;
    }
    if prev_price < 0.01 || prev_price > 0.99 {
        cfg.deep_extreme_min_change
    } else if prev_price < 0.03 || prev_price > 0.97 {
        cfg.near_extreme_min_change
    } else {
        cfg.middle_min_change
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;

    fn tick(price: f64, delta: f64) -> Tick {
        Tick { market_id: 1, ts: 0, yes_price: price, volume: 0.0, delta_volume: delta }
    }

    #[test]
    fn update_is_deterministic_and_counts() {
        let inputs = [(0.50, 5.0), (0.52, 8.0), (0.48, 3.0), (0.55, 20.0)];
        let mut a = EwmaState::default();
        let mut b = EwmaState::default();
        for (p, v) in inputs {
            a.update(p, v);
            b.update(p, v);
        }
        assert_eq!(a, b);
        assert_eq!(a.tick_count, 4);
        assert_eq!(a.last_price, 0.55);
        assert!(a.price_var >= 0.0);
        assert!(a.volume_var >= 0.0);
    }

    #[test]
    fn first_observation_initializes_mean_with_zero_variance() {
        let mut state = EwmaState::default();
        state.update(0.42, 17.0);
        assert_eq!(state.price_mean, 0.42);
        assert_eq!(state.volume_mean, 17.0);
        assert_eq!(state.price_var, 0.0);
        assert_eq!(state.volume_var, 0.0);
        assert_eq!(state.tick_count, 1);
    }

    #[test]
    fn moments_track_the_classic_recurrence() {
        let mut state = EwmaState::default();
        state.update(0.50, 10.0);
        state.update(0.60, 10.0);

        let d = 0.60 - 0.50;
        let expected_mean = 0.50 + ALPHA * d;
        let expected_var = (1.0 - ALPHA) * (0.0 + ALPHA * d * d);
        assert!((state.price_mean - expected_mean).abs() < 1e-12);
        assert!((state.price_var - expected_var).abs() < 1e-12);
    }

    #[test]
    fn seeding_matches_equivalent_updates_but_keeps_last_price_unset() {
        let history: Vec<Tick> =
            (0..25).map(|i| tick(0.50 + (i % 3) as f64 * 0.001, 5.0)).collect();
        let seeded = EwmaState::seed(&history);

        let mut updated = EwmaState::default();
        for t in &history {
            updated.update(t.yes_price, t.delta_volume);
        }

        assert_eq!(seeded.tick_count, 25);
        assert!((seeded.price_mean - updated.price_mean).abs() < 1e-12);
        assert!((seeded.price_var - updated.price_var).abs() < 1e-12);
        assert!((seeded.volume_mean - updated.volume_mean).abs() < 1e-12);
        assert_eq!(seeded.last_price, 0.0);
        assert!(updated.last_price > 0.0);
    }

    #[test]
    fn seed_of_empty_history_is_the_zero_sentinel() {
        assert_eq!(EwmaState::seed(&[]), EwmaState::default());
    }

    #[test]
    fn zscore_applies_the_noise_floor() {
        // Tiny variance: the floor keeps the denominator at min_std.
        let z = zscore(0.70, 0.50, 1e-10, 0.005);
        assert!((z - 0.20 / 0.005).abs() < 1e-6);

        // Large variance: the real sigma wins.
        let z = zscore(1.0, 0.0, 4.0, 0.005);
        assert!((z - 0.5).abs() < 1e-12);
    }

    #[test]
    fn volume_boost_floors_at_one() {
        assert_eq!(volume_boost(-3.0, 0.25), 1.0);
        assert_eq!(volume_boost(1.0, 0.25), 1.0);
        assert!((volume_boost(5.0, 0.25) - 2.0).abs() < 1e-12);
        assert!((adjusted_score(-2.0, 5.0, 0.25) - 4.0).abs() < 1e-12);
    }

    #[test]
    fn gate_zones_follow_the_previous_price() {
        let cfg = test_config();
        assert_eq!(min_price_change(0.995, &cfg), 0.07);
        assert_eq!(min_price_change(0.005, &cfg), 0.07);
        assert_eq!(min_price_change(0.98, &cfg), 0.10);
        assert_eq!(min_price_change(0.02, &cfg), 0.10);
        assert_eq!(min_price_change(0.50, &cfg), 0.15);
        assert_eq!(min_price_change(0.03, &cfg), 0.15);
        assert_eq!(min_price_change(0.97, &cfg), 0.15);
    }

    #[test]
    fn gate_collapses_when_adaptive_thresholds_are_off() {
        let mut cfg = test_config();
        cfg.use_adaptive_thresholds = false;
        for p in [0.005, 0.02, 0.50, 0.98, 0.999] {
            assert_eq!(min_price_change(p, &cfg), cfg.min_abs_price_change);
        }
    }
}
