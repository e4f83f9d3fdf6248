use crate::config::Settings;
use crate::volatility::VolSnapshot;

pub struct RiskScorer {
    settings: Settings,
}

impl RiskScorer {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Scalar risk for one market: time decay toward expiry amplified by the
    /// market's cross-sectional volatility standing. The caller passes one
    /// cache snapshot per tick so a mid-tick refresh cannot mix vintages.
    pub fn score(&self, ticker: &str, close_ts: f64, now: f64, vol: &VolSnapshot) -> f64 {
        let hours_to_expiry = ((close_ts - now) / 3600.0).max(0.0);
        let time_risk = (-self.settings.lip_time_risk_k * hours_to_expiry).exp();
        let vol_score = vol.vol_score(ticker);
        time_risk * (1.0 + self.settings.lip_vol_gamma * vol_score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_settings;

    #[test]
    fn day_out_market_with_no_vol_is_low_risk() {
        let scorer = RiskScorer::new(test_settings());
        let now = 1_700_000_000.0;
        let score = scorer.score("M1", now + 24.0 * 3600.0, now, &VolSnapshot::default());
        assert!((score - (-0.15f64 * 24.0).exp()).abs() < 1e-9);
        assert!(score < 0.03);
    }

    #[test]
    fn near_expiry_high_vol_approaches_but_stays_under_default_threshold() {
        let s = test_settings();
        let scorer = RiskScorer::new(s.clone());
        let now = 1_700_000_000.0;
        let mut vol = VolSnapshot::default();
        vol.percentile.insert("M3".into(), 1.0);

        // 5 minutes out at the top percentile.
        let five_min = scorer.score("M3", now + 300.0, now, &vol);
        assert!((five_min - (-0.15f64 * (300.0 / 3600.0)).exp() * 3.0).abs() < 1e-9);
        assert!(five_min < s.lip_risk_threshold);

        // 1 minute out: closer still, and over a tighter threshold.
        let one_min = scorer.score("M3", now + 60.0, now, &vol);
        assert!(one_min > five_min);
        assert!(one_min < 3.0);
        assert!(one_min > 2.5);
    }

    #[test]
    fn expired_market_clamps_hours_at_zero() {
        let scorer = RiskScorer::new(test_settings());
        let now = 1_700_000_000.0;
        let score = scorer.score("M", now - 100.0, now, &VolSnapshot::default());
        assert_eq!(score, 1.0);
    }
}
