use std::env;
use std::fmt::Display;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// A set-but-blank variable counts as unset.
fn raw_env(key: &str) -> Option<String> {
    let val = env::var(key).ok()?;
    let val = val.trim();
    if val.is_empty() {
        None
    } else {
        Some(val.to_string())
    }
}

fn env_parsed<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    let Some(val) = raw_env(key) else {
        return Ok(default);
    };
    val.parse()
        .map_err(|e| anyhow!("{key}={val} does not parse: {e}"))
}

fn env_flag(key: &str, default: bool) -> bool {
    match raw_env(key) {
        None => default,
        Some(val) => ["1", "true", "yes", "y", "on"]
            .contains(&val.to_ascii_lowercase().as_str()),
    }
}

fn env_text(key: &str, default: &str) -> String {
    raw_env(key).unwrap_or_else(|| default.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Main loop
    pub dt_secs: f64,

    // Inventory
    pub max_position: i64,
    pub position_limit_buffer: f64,
    pub inventory_skew_factor: f64,

    // Quote management
    pub improve_once_per_touch: bool,
    pub improve_cooldown_secs: f64,
    pub min_quote_width_cents: i64,
    pub orderbook_update_cooldown_ms: u64,
    pub order_size: i64, // 0 = quote the market's full LIP target

    // Universe
    pub max_markets_with_orders: usize,
    pub discovery_interval_secs: u64,

    // LIP quoting and risk model
    pub lip_enabled: bool,
    pub lip_discount_factor: f64,
    pub lip_risk_threshold: f64,
    pub lip_risk_alpha: f64, // legacy continuous-bucket coefficient, unused
    pub lip_time_risk_k: f64,
    pub lip_vol_gamma: f64,
    pub lip_vol_refresh_secs: u64,
    pub lip_medium_risk_threshold: f64,
    pub lip_high_risk_threshold: f64,

    // Volatility engine
    pub vol_ewma_alpha: f64,
    pub vol_fetch_concurrency: usize,

    // Circuit breaker
    pub circuit_max_consecutive_errors: u32,
    pub circuit_pnl_threshold: f64,
    pub circuit_max_inventory_imbalance: f64,
    pub breaker_state_path: String,
    pub breaker_reset: bool,

    // Telemetry
    pub sqlite_path: String,
}

impl Settings {
    pub fn load() -> Result<Self> {
        let s = Self {
            dt_secs: env_parsed("DT_SECS", 1.0)?,
            max_position: env_parsed("MAX_POSITION", 100)?,
            position_limit_buffer: env_parsed("POSITION_LIMIT_BUFFER", 0.2)?,
            inventory_skew_factor: env_parsed("INVENTORY_SKEW_FACTOR", 0.01)?,
            improve_once_per_touch: env_flag("IMPROVE_ONCE_PER_TOUCH", true),
            improve_cooldown_secs: env_parsed("IMPROVE_COOLDOWN_SECS", 0.0)?,
            min_quote_width_cents: env_parsed("MIN_QUOTE_WIDTH_CENTS", 0)?,
            orderbook_update_cooldown_ms: env_parsed("ORDERBOOK_UPDATE_COOLDOWN_MS", 500)?,
            order_size: env_parsed("ORDER_SIZE", 0)?,
            max_markets_with_orders: env_parsed("MAX_MARKETS_WITH_ORDERS", 20)?,
            discovery_interval_secs: env_parsed("DISCOVERY_INTERVAL_SECS", 10)?,
            lip_enabled: env_flag("LIP_ENABLED", true),
            lip_discount_factor: env_parsed("LIP_DISCOUNT_FACTOR", 0.95)?,
            lip_risk_threshold: env_parsed("LIP_RISK_THRESHOLD", 3.0)?,
            lip_risk_alpha: env_parsed("LIP_RISK_ALPHA", 1.0)?,
            lip_time_risk_k: env_parsed("LIP_TIME_RISK_K", 0.15)?,
            lip_vol_gamma: env_parsed("LIP_VOL_GAMMA", 2.0)?,
            lip_vol_refresh_secs: env_parsed("LIP_VOL_REFRESH_SECS", 300)?,
            lip_medium_risk_threshold: env_parsed("LIP_MEDIUM_RISK_THRESHOLD", 1.5)?,
            lip_high_risk_threshold: env_parsed("LIP_HIGH_RISK_THRESHOLD", 2.5)?,
            vol_ewma_alpha: env_parsed("VOL_EWMA_ALPHA", 0.3)?,
            vol_fetch_concurrency: env_parsed("VOL_FETCH_CONCURRENCY", 8)?,
            circuit_max_consecutive_errors: env_parsed("CIRCUIT_MAX_CONSECUTIVE_ERRORS", 10)?,
            circuit_pnl_threshold: env_parsed("CIRCUIT_PNL_THRESHOLD", -100.0)?,
            circuit_max_inventory_imbalance: env_parsed("CIRCUIT_MAX_INVENTORY_IMBALANCE", 0.9)?,
            breaker_state_path: env_text("BREAKER_STATE_PATH", "./data/breaker_state.json"),
            breaker_reset: env_flag("BREAKER_RESET", false),
            sqlite_path: env_text("SQLITE_PATH", "./data/lipmaker.sqlite"),
        };

        s.validate()?;
        Ok(s)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.dt_secs.is_finite() || self.dt_secs <= 0.0 {
            return Err(anyhow!("DT_SECS must be > 0 (got {})", self.dt_secs));
        }
        if self.max_position < 1 {
            return Err(anyhow!("MAX_POSITION must be >= 1 (got {})", self.max_position));
        }
        if !(0.0..=1.0).contains(&self.position_limit_buffer) {
            return Err(anyhow!(
                "POSITION_LIMIT_BUFFER must be in [0,1] (got {})",
                self.position_limit_buffer
            ));
        }
        if self.order_size < 0 {
            return Err(anyhow!("ORDER_SIZE must be >= 0 (got {})", self.order_size));
        }
        if !(self.lip_discount_factor > 0.0 && self.lip_discount_factor <= 1.0) {
            return Err(anyhow!(
                "LIP_DISCOUNT_FACTOR must be in (0,1] (got {})",
                self.lip_discount_factor
            ));
        }
        if self.lip_medium_risk_threshold > self.lip_high_risk_threshold {
            return Err(anyhow!(
                "LIP_MEDIUM_RISK_THRESHOLD must be <= LIP_HIGH_RISK_THRESHOLD ({} > {})",
                self.lip_medium_risk_threshold,
                self.lip_high_risk_threshold
            ));
        }
        if !(self.vol_ewma_alpha > 0.0 && self.vol_ewma_alpha <= 1.0) {
            return Err(anyhow!(
                "VOL_EWMA_ALPHA must be in (0,1] (got {})",
                self.vol_ewma_alpha
            ));
        }
        if self.vol_fetch_concurrency < 1 {
            return Err(anyhow!(
                "VOL_FETCH_CONCURRENCY must be >= 1 (got {})",
                self.vol_fetch_concurrency
            ));
        }
        if self.max_markets_with_orders < 1 {
            return Err(anyhow!(
                "MAX_MARKETS_WITH_ORDERS must be >= 1 (got {})",
                self.max_markets_with_orders
            ));
        }
        if self.discovery_interval_secs < 1 {
            return Err(anyhow!(
                "DISCOVERY_INTERVAL_SECS must be >= 1 (got {})",
                self.discovery_interval_secs
            ));
        }
        if self.circuit_max_consecutive_errors < 1 {
            return Err(anyhow!(
                "CIRCUIT_MAX_CONSECUTIVE_ERRORS must be >= 1 (got {})",
                self.circuit_max_consecutive_errors
            ));
        }
        if !(0.0..=1.0).contains(&self.circuit_max_inventory_imbalance) {
            return Err(anyhow!(
                "CIRCUIT_MAX_INVENTORY_IMBALANCE must be in [0,1] (got {})",
                self.circuit_max_inventory_imbalance
            ));
        }
        if self.min_quote_width_cents < 0 {
            return Err(anyhow!(
                "MIN_QUOTE_WIDTH_CENTS must be >= 0 (got {})",
                self.min_quote_width_cents
            ));
        }
        if self.improve_cooldown_secs < 0.0 {
            return Err(anyhow!(
                "IMPROVE_COOLDOWN_SECS must be >= 0 (got {})",
                self.improve_cooldown_secs
            ));
        }
        Ok(())
    }

    /// Per-quote size for a market: the configured override, capped by the
    /// market's LIP target, or the full target when unset.
    pub fn quote_size(&self, lip_target: i64) -> i64 {
        if self.order_size > 0 {
            self.order_size.min(lip_target)
        } else {
            lip_target
        }
    }
}

#[cfg(test)]
pub(crate) fn test_settings() -> Settings {
    Settings {
        dt_secs: 1.0,
        max_position: 100,
        position_limit_buffer: 0.2,
        inventory_skew_factor: 0.01,
        improve_once_per_touch: true,
        improve_cooldown_secs: 0.0,
        min_quote_width_cents: 0,
        orderbook_update_cooldown_ms: 500,
        order_size: 0,
        max_markets_with_orders: 20,
        discovery_interval_secs: 10,
        lip_enabled: true,
        lip_discount_factor: 0.95,
        lip_risk_threshold: 3.0,
        lip_risk_alpha: 1.0,
        lip_time_risk_k: 0.15,
        lip_vol_gamma: 2.0,
        lip_vol_refresh_secs: 300,
        lip_medium_risk_threshold: 1.5,
        lip_high_risk_threshold: 2.5,
        vol_ewma_alpha: 0.3,
        vol_fetch_concurrency: 8,
        circuit_max_consecutive_errors: 10,
        circuit_pnl_threshold: -100.0,
        circuit_max_inventory_imbalance: 0.9,
        breaker_state_path: "/tmp/breaker.json".into(),
        breaker_reset: false,
        sqlite_path: ":memory:".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> Settings {
        test_settings()
    }

    #[test]
    fn defaults_validate() {
        defaults().validate().unwrap();
    }

    #[test]
    fn bucket_thresholds_must_be_ordered() {
        let mut s = defaults();
        s.lip_medium_risk_threshold = 2.6;
        assert!(s.validate().is_err());
    }

    #[test]
    fn quote_size_caps_at_lip_target() {
        let mut s = defaults();
        assert_eq!(s.quote_size(100), 100);
        s.order_size = 40;
        assert_eq!(s.quote_size(100), 40);
        s.order_size = 250;
        assert_eq!(s.quote_size(100), 100);
    }
}
