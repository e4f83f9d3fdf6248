use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::math::now_ts;

/// Persisted on every state change so an operator can see why trading
/// stopped after the process exits.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BreakerState {
    pub is_open: bool,
    pub trip_reason: Option<String>,
    pub trip_ts: Option<f64>,
}

/// Latching safety gate. Once open, only cancellations may reach the
/// exchange until an operator resets it out of band.
pub struct CircuitBreaker {
    open: AtomicBool,
    reason: Mutex<Option<String>>,
    consecutive_errors: AtomicU32,
    max_consecutive_errors: u32,
    state_path: String,
}

impl CircuitBreaker {
    /// Build from config, honoring a previously persisted open state unless
    /// the operator asked for a reset.
    pub fn load(settings: &Settings) -> Result<Self> {
        let breaker = Self {
            open: AtomicBool::new(false),
            reason: Mutex::new(None),
            consecutive_errors: AtomicU32::new(0),
            max_consecutive_errors: settings.circuit_max_consecutive_errors,
            state_path: settings.breaker_state_path.clone(),
        };

        let path = Path::new(&breaker.state_path);
        if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("read breaker state {}", breaker.state_path))?;
            let prev: BreakerState = serde_json::from_str(&raw)
                .with_context(|| format!("parse breaker state {}", breaker.state_path))?;
            if prev.is_open {
                if settings.breaker_reset {
                    log::warn!(
                        "breaker.reset previous_reason={:?}",
                        prev.trip_reason.as_deref().unwrap_or("unknown")
                    );
                    breaker.persist()?;
                } else {
                    breaker.open.store(true, Ordering::SeqCst);
                    *breaker.reason.lock() = prev.trip_reason.clone();
                    log::error!(
                        "breaker.still_open reason={} trip_ts={}",
                        prev.trip_reason.as_deref().unwrap_or("unknown"),
                        prev.trip_ts.unwrap_or(0.0)
                    );
                }
            }
        }
        Ok(breaker)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Latch open. The first trip wins; later calls are no-ops.
    pub fn trip(&self, reason: &str) {
        if self
            .open
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        *self.reason.lock() = Some(reason.to_string());
        log::error!("breaker.tripped reason={reason}");
        if let Err(e) = self.persist() {
            log::error!("breaker.persist_failed err={e}");
        }
    }

    /// One failed REST call. Trips once the consecutive run hits the limit.
    pub fn record_api_error(&self, what: &str) {
        let n = self.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
        log::warn!("breaker.api_error op={what} consecutive={n}");
        if n >= self.max_consecutive_errors {
            self.trip(&format!("consecutive_api_errors={n}"));
        }
    }

    pub fn record_api_success(&self) {
        self.consecutive_errors.store(0, Ordering::SeqCst);
    }

    pub fn check_pnl(&self, realized: f64, threshold: f64) {
        if realized < threshold {
            self.trip(&format!("pnl={realized:.2} below threshold={threshold:.2}"));
        }
    }

    pub fn check_imbalance(&self, net_inventory: i64, max_position: i64, threshold: f64) {
        let ratio = net_inventory.unsigned_abs() as f64 / max_position as f64;
        if ratio > threshold {
            self.trip(&format!(
                "inventory_imbalance={ratio:.2} net={net_inventory} threshold={threshold:.2}"
            ));
        }
    }

    fn persist(&self) -> Result<()> {
        let state = BreakerState {
            is_open: self.is_open(),
            trip_reason: self.reason(),
            trip_ts: if self.is_open() { Some(now_ts()) } else { None },
        };
        if let Some(parent) = Path::new(&self.state_path).parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create breaker state dir for {}", self.state_path))?;
        }
        let raw = serde_json::to_string_pretty(&state)?;
        std::fs::write(&self.state_path, raw)
            .with_context(|| format!("write breaker state {}", self.state_path))?;
        Ok(())
    }
}
