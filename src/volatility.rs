use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::Settings;
use crate::exchange::{with_rate_limit_retry, Candle, ExchangeClient};
use crate::math::{ewma, logit};

pub const CANDLE_PERIOD_SECS: u64 = 300;
pub const LOOKBACK_SECS: f64 = 48.0 * 3600.0;

/// Below this many valid logit returns the estimate is meaningless; the
/// ticker gets the sentinel sigma and stays out of the ranking.
pub const MIN_RETURNS: usize = 8;

/// One immutable refresh result. Swapped in whole; never mutated in place.
#[derive(Debug, Default)]
pub struct VolSnapshot {
    pub sigma: HashMap<String, f64>,
    pub percentile: HashMap<String, f64>,
    pub refreshed_ts: f64,
}

impl VolSnapshot {
    /// Percentile if the ticker was ranked, else scaled raw sigma, else zero.
    pub fn vol_score(&self, ticker: &str) -> f64 {
        self.percentile
            .get(ticker)
            .copied()
            .or_else(|| self.sigma.get(ticker).map(|s| (s / 0.5).min(1.0)))
            .unwrap_or(0.0)
    }
}

#[derive(Clone, Default)]
pub struct VolCache {
    slot: Arc<RwLock<Arc<VolSnapshot>>>,
}

impl VolCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// One atomic reference read; callers hold the snapshot for the whole
    /// computation so a concurrent swap cannot tear it.
    pub fn load(&self) -> Arc<VolSnapshot> {
        self.slot.read().clone()
    }

    fn store(&self, snap: Arc<VolSnapshot>) {
        *self.slot.write() = snap;
    }
}

/// EWMA of absolute 1-step logit returns over 5-minute closes. Samples at
/// the price extremes have no finite logit and are dropped before diffing.
pub fn sigma_from_candles(candles: &[Candle], alpha: f64) -> f64 {
    let ells: Vec<f64> = candles
        .iter()
        .map(|c| c.close)
        .filter(|&p| p > 0.01 && p < 0.99)
        .map(logit)
        .collect();
    if ells.len() < MIN_RETURNS + 1 {
        return 0.0;
    }
    let mut acc: Option<f64> = None;
    for w in ells.windows(2) {
        acc = Some(ewma(acc, (w[1] - w[0]).abs(), alpha));
    }
    acc.unwrap_or(0.0)
}

/// First-occurrence rank percentiles over the positive sigmas. A single
/// ranked ticker sits at 0 by convention.
pub fn percentile_ranks(sigmas: &[(String, f64)]) -> HashMap<String, f64> {
    let ranked: Vec<&(String, f64)> = sigmas.iter().filter(|(_, s)| *s > 0.0).collect();
    let mut sorted: Vec<f64> = ranked.iter().map(|(_, s)| *s).collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let n = sorted.len();
    let mut out = HashMap::with_capacity(n);
    if n == 0 {
        return out;
    }
    for (ticker, sigma) in ranked {
        let pct = if n == 1 {
            0.0
        } else {
            let rank = sorted
                .iter()
                .position(|v| v == sigma)
                .unwrap_or(0);
            rank as f64 / (n - 1) as f64
        };
        out.insert(ticker.clone(), pct);
    }
    out
}

pub struct VolEngine {
    settings: Settings,
    client: Arc<dyn ExchangeClient>,
    cache: VolCache,
    in_flight: AtomicBool,
}

impl VolEngine {
    pub fn new(settings: Settings, client: Arc<dyn ExchangeClient>, cache: VolCache) -> Self {
        Self {
            settings,
            client,
            cache,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn cache(&self) -> VolCache {
        self.cache.clone()
    }

    /// Recompute sigma for every tracked ticker on a bounded worker pool and
    /// swap the cache in one motion. Returns false when gated by the refresh
    /// interval or an in-flight run. Individual fetch failures only exclude
    /// that ticker from the new distribution.
    pub async fn refresh(&self, tickers: &[String], now: f64) -> bool {
        let last = self.cache.load().refreshed_ts;
        if now - last < self.settings.lip_vol_refresh_secs as f64 {
            return false;
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let sem = Arc::new(Semaphore::new(self.settings.vol_fetch_concurrency));
        let alpha = self.settings.vol_ewma_alpha;
        let mut set: JoinSet<Option<(String, f64)>> = JoinSet::new();
        for ticker in tickers {
            let sem = sem.clone();
            let client = self.client.clone();
            let ticker = ticker.clone();
            set.spawn(async move {
                let _permit = sem.acquire_owned().await.ok()?;
                let start = now - LOOKBACK_SECS;
                let fetched = with_rate_limit_retry("get_candles", || {
                    client.get_candles(&ticker, start, now, CANDLE_PERIOD_SECS)
                })
                .await;
                match fetched {
                    Ok(candles) => Some((ticker, sigma_from_candles(&candles, alpha))),
                    Err(e) => {
                        log::warn!("vol.fetch_failed ticker={ticker} err={e}");
                        None
                    }
                }
            });
        }

        let mut sigmas: Vec<(String, f64)> = Vec::with_capacity(tickers.len());
        while let Some(res) = set.join_next().await {
            if let Ok(Some(entry)) = res {
                sigmas.push(entry);
            }
        }

        let percentile = percentile_ranks(&sigmas);
        let snap = VolSnapshot {
            sigma: sigmas.iter().cloned().collect(),
            percentile,
            refreshed_ts: now,
        };
        log_distribution(&sigmas, tickers.len());
        self.cache.store(Arc::new(snap));
        self.in_flight.store(false, Ordering::SeqCst);
        true
    }
}

fn log_distribution(sigmas: &[(String, f64)], requested: usize) {
    let mut ranked: Vec<(String, f64)> = sigmas
        .iter()
        .filter(|(_, s)| *s > 0.0)
        .cloned()
        .collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    if ranked.is_empty() {
        log::info!("vol.refresh requested={requested} ranked=0");
        return;
    }
    let max = ranked.first().map(|x| x.1).unwrap_or(0.0);
    let min = ranked.last().map(|x| x.1).unwrap_or(0.0);
    let median = ranked[ranked.len() / 2].1;
    let top: Vec<String> = ranked
        .iter()
        .take(5)
        .map(|(t, s)| format!("{t}={s:.4}"))
        .collect();
    log::info!(
        "vol.refresh requested={requested} ranked={} min={min:.4} median={median:.4} max={max:.4} top=[{}]",
        ranked.len(),
        top.join(" ")
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: f64) -> Candle {
        Candle {
            open: close,
            high: close,
            low: close,
            close,
            ts: 0.0,
        }
    }

    #[test]
    fn sigma_needs_eight_returns() {
        let closes: Vec<Candle> = (0..8).map(|i| candle(0.40 + 0.01 * i as f64)).collect();
        assert_eq!(sigma_from_candles(&closes, 0.3), 0.0);
        let closes: Vec<Candle> = (0..9).map(|i| candle(0.40 + 0.01 * i as f64)).collect();
        assert!(sigma_from_candles(&closes, 0.3) > 0.0);
    }

    #[test]
    fn sigma_drops_extreme_samples() {
        let mut closes: Vec<Candle> = (0..9).map(|i| candle(0.40 + 0.01 * i as f64)).collect();
        closes.insert(4, candle(0.99));
        closes.insert(5, candle(0.01));
        let with_edges = sigma_from_candles(&closes, 0.3);
        let without: Vec<Candle> = closes
            .iter()
            .filter(|c| c.close > 0.01 && c.close < 0.99)
            .cloned()
            .collect();
        assert_eq!(with_edges, sigma_from_candles(&without, 0.3));
    }

    #[test]
    fn flat_series_yields_sentinel_free_zero() {
        let closes: Vec<Candle> = (0..20).map(|_| candle(0.50)).collect();
        assert_eq!(sigma_from_candles(&closes, 0.3), 0.0);
    }

    #[test]
    fn percentile_endpoints_and_monotonicity() {
        let sigmas = vec![
            ("a".to_string(), 0.10),
            ("b".to_string(), 0.30),
            ("c".to_string(), 0.20),
            ("d".to_string(), 0.40),
        ];
        let pct = percentile_ranks(&sigmas);
        assert_eq!(pct["a"], 0.0);
        assert_eq!(pct["d"], 1.0);
        assert!(pct["c"] < pct["b"]);
        let mut by_sigma = sigmas.clone();
        by_sigma.sort_by(|x, y| x.1.partial_cmp(&y.1).unwrap());
        let ordered: Vec<f64> = by_sigma.iter().map(|(t, _)| pct[t]).collect();
        assert!(ordered.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn percentile_ties_take_first_occurrence() {
        let sigmas = vec![
            ("a".to_string(), 0.20),
            ("b".to_string(), 0.20),
            ("c".to_string(), 0.50),
        ];
        let pct = percentile_ranks(&sigmas);
        assert_eq!(pct["a"], 0.0);
        assert_eq!(pct["b"], 0.0);
        assert_eq!(pct["c"], 1.0);
    }

    #[test]
    fn single_and_sentinel_tickers() {
        let sigmas = vec![("a".to_string(), 0.20), ("z".to_string(), 0.0)];
        let pct = percentile_ranks(&sigmas);
        assert_eq!(pct["a"], 0.0);
        assert!(!pct.contains_key("z"));
    }

    #[test]
    fn vol_score_fallback_chain() {
        let mut snap = VolSnapshot::default();
        snap.sigma.insert("raw".into(), 0.2);
        snap.sigma.insert("ranked".into(), 0.4);
        snap.percentile.insert("ranked".into(), 0.75);
        assert_eq!(snap.vol_score("ranked"), 0.75);
        assert!((snap.vol_score("raw") - 0.4).abs() < 1e-12);
        assert_eq!(snap.vol_score("unknown"), 0.0);
        snap.sigma.insert("wild".into(), 3.0);
        assert_eq!(snap.vol_score("wild"), 1.0);
    }
}
