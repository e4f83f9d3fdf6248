use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::config::Settings;
use crate::exchange::{with_rate_limit_retry, ExchangeClient, MarketInfo};
use crate::math::now_ts;
use crate::risk::RiskScorer;
use crate::settlement::{EDGE_HIGH, EDGE_LOW};
use crate::volatility::VolCache;

/// Thread-safe bounded candidate queue between the discovery worker and the
/// scheduler. Overflow drops the oldest candidate; the next scan will see it
/// again if it is still eligible.
#[derive(Clone)]
pub struct CandidateQueue {
    inner: Arc<Mutex<VecDeque<MarketInfo>>>,
    cap: usize,
}

impl CandidateQueue {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
            cap,
        }
    }

    pub fn push(&self, market: MarketInfo) {
        let mut q = self.inner.lock();
        if q.iter().any(|m| m.ticker == market.ticker) {
            return;
        }
        if q.len() >= self.cap {
            if let Some(dropped) = q.pop_front() {
                log::warn!("discovery.queue_overflow dropped={}", dropped.ticker);
            }
        }
        q.push_back(market);
    }

    pub fn drain(&self, max: usize) -> Vec<MarketInfo> {
        let mut q = self.inner.lock();
        let n = max.min(q.len());
        q.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn at_extreme(price: f64) -> bool {
    price >= EDGE_HIGH || price <= EDGE_LOW
}

/// One pass over the universe: keep open, untracked, mid-range, non-toxic
/// markets, and when LIP risk gating is on, only those whose current risk
/// clears the threshold (the cache may be stale; that is accepted).
pub fn filter_universe(
    universe: Vec<MarketInfo>,
    tracked: &HashSet<String>,
    settings: &Settings,
    scorer: &RiskScorer,
    vol: &crate::volatility::VolSnapshot,
    now: f64,
) -> Vec<MarketInfo> {
    let mut eligible = Vec::new();
    for m in universe {
        if tracked.contains(&m.ticker) {
            continue;
        }
        if m.toxic {
            continue;
        }
        if m.close_ts <= now {
            continue;
        }
        if m.last_price.is_some_and(at_extreme) {
            continue;
        }
        if settings.lip_enabled {
            let score = scorer.score(&m.ticker, m.close_ts, now, vol);
            if score > settings.lip_risk_threshold {
                log::debug!(
                    "discovery.risk_skip ticker={} score={score:.3}",
                    m.ticker
                );
                continue;
            }
        }
        eligible.push(m);
    }
    eligible
}

pub async fn run_discovery(
    client: Arc<dyn ExchangeClient>,
    settings: Settings,
    queue: CandidateQueue,
    tracked_rx: watch::Receiver<Vec<String>>,
    vol_cache: VolCache,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let scorer = RiskScorer::new(settings.clone());
    let mut tick = tokio::time::interval(Duration::from_secs(settings.discovery_interval_secs));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown_rx.changed() => return,
        }
        if *shutdown_rx.borrow() {
            return;
        }

        let universe = match with_rate_limit_retry("get_valid_markets", || {
            client.get_valid_markets()
        })
        .await
        {
            Ok(u) => u,
            Err(e) => {
                log::warn!("discovery.scan_failed err={e}");
                continue;
            }
        };

        let now = now_ts();
        let tracked: HashSet<String> = tracked_rx.borrow().iter().cloned().collect();
        let vol = vol_cache.load();
        let total = universe.len();
        let eligible = filter_universe(universe, &tracked, &settings, &scorer, &vol, now);
        let n = eligible.len();
        for m in eligible {
            queue.push(m);
        }
        log::info!(
            "discovery.scan universe={total} eligible={n} queued={} tracked={}",
            queue.len(),
            tracked.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_settings;
    use crate::volatility::VolSnapshot;

    fn market(ticker: &str, close_in_secs: f64, last_price: Option<f64>, toxic: bool) -> MarketInfo {
        MarketInfo {
            ticker: ticker.into(),
            close_ts: 1_700_000_000.0 + close_in_secs,
            lip_target: 100,
            last_price,
            toxic,
        }
    }

    #[test]
    fn filter_drops_tracked_toxic_expired_and_extreme() {
        let now = 1_700_000_000.0;
        let settings = test_settings();
        let scorer = RiskScorer::new(settings.clone());
        let tracked: HashSet<String> = ["HELD".to_string()].into();
        let universe = vec![
            market("HELD", 86_400.0, Some(0.5), false),
            market("TOX", 86_400.0, Some(0.5), true),
            market("GONE", -10.0, Some(0.5), false),
            market("HI", 86_400.0, Some(0.99), false),
            market("LO", 86_400.0, Some(0.01), false),
            market("OK", 86_400.0, Some(0.5), false),
            market("NOPX", 86_400.0, None, false),
        ];
        let out = filter_universe(
            universe,
            &tracked,
            &settings,
            &scorer,
            &VolSnapshot::default(),
            now,
        );
        let names: Vec<&str> = out.iter().map(|m| m.ticker.as_str()).collect();
        assert_eq!(names, vec!["OK", "NOPX"]);
    }

    #[test]
    fn risk_gate_uses_the_current_cache() {
        let now = 1_700_000_000.0;
        let settings = test_settings();
        let scorer = RiskScorer::new(settings.clone());
        let mut vol = VolSnapshot::default();
        vol.percentile.insert("NEAR".into(), 1.0);

        // One minute out at top vol percentile: ~2.99, still admitted at 3.0.
        let universe = vec![market("NEAR", 60.0, Some(0.5), false)];
        let out = filter_universe(
            universe,
            &HashSet::new(),
            &settings,
            &scorer,
            &vol,
            now,
        );
        assert_eq!(out.len(), 1);

        // A tighter threshold rejects the same market.
        let mut tight = settings.clone();
        tight.lip_risk_threshold = 2.5;
        let universe = vec![market("NEAR", 60.0, Some(0.5), false)];
        let out = filter_universe(universe, &HashSet::new(), &tight, &scorer, &vol, now);
        assert!(out.is_empty());
    }

    #[test]
    fn queue_dedupes_and_drops_oldest_on_overflow() {
        let q = CandidateQueue::new(2);
        q.push(market("A", 10.0, None, false));
        q.push(market("A", 10.0, None, false));
        assert_eq!(q.len(), 1);
        q.push(market("B", 10.0, None, false));
        q.push(market("C", 10.0, None, false));
        let drained = q.drain(10);
        let names: Vec<&str> = drained.iter().map(|m| m.ticker.as_str()).collect();
        assert_eq!(names, vec!["B", "C"]);
    }

    #[test]
    fn drain_respects_the_cap() {
        let q = CandidateQueue::new(8);
        for t in ["A", "B", "C"] {
            q.push(market(t, 10.0, None, false));
        }
        assert_eq!(q.drain(2).len(), 2);
        assert_eq!(q.len(), 1);
    }
}
