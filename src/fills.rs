use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::{mpsc, watch};

use crate::exchange::{ExchangeClient, FillEvent, OrderSide};
use crate::math::tick_to_price;
use crate::store::SqliteStore;

/// Net YES contracts with weighted-average entry. Positive is long YES;
/// realized P&L accrues when a fill reduces or flips the position.
#[derive(Debug, Clone, Default)]
pub struct Position {
    pub qty: i64,
    pub avg_price: f64,
    pub realized_pnl: f64,
}

impl Position {
    pub fn apply(&mut self, side: OrderSide, price: f64, size: i64) {
        let size_f = size as f64;
        match side {
            OrderSide::Buy => {
                if self.qty >= 0 {
                    let new_qty = self.qty + size;
                    self.avg_price = if new_qty != 0 {
                        (self.avg_price * self.qty as f64 + price * size_f) / new_qty as f64
                    } else {
                        0.0
                    };
                    self.qty = new_qty;
                } else {
                    // Reduce the short first; any excess flips long.
                    let short = -self.qty;
                    let close_qty = short.min(size);
                    self.realized_pnl += (self.avg_price - price) * close_qty as f64;
                    self.qty += close_qty;
                    let rem = size - close_qty;
                    if rem > 0 {
                        self.qty += rem;
                        self.avg_price = price;
                    }
                    if self.qty == 0 {
                        self.avg_price = 0.0;
                    }
                }
            }
            OrderSide::Sell => {
                if self.qty <= 0 {
                    let new_short = -self.qty + size;
                    self.avg_price = if new_short != 0 {
                        (self.avg_price * (-self.qty) as f64 + price * size_f) / new_short as f64
                    } else {
                        0.0
                    };
                    self.qty = -new_short;
                } else {
                    let close_qty = self.qty.min(size);
                    self.realized_pnl += (price - self.avg_price) * close_qty as f64;
                    self.qty -= close_qty;
                    let rem = size - close_qty;
                    if rem > 0 {
                        self.qty -= rem;
                        self.avg_price = price;
                    }
                    if self.qty == 0 {
                        self.avg_price = 0.0;
                    }
                }
            }
        }
    }
}

/// Shared per-market positions. The fill task writes, the scheduler reads;
/// each position has its own lock so (qty, realized) reads are atomic.
#[derive(Clone, Default)]
pub struct InventoryBook {
    inner: Arc<RwLock<HashMap<String, Arc<Mutex<Position>>>>>,
}

impl InventoryBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensure(&self, ticker: &str) -> Arc<Mutex<Position>> {
        if let Some(p) = self.inner.read().get(ticker) {
            return p.clone();
        }
        self.inner
            .write()
            .entry(ticker.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Position::default())))
            .clone()
    }

    /// (qty, realized) read under one lock acquisition.
    pub fn position(&self, ticker: &str) -> (i64, f64) {
        match self.inner.read().get(ticker) {
            Some(p) => {
                let p = p.lock();
                (p.qty, p.realized_pnl)
            }
            None => (0, 0.0),
        }
    }

    pub fn snapshot(&self, ticker: &str) -> Option<Position> {
        self.inner.read().get(ticker).map(|p| p.lock().clone())
    }

    /// Drop the entry, returning its realized P&L for the closed-out ledger.
    pub fn remove(&self, ticker: &str) -> f64 {
        self.inner
            .write()
            .remove(ticker)
            .map(|p| p.lock().realized_pnl)
            .unwrap_or(0.0)
    }

    pub fn total_realized(&self) -> f64 {
        self.inner
            .read()
            .values()
            .map(|p| p.lock().realized_pnl)
            .sum()
    }
}

/// At-least-once stream guard: a fill replay carries the same per-order
/// index and must not move inventory twice.
#[derive(Default)]
pub struct FillTracker {
    last_index: HashMap<String, u64>,
}

impl FillTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one stream event; false means it was a duplicate.
    pub fn apply(&mut self, inventory: &InventoryBook, ev: &FillEvent) -> bool {
        if let Some(&last) = self.last_index.get(&ev.order_id) {
            if ev.fill_index <= last {
                return false;
            }
        }
        self.last_index.insert(ev.order_id.clone(), ev.fill_index);
        let pos = inventory.ensure(&ev.ticker);
        pos.lock().apply(ev.side, tick_to_price(ev.price), ev.size);
        true
    }
}

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

pub(crate) fn backoff_step(current: Duration) -> (Duration, Duration) {
    let jitter = Duration::from_millis(rand::rng().random_range(0..250));
    (current + jitter, (current * 2).min(RECONNECT_MAX))
}

/// Long-lived fill subscriber: dedup, apply to inventory, persist, and hand
/// the event to the scheduler so it can walk live-order remainders.
pub async fn run_fill_stream(
    client: Arc<dyn ExchangeClient>,
    inventory: InventoryBook,
    store: SqliteStore,
    mut tracked_rx: watch::Receiver<Vec<String>>,
    applied_tx: mpsc::Sender<FillEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut tracker = FillTracker::new();
    let mut backoff = RECONNECT_BASE;
    loop {
        if *shutdown_rx.borrow() {
            return;
        }
        let tickers = tracked_rx.borrow_and_update().clone();
        if tickers.is_empty() {
            tokio::select! {
                _ = tracked_rx.changed() => continue,
                _ = shutdown_rx.changed() => return,
            }
        }

        let mut rx = match client.subscribe_fills(&tickers).await {
            Ok(rx) => {
                backoff = RECONNECT_BASE;
                rx
            }
            Err(e) => {
                let (sleep_for, next) = backoff_step(backoff);
                log::warn!(
                    "fills.subscribe_failed err={e} retry_ms={}",
                    sleep_for.as_millis()
                );
                backoff = next;
                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {}
                    _ = shutdown_rx.changed() => return,
                }
                continue;
            }
        };

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => return,
                _ = tracked_rx.changed() => break,
                ev = rx.recv() => {
                    let Some(ev) = ev else {
                        let (sleep_for, next) = backoff_step(backoff);
                        log::warn!("fills.stream_closed retry_ms={}", sleep_for.as_millis());
                        backoff = next;
                        tokio::select! {
                            _ = tokio::time::sleep(sleep_for) => {}
                            _ = shutdown_rx.changed() => return,
                        }
                        break;
                    };
                    if !tracker.apply(&inventory, &ev) {
                        log::debug!(
                            "fills.duplicate ticker={} order_id={} fill_index={}",
                            ev.ticker, ev.order_id, ev.fill_index
                        );
                        continue;
                    }
                    let (qty, realized) = inventory.position(&ev.ticker);
                    log::info!(
                        "fills.applied ticker={} side={} price={} size={} inventory={} realized={:.2}",
                        ev.ticker, ev.side.as_str(), ev.price, ev.size, qty, realized
                    );
                    store
                        .insert_fill(&ev.ticker, &ev.order_id, ev.side.as_str(), ev.price, ev.size, ev.ts, ev.fill_index)
                        .ok();
                    if applied_tx.send(ev).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
