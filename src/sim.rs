use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use rand_distr::{Distribution, Poisson};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::book::BookSide;
use crate::exchange::{
    BookEvent, BookLevels, Candle, ExchangeClient, ExchangeError, FillEvent, MarketInfo,
    OrderSide, Tif,
};
use crate::math::{now_ts, Cents};

const DRIVER_STEP: Duration = Duration::from_millis(250);
const FAULT_RATE: f64 = 0.02;
const FILL_LAMBDA_PER_SEC: f64 = 0.5;

fn poisson_sample(rng: &mut SmallRng, lambda: f64) -> u64 {
    if lambda <= 0.0 {
        return 0;
    }
    match Poisson::new(lambda) {
        Ok(d) => d.sample(rng) as u64,
        Err(_) => 0,
    }
}

struct SimMarket {
    info: MarketInfo,
    mid: Cents,
    seq: u64,
}

impl SimMarket {
    fn yes_bids(&self, rng: &mut SmallRng) -> Vec<(Cents, i64)> {
        let mut out = Vec::with_capacity(3);
        for i in 1..=3 {
            let p = self.mid - i;
            if p >= 1 {
                out.push((p, rng.random_range(50..400)));
            }
        }
        out
    }

    // NO bid at 100 - (mid + i) keeps the YES ask i ticks above mid.
    fn no_bids(&self, rng: &mut SmallRng) -> Vec<(Cents, i64)> {
        let mut out = Vec::with_capacity(3);
        for i in 1..=3 {
            let p = 100 - (self.mid + i);
            if (1..=99).contains(&p) {
                out.push((p, rng.random_range(50..400)));
            }
        }
        out
    }
}

struct SimOrder {
    ticker: String,
    side: OrderSide,
    price: Cents,
    remaining: i64,
    fill_index: u64,
}

struct SimState {
    rng: SmallRng,
    markets: HashMap<String, SimMarket>,
    orders: HashMap<String, SimOrder>,
    book_subs: Vec<(Vec<String>, mpsc::Sender<BookEvent>)>,
    fill_subs: Vec<mpsc::Sender<FillEvent>>,
}

/// Self-contained paper venue: synthetic random-walk books, Poisson maker
/// fills for resting orders, and the occasional injected order fault. Lets
/// the whole agent run end-to-end without a live exchange.
pub struct PaperExchange {
    state: Mutex<SimState>,
}

impl PaperExchange {
    pub fn new(n_markets: usize) -> Self {
        let mut rng = SmallRng::seed_from_u64(rand::random());
        let now = now_ts();
        let mut markets = HashMap::new();
        for i in 1..=n_markets {
            let ticker = format!("SIM-{i:03}");
            let mid: Cents = rng.random_range(15..=85);
            let close_ts = now + rng.random_range(3_600.0..48.0 * 3_600.0);
            let lip_target = *[50i64, 100, 200]
                .get(rng.random_range(0..3))
                .unwrap_or(&100);
            markets.insert(
                ticker.clone(),
                SimMarket {
                    info: MarketInfo {
                        ticker,
                        close_ts,
                        lip_target,
                        last_price: Some(mid as f64 / 100.0),
                        toxic: rng.random_bool(0.05),
                    },
                    mid,
                    seq: 0,
                },
            );
        }
        Self {
            state: Mutex::new(SimState {
                rng,
                markets,
                orders: HashMap::new(),
                book_subs: Vec::new(),
                fill_subs: Vec::new(),
            }),
        }
    }

    fn emit_fill(state: &mut SimState, order_id: &str, ev_size: i64) {
        let Some(o) = state.orders.get_mut(order_id) else {
            return;
        };
        o.fill_index += 1;
        let ev = FillEvent {
            ticker: o.ticker.clone(),
            order_id: order_id.to_string(),
            side: o.side,
            price: o.price,
            size: ev_size,
            ts: now_ts(),
            fill_index: o.fill_index,
        };
        o.remaining -= ev_size;
        let drained = o.remaining <= 0;
        if drained {
            state.orders.remove(order_id);
        }
        state.fill_subs.retain(|tx| {
            match tx.try_send(ev.clone()) {
                Ok(()) => true,
                // A full queue is the subscriber's problem; only drop the
                // channel once the far side is gone.
                Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }

    /// One driver step: walk every mid, publish fresh snapshots, and let
    /// Poisson arrivals chew on resting orders near the touch.
    fn step(&self) {
        let mut state = self.state.lock();
        let state = &mut *state;

        let tickers: Vec<String> = state.markets.keys().cloned().collect();
        for ticker in &tickers {
            let Some(m) = state.markets.get_mut(ticker) else {
                continue;
            };
            if state.rng.random_bool(0.3) {
                let delta: Cents = if state.rng.random_bool(0.5) { 1 } else { -1 };
                m.mid = (m.mid + delta).clamp(5, 95);
                m.info.last_price = Some(m.mid as f64 / 100.0);
            }
            let yes = m.yes_bids(&mut state.rng);
            let no = m.no_bids(&mut state.rng);
            m.seq += 1;
            let seq_yes = m.seq;
            m.seq += 1;
            let seq_no = m.seq;

            for (tickers_filter, tx) in &state.book_subs {
                if !tickers_filter.contains(ticker) {
                    continue;
                }
                let _ = tx.try_send(BookEvent::Snapshot {
                    ticker: ticker.clone(),
                    side: BookSide::Yes,
                    levels: yes.clone(),
                    seq: seq_yes,
                });
                let _ = tx.try_send(BookEvent::Snapshot {
                    ticker: ticker.clone(),
                    side: BookSide::No,
                    levels: no.clone(),
                    seq: seq_no,
                });
            }
        }

        // Passive fills: intensity decays with distance from the touch.
        let dt = DRIVER_STEP.as_secs_f64();
        let order_ids: Vec<String> = state.orders.keys().cloned().collect();
        for oid in order_ids {
            let Some(o) = state.orders.get(&oid) else {
                continue;
            };
            let Some(m) = state.markets.get(&o.ticker) else {
                continue;
            };
            let best_bid = m.mid - 1;
            let best_ask = m.mid + 1;
            let distance = match o.side {
                OrderSide::Buy => (best_bid - o.price).max(0),
                OrderSide::Sell => (o.price - best_ask).max(0),
            };
            let lambda = FILL_LAMBDA_PER_SEC * (-0.7 * distance as f64).exp() * dt;
            let remaining = o.remaining;
            let n = poisson_sample(&mut state.rng, lambda);
            if n == 0 {
                continue;
            }
            let frac = state.rng.random_range(0.3..=1.0);
            let size = ((remaining as f64 * frac) as i64).clamp(1, remaining);
            Self::emit_fill(state, &oid, size);
        }

        state.book_subs.retain(|(_, tx)| !tx.is_closed());
        state.fill_subs.retain(|tx| !tx.is_closed());
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn place_order(
        &self,
        ticker: &str,
        side: OrderSide,
        price: Cents,
        size: i64,
        tif: Tif,
    ) -> Result<String, ExchangeError> {
        let mut state = self.state.lock();
        let state = &mut *state;
        if !state.markets.contains_key(ticker) {
            return Err(ExchangeError::OrderRejected {
                reason: "unknown ticker".into(),
            });
        }
        if state.rng.random_bool(FAULT_RATE) {
            return Err(ExchangeError::OrderRejected {
                reason: "paper_fault".into(),
            });
        }
        let order_id = Uuid::new_v4().to_string();
        state.orders.insert(
            order_id.clone(),
            SimOrder {
                ticker: ticker.to_string(),
                side,
                price,
                remaining: size,
                fill_index: 0,
            },
        );
        if tif == Tif::Ioc {
            // Immediate execution at the stated price, then gone.
            Self::emit_fill(state, &order_id, size);
        }
        Ok(order_id)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError> {
        let mut state = self.state.lock();
        match state.orders.remove(order_id) {
            Some(_) => Ok(()),
            None => Err(ExchangeError::NotFound),
        }
    }

    async fn get_orderbook(&self, ticker: &str) -> Result<BookLevels, ExchangeError> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let Some(m) = state.markets.get(ticker) else {
            return Err(ExchangeError::NotFound);
        };
        let yes_bids = m.yes_bids(&mut state.rng);
        let no_bids = m.no_bids(&mut state.rng);
        Ok(BookLevels { yes_bids, no_bids })
    }

    async fn get_candles(
        &self,
        ticker: &str,
        start_ts: f64,
        end_ts: f64,
        period_secs: u64,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let Some(m) = state.markets.get(ticker) else {
            return Err(ExchangeError::NotFound);
        };
        let n = (((end_ts - start_ts) / period_secs as f64) as usize).min(1024);
        // Walk backwards from the current mid so the series ends where the
        // market is now.
        let mut closes = vec![0.0; n];
        let mut px = m.mid as f64 / 100.0;
        for i in (0..n).rev() {
            closes[i] = px;
            if state.rng.random_bool(0.4) {
                px += if state.rng.random_bool(0.5) { 0.01 } else { -0.01 };
                px = px.clamp(0.03, 0.97);
            }
        }
        Ok(closes
            .into_iter()
            .enumerate()
            .map(|(i, close)| Candle {
                open: close,
                high: close + 0.005,
                low: close - 0.005,
                close,
                ts: start_ts + i as f64 * period_secs as f64,
            })
            .collect())
    }

    async fn get_valid_markets(&self) -> Result<Vec<MarketInfo>, ExchangeError> {
        let state = self.state.lock();
        Ok(state.markets.values().map(|m| m.info.clone()).collect())
    }

    async fn get_lip_target(&self, ticker: &str) -> Result<i64, ExchangeError> {
        let state = self.state.lock();
        state
            .markets
            .get(ticker)
            .map(|m| m.info.lip_target)
            .ok_or(ExchangeError::NotFound)
    }

    async fn subscribe_orderbook(
        &self,
        tickers: &[String],
    ) -> Result<mpsc::Receiver<BookEvent>, ExchangeError> {
        let (tx, rx) = mpsc::channel(512);
        let mut state = self.state.lock();
        let state = &mut *state;
        for ticker in tickers {
            if let Some(m) = state.markets.get_mut(ticker) {
                let yes = m.yes_bids(&mut state.rng);
                let no = m.no_bids(&mut state.rng);
                m.seq += 1;
                let _ = tx.try_send(BookEvent::Snapshot {
                    ticker: ticker.clone(),
                    side: BookSide::Yes,
                    levels: yes,
                    seq: m.seq,
                });
                m.seq += 1;
                let _ = tx.try_send(BookEvent::Snapshot {
                    ticker: ticker.clone(),
                    side: BookSide::No,
                    levels: no,
                    seq: m.seq,
                });
            }
        }
        state.book_subs.push((tickers.to_vec(), tx));
        Ok(rx)
    }

    async fn subscribe_fills(
        &self,
        _tickers: &[String],
    ) -> Result<mpsc::Receiver<FillEvent>, ExchangeError> {
        let (tx, rx) = mpsc::channel(512);
        self.state.lock().fill_subs.push(tx);
        Ok(rx)
    }
}

pub async fn run_paper_driver(exchange: Arc<PaperExchange>) {
    let mut tick = tokio::time::interval(DRIVER_STEP);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        exchange.step();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resting_order_lifecycle() {
        let ex = PaperExchange::new(3);
        let markets = ex.get_valid_markets().await.unwrap();
        assert_eq!(markets.len(), 3);
        let ticker = &markets[0].ticker;

        let oid = ex
            .place_order(ticker, OrderSide::Buy, 30, 10, Tif::Gtc)
            .await;
        // A paper fault is possible; retry once for test stability.
        let oid = match oid {
            Ok(id) => id,
            Err(_) => ex
                .place_order(ticker, OrderSide::Buy, 30, 10, Tif::Gtc)
                .await
                .unwrap(),
        };
        ex.cancel_order(&oid).await.unwrap();
        assert!(matches!(
            ex.cancel_order(&oid).await,
            Err(ExchangeError::NotFound)
        ));
    }

    #[tokio::test]
    async fn ioc_fills_immediately_on_the_stream() {
        let ex = PaperExchange::new(1);
        let markets = ex.get_valid_markets().await.unwrap();
        let ticker = markets[0].ticker.clone();
        let mut fills = ex.subscribe_fills(&[ticker.clone()]).await.unwrap();

        let mut placed = None;
        for _ in 0..5 {
            if let Ok(id) = ex
                .place_order(&ticker, OrderSide::Sell, 50, 25, Tif::Ioc)
                .await
            {
                placed = Some(id);
                break;
            }
        }
        let oid = placed.expect("ioc accepted");
        let ev = fills.try_recv().unwrap();
        assert_eq!(ev.order_id, oid);
        assert_eq!(ev.size, 25);
        assert_eq!(ev.fill_index, 1);
    }

    #[tokio::test]
    async fn snapshots_arrive_on_subscribe() {
        let ex = PaperExchange::new(1);
        let markets = ex.get_valid_markets().await.unwrap();
        let ticker = markets[0].ticker.clone();
        let mut rx = ex.subscribe_orderbook(&[ticker.clone()]).await.unwrap();
        let first = rx.try_recv().unwrap();
        assert_eq!(first.ticker(), ticker);
    }
}
