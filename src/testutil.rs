//! Scripted exchange fake for state-machine and scheduler tests.

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::exchange::{
    BookEvent, BookLevels, Candle, ExchangeClient, ExchangeError, FillEvent, MarketInfo,
    OrderSide, Tif,
};
use crate::math::Cents;

#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub order_id: String,
    pub ticker: String,
    pub side: OrderSide,
    pub price: Cents,
    pub size: i64,
    pub tif: Tif,
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    placed: Vec<PlacedOrder>,
    cancelled: Vec<String>,
    open: HashSet<String>,
    place_errors: VecDeque<ExchangeError>,
    cancel_errors: VecDeque<ExchangeError>,
    books: HashMap<String, BookLevels>,
    candles: HashMap<String, Vec<Candle>>,
    markets: Vec<MarketInfo>,
    lip_targets: HashMap<String, i64>,
}

#[derive(Default)]
pub struct MockExchange {
    state: Mutex<MockState>,
}

impl MockExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_book(&self, ticker: &str, yes_bids: Vec<(Cents, i64)>, no_bids: Vec<(Cents, i64)>) {
        self.state
            .lock()
            .books
            .insert(ticker.to_string(), BookLevels { yes_bids, no_bids });
    }

    pub fn set_candles(&self, ticker: &str, candles: Vec<Candle>) {
        self.state
            .lock()
            .candles
            .insert(ticker.to_string(), candles);
    }

    pub fn set_markets(&self, markets: Vec<MarketInfo>) {
        self.state.lock().markets = markets;
    }

    pub fn set_lip_target(&self, ticker: &str, target: i64) {
        self.state
            .lock()
            .lip_targets
            .insert(ticker.to_string(), target);
    }

    /// Queue an error for the next place_order call; drained FIFO.
    pub fn push_place_error(&self, err: ExchangeError) {
        self.state.lock().place_errors.push_back(err);
    }

    pub fn push_cancel_error(&self, err: ExchangeError) {
        self.state.lock().cancel_errors.push_back(err);
    }

    pub fn placed(&self) -> Vec<PlacedOrder> {
        self.state.lock().placed.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().cancelled.clone()
    }

    pub fn place_count(&self) -> usize {
        self.state.lock().placed.len()
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    async fn place_order(
        &self,
        ticker: &str,
        side: OrderSide,
        price: Cents,
        size: i64,
        tif: Tif,
    ) -> Result<String, ExchangeError> {
        let mut s = self.state.lock();
        if let Some(err) = s.place_errors.pop_front() {
            return Err(err);
        }
        s.next_id += 1;
        let order_id = format!("mock-{}", s.next_id);
        s.open.insert(order_id.clone());
        s.placed.push(PlacedOrder {
            order_id: order_id.clone(),
            ticker: ticker.to_string(),
            side,
            price,
            size,
            tif,
        });
        Ok(order_id)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError> {
        let mut s = self.state.lock();
        if let Some(err) = s.cancel_errors.pop_front() {
            return Err(err);
        }
        s.cancelled.push(order_id.to_string());
        if s.open.remove(order_id) {
            Ok(())
        } else {
            Err(ExchangeError::NotFound)
        }
    }

    async fn get_orderbook(&self, ticker: &str) -> Result<BookLevels, ExchangeError> {
        self.state
            .lock()
            .books
            .get(ticker)
            .cloned()
            .ok_or(ExchangeError::NotFound)
    }

    async fn get_candles(
        &self,
        ticker: &str,
        _start_ts: f64,
        _end_ts: f64,
        _period_secs: u64,
    ) -> Result<Vec<Candle>, ExchangeError> {
        self.state
            .lock()
            .candles
            .get(ticker)
            .cloned()
            .ok_or(ExchangeError::NotFound)
    }

    async fn get_valid_markets(&self) -> Result<Vec<MarketInfo>, ExchangeError> {
        Ok(self.state.lock().markets.clone())
    }

    async fn get_lip_target(&self, ticker: &str) -> Result<i64, ExchangeError> {
        self.state
            .lock()
            .lip_targets
            .get(ticker)
            .copied()
            .ok_or(ExchangeError::NotFound)
    }

    async fn subscribe_orderbook(
        &self,
        _tickers: &[String],
    ) -> Result<mpsc::Receiver<BookEvent>, ExchangeError> {
        let (_tx, rx) = mpsc::channel(8);
        Ok(rx)
    }

    async fn subscribe_fills(
        &self,
        _tickers: &[String],
    ) -> Result<mpsc::Receiver<FillEvent>, ExchangeError> {
        let (_tx, rx) = mpsc::channel(8);
        Ok(rx)
    }
}
