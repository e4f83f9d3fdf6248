use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::book::BookSide;
use crate::math::Cents;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transport timeout")]
    TransportTimeout,
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
    #[error("auth expired")]
    AuthExpired,
    #[error("order rejected: {reason}")]
    OrderRejected { reason: String },
    #[error("not found")]
    NotFound,
    #[error("rate limited")]
    RateLimited,
    #[error("stream gap")]
    StreamGap,
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("internal: {0}")]
    Internal(String),
}

impl ExchangeError {
    /// Transient failures count against the consecutive-error budget and the
    /// market is retried next tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::TransportTimeout
                | ExchangeError::TransportUnavailable(_)
                | ExchangeError::RateLimited
        )
    }

    /// Fatal failures trip the circuit breaker on sight.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ExchangeError::AuthExpired
                | ExchangeError::InsufficientBalance
                | ExchangeError::Internal(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tif {
    Gtc,
    Ioc,
}

#[derive(Debug, Clone)]
pub struct BookLevels {
    pub yes_bids: Vec<(Cents, i64)>,
    pub no_bids: Vec<(Cents, i64)>,
}

#[derive(Debug, Clone, Copy)]
pub struct Candle {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub ts: f64,
}

/// One row of the open-market universe.
#[derive(Debug, Clone)]
pub struct MarketInfo {
    pub ticker: String,
    pub close_ts: f64,
    pub lip_target: i64,
    pub last_price: Option<f64>,
    pub toxic: bool,
}

#[derive(Debug, Clone)]
pub enum BookEvent {
    Snapshot {
        ticker: String,
        side: BookSide,
        levels: Vec<(Cents, i64)>,
        seq: u64,
    },
    Delta {
        ticker: String,
        side: BookSide,
        price: Cents,
        delta: i64,
        seq: u64,
    },
}

impl BookEvent {
    pub fn ticker(&self) -> &str {
        match self {
            BookEvent::Snapshot { ticker, .. } | BookEvent::Delta { ticker, .. } => ticker,
        }
    }
}

/// Delivered at-least-once; `fill_index` is monotone per order and is the
/// dedup key on replays.
#[derive(Debug, Clone)]
pub struct FillEvent {
    pub ticker: String,
    pub order_id: String,
    pub side: OrderSide,
    pub price: Cents,
    pub size: i64,
    pub ts: f64,
    pub fill_index: u64,
}

/// Abstract exchange transport. Implementations own auth, serialization and
/// reconnects below the subscription channels; tests inject a scripted fake.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn place_order(
        &self,
        ticker: &str,
        side: OrderSide,
        price: Cents,
        size: i64,
        tif: Tif,
    ) -> Result<String, ExchangeError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError>;

    async fn get_orderbook(&self, ticker: &str) -> Result<BookLevels, ExchangeError>;

    /// Midpoint candles over [start_ts, end_ts] at `period_secs` granularity.
    async fn get_candles(
        &self,
        ticker: &str,
        start_ts: f64,
        end_ts: f64,
        period_secs: u64,
    ) -> Result<Vec<Candle>, ExchangeError>;

    async fn get_valid_markets(&self) -> Result<Vec<MarketInfo>, ExchangeError>;

    async fn get_lip_target(&self, ticker: &str) -> Result<i64, ExchangeError>;

    async fn subscribe_orderbook(
        &self,
        tickers: &[String],
    ) -> Result<mpsc::Receiver<BookEvent>, ExchangeError>;

    async fn subscribe_fills(
        &self,
        tickers: &[String],
    ) -> Result<mpsc::Receiver<FillEvent>, ExchangeError>;
}

pub const REST_TIMEOUT: Duration = Duration::from_secs(10);

const RATE_LIMIT_BASE_DELAY: Duration = Duration::from_millis(100);
const RATE_LIMIT_MAX_DELAY: Duration = Duration::from_secs(5);
const RATE_LIMIT_RETRIES: u32 = 3;

/// Wrap a REST call with the default timeout; an elapsed deadline counts as
/// one transport timeout for the error budget.
pub async fn with_timeout<T, F>(fut: F) -> Result<T, ExchangeError>
where
    F: Future<Output = Result<T, ExchangeError>>,
{
    match tokio::time::timeout(REST_TIMEOUT, fut).await {
        Ok(res) => res,
        Err(_) => Err(ExchangeError::TransportTimeout),
    }
}

/// Retry a rate-limited call with exponential backoff (100 ms doubling,
/// capped at 5 s, three retries) before surfacing it as transient.
pub async fn with_rate_limit_retry<T, F, Fut>(op: &str, mut call: F) -> Result<T, ExchangeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    let mut delay = RATE_LIMIT_BASE_DELAY;
    let mut attempt = 0u32;
    loop {
        match with_timeout(call()).await {
            Err(ExchangeError::RateLimited) if attempt < RATE_LIMIT_RETRIES => {
                attempt += 1;
                log::warn!("exchange.rate_limited op={op} attempt={attempt} delay_ms={}", delay.as_millis());
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RATE_LIMIT_MAX_DELAY);
            }
            Err(ExchangeError::RateLimited) => {
                return Err(ExchangeError::TransportUnavailable(format!(
                    "{op}: still rate limited after {RATE_LIMIT_RETRIES} retries"
                )))
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn rate_limit_retry_eventually_succeeds() {
        let calls = AtomicU32::new(0);
        let out = with_rate_limit_retry("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ExchangeError::RateLimited)
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_exhaustion_surfaces_as_transient() {
        let err = with_rate_limit_retry("test", || async { Err::<(), _>(ExchangeError::RateLimited) })
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(!matches!(err, ExchangeError::RateLimited));
    }

    #[test]
    fn fatal_and_transient_partitions() {
        assert!(ExchangeError::AuthExpired.is_fatal());
        assert!(ExchangeError::InsufficientBalance.is_fatal());
        assert!(ExchangeError::Internal("x".into()).is_fatal());
        assert!(ExchangeError::TransportTimeout.is_transient());
        assert!(!ExchangeError::OrderRejected { reason: "px".into() }.is_transient());
        assert!(!ExchangeError::NotFound.is_fatal());
    }
}
