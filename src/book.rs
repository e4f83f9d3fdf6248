use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::math::{Cents, MAX_TICK, MIN_TICK};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookSide {
    Yes,
    No,
}

impl BookSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookSide::Yes => "yes",
            BookSide::No => "no",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookError {
    /// Update's sequence number does not follow the last applied one.
    OutOfSequence { expected: u64, got: u64 },
    /// A delta would drive a level's resting count below zero.
    NegativeDepth { price: Cents, count: i64, delta: i64 },
}

/// Best-price view taken under the book lock and released immediately.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Touch {
    pub yes_bid: Option<Cents>,
    pub yes_ask: Option<Cents>,
    pub yes_bid_size: i64,
    pub no_bid: Option<Cents>,
    pub no_bid_size: i64,
}

impl Touch {
    pub fn spread(&self) -> Option<Cents> {
        match (self.yes_bid, self.yes_ask) {
            (Some(b), Some(a)) => Some(a - b),
            _ => None,
        }
    }
}

/// Depth for one market. Both sides are bid ladders; the YES ask is
/// synthesized from the NO bid (`ask = 100 - best_no_bid`).
#[derive(Debug, Default)]
pub struct OrderBook {
    yes_bids: BTreeMap<Cents, i64>,
    no_bids: BTreeMap<Cents, i64>,
    last_seq: Option<u64>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    fn side_mut(&mut self, side: BookSide) -> &mut BTreeMap<Cents, i64> {
        match side {
            BookSide::Yes => &mut self.yes_bids,
            BookSide::No => &mut self.no_bids,
        }
    }

    fn side(&self, side: BookSide) -> &BTreeMap<Cents, i64> {
        match side {
            BookSide::Yes => &self.yes_bids,
            BookSide::No => &self.no_bids,
        }
    }

    /// Replace one side wholesale. Invalid ticks and non-positive counts are
    /// elided rather than stored.
    pub fn apply_snapshot(&mut self, side: BookSide, levels: &[(Cents, i64)], seq: u64) {
        let m = self.side_mut(side);
        m.clear();
        for &(price, count) in levels {
            if (MIN_TICK..=MAX_TICK).contains(&price) && count > 0 {
                m.insert(price, count);
            }
        }
        self.last_seq = Some(seq);
    }

    /// Applied from a REST fetch after a stream gap: replaces both sides and
    /// clears the sequence baseline so the next stream event re-anchors it.
    pub fn resync(&mut self, yes: &[(Cents, i64)], no: &[(Cents, i64)]) {
        self.yes_bids.clear();
        self.no_bids.clear();
        for &(price, count) in yes {
            if (MIN_TICK..=MAX_TICK).contains(&price) && count > 0 {
                self.yes_bids.insert(price, count);
            }
        }
        for &(price, count) in no {
            if (MIN_TICK..=MAX_TICK).contains(&price) && count > 0 {
                self.no_bids.insert(price, count);
            }
        }
        self.last_seq = None;
    }

    /// Signed adjustment of a level's resting count. A result of exactly zero
    /// removes the level; a negative result means our view has drifted from
    /// the exchange and the caller must resync.
    pub fn apply_delta(
        &mut self,
        side: BookSide,
        price: Cents,
        delta: i64,
        seq: u64,
    ) -> Result<(), BookError> {
        self.check_seq(seq)?;
        if !(MIN_TICK..=MAX_TICK).contains(&price) {
            self.last_seq = Some(seq);
            return Ok(());
        }
        let m = self.side_mut(side);
        let count = m.get(&price).copied().unwrap_or(0);
        let next = count + delta;
        if next < 0 {
            return Err(BookError::NegativeDepth { price, count, delta });
        }
        if next == 0 {
            m.remove(&price);
        } else {
            m.insert(price, next);
        }
        self.last_seq = Some(seq);
        Ok(())
    }

    fn check_seq(&self, seq: u64) -> Result<(), BookError> {
        match self.last_seq {
            None => Ok(()),
            Some(last) if seq == last + 1 => Ok(()),
            Some(last) => Err(BookError::OutOfSequence {
                expected: last + 1,
                got: seq,
            }),
        }
    }

    pub fn best_bid(&self, side: BookSide) -> Option<(Cents, i64)> {
        self.side(side)
            .iter()
            .next_back()
            .map(|(&p, &c)| (p, c))
    }

    pub fn best_yes_bid(&self) -> Option<Cents> {
        self.best_bid(BookSide::Yes).map(|(p, _)| p)
    }

    pub fn best_yes_ask(&self) -> Option<Cents> {
        self.best_bid(BookSide::No).map(|(p, _)| 100 - p)
    }

    pub fn touch(&self) -> Touch {
        let yes = self.best_bid(BookSide::Yes);
        let no = self.best_bid(BookSide::No);
        Touch {
            yes_bid: yes.map(|(p, _)| p),
            yes_ask: no.map(|(p, _)| 100 - p),
            yes_bid_size: yes.map(|(_, c)| c).unwrap_or(0),
            no_bid: no.map(|(p, _)| p),
            no_bid_size: no.map(|(_, c)| c).unwrap_or(0),
        }
    }

    /// Bid ladder best-first, for qualifying-band construction.
    pub fn levels_best_first(&self, side: BookSide) -> Vec<(Cents, i64)> {
        self.side(side).iter().rev().map(|(&p, &c)| (p, c)).collect()
    }
}

/// Shared registry of live books. The stream task writes, the scheduler
/// reads; each book has its own lock so critical sections stay small.
#[derive(Clone, Default)]
pub struct BookRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<Mutex<OrderBook>>>>>,
}

impl BookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensure(&self, ticker: &str) -> Arc<Mutex<OrderBook>> {
        if let Some(b) = self.inner.read().get(ticker) {
            return b.clone();
        }
        self.inner
            .write()
            .entry(ticker.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(OrderBook::new())))
            .clone()
    }

    pub fn get(&self, ticker: &str) -> Option<Arc<Mutex<OrderBook>>> {
        self.inner.read().get(ticker).cloned()
    }

    pub fn remove(&self, ticker: &str) {
        self.inner.write().remove(ticker);
    }
}
