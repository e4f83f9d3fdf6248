use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::book::{BookRegistry, OrderBook};
use crate::exchange::{with_rate_limit_retry, BookEvent, ExchangeClient};
use crate::fills::backoff_step;
use parking_lot::Mutex;

const RECONNECT_BASE: Duration = Duration::from_secs(1);

/// Emitted when an update moves the best YES bid; the scheduler may reprice
/// a resting sell off it without waiting for the next tick.
#[derive(Debug, Clone)]
pub struct ReactiveSignal {
    pub ticker: String,
}

/// Long-lived book subscriber. Applies snapshots and deltas in stream order,
/// falls back to a REST snapshot on any gap, and reconnects with capped
/// exponential backoff when the channel drops.
pub async fn run_book_stream(
    client: Arc<dyn ExchangeClient>,
    books: BookRegistry,
    mut tracked_rx: watch::Receiver<Vec<String>>,
    reactive_tx: mpsc::Sender<ReactiveSignal>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
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

        let mut rx = match client.subscribe_orderbook(&tickers).await {
            Ok(rx) => {
                log::info!("feed.subscribed tickers={}", tickers.len());
                backoff = RECONNECT_BASE;
                rx
            }
            Err(e) => {
                let (sleep_for, next) = backoff_step(backoff);
                log::warn!(
                    "feed.subscribe_failed err={e} retry_ms={}",
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
                _ = tracked_rx.changed() => break, // resubscribe to the new set
                ev = rx.recv() => {
                    let Some(ev) = ev else {
                        let (sleep_for, next) = backoff_step(backoff);
                        log::warn!("feed.stream_closed retry_ms={}", sleep_for.as_millis());
                        backoff = next;
                        tokio::select! {
                            _ = tokio::time::sleep(sleep_for) => {}
                            _ = shutdown_rx.changed() => return,
                        }
                        break;
                    };
                    handle_event(&client, &books, &reactive_tx, ev).await;
                }
            }
        }
    }
}

async fn handle_event(
    client: &Arc<dyn ExchangeClient>,
    books: &BookRegistry,
    reactive_tx: &mpsc::Sender<ReactiveSignal>,
    ev: BookEvent,
) {
    let ticker = ev.ticker().to_string();
    let book = books.ensure(&ticker);

    let (best_before, apply_err) = {
        let mut b = book.lock();
        let before = b.best_yes_bid();
        let err = match &ev {
            BookEvent::Snapshot {
                side, levels, seq, ..
            } => {
                b.apply_snapshot(*side, levels, *seq);
                None
            }
            BookEvent::Delta {
                side,
                price,
                delta,
                seq,
                ..
            } => b.apply_delta(*side, *price, *delta, *seq).err(),
        };
        (before, err)
    };

    if let Some(err) = apply_err {
        log::warn!("book.resync ticker={ticker} reason={err:?}");
        resync(client, &book, &ticker).await;
    }

    let best_after = book.lock().best_yes_bid();
    if best_before != best_after {
        // A full reactive queue just means the scheduler is behind; it will
        // see the new touch on its next tick anyway.
        let _ = reactive_tx.try_send(ReactiveSignal {
            ticker: ticker.clone(),
        });
    }
}

/// Replace the whole book from REST. Deltas that raced in between are
/// superseded; a failure leaves the stale sequence in place so the next
/// delta trips resync again.
async fn resync(client: &Arc<dyn ExchangeClient>, book: &Arc<Mutex<OrderBook>>, ticker: &str) {
    match with_rate_limit_retry("get_orderbook", || client.get_orderbook(ticker)).await {
        Ok(levels) => {
            book.lock().resync(&levels.yes_bids, &levels.no_bids);
            log::info!("book.resynced ticker={ticker}");
        }
        Err(e) => {
            log::warn!("book.resync_failed ticker={ticker} err={e}");
        }
    }
}
