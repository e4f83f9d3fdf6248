use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, watch};

use crate::{
    book::BookRegistry,
    breaker::CircuitBreaker,
    config::Settings,
    discovery::{self, CandidateQueue},
    exchange::{with_rate_limit_retry, ExchangeClient, ExchangeError, FillEvent, OrderSide, Tif},
    feed::{self, ReactiveSignal},
    fills::{self, InventoryBook},
    market_state::{Action, LiveOrder, MarketPhase, TrackedMarket},
    math::{now_ts, Cents},
    quoting::{lip_intensity, QuoteDecision, QuotePolicy},
    risk::RiskScorer,
    settlement::{cash_out_order, detect_resolution, ResolutionCheck},
    store::SqliteStore,
    volatility::{VolCache, VolEngine},
};

const SWEEP_INTERVAL_SECS: f64 = 60.0;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub async fn run(
    settings: Settings,
    store: SqliteStore,
    client: Arc<dyn ExchangeClient>,
    scan_only: bool,
) -> Result<()> {
    let breaker = Arc::new(CircuitBreaker::load(&settings)?);
    let books = BookRegistry::new();
    let inventory = InventoryBook::new();
    let vol_cache = VolCache::new();
    let vol = Arc::new(VolEngine::new(
        settings.clone(),
        client.clone(),
        vol_cache.clone(),
    ));
    let queue = CandidateQueue::new(settings.max_markets_with_orders * 4);

    let (tracked_tx, tracked_rx) = watch::channel(Vec::<String>::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (fills_tx, fills_rx) = mpsc::channel::<FillEvent>(1024);
    let (reactive_tx, reactive_rx) = mpsc::channel::<ReactiveSignal>(256);

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(discovery::run_discovery(
        client.clone(),
        settings.clone(),
        queue.clone(),
        tracked_rx.clone(),
        vol_cache.clone(),
        shutdown_rx.clone(),
    )));
    if !scan_only {
        tasks.push(tokio::spawn(feed::run_book_stream(
            client.clone(),
            books.clone(),
            tracked_rx.clone(),
            reactive_tx,
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(fills::run_fill_stream(
            client.clone(),
            inventory.clone(),
            store.clone(),
            tracked_rx.clone(),
            fills_tx,
            shutdown_rx.clone(),
        )));
    }

    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("app.shutdown_signal");
                let _ = shutdown_tx.send(true);
            }
        });
    }

    let mut trader = Trader {
        settings,
        store,
        client,
        books,
        inventory,
        vol,
        vol_cache,
        breaker,
        queue,
        tracked_tx,
        markets: HashMap::new(),
        realized_closed: 0.0,
        last_sweep_ts: 0.0,
        last_lip_refresh_ts: now_ts(),
    };

    let result = if scan_only {
        trader.run_scanner(shutdown_rx.clone()).await
    } else {
        trader.run_loop(fills_rx, reactive_rx, shutdown_rx.clone()).await
    };

    // Shutdown: stop admitting (loop has exited), pull quotes, give the
    // stream tasks their grace window.
    let _ = shutdown_tx.send(true);
    trader.cancel_all_live().await;
    for task in tasks {
        if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
            log::warn!("app.task_shutdown_timeout");
        }
    }
    log::info!("app.stopped realized_closed={:.2}", trader.realized_closed);
    result
}

struct Trader {
    settings: Settings,
    store: SqliteStore,
    client: Arc<dyn ExchangeClient>,
    books: BookRegistry,
    inventory: InventoryBook,
    vol: Arc<VolEngine>,
    vol_cache: VolCache,
    breaker: Arc<CircuitBreaker>,
    queue: CandidateQueue,
    tracked_tx: watch::Sender<Vec<String>>,
    markets: HashMap<String, TrackedMarket>,
    realized_closed: f64,
    last_sweep_ts: f64,
    last_lip_refresh_ts: f64,
}

impl Trader {
    async fn run_loop(
        &mut self,
        mut fills_rx: mpsc::Receiver<FillEvent>,
        mut reactive_rx: mpsc::Receiver<ReactiveSignal>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        let scorer = RiskScorer::new(self.settings.clone());
        let policy = QuotePolicy::new(self.settings.clone());
        let mut tick = tokio::time::interval(Duration::from_secs_f64(self.settings.dt_secs));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return Ok(());
                    }
                }
                _ = tick.tick() => {
                    self.on_tick(&mut fills_rx, &scorer, &policy).await;
                }
                sig = reactive_rx.recv() => {
                    match sig {
                        Some(sig) => self.on_reactive(sig, &scorer, &policy).await,
                        // The feed task only drops its sender on shutdown.
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Discovery-only mode: scan, score, log, never touch the order path.
    async fn run_scanner(&mut self, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        let mut tick = tokio::time::interval(Duration::from_secs_f64(self.settings.dt_secs));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return Ok(());
                    }
                }
                _ = tick.tick() => {}
            }
            let now = now_ts();
            let candidates = self.queue.drain(usize::MAX);
            for c in &candidates {
                log::info!(
                    "scanner.candidate ticker={} close_in_h={:.1} lip_target={}",
                    c.ticker,
                    (c.close_ts - now) / 3600.0,
                    c.lip_target
                );
            }
            if !candidates.is_empty() {
                let tickers: Vec<String> = candidates.iter().map(|c| c.ticker.clone()).collect();
                let vol = self.vol.clone();
                tokio::spawn(async move {
                    vol.refresh(&tickers, now_ts()).await;
                });
            }
        }
    }

    async fn on_tick(
        &mut self,
        fills_rx: &mut mpsc::Receiver<FillEvent>,
        scorer: &RiskScorer,
        policy: &QuotePolicy,
    ) {
        let now = now_ts();
        if self.breaker.is_open() {
            self.cancel_all_live().await;
            return;
        }

        self.drain_fills(fills_rx);
        self.admit_candidates(now);
        self.maybe_refresh_vol(now);
        self.maybe_refresh_lip_targets(now).await;

        let tickers: Vec<String> = self.markets.keys().cloned().collect();
        for ticker in tickers {
            if self.breaker.is_open() {
                break;
            }
            self.tick_market(&ticker, now, scorer, policy).await;
        }

        self.maybe_sweep(now);
        self.store
            .upsert_runtime_status(
                "trader",
                "ok",
                &format!("markets={}", self.markets.len()),
                None,
                now,
            )
            .ok();
    }

    /// Apply stream-confirmed fills to the live-order bookkeeping. Inventory
    /// itself was already moved by the fill task.
    fn drain_fills(&mut self, fills_rx: &mut mpsc::Receiver<FillEvent>) {
        while let Ok(ev) = fills_rx.try_recv() {
            let Some(m) = self.markets.get_mut(&ev.ticker) else {
                continue;
            };
            let Some(order) = m.live_mut(ev.side) else {
                continue;
            };
            if order.order_id != ev.order_id {
                continue;
            }
            order.remaining -= ev.size;
            if order.remaining <= 0 {
                let done = m.take_live(ev.side).map(|o| o.order_id);
                if let Some(order_id) = done {
                    log::info!(
                        "order.filled ticker={} side={} order_id={order_id}",
                        ev.ticker,
                        ev.side.as_str()
                    );
                    self.store
                        .update_order_status(&order_id, "filled", Some(0))
                        .ok();
                }
            } else {
                let (order_id, remaining) = (order.order_id.clone(), order.remaining);
                self.store
                    .update_order_status(&order_id, "open", Some(remaining))
                    .ok();
            }
        }
    }

    fn admit_candidates(&mut self, now: f64) {
        let free = self
            .settings
            .max_markets_with_orders
            .saturating_sub(self.markets.len());
        if free == 0 {
            return;
        }
        let mut admitted = false;
        for m in self.queue.drain(free) {
            if self.markets.contains_key(&m.ticker) || m.close_ts <= now {
                continue;
            }
            let close = chrono::DateTime::from_timestamp(m.close_ts as i64, 0)
                .map(|d| d.to_rfc3339())
                .unwrap_or_else(|| format!("{}", m.close_ts));
            log::info!(
                "market.tracked ticker={} close={close} lip_target={}",
                m.ticker,
                m.lip_target
            );
            self.books.ensure(&m.ticker);
            self.inventory.ensure(&m.ticker);
            self.markets.insert(
                m.ticker.clone(),
                TrackedMarket::new(m.ticker, m.close_ts, m.lip_target),
            );
            admitted = true;
        }
        if admitted {
            self.publish_tracked();
        }
    }

    fn publish_tracked(&self) {
        let mut tickers: Vec<String> = self.markets.keys().cloned().collect();
        tickers.sort();
        self.tracked_tx.send_if_modified(|current| {
            if *current != tickers {
                *current = tickers;
                true
            } else {
                false
            }
        });
    }

    fn maybe_refresh_vol(&self, now: f64) {
        if now - self.vol_cache.load().refreshed_ts < self.settings.lip_vol_refresh_secs as f64 {
            return;
        }
        let tickers: Vec<String> = self.markets.keys().cloned().collect();
        if tickers.is_empty() {
            return;
        }
        let vol = self.vol.clone();
        tokio::spawn(async move {
            vol.refresh(&tickers, now_ts()).await;
        });
    }

    /// The qualifying threshold follows the exchange on the same coarse
    /// cadence as volatility.
    async fn maybe_refresh_lip_targets(&mut self, now: f64) {
        if now - self.last_lip_refresh_ts < self.settings.lip_vol_refresh_secs as f64 {
            return;
        }
        self.last_lip_refresh_ts = now;
        let tickers: Vec<String> = self.markets.keys().cloned().collect();
        for ticker in tickers {
            let client = self.client.clone();
            match with_rate_limit_retry("get_lip_target", || client.get_lip_target(&ticker)).await {
                Ok(target) => {
                    if let Some(m) = self.markets.get_mut(&ticker) {
                        if m.lip_target != target {
                            log::info!(
                                "market.lip_target ticker={ticker} old={} new={target}",
                                m.lip_target
                            );
                            m.lip_target = target;
                        }
                    }
                }
                Err(e) => {
                    if e.is_transient() {
                        self.breaker.record_api_error("get_lip_target");
                    }
                    log::warn!("market.lip_target_failed ticker={ticker} err={e}");
                }
            }
        }
    }

    async fn tick_market(&mut self, ticker: &str, now: f64, scorer: &RiskScorer, policy: &QuotePolicy) {
        let Some(close_ts) = self.markets.get(ticker).map(|m| m.close_ts) else {
            return;
        };

        if now >= close_ts {
            let actions = self
                .markets
                .get_mut(ticker)
                .map(|m| m.plan_expiry())
                .unwrap_or_default();
            log::info!("market.expired ticker={ticker}");
            self.exec_actions(ticker, actions).await;
            return;
        }

        let Some(book) = self.books.get(ticker) else {
            return;
        };
        let (touch, yes_levels, no_levels) = {
            let b = book.lock();
            (
                b.touch(),
                b.levels_best_first(crate::book::BookSide::Yes),
                b.levels_best_first(crate::book::BookSide::No),
            )
        };
        let (inv, _) = self.inventory.position(ticker);

        match detect_resolution(&touch) {
            ResolutionCheck::Contradictory => {
                log::warn!(
                    "settlement.contradictory ticker={ticker} yes_bid={:?} no_bid={:?}",
                    touch.yes_bid,
                    touch.no_bid
                );
                return;
            }
            ResolutionCheck::Resolved(res) => {
                let cash = cash_out_order(inv, &touch);
                let actions = {
                    let Some(m) = self.markets.get_mut(ticker) else {
                        return;
                    };
                    m.observe_touch(touch);
                    m.plan_cash_out(inv, cash)
                };
                if !actions.is_empty() {
                    log::info!(
                        "settlement.resolved ticker={ticker} side={} inventory={inv}",
                        res.as_str()
                    );
                }
                self.exec_actions(ticker, actions).await;
                return;
            }
            ResolutionCheck::Unresolved => {}
        }

        let vol = self.vol_cache.load();
        let risk_score = scorer.score(ticker, close_ts, now, &vol);
        let lip_target = self.markets.get(ticker).map(|m| m.lip_target).unwrap_or(0);
        let decision = policy.desired_quote(&yes_levels, &no_levels, lip_target, risk_score, inv);

        let actions = {
            let Some(m) = self.markets.get_mut(ticker) else {
                return;
            };
            m.observe_touch(touch);
            if m.phase == MarketPhase::Blocked {
                return;
            }
            match &decision {
                QuoteDecision::Skip(reason) => log::debug!(
                    "quote.skip ticker={ticker} reason={} risk={risk_score:.3} inventory={inv}",
                    reason.as_str()
                ),
                QuoteDecision::Quote { bid, ask } => log::debug!(
                    "quote.target ticker={ticker} bid={:?} ask={:?} intensity={:.2} risk={risk_score:.3}",
                    bid.as_ref().map(|q| (q.price, q.ticks_from_best, q.multiplier)),
                    ask.as_ref().map(|q| (q.price, q.ticks_from_best, q.multiplier)),
                    lip_intensity(&yes_levels, lip_target)
                ),
            }
            m.plan_quotes(&decision, inv, now, &self.settings)
        };
        self.exec_actions(ticker, actions).await;
    }

    async fn on_reactive(&mut self, sig: ReactiveSignal, scorer: &RiskScorer, policy: &QuotePolicy) {
        if self.breaker.is_open() {
            return;
        }
        let now = now_ts();
        let ticker = sig.ticker;
        let Some((close_ts, lip_target)) = self
            .markets
            .get(&ticker)
            .map(|m| (m.close_ts, m.lip_target))
        else {
            return;
        };
        let (inv, _) = self.inventory.position(&ticker);
        if inv <= 0 {
            return;
        }
        let Some(book) = self.books.get(&ticker) else {
            return;
        };
        let (touch, yes_levels, no_levels) = {
            let b = book.lock();
            (
                b.touch(),
                b.levels_best_first(crate::book::BookSide::Yes),
                b.levels_best_first(crate::book::BookSide::No),
            )
        };
        // Terminal books belong to the tick path.
        if detect_resolution(&touch) != ResolutionCheck::Unresolved {
            return;
        }

        let vol = self.vol_cache.load();
        let risk_score = scorer.score(&ticker, close_ts, now, &vol);
        let decision = policy.desired_quote(&yes_levels, &no_levels, lip_target, risk_score, inv);
        let desired_ask = match &decision {
            QuoteDecision::Quote { ask, .. } => ask.clone(),
            QuoteDecision::Skip(_) => None,
        };

        let actions = {
            let Some(m) = self.markets.get_mut(&ticker) else {
                return;
            };
            m.observe_touch(touch);
            m.plan_reactive_ask(desired_ask.as_ref(), inv, now, &self.settings)
        };
        if !actions.is_empty() {
            log::info!(
                "reactive.ask ticker={ticker} best_bid={:?} inventory={inv}",
                touch.yes_bid
            );
            self.exec_actions(&ticker, actions).await;
        }
    }

    async fn exec_actions(&mut self, ticker: &str, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Cancel { side } => self.exec_cancel(ticker, side).await,
                Action::Place { side, price, size } => {
                    self.exec_place(ticker, side, price, size).await
                }
                Action::CashOut { side, price, size } => {
                    self.exec_cash_out(ticker, side, price, size).await
                }
                Action::Untrack => {
                    // A failed cancel leaves a live order behind; hold the
                    // market until the pull goes through.
                    if self
                        .markets
                        .get(ticker)
                        .map(|m| m.has_live())
                        .unwrap_or(false)
                    {
                        log::debug!("market.untrack_deferred ticker={ticker}");
                    } else {
                        self.exec_untrack(ticker);
                    }
                }
            }
        }
    }

    async fn exec_cancel(&mut self, ticker: &str, side: OrderSide) {
        let Some(order) = self
            .markets
            .get_mut(ticker)
            .and_then(|m| m.take_live(side))
        else {
            return;
        };
        let client = self.client.clone();
        let res =
            with_rate_limit_retry("cancel_order", || client.cancel_order(&order.order_id)).await;
        match res {
            Ok(()) | Err(ExchangeError::NotFound) => {
                self.breaker.record_api_success();
                log::info!(
                    "order.cancelled ticker={ticker} side={} order_id={} price={}",
                    side.as_str(),
                    order.order_id,
                    order.price
                );
                self.store
                    .update_order_status(&order.order_id, "cancelled", None)
                    .ok();
            }
            Err(e) if e.is_fatal() => {
                self.breaker.trip(&e.to_string());
                if let Some(m) = self.markets.get_mut(ticker) {
                    m.put_live(order);
                }
            }
            Err(e) => {
                if e.is_transient() {
                    self.breaker.record_api_error("cancel_order");
                }
                log::warn!(
                    "order.cancel_failed ticker={ticker} order_id={} err={e}",
                    order.order_id
                );
                if let Some(m) = self.markets.get_mut(ticker) {
                    m.put_live(order);
                }
            }
        }
    }

    async fn exec_place(&mut self, ticker: &str, side: OrderSide, price: Cents, size: i64) {
        if self.breaker.is_open() {
            return;
        }
        // One live order per side, no matter what the planner asked for.
        if self
            .markets
            .get(ticker)
            .map(|m| m.live(side).is_some())
            .unwrap_or(true)
        {
            return;
        }
        let client = self.client.clone();
        let res = with_rate_limit_retry("place_order", || {
            client.place_order(ticker, side, price, size, Tif::Gtc)
        })
        .await;
        let now = now_ts();
        match res {
            Ok(order_id) => {
                self.breaker.record_api_success();
                log::info!(
                    "order.placed ticker={ticker} side={} price={price} size={size} order_id={order_id}",
                    side.as_str()
                );
                self.store
                    .insert_order(&order_id, ticker, side.as_str(), price, size, now, "open")
                    .ok();
                if let Some(m) = self.markets.get_mut(ticker) {
                    m.put_live(LiveOrder {
                        order_id,
                        side,
                        price,
                        remaining: size,
                        submitted_ts: now,
                    });
                } else {
                    // Untracked while the request was in flight.
                    let _ = with_rate_limit_retry("cancel_order", || {
                        client.cancel_order(&order_id)
                    })
                    .await;
                }
            }
            Err(ExchangeError::OrderRejected { reason }) => {
                log::warn!(
                    "order.rejected ticker={ticker} side={} price={price} reason={reason}",
                    side.as_str()
                );
            }
            Err(e) if e.is_fatal() => self.breaker.trip(&e.to_string()),
            Err(e) => {
                self.breaker.record_api_error("place_order");
                log::warn!("order.place_failed ticker={ticker} err={e}");
            }
        }
    }

    async fn exec_cash_out(&mut self, ticker: &str, side: OrderSide, price: Cents, size: i64) {
        if self.breaker.is_open() {
            return;
        }
        let client = self.client.clone();
        let res = with_rate_limit_retry("place_order", || {
            client.place_order(ticker, side, price, size, Tif::Ioc)
        })
        .await;
        match res {
            Ok(order_id) => {
                self.breaker.record_api_success();
                log::info!(
                    "settlement.cash_out ticker={ticker} side={} price={price} size={size} order_id={order_id}",
                    side.as_str()
                );
                self.store
                    .insert_order(&order_id, ticker, side.as_str(), price, size, now_ts(), "ioc")
                    .ok();
                if let Some(m) = self.markets.get_mut(ticker) {
                    m.cash_out_submitted = true;
                }
            }
            Err(ExchangeError::OrderRejected { reason }) => {
                log::warn!("settlement.cash_out_rejected ticker={ticker} reason={reason}");
            }
            Err(e) if e.is_fatal() => self.breaker.trip(&e.to_string()),
            Err(e) => {
                self.breaker.record_api_error("place_order");
                log::warn!("settlement.cash_out_failed ticker={ticker} err={e}");
            }
        }
    }

    fn exec_untrack(&mut self, ticker: &str) {
        if let Some(m) = self.markets.remove(ticker) {
            log::info!(
                "market.untracked ticker={ticker} phase={}",
                m.phase.as_str()
            );
        }
        self.books.remove(ticker);
        self.realized_closed += self.inventory.remove(ticker);
        self.publish_tracked();
    }

    /// Minute-cadence safety sweep: net-inventory imbalance, realized P&L
    /// floor, and position telemetry.
    fn maybe_sweep(&mut self, now: f64) {
        if now - self.last_sweep_ts < SWEEP_INTERVAL_SECS {
            return;
        }
        self.last_sweep_ts = now;

        let mut net = 0i64;
        for (ticker, m) in &self.markets {
            if m.cash_out_submitted {
                continue;
            }
            net += self.inventory.position(ticker).0;
        }
        self.breaker.check_imbalance(
            net,
            self.settings.max_position,
            self.settings.circuit_max_inventory_imbalance,
        );

        let realized = self.realized_closed + self.inventory.total_realized();
        self.breaker
            .check_pnl(realized, self.settings.circuit_pnl_threshold);

        for ticker in self.markets.keys() {
            if let Some(p) = self.inventory.snapshot(ticker) {
                self.store
                    .insert_position_snapshot(now, ticker, p.qty, p.avg_price, p.realized_pnl)
                    .ok();
            }
        }
        log::info!(
            "sweep net_inventory={net} realized={realized:.2} markets={}",
            self.markets.len()
        );
    }

    async fn cancel_all_live(&mut self) {
        let pending: Vec<(String, OrderSide)> = self
            .markets
            .iter()
            .flat_map(|(t, m)| {
                let mut v = Vec::new();
                if m.buy.is_some() {
                    v.push((t.clone(), OrderSide::Buy));
                }
                if m.sell.is_some() {
                    v.push((t.clone(), OrderSide::Sell));
                }
                v
            })
            .collect();
        for (ticker, side) in pending {
            self.exec_cancel(&ticker, side).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_settings;
    use crate::exchange::MarketInfo;
    use crate::testutil::MockExchange;

    struct Harness {
        trader: Trader,
        mock: Arc<MockExchange>,
        scorer: RiskScorer,
        policy: QuotePolicy,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        harness_with(test_settings())
    }

    fn harness_with(mut settings: Settings) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        settings.breaker_state_path = dir
            .path()
            .join("breaker.json")
            .to_string_lossy()
            .to_string();
        settings.sqlite_path = dir.path().join("t.sqlite").to_string_lossy().to_string();
        let store = SqliteStore::new(&settings.sqlite_path).unwrap();
        store.init_db().unwrap();

        let mock = Arc::new(MockExchange::new());
        let client: Arc<dyn ExchangeClient> = mock.clone();
        let vol_cache = VolCache::new();
        let now = now_ts();
        let trader = Trader {
            settings: settings.clone(),
            store,
            client: client.clone(),
            books: BookRegistry::new(),
            inventory: InventoryBook::new(),
            vol: Arc::new(VolEngine::new(
                settings.clone(),
                client,
                vol_cache.clone(),
            )),
            vol_cache,
            breaker: Arc::new(CircuitBreaker::load(&settings).unwrap()),
            queue: CandidateQueue::new(32),
            tracked_tx: watch::channel(Vec::new()).0,
            markets: HashMap::new(),
            realized_closed: 0.0,
            last_sweep_ts: now,
            last_lip_refresh_ts: now,
        };
        Harness {
            trader,
            mock,
            scorer: RiskScorer::new(settings.clone()),
            policy: QuotePolicy::new(settings),
            _dir: dir,
        }
    }

    impl Harness {
        fn track(&mut self, ticker: &str, close_in_secs: f64, lip_target: i64) {
            self.trader.markets.insert(
                ticker.to_string(),
                TrackedMarket::new(ticker.to_string(), now_ts() + close_in_secs, lip_target),
            );
            self.trader.books.ensure(ticker);
            self.trader.inventory.ensure(ticker);
        }

        fn seed_book(&self, ticker: &str, yes: &[(Cents, i64)], no: &[(Cents, i64)]) {
            let book = self.trader.books.ensure(ticker);
            let mut b = book.lock();
            b.resync(yes, no);
        }

        fn set_inventory(&self, ticker: &str, qty: i64) {
            self.trader.inventory.ensure(ticker).lock().qty = qty;
        }

        fn put_live(&mut self, ticker: &str, side: OrderSide, price: Cents) {
            self.trader
                .markets
                .get_mut(ticker)
                .unwrap()
                .put_live(LiveOrder {
                    order_id: format!("stale-{}-{}", side.as_str(), price),
                    side,
                    price,
                    remaining: 100,
                    submitted_ts: 0.0,
                });
        }

        async fn tick(&mut self, ticker: &str) {
            self.trader
                .tick_market(ticker, now_ts(), &self.scorer, &self.policy)
                .await;
        }
    }

    #[tokio::test]
    async fn join_touch_with_zero_spread_blocks_without_orders() {
        let mut h = harness();
        h.track("M1", 24.0 * 3600.0, 100);
        h.seed_book("M1", &[(45, 200)], &[(55, 200)]);
        h.tick("M1").await;
        assert_eq!(h.mock.place_count(), 0);
        assert_eq!(h.trader.markets["M1"].phase, MarketPhase::Blocked);
        // Blocked holds through an unchanged book.
        h.tick("M1").await;
        assert_eq!(h.mock.place_count(), 0);
    }

    #[tokio::test]
    async fn lip_target_already_met_untracks_a_flat_market() {
        let mut h = harness();
        h.track("M2", 24.0 * 3600.0, 100);
        h.seed_book("M2", &[(30, 500)], &[(65, 300)]);
        h.tick("M2").await;
        assert!(h.trader.markets.is_empty());
        assert_eq!(h.mock.place_count(), 0);
    }

    #[tokio::test]
    async fn calm_market_rests_both_sides_once() {
        let mut h = harness();
        h.track("M", 24.0 * 3600.0, 100);
        h.seed_book("M", &[(45, 80), (44, 80)], &[(52, 80), (51, 80)]);
        h.tick("M").await;
        let placed = h.mock.placed();
        assert_eq!(placed.len(), 2);
        assert_eq!(placed[0].side, OrderSide::Buy);
        assert_eq!(placed[0].price, 45);
        assert_eq!(placed[1].side, OrderSide::Sell);
        assert_eq!(placed[1].price, 48);
        assert!(placed.iter().all(|p| p.size == 100 && p.tif == Tif::Gtc));
        // Same book next tick: live orders already match, nothing new.
        h.tick("M").await;
        assert_eq!(h.mock.place_count(), 2);
    }

    #[tokio::test]
    async fn resolved_market_cashes_out_then_untracks_flat() {
        let mut h = harness();
        h.track("M4", 24.0 * 3600.0, 100);
        // NO bids at half a cent arrive clamped to the 1c tick.
        h.seed_book("M4", &[(99, 50)], &[(1, 200)]);
        h.set_inventory("M4", 80);
        h.put_live("M4", OrderSide::Buy, 45);

        h.tick("M4").await;
        let placed = h.mock.placed();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].side, OrderSide::Sell);
        assert_eq!(placed[0].price, 99);
        assert_eq!(placed[0].size, 80);
        assert_eq!(placed[0].tif, Tif::Ioc);
        assert!(h.mock.cancelled().iter().any(|id| id.starts_with("stale-buy")));
        assert!(h.trader.markets["M4"].cash_out_submitted);

        // Still holding: no second IOC while fills drain.
        h.tick("M4").await;
        assert_eq!(h.mock.place_count(), 1);

        // Fills walked the position to zero: untracked within one tick.
        h.set_inventory("M4", 0);
        h.tick("M4").await;
        assert!(h.trader.markets.is_empty());
    }

    #[tokio::test]
    async fn contradictory_extreme_book_stands_down() {
        let mut h = harness();
        h.track("MX", 24.0 * 3600.0, 100);
        h.seed_book("MX", &[(99, 50)], &[(99, 50)]);
        h.set_inventory("MX", 40);
        h.tick("MX").await;
        assert_eq!(h.mock.place_count(), 0);
        assert!(!h.trader.markets["MX"].cash_out_submitted);
    }

    #[tokio::test]
    async fn reactive_ask_follows_the_bid_under_cooldown() {
        let mut h = harness();
        h.track("M5", 24.0 * 3600.0, 100);
        h.seed_book("M5", &[(53, 80), (52, 80)], &[(45, 80), (44, 80)]);
        h.set_inventory("M5", 10);
        h.put_live("M5", OrderSide::Sell, 52);
        {
            let m = h.trader.markets.get_mut("M5").unwrap();
            m.last_reactive_ts = now_ts() - 0.6;
        }

        h.trader
            .on_reactive(
                ReactiveSignal {
                    ticker: "M5".into(),
                },
                &h.scorer,
                &h.policy,
            )
            .await;
        let placed = h.mock.placed();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].side, OrderSide::Sell);
        assert_eq!(placed[0].price, 55);
        assert!(h.mock.cancelled().iter().any(|id| id.starts_with("stale-sell")));

        // The bid lifts again 200 ms later: inside the cooldown, skipped.
        h.seed_book("M5", &[(54, 80), (53, 80)], &[(44, 80), (43, 80)]);
        h.trader
            .on_reactive(
                ReactiveSignal {
                    ticker: "M5".into(),
                },
                &h.scorer,
                &h.policy,
            )
            .await;
        assert_eq!(h.mock.place_count(), 1);
    }

    #[tokio::test]
    async fn ten_consecutive_transport_errors_trip_the_breaker() {
        let mut h = harness();
        h.track("M6", 24.0 * 3600.0, 100);
        h.seed_book("M6", &[(45, 80), (44, 80)], &[(52, 80), (51, 80)]);
        for _ in 0..10 {
            h.mock.push_place_error(ExchangeError::TransportTimeout);
        }
        // Two placement attempts per tick; the tenth failure latches it.
        for _ in 0..5 {
            h.tick("M6").await;
        }
        assert!(h.trader.breaker.is_open());
        assert_eq!(h.mock.place_count(), 0);
        // Latched: the would-be eleventh call is never issued.
        h.tick("M6").await;
        assert_eq!(h.mock.place_count(), 0);
    }

    #[tokio::test]
    async fn expired_market_unwinds_and_untracks() {
        let mut h = harness();
        h.track("M7", -1.0, 100);
        h.put_live("M7", OrderSide::Buy, 45);
        h.tick("M7").await;
        assert!(h.trader.markets.is_empty());
        assert_eq!(h.mock.place_count(), 0);
        assert_eq!(h.mock.cancelled().len(), 1);
    }

    #[tokio::test]
    async fn admits_candidates_up_to_the_concurrency_cap() {
        let mut settings = test_settings();
        settings.max_markets_with_orders = 2;
        let mut h = harness_with(settings);
        let now = now_ts();
        for i in 0..3 {
            h.trader.queue.push(MarketInfo {
                ticker: format!("C{i}"),
                close_ts: now + 3600.0,
                lip_target: 100,
                last_price: Some(0.5),
                toxic: false,
            });
        }
        h.trader.admit_candidates(now);
        assert_eq!(h.trader.markets.len(), 2);
        assert_eq!(h.trader.queue.len(), 1);
    }

    #[tokio::test]
    async fn transient_cancel_failure_keeps_the_live_order() {
        let mut h = harness();
        h.track("M9", 24.0 * 3600.0, 100);
        h.put_live("M9", OrderSide::Buy, 45);
        h.mock
            .push_cancel_error(ExchangeError::TransportUnavailable("down".into()));
        h.trader
            .exec_actions("M9", vec![Action::Cancel { side: OrderSide::Buy }, Action::Untrack])
            .await;
        // Order restored for a retry; the untrack is deferred with it.
        let m = &h.trader.markets["M9"];
        assert!(m.buy.is_some());
        // The retry succeeds and the next untrack goes through.
        h.trader
            .exec_actions("M9", vec![Action::Cancel { side: OrderSide::Buy }, Action::Untrack])
            .await;
        assert!(h.trader.markets.is_empty());
    }

    #[tokio::test]
    async fn fill_drain_retires_exhausted_live_orders() {
        let mut h = harness();
        h.track("M8", 24.0 * 3600.0, 100);
        h.seed_book("M8", &[(45, 80), (44, 80)], &[(52, 80), (51, 80)]);
        h.tick("M8").await;
        let buy_id = h.mock.placed()[0].order_id.clone();

        let (tx, mut rx) = mpsc::channel(8);
        tx.try_send(FillEvent {
            ticker: "M8".into(),
            order_id: buy_id,
            side: OrderSide::Buy,
            price: 45,
            size: 100,
            ts: now_ts(),
            fill_index: 1,
        })
        .unwrap();
        h.trader.drain_fills(&mut rx);
        let m = &h.trader.markets["M8"];
        assert!(m.buy.is_none());
        assert!(m.sell.is_some());
    }
}
