use crate::book::Touch;
use crate::config::Settings;
use crate::exchange::OrderSide;
use crate::math::Cents;
use crate::quoting::{QuoteDecision, QuoteLevel, SkipReason};
use crate::settlement::CashOut;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketPhase {
    Tracked,
    Quoting,
    Blocked,
    Exiting,
    Closed,
}

impl MarketPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketPhase::Tracked => "tracked",
            MarketPhase::Quoting => "quoting",
            MarketPhase::Blocked => "blocked",
            MarketPhase::Exiting => "exiting",
            MarketPhase::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiveOrder {
    pub order_id: String,
    pub side: OrderSide,
    pub price: Cents,
    pub remaining: i64,
    pub submitted_ts: f64,
}

/// What the planner wants done on the exchange this tick, in order. The
/// scheduler executes; a cancel always precedes its replacement place.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Place {
        side: OrderSide,
        price: Cents,
        size: i64,
    },
    Cancel {
        side: OrderSide,
    },
    CashOut {
        side: OrderSide,
        price: Cents,
        size: i64,
    },
    Untrack,
}

/// Everything the scheduler owns for one quoted market. Streams never touch
/// this; they go through the book and inventory registries instead.
#[derive(Debug)]
pub struct TrackedMarket {
    pub ticker: String,
    pub close_ts: f64,
    pub lip_target: i64,
    pub phase: MarketPhase,
    pub buy: Option<LiveOrder>,
    pub sell: Option<LiveOrder>,
    pub last_touch: Option<Touch>,
    pub last_improvement_ts: f64,
    pub improved_this_touch: bool,
    pub last_reactive_ts: f64,
    pub cash_out_submitted: bool,
}

impl TrackedMarket {
    pub fn new(ticker: String, close_ts: f64, lip_target: i64) -> Self {
        Self {
            ticker,
            close_ts,
            lip_target,
            phase: MarketPhase::Tracked,
            buy: None,
            sell: None,
            last_touch: None,
            last_improvement_ts: 0.0,
            improved_this_touch: false,
            last_reactive_ts: 0.0,
            cash_out_submitted: false,
        }
    }

    pub fn live(&self, side: OrderSide) -> Option<&LiveOrder> {
        match side {
            OrderSide::Buy => self.buy.as_ref(),
            OrderSide::Sell => self.sell.as_ref(),
        }
    }

    pub fn live_mut(&mut self, side: OrderSide) -> Option<&mut LiveOrder> {
        match side {
            OrderSide::Buy => self.buy.as_mut(),
            OrderSide::Sell => self.sell.as_mut(),
        }
    }

    pub fn take_live(&mut self, side: OrderSide) -> Option<LiveOrder> {
        match side {
            OrderSide::Buy => self.buy.take(),
            OrderSide::Sell => self.sell.take(),
        }
    }

    pub fn put_live(&mut self, order: LiveOrder) {
        match order.side {
            OrderSide::Buy => self.buy = Some(order),
            OrderSide::Sell => self.sell = Some(order),
        }
    }

    pub fn has_live(&self) -> bool {
        self.buy.is_some() || self.sell.is_some()
    }

    /// A changed touch re-arms the once-per-touch improvement budget and
    /// releases a Blocked market for re-evaluation.
    pub fn observe_touch(&mut self, touch: Touch) {
        let changed = self
            .last_touch
            .map(|t| t.yes_bid != touch.yes_bid || t.yes_ask != touch.yes_ask)
            .unwrap_or(true);
        if changed {
            self.improved_this_touch = false;
            if self.phase == MarketPhase::Blocked {
                self.phase = MarketPhase::Tracked;
            }
        }
        self.last_touch = Some(touch);
    }

    /// Close time reached: pull everything and drop the market.
    pub fn plan_expiry(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.buy.is_some() {
            actions.push(Action::Cancel {
                side: OrderSide::Buy,
            });
        }
        if self.sell.is_some() {
            actions.push(Action::Cancel {
                side: OrderSide::Sell,
            });
        }
        self.phase = MarketPhase::Closed;
        actions.push(Action::Untrack);
        actions
    }

    /// Terminal path for a settled book. Idempotent while the IOC is in
    /// flight; the scheduler flips `cash_out_submitted` once the order is
    /// acknowledged, and the fill stream walks inventory down to zero.
    pub fn plan_cash_out(&mut self, inventory: i64, cash_out: Option<CashOut>) -> Vec<Action> {
        let mut actions = Vec::new();
        if inventory == 0 {
            if self.buy.is_some() {
                actions.push(Action::Cancel {
                    side: OrderSide::Buy,
                });
            }
            if self.sell.is_some() {
                actions.push(Action::Cancel {
                    side: OrderSide::Sell,
                });
            }
            self.phase = MarketPhase::Closed;
            actions.push(Action::Untrack);
            return actions;
        }
        if self.cash_out_submitted {
            return actions;
        }
        let Some(order) = cash_out else {
            // No resting price to hit yet; try again on a later book.
            return actions;
        };
        if self.buy.is_some() {
            actions.push(Action::Cancel {
                side: OrderSide::Buy,
            });
        }
        if self.sell.is_some() {
            actions.push(Action::Cancel {
                side: OrderSide::Sell,
            });
        }
        actions.push(Action::CashOut {
            side: order.side,
            price: order.price,
            size: order.size,
        });
        self.phase = MarketPhase::Exiting;
        actions
    }

    /// Reconcile desired quotes against live orders for one tick.
    pub fn plan_quotes(
        &mut self,
        decision: &QuoteDecision,
        inventory: i64,
        now: f64,
        settings: &Settings,
    ) -> Vec<Action> {
        match decision {
            QuoteDecision::Skip(SkipReason::Risk) => {
                let mut actions = self.cancel_both();
                if inventory == 0 {
                    self.phase = MarketPhase::Closed;
                    actions.push(Action::Untrack);
                } else {
                    self.phase = MarketPhase::Exiting;
                }
                actions
            }
            QuoteDecision::Skip(SkipReason::LipTargetMet) => {
                let mut actions = self.cancel_both();
                if inventory == 0 {
                    self.phase = MarketPhase::Closed;
                    actions.push(Action::Untrack);
                } else {
                    self.phase = MarketPhase::Exiting;
                }
                actions
            }
            QuoteDecision::Skip(SkipReason::ExtremePrice) => {
                let actions = self.cancel_both();
                self.phase = MarketPhase::Blocked;
                actions
            }
            // Too thin to judge; keep what is resting and wait.
            QuoteDecision::Skip(SkipReason::ThinBook) => Vec::new(),
            QuoteDecision::Quote { bid, ask } => self.reconcile(bid, ask, inventory, now, settings),
        }
    }

    fn reconcile(
        &mut self,
        bid: &Option<QuoteLevel>,
        ask: &Option<QuoteLevel>,
        inventory: i64,
        now: f64,
        settings: &Settings,
    ) -> Vec<Action> {
        let mut desired_bid = bid.clone();
        let mut desired_ask = ask.clone();

        if self.phase == MarketPhase::Exiting {
            if inventory == 0 {
                let mut actions = self.cancel_both();
                self.phase = MarketPhase::Closed;
                actions.push(Action::Untrack);
                return actions;
            }
            // Reduce-only: quote the flattening side, capped at the position.
            if inventory > 0 {
                desired_bid = None;
                if let Some(a) = desired_ask.as_mut() {
                    a.size = a.size.min(inventory);
                }
            } else {
                desired_ask = None;
                if let Some(b) = desired_bid.as_mut() {
                    b.size = b.size.min(-inventory);
                }
            }
        } else {
            self.phase = MarketPhase::Quoting;
        }

        // Hard inventory cap: the growing side is suppressed outright.
        if inventory >= settings.max_position {
            desired_bid = None;
        }
        if inventory <= -settings.max_position {
            desired_ask = None;
        }

        let mut actions = Vec::new();
        let mut placed_or_improved = false;
        for (side, desired) in [
            (OrderSide::Buy, &desired_bid),
            (OrderSide::Sell, &desired_ask),
        ] {
            self.reconcile_side(side, desired, now, settings, &mut actions, &mut placed_or_improved);
        }
        if placed_or_improved {
            self.last_improvement_ts = now;
        }
        actions
    }

    fn reconcile_side(
        &mut self,
        side: OrderSide,
        desired: &Option<QuoteLevel>,
        now: f64,
        settings: &Settings,
        actions: &mut Vec<Action>,
        placed_or_improved: &mut bool,
    ) {
        let live_price = self.live(side).map(|o| o.price);
        match (live_price, desired) {
            (None, None) => {}
            (Some(_), None) => actions.push(Action::Cancel { side }),
            (None, Some(q)) => {
                if now - self.last_improvement_ts >= settings.improve_cooldown_secs {
                    actions.push(Action::Place {
                        side,
                        price: q.price,
                        size: q.size,
                    });
                    *placed_or_improved = true;
                }
            }
            (Some(p), Some(q)) if p == q.price => {}
            (Some(p), Some(q)) => {
                let improving = match side {
                    OrderSide::Buy => q.price > p,
                    OrderSide::Sell => q.price < p,
                };
                if improving {
                    if settings.improve_once_per_touch && self.improved_this_touch {
                        return;
                    }
                    if now - self.last_improvement_ts < settings.improve_cooldown_secs {
                        return;
                    }
                    self.improved_this_touch = true;
                    *placed_or_improved = true;
                }
                actions.push(Action::Cancel { side });
                actions.push(Action::Place {
                    side,
                    price: q.price,
                    size: q.size,
                });
            }
        }
    }

    /// Reactive path: a best-bid move reprices the resting sell while long.
    /// Gated by its own cooldown; never touches the buy side.
    pub fn plan_reactive_ask(
        &mut self,
        desired_ask: Option<&QuoteLevel>,
        inventory: i64,
        now: f64,
        settings: &Settings,
    ) -> Vec<Action> {
        if inventory <= 0 {
            return Vec::new();
        }
        if matches!(self.phase, MarketPhase::Blocked | MarketPhase::Closed) {
            return Vec::new();
        }
        let cooldown = settings.orderbook_update_cooldown_ms as f64 / 1000.0;
        if now - self.last_reactive_ts < cooldown {
            return Vec::new();
        }
        let (Some(live), Some(q)) = (self.live(OrderSide::Sell), desired_ask) else {
            return Vec::new();
        };
        if live.price == q.price {
            return Vec::new();
        }
        self.last_reactive_ts = now;
        let mut size = q.size;
        if self.phase == MarketPhase::Exiting {
            size = size.min(inventory);
        }
        vec![
            Action::Cancel {
                side: OrderSide::Sell,
            },
            Action::Place {
                side: OrderSide::Sell,
                price: q.price,
                size,
            },
        ]
    }

    fn cancel_both(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.buy.is_some() {
            actions.push(Action::Cancel {
                side: OrderSide::Buy,
            });
        }
        if self.sell.is_some() {
            actions.push(Action::Cancel {
                side: OrderSide::Sell,
            });
        }
        actions
    }
}
