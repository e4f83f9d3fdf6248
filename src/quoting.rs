use crate::config::Settings;
use crate::exchange::OrderSide;
use crate::math::{Cents, MAX_TICK, MIN_TICK};

/// Quotes at the exact edge ticks are never worth resting.
const DEGENERATE_LOW: Cents = 2;
const DEGENERATE_HIGH: Cents = 98;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Risk,
    LipTargetMet,
    ExtremePrice,
    ThinBook,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Risk => "risk",
            SkipReason::LipTargetMet => "lip_target_met",
            SkipReason::ExtremePrice => "extreme_price",
            SkipReason::ThinBook => "thin_book",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandLevel {
    pub price: Cents,
    pub size: i64,
    pub ticks_from_best: i64,
    pub multiplier: f64,
}

/// Walk the ladder best-first until the resting size covers the target.
/// A book that cannot cover it has no qualifying band.
pub fn build_qualifying_band(
    levels: &[(Cents, i64)],
    target: i64,
    discount: f64,
) -> Option<Vec<BandLevel>> {
    if target <= 0 || levels.is_empty() {
        return None;
    }
    let p_best = levels[0].0;
    let mut band = Vec::new();
    let mut accumulated = 0i64;
    for &(price, size) in levels {
        let ticks = (price - p_best).abs();
        band.push(BandLevel {
            price,
            size,
            ticks_from_best: ticks,
            multiplier: discount.powi(ticks as i32),
        });
        accumulated += band.last().map(|l| l.size).unwrap_or(0);
        if accumulated >= target {
            return Some(band);
        }
    }
    None
}

/// Share of the target already resting at the touch.
pub fn lip_intensity(levels: &[(Cents, i64)], target: i64) -> f64 {
    if target <= 0 {
        return 0.0;
    }
    let at_best = levels.first().map(|&(_, s)| s).unwrap_or(0);
    at_best as f64 / target as f64
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuoteLevel {
    pub price: Cents,
    pub size: i64,
    pub ticks_from_best: i64,
    pub multiplier: f64,
}

/// Result of one policy evaluation. Derived fresh each tick and never kept.
#[derive(Debug, Clone, PartialEq)]
pub enum QuoteDecision {
    Quote {
        bid: Option<QuoteLevel>,
        ask: Option<QuoteLevel>,
    },
    Skip(SkipReason),
}

pub struct QuotePolicy {
    settings: Settings,
}

impl QuotePolicy {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Extra ticks behind the touch once inventory is inside the skew zone.
    /// Only the side that would grow the position is pushed back.
    fn skew_ticks(&self, inventory: i64, side: OrderSide) -> i64 {
        let grows = match side {
            OrderSide::Buy => inventory > 0,
            OrderSide::Sell => inventory < 0,
        };
        if !grows {
            return 0;
        }
        let frac = inventory.unsigned_abs() as f64 / self.settings.max_position as f64;
        if frac < self.settings.position_limit_buffer {
            return 0;
        }
        (self.settings.inventory_skew_factor * frac * 3.0).floor() as i64
    }

    /// Decide both sides of the quote from the current ladders. `yes_levels`
    /// and `no_levels` are bid ladders best-first; the ask is priced off the
    /// NO ladder (`ask = 100 - no_bid`).
    pub fn desired_quote(
        &self,
        yes_levels: &[(Cents, i64)],
        no_levels: &[(Cents, i64)],
        lip_target: i64,
        risk_score: f64,
        inventory: i64,
    ) -> QuoteDecision {
        let s = &self.settings;
        let target = s.quote_size(lip_target);

        if s.lip_enabled && risk_score > s.lip_risk_threshold {
            return QuoteDecision::Skip(SkipReason::Risk);
        }

        let base_ticks = if !s.lip_enabled {
            0
        } else if risk_score < s.lip_medium_risk_threshold {
            0
        } else if risk_score < s.lip_high_risk_threshold {
            1
        } else {
            return QuoteDecision::Skip(SkipReason::Risk);
        };

        // A zero or crossed touch cannot host a two-sided quote; this fires
        // before the rebate check so the market parks in Blocked rather than
        // untracking on a transiently pinned book.
        if let (Some(&(best_bid, _)), Some(&(best_no, _))) =
            (yes_levels.first(), no_levels.first())
        {
            if 100 - best_no <= best_bid {
                return QuoteDecision::Skip(SkipReason::ExtremePrice);
            }
        }

        // Someone else already rests the full target at a touch; the rebate
        // is gone no matter which ladder carries it, so the market winds
        // down instead of quoting around it.
        if s.lip_enabled && lip_target > 0 {
            let yes_at_best = yes_levels.first().map(|&(_, sz)| sz).unwrap_or(0);
            let no_at_best = no_levels.first().map(|&(_, sz)| sz).unwrap_or(0);
            if yes_at_best >= lip_target || no_at_best >= lip_target {
                return QuoteDecision::Skip(SkipReason::LipTargetMet);
            }
        }

        // Either ladder failing to cover the target means the book cannot
        // support a two-sided quote at all.
        let bid_band = build_qualifying_band(yes_levels, target, s.lip_discount_factor);
        let ask_band = build_qualifying_band(no_levels, target, s.lip_discount_factor);
        if bid_band.is_none() || ask_band.is_none() {
            return QuoteDecision::Skip(SkipReason::ThinBook);
        }

        let mut bid = bid_band.as_deref().map(|band| {
            let best_bid = band[0].price;
            let max_ticks = band.last().map(|l| l.ticks_from_best).unwrap_or(0);
            let ticks = (base_ticks + self.skew_ticks(inventory, OrderSide::Buy)).min(max_ticks);
            QuoteLevel {
                price: (best_bid - ticks).clamp(MIN_TICK, MAX_TICK),
                size: target,
                ticks_from_best: ticks,
                multiplier: s.lip_discount_factor.powi(ticks as i32),
            }
        });

        let mut ask = ask_band.as_deref().map(|band| {
            let best_ask = 100 - band[0].price;
            let max_ticks = band.last().map(|l| l.ticks_from_best).unwrap_or(0);
            let ticks = (base_ticks + self.skew_ticks(inventory, OrderSide::Sell)).min(max_ticks);
            QuoteLevel {
                price: (best_ask + ticks).clamp(MIN_TICK, MAX_TICK),
                size: target,
                ticks_from_best: ticks,
                multiplier: s.lip_discount_factor.powi(ticks as i32),
            }
        });

        // Width floor: widen both sides symmetrically around the midpoint,
        // never toward the touch.
        if let (Some(b), Some(a)) = (bid.as_mut(), ask.as_mut()) {
            let width = a.price - b.price;
            if width < s.min_quote_width_cents {
                let deficit = s.min_quote_width_cents - width;
                let down = (deficit + 1) / 2;
                b.price -= down;
                b.ticks_from_best += down;
                b.multiplier = s.lip_discount_factor.powi(b.ticks_from_best as i32);
                let up = deficit - down;
                a.price += up;
                a.ticks_from_best += up;
                a.multiplier = s.lip_discount_factor.powi(a.ticks_from_best as i32);
            }
        }

        let out_of_range = |q: &QuoteLevel| q.price < DEGENERATE_LOW || q.price > DEGENERATE_HIGH;
        if bid.as_ref().is_some_and(out_of_range) || ask.as_ref().is_some_and(out_of_range) {
            return QuoteDecision::Skip(SkipReason::ExtremePrice);
        }
        if let (Some(b), Some(a)) = (bid.as_ref(), ask.as_ref()) {
            if a.price <= b.price {
                return QuoteDecision::Skip(SkipReason::ExtremePrice);
            }
        }

        QuoteDecision::Quote { bid, ask }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_settings;

    fn policy() -> QuotePolicy {
        QuotePolicy::new(test_settings())
    }

    #[test]
    fn band_accumulates_until_target() {
        let levels = vec![(45, 60), (44, 30), (42, 40)];
        let band = build_qualifying_band(&levels, 100, 0.95).unwrap();
        assert_eq!(band.len(), 3);
        assert_eq!(band[0].ticks_from_best, 0);
        assert_eq!(band[1].ticks_from_best, 1);
        assert_eq!(band[2].ticks_from_best, 3);
        assert!((band[2].multiplier - 0.95f64.powi(3)).abs() < 1e-12);
    }

    #[test]
    fn thin_book_has_no_band() {
        assert!(build_qualifying_band(&[(45, 60)], 100, 0.95).is_none());
        assert!(build_qualifying_band(&[], 100, 0.95).is_none());
    }

    #[test]
    fn lip_intensity_is_best_size_over_target() {
        assert_eq!(lip_intensity(&[(45, 50)], 100), 0.5);
        assert_eq!(lip_intensity(&[], 100), 0.0);
    }

    #[test]
    fn zero_spread_touch_is_degenerate() {
        // yes 45 bid vs no 55 bid puts the synthesized ask at 45 too.
        let d = policy().desired_quote(&[(45, 200)], &[(55, 200)], 100, 0.03, 0);
        assert_eq!(d, QuoteDecision::Skip(SkipReason::ExtremePrice));
    }

    #[test]
    fn low_risk_joins_the_touch() {
        let d = policy().desired_quote(&[(45, 80), (44, 80)], &[(52, 80), (51, 80)], 100, 0.03, 0);
        let QuoteDecision::Quote { bid, ask } = d else {
            panic!("expected quote, got {d:?}");
        };
        let bid = bid.unwrap();
        let ask = ask.unwrap();
        assert_eq!(bid.price, 45);
        assert_eq!(ask.price, 48);
        assert_eq!(bid.size, 100);
        assert_eq!(bid.ticks_from_best, 0);
    }

    #[test]
    fn medium_risk_sits_one_tick_behind() {
        let d = policy().desired_quote(&[(45, 60), (44, 60)], &[(52, 60), (51, 60)], 100, 2.0, 0);
        let QuoteDecision::Quote { bid, ask } = d else {
            panic!("expected quote, got {d:?}");
        };
        assert_eq!(bid.unwrap().price, 44);
        assert_eq!(ask.unwrap().price, 49);
    }

    #[test]
    fn high_risk_bucket_skips() {
        let d = policy().desired_quote(&[(45, 200)], &[(52, 200)], 100, 2.7, 0);
        assert_eq!(d, QuoteDecision::Skip(SkipReason::Risk));
    }

    #[test]
    fn above_threshold_skips() {
        let d = policy().desired_quote(&[(45, 200)], &[(52, 200)], 100, 3.2, 0);
        assert_eq!(d, QuoteDecision::Skip(SkipReason::Risk));
    }

    #[test]
    fn lip_target_met_at_best_bid() {
        let d = policy().desired_quote(&[(30, 500)], &[(65, 40)], 100, 0.5, 0);
        assert_eq!(d, QuoteDecision::Skip(SkipReason::LipTargetMet));
    }

    #[test]
    fn lip_target_met_at_best_no_bid() {
        // The NO ladder carrying the full target skips the market the same
        // way the YES ladder does.
        let d = policy().desired_quote(&[(45, 80), (44, 80)], &[(52, 200)], 100, 0.5, 0);
        assert_eq!(d, QuoteDecision::Skip(SkipReason::LipTargetMet));
    }

    #[test]
    fn empty_book_skips_thin() {
        let d = policy().desired_quote(&[], &[], 100, 0.5, 0);
        assert_eq!(d, QuoteDecision::Skip(SkipReason::ThinBook));
    }

    #[test]
    fn one_sided_book_skips_entirely() {
        let d = policy().desired_quote(&[(45, 80)], &[(52, 40)], 100, 0.03, 0);
        assert_eq!(d, QuoteDecision::Skip(SkipReason::ThinBook));
        let d = policy().desired_quote(&[(45, 80)], &[], 100, 0.03, 0);
        assert_eq!(d, QuoteDecision::Skip(SkipReason::ThinBook));
    }

    #[test]
    fn target_ticks_clamp_to_band_depth() {
        // The skew wants five ticks back but the band is only two deep.
        let mut s = test_settings();
        s.inventory_skew_factor = 2.0;
        let p = QuotePolicy::new(s);
        let d = p.desired_quote(
            &[(45, 40), (44, 40), (43, 40)],
            &[(52, 40), (51, 40), (50, 40)],
            100,
            0.03,
            90,
        );
        let QuoteDecision::Quote { bid, .. } = d else {
            panic!("expected quote, got {d:?}");
        };
        assert_eq!(bid.unwrap().price, 43);
    }

    #[test]
    fn never_improves_the_touch() {
        for risk in [0.05, 1.0, 2.0] {
            let d = policy().desired_quote(&[(45, 60), (44, 60)], &[(52, 60), (51, 60)], 100, risk, 0);
            if let QuoteDecision::Quote { bid, ask } = d {
                if let Some(b) = bid {
                    assert!(b.price <= 45);
                }
                if let Some(a) = ask {
                    assert!(a.price >= 48);
                }
            }
        }
    }

    #[test]
    fn inventory_skew_pushes_growing_side_back() {
        let mut s = test_settings();
        s.inventory_skew_factor = 1.0; // make the floor() land on whole ticks
        let p = QuotePolicy::new(s);
        let book_yes = vec![(45, 40), (44, 40), (43, 40)];
        let book_no = vec![(52, 40), (51, 40), (50, 40)];
        let flat = p.desired_quote(&book_yes, &book_no, 100, 0.03, 0);
        let long = p.desired_quote(&book_yes, &book_no, 100, 0.03, 90);
        let (QuoteDecision::Quote { bid: fb, .. }, QuoteDecision::Quote { bid: lb, ask: la }) =
            (flat, long)
        else {
            panic!("expected quotes");
        };
        // Long inventory backs the bid off; the ask is untouched.
        assert_eq!(fb.unwrap().price, 45);
        assert_eq!(lb.unwrap().price, 43);
        assert_eq!(la.unwrap().price, 48);
    }

    #[test]
    fn skew_waits_for_the_buffer_zone() {
        let mut s = test_settings();
        s.inventory_skew_factor = 1.0;
        let p = QuotePolicy::new(s);
        let book_yes = vec![(45, 40), (44, 40), (43, 40)];
        let book_no = vec![(52, 40), (51, 40), (50, 40)];
        let d = p.desired_quote(&book_yes, &book_no, 100, 0.03, 10);
        let QuoteDecision::Quote { bid, .. } = d else {
            panic!("expected quote");
        };
        assert_eq!(bid.unwrap().price, 45);
    }

    #[test]
    fn width_floor_widens_symmetrically() {
        let mut s = test_settings();
        s.min_quote_width_cents = 5;
        let p = QuotePolicy::new(s);
        let d = p.desired_quote(&[(45, 60), (44, 60), (43, 60)], &[(52, 60), (51, 60), (50, 60)], 100, 0.03, 0);
        let QuoteDecision::Quote { bid, ask } = d else {
            panic!("expected quote, got {d:?}");
        };
        let b = bid.unwrap();
        let a = ask.unwrap();
        assert!(a.price - b.price >= 5);
        assert_eq!(b.price, 44);
        assert_eq!(a.price, 49);
    }
}
