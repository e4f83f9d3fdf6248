use crate::book::Touch;
use crate::exchange::OrderSide;
use crate::math::{tick_to_price, Cents};

pub const EDGE_HIGH: f64 = 0.985;
pub const EDGE_LOW: f64 = 0.015;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Yes,
    No,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Yes => "yes",
            Resolution::No => "no",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionCheck {
    Unresolved,
    Resolved(Resolution),
    /// The two ladders claim opposite outcomes; stand down this tick.
    Contradictory,
}

/// Read the four quotes off the touch and vote on the outcome. The YES ask
/// and NO ask are synthesized from the opposing bids, so each ladder
/// contributes one independent signal.
pub fn detect_resolution(touch: &Touch) -> ResolutionCheck {
    let yes_bid = touch.yes_bid.map(tick_to_price);
    let no_bid = touch.no_bid.map(tick_to_price);
    let yes_ask = no_bid.map(|p| 1.0 - p);
    let no_ask = yes_bid.map(|p| 1.0 - p);

    let mut votes_yes = false;
    let mut votes_no = false;
    if yes_bid.is_some_and(|p| p >= EDGE_HIGH) {
        votes_yes = true;
    }
    if yes_ask.is_some_and(|p| p <= EDGE_LOW) {
        votes_no = true;
    }
    if no_bid.is_some_and(|p| p >= EDGE_HIGH) {
        votes_no = true;
    }
    if no_ask.is_some_and(|p| p <= EDGE_LOW) {
        votes_yes = true;
    }

    match (votes_yes, votes_no) {
        (false, false) => ResolutionCheck::Unresolved,
        (true, false) => ResolutionCheck::Resolved(Resolution::Yes),
        (false, true) => ResolutionCheck::Resolved(Resolution::No),
        (true, true) => ResolutionCheck::Contradictory,
    }
}

/// Terminal order closing the whole position, always expressed in YES
/// contracts: longs sell to the best bid, shorts buy back from the best ask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CashOut {
    pub side: OrderSide,
    pub price: Cents,
    pub size: i64,
}

/// None when flat, or when the side we must hit has no resting price yet;
/// the caller retries on a later book.
pub fn cash_out_order(inventory: i64, touch: &Touch) -> Option<CashOut> {
    if inventory > 0 {
        touch.yes_bid.map(|price| CashOut {
            side: OrderSide::Sell,
            price,
            size: inventory,
        })
    } else if inventory < 0 {
        touch.yes_ask.map(|price| CashOut {
            side: OrderSide::Buy,
            price,
            size: -inventory,
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(yes_bid: Option<Cents>, no_bid: Option<Cents>) -> Touch {
        Touch {
            yes_bid,
            yes_ask: no_bid.map(|p| 100 - p),
            yes_bid_size: yes_bid.map(|_| 50).unwrap_or(0),
            no_bid,
            no_bid_size: no_bid.map(|_| 200).unwrap_or(0),
        }
    }

    #[test]
    fn yes_at_ninety_nine_resolves_yes() {
        // NO bid rounded up from half a cent still reads as a YES win.
        let t = touch(Some(99), Some(1));
        assert_eq!(detect_resolution(&t), ResolutionCheck::Resolved(Resolution::Yes));
    }

    #[test]
    fn no_at_ninety_nine_resolves_no() {
        let t = touch(Some(1), Some(99));
        assert_eq!(detect_resolution(&t), ResolutionCheck::Resolved(Resolution::No));
    }

    #[test]
    fn mid_market_is_unresolved() {
        let t = touch(Some(45), Some(55));
        assert_eq!(detect_resolution(&t), ResolutionCheck::Unresolved);
    }

    #[test]
    fn both_bids_pinned_high_is_contradictory() {
        let t = touch(Some(99), Some(99));
        assert_eq!(detect_resolution(&t), ResolutionCheck::Contradictory);
    }

    #[test]
    fn one_sided_extreme_book_still_resolves() {
        let t = touch(Some(99), None);
        assert_eq!(detect_resolution(&t), ResolutionCheck::Resolved(Resolution::Yes));
        let t = touch(None, Some(99));
        assert_eq!(detect_resolution(&t), ResolutionCheck::Resolved(Resolution::No));
    }

    #[test]
    fn long_inventory_sells_to_the_bid() {
        let t = touch(Some(99), Some(1));
        let c = cash_out_order(80, &t).unwrap();
        assert_eq!(
            c,
            CashOut {
                side: OrderSide::Sell,
                price: 99,
                size: 80
            }
        );
    }

    #[test]
    fn short_inventory_buys_from_the_ask() {
        let t = touch(Some(1), Some(99));
        let c = cash_out_order(-30, &t).unwrap();
        assert_eq!(
            c,
            CashOut {
                side: OrderSide::Buy,
                price: 1,
                size: 30
            }
        );
    }

    #[test]
    fn flat_or_missing_reference_yields_none() {
        let t = touch(Some(99), Some(1));
        assert!(cash_out_order(0, &t).is_none());
        let t = touch(None, Some(1));
        assert!(cash_out_order(10, &t).is_none());
    }
}
