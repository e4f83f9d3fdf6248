/// Price in whole cents on the exchange grid [1, 99].
pub type Cents = i64;

pub const MIN_TICK: Cents = 1;
pub const MAX_TICK: Cents = 99;

/// Wall-clock seconds since the epoch. A clock set before 1970 reads as 0
/// rather than erroring; every consumer treats 0 as "never".
pub fn now_ts() -> f64 {
    std::time::UNIX_EPOCH
        .elapsed()
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Round a dollar price to the nearest cent, clamped to the valid grid.
pub fn to_tick(price: f64) -> Cents {
    ((price * 100.0).round() as Cents).clamp(MIN_TICK, MAX_TICK)
}

pub fn tick_to_price(tick: Cents) -> f64 {
    tick as f64 / 100.0
}

/// Log-odds transform. Only meaningful for interior prices; callers must
/// exclude the 1c/99c edges before taking returns.
pub fn logit(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

/// Exponentially weighted average, seeded by the first observation.
pub fn ewma(prev: Option<f64>, x: f64, alpha: f64) -> f64 {
    let Some(y) = prev else {
        return x;
    };
    y + alpha * (x - y)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_tick_rounds_and_clamps() {
        assert_eq!(to_tick(0.454), 45);
        assert_eq!(to_tick(0.455), 46);
        assert_eq!(to_tick(0.0), 1);
        assert_eq!(to_tick(1.0), 99);
        assert_eq!(to_tick(-3.0), 1);
    }

    #[test]
    fn to_tick_is_idempotent_on_the_grid() {
        for c in MIN_TICK..=MAX_TICK {
            let p = tick_to_price(c);
            assert_eq!(to_tick(p), c);
            assert_eq!(to_tick(tick_to_price(to_tick(p))), to_tick(p));
        }
    }

    #[test]
    fn logit_is_odd_around_half() {
        assert!(logit(0.5).abs() < 1e-12);
        assert!((logit(0.7) + logit(0.3)).abs() < 1e-12);
    }

    #[test]
    fn ewma_seeds_with_first_sample() {
        assert_eq!(ewma(None, 3.0, 0.3), 3.0);
        let y = ewma(Some(3.0), 5.0, 0.3);
        assert!((y - (0.3 * 5.0 + 0.7 * 3.0)).abs() < 1e-12);
    }
}
