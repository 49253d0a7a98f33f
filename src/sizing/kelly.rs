/// Edge and Kelly stake mathematics on American prices.
///
/// The Kelly formula sizes a bet to maximise the expected logarithm of wealth:
///   f* = (b·p − q) / b
/// where
///   b  = net odds received on the bet (decimal multiplier − 1)
///   p  = estimated probability of winning
///   q  = 1 − p
///
/// A *fractional* Kelly multiplier (0 < multiplier ≤ 1) trades a little growth
/// for a large cut in variance. All functions here are pure.
use rust_decimal::Decimal;

use crate::error::{Error, Result};

/// Reject zero and the malformed band strictly between −100 and +100.
fn check_price(price: i32) -> Result<()> {
    if price.unsigned_abs() < 100 {
        return Err(Error::InvalidPrice { price });
    }
    Ok(())
}

fn check_probability(probability: f64) -> Result<()> {
    if !(probability > 0.0 && probability < 1.0) {
        return Err(Error::InvalidProbability { probability });
    }
    Ok(())
}

/// Decimal multiplier (stake returned per unit on a win) for an American price.
///
/// +150 → 2.5, −150 → 1.6667
pub fn american_to_decimal(price: i32) -> Result<f64> {
    check_price(price)?;
    let price = price as f64;
    if price > 0.0 {
        Ok(1.0 + price / 100.0)
    } else {
        Ok(1.0 + 100.0 / -price)
    }
}

/// Nearest American price for a decimal multiplier.
pub fn decimal_to_american(decimal: f64) -> Result<i32> {
    if !decimal.is_finite() || decimal <= 1.0 {
        return Err(Error::InvalidDecimalOdds { decimal });
    }
    let american = if decimal >= 2.0 {
        (decimal - 1.0) * 100.0
    } else {
        -100.0 / (decimal - 1.0)
    };
    Ok(american.round() as i32)
}

/// Break-even probability implied by a price (no vig removal).
pub fn implied_probability(price: i32) -> Result<f64> {
    Ok(1.0 / american_to_decimal(price)?)
}

/// Net odds `b`: profit per unit staked on a win.
pub fn net_odds(price: i32) -> Result<f64> {
    Ok(american_to_decimal(price)? - 1.0)
}

/// Expected value of a unit stake: `p · decimal(price) − 1`.
///
/// Positive edge means the price underrates the true probability.
pub fn edge(probability: f64, price: i32) -> Result<f64> {
    check_probability(probability)?;
    Ok(probability * american_to_decimal(price)? - 1.0)
}

/// Expected profit of staking `stake` at `price`.
pub fn expected_value(probability: f64, price: i32, stake: f64) -> Result<f64> {
    Ok(stake * edge(probability, price)?)
}

/// Unconstrained full-Kelly fraction, floored at zero.
pub fn full_kelly_fraction(probability: f64, price: i32) -> Result<f64> {
    check_probability(probability)?;
    let b = net_odds(price)?;
    let q = 1.0 - probability;
    let f = (b * probability - q) / b;
    Ok(f.max(0.0))
}

/// Fractional Kelly stake clamped to `[0, max_single_bet]`.
///
/// Returns `0.0` whenever the edge is non-positive.
pub fn single_bet_kelly_fraction(
    probability: f64,
    price: i32,
    kelly_fraction: f64,
    max_single_bet: f64,
) -> Result<f64> {
    let f = full_kelly_fraction(probability, price)?;
    if f <= 0.0 {
        return Ok(0.0); // no edge
    }
    Ok((f * kelly_fraction).clamp(0.0, max_single_bet.max(0.0)))
}

/// Winnings (excluding the returned stake) on a winning bet, to the cent.
pub fn american_profit(stake: Decimal, price: i32) -> Result<Decimal> {
    check_price(price)?;
    let price = Decimal::from(price);
    let winnings = if price.is_sign_positive() {
        stake * price / Decimal::ONE_HUNDRED
    } else {
        stake * Decimal::ONE_HUNDRED / -price
    };
    Ok(winnings.round_dp(2))
}

/// Closing-line value: implied probability at close minus at placement.
///
/// Positive when the market moved toward our side after we bet, i.e. we got a
/// better price than the close.
pub fn closing_line_value(placed_price: i32, closing_price: i32) -> Result<f64> {
    Ok(implied_probability(closing_price)? - implied_probability(placed_price)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rust_decimal_macros::dec;

    #[test]
    fn test_decimal_conversion() {
        assert_relative_eq!(american_to_decimal(150).unwrap(), 2.5, epsilon = 1e-12);
        assert_relative_eq!(american_to_decimal(-200).unwrap(), 1.5, epsilon = 1e-12);
        assert_relative_eq!(american_to_decimal(100).unwrap(), 2.0, epsilon = 1e-12);
        assert_relative_eq!(american_to_decimal(-100).unwrap(), 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_and_malformed_price() {
        assert_eq!(american_to_decimal(0), Err(Error::InvalidPrice { price: 0 }));
        assert_eq!(implied_probability(50), Err(Error::InvalidPrice { price: 50 }));
        assert_eq!(edge(0.5, -99), Err(Error::InvalidPrice { price: -99 }));
    }

    #[test]
    fn test_probability_out_of_range() {
        assert!(matches!(edge(0.0, 110), Err(Error::InvalidProbability { .. })));
        assert!(matches!(edge(1.0, 110), Err(Error::InvalidProbability { .. })));
        assert!(matches!(
            full_kelly_fraction(f64::NAN, 110),
            Err(Error::InvalidProbability { .. })
        ));
    }

    #[test]
    fn test_conversions_round_trip() {
        for price in [-1000, -250, -130, -105, -100, 100, 101, 110, 145, 300, 2500] {
            let decimal = american_to_decimal(price).unwrap();
            let back = decimal_to_american(decimal).unwrap();
            // -100 and +100 are the same quote
            if price.abs() == 100 {
                assert_eq!(back.abs(), 100);
            } else {
                assert_eq!(back, price);
            }
            assert_relative_eq!(
                implied_probability(price).unwrap(),
                1.0 / decimal,
                epsilon = 1e-12
            );
        }
        for decimal in [1.05, 1.5, 1.909, 2.0, 2.1, 3.75, 11.0] {
            let american = decimal_to_american(decimal).unwrap();
            assert_relative_eq!(
                american_to_decimal(american).unwrap(),
                decimal,
                epsilon = 5e-3
            );
        }
    }

    #[test]
    fn test_decimal_to_american_rejects_invalid() {
        assert!(decimal_to_american(1.0).is_err());
        assert!(decimal_to_american(f64::INFINITY).is_err());
    }

    #[test]
    fn test_edge_calculation() {
        // 60% at +100 → 20% edge
        assert_relative_eq!(edge(0.6, 100).unwrap(), 0.2, epsilon = 1e-12);
        // 51% at -105 is a losing bet
        assert!(edge(0.51, -105).unwrap() < 0.0);
    }

    #[test]
    fn test_kelly_positive_edge() {
        // b = 1, p = 0.6 → f = 0.2
        assert_relative_eq!(full_kelly_fraction(0.6, 100).unwrap(), 0.2, epsilon = 1e-12);
        let quarter = single_bet_kelly_fraction(0.6, 100, 0.25, 1.0).unwrap();
        assert_relative_eq!(quarter, 0.05, epsilon = 1e-12);
    }

    #[test]
    fn test_kelly_clamped_to_max_single_bet() {
        let f = single_bet_kelly_fraction(0.7, 100, 1.0, 0.05).unwrap();
        assert_relative_eq!(f, 0.05, epsilon = 1e-12);
    }

    #[test]
    fn test_kelly_zero_when_edge_not_positive() {
        for (p, price) in [(0.5, -110), (0.51, -105), (0.3, 200), (0.5, 100)] {
            assert!(edge(p, price).unwrap() <= 1e-12);
            assert_eq!(single_bet_kelly_fraction(p, price, 0.25, 0.05).unwrap(), 0.0);
        }
    }

    #[test]
    fn test_profit_and_clv() {
        assert_eq!(american_profit(dec!(100), 150).unwrap(), dec!(150));
        assert_eq!(american_profit(dec!(130), -130).unwrap(), dec!(100));
        assert_eq!(american_profit(dec!(10), -110).unwrap(), dec!(9.09));
        assert!(american_profit(dec!(10), 50).is_err());
        // bet at +120, closed at +100: beat the close
        let clv = closing_line_value(120, 100).unwrap();
        assert_relative_eq!(clv, 0.5 - 1.0 / 2.2, epsilon = 1e-12);
        assert!(closing_line_value(-110, -105).unwrap() < 0.0);
    }

    #[test]
    fn test_expected_value_scales_stake() {
        assert_relative_eq!(expected_value(0.6, 100, 50.0).unwrap(), 10.0, epsilon = 1e-9);
    }
}
