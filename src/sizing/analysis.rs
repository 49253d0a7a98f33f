//! Back-of-envelope risk figures for a repeated betting strategy.
//!
//! These use the even-money approximation `w = 0.5 + edge / 2` for the win
//! rate; they are for reporting, not for sizing.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Probability of losing the whole bankroll betting `bet_size` per wager.
pub fn risk_of_ruin(edge: f64, bet_size: f64) -> f64 {
    if edge <= 0.0 {
        return 1.0;
    }
    if bet_size <= 0.0 {
        return 0.0;
    }
    let win_prob = 0.5 + edge / 2.0;
    if win_prob >= 1.0 {
        return 0.0;
    }
    let ratio = (1.0 - win_prob) / win_prob;
    ratio.powf(1.0 / bet_size).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyRisk {
    pub risk_of_ruin: f64,
    /// Expected log-growth per bet
    pub expected_growth: f64,
    /// Variance of a unit-stake return
    pub variance: f64,
    pub sharpe_ratio: f64,
    pub expected_max_drawdown: f64,
    /// Expected number of bets to double the bankroll; `None` without growth
    pub bets_to_double: Option<f64>,
}

pub fn analyze_strategy_risk(
    avg_edge: f64,
    avg_decimal_odds: f64,
    bet_size: f64,
    n_bets: usize,
) -> Result<StrategyRisk> {
    if !avg_decimal_odds.is_finite() || avg_decimal_odds <= 1.0 {
        return Err(Error::InvalidDecimalOdds {
            decimal: avg_decimal_odds,
        });
    }
    if !(bet_size > 0.0 && bet_size < 1.0) {
        return Err(Error::InvalidStake { stake: bet_size });
    }

    let p = (0.5 + avg_edge / 2.0).clamp(0.0, 1.0);
    let q = 1.0 - p;
    let b = avg_decimal_odds - 1.0;

    let variance = p * q * (1.0 + b).powi(2);
    let up = (1.0 + bet_size * b).ln();
    let down = (1.0 - bet_size).ln();
    let growth = p * up + q * down;
    let log_var = (p * up.powi(2) + q * down.powi(2) - growth.powi(2)).max(0.0);

    let sharpe_ratio = if log_var > 0.0 {
        growth / log_var.sqrt()
    } else {
        0.0
    };
    let bets_to_double = (growth > 0.0).then(|| 2f64.ln() / growth);
    let expected_max_drawdown = (2.0 * (n_bets as f64 * log_var).sqrt() * bet_size).min(1.0);

    Ok(StrategyRisk {
        risk_of_ruin: risk_of_ruin(avg_edge, bet_size),
        expected_growth: growth,
        variance,
        sharpe_ratio,
        expected_max_drawdown,
        bets_to_double,
    })
}

/// Named Kelly multipliers by risk appetite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KellyProfile {
    /// Roughly 1 in 9 chance of halving before doubling
    Aggressive,
    Moderate,
    Conservative,
    /// Proof-of-concept sizing
    UltraConservative,
}

impl KellyProfile {
    pub fn kelly_fraction(&self) -> f64 {
        match self {
            KellyProfile::Aggressive => 0.5,
            KellyProfile::Moderate => 0.35,
            KellyProfile::Conservative => 0.25,
            KellyProfile::UltraConservative => 0.125,
        }
    }

    /// Chance of the bankroll halving before it doubles, `1 / (1 + 2^(2/c − 1))`.
    pub fn halving_probability(&self) -> f64 {
        let c = self.kelly_fraction();
        1.0 / (1.0 + 2f64.powf(2.0 / c - 1.0))
    }
}
