//! Seeded paper-trading run over synthetic slates.
//!
//! Each day draws a handful of games with a hidden true home-win probability,
//! a noisy model estimate of it, a vigged market price and a closing price
//! near the fair line, then drives the engine through
//! plan → place → closing line → settle. Useful for exercising the whole
//! pipeline end to end; the model here has no real edge, so expect the
//! results to hover around the vig.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::engine::BettingEngine;
use crate::error::Result;
use crate::ledger::{money_to_f64, ClvSummary, Diagnosis, Performance};
use crate::models::{GameResult, Market, Opportunity, Selection};
use crate::sizing::analysis::{analyze_strategy_risk, StrategyRisk};
use crate::sizing::kelly::{american_to_decimal, decimal_to_american};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub days: u32,
    pub seed: u64,
    pub min_games: u32,
    pub max_games: u32,
    /// Book margin applied to the fair price
    pub vig: f64,
    /// Half-width of the uniform noise on the model estimate
    pub model_noise: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            days: 60,
            seed: 42,
            min_games: 5,
            max_games: 14,
            vig: 0.05,
            model_noise: 0.08,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationSummary {
    pub days: u32,
    pub games: usize,
    pub bets_placed: usize,
    /// Rejection counts keyed by reason
    pub rejections: BTreeMap<String, usize>,
    pub performance: Performance,
    pub clv: ClvSummary,
    pub clv_by_market: BTreeMap<Market, ClvSummary>,
    pub diagnosis: Diagnosis,
    /// `None` until at least one bet has been placed
    pub strategy_risk: Option<StrategyRisk>,
}

struct SyntheticGame {
    opportunity: Opportunity,
    closing_price: i32,
    result: GameResult,
}

fn draw_game(rng: &mut StdRng, config: &SimulationConfig, day: u32, idx: u32) -> Result<SyntheticGame> {
    let event_id = format!("sim-{}-{}", day, idx);
    let true_prob: f64 = rng.gen_range(0.35..=0.65);
    let noise = rng.gen_range(-config.model_noise..=config.model_noise);
    let model_prob = (true_prob + noise).clamp(0.30, 0.70);

    let price = decimal_to_american((1.0 - config.vig) / true_prob)?;
    let close_prob = (true_prob + rng.gen_range(-0.02..=0.02)).clamp(0.05, 0.95);
    let closing_price = decimal_to_american((1.0 - config.vig) / close_prob)?;

    let home_won = rng.gen::<f64>() < true_prob;
    let winner_runs = rng.gen_range(3..=9);
    let loser_runs = rng.gen_range(0..winner_runs);
    let (home_score, away_score) = if home_won {
        (winner_runs, loser_runs)
    } else {
        (loser_runs, winner_runs)
    };

    Ok(SyntheticGame {
        opportunity: Opportunity::new(
            event_id.clone(),
            Selection::Home,
            format!("home-{}", idx),
            model_prob,
            price,
            None,
        )?,
        closing_price,
        result: GameResult {
            event_id,
            home_score,
            away_score,
            total_runs: None,
        },
    })
}

/// Drive `engine` through `config.days` synthetic days.
pub fn run_simulation(engine: &mut BettingEngine, config: &SimulationConfig) -> Result<SimulationSummary> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut games = 0;
    let mut bets_placed = 0;
    let mut rejections: BTreeMap<String, usize> = BTreeMap::new();

    for day in 0..config.days {
        if day > 0 {
            if day % 7 == 0 {
                engine.start_new_week();
            } else {
                engine.start_new_day();
            }
        }

        let n_games = rng.gen_range(config.min_games..=config.max_games.max(config.min_games));
        let slate = (0..n_games)
            .map(|i| draw_game(&mut rng, config, day, i))
            .collect::<Result<Vec<_>>>()?;
        games += slate.len();

        let opportunities: Vec<Opportunity> =
            slate.iter().map(|g| g.opportunity.clone()).collect();
        let report = engine.place_slate(&opportunities)?;
        bets_placed += report.placed.len();
        for rejection in &report.rejected {
            *rejections
                .entry(rejection.reason.as_str().to_string())
                .or_insert(0) += 1;
        }

        for order in &report.placed {
            if let Some(game) = slate.iter().find(|g| g.result.event_id == order.event_id) {
                engine.record_closing_price(&order.id, game.closing_price)?;
            }
        }
        let results: Vec<GameResult> = slate.into_iter().map(|g| g.result).collect();
        let settled = engine.settle(&results);
        debug!(
            "Day {}: {} game(s), {} placed, {} settled, bankroll ${:.2}",
            day,
            n_games,
            report.placed.len(),
            settled.len(),
            engine.ledger().bankroll()
        );
    }

    let ledger = engine.ledger();
    let performance = ledger.get_performance();
    let strategy_risk = strategy_risk(engine);
    info!(
        "Simulation done: {} day(s), {} bet(s), bankroll ${:.2}, ROI {:.2}%",
        config.days,
        bets_placed,
        performance.bankroll,
        performance.roi * 100.0
    );
    let clv_by_market = ledger.clv_by_market();
    for (market, clv) in &clv_by_market {
        info!(
            "CLV {}: mean {:+.4} over {} bet(s)",
            market.as_str(),
            clv.mean,
            clv.sample_size
        );
    }

    Ok(SimulationSummary {
        days: config.days,
        games,
        bets_placed,
        rejections,
        clv: ledger.rolling_clv(usize::MAX),
        clv_by_market,
        diagnosis: ledger.diagnose(30),
        performance,
        strategy_risk,
    })
}

fn strategy_risk(engine: &BettingEngine) -> Option<StrategyRisk> {
    let ledger = engine.ledger();
    let orders = ledger.orders();
    if orders.is_empty() {
        return None;
    }
    let n = orders.len() as f64;
    let avg_edge = orders.iter().filter_map(|o| o.edge).sum::<f64>() / n;
    let avg_decimal = orders
        .iter()
        .filter_map(|o| american_to_decimal(o.price).ok())
        .sum::<f64>()
        / n;
    let avg_bet = orders.iter().map(|o| money_to_f64(o.stake)).sum::<f64>()
        / n
        / money_to_f64(ledger.initial_bankroll());
    analyze_strategy_risk(avg_edge, avg_decimal, avg_bet, orders.len()).ok()
}
