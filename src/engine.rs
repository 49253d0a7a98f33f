//! Betting engine - the optimizer → risk gate → ledger pipeline
//!
//! The engine owns one of each component and threads the ledger's equity
//! through each call explicitly; neither the optimizer nor the risk gate ever
//! reads the ledger directly.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::ledger::{money_to_f64, to_money, PlaceBet, SettlementLedger};
use crate::models::{GameResult, Opportunity, Order};
use crate::risk::{
    FilterOutcome, Rejection, RejectionReason, RiskConfig, RiskContext, RiskManager, SettledBet,
};
use crate::sizing::{EmpiricalCorrelations, OptimizerConfig, PortfolioOptimizer, PortfolioSolution};

/// Optimizer output and the risk gate's verdict on it, nothing placed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlatePlan {
    /// Bankroll snapshot the slate was sized against
    pub bankroll: f64,
    pub solution: PortfolioSolution,
    pub filter: FilterOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementReport {
    pub plan: SlatePlan,
    pub placed: Vec<Order>,
    /// Risk-gate rejections plus any placement refused by the ledger
    pub rejected: Vec<Rejection>,
}

#[derive(Debug, Clone)]
pub struct BettingEngine {
    optimizer: PortfolioOptimizer,
    risk: RiskManager,
    ledger: SettlementLedger,
}

impl BettingEngine {
    pub fn new(
        optimizer_config: OptimizerConfig,
        risk_config: RiskConfig,
        initial_bankroll: f64,
    ) -> Result<Self> {
        let optimizer = PortfolioOptimizer::new(optimizer_config)?;
        let risk = RiskManager::new(risk_config, initial_bankroll)?;
        let ledger = SettlementLedger::new(to_money(initial_bankroll)?)?;
        Ok(Self::from_parts(optimizer, risk, ledger))
    }

    pub fn from_parts(
        optimizer: PortfolioOptimizer,
        risk: RiskManager,
        ledger: SettlementLedger,
    ) -> Self {
        Self {
            optimizer,
            risk,
            ledger,
        }
    }

    pub fn optimizer(&self) -> &PortfolioOptimizer {
        &self.optimizer
    }

    pub fn risk(&self) -> &RiskManager {
        &self.risk
    }

    pub fn ledger(&self) -> &SettlementLedger {
        &self.ledger
    }

    /// Size and filter a slate against the current equity. Read-only.
    ///
    /// Same-event correlations are measured from settled history when
    /// enabled, falling back to the heuristic model for thin pairs.
    pub fn plan(&self, opportunities: &[Opportunity]) -> Result<SlatePlan> {
        let bankroll = money_to_f64(self.ledger.equity());
        let cfg = self.optimizer.config();
        let solution = if cfg.use_empirical_correlations {
            let measured = EmpiricalCorrelations::from_orders(
                self.ledger.orders(),
                cfg.correlation,
                cfg.empirical_min_samples,
            );
            self.optimizer
                .solve_with(opportunities, bankroll, &measured)?
        } else {
            self.optimizer.solve(opportunities, bankroll)?
        };
        let ctx = RiskContext::new(bankroll, self.risk.config());
        let filter = self.risk.filter_bets(&solution.allocations, &ctx);
        Ok(SlatePlan {
            bankroll,
            solution,
            filter,
        })
    }

    /// Plan, then place every approved allocation and commit its exposure.
    ///
    /// Only planning can fail. Once the first order is placed, a refusal from
    /// the ledger becomes a tagged rejection so the report always describes
    /// every mutation made.
    pub fn place_slate(&mut self, opportunities: &[Opportunity]) -> Result<PlacementReport> {
        let plan = self.plan(opportunities)?;
        let mut placed = Vec::new();
        let mut rejected = plan.filter.rejected.clone();

        for alloc in &plan.filter.approved {
            let placement =
                PlaceBet::from_allocation(alloc).and_then(|bet| self.ledger.place_bet(bet));
            match placement {
                Ok(order) => {
                    self.risk
                        .commit_exposure(&order.event_id, money_to_f64(order.stake));
                    placed.push(order);
                }
                Err(e) => {
                    warn!("Ledger refused {}: {}", alloc.opportunity.id, e);
                    rejected.push(Rejection {
                        opportunity: alloc.opportunity.clone(),
                        reason: placement_rejection(&e),
                        proposed_amount: alloc.amount,
                    });
                }
            }
        }

        info!(
            "Slate placed: {} order(s), ${:.2} staked, {} rejected",
            placed.len(),
            placed.iter().map(|o| o.stake).sum::<Decimal>(),
            rejected.len()
        );
        Ok(PlacementReport {
            plan,
            placed,
            rejected,
        })
    }

    /// Settle against results, then feed outcomes and the new equity to the risk gate.
    pub fn settle(&mut self, results: &[GameResult]) -> Vec<Order> {
        let settled = self.ledger.settle(results);
        for order in &settled {
            if let Some(outcome) = order.outcome {
                self.risk.record_result(SettledBet {
                    order_id: order.id.clone(),
                    event_id: order.event_id.clone(),
                    outcome,
                    profit: money_to_f64(order.profit.unwrap_or(Decimal::ZERO)),
                    clv: order.clv,
                });
            }
        }
        self.risk.update_bankroll(money_to_f64(self.ledger.equity()));
        settled
    }

    pub fn record_closing_price(&mut self, order_id: &str, closing_price: i32) -> Result<Order> {
        self.ledger.record_closing_price(order_id, closing_price)
    }

    /// Cancel an open order: full refund plus exposure rollback.
    pub fn cancel(&mut self, order_id: &str) -> Result<Order> {
        let order = self.ledger.cancel_bet(order_id)?;
        self.risk
            .release_exposure(&order.event_id, money_to_f64(order.stake));
        Ok(order)
    }

    pub fn start_new_day(&mut self) {
        self.risk.start_new_day();
    }

    pub fn start_new_week(&mut self) {
        self.risk.start_new_week();
    }
}

fn placement_rejection(err: &Error) -> RejectionReason {
    match err {
        Error::InsufficientBankroll { .. } => RejectionReason::InsufficientBankroll,
        Error::InvalidPrice { .. } => RejectionReason::InvalidPrice,
        _ => RejectionReason::InvalidStake,
    }
}
