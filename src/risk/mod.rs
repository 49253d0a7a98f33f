//! Risk gate - filters and rescales proposed allocations
//!
//! Applies, in order:
//! - Confidence / probability / edge bounds (tagged rejections; NaN is out of bounds)
//! - Drawdown penalty, losing-streak reduction, low-confidence scaling
//! - Greedy admission against daily, weekly and per-event exposure budgets
//!
//! The gate never sizes bets itself. Its state only changes through explicit
//! calls: bankroll readings, settled results, exposure commits and period
//! boundary signals from the caller.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::{Allocation, BetOutcome, Opportunity};

/// Slack for floating-point budget comparisons (currency units).
const BUDGET_EPS: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    pub min_confidence: f64,
    pub max_confidence: f64,
    /// Confidence at or above which no confidence scaling applies
    pub full_confidence: f64,
    pub min_model_prob: f64,
    pub max_model_prob: f64,
    /// Edges at or below this (and never above zero) are rejected
    pub min_edge: f64,
    /// Suspiciously large edges are rejected
    pub max_edge: f64,
    /// Drawdown at which the drawdown penalty reaches its floor
    pub max_drawdown: f64,
    pub drawdown_floor: f64,
    /// Multiplier applied while on a qualifying losing streak
    pub streak_reduction: f64,
    pub losing_streak_threshold: u32,
    /// Fractions of bankroll
    pub daily_exposure_limit: f64,
    pub weekly_exposure_limit: f64,
    pub max_game_exposure: f64,
    /// Minimum stake after scaling (currency units)
    pub min_stake: f64,
    pub history_limit: usize,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.55,
            max_confidence: 1.0,
            full_confidence: 0.75,
            min_model_prob: 0.05,
            max_model_prob: 0.95,
            min_edge: 0.0,
            max_edge: 0.30,
            max_drawdown: 0.30,
            drawdown_floor: 0.25,
            streak_reduction: 0.5,
            losing_streak_threshold: 3,
            daily_exposure_limit: 0.25,
            weekly_exposure_limit: 0.60,
            max_game_exposure: 0.075,
            min_stake: 1.0,
            history_limit: 500,
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f64| -> Result<()> {
            if !(0.0..=1.0).contains(&v) {
                return Err(Error::InvalidConfig(format!("{} must be in [0, 1]", name)));
            }
            Ok(())
        };
        unit("min_confidence", self.min_confidence)?;
        unit("max_confidence", self.max_confidence)?;
        unit("min_model_prob", self.min_model_prob)?;
        unit("max_model_prob", self.max_model_prob)?;
        unit("drawdown_floor", self.drawdown_floor)?;
        unit("streak_reduction", self.streak_reduction)?;
        unit("daily_exposure_limit", self.daily_exposure_limit)?;
        unit("weekly_exposure_limit", self.weekly_exposure_limit)?;
        unit("max_game_exposure", self.max_game_exposure)?;
        if self.min_confidence > self.max_confidence {
            return Err(Error::InvalidConfig("min_confidence exceeds max_confidence".into()));
        }
        if self.min_model_prob > self.max_model_prob {
            return Err(Error::InvalidConfig("min_model_prob exceeds max_model_prob".into()));
        }
        if self.min_edge > self.max_edge {
            return Err(Error::InvalidConfig("min_edge exceeds max_edge".into()));
        }
        if !(self.full_confidence > 0.0 && self.full_confidence <= 1.0) {
            return Err(Error::InvalidConfig("full_confidence must be in (0, 1]".into()));
        }
        if !(self.max_drawdown > 0.0 && self.max_drawdown <= 1.0) {
            return Err(Error::InvalidConfig("max_drawdown must be in (0, 1]".into()));
        }
        if self.min_stake < 0.0 {
            return Err(Error::InvalidConfig("min_stake must be non-negative".into()));
        }
        Ok(())
    }
}

/// Per-call inputs: the bankroll snapshot and the budgets to enforce.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskContext {
    pub bankroll: f64,
    /// Daily exposure budget, fraction of bankroll
    pub daily_exposure_limit: f64,
    /// Per-event exposure budget, fraction of bankroll
    pub max_game_exposure: f64,
}

impl RiskContext {
    pub fn new(bankroll: f64, config: &RiskConfig) -> Self {
        Self {
            bankroll,
            daily_exposure_limit: config.daily_exposure_limit,
            max_game_exposure: config.max_game_exposure,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreakKind {
    Win,
    Loss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Streak {
    pub kind: Option<StreakKind>,
    pub length: u32,
}

/// Summary of a settled bet kept for streak and CLV bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettledBet {
    pub order_id: String,
    pub event_id: String,
    pub outcome: BetOutcome,
    pub profit: f64,
    pub clv: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub peak_bankroll: f64,
    pub current_bankroll: f64,
    /// `(peak − current) / peak`
    pub drawdown: f64,
    /// Committed in the current day window (currency units)
    pub daily_exposure: f64,
    /// Committed in the current week window (currency units)
    pub weekly_exposure: f64,
    /// Committed per event in the current day window
    pub event_exposure: HashMap<String, f64>,
    pub streak: Streak,
    pub history: VecDeque<SettledBet>,
}

impl RiskState {
    pub fn new(initial_bankroll: f64) -> Self {
        Self {
            peak_bankroll: initial_bankroll,
            current_bankroll: initial_bankroll,
            drawdown: 0.0,
            daily_exposure: 0.0,
            weekly_exposure: 0.0,
            event_exposure: HashMap::new(),
            streak: Streak::default(),
            history: VecDeque::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    ConfidenceTooLow,
    ConfidenceOutOfRange,
    ProbabilityOutOfRange,
    NegativeEdge,
    EdgeTooHigh,
    ZeroStake,
    /// Non-finite stake, or one the ledger refused as malformed
    InvalidStake,
    /// Price the ledger refused at placement
    InvalidPrice,
    StakeTooSmall,
    DailyExposureLimit,
    WeeklyExposureLimit,
    GameExposureLimit,
    InsufficientBankroll,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::ConfidenceTooLow => "confidence_too_low",
            RejectionReason::ConfidenceOutOfRange => "confidence_out_of_range",
            RejectionReason::ProbabilityOutOfRange => "probability_out_of_range",
            RejectionReason::NegativeEdge => "negative_edge",
            RejectionReason::EdgeTooHigh => "edge_too_high",
            RejectionReason::ZeroStake => "zero_stake",
            RejectionReason::InvalidStake => "invalid_stake",
            RejectionReason::InvalidPrice => "invalid_price",
            RejectionReason::StakeTooSmall => "stake_too_small",
            RejectionReason::DailyExposureLimit => "daily_exposure_limit",
            RejectionReason::WeeklyExposureLimit => "weekly_exposure_limit",
            RejectionReason::GameExposureLimit => "game_exposure_limit",
            RejectionReason::InsufficientBankroll => "insufficient_bankroll",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub opportunity: Opportunity,
    pub reason: RejectionReason,
    /// Stake at the point of rejection (after scaling, if reached)
    pub proposed_amount: f64,
}

/// Portfolio-wide stake multipliers; confidence scaling is per bet.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskMultiplier {
    pub drawdown: f64,
    pub streak: f64,
}

impl RiskMultiplier {
    pub fn total(&self) -> f64 {
        self.drawdown * self.streak
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterOutcome {
    /// Approved allocations in admission order
    pub approved: Vec<Allocation>,
    pub rejected: Vec<Rejection>,
    pub multiplier: RiskMultiplier,
}

impl FilterOutcome {
    pub fn approved_total(&self) -> f64 {
        self.approved.iter().map(|a| a.amount).sum()
    }
}

/// Stateful risk gate. Callers serialise access; there is no internal locking.
#[derive(Debug, Clone)]
pub struct RiskManager {
    config: RiskConfig,
    state: RiskState,
}

impl RiskManager {
    pub fn new(config: RiskConfig, initial_bankroll: f64) -> Result<Self> {
        Self::from_state(config, RiskState::new(initial_bankroll))
    }

    /// Resume from a persisted state.
    pub fn from_state(config: RiskConfig, state: RiskState) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, state })
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn state(&self) -> &RiskState {
        &self.state
    }

    /// Record a bankroll (equity) reading and update peak/drawdown.
    pub fn update_bankroll(&mut self, bankroll: f64) {
        self.state.current_bankroll = bankroll;
        if bankroll > self.state.peak_bankroll {
            self.state.peak_bankroll = bankroll;
        }
        let peak = self.state.peak_bankroll;
        self.state.drawdown = if peak > 0.0 {
            ((peak - bankroll) / peak).max(0.0)
        } else {
            0.0
        };
    }

    /// Record a settled bet. Wins and losses extend or restart the streak;
    /// pushes leave it alone.
    pub fn record_result(&mut self, bet: SettledBet) {
        let kind = match bet.outcome {
            BetOutcome::Win => Some(StreakKind::Win),
            BetOutcome::Loss => Some(StreakKind::Loss),
            BetOutcome::Push => None,
        };
        if let Some(kind) = kind {
            let streak = &mut self.state.streak;
            if streak.kind == Some(kind) {
                streak.length += 1;
            } else {
                *streak = Streak {
                    kind: Some(kind),
                    length: 1,
                };
            }
        }
        self.state.history.push_back(bet);
        while self.state.history.len() > self.config.history_limit {
            self.state.history.pop_front();
        }
    }

    pub fn commit_exposure(&mut self, event_id: &str, amount: f64) {
        self.state.daily_exposure += amount;
        self.state.weekly_exposure += amount;
        *self
            .state
            .event_exposure
            .entry(event_id.to_string())
            .or_insert(0.0) += amount;
    }

    /// Roll back committed exposure, e.g. after a cancellation.
    pub fn release_exposure(&mut self, event_id: &str, amount: f64) {
        self.state.daily_exposure = (self.state.daily_exposure - amount).max(0.0);
        self.state.weekly_exposure = (self.state.weekly_exposure - amount).max(0.0);
        if let Some(e) = self.state.event_exposure.get_mut(event_id) {
            *e = (*e - amount).max(0.0);
            if *e <= BUDGET_EPS {
                self.state.event_exposure.remove(event_id);
            }
        }
    }

    pub fn start_new_day(&mut self) {
        info!(
            "Day boundary: releasing ${:.2} daily exposure across {} event(s)",
            self.state.daily_exposure,
            self.state.event_exposure.len()
        );
        self.state.daily_exposure = 0.0;
        self.state.event_exposure.clear();
    }

    pub fn start_new_week(&mut self) {
        self.start_new_day();
        info!(
            "Week boundary: releasing ${:.2} weekly exposure",
            self.state.weekly_exposure
        );
        self.state.weekly_exposure = 0.0;
    }

    pub fn multiplier(&self) -> RiskMultiplier {
        let cfg = &self.config;
        let drawdown = (1.0 - self.state.drawdown / cfg.max_drawdown)
            .max(cfg.drawdown_floor)
            .min(1.0);
        let streak = match self.state.streak {
            Streak {
                kind: Some(StreakKind::Loss),
                length,
            } if length >= cfg.losing_streak_threshold => cfg.streak_reduction,
            _ => 1.0,
        };
        RiskMultiplier { drawdown, streak }
    }

    /// Proportional scale for bets below the full-confidence level.
    pub fn confidence_scale(&self, confidence: f64) -> f64 {
        (confidence / self.config.full_confidence).clamp(0.0, 1.0)
    }

    fn bounds_violation(&self, opp: &Opportunity) -> Option<RejectionReason> {
        let cfg = &self.config;
        let confidence = opp.confidence_or_full();
        if !(cfg.min_confidence..=cfg.max_confidence).contains(&confidence) {
            return Some(if confidence < cfg.min_confidence {
                RejectionReason::ConfidenceTooLow
            } else {
                RejectionReason::ConfidenceOutOfRange
            });
        }
        if !(cfg.min_model_prob..=cfg.max_model_prob).contains(&opp.probability) {
            return Some(RejectionReason::ProbabilityOutOfRange);
        }
        if !(opp.edge > 0.0 && opp.edge > cfg.min_edge) {
            return Some(RejectionReason::NegativeEdge);
        }
        if opp.edge > cfg.max_edge {
            return Some(RejectionReason::EdgeTooHigh);
        }
        None
    }

    /// Filter and rescale a proposed allocation. Reads state, never mutates it;
    /// callers commit exposure for what they actually place.
    pub fn filter_bets(&self, proposed: &[Allocation], ctx: &RiskContext) -> FilterOutcome {
        let multiplier = self.multiplier();
        let mut rejected = Vec::new();
        let mut candidates: Vec<(f64, Allocation)> = Vec::new();

        for alloc in proposed {
            let opp = &alloc.opportunity;
            if let Some(reason) = self.bounds_violation(opp) {
                debug!(opportunity = %opp.id, %reason, "rejected on bounds");
                rejected.push(Rejection {
                    opportunity: opp.clone(),
                    reason,
                    proposed_amount: alloc.amount,
                });
                continue;
            }
            if !alloc.amount.is_finite() {
                rejected.push(Rejection {
                    opportunity: opp.clone(),
                    reason: RejectionReason::InvalidStake,
                    proposed_amount: alloc.amount,
                });
                continue;
            }
            if alloc.amount <= 0.0 {
                rejected.push(Rejection {
                    opportunity: opp.clone(),
                    reason: RejectionReason::ZeroStake,
                    proposed_amount: 0.0,
                });
                continue;
            }

            let confidence = opp.confidence_or_full();
            let amount = alloc.amount * multiplier.total() * self.confidence_scale(confidence);
            if !amount.is_finite() {
                rejected.push(Rejection {
                    opportunity: opp.clone(),
                    reason: RejectionReason::InvalidStake,
                    proposed_amount: amount,
                });
                continue;
            }
            if amount < self.config.min_stake {
                debug!(opportunity = %opp.id, amount, "stake too small after scaling");
                rejected.push(Rejection {
                    opportunity: opp.clone(),
                    reason: RejectionReason::StakeTooSmall,
                    proposed_amount: amount,
                });
                continue;
            }
            let fraction = if ctx.bankroll > 0.0 {
                amount / ctx.bankroll
            } else {
                0.0
            };
            candidates.push((
                opp.edge * confidence,
                Allocation {
                    opportunity: opp.clone(),
                    fraction,
                    amount,
                    expected_value: amount * opp.edge,
                },
            ));
        }

        // Stable sort keeps input order among equal priorities.
        candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

        let mut daily_room =
            (ctx.daily_exposure_limit * ctx.bankroll - self.state.daily_exposure).max(0.0);
        let mut weekly_room = (self.config.weekly_exposure_limit * ctx.bankroll
            - self.state.weekly_exposure)
            .max(0.0);
        let game_cap = ctx.max_game_exposure * ctx.bankroll;
        let mut event_used: HashMap<String, f64> = HashMap::new();
        let mut approved = Vec::new();

        for (_, alloc) in candidates {
            let event_id = &alloc.opportunity.event_id;
            let committed = self.state.event_exposure.get(event_id).copied().unwrap_or(0.0)
                + event_used.get(event_id).copied().unwrap_or(0.0);

            let reason = if alloc.amount > daily_room + BUDGET_EPS {
                Some(RejectionReason::DailyExposureLimit)
            } else if alloc.amount > weekly_room + BUDGET_EPS {
                Some(RejectionReason::WeeklyExposureLimit)
            } else if committed + alloc.amount > game_cap + BUDGET_EPS {
                Some(RejectionReason::GameExposureLimit)
            } else {
                None
            };

            if let Some(reason) = reason {
                warn!(
                    "Rejected {} (${:.2}): {}",
                    alloc.opportunity.id, alloc.amount, reason
                );
                rejected.push(Rejection {
                    opportunity: alloc.opportunity,
                    reason,
                    proposed_amount: alloc.amount,
                });
                continue;
            }

            daily_room -= alloc.amount;
            weekly_room -= alloc.amount;
            *event_used.entry(event_id.clone()).or_insert(0.0) += alloc.amount;
            approved.push(alloc);
        }

        info!(
            "Risk gate: {} approved, {} rejected (drawdown x{:.3}, streak x{:.3})",
            approved.len(),
            rejected.len(),
            multiplier.drawdown,
            multiplier.streak
        );

        FilterOutcome {
            approved,
            rejected,
            multiplier,
        }
    }
}
