//! Covariance-aware portfolio Kelly optimizer.
//!
//! Maximises
//!   H(g) = Σᵢ [pᵢ·ln(1 + gᵢ·bᵢ) + qᵢ·ln(1 − gᵢ)] − λ·Σ_{i≠j} gᵢ·Σᵢⱼ·gⱼ
//! over full-Kelly-unit stakes `g`, then reports `f = kelly_fraction · g`.
//! Each bet's own variance is already priced by the log-growth term, so only
//! co-movement is penalised; an isolated bet therefore lands exactly on its
//! fractional Kelly stake, and a diagonal-only Σ reduces to the
//! independence-assumption portfolio.
//!
//! The search is coordinate ascent: each coordinate is concave in its own
//! variable, so a golden-section search over its feasible interval finds the
//! coordinate optimum. A move is only taken when it strictly raises `H`, which
//! keeps sweeps monotone. On flat regions the bracket keeps its lower half,
//! so ties resolve toward the smaller stake.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::{Allocation, Opportunity};

use super::covariance::{CorrelationModel, CorrelationSource, CovarianceMatrix};
use super::kelly::{net_odds, single_bet_kelly_fraction};

/// Largest full-Kelly stake the search may reach; keeps `ln(1 − g)` finite.
const MAX_KELLY_UNITS: f64 = 1.0 - 1e-9;

const INV_PHI: f64 = 0.618_033_988_749_894_9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Fractional Kelly multiplier in (0, 1]
    pub kelly_fraction: f64,
    /// Per-bet ceiling, fraction of bankroll
    pub max_single_bet: f64,
    /// Aggregate ceiling, fraction of bankroll
    pub max_exposure: f64,
    /// Per-event ceiling, fraction of bankroll
    pub max_game_exposure: f64,
    /// λ, expressed in full-Kelly units
    pub risk_aversion: f64,
    /// `false` keeps Σ diagonal (independence assumption)
    pub use_covariance_matrix: bool,
    /// Heuristic ρ, and the prior for empirical estimates
    pub correlation: CorrelationModel,
    /// Measure same-event ρ on settled orders where enough exist
    pub use_empirical_correlations: bool,
    /// Observations a pair needs before its measured ρ is trusted
    pub empirical_min_samples: usize,
    /// Coordinate sweep cap
    pub max_sweeps: usize,
    /// Stop once a sweep changes the objective by less than this
    pub convergence_tolerance: f64,
    /// Golden-section bracket width at which a coordinate search stops
    pub search_tolerance: f64,
    pub max_search_iterations: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kelly_fraction: 0.25,
            max_single_bet: 0.05,
            max_exposure: 0.25,
            max_game_exposure: 0.075,
            risk_aversion: 0.5,
            use_covariance_matrix: true,
            correlation: CorrelationModel::default(),
            use_empirical_correlations: true,
            empirical_min_samples: 30,
            max_sweeps: 200,
            convergence_tolerance: 1e-10,
            search_tolerance: 1e-9,
            max_search_iterations: 200,
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.kelly_fraction > 0.0 && self.kelly_fraction <= 1.0) {
            return Err(Error::InvalidConfig("kelly_fraction must be in (0, 1]".into()));
        }
        for (name, v) in [
            ("max_single_bet", self.max_single_bet),
            ("max_exposure", self.max_exposure),
            ("max_game_exposure", self.max_game_exposure),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(Error::InvalidConfig(format!("{} must be in [0, 1]", name)));
            }
        }
        if !(self.risk_aversion >= 0.0 && self.risk_aversion.is_finite()) {
            return Err(Error::InvalidConfig("risk_aversion must be non-negative".into()));
        }
        let c = &self.correlation;
        for rho in [
            c.same_event_same_side,
            c.same_event_other_side,
            c.same_event_other_market,
            c.same_entity,
        ] {
            if !(-1.0..=1.0).contains(&rho) {
                return Err(Error::InvalidConfig("correlations must be in [-1, 1]".into()));
            }
        }
        if self.max_sweeps == 0 || self.max_search_iterations == 0 || self.empirical_min_samples == 0 {
            return Err(Error::InvalidConfig("iteration caps must be positive".into()));
        }
        if !(self.convergence_tolerance > 0.0 && self.search_tolerance > 0.0) {
            return Err(Error::InvalidConfig("tolerances must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverStatus {
    NoCandidates,
    Converged,
    /// Sweep cap hit before the convergence threshold; best iterate returned.
    IterationCap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSolution {
    /// One entry per input opportunity, in input order
    pub allocations: Vec<Allocation>,
    pub total_exposure: f64,
    /// Raw expected log-growth of the final fractions (no penalty)
    pub expected_growth: f64,
    /// `fᵗΣf` of the final fractions
    pub portfolio_risk: f64,
    pub status: SolverStatus,
    pub sweeps: usize,
    /// Risk-adjusted objective at the seed and after every sweep
    pub objective_history: Vec<f64>,
}

impl PortfolioSolution {
    fn empty() -> Self {
        Self {
            allocations: Vec::new(),
            total_exposure: 0.0,
            expected_growth: 0.0,
            portfolio_risk: 0.0,
            status: SolverStatus::NoCandidates,
            sweeps: 0,
            objective_history: Vec::new(),
        }
    }

    pub fn converged(&self) -> bool {
        self.status != SolverStatus::IterationCap
    }

    /// Allocations with a positive stake.
    pub fn funded(&self) -> impl Iterator<Item = &Allocation> {
        self.allocations.iter().filter(|a| a.fraction > 0.0)
    }
}

/// Per-bet inputs to the objective.
struct Leg {
    p: f64,
    b: f64,
    positive_edge: bool,
}

impl Leg {
    fn growth(&self, g: f64) -> f64 {
        if g <= 0.0 {
            return 0.0;
        }
        self.p * (1.0 + g * self.b).ln() + (1.0 - self.p) * (1.0 - g).ln()
    }
}

#[derive(Debug, Clone)]
pub struct PortfolioOptimizer {
    config: OptimizerConfig,
}

impl PortfolioOptimizer {
    pub fn new(config: OptimizerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Size a slate of opportunities against a bankroll snapshot, using the
    /// configured heuristic correlations.
    pub fn solve(&self, opportunities: &[Opportunity], bankroll: f64) -> Result<PortfolioSolution> {
        self.solve_with(opportunities, bankroll, &self.config.correlation)
    }

    /// As [`solve`](Self::solve), with correlations from `correlations`.
    pub fn solve_with<C: CorrelationSource + ?Sized>(
        &self,
        opportunities: &[Opportunity],
        bankroll: f64,
        correlations: &C,
    ) -> Result<PortfolioSolution> {
        if !bankroll.is_finite() || bankroll < 0.0 {
            return Err(Error::InvalidBankroll { bankroll });
        }
        if opportunities.is_empty() {
            return Ok(PortfolioSolution::empty());
        }

        let cfg = &self.config;
        let c = cfg.kelly_fraction;

        let legs = opportunities
            .iter()
            .map(|o| -> Result<Leg> {
                let b = net_odds(o.price)?;
                let edge = super::kelly::edge(o.probability, o.price)?;
                Ok(Leg {
                    p: o.probability,
                    b,
                    positive_edge: edge > 0.0,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let sigma =
            CovarianceMatrix::estimate(opportunities, correlations, cfg.use_covariance_matrix)?;

        // Seed: independent fractional Kelly, rescaled under the aggregate cap.
        let mut f = opportunities
            .iter()
            .map(|o| single_bet_kelly_fraction(o.probability, o.price, c, cfg.max_single_bet))
            .collect::<Result<Vec<_>>>()?;
        let seed_total: f64 = f.iter().sum();
        if seed_total > cfg.max_exposure {
            let scale = cfg.max_exposure / seed_total;
            f.iter_mut().for_each(|x| *x *= scale);
        }
        let mut g: Vec<f64> = f.iter().map(|x| x / c).collect();

        let mut objective = self.objective(&legs, &sigma, &g);
        let mut history = vec![objective];
        let mut status = SolverStatus::IterationCap;
        let mut sweeps = 0;

        while sweeps < cfg.max_sweeps {
            sweeps += 1;
            for i in 0..legs.len() {
                self.optimize_coordinate(i, &legs, &sigma, &mut g);
            }
            let next = self.objective(&legs, &sigma, &g);
            let delta = next - objective;
            objective = next;
            history.push(objective);
            debug!(sweep = sweeps, objective, delta, "coordinate sweep");
            if delta.abs() < cfg.convergence_tolerance {
                status = SolverStatus::Converged;
                break;
            }
        }

        if status == SolverStatus::IterationCap {
            warn!(
                "Optimizer hit sweep cap ({}) before converging; returning best iterate",
                cfg.max_sweeps
            );
        }

        let mut f: Vec<f64> = g.iter().map(|x| x * c).collect();
        self.apply_game_ceiling(opportunities, &mut f);

        let expected_growth: f64 = legs
            .iter()
            .zip(&f)
            .map(|(leg, &fi)| leg.growth(fi))
            .sum();
        let portfolio_risk = sigma.quadratic_form(&f);
        let total_exposure: f64 = f.iter().sum();

        let allocations = opportunities
            .iter()
            .zip(&f)
            .map(|(o, &fraction)| {
                let amount = fraction * bankroll;
                Allocation {
                    opportunity: o.clone(),
                    fraction,
                    amount,
                    expected_value: amount * o.edge,
                }
            })
            .collect();

        info!(
            "Optimized {} opportunities: exposure {:.4}, growth {:.6}, risk {:.6}, {} sweep(s)",
            opportunities.len(),
            total_exposure,
            expected_growth,
            portfolio_risk,
            sweeps
        );

        Ok(PortfolioSolution {
            allocations,
            total_exposure,
            expected_growth,
            portfolio_risk,
            status,
            sweeps,
            objective_history: history,
        })
    }

    /// Risk-adjusted objective in full-Kelly units.
    fn objective(&self, legs: &[Leg], sigma: &CovarianceMatrix, g: &[f64]) -> f64 {
        let growth: f64 = legs.iter().zip(g).map(|(leg, &gi)| leg.growth(gi)).sum();
        growth - self.config.risk_aversion * sigma.off_diagonal_form(g)
    }

    fn optimize_coordinate(
        &self,
        i: usize,
        legs: &[Leg],
        sigma: &CovarianceMatrix,
        g: &mut [f64],
    ) {
        let cfg = &self.config;
        let c = cfg.kelly_fraction;
        let leg = &legs[i];

        let upper = if leg.positive_edge {
            let others: f64 = g.iter().enumerate().filter(|&(j, _)| j != i).map(|(_, x)| x).sum();
            let exposure_room = (cfg.max_exposure / c - others).max(0.0);
            (cfg.max_single_bet / c).min(exposure_room).min(MAX_KELLY_UNITS)
        } else {
            0.0
        };

        let cross = sigma.cross_term(i, g);
        let lambda = cfg.risk_aversion;
        let phi = |x: f64| leg.growth(x) - 2.0 * lambda * x * cross;

        let current = g[i].min(upper);
        let candidate = golden_section_max(
            &phi,
            0.0,
            upper,
            cfg.search_tolerance / c,
            cfg.max_search_iterations,
        );
        g[i] = if phi(candidate) > phi(current) {
            candidate
        } else {
            current
        };
    }

    /// Scale down any event whose summed fractions exceed the per-event ceiling.
    fn apply_game_ceiling(&self, opportunities: &[Opportunity], f: &mut [f64]) {
        let mut by_event: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, o) in opportunities.iter().enumerate() {
            by_event.entry(o.event_id.as_str()).or_default().push(i);
        }
        let limit = self.config.max_game_exposure;
        for (event_id, indices) in by_event {
            let total: f64 = indices.iter().map(|&i| f[i]).sum();
            if total > limit {
                let scale = limit / total;
                debug!(event_id, total, limit, "scaling event to game ceiling");
                for i in indices {
                    f[i] *= scale;
                }
            }
        }
    }
}

/// Maximise a unimodal function on `[lo, hi]`.
///
/// Endpoints are compared with the final bracket midpoint so optima on a
/// boundary are returned exactly. Ties prefer the smaller argument.
fn golden_section_max<F: Fn(f64) -> f64>(
    f: &F,
    lo: f64,
    hi: f64,
    tolerance: f64,
    max_iterations: usize,
) -> f64 {
    if hi <= lo {
        return lo;
    }
    let (mut a, mut b) = (lo, hi);
    let mut c = b - INV_PHI * (b - a);
    let mut d = a + INV_PHI * (b - a);
    let mut fc = f(c);
    let mut fd = f(d);
    for _ in 0..max_iterations {
        if b - a <= tolerance {
            break;
        }
        if fc >= fd {
            b = d;
            d = c;
            fd = fc;
            c = b - INV_PHI * (b - a);
            fc = f(c);
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + INV_PHI * (b - a);
            fd = f(d);
        }
    }

    let mut best = lo;
    let mut best_value = f(lo);
    for x in [0.5 * (a + b), hi] {
        let v = f(x);
        if v > best_value {
            best = x;
            best_value = v;
        }
    }
    best
}
