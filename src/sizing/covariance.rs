//! Pairwise return covariance between candidate bets.
//!
//! Each bet's unit-stake return is `+b` with probability `p` and `−1` with
//! probability `q`, so its variance is `p·q·(1 + b)²`. Off-diagonal entries are
//! `ρ(i, j)·σᵢ·σⱼ`. `ρ` comes from a [`CorrelationSource`]: either the
//! relationship heuristics of [`CorrelationModel`], or [`EmpiricalCorrelations`]
//! measured on settled orders and shrunk toward those heuristics.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::{BetOutcome, Opportunity, Order, OrderStatus, SelectionKind};

use super::kelly::net_odds;

/// Diagonal jitter added on top of `|λ_min|` when Σ has to be repaired.
const PSD_JITTER: f64 = 1e-6;
const JACOBI_MAX_SWEEPS: usize = 100;

/// Anything that can put a correlation on a pair of distinct bets.
pub trait CorrelationSource {
    fn correlation(&self, a: &Opportunity, b: &Opportunity) -> f64;
}

/// Heuristic correlation constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorrelationModel {
    /// Same event, same selection kind (e.g. two books quoting the home side)
    pub same_event_same_side: f64,
    /// Same event, opposite direction of the same market
    pub same_event_other_side: f64,
    /// Same event, different market (moneyline vs total)
    pub same_event_other_market: f64,
    /// Same entity appearing in a different event
    pub same_entity: f64,
}

impl Default for CorrelationModel {
    fn default() -> Self {
        Self {
            same_event_same_side: 0.7,
            same_event_other_side: 0.3,
            same_event_other_market: 0.0,
            same_entity: 0.2,
        }
    }
}

impl CorrelationSource for CorrelationModel {
    /// Independent unless related.
    fn correlation(&self, a: &Opportunity, b: &Opportunity) -> f64 {
        if a.event_id == b.event_id {
            if a.selection.kind() == b.selection.kind() {
                return self.same_event_same_side;
            }
            if a.selection.is_opposite(&b.selection) {
                return self.same_event_other_side;
            }
            return self.same_event_other_market;
        }
        if !a.entity.is_empty() && normalize(&a.entity) == normalize(&b.entity) {
            return self.same_entity;
        }
        0.0
    }
}

fn normalize(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PairEstimate {
    /// Pearson correlation of the two win indicators
    pub correlation: f64,
    pub sample_size: usize,
}

/// Same-event correlations measured on settled orders.
///
/// Every pair of decided (non-push) orders on one event is a sample of the two
/// win indicators, keyed by their selection kinds. Pairs with fewer than
/// `min_samples` observations use the heuristic prior; above that the
/// measurement is blended in with weight `n / (n + min_samples)`. Cross-event
/// pairs always use the prior.
#[derive(Debug, Clone, PartialEq)]
pub struct EmpiricalCorrelations {
    prior: CorrelationModel,
    min_samples: usize,
    estimates: HashMap<(SelectionKind, SelectionKind), PairEstimate>,
}

impl EmpiricalCorrelations {
    pub fn from_orders(orders: &[Order], prior: CorrelationModel, min_samples: usize) -> Self {
        let mut by_event: BTreeMap<&str, Vec<(SelectionKind, f64)>> = BTreeMap::new();
        for order in orders.iter().filter(|o| o.status == OrderStatus::Settled) {
            let won = match order.outcome {
                Some(BetOutcome::Win) => 1.0,
                Some(BetOutcome::Loss) => 0.0,
                _ => continue,
            };
            by_event
                .entry(order.event_id.as_str())
                .or_default()
                .push((order.selection.kind(), won));
        }

        let mut samples: HashMap<(SelectionKind, SelectionKind), Vec<(f64, f64)>> = HashMap::new();
        for legs in by_event.values() {
            for i in 0..legs.len() {
                for j in (i + 1)..legs.len() {
                    let (mut a, mut b) = (legs[i], legs[j]);
                    if b.0 < a.0 {
                        std::mem::swap(&mut a, &mut b);
                    }
                    samples.entry((a.0, b.0)).or_default().push((a.1, b.1));
                }
            }
        }

        let estimates: HashMap<_, _> = samples
            .into_iter()
            .filter_map(|(key, xy)| {
                let correlation = pearson(&xy)?;
                Some((
                    key,
                    PairEstimate {
                        correlation,
                        sample_size: xy.len(),
                    },
                ))
            })
            .collect();
        debug!(
            pairs = estimates.len(),
            min_samples, "empirical correlations estimated"
        );

        Self {
            prior,
            min_samples: min_samples.max(1),
            estimates,
        }
    }

    pub fn estimate(&self, a: SelectionKind, b: SelectionKind) -> Option<&PairEstimate> {
        self.estimates.get(&pair_key(a, b))
    }

    /// Pairs with enough samples to move away from the prior.
    pub fn trusted_pairs(&self) -> usize {
        self.estimates
            .values()
            .filter(|e| e.sample_size >= self.min_samples)
            .count()
    }
}

impl CorrelationSource for EmpiricalCorrelations {
    fn correlation(&self, a: &Opportunity, b: &Opportunity) -> f64 {
        let prior = self.prior.correlation(a, b);
        if a.event_id != b.event_id {
            return prior;
        }
        match self.estimate(a.selection.kind(), b.selection.kind()) {
            Some(est) if est.sample_size >= self.min_samples => {
                let n = est.sample_size as f64;
                let trust = n / (n + self.min_samples as f64);
                (trust * est.correlation + (1.0 - trust) * prior).clamp(-1.0, 1.0)
            }
            _ => prior,
        }
    }
}

fn pair_key(a: SelectionKind, b: SelectionKind) -> (SelectionKind, SelectionKind) {
    if b < a {
        (b, a)
    } else {
        (a, b)
    }
}

/// `None` when either side never varies.
fn pearson(xy: &[(f64, f64)]) -> Option<f64> {
    if xy.len() < 2 {
        return None;
    }
    let n = xy.len() as f64;
    let mean_x = xy.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = xy.iter().map(|p| p.1).sum::<f64>() / n;
    let (mut cov, mut var_x, mut var_y) = (0.0, 0.0, 0.0);
    for &(x, y) in xy {
        cov += (x - mean_x) * (y - mean_y);
        var_x += (x - mean_x).powi(2);
        var_y += (y - mean_y).powi(2);
    }
    if var_x <= 0.0 || var_y <= 0.0 {
        return None;
    }
    Some((cov / (var_x * var_y).sqrt()).clamp(-1.0, 1.0))
}

/// Variance of a unit-stake bet's return.
pub fn bet_variance(probability: f64, net_odds: f64) -> f64 {
    probability * (1.0 - probability) * (1.0 + net_odds).powi(2)
}

/// Dense symmetric `n×n` matrix, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct CovarianceMatrix {
    n: usize,
    data: Vec<f64>,
}

impl CovarianceMatrix {
    pub fn zeros(n: usize) -> Self {
        Self {
            n,
            data: vec![0.0; n * n],
        }
    }

    /// Build Σ for the given opportunities.
    ///
    /// With `use_correlations = false` only the diagonal is filled, which is the
    /// independence assumption. Otherwise a Σ with a negative eigenvalue is
    /// shifted along the diagonal until it is positive semi-definite.
    pub fn estimate<C: CorrelationSource + ?Sized>(
        opportunities: &[Opportunity],
        correlations: &C,
        use_correlations: bool,
    ) -> Result<Self> {
        let n = opportunities.len();
        let mut sigma = Self::zeros(n);
        let mut std_devs = Vec::with_capacity(n);
        for (i, opp) in opportunities.iter().enumerate() {
            let var = bet_variance(opp.probability, net_odds(opp.price)?);
            sigma.set(i, i, var);
            std_devs.push(var.sqrt());
        }
        if !use_correlations {
            return Ok(sigma);
        }
        for i in 0..n {
            for j in (i + 1)..n {
                let rho = correlations.correlation(&opportunities[i], &opportunities[j]);
                if rho != 0.0 {
                    sigma.set(i, j, rho * std_devs[i] * std_devs[j]);
                    sigma.set(j, i, rho * std_devs[i] * std_devs[j]);
                }
            }
        }
        sigma.ensure_psd();
        Ok(sigma)
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.n + j]
    }

    fn set(&mut self, i: usize, j: usize, value: f64) {
        self.data[i * self.n + j] = value;
    }

    fn ensure_psd(&mut self) {
        let min = self.min_eigenvalue();
        if min < 0.0 {
            let shift = min.abs() + PSD_JITTER;
            warn!(
                "Covariance matrix not PSD (min eigenvalue {:.3e}); shifting diagonal by {:.3e}",
                min, shift
            );
            for i in 0..self.n {
                self.data[i * self.n + i] += shift;
            }
        }
    }

    /// Smallest eigenvalue, by cyclic Jacobi rotations.
    pub fn min_eigenvalue(&self) -> f64 {
        let n = self.n;
        if n == 0 {
            return 0.0;
        }
        let mut a = self.data.clone();
        for _ in 0..JACOBI_MAX_SWEEPS {
            let off: f64 = (0..n)
                .flat_map(|i| (0..n).filter(move |&j| j != i).map(move |j| (i, j)))
                .map(|(i, j)| a[i * n + j].powi(2))
                .sum();
            if off < 1e-24 {
                break;
            }
            for p in 0..n {
                for q in (p + 1)..n {
                    let apq = a[p * n + q];
                    if apq == 0.0 {
                        continue;
                    }
                    let theta = (a[q * n + q] - a[p * n + p]) / (2.0 * apq);
                    let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                    let c = 1.0 / (t * t + 1.0).sqrt();
                    let s = t * c;
                    for k in 0..n {
                        let (akp, akq) = (a[k * n + p], a[k * n + q]);
                        a[k * n + p] = c * akp - s * akq;
                        a[k * n + q] = s * akp + c * akq;
                    }
                    for k in 0..n {
                        let (apk, aqk) = (a[p * n + k], a[q * n + k]);
                        a[p * n + k] = c * apk - s * aqk;
                        a[q * n + k] = s * apk + c * aqk;
                    }
                }
            }
        }
        (0..n).map(|i| a[i * n + i]).fold(f64::INFINITY, f64::min)
    }

    /// `fᵗΣf`
    pub(crate) fn quadratic_form(&self, f: &[f64]) -> f64 {
        let mut total = 0.0;
        for i in 0..self.n {
            for j in 0..self.n {
                total += f[i] * self.get(i, j) * f[j];
            }
        }
        total
    }

    /// `Σ_{j≠i} Σᵢⱼ·fⱼ`
    pub(crate) fn cross_term(&self, i: usize, f: &[f64]) -> f64 {
        (0..self.n)
            .filter(|&j| j != i)
            .map(|j| self.get(i, j) * f[j])
            .sum()
    }

    /// `Σ_{i≠j} fᵢΣᵢⱼfⱼ`: the quadratic form without each bet's own variance.
    pub(crate) fn off_diagonal_form(&self, f: &[f64]) -> f64 {
        (0..self.n).map(|i| f[i] * self.cross_term(i, f)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Selection;
    use approx::assert_relative_eq;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn opp(event: &str, selection: Selection, entity: &str, p: f64, price: i32) -> Opportunity {
        Opportunity::new(event, selection, entity, p, price, None).unwrap()
    }

    fn settled(event: &str, selection: Selection, outcome: BetOutcome) -> Order {
        Order {
            id: format!("{}:{}", event, selection),
            event_id: event.into(),
            selection,
            entity: "A".into(),
            stake: dec!(10),
            price: 100,
            model_probability: None,
            edge: None,
            status: OrderStatus::Settled,
            outcome: Some(outcome),
            payout: None,
            profit: None,
            closing_price: None,
            clv: None,
            placed_at: Utc::now(),
            closed_at: None,
        }
    }

    /// Home and over settled together on `n` events; the first `agree` of them
    /// share an outcome, the rest split.
    fn history(n: usize, agree: usize) -> Vec<Order> {
        let mut orders = Vec::new();
        for i in 0..n {
            let event = format!("h{}", i);
            let home = if i % 2 == 0 { BetOutcome::Win } else { BetOutcome::Loss };
            let over = match (i < agree, home) {
                (true, o) => o,
                (false, BetOutcome::Win) => BetOutcome::Loss,
                (false, _) => BetOutcome::Win,
            };
            orders.push(settled(&event, Selection::Home, home));
            orders.push(settled(&event, Selection::Over { line: 8.5 }, over));
        }
        orders
    }

    struct Fixed(f64);

    impl CorrelationSource for Fixed {
        fn correlation(&self, _: &Opportunity, _: &Opportunity) -> f64 {
            self.0
        }
    }

    #[test]
    fn variance_of_even_money_coin_flip() {
        assert_relative_eq!(bet_variance(0.5, 1.0), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn correlation_heuristics() {
        let m = CorrelationModel::default();
        let home = opp("g1", Selection::Home, "Sox", 0.55, 110);
        let home_alt = opp("g1", Selection::Home, "Sox", 0.55, 105);
        let away = opp("g1", Selection::Away, "Yanks", 0.5, 110);
        let over = opp("g1", Selection::Over { line: 8.5 }, "Sox", 0.5, 110);
        let under = opp("g1", Selection::Under { line: 9.0 }, "", 0.5, 110);
        let other_game = opp("g2", Selection::Away, " sox ", 0.5, 110);
        let unrelated = opp("g3", Selection::Home, "Cubs", 0.5, 110);
        assert_relative_eq!(m.correlation(&home, &home_alt), 0.7);
        assert_relative_eq!(m.correlation(&home, &away), 0.3);
        assert_relative_eq!(m.correlation(&over, &under), 0.3);
        assert_relative_eq!(m.correlation(&home, &over), 0.0);
        assert_relative_eq!(m.correlation(&home, &other_game), 0.2);
        assert_relative_eq!(m.correlation(&home, &unrelated), 0.0);

        let tuned = CorrelationModel {
            same_event_other_market: 0.15,
            ..m
        };
        assert_relative_eq!(tuned.correlation(&away, &over), 0.15);
    }

    #[test]
    fn matrix_is_symmetric_with_variances_on_diagonal() {
        let opps = vec![
            opp("g1", Selection::Home, "A", 0.55, 110),
            opp("g1", Selection::Away, "B", 0.48, 120),
            opp("g2", Selection::Home, "A", 0.6, -120),
        ];
        let sigma = CovarianceMatrix::estimate(&opps, &CorrelationModel::default(), true).unwrap();
        assert_eq!(sigma.len(), 3);
        for i in 0..3 {
            let b = net_odds(opps[i].price).unwrap();
            assert_relative_eq!(sigma.get(i, i), bet_variance(opps[i].probability, b));
            for j in 0..3 {
                assert_relative_eq!(sigma.get(i, j), sigma.get(j, i));
            }
        }
        let expected = 0.3 * (sigma.get(0, 0) * sigma.get(1, 1)).sqrt();
        assert_relative_eq!(sigma.get(0, 1), expected, epsilon = 1e-12);
        assert!(sigma.get(0, 2) > 0.0);
        assert_relative_eq!(sigma.get(1, 2), 0.0);
        assert!(sigma.min_eigenvalue() > 0.0);
    }

    #[test]
    fn independence_assumption_is_diagonal() {
        let opps = vec![
            opp("g1", Selection::Home, "A", 0.55, 110),
            opp("g1", Selection::Home, "A", 0.55, 115),
        ];
        let sigma =
            CovarianceMatrix::estimate(&opps, &CorrelationModel::default(), false).unwrap();
        assert_relative_eq!(sigma.get(0, 1), 0.0);
        let f = [0.1, 0.2];
        assert_relative_eq!(sigma.off_diagonal_form(&f), 0.0);
        assert_relative_eq!(
            sigma.quadratic_form(&f),
            0.01 * sigma.get(0, 0) + 0.04 * sigma.get(1, 1),
            epsilon = 1e-12
        );
    }

    #[test]
    fn off_diagonal_form_excludes_own_variance() {
        let opps = vec![
            opp("g1", Selection::Home, "A", 0.55, 110),
            opp("g1", Selection::Away, "B", 0.5, 110),
        ];
        let sigma = CovarianceMatrix::estimate(&opps, &CorrelationModel::default(), true).unwrap();
        let f = [0.1, 0.05];
        let own = 0.01 * sigma.get(0, 0) + 0.0025 * sigma.get(1, 1);
        assert_relative_eq!(
            sigma.off_diagonal_form(&f),
            sigma.quadratic_form(&f) - own,
            epsilon = 1e-12
        );
    }

    #[test]
    fn min_eigenvalue_of_known_matrices() {
        let opps = vec![
            opp("g1", Selection::Home, "A", 0.5, 100),
            opp("g2", Selection::Home, "B", 0.5, 100),
        ];
        // Unit variances; eigenvalues of [[1, ρ], [ρ, 1]] are 1 ± ρ.
        let sigma = CovarianceMatrix::estimate(&opps, &Fixed(0.6), true).unwrap();
        assert_relative_eq!(sigma.min_eigenvalue(), 0.4, epsilon = 1e-9);
        assert_relative_eq!(CovarianceMatrix::zeros(0).min_eigenvalue(), 0.0);
    }

    #[test]
    fn inconsistent_correlations_are_repaired_to_psd() {
        let opps = vec![
            opp("g1", Selection::Home, "A", 0.5, 100),
            opp("g2", Selection::Home, "B", 0.5, 100),
            opp("g3", Selection::Home, "C", 0.5, 100),
        ];
        // All pairs at −0.9 cannot hold at once: 1 + 2ρ < 0.
        let sigma = CovarianceMatrix::estimate(&opps, &Fixed(-0.9), true).unwrap();
        assert!(sigma.min_eigenvalue() >= -1e-9);
        assert!(sigma.get(0, 0) > 1.0);
        for f in [[0.1, 0.1, 0.1], [0.3, -0.2, 0.05]] {
            assert!(sigma.quadratic_form(&f) >= 0.0);
        }
    }

    #[test]
    fn empirical_falls_back_below_min_samples() {
        let prior = CorrelationModel {
            same_event_other_market: 0.1,
            ..CorrelationModel::default()
        };
        let empirical = EmpiricalCorrelations::from_orders(&history(10, 10), prior, 30);
        let est = empirical
            .estimate(SelectionKind::Over, SelectionKind::Home)
            .unwrap();
        assert_eq!(est.sample_size, 10);
        assert_relative_eq!(est.correlation, 1.0, epsilon = 1e-12);
        assert_eq!(empirical.trusted_pairs(), 0);

        let home = opp("g9", Selection::Home, "A", 0.55, 110);
        let over = opp("g9", Selection::Over { line: 8.5 }, "A", 0.55, 110);
        assert_relative_eq!(empirical.correlation(&home, &over), 0.1);
    }

    #[test]
    fn empirical_blends_measurement_with_prior() {
        let prior = CorrelationModel::default();
        // 40 events: 30 agree, 10 split.
        let empirical = EmpiricalCorrelations::from_orders(&history(40, 30), prior, 20);
        let est = *empirical
            .estimate(SelectionKind::Home, SelectionKind::Over)
            .unwrap();
        assert_eq!(est.sample_size, 40);
        assert!(est.correlation > 0.0);
        assert_eq!(empirical.trusted_pairs(), 1);

        let home = opp("g9", Selection::Home, "A", 0.55, 110);
        let over = opp("g9", Selection::Over { line: 7.5 }, "A", 0.55, 110);
        let trust = 40.0 / 60.0;
        assert_relative_eq!(
            empirical.correlation(&home, &over),
            trust * est.correlation,
            epsilon = 1e-12
        );
        // Other events and untouched pairs keep the prior.
        let elsewhere = opp("g10", Selection::Away, "a", 0.55, 110);
        assert_relative_eq!(empirical.correlation(&home, &elsewhere), 0.2);
        let away = opp("g9", Selection::Away, "B", 0.45, 110);
        assert_relative_eq!(empirical.correlation(&home, &away), 0.3);
    }

    #[test]
    fn empirical_ignores_open_and_push_orders() {
        let mut orders = history(5, 5);
        orders[0].outcome = Some(BetOutcome::Push);
        orders[2].status = OrderStatus::Open;
        let empirical =
            EmpiricalCorrelations::from_orders(&orders, CorrelationModel::default(), 1);
        let est = empirical
            .estimate(SelectionKind::Home, SelectionKind::Over)
            .unwrap();
        assert_eq!(est.sample_size, 3);
    }
}
