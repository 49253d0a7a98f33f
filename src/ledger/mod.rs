//! Settlement ledger - escrowed stakes, settlement and performance statistics
//!
//! Every order moves exactly once from `open` to `settled` or `cancelled`.
//! Stakes leave the bankroll on placement and come back (with winnings, or not)
//! on settlement; a cancellation refunds the stake in full.
//!
//! Money is held as [`Decimal`] cents so escrow and refunds are exact. Ratios
//! (drawdown, ROI, CLV) stay `f64`.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::{Allocation, BetOutcome, GameResult, Market, Order, OrderStatus, Selection};
use crate::sizing::kelly::{american_profit, american_to_decimal, closing_line_value};

/// Mean CLV at or above which a record is considered sharp.
pub const SHARP_CLV_THRESHOLD: f64 = 0.02;

/// Convert an optimizer amount to money, truncated to the cent so a placed
/// stake never exceeds what was sized.
pub fn to_money(amount: f64) -> Result<Decimal> {
    // Round off binary noise first so 380.48_f64 stays 380.48.
    Decimal::from_f64(amount)
        .map(|d| d.round_dp(6).round_dp_with_strategy(2, RoundingStrategy::ToZero))
        .ok_or(Error::InvalidStake { stake: amount })
}

pub fn money_to_f64(amount: Decimal) -> f64 {
    amount.to_f64().unwrap_or(0.0)
}

/// Placement request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceBet {
    pub event_id: String,
    pub selection: Selection,
    pub entity: String,
    pub stake: Decimal,
    pub price: i32,
    pub model_probability: Option<f64>,
    pub edge: Option<f64>,
}

impl PlaceBet {
    pub fn from_allocation(alloc: &Allocation) -> Result<Self> {
        let opp = &alloc.opportunity;
        Ok(Self {
            event_id: opp.event_id.clone(),
            selection: opp.selection.clone(),
            entity: opp.entity.clone(),
            stake: to_money(alloc.amount)?,
            price: opp.price,
            model_probability: Some(opp.probability),
            edge: Some(opp.edge),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Performance {
    pub bankroll: Decimal,
    pub initial_bankroll: Decimal,
    pub peak_bankroll: Decimal,
    /// Drawdown of equity (bankroll + open stakes) from its peak
    pub current_drawdown: f64,
    pub max_drawdown: f64,
    pub settled_bets: usize,
    pub wins: usize,
    pub losses: usize,
    pub pushes: usize,
    /// Wins over decided (non-push) bets
    pub win_rate: f64,
    pub total_staked: Decimal,
    pub total_profit: Decimal,
    /// Profit over settled stake
    pub roi: f64,
    pub avg_clv: Option<f64>,
    pub clv_positive_rate: Option<f64>,
    pub open_orders: usize,
    pub open_exposure: Decimal,
}

/// Filters for [`SettlementLedger::get_bet_history`]. Results are newest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BetFilter {
    pub event_id: Option<String>,
    pub status: Option<OrderStatus>,
    pub outcome: Option<BetOutcome>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl BetFilter {
    fn matches(&self, order: &Order) -> bool {
        if let Some(event_id) = &self.event_id {
            if &order.event_id != event_id {
                return false;
            }
        }
        if let Some(status) = self.status {
            if order.status != status {
                return false;
            }
        }
        if let Some(outcome) = self.outcome {
            if order.outcome != Some(outcome) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if order.placed_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if order.placed_at > until {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClvSummary {
    pub mean: f64,
    pub median: f64,
    pub positive_rate: f64,
    pub sample_size: usize,
    pub is_sharp: bool,
}

/// Reading of results against closing-line value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Diagnosis {
    InsufficientData,
    /// Beating the close and making money
    SkillProfitable,
    /// Beating the close but losing money
    VarianceUnlucky,
    /// Losing to the close but making money
    VarianceLucky,
    /// Losing to the close and losing money
    NegativeEdge,
}

impl Diagnosis {
    pub fn as_str(&self) -> &'static str {
        match self {
            Diagnosis::InsufficientData => "insufficient_data",
            Diagnosis::SkillProfitable => "skill_profitable",
            Diagnosis::VarianceUnlucky => "variance_unlucky",
            Diagnosis::VarianceLucky => "variance_lucky",
            Diagnosis::NegativeEdge => "negative_edge",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SettlementLedger {
    initial_bankroll: Decimal,
    bankroll: Decimal,
    peak_bankroll: Decimal,
    max_drawdown: f64,
    orders: Vec<Order>,
    next_id: u64,
}

impl SettlementLedger {
    pub fn new(initial_bankroll: Decimal) -> Result<Self> {
        check_bankroll(initial_bankroll)?;
        Ok(Self {
            initial_bankroll,
            bankroll: initial_bankroll,
            peak_bankroll: initial_bankroll,
            max_drawdown: 0.0,
            orders: Vec::new(),
            next_id: 1,
        })
    }

    /// Rebuild a ledger from persisted balances and orders.
    pub fn restore(
        initial_bankroll: Decimal,
        bankroll: Decimal,
        peak_bankroll: Decimal,
        max_drawdown: f64,
        orders: Vec<Order>,
    ) -> Result<Self> {
        check_bankroll(initial_bankroll)?;
        check_bankroll(bankroll)?;
        for order in &orders {
            american_to_decimal(order.price)?;
        }
        let next_id = orders
            .iter()
            .filter_map(|o| o.id.strip_prefix("ord-")?.parse::<u64>().ok())
            .max()
            .map_or(orders.len() as u64 + 1, |n| n + 1);
        let mut ledger = Self {
            initial_bankroll,
            bankroll,
            peak_bankroll: peak_bankroll.max(initial_bankroll),
            max_drawdown,
            orders,
            next_id,
        };
        ledger.track_drawdown();
        Ok(ledger)
    }

    // ── Placement ─────────────────────────────────────────────────────────

    /// Escrow a stake. The bankroll is untouched on any error.
    pub fn place_bet(&mut self, bet: PlaceBet) -> Result<Order> {
        if bet.stake <= Decimal::ZERO {
            return Err(Error::InvalidStake {
                stake: money_to_f64(bet.stake),
            });
        }
        american_to_decimal(bet.price)?;
        if bet.stake > self.bankroll {
            warn!(
                "Insufficient bankroll for {} {}: stake ${:.2}, available ${:.2}",
                bet.event_id, bet.selection, bet.stake, self.bankroll
            );
            return Err(Error::InsufficientBankroll {
                stake: bet.stake,
                available: self.bankroll,
            });
        }

        let order = Order {
            id: format!("ord-{:06}", self.next_id),
            event_id: bet.event_id,
            selection: bet.selection,
            entity: bet.entity,
            stake: bet.stake,
            price: bet.price,
            model_probability: bet.model_probability,
            edge: bet.edge,
            status: OrderStatus::Open,
            outcome: None,
            payout: None,
            profit: None,
            closing_price: None,
            clv: None,
            placed_at: Utc::now(),
            closed_at: None,
        };
        self.next_id += 1;
        self.bankroll -= order.stake;
        info!(
            "Placed {}: ${:.2} on {} {} at {:+} (bankroll ${:.2})",
            order.id, order.stake, order.event_id, order.selection, order.price, self.bankroll
        );
        self.orders.push(order.clone());
        Ok(order)
    }

    /// Cancel an open order and refund its stake.
    pub fn cancel_bet(&mut self, order_id: &str) -> Result<Order> {
        let order = self.open_order_mut(order_id)?;
        order.status = OrderStatus::Cancelled;
        order.payout = Some(order.stake);
        order.profit = Some(Decimal::ZERO);
        order.closed_at = Some(Utc::now());
        let order = order.clone();
        self.bankroll += order.stake;
        info!("Cancelled {}: refunded ${:.2}", order.id, order.stake);
        Ok(order)
    }

    /// Record the market's closing price. CLV is filled in immediately for
    /// settled orders and at settlement for open ones.
    pub fn record_closing_price(&mut self, order_id: &str, closing_price: i32) -> Result<Order> {
        let order = self
            .orders
            .iter_mut()
            .find(|o| o.id == order_id)
            .ok_or_else(|| Error::OrderNotFound {
                order_id: order_id.to_string(),
            })?;
        if order.status == OrderStatus::Cancelled {
            return Err(Error::OrderNotOpen {
                order_id: order_id.to_string(),
                status: order.status,
            });
        }
        let clv = closing_line_value(order.price, closing_price)?;
        order.closing_price = Some(closing_price);
        if order.status == OrderStatus::Settled {
            order.clv = Some(clv);
        }
        debug!(order = %order.id, closing_price, clv, "closing price recorded");
        Ok(order.clone())
    }

    // ── Settlement ────────────────────────────────────────────────────────

    /// Settle open orders whose event appears in `results`. Returns the orders
    /// settled by this call; already-settled and unmatched orders are left alone.
    pub fn settle(&mut self, results: &[GameResult]) -> Vec<Order> {
        let now = Utc::now();
        let mut settled = Vec::new();
        let mut credited = Decimal::ZERO;

        for order in self
            .orders
            .iter_mut()
            .filter(|o| o.status == OrderStatus::Open)
        {
            let Some(result) = results.iter().find(|r| r.event_id == order.event_id) else {
                continue;
            };
            let outcome = order.selection.grade(result);
            let payout = match outcome {
                BetOutcome::Win => match american_profit(order.stake, order.price) {
                    Ok(winnings) => order.stake + winnings,
                    Err(e) => {
                        warn!("Leaving {} open: {}", order.id, e);
                        continue;
                    }
                },
                BetOutcome::Loss => Decimal::ZERO,
                BetOutcome::Push => order.stake,
            };

            order.status = OrderStatus::Settled;
            order.outcome = Some(outcome);
            order.payout = Some(payout);
            order.profit = Some(payout - order.stake);
            order.closed_at = Some(now);
            if let Some(closing) = order.closing_price {
                order.clv = closing_line_value(order.price, closing).ok();
            }
            credited += payout;
            info!(
                "Settled {}: {} {} -> {} (profit ${:.2})",
                order.id,
                order.event_id,
                order.selection,
                outcome.as_str(),
                payout - order.stake
            );
            settled.push(order.clone());
        }

        self.bankroll += credited;
        self.track_drawdown();
        settled
    }

    fn track_drawdown(&mut self) {
        let equity = self.equity();
        if equity > self.peak_bankroll {
            self.peak_bankroll = equity;
        }
        self.max_drawdown = self.max_drawdown.max(self.current_drawdown());
    }

    fn open_order_mut(&mut self, order_id: &str) -> Result<&mut Order> {
        let order = self
            .orders
            .iter_mut()
            .find(|o| o.id == order_id)
            .ok_or_else(|| Error::OrderNotFound {
                order_id: order_id.to_string(),
            })?;
        if order.status != OrderStatus::Open {
            return Err(Error::OrderNotOpen {
                order_id: order_id.to_string(),
                status: order.status,
            });
        }
        Ok(order)
    }

    // ── Read accessors ────────────────────────────────────────────────────

    /// Cash available for new stakes.
    pub fn bankroll(&self) -> Decimal {
        self.bankroll
    }

    pub fn initial_bankroll(&self) -> Decimal {
        self.initial_bankroll
    }

    pub fn peak_bankroll(&self) -> Decimal {
        self.peak_bankroll
    }

    pub fn max_drawdown(&self) -> f64 {
        self.max_drawdown
    }

    /// Bankroll plus stakes still in escrow.
    pub fn equity(&self) -> Decimal {
        self.bankroll + self.open_exposure()
    }

    pub fn open_exposure(&self) -> Decimal {
        self.open_orders().map(|o| o.stake).sum()
    }

    pub fn current_drawdown(&self) -> f64 {
        if self.peak_bankroll <= Decimal::ZERO {
            return 0.0;
        }
        money_to_f64((self.peak_bankroll - self.equity()) / self.peak_bankroll).max(0.0)
    }

    pub fn orders(&self) -> &[Order] {
        &self.orders
    }

    pub fn order(&self, order_id: &str) -> Option<&Order> {
        self.orders.iter().find(|o| o.id == order_id)
    }

    pub fn open_orders(&self) -> impl Iterator<Item = &Order> {
        self.orders.iter().filter(|o| o.status == OrderStatus::Open)
    }

    fn settled_orders(&self) -> impl DoubleEndedIterator<Item = &Order> {
        self.orders
            .iter()
            .filter(|o| o.status == OrderStatus::Settled)
    }

    pub fn get_performance(&self) -> Performance {
        let mut wins = 0;
        let mut losses = 0;
        let mut pushes = 0;
        let mut total_staked = Decimal::ZERO;
        let mut total_profit = Decimal::ZERO;
        let mut clvs = Vec::new();

        for order in self.settled_orders() {
            match order.outcome {
                Some(BetOutcome::Win) => wins += 1,
                Some(BetOutcome::Loss) => losses += 1,
                Some(BetOutcome::Push) => pushes += 1,
                None => {}
            }
            total_staked += order.stake;
            total_profit += order.profit.unwrap_or(Decimal::ZERO);
            if let Some(clv) = order.clv {
                clvs.push(clv);
            }
        }

        let decided = wins + losses;
        let (avg_clv, clv_positive_rate) = if clvs.is_empty() {
            (None, None)
        } else {
            let n = clvs.len() as f64;
            (
                Some(clvs.iter().sum::<f64>() / n),
                Some(clvs.iter().filter(|&&c| c > 0.0).count() as f64 / n),
            )
        };

        Performance {
            bankroll: self.bankroll,
            initial_bankroll: self.initial_bankroll,
            peak_bankroll: self.peak_bankroll,
            current_drawdown: self.current_drawdown(),
            max_drawdown: self.max_drawdown,
            settled_bets: wins + losses + pushes,
            wins,
            losses,
            pushes,
            win_rate: if decided > 0 {
                wins as f64 / decided as f64
            } else {
                0.0
            },
            total_staked,
            total_profit,
            roi: if total_staked > Decimal::ZERO {
                money_to_f64(total_profit / total_staked)
            } else {
                0.0
            },
            avg_clv,
            clv_positive_rate,
            open_orders: self.open_orders().count(),
            open_exposure: self.open_exposure(),
        }
    }

    pub fn get_bet_history(&self, filter: &BetFilter) -> Vec<Order> {
        let matching = self.orders.iter().rev().filter(|o| filter.matches(o));
        match filter.limit {
            Some(limit) => matching.take(limit).cloned().collect(),
            None => matching.cloned().collect(),
        }
    }

    /// CLV statistics over the most recent `window` settled orders that have one.
    pub fn rolling_clv(&self, window: usize) -> ClvSummary {
        summarize_clv(
            self.settled_orders()
                .rev()
                .filter_map(|o| o.clv)
                .take(window)
                .collect(),
        )
    }

    /// CLV statistics per market over every settled order that has one.
    pub fn clv_by_market(&self) -> BTreeMap<Market, ClvSummary> {
        let mut by_market: BTreeMap<Market, Vec<f64>> = BTreeMap::new();
        for order in self.settled_orders() {
            if let Some(clv) = order.clv {
                by_market
                    .entry(order.selection.market())
                    .or_default()
                    .push(clv);
            }
        }
        by_market
            .into_iter()
            .map(|(market, values)| (market, summarize_clv(values)))
            .collect()
    }

    /// Separate skill from variance: a record only counts as beating the
    /// close once its mean CLV reaches [`SHARP_CLV_THRESHOLD`].
    pub fn diagnose(&self, min_sample: usize) -> Diagnosis {
        let clv = self.rolling_clv(usize::MAX);
        if clv.sample_size == 0 || clv.sample_size < min_sample {
            return Diagnosis::InsufficientData;
        }
        let profitable = self.get_performance().total_profit > Decimal::ZERO;
        match (clv.is_sharp, profitable) {
            (true, true) => Diagnosis::SkillProfitable,
            (true, false) => Diagnosis::VarianceUnlucky,
            (false, true) => Diagnosis::VarianceLucky,
            (false, false) => Diagnosis::NegativeEdge,
        }
    }
}

fn summarize_clv(mut values: Vec<f64>) -> ClvSummary {
    if values.is_empty() {
        return ClvSummary {
            mean: 0.0,
            median: 0.0,
            positive_rate: 0.0,
            sample_size: 0,
            is_sharp: false,
        };
    }
    let n = values.len();
    let mean = values.iter().sum::<f64>() / n as f64;
    let positive_rate = values.iter().filter(|&&c| c > 0.0).count() as f64 / n as f64;
    values.sort_by(|a, b| a.total_cmp(b));
    let median = if n % 2 == 0 {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    } else {
        values[n / 2]
    };
    ClvSummary {
        mean,
        median,
        positive_rate,
        sample_size: n,
        is_sharp: mean >= SHARP_CLV_THRESHOLD,
    }
}

fn check_bankroll(bankroll: Decimal) -> Result<()> {
    if bankroll < Decimal::ZERO {
        return Err(Error::InvalidBankroll {
            bankroll: money_to_f64(bankroll),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rust_decimal_macros::dec;

    fn bet(event: &str, selection: Selection, stake: Decimal, price: i32) -> PlaceBet {
        PlaceBet {
            event_id: event.into(),
            selection,
            entity: "A".into(),
            stake,
            price,
            model_probability: Some(0.55),
            edge: Some(0.03),
        }
    }

    fn result(event: &str, home: i32, away: i32) -> GameResult {
        GameResult {
            event_id: event.into(),
            home_score: home,
            away_score: away,
            total_runs: None,
        }
    }

    #[test]
    fn money_conversion_truncates_to_cents() {
        assert_eq!(to_money(380.48).unwrap(), dec!(380.48));
        assert_eq!(to_money(380.489).unwrap(), dec!(380.48));
        assert_eq!(to_money(12.3456789).unwrap(), dec!(12.34));
        assert_eq!(to_money(0.1 + 0.2).unwrap(), dec!(0.30));
        assert!(to_money(f64::NAN).is_err());
        assert!(to_money(f64::INFINITY).is_err());
        assert_relative_eq!(money_to_f64(dec!(5115.39)), 5115.39);
    }

    #[test]
    fn placement_escrows_stake() {
        let mut ledger = SettlementLedger::new(dec!(1000)).unwrap();
        let order = ledger.place_bet(bet("g1", Selection::Home, dec!(100), 150)).unwrap();
        assert_eq!(order.id, "ord-000001");
        assert_eq!(order.status, OrderStatus::Open);
        assert_eq!(ledger.bankroll(), dec!(900));
        assert_eq!(ledger.equity(), dec!(1000));
        assert_eq!(ledger.open_exposure(), dec!(100));
    }

    #[test]
    fn rejected_placements_leave_bankroll_unchanged() {
        let mut ledger = SettlementLedger::new(dec!(100)).unwrap();
        let err = ledger.place_bet(bet("g1", Selection::Home, dec!(150), 110)).unwrap_err();
        assert_eq!(
            err,
            Error::InsufficientBankroll {
                stake: dec!(150),
                available: dec!(100)
            }
        );
        assert_eq!(
            ledger.place_bet(bet("g1", Selection::Home, dec!(10), 0)).unwrap_err(),
            Error::InvalidPrice { price: 0 }
        );
        assert!(ledger.place_bet(bet("g1", Selection::Home, dec!(0), 110)).is_err());
        assert!(ledger.place_bet(bet("g1", Selection::Home, dec!(-5), 110)).is_err());
        assert_eq!(ledger.bankroll(), dec!(100));
        assert!(ledger.orders().is_empty());
    }

    #[test]
    fn place_then_cancel_restores_bankroll_exactly() {
        let mut ledger = SettlementLedger::new(to_money(5115.39).unwrap()).unwrap();
        let stake = to_money(380.48).unwrap();
        let order = ledger.place_bet(bet("g1", Selection::Away, stake, -135)).unwrap();
        assert_eq!(ledger.bankroll(), dec!(4734.91));
        let cancelled = ledger.cancel_bet(&order.id).unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(cancelled.payout, Some(dec!(380.48)));
        assert_eq!(ledger.bankroll(), dec!(5115.39));
        assert!(matches!(
            ledger.cancel_bet(&order.id),
            Err(Error::OrderNotOpen { .. })
        ));
        assert!(matches!(
            ledger.cancel_bet("ord-999999"),
            Err(Error::OrderNotFound { .. })
        ));
    }

    #[test]
    fn escrow_round_trip_is_exact_for_any_cent_amounts() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..5_000 {
            let bankroll_cents: i64 = rng.gen_range(100..100_000_000);
            let stake_cents: i64 = rng.gen_range(1..=bankroll_cents);
            let bankroll = to_money(bankroll_cents as f64 / 100.0).unwrap();
            let stake = to_money(stake_cents as f64 / 100.0).unwrap();
            assert_eq!(bankroll, Decimal::new(bankroll_cents, 2));
            assert_eq!(stake, Decimal::new(stake_cents, 2));

            let mut ledger = SettlementLedger::new(bankroll).unwrap();
            let first = ledger.place_bet(bet("g1", Selection::Home, stake, 110)).unwrap();
            ledger.cancel_bet(&first.id).unwrap();
            assert_eq!(ledger.bankroll(), bankroll);
            assert_eq!(ledger.equity(), bankroll);
        }
    }

    #[test]
    fn settlement_pays_american_odds() {
        let mut ledger = SettlementLedger::new(dec!(1000)).unwrap();
        ledger.place_bet(bet("g1", Selection::Home, dec!(100), 150)).unwrap();
        ledger.place_bet(bet("g2", Selection::Home, dec!(100), -200)).unwrap();
        ledger.place_bet(bet("g3", Selection::Home, dec!(100), -110)).unwrap();
        ledger.place_bet(bet("g4", Selection::Away, dec!(50), -110)).unwrap();

        let settled = ledger.settle(&[result("g1", 5, 2), result("g2", 1, 3), result("g3", 4, 4)]);
        assert_eq!(settled.len(), 3);
        assert_eq!(settled[0].payout, Some(dec!(250)));
        assert_eq!(settled[0].profit, Some(dec!(150)));
        assert_eq!(settled[1].outcome, Some(BetOutcome::Loss));
        assert_eq!(settled[1].profit, Some(dec!(-100)));
        assert_eq!(settled[2].outcome, Some(BetOutcome::Push));
        assert_eq!(settled[2].payout, Some(dec!(100)));

        // 1000 − 350 staked + 250 + 0 + 100
        assert_eq!(ledger.bankroll(), dec!(1000));
        assert_eq!(ledger.open_orders().count(), 1);
    }

    #[test]
    fn settlement_is_idempotent() {
        let mut ledger = SettlementLedger::new(dec!(1000)).unwrap();
        ledger.place_bet(bet("g1", Selection::Home, dec!(100), 100)).unwrap();
        let results = [result("g1", 3, 1), result("unknown", 0, 1)];
        assert_eq!(ledger.settle(&results).len(), 1);
        let after_first = ledger.bankroll();
        assert!(ledger.settle(&results).is_empty());
        assert_eq!(ledger.bankroll(), after_first);
        assert_eq!(after_first, dec!(1100));
    }

    #[test]
    fn closing_line_value_before_and_after_settlement() {
        let mut ledger = SettlementLedger::new(dec!(1000)).unwrap();
        let early = ledger.place_bet(bet("g1", Selection::Home, dec!(10), 110)).unwrap();
        let late = ledger.place_bet(bet("g2", Selection::Home, dec!(10), 110)).unwrap();

        let pending = ledger.record_closing_price(&early.id, -120).unwrap();
        assert_eq!(pending.clv, None);
        ledger.settle(&[result("g1", 2, 1), result("g2", 2, 1)]);
        let expected = 120.0 / 220.0 - 100.0 / 210.0;
        assert_relative_eq!(ledger.order(&early.id).unwrap().clv.unwrap(), expected, epsilon = 1e-12);

        let recorded = ledger.record_closing_price(&late.id, 120).unwrap();
        assert!(recorded.clv.unwrap() < 0.0);
        assert!(ledger.record_closing_price(&late.id, 0).is_err());
    }

    #[test]
    fn closing_price_refused_on_cancelled_order() {
        let mut ledger = SettlementLedger::new(dec!(1000)).unwrap();
        let order = ledger.place_bet(bet("g1", Selection::Home, dec!(10), 110)).unwrap();
        ledger.cancel_bet(&order.id).unwrap();
        assert!(matches!(
            ledger.record_closing_price(&order.id, -120),
            Err(Error::OrderNotOpen { .. })
        ));
    }

    #[test]
    fn performance_statistics() {
        let mut ledger = SettlementLedger::new(dec!(1000)).unwrap();
        for i in 0..4 {
            let order = ledger
                .place_bet(bet(&format!("g{}", i), Selection::Home, dec!(100), 100))
                .unwrap();
            ledger.record_closing_price(&order.id, -110).unwrap();
        }
        ledger.place_bet(bet("open", Selection::Home, dec!(40), 100)).unwrap();
        ledger.settle(&[
            result("g0", 2, 1),
            result("g1", 2, 1),
            result("g2", 1, 2),
            result("g3", 1, 1),
        ]);

        let perf = ledger.get_performance();
        assert_eq!((perf.wins, perf.losses, perf.pushes), (2, 1, 1));
        assert_eq!(perf.settled_bets, 4);
        assert_relative_eq!(perf.win_rate, 2.0 / 3.0, epsilon = 1e-12);
        assert_eq!(perf.total_staked, dec!(400));
        assert_eq!(perf.total_profit, dec!(100));
        assert_relative_eq!(perf.roi, 0.25, epsilon = 1e-12);
        assert_relative_eq!(perf.clv_positive_rate.unwrap(), 1.0);
        assert_eq!(perf.open_orders, 1);
        assert_eq!(perf.open_exposure, dec!(40));
        assert_eq!(perf.bankroll, dec!(1060));
        assert_eq!(perf.peak_bankroll, dec!(1100));
    }

    #[test]
    fn drawdown_tracks_equity() {
        let mut ledger = SettlementLedger::new(dec!(1000)).unwrap();
        ledger.place_bet(bet("g1", Selection::Home, dec!(200), 100)).unwrap();
        assert_eq!(ledger.current_drawdown(), 0.0);
        ledger.settle(&[result("g1", 0, 1)]);
        assert_relative_eq!(ledger.current_drawdown(), 0.2, epsilon = 1e-12);
        ledger.place_bet(bet("g2", Selection::Home, dec!(100), 100)).unwrap();
        ledger.settle(&[result("g2", 1, 0)]);
        assert_relative_eq!(ledger.current_drawdown(), 0.1, epsilon = 1e-12);
        assert_relative_eq!(ledger.max_drawdown(), 0.2, epsilon = 1e-12);
    }

    #[test]
    fn bet_history_filters() {
        let mut ledger = SettlementLedger::new(dec!(1000)).unwrap();
        ledger.place_bet(bet("g1", Selection::Home, dec!(10), 100)).unwrap();
        ledger.place_bet(bet("g1", Selection::Away, dec!(10), 100)).unwrap();
        ledger.place_bet(bet("g2", Selection::Home, dec!(10), 100)).unwrap();
        ledger.settle(&[result("g1", 3, 2)]);

        let g1 = ledger.get_bet_history(&BetFilter {
            event_id: Some("g1".into()),
            ..BetFilter::default()
        });
        assert_eq!(g1.len(), 2);
        assert_eq!(g1[0].id, "ord-000002");

        let open = ledger.get_bet_history(&BetFilter {
            status: Some(OrderStatus::Open),
            ..BetFilter::default()
        });
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].event_id, "g2");

        let wins = ledger.get_bet_history(&BetFilter {
            outcome: Some(BetOutcome::Win),
            ..BetFilter::default()
        });
        assert_eq!(wins.len(), 1);

        let limited = ledger.get_bet_history(&BetFilter {
            limit: Some(1),
            ..BetFilter::default()
        });
        assert_eq!(limited[0].id, "ord-000003");

        let future = ledger.get_bet_history(&BetFilter {
            since: Some(Utc::now() + chrono::Duration::hours(1)),
            ..BetFilter::default()
        });
        assert!(future.is_empty());
    }

    #[test]
    fn clv_summary_and_diagnosis() {
        let mut ledger = SettlementLedger::new(dec!(1000)).unwrap();
        assert_eq!(ledger.diagnose(1), Diagnosis::InsufficientData);
        let closes = [-150, -140, 130];
        for (i, close) in closes.iter().enumerate() {
            let order = ledger
                .place_bet(bet(&format!("g{}", i), Selection::Home, dec!(50), 110))
                .unwrap();
            ledger.record_closing_price(&order.id, *close).unwrap();
        }
        ledger.settle(&[result("g0", 0, 1), result("g1", 0, 1), result("g2", 0, 1)]);

        let summary = ledger.rolling_clv(10);
        assert_eq!(summary.sample_size, 3);
        assert_relative_eq!(summary.positive_rate, 2.0 / 3.0, epsilon = 1e-12);
        assert!(summary.is_sharp);
        assert_relative_eq!(
            summary.median,
            140.0 / 240.0 - 100.0 / 210.0,
            epsilon = 1e-12
        );
        assert_eq!(ledger.rolling_clv(1).sample_size, 1);

        assert_eq!(ledger.diagnose(5), Diagnosis::InsufficientData);
        assert_eq!(ledger.diagnose(3), Diagnosis::VarianceUnlucky);
        assert_eq!(Diagnosis::VarianceUnlucky.as_str(), "variance_unlucky");
    }

    fn winning_record(close: i32) -> SettlementLedger {
        let mut ledger = SettlementLedger::new(dec!(1000)).unwrap();
        for i in 0..3 {
            let order = ledger
                .place_bet(bet(&format!("g{}", i), Selection::Home, dec!(50), 110))
                .unwrap();
            ledger.record_closing_price(&order.id, close).unwrap();
        }
        ledger.settle(&[result("g0", 2, 1), result("g1", 2, 1), result("g2", 2, 1)]);
        ledger
    }

    #[test]
    fn thin_positive_clv_is_not_skill() {
        // +110 closing at +105 beats the close by about 1.2 points.
        let thin = winning_record(105);
        let clv = thin.rolling_clv(10);
        assert!(clv.mean > 0.0 && clv.mean < SHARP_CLV_THRESHOLD);
        assert!(!clv.is_sharp);
        assert!(thin.get_performance().total_profit > Decimal::ZERO);
        assert_eq!(thin.diagnose(3), Diagnosis::VarianceLucky);

        let sharp = winning_record(-150);
        assert!(sharp.rolling_clv(10).is_sharp);
        assert_eq!(sharp.diagnose(3), Diagnosis::SkillProfitable);
    }

    #[test]
    fn clv_is_broken_down_by_market() {
        let mut ledger = SettlementLedger::new(dec!(1000)).unwrap();
        let ml = ledger.place_bet(bet("g1", Selection::Home, dec!(10), 110)).unwrap();
        let over = ledger
            .place_bet(bet("g2", Selection::Over { line: 8.5 }, dec!(10), 110))
            .unwrap();
        let under = ledger
            .place_bet(bet("g3", Selection::Under { line: 7.5 }, dec!(10), -110))
            .unwrap();
        let open = ledger.place_bet(bet("g4", Selection::Away, dec!(10), 110)).unwrap();
        ledger.record_closing_price(&ml.id, -120).unwrap();
        ledger.record_closing_price(&over.id, 120).unwrap();
        ledger.record_closing_price(&under.id, -110).unwrap();
        ledger.record_closing_price(&open.id, -200).unwrap();
        ledger.settle(&[result("g1", 3, 1), result("g2", 5, 4), result("g3", 2, 2)]);

        let by_market = ledger.clv_by_market();
        assert_eq!(by_market.len(), 2);
        let moneyline = &by_market[&Market::Moneyline];
        assert_eq!(moneyline.sample_size, 1);
        assert_relative_eq!(moneyline.mean, 120.0 / 220.0 - 100.0 / 210.0, epsilon = 1e-12);
        let total = &by_market[&Market::Total];
        assert_eq!(total.sample_size, 2);
        assert_relative_eq!(total.mean, (100.0 / 220.0 - 100.0 / 210.0) / 2.0, epsilon = 1e-12);
        assert_relative_eq!(total.positive_rate, 0.0);
    }

    #[test]
    fn restore_continues_order_ids() {
        let mut ledger = SettlementLedger::new(dec!(500)).unwrap();
        ledger.place_bet(bet("g1", Selection::Home, dec!(10), 100)).unwrap();
        ledger.place_bet(bet("g2", Selection::Home, dec!(10), 100)).unwrap();
        let orders = ledger.orders().to_vec();
        let mut restored =
            SettlementLedger::restore(dec!(500), dec!(480), dec!(500), 0.0, orders).unwrap();
        assert_eq!(restored.equity(), dec!(500));
        let order = restored.place_bet(bet("g3", Selection::Home, dec!(10), 100)).unwrap();
        assert_eq!(order.id, "ord-000003");
    }

    #[test]
    fn invalid_bankroll() {
        assert!(SettlementLedger::new(dec!(-1)).is_err());
        assert!(SettlementLedger::new(Decimal::ZERO).is_ok());
    }
}
