use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::sizing::kelly;

/// Which outcome of an event a wager backs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Selection {
    Home,
    Away,
    Over { line: f64 },
    Under { line: f64 },
}

/// A selection with its line dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionKind {
    Home,
    Away,
    Over,
    Under,
}

impl SelectionKind {
    pub fn market(&self) -> Market {
        match self {
            SelectionKind::Home | SelectionKind::Away => Market::Moneyline,
            SelectionKind::Over | SelectionKind::Under => Market::Total,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Market {
    Moneyline,
    Total,
}

impl Market {
    pub fn as_str(&self) -> &'static str {
        match self {
            Market::Moneyline => "moneyline",
            Market::Total => "total",
        }
    }
}

impl Selection {
    pub fn kind(&self) -> SelectionKind {
        match self {
            Selection::Home => SelectionKind::Home,
            Selection::Away => SelectionKind::Away,
            Selection::Over { .. } => SelectionKind::Over,
            Selection::Under { .. } => SelectionKind::Under,
        }
    }

    pub fn market(&self) -> Market {
        self.kind().market()
    }

    /// True for opposite directions of the same market (home/away, over/under
    /// at any lines).
    pub fn is_opposite(&self, other: &Selection) -> bool {
        self.market() == other.market() && self.kind() != other.kind()
    }

    /// Grade this selection against a final score.
    ///
    /// Totals use `total_runs` when the results feed provides it, otherwise the
    /// sum of both scores. Landing exactly on the line, or a drawn moneyline,
    /// is a push.
    pub fn grade(&self, result: &GameResult) -> BetOutcome {
        let total = result
            .total_runs
            .unwrap_or(result.home_score + result.away_score) as f64;
        let margin = match self {
            Selection::Home => (result.home_score - result.away_score) as f64,
            Selection::Away => (result.away_score - result.home_score) as f64,
            Selection::Over { line } => total - line,
            Selection::Under { line } => line - total,
        };
        if margin > 0.0 {
            BetOutcome::Win
        } else if margin < 0.0 {
            BetOutcome::Loss
        } else {
            BetOutcome::Push
        }
    }
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selection::Home => write!(f, "home"),
            Selection::Away => write!(f, "away"),
            Selection::Over { line } => write!(f, "over {}", line),
            Selection::Under { line } => write!(f, "under {}", line),
        }
    }
}

/// A candidate wager produced upstream. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    /// `"{event_id}:{selection}"`
    pub id: String,
    pub event_id: String,
    pub selection: Selection,
    /// Participant the wager is on (e.g. a team), used for cross-event correlation
    pub entity: String,
    /// Model-estimated win probability, in (0, 1)
    pub probability: f64,
    /// Quoted American price
    pub price: i32,
    /// `probability · decimal(price) − 1`
    pub edge: f64,
    /// Upstream confidence score in [0, 1]
    pub confidence: Option<f64>,
}

impl Opportunity {
    /// Build an opportunity, validating price, probability and confidence and
    /// deriving the edge.
    pub fn new(
        event_id: impl Into<String>,
        selection: Selection,
        entity: impl Into<String>,
        probability: f64,
        price: i32,
        confidence: Option<f64>,
    ) -> Result<Self> {
        let event_id = event_id.into();
        let edge = kelly::edge(probability, price)?;
        if let Some(c) = confidence {
            if !(0.0..=1.0).contains(&c) {
                return Err(Error::InvalidConfidence { confidence: c });
            }
        }
        Ok(Opportunity {
            id: format!("{}:{}", event_id, selection),
            event_id,
            selection,
            entity: entity.into(),
            probability,
            price,
            edge,
            confidence,
        })
    }

    /// Confidence used by the risk gate; a missing score counts as full confidence.
    pub fn confidence_or_full(&self) -> f64 {
        self.confidence.unwrap_or(1.0)
    }
}

/// Optimizer output for one opportunity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub opportunity: Opportunity,
    /// Fraction of bankroll, in [0, max_single_bet]
    pub fraction: f64,
    /// `fraction · bankroll`
    pub amount: f64,
    /// `amount · edge`
    pub expected_value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    Settled,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Open => "open",
            OrderStatus::Settled => "settled",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "open" => Ok(OrderStatus::Open),
            "settled" => Ok(OrderStatus::Settled),
            "cancelled" => Ok(OrderStatus::Cancelled),
            other => anyhow::bail!("unknown order status '{}'", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetOutcome {
    Win,
    Loss,
    Push,
}

impl BetOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            BetOutcome::Win => "win",
            BetOutcome::Loss => "loss",
            BetOutcome::Push => "push",
        }
    }
}

impl FromStr for BetOutcome {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "win" => Ok(BetOutcome::Win),
            "loss" => Ok(BetOutcome::Loss),
            "push" => Ok(BetOutcome::Push),
            other => anyhow::bail!("unknown bet outcome '{}'", other),
        }
    }
}

/// A placed stake. Transitions exactly once from `Open` to a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub event_id: String,
    pub selection: Selection,
    pub entity: String,
    /// Escrowed amount
    pub stake: Decimal,
    /// American price at placement
    pub price: i32,
    pub model_probability: Option<f64>,
    pub edge: Option<f64>,
    pub status: OrderStatus,
    pub outcome: Option<BetOutcome>,
    /// Amount credited back on settlement (stake + winnings, stake on push, 0 on loss)
    pub payout: Option<Decimal>,
    pub profit: Option<Decimal>,
    /// American price at market close, when known
    pub closing_price: Option<i32>,
    /// Implied probability at close minus implied probability at placement
    pub clv: Option<f64>,
    pub placed_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Final score from the results feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameResult {
    pub event_id: String,
    pub home_score: i32,
    pub away_score: i32,
    #[serde(default)]
    pub total_runs: Option<i32>,
}
