use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::risk::RiskConfig;
use crate::sizing::{CorrelationModel, OptimizerConfig};

/// Covariance-aware Kelly bet sizing with layered risk controls
#[derive(Parser, Debug, Clone)]
#[command(name = "stakewise", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub config: Config,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run a seeded paper-trading simulation on synthetic slates
    Simulate {
        #[arg(long, default_value = "60")]
        days: u32,
        #[arg(long, default_value = "42")]
        seed: u64,
    },
    /// Size and filter a slate without placing anything
    Plan {
        #[arg(long)]
        predictions: PathBuf,
        #[arg(long)]
        odds: PathBuf,
    },
    /// Size, filter and place a slate into the ledger
    Place {
        #[arg(long)]
        predictions: PathBuf,
        #[arg(long)]
        odds: PathBuf,
    },
    /// Settle open orders against a results file
    Settle {
        #[arg(long)]
        results: PathBuf,
    },
    /// Record the closing price of an order
    CloseLine {
        #[arg(long)]
        order: String,
        #[arg(long, allow_hyphen_values = true)]
        price: i32,
    },
    /// Cancel an open order (full refund)
    Cancel {
        #[arg(long)]
        order: String,
    },
    /// Signal a day boundary (resets daily exposure)
    NewDay,
    /// Signal a week boundary (resets daily and weekly exposure)
    NewWeek,
    /// Print performance statistics
    Report,
    /// Serve the read-only reporting API
    Serve,
}

/// Flat numeric knobs shared by every subcommand
#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Starting bankroll when the database is empty
    #[arg(long, env = "INITIAL_BANKROLL", default_value = "10000.0")]
    pub initial_bankroll: f64,

    /// Fractional Kelly multiplier (0.0–1.0]
    #[arg(long, env = "KELLY_FRACTION", default_value = "0.25")]
    pub kelly_fraction: f64,

    /// Per-bet ceiling as a fraction of bankroll
    #[arg(long, env = "MAX_SINGLE_BET", default_value = "0.05")]
    pub max_single_bet: f64,

    /// Aggregate ceiling for one slate as a fraction of bankroll
    #[arg(long, env = "MAX_EXPOSURE", default_value = "0.25")]
    pub max_exposure: f64,

    /// Per-event ceiling as a fraction of bankroll
    #[arg(long, env = "MAX_GAME_EXPOSURE", default_value = "0.075")]
    pub max_game_exposure: f64,

    /// Correlation penalty weight λ
    #[arg(long, env = "RISK_AVERSION", default_value = "0.5")]
    pub risk_aversion: f64,

    /// Use heuristic correlations (false = independence assumption)
    #[arg(long, env = "USE_COVARIANCE_MATRIX", default_value = "true", action = ArgAction::Set)]
    pub use_covariance_matrix: bool,

    #[arg(long, env = "CORRELATION_SAME_SIDE", default_value = "0.7")]
    pub correlation_same_side: f64,

    #[arg(long, env = "CORRELATION_OPPOSITE_SIDE", default_value = "0.3")]
    pub correlation_opposite_side: f64,

    /// Same event, different market (moneyline vs total)
    #[arg(long, env = "CORRELATION_OTHER_MARKET", default_value = "0.0")]
    pub correlation_other_market: f64,

    #[arg(long, env = "CORRELATION_SAME_ENTITY", default_value = "0.2")]
    pub correlation_same_entity: f64,

    /// Measure same-event correlations from settled orders
    #[arg(long, env = "USE_EMPIRICAL_CORRELATIONS", default_value = "true", action = ArgAction::Set)]
    pub use_empirical_correlations: bool,

    /// Settled pairs needed before a measured correlation is trusted
    #[arg(long, env = "EMPIRICAL_MIN_SAMPLES", default_value = "30")]
    pub empirical_min_samples: usize,

    /// Coordinate-ascent sweep cap
    #[arg(long, env = "MAX_SWEEPS", default_value = "200")]
    pub max_sweeps: usize,

    #[arg(long, env = "CONVERGENCE_TOLERANCE", default_value = "1e-10")]
    pub convergence_tolerance: f64,

    #[arg(long, env = "SEARCH_TOLERANCE", default_value = "1e-9")]
    pub search_tolerance: f64,

    #[arg(long, env = "MIN_CONFIDENCE", default_value = "0.55")]
    pub min_confidence: f64,

    #[arg(long, env = "MAX_CONFIDENCE", default_value = "1.0")]
    pub max_confidence: f64,

    /// Confidence at which stakes are no longer scaled down
    #[arg(long, env = "FULL_CONFIDENCE", default_value = "0.75")]
    pub full_confidence: f64,

    #[arg(long, env = "MIN_MODEL_PROB", default_value = "0.05")]
    pub min_model_prob: f64,

    #[arg(long, env = "MAX_MODEL_PROB", default_value = "0.95")]
    pub max_model_prob: f64,

    #[arg(long, env = "MIN_EDGE", default_value = "0.0")]
    pub min_edge: f64,

    #[arg(long, env = "MAX_EDGE", default_value = "0.30")]
    pub max_edge: f64,

    /// Drawdown at which the stake penalty bottoms out
    #[arg(long, env = "MAX_DRAWDOWN", default_value = "0.30")]
    pub max_drawdown: f64,

    #[arg(long, env = "DRAWDOWN_FLOOR", default_value = "0.25")]
    pub drawdown_floor: f64,

    /// Stake multiplier while on a losing streak
    #[arg(long, env = "STREAK_REDUCTION", default_value = "0.5")]
    pub streak_reduction: f64,

    #[arg(long, env = "LOSING_STREAK_THRESHOLD", default_value = "3")]
    pub losing_streak_threshold: u32,

    #[arg(long, env = "DAILY_EXPOSURE_LIMIT", default_value = "0.25")]
    pub daily_exposure_limit: f64,

    #[arg(long, env = "WEEKLY_EXPOSURE_LIMIT", default_value = "0.60")]
    pub weekly_exposure_limit: f64,

    /// Smallest stake worth placing (currency units)
    #[arg(long, env = "MIN_STAKE", default_value = "1.0")]
    pub min_stake: f64,

    /// Settled bets kept for streak and CLV bookkeeping
    #[arg(long, env = "HISTORY_LIMIT", default_value = "500")]
    pub history_limit: usize,

    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = "stakewise.db")]
    pub database_path: String,

    /// Reporting API listen address
    #[arg(long, env = "DASHBOARD_ADDR", default_value = "127.0.0.1:8080")]
    pub dashboard_addr: String,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.initial_bankroll.is_finite() || self.initial_bankroll <= 0.0 {
            anyhow::bail!("initial_bankroll must be positive");
        }
        if !(self.kelly_fraction > 0.0 && self.kelly_fraction <= 1.0) {
            anyhow::bail!("kelly_fraction must be in (0.0, 1.0]");
        }
        for (name, value) in [
            ("max_single_bet", self.max_single_bet),
            ("max_exposure", self.max_exposure),
            ("max_game_exposure", self.max_game_exposure),
            ("daily_exposure_limit", self.daily_exposure_limit),
            ("weekly_exposure_limit", self.weekly_exposure_limit),
        ] {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("{} must be between 0.0 and 1.0", name);
            }
        }
        for (name, value) in [
            ("correlation_same_side", self.correlation_same_side),
            ("correlation_opposite_side", self.correlation_opposite_side),
            ("correlation_other_market", self.correlation_other_market),
            ("correlation_same_entity", self.correlation_same_entity),
        ] {
            if !(-1.0..=1.0).contains(&value) {
                anyhow::bail!("{} must be between -1.0 and 1.0", name);
            }
        }
        if self.risk_aversion < 0.0 {
            anyhow::bail!("risk_aversion must be non-negative");
        }
        if self.max_sweeps == 0 {
            anyhow::bail!("max_sweeps must be at least 1");
        }
        if self.empirical_min_samples == 0 {
            anyhow::bail!("empirical_min_samples must be at least 1");
        }
        self.optimizer_config().validate()?;
        self.risk_config().validate()?;
        Ok(())
    }

    pub fn optimizer_config(&self) -> OptimizerConfig {
        OptimizerConfig {
            kelly_fraction: self.kelly_fraction,
            max_single_bet: self.max_single_bet,
            max_exposure: self.max_exposure,
            max_game_exposure: self.max_game_exposure,
            risk_aversion: self.risk_aversion,
            use_covariance_matrix: self.use_covariance_matrix,
            correlation: CorrelationModel {
                same_event_same_side: self.correlation_same_side,
                same_event_other_side: self.correlation_opposite_side,
                same_event_other_market: self.correlation_other_market,
                same_entity: self.correlation_same_entity,
            },
            use_empirical_correlations: self.use_empirical_correlations,
            empirical_min_samples: self.empirical_min_samples,
            max_sweeps: self.max_sweeps,
            convergence_tolerance: self.convergence_tolerance,
            search_tolerance: self.search_tolerance,
            ..OptimizerConfig::default()
        }
    }

    pub fn risk_config(&self) -> RiskConfig {
        RiskConfig {
            min_confidence: self.min_confidence,
            max_confidence: self.max_confidence,
            full_confidence: self.full_confidence,
            min_model_prob: self.min_model_prob,
            max_model_prob: self.max_model_prob,
            min_edge: self.min_edge,
            max_edge: self.max_edge,
            max_drawdown: self.max_drawdown,
            drawdown_floor: self.drawdown_floor,
            streak_reduction: self.streak_reduction,
            losing_streak_threshold: self.losing_streak_threshold,
            daily_exposure_limit: self.daily_exposure_limit,
            weekly_exposure_limit: self.weekly_exposure_limit,
            max_game_exposure: self.max_game_exposure,
            min_stake: self.min_stake,
            history_limit: self.history_limit,
        }
    }
}
