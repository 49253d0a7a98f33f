pub mod config;
pub mod dashboard;
pub mod db;
pub mod engine;
pub mod error;
pub mod feeds;
pub mod ledger;
pub mod models;
pub mod risk;
pub mod simulation;
pub mod sizing;

pub use engine::BettingEngine;
pub use error::{Error, Result};
pub use ledger::SettlementLedger;
pub use risk::RiskManager;
pub use sizing::PortfolioOptimizer;
