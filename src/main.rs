use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::info;

use stakewise::config::{Cli, Command, Config};
use stakewise::dashboard::{self, AppState};
use stakewise::db::Database;
use stakewise::engine::BettingEngine;
use stakewise::feeds::{load_slate, JsonFileFeed, ResultsSource};
use stakewise::simulation::{run_simulation, SimulationConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.config;
    config.validate()?;

    match cli.command {
        Command::Simulate { days, seed } => {
            // Simulations never touch the database.
            let mut engine = BettingEngine::new(
                config.optimizer_config(),
                config.risk_config(),
                config.initial_bankroll,
            )?;
            let summary = run_simulation(
                &mut engine,
                &SimulationConfig {
                    days,
                    seed,
                    ..SimulationConfig::default()
                },
            )?;
            print_json(&summary)?;
        }
        Command::Plan { predictions, odds } => {
            let (_, engine) = open_engine(&config)?;
            let slate = load_slate(&JsonFileFeed::new(predictions), &JsonFileFeed::new(odds)).await?;
            print_json(&engine.plan(&slate)?)?;
        }
        Command::Place { predictions, odds } => {
            let (db, mut engine) = open_engine(&config)?;
            let slate = load_slate(&JsonFileFeed::new(predictions), &JsonFileFeed::new(odds)).await?;
            let report = engine.place_slate(&slate)?;
            db.save_engine(&engine)?;
            print_json(&report)?;
        }
        Command::Settle { results } => {
            let (db, mut engine) = open_engine(&config)?;
            let results = JsonFileFeed::new(results).fetch_results().await?;
            let settled = engine.settle(&results);
            db.save_engine(&engine)?;
            info!("Settled {} order(s)", settled.len());
            print_json(&settled)?;
        }
        Command::CloseLine { order, price } => {
            let (db, mut engine) = open_engine(&config)?;
            let order = engine.record_closing_price(&order, price)?;
            db.save_engine(&engine)?;
            print_json(&order)?;
        }
        Command::Cancel { order } => {
            let (db, mut engine) = open_engine(&config)?;
            let order = engine.cancel(&order)?;
            db.save_engine(&engine)?;
            print_json(&order)?;
        }
        Command::NewDay => {
            let (db, mut engine) = open_engine(&config)?;
            engine.start_new_day();
            db.save_engine(&engine)?;
        }
        Command::NewWeek => {
            let (db, mut engine) = open_engine(&config)?;
            engine.start_new_week();
            db.save_engine(&engine)?;
        }
        Command::Report => {
            let (_, engine) = open_engine(&config)?;
            print_json(&engine.ledger().get_performance())?;
        }
        Command::Serve => {
            let db = open_db(&config)?;
            let state = AppState {
                db,
                initial_bankroll: config.initial_bankroll,
            };
            dashboard::serve(state, &config.dashboard_addr).await?;
        }
    }

    Ok(())
}

fn open_db(config: &Config) -> Result<Database> {
    let db = Database::open(&config.database_path)?;
    info!("Database opened: {}", config.database_path);
    Ok(db)
}

fn open_engine(config: &Config) -> Result<(Database, BettingEngine)> {
    let db = open_db(config)?;
    let engine = db
        .load_engine(
            config.optimizer_config(),
            config.risk_config(),
            config.initial_bankroll,
        )
        .context("Failed to restore engine state")?;
    info!(
        "Ledger restored: bankroll ${:.2}, {} open order(s)",
        engine.ledger().bankroll(),
        engine.ledger().open_orders().count()
    );
    Ok((db, engine))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
