use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::engine::BettingEngine;
use crate::ledger::{money_to_f64, to_money, SettlementLedger};
use crate::models::Order;
use crate::risk::{RiskConfig, RiskManager, RiskState};
use crate::sizing::{OptimizerConfig, PortfolioOptimizer};

const LEDGER_KEY: &str = "ledger";
const RISK_KEY: &str = "risk_state";

/// Thread-safe SQLite connection pool (single connection with mutex)
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// Ledger balances persisted alongside the orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerTotals {
    pub initial_bankroll: Decimal,
    pub bankroll: Decimal,
    pub peak_bankroll: Decimal,
    pub max_drawdown: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub bankroll: Decimal,
    pub equity: Decimal,
    pub recorded_at: DateTime<Utc>,
}

impl Database {
    /// Open (or create) the SQLite database at the given path
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("Failed to open {}", path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection mutex poisoned"))
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> Result<()> {
        self.lock()?.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // ── Balance ──────────────────────────────────────────────────────────────

    pub fn record_balance(&self, bankroll: Decimal, equity: Decimal) -> Result<()> {
        self.lock()?.execute(
            "INSERT INTO balance_history (bankroll, equity, recorded_at) VALUES (?1, ?2, ?3)",
            params![bankroll.to_string(), equity.to_string(), Utc::now()],
        )?;
        Ok(())
    }

    /// Most recent snapshots first
    pub fn get_balance_history(&self, limit: i64) -> Result<Vec<BalanceSnapshot>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT bankroll, equity, recorded_at FROM balance_history
             ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(BalanceSnapshot {
                    bankroll: money_column(row, 0)?,
                    equity: money_column(row, 1)?,
                    recorded_at: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Orders ───────────────────────────────────────────────────────────────

    /// Insert or fully overwrite orders by id
    pub fn upsert_orders(&self, orders: &[Order]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO orders (
                    id, event_id, selection, entity, stake, price,
                    model_probability, edge, status, outcome, payout, profit,
                    closing_price, clv, placed_at, closed_at
                 ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)
                 ON CONFLICT(id) DO UPDATE SET
                    status=excluded.status,
                    outcome=excluded.outcome,
                    payout=excluded.payout,
                    profit=excluded.profit,
                    closing_price=excluded.closing_price,
                    clv=excluded.clv,
                    closed_at=excluded.closed_at",
            )?;
            for order in orders {
                stmt.execute(params![
                    order.id,
                    order.event_id,
                    serde_json::to_string(&order.selection)?,
                    order.entity,
                    order.stake.to_string(),
                    order.price,
                    order.model_probability,
                    order.edge,
                    order.status.as_str(),
                    order.outcome.map(|o| o.as_str()),
                    order.payout.map(|d| d.to_string()),
                    order.profit.map(|d| d.to_string()),
                    order.closing_price,
                    order.clv,
                    order.placed_at,
                    order.closed_at,
                ])?;
            }
        }
        tx.commit()?;
        debug!("Persisted {} order(s)", orders.len());
        Ok(())
    }

    /// All orders in placement order
    pub fn list_orders(&self) -> Result<Vec<Order>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, event_id, selection, entity, stake, price,
                    model_probability, edge, status, outcome, payout, profit,
                    closing_price, clv, placed_at, closed_at
             FROM orders ORDER BY placed_at ASC, id ASC",
        )?;
        let orders = stmt
            .query_map([], map_order)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(orders)
    }

    // ── Engine state ─────────────────────────────────────────────────────────

    fn put_state<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.lock()?.execute(
            "INSERT INTO engine_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at=excluded.updated_at",
            params![key, serde_json::to_string(value)?, Utc::now()],
        )?;
        Ok(())
    }

    fn get_state<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let raw: Option<String> = self
            .lock()?
            .query_row(
                "SELECT value FROM engine_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|s| serde_json::from_str(&s).with_context(|| format!("Corrupt state '{}'", key)))
            .transpose()
    }

    /// Persist orders, ledger balances, risk state and a balance snapshot.
    pub fn save_engine(&self, engine: &BettingEngine) -> Result<()> {
        let ledger = engine.ledger();
        self.upsert_orders(ledger.orders())?;
        self.put_state(
            LEDGER_KEY,
            &LedgerTotals {
                initial_bankroll: ledger.initial_bankroll(),
                bankroll: ledger.bankroll(),
                peak_bankroll: ledger.peak_bankroll(),
                max_drawdown: ledger.max_drawdown(),
            },
        )?;
        self.put_state(RISK_KEY, engine.risk().state())?;
        self.record_balance(ledger.bankroll(), ledger.equity())?;
        Ok(())
    }

    /// Rebuild the ledger, or start a fresh one when nothing is persisted yet.
    pub fn load_ledger(&self, initial_bankroll: f64) -> Result<SettlementLedger> {
        let orders = self.list_orders()?;
        let ledger = match self.get_state::<LedgerTotals>(LEDGER_KEY)? {
            Some(t) => SettlementLedger::restore(
                t.initial_bankroll,
                t.bankroll,
                t.peak_bankroll,
                t.max_drawdown,
                orders,
            )?,
            None => SettlementLedger::new(to_money(initial_bankroll)?)?,
        };
        Ok(ledger)
    }

    pub fn load_engine(
        &self,
        optimizer_config: OptimizerConfig,
        risk_config: RiskConfig,
        initial_bankroll: f64,
    ) -> Result<BettingEngine> {
        let ledger = self.load_ledger(initial_bankroll)?;
        let state = self
            .get_state::<RiskState>(RISK_KEY)?
            .unwrap_or_else(|| RiskState::new(money_to_f64(ledger.equity())));
        let risk = RiskManager::from_state(risk_config, state)?;
        let optimizer = PortfolioOptimizer::new(optimizer_config)?;
        Ok(BettingEngine::from_parts(optimizer, risk, ledger))
    }
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

/// Money columns are stored as decimal text so cents survive the round trip.
fn money_column(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    Decimal::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn optional_money_column(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| Decimal::from_str(&s).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn map_order(row: &rusqlite::Row) -> rusqlite::Result<Order> {
    let selection: String = row.get(2)?;
    let status: String = row.get(8)?;
    let outcome: Option<String> = row.get(9)?;
    Ok(Order {
        id: row.get(0)?,
        event_id: row.get(1)?,
        selection: serde_json::from_str(&selection).map_err(|e| conversion_error(2, e))?,
        entity: row.get(3)?,
        stake: money_column(row, 4)?,
        price: row.get(5)?,
        model_probability: row.get(6)?,
        edge: row.get(7)?,
        status: status.parse().map_err(|e: anyhow::Error| conversion_error(8, e))?,
        outcome: outcome
            .map(|o| o.parse())
            .transpose()
            .map_err(|e: anyhow::Error| conversion_error(9, e))?,
        payout: optional_money_column(row, 10)?,
        profit: optional_money_column(row, 11)?,
        closing_price: row.get(12)?,
        clv: row.get(13)?,
        placed_at: row.get(14)?,
        closed_at: row.get(15)?,
    })
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS balance_history (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    bankroll    TEXT    NOT NULL,
    equity      TEXT    NOT NULL,
    recorded_at TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS orders (
    id                TEXT    PRIMARY KEY,
    event_id          TEXT    NOT NULL,
    selection         TEXT    NOT NULL,
    entity            TEXT    NOT NULL DEFAULT '',
    stake             TEXT    NOT NULL,
    price             INTEGER NOT NULL,
    model_probability REAL,
    edge              REAL,
    status            TEXT    NOT NULL DEFAULT 'open',
    outcome           TEXT,
    payout            TEXT,
    profit            TEXT,
    closing_price     INTEGER,
    clv               REAL,
    placed_at         TEXT    NOT NULL,
    closed_at         TEXT
);

CREATE TABLE IF NOT EXISTS engine_state (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
CREATE INDEX IF NOT EXISTS idx_orders_event ON orders(event_id);
"#;
