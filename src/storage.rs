//! SQLite persistence for engine state, cooldowns and strategy performance.
//!
//! One file holds everything a restart needs: the daily ledger, per-symbol
//! cooldowns, per-strategy performance records, tuned parameters and the
//! order-to-strategy map used to settle closed trades.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

#[derive(Debug)]
pub struct Store {
    conn: Connection,
}

/// Row shape for the daily ledger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DayRow {
    pub day: i64,
    pub start_balance: f64,
    pub current_balance: f64,
    pub peak_pnl: f64,
    pub open_positions: u32,
}

/// Row shape for a per-strategy performance record.
#[derive(Debug, Clone, PartialEq)]
pub struct PerfRow {
    pub strategy: String,
    pub cumulative_pnl: f64,
    pub wins: u32,
    pub losses: u32,
    pub consecutive_losses: u32,
    pub quarantine_until: Option<i64>,
    pub weight: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CooldownRow {
    pub until: i64,
    pub attempts: u32,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("open sqlite at {}", path.as_ref().display()))?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Volatile store for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             CREATE TABLE IF NOT EXISTS day_state (
                 id INTEGER PRIMARY KEY CHECK (id = 1),
                 day INTEGER NOT NULL,
                 start_balance REAL NOT NULL,
                 current_balance REAL NOT NULL,
                 peak_pnl REAL NOT NULL,
                 open_positions INTEGER NOT NULL DEFAULT 0
             );
             CREATE TABLE IF NOT EXISTS cooldowns (
                 symbol TEXT PRIMARY KEY,
                 until INTEGER NOT NULL,
                 attempts INTEGER NOT NULL DEFAULT 0
             );
             CREATE TABLE IF NOT EXISTS strategy_perf (
                 strategy TEXT PRIMARY KEY,
                 cumulative_pnl REAL NOT NULL DEFAULT 0,
                 wins INTEGER NOT NULL DEFAULT 0,
                 losses INTEGER NOT NULL DEFAULT 0,
                 consecutive_losses INTEGER NOT NULL DEFAULT 0,
                 quarantine_until INTEGER,
                 weight REAL NOT NULL DEFAULT 1.0
             );
             CREATE TABLE IF NOT EXISTS strategy_params (
                 strategy TEXT PRIMARY KEY,
                 params TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS order_strategy (
                 order_id TEXT PRIMARY KEY,
                 strategy TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS live_approval (
                 strategy TEXT PRIMARY KEY,
                 approved INTEGER NOT NULL DEFAULT 0
             );",
        )?;
        Ok(())
    }

    // ---- daily ledger ----

    pub fn save_day(&self, row: &DayRow) -> Result<()> {
        self.conn.execute(
            "INSERT INTO day_state (id, day, start_balance, current_balance, peak_pnl, open_positions)
             VALUES (1, ?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                 day = excluded.day,
                 start_balance = excluded.start_balance,
                 current_balance = excluded.current_balance,
                 peak_pnl = excluded.peak_pnl,
                 open_positions = excluded.open_positions",
            params![row.day, row.start_balance, row.current_balance, row.peak_pnl, row.open_positions],
        )?;
        Ok(())
    }

    pub fn load_day(&self) -> Result<Option<DayRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT day, start_balance, current_balance, peak_pnl, open_positions
                 FROM day_state WHERE id = 1",
                [],
                |r| {
                    Ok(DayRow {
                        day: r.get(0)?,
                        start_balance: r.get(1)?,
                        current_balance: r.get(2)?,
                        peak_pnl: r.get(3)?,
                        open_positions: r.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    // ---- cooldowns ----

    pub fn save_cooldown(&self, symbol: &str, row: &CooldownRow) -> Result<()> {
        self.conn.execute(
            "INSERT INTO cooldowns (symbol, until, attempts) VALUES (?1, ?2, ?3)
             ON CONFLICT(symbol) DO UPDATE SET until = excluded.until, attempts = excluded.attempts",
            params![symbol, row.until, row.attempts],
        )?;
        Ok(())
    }

    pub fn delete_cooldown(&self, symbol: &str) -> Result<()> {
        self.conn.execute("DELETE FROM cooldowns WHERE symbol = ?1", params![symbol])?;
        Ok(())
    }

    pub fn load_cooldowns(&self) -> Result<Vec<(String, CooldownRow)>> {
        let mut stmt = self.conn.prepare("SELECT symbol, until, attempts FROM cooldowns")?;
        let rows = stmt
            .query_map([], |r| {
                Ok((r.get::<_, String>(0)?, CooldownRow { until: r.get(1)?, attempts: r.get(2)? }))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ---- strategy performance ----

    pub fn upsert_perf(&self, row: &PerfRow) -> Result<()> {
        self.conn.execute(
            "INSERT INTO strategy_perf
                 (strategy, cumulative_pnl, wins, losses, consecutive_losses, quarantine_until, weight)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(strategy) DO UPDATE SET
                 cumulative_pnl = excluded.cumulative_pnl,
                 wins = excluded.wins,
                 losses = excluded.losses,
                 consecutive_losses = excluded.consecutive_losses,
                 quarantine_until = excluded.quarantine_until,
                 weight = excluded.weight",
            params![
                row.strategy,
                row.cumulative_pnl,
                row.wins,
                row.losses,
                row.consecutive_losses,
                row.quarantine_until,
                row.weight
            ],
        )?;
        Ok(())
    }

    pub fn load_perf(&self) -> Result<Vec<PerfRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT strategy, cumulative_pnl, wins, losses, consecutive_losses, quarantine_until, weight
             FROM strategy_perf",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok(PerfRow {
                    strategy: r.get(0)?,
                    cumulative_pnl: r.get(1)?,
                    wins: r.get(2)?,
                    losses: r.get(3)?,
                    consecutive_losses: r.get(4)?,
                    quarantine_until: r.get(5)?,
                    weight: r.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delete_perf(&self, strategy: &str) -> Result<()> {
        self.conn.execute("DELETE FROM strategy_perf WHERE strategy = ?1", params![strategy])?;
        Ok(())
    }

    // ---- tuned parameters (JSON blob per strategy) ----

    pub fn set_params(&self, strategy: &str, params_json: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO strategy_params (strategy, params) VALUES (?1, ?2)
             ON CONFLICT(strategy) DO UPDATE SET params = excluded.params",
            params![strategy, params_json],
        )?;
        Ok(())
    }

    pub fn get_params(&self, strategy: &str) -> Result<Option<String>> {
        let row = self
            .conn
            .query_row(
                "SELECT params FROM strategy_params WHERE strategy = ?1",
                params![strategy],
                |r| r.get(0),
            )
            .optional()?;
        Ok(row)
    }

    // ---- order settlement map ----

    pub fn map_order(&self, order_id: &str, strategy: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO order_strategy (order_id, strategy) VALUES (?1, ?2)
             ON CONFLICT(order_id) DO UPDATE SET strategy = excluded.strategy",
            params![order_id, strategy],
        )?;
        Ok(())
    }

    pub fn strategy_for_order(&self, order_id: &str) -> Result<Option<String>> {
        let row = self
            .conn
            .query_row(
                "SELECT strategy FROM order_strategy WHERE order_id = ?1",
                params![order_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(row)
    }

    pub fn unmap_order(&self, order_id: &str) -> Result<()> {
        self.conn.execute("DELETE FROM order_strategy WHERE order_id = ?1", params![order_id])?;
        Ok(())
    }

    // ---- live approval ----

    pub fn set_live_approval(&self, strategy: &str, approved: bool) -> Result<()> {
        self.conn.execute(
            "INSERT INTO live_approval (strategy, approved) VALUES (?1, ?2)
             ON CONFLICT(strategy) DO UPDATE SET approved = excluded.approved",
            params![strategy, approved as i64],
        )?;
        Ok(())
    }

    pub fn live_approved(&self, strategy: &str) -> Result<bool> {
        let row: Option<i64> = self
            .conn
            .query_row(
                "SELECT approved FROM live_approval WHERE strategy = ?1",
                params![strategy],
                |r| r.get(0),
            )
            .optional()?;
        Ok(row.unwrap_or(0) != 0)
    }
}
