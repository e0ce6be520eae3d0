//! Durable engine state: the daily ledger and per-symbol cooldowns.
//!
//! Both survive a restart through the SQLite store. The daily ledger rolls
//! over on the first cycle of a new UTC day; cooldowns keep their escalation
//! counters so a crash loop cannot reset the backoff.

use crate::config::Config;
use crate::execution::ExecErrorClass;
use crate::storage::{CooldownRow, DayRow, Store};
use anyhow::Result;
use chrono::{Datelike, TimeZone, Utc};
use std::collections::HashMap;

fn utc_day(ts: i64) -> i64 {
    let dt = Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now);
    (dt.year() as i64) * 10_000 + (dt.month() as i64) * 100 + dt.day() as i64
}

/// Rolling daily ledger: start balance, current balance and the peak
/// realized P&L the profit ratchet keys off.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DayState {
    pub day: i64,
    pub start_balance: f64,
    pub current_balance: f64,
    pub peak_pnl: f64,
    pub open_positions: u32,
}

impl DayState {
    pub fn load_or_start(store: &Store, balance: f64, now: i64) -> Result<Self> {
        let today = utc_day(now);
        if let Some(row) = store.load_day()? {
            if row.day == today {
                return Ok(Self {
                    day: row.day,
                    start_balance: row.start_balance,
                    current_balance: row.current_balance,
                    peak_pnl: row.peak_pnl,
                    open_positions: row.open_positions,
                });
            }
        }
        let state = Self {
            day: today,
            start_balance: balance,
            current_balance: balance,
            peak_pnl: 0.0,
            open_positions: 0,
        };
        state.persist(store)?;
        Ok(state)
    }

    /// Update from the latest balance, rolling the ledger on a new UTC day.
    /// The peak only ever ratchets up within a day.
    pub fn observe(
        &mut self,
        store: &Store,
        balance: f64,
        open_positions: u32,
        now: i64,
    ) -> Result<()> {
        let today = utc_day(now);
        if today != self.day {
            self.day = today;
            self.start_balance = balance;
            self.peak_pnl = 0.0;
        }
        self.current_balance = balance;
        self.open_positions = open_positions;
        self.peak_pnl = self.peak_pnl.max(self.daily_pnl());
        self.persist(store)
    }

    pub fn daily_pnl(&self) -> f64 {
        self.current_balance - self.start_balance
    }

    fn persist(&self, store: &Store) -> Result<()> {
        store.save_day(&DayRow {
            day: self.day,
            start_balance: self.start_balance,
            current_balance: self.current_balance,
            peak_pnl: self.peak_pnl,
            open_positions: self.open_positions,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Cooldown {
    until: i64,
    attempts: u32,
}

/// Per-symbol cooldowns with class-aware escalation.
#[derive(Debug)]
pub struct CooldownMap {
    map: HashMap<String, Cooldown>,
    base_secs: u64,
    violation_secs: u64,
    max_secs: u64,
    escalate_after: u32,
}

impl CooldownMap {
    pub fn new(cfg: &Config) -> Self {
        Self {
            map: HashMap::new(),
            base_secs: cfg.cooldown_base_secs,
            violation_secs: cfg.cooldown_violation_secs,
            max_secs: cfg.cooldown_max_secs,
            escalate_after: cfg.cooldown_escalate_after,
        }
    }

    pub fn load(cfg: &Config, store: &Store) -> Result<Self> {
        let mut cm = Self::new(cfg);
        for (symbol, row) in store.load_cooldowns()? {
            cm.map.insert(symbol, Cooldown { until: row.until, attempts: row.attempts });
        }
        Ok(cm)
    }

    pub fn active(&self, symbol: &str, now: i64) -> bool {
        self.map.get(symbol).map_or(false, |c| c.until > now)
    }

    /// Arm a cooldown after a failed execution. Ordering violations escalate:
    /// repeated ones push the window from the violation tier to the maximum.
    /// Returns the chosen duration in seconds.
    pub fn register_failure(
        &mut self,
        store: &Store,
        symbol: &str,
        class: ExecErrorClass,
        now: i64,
    ) -> Result<u64> {
        let entry = self
            .map
            .entry(symbol.to_string())
            .or_insert(Cooldown { until: 0, attempts: 0 });
        let secs = match class {
            ExecErrorClass::OrderingViolation => {
                entry.attempts = entry.attempts.saturating_add(1);
                if entry.attempts >= self.escalate_after {
                    self.max_secs
                } else {
                    self.violation_secs
                }
            }
            _ => self.base_secs,
        };
        let secs = secs.min(self.max_secs);
        entry.until = now + secs as i64;
        let row = CooldownRow { until: entry.until, attempts: entry.attempts };
        store.save_cooldown(symbol, &row)?;
        Ok(secs)
    }

    /// A successful execution clears the symbol's cooldown and its counter.
    pub fn clear(&mut self, store: &Store, symbol: &str) -> Result<()> {
        if self.map.remove(symbol).is_some() {
            store.delete_cooldown(symbol)?;
        }
        Ok(())
    }
}
