//! Adaptive per-strategy weighting with quarantine and kill switch.
//!
//! Every settled trade feeds back into the strategy that produced it. The
//! running weight follows a tanh curve over cumulative P&L, a losing streak
//! puts the strategy in a 24h quarantine, and a long enough streak zeroes the
//! weight permanently until an operator reset. Mutations hit SQLite before
//! the call returns, so a crash never loses a settled outcome.

use crate::logging::{self, obj, v_str, Domain, Level};
use crate::signal::{now_ts, StrategyStatus};
use crate::storage::{PerfRow, Store};
use anyhow::Result;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};

const WEIGHT_MIN: f64 = 0.1;
const WEIGHT_MAX: f64 = 3.0;
const PNL_SCALE: f64 = 0.001;
const QUARANTINE_AFTER: u32 = 3;
const KILL_AFTER: u32 = 5;
const QUARANTINE_SECS: i64 = 24 * 3600;

#[derive(Debug, Clone, PartialEq)]
pub struct PerfRecord {
    pub cumulative_pnl: f64,
    pub wins: u32,
    pub losses: u32,
    pub consecutive_losses: u32,
    pub quarantine_until: Option<i64>,
    pub weight: f64,
}

impl PerfRecord {
    fn fresh() -> Self {
        Self {
            cumulative_pnl: 0.0,
            wins: 0,
            losses: 0,
            consecutive_losses: 0,
            quarantine_until: None,
            weight: 1.0,
        }
    }

    fn to_row(&self, strategy: &str) -> PerfRow {
        PerfRow {
            strategy: strategy.to_string(),
            cumulative_pnl: self.cumulative_pnl,
            wins: self.wins,
            losses: self.losses,
            consecutive_losses: self.consecutive_losses,
            quarantine_until: self.quarantine_until,
            weight: self.weight,
        }
    }
}

fn weight_from_pnl(cumulative_pnl: f64) -> f64 {
    (1.0 + (cumulative_pnl * PNL_SCALE).tanh() * 1.5).clamp(WEIGHT_MIN, WEIGHT_MAX)
}

#[derive(Debug)]
pub struct WeightStore {
    records: RwLock<HashMap<String, PerfRecord>>,
    params: RwLock<HashMap<String, HashMap<String, f64>>>,
    store: Mutex<Store>,
}

impl WeightStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_store(Store::open(path)?)
    }

    /// Volatile store for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_store(Store::open_in_memory()?)
    }

    fn from_store(store: Store) -> Result<Self> {
        let mut records = HashMap::new();
        for row in store.load_perf()? {
            records.insert(
                row.strategy.clone(),
                PerfRecord {
                    cumulative_pnl: row.cumulative_pnl,
                    wins: row.wins,
                    losses: row.losses,
                    consecutive_losses: row.consecutive_losses,
                    quarantine_until: row.quarantine_until,
                    weight: row.weight,
                },
            );
        }
        Ok(Self {
            records: RwLock::new(records),
            params: RwLock::new(HashMap::new()),
            store: Mutex::new(store),
        })
    }

    /// Settle one closed trade against its source strategy. The updated
    /// record is written to SQLite before this returns.
    pub fn record_outcome(&self, strategy: &str, pnl: f64) -> Result<()> {
        self.record_outcome_at(strategy, pnl, now_ts())
    }

    pub fn record_outcome_at(&self, strategy: &str, pnl: f64, now: i64) -> Result<()> {
        let record = {
            let mut records = self.records.write().expect("weights lock poisoned");
            let rec = records.entry(strategy.to_string()).or_insert_with(PerfRecord::fresh);
            rec.cumulative_pnl += pnl;
            if pnl > 0.0 {
                rec.wins += 1;
                rec.consecutive_losses = 0;
                rec.quarantine_until = None;
            } else {
                rec.losses += 1;
                rec.consecutive_losses += 1;
                // Quarantine window is set once per streak, never extended.
                if rec.consecutive_losses >= QUARANTINE_AFTER && rec.quarantine_until.is_none() {
                    rec.quarantine_until = Some(now + QUARANTINE_SECS);
                }
            }
            rec.weight = if rec.consecutive_losses > KILL_AFTER {
                0.0
            } else {
                weight_from_pnl(rec.cumulative_pnl)
            };
            rec.clone()
        };

        {
            let store = self.store.lock().expect("store lock poisoned");
            store.upsert_perf(&record.to_row(strategy))?;
        }
        logging::log_outcome(
            strategy,
            pnl,
            record.weight,
            status_of(&record, now).as_str_code(),
        );
        Ok(())
    }

    pub fn weight(&self, strategy: &str) -> f64 {
        self.records
            .read()
            .expect("weights lock poisoned")
            .get(strategy)
            .map(|r| r.weight)
            .unwrap_or(1.0)
    }

    pub fn status(&self, strategy: &str) -> StrategyStatus {
        self.status_at(strategy, now_ts())
    }

    /// Status lookup with expiry: an elapsed quarantine clears itself and the
    /// cleared record is persisted, so a later streak can open a new window.
    pub fn status_at(&self, strategy: &str, now: i64) -> StrategyStatus {
        {
            let records = self.records.read().expect("weights lock poisoned");
            match records.get(strategy) {
                None => return StrategyStatus::Unknown,
                // An elapsed window reads Active but still needs clearing.
                Some(rec) => match status_of(rec, now) {
                    StrategyStatus::Active if rec.quarantine_until.is_some() => {}
                    status => return status,
                },
            }
        }
        let record = {
            let mut records = self.records.write().expect("weights lock poisoned");
            let Some(rec) = records.get_mut(strategy) else {
                return StrategyStatus::Unknown;
            };
            rec.quarantine_until = None;
            rec.consecutive_losses = 0;
            rec.clone()
        };
        if let Ok(store) = self.store.lock() {
            let _ = store.upsert_perf(&record.to_row(strategy));
        }
        logging::log(
            Level::Info,
            Domain::Weights,
            "quarantine_cleared",
            obj(&[("strategy", v_str(strategy))]),
        );
        StrategyStatus::Active
    }

    pub fn record(&self, strategy: &str) -> Option<PerfRecord> {
        self.records.read().expect("weights lock poisoned").get(strategy).cloned()
    }

    /// Operator reset: wipes the record entirely, including a kill switch.
    pub fn reset(&self, strategy: &str) -> Result<()> {
        self.records.write().expect("weights lock poisoned").remove(strategy);
        let store = self.store.lock().expect("store lock poisoned");
        store.delete_perf(strategy)?;
        Ok(())
    }

    // ---- tuned parameters ----

    pub fn set_params(&self, strategy: &str, values: HashMap<String, f64>) -> Result<()> {
        let json = serde_json::to_string(&values)?;
        {
            let store = self.store.lock().expect("store lock poisoned");
            store.set_params(strategy, &json)?;
        }
        self.params.write().expect("params lock poisoned").insert(strategy.to_string(), values);
        Ok(())
    }

    pub fn param(&self, strategy: &str, key: &str) -> Option<f64> {
        if let Some(v) = self
            .params
            .read()
            .expect("params lock poisoned")
            .get(strategy)
            .and_then(|m| m.get(key).copied())
        {
            return Some(v);
        }
        // Cold path: fall through to SQLite and cache.
        let json = {
            let store = self.store.lock().ok()?;
            store.get_params(strategy).ok()??
        };
        let values: HashMap<String, f64> = serde_json::from_str(&json).ok()?;
        let v = values.get(key).copied();
        self.params.write().expect("params lock poisoned").insert(strategy.to_string(), values);
        v
    }

    /// Persisted sharpe estimate used to rank consensus candidates.
    pub fn performance_score(&self, strategy: &str) -> Option<f64> {
        self.param(strategy, "sharpe")
    }

    // ---- order settlement map ----

    pub fn map_order(&self, order_id: &str, strategy: &str) -> Result<()> {
        let store = self.store.lock().expect("store lock poisoned");
        store.map_order(order_id, strategy)
    }

    pub fn strategy_for_order(&self, order_id: &str) -> Option<String> {
        let store = self.store.lock().ok()?;
        store.strategy_for_order(order_id).ok()?
    }

    pub fn unmap_order(&self, order_id: &str) -> Result<()> {
        let store = self.store.lock().expect("store lock poisoned");
        store.unmap_order(order_id)
    }

    pub fn set_live_approval(&self, strategy: &str, approved: bool) -> Result<()> {
        let store = self.store.lock().expect("store lock poisoned");
        store.set_live_approval(strategy, approved)
    }

    pub fn live_approved(&self, strategy: &str) -> bool {
        self.store
            .lock()
            .ok()
            .and_then(|s| s.live_approved(strategy).ok())
            .unwrap_or(false)
    }
}

fn status_of(rec: &PerfRecord, now: i64) -> StrategyStatus {
    if rec.weight == 0.0 {
        return StrategyStatus::KillSwitched;
    }
    match rec.quarantine_until {
        Some(until) if until > now => StrategyStatus::Quarantined,
        _ => StrategyStatus::Active,
    }
}

impl StrategyStatus {
    pub fn as_str_code(&self) -> &'static str {
        match self {
            StrategyStatus::Unknown => "unknown",
            StrategyStatus::Active => "active",
            StrategyStatus::Quarantined => "quarantined",
            StrategyStatus::KillSwitched => "kill_switched",
        }
    }
}
