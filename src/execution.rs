//! Execution port: the seam between the engine and a broker backend.
//!
//! Errors carry a class so callers can react differently: a transient fault
//! is retried here, an ordering violation escalates the caller's cooldown,
//! a rejection is terminal for that attempt.

use crate::signal::{
    now_ts, Candle, Direction, PortfolioState, Position, Signal, Timeframe,
};
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecErrorClass {
    /// Broker refused the order's structure (bracket inversion, bad units).
    OrderingViolation,
    /// Broker understood and said no (margin, instrument halted).
    Rejected,
    /// Worth retrying: timeouts, connection drops, rate limits.
    Transient,
    Other,
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("ordering violation: {0}")]
    OrderingViolation(String),
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("transient broker failure: {0}")]
    Transient(String),
    #[error("broker failure: {0}")]
    Other(String),
}

impl ExecError {
    pub fn class(&self) -> ExecErrorClass {
        match self {
            ExecError::OrderingViolation(_) => ExecErrorClass::OrderingViolation,
            ExecError::Rejected(_) => ExecErrorClass::Rejected,
            ExecError::Transient(_) => ExecErrorClass::Transient,
            ExecError::Other(_) => ExecErrorClass::Other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
    pub trade_id: String,
    pub filled_units: f64,
    pub fill_price: f64,
}

#[derive(Debug, Clone)]
pub struct ClosedTrade {
    pub trade_id: String,
    pub symbol: String,
    pub realized_pnl: f64,
}

#[async_trait]
pub trait ExecutionPort: Send + Sync {
    async fn execute_order(&self, signal: &Signal) -> Result<OrderAck, ExecError>;
    async fn close_trade(&self, trade_id: &str) -> Result<ClosedTrade, ExecError>;
    async fn modify_stop(&self, trade_id: &str, price: f64) -> Result<(), ExecError>;
    async fn portfolio_state(&self) -> Result<PortfolioState, ExecError>;
    async fn candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, ExecError>;
    async fn price(&self, symbol: &str) -> Result<f64, ExecError>;
}

/// Retry a port call on transient failures with jittered exponential backoff.
/// Non-transient errors surface immediately.
pub async fn with_retry<T, F, Fut>(max_attempts: u32, base_delay_ms: u64, mut call: F) -> Result<T, ExecError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ExecError>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(v) => return Ok(v),
            Err(err) if err.class() == ExecErrorClass::Transient => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(err);
                }
                let backoff = base_delay_ms.saturating_mul(1 << attempt.min(6));
                let jitter = rand::thread_rng().gen_range(0..=backoff / 2);
                tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
            }
            Err(err) => return Err(err),
        }
    }
}

// ---- paper broker ----

#[derive(Debug, Default)]
struct PaperBook {
    start_balance: f64,
    balance: f64,
    peak_pnl: f64,
    positions: HashMap<String, Position>,
    prices: HashMap<String, f64>,
    candles: HashMap<String, Vec<Candle>>,
}

/// In-memory fill-at-mark backend for paper mode and tests.
pub struct PaperBroker {
    book: Mutex<PaperBook>,
    next_id: AtomicU64,
}

impl PaperBroker {
    pub fn new(starting_balance: f64) -> Self {
        Self {
            book: Mutex::new(PaperBook {
                start_balance: starting_balance,
                balance: starting_balance,
                ..PaperBook::default()
            }),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        let mut book = self.book.lock().expect("paper book poisoned");
        book.prices.insert(symbol.to_string(), price);
        for pos in book.positions.values_mut() {
            if pos.symbol == symbol {
                let sign = if pos.is_long() { 1.0 } else { -1.0 };
                pos.unrealized_pnl = (price - pos.entry_price) * pos.units.abs() * sign;
            }
        }
    }

    pub fn set_candles(&self, symbol: &str, candles: Vec<Candle>) {
        let price = candles.last().map(|c| c.c);
        {
            let mut book = self.book.lock().expect("paper book poisoned");
            book.candles.insert(symbol.to_string(), candles);
        }
        if let Some(price) = price {
            self.set_price(symbol, price);
        }
    }

    /// Test hook: place a position directly, bypassing the order path.
    pub fn seed_position(&self, pos: Position) {
        let mut book = self.book.lock().expect("paper book poisoned");
        book.prices.entry(pos.symbol.clone()).or_insert(pos.entry_price);
        book.positions.insert(pos.id.clone(), pos);
    }

    pub fn position(&self, trade_id: &str) -> Option<Position> {
        self.book.lock().expect("paper book poisoned").positions.get(trade_id).cloned()
    }

    fn next_trade_id(&self) -> String {
        format!("p-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl ExecutionPort for PaperBroker {
    async fn execute_order(&self, signal: &Signal) -> Result<OrderAck, ExecError> {
        if !signal.direction.is_actionable() {
            return Err(ExecError::Rejected("HOLD is not an order".to_string()));
        }
        // Bracket orientation must match the side or the venue would bounce it.
        if let (Some(stop), Some(target)) = (signal.stop_loss, signal.take_profit) {
            let inverted = match signal.direction {
                Direction::Buy => stop >= signal.entry || target <= signal.entry,
                Direction::Sell => stop <= signal.entry || target >= signal.entry,
                Direction::Hold => false,
            };
            if inverted {
                return Err(ExecError::OrderingViolation(format!(
                    "bracket inverted for {} {}",
                    signal.direction.as_str(),
                    signal.symbol
                )));
            }
        }

        let trade_id = self.next_trade_id();
        let mut book = self.book.lock().expect("paper book poisoned");
        let fill_price =
            book.prices.get(&signal.symbol).copied().unwrap_or(signal.entry);
        if fill_price <= 0.0 {
            return Err(ExecError::Rejected(format!("no mark for {}", signal.symbol)));
        }
        let units = signal.notional / fill_price;
        book.positions.insert(
            trade_id.clone(),
            Position {
                id: trade_id.clone(),
                symbol: signal.symbol.clone(),
                direction: signal.direction,
                units,
                entry_price: fill_price,
                current_stop: signal.stop_loss,
                current_target: signal.take_profit,
                opened_at: Some(now_ts()),
                unrealized_pnl: 0.0,
            },
        );
        Ok(OrderAck { order_id: trade_id.clone(), trade_id, filled_units: units, fill_price })
    }

    async fn close_trade(&self, trade_id: &str) -> Result<ClosedTrade, ExecError> {
        let mut book = self.book.lock().expect("paper book poisoned");
        let pos = book
            .positions
            .remove(trade_id)
            .ok_or_else(|| ExecError::Rejected(format!("unknown trade {trade_id}")))?;
        let realized = pos.unrealized_pnl;
        book.balance += realized;
        let pnl = book.balance - book.start_balance;
        book.peak_pnl = book.peak_pnl.max(pnl);
        Ok(ClosedTrade { trade_id: pos.id, symbol: pos.symbol, realized_pnl: realized })
    }

    async fn modify_stop(&self, trade_id: &str, price: f64) -> Result<(), ExecError> {
        let mut book = self.book.lock().expect("paper book poisoned");
        let pos = book
            .positions
            .get_mut(trade_id)
            .ok_or_else(|| ExecError::Rejected(format!("unknown trade {trade_id}")))?;
        pos.current_stop = Some(price);
        Ok(())
    }

    async fn portfolio_state(&self) -> Result<PortfolioState, ExecError> {
        let book = self.book.lock().expect("paper book poisoned");
        let unrealized: f64 = book.positions.values().map(|p| p.unrealized_pnl).sum();
        let nav = book.balance + unrealized;
        let pnl = book.balance - book.start_balance;
        let peak = book.peak_pnl.max(pnl);
        let exposure: f64 = book.positions.values().map(|p| p.notional()).sum();
        let margin_used_pct = if nav > 0.0 { (exposure / 20.0) / nav } else { 1.0 };
        let drawdown = if book.start_balance > 0.0 && pnl < 0.0 {
            -pnl / book.start_balance
        } else {
            0.0
        };
        Ok(PortfolioState {
            daily_start_balance: book.start_balance,
            current_balance: book.balance,
            daily_peak_pnl: peak,
            margin_used_pct,
            open_positions: book.positions.values().cloned().collect(),
            daily_drawdown_pct: drawdown,
            nav,
            unrealized_pnl: unrealized,
        })
    }

    async fn candles(
        &self,
        symbol: &str,
        _timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, ExecError> {
        let book = self.book.lock().expect("paper book poisoned");
        let candles = book
            .candles
            .get(symbol)
            .ok_or_else(|| ExecError::Transient(format!("no candles for {symbol}")))?;
        let start = candles.len().saturating_sub(limit);
        Ok(candles[start..].to_vec())
    }

    async fn price(&self, symbol: &str) -> Result<f64, ExecError> {
        let book = self.book.lock().expect("paper book poisoned");
        book.prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExecError::Transient(format!("no mark for {symbol}")))
    }
}
