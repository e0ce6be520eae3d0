// Shared contracts between the consensus engine, the gate and the supervisor.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Buy,
    Sell,
    Hold,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Buy => "BUY",
            Direction::Sell => "SELL",
            Direction::Hold => "HOLD",
        }
    }

    pub fn is_actionable(&self) -> bool {
        matches!(self, Direction::Buy | Direction::Sell)
    }

    pub fn opposes(&self, other: Direction) -> bool {
        matches!(
            (self, other),
            (Direction::Buy, Direction::Sell) | (Direction::Sell, Direction::Buy)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
}

impl Timeframe {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "M1" => Some(Timeframe::M1),
            "M5" => Some(Timeframe::M5),
            "M15" => Some(Timeframe::M15),
            "M30" => Some(Timeframe::M30),
            "H1" => Some(Timeframe::H1),
            "H4" => Some(Timeframe::H4),
            "D1" => Some(Timeframe::D1),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "M1",
            Timeframe::M5 => "M5",
            Timeframe::M15 => "M15",
            Timeframe::M30 => "M30",
            Timeframe::H1 => "H1",
            Timeframe::H4 => "H4",
            Timeframe::D1 => "D1",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyStatus {
    Unknown,
    Active,
    Quarantined,
    KillSwitched,
}

impl StrategyStatus {
    pub fn excluded(&self) -> bool {
        matches!(self, StrategyStatus::Quarantined | StrategyStatus::KillSwitched)
    }
}

/// One strategy's opinion within a single consensus cycle. Ephemeral.
#[derive(Debug, Clone)]
pub struct Vote {
    pub strategy: String,
    pub direction: Direction,
    pub weight: f64,
    pub status: StrategyStatus,
}

/// A candidate trade produced by one accepted consensus cycle.
#[derive(Debug, Clone)]
pub struct Signal {
    pub symbol: String,
    pub direction: Direction,
    pub timeframe: Timeframe,
    pub notional: f64,
    pub entry: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub confidence: f64,
    pub source_strategy: String,
    pub contributing_votes: Vec<Vote>,
    /// True when this order adds to an existing book on the same symbol.
    pub add_to_position: bool,
}

/// An open position as reported by the execution backend.
#[derive(Debug, Clone)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    pub units: f64,
    pub entry_price: f64,
    pub current_stop: Option<f64>,
    pub current_target: Option<f64>,
    /// Epoch seconds; None when the backend does not report an open time.
    pub opened_at: Option<i64>,
    pub unrealized_pnl: f64,
}

impl Position {
    pub fn is_long(&self) -> bool {
        self.direction == Direction::Buy
    }

    pub fn notional(&self) -> f64 {
        self.units.abs() * self.entry_price
    }
}

/// Read-only portfolio snapshot supplied by the execution backend each cycle.
#[derive(Debug, Clone)]
pub struct PortfolioState {
    pub daily_start_balance: f64,
    pub current_balance: f64,
    pub daily_peak_pnl: f64,
    pub margin_used_pct: f64,
    pub open_positions: Vec<Position>,
    pub daily_drawdown_pct: f64,
    pub nav: f64,
    pub unrealized_pnl: f64,
}

impl PortfolioState {
    pub fn daily_pnl(&self) -> f64 {
        self.current_balance - self.daily_start_balance
    }

    pub fn symbol_unrealized(&self, symbol: &str) -> f64 {
        self.open_positions
            .iter()
            .filter(|p| p.symbol == symbol)
            .map(|p| p.unrealized_pnl)
            .sum()
    }
}

/// Fixed reason codes so tests and cooldown logic can switch on the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateReason {
    Approved,
    DailyLossBreakerActive,
    MarginCapHit,
    MaxPositionsReached,
    DailyProfitFloorTriggered,
    DailyProfitProtectionTriggered,
    TimeframeTooLow,
    NotionalTooSmall,
    MissingBracket,
    RewardRiskTooLow,
    SymbolConcentration,
    DuplicatePosition,
    CorrelationLimit,
    NotionalExceedsRiskLimit,
    ScalingNotAllowed,
    FilteredSynergy,
}

impl GateReason {
    pub fn code(&self) -> &'static str {
        match self {
            GateReason::Approved => "APPROVED",
            GateReason::DailyLossBreakerActive => "DAILY_LOSS_BREAKER_ACTIVE",
            GateReason::MarginCapHit => "MARGIN_CAP_HIT",
            GateReason::MaxPositionsReached => "MAX_POSITIONS_REACHED",
            GateReason::DailyProfitFloorTriggered => "DAILY_PROFIT_FLOOR_TRIGGERED",
            GateReason::DailyProfitProtectionTriggered => "DAILY_PROFIT_PROTECTION_TRIGGERED",
            GateReason::TimeframeTooLow => "TIMEFRAME_TOO_LOW",
            GateReason::NotionalTooSmall => "NOTIONAL_TOO_SMALL",
            GateReason::MissingBracket => "MISSING_BRACKET",
            GateReason::RewardRiskTooLow => "REWARD_RISK_TOO_LOW",
            GateReason::SymbolConcentration => "MAX_POSITIONS_PER_SYMBOL_REACHED",
            GateReason::DuplicatePosition => "DUPLICATE_POSITION",
            GateReason::CorrelationLimit => "CORRELATION_LIMIT",
            GateReason::NotionalExceedsRiskLimit => "NOTIONAL_EXCEEDS_RISK_LIMIT",
            GateReason::ScalingNotAllowed => "SCALING_NOT_ALLOWED",
            GateReason::FilteredSynergy => "FILTERED_SYNERGY",
        }
    }
}

/// Outcome of a single gate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateDecision {
    pub approved: bool,
    pub reason: GateReason,
}

impl GateDecision {
    pub fn approve() -> Self {
        Self { approved: true, reason: GateReason::Approved }
    }

    pub fn reject(reason: GateReason) -> Self {
        Self { approved: false, reason }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candle {
    pub ts: i64,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
}

/// Candle history for one symbol plus derived lookups strategies vote on.
/// Accessors return None when the history is too short; a missing value is
/// a valid "no opinion" input, not an error.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub candles: Vec<Candle>,
}

impl MarketSnapshot {
    pub fn new(symbol: impl Into<String>, candles: Vec<Candle>) -> Self {
        Self { symbol: symbol.into(), candles }
    }

    pub fn is_crypto(&self) -> bool {
        self.symbol.contains('-')
    }

    pub fn close(&self) -> Option<f64> {
        self.candles.last().map(|c| c.c)
    }

    pub fn prev_close(&self) -> Option<f64> {
        if self.candles.len() < 2 {
            return None;
        }
        Some(self.candles[self.candles.len() - 2].c)
    }

    fn tail(&self, n: usize) -> Option<&[Candle]> {
        if n == 0 || self.candles.len() < n {
            return None;
        }
        Some(&self.candles[self.candles.len() - n..])
    }

    pub fn sma(&self, n: usize) -> Option<f64> {
        let window = self.tail(n)?;
        Some(window.iter().map(|c| c.c).sum::<f64>() / n as f64)
    }

    pub fn highest(&self, n: usize) -> Option<f64> {
        let window = self.tail(n)?;
        window.iter().map(|c| c.h).fold(None, |acc: Option<f64>, h| {
            Some(acc.map_or(h, |a| a.max(h)))
        })
    }

    pub fn lowest(&self, n: usize) -> Option<f64> {
        let window = self.tail(n)?;
        window.iter().map(|c| c.l).fold(None, |acc: Option<f64>, l| {
            Some(acc.map_or(l, |a| a.min(l)))
        })
    }

    pub fn last_volume(&self) -> Option<f64> {
        self.candles.last().map(|c| c.v)
    }

    pub fn avg_volume(&self, n: usize) -> Option<f64> {
        let window = self.tail(n)?;
        Some(window.iter().map(|c| c.v).sum::<f64>() / n as f64)
    }

    pub fn momentum(&self) -> Option<f64> {
        let last = self.close()?;
        let prev = self.prev_close()?;
        if prev == 0.0 {
            return None;
        }
        Some((last - prev) / prev)
    }
}

pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
