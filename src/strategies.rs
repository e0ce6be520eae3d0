//! Strategy roster: independent voters grouped into squads.
//!
//! A strategy is a pure function of the market snapshot. It never sees the
//! portfolio, never sizes anything, and may fail; the aggregator downgrades
//! a failed voter to HOLD instead of letting it poison the cycle.

use crate::config::Config;
use crate::signal::{Direction, MarketSnapshot};
use crate::weights::WeightStore;
use anyhow::{bail, Result};

/// Squad membership drives the synergy filter: a squad is a claim about the
/// kind of evidence a strategy trades on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Squad {
    /// High-conviction reversal snipers, trusted solo.
    Precision,
    /// Directional continuation.
    Trend,
    /// Mean reversion and range rotation.
    Reversion,
    /// Slow cross-window confluence.
    Macro,
}

impl Squad {
    pub fn as_str(&self) -> &'static str {
        match self {
            Squad::Precision => "precision",
            Squad::Trend => "trend",
            Squad::Reversion => "reversion",
            Squad::Macro => "macro",
        }
    }
}

pub trait StrategyCapability: Send + Sync {
    fn vote(&self, snap: &MarketSnapshot) -> Result<Direction>;

    /// Apply tuned parameters. Strategies without knobs ignore this.
    fn set_params(&mut self, _params: &dyn Fn(&str) -> Option<f64>) {}
}

pub struct Entry {
    pub name: &'static str,
    pub squad: Squad,
    pub strategy: Box<dyn StrategyCapability>,
}

pub struct Registry {
    entries: Vec<Entry>,
}

impl Registry {
    pub fn new(entries: Vec<Entry>) -> Self {
        Self { entries }
    }

    /// The standard roster, minus anything disabled by configuration.
    pub fn standard(cfg: &Config) -> Self {
        let all: Vec<Entry> = vec![
            Entry {
                name: "long_wick_reversal",
                squad: Squad::Precision,
                strategy: Box::new(LongWickReversal::default()),
            },
            Entry {
                name: "level_tap",
                squad: Squad::Precision,
                strategy: Box::new(LevelTap::default()),
            },
            Entry { name: "momentum", squad: Squad::Trend, strategy: Box::new(Momentum::default()) },
            Entry {
                name: "trend_follow",
                squad: Squad::Trend,
                strategy: Box::new(TrendFollow::default()),
            },
            Entry { name: "breakout", squad: Squad::Trend, strategy: Box::new(Breakout::default()) },
            Entry {
                name: "mean_reversion",
                squad: Squad::Reversion,
                strategy: Box::new(MeanReversion::default()),
            },
            Entry {
                name: "range_rotation",
                squad: Squad::Reversion,
                strategy: Box::new(RangeRotation::default()),
            },
            Entry {
                name: "confluence",
                squad: Squad::Macro,
                strategy: Box::new(Confluence::default()),
            },
        ];
        let entries = all
            .into_iter()
            .filter(|e| !cfg.disabled_strategies.iter().any(|d| d == e.name))
            .collect();
        Self { entries }
    }

    /// Load tuned parameters from the weight store into each strategy.
    pub fn apply_params(&mut self, weights: &WeightStore) {
        for entry in &mut self.entries {
            let name = entry.name;
            entry.strategy.set_params(&|key| weights.param(name, key));
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn squad_of(&self, name: &str) -> Option<Squad> {
        self.entries.iter().find(|e| e.name == name).map(|e| e.squad)
    }
}

// ---- trend squad ----

pub struct Momentum {
    pub threshold: f64,
}

impl Default for Momentum {
    fn default() -> Self {
        Self { threshold: 0.002 }
    }
}

impl StrategyCapability for Momentum {
    fn vote(&self, snap: &MarketSnapshot) -> Result<Direction> {
        let Some(m) = snap.momentum() else { return Ok(Direction::Hold) };
        if m > self.threshold {
            Ok(Direction::Buy)
        } else if m < -self.threshold {
            Ok(Direction::Sell)
        } else {
            Ok(Direction::Hold)
        }
    }

    fn set_params(&mut self, params: &dyn Fn(&str) -> Option<f64>) {
        if let Some(t) = params("threshold") {
            self.threshold = t;
        }
    }
}

pub struct TrendFollow {
    pub separation: f64,
}

impl Default for TrendFollow {
    fn default() -> Self {
        Self { separation: 0.005 }
    }
}

impl StrategyCapability for TrendFollow {
    fn vote(&self, snap: &MarketSnapshot) -> Result<Direction> {
        let (Some(price), Some(fast), Some(slow)) = (snap.close(), snap.sma(20), snap.sma(50))
        else {
            return Ok(Direction::Hold);
        };
        if slow == 0.0 {
            bail!("degenerate sma for {}", snap.symbol);
        }
        let spread = (fast - slow) / slow;
        if spread > self.separation && price > fast {
            Ok(Direction::Buy)
        } else if spread < -self.separation && price < fast {
            Ok(Direction::Sell)
        } else {
            Ok(Direction::Hold)
        }
    }

    fn set_params(&mut self, params: &dyn Fn(&str) -> Option<f64>) {
        if let Some(s) = params("separation") {
            self.separation = s;
        }
    }
}

pub struct Breakout {
    pub volume_mult: f64,
}

impl Default for Breakout {
    fn default() -> Self {
        Self { volume_mult: 1.5 }
    }
}

impl StrategyCapability for Breakout {
    fn vote(&self, snap: &MarketSnapshot) -> Result<Direction> {
        let (Some(price), Some(high), Some(low), Some(vol), Some(avg_vol)) = (
            snap.close(),
            snap.highest(20),
            snap.lowest(20),
            snap.last_volume(),
            snap.avg_volume(20),
        ) else {
            return Ok(Direction::Hold);
        };
        if avg_vol <= 0.0 || vol < avg_vol * self.volume_mult {
            return Ok(Direction::Hold);
        }
        if price >= high {
            Ok(Direction::Buy)
        } else if price <= low {
            Ok(Direction::Sell)
        } else {
            Ok(Direction::Hold)
        }
    }
}

// ---- reversion squad ----

pub struct MeanReversion {
    pub deviation: f64,
}

impl Default for MeanReversion {
    fn default() -> Self {
        Self { deviation: 0.015 }
    }
}

impl StrategyCapability for MeanReversion {
    fn vote(&self, snap: &MarketSnapshot) -> Result<Direction> {
        let (Some(price), Some(mean)) = (snap.close(), snap.sma(20)) else {
            return Ok(Direction::Hold);
        };
        if mean == 0.0 {
            bail!("degenerate sma for {}", snap.symbol);
        }
        let dev = (price - mean) / mean;
        if dev > self.deviation {
            Ok(Direction::Sell)
        } else if dev < -self.deviation {
            Ok(Direction::Buy)
        } else {
            Ok(Direction::Hold)
        }
    }

    fn set_params(&mut self, params: &dyn Fn(&str) -> Option<f64>) {
        if let Some(d) = params("deviation") {
            self.deviation = d;
        }
    }
}

#[derive(Default)]
pub struct RangeRotation;

impl StrategyCapability for RangeRotation {
    fn vote(&self, snap: &MarketSnapshot) -> Result<Direction> {
        let (Some(price), Some(high), Some(low)) = (snap.close(), snap.highest(20), snap.lowest(20))
        else {
            return Ok(Direction::Hold);
        };
        let span = high - low;
        if span <= 0.0 {
            return Ok(Direction::Hold);
        }
        let pos = (price - low) / span;
        // Only rotate near the edges of the box.
        if pos <= 0.1 {
            Ok(Direction::Buy)
        } else if pos >= 0.9 {
            Ok(Direction::Sell)
        } else {
            Ok(Direction::Hold)
        }
    }
}

// ---- precision squad ----

pub struct LongWickReversal {
    pub wick_ratio: f64,
}

impl Default for LongWickReversal {
    fn default() -> Self {
        Self { wick_ratio: 2.0 }
    }
}

impl StrategyCapability for LongWickReversal {
    fn vote(&self, snap: &MarketSnapshot) -> Result<Direction> {
        let Some(last) = snap.candles.last() else { return Ok(Direction::Hold) };
        let body = (last.c - last.o).abs();
        if body <= 0.0 {
            return Ok(Direction::Hold);
        }
        let lower_wick = last.o.min(last.c) - last.l;
        let upper_wick = last.h - last.o.max(last.c);
        if lower_wick > body * self.wick_ratio && lower_wick > upper_wick {
            Ok(Direction::Buy)
        } else if upper_wick > body * self.wick_ratio && upper_wick > lower_wick {
            Ok(Direction::Sell)
        } else {
            Ok(Direction::Hold)
        }
    }

    fn set_params(&mut self, params: &dyn Fn(&str) -> Option<f64>) {
        if let Some(r) = params("wick_ratio") {
            self.wick_ratio = r;
        }
    }
}

pub struct LevelTap {
    pub tolerance: f64,
}

impl Default for LevelTap {
    fn default() -> Self {
        Self { tolerance: 0.001 }
    }
}

impl StrategyCapability for LevelTap {
    fn vote(&self, snap: &MarketSnapshot) -> Result<Direction> {
        let (Some(price), Some(high), Some(low)) = (snap.close(), snap.highest(20), snap.lowest(20))
        else {
            return Ok(Direction::Hold);
        };
        if low > 0.0 && (price - low).abs() / low <= self.tolerance {
            return Ok(Direction::Buy);
        }
        if high > 0.0 && (high - price).abs() / high <= self.tolerance {
            return Ok(Direction::Sell);
        }
        Ok(Direction::Hold)
    }
}

// ---- macro squad ----

#[derive(Default)]
pub struct Confluence;

impl StrategyCapability for Confluence {
    fn vote(&self, snap: &MarketSnapshot) -> Result<Direction> {
        let (Some(price), Some(fast), Some(slow)) = (snap.close(), snap.sma(20), snap.sma(50))
        else {
            return Ok(Direction::Hold);
        };
        let Some(mid) = snap.sma(35) else { return Ok(Direction::Hold) };
        // All three windows have to agree before the macro desk leans in.
        if fast > mid && mid > slow && price > fast {
            Ok(Direction::Buy)
        } else if fast < mid && mid < slow && price < fast {
            Ok(Direction::Sell)
        } else {
            Ok(Direction::Hold)
        }
    }
}
