//! Runtime configuration, sourced from the environment with CLI overrides.

use crate::signal::Timeframe;
use anyhow::{bail, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Paper,
    Live,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Paper => "paper",
            Mode::Live => "live",
        }
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub symbols: Vec<String>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub db_path: String,
    pub heartbeat_path: String,

    // Engine pacing
    pub loop_pace_secs: u64,
    pub halt_pause_secs: u64,
    pub crash_pause_secs: u64,
    pub candle_limit: usize,
    pub candle_timeframe: Timeframe,
    pub disable_pool: bool,
    pub disabled_strategies: Vec<String>,

    // Gate
    pub min_timeframe: Timeframe,
    pub min_notional: f64,
    pub min_crypto_notional: f64,
    pub oco_mandatory: bool,
    pub min_reward_risk: f64,
    pub max_margin_used_pct: f64,
    pub max_daily_drawdown_pct: f64,
    pub max_positions: usize,
    pub max_positions_per_symbol: usize,
    pub max_correlated_positions: usize,
    pub max_risk_per_trade: f64,
    pub ratchet_threshold: f64,
    pub ratchet_ratio: f64,
    pub floor_threshold: f64,

    // Consensus acceptance
    pub pool_min_confidence: f64,
    pub pool_min_votes: u32,
    pub pool_min_top_score: f64,
    pub pool_crypto_min_confidence: f64,

    // Allocation
    pub base_notional: f64,
    pub paper_starting_balance: f64,

    // Bracket construction
    pub bracket_stop_atr_mult: f64,
    pub bracket_reward_mult: f64,

    // Supervisor
    pub supervisor_interval_secs: u64,
    pub zombie_hours: f64,
    pub zombie_pnl_epsilon: f64,
    pub stagnant_winner_hours: f64,
    pub stagnant_winner_min_profit: f64,
    pub max_red_hold_hours: f64,
    pub breakeven_trigger_pct: f64,
    pub trail_activation_pct: f64,
    pub dust_units: f64,
    pub vigilante_throttle_secs: u64,
    pub risk_off_loss: f64,
    pub atr_period: usize,
    pub chandelier_period: usize,
    pub chandelier_mult: f64,

    // Cooldowns
    pub cooldown_base_secs: u64,
    pub cooldown_violation_secs: u64,
    pub cooldown_max_secs: u64,
    pub cooldown_escalate_after: u32,
}

impl Config {
    pub fn from_env() -> Self {
        let mode = match std::env::var("MODE").as_deref() {
            Ok("live") => Mode::Live,
            _ => Mode::Paper,
        };
        let symbols = std::env::var("SYMBOLS")
            .unwrap_or_else(|_| "EUR_USD,GBP_USD,USD_JPY,BTC-USD".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let disabled_strategies = std::env::var("DISABLED_STRATEGIES")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let default_min_notional = match mode {
            Mode::Live => 15_000.0,
            Mode::Paper => 1_000.0,
        };
        let min_timeframe = std::env::var("MIN_TIMEFRAME")
            .ok()
            .and_then(|v| Timeframe::parse(&v))
            .unwrap_or(Timeframe::M15);
        let candle_timeframe = std::env::var("CANDLE_TIMEFRAME")
            .ok()
            .and_then(|v| Timeframe::parse(&v))
            .unwrap_or(Timeframe::M15);

        Self {
            mode,
            symbols,
            api_key: std::env::var("API_KEY").ok().filter(|s| !s.is_empty()),
            api_secret: std::env::var("API_SECRET").ok().filter(|s| !s.is_empty()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "quorumfx.sqlite".to_string()),
            heartbeat_path: std::env::var("HEARTBEAT_PATH")
                .unwrap_or_else(|_| "system_status.json".to_string()),

            loop_pace_secs: env_u64("LOOP_PACE_SECS", 1),
            halt_pause_secs: env_u64("HALT_PAUSE_SECS", 60),
            crash_pause_secs: env_u64("CRASH_PAUSE_SECS", 10),
            candle_limit: env_usize("CANDLE_LIMIT", 60),
            candle_timeframe,
            disable_pool: false,
            disabled_strategies,

            min_timeframe,
            min_notional: env_f64("MIN_NOTIONAL", default_min_notional),
            min_crypto_notional: env_f64("MIN_CRYPTO_NOTIONAL", 10.0),
            oco_mandatory: env_bool("OCO_MANDATORY", true),
            min_reward_risk: env_f64("MIN_REWARD_RISK", 3.0),
            max_margin_used_pct: env_f64("MAX_MARGIN_USED_PCT", 0.35),
            max_daily_drawdown_pct: env_f64("MAX_DAILY_DRAWDOWN_PCT", 0.05),
            max_positions: env_usize("MAX_POSITIONS", 3),
            max_positions_per_symbol: env_usize("MAX_POSITIONS_PER_SYMBOL", 3),
            max_correlated_positions: env_usize("MAX_CORRELATED_POSITIONS", 2),
            max_risk_per_trade: env_f64("MAX_RISK_PER_TRADE", 0.02),
            ratchet_threshold: env_f64("DAILY_PROFIT_RATCHET_THRESHOLD", 300.0),
            ratchet_ratio: env_f64("DAILY_PROFIT_RATCHET_RATIO", 0.8),
            floor_threshold: env_f64("DAILY_PROFIT_FLOOR_THRESHOLD", 300.0),

            pool_min_confidence: env_f64("POOL_MIN_CONFIDENCE", 0.25),
            pool_min_votes: env_u64("POOL_MIN_VOTES", 2) as u32,
            pool_min_top_score: env_f64("POOL_MIN_TOP_SCORE", 0.5),
            pool_crypto_min_confidence: env_f64("POOL_CRYPTO_MIN_CONFIDENCE", 0.85),

            base_notional: env_f64("BASE_NOTIONAL", 10_000.0),
            paper_starting_balance: env_f64("PAPER_STARTING_BALANCE", 10_000.0),

            bracket_stop_atr_mult: env_f64("BRACKET_STOP_ATR_MULT", 2.0),
            bracket_reward_mult: env_f64("BRACKET_REWARD_MULT", 4.0),

            supervisor_interval_secs: env_u64("SUPERVISOR_INTERVAL_SECS", 5),
            zombie_hours: env_f64("ZOMBIE_HOURS", 4.0),
            zombie_pnl_epsilon: env_f64("ZOMBIE_PNL_EPSILON", 5.0),
            stagnant_winner_hours: env_f64("STAGNANT_WINNER_HOURS", 6.0),
            stagnant_winner_min_profit: env_f64("STAGNANT_WINNER_MIN_PROFIT", 5.0),
            max_red_hold_hours: env_f64("MAX_RED_HOLD_HOURS", 2.0),
            breakeven_trigger_pct: env_f64("BREAKEVEN_TRIGGER_PCT", 0.0005),
            trail_activation_pct: env_f64("TRAIL_ACTIVATION_PCT", 0.0005),
            dust_units: env_f64("DUST_UNITS", 1_000.0),
            vigilante_throttle_secs: env_u64("VIGILANTE_THROTTLE_SECS", 30),
            risk_off_loss: env_f64("RISK_OFF_LOSS", 200.0),
            atr_period: env_usize("ATR_PERIOD", 14),
            chandelier_period: env_usize("CHANDELIER_PERIOD", 22),
            chandelier_mult: env_f64("CHANDELIER_MULT", 2.0),

            cooldown_base_secs: env_u64("COOLDOWN_BASE_SECS", 300),
            cooldown_violation_secs: env_u64("COOLDOWN_VIOLATION_SECS", 900),
            cooldown_max_secs: env_u64("COOLDOWN_MAX_SECS", 3600),
            cooldown_escalate_after: env_u64("COOLDOWN_ESCALATE_AFTER", 3) as u32,
        }
    }

    /// Fail-fast startup validation. A live session with no credentials or an
    /// inconsistent limit set refuses to boot rather than limping along.
    pub fn validate(&self) -> Result<()> {
        if self.mode == Mode::Live && (self.api_key.is_none() || self.api_secret.is_none()) {
            bail!("live mode requires API_KEY and API_SECRET");
        }
        if self.symbols.is_empty() {
            bail!("no symbols configured");
        }
        if self.min_reward_risk <= 0.0 {
            bail!("MIN_REWARD_RISK must be positive");
        }
        if !(0.0..=1.0).contains(&self.max_margin_used_pct) {
            bail!("MAX_MARGIN_USED_PCT must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.max_daily_drawdown_pct) {
            bail!("MAX_DAILY_DRAWDOWN_PCT must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.ratchet_ratio) {
            bail!("DAILY_PROFIT_RATCHET_RATIO must be within [0, 1]");
        }
        if self.max_positions == 0 {
            bail!("MAX_POSITIONS must be at least 1");
        }
        if self.cooldown_base_secs > self.cooldown_max_secs {
            bail!("COOLDOWN_BASE_SECS exceeds COOLDOWN_MAX_SECS");
        }
        if self.candle_limit < self.chandelier_period {
            bail!("CANDLE_LIMIT must cover the chandelier lookback");
        }
        Ok(())
    }

    /// Paper-mode baseline used across the test suites.
    pub fn for_tests() -> Self {
        let mut cfg = Self::from_env();
        cfg.mode = Mode::Paper;
        cfg.symbols = vec!["EUR_USD".to_string(), "BTC-USD".to_string()];
        cfg.min_notional = 1_000.0;
        cfg.min_crypto_notional = 10.0;
        cfg.max_positions = 3;
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let cfg = Config::for_tests();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.mode, Mode::Paper);
        assert!(cfg.min_reward_risk >= 1.0);
    }

    #[test]
    fn live_without_credentials_fails_validation() {
        let mut cfg = Config::for_tests();
        cfg.mode = Mode::Live;
        cfg.api_key = None;
        cfg.api_secret = None;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn inverted_cooldown_bounds_fail_validation() {
        let mut cfg = Config::for_tests();
        cfg.cooldown_base_secs = 7200;
        cfg.cooldown_max_secs = 3600;
        assert!(cfg.validate().is_err());
    }
}
