//! Policy gate: ordered, deterministic veto rules.
//!
//! Two entry points. `check_portfolio_state` runs once per engine cycle and
//! answers "may we trade at all right now". `validate_signal` runs per
//! candidate and answers "may we take this trade". Both evaluate their rules
//! in a fixed order and return the first failure, so a rejection reason is
//! reproducible from the same inputs.

use crate::config::Config;
use crate::correlation::CorrelationGuard;
use crate::logging;
use crate::signal::{GateDecision, GateReason, PortfolioState, Signal};

pub struct PolicyGate {
    cfg: Config,
    corr: CorrelationGuard,
}

impl PolicyGate {
    pub fn new(cfg: Config) -> Self {
        let corr = CorrelationGuard::new(cfg.max_correlated_positions);
        Self { cfg, corr }
    }

    /// Portfolio-level kill conditions, checked once per cycle.
    pub fn check_portfolio_state(&self, p: &PortfolioState) -> GateDecision {
        if p.daily_drawdown_pct > self.cfg.max_daily_drawdown_pct {
            return self.reject_portfolio(GateReason::DailyLossBreakerActive);
        }
        if p.margin_used_pct > self.cfg.max_margin_used_pct {
            return self.reject_portfolio(GateReason::MarginCapHit);
        }
        if p.open_positions.len() >= self.cfg.max_positions {
            return self.reject_portfolio(GateReason::MaxPositionsReached);
        }

        // Profit ratchet. Both levels arm only once the day's peak clears
        // their threshold; an armed level then acts as a one-way floor under
        // realized daily P&L. Floor is checked before the ratio lock.
        let pnl = p.daily_pnl();
        let floor = (p.daily_peak_pnl >= self.cfg.floor_threshold).then_some(self.cfg.floor_threshold);
        if let Some(floor) = floor {
            if pnl <= floor {
                return self.reject_portfolio(GateReason::DailyProfitFloorTriggered);
            }
        }
        let lock = (p.daily_peak_pnl >= self.cfg.ratchet_threshold)
            .then_some(p.daily_peak_pnl * self.cfg.ratchet_ratio);
        if let Some(lock) = lock {
            if pnl <= lock {
                return self.reject_portfolio(GateReason::DailyProfitProtectionTriggered);
            }
        }

        GateDecision::approve()
    }

    /// Per-signal structural checks, in fixed order.
    pub fn validate_signal(&self, signal: &Signal, portfolio: &PortfolioState) -> GateDecision {
        if signal.timeframe < self.cfg.min_timeframe {
            return self.reject_signal(signal, GateReason::TimeframeTooLow);
        }

        let is_crypto = signal.symbol.contains('-');
        let min_notional =
            if is_crypto { self.cfg.min_crypto_notional } else { self.cfg.min_notional };
        if signal.notional < min_notional {
            return self.reject_signal(signal, GateReason::NotionalTooSmall);
        }

        if self.cfg.oco_mandatory && (signal.stop_loss.is_none() || signal.take_profit.is_none()) {
            return self.reject_signal(signal, GateReason::MissingBracket);
        }

        if let (Some(stop), Some(target)) = (signal.stop_loss, signal.take_profit) {
            let risk = (signal.entry - stop).abs();
            let reward = (target - signal.entry).abs();
            if risk > 0.0 && reward / risk < self.cfg.min_reward_risk {
                return self.reject_signal(signal, GateReason::RewardRiskTooLow);
            }
        }

        let on_symbol = portfolio
            .open_positions
            .iter()
            .filter(|pos| pos.symbol == signal.symbol)
            .count();
        if on_symbol >= self.cfg.max_positions_per_symbol {
            return self.reject_signal(signal, GateReason::SymbolConcentration);
        }

        if let Some(reason) =
            self.corr.check(&signal.symbol, signal.direction, &portfolio.open_positions)
        {
            return self.reject_signal(signal, reason);
        }

        // Hard risk cap: the stop distance bounds how much notional the
        // account is allowed to put behind this idea.
        if let Some(stop) = signal.stop_loss {
            if portfolio.nav > 0.0 && signal.entry != 0.0 {
                let stop_fraction = (signal.entry - stop).abs() / signal.entry.abs();
                let allowed = if stop_fraction > 0.0 {
                    portfolio.nav * self.cfg.max_risk_per_trade / stop_fraction
                } else {
                    portfolio.nav * self.cfg.max_risk_per_trade
                };
                if signal.notional > allowed {
                    return self.reject_signal(signal, GateReason::NotionalExceedsRiskLimit);
                }
            }
        }

        if signal.add_to_position && portfolio.symbol_unrealized(&signal.symbol) <= 0.0 {
            return self.reject_signal(signal, GateReason::ScalingNotAllowed);
        }

        GateDecision::approve()
    }

    fn reject_portfolio(&self, reason: GateReason) -> GateDecision {
        logging::log_gate_reject("*", reason.code(), "portfolio");
        GateDecision::reject(reason)
    }

    fn reject_signal(&self, signal: &Signal, reason: GateReason) -> GateDecision {
        logging::log_gate_reject(&signal.symbol, reason.code(), "signal");
        GateDecision::reject(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::signal::{Direction, Position, Timeframe};

    fn gate() -> PolicyGate {
        PolicyGate::new(Config::for_tests())
    }

    fn portfolio() -> PortfolioState {
        PortfolioState {
            daily_start_balance: 10_000.0,
            current_balance: 10_000.0,
            daily_peak_pnl: 0.0,
            margin_used_pct: 0.1,
            open_positions: vec![],
            daily_drawdown_pct: 0.0,
            nav: 10_000.0,
            unrealized_pnl: 0.0,
        }
    }

    fn signal() -> Signal {
        Signal {
            symbol: "EUR_USD".to_string(),
            direction: Direction::Buy,
            timeframe: Timeframe::M15,
            notional: 1_500.0,
            entry: 1.0,
            stop_loss: Some(0.995),
            take_profit: Some(1.02),
            confidence: 0.6,
            source_strategy: "momentum".to_string(),
            contributing_votes: vec![],
            add_to_position: false,
        }
    }

    fn pos(symbol: &str, direction: Direction, upl: f64) -> Position {
        Position {
            id: format!("t-{symbol}"),
            symbol: symbol.to_string(),
            direction,
            units: 10_000.0,
            entry_price: 1.0,
            current_stop: Some(0.99),
            current_target: Some(1.03),
            opened_at: Some(0),
            unrealized_pnl: upl,
        }
    }

    #[test]
    fn healthy_portfolio_approved() {
        let d = gate().check_portfolio_state(&portfolio());
        assert!(d.approved);
        assert_eq!(d.reason, GateReason::Approved);
    }

    #[test]
    fn drawdown_breaker_fires_first() {
        let mut p = portfolio();
        p.daily_drawdown_pct = 0.06;
        p.margin_used_pct = 0.9; // margin would also fail; drawdown wins
        let d = gate().check_portfolio_state(&p);
        assert_eq!(d.reason, GateReason::DailyLossBreakerActive);
    }

    #[test]
    fn margin_cap_and_position_cap() {
        let mut p = portfolio();
        p.margin_used_pct = 0.36;
        assert_eq!(gate().check_portfolio_state(&p).reason, GateReason::MarginCapHit);

        // Exactly at the cap is still inside it.
        let mut p = portfolio();
        p.margin_used_pct = 0.35;
        assert!(gate().check_portfolio_state(&p).approved);

        let mut p = portfolio();
        p.open_positions =
            vec![pos("A", Direction::Buy, 0.0), pos("B", Direction::Buy, 0.0), pos("C", Direction::Buy, 0.0)];
        assert_eq!(gate().check_portfolio_state(&p).reason, GateReason::MaxPositionsReached);
    }

    #[test]
    fn ratchet_gives_back_too_much_of_peak() {
        // Peak 450 arms the lock at 360; pnl exactly at the lock is rejected.
        let mut p = portfolio();
        p.current_balance = 10_360.0;
        p.daily_peak_pnl = 450.0;
        let d = gate().check_portfolio_state(&p);
        assert_eq!(d.reason, GateReason::DailyProfitProtectionTriggered);
    }

    #[test]
    fn ratchet_holding_above_lock_is_approved() {
        let mut p = portfolio();
        p.current_balance = 10_450.0;
        p.daily_peak_pnl = 450.0;
        assert!(gate().check_portfolio_state(&p).approved);
    }

    #[test]
    fn floor_checked_before_ratio_lock() {
        // Peak 400 arms floor at 300 and lock at 320. pnl 290 breaches both;
        // the floor reason must win.
        let mut p = portfolio();
        p.current_balance = 10_290.0;
        p.daily_peak_pnl = 400.0;
        let d = gate().check_portfolio_state(&p);
        assert_eq!(d.reason, GateReason::DailyProfitFloorTriggered);
    }

    #[test]
    fn ratchet_inactive_below_threshold() {
        // Peak never reached the arming threshold: losses are the breaker's
        // business, not the ratchet's.
        let mut p = portfolio();
        p.current_balance = 10_050.0;
        p.daily_peak_pnl = 200.0;
        assert!(gate().check_portfolio_state(&p).approved);
    }

    #[test]
    fn portfolio_check_is_idempotent() {
        let g = gate();
        let mut p = portfolio();
        p.current_balance = 10_360.0;
        p.daily_peak_pnl = 450.0;
        let first = g.check_portfolio_state(&p);
        let second = g.check_portfolio_state(&p);
        assert_eq!(first, second);
    }

    #[test]
    fn scalping_timeframes_rejected() {
        let mut s = signal();
        s.timeframe = Timeframe::M5;
        let d = gate().validate_signal(&s, &portfolio());
        assert_eq!(d.reason, GateReason::TimeframeTooLow);
    }

    #[test]
    fn crypto_gets_lower_notional_floor() {
        let mut s = signal();
        s.symbol = "BTC-USD".to_string();
        s.notional = 500.0;
        s.entry = 50_000.0;
        s.stop_loss = Some(49_000.0);
        s.take_profit = Some(53_100.0);
        assert!(gate().validate_signal(&s, &portfolio()).approved);

        let mut s = signal();
        s.notional = 500.0;
        assert_eq!(gate().validate_signal(&s, &portfolio()).reason, GateReason::NotionalTooSmall);
    }

    #[test]
    fn missing_bracket_rejected() {
        let mut s = signal();
        s.take_profit = None;
        assert_eq!(gate().validate_signal(&s, &portfolio()).reason, GateReason::MissingBracket);
    }

    #[test]
    fn poor_reward_risk_rejected() {
        let mut s = signal();
        s.stop_loss = Some(0.99);
        s.take_profit = Some(1.01); // 1:1
        assert_eq!(gate().validate_signal(&s, &portfolio()).reason, GateReason::RewardRiskTooLow);
    }

    #[test]
    fn notional_capped_by_stop_distance() {
        // 5% stop on a 10k account at 2% risk allows 4k notional; 10k is out.
        let mut s = signal();
        s.notional = 10_000.0;
        s.entry = 100.0;
        s.stop_loss = Some(95.0);
        s.take_profit = Some(160.0);
        let d = gate().validate_signal(&s, &portfolio());
        assert_eq!(d.reason, GateReason::NotionalExceedsRiskLimit);
    }

    #[test]
    fn first_failure_wins_in_signal_order() {
        // Undersized notional and missing bracket: notional rule runs first.
        let mut s = signal();
        s.notional = 500.0;
        s.stop_loss = None;
        assert_eq!(gate().validate_signal(&s, &portfolio()).reason, GateReason::NotionalTooSmall);
    }

    #[test]
    fn symbol_concentration_enforced() {
        let mut p = portfolio();
        p.open_positions = vec![
            pos("EUR_USD", Direction::Buy, 0.0),
            pos("EUR_USD", Direction::Sell, 0.0),
            pos("EUR_USD", Direction::Buy, 0.0),
        ];
        let d = gate().validate_signal(&signal(), &p);
        assert_eq!(d.reason, GateReason::SymbolConcentration);
    }

    #[test]
    fn duplicate_position_rejected_via_correlation_guard() {
        let mut p = portfolio();
        p.open_positions = vec![pos("EUR_USD", Direction::Buy, 0.0)];
        let d = gate().validate_signal(&signal(), &p);
        assert_eq!(d.reason, GateReason::DuplicatePosition);
    }

    #[test]
    fn scaling_requires_green_book() {
        let mut p = portfolio();
        p.open_positions = vec![pos("EUR_USD", Direction::Sell, -12.0)];
        let mut s = signal();
        s.add_to_position = true;
        assert_eq!(gate().validate_signal(&s, &p).reason, GateReason::ScalingNotAllowed);

        p.open_positions = vec![pos("EUR_USD", Direction::Sell, 12.0)];
        assert!(gate().validate_signal(&s, &p).approved);
    }

    #[test]
    fn signal_validation_is_idempotent() {
        let g = gate();
        let s = signal();
        let p = portfolio();
        assert_eq!(g.validate_signal(&s, &p), g.validate_signal(&s, &p));
    }
}
