//! Position sizing from strategy weight, daily form and the risk cap.
//!
//! Sizing is advisory; the gate has the final veto. The order of adjustments
//! matters: weight multiplier, minimum-size floor, hot-hand multiplier, then
//! the hard risk cap last so nothing can multiply past it.

use crate::config::Config;
use crate::signal::PortfolioState;
use crate::weights::WeightStore;

const WEIGHT_MULT_MIN: f64 = 0.5;
const WEIGHT_MULT_MAX: f64 = 3.0;
const HOT_HAND_CAP: f64 = 2.0;
const HOT_HAND_SCALE: f64 = 1_000.0;

pub struct AllocationManager {
    cfg: Config,
}

impl AllocationManager {
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }

    pub fn size(
        &self,
        weights: &WeightStore,
        strategy: &str,
        symbol: &str,
        portfolio: &PortfolioState,
        entry: f64,
        stop: Option<f64>,
    ) -> f64 {
        let base = self.cfg.base_notional;
        let weight = weights.weight(strategy);
        let mut notional =
            (base * weight).clamp(base * WEIGHT_MULT_MIN, base * WEIGHT_MULT_MAX);

        let min_notional =
            if symbol.contains('-') { self.cfg.min_crypto_notional } else { self.cfg.min_notional };
        notional = notional.max(min_notional);

        // Hot hand: a day already past the ratchet threshold presses a
        // little harder, capped at 2x.
        let daily_pnl = portfolio.daily_pnl();
        if daily_pnl > self.cfg.ratchet_threshold {
            let mult =
                (1.0 + (daily_pnl - self.cfg.ratchet_threshold) / HOT_HAND_SCALE).min(HOT_HAND_CAP);
            notional *= mult;
        }

        // Risk cap last.
        if let Some(stop) = stop {
            if portfolio.nav > 0.0 && entry != 0.0 {
                let stop_fraction = (entry - stop).abs() / entry.abs();
                if stop_fraction > 0.0 {
                    let allowed = portfolio.nav * self.cfg.max_risk_per_trade / stop_fraction;
                    notional = notional.min(allowed);
                }
            }
        }

        notional
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn portfolio(daily_pnl: f64) -> PortfolioState {
        PortfolioState {
            daily_start_balance: 10_000.0,
            current_balance: 10_000.0 + daily_pnl,
            daily_peak_pnl: daily_pnl.max(0.0),
            margin_used_pct: 0.1,
            open_positions: vec![],
            daily_drawdown_pct: 0.0,
            nav: 10_000.0,
            unrealized_pnl: 0.0,
        }
    }

    fn fixture() -> (AllocationManager, WeightStore) {
        (AllocationManager::new(Config::for_tests()), WeightStore::open_in_memory().unwrap())
    }

    #[test]
    fn unknown_strategy_sizes_at_base() {
        let (alloc, ws) = fixture();
        let n = alloc.size(&ws, "ghost", "EUR_USD", &portfolio(0.0), 1.0, None);
        assert_eq!(n, 10_000.0);
    }

    #[test]
    fn weight_scales_and_floors() {
        let (alloc, ws) = fixture();
        // Deep cumulative losses push weight to its 0.1 floor; the 0.5x
        // clamp keeps sizing from collapsing with it.
        for _ in 0..2 {
            ws.record_outcome_at("cold", -5_000.0, 1000).unwrap();
        }
        let n = alloc.size(&ws, "cold", "EUR_USD", &portfolio(0.0), 1.0, None);
        assert_eq!(n, 5_000.0);
    }

    #[test]
    fn hot_hand_presses_after_ratchet_threshold() {
        let (alloc, ws) = fixture();
        // 800 over the 300 threshold: multiplier 1.5.
        let n = alloc.size(&ws, "ghost", "EUR_USD", &portfolio(800.0), 1.0, None);
        assert_eq!(n, 15_000.0);
        // Far past the threshold the multiplier caps at 2x.
        let n = alloc.size(&ws, "ghost", "EUR_USD", &portfolio(50_000.0), 1.0, None);
        assert_eq!(n, 20_000.0);
    }

    #[test]
    fn risk_cap_overrides_everything() {
        let (alloc, ws) = fixture();
        // 5% stop at 2% account risk allows only 4k, hot hand or not.
        let n =
            alloc.size(&ws, "ghost", "EUR_USD", &portfolio(50_000.0), 100.0, Some(95.0));
        assert_eq!(n, 4_000.0);
    }
}
