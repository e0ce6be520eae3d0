//! Position supervisor: a fixed-priority rule ladder over every open trade.
//!
//! Runs as its own task on a short interval, independent of the entry
//! engine. Rules are checked in a fixed order and the first terminal rule
//! (a close) short-circuits the rest for that position; stop adjustments
//! fall through. One position's failure never blocks the others.

use crate::config::Config;
use crate::consensus::ConsensusAggregator;
use crate::execution::{ExecError, ExecutionPort};
use crate::logging::{self, obj, v_num, v_str, Domain, Level};
use crate::regime;
use crate::signal::{now_ts, MarketSnapshot, Position};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq)]
enum Action {
    Close(&'static str),
    MoveStop(&'static str, f64),
    None,
}

pub struct Supervisor {
    cfg: Config,
    port: Arc<dyn ExecutionPort>,
    aggregator: Arc<ConsensusAggregator>,
    /// First time each trade id was seen, for backends that do not report
    /// an open time.
    first_seen: HashMap<String, i64>,
    /// Last vigilante consensus check per trade id.
    vigilante_last: HashMap<String, i64>,
}

impl Supervisor {
    pub fn new(
        cfg: Config,
        port: Arc<dyn ExecutionPort>,
        aggregator: Arc<ConsensusAggregator>,
    ) -> Self {
        Self { cfg, port, aggregator, first_seen: HashMap::new(), vigilante_last: HashMap::new() }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.cfg.supervisor_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    if let Err(err) = self.scan_once(now_ts()).await {
                        logging::log(
                            Level::Error,
                            Domain::Supervisor,
                            "scan_failed",
                            obj(&[("error", v_str(&err.to_string()))]),
                        );
                    }
                }
            }
        }
        logging::log(Level::Info, Domain::Supervisor, "stopped", obj(&[]));
    }

    pub async fn scan_once(&mut self, now: i64) -> Result<(), ExecError> {
        let portfolio = self.port.portfolio_state().await?;
        let risk_off = portfolio.unrealized_pnl < -self.cfg.risk_off_loss;

        let live_ids: Vec<String> =
            portfolio.open_positions.iter().map(|p| p.id.clone()).collect();
        self.first_seen.retain(|id, _| live_ids.contains(id));
        self.vigilante_last.retain(|id, _| live_ids.contains(id));

        for pos in &portfolio.open_positions {
            self.first_seen.entry(pos.id.clone()).or_insert(now);
            if let Err(err) = self.manage_position(pos, risk_off, now).await {
                // Isolation: log and move on to the next position.
                logging::log(
                    Level::Warn,
                    Domain::Supervisor,
                    "position_error",
                    obj(&[
                        ("trade_id", v_str(&pos.id)),
                        ("symbol", v_str(&pos.symbol)),
                        ("error", v_str(&err.to_string())),
                    ]),
                );
            }
        }
        Ok(())
    }

    async fn manage_position(
        &mut self,
        pos: &Position,
        risk_off: bool,
        now: i64,
    ) -> Result<(), ExecError> {
        let action = self.decide(pos, risk_off, now).await?;
        match action {
            Action::Close(rule) => {
                let closed = self.port.close_trade(&pos.id).await?;
                logging::log(
                    Level::Info,
                    Domain::Supervisor,
                    "closed",
                    obj(&[
                        ("trade_id", v_str(&pos.id)),
                        ("symbol", v_str(&pos.symbol)),
                        ("rule", v_str(rule)),
                        ("realized_pnl", v_num(closed.realized_pnl)),
                    ]),
                );
                self.settle(&closed.trade_id, closed.realized_pnl);
            }
            Action::MoveStop(rule, level) => {
                self.port.modify_stop(&pos.id, level).await?;
                logging::log(
                    Level::Info,
                    Domain::Supervisor,
                    "stop_moved",
                    obj(&[
                        ("trade_id", v_str(&pos.id)),
                        ("symbol", v_str(&pos.symbol)),
                        ("rule", v_str(rule)),
                        ("level", v_num(level)),
                    ]),
                );
            }
            Action::None => {}
        }
        Ok(())
    }

    /// Feed a settled trade back into the weight store via the order map.
    /// An unmapped trade (manual or pre-restart) settles nowhere.
    fn settle(&self, trade_id: &str, realized_pnl: f64) {
        let weights = self.aggregator.weights();
        let Some(strategy) = weights.strategy_for_order(trade_id) else {
            return;
        };
        if let Err(err) = weights.record_outcome(&strategy, realized_pnl) {
            logging::log(
                Level::Error,
                Domain::Supervisor,
                "settle_failed",
                obj(&[("strategy", v_str(&strategy)), ("error", v_str(&err.to_string()))]),
            );
        }
        let _ = weights.unmap_order(trade_id);
    }

    async fn decide(
        &mut self,
        pos: &Position,
        risk_off: bool,
        now: i64,
    ) -> Result<Action, ExecError> {
        let is_crypto = pos.symbol.contains('-');

        // 1. An unprotected position is an emergency, not a candidate for
        //    repair.
        if pos.current_stop.is_none() {
            return Ok(Action::Close("missing_stop"));
        }

        // 2. Dust that cannot pay for its own spread.
        if !is_crypto && pos.units.abs() < self.cfg.dust_units {
            return Ok(Action::Close("dust"));
        }

        let opened = pos.opened_at.or_else(|| self.first_seen.get(&pos.id).copied()).unwrap_or(now);
        let age_hours = (now - opened) as f64 / 3600.0;
        let upl = pos.unrealized_pnl;

        // 3. Zombie: old and going nowhere.
        if age_hours > self.cfg.zombie_hours && upl.abs() < self.cfg.zombie_pnl_epsilon {
            return Ok(Action::Close("zombie"));
        }

        // 4. Stagnant winner: old profit is realized, not admired.
        if age_hours > self.cfg.stagnant_winner_hours && upl > self.cfg.stagnant_winner_min_profit {
            return Ok(Action::Close("stagnant_winner"));
        }

        // 5. Rotting: losers do not get to age.
        if age_hours > self.cfg.max_red_hold_hours && upl < 0.0 {
            return Ok(Action::Close("rotting"));
        }

        let price = self.port.price(&pos.symbol).await?;
        let mut stop = pos.current_stop.unwrap_or(price);
        let notional = pos.notional();
        let profit_pct = if notional > 0.0 { upl / notional } else { 0.0 };

        // Stop-tightening rules fall through; the later rules see the
        // tightened level and the last tightening wins.
        let mut pending: Option<(&'static str, f64)> = None;

        // 6. Breakeven lock. Ratchet only: the stop moves toward entry,
        //    never away, and never through the current price.
        if profit_pct >= self.cfg.breakeven_trigger_pct && upl > 0.0 {
            let buffer = pip_size(&pos.symbol, pos.entry_price) * 2.0;
            if pos.is_long() {
                let target = pos.entry_price + buffer;
                if stop < target && target < price {
                    pending = Some(("breakeven", target));
                    stop = target;
                }
            } else {
                let target = pos.entry_price - buffer;
                if stop > target && target > price {
                    pending = Some(("breakeven", target));
                    stop = target;
                }
            }
        }

        // 7. Enforce the stop ourselves; the venue's trigger is advisory.
        if pos.is_long() {
            if price <= stop {
                return Ok(Action::Close("stop_enforced"));
            }
        } else if price >= stop {
            return Ok(Action::Close("stop_enforced"));
        }

        // 8. Vigilante: a losing position re-argues its own thesis, at most
        //    once per throttle window.
        if upl < 0.0 {
            let due = self
                .vigilante_last
                .get(&pos.id)
                .map_or(true, |last| now - last >= self.cfg.vigilante_throttle_secs as i64);
            if due {
                self.vigilante_last.insert(pos.id.clone(), now);
                let candles = self
                    .port
                    .candles(&pos.symbol, self.cfg.candle_timeframe, self.cfg.candle_limit)
                    .await?;
                let snap = MarketSnapshot::new(pos.symbol.clone(), candles);
                let consensus = self.aggregator.get_consensus(&snap);
                if consensus.direction.opposes(pos.direction) {
                    return Ok(Action::Close("vigilante"));
                }
            }
        }

        // 9. Chandelier trail, once activated by profit or a risk-off book.
        //    Missing candle data skips the trail without dropping a move
        //    already decided above.
        if profit_pct >= self.cfg.trail_activation_pct || risk_off {
            match self
                .port
                .candles(&pos.symbol, self.cfg.candle_timeframe, self.cfg.candle_limit)
                .await
            {
                Ok(candles) => {
                    let read = regime::detect(&candles, self.cfg.atr_period);
                    if let Some(level) = regime::chandelier(
                        &candles,
                        pos.direction,
                        self.cfg.chandelier_period,
                        self.cfg.atr_period,
                        self.cfg.chandelier_mult,
                        read.regime.stop_tightener(),
                    ) {
                        // Only ever tighten, and never through the price.
                        if pos.is_long() {
                            if level > stop && level < price {
                                pending = Some(("chandelier", level));
                            }
                        } else if level < stop && level > price {
                            pending = Some(("chandelier", level));
                        }
                    }
                }
                Err(err) => {
                    logging::log(
                        Level::Debug,
                        Domain::Supervisor,
                        "trail_skipped",
                        obj(&[
                            ("trade_id", v_str(&pos.id)),
                            ("symbol", v_str(&pos.symbol)),
                            ("error", v_str(&err.to_string())),
                        ]),
                    );
                }
            }
        }

        Ok(match pending {
            Some((rule, level)) => Action::MoveStop(rule, level),
            None => Action::None,
        })
    }
}

fn pip_size(symbol: &str, price: f64) -> f64 {
    if symbol.contains('-') {
        price.abs() * 0.0001
    } else if symbol.ends_with("_JPY") {
        0.01
    } else {
        0.0001
    }
}
