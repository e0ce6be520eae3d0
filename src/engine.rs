//! The entry engine: snapshot, consensus, gate, allocation, execution.
//!
//! One pass per pace tick. The heartbeat is written at the end of every
//! cycle on every path, including failures, so watchdogs track the loop
//! itself rather than its luck.

use crate::allocation::AllocationManager;
use crate::config::{Config, Mode};
use crate::consensus::ConsensusAggregator;
use crate::execution::{with_retry, ExecErrorClass, ExecutionPort};
use crate::gate::PolicyGate;
use crate::heartbeat::Heartbeat;
use crate::logging::{self, obj, v_num, v_str, Domain, Level};
use crate::regime;
use crate::signal::{now_ts, Direction, MarketSnapshot, PortfolioState, Signal};
use crate::state::{CooldownMap, DayState};
use crate::storage::Store;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const EXEC_RETRIES: u32 = 3;
const EXEC_RETRY_BASE_MS: u64 = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Idle,
    Placed,
    /// A portfolio-level veto; the loop backs off rather than re-asking
    /// every second.
    Halted,
}

pub struct Engine {
    cfg: Config,
    aggregator: Arc<ConsensusAggregator>,
    gate: PolicyGate,
    alloc: AllocationManager,
    port: Arc<dyn ExecutionPort>,
    store: Store,
    day: DayState,
    cooldowns: CooldownMap,
    heartbeat: Heartbeat,
    last_signal: Option<String>,
}

impl Engine {
    pub async fn new(
        cfg: Config,
        aggregator: Arc<ConsensusAggregator>,
        port: Arc<dyn ExecutionPort>,
    ) -> Result<Self> {
        let store = Store::open(&cfg.db_path)?;
        let portfolio = port
            .portfolio_state()
            .await
            .map_err(anyhow::Error::from)
            .context("initial portfolio read")?;
        let day = DayState::load_or_start(&store, portfolio.current_balance, now_ts())?;
        let cooldowns = CooldownMap::load(&cfg, &store)?;
        let heartbeat = Heartbeat::new(&cfg.heartbeat_path);
        let gate = PolicyGate::new(cfg.clone());
        let alloc = AllocationManager::new(cfg.clone());
        Ok(Self {
            cfg,
            aggregator,
            gate,
            alloc,
            port,
            store,
            day,
            cooldowns,
            heartbeat,
            last_signal: None,
        })
    }

    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.cfg.loop_pace_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        logging::log(
            Level::Info,
            Domain::System,
            "engine_started",
            obj(&[("mode", v_str(self.cfg.mode.as_str()))]),
        );
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    let result = self.cycle(now_ts()).await;
                    self.beat(false);
                    match result {
                        Ok(CycleOutcome::Halted) => {
                            tokio::time::sleep(Duration::from_secs(self.cfg.halt_pause_secs)).await;
                        }
                        Ok(_) => {}
                        Err(err) => {
                            logging::log(
                                Level::Error,
                                Domain::System,
                                "cycle_failed",
                                obj(&[("error", v_str(&format!("{err:#}")))]),
                            );
                            tokio::time::sleep(Duration::from_secs(self.cfg.crash_pause_secs)).await;
                        }
                    }
                }
            }
        }
        logging::log(Level::Info, Domain::System, "engine_stopped", obj(&[]));
    }

    /// Write the liveness heartbeat. Failures are logged, never fatal.
    pub fn beat(&self, test_boot: bool) {
        let record = Heartbeat::record(
            self.cfg.mode.as_str(),
            self.last_signal.clone(),
            true,
            test_boot,
        );
        if let Err(err) = self.heartbeat.write(&record) {
            logging::log(
                Level::Warn,
                Domain::System,
                "heartbeat_failed",
                obj(&[("error", v_str(&format!("{err:#}")))]),
            );
        }
    }

    pub async fn cycle(&mut self, now: i64) -> Result<CycleOutcome> {
        let broker_state = with_retry(EXEC_RETRIES, EXEC_RETRY_BASE_MS, || {
            self.port.portfolio_state()
        })
        .await
        .map_err(anyhow::Error::from)
        .context("portfolio read")?;

        // The engine's daily ledger, not the broker's, feeds the ratchet.
        self.day.observe(
            &self.store,
            broker_state.current_balance,
            broker_state.open_positions.len() as u32,
            now,
        )?;
        let portfolio = PortfolioState {
            daily_start_balance: self.day.start_balance,
            current_balance: self.day.current_balance,
            daily_peak_pnl: self.day.peak_pnl,
            daily_drawdown_pct: if self.day.start_balance > 0.0 {
                (-self.day.daily_pnl() / self.day.start_balance).max(0.0)
            } else {
                0.0
            },
            ..broker_state
        };

        if self.cfg.disable_pool {
            return Ok(CycleOutcome::Idle);
        }

        let decision = self.gate.check_portfolio_state(&portfolio);
        if !decision.approved {
            self.last_signal = Some(format!("halted: {}", decision.reason.code()));
            return Ok(CycleOutcome::Halted);
        }

        for symbol in self.cfg.symbols.clone() {
            if self.cooldowns.active(&symbol, now) {
                continue;
            }
            if self.try_symbol(&symbol, &portfolio, now).await? {
                // One entry per cycle.
                return Ok(CycleOutcome::Placed);
            }
        }
        Ok(CycleOutcome::Idle)
    }

    /// Returns true when an order was placed for this symbol.
    async fn try_symbol(
        &mut self,
        symbol: &str,
        portfolio: &PortfolioState,
        now: i64,
    ) -> Result<bool> {
        let candles = match self
            .port
            .candles(symbol, self.cfg.candle_timeframe, self.cfg.candle_limit)
            .await
        {
            Ok(c) => c,
            Err(err) => {
                // Data faults skip the symbol, never the cycle.
                logging::log(
                    Level::Warn,
                    Domain::Market,
                    "candles_unavailable",
                    obj(&[("symbol", v_str(symbol)), ("error", v_str(&err.to_string()))]),
                );
                return Ok(false);
            }
        };
        let snap = MarketSnapshot::new(symbol, candles);
        let consensus = self.aggregator.get_consensus(&snap);
        if !consensus.direction.is_actionable() {
            return Ok(false);
        }

        let accepted = if snap.is_crypto() {
            consensus.confidence >= self.cfg.pool_crypto_min_confidence
        } else {
            let votes = match consensus.direction {
                Direction::Buy => consensus.counts.buy,
                Direction::Sell => consensus.counts.sell,
                Direction::Hold => 0,
            };
            consensus.confidence >= self.cfg.pool_min_confidence
                || votes >= self.cfg.pool_min_votes
                || consensus.top_score >= self.cfg.pool_min_top_score
        };
        if !accepted {
            logging::log(
                Level::Debug,
                Domain::Consensus,
                "below_threshold",
                obj(&[
                    ("symbol", v_str(symbol)),
                    ("confidence", v_num(consensus.confidence)),
                ]),
            );
            return Ok(false);
        }

        let Some(entry) = snap.close() else { return Ok(false) };
        let Some(atr) = regime::atr(&snap.candles, self.cfg.atr_period) else {
            return Ok(false);
        };
        if atr <= 0.0 {
            return Ok(false);
        }
        let risk = atr * self.cfg.bracket_stop_atr_mult;
        let (stop, target) = match consensus.direction {
            Direction::Buy => (entry - risk, entry + risk * self.cfg.bracket_reward_mult),
            Direction::Sell => (entry + risk, entry - risk * self.cfg.bracket_reward_mult),
            Direction::Hold => return Ok(false),
        };
        let source =
            consensus.top_strategy.clone().unwrap_or_else(|| "consensus".to_string());

        // Live sessions only trade strategies an operator has signed off on.
        if self.cfg.mode == Mode::Live && !self.aggregator.weights().live_approved(&source) {
            logging::log(
                Level::Info,
                Domain::Gate,
                "not_live_approved",
                obj(&[("symbol", v_str(symbol)), ("strategy", v_str(&source))]),
            );
            return Ok(false);
        }

        let add_to_position = portfolio
            .open_positions
            .iter()
            .any(|p| p.symbol == symbol && p.direction == consensus.direction);
        let notional =
            self.alloc.size(self.aggregator.weights(), &source, symbol, portfolio, entry, Some(stop));

        let signal = Signal {
            symbol: symbol.to_string(),
            direction: consensus.direction,
            timeframe: self.cfg.candle_timeframe,
            notional,
            entry,
            stop_loss: Some(stop),
            take_profit: Some(target),
            confidence: consensus.confidence,
            source_strategy: source.clone(),
            contributing_votes: consensus.votes.clone(),
            add_to_position,
        };

        let decision = self.gate.validate_signal(&signal, portfolio);
        if !decision.approved {
            self.last_signal = Some(format!("{symbol} rejected: {}", decision.reason.code()));
            return Ok(false);
        }

        match with_retry(EXEC_RETRIES, EXEC_RETRY_BASE_MS, || self.port.execute_order(&signal))
            .await
        {
            Ok(ack) => {
                self.aggregator.weights().map_order(&ack.trade_id, &source)?;
                self.cooldowns.clear(&self.store, symbol)?;
                self.last_signal = Some(format!(
                    "{symbol} {} @ {:.5}",
                    signal.direction.as_str(),
                    ack.fill_price
                ));
                logging::log(
                    Level::Info,
                    Domain::Exec,
                    "order_filled",
                    obj(&[
                        ("symbol", v_str(symbol)),
                        ("direction", v_str(signal.direction.as_str())),
                        ("trade_id", v_str(&ack.trade_id)),
                        ("units", v_num(ack.filled_units)),
                        ("price", v_num(ack.fill_price)),
                        ("strategy", v_str(&source)),
                    ]),
                );
                Ok(true)
            }
            Err(err) => {
                let secs =
                    self.cooldowns.register_failure(&self.store, symbol, err.class(), now)?;
                logging::log(
                    Level::Warn,
                    Domain::Exec,
                    "order_failed",
                    obj(&[
                        ("symbol", v_str(symbol)),
                        ("class", v_str(class_str(err.class()))),
                        ("error", v_str(&err.to_string())),
                        ("cooldown_secs", v_num(secs as f64)),
                    ]),
                );
                Ok(false)
            }
        }
    }
}

fn class_str(class: ExecErrorClass) -> &'static str {
    match class {
        ExecErrorClass::OrderingViolation => "ordering_violation",
        ExecErrorClass::Rejected => "rejected",
        ExecErrorClass::Transient => "transient",
        ExecErrorClass::Other => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::PaperBroker;
    use crate::signal::Candle;
    use crate::strategies::{Entry, Registry, Squad, StrategyCapability};
    use crate::weights::WeightStore;

    struct Fixed(Direction);
    impl StrategyCapability for Fixed {
        fn vote(&self, _snap: &MarketSnapshot) -> anyhow::Result<Direction> {
            Ok(self.0)
        }
    }

    fn flat_candles(n: usize, close: f64, range: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| Candle {
                ts: i as i64 * 900,
                o: close,
                h: close + range / 2.0,
                l: close - range / 2.0,
                c: close,
                v: 100.0,
            })
            .collect()
    }

    fn aggregator(dir: Direction) -> Arc<ConsensusAggregator> {
        let weights = Arc::new(WeightStore::open_in_memory().unwrap());
        let reg = Registry::new(vec![Entry {
            name: "fixed",
            squad: Squad::Precision,
            strategy: Box::new(Fixed(dir)),
        }]);
        Arc::new(ConsensusAggregator::new(reg, weights))
    }

    fn test_config(dir: &tempfile::TempDir) -> Config {
        let mut cfg = Config::for_tests();
        cfg.symbols = vec!["EUR_USD".to_string()];
        cfg.db_path = dir.path().join("engine.sqlite").to_string_lossy().into_owned();
        cfg.heartbeat_path =
            dir.path().join("system_status.json").to_string_lossy().into_owned();
        cfg
    }

    #[tokio::test]
    async fn full_cycle_places_one_order() {
        let tmp = tempfile::tempdir().unwrap();
        let broker = Arc::new(PaperBroker::new(10_000.0));
        broker.set_candles("EUR_USD", flat_candles(60, 1.0, 0.002));
        let agg = aggregator(Direction::Buy);
        let mut engine =
            Engine::new(test_config(&tmp), agg.clone(), broker.clone()).await.unwrap();

        engine.cycle(1_756_000_000).await.unwrap();
        let state = broker.portfolio_state().await.unwrap();
        assert_eq!(state.open_positions.len(), 1);
        let pos = &state.open_positions[0];
        assert_eq!(pos.direction, Direction::Buy);
        assert!(pos.current_stop.unwrap() < pos.entry_price);
        assert!(pos.current_target.unwrap() > pos.entry_price);
        // The fill is mapped back to its source strategy for settlement.
        assert_eq!(agg.weights().strategy_for_order(&pos.id).as_deref(), Some("fixed"));
    }

    #[tokio::test]
    async fn duplicate_entry_is_gated_on_the_next_cycle() {
        let tmp = tempfile::tempdir().unwrap();
        let broker = Arc::new(PaperBroker::new(10_000.0));
        broker.set_candles("EUR_USD", flat_candles(60, 1.0, 0.002));
        let mut engine =
            Engine::new(test_config(&tmp), aggregator(Direction::Buy), broker.clone())
                .await
                .unwrap();

        engine.cycle(1_756_000_000).await.unwrap();
        engine.cycle(1_756_000_060).await.unwrap();
        let state = broker.portfolio_state().await.unwrap();
        assert_eq!(state.open_positions.len(), 1);
        assert!(engine
            .last_signal
            .as_deref()
            .unwrap()
            .contains("DUPLICATE_POSITION"));
    }

    #[tokio::test]
    async fn hold_consensus_places_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let broker = Arc::new(PaperBroker::new(10_000.0));
        broker.set_candles("EUR_USD", flat_candles(60, 1.0, 0.002));
        let mut engine =
            Engine::new(test_config(&tmp), aggregator(Direction::Hold), broker.clone())
                .await
                .unwrap();
        engine.cycle(1_756_000_000).await.unwrap();
        assert!(broker.portfolio_state().await.unwrap().open_positions.is_empty());
    }

    #[tokio::test]
    async fn missing_candles_skip_symbol_not_cycle() {
        let tmp = tempfile::tempdir().unwrap();
        let broker = Arc::new(PaperBroker::new(10_000.0));
        let mut cfg = test_config(&tmp);
        cfg.symbols = vec!["GBP_USD".to_string(), "EUR_USD".to_string()];
        broker.set_candles("EUR_USD", flat_candles(60, 1.0, 0.002));
        // GBP_USD has no data at all.
        let mut engine =
            Engine::new(cfg, aggregator(Direction::Buy), broker.clone()).await.unwrap();
        engine.cycle(1_756_000_000).await.unwrap();
        let state = broker.portfolio_state().await.unwrap();
        assert_eq!(state.open_positions.len(), 1);
        assert_eq!(state.open_positions[0].symbol, "EUR_USD");
    }

    #[tokio::test]
    async fn disabled_pool_idles_but_still_beats() {
        let tmp = tempfile::tempdir().unwrap();
        let broker = Arc::new(PaperBroker::new(10_000.0));
        broker.set_candles("EUR_USD", flat_candles(60, 1.0, 0.002));
        let mut cfg = test_config(&tmp);
        cfg.disable_pool = true;
        let hb_path = cfg.heartbeat_path.clone();
        let mut engine =
            Engine::new(cfg, aggregator(Direction::Buy), broker.clone()).await.unwrap();
        engine.cycle(1_756_000_000).await.unwrap();
        engine.beat(false);
        assert!(broker.portfolio_state().await.unwrap().open_positions.is_empty());
        assert!(std::path::Path::new(&hb_path).exists());
    }

    #[tokio::test]
    async fn crypto_needs_high_conviction() {
        let tmp = tempfile::tempdir().unwrap();
        let broker = Arc::new(PaperBroker::new(10_000.0));
        broker.set_candles("BTC-USD", flat_candles(60, 50_000.0, 100.0));
        let mut cfg = test_config(&tmp);
        cfg.symbols = vec!["BTC-USD".to_string()];

        // Two voters split the weight: confidence 0.5 misses the 0.85 bar.
        let weights = Arc::new(WeightStore::open_in_memory().unwrap());
        let reg = Registry::new(vec![
            Entry { name: "a", squad: Squad::Precision, strategy: Box::new(Fixed(Direction::Buy)) },
            Entry { name: "b", squad: Squad::Trend, strategy: Box::new(Fixed(Direction::Hold)) },
        ]);
        let agg = Arc::new(ConsensusAggregator::new(reg, weights));
        let mut engine = Engine::new(cfg, agg, broker.clone()).await.unwrap();
        engine.cycle(1_756_000_000).await.unwrap();
        assert!(broker.portfolio_state().await.unwrap().open_positions.is_empty());
    }
}
