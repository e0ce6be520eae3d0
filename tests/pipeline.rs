//! End-to-end exercises of the consensus -> gate -> execution -> supervisor
//! pipeline against the in-memory broker.

use quorumfx::config::Config;
use quorumfx::consensus::ConsensusAggregator;
use quorumfx::engine::Engine;
use quorumfx::execution::{ExecutionPort, PaperBroker};
use quorumfx::gate::PolicyGate;
use quorumfx::signal::{
    Candle, Direction, GateReason, MarketSnapshot, PortfolioState, Signal, StrategyStatus,
    Timeframe,
};
use quorumfx::strategies::{Entry, Registry, Squad, StrategyCapability};
use quorumfx::supervisor::Supervisor;
use quorumfx::weights::WeightStore;
use std::sync::Arc;

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

fn test_config(tmp: &tempfile::TempDir) -> Config {
    let mut cfg = Config::for_tests();
    cfg.symbols = vec!["EUR_USD".to_string()];
    cfg.db_path = tmp.path().join("pipeline.sqlite").to_string_lossy().into_owned();
    cfg.heartbeat_path = tmp.path().join("system_status.json").to_string_lossy().into_owned();
    cfg
}

fn portfolio(start: f64, current: f64, peak: f64) -> PortfolioState {
    PortfolioState {
        daily_start_balance: start,
        current_balance: current,
        daily_peak_pnl: peak,
        margin_used_pct: 0.1,
        open_positions: vec![],
        daily_drawdown_pct: 0.0,
        nav: current,
        unrealized_pnl: 0.0,
    }
}

// Peak of 450 arms the ratchet lock at 360. Giving back to exactly 360
// halts new entries; holding at 450 does not.
#[test]
fn profit_ratchet_halts_after_giveback() {
    let gate = PolicyGate::new(Config::for_tests());

    let given_back = portfolio(10_000.0, 10_360.0, 450.0);
    let d = gate.check_portfolio_state(&given_back);
    assert!(!d.approved);
    assert_eq!(d.reason, GateReason::DailyProfitProtectionTriggered);

    let holding = portfolio(10_000.0, 10_450.0, 450.0);
    assert!(gate.check_portfolio_state(&holding).approved);
}

// A 5% stop distance on a 10k account allows 4k notional at 2% risk;
// a 10k order is over the line no matter how good the setup looks.
#[test]
fn risk_cap_rejects_oversized_notional() {
    let gate = PolicyGate::new(Config::for_tests());
    let signal = Signal {
        symbol: "EUR_USD".to_string(),
        direction: Direction::Buy,
        timeframe: Timeframe::M15,
        notional: 10_000.0,
        entry: 100.0,
        stop_loss: Some(95.0),
        take_profit: Some(160.0),
        confidence: 0.9,
        source_strategy: "momentum".to_string(),
        contributing_votes: vec![],
        add_to_position: false,
    };
    let d = gate.validate_signal(&signal, &portfolio(10_000.0, 10_000.0, 0.0));
    assert_eq!(d.reason, GateReason::NotionalExceedsRiskLimit);
}

// A precision squad member may act alone; a lone trend vote may not.
#[tokio::test]
async fn sniper_trades_where_lone_trend_cannot() {
    let tmp = tempfile::tempdir().unwrap();

    // Precision sniper alone: order placed.
    let broker = Arc::new(PaperBroker::new(10_000.0));
    broker.set_candles("EUR_USD", flat_candles(60, 1.0, 0.002));
    let weights = Arc::new(WeightStore::open_in_memory().unwrap());
    let reg = Registry::new(vec![Entry {
        name: "sniper",
        squad: Squad::Precision,
        strategy: Box::new(Fixed(Direction::Buy)),
    }]);
    let agg = Arc::new(ConsensusAggregator::new(reg, weights));
    let mut engine = Engine::new(test_config(&tmp), agg, broker.clone()).await.unwrap();
    engine.cycle(1_756_000_000).await.unwrap();
    assert_eq!(broker.portfolio_state().await.unwrap().open_positions.len(), 1);

    // Lone trend vote: filtered by synergy, nothing placed.
    let tmp2 = tempfile::tempdir().unwrap();
    let broker2 = Arc::new(PaperBroker::new(10_000.0));
    broker2.set_candles("EUR_USD", flat_candles(60, 1.0, 0.002));
    let weights2 = Arc::new(WeightStore::open_in_memory().unwrap());
    let reg2 = Registry::new(vec![
        Entry { name: "trendy", squad: Squad::Trend, strategy: Box::new(Fixed(Direction::Buy)) },
        Entry { name: "quiet", squad: Squad::Reversion, strategy: Box::new(Fixed(Direction::Hold)) },
    ]);
    let agg2 = Arc::new(ConsensusAggregator::new(reg2, weights2));
    let mut engine2 = Engine::new(test_config(&tmp2), agg2, broker2.clone()).await.unwrap();
    engine2.cycle(1_756_000_000).await.unwrap();
    assert!(broker2.portfolio_state().await.unwrap().open_positions.is_empty());
}

// Entry, forced loss, supervisor settlement, quarantine: three losing round
// trips silence a strategy's vote.
#[tokio::test]
async fn losing_streak_quarantines_the_strategy() {
    let tmp = tempfile::tempdir().unwrap();
    let broker = Arc::new(PaperBroker::new(100_000.0));
    broker.set_candles("EUR_USD", flat_candles(60, 1.0, 0.002));

    let weights = Arc::new(WeightStore::open(tmp.path().join("w.sqlite")).unwrap());
    let make_agg = |w: &Arc<WeightStore>| {
        Arc::new(ConsensusAggregator::new(
            Registry::new(vec![Entry {
                name: "sniper",
                squad: Squad::Precision,
                strategy: Box::new(Fixed(Direction::Buy)),
            }]),
            w.clone(),
        ))
    };
    let agg = make_agg(&weights);
    let mut cfg = test_config(&tmp);
    cfg.max_red_hold_hours = 0.0; // cut losers immediately for the test
    let mut engine = Engine::new(cfg.clone(), agg.clone(), broker.clone()).await.unwrap();
    let mut supervisor =
        Supervisor::new(cfg, broker.clone() as Arc<dyn ExecutionPort>, agg.clone());

    // Position timestamps come from the wall clock, so the scenario clock
    // starts there too.
    let mut now = quorumfx::signal::now_ts();
    for _ in 0..3 {
        engine.cycle(now).await.unwrap();
        assert_eq!(broker.portfolio_state().await.unwrap().open_positions.len(), 1);
        // Mark the trade down and let the supervisor cut it.
        broker.set_price("EUR_USD", 0.999);
        supervisor.scan_once(now + 3600).await.unwrap();
        assert!(broker.portfolio_state().await.unwrap().open_positions.is_empty());
        broker.set_candles("EUR_USD", flat_candles(60, 1.0, 0.002));
        now += 86_400; // fresh day, fresh ledger, same weights
    }

    let rec = weights.record("sniper").unwrap();
    assert_eq!(rec.consecutive_losses, 3);
    // Outcomes are stamped with the wall clock, so the status check uses it too.
    assert_eq!(weights.status("sniper"), StrategyStatus::Quarantined);

    // The quarantined voter is benched: no further entries.
    engine.cycle(now).await.unwrap();
    assert!(broker.portfolio_state().await.unwrap().open_positions.is_empty());
}

// A restart resumes weights and order mappings from disk.
#[tokio::test]
async fn weights_survive_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let db = tmp.path().join("weights.sqlite");
    {
        let weights = WeightStore::open(&db).unwrap();
        weights.record_outcome_at("sniper", -25.0, 1_000).unwrap();
        weights.record_outcome_at("sniper", 75.0, 2_000).unwrap();
        weights.map_order("t-held", "sniper").unwrap();
    }
    let weights = WeightStore::open(&db).unwrap();
    let rec = weights.record("sniper").unwrap();
    assert_eq!(rec.cumulative_pnl, 50.0);
    assert_eq!(rec.wins, 1);
    assert_eq!(rec.consecutive_losses, 0);
    assert!(weights.weight("sniper") > 1.0);
    assert_eq!(weights.strategy_for_order("t-held").as_deref(), Some("sniper"));
}
