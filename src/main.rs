use anyhow::Result;
use clap::Parser;
use quorumfx::config::{Config, Mode};
use quorumfx::consensus::ConsensusAggregator;
use quorumfx::engine::Engine;
use quorumfx::execution::{ExecutionPort, PaperBroker};
use quorumfx::logging::{self, obj, v_bool, v_str, Domain, Level};
use quorumfx::strategies::Registry;
use quorumfx::supervisor::Supervisor;
use quorumfx::weights::WeightStore;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Parser)]
#[command(name = "quorumfx", about = "Multi-strategy consensus trading engine")]
struct Args {
    /// Trade against the live endpoint regardless of MODE.
    #[arg(long)]
    force_live: bool,
    /// Validate configuration and persistence, write one heartbeat, exit.
    #[arg(long)]
    test_boot: bool,
    /// Disable the strategy pool; the supervisor still manages open trades.
    #[arg(long)]
    no_pool: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut cfg = Config::from_env();
    if args.force_live {
        cfg.mode = Mode::Live;
    }
    cfg.disable_pool = args.no_pool;
    cfg.validate()?;

    logging::log(
        Level::Info,
        Domain::System,
        "boot",
        obj(&[
            ("mode", v_str(cfg.mode.as_str())),
            ("symbols", v_str(&cfg.symbols.join(","))),
            ("db_path", v_str(&cfg.db_path)),
            ("pool_enabled", v_bool(!cfg.disable_pool)),
        ]),
    );

    let weights = Arc::new(WeightStore::open(&cfg.db_path)?);
    let mut registry = Registry::standard(&cfg);
    registry.apply_params(&weights);
    let aggregator = Arc::new(ConsensusAggregator::new(registry, weights));

    // Live connectors attach behind the same port; the built-in backend
    // fills at mark.
    let port: Arc<dyn ExecutionPort> = Arc::new(PaperBroker::new(cfg.paper_starting_balance));

    let mut engine = Engine::new(cfg.clone(), aggregator.clone(), port.clone()).await?;

    if args.test_boot {
        engine.beat(true);
        logging::log(Level::Info, Domain::System, "test_boot_ok", obj(&[]));
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = Supervisor::new(cfg.clone(), port.clone(), aggregator.clone());
    let supervisor_handle = tokio::spawn(supervisor.run(shutdown_rx.clone()));

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            logging::log(Level::Info, Domain::System, "shutdown_requested", obj(&[]));
            let _ = shutdown_tx.send(true);
        }
    });

    engine.run(shutdown_rx).await;
    let _ = supervisor_handle.await;
    logging::log(Level::Info, Domain::System, "shutdown_complete", obj(&[]));
    Ok(())
}
