use anyhow::{Context, Result};
use std::{env, net::SocketAddr, sync::Arc};
use subnet_validator::{
    api, AssignmentLedger, CachingSlotOracle, ChainSlotOracle, CycleCoordinator, CycleScoreStore,
    PayloadQualityScorer, ResultCollector, ScoreAggregator, TaskDispatcher, ValidatorConfig,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    // Initialize tracing subscriber for logging
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let config = match env::var("VALIDATOR_CONFIG") {
        Ok(path) => ValidatorConfig::from_file(&path)
            .with_context(|| format!("Loading validator config from {}", path))?,
        Err(_) => {
            let mut config = ValidatorConfig::default();
            if let Ok(rpc_url) = env::var("RPC_URL") {
                config.rpc_url = rpc_url;
            }
            config.validate().context("Validating default config")?;
            config
        }
    };

    info!(
        "Starting subnet validator: rpc={} batch_size={} policy={}",
        config.rpc_url, config.batch_size, config.aggregation_policy
    );

    let api_addr: SocketAddr = config
        .api_bind_addr
        .parse()
        .with_context(|| format!("Parsing api_bind_addr {}", config.api_bind_addr))?;

    let oracle = Arc::new(CachingSlotOracle::new(
        ChainSlotOracle::new(&config.rpc_url, config.rpc_timeout())
            .context("Creating slot oracle")?,
        config.slot_duration(),
    ));

    let registry = Arc::new(subnet_validator::MinerRegistry::new());
    let ledger = Arc::new(AssignmentLedger::new());
    let client = Arc::new(
        subnet_validator::HttpMinerClient::new(config.send_timeout())
            .context("Creating miner client")?,
    );
    let dispatcher = Arc::new(TaskDispatcher::new(
        registry.clone(),
        client,
        ledger.clone(),
        config.batch_size,
        config.eligibility.clone(),
    ));
    let collector = Arc::new(ResultCollector::new(ledger.clone(), registry.clone()));
    let aggregator = Arc::new(ScoreAggregator::new(
        config.aggregation_policy,
        Arc::new(PayloadQualityScorer::new(config.scoring.clone())),
    ));
    let store = Arc::new(CycleScoreStore::new());

    let coordinator = Arc::new(CycleCoordinator::new(
        config,
        oracle,
        registry,
        dispatcher,
        collector.clone(),
        aggregator,
        ledger,
        store,
    ));

    let cancel = CancellationToken::new();
    let api_server = {
        let coordinator = coordinator.clone();
        let cancel = cancel.clone();
        tokio::spawn(
            async move { api::start_server(api_addr, collector, coordinator, cancel).await },
        )
    };
    let runner = {
        let coordinator = coordinator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { coordinator.run(cancel).await })
    };

    signal::ctrl_c().await.context("Waiting for shutdown signal")?;
    warn!("Shutdown signal received, finishing in-flight slot phase");
    cancel.cancel();
    runner.await.context("Coordinator task failed")?;
    api_server.await.context("API server task failed")??;

    Ok(())
}
