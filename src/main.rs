//! Service entry point: construct the process-wide singletons once, inject
//! them into each subsystem, spawn everything, and shut down cooperatively.

use anyhow::{Context, Result};
use arbcore::bus::{
    consumer_groups, streams, BatchingProducer, RedisBackend, StreamBackend, StreamBus,
    StreamConsumer,
};
use arbcore::cache::{GasPriceCache, PairKeyCache, PriceMatrix, RecentPriceStore};
use arbcore::config::load_config;
use arbcore::detector::bridge_cost::StaticBridgeTable;
use arbcore::detector::ml::{CachedPredictor, MlPredictor, NullPredictor};
use arbcore::detector::prevalidation::PreValidator;
use arbcore::detector::price_data::PriceDataManager;
use arbcore::detector::{
    ChainDetector, CrossChainDetector, OpportunityPublisher, StaticTokenPricer, TokenPricer,
};
use arbcore::error::CoreError;
use arbcore::execution::circuit_breaker::{BreakerConfig, CircuitBreakerManager};
use arbcore::execution::mev::{MevProvider, TxSubmitter};
use arbcore::execution::rpc::{AlloyRpc, ChainRpc};
use arbcore::execution::signer::LocalWalletSigner;
use arbcore::execution::simulation::{
    EthCallProvider, SimulationProvider, SimulationRevenueVerifier, SimulationService,
};
use arbcore::execution::strategy::StrategyRouter;
use arbcore::execution::{ExecutionEngine, NonceManager, WalletSigner};
use arbcore::health::{run_health_server, run_heartbeat, HealthState};
use arbcore::ingestion::{
    build_topics, ChainIngestion, StaticValueOracle, SwapEventFilter, WsManager,
};
use arbcore::risk::{DrawdownCircuitBreaker, ExecutionProbabilityTracker};
use arbcore::stats::CoreStats;
use arbcore::types::{now_ms, Chain};
use async_trait::async_trait;
use clap::Parser;
use futures::StreamExt;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Grand shutdown timeout: after this, abandon remaining work.
const SHUTDOWN_GRACE_MS: u64 = 10_000;

#[derive(Parser, Debug)]
#[command(name = "arbcore", about = "Multi-chain DEX arbitrage core")]
struct Args {
    /// Path to the chains/config TOML.
    #[arg(long, env = "ARBCORE_CONFIG", default_value = "chains.toml")]
    config: PathBuf,

    /// Development mode: slower detection cadence, more logging.
    #[arg(long)]
    dev: bool,
}

/// Fee source backed by the shared RPC handles; native USD comes from the
/// per-chain fallback constants (refreshed out of band).
struct RpcFeeSource {
    rpc: Arc<AlloyRpc>,
    native_usd: HashMap<Chain, f64>,
}

#[async_trait]
impl arbcore::cache::gas_price::FeeSource for RpcFeeSource {
    async fn fee_data(&self, chain: Chain) -> Result<(f64, f64), CoreError> {
        let gwei = self.rpc.gas_price_gwei(chain).await?;
        let usd = self.native_usd.get(&chain).copied().unwrap_or(1.0);
        Ok((gwei, usd))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    let args = Args::parse();
    let mut config = load_config(&args.config)?;
    if args.dev {
        config.detector.detection_interval_ms = config.detector.detection_interval_ms.max(200);
    }
    info!(
        "arbcore starting | {} chains | {} partitions | dev={}",
        config.chains.len(),
        config.effective_partitions().len(),
        args.dev
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Bus first: nothing moves without it.
    let backend = RedisBackend::connect(&config.bus.redis_url)
        .await
        .context("event bus backend unreachable")?;
    let bus = StreamBus::new(
        Arc::new(backend) as Arc<dyn StreamBackend>,
        config.bus.retry_budget,
    );
    let producer = Arc::new(BatchingProducer::new(
        bus.clone(),
        config.bus.batch_max,
        config.bus.batch_wait_ms,
        config.bus.dead_letter_cap,
    ));

    // Consumer groups we own; "$" = only new messages.
    for (stream, group) in [
        (streams::OPPORTUNITIES, consumer_groups::EXECUTION_ENGINE),
        (streams::EXECUTION_REQUESTS, consumer_groups::EXECUTION_ENGINE),
        (streams::PENDING_OPPORTUNITIES, consumer_groups::EXECUTION_ENGINE),
        (streams::PRICE_UPDATES, consumer_groups::CROSS_CHAIN_DETECTOR),
        (streams::WHALE_ALERTS, consumer_groups::CROSS_CHAIN_DETECTOR),
    ] {
        bus.create_group(stream, group, "$")
            .await
            .map_err(|e| anyhow::anyhow!("group {}/{}: {}", stream, group, e))?;
    }

    // Process-wide singletons, constructed exactly once and injected.
    let stats = Arc::new(CoreStats::new());
    let matrix = Arc::new(PriceMatrix::with_defaults());
    let recent_prices = Arc::new(RecentPriceStore::with_defaults());
    let key_cache = Arc::new(PairKeyCache::new(4_096));

    let mut gas_fallbacks = HashMap::new();
    let mut native_usd = HashMap::new();
    let mut rpc_urls = HashMap::new();
    let mut token_prices = HashMap::new();
    let mut token_decimals = HashMap::new();
    let mut wallets = HashMap::new();
    let mut executors = HashMap::new();
    for chain_config in &config.chains {
        gas_fallbacks.insert(
            chain_config.chain,
            (
                chain_config.fallback_gas_price_gwei,
                chain_config.fallback_native_usd,
            ),
        );
        native_usd.insert(chain_config.chain, chain_config.fallback_native_usd);
        rpc_urls.insert(chain_config.chain, chain_config.rpc_url.clone());
        for token in &chain_config.tokens {
            token_prices.insert(token.address, token.usd_price);
            token_decimals.insert(token.address, token.decimals);
        }
        if let Some(wallet) = chain_config.wallet_address {
            wallets.insert(chain_config.chain, wallet);
        }
        if let Some(executor) = chain_config.executor_address {
            executors.insert(chain_config.chain, executor);
        }
    }
    let gas = Arc::new(GasPriceCache::new(gas_fallbacks));
    let pricer: Arc<dyn TokenPricer> = Arc::new(StaticTokenPricer::new(token_prices.clone()));
    let oracle = Arc::new(StaticValueOracle::new(token_prices, token_decimals));
    let rpc = Arc::new(AlloyRpc::new(rpc_urls));

    let health = Arc::new(HealthState::new(Arc::clone(&stats)));
    let publisher = Arc::new(OpportunityPublisher::new(
        Arc::clone(&producer),
        config.detector.publish_dedupe_window_ms,
        Arc::clone(&stats),
    ));

    let mut tasks: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    // Health surface.
    {
        let state = Arc::clone(&health);
        let addr = config.health_addr.clone();
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = run_health_server(addr, state, rx).await {
                error!("health server exited: {}", e);
            }
        }));
        tasks.push(tokio::spawn(run_heartbeat(
            "arbcore".to_string(),
            Arc::clone(&health),
            Arc::clone(&producer),
            shutdown_rx.clone(),
        )));
    }

    // Gas refresh loop.
    {
        let source = Arc::new(RpcFeeSource {
            rpc: Arc::clone(&rpc),
            native_usd,
        });
        let chains: Vec<Chain> = config.chains.iter().map(|c| c.chain).collect();
        tasks.push(tokio::spawn(Arc::clone(&gas).run_refresh_loop(
            chains,
            source,
            shutdown_rx.clone(),
        )));
    }

    // Per-chain ingestion + detection.
    for chain_config in &config.chains {
        let chain = chain_config.chain;
        let detector = Arc::new(ChainDetector::new(
            chain_config,
            Arc::clone(&matrix),
            Arc::clone(&recent_prices),
            Arc::clone(&gas),
            Arc::clone(&pricer),
            Arc::clone(&key_cache),
            Arc::clone(&stats),
        ));

        let (event_tx, event_rx) = mpsc::channel(1_024);
        let mut ws = WsManager::new(
            chain,
            chain_config.ws_url.clone(),
            chain_config.fallback_ws_urls.clone(),
            config.ws.clone(),
            build_topics(chain_config),
            event_tx,
        );
        let ws_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            ws.run(ws_shutdown).await;
        }));

        let filter = SwapEventFilter::new(
            chain,
            config.filter.clone(),
            chain_config.whale_threshold_usd,
        );
        let ingestion = ChainIngestion::new(
            chain,
            detector,
            filter,
            Arc::clone(&oracle) as Arc<dyn arbcore::ingestion::ValueOracle>,
            Arc::clone(&producer),
            Arc::clone(&publisher),
            Arc::clone(&stats),
        );
        tasks.push(tokio::spawn(ingestion.run(event_rx, shutdown_rx.clone())));
    }

    // Cross-chain detector.
    {
        let simulation = Arc::new(SimulationService::new(
            vec![Arc::new(EthCallProvider::new(
                Arc::clone(&rpc) as Arc<dyn ChainRpc>
            )) as Arc<dyn SimulationProvider>],
            config.detector.prevalidation.max_latency_ms,
        ));
        let verifier = Arc::new(SimulationRevenueVerifier::new(
            simulation,
            StrategyRouter::standard(config.execution.statistical_arb_enabled),
            wallets.clone(),
            executors.clone(),
        ));
        let detector = Arc::new(CrossChainDetector::new(
            config.detector.clone(),
            Arc::new(PriceDataManager::new(config.detector.retention_cutoff_ms)),
            Arc::new(CachedPredictor::new(
                Arc::new(NullPredictor) as Arc<dyn MlPredictor>,
                config.detector.ml_timeout_ms,
                Arc::clone(&stats),
            )),
            Arc::new(PreValidator::new(
                config.detector.prevalidation.clone(),
                verifier,
                Arc::clone(&stats),
            )),
            Arc::new(StaticBridgeTable::with_defaults()),
            Arc::clone(&publisher),
            Arc::clone(&gas),
            Arc::clone(&pricer),
            Arc::clone(&stats),
        ));
        let price_consumer = StreamConsumer::new(
            bus.clone(),
            streams::PRICE_UPDATES,
            consumer_groups::CROSS_CHAIN_DETECTOR,
            "xchain-1",
        );
        let whale_consumer = StreamConsumer::new(
            bus.clone(),
            streams::WHALE_ALERTS,
            consumer_groups::CROSS_CHAIN_DETECTOR,
            "xchain-1",
        );
        tasks.push(tokio::spawn(detector.run(
            price_consumer,
            whale_consumer,
            shutdown_rx.clone(),
        )));
    }

    // Execution pipeline — only with a signing key.
    match std::env::var("PRIVATE_KEY") {
        Ok(hex_key) => {
            let signer: Arc<dyn WalletSigner> = Arc::new(
                LocalWalletSigner::from_hex(&hex_key)
                    .map_err(|e| anyhow::anyhow!("PRIVATE_KEY: {}", e))?,
            );
            let mev: Arc<dyn TxSubmitter> = Arc::new(MevProvider::new(
                std::env::var("MEV_RELAY_URL").ok(),
                std::env::var("PRIVATE_RELAY_URL").ok(),
                std::env::var("JITO_URL").ok(),
                Arc::clone(&rpc) as Arc<dyn ChainRpc>,
                signer,
            ));
            let (breaker_tx, mut breaker_rx) = mpsc::unbounded_channel();
            let breakers = Arc::new(CircuitBreakerManager::new(
                BreakerConfig {
                    failure_threshold: config.execution.breaker_failure_threshold,
                    cooldown_ms: config.execution.breaker_cooldown_ms,
                    half_open_max_attempts: config.execution.breaker_half_open_max_attempts,
                },
                Some(breaker_tx),
            ));
            // Forward breaker transitions onto the bus.
            {
                let producer = Arc::clone(&producer);
                tasks.push(tokio::spawn(async move {
                    while let Some(transition) = breaker_rx.recv().await {
                        let fields = arbcore::bus::encode_payload(
                            &transition,
                            &[("chain", transition.chain.to_string())],
                        );
                        if !producer.publish(streams::CIRCUIT_BREAKER, fields).await {
                            return;
                        }
                    }
                }));
            }

            let nonce = Arc::new(NonceManager::new(
                config.nonce.clone(),
                Arc::clone(&rpc) as Arc<dyn ChainRpc>,
            ));
            for (chain, wallet) in &wallets {
                if let Err(e) = nonce.prefill(*chain, *wallet, now_ms()).await {
                    warn!("nonce prefill for {} failed: {}", chain, e);
                }
            }
            tasks.push(tokio::spawn(
                Arc::clone(&nonce).run_sweeper(shutdown_rx.clone()),
            ));

            let simulation = Arc::new(SimulationService::new(
                vec![Arc::new(EthCallProvider::new(
                    Arc::clone(&rpc) as Arc<dyn ChainRpc>
                )) as Arc<dyn SimulationProvider>],
                config.execution.simulation_max_latency_ms,
            ));
            let engine = Arc::new(ExecutionEngine::new(
                config.execution.clone(),
                config.risk.clone(),
                breakers,
                Arc::new(DrawdownCircuitBreaker::new(&config.risk, now_ms())),
                Arc::new(ExecutionProbabilityTracker::new()),
                simulation,
                Arc::clone(&gas),
                nonce,
                mev,
                wallets.clone(),
                executors.clone(),
                Arc::clone(&stats),
            ));
            // Detector output, coordinator dispatch, and the optional
            // mempool watcher all feed the same pipeline.
            for stream in [
                streams::OPPORTUNITIES,
                streams::EXECUTION_REQUESTS,
                streams::PENDING_OPPORTUNITIES,
            ] {
                let consumer = Arc::new(StreamConsumer::new(
                    bus.clone(),
                    stream,
                    consumer_groups::EXECUTION_ENGINE,
                    "engine-1",
                ));
                tasks.push(tokio::spawn(
                    Arc::clone(&engine).run(consumer, shutdown_rx.clone()),
                ));
            }
        }
        Err(_) => {
            warn!("PRIVATE_KEY not set — running detection-only, execution disabled");
        }
    }

    health.mark_started();
    // The first completed heartbeat cycle flips us out of `starting`.
    {
        let health = Arc::clone(&health);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            health.mark_cycle();
        });
    }
    info!("arbcore running");

    // Cooperative shutdown on SIGINT/SIGTERM.
    let mut signals = Signals::new([SIGINT, SIGTERM]).context("signal handler")?;
    signals.next().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let drain = futures::future::join_all(tasks);
    if tokio::time::timeout(Duration::from_millis(SHUTDOWN_GRACE_MS), drain)
        .await
        .is_err()
    {
        warn!("shutdown grace period elapsed — abandoning remaining tasks");
    }
    producer.stop().await;
    info!("arbcore stopped");
    Ok(())
}
