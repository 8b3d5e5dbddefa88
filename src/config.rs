//! Configuration management.
//!
//! Scalar settings and secrets come from the environment (.env supported);
//! the structured per-chain table (endpoints, factories, thresholds) comes
//! from a TOML file. Env always wins over TOML for the values it names.

use crate::types::{Chain, DexName};
use alloy::primitives::Address;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

/// One DEX deployment on a chain: the factory we subscribe to and the router
/// strategies swap through.
#[derive(Debug, Clone, Deserialize)]
pub struct DexDeployment {
    pub dex: DexName,
    pub factory: Address,
    pub router: Address,
}

/// A token the oracle can price: stables and majors, refreshed out of band.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenInfo {
    pub address: Address,
    pub usd_price: f64,
    #[serde(default = "default_token_decimals")]
    pub decimals: u8,
}

fn default_token_decimals() -> u8 {
    18
}

/// Per-chain configuration block (one `[[chains]]` entry in the TOML table).
#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain: Chain,
    /// Primary WS endpoint.
    pub ws_url: String,
    /// Ordered fallback WS endpoints (2-4 recommended).
    #[serde(default)]
    pub fallback_ws_urls: Vec<String>,
    /// HTTP RPC endpoint for calls outside the subscription path.
    pub rpc_url: String,
    #[serde(default)]
    pub dexes: Vec<DexDeployment>,
    /// Priceable tokens for USD gates and sizing on this chain.
    #[serde(default)]
    pub tokens: Vec<TokenInfo>,
    /// Wallet used for execution on this chain.
    pub wallet_address: Option<Address>,
    /// Deployed arbitrage executor contract; execution is disabled on this
    /// chain without one.
    #[serde(default)]
    pub executor_address: Option<Address>,
    #[serde(default = "default_min_profit_usd")]
    pub min_profit_usd: f64,
    #[serde(default = "default_min_profit_pct")]
    pub min_profit_pct: f64,
    #[serde(default = "default_whale_threshold_usd")]
    pub whale_threshold_usd: f64,
    /// Base confidence assigned to same-chain opportunities.
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Opportunity lifetime.
    #[serde(default = "default_expiry_ms")]
    pub expiry_ms: u64,
    /// Gas units for the standard two-leg trade on this chain.
    #[serde(default = "default_gas_estimate_units")]
    pub gas_estimate_units: u64,
    /// Fallback gas price when the fee query fails.
    #[serde(default = "default_fallback_gas_gwei")]
    pub fallback_gas_price_gwei: f64,
    /// Fallback native-token USD price.
    #[serde(default = "default_fallback_native_usd")]
    pub fallback_native_usd: f64,
}

fn default_min_profit_usd() -> f64 {
    5.0
}
fn default_min_profit_pct() -> f64 {
    0.1
}
fn default_whale_threshold_usd() -> f64 {
    50_000.0
}
fn default_confidence() -> f64 {
    0.7
}
fn default_expiry_ms() -> u64 {
    10_000
}
fn default_gas_estimate_units() -> u64 {
    200_000
}
fn default_fallback_gas_gwei() -> f64 {
    30.0
}
fn default_fallback_native_usd() -> f64 {
    1.0
}

/// WS reconnection policy, shared across chains.
#[derive(Debug, Clone, Deserialize)]
pub struct WsConfig {
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Jitter fraction: delay is scaled by (1 + U(0, jitter)).
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,
}

fn default_reconnect_base_ms() -> u64 {
    500
}
fn default_reconnect_max_ms() -> u64 {
    30_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_jitter_fraction() -> f64 {
    0.25
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_fraction: default_jitter_fraction(),
        }
    }
}

/// Event bus settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Producer batch: flush at N entries or T milliseconds, whichever first.
    #[serde(default = "default_batch_max")]
    pub batch_max: usize,
    #[serde(default = "default_batch_wait_ms")]
    pub batch_wait_ms: u64,
    /// Retry budget for transient backend errors.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    /// Dead-letter list capacity (oldest entries dropped beyond this).
    #[serde(default = "default_dead_letter_cap")]
    pub dead_letter_cap: usize,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_batch_max() -> usize {
    64
}
fn default_batch_wait_ms() -> u64 {
    5
}
fn default_retry_budget() -> u32 {
    3
}
fn default_dead_letter_cap() -> usize {
    1_000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            batch_max: default_batch_max(),
            batch_wait_ms: default_batch_wait_ms(),
            retry_budget: default_retry_budget(),
            dead_letter_cap: default_dead_letter_cap(),
        }
    }
}

/// Swap-event filter thresholds (sized to cut ~93% of swap volume).
#[derive(Debug, Clone, Deserialize)]
pub struct FilterConfig {
    #[serde(default = "default_min_amount_usd")]
    pub min_amount_usd: f64,
    /// Probability a below-threshold swap is sampled through anyway.
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: f64,
    /// Rolling volume aggregation window.
    #[serde(default = "default_aggregation_window_ms")]
    pub aggregation_window_ms: u64,
    /// MEV-pattern publish cadence.
    #[serde(default = "default_mev_publish_cadence_ms")]
    pub mev_publish_cadence_ms: u64,
    /// Duplicate short-circuit window.
    #[serde(default = "default_dedupe_window_ms")]
    pub dedupe_window_ms: u64,
}

fn default_min_amount_usd() -> f64 {
    10_000.0
}
fn default_sampling_rate() -> f64 {
    0.01
}
fn default_aggregation_window_ms() -> u64 {
    5_000
}
fn default_mev_publish_cadence_ms() -> u64 {
    30_000
}
fn default_dedupe_window_ms() -> u64 {
    3_000
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_amount_usd: default_min_amount_usd(),
            sampling_rate: default_sampling_rate(),
            aggregation_window_ms: default_aggregation_window_ms(),
            mev_publish_cadence_ms: default_mev_publish_cadence_ms(),
            dedupe_window_ms: default_dedupe_window_ms(),
        }
    }
}

/// Cross-chain detector settings. The two staleness cutoffs are deliberately
/// distinct fields: `detection_stale_cutoff_ms` hard-rejects points at scan
/// time, `retention_cutoff_ms` bounds what the price map keeps in memory.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_detection_interval_ms")]
    pub detection_interval_ms: u64,
    #[serde(default = "default_detection_stale_cutoff_ms")]
    pub detection_stale_cutoff_ms: u64,
    #[serde(default = "default_retention_cutoff_ms")]
    pub retention_cutoff_ms: u64,
    #[serde(default = "default_ml_timeout_ms")]
    pub ml_timeout_ms: u64,
    #[serde(default = "default_min_cross_chain_profit_pct")]
    pub min_cross_chain_profit_pct: f64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Fingerprint dedupe window in the opportunity publisher.
    #[serde(default = "default_publish_dedupe_window_ms")]
    pub publish_dedupe_window_ms: u64,
    #[serde(default)]
    pub prevalidation: PreValidationConfig,
}

fn default_detection_interval_ms() -> u64 {
    100
}
fn default_detection_stale_cutoff_ms() -> u64 {
    30_000
}
fn default_retention_cutoff_ms() -> u64 {
    300_000
}
fn default_ml_timeout_ms() -> u64 {
    50
}
fn default_min_cross_chain_profit_pct() -> f64 {
    0.5
}
fn default_min_confidence() -> f64 {
    0.5
}
fn default_publish_dedupe_window_ms() -> u64 {
    5_000
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            detection_interval_ms: default_detection_interval_ms(),
            detection_stale_cutoff_ms: default_detection_stale_cutoff_ms(),
            retention_cutoff_ms: default_retention_cutoff_ms(),
            ml_timeout_ms: default_ml_timeout_ms(),
            min_cross_chain_profit_pct: default_min_cross_chain_profit_pct(),
            min_confidence: default_min_confidence(),
            publish_dedupe_window_ms: default_publish_dedupe_window_ms(),
            prevalidation: PreValidationConfig::default(),
        }
    }
}

/// Detection-time pre-validation (sampled simulation). Fail-open by contract.
#[derive(Debug, Clone, Deserialize)]
pub struct PreValidationConfig {
    #[serde(default = "default_prevalidation_sample_rate")]
    pub sample_rate: f64,
    #[serde(default = "default_prevalidation_value_floor_usd")]
    pub value_floor_usd: f64,
    #[serde(default = "default_prevalidation_max_latency_ms")]
    pub max_latency_ms: u64,
    /// Simulations per calendar month before pre-validation disables itself.
    #[serde(default = "default_prevalidation_monthly_budget")]
    pub monthly_budget: u64,
}

fn default_prevalidation_sample_rate() -> f64 {
    0.1
}
fn default_prevalidation_value_floor_usd() -> f64 {
    50.0
}
fn default_prevalidation_max_latency_ms() -> u64 {
    100
}
fn default_prevalidation_monthly_budget() -> u64 {
    10_000
}

impl Default for PreValidationConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_prevalidation_sample_rate(),
            value_floor_usd: default_prevalidation_value_floor_usd(),
            max_latency_ms: default_prevalidation_max_latency_ms(),
            monthly_budget: default_prevalidation_monthly_budget(),
        }
    }
}

/// Risk parameters for the execution pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Total capital committed to the strategy, in USD.
    #[serde(default = "default_total_capital_usd")]
    pub total_capital_usd: f64,
    /// |daily loss| / capital that moves NORMAL → CAUTION.
    #[serde(default = "default_caution_drawdown")]
    pub caution_drawdown: f64,
    /// |daily loss| / capital that moves CAUTION → HALT.
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: f64,
    #[serde(default = "default_consecutive_loss_halt")]
    pub consecutive_loss_halt: u32,
    #[serde(default = "default_halt_cooldown_ms")]
    pub halt_cooldown_ms: u64,
    #[serde(default = "default_recovery_wins_required")]
    pub recovery_wins_required: u32,
    /// Minimum expected value per trade, USD (≈ 0.005 ETH at reference price).
    #[serde(default = "default_min_ev_usd")]
    pub min_ev_usd: f64,
    #[serde(default = "default_min_win_probability")]
    pub min_win_probability: f64,
    #[serde(default = "default_kelly_multiplier")]
    pub kelly_multiplier: f64,
    #[serde(default = "default_max_single_trade_fraction")]
    pub max_single_trade_fraction: f64,
    #[serde(default = "default_min_trade_fraction")]
    pub min_trade_fraction: f64,
}

fn default_total_capital_usd() -> f64 {
    10_000.0
}
fn default_caution_drawdown() -> f64 {
    0.03
}
fn default_max_daily_loss() -> f64 {
    0.05
}
fn default_consecutive_loss_halt() -> u32 {
    5
}
fn default_halt_cooldown_ms() -> u64 {
    3_600_000
}
fn default_recovery_wins_required() -> u32 {
    3
}
fn default_min_ev_usd() -> f64 {
    15.0
}
// Below the tracker's uninformative default (0.5) so untracked keys can
// bootstrap; raise it once a key has history worth trusting.
fn default_min_win_probability() -> f64 {
    0.45
}
fn default_kelly_multiplier() -> f64 {
    0.5
}
fn default_max_single_trade_fraction() -> f64 {
    0.02
}
fn default_min_trade_fraction() -> f64 {
    0.001
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            total_capital_usd: default_total_capital_usd(),
            caution_drawdown: default_caution_drawdown(),
            max_daily_loss: default_max_daily_loss(),
            consecutive_loss_halt: default_consecutive_loss_halt(),
            halt_cooldown_ms: default_halt_cooldown_ms(),
            recovery_wins_required: default_recovery_wins_required(),
            min_ev_usd: default_min_ev_usd(),
            min_win_probability: default_min_win_probability(),
            kelly_multiplier: default_kelly_multiplier(),
            max_single_trade_fraction: default_max_single_trade_fraction(),
            min_trade_fraction: default_min_trade_fraction(),
        }
    }
}

/// Nonce pre-allocation pool.
#[derive(Debug, Clone, Deserialize)]
pub struct NonceConfig {
    /// 0 disables the pool entirely (pre-pool behavior: lock + sync + bump).
    #[serde(default = "default_nonce_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_nonce_replenish_threshold")]
    pub replenish_threshold: usize,
    #[serde(default = "default_nonce_sync_interval_ms")]
    pub sync_interval_ms: u64,
    #[serde(default = "default_nonce_pending_timeout_ms")]
    pub pending_timeout_ms: u64,
}

fn default_nonce_pool_size() -> usize {
    5
}
fn default_nonce_replenish_threshold() -> usize {
    2
}
fn default_nonce_sync_interval_ms() -> u64 {
    30_000
}
fn default_nonce_pending_timeout_ms() -> u64 {
    300_000
}

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            pool_size: default_nonce_pool_size(),
            replenish_threshold: default_nonce_replenish_threshold(),
            sync_interval_ms: default_nonce_sync_interval_ms(),
            pending_timeout_ms: default_nonce_pending_timeout_ms(),
        }
    }
}

/// Execution engine settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Work-queue depth that pauses the stream consumer.
    #[serde(default = "default_high_watermark")]
    pub high_watermark: usize,
    /// Depth at which the paused consumer resumes.
    #[serde(default = "default_low_watermark")]
    pub low_watermark: usize,
    /// Opportunities below this skip pre-flight simulation.
    #[serde(default = "default_simulate_threshold_usd")]
    pub simulate_threshold_usd: f64,
    #[serde(default = "default_simulation_max_latency_ms")]
    pub simulation_max_latency_ms: u64,
    /// Circuit breaker: consecutive failures before OPEN.
    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,
    #[serde(default = "default_breaker_cooldown_ms")]
    pub breaker_cooldown_ms: u64,
    #[serde(default = "default_breaker_half_open_max")]
    pub breaker_half_open_max_attempts: u32,
    /// Route cooldown after a failed route, in blocks (0 = disabled).
    #[serde(default = "default_route_cooldown_blocks")]
    pub route_cooldown_blocks: u64,
    #[serde(default)]
    pub statistical_arb_enabled: bool,
    #[serde(default)]
    pub batched_quoter_enabled: bool,
}

fn default_high_watermark() -> usize {
    800
}
fn default_low_watermark() -> usize {
    200
}
fn default_simulate_threshold_usd() -> f64 {
    50.0
}
fn default_simulation_max_latency_ms() -> u64 {
    500
}
fn default_breaker_failure_threshold() -> u32 {
    5
}
fn default_breaker_cooldown_ms() -> u64 {
    300_000
}
fn default_breaker_half_open_max() -> u32 {
    1
}
fn default_route_cooldown_blocks() -> u64 {
    10
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            high_watermark: default_high_watermark(),
            low_watermark: default_low_watermark(),
            simulate_threshold_usd: default_simulate_threshold_usd(),
            simulation_max_latency_ms: default_simulation_max_latency_ms(),
            breaker_failure_threshold: default_breaker_failure_threshold(),
            breaker_cooldown_ms: default_breaker_cooldown_ms(),
            breaker_half_open_max_attempts: default_breaker_half_open_max(),
            route_cooldown_blocks: default_route_cooldown_blocks(),
            statistical_arb_enabled: false,
            batched_quoter_enabled: false,
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub chains: Vec<ChainConfig>,
    /// Chain partitions: each inner list is handled by one detector instance.
    /// Empty means one partition per chain.
    #[serde(default)]
    pub partitions: Vec<Vec<Chain>>,
    #[serde(default)]
    pub ws: WsConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub nonce: NonceConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Health endpoint bind address.
    #[serde(default = "default_health_addr")]
    pub health_addr: String,
}

fn default_health_addr() -> String {
    "127.0.0.1:8080".to_string()
}

impl AppConfig {
    pub fn chain(&self, chain: Chain) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.chain == chain)
    }

    /// Effective partitions: configured ones, or one partition per chain.
    pub fn effective_partitions(&self) -> Vec<Vec<Chain>> {
        if !self.partitions.is_empty() {
            return self.partitions.clone();
        }
        self.chains.iter().map(|c| vec![c.chain]).collect()
    }

    /// Sanity checks that must hold before anything spawns.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.chains.is_empty(), "no chains configured");
        anyhow::ensure!(
            self.execution.low_watermark < self.execution.high_watermark,
            "low watermark must be below high watermark"
        );
        anyhow::ensure!(
            self.nonce.replenish_threshold <= self.nonce.pool_size,
            "nonce replenish threshold exceeds pool size"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.detector.prevalidation.sample_rate),
            "pre-validation sample rate must be in [0, 1]"
        );
        for c in &self.chains {
            anyhow::ensure!(
                !c.ws_url.is_empty(),
                "chain {} has no WS endpoint",
                c.chain
            );
        }
        let mut seen = HashMap::new();
        for c in &self.chains {
            anyhow::ensure!(
                seen.insert(c.chain, ()).is_none(),
                "chain {} configured twice",
                c.chain
            );
        }
        Ok(())
    }
}

/// Load configuration: TOML file first, then env overrides.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    dotenv::dotenv().ok();

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let mut config: AppConfig =
        toml::from_str(&raw).with_context(|| format!("invalid config in {}", path.display()))?;

    apply_env_overrides(&mut config)?;
    config.validate()?;
    Ok(config)
}

/// Env overrides for the knobs operators actually turn at runtime.
fn apply_env_overrides(config: &mut AppConfig) -> Result<()> {
    if let Ok(v) = std::env::var("REDIS_URL") {
        config.bus.redis_url = v;
    }
    if let Ok(v) = std::env::var("TOTAL_CAPITAL_USD") {
        config.risk.total_capital_usd = v.parse().context("TOTAL_CAPITAL_USD")?;
    }
    if let Ok(v) = std::env::var("MAX_DAILY_LOSS") {
        config.risk.max_daily_loss = v.parse().context("MAX_DAILY_LOSS")?;
    }
    if let Ok(v) = std::env::var("MIN_EV_USD") {
        config.risk.min_ev_usd = v.parse().context("MIN_EV_USD")?;
    }
    if let Ok(v) = std::env::var("KELLY_MULTIPLIER") {
        config.risk.kelly_multiplier = v.parse().context("KELLY_MULTIPLIER")?;
    }
    if let Ok(v) = std::env::var("MAX_SINGLE_TRADE_FRACTION") {
        config.risk.max_single_trade_fraction =
            v.parse().context("MAX_SINGLE_TRADE_FRACTION")?;
    }
    if let Ok(v) = std::env::var("NONCE_POOL_SIZE") {
        config.nonce.pool_size = v.parse().context("NONCE_POOL_SIZE")?;
    }
    if let Ok(v) = std::env::var("NONCE_POOL_REPLENISH_THRESHOLD") {
        config.nonce.replenish_threshold =
            v.parse().context("NONCE_POOL_REPLENISH_THRESHOLD")?;
    }
    if let Ok(v) = std::env::var("STATISTICAL_ARB_ENABLED") {
        config.execution.statistical_arb_enabled = parse_bool(&v)?;
    }
    if let Ok(v) = std::env::var("BATCHED_QUOTER_ENABLED") {
        config.execution.batched_quoter_enabled = parse_bool(&v)?;
    }
    if let Ok(v) = std::env::var("HEALTH_ADDR") {
        config.health_addr = v;
    }
    // Per-chain WS URL overrides: <CHAIN>_WS_URL / <CHAIN>_RPC_URL
    for c in &mut config.chains {
        let prefix = c.chain.as_str().to_uppercase();
        if let Ok(v) = std::env::var(format!("{}_WS_URL", prefix)) {
            c.ws_url = v;
        }
        if let Ok(v) = std::env::var(format!("{}_RPC_URL", prefix)) {
            c.rpc_url = v;
        }
        if let Ok(v) = std::env::var(format!("{}_MIN_PROFIT_USD", prefix)) {
            c.min_profit_usd = v
                .parse()
                .with_context(|| format!("{}_MIN_PROFIT_USD", prefix))?;
        }
        if let Ok(v) = std::env::var(format!("{}_WHALE_THRESHOLD_USD", prefix)) {
            c.whale_threshold_usd = v
                .parse()
                .with_context(|| format!("{}_WHALE_THRESHOLD_USD", prefix))?;
        }
    }
    Ok(())
}

fn parse_bool(s: &str) -> Result<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("not a boolean: {}", other),
    }
}

impl FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(s).context("invalid config")?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        health_addr = "127.0.0.1:9090"
        partitions = [["ethereum"], ["arbitrum", "base"]]

        [[chains]]
        chain = "ethereum"
        ws_url = "wss://eth.example/ws"
        rpc_url = "https://eth.example"
        min_profit_usd = 25.0
        whale_threshold_usd = 100000.0

        [[chains.dexes]]
        dex = "uniswap_v2"
        factory = "0x5C69bEe701ef814a2B6a3EDD4B1652CB9cc5aA6f"
        router = "0x7a250d5630B4cF539739dF2C5dAcb4c659F2488D"

        [[chains]]
        chain = "arbitrum"
        ws_url = "wss://arb.example/ws"
        rpc_url = "https://arb.example"

        [[chains]]
        chain = "base"
        ws_url = "wss://base.example/ws"
        rpc_url = "https://base.example"

        [detector]
        detection_interval_ms = 200

        [risk]
        total_capital_usd = 50000.0
    "#;

    #[test]
    fn test_parse_sample_config() {
        let config: AppConfig = SAMPLE.parse().unwrap();
        assert_eq!(config.chains.len(), 3);
        let eth = config.chain(Chain::Ethereum).unwrap();
        assert_eq!(eth.min_profit_usd, 25.0);
        assert_eq!(eth.whale_threshold_usd, 100_000.0);
        assert_eq!(eth.dexes.len(), 1);
        assert_eq!(eth.dexes[0].dex, DexName::UniswapV2);
        // Unset fields take defaults
        let arb = config.chain(Chain::Arbitrum).unwrap();
        assert_eq!(arb.min_profit_usd, 5.0);
        assert_eq!(config.detector.detection_interval_ms, 200);
        assert_eq!(config.detector.detection_stale_cutoff_ms, 30_000);
        assert_eq!(config.risk.total_capital_usd, 50_000.0);
        assert_eq!(config.nonce.pool_size, 5);
    }

    #[test]
    fn test_effective_partitions() {
        let config: AppConfig = SAMPLE.parse().unwrap();
        let parts = config.effective_partitions();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1], vec![Chain::Arbitrum, Chain::Base]);
    }

    #[test]
    fn test_validate_rejects_duplicate_chain() {
        let dup = r#"
            [[chains]]
            chain = "base"
            ws_url = "wss://a"
            rpc_url = "https://a"

            [[chains]]
            chain = "base"
            ws_url = "wss://b"
            rpc_url = "https://b"
        "#;
        assert!(dup.parse::<AppConfig>().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_watermarks() {
        let bad = r#"
            [[chains]]
            chain = "base"
            ws_url = "wss://a"
            rpc_url = "https://a"

            [execution]
            high_watermark = 100
            low_watermark = 100
        "#;
        assert!(bad.parse::<AppConfig>().is_err());
    }

    #[test]
    fn test_documented_defaults() {
        let minimal = r#"
            [[chains]]
            chain = "polygon"
            ws_url = "wss://poly"
            rpc_url = "https://poly"
        "#;
        let config: AppConfig = minimal.parse().unwrap();
        assert_eq!(config.bus.batch_wait_ms, 5);
        assert_eq!(config.filter.min_amount_usd, 10_000.0);
        assert_eq!(config.filter.sampling_rate, 0.01);
        assert_eq!(config.detector.prevalidation.sample_rate, 0.1);
        assert_eq!(config.detector.prevalidation.value_floor_usd, 50.0);
        assert_eq!(config.execution.high_watermark, 800);
        assert_eq!(config.execution.low_watermark, 200);
        assert_eq!(config.execution.breaker_failure_threshold, 5);
        assert_eq!(config.risk.kelly_multiplier, 0.5);
        assert_eq!(config.risk.max_single_trade_fraction, 0.02);
    }
}
