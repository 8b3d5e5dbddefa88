//! Core data structures shared across ingestion, detection, and execution.

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Chains the core monitors. Each chain runs its own ingestion instance;
/// detectors group chains into partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Ethereum,
    Arbitrum,
    Optimism,
    Base,
    Polygon,
    Bsc,
    Avalanche,
    Solana,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Ethereum => "ethereum",
            Chain::Arbitrum => "arbitrum",
            Chain::Optimism => "optimism",
            Chain::Base => "base",
            Chain::Polygon => "polygon",
            Chain::Bsc => "bsc",
            Chain::Avalanche => "avalanche",
            Chain::Solana => "solana",
        }
    }

    /// Numeric chain id (EVM chain ids; Solana uses a sentinel).
    pub fn chain_id(&self) -> u64 {
        match self {
            Chain::Ethereum => 1,
            Chain::Arbitrum => 42161,
            Chain::Optimism => 10,
            Chain::Base => 8453,
            Chain::Polygon => 137,
            Chain::Bsc => 56,
            Chain::Avalanche => 43114,
            Chain::Solana => 0,
        }
    }

    pub fn is_evm(&self) -> bool {
        !matches!(self, Chain::Solana)
    }

    /// L2s with a centralized sequencer get standard priority-fee submission
    /// instead of a private relay.
    pub fn has_sequencer(&self) -> bool {
        matches!(self, Chain::Arbitrum | Chain::Optimism | Chain::Base)
    }

    /// Staleness threshold for the WS subscription watchdog.
    /// Fast chains produce blocks sub-second; silence beyond these windows
    /// means the connection is black-holed, not that the chain is quiet.
    pub fn ws_staleness_threshold_ms(&self) -> u64 {
        match self {
            Chain::Solana | Chain::Arbitrum | Chain::Base | Chain::Optimism => 5_000,
            Chain::Polygon | Chain::Bsc | Chain::Avalanche => 10_000,
            Chain::Ethereum => 15_000,
        }
    }

    pub fn all() -> &'static [Chain] {
        &[
            Chain::Ethereum,
            Chain::Arbitrum,
            Chain::Optimism,
            Chain::Base,
            Chain::Polygon,
            Chain::Bsc,
            Chain::Avalanche,
            Chain::Solana,
        ]
    }
}

impl FromStr for Chain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ethereum" | "eth" | "mainnet" => Ok(Chain::Ethereum),
            "arbitrum" | "arb" => Ok(Chain::Arbitrum),
            "optimism" | "op" => Ok(Chain::Optimism),
            "base" => Ok(Chain::Base),
            "polygon" | "matic" => Ok(Chain::Polygon),
            "bsc" | "bnb" => Ok(Chain::Bsc),
            "avalanche" | "avax" => Ok(Chain::Avalanche),
            "solana" | "sol" => Ok(Chain::Solana),
            other => Err(format!("unknown chain: {}", other)),
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// DEXs we decode events for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DexName {
    UniswapV2,
    UniswapV3,
    SushiSwap,
    QuickSwap,
    PancakeSwap,
    Camelot,
    Velodrome,
    Aerodrome,
    TraderJoe,
    Raydium,
    Orca,
}

impl DexName {
    pub fn as_str(&self) -> &'static str {
        match self {
            DexName::UniswapV2 => "uniswap_v2",
            DexName::UniswapV3 => "uniswap_v3",
            DexName::SushiSwap => "sushiswap",
            DexName::QuickSwap => "quickswap",
            DexName::PancakeSwap => "pancakeswap",
            DexName::Camelot => "camelot",
            DexName::Velodrome => "velodrome",
            DexName::Aerodrome => "aerodrome",
            DexName::TraderJoe => "traderjoe",
            DexName::Raydium => "raydium",
            DexName::Orca => "orca",
        }
    }

    /// Single-swap fee as a fraction (0.003 = 0.30%).
    /// V2-style pools charge a flat 0.30%; V3 tiers are carried per pool,
    /// this is the conservative default used when the pool tier is unknown.
    pub fn fee_fraction(&self) -> f64 {
        match self {
            DexName::UniswapV3 => 0.0005,
            DexName::PancakeSwap => 0.0025,
            _ => 0.003,
        }
    }
}

impl fmt::Display for DexName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DexName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "uniswap_v2" | "uniswapv2" => Ok(DexName::UniswapV2),
            "uniswap_v3" | "uniswapv3" | "uniswap" => Ok(DexName::UniswapV3),
            "sushiswap" | "sushi" => Ok(DexName::SushiSwap),
            "quickswap" => Ok(DexName::QuickSwap),
            "pancakeswap" | "pancake" => Ok(DexName::PancakeSwap),
            "camelot" => Ok(DexName::Camelot),
            "velodrome" => Ok(DexName::Velodrome),
            "aerodrome" => Ok(DexName::Aerodrome),
            "traderjoe" => Ok(DexName::TraderJoe),
            "raydium" => Ok(DexName::Raydium),
            "orca" => Ok(DexName::Orca),
            other => Err(format!("unknown dex: {}", other)),
        }
    }
}

/// Build the normalized token key used by `pairs_by_tokens` and the L1 matrix:
/// both addresses lowercased, sorted lexicographically, joined with ':'.
/// WETH/USDC and USDC/WETH pools on any DEX map to the same key.
pub fn normalized_token_key(token0: &Address, token1: &Address) -> String {
    let a = format!("{:?}", token0).to_lowercase();
    let b = format!("{:?}", token1).to_lowercase();
    if a <= b {
        format!("{}:{}", a, b)
    } else {
        format!("{}:{}", b, a)
    }
}

/// A trading pair on a specific DEX on a specific chain.
///
/// Identity `(chain, pair_address)` is immutable after construction; token
/// addresses never change. Reserves are written ONLY by the owning chain's
/// ingestion instance — everyone else reads through the concurrent map.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub pair_address: Address,
    pub chain: Chain,
    pub dex: DexName,
    pub token0: Address,
    pub token1: Address,
    pub decimals0: u8,
    pub decimals1: u8,
    pub reserve0: U256,
    pub reserve1: U256,
    pub last_update_block: u64,
    pub last_update_ts_ms: u64,
}

impl TokenPair {
    /// Decimal-adjusted mid-price: token1 per token0 in human units.
    /// (reserve1 / reserve0) * 10^(decimals0 - decimals1)
    pub fn mid_price(&self) -> f64 {
        let r0 = u256_to_f64(self.reserve0);
        let r1 = u256_to_f64(self.reserve1);
        if r0 == 0.0 {
            return 0.0;
        }
        let adj = 10_f64.powi(self.decimals0 as i32 - self.decimals1 as i32);
        (r1 / r0) * adj
    }

    /// Constant product output with the 0.30% V2 fee:
    /// amountOut = (amountIn * 997 * reserveOut) / (reserveIn * 1000 + amountIn * 997)
    pub fn get_amount_out(&self, amount_in: U256, token_in: Address) -> U256 {
        let (reserve_in, reserve_out) = if token_in == self.token0 {
            (self.reserve0, self.reserve1)
        } else {
            (self.reserve1, self.reserve0)
        };

        if reserve_in.is_zero() || reserve_out.is_zero() {
            return U256::ZERO;
        }

        let amount_in_with_fee = amount_in * U256::from(997);
        let numerator = amount_in_with_fee * reserve_out;
        let denominator = (reserve_in * U256::from(1000)) + amount_in_with_fee;
        numerator / denominator
    }

    pub fn token_key(&self) -> String {
        normalized_token_key(&self.token0, &self.token1)
    }

    /// L1 matrix key: "chain:dex:normalizedPair".
    pub fn matrix_key(&self) -> String {
        format!("{}:{}:{}", self.chain, self.dex, self.token_key())
    }
}

/// Lossy but monotone U256 → f64 for price math. Full-precision paths keep
/// amounts in U256; floats are only for USD figures.
pub fn u256_to_f64(v: U256) -> f64 {
    let limbs = v.as_limbs();
    let mut out = 0.0f64;
    for (i, limb) in limbs.iter().enumerate() {
        out += (*limb as f64) * 2_f64.powi(64 * i as i32);
    }
    out
}

/// Human units → raw token units. Only for sizing estimates; exact amounts
/// stay in U256 end to end.
pub fn f64_to_raw(amount: f64, decimals: u8) -> U256 {
    if amount <= 0.0 {
        return U256::ZERO;
    }
    let scaled = amount * 10f64.powi(decimals.min(18) as i32);
    U256::from(scaled as u128)
}

/// An observed reserve change, normalized across chains and DEXs.
/// One producer (the chain's ingestion), many consumer groups; never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub chain: Chain,
    pub dex: DexName,
    pub pair_address: Address,
    pub token0: Address,
    pub token1: Address,
    pub decimals0: u8,
    pub decimals1: u8,
    pub reserve0: U256,
    pub reserve1: U256,
    /// Decimal-adjusted mid-price, derived at decode time.
    pub mid_price: f64,
    pub block_number: u64,
    pub timestamp_ms: u64,
    /// Monotonically increasing per (chain, pair).
    pub sequence: u64,
}

impl PriceUpdate {
    pub fn token_key(&self) -> String {
        normalized_token_key(&self.token0, &self.token1)
    }
}

/// An individual decoded trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapEvent {
    pub chain: Chain,
    pub dex: DexName,
    pub pair_address: Address,
    pub token0: Address,
    pub token1: Address,
    pub sender: Address,
    pub amount0_in: U256,
    pub amount1_in: U256,
    pub amount0_out: U256,
    pub amount1_out: U256,
    pub value_usd: f64,
    pub tx_hash: String,
    pub log_index: u64,
    pub block_number: u64,
    pub timestamp_ms: u64,
}

impl SwapEvent {
    /// Duplicate fingerprint: (pair, tx, log index) — stable across redelivery.
    pub fn fingerprint(&self) -> String {
        format!("{:?}:{}:{}", self.pair_address, self.tx_hash, self.log_index)
    }

    /// Net direction of the trade relative to token0.
    /// Buying token0 (token0 flows out of the pool) is Buy.
    pub fn direction(&self) -> SwapDirection {
        if self.amount0_out > self.amount0_in {
            SwapDirection::Buy
        } else {
            SwapDirection::Sell
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapDirection {
    Buy,
    Sell,
}

/// High-value swap republished on the whale stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhaleAlert {
    pub chain: Chain,
    pub dex: DexName,
    pub pair_address: Address,
    pub token0: Address,
    pub token1: Address,
    pub value_usd: f64,
    pub direction: SwapDirection,
    /// value_usd ≥ 10× the whale threshold.
    pub super_whale: bool,
    pub tx_hash: String,
    pub timestamp_ms: u64,
}

impl WhaleAlert {
    pub fn token_key(&self) -> String {
        normalized_token_key(&self.token0, &self.token1)
    }
}

/// Per-pair rolling volume published when the aggregation window closes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeAggregate {
    pub chain: Chain,
    pub pair_address: Address,
    pub window_start_ms: u64,
    pub window_end_ms: u64,
    pub swap_count: u64,
    pub volume_usd: f64,
}

/// One leg of an arbitrage path. `amount_in == 0` means "chained" — the
/// executor feeds the previous leg's output in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapStep {
    pub router: Address,
    pub token_in: Address,
    pub token_out: Address,
    pub amount_in: U256,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&alloy::primitives::hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        alloy::primitives::hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OpportunityKind {
    IntraDex,
    CrossDex,
    CrossChain,
    FlashLoan,
    Statistical,
    Triangular,
    MultiLeg,
}

impl fmt::Display for OpportunityKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            OpportunityKind::IntraDex => "intra-dex",
            OpportunityKind::CrossDex => "cross-dex",
            OpportunityKind::CrossChain => "cross-chain",
            OpportunityKind::FlashLoan => "flash-loan",
            OpportunityKind::Statistical => "statistical",
            OpportunityKind::Triangular => "triangular",
            OpportunityKind::MultiLeg => "multi-leg",
        };
        f.write_str(s)
    }
}

/// Flash-loan provider protocol. Aave V3 and Uniswap-V3-style flash swaps
/// have incompatible callback signatures — the calldata builder dispatches on
/// this tag, there is no shared callback interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashLoanProtocol {
    AaveV3,
    UniswapV3,
}

/// A detected, potentially-profitable arbitrage.
///
/// Invariants: `expires_at_ms > detected_at_ms`; `confidence <= 1.0`;
/// fingerprint unique within the publisher's dedupe window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    /// Fingerprint of normalized path + rounded amounts + minute bucket.
    pub id: String,
    pub kind: OpportunityKind,
    pub buy_chain: Chain,
    pub sell_chain: Chain,
    pub buy_dex: DexName,
    pub sell_dex: DexName,
    pub token_in: Address,
    pub token_out: Address,
    pub path: Vec<SwapStep>,
    pub amount_in: U256,
    pub expected_amount_out: U256,
    pub expected_profit_usd: f64,
    pub profit_percentage: f64,
    pub gas_estimate_usd: f64,
    pub confidence: f64,
    pub whale_triggered: bool,
    pub ml_confidence_boost: f64,
    /// Flash-loan protocol when kind == FlashLoan.
    pub flash_protocol: Option<FlashLoanProtocol>,
    pub detected_at_ms: u64,
    pub expires_at_ms: u64,
}

impl Opportunity {
    /// Deterministic id: normalized path endpoints + amounts rounded to whole
    /// USD + minute bucket. Two detections of the same spread inside the same
    /// minute collapse to one id.
    #[allow(clippy::too_many_arguments)]
    pub fn fingerprint(
        kind: OpportunityKind,
        buy_chain: Chain,
        sell_chain: Chain,
        buy_dex: DexName,
        sell_dex: DexName,
        token_in: &Address,
        token_out: &Address,
        amount_in_usd: f64,
        detected_at_ms: u64,
    ) -> String {
        let mut h = DefaultHasher::new();
        kind.hash(&mut h);
        buy_chain.hash(&mut h);
        sell_chain.hash(&mut h);
        buy_dex.hash(&mut h);
        sell_dex.hash(&mut h);
        token_in.hash(&mut h);
        token_out.hash(&mut h);
        (amount_in_usd.round() as i64).hash(&mut h);
        (detected_at_ms / 60_000).hash(&mut h);
        format!("{:016x}", h.finish())
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

/// Terminal result of an execution attempt. Fed back into the probability
/// tracker, the drawdown breaker, and the per-chain circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub actual_profit_usd: f64,
    pub gas_cost_usd: f64,
    pub error: Option<String>,
    pub tx_hash: Option<String>,
    pub latency_ms: u64,
}

/// Unix epoch milliseconds.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// Unix epoch seconds.
pub fn now_secs() -> u32 {
    chrono::Utc::now().timestamp() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    #[test]
    fn test_normalized_token_key_order_independent() {
        let a = address!("7ceB23fD6bC0adD59E62ac25578270cFf1b9f619");
        let b = address!("2791Bca1f2de4661ED88A30C99A7a9449Aa84174");
        assert_eq!(normalized_token_key(&a, &b), normalized_token_key(&b, &a));
        assert!(normalized_token_key(&a, &b).contains(':'));
    }

    fn weth_usdc_pair() -> TokenPair {
        TokenPair {
            pair_address: Address::ZERO,
            chain: Chain::Ethereum,
            dex: DexName::UniswapV2,
            token0: address!("C02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2"),
            token1: address!("A0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"),
            decimals0: 18,
            decimals1: 6,
            reserve0: U256::from(100u64) * U256::from(10u64).pow(U256::from(18)),
            reserve1: U256::from(200_000u64) * U256::from(10u64).pow(U256::from(6)),
            last_update_block: 1,
            last_update_ts_ms: 0,
        }
    }

    #[test]
    fn test_mid_price_decimal_adjusted() {
        // 100 WETH(18) / 200_000 USDC(6) → 2000 USDC per WETH
        let p = weth_usdc_pair().mid_price();
        assert!((p - 2000.0).abs() < 1e-6, "mid price was {}", p);
    }

    #[test]
    fn test_get_amount_out_constant_product() {
        let pair = weth_usdc_pair();
        // Swap 1 WETH in → a bit under 2000 USDC out (fee + price impact)
        let out = pair.get_amount_out(U256::from(10u64).pow(U256::from(18)), pair.token0);
        let out_usdc = u256_to_f64(out) / 1e6;
        assert!(out_usdc > 1950.0 && out_usdc < 2000.0, "out was {}", out_usdc);

        // Zero reserves → zero out
        let mut empty = pair.clone();
        empty.reserve0 = U256::ZERO;
        assert_eq!(empty.get_amount_out(U256::from(1000), pair.token0), U256::ZERO);
    }

    #[test]
    fn test_fingerprint_minute_bucket() {
        let t_in = Address::ZERO;
        let t_out = Address::repeat_byte(1);
        let fp = |amount: f64, ts: u64| {
            Opportunity::fingerprint(
                OpportunityKind::CrossDex,
                Chain::Ethereum,
                Chain::Ethereum,
                DexName::UniswapV3,
                DexName::SushiSwap,
                &t_in,
                &t_out,
                amount,
                ts,
            )
        };
        // Same minute, amounts rounding to the same whole USD → same id
        assert_eq!(fp(100.2, 60_000), fp(100.4, 119_999));
        // Next minute → different id
        assert_ne!(fp(100.2, 60_000), fp(100.2, 120_000));
        // Materially different amount → different id
        assert_ne!(fp(100.0, 60_000), fp(500.0, 60_000));
    }

    #[test]
    fn test_swap_event_direction() {
        let ev = SwapEvent {
            chain: Chain::Polygon,
            dex: DexName::QuickSwap,
            pair_address: Address::ZERO,
            token0: Address::ZERO,
            token1: Address::ZERO,
            sender: Address::ZERO,
            amount0_in: U256::ZERO,
            amount1_in: U256::from(1000),
            amount0_out: U256::from(5),
            amount1_out: U256::ZERO,
            value_usd: 1000.0,
            tx_hash: "0xabc".into(),
            log_index: 3,
            block_number: 1,
            timestamp_ms: 0,
        };
        assert_eq!(ev.direction(), SwapDirection::Buy);
        assert_eq!(ev.fingerprint(), format!("{:?}:0xabc:3", Address::ZERO));
    }

    #[test]
    fn test_chain_roundtrip() {
        for chain in Chain::all() {
            assert_eq!(chain.as_str().parse::<Chain>().unwrap(), *chain);
        }
        assert!("dogechain".parse::<Chain>().is_err());
    }

    #[test]
    fn test_ws_staleness_classes() {
        assert_eq!(Chain::Arbitrum.ws_staleness_threshold_ms(), 5_000);
        assert_eq!(Chain::Polygon.ws_staleness_threshold_ms(), 10_000);
        assert_eq!(Chain::Ethereum.ws_staleness_threshold_ms(), 15_000);
    }
}
