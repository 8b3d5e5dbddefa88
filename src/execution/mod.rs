//! Execution pipeline: opportunity consumption, risk and simulation gates,
//! nonce management, MEV-protected submission, per-chain circuit breakers.

pub mod calldata;
pub mod circuit_breaker;
pub mod cooldown;
pub mod engine;
pub mod mev;
pub mod nonce;
pub mod rpc;
pub mod signer;
pub mod simulation;
pub mod strategy;

pub use circuit_breaker::{BreakerState, CircuitBreakerManager};
pub use engine::ExecutionEngine;
pub use nonce::NonceManager;

use crate::error::CoreError;
use crate::types::Chain;
use alloy::primitives::{Address, U256};

/// A transaction the pipeline wants on chain. Strategies build these;
/// simulation, nonce allocation, and submission consume them.
#[derive(Debug, Clone)]
pub struct TxRequest {
    pub chain: Chain,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub data: Vec<u8>,
    pub gas_limit: u64,
    pub nonce: Option<u64>,
    /// Priority tip, set by the MEV risk analysis where relevant.
    pub priority_fee_gwei: Option<f64>,
}

/// Signing seam. Production wires a local key per chain; tests return a
/// deterministic blob. Raw bytes out, ready for eth_sendRawTransaction or a
/// bundle body.
pub trait WalletSigner: Send + Sync {
    fn sign(&self, request: &TxRequest) -> Result<Vec<u8>, CoreError>;
    fn address(&self, chain: Chain) -> Option<Address>;
}
