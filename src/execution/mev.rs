//! MEV-protected submission.
//!
//! Chain-aware venue selection: Ethereum mainnet goes through MEV-Share
//! (orderflow auction — reveal only the function selector and contract,
//! hide calldata, logs, value, and hash), Solana goes through a Jito
//! bundle, sequencer L2s submit with a priority fee, everything else uses
//! the public mempool. Failures degrade down the chain MEV-Share → private
//! mempool → public mempool. A pre-submission risk analysis recommends the
//! venue and tip.

use crate::error::CoreError;
use crate::execution::rpc::ChainRpc;
use crate::execution::{TxRequest, WalletSigner};
use crate::types::Chain;
use alloy::primitives::U256;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const RELAY_TIMEOUT_MS: u64 = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MevRoute {
    MevShare,
    JitoBundle,
    PriorityFee,
    PublicMempool,
}

/// Primary route per chain.
pub fn route_for_chain(chain: Chain) -> MevRoute {
    match chain {
        Chain::Ethereum => MevRoute::MevShare,
        Chain::Solana => MevRoute::JitoBundle,
        c if c.has_sequencer() => MevRoute::PriorityFee,
        _ => MevRoute::PublicMempool,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandwichRisk {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionVenue {
    Public,
    Private,
    Bundle,
}

#[derive(Debug, Clone, Serialize)]
pub struct MevRiskAnalysis {
    pub sandwich_risk: SandwichRisk,
    pub recommended_tip_gwei: f64,
    pub recommendation: SubmissionVenue,
}

/// Pre-submission sandwich-risk heuristic: value, path length, and how
/// attractive the tokens are to searchers (0..1).
pub fn analyze_mev_risk(value_usd: f64, path_len: usize, token_attractiveness: f64) -> MevRiskAnalysis {
    let mut score = 0.0;
    if value_usd >= 100_000.0 {
        score += 0.5;
    } else if value_usd >= 10_000.0 {
        score += 0.3;
    } else if value_usd >= 1_000.0 {
        score += 0.1;
    }
    // Long paths sit in the mempool visibly mispriced.
    score += 0.1 * path_len.saturating_sub(1) as f64;
    score += 0.3 * token_attractiveness.clamp(0.0, 1.0);

    let sandwich_risk = if score >= 0.6 {
        SandwichRisk::High
    } else if score >= 0.3 {
        SandwichRisk::Medium
    } else {
        SandwichRisk::Low
    };
    let recommendation = match sandwich_risk {
        SandwichRisk::High => SubmissionVenue::Bundle,
        SandwichRisk::Medium => SubmissionVenue::Private,
        SandwichRisk::Low => SubmissionVenue::Public,
    };
    let recommended_tip_gwei = match sandwich_risk {
        SandwichRisk::High => 3.0,
        SandwichRisk::Medium => 1.5,
        SandwichRisk::Low => 0.5,
    };
    MevRiskAnalysis {
        sandwich_risk,
        recommended_tip_gwei,
        recommendation,
    }
}

#[derive(Debug, Clone)]
pub struct SubmitResult {
    pub submitted_hash: String,
    pub accepted: bool,
    pub rebate_wei: Option<U256>,
}

/// Submission seam for the engine: the MEV provider in production, a
/// recorder in tests.
#[async_trait::async_trait]
pub trait TxSubmitter: Send + Sync {
    async fn submit(&self, request: &TxRequest) -> Result<SubmitResult, CoreError>;
}

#[async_trait::async_trait]
impl TxSubmitter for MevProvider {
    async fn submit(&self, request: &TxRequest) -> Result<SubmitResult, CoreError> {
        MevProvider::submit(self, request).await
    }
}

pub struct MevProvider {
    http: reqwest::Client,
    /// Flashbots-equivalent relay (mev_sendBundle / eth_sendBundle).
    relay_url: Option<String>,
    /// Private transaction endpoint.
    private_url: Option<String>,
    /// Jito block engine endpoint.
    jito_url: Option<String>,
    rpc: Arc<dyn ChainRpc>,
    signer: Arc<dyn WalletSigner>,
}

impl MevProvider {
    pub fn new(
        relay_url: Option<String>,
        private_url: Option<String>,
        jito_url: Option<String>,
        rpc: Arc<dyn ChainRpc>,
        signer: Arc<dyn WalletSigner>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            relay_url,
            private_url,
            jito_url,
            rpc,
            signer,
        }
    }

    /// Sign and submit through the chain's route with the documented
    /// fallbacks. Never raises for a downgrade — only when every venue
    /// refused the transaction.
    pub async fn submit(&self, request: &TxRequest) -> Result<SubmitResult, CoreError> {
        let raw = self.signer.sign(request)?;
        match route_for_chain(request.chain) {
            MevRoute::MevShare => self.submit_mev_share(request, &raw).await,
            MevRoute::JitoBundle => self.submit_jito(request, &raw).await,
            MevRoute::PriorityFee | MevRoute::PublicMempool => {
                self.submit_public(request.chain, &raw).await
            }
        }
    }

    async fn submit_mev_share(
        &self,
        request: &TxRequest,
        raw: &[u8],
    ) -> Result<SubmitResult, CoreError> {
        if let Some(relay) = &self.relay_url {
            // Selective disclosure: selector + contract only.
            let selector = request
                .data
                .get(..4)
                .map(alloy::primitives::hex::encode)
                .unwrap_or_default();
            let body = json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "mev_sendBundle",
                "params": [{
                    "version": "v0.1",
                    "inclusion": { "block": "latest" },
                    "body": [{ "tx": format!("0x{}", alloy::primitives::hex::encode(raw)), "canRevert": false }],
                    "privacy": {
                        "hints": ["function_selector", "contract_address"],
                        "wantRefund": 90
                    },
                    "metadata": {
                        "selector": format!("0x{}", selector),
                        "contract": format!("{:?}", request.to)
                    }
                }]
            });
            match self.post_relay(relay, &body).await {
                Ok(hash) => {
                    return Ok(SubmitResult {
                        submitted_hash: hash,
                        accepted: true,
                        rebate_wei: None,
                    })
                }
                Err(e) => warn!("MEV-Share submit failed: {} — trying private mempool", e),
            }
        }
        // Fallback 1: private mempool.
        if let Some(private) = &self.private_url {
            let body = json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "eth_sendRawTransaction",
                "params": [format!("0x{}", alloy::primitives::hex::encode(raw))]
            });
            match self.post_relay(private, &body).await {
                Ok(hash) => {
                    return Ok(SubmitResult {
                        submitted_hash: hash,
                        accepted: true,
                        rebate_wei: None,
                    })
                }
                Err(e) => warn!("private mempool submit failed: {} — going public", e),
            }
        }
        // Fallback 2: public mempool.
        self.submit_public(request.chain, raw).await
    }

    async fn submit_jito(&self, request: &TxRequest, raw: &[u8]) -> Result<SubmitResult, CoreError> {
        if let Some(jito) = &self.jito_url {
            let body = json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "sendBundle",
                "params": [[alloy::primitives::hex::encode(raw)]]
            });
            match self.post_relay(jito, &body).await {
                Ok(hash) => {
                    return Ok(SubmitResult {
                        submitted_hash: hash,
                        accepted: true,
                        rebate_wei: None,
                    })
                }
                Err(e) => warn!("Jito bundle submit failed: {} — going public", e),
            }
        }
        self.submit_public(request.chain, raw).await
    }

    async fn submit_public(&self, chain: Chain, raw: &[u8]) -> Result<SubmitResult, CoreError> {
        let hash = self.rpc.send_raw_transaction(chain, raw).await?;
        debug!("public submit on {}: {}", chain, hash);
        Ok(SubmitResult {
            submitted_hash: hash,
            accepted: true,
            rebate_wei: None,
        })
    }

    async fn post_relay(&self, url: &str, body: &serde_json::Value) -> Result<String, CoreError> {
        let response = self
            .http
            .post(url)
            .json(body)
            .timeout(Duration::from_millis(RELAY_TIMEOUT_MS))
            .send()
            .await
            .map_err(|e| CoreError::Transient(format!("relay unreachable: {}", e)))?;
        if !response.status().is_success() {
            return Err(CoreError::Transient(format!(
                "relay returned {}",
                response.status()
            )));
        }
        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CoreError::Validation(format!("bad relay response: {}", e)))?;
        if let Some(error) = parsed.get("error") {
            return Err(CoreError::Transient(format!("relay error: {}", error)));
        }
        Ok(parsed
            .get("result")
            .and_then(|r| {
                r.as_str()
                    .map(str::to_string)
                    .or_else(|| r.get("bundleHash").and_then(|h| h.as_str()).map(str::to_string))
            })
            .unwrap_or_else(|| "0x0".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_selection_per_chain() {
        assert_eq!(route_for_chain(Chain::Ethereum), MevRoute::MevShare);
        assert_eq!(route_for_chain(Chain::Solana), MevRoute::JitoBundle);
        assert_eq!(route_for_chain(Chain::Arbitrum), MevRoute::PriorityFee);
        assert_eq!(route_for_chain(Chain::Base), MevRoute::PriorityFee);
        assert_eq!(route_for_chain(Chain::Optimism), MevRoute::PriorityFee);
        assert_eq!(route_for_chain(Chain::Bsc), MevRoute::PublicMempool);
        assert_eq!(route_for_chain(Chain::Polygon), MevRoute::PublicMempool);
    }

    #[test]
    fn test_risk_analysis_scales_with_value() {
        let small = analyze_mev_risk(500.0, 2, 0.0);
        assert_eq!(small.sandwich_risk, SandwichRisk::Low);
        assert_eq!(small.recommendation, SubmissionVenue::Public);

        let medium = analyze_mev_risk(50_000.0, 2, 0.0);
        assert_eq!(medium.sandwich_risk, SandwichRisk::Medium);
        assert_eq!(medium.recommendation, SubmissionVenue::Private);

        let large = analyze_mev_risk(500_000.0, 3, 0.5);
        assert_eq!(large.sandwich_risk, SandwichRisk::High);
        assert_eq!(large.recommendation, SubmissionVenue::Bundle);
        assert!(large.recommended_tip_gwei > medium.recommended_tip_gwei);
    }

    #[test]
    fn test_risk_analysis_path_length_matters() {
        let short = analyze_mev_risk(10_000.0, 1, 0.0);
        let long = analyze_mev_risk(10_000.0, 5, 0.0);
        assert!(matches!(short.sandwich_risk, SandwichRisk::Medium));
        assert_eq!(long.sandwich_risk, SandwichRisk::High);
    }
}
