//! Chain RPC seam for the execution path.
//!
//! Everything the pipeline needs from a node sits behind one trait so tests
//! run against a scripted mock and production runs against alloy HTTP
//! providers (one per chain, shared).

use crate::error::CoreError;
use crate::execution::TxRequest;
use crate::types::Chain;
use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, Bytes};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;

#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn get_transaction_count(
        &self,
        chain: Chain,
        address: Address,
    ) -> Result<u64, CoreError>;

    /// eth_call against latest (or a pinned block).
    async fn call(&self, request: &TxRequest, block: Option<u64>) -> Result<Vec<u8>, CoreError>;

    /// Returns the transaction hash.
    async fn send_raw_transaction(&self, chain: Chain, raw: &[u8]) -> Result<String, CoreError>;

    async fn gas_price_gwei(&self, chain: Chain) -> Result<f64, CoreError>;
}

/// HTTP providers per chain, built lazily from configured URLs.
pub struct AlloyRpc {
    urls: HashMap<Chain, String>,
    providers: DashMap<Chain, DynProvider>,
}

impl AlloyRpc {
    pub fn new(urls: HashMap<Chain, String>) -> Self {
        Self {
            urls,
            providers: DashMap::new(),
        }
    }

    fn provider(&self, chain: Chain) -> Result<DynProvider, CoreError> {
        if let Some(p) = self.providers.get(&chain) {
            return Ok(p.clone());
        }
        let url = self
            .urls
            .get(&chain)
            .ok_or_else(|| CoreError::Fatal(format!("no RPC URL configured for {}", chain)))?;
        let parsed = url
            .parse()
            .map_err(|e| CoreError::Fatal(format!("bad RPC URL for {}: {}", chain, e)))?;
        let provider = ProviderBuilder::new().connect_http(parsed).erased();
        self.providers.insert(chain, provider.clone());
        Ok(provider)
    }
}

fn map_transport_err(e: impl std::fmt::Display) -> CoreError {
    let msg = e.to_string();
    if msg.to_ascii_lowercase().contains("revert") {
        CoreError::Validation(msg)
    } else {
        CoreError::Transient(msg)
    }
}

#[async_trait]
impl ChainRpc for AlloyRpc {
    async fn get_transaction_count(
        &self,
        chain: Chain,
        address: Address,
    ) -> Result<u64, CoreError> {
        let provider = self.provider(chain)?;
        provider
            .get_transaction_count(address)
            .await
            .map_err(map_transport_err)
    }

    async fn call(&self, request: &TxRequest, _block: Option<u64>) -> Result<Vec<u8>, CoreError> {
        let provider = self.provider(request.chain)?;
        let tx = TransactionRequest::default()
            .with_from(request.from)
            .with_to(request.to)
            .with_value(request.value)
            .with_input(Bytes::from(request.data.clone()))
            .with_gas_limit(request.gas_limit);
        let out = provider.call(tx).await.map_err(map_transport_err)?;
        Ok(out.to_vec())
    }

    async fn send_raw_transaction(&self, chain: Chain, raw: &[u8]) -> Result<String, CoreError> {
        let provider = self.provider(chain)?;
        let pending = provider
            .send_raw_transaction(raw)
            .await
            .map_err(map_transport_err)?;
        Ok(format!("{:?}", pending.tx_hash()))
    }

    async fn gas_price_gwei(&self, chain: Chain) -> Result<f64, CoreError> {
        let provider = self.provider(chain)?;
        let wei = provider.get_gas_price().await.map_err(map_transport_err)?;
        Ok(wei as f64 / 1e9)
    }
}

/// Scripted mock for tests: fixed transaction counts, programmable call
/// results, recorded submissions.
#[cfg(test)]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    pub struct MockRpc {
        pub tx_count: AtomicU64,
        pub tx_count_calls: AtomicU64,
        pub call_result: Mutex<Result<Vec<u8>, String>>,
        pub sent: Mutex<Vec<(Chain, Vec<u8>)>>,
    }

    impl MockRpc {
        pub fn new(tx_count: u64) -> Self {
            Self {
                tx_count: AtomicU64::new(tx_count),
                tx_count_calls: AtomicU64::new(0),
                call_result: Mutex::new(Ok(Vec::new())),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChainRpc for MockRpc {
        async fn get_transaction_count(
            &self,
            _chain: Chain,
            _address: Address,
        ) -> Result<u64, CoreError> {
            self.tx_count_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.tx_count.load(Ordering::SeqCst))
        }

        async fn call(
            &self,
            _request: &TxRequest,
            _block: Option<u64>,
        ) -> Result<Vec<u8>, CoreError> {
            self.call_result
                .lock()
                .clone()
                .map_err(CoreError::Validation)
        }

        async fn send_raw_transaction(
            &self,
            chain: Chain,
            raw: &[u8],
        ) -> Result<String, CoreError> {
            self.sent.lock().push((chain, raw.to_vec()));
            Ok(format!("0xmock{}", self.sent.lock().len()))
        }

        async fn gas_price_gwei(&self, _chain: Chain) -> Result<f64, CoreError> {
            Ok(25.0)
        }
    }
}
