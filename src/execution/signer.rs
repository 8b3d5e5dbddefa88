//! Local transaction signing.
//!
//! One private key (env-provided) signing legacy-envelope transactions for
//! the EVM chains. Solana signing is a different stack and is not wired in
//! this core — submitting there requires an external signer service.

use crate::error::CoreError;
use crate::execution::{TxRequest, WalletSigner};
use crate::types::Chain;
use alloy::consensus::{SignableTransaction, TxLegacy};
use alloy::eips::eip2718::Encodable2718;
use alloy::network::TxSignerSync;
use alloy::primitives::{Address, TxKind};
use alloy::signers::local::PrivateKeySigner;

/// Gas price used when the request carries no fee hint.
const FALLBACK_GAS_PRICE_GWEI: f64 = 50.0;

pub struct LocalWalletSigner {
    key: PrivateKeySigner,
}

impl LocalWalletSigner {
    pub fn new(key: PrivateKeySigner) -> Self {
        Self { key }
    }

    /// Parse from a hex private key (0x-prefixed or bare).
    pub fn from_hex(hex_key: &str) -> Result<Self, CoreError> {
        let key: PrivateKeySigner = hex_key
            .trim()
            .parse()
            .map_err(|e| CoreError::Fatal(format!("invalid private key: {}", e)))?;
        Ok(Self::new(key))
    }
}

impl WalletSigner for LocalWalletSigner {
    fn sign(&self, request: &TxRequest) -> Result<Vec<u8>, CoreError> {
        if !request.chain.is_evm() {
            return Err(CoreError::Fatal(format!(
                "no local signer for {}",
                request.chain
            )));
        }
        let gas_price_gwei = request
            .priority_fee_gwei
            .unwrap_or(FALLBACK_GAS_PRICE_GWEI);
        let mut tx = TxLegacy {
            chain_id: Some(request.chain.chain_id()),
            nonce: request.nonce.unwrap_or(0),
            gas_price: (gas_price_gwei * 1e9) as u128,
            gas_limit: request.gas_limit,
            to: TxKind::Call(request.to),
            value: request.value,
            input: request.data.clone().into(),
        };
        let signature = self
            .key
            .sign_transaction_sync(&mut tx)
            .map_err(|e| CoreError::Fatal(format!("signing failed: {}", e)))?;
        let signed = tx.into_signed(signature);
        let mut out = Vec::new();
        signed.encode_2718(&mut out);
        Ok(out)
    }

    fn address(&self, chain: Chain) -> Option<Address> {
        chain.is_evm().then(|| self.key.address())
    }
}
