//! Raw log decoding: V2 Sync (reserve updates), V2 Swap, and factory
//! PairCreated events.
//!
//! Decoding is topic0-dispatched with manual word extraction — the three
//! shapes are stable and small, and this keeps the hot path free of dynamic
//! ABI machinery. Malformed logs are Validation errors: counted and dropped,
//! never retried.

use crate::error::CoreError;
use alloy::primitives::{b256, Address, B256, U256};
use alloy::rpc::types::Log;

/// keccak256("Sync(uint112,uint112)")
pub const SYNC_TOPIC: B256 =
    b256!("1c411e9a96e071241c2f21f7726b17ae89e3cab4c78be50e062b03a9fffbbad1");
/// keccak256("Swap(address,uint256,uint256,uint256,uint256,address)")
pub const SWAP_TOPIC: B256 =
    b256!("d78ad95fa46c994b6551d0da85fc275fe613ce37657fb8d5e3d130840159d822");
/// keccak256("PairCreated(address,address,address,uint256)")
pub const PAIR_CREATED_TOPIC: B256 =
    b256!("0d3648bd0f6ba80134a33ba9275ac585d9d315f0ad8355cddefde31afa28d0e9");

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedEvent {
    /// Pool reserves changed — the primary price signal.
    ReserveSync {
        pair: Address,
        reserve0: U256,
        reserve1: U256,
        block_number: u64,
    },
    /// An individual trade against a pool.
    Swap {
        pair: Address,
        sender: Address,
        amount0_in: U256,
        amount1_in: U256,
        amount0_out: U256,
        amount1_out: U256,
        block_number: u64,
        tx_hash: String,
        log_index: u64,
    },
    /// Factory deployed a new pool; register it lazily.
    PairCreated {
        factory: Address,
        token0: Address,
        token1: Address,
        pair: Address,
        block_number: u64,
    },
}

fn data_word(data: &[u8], index: usize) -> Result<U256, CoreError> {
    let start = index * 32;
    let end = start + 32;
    if data.len() < end {
        return Err(CoreError::Validation(format!(
            "log data too short: {} bytes, need word {}",
            data.len(),
            index
        )));
    }
    Ok(U256::from_be_slice(&data[start..end]))
}

fn data_word_address(data: &[u8], index: usize) -> Result<Address, CoreError> {
    let start = index * 32;
    let end = start + 32;
    if data.len() < end {
        return Err(CoreError::Validation(format!(
            "log data too short for address word {}",
            index
        )));
    }
    Ok(Address::from_slice(&data[start + 12..end]))
}

fn topic_address(topics: &[B256], index: usize) -> Result<Address, CoreError> {
    topics
        .get(index)
        .map(|t| Address::from_slice(&t.0[12..]))
        .ok_or_else(|| CoreError::Validation(format!("missing topic {}", index)))
}

/// Decode a raw log. `Ok(None)` means "not an event class we track" — not an
/// error; subscriptions are topic0-filtered but providers occasionally leak
/// extras through.
pub fn decode_log(log: &Log) -> Result<Option<DecodedEvent>, CoreError> {
    let topics = log.inner.data.topics();
    let Some(topic0) = topics.first() else {
        return Ok(None);
    };
    let data: &[u8] = log.inner.data.data.as_ref();
    let block_number = log.block_number.unwrap_or(0);

    if *topic0 == SYNC_TOPIC {
        return Ok(Some(DecodedEvent::ReserveSync {
            pair: log.inner.address,
            reserve0: data_word(data, 0)?,
            reserve1: data_word(data, 1)?,
            block_number,
        }));
    }

    if *topic0 == SWAP_TOPIC {
        return Ok(Some(DecodedEvent::Swap {
            pair: log.inner.address,
            sender: topic_address(topics, 1)?,
            amount0_in: data_word(data, 0)?,
            amount1_in: data_word(data, 1)?,
            amount0_out: data_word(data, 2)?,
            amount1_out: data_word(data, 3)?,
            block_number,
            tx_hash: log
                .transaction_hash
                .map(|h| format!("{:?}", h))
                .unwrap_or_default(),
            log_index: log.log_index.unwrap_or(0),
        }));
    }

    if *topic0 == PAIR_CREATED_TOPIC {
        return Ok(Some(DecodedEvent::PairCreated {
            factory: log.inner.address,
            token0: topic_address(topics, 1)?,
            token1: topic_address(topics, 2)?,
            pair: data_word_address(data, 0)?,
            block_number,
        }));
    }

    Ok(None)
}
