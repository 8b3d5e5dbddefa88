//! Nonce management with pre-allocation.
//!
//! Per (chain, wallet) state under an async mutex. The pre-allocation pool
//! makes the happy path RPC-free: pop a pooled nonce, register the pending
//! entry, and kick a background replenish when the pool runs low. Pending
//! entries carry deadlines; a sweeper evicts the ones whose transactions
//! evidently died. A disabled pool (size 0) degrades to lock + sync + bump,
//! which is slower but exactly as correct.

use crate::config::NonceConfig;
use crate::error::CoreError;
use crate::execution::rpc::ChainRpc;
use crate::types::Chain;
use alloy::primitives::Address;
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct PendingEntry {
    deadline_ms: u64,
    tx_hash: Option<String>,
}

#[derive(Debug, Default)]
struct WalletNonceState {
    confirmed_nonce: u64,
    pending_nonce: u64,
    pool: VecDeque<u64>,
    in_flight: HashMap<u64, PendingEntry>,
    last_sync_ms: u64,
    replenishing: bool,
}

type Key = (Chain, Address);

pub struct NonceManager {
    config: NonceConfig,
    rpc: Arc<dyn ChainRpc>,
    states: DashMap<Key, Arc<Mutex<WalletNonceState>>>,
}

impl NonceManager {
    pub fn new(config: NonceConfig, rpc: Arc<dyn ChainRpc>) -> Self {
        Self {
            config,
            rpc,
            states: DashMap::new(),
        }
    }

    fn state(&self, chain: Chain, wallet: Address) -> Arc<Mutex<WalletNonceState>> {
        self.states
            .entry((chain, wallet))
            .or_insert_with(|| Arc::new(Mutex::new(WalletNonceState::default())))
            .clone()
    }

    fn pool_enabled(&self) -> bool {
        self.config.pool_size > 0
    }

    /// Fill the pool up front so the first burst of executions needs no RPC.
    pub async fn prefill(&self, chain: Chain, wallet: Address, now_ms: u64) -> Result<(), CoreError> {
        if !self.pool_enabled() {
            return Ok(());
        }
        let state = self.state(chain, wallet);
        let mut guard = state.lock().await;
        self.sync_locked(&mut guard, chain, wallet, now_ms).await?;
        let base = guard.pending_nonce;
        for i in 0..self.config.pool_size as u64 {
            guard.pool.push_back(base + i);
        }
        guard.pending_nonce = base + self.config.pool_size as u64;
        info!(
            "nonce pool prefilled for {} {:?}: {}..{}",
            chain,
            wallet,
            base,
            guard.pending_nonce
        );
        Ok(())
    }

    /// Allocate the next nonce and register its pending entry.
    pub async fn next_nonce(
        self: &Arc<Self>,
        chain: Chain,
        wallet: Address,
        now_ms: u64,
    ) -> Result<u64, CoreError> {
        let state = self.state(chain, wallet);
        let mut guard = state.lock().await;

        // Fast path: pooled nonce, no RPC.
        if self.pool_enabled() {
            if let Some(nonce) = guard.pool.pop_front() {
                guard.in_flight.insert(
                    nonce,
                    PendingEntry {
                        deadline_ms: now_ms + self.config.pending_timeout_ms,
                        tx_hash: None,
                    },
                );
                let should_replenish =
                    guard.pool.len() <= self.config.replenish_threshold && !guard.replenishing;
                if should_replenish {
                    guard.replenishing = true;
                    let manager = Arc::clone(self);
                    tokio::spawn(async move {
                        manager.replenish(chain, wallet).await;
                    });
                }
                return Ok(nonce);
            }
        }

        // Slow path: sync with the chain if stale, then bump.
        if now_ms.saturating_sub(guard.last_sync_ms) > self.config.sync_interval_ms {
            self.sync_locked(&mut guard, chain, wallet, now_ms).await?;
        }
        let nonce = guard.pending_nonce;
        guard.pending_nonce += 1;
        guard.in_flight.insert(
            nonce,
            PendingEntry {
                deadline_ms: now_ms + self.config.pending_timeout_ms,
                tx_hash: None,
            },
        );
        Ok(nonce)
    }

    async fn sync_locked(
        &self,
        guard: &mut WalletNonceState,
        chain: Chain,
        wallet: Address,
        now_ms: u64,
    ) -> Result<(), CoreError> {
        let on_chain = self.rpc.get_transaction_count(chain, wallet).await?;
        guard.confirmed_nonce = on_chain;
        // Never move pending below what the chain already knows, and never
        // below a nonce we've handed out.
        guard.pending_nonce = guard.pending_nonce.max(on_chain);
        guard.last_sync_ms = now_ms;
        debug!(
            "nonce sync {} {:?}: confirmed={} pending={}",
            chain, wallet, guard.confirmed_nonce, guard.pending_nonce
        );
        Ok(())
    }

    /// Background pool refill.
    async fn replenish(self: Arc<Self>, chain: Chain, wallet: Address) {
        let state = self.state(chain, wallet);
        let now_ms = crate::types::now_ms();
        let mut guard = state.lock().await;
        if let Err(e) = self.sync_locked(&mut guard, chain, wallet, now_ms).await {
            warn!("nonce replenish sync failed for {}: {}", chain, e);
            guard.replenishing = false;
            return;
        }
        let base = guard.pending_nonce;
        let want = self.config.pool_size.saturating_sub(guard.pool.len()) as u64;
        for i in 0..want {
            guard.pool.push_back(base + i);
        }
        guard.pending_nonce = base + want;
        guard.replenishing = false;
        debug!(
            "nonce pool replenished for {} {:?}: +{} (now {})",
            chain,
            wallet,
            want,
            guard.pool.len()
        );
    }

    /// Record the submitted hash against the pending entry.
    pub async fn on_submitted(&self, chain: Chain, wallet: Address, nonce: u64, tx_hash: &str) {
        let state = self.state(chain, wallet);
        let mut guard = state.lock().await;
        if let Some(entry) = guard.in_flight.get_mut(&nonce) {
            entry.tx_hash = Some(tx_hash.to_string());
        }
    }

    pub async fn on_confirmed(&self, chain: Chain, wallet: Address, nonce: u64) {
        let state = self.state(chain, wallet);
        let mut guard = state.lock().await;
        guard.in_flight.remove(&nonce);
        guard.confirmed_nonce = guard.confirmed_nonce.max(nonce + 1);
    }

    /// Failed transaction. A nonce that never reached the mempool is safe to
    /// reuse; one that did is burned — force the next slow-path allocation
    /// to resync with the chain.
    pub async fn on_failed(&self, chain: Chain, wallet: Address, nonce: u64, reached_mempool: bool) {
        let state = self.state(chain, wallet);
        let mut guard = state.lock().await;
        guard.in_flight.remove(&nonce);
        if !reached_mempool {
            guard.pool.push_front(nonce);
        } else {
            guard.last_sync_ms = 0;
        }
    }

    pub async fn in_flight_count(&self, chain: Chain, wallet: Address) -> usize {
        self.state(chain, wallet).lock().await.in_flight.len()
    }

    /// Evict pending entries past their deadline. Run from a periodic task.
    pub async fn sweep_expired(&self, now_ms: u64) -> usize {
        let mut evicted = 0;
        for entry in self.states.iter() {
            let mut guard = entry.value().lock().await;
            let before = guard.in_flight.len();
            guard.in_flight.retain(|nonce, pending| {
                let keep = pending.deadline_ms > now_ms;
                if !keep {
                    warn!(
                        "nonce {} pending past deadline (tx {:?}) — evicting",
                        nonce, pending.tx_hash
                    );
                }
                keep
            });
            evicted += before - guard.in_flight.len();
        }
        evicted
    }

    /// Periodic sweeper until shutdown.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(Duration::from_millis(30_000));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let evicted = self.sweep_expired(crate::types::now_ms()).await;
                    if evicted > 0 {
                        info!("nonce sweeper evicted {} expired entries", evicted);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::rpc::mock::MockRpc;
    use std::sync::atomic::Ordering;

    fn wallet() -> Address {
        Address::repeat_byte(0xaa)
    }

    fn manager(pool_size: usize, rpc: Arc<MockRpc>) -> Arc<NonceManager> {
        Arc::new(NonceManager::new(
            NonceConfig {
                pool_size,
                replenish_threshold: 2,
                sync_interval_ms: 30_000,
                pending_timeout_ms: 300_000,
            },
            rpc,
        ))
    }

    #[tokio::test]
    async fn test_pool_burst_without_rpc() {
        let rpc = Arc::new(MockRpc::new(100));
        let manager = manager(5, Arc::clone(&rpc));
        manager.prefill(Chain::Ethereum, wallet(), 0).await.unwrap();
        let after_prefill = rpc.tx_count_calls.load(Ordering::SeqCst);
        assert_eq!(after_prefill, 1);

        // Five allocations drain the pool — nonces 100..104, no extra sync
        // needed for the values themselves.
        let mut got = Vec::new();
        for _ in 0..5 {
            got.push(
                manager
                    .next_nonce(Chain::Ethereum, wallet(), 1_000)
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(got, vec![100, 101, 102, 103, 104]);
        assert_eq!(
            manager.in_flight_count(Chain::Ethereum, wallet()).await,
            5
        );

        // Background replenish was kicked when the pool hit the threshold.
        rpc.tx_count.store(105, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let state = manager.state(Chain::Ethereum, wallet());
        let guard = state.lock().await;
        assert!(!guard.pool.is_empty(), "pool should have been replenished");
        assert!(guard.pool.iter().all(|n| *n >= 105));
    }

    #[tokio::test]
    async fn test_no_duplicate_nonces_under_concurrency() {
        let rpc = Arc::new(MockRpc::new(50));
        let manager = manager(5, rpc);
        manager.prefill(Chain::Base, wallet(), 0).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let m = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                m.next_nonce(Chain::Base, wallet(), 1_000).await.unwrap()
            }));
        }
        let mut nonces = Vec::new();
        for h in handles {
            nonces.push(h.await.unwrap());
        }
        let mut deduped = nonces.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(deduped.len(), nonces.len(), "duplicate nonce issued");
    }

    #[tokio::test]
    async fn test_disabled_pool_syncs_and_bumps() {
        let rpc = Arc::new(MockRpc::new(7));
        let manager = manager(0, Arc::clone(&rpc));
        // Pool disabled: pre-pool behavior.
        assert_eq!(
            manager
                .next_nonce(Chain::Ethereum, wallet(), 100_000)
                .await
                .unwrap(),
            7
        );
        assert_eq!(
            manager
                .next_nonce(Chain::Ethereum, wallet(), 100_001)
                .await
                .unwrap(),
            8
        );
        // One sync inside the interval.
        assert_eq!(rpc.tx_count_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_unsent_nonce_reused() {
        let rpc = Arc::new(MockRpc::new(10));
        let manager = manager(5, rpc);
        manager.prefill(Chain::Ethereum, wallet(), 0).await.unwrap();
        let nonce = manager
            .next_nonce(Chain::Ethereum, wallet(), 1_000)
            .await
            .unwrap();
        assert_eq!(nonce, 10);
        manager
            .on_failed(Chain::Ethereum, wallet(), nonce, false)
            .await;
        // Never hit the mempool → the same nonce comes straight back.
        assert_eq!(
            manager
                .next_nonce(Chain::Ethereum, wallet(), 1_001)
                .await
                .unwrap(),
            10
        );
    }

    #[tokio::test]
    async fn test_confirmed_advances_and_clears() {
        let rpc = Arc::new(MockRpc::new(10));
        let manager = manager(5, rpc);
        manager.prefill(Chain::Ethereum, wallet(), 0).await.unwrap();
        let nonce = manager
            .next_nonce(Chain::Ethereum, wallet(), 1_000)
            .await
            .unwrap();
        manager
            .on_submitted(Chain::Ethereum, wallet(), nonce, "0xabc")
            .await;
        manager.on_confirmed(Chain::Ethereum, wallet(), nonce).await;
        assert_eq!(manager.in_flight_count(Chain::Ethereum, wallet()).await, 0);
    }

    #[tokio::test]
    async fn test_sweeper_evicts_expired_pending() {
        let rpc = Arc::new(MockRpc::new(10));
        let manager = manager(5, rpc);
        manager.prefill(Chain::Ethereum, wallet(), 0).await.unwrap();
        manager
            .next_nonce(Chain::Ethereum, wallet(), 1_000)
            .await
            .unwrap();
        assert_eq!(manager.sweep_expired(1_000 + 299_999).await, 0);
        assert_eq!(manager.sweep_expired(1_000 + 300_001).await, 1);
        assert_eq!(manager.in_flight_count(Chain::Ethereum, wallet()).await, 0);
    }
}
