//! Health surface: derived service status, a minimal HTTP endpoint, and
//! periodic heartbeats onto the health stream.
//!
//! Status starts at `starting` until initialization completes and at least
//! one successful cycle has run; `degraded` while any subsystem is in
//! retry/rate-limited/provider-down state; `unhealthy` only when the
//! service cannot make forward progress.

use crate::bus::{streams, BatchingProducer};
use crate::stats::CoreStats;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

const HEARTBEAT_INTERVAL_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Starting,
    Healthy,
    Degraded,
    Unhealthy,
}

pub struct HealthState {
    started: AtomicBool,
    first_cycle_done: AtomicBool,
    stalled: AtomicBool,
    /// subsystem → reason, while degraded.
    degraded: DashMap<String, String>,
    stats: Arc<CoreStats>,
}

impl HealthState {
    pub fn new(stats: Arc<CoreStats>) -> Self {
        Self {
            started: AtomicBool::new(false),
            first_cycle_done: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
            degraded: DashMap::new(),
            stats,
        }
    }

    /// Initialization finished (components constructed, groups created).
    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    /// First successful end-to-end cycle.
    pub fn mark_cycle(&self) {
        self.first_cycle_done.store(true, Ordering::SeqCst);
    }

    pub fn mark_degraded(&self, subsystem: &str, reason: &str) {
        self.degraded
            .insert(subsystem.to_string(), reason.to_string());
    }

    pub fn clear_degraded(&self, subsystem: &str) {
        self.degraded.remove(subsystem);
    }

    /// No forward progress possible (e.g. bus lost beyond retry budget).
    pub fn mark_stalled(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    pub fn status(&self) -> HealthStatus {
        if self.stalled.load(Ordering::SeqCst) {
            return HealthStatus::Unhealthy;
        }
        if !self.started.load(Ordering::SeqCst) || !self.first_cycle_done.load(Ordering::SeqCst) {
            return HealthStatus::Starting;
        }
        if self.degraded.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        }
    }

    pub fn body(&self) -> String {
        let subsystems: std::collections::HashMap<String, String> = self
            .degraded
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        json!({
            "status": self.status(),
            "details": {
                "degraded_subsystems": subsystems,
                "stats": self.stats.snapshot(),
            }
        })
        .to_string()
    }
}

/// Minimal HTTP listener: `GET /health` returns the status body, anything
/// else gets 404. One connection at a time is plenty for an operator probe.
pub async fn run_health_server(
    addr: String,
    state: Arc<HealthState>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!("health endpoint listening on {}", addr);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((mut socket, _peer)) = accepted else { continue };
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let mut buf = [0u8; 1_024];
                    let n = match socket.read(&mut buf).await {
                        Ok(n) => n,
                        Err(_) => return,
                    };
                    let request = String::from_utf8_lossy(&buf[..n]);
                    let (status_line, body) = if request.starts_with("GET /health") {
                        ("HTTP/1.1 200 OK", state.body())
                    } else {
                        ("HTTP/1.1 404 Not Found", "{}".to_string())
                    };
                    let response = format!(
                        "{}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status_line,
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

/// Periodic heartbeat onto the health stream for the coordinator.
pub async fn run_heartbeat(
    service: String,
    state: Arc<HealthState>,
    producer: Arc<BatchingProducer>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let payload = json!({
                    "service": service,
                    "status": state.status(),
                    "ts_ms": crate::types::now_ms(),
                });
                let fields = vec![
                    ("data".to_string(), payload.to_string()),
                    ("service".to_string(), service.clone()),
                ];
                if !producer.publish(streams::HEALTH, fields).await {
                    warn!("heartbeat publish failed: producer stopped");
                    return;
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
