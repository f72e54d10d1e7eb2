//! Health probing for static-forwarder nodes: tcp connect check or http(s)
//! GET, same threshold/streak bookkeeping as `upstream::health` but against
//! a plain node list instead of a `Cluster`.

use crate::config::{ForwarderNodeConfig, StaticForwarderServerConfig};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

pub struct ForwarderNodeHealth {
    healthy: DashMap<String, bool>,
    streak: DashMap<String, AtomicU32>,
}

impl Default for ForwarderNodeHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl ForwarderNodeHealth {
    pub fn new() -> Self {
        Self {
            healthy: DashMap::new(),
            streak: DashMap::new(),
        }
    }

    pub fn is_healthy(&self, node_id: &str) -> bool {
        self.healthy.get(node_id).map(|v| *v).unwrap_or(true)
    }

    fn record(&self, node_id: &str, healthy: bool, threshold: u32) -> bool {
        let entry = self
            .streak
            .entry(node_id.to_string())
            .or_insert_with(|| AtomicU32::new(0));
        let count = entry.value().fetch_add(1, Ordering::Relaxed) + 1;
        if count >= threshold {
            self.healthy.insert(node_id.to_string(), healthy);
            self.streak.insert(node_id.to_string(), AtomicU32::new(0));
            true
        } else {
            false
        }
    }
}

/// Run one probe round across `nodes`, updating `health` in place.
pub async fn run_once(
    cfg: &StaticForwarderServerConfig,
    nodes: &[ForwarderNodeConfig],
    health: &Arc<ForwarderNodeHealth>,
) {
    for node in nodes {
        let healthy = match cfg.health_check_type.as_str() {
            "tcp" => probe_tcp(node, cfg.health_check_timeout_secs).await,
            "http" | "https" => probe_http(cfg, node).await,
            other => {
                warn!("forwarder: health: unknown check type, type={}", other);
                true
            }
        };

        let threshold = 1;
        let transitioned = health.record(&node.node_id, healthy, threshold);
        metrics::gauge!(
            "gateway_forwarder_node_health",
            "forwarder" => cfg.server_id.clone(),
            "node" => node.node_id.clone(),
        )
        .set(if healthy { 1.0 } else { 0.0 });
        if transitioned {
            debug!(
                "forwarder: health: node transitioned, node_id={}, healthy={}",
                node.node_id, healthy
            );
        }
    }
}

async fn probe_tcp(node: &ForwarderNodeConfig, timeout_secs: u64) -> bool {
    let addr = format!("{}:{}", node.target_address, node.target_port);
    tokio::time::timeout(Duration::from_secs(timeout_secs), TcpStream::connect(&addr))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}

async fn probe_http(cfg: &StaticForwarderServerConfig, node: &ForwarderNodeConfig) -> bool {
    let scheme = if cfg.health_check_type == "https" { "https" } else { "http" };
    let url = cfg.health_check_url.clone().unwrap_or_else(|| {
        format!("{}://{}:{}/", scheme, node.target_address, node.target_port)
    });

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(cfg.health_check_timeout_secs))
        .no_proxy()
        .build()
    {
        Ok(c) => c,
        Err(_) => return false,
    };

    match client.get(&url).send().await {
        Ok(resp) => resp.status().is_success() || resp.status().is_redirection(),
        Err(_) => false,
    }
}
