//! `StaticForwarder`: one TCP or UDP forwarding listener, load-balancing
//! across a fixed node list the same way a `Cluster` load-balances across
//! upstream nodes, minus HTTP-specific concerns (circuit breaker, path
//! rewriting). `select_healthy` skips nodes `ForwarderNodeHealth` has marked
//! down, mirroring `proxy::handler::select_healthy_node`'s skip loop.

use crate::config::{ForwarderNodeConfig, StaticForwarderServerConfig, UpstreamNode};
use crate::forwarder::health::ForwarderNodeHealth;
use crate::forwarder::{tcp, udp};
use crate::lifecycle::LifecycleEntity;
use crate::upstream::loadbalance::{LoadBalancer, RequestGuard};
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub struct StaticForwarder {
    config: ArcSwap<StaticForwarderServerConfig>,
    pub lb: Arc<LoadBalancer>,
    pub health: Arc<ForwarderNodeHealth>,

    pub total_connections: AtomicU64,
    pub current_connections: AtomicI64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,

    running: AtomicBool,
    shutdown: Arc<Notify>,
    tasks: RwLock<Vec<JoinHandle<()>>>,
}

fn to_upstream_nodes(nodes: &[ForwarderNodeConfig]) -> Vec<UpstreamNode> {
    nodes
        .iter()
        .map(|n| {
            let mut metadata = std::collections::HashMap::new();
            metadata.insert("node_id".to_string(), n.node_id.clone());
            UpstreamNode {
                host: n.target_address.clone(),
                port: n.target_port,
                weight: n.weight,
                metadata,
                target_path: None,
            }
        })
        .collect()
}

impl StaticForwarder {
    pub fn config(&self) -> Arc<StaticForwarderServerConfig> {
        self.config.load_full()
    }

    pub fn id(&self) -> String {
        self.config.load().server_id.clone()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.config.load().connection_timeout_secs)
    }

    /// Select a node, skipping any `ForwarderNodeHealth` has marked down.
    /// Bounded by the configured node count so an all-unhealthy forwarder
    /// gives up instead of looping forever; returns `None` in that case.
    pub fn select_healthy(&self) -> Option<RequestGuard> {
        let max_attempts = self.config.load().nodes.len().max(1);
        for _ in 0..max_attempts {
            let guard = self.lb.select()?;
            let node_id = guard.instance.metadata.get("node_id");
            let healthy = node_id.map(|id| self.health.is_healthy(id)).unwrap_or(true);
            if healthy {
                return Some(guard);
            }
            debug!(
                "forwarder: select: skipping unhealthy node, node_id={:?}",
                node_id
            );
        }
        None
    }

    async fn health_loop(self: Arc<Self>) {
        loop {
            let cfg = self.config.load_full();
            let interval = Duration::from_secs(cfg.health_check_interval_secs.max(1));
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.shutdown.notified() => return,
            }
            crate::forwarder::health::run_once(&cfg, &cfg.nodes, &self.health).await;
        }
    }
}

impl LifecycleEntity for StaticForwarder {
    type Config = StaticForwarderServerConfig;

    fn from_config(config: Self::Config) -> Self {
        let lb = LoadBalancer::new(&config.load_balance_type);
        lb.update_instances(&to_upstream_nodes(&config.nodes));
        Self {
            config: ArcSwap::from_pointee(config),
            lb,
            health: Arc::new(ForwarderNodeHealth::new()),
            total_connections: AtomicU64::new(0),
            current_connections: AtomicI64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            running: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
            tasks: RwLock::new(Vec::new()),
        }
    }

    fn swap_config(&self, config: Self::Config) {
        self.lb.update_instances(&to_upstream_nodes(&config.nodes));
        self.config.store(Arc::new(config));
    }

    fn listen_address(&self) -> String {
        self.config.load().listen_address.clone()
    }

    fn listen_port(&self) -> u16 {
        self.config.load().listen_port
    }

    fn listen_of(config: &Self::Config) -> (String, u16) {
        (config.listen_address.clone(), config.listen_port)
    }

    async fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            "forwarder: starting, id={}, type={}, addr={}:{}",
            self.id(),
            self.config.load().server_type,
            self.listen_address(),
            self.listen_port()
        );

        let accept_handle = match self.config.load().server_type.as_str() {
            "udp" => tokio::spawn(udp::run(Arc::clone(&self))),
            _ => tokio::spawn(tcp::run(Arc::clone(&self))),
        };
        let health_handle = tokio::spawn(Arc::clone(&self).health_loop());

        let mut tasks = self.tasks.write().await;
        tasks.push(accept_handle);
        tasks.push(health_handle);
    }

    async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("forwarder: stopping, id={}", self.id());
        self.shutdown.notify_waiters();

        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.write().await;
            std::mem::take(&mut *tasks)
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl StaticForwarder {
    pub fn shutdown_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }
}
