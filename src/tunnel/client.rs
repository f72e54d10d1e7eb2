//! Agent-side tunnel client: connects outbound to an edge's control port,
//! authenticates, registers locally configured services, and answers
//! `open_data_connection` requests by splicing to the local service.

use crate::tunnel::frame::{self, ControlMessage};
use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentServiceConfig {
    pub name: String,
    pub local_address: String,
    pub local_port: u16,
    #[serde(default)]
    pub remote_port: Option<u16>,
    #[serde(default)]
    pub custom_domains: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub server_address: String,
    pub server_port: u16,
    pub client_id: String,
    pub auth_token: String,

    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,

    /// 0 = infinite.
    #[serde(default)]
    pub max_retries: u32,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_data_connect_timeout_secs")]
    pub data_connect_timeout_secs: u64,

    #[serde(default)]
    pub services: Vec<AgentServiceConfig>,
}

fn default_retry_interval_secs() -> u64 {
    5
}

fn default_heartbeat_interval_secs() -> u64 {
    20
}

fn default_data_connect_timeout_secs() -> u64 {
    10
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading agent config at {}", path.display()))?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)?,
            Some("json") => serde_json::from_str(&content)?,
            _ => anyhow::bail!("unsupported agent config format, use .toml or .json"),
        };
        Ok(config)
    }

    fn server_addr(&self) -> String {
        format!("{}:{}", self.server_address, self.server_port)
    }
}

pub struct TunnelClient {
    config: AgentConfig,
    shutdown: Arc<Notify>,
}

impl TunnelClient {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Connect-serve-reconnect loop with decorrelated jitter backoff.
    pub async fn run(&self) {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match self.connect_and_serve().await {
                Ok(()) => info!("agent: tunnel: control connection closed cleanly"),
                Err(e) => warn!("agent: tunnel: control connection failed, error={}", e),
            }

            if self.config.max_retries != 0 && attempt >= self.config.max_retries {
                warn!("agent: tunnel: max retries reached, giving up");
                return;
            }

            let base = self.config.retry_interval_secs.max(1);
            let lo = (base * 1000) / 2;
            let hi = (base * 1000 * 3) / 2;
            let jitter_ms = rand::thread_rng().gen_range(lo..=hi);
            let delay = Duration::from_millis(jitter_ms);

            info!("agent: tunnel: reconnecting, attempt={}, delay_ms={}", attempt + 1, jitter_ms);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.notified() => return,
            }
        }
    }

    async fn connect_and_serve(&self) -> Result<()> {
        let addr = self.config.server_addr();
        let mut stream = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("dialing tunnel server at {addr}"))?;
        info!("agent: tunnel: connected, addr={}", addr);

        let auth = ControlMessage::new(
            "auth",
            serde_json::json!({"clientId": self.config.client_id, "token": self.config.auth_token}),
        );
        frame::write_frame(&mut stream, &auth).await?;

        let resp = tokio::time::timeout(Duration::from_secs(10), frame::read_frame(&mut stream))
            .await
            .context("timed out waiting for auth response")??;
        let ok = resp.data.get("success").and_then(|v| v.as_bool()).unwrap_or(false);
        if !ok {
            anyhow::bail!("auth rejected by tunnel server");
        }
        info!("agent: tunnel: authenticated, client_id={}", self.config.client_id);

        let (rd, wr) = stream.into_split();
        let (outbox_tx, mut outbox_rx) = tokio::sync::mpsc::unbounded_channel::<ControlMessage>();

        let writer_task = tokio::spawn(async move {
            let mut wr = wr;
            while let Some(msg) = outbox_rx.recv().await {
                if frame::write_frame(&mut wr, &msg).await.is_err() {
                    break;
                }
            }
        });

        for service in &self.config.services {
            let msg = ControlMessage::new(
                "register_service",
                serde_json::json!({"service": {
                    "id": "",
                    "agentId": self.config.client_id,
                    "name": service.name,
                    "localAddress": service.local_address,
                    "localPort": service.local_port,
                    "remotePort": service.remote_port,
                    "customDomains": service.custom_domains,
                    "status": "active",
                }}),
            );
            let _ = outbox_tx.send(msg);
        }

        let heartbeat_tx = outbox_tx.clone();
        let heartbeat_interval = Duration::from_secs(self.config.heartbeat_interval_secs);
        let heartbeat_shutdown = Arc::clone(&self.shutdown);
        let heartbeat_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(heartbeat_interval) => {
                        if heartbeat_tx.send(ControlMessage::new("heartbeat", serde_json::json!({}))).is_err() {
                            return;
                        }
                    }
                    _ = heartbeat_shutdown.notified() => return,
                }
            }
        });

        let mut rd = rd;
        let result = loop {
            tokio::select! {
                frame_res = frame::read_frame(&mut rd) => {
                    match frame_res {
                        Ok(msg) => self.handle_frame(msg, &outbox_tx).await,
                        Err(e) => break Err(anyhow::Error::from(e)),
                    }
                }
                _ = self.shutdown.notified() => break Ok(()),
            }
        };

        heartbeat_task.abort();
        writer_task.abort();
        result
    }

    async fn handle_frame(
        &self,
        msg: ControlMessage,
        outbox_tx: &tokio::sync::mpsc::UnboundedSender<ControlMessage>,
    ) {
        match msg.msg_type.as_str() {
            "response" => {}
            "open_data_connection" => {
                let Some(connection_id) = msg.data.get("connectionId").and_then(|v| v.as_str())
                else {
                    return;
                };
                let Some(service_name) = msg.data.get("service").and_then(|v| v.as_str()) else {
                    return;
                };
                let Some(service) = self
                    .config
                    .services
                    .iter()
                    .find(|s| s.name == service_name)
                    .cloned()
                else {
                    warn!("agent: tunnel: unknown service requested, name={}", service_name);
                    return;
                };
                let server_addr = self.config.server_addr();
                let connection_id = connection_id.to_string();
                let timeout = Duration::from_secs(self.config.data_connect_timeout_secs);
                tokio::spawn(async move {
                    if let Err(e) =
                        open_data_connection(&server_addr, &connection_id, &service, timeout).await
                    {
                        warn!("agent: tunnel: data connection failed, error={}", e);
                    }
                });
            }
            other => {
                let _ = outbox_tx.send(ControlMessage::new(
                    "response",
                    serde_json::json!({"success": false, "error": format!("unhandled type: {other}")}),
                ));
            }
        }
    }
}

async fn open_data_connection(
    server_addr: &str,
    connection_id: &str,
    service: &AgentServiceConfig,
    timeout: Duration,
) -> Result<()> {
    let mut data_stream = tokio::time::timeout(timeout, TcpStream::connect(server_addr))
        .await
        .context("timed out dialing data connection")??;

    let handshake = ControlMessage::new(
        "data_connection",
        serde_json::json!({"connectionId": connection_id}),
    );
    frame::write_frame(&mut data_stream, &handshake).await?;

    let local_addr = format!("{}:{}", service.local_address, service.local_port);
    let local_stream = tokio::time::timeout(timeout, TcpStream::connect(&local_addr))
        .await
        .with_context(|| format!("timed out dialing local service at {local_addr}"))??;

    let (_result, err) = crate::forwarder::splice::splice(data_stream, local_stream).await;
    if let Some(e) = err {
        if e.kind() != std::io::ErrorKind::UnexpectedEof {
            return Err(e.into());
        }
    }
    Ok(())
}
