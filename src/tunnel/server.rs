//! Server side of the reverse-tunnel control plane: one `TunnelControlServer`
//! per configured listener, implementing `LifecycleEntity`.

use crate::config::TunnelServerConfig;
use crate::lifecycle::LifecycleEntity;
use crate::tunnel::data_plane::TunnelDataPlane;
use crate::tunnel::frame::{self, is_data_connection_frame, ControlMessage};
use crate::tunnel::registry::{ServiceRegistry, ServiceStatus, TunnelService};
use crate::tunnel::session::TunnelClientSession;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{info, warn};

const HEARTBEAT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);
const FIRST_FRAME_DEADLINE: Duration = Duration::from_secs(30);

/// One visitor-facing accept loop bound to a registered service's
/// `remote_port`, torn down on unregister/session removal/server stop.
struct ServiceListener {
    handle: tokio::task::JoinHandle<()>,
    shutdown: Arc<Notify>,
}

pub struct TunnelControlServer {
    config: ArcSwap<TunnelServerConfig>,
    sessions: Arc<DashMap<String, Arc<TunnelClientSession>>>,
    registry: Arc<ServiceRegistry>,
    data_plane: Arc<TunnelDataPlane>,
    service_listeners: DashMap<String, ServiceListener>,
    running: AtomicBool,
    shutdown: Arc<Notify>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    connections_total: AtomicU64,
}

impl TunnelControlServer {
    pub fn data_plane(&self) -> &Arc<TunnelDataPlane> {
        &self.data_plane
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn service_count(&self) -> usize {
        self.registry.len()
    }

    pub fn connections_total(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    pub fn active_session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    async fn accept_loop(self: Arc<Self>) {
        let cfg = self.config.load();
        let addr = format!("{}:{}", cfg.listen_address, cfg.listen_port);
        drop(cfg);

        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                warn!("tunnel: server: bind failed, addr={}, error={}", addr, e);
                return;
            }
        };
        info!("tunnel: server: listening, addr={}", addr);

        loop {
            let accepted = tokio::select! {
                res = tokio::time::timeout(Duration::from_secs(1), listener.accept()) => res,
                _ = self.shutdown.notified() => {
                    info!("tunnel: server: accept loop stopping, addr={}", addr);
                    return;
                }
            };

            let Ok(accepted) = accepted else { continue };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("tunnel: server: accept error, error={}", e);
                    continue;
                }
            };

            self.connections_total.fetch_add(1, Ordering::Relaxed);
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.handle_connection(stream, peer).await;
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, mut stream: TcpStream, peer: std::net::SocketAddr) {
        let first = match tokio::time::timeout(FIRST_FRAME_DEADLINE, frame::read_frame(&mut stream))
            .await
        {
            Ok(Ok(msg)) => msg,
            Ok(Err(e)) => {
                warn!("tunnel: server: first frame read failed, peer={}, error={}", peer, e);
                return;
            }
            Err(_) => {
                warn!("tunnel: server: first frame deadline exceeded, peer={}", peer);
                return;
            }
        };

        if let Some(connection_id) = is_data_connection_frame(&first) {
            if !self.data_plane.deliver(&connection_id, stream) {
                warn!(
                    "tunnel: server: data connection had no waiter, connection_id={}",
                    connection_id
                );
            }
            return;
        }

        self.handle_control_connection(stream, peer, first).await;
    }

    async fn handle_control_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: std::net::SocketAddr,
        first: ControlMessage,
    ) {
        if first.msg_type != "auth" {
            warn!("tunnel: server: expected auth frame first, peer={}", peer);
            return;
        }
        let Some(client_id) = first.data.get("clientId").and_then(|v| v.as_str()) else {
            warn!("tunnel: server: auth frame missing clientId, peer={}", peer);
            return;
        };
        let token = first.data.get("token").and_then(|v| v.as_str()).unwrap_or("");
        let expected_token = self.config.load().auth_token.clone();
        if token != expected_token {
            warn!("tunnel: server: auth failed, client_id={}, peer={}", client_id, peer);
            return;
        }

        let (rd, wr) = stream.into_split();
        let (outbox_tx, mut outbox_rx) = tokio::sync::mpsc::unbounded_channel::<ControlMessage>();
        let session = Arc::new(TunnelClientSession::new(client_id.to_string(), outbox_tx));
        session.mark_authenticated();

        // Duplicate-client takeover: close the old session's socket
        // asynchronously so the new auth path never blocks on it.
        if let Some((_, old)) = self.sessions.remove(client_id) {
            tokio::spawn(async move {
                old.force_close();
            });
        }
        self.sessions.insert(client_id.to_string(), Arc::clone(&session));
        info!("tunnel: server: session authenticated, client_id={}", client_id);
        metrics::gauge!("gateway_tunnel_sessions_active", "server" => self.config.load().id.clone())
            .set(self.sessions.len() as f64);

        let writer_closed = Arc::clone(&session.closed);
        let writer_task = tokio::spawn(async move {
            let mut wr = wr;
            loop {
                tokio::select! {
                    msg = outbox_rx.recv() => {
                        match msg {
                            Some(msg) => {
                                if frame::write_frame(&mut wr, &msg).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = writer_closed.notified() => break,
                }
            }
            let _ = tokio::io::AsyncWriteExt::shutdown(&mut wr).await;
        });

        let _ = session.send(ControlMessage::new(
            "response",
            serde_json::json!({"success": true, "type": "auth"}),
        ));

        let mut rd = rd;
        loop {
            let heartbeat_timeout =
                Duration::from_secs(self.config.load().heartbeat_timeout_secs);

            tokio::select! {
                frame_res = tokio::time::timeout(heartbeat_timeout, frame::read_frame(&mut rd)) => {
                    match frame_res {
                        Ok(Ok(msg)) => {
                            session.touch();
                            Arc::clone(&self).dispatch(&session, msg).await;
                        }
                        Ok(Err(e)) => {
                            info!("tunnel: server: control read ended, client_id={}, error={}", client_id, e);
                            break;
                        }
                        Err(_) => {
                            info!("tunnel: server: heartbeat timeout, client_id={}", client_id);
                            break;
                        }
                    }
                }
                _ = session.closed.notified() => {
                    info!("tunnel: server: session force-closed, client_id={}", client_id);
                    break;
                }
            }
        }

        session.force_close();
        writer_task.abort();
        self.remove_session(client_id).await;
    }

    async fn dispatch(self: Arc<Self>, session: &Arc<TunnelClientSession>, msg: ControlMessage) {
        metrics::counter!("gateway_tunnel_frames_total", "type" => msg.msg_type.clone()).increment(1);
        match msg.msg_type.as_str() {
            "heartbeat" => {
                let _ = session.send(ControlMessage::new(
                    "response",
                    serde_json::json!({"success": true, "type": "heartbeat"}),
                ));
            }
            "register_service" => self.handle_register(session, msg).await,
            "unregister_service" => self.handle_unregister(session, msg).await,
            other => {
                warn!("tunnel: server: unknown frame type, type={}", other);
                let _ = session.send(ControlMessage::new(
                    "response",
                    serde_json::json!({"success": false, "error": format!("unknown type: {other}")}),
                ));
            }
        }
    }

    /// Bind a visitor-facing TCP listener on `remote_port` for `service_name`
    /// and splice each accepted connection through the owning agent via
    /// `TunnelDataPlane::open_and_splice`. Replaces any prior listener for
    /// the same service (re-registration with a new port).
    async fn start_service_listener(self: Arc<Self>, service_name: String, remote_port: u16) {
        self.stop_service_listener(&service_name).await;

        let listen_addr = format!("{}:{}", self.config.load().listen_address, remote_port);
        let listener = match TcpListener::bind(&listen_addr).await {
            Ok(l) => l,
            Err(e) => {
                warn!(
                    "tunnel: server: visitor listener bind failed, service={}, addr={}, error={}",
                    service_name, listen_addr, e
                );
                return;
            }
        };
        info!(
            "tunnel: server: visitor listener started, service={}, addr={}",
            service_name, listen_addr
        );

        let listener_shutdown = Arc::new(Notify::new());
        let this = Arc::clone(&self);
        let name = service_name.clone();
        let shutdown_for_task = Arc::clone(&listener_shutdown);
        let handle = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    res = tokio::time::timeout(Duration::from_secs(1), listener.accept()) => res,
                    _ = shutdown_for_task.notified() => return,
                };
                let Ok(accepted) = accepted else { continue };
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("tunnel: server: visitor accept error, error={}", e);
                        continue;
                    }
                };
                let server = Arc::clone(&this);
                let service_name = name.clone();
                tokio::spawn(async move {
                    server.serve_visitor(&service_name, stream, peer).await;
                });
            }
        });

        self.service_listeners.insert(
            service_name,
            ServiceListener {
                handle,
                shutdown: listener_shutdown,
            },
        );
    }

    async fn stop_service_listener(&self, service_name: &str) {
        if let Some((_, listener)) = self.service_listeners.remove(service_name) {
            listener.shutdown.notify_waiters();
            listener.handle.abort();
        }
    }

    /// One accepted visitor connection: look up the service's owning
    /// session and ask its agent to dial a matching data connection.
    async fn serve_visitor(&self, service_name: &str, stream: TcpStream, peer: std::net::SocketAddr) {
        let Some(service) = self.registry.get(service_name) else {
            warn!(
                "tunnel: server: visitor arrived for unknown service, service={}",
                service_name
            );
            return;
        };
        let Some(session) = self.sessions.get(&service.agent_id).map(|e| e.value().clone()) else {
            warn!(
                "tunnel: server: visitor arrived with no owning session, service={}",
                service_name
            );
            return;
        };

        let wait_timeout = Duration::from_secs(self.config.load().data_connect_timeout_secs);
        if let Err(e) = self
            .data_plane
            .open_and_splice(&session, service_name, stream, wait_timeout)
            .await
        {
            if e.kind() != std::io::ErrorKind::UnexpectedEof {
                warn!(
                    "tunnel: server: visitor splice failed, service={}, peer={}, error={}",
                    service_name, peer, e
                );
            }
        }
    }

    async fn handle_register(self: Arc<Self>, session: &Arc<TunnelClientSession>, msg: ControlMessage) {
        let Some(svc_json) = msg.data.get("service") else {
            let _ = session.send(ControlMessage::new(
                "response",
                serde_json::json!({"success": false, "error": "missing service"}),
            ));
            return;
        };

        let mut service: TunnelService = match serde_json::from_value(svc_json.clone()) {
            Ok(s) => s,
            Err(e) => {
                let _ = session.send(ControlMessage::new(
                    "response",
                    serde_json::json!({"success": false, "error": format!("bad service payload: {e}")}),
                ));
                return;
            }
        };
        service.status = ServiceStatus::Active;

        match self.registry.register(service, &session.client_id) {
            Ok(registered) => {
                session.add_service(&registered.name);
                if let Some(port) = registered.remote_port {
                    Arc::clone(&self)
                        .start_service_listener(registered.name.clone(), port)
                        .await;
                }
                let _ = session.send(ControlMessage::new(
                    "response",
                    serde_json::json!({
                        "success": true,
                        "serviceId": registered.id,
                        "remotePort": registered.remote_port,
                    }),
                ));
            }
            Err(e) => {
                let _ = session.send(ControlMessage::new(
                    "response",
                    serde_json::json!({"success": false, "error": e}),
                ));
            }
        }
    }

    async fn handle_unregister(&self, session: &Arc<TunnelClientSession>, msg: ControlMessage) {
        let Some(name) = msg.data.get("name").and_then(|v| v.as_str()) else {
            let _ = session.send(ControlMessage::new(
                "response",
                serde_json::json!({"success": false, "error": "missing name"}),
            ));
            return;
        };

        let owned = self
            .registry
            .get_by_agent_and_name(&session.client_id, name)
            .is_some();
        let removed = owned && self.registry.unregister(name);
        if removed {
            session.remove_service(name);
            self.stop_service_listener(name).await;
        }
        let _ = session.send(ControlMessage::new(
            "response",
            serde_json::json!({"success": removed}),
        ));
    }

    /// Collect a session's services under its own lock, release, then
    /// unregister each from the shared registry outside that lock.
    async fn remove_session(&self, client_id: &str) {
        let Some((_, session)) = self.sessions.remove(client_id) else {
            return;
        };
        let names = session.drain_services();
        for name in names {
            self.registry.unregister(&name);
            self.stop_service_listener(&name).await;
        }
        info!("tunnel: server: session removed, client_id={}", client_id);
        metrics::gauge!("gateway_tunnel_sessions_active", "server" => self.config.load().id.clone())
            .set(self.sessions.len() as f64);
        metrics::gauge!("gateway_tunnel_services_registered", "server" => self.config.load().id.clone())
            .set(self.registry.len() as f64);
    }

    fn heartbeat_sweeper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(HEARTBEAT_SWEEP_INTERVAL) => {}
                    _ = self.shutdown.notified() => return,
                }
                let timeout = Duration::from_secs(self.config.load().heartbeat_timeout_secs);
                for entry in self.sessions.iter() {
                    if entry.value().idle_for() > timeout {
                        warn!(
                            "tunnel: server: heartbeat sweep force-closing stale session, client_id={}",
                            entry.key()
                        );
                        entry.value().force_close();
                    }
                }
            }
        })
    }
}

impl LifecycleEntity for TunnelControlServer {
    type Config = TunnelServerConfig;

    fn from_config(config: Self::Config) -> Self {
        let port_range = config.remote_port_range_start..=config.remote_port_range_end;
        Self {
            config: ArcSwap::new(Arc::new(config)),
            sessions: Arc::new(DashMap::new()),
            registry: Arc::new(ServiceRegistry::new(port_range)),
            data_plane: Arc::new(TunnelDataPlane::new()),
            service_listeners: DashMap::new(),
            running: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
            tasks: Mutex::new(Vec::new()),
            connections_total: AtomicU64::new(0),
        }
    }

    fn swap_config(&self, config: Self::Config) {
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
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let accept_handle = tokio::spawn(Arc::clone(&self).accept_loop());
        let sweep_handle = Arc::clone(&self).heartbeat_sweeper();
        *self.tasks.lock().unwrap() = vec![accept_handle, sweep_handle];
        info!("tunnel: server: started, id={}", self.config.load().id);
    }

    async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shutdown.notify_waiters();

        let sessions: Vec<Arc<TunnelClientSession>> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        for session in sessions {
            session.force_close();
        }

        let service_names: Vec<String> = self
            .service_listeners
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for name in service_names {
            self.stop_service_listener(&name).await;
        }

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }
        info!("tunnel: server: stopped, id={}", self.config.load().id);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}
