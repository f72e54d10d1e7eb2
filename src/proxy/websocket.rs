//! WebSocket upgrade detection and bidirectional splice between a hijacked
//! client connection and an outbound WebSocket dialed at the selected node.

use crate::proxy::context::{full_body, BoxBody, RequestContext};
use crate::proxy::handler::select_healthy_node;
use crate::proxy::header_rewrite::{self, ForwardedProto};
use crate::proxy::path_rewrite::rewrite_path;
use crate::upstream::Cluster;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use http::header::{CONNECTION, UPGRADE};
use http::{Request, StatusCode};
use hyper::body::Incoming;
use hyper::Response;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Live WebSocket pairs, keyed by a monotonic connection id, for shutdown
/// introspection — mirrors the tunnel session registry's `DashMap` choice.
/// Owned by `GatewayState` rather than a process-wide static, consistent
/// with the rest of the codebase's instance-owned registries.
#[derive(Clone, Default)]
pub struct WebSocketRegistry {
    live: Arc<DashMap<u64, Arc<str>>>,
    next_id: Arc<AtomicU64>,
}

impl WebSocketRegistry {
    pub fn new() -> Self {
        Self {
            live: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn active_count(&self) -> usize {
        self.live.len()
    }

    fn insert(&self, node_addr: &str) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.live.insert(id, Arc::from(node_addr));
        id
    }

    fn remove(&self, id: u64) {
        self.live.remove(&id);
    }
}

/// Detect a valid WebSocket upgrade request per the exact header set this
/// crate requires (method GET, Connection contains "upgrade", Upgrade ==
/// "websocket", non-empty key, version exactly 13).
pub fn is_websocket_upgrade(req: &Request<Incoming>) -> bool {
    if req.method() != http::Method::GET {
        return false;
    }
    let headers = req.headers();

    let connection_has_upgrade = headers
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|tok| tok.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false);

    let upgrade_is_websocket = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    let has_key = headers
        .get("sec-websocket-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| !v.is_empty())
        .unwrap_or(false);

    connection_has_upgrade && upgrade_is_websocket && has_key
}

/// Version check, kept separate from detection so callers can return a
/// precise 400 rather than silently falling through to the HTTP pipeline.
pub fn version_is_supported(req: &Request<Incoming>) -> bool {
    req.headers()
        .get("sec-websocket-version")
        .and_then(|v| v.to_str().ok())
        == Some("13")
}

/// Pick a node, perform the upgrade handshake with the client, then splice
/// to an outbound WebSocket dialed at the node. On success the returned
/// response must be written to the client (this completes the HTTP upgrade);
/// the caller must call `ctx.mark_responded()` before doing so since the
/// underlying socket is about to be hijacked.
pub async fn proxy_websocket(
    req: Request<Incoming>,
    cluster: &Cluster,
    ctx: &RequestContext,
    client_ip: IpAddr,
    host: &str,
    registry: &WebSocketRegistry,
) -> Result<Response<BoxBody>, Response<BoxBody>> {
    if !version_is_supported(&req) {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "unsupported websocket version, require 13",
        ));
    }

    let cfg = cluster.config();
    let cb_cfg = cfg.circuit_breaker.as_ref();
    let node_count = cluster.node_count();
    let Some((target, guard, addr)) =
        select_healthy_node(cluster, &ctx.route_name, &[], cb_cfg, node_count)
    else {
        return Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "no eligible node",
        ));
    };

    let req_path = req.uri().path().to_string();
    let req_query = req.uri().query().map(|q| q.to_string());
    let effective_path = rewrite_path(&target.instance.target_path, &req_path);
    let outbound_scheme = if &*target.scheme == "https" { "wss" } else { "ws" };
    let outbound_url = match req_query {
        Some(ref q) => format!("{}://{}{}?{}", outbound_scheme, addr, effective_path, q),
        None => format!("{}://{}{}", outbound_scheme, addr, effective_path),
    };

    let mut outbound_headers = req.headers().clone();
    strip_websocket_headers(&mut outbound_headers);
    header_rewrite::rewrite_headers(
        &mut outbound_headers,
        client_ip,
        if outbound_scheme == "wss" {
            ForwardedProto::Wss
        } else {
            ForwardedProto::Ws
        },
        host,
    );

    let (response, client_ws_fut) = match hyper_tungstenite::upgrade(req, None) {
        Ok(v) => v,
        Err(e) => {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                &format!("upgrade failed: {}", e),
            ));
        }
    };

    let conn_id = registry.insert(&addr);
    let route_name = ctx.route_name.clone();
    let registry = registry.clone();

    tokio::spawn(async move {
        let _guard = guard;
        let client_ws = match client_ws_fut.await {
            Ok(ws) => ws,
            Err(e) => {
                warn!("websocket: client upgrade failed, error={}", e);
                registry.remove(conn_id);
                return;
            }
        };

        let mut request_builder = http::Request::builder().uri(&outbound_url);
        for (name, value) in &outbound_headers {
            request_builder = request_builder.header(name, value);
        }
        let outbound_req = match request_builder.body(()) {
            Ok(r) => r,
            Err(e) => {
                warn!("websocket: failed to build outbound request, error={}", e);
                registry.remove(conn_id);
                return;
            }
        };

        let server_ws = match tokio_tungstenite::connect_async(outbound_req).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                warn!(
                    "websocket: outbound dial failed, route={}, addr={}, error={}",
                    route_name, addr, e
                );
                registry.remove(conn_id);
                return;
            }
        };

        splice(client_ws, server_ws).await;
        registry.remove(conn_id);
        debug!("websocket: connection closed, id={}", conn_id);
    });

    Ok(response.map(|_| full_body(bytes::Bytes::new())))
}

/// Bidirectional copy between two WebSocket streams with idle ping/pong and
/// normal-closure teardown on both sides.
async fn splice<A, B>(mut client: A, mut server: B)
where
    A: futures_util::Sink<Message> + futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    B: futures_util::Sink<Message> + futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let mut ping_ticker = tokio::time::interval(PING_INTERVAL);
    let mut last_activity = tokio::time::Instant::now();

    loop {
        tokio::select! {
            msg = client.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(m)) => {
                        last_activity = tokio::time::Instant::now();
                        if server.send(m).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(_)) => break,
                }
            }
            msg = server.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(m)) => {
                        last_activity = tokio::time::Instant::now();
                        if client.send(m).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(_)) => break,
                }
            }
            _ = ping_ticker.tick() => {
                if last_activity.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if client.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                if server.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    let close = Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    }));
    let _ = client.send(close.clone()).await;
    let _ = server.send(close).await;
    let _ = client.close().await;
    let _ = server.close().await;
}

fn strip_websocket_headers(headers: &mut http::HeaderMap) {
    for name in [
        "sec-websocket-key",
        "sec-websocket-version",
        "sec-websocket-extensions",
        "upgrade",
        "connection",
    ] {
        headers.remove(name);
    }
}

fn error_response(status: StatusCode, msg: &str) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(format!(r#"{{"error":"{}"}}"#, msg)))
        .unwrap()
}
