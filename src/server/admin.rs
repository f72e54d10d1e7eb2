use super::GatewayState;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub async fn handle_admin(
    req: Request<Incoming>,
    state: GatewayState,
) -> Result<Response<BoxBody>, hyper::Error> {
    match req.uri().path() {
        "/health" | "/healthz" => Ok(Response::builder()
            .status(200)
            .body(full_body(r#"{"status":"ok"}"#))
            .unwrap()),

        "/ready" | "/readyz" => {
            let cfg = state.config.load();
            let route_count = cfg.total_route_count();
            Ok(Response::builder()
                .status(200)
                .body(full_body(format!(
                    r#"{{"status":"ready","domains":{},"total_routes":{}}}"#,
                    cfg.domains.len(),
                    route_count,
                )))
                .unwrap())
        }

        "/metrics" => {
            let body = state.metrics.render();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .unwrap())
        }

        "/domains" => {
            let cfg = state.config.load();
            let domains: Vec<serde_json::Value> = cfg
                .domains
                .iter()
                .map(|d| {
                    serde_json::json!({
                        "name": d.name,
                        "hosts": d.hosts,
                        "routes": d.routes.iter().map(|r| {
                            serde_json::json!({
                                "name": r.name,
                                "uri": r.uri,
                                "methods": r.methods,
                                "headers": r.headers.iter().map(|h| {
                                    serde_json::json!({
                                        "name": h.name,
                                        "value": h.value,
                                        "match_type": h.match_type,
                                        "invert": h.invert,
                                    })
                                }).collect::<Vec<_>>(),
                                "priority": r.priority,
                                "clusters": r.clusters.iter().map(|c| {
                                    serde_json::json!({"name": c.name, "weight": c.weight})
                                }).collect::<Vec<_>>(),
                            })
                        }).collect::<Vec<_>>(),
                    })
                })
                .collect();

            let body = serde_json::to_string_pretty(&domains).unwrap_or_default();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(full_body(body))
                .unwrap())
        }

        "/routes" => {
            let table = state.routing.route_table.load();
            let routes: Vec<serde_json::Value> = table
                .all_routes()
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "name": r.name,
                        "uri": r.uri,
                        "priority": r.priority,
                        "clusters": r.cluster_selector.clusters().iter().map(|c| {
                            serde_json::json!({"name": c.name, "weight": c.weight})
                        }).collect::<Vec<_>>(),
                    })
                })
                .collect();

            let body = serde_json::to_string_pretty(&routes).unwrap_or_default();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(full_body(body))
                .unwrap())
        }

        "/tunnel/sessions" => {
            let mut servers = Vec::new();
            for id in state.tunnel_servers.ids().await {
                let Some(server) = state.tunnel_servers.get(&id).await else {
                    continue;
                };
                servers.push(serde_json::json!({
                    "id": id,
                    "running": server.is_running(),
                    "sessions": server.session_count(),
                    "services": server.service_count(),
                    "connections_total": server.connections_total(),
                    "session_ids": server.active_session_ids(),
                }));
            }

            let body = serde_json::to_string_pretty(&servers).unwrap_or_default();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(full_body(body))
                .unwrap())
        }

        "/forwarders" => {
            let mut forwarders = Vec::new();
            for id in state.forwarders.ids().await {
                let Some(fwd) = state.forwarders.get(&id).await else {
                    continue;
                };
                let cfg = fwd.config();
                let nodes: Vec<serde_json::Value> = cfg
                    .nodes
                    .iter()
                    .map(|n| {
                        serde_json::json!({
                            "node_id": n.node_id,
                            "target": format!("{}:{}", n.target_address, n.target_port),
                            "healthy": fwd.health.is_healthy(&n.node_id),
                        })
                    })
                    .collect();

                forwarders.push(serde_json::json!({
                    "id": id,
                    "running": fwd.is_running(),
                    "server_type": cfg.server_type,
                    "listen": format!("{}:{}", cfg.listen_address, cfg.listen_port),
                    "total_connections": fwd.total_connections.load(std::sync::atomic::Ordering::Relaxed),
                    "current_connections": fwd.current_connections.load(std::sync::atomic::Ordering::Relaxed),
                    "bytes_sent": fwd.bytes_sent.load(std::sync::atomic::Ordering::Relaxed),
                    "bytes_received": fwd.bytes_received.load(std::sync::atomic::Ordering::Relaxed),
                    "nodes": nodes,
                }));
            }

            let body = serde_json::to_string_pretty(&forwarders).unwrap_or_default();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(full_body(body))
                .unwrap())
        }

        _ => Ok(Response::builder()
            .status(404)
            .body(full_body(r#"{"error":"not found"}"#))
            .unwrap()),
    }
}
