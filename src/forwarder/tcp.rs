//! TCP accept loop for a `StaticForwarder`: picks an upstream node per
//! connection via its load balancer, dials it, then splices.

use crate::forwarder::entity::StaticForwarder;
use crate::forwarder::splice::splice;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

pub async fn run(forwarder: Arc<StaticForwarder>) {
    let addr = format!("{}:{}", forwarder.listen_address(), forwarder.listen_port());
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!("forwarder: tcp: bind failed, addr={}, error={}", addr, e);
            return;
        }
    };
    debug!("forwarder: tcp: listening, addr={}", addr);

    let shutdown = forwarder.shutdown_signal();
    loop {
        let accept = tokio::time::timeout(std::time::Duration::from_secs(1), listener.accept());
        tokio::select! {
            res = accept => {
                match res {
                    Ok(Ok((stream, peer))) => {
                        let fwd = Arc::clone(&forwarder);
                        tokio::spawn(async move {
                            handle_connection(fwd, stream, peer).await;
                        });
                    }
                    Ok(Err(e)) => warn!("forwarder: tcp: accept error, error={}", e),
                    Err(_) => {} // accept deadline elapsed, recheck shutdown
                }
            }
            _ = shutdown.notified() => {
                debug!("forwarder: tcp: shutting down, addr={}", addr);
                return;
            }
        }
    }
}

async fn handle_connection(
    forwarder: Arc<StaticForwarder>,
    visitor: TcpStream,
    peer: std::net::SocketAddr,
) {
    let Some(guard) = forwarder.select_healthy() else {
        warn!("forwarder: tcp: no healthy upstream, peer={}", peer);
        return;
    };

    let target = format!("{}:{}", guard.instance.host, guard.instance.port);
    let upstream = match tokio::time::timeout(
        forwarder.connect_timeout(),
        TcpStream::connect(&target),
    )
    .await
    {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            warn!("forwarder: tcp: dial failed, target={}, error={}", target, e);
            return;
        }
        Err(_) => {
            warn!("forwarder: tcp: dial timed out, target={}", target);
            return;
        }
    };

    forwarder.total_connections.fetch_add(1, Ordering::Relaxed);
    forwarder.current_connections.fetch_add(1, Ordering::Relaxed);
    let id = forwarder.id();
    metrics::counter!("gateway_forwarder_connections_total", "forwarder" => id.clone()).increment(1);
    metrics::gauge!("gateway_forwarder_connections_active", "forwarder" => id.clone())
        .set(forwarder.current_connections.load(Ordering::Relaxed) as f64);

    let (result, err) = splice(visitor, upstream).await;
    forwarder
        .bytes_sent
        .fetch_add(result.a_to_b, Ordering::Relaxed);
    forwarder
        .bytes_received
        .fetch_add(result.b_to_a, Ordering::Relaxed);
    forwarder.current_connections.fetch_sub(1, Ordering::Relaxed);
    metrics::counter!("gateway_forwarder_bytes_total", "forwarder" => id.clone(), "direction" => "sent")
        .increment(result.a_to_b);
    metrics::counter!("gateway_forwarder_bytes_total", "forwarder" => id.clone(), "direction" => "received")
        .increment(result.b_to_a);
    metrics::gauge!("gateway_forwarder_connections_active", "forwarder" => id)
        .set(forwarder.current_connections.load(Ordering::Relaxed) as f64);

    if let Some(e) = err {
        if e.kind() != std::io::ErrorKind::UnexpectedEof {
            debug!("forwarder: tcp: connection ended, peer={}, error={}", peer, e);
        }
    }
}
