//! Splices one visitor connection to one agent-side service by asking the
//! owning control session to dial back a fresh data connection.

use crate::tunnel::frame::ControlMessage;
use crate::tunnel::session::TunnelClientSession;
use dashmap::DashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;

pub struct TunnelDataPlane {
    waiters: DashMap<String, oneshot::Sender<TcpStream>>,
}

impl Default for TunnelDataPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelDataPlane {
    pub fn new() -> Self {
        Self {
            waiters: DashMap::new(),
        }
    }

    /// Hand an incoming `data_connection` socket to its waiter. Returns
    /// `false` if no waiter is registered (late, duplicate, or unknown id).
    pub fn deliver(&self, connection_id: &str, stream: TcpStream) -> bool {
        match self.waiters.remove(connection_id) {
            Some((_, tx)) => tx.send(stream).is_ok(),
            None => false,
        }
    }

    /// Ask `session`'s agent to open a service connection, wait up to
    /// `wait_timeout` for it, then splice the visitor socket to it.
    pub async fn open_and_splice(
        &self,
        session: &TunnelClientSession,
        service_name: &str,
        visitor: TcpStream,
        wait_timeout: Duration,
    ) -> std::io::Result<crate::forwarder::splice::SpliceResult> {
        let connection_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(connection_id.clone(), tx);

        let ask = ControlMessage::new(
            "open_data_connection",
            serde_json::json!({"connectionId": connection_id, "service": service_name}),
        );
        if !session.send(ask) {
            self.waiters.remove(&connection_id);
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "session closed before data connection request could be sent",
            ));
        }

        let agent_stream = match tokio::time::timeout(wait_timeout, rx).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(_)) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionAborted,
                    "data connection waiter dropped",
                ));
            }
            Err(_) => {
                self.waiters.remove(&connection_id);
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "timed out waiting for agent data connection",
                ));
            }
        };

        let (result, err) = crate::forwarder::splice::splice(visitor, agent_stream).await;
        match err {
            Some(e) if e.kind() != std::io::ErrorKind::UnexpectedEof => {
                metrics::counter!("gateway_tunnel_data_connections_total", "result" => "error")
                    .increment(1);
                Err(e)
            }
            _ => {
                metrics::counter!("gateway_tunnel_data_connections_total", "result" => "success")
                    .increment(1);
                Ok(result)
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deliver_without_waiter_returns_false() {
        let plane = TunnelDataPlane::new();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stream, _) = tokio::join!(
            async { TcpStream::connect(addr).await.unwrap() },
            async { listener.accept().await.unwrap().0 },
        );
        assert!(!plane.deliver("unknown-id", stream));
    }

    #[tokio::test]
    async fn deliver_wakes_registered_waiter() {
        let plane = TunnelDataPlane::new();
        let (tx, rx) = oneshot::channel();
        plane.waiters.insert("conn-1".to_string(), tx);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stream, _) = tokio::join!(
            async { TcpStream::connect(addr).await.unwrap() },
            async { listener.accept().await.unwrap().0 },
        );

        assert!(plane.deliver("conn-1", stream));
        assert!(rx.await.is_ok());
    }
}
