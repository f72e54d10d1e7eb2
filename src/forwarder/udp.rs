//! UDP forwarding: one bound socket per `StaticForwarder`, demultiplexed by
//! source address into short-lived sessions against an LB-picked upstream.
//! Datagrams are opaque payload, never split or reassembled.

use crate::forwarder::entity::StaticForwarder;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const REAP_INTERVAL: Duration = Duration::from_secs(15);
const MAX_DATAGRAM: usize = 65507;

struct UdpSession {
    upstream: Arc<UdpSocket>,
    last_active_secs: AtomicI64,
    reader: JoinHandle<()>,
}

impl UdpSession {
    fn touch(&self, epoch: Instant) {
        self.last_active_secs
            .store(epoch.elapsed().as_secs() as i64, Ordering::Relaxed);
    }

    fn idle_for(&self, epoch: Instant) -> Duration {
        let last = self.last_active_secs.load(Ordering::Relaxed);
        let now = epoch.elapsed().as_secs() as i64;
        Duration::from_secs((now - last).max(0) as u64)
    }
}

impl Drop for UdpSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

type SessionMap = Arc<Mutex<HashMap<SocketAddr, Arc<UdpSession>>>>;

pub async fn run(forwarder: Arc<StaticForwarder>) {
    let addr = format!("{}:{}", forwarder.listen_address(), forwarder.listen_port());
    let socket = match UdpSocket::bind(&addr).await {
        Ok(s) => s,
        Err(e) => {
            warn!("forwarder: udp: bind failed, addr={}, error={}", addr, e);
            return;
        }
    };
    let socket = Arc::new(socket);
    debug!("forwarder: udp: listening, addr={}", addr);

    let epoch = Instant::now();
    let sessions: SessionMap = Arc::new(Mutex::new(HashMap::new()));

    let shutdown = forwarder.shutdown_signal();
    let reaper = tokio::spawn(reap_loop(Arc::clone(&sessions), epoch, Arc::clone(&forwarder)));

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let recv = socket.recv_from(&mut buf);
        tokio::select! {
            res = recv => {
                match res {
                    Ok((len, peer)) => {
                        handle_datagram(&forwarder, &socket, &sessions, epoch, peer, &buf[..len]).await;
                    }
                    Err(e) => warn!("forwarder: udp: recv error, error={}", e),
                }
            }
            _ = shutdown.notified() => {
                debug!("forwarder: udp: shutting down, addr={}", addr);
                reaper.abort();
                return;
            }
        }
    }
}

async fn handle_datagram(
    forwarder: &Arc<StaticForwarder>,
    socket: &Arc<UdpSocket>,
    sessions: &SessionMap,
    epoch: Instant,
    peer: SocketAddr,
    payload: &[u8],
) {
    let existing = { sessions.lock().await.get(&peer).cloned() };
    let session = match existing {
        Some(s) => s,
        None => match new_session(forwarder, socket, sessions, epoch, peer).await {
            Some(s) => s,
            None => return,
        },
    };

    session.touch(epoch);
    if let Err(e) = session.upstream.send(payload).await {
        warn!("forwarder: udp: send to upstream failed, peer={}, error={}", peer, e);
        sessions.lock().await.remove(&peer);
        forwarder.current_connections.fetch_sub(1, Ordering::Relaxed);
        return;
    }
    forwarder
        .bytes_sent
        .fetch_add(payload.len() as u64, Ordering::Relaxed);
}

async fn new_session(
    forwarder: &Arc<StaticForwarder>,
    socket: &Arc<UdpSocket>,
    sessions: &SessionMap,
    epoch: Instant,
    peer: SocketAddr,
) -> Option<Arc<UdpSession>> {
    let guard = forwarder.select_healthy()?;
    let target = format!("{}:{}", guard.instance.host, guard.instance.port);

    let upstream = match UdpSocket::bind(("0.0.0.0", 0)).await {
        Ok(s) => s,
        Err(e) => {
            warn!("forwarder: udp: local bind failed, error={}", e);
            return None;
        }
    };
    if let Err(e) = upstream.connect(&target).await {
        warn!("forwarder: udp: connect failed, target={}, error={}", target, e);
        return None;
    }
    let upstream = Arc::new(upstream);

    let reply_socket = Arc::clone(socket);
    let reply_forwarder = Arc::clone(forwarder);
    let sessions_for_cleanup = Arc::clone(sessions);
    let reader_upstream = Arc::clone(&upstream);
    let reader = tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match reader_upstream.recv(&mut buf).await {
                Ok(len) => {
                    if reply_socket.send_to(&buf[..len], peer).await.is_err() {
                        break;
                    }
                    reply_forwarder
                        .bytes_received
                        .fetch_add(len as u64, Ordering::Relaxed);
                }
                Err(_) => break,
            }
        }
        if sessions_for_cleanup.lock().await.remove(&peer).is_some() {
            reply_forwarder
                .current_connections
                .fetch_sub(1, Ordering::Relaxed);
        }
    });

    let session = Arc::new(UdpSession {
        upstream,
        last_active_secs: AtomicI64::new(epoch.elapsed().as_secs() as i64),
        reader,
    });
    sessions.lock().await.insert(peer, Arc::clone(&session));

    forwarder.total_connections.fetch_add(1, Ordering::Relaxed);
    forwarder.current_connections.fetch_add(1, Ordering::Relaxed);

    Some(session)
}

async fn reap_loop(sessions: SessionMap, epoch: Instant, forwarder: Arc<StaticForwarder>) {
    loop {
        tokio::time::sleep(REAP_INTERVAL).await;
        let mut map = sessions.lock().await;
        let before = map.len();
        map.retain(|_, session| session.idle_for(epoch) < IDLE_TIMEOUT);
        let reaped = before - map.len();
        drop(map);
        if reaped > 0 {
            forwarder
                .current_connections
                .fetch_sub(reaped as i64, Ordering::Relaxed);
            debug!(
                "forwarder: udp: reaped idle sessions, id={}, count={}",
                forwarder.id(),
                reaped
            );
        }
    }
}
