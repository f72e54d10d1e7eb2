//! Per-connection control session state: auth flag, activity tracking, and
//! the set of service names registered through this session.

use crate::tunnel::frame::ControlMessage;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::{mpsc, Notify};
use std::sync::Arc;

/// One authenticated (or authenticating) agent connection.
///
/// The read loop lives in `server.rs`; this struct only holds the state that
/// loop needs to mutate plus the means to push frames back to the writer
/// task and to force the connection closed from elsewhere (duplicate-client
/// takeover, heartbeat timeout, shutdown).
pub struct TunnelClientSession {
    pub client_id: String,
    authenticated: AtomicBool,
    last_activity: Mutex<Instant>,
    services: Mutex<HashSet<String>>,
    outbox: mpsc::UnboundedSender<ControlMessage>,
    pub closed: Arc<Notify>,
}

impl TunnelClientSession {
    pub fn new(client_id: String, outbox: mpsc::UnboundedSender<ControlMessage>) -> Self {
        Self {
            client_id,
            authenticated: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            services: Mutex::new(HashSet::new()),
            outbox,
            closed: Arc::new(Notify::new()),
        }
    }

    pub fn mark_authenticated(&self) {
        self.authenticated.store(true, Ordering::Release);
        self.touch();
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    pub fn add_service(&self, name: &str) {
        self.services.lock().unwrap().insert(name.to_string());
    }

    pub fn remove_service(&self, name: &str) {
        self.services.lock().unwrap().remove(name);
    }

    /// Collected under this session's own lock, per the removal ordering
    /// that requires releasing it before touching the registry.
    pub fn drain_services(&self) -> Vec<String> {
        std::mem::take(&mut *self.services.lock().unwrap())
            .into_iter()
            .collect()
    }

    pub fn send(&self, msg: ControlMessage) -> bool {
        self.outbox.send(msg).is_ok()
    }

    pub fn force_close(&self) {
        self.closed.notify_waiters();
    }
}
