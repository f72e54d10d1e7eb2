//! `TunnelService` and the `ServiceRegistry` that owns remote-port allocation
//! and agent-id/session-id invariants across all registered services.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Active,
    Inactive,
    Error,
}

/// A service an agent exposes through the tunnel.
///
/// Invariant: `agent_id` always equals the session id that registered it;
/// on session removal all its services are unregistered (enforced by
/// `ServiceRegistry::unregister_by_session`, not by this struct).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelService {
    pub id: String,
    pub agent_id: String,
    pub name: String,
    pub local_address: String,
    pub local_port: u16,
    pub remote_port: Option<u16>,
    #[serde(default)]
    pub custom_domains: Vec<String>,
    pub status: ServiceStatus,
    #[serde(skip)]
    pub bytes_in: Arc<AtomicU64>,
    #[serde(skip)]
    pub bytes_out: Arc<AtomicU64>,
}

/// Concurrent-safe registry of all services across all sessions, keyed by
/// service name (names are unique per server, matching the FSM's
/// `unregister_service` lookup-by-name-within-session).
pub struct ServiceRegistry {
    services: DashMap<String, TunnelService>,
    port_range: RangeInclusive<u16>,
}

impl ServiceRegistry {
    pub fn new(port_range: RangeInclusive<u16>) -> Self {
        Self {
            services: DashMap::new(),
            port_range,
        }
    }

    /// Register a service, forcing `agent_id` to the authenticating session
    /// and allocating a remote port when the caller omitted one. Returns the
    /// finalized service (with assigned id/remote_port) for the FSM to echo
    /// back in its response.
    pub fn register(
        &self,
        mut service: TunnelService,
        session_id: &str,
    ) -> Result<TunnelService, String> {
        if service.id.is_empty() {
            service.id = uuid::Uuid::new_v4().to_string();
        }
        if service.name.is_empty() {
            return Err("service name must not be empty".to_string());
        }
        service.agent_id = session_id.to_string();
        service.status = ServiceStatus::Active;

        if service.remote_port.is_none() {
            service.remote_port = Some(self.allocate_remote_port()?);
        }

        self.services.insert(service.name.clone(), service.clone());
        Ok(service)
    }

    /// Next free port in the configured range, scanning ascending and
    /// skipping ports already held by a live service.
    fn allocate_remote_port(&self) -> Result<u16, String> {
        let in_use: std::collections::HashSet<u16> = self
            .services
            .iter()
            .filter_map(|entry| entry.value().remote_port)
            .collect();

        for port in self.port_range.clone() {
            if !in_use.contains(&port) {
                return Ok(port);
            }
        }
        Err("no free remote port in configured range".to_string())
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.services.remove(name).is_some()
    }

    /// Collect service names owned by `session_id` (read-only snapshot), then
    /// unregister each outside of any session lock — the caller is
    /// responsible for acquiring the session's service-name snapshot first.
    pub fn unregister_by_session(&self, session_id: &str) -> usize {
        let names: Vec<String> = self
            .services
            .iter()
            .filter(|entry| entry.value().agent_id == session_id)
            .map(|entry| entry.key().clone())
            .collect();

        for name in &names {
            self.services.remove(name);
        }
        names.len()
    }

    pub fn get(&self, name: &str) -> Option<TunnelService> {
        self.services.get(name).map(|e| e.value().clone())
    }

    pub fn get_by_agent_and_name(&self, agent_id: &str, name: &str) -> Option<TunnelService> {
        self.services
            .get(name)
            .filter(|e| e.value().agent_id == agent_id)
            .map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn count_for_session(&self, session_id: &str) -> usize {
        self.services
            .iter()
            .filter(|e| e.value().agent_id == session_id)
            .count()
    }

    pub fn snapshot(&self) -> Vec<TunnelService> {
        self.services.iter().map(|e| e.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc(name: &str, remote_port: Option<u16>) -> TunnelService {
        TunnelService {
            id: String::new(),
            agent_id: String::new(),
            name: name.to_string(),
            local_address: "127.0.0.1".to_string(),
            local_port: 8080,
            remote_port,
            custom_domains: Vec::new(),
            status: ServiceStatus::Active,
            bytes_in: Arc::new(AtomicU64::new(0)),
            bytes_out: Arc::new(AtomicU64::new(0)),
        }
    }

    #[test]
    fn allocates_ascending_free_port() {
        let reg = ServiceRegistry::new(20000..=20002);
        let a = reg.register(svc("a", None), "sess-1").unwrap();
        let b = reg.register(svc("b", None), "sess-1").unwrap();
        assert_eq!(a.remote_port, Some(20000));
        assert_eq!(b.remote_port, Some(20001));
    }

    #[test]
    fn skips_explicitly_held_port() {
        let reg = ServiceRegistry::new(20000..=20002);
        reg.register(svc("a", Some(20000)), "sess-1").unwrap();
        let b = reg.register(svc("b", None), "sess-1").unwrap();
        assert_eq!(b.remote_port, Some(20001));
    }

    #[test]
    fn forces_agent_id_to_session() {
        let reg = ServiceRegistry::new(20000..=20010);
        let s = reg.register(svc("a", None), "sess-42").unwrap();
        assert_eq!(s.agent_id, "sess-42");
    }

    #[test]
    fn session_removal_clears_its_services() {
        let reg = ServiceRegistry::new(20000..=20010);
        reg.register(svc("a", None), "sess-1").unwrap();
        reg.register(svc("b", None), "sess-1").unwrap();
        reg.register(svc("c", None), "sess-2").unwrap();
        let removed = reg.unregister_by_session("sess-1");
        assert_eq!(removed, 2);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn rejects_empty_name() {
        let reg = ServiceRegistry::new(20000..=20010);
        assert!(reg.register(svc("", None), "sess-1").is_err());
    }
}
