//! Generic process-wide lifecycle manager, one instance per plane (tunnel
//! servers, static forwarders). Generalizes the collect-under-lock, act-
//! outside pattern `GatewayState::upsert_cluster`/`delete_cluster` already
//! uses for the routing plane, onto any entity backed by an etcd `Repository`.

use crate::error::{GatewayError, GwResult};
use crate::etcd::repository::{EtcdRepository, HasId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// One running (or stopped) thing a `LifecycleManager` owns: a tunnel control
/// server, a static forwarder. `start`/`stop` own the entity's background
/// task(s); the manager never invokes them while holding its map lock.
pub trait LifecycleEntity: Send + Sync + 'static {
    type Config: Clone + HasId + Send + Sync + 'static;

    fn from_config(config: Self::Config) -> Self;

    /// Hot-swap the behavioral config in place, used by `reload` when the
    /// listen address/port is unchanged.
    fn swap_config(&self, config: Self::Config);

    /// Listen address/port this entity is currently bound (or configured) to.
    fn listen_address(&self) -> String;
    fn listen_port(&self) -> u16;

    /// Listen address/port a not-yet-built config would bind to, used by
    /// `reload` to decide restart-vs-hot-swap without constructing the entity.
    fn listen_of(config: &Self::Config) -> (String, u16);

    async fn start(self: Arc<Self>);
    async fn stop(&self);
    fn is_running(&self) -> bool;
}

/// Generic manager: `Initialize` enumerates a Repository once; `Start`/`Stop`/
/// `StartAll`/`StopAll`/`Reload`/`Delete` operate on the in-memory cache.
/// `Stop` evicts from the cache so a later `Start` re-reads the Repository.
pub struct LifecycleManager<E: LifecycleEntity> {
    entities: RwLock<HashMap<String, Arc<E>>>,
    repo: EtcdRepository<E::Config>,
}

impl<E: LifecycleEntity> LifecycleManager<E>
where
    E::Config: DeserializeOwned + Serialize,
{
    pub fn new(repo: EtcdRepository<E::Config>) -> Self {
        Self {
            entities: RwLock::new(HashMap::new()),
            repo,
        }
    }

    /// Enumerate the Repository and create (but do not start) every entity.
    /// Must be called exactly once before any `Start`/`Stop`.
    pub async fn initialize(&self) -> GwResult<()> {
        let configs = self.repo.get_all().await?;
        let mut map = self.entities.write().await;
        for config in configs {
            let id = config.id().to_string();
            map.insert(id, Arc::new(E::from_config(config)));
        }
        info!("lifecycle: initialized, count={}", map.len());
        Ok(())
    }

    pub async fn ids(&self) -> Vec<String> {
        self.entities.read().await.keys().cloned().collect()
    }

    pub async fn get(&self, id: &str) -> Option<Arc<E>> {
        self.entities.read().await.get(id).cloned()
    }

    pub async fn running_count(&self) -> usize {
        self.entities
            .read()
            .await
            .values()
            .filter(|e| e.is_running())
            .count()
    }

    /// Apply a control-plane upsert: reload an existing entity in place, or
    /// register a new one (created but not started — `start`/`start_all`
    /// brings it up).
    pub async fn upsert_config(&self, config: E::Config) {
        let id = config.id().to_string();
        let existing = { self.entities.read().await.get(&id).cloned() };
        match existing {
            Some(entity) => self.reload(&id, config, entity).await,
            None => {
                let mut map = self.entities.write().await;
                map.insert(id, Arc::new(E::from_config(config)));
            }
        }
    }

    /// `Reload`: if the listen address/port changed while running, stop then
    /// start the replacement; otherwise hot-swap the config reference in place.
    async fn reload(&self, id: &str, config: E::Config, entity: Arc<E>) {
        let (new_addr, new_port) = E::listen_of(&config);
        let changed = entity.listen_address() != new_addr || entity.listen_port() != new_port;

        if entity.is_running() && changed {
            entity.stop().await;
            let fresh = Arc::new(E::from_config(config));
            {
                let mut map = self.entities.write().await;
                map.insert(id.to_string(), fresh.clone());
            }
            Arc::clone(&fresh).start().await;
        } else {
            entity.swap_config(config);
        }
    }

    pub async fn start(&self, id: &str) -> GwResult<()> {
        let entity = self.get(id).await;
        let entity = match entity {
            Some(e) => e,
            None => {
                // Not cached — either never initialized or evicted by a
                // prior `Stop`. Re-read from the Repository.
                let config = self
                    .repo
                    .get_by_id(id)
                    .await?
                    .ok_or_else(|| GatewayError::Internal(format!("unknown entity id: {}", id)))?;
                let fresh = Arc::new(E::from_config(config));
                self.entities
                    .write()
                    .await
                    .insert(id.to_string(), fresh.clone());
                fresh
            }
        };

        if entity.is_running() {
            return Ok(());
        }
        Arc::clone(&entity).start().await;
        Ok(())
    }

    /// Stop and evict from the cache. A later `Start` re-reads the Repository.
    pub async fn stop(&self, id: &str) -> GwResult<()> {
        let entity = { self.entities.write().await.remove(id) };
        if let Some(entity) = entity {
            entity.stop().await;
        }
        Ok(())
    }

    pub async fn start_all(&self) {
        let snapshot: Vec<Arc<E>> = self.entities.read().await.values().cloned().collect();
        for entity in snapshot {
            if !entity.is_running() {
                Arc::clone(&entity).start().await;
            }
        }
    }

    pub async fn stop_all(&self) {
        let snapshot: Vec<Arc<E>> = self.entities.read().await.values().cloned().collect();
        for entity in snapshot {
            entity.stop().await;
        }
    }

    /// Delete is purely an in-memory removal — the consumed Repository
    /// interface has no delete operation, only `GetAll`/`GetByID`/`Update`.
    pub async fn delete(&self, id: &str) -> GwResult<()> {
        let entity = { self.entities.write().await.remove(id) };
        if let Some(entity) = entity {
            entity.stop().await;
        } else {
            warn!("lifecycle: delete ignored (not found), id={}", id);
        }
        Ok(())
    }
}
