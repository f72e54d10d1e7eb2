use crate::config::{StaticForwarderServerConfig, TunnelServerConfig};
use crate::error::{GatewayError, GwResult};
use crate::etcd::client::{b64_decode, b64_encode, prefix_range_end, PutRequest, RangeRequest};
use crate::etcd::EtcdClient;
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;

/// Config kinds persisted through an `EtcdRepository` must expose a stable
/// identifier used as the trailing path segment under the kind's prefix.
pub trait HasId {
    fn id(&self) -> &str;
}

impl HasId for TunnelServerConfig {
    fn id(&self) -> &str {
        &self.id
    }
}

impl HasId for StaticForwarderServerConfig {
    fn id(&self) -> &str {
        &self.server_id
    }
}

/// Generic etcd-backed implementation of the consumed `Repository` capability
/// (`GetAll/GetByID/Update`) — one instance per config kind, parameterized
/// over the prefix under which that kind's items live. Mirrors the read/parse
/// shape of `config::etcd::load_prefix`, generalized to any `HasId` type and
/// exposed as a type other modules can hold without depending on the
/// domain/cluster-specific watch machinery.
#[derive(Clone)]
pub struct EtcdRepository<T> {
    client: EtcdClient,
    prefix: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> EtcdRepository<T>
where
    T: DeserializeOwned + Serialize + HasId + Send + Sync,
{
    pub fn new(client: EtcdClient, prefix: &str) -> Self {
        let prefix = if prefix.ends_with('/') {
            prefix.to_string()
        } else {
            format!("{}/", prefix)
        };
        Self {
            client,
            prefix,
            _marker: PhantomData,
        }
    }

    pub async fn get_all(&self) -> GwResult<Vec<T>> {
        let key_b64 = b64_encode(&self.prefix);
        let range_end = prefix_range_end(&self.prefix);

        let resp = self
            .client
            .range(&RangeRequest {
                key: key_b64,
                range_end,
                keys_only: None,
            })
            .await
            .map_err(|e| GatewayError::Internal(format!("repository get_all failed: {}", e)))?;

        let mut items = Vec::with_capacity(resp.kvs.len());
        for kv in &resp.kvs {
            let Ok(value) = b64_decode(&kv.value) else {
                continue;
            };
            match serde_json::from_str::<T>(&value) {
                Ok(item) => items.push(item),
                Err(e) => {
                    tracing::warn!(
                        "repository: get_all parse failed, prefix={}, error={}",
                        self.prefix,
                        e
                    );
                }
            }
        }
        Ok(items)
    }

    pub async fn get_by_id(&self, id: &str) -> GwResult<Option<T>> {
        let key = format!("{}{}", self.prefix, id);
        let resp = self
            .client
            .range(&RangeRequest {
                key: b64_encode(&key),
                range_end: String::new(),
                keys_only: None,
            })
            .await
            .map_err(|e| GatewayError::Internal(format!("repository get_by_id failed: {}", e)))?;

        let Some(kv) = resp.kvs.first() else {
            return Ok(None);
        };
        let value = b64_decode(&kv.value)
            .map_err(|e| GatewayError::Internal(format!("repository value decode failed: {}", e)))?;
        let item = serde_json::from_str::<T>(&value)
            .map_err(|e| GatewayError::Internal(format!("repository parse failed: {}", e)))?;
        Ok(Some(item))
    }

    pub async fn update(&self, item: &T) -> GwResult<()> {
        let key = format!("{}{}", self.prefix, item.id());
        let value = serde_json::to_string(item)
            .map_err(|e| GatewayError::Internal(format!("repository serialize failed: {}", e)))?;

        self.client
            .put(&PutRequest {
                key: b64_encode(&key),
                value: b64_encode(&value),
                lease: None,
            })
            .await
            .map_err(|e| GatewayError::Internal(format!("repository update failed: {}", e)))
    }
}
