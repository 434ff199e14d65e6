// Key/value persistence trait
//
// The kernel persists memories, profiles, users, and apps through this trait.
// aether-storage provides the SQLite implementation; MemoryKv backs tests
// and ephemeral deployments.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::Result;

/// Namespaced key/value store with JSON values
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Insert or replace a value
    async fn put(&self, namespace: &str, key: &str, value: Value) -> Result<()>;

    /// Fetch a value
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>>;

    /// Remove a value; returns whether it existed
    async fn delete(&self, namespace: &str, key: &str) -> Result<bool>;

    /// All entries in a namespace, ordered by key
    async fn list(&self, namespace: &str) -> Result<Vec<(String, Value)>>;

    /// Entries in a namespace whose key starts with `prefix`, ordered by key
    async fn list_prefix(&self, namespace: &str, prefix: &str) -> Result<Vec<(String, Value)>> {
        Ok(self
            .list(namespace)
            .await?
            .into_iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .collect())
    }
}

/// In-memory KvStore for tests and ephemeral runs
#[derive(Debug, Default)]
pub struct MemoryKv {
    data: RwLock<BTreeMap<String, BTreeMap<String, Value>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor returning a trait object
    pub fn shared() -> Arc<dyn KvStore> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn put(&self, namespace: &str, key: &str, value: Value) -> Result<()> {
        self.data
            .write()
            .await
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        Ok(self
            .data
            .read()
            .await
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .cloned())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        Ok(self
            .data
            .write()
            .await
            .get_mut(namespace)
            .map(|ns| ns.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn list(&self, namespace: &str) -> Result<Vec<(String, Value)>> {
        Ok(self
            .data
            .read()
            .await
            .get(namespace)
            .map(|ns| ns.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let kv = MemoryKv::new();
        kv.put("memory", "a", json!({"x": 1})).await.unwrap();
        assert_eq!(kv.get("memory", "a").await.unwrap(), Some(json!({"x": 1})));
        assert!(kv.delete("memory", "a").await.unwrap());
        assert!(!kv.delete("memory", "a").await.unwrap());
        assert_eq!(kv.get("memory", "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn namespaces_are_disjoint() {
        let kv = MemoryKv::new();
        kv.put("users", "alice", json!(1)).await.unwrap();
        kv.put("apps", "alice", json!(2)).await.unwrap();
        assert_eq!(kv.get("users", "alice").await.unwrap(), Some(json!(1)));
        assert_eq!(kv.get("apps", "alice").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn list_prefix_filters_by_key() {
        let kv = MemoryKv::new();
        kv.put("idx", "uid:u1:m1", json!(null)).await.unwrap();
        kv.put("idx", "uid:u1:m2", json!(null)).await.unwrap();
        kv.put("idx", "uid:u2:m3", json!(null)).await.unwrap();
        let hits = kv.list_prefix("idx", "uid:u1:").await.unwrap();
        assert_eq!(hits.len(), 2);
    }
}
