use crate::{CacheError, Value};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Content address of a node invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Hash of node name, tool version and resolved inputs.
    ///
    /// Inputs are rendered as canonical JSON so map ordering never changes
    /// the key.
    pub fn compute(
        node: &str,
        tool_version: &str,
        inputs: &HashMap<String, Value>,
    ) -> Result<Self, CacheError> {
        let canonical: BTreeMap<&str, serde_json::Value> = inputs
            .iter()
            .map(|(name, value)| (name.as_str(), value.to_canonical_json()))
            .collect();
        let encoded = serde_json::to_vec(&canonical).map_err(|e| CacheError::Encoding(e.to_string()))?;

        let mut hasher = Sha256::new();
        hasher.update(node.as_bytes());
        hasher.update([0u8]);
        hasher.update(tool_version.as_bytes());
        hasher.update([0u8]);
        hasher.update(&encoded);
        Ok(Self(hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a cache hit restores: the node's plain output and the metrics its
/// invocation reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResult {
    pub value: Value,
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
}

impl CachedResult {
    pub fn new(value: Value, metrics: HashMap<String, f64>) -> Self {
        Self { value, metrics }
    }
}

impl From<Value> for CachedResult {
    fn from(value: Value) -> Self {
        Self::new(value, HashMap::new())
    }
}

/// Key-value store for node results shared by every row of a run.
///
/// Implementations must allow concurrent reads; the last successful `put`
/// for a key wins.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<CachedResult>, CacheError>;

    async fn put(&self, key: &CacheKey, entry: CachedResult) -> Result<(), CacheError>;
}

/// Process-local cache store.
pub struct InMemoryCache {
    entries: DashMap<CacheKey, CachedResult>,
    max_entries: Option<usize>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: None,
        }
    }

    /// Bound the number of entries; an arbitrary entry is evicted when full.
    pub fn with_capacity_limit(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: Some(max_entries.max(1)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<CachedResult>, CacheError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn put(&self, key: &CacheKey, entry: CachedResult) -> Result<(), CacheError> {
        if let Some(limit) = self.max_entries {
            if self.entries.len() >= limit && !self.entries.contains_key(key) {
                let victim = self.entries.iter().next().map(|entry| entry.key().clone());
                if let Some(victim) = victim {
                    tracing::debug!("Cache full at {} entries, evicting {}", limit, victim);
                    self.entries.remove(&victim);
                }
            }
        }
        self.entries.insert(key.clone(), entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ignores_map_order_but_not_content() {
        let mut a = HashMap::new();
        a.insert("x".to_string(), Value::from(1.0));
        a.insert("y".to_string(), Value::from("two"));
        let mut b = HashMap::new();
        b.insert("y".to_string(), Value::from("two"));
        b.insert("x".to_string(), Value::from(1.0));

        let ka = CacheKey::compute("node", "1", &a).unwrap();
        assert_eq!(ka, CacheKey::compute("node", "1", &b).unwrap());
        assert_ne!(ka, CacheKey::compute("node", "2", &a).unwrap());
        assert_ne!(ka, CacheKey::compute("other", "1", &a).unwrap());
        assert_eq!(ka.as_str().len(), 64);
    }

    #[tokio::test]
    async fn capacity_limit_evicts() {
        let cache = InMemoryCache::with_capacity_limit(2);
        for i in 0..3 {
            let key = CacheKey::compute(&format!("n{i}"), "1", &HashMap::new()).unwrap();
            cache.put(&key, Value::from(i as f64).into()).await.unwrap();
        }
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn entries_keep_their_metrics() {
        let cache = InMemoryCache::new();
        let key = CacheKey::compute("llm", "1", &HashMap::new()).unwrap();
        let metrics = HashMap::from([("tokens".to_string(), 5.0)]);
        cache
            .put(&key, CachedResult::new(Value::from("answer"), metrics.clone()))
            .await
            .unwrap();

        let hit = cache.get(&key).await.unwrap().unwrap();
        assert_eq!(hit.value, Value::from("answer"));
        assert_eq!(hit.metrics, metrics);
    }
}
