use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{Store, StoreError};

type CollectionMap = HashMap<String, Value>;

/// In-process `Store` backed by one `RwLock`-guarded map per collection,
/// the same shape `RedisQueueService` uses for its stats counter, scaled up
/// to one guarded map per named collection instead of a single struct.
/// Exists for tests and local development — a host wires a real database
/// behind `Store` in production.
#[derive(Default)]
pub struct InMemoryStore {
    collections: RwLock<HashMap<String, Arc<RwLock<CollectionMap>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn collection(&self, name: &str) -> Arc<RwLock<CollectionMap>> {
        if let Some(existing) = self.collections.read().await.get(name) {
            return existing.clone();
        }

        let mut collections = self.collections.write().await;
        collections
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(HashMap::new())))
            .clone()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let records = self.collection(collection).await;
        let records = records.read().await;
        Ok(records.get(key).cloned())
    }

    async fn put(&self, collection: &str, key: &str, record: Value) -> Result<(), StoreError> {
        let records = self.collection(collection).await;
        let mut records = records.write().await;
        records.insert(key.to_string(), record);
        Ok(())
    }

    async fn update_if(
        &self,
        collection: &str,
        key: &str,
        predicate: &(dyn for<'a> Fn(&'a Value) -> bool + Send + Sync),
        mutation: &(dyn Fn(Value) -> Value + Send + Sync),
    ) -> Result<Option<Value>, StoreError> {
        let records = self.collection(collection).await;
        // Held for the whole compare-and-swap: this is coarser than a
        // per-key lock, but it satisfies the "linearizable within a slot"
        // requirement and keeps the in-memory implementation simple.
        let mut records = records.write().await;

        match records.get(key) {
            Some(current) if predicate(current) => {
                let updated = mutation(current.clone());
                records.insert(key.to_string(), updated.clone());
                Ok(Some(updated))
            }
            Some(_) => {
                debug!("update_if predicate rejected {collection}/{key}");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn query(
        &self,
        collection: &str,
        filter: &(dyn for<'a> Fn(&'a Value) -> bool + Send + Sync),
        sort: Option<&(dyn for<'a, 'b> Fn(&'a Value, &'b Value) -> Ordering + Send + Sync)>,
        limit: Option<usize>,
    ) -> Result<Vec<Value>, StoreError> {
        let records = self.collection(collection).await;
        let records = records.read().await;

        let mut matched: Vec<Value> = records.values().filter(|v| filter(v)).cloned().collect();
        if let Some(cmp) = sort {
            matched.sort_by(|a, b| cmp(a, b));
        }
        if let Some(n) = limit {
            matched.truncate(n);
        }
        Ok(matched)
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<(), StoreError> {
        let records = self.collection(collection).await;
        let mut records = records.write().await;
        records.remove(key);
        Ok(())
    }
}
