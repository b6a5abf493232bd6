pub mod error;
pub mod memory;

pub use error::StoreError;
pub use memory::InMemoryStore;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;

/// Collection names the engines read and write. Kept as constants rather
/// than a closed enum so a host can add operational collections (e.g. an
/// audit mirror) without touching this crate.
pub mod collections {
    pub const SLOTS: &str = "slots";
    pub const TOKENS: &str = "tokens";
    pub const DOCTOR_SCHEDULES: &str = "doctor_schedules";
    pub const DOCTORS: &str = "doctors";
    pub const PATIENTS: &str = "patients";
    pub const CONFIGURATIONS: &str = "configurations";
}

/// A transactional key-value / document store. This is the one external
/// collaborator the engines never implement themselves in production — the
/// host supplies a real one (backed by whatever database it runs); this
/// crate only ships the trait plus an in-memory implementation for tests
/// and local development.
///
/// `update_if` is the one operation the engines depend on for correctness:
/// every counter mutation (`Slot.currentAllocation`, `Slot.lastTokenNumber`)
/// goes through it so that a losing concurrent caller observes `None`
/// rather than a torn write.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError>;

    /// Unconditional overwrite.
    async fn put(&self, collection: &str, key: &str, record: Value) -> Result<(), StoreError>;

    /// Applies `mutation` to the current record iff `predicate` holds for
    /// it, atomically with respect to other `update_if`/`put` calls against
    /// the same collection. Returns `None` without mutating anything if the
    /// predicate fails or the key is absent — never a partial update.
    async fn update_if(
        &self,
        collection: &str,
        key: &str,
        predicate: &(dyn for<'a> Fn(&'a Value) -> bool + Send + Sync),
        mutation: &(dyn Fn(Value) -> Value + Send + Sync),
    ) -> Result<Option<Value>, StoreError>;

    async fn query(
        &self,
        collection: &str,
        filter: &(dyn for<'a> Fn(&'a Value) -> bool + Send + Sync),
        sort: Option<&(dyn for<'a, 'b> Fn(&'a Value, &'b Value) -> Ordering + Send + Sync)>,
        limit: Option<usize>,
    ) -> Result<Vec<Value>, StoreError>;

    /// Only used in tests; engines never hard-delete a Slot or Token.
    async fn delete(&self, collection: &str, key: &str) -> Result<(), StoreError>;
}

/// Typed convenience wrappers over the `Value`-based `Store` contract.
/// Blanket-implemented for every `Store`, including trait objects
/// (`Arc<dyn Store>`), since the type parameter lives on the method, not on
/// the trait itself.
#[async_trait]
pub trait StoreExt: Store {
    async fn get_typed<T>(&self, collection: &str, key: &str) -> Result<Option<T>, StoreError>
    where
        T: DeserializeOwned,
    {
        match self.get(collection, key).await? {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    async fn put_typed<T>(&self, collection: &str, key: &str, record: &T) -> Result<(), StoreError>
    where
        T: Serialize + Sync,
    {
        let value = serde_json::to_value(record)?;
        self.put(collection, key, value).await
    }
}

impl<S: Store + ?Sized> StoreExt for S {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = InMemoryStore::new();
        store
            .put(collections::SLOTS, "slot_1", json!({"maxCapacity": 5}))
            .await
            .unwrap();
        let fetched = store.get(collections::SLOTS, "slot_1").await.unwrap();
        assert_eq!(fetched, Some(json!({"maxCapacity": 5})));
    }

    #[tokio::test]
    async fn get_missing_key_is_none() {
        let store = InMemoryStore::new();
        assert_eq!(store.get(collections::SLOTS, "nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn update_if_rejects_failed_predicate() {
        let store = InMemoryStore::new();
        store
            .put(collections::SLOTS, "slot_1", json!({"currentAllocation": 5}))
            .await
            .unwrap();

        let result = store
            .update_if(
                collections::SLOTS,
                "slot_1",
                &|v: &Value| v["currentAllocation"].as_i64() == Some(0),
                &|mut v: Value| {
                    v["currentAllocation"] = json!(6);
                    v
                },
            )
            .await
            .unwrap();
        assert_eq!(result, None);

        let unchanged = store.get(collections::SLOTS, "slot_1").await.unwrap();
        assert_eq!(unchanged, Some(json!({"currentAllocation": 5})));
    }

    #[tokio::test]
    async fn update_if_applies_mutation_when_predicate_holds() {
        let store = InMemoryStore::new();
        store
            .put(collections::SLOTS, "slot_1", json!({"currentAllocation": 5}))
            .await
            .unwrap();

        let result = store
            .update_if(
                collections::SLOTS,
                "slot_1",
                &|v: &Value| v["currentAllocation"].as_i64() == Some(5),
                &|mut v: Value| {
                    v["currentAllocation"] = json!(6);
                    v
                },
            )
            .await
            .unwrap();
        assert_eq!(result, Some(json!({"currentAllocation": 6})));
    }

    #[tokio::test]
    async fn query_applies_filter_sort_and_limit() {
        let store = InMemoryStore::new();
        for i in 1..=5 {
            store
                .put(collections::TOKENS, &format!("t{i}"), json!({"priority": i}))
                .await
                .unwrap();
        }

        let results = store
            .query(
                collections::TOKENS,
                &|v: &Value| v["priority"].as_i64().unwrap() > 1,
                Some(&|a: &Value, b: &Value| {
                    b["priority"].as_i64().cmp(&a["priority"].as_i64())
                }),
                Some(2),
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["priority"], json!(5));
        assert_eq!(results[1]["priority"], json!(4));
    }

    #[tokio::test]
    async fn typed_helpers_round_trip_structs() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Demo {
            name: String,
        }

        let store = InMemoryStore::new();
        store
            .put_typed(collections::CONFIGURATIONS, "k", &Demo { name: "a".into() })
            .await
            .unwrap();
        let fetched: Option<Demo> = store
            .get_typed(collections::CONFIGURATIONS, "k")
            .await
            .unwrap();
        assert_eq!(fetched, Some(Demo { name: "a".into() }));
    }
}
