use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use engine_store::{collections, Store};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

const DISPLACEMENT_MARGIN: i64 = 200;
const DEFAULT_LOCK_TTL: StdDuration = StdDuration::from_secs(10);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CapacityError {
    #[error("slot at capacity: {0}")]
    SlotAtCapacity(String),
    #[error("nothing to release on slot: {0}")]
    NothingToRelease(String),
    #[error("slot not found: {0}")]
    SlotNotFound(String),
    #[error("could not acquire scheduling lock for slot: {0}")]
    LockContention(String),
}

impl From<engine_store::StoreError> for CapacityError {
    fn from(err: engine_store::StoreError) -> Self {
        // The in-memory store never actually produces backend faults; this
        // satisfies `?` for callers that thread StoreError through.
        CapacityError::SlotNotFound(err.to_string())
    }
}

/// A token eligible for preemption, as selected by `CapacityGuard::preempt_lowest`.
#[derive(Debug, Clone)]
pub struct PreemptionCandidate {
    pub token_id: String,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
}

/// Owns the only code paths allowed to mutate `Slot.currentAllocation` and
/// `Slot.lastTokenNumber`. Every mutation is a single `Store::update_if`
/// call so the observable invariant `0 <= currentAllocation <= maxCapacity`
/// holds under concurrent callers without a cross-slot lock.
pub struct CapacityGuard {
    store: Arc<dyn Store>,
}

impl CapacityGuard {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn reserve(&self, slot_id: &str) -> Result<u32, CapacityError> {
        let result = self
            .store
            .update_if(
                collections::SLOTS,
                slot_id,
                &|v: &Value| {
                    let current = v["currentAllocation"].as_u64().unwrap_or(0);
                    let max = v["maxCapacity"].as_u64().unwrap_or(0);
                    current < max
                },
                &|mut v: Value| {
                    let current = v["currentAllocation"].as_u64().unwrap_or(0);
                    v["currentAllocation"] = json!(current + 1);
                    v
                },
            )
            .await?;

        match result {
            Some(v) => Ok(v["currentAllocation"].as_u64().unwrap_or_default() as u32),
            None => Err(CapacityError::SlotAtCapacity(slot_id.to_string())),
        }
    }

    /// Reserves past `maxCapacity` unconditionally, used only by
    /// `allocateEmergency`'s `capacity_override` path. Callers are
    /// responsible for recording the override in the token's metadata.
    pub async fn reserve_override(&self, slot_id: &str) -> Result<u32, CapacityError> {
        let exists = self.store.get(collections::SLOTS, slot_id).await?;
        if exists.is_none() {
            return Err(CapacityError::SlotNotFound(slot_id.to_string()));
        }

        let result = self
            .store
            .update_if(
                collections::SLOTS,
                slot_id,
                &|_v: &Value| true,
                &|mut v: Value| {
                    let current = v["currentAllocation"].as_u64().unwrap_or(0);
                    v["currentAllocation"] = json!(current + 1);
                    v
                },
            )
            .await?;

        warn!("capacity override applied to slot {slot_id}");
        Ok(result
            .and_then(|v| v["currentAllocation"].as_u64())
            .unwrap_or_default() as u32)
    }

    pub async fn release(&self, slot_id: &str) -> Result<u32, CapacityError> {
        let result = self
            .store
            .update_if(
                collections::SLOTS,
                slot_id,
                &|v: &Value| v["currentAllocation"].as_u64().unwrap_or(0) > 0,
                &|mut v: Value| {
                    let current = v["currentAllocation"].as_u64().unwrap_or(0);
                    v["currentAllocation"] = json!(current.saturating_sub(1));
                    v
                },
            )
            .await?;

        match result {
            Some(v) => Ok(v["currentAllocation"].as_u64().unwrap_or_default() as u32),
            None => Err(CapacityError::NothingToRelease(slot_id.to_string())),
        }
    }

    pub async fn next_token_number(&self, slot_id: &str) -> Result<u64, CapacityError> {
        let result = self
            .store
            .update_if(
                collections::SLOTS,
                slot_id,
                &|_v: &Value| true,
                &|mut v: Value| {
                    let last = v["lastTokenNumber"].as_u64().unwrap_or(0);
                    v["lastTokenNumber"] = json!(last + 1);
                    v
                },
            )
            .await?;

        result
            .and_then(|v| v["lastTokenNumber"].as_u64())
            .ok_or_else(|| CapacityError::SlotNotFound(slot_id.to_string()))
    }

    /// Selects the live token in `slot_id` most eligible for preemption:
    /// `source != emergency`, `status = allocated`, strictly more than
    /// `DISPLACEMENT_MARGIN` below `incoming_priority`. Ties broken by
    /// earliest `createdAt`. Does not itself mutate anything — the caller
    /// (`AllocationEngine`) performs the actual status transition and the
    /// new token's write.
    pub async fn preempt_lowest(
        &self,
        slot_id: &str,
        incoming_priority: i64,
    ) -> Result<Option<PreemptionCandidate>, CapacityError> {
        let slot_id_owned = slot_id.to_string();
        let candidates = self
            .store
            .query(
                collections::TOKENS,
                &move |v: &Value| {
                    v["slotId"].as_str() == Some(slot_id_owned.as_str())
                        && v["status"].as_str() == Some("allocated")
                        && v["source"].as_str() != Some("emergency")
                        && incoming_priority - v["priority"].as_i64().unwrap_or(i64::MAX)
                            > DISPLACEMENT_MARGIN
                },
                None,
                None,
            )
            .await?;

        let best = candidates.into_iter().min_by(|a, b| {
            let pa = a["priority"].as_i64().unwrap_or(i64::MAX);
            let pb = b["priority"].as_i64().unwrap_or(i64::MAX);
            pa.cmp(&pb).then_with(|| {
                let ca = a["createdAt"].as_str().unwrap_or_default();
                let cb = b["createdAt"].as_str().unwrap_or_default();
                ca.cmp(cb)
            })
        });

        Ok(best.map(|v| PreemptionCandidate {
            token_id: v["tokenId"].as_str().unwrap_or_default().to_string(),
            priority: v["priority"].as_i64().unwrap_or_default(),
            created_at: v["createdAt"]
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(Utc::now),
        }))
    }

    /// Cheap existence check for the emergency endpoint's candidate search:
    /// would `preempt_lowest` find anyone in this slot, without selecting or
    /// mutating anything.
    pub async fn has_preemptible_occupant(&self, slot_id: &str) -> Result<bool, CapacityError> {
        let slot_id_owned = slot_id.to_string();
        let candidates = self
            .store
            .query(
                collections::TOKENS,
                &move |v: &Value| {
                    v["slotId"].as_str() == Some(slot_id_owned.as_str())
                        && v["status"].as_str() == Some("allocated")
                        && v["source"].as_str() != Some("emergency")
                },
                None,
                Some(1),
            )
            .await?;
        Ok(!candidates.is_empty())
    }

    /// Acquires an advisory, slot-scoped lock for the duration the caller
    /// holds the returned guard. Grounded on the acquire/expire shape of a
    /// distributed scheduling lock, but released deterministically by
    /// `Drop` rather than a manual call a caller could forget on an
    /// early-return path.
    pub async fn acquire_slot_lock(&self, slot_id: &str) -> Result<SlotLockGuard, CapacityError> {
        self.acquire_slot_lock_with_ttl(slot_id, DEFAULT_LOCK_TTL).await
    }

    pub async fn acquire_slot_lock_with_ttl(
        &self,
        slot_id: &str,
        ttl: StdDuration,
    ) -> Result<SlotLockGuard, CapacityError> {
        let lock_key = format!("lock_{slot_id}");
        let now = Utc::now();
        let expires_at = now + ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::seconds(10));

        let existing = self.store.get("scheduling_locks", &lock_key).await?;
        let expired = existing.as_ref().map_or(true, |v| {
            v["expiresAt"]
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|d| d.with_timezone(&Utc) < now)
                .unwrap_or(true)
        });

        if !expired {
            return Err(CapacityError::LockContention(slot_id.to_string()));
        }

        self.store
            .put(
                "scheduling_locks",
                &lock_key,
                json!({ "expiresAt": expires_at.to_rfc3339() }),
            )
            .await?;

        info!("acquired scheduling lock for slot {slot_id}");
        Ok(SlotLockGuard {
            store: self.store.clone(),
            lock_key,
        })
    }
}

/// Releases its scheduling lock when dropped. `Store::delete` is async, so
/// the release is dispatched onto the current Tokio runtime rather than run
/// inline in `Drop`; this trades a strictly-synchronous release for never
/// leaking a lock on an early return.
pub struct SlotLockGuard {
    store: Arc<dyn Store>,
    lock_key: String,
}

impl Drop for SlotLockGuard {
    fn drop(&mut self) {
        let store = self.store.clone();
        let lock_key = std::mem::take(&mut self.lock_key);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = store.delete("scheduling_locks", &lock_key).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_store::InMemoryStore;
    use serde_json::json;

    async fn store_with_slot(max_capacity: u64, current: u64) -> Arc<dyn Store> {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        store
            .put(
                collections::SLOTS,
                "s1",
                json!({
                    "maxCapacity": max_capacity,
                    "currentAllocation": current,
                    "lastTokenNumber": 0,
                }),
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn reserve_then_release_is_a_round_trip() {
        let store = store_with_slot(3, 0).await;
        let guard = CapacityGuard::new(store.clone());

        let after_reserve = guard.reserve("s1").await.unwrap();
        assert_eq!(after_reserve, 1);

        let after_release = guard.release("s1").await.unwrap();
        assert_eq!(after_release, 0);
    }

    #[tokio::test]
    async fn reserve_fails_at_capacity() {
        let store = store_with_slot(1, 1).await;
        let guard = CapacityGuard::new(store);
        let result = guard.reserve("s1").await;
        assert_eq!(result, Err(CapacityError::SlotAtCapacity("s1".into())));
    }

    #[tokio::test]
    async fn release_fails_when_already_zero() {
        let store = store_with_slot(3, 0).await;
        let guard = CapacityGuard::new(store);
        let result = guard.release("s1").await;
        assert_eq!(result, Err(CapacityError::NothingToRelease("s1".into())));
    }

    #[tokio::test]
    async fn next_token_number_is_strictly_increasing() {
        let store = store_with_slot(3, 0).await;
        let guard = CapacityGuard::new(store);
        assert_eq!(guard.next_token_number("s1").await.unwrap(), 1);
        assert_eq!(guard.next_token_number("s1").await.unwrap(), 2);
        assert_eq!(guard.next_token_number("s1").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn concurrent_reserves_never_exceed_capacity() {
        let store = store_with_slot(3, 0).await;
        let guard = Arc::new(CapacityGuard::new(store.clone()));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let guard = guard.clone();
            handles.push(tokio::spawn(async move { guard.reserve("s1").await }));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                successes += 1;
            }
        }

        assert_eq!(successes, 3);
        let slot = store.get(collections::SLOTS, "s1").await.unwrap().unwrap();
        assert_eq!(slot["currentAllocation"], json!(3));
    }

    #[tokio::test]
    async fn preempt_lowest_respects_displacement_margin() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        store
            .put(
                collections::TOKENS,
                "t1",
                json!({
                    "slotId": "s1", "status": "allocated", "source": "online",
                    "priority": 420, "tokenId": "t1", "createdAt": "2026-08-01T00:00:00Z"
                }),
            )
            .await
            .unwrap();
        store
            .put(
                collections::TOKENS,
                "t2",
                json!({
                    "slotId": "s1", "status": "allocated", "source": "online",
                    "priority": 400, "tokenId": "t2", "createdAt": "2026-08-01T00:00:01Z"
                }),
            )
            .await
            .unwrap();

        let guard = CapacityGuard::new(store);
        let candidate = guard.preempt_lowest("s1", 1000).await.unwrap().unwrap();
        assert_eq!(candidate.token_id, "t2");
    }

    #[tokio::test]
    async fn has_preemptible_occupant_ignores_emergency_sources() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        store
            .put(
                collections::TOKENS,
                "t1",
                json!({
                    "slotId": "s1", "status": "allocated", "source": "emergency",
                    "priority": 1500, "tokenId": "t1", "createdAt": "2026-08-01T00:00:00Z"
                }),
            )
            .await
            .unwrap();

        let guard = CapacityGuard::new(store.clone());
        assert!(!guard.has_preemptible_occupant("s1").await.unwrap());

        store
            .put(
                collections::TOKENS,
                "t2",
                json!({
                    "slotId": "s1", "status": "allocated", "source": "online",
                    "priority": 400, "tokenId": "t2", "createdAt": "2026-08-01T00:00:01Z"
                }),
            )
            .await
            .unwrap();
        assert!(guard.has_preemptible_occupant("s1").await.unwrap());
    }

    #[tokio::test]
    async fn preempt_lowest_ignores_emergency_and_near_priority_tokens() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        store
            .put(
                collections::TOKENS,
                "t1",
                json!({
                    "slotId": "s1", "status": "allocated", "source": "emergency",
                    "priority": 100, "tokenId": "t1", "createdAt": "2026-08-01T00:00:00Z"
                }),
            )
            .await
            .unwrap();
        store
            .put(
                collections::TOKENS,
                "t2",
                json!({
                    "slotId": "s1", "status": "allocated", "source": "online",
                    "priority": 850, "tokenId": "t2", "createdAt": "2026-08-01T00:00:01Z"
                }),
            )
            .await
            .unwrap();

        let guard = CapacityGuard::new(store);
        let candidate = guard.preempt_lowest("s1", 1000).await.unwrap();
        assert!(candidate.is_none());
    }
}
