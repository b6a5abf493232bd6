use chrono::Utc;
use engine_store::{collections, Store};
use rand::Rng;

use crate::models::AllocationError;

const SUFFIX_LEN: usize = 9;
const SUFFIX_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const MAX_ATTEMPTS: u32 = 5;

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..SUFFIX_LEN)
        .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect()
}

fn build_token_id(emergency: bool) -> String {
    let prefix = if emergency { "emergency" } else { "token" };
    format!("{prefix}_{}_{}", Utc::now().timestamp_millis(), random_suffix())
}

/// `token_<unixMs>_<9-char base36>`, or `emergency_...` for the emergency
/// path. Collisions are vanishingly unlikely but checked and retried rather
/// than assumed away, since the id doubles as the tokens-collection key.
pub async fn generate_token_id(store: &dyn Store, emergency: bool) -> Result<String, AllocationError> {
    for _ in 0..MAX_ATTEMPTS {
        let candidate = build_token_id(emergency);
        let exists = store
            .get(collections::TOKENS, &candidate)
            .await
            .map_err(|e| AllocationError::StoreFault(e.to_string()))?;
        if exists.is_none() {
            return Ok(candidate);
        }
    }
    Err(AllocationError::StoreFault(
        "exhausted retries generating a unique token id".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_store::InMemoryStore;

    #[tokio::test]
    async fn generated_ids_carry_the_expected_prefix() {
        let store = InMemoryStore::new();
        let id = generate_token_id(&store, false).await.unwrap();
        assert!(id.starts_with("token_"));
        let emergency_id = generate_token_id(&store, true).await.unwrap();
        assert!(emergency_id.starts_with("emergency_"));
    }

    #[tokio::test]
    async fn generated_ids_do_not_collide_with_an_existing_key() {
        let store = InMemoryStore::new();
        let first = generate_token_id(&store, false).await.unwrap();
        store
            .put(collections::TOKENS, &first, serde_json::json!({}))
            .await
            .unwrap();
        let second = generate_token_id(&store, false).await.unwrap();
        assert_ne!(first, second);
    }
}
