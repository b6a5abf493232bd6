use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("backend fault: {0}")]
    Backend(String),
}
