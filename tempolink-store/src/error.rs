//! The `Store` error taxonomy. Every `Store`/`StoreManager` method returns
//! `Result<_, StoreError>`; `is_connection_lost` is how `StoreManager`
//! decides whether a failure warrants a live fallback.

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
 #[error("store backend unreachable: {0}")]
 Unavailable(String),

 #[error("session already exists")]
 AlreadyExists,

 #[error("serialization failure: {0}")]
 Serialization(String),

 #[error("backend error: {0}")]
 Backend(String),
}

impl StoreError {
 /// Whether this failure should be classified as "connection lost" for
 /// `StoreManager`'s fallback trigger.
 pub fn is_connection_lost(&self) -> bool {
 matches!(self, StoreError::Unavailable(_))
 }
}

impl From<serde_json::Error> for StoreError {
 fn from(e: serde_json::Error) -> Self {
 StoreError::Serialization(e.to_string())
 }
}
