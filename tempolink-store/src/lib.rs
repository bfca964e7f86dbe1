//! # tempolink-store
//!
//! The pluggable session store: an abstract
//! [`Store`] contract with a durable Redis-backed implementation and an
//! in-memory fallback, plus a [`StoreManager`] that selects between them at
//! startup and migrates live sessions between them on backend failure /
//! recovery.

pub mod durable;
pub mod error;
pub mod manager;
pub mod memory;
pub mod traits;

pub use durable::DurableStore;
pub use error::StoreError;
pub use manager::{StoreManager, StoreManagerConfig};
pub use memory::InMemoryStore;
pub use traits::{BackendKind, PubSubHandler, Store, SubscriptionHandle};
