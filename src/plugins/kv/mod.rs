//! String-keyed persistence substrate.
//!
//! Conversation records are stored as JSON text under `conversation_<handle>`
//! keys; other keys may share the same store.

mod error;
mod libsql_store;
mod memory;

use async_trait::async_trait;

pub use error::StoreError;
pub use libsql_store::LibsqlKvStore;
pub use memory::MemoryKvStore;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Insert or overwrite.
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Returns whether a value was present.
    async fn remove(&self, key: &str) -> Result<bool, StoreError>;

    async fn keys(&self) -> Result<Vec<String>, StoreError>;
}
