//! Key/value store for sharing circuit state across instances.

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait CircuitStateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}
