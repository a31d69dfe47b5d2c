//! The key/value side-channel passed to job handlers.
//!
//! Persistent storage is an external collaborator; the engine only needs
//! the read/write contract. [`MemoryDb`] is the in-process default, good
//! for embedding and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

/// Read/write contract of the job side-channel.
#[async_trait]
pub trait Db: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: Vec<u8>) -> anyhow::Result<()>;
}

/// In-memory [`Db`].
#[derive(Default)]
pub struct MemoryDb {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Db for MemoryDb {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> anyhow::Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get() {
        let db = MemoryDb::new();
        assert_eq!(db.get("missing").await.unwrap(), None);

        db.put("key", b"value".to_vec()).await.unwrap();
        assert_eq!(db.get("key").await.unwrap(), Some(b"value".to_vec()));

        db.put("key", b"replaced".to_vec()).await.unwrap();
        assert_eq!(db.get("key").await.unwrap(), Some(b"replaced".to_vec()));
    }
}
