use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use vstore_model::Hash;

use crate::{KeySpace, LocalStore, Result};

/// In-memory [`LocalStore`]. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<(KeySpace, Hash), Bytes>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, space: KeySpace, hash: &Hash) -> bool {
        self.records.contains_key(&(space, *hash))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn get(&self, space: KeySpace, hash: &Hash) -> Result<Option<Bytes>> {
        Ok(self.records.get(&(space, *hash)).map(|r| r.value().clone()))
    }

    async fn put(&self, space: KeySpace, hash: &Hash, data: Bytes) -> Result<()> {
        self.records.entry((space, *hash)).or_insert(data);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
