//! Named config blobs distributed to replicas
//!
//! Blobs are immutable once stored under a name; a replica sees the content
//! that was resolved when it started for its whole lifetime.

use crate::error::{Result, RuntimeError};
use dashmap::DashMap;
use std::sync::Arc;

/// Store of named config blobs
#[derive(Debug, Default)]
pub struct ConfigStore {
    blobs: DashMap<String, Arc<[u8]>>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a blob, replacing any previous content under that name
    pub fn put(&self, name: impl Into<String>, content: impl Into<Vec<u8>>) {
        let content: Vec<u8> = content.into();
        self.blobs.insert(name.into(), Arc::from(content));
    }

    /// Resolve a blob; running replicas keep the Arc they were started with
    pub fn resolve(&self, name: &str) -> Result<Arc<[u8]>> {
        self.blobs
            .get(name)
            .map(|b| Arc::clone(b.value()))
            .ok_or_else(|| RuntimeError::MissingConfig(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.blobs.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolved_content_is_stable() {
        let store = ConfigStore::new();
        store.put("es_config", "cluster.name: a");
        let before = store.resolve("es_config").unwrap();

        store.put("es_config", "cluster.name: b");
        assert_eq!(&*before, b"cluster.name: a");
        assert_eq!(&*store.resolve("es_config").unwrap(), b"cluster.name: b");
        assert!(matches!(
            store.resolve("missing"),
            Err(RuntimeError::MissingConfig(_))
        ));
    }
}
