use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use codeflow_core::ArtifactKey;

use super::{ArtifactError, ArtifactStore, validate_key};

/// In-memory artifact store for tests/dev.
///
/// Has no filesystem paths, so only in-process stages can run against it.
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    blobs: RwLock<HashMap<ArtifactKey, String>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ArtifactStore for InMemoryArtifactStore {
    fn put(&self, key: &ArtifactKey, content: &str) -> Result<(), ArtifactError> {
        validate_key(key)?;
        let mut blobs = self.blobs.write().map_err(|_| ArtifactError::Poisoned)?;
        blobs.insert(key.clone(), content.to_string());
        Ok(())
    }

    fn get(&self, key: &ArtifactKey) -> Result<String, ArtifactError> {
        validate_key(key)?;
        let blobs = self.blobs.read().map_err(|_| ArtifactError::Poisoned)?;
        blobs
            .get(key)
            .cloned()
            .ok_or_else(|| ArtifactError::NotFound(key.clone()))
    }

    fn delete(&self, key: &ArtifactKey) -> Result<(), ArtifactError> {
        validate_key(key)?;
        let mut blobs = self.blobs.write().map_err(|_| ArtifactError::Poisoned)?;
        blobs.remove(key);
        Ok(())
    }
}
