//! Key-addressed blob storage for submissions, intermediate and final outputs.
//!
//! ## Key rules
//!
//! Keys are relative, `/`-separated paths. Empty keys, absolute paths and
//! `.`/`..` segments are rejected so a key can never escape the store root of
//! a filesystem backend. Writers get last-write-wins semantics; the
//! dispatcher gives every job its own `<job-id>/` namespace, so two jobs never
//! write the same key.

use std::path::PathBuf;

use codeflow_core::ArtifactKey;

pub mod fs;
pub mod in_memory;

pub use fs::FsArtifactStore;
pub use in_memory::InMemoryArtifactStore;

/// Artifact store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArtifactError {
    #[error("artifact not found: {0}")]
    NotFound(ArtifactKey),
    #[error("invalid artifact key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },
    #[error("artifact io error for {key}: {message}")]
    Io { key: ArtifactKey, message: String },
    #[error("artifact store lock poisoned")]
    Poisoned,
}

/// Blob store abstraction.
pub trait ArtifactStore: Send + Sync {
    /// Write `content` under `key`, replacing any previous content.
    fn put(&self, key: &ArtifactKey, content: &str) -> Result<(), ArtifactError>;

    /// Read the content stored under `key`.
    fn get(&self, key: &ArtifactKey) -> Result<String, ArtifactError>;

    /// Remove `key`. Removing a missing key is not an error.
    fn delete(&self, key: &ArtifactKey) -> Result<(), ArtifactError>;

    /// Filesystem location backing `key`, for stages that run external
    /// programs. Stores without a filesystem representation return `None`.
    fn local_path(&self, key: &ArtifactKey) -> Option<PathBuf> {
        let _ = key;
        None
    }
}

/// Check that `key` is a safe relative path.
pub fn validate_key(key: &ArtifactKey) -> Result<(), ArtifactError> {
    let raw = key.as_str();
    let invalid = |reason| ArtifactError::InvalidKey {
        key: raw.to_string(),
        reason,
    };

    if raw.is_empty() {
        return Err(invalid("empty key"));
    }
    if raw.starts_with('/') || raw.contains('\\') || raw.contains(':') {
        return Err(invalid("key must be a relative path"));
    }
    for segment in raw.split('/') {
        match segment {
            "" => return Err(invalid("empty path segment")),
            "." | ".." => return Err(invalid("relative path segment")),
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_namespaced_keys() {
        assert!(validate_key(&ArtifactKey::new("job/submission")).is_ok());
        assert!(validate_key(&ArtifactKey::new("job/01-api")).is_ok());
    }

    #[test]
    fn rejects_escaping_keys() {
        for raw in ["", "/etc/passwd", "../up", "a/../../b", "a//b", "a/./b", "c:\\x"] {
            let err = validate_key(&ArtifactKey::new(raw)).unwrap_err();
            assert!(matches!(err, ArtifactError::InvalidKey { .. }), "{raw}");
        }
    }
}
