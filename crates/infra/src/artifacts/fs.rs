use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use codeflow_core::ArtifactKey;

use super::{ArtifactError, ArtifactStore, validate_key};

/// Filesystem-backed artifact store.
///
/// Key `a/b` lives at `<root>/a/b`. Writes go to a sibling temp file first and
/// are renamed into place, so readers never observe a half-written blob.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &ArtifactKey) -> Result<PathBuf, ArtifactError> {
        validate_key(key)?;
        Ok(self.root.join(key.as_str()))
    }
}

fn io_error(key: &ArtifactKey, err: std::io::Error) -> ArtifactError {
    if err.kind() == ErrorKind::NotFound {
        return ArtifactError::NotFound(key.clone());
    }
    ArtifactError::Io {
        key: key.clone(),
        message: err.to_string(),
    }
}

impl ArtifactStore for FsArtifactStore {
    fn put(&self, key: &ArtifactKey, content: &str) -> Result<(), ArtifactError> {
        let path = self.path_for(key)?;
        let io = |e: std::io::Error| ArtifactError::Io {
            key: key.clone(),
            message: e.to_string(),
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io)?;
        }
        let tmp = path.with_extension("tmp-write");
        fs::write(&tmp, content).map_err(io)?;
        fs::rename(&tmp, &path).map_err(io)?;
        Ok(())
    }

    fn get(&self, key: &ArtifactKey) -> Result<String, ArtifactError> {
        let path = self.path_for(key)?;
        fs::read_to_string(&path).map_err(|e| io_error(key, e))
    }

    fn delete(&self, key: &ArtifactKey) -> Result<(), ArtifactError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(key, e)),
        }
    }

    fn local_path(&self, key: &ArtifactKey) -> Option<PathBuf> {
        self.path_for(key).ok()
    }
}
