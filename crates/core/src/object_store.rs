use crate::error::{PipelineError, StoreError};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

/// Durable storage of original uploads, addressed by opaque reference.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn fetch(&self, file_ref: &str) -> Result<Vec<u8>, PipelineError>;
}

/// Serves references as relative paths under a root directory.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a reference, refusing anything that would leave the root.
    pub fn resolve(&self, file_ref: &str) -> Result<PathBuf, PipelineError> {
        let relative = Path::new(file_ref);
        let only_normal = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if file_ref.trim().is_empty() || !only_normal {
            return Err(PipelineError::InvalidRequest(format!(
                "file reference '{file_ref}' must be a relative path inside the object store"
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn fetch(&self, file_ref: &str) -> Result<Vec<u8>, PipelineError> {
        let path = self.resolve(file_ref)?;
        tokio::fs::read(&path).await.map_err(|error| match error.kind() {
            ErrorKind::NotFound => StoreError::NotFound {
                entity: "file",
                id: file_ref.to_string(),
            }
            .into(),
            _ => StoreError::Io(error).into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetches_nested_reference() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("uploads")).expect("mkdir");
        std::fs::write(dir.path().join("uploads/a.txt"), b"hello").expect("write");

        let store = FsObjectStore::new(dir.path());
        assert_eq!(store.fetch("uploads/a.txt").await.expect("fetch"), b"hello");
    }

    #[tokio::test]
    async fn escaping_references_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path());
        for file_ref in ["../secret", "/etc/passwd", "a/../../b", ""] {
            assert!(
                matches!(store.fetch(file_ref).await, Err(PipelineError::InvalidRequest(_))),
                "{file_ref} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let error = FsObjectStore::new(dir.path()).fetch("nope.pdf").await.unwrap_err();
        assert_eq!(error.error_code(), "not_found");
    }
}
