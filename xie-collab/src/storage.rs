//! Flat JSON snapshot storage, one file per document.
//!
//! ```text
//! docs_dir/
//!   a00aa0a.json   {"docId":"a00aa0a","name":"Notes","startText":[...]}
//!   b12cd3e.json
//! ```
//!
//! A save writes the document's head text as the next load's start text;
//! the revision log never reaches the disk. Writes go to a temp file that is
//! renamed over the target, so a crash mid-save leaves the old snapshot.

use std::path::{Path, PathBuf};
use thiserror::Error;
use xie_core::DocumentSnapshot;

use crate::ids::is_safe_id;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("not a valid document id: {0:?}")]
    InvalidId(String),
    #[error("snapshot file {file} holds document {found}")]
    IdMismatch { file: String, found: String },
}

/// Directory of document snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Open the store, creating the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        log::info!("Snapshot store at {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, doc_id: &str) -> Result<PathBuf, StoreError> {
        if !is_safe_id(doc_id) {
            return Err(StoreError::InvalidId(doc_id.to_string()));
        }
        Ok(self.dir.join(format!("{doc_id}.json")))
    }

    /// True if a snapshot file exists for `doc_id`.
    pub async fn exists(&self, doc_id: &str) -> Result<bool, StoreError> {
        let path = self.path_for(doc_id)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    /// Write a snapshot, replacing any previous one.
    pub async fn save(&self, snapshot: &DocumentSnapshot) -> Result<(), StoreError> {
        let path = self.path_for(&snapshot.doc_id)?;
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec(snapshot)?;
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        log::debug!(
            "Saved document {} ({} units, {} bytes)",
            snapshot.doc_id,
            snapshot.start_text.len(),
            json.len()
        );
        Ok(())
    }

    /// Read the snapshot for `doc_id`.
    pub async fn load(&self, doc_id: &str) -> Result<DocumentSnapshot, StoreError> {
        let path = self.path_for(doc_id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(doc_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let snapshot: DocumentSnapshot = serde_json::from_slice(&bytes)?;
        if snapshot.doc_id != doc_id {
            return Err(StoreError::IdMismatch {
                file: doc_id.to_string(),
                found: snapshot.doc_id,
            });
        }
        Ok(snapshot)
    }

    /// Remove the snapshot for `doc_id`.
    pub async fn delete(&self, doc_id: &str) -> Result<(), StoreError> {
        let path = self.path_for(doc_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(doc_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xie_core::{text_from_str, CharUnit};

    fn snapshot(id: &str) -> DocumentSnapshot {
        DocumentSnapshot {
            doc_id: id.to_string(),
            name: "Notes".to_string(),
            start_text: vec![
                CharUnit::from_char('A'),
                CharUnit::with_reading("狗", "gou3").unwrap(),
            ],
        }
    }

    #[tokio::test]
    async fn test_store_open_creates_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("docs");
        let store = SnapshotStore::open(&path).await.unwrap();
        assert!(path.is_dir());
        assert_eq!(store.dir(), path.as_path());
    }

    #[tokio::test]
    async fn test_snapshot_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).await.unwrap();
        let snap = snapshot("a00aa0a");

        assert!(!store.exists("a00aa0a").await.unwrap());
        store.save(&snap).await.unwrap();
        assert!(store.exists("a00aa0a").await.unwrap());
        assert_eq!(store.load("a00aa0a").await.unwrap(), snap);

        let raw = std::fs::read_to_string(dir.path().join("a00aa0a.json")).unwrap();
        assert_eq!(
            raw,
            r#"{"docId":"a00aa0a","name":"Notes","startText":[{"glyph":"A"},{"glyph":"狗","reading":"gou3"}]}"#
        );
    }

    #[tokio::test]
    async fn test_save_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).await.unwrap();
        store.save(&snapshot("a00aa0a")).await.unwrap();

        let mut newer = snapshot("a00aa0a");
        newer.start_text = text_from_str("changed");
        store.save(&newer).await.unwrap();
        assert_eq!(store.load("a00aa0a").await.unwrap(), newer);
        assert!(!dir.path().join("a00aa0a.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_snapshot_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).await.unwrap();
        assert!(matches!(
            store.load("z99zz9z").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.delete("z99zz9z").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).await.unwrap();
        store.save(&snapshot("a00aa0a")).await.unwrap();
        store.delete("a00aa0a").await.unwrap();
        assert!(!store.exists("a00aa0a").await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_unsafe_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).await.unwrap();
        assert!(matches!(
            store.load("../secret").await,
            Err(StoreError::InvalidId(_))
        ));
        assert!(matches!(
            store.save(&snapshot("a/b")).await,
            Err(StoreError::InvalidId(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_and_mismatched_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).await.unwrap();

        std::fs::write(dir.path().join("a00aa0a.json"), "{not json").unwrap();
        assert!(matches!(
            store.load("a00aa0a").await,
            Err(StoreError::Json(_))
        ));

        let other = serde_json::to_string(&snapshot("b11bb1b")).unwrap();
        std::fs::write(dir.path().join("a00aa0a.json"), other).unwrap();
        assert!(matches!(
            store.load("a00aa0a").await,
            Err(StoreError::IdMismatch { .. })
        ));
    }
}
