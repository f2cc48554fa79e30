// ============================================================================
// Passivation Store
// ============================================================================
//
// Where evicted conversational state goes. Images are serialized with
// MessagePack; the file-backed store writes through a temp file so a crash
// mid-write never leaves a truncated image behind.
// ============================================================================

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::core::{ContainerError, EntityKey, InstanceId, Result, StateMap};

/// Serialized form of an evicted instance. Carries enough wall-clock
/// bookkeeping to enforce the session timeout against instances that expire
/// while passivated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassivatedImage {
    pub id: InstanceId,
    pub component: String,
    pub conversation: StateMap,
    pub entity_key: Option<EntityKey>,
    pub created: DateTime<Utc>,
    pub passivated_at: DateTime<Utc>,
}

impl PassivatedImage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Backing store for passivated-state images.
///
/// `activate` removes the image it returns; an image is consumed exactly
/// once.
#[async_trait]
pub trait PassivationStore: Send + Sync {
    async fn passivate(&self, image: PassivatedImage) -> Result<()>;

    async fn activate(&self, id: InstanceId) -> Result<Option<PassivatedImage>>;

    async fn discard(&self, id: InstanceId) -> Result<()>;

    async fn count(&self) -> usize;
}

/// In-process store. Images are still encoded so the serialization path is
/// exercised identically to the file-backed store.
pub struct MemoryPassivationStore {
    images: Mutex<HashMap<InstanceId, Vec<u8>>>,
}

impl MemoryPassivationStore {
    pub fn new() -> Self {
        Self {
            images: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryPassivationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PassivationStore for MemoryPassivationStore {
    async fn passivate(&self, image: PassivatedImage) -> Result<()> {
        let bytes = image.encode()?;
        debug!("Passivated {} ({} bytes, in memory)", image.id, bytes.len());
        self.images.lock()?.insert(image.id, bytes);
        Ok(())
    }

    async fn activate(&self, id: InstanceId) -> Result<Option<PassivatedImage>> {
        let bytes = self.images.lock()?.remove(&id);
        match bytes {
            Some(bytes) => Ok(Some(PassivatedImage::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn discard(&self, id: InstanceId) -> Result<()> {
        self.images.lock()?.remove(&id);
        Ok(())
    }

    async fn count(&self) -> usize {
        self.images.lock().map(|m| m.len()).unwrap_or(0)
    }
}

/// Disk-backed store, one `.state` file per instance under a spool
/// directory.
pub struct FilePassivationStore {
    dir: PathBuf,
}

impl FilePassivationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: InstanceId) -> PathBuf {
        self.dir.join(format!("{}.state", id))
    }
}

#[async_trait]
impl PassivationStore for FilePassivationStore {
    async fn passivate(&self, image: PassivatedImage) -> Result<()> {
        let bytes = image.encode()?;
        let path = self.path_for(image.id);

        // Write to a temp file in the same directory, then rename into
        // place. Rename within one filesystem is atomic.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&bytes)?;
        tmp.flush()?;
        tmp.persist(&path)
            .map_err(|e| ContainerError::Passivation(format!("persist {}: {}", image.id, e)))?;

        debug!(
            "Passivated {} to {} ({} bytes)",
            image.id,
            path.display(),
            bytes.len()
        );
        Ok(())
    }

    async fn activate(&self, id: InstanceId) -> Result<Option<PassivatedImage>> {
        let path = self.path_for(id);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let image = PassivatedImage::decode(&bytes)?;
        std::fs::remove_file(&path)?;
        Ok(Some(image))
    }

    async fn discard(&self, id: InstanceId) -> Result<()> {
        let path = self.path_for(id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn count(&self) -> usize {
        std::fs::read_dir(&self.dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| {
                        e.path().extension().map(|ext| ext == "state").unwrap_or(false)
                    })
                    .count()
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;

    fn sample_image() -> PassivatedImage {
        let mut conversation = StateMap::new();
        conversation.insert("counter".to_string(), Value::Integer(7));
        conversation.insert("name".to_string(), Value::from("alice"));
        PassivatedImage {
            id: InstanceId::new(),
            component: "CartBean".to_string(),
            conversation,
            entity_key: None,
            created: Utc::now(),
            passivated_at: Utc::now(),
        }
    }

    #[test]
    fn test_image_encoding() {
        let image = sample_image();
        let bytes = image.encode().unwrap();
        let decoded = PassivatedImage::decode(&bytes).unwrap();

        assert_eq!(decoded.id, image.id);
        assert_eq!(decoded.component, "CartBean");
        assert_eq!(decoded.conversation.get("counter"), Some(&Value::Integer(7)));
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryPassivationStore::new();
        let image = sample_image();
        let id = image.id;

        store.passivate(image).await.unwrap();
        assert_eq!(store.count().await, 1);

        let restored = store.activate(id).await.unwrap().unwrap();
        assert_eq!(restored.id, id);

        // Activation consumes the image
        assert!(store.activate(id).await.unwrap().is_none());
        assert_eq!(store.count().await, 0);
    }

    #[tokio::test]
    async fn test_memory_store_discard() {
        let store = MemoryPassivationStore::new();
        let image = sample_image();
        let id = image.id;

        store.passivate(image).await.unwrap();
        store.discard(id).await.unwrap();
        assert!(store.activate(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePassivationStore::new(dir.path()).unwrap();
        let image = sample_image();
        let id = image.id;

        store.passivate(image).await.unwrap();
        assert_eq!(store.count().await, 1);

        let restored = store.activate(id).await.unwrap().unwrap();
        assert_eq!(restored.id, id);
        assert_eq!(
            restored.conversation.get("name"),
            Some(&Value::from("alice"))
        );

        // Image file is gone after activation
        assert_eq!(store.count().await, 0);
        assert!(store.activate(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_discard_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePassivationStore::new(dir.path()).unwrap();
        store.discard(InstanceId::new()).await.unwrap();
    }
}
