//! Resource provider seam
//!
//! The Robot subsystem never touches the engine's resource manager directly;
//! it consumes raw resource bytes through this narrow interface. Loaded
//! resources stay locked until the subsystem releases them - the mixer defers
//! unlocks issued from the realtime mix thread back to the main thread (see
//! `audio::mixer`).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::warn;

/// Resource kinds the subsystem can request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// A Robot animation container
    Robot,
    /// An audio sample resource (SOL, WAVE or raw PCM)
    Audio,
}

impl ResourceKind {
    fn extension(self) -> &'static str {
        match self {
            ResourceKind::Robot => "rbt",
            ResourceKind::Audio => "aud",
        }
    }
}

/// Narrow interface to the engine's resource/caching layer
///
/// `load` locks the resource and returns its raw bytes; `None` means the
/// resource does not exist (games sometimes reference missing assets
/// intentionally, so callers warn and proceed). `unlock` must only ever be
/// called from the main thread.
pub trait ResourceProvider: Send + Sync {
    fn load(&self, kind: ResourceKind, id: u32) -> Option<Arc<Vec<u8>>>;
    fn unlock(&self, kind: ResourceKind, id: u32);
}

/// Directory-backed resource provider
///
/// Resolves resource ids to `<root>/<id>.<ext>` files. Locking is a no-op:
/// the bytes are owned copies.
pub struct DirectoryResources {
    root: PathBuf,
}

impl DirectoryResources {
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            anyhow::bail!("resource directory {} does not exist", root.display());
        }
        Ok(Self { root })
    }
}

impl ResourceProvider for DirectoryResources {
    fn load(&self, kind: ResourceKind, id: u32) -> Option<Arc<Vec<u8>>> {
        let path = self.root.join(format!("{id}.{}", kind.extension()));
        match std::fs::read(&path) {
            Ok(bytes) => Some(Arc::new(bytes)),
            Err(e) => {
                warn!("failed to read resource {}: {}", path.display(), e);
                None
            }
        }
    }

    fn unlock(&self, _kind: ResourceKind, _id: u32) {}
}

/// In-memory resource provider for tools and tests
///
/// Records unlock calls so tests can assert the deferred-unlock contract.
#[derive(Default)]
pub struct MemoryResources {
    entries: Mutex<HashMap<(ResourceKind, u32), Arc<Vec<u8>>>>,
    unlocked: Mutex<Vec<(ResourceKind, u32)>>,
}

impl MemoryResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, kind: ResourceKind, id: u32, bytes: Vec<u8>) {
        self.entries
            .lock()
            .unwrap()
            .insert((kind, id), Arc::new(bytes));
    }

    /// Unlock calls seen so far, in order
    pub fn unlocks(&self) -> Vec<(ResourceKind, u32)> {
        self.unlocked.lock().unwrap().clone()
    }
}

impl ResourceProvider for MemoryResources {
    fn load(&self, kind: ResourceKind, id: u32) -> Option<Arc<Vec<u8>>> {
        self.entries.lock().unwrap().get(&(kind, id)).cloned()
    }

    fn unlock(&self, kind: ResourceKind, id: u32) {
        self.unlocked.lock().unwrap().push((kind, id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_resources() {
        let res = MemoryResources::new();
        res.insert(ResourceKind::Audio, 7, vec![1, 2, 3]);

        let bytes = res.load(ResourceKind::Audio, 7).unwrap();
        assert_eq!(*bytes, vec![1, 2, 3]);
        assert!(res.load(ResourceKind::Robot, 7).is_none());

        res.unlock(ResourceKind::Audio, 7);
        assert_eq!(res.unlocks(), vec![(ResourceKind::Audio, 7)]);
    }

    #[test]
    fn test_directory_resources() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("9.aud"), [4u8, 5, 6]).unwrap();

        let res = DirectoryResources::new(dir.path()).unwrap();
        let bytes = res.load(ResourceKind::Audio, 9).unwrap();
        assert_eq!(*bytes, vec![4, 5, 6]);
        assert!(res.load(ResourceKind::Audio, 10).is_none());
    }

    #[test]
    fn test_directory_missing_root() {
        assert!(DirectoryResources::new("/definitely/not/here").is_err());
    }
}
