//! File-backed store
//!
//! One JSON file per key (`<key>.msg`) inside the configured directory. Writes
//! go to a temporary file first and are renamed into place.

use super::{BoxError, MessageStore, StoreError, StoredPacket, FILE_STORE};
use crate::config::StoreConfig;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

const MSG_EXT: &str = "msg";

/// Directory-backed store
#[derive(Debug)]
pub struct FileStore {
    directory: PathBuf,
    opened: AtomicBool,
}

impl FileStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            opened: AtomicBool::new(false),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.opened.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::NotOpen { store: FILE_STORE })
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.directory.join(format!("{key}.{MSG_EXT}"))
    }

    fn stored_files(&self) -> Result<Vec<(String, PathBuf)>, StoreError> {
        let entries = std::fs::read_dir(&self.directory)
            .map_err(|e| StoreError::io(&self.directory, e))?;

        let mut files = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| StoreError::io(&self.directory, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(MSG_EXT) {
                continue;
            }
            if let Some(key) = path.file_stem().and_then(|s| s.to_str()) {
                files.push((key.to_string(), path.clone()));
            }
        }
        files.sort();
        Ok(files)
    }
}

impl MessageStore for FileStore {
    fn name(&self) -> &'static str {
        FILE_STORE
    }

    fn open(&self) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.directory)
            .map_err(|e| StoreError::io(&self.directory, e))?;
        self.opened.store(true, Ordering::SeqCst);
        debug!(directory = %self.directory.display(), "File store opened");
        Ok(())
    }

    fn close(&self) {
        self.opened.store(false, Ordering::SeqCst);
    }

    fn put(&self, key: &str, packet: &StoredPacket) -> Result<(), StoreError> {
        self.ensure_open()?;
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");

        let bytes = serde_json::to_vec(packet)?;
        std::fs::write(&tmp, bytes).map_err(|e| StoreError::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| StoreError::io(&path, e))
    }

    fn get(&self, key: &str) -> Result<Option<StoredPacket>, StoreError> {
        self.ensure_open()?;
        let path = self.path_for(key);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    fn all(&self) -> Result<Vec<String>, StoreError> {
        self.ensure_open()?;
        Ok(self.stored_files()?.into_iter().map(|(key, _)| key).collect())
    }

    fn del(&self, key: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        let path = self.path_for(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    fn reset(&self) -> Result<(), StoreError> {
        self.ensure_open()?;
        for (_, path) in self.stored_files()? {
            std::fs::remove_file(&path).map_err(|e| StoreError::io(&path, e))?;
        }
        Ok(())
    }
}

/// Registry constructor
///
/// Reads `directory` from the fragment; without one the store lives in the
/// current working directory.
pub fn new_file_store(config: &StoreConfig) -> Result<Arc<dyn MessageStore>, BoxError> {
    let directory = config.get_str("directory").unwrap_or(".");
    Ok(Arc::new(FileStore::new(directory)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(pkid: u16) -> StoredPacket {
        StoredPacket {
            pkid,
            topic: "devices/42/state".to_string(),
            qos: 2,
            retain: true,
            payload: vec![0, 1, 2, 255],
        }
    }

    #[test]
    fn test_open_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        let store = FileStore::new(&nested);

        store.open().unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn test_put_get_all_del() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.open().unwrap();

        store.put("o.7", &packet(7)).unwrap();
        store.put("o.3", &packet(3)).unwrap();
        std::fs::write(dir.path().join("unrelated.txt"), "x").unwrap();

        assert_eq!(store.all().unwrap(), vec!["o.3", "o.7"]);
        assert_eq!(store.get("o.7").unwrap(), Some(packet(7)));
        assert_eq!(store.get("o.99").unwrap(), None);

        store.del("o.7").unwrap();
        store.del("o.7").unwrap();
        assert_eq!(store.all().unwrap(), vec!["o.3"]);
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::new(dir.path());
            store.open().unwrap();
            store.put("o.1", &packet(1)).unwrap();
            store.close();
        }

        let store = FileStore::new(dir.path());
        store.open().unwrap();
        assert_eq!(store.get("o.1").unwrap(), Some(packet(1)));
    }

    #[test]
    fn test_reset_keeps_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.open().unwrap();
        store.put("o.1", &packet(1)).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "keep me").unwrap();

        store.reset().unwrap();
        assert!(store.all().unwrap().is_empty());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn test_closed_store_rejects_operations() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        assert!(matches!(store.get("o.1"), Err(StoreError::NotOpen { .. })));
    }

    #[test]
    fn test_constructor_defaults_directory() {
        let store = new_file_store(&StoreConfig::with_provider("file")).unwrap();
        assert_eq!(store.name(), "file");
    }
}
