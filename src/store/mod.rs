//! Outbound message stores
//!
//! A store keeps in-flight QoS 1/2 publishes until the broker acknowledges
//! them. Backends are looked up by name through the [`StoreRegistry`], which
//! keeps the client builder independent of concrete implementations.
//!
//! # Usage
//!
//! ```rust
//! use tinymqtt::config::StoreConfig;
//! use tinymqtt::store::StoreRegistry;
//!
//! let registry = StoreRegistry::with_builtin_stores();
//! let store = registry
//!     .resolve("memory", &StoreConfig::with_provider("memory"))
//!     .unwrap();
//! store.open().unwrap();
//! assert!(store.all().unwrap().is_empty());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub mod file;
pub mod memory;
pub mod registry;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use registry::{
    register_builtin_stores, BoxError, RegistryError, StoreConstructor, StoreRegistry,
};

/// Registry name of the file-backed store
pub const FILE_STORE: &str = "file";
/// Registry name of the in-memory store
pub const MEMORY_STORE: &str = "memory";

/// A persisted outbound publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPacket {
    pub pkid: u16,
    pub topic: String,
    pub qos: u8,
    pub retain: bool,
    pub payload: Vec<u8>,
}

/// Prefix shared by the keys of outbound packets
pub const OUTBOUND_PREFIX: &str = "o.";

/// Key under which an outbound packet id is stored
pub fn outbound_key(pkid: u16) -> String {
    format!("{OUTBOUND_PREFIX}{pkid}")
}

/// Store operation errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{store} store is not open")]
    NotOpen { store: &'static str },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Persistence capability attached to a session
///
/// Methods take `&self`; implementations synchronise internally so a store can
/// be shared between the caller and the connection task.
pub trait MessageStore: Send + Sync {
    /// Backend name, as registered
    fn name(&self) -> &'static str;

    /// Prepare the store for use
    fn open(&self) -> Result<(), StoreError>;

    /// Release the store; later operations fail with [`StoreError::NotOpen`]
    fn close(&self);

    fn put(&self, key: &str, packet: &StoredPacket) -> Result<(), StoreError>;

    fn get(&self, key: &str) -> Result<Option<StoredPacket>, StoreError>;

    /// All stored keys, sorted
    fn all(&self) -> Result<Vec<String>, StoreError>;

    /// Remove a key; removing an absent key is not an error
    fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Remove every stored packet
    fn reset(&self) -> Result<(), StoreError>;
}

impl fmt::Debug for dyn MessageStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageStore({})", self.name())
    }
}
