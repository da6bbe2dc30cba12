//! Name-keyed registry of store constructors
//!
//! Each backend registers exactly once under a unique name. Registration and
//! lookup share one lock, so a registry may be populated while other threads
//! resolve from it.

use super::{file, memory, MessageStore, FILE_STORE, MEMORY_STORE};
use crate::config::StoreConfig;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, error};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Factory turning a `[client.store]` fragment into a ready store
pub type StoreConstructor =
    Arc<dyn Fn(&StoreConfig) -> Result<Arc<dyn MessageStore>, BoxError> + Send + Sync>;

/// Registry misuse and construction failures
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Store driver '{0}' already registered")]
    AlreadyRegistered(String),

    #[error("Store driver '{0}' not registered")]
    NotRegistered(String),

    #[error("Store driver '{name}' failed to construct store")]
    StoreConstructionFailed {
        name: String,
        #[source]
        source: BoxError,
    },
}

static GLOBAL_REGISTRY: Lazy<StoreRegistry> = Lazy::new(StoreRegistry::with_builtin_stores);

/// Thread-safe map of driver name to constructor
#[derive(Default)]
pub struct StoreRegistry {
    constructors: RwLock<HashMap<String, StoreConstructor>>,
}

impl StoreRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the `file` and `memory` backends registered
    pub fn with_builtin_stores() -> Self {
        let registry = Self::new();
        if let Err(e) = register_builtin_stores(&registry) {
            error!("Failed to register builtin stores: {}", e);
        }
        registry
    }

    /// Process-wide registry, populated with the builtin backends on first use
    pub fn global() -> &'static StoreRegistry {
        &GLOBAL_REGISTRY
    }

    /// Install a constructor under `name`
    ///
    /// Names are never overwritten: a second registration under the same name
    /// fails and leaves the first constructor in place.
    pub fn register<F>(&self, name: &str, constructor: F) -> Result<(), RegistryError>
    where
        F: Fn(&StoreConfig) -> Result<Arc<dyn MessageStore>, BoxError> + Send + Sync + 'static,
    {
        if name.is_empty() {
            return Err(RegistryError::InvalidArgument(
                "store driver name is empty".to_string(),
            ));
        }

        let mut constructors = self
            .constructors
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if constructors.contains_key(name) {
            return Err(RegistryError::AlreadyRegistered(name.to_string()));
        }
        constructors.insert(name.to_string(), Arc::new(constructor));

        debug!(driver = %name, "Registered store driver");
        Ok(())
    }

    /// Build a store with the constructor registered under `name`
    pub fn resolve(
        &self,
        name: &str,
        config: &StoreConfig,
    ) -> Result<Arc<dyn MessageStore>, RegistryError> {
        if name.is_empty() {
            return Err(RegistryError::InvalidArgument(
                "store driver name is empty".to_string(),
            ));
        }

        // Clone out so the constructor runs without holding the lock
        let constructor = self
            .constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotRegistered(name.to_string()))?;

        debug!(driver = %name, "Constructing store");
        constructor(config).map_err(|source| RegistryError::StoreConstructionFailed {
            name: name.to_string(),
            source,
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Registered driver names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("drivers", &self.names())
            .finish()
    }
}

/// Register the builtin backends, in a fixed order
pub fn register_builtin_stores(registry: &StoreRegistry) -> Result<(), RegistryError> {
    registry.register(FILE_STORE, file::new_file_store)?;
    registry.register(MEMORY_STORE, memory::new_memory_store)?;
    Ok(())
}
