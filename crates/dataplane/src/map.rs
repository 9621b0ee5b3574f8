//! Map backends.
//!
//! [`MapBackend`] is the seam between the typed map context and the storage
//! behind it: pinned kernel maps in production, an in-memory table in tests.

use crate::error::DataplaneError;
use aya::maps::{HashMap, Map, MapData, MapError};
use std::path::Path;
use tracing::debug;

/// Byte-level hash map with fixed key and value sizes.
pub trait MapBackend<const K: usize, const V: usize>: Send {
    /// Creates or replaces the entry for `key`.
    fn upsert(&mut self, key: [u8; K], value: [u8; V]) -> Result<(), DataplaneError>;

    /// Removes the entry for `key`; returns whether one existed.
    fn delete(&mut self, key: &[u8; K]) -> Result<bool, DataplaneError>;

    /// Reads the entry for `key`.
    fn get(&self, key: &[u8; K]) -> Result<Option<[u8; V]>, DataplaneError>;

    /// Reads every entry.
    fn entries(&self) -> Result<Vec<([u8; K], [u8; V])>, DataplaneError>;
}

/// Hash map pinned on bpffs.
pub struct PinnedMap<const K: usize, const V: usize> {
    name: &'static str,
    map: HashMap<MapData, [u8; K], [u8; V]>,
}

impl<const K: usize, const V: usize> std::fmt::Debug for PinnedMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedMap").field("name", &self.name).finish_non_exhaustive()
    }
}

impl<const K: usize, const V: usize> PinnedMap<K, V> {
    /// Opens the map pinned at `path`.
    ///
    /// Fails if the pinned map is not a hash map with `K`-byte keys and
    /// `V`-byte values.
    pub fn open(name: &'static str, path: &Path) -> Result<Self, DataplaneError> {
        let load_err = |source| DataplaneError::MapLoad {
            map: name,
            path: path.to_path_buf(),
            source,
        };

        debug!("Loading {} map from {}", name, path.display());
        let data = MapData::from_pin(path).map_err(load_err)?;
        let map: HashMap<MapData, [u8; K], [u8; V]> = Map::HashMap(data).try_into().map_err(load_err)?;
        Ok(Self { name, map })
    }

    fn backend_err(&self, source: MapError) -> DataplaneError {
        DataplaneError::Backend {
            map: self.name,
            source: Box::new(source),
        }
    }
}

impl<const K: usize, const V: usize> MapBackend<K, V> for PinnedMap<K, V> {
    fn upsert(&mut self, key: [u8; K], value: [u8; V]) -> Result<(), DataplaneError> {
        self.map.insert(key, value, 0).map_err(|e| self.backend_err(e))
    }

    fn delete(&mut self, key: &[u8; K]) -> Result<bool, DataplaneError> {
        if self.get(key)?.is_none() {
            return Ok(false);
        }
        self.map.remove(key).map_err(|e| self.backend_err(e))?;
        Ok(true)
    }

    fn get(&self, key: &[u8; K]) -> Result<Option<[u8; V]>, DataplaneError> {
        match self.map.get(key, 0) {
            Ok(value) => Ok(Some(value)),
            Err(MapError::KeyNotFound) => Ok(None),
            Err(e) => Err(self.backend_err(e)),
        }
    }

    fn entries(&self) -> Result<Vec<([u8; K], [u8; V])>, DataplaneError> {
        self.map
            .iter()
            .map(|entry| entry.map_err(|e| self.backend_err(e)))
            .collect()
    }
}

#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryMap;

#[cfg(any(test, feature = "test-util"))]
mod memory {
    use super::MapBackend;
    use crate::error::DataplaneError;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    /// In-memory map for testing
    ///
    /// Clones share the same table, so a test can keep a handle while the
    /// code under test owns another.
    #[derive(Debug, Clone, Default)]
    pub struct MemoryMap<const K: usize, const V: usize> {
        entries: Arc<Mutex<BTreeMap<[u8; K], [u8; V]>>>,
        fail_writes: bool,
    }

    impl<const K: usize, const V: usize> MemoryMap<K, V> {
        /// Creates an empty map.
        pub fn new() -> Self {
            Self {
                entries: Arc::default(),
                fail_writes: false,
            }
        }

        /// Creates a map whose writes fail.
        pub fn failing() -> Self {
            Self {
                entries: Arc::default(),
                fail_writes: true,
            }
        }

        fn table(&self) -> std::sync::MutexGuard<'_, BTreeMap<[u8; K], [u8; V]>> {
            self.entries.lock().unwrap_or_else(|e| e.into_inner())
        }

        fn check_writable(&self) -> Result<(), DataplaneError> {
            if self.fail_writes {
                return Err(DataplaneError::Backend {
                    map: "memory",
                    source: "write rejected".into(),
                });
            }
            Ok(())
        }
    }

    impl<const K: usize, const V: usize> MapBackend<K, V> for MemoryMap<K, V> {
        fn upsert(&mut self, key: [u8; K], value: [u8; V]) -> Result<(), DataplaneError> {
            self.check_writable()?;
            self.table().insert(key, value);
            Ok(())
        }

        fn delete(&mut self, key: &[u8; K]) -> Result<bool, DataplaneError> {
            self.check_writable()?;
            Ok(self.table().remove(key).is_some())
        }

        fn get(&self, key: &[u8; K]) -> Result<Option<[u8; V]>, DataplaneError> {
            Ok(self.table().get(key).copied())
        }

        fn entries(&self) -> Result<Vec<([u8; K], [u8; V])>, DataplaneError> {
            Ok(self.table().iter().map(|(k, v)| (*k, *v)).collect())
        }
    }
}
