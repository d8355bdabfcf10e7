//! Local key/value storage consumed by the DHT handlers.
//!
//! The router only needs `put` and `get`; anything that can answer those for
//! byte keys works. [`MapDatastore`] is the in-memory default and what the
//! tests run against.

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatastoreError {
    #[error("key not found")]
    NotFound,

    #[error("datastore i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Byte-keyed storage interface.
pub trait Datastore: Send + Sync {
    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), DatastoreError>;
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, DatastoreError>;
}

/// HashMap-backed datastore.
#[derive(Default)]
pub struct MapDatastore {
    map: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MapDatastore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Datastore for MapDatastore {
    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), DatastoreError> {
        self.map
            .write()
            .expect("datastore lock poisoned")
            .insert(key.to_vec(), value);
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Vec<u8>, DatastoreError> {
        self.map
            .read()
            .expect("datastore lock poisoned")
            .get(key)
            .cloned()
            .ok_or(DatastoreError::NotFound)
    }
}
