use serde::{Serialize, de::DeserializeOwned};

use crate::error::StorageError;

/// Keyed byte store backing durable history and the offline queue.
///
/// Implementations must be safe to share between the editor's components.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Encode `value` as MessagePack and store it under `key`.
pub fn put_encoded<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let bytes = rmp_serde::to_vec_named(value)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    store.set(key, &bytes)
}

/// Load and decode the MessagePack value stored under `key`.
pub fn get_decoded<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match store.get(key)? {
        Some(bytes) => rmp_serde::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StorageError::Serialization(e.to_string())),
        None => Ok(None),
    }
}
