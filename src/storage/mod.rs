//! Durable key/value storage for credentials and the cumulative volume.
//!
//! [`KeyValueStore`] is what the rest of the firmware talks to. It is
//! implemented by [`DualSlotStore`], which layers a power-loss safe
//! two-generation scheme over any [`RawStore`] (NVS on the device,
//! [`MemoryStore`] in tests).

pub mod dual_slot;
pub mod memory;
#[cfg(target_os = "espidf")]
pub mod nvs;

pub use dual_slot::{DualSlotStore, MAX_PAYLOAD_LEN};
pub use memory::MemoryStore;
#[cfg(target_os = "espidf")]
pub use nvs::NvsStore;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub const CREDENTIAL_KEY: &str = "cred";
pub const BROKER_KEY: &str = "broker";
pub const METER_KEY: &str = "meter";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("invalid storage key '{0}'")]
    InvalidKey(String),
    #[error("read failed for '{0}'")]
    ReadFailed(String),
    #[error("write failed for '{0}'")]
    WriteFailed(String),
    #[error("erase failed for '{0}'")]
    EraseFailed(String),
    #[error("storage full while writing '{0}'")]
    Full(String),
    #[error("read-back verification failed for '{0}'")]
    VerifyFailed(String),
    #[error("no valid copy of '{0}'")]
    Corrupt(String),
    #[error("value of {len} bytes exceeds {max}")]
    TooLarge { len: usize, max: usize },
    #[error("encoding error: {0}")]
    Encoding(String),
}

/// Durable, power-loss atomic per-key storage.
pub trait KeyValueStore {
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError>;
    fn erase(&mut self, key: &str) -> Result<(), StorageError>;
}

/// Raw blob primitive of a flash backend. No atomicity guarantees.
pub trait RawStore {
    fn read(&mut self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn write(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError>;
    fn remove(&mut self, key: &str) -> Result<(), StorageError>;
}

pub fn load_json<S, T>(store: &mut S, key: &str) -> Result<Option<T>, StorageError>
where
    S: KeyValueStore + ?Sized,
    T: DeserializeOwned,
{
    match store.get(key)? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StorageError::Encoding(format!("{key}: {e}"))),
        None => Ok(None),
    }
}

pub fn store_json<S, T>(store: &mut S, key: &str, value: &T) -> Result<(), StorageError>
where
    S: KeyValueStore + ?Sized,
    T: Serialize,
{
    let bytes =
        serde_json::to_vec(value).map_err(|e| StorageError::Encoding(format!("{key}: {e}")))?;
    store.put(key, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network_config::NetworkCredential;

    #[test]
    fn credential_round_trip_and_erase() {
        let mut store = DualSlotStore::new(MemoryStore::default());
        let credential = NetworkCredential::new("home-net", "correct horse").unwrap();

        store_json(&mut store, CREDENTIAL_KEY, &credential).unwrap();
        let read: Option<NetworkCredential> = load_json(&mut store, CREDENTIAL_KEY).unwrap();
        assert_eq!(read, Some(credential));

        store.erase(CREDENTIAL_KEY).unwrap();
        let read: Option<NetworkCredential> = load_json(&mut store, CREDENTIAL_KEY).unwrap();
        assert_eq!(read, None);
    }

    #[test]
    fn garbage_payload_is_an_encoding_error() {
        let mut store = DualSlotStore::new(MemoryStore::default());
        store.put(CREDENTIAL_KEY, b"not json").unwrap();
        let read: Result<Option<NetworkCredential>, _> = load_json(&mut store, CREDENTIAL_KEY);
        assert!(matches!(read, Err(StorageError::Encoding(_))));
    }
}
