use super::dual_slot::MAX_PAYLOAD_LEN;
use super::{RawStore, StorageError};
use anyhow::Result;
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use esp_idf_svc::sys::{esp_err_t, EspError, ESP_ERR_NVS_NOT_ENOUGH_SPACE};

const NAMESPACE: &str = "watermeter";
const RECORD_BUF_LEN: usize = MAX_PAYLOAD_LEN + 16;

/// Raw blob access to the default NVS partition.
pub struct NvsStore {
    nvs: EspNvs<NvsDefault>,
}

impl NvsStore {
    pub fn new(partition: EspDefaultNvsPartition) -> Result<Self> {
        let nvs = EspNvs::new(partition, NAMESPACE, true)?;
        log::info!("✅ NVS: Namespace '{}' opened", NAMESPACE);
        Ok(Self { nvs })
    }
}

fn is_full(e: &EspError) -> bool {
    e.code() == ESP_ERR_NVS_NOT_ENOUGH_SPACE as esp_err_t
}

impl RawStore for NvsStore {
    fn read(&mut self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let mut buf = [0u8; RECORD_BUF_LEN];
        match self.nvs.get_raw(key, &mut buf) {
            Ok(found) => Ok(found.map(<[u8]>::to_vec)),
            Err(e) => {
                log::warn!("NVS: Read of '{}' failed: {:?}", key, e);
                Err(StorageError::ReadFailed(key.to_string()))
            }
        }
    }

    fn write(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.nvs.set_raw(key, value).map(|_| ()).map_err(|e| {
            log::warn!("NVS: Write of '{}' failed: {:?}", key, e);
            if is_full(&e) {
                StorageError::Full(key.to_string())
            } else {
                StorageError::WriteFailed(key.to_string())
            }
        })
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        self.nvs.remove(key).map(|_| ()).map_err(|e| {
            log::warn!("NVS: Remove of '{}' failed: {:?}", key, e);
            StorageError::EraseFailed(key.to_string())
        })
    }
}
