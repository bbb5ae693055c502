//! NVS-backed key-value engine for enterprise credential chunks.

use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use esp_idf_sys::EspError;
use log::info;

use super::storage_error;
use crate::platform::{KvEngine, PlatformError};

/// NVS namespace holding credential chunks.
pub const CREDENTIAL_NAMESPACE: &str = "creds";

/// One NVS namespace used as a [`KvEngine`].
pub struct NvsKvEngine {
    nvs: EspNvs<NvsDefault>,
}

impl NvsKvEngine {
    /// Open (creating if needed) the credential namespace.
    pub fn open(partition: EspDefaultNvsPartition) -> Result<Self, EspError> {
        let nvs = EspNvs::new(partition, CREDENTIAL_NAMESPACE, true)?;
        info!("NVS namespace '{}' opened", CREDENTIAL_NAMESPACE);
        Ok(Self { nvs })
    }
}

impl KvEngine for NvsKvEngine {
    fn get(&self, key: &str, buf: &mut [u8]) -> Result<Option<usize>, PlatformError> {
        self.nvs
            .get_raw(key, buf)
            .map(|value| value.map(<[u8]>::len))
            .map_err(storage_error)
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), PlatformError> {
        self.nvs
            .set_raw(key, value)
            .map(|_| ())
            .map_err(storage_error)
    }

    fn remove(&mut self, key: &str) -> Result<bool, PlatformError> {
        self.nvs.remove(key).map_err(storage_error)
    }
}
