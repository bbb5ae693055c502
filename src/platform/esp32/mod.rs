//! ESP-IDF collaborators.
//!
//! # Components
//!
//! - [`bus`] - Host bus over the HSPI peripheral and the handshake GPIOs
//! - [`nvs`] - Key-value engine over an NVS namespace
//! - [`partition`] - Raw flash partitions
//! - [`radio`] - WiFi driver with event-driven station status
//! - [`system`] - Heap, reset reason, watchdog and delays

pub mod bus;
pub mod nvs;
pub mod partition;
pub mod radio;
pub mod system;

pub use bus::{EspGpioLines, EspHostBus};
pub use nvs::NvsKvEngine;
pub use partition::FlashPartition;
pub use radio::EspRadio;
pub use system::EspSystem;

use esp_idf_sys::EspError;

use super::PlatformError;

/// Label of the SSID table partition.
pub const SSID_PARTITION: &str = "ssids";

/// Label of the enterprise staging partition.
pub const SCRATCH_PARTITION: &str = "scratch";

pub(crate) fn storage_error(e: EspError) -> PlatformError {
    PlatformError::Storage(e.to_string())
}

impl From<EspError> for PlatformError {
    fn from(e: EspError) -> Self {
        Self::Driver(e.to_string())
    }
}
