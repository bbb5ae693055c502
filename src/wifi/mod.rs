//! WiFi credential store and connection state machine.
//!
//! # Components
//!
//! - [`storage`] - Durable SSID table and enterprise credentials
//! - [`staging`] - Enterprise upload bookkeeping
//! - [`radio`] - Radio driver interface and station status cell
//! - [`connection`] - Station / access point lifecycle

pub mod connection;
pub mod radio;
pub mod staging;
pub mod storage;

pub use connection::{ConnectionManager, WifiState};
pub use radio::{
    AccessPointSettings, RadioDriver, RadioError, RadioMode, ScanResult, StationStatus,
    StationStatusCell,
};
pub use staging::EnterpriseStaging;
pub use storage::{
    ConfigStore, EnterpriseCredentials, StoreError, CREDENTIAL_CHUNK_SIZE, TABLE_SIZE,
    TABLE_SLOTS,
};
