//! Module configuration.
//!
//! This module provides the credential record stored in the SSID table and
//! the runtime tunables of the control loop. Everything here is
//! platform-independent.
//!
//! # Components
//!
//! - [`credential`] - Credential record layout and validators
//! - [`module`] - Timeouts, intervals and identity defaults

pub mod credential;
pub mod module;

pub use credential::{
    field_bytes, validate_password, validate_ssid, ConfigError, CredentialKind, CredentialRecord,
    Security, EAP_IDENTITY_LENGTH, MAX_AP_CHANNEL, MAX_REMEMBERED_NETWORKS, MIN_PASSWORD_LEN,
    PASSWORD_LENGTH, RECORD_SIZE, REDUCED_RECORD_SIZE, SSID_LENGTH,
};
pub use module::{ModuleConfig, FIRMWARE_VERSION};
