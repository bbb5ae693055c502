//! WiFi co-processor firmware library.
//!
//! This library contains the control plane of a network co-processor that
//! bridges a host controller on a word-synchronous serial bus to a WiFi
//! network. Everything here is platform-independent and can be tested on the
//! host machine; the ESP32 collaborators live behind the `esp32` feature.
//!
//! # Components
//!
//! - [`config`] - Credential records, validators and runtime tunables
//! - [`wifi`] - Credential store and connection state machine
//! - [`protocol`] - Bus transaction wire format and dispatch engine
//! - [`runtime`] - Control loop and attention signaling
//! - [`platform`] - Collaborator traits and host implementations

pub mod config;
pub mod platform;
pub mod protocol;
pub mod runtime;
pub mod state;
pub mod wifi;

// Re-export commonly used items
pub use config::{ConfigError, CredentialRecord, ModuleConfig};
pub use protocol::{Command, PendingOperation, ResponseCode, TransactionEngine};
pub use runtime::{InitError, Module, Platform, TransferReadyFlag};
pub use state::ModuleState;
pub use wifi::{ConfigStore, ConnectionManager, StoreError, WifiState};
