//! Mutable module state shared by the protocol engine, the connection
//! state machine and the attention signaling.
//!
//! There is exactly one `ModuleState`, owned by the runtime and lent to each
//! component in turn.

use std::time::Instant;

use log::{info, warn};

use crate::wifi::WifiState;

/// Connection lifecycle, identity and the sticky error reported to the host.
#[derive(Debug, Clone)]
pub struct ModuleState {
    wifi_state: WifiState,
    active_ssid: String,
    host_name: String,
    last_error: Option<String>,
    error_generation: u32,
    reported_state: WifiState,
    last_transaction: Option<Instant>,
}

impl ModuleState {
    pub fn new(host_name: impl Into<String>) -> Self {
        Self {
            wifi_state: WifiState::Disabled,
            active_ssid: String::new(),
            host_name: host_name.into(),
            last_error: None,
            error_generation: 0,
            reported_state: WifiState::Disabled,
            last_transaction: None,
        }
    }

    pub fn wifi_state(&self) -> WifiState {
        self.wifi_state
    }

    pub fn set_wifi_state(&mut self, state: WifiState) {
        if state != self.wifi_state {
            info!("WiFi state {} -> {}", self.wifi_state, state);
            self.wifi_state = state;
        }
    }

    /// SSID of the network joined or being joined, or of our access point.
    pub fn active_ssid(&self) -> &str {
        &self.active_ssid
    }

    pub fn set_active_ssid(&mut self, ssid: impl Into<String>) {
        self.active_ssid = ssid.into();
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn set_host_name(&mut self, name: impl Into<String>) {
        self.host_name = name.into();
        info!("Host name set to '{}'", self.host_name);
    }

    /// Pending error message, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Record an error for the host to collect. Replaces any earlier one.
    pub fn set_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{}", message);
        self.last_error = Some(message);
        self.error_generation = self.error_generation.wrapping_add(1);
    }

    /// Forget the pending error without reporting it.
    pub fn clear_error(&mut self) {
        if self.last_error.take().is_some() {
            self.error_generation = self.error_generation.wrapping_add(1);
        }
    }

    /// Hand the pending error to the host, clearing it.
    pub fn take_error(&mut self) -> Option<String> {
        let error = self.last_error.take();
        if error.is_some() {
            self.error_generation = self.error_generation.wrapping_add(1);
        }
        error
    }

    /// Counter bumped on every change of the error slot.
    pub fn error_generation(&self) -> u32 {
        self.error_generation
    }

    /// State last seen by the host.
    pub fn reported_state(&self) -> WifiState {
        self.reported_state
    }

    /// The host has now seen the current state.
    pub fn mark_reported(&mut self) {
        self.reported_state = self.wifi_state;
    }

    /// Whether the host has something to collect.
    pub fn needs_attention(&self) -> bool {
        self.last_error.is_some() || self.reported_state != self.wifi_state
    }

    pub fn last_transaction(&self) -> Option<Instant> {
        self.last_transaction
    }

    pub fn set_last_transaction(&mut self, at: Instant) {
        self.last_transaction = Some(at);
    }
}
