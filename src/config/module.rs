//! Runtime tunables for the control loop.

use std::time::Duration;

use super::credential::{ConfigError, MAX_AP_CHANNEL};
use crate::protocol::HOST_NAME_LENGTH;

/// Firmware version reported in the status record.
pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Timing and identity settings for [`crate::Module`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleConfig {
    /// How long a connection attempt may take before it is abandoned.
    pub connect_timeout: Duration,

    /// Interval between repeated attention pulses while something is
    /// waiting to be reported.
    pub status_report_interval: Duration,

    /// A transaction is started without an edge from the host once this
    /// much time has passed since the last one.
    pub transfer_ready_timeout: Duration,

    /// LED toggle interval while connecting.
    pub led_blink_interval: Duration,

    /// Settle time before disconnecting the radio on stop.
    pub stop_settle: Duration,

    /// Settle time after disconnecting the radio on stop.
    pub disconnect_settle: Duration,

    /// Channel used when the access point record leaves it at 0.
    pub default_ap_channel: u8,

    /// Host name until the host sets one.
    pub host_name: String,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(40),
            status_report_interval: Duration::from_millis(200),
            transfer_ready_timeout: Duration::from_millis(10),
            led_blink_interval: Duration::from_millis(500),
            stop_settle: Duration::from_millis(20),
            disconnect_settle: Duration::from_millis(100),
            default_ap_channel: 6,
            host_name: "net-coprocessor".to_string(),
        }
    }
}

impl ModuleConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::InvalidSetting("connect_timeout must be > 0"));
        }
        if self.status_report_interval.is_zero() {
            return Err(ConfigError::InvalidSetting(
                "status_report_interval must be > 0",
            ));
        }
        if self.led_blink_interval.is_zero() {
            return Err(ConfigError::InvalidSetting("led_blink_interval must be > 0"));
        }
        if self.default_ap_channel == 0 || self.default_ap_channel > MAX_AP_CHANNEL {
            return Err(ConfigError::InvalidSetting(
                "default_ap_channel must be 1..=13",
            ));
        }
        if self.host_name.is_empty() || self.host_name.len() >= HOST_NAME_LENGTH {
            return Err(ConfigError::InvalidSetting(
                "host_name must be 1..=63 bytes",
            ));
        }
        Ok(())
    }
}
