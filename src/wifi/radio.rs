//! Radio driver interface.
//!
//! The connection state machine drives the radio through [`RadioDriver`] and
//! observes station progress through a [`StationStatusCell`], which the
//! driver's event callback updates from its own context.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use zeroize::{Zeroize, ZeroizeOnDrop};

use super::storage::EnterpriseCredentials;
use crate::config::CredentialRecord;

/// Station progress as reported by the radio driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationStatus {
    /// Not trying to connect.
    Idle,
    /// The requested network could not be found.
    NoApFound,
    /// Association failed for another reason.
    ConnectFail,
    /// Authentication was rejected.
    WrongPassword,
    /// Association or address negotiation in progress.
    Connecting,
    /// Connected with an address.
    GotIp,
}

impl StationStatus {
    fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::NoApFound => 1,
            Self::ConnectFail => 2,
            Self::WrongPassword => 3,
            Self::Connecting => 4,
            Self::GotIp => 5,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::NoApFound,
            2 => Self::ConnectFail,
            3 => Self::WrongPassword,
            4 => Self::Connecting,
            5 => Self::GotIp,
            _ => Self::Idle,
        }
    }

    /// Short description used in error messages.
    pub fn describe(self) -> &'static str {
        match self {
            Self::Idle => "Unexpected WiFi state 'idle'",
            Self::NoApFound => "Didn't find access point",
            Self::ConnectFail => "Failed",
            Self::WrongPassword => "Wrong password",
            Self::Connecting => "Unexpected WiFi state 'connecting'",
            Self::GotIp => "Unexpected WiFi state 'connected'",
        }
    }
}

/// Single-word station status shared between the driver callback and the
/// control loop.
#[derive(Debug, Clone, Default)]
pub struct StationStatusCell(Arc<AtomicU8>);

impl StationStatusCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self) -> StationStatus {
        StationStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, status: StationStatus) {
        self.0.store(status.as_u8(), Ordering::Release);
    }

    /// Raw pointer to the shared word for C event callbacks.
    ///
    /// The returned pointer keeps one strong reference alive forever.
    #[cfg(feature = "esp32")]
    pub(crate) fn leak_raw(&self) -> *const AtomicU8 {
        Arc::into_raw(self.0.clone())
    }

    /// Store through a pointer obtained from `leak_raw`.
    ///
    /// # Safety
    ///
    /// `cell` must come from [`StationStatusCell::leak_raw`].
    #[cfg(feature = "esp32")]
    pub(crate) unsafe fn store_raw(cell: *const AtomicU8, status: StationStatus) {
        (*cell).store(status.as_u8(), Ordering::Release);
    }
}

/// Which radio interface an address or MAC belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioMode {
    Station,
    AccessPoint,
}

/// One network found by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub ssid: String,
    pub rssi: i8,
    pub channel: u8,
}

/// Settings for running as an access point.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AccessPointSettings {
    pub ssid: String,
    pub password: String,
    pub channel: u8,
    pub ip: [u8; 4],
    pub gateway: [u8; 4],
    pub netmask: [u8; 4],
}

impl AccessPointSettings {
    /// Build settings from the access point record, substituting
    /// `default_channel` when the record leaves the channel automatic.
    pub fn from_record(record: &CredentialRecord, default_channel: u8) -> Self {
        Self {
            ssid: record.ssid().into_owned(),
            password: String::from_utf8_lossy(record.password_bytes()).into_owned(),
            channel: if record.channel == 0 {
                default_channel
            } else {
                record.channel
            },
            ip: record.ip,
            gateway: record.ip,
            netmask: [255, 255, 255, 0],
        }
    }

    pub fn ip_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ip)
    }
}

impl fmt::Debug for AccessPointSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessPointSettings")
            .field("ssid", &self.ssid)
            .field("channel", &self.channel)
            .field("ip", &self.ip_addr())
            .finish_non_exhaustive()
    }
}

/// Radio driver operations used by the connection state machine and the
/// status command.
pub trait RadioDriver {
    /// Begin connecting to the network described by `record`.
    ///
    /// Progress is reported through the driver's [`StationStatusCell`].
    fn connect_station(
        &mut self,
        record: &CredentialRecord,
        credentials: Option<&EnterpriseCredentials>,
        host_name: &str,
    ) -> Result<(), RadioError>;

    /// Start the module's own access point.
    fn start_access_point(&mut self, settings: &AccessPointSettings) -> Result<(), RadioError>;

    /// Scan for visible networks.
    fn scan(&mut self) -> Result<Vec<ScanResult>, RadioError>;

    /// Disconnect from the current network or tear down the access point.
    fn disconnect(&mut self);

    /// Turn the radio off.
    fn stop(&mut self);

    /// Current station status.
    fn status(&self) -> StationStatus;

    /// Signal strength of the current station connection.
    fn rssi(&self) -> i8;

    /// Number of stations attached to our access point.
    fn client_count(&self) -> u8;

    /// MAC address of an interface.
    fn mac_address(&self, mode: RadioMode) -> [u8; 6];

    /// IP address of an interface.
    fn ip_address(&self, mode: RadioMode) -> Ipv4Addr;

    /// Cap transmit power, in quarter-dBm units.
    fn set_max_tx_power(&mut self, quarter_dbm: u8) -> Result<(), RadioError>;
}

/// Errors reported by the radio driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    /// The driver refused the configuration.
    InvalidConfig(&'static str),
    /// Scanning failed.
    ScanFailed(String),
    /// Other driver failure.
    Driver(String),
}

impl fmt::Display for RadioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(what) => write!(f, "invalid configuration: {}", what),
            Self::ScanFailed(msg) => write!(f, "scan failed: {}", msg),
            Self::Driver(msg) => write!(f, "driver error: {}", msg),
        }
    }
}

impl std::error::Error for RadioError {}
