//! Connection state machine.
//!
//! Drives the radio through the station and access point lifecycles and
//! turns driver status changes into state transitions and host-visible
//! errors. Station connections that drop are retried from the stored
//! record; the access point path never retries.
//!
//! ```text
//! Disabled -> Idle -> Connecting -> Connected <-> AutoReconnecting
//!              ^  \                    |                |
//!              |   -> RunningAsAP      v                v
//!              +------------------ Reconnecting <-------+
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info, warn};

use super::radio::{AccessPointSettings, RadioDriver, RadioError, StationStatus};
use super::storage::ConfigStore;
use crate::config::{CredentialRecord, ModuleConfig};
use crate::platform::{Listener, SocketTable, SystemServices};
use crate::state::ModuleState;

/// Connection lifecycle state, as reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WifiState {
    #[default]
    Disabled,
    Idle,
    Connecting,
    Connected,
    /// Retrying with the stored record after losing the connection.
    Reconnecting,
    /// The driver is reconnecting on its own.
    AutoReconnecting,
    RunningAsAccessPoint,
}

impl WifiState {
    /// Wire value.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Disabled => 0,
            Self::Idle => 1,
            Self::Connecting => 2,
            Self::Connected => 3,
            Self::Reconnecting => 4,
            Self::AutoReconnecting => 5,
            Self::RunningAsAccessPoint => 6,
        }
    }

    /// Whether the radio is in use.
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Disabled | Self::Idle)
    }
}

impl fmt::Display for WifiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disabled => "disabled",
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::AutoReconnecting => "auto-reconnecting",
            Self::RunningAsAccessPoint => "access point",
        };
        write!(f, "{}", name)
    }
}

/// Station and access point lifecycle over a [`RadioDriver`].
pub struct ConnectionManager {
    radio: Box<dyn RadioDriver>,
    store: Arc<ConfigStore>,
    connect_timeout: Duration,
    default_ap_channel: u8,
    stop_settle: Duration,
    disconnect_settle: Duration,
    /// Slot of the record used for the current station connection.
    slot: Option<usize>,
    connect_started: Option<Instant>,
}

impl ConnectionManager {
    pub fn new(radio: Box<dyn RadioDriver>, store: Arc<ConfigStore>, config: &ModuleConfig) -> Self {
        Self {
            radio,
            store,
            connect_timeout: config.connect_timeout,
            default_ap_channel: config.default_ap_channel,
            stop_settle: config.stop_settle,
            disconnect_settle: config.disconnect_settle,
            slot: None,
            connect_started: None,
        }
    }

    pub fn radio(&self) -> &dyn RadioDriver {
        self.radio.as_ref()
    }

    pub fn radio_mut(&mut self) -> &mut dyn RadioDriver {
        self.radio.as_mut()
    }

    /// Slot of the record behind the current station connection.
    pub fn active_slot(&self) -> Option<usize> {
        self.slot
    }

    /// Bring the radio to a known state and enter `Idle`.
    pub fn init(&mut self, state: &mut ModuleState) {
        self.radio.stop();
        self.slot = None;
        state.set_wifi_state(WifiState::Idle);
    }

    /// Connect as a station. Without `ssid`, the strongest visible network
    /// that is remembered is chosen.
    pub fn start_client(&mut self, state: &mut ModuleState, ssid: Option<&[u8]>, now: Instant) {
        if state.wifi_state() != WifiState::Idle {
            warn!("Start client ignored in state {}", state.wifi_state());
            return;
        }

        let found = match ssid {
            Some(ssid) => match self.store.find_credential(ssid) {
                Ok(Some(found)) => found,
                Ok(None) => {
                    state.set_error("no data found for requested SSID");
                    return;
                }
                Err(e) => {
                    error!("Credential lookup failed: {}", e);
                    state.set_error("no data found for requested SSID");
                    return;
                }
            },
            None => match self.scan_for_known() {
                Ok(Some(found)) => found,
                Ok(None) => {
                    state.set_error("no known networks found");
                    return;
                }
                Err(e) => {
                    warn!("Network scan failed: {}", e);
                    state.set_error("network scan failed");
                    return;
                }
            },
        };

        let (slot, record) = found;
        self.connect(state, slot, &record, false, now);
    }

    fn scan_for_known(&mut self) -> Result<Option<(usize, CredentialRecord)>, RadioError> {
        let mut results = self.radio.scan()?;
        results.sort_by(|a, b| b.rssi.cmp(&a.rssi));
        info!("Scan found {} networks", results.len());

        for result in &results {
            match self.store.find_credential(result.ssid.as_bytes()) {
                Ok(Some(found)) => return Ok(Some(found)),
                Ok(None) => {}
                Err(e) => error!("Credential lookup failed: {}", e),
            }
        }
        Ok(None)
    }

    fn connect(
        &mut self,
        state: &mut ModuleState,
        slot: usize,
        record: &CredentialRecord,
        retry: bool,
        now: Instant,
    ) {
        let credentials = if record.is_enterprise() {
            match self.store.enterprise_credentials(slot) {
                Ok(Some(credentials)) => Some(credentials),
                Ok(None) => {
                    self.abort(state, format!("no credentials stored for {}", record.ssid()));
                    return;
                }
                Err(e) => {
                    self.abort(
                        state,
                        format!("failed to load credentials for {}: {}", record.ssid(), e),
                    );
                    return;
                }
            }
        } else {
            None
        };

        if let Err(e) =
            self.radio
                .connect_station(record, credentials.as_deref(), state.host_name())
        {
            self.abort(state, format!("Failed to connect to {}: {}", record.ssid(), e));
            return;
        }

        info!(
            "{} to '{}' (slot {})",
            if retry { "Reconnecting" } else { "Connecting" },
            record.ssid(),
            slot
        );
        state.set_active_ssid(record.ssid());
        self.slot = Some(slot);
        self.connect_started = Some(now);
        state.set_wifi_state(if retry {
            WifiState::Reconnecting
        } else {
            WifiState::Connecting
        });
    }

    /// Give up on the station: radio off, back to idle.
    fn abort(&mut self, state: &mut ModuleState, message: String) {
        state.set_error(message);
        self.radio.stop();
        self.slot = None;
        self.connect_started = None;
        state.set_wifi_state(WifiState::Idle);
    }

    /// Reconnect using the record from the slot of the original connection.
    fn retry(&mut self, state: &mut ModuleState, now: Instant) {
        let Some(slot) = self.slot else {
            self.abort(state, "no data found for requested SSID".to_string());
            return;
        };
        // No disconnect: its late event would read as idle mid-retry
        match self.store.credential(slot) {
            Ok(Some(record)) => self.connect(state, slot, &record, true, now),
            Ok(None) => self.abort(state, "no data found for requested SSID".to_string()),
            Err(e) => self.abort(state, format!("failed to reload slot {}: {}", slot, e)),
        }
    }

    fn fail(&mut self, state: &mut ModuleState, reason: &str, retry: bool, now: Instant) {
        let message = format!(
            "{} while trying to connect to {}",
            reason,
            state.active_ssid()
        );
        if retry {
            state.set_error(message);
            self.retry(state, now);
        } else {
            self.abort(state, message);
        }
    }

    fn timed_out(&self, now: Instant) -> bool {
        self.connect_started
            .map_or(true, |started| now.saturating_duration_since(started) >= self.connect_timeout)
    }

    /// Advance the state machine from the current driver status.
    pub fn poll(&mut self, state: &mut ModuleState, now: Instant) {
        let status = self.radio.status();
        match state.wifi_state() {
            WifiState::Connecting | WifiState::Reconnecting => {
                let reconnecting = state.wifi_state() == WifiState::Reconnecting;
                match status {
                    StationStatus::Connecting if !self.timed_out(now) => {}
                    StationStatus::GotIp => {
                        info!("Connected to '{}'", state.active_ssid());
                        state.set_wifi_state(WifiState::Connected);
                        if reconnecting {
                            state.set_error("Reconnect succeeded");
                        }
                    }
                    StationStatus::Connecting => self.fail(state, "Timed out", false, now),
                    StationStatus::NoApFound | StationStatus::ConnectFail => {
                        self.fail(state, status.describe(), reconnecting, now)
                    }
                    StationStatus::Idle | StationStatus::WrongPassword => {
                        self.fail(state, status.describe(), false, now)
                    }
                }
            }
            WifiState::Connected => match status {
                StationStatus::GotIp => {}
                StationStatus::Connecting => {
                    state.set_error("Lost connection, auto reconnecting");
                    self.connect_started = Some(now);
                    state.set_wifi_state(WifiState::AutoReconnecting);
                }
                StationStatus::WrongPassword => {
                    self.abort(
                        state,
                        format!("Lost connection, {}", status.describe()),
                    );
                }
                StationStatus::Idle | StationStatus::NoApFound | StationStatus::ConnectFail => {
                    state.set_error(format!("Lost connection, {}", status.describe()));
                    self.retry(state, now);
                }
            },
            WifiState::AutoReconnecting => match status {
                StationStatus::GotIp => {
                    state.set_wifi_state(WifiState::Connected);
                    state.set_error("Auto reconnect succeeded");
                }
                StationStatus::Connecting if !self.timed_out(now) => {}
                StationStatus::Connecting => {
                    state.set_error("Timed out trying to auto-reconnect");
                    self.retry(state, now);
                }
                _ => {
                    state.set_error("Auto reconnect failed, trying manual reconnect");
                    self.retry(state, now);
                }
            },
            WifiState::Disabled | WifiState::Idle | WifiState::RunningAsAccessPoint => {}
        }
    }

    /// Run the module's own access point from slot 0.
    pub fn start_access_point(&mut self, state: &mut ModuleState) {
        if state.wifi_state() != WifiState::Idle {
            warn!("Start access point ignored in state {}", state.wifi_state());
            return;
        }

        let record = match self.store.credential(0) {
            Ok(Some(record)) => record,
            Ok(None) => {
                state.set_error("invalid access point configuration");
                return;
            }
            Err(e) => {
                error!("Access point record unreadable: {}", e);
                state.set_error("invalid access point configuration");
                return;
            }
        };
        if let Err(e) = record.validate_access_point() {
            warn!("Access point record rejected: {}", e);
            state.set_error("invalid access point configuration");
            return;
        }

        let settings = AccessPointSettings::from_record(&record, self.default_ap_channel);
        match self.radio.start_access_point(&settings) {
            Ok(()) => {
                info!(
                    "Access point '{}' running on channel {} at {}",
                    settings.ssid,
                    settings.channel,
                    settings.ip_addr()
                );
                state.set_active_ssid(record.ssid());
                self.slot = None;
                state.set_wifi_state(WifiState::RunningAsAccessPoint);
            }
            Err(e) => {
                error!("Access point start failed: {}", e);
                self.abort(state, "Failed to start access point".to_string());
            }
        }
    }

    /// Tear down sockets, listeners and the radio, then enter `Idle`.
    pub fn stop(
        &mut self,
        state: &mut ModuleState,
        sockets: &mut dyn SocketTable,
        listener: &mut dyn Listener,
        system: &mut dyn SystemServices,
    ) {
        sockets.terminate_all();
        listener.stop_listening(0);

        if state.wifi_state().is_active() {
            system.delay_ms(self.stop_settle.as_millis() as u32);
            self.radio.disconnect();
            system.delay_ms(self.disconnect_settle.as_millis() as u32);
        }
        self.radio.stop();

        self.slot = None;
        self.connect_started = None;
        state.set_active_ssid("");
        state.set_wifi_state(WifiState::Idle);
        info!("Network stopped");
    }
}
