//! Fixed-layout payload records.

use std::net::Ipv4Addr;

use crate::config::SSID_LENGTH;
use crate::platform::{ConnStatus, SocketSummary};

use super::wire::HOST_NAME_LENGTH;

/// Size of [`NetworkStatus`] on the wire.
pub const NETWORK_STATUS_SIZE: usize = 144;

/// Size of [`ListenRecord`] on the wire.
pub const LISTEN_RECORD_SIZE: usize = 8;

/// Size of a connection status record on the wire.
pub const CONN_STATUS_SIZE: usize = 20;

/// Width of the firmware version field.
pub const VERSION_TEXT_LENGTH: usize = 16;

/// Copy `text` into a NUL-padded field, truncating so that at least one
/// NUL remains.
fn put_str(field: &mut [u8], text: &str) {
    field.fill(0);
    let len = text.len().min(field.len().saturating_sub(1));
    field[..len].copy_from_slice(&text.as_bytes()[..len]);
}

/// Reply to the get-status command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkStatus {
    pub ip: Ipv4Addr,
    pub free_heap: u32,
    pub reset_reason: u32,
    pub flash_size: u32,
    pub rssi: i8,
    pub client_count: u8,
    pub sleep_mode: u8,
    pub phy_mode: u8,
    pub vcc: u16,
    pub mac: [u8; 6],
    pub firmware_version: String,
    pub host_name: String,
    pub ssid: String,
    pub clock_register: u32,
}

impl NetworkStatus {
    /// Serialize into the wire layout.
    pub fn to_bytes(&self) -> [u8; NETWORK_STATUS_SIZE] {
        let mut out = [0u8; NETWORK_STATUS_SIZE];
        out[0..4].copy_from_slice(&self.ip.octets());
        out[4..8].copy_from_slice(&self.free_heap.to_le_bytes());
        out[8..12].copy_from_slice(&self.reset_reason.to_le_bytes());
        out[12..16].copy_from_slice(&self.flash_size.to_le_bytes());
        out[16] = self.rssi as u8;
        out[17] = self.client_count;
        out[18] = self.sleep_mode;
        out[19] = self.phy_mode;
        out[20..22].copy_from_slice(&self.vcc.to_le_bytes());
        out[22..28].copy_from_slice(&self.mac);
        put_str(&mut out[28..44], &self.firmware_version);
        put_str(&mut out[44..44 + HOST_NAME_LENGTH], &self.host_name);
        put_str(&mut out[108..108 + SSID_LENGTH], &self.ssid);
        out[140..144].copy_from_slice(&self.clock_register.to_le_bytes());
        out
    }
}

/// Payload of the listen command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenRecord {
    /// Accept only this peer; unspecified accepts anyone.
    pub remote_ip: Ipv4Addr,
    pub port: u16,
    pub protocol: u8,
    /// 0 stops listening on `port`.
    pub max_connections: u8,
}

impl ListenRecord {
    pub fn from_bytes(bytes: &[u8; LISTEN_RECORD_SIZE]) -> Self {
        Self {
            remote_ip: Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]),
            port: u16::from_le_bytes([bytes[4], bytes[5]]),
            protocol: bytes[6],
            max_connections: bytes[7],
        }
    }

    pub fn to_bytes(&self) -> [u8; LISTEN_RECORD_SIZE] {
        let ip = self.remote_ip.octets();
        let port = self.port.to_le_bytes();
        [
            ip[0],
            ip[1],
            ip[2],
            ip[3],
            port[0],
            port[1],
            self.protocol,
            self.max_connections,
        ]
    }
}

/// Serialize a socket status plus the all-socket summary.
pub fn encode_conn_status(status: &ConnStatus, summary: &SocketSummary) -> [u8; CONN_STATUS_SIZE] {
    let mut out = [0u8; CONN_STATUS_SIZE];
    out[0] = status.state;
    out[1] = status.socket;
    out[2..4].copy_from_slice(&status.bytes_available.to_le_bytes());
    out[4..6].copy_from_slice(&status.write_buffer_space.to_le_bytes());
    out[6..8].copy_from_slice(&status.local_port.to_le_bytes());
    out[8..10].copy_from_slice(&status.remote_port.to_le_bytes());
    out[12..16].copy_from_slice(&status.remote_ip.octets());
    out[16..18].copy_from_slice(&summary.connected.to_le_bytes());
    out[18..20].copy_from_slice(&summary.other_end_closed.to_le_bytes());
    out
}
