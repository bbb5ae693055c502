//! Collaborator interfaces.
//!
//! The control plane never touches hardware directly. Everything it needs
//! from the outside world (bus peripheral, GPIO lines, sockets, storage,
//! system information) is expressed as a trait here, with in-memory
//! implementations in [`host`] and ESP-IDF implementations in `esp32`.
//!
//! # Components
//!
//! - [`host`] - In-memory collaborators for tests and the host binary
//! - `esp32` - ESP-IDF collaborators (ESP32 only)

pub mod host;
pub mod net;

#[cfg(feature = "esp32")]
pub mod esp32;

use std::fmt;
use std::net::Ipv4Addr;

/// Errors reported by platform collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    /// The bus peripheral failed mid-transfer.
    BusFault,
    /// Access outside the bounds of a storage region.
    OutOfRange {
        offset: usize,
        len: usize,
        size: usize,
    },
    /// Key does not fit the key-value engine's key limit.
    KeyTooLong(String),
    /// Underlying storage driver error.
    Storage(String),
    /// A required resource could not be found.
    Unavailable(&'static str),
    /// A peripheral driver could not be set up.
    Driver(String),
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BusFault => write!(f, "bus transfer failed"),
            Self::OutOfRange { offset, len, size } => write!(
                f,
                "access of {} bytes at offset {} exceeds region size {}",
                len, offset, size
            ),
            Self::KeyTooLong(key) => write!(f, "key too long: {}", key),
            Self::Storage(msg) => write!(f, "storage error: {}", msg),
            Self::Unavailable(what) => write!(f, "{} unavailable", what),
            Self::Driver(msg) => write!(f, "driver error: {}", msg),
        }
    }
}

impl std::error::Error for PlatformError {}

/// Word-exchange primitive of the host bus peripheral.
///
/// The module is bus master: every word sent clocks one word in from the
/// host. Words are little-endian on the wire.
pub trait HostBus {
    /// Prepare the peripheral for one transaction.
    fn begin_transaction(&mut self);

    /// Release the peripheral at the end of a transaction.
    fn end_transaction(&mut self);

    /// Exchange one word, returning the word clocked in.
    fn transfer_word(&mut self, out: u32) -> Result<u32, PlatformError>;

    /// Send `tx`, discarding what the host sends meanwhile.
    fn write_words(&mut self, tx: &[u32]) -> Result<(), PlatformError> {
        for word in tx {
            self.transfer_word(*word)?;
        }
        Ok(())
    }

    /// Fill `rx` from the host while sending zeros.
    fn read_words(&mut self, rx: &mut [u32]) -> Result<(), PlatformError> {
        for word in rx.iter_mut() {
            *word = self.transfer_word(0)?;
        }
        Ok(())
    }

    /// Exchange `tx` and `rx` word for word. Both slices must be equally long.
    fn transfer_words(&mut self, tx: &[u32], rx: &mut [u32]) -> Result<(), PlatformError> {
        for (out, word) in tx.iter().zip(rx.iter_mut()) {
            *word = self.transfer_word(*out)?;
        }
        Ok(())
    }

    /// Change the bus clock divider.
    fn set_clock_divider(&mut self, divider: u32);

    /// Raw clock configuration, reported in the status record.
    fn clock_register(&self) -> u32;
}

/// GPIO lines shared with the host, plus the status LED.
pub trait GpioLines {
    /// Drive the host-readiness output (also used for attention pulses).
    fn set_host_ready(&mut self, high: bool);

    /// Current level of the host's transfer-ready input.
    fn transfer_ready(&mut self) -> bool;

    /// Drive the chip-select line (asserted = low on the wire).
    fn set_select(&mut self, asserted: bool);

    /// Switch the status LED.
    fn set_led(&mut self, on: bool);

    /// Current status LED state.
    fn led(&self) -> bool;

    /// Busy-wait for a few microseconds.
    fn delay_us(&mut self, us: u32);
}

/// Connection state codes reported in [`ConnStatus::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SocketState {
    Free = 0,
    Connecting = 1,
    Connected = 2,
    OtherEndClosed = 3,
    Aborted = 4,
    ClosePending = 5,
    CloseReady = 6,
    Allocated = 7,
    Listening = 8,
}

impl SocketState {
    pub const fn code(self) -> u8 {
        self as u8
    }
}

/// Snapshot of one socket, as reported by the socket collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnStatus {
    /// Connection state code of the socket implementation.
    pub state: u8,
    /// Socket number.
    pub socket: u8,
    /// Bytes received and not yet read.
    pub bytes_available: u16,
    /// Space left in the send buffer.
    pub write_buffer_space: u16,
    /// Local port.
    pub local_port: u16,
    /// Remote port.
    pub remote_port: u16,
    /// Remote address.
    pub remote_ip: Ipv4Addr,
}

/// Bitmaps summarising all sockets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketSummary {
    /// One bit per connected socket.
    pub connected: u16,
    /// One bit per socket whose peer has closed.
    pub other_end_closed: u16,
}

/// One TCP socket owned by the network stack.
pub trait Socket {
    /// Read received data into `buf`, returning the byte count.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Number of bytes that can be written right now.
    fn can_write(&self) -> usize;

    /// Queue `data` for sending, returning the number of bytes accepted.
    fn write(&mut self, data: &[u8], push: bool, close_after: bool) -> usize;

    /// Close gracefully.
    fn close(&mut self);

    /// Abort the connection.
    fn terminate(&mut self, external: bool);

    /// Current status.
    fn status(&self) -> ConnStatus;
}

/// The fixed table of sockets.
pub trait SocketTable {
    /// Socket by number, if it exists.
    fn socket(&mut self, number: u8) -> Option<&mut dyn Socket>;

    /// Abort every socket.
    fn terminate_all(&mut self);

    /// Summary bitmaps across all sockets.
    fn summary(&self) -> SocketSummary;

    /// Log the state of every socket.
    fn report(&self);
}

/// Accepts inbound connections on behalf of the socket table.
pub trait Listener {
    /// Listen on `port` for `protocol`, accepting connections from
    /// `remote_ip` (unspecified = anyone). `max_connections == 0` stops
    /// listening on that port. Returns `false` on failure.
    fn listen(&mut self, remote_ip: Ipv4Addr, port: u16, protocol: u8, max_connections: u8)
        -> bool;

    /// Stop listening on `port`; port 0 stops all listeners.
    fn stop_listening(&mut self, port: u16);
}

/// Why the chip last reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    PowerOn,
    HardwareWatchdog,
    Exception,
    SoftwareWatchdog,
    SoftwareReset,
    DeepSleepWake,
    ExternalReset,
    Unknown,
}

impl ResetReason {
    /// Numeric code reported to the host.
    pub fn code(self) -> u32 {
        match self {
            Self::PowerOn => 0,
            Self::HardwareWatchdog => 1,
            Self::Exception => 2,
            Self::SoftwareWatchdog => 3,
            Self::SoftwareReset => 4,
            Self::DeepSleepWake => 5,
            Self::ExternalReset => 6,
            Self::Unknown => 99,
        }
    }
}

/// System-level information and services.
pub trait SystemServices {
    /// Free heap in bytes.
    fn free_heap(&self) -> u32;

    /// Cause of the last reset.
    fn reset_reason(&self) -> ResetReason;

    /// Flash chip size in bytes.
    fn flash_size(&self) -> u32;

    /// Supply voltage in millivolts, 0 if not measurable.
    fn vcc(&self) -> u16;

    /// Radio sleep mode, 1-based (0 = unknown).
    fn sleep_mode(&self) -> u8;

    /// Radio PHY mode.
    fn phy_mode(&self) -> u8;

    /// Reset the liveness watchdog.
    fn feed_watchdog(&mut self);

    /// Log network stack statistics.
    fn dump_stats(&self);

    /// Sleep for `ms` milliseconds, letting the network stack run.
    fn delay_ms(&mut self, ms: u32);
}

/// A raw storage region addressed by offset. Erased bytes read as `0xFF`.
pub trait Partition: Send {
    /// Size of the region in bytes.
    fn size(&self) -> usize;

    /// Read `buf.len()` bytes at `offset`.
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), PlatformError>;

    /// Overwrite `data.len()` bytes at `offset`.
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), PlatformError>;

    /// Reset `len` bytes at `offset` to the erased state.
    fn erase(&mut self, offset: usize, len: usize) -> Result<(), PlatformError>;
}

/// Key-value engine for variable-size records.
pub trait KvEngine: Send {
    /// Read the value for `key` into `buf`, returning its length.
    fn get(&self, key: &str, buf: &mut [u8]) -> Result<Option<usize>, PlatformError>;

    /// Store `value` under `key`, replacing any previous value.
    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), PlatformError>;

    /// Remove `key`, returning whether it existed.
    fn remove(&mut self, key: &str) -> Result<bool, PlatformError>;
}

/// Bus peripheral source clock.
pub const APB_CLOCK_HZ: u32 = 80_000_000;

/// Clock register value selecting APB / 3 (about 26.7 MHz).
pub const DEFAULT_CLOCK_REGISTER: u32 = encode_clock_register(0, 2);

/// Build a bus clock register value from a prescaler and a divider, both
/// stored minus one.
///
/// Layout: `clkcnt_l` bits 0..6, `clkcnt_h` bits 6..12, `clkcnt_n`
/// bits 12..18, `clkdiv_pre` bits 18..31, `clk_equ_sysclk` bit 31.
pub const fn encode_clock_register(prescaler: u32, divider: u32) -> u32 {
    let n = divider & 0x3F;
    let h = ((n + 1) / 2).saturating_sub(1);
    ((prescaler & 0x1FFF) << 18) | (n << 12) | (h << 6) | n
}

/// Bus clock frequency selected by a clock register value.
pub fn clock_frequency(register: u32) -> u32 {
    if register & (1 << 31) != 0 {
        return APB_CLOCK_HZ;
    }
    let prescaler = (register >> 18) & 0x1FFF;
    let divider = (register >> 12) & 0x3F;
    APB_CLOCK_HZ / ((prescaler + 1) * (divider + 1))
}

/// Check that `offset..offset + len` lies within a region of `size` bytes.
pub(crate) fn check_range(offset: usize, len: usize, size: usize) -> Result<(), PlatformError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(PlatformError::OutOfRange { offset, len, size }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_reason_codes() {
        assert_eq!(ResetReason::PowerOn.code(), 0);
        assert_eq!(ResetReason::SoftwareWatchdog.code(), 3);
        assert_eq!(ResetReason::ExternalReset.code(), 6);
        assert_eq!(ResetReason::Unknown.code(), 99);
    }

    #[test]
    fn test_socket_state_codes() {
        assert_eq!(SocketState::Free.code(), 0);
        assert_eq!(SocketState::Connected.code(), 2);
        assert_eq!(SocketState::OtherEndClosed.code(), 3);
        assert_eq!(SocketState::Listening.code(), 8);
    }

    #[test]
    fn test_check_range() {
        assert!(check_range(0, 10, 10).is_ok());
        assert!(check_range(5, 5, 10).is_ok());
        assert_eq!(
            check_range(6, 5, 10),
            Err(PlatformError::OutOfRange {
                offset: 6,
                len: 5,
                size: 10
            })
        );
        assert!(check_range(usize::MAX, 2, 10).is_err());
    }

    #[test]
    fn test_clock_register() {
        assert_eq!(clock_frequency(DEFAULT_CLOCK_REGISTER), 26_666_666);
        assert_eq!(clock_frequency(encode_clock_register(1, 3)), 10_000_000);
        assert_eq!(clock_frequency(1 << 31), APB_CLOCK_HZ);
        assert_eq!(DEFAULT_CLOCK_REGISTER & 0x3F, 2);
    }
}
