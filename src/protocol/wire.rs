//! Wire format of a bus transaction.
//!
//! Every transaction starts with a three-word header exchange. The first two
//! words travel in both directions at once; the third word carries the
//! host's scratch parameter in and the module's response code out:
//!
//! ```text
//! host -> module  [ver][cmd][sock][flags] [len:u16][avail:u16] [param32]
//! module -> host  [ver][state][0][0]      [0; 4]               [response:i32]
//! ```
//!
//! A non-negative response is the number of payload bytes that follow from
//! the module; negative values are [`ResponseCode`]s.

use std::fmt;

/// Protocol version spoken by this firmware.
pub const FORMAT_VERSION: u8 = 0x3E;

/// Largest payload in either direction.
pub const MAX_DATA_LENGTH: usize = 2048;

/// Number of sockets addressable by connection commands.
pub const MAX_CONNECTIONS: usize = 8;

/// Host name payload size (NUL padded).
pub const HOST_NAME_LENGTH: usize = 64;

/// Header size in 32-bit words.
pub const HEADER_WORDS: usize = 3;

/// Request flag: close the connection once the write completes.
pub const FLAG_CLOSE_AFTER_WRITE: u8 = 0x01;

/// Request flag: push the written data immediately.
pub const FLAG_PUSH: u8 = 0x02;

/// Highest accepted transmit power, in quarter-dBm.
pub const MAX_TX_POWER: u8 = 82;

/// Number of words needed for `bytes` bytes.
pub fn word_count(bytes: usize) -> usize {
    bytes.div_ceil(4)
}

/// Pack bytes into little-endian words, zero padding the last one.
pub fn pack_words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks(4)
        .map(|chunk| {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            u32::from_le_bytes(word)
        })
        .collect()
}

/// Unpack little-endian words into `out`, which may end mid-word.
pub fn unpack_words(words: &[u32], out: &mut [u8]) {
    for (chunk, word) in out.chunks_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes()[..chunk.len()]);
    }
}

/// Commands the host can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Null,
    StartClient,
    StartAccessPoint,
    Stop,
    AddSsid,
    DeleteSsid,
    /// Text list of remembered SSIDs, kept for older hosts.
    ListSsidsDeprecated,
    ConfigureAccessPoint,
    GetStatus,
    SetHostName,
    GetLastError,
    Listen,
    FactoryReset,
    SetTxPower,
    SetClockControl,
    RetrieveSsidData,
    AddEnterpriseSsid,
    Diagnostics,
    ConnCreate,
    ConnRead,
    ConnWrite,
    ConnClose,
    ConnAbort,
    ConnGetStatus,
}

impl Command {
    /// Decode a command byte. Unknown codes yield `None`.
    pub fn from_u8(code: u8) -> Option<Self> {
        let command = match code {
            0 => Self::Null,
            1 => Self::StartClient,
            2 => Self::StartAccessPoint,
            3 => Self::Stop,
            4 => Self::AddSsid,
            5 => Self::DeleteSsid,
            6 => Self::ListSsidsDeprecated,
            7 => Self::ConfigureAccessPoint,
            8 => Self::GetStatus,
            9 => Self::SetHostName,
            10 => Self::GetLastError,
            11 => Self::Listen,
            13 => Self::FactoryReset,
            14 => Self::SetTxPower,
            15 => Self::SetClockControl,
            16 => Self::RetrieveSsidData,
            17 => Self::AddEnterpriseSsid,
            20 => Self::Diagnostics,
            64 => Self::ConnCreate,
            65 => Self::ConnRead,
            66 => Self::ConnWrite,
            67 => Self::ConnClose,
            68 => Self::ConnAbort,
            69 => Self::ConnGetStatus,
            _ => return None,
        };
        Some(command)
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Null => 0,
            Self::StartClient => 1,
            Self::StartAccessPoint => 2,
            Self::Stop => 3,
            Self::AddSsid => 4,
            Self::DeleteSsid => 5,
            Self::ListSsidsDeprecated => 6,
            Self::ConfigureAccessPoint => 7,
            Self::GetStatus => 8,
            Self::SetHostName => 9,
            Self::GetLastError => 10,
            Self::Listen => 11,
            Self::FactoryReset => 13,
            Self::SetTxPower => 14,
            Self::SetClockControl => 15,
            Self::RetrieveSsidData => 16,
            Self::AddEnterpriseSsid => 17,
            Self::Diagnostics => 20,
            Self::ConnCreate => 64,
            Self::ConnRead => 65,
            Self::ConnWrite => 66,
            Self::ConnClose => 67,
            Self::ConnAbort => 68,
            Self::ConnGetStatus => 69,
        }
    }
}

/// Sub-operations of [`Command::AddEnterpriseSsid`], carried in the flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnterpriseOp {
    Begin,
    CaCertificate,
    ClientCertificate,
    PrivateKey,
    Commit,
    Cancel,
}

impl EnterpriseOp {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Begin),
            1 => Some(Self::CaCertificate),
            2 => Some(Self::ClientCertificate),
            3 => Some(Self::PrivateKey),
            4 => Some(Self::Commit),
            5 => Some(Self::Cancel),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Begin => 0,
            Self::CaCertificate => 1,
            Self::ClientCertificate => 2,
            Self::PrivateKey => 3,
            Self::Commit => 4,
            Self::Cancel => 5,
        }
    }
}

/// Negative response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    /// Success with no payload.
    Empty,
    UnknownCommand,
    BadFormatVersion,
    TooManySsids,
    WrongState,
    BadDataLength,
    NetworkDisabled,
    Timeout,
    Busy,
    BufferTooSmall,
    BadReplyFormatVersion,
    BadParameter,
}

impl ResponseCode {
    pub fn code(self) -> i32 {
        match self {
            Self::Empty => 0,
            Self::UnknownCommand => -1,
            Self::BadFormatVersion => -2,
            Self::TooManySsids => -3,
            Self::WrongState => -4,
            Self::BadDataLength => -5,
            Self::NetworkDisabled => -6,
            Self::Timeout => -7,
            Self::Busy => -8,
            Self::BufferTooSmall => -9,
            Self::BadReplyFormatVersion => -10,
            Self::BadParameter => -11,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        let response = match code {
            0 => Self::Empty,
            -1 => Self::UnknownCommand,
            -2 => Self::BadFormatVersion,
            -3 => Self::TooManySsids,
            -4 => Self::WrongState,
            -5 => Self::BadDataLength,
            -6 => Self::NetworkDisabled,
            -7 => Self::Timeout,
            -8 => Self::Busy,
            -9 => Self::BufferTooSmall,
            -10 => Self::BadReplyFormatVersion,
            -11 => Self::BadParameter,
            _ => return None,
        };
        Some(response)
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

/// Header sent by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub format_version: u8,
    pub command: u8,
    pub socket: u8,
    pub flags: u8,
    /// Payload bytes the host intends to send.
    pub data_length: u16,
    /// Payload bytes the host can receive.
    pub buffer_available: u16,
    /// Per-command parameter, arrives with the response word.
    pub param32: u32,
}

impl RequestHeader {
    /// A request for `command` in the current format, as a host would
    /// build it.
    pub fn new(command: Command) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            command: command.as_u8(),
            socket: 0,
            flags: 0,
            data_length: 0,
            buffer_available: MAX_DATA_LENGTH as u16,
            param32: 0,
        }
    }

    /// Decode the two leading words. `param32` is left zero.
    pub fn from_leading_words(words: [u32; 2]) -> Self {
        let first = words[0].to_le_bytes();
        Self {
            format_version: first[0],
            command: first[1],
            socket: first[2],
            flags: first[3],
            data_length: (words[1] & 0xFFFF) as u16,
            buffer_available: (words[1] >> 16) as u16,
            param32: 0,
        }
    }

    /// Encode as the three header words.
    pub fn to_words(&self) -> [u32; HEADER_WORDS] {
        [
            u32::from_le_bytes([self.format_version, self.command, self.socket, self.flags]),
            u32::from(self.data_length) | (u32::from(self.buffer_available) << 16),
            self.param32,
        ]
    }
}

/// Header sent by the module, minus the response word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub format_version: u8,
    pub state: u8,
}

impl ResponseHeader {
    pub fn new(state: u8) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            state,
        }
    }

    /// Encode the two leading words.
    pub fn to_leading_words(&self) -> [u32; 2] {
        [
            u32::from_le_bytes([self.format_version, self.state, 0, 0]),
            0,
        ]
    }

    /// Decode the two leading words, as a host would.
    pub fn from_leading_words(words: [u32; 2]) -> Self {
        let first = words[0].to_le_bytes();
        Self {
            format_version: first[0],
            state: first[1],
        }
    }
}
