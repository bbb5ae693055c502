//! Credential record and validators.
//!
//! A credential record is the fixed-size unit stored in each slot of the
//! SSID table and exchanged with the host by the add-SSID and
//! configure-access-point commands. Slot 0 holds the module's own access
//! point identity; the remaining slots hold remembered station networks.
//!
//! Layout (little-endian, [`RECORD_SIZE`] bytes):
//!
//! ```text
//! [ip:4][gateway:4][netmask:4][channel:1][security:1][reserved:2]
//! [ssid:32][password:64][eap_identity:64][credential_sizes:3x4]
//! ```
//!
//! # Example
//!
//! ```
//! use wifi_coprocessor::config::CredentialRecord;
//!
//! let record = CredentialRecord::station("MyNetwork", "MyPassword").unwrap();
//! let bytes = record.to_bytes();
//! assert_eq!(CredentialRecord::from_bytes(&bytes).unwrap(), record);
//! ```

use std::borrow::Cow;
use std::fmt;
use std::net::Ipv4Addr;

use zeroize::{Zeroize, ZeroizeOnDrop};

/// SSID field width. Valid SSIDs are strictly shorter than this.
pub const SSID_LENGTH: usize = 32;

/// Password field width. Valid passwords are strictly shorter than this.
pub const PASSWORD_LENGTH: usize = 64;

/// Minimum length of a non-empty password.
pub const MIN_PASSWORD_LEN: usize = 8;

/// EAP identity field width.
pub const EAP_IDENTITY_LENGTH: usize = 64;

/// Highest channel usable for the access point.
pub const MAX_AP_CHANNEL: u8 = 13;

/// Number of station networks that can be remembered.
pub const MAX_REMEMBERED_NETWORKS: usize = 20;

/// Serialized size of a full record.
pub const RECORD_SIZE: usize = 188;

/// Serialized size of a reduced record (everything before the password).
pub const REDUCED_RECORD_SIZE: usize = 48;

/// First SSID byte of an unused slot.
pub const EMPTY_SLOT_MARKER: u8 = 0xFF;

const IP_OFFSET: usize = 0;
const GATEWAY_OFFSET: usize = 4;
const NETMASK_OFFSET: usize = 8;
const CHANNEL_OFFSET: usize = 12;
const SECURITY_OFFSET: usize = 13;
const SSID_OFFSET: usize = 16;
const PASSWORD_OFFSET: usize = SSID_OFFSET + SSID_LENGTH;
const IDENTITY_OFFSET: usize = PASSWORD_OFFSET + PASSWORD_LENGTH;
const SIZES_OFFSET: usize = IDENTITY_OFFSET + EAP_IDENTITY_LENGTH;

/// Authentication used by a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    /// WPA2-PSK, or open when the password is empty.
    Personal,
    /// WPA2-Enterprise with EAP-TLS.
    EapTls,
    /// WPA2-Enterprise with EAP-PEAP.
    EapPeap,
    /// WPA2-Enterprise with EAP-TTLS.
    EapTtls,
}

impl Security {
    /// Wire value.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Personal => 0,
            Self::EapTls => 1,
            Self::EapPeap => 2,
            Self::EapTtls => 3,
        }
    }

    /// Parse a wire value.
    pub fn from_u8(value: u8) -> Result<Self, ConfigError> {
        match value {
            0 => Ok(Self::Personal),
            1 => Ok(Self::EapTls),
            2 => Ok(Self::EapPeap),
            3 => Ok(Self::EapTtls),
            other => Err(ConfigError::UnknownSecurity(other)),
        }
    }

    /// Whether this is one of the enterprise methods.
    pub fn is_enterprise(self) -> bool {
        !matches!(self, Self::Personal)
    }
}

/// Credential types that may accompany an enterprise record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// CA certificate used to validate the authentication server.
    CaCertificate,
    /// Client certificate (EAP-TLS).
    ClientCertificate,
    /// Client private key (EAP-TLS).
    PrivateKey,
}

impl CredentialKind {
    /// All kinds, in storage order.
    pub const ALL: [CredentialKind; 3] = [
        Self::CaCertificate,
        Self::ClientCertificate,
        Self::PrivateKey,
    ];

    /// Position of this kind in the sizes array and in storage order.
    pub fn index(self) -> usize {
        match self {
            Self::CaCertificate => 0,
            Self::ClientCertificate => 1,
            Self::PrivateKey => 2,
        }
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CaCertificate => write!(f, "CA certificate"),
            Self::ClientCertificate => write!(f, "client certificate"),
            Self::PrivateKey => write!(f, "private key"),
        }
    }
}

/// Bytes of a NUL-padded field up to the first NUL.
pub fn field_bytes(field: &[u8]) -> &[u8] {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    &field[..end]
}

fn has_control_character(bytes: &[u8]) -> bool {
    bytes.iter().any(|&b| b < 0x20 || b == 0x7F)
}

/// Check that an SSID is acceptable: non-empty, shorter than
/// [`SSID_LENGTH`] and free of control characters.
pub fn validate_ssid(ssid: &[u8]) -> Result<(), ConfigError> {
    if ssid.is_empty() {
        return Err(ConfigError::SsidEmpty);
    }
    if ssid.len() >= SSID_LENGTH {
        return Err(ConfigError::SsidTooLong {
            len: ssid.len(),
            max: SSID_LENGTH - 1,
        });
    }
    if has_control_character(ssid) {
        return Err(ConfigError::InvalidCharacter);
    }
    Ok(())
}

/// Check that a password is acceptable: empty (open network) or between
/// [`MIN_PASSWORD_LEN`] and `PASSWORD_LENGTH - 1` bytes, without control
/// characters.
pub fn validate_password(password: &[u8]) -> Result<(), ConfigError> {
    if password.len() >= PASSWORD_LENGTH {
        return Err(ConfigError::PasswordTooLong {
            len: password.len(),
            max: PASSWORD_LENGTH - 1,
        });
    }
    if !password.is_empty() && password.len() < MIN_PASSWORD_LEN {
        return Err(ConfigError::PasswordTooShort {
            len: password.len(),
            min: MIN_PASSWORD_LEN,
        });
    }
    if has_control_character(password) {
        return Err(ConfigError::InvalidCharacter);
    }
    Ok(())
}

fn copy_field(field: &mut [u8], value: &[u8]) {
    field.fill(0);
    field[..value.len()].copy_from_slice(value);
}

/// One slot of the SSID table.
///
/// Secrets are wiped when the record is dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct CredentialRecord {
    /// Static IP, all zero for DHCP.
    pub ip: [u8; 4],
    /// Gateway address.
    pub gateway: [u8; 4],
    /// Network mask.
    pub netmask: [u8; 4],
    /// Channel, 0 for automatic.
    pub channel: u8,
    security: u8,
    reserved: [u8; 2],
    ssid: [u8; SSID_LENGTH],
    password: [u8; PASSWORD_LENGTH],
    eap_identity: [u8; EAP_IDENTITY_LENGTH],
    credential_sizes: [u32; 3],
}

impl CredentialRecord {
    /// An unused slot (all bytes erased).
    pub fn empty() -> Self {
        Self {
            ip: [0xFF; 4],
            gateway: [0xFF; 4],
            netmask: [0xFF; 4],
            channel: 0xFF,
            security: 0xFF,
            reserved: [0xFF; 2],
            ssid: [EMPTY_SLOT_MARKER; SSID_LENGTH],
            password: [0xFF; PASSWORD_LENGTH],
            eap_identity: [0xFF; EAP_IDENTITY_LENGTH],
            credential_sizes: [u32::MAX; 3],
        }
    }

    fn blank() -> Self {
        Self {
            ip: [0; 4],
            gateway: [0; 4],
            netmask: [0; 4],
            channel: 0,
            security: Security::Personal.as_u8(),
            reserved: [0; 2],
            ssid: [0; SSID_LENGTH],
            password: [0; PASSWORD_LENGTH],
            eap_identity: [0; EAP_IDENTITY_LENGTH],
            credential_sizes: [0; 3],
        }
    }

    /// A personal (PSK or open) network using DHCP.
    ///
    /// Only checks that the values fit their fields; use
    /// [`validate_ssid`] and [`validate_password`] for content rules.
    pub fn station(ssid: &str, password: &str) -> Result<Self, ConfigError> {
        let mut record = Self::blank();
        record.set_ssid(ssid.as_bytes())?;
        record.set_password(password.as_bytes())?;
        Ok(record)
    }

    /// An enterprise network with the given EAP identity and declared
    /// credential sizes (CA certificate, client certificate, private key).
    pub fn enterprise(
        ssid: &str,
        method: Security,
        identity: &str,
        password: &str,
        credential_sizes: [u32; 3],
    ) -> Result<Self, ConfigError> {
        if !method.is_enterprise() {
            return Err(ConfigError::UnknownSecurity(method.as_u8()));
        }
        if identity.len() > EAP_IDENTITY_LENGTH {
            return Err(ConfigError::InvalidFormat("EAP identity too long".into()));
        }
        let mut record = Self::station(ssid, password)?;
        record.security = method.as_u8();
        copy_field(&mut record.eap_identity, identity.as_bytes());
        record.credential_sizes = credential_sizes;
        Ok(record)
    }

    /// Use a static address instead of DHCP.
    pub fn with_static_ip(mut self, ip: Ipv4Addr, gateway: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        self.ip = ip.octets();
        self.gateway = gateway.octets();
        self.netmask = netmask.octets();
        self
    }

    /// Pin the channel.
    pub fn with_channel(mut self, channel: u8) -> Self {
        self.channel = channel;
        self
    }

    fn set_ssid(&mut self, ssid: &[u8]) -> Result<(), ConfigError> {
        if ssid.len() > SSID_LENGTH {
            return Err(ConfigError::SsidTooLong {
                len: ssid.len(),
                max: SSID_LENGTH - 1,
            });
        }
        copy_field(&mut self.ssid, ssid);
        Ok(())
    }

    fn set_password(&mut self, password: &[u8]) -> Result<(), ConfigError> {
        if password.len() > PASSWORD_LENGTH {
            return Err(ConfigError::PasswordTooLong {
                len: password.len(),
                max: PASSWORD_LENGTH - 1,
            });
        }
        copy_field(&mut self.password, password);
        Ok(())
    }

    /// Whether this slot is unused.
    pub fn is_empty(&self) -> bool {
        self.ssid[0] == EMPTY_SLOT_MARKER
    }

    /// SSID bytes up to the first NUL.
    pub fn ssid_bytes(&self) -> &[u8] {
        field_bytes(&self.ssid)
    }

    /// SSID for display.
    pub fn ssid(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.ssid_bytes())
    }

    /// Password bytes up to the first NUL.
    pub fn password_bytes(&self) -> &[u8] {
        field_bytes(&self.password)
    }

    /// EAP identity bytes up to the first NUL.
    pub fn eap_identity_bytes(&self) -> &[u8] {
        field_bytes(&self.eap_identity)
    }

    /// Raw security byte.
    pub fn security_byte(&self) -> u8 {
        self.security
    }

    /// Authentication method.
    pub fn security(&self) -> Result<Security, ConfigError> {
        Security::from_u8(self.security)
    }

    /// Whether the record describes an enterprise network.
    pub fn is_enterprise(&self) -> bool {
        self.security().map(Security::is_enterprise).unwrap_or(false)
    }

    /// Declared size of each credential, indexed by [`CredentialKind::index`].
    pub fn credential_sizes(&self) -> [u32; 3] {
        self.credential_sizes
    }

    /// Replace the declared credential sizes.
    pub fn set_credential_sizes(&mut self, sizes: [u32; 3]) {
        self.credential_sizes = sizes;
    }

    /// Static IP address.
    pub fn ip_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ip)
    }

    /// Gateway address.
    pub fn gateway_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.gateway)
    }

    /// Network mask.
    pub fn netmask_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.netmask)
    }

    /// Whether the address is obtained by DHCP.
    pub fn uses_dhcp(&self) -> bool {
        self.ip == [0; 4]
    }

    /// Check the record can serve as the module's own access point.
    pub fn validate_access_point(&self) -> Result<(), ConfigError> {
        if self.ip == [0; 4] || self.ip == [0xFF; 4] {
            return Err(ConfigError::InvalidAddress(self.ip_addr()));
        }
        if self.channel > MAX_AP_CHANNEL {
            return Err(ConfigError::InvalidChannel(self.channel));
        }
        validate_ssid(self.ssid_bytes())?;
        validate_password(self.password_bytes())
    }

    /// Serialize to the table layout.
    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut bytes = [0u8; RECORD_SIZE];
        bytes[IP_OFFSET..IP_OFFSET + 4].copy_from_slice(&self.ip);
        bytes[GATEWAY_OFFSET..GATEWAY_OFFSET + 4].copy_from_slice(&self.gateway);
        bytes[NETMASK_OFFSET..NETMASK_OFFSET + 4].copy_from_slice(&self.netmask);
        bytes[CHANNEL_OFFSET] = self.channel;
        bytes[SECURITY_OFFSET] = self.security;
        bytes[SECURITY_OFFSET + 1..SSID_OFFSET].copy_from_slice(&self.reserved);
        bytes[SSID_OFFSET..PASSWORD_OFFSET].copy_from_slice(&self.ssid);
        bytes[PASSWORD_OFFSET..IDENTITY_OFFSET].copy_from_slice(&self.password);
        bytes[IDENTITY_OFFSET..SIZES_OFFSET].copy_from_slice(&self.eap_identity);
        for (i, size) in self.credential_sizes.iter().enumerate() {
            let at = SIZES_OFFSET + i * 4;
            bytes[at..at + 4].copy_from_slice(&size.to_le_bytes());
        }
        bytes
    }

    /// Leading [`REDUCED_RECORD_SIZE`] bytes, without secrets.
    pub fn reduced_bytes(&self) -> [u8; REDUCED_RECORD_SIZE] {
        let mut full = self.to_bytes();
        let mut reduced = [0u8; REDUCED_RECORD_SIZE];
        reduced.copy_from_slice(&full[..REDUCED_RECORD_SIZE]);
        full.zeroize();
        reduced
    }

    /// Deserialize from the table layout.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        if bytes.len() != RECORD_SIZE {
            return Err(ConfigError::InvalidFormat(format!(
                "record is {} bytes (expected {})",
                bytes.len(),
                RECORD_SIZE
            )));
        }

        let mut record = Self::blank();
        record.ip.copy_from_slice(&bytes[IP_OFFSET..IP_OFFSET + 4]);
        record
            .gateway
            .copy_from_slice(&bytes[GATEWAY_OFFSET..GATEWAY_OFFSET + 4]);
        record
            .netmask
            .copy_from_slice(&bytes[NETMASK_OFFSET..NETMASK_OFFSET + 4]);
        record.channel = bytes[CHANNEL_OFFSET];
        record.security = bytes[SECURITY_OFFSET];
        record
            .reserved
            .copy_from_slice(&bytes[SECURITY_OFFSET + 1..SSID_OFFSET]);
        record.ssid.copy_from_slice(&bytes[SSID_OFFSET..PASSWORD_OFFSET]);
        record
            .password
            .copy_from_slice(&bytes[PASSWORD_OFFSET..IDENTITY_OFFSET]);
        record
            .eap_identity
            .copy_from_slice(&bytes[IDENTITY_OFFSET..SIZES_OFFSET]);
        for (i, size) in record.credential_sizes.iter_mut().enumerate() {
            let at = SIZES_OFFSET + i * 4;
            *size = u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        }
        Ok(record)
    }
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "CredentialRecord(empty)");
        }
        f.debug_struct("CredentialRecord")
            .field("ssid", &self.ssid())
            .field("ip", &self.ip_addr())
            .field("channel", &self.channel)
            .field("security", &self.security)
            .field("password", &"<redacted>")
            .field("credential_sizes", &self.credential_sizes)
            .finish()
    }
}

/// Errors in credential records and their content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// SSID is empty.
    SsidEmpty,
    /// SSID exceeds maximum length.
    SsidTooLong { len: usize, max: usize },
    /// Password is too short for WPA2.
    PasswordTooShort { len: usize, min: usize },
    /// Password exceeds maximum length.
    PasswordTooLong { len: usize, max: usize },
    /// Control character in SSID or password.
    InvalidCharacter,
    /// Access point address is unusable.
    InvalidAddress(Ipv4Addr),
    /// Access point channel out of range.
    InvalidChannel(u8),
    /// Unknown security method.
    UnknownSecurity(u8),
    /// Invalid data format during deserialization.
    InvalidFormat(String),
    /// A tunable is out of range.
    InvalidSetting(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SsidEmpty => write!(f, "SSID cannot be empty"),
            Self::SsidTooLong { len, max } => {
                write!(f, "SSID too long: {} bytes (max {})", len, max)
            }
            Self::PasswordTooShort { len, min } => {
                write!(f, "password too short: {} bytes (min {})", len, min)
            }
            Self::PasswordTooLong { len, max } => {
                write!(f, "password too long: {} bytes (max {})", len, max)
            }
            Self::InvalidCharacter => write!(f, "invalid character"),
            Self::InvalidAddress(ip) => write!(f, "invalid address: {}", ip),
            Self::InvalidChannel(ch) => write!(f, "invalid channel: {}", ch),
            Self::UnknownSecurity(value) => write!(f, "unknown security method: {}", value),
            Self::InvalidFormat(msg) => write!(f, "invalid format: {}", msg),
            Self::InvalidSetting(name) => write!(f, "invalid setting: {}", name),
        }
    }
}

impl std::error::Error for ConfigError {}
