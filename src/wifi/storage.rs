//! Durable credential store.
//!
//! The SSID table is a fixed array of [`CredentialRecord`]s in a raw
//! partition: slot 0 is the module's access point, slots
//! `1..=MAX_REMEMBERED_NETWORKS` are remembered station networks. Enterprise
//! certificates and keys are too large for the table and live in a
//! key-value namespace, chunked:
//!
//! ```text
//! c<slot>.sz                  bank and sizes record (4 x u32 LE)
//! c<slot>.<bank>.<kind>.<n>   chunk n of credential kind (0 CA, 1 cert, 2 key)
//! ```
//!
//! Enterprise uploads are staged in a separate scratch partition and only
//! copied into the key-value namespace on commit, so a half-finished upload
//! never disturbs the committed record. The target slot is reserved while an
//! upload is open. A commit writes its chunks into the bank the slot is not
//! using and switches over by rewriting the sizes record, so a failed commit
//! leaves the previous credentials readable. Every operation holds the
//! store's single lock for its whole duration.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::staging::{ChunkPlacement, EnterpriseStaging};
use crate::config::{
    field_bytes, ConfigError, CredentialKind, CredentialRecord, MAX_REMEMBERED_NETWORKS,
    RECORD_SIZE, REDUCED_RECORD_SIZE, SSID_LENGTH,
};
use crate::platform::{KvEngine, Partition, PlatformError};

/// Number of slots in the SSID table.
pub const TABLE_SLOTS: usize = MAX_REMEMBERED_NETWORKS + 1;

/// Bytes needed for the SSID table.
pub const TABLE_SIZE: usize = TABLE_SLOTS * RECORD_SIZE;

/// Size of one credential chunk in the key-value namespace.
pub const CREDENTIAL_CHUNK_SIZE: usize = 1024;

const SIZES_RECORD_LEN: usize = 16;

/// Committed enterprise credentials of one slot.
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct EnterpriseCredentials {
    pub ca_certificate: Vec<u8>,
    pub client_certificate: Vec<u8>,
    pub private_key: Vec<u8>,
}

impl EnterpriseCredentials {
    pub fn get(&self, kind: CredentialKind) -> &[u8] {
        match kind {
            CredentialKind::CaCertificate => &self.ca_certificate,
            CredentialKind::ClientCertificate => &self.client_certificate,
            CredentialKind::PrivateKey => &self.private_key,
        }
    }

    fn get_mut(&mut self, kind: CredentialKind) -> &mut Vec<u8> {
        match kind {
            CredentialKind::CaCertificate => &mut self.ca_certificate,
            CredentialKind::ClientCertificate => &mut self.client_certificate,
            CredentialKind::PrivateKey => &mut self.private_key,
        }
    }
}

impl fmt::Debug for EnterpriseCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnterpriseCredentials")
            .field("ca_certificate", &self.ca_certificate.len())
            .field("client_certificate", &self.client_certificate.len())
            .field("private_key", &self.private_key.len())
            .finish()
    }
}

/// Errors that can occur in the credential store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No free slot for a new network.
    TableFull,
    /// No record with the requested SSID.
    NotFound,
    /// Slot number out of range.
    InvalidSlot(usize),
    /// The record was rejected.
    InvalidRecord(ConfigError),
    /// The record partition cannot hold the table.
    InsufficientStorage { needed: usize, available: usize },
    /// An enterprise upload is already open.
    StagingActive,
    /// No enterprise upload is open.
    NoStaging,
    /// Declared credentials do not fit the scratch partition.
    CredentialTooLarge { needed: u64, available: usize },
    /// A chunk would exceed its kind's declared size.
    CredentialOverflow {
        kind: CredentialKind,
        declared: u32,
        attempted: u64,
    },
    /// Commit with a credential not uploaded to its declared size.
    IncompleteCredential {
        kind: CredentialKind,
        declared: u32,
        received: u32,
    },
    /// Stored data is inconsistent.
    Corrupt(String),
    /// Storage backend failure.
    Platform(PlatformError),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TableFull => write!(f, "SSID table full"),
            Self::NotFound => write!(f, "SSID not found"),
            Self::InvalidSlot(slot) => write!(f, "invalid slot {}", slot),
            Self::InvalidRecord(e) => write!(f, "invalid record: {}", e),
            Self::InsufficientStorage { needed, available } => write!(
                f,
                "insufficient storage: need {} bytes, have {}",
                needed, available
            ),
            Self::StagingActive => write!(f, "enterprise upload already in progress"),
            Self::NoStaging => write!(f, "no enterprise upload in progress"),
            Self::CredentialTooLarge { needed, available } => write!(
                f,
                "credentials too large: {} bytes (max {})",
                needed, available
            ),
            Self::CredentialOverflow {
                kind,
                declared,
                attempted,
            } => write!(
                f,
                "{} exceeds declared size: {} of {} bytes",
                kind, attempted, declared
            ),
            Self::IncompleteCredential {
                kind,
                declared,
                received,
            } => write!(
                f,
                "{} incomplete: {} of {} bytes",
                kind, received, declared
            ),
            Self::Corrupt(msg) => write!(f, "stored data corrupt: {}", msg),
            Self::Platform(e) => write!(f, "storage failure: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<PlatformError> for StoreError {
    fn from(e: PlatformError) -> Self {
        Self::Platform(e)
    }
}

impl From<ConfigError> for StoreError {
    fn from(e: ConfigError) -> Self {
        Self::InvalidRecord(e)
    }
}

struct Backend {
    table: Box<dyn Partition>,
    scratch: Box<dyn Partition>,
    kv: Box<dyn KvEngine>,
    staging: Option<EnterpriseStaging>,
    loaded: Option<(usize, Arc<EnterpriseCredentials>)>,
}

/// Persistent credential store shared by the protocol engine and the
/// connection state machine.
pub struct ConfigStore {
    backend: Mutex<Backend>,
}

impl ConfigStore {
    /// Open the store over its three backends.
    ///
    /// Fails with [`StoreError::InsufficientStorage`] when the table
    /// partition is too small; any scratch data left by an interrupted
    /// upload is erased.
    pub fn open(
        table: Box<dyn Partition>,
        mut scratch: Box<dyn Partition>,
        kv: Box<dyn KvEngine>,
    ) -> Result<Self, StoreError> {
        if table.size() < TABLE_SIZE {
            error!(
                "SSID table partition too small: {} < {} bytes",
                table.size(),
                TABLE_SIZE
            );
            return Err(StoreError::InsufficientStorage {
                needed: TABLE_SIZE,
                available: table.size(),
            });
        }

        let scratch_size = scratch.size();
        scratch.erase(0, scratch_size)?;

        info!(
            "Credential store opened ({} slots, {} bytes scratch)",
            TABLE_SLOTS, scratch_size
        );
        Ok(Self {
            backend: Mutex::new(Backend {
                table,
                scratch,
                kv,
                staging: None,
                loaded: None,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Backend> {
        self.backend.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a network. `access_point` selects slot 0; otherwise the record
    /// replaces the slot with the same SSID, or takes the first empty one.
    pub fn set_credential(
        &self,
        record: &CredentialRecord,
        access_point: bool,
    ) -> Result<usize, StoreError> {
        let mut backend = self.lock();

        if !access_point && record.ssid_bytes().is_empty() {
            return Err(StoreError::InvalidRecord(ConfigError::SsidEmpty));
        }

        let slot = if access_point {
            0
        } else {
            match backend.find(record.ssid_bytes())? {
                Some((slot, _)) => slot,
                None => backend.first_empty()?.ok_or(StoreError::TableFull)?,
            }
        };
        if backend.is_reserved(slot) {
            warn!("Slot {} is reserved by an enterprise upload", slot);
            return Err(StoreError::StagingActive);
        }

        if !record.is_enterprise() {
            backend.erase_enterprise(slot)?;
        }
        backend.write_record(slot, record)?;
        info!("Stored network '{}' in slot {}", record.ssid(), slot);
        Ok(slot)
    }

    /// Erase the station network with `ssid` along with any enterprise
    /// credentials. Returns the freed slot.
    pub fn erase_credential(&self, ssid: &[u8]) -> Result<usize, StoreError> {
        let mut backend = self.lock();
        let ssid = field_bytes(ssid);
        let (slot, _) = backend.find(ssid)?.ok_or(StoreError::NotFound)?;
        if backend.is_reserved(slot) {
            warn!("Slot {} is reserved by an enterprise upload", slot);
            return Err(StoreError::StagingActive);
        }

        backend.erase_enterprise(slot)?;
        backend.table.erase(slot * RECORD_SIZE, RECORD_SIZE)?;
        info!(
            "Erased network '{}' from slot {}",
            String::from_utf8_lossy(ssid),
            slot
        );
        Ok(slot)
    }

    /// Record in `slot`, or `None` when the slot is empty.
    pub fn credential(&self, slot: usize) -> Result<Option<CredentialRecord>, StoreError> {
        if slot >= TABLE_SLOTS {
            return Err(StoreError::InvalidSlot(slot));
        }
        let record = self.lock().read_record(slot)?;
        Ok((!record.is_empty()).then_some(record))
    }

    /// Station network with `ssid`, if remembered.
    pub fn find_credential(
        &self,
        ssid: &[u8],
    ) -> Result<Option<(usize, CredentialRecord)>, StoreError> {
        self.lock().find(field_bytes(ssid))
    }

    /// Reduced records of slots `0..`, as many as fit in `capacity` bytes.
    ///
    /// An unset access point slot is reported as a zeroed entry so that
    /// entry positions match slot numbers.
    pub fn list_reduced(&self, capacity: usize) -> Result<Vec<u8>, StoreError> {
        let backend = self.lock();
        let mut out = Vec::new();
        let mut slot = 0;
        while slot < TABLE_SLOTS && (slot + 1) * REDUCED_RECORD_SIZE <= capacity {
            let record = backend.read_record(slot)?;
            if !record.is_empty() {
                out.extend_from_slice(&record.reduced_bytes());
            } else if slot == 0 {
                out.extend_from_slice(&[0u8; REDUCED_RECORD_SIZE]);
            }
            slot += 1;
        }
        Ok(out)
    }

    /// SSIDs as newline-separated text, access point first (empty line
    /// when unset), NUL terminated.
    pub fn list_ssids_text(&self) -> Result<Vec<u8>, StoreError> {
        let backend = self.lock();
        let mut out = Vec::new();
        for slot in 0..TABLE_SLOTS {
            let record = backend.read_record(slot)?;
            if !record.is_empty() {
                out.extend_from_slice(record.ssid_bytes());
                out.push(b'\n');
            } else if slot == 0 {
                out.push(b'\n');
            }
        }
        out.push(0);
        Ok(out)
    }

    /// Open an enterprise upload for `record`.
    ///
    /// The target slot is chosen like [`ConfigStore::set_credential`], but
    /// nothing durable changes until [`ConfigStore::end_enterprise`]
    /// commits.
    pub fn begin_enterprise(&self, record: CredentialRecord) -> Result<usize, StoreError> {
        let mut backend = self.lock();

        if backend.staging.is_some() {
            return Err(StoreError::StagingActive);
        }
        if record.ssid_bytes().is_empty() {
            return Err(StoreError::InvalidRecord(ConfigError::SsidEmpty));
        }
        if !record.is_enterprise() {
            return Err(StoreError::InvalidRecord(ConfigError::UnknownSecurity(
                record.security_byte(),
            )));
        }

        let slot = match backend.find(record.ssid_bytes())? {
            Some((slot, _)) => slot,
            None => backend.first_empty()?.ok_or(StoreError::TableFull)?,
        };

        let staging = EnterpriseStaging::new(slot, record);
        let available = backend.scratch.size();
        if staging.total_size() > available as u64 {
            return Err(StoreError::CredentialTooLarge {
                needed: staging.total_size(),
                available,
            });
        }

        backend.scratch.erase(0, staging.total_size() as usize)?;
        backend.invalidate(slot);
        info!(
            "Enterprise upload for '{}' started (slot {}, {} bytes)",
            staging.record().ssid(),
            slot,
            staging.total_size()
        );
        backend.staging = Some(staging);
        Ok(slot)
    }

    /// Append a chunk of `kind` to the open upload.
    ///
    /// A chunk that would overflow the declared size is refused and the
    /// upload stays open. A storage failure abandons the upload.
    pub fn set_enterprise_chunk(&self, kind: CredentialKind, data: &[u8]) -> Result<(), StoreError> {
        let mut backend = self.lock();
        let backend = &mut *backend;
        let staging = backend.staging.as_mut().ok_or(StoreError::NoStaging)?;

        let offset = match staging.place(kind, data.len()) {
            ChunkPlacement::At(offset) => offset,
            ChunkPlacement::Overflow {
                declared,
                attempted,
            } => {
                warn!("{} chunk overflows declared size {}", kind, declared);
                return Err(StoreError::CredentialOverflow {
                    kind,
                    declared,
                    attempted,
                });
            }
        };

        if let Err(e) = backend.scratch.write(offset, data) {
            error!("Scratch write failed, abandoning enterprise upload: {}", e);
            let used = staging.total_size() as usize;
            backend.staging = None;
            let _ = backend.scratch.erase(0, used);
            return Err(e.into());
        }
        staging.advance(kind, data.len());
        debug!(
            "{} chunk of {} bytes at scratch offset {}",
            kind,
            data.len(),
            offset
        );
        Ok(())
    }

    /// Finish the open upload. With `commit`, the staged credentials and the
    /// record become durable in one step; otherwise they are dropped. The
    /// staging context is gone afterwards either way.
    ///
    /// A failed commit leaves the slot's previous record and credentials in
    /// place.
    pub fn end_enterprise(&self, commit: bool) -> Result<(), StoreError> {
        let mut backend = self.lock();
        let staging = backend.staging.take().ok_or(StoreError::NoStaging)?;
        let used = staging.total_size() as usize;

        let result = if !commit {
            info!("Enterprise upload for slot {} cancelled", staging.slot());
            Ok(())
        } else if let Some(kind) = staging.first_incomplete() {
            warn!("Enterprise commit refused: {} incomplete", kind);
            Err(StoreError::IncompleteCredential {
                kind,
                declared: staging.declared(kind),
                received: staging.received(kind),
            })
        } else {
            backend.commit(&staging)
        };

        backend.scratch.erase(0, used)?;
        result
    }

    /// Whether an enterprise upload is open.
    pub fn is_staging(&self) -> bool {
        self.lock().staging.is_some()
    }

    /// Committed credentials of an enterprise record in `slot`.
    ///
    /// The most recently loaded slot is cached until it is rewritten.
    pub fn enterprise_credentials(
        &self,
        slot: usize,
    ) -> Result<Option<Arc<EnterpriseCredentials>>, StoreError> {
        if slot >= TABLE_SLOTS {
            return Err(StoreError::InvalidSlot(slot));
        }
        let mut backend = self.lock();
        if let Some((loaded, credentials)) = &backend.loaded {
            if *loaded == slot {
                return Ok(Some(Arc::clone(credentials)));
            }
        }

        let Some(committed) = backend.read_sizes(slot)? else {
            return Ok(None);
        };
        let mut credentials = EnterpriseCredentials::default();
        let mut chunk = [0u8; CREDENTIAL_CHUNK_SIZE];
        for kind in CredentialKind::ALL {
            let size = committed.size(kind);
            let target = credentials.get_mut(kind);
            target.reserve_exact(size);
            for n in 0..committed.chunks(kind) {
                let key = chunk_key(slot, committed.bank, kind, n);
                let len = backend
                    .kv
                    .get(&key, &mut chunk)?
                    .ok_or_else(|| StoreError::Corrupt(format!("missing {}", key)))?;
                target.extend_from_slice(&chunk[..len]);
            }
            if target.len() != size {
                chunk.zeroize();
                return Err(StoreError::Corrupt(format!(
                    "slot {} {} is {} bytes (expected {})",
                    slot,
                    kind,
                    target.len(),
                    size
                )));
            }
        }
        chunk.zeroize();

        let credentials = Arc::new(credentials);
        backend.loaded = Some((slot, Arc::clone(&credentials)));
        debug!("Loaded enterprise credentials for slot {}", slot);
        Ok(Some(credentials))
    }

    /// Erase every record, all enterprise credentials and any open upload.
    pub fn factory_reset(&self) -> Result<(), StoreError> {
        let mut backend = self.lock();
        for slot in 0..TABLE_SLOTS {
            backend.erase_enterprise(slot)?;
        }
        let table_size = backend.table.size();
        backend.table.erase(0, table_size)?;
        let scratch_size = backend.scratch.size();
        backend.scratch.erase(0, scratch_size)?;
        backend.staging = None;
        backend.loaded = None;
        info!("Credential store reset to factory defaults");
        Ok(())
    }
}

fn sizes_key(slot: usize) -> String {
    format!("c{}.sz", slot)
}

fn chunk_key(slot: usize, bank: u32, kind: CredentialKind, chunk: usize) -> String {
    format!("c{}.{}.{}.{}", slot, bank, kind.index(), chunk)
}

/// Contents of a slot's sizes record: which chunk bank is live and the
/// byte length of each credential kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CommittedSizes {
    bank: u32,
    sizes: [u32; 3],
}

impl CommittedSizes {
    fn staged(staging: &EnterpriseStaging, bank: u32) -> Self {
        let mut sizes = [0u32; 3];
        for kind in CredentialKind::ALL {
            sizes[kind.index()] = staging.declared(kind);
        }
        Self { bank, sizes }
    }

    fn size(&self, kind: CredentialKind) -> usize {
        self.sizes[kind.index()] as usize
    }

    fn chunks(&self, kind: CredentialKind) -> usize {
        self.size(kind).div_ceil(CREDENTIAL_CHUNK_SIZE)
    }

    fn to_bytes(self) -> [u8; SIZES_RECORD_LEN] {
        let mut bytes = [0u8; SIZES_RECORD_LEN];
        bytes[..4].copy_from_slice(&self.bank.to_le_bytes());
        for (i, size) in self.sizes.iter().enumerate() {
            let at = 4 + i * 4;
            bytes[at..at + 4].copy_from_slice(&size.to_le_bytes());
        }
        bytes
    }

    fn from_bytes(bytes: &[u8; SIZES_RECORD_LEN]) -> Self {
        let word = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        Self {
            bank: word(0),
            sizes: [word(4), word(8), word(12)],
        }
    }
}

impl Backend {
    fn read_record(&self, slot: usize) -> Result<CredentialRecord, StoreError> {
        let mut bytes = [0u8; RECORD_SIZE];
        self.table.read(slot * RECORD_SIZE, &mut bytes)?;
        let record = CredentialRecord::from_bytes(&bytes);
        bytes.zeroize();
        Ok(record?)
    }

    fn write_record(&mut self, slot: usize, record: &CredentialRecord) -> Result<(), StoreError> {
        let mut bytes = record.to_bytes();
        let result = self.table.write(slot * RECORD_SIZE, &bytes);
        bytes.zeroize();
        Ok(result?)
    }

    fn find(&self, ssid: &[u8]) -> Result<Option<(usize, CredentialRecord)>, StoreError> {
        if ssid.is_empty() || ssid.len() > SSID_LENGTH {
            return Ok(None);
        }
        for slot in 1..TABLE_SLOTS {
            let record = self.read_record(slot)?;
            if !record.is_empty() && record.ssid_bytes() == ssid {
                return Ok(Some((slot, record)));
            }
        }
        Ok(None)
    }

    /// Whether `slot` is the target of the open enterprise upload.
    fn is_reserved(&self, slot: usize) -> bool {
        self.staging.as_ref().is_some_and(|staging| staging.slot() == slot)
    }

    fn first_empty(&self) -> Result<Option<usize>, StoreError> {
        for slot in 1..TABLE_SLOTS {
            if self.is_reserved(slot) {
                continue;
            }
            if self.read_record(slot)?.is_empty() {
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    fn read_sizes(&self, slot: usize) -> Result<Option<CommittedSizes>, StoreError> {
        let mut bytes = [0u8; SIZES_RECORD_LEN];
        match self.kv.get(&sizes_key(slot), &mut bytes)? {
            None => Ok(None),
            Some(SIZES_RECORD_LEN) => Ok(Some(CommittedSizes::from_bytes(&bytes))),
            Some(len) => Err(StoreError::Corrupt(format!(
                "sizes record for slot {} is {} bytes",
                slot, len
            ))),
        }
    }

    fn invalidate(&mut self, slot: usize) {
        if matches!(self.loaded, Some((loaded, _)) if loaded == slot) {
            self.loaded = None;
        }
    }

    fn remove_chunks(&mut self, slot: usize, committed: &CommittedSizes) -> Result<(), StoreError> {
        for kind in CredentialKind::ALL {
            for n in 0..committed.chunks(kind) {
                self.kv.remove(&chunk_key(slot, committed.bank, kind, n))?;
            }
        }
        Ok(())
    }

    fn erase_enterprise(&mut self, slot: usize) -> Result<(), StoreError> {
        self.invalidate(slot);
        let Some(committed) = self.read_sizes(slot)? else {
            return Ok(());
        };
        self.remove_chunks(slot, &committed)?;
        self.kv.remove(&sizes_key(slot))?;
        debug!("Removed enterprise credentials of slot {}", slot);
        Ok(())
    }

    /// Slot the commit lands in: the reserved slot, unless it no longer
    /// holds nothing or the staged network.
    fn commit_slot(&self, staging: &EnterpriseStaging) -> Result<usize, StoreError> {
        let slot = staging.slot();
        let current = self.read_record(slot)?;
        if current.is_empty() || current.ssid_bytes() == staging.record().ssid_bytes() {
            return Ok(slot);
        }
        warn!(
            "Slot {} now holds '{}', relocating enterprise commit",
            slot,
            current.ssid()
        );
        match self.find(staging.record().ssid_bytes())? {
            Some((slot, _)) => Ok(slot),
            None => self.first_empty()?.ok_or(StoreError::TableFull),
        }
    }

    fn commit(&mut self, staging: &EnterpriseStaging) -> Result<(), StoreError> {
        let slot = self.commit_slot(staging)?;
        let previous = self.read_sizes(slot)?;
        let committed = CommittedSizes::staged(staging, previous.map_or(0, |p| p.bank ^ 1));

        let switched = self
            .copy_staged(staging, slot, committed.bank)
            .and_then(|()| {
                self.kv
                    .set(&sizes_key(slot), &committed.to_bytes())
                    .map_err(StoreError::from)
            });
        if let Err(e) = switched {
            error!("Enterprise commit for slot {} failed: {}", slot, e);
            let _ = self.remove_chunks(slot, &committed);
            return Err(e);
        }

        if let Err(e) = self.write_record(slot, staging.record()) {
            error!("Enterprise record for slot {} not written: {}", slot, e);
            let restored = match previous {
                Some(previous) => self.kv.set(&sizes_key(slot), &previous.to_bytes()),
                None => self.kv.remove(&sizes_key(slot)).map(|_| ()),
            };
            if restored.is_ok() {
                let _ = self.remove_chunks(slot, &committed);
            }
            return Err(e);
        }

        self.invalidate(slot);
        if let Some(previous) = previous {
            if let Err(e) = self.remove_chunks(slot, &previous) {
                warn!("Stale credential chunks left in slot {}: {}", slot, e);
            }
        }
        info!(
            "Enterprise network '{}' committed to slot {}",
            staging.record().ssid(),
            slot
        );
        Ok(())
    }

    fn copy_staged(
        &mut self,
        staging: &EnterpriseStaging,
        slot: usize,
        bank: u32,
    ) -> Result<(), StoreError> {
        let mut chunk = [0u8; CREDENTIAL_CHUNK_SIZE];
        let result = self.copy_chunks(staging, slot, bank, &mut chunk);
        chunk.zeroize();
        result
    }

    fn copy_chunks(
        &mut self,
        staging: &EnterpriseStaging,
        slot: usize,
        bank: u32,
        chunk: &mut [u8; CREDENTIAL_CHUNK_SIZE],
    ) -> Result<(), StoreError> {
        for kind in CredentialKind::ALL {
            let start = staging.region_start(kind);
            let size = staging.declared(kind) as usize;
            let mut copied = 0;
            let mut n = 0;
            while copied < size {
                let len = (size - copied).min(CREDENTIAL_CHUNK_SIZE);
                self.scratch.read(start + copied, &mut chunk[..len])?;
                self.kv.set(&chunk_key(slot, bank, kind, n), &chunk[..len])?;
                copied += len;
                n += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Security;
    use crate::platform::host::{MemoryKv, MemoryPartition};

    fn open_store() -> (ConfigStore, MemoryPartition, MemoryPartition, MemoryKv) {
        let table = MemoryPartition::new(TABLE_SIZE);
        let scratch = MemoryPartition::new(8192);
        let kv = MemoryKv::new();
        let store = ConfigStore::open(
            Box::new(table.clone()),
            Box::new(scratch.clone()),
            Box::new(kv.clone()),
        )
        .unwrap();
        (store, table, scratch, kv)
    }

    fn station(ssid: &str) -> CredentialRecord {
        CredentialRecord::station(ssid, "password1").unwrap()
    }

    fn enterprise(ssid: &str, sizes: [u32; 3]) -> CredentialRecord {
        CredentialRecord::enterprise(ssid, Security::EapTls, "user@corp", "", sizes).unwrap()
    }

    // ==================== Open Tests ====================

    #[test]
    fn test_open_rejects_small_partition() {
        let result = ConfigStore::open(
            Box::new(MemoryPartition::new(TABLE_SIZE - 1)),
            Box::new(MemoryPartition::new(1024)),
            Box::new(MemoryKv::new()),
        );
        assert!(matches!(
            result,
            Err(StoreError::InsufficientStorage { .. })
        ));
    }

    #[test]
    fn test_open_clears_abandoned_scratch() {
        let scratch = MemoryPartition::new(64);
        let mut writer = scratch.clone();
        writer.write(0, b"leftover").unwrap();

        ConfigStore::open(
            Box::new(MemoryPartition::new(TABLE_SIZE)),
            Box::new(scratch.clone()),
            Box::new(MemoryKv::new()),
        )
        .unwrap();
        assert!(scratch.snapshot().iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_fresh_store_is_empty() {
        let (store, ..) = open_store();
        for slot in 0..TABLE_SLOTS {
            assert_eq!(store.credential(slot).unwrap(), None);
        }
        assert_eq!(
            store.credential(TABLE_SLOTS),
            Err(StoreError::InvalidSlot(TABLE_SLOTS))
        );
    }

    // ==================== Set / Erase Tests ====================

    #[test]
    fn test_set_uses_first_empty_slot() {
        let (store, ..) = open_store();
        assert_eq!(store.set_credential(&station("First"), false), Ok(1));
        assert_eq!(store.set_credential(&station("Second"), false), Ok(2));
        assert_eq!(
            store.credential(2).unwrap().unwrap().ssid_bytes(),
            b"Second"
        );
    }

    #[test]
    fn test_set_replaces_same_ssid() {
        let (store, ..) = open_store();
        store.set_credential(&station("Home"), false).unwrap();
        let updated = CredentialRecord::station("Home", "newpassword").unwrap();
        assert_eq!(store.set_credential(&updated, false), Ok(1));
        assert_eq!(store.credential(1).unwrap(), Some(updated));
        assert_eq!(store.credential(2).unwrap(), None);
    }

    #[test]
    fn test_set_access_point_slot() {
        let (store, ..) = open_store();
        assert_eq!(store.set_credential(&station("ModuleAP"), true), Ok(0));
        assert!(store.find_credential(b"ModuleAP").unwrap().is_none());
    }

    #[test]
    fn test_set_rejects_empty_ssid() {
        let (store, ..) = open_store();
        let record = CredentialRecord::station("", "").unwrap();
        assert_eq!(
            store.set_credential(&record, false),
            Err(StoreError::InvalidRecord(ConfigError::SsidEmpty))
        );
    }

    #[test]
    fn test_table_full() {
        let (store, ..) = open_store();
        for i in 0..MAX_REMEMBERED_NETWORKS {
            store
                .set_credential(&station(&format!("net{}", i)), false)
                .unwrap();
        }
        assert_eq!(
            store.set_credential(&station("one-too-many"), false),
            Err(StoreError::TableFull)
        );
        assert_eq!(StoreError::TableFull.to_string(), "SSID table full");
    }

    #[test]
    fn test_erase_frees_slot() {
        let (store, ..) = open_store();
        store.set_credential(&station("A"), false).unwrap();
        store.set_credential(&station("B"), false).unwrap();

        assert_eq!(store.erase_credential(b"A\0\0\0"), Ok(1));
        assert!(store.credential(1).unwrap().is_none());
        assert_eq!(store.set_credential(&station("C"), false), Ok(1));
    }

    #[test]
    fn test_erase_unknown() {
        let (store, ..) = open_store();
        assert_eq!(store.erase_credential(b"ghost"), Err(StoreError::NotFound));
        assert_eq!(StoreError::NotFound.to_string(), "SSID not found");
    }

    #[test]
    fn test_find_ignores_access_point_slot() {
        let (store, ..) = open_store();
        store.set_credential(&station("Shared"), true).unwrap();
        assert!(store.find_credential(b"Shared").unwrap().is_none());
        store.set_credential(&station("Shared"), false).unwrap();
        let (slot, _) = store.find_credential(b"Shared").unwrap().unwrap();
        assert_eq!(slot, 1);
    }

    // ==================== Listing Tests ====================

    #[test]
    fn test_list_reduced_with_empty_ap() {
        let (store, ..) = open_store();
        store.set_credential(&station("Alpha"), false).unwrap();
        store.set_credential(&station("Beta"), false).unwrap();

        let list = store.list_reduced(2048).unwrap();
        assert_eq!(list.len(), 3 * REDUCED_RECORD_SIZE);
        assert!(list[..REDUCED_RECORD_SIZE].iter().all(|&b| b == 0));
        assert_eq!(&list[REDUCED_RECORD_SIZE + 16..REDUCED_RECORD_SIZE + 21], b"Alpha");
    }

    #[test]
    fn test_list_reduced_bounded_by_capacity() {
        let (store, ..) = open_store();
        store.set_credential(&station("AP"), true).unwrap();
        for name in ["One", "Two", "Three"] {
            store.set_credential(&station(name), false).unwrap();
        }
        let list = store.list_reduced(2 * REDUCED_RECORD_SIZE + 10).unwrap();
        assert_eq!(list.len(), 2 * REDUCED_RECORD_SIZE);
        assert!(store.list_reduced(REDUCED_RECORD_SIZE - 1).unwrap().is_empty());
    }

    #[test]
    fn test_list_ssids_text() {
        let (store, ..) = open_store();
        store.set_credential(&station("Alpha"), false).unwrap();
        store.set_credential(&station("Beta"), false).unwrap();
        assert_eq!(store.list_ssids_text().unwrap(), b"\nAlpha\nBeta\n\0");

        store.set_credential(&station("Module"), true).unwrap();
        assert_eq!(
            store.list_ssids_text().unwrap(),
            b"Module\nAlpha\nBeta\n\0"
        );
    }

    // ==================== Enterprise Tests ====================

    fn upload(store: &ConfigStore, kind: CredentialKind, data: &[u8]) {
        for chunk in data.chunks(300) {
            store.set_enterprise_chunk(kind, chunk).unwrap();
        }
    }

    #[test]
    fn test_enterprise_commit() {
        let (store, _, scratch, _) = open_store();
        let ca = vec![0xCA; 1500];
        let cert = vec![0xCE; 700];
        let key = vec![0x4B; 90];
        let record = enterprise("Corp", [1500, 700, 90]);

        let slot = store.begin_enterprise(record.clone()).unwrap();
        assert_eq!(slot, 1);
        upload(&store, CredentialKind::CaCertificate, &ca);
        upload(&store, CredentialKind::ClientCertificate, &cert);
        upload(&store, CredentialKind::PrivateKey, &key);

        // Nothing durable until commit
        assert!(store.credential(1).unwrap().is_none());

        store.end_enterprise(true).unwrap();
        assert!(!store.is_staging());
        assert_eq!(store.credential(1).unwrap(), Some(record));
        assert!(scratch.snapshot().iter().all(|&b| b == 0xFF));

        let creds = store.enterprise_credentials(1).unwrap().unwrap();
        assert_eq!(creds.ca_certificate, ca);
        assert_eq!(creds.client_certificate, cert);
        assert_eq!(creds.private_key, key);
    }

    #[test]
    fn test_enterprise_cancel_leaves_store_unchanged() {
        let (store, table, _, kv) = open_store();
        store.set_credential(&station("Home"), false).unwrap();
        let table_before = table.snapshot();
        let kv_before = kv.snapshot();

        store.begin_enterprise(enterprise("Corp", [10, 0, 0])).unwrap();
        store
            .set_enterprise_chunk(CredentialKind::CaCertificate, &[1; 10])
            .unwrap();
        store.end_enterprise(false).unwrap();

        assert_eq!(table.snapshot(), table_before);
        assert_eq!(kv.snapshot(), kv_before);
        assert!(!store.is_staging());
    }

    #[test]
    fn test_enterprise_incomplete_commit_fails() {
        let (store, table, _, kv) = open_store();
        let table_before = table.snapshot();

        store.begin_enterprise(enterprise("Corp", [10, 5, 0])).unwrap();
        store
            .set_enterprise_chunk(CredentialKind::CaCertificate, &[1; 10])
            .unwrap();
        store
            .set_enterprise_chunk(CredentialKind::ClientCertificate, &[2; 4])
            .unwrap();

        assert_eq!(
            store.end_enterprise(true),
            Err(StoreError::IncompleteCredential {
                kind: CredentialKind::ClientCertificate,
                declared: 5,
                received: 4
            })
        );
        assert!(!store.is_staging());
        assert_eq!(table.snapshot(), table_before);
        assert!(kv.snapshot().is_empty());
    }

    #[test]
    fn test_enterprise_overflow_keeps_staging_open() {
        let (store, ..) = open_store();
        store.begin_enterprise(enterprise("Corp", [4, 0, 0])).unwrap();
        assert!(matches!(
            store.set_enterprise_chunk(CredentialKind::CaCertificate, &[0; 5]),
            Err(StoreError::CredentialOverflow { .. })
        ));
        assert!(store.is_staging());
        store
            .set_enterprise_chunk(CredentialKind::CaCertificate, &[0; 4])
            .unwrap();
        assert!(store.end_enterprise(true).is_ok());
    }

    #[test]
    fn test_enterprise_requires_staging() {
        let (store, ..) = open_store();
        assert_eq!(
            store.set_enterprise_chunk(CredentialKind::PrivateKey, b"x"),
            Err(StoreError::NoStaging)
        );
        assert_eq!(store.end_enterprise(true), Err(StoreError::NoStaging));
    }

    #[test]
    fn test_enterprise_single_staging() {
        let (store, ..) = open_store();
        store.begin_enterprise(enterprise("Corp", [0, 0, 0])).unwrap();
        assert_eq!(
            store.begin_enterprise(enterprise("Other", [0, 0, 0])),
            Err(StoreError::StagingActive)
        );
    }

    #[test]
    fn test_enterprise_too_large_for_scratch() {
        let (store, ..) = open_store();
        assert!(matches!(
            store.begin_enterprise(enterprise("Corp", [8192, 1, 0])),
            Err(StoreError::CredentialTooLarge { .. })
        ));
        assert!(!store.is_staging());
    }

    #[test]
    fn test_enterprise_rejects_personal_record() {
        let (store, ..) = open_store();
        assert!(matches!(
            store.begin_enterprise(station("Home")),
            Err(StoreError::InvalidRecord(_))
        ));
    }

    #[test]
    fn test_enterprise_replace_invalidates_cache() {
        let (store, ..) = open_store();
        store.begin_enterprise(enterprise("Corp", [3, 0, 0])).unwrap();
        store
            .set_enterprise_chunk(CredentialKind::CaCertificate, b"old")
            .unwrap();
        store.end_enterprise(true).unwrap();
        let first = store.enterprise_credentials(1).unwrap().unwrap();
        assert_eq!(first.ca_certificate, b"old");

        store.begin_enterprise(enterprise("Corp", [5, 0, 0])).unwrap();
        store
            .set_enterprise_chunk(CredentialKind::CaCertificate, b"fresh")
            .unwrap();
        store.end_enterprise(true).unwrap();
        let second = store.enterprise_credentials(1).unwrap().unwrap();
        assert_eq!(second.ca_certificate, b"fresh");
    }

    #[test]
    fn test_personal_overwrite_removes_credentials() {
        let (store, _, _, kv) = open_store();
        store.begin_enterprise(enterprise("Corp", [1200, 0, 0])).unwrap();
        store
            .set_enterprise_chunk(CredentialKind::CaCertificate, &[7; 1200])
            .unwrap();
        store.end_enterprise(true).unwrap();
        assert_eq!(kv.len(), 3);

        store.set_credential(&station("Corp"), false).unwrap();
        assert_eq!(kv.len(), 0);
        assert!(store.enterprise_credentials(1).unwrap().is_none());
    }

    #[test]
    fn test_erase_removes_credentials() {
        let (store, _, _, kv) = open_store();
        store.begin_enterprise(enterprise("Corp", [0, 0, 2])).unwrap();
        store
            .set_enterprise_chunk(CredentialKind::PrivateKey, b"k!")
            .unwrap();
        store.end_enterprise(true).unwrap();
        assert!(!kv.snapshot().is_empty());

        store.erase_credential(b"Corp").unwrap();
        assert!(kv.snapshot().is_empty());
    }

    #[test]
    fn test_missing_chunk_is_corrupt() {
        let (store, _, _, kv) = open_store();
        store.begin_enterprise(enterprise("Corp", [4, 0, 0])).unwrap();
        store
            .set_enterprise_chunk(CredentialKind::CaCertificate, b"abcd")
            .unwrap();
        store.end_enterprise(true).unwrap();

        let mut kv = kv;
        kv.remove("c1.0.0.0").unwrap();
        assert!(matches!(
            store.enterprise_credentials(1),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn test_staged_slot_not_given_to_new_network() {
        let (store, ..) = open_store();
        assert_eq!(store.begin_enterprise(enterprise("Corp", [2, 0, 0])), Ok(1));
        assert_eq!(store.set_credential(&station("Home"), false), Ok(2));
        store
            .set_enterprise_chunk(CredentialKind::CaCertificate, b"ca")
            .unwrap();
        store.end_enterprise(true).unwrap();

        let (home, _) = store.find_credential(b"Home").unwrap().unwrap();
        let (corp, record) = store.find_credential(b"Corp").unwrap().unwrap();
        assert_eq!(home, 2);
        assert_eq!(corp, 1);
        assert!(record.is_enterprise());
    }

    #[test]
    fn test_staged_slot_refuses_single_shot_writes() {
        let (store, ..) = open_store();
        store.set_credential(&station("Corp"), false).unwrap();
        assert_eq!(store.begin_enterprise(enterprise("Corp", [2, 0, 0])), Ok(1));

        assert_eq!(
            store.set_credential(&station("Corp"), false),
            Err(StoreError::StagingActive)
        );
        assert_eq!(store.erase_credential(b"Corp"), Err(StoreError::StagingActive));
        assert!(!store.credential(1).unwrap().unwrap().is_enterprise());

        store.end_enterprise(false).unwrap();
        assert_eq!(store.erase_credential(b"Corp"), Ok(1));
    }

    fn commit_ca(store: &ConfigStore, ssid: &str, ca: &[u8]) -> Result<(), StoreError> {
        store.begin_enterprise(enterprise(ssid, [ca.len() as u32, 0, 0]))?;
        store.set_enterprise_chunk(CredentialKind::CaCertificate, ca)?;
        store.end_enterprise(true)
    }

    #[test]
    fn test_failed_commit_keeps_previous_credentials() {
        // First write fails: the new chunk. Second: the sizes record.
        for writes_allowed in [0, 1] {
            let (store, table, _, kv) = open_store();
            commit_ca(&store, "Corp", b"old").unwrap();
            assert_eq!(
                store.enterprise_credentials(1).unwrap().unwrap().ca_certificate,
                b"old"
            );
            let table_before = table.snapshot();
            let kv_before = kv.snapshot();

            kv.fail_sets_after(writes_allowed);
            assert!(matches!(
                commit_ca(&store, "Corp", b"new"),
                Err(StoreError::Platform(PlatformError::Storage(_)))
            ));

            assert!(!store.is_staging());
            assert_eq!(table.snapshot(), table_before);
            assert_eq!(kv.snapshot(), kv_before);
            let creds = store.enterprise_credentials(1).unwrap().unwrap();
            assert_eq!(creds.ca_certificate, b"old");
        }
    }

    #[test]
    fn test_replacing_credentials_removes_old_bank() {
        let (store, _, _, kv) = open_store();
        commit_ca(&store, "Corp", b"old").unwrap();
        assert!(kv.snapshot().contains_key("c1.0.0.0"));

        commit_ca(&store, "Corp", b"newer").unwrap();
        let keys: Vec<String> = kv.snapshot().into_keys().collect();
        assert_eq!(keys, vec!["c1.1.0.0".to_string(), "c1.sz".to_string()]);
        assert_eq!(
            store.enterprise_credentials(1).unwrap().unwrap().ca_certificate,
            b"newer"
        );
    }

    // ==================== Factory Reset Tests ====================

    #[test]
    fn test_factory_reset() {
        let (store, table, scratch, kv) = open_store();
        store.set_credential(&station("AP"), true).unwrap();
        store.set_credential(&station("Home"), false).unwrap();
        store.begin_enterprise(enterprise("Corp", [2, 0, 0])).unwrap();
        store
            .set_enterprise_chunk(CredentialKind::CaCertificate, b"ca")
            .unwrap();
        store.end_enterprise(true).unwrap();
        store.begin_enterprise(enterprise("Pending", [1, 0, 0])).unwrap();

        store.factory_reset().unwrap();
        assert!(table.snapshot().iter().all(|&b| b == 0xFF));
        assert!(scratch.snapshot().iter().all(|&b| b == 0xFF));
        assert!(kv.snapshot().is_empty());
        assert!(!store.is_staging());
        for slot in 0..TABLE_SLOTS {
            assert!(store.credential(slot).unwrap().is_none());
        }
    }
}
