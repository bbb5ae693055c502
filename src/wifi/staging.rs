//! Enterprise credential staging.
//!
//! Between Begin and End of an enterprise upload, chunk bytes are written
//! into the scratch partition at per-kind regions laid out back to back
//! (CA certificate, then client certificate, then private key). This
//! record tracks where the next chunk of each kind goes.

use crate::config::{CredentialKind, CredentialRecord};

/// Progress of one enterprise upload.
#[derive(Debug)]
pub struct EnterpriseStaging {
    slot: usize,
    record: CredentialRecord,
    sizes: [u32; 3],
    received: [u32; 3],
}

/// Where a chunk lands in the scratch partition, or why it cannot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkPlacement {
    /// Write at this scratch offset.
    At(usize),
    /// The chunk would take `kind` past its declared size.
    Overflow { declared: u32, attempted: u64 },
}

impl EnterpriseStaging {
    /// Start staging `record` for `slot`. Declared sizes come from the record.
    pub fn new(slot: usize, record: CredentialRecord) -> Self {
        let sizes = record.credential_sizes();
        Self {
            slot,
            record,
            sizes,
            received: [0; 3],
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn record(&self) -> &CredentialRecord {
        &self.record
    }

    /// Declared size of `kind`.
    pub fn declared(&self, kind: CredentialKind) -> u32 {
        self.sizes[kind.index()]
    }

    /// Bytes of `kind` received so far.
    pub fn received(&self, kind: CredentialKind) -> u32 {
        self.received[kind.index()]
    }

    /// Sum of all declared sizes, i.e. the scratch space needed.
    pub fn total_size(&self) -> u64 {
        self.sizes.iter().map(|&s| u64::from(s)).sum()
    }

    /// Scratch offset of the start of `kind`'s region.
    pub fn region_start(&self, kind: CredentialKind) -> usize {
        self.sizes[..kind.index()]
            .iter()
            .map(|&s| s as usize)
            .sum()
    }

    /// Where a chunk of `len` bytes of `kind` would be written.
    pub fn place(&self, kind: CredentialKind, len: usize) -> ChunkPlacement {
        let declared = self.declared(kind);
        let attempted = u64::from(self.received(kind)) + len as u64;
        if attempted > u64::from(declared) {
            return ChunkPlacement::Overflow {
                declared,
                attempted,
            };
        }
        ChunkPlacement::At(self.region_start(kind) + self.received(kind) as usize)
    }

    /// Record that `len` bytes of `kind` were written.
    pub fn advance(&mut self, kind: CredentialKind, len: usize) {
        self.received[kind.index()] += len as u32;
    }

    /// First kind whose received byte count differs from its declared size.
    pub fn first_incomplete(&self) -> Option<CredentialKind> {
        CredentialKind::ALL
            .into_iter()
            .find(|&kind| self.received(kind) != self.declared(kind))
    }
}
