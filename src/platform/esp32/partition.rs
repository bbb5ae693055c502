//! Raw flash partitions found by label.
//!
//! Flash can only be erased a sector at a time, so writes and partial
//! erases read the sector, patch it and write it back.

use std::ffi::CString;

use esp_idf_sys::{self as sys, esp};
use log::info;
use zeroize::Zeroizing;

use super::storage_error;
use crate::platform::{check_range, Partition, PlatformError};

/// Flash erase granularity.
pub const SECTOR_SIZE: usize = 4096;

/// A data partition from the partition table.
pub struct FlashPartition {
    raw: *const sys::esp_partition_t,
    size: usize,
}

// The partition table entry is static and the flash driver serialises access.
unsafe impl Send for FlashPartition {}

impl FlashPartition {
    /// Look up a data partition by its label.
    pub fn find(label: &'static str) -> Result<Self, PlatformError> {
        let name = CString::new(label).map_err(|_| PlatformError::Unavailable(label))?;
        let raw = unsafe {
            sys::esp_partition_find_first(
                sys::esp_partition_type_t_ESP_PARTITION_TYPE_DATA,
                sys::esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_ANY,
                name.as_ptr(),
            )
        };
        if raw.is_null() {
            return Err(PlatformError::Unavailable(label));
        }
        let size = unsafe { (*raw).size } as usize;
        info!("Partition '{}': {} bytes", label, size);
        Ok(Self { raw, size })
    }

    fn erase_sectors(&mut self, offset: usize, len: usize) -> Result<(), PlatformError> {
        esp!(unsafe { sys::esp_partition_erase_range(self.raw, offset, len) })
            .map_err(storage_error)
    }

    fn write_raw(&mut self, offset: usize, data: &[u8]) -> Result<(), PlatformError> {
        esp!(unsafe {
            sys::esp_partition_write(self.raw, offset, data.as_ptr().cast(), data.len())
        })
        .map_err(storage_error)
    }

    /// Apply `patch` to every sector touched by `offset..offset + len`.
    fn rewrite(
        &mut self,
        offset: usize,
        len: usize,
        mut patch: impl FnMut(&mut [u8], usize, usize),
    ) -> Result<(), PlatformError> {
        check_range(offset, len, self.size)?;
        let mut sector = Zeroizing::new(vec![0u8; SECTOR_SIZE]);
        let mut done = 0;
        while done < len {
            let pos = offset + done;
            let base = pos - pos % SECTOR_SIZE;
            let span = SECTOR_SIZE.min(self.size - base);
            let start = pos - base;
            let n = (span - start).min(len - done);

            self.read(base, &mut sector[..span])?;
            patch(&mut sector[start..start + n], done, n);
            self.erase_sectors(base, span)?;
            self.write_raw(base, &sector[..span])?;
            done += n;
        }
        Ok(())
    }
}

impl Partition for FlashPartition {
    fn size(&self) -> usize {
        self.size
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), PlatformError> {
        check_range(offset, buf.len(), self.size)?;
        esp!(unsafe {
            sys::esp_partition_read(self.raw, offset, buf.as_mut_ptr().cast(), buf.len())
        })
        .map_err(storage_error)
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), PlatformError> {
        self.rewrite(offset, data.len(), |dst, done, n| {
            dst.copy_from_slice(&data[done..done + n])
        })
    }

    fn erase(&mut self, offset: usize, len: usize) -> Result<(), PlatformError> {
        if offset % SECTOR_SIZE == 0 && len % SECTOR_SIZE == 0 {
            check_range(offset, len, self.size)?;
            return self.erase_sectors(offset, len);
        }
        self.rewrite(offset, len, |dst, _, _| dst.fill(0xFF))
    }
}
