//! Configuration for a commons file

use crate::header::HEADER_LAYOUT_SIZE;
use crate::{CommonsError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default header region size in bytes.
pub const DEFAULT_HEADER_SIZE: usize = 1024;

/// Default slot size in bytes.
pub const DEFAULT_SLOT_SIZE: usize = 4096;

/// Default number of slots.
pub const DEFAULT_MAX_SLOTS: usize = 1000;

/// Default lifetime of an ephemeral gift.
pub const DEFAULT_EPHEMERAL_TTL: Duration = Duration::from_secs(60 * 60);

/// Age after which a compaction sentinel is treated as abandoned.
pub const DEFAULT_STALE_LOCK_AFTER: Duration = Duration::from_secs(60);

/// Blessing written into the header of newly created files.
pub const DEFAULT_BLESSING: &str = "May what is given here be found by those who need it.";

/// Smallest slot that can hold a length prefix and a minimal gift.
const MIN_SLOT_SIZE: usize = 64;

/// Configuration for opening or creating a commons file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommonsConfig {
    /// Size of the header region (bytes before slot 0)
    pub header_size: usize,

    /// Size of each slot, including the 4-byte length prefix
    pub slot_size: usize,

    /// Number of slots
    pub max_slots: usize,

    /// How long an ephemeral gift survives compaction
    pub ephemeral_ttl: Duration,

    /// Blessing written into a newly created header
    pub blessing: String,

    /// Flush the mapping to disk after every committed write
    pub sync_on_write: bool,

    /// Sentinel lock files older than this are removed before compaction
    pub stale_lock_after: Duration,
}

impl Default for CommonsConfig {
    fn default() -> Self {
        Self {
            header_size: DEFAULT_HEADER_SIZE,
            slot_size: DEFAULT_SLOT_SIZE,
            max_slots: DEFAULT_MAX_SLOTS,
            ephemeral_ttl: DEFAULT_EPHEMERAL_TTL,
            blessing: DEFAULT_BLESSING.to_string(),
            sync_on_write: false,
            stale_lock_after: DEFAULT_STALE_LOCK_AFTER,
        }
    }
}

impl CommonsConfig {
    /// Load a configuration from a JSON file.
    ///
    /// Missing fields take their default values.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            CommonsError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&data).map_err(|e| {
            CommonsError::Config(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Set the number of slots
    #[must_use]
    pub const fn with_max_slots(mut self, max_slots: usize) -> Self {
        self.max_slots = max_slots;
        self
    }

    /// Set the slot size
    #[must_use]
    pub const fn with_slot_size(mut self, slot_size: usize) -> Self {
        self.slot_size = slot_size;
        self
    }

    /// Set the header region size
    #[must_use]
    pub const fn with_header_size(mut self, header_size: usize) -> Self {
        self.header_size = header_size;
        self
    }

    /// Set the ephemeral gift lifetime
    #[must_use]
    pub const fn with_ephemeral_ttl(mut self, ttl: Duration) -> Self {
        self.ephemeral_ttl = ttl;
        self
    }

    /// Set the blessing for newly created files
    #[must_use]
    pub fn with_blessing(mut self, blessing: impl Into<String>) -> Self {
        self.blessing = blessing.into();
        self
    }

    /// Enable or disable flushing after each write
    #[must_use]
    pub const fn with_sync_on_write(mut self, sync: bool) -> Self {
        self.sync_on_write = sync;
        self
    }

    /// Set the age at which a sentinel lock is considered abandoned
    #[must_use]
    pub const fn with_stale_lock_after(mut self, age: Duration) -> Self {
        self.stale_lock_after = age;
        self
    }

    /// Total file size implied by this geometry.
    ///
    /// Saturates on overflow; [`validate`](Self::validate) rejects any
    /// geometry where that would happen.
    pub const fn file_size(&self) -> usize {
        match self.checked_file_size() {
            Some(size) => size,
            None => usize::MAX,
        }
    }

    const fn checked_file_size(&self) -> Option<usize> {
        match self.slot_size.checked_mul(self.max_slots) {
            Some(slots) => self.header_size.checked_add(slots),
            None => None,
        }
    }

    /// Check the geometry is usable.
    ///
    /// # Errors
    ///
    /// Returns `CommonsError::Config` if:
    /// - The header region cannot hold the header layout
    /// - Slots are too small to hold a gift
    /// - There are no slots, or more than fit in the `u32` gift count
    /// - The total file size does not fit in a mappable length
    pub fn validate(&self) -> Result<()> {
        if self.header_size < HEADER_LAYOUT_SIZE {
            return Err(CommonsError::Config(format!(
                "header_size {} is smaller than the header layout ({HEADER_LAYOUT_SIZE} bytes)",
                self.header_size
            )));
        }

        if self.slot_size < MIN_SLOT_SIZE {
            return Err(CommonsError::Config(format!(
                "slot_size {} is smaller than the minimum of {MIN_SLOT_SIZE} bytes",
                self.slot_size
            )));
        }

        if self.max_slots == 0 || u32::try_from(self.max_slots).is_err() {
            return Err(CommonsError::Config(format!(
                "max_slots must be between 1 and {}, got {}",
                u32::MAX,
                self.max_slots
            )));
        }

        let mappable = self
            .checked_file_size()
            .is_some_and(|size| u64::try_from(size).is_ok() && isize::try_from(size).is_ok());
        if !mappable {
            return Err(CommonsError::Config(format!(
                "geometry overflows: {} + {} x {} bytes",
                self.header_size, self.slot_size, self.max_slots
            )));
        }

        Ok(())
    }
}
