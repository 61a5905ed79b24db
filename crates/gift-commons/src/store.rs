//! Commons file management and slot I/O.
//!
//! [`CommonsFile`] owns the file descriptor and the shared read/write
//! mapping. Slot `i` lives at `header_size + i * slot_size`; every slot
//! write covers the whole slot so bytes from a previous, larger gift never
//! survive.
//!
//! Creation and first open run under an exclusive advisory lock on the
//! file itself, so two processes racing to create the same commons agree
//! on who writes the initial header.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{Ordering, fence};

use fs2::FileExt;
use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, info, warn};

use crate::config::CommonsConfig;
use crate::header::{
    CommonsHeader, HEADER_LAYOUT_SIZE, read_gift_count, write_gift_count, write_last_modified,
};
use crate::{CommonsError, Result, now_secs};

/// Length prefix size at the start of every slot.
pub const SLOT_PREFIX_SIZE: usize = 4;

/// Owner read/write.
#[cfg(unix)]
const FILE_MODE: u32 = 0o600;

/// Owner read/write/search.
#[cfg(unix)]
const DIR_MODE: u32 = 0o700;

/// A mapped commons file.
pub struct CommonsFile {
    /// Path to the commons file.
    path: PathBuf,
    /// Open handle, kept for advisory locking.
    file: File,
    /// Shared read/write mapping of the whole file.
    mmap: MmapMut,
    /// Size of the header region.
    header_size: usize,
    /// Size of each slot.
    slot_size: usize,
    /// Number of slots in this file.
    max_slots: usize,
    /// Flush after each commit.
    sync_on_write: bool,
}

impl std::fmt::Debug for CommonsFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommonsFile")
            .field("path", &self.path)
            .field("header_size", &self.header_size)
            .field("slot_size", &self.slot_size)
            .field("max_slots", &self.max_slots)
            .finish_non_exhaustive()
    }
}

/// Exclusive advisory lock on a commons file, released on drop.
///
/// Holds a duplicate of the descriptor so the owning [`CommonsFile`]
/// stays mutably borrowable while the lock is held.
pub struct WriterLock {
    file: File,
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        // Use explicit fs2::FileExt call to avoid conflict with std File::unlock (1.89+)
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("failed to release commons writer lock: {e}");
        }
    }
}

impl CommonsFile {
    /// Open the commons at `path`, creating it if absent.
    ///
    /// A new file is sized to `config.file_size()`, zero filled, restricted
    /// to its owner and stamped with a fresh header. An existing file must
    /// carry the commons magic; its slot count is taken from its length.
    ///
    /// # Errors
    ///
    /// Returns `CommonsError::CorruptStore` if the existing file is not a
    /// commons file, `CommonsError::UnsupportedVersion` for an unknown
    /// format version, and `CommonsError::Io` for filesystem failures.
    pub fn open_or_create(path: impl AsRef<Path>, config: &CommonsConfig) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            create_private_dir(parent)?;
        }

        let file = open_private_file(&path)?;

        FileExt::lock_exclusive(&file)?;
        let lock = WriterLock {
            file: file.try_clone()?,
        };

        let len = usize::try_from(file.metadata()?.len()).map_err(|_| {
            CommonsError::CorruptStore(format!("{} is too large to map", path.display()))
        })?;

        let commons = if len == 0 {
            Self::initialize(path, file, config)?
        } else {
            Self::attach(path, file, len, config)?
        };

        drop(lock);
        Ok(commons)
    }

    /// Size and stamp a freshly created, empty file.
    fn initialize(path: PathBuf, file: File, config: &CommonsConfig) -> Result<Self> {
        let size = config.file_size();
        file.set_len(size as u64)?;

        let mmap = map_file(&file, size)?;

        let mut commons = Self {
            path,
            file,
            mmap,
            header_size: config.header_size,
            slot_size: config.slot_size,
            max_slots: config.max_slots,
            sync_on_write: config.sync_on_write,
        };
        commons.write_header(&CommonsHeader::new(&config.blessing, now_secs()))?;
        commons.flush()?;

        info!(
            "created commons {} ({} slots of {} bytes)",
            commons.path.display(),
            config.max_slots,
            config.slot_size
        );

        Ok(commons)
    }

    /// Map an existing file and verify its header.
    fn attach(path: PathBuf, file: File, len: usize, config: &CommonsConfig) -> Result<Self> {
        let minimum = config.header_size.checked_add(config.slot_size);
        if minimum.is_none_or(|minimum| len < minimum) {
            return Err(CommonsError::CorruptStore(format!(
                "{} is {len} bytes, too small for a header and one slot",
                path.display()
            )));
        }

        let mmap = map_file(&file, len)?;

        let header = CommonsHeader::from_bytes(&mmap[..HEADER_LAYOUT_SIZE])?;
        header.validate()?;

        let max_slots = (len - config.header_size) / config.slot_size;
        if max_slots != config.max_slots {
            debug!(
                "commons {} holds {max_slots} slots (configured {})",
                path.display(),
                config.max_slots
            );
        }

        info!(
            "opened commons {} with {} gifts",
            path.display(),
            header.gift_count
        );

        Ok(Self {
            path,
            file,
            mmap,
            header_size: config.header_size,
            slot_size: config.slot_size,
            max_slots,
            sync_on_write: config.sync_on_write,
        })
    }

    /// Read the whole header.
    pub fn read_header(&self) -> Result<CommonsHeader> {
        CommonsHeader::from_bytes(&self.mmap[..HEADER_LAYOUT_SIZE])
    }

    /// Overwrite the whole header.
    pub fn write_header(&mut self, header: &CommonsHeader) -> Result<()> {
        let bytes = header.to_bytes()?;
        self.mmap[..bytes.len()].copy_from_slice(&bytes);
        Ok(())
    }

    /// Committed gift count, read from the mapping.
    ///
    /// Always reflects the latest value written by any attached process.
    /// A count above the slot capacity means the header was damaged; it
    /// is clamped so scans stay in bounds.
    pub fn gift_count(&self) -> usize {
        let count = read_gift_count(&self.mmap[..HEADER_LAYOUT_SIZE]) as usize;
        fence(Ordering::Acquire);
        if count > self.max_slots {
            warn!(
                "commons {} reports {count} gifts but holds {} slots, clamping",
                self.path.display(),
                self.max_slots
            );
            return self.max_slots;
        }
        count
    }

    /// Publish a new gift count.
    ///
    /// Slot writes issued before this call are visible to any reader that
    /// observes the new count.
    pub fn set_gift_count(&mut self, count: usize) -> Result<()> {
        if count > self.max_slots {
            return Err(CommonsError::SlotOutOfRange {
                index: count,
                max_slots: self.max_slots,
            });
        }
        fence(Ordering::Release);
        // max_slots fits in u32 (checked by CommonsConfig::validate)
        write_gift_count(&mut self.mmap[..HEADER_LAYOUT_SIZE], count as u32);
        Ok(())
    }

    /// Stamp the last modified time.
    pub fn touch(&mut self, now: f64) {
        write_last_modified(&mut self.mmap[..HEADER_LAYOUT_SIZE], now);
    }

    /// Byte offset of slot `index`.
    pub fn slot_offset(&self, index: usize) -> Result<usize> {
        if index >= self.max_slots {
            return Err(CommonsError::SlotOutOfRange {
                index,
                max_slots: self.max_slots,
            });
        }
        Ok(self.header_size + index * self.slot_size)
    }

    /// Raw bytes of slot `index`.
    pub fn read_slot(&self, index: usize) -> Result<&[u8]> {
        let offset = self.slot_offset(index)?;
        Ok(&self.mmap[offset..offset + self.slot_size])
    }

    /// Fill slot `index` with `bytes` followed by zero padding.
    pub fn write_slot(&mut self, index: usize, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.slot_size {
            return Err(CommonsError::GiftTooLarge {
                size: bytes.len(),
                capacity: self.slot_size,
            });
        }
        let offset = self.slot_offset(index)?;
        let slot = &mut self.mmap[offset..offset + self.slot_size];
        slot[..bytes.len()].copy_from_slice(bytes);
        slot[bytes.len()..].fill(0);
        Ok(())
    }

    /// Zero slot `index`.
    pub fn clear_slot(&mut self, index: usize) -> Result<()> {
        self.write_slot(index, &[])
    }

    /// Flush the mapping if the commons was opened with `sync_on_write`.
    pub fn sync_if_configured(&self) -> Result<()> {
        if self.sync_on_write {
            self.flush()?;
        }
        Ok(())
    }

    /// Flush the mapping to disk.
    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }

    /// Take the exclusive cross-process writer lock, blocking until free.
    pub fn lock_writers(&self) -> Result<WriterLock> {
        let file = self.file.try_clone()?;
        FileExt::lock_exclusive(&file)?;
        Ok(WriterLock { file })
    }

    /// Path to the commons file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of slots.
    pub const fn max_slots(&self) -> usize {
        self.max_slots
    }

    /// Size of each slot.
    pub const fn slot_size(&self) -> usize {
        self.slot_size
    }
}

/// Map `len` bytes of `file` shared and writable.
#[allow(unsafe_code)]
fn map_file(file: &File, len: usize) -> Result<MmapMut> {
    // SAFETY: the mapping is shared with other processes. Every
    // read goes through bounds-checked slices, and torn slot contents are
    // rejected by the decoder rather than trusted.
    let mmap = unsafe { MmapOptions::new().len(len).map_mut(file)? };
    Ok(mmap)
}

#[cfg(unix)]
fn open_private_file(path: &Path) -> Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(FILE_MODE)
        .open(path)?)
}

#[cfg(not(unix))]
fn open_private_file(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    info!("creating commons directory {}", dir.display());
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(dir)?;
    Ok(())
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> Result<()> {
    info!("creating commons directory {}", dir.display());
    std::fs::create_dir_all(dir)?;
    Ok(())
}
