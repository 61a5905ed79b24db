//! Public handle onto a commons file.
//!
//! A [`Commons`] is shared freely between threads. Appends, compaction and
//! close take the write side of an in-process lock; discovery takes the
//! read side. Appends additionally hold the cross-process writer lock on
//! the file for the read-count, write-slot, bump-count sequence.

use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::compaction::{self, CompactionOutcome};
use crate::config::CommonsConfig;
use crate::discovery::{self, DiscoveryQuery};
use crate::gift::{Gift, GiftContent, GiftOptions, GiftType};
use crate::store::CommonsFile;
use crate::{CommonsError, Result, codec, now_secs};

/// Snapshot of a commons file's occupancy and header.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommonsStats {
    /// Committed gifts.
    pub gift_count: usize,
    /// Slot capacity.
    pub max_slots: usize,
    /// Slots not yet occupied.
    pub free_slots: usize,
    /// Committed gifts marked ephemeral.
    pub ephemeral_count: usize,
    /// Creation time, epoch seconds.
    pub created_at: f64,
    /// Last committed change, epoch seconds.
    pub last_modified: f64,
    /// Header blessing.
    pub blessing: String,
    /// Format version.
    pub version: u32,
}

/// Handle onto an open commons file.
#[derive(Debug)]
pub struct Commons {
    path: PathBuf,
    config: CommonsConfig,
    file: RwLock<Option<CommonsFile>>,
}

impl Commons {
    /// Open the commons at `path` with the default configuration,
    /// creating it if absent.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, CommonsConfig::default())
    }

    /// Open the commons at `path`, creating it with `config`'s geometry if
    /// absent.
    ///
    /// # Errors
    ///
    /// Returns `CommonsError::Config` for an invalid configuration and the
    /// errors of [`CommonsFile::open_or_create`].
    pub fn open_with_config(path: impl AsRef<Path>, config: CommonsConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = CommonsFile::open_or_create(&path, &config)?;
        Ok(Self {
            path,
            config,
            file: RwLock::new(Some(file)),
        })
    }

    /// Leave a gift and return its id.
    ///
    /// When every slot is occupied a compaction is attempted first.
    ///
    /// # Errors
    ///
    /// - `CommonsError::UnsafeContent` if the content fails validation
    /// - `CommonsError::GiftTooLarge` if the encoded gift exceeds a slot
    /// - `CommonsError::StoreFull` if no slot is free after compaction
    /// - `CommonsError::Closed` if the handle was closed
    pub fn leave_gift(
        &self,
        giver: &str,
        content: GiftContent,
        options: GiftOptions,
    ) -> Result<String> {
        let mut guard = self.file.write();
        let file = guard.as_mut().ok_or(CommonsError::Closed)?;

        codec::validate(&content)?;
        let gift = Gift::new(giver, content, options, now_secs());
        let bytes = codec::serialize(&gift, file.slot_size())?;

        let _writers = file.lock_writers()?;
        let index = self.next_slot_index(file)?;

        file.write_slot(index, &bytes)?;
        file.set_gift_count(index + 1)?;
        file.touch(gift.timestamp);
        file.sync_if_configured()?;

        debug!(
            "{} left {} gift {} in slot {index}",
            gift.giver, gift.gift_type, gift.id
        );
        Ok(gift.id)
    }

    /// First free slot, compacting once if the store is full.
    fn next_slot_index(&self, file: &mut CommonsFile) -> Result<usize> {
        let count = file.gift_count();
        if count < file.max_slots() {
            return Ok(count);
        }

        debug!("commons {} is full, compacting", self.path.display());
        compaction::compact(
            file,
            self.config.ephemeral_ttl,
            self.config.stale_lock_after,
            now_secs(),
        )?;

        let count = file.gift_count();
        if count < file.max_slots() {
            Ok(count)
        } else {
            Err(CommonsError::StoreFull {
                max_slots: file.max_slots(),
            })
        }
    }

    /// Gifts visible to `seeker` that match `query`, newest first.
    pub fn discover_gifts(&self, seeker: &str, query: &DiscoveryQuery) -> Result<Vec<Gift>> {
        let guard = self.file.read();
        let file = guard.as_ref().ok_or(CommonsError::Closed)?;
        discovery::discover(file, seeker, query)
    }

    /// Look up a gift by id, if `seeker` may see it.
    pub fn find_gift(&self, seeker: &str, id: &str) -> Result<Option<Gift>> {
        let guard = self.file.read();
        let file = guard.as_ref().ok_or(CommonsError::Closed)?;
        discovery::find(file, seeker, id)
    }

    /// Reply to an existing gift.
    ///
    /// The reply is a broadcast [`GiftType::Response`] gift whose content is
    /// `{"responding_to": <id>, "response": <content>}`. The original is not
    /// required to still be present.
    pub fn leave_response(
        &self,
        responder: &str,
        original_gift_id: &str,
        response_content: GiftContent,
    ) -> Result<String> {
        let content = GiftContent::map([
            ("responding_to", GiftContent::from(original_gift_id)),
            ("response", response_content),
        ]);
        self.leave_gift(
            responder,
            content,
            GiftOptions::default().with_type(GiftType::Response),
        )
    }

    /// Reclaim slots held by expired ephemeral gifts.
    pub fn compact(&self) -> Result<CompactionOutcome> {
        let mut guard = self.file.write();
        let file = guard.as_mut().ok_or(CommonsError::Closed)?;
        let _writers = file.lock_writers()?;
        compaction::compact(
            file,
            self.config.ephemeral_ttl,
            self.config.stale_lock_after,
            now_secs(),
        )
    }

    /// Current occupancy and header values.
    pub fn stats(&self) -> Result<CommonsStats> {
        let guard = self.file.read();
        let file = guard.as_ref().ok_or(CommonsError::Closed)?;

        let header = file.read_header()?;
        let gift_count = file.gift_count();
        let mut ephemeral_count = 0;
        for index in 0..gift_count {
            if codec::deserialize(file.read_slot(index)?).is_some_and(|g| g.ephemeral) {
                ephemeral_count += 1;
            }
        }

        Ok(CommonsStats {
            gift_count,
            max_slots: file.max_slots(),
            free_slots: file.max_slots() - gift_count,
            ephemeral_count,
            created_at: header.created_at,
            last_modified: header.last_modified,
            blessing: header.blessing(),
            version: header.version,
        })
    }

    /// Flush the mapping to disk.
    pub fn flush(&self) -> Result<()> {
        let guard = self.file.read();
        guard.as_ref().ok_or(CommonsError::Closed)?.flush()
    }

    /// Release the mapping. Calling this more than once is harmless.
    pub fn close(&self) {
        let Some(file) = self.file.write().take() else {
            return;
        };
        if let Err(e) = file.flush() {
            warn!("failed to flush commons {} on close: {e}", self.path.display());
        }
        info!("closed commons {}", self.path.display());
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.file.read().is_none()
    }

    /// Path to the commons file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Configuration the handle was opened with.
    pub const fn config(&self) -> &CommonsConfig {
        &self.config
    }
}
