//! Reclaiming slots held by expired ephemeral gifts.
//!
//! Compaction walks the occupied prefix, keeps every gift that is not
//! ephemeral or has not yet outlived its TTL, moves the keepers down to a
//! contiguous prefix starting at slot 0 (preserving order) and zeroes the
//! freed tail.
//!
//! Cross-process exclusion uses a sentinel file next to the commons,
//! created with create-exclusive semantics. A process that finds the
//! sentinel already present skips compaction instead of waiting; another
//! process is already doing the work. The sentinel only guards
//! compaction, it is not a reader/writer lock.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::codec;
use crate::store::{CommonsFile, SLOT_PREFIX_SIZE};
use crate::{COMPACTION_LOCK_SUFFIX, Result};

/// Result of a compaction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionOutcome {
    /// Another process holds the sentinel; nothing was done.
    Skipped,
    /// Compaction ran.
    Completed {
        /// Gifts still present.
        kept: usize,
        /// Slots reclaimed.
        removed: usize,
    },
}

impl CompactionOutcome {
    /// Number of slots reclaimed (zero when skipped).
    pub const fn removed(&self) -> usize {
        match self {
            Self::Skipped => 0,
            Self::Completed { removed, .. } => *removed,
        }
    }
}

/// Sentinel lock file guarding compaction, removed on drop.
#[derive(Debug)]
pub struct SentinelLock {
    path: PathBuf,
}

impl SentinelLock {
    /// Sentinel path for a commons file (`<file>.compact.lock`).
    pub fn path_for(commons_path: &Path) -> PathBuf {
        let mut name = commons_path.as_os_str().to_os_string();
        name.push(COMPACTION_LOCK_SUFFIX);
        PathBuf::from(name)
    }

    /// Try to create the sentinel without waiting.
    ///
    /// Returns `Ok(None)` if another process holds it. A sentinel older
    /// than `stale_after` is assumed to be left over from a crashed
    /// process; it is removed and creation retried once.
    pub fn try_acquire(commons_path: &Path, stale_after: Duration) -> Result<Option<Self>> {
        let path = Self::path_for(commons_path);

        if let Some(lock) = Self::create(&path)? {
            return Ok(Some(lock));
        }

        if !is_stale(&path, stale_after) {
            return Ok(None);
        }

        warn!(
            "removing stale compaction lock {} (older than {}s)",
            path.display(),
            stale_after.as_secs()
        );
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!("failed to remove stale lock {}: {e}", path.display());
                return Ok(None);
            }
        }

        Self::create(&path)
    }

    fn create(path: &Path) -> Result<Option<Self>> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                // Holder's pid, for whoever finds a leftover sentinel
                if let Err(e) = writeln!(file, "{}", std::process::id()) {
                    debug!("failed to record pid in {}: {e}", path.display());
                }
                Ok(Some(Self {
                    path: path.to_path_buf(),
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for SentinelLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(
                "failed to remove compaction lock {}: {e}",
                self.path.display()
            );
        }
    }
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age > stale_after)
}

/// Compact `file` as of time `now`.
///
/// The caller must hold the in-process write lock on `file`. Undecodable
/// slots are dropped along with expired gifts since no scan can return
/// them.
pub fn compact(
    file: &mut CommonsFile,
    ttl: Duration,
    stale_after: Duration,
    now: f64,
) -> Result<CompactionOutcome> {
    let Some(_sentinel) = SentinelLock::try_acquire(file.path(), stale_after)? else {
        debug!(
            "compaction of {} already in progress elsewhere, skipping",
            file.path().display()
        );
        return Ok(CompactionOutcome::Skipped);
    };

    let count = file.gift_count();

    // (original index, prefix + payload) of every gift that stays
    let mut kept: Vec<(usize, Vec<u8>)> = Vec::with_capacity(count);
    for index in 0..count {
        let slot = file.read_slot(index)?;
        match codec::deserialize(slot) {
            Some(gift) if gift.survives(now, ttl) => {
                let used = slot_used_len(slot);
                kept.push((index, slot[..used].to_vec()));
            }
            Some(gift) => debug!("evicting expired gift {} from slot {index}", gift.id),
            None => debug!("dropping undecodable slot {index}"),
        }
    }

    for (new_index, (old_index, bytes)) in kept.iter().enumerate() {
        if new_index != *old_index {
            file.write_slot(new_index, bytes)?;
        }
    }
    for index in kept.len()..count {
        file.clear_slot(index)?;
    }

    file.set_gift_count(kept.len())?;
    file.touch(now);
    file.sync_if_configured()?;

    let removed = count - kept.len();
    info!(
        "compacted {}: kept {} gifts, reclaimed {removed} slots",
        file.path().display(),
        kept.len()
    );

    Ok(CompactionOutcome::Completed {
        kept: kept.len(),
        removed,
    })
}

/// Bytes of a decodable slot actually in use (prefix plus payload).
fn slot_used_len(slot: &[u8]) -> usize {
    let mut prefix = [0u8; SLOT_PREFIX_SIZE];
    prefix.copy_from_slice(&slot[..SLOT_PREFIX_SIZE]);
    (SLOT_PREFIX_SIZE + u32::from_ne_bytes(prefix) as usize).min(slot.len())
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::CommonsConfig;
    use crate::gift::{Gift, GiftContent, GiftOptions};
    use pretty_assertions::assert_eq;

    const TTL: Duration = Duration::from_secs(10);
    const STALE: Duration = Duration::from_secs(60);

    fn open(dir: &tempfile::TempDir) -> CommonsFile {
        let config = CommonsConfig::default().with_max_slots(6).with_slot_size(512);
        CommonsFile::open_or_create(dir.path().join("gifts.commons"), &config).expect("open")
    }

    fn push(file: &mut CommonsFile, giver: &str, ephemeral: bool, timestamp: f64) -> Gift {
        let gift = Gift::new(
            giver,
            GiftContent::from(giver),
            GiftOptions::default().ephemeral(ephemeral),
            timestamp,
        );
        let index = file.gift_count();
        let bytes = codec::serialize(&gift, file.slot_size()).expect("serialize");
        file.write_slot(index, &bytes).expect("write");
        file.set_gift_count(index + 1).expect("count");
        gift
    }

    fn gifts(file: &CommonsFile) -> Vec<Gift> {
        (0..file.gift_count())
            .filter_map(|i| codec::deserialize(file.read_slot(i).expect("slot")))
            .collect()
    }

    #[test]
    fn test_keeps_lasting_and_fresh_gifts_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut file = open(&dir);

        let a = push(&mut file, "a", false, 0.0);
        let _b = push(&mut file, "b", true, 0.0);
        let c = push(&mut file, "c", true, 95.0);
        let _d = push(&mut file, "d", true, 50.0);
        let e = push(&mut file, "e", false, 10.0);

        let outcome = compact(&mut file, TTL, STALE, 100.0).expect("compact");
        assert_eq!(
            outcome,
            CompactionOutcome::Completed {
                kept: 3,
                removed: 2
            }
        );
        assert_eq!(file.gift_count(), 3);
        assert_eq!(gifts(&file), vec![a, c, e]);

        // Freed tail is zeroed
        for index in 3..5 {
            assert!(file.read_slot(index).expect("slot").iter().all(|&b| b == 0));
        }

        let header = file.read_header().expect("header");
        assert!((header.last_modified - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_nothing_to_reclaim() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut file = open(&dir);
        push(&mut file, "a", false, 0.0);

        let outcome = compact(&mut file, TTL, STALE, 1_000.0).expect("compact");
        assert_eq!(
            outcome,
            CompactionOutcome::Completed {
                kept: 1,
                removed: 0
            }
        );
        assert_eq!(outcome.removed(), 0);
    }

    #[test]
    fn test_skips_when_sentinel_held() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut file = open(&dir);
        push(&mut file, "a", true, 0.0);

        let held = SentinelLock::try_acquire(file.path(), STALE)
            .expect("acquire")
            .expect("free");

        let outcome = compact(&mut file, TTL, STALE, 1_000.0).expect("compact");
        assert_eq!(outcome, CompactionOutcome::Skipped);
        assert_eq!(file.gift_count(), 1);

        drop(held);
        let outcome = compact(&mut file, TTL, STALE, 1_000.0).expect("compact");
        assert_eq!(outcome.removed(), 1);
    }

    #[test]
    fn test_sentinel_removed_after_compaction() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut file = open(&dir);
        compact(&mut file, TTL, STALE, 1.0).expect("compact");
        assert!(!SentinelLock::path_for(file.path()).exists());
    }

    #[test]
    fn test_sentinel_removed_when_compaction_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut file = open(&dir);
        push(&mut file, "a", true, 0.0);
        let sentinel = SentinelLock::path_for(file.path());

        // Same acquire-then-propagate shape as `compact`
        let failing = |file: &mut CommonsFile| -> Result<CompactionOutcome> {
            let Some(_sentinel) = SentinelLock::try_acquire(file.path(), STALE)? else {
                return Ok(CompactionOutcome::Skipped);
            };
            assert!(SentinelLock::path_for(file.path()).exists());
            file.write_slot(file.max_slots(), &[])?;
            Ok(CompactionOutcome::Completed { kept: 0, removed: 0 })
        };

        assert!(matches!(
            failing(&mut file),
            Err(crate::CommonsError::SlotOutOfRange { .. })
        ));
        assert!(!sentinel.exists());

        // A later compaction is not blocked by a leftover sentinel
        let outcome = compact(&mut file, TTL, STALE, 1_000.0).expect("compact");
        assert_eq!(outcome.removed(), 1);
        assert!(!sentinel.exists());
    }

    #[test]
    fn test_stale_sentinel_reclaimed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut file = open(&dir);
        push(&mut file, "a", true, 0.0);

        let sentinel = SentinelLock::path_for(file.path());
        std::fs::write(&sentinel, b"12345\n").expect("write");
        std::thread::sleep(Duration::from_millis(20));

        let outcome = compact(&mut file, TTL, Duration::from_millis(1), 1_000.0).expect("compact");
        assert_eq!(outcome.removed(), 1);
        assert!(!sentinel.exists());
    }

    #[test]
    fn test_undecodable_slots_dropped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut file = open(&dir);
        let a = push(&mut file, "a", false, 0.0);

        let mut garbage = 8u32.to_ne_bytes().to_vec();
        garbage.extend_from_slice(b"not json");
        file.write_slot(1, &garbage).expect("write");
        file.set_gift_count(2).expect("count");

        let outcome = compact(&mut file, TTL, STALE, 1.0).expect("compact");
        assert_eq!(outcome.removed(), 1);
        assert_eq!(gifts(&file), vec![a]);
    }

    #[test]
    fn test_sentinel_path() {
        let path = SentinelLock::path_for(Path::new("/tmp/commons/gifts.commons"));
        assert_eq!(path, Path::new("/tmp/commons/gifts.commons.compact.lock"));
    }
}
