//! Memory-mapped shared store ("commons") for exchanging small typed
//! messages ("gifts") between independent local processes.
//!
//! The commons is a single file with a fixed-size header followed by a
//! fixed number of fixed-size slots. Every attached process maps the same
//! file read/write; there is no server process.
//!
//! - **Header**: magic, version, committed gift count, timestamps and a
//!   short blessing string.
//! - **Slots**: a `u32` length prefix followed by a JSON-encoded [`Gift`],
//!   zero padded. Only the prefix `[0, gift_count)` is occupied.
//! - **Compaction**: expired ephemeral gifts are reclaimed under a
//!   create-exclusive sentinel lock file, survivors are moved down to a
//!   contiguous prefix.
//!
//! # Example
//!
//! ```rust,no_run
//! use gift_commons::{Commons, DiscoveryQuery, GiftContent, GiftOptions};
//!
//! # fn example() -> gift_commons::Result<()> {
//! let commons = Commons::open("/tmp/commons/gifts.commons")?;
//!
//! let id = commons.leave_gift(
//!     "alice",
//!     GiftContent::from("the tide turns at dusk"),
//!     GiftOptions::default(),
//! )?;
//!
//! for gift in commons.discover_gifts("bob", &DiscoveryQuery::default())? {
//!     println!("{} left {}", gift.giver, gift.id);
//! }
//! # let _ = id;
//! commons.close();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![allow(clippy::must_use_candidate)]

use thiserror::Error;

// Gift data model
pub mod gift;

// Fixed header layout
pub mod header;

// Mapped file and slot I/O
pub mod store;

// Gift encoding and content safety checks
pub mod codec;

// Expired gift reclamation
pub mod compaction;

// Filtered scans
pub mod discovery;

// Public handle
pub mod commons;

// Configuration
pub mod config;

pub use commons::{Commons, CommonsStats};
pub use compaction::CompactionOutcome;
pub use config::CommonsConfig;
pub use discovery::DiscoveryQuery;
pub use gift::{Gift, GiftContent, GiftOptions, GiftType};
pub use header::CommonsHeader;

/// Result type for commons operations.
pub type Result<T> = std::result::Result<T, CommonsError>;

/// Errors that can occur while operating on a commons file.
#[derive(Debug, Error)]
pub enum CommonsError {
    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not a commons file or is truncated. Not recoverable.
    #[error("Corrupt commons store: {0}")]
    CorruptStore(String),

    /// The header carries a format version this build does not understand.
    #[error("Unsupported commons version: {0}")]
    UnsupportedVersion(u32),

    /// Gift content is unbounded or looks like embedded code.
    #[error("Unsafe gift content: {0}")]
    UnsafeContent(String),

    /// Encoded gift does not fit in a slot.
    #[error("Gift too large: {size} bytes exceeds slot capacity of {capacity} bytes")]
    GiftTooLarge {
        /// Encoded size including the length prefix.
        size: usize,
        /// Slot size in bytes.
        capacity: usize,
    },

    /// No free slot even after a compaction attempt.
    #[error("Commons is full: all {max_slots} slots hold live gifts")]
    StoreFull {
        /// Slot capacity of the store.
        max_slots: usize,
    },

    /// Slot index outside the mapped region.
    #[error("Slot {index} out of range (max {max_slots})")]
    SlotOutOfRange {
        /// Requested slot index.
        index: usize,
        /// Slot capacity of the store.
        max_slots: usize,
    },

    /// The handle has been closed.
    #[error("Commons handle is closed")]
    Closed,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Gift encoding failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CommonsError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<binrw::Error> for CommonsError {
    fn from(e: binrw::Error) -> Self {
        Self::CorruptStore(format!("header decode failed: {e}"))
    }
}

/// Version information for the commons crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Suffix appended to the commons file name to form the compaction sentinel.
pub const COMPACTION_LOCK_SUFFIX: &str = ".compact.lock";

/// Current time as fractional seconds since the Unix epoch.
pub(crate) fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
