//! Fixed header at the start of a commons file.
//!
//! All values use native byte order; a commons file is shared between
//! processes on one machine, never moved between architectures.
//!
//! Layout (0x120 bytes, the rest of the header region is reserved/zero):
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0x000  | 4    | Magic (`0x4749_4654`) |
//! | 0x004  | 4    | Version (1) |
//! | 0x008  | 4    | Committed gift count |
//! | 0x00C  | 4    | Alignment padding (zero) |
//! | 0x010  | 8    | Created at (f64 epoch seconds) |
//! | 0x018  | 8    | Last modified (f64 epoch seconds) |
//! | 0x020  | 256  | Blessing (UTF-8, null padded) |

use crate::{CommonsError, Result};
use binrw::{BinRead, BinWrite};
use std::io::Cursor;

/// Magic number identifying a commons file ("GIFT").
pub const COMMONS_MAGIC: u32 = 0x4749_4654;

/// Current commons format version.
pub const COMMONS_VERSION: u32 = 1;

/// Size of the blessing field in bytes.
pub const BLESSING_SIZE: usize = 256;

/// Bytes occupied by the header fields.
pub const HEADER_LAYOUT_SIZE: usize = 0x120;

/// Offset of the gift count field.
pub const GIFT_COUNT_OFFSET: usize = 0x08;

/// Offset of the last modified field.
pub const LAST_MODIFIED_OFFSET: usize = 0x18;

/// Commons file header.
#[derive(Debug, Clone, PartialEq, BinRead, BinWrite)]
pub struct CommonsHeader {
    /// Magic number (must be `COMMONS_MAGIC`)
    pub magic: u32,
    /// Format version
    pub version: u32,
    /// Number of committed gifts (occupied slot prefix)
    pub gift_count: u32,
    /// Creation time, epoch seconds
    #[brw(pad_before = 4)]
    pub created_at: f64,
    /// Time of the last committed change, epoch seconds
    pub last_modified: f64,
    /// Null-padded UTF-8 blessing
    pub blessing: [u8; BLESSING_SIZE],
}

impl CommonsHeader {
    /// Create a header for an empty commons.
    ///
    /// A blessing longer than the field is cut at the last character
    /// boundary that fits.
    pub fn new(blessing: &str, now: f64) -> Self {
        let mut field = [0u8; BLESSING_SIZE];
        let mut end = blessing.len().min(BLESSING_SIZE);
        while !blessing.is_char_boundary(end) {
            end -= 1;
        }
        field[..end].copy_from_slice(&blessing.as_bytes()[..end]);

        Self {
            magic: COMMONS_MAGIC,
            version: COMMONS_VERSION,
            gift_count: 0,
            created_at: now,
            last_modified: now,
            blessing: field,
        }
    }

    /// Parse a header from the start of `data`.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LAYOUT_SIZE {
            return Err(CommonsError::CorruptStore(format!(
                "header truncated: expected {HEADER_LAYOUT_SIZE} bytes, got {}",
                data.len()
            )));
        }

        let mut cursor = Cursor::new(&data[..HEADER_LAYOUT_SIZE]);
        Ok(Self::read_ne(&mut cursor)?)
    }

    /// Serialize the header fields.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::with_capacity(HEADER_LAYOUT_SIZE));
        self.write_ne(&mut cursor)
            .map_err(|e| CommonsError::Serialization(format!("header encode failed: {e}")))?;
        let buf = cursor.into_inner();
        debug_assert_eq!(buf.len(), HEADER_LAYOUT_SIZE);
        Ok(buf)
    }

    /// Check magic and version.
    pub fn validate(&self) -> Result<()> {
        if self.magic != COMMONS_MAGIC {
            return Err(CommonsError::CorruptStore(format!(
                "bad magic {:#010x}, expected {COMMONS_MAGIC:#010x}",
                self.magic
            )));
        }
        if self.version != COMMONS_VERSION {
            return Err(CommonsError::UnsupportedVersion(self.version));
        }
        Ok(())
    }

    /// Blessing text with the null padding removed.
    pub fn blessing(&self) -> String {
        let end = self
            .blessing
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(BLESSING_SIZE);
        String::from_utf8_lossy(&self.blessing[..end]).into_owned()
    }
}

/// Read the committed gift count straight from a mapped header.
pub fn read_gift_count(header: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&header[GIFT_COUNT_OFFSET..GIFT_COUNT_OFFSET + 4]);
    u32::from_ne_bytes(raw)
}

/// Write the committed gift count into a mapped header.
pub fn write_gift_count(header: &mut [u8], count: u32) {
    header[GIFT_COUNT_OFFSET..GIFT_COUNT_OFFSET + 4].copy_from_slice(&count.to_ne_bytes());
}

/// Write the last modified timestamp into a mapped header.
pub fn write_last_modified(header: &mut [u8], timestamp: f64) {
    header[LAST_MODIFIED_OFFSET..LAST_MODIFIED_OFFSET + 8]
        .copy_from_slice(&timestamp.to_ne_bytes());
}
