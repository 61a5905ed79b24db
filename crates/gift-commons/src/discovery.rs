//! Filtered scans over the occupied slots.

use crate::codec;
use crate::gift::{Gift, GiftType};
use crate::store::CommonsFile;
use crate::Result;

/// Default number of gifts returned by a discovery.
pub const DEFAULT_DISCOVERY_LIMIT: usize = 10;

/// Filters for [`discover`].
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryQuery {
    /// Only gifts of this type.
    pub gift_type: Option<GiftType>,
    /// Only gifts strictly newer than this timestamp.
    pub since: Option<f64>,
    /// Maximum number of gifts returned.
    pub limit: usize,
}

impl Default for DiscoveryQuery {
    fn default() -> Self {
        Self {
            gift_type: None,
            since: None,
            limit: DEFAULT_DISCOVERY_LIMIT,
        }
    }
}

impl DiscoveryQuery {
    /// Restrict to one gift type
    #[must_use]
    pub fn of_type(mut self, gift_type: impl Into<GiftType>) -> Self {
        self.gift_type = Some(gift_type.into());
        self
    }

    /// Restrict to gifts newer than `timestamp`
    #[must_use]
    pub const fn since(mut self, timestamp: f64) -> Self {
        self.since = Some(timestamp);
        self
    }

    /// Cap the number of results
    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Whether `gift` passes the type, time and visibility filters for `seeker`.
    pub fn matches(&self, gift: &Gift, seeker: &str) -> bool {
        if let Some(gift_type) = &self.gift_type
            && gift.gift_type != *gift_type
        {
            return false;
        }
        if let Some(since) = self.since
            && gift.timestamp <= since
        {
            return false;
        }
        gift.is_visible_to(seeker)
    }
}

/// Find gifts visible to `seeker`, newest first.
///
/// Slots are scanned from the most recently written down, so a limit keeps
/// the newest matches. Undecodable slots are skipped.
pub fn discover(file: &CommonsFile, seeker: &str, query: &DiscoveryQuery) -> Result<Vec<Gift>> {
    if query.limit == 0 {
        return Ok(Vec::new());
    }

    let count = file.gift_count();
    let mut found = Vec::with_capacity(query.limit.min(count));

    for index in (0..count).rev() {
        let Some(gift) = codec::deserialize(file.read_slot(index)?) else {
            continue;
        };
        if query.matches(&gift, seeker) {
            found.push(gift);
            if found.len() >= query.limit {
                break;
            }
        }
    }

    found.sort_by(|a, b| b.timestamp.total_cmp(&a.timestamp));
    Ok(found)
}

/// Look up one gift by id, subject to the same visibility rule.
pub fn find(file: &CommonsFile, seeker: &str, id: &str) -> Result<Option<Gift>> {
    for index in 0..file.gift_count() {
        if let Some(gift) = codec::deserialize(file.read_slot(index)?)
            && gift.id == id
        {
            return Ok(gift.is_visible_to(seeker).then_some(gift));
        }
    }
    Ok(None)
}
