//! Gift data model.
//!
//! A [`Gift`] is immutable once committed to the commons. Replies are
//! new gifts of type [`GiftType::Response`] that reference the original
//! by id.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Per-process counter mixed into gift ids.
static GIFT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Number of digest bytes kept in a gift id (16 hex characters).
const GIFT_ID_BYTES: usize = 8;

/// Kind of gift.
///
/// The five well-known kinds are named variants; any other label is kept
/// verbatim in [`GiftType::Other`]. Equality and hashing go by label, so
/// `Other("insight")` is the same type as `Insight`, matching what a
/// stored gift decodes to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum GiftType {
    /// An observation worth sharing (default).
    #[default]
    Insight,
    /// A recurring structure someone noticed.
    Pattern,
    /// A good wish.
    Blessing,
    /// An open question for others.
    Question,
    /// A reply to another gift.
    Response,
    /// Any other label.
    Other(String),
}

impl GiftType {
    /// Lowercase label as stored on disk.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Insight => "insight",
            Self::Pattern => "pattern",
            Self::Blessing => "blessing",
            Self::Question => "question",
            Self::Response => "response",
            Self::Other(label) => label,
        }
    }
}

impl PartialEq for GiftType {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for GiftType {}

impl Hash for GiftType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_str().hash(state);
    }
}

impl From<String> for GiftType {
    fn from(label: String) -> Self {
        match label.as_str() {
            "insight" => Self::Insight,
            "pattern" => Self::Pattern,
            "blessing" => Self::Blessing,
            "question" => Self::Question,
            "response" => Self::Response,
            _ => Self::Other(label),
        }
    }
}

impl From<&str> for GiftType {
    fn from(label: &str) -> Self {
        Self::from(label.to_string())
    }
}

impl From<GiftType> for String {
    fn from(gift_type: GiftType) -> Self {
        match gift_type {
            GiftType::Other(label) => label,
            known => known.as_str().to_string(),
        }
    }
}

impl FromStr for GiftType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}

impl fmt::Display for GiftType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured gift payload.
///
/// Serialized untagged, so the JSON form of a `GiftContent` is the plain
/// JSON value. Bounds (depth, size, finite floats) are enforced by
/// [`crate::codec::validate`] before anything is written.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GiftContent {
    /// No value.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Integer(i64),
    /// Finite floating point number.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Ordered sequence.
    List(Vec<GiftContent>),
    /// String-keyed mapping, ordered by key.
    Map(BTreeMap<String, GiftContent>),
}

impl GiftContent {
    /// Build a map value from key/value pairs.
    pub fn map<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<Self>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Look up a key in a map value.
    pub fn get(&self, key: &str) -> Option<&Self> {
        match self {
            Self::Map(map) => map.get(key),
            _ => None,
        }
    }

    /// Borrow the text of a text value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl From<&str> for GiftContent {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for GiftContent {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<bool> for GiftContent {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for GiftContent {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for GiftContent {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for GiftContent {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl<T: Into<Self>> From<Vec<T>> for GiftContent {
    fn from(items: Vec<T>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

impl From<BTreeMap<String, Self>> for GiftContent {
    fn from(map: BTreeMap<String, Self>) -> Self {
        Self::Map(map)
    }
}

/// Options for leaving a gift.
///
/// Defaults to a non-ephemeral [`GiftType::Insight`] broadcast to everyone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GiftOptions {
    /// Kind of gift.
    pub gift_type: GiftType,
    /// Addressed recipients; empty means everyone.
    pub recipients: Vec<String>,
    /// Whether compaction may remove the gift once its TTL has passed.
    pub ephemeral: bool,
}

impl GiftOptions {
    /// Set the gift type
    #[must_use]
    pub fn with_type(mut self, gift_type: impl Into<GiftType>) -> Self {
        self.gift_type = gift_type.into();
        self
    }

    /// Address the gift to specific recipients
    #[must_use]
    pub fn with_recipients<I, S>(mut self, recipients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.recipients = recipients.into_iter().map(Into::into).collect();
        self
    }

    /// Mark the gift as ephemeral
    #[must_use]
    pub const fn ephemeral(mut self, ephemeral: bool) -> Self {
        self.ephemeral = ephemeral;
        self
    }
}

/// One message in the commons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gift {
    /// Unique id (16 hex characters).
    pub id: String,
    /// Identity that left the gift.
    pub giver: String,
    /// Payload.
    pub content: GiftContent,
    /// Kind of gift.
    pub gift_type: GiftType,
    /// Creation time, seconds since the Unix epoch.
    pub timestamp: f64,
    /// Addressed recipients; empty means everyone.
    pub recipients: Vec<String>,
    /// Whether compaction may remove the gift once expired.
    pub ephemeral: bool,
}

impl Gift {
    /// Create a gift stamped with `timestamp` and a fresh id.
    pub fn new(
        giver: impl Into<String>,
        content: GiftContent,
        options: GiftOptions,
        timestamp: f64,
    ) -> Self {
        let giver = giver.into();
        Self {
            id: derive_gift_id(&giver, timestamp),
            giver,
            content,
            gift_type: options.gift_type,
            timestamp,
            recipients: options.recipients,
            ephemeral: options.ephemeral,
        }
    }

    /// Whether `seeker` may see this gift.
    ///
    /// Broadcast gifts are visible to everyone; addressed gifts only to
    /// their recipients and the giver.
    pub fn is_visible_to(&self, seeker: &str) -> bool {
        self.recipients.is_empty()
            || self.giver == seeker
            || self.recipients.iter().any(|r| r == seeker)
    }

    /// Whether compaction must keep this gift at time `now`.
    pub fn survives(&self, now: f64, ttl: Duration) -> bool {
        !self.ephemeral || (now - self.timestamp) < ttl.as_secs_f64()
    }
}

/// Derive a gift id from the giver and timestamp.
///
/// The process id and a per-process sequence number are mixed in so two
/// gifts from the same giver in the same instant still get distinct ids.
pub fn derive_gift_id(giver: &str, timestamp: f64) -> String {
    let sequence = GIFT_SEQUENCE.fetch_add(1, Ordering::Relaxed);

    let mut input = Vec::with_capacity(giver.len() + 20);
    input.extend_from_slice(giver.as_bytes());
    input.extend_from_slice(&timestamp.to_bits().to_le_bytes());
    input.extend_from_slice(&std::process::id().to_le_bytes());
    input.extend_from_slice(&sequence.to_le_bytes());

    let digest = md5::compute(&input);
    hex::encode(&digest.0[..GIFT_ID_BYTES])
}
