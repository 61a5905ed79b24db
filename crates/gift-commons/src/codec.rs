//! Gift encoding and content validation.
//!
//! A slot holds a native-endian `u32` length followed by the JSON form of
//! a [`Gift`]. Decoding never fails: anything that does not parse is
//! reported as an empty slot so a torn or corrupt slot never halts a scan.

use std::sync::LazyLock;

use regex::{RegexSet, RegexSetBuilder};
use tracing::{debug, error};

use crate::gift::{Gift, GiftContent};
use crate::store::SLOT_PREFIX_SIZE;
use crate::{CommonsError, Result};

/// Deepest nesting accepted in gift content.
pub const MAX_CONTENT_DEPTH: usize = 32;

/// Most values (scalars, lists, maps) accepted in one gift's content.
pub const MAX_CONTENT_NODES: usize = 4096;

/// Text patterns that look like code meant to be executed downstream.
const UNSAFE_PATTERNS: &[&str] = &[
    r"__import__",
    r"__(builtins|globals|subclasses|class)__",
    r"\beval\s*\(",
    r"\bexec\s*\(",
    r"\bcompile\s*\(",
    r"\bos\s*\.\s*(system|popen|exec\w*|spawn\w*)\b",
    r"\bsubprocess\b",
    r"<\s*script\b",
    r"\bjavascript\s*:",
    r"\$\(",
    r"\brm\s+-rf\b",
];

/// `None` if the patterns failed to build; every text is then rejected.
static UNSAFE_MATCHER: LazyLock<Option<RegexSet>> = LazyLock::new(|| {
    RegexSetBuilder::new(UNSAFE_PATTERNS)
        .case_insensitive(true)
        .build()
        .inspect_err(|e| error!("unsafe content patterns failed to build: {e}"))
        .ok()
});

/// Check that `content` is bounded and carries no embedded code.
///
/// # Errors
///
/// Returns `CommonsError::UnsafeContent` if:
/// - Nesting exceeds `MAX_CONTENT_DEPTH`
/// - The value tree exceeds `MAX_CONTENT_NODES`
/// - A float is NaN or infinite
/// - Any text value or map key matches an unsafe pattern
pub fn validate(content: &GiftContent) -> Result<()> {
    let mut nodes = 0usize;
    walk(content, 0, &mut nodes)
}

fn walk(value: &GiftContent, depth: usize, nodes: &mut usize) -> Result<()> {
    if depth > MAX_CONTENT_DEPTH {
        return Err(CommonsError::UnsafeContent(format!(
            "content nested deeper than {MAX_CONTENT_DEPTH} levels"
        )));
    }

    *nodes += 1;
    if *nodes > MAX_CONTENT_NODES {
        return Err(CommonsError::UnsafeContent(format!(
            "content holds more than {MAX_CONTENT_NODES} values"
        )));
    }

    match value {
        GiftContent::Null | GiftContent::Bool(_) | GiftContent::Integer(_) => Ok(()),
        GiftContent::Float(f) if !f.is_finite() => Err(CommonsError::UnsafeContent(format!(
            "non-finite number {f} cannot be stored"
        ))),
        GiftContent::Float(_) => Ok(()),
        GiftContent::Text(text) => check_text(text),
        GiftContent::List(items) => items
            .iter()
            .try_for_each(|item| walk(item, depth + 1, nodes)),
        GiftContent::Map(map) => map.iter().try_for_each(|(key, item)| {
            check_text(key)?;
            walk(item, depth + 1, nodes)
        }),
    }
}

fn check_text(text: &str) -> Result<()> {
    screen_text(UNSAFE_MATCHER.as_ref(), text)
}

fn screen_text(matcher: Option<&RegexSet>, text: &str) -> Result<()> {
    let Some(matcher) = matcher else {
        return Err(CommonsError::UnsafeContent(
            "content screening unavailable, refusing text".to_string(),
        ));
    };
    let matches = matcher.matches(text);
    if let Some(index) = matches.iter().next() {
        return Err(CommonsError::UnsafeContent(format!(
            "text matches unsafe pattern {:?}",
            UNSAFE_PATTERNS[index]
        )));
    }
    Ok(())
}

/// Encode `gift` as a length-prefixed slot payload.
///
/// # Errors
///
/// Returns `CommonsError::GiftTooLarge` if prefix and payload together
/// exceed `slot_size`.
pub fn serialize(gift: &Gift, slot_size: usize) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(gift)?;
    let size = SLOT_PREFIX_SIZE + json.len();
    if size > slot_size {
        return Err(CommonsError::GiftTooLarge {
            size,
            capacity: slot_size,
        });
    }

    let len = u32::try_from(json.len()).map_err(|_| CommonsError::GiftTooLarge {
        size,
        capacity: slot_size,
    })?;

    let mut buf = Vec::with_capacity(size);
    buf.extend_from_slice(&len.to_ne_bytes());
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Decode a slot.
///
/// Returns `None` for a free (zero length) slot, and for a slot whose
/// prefix or payload does not decode.
pub fn deserialize(slot: &[u8]) -> Option<Gift> {
    if slot.len() < SLOT_PREFIX_SIZE {
        return None;
    }

    let mut prefix = [0u8; SLOT_PREFIX_SIZE];
    prefix.copy_from_slice(&slot[..SLOT_PREFIX_SIZE]);
    let len = u32::from_ne_bytes(prefix) as usize;
    if len == 0 {
        return None;
    }

    let Some(payload) = slot.get(SLOT_PREFIX_SIZE..SLOT_PREFIX_SIZE + len) else {
        debug!(
            "slot length prefix {len} exceeds slot size {}, skipping",
            slot.len()
        );
        return None;
    };

    match serde_json::from_slice(payload) {
        Ok(gift) => Some(gift),
        Err(e) => {
            debug!("undecodable slot skipped: {e}");
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::gift::GiftOptions;
    use pretty_assertions::assert_eq;

    fn sample_gift() -> Gift {
        Gift::new(
            "alice",
            GiftContent::map([("x", GiftContent::from(1))]),
            GiftOptions::default().with_recipients(["bob"]),
            1_700_000_000.123_456,
        )
    }

    #[test]
    fn test_patterns_compile() {
        assert!(RegexSet::new(UNSAFE_PATTERNS).is_ok());
        let matcher = UNSAFE_MATCHER.as_ref().expect("patterns build");
        assert_eq!(matcher.len(), UNSAFE_PATTERNS.len());
    }

    #[test]
    fn test_missing_matcher_rejects_all_text() {
        assert!(matches!(
            screen_text(None, "a perfectly ordinary note"),
            Err(CommonsError::UnsafeContent(_))
        ));
        assert!(screen_text(UNSAFE_MATCHER.as_ref(), "a perfectly ordinary note").is_ok());
    }

    #[test]
    fn test_round_trip() {
        let gift = sample_gift();
        let bytes = serialize(&gift, 4096).expect("serialize");
        assert_eq!(deserialize(&bytes), Some(gift));
    }

    #[test]
    fn test_round_trip_with_slot_padding() {
        let gift = sample_gift();
        let mut slot = serialize(&gift, 4096).expect("serialize");
        slot.resize(4096, 0);
        assert_eq!(deserialize(&slot), Some(gift));
    }

    #[test]
    fn test_too_large_rejected() {
        let gift = Gift::new(
            "alice",
            GiftContent::from("x".repeat(5000)),
            GiftOptions::default(),
            1.0,
        );
        match serialize(&gift, 4096) {
            Err(CommonsError::GiftTooLarge { size, capacity }) => {
                assert!(size > 5000);
                assert_eq!(capacity, 4096);
            }
            other => panic!("expected GiftTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_and_corrupt_slots_decode_to_none() {
        assert_eq!(deserialize(&[0u8; 64]), None);
        assert_eq!(deserialize(&[1, 2]), None);

        // Prefix points past the end of the slot
        let mut slot = vec![0u8; 64];
        slot[..4].copy_from_slice(&1000u32.to_ne_bytes());
        assert_eq!(deserialize(&slot), None);

        // Prefix fine, payload garbage
        let mut slot = vec![0u8; 64];
        slot[..4].copy_from_slice(&5u32.to_ne_bytes());
        slot[4..9].copy_from_slice(b"{\"id\"");
        assert_eq!(deserialize(&slot), None);
    }

    #[test]
    fn test_torn_slot_decodes_to_none() {
        let bytes = serialize(&sample_gift(), 4096).expect("serialize");
        let mut torn = bytes.clone();
        let half = torn.len() / 2;
        torn[half..].fill(0);
        assert_eq!(deserialize(&torn), None);
    }

    #[test]
    fn test_validate_accepts_ordinary_content() {
        let content = GiftContent::map([
            ("note", GiftContent::from("the evaluation went well")),
            ("score", GiftContent::from(0.75)),
            ("tags", GiftContent::from(vec!["pattern", "river"])),
        ]);
        assert!(validate(&content).is_ok());
    }

    #[test]
    fn test_validate_rejects_code() {
        let payloads = [
            "__import__('os').system('rm -rf /')",
            "eval (input())",
            "exec('print(1)')",
            "os.system('ls')",
            "import subprocess",
            "<script>alert(1)</script>",
            "javascript:void(0)",
            "$(curl example.invalid)",
        ];
        for payload in payloads {
            let content = GiftContent::map([("cmd", GiftContent::from(payload))]);
            assert!(
                matches!(validate(&content), Err(CommonsError::UnsafeContent(_))),
                "accepted {payload:?}"
            );
        }
    }

    #[test]
    fn test_validate_checks_keys() {
        let content = GiftContent::map([("__import__", GiftContent::Null)]);
        assert!(validate(&content).is_err());
    }

    #[test]
    fn test_validate_rejects_non_finite() {
        assert!(validate(&GiftContent::Float(f64::NAN)).is_err());
        assert!(validate(&GiftContent::Float(f64::INFINITY)).is_err());
    }

    #[test]
    fn test_validate_rejects_deep_nesting() {
        let mut content = GiftContent::Null;
        for _ in 0..=MAX_CONTENT_DEPTH {
            content = GiftContent::List(vec![content]);
        }
        assert!(validate(&content).is_err());
    }

    #[test]
    fn test_validate_rejects_too_many_values() {
        let content = GiftContent::List(vec![GiftContent::Bool(true); MAX_CONTENT_NODES]);
        assert!(validate(&content).is_err());
    }
}
