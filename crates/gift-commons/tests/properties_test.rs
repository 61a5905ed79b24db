//! Property tests for gift encoding and visibility.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use gift_commons::codec::{deserialize, serialize};
use gift_commons::{Gift, GiftContent, GiftOptions, GiftType};
use proptest::prelude::*;
use std::collections::BTreeMap;

fn leaf() -> impl Strategy<Value = GiftContent> {
    prop_oneof![
        Just(GiftContent::Null),
        any::<bool>().prop_map(GiftContent::Bool),
        any::<i64>().prop_map(GiftContent::Integer),
        (-1.0e9..1.0e9f64).prop_map(GiftContent::Float),
        "[a-z ]{0,16}".prop_map(GiftContent::Text),
    ]
}

fn content() -> impl Strategy<Value = GiftContent> {
    leaf().prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(GiftContent::List),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                .prop_map(|m: BTreeMap<String, GiftContent>| GiftContent::Map(m)),
        ]
    })
}

fn gift_type() -> impl Strategy<Value = GiftType> {
    prop_oneof![
        Just(GiftType::Insight),
        Just(GiftType::Pattern),
        Just(GiftType::Blessing),
        Just(GiftType::Question),
        Just(GiftType::Response),
        "x[a-z]{1,8}".prop_map(GiftType::Other),
        prop::sample::select(vec!["insight", "pattern", "blessing", "question", "response"])
            .prop_map(|label| GiftType::Other(label.to_string())),
    ]
}

fn name() -> impl Strategy<Value = String> {
    "[a-e]{1,2}"
}

proptest! {
    /// A gift survives the slot encoding unchanged
    #[test]
    fn gift_round_trips(
        giver in name(),
        content in content(),
        gift_type in gift_type(),
        recipients in prop::collection::vec(name(), 0..4),
        ephemeral in any::<bool>(),
        timestamp in 0.0..4.0e9f64,
    ) {
        let options = GiftOptions::default()
            .with_type(gift_type)
            .with_recipients(recipients)
            .ephemeral(ephemeral);
        let gift = Gift::new(giver, content, options, timestamp);

        let bytes = serialize(&gift, 64 * 1024).map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert_eq!(deserialize(&bytes), Some(gift));
    }

    /// Addressed gifts are only visible to their recipients and giver
    #[test]
    fn visibility_follows_recipients(
        giver in name(),
        recipients in prop::collection::vec(name(), 0..4),
        seeker in name(),
    ) {
        let gift = Gift::new(
            giver.clone(),
            GiftContent::Null,
            GiftOptions::default().with_recipients(recipients.clone()),
            1.0,
        );

        let expected = recipients.is_empty() || seeker == giver || recipients.contains(&seeker);
        prop_assert_eq!(gift.is_visible_to(&seeker), expected);
    }
}
