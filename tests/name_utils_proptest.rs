//! Property-based testing of the pure name, key, and backoff utilities.

use std::time::Duration;

use proptest::prelude::*;

use swarmdns::resolve::backoff::{exponential_backoff, truncated_exponential_backoff};
use swarmdns::resolve::names::{
    self, MAX_LABEL_LEN, MIN_LABEL_LEN,
};
use swarmdns::resolve::xchg::XchgKey;

// Strategy for generating registrable domains like "foo.example.com"
fn domain_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[a-z][a-z0-9]{0,14}", 2..6)
}

proptest! {
    #[test]
    fn test_walks_are_reverses(labels in domain_strategy()) {
        let fqdn = labels.join(".");
        let registered = labels[labels.len() - 2..].join(".");

        let mut down = Vec::new();
        names::fqdn_to_registered(&fqdn, &registered, |sub| {
            down.push(sub.to_string());
            false
        });

        let mut up = Vec::new();
        names::registered_to_fqdn(&registered, &fqdn, |sub| {
            up.push(sub.to_string());
            false
        });

        // one label removed per step, full name first, registered last
        prop_assert_eq!(labels.len() - 1, down.len());
        prop_assert_eq!(&fqdn, &down[0]);
        prop_assert_eq!(&registered, &down[down.len() - 1]);
        for pair in down.windows(2) {
            prop_assert_eq!(
                pair[1].as_str(),
                pair[0].split_once('.').unwrap().1
            );
        }

        let reversed: Vec<String> = down.iter().rev().cloned().collect();
        prop_assert_eq!(reversed, up);
    }

    #[test]
    fn test_xchg_key_case_and_dot_insensitive(
        labels in domain_strategy(),
        id in any::<u16>()
    ) {
        let name = labels.join(".");
        let upper = format!("{}.", name.to_ascii_uppercase());
        prop_assert_eq!(XchgKey::new(id, &upper), XchgKey::new(id, &name));
    }

    #[test]
    fn test_unlikely_name_invariants(labels in domain_strategy()) {
        let sub = labels.join(".");
        if let Some(name) = names::unlikely_name(&sub) {
            let label = name.split('.').next().unwrap();
            prop_assert!(label.len() >= MIN_LABEL_LEN && label.len() <= MAX_LABEL_LEN);
            prop_assert!(!label.starts_with('-') && !label.ends_with('-'));
            prop_assert!(label
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-'));
            prop_assert_eq!(name.split_once('.').unwrap().1, sub.as_str());
        }
    }

    #[test]
    fn test_backoff_within_bounds(events in 0u32..8, delay_ms in 1u64..100) {
        let delay = Duration::from_millis(delay_ms);
        let base = delay * (1 << events);

        let d = exponential_backoff(events, delay);
        prop_assert!(d >= base && d < base + delay);

        let max = Duration::from_millis(200);
        prop_assert!(truncated_exponential_backoff(events, delay, max) <= max);
    }
}
