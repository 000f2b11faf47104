//! Proptest generators for property-based testing.

use proptest::prelude::*;

use consent_kernel::{Access, ConsentOption};

/// A valid principal or asset id.
pub fn id() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9]{0,11}".prop_map(String::from)
}

/// One consent option.
pub fn consent_option() -> impl Strategy<Value = ConsentOption> {
    prop_oneof![
        Just(ConsentOption::Read),
        Just(ConsentOption::Write),
        Just(ConsentOption::Deny),
    ]
}

/// A non-empty option set, possibly with repeats.
pub fn consent_options() -> impl Strategy<Value = Vec<ConsentOption>> {
    prop::collection::vec(consent_option(), 1..=4)
}

pub fn access() -> impl Strategy<Value = Access> {
    prop_oneof![Just(Access::Read), Just(Access::Write)]
}

/// Offsets from substrate time, inside and outside a skew window.
pub fn clock_offset(window: i64) -> impl Strategy<Value = i64> {
    -(3 * window)..=(3 * window)
}

/// A chain of datatype ids, root first, all distinct.
pub fn datatype_chain(max_depth: usize) -> impl Strategy<Value = Vec<String>> {
    (1..=max_depth).prop_map(|depth| (0..depth).map(|i| format!("dt{i}")).collect())
}

/// Distinct upload timestamps.
pub fn upload_timestamps(max: usize) -> impl Strategy<Value = Vec<i64>> {
    prop::collection::btree_set(1i64..1_000_000, 1..=max).prop_map(|set| set.into_iter().collect())
}
