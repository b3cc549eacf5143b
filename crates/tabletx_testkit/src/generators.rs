//! Property-based test generators using proptest.

use crate::fixtures::Note;
use proptest::prelude::*;
use std::time::Duration;
use tabletx_core::{ConditionalRetryMode, IsolationLevel, RetryPolicy, TxOptions};

/// Strategy for note bodies.
pub fn note_text_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z ]{0,32}").expect("Invalid regex")
}

/// Strategy for notes with distinct ids, ordered by id.
pub fn notes_strategy(max: usize) -> impl Strategy<Value = Vec<Note>> {
    prop::collection::btree_map(0u64..10_000, note_text_strategy(), 0..=max)
        .prop_map(|notes| notes.into_iter().map(|(id, text)| Note { id, text }).collect())
}

/// Strategy for any isolation level.
pub fn isolation_level_strategy() -> impl Strategy<Value = IsolationLevel> {
    prop_oneof![
        Just(IsolationLevel::SerializableReadWrite),
        Just(IsolationLevel::OnlineConsistentReadOnly),
        Just(IsolationLevel::OnlineInconsistentReadOnly),
        Just(IsolationLevel::StaleConsistentReadOnly),
        Just(IsolationLevel::Snapshot),
    ]
}

/// Strategy for read-only isolation levels.
pub fn read_only_isolation_strategy() -> impl Strategy<Value = IsolationLevel> {
    isolation_level_strategy().prop_filter("read-only level", |l| l.is_read_only())
}

/// Strategy for valid retry policies.
pub fn retry_policy_strategy() -> impl Strategy<Value = RetryPolicy> {
    prop_oneof![
        (0u64..5_000, 0u64..200_000, 0.0f64..=1.0, 1.0f64..4.0).prop_map(
            |(initial, max, jitter, multiplier)| {
                RetryPolicy::exponential(
                    Duration::from_millis(initial),
                    Duration::from_millis(max),
                    jitter,
                    multiplier,
                )
                .expect("valid exponential parameters")
            }
        ),
        (0u64..10_000, 0.0f64..=1.0).prop_map(|(delay, jitter)| {
            RetryPolicy::fixed(Duration::from_millis(delay), jitter)
                .expect("valid fixed parameters")
        }),
        Just(RetryPolicy::retry_immediately()),
    ]
}

/// Strategy for conditional retry modes.
pub fn conditional_retry_mode_strategy() -> impl Strategy<Value = ConditionalRetryMode> {
    prop_oneof![
        Just(ConditionalRetryMode::Never),
        Just(ConditionalRetryMode::UntilCommit),
        Just(ConditionalRetryMode::Always),
    ]
}

/// Strategy for transaction options.
pub fn tx_options_strategy() -> impl Strategy<Value = TxOptions> {
    (
        isolation_level_strategy(),
        any::<bool>(),
        any::<bool>(),
        any::<bool>(),
        conditional_retry_mode_strategy(),
    )
        .prop_map(|(level, cache, immediate, dry_run, mode)| {
            TxOptions::default()
                .with_isolation_level(level)
                .with_first_level_cache(cache)
                .with_immediate_writes(immediate)
                .with_dry_run(dry_run)
                .with_conditional_retry_mode(mode)
        })
}
