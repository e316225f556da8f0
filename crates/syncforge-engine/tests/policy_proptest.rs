use std::collections::BTreeMap;

use proptest::prelude::*;
use serde_json::json;
use syncforge_engine::backoff::BackoffPolicy;
use syncforge_engine::config::parser;
use syncforge_engine::config::validator;
use syncforge_engine::reconcile::{bucketize, reconcile};
use syncforge_types::record::{BucketKey, Record};
use syncforge_types::state::SyncMode;

fn bucket_key() -> impl Strategy<Value = BucketKey> {
    prop_oneof![
        4 => (2019_u16..2025).prop_map(BucketKey::Year),
        1 => Just(BucketKey::Unknown),
    ]
}

/// Records drawn from a small id space so collisions are common.
fn records(max: usize) -> impl Strategy<Value = Vec<Record>> {
    prop::collection::vec((0_u8..12, bucket_key(), 0_u32..1_000), 0..max).prop_map(|raw| {
        raw.into_iter()
            .map(|(id, bucket, value)| Record::new(format!("r{id}"), bucket, json!({ "value": value })))
            .collect()
    })
}

fn pipeline_yaml(mode: &str, read_from: bool, concurrency: usize, max_attempts: u32) -> String {
    let state = if read_from { "state:\n  read_from: db\n" } else { "" };
    format!(
        r#"
version: "1.0"
pipeline: prop_policy
source:
  resource: despesas
  base_url: https://api.example.com/v2
  endpoint: deputados/{{item}}/despesas
  items: ["1"]
  id_fields: [id]
run:
  mode: {mode}
  concurrency: {concurrency}
  max_attempts: {max_attempts}
destinations:
  - name: db
    kind: memory
{state}"#
    )
}

proptest! {
    #[test]
    fn bucketize_keeps_one_record_per_id(batch in records(40)) {
        let buckets = bucketize(batch.clone());
        for (key, state) in &buckets {
            prop_assert!(!state.is_empty());
            prop_assert_eq!(state.key, *key);
            for (id, record) in &state.records {
                prop_assert_eq!(&record.id, id);
                prop_assert_eq!(record.bucket, *key);
                let last = batch
                    .iter()
                    .rev()
                    .find(|r| r.bucket == *key && &r.id == id)
                    .unwrap();
                prop_assert_eq!(record, last);
            }
        }
    }

    #[test]
    fn full_reconcile_is_idempotent(stored in records(30), incoming in records(30)) {
        let existing = bucketize(stored);
        let once = reconcile(bucketize(incoming.clone()), existing, SyncMode::Full);
        let twice = reconcile(bucketize(incoming), once.buckets.clone(), SyncMode::Full);
        prop_assert_eq!(&once.buckets, &twice.buckets);
    }

    #[test]
    fn incremental_replay_is_idempotent(stored in records(30), incoming in records(30)) {
        let existing = bucketize(stored);
        let once = reconcile(bucketize(incoming.clone()), existing, SyncMode::Incremental);
        let twice = reconcile(bucketize(incoming), once.buckets.clone(), SyncMode::Incremental);
        prop_assert_eq!(&once.buckets, &twice.buckets);
        prop_assert_eq!(twice.added, 0);
    }

    #[test]
    fn reconcile_never_loses_untouched_buckets(
        stored in records(30),
        incoming in records(30),
        incremental in any::<bool>(),
    ) {
        let mode = if incremental { SyncMode::Incremental } else { SyncMode::Full };
        let existing = bucketize(stored);
        let fresh = bucketize(incoming);
        let outcome = reconcile(fresh.clone(), existing.clone(), mode);

        for (key, state) in &existing {
            if !fresh.contains_key(key) {
                prop_assert_eq!(outcome.buckets.get(key), Some(state));
                prop_assert!(!outcome.touched.contains(key));
            }
        }
        let touched: Vec<BucketKey> = fresh.keys().copied().collect();
        prop_assert_eq!(outcome.touched.iter().copied().collect::<Vec<_>>(), touched);
    }

    #[test]
    fn incremental_contains_every_new_record(stored in records(30), incoming in records(30)) {
        let fresh = bucketize(incoming);
        let outcome = reconcile(fresh.clone(), bucketize(stored), SyncMode::Incremental);
        let empty = BTreeMap::new();
        for (key, state) in &fresh {
            let merged = match outcome.buckets.get(key) {
                Some(bucket) => &bucket.records,
                None => &empty,
            };
            for (id, record) in &state.records {
                prop_assert_eq!(merged.get(id), Some(record));
            }
        }
    }

    #[test]
    fn backoff_stays_within_jittered_max(
        base_ms in 1_u64..2_000,
        extra_ms in 0_u64..10_000,
        multiplier in 1.0_f64..4.0,
        attempt in 0_u32..40,
    ) {
        let policy = BackoffPolicy {
            base: std::time::Duration::from_millis(base_ms),
            max: std::time::Duration::from_millis(base_ms + extra_ms),
            multiplier,
            jitter: 0.1,
        };
        prop_assert!(policy.nominal_delay(attempt) <= policy.max);
        let ceiling = policy.max.mul_f64(1.0 + policy.jitter) + std::time::Duration::from_millis(1);
        prop_assert!(policy.delay_for(attempt) <= ceiling);
    }

    #[test]
    fn incremental_requires_read_from(incremental in any::<bool>(), read_from in any::<bool>()) {
        let mode = if incremental { "incremental" } else { "full" };
        let yaml = pipeline_yaml(mode, read_from, 5, 3);
        let config = parser::parse_pipeline_str(&yaml).expect("generated yaml must parse");
        let result = validator::validate_pipeline(&config);

        if incremental && !read_from {
            prop_assert!(result.is_err());
        } else {
            prop_assert!(result.is_ok());
        }
    }

    #[test]
    fn concurrency_and_attempts_are_bounded(concurrency in 0_usize..80, max_attempts in 0_u32..8) {
        let yaml = pipeline_yaml("full", false, concurrency, max_attempts);
        let config = parser::parse_pipeline_str(&yaml).expect("generated yaml must parse");
        let result = validator::validate_pipeline(&config);

        let valid = (1..=64).contains(&concurrency) && (1..=5).contains(&max_attempts);
        prop_assert_eq!(result.is_ok(), valid);
    }
}
