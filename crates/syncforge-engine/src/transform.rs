//! Transform stage: raw page records to bucketed, typed records.

use std::collections::BTreeMap;

use syncforge_types::record::{BucketKey, Record};
use syncforge_types::state::StageCounts;

use crate::dispatch::FetchResult;
use crate::reconcile::{bucketize, BucketState};
use crate::shape::RecordShape;

/// Bucketed records of one entity (work item).
#[derive(Debug, Clone, PartialEq)]
pub struct EntityBuckets {
    pub entity: String,
    pub buckets: BTreeMap<BucketKey, BucketState>,
}

/// Output of the transform stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformOutput {
    /// One entry per successfully fetched item, in dispatch order. Items
    /// whose fetch failed are absent.
    pub entities: Vec<EntityBuckets>,
    pub counts: StageCounts,
    /// Records bucketed as `unknown` plus records rejected for a missing id.
    pub warnings: u64,
}

/// Shape every record of every successful fetch.
#[must_use]
pub fn transform(results: &[FetchResult], shape: &dyn RecordShape) -> TransformOutput {
    let mut out = TransformOutput::default();

    for result in results.iter().filter(|r| r.is_success()) {
        let mut records = Vec::with_capacity(result.records.len());
        let mut unknown = 0u64;
        let mut rejected = 0u64;

        for raw in &result.records {
            let id = match shape.record_id(raw) {
                Ok(id) => id,
                Err(e) => {
                    rejected += 1;
                    tracing::debug!(item = result.item_id.as_str(), error = %e, "Record rejected");
                    continue;
                }
            };
            let bucket = shape.bucket_key(raw);
            if bucket.is_unknown() {
                unknown += 1;
            }
            records.push(Record::new(id, bucket, raw.clone()));
        }

        if unknown > 0 {
            tracing::warn!(
                item = result.item_id.as_str(),
                records = unknown,
                "Records without a usable timestamp placed in the unknown bucket"
            );
        }
        if rejected > 0 {
            tracing::warn!(
                item = result.item_id.as_str(),
                records = rejected,
                "Records without an id were dropped"
            );
        }

        out.counts.record_success(records.len() as u64);
        out.counts.record_failure(rejected);
        out.warnings += unknown + rejected;
        out.entities.push(EntityBuckets {
            entity: result.item_id.clone(),
            buckets: bucketize(records),
        });
    }

    out
}
