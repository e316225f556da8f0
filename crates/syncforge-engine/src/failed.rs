//! Failed-item persistence helper used by the orchestrator.

use chrono::Utc;
use syncforge_state::RunLedger;
use syncforge_types::state::FailedItem;

use crate::dispatch::FetchResult;

/// Failed-item log entries for every errored fetch.
pub(crate) fn collect_failed_items(results: &[FetchResult]) -> Vec<FailedItem> {
    let failed_at = Utc::now().to_rfc3339();
    results
        .iter()
        .filter_map(|r| {
            r.error.as_ref().map(|e| FailedItem {
                item_id: r.item_id.clone(),
                error_kind: e.kind.to_string(),
                status: e.status,
                error_message: e.message.clone(),
                failed_at: failed_at.clone(),
            })
        })
        .collect()
}

/// Persist failed items to the run ledger. Failures are logged, never raised.
pub(crate) fn persist_failed_items(
    ledger: &dyn RunLedger,
    pipeline: &str,
    run_id: i64,
    items: &[FailedItem],
) {
    if items.is_empty() {
        return;
    }

    let failed_count = items.len();

    match ledger.record_failed_items(pipeline, run_id, items) {
        Ok(inserted) => {
            tracing::info!(
                pipeline,
                failed_items = inserted,
                "Persisted failed items to run ledger"
            );
        }
        Err(e) => {
            tracing::error!(
                pipeline,
                failed_count,
                error = %e,
                "Failed to persist failed items"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncforge_state::SqliteStore;
    use syncforge_types::error::FetchError;
    use syncforge_types::state::SyncMode;

    #[test]
    fn collects_only_errored_results() {
        let results = vec![
            FetchResult {
                item_id: "1".into(),
                records: Vec::new(),
                total_pages: 1,
                truncated: false,
                error: None,
            },
            FetchResult {
                item_id: "2".into(),
                records: Vec::new(),
                total_pages: 0,
                truncated: false,
                error: Some(FetchError::http(404, "not found")),
            },
        ];
        let items = collect_failed_items(&results);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].item_id, "2");
        assert_eq!(items[0].error_kind, "http");
        assert_eq!(items[0].status, Some(404));
    }

    #[test]
    fn persisting_empty_list_is_a_no_op() {
        let store = SqliteStore::in_memory().unwrap();
        let run_id = store.start_run("p", SyncMode::Full).unwrap();
        persist_failed_items(&store, "p", run_id, &[]);
    }
}
