//! Concurrency-limited dispatcher.
//!
//! Work items are split into chunks of `concurrency`. The items of one chunk
//! are polled concurrently on the calling task and all settle before the
//! next chunk starts; a fixed pause separates chunks. A failed item never
//! cancels its siblings.

use std::ops::ControlFlow;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use serde::Serialize;
use syncforge_types::error::FetchError;

use crate::pagination::PagedRecords;

/// One unit of work: an id plus a fetch that does nothing until polled.
pub struct WorkItem<'a> {
    pub id: String,
    pub fetch: BoxFuture<'a, Result<PagedRecords, FetchError>>,
}

impl<'a> WorkItem<'a> {
    pub fn new(id: impl Into<String>, fetch: BoxFuture<'a, Result<PagedRecords, FetchError>>) -> Self {
        Self {
            id: id.into(),
            fetch,
        }
    }
}

impl std::fmt::Debug for WorkItem<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Terminal outcome of one work item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchResult {
    pub item_id: String,
    pub records: Vec<serde_json::Value>,
    pub total_pages: u32,
    pub truncated: bool,
    pub error: Option<FetchError>,
}

impl FetchResult {
    fn success(item_id: String, paged: PagedRecords) -> Self {
        Self {
            item_id,
            records: paged.records,
            total_pages: paged.pages,
            truncated: paged.truncated,
            error: None,
        }
    }

    fn failure(item_id: String, error: FetchError) -> Self {
        Self {
            item_id,
            records: Vec::new(),
            total_pages: 0,
            truncated: false,
            error: Some(error),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Advisory progress emitted after every chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchProgress {
    /// 1-based index of the chunk that just settled.
    pub chunk: usize,
    pub chunks: usize,
    /// Items settled so far.
    pub completed: usize,
    pub total: usize,
    /// Items that succeeded so far.
    pub succeeded: usize,
}

/// Receives progress after each chunk and may stop dispatch before the next.
pub trait DispatchObserver {
    /// Return [`ControlFlow::Break`] to skip every remaining chunk.
    fn on_chunk(&mut self, progress: &DispatchProgress) -> ControlFlow<()>;
}

/// Observer that ignores progress and never stops.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentObserver;

impl DispatchObserver for SilentObserver {
    fn on_chunk(&mut self, _progress: &DispatchProgress) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
}

impl<F> DispatchObserver for F
where
    F: FnMut(&DispatchProgress) -> ControlFlow<()>,
{
    fn on_chunk(&mut self, progress: &DispatchProgress) -> ControlFlow<()> {
        self(progress)
    }
}

/// Chunked fan-out of work items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatcher {
    concurrency: usize,
    inter_chunk_pause: Duration,
}

impl Dispatcher {
    /// A concurrency of zero is treated as one.
    #[must_use]
    pub fn new(concurrency: usize, inter_chunk_pause: Duration) -> Self {
        Self {
            concurrency: concurrency.max(1),
            inter_chunk_pause,
        }
    }

    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run every item and return one result per item, in input order.
    ///
    /// When the observer breaks, items of the remaining chunks are never
    /// polled and yield a `skipped` error.
    pub async fn dispatch<'a, O>(&self, items: Vec<WorkItem<'a>>, observer: &mut O) -> Vec<FetchResult>
    where
        O: DispatchObserver + ?Sized,
    {
        let total = items.len();
        let chunks = total.div_ceil(self.concurrency);
        let mut results = Vec::with_capacity(total);
        let mut succeeded = 0usize;
        let mut stopped = false;

        let mut remaining = items.into_iter();
        for chunk in 1..=chunks {
            let batch: Vec<WorkItem<'a>> = remaining.by_ref().take(self.concurrency).collect();

            if stopped {
                results.extend(batch.into_iter().map(|item| {
                    FetchResult::failure(item.id, FetchError::skipped("dispatch stopped before this item ran"))
                }));
                continue;
            }

            let (ids, fetches): (Vec<String>, Vec<_>) =
                batch.into_iter().map(|item| (item.id, item.fetch)).unzip();
            let outcomes = join_all(fetches).await;

            for (id, outcome) in ids.into_iter().zip(outcomes) {
                let result = match outcome {
                    Ok(paged) => {
                        succeeded += 1;
                        FetchResult::success(id, paged)
                    }
                    Err(err) => {
                        tracing::warn!(item = id.as_str(), error = %err, "Work item failed");
                        FetchResult::failure(id, err)
                    }
                };
                results.push(result);
            }

            let progress = DispatchProgress {
                chunk,
                chunks,
                completed: results.len(),
                total,
                succeeded,
            };
            if observer.on_chunk(&progress).is_break() {
                if chunk < chunks {
                    tracing::warn!(
                        chunk,
                        chunks,
                        skipped = total - results.len(),
                        "Dispatch stopped by observer"
                    );
                }
                stopped = true;
                continue;
            }

            if chunk < chunks && !self.inter_chunk_pause.is_zero() {
                tokio::time::sleep(self.inter_chunk_pause).await;
            }
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use futures::FutureExt;
    use serde_json::json;
    use syncforge_types::error::FetchErrorKind;

    fn ok_item<'a>(id: &str, delay_ms: u64) -> WorkItem<'a> {
        let id_owned = id.to_string();
        WorkItem::new(
            id,
            async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok(PagedRecords {
                    records: vec![json!({ "item": id_owned })],
                    pages: 1,
                    truncated: false,
                })
            }
            .boxed(),
        )
    }

    fn failing_item<'a>(id: &str, status: u16) -> WorkItem<'a> {
        WorkItem::new(id, async move { Err(FetchError::http(status, "nope")) }.boxed())
    }

    #[tokio::test(start_paused = true)]
    async fn isolates_failures_and_preserves_order() {
        let dispatcher = Dispatcher::new(2, Duration::from_millis(1_000));
        let items = vec![ok_item("1", 30), failing_item("2", 404), ok_item("3", 10)];
        let mut events = Vec::new();
        let results = dispatcher
            .dispatch(items, &mut |p: &DispatchProgress| {
                events.push(*p);
                ControlFlow::Continue(())
            })
            .await;

        let ids: Vec<&str> = results.iter().map(|r| r.item_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(results[0].records, vec![json!({"item": "1"})]);
        assert_eq!(results[1].error.as_ref().unwrap().status, Some(404));
        assert!(results[1].records.is_empty());
        assert_eq!(results[2].records, vec![json!({"item": "3"})]);

        assert_eq!(events.len(), 2);
        assert_eq!((events[0].completed, events[0].succeeded), (2, 1));
        assert_eq!((events[1].completed, events[1].succeeded, events[1].total), (3, 2, 3));
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_never_exceeds_concurrency() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let items: Vec<WorkItem<'_>> = (0..10)
            .map(|i| {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                WorkItem::new(
                    i.to_string(),
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5 + i)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(PagedRecords::default())
                    }
                    .boxed(),
                )
            })
            .collect();

        let results = Dispatcher::new(3, Duration::ZERO)
            .dispatch(items, &mut SilentObserver)
            .await;
        assert_eq!(results.len(), 10);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn pauses_between_chunks_not_after_last() {
        let start = tokio::time::Instant::now();
        let items = vec![ok_item("a", 0), ok_item("b", 0), ok_item("c", 0)];
        Dispatcher::new(1, Duration::from_millis(1_000))
            .dispatch(items, &mut SilentObserver)
            .await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(2_000), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(3_000), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn observer_break_skips_remaining_items() {
        let polled = Arc::new(AtomicUsize::new(0));
        let items: Vec<WorkItem<'_>> = (0..5)
            .map(|i| {
                let polled = Arc::clone(&polled);
                WorkItem::new(
                    i.to_string(),
                    async move {
                        polled.fetch_add(1, Ordering::SeqCst);
                        Ok(PagedRecords::default())
                    }
                    .boxed(),
                )
            })
            .collect();

        let results = Dispatcher::new(2, Duration::ZERO)
            .dispatch(items, &mut |_: &DispatchProgress| ControlFlow::Break(()))
            .await;

        assert_eq!(results.len(), 5);
        assert_eq!(polled.load(Ordering::SeqCst), 2);
        assert!(results[..2].iter().all(FetchResult::is_success));
        for skipped in &results[2..] {
            assert_eq!(skipped.error.as_ref().unwrap().kind, FetchErrorKind::Skipped);
        }
    }

    #[tokio::test]
    async fn empty_input_yields_no_results_or_events() {
        let mut events = 0;
        let results = Dispatcher::new(4, Duration::from_secs(1))
            .dispatch(Vec::new(), &mut |_: &DispatchProgress| {
                events += 1;
                ControlFlow::Continue(())
            })
            .await;
        assert!(results.is_empty());
        assert_eq!(events, 0);
    }
}
