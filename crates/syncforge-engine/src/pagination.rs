//! Paginated fetcher: follows cursors until the source is exhausted or a
//! page ceiling is hit.

use std::future::Future;

use syncforge_types::error::FetchError;
use syncforge_types::page::{Page, PageCursor};

use crate::retry::RetryExecutor;
use crate::source::PageSource;

/// Records of every page fetched for one work item, in page order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PagedRecords {
    pub records: Vec<serde_json::Value>,
    pub pages: u32,
    /// The page ceiling stopped pagination before the source was exhausted.
    pub truncated: bool,
}

/// Fetch pages through `executor` until `has_next` is false or `max_pages`
/// pages have been read.
///
/// Hitting the ceiling logs a warning and sets `truncated`; it is not an
/// error. A page that claims a successor without a cursor ends pagination
/// with a warning.
///
/// # Errors
///
/// Returns the error of the first page that exhausts its retry budget.
/// Records of earlier pages are discarded.
pub async fn fetch_all<F, Fut>(
    executor: &RetryExecutor,
    max_pages: u32,
    context: &str,
    mut fetch_page: F,
) -> Result<PagedRecords, FetchError>
where
    F: FnMut(Option<PageCursor>) -> Fut,
    Fut: Future<Output = Result<Page, FetchError>>,
{
    let max_pages = max_pages.max(1);
    let mut out = PagedRecords::default();
    let mut cursor: Option<PageCursor> = None;

    loop {
        let page = executor
            .execute(context, || fetch_page(cursor.clone()))
            .await?;
        out.pages += 1;
        out.records.extend(page.records);

        if !page.has_next {
            break;
        }
        let Some(next) = page.cursor else {
            tracing::warn!(
                context,
                pages = out.pages,
                "Page reported a successor without a cursor; stopping"
            );
            break;
        };
        if out.pages >= max_pages {
            out.truncated = true;
            tracing::warn!(
                context,
                max_pages,
                records = out.records.len(),
                "Page ceiling reached; results truncated"
            );
            break;
        }
        cursor = Some(next);
    }

    Ok(out)
}

/// [`fetch_all`] against a [`PageSource`] for one work item.
///
/// # Errors
///
/// Same as [`fetch_all`].
pub async fn fetch_item(
    source: &dyn PageSource,
    executor: &RetryExecutor,
    max_pages: u32,
    item: &str,
) -> Result<PagedRecords, FetchError> {
    let context = format!("{}/{item}", source.resource());
    fetch_all(executor, max_pages, &context, |cursor| async move {
        source.fetch_page(item, cursor.as_ref()).await
    })
    .await
}
