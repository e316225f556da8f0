//! Page-fetch capability consumed by the engine.

use async_trait::async_trait;
use syncforge_types::error::FetchError;
use syncforge_types::page::{Page, PageCursor};

/// A paginated remote collection, addressed per work item.
///
/// Implementations translate `(item, cursor)` into one remote call and map
/// failures onto [`FetchError`] so the engine can classify them.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Resource name, used as the first segment of destination keys.
    fn resource(&self) -> &str;

    /// Fetch one page for `item`. `cursor` is `None` for the first page.
    async fn fetch_page(&self, item: &str, cursor: Option<&PageCursor>) -> Result<Page, FetchError>;
}
