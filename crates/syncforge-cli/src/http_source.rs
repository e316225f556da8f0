//! `reqwest`-backed page source for JSON REST collections with numbered
//! pages (`pagina`/`itens` query parameters).

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::Value;
use syncforge_engine::config::types::SourceConfig;
use syncforge_engine::orchestrator::DateRange;
use syncforge_engine::source::PageSource;
use syncforge_types::error::FetchError;
use syncforge_types::page::{Page, PageCursor};

const PAGE_PARAM: &str = "pagina";
const PAGE_SIZE_PARAM: &str = "itens";
const ERROR_BODY_PREVIEW: usize = 200;

/// Fetches one numbered page per call; the cursor is the next page number.
pub struct HttpPageSource {
    client: reqwest::Client,
    resource: String,
    base_url: String,
    endpoint: String,
    page_size: u32,
    records_field: String,
    filters: Vec<(String, String)>,
}

impl HttpPageSource {
    /// Build a source for `source`, bounding every request by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn from_config(source: &SourceConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("syncforge/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            resource: source.resource.clone(),
            base_url: source.base_url.clone(),
            endpoint: source.endpoint.clone(),
            page_size: source.page_size,
            records_field: source.records_field.clone(),
            filters: filter_params(&source.query, &source.years, source.date_range),
        })
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    fn resource(&self) -> &str {
        &self.resource
    }

    async fn fetch_page(&self, item: &str, cursor: Option<&PageCursor>) -> Result<Page, FetchError> {
        let page = page_number(cursor)?;
        let url = item_url(&self.base_url, &self.endpoint, item);

        let response = self
            .client
            .get(&url)
            .query(&self.filters)
            .query(&[(PAGE_PARAM, page), (PAGE_SIZE_PARAM, self.page_size)])
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = if status == StatusCode::TOO_MANY_REQUESTS {
                response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| retry_after_ms(v, Utc::now()))
            } else {
                None
            };
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, retry_after, &body));
        }

        let body: Value = response.json().await.map_err(|e| transport_error(&e))?;
        let parsed = parse_page(body, &self.records_field, self.page_size, page)?;
        tracing::debug!(
            item,
            page,
            records = parsed.records.len(),
            has_next = parsed.has_next,
            "Fetched page"
        );
        Ok(parsed)
    }
}

fn item_url(base_url: &str, endpoint: &str, item: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        endpoint.replace("{item}", item).trim_start_matches('/')
    )
}

/// Static query parameters: configured extras, then the time window.
fn filter_params(
    query: &BTreeMap<String, String>,
    years: &[u16],
    date_range: Option<DateRange>,
) -> Vec<(String, String)> {
    let mut params: Vec<(String, String)> = query.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    params.extend(years.iter().map(|year| ("ano".to_string(), year.to_string())));
    if let Some(range) = date_range {
        params.push(("dataInicio".to_string(), range.start.format("%Y-%m-%d").to_string()));
        params.push(("dataFim".to_string(), range.end.format("%Y-%m-%d").to_string()));
    }
    params
}

fn page_number(cursor: Option<&PageCursor>) -> Result<u32, FetchError> {
    match cursor {
        None => Ok(1),
        Some(cursor) => cursor
            .as_str()
            .parse()
            .map_err(|_| FetchError::other(format!("invalid page cursor '{cursor}'"))),
    }
}

/// Records and continuation of one decoded response body.
///
/// A `links` array decides `has_next` by the presence of `rel: "next"`.
/// Without links, a full page is assumed to have a successor.
fn parse_page(body: Value, records_field: &str, page_size: u32, page: u32) -> Result<Page, FetchError> {
    let (records, links) = match body {
        Value::Array(records) => (records, None),
        Value::Object(mut map) => match map.remove(records_field) {
            Some(Value::Array(records)) => (records, map.remove("links")),
            Some(_) => {
                return Err(FetchError::decode(format!(
                    "field '{records_field}' is not an array"
                )))
            }
            None => {
                return Err(FetchError::decode(format!(
                    "response has no '{records_field}' field"
                )))
            }
        },
        _ => return Err(FetchError::decode("response body is not a JSON object")),
    };

    let has_next = match links {
        Some(Value::Array(links)) if !links.is_empty() => links
            .iter()
            .any(|link| link.get("rel").and_then(Value::as_str) == Some("next")),
        _ => !records.is_empty() && u32::try_from(records.len()).map_or(true, |n| n >= page_size),
    };

    Ok(if has_next {
        Page::with_next(records, PageCursor::new((page + 1).to_string()))
    } else {
        Page::last(records)
    })
}

/// `Retry-After` as milliseconds: delta-seconds or an HTTP date.
fn retry_after_ms(value: &str, now: DateTime<Utc>) -> Option<u64> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(secs.saturating_mul(1_000));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    let wait = at.with_timezone(&Utc) - now;
    Some(u64::try_from(wait.num_milliseconds()).unwrap_or(0))
}

fn status_error(status: StatusCode, retry_after_ms: Option<u64>, body: &str) -> FetchError {
    let preview: String = body.trim().chars().take(ERROR_BODY_PREVIEW).collect();
    let message = if preview.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {preview}")
    };
    let err = FetchError::http(status.as_u16(), message);
    match retry_after_ms {
        Some(ms) => err.with_retry_after_ms(ms),
        None => err,
    }
}

fn transport_error(err: &reqwest::Error) -> FetchError {
    let message = err.to_string();
    if err.is_timeout() {
        FetchError::timeout(message)
    } else if err.is_connect() {
        FetchError::connection_refused(message)
    } else if err.is_body() {
        FetchError::connection_reset(message)
    } else if err.is_decode() {
        FetchError::decode(message)
    } else {
        FetchError::transport(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case("https://api.example.com/v2", "deputados/{item}/despesas")]
    #[case("https://api.example.com/v2/", "/deputados/{item}/despesas")]
    fn item_url_joins_base_and_endpoint(#[case] base: &str, #[case] endpoint: &str) {
        assert_eq!(
            item_url(base, endpoint, "204554"),
            "https://api.example.com/v2/deputados/204554/despesas"
        );
    }

    #[test]
    fn filter_params_include_window() {
        let query = BTreeMap::from([("ordem".to_string(), "ASC".to_string())]);
        let params = filter_params(&query, &[2023, 2024], None);
        assert_eq!(
            params,
            vec![
                ("ordem".to_string(), "ASC".to_string()),
                ("ano".to_string(), "2023".to_string()),
                ("ano".to_string(), "2024".to_string()),
            ]
        );

        let range = DateRange {
            start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
        };
        let params = filter_params(&BTreeMap::new(), &[], Some(range));
        assert_eq!(
            params,
            vec![
                ("dataInicio".to_string(), "2024-01-01".to_string()),
                ("dataFim".to_string(), "2024-03-31".to_string()),
            ]
        );
    }

    #[test]
    fn page_number_defaults_to_first_page() {
        assert_eq!(page_number(None).unwrap(), 1);
        assert_eq!(page_number(Some(&PageCursor::new("7"))).unwrap(), 7);
        assert!(page_number(Some(&PageCursor::new("next"))).is_err());
    }

    #[test]
    fn links_decide_continuation() {
        let body = json!({
            "dados": [{"id": 1}],
            "links": [{"rel": "self", "href": "a"}, {"rel": "next", "href": "b"}]
        });
        let page = parse_page(body, "dados", 100, 3).unwrap();
        assert!(page.has_next);
        assert_eq!(page.cursor, Some(PageCursor::new("4")));
        assert_eq!(page.records.len(), 1);

        let body = json!({
            "dados": [{"id": 1}, {"id": 2}],
            "links": [{"rel": "self", "href": "a"}, {"rel": "last", "href": "a"}]
        });
        assert!(!parse_page(body, "dados", 2, 1).unwrap().has_next);
    }

    #[rstest]
    #[case(2, 2, true)]
    #[case(1, 2, false)]
    #[case(0, 2, false)]
    fn full_page_implies_successor_without_links(
        #[case] records: usize,
        #[case] page_size: u32,
        #[case] has_next: bool,
    ) {
        let body = json!({ "dados": vec![json!({"id": 1}); records] });
        assert_eq!(parse_page(body, "dados", page_size, 1).unwrap().has_next, has_next);
    }

    #[test]
    fn bare_array_body_is_accepted() {
        let page = parse_page(json!([{"id": 1}]), "dados", 10, 1).unwrap();
        assert_eq!(page.records.len(), 1);
        assert!(!page.has_next);
    }

    #[test]
    fn malformed_bodies_are_decode_errors() {
        let missing = parse_page(json!({"items": []}), "dados", 10, 1).unwrap_err();
        assert_eq!(missing.kind.to_string(), "decode");
        assert!(parse_page(json!({"dados": {}}), "dados", 10, 1).is_err());
        assert!(parse_page(json!("nope"), "dados", 10, 1).is_err());
    }

    #[test]
    fn retry_after_accepts_seconds_and_dates() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(retry_after_ms("3", now), Some(3_000));
        assert_eq!(retry_after_ms("Wed, 01 May 2024 12:00:05 GMT", now), Some(5_000));
        assert_eq!(retry_after_ms("Wed, 01 May 2024 11:00:00 GMT", now), Some(0));
        assert_eq!(retry_after_ms("soon", now), None);
    }

    #[test]
    fn status_error_carries_status_and_hint() {
        let err = status_error(StatusCode::TOO_MANY_REQUESTS, Some(2_000), "slow down");
        assert_eq!(err.status, Some(429));
        assert_eq!(err.retry_after_ms, Some(2_000));
        assert!(err.message.contains("slow down"));

        let err = status_error(StatusCode::NOT_FOUND, None, "");
        assert_eq!(err.status, Some(404));
        assert_eq!(err.retry_after_ms, None);
    }
}
