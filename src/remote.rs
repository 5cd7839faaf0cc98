//! Platform-neutral view of the upstream review APIs: the error taxonomy,
//! one page of results, and the forward-only paginator.

use crate::spapi::signer::SignError;
use async_trait::async_trait;
use reqwest::{StatusCode, header::HeaderMap};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

const BODY_SNIPPET_LIMIT: usize = 512;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("authentication failed (HTTP {status})")]
    Authentication { status: u16, body: String },
    #[error("rate limited by upstream")]
    RateLimited { retry_after: Option<Duration> },
    #[error("upstream server error (HTTP {status})")]
    Server { status: u16, body: String },
    #[error("request failed (HTTP {status}): {body}")]
    Request { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("could not decode upstream response: {0}")]
    Decode(String),
    #[error(transparent)]
    Sign(#[from] SignError),
}

/// How a caller should react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Retryable,
    Throttled,
    NeedsReauth,
    Fatal,
}

impl RemoteError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RemoteError::Authentication { .. } => FailureKind::NeedsReauth,
            RemoteError::RateLimited { .. } => FailureKind::Throttled,
            RemoteError::Server { .. } | RemoteError::Transport(_) => FailureKind::Retryable,
            RemoteError::Request { .. } | RemoteError::Decode(_) | RemoteError::Sign(_) => {
                FailureKind::Fatal
            }
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RemoteError::Decode(err.to_string())
        } else {
            RemoteError::Transport(err.to_string())
        }
    }
}

/// Maps a non-success upstream response onto the error taxonomy.
pub fn classify(status: StatusCode, headers: &HeaderMap, body: &str) -> RemoteError {
    let snippet: String = body.chars().take(BODY_SNIPPET_LIMIT).collect();
    match status.as_u16() {
        401 | 403 => RemoteError::Authentication {
            status: status.as_u16(),
            body: snippet,
        },
        429 => RemoteError::RateLimited {
            retry_after: parse_retry_after(headers),
        },
        code if code >= 500 => RemoteError::Server {
            status: code,
            body: snippet,
        },
        code => RemoteError::Request {
            status: code,
            body: snippet,
        },
    }
}

/// Longest upstream throttle honoured; larger `Retry-After` values are cut
/// down to it.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// `Retry-After` as integer seconds, capped at [`MAX_RETRY_AFTER`]; anything
/// else is ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(|secs| Duration::from_secs(secs).min(MAX_RETRY_AFTER))
}

#[derive(Debug, Clone)]
pub struct PageRequest<'a> {
    pub item_id: &'a str,
    /// Amazon marketplace id or Shopify shop domain.
    pub marketplace_id: &'a str,
    pub access_token: &'a str,
    pub page_size: u32,
    pub cursor: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct ReviewPage {
    /// Response body exactly as received.
    pub body: Value,
    pub items: Vec<Value>,
    pub next_cursor: Option<String>,
}

/// Per-platform fetch capability.
#[async_trait]
pub trait ReviewSource: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest<'_>) -> Result<ReviewPage, RemoteError>;

    /// Raw review records carried by a stored response body.
    fn items_from_body(&self, body: &Value) -> Vec<Value>;

    /// Endpoint recorded as provenance in normalized artifacts.
    fn source_endpoint(&self, item_id: &str, marketplace_id: &str) -> String;
}

/// Forward-only pagination over one item. The position only moves on
/// [`Pages::advance`], so a failed fetch can be retried without skipping or
/// repeating a page.
pub struct Pages<'a> {
    source: &'a dyn ReviewSource,
    item_id: &'a str,
    marketplace_id: &'a str,
    page_size: u32,
    max_pages: Option<u32>,
    cursor: Option<String>,
    consumed: u32,
    exhausted: bool,
}

impl<'a> Pages<'a> {
    pub fn new(
        source: &'a dyn ReviewSource,
        item_id: &'a str,
        marketplace_id: &'a str,
        page_size: u32,
        max_pages: Option<u32>,
    ) -> Self {
        Self {
            source,
            item_id,
            marketplace_id,
            page_size,
            max_pages,
            cursor: None,
            consumed: 0,
            exhausted: false,
        }
    }

    /// 1-based number of the page the next fetch returns.
    pub fn page_number(&self) -> u32 {
        self.consumed + 1
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn is_done(&self) -> bool {
        self.exhausted || self.max_pages.is_some_and(|max| self.consumed >= max)
    }

    pub async fn fetch(&self, access_token: &str) -> Result<ReviewPage, RemoteError> {
        let request = PageRequest {
            item_id: self.item_id,
            marketplace_id: self.marketplace_id,
            access_token,
            page_size: self.page_size,
            cursor: self.cursor.as_deref(),
        };
        self.source.fetch_page(&request).await
    }

    pub fn advance(&mut self, next_cursor: Option<String>) {
        self.consumed += 1;
        self.exhausted = next_cursor.is_none();
        self.cursor = next_cursor;
    }

    /// Fetches and consumes the next page; `None` once pagination is over.
    pub async fn next(&mut self, access_token: &str) -> Option<Result<ReviewPage, RemoteError>> {
        if self.is_done() {
            return None;
        }
        match self.fetch(access_token).await {
            Ok(page) => {
                self.advance(page.next_cursor.clone());
                Some(Ok(page))
            }
            Err(err) => Some(Err(err)),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{ScriptedSource, page};
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn statuses_map_onto_failure_kinds() {
        let headers = HeaderMap::new();
        assert_eq!(
            classify(StatusCode::UNAUTHORIZED, &headers, "").kind(),
            FailureKind::NeedsReauth
        );
        assert_eq!(
            classify(StatusCode::FORBIDDEN, &headers, "").kind(),
            FailureKind::NeedsReauth
        );
        assert_eq!(
            classify(StatusCode::TOO_MANY_REQUESTS, &headers, "").kind(),
            FailureKind::Throttled
        );
        assert_eq!(
            classify(StatusCode::BAD_GATEWAY, &headers, "").kind(),
            FailureKind::Retryable
        );
        assert_eq!(
            classify(StatusCode::NOT_FOUND, &headers, "missing").kind(),
            FailureKind::Fatal
        );
    }

    #[test]
    fn retry_after_accepts_integer_seconds_only() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static(" 7 "));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert(
            "retry-after",
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), None);
        assert_eq!(parse_retry_after(&HeaderMap::new()), None);
    }

    #[test]
    fn oversized_retry_after_is_capped() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("99999999999999999"));
        assert_eq!(parse_retry_after(&headers), Some(MAX_RETRY_AFTER));
        headers.insert("retry-after", HeaderValue::from_static("18446744073709551616"));
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[tokio::test]
    async fn pages_follow_cursor_and_stop_when_it_runs_out() {
        let source = ScriptedSource::new(vec![
            Ok(page(2, Some("c1"))),
            Ok(page(2, Some("c2"))),
            Ok(page(1, None)),
        ]);
        let mut pages = Pages::new(&source, "B0001", "ATVPDKIKX0DER", 100, None);
        let mut counts = Vec::new();
        while let Some(result) = pages.next("token").await {
            counts.push(result.unwrap().items.len());
        }
        assert_eq!(counts, [2, 2, 1]);
        assert_eq!(
            *source.cursors.lock().unwrap(),
            [None, Some("c1".to_string()), Some("c2".to_string())]
        );
    }

    #[tokio::test]
    async fn failed_fetch_does_not_move_the_cursor() {
        let source = ScriptedSource::new(vec![
            Ok(page(1, Some("c1"))),
            Err(RemoteError::Server {
                status: 503,
                body: String::new(),
            }),
            Ok(page(1, None)),
        ]);
        let mut pages = Pages::new(&source, "B0001", "ATVPDKIKX0DER", 100, Some(5));
        assert!(pages.next("t").await.unwrap().is_ok());
        assert!(pages.next("t").await.unwrap().is_err());
        assert_eq!(pages.page_number(), 2);
        assert!(pages.next("t").await.unwrap().is_ok());
        assert!(pages.next("t").await.is_none());
        let cursors = source.cursors.lock().unwrap();
        assert_eq!(cursors[1], cursors[2]);
    }

    #[tokio::test]
    async fn max_pages_caps_pagination() {
        let source = ScriptedSource::new(vec![Ok(page(1, Some("c1"))), Ok(page(1, Some("c2")))]);
        let mut pages = Pages::new(&source, "B0001", "ATVPDKIKX0DER", 100, Some(1));
        assert!(pages.next("t").await.is_some());
        assert!(pages.next("t").await.is_none());
        assert_eq!(source.calls(), 1);
    }
}
