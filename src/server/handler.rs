// Axum request handler: translates player HTTP requests into cache read requests.

use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use reqwest::Url;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::config::FALLBACK_CONTENT_TYPE;
use crate::engine::loader::CacheEngine;
use crate::engine::pipeline::LoadEvent;
use crate::engine::record::ContentMeta;
use crate::engine::session::{LoadHandle, ReadRequest};
use crate::error::CacheError;

pub struct ProxyServer {
    port: u16,
    engine: Arc<CacheEngine>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl ProxyServer {
    /// Start the proxy server on a random local port.
    pub async fn start(engine: Arc<CacheEngine>) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let app = Router::new()
            .route("/stream", get(stream_handler).head(head_handler))
            .with_state(Arc::clone(&engine));

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });
        info!("proxy server listening on 127.0.0.1:{}", port);

        Ok(Self {
            port,
            engine,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Local URL under which the player should open `resource`.
    pub fn url_for(&self, resource: &str) -> Result<String> {
        let base = format!("http://127.0.0.1:{}/stream", self.port);
        let url = Url::parse_with_params(&base, &[("url", resource)])?;
        Ok(url.to_string())
    }

    pub fn engine(&self) -> &Arc<CacheEngine> {
        &self.engine
    }

    /// Shutdown the server gracefully.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamParams {
    url: String,
}

#[derive(Debug, PartialEq, Eq)]
enum ParsedRange {
    StartEnd {
        start: u64,
        end_inclusive: Option<u64>,
    },
    Suffix {
        len: u64,
    },
}

/// Parse a Range header value.
/// Supports:
/// - bytes=start-end
/// - bytes=start-
/// - bytes=-suffix_len
fn parse_range_header(value: &str) -> Option<ParsedRange> {
    let rest = value.trim().strip_prefix("bytes=")?;
    let (start_str, end_str) = rest.split_once('-')?;
    let (start_str, end_str) = (start_str.trim(), end_str.trim());

    if start_str.is_empty() {
        let len: u64 = end_str.parse().ok()?;
        if len == 0 {
            return None;
        }
        return Some(ParsedRange::Suffix { len });
    }

    let start: u64 = start_str.parse().ok()?;
    let end_inclusive = if end_str.is_empty() {
        None
    } else {
        Some(end_str.parse::<u64>().ok()?)
    };
    Some(ParsedRange::StartEnd {
        start,
        end_inclusive,
    })
}

/// Resolve a parsed range against the resource length into `[start, end)`.
/// `None` means the range is not satisfiable.
fn resolve_range(range: &ParsedRange, total: u64) -> Option<(u64, u64)> {
    let (start, end) = match *range {
        ParsedRange::StartEnd {
            start,
            end_inclusive,
        } => {
            let end = match end_inclusive {
                Some(e) => e.saturating_add(1).min(total),
                None => total,
            };
            (start, end)
        }
        ParsedRange::Suffix { len } => (total.saturating_sub(len), total),
    };
    if start >= total || end <= start {
        return None;
    }
    Some((start, end))
}

fn content_headers(meta: &ContentMeta) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let content_type = HeaderValue::from_str(&meta.content_type)
        .unwrap_or(HeaderValue::from_static(FALLBACK_CONTENT_TYPE));
    headers.insert(header::CONTENT_TYPE, content_type);
    if meta.range_supported {
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    }
    headers
}

fn error_response(url: &str, e: &CacheError) -> Response {
    error!("stream error url={}: {}", url, e);
    let status = match e {
        CacheError::Network(_) | CacheError::UnsupportedContent(_) => StatusCode::BAD_GATEWAY,
        CacheError::TransferCancelled => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, format!("error: {}", e)).into_response()
}

fn not_satisfiable(total: u64) -> Response {
    (
        StatusCode::RANGE_NOT_SATISFIABLE,
        [(header::CONTENT_RANGE, format!("bytes */{}", total))],
        "range not satisfiable",
    )
        .into_response()
}

/// Data events of a read request as a body stream, starting with `first`.
fn body_stream(
    first: Bytes,
    handle: LoadHandle,
) -> impl futures::Stream<Item = Result<Bytes, CacheError>> + Send {
    let rest = stream::unfold(handle, |mut handle| async move {
        loop {
            match handle.recv().await? {
                LoadEvent::Data(chunk) => return Some((Ok(chunk), handle)),
                LoadEvent::ContentInfo(_) => continue,
                LoadEvent::Finished(Ok(())) => return None,
                LoadEvent::Finished(Err(e)) => return Some((Err(e), handle)),
            }
        }
    });
    stream::once(async move { Ok(first) }).chain(rest)
}

/// GET /stream?url=... serves the resource with Range support.
async fn stream_handler(
    State(engine): State<Arc<CacheEngine>>,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
) -> Response {
    let url = params.url;
    let meta = match engine.content_info(&url).await {
        Ok(meta) => meta,
        Err(e) => return error_response(&url, &e),
    };
    let total = meta.content_length;

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range_header);

    let (start, end, is_partial) = match range {
        Some(range) => match resolve_range(&range, total) {
            Some((start, end)) => (start, end, true),
            None => return not_satisfiable(total),
        },
        None => (0, total, false),
    };

    debug!(
        "stream request url={} range=[{}, {}) partial={}",
        url, start, end, is_partial
    );

    let mut resp_headers = content_headers(&meta);
    resp_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(end - start));
    if is_partial {
        // Content-Range: bytes start-end/total (end is inclusive in HTTP).
        let content_range = format!("bytes {}-{}/{}", start, end - 1, total);
        if let Ok(value) = HeaderValue::from_str(&content_range) {
            resp_headers.insert(header::CONTENT_RANGE, value);
        }
    }
    let status = if is_partial {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    if start == end {
        return (status, resp_headers).into_response();
    }

    let mut handle = match engine.load(&url, ReadRequest::new(start, end - start)) {
        Ok(handle) => handle,
        Err(e) => return error_response(&url, &e),
    };

    // Hold the status line back until the first bytes arrive so an upstream
    // failure can still be reported as an error status.
    let first = loop {
        match handle.recv().await {
            Some(LoadEvent::ContentInfo(_)) => continue,
            Some(LoadEvent::Data(chunk)) => break chunk,
            Some(LoadEvent::Finished(Ok(()))) | None => {
                return (status, resp_headers).into_response();
            }
            Some(LoadEvent::Finished(Err(e))) => return error_response(&url, &e),
        }
    };

    (status, resp_headers, Body::from_stream(body_stream(first, handle))).into_response()
}

/// HEAD /stream?url=... returns headers only.
async fn head_handler(
    State(engine): State<Arc<CacheEngine>>,
    Query(params): Query<StreamParams>,
) -> Response {
    let meta = match engine.content_info(&params.url).await {
        Ok(meta) => meta,
        Err(e) => return error_response(&params.url, &e),
    };
    let mut resp_headers = content_headers(&meta);
    resp_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.content_length));
    (StatusCode::OK, resp_headers).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_header_full() {
        let result = parse_range_header("bytes=0-1023");
        assert!(matches!(
            result,
            Some(ParsedRange::StartEnd {
                start: 0,
                end_inclusive: Some(1023)
            })
        ));
    }

    #[test]
    fn test_parse_range_header_open_ended() {
        assert_eq!(
            parse_range_header("bytes=500-"),
            Some(ParsedRange::StartEnd {
                start: 500,
                end_inclusive: None
            })
        );
    }

    #[test]
    fn test_parse_range_header_suffix() {
        let result = parse_range_header("bytes=-1024");
        assert!(matches!(result, Some(ParsedRange::Suffix { len: 1024 })));
    }

    #[test]
    fn test_parse_range_header_invalid() {
        assert_eq!(parse_range_header("invalid"), None);
        assert_eq!(parse_range_header("bytes=abc-def"), None);
        assert_eq!(parse_range_header("bytes=-0"), None);
    }

    #[test]
    fn test_resolve_range_clamps_to_total() {
        let total = 1000;
        let full = ParsedRange::StartEnd {
            start: 100,
            end_inclusive: Some(5000),
        };
        assert_eq!(resolve_range(&full, total), Some((100, 1000)));
        assert_eq!(resolve_range(&ParsedRange::Suffix { len: 10 }, total), Some((990, 1000)));
        assert_eq!(resolve_range(&ParsedRange::Suffix { len: 5000 }, total), Some((0, 1000)));

        let past_end = ParsedRange::StartEnd {
            start: 1000,
            end_inclusive: None,
        };
        assert_eq!(resolve_range(&past_end, total), None);
    }
}
