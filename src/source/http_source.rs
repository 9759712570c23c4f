use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use reqwest::{Client, RequestBuilder};
use tracing::{debug, warn};

use super::traits::{RangeResponse, RangeSource};
use crate::engine::fragment::ByteRange;

/// Ranged fetches over HTTP(S) with optional extra request headers.
pub struct HttpSource {
    client: Client,
    headers: Arc<RwLock<HashMap<String, String>>>,
}

impl HttpSource {
    pub fn new(headers: HashMap<String, String>) -> Self {
        Self::with_client(Client::new(), headers)
    }

    pub fn with_client(client: Client, headers: HashMap<String, String>) -> Self {
        Self {
            client,
            headers: Arc::new(RwLock::new(headers)),
        }
    }

    /// Replace the extra headers (e.g. after a token refresh).
    pub fn update_headers(&self, new_headers: HashMap<String, String>) {
        *self.headers.write() = new_headers;
    }

    fn build_request(&self, url: &str, range: &ByteRange) -> RequestBuilder {
        let headers = self.headers.read().clone();

        let mut req = self.client.get(url);
        for (k, v) in &headers {
            req = req.header(k.as_str(), v.as_str());
        }
        req.header(RANGE, range.to_header_value())
    }
}

impl Default for HttpSource {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: reqwest::header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Total size from a `Content-Range: bytes <s>-<e>/<total>` value.
pub(crate) fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse::<u64>().ok()
}

/// First byte offset from a `Content-Range: bytes <s>-<e>/<total>` value.
pub(crate) fn parse_content_range_start(value: &str) -> Option<u64> {
    let spec = value.trim().strip_prefix("bytes")?.trim_start();
    let (start, _) = spec.split_once('-')?;
    start.trim().parse::<u64>().ok()
}

#[async_trait]
impl RangeSource for HttpSource {
    async fn fetch(&self, url: &str, range: ByteRange) -> Result<RangeResponse> {
        let resp = self.build_request(url, &range).send().await?;

        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 || status.as_u16() == 412 {
            warn!(
                "http fetch auth rejected status={} range={}",
                status.as_u16(),
                range
            );
            return Err(anyhow!("auth_rejected: HTTP {}", status.as_u16()));
        }
        if !status.is_success() {
            warn!("http fetch failed status={} range={}", status.as_u16(), range);
            return Err(anyhow!("fetch failed: HTTP {}", status.as_u16()));
        }
        // A plain 200 carries the body from offset 0, which only lines up with a range starting there.
        if status.as_u16() == 200 && range.start != 0 {
            return Err(anyhow!("server ignored range {}", range.to_header_value()));
        }

        let headers = resp.headers();
        let content_range = header_str(headers, CONTENT_RANGE);
        // Bytes written at the wrong offset would poison the cache.
        if status.as_u16() == 206 {
            if let Some(start) = content_range.and_then(parse_content_range_start) {
                if start != range.start {
                    warn!("http fetch range mismatch requested={} served_start={}", range, start);
                    return Err(anyhow!(
                        "server answered {} with content starting at {}",
                        range.to_header_value(),
                        start
                    ));
                }
            }
        }
        let content_type = header_str(headers, CONTENT_TYPE).map(str::to_string);
        let total_length = content_range.and_then(parse_content_range_total);
        let content_length = header_str(headers, CONTENT_LENGTH).and_then(|v| v.parse::<u64>().ok());
        let accepts_ranges = header_str(headers, ACCEPT_RANGES)
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);

        debug!(
            "http fetch status={} range={} type={:?} total={:?}",
            status.as_u16(),
            range,
            content_type,
            total_length
        );

        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(anyhow::Error::from))
            .boxed();

        Ok(RangeResponse {
            status: status.as_u16(),
            content_type,
            total_length,
            content_length,
            accepts_ranges,
            body,
        })
    }
}
