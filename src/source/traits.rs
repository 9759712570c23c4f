use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::engine::fragment::ByteRange;

/// Headers of a ranged response plus its streaming body.
pub struct RangeResponse {
    pub status: u16,
    /// Declared `Content-Type`, if any.
    pub content_type: Option<String>,
    /// Total resource size from `Content-Range: bytes s-e/<total>`.
    pub total_length: Option<u64>,
    /// Declared `Content-Length` of this response body.
    pub content_length: Option<u64>,
    /// `Accept-Ranges: bytes` was present.
    pub accepts_ranges: bool,
    pub body: BoxStream<'static, Result<Bytes>>,
}

impl RangeResponse {
    /// Size of the whole resource as far as this response tells.
    pub fn resource_length(&self) -> Option<u64> {
        if self.status == 206 {
            self.total_length
        } else {
            self.total_length.or(self.content_length)
        }
    }

    pub fn supports_range(&self) -> bool {
        self.accepts_ranges || self.status == 206
    }
}

#[async_trait]
pub trait RangeSource: Send + Sync {
    /// Issue `GET url` with `Range: bytes=<start>-<end - 1>`.
    async fn fetch(&self, url: &str, range: ByteRange) -> Result<RangeResponse>;
}
