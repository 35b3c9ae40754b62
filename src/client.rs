// src/client.rs

use crate::downloader::TransferError;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use std::time::Duration;

pub type ByteStream = BoxStream<'static, Result<Bytes, TransferError>>;

/// An opened remote file, positioned at the requested offset.
pub struct RemoteStream {
    /// True when the server honoured the range request (206).
    pub ranged: bool,
    /// Length of the whole remote file, if the server told us.
    pub total_len: Option<u64>,
    pub body: ByteStream,
}

impl std::fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStream")
            .field("ranged", &self.ranged)
            .field("total_len", &self.total_len)
            .finish_non_exhaustive()
    }
}

/// Source of file bytes. `range_start == 0` asks for the whole file.
#[async_trait]
pub trait TransferClient: Send + Sync {
    async fn open_stream(&self, url: &str, range_start: u64) -> Result<RemoteStream, TransferError>;
}

/// `TransferClient` over HTTP(S) with byte-range resume.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new(user_agent: &str, connect_timeout: Duration) -> Result<Self, TransferError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }

    /// Wrap a preconfigured client (proxy settings, TLS roots).
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TransferClient for HttpClient {
    async fn open_stream(&self, url: &str, range_start: u64) -> Result<RemoteStream, TransferError> {
        let mut request = self.client.get(url);
        if range_start > 0 {
            request = request.header(RANGE, format!("bytes={}-", range_start));
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::Http(status.as_u16()));
        }

        let ranged = status == StatusCode::PARTIAL_CONTENT;
        let total_len = if ranged {
            let from_header = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total);
            from_header.or_else(|| response.content_length().map(|len| len + range_start))
        } else {
            response.content_length()
        };

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransferError::from))
            .boxed();
        Ok(RemoteStream {
            ranged,
            total_len,
            body,
        })
    }
}

/// Total length from `Content-Range: bytes 100-199/200`. `*` means unknown.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_total() {
        assert_eq!(parse_content_range_total("bytes 100-199/200"), Some(200));
        assert_eq!(parse_content_range_total("bytes 0-0/1"), Some(1));
        assert_eq!(parse_content_range_total("bytes 0-99/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }
}
