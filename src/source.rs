//! The capability set every download backend implements.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

use crate::config::Config;
use crate::error::FetchError;
use crate::gcs::GcsSource;
use crate::http::HttpSource;
use crate::multipart::MultipartReader;
use crate::s3::S3Source;

/// A raw byte stream from one backend request.
pub type SourceStream = Box<dyn AsyncRead + Send + Unpin>;

/// Object metadata reported by [`Source::probe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    /// Total object length in bytes.
    pub size: u64,
    /// Whether the server honours `bytes=a-b` range requests.
    pub supports_range: bool,
    /// Whether the server honours comma-separated ranges with a
    /// `multipart/byteranges` response body.
    pub supports_multipart: bool,
}

/// An addressable remote object.
///
/// `start`/`end` follow the half-open convention `[start, end)`; adapters
/// translate to the wire-level inclusive form.
#[async_trait]
pub trait Source: Send + Sync {
    /// Fetch size and range capabilities.
    async fn probe(&self) -> Result<FileInfo, FetchError>;

    /// Stream the entire object.
    async fn get_all(&self) -> Result<SourceStream, FetchError>;

    /// Stream a single byte range `[start, end)`.
    async fn get_range(&self, start: u64, end: u64) -> Result<SourceStream, FetchError>;

    /// Request several disjoint ranges in one call.
    ///
    /// Errors (rather than aborting) when the server does not answer with a
    /// `multipart/*` body, so callers can fall back.
    async fn get_multipart(&self, ranges: &[(u64, u64)]) -> Result<MultipartReader, FetchError>;
}

/// Pick the adapter for a URL scheme.
pub async fn for_url(url: &str, config: Arc<Config>) -> Result<Arc<dyn Source>, FetchError> {
    if url.starts_with("s3://") {
        Ok(Arc::new(S3Source::new(url, config).await?))
    } else if url.starts_with("gs://") {
        Ok(Arc::new(GcsSource::new(url, config).await?))
    } else if url.starts_with("http://") || url.starts_with("https://") {
        Ok(Arc::new(HttpSource::new(url, config)?))
    } else {
        Err(FetchError::InvalidUrl {
            url: url.to_string(),
            reason: "expected an s3://, gs:// or http(s):// scheme".to_string(),
        })
    }
}

/// Render half-open ranges as an inclusive `Range` header value.
///
/// The result is meaningless for an empty slice.
pub fn range_header_value(ranges: &[(u64, u64)]) -> String {
    let mut value = String::from("bytes=");
    for (i, (start, end)) in ranges.iter().enumerate() {
        if i > 0 {
            value.push(',');
        }
        value.push_str(&format!("{}-{}", start, end - 1));
    }
    value
}

/// Clamp probe results: when one chunk covers the whole object, range
/// support is irrelevant and both capabilities are reported false.
pub(crate) fn clamp_file_info(
    size: u64,
    supports_range: bool,
    supports_multipart: bool,
    chunk_size: u64,
) -> FileInfo {
    if size > chunk_size {
        FileInfo {
            size,
            supports_range,
            supports_multipart,
        }
    } else {
        FileInfo {
            size,
            supports_range: false,
            supports_multipart: false,
        }
    }
}

/// Probe bypass shared by the adapters: with `skip_head` set, the operator
/// supplies size and range support out-of-band.
pub(crate) fn probe_override(config: &Config) -> Option<FileInfo> {
    if !config.skip_head {
        return None;
    }
    Some(clamp_file_info(
        config.content_length.unwrap_or(0),
        !config.accept_ranges.is_empty(),
        false,
        config.chunk_size,
    ))
}

/// Adapt a fallible `Bytes` stream into the reader the engine consumes.
pub(crate) fn stream_reader<S, E>(stream: S) -> SourceStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
{
    Box::new(StreamReader::new(Box::pin(
        stream.map_err(io::Error::other),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header_is_inclusive() {
        assert_eq!(range_header_value(&[(0, 1)]), "bytes=0-0");
        assert_eq!(range_header_value(&[(0, 1), (3, 6)]), "bytes=0-0,3-5");
        assert_eq!(
            range_header_value(&[(100, 150), (200, 250), (300, 301)]),
            "bytes=100-149,200-249,300-300"
        );
    }

    #[test]
    fn tiny_objects_report_no_range_support() {
        let info = clamp_file_info(1000, true, true, 2000);
        assert!(!info.supports_range);
        assert!(!info.supports_multipart);

        let info = clamp_file_info(2_000_000, true, false, 1_000_000);
        assert_eq!(info.size, 2_000_000);
        assert!(info.supports_range);
        assert!(!info.supports_multipart);
    }

    #[test]
    fn skip_head_supplies_out_of_band_metadata() {
        let config = Config {
            skip_head: true,
            content_length: Some(2_000_000),
            accept_ranges: "bytes".to_string(),
            chunk_size: 1_000_000,
            ..Config::default()
        };
        let info = probe_override(&config).unwrap();
        assert_eq!(info.size, 2_000_000);
        assert!(info.supports_range);
        assert!(!info.supports_multipart);

        let config = Config {
            skip_head: true,
            content_length: Some(500_000),
            accept_ranges: "bytes".to_string(),
            chunk_size: 1_000_000,
            ..Config::default()
        };
        let info = probe_override(&config).unwrap();
        assert!(!info.supports_range);

        let config = Config {
            skip_head: true,
            content_length: Some(2_000_000),
            accept_ranges: String::new(),
            chunk_size: 1_000_000,
            ..Config::default()
        };
        assert!(!probe_override(&config).unwrap().supports_range);

        assert!(probe_override(&Config::default()).is_none());
    }
}
