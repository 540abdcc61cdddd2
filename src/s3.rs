//! S3 download backend over the AWS SDK.
//!
//! Credentials come from the SDK's default chain. Retries for transient
//! failures are delegated to the SDK's own retry layer, configured with the
//! same attempt budget as the HTTP adapter.

use std::sync::Arc;

use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::BehaviorVersion;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::Client;

use crate::config::Config;
use crate::error::FetchError;
use crate::multipart::MultipartReader;
use crate::source::{
    clamp_file_info, probe_override, range_header_value, FileInfo, Source, SourceStream,
};

pub struct S3Source {
    bucket: String,
    key: String,
    client: Client,
    config: Arc<Config>,
}

impl S3Source {
    pub async fn new(url: &str, config: Arc<Config>) -> Result<Self, FetchError> {
        let (bucket, key) = parse_s3_url(url)?;
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .retry_config(RetryConfig::standard().with_max_attempts(config.retry_count))
            .load()
            .await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .use_fips(config.use_fips)
            .build();
        Ok(Self {
            bucket,
            key,
            client: Client::from_conf(s3_config),
            config,
        })
    }

    async fn get(&self, range: Option<String>) -> Result<SourceStream, FetchError> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .set_range(range)
            .send()
            .await
            .map_err(|err| classify(&self.key, err))?;
        Ok(Box::new(resp.body.into_async_read()))
    }
}

#[async_trait]
impl Source for S3Source {
    async fn probe(&self) -> Result<FileInfo, FetchError> {
        if let Some(info) = probe_override(&self.config) {
            return Ok(info);
        }
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .send()
            .await
            .map_err(|err| classify(&self.key, err))?;
        let size = head.content_length().unwrap_or(0).max(0) as u64;
        let supports_range = head.accept_ranges().is_some_and(|v| !v.is_empty());
        // S3 serves exactly one range per GET, so multipart stays off.
        Ok(clamp_file_info(
            size,
            supports_range,
            false,
            self.config.chunk_size,
        ))
    }

    async fn get_all(&self) -> Result<SourceStream, FetchError> {
        self.get(None).await
    }

    async fn get_range(&self, start: u64, end: u64) -> Result<SourceStream, FetchError> {
        self.get(Some(range_header_value(&[(start, end)]))).await
    }

    async fn get_multipart(&self, _ranges: &[(u64, u64)]) -> Result<MultipartReader, FetchError> {
        Err(FetchError::MultipartUnsupported(
            "s3 does not serve multipart range responses".to_string(),
        ))
    }
}

/// Map an SDK failure onto the error taxonomy by raw HTTP status: 404 is
/// terminal not-found, 429/503 is throttling that outlived the SDK's own
/// retries, everything else is a generic S3 failure.
fn classify<E>(key: &str, err: SdkError<E, aws_smithy_runtime_api::http::Response>) -> FetchError
where
    E: std::error::Error + Send + Sync + 'static,
{
    if let Some(status) = err.raw_response().map(|r| r.status().as_u16()) {
        match status {
            404 => return FetchError::NotFound(key.to_string()),
            429 | 503 => return FetchError::Throttled(key.to_string()),
            _ => {}
        }
    }
    FetchError::S3(err.to_string())
}

/// Split `s3://bucket/key` into its components.
fn parse_s3_url(url: &str) -> Result<(String, String), FetchError> {
    let invalid = |reason: &str| FetchError::InvalidUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    };
    let rest = url
        .strip_prefix("s3://")
        .ok_or_else(|| invalid("missing s3:// scheme"))?;
    let (bucket, key) = rest
        .split_once('/')
        .ok_or_else(|| invalid("missing object key"))?;
    if bucket.is_empty() || key.is_empty() {
        return Err(invalid("empty bucket or object key"));
    }
    Ok((bucket.to_string(), key.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bucket_and_key() {
        let (bucket, key) = parse_s3_url("s3://snapshots/prod/db.tar.gz").unwrap();
        assert_eq!(bucket, "snapshots");
        assert_eq!(key, "prod/db.tar.gz");
    }

    #[test]
    fn rejects_malformed_urls() {
        assert!(parse_s3_url("s3://bucket-only").is_err());
        assert!(parse_s3_url("s3:///key").is_err());
        assert!(parse_s3_url("http://x/y").is_err());
    }
}
