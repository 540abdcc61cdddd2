//! HTTP(S) download backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_TYPE, RANGE};
use reqwest::{Method, Response, StatusCode};
use tokio_retry2::strategy::ExponentialBackoff;
use tokio_retry2::{Retry, RetryError};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::FetchError;
use crate::multipart::MultipartReader;
use crate::source::{
    clamp_file_info, probe_override, range_header_value, stream_reader, FileInfo, Source,
    SourceStream,
};

pub struct HttpSource {
    url: String,
    client: reqwest::Client,
    config: Arc<Config>,
}

impl HttpSource {
    pub fn new(url: &str, config: Arc<Config>) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            let name = key
                .parse::<HeaderName>()
                .map_err(|e| invalid_header(key, e.to_string()))?;
            let value = value
                .parse::<HeaderValue>()
                .map_err(|e| invalid_header(key, e.to_string()))?;
            headers.insert(name, value);
        }
        let client = reqwest::Client::builder()
            .connect_timeout(config.conn_timeout)
            .default_headers(headers)
            .build()?;
        Ok(Self {
            url: url.to_string(),
            client,
            config,
        })
    }

    /// Issue one request under the retry policy.
    ///
    /// Transport errors and unclassified non-2xx statuses are transient; 404
    /// is terminal; 429/503 retry but exhaust to a throttled failure so the
    /// caller can exit EBUSY.
    async fn request(
        &self,
        method: Method,
        range: Option<String>,
    ) -> Result<Response, FetchError> {
        let throttled = AtomicBool::new(false);
        let strategy = backoff(&self.config);

        let result = Retry::spawn(strategy, || {
            let mut req = self.client.request(method.clone(), &self.url);
            if let Some(range) = &range {
                req = req.header(RANGE, range.as_str());
            }
            let throttled = &throttled;
            async move {
                let resp = match req.send().await {
                    Ok(resp) => resp,
                    Err(err) => {
                        warn!("request to {} failed: {err}", self.url);
                        return RetryError::to_transient(FetchError::Http(err));
                    }
                };
                let status = resp.status();
                if status.is_success() {
                    return Ok(resp);
                }
                debug!("failed response from {}: {status}", self.url);
                if status == StatusCode::NOT_FOUND {
                    return RetryError::to_permanent(FetchError::NotFound(self.url.clone()));
                }
                // Azure blob storage signals throttling with either 429 or 503.
                if status == StatusCode::TOO_MANY_REQUESTS
                    || status == StatusCode::SERVICE_UNAVAILABLE
                {
                    throttled.store(true, Ordering::Relaxed);
                }
                RetryError::to_transient(FetchError::UnexpectedStatus {
                    status: status.as_u16(),
                    url: self.url.clone(),
                })
            }
        })
        .await;

        match result {
            Ok(resp) => Ok(resp),
            Err(_) if throttled.load(Ordering::Relaxed) => Err(FetchError::Throttled(self.url.clone())),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl Source for HttpSource {
    async fn probe(&self) -> Result<FileInfo, FetchError> {
        if let Some(info) = probe_override(&self.config) {
            return Ok(info);
        }
        let resp = self.request(Method::HEAD, None).await?;
        let size = resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let supports_range = resp
            .headers()
            .get(ACCEPT_RANGES)
            .is_some_and(|v| !v.is_empty());
        // Multipart support is never probed: some object stores begin
        // streaming the whole body when asked, which both defeats the
        // probe and bills the transfer.
        Ok(clamp_file_info(
            size,
            supports_range,
            false,
            self.config.chunk_size,
        ))
    }

    async fn get_all(&self) -> Result<SourceStream, FetchError> {
        let resp = self.request(Method::GET, None).await?;
        Ok(stream_reader(resp.bytes_stream()))
    }

    async fn get_range(&self, start: u64, end: u64) -> Result<SourceStream, FetchError> {
        let resp = self
            .request(Method::GET, Some(range_header_value(&[(start, end)])))
            .await?;
        Ok(stream_reader(resp.bytes_stream()))
    }

    async fn get_multipart(&self, ranges: &[(u64, u64)]) -> Result<MultipartReader, FetchError> {
        let range = (!ranges.is_empty()).then(|| range_header_value(ranges));
        let resp = self.request(Method::GET, range).await?;

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let mime: mime::Mime = content_type.parse().map_err(|_| {
            FetchError::MultipartUnsupported(
                "error parsing content type, multipart likely not supported".to_string(),
            )
        })?;
        if mime.type_() != mime::MULTIPART {
            return Err(FetchError::MultipartUnsupported(format!(
                "content type {content_type} is not multipart"
            )));
        }
        let boundary = mime
            .get_param(mime::BOUNDARY)
            .ok_or_else(|| {
                FetchError::MultipartUnsupported("multipart response without boundary".to_string())
            })?
            .as_str()
            .to_string();
        Ok(MultipartReader::new(
            stream_reader(resp.bytes_stream()),
            &boundary,
        ))
    }
}

/// Exponential backoff: base `retry_wait`, doubling per attempt, capped at
/// `retry_max_wait`, `retry_count` total attempts.
fn backoff(config: &Config) -> impl Iterator<Item = std::time::Duration> {
    let base_ms = config.retry_wait.as_millis().max(2) as u64;
    let cap = config.retry_max_wait;
    ExponentialBackoff::from_millis(2)
        .factor(base_ms / 2)
        .map(move |delay| delay.min(cap))
        .take(config.retry_count.saturating_sub(1) as usize)
}

fn invalid_header(name: &str, reason: String) -> FetchError {
    FetchError::InvalidUrl {
        url: format!("header {name}"),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn backoff_respects_count_and_cap() {
        let config = Config {
            retry_count: 4,
            retry_wait: Duration::from_secs(8),
            retry_max_wait: Duration::from_secs(30),
            ..Config::default()
        };
        let delays: Vec<_> = backoff(&config).collect();
        // 3 retries after the initial attempt: 8s, 16s, then capped.
        assert_eq!(delays.len(), 3);
        assert_eq!(delays[0], Duration::from_secs(8));
        assert_eq!(delays[1], Duration::from_secs(16));
        assert_eq!(delays[2], Duration::from_secs(30));
    }

    #[test]
    fn single_attempt_means_no_retries() {
        let config = Config {
            retry_count: 1,
            ..Config::default()
        };
        assert_eq!(backoff(&config).count(), 0);
    }
}
