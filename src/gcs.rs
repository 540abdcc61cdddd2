//! GCS download backend.
//!
//! Credentials are taken from `GOOGLE_APPLICATION_CREDENTIALS_JSON` when
//! set, otherwise the library's default discovery (application default
//! credentials, metadata server) applies.

use std::sync::Arc;

use async_trait::async_trait;
use google_cloud_storage::client::google_cloud_auth::credentials::CredentialsFile;
use google_cloud_storage::client::{Client, ClientConfig};
use google_cloud_storage::http::objects::download::Range;
use google_cloud_storage::http::objects::get::GetObjectRequest;

use crate::config::Config;
use crate::error::FetchError;
use crate::multipart::MultipartReader;
use crate::source::{
    clamp_file_info, probe_override, stream_reader, FileInfo, Source, SourceStream,
};

const CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS_JSON";

pub struct GcsSource {
    bucket: String,
    object: String,
    client: Client,
    config: Arc<Config>,
}

impl GcsSource {
    pub async fn new(url: &str, config: Arc<Config>) -> Result<Self, FetchError> {
        let (bucket, object) = parse_gs_url(url)?;
        let client_config = match std::env::var(CREDENTIALS_ENV) {
            Ok(json) => {
                let creds = CredentialsFile::new_from_str(&json)
                    .await
                    .map_err(|e| FetchError::Gcs(format!("invalid {CREDENTIALS_ENV}: {e}")))?;
                ClientConfig::default()
                    .with_credentials(creds)
                    .await
                    .map_err(|e| FetchError::Gcs(e.to_string()))?
            }
            Err(_) => ClientConfig::default()
                .with_auth()
                .await
                .map_err(|e| FetchError::Gcs(e.to_string()))?,
        };
        Ok(Self {
            bucket,
            object,
            client: Client::new(client_config),
            config,
        })
    }

    fn request(&self) -> GetObjectRequest {
        GetObjectRequest {
            bucket: self.bucket.clone(),
            object: self.object.clone(),
            ..Default::default()
        }
    }

    async fn download(&self, range: Range) -> Result<SourceStream, FetchError> {
        let stream = self
            .client
            .download_streamed_object(&self.request(), &range)
            .await
            .map_err(|err| classify(&self.object, err))?;
        Ok(stream_reader(stream))
    }
}

#[async_trait]
impl Source for GcsSource {
    async fn probe(&self) -> Result<FileInfo, FetchError> {
        if let Some(info) = probe_override(&self.config) {
            return Ok(info);
        }
        let object = self
            .client
            .get_object(&self.request())
            .await
            .map_err(|err| classify(&self.object, err))?;
        // GCS serves single ranges on every object; multiple ranges per
        // request are not offered.
        Ok(clamp_file_info(
            object.size.max(0) as u64,
            true,
            false,
            self.config.chunk_size,
        ))
    }

    async fn get_all(&self) -> Result<SourceStream, FetchError> {
        self.download(Range(None, None)).await
    }

    async fn get_range(&self, start: u64, end: u64) -> Result<SourceStream, FetchError> {
        // Range is inclusive on both ends, like the wire header.
        self.download(Range(Some(start), Some(end.saturating_sub(1))))
            .await
    }

    async fn get_multipart(&self, _ranges: &[(u64, u64)]) -> Result<MultipartReader, FetchError> {
        Err(FetchError::MultipartUnsupported(
            "gcs does not serve multipart range responses".to_string(),
        ))
    }
}

fn classify(object: &str, err: google_cloud_storage::http::Error) -> FetchError {
    use google_cloud_storage::http::Error;
    if let Error::Response(resp) = &err {
        match resp.code {
            404 => return FetchError::NotFound(object.to_string()),
            429 | 503 => return FetchError::Throttled(object.to_string()),
            _ => {}
        }
    }
    FetchError::Gcs(err.to_string())
}

/// Split `gs://bucket/object` into its components.
fn parse_gs_url(url: &str) -> Result<(String, String), FetchError> {
    let invalid = |reason: &str| FetchError::InvalidUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    };
    let rest = url
        .strip_prefix("gs://")
        .ok_or_else(|| invalid("missing gs:// scheme"))?;
    let (bucket, object) = rest
        .split_once('/')
        .ok_or_else(|| invalid("missing object name"))?;
    if bucket.is_empty() || object.is_empty() {
        return Err(invalid("empty bucket or object name"));
    }
    Ok((bucket.to_string(), object.to_string()))
}
