//! Error types for download and extraction operations.

use std::io;

use thiserror::Error;

/// Errors that can occur while downloading or extracting an archive.
#[derive(Error, Debug)]
pub enum FetchError {
    /// I/O error during file or stream operations.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// HTTP request error during download.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// The remote object does not exist (HTTP 404).
    #[error("file not found: {0}")]
    NotFound(String),

    /// The download server kept throttling us past the retry budget.
    #[error("throttled by download server: {0}")]
    Throttled(String),

    /// Non-2xx response that is neither 404 nor throttling.
    #[error("unexpected response status {status} from {url}")]
    UnexpectedStatus { status: u16, url: String },

    /// A worker burned through its retry budget on a single chunk.
    #[error("too many slow/stalled/failed connections for worker {worker}'s chunk, giving up")]
    RetriesExhausted { worker: usize },

    /// The server answered a multipart range request with a non-multipart body.
    #[error("multipart range not supported: {0}")]
    MultipartUnsupported(String),

    /// Malformed wire data (truncated multipart body, missing boundary).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The URL could not be parsed or names an unsupported scheme.
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The consumer side of the pipe went away while a worker held the write turn.
    #[error("output consumer closed the stream")]
    ConsumerGone,

    /// Another worker already failed and collapsed the token ring.
    #[error("download aborted by another worker")]
    Aborted,

    /// S3 request failure after SDK-level retries.
    #[error("s3 request failed: {0}")]
    S3(String),

    /// GCS request failure.
    #[error("gcs request failed: {0}")]
    Gcs(String),

    /// Tar entry of a type we refuse to extract (device nodes, fifos).
    #[error("unknown tar entry type {type_byte:#x} in {name}")]
    UnsupportedEntry { type_byte: u8, name: String },
}

impl FetchError {
    /// Exit code for the process, using symbolic errno values.
    ///
    /// Errors that travelled through the pipe arrive wrapped in an
    /// `io::Error` (sometimes re-wrapped by a decoder); walk the source
    /// chain before mapping.
    pub fn exit_code(&self) -> i32 {
        match self {
            FetchError::NotFound(_) => libc::ENOENT,
            FetchError::Throttled(_) => libc::EBUSY,
            FetchError::RetriesExhausted { .. } => libc::EIO,
            FetchError::Io(err) => {
                let mut source: Option<&(dyn std::error::Error + 'static)> = err.get_ref()
                    .map(|inner| inner as &(dyn std::error::Error + 'static));
                while let Some(inner) = source {
                    if let Some(fetch) = inner.downcast_ref::<FetchError>() {
                        return fetch.exit_code();
                    }
                    source = inner.source();
                }
                1
            }
            _ => 1,
        }
    }

    /// Wrap for transport through an `io::Error` channel (the pipe).
    pub fn into_io(self) -> io::Error {
        match self {
            FetchError::Io(err) => err,
            other => io::Error::other(other),
        }
    }
}
