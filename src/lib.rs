//! fetchtar - parallel archive downloader and streaming tar extractor.
//!
//! This library downloads a single remote object from S3, GCS or any
//! HTTP(S) server using many concurrent byte-range workers, reassembles the
//! bytes into one ordered stream, and either dumps the stream to stdout or
//! decompresses and extracts it as a tar archive.
//!
//! # Features
//!
//! - **Parallel Ordered Download**: striped byte-range workers serialised
//!   through a token ring, so bytes arrive in file order without buffering
//!   the whole object
//! - **Min-Speed Enforcement**: slow or stalled connections are reset and
//!   retried under a per-chunk budget
//! - **Multipart Ranges**: a worker's whole stripe can ride one persistent
//!   `multipart/byteranges` response
//! - **Streaming Extraction**: tar entries are written by a bounded pool of
//!   concurrent disk writers, with hard-link ordering hazards handled
//! - **Compression Detection**: gzip and lz4 are recognised by magic bytes
//!   with a filename-extension fallback
//!
//! # Example
//!
//! ```no_run
//! use fetchtar::config::Config;
//!
//! # async fn example() -> Result<(), fetchtar::error::FetchError> {
//! let config = Config {
//!     url: Some("https://example.com/snapshot.tar.gz".to_string()),
//!     output_dir: Some(".".into()),
//!     ..Config::default()
//! };
//! fetchtar::run(config).await?;
//! # Ok(())
//! # }
//! ```

pub mod chunk;
pub mod compression;
pub mod config;
pub mod engine;
pub mod error;
pub mod extract;
mod gcs;
mod http;
pub mod multipart;
pub mod orchestrator;
pub mod pipe;
mod s3;
pub mod source;

// Re-export the public API surface.
pub use config::{Compression, Config};
pub use error::FetchError;
pub use orchestrator::run;
