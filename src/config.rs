//! Immutable configuration threaded through every component.

use std::path::PathBuf;
use std::time::Duration;

use clap::ValueEnum;

/// Compression schema applied to the downloaded stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Compression {
    /// Raw tar, no decompression.
    Tar,
    Gzip,
    Lz4,
}

/// Configuration for a single invocation.
///
/// Built once from the CLI (or by hand in tests) and never mutated; every
/// component receives a reference instead of reaching for global state.
///
/// # Example
///
/// ```
/// use fetchtar::config::Config;
///
/// let config = Config {
///     download_workers: 4,
///     chunk_size: 8 << 20,
///     ..Config::default()
/// };
/// assert!(config.url.is_none());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Source URL (`s3://`, `gs://`, `http(s)://`). `None` means read stdin.
    pub url: Option<String>,
    /// Parallel download workers.
    ///
    /// Downloads are I/O-bound, so this is not limited by CPU cores; the
    /// limiting factor is network bandwidth.
    pub download_workers: usize,
    /// Chunk size in bytes.
    pub chunk_size: u64,
    /// Extraction target. `None` dumps raw bytes to stdout.
    pub output_dir: Option<PathBuf>,
    /// Concurrent disk writers during extraction.
    pub write_workers: usize,
    /// Leading path components stripped from each tar entry.
    pub strip_components: usize,
    /// Forced compression schema; `None` infers from magic bytes and filename.
    pub compression: Option<Compression>,
    /// Max attempts per chunk and per adapter request.
    pub retry_count: u32,
    /// Base backoff between retries.
    pub retry_wait: Duration,
    /// Backoff cap.
    pub retry_max_wait: Duration,
    /// Minimum bytes per second a worker must sustain; 0 disables the check.
    pub min_speed: u64,
    /// Grace period before the min-speed check applies to an attempt.
    pub min_speed_wait: Duration,
    /// Connect/TLS-handshake timeout.
    pub conn_timeout: Duration,
    /// Skip the metadata probe and trust `content_length`/`accept_ranges`.
    pub skip_head: bool,
    /// Out-of-band object size, honoured when `skip_head` is set.
    pub content_length: Option<u64>,
    /// Out-of-band `Accept-Ranges` value; empty means no range support.
    pub accept_ranges: String,
    /// Extra request headers for the HTTP adapter.
    pub headers: Vec<(String, String)>,
    /// Skip character/block device and fifo entries instead of aborting.
    pub ignore_node_files: bool,
    /// Replace existing destination files, links and symlinks.
    pub overwrite: bool,
    /// Use the S3 FIPS endpoints.
    pub use_fips: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: None,
            download_workers: 16,
            chunk_size: 50 << 20,
            output_dir: None,
            write_workers: 8,
            strip_components: 0,
            compression: None,
            retry_count: 10,
            retry_wait: Duration::from_secs(8),
            retry_max_wait: Duration::from_secs(30),
            min_speed: 0,
            min_speed_wait: Duration::ZERO,
            conn_timeout: Duration::from_secs(10),
            skip_head: false,
            content_length: None,
            accept_ranges: String::new(),
            headers: Vec::new(),
            ignore_node_files: false,
            overwrite: false,
            use_fips: false,
        }
    }
}

impl Config {
    /// Min-speed threshold in the unit the engine measures with.
    pub fn min_speed_bytes_per_ms(&self) -> f64 {
        self.min_speed as f64 / 1000.0
    }
}

/// Parse a byte count with an optional `K`/`M`/`G` binary suffix ("4096M").
pub fn parse_size(value: &str) -> Result<u64, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("empty size".to_string());
    }
    let (digits, shift) = match value.as_bytes()[value.len() - 1].to_ascii_uppercase() {
        b'K' => (&value[..value.len() - 1], 10),
        b'M' => (&value[..value.len() - 1], 20),
        b'G' => (&value[..value.len() - 1], 30),
        _ => (value, 0),
    };
    let base: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size {value:?}"))?;
    base.checked_shl(shift)
        .filter(|_| base.leading_zeros() >= shift)
        .ok_or_else(|| format!("size {value:?} overflows"))
}

/// Parse one `Key: Value` header flag.
pub fn parse_header(value: &str) -> Result<(String, String), String> {
    let (key, val) = value
        .split_once(':')
        .ok_or_else(|| format!("header {value:?} is not in Key:Value form"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("header {value:?} has an empty name"));
    }
    Ok((key.to_string(), val.trim().to_string()))
}
