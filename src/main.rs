use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use fetchtar::config::{parse_header, parse_size, Compression, Config};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fetchtar")]
#[command(about = "Download a remote archive in parallel and extract it on the fly", long_about = None)]
#[command(version)]
struct Args {
    /// URL to download from (s3://, gs:// or http(s)://); reads stdin if omitted
    url: Option<String>,

    /// How many parallel workers to download the file
    #[arg(long, default_value_t = 16)]
    download_workers: usize,

    /// Size of file chunks (in MiB) to pull in parallel
    #[arg(long, default_value_t = 50)]
    chunk_size: u64,

    /// Directory to extract the tarball to; dumps the file to stdout if not specified
    #[arg(short = 'C', long)]
    directory: Option<PathBuf>,

    /// How many parallel workers to use to write files to disk
    #[arg(long, default_value_t = 8)]
    write_workers: usize,

    /// Strip this many leading components from entry names on extraction
    #[arg(long, default_value_t = 0)]
    strip_components: usize,

    /// Force a specific compression schema instead of inferring it
    #[arg(long, value_enum)]
    compression: Option<Compression>,

    /// Max number of attempts for a single chunk or request
    #[arg(long, default_value_t = 10)]
    retry_count: u32,

    /// Base number of seconds to wait between retries (with jitter)
    #[arg(long, default_value_t = 8)]
    retry_wait: u64,

    /// Cap in seconds on the retry backoff
    #[arg(long, default_value_t = 30)]
    retry_max_wait: u64,

    /// Minimum bytes per second each worker must sustain (K/M/G suffixes); 0 disables
    #[arg(long, value_parser = parse_size, default_value = "0")]
    min_speed: u64,

    /// Seconds an attempt may run before the min-speed check applies
    #[arg(long, default_value_t = 0)]
    min_speed_wait: u64,

    /// Connect/TLS-handshake timeout in seconds
    #[arg(long, default_value_t = 10)]
    conn_timeout: u64,

    /// Skip the HEAD probe and trust --content-length / --accept-ranges
    #[arg(long)]
    skip_head: bool,

    /// Object size in bytes, used with --skip-head
    #[arg(long)]
    content_length: Option<u64>,

    /// Accept-Ranges value, used with --skip-head (empty means unsupported)
    #[arg(long, default_value = "")]
    accept_ranges: String,

    /// Additional request header as Key:Value (repeatable)
    #[arg(long = "headers", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Don't abort on character or block device nodes
    #[arg(long)]
    ignore_node_files: bool,

    /// Replace existing destination files
    #[arg(long)]
    overwrite: bool,

    /// Use the S3 FIPS endpoints
    #[arg(long)]
    use_fips: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Config {
            url: args.url,
            download_workers: args.download_workers.max(1),
            chunk_size: args.chunk_size << 20,
            output_dir: args.directory,
            write_workers: args.write_workers.max(1),
            strip_components: args.strip_components,
            compression: args.compression,
            retry_count: args.retry_count,
            retry_wait: Duration::from_secs(args.retry_wait),
            retry_max_wait: Duration::from_secs(args.retry_max_wait),
            min_speed: args.min_speed,
            min_speed_wait: Duration::from_secs(args.min_speed_wait),
            conn_timeout: Duration::from_secs(args.conn_timeout),
            skip_head: args.skip_head,
            content_length: args.content_length,
            accept_ranges: args.accept_ranges,
            headers: args.headers,
            ignore_node_files: args.ignore_node_files,
            overwrite: args.overwrite,
            use_fips: args.use_fips,
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Logs go to stderr; stdout carries the downloaded bytes.
    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("fetchtar={level}"))),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from(args);
    if let Err(err) = fetchtar::run(config).await {
        error!("{err}");
        std::process::exit(err.exit_code());
    }
}
