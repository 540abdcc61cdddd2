//! Top-level flow: source dispatch, download, detection, decode, output.

use std::io::{self, BufReader, Read};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio_util::io::SyncIoBridge;
use tracing::info;
use url::Url;

use crate::config::Config;
use crate::error::FetchError;
use crate::source::SourceStream;
use crate::{compression, engine, extract, source};

/// Run one download-and-extract invocation to completion.
pub async fn run(config: Config) -> Result<(), FetchError> {
    let config = Arc::new(config);

    if let Some(dir) = &config.output_dir {
        if !dir.is_dir() {
            return Err(FetchError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("output directory {} does not exist", dir.display()),
            )));
        }
    }

    let (stream, filename): (SourceStream, String) = match &config.url {
        Some(url) => {
            let filename = filename_from_url(url)?;
            info!("File name: {filename}");
            info!("Num download workers: {}", config.download_workers);
            info!("Chunk size (MiB): {}", config.chunk_size >> 20);
            info!("Num disk workers: {}", config.write_workers);
            let source = source::for_url(url, Arc::clone(&config)).await?;
            let stream = engine::download_stream(source, Arc::clone(&config)).await?;
            (stream, filename)
        }
        // No URL: pass stdin through the same detection and output path.
        None => (Box::new(tokio::io::stdin()), String::new()),
    };

    let consumer_config = Arc::clone(&config);
    let handle = Handle::current();
    tokio::task::spawn_blocking(move || consume(stream, &filename, &consumer_config, handle))
        .await
        .map_err(|err| {
            FetchError::Io(io::Error::other(format!("consumer task failed: {err}")))
        })?
}

/// Blocking side: bridge the async stream, sniff compression, then either
/// copy raw bytes to stdout or extract the tar tree.
fn consume(
    stream: SourceStream,
    filename: &str,
    config: &Config,
    handle: Handle,
) -> Result<(), FetchError> {
    let bridged = BufReader::new(SyncIoBridge::new_with_handle(stream, handle.clone()));
    let (magic, spliced) = compression::peek_magic(bridged)?;
    let kind = compression::select(config.compression, magic, filename);
    let mut decoded = compression::decoder(kind, spliced);

    match &config.output_dir {
        None => {
            copy_to_stdout(&mut decoded)?;
            Ok(())
        }
        Some(dir) => extract::extract_tar(decoded, dir, config, handle),
    }
}

fn copy_to_stdout(reader: &mut dyn Read) -> Result<u64, FetchError> {
    let stdout = io::stdout();
    let mut lock = stdout.lock();
    Ok(io::copy(reader, &mut lock)?)
}

/// Last path segment of the URL, used for extension-based detection.
fn filename_from_url(raw: &str) -> Result<String, FetchError> {
    let url = Url::parse(raw).map_err(|err| FetchError::InvalidUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })?;
    Ok(url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or_default()
        .to_string())
}
