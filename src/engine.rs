//! The parallel ordered-download engine.
//!
//! N workers each own a stripe of chunks and run two cooperating
//! activities: a reader that eagerly drains the network into an in-memory
//! buffer, and a writer that waits for the worker's turn in the token ring
//! and flushes buffered segments into the shared pipe. The ring slot
//! carries ownership of the pipe writer itself, so at most one worker can
//! ever write, and the turn advances `0 → 1 → … → N−1 → 0` in lock-step
//! with chunk completion. The worker producing the object's final bytes
//! closes the pipe instead of passing the turn.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::chunk::{chunk_finished, ChunkReader};
use crate::config::Config;
use crate::error::FetchError;
use crate::pipe::{pipe, PipeWriter};
use crate::source::{Source, SourceStream};

const SPEED_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// A single ordered byte stream backed by parallel range workers.
///
/// Falls back to one plain full-object stream when the source does not
/// support range requests or the whole object fits in a single chunk.
pub async fn download_stream(
    source: Arc<dyn Source>,
    config: Arc<Config>,
) -> Result<SourceStream, FetchError> {
    let info = source.probe().await?;
    info!("File size (MiB): {}", info.size >> 20);
    info!("Supports range requests: {}", info.supports_range);
    info!("Supports multipart range requests: {}", info.supports_multipart);

    if !info.supports_range || config.chunk_size == 0 || info.size < config.chunk_size {
        return source.get_all().await;
    }

    let workers = config.download_workers;
    let mut senders = Vec::with_capacity(workers);
    let mut receivers = Vec::with_capacity(workers);
    for _ in 0..workers {
        // Single-slot ring stations; the slot holds the pipe writer while
        // it is in transit between two workers.
        let (tx, rx) = mpsc::channel::<PipeWriter>(1);
        senders.push(tx);
        receivers.push(rx);
    }

    let (writer, reader) = pipe();
    senders[0]
        .send(writer)
        .await
        .expect("primed ring slot cannot be full");

    for (worker, turn) in receivers.into_iter().enumerate() {
        let next = senders[(worker + 1) % workers].clone();
        tokio::spawn(run_worker(
            worker,
            Arc::clone(&source),
            info.size,
            info.supports_multipart,
            Arc::clone(&config),
            turn,
            next,
        ));
    }

    Ok(Box::new(reader))
}

/// Entry point of one download worker, covering the stripe that starts at
/// `worker * chunk_size`.
async fn run_worker(
    worker: usize,
    source: Arc<dyn Source>,
    size: u64,
    multipart: bool,
    config: Arc<Config>,
    mut turn: mpsc::Receiver<PipeWriter>,
    next: mpsc::Sender<PipeWriter>,
) {
    let chunk_size = config.chunk_size;
    let mut reader = ChunkReader::new(
        Arc::clone(&source),
        size,
        worker as u64 * chunk_size,
        chunk_size,
        config.download_workers,
        multipart,
    );

    // Connection attempts for the current chunk. Resets per chunk in
    // single-range mode; carries across a multipart stripe because all its
    // chunks share one connection.
    let mut attempt_number: u32 = 1;

    // Periodic throughput accounting.
    let mut total_downloaded: u64 = 0;
    let mut time_downloading = Duration::ZERO;
    let mut last_log = Instant::now();

    while reader.cur_chunk_start() < size {
        if let Err(err) = reader.request_chunk().await {
            fail(worker, err, &mut turn).await;
            return;
        }
        if !reader.use_multipart() {
            attempt_number = 1;
        }

        let chunk_start = reader.cur_chunk_start();
        let chunk_len = chunk_size.min(size - chunk_start);
        let (data_tx, mut data_rx) = mpsc::unbounded_channel::<Bytes>();

        // Reader activity: drain the wire into memory ahead of our pipe
        // turn, enforcing the per-chunk retry and min-speed budget.
        let read_side = async {
            let chunk_started = Instant::now();
            let mut attempt_started = Instant::now();
            let mut total_read: u64 = 0;
            let mut buf = BytesMut::with_capacity(chunk_len as usize);
            let result = loop {
                let read = reader.read_buf(&mut buf).await;
                let n = *read.as_ref().unwrap_or(&0);
                total_read += n as u64;
                total_downloaded += n as u64;
                if n > 0 {
                    // Hand the segment over even if it is not our turn yet;
                    // the channel is the chunk buffer.
                    let _ = data_tx.send(buf.split().freeze());
                }
                if chunk_finished(chunk_start, total_read, size, chunk_size) {
                    reader.close();
                    break Ok(());
                }

                let stalled = match &read {
                    Err(_) => true,
                    // The transport ended before the chunk did.
                    Ok(0) => true,
                    Ok(_) => false,
                };
                if last_log.elapsed() >= SPEED_LOG_INTERVAL {
                    let elapsed = time_downloading + chunk_started.elapsed();
                    info!(
                        "Worker {worker} downloading average {:.3}MBps",
                        rate_mbps(total_downloaded, elapsed)
                    );
                    last_log = Instant::now();
                }
                let too_slow = chunk_too_slow(
                    attempt_started.elapsed(),
                    chunk_started.elapsed(),
                    total_read,
                    &config,
                );
                if too_slow || stalled {
                    if attempt_number > config.retry_count {
                        break Err(FetchError::RetriesExhausted { worker });
                    }
                    match &read {
                        Err(err) => warn!(
                            "Worker {worker} failed to read current chunk, resetting connection: {err}"
                        ),
                        Ok(0) => warn!(
                            "Worker {worker} connection ended mid-chunk, resetting connection"
                        ),
                        Ok(_) => warn!(
                            "Worker {worker} too slow so far for current chunk, resetting connection"
                        ),
                    }
                    reader.reset(chunk_start + total_read);
                    if let Err(err) = reader.request_chunk().await {
                        break Err(err);
                    }
                    attempt_number += 1;
                    attempt_started = Instant::now();
                }
            };
            time_downloading += chunk_started.elapsed();
            drop(data_tx);
            result
        };

        // Writer activity: wait for the turn, then flush segments as the
        // reader posts them. The channel closing marks the chunk complete.
        let write_side = async {
            let mut writer = match turn.recv().await {
                Some(writer) => writer,
                None => return Err(FetchError::Aborted),
            };
            while let Some(segment) = data_rx.recv().await {
                writer.write(segment).await?;
            }
            Ok(writer)
        };

        let (read_result, write_result) = tokio::join!(read_side, write_side);

        match (read_result, write_result) {
            (Ok(()), Ok(writer)) => {
                if chunk_start + chunk_size < size {
                    if next.send(writer).await.is_err() {
                        // The next worker died; nothing left to coordinate.
                        return;
                    }
                } else {
                    // This worker produced the object's final bytes.
                    writer.close();
                }
                reader.advance_next_chunk();
            }
            (Err(err), Ok(writer)) => {
                warn!("Worker {worker} giving up: {err}");
                writer.fail(err).await;
                return;
            }
            (_, Err(err)) => {
                warn!("Worker {worker} stopping: {err}");
                return;
            }
        }
    }

    if !time_downloading.is_zero() {
        info!(
            "Worker {worker} total download speed {:.3}MBps",
            rate_mbps(total_downloaded, time_downloading)
        );
    }
}

/// Report a fatal error in order: wait for the write turn so every byte
/// before the failure still reaches the consumer, then poison the pipe.
async fn fail(worker: usize, err: FetchError, turn: &mut mpsc::Receiver<PipeWriter>) {
    warn!("Worker {worker} giving up: {err}");
    if let Some(writer) = turn.recv().await {
        writer.fail(err).await;
    }
}

/// The min-speed policy: once an attempt has outlived the grace period, the
/// chunk's average byte rate must stay above the configured floor.
fn chunk_too_slow(
    attempt_elapsed: Duration,
    chunk_elapsed: Duration,
    total_read: u64,
    config: &Config,
) -> bool {
    attempt_elapsed > config.min_speed_wait
        && (total_read as f64 / chunk_elapsed.as_millis() as f64)
            < config.min_speed_bytes_per_ms()
}

fn rate_mbps(bytes: u64, elapsed: Duration) -> f64 {
    bytes as f64 / 1e6 / elapsed.as_secs_f64().max(f64::EPSILON)
}
