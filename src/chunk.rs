//! Per-worker chunk reader.
//!
//! A worker's stripe is every `num_workers`-th chunk of the object starting
//! at its own offset. The reader hides whether chunk bytes arrive as one
//! fresh range request per chunk or as successive parts of a single
//! multipart response covering the whole stripe.

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;

use crate::error::FetchError;
use crate::multipart::MultipartReader;
use crate::source::{Source, SourceStream};

/// A chunk is done when it filled up or it reached the end of the object.
pub fn chunk_finished(start: u64, progress: u64, size: u64, chunk_size: u64) -> bool {
    progress == chunk_size || start + progress >= size
}

enum State {
    /// No open stream; the next `request_chunk` issues a request.
    Idle,
    /// One range request serving the current chunk.
    Single(SourceStream),
    /// One multipart response serving the whole stripe, one part per chunk.
    Multipart(MultipartReader),
}

pub struct ChunkReader {
    source: Arc<dyn Source>,
    size: u64,
    chunk_size: u64,
    /// Distance between consecutive chunks of this stripe.
    stride: u64,
    cur_chunk_start: u64,
    multipart: bool,
    /// Mid-chunk restart position, set by `reset`.
    resume_from: Option<u64>,
    state: State,
}

impl ChunkReader {
    pub fn new(
        source: Arc<dyn Source>,
        size: u64,
        start: u64,
        chunk_size: u64,
        num_workers: usize,
        multipart: bool,
    ) -> Self {
        Self {
            source,
            size,
            chunk_size,
            stride: num_workers as u64 * chunk_size,
            cur_chunk_start: start,
            multipart,
            resume_from: None,
            state: State::Idle,
        }
    }

    pub fn cur_chunk_start(&self) -> u64 {
        self.cur_chunk_start
    }

    pub fn use_multipart(&self) -> bool {
        self.multipart
    }

    /// Ensure a byte stream exists positioned at the start of the current
    /// chunk (or at the `reset` position within it).
    pub async fn request_chunk(&mut self) -> Result<(), FetchError> {
        match &mut self.state {
            State::Single(_) => Ok(()),
            State::Multipart(mp) => {
                if !mp.next_part().await? {
                    return Err(FetchError::Protocol(
                        "multipart response ended before the stripe was exhausted".to_string(),
                    ));
                }
                Ok(())
            }
            State::Idle => {
                let from = self.resume_from.take().unwrap_or(self.cur_chunk_start);
                if self.multipart {
                    let ranges = self.stripe_ranges(from);
                    let mut mp = self.source.get_multipart(&ranges).await?;
                    if !mp.next_part().await? {
                        return Err(FetchError::Protocol(
                            "multipart response carried no parts".to_string(),
                        ));
                    }
                    self.state = State::Multipart(mp);
                } else {
                    let end = (self.cur_chunk_start + self.chunk_size).min(self.size);
                    let stream = self.source.get_range(from, end).await?;
                    self.state = State::Single(stream);
                }
                Ok(())
            }
        }
    }

    /// Append bytes from the current chunk's stream to `buf`.
    ///
    /// A return of 0 before the chunk is finished means the transport ended
    /// early; the caller decides whether to reset.
    pub async fn read_buf(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        match &mut self.state {
            State::Single(stream) => stream.read_buf(buf).await,
            State::Multipart(mp) => mp.read(buf).await,
            State::Idle => Err(io::Error::other("no active chunk request")),
        }
    }

    /// Abort the current stream; the next `request_chunk` re-requests
    /// starting at `from`. In multipart mode the entire remaining stripe is
    /// re-requested.
    pub fn reset(&mut self, from: u64) {
        self.state = State::Idle;
        self.resume_from = Some(from);
    }

    /// Move to this worker's next chunk.
    pub fn advance_next_chunk(&mut self) {
        self.cur_chunk_start += self.stride;
        self.resume_from = None;
        if matches!(self.state, State::Single(_)) {
            self.state = State::Idle;
        }
    }

    /// Finish the current chunk's stream. A multipart stripe stays open for
    /// the following parts.
    pub fn close(&mut self) {
        if matches!(self.state, State::Single(_)) {
            self.state = State::Idle;
        }
    }

    /// Half-open ranges for the remaining stripe, the first one starting at
    /// `from` inside the current chunk.
    fn stripe_ranges(&self, from: u64) -> Vec<(u64, u64)> {
        let mut ranges = Vec::new();
        let first_end = (self.cur_chunk_start + self.chunk_size).min(self.size);
        if from < first_end {
            ranges.push((from, first_end));
        }
        let mut start = self.cur_chunk_start + self.stride;
        while start < self.size {
            ranges.push((start, (start + self.chunk_size).min(self.size)));
            start += self.stride;
        }
        ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_finished_on_full_chunk_or_object_end() {
        assert!(chunk_finished(0, 8, 100, 8));
        assert!(!chunk_finished(0, 7, 100, 8));
        // Short final chunk.
        assert!(chunk_finished(96, 4, 100, 8));
        assert!(!chunk_finished(96, 3, 100, 8));
        // Empty object.
        assert!(chunk_finished(0, 0, 0, 8));
    }

    struct NullSource;

    #[async_trait::async_trait]
    impl Source for NullSource {
        async fn probe(&self) -> Result<crate::source::FileInfo, FetchError> {
            unimplemented!()
        }
        async fn get_all(&self) -> Result<SourceStream, FetchError> {
            unimplemented!()
        }
        async fn get_range(&self, _: u64, _: u64) -> Result<SourceStream, FetchError> {
            unimplemented!()
        }
        async fn get_multipart(&self, _: &[(u64, u64)]) -> Result<MultipartReader, FetchError> {
            unimplemented!()
        }
    }

    fn reader(size: u64, start: u64, chunk: u64, workers: usize) -> ChunkReader {
        ChunkReader::new(Arc::new(NullSource), size, start, chunk, workers, true)
    }

    #[test]
    fn stripe_ranges_cover_every_nth_chunk() {
        // Worker 1 of 4, chunk size 10, object of 100 bytes.
        let r = reader(100, 10, 10, 4);
        assert_eq!(r.stripe_ranges(10), vec![(10, 20), (50, 60), (90, 100)]);
    }

    #[test]
    fn stripe_ranges_resume_mid_chunk() {
        let r = reader(100, 10, 10, 4);
        assert_eq!(r.stripe_ranges(17), vec![(17, 20), (50, 60), (90, 100)]);
    }

    #[test]
    fn stripe_ranges_clip_the_final_chunk() {
        // Worker 3 of 4: chunks at 30, 70; the object ends at 75.
        let r = reader(75, 30, 10, 4);
        assert_eq!(r.stripe_ranges(30), vec![(30, 40), (70, 75)]);
    }

    #[test]
    fn advancing_moves_by_a_full_stride() {
        let mut r = reader(1000, 10, 10, 4);
        r.advance_next_chunk();
        assert_eq!(r.cur_chunk_start(), 50);
        r.advance_next_chunk();
        assert_eq!(r.cur_chunk_start(), 90);
    }
}
