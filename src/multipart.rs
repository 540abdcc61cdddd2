//! Incremental reader for `multipart/byteranges` response bodies.
//!
//! Parts are consumed strictly in order: [`MultipartReader::next_part`]
//! positions the reader at the start of the next part's body, and
//! [`MultipartReader::read`] yields body bytes until the part's closing
//! boundary.

use std::io;

use bytes::{Buf, BytesMut};
use memchr::memmem;
use tokio::io::AsyncReadExt;

use crate::source::SourceStream;

/// `\r\n--boundary` — the delimiter between a part body and the next
/// boundary line. The very first boundary may appear without the leading
/// CRLF.
fn delimiter(boundary: &str) -> Vec<u8> {
    let mut delim = Vec::with_capacity(boundary.len() + 4);
    delim.extend_from_slice(b"\r\n--");
    delim.extend_from_slice(boundary.as_bytes());
    delim
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartState {
    /// Before the first boundary line.
    Preamble,
    /// Inside a part body.
    InPart,
    /// A part's closing delimiter was consumed; boundary suffix pending.
    Boundary,
    /// The final `--boundary--` marker was seen.
    Finished,
}

pub struct MultipartReader {
    inner: SourceStream,
    delim: Vec<u8>,
    buf: BytesMut,
    state: PartState,
    eof: bool,
}

impl MultipartReader {
    pub fn new(inner: SourceStream, boundary: &str) -> Self {
        Self {
            inner,
            delim: delimiter(boundary),
            buf: BytesMut::new(),
            state: PartState::Preamble,
            eof: false,
        }
    }

    /// Advance to the next part, discarding any unread remainder of the
    /// current one. Returns `false` once the closing boundary is reached.
    pub async fn next_part(&mut self) -> io::Result<bool> {
        match self.state {
            PartState::Finished => return Ok(false),
            PartState::InPart => {
                // Drain the rest of the current part up to its delimiter.
                let mut sink = BytesMut::new();
                while self.read(&mut sink).await? > 0 {
                    sink.clear();
                }
            }
            PartState::Preamble => self.consume_first_delimiter().await?,
            PartState::Boundary => {}
        }

        // Positioned just past a delimiter: either the terminator `--`
        // follows, or the boundary line ends and part headers begin.
        while self.buf.len() < 2 {
            if self.fill().await? == 0 {
                return Err(truncated("stream ended after a boundary"));
            }
        }
        if &self.buf[..2] == b"--" {
            self.state = PartState::Finished;
            return Ok(false);
        }

        // Skip the rest of the boundary line and the part headers; the
        // header block (possibly empty) always ends with an empty line.
        loop {
            if let Some(pos) = memmem::find(&self.buf, b"\r\n\r\n") {
                self.buf.advance(pos + 4);
                break;
            }
            if self.fill().await? == 0 {
                return Err(truncated("stream ended inside part headers"));
            }
        }
        self.state = PartState::InPart;
        Ok(true)
    }

    /// Append body bytes of the current part to `out`.
    ///
    /// Returns 0 when the part is exhausted; a new call to
    /// [`next_part`](Self::next_part) is then required.
    pub async fn read(&mut self, out: &mut BytesMut) -> io::Result<usize> {
        if self.state != PartState::InPart {
            return Ok(0);
        }
        loop {
            if !self.buf.is_empty() {
                if let Some(pos) = memmem::find(&self.buf, &self.delim) {
                    if pos == 0 {
                        self.buf.advance(self.delim.len());
                        self.state = PartState::Boundary;
                        return Ok(0);
                    }
                    out.extend_from_slice(&self.buf[..pos]);
                    self.buf.advance(pos);
                    return Ok(pos);
                }
                // No full delimiter buffered; emit everything except a tail
                // that could be the start of one.
                let keep = partial_delim_tail(&self.buf, &self.delim);
                let emit = self.buf.len() - keep;
                if emit > 0 {
                    out.extend_from_slice(&self.buf[..emit]);
                    self.buf.advance(emit);
                    return Ok(emit);
                }
            }
            if self.fill().await? == 0 {
                return Err(truncated("stream ended inside a part body"));
            }
        }
    }

    async fn consume_first_delimiter(&mut self) -> io::Result<()> {
        // "--boundary" without the CRLF prefix, legal at stream start.
        let bare = self.delim[2..].to_vec();
        loop {
            if self.buf.len() >= bare.len() && self.buf[..bare.len()] == bare[..] {
                self.buf.advance(bare.len());
                return Ok(());
            }
            if let Some(pos) = memmem::find(&self.buf, &self.delim) {
                self.buf.advance(pos + self.delim.len());
                return Ok(());
            }
            if self.fill().await? == 0 {
                return Err(truncated("no multipart boundary found"));
            }
        }
    }

    async fn fill(&mut self) -> io::Result<usize> {
        if self.eof {
            return Ok(0);
        }
        let n = self.inner.read_buf(&mut self.buf).await?;
        if n == 0 {
            self.eof = true;
        }
        Ok(n)
    }
}

/// Length of the longest buffer suffix that is a proper prefix of `delim`.
fn partial_delim_tail(buf: &[u8], delim: &[u8]) -> usize {
    let max = delim.len().min(buf.len() + 1).saturating_sub(1);
    for k in (1..=max).rev() {
        if buf[buf.len() - k..] == delim[..k] {
            return k;
        }
    }
    0
}

fn truncated(detail: &str) -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, detail.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const BOUNDARY: &str = "f00dcafe";

    /// Build a multipart/byteranges body the way an HTTP server would.
    fn body(parts: &[&[u8]], headers: bool) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                out.extend_from_slice(b"\r\n");
            }
            out.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            if headers {
                out.extend_from_slice(b"Content-Type: application/octet-stream\r\n");
            }
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(part);
        }
        out.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        out
    }

    fn reader(bytes: Vec<u8>) -> MultipartReader {
        MultipartReader::new(Box::new(Cursor::new(bytes)), BOUNDARY)
    }

    async fn read_part(mp: &mut MultipartReader) -> Vec<u8> {
        let mut out = BytesMut::new();
        while mp.read(&mut out).await.unwrap() > 0 {}
        out.to_vec()
    }

    #[tokio::test]
    async fn reads_parts_in_order() {
        for headers in [false, true] {
            let mut mp = reader(body(&[b"hello", b"", b"worlds"], headers));
            assert!(mp.next_part().await.unwrap());
            assert_eq!(read_part(&mut mp).await, b"hello");
            assert!(mp.next_part().await.unwrap());
            assert_eq!(read_part(&mut mp).await, b"");
            assert!(mp.next_part().await.unwrap());
            assert_eq!(read_part(&mut mp).await, b"worlds");
            assert!(!mp.next_part().await.unwrap());
            assert!(!mp.next_part().await.unwrap());
        }
    }

    #[tokio::test]
    async fn part_bodies_may_contain_boundary_fragments() {
        let tricky = format!("\r\n--{BOUNDARY}X interrupted").into_bytes();
        let mut mp = reader(body(&[&tricky, b"tail"], true));
        assert!(mp.next_part().await.unwrap());
        assert_eq!(read_part(&mut mp).await, tricky);
        assert!(mp.next_part().await.unwrap());
        assert_eq!(read_part(&mut mp).await, b"tail");
        assert!(!mp.next_part().await.unwrap());
    }

    #[tokio::test]
    async fn skipping_an_unread_part_is_allowed() {
        let mut mp = reader(body(&[b"skipped entirely", b"kept"], false));
        assert!(mp.next_part().await.unwrap());
        assert!(mp.next_part().await.unwrap());
        assert_eq!(read_part(&mut mp).await, b"kept");
        assert!(!mp.next_part().await.unwrap());
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let mut full = body(&[b"hello world"], true);
        full.truncate(full.len() - 8);
        let mut mp = reader(full);
        assert!(mp.next_part().await.unwrap());
        let mut out = BytesMut::new();
        let err = loop {
            match mp.read(&mut out).await {
                Ok(0) => panic!("truncated stream terminated cleanly"),
                Ok(_) => continue,
                Err(err) => break err,
            }
        };
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn missing_boundary_is_an_error() {
        let mut mp = reader(b"plain body, not multipart at all".to_vec());
        assert!(mp.next_part().await.is_err());
    }

    #[test]
    fn partial_tail_lengths() {
        let delim = b"\r\n--b";
        assert_eq!(partial_delim_tail(b"data", delim), 0);
        assert_eq!(partial_delim_tail(b"data\r", delim), 1);
        assert_eq!(partial_delim_tail(b"data\r\n--", delim), 4);
        assert_eq!(partial_delim_tail(b"\r\n", delim), 2);
        // A full delimiter is not a partial tail.
        assert_eq!(partial_delim_tail(b"\r\n--b", delim), 0);
    }
}
