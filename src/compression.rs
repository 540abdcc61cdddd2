//! Compression detection and streaming decoders.
//!
//! Detection peeks the first four bytes of the stream and falls back to the
//! filename suffix; an explicit override flag bypasses both. The peeked
//! bytes are spliced back in front of the remaining stream.

use std::io::{self, Cursor, Read};

use flate2::read::GzDecoder;
use lz4_flex::frame::FrameDecoder;
use tracing::info;

use crate::config::Compression;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const LZ4_MAGIC: [u8; 4] = [0x04, 0x22, 0x4d, 0x18];

/// Read exactly four bytes ahead and splice them back.
///
/// When the stream holds fewer than four bytes, only what was read is
/// emitted (the archive is truncated or trivially small) and no magic
/// number is reported.
pub fn peek_magic<R: Read + 'static>(
    mut reader: R,
) -> io::Result<(Option<[u8; 4]>, Box<dyn Read>)> {
    let mut head = [0u8; 4];
    let mut filled = 0;
    while filled < head.len() {
        let n = reader.read(&mut head[filled..])?;
        if n == 0 {
            let short = head[..filled].to_vec();
            return Ok((None, Box::new(Cursor::new(short))));
        }
        filled += n;
    }
    Ok((Some(head), Box::new(Cursor::new(head).chain(reader))))
}

/// Pick the compression schema from override flag, magic number, then
/// filename extension; raw tar is the final default.
pub fn select(
    forced: Option<Compression>,
    magic: Option<[u8; 4]>,
    filename: &str,
) -> Compression {
    if let Some(forced) = forced {
        info!("Forcing {forced:?} compression");
        return forced;
    }
    if let Some(magic) = magic {
        if magic[..2] == GZIP_MAGIC {
            info!("Inferring gzip by magic number");
            return Compression::Gzip;
        }
        if magic == LZ4_MAGIC {
            info!("Inferring lz4 by magic number");
            return Compression::Lz4;
        }
    }
    if filename.ends_with("lz4") {
        info!("Inferring lz4 by file extension");
        Compression::Lz4
    } else if filename.ends_with("gz") {
        info!("Inferring gzip by file extension");
        Compression::Gzip
    } else if filename.ends_with("tar") {
        info!("Inferring raw tar by file extension");
        Compression::Tar
    } else {
        info!("Unrecognized magic number and file extension, assuming raw tar");
        Compression::Tar
    }
}

/// Wrap the stream in the matching streaming decoder.
pub fn decoder(kind: Compression, stream: Box<dyn Read>) -> Box<dyn Read> {
    match kind {
        Compression::Tar => stream,
        Compression::Gzip => Box::new(GzDecoder::new(stream)),
        Compression::Lz4 => Box::new(FrameDecoder::new(stream)),
    }
}
