//! Chunk Framer
//!
//! Turns the unbounded, chunked response body of the filtered stream into
//! discrete newline-delimited frames.
//!
//! # Wire Format
//!
//! ```text
//! {"data":{...},"includes":{...}}\r\n
//! \r\n                                  <- keep-alive, discarded
//! {"data":{...},"includes":{...}}\r\n
//! ```
//!
//! A frame boundary is recognized at every `\n`. A trailing `\r` before the
//! `\n` is stripped along with it. Chunk boundaries of the HTTP body do not
//! need to line up with frame boundaries: bytes are accumulated until the
//! delimiter shows up.
//!
//! # Memory
//!
//! The framer owns a single buffer that is cleared at the start of every frame
//! read and reused across calls. A line longer than the configured maximum is
//! rejected with [`std::io::ErrorKind::InvalidData`] instead of growing the
//! buffer without bound.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::trace;

/// Default maximum frame size (1 MiB)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Initial capacity of the frame buffer
const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Splits a buffered byte source into newline-delimited frames
#[derive(Debug)]
pub struct ChunkFramer<R> {
    reader: R,
    buf: Vec<u8>,
    max_frame_bytes: usize,
    frames: u64,
    keep_alives: u64,
    finished: bool,
}

impl<R> ChunkFramer<R>
where
    R: AsyncBufRead + Unpin,
{
    /// Create a framer with the default frame size limit
    pub fn new(reader: R) -> Self {
        Self::with_max_frame_bytes(reader, DEFAULT_MAX_FRAME_BYTES)
    }

    /// Create a framer with a custom frame size limit
    pub fn with_max_frame_bytes(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(INITIAL_BUFFER_CAPACITY.min(max_frame_bytes)),
            max_frame_bytes,
            frames: 0,
            keep_alives: 0,
            finished: false,
        }
    }

    /// Number of frames yielded so far
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Number of keep-alive lines discarded so far
    #[must_use]
    pub fn keep_alives(&self) -> u64 {
        self.keep_alives
    }

    /// Read the next non-empty frame
    ///
    /// Returns:
    /// - `Ok(Some(frame))` with the line contents, delimiter stripped
    /// - `Ok(None)` once the source is exhausted
    /// - `Err(e)` on any I/O error other than end-of-input
    ///
    /// The returned slice borrows the internal buffer and is only valid until
    /// the next call.
    pub async fn next_frame(&mut self) -> io::Result<Option<&[u8]>> {
        if self.finished {
            return Ok(None);
        }

        loop {
            self.buf.clear();
            let terminated = self.read_line().await?;

            if !terminated {
                self.finished = true;
                if self.buf.is_empty() {
                    return Ok(None);
                }
                self.frames += 1;
                return Ok(Some(&self.buf));
            }

            strip_line_ending(&mut self.buf);
            if self.buf.is_empty() {
                self.keep_alives += 1;
                trace!(keep_alives = self.keep_alives, "Keep-alive received");
                continue;
            }

            self.frames += 1;
            return Ok(Some(&self.buf));
        }
    }

    /// Append bytes up to and including the next `\n` to the buffer
    ///
    /// Returns `false` if the source ended before a delimiter was found.
    async fn read_line(&mut self) -> io::Result<bool> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(false);
            }

            let (consumed, terminated) = match available.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    self.buf.extend_from_slice(&available[..=pos]);
                    (pos + 1, true)
                }
                None => {
                    self.buf.extend_from_slice(available);
                    (available.len(), false)
                }
            };
            self.reader.consume(consumed);

            // Allow room for the line ending itself
            if self.buf.len() > self.max_frame_bytes + 2 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "frame exceeds maximum size of {} bytes",
                        self.max_frame_bytes
                    ),
                ));
            }

            if terminated {
                return Ok(true);
            }
        }
    }
}

/// Strip a trailing `\n` and every `\r` before it
fn strip_line_ending(buf: &mut Vec<u8>) {
    if buf.last() == Some(&b'\n') {
        buf.pop();
        while buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::BufReader;

    async fn collect<R: AsyncBufRead + Unpin>(framer: &mut ChunkFramer<R>) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Some(frame) = framer.next_frame().await.unwrap() {
            frames.push(frame.to_vec());
        }
        frames
    }

    #[tokio::test]
    async fn test_splits_on_every_newline() {
        let input: &[u8] = b"{\"a\":1}\n{\"b\":2}\n";
        let mut framer = ChunkFramer::new(input);

        let frames = collect(&mut framer).await;
        assert_eq!(frames, vec![b"{\"a\":1}".to_vec(), b"{\"b\":2}".to_vec()]);
        assert_eq!(framer.frames(), 2);
    }

    #[tokio::test]
    async fn test_strips_crlf() {
        let input: &[u8] = b"{\"a\":1}\r\n{\"b\":2}\r\n";
        let mut framer = ChunkFramer::new(input);

        let frames = collect(&mut framer).await;
        assert_eq!(frames, vec![b"{\"a\":1}".to_vec(), b"{\"b\":2}".to_vec()]);
    }

    #[tokio::test]
    async fn test_keep_alives_are_discarded() {
        let input: &[u8] = b"\r\n\n{\"a\":1}\r\n\r\n\r\n{\"b\":2}\n\n";
        let mut framer = ChunkFramer::new(input);

        let frames = collect(&mut framer).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(framer.keep_alives(), 5);
    }

    #[tokio::test]
    async fn test_trailing_bytes_without_newline_are_returned_once() {
        let input: &[u8] = b"{\"a\":1}\n{\"partial\":true}";
        let mut framer = ChunkFramer::new(input);

        assert_eq!(framer.next_frame().await.unwrap(), Some(&b"{\"a\":1}"[..]));
        assert_eq!(
            framer.next_frame().await.unwrap(),
            Some(&b"{\"partial\":true}"[..])
        );
        assert_eq!(framer.next_frame().await.unwrap(), None);
        assert_eq!(framer.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_empty_source_terminates() {
        let input: &[u8] = b"";
        let mut framer = ChunkFramer::new(input);
        assert_eq!(framer.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_partial_reads_across_chunks() {
        let mock = tokio_test::io::Builder::new()
            .read(b"{\"id\":")
            .read(b"\"1\"}\r")
            .read(b"\n\r")
            .read(b"\n{\"id\":\"2\"}")
            .read(b"\r\n")
            .build();
        let mut framer = ChunkFramer::new(BufReader::new(mock));

        let frames = collect(&mut framer).await;
        assert_eq!(
            frames,
            vec![b"{\"id\":\"1\"}".to_vec(), b"{\"id\":\"2\"}".to_vec()]
        );
        assert_eq!(framer.keep_alives(), 1);
    }

    #[tokio::test]
    async fn test_read_error_propagates() {
        let mock = tokio_test::io::Builder::new()
            .read(b"{\"id\":\"1\"}\n")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let mut framer = ChunkFramer::new(BufReader::new(mock));

        assert!(framer.next_frame().await.unwrap().is_some());
        let err = framer.next_frame().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let input = vec![b'x'; 64];
        let mut framer = ChunkFramer::with_max_frame_bytes(&input[..], 16);

        let err = framer.next_frame().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_buffer_is_not_appended_across_frames() {
        let input: &[u8] = b"first-frame-is-long\nb\n";
        let mut framer = ChunkFramer::new(input);

        assert_eq!(
            framer.next_frame().await.unwrap(),
            Some(&b"first-frame-is-long"[..])
        );
        assert_eq!(framer.next_frame().await.unwrap(), Some(&b"b"[..]));
    }

    #[test]
    fn test_strip_line_ending() {
        let mut buf = b"abc\r\n".to_vec();
        strip_line_ending(&mut buf);
        assert_eq!(buf, b"abc");

        let mut buf = b"abc\n".to_vec();
        strip_line_ending(&mut buf);
        assert_eq!(buf, b"abc");

        let mut buf = b"\r\n".to_vec();
        strip_line_ending(&mut buf);
        assert!(buf.is_empty());

        let mut buf = b"\r\r\n".to_vec();
        strip_line_ending(&mut buf);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_repeated_carriage_returns_are_keep_alives() {
        let input: &[u8] = b"\r\r\n{\"a\":1}\r\n";
        let mut framer = ChunkFramer::new(input);

        assert_eq!(framer.next_frame().await.unwrap(), Some(&b"{\"a\":1}"[..]));
        assert_eq!(framer.keep_alives(), 1);
        assert_eq!(framer.next_frame().await.unwrap(), None);
    }
}
