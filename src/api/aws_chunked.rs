//! AWS chunked transfer encoding decoder
//!
//! When AWS SDK uses STREAMING-AWS4-HMAC-SHA256-PAYLOAD, the body is sent in a chunked format:
//!
//! ```text
//! <hex-chunk-size>;chunk-signature=<signature>\r\n
//! <chunk-data>\r\n
//! ...
//! 0;chunk-signature=<signature>\r\n
//! ```
//!
//! The decoder is a filter over the request-body stream: it holds at most
//! one partial chunk header plus the current chunk's unread remainder, and
//! re-frames data downstream as it arrives. Chunk signatures are not
//! verified here — SigV4 validity is the auth layer's concern; this module
//! only strips the framing. The decoded byte count is checked against
//! `x-amz-decoded-content-length` at the terminator chunk.

use axum::http::HeaderMap;
use bytes::{Buf, Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::Stream;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;

/// Longest accepted chunk-header line (hex size + extensions).
const MAX_HEADER_LINE: usize = 4096;

#[derive(Debug, Error)]
pub enum ChunkedError {
    #[error("malformed chunked framing: {0}")]
    Malformed(String),

    #[error("decoded length {actual} does not match declared x-amz-decoded-content-length {expected}")]
    LengthMismatch { expected: u64, actual: u64 },

    #[error("body stream failed: {0}")]
    Stream(String),
}

/// Check if the request uses AWS chunked encoding
pub fn is_aws_chunked(headers: &HeaderMap) -> bool {
    headers
        .get("x-amz-content-sha256")
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v == "STREAMING-AWS4-HMAC-SHA256-PAYLOAD"
                || v == "STREAMING-AWS4-HMAC-SHA256-PAYLOAD-TRAILER"
                || v == "STREAMING-UNSIGNED-PAYLOAD-TRAILER"
        })
        .unwrap_or(false)
}

/// Get the decoded content length from headers
pub fn get_decoded_content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("x-amz-decoded-content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DecodeState {
    /// Reading a `<hex-size>;chunk-signature=...\r\n` line.
    Header,
    /// Inside a chunk's payload.
    Data { remaining: u64 },
    /// Expecting the `\r\n` that closes a chunk's payload.
    DataCrlf,
    /// Past the zero-size terminator; trailing headers (if any) are
    /// consumed and ignored.
    Trailer,
}

/// Incremental decoder. Feed raw transport bytes in, get payload segments
/// out; never retains more than one chunk header plus unread payload.
pub struct ChunkDecoder {
    buf: BytesMut,
    state: DecodeState,
    decoded: u64,
    expected: Option<u64>,
}

impl ChunkDecoder {
    pub fn new(expected: Option<u64>) -> Self {
        Self {
            buf: BytesMut::new(),
            state: DecodeState::Header,
            decoded: 0,
            expected,
        }
    }

    /// Consume transport bytes, appending decoded payload segments to `out`.
    pub fn feed(&mut self, input: &[u8], out: &mut Vec<Bytes>) -> Result<(), ChunkedError> {
        self.buf.extend_from_slice(input);
        loop {
            match self.state {
                DecodeState::Header => {
                    let Some(line_end) = find_crlf(&self.buf) else {
                        if self.buf.len() > MAX_HEADER_LINE {
                            return Err(ChunkedError::Malformed(
                                "chunk header line too long".to_string(),
                            ));
                        }
                        return Ok(());
                    };
                    let line = self.buf.split_to(line_end + 2);
                    let header = std::str::from_utf8(&line[..line_end])
                        .map_err(|_| ChunkedError::Malformed("chunk header not UTF-8".to_string()))?;
                    let size_hex = header.split(';').next().unwrap_or("").trim();
                    let size = u64::from_str_radix(size_hex, 16).map_err(|_| {
                        ChunkedError::Malformed(format!("invalid chunk size '{size_hex}'"))
                    })?;
                    self.state = if size == 0 {
                        DecodeState::Trailer
                    } else {
                        DecodeState::Data { remaining: size }
                    };
                }
                DecodeState::Data { remaining } => {
                    if self.buf.is_empty() {
                        return Ok(());
                    }
                    let take = remaining.min(self.buf.len() as u64) as usize;
                    out.push(self.buf.split_to(take).freeze());
                    self.decoded += take as u64;
                    let left = remaining - take as u64;
                    self.state = if left == 0 {
                        DecodeState::DataCrlf
                    } else {
                        DecodeState::Data { remaining: left }
                    };
                }
                DecodeState::DataCrlf => {
                    if self.buf.len() < 2 {
                        return Ok(());
                    }
                    if &self.buf[..2] != b"\r\n" {
                        return Err(ChunkedError::Malformed(
                            "missing CRLF after chunk data".to_string(),
                        ));
                    }
                    self.buf.advance(2);
                    self.state = DecodeState::Header;
                }
                DecodeState::Trailer => {
                    // Trailing checksum headers are consumed without
                    // interpretation; the payload ended at the zero chunk.
                    self.buf.clear();
                    return Ok(());
                }
            }
        }
    }

    /// Signal transport EOF. Verifies the terminator was seen and the
    /// decoded length matches the declared header.
    pub fn finish(&self) -> Result<(), ChunkedError> {
        if self.state != DecodeState::Trailer {
            return Err(ChunkedError::Malformed(
                "body ended before the zero-size terminator chunk".to_string(),
            ));
        }
        if let Some(expected) = self.expected {
            if self.decoded != expected {
                return Err(ChunkedError::LengthMismatch {
                    expected,
                    actual: self.decoded,
                });
            }
        }
        Ok(())
    }

    pub fn decoded_len(&self) -> u64 {
        self.decoded
    }
}

/// Decode a fully buffered AWS-chunked body.
pub fn decode_aws_chunked(body: &Bytes, expected: Option<u64>) -> Result<Bytes, ChunkedError> {
    let mut decoder = ChunkDecoder::new(expected);
    let mut segments = Vec::new();
    decoder.feed(body, &mut segments)?;
    decoder.finish()?;
    let mut out = BytesMut::with_capacity(decoder.decoded_len() as usize);
    for segment in segments {
        out.extend_from_slice(&segment);
    }
    Ok(out.freeze())
}

/// Streaming filter over a request-body stream.
pub struct AwsChunkedStream {
    inner: BoxStream<'static, Result<Bytes, ChunkedError>>,
    decoder: ChunkDecoder,
    ready: VecDeque<Bytes>,
    done: bool,
}

impl AwsChunkedStream {
    pub fn new(
        inner: BoxStream<'static, Result<Bytes, ChunkedError>>,
        expected: Option<u64>,
    ) -> Self {
        Self {
            inner,
            decoder: ChunkDecoder::new(expected),
            ready: VecDeque::new(),
            done: false,
        }
    }
}

impl Stream for AwsChunkedStream {
    type Item = Result<Bytes, ChunkedError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(segment) = self.ready.pop_front() {
                return Poll::Ready(Some(Ok(segment)));
            }
            if self.done {
                return Poll::Ready(None);
            }
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    let mut out = Vec::new();
                    if let Err(e) = self.decoder.feed(&chunk, &mut out) {
                        self.done = true;
                        return Poll::Ready(Some(Err(e)));
                    }
                    self.ready.extend(out);
                }
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    self.done = true;
                    if let Err(e) = self.decoder.finish() {
                        return Poll::Ready(Some(Err(e)));
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Find the position of \r\n in a byte slice
fn find_crlf(data: &[u8]) -> Option<usize> {
    (0..data.len().saturating_sub(1)).find(|&i| data[i] == b'\r' && data[i + 1] == b'\n')
}
