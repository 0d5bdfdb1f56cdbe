//! Length-prefixed frame codec.
//!
//! Wire format:
//! ```text
//! [8 bytes: payload length (u64 LE)]
//! [payload bytes]
//! ```
//!
//! The length counts payload bytes only.  Payloads are opaque here; upper
//! layers treat them as UTF-8 JSON, whose smallest value (`{}`) sets the
//! two-byte minimum.
//!
//! [`FrameReader`] and [`FrameWriter`] wrap a blocking [`std::io`]
//! stream, or with the `async` feature a `tokio::io` stream.  The forwarder
//! stub uses the blocking side; the host loop and router use the async side.
//!
//! Payload buffers grow as bytes arrive, so a bogus header costs at most
//! [`PREALLOC_LIMIT`] bytes up front no matter what length it declares.

use std::io::{self, Read, Write};

#[cfg(feature = "async")]
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtoError, Result};

/// Size of the length header in bytes.
pub const HEADER_LEN: usize = 8;

/// Smallest payload a well-formed frame may carry.
pub const MIN_PAYLOAD_LEN: u64 = 2;

/// Default cap on declared payload sizes for long-running readers (256 MiB).
pub const DEFAULT_MAX_PAYLOAD: u64 = 256 * 1024 * 1024;

/// Largest buffer reserved before any payload byte has been read.
pub const PREALLOC_LIMIT: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Pure encode / header decode
// ---------------------------------------------------------------------------

/// Encode `payload` as a complete frame (header followed by payload).
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&encode_header(payload.len()));
    buf.extend_from_slice(payload);
    buf
}

/// Encode only the length header for a payload of `len` bytes.
pub fn encode_header(len: usize) -> [u8; HEADER_LEN] {
    (len as u64).to_le_bytes()
}

/// Validate a complete header and return the declared payload length.
pub fn decode_header(header: [u8; HEADER_LEN], max_payload: Option<u64>) -> Result<u64> {
    let size = u64::from_le_bytes(header);
    if size < MIN_PAYLOAD_LEN {
        return Err(ProtoError::InvalidPayloadSize { size });
    }
    match max_payload {
        Some(limit) if size > limit => Err(ProtoError::PayloadTooLarge { size, limit }),
        _ => Ok(size),
    }
}

/// Convert a declared length to an in-memory size.
fn payload_len(size: u64) -> Result<usize> {
    usize::try_from(size).map_err(|_| ProtoError::PayloadTooLarge {
        size,
        limit: usize::MAX as u64,
    })
}

fn check_complete(payload: &[u8], size: u64) -> Result<()> {
    let actual = payload.len() as u64;
    if actual < size {
        return Err(ProtoError::TruncatedPayload {
            expected: size,
            actual,
        });
    }
    Ok(())
}

/// Outcome of filling a header buffer.
fn classify_header(read: usize) -> Result<bool> {
    match read {
        0 => Ok(false),
        HEADER_LEN => Ok(true),
        read => Err(ProtoError::TruncatedHeader { read }),
    }
}

// ---------------------------------------------------------------------------
// FrameReader
// ---------------------------------------------------------------------------

/// Reads frames from a byte stream.
///
/// Bytes past a frame boundary stay in the wrapped stream (or its buffer)
/// for the next call, so a buffered stream can be shared across frames
/// without losing data.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    max_payload: Option<u64>,
}

impl<R> FrameReader<R> {
    /// Wrap a stream with no payload size cap.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            max_payload: None,
        }
    }

    /// Reject frames whose declared length exceeds `limit`.
    pub fn with_max_payload(mut self, limit: u64) -> Self {
        self.max_payload = Some(limit);
        self
    }

    /// The configured payload cap, if any.
    pub fn max_payload(&self) -> Option<u64> {
        self.max_payload
    }

    /// Borrow the wrapped stream.
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Unwrap the reader, returning the stream.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> FrameReader<R> {
    /// Read the next frame, blocking.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly before any header
    /// byte.
    pub fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut header = [0u8; HEADER_LEN];
        let read = fill_blocking(&mut self.inner, &mut header)?;
        if !classify_header(read)? {
            return Ok(None);
        }
        let size = decode_header(header, self.max_payload)?;

        let mut payload = Vec::with_capacity(payload_len(size)?.min(PREALLOC_LIMIT));
        (&mut self.inner).take(size).read_to_end(&mut payload)?;
        check_complete(&payload, size)?;
        Ok(Some(payload))
    }
}

#[cfg(feature = "async")]
impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Read the next frame.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly before any header
    /// byte.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut header = [0u8; HEADER_LEN];
        let read = fill_async(&mut self.inner, &mut header).await?;
        if !classify_header(read)? {
            return Ok(None);
        }
        let size = decode_header(header, self.max_payload)?;

        let mut payload = Vec::with_capacity(payload_len(size)?.min(PREALLOC_LIMIT));
        (&mut self.inner).take(size).read_to_end(&mut payload).await?;
        check_complete(&payload, size)?;
        Ok(Some(payload))
    }
}

/// Read until `buf` is full or the stream ends; return bytes read.
fn fill_blocking<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(feature = "async")]
async fn fill_async<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

// ---------------------------------------------------------------------------
// FrameWriter
// ---------------------------------------------------------------------------

/// Writes frames to a byte stream, flushing after each frame.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
}

impl<W> FrameWriter<W> {
    /// Wrap a stream.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Borrow the wrapped stream.
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Unwrap the writer, returning the stream.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> FrameWriter<W> {
    /// Write one frame and flush, blocking.
    pub fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        self.inner.write_all(&encode_header(payload.len()))?;
        self.inner.write_all(payload)?;
        self.inner.flush()?;
        Ok(())
    }
}

#[cfg(feature = "async")]
impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Write one frame and flush.
    pub async fn send_frame(&mut self, payload: &[u8]) -> Result<()> {
        self.inner.write_all(&encode_header(payload.len())).await?;
        self.inner.write_all(payload).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the write half so the peer observes end-of-stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn header_with_len(len: u64) -> Vec<u8> {
        len.to_le_bytes().to_vec()
    }

    #[test]
    fn encode_prepends_little_endian_length() {
        let frame = encode(b"{}");
        assert_eq!(frame, vec![2, 0, 0, 0, 0, 0, 0, 0, b'{', b'}']);
    }

    #[test]
    fn encoded_frames_decode_back() {
        let payloads: [&[u8]; 3] = [b"{}", b"{\"a\":1}", &[0xff; 300]];
        let mut stream = Vec::new();
        for p in payloads {
            stream.extend(encode(p));
        }

        let mut reader = FrameReader::new(Cursor::new(stream));
        for p in payloads {
            assert_eq!(reader.read_frame().unwrap().as_deref(), Some(p));
        }
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn empty_stream_is_end_of_stream() {
        let mut reader = FrameReader::new(Cursor::new(Vec::new()));
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn undersized_lengths_rejected() {
        for len in [0u64, 1] {
            let mut stream = header_with_len(len);
            stream.extend_from_slice(b"xx");
            let mut reader = FrameReader::new(Cursor::new(stream));
            let err = reader.read_frame().unwrap_err();
            assert!(
                matches!(err, ProtoError::InvalidPayloadSize { size } if size == len),
                "unexpected error: {err:?}"
            );
        }
    }

    #[test]
    fn five_header_bytes_is_truncated_header() {
        let mut reader = FrameReader::new(Cursor::new(vec![10, 0, 0, 0, 0]));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, ProtoError::TruncatedHeader { read: 5 }));
    }

    #[test]
    fn short_payload_is_truncated_payload() {
        let mut stream = header_with_len(10);
        stream.extend_from_slice(b"abcd");
        let mut reader = FrameReader::new(Cursor::new(stream));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(
            err,
            ProtoError::TruncatedPayload {
                expected: 10,
                actual: 4
            }
        ));
    }

    #[test]
    fn payload_cap_rejects_before_allocating() {
        let stream = header_with_len(u64::MAX);
        let mut reader = FrameReader::new(Cursor::new(stream)).with_max_payload(1024);
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(
            err,
            ProtoError::PayloadTooLarge {
                size: u64::MAX,
                limit: 1024
            }
        ));
    }

    #[test]
    fn huge_declared_length_without_cap_is_truncated_not_allocated() {
        let mut stream = header_with_len(1 << 40);
        stream.extend_from_slice(b"only a few bytes");
        let mut reader = FrameReader::new(Cursor::new(stream));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(
            err,
            ProtoError::TruncatedPayload {
                expected: 0x100_0000_0000,
                actual: 16
            }
        ));
    }

    #[test]
    fn all_ones_header_never_panics() {
        let mut reader = FrameReader::new(Cursor::new(vec![0xff; HEADER_LEN]));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(
            err,
            ProtoError::PayloadTooLarge { .. } | ProtoError::TruncatedPayload { actual: 0, .. }
        ));
    }

    #[test]
    fn writer_emits_header_and_payload() {
        let mut writer = FrameWriter::new(Vec::new());
        writer.write_frame(b"hello").unwrap();
        assert_eq!(writer.into_inner(), encode(b"hello"));
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn async_reader_reassembles_split_writes() {
        let (mut tx, rx) = tokio::io::duplex(4);
        let writer = tokio::spawn(async move {
            let frame = encode(b"split across chunks");
            for chunk in frame.chunks(3) {
                tx.write_all(chunk).await.unwrap();
            }
            tx.write_all(&encode(b"{}")).await.unwrap();
        });

        let mut reader = FrameReader::new(rx);
        let first = reader.next_frame().await.unwrap();
        assert_eq!(first.as_deref(), Some(&b"split across chunks"[..]));
        let second = reader.next_frame().await.unwrap();
        assert_eq!(second.as_deref(), Some(&b"{}"[..]));
        writer.await.unwrap();
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn async_truncated_header() {
        let mut reader = FrameReader::new(Cursor::new(vec![1, 2, 3, 4, 5]));
        let err = reader.next_frame().await.unwrap_err();
        assert!(matches!(err, ProtoError::TruncatedHeader { read: 5 }));
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn async_writer_round_trip() {
        let (tx, rx) = tokio::io::duplex(64);
        let mut writer = FrameWriter::new(tx);
        writer.send_frame(b"{\"ping\":1}").await.unwrap();
        writer.shutdown().await.unwrap();
        drop(writer);

        let mut reader = FrameReader::new(rx);
        let frame = reader.next_frame().await.unwrap();
        assert_eq!(frame.as_deref(), Some(&b"{\"ping\":1}"[..]));
        assert!(reader.next_frame().await.unwrap().is_none());
    }
}
