//! Async frame reader/writer for any `AsyncRead`/`AsyncWrite` stream
//!
//! Wraps the [`Frame`] wire format with buffered async I/O.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::frame::{Frame, MAX_PAYLOAD_SIZE};
use crate::error::{GatewayError, Result};
use crate::protocol::Envelope;

const INITIAL_BUF_CAPACITY: usize = 8 * 1024;

/// Async frame reader over any `AsyncRead` stream
///
/// Buffers incoming bytes and yields complete [`Frame`]s.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    max_payload: u32,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_payload(inner, MAX_PAYLOAD_SIZE)
    }

    pub fn with_max_payload(inner: R, max_payload: u32) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUF_CAPACITY),
            max_payload,
        }
    }

    /// Read the next frame. Returns `None` on clean EOF.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some((frame, consumed)) = Frame::decode(&self.buf, self.max_payload)? {
                self.buf.advance(consumed);
                return Ok(Some(frame));
            }

            let n = self
                .inner
                .read_buf(&mut self.buf)
                .await
                .map_err(|e| GatewayError::Transport(format!("Receive failed: {}", e)))?;

            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(GatewayError::Transport(
                    "Connection closed with incomplete frame".to_string(),
                ));
            }
        }
    }
}

/// Async frame writer over any `AsyncWrite` stream
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
    max_payload: u32,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self::with_max_payload(inner, MAX_PAYLOAD_SIZE)
    }

    pub fn with_max_payload(inner: W, max_payload: u32) -> Self {
        Self { inner, max_payload }
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let encoded = frame.encode(self.max_payload)?;
        self.inner
            .write_all(&encoded)
            .await
            .map_err(|e| GatewayError::Transport(format!("Send failed: {}", e)))?;
        self.inner
            .flush()
            .await
            .map_err(|e| GatewayError::Transport(format!("Send failed: {}", e)))?;
        Ok(())
    }

    /// Write one envelope as a data frame
    pub async fn write_envelope(&mut self, envelope: &Envelope) -> Result<()> {
        self.write_frame(&Frame::data(envelope.to_bytes()?)).await
    }

    /// Flush and shut down the write half
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner
            .shutdown()
            .await
            .map_err(|e| GatewayError::Transport(format!("Shutdown failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::frame::FrameType;
    use super::*;
    use crate::protocol::{Method, Request};

    #[tokio::test]
    async fn test_reader_writer_over_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let (_cr, cw) = tokio::io::split(client);
        let (sr, _sw) = tokio::io::split(server);

        let mut writer = FrameWriter::new(cw);
        let mut reader = FrameReader::new(sr);

        let envelope = Envelope::Request(Request::new("r1", Method::Supports, vec![]));
        writer.write_envelope(&envelope).await.unwrap();
        writer.write_frame(&Frame::heartbeat()).await.unwrap();
        writer.shutdown().await.unwrap();

        let first = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(first.frame_type, FrameType::Data);
        assert_eq!(Envelope::from_bytes(&first.payload).unwrap(), envelope);

        let second = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(second.frame_type, FrameType::Heartbeat);

        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_error() {
        let (client, server) = tokio::io::duplex(4096);
        let (_cr, mut cw) = tokio::io::split(client);
        let (sr, _sw) = tokio::io::split(server);

        cw.write_all(&[0x01, 0, 0, 0, 10, b'x']).await.unwrap();
        cw.shutdown().await.unwrap();

        let mut reader = FrameReader::new(sr);
        assert!(matches!(
            reader.read_frame().await,
            Err(GatewayError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let encoded = Frame::data(b"{\"partial\":true}".to_vec())
            .encode(MAX_PAYLOAD_SIZE)
            .unwrap();
        let mock = tokio_test::io::Builder::new()
            .read(&encoded[..2])
            .read(&encoded[2..9])
            .read(&encoded[9..])
            .build();

        let mut reader = FrameReader::new(mock);
        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.payload, b"{\"partial\":true}");
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_enforces_payload_cap() {
        let (client, server) = tokio::io::duplex(4096);
        let (_cr, cw) = tokio::io::split(client);
        let (sr, _sw) = tokio::io::split(server);

        let mut writer = FrameWriter::new(cw);
        writer.write_frame(&Frame::data(vec![7; 32])).await.unwrap();

        let mut reader = FrameReader::with_max_payload(sr, 16);
        assert!(reader.read_frame().await.is_err());
    }
}
