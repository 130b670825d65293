//! Outbound frame writer
//!
//! [`FrameWriter`] owns the write half of a connection. Each call encodes one
//! logical message or control frame and flushes it before returning, so a
//! single task driving the writer yields strictly ordered, never interleaved
//! output.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::CloseCode;
use crate::deflate::{DeflateConfig, DeflateEncoder};
use crate::error::{Error, Result};
use crate::frame::{OpCode, encode_frame, encode_frame_with_rsv};
use crate::{MAX_CONTROL_PAYLOAD, MAX_FRAME_HEADER_SIZE};

/// Longest close reason that fits next to the status code
pub const MAX_CLOSE_REASON: usize = MAX_CONTROL_PAYLOAD - 2;

/// What a single write put on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Written {
    /// Frames written
    pub frames: usize,
    /// Bytes written, headers included
    pub bytes: usize,
}

/// Server-side frame writer
pub struct FrameWriter<W> {
    io: W,
    encoder: Option<DeflateEncoder>,
    auto_frame_size: usize,
    buf: BytesMut,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    /// Create a writer
    ///
    /// Messages larger than `auto_frame_size` are split into continuation
    /// frames. `deflate` holds the negotiated compression parameters.
    pub fn new(io: W, auto_frame_size: usize, deflate: Option<&DeflateConfig>) -> Self {
        Self {
            io,
            encoder: deflate.map(DeflateConfig::encoder),
            auto_frame_size: auto_frame_size.max(1),
            buf: BytesMut::with_capacity(MAX_FRAME_HEADER_SIZE + auto_frame_size.min(64 * 1024)),
        }
    }

    /// Encode a data message into the internal buffer
    ///
    /// The payload is compressed first when compression was negotiated and
    /// the encoder finds it worthwhile. RSV1 is set on the first frame only.
    pub fn encode_message(&mut self, payload: &[u8], binary: bool) -> Result<usize> {
        let compressed = match self.encoder.as_mut() {
            Some(encoder) => encoder.compress(payload)?,
            None => None,
        };
        let rsv1 = compressed.is_some();
        let data = compressed.as_deref().unwrap_or(payload);

        let opcode = if binary { OpCode::Binary } else { OpCode::Text };

        if data.is_empty() {
            encode_frame_with_rsv(&mut self.buf, opcode, data, true, None, rsv1);
            return Ok(1);
        }

        let total = data.len().div_ceil(self.auto_frame_size);
        for (i, chunk) in data.chunks(self.auto_frame_size).enumerate() {
            let first = i == 0;
            let op = if first { opcode } else { OpCode::Continuation };
            encode_frame_with_rsv(&mut self.buf, op, chunk, i + 1 == total, None, rsv1 && first);
        }

        Ok(total)
    }

    /// Write a data message and flush it
    pub async fn write_message(&mut self, payload: &[u8], binary: bool) -> Result<Written> {
        let frames = self.encode_message(payload, binary)?;
        let bytes = self.flush_buf().await?;
        Ok(Written { frames, bytes })
    }

    /// Write a ping, pong or close frame and flush it
    pub async fn write_control(&mut self, opcode: OpCode, payload: &[u8]) -> Result<Written> {
        if !opcode.is_control() {
            return Err(Error::Protocol("not a control opcode"));
        }
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(Error::Protocol("control frame too large"));
        }

        encode_frame(&mut self.buf, opcode, payload, true, None);
        let bytes = self.flush_buf().await?;
        Ok(Written { frames: 1, bytes })
    }

    /// Write a close frame
    ///
    /// [`CloseCode::NONE`] produces a close frame without a status code.
    pub async fn write_close(&mut self, code: u16, reason: &str) -> Result<Written> {
        let payload = close_payload(code, reason)?;
        self.write_control(OpCode::Close, &payload).await
    }

    /// Shut down the write side of the socket
    pub async fn shutdown(&mut self) -> Result<()> {
        self.io.shutdown().await?;
        Ok(())
    }

    async fn flush_buf(&mut self) -> Result<usize> {
        let bytes = self.buf.len();
        let result = async {
            self.io.write_all(&self.buf).await?;
            self.io.flush().await
        }
        .await;
        self.buf.clear();
        result?;
        Ok(bytes)
    }
}

/// Build a close frame payload
pub fn close_payload(code: u16, reason: &str) -> Result<BytesMut> {
    if reason.len() > MAX_CLOSE_REASON {
        return Err(Error::CloseReasonTooLong(reason.len()));
    }

    let mut payload = BytesMut::with_capacity(2 + reason.len());
    if code != CloseCode::NONE {
        payload.put_u16(code);
        payload.put_slice(reason.as_bytes());
    }
    Ok(payload)
}

/// Cut a reason down to the close frame limit on a character boundary
pub fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}
