//! Streamed inbound messages
//!
//! The application receives each message as a [`Message`] as soon as its
//! first frame arrives. Later fragments are pushed into the handle while the
//! application reads it, either chunk by chunk through [`Stream`] or all at
//! once with [`Message::buffer`].

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Handle to an inbound message
///
/// The stream ends when the final fragment has been delivered. If the client
/// goes away first, the stream yields [`Error::ClientGone`].
#[derive(Debug)]
pub struct Message {
    binary: bool,
    rx: mpsc::UnboundedReceiver<Result<Bytes>>,
}

/// Producing side of a [`Message`], owned by the read loop
#[derive(Debug)]
pub(crate) struct MessageSender {
    tx: mpsc::UnboundedSender<Result<Bytes>>,
}

/// Create a connected sender and message handle
pub(crate) fn channel(binary: bool) -> (MessageSender, Message) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MessageSender { tx }, Message { binary, rx })
}

impl MessageSender {
    /// Push a fragment; empty fragments are skipped
    pub(crate) fn push(&self, chunk: Bytes) {
        if !chunk.is_empty() {
            // The application may drop the handle without reading it
            let _ = self.tx.send(Ok(chunk));
        }
    }

    /// Fail the message because the client went away
    pub(crate) fn fail(self) {
        let _ = self.tx.send(Err(Error::ClientGone));
    }
}

impl Message {
    /// Whether this is a binary message
    #[inline]
    pub fn is_binary(&self) -> bool {
        self.binary
    }

    /// Whether this is a text message
    #[inline]
    pub fn is_text(&self) -> bool {
        !self.binary
    }

    /// Receive the next chunk
    ///
    /// Returns `None` once the message is complete.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        self.rx.recv().await
    }

    /// Wait for the whole message and return it as one buffer
    pub async fn buffer(mut self) -> Result<Bytes> {
        let first = match self.rx.recv().await {
            Some(chunk) => chunk?,
            None => return Ok(Bytes::new()),
        };

        let mut buf: Option<BytesMut> = None;
        while let Some(chunk) = self.rx.recv().await {
            let chunk = chunk?;
            buf.get_or_insert_with(|| BytesMut::from(&first[..]))
                .extend_from_slice(&chunk);
        }

        Ok(match buf {
            Some(buf) => buf.freeze(),
            None => first,
        })
    }

    /// Wait for the whole message and return it as a string
    pub async fn text(self) -> Result<String> {
        let bytes = self.buffer().await?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::InvalidUtf8)
    }
}

impl Stream for Message {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
