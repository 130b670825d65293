//! HTTP/1.1 upgrade front-end
//!
//! Accepts TCP connections, reads the request head, runs it through
//! [`Gateway::handshake`] and hands upgraded sockets to the gateway. Any
//! other request is answered and the connection closed.
//!
//! ```ignore
//! let listener = TcpListener::bind("127.0.0.1:9001").await?;
//! let gateway = Gateway::start(Config::default(), Arc::new(Echo)).await?;
//! ws_gateway::server::serve(listener, gateway).await?;
//! ```

use bytes::BytesMut;
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::handshake::{self, MAX_HEADER_SIZE};
use crate::session::ClientId;

/// Accept connections until the listener fails or the gateway stops
pub async fn serve(listener: TcpListener, gateway: Gateway) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "listening");
    }

    let mut stopped = gateway.stopped();
    loop {
        let (stream, peer) = tokio::select! {
            _ = stopped.wait_for(|stopped| *stopped) => return Ok(()),
            accepted = listener.accept() => accepted?,
        };
        stream.set_nodelay(true).ok();

        let gateway = gateway.clone();
        tokio::spawn(async move {
            if let Err(e) = upgrade(stream, &gateway).await {
                tracing::debug!(%peer, error = %e, "upgrade failed");
            }
        });
    }
}

/// Run the upgrade handshake on one connection
///
/// Returns the client id when the socket was handed to the gateway, or
/// `None` when the request was answered with anything but 101.
pub async fn upgrade<S>(mut stream: S, gateway: &Gateway) -> Result<Option<ClientId>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(4096);

    let (request, consumed) = loop {
        match handshake::parse_request(&buf) {
            Ok(Some(parsed)) => break parsed,
            Ok(None) => {}
            Err(e) => {
                let response = handshake::reject(StatusCode::BAD_REQUEST);
                stream.write_all(&handshake::encode_response(&response)).await?;
                stream.shutdown().await.ok();
                return Err(e);
            }
        }

        if buf.len() > MAX_HEADER_SIZE {
            return Err(Error::InvalidHttp("request head too large"));
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(Error::HandshakeFailed("connection closed before request head"));
        }
    };

    let (response, pending) = gateway.handshake(&request).await;
    stream.write_all(&handshake::encode_response(&response)).await?;
    stream.flush().await?;

    let Some(pending) = pending else {
        stream.shutdown().await.ok();
        return Ok(None);
    };

    let leftover = buf.split_off(consumed).freeze();
    let id = pending.claim(stream, leftover)?;
    Ok(Some(id))
}
