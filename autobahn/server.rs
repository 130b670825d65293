//! Echo gateway for the Autobahn test suite
//!
//! Listens on 127.0.0.1:9001 and echoes every message back unchanged.
//! Set `RUST_LOG=ws_gateway=debug` to trace sessions.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use ws_gateway::prelude::*;
use ws_gateway::server;

#[derive(Default)]
struct Echo {
    endpoint: OnceLock<Endpoint>,
}

#[async_trait]
impl Application for Echo {
    async fn on_start(&self, endpoint: Endpoint) -> std::result::Result<(), BoxError> {
        self.endpoint
            .set(endpoint)
            .map_err(|_| "echo application started twice")?;
        Ok(())
    }

    async fn on_data(&self, id: ClientId, message: Message) -> std::result::Result<(), BoxError> {
        let binary = message.is_binary();
        let payload = message.buffer().await?;
        let endpoint = self.endpoint.get().ok_or("echo application not started")?;

        let sent = if binary {
            endpoint.send_binary(payload, id).await
        } else {
            endpoint.send(payload, id).await
        };
        match sent {
            // The peer may already be closing after sending its last message
            Err(Error::ClientClosing(_)) | Err(Error::UnknownClient(_)) => Ok(()),
            other => Ok(other?),
        }
    }
}

fn listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(SockProtocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nodelay(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}

#[tokio::main]
async fn main() -> std::result::Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Autobahn pushes large messages in bursts
    let config = Config::builder()
        .max_bytes_per_minute(usize::MAX / 2)
        .max_frames_per_second(1_000_000)
        .max_frame_size(16 * 1024 * 1024)
        .max_message_size(64 * 1024 * 1024)
        .heartbeat_period(Duration::ZERO)
        .build();

    let gateway = Gateway::start(config, Arc::new(Echo::default())).await?;
    let listener = listener("127.0.0.1:9001".parse()?)?;

    tokio::select! {
        result = server::serve(listener, gateway.clone()) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            gateway.stop().await?;
        }
    }

    Ok(())
}
