//! Application interface
//!
//! An [`Application`] receives lifecycle and data callbacks from the
//! [`Gateway`](crate::Gateway) and talks back through the
//! [`Endpoint`](crate::Endpoint) handed to [`Application::on_start`].

use async_trait::async_trait;
use http::{Request, Response};

use crate::error::BoxError;
use crate::gateway::Endpoint;
use crate::message::Message;
use crate::session::ClientId;

/// Callbacks invoked by the gateway
///
/// Every method but [`on_data`](Application::on_data) has a default that does
/// nothing. An error or panic from `on_open` or `on_data` closes that client
/// with UNEXPECTED_SERVER_ERROR (1011). Errors from `on_close` and `on_stop`
/// are logged.
#[async_trait]
pub trait Application: Send + Sync + 'static {
    /// Called once when the gateway starts
    async fn on_start(&self, _endpoint: Endpoint) -> Result<(), BoxError> {
        Ok(())
    }

    /// Inspect a valid upgrade request before it is accepted
    ///
    /// Return the given 101 response, possibly with extra headers such as
    /// `Sec-WebSocket-Protocol`, or any other response to refuse the upgrade.
    async fn on_handshake(&self, _request: &Request<()>, response: Response<()>) -> Response<()> {
        response
    }

    /// Called when a client is connected, before any of its messages
    async fn on_open(&self, _client_id: ClientId, _request: &Request<()>) -> Result<(), BoxError> {
        Ok(())
    }

    /// Called once per message, as soon as its first frame arrives
    async fn on_data(&self, client_id: ClientId, message: Message) -> Result<(), BoxError>;

    /// Called exactly once per client, when its close is first initiated
    async fn on_close(&self, _client_id: ClientId, _code: u16, _reason: &str) -> Result<(), BoxError> {
        Ok(())
    }

    /// Called once all clients are gone after [`Gateway::stop`](crate::Gateway::stop)
    async fn on_stop(&self) -> Result<(), BoxError> {
        Ok(())
    }
}
