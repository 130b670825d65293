//! # ws-gateway: RFC 6455 WebSocket gateway
//!
//! A server-side WebSocket gateway that sits behind an HTTP front-end. It
//! validates the upgrade handshake, takes ownership of the upgraded socket,
//! and drives every connection through its whole life:
//!
//! - **Incremental frame parsing**: resumable across arbitrary read boundaries
//! - **permessage-deflate** (RFC 7692) negotiated per connection
//! - **Flow control**: per-client byte-rate and frame-rate limits that suspend
//!   reading instead of dropping data
//! - **Heartbeats**: periodic pings with an unanswered-ping limit
//! - **Close handshake**: bilateral close with a response timeout
//! - **Fan-out**: send, broadcast and multicast with per-recipient results
//!
//! ## Example
//!
//! ```ignore
//! use ws_gateway::{Application, Config, Endpoint, Gateway, Message};
//!
//! struct Echo(parking_lot::Mutex<Option<Endpoint>>);
//!
//! #[async_trait::async_trait]
//! impl Application for Echo {
//!     async fn on_start(&self, endpoint: Endpoint) -> Result<(), BoxError> {
//!         *self.0.lock() = Some(endpoint);
//!         Ok(())
//!     }
//!
//!     async fn on_data(&self, id: ClientId, message: Message) -> Result<(), BoxError> {
//!         let binary = message.is_binary();
//!         let payload = message.buffer().await?;
//!         let endpoint = self.0.lock().clone().unwrap();
//!         if binary {
//!             endpoint.send_binary(payload, id).await?;
//!         } else {
//!             endpoint.send(payload, id).await?;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let gateway = Gateway::start(Config::default(), Arc::new(Echo(Default::default()))).await?;
//! ws_gateway::server::serve(listener, gateway).await?;
//! ```

use std::time::Duration;

pub mod app;
pub mod deflate;
pub mod error;
pub mod frame;
pub mod gateway;
pub mod handshake;
pub mod mask;
pub mod message;
pub mod protocol;
pub mod server;
pub mod session;
pub mod utf8;
pub mod writer;

pub use app::Application;
pub use deflate::DeflateConfig;
pub use error::{BoxError, CloseCode, Error, Result};
pub use frame::{Frame, OpCode};
pub use gateway::{Endpoint, Fanout, Gateway, PendingUpgrade};
pub use message::Message;
pub use session::{ClientId, ClientInfo};

/// Receive buffer size for socket reads (64KB)
pub const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Maximum WebSocket frame header size (2 + 8 + 4 = 14 bytes)
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Largest payload encoded with the 7-bit length field
pub const SMALL_MESSAGE_THRESHOLD: usize = 125;

/// Largest payload encoded with the 16-bit extended length field
pub const MEDIUM_MESSAGE_THRESHOLD: usize = 65535;

/// Largest control frame payload
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket GUID for handshake
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Gateway configuration
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use ws_gateway::Config;
///
/// let config = Config::builder()
///     .max_frames_per_second(50)
///     .heartbeat_period(Duration::from_secs(30))
///     .text_only(true)
///     .build();
/// assert_eq!(config.max_frames_per_second, 50);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Byte allowance per client per minute (default: 8MB)
    pub max_bytes_per_minute: usize,
    /// Frames a client may send per second (default: 100)
    pub max_frames_per_second: usize,
    /// Maximum frame payload size (default: 2MB)
    pub max_frame_size: usize,
    /// Maximum message size after reassembly and inflation (default: 10MB)
    pub max_message_size: usize,
    /// Outbound messages are split into frames of at most this size (default: 32KB)
    pub auto_frame_size: usize,
    /// Idle time before the gateway pings a client (default: 10s)
    pub heartbeat_period: Duration,
    /// Unanswered pings tolerated before closing (default: 3)
    pub queued_ping_limit: u64,
    /// Time allowed for the peer to answer our close frame (default: 3s)
    pub close_period: Duration,
    /// Flow-control and heartbeat tick (default: 1s)
    pub tick_interval: Duration,
    /// Validate UTF-8 in text messages (default: true)
    pub validate_utf8: bool,
    /// Reject binary messages with UNACCEPTABLE_TYPE (default: false)
    pub text_only: bool,
    /// Negotiate permessage-deflate when offered (default: true)
    pub compression: bool,
    /// permessage-deflate parameters
    pub deflate: DeflateConfig,
    /// Allowed `Origin` values; empty allows any origin
    pub allowed_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_bytes_per_minute: 8 * 1024 * 1024,
            max_frames_per_second: 100,
            max_frame_size: 2 * 1024 * 1024,
            max_message_size: 10 * 1024 * 1024,
            auto_frame_size: 32 * 1024,
            heartbeat_period: Duration::from_secs(10),
            queued_ping_limit: 3,
            close_period: Duration::from_secs(3),
            tick_interval: Duration::from_secs(1),
            validate_utf8: true,
            text_only: false,
            compression: true,
            deflate: DeflateConfig::default(),
            allowed_origins: Vec::new(),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Byte capacity restored on every tick
    pub(crate) fn capacity_per_tick(&self) -> i64 {
        let ticks_per_minute = (60_000 / self.tick_interval.as_millis().max(1)).max(1);
        (self.max_bytes_per_minute as u128 / ticks_per_minute) as i64
    }

    pub(crate) fn origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.is_empty()
            || self
                .allowed_origins
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(origin))
    }
}

/// Builder for gateway configuration
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set the per-minute byte allowance
    pub fn max_bytes_per_minute(mut self, bytes: usize) -> Self {
        self.config.max_bytes_per_minute = bytes;
        self
    }

    /// Set the per-second frame allowance
    pub fn max_frames_per_second(mut self, frames: usize) -> Self {
        self.config.max_frames_per_second = frames;
        self
    }

    /// Set maximum frame size
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set maximum message size
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Set the outbound frame split size
    pub fn auto_frame_size(mut self, size: usize) -> Self {
        self.config.auto_frame_size = size.max(1);
        self
    }

    /// Set the heartbeat period
    pub fn heartbeat_period(mut self, period: Duration) -> Self {
        self.config.heartbeat_period = period;
        self
    }

    /// Set how many pings may go unanswered
    pub fn queued_ping_limit(mut self, limit: u64) -> Self {
        self.config.queued_ping_limit = limit;
        self
    }

    /// Set the close-response timeout
    pub fn close_period(mut self, period: Duration) -> Self {
        self.config.close_period = period;
        self
    }

    /// Set the tick interval driving flow control and heartbeats
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval = interval;
        self
    }

    /// Enable or disable UTF-8 validation of text messages
    pub fn validate_utf8(mut self, enabled: bool) -> Self {
        self.config.validate_utf8 = enabled;
        self
    }

    /// Accept text messages only
    pub fn text_only(mut self, enabled: bool) -> Self {
        self.config.text_only = enabled;
        self
    }

    /// Enable or disable permessage-deflate negotiation
    pub fn compression(mut self, enabled: bool) -> Self {
        self.config.compression = enabled;
        self
    }

    /// Set permessage-deflate parameters
    pub fn deflate(mut self, deflate: DeflateConfig) -> Self {
        self.config.deflate = deflate;
        self
    }

    /// Allow an `Origin` value
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        self.config.allowed_origins.push(origin.into());
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::Config;
    pub use crate::app::Application;
    pub use crate::error::{BoxError, CloseCode, Error, Result};
    pub use crate::gateway::{Endpoint, Gateway};
    pub use crate::message::Message;
    pub use crate::session::ClientId;
}
