//! Per-connection session state
//!
//! [`ClientSession`] holds the mutable bookkeeping of one connection: close
//! flags, flow-control counters, ping accounting and statistics. The gateway
//! keeps it behind a mutex that is only held for short, synchronous updates.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::Config;

/// Identifier of a connected client
///
/// Ids are allocated in increasing order and never reused by a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    /// Numeric value of the id
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Statistics and close state of a client
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// Client id
    pub id: ClientId,
    /// When the socket was claimed
    pub connected_at: Instant,
    /// Last time bytes arrived
    pub last_read_at: Option<Instant>,
    /// Last time a frame was written
    pub last_sent_at: Option<Instant>,
    /// Bytes received, frame headers included
    pub bytes_read: u64,
    /// Bytes written, frame headers included
    pub bytes_sent: u64,
    /// Frames received
    pub frames_read: u64,
    /// Frames written
    pub frames_sent: u64,
    /// Complete messages received
    pub messages_read: u64,
    /// Messages written
    pub messages_sent: u64,
    /// Pings sent by the heartbeat
    pub ping_count: u64,
    /// Pings acknowledged by the client
    pub pong_count: u64,
    /// Whether permessage-deflate was negotiated
    pub compression: bool,
    /// When the close was initiated
    pub closed_at: Option<Instant>,
    /// Close code, set once
    pub close_code: Option<u16>,
    /// Close reason, set once
    pub close_reason: Option<String>,
}

const CLOSE_SENT: u8 = 0b01;
const CLOSE_RECEIVED: u8 = 0b10;

/// Outcome of a heartbeat check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Heartbeat {
    /// Nothing to do yet
    Idle,
    /// Send a ping carrying this sequence number
    Ping(u64),
    /// Too many pings went unanswered
    Exceeded,
}

/// Mutable state of one connection
#[derive(Debug)]
pub(crate) struct ClientSession {
    pub(crate) info: ClientInfo,
    close_state: u8,
    /// Remaining byte allowance, may go negative
    capacity: i64,
    frames_last_second: u64,
    heartbeat_at: Instant,
    close_deadline: Option<Instant>,
}

impl ClientSession {
    pub(crate) fn new(id: ClientId, config: &Config, compression: bool, now: Instant) -> Self {
        Self {
            info: ClientInfo {
                id,
                connected_at: now,
                last_read_at: None,
                last_sent_at: None,
                bytes_read: 0,
                bytes_sent: 0,
                frames_read: 0,
                frames_sent: 0,
                messages_read: 0,
                messages_sent: 0,
                ping_count: 0,
                pong_count: 0,
                compression,
                closed_at: None,
                close_code: None,
                close_reason: None,
            },
            close_state: 0,
            capacity: max_capacity(config),
            frames_last_second: 0,
            heartbeat_at: now + config.heartbeat_period,
            close_deadline: None,
        }
    }

    /// Record the close code and reason
    ///
    /// Only the first call has any effect; it returns `true`.
    pub(crate) fn record_close(
        &mut self,
        code: u16,
        reason: &str,
        now: Instant,
        close_period: Duration,
    ) -> bool {
        if self.info.closed_at.is_some() {
            return false;
        }
        self.info.closed_at = Some(now);
        self.info.close_code = Some(code);
        self.info.close_reason = Some(reason.to_owned());
        self.close_deadline = Some(now + close_period);
        true
    }

    #[inline]
    pub(crate) fn is_closing(&self) -> bool {
        self.info.closed_at.is_some()
    }

    /// Mark our close frame as written; returns whether the handshake is complete
    pub(crate) fn close_sent(&mut self) -> bool {
        self.close_state |= CLOSE_SENT;
        self.close_complete()
    }

    /// Mark the peer's close frame as received; returns whether the handshake is complete
    pub(crate) fn close_received(&mut self) -> bool {
        self.close_state |= CLOSE_RECEIVED;
        self.close_complete()
    }

    #[inline]
    pub(crate) fn close_complete(&self) -> bool {
        self.close_state == CLOSE_SENT | CLOSE_RECEIVED
    }

    /// Whether the close-response timeout elapsed
    pub(crate) fn close_expired(&self, now: Instant) -> bool {
        self.close_deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Account bytes read from the socket before they are parsed
    pub(crate) fn account_read(&mut self, bytes: usize, now: Instant, heartbeat_period: Duration) {
        self.capacity -= bytes as i64;
        self.info.bytes_read += bytes as u64;
        self.info.last_read_at = Some(now);
        self.heartbeat_at = now + heartbeat_period;
    }

    /// Account frames completed by the parser
    pub(crate) fn account_frames(&mut self, frames: usize) {
        self.frames_last_second += frames as u64;
        self.info.frames_read += frames as u64;
    }

    /// Account a write that reached the socket
    pub(crate) fn account_sent(&mut self, frames: usize, bytes: usize, now: Instant) {
        self.info.frames_sent += frames as u64;
        self.info.bytes_sent += bytes as u64;
        self.info.last_sent_at = Some(now);
    }

    /// Whether reading must pause until the next tick
    pub(crate) fn is_throttled(&self, config: &Config) -> bool {
        self.capacity < 0 || self.frames_last_second > config.max_frames_per_second as u64
    }

    /// Per-tick flow-control replenishment
    ///
    /// The byte allowance grows by a tick's share of the per-minute budget,
    /// capped at the full budget. The frame counter decays by the per-second
    /// limit instead of resetting.
    pub(crate) fn refill(&mut self, config: &Config) {
        self.capacity = (self.capacity + config.capacity_per_tick()).min(max_capacity(config));
        self.frames_last_second = self
            .frames_last_second
            .saturating_sub(config.max_frames_per_second as u64);
    }

    /// Check whether a heartbeat ping is due
    ///
    /// A zero heartbeat period disables pings.
    pub(crate) fn heartbeat(&mut self, now: Instant, config: &Config) -> Heartbeat {
        if config.heartbeat_period.is_zero() || self.is_closing() || now < self.heartbeat_at {
            return Heartbeat::Idle;
        }

        if self.info.ping_count - self.info.pong_count > config.queued_ping_limit {
            return Heartbeat::Exceeded;
        }

        self.info.ping_count += 1;
        self.heartbeat_at = now + config.heartbeat_period;
        Heartbeat::Ping(self.info.ping_count)
    }

    /// Apply a pong payload
    ///
    /// Payloads that are not a positive decimal number are ignored. The pong
    /// count never exceeds the ping count and never goes back.
    pub(crate) fn receive_pong(&mut self, payload: &[u8]) {
        if let Some(value) = parse_pong(payload) {
            self.info.pong_count = self.info.pong_count.max(value.min(self.info.ping_count));
        }
    }
}

fn max_capacity(config: &Config) -> i64 {
    i64::try_from(config.max_bytes_per_minute).unwrap_or(i64::MAX)
}

fn parse_pong(payload: &[u8]) -> Option<u64> {
    if payload.is_empty() || !payload.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(payload)
        .ok()?
        .parse::<u64>()
        .ok()
        .filter(|value| *value > 0)
}
