//! Connection orchestration
//!
//! The [`Gateway`] owns every connected client. For each one it runs:
//! - a read loop feeding socket bytes through [`Protocol`], applying flow
//!   control and dispatching control frames and message fragments
//! - a writer task draining a FIFO of outbound commands through
//!   [`FrameWriter`], so at most one write is in flight per socket
//!
//! A single tick task per gateway replenishes flow-control allowances, sends
//! heartbeat pings and enforces the close-response timeout.
//!
//! Session lifecycle: open, close initiated (our close frame sent or the
//! peer's received), close complete (both), unloaded. An abrupt disconnect
//! unloads from any state.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures_util::FutureExt;
use futures_util::future::join_all;
use http::{Request, Response, StatusCode};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};

use crate::app::Application;
use crate::deflate::DeflateConfig;
use crate::error::{BoxError, CloseCode, Error, Result};
use crate::frame::OpCode;
use crate::handshake::{self, Accepted};
use crate::message::{self, Message, MessageSender};
use crate::protocol::{CloseFrame, Control, ParsedEvent, Protocol};
use crate::session::{ClientId, ClientInfo, ClientSession, Heartbeat};
use crate::utf8::validate_utf8;
use crate::writer::{FrameWriter, MAX_CLOSE_REASON, Written, truncate_reason};
use crate::{Config, RECV_BUFFER_SIZE};

/// Command for a client's writer task
enum Outbound {
    Data {
        payload: Bytes,
        binary: bool,
        done: oneshot::Sender<Result<()>>,
    },
    Control {
        opcode: OpCode,
        payload: Bytes,
    },
    Close {
        code: u16,
        reason: String,
        done: oneshot::Sender<Result<()>>,
    },
}

/// A connected client as seen by the gateway
struct Client {
    id: ClientId,
    session: Mutex<ClientSession>,
    outbound: mpsc::UnboundedSender<Outbound>,
    /// Wakes a throttled read loop
    resume: Notify,
    /// Set once the client is unloaded
    unloaded: watch::Sender<bool>,
    request: Request<()>,
}

struct Shared {
    config: Config,
    app: Arc<dyn Application>,
    clients: RwLock<HashMap<ClientId, Arc<Client>>>,
    next_id: AtomicU64,
    stopping: AtomicBool,
    /// Notified whenever the client table becomes empty
    emptied: Notify,
    /// Ends the tick task
    stopped: watch::Sender<bool>,
}

/// WebSocket gateway
///
/// Cheap to clone; all clones drive the same set of clients.
#[derive(Clone)]
pub struct Gateway {
    shared: Arc<Shared>,
}

/// Control surface handed to the application
///
/// Holds a weak reference, so an application storing its endpoint does not
/// keep the gateway alive. Calls fail with [`Error::GatewayStopped`] once the
/// gateway is gone.
#[derive(Clone)]
pub struct Endpoint {
    shared: Weak<Shared>,
}

/// An accepted handshake waiting for its socket
///
/// Returned by [`Gateway::handshake`] together with the 101 response. Once
/// the response is written, hand over the socket with [`claim`](Self::claim).
pub struct PendingUpgrade {
    gateway: Gateway,
    request: Request<()>,
    deflate: Option<DeflateConfig>,
}

/// Per-recipient outcome of a fan-out
#[derive(Debug, Default)]
pub struct Fanout {
    /// One entry per recipient, in recipient order
    pub results: Vec<(ClientId, Result<()>)>,
}

impl Fanout {
    /// Recipients the message was written to
    pub fn delivered(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.results
            .iter()
            .filter(|(_, result)| result.is_ok())
            .map(|(id, _)| *id)
    }

    /// Recipients that could not be reached
    pub fn failed(&self) -> impl Iterator<Item = (ClientId, &Error)> + '_ {
        self.results
            .iter()
            .filter_map(|(id, result)| result.as_ref().err().map(|e| (*id, e)))
    }

    /// Whether every recipient received the message
    pub fn is_complete(&self) -> bool {
        self.results.iter().all(|(_, result)| result.is_ok())
    }
}

impl Gateway {
    /// Start a gateway
    ///
    /// Spawns the tick task and runs [`Application::on_start`].
    pub async fn start<A: Application>(config: Config, app: Arc<A>) -> Result<Self> {
        let (stopped, stop_rx) = watch::channel(false);
        let tick_interval = config.tick_interval;

        let shared = Arc::new(Shared {
            config,
            app,
            clients: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            stopping: AtomicBool::new(false),
            emptied: Notify::new(),
            stopped,
        });

        tokio::spawn(tick_loop(Arc::downgrade(&shared), stop_rx, tick_interval));

        let gateway = Self { shared };
        gateway
            .shared
            .app
            .on_start(gateway.endpoint())
            .await
            .map_err(Error::Application)?;

        tracing::info!("gateway started");
        Ok(gateway)
    }

    /// Control surface for the application
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Gateway configuration
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Resolves to `true` once [`stop`](Self::stop) has finished
    pub(crate) fn stopped(&self) -> watch::Receiver<bool> {
        self.shared.stopped.subscribe()
    }

    /// Validate an upgrade request
    ///
    /// Always returns the response to send. On 101 a [`PendingUpgrade`] is
    /// returned as well. The application's
    /// [`on_handshake`](Application::on_handshake) may replace the 101.
    pub async fn handshake(&self, request: &Request<()>) -> (Response<()>, Option<PendingUpgrade>) {
        if self.shared.stopping.load(Ordering::Acquire) {
            return (handshake::reject(StatusCode::SERVICE_UNAVAILABLE), None);
        }

        let Accepted { response, deflate } = match handshake::validate(request, &self.shared.config)
        {
            Ok(accepted) => accepted,
            Err(response) => {
                tracing::debug!(status = %response.status(), uri = %request.uri(), "handshake rejected");
                return (response, None);
            }
        };

        let response = self.shared.app.on_handshake(request, response).await;
        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            tracing::debug!(status = %response.status(), "handshake refused by application");
            return (response, None);
        }

        let pending = PendingUpgrade {
            gateway: self.clone(),
            request: handshake::request_head(request),
            deflate,
        };
        (response, Some(pending))
    }

    /// Close every client with GOING_AWAY and wait until all are unloaded
    ///
    /// Runs [`Application::on_stop`] afterwards. Calling `stop` again is a
    /// no-op.
    pub async fn stop(&self) -> Result<()> {
        let shared = &self.shared;
        let clients: Vec<Arc<Client>> = {
            let clients = shared.clients.write();
            if shared.stopping.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            clients.values().cloned().collect()
        };
        tracing::info!(clients = clients.len(), "gateway stopping");

        join_all(
            clients
                .iter()
                .map(|client| close_client(shared, client, CloseCode::GOING_AWAY, "server shutting down")),
        )
        .await;

        // Peers that never answer are unloaded by the close timeout
        loop {
            let emptied = shared.emptied.notified();
            tokio::pin!(emptied);
            emptied.as_mut().enable();
            if shared.clients.read().is_empty() {
                break;
            }
            emptied.await;
        }

        shared.stopped.send_replace(true);

        let result = AssertUnwindSafe(shared.app.on_stop()).catch_unwind().await;
        hook_failed("on_stop", None, result);

        tracing::info!("gateway stopped");
        Ok(())
    }
}

impl PendingUpgrade {
    /// Negotiated permessage-deflate parameters
    pub fn deflate(&self) -> Option<&DeflateConfig> {
        self.deflate.as_ref()
    }

    /// Hand the upgraded socket to the gateway
    ///
    /// `leftover` holds bytes read past the request head; they are parsed
    /// before anything else from the socket.
    pub fn claim<S>(self, socket: S, leftover: Bytes) -> Result<ClientId>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let shared = self.gateway.shared;
        let config = &shared.config;
        let id = ClientId::new(shared.next_id.fetch_add(1, Ordering::Relaxed));
        let (read_half, write_half) = tokio::io::split(socket);
        let (outbound, rx) = mpsc::unbounded_channel();
        let (unloaded, _) = watch::channel(false);

        let client = Arc::new(Client {
            id,
            session: Mutex::new(ClientSession::new(
                id,
                config,
                self.deflate.is_some(),
                Instant::now(),
            )),
            outbound,
            resume: Notify::new(),
            unloaded,
            request: self.request,
        });

        // Same lock as the snapshot in `stop`
        {
            let mut clients = shared.clients.write();
            if shared.stopping.load(Ordering::Acquire) {
                return Err(Error::GatewayStopped);
            }
            clients.insert(id, client.clone());
        }

        let writer = FrameWriter::new(write_half, config.auto_frame_size, self.deflate.as_ref());
        let protocol = Protocol::new(config, self.deflate.as_ref());

        tracing::debug!(client_id = %id, compression = self.deflate.is_some(), "client connected");

        tokio::spawn(write_loop(shared.clone(), client.clone(), writer, rx));

        let reader = Reader {
            unloaded: client.unloaded.subscribe(),
            shared,
            client,
            io: read_half,
            protocol,
            assembly: None,
        };
        tokio::spawn(reader.run(leftover));

        Ok(id)
    }
}

impl Endpoint {
    fn shared(&self) -> Result<Arc<Shared>> {
        self.shared.upgrade().ok_or(Error::GatewayStopped)
    }

    /// Send a text message to one client
    pub async fn send(&self, data: impl Into<Bytes>, client_id: ClientId) -> Result<()> {
        let payload = text_payload(data)?;
        let shared = self.shared()?;
        deliver(&shared, client_id, payload, false).await
    }

    /// Send a binary message to one client
    pub async fn send_binary(&self, data: impl Into<Bytes>, client_id: ClientId) -> Result<()> {
        let shared = self.shared()?;
        deliver(&shared, client_id, data.into(), true).await
    }

    /// Send a text message to every client except `except`
    pub async fn broadcast(&self, data: impl Into<Bytes>, except: &[ClientId]) -> Result<Fanout> {
        let payload = text_payload(data)?;
        self.broadcast_inner(payload, false, except).await
    }

    /// Send a binary message to every client except `except`
    pub async fn broadcast_binary(
        &self,
        data: impl Into<Bytes>,
        except: &[ClientId],
    ) -> Result<Fanout> {
        self.broadcast_inner(data.into(), true, except).await
    }

    /// Send a text message to the listed clients
    pub async fn multicast(&self, data: impl Into<Bytes>, client_ids: &[ClientId]) -> Result<Fanout> {
        let payload = text_payload(data)?;
        Ok(fan_out(&self.shared()?, client_ids.to_vec(), payload, false).await)
    }

    /// Send a binary message to the listed clients
    pub async fn multicast_binary(
        &self,
        data: impl Into<Bytes>,
        client_ids: &[ClientId],
    ) -> Result<Fanout> {
        Ok(fan_out(&self.shared()?, client_ids.to_vec(), data.into(), true).await)
    }

    async fn broadcast_inner(&self, payload: Bytes, binary: bool, except: &[ClientId]) -> Result<Fanout> {
        let shared = self.shared()?;
        let mut ids: Vec<ClientId> = shared
            .clients
            .read()
            .keys()
            .filter(|id| !except.contains(id))
            .copied()
            .collect();
        ids.sort_unstable();
        Ok(fan_out(&shared, ids, payload, binary).await)
    }

    /// Close a client
    ///
    /// Waits until the close frame is written. Closing a client that is
    /// already closing does nothing.
    pub async fn close(&self, client_id: ClientId, code: u16, reason: &str) -> Result<()> {
        if reason.len() > MAX_CLOSE_REASON {
            return Err(Error::CloseReasonTooLong(reason.len()));
        }
        if !CloseCode::is_valid(code) {
            return Err(Error::InvalidCloseCode(code));
        }

        let shared = self.shared()?;
        let client = lookup(&shared, client_id)?;
        close_client(&shared, &client, code, reason).await;
        Ok(())
    }

    /// Statistics of a connected client
    pub fn get_info(&self, client_id: ClientId) -> Result<ClientInfo> {
        let shared = self.shared()?;
        let client = lookup(&shared, client_id)?;
        let info = client.session.lock().info.clone();
        Ok(info)
    }

    /// Ids of all connected clients, in ascending order
    pub fn get_clients(&self) -> Vec<ClientId> {
        let Some(shared) = self.shared.upgrade() else {
            return Vec::new();
        };
        let mut ids: Vec<ClientId> = shared.clients.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

fn text_payload(data: impl Into<Bytes>) -> Result<Bytes> {
    let payload = data.into();
    if !validate_utf8(&payload) {
        return Err(Error::InvalidUtf8);
    }
    Ok(payload)
}

fn lookup(shared: &Shared, client_id: ClientId) -> Result<Arc<Client>> {
    shared
        .clients
        .read()
        .get(&client_id)
        .cloned()
        .ok_or(Error::UnknownClient(client_id))
}

async fn fan_out(shared: &Arc<Shared>, ids: Vec<ClientId>, payload: Bytes, binary: bool) -> Fanout {
    let results = join_all(
        ids.iter()
            .map(|id| deliver(shared, *id, payload.clone(), binary)),
    )
    .await;

    let fanout = Fanout {
        results: ids.into_iter().zip(results).collect(),
    };
    let failed = fanout.failed().count();
    if failed > 0 {
        tracing::debug!(recipients = fanout.results.len(), failed, "fan-out partially failed");
    }
    fanout
}

/// Queue a data message and wait until it is written
async fn deliver(shared: &Shared, client_id: ClientId, payload: Bytes, binary: bool) -> Result<()> {
    let client = lookup(shared, client_id)?;

    let rx = {
        let session = client.session.lock();
        if session.is_closing() {
            return Err(Error::ClientClosing(client_id));
        }
        let (done, rx) = oneshot::channel();
        client
            .outbound
            .send(Outbound::Data {
                payload,
                binary,
                done,
            })
            .map_err(|_| Error::ClientGone)?;
        rx
    };

    rx.await.map_err(|_| Error::ClientGone)?
}

/// Initiate or take part in the close handshake
///
/// The first call records the close code and reason, runs `on_close`, writes
/// the close frame and waits for it to be flushed. Later calls return at once.
async fn close_client(shared: &Arc<Shared>, client: &Arc<Client>, code: u16, reason: &str) {
    let rx = {
        let mut session = client.session.lock();
        if !session.record_close(code, reason, Instant::now(), shared.config.close_period) {
            return;
        }
        let (done, rx) = oneshot::channel();
        let queued = client
            .outbound
            .send(Outbound::Close {
                code,
                reason: reason.to_owned(),
                done,
            })
            .is_ok();
        queued.then_some(rx)
    };

    tracing::debug!(client_id = %client.id, code, reason, "closing client");
    notify_close(shared, client.id, code, reason).await;

    let written = match rx {
        Some(rx) => matches!(rx.await, Ok(Ok(()))),
        None => false,
    };

    let complete = written && client.session.lock().close_sent();
    if !written || complete {
        unload(shared, client);
    }
}

/// Handle a socket that went away without completing the close handshake
async fn abort_client(shared: &Arc<Shared>, client: &Arc<Client>) {
    let first = client.session.lock().record_close(
        CloseCode::ABNORMAL_CLOSE,
        "",
        Instant::now(),
        shared.config.close_period,
    );

    if first {
        tracing::debug!(client_id = %client.id, code = CloseCode::ABNORMAL_CLOSE, "client disconnected");
        notify_close(shared, client.id, CloseCode::ABNORMAL_CLOSE, "").await;
    }
    unload(shared, client);
}

async fn notify_close(shared: &Shared, client_id: ClientId, code: u16, reason: &str) {
    let result = AssertUnwindSafe(shared.app.on_close(client_id, code, reason))
        .catch_unwind()
        .await;
    hook_failed("on_close", Some(client_id), result);
}

/// Remove a client and release its socket
fn unload(shared: &Shared, client: &Client) {
    let (removed, empty) = {
        let mut clients = shared.clients.write();
        let removed = clients.remove(&client.id).is_some();
        (removed, clients.is_empty())
    };
    if !removed {
        return;
    }

    client.unloaded.send_replace(true);

    let (code, reason) = {
        let session = client.session.lock();
        (session.info.close_code, session.info.close_reason.clone())
    };
    tracing::debug!(client_id = %client.id, ?code, ?reason, "client unloaded");

    if empty {
        shared.emptied.notify_waiters();
    }
}

/// Log a failed application hook; returns whether it failed
fn hook_failed(
    hook: &'static str,
    client_id: Option<ClientId>,
    result: std::thread::Result<std::result::Result<(), BoxError>>,
) -> bool {
    match result {
        Ok(Ok(())) => false,
        Ok(Err(error)) => {
            tracing::error!(hook, ?client_id, %error, "application hook failed");
            true
        }
        Err(_) => {
            tracing::error!(hook, ?client_id, "application hook panicked");
            true
        }
    }
}

async fn write_loop<W>(
    shared: Arc<Shared>,
    client: Arc<Client>,
    mut writer: FrameWriter<W>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) where
    W: AsyncWrite + Unpin,
{
    let mut unloaded = client.unloaded.subscribe();

    loop {
        let command = tokio::select! {
            biased;
            _ = unloaded.wait_for(|unloaded| *unloaded) => break,
            command = rx.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        let is_data = matches!(command, Outbound::Data { .. });
        let (result, done) = tokio::select! {
            biased;
            _ = unloaded.wait_for(|unloaded| *unloaded) => break,
            outcome = execute(&mut writer, command) => outcome,
        };

        let failed = match &result {
            Ok(written) => {
                let mut session = client.session.lock();
                session.account_sent(written.frames, written.bytes, Instant::now());
                if is_data {
                    session.info.messages_sent += 1;
                }
                false
            }
            Err(e) if e.is_disconnect() => {
                tracing::debug!(client_id = %client.id, error = %e, "peer gone during write");
                true
            }
            Err(e) => {
                tracing::warn!(client_id = %client.id, error = %e, "write failed");
                true
            }
        };

        if let Some(done) = done {
            let _ = done.send(result.map(|_| ()));
        }

        if failed {
            abort_client(&shared, &client).await;
            return;
        }
    }

    let _ = writer.shutdown().await;
}

async fn execute<W>(
    writer: &mut FrameWriter<W>,
    command: Outbound,
) -> (Result<Written>, Option<oneshot::Sender<Result<()>>>)
where
    W: AsyncWrite + Unpin,
{
    match command {
        Outbound::Data {
            payload,
            binary,
            done,
        } => (writer.write_message(&payload, binary).await, Some(done)),
        Outbound::Control { opcode, payload } => (writer.write_control(opcode, &payload).await, None),
        Outbound::Close { code, reason, done } => (writer.write_close(code, &reason).await, Some(done)),
    }
}

/// Whether the read loop keeps going
enum Flow {
    Continue,
    Stop,
}

struct Reader<R> {
    shared: Arc<Shared>,
    client: Arc<Client>,
    io: R,
    protocol: Protocol,
    /// Message currently being streamed to the application
    assembly: Option<MessageSender>,
    unloaded: watch::Receiver<bool>,
}

impl<R> Reader<R>
where
    R: AsyncRead + Unpin,
{
    async fn run(mut self, leftover: Bytes) {
        open(&self.shared, &self.client).await;

        let mut flow = if leftover.is_empty() {
            Flow::Continue
        } else {
            self.process(&leftover).await
        };

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        while let Flow::Continue = flow {
            if let Flow::Stop = self.throttle().await {
                break;
            }

            let read = tokio::select! {
                biased;
                _ = self.unloaded.wait_for(|unloaded| *unloaded) => break,
                read = self.io.read(&mut buf) => read,
            };

            flow = match read {
                Ok(0) => {
                    abort_client(&self.shared, &self.client).await;
                    Flow::Stop
                }
                Ok(n) => self.process(&buf[..n]).await,
                Err(e) => {
                    tracing::debug!(client_id = %self.client.id, error = %e, "read failed");
                    abort_client(&self.shared, &self.client).await;
                    Flow::Stop
                }
            };
        }

        if let Some(sender) = self.assembly.take() {
            sender.fail();
        }
    }

    /// Wait while the client is over its byte or frame allowance
    async fn throttle(&mut self) -> Flow {
        loop {
            if !self.client.session.lock().is_throttled(&self.shared.config) {
                return Flow::Continue;
            }

            tracing::trace!(client_id = %self.client.id, "read suspended");
            tokio::select! {
                biased;
                _ = self.unloaded.wait_for(|unloaded| *unloaded) => return Flow::Stop,
                _ = self.client.resume.notified() => {}
            }
        }
    }

    async fn process(&mut self, chunk: &[u8]) -> Flow {
        self.client.session.lock().account_read(
            chunk.len(),
            Instant::now(),
            self.shared.config.heartbeat_period,
        );

        let parsed = self.protocol.feed(chunk);
        self.client.session.lock().account_frames(parsed.frames);

        for event in parsed.events {
            match event {
                ParsedEvent::Control(control) => {
                    if let Flow::Stop = self.control(control).await {
                        return Flow::Stop;
                    }
                }
                ParsedEvent::Data {
                    binary,
                    payload,
                    fin,
                } => self.data(binary, payload, fin),
                ParsedEvent::Error { code, reason } => {
                    tracing::debug!(client_id = %self.client.id, code, %reason, "protocol violation");
                    close_client(&self.shared, &self.client, code, truncate_reason(&reason)).await;
                }
            }
        }

        Flow::Continue
    }

    async fn control(&mut self, control: Control) -> Flow {
        match control {
            Control::Ping(payload) => {
                let session = self.client.session.lock();
                if !session.is_closing() {
                    let _ = self.client.outbound.send(Outbound::Control {
                        opcode: OpCode::Pong,
                        payload,
                    });
                }
                Flow::Continue
            }
            Control::Pong(payload) => {
                self.client.session.lock().receive_pong(&payload);
                Flow::Continue
            }
            Control::Close(frame) => {
                let (code, reason) = match frame {
                    None => (CloseCode::NONE, String::new()),
                    Some(CloseFrame { code, reason }) if CloseCode::is_valid(code) => (code, reason),
                    Some(CloseFrame { code, .. }) => {
                        tracing::debug!(client_id = %self.client.id, code, "invalid close code");
                        (CloseCode::PROTOCOL_ERROR, "invalid close code".to_owned())
                    }
                };

                let complete = self.client.session.lock().close_received();
                if complete {
                    unload(&self.shared, &self.client);
                } else {
                    close_client(&self.shared, &self.client, code, &reason).await;
                }
                Flow::Stop
            }
        }
    }

    fn data(&mut self, binary: bool, payload: Bytes, fin: bool) {
        // Data arriving after a close was initiated is dropped
        if self.client.session.lock().is_closing() {
            return;
        }

        let sender = match self.assembly.take() {
            Some(sender) => sender,
            None => {
                let (sender, message) = message::channel(binary);
                tokio::spawn(run_on_data(
                    self.shared.clone(),
                    self.client.clone(),
                    message,
                ));
                sender
            }
        };

        sender.push(payload);

        if fin {
            self.client.session.lock().info.messages_read += 1;
        } else {
            self.assembly = Some(sender);
        }
    }
}

/// Run `on_open`; a failing hook closes the client
async fn open(shared: &Arc<Shared>, client: &Arc<Client>) {
    let result = AssertUnwindSafe(shared.app.on_open(client.id, &client.request))
        .catch_unwind()
        .await;

    if hook_failed("on_open", Some(client.id), result) {
        close_client(
            shared,
            client,
            CloseCode::UNEXPECTED_SERVER_ERROR,
            "internal server error",
        )
        .await;
    }
}

async fn run_on_data(shared: Arc<Shared>, client: Arc<Client>, message: Message) {
    let result = AssertUnwindSafe(shared.app.on_data(client.id, message))
        .catch_unwind()
        .await;

    if hook_failed("on_data", Some(client.id), result) {
        close_client(
            &shared,
            &client,
            CloseCode::UNEXPECTED_SERVER_ERROR,
            "internal server error",
        )
        .await;
    }
}

async fn tick_loop(shared: Weak<Shared>, mut stopped: watch::Receiver<bool>, period: std::time::Duration) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stopped.wait_for(|stopped| *stopped) => break,
            _ = interval.tick() => {}
        }

        let Some(shared) = shared.upgrade() else {
            break;
        };
        tick(&shared);
    }
}

/// One flow-control, heartbeat and close-timeout pass over all clients
fn tick(shared: &Arc<Shared>) {
    let config = &shared.config;
    let now = Instant::now();
    let clients: Vec<Arc<Client>> = shared.clients.read().values().cloned().collect();

    for client in clients {
        let (expired, heartbeat) = {
            let mut session = client.session.lock();
            session.refill(config);

            let expired = session.close_expired(now);
            let heartbeat = session.heartbeat(now, config);
            if let Heartbeat::Ping(seq) = heartbeat {
                let _ = client.outbound.send(Outbound::Control {
                    opcode: OpCode::Ping,
                    payload: Bytes::from(seq.to_string()),
                });
            }
            (expired, heartbeat)
        };

        client.resume.notify_one();

        if expired {
            tracing::debug!(
                client_id = %client.id,
                code = CloseCode::POLICY_VIOLATION,
                "close handshake timed out"
            );
            unload(shared, &client);
            continue;
        }

        if heartbeat == Heartbeat::Exceeded {
            tracing::debug!(client_id = %client.id, "unanswered ping limit exceeded");
            let shared = shared.clone();
            tokio::spawn(async move {
                close_client(
                    &shared,
                    &client,
                    CloseCode::POLICY_VIOLATION,
                    "exceeded unanswered PING limit",
                )
                .await;
            });
        }
    }
}
