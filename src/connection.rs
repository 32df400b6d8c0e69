//! Connection management for ESL
//!
//! One [`EslClient`] wraps one socket. A background reader task parses frames
//! and routes them: replies to the single pending command, `BACKGROUND_JOB`
//! results to the job registry, everything else to the dispatcher task.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::{
    command::{EslCommand, EslResponse},
    constants::{
        DEFAULT_COMMAND_TIMEOUT_MS, DEFAULT_TIMEOUT_MS, HEADER_CONTENT_DISPOSITION,
        HEADER_REPLY_TEXT, MAX_EVENT_QUEUE_SIZE, SOCKET_BUF_SIZE,
    },
    dispatch::{run_dispatcher, EventHandler, EventItem, EventQueue, HandlerTable},
    error::{EslError, EslResult},
    event::{EslEvent, EslEventType, EventFormat},
    headers::EventHeader,
    job::BackgroundJobRegistry,
    protocol::{ContentType, EslMessage, EslParser},
};

fn event_types_to_string(events: &[EslEventType]) -> String {
    events
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn strip_bgapi_prefix(command: &str) -> &str {
    command
        .strip_prefix("bgapi ")
        .unwrap_or(command)
}

/// Lifecycle of a connection.
///
/// `Disconnected → Connecting → Authenticating → Ready → Closing → Disconnected`.
/// Only `Ready` accepts application commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No socket, either not yet started or torn down (terminal).
    Disconnected,
    /// TCP connect in progress.
    Connecting,
    /// Socket open, handshake in progress.
    Authenticating,
    /// Handshake complete, commands accepted.
    Ready,
    /// Teardown in progress: waiters are being failed.
    Closing,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Ready => "ready",
            ConnectionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Reason for disconnection
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// Server sent a text/disconnect-notice with Content-Disposition: disconnect
    ServerNotice,
    /// Server refused the connection (`rude-rejection`)
    Rejected,
    /// The session's channel hung up and linger was not requested
    Hangup,
    /// Malformed or truncated frame on the wire
    Framing(String),
    /// TCP I/O error (io::Error is not Clone, so we store the message)
    IoError(String),
    /// Clean EOF on the TCP connection
    ConnectionClosed,
    /// Client called disconnect()
    ClientRequested,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::ServerNotice => write!(f, "server sent disconnect notice"),
            DisconnectReason::Rejected => write!(f, "server rejected the connection"),
            DisconnectReason::Hangup => write!(f, "channel hung up"),
            DisconnectReason::Framing(msg) => write!(f, "framing error: {}", msg),
            DisconnectReason::IoError(msg) => write!(f, "I/O error: {}", msg),
            DisconnectReason::ConnectionClosed => write!(f, "connection closed"),
            DisconnectReason::ClientRequested => write!(f, "client requested disconnect"),
        }
    }
}

/// Event subscription issued during the handshake, before the connection is `Ready`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSubscription {
    /// Body format the switch should use for events.
    #[serde(default)]
    pub format: EventFormat,
    /// Event names, e.g. `CHANNEL_ANSWER` or `CUSTOM sofia::register`. Empty means `ALL`.
    #[serde(default)]
    pub events: Vec<String>,
}

impl EventSubscription {
    /// Subscribe to every event in the given format.
    pub fn all(format: EventFormat) -> Self {
        Self {
            format,
            events: Vec::new(),
        }
    }

    fn event_list(&self) -> String {
        if self.events.is_empty() {
            EslEventType::All.to_string()
        } else {
            self.events
                .join(" ")
        }
    }
}

/// Options for ESL connection configuration.
///
/// Controls parameters fixed at connection time. Use [`Default::default()`]
/// for standard settings, or deserialize from a host configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EslConnectOptions {
    /// Capacity of the event handoff queue. Default: 1000.
    pub event_queue_size: usize,
    /// Reply timeout for commands sent without an explicit deadline. Default: 5000.
    pub command_timeout_ms: u64,
    /// TCP connect and handshake timeout. Default: 2000.
    pub connect_timeout_ms: u64,
    /// Event subscription required before the connection becomes `Ready`.
    pub subscription: Option<EventSubscription>,
    /// Accept mode: keep the socket open after hangup to drain final events.
    pub linger: bool,
}

impl Default for EslConnectOptions {
    fn default() -> Self {
        Self {
            event_queue_size: MAX_EVENT_QUEUE_SIZE,
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_TIMEOUT_MS,
            subscription: None,
            linger: false,
        }
    }
}

/// Handshake strategy for switch-initiated (outbound) sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// `socket ... async`: `connect`, then `myevents` so session events flow.
    #[default]
    Async,
    /// `socket ...` without async: `connect` only; executes carry `event-lock`.
    Sync,
}

impl SessionMode {
    /// `Socket-Mode` value the switch reports for this mode.
    fn socket_mode(&self) -> &'static str {
        match self {
            SessionMode::Async => "async",
            SessionMode::Sync => "static",
        }
    }
}

/// Authentication method for inbound connections.
enum AuthMethod<'a> {
    Password(&'a str),
    User { user: &'a str, password: &'a str },
}

type DisconnectHook = Box<dyn FnOnce(DisconnectReason) + Send>;

/// Which state a command may be sent in and what its reply triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandPhase {
    /// Sent while the connection is still authenticating.
    Handshake,
    Session,
    /// Tracked `bgapi`: the reader registers the Job-UUID before handing
    /// over the reply.
    BackgroundJob,
}

impl CommandPhase {
    fn admits(self, state: ConnectionState) -> EslResult<()> {
        match state {
            ConnectionState::Ready => Ok(()),
            ConnectionState::Authenticating if self == CommandPhase::Handshake => Ok(()),
            ConnectionState::Closing | ConnectionState::Disconnected => {
                Err(EslError::ConnectionClosed)
            }
            state => Err(EslError::NotReady { state }),
        }
    }
}

struct PendingCommand {
    tx: oneshot::Sender<EslResponse>,
    registers_job: bool,
}

/// The single in-flight command slot.
#[derive(Default)]
struct ReplySlot {
    pending: Option<PendingCommand>,
    /// Replies still owed to callers that timed out; discarded on arrival.
    stale: usize,
    closed: bool,
}

#[derive(Default)]
struct HookSlot {
    hook: Option<DisconnectHook>,
    fired: Option<DisconnectReason>,
}

/// Shared state between EslClient, the reader task and the dispatcher task
struct SharedState {
    reply: StdMutex<ReplySlot>,
    jobs: BackgroundJobRegistry,
    handlers: HandlerTable,
    state_tx: watch::Sender<ConnectionState>,
    close_tx: watch::Sender<bool>,
    disconnect: StdMutex<HookSlot>,
    /// Command response timeout in milliseconds
    command_timeout_ms: AtomicU64,
    /// Total count of dropped events
    dropped_event_count: Arc<AtomicU64>,
    socket_closed: AtomicBool,
    /// Accept mode only: channel variables from the `connect` reply.
    channel_data: OnceLock<EslEvent>,
    linger: AtomicBool,
    event_lock: AtomicBool,
}

impl SharedState {
    fn new(options: &EslConnectOptions) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (close_tx, _) = watch::channel(false);
        Arc::new(Self {
            reply: StdMutex::new(ReplySlot::default()),
            jobs: BackgroundJobRegistry::new(),
            handlers: HandlerTable::default(),
            state_tx,
            close_tx,
            disconnect: StdMutex::new(HookSlot::default()),
            command_timeout_ms: AtomicU64::new(options.command_timeout_ms),
            dropped_event_count: Arc::new(AtomicU64::new(0)),
            socket_closed: AtomicBool::new(false),
            channel_data: OnceLock::new(),
            linger: AtomicBool::new(options.linger),
            event_lock: AtomicBool::new(false),
        })
    }

    fn state(&self) -> ConnectionState {
        *self
            .state_tx
            .borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self
            .state_tx
            .send_replace(next);
        if prev != next {
            debug!("[STATE] {} -> {}", prev, next);
        }
    }

    /// `Authenticating → Ready`, unless teardown got there first.
    fn enter_ready(&self) -> EslResult<()> {
        let entered = self
            .state_tx
            .send_if_modified(|state| {
                if *state == ConnectionState::Authenticating {
                    *state = ConnectionState::Ready;
                    true
                } else {
                    false
                }
            });
        if entered {
            debug!("[STATE] {} -> {}", ConnectionState::Authenticating, ConnectionState::Ready);
            Ok(())
        } else {
            warn!("[STATE] Connection closed during handshake ({})", self.state());
            Err(EslError::ConnectionClosed)
        }
    }

    fn lock_reply(&self) -> MutexGuard<'_, ReplySlot> {
        self.reply
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }

    fn lock_hooks(&self) -> MutexGuard<'_, HookSlot> {
        self.disconnect
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }

    /// Route a `command/reply` or `api/response` to the pending command.
    fn deliver_reply(&self, message: EslMessage) {
        let response = message.into_response();
        let mut slot = self.lock_reply();

        if slot.stale > 0 {
            slot.stale -= 1;
            debug!(
                "[RECV] Discarding late reply for timed-out command: {:?}",
                response.reply_text()
            );
            return;
        }

        let Some(pending) = slot
            .pending
            .take()
        else {
            warn!(
                "[RECV] Reply with no pending command: {:?}",
                response.header(HEADER_REPLY_TEXT)
            );
            return;
        };
        drop(slot);

        if pending.registers_job && response.is_success() {
            match response.job_uuid() {
                Some(job_uuid) => {
                    if let Err(e) = self
                        .jobs
                        .register(job_uuid)
                    {
                        warn!("[RECV] Could not register job {}: {}", job_uuid, e);
                    }
                }
                None => warn!("[RECV] bgapi reply without Job-UUID"),
            }
        }

        // The caller may have given up between the timeout and this send.
        let _ = pending
            .tx
            .send(response);
    }

    /// Accept-mode sessions close on their channel's hangup unless lingering.
    fn closes_on_hangup(&self, event: &EslEvent) -> bool {
        let Some(channel) = self
            .channel_data
            .get()
        else {
            return false;
        };
        if self
            .linger
            .load(Ordering::Relaxed)
        {
            return false;
        }
        match (channel.unique_id(), event.unique_id()) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => true,
        }
    }

    async fn close_socket(&self, writer: &Mutex<OwnedWriteHalf>) {
        if self
            .socket_closed
            .swap(true, Ordering::AcqRel)
        {
            return;
        }
        // A writer stuck on a full send buffer must not stall teardown.
        match timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS), writer.lock()).await {
            Ok(mut writer) => {
                if let Err(e) = writer
                    .shutdown()
                    .await
                {
                    debug!("[CLOSE] Shutdown of write half failed: {}", e);
                }
            }
            Err(_) => warn!("[CLOSE] Writer busy, socket closes when the last handle drops"),
        }
    }

    /// Closing → fail waiters → close socket → hook → Disconnected.
    async fn teardown(&self, writer: &Mutex<OwnedWriteHalf>, reason: DisconnectReason) {
        info!("[CLOSE] Connection closing: {}", reason);
        self.set_state(ConnectionState::Closing);

        {
            let mut slot = self.lock_reply();
            slot.closed = true;
            // Dropping the sender wakes the waiter with ConnectionClosed.
            slot.pending
                .take();
        }
        self.jobs
            .cancel_all(|| EslError::ConnectionClosed);

        self.close_socket(writer)
            .await;

        let hook = {
            let mut hooks = self.lock_hooks();
            hooks.fired = Some(reason.clone());
            hooks
                .hook
                .take()
        };
        if let Some(hook) = hook {
            hook(reason);
        }

        self.set_state(ConnectionState::Disconnected);
    }
}

/// ESL client handle (Clone + Send)
///
/// Commands are serialized through the writer mutex, which is held until the
/// reply arrives. The reader task routes replies to the pending slot.
#[derive(Clone)]
pub struct EslClient {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    shared: Arc<SharedState>,
}

impl std::fmt::Debug for EslClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EslClient")
            .field("state", &self.state())
            .finish()
    }
}

/// Event stream receiver (!Clone)
///
/// Receives events that no registered handler claimed.
///
/// Events are delivered as `Result<EslEvent, EslError>`. An `Err(EslError::QueueFull)`
/// indicates that one or more events were dropped because the application fell behind.
/// Use [`EslClient::dropped_event_count`] for the exact count.
pub struct EslEventStream {
    rx: mpsc::Receiver<EventItem>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl std::fmt::Debug for EslEventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EslEventStream")
            .field("state", &self.state())
            .finish()
    }
}

/// Establish a TCP connection with a timeout.
async fn tcp_connect_with_timeout(host: &str, port: u16, limit_ms: u64) -> EslResult<TcpStream> {
    let address = format!("{}:{}", host, port);
    match timeout(
        Duration::from_millis(limit_ms),
        TcpStream::connect((host, port)),
    )
    .await
    {
        Ok(Ok(s)) => {
            debug!("[CONNECT] TCP connection established");
            Ok(s)
        }
        Ok(Err(e)) => {
            warn!("[CONNECT] TCP connect failed: {}", e);
            Err(EslError::Connect {
                address,
                reason: e.to_string(),
            })
        }
        Err(_) => {
            warn!("[CONNECT] TCP connect timed out after {}ms", limit_ms);
            Err(EslError::Connect {
                address,
                reason: format!("timed out after {}ms", limit_ms),
            })
        }
    }
}

/// Read a single ESL message from the unsplit socket during the auth handshake.
async fn recv_message(
    stream: &mut TcpStream,
    parser: &mut EslParser,
    read_buffer: &mut [u8],
    limit_ms: u64,
) -> EslResult<EslMessage> {
    loop {
        if let Some(message) = parser.parse_message()? {
            trace!("[RECV] Parsed message: {:?}", message.content_type);
            return Ok(message);
        }

        let bytes_read = match timeout(
            Duration::from_millis(limit_ms),
            stream.read(read_buffer),
        )
        .await
        {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(EslError::Io(e)),
            Err(_) => {
                return Err(EslError::Timeout {
                    timeout_ms: limit_ms,
                })
            }
        };

        trace!("[RECV] Read {} bytes from socket", bytes_read);
        if bytes_read == 0 {
            parser.finish()?;
            return Err(EslError::ConnectionClosed);
        }

        parser.add_data(&read_buffer[..bytes_read])?;
    }
}

/// Perform authentication on the stream. Every failure is an authentication failure.
async fn authenticate(
    stream: &mut TcpStream,
    parser: &mut EslParser,
    read_buffer: &mut [u8],
    method: AuthMethod<'_>,
    limit_ms: u64,
) -> EslResult<()> {
    debug!("[AUTH] Waiting for auth request");
    let message = recv_message(stream, parser, read_buffer, limit_ms)
        .await
        .map_err(|e| EslError::auth_failed(format!("no auth request: {}", e)))?;

    match message.content_type {
        ContentType::AuthRequest => {}
        ContentType::RudeRejection => {
            let body = message
                .body
                .as_deref()
                .map(String::from_utf8_lossy)
                .unwrap_or_default()
                .trim()
                .to_string();
            return Err(EslError::auth_failed(format!("rejected: {}", body)));
        }
        other => {
            return Err(EslError::auth_failed(format!(
                "expected auth/request, got {}",
                other.as_str()
            )))
        }
    }

    let auth_cmd = match method {
        AuthMethod::Password(password) => EslCommand::Auth {
            password: password.to_string(),
        },
        AuthMethod::User { user, password } => EslCommand::UserAuth {
            user: user.to_string(),
            password: password.to_string(),
        },
    };

    let wire = auth_cmd.to_wire_bytes()?;
    debug!("[AUTH] Sending command: {}", auth_cmd.log_line(&wire));
    stream
        .write_all(&wire)
        .await
        .map_err(EslError::Io)?;

    let response = recv_message(stream, parser, read_buffer, limit_ms)
        .await
        .map_err(|e| EslError::auth_failed(format!("no auth reply: {}", e)))?
        .into_response();

    if !response.is_success() {
        return Err(EslError::auth_failed(
            response
                .reply_text()
                .unwrap_or("-ERR")
                .to_string(),
        ));
    }

    debug!("[AUTH] Authentication successful");
    Ok(())
}

/// Background reader loop
async fn reader_loop(
    reader: OwnedReadHalf,
    parser: EslParser,
    shared: Arc<SharedState>,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    queue: EventQueue,
    close_rx: watch::Receiver<bool>,
) {
    let inner = std::panic::AssertUnwindSafe(reader_loop_inner(
        reader, parser, &shared, &queue, close_rx,
    ));
    let reason = match futures_util::FutureExt::catch_unwind(inner).await {
        Ok(reason) => reason,
        Err(_) => {
            tracing::error!("reader task panicked");
            DisconnectReason::IoError("reader task panicked".to_string())
        }
    };
    // Dropping the queue lets the dispatcher drain what is left, then exit.
    drop(queue);
    shared
        .teardown(&writer, reason)
        .await;
}

async fn reader_loop_inner(
    mut reader: OwnedReadHalf,
    mut parser: EslParser,
    shared: &SharedState,
    queue: &EventQueue,
    mut close_rx: watch::Receiver<bool>,
) -> DisconnectReason {
    let mut read_buffer = vec![0u8; SOCKET_BUF_SIZE];

    loop {
        // Drain every complete frame already buffered before reading again
        loop {
            match parser.parse_message() {
                Ok(Some(message)) => {
                    if let Some(reason) = handle_message(message, shared, queue) {
                        return reason;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("[RECV] Parser error: {}", e);
                    return DisconnectReason::Framing(e.to_string());
                }
            }
        }

        let read_result = tokio::select! {
            changed = close_rx.changed() => {
                if changed.is_err() || *close_rx.borrow() {
                    return DisconnectReason::ClientRequested;
                }
                continue;
            }
            read = reader.read(&mut read_buffer) => read,
        };

        match read_result {
            Ok(0) => {
                if let Err(e) = parser.finish() {
                    warn!("[RECV] Connection closed mid-frame: {}", e);
                    return DisconnectReason::Framing(e.to_string());
                }
                info!("[RECV] Connection closed (EOF)");
                return DisconnectReason::ConnectionClosed;
            }
            Ok(n) => {
                trace!("[RECV] Read {} bytes from socket", n);
                if let Err(e) = parser.add_data(&read_buffer[..n]) {
                    warn!("[RECV] Buffer error: {}", e);
                    return DisconnectReason::Framing(e.to_string());
                }
            }
            Err(e) => {
                warn!("[RECV] Read error: {}", e);
                return DisconnectReason::IoError(e.to_string());
            }
        }
    }
}

/// Route one frame. Returns a reason when the frame ends the connection.
fn handle_message(
    message: EslMessage,
    shared: &SharedState,
    queue: &EventQueue,
) -> Option<DisconnectReason> {
    let content_type = message
        .content_type
        .clone();
    match content_type {
        ContentType::CommandReply | ContentType::ApiResponse => {
            shared.deliver_reply(message);
            None
        }
        ContentType::EventPlain | ContentType::EventJson | ContentType::EventXml => {
            match message.into_event() {
                Ok(event) => route_event(event, shared, queue),
                Err(e) => {
                    warn!("[RECV] Undecodable event: {}", e);
                    queue.push(Err(e));
                    None
                }
            }
        }
        ContentType::DisconnectNotice => {
            if message.header(HEADER_CONTENT_DISPOSITION) == Some("linger") {
                debug!("[RECV] Disconnect notice with linger disposition, draining");
                return None;
            }
            info!("[RECV] Received disconnect notice from server");
            Some(DisconnectReason::ServerNotice)
        }
        ContentType::RudeRejection => {
            warn!("[RECV] Connection rejected by server");
            Some(DisconnectReason::Rejected)
        }
        ContentType::AuthRequest | ContentType::Other(_) => {
            debug!("[RECV] Ignoring unexpected frame: {}", content_type.as_str());
            None
        }
    }
}

fn route_event(
    event: EslEvent,
    shared: &SharedState,
    queue: &EventQueue,
) -> Option<DisconnectReason> {
    if event.is_event_type(EslEventType::BackgroundJob) {
        if let Some(job_uuid) = event
            .job_uuid()
            .map(str::to_string)
        {
            if shared
                .jobs
                .is_registered(&job_uuid)
            {
                shared
                    .jobs
                    .fulfill(&job_uuid, event);
                return None;
            }
            debug!("[RECV] No waiter for job {}, dispatching", job_uuid);
        }
    }

    let hangup = event.is_hangup() && shared.closes_on_hangup(&event);
    if !queue.push(Ok(event)) {
        debug!("[RECV] Dispatcher gone, event dropped");
    }
    if hangup {
        info!("[RECV] Channel hung up without linger, closing session");
        return Some(DisconnectReason::Hangup);
    }
    None
}

impl EslClient {
    /// Connect to FreeSWITCH (inbound mode) with password authentication
    pub async fn connect(
        host: &str,
        port: u16,
        password: &str,
    ) -> EslResult<(Self, EslEventStream)> {
        Self::connect_inner(
            host,
            port,
            AuthMethod::Password(password),
            EslConnectOptions::default(),
        )
        .await
    }

    /// Connect to FreeSWITCH (inbound mode) with password authentication and custom options
    pub async fn connect_with_options(
        host: &str,
        port: u16,
        password: &str,
        options: EslConnectOptions,
    ) -> EslResult<(Self, EslEventStream)> {
        Self::connect_inner(host, port, AuthMethod::Password(password), options).await
    }

    /// Connect with user authentication
    ///
    /// The user must be in the format `user@domain` (e.g., `admin@default`).
    pub async fn connect_with_user(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        options: EslConnectOptions,
    ) -> EslResult<(Self, EslEventStream)> {
        Self::connect_inner(host, port, AuthMethod::User { user, password }, options).await
    }

    async fn connect_inner(
        host: &str,
        port: u16,
        method: AuthMethod<'_>,
        options: EslConnectOptions,
    ) -> EslResult<(Self, EslEventStream)> {
        if let AuthMethod::User { user, .. } = &method {
            if !user.contains('@') {
                return Err(EslError::auth_failed(format!(
                    "Invalid username format '{}': must be user@domain (e.g., admin@default)",
                    user
                )));
            }
        }

        let shared = SharedState::new(&options);
        shared.set_state(ConnectionState::Connecting);
        info!("[CONNECT] Connecting to FreeSWITCH at {}:{}", host, port);

        let mut stream = match tcp_connect_with_timeout(host, port, options.connect_timeout_ms).await
        {
            Ok(stream) => stream,
            Err(e) => {
                shared.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        shared.set_state(ConnectionState::Authenticating);
        let mut parser = EslParser::new();
        let mut read_buffer = vec![0u8; SOCKET_BUF_SIZE];

        if let Err(e) = authenticate(
            &mut stream,
            &mut parser,
            &mut read_buffer,
            method,
            options.connect_timeout_ms,
        )
        .await
        {
            warn!("[AUTH] {}", e);
            let _ = stream
                .shutdown()
                .await;
            shared.set_state(ConnectionState::Disconnected);
            return Err(e);
        }

        let (client, events) = Self::start(stream, parser, shared, &options);

        if let Some(subscription) = &options.subscription {
            if let Err(e) = client
                .handshake_subscribe(subscription)
                .await
            {
                client
                    .disconnect()
                    .await?;
                return Err(e);
            }
        }

        client
            .shared
            .enter_ready()?;
        info!("[CONNECT] Connected and authenticated to {}:{}", host, port);
        Ok((client, events))
    }

    /// Accept one outbound connection from FreeSWITCH and run the session handshake.
    pub async fn accept_outbound(listener: &TcpListener) -> EslResult<(Self, EslEventStream)> {
        Self::accept_outbound_with_options(
            listener,
            EslConnectOptions::default(),
            SessionMode::default(),
        )
        .await
    }

    /// Accept one outbound connection with custom options and session mode.
    pub async fn accept_outbound_with_options(
        listener: &TcpListener,
        options: EslConnectOptions,
        mode: SessionMode,
    ) -> EslResult<(Self, EslEventStream)> {
        info!("[ACCEPT] Waiting for outbound connection from FreeSWITCH");

        let (stream, addr) = listener
            .accept()
            .await
            .map_err(EslError::Io)?;
        info!("[ACCEPT] Accepted outbound connection from {}", addr);

        Self::from_outbound_stream(stream, &options, mode).await
    }

    /// Run the accept-mode handshake on a socket the switch opened to us.
    ///
    /// Sends `connect` and keeps the reply as [`channel_data`](Self::channel_data).
    /// In [`SessionMode::Async`] `myevents` follows; `linger` is sent when
    /// requested. No secret is exchanged.
    pub async fn from_outbound_stream(
        stream: TcpStream,
        options: &EslConnectOptions,
        mode: SessionMode,
    ) -> EslResult<(Self, EslEventStream)> {
        let shared = SharedState::new(options);
        shared.set_state(ConnectionState::Authenticating);
        shared
            .event_lock
            .store(mode == SessionMode::Sync, Ordering::Relaxed);

        let (client, events) = Self::start(stream, EslParser::new(), shared, options);

        if let Err(e) = client
            .session_handshake(options, mode)
            .await
        {
            warn!("[ACCEPT] Session handshake failed: {}", e);
            client
                .disconnect()
                .await?;
            return Err(e);
        }

        client
            .shared
            .enter_ready()?;
        info!(
            "[ACCEPT] Session {} ready",
            client
                .session_uuid()
                .unwrap_or("<unknown>")
        );
        Ok((client, events))
    }

    async fn session_handshake(&self, options: &EslConnectOptions, mode: SessionMode) -> EslResult<()> {
        let deadline = Some(Duration::from_millis(options.connect_timeout_ms));

        let channel_data = self
            .send_command_inner(EslCommand::Connect, deadline, CommandPhase::Handshake)
            .await?
            .into_ok()?
            .into_channel_data()?;

        match channel_data.header(EventHeader::SocketMode) {
            Some(reported) if !reported.eq_ignore_ascii_case(mode.socket_mode()) => warn!(
                "[ACCEPT] Session mode {:?} but switch reports Socket-Mode: {}",
                mode, reported
            ),
            _ => {}
        }
        // Set once per connection, before any event can be routed.
        let _ = self
            .shared
            .channel_data
            .set(channel_data);

        if mode == SessionMode::Async {
            let cmd = EslCommand::MyEvents {
                format: options
                    .subscription
                    .as_ref()
                    .map(|s| s.format)
                    .unwrap_or_default()
                    .to_string(),
                uuid: None,
            };
            self.send_command_inner(cmd, deadline, CommandPhase::Handshake)
                .await?
                .into_ok()?;
        }

        if let Some(subscription) = &options.subscription {
            self.handshake_subscribe(subscription)
                .await?;
        }

        if options.linger {
            let cmd = EslCommand::Linger { timeout: None };
            self.send_command_inner(cmd, deadline, CommandPhase::Handshake)
                .await?
                .into_ok()?;
        }
        Ok(())
    }

    async fn handshake_subscribe(&self, subscription: &EventSubscription) -> EslResult<()> {
        let cmd = EslCommand::Events {
            format: subscription
                .format
                .to_string(),
            events: subscription.event_list(),
        };
        self.send_command_inner(cmd, None, CommandPhase::Handshake)
            .await?
            .into_ok()?;
        debug!(
            "[CONNECT] Subscribed to {} ({})",
            subscription.event_list(),
            subscription.format
        );
        Ok(())
    }

    fn start(
        stream: TcpStream,
        parser: EslParser,
        shared: Arc<SharedState>,
        options: &EslConnectOptions,
    ) -> (Self, EslEventStream) {
        let queue_size = options
            .event_queue_size
            .max(1);

        let (read_half, write_half) = stream.into_split();
        let writer = Arc::new(Mutex::new(write_half));

        let (queue_tx, queue_rx) = mpsc::channel(queue_size);
        let (stream_tx, stream_rx) = mpsc::channel(queue_size);

        tokio::spawn(run_dispatcher(
            queue_rx,
            shared
                .handlers
                .clone(),
            stream_tx,
        ));
        tokio::spawn(reader_loop(
            read_half,
            parser,
            shared.clone(),
            writer.clone(),
            EventQueue::new(
                queue_tx,
                shared
                    .dropped_event_count
                    .clone(),
            ),
            shared
                .close_tx
                .subscribe(),
        ));

        let events = EslEventStream {
            rx: stream_rx,
            state_rx: shared
                .state_tx
                .subscribe(),
        };
        (EslClient { writer, shared }, events)
    }

    /// Send a command and wait for the reply using the configured command timeout.
    ///
    /// The reply is returned as-is; `-ERR` is not turned into an error here.
    pub async fn send_command(&self, command: EslCommand) -> EslResult<EslResponse> {
        let limit = self.command_timeout();
        self.send_command_inner(command, Some(limit), CommandPhase::Session)
            .await
    }

    /// Send a command and wait for its reply.
    ///
    /// The writer lock is held through the entire send-and-receive cycle, so
    /// concurrent callers queue in FIFO order and each sees its own reply.
    async fn send_command_inner(
        &self,
        command: EslCommand,
        deadline: Option<Duration>,
        phase: CommandPhase,
    ) -> EslResult<EslResponse> {
        self.check_state(phase)?;
        let wire = command.to_wire_bytes()?;

        let mut writer = self
            .writer
            .lock()
            .await;
        // The connection may have closed while we queued for the writer.
        self.check_state(phase)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut slot = self
                .shared
                .lock_reply();
            if slot.closed {
                return Err(EslError::ConnectionClosed);
            }
            slot.pending = Some(PendingCommand {
                tx,
                registers_job: phase == CommandPhase::BackgroundJob,
            });
        }

        debug!("[SEND] {}", command.log_line(&wire));
        if let Err(e) = writer
            .write_all(&wire)
            .await
        {
            self.shared
                .lock_reply()
                .pending
                .take();
            return Err(EslError::Io(e));
        }

        let received = match deadline {
            Some(limit) => match timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => return Err(self.abandon_reply(limit)),
            },
            None => rx.await,
        };
        drop(writer);

        let response = received.map_err(|_| EslError::ConnectionClosed)?;
        debug!("[SEND] Reply: success={}", response.is_success());
        Ok(response)
    }

    /// Give up on the pending reply. If it has not arrived yet, the next
    /// reply on the wire belongs to this command and must be discarded.
    fn abandon_reply(&self, limit: Duration) -> EslError {
        let mut slot = self
            .shared
            .lock_reply();
        if slot
            .pending
            .take()
            .is_some()
        {
            slot.stale += 1;
        }
        warn!("[SEND] Command timed out after {}ms", limit.as_millis());
        EslError::Timeout {
            timeout_ms: limit.as_millis() as u64,
        }
    }

    fn check_state(&self, phase: CommandPhase) -> EslResult<()> {
        phase.admits(self.state())
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_millis(
            self.shared
                .command_timeout_ms
                .load(Ordering::Relaxed),
        )
    }

    /// Send a raw command line and wait for its reply.
    ///
    /// Fails with [`EslError::CommandRejected`] when the reply is `-ERR`.
    ///
    /// ```rust,no_run
    /// # async fn example(client: &esl_bridge::EslClient) -> Result<(), esl_bridge::EslError> {
    /// let reply = client.execute("api status").await?;
    /// println!("{}", reply.body().unwrap_or(""));
    /// # Ok(())
    /// # }
    /// ```
    pub async fn execute(&self, command_text: &str) -> EslResult<EslResponse> {
        self.execute_timeout(command_text, Some(self.command_timeout()))
            .await
    }

    /// [`execute`](Self::execute) with an explicit deadline. `None` waits indefinitely.
    ///
    /// A reply arriving after the deadline is consumed and discarded, so the
    /// next command still sees its own reply.
    pub async fn execute_timeout(
        &self,
        command_text: &str,
        deadline: Option<Duration>,
    ) -> EslResult<EslResponse> {
        let cmd = EslCommand::Raw {
            command: command_text.to_string(),
        };
        self.send_command_inner(cmd, deadline, CommandPhase::Session)
            .await?
            .into_result()
    }

    /// Send `bgapi <command_text>` and return the Job-UUID from the `+OK` reply.
    ///
    /// The job is registered before any later frame is read, so the result
    /// can never be missed. Collect it with
    /// [`await_background_job`](Self::await_background_job).
    pub async fn execute_background(&self, command_text: &str) -> EslResult<String> {
        let command = EslCommand::BgApi {
            command: strip_bgapi_prefix(command_text).to_string(),
        };
        let limit = self.command_timeout();
        let response = self
            .send_command_inner(command, Some(limit), CommandPhase::BackgroundJob)
            .await?
            .into_result()?;
        response
            .job_uuid()
            .map(str::to_string)
            .ok_or_else(|| EslError::protocol_error("bgapi reply carried no Job-UUID"))
    }

    /// Wait for the `BACKGROUND_JOB` event of a job started on this connection.
    ///
    /// Only the caller waiting on `job_uuid` is blocked. On teardown the
    /// wait fails with [`EslError::ConnectionClosed`].
    pub async fn await_background_job(
        &self,
        job_uuid: &str,
        deadline: Option<Duration>,
    ) -> EslResult<EslEvent> {
        self.shared
            .jobs
            .wait(job_uuid, deadline)
            .await
    }

    /// Number of background jobs still waiting for their result.
    pub fn pending_job_count(&self) -> usize {
        self.shared
            .jobs
            .pending_count()
    }

    /// Number of finished background jobs whose result nobody has collected.
    ///
    /// Bounded by [`MAX_UNCLAIMED_JOB_RESULTS`](crate::constants::MAX_UNCLAIMED_JOB_RESULTS);
    /// the oldest result is dropped past that.
    pub fn unclaimed_job_count(&self) -> usize {
        self.shared
            .jobs
            .unclaimed_count()
    }

    /// Execute API command. Blocks until FreeSWITCH completes the command.
    ///
    /// FreeSWITCH blocks the ESL socket during `api`: no events are delivered
    /// until it returns. Use [`bgapi`](Self::bgapi) for long-running commands.
    pub async fn api(&self, command: &str) -> EslResult<EslResponse> {
        self.send_command(EslCommand::Api {
            command: command.to_string(),
        })
        .await?
        .into_result()
    }

    /// Execute background API command.
    ///
    /// The reply carries the `Job-UUID`. The job is not tracked: its
    /// `BACKGROUND_JOB` event is dispatched like any other event. Use
    /// [`execute_background`](Self::execute_background) to await the result.
    pub async fn bgapi(&self, command: &str) -> EslResult<EslResponse> {
        self.send_command(EslCommand::BgApi {
            command: strip_bgapi_prefix(command).to_string(),
        })
        .await?
        .into_result()
    }

    /// Subscribe to events by typed enum variants.
    ///
    /// For `CUSTOM` event subclasses (e.g., `sofia::register`), use
    /// [`subscribe_events_raw`](Self::subscribe_events_raw) instead.
    pub async fn subscribe_events(
        &self,
        format: EventFormat,
        events: &[EslEventType],
    ) -> EslResult<()> {
        let events_str = if events.is_empty() || events.contains(&EslEventType::All) {
            EslEventType::All.to_string()
        } else {
            event_types_to_string(events)
        };
        self.subscribe_events_raw(format, &events_str)
            .await
    }

    /// Subscribe to events using raw event name strings.
    pub async fn subscribe_events_raw(&self, format: EventFormat, events: &str) -> EslResult<()> {
        let cmd = EslCommand::Events {
            format: format.to_string(),
            events: events.to_string(),
        };
        self.send_command_ok(cmd)
            .await?;
        info!("Subscribed to events '{}' with format {}", events, format);
        Ok(())
    }

    /// Set event filter
    pub async fn filter_events(&self, header: &str, value: &str) -> EslResult<()> {
        let cmd = EslCommand::Filter {
            header: header.to_string(),
            value: value.to_string(),
        };
        self.send_command_ok(cmd)
            .await?;
        debug!("Set event filter: {} = {}", header, value);
        Ok(())
    }

    /// Execute a dialplan application on a channel via `sendmsg`.
    ///
    /// In [`SessionMode::Sync`] sessions the message carries `event-lock: true`
    /// so applications run in order.
    pub async fn execute_app(
        &self,
        app: &str,
        args: Option<&str>,
        uuid: Option<&str>,
    ) -> EslResult<EslResponse> {
        let cmd = EslCommand::Execute {
            app: app.to_string(),
            args: args.map(|s| s.to_string()),
            uuid: uuid.map(|s| s.to_string()),
            event_lock: self
                .shared
                .event_lock
                .load(Ordering::Relaxed),
        };
        self.send_command(cmd)
            .await?
            .into_result()
    }

    /// Send message to channel
    pub async fn sendmsg(&self, uuid: Option<&str>, event: EslEvent) -> EslResult<EslResponse> {
        let cmd = EslCommand::SendMsg {
            uuid: uuid.map(|s| s.to_string()),
            event,
        };
        self.send_command(cmd)
            .await?
            .into_result()
    }

    /// Subscribe to session events.
    ///
    /// Without a UUID this targets the session attached to an outbound socket.
    pub async fn myevents(&self, format: EventFormat, uuid: Option<&str>) -> EslResult<()> {
        let cmd = EslCommand::MyEvents {
            format: format.to_string(),
            uuid: uuid.map(|s| s.to_string()),
        };
        self.send_command_ok(cmd)
            .await
    }

    /// Keep the socket open after the channel hangs up (outbound mode).
    ///
    /// With linger the switch sends a `text/disconnect-notice` with
    /// `Content-Disposition: linger` and keeps the socket open so the final
    /// events can be drained. Pass `None` for indefinite linger.
    pub async fn linger(&self, timeout: Option<u32>) -> EslResult<()> {
        self.send_command_ok(EslCommand::Linger { timeout })
            .await?;
        self.shared
            .linger
            .store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Cancel linger mode (outbound mode).
    pub async fn nolinger(&self) -> EslResult<()> {
        self.send_command_ok(EslCommand::NoLinger)
            .await?;
        self.shared
            .linger
            .store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Resume dialplan execution when the socket disconnects (outbound mode).
    pub async fn resume(&self) -> EslResult<()> {
        self.send_command_ok(EslCommand::Resume)
            .await
    }

    /// Read a channel variable (outbound mode).
    ///
    /// `getvar` returns the raw value in `Reply-Text` with no `+OK`/`-ERR`
    /// prefix; a missing variable is an empty string.
    pub async fn getvar(&self, name: &str) -> EslResult<String> {
        let response = self
            .send_command(EslCommand::GetVar {
                name: name.to_string(),
            })
            .await?;
        Ok(response
            .reply_text()
            .unwrap_or("")
            .to_string())
    }

    /// Send the `exit` command; the switch replies and then closes the socket.
    pub async fn exit(&self) -> EslResult<EslResponse> {
        self.send_command(EslCommand::Exit)
            .await
    }

    /// Send a command and require a `+OK` response, discarding the body.
    async fn send_command_ok(&self, command: EslCommand) -> EslResult<()> {
        self.send_command(command)
            .await?
            .into_ok()
            .map(|_| ())
    }

    /// Route events named `event_name` to `handler` instead of the event stream.
    ///
    /// `CUSTOM` subclasses are addressed as `CUSTOM <subclass>`. Handlers run
    /// on the dispatcher task and never block frame reads.
    pub fn register_handler<F>(&self, event_name: &str, handler: F)
    where
        F: Fn(EslEvent) + Send + Sync + 'static,
    {
        let handler: EventHandler = Arc::new(handler);
        self.shared
            .handlers
            .register(event_name, handler);
    }

    /// Remove the handler for `event_name`. Returns `false` if none was set.
    pub fn unregister_handler(&self, event_name: &str) -> bool {
        self.shared
            .handlers
            .unregister(event_name)
    }

    /// Handler for events with no name-specific handler. Without one, such
    /// events go to the [`EslEventStream`].
    pub fn set_default_handler<F>(&self, handler: F)
    where
        F: Fn(EslEvent) + Send + Sync + 'static,
    {
        let handler: EventHandler = Arc::new(handler);
        self.shared
            .handlers
            .set_fallback(Some(handler));
    }

    /// Remove the default handler.
    pub fn clear_default_handler(&self) {
        self.shared
            .handlers
            .set_fallback(None);
    }

    /// Run `hook` once when the connection is torn down, after all waiters
    /// have been failed. Runs immediately if teardown already happened.
    /// Replaces a previously set hook.
    pub fn on_disconnect<F>(&self, hook: F)
    where
        F: FnOnce(DisconnectReason) + Send + 'static,
    {
        let mut hooks = self
            .shared
            .lock_hooks();
        match hooks
            .fired
            .clone()
        {
            Some(reason) => {
                drop(hooks);
                hook(reason);
            }
            None => hooks.hook = Some(Box::new(hook)),
        }
    }

    /// Channel variables returned by `connect` (accept mode only).
    pub fn channel_data(&self) -> Option<&EslEvent> {
        self.shared
            .channel_data
            .get()
    }

    /// `Unique-ID` of the session's channel (accept mode only).
    pub fn session_uuid(&self) -> Option<&str> {
        self.channel_data()?
            .unique_id()
    }

    /// Number of events dropped due to a full event queue.
    pub fn dropped_event_count(&self) -> u64 {
        self.shared
            .dropped_event_count
            .load(Ordering::Relaxed)
    }

    /// Set the default command response timeout (default: 5 seconds).
    pub fn set_command_timeout(&self, duration: Duration) {
        self.shared
            .command_timeout_ms
            .store(duration.as_millis() as u64, Ordering::Relaxed);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.shared
            .state()
    }

    /// Whether application commands are accepted.
    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Whether the connection is alive (not closing or closed).
    pub fn is_connected(&self) -> bool {
        !matches!(
            self.state(),
            ConnectionState::Closing | ConnectionState::Disconnected
        )
    }

    /// Why the connection ended, once it has.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.shared
            .lock_hooks()
            .fired
            .clone()
    }

    /// Wait until teardown has finished.
    pub async fn closed(&self) {
        let mut state_rx = self
            .shared
            .state_tx
            .subscribe();
        let _ = state_rx
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await;
    }

    /// Close the connection and wait for teardown.
    ///
    /// Pending commands and background-job waiters fail with
    /// [`EslError::ConnectionClosed`]. Calling it again is a no-op.
    pub async fn disconnect(&self) -> EslResult<()> {
        if self.state() != ConnectionState::Disconnected {
            info!("Client requested disconnect");
            self.shared
                .close_tx
                .send_replace(true);
            self.closed()
                .await;
        }
        Ok(())
    }
}

impl EslEventStream {
    /// Receive the next unhandled event, or None once the connection is gone
    /// and the queue is drained.
    ///
    /// Returns `Err(EslError::QueueFull)` once per overflow episode when
    /// events were dropped. Undecodable events are also surfaced here.
    pub async fn recv(&mut self) -> Option<Result<EslEvent, EslError>> {
        self.rx
            .recv()
            .await
    }

    /// Current lifecycle state of the owning connection.
    pub fn state(&self) -> ConnectionState {
        *self
            .state_rx
            .borrow()
    }

    /// Whether the connection is alive (not closing or closed).
    pub fn is_connected(&self) -> bool {
        !matches!(
            self.state(),
            ConnectionState::Closing | ConnectionState::Disconnected
        )
    }
}

impl futures_util::Stream for EslEventStream {
    type Item = Result<EslEvent, EslError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx
            .poll_recv(cx)
    }
}
