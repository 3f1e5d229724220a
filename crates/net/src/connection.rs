//! Per-peer protocol state machine.
//!
//! `Connected -> Active -> Closed`. The establish sequence syncs the registry
//! snapshot; after that the receive loop feeds command entries to the
//! connection's [`CommandContext`] while a writer task drains the outbox.

use crate::buf::WireBuf;
use crate::context::CommandContext;
use crate::host::Host;
use crate::message::{Message, MessageError, Outbox};
use crate::service::RegistryService;
use crate::transport::{Transport, TransportError};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Process-unique connection number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Allocate the next id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Closed set of close reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// Orderly close.
    Normal,
    /// Host is shutting down.
    GoingAway,
    /// Peer sent malformed or policy-violating data.
    ProtocolViolation,
    /// Engine fault.
    InternalError,
}

impl CloseCode {
    /// Numeric code carried by transports.
    pub fn code(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::ProtocolViolation => 1008,
            CloseCode::InternalError => 1011,
        }
    }

    /// Inverse of [`CloseCode::code`].
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            1000 => Some(CloseCode::Normal),
            1001 => Some(CloseCode::GoingAway),
            1008 => Some(CloseCode::ProtocolViolation),
            1011 => Some(CloseCode::InternalError),
            _ => None,
        }
    }

    /// Normal and going-away closes are not failures.
    pub fn is_normal(self) -> bool {
        matches!(self, CloseCode::Normal | CloseCode::GoingAway)
    }
}

/// Code plus human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Reason code.
    pub code: CloseCode,
    /// Free-form description.
    pub message: String,
}

impl CloseReason {
    /// Reason with the given code.
    pub fn new(code: CloseCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Orderly close.
    pub fn normal(message: impl Into<String>) -> Self {
        Self::new(CloseCode::Normal, message)
    }

    /// Host shutdown.
    pub fn going_away(message: impl Into<String>) -> Self {
        Self::new(CloseCode::GoingAway, message)
    }

    /// Peer misbehaved.
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::new(CloseCode::ProtocolViolation, message)
    }

    /// Engine fault.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(CloseCode::InternalError, message)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({}): {}", self.code, self.code.code(), self.message)
    }
}

/// Connection-level faults.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// Engine fault; closes with internal-error.
    #[error("internal error: {0}")]
    Internal(String),
    /// Peer violated the protocol; closes with protocol-violation.
    #[error("protocol violation: {0}")]
    ViolatedPolicy(String),
    /// The connection is gone.
    #[error("disconnected: {reason}")]
    Disconnected {
        /// Whether the close was orderly.
        normal: bool,
        /// Recorded reason.
        reason: CloseReason,
    },
    /// Operation not legal in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl ConnectionError {
    /// Reason to close with when this error ends the connection.
    pub fn close_reason(&self) -> CloseReason {
        match self {
            ConnectionError::Internal(message) | ConnectionError::InvalidState(message) => {
                CloseReason::internal(message.clone())
            }
            ConnectionError::ViolatedPolicy(message) => {
                CloseReason::protocol_violation(message.clone())
            }
            ConnectionError::Disconnected { reason, .. } => reason.clone(),
        }
    }
}

impl From<TransportError> for ConnectionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed { reason } => {
                let reason =
                    reason.unwrap_or_else(|| CloseReason::normal("connection closed by peer"));
                ConnectionError::Disconnected {
                    normal: reason.code.is_normal(),
                    reason,
                }
            }
            TransportError::FrameTooLarge { .. } => ConnectionError::ViolatedPolicy(err.to_string()),
            other => ConnectionError::Internal(other.to_string()),
        }
    }
}

/// Observable lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    /// Waiting for the establish sequence.
    Connected,
    /// Established; commands flow.
    Active,
    /// Terminal, with the first recorded reason.
    Closed(CloseReason),
}

enum State<H: Host> {
    Connected,
    Active(CommandContext<H>),
    Closed(CloseReason),
}

/// One client's session.
pub struct Connection<H: Host> {
    id: ConnectionId,
    host: Arc<H>,
    registries: Arc<RegistryService<H>>,
    transport: Arc<dyn Transport>,
    state: Mutex<State<H>>,
    closed: CancellationToken,
    outbox: Outbox,
    outbound: StdMutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl<H: Host> Connection<H> {
    /// Wrap a freshly accepted transport.
    pub fn new(
        host: Arc<H>,
        registries: Arc<RegistryService<H>>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let id = ConnectionId::next();
        let (outbox, outbound) =
            Outbox::new(id, Arc::clone(registries.messages()), transport.max_frame_len());
        debug!(connection = %id, peer = %transport.peer(), "Connection opened");
        Arc::new(Self {
            id,
            host,
            registries,
            transport,
            state: Mutex::new(State::Connected),
            closed: CancellationToken::new(),
            outbox,
            outbound: StdMutex::new(Some(outbound)),
        })
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Peer identity from the transport.
    pub fn peer(&self) -> String {
        self.transport.peer()
    }

    /// Current lifecycle state.
    pub async fn lifecycle(&self) -> Lifecycle {
        match &*self.state.lock().await {
            State::Connected => Lifecycle::Connected,
            State::Active(_) => Lifecycle::Active,
            State::Closed(reason) => Lifecycle::Closed(reason.clone()),
        }
    }

    /// Command context, once active.
    pub async fn context(&self) -> Option<CommandContext<H>> {
        match &*self.state.lock().await {
            State::Active(ctx) => Some(ctx.clone()),
            _ => None,
        }
    }

    /// Resolves when the connection reaches `Closed`.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Queue a message. Only legal while active.
    pub async fn send<M: Message>(&self, message: &M) -> Result<(), MessageError> {
        match &*self.state.lock().await {
            State::Active(_) => self.outbox.send(message),
            _ => Err(MessageError::NotActive),
        }
    }

    /// Run the establish sequence and become active.
    ///
    /// 1. send the 8-byte snapshot checksum
    /// 2. read `cache_hit`
    /// 3. send the snapshot unless the client has it
    /// 4. read `init_ok`
    ///
    /// Any failure closes the connection with the matching reason.
    pub async fn establish(self: &Arc<Self>) -> Result<CommandContext<H>, ConnectionError> {
        if !matches!(*self.state.lock().await, State::Connected) {
            return Err(ConnectionError::InvalidState(
                "establish is only legal on a new connection".into(),
            ));
        }

        if let Err(err) = self.handshake().await {
            warn!(connection = %self.id, peer = %self.peer(), %err, "Establish failed");
            self.close(err.close_reason()).await;
            return Err(err);
        }

        let ctx = {
            let mut state = self.state.lock().await;
            if let State::Closed(reason) = &*state {
                return Err(ConnectionError::Disconnected {
                    normal: reason.code.is_normal(),
                    reason: reason.clone(),
                });
            }
            let ctx = CommandContext::new(
                self.id,
                Arc::clone(&self.host),
                Arc::clone(&self.registries),
                self.outbox.clone(),
            );
            *state = State::Active(ctx.clone());
            ctx
        };
        self.spawn_writer();
        info!(connection = %self.id, peer = %self.peer(), "Connection established");
        Ok(ctx)
    }

    async fn handshake(&self) -> Result<(), ConnectionError> {
        let snapshot = self.registries.snapshot();

        debug!(connection = %self.id, checksum = format_args!("{:016x}", snapshot.checksum()), "Sending snapshot checksum");
        self.transport
            .send(snapshot.checksum().to_be_bytes().to_vec())
            .await?;

        let cache_hit = self.receive_bool("cache_hit").await?;
        if cache_hit {
            debug!(connection = %self.id, "Client has cached snapshot");
        } else {
            debug!(connection = %self.id, bytes = snapshot.bytes().len(), "Sending registry snapshot");
            self.transport.send(snapshot.bytes().to_vec()).await?;
        }

        if !self.receive_bool("init_ok").await? {
            return Err(ConnectionError::ViolatedPolicy(
                "client signaled establishing failure".into(),
            ));
        }
        Ok(())
    }

    async fn receive_bool(&self, field: &str) -> Result<bool, ConnectionError> {
        let mut buf = WireBuf::from(self.transport.receive().await?);
        let value = buf
            .read_bool()
            .map_err(|err| ConnectionError::ViolatedPolicy(format!("bad {field}: {err}")))?;
        if buf.has_remaining() {
            return Err(ConnectionError::ViolatedPolicy(format!(
                "{} trailing bytes after {field}",
                buf.remaining()
            )));
        }
        Ok(value)
    }

    fn spawn_writer(self: &Arc<Self>) {
        let Some(mut frames) = self
            .outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        else {
            return;
        };
        let transport = Arc::clone(&self.transport);
        let closed = self.closed.clone();
        let connection: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    biased;
                    _ = closed.cancelled() => break,
                    frame = frames.recv() => frame,
                };
                let Some(frame) = frame else { break };
                if let Err(err) = transport.send(frame).await {
                    // An outbound frame over the cap is our fault, not the peer's.
                    let err = match err {
                        TransportError::FrameTooLarge { len, max } => ConnectionError::Internal(
                            format!("outbound frame of {len} bytes exceeds limit of {max}"),
                        ),
                        other => ConnectionError::from(other),
                    };
                    if let Some(connection) = connection.upgrade() {
                        connection.close(err.close_reason()).await;
                    }
                    break;
                }
            }
        });
    }

    /// Receive loop. Returns once the connection is closed.
    ///
    /// Entries within a frame are dispatched in order; each command runs
    /// concurrently and its result may arrive in any order.
    pub async fn run(self: &Arc<Self>) -> CloseReason {
        let Some(ctx) = self.context().await else {
            // Already closed returns the recorded reason.
            return self
                .close(CloseReason::internal("receive loop started before establish"))
                .await;
        };

        loop {
            let received = tokio::select! {
                _ = self.closed.cancelled() => break,
                received = self.transport.receive() => received,
            };
            let frame = match received {
                Ok(frame) => frame,
                Err(err) => {
                    let err = ConnectionError::from(err);
                    debug!(connection = %self.id, %err, "Receive ended");
                    return self.close(err.close_reason()).await;
                }
            };

            let mut buf = WireBuf::from(frame);
            while buf.has_remaining() {
                match ctx.execute_from_buffer(&mut buf) {
                    Ok(uid) => trace!(connection = %self.id, uid, "Dispatched command"),
                    Err(err) => {
                        warn!(connection = %self.id, peer = %self.peer(), %err, "Closing connection");
                        return self.close(err.close_reason()).await;
                    }
                }
            }
        }

        self.close(CloseReason::normal("connection closed")).await
    }

    /// Establish, then run the receive loop until closed.
    pub async fn serve(self: Arc<Self>) -> CloseReason {
        match self.establish().await {
            Ok(_) => self.run().await,
            Err(err) => err.close_reason(),
        }
    }

    /// Close the connection. Idempotent: the first reason wins and every call
    /// returns it.
    ///
    /// Cancels the command context and waits for its commands to stop, then
    /// closes the transport unless the peer already did.
    pub async fn close(&self, reason: CloseReason) -> CloseReason {
        let mut state = self.state.lock().await;
        if let State::Closed(first) = &*state {
            return first.clone();
        }
        let previous = std::mem::replace(&mut *state, State::Closed(reason.clone()));
        if let State::Active(ctx) = previous {
            ctx.cancel().await;
        }
        self.closed.cancel();
        if !self.transport.is_closed() {
            self.transport.close(&reason).await;
        }
        if reason.code.is_normal() {
            info!(connection = %self.id, peer = %self.peer(), %reason, "Connection closed");
        } else {
            warn!(connection = %self.id, peer = %self.peer(), %reason, "Connection closed");
        }
        reason
    }
}
