//! Server-to-client pushes.
//!
//! Each message travels as its own frame: the message type's wire id followed
//! by the type-specific payload.

use crate::buf::WireBuf;
use crate::command::CommandResult;
use crate::connection::ConnectionId;
use crate::error::EncodeError;
use crate::registry::{parse_name, ClassRegistry, RegistryEntry, RegistryError};
use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tickwire_core::RegistryKey;
use tokio::sync::mpsc;

/// Registry label for message types.
pub const MESSAGES_REGISTRY: &str = "tickwire:messages";

/// A push the server can send.
pub trait Message: Send + Sync + 'static {
    /// Registered name.
    const NAME: &'static str;

    /// Append the payload that follows the wire id.
    fn write_payload(&self, buf: &mut WireBuf) -> Result<(), EncodeError>;
}

/// Reasons a message could not be queued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    /// The Rust type was never registered.
    #[error("message type {0} is not registered")]
    NotRegistered(&'static str),
    /// Payload could not be encoded.
    #[error(transparent)]
    Encode(#[from] EncodeError),
    /// A context message was already written.
    #[error("context message was already written")]
    AlreadyWritten,
    /// A context message was sent through a different connection.
    #[error("context message for {expected} sent through {actual}")]
    WrongConnection {
        /// Connection the message is bound to.
        expected: ConnectionId,
        /// Connection it was offered to.
        actual: ConnectionId,
    },
    /// The connection is not active.
    #[error("connection is not active")]
    NotActive,
    /// The connection's send queue is gone.
    #[error("connection closed")]
    Closed,
    /// The encoded frame is larger than the transport accepts.
    #[error("message frame of {len} bytes exceeds limit of {max}")]
    TooLarge {
        /// Encoded frame length.
        len: usize,
        /// Transport frame cap.
        max: usize,
    },
}

/// Registry entry for a message type.
#[derive(Debug)]
pub struct MessageType {
    name: RegistryKey,
}

impl MessageType {
    /// Entry for `M`.
    pub fn of<M: Message>() -> Result<Self, RegistryError> {
        Ok(Self {
            name: parse_name(M::NAME)?,
        })
    }
}

impl RegistryEntry for MessageType {
    fn name(&self) -> &RegistryKey {
        &self.name
    }
}

/// Message registry plus the reverse lookup from Rust type to wire id.
#[derive(Debug)]
pub struct MessageRegistry {
    registry: ClassRegistry<MessageType>,
    by_type: HashMap<TypeId, u32>,
}

impl MessageRegistry {
    pub(crate) fn new(label: RegistryKey) -> Self {
        Self {
            registry: ClassRegistry::new(label),
            by_type: HashMap::new(),
        }
    }

    pub(crate) fn register<M: Message>(&mut self) -> Result<(), RegistryError> {
        let id = self.registry.len() as u32;
        self.registry.register(MessageType::of::<M>()?)?;
        self.by_type.insert(TypeId::of::<M>(), id);
        Ok(())
    }

    pub(crate) fn finalize(&mut self) {
        self.registry.finalize();
    }

    /// Underlying name/id table.
    pub fn registry(&self) -> &ClassRegistry<MessageType> {
        &self.registry
    }

    /// Wire id of `M`.
    pub fn id_of<M: Message>(&self) -> Option<u32> {
        if !self.registry.is_finalized() {
            return None;
        }
        self.by_type.get(&TypeId::of::<M>()).copied()
    }

    /// Encode `message` as a complete frame.
    pub fn encode<M: Message>(&self, message: &M) -> Result<Vec<u8>, MessageError> {
        let id = self
            .id_of::<M>()
            .ok_or(MessageError::NotRegistered(type_name::<M>()))?;
        let mut buf = WireBuf::new();
        buf.write_var_u32(id);
        message.write_payload(&mut buf)?;
        Ok(buf.into_vec())
    }
}

/// Result of one command, correlated by the uid the client chose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResultMsg {
    /// Correlation token from the request.
    pub uid: u64,
    /// What happened.
    pub result: CommandResult,
}

impl Message for CommandResultMsg {
    const NAME: &'static str = "tickwire:command_result";

    fn write_payload(&self, buf: &mut WireBuf) -> Result<(), EncodeError> {
        buf.write_var_u64(self.uid);
        self.result.write(buf)
    }
}

/// A message bound to one connection that may be written only once.
#[derive(Debug)]
pub struct ContextMessage<M> {
    connection: ConnectionId,
    written: AtomicBool,
    message: M,
}

impl<M: Message> ContextMessage<M> {
    /// Bind `message` to `connection`.
    pub fn new(connection: ConnectionId, message: M) -> Self {
        Self {
            connection,
            written: AtomicBool::new(false),
            message,
        }
    }

    /// Connection the message belongs to.
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Whether the message has already been written.
    pub fn is_written(&self) -> bool {
        self.written.load(Ordering::Acquire)
    }

    /// Wrapped message.
    pub fn get(&self) -> &M {
        &self.message
    }

    fn claim(&self, through: ConnectionId) -> Result<&M, MessageError> {
        if through != self.connection {
            return Err(MessageError::WrongConnection {
                expected: self.connection,
                actual: through,
            });
        }
        if self.written.swap(true, Ordering::AcqRel) {
            return Err(MessageError::AlreadyWritten);
        }
        Ok(&self.message)
    }
}

/// Ordered send queue of one connection.
///
/// Frames are handed to a single writer task, so they reach the transport in
/// the order they were queued.
#[derive(Debug, Clone)]
pub struct Outbox {
    connection: ConnectionId,
    messages: Arc<MessageRegistry>,
    max_frame: Option<usize>,
    frames: mpsc::UnboundedSender<Vec<u8>>,
}

impl Outbox {
    pub(crate) fn new(
        connection: ConnectionId,
        messages: Arc<MessageRegistry>,
        max_frame: Option<usize>,
    ) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (frames, rx) = mpsc::unbounded_channel();
        (
            Self {
                connection,
                messages,
                max_frame,
                frames,
            },
            rx,
        )
    }

    /// Connection this queue feeds.
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Encode and queue `message`. Frames over the transport cap are refused here.
    pub fn send<M: Message>(&self, message: &M) -> Result<(), MessageError> {
        let frame = self.messages.encode(message)?;
        if let Some(max) = self.max_frame.filter(|max| frame.len() > *max) {
            return Err(MessageError::TooLarge {
                len: frame.len(),
                max,
            });
        }
        self.frames.send(frame).map_err(|_| MessageError::Closed)
    }

    /// Queue a context message, enforcing its binding and write-once rule.
    pub fn send_bound<M: Message>(&self, message: &ContextMessage<M>) -> Result<(), MessageError> {
        let inner = message.claim(self.connection)?;
        self.send(inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ping(u8);

    impl Message for Ping {
        const NAME: &'static str = "test:ping";

        fn write_payload(&self, buf: &mut WireBuf) -> Result<(), EncodeError> {
            buf.write_u8(self.0);
            Ok(())
        }
    }

    struct Unregistered;

    impl Message for Unregistered {
        const NAME: &'static str = "test:unregistered";

        fn write_payload(&self, _buf: &mut WireBuf) -> Result<(), EncodeError> {
            Ok(())
        }
    }

    fn registry() -> Arc<MessageRegistry> {
        let mut messages = MessageRegistry::new(RegistryKey::parse(MESSAGES_REGISTRY).unwrap());
        messages.register::<CommandResultMsg>().unwrap();
        messages.register::<Ping>().unwrap();
        messages.finalize();
        Arc::new(messages)
    }

    #[test]
    fn frames_start_with_wire_id() {
        let messages = registry();
        assert_eq!(messages.encode(&Ping(9)).unwrap(), vec![1, 9]);
        assert_eq!(
            messages.encode(&Unregistered),
            Err(MessageError::NotRegistered(type_name::<Unregistered>()))
        );
    }

    #[test]
    fn result_message_layout() {
        let messages = registry();
        let frame = messages
            .encode(&CommandResultMsg {
                uid: 7,
                result: CommandResult::success(),
            })
            .unwrap();
        assert_eq!(frame, vec![0, 7, 1]);
    }

    #[test]
    fn context_messages_are_write_once() {
        let (outbox, mut rx) = Outbox::new(ConnectionId(1), registry(), None);
        let message = ContextMessage::new(ConnectionId(1), Ping(3));
        outbox.send_bound(&message).unwrap();
        assert!(message.is_written());
        assert_eq!(outbox.send_bound(&message), Err(MessageError::AlreadyWritten));
        assert_eq!(rx.try_recv().unwrap(), vec![1, 3]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn context_messages_reject_other_connections() {
        let (outbox, _rx) = Outbox::new(ConnectionId(2), registry(), None);
        let message = ContextMessage::new(ConnectionId(1), Ping(3));
        assert_eq!(
            outbox.send_bound(&message),
            Err(MessageError::WrongConnection {
                expected: ConnectionId(1),
                actual: ConnectionId(2)
            })
        );
        assert!(!message.is_written());
    }

    #[test]
    fn closed_queue_reports_closed() {
        let (outbox, rx) = Outbox::new(ConnectionId(1), registry(), None);
        drop(rx);
        assert_eq!(outbox.send(&Ping(1)), Err(MessageError::Closed));
    }

    #[test]
    fn frames_over_the_cap_are_refused_before_queueing() {
        let (outbox, mut rx) = Outbox::new(ConnectionId(1), registry(), Some(2));
        outbox.send(&Ping(1)).unwrap();
        let oversized = CommandResultMsg {
            uid: 1,
            result: CommandResult::fail("too long to fit"),
        };
        assert!(matches!(
            outbox.send(&oversized),
            Err(MessageError::TooLarge { max: 2, .. })
        ));
        assert_eq!(rx.try_recv().unwrap(), vec![1, 1]);
        assert!(rx.try_recv().is_err());
    }
}
