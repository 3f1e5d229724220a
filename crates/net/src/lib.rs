#![warn(missing_docs)]
//! Connection protocol engine: wire buffer, registries, command pipeline,
//! connection lifecycle and the tick-synchronized scheduler.

pub mod buf;
pub mod command;
pub mod connection;
pub mod context;
pub mod error;
pub mod host;
pub mod message;
pub mod primitive;
pub mod protocol;
pub mod quic;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod snapshot;
pub mod transport;
pub mod varint;

pub use buf::WireBuf;
pub use command::{Command, CommandResult, CommandType};
pub use connection::{CloseCode, CloseReason, Connection, ConnectionError, ConnectionId, Lifecycle};
pub use context::CommandContext;
pub use error::{DecodeError, EncodeError};
pub use host::Host;
pub use message::{CommandResultMsg, ContextMessage, Message, MessageError, Outbox};
pub use primitive::{EntityState, Primitive, Value};
pub use quic::{ClientEndpoint, QuicTransport, ServerEndpoint};
pub use registry::{ClassRegistry, RegistryEntry, RegistryError};
pub use scheduler::{DrainReport, ScheduleError, TickScheduler};
pub use service::{RegistryPlugin, RegistryService, RegistryServiceBuilder};
pub use snapshot::{MirroredRegistry, RegistrySnapshot};
pub use transport::{Transport, TransportError};

/// Re-exported so command implementations can use `#[async_trait]` without
/// depending on the crate directly.
pub use async_trait::async_trait;
