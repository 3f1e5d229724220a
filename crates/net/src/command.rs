//! Client requests.
//!
//! A command is parsed fresh from each incoming entry and consumed by
//! [`Command::execute`], so an instance can never run twice.

use crate::buf::WireBuf;
use crate::context::CommandContext;
use crate::error::{DecodeError, EncodeError};
use crate::host::Host;
use crate::registry::{parse_name, RegistryEntry, RegistryError};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use tickwire_core::RegistryKey;

/// A request type clients can send.
#[async_trait]
pub trait Command<H: Host>: Sized + Send + 'static {
    /// Registered name, `namespace:path` or a bare path in the default namespace.
    const NAME: &'static str;

    /// Decode the payload that follows the uid.
    fn parse(ctx: &CommandContext<H>, buf: &mut WireBuf) -> Result<Self, DecodeError>;

    /// Run the command.
    ///
    /// Expected failures are reported as [`CommandResult::Fail`]. An `Err`
    /// is treated as an internal fault and logged.
    async fn execute(self, ctx: CommandContext<H>) -> anyhow::Result<CommandResult>;
}

/// Outcome of one command, sent back tagged with its uid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    /// Completed; carries the command-specific result payload.
    Success(WireBuf),
    /// Rejected or failed; carries a description for the client.
    Fail(String),
}

impl CommandResult {
    /// Success with an empty payload.
    pub fn success() -> Self {
        Self::Success(WireBuf::new())
    }

    /// Success with a payload built by `write`.
    pub fn success_with(
        write: impl FnOnce(&mut WireBuf) -> Result<(), EncodeError>,
    ) -> Result<Self, EncodeError> {
        let mut payload = WireBuf::new();
        write(&mut payload)?;
        Ok(Self::Success(payload))
    }

    /// Failure with a description.
    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail(message.into())
    }

    /// Whether this is [`CommandResult::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Append the outcome byte (1 success, 0 fail) and the payload.
    pub fn write(&self, buf: &mut WireBuf) -> Result<(), EncodeError> {
        match self {
            Self::Success(payload) => {
                buf.write_bool(true);
                buf.write_raw(payload.as_slice());
                Ok(())
            }
            Self::Fail(message) => {
                buf.write_bool(false);
                buf.write_str(message)
            }
        }
    }
}

/// Command ready to run, with its payload already parsed.
pub type PreparedCommand<H> =
    Box<dyn FnOnce(CommandContext<H>) -> BoxFuture<'static, anyhow::Result<CommandResult>> + Send>;

type ParseFn<H> = fn(&CommandContext<H>, &mut WireBuf) -> Result<PreparedCommand<H>, DecodeError>;

/// Registry entry for a command type.
pub struct CommandType<H: Host> {
    name: RegistryKey,
    parser: Option<ParseFn<H>>,
}

impl<H: Host> CommandType<H> {
    /// Entry for a command that can be decoded from the wire.
    pub fn of<C: Command<H>>() -> Result<Self, RegistryError> {
        Ok(Self {
            name: parse_name(C::NAME)?,
            parser: Some(parse_as::<H, C>),
        })
    }

    /// Entry that occupies an id but can never be decoded from the wire.
    pub fn server_only(name: &str) -> Result<Self, RegistryError> {
        Ok(Self {
            name: parse_name(name)?,
            parser: None,
        })
    }

    /// Whether the type has a wire constructor.
    pub fn is_constructible(&self) -> bool {
        self.parser.is_some()
    }

    /// Decode an instance from the bytes following the uid.
    pub fn parse(
        &self,
        ctx: &CommandContext<H>,
        buf: &mut WireBuf,
    ) -> Result<PreparedCommand<H>, DecodeError> {
        match self.parser {
            Some(parse) => parse(ctx, buf),
            None => Err(DecodeError::NotConstructible(self.name.clone())),
        }
    }
}

fn parse_as<H: Host, C: Command<H>>(
    ctx: &CommandContext<H>,
    buf: &mut WireBuf,
) -> Result<PreparedCommand<H>, DecodeError> {
    let command = C::parse(ctx, buf)?;
    Ok(Box::new(move |ctx| command.execute(ctx)))
}

impl<H: Host> RegistryEntry for CommandType<H> {
    fn name(&self) -> &RegistryKey {
        &self.name
    }
}

impl<H: Host> fmt::Debug for CommandType<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandType")
            .field("name", &self.name)
            .field("constructible", &self.is_constructible())
            .finish()
    }
}
