//! Process-wide set of finalized registries.
//!
//! Built once at startup from an explicit list of command and message types,
//! plus any plugins whose required extensions are loaded. After
//! [`RegistryServiceBuilder::build`] everything is immutable and shared
//! between connections without locking.

use crate::command::{Command, CommandType};
use crate::host::Host;
use crate::message::{CommandResultMsg, Message, MessageRegistry, MESSAGES_REGISTRY};
use crate::registry::{parse_name, ClassRegistry, RegistryEntry, RegistryError};
use crate::snapshot::{MirroredRegistry, RegistrySnapshot};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tickwire_core::RegistryKey;
use tracing::{debug, info};

/// Registry label for command types.
pub const COMMANDS_REGISTRY: &str = "tickwire:commands";

/// A bundle of registrations merged before finalize.
pub trait RegistryPlugin<H: Host>: Send + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Extensions that must all be loaded for the plugin to apply.
    fn required_extensions(&self) -> &[&str] {
        &[]
    }

    /// Add the plugin's types.
    fn register(&self, builder: &mut RegistryServiceBuilder<H>) -> Result<(), RegistryError>;
}

/// Collects registrations until [`RegistryServiceBuilder::build`].
pub struct RegistryServiceBuilder<H: Host> {
    commands: ClassRegistry<CommandType<H>>,
    messages: MessageRegistry,
    plugins: Vec<Box<dyn RegistryPlugin<H>>>,
    extensions: HashSet<String>,
    disabled: HashSet<RegistryKey>,
}

impl<H: Host> RegistryServiceBuilder<H> {
    /// Builder with the protocol's own message types registered.
    pub fn new() -> Result<Self, RegistryError> {
        let mut messages = MessageRegistry::new(parse_name(MESSAGES_REGISTRY)?);
        messages.register::<CommandResultMsg>()?;
        Ok(Self {
            commands: ClassRegistry::new(parse_name(COMMANDS_REGISTRY)?),
            messages,
            plugins: Vec::new(),
            extensions: HashSet::new(),
            disabled: HashSet::new(),
        })
    }

    /// Mark extensions as loaded.
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions.extend(extensions.into_iter().map(Into::into));
        self
    }

    /// Skip these command names whenever they are registered.
    pub fn disable_commands(mut self, names: impl IntoIterator<Item = RegistryKey>) -> Self {
        self.disabled.extend(names);
        self
    }

    /// Register command type `C`.
    pub fn command<C: Command<H>>(&mut self) -> Result<&mut Self, RegistryError> {
        let entry = CommandType::<H>::of::<C>()?;
        if self.disabled.contains(entry.name()) {
            info!(command = C::NAME, "Command disabled by configuration");
            return Ok(self);
        }
        self.commands.register(entry)?;
        Ok(self)
    }

    /// Reserve a command id for a type that is never decoded from the wire.
    pub fn server_only_command(&mut self, name: &str) -> Result<&mut Self, RegistryError> {
        self.commands.register(CommandType::server_only(name)?)?;
        Ok(self)
    }

    /// Register message type `M`.
    pub fn message<M: Message>(&mut self) -> Result<&mut Self, RegistryError> {
        self.messages.register::<M>()?;
        Ok(self)
    }

    /// Queue a plugin; it is applied in [`RegistryServiceBuilder::build`].
    pub fn plugin(&mut self, plugin: impl RegistryPlugin<H>) -> &mut Self {
        self.plugins.push(Box::new(plugin));
        self
    }

    /// Apply plugins, finalize, and encode the snapshot for `host`.
    pub fn build(mut self, host: &H) -> Result<RegistryService<H>, RegistryError> {
        for plugin in std::mem::take(&mut self.plugins) {
            let missing: Vec<&str> = plugin
                .required_extensions()
                .iter()
                .copied()
                .filter(|ext| !self.extensions.contains(*ext))
                .collect();
            if missing.is_empty() {
                debug!(plugin = plugin.name(), "Applying registry plugin");
                plugin.register(&mut self)?;
            } else {
                info!(plugin = plugin.name(), ?missing, "Skipping plugin; extensions not loaded");
            }
        }

        self.commands.finalize();
        self.messages.finalize();

        let mut mirrored = vec![self.commands.mirror(), self.messages.registry().mirror()];
        mirrored.extend(host.mirrored_registries());
        let snapshot = RegistrySnapshot::encode(&mirrored)?;

        info!(
            commands = self.commands.len(),
            messages = self.messages.registry().len(),
            mirrored = mirrored.len(),
            checksum = format_args!("{:016x}", snapshot.checksum()),
            "Registries finalized"
        );

        Ok(RegistryService {
            commands: self.commands,
            messages: Arc::new(self.messages),
            mirrored,
            snapshot,
        })
    }
}

/// Finalized registries and the snapshot clients sync against.
pub struct RegistryService<H: Host> {
    commands: ClassRegistry<CommandType<H>>,
    messages: Arc<MessageRegistry>,
    mirrored: Vec<MirroredRegistry>,
    snapshot: RegistrySnapshot,
}

impl<H: Host> RegistryService<H> {
    /// Start collecting registrations.
    pub fn builder() -> Result<RegistryServiceBuilder<H>, RegistryError> {
        RegistryServiceBuilder::new()
    }

    /// Command types by wire id.
    pub fn commands(&self) -> &ClassRegistry<CommandType<H>> {
        &self.commands
    }

    /// Message types by wire id.
    pub fn messages(&self) -> &Arc<MessageRegistry> {
        &self.messages
    }

    /// Every table in snapshot order.
    pub fn mirrored(&self) -> &[MirroredRegistry] {
        &self.mirrored
    }

    /// Encoded snapshot and checksum.
    pub fn snapshot(&self) -> &RegistrySnapshot {
        &self.snapshot
    }

    /// Wire id of the command registered as `name`.
    pub fn command_id(&self, name: &RegistryKey) -> Option<u32> {
        self.commands.get_by_name(name).map(|(id, _)| id)
    }
}

impl<H: Host> fmt::Debug for RegistryService<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryService")
            .field("commands", &self.commands.len())
            .field("messages", &self.messages.registry().len())
            .field("checksum", &self.snapshot.checksum())
            .finish()
    }
}
