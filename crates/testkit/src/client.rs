//! Scripted protocol client.
//!
//! Speaks the client half of the establish sequence and builds command
//! frames by name, using the ids learned from the registry snapshot.

use anyhow::{anyhow, bail, ensure, Context, Result};
use tickwire_core::RegistryKey;
use tickwire_net::message::MESSAGES_REGISTRY;
use tickwire_net::protocol::CHECKSUM_FRAME_LEN;
use tickwire_net::service::COMMANDS_REGISTRY;
use tickwire_net::{
    CloseReason, CommandResultMsg, EncodeError, Message, MirroredRegistry, RegistrySnapshot,
    Transport, TransportError, WireBuf,
};

/// Outcome of the client side of the establish sequence.
#[derive(Debug, Clone)]
pub struct Established {
    /// Checksum the server announced.
    pub checksum: u64,
    /// Whether the server sent the full snapshot.
    pub snapshot_sent: bool,
    /// Tables the client now uses.
    pub registries: Vec<MirroredRegistry>,
}

/// A decoded command result.
#[derive(Debug, Clone)]
pub struct CommandReply {
    /// Correlation token.
    pub uid: u64,
    /// Outcome byte.
    pub success: bool,
    /// Result payload; for failures, a length-prefixed description.
    pub payload: WireBuf,
}

impl CommandReply {
    /// Failure description.
    pub fn failure_message(&self) -> Result<String> {
        ensure!(!self.success, "command {} succeeded", self.uid);
        let mut payload = self.payload.clone();
        Ok(payload.read_str()?)
    }
}

/// Client side of a session, over any [`Transport`].
pub struct TestClient {
    transport: Box<dyn Transport>,
    registries: Vec<MirroredRegistry>,
}

impl TestClient {
    /// Wrap the client end of a transport, e.g. a [`crate::MemoryTransport`].
    pub fn new(transport: impl Transport) -> Self {
        Self {
            transport: Box::new(transport),
            registries: Vec::new(),
        }
    }

    /// Establish, reusing `cache` when its checksum matches the server's.
    pub async fn establish(&mut self, cache: Option<&Established>) -> Result<Established> {
        let checksum = self.read_checksum().await?;
        let cached = cache.filter(|cached| cached.checksum == checksum);
        self.send_bool(cached.is_some()).await?;

        let (snapshot_sent, registries) = match cached {
            Some(cached) => (false, cached.registries.clone()),
            None => {
                let bytes = self.transport.receive().await?;
                let registries = RegistrySnapshot::decode(&bytes).context("decode snapshot")?;
                (true, registries)
            }
        };
        self.registries = registries.clone();
        self.send_bool(true).await?;
        Ok(Established {
            checksum,
            snapshot_sent,
            registries,
        })
    }

    /// Read the 8-byte checksum frame.
    pub async fn read_checksum(&self) -> Result<u64> {
        let frame = self.transport.receive().await?;
        ensure!(
            frame.len() == CHECKSUM_FRAME_LEN,
            "checksum frame has {} bytes",
            frame.len()
        );
        Ok(WireBuf::from(frame).read_u64()?)
    }

    /// Send a single boolean frame.
    pub async fn send_bool(&self, value: bool) -> Result<()> {
        self.send_frame(vec![u8::from(value)]).await
    }

    /// Send raw frame bytes.
    pub async fn send_frame(&self, frame: Vec<u8>) -> Result<()> {
        self.transport.send(frame).await?;
        Ok(())
    }

    /// Next raw frame from the server.
    pub async fn receive_frame(&self) -> Result<Vec<u8>> {
        Ok(self.transport.receive().await?)
    }

    /// Tables learned during establish.
    pub fn registries(&self) -> &[MirroredRegistry] {
        &self.registries
    }

    fn table(&self, name: &str) -> Result<&MirroredRegistry> {
        let key = RegistryKey::parse(name)?;
        self.registries
            .iter()
            .find(|registry| registry.name == key)
            .ok_or_else(|| anyhow!("registry {name} not in snapshot"))
    }

    /// Wire id of an entry in a mirrored table.
    pub fn id_in(&self, registry: &str, name: &str) -> Result<u32> {
        let key = RegistryKey::parse(name)?;
        self.table(registry)?
            .id_of(&key)
            .ok_or_else(|| anyhow!("{name} not in {registry}"))
    }

    /// Wire id of a command.
    pub fn command_id(&self, name: &str) -> Result<u32> {
        self.id_in(COMMANDS_REGISTRY, name)
    }

    /// Encode one command entry: wire id, uid, then the payload.
    pub fn command_entry(
        &self,
        name: &str,
        uid: u64,
        payload: impl FnOnce(&mut WireBuf) -> Result<(), EncodeError>,
    ) -> Result<Vec<u8>> {
        let mut buf = WireBuf::new();
        buf.write_var_u32(self.command_id(name)?);
        buf.write_var_u64(uid);
        payload(&mut buf)?;
        Ok(buf.into_vec())
    }

    /// Send one command in its own frame.
    pub async fn send_command(
        &self,
        name: &str,
        uid: u64,
        payload: impl FnOnce(&mut WireBuf) -> Result<(), EncodeError>,
    ) -> Result<()> {
        let entry = self.command_entry(name, uid, payload)?;
        self.send_frame(entry).await
    }

    /// Next message frame as `(message wire id, payload)`.
    pub async fn next_message(&self) -> Result<(u32, WireBuf)> {
        let mut buf = WireBuf::from(self.transport.receive().await?);
        let id = buf.read_var_u32()?;
        Ok((id, buf))
    }

    /// Next message, which must be a command result.
    pub async fn next_result(&self) -> Result<CommandReply> {
        let expected = self.id_in(MESSAGES_REGISTRY, CommandResultMsg::NAME)?;
        let (id, mut buf) = self.next_message().await?;
        ensure!(id == expected, "expected command result (id {expected}), got message {id}");
        let uid = buf.read_var_u64()?;
        let success = buf.read_bool()?;
        let payload = WireBuf::from(buf.unread().to_vec());
        Ok(CommandReply {
            uid,
            success,
            payload,
        })
    }

    /// Wait for the server to close and return its reason. Any frame that
    /// arrives first is an error.
    pub async fn expect_close(&self) -> Result<CloseReason> {
        match self.transport.receive().await {
            Ok(frame) => bail!("expected close, got a {}-byte frame", frame.len()),
            Err(TransportError::Closed {
                reason: Some(reason),
            }) => Ok(reason),
            Err(other) => bail!("transport ended without a close reason: {other}"),
        }
    }

    /// Close from the client side.
    pub async fn close(&self, reason: &CloseReason) {
        self.transport.close(reason).await;
    }
}
