//! Built-in commands of the reference host.

use crate::config::ServerConfig;
use crate::host::SimulationHost;
use crate::world::{BlockGrid, ChatLine, ChatLog, WorldClock, BLOCKS, BLOCK_AIR};
use async_trait::async_trait;
use bevy_ecs::world::World;
use bitflags::bitflags;
use glam::IVec3;
use std::sync::Arc;
use tickwire_core::{DimensionId, RegistryKey};
use tickwire_net::{
    Command, CommandContext, CommandResult, DecodeError, EncodeError, EntityState,
    Host, Message, RegistryError, RegistryPlugin, RegistryService, RegistryServiceBuilder,
    WireBuf,
};
use tracing::info;

type Ctx = CommandContext<SimulationHost>;

/// Extension that enables [`Fill`].
pub const BULK_EDIT_EXTENSION: &str = "bulk_edit";

/// Largest region a single fill may touch.
pub const MAX_FILL_VOLUME: i64 = 32 * 32 * 32;

/// Build the registries for the reference host.
pub fn builtin_registries(
    host: &SimulationHost,
    config: &ServerConfig,
) -> Result<RegistryService<SimulationHost>, RegistryError> {
    let mut builder = RegistryService::builder()?
        .with_extensions(config.extensions.iter().cloned())
        .disable_commands(config.disabled_commands.iter().cloned());
    builder
        .command::<SendSystemChat>()?
        .command::<GetBlock>()?
        .command::<SetBlock>()?
        .message::<SystemChat>()?
        .plugin(BulkEditPlugin);
    builder.build(host)
}

/// System chat line pushed to every client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemChat {
    /// Message text.
    pub text: String,
}

impl Message for SystemChat {
    const NAME: &'static str = "tickwire:system_chat";

    fn write_payload(&self, buf: &mut WireBuf) -> Result<(), EncodeError> {
        buf.write_str(&self.text)
    }
}

/// Broadcast a system chat line.
pub struct SendSystemChat {
    message: String,
}

#[async_trait]
impl Command<SimulationHost> for SendSystemChat {
    const NAME: &'static str = "tickwire:send_system_chat";

    fn parse(_ctx: &Ctx, buf: &mut WireBuf) -> Result<Self, DecodeError> {
        Ok(Self {
            message: buf.read_str()?,
        })
    }

    async fn execute(self, ctx: Ctx) -> anyhow::Result<CommandResult> {
        let host = Arc::clone(ctx.host());
        let connection = ctx.connection_id();
        ctx.host()
            .scheduler()
            .run_next(move |world: &mut World| {
                let tick = world.resource::<WorldClock>().tick;
                info!(%connection, %tick, "[chat] {}", self.message);
                world
                    .resource_mut::<ChatLog>()
                    .push(tick, self.message.clone());
                host.publish_chat(ChatLine {
                    tick,
                    text: self.message,
                });
            })
            .await?;
        Ok(CommandResult::success())
    }
}

fn resolve_dimension(key: &RegistryKey) -> Result<DimensionId, CommandResult> {
    DimensionId::from_key(key).ok_or_else(|| CommandResult::fail(format!("unknown dimension {key}")))
}

/// Read the state at one position.
pub struct GetBlock {
    dimension: RegistryKey,
    pos: IVec3,
}

#[async_trait]
impl Command<SimulationHost> for GetBlock {
    const NAME: &'static str = "tickwire:get_block";

    fn parse(_ctx: &Ctx, buf: &mut WireBuf) -> Result<Self, DecodeError> {
        Ok(Self {
            dimension: buf.read_key()?,
            pos: buf.read_ivec3()?,
        })
    }

    async fn execute(self, ctx: Ctx) -> anyhow::Result<CommandResult> {
        let dimension = match resolve_dimension(&self.dimension) {
            Ok(dimension) => dimension,
            Err(fail) => return Ok(fail),
        };
        let pos = self.pos;
        let state = ctx
            .host()
            .scheduler()
            .run_next(move |world: &mut World| world.resource::<BlockGrid>().get(dimension, pos))
            .await?;
        Ok(CommandResult::success_with(|out| out.write_entity_state(&state))?)
    }
}

bitflags! {
    /// Behaviour bits of [`SetBlock`]. Undefined bits are rejected.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SetBlockFlags: u8 {
        /// A full block state follows instead of a bare block id.
        const SET_STATE = 1;
        /// Apply at the start of the next tick instead of the next drain.
        const ON_TICK = 4;
        /// Leave positions that are currently air untouched.
        const KEEP = 16;
    }
}

/// Replace the state at one position.
pub struct SetBlock {
    dimension: RegistryKey,
    pos: IVec3,
    flags: SetBlockFlags,
    state: EntityState,
}

#[async_trait]
impl Command<SimulationHost> for SetBlock {
    const NAME: &'static str = "tickwire:set_block";

    fn parse(_ctx: &Ctx, buf: &mut WireBuf) -> Result<Self, DecodeError> {
        let dimension = buf.read_key()?;
        let pos = buf.read_ivec3()?;
        let bits = buf.read_u8()?;
        let flags = SetBlockFlags::from_bits(bits)
            .ok_or_else(|| DecodeError::invalid(format!("unsupported set_block flags {bits:#04x}")))?;
        let state = if flags.contains(SetBlockFlags::SET_STATE) {
            buf.read_entity_state()?
        } else {
            EntityState::of_kind(buf.read_var_u32()?)
        };
        Ok(Self {
            dimension,
            pos,
            flags,
            state,
        })
    }

    async fn execute(self, ctx: Ctx) -> anyhow::Result<CommandResult> {
        let dimension = match resolve_dimension(&self.dimension) {
            Ok(dimension) => dimension,
            Err(fail) => return Ok(fail),
        };
        if !is_block(self.state.kind) {
            return Ok(CommandResult::fail(format!("unknown block id {}", self.state.kind)));
        }

        let Self {
            pos, flags, state, ..
        } = self;
        let keep = flags.contains(SetBlockFlags::KEEP);
        let apply = move |world: &mut World| {
            if !BlockGrid::in_build_height(pos) {
                return false;
            }
            let mut grid = world.resource_mut::<BlockGrid>();
            if keep && grid.get(dimension, pos).kind == BLOCK_AIR {
                return false;
            }
            grid.set(dimension, pos, state.clone()) != state
        };

        let changed = if flags.contains(SetBlockFlags::ON_TICK) {
            ctx.run_next_tick(apply).await?
        } else {
            ctx.host().scheduler().run_next(apply).await?
        };
        Ok(CommandResult::success_with(|out| {
            out.write_bool(changed);
            Ok(())
        })?)
    }
}

fn is_block(kind: u32) -> bool {
    usize::try_from(kind).is_ok_and(|kind| kind < BLOCKS.len())
}

/// Set every position in an inclusive box to one block. Requires the
/// `bulk_edit` extension.
pub struct Fill {
    dimension: RegistryKey,
    from: IVec3,
    to: IVec3,
    block: u32,
}

#[async_trait]
impl Command<SimulationHost> for Fill {
    const NAME: &'static str = "tickwire:fill";

    fn parse(_ctx: &Ctx, buf: &mut WireBuf) -> Result<Self, DecodeError> {
        Ok(Self {
            dimension: buf.read_key()?,
            from: buf.read_ivec3()?,
            to: buf.read_ivec3()?,
            block: buf.read_var_u32()?,
        })
    }

    async fn execute(self, ctx: Ctx) -> anyhow::Result<CommandResult> {
        let dimension = match resolve_dimension(&self.dimension) {
            Ok(dimension) => dimension,
            Err(fail) => return Ok(fail),
        };
        if !is_block(self.block) {
            return Ok(CommandResult::fail(format!("unknown block id {}", self.block)));
        }
        let min = self.from.min(self.to);
        let max = self.from.max(self.to);
        let volume = fill_volume(min, max);
        if volume > MAX_FILL_VOLUME {
            return Ok(CommandResult::fail(format!(
                "fill of {volume} blocks exceeds the limit of {MAX_FILL_VOLUME}"
            )));
        }

        let block = self.block;
        let changed = ctx
            .run_next_tick(move |world: &mut World| {
                let mut grid = world.resource_mut::<BlockGrid>();
                let state = EntityState::of_kind(block);
                let mut changed = 0u32;
                for y in min.y..=max.y {
                    for z in min.z..=max.z {
                        for x in min.x..=max.x {
                            let pos = IVec3::new(x, y, z);
                            if BlockGrid::in_build_height(pos)
                                && grid.set(dimension, pos, state.clone()) != state
                            {
                                changed += 1;
                            }
                        }
                    }
                }
                changed
            })
            .await?;
        Ok(CommandResult::success_with(|out| {
            out.write_var_u32(changed);
            Ok(())
        })?)
    }
}

/// Positions in the inclusive box `min..=max`, saturating at `i64::MAX`.
fn fill_volume(min: IVec3, max: IVec3) -> i64 {
    let extent = max.as_i64vec3() - min.as_i64vec3() + 1;
    extent.x.saturating_mul(extent.y).saturating_mul(extent.z)
}

struct BulkEditPlugin;

impl RegistryPlugin<SimulationHost> for BulkEditPlugin {
    fn name(&self) -> &str {
        "bulk-edit"
    }

    fn required_extensions(&self) -> &[&str] {
        &[BULK_EDIT_EXTENSION]
    }

    fn register(
        &self,
        builder: &mut RegistryServiceBuilder<SimulationHost>,
    ) -> Result<(), RegistryError> {
        builder.command::<Fill>()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_set_block_bits_are_rejected() {
        assert_eq!(SetBlockFlags::from_bits(0b0000_0010), None);
        assert_eq!(SetBlockFlags::from_bits(0b0100_0000), None);
        assert_eq!(
            SetBlockFlags::from_bits(21),
            Some(SetBlockFlags::SET_STATE | SetBlockFlags::ON_TICK | SetBlockFlags::KEEP)
        );
    }

    #[test]
    fn block_ids_are_bounded_by_the_palette() {
        assert!(is_block(BLOCK_AIR));
        assert!(is_block(BLOCKS.len() as u32 - 1));
        assert!(!is_block(BLOCKS.len() as u32));
    }

    #[test]
    fn fill_volume_widens_before_subtracting() {
        assert_eq!(fill_volume(IVec3::ZERO, IVec3::ZERO), 1);
        assert_eq!(fill_volume(IVec3::ZERO, IVec3::new(1, 1, 1)), 8);
        let wide = fill_volume(IVec3::new(i32::MIN, 0, 0), IVec3::new(i32::MAX, 0, 0));
        assert_eq!(wide, 1 << 32);
        assert!(wide > MAX_FILL_VOLUME);
        assert_eq!(fill_volume(IVec3::MIN, IVec3::MAX), i64::MAX);
    }

    #[test]
    fn registries_follow_configuration() {
        let host = SimulationHost::new().unwrap();
        let fill = RegistryKey::parse(Fill::NAME).unwrap();
        let chat = RegistryKey::parse(SendSystemChat::NAME).unwrap();

        let plain = builtin_registries(&host, &ServerConfig::default()).unwrap();
        assert!(plain.command_id(&fill).is_none());
        assert!(plain.command_id(&chat).is_some());

        let config = ServerConfig {
            extensions: vec![BULK_EDIT_EXTENSION.into()],
            disabled_commands: vec![chat.clone()],
            ..ServerConfig::default()
        };
        let extended = builtin_registries(&host, &config).unwrap();
        assert!(extended.command_id(&fill).is_some());
        assert!(extended.command_id(&chat).is_none());
        assert_eq!(extended.mirrored().len(), 2 + host.mirrored_registries().len());
    }
}
