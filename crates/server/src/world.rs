//! Simulation state owned by the host thread.
//!
//! A `bevy_ecs` [`World`] holds the block grid, the chat log and the clock as
//! resources. The tick schedule runs before scheduled protocol work drains.

use bevy_ecs::schedule::{Schedule, ScheduleLabel, Schedules};
use bevy_ecs::system::{ResMut, Resource};
use bevy_ecs::world::World;
use glam::IVec3;
use std::collections::HashMap;
use tickwire_core::{DimensionId, RegistryKey, RegistryKeyError, SimTick};
use tickwire_net::{EntityState, MirroredRegistry};

/// Block kinds in wire-id order. Id 0 is air.
pub const BLOCKS: &[&str] = &[
    "air", "stone", "dirt", "grass", "sand", "gravel", "water", "lava", "oak_log", "oak_planks",
    "glass", "bedrock",
];

/// Item kinds in wire-id order.
pub const ITEMS: &[&str] = &["stone", "dirt", "oak_planks", "stick", "torch", "bucket"];

/// Entity kinds in wire-id order.
pub const ENTITY_KINDS: &[&str] = &["player", "item", "falling_block", "arrow"];

/// Wire id of air.
pub const BLOCK_AIR: u32 = 0;

/// Lowest buildable y.
pub const MIN_BUILD_Y: i32 = -64;

/// One past the highest buildable y.
pub const MAX_BUILD_Y: i32 = 320;

/// Chat lines kept in memory.
pub const CHAT_HISTORY: usize = 256;

/// Label of the per-tick schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ScheduleLabel)]
pub struct SimSchedule;

/// Tick the world was last advanced to.
#[derive(Resource, Debug, Default, Clone, Copy)]
pub struct WorldClock {
    /// Current tick.
    pub tick: SimTick,
}

/// One broadcast system chat line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    /// Tick the line was posted in.
    pub tick: SimTick,
    /// Message text.
    pub text: String,
}

/// Recent system chat.
#[derive(Resource, Debug, Default)]
pub struct ChatLog {
    lines: Vec<ChatLine>,
}

impl ChatLog {
    /// Append a line.
    pub fn push(&mut self, tick: SimTick, text: String) {
        self.lines.push(ChatLine { tick, text });
    }

    /// Lines, oldest first.
    pub fn lines(&self) -> &[ChatLine] {
        &self.lines
    }
}

/// Sparse block storage. Unset positions are air.
#[derive(Resource, Debug, Default)]
pub struct BlockGrid {
    blocks: HashMap<(DimensionId, IVec3), EntityState>,
}

impl BlockGrid {
    /// Whether `pos` lies inside the buildable height range.
    pub fn in_build_height(pos: IVec3) -> bool {
        (MIN_BUILD_Y..MAX_BUILD_Y).contains(&pos.y)
    }

    /// State at `pos`.
    pub fn get(&self, dimension: DimensionId, pos: IVec3) -> EntityState {
        self.blocks
            .get(&(dimension, pos))
            .cloned()
            .unwrap_or_else(|| EntityState::of_kind(BLOCK_AIR))
    }

    /// Store `state` at `pos` and return the previous state.
    pub fn set(&mut self, dimension: DimensionId, pos: IVec3, state: EntityState) -> EntityState {
        let previous = if state.kind == BLOCK_AIR && state.properties.is_empty() {
            self.blocks.remove(&(dimension, pos))
        } else {
            self.blocks.insert((dimension, pos), state)
        };
        previous.unwrap_or_else(|| EntityState::of_kind(BLOCK_AIR))
    }

    /// Number of non-air positions.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether every position is air.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Fresh world with every resource inserted.
pub fn new_world() -> World {
    let mut world = World::default();
    world.insert_resource(WorldClock::default());
    world.insert_resource(ChatLog::default());
    world.insert_resource(BlockGrid::default());
    world
}

/// Schedules run once per tick.
pub fn build_schedules() -> Schedules {
    let mut schedules = Schedules::default();
    let mut schedule = Schedule::new(SimSchedule);
    schedule.set_apply_final_deferred(true);
    schedule.add_systems(trim_chat_log);
    schedules.insert(schedule);
    schedules
}

/// Advance the clock to `tick` and run the tick schedule.
pub fn run_tick(world: &mut World, schedules: &mut Schedules, tick: SimTick) {
    world.resource_mut::<WorldClock>().tick = tick;
    if let Some(schedule) = schedules.get_mut(SimSchedule) {
        schedule.run(world);
    }
}

fn trim_chat_log(mut log: ResMut<ChatLog>) {
    let excess = log.lines.len().saturating_sub(CHAT_HISTORY);
    if excess > 0 {
        log.lines.drain(..excess);
    }
}

fn table(name: &str, entries: impl IntoIterator<Item = RegistryKey>) -> Result<MirroredRegistry, RegistryKeyError> {
    Ok(MirroredRegistry::dense(RegistryKey::parse(name)?, entries))
}

fn keys(names: &[&str]) -> Result<Vec<RegistryKey>, RegistryKeyError> {
    names.iter().map(|name| RegistryKey::parse(name)).collect()
}

/// Host-owned tables mirrored to clients, in snapshot order.
pub fn mirrored_tables() -> Result<Vec<MirroredRegistry>, RegistryKeyError> {
    Ok(vec![
        table("tickwire:blocks", keys(BLOCKS)?)?,
        table("tickwire:items", keys(ITEMS)?)?,
        table("tickwire:entity_kinds", keys(ENTITY_KINDS)?)?,
        table("tickwire:dimensions", DimensionId::ALL.map(DimensionId::key))?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_blocks_read_as_air_and_air_clears() {
        let mut grid = BlockGrid::default();
        let pos = IVec3::new(1, 64, -3);
        assert_eq!(grid.get(DimensionId::Overworld, pos).kind, BLOCK_AIR);

        let previous = grid.set(DimensionId::Overworld, pos, EntityState::of_kind(1));
        assert_eq!(previous.kind, BLOCK_AIR);
        assert_eq!(grid.get(DimensionId::Overworld, pos).kind, 1);
        assert_eq!(grid.get(DimensionId::Nether, pos).kind, BLOCK_AIR);

        grid.set(DimensionId::Overworld, pos, EntityState::of_kind(BLOCK_AIR));
        assert!(grid.is_empty());
    }

    #[test]
    fn build_height_is_half_open() {
        assert!(BlockGrid::in_build_height(IVec3::new(0, MIN_BUILD_Y, 0)));
        assert!(!BlockGrid::in_build_height(IVec3::new(0, MAX_BUILD_Y, 0)));
    }

    #[test]
    fn tick_schedule_updates_clock_and_trims_chat() {
        let mut world = new_world();
        let mut schedules = build_schedules();
        for i in 0..CHAT_HISTORY + 10 {
            world
                .resource_mut::<ChatLog>()
                .push(SimTick::ZERO, format!("line {i}"));
        }

        run_tick(&mut world, &mut schedules, SimTick(7));

        assert_eq!(world.resource::<WorldClock>().tick, SimTick(7));
        let log = world.resource::<ChatLog>();
        assert_eq!(log.lines().len(), CHAT_HISTORY);
        assert_eq!(log.lines()[0].text, "line 10");
    }

    #[test]
    fn mirrored_tables_put_air_first() {
        let tables = mirrored_tables().unwrap();
        let names: Vec<String> = tables.iter().map(|t| t.name.to_string()).collect();
        assert_eq!(
            names,
            [
                "tickwire:blocks",
                "tickwire:items",
                "tickwire:entity_kinds",
                "tickwire:dimensions"
            ]
        );
        assert_eq!(
            tables[0].name_of(BLOCK_AIR).map(ToString::to_string),
            Some("tickwire:air".to_string())
        );
        assert_eq!(tables[3].entries.len(), DimensionId::ALL.len());
    }
}
