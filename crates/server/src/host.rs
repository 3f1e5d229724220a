//! The reference [`Host`]: a `bevy_ecs` world advanced by a fixed-rate thread.

use crate::world::{self, ChatLine};
use anyhow::Result;
use bevy_ecs::world::World;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tickwire_core::SimTick;
use tickwire_net::{Host, MirroredRegistry, TickScheduler};
use tokio::sync::broadcast;

const CHAT_CHANNEL_CAPACITY: usize = 64;

/// Host handle shared by the simulation thread and every connection.
pub struct SimulationHost {
    tick: AtomicU64,
    scheduler: TickScheduler<World>,
    tables: Vec<MirroredRegistry>,
    chat: broadcast::Sender<ChatLine>,
}

impl SimulationHost {
    /// Host at tick 0 with the built-in mirrored tables.
    pub fn new() -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            tick: AtomicU64::new(0),
            scheduler: TickScheduler::new(),
            tables: world::mirrored_tables()?,
            chat: broadcast::channel(CHAT_CHANNEL_CAPACITY).0,
        }))
    }

    /// Receive every system chat line posted from now on.
    pub fn subscribe_chat(&self) -> broadcast::Receiver<ChatLine> {
        self.chat.subscribe()
    }

    pub(crate) fn publish_chat(&self, line: ChatLine) {
        // Without subscribers the line only lands in the world log.
        let _ = self.chat.send(line);
    }

    pub(crate) fn advance(&self) -> SimTick {
        SimTick(self.tick.fetch_add(1, Ordering::AcqRel).saturating_add(1))
    }
}

impl Host for SimulationHost {
    type State = World;

    fn current_tick(&self) -> SimTick {
        SimTick(self.tick.load(Ordering::Acquire))
    }

    fn scheduler(&self) -> &TickScheduler<World> {
        &self.scheduler
    }

    fn mirrored_registries(&self) -> Vec<MirroredRegistry> {
        self.tables.clone()
    }
}
