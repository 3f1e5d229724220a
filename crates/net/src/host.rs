//! The simulation host as seen by the protocol engine.

use crate::scheduler::TickScheduler;
use crate::snapshot::MirroredRegistry;
use std::thread::ThreadId;
use tickwire_core::SimTick;

/// Handle to the host simulation.
///
/// The host owns its state on a dedicated thread. Everything else reaches it
/// through [`Host::scheduler`].
pub trait Host: Send + Sync + 'static {
    /// Simulation state handed to scheduled work on the host thread.
    type State: 'static;

    /// Tick the host is currently processing.
    fn current_tick(&self) -> SimTick;

    /// Dispatcher drained by the host thread once per tick.
    fn scheduler(&self) -> &TickScheduler<Self::State>;

    /// Thread that owns the simulation state, once it has started.
    fn dedicated_thread(&self) -> Option<ThreadId> {
        self.scheduler().dedicated_thread()
    }

    /// Host-owned id tables mirrored to clients, in snapshot order.
    fn mirrored_registries(&self) -> Vec<MirroredRegistry>;
}
