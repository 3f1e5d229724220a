//! Fixed-rate simulation thread.

use crate::host::SimulationHost;
use crate::world::{build_schedules, new_world, run_tick};
use anyhow::{anyhow, Context, Result};
use bevy_ecs::world::World;
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tickwire_net::Host;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error, info, warn};

/// Running simulation thread.
pub struct Simulation {
    stop: CancellationToken,
    handle: Option<JoinHandle<World>>,
}

impl Simulation {
    /// Start the thread. Returns once the host scheduler is attached to it.
    pub fn spawn(host: Arc<SimulationHost>, tick_interval: Duration) -> Result<Self> {
        let stop = CancellationToken::new();
        let (ready_tx, ready_rx) = mpsc::channel();
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("simulation".into())
            .spawn(move || {
                let attached = host.scheduler().attach_current_thread();
                let ok = attached.is_ok();
                let _ = ready_tx.send(attached);
                if ok {
                    run_loop(&host, tick_interval, &thread_stop)
                } else {
                    new_world()
                }
            })
            .context("Failed to spawn simulation thread")?;

        ready_rx
            .recv()
            .map_err(|_| anyhow!("simulation thread exited during startup"))?
            .context("Failed to attach scheduler")?;

        info!(interval_ms = tick_interval.as_millis() as u64, "Simulation started");
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Signal the thread to stop after its current tick.
    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    /// Stop the thread and return the final world.
    pub fn stop(mut self) -> Result<World> {
        self.stop.cancel();
        let handle = self
            .handle
            .take()
            .ok_or_else(|| anyhow!("simulation already stopped"))?;
        handle
            .join()
            .map_err(|_| anyhow!("simulation thread panicked"))
    }
}

impl Drop for Simulation {
    fn drop(&mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_loop(host: &SimulationHost, interval: Duration, stop: &CancellationToken) -> World {
    let mut world = new_world();
    let mut schedules = build_schedules();
    let mut deadline = Instant::now();

    while !stop.is_cancelled() {
        let tick = host.advance();
        let span = debug_span!("tick", tick = tick.0);
        let _entered = span.enter();

        run_tick(&mut world, &mut schedules, tick);
        match host.scheduler().run_due_work(tick, &mut world) {
            Ok(report) => {
                if report.missed > 0 {
                    warn!(missed = report.missed, "Cancelled work scheduled for past ticks");
                }
                if report.panicked > 0 {
                    warn!(panicked = report.panicked, "Scheduled work panicked; its callers were cancelled");
                }
            }
            Err(err) => {
                error!("Scheduler drain failed: {err}");
                break;
            }
        }

        deadline += interval;
        let now = Instant::now();
        if let Some(wait) = deadline.checked_duration_since(now) {
            std::thread::sleep(wait);
        } else {
            let behind = now - deadline;
            if behind > interval {
                warn!(behind_ms = behind.as_millis() as u64, "Simulation running behind; skipping ahead");
                deadline = now;
            }
        }
    }

    host.scheduler().shutdown();
    debug!(tick = host.current_tick().0, "Simulation stopped");
    world
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::WorldClock;
    use tickwire_net::ScheduleError;

    #[tokio::test]
    async fn scheduled_work_sees_the_live_world() {
        let host = SimulationHost::new().unwrap();
        let sim = Simulation::spawn(Arc::clone(&host), Duration::from_millis(1)).unwrap();
        assert!(host.dedicated_thread().is_some());

        let target = host.current_tick().advance(20);
        let seen = host
            .scheduler()
            .run_at(target, |world: &mut World| world.resource::<WorldClock>().tick)
            .await
            .unwrap();
        assert_eq!(seen, target);

        let world = sim.stop().unwrap();
        assert!(world.resource::<WorldClock>().tick >= target);
    }

    #[tokio::test]
    async fn stopping_cancels_pending_work() {
        let host = SimulationHost::new().unwrap();
        let sim = Simulation::spawn(Arc::clone(&host), Duration::from_millis(1)).unwrap();
        let far = host.scheduler().sleep_until(host.current_tick().advance(1_000_000));
        sim.stop().unwrap();
        assert!(far.await.is_err());
    }

    #[tokio::test]
    async fn panicking_work_does_not_stop_the_clock() {
        let host = SimulationHost::new().unwrap();
        let sim = Simulation::spawn(Arc::clone(&host), Duration::from_millis(1)).unwrap();

        let crashed = host.scheduler().run_next(|_: &mut World| -> u64 { panic!("broken edit") });
        assert_eq!(crashed.await, Err(ScheduleError::Cancelled));

        let before = host.current_tick();
        let after = tokio::time::timeout(
            Duration::from_secs(2),
            host.scheduler().run_next(|world: &mut World| world.resource::<WorldClock>().tick),
        )
        .await
        .expect("simulation thread still draining")
        .unwrap();
        assert!(after >= before);
        sim.stop().unwrap();
    }
}
