//! Host whose simulation thread advances only when the test says so.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::JoinHandle;
use tickwire_core::SimTick;
use tickwire_net::{DrainReport, Host, MirroredRegistry, TickScheduler};
use tokio::sync::oneshot;
use tracing::debug;

/// Simulation state of the manual host.
#[derive(Debug, Default)]
pub struct TestWorld {
    /// Free-form event log written by test commands.
    pub log: Vec<String>,
    /// Named counters.
    pub counters: BTreeMap<String, i64>,
}

/// [`Host`] with an externally stepped tick counter.
pub struct ManualHost {
    tick: AtomicU64,
    scheduler: TickScheduler<TestWorld>,
    mirrored: Vec<MirroredRegistry>,
}

impl ManualHost {
    /// Host at tick 0 mirroring the given tables.
    pub fn new(mirrored: Vec<MirroredRegistry>) -> Arc<Self> {
        Arc::new(Self {
            tick: AtomicU64::new(0),
            scheduler: TickScheduler::new(),
            mirrored,
        })
    }
}

impl Host for ManualHost {
    type State = TestWorld;

    fn current_tick(&self) -> SimTick {
        SimTick(self.tick.load(Ordering::Acquire))
    }

    fn scheduler(&self) -> &TickScheduler<TestWorld> {
        &self.scheduler
    }

    fn mirrored_registries(&self) -> Vec<MirroredRegistry> {
        self.mirrored.clone()
    }
}

type Inspect = Box<dyn FnOnce(&mut TestWorld) + Send>;

enum Step {
    Advance(u64, oneshot::Sender<(SimTick, DrainReport)>),
    Inspect(Inspect),
}

/// Dedicated simulation thread for a [`ManualHost`].
pub struct SimThread {
    host: Arc<ManualHost>,
    steps: Option<std_mpsc::Sender<Step>>,
    handle: Option<JoinHandle<TestWorld>>,
}

impl SimThread {
    /// Start the thread and attach the host's scheduler to it.
    pub fn spawn(host: Arc<ManualHost>) -> Self {
        let (steps, inbox) = std_mpsc::channel();
        let sim_host = Arc::clone(&host);
        let handle = std::thread::Builder::new()
            .name("test-sim".into())
            .spawn(move || run(sim_host, inbox))
            .expect("spawn simulation thread");
        Self {
            host,
            steps: Some(steps),
            handle: Some(handle),
        }
    }

    /// Host driven by this thread.
    pub fn host(&self) -> &Arc<ManualHost> {
        &self.host
    }

    /// Advance one tick and drain its scheduled work.
    pub async fn step(&self) -> SimTick {
        self.step_n(1).await.0
    }

    /// Advance `ticks` ticks; returns the final tick and the summed drain report.
    pub async fn step_n(&self, ticks: u64) -> (SimTick, DrainReport) {
        let (reply, done) = oneshot::channel();
        self.send(Step::Advance(ticks, reply));
        done.await.expect("simulation thread stopped")
    }

    /// Run `f` against the world on the simulation thread.
    pub async fn with_world<T: Send + 'static>(
        &self,
        f: impl FnOnce(&mut TestWorld) -> T + Send + 'static,
    ) -> T {
        let (reply, done) = oneshot::channel();
        self.send(Step::Inspect(Box::new(move |world| {
            let _ = reply.send(f(world));
        })));
        done.await.expect("simulation thread stopped")
    }

    fn send(&self, step: Step) {
        if let Some(steps) = &self.steps {
            steps.send(step).expect("simulation thread stopped");
        }
    }

    /// Stop the thread and return the final world.
    pub fn stop(mut self) -> TestWorld {
        self.shutdown().unwrap_or_default()
    }

    fn shutdown(&mut self) -> Option<TestWorld> {
        self.steps.take();
        self.handle.take().and_then(|handle| handle.join().ok())
    }
}

impl Drop for SimThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(host: Arc<ManualHost>, inbox: std_mpsc::Receiver<Step>) -> TestWorld {
    let mut world = TestWorld::default();
    host.scheduler
        .attach_current_thread()
        .expect("scheduler attached to another thread");

    while let Ok(step) = inbox.recv() {
        match step {
            Step::Advance(ticks, reply) => {
                let mut total = DrainReport::default();
                for _ in 0..ticks {
                    let tick = SimTick(host.tick.fetch_add(1, Ordering::AcqRel) + 1);
                    let report = host
                        .scheduler
                        .run_due_work(tick, &mut world)
                        .expect("drain on simulation thread");
                    total.timed += report.timed;
                    total.ready += report.ready;
                    total.missed += report.missed;
                }
                let _ = reply.send((host.current_tick(), total));
            }
            Step::Inspect(f) => f(&mut world),
        }
    }

    host.scheduler.shutdown();
    debug!(tick = host.current_tick().0, "Test simulation stopped");
    world
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scheduled_work_runs_on_the_sim_thread() {
        let sim = SimThread::spawn(ManualHost::new(Vec::new()));
        let host = Arc::clone(sim.host());
        let sim_thread = host.dedicated_thread();

        let pending = host.scheduler().run_at(SimTick(2), |world: &mut TestWorld| {
            world.log.push("tick two".into());
            std::thread::current().id()
        });
        assert_eq!(sim.step().await, SimTick(1));
        assert_eq!(sim.step().await, SimTick(2));

        let ran_on = pending.await.unwrap();
        assert_eq!(Some(ran_on), host.dedicated_thread());
        assert!(sim_thread.is_none() || sim_thread == Some(ran_on));
        let log = sim.with_world(|world| world.log.clone()).await;
        assert_eq!(log, vec!["tick two"]);
    }
}
