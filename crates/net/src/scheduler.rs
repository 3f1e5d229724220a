//! Tick-synchronized dispatcher.
//!
//! Work submitted from any thread runs on the host's simulation thread when
//! [`TickScheduler::run_due_work`] is called for the matching tick. Tick-bound
//! jobs are ordered by `(tick, submission order)` in a min-heap; jobs with no
//! tick affinity go through a FIFO queue drained in the same call.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::thread::{self, ThreadId};
use thiserror::Error;
use tickwire_core::SimTick;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// Scheduled unit of work. Receives the simulation state, or the reason it
/// will never run.
pub type Job<S> = Box<dyn FnOnce(Result<&mut S, ScheduleError>) + Send>;

/// Why scheduled work did not run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// Target tick had already passed when the job was discovered.
    #[error("work scheduled for tick {scheduled} was found at tick {current}")]
    Missed {
        /// Requested tick.
        scheduled: SimTick,
        /// Tick being processed.
        current: SimTick,
    },
    /// `run_due_work` was called from a thread other than the attached one.
    #[error("scheduler drained off the simulation thread")]
    WrongThread,
    /// No simulation thread has been attached yet.
    #[error("scheduler is not attached to a simulation thread")]
    Detached,
    /// A different thread is already attached.
    #[error("scheduler is already attached to another thread")]
    AlreadyAttached,
    /// The scheduler shut down before the work ran.
    #[error("scheduled work was cancelled")]
    Cancelled,
}

/// Counters from one [`TickScheduler::run_due_work`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Tick-bound jobs that ran.
    pub timed: usize,
    /// FIFO jobs that ran.
    pub ready: usize,
    /// Tick-bound jobs cancelled because their tick had passed.
    pub missed: usize,
    /// Jobs that panicked. Their awaiting side sees [`ScheduleError::Cancelled`].
    pub panicked: usize,
}

struct Timed<S> {
    tick: SimTick,
    seq: u64,
    job: Job<S>,
}

impl<S> PartialEq for Timed<S> {
    fn eq(&self, other: &Self) -> bool {
        (self.tick, self.seq) == (other.tick, other.seq)
    }
}

impl<S> Eq for Timed<S> {}

impl<S> PartialOrd for Timed<S> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<S> Ord for Timed<S> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.tick, self.seq).cmp(&(other.tick, other.seq))
    }
}

struct Queues<S> {
    timed: BinaryHeap<Reverse<Timed<S>>>,
    ready: VecDeque<Job<S>>,
    next_seq: u64,
    closed: bool,
}

/// Dispatcher bound to one simulation thread.
pub struct TickScheduler<S> {
    thread: OnceLock<ThreadId>,
    queues: Mutex<Queues<S>>,
}

impl<S: 'static> TickScheduler<S> {
    /// Scheduler with no attached thread.
    pub fn new() -> Self {
        Self {
            thread: OnceLock::new(),
            queues: Mutex::new(Queues {
                timed: BinaryHeap::new(),
                ready: VecDeque::new(),
                next_seq: 0,
                closed: false,
            }),
        }
    }

    /// Bind the scheduler to the calling thread. Only that thread may drain it.
    pub fn attach_current_thread(&self) -> Result<(), ScheduleError> {
        let current = thread::current().id();
        match self.thread.set(current) {
            Ok(()) => Ok(()),
            Err(_) if self.thread.get() == Some(&current) => Ok(()),
            Err(_) => Err(ScheduleError::AlreadyAttached),
        }
    }

    /// Thread allowed to call [`TickScheduler::run_due_work`].
    pub fn dedicated_thread(&self) -> Option<ThreadId> {
        self.thread.get().copied()
    }

    fn lock(&self) -> MutexGuard<'_, Queues<S>> {
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `job` when the simulation thread drains `tick`. Safe from any thread.
    ///
    /// Returns the submission sequence number, which orders jobs sharing a tick.
    pub fn schedule_at_tick(
        &self,
        tick: SimTick,
        job: impl FnOnce(Result<&mut S, ScheduleError>) + Send + 'static,
    ) -> u64 {
        let mut queues = self.lock();
        let seq = queues.next_seq;
        queues.next_seq += 1;
        if queues.closed {
            drop(queues);
            job(Err(ScheduleError::Cancelled));
            return seq;
        }
        queues.timed.push(Reverse(Timed {
            tick,
            seq,
            job: Box::new(job),
        }));
        seq
    }

    /// Run `job` at the next drain, after any work due on that tick.
    pub fn dispatch(&self, job: impl FnOnce(Result<&mut S, ScheduleError>) + Send + 'static) {
        let mut queues = self.lock();
        if queues.closed {
            drop(queues);
            job(Err(ScheduleError::Cancelled));
            return;
        }
        queues.ready.push_back(Box::new(job));
    }

    /// Run `f` against the simulation state at `tick` and resolve with its output.
    ///
    /// Dropping the returned future before `tick` makes the job a no-op.
    pub fn run_at<T, F>(
        &self,
        tick: SimTick,
        f: F,
    ) -> impl Future<Output = Result<T, ScheduleError>> + Send + 'static
    where
        F: FnOnce(&mut S) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.schedule_at_tick(tick, move |state| {
            if tx.is_closed() {
                return;
            }
            let _ = tx.send(state.map(f));
        });
        async move { rx.await.unwrap_or(Err(ScheduleError::Cancelled)) }
    }

    /// Run `f` against the simulation state at the next drain.
    pub fn run_next<T, F>(&self, f: F) -> impl Future<Output = Result<T, ScheduleError>> + Send + 'static
    where
        F: FnOnce(&mut S) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.dispatch(move |state| {
            if tx.is_closed() {
                return;
            }
            let _ = tx.send(state.map(f));
        });
        async move { rx.await.unwrap_or(Err(ScheduleError::Cancelled)) }
    }

    /// Resolve once the simulation thread drains `tick`.
    pub fn sleep_until(&self, tick: SimTick) -> impl Future<Output = Result<(), ScheduleError>> + Send + 'static {
        self.run_at(tick, |_| ())
    }

    /// Number of queued `(tick-bound, fifo)` jobs.
    pub fn pending(&self) -> (usize, usize) {
        let queues = self.lock();
        (queues.timed.len(), queues.ready.len())
    }

    /// Run everything due at `current` on the attached thread.
    ///
    /// Tick-bound jobs for `current` run in submission order. Jobs whose tick
    /// has already passed are handed [`ScheduleError::Missed`] instead of the
    /// state. FIFO jobs are drained afterwards; whenever one of them schedules
    /// new work for `current`, that work runs before the next FIFO job.
    pub fn run_due_work(&self, current: SimTick, state: &mut S) -> Result<DrainReport, ScheduleError> {
        match self.thread.get() {
            None => return Err(ScheduleError::Detached),
            Some(id) if *id != thread::current().id() => return Err(ScheduleError::WrongThread),
            Some(_) => {}
        }

        let mut report = DrainReport::default();
        loop {
            let due = self.take_due(current);
            if due.is_empty() {
                let next = self.lock().ready.pop_front();
                let Some(job) = next else { break };
                report.ready += 1;
                if !contain(current, || job(Ok(&mut *state))) {
                    report.panicked += 1;
                }
                continue;
            }
            for Timed { tick, seq, job } in due {
                if tick < current {
                    warn!(scheduled = tick.0, current = current.0, seq, "Cancelling tick work scheduled in the past");
                    report.missed += 1;
                    let missed = ScheduleError::Missed {
                        scheduled: tick,
                        current,
                    };
                    if !contain(current, || job(Err(missed))) {
                        report.panicked += 1;
                    }
                } else {
                    report.timed += 1;
                    if !contain(current, || job(Ok(&mut *state))) {
                        report.panicked += 1;
                    }
                }
            }
        }

        if report != DrainReport::default() {
            debug!(tick = current.0, ?report, "Drained scheduled work");
        }
        Ok(report)
    }

    fn take_due(&self, current: SimTick) -> Vec<Timed<S>> {
        let mut queues = self.lock();
        let mut due = Vec::new();
        while queues
            .timed
            .peek()
            .is_some_and(|Reverse(next)| next.tick <= current)
        {
            if let Some(Reverse(timed)) = queues.timed.pop() {
                due.push(timed);
            }
        }
        due
    }

    /// Refuse new work and cancel everything queued.
    pub fn shutdown(&self) {
        let (timed, ready) = {
            let mut queues = self.lock();
            queues.closed = true;
            (
                std::mem::take(&mut queues.timed),
                std::mem::take(&mut queues.ready),
            )
        };
        let cancelled = timed.len() + ready.len();
        for Reverse(timed) in timed.into_sorted_vec().into_iter().rev() {
            (timed.job)(Err(ScheduleError::Cancelled));
        }
        for job in ready {
            job(Err(ScheduleError::Cancelled));
        }
        if cancelled > 0 {
            debug!(cancelled, "Scheduler shut down with queued work");
        }
    }
}

/// Run one job, keeping a panic on the simulation thread. Returns false if it panicked.
fn contain(tick: SimTick, job: impl FnOnce()) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(job)) {
        Ok(()) => true,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|text| (*text).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(tick = tick.0, panic = %message, "Scheduled work panicked");
            false
        }
    }
}

impl<S: 'static> Default for TickScheduler<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    type Log = Vec<String>;

    fn attached() -> TickScheduler<Log> {
        let scheduler = TickScheduler::new();
        scheduler.attach_current_thread().unwrap();
        scheduler
    }

    fn push(label: &'static str) -> impl FnOnce(Result<&mut Log, ScheduleError>) + Send {
        move |state| {
            if let Ok(log) = state {
                log.push(label.to_string());
            }
        }
    }

    #[test]
    fn nothing_runs_before_its_tick() {
        let scheduler = attached();
        let mut log = Log::new();
        scheduler.schedule_at_tick(SimTick(3), push("t3"));

        for tick in 0..3 {
            scheduler.run_due_work(SimTick(tick), &mut log).unwrap();
            assert!(log.is_empty());
        }
        let report = scheduler.run_due_work(SimTick(3), &mut log).unwrap();
        assert_eq!(log, vec!["t3"]);
        assert_eq!(report.timed, 1);
    }

    #[test]
    fn same_tick_runs_in_submission_order() {
        let scheduler = attached();
        let mut log = Log::new();
        scheduler.schedule_at_tick(SimTick(5), push("a"));
        scheduler.schedule_at_tick(SimTick(4), push("early"));
        scheduler.schedule_at_tick(SimTick(5), push("b"));
        scheduler.schedule_at_tick(SimTick(5), push("c"));

        scheduler.run_due_work(SimTick(4), &mut log).unwrap();
        scheduler.run_due_work(SimTick(5), &mut log).unwrap();
        assert_eq!(log, vec!["early", "a", "b", "c"]);
    }

    #[test]
    fn past_ticks_are_cancelled_not_run() {
        let scheduler = attached();
        let mut log = Log::new();
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        scheduler.schedule_at_tick(SimTick(2), move |state| {
            *sink.lock().unwrap() = Some(state.map(|_| ()));
        });

        let report = scheduler.run_due_work(SimTick(7), &mut log).unwrap();
        assert_eq!(report.missed, 1);
        assert_eq!(
            *seen.lock().unwrap(),
            Some(Err(ScheduleError::Missed {
                scheduled: SimTick(2),
                current: SimTick(7)
            }))
        );
    }

    #[test]
    fn fifo_drains_after_tick_work_and_reschedules_promptly() {
        let scheduler = Arc::new(attached());
        let mut log = Log::new();
        let inner = Arc::clone(&scheduler);
        scheduler.dispatch(move |state| {
            if let Ok(log) = state {
                log.push("fifo-1".into());
                inner.schedule_at_tick(SimTick(1), push("rescheduled"));
            }
        });
        scheduler.dispatch(push("fifo-2"));
        scheduler.schedule_at_tick(SimTick(1), push("timed"));

        let report = scheduler.run_due_work(SimTick(1), &mut log).unwrap();
        assert_eq!(log, vec!["timed", "fifo-1", "rescheduled", "fifo-2"]);
        assert_eq!(report, DrainReport { timed: 2, ready: 2, missed: 0, panicked: 0 });
        assert_eq!(scheduler.pending(), (0, 0));
    }

    #[test]
    fn draining_requires_the_attached_thread() {
        let scheduler = Arc::new(TickScheduler::<Log>::new());
        assert_eq!(
            scheduler.run_due_work(SimTick(0), &mut Log::new()),
            Err(ScheduleError::Detached)
        );
        scheduler.attach_current_thread().unwrap();
        scheduler.attach_current_thread().unwrap();

        let remote = Arc::clone(&scheduler);
        let outcome = std::thread::spawn(move || {
            let attach = remote.attach_current_thread();
            let drain = remote.run_due_work(SimTick(0), &mut Log::new());
            (attach, drain)
        })
        .join()
        .unwrap();
        assert_eq!(outcome.0, Err(ScheduleError::AlreadyAttached));
        assert_eq!(outcome.1, Err(ScheduleError::WrongThread));
    }

    #[test]
    fn scheduling_from_other_threads() {
        let scheduler = Arc::new(attached());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let remote = Arc::clone(&scheduler);
                std::thread::spawn(move || {
                    remote.schedule_at_tick(SimTick(1), move |state| {
                        if let Ok(log) = state {
                            log.push(format!("thread-{i}"));
                        }
                    });
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let mut log = Log::new();
        scheduler.run_due_work(SimTick(1), &mut log).unwrap();
        assert_eq!(log.len(), 4);
    }

    #[tokio::test]
    async fn run_at_resolves_with_output() {
        let scheduler = attached();
        let fut = scheduler.run_at(SimTick(2), |log: &mut Log| {
            log.push("ran".into());
            log.len()
        });
        let mut log = Log::new();
        scheduler.run_due_work(SimTick(2), &mut log).unwrap();
        assert_eq!(fut.await, Ok(1));
    }

    #[tokio::test]
    async fn dropped_waiters_skip_their_work() {
        let scheduler = attached();
        drop(scheduler.run_at(SimTick(1), |log: &mut Log| log.push("ran".into())));
        let mut log = Log::new();
        scheduler.run_due_work(SimTick(1), &mut log).unwrap();
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn shutdown_cancels_queued_and_future_work() {
        let scheduler = attached();
        let queued = scheduler.sleep_until(SimTick(10));
        let next = scheduler.run_next(|_| ());
        scheduler.shutdown();
        assert_eq!(queued.await, Err(ScheduleError::Cancelled));
        assert_eq!(next.await, Err(ScheduleError::Cancelled));
        assert_eq!(
            scheduler.sleep_until(SimTick(11)).await,
            Err(ScheduleError::Cancelled)
        );
    }

    #[tokio::test]
    async fn panicking_work_is_contained_and_the_drain_continues() {
        let scheduler = attached();
        let doomed = scheduler.run_next(|_: &mut Log| -> usize { panic!("bad job") });
        scheduler.schedule_at_tick(SimTick(1), |_| panic!("bad tick job"));
        scheduler.dispatch(push("after"));
        let mut log = Log::new();

        let report = scheduler.run_due_work(SimTick(1), &mut log).unwrap();
        assert_eq!(report.panicked, 2);
        assert_eq!(report.ready, 2);
        assert_eq!(report.timed, 1);
        assert_eq!(log, vec!["after"]);
        assert_eq!(doomed.await, Err(ScheduleError::Cancelled));

        let later = scheduler.run_next(|log: &mut Log| log.len());
        scheduler.run_due_work(SimTick(2), &mut log).unwrap();
        assert_eq!(later.await, Ok(1));
    }
}
