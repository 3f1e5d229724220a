//! Per-connection command execution.
//!
//! Every parsed command runs as its own task in the context's task group.
//! Faults inside a running command (an `Err` or a panic) become a `Fail`
//! result for that uid. Faults while decoding an entry leave the frame
//! position untrusted and are returned to the connection.

use crate::buf::WireBuf;
use crate::command::{CommandResult, PreparedCommand};
use crate::connection::{ConnectionError, ConnectionId};
use crate::host::Host;
use crate::message::{CommandResultMsg, ContextMessage, Message, MessageError, Outbox};
use crate::registry::RegistryEntry;
use crate::scheduler::ScheduleError;
use crate::service::RegistryService;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use tickwire_core::{RegistryKey, SimTick};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

struct ContextInner<H: Host> {
    connection: ConnectionId,
    host: Arc<H>,
    registries: Arc<RegistryService<H>>,
    outbox: Outbox,
    tasks: Mutex<JoinSet<()>>,
    cancel: CancellationToken,
}

/// Handle shared by the connection and every command it runs.
pub struct CommandContext<H: Host> {
    inner: Arc<ContextInner<H>>,
}

impl<H: Host> Clone for CommandContext<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: Host> CommandContext<H> {
    pub(crate) fn new(
        connection: ConnectionId,
        host: Arc<H>,
        registries: Arc<RegistryService<H>>,
        outbox: Outbox,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                connection,
                host,
                registries,
                outbox,
                tasks: Mutex::new(JoinSet::new()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Connection this context belongs to.
    pub fn connection_id(&self) -> ConnectionId {
        self.inner.connection
    }

    /// Host simulation handle.
    pub fn host(&self) -> &Arc<H> {
        &self.inner.host
    }

    /// Finalized registries.
    pub fn registries(&self) -> &RegistryService<H> {
        &self.inner.registries
    }

    /// Tick the host is currently processing.
    pub fn current_tick(&self) -> SimTick {
        self.inner.host.current_tick()
    }

    /// Queue a message to this context's connection.
    pub fn send<M: Message>(&self, message: &M) -> Result<(), MessageError> {
        if self.is_cancelled() {
            return Err(MessageError::Closed);
        }
        self.inner.outbox.send(message)
    }

    /// Bind `message` to this context's connection.
    pub fn bind<M: Message>(&self, message: M) -> ContextMessage<M> {
        ContextMessage::new(self.inner.connection, message)
    }

    /// Queue a bound message. Fails if it was already written or belongs elsewhere.
    pub fn send_bound<M: Message>(&self, message: &ContextMessage<M>) -> Result<(), MessageError> {
        if self.is_cancelled() {
            return Err(MessageError::Closed);
        }
        self.inner.outbox.send_bound(message)
    }

    /// True once the owning connection has closed.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Resolves when the owning connection closes.
    pub async fn cancelled(&self) {
        self.inner.cancel.cancelled().await
    }

    /// Commands spawned and not yet reaped.
    pub fn in_flight(&self) -> usize {
        let mut tasks = self.lock_tasks();
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    /// Run `f` on the simulation thread during the next tick.
    pub fn run_next_tick<T, F>(&self, f: F) -> impl Future<Output = Result<T, ScheduleError>> + Send + 'static
    where
        F: FnOnce(&mut H::State) -> T + Send + 'static,
        T: Send + 'static,
    {
        let tick = self.current_tick().next();
        self.inner.host.scheduler().run_at(tick, f)
    }

    /// Run `f` on the simulation thread at `tick`.
    pub fn run_at_tick<T, F>(&self, tick: SimTick, f: F) -> impl Future<Output = Result<T, ScheduleError>> + Send + 'static
    where
        F: FnOnce(&mut H::State) -> T + Send + 'static,
        T: Send + 'static,
    {
        self.inner.host.scheduler().run_at(tick, f)
    }

    /// Suspend for `ticks` simulation ticks; zero waits for the next drain.
    pub fn delay_ticks(&self, ticks: u64) -> impl Future<Output = Result<(), ScheduleError>> + Send + 'static {
        let scheduler = self.inner.host.scheduler();
        if ticks == 0 {
            scheduler.run_next(|_| ()).boxed()
        } else {
            scheduler
                .sleep_until(self.current_tick().advance(ticks))
                .boxed()
        }
    }

    /// Decode one command entry from `buf` and start it. Returns the uid.
    ///
    /// Reads the command wire id and uid, parses the payload, and spawns the
    /// command. An unreadable id or uid, an unknown id, a type with no wire
    /// constructor, or a payload that fails to decode is a protocol
    /// violation: the position in the frame can no longer be trusted. A
    /// parser that panics is an internal error.
    pub fn execute_from_buffer(&self, buf: &mut WireBuf) -> Result<u64, ConnectionError> {
        let id = buf
            .read_var_u32()
            .map_err(|err| ConnectionError::ViolatedPolicy(format!("malformed command id: {err}")))?;
        let command = self
            .inner
            .registries
            .commands()
            .get_by_id(id)
            .ok_or_else(|| ConnectionError::ViolatedPolicy(format!("unknown command id {id}")))?;
        let name = command.name().clone();
        if !command.is_constructible() {
            return Err(ConnectionError::ViolatedPolicy(format!(
                "{name} cannot be decoded from the wire"
            )));
        }
        let uid = buf.read_var_u64().map_err(|err| {
            ConnectionError::ViolatedPolicy(format!("malformed uid for {name}: {err}"))
        })?;

        let parsed = panic::catch_unwind(AssertUnwindSafe(|| command.parse(self, buf)));
        let prepared = match parsed {
            Ok(Ok(prepared)) => prepared,
            Ok(Err(err)) => {
                return Err(ConnectionError::ViolatedPolicy(format!(
                    "failed to parse {name} (uid {uid}): {err}"
                )));
            }
            Err(panic) => {
                let message = panic_message(&*panic);
                error!(connection = %self.inner.connection, command = %name, uid, panic = %message, "Command parser panicked");
                return Err(ConnectionError::Internal(format!(
                    "unexpected error while parsing {name}: {message}"
                )));
            }
        };

        self.spawn(name, uid, prepared);
        Ok(uid)
    }

    fn spawn(&self, name: RegistryKey, uid: u64, prepared: PreparedCommand<H>) {
        let mut tasks = self.lock_tasks();
        // `cancel` trips the token before taking the lock.
        if self.is_cancelled() {
            debug!(command = %name, uid, "Context cancelled; dropping command");
            return;
        }
        let future = prepared(self.clone());
        let ctx = self.clone();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let result = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(result)) => result,
                Ok(Err(err)) => {
                    error!(connection = %ctx.inner.connection, command = %name, uid, "Command failed: {err:#}");
                    CommandResult::fail(format!("internal error: {err}"))
                }
                Err(panic) => {
                    let message = panic_message(&*panic);
                    error!(connection = %ctx.inner.connection, command = %name, uid, panic = %message, "Command panicked");
                    CommandResult::fail(format!("internal error: {message}"))
                }
            };
            ctx.reply(uid, result);
        });
    }

    fn reply(&self, uid: u64, result: CommandResult) {
        if self.is_cancelled() {
            return;
        }
        let message = self.bind(CommandResultMsg { uid, result });
        match self.send_bound(&message) {
            Ok(()) => {}
            Err(MessageError::TooLarge { len, max }) => {
                warn!(connection = %self.inner.connection, uid, len, max, "Command result too large for one frame");
                let fallback = self.bind(CommandResultMsg {
                    uid,
                    result: CommandResult::fail(format!(
                        "result of {len} bytes exceeds the frame limit of {max}"
                    )),
                });
                if let Err(err) = self.send_bound(&fallback) {
                    debug!(connection = %self.inner.connection, uid, %err, "Dropping command result");
                }
            }
            Err(err) => {
                debug!(connection = %self.inner.connection, uid, %err, "Dropping command result");
            }
        }
    }

    /// Cancel every queued or running command and wait until all have stopped.
    ///
    /// Cancelled commands produce no result.
    pub async fn cancel(&self) {
        self.inner.cancel.cancel();
        let mut tasks = std::mem::take(&mut *self.lock_tasks());
        let pending = tasks.len();
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        if pending > 0 {
            debug!(connection = %self.inner.connection, pending, "Cancelled in-flight commands");
        }
    }

    fn lock_tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}
