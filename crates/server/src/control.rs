//! Control server: accepts peers, tracks established clients, and closes
//! them all on shutdown.

use crate::commands::SystemChat;
use crate::host::SimulationHost;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tickwire_net::{
    CloseReason, Connection, ConnectionId, Message, RegistryService, ServerEndpoint, Transport,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, instrument, warn, Instrument};

type ClientMap = HashMap<ConnectionId, Arc<Connection<SimulationHost>>>;

/// Owns every connection of the reference host.
pub struct ControlServer {
    host: Arc<SimulationHost>,
    registries: Arc<RegistryService<SimulationHost>>,
    clients: Mutex<ClientMap>,
    tasks: Mutex<JoinSet<()>>,
    shutdown: CancellationToken,
    grace_period: Duration,
}

impl ControlServer {
    /// Create the server and start forwarding system chat to clients.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        host: Arc<SimulationHost>,
        registries: Arc<RegistryService<SimulationHost>>,
        grace_period: Duration,
    ) -> Arc<Self> {
        let server = Arc::new(Self {
            host,
            registries,
            clients: Mutex::new(HashMap::new()),
            tasks: Mutex::new(JoinSet::new()),
            shutdown: CancellationToken::new(),
            grace_period,
        });
        let forwarder = Arc::clone(&server);
        server
            .lock_tasks()
            .spawn(async move { forwarder.forward_chat().await });
        server
    }

    /// Start a session on an accepted transport.
    pub fn attach(self: &Arc<Self>, transport: Arc<dyn Transport>) -> Arc<Connection<SimulationHost>> {
        let peer = transport.peer();
        let connection = Connection::new(
            Arc::clone(&self.host),
            Arc::clone(&self.registries),
            transport,
        );
        let span = info_span!("connection", id = %connection.id(), %peer);
        let server = Arc::clone(self);
        let session = Arc::clone(&connection);
        self.lock_tasks()
            .spawn(async move { server.drive(session).await }.instrument(span));
        connection
    }

    async fn drive(&self, connection: Arc<Connection<SimulationHost>>) {
        let id = connection.id();
        if self.shutdown.is_cancelled() {
            connection
                .close(CloseReason::going_away("Server shutting down"))
                .await;
            return;
        }
        if connection.establish().await.is_err() {
            return;
        }

        self.lock_clients().insert(id, Arc::clone(&connection));
        if self.shutdown.is_cancelled() {
            connection
                .close(CloseReason::going_away("Server shutting down"))
                .await;
        }
        let reason = connection.run().await;
        self.lock_clients().remove(&id);
        debug!(%reason, remaining = self.client_count(), "Client removed");
    }

    /// Accept QUIC connections until [`ControlServer::shutdown`] is called.
    #[instrument(skip_all, fields(addr = %endpoint.local_addr()))]
    pub async fn serve(self: &Arc<Self>, endpoint: ServerEndpoint) -> Result<()> {
        info!("Accepting control connections");
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = endpoint.accept() => accepted,
            };
            match accepted {
                Some(Ok(transport)) => {
                    self.attach(Arc::new(transport));
                }
                Some(Err(err)) => warn!("Failed to accept connection: {err:#}"),
                None => break,
            }
        }

        endpoint.close();
        if tokio::time::timeout(self.grace_period, endpoint.wait_idle())
            .await
            .is_err()
        {
            warn!("Endpoint did not go idle within the grace period");
        }
        Ok(())
    }

    /// Established clients.
    pub fn clients(&self) -> Vec<Arc<Connection<SimulationHost>>> {
        self.lock_clients().values().cloned().collect()
    }

    /// Number of established clients.
    pub fn client_count(&self) -> usize {
        self.lock_clients().len()
    }

    /// Queue `message` to every established client; returns how many took it.
    pub async fn broadcast<M: Message>(&self, message: &M) -> usize {
        let mut delivered = 0;
        for client in self.clients() {
            match client.send(message).await {
                Ok(()) => delivered += 1,
                Err(err) => debug!(connection = %client.id(), %err, "Skipped broadcast"),
            }
        }
        delivered
    }

    async fn forward_chat(&self) {
        let mut chat = self.host.subscribe_chat();
        loop {
            let line = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                line = chat.recv() => line,
            };
            match line {
                Ok(line) => {
                    self.broadcast(&SystemChat { text: line.text }).await;
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Chat forwarder fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    }

    /// Close every client with going-away, then wait up to the grace period
    /// for their sessions to end. Sessions still running are aborted.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let clients = self.clients();
        info!(clients = clients.len(), "Shutting down control server");
        for client in &clients {
            client
                .close(CloseReason::going_away("Server shutting down"))
                .await;
        }

        let mut tasks = std::mem::take(&mut *self.lock_tasks());
        let drained = tokio::time::timeout(self.grace_period, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = tasks.len(),
                "Sessions still running after the grace period; aborting"
            );
            tasks.shutdown().await;
        }
    }

    fn lock_clients(&self) -> MutexGuard<'_, ClientMap> {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
