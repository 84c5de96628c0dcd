//! ConnectionManager - one broker connection + channel per role.
//!
//! The manager never reconnects on its own. Publisher and Consumer call
//! [`ConnectionManager::connect`] from inside their backoff loops; when the
//! transport drops, the watcher flips the state to `Disconnected` and every
//! outstanding [`Link`] observes it through [`Link::lost`].
//!
//! # Generations
//! Each successful connect gets a new generation number. State updates carry
//! it, so a watcher or a failing operation belonging to an old connection can
//! never tear down a newer one.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, debug, info, info_span, warn};

use crate::domain::{BridgeError, ConnectionState, Role, Topology};
use crate::ports::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, ExchangeKind, QueueOptions,
};

/// Connection state tagged with the generation it refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub generation: u64,
}

struct StateCell {
    tx: watch::Sender<ConnectionStatus>,
    generation: AtomicU64,
}

impl StateCell {
    fn set(&self, state: ConnectionState, generation: u64) {
        self.tx.send_replace(ConnectionStatus { state, generation });
    }

    /// `from -> to` for `generation` only; returns whether it happened.
    fn transition(&self, generation: u64, from: &[ConnectionState], to: ConnectionState) -> bool {
        self.tx.send_if_modified(|status| {
            if status.generation == generation && from.contains(&status.state) {
                status.state = to;
                true
            } else {
                false
            }
        })
    }
}

struct Session {
    generation: u64,
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
    declared: HashMap<Topology, String>,
    watcher: JoinHandle<()>,
}

impl Session {
    async fn shutdown(self) {
        self.watcher.abort();
        close_quietly(Some(&self.channel), &self.connection).await;
    }

    fn link(&self, queue: String, state: watch::Receiver<ConnectionStatus>) -> Link {
        Link {
            channel: self.channel.clone(),
            queue,
            generation: self.generation,
            state,
        }
    }
}

/// Handle to a ready session, scoped to one declared topology.
#[derive(Clone)]
pub struct Link {
    channel: Arc<dyn BrokerChannel>,
    queue: String,
    generation: u64,
    state: watch::Receiver<ConnectionStatus>,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("queue", &self.queue)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl Link {
    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }

    /// Queue to consume from. Empty for a publisher's fanout destination.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_alive(&self) -> bool {
        let status = *self.state.borrow();
        status.generation == self.generation && status.state.is_ready()
    }

    /// Resolves once this link's connection is no longer ready.
    pub async fn lost(&mut self) {
        let generation = self.generation;
        // a dropped sender means the manager is gone, which counts as lost
        let _ = self
            .state
            .wait_for(|status| status.generation != generation || !status.state.is_ready())
            .await;
    }
}

pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    address: String,
    role: Role,
    cell: Arc<StateCell>,
    session: Mutex<Option<Session>>,
    span: Span,
}

impl ConnectionManager {
    pub fn new(broker: Arc<dyn Broker>, address: impl Into<String>, role: Role) -> Self {
        let address = address.into();
        let span = info_span!("broker", %role, %address);
        let (tx, _) = watch::channel(ConnectionStatus {
            state: ConnectionState::Disconnected,
            generation: 0,
        });
        Self {
            broker,
            address,
            role,
            cell: Arc::new(StateCell {
                tx,
                generation: AtomicU64::new(0),
            }),
            session: Mutex::new(None),
            span,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Span every operation of this role runs in.
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn state(&self) -> ConnectionState {
        self.cell.tx.borrow().state
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionStatus> {
        self.cell.tx.subscribe()
    }

    /// Return a ready link for `topology`, opening a new session if needed.
    ///
    /// Concurrent callers are serialized, so at most one connect is in flight
    /// per role. A ready session is reused and only declares topologies it has
    /// not seen yet.
    pub async fn connect(&self, topology: &Topology) -> Result<Link, BridgeError> {
        self.connect_inner(topology)
            .instrument(self.span.clone())
            .await
    }

    async fn connect_inner(&self, topology: &Topology) -> Result<Link, BridgeError> {
        let mut guard = self.session.lock().await;

        if let Some(session) = guard.as_mut() {
            let current = *self.cell.tx.borrow();
            if current.generation == session.generation && current.state.is_ready() {
                if let Some(queue) = session.declared.get(topology) {
                    return Ok(session.link(queue.clone(), self.cell.tx.subscribe()));
                }
                match declare(session.channel.as_ref(), topology, self.role).await {
                    Ok(queue) => {
                        session.declared.insert(topology.clone(), queue.clone());
                        return Ok(session.link(queue, self.cell.tx.subscribe()));
                    }
                    Err(e) => {
                        warn!(%topology, error = %e, "declare on live session failed");
                        let generation = session.generation;
                        if let Some(stale) = guard.take() {
                            stale.shutdown().await;
                        }
                        self.cell.set(ConnectionState::Disconnected, generation);
                        return Err(BridgeError::Broker(e));
                    }
                }
            }
        }

        if let Some(stale) = guard.take() {
            debug!(generation = stale.generation, "discarding stale session");
            stale.shutdown().await;
        }

        let generation = self.cell.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.cell.set(ConnectionState::Connecting, generation);

        let session = match self.open(generation, topology).await {
            Ok(session) => session,
            Err(e) => {
                self.cell.set(ConnectionState::Disconnected, generation);
                return Err(e);
            }
        };

        let ready = self.cell.transition(
            generation,
            &[ConnectionState::Connecting],
            ConnectionState::Ready,
        );
        if !ready {
            // the watcher saw the connection die while we were setting up
            session.shutdown().await;
            return Err(BridgeError::ConnectionLost);
        }

        info!(generation, %topology, "broker session ready");
        let queue = session.declared.get(topology).cloned().unwrap_or_default();
        let link = session.link(queue, self.cell.tx.subscribe());
        *guard = Some(session);
        Ok(link)
    }

    /// Dial, open a channel and declare `topology`. Anything opened on the
    /// way is closed again if a later step fails.
    async fn open(&self, generation: u64, topology: &Topology) -> Result<Session, BridgeError> {
        let connection = self
            .broker
            .connect(&self.address)
            .await
            .map_err(BridgeError::Connect)?;

        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                close_quietly(None, &connection).await;
                return Err(BridgeError::Connect(e));
            }
        };

        let queue = match declare(channel.as_ref(), topology, self.role).await {
            Ok(queue) => queue,
            Err(e) => {
                close_quietly(Some(&channel), &connection).await;
                return Err(BridgeError::Connect(e));
            }
        };

        let watcher = spawn_watcher(
            connection.notify_close(),
            self.cell.clone(),
            generation,
            self.span.clone(),
        );

        let mut declared = HashMap::new();
        declared.insert(topology.clone(), queue);
        Ok(Session {
            generation,
            connection,
            channel,
            declared,
            watcher,
        })
    }

    /// An operation failed on `link`: drop its session so the next `connect`
    /// starts over. No-op if a newer session already replaced it.
    pub async fn invalidate(&self, link: &Link) {
        let mut guard = self.session.lock().await;
        let is_current = guard
            .as_ref()
            .is_some_and(|s| s.generation == link.generation);
        if is_current {
            if let Some(session) = guard.take() {
                session.shutdown().await;
            }
        }
        let changed = self.cell.transition(
            link.generation,
            &[ConnectionState::Connecting, ConnectionState::Ready],
            ConnectionState::Disconnected,
        );
        if changed {
            debug!(parent: &self.span, generation = link.generation, "session invalidated");
        }
    }

    /// Close channel then connection. Safe to call repeatedly.
    pub async fn close(&self) {
        let mut guard = self.session.lock().await;
        let generation = self.cell.tx.borrow().generation;
        if let Some(session) = guard.take() {
            self.cell.set(ConnectionState::Draining, generation);
            session.shutdown().await;
            info!(parent: &self.span, generation, "broker session closed");
        }
        self.cell.set(ConnectionState::Disconnected, generation);
    }
}

async fn declare(
    channel: &dyn BrokerChannel,
    topology: &Topology,
    role: Role,
) -> Result<String, BrokerError> {
    match (topology, role) {
        (Topology::Queue(name), _) => channel.declare_queue(name, QueueOptions::durable()).await,
        (Topology::Fanout(exchange), Role::Publisher) => {
            channel
                .declare_exchange(exchange, ExchangeKind::Fanout)
                .await?;
            Ok(String::new())
        }
        (Topology::Fanout(exchange), Role::Consumer) => {
            channel
                .declare_exchange(exchange, ExchangeKind::Fanout)
                .await?;
            let queue = channel
                .declare_queue("", QueueOptions::exclusive())
                .await?;
            channel.bind_queue(&queue, exchange, "").await?;
            Ok(queue)
        }
    }
}

fn spawn_watcher(
    closed: oneshot::Receiver<BrokerError>,
    cell: Arc<StateCell>,
    generation: u64,
    span: Span,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            let reason = match closed.await {
                Ok(err) => err.to_string(),
                Err(_) => "closed by client".to_string(),
            };
            let changed = cell.transition(
                generation,
                &[ConnectionState::Connecting, ConnectionState::Ready],
                ConnectionState::Disconnected,
            );
            if changed {
                warn!(generation, %reason, "broker connection lost");
            }
        }
        .instrument(span),
    )
}

async fn close_quietly(channel: Option<&Arc<dyn BrokerChannel>>, connection: &Arc<dyn BrokerConnection>) {
    if let Some(channel) = channel {
        if let Err(e) = channel.close().await {
            debug!(error = %e, "channel close failed");
        }
    }
    if let Err(e) = connection.close().await {
        debug!(error = %e, "connection close failed");
    }
}
