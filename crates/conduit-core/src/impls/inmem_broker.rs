//! InMemoryBroker - in-process implementation of the broker port.
//!
//! Supports what the bridge relies on:
//! - durable and exclusive queues, direct and fanout exchanges
//! - round-robin delivery to consumers with explicit ack/reject
//! - redelivery of unsettled messages when a channel or connection goes away
//! - fault injection: refused connects, outages, severed connections, restarts
//!
//! # 学習ポイント
//! - 状態はすべて一つの `parking_lot::Mutex` の中
//! - `.await` をまたいでロックを保持しない

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::domain::{DEFAULT_EXCHANGE, Delivery};
use crate::ports::{
    Acknowledger, Broker, BrokerChannel, BrokerConnection, BrokerError, DeliveryStream,
    ExchangeKind, Publishing, QueueOptions,
};

/// Counters exposed for tests and the demo.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub connect_attempts: u64,
    pub refused_connects: u64,
    pub published: u64,
    pub delivered: u64,
    pub acked: u64,
    pub rejected: u64,
    pub redelivered: u64,
}

#[derive(Debug, Clone)]
struct Message {
    body: Vec<u8>,
    persistent: bool,
    redelivered: bool,
}

struct Unsettled {
    message: Message,
    connection: u64,
    channel: u64,
}

struct ConsumerEntry {
    connection: u64,
    channel: u64,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct QueueState {
    durable: bool,
    owner: Option<u64>,
    ready: VecDeque<Message>,
    consumers: Vec<ConsumerEntry>,
    next_consumer: usize,
    unsettled: HashMap<u64, Unsettled>,
}

impl QueueState {
    fn new(options: QueueOptions, owner: Option<u64>) -> Self {
        Self {
            durable: options.durable,
            owner,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
            unsettled: HashMap::new(),
        }
    }
}

struct ExchangeState {
    kind: ExchangeKind,
    bindings: Vec<(String, String)>,
}

struct ConnectionEntry {
    close_listeners: Vec<oneshot::Sender<BrokerError>>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    exchanges: HashMap<String, ExchangeState>,
    connections: HashMap<u64, ConnectionEntry>,
    next_connection_id: u64,
    next_channel_id: u64,
    next_generated_queue: u64,
    refuse_remaining: u32,
    unreachable: bool,
    stats: BrokerStats,
}

struct Shared {
    state: Mutex<BrokerState>,
    next_delivery_tag: AtomicU64,
}

impl Shared {
    /// Push ready messages of `queue` to its consumers until one side runs dry.
    fn dispatch(self: &Arc<Self>, state: &mut BrokerState, queue: &str) {
        loop {
            let Some(q) = state.queues.get_mut(queue) else {
                return;
            };
            q.consumers.retain(|c| !c.tx.is_closed());
            if q.ready.is_empty() || q.consumers.is_empty() {
                return;
            }

            let index = q.next_consumer % q.consumers.len();
            q.next_consumer = index + 1;
            let Some(message) = q.ready.pop_front() else {
                return;
            };

            let tag = self.next_delivery_tag.fetch_add(1, Ordering::Relaxed) + 1;
            let acker = Arc::new(InMemoryAcker {
                shared: Arc::downgrade(self),
                queue: queue.to_string(),
                tag,
            });
            let delivery = Delivery::new(message.body.clone(), tag, message.redelivered, acker);

            let consumer = &q.consumers[index];
            let (connection, channel) = (consumer.connection, consumer.channel);
            if consumer.tx.send(delivery).is_err() {
                q.ready.push_front(message);
                q.consumers.remove(index);
                continue;
            }

            q.unsettled.insert(
                tag,
                Unsettled {
                    message,
                    connection,
                    channel,
                },
            );
            state.stats.delivered += 1;
        }
    }

    /// Requeue everything a channel (or a whole connection, when `channel` is
    /// `None`) still holds and detach its consumers.
    fn release(self: &Arc<Self>, state: &mut BrokerState, connection: u64, channel: Option<u64>) {
        let owned_by = |c: u64, ch: u64| c == connection && channel.is_none_or(|id| id == ch);
        let mut touched = Vec::new();

        for (name, q) in state.queues.iter_mut() {
            let before = q.consumers.len();
            q.consumers.retain(|c| !owned_by(c.connection, c.channel));

            let mut tags: Vec<u64> = q
                .unsettled
                .iter()
                .filter(|(_, u)| owned_by(u.connection, u.channel))
                .map(|(tag, _)| *tag)
                .collect();
            // oldest first so the original order is restored at the front
            tags.sort_unstable_by(|a, b| b.cmp(a));
            for tag in &tags {
                if let Some(mut u) = q.unsettled.remove(tag) {
                    u.message.redelivered = true;
                    q.ready.push_front(u.message);
                    state.stats.redelivered += 1;
                }
            }

            if before != q.consumers.len() || !tags.is_empty() {
                touched.push(name.clone());
            }
        }

        if channel.is_none() {
            let exclusive: Vec<String> = state
                .queues
                .iter()
                .filter(|(_, q)| q.owner == Some(connection))
                .map(|(name, _)| name.clone())
                .collect();
            for name in exclusive {
                state.queues.remove(&name);
                for exchange in state.exchanges.values_mut() {
                    exchange.bindings.retain(|(queue, _)| *queue != name);
                }
            }
        }

        for name in touched {
            self.dispatch(state, &name);
        }
    }

    fn drop_connection(self: &Arc<Self>, connection: u64, reason: Option<&str>) {
        let mut state = self.state.lock();
        let Some(entry) = state.connections.remove(&connection) else {
            return;
        };
        if let Some(reason) = reason {
            for listener in entry.close_listeners {
                let _ = listener.send(BrokerError::ConnectionClosed(reason.to_string()));
            }
        }
        self.release(&mut state, connection, None);
    }

    fn is_unsettled(&self, queue: &str, tag: u64) -> bool {
        self.state
            .lock()
            .queues
            .get(queue)
            .is_some_and(|q| q.unsettled.contains_key(&tag))
    }

    fn ensure_open(&self, connection: u64) -> Result<(), BrokerError> {
        if self.state.lock().connections.contains_key(&connection) {
            Ok(())
        } else {
            Err(BrokerError::ConnectionClosed("connection is closed".into()))
        }
    }
}

/// In-process broker. Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                next_delivery_tag: AtomicU64::new(0),
            }),
        }
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_connections(&self, n: u32) {
        self.shared.state.lock().refuse_remaining = n;
    }

    /// Simulate an outage: while unreachable every connect is refused.
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.state.lock().unreachable = !reachable;
    }

    /// Close every open connection from the broker side, as a crash or a
    /// network partition would. Listeners registered with `notify_close` fire.
    pub fn sever_connections(&self) {
        let ids: Vec<u64> = self.shared.state.lock().connections.keys().copied().collect();
        for id in ids {
            self.shared.drop_connection(id, Some("connection reset by broker"));
        }
        debug!("severed all in-memory connections");
    }

    /// Sever all connections and forget everything a restart would lose:
    /// non-durable queues and non-persistent messages.
    pub fn restart(&self) {
        self.sever_connections();
        let mut state = self.shared.state.lock();
        state.queues.retain(|_, q| q.durable);
        for q in state.queues.values_mut() {
            q.ready.retain(|m| m.persistent);
        }
        let surviving: Vec<String> = state.queues.keys().cloned().collect();
        for exchange in state.exchanges.values_mut() {
            exchange
                .bindings
                .retain(|(queue, _)| surviving.contains(queue));
        }
    }

    pub fn stats(&self) -> BrokerStats {
        self.shared.state.lock().stats.clone()
    }

    pub fn open_connections(&self) -> usize {
        self.shared.state.lock().connections.len()
    }

    /// Messages waiting to be delivered, or `None` if the queue does not exist.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
    }

    /// Messages delivered but not yet settled.
    pub fn unsettled_count(&self, queue: &str) -> Option<usize> {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.unsettled.len())
    }

    pub fn consumer_count(&self, queue: &str) -> Option<usize> {
        self.shared.state.lock().queues.get(queue).map(|q| {
            q.consumers
                .iter()
                .filter(|c| !c.tx.is_closed())
                .count()
        })
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self, address: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let mut state = self.shared.state.lock();
        state.stats.connect_attempts += 1;

        if state.unreachable || state.refuse_remaining > 0 {
            state.refuse_remaining = state.refuse_remaining.saturating_sub(1);
            state.stats.refused_connects += 1;
            return Err(BrokerError::ConnectionRefused(address.to_string()));
        }

        state.next_connection_id += 1;
        let id = state.next_connection_id;
        state.connections.insert(
            id,
            ConnectionEntry {
                close_listeners: Vec::new(),
            },
        );
        trace!(connection = id, %address, "accepted connection");

        Ok(Arc::new(InMemoryConnection {
            shared: self.shared.clone(),
            id,
        }))
    }
}

struct InMemoryConnection {
    shared: Arc<Shared>,
    id: u64,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut state = self.shared.state.lock();
        if !state.connections.contains_key(&self.id) {
            return Err(BrokerError::ConnectionClosed("connection is closed".into()));
        }
        state.next_channel_id += 1;
        Ok(Arc::new(InMemoryChannel {
            shared: self.shared.clone(),
            connection: self.id,
            id: state.next_channel_id,
            closed: AtomicBool::new(false),
        }))
    }

    fn notify_close(&self) -> oneshot::Receiver<BrokerError> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.shared.state.lock();
        match state.connections.get_mut(&self.id) {
            Some(entry) => entry.close_listeners.push(tx),
            None => {
                let _ = tx.send(BrokerError::ConnectionClosed("connection is closed".into()));
            }
        }
        rx
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.shared.drop_connection(self.id, None);
        Ok(())
    }
}

struct InMemoryChannel {
    shared: Arc<Shared>,
    connection: u64,
    id: u64,
    closed: AtomicBool,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::ChannelClosed);
        }
        self.shared.ensure_open(self.connection)
    }

    fn route(state: &BrokerState, exchange: &str, routing_key: &str) -> Result<Vec<String>, BrokerError> {
        if exchange == DEFAULT_EXCHANGE {
            if state.queues.contains_key(routing_key) {
                return Ok(vec![routing_key.to_string()]);
            }
            return Err(BrokerError::NotFound {
                kind: "queue",
                name: routing_key.to_string(),
            });
        }

        let ex = state
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::NotFound {
                kind: "exchange",
                name: exchange.to_string(),
            })?;
        Ok(ex
            .bindings
            .iter()
            .filter(|(_, key)| ex.kind == ExchangeKind::Fanout || key == routing_key)
            .map(|(queue, _)| queue.clone())
            .collect())
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, BrokerError> {
        self.ensure_open()?;
        let mut state = self.shared.state.lock();

        let name = if name.is_empty() {
            state.next_generated_queue += 1;
            format!("amq.gen-{}", state.next_generated_queue)
        } else {
            name.to_string()
        };

        let owner = options.exclusive.then_some(self.connection);
        match state.queues.get(&name) {
            Some(existing) if existing.owner.is_some() && existing.owner != owner => {
                return Err(BrokerError::Other(format!(
                    "queue '{name}' is exclusive to another connection"
                )));
            }
            Some(_) => {}
            None => {
                state.queues.insert(name.clone(), QueueState::new(options, owner));
            }
        }
        Ok(name)
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.shared.state.lock();
        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(BrokerError::Other(format!(
                "exchange '{name}' already declared as {:?}",
                existing.kind
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.shared.state.lock();
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::NotFound {
                kind: "queue",
                name: queue.to_string(),
            });
        }
        let ex = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::NotFound {
                kind: "exchange",
                name: exchange.to_string(),
            })?;
        let binding = (queue.to_string(), routing_key.to_string());
        if !ex.bindings.contains(&binding) {
            ex.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Publishing,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.shared.state.lock();
        let targets = Self::route(&state, exchange, routing_key)?;

        for queue in &targets {
            if let Some(q) = state.queues.get_mut(queue) {
                q.ready.push_back(Message {
                    body: message.body.clone(),
                    persistent: message.persistent,
                    redelivered: false,
                });
            }
        }
        state.stats.published += 1;
        for queue in &targets {
            self.shared.dispatch(&mut state, queue);
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.shared.state.lock();
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::NotFound {
                    kind: "queue",
                    name: queue.to_string(),
                })?;
            q.consumers.push(ConsumerEntry {
                connection: self.connection,
                channel: self.id,
                tx,
            });
            trace!(queue, consumer_tag, "registered consumer");
            self.shared.dispatch(&mut state, queue);
        }

        // deliveries still buffered when their channel went away have already
        // been requeued; skip them instead of handing out duplicates
        let shared = Arc::downgrade(&self.shared);
        let queue = queue.to_string();
        let stream = futures::stream::unfold(rx, move |mut rx| {
            let shared = shared.clone();
            let queue = queue.clone();
            async move {
                while let Some(delivery) = rx.recv().await {
                    let live = shared
                        .upgrade()
                        .is_some_and(|s| s.is_unsettled(&queue, delivery.delivery_tag()));
                    if live {
                        return Some((delivery, rx));
                    }
                }
                None
            }
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut state = self.shared.state.lock();
        self.shared.release(&mut state, self.connection, Some(self.id));
        Ok(())
    }
}

struct InMemoryAcker {
    shared: Weak<Shared>,
    queue: String,
    tag: u64,
}

impl InMemoryAcker {
    fn settle(&self, requeue: Option<bool>) -> Result<(), BrokerError> {
        let shared = self
            .shared
            .upgrade()
            .ok_or_else(|| BrokerError::Other("broker is gone".into()))?;
        let mut state = shared.state.lock();
        let unknown = || BrokerError::Other(format!("unknown delivery tag {}", self.tag));

        let q = state.queues.get_mut(&self.queue).ok_or_else(unknown)?;
        let unsettled = q.unsettled.remove(&self.tag).ok_or_else(unknown)?;

        match requeue {
            None => state.stats.acked += 1,
            Some(requeue) => {
                state.stats.rejected += 1;
                if requeue {
                    let mut message = unsettled.message;
                    message.redelivered = true;
                    if let Some(q) = state.queues.get_mut(&self.queue) {
                        q.ready.push_front(message);
                    }
                    shared.dispatch(&mut state, &self.queue);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for InMemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle(None)
    }

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.settle(Some(requeue))
    }
}
