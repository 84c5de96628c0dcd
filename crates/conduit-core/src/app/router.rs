//! Correlation Router - request/reply over a shared reply stream.
//!
//! `submit` publishes a task and parks the caller on a pending entry keyed by
//! the task id. A single dispatch loop reads the reply subscription, decodes
//! the embedded id and resolves the matching entry. Every reply is acked,
//! matched or not; a reply for an id nobody waits for (timed out, cancelled,
//! or sent to another router instance) is discarded.
//!
//! # Lifecycle of one task
//! `Submitted -> AwaitingReply -> Resolved | TimedOut`. The pending table
//! guarantees only one of the two terminal transitions happens.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, sleep_until};
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::app::consumer::Consumer;
use crate::app::pending::PendingTable;
use crate::app::publisher::Publisher;
use crate::domain::{BridgeError, Delivery, Task, TaskEnvelope, TaskId, Topology};

struct Shared {
    publisher: Publisher,
    consumer: Consumer,
    forward: Topology,
    table: PendingTable,
    /// In-flight publishes; detached from callers, stopped by shutdown.
    publishes: Mutex<JoinSet<()>>,
    span: Span,
}

pub struct Router {
    shared: Arc<Shared>,
    default_timeout: Duration,
    shutdown_tx: watch::Sender<bool>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl Router {
    /// Start the dispatch loop. Tasks go to `forward` through `publisher`;
    /// replies are read from the consumer's source.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        publisher: Publisher,
        consumer: Consumer,
        forward: Topology,
        default_timeout: Duration,
    ) -> Self {
        let span = info_span!("router", %forward, reply = %consumer.source());
        let shared = Arc::new(Shared {
            publisher,
            consumer,
            forward,
            table: PendingTable::new(),
            publishes: Mutex::new(JoinSet::new()),
            span,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatch = tokio::spawn(dispatch_loop(Arc::clone(&shared), shutdown_rx));

        Self {
            shared,
            default_timeout,
            shutdown_tx,
            dispatch: Mutex::new(Some(dispatch)),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn publisher(&self) -> &Publisher {
        &self.shared.publisher
    }

    pub fn consumer(&self) -> &Consumer {
        &self.shared.consumer
    }

    /// Number of tasks currently awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.shared.table.len()
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub async fn submit_with_default_timeout(&self, task: Task) -> Result<Delivery, BridgeError> {
        self.submit(task, self.default_timeout).await
    }

    /// Publish `task` and wait for the reply carrying its id.
    ///
    /// Resolves with the reply delivery (already acked by the router), or
    /// with exactly one error: the publish failure, `CorrelationTimeout`,
    /// `DuplicateTask` or `RouterClosed`. Dropping the future removes the
    /// pending entry but does not cancel the publish.
    pub async fn submit(&self, task: Task, timeout: Duration) -> Result<Delivery, BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::RouterClosed);
        }

        let id = task.id();
        let body = task.into_envelope().encode()?;
        // None for timeouts too large to represent: wait without a deadline
        let deadline = Instant::now().checked_add(timeout);

        let mut reply = self.shared.table.insert(id, timeout)?;
        let _guard = PendingGuard {
            table: &self.shared.table,
            id,
        };
        // shutdown raises the flag before draining, so either the drain sees
        // this entry or we see the flag
        if self.is_closed() {
            return Err(BridgeError::RouterClosed);
        }

        self.spawn_publish(id, body);

        let expired = async {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            outcome = &mut reply => outcome.unwrap_or_else(|_| Err(BridgeError::RouterClosed)),
            _ = expired => {
                if self.shared.table.expire(id) {
                    debug!(parent: &self.shared.span, task_id = %id, ?timeout, "no reply before deadline");
                }
                // whoever removed the entry already sent its outcome
                reply.await.unwrap_or_else(|_| Err(BridgeError::RouterClosed))
            }
        }
    }

    /// Run the publish for `id` outside the caller's future, so dropping
    /// `submit` does not cancel it. Shutdown does.
    fn spawn_publish(&self, id: TaskId, body: Vec<u8>) {
        let shared = Arc::clone(&self.shared);
        let mut shutdown = self.shutdown_tx.subscribe();
        let publish = async move {
            tokio::select! {
                biased;
                Ok(_) = shutdown.wait_for(|closed| *closed) => {
                    debug!(task_id = %id, "publish abandoned on shutdown");
                }
                sent = shared.publisher.send(&shared.forward, &body) => {
                    if let Err(e) = sent {
                        if shared.table.fail(id, e) {
                            debug!(task_id = %id, "publish failed, pending entry removed");
                        }
                    }
                }
            }
        }
        .instrument(self.shared.span.clone());

        let mut publishes = self.shared.publishes.lock();
        while publishes.try_join_next().is_some() {}
        publishes.spawn(publish);
    }

    /// Stop dispatching, fail every pending task with `RouterClosed` and
    /// close both connections. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);

        let dispatch = self.dispatch.lock().take();
        if let Some(handle) = dispatch {
            let _ = handle.await;
        }

        // publishes see the flag and stop before the publisher is closed
        let mut publishes = std::mem::take(&mut *self.shared.publishes.lock());
        while publishes.join_next().await.is_some() {}

        let drained = self.shared.table.drain_all(|| BridgeError::RouterClosed);
        self.shared.publisher.close().await;
        self.shared.consumer.close().await;
        info!(parent: &self.shared.span, drained, "router shut down");
    }
}

/// Removes the pending entry when `submit` returns or is dropped.
struct PendingGuard<'a> {
    table: &'a PendingTable,
    id: TaskId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.table.remove(self.id) {
            debug!(task_id = %self.id, "submit cancelled, pending entry removed");
        }
    }
}

async fn dispatch_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let span = shared.span.clone();
    async {
        'outer: loop {
            if *shutdown.borrow() {
                break;
            }

            let subscribed = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                r = shared.consumer.subscribe() => r,
            };
            let mut subscription = match subscribed {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "reply subscription exhausted, starting over");
                    continue;
                }
            };

            loop {
                let delivery = tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break 'outer;
                        }
                        continue;
                    }
                    d = subscription.next() => d,
                };
                let Some(delivery) = delivery else {
                    warn!("reply subscription lost, resubscribing");
                    break;
                };
                dispatch(&shared.table, delivery).await;
            }
        }
        debug!("dispatch loop stopped");
    }
    .instrument(span)
    .await
}

/// Resolve the waiter for `delivery`, then ack it. Unmatched or undecodable
/// deliveries are acked and dropped.
async fn dispatch(table: &PendingTable, delivery: Delivery) {
    let ack = delivery.ack_handle();
    let tag = delivery.delivery_tag();

    match TaskEnvelope::decode(delivery.body()) {
        Ok(envelope) => {
            let task_id = envelope.task_id();
            match table.resolve(task_id, delivery) {
                Ok(()) => debug!(%task_id, "reply matched"),
                Err(_) => debug!(%task_id, "no pending task for reply, discarding"),
            }
        }
        Err(e) => warn!(delivery_tag = tag, error = %e, "discarding undecodable reply"),
    }

    if let Err(e) = ack.ack().await {
        warn!(delivery_tag = tag, error = %e, "could not ack reply");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::connection::ConnectionManager;
    use crate::app::worker_loop::{WorkerGroup, WorkerSettings};
    use crate::backoff::BackoffPolicy;
    use crate::domain::{ConnectionState, ErrorKind, Role};
    use crate::impls::{EchoHandler, InMemoryBroker};
    use futures::future::join_all;
    use std::collections::HashSet;

    fn policy(budget: Duration) -> BackoffPolicy {
        BackoffPolicy {
            initial_interval: Duration::from_millis(10),
            multiplier: 2.0,
            max_interval: Duration::from_millis(40),
            max_elapsed_time: budget,
        }
    }

    fn router(broker: &InMemoryBroker, reply: Topology, publish_budget: Duration) -> Router {
        let publisher = Publisher::new(
            ConnectionManager::new(Arc::new(broker.clone()), "memory://router", Role::Publisher),
            policy(publish_budget),
        );
        let consumer = Consumer::new(
            ConnectionManager::new(Arc::new(broker.clone()), "memory://router", Role::Consumer),
            policy(Duration::from_secs(30)),
            reply,
        );
        Router::start(publisher, consumer, Topology::queue("tasks"), Duration::from_secs(5))
    }

    fn workers(broker: &InMemoryBroker, n: usize, reply: Topology) -> WorkerGroup {
        let settings = WorkerSettings {
            broker: Arc::new(broker.clone()),
            address: "memory://worker".into(),
            tasks: Topology::queue("tasks"),
            reply,
            publisher_backoff: policy(Duration::from_secs(30)),
            consumer_backoff: policy(Duration::from_secs(30)),
        };
        WorkerGroup::spawn(n, &settings, Arc::new(EchoHandler))
    }

    fn reply_payload(delivery: &Delivery) -> (TaskId, Vec<u8>) {
        let envelope = TaskEnvelope::decode(delivery.body()).unwrap();
        (envelope.task_id(), envelope.into_payload())
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..500 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn single_task_round_trips_through_a_worker() {
        let broker = InMemoryBroker::new();
        let group = workers(&broker, 1, Topology::queue("results"));
        let router = router(&broker, Topology::queue("results"), Duration::from_secs(5));
        let task = Task::with_payload(b"{\"n\":42}".to_vec());
        let id = task.id();

        let delivery = router.submit_with_default_timeout(task).await.unwrap();

        assert_eq!(reply_payload(&delivery), (id, b"{\"n\":42}".to_vec()));
        assert!(delivery.ack_handle().is_settled());
        assert_eq!(router.pending_count(), 0);

        router.shutdown().await;
        group.shutdown_and_join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn hundred_concurrent_tasks_resolve_without_cross_delivery() {
        let broker = InMemoryBroker::new();
        let group = workers(&broker, 4, Topology::queue("results"));
        let router = router(&broker, Topology::queue("results"), Duration::from_secs(5));

        let tasks: Vec<Task> = (0..100)
            .map(|i| Task::with_payload(format!("payload-{i}").into_bytes()))
            .collect();
        let expected: Vec<(TaskId, Vec<u8>)> = tasks
            .iter()
            .map(|t| (t.id(), t.payload().to_vec()))
            .collect();

        let outcomes = join_all(
            tasks
                .into_iter()
                .map(|t| router.submit(t, Duration::from_secs(10))),
        )
        .await;

        let mut seen = HashSet::new();
        for (outcome, (id, payload)) in outcomes.into_iter().zip(expected) {
            let delivery = outcome.unwrap();
            assert_eq!(reply_payload(&delivery), (id, payload));
            assert!(seen.insert(id));
        }
        assert_eq!(seen.len(), 100);
        assert_eq!(router.pending_count(), 0);

        router.shutdown().await;
        group.shutdown_and_join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn fanout_replies_are_correlated() {
        let broker = InMemoryBroker::new();
        let reply = Topology::fanout("results");
        let group = workers(&broker, 2, reply.clone());
        let router = router(&broker, reply, Duration::from_secs(5));
        // replies published before the router binds its queue are lost
        wait_until(|| router.consumer().connection().state() == ConnectionState::Ready).await;

        let task = Task::with_payload(b"fan".to_vec());
        let id = task.id();
        let delivery = router.submit(task, Duration::from_secs(5)).await.unwrap();

        assert_eq!(reply_payload(&delivery).0, id);

        router.shutdown().await;
        group.shutdown_and_join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_and_discards_the_late_reply() {
        let broker = InMemoryBroker::new();
        let router = router(&broker, Topology::queue("results"), Duration::from_secs(5));
        let task = Task::with_payload(b"never answered".to_vec());
        let id = task.id();

        let started = Instant::now();
        let err = router
            .submit(task, Duration::from_millis(50))
            .await
            .unwrap_err();
        let waited = started.elapsed();

        assert!(matches!(err, BridgeError::CorrelationTimeout { task_id, .. } if task_id == id));
        assert_eq!(err.kind(), ErrorKind::CorrelationTimeout);
        assert!(waited >= Duration::from_millis(50));
        assert!(waited < Duration::from_millis(60));
        assert_eq!(router.pending_count(), 0);

        // the stray reply is acked and dropped, not resurrected
        let stray = TaskEnvelope::new(id, b"too late".to_vec()).encode().unwrap();
        let late_publisher = Publisher::new(
            ConnectionManager::new(Arc::new(broker.clone()), "memory://late", Role::Publisher),
            policy(Duration::from_secs(5)),
        );
        late_publisher
            .send(&Topology::queue("results"), &stray)
            .await
            .unwrap();

        wait_until(|| broker.stats().acked == 1).await;
        assert_eq!(broker.queue_depth("results"), Some(0));
        assert_eq!(broker.unsettled_count("results"), Some(0));
        assert_eq!(router.pending_count(), 0);

        router.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_replies_are_acked_and_dropped() {
        let broker = InMemoryBroker::new();
        let router = router(&broker, Topology::queue("results"), Duration::from_secs(5));
        let publisher = Publisher::new(
            ConnectionManager::new(Arc::new(broker.clone()), "memory://noise", Role::Publisher),
            policy(Duration::from_secs(5)),
        );

        publisher
            .send(&Topology::queue("results"), b"garbage")
            .await
            .unwrap();

        wait_until(|| broker.stats().acked == 1).await;
        assert_eq!(broker.unsettled_count("results"), Some(0));

        router.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_from_a_broker_outage() {
        let broker = InMemoryBroker::new();
        let group = workers(&broker, 2, Topology::queue("results"));
        let router = router(&broker, Topology::queue("results"), Duration::from_secs(10));
        router
            .submit(Task::with_payload(b"warm-up".to_vec()), Duration::from_secs(5))
            .await
            .unwrap();

        broker.set_reachable(false);
        broker.sever_connections();
        wait_until(|| router.publisher().connection().state() == ConnectionState::Disconnected)
            .await;
        assert_eq!(
            router.consumer().connection().state(),
            ConnectionState::Disconnected
        );

        let task = Task::with_payload(b"during outage".to_vec());
        let id = task.id();
        let heal = async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            broker.set_reachable(true);
        };
        let (outcome, ()) = tokio::join!(router.submit(task, Duration::from_secs(20)), heal);

        let delivery = outcome.unwrap();
        assert_eq!(reply_payload(&delivery), (id, b"during outage".to_vec()));
        assert!(broker.stats().refused_connects > 0);
        assert_eq!(router.publisher().connection().state(), ConnectionState::Ready);

        router.shutdown().await;
        group.shutdown_and_join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_outage_fails_with_publish_exhausted() {
        let broker = InMemoryBroker::new();
        let router = router(&broker, Topology::queue("results"), Duration::from_millis(300));
        broker.set_reachable(false);

        let err = router
            .submit(Task::with_payload(b"x".to_vec()), Duration::from_secs(30))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::PublishExhausted);
        assert_eq!(router.pending_count(), 0);

        router.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_id_is_rejected_while_the_first_waits() {
        let broker = InMemoryBroker::new();
        let router = router(&broker, Topology::queue("results"), Duration::from_secs(5));
        let task = Task::with_payload(b"once".to_vec());

        let (first, second) = tokio::join!(
            router.submit(task.clone(), Duration::from_millis(100)),
            router.submit(task.clone(), Duration::from_millis(100)),
        );

        assert!(matches!(first, Err(BridgeError::CorrelationTimeout { .. })));
        assert!(matches!(second, Err(BridgeError::DuplicateTask(id)) if id == task.id()));

        router.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_submit_removes_the_entry_but_still_publishes() {
        let broker = InMemoryBroker::new();
        let router = router(&broker, Topology::queue("results"), Duration::from_secs(5));

        let cancelled = tokio::time::timeout(
            Duration::from_millis(1),
            router.submit(Task::with_payload(b"bye".to_vec()), Duration::from_secs(10)),
        )
        .await;

        assert!(cancelled.is_err());
        assert_eq!(router.pending_count(), 0);
        wait_until(|| broker.queue_depth("tasks") == Some(1)).await;

        router.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_fails_pending_tasks_and_rejects_new_ones() {
        let broker = InMemoryBroker::new();
        let router = router(&broker, Topology::queue("results"), Duration::from_secs(5));

        let stop = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            router.shutdown().await;
        };
        let (outcome, ()) = tokio::join!(
            router.submit(Task::with_payload(b"x".to_vec()), Duration::from_secs(10)),
            stop
        );

        assert!(matches!(outcome, Err(BridgeError::RouterClosed)));
        assert!(router.is_closed());
        let late = router.submit(Task::with_payload(b"y".to_vec()), Duration::from_secs(1)).await;
        assert!(matches!(late, Err(BridgeError::RouterClosed)));
        assert_eq!(broker.open_connections(), 0);

        router.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_publishes_still_retrying() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false);
        let router = router(&broker, Topology::queue("results"), Duration::from_secs(5));

        let stop = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            router.shutdown().await;
        };
        let (outcome, ()) = tokio::join!(
            router.submit(Task::with_payload(b"x".to_vec()), Duration::from_secs(10)),
            stop
        );
        assert!(matches!(outcome, Err(BridgeError::RouterClosed)));

        broker.set_reachable(true);
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(broker.open_connections(), 0);
        assert_eq!(router.publisher().connection().state(), ConnectionState::Disconnected);
        assert_eq!(broker.queue_depth("tasks"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_timeout_still_resolves() {
        let broker = InMemoryBroker::new();
        let group = workers(&broker, 1, Topology::queue("results"));
        let router = router(&broker, Topology::queue("results"), Duration::from_secs(5));
        let task = Task::with_payload(b"forever".to_vec());
        let id = task.id();

        let delivery = router.submit(task, Duration::MAX).await.unwrap();
        assert_eq!(reply_payload(&delivery), (id, b"forever".to_vec()));
        group.shutdown_and_join().await;

        let stop = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            router.shutdown().await;
        };
        let (outcome, ()) = tokio::join!(
            router.submit(Task::with_payload(b"never".to_vec()), Duration::MAX),
            stop
        );
        assert!(matches!(outcome, Err(BridgeError::RouterClosed)));
    }
}
