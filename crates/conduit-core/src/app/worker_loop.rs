//! WorkerLoop - the responding side of the bridge.
//!
//! # Flow
//! 1. Consume an encoded task from the task source
//! 2. Decode it; undecodable tasks are rejected without requeue
//! 3. Run the [`TaskHandler`]; failures are rejected without requeue and the
//!    caller's request times out
//! 4. Publish `TaskEnvelope { same task_id, result }` to the reply destination
//! 5. Ack the task only after the reply went out; if publishing is exhausted,
//!    reject with requeue so another worker can try

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info_span, warn};

use crate::app::connection::ConnectionManager;
use crate::app::consumer::Consumer;
use crate::app::publisher::Publisher;
use crate::backoff::BackoffPolicy;
use crate::domain::{AckHandle, Delivery, Role, TaskEnvelope, Topology};
use crate::ports::{Broker, TaskHandler};

/// Everything a worker needs to build its own pair of connections.
#[derive(Clone)]
pub struct WorkerSettings {
    pub broker: Arc<dyn Broker>,
    pub address: String,
    pub tasks: Topology,
    pub reply: Topology,
    pub publisher_backoff: BackoffPolicy,
    pub consumer_backoff: BackoffPolicy,
}

pub struct WorkerLoop {
    worker_id: usize,
    consumer: Consumer,
    publisher: Publisher,
    reply: Topology,
    handler: Arc<dyn TaskHandler>,
}

impl WorkerLoop {
    pub fn new(
        worker_id: usize,
        consumer: Consumer,
        publisher: Publisher,
        reply: Topology,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        Self {
            worker_id,
            consumer,
            publisher,
            reply,
            handler,
        }
    }

    pub fn from_settings(
        worker_id: usize,
        settings: &WorkerSettings,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        let consumer = Consumer::new(
            ConnectionManager::new(settings.broker.clone(), &settings.address, Role::Consumer),
            settings.consumer_backoff.clone(),
            settings.tasks.clone(),
        );
        let publisher = Publisher::new(
            ConnectionManager::new(settings.broker.clone(), &settings.address, Role::Publisher),
            settings.publisher_backoff.clone(),
        );
        Self::new(worker_id, consumer, publisher, settings.reply.clone(), handler)
    }

    /// Run until `shutdown` flips to true. A task already being handled is
    /// finished first.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let span = info_span!("worker", worker_id = self.worker_id);
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
                    r = self.consumer.subscribe() => r,
                };
                let mut subscription = match subscribed {
                    Ok(s) => s,
                    Err(e) => {
                        error!(error = %e, "task subscription exhausted, starting over");
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
                        warn!("task subscription lost, resubscribing");
                        break;
                    };
                    self.process(delivery).await;
                }
            }

            self.consumer.close().await;
            self.publisher.close().await;
            debug!("worker stopped");
        }
        .instrument(span)
        .await
    }

    async fn process(&self, delivery: Delivery) {
        let ack = delivery.ack_handle();

        let envelope = match TaskEnvelope::decode(delivery.body()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(delivery_tag = delivery.delivery_tag(), error = %e, "dropping undecodable task");
                settle(&ack, Settle::Reject { requeue: false }).await;
                return;
            }
        };
        let task_id = envelope.task_id();

        let result = match self.handler.handle(&envelope).await {
            Ok(result) => result,
            Err(e) => {
                warn!(%task_id, error = %e, "handler failed, dropping task");
                settle(&ack, Settle::Reject { requeue: false }).await;
                return;
            }
        };

        let body = match TaskEnvelope::new(task_id, result).encode() {
            Ok(body) => body,
            Err(e) => {
                warn!(%task_id, error = %e, "could not encode result");
                settle(&ack, Settle::Reject { requeue: false }).await;
                return;
            }
        };

        match self.publisher.send(&self.reply, &body).await {
            Ok(()) => {
                debug!(%task_id, redelivered = delivery.redelivered(), "replied");
                settle(&ack, Settle::Ack).await;
            }
            Err(e) => {
                error!(%task_id, error = %e, "could not publish result, requeueing task");
                settle(&ack, Settle::Reject { requeue: true }).await;
            }
        }
    }
}

enum Settle {
    Ack,
    Reject { requeue: bool },
}

async fn settle(ack: &AckHandle, how: Settle) {
    let result = match how {
        Settle::Ack => ack.ack().await,
        Settle::Reject { requeue } => ack.reject(requeue).await,
    };
    // the broker redelivers anything we fail to settle
    if let Err(e) = result {
        warn!(error = %e, "could not settle task delivery");
    }
}

/// Worker group handle.
/// - dropping or signalling `shutdown_tx` stops every worker
/// - `shutdown_and_join()` waits for all of them
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` workers, each with its own connections.
    pub fn spawn(n: usize, settings: &WorkerSettings, handler: Arc<dyn TaskHandler>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let worker = WorkerLoop::from_settings(worker_id, settings, Arc::clone(&handler));
            let rx = shutdown_rx.clone();
            joins.push(tokio::spawn(worker.run(rx)));
        }

        Self { shutdown_tx, joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Stop taking new tasks. In-flight tasks are finished, not cancelled.
    pub fn request_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for j in self.joins {
            let _ = j.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{EchoHandler, InMemoryBroker};
    use crate::ports::HandlerError;
    use async_trait::async_trait;
    use std::time::Duration;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            initial_interval: Duration::from_millis(10),
            multiplier: 2.0,
            max_interval: Duration::from_millis(40),
            max_elapsed_time: Duration::from_secs(5),
        }
    }

    fn settings(broker: &InMemoryBroker) -> WorkerSettings {
        WorkerSettings {
            broker: Arc::new(broker.clone()),
            address: "memory://test".into(),
            tasks: Topology::queue("tasks"),
            reply: Topology::queue("results"),
            publisher_backoff: policy(),
            consumer_backoff: policy(),
        }
    }

    fn client(broker: &InMemoryBroker) -> (Publisher, Consumer) {
        let publisher = Publisher::new(
            ConnectionManager::new(Arc::new(broker.clone()), "memory://client", Role::Publisher),
            policy(),
        );
        let consumer = Consumer::new(
            ConnectionManager::new(Arc::new(broker.clone()), "memory://client", Role::Consumer),
            policy(),
            Topology::queue("results"),
        );
        (publisher, consumer)
    }

    struct FailingHandler;

    #[async_trait]
    impl TaskHandler for FailingHandler {
        async fn handle(&self, _envelope: &TaskEnvelope) -> Result<Vec<u8>, HandlerError> {
            Err(HandlerError("boom".into()))
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn replies_with_the_same_task_id_then_acks() {
        let broker = InMemoryBroker::new();
        let group = WorkerGroup::spawn(2, &settings(&broker), Arc::new(EchoHandler));
        let (publisher, consumer) = client(&broker);
        let mut replies = consumer.subscribe().await.unwrap();

        let task = TaskEnvelope::new(crate::domain::TaskId::random(), b"ping".to_vec());
        publisher
            .send(&Topology::queue("tasks"), &task.encode().unwrap())
            .await
            .unwrap();

        let reply = replies.next().await.unwrap();
        let decoded = TaskEnvelope::decode(reply.body()).unwrap();
        assert_eq!(decoded, task);

        wait_until(|| broker.stats().acked >= 1).await;
        assert_eq!(broker.unsettled_count("tasks"), Some(0));
        assert_eq!(broker.queue_depth("tasks"), Some(0));

        group.shutdown_and_join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_tasks_are_rejected_without_requeue() {
        let broker = InMemoryBroker::new();
        let group = WorkerGroup::spawn(1, &settings(&broker), Arc::new(EchoHandler));
        let (publisher, _) = client(&broker);

        publisher
            .send(&Topology::queue("tasks"), b"not json")
            .await
            .unwrap();

        wait_until(|| broker.stats().rejected == 1).await;
        assert_eq!(broker.queue_depth("tasks"), Some(0));
        assert_eq!(broker.queue_depth("results"), Some(0));

        group.shutdown_and_join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn handler_failures_produce_no_reply() {
        let broker = InMemoryBroker::new();
        let group = WorkerGroup::spawn(1, &settings(&broker), Arc::new(FailingHandler));
        let (publisher, _) = client(&broker);

        let task = TaskEnvelope::new(crate::domain::TaskId::random(), b"x".to_vec());
        publisher
            .send(&Topology::queue("tasks"), &task.encode().unwrap())
            .await
            .unwrap();

        wait_until(|| broker.stats().rejected == 1).await;
        assert_eq!(broker.queue_depth("results"), Some(0));
        assert_eq!(broker.queue_depth("tasks"), Some(0));

        group.shutdown_and_join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_worker_connections() {
        let broker = InMemoryBroker::new();
        let group = WorkerGroup::spawn(3, &settings(&broker), Arc::new(EchoHandler));
        assert_eq!(group.len(), 3);

        wait_until(|| broker.consumer_count("tasks") == Some(3)).await;
        group.shutdown_and_join().await;

        assert_eq!(broker.open_connections(), 0);
    }
}
