//! BridgeBuilder - ルーターとワーカー群の構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターン（`new().config().handler().build()`）
//! - 起動時検証（Fail-fast 設計）: 接続前に `InvalidConfig` を返す
//! - 不正な設定はリトライキャンペーンにならない

use std::sync::Arc;

use crate::app::connection::ConnectionManager;
use crate::app::consumer::Consumer;
use crate::app::publisher::Publisher;
use crate::app::router::Router;
use crate::app::worker_loop::{WorkerGroup, WorkerSettings};
use crate::config::BridgeConfig;
use crate::domain::{BridgeError, Role};
use crate::ports::{Broker, TaskHandler};

/// # Example
/// ```ignore
/// let bridge = BridgeBuilder::new(Arc::new(InMemoryBroker::new()))
///     .config(config)
///     .handler(Arc::new(EchoHandler))
///     .build()?;
/// let reply = bridge.router().submit_with_default_timeout(task).await?;
/// bridge.shutdown().await;
/// ```
pub struct BridgeBuilder {
    broker: Arc<dyn Broker>,
    config: BridgeConfig,
    handler: Option<Arc<dyn TaskHandler>>,
}

impl BridgeBuilder {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            config: BridgeConfig::default(),
            handler: None,
        }
    }

    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    /// Run `workers` in-process workers with this handler. Without one, only
    /// the router is started and tasks are left for external workers.
    pub fn handler(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Validate the config, start the router and, if a handler was given,
    /// the worker group. Must be called from within a tokio runtime.
    pub fn build(self) -> Result<Bridge, BridgeError> {
        self.config.validate()?;
        let config = self.config;

        let workers = self.handler.map(|handler| {
            let settings = WorkerSettings {
                broker: self.broker.clone(),
                address: config.address.clone(),
                tasks: config.tasks(),
                reply: config.reply.clone(),
                publisher_backoff: config.publisher_policy(),
                consumer_backoff: config.consumer_policy(),
            };
            WorkerGroup::spawn(config.workers, &settings, handler)
        });

        let publisher = Publisher::new(
            ConnectionManager::new(self.broker.clone(), &config.address, Role::Publisher),
            config.publisher_policy(),
        );
        let consumer = Consumer::new(
            ConnectionManager::new(self.broker.clone(), &config.address, Role::Consumer),
            config.consumer_policy(),
            config.reply.clone(),
        );
        let router = Router::start(publisher, consumer, config.tasks(), config.request_timeout());

        Ok(Bridge { router, workers })
    }
}

/// A running router plus its optional worker group.
pub struct Bridge {
    router: Router,
    workers: Option<WorkerGroup>,
}

impl Bridge {
    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn worker_count(&self) -> usize {
        self.workers.as_ref().map_or(0, WorkerGroup::len)
    }

    /// Router first, so pending callers get `RouterClosed` promptly.
    pub async fn shutdown(self) {
        self.router.shutdown().await;
        if let Some(workers) = self.workers {
            workers.shutdown_and_join().await;
        }
    }
}
