//! conduit-core
//!
//! Resilient broker bridge with request/reply correlation.
//!
//! # Modules
//! - **domain**: task ids, tasks and their wire envelope, deliveries, topology,
//!   connection state, errors
//! - **ports**: the broker client surface, clock, id generation, task handlers
//! - **backoff**: exponential backoff campaigns shared by both roles
//! - **app**: connection manager, publisher, consumer, router, worker loop
//! - **impls**: in-process broker and reference handler
//! - **config**: TOML configuration
//!
//! The crate only emits `tracing` events; installing a subscriber is up to
//! the binary.

pub mod app;
pub mod backoff;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;

pub use self::app::{Bridge, BridgeBuilder, Consumer, Publisher, Router};
pub use self::backoff::{Backoff, BackoffPolicy, BackoffSettings};
pub use self::config::{BridgeConfig, ConfigError};
pub use self::domain::{BridgeError, Delivery, ErrorKind, Task, TaskEnvelope, TaskId, Topology};
