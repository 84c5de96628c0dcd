//! App - the bridge itself, built on top of the ports.
//!
//! # Components
//! - **ConnectionManager**: one connection + channel per role, loss signalling
//! - **Publisher** / **Consumer**: send and subscribe under a backoff campaign
//! - **Router**: per-task request/reply correlation over a shared reply stream
//! - **WorkerLoop** / **WorkerGroup**: the responding side
//! - **BridgeBuilder**: wiring from a [`crate::config::BridgeConfig`]

pub mod builder;
pub mod connection;
pub mod consumer;
pub mod pending;
pub mod publisher;
pub mod router;
pub mod worker_loop;

pub use self::builder::{Bridge, BridgeBuilder};
pub use self::connection::{ConnectionManager, ConnectionStatus, Link};
pub use self::consumer::{Consumer, Subscription};
pub use self::pending::PendingTable;
pub use self::publisher::Publisher;
pub use self::router::Router;
pub use self::worker_loop::{WorkerGroup, WorkerLoop, WorkerSettings};
