//! Impls - in-process implementations of the ports.
//!
//! - **InMemoryBroker**: broker with queues, fanout exchanges, explicit acks
//!   and fault injection, used by tests and the CLI demo
//! - **EchoHandler**: handler that answers with the task payload
//!
//! Production adapters (an AMQP client wrapper, for one) live outside this
//! crate and implement the same traits.

pub mod echo;
pub mod inmem_broker;

pub use self::echo::EchoHandler;
pub use self::inmem_broker::{BrokerStats, InMemoryBroker};
