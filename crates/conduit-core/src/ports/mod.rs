//! Ports - the seams between the bridge and the outside world.
//!
//! Each trait hides one external system: the message broker, the clock, id
//! minting, and the work a worker performs. `impls` holds in-process
//! implementations; production adapters live outside this crate.

pub mod broker;
pub mod clock;
pub mod handler;
pub mod id_generator;

pub use self::broker::{
    Acknowledger, Broker, BrokerChannel, BrokerConnection, BrokerError, DeliveryStream,
    ExchangeKind, Publishing, QueueOptions,
};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::handler::{HandlerError, TaskHandler};
pub use self::id_generator::{IdGenerator, UlidGenerator};
