//! Domain model: ids, tasks and their wire envelope, deliveries, topology,
//! connection state and the error taxonomy.

pub mod delivery;
pub mod errors;
pub mod ids;
pub mod state;
pub mod task;
pub mod topology;

pub use self::delivery::{AckHandle, Delivery};
pub use self::errors::{BridgeError, ErrorKind};
pub use self::ids::TaskId;
pub use self::state::{ConnectionState, Role};
pub use self::task::{CONTENT_TYPE_JSON, Task, TaskEnvelope};
pub use self::topology::{DEFAULT_EXCHANGE, Topology};
