//! Message pump: receive on any subscribed topic, republish to the relay topic

pub mod pool;
pub mod work;

pub use pool::WorkerPool;
pub use work::{RelaySettings, SendPolicy, WorkItem, WorkState};
