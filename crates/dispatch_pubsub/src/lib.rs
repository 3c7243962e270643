#![forbid(unsafe_code)]

pub mod broker;
pub mod lease;
pub mod memory;
pub mod redis_transport;
pub mod settings;
pub mod transport;

pub use broker::EventBroker;
pub use lease::{LeaseStore, MemoryLeaseStore, RedisLeaseStore};
pub use memory::MemoryTransport;
pub use redis_transport::RedisTransport;
pub use settings::{BrokerSettings, FileBrokerSettings};
pub use transport::PubSubTransport;


#[cfg(test)]
mod lease_tests;
