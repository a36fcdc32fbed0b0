pub mod backend;
pub mod manager;
pub mod memory;
pub mod message;
pub mod streams;
pub mod topology;

pub use backend::Broker;
pub use manager::{Disposition, MessageHandler, TopologyManager};
pub use memory::MemoryBroker;
pub use message::{Delivery, Envelope, PublishProperties};
pub use streams::RedisBroker;
pub use topology::Topology;
