//! The routing core: retained-message store, subscriber registry and the
//! `Broker` that ties them together.

pub mod engine;
pub mod registry;
pub mod topic;

pub use engine::Broker;
pub use registry::{FanOut, SubscriberRegistry};
pub use topic::TopicStore;
