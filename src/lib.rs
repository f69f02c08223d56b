//! HubMQ - MQTT v3.1/v3.1.1 broker
//!
//! The crate is layered bottom-up: [`protocol`] types and the [`codec`],
//! the [`topic`] index with retained messages, per-client [`session`]
//! state with its bounded outbound queue, the [`store`] and [`auth`]
//! collaborator traits, and the [`broker`] that ties them to TCP.

pub mod auth;
pub mod broker;
pub mod codec;
pub mod config;
pub mod protocol;
pub mod session;
pub mod store;
pub mod topic;

pub use auth::{AllowAll, Authenticator, StaticAuth};
pub use broker::{Broker, BrokerConfig, BrokerEvent};
pub use config::Config;
pub use protocol::{ProtocolVersion, QoS};
pub use store::{MemoryStore, SessionStore};
