//! livedebug: debug a live server by forking a private copy of it.
//!
//! The copy gets its own ports, a script-debugging connection and a replay
//! target, all driven by a remote controller over a persistent channel.

pub mod bridge;
pub mod bus;
pub mod callback;
pub mod channel;
pub mod config;
pub mod criteria;
pub mod error;
pub mod fork;
pub mod id;
pub mod inspector;
pub mod logging;
pub mod orchestrator;
pub mod ports;
pub mod protocol;
pub mod registry;
pub mod remap;
pub mod replay;
pub mod storage;

pub use error::RpcError;
pub use orchestrator::Orchestrator;
