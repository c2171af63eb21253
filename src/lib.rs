//! hostbridge - event bridge between an audio host and an external script
//!
//! Host observers fire on arbitrary threads; the bridge funnels them through
//! ordered queues and delivers them to the registered consumer once per tick.

pub mod bridge;
pub mod config;
pub mod consumer;
pub mod error;
pub mod gateway;
pub mod host;
pub mod midi;
pub mod supervisor;

pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use consumer::Consumer;
pub use error::{BridgeError, HostError};
