//! RPC gateway
//!
//! A gateway binds the bridge's RPC entry point to a local port the script
//! connects to. Binding retries across ports until one succeeds or the attempt
//! budget runs out.

pub mod protocol;
pub mod tcp;

use async_trait::async_trait;
use rand::Rng;
use tracing::{info, warn};

use crate::error::BridgeError;

pub use tcp::TcpGateway;

/// Lowest port of the IANA dynamic range
pub const EPHEMERAL_PORT_MIN: u16 = 49152;

/// Something that can expose the bridge on a port
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn bind(&self, port: u16) -> anyhow::Result<Box<dyn GatewayBinding>>;
}

/// A live binding; stays up until `shutdown`
#[async_trait]
pub trait GatewayBinding: Send + Sync {
    /// Port the binding actually listens on
    fn port(&self) -> u16;

    async fn shutdown(self: Box<Self>);
}

/// How each bind attempt picks its port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortStrategy {
    /// `start`, `start + 1`, ...
    Sequential { start: u16 },
    /// Uniform in the ephemeral range
    Random,
}

impl PortStrategy {
    /// Port for a zero-based attempt, None once the range is exhausted
    pub fn port_for(&self, attempt: u32) -> Option<u16> {
        match *self {
            PortStrategy::Sequential { start } => {
                u16::try_from(attempt).ok().and_then(|a| start.checked_add(a))
            }
            PortStrategy::Random => Some(rand::thread_rng().gen_range(EPHEMERAL_PORT_MIN..=u16::MAX)),
        }
    }
}

/// A successful bind and how many attempts failed before it
pub struct BoundGateway {
    binding: Box<dyn GatewayBinding>,
    retries: u32,
}

impl BoundGateway {
    pub fn port(&self) -> u16 {
        self.binding.port()
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub async fn shutdown(self) {
        let port = self.binding.port();
        self.binding.shutdown().await;
        info!(port, "RPC gateway shut down");
    }
}

/// Bind, moving to the next port on failure, up to `attempts` tries
pub async fn bind_with_retry(
    gateway: &dyn Gateway,
    strategy: PortStrategy,
    attempts: u32,
) -> Result<BoundGateway, BridgeError> {
    let mut last_port = 0;
    let mut last_error = None;

    for attempt in 0..attempts {
        let Some(port) = strategy.port_for(attempt) else {
            break;
        };
        last_port = port;

        match gateway.bind(port).await {
            Ok(binding) => {
                info!(port = binding.port(), retries = attempt, "RPC gateway bound");
                return Ok(BoundGateway {
                    binding,
                    retries: attempt,
                });
            }
            Err(e) => {
                warn!(
                    port,
                    attempt = attempt + 1,
                    attempts,
                    "Gateway bind failed, retrying: {:#}",
                    e
                );
                last_error = Some(e);
            }
        }
    }

    Err(BridgeError::BindExhausted {
        attempts,
        last_port,
        source: last_error.unwrap_or_else(|| anyhow::anyhow!("no port left to try")),
    })
}
