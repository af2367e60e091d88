//! Message bus abstractions
//!
//! The dispatch layer talks to the bus only through [`Publisher`] and
//! [`Broker`], and receives deliveries through [`MessageHandler`]. The AMQP
//! implementation lives behind the `amqp` feature.

use async_trait::async_trait;
use rcd_config::PublishRoute;
use std::sync::Arc;

pub mod error;
pub mod state;

#[cfg(feature = "amqp")]
pub mod connection;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use error::{FaultClass, QueueError};
pub use state::{ConnectionEvent, ConnectionState};

pub type Result<T> = std::result::Result<T, QueueError>;

/// Sends JSON documents to a publish route
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Best-effort publish. Transport faults are logged by the implementation
    /// and never reach the caller.
    async fn publish(&self, body: &serde_json::Value, destination: &PublishRoute);
}

/// Receives raw delivery bodies from the consume loop
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one delivery. Failures are handled and logged inside.
    async fn handle(&self, body: Vec<u8>);

    /// Called once during shutdown, after the bus is stopped
    async fn stop_handler(&self);
}

/// A bus that can also consume
#[async_trait]
pub trait Broker: Publisher {
    /// Consume the configured route, handing every delivery to `handler`,
    /// until shutdown is requested
    async fn consume(&self, handler: Arc<dyn MessageHandler>) -> Result<()>;

    /// Close the bus. Idempotent; later publishes are dropped.
    async fn stop(&self);
}
