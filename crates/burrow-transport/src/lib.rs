//! # burrow-transport
//!
//! Transport abstraction layer for Burrow.
//!
//! The core never speaks AMQP itself. It drives a [`Channel`] obtained from a
//! [`Connector`], and every transport implements those traits:
//!
//! - **amqp** - RabbitMQ through `lapin` (default feature)
//! - **memory** - an in-process broker with the same exchange, queue and
//!   acknowledgement semantics, used by tests and local development
//!
//! ```rust,ignore
//! use burrow_transport::{Channel, ConnectParams, Connector};
//!
//! async fn declare(connector: &dyn Connector) -> Result<(), burrow_transport::TransportError> {
//!     let channel = connector.connect("amqp://127.0.0.1:5672/%2f", &ConnectParams::default()).await?;
//!     channel.declare_exchange("billing", true).await?;
//!     Ok(())
//! }
//! ```

pub mod memory;
pub mod tls;
pub mod traits;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use memory::{MemoryBroker, MemoryConnector};
pub use tls::TlsIdentity;
pub use traits::{
    Acker, Channel, ConnectParams, Connector, DeliveryStream, InboundMessage, OutboundMessage,
    QueueOptions, TransportError,
};

#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
