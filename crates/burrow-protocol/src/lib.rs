//! # burrow-protocol
//!
//! Wire format shared by every Burrow publisher and consumer.
//!
//! A published message is made of two parts:
//!
//! - **Envelope** - the JSON body `{ "event": ..., "payload": ... }`
//! - **Routing key** - `"<exchange>:<event>"`, carried out-of-band in the
//!   AMQP `type` property so deliveries can be demultiplexed without
//!   decoding the body
//!
//! ## Example
//!
//! ```rust
//! use burrow_protocol::{codec, Envelope, RoutingKey};
//!
//! let key = RoutingKey::new("billing", "invoice.paid");
//! assert_eq!(key.to_string(), "billing:invoice.paid");
//!
//! let envelope = Envelope::new("invoice.paid", b"{\"id\":42}".to_vec());
//! let body = codec::encode(&envelope).unwrap();
//! let decoded = codec::decode(&body).unwrap();
//! assert_eq!(decoded, envelope);
//! ```

pub mod codec;
pub mod envelope;
pub mod headers;

pub use codec::{decode, encode, ProtocolError};
pub use envelope::{Envelope, RoutingKey};
pub use headers::{HeaderMap, HeaderValue};
