//! Envelope and routing key types.
//!
//! The envelope is the message body; the routing key travels next to it as
//! the message type label.

use bytes::Bytes;
use std::fmt;
use std::str::FromStr;

use crate::codec::ProtocolError;

/// Separator between the exchange and event parts of a routing key.
pub const ROUTING_KEY_SEPARATOR: char = ':';

/// Binding key used for every publish and every queue binding.
///
/// Demultiplexing happens on the routing key label, not on the AMQP
/// routing key, so all traffic on an exchange shares one binding.
pub const WILDCARD_BINDING_KEY: &str = "*";

/// A routing key identifying who receives a message.
///
/// The canonical string form is `"<exchange>:<event>"`. The exchange part
/// must not contain `:`; the event part may.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutingKey {
    exchange: String,
    event: String,
}

impl RoutingKey {
    /// Create a routing key from its parts.
    #[must_use]
    pub fn new(exchange: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            event: event.into(),
        }
    }

    /// The exchange part.
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// The event part.
    #[must_use]
    pub fn event(&self) -> &str {
        &self.event
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.exchange, ROUTING_KEY_SEPARATOR, self.event)
    }
}

impl FromStr for RoutingKey {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(ROUTING_KEY_SEPARATOR) {
            Some((exchange, event)) => Ok(Self::new(exchange, event)),
            None => Err(ProtocolError::InvalidRoutingKey(s.to_string())),
        }
    }
}

/// The unit of application data sent through the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Event name.
    pub event: String,
    /// Opaque payload bytes.
    pub payload: Bytes,
}

impl Envelope {
    /// Create a new envelope.
    #[must_use]
    pub fn new(event: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            event: event.into(),
            payload: payload.into(),
        }
    }

    /// Get the payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_key_display() {
        let key = RoutingKey::new("orders", "created");
        assert_eq!(key.to_string(), "orders:created");
        assert_eq!(key.exchange(), "orders");
        assert_eq!(key.event(), "created");
    }

    #[test]
    fn test_routing_key_parse() {
        let key: RoutingKey = "orders:created".parse().unwrap();
        assert_eq!(key, RoutingKey::new("orders", "created"));

        // Only the first separator splits
        let key: RoutingKey = "orders:item:added".parse().unwrap();
        assert_eq!(key.exchange(), "orders");
        assert_eq!(key.event(), "item:added");

        assert!(matches!(
            "no-separator".parse::<RoutingKey>(),
            Err(ProtocolError::InvalidRoutingKey(_))
        ));
    }

    #[test]
    fn test_routing_key_empty_parts() {
        let key: RoutingKey = ":ping".parse().unwrap();
        assert_eq!(key.exchange(), "");
        assert_eq!(key.to_string(), ":ping");
    }

    #[test]
    fn test_envelope_creation() {
        let envelope = Envelope::new("created", b"abc".to_vec());
        assert_eq!(envelope.event, "created");
        assert_eq!(&envelope.payload[..], b"abc");
        assert_eq!(envelope.payload_size(), 3);
    }
}
