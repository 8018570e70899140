//! Publish and subscribe options.

use burrow_protocol::{HeaderMap, HeaderValue};

/// Options for [`Broker::publish`](crate::Broker::publish).
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Headers merged into the message.
    pub headers: HeaderMap,
}

impl PublishOptions {
    /// Add a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Options for [`Broker::subscribe`](crate::Broker::subscribe).
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Header filter, passed to the broker as binding arguments.
    pub headers: HeaderMap,
    /// Declare the queue durable.
    pub durable_queue: bool,
    /// Let the broker settle deliveries on send. Handlers must call
    /// [`Delivery::ack`](crate::Delivery::ack) themselves when this is off.
    pub auto_ack: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            headers: HeaderMap::new(),
            durable_queue: false,
            auto_ack: true,
        }
    }
}

impl SubscribeOptions {
    /// Options for a consumer that settles deliveries itself.
    #[must_use]
    pub fn manual_ack() -> Self {
        Self {
            auto_ack: false,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_defaults_to_auto_ack() {
        let options = SubscribeOptions::default();
        assert!(options.auto_ack);
        assert!(!options.durable_queue);
        assert!(!SubscribeOptions::manual_ack().auto_ack);
    }

    #[test]
    fn test_publish_header_builder() {
        let options = PublishOptions::default()
            .header("tenant", "acme")
            .header("attempt", 2i64);
        assert_eq!(options.headers["tenant"], HeaderValue::String("acme".into()));
        assert_eq!(options.headers["attempt"], HeaderValue::Int(2));
    }
}
