//! Deliveries handed to handlers.
//!
//! A [`Delivery`] is the explicit acknowledgement capability: it carries the
//! decoded payload together with a one-shot settlement handle. Deliveries
//! from an auto-ack subscription (and deliveries built by hand) have no
//! handle, so settling them is an error rather than a silent no-op.

use burrow_protocol::RoutingKey;
use burrow_transport::Acker;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::BrokerError;

struct Settlement {
    acker: Arc<dyn Acker>,
    settled: AtomicBool,
}

impl Settlement {
    fn claim(&self) -> Result<&Arc<dyn Acker>, BrokerError> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Err(BrokerError::AlreadySettled);
        }
        Ok(&self.acker)
    }
}

/// A message delivered to a handler.
///
/// Clones share the settlement handle, so a delivery fanned out to several
/// handlers is still settled at most once.
#[derive(Clone)]
pub struct Delivery {
    routing_key: RoutingKey,
    payload: Bytes,
    headers: Arc<HashMap<String, String>>,
    redelivered: bool,
    settlement: Option<Arc<Settlement>>,
}

impl Delivery {
    /// Create a delivery with no settlement handle.
    #[must_use]
    pub fn new(routing_key: RoutingKey, payload: impl Into<Bytes>) -> Self {
        Self {
            routing_key,
            payload: payload.into(),
            headers: Arc::new(HashMap::new()),
            redelivered: false,
            settlement: None,
        }
    }

    /// Attach headers.
    #[must_use]
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = Arc::new(headers);
        self
    }

    pub(crate) fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub(crate) fn with_acker(mut self, acker: Option<Arc<dyn Acker>>) -> Self {
        self.settlement = acker.map(|acker| {
            Arc::new(Settlement {
                acker,
                settled: AtomicBool::new(false),
            })
        });
        self
    }

    /// Get the routing key.
    #[must_use]
    pub fn routing_key(&self) -> &RoutingKey {
        &self.routing_key
    }

    /// Get the event name.
    #[must_use]
    pub fn event(&self) -> &str {
        self.routing_key.event()
    }

    /// Get the payload.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Get the headers. Non-string header values read as `""`.
    #[must_use]
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Get a single header.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Whether the broker delivered this message before.
    #[must_use]
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Whether this delivery can be acknowledged or rejected.
    #[must_use]
    pub fn is_settleable(&self) -> bool {
        self.settlement.is_some()
    }

    /// Whether this delivery has already been acknowledged or rejected.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.settlement
            .as_ref()
            .is_some_and(|s| s.settled.load(Ordering::Acquire))
    }

    /// Acknowledge the delivery.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::NotAcknowledged`] if the delivery carries no
    /// handle, [`BrokerError::AlreadySettled`] on a second settlement, or a
    /// transport error.
    pub async fn ack(&self) -> Result<(), BrokerError> {
        let settlement = self
            .settlement
            .as_ref()
            .ok_or(BrokerError::NotAcknowledged)?;
        settlement
            .claim()?
            .ack()
            .await
            .map_err(BrokerError::transport("basic.ack"))
    }

    /// Reject the delivery without requeueing it.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::NotRejected`] if the delivery carries no
    /// handle, [`BrokerError::AlreadySettled`] on a second settlement, or a
    /// transport error.
    pub async fn reject(&self) -> Result<(), BrokerError> {
        self.settle_negative(false).await
    }

    /// Reject the delivery and ask the broker to requeue it.
    ///
    /// # Errors
    ///
    /// Same as [`Delivery::reject`].
    pub async fn reject_and_requeue(&self) -> Result<(), BrokerError> {
        self.settle_negative(true).await
    }

    async fn settle_negative(&self, requeue: bool) -> Result<(), BrokerError> {
        let settlement = self.settlement.as_ref().ok_or(BrokerError::NotRejected)?;
        settlement
            .claim()?
            .reject(requeue)
            .await
            .map_err(BrokerError::transport("basic.reject"))
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("payload_len", &self.payload.len())
            .field("headers", &self.headers)
            .field("redelivered", &self.redelivered)
            .field("settleable", &self.is_settleable())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use burrow_transport::TransportError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingAcker {
        calls: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl Acker for RecordingAcker {
        async fn ack(&self) -> Result<(), TransportError> {
            self.calls.lock().unwrap().push("ack");
            Ok(())
        }

        async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
            self.calls
                .lock()
                .unwrap()
                .push(if requeue { "requeue" } else { "reject" });
            Ok(())
        }
    }

    fn key() -> RoutingKey {
        RoutingKey::new("svc", "created")
    }

    #[tokio::test]
    async fn test_without_handle_is_an_error() {
        let delivery = Delivery::new(key(), "abc");
        assert!(!delivery.is_settleable());
        assert!(matches!(delivery.ack().await, Err(BrokerError::NotAcknowledged)));
        assert!(matches!(delivery.reject().await, Err(BrokerError::NotRejected)));
        assert!(matches!(
            delivery.reject_and_requeue().await,
            Err(BrokerError::NotRejected)
        ));
        assert!(!delivery.is_settled());
    }

    #[tokio::test]
    async fn test_settles_once_across_clones() {
        let acker = Arc::new(RecordingAcker::default());
        let delivery =
            Delivery::new(key(), "abc").with_acker(Some(acker.clone() as Arc<dyn Acker>));
        let copy = delivery.clone();

        delivery.reject_and_requeue().await.unwrap();
        assert!(copy.is_settled());
        assert!(matches!(copy.ack().await, Err(BrokerError::AlreadySettled)));
        assert_eq!(*acker.calls.lock().unwrap(), vec!["requeue"]);
    }

    #[test]
    fn test_accessors() {
        let mut headers = HashMap::new();
        headers.insert("tenant".to_string(), "acme".to_string());
        let delivery = Delivery::new(key(), "abc").with_headers(headers);

        assert_eq!(delivery.event(), "created");
        assert_eq!(delivery.routing_key().to_string(), "svc:created");
        assert_eq!(&delivery.payload()[..], b"abc");
        assert_eq!(delivery.header("tenant"), Some("acme"));
        assert_eq!(delivery.header("missing"), None);
        assert!(!delivery.redelivered());
    }
}
