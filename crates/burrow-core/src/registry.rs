//! Handler registry.
//!
//! Maps routing keys to the ordered list of handlers interested in them. The
//! registry is shared between callers registering handlers and every consumer
//! task dispatching deliveries, so it lives in a sharded `DashMap`; each
//! shard lock is held only while a list is mutated or cloned.

use async_trait::async_trait;
use burrow_protocol::RoutingKey;
use dashmap::DashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

use crate::delivery::Delivery;

/// Something that processes deliveries.
///
/// Implemented for every `Fn(Delivery) -> impl Future<Output = ()>`, so
/// plain async closures can be registered directly.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Process one delivery.
    async fn handle(&self, delivery: Delivery);
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, delivery: Delivery) {
        (self)(delivery).await;
    }
}

/// Identifies one registration; stays valid regardless of other
/// registrations coming and going under the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerToken(u64);

type Entry = (HandlerToken, Arc<dyn Handler>);

/// Routing key to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Vec<Entry>>,
    next_token: AtomicU64,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("routing_keys", &self.handlers.len())
            .finish()
    }
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler for `key`.
    pub fn register(&self, key: &RoutingKey, handler: Arc<dyn Handler>) -> HandlerToken {
        let token = HandlerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let mut entry = self.handlers.entry(key.to_string()).or_default();
        entry.push((token, handler));
        trace!(routing_key = %key, handlers = entry.len(), "Registered handler");
        token
    }

    /// Remove the handler registered under `token`.
    ///
    /// Returns `true` if it was still registered.
    pub fn unregister(&self, key: &RoutingKey, token: HandlerToken) -> bool {
        let key = key.to_string();
        let removed = match self.handlers.get_mut(&key) {
            Some(mut entry) => {
                let before = entry.len();
                entry.retain(|(t, _)| *t != token);
                entry.len() != before
            }
            None => false,
        };
        self.handlers.remove_if(&key, |_, list| list.is_empty());
        removed
    }

    /// Snapshot of the handlers for a routing key, in registration order.
    #[must_use]
    pub fn handlers(&self, key: &str) -> Vec<Arc<dyn Handler>> {
        self.handlers
            .get(key)
            .map(|entry| entry.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    /// Number of handlers registered for a routing key.
    #[must_use]
    pub fn handler_count(&self, key: &str) -> usize {
        self.handlers.get(key).map(|e| e.len()).unwrap_or(0)
    }

    /// Number of routing keys with at least one handler.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Check if no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
