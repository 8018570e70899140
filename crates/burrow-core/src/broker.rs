//! Broker facade.
//!
//! Ties the [`ConnectionManager`] and the [`HandlerRegistry`] together and
//! owns every consumer task it spawns.

use burrow_protocol::envelope::WILDCARD_BINDING_KEY;
use burrow_protocol::{codec, Envelope, HeaderMap, RoutingKey};
use burrow_transport::{Channel, Connector, OutboundMessage, QueueOptions};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::connection::{ConnectionManager, ConnectionSettings};
use crate::consumer::{Consumer, ConsumerState, Dispatcher};
use crate::delivery::Delivery;
use crate::error::BrokerError;
use crate::options::{PublishOptions, SubscribeOptions};
use crate::probe;
use crate::registry::{Handler, HandlerRegistry, HandlerToken};

/// Pub/sub facade over one broker connection.
pub struct Broker {
    connection: ConnectionManager,
    registry: Arc<HandlerRegistry>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_consumer: AtomicU64,
}

impl Broker {
    /// Create a broker; call [`connect`](Self::connect) before use.
    #[must_use]
    pub fn new(settings: ConnectionSettings, connector: Arc<dyn Connector>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            connection: ConnectionManager::new(settings, connector),
            registry: Arc::new(HandlerRegistry::new()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            next_consumer: AtomicU64::new(1),
        }
    }

    /// Get the handler registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Get the connection manager.
    #[must_use]
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Open the broker connection. See [`ConnectionManager::connect`].
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect(&self) -> Result<(), BrokerError> {
        self.connection.connect().await
    }

    /// Publish `payload` as `event` on `exchange`.
    ///
    /// The routing key `"<exchange>:<event>"` travels as the message type
    /// label; the message itself is published with the wildcard key.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be encoded, the broker is not
    /// connected, or the write fails.
    pub async fn publish(
        &self,
        exchange: &str,
        event: &str,
        payload: impl Into<Bytes>,
        options: Option<PublishOptions>,
    ) -> Result<(), BrokerError> {
        let options = options.unwrap_or_default();
        let key = RoutingKey::new(exchange, event);
        let body = codec::encode(&Envelope::new(event, payload))?;
        let size = body.len();

        let channel = self.connection.channel()?;
        let message = OutboundMessage {
            body,
            kind: Some(key.to_string()),
            headers: options.headers,
            ..Default::default()
        };

        channel
            .publish(exchange, WILDCARD_BINDING_KEY, message)
            .await
            .map_err(BrokerError::transport("basic.publish"))?;

        trace!(routing_key = %key, size, "Published message");
        Ok(())
    }

    /// Subscribe `handler` to `event` on `exchange`, consuming from `queue`.
    ///
    /// Declares the exchange and queue, binds them with the header filter as
    /// binding arguments and starts a consumer task. If any step fails the
    /// handler is unregistered again.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::NotConnected`] if not connected, or the
    /// transport error of the failed step.
    pub async fn subscribe<H: Handler>(
        &self,
        exchange: &str,
        queue: &str,
        event: &str,
        handler: H,
        options: Option<SubscribeOptions>,
    ) -> Result<Subscription, BrokerError> {
        let channel = self.connection.channel()?;
        let options = options.unwrap_or_default();
        let key = RoutingKey::new(exchange, event);

        let token = self.registry.register(&key, Arc::new(handler));
        match self.start_consumer(channel, &key, queue, &options).await {
            Ok(parts) => {
                debug!(routing_key = %key, queue = %parts.queue, "Subscribed");
                Ok(Subscription {
                    routing_key: key,
                    queue: parts.queue,
                    durable: options.durable_queue,
                    headers: options.headers,
                    token,
                    registry: Arc::clone(&self.registry),
                    stop: parts.stop,
                    state: parts.state,
                })
            }
            Err(e) => {
                self.registry.unregister(&key, token);
                warn!(routing_key = %key, queue = %queue, error = %e, "Subscribe failed");
                Err(e)
            }
        }
    }

    async fn start_consumer(
        &self,
        channel: Arc<dyn Channel>,
        key: &RoutingKey,
        queue: &str,
        options: &SubscribeOptions,
    ) -> Result<ConsumerParts, BrokerError> {
        // Exchanges other than the configured default are service exchanges,
        // which are durable.
        let configured = &self.connection.settings().exchange;
        let durable_exchange = configured.name != key.exchange() || configured.durable;
        channel
            .declare_exchange(key.exchange(), durable_exchange)
            .await
            .map_err(BrokerError::transport("exchange.declare"))?;

        let queue_options = QueueOptions {
            durable: options.durable_queue,
            ..Default::default()
        };
        let queue = channel
            .declare_queue(queue, queue_options)
            .await
            .map_err(BrokerError::transport("queue.declare"))?;

        channel
            .bind_queue(&queue, key.exchange(), WILDCARD_BINDING_KEY, &options.headers)
            .await
            .map_err(BrokerError::transport("queue.bind"))?;

        let tag = format!(
            "burrow-{}-{}",
            std::process::id(),
            self.next_consumer.fetch_add(1, Ordering::Relaxed)
        );
        let stream = channel
            .consume(&queue, &tag, options.auto_ack)
            .await
            .map_err(BrokerError::transport("basic.consume"))?;

        let (stop, stop_rx) = watch::channel(false);
        let (state_tx, state) = watch::channel(ConsumerState::Consuming);

        let consumer = Consumer {
            dispatcher: Dispatcher {
                routing_key: key.clone(),
                queue: queue.clone(),
                tag,
                auto_ack: options.auto_ack,
                channel,
                registry: Arc::clone(&self.registry),
            },
            stream,
            stop: stop_rx,
            shutdown: self.shutdown.subscribe(),
            state: state_tx,
        };

        let handle = tokio::spawn(async move {
            consumer.run().await;
        });

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);

        Ok(ConsumerParts {
            queue,
            stop: Arc::new(stop),
            state,
        })
    }

    /// Acknowledge a delivery. See [`Delivery::ack`].
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::NotAcknowledged`] for deliveries without a
    /// settlement handle.
    pub async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        delivery.ack().await
    }

    /// Reject a delivery without requeue. See [`Delivery::reject`].
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::NotRejected`] for deliveries without a
    /// settlement handle.
    pub async fn reject(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        delivery.reject().await
    }

    /// Reject a delivery and requeue it. See [`Delivery::reject_and_requeue`].
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::NotRejected`] for deliveries without a
    /// settlement handle.
    pub async fn reject_and_requeue(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        delivery.reject_and_requeue().await
    }

    /// Check that the connection is usable.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::NotConnected`] otherwise.
    pub fn connected(&self) -> Result<(), BrokerError> {
        self.connection.connected()
    }

    /// Get the live channel for operations the facade does not cover.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::NotConnected`] otherwise.
    pub fn channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        self.connection.channel()
    }

    /// Close the connection and wait for every consumer task to return.
    ///
    /// Handlers that are running are allowed to finish; none is running
    /// once this returns. Must not be awaited from inside a handler.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::NotConnected`] if never connected, or the
    /// error of closing the transport.
    pub async fn disconnect(&self) -> Result<(), BrokerError> {
        let closed = self.connection.close().await;
        if let Err(BrokerError::NotConnected) = closed {
            return closed;
        }

        self.shutdown.send_replace(true);
        let tasks = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *tasks)
        };
        let count = tasks.len();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Consumer task failed");
            }
        }
        self.shutdown.send_replace(false);

        info!(consumers = count, "Broker stopped");
        closed
    }

    /// Run the liveness probe: a self-addressed round trip through the broker.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::NotConnected`] or [`BrokerError::Probe`].
    pub async fn liveness(&self, timeout: Duration) -> Result<Duration, BrokerError> {
        let channel = self.connection.channel()?;
        probe::run(channel, timeout).await
    }
}

struct ConsumerParts {
    queue: String,
    stop: Arc<watch::Sender<bool>>,
    state: watch::Receiver<ConsumerState>,
}

/// A live subscription.
///
/// Dropping the handle does not stop the consumer; call
/// [`unsubscribe`](Self::unsubscribe).
#[derive(Debug, Clone)]
pub struct Subscription {
    routing_key: RoutingKey,
    queue: String,
    durable: bool,
    headers: HeaderMap,
    token: HandlerToken,
    registry: Arc<HandlerRegistry>,
    stop: Arc<watch::Sender<bool>>,
    state: watch::Receiver<ConsumerState>,
}

impl Subscription {
    /// Get the routing key.
    #[must_use]
    pub fn routing_key(&self) -> &RoutingKey {
        &self.routing_key
    }

    /// Get the queue name.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Whether the queue was declared durable.
    #[must_use]
    pub fn durable(&self) -> bool {
        self.durable
    }

    /// Header filter the queue was bound with.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Current consumer state.
    #[must_use]
    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Remove the handler and stop the consumer.
    ///
    /// The handler receives no delivery after this returns. Deliveries the
    /// consumer already holds are still dispatched to the other handlers on
    /// the queue before it stops. Calling it again has no effect.
    pub fn unsubscribe(&self) {
        if self.registry.unregister(&self.routing_key, self.token) {
            debug!(routing_key = %self.routing_key, queue = %self.queue, "Unsubscribed");
        }
        self.stop.send_replace(true);
    }

    /// Wait until the consumer task has returned.
    pub async fn stopped(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == ConsumerState::Stopped).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_protocol::HeaderValue;
    use burrow_transport::MemoryBroker;

    async fn connected_broker(memory: &MemoryBroker) -> Broker {
        let broker = Broker::new(
            ConnectionSettings::new("memory://local", "svc"),
            Arc::new(memory.connector()),
        );
        broker.connect().await.unwrap();
        broker
    }

    #[tokio::test]
    async fn test_not_connected() {
        let memory = MemoryBroker::new();
        let broker = Broker::new(
            ConnectionSettings::new("memory://local", "svc"),
            Arc::new(memory.connector()),
        );

        assert!(matches!(
            broker.publish("svc", "created", "x", None).await,
            Err(BrokerError::NotConnected)
        ));
        assert!(matches!(
            broker
                .subscribe("svc", "q", "created", |_d: Delivery| async {}, None)
                .await,
            Err(BrokerError::NotConnected)
        ));
        assert!(broker.registry().is_empty());
        assert!(matches!(broker.disconnect().await, Err(BrokerError::NotConnected)));
        assert!(matches!(
            broker.liveness(Duration::from_secs(1)).await,
            Err(BrokerError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_publish_sets_type_label_and_headers() {
        let memory = MemoryBroker::new();
        let broker = connected_broker(&memory).await;

        let channel = broker.channel().unwrap();
        channel.declare_queue("tap", QueueOptions::default()).await.unwrap();
        channel.declare_exchange("svc", true).await.unwrap();
        channel
            .bind_queue("tap", "svc", "#", &HeaderMap::new())
            .await
            .unwrap();
        let mut stream = channel.consume("tap", "tap", true).await.unwrap();

        let options = PublishOptions::default().header("tenant", "acme");
        broker
            .publish("svc", "created", "abc", Some(options))
            .await
            .unwrap();

        let message = futures_util::StreamExt::next(&mut stream)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.kind.as_deref(), Some("svc:created"));
        assert_eq!(message.headers["tenant"].as_str(), Some("acme"));
        let envelope = codec::decode(&message.body).unwrap();
        assert_eq!(envelope, Envelope::new("created", "abc"));
    }

    #[tokio::test]
    async fn test_publish_rejects_non_utf8_payload() {
        let memory = MemoryBroker::new();
        let broker = connected_broker(&memory).await;

        assert!(matches!(
            broker.publish("svc", "blob", vec![0xff, 0xfe], None).await,
            Err(BrokerError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_rolls_back_on_failure() {
        let memory = MemoryBroker::new();
        let broker = connected_broker(&memory).await;
        memory.fail_on("queue.bind", true);

        let result = broker
            .subscribe("svc", "svc:events", "created", |_d: Delivery| async {}, None)
            .await;
        assert!(matches!(
            result,
            Err(BrokerError::Transport { op: "queue.bind", .. })
        ));
        assert!(broker.registry().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_exchange_durability() {
        let memory = MemoryBroker::new();
        let mut settings = ConnectionSettings::new("memory://local", "svc");
        settings.exchange = crate::config::Exchange::new("scratch", false);
        let broker = Broker::new(settings, Arc::new(memory.connector()));
        broker.connect().await.unwrap();

        broker
            .subscribe("scratch", "q1", "created", |_d: Delivery| async {}, None)
            .await
            .unwrap();
        broker
            .subscribe("orders", "q2", "created", |_d: Delivery| async {}, None)
            .await
            .unwrap();

        assert_eq!(memory.exchange_durable("scratch"), Some(false));
        assert_eq!(memory.exchange_durable("orders"), Some(true));
    }

    #[tokio::test]
    async fn test_subscribe_declares_topology() {
        let memory = MemoryBroker::new();
        let broker = connected_broker(&memory).await;

        let options = SubscribeOptions {
            durable_queue: true,
            headers: [("region".to_string(), HeaderValue::from("eu"))]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        let subscription = broker
            .subscribe(
                "orders",
                "orders:events",
                "created",
                |_d: Delivery| async {},
                Some(options),
            )
            .await
            .unwrap();

        assert_eq!(subscription.queue(), "orders:events");
        assert!(subscription.durable());
        assert_eq!(subscription.state(), ConsumerState::Consuming);
        assert_eq!(memory.exchange_durable("orders"), Some(true));
        assert!(memory.queue_options("orders:events").unwrap().durable);
        assert_eq!(
            memory.binding_arguments("orders", "orders:events").unwrap()["region"].as_str(),
            Some("eu")
        );
        assert_eq!(memory.consumer_count("orders:events"), 1);

        subscription.unsubscribe();
        subscription.unsubscribe();
        subscription.stopped().await;
        assert_eq!(subscription.state(), ConsumerState::Stopped);
        assert_eq!(memory.consumer_count("orders:events"), 0);
        assert!(broker.registry().is_empty());
    }
}
