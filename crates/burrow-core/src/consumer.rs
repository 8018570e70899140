//! Per-subscription delivery loop.
//!
//! Each subscription runs one [`Consumer`] on its own task. For every
//! delivery the consumer decodes the envelope, looks up the handlers for the
//! delivery's type label and runs them one after another, in registration
//! order. The loop ends when the stream ends or fails, when the subscription
//! is cancelled, or when the broker shuts down; a running handler is always
//! allowed to finish.

use burrow_protocol::{codec, headers, RoutingKey};
use burrow_transport::{Channel, DeliveryStream, InboundMessage};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::delivery::Delivery;
use crate::registry::HandlerRegistry;

/// Lifecycle of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Pulling deliveries.
    Consuming,
    /// The loop has returned.
    Stopped,
}

/// Why a consumer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopReason {
    Cancelled,
    Shutdown,
    StreamEnded,
    StreamFailed,
}

/// Resolves once `signal` is raised. A dropped sender never raises it.
async fn raised(signal: &mut watch::Receiver<bool>) {
    let closed = signal.wait_for(|raised| *raised).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

pub(crate) struct Consumer {
    pub(crate) dispatcher: Dispatcher,
    pub(crate) stream: DeliveryStream,
    pub(crate) stop: watch::Receiver<bool>,
    pub(crate) shutdown: watch::Receiver<bool>,
    pub(crate) state: watch::Sender<ConsumerState>,
}

/// Everything a delivery needs on its way to the handlers.
///
/// Borrowed across handler awaits, so it must stay `Sync`; the stream lives
/// in [`Consumer`].
pub(crate) struct Dispatcher {
    pub(crate) routing_key: RoutingKey,
    pub(crate) queue: String,
    pub(crate) tag: String,
    pub(crate) auto_ack: bool,
    pub(crate) channel: Arc<dyn Channel>,
    pub(crate) registry: Arc<HandlerRegistry>,
}

impl Consumer {
    pub(crate) async fn run(self) -> StopReason {
        let Consumer {
            dispatcher,
            mut stream,
            mut stop,
            mut shutdown,
            state,
        } = self;

        debug!(
            routing_key = %dispatcher.routing_key,
            queue = %dispatcher.queue,
            consumer = %dispatcher.tag,
            "Consumer started"
        );

        let reason = loop {
            let next = tokio::select! {
                biased;
                _ = raised(&mut stop) => break StopReason::Cancelled,
                _ = raised(&mut shutdown) => break StopReason::Shutdown,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(message)) => dispatcher.dispatch(message).await,
                Some(Err(e)) => {
                    warn!(
                        queue = %dispatcher.queue,
                        consumer = %dispatcher.tag,
                        error = %e,
                        "Delivery stream failed"
                    );
                    break StopReason::StreamFailed;
                }
                None => break StopReason::StreamEnded,
            }
        };

        if reason == StopReason::Cancelled {
            dispatcher.drain(&mut stream, &mut shutdown).await;
        }

        state.send_replace(ConsumerState::Stopped);
        debug!(
            queue = %dispatcher.queue,
            consumer = %dispatcher.tag,
            ?reason,
            "Consumer stopped"
        );
        reason
    }
}

impl Dispatcher {
    /// Cancel the consumer, then dispatch what the broker already handed
    /// over. The queue may be shared with other subscriptions, and those
    /// deliveries are theirs.
    async fn drain(&self, stream: &mut DeliveryStream, shutdown: &mut watch::Receiver<bool>) {
        if let Err(e) = self.channel.cancel(&self.tag).await {
            debug!(consumer = %self.tag, error = %e, "Consumer cancel failed");
            return;
        }

        let mut drained = 0usize;
        loop {
            let next = tokio::select! {
                biased;
                _ = raised(shutdown) => break,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(message)) => {
                    drained += 1;
                    self.dispatch(message).await;
                }
                Some(Err(e)) => {
                    debug!(consumer = %self.tag, error = %e, "Stream failed while draining");
                    break;
                }
                None => break,
            }
        }
        if drained > 0 {
            trace!(consumer = %self.tag, drained, "Drained in-flight deliveries");
        }
    }

    async fn dispatch(&self, message: InboundMessage) {
        let envelope = match codec::decode(&message.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(queue = %self.queue, error = %e, "Dropping undecodable message");
                self.discard(&message).await;
                return;
            }
        };

        let Some(label) = message.kind.as_deref() else {
            trace!(
                queue = %self.queue,
                event = %envelope.event,
                "Dropping message without type label"
            );
            self.discard(&message).await;
            return;
        };

        let handlers = self.registry.handlers(label);
        if handlers.is_empty() {
            trace!(queue = %self.queue, routing_key = %label, "No handlers, dropping message");
            self.discard(&message).await;
            return;
        }

        let routing_key = routing_key_of(label, &envelope.event);
        let delivery = Delivery::new(routing_key, envelope.payload)
            .with_headers(headers::to_string_map(&message.headers))
            .with_redelivered(message.redelivered)
            .with_acker(message.acker);

        trace!(routing_key = %label, handlers = handlers.len(), "Dispatching delivery");
        for handler in handlers {
            handler.handle(delivery.clone()).await;
        }
    }

    /// Settle a message no handler will see, so it does not sit unacknowledged.
    async fn discard(&self, message: &InboundMessage) {
        if self.auto_ack {
            return;
        }
        if let Some(acker) = &message.acker {
            if let Err(e) = acker.reject(false).await {
                debug!(queue = %self.queue, error = %e, "Reject of dropped message failed");
            }
        }
    }
}

/// Rebuild the routing key from the type label and the envelope's event.
///
/// The exchange is whatever precedes `:<event>`, so exchange names may
/// contain `:` themselves.
fn routing_key_of(label: &str, event: &str) -> RoutingKey {
    let exchange = label
        .strip_suffix(event)
        .and_then(|rest| rest.strip_suffix(':'))
        .or_else(|| label.split_once(':').map(|(exchange, _)| exchange))
        .unwrap_or_default();
    RoutingKey::new(exchange, event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_protocol::{Envelope, HeaderValue};
    use burrow_transport::{ConnectParams, Connector, MemoryBroker, OutboundMessage, QueueOptions};
    use std::sync::Mutex;

    struct Fixture {
        broker: MemoryBroker,
        channel: Arc<dyn Channel>,
        registry: Arc<HandlerRegistry>,
        stop: watch::Sender<bool>,
        shutdown: watch::Sender<bool>,
        state: watch::Receiver<ConsumerState>,
        consumer: Consumer,
    }

    async fn fixture(auto_ack: bool) -> Fixture {
        let broker = MemoryBroker::new();
        let channel = broker
            .connector()
            .connect("memory://local", &ConnectParams::default())
            .await
            .unwrap();
        channel.declare_queue("q", QueueOptions::default()).await.unwrap();
        let stream = channel.consume("q", "c1", auto_ack).await.unwrap();

        let registry = Arc::new(HandlerRegistry::new());
        let (stop, stop_rx) = watch::channel(false);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (state_tx, state) = watch::channel(ConsumerState::Consuming);

        let consumer = Consumer {
            dispatcher: Dispatcher {
                routing_key: RoutingKey::new("svc", "created"),
                queue: "q".into(),
                tag: "c1".into(),
                auto_ack,
                channel: Arc::clone(&channel),
                registry: Arc::clone(&registry),
            },
            stream,
            stop: stop_rx,
            shutdown: shutdown_rx,
            state: state_tx,
        };

        Fixture {
            broker,
            channel,
            registry,
            stop,
            shutdown,
            state,
            consumer,
        }
    }

    fn message(label: Option<&str>, event: &str, payload: &str) -> OutboundMessage {
        OutboundMessage {
            body: codec::encode(&Envelope::new(event, payload.to_string())).unwrap(),
            kind: label.map(str::to_string),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_dispatch_and_cancel() {
        let f = fixture(true).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        f.registry.register(
            &RoutingKey::new("svc", "created"),
            Arc::new(move |d: Delivery| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().unwrap().push((
                        String::from_utf8(d.payload().to_vec()).unwrap(),
                        d.header("tenant").map(str::to_string),
                        d.header("attempt").map(str::to_string),
                    ));
                }
            }),
        );

        let task = tokio::spawn(f.consumer.run());

        let mut msg = message(Some("svc:created"), "created", "abc");
        msg.headers.insert("tenant".into(), "acme".into());
        msg.headers.insert("attempt".into(), HeaderValue::Int(3));
        f.channel.publish("", "q", msg).await.unwrap();
        f.channel
            .publish("", "q", message(Some("svc:deleted"), "deleted", "ignored"))
            .await
            .unwrap();
        f.channel
            .publish("", "q", OutboundMessage::default())
            .await
            .unwrap();

        while seen.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        f.stop.send_replace(true);

        assert_eq!(task.await.unwrap(), StopReason::Cancelled);
        assert_eq!(*f.state.borrow(), ConsumerState::Stopped);
        assert_eq!(f.broker.consumer_count("q"), 0);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("abc".to_string(), Some("acme".to_string()), Some(String::new()))]
        );
    }

    #[tokio::test]
    async fn test_cancel_dispatches_deliveries_already_received() {
        let f = fixture(true).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        f.registry.register(
            &RoutingKey::new("svc", "other"),
            Arc::new(move |d: Delivery| {
                sink.lock().unwrap().push(d.payload().clone());
                std::future::ready(())
            }),
        );

        for payload in ["1", "2", "3"] {
            f.channel
                .publish("", "q", message(Some("svc:other"), "other", payload))
                .await
                .unwrap();
        }
        assert_eq!(f.broker.queue_depth("q"), 0);

        // Stop before the loop ever runs: the buffered deliveries still go out
        f.stop.send_replace(true);
        assert_eq!(f.consumer.run().await, StopReason::Cancelled);

        assert_eq!(seen.lock().unwrap().len(), 3);
        assert_eq!(f.broker.consumer_count("q"), 0);
        assert_eq!(*f.state.borrow(), ConsumerState::Stopped);
    }

    #[test]
    fn test_routing_key_from_label() {
        assert_eq!(
            routing_key_of("orders:created", "created"),
            RoutingKey::new("orders", "created")
        );
        assert_eq!(
            routing_key_of("eu:orders:created", "created"),
            RoutingKey::new("eu:orders", "created")
        );
        // Label and envelope disagree: fall back to the label's exchange
        assert_eq!(
            routing_key_of("orders:created", "shipped"),
            RoutingKey::new("orders", "shipped")
        );
    }

    #[tokio::test]
    async fn test_shutdown_and_stream_end() {
        let f = fixture(true).await;
        let task = tokio::spawn(f.consumer.run());
        f.shutdown.send_replace(true);
        assert_eq!(task.await.unwrap(), StopReason::Shutdown);

        let f = fixture(true).await;
        let task = tokio::spawn(f.consumer.run());
        f.channel.close().await.unwrap();
        assert_eq!(task.await.unwrap(), StopReason::StreamEnded);
    }

    #[tokio::test]
    async fn test_dropped_stop_sender_keeps_consuming() {
        let f = fixture(true).await;
        let task = tokio::spawn(f.consumer.run());
        drop(f.stop);

        tokio::task::yield_now().await;
        assert!(!task.is_finished());

        f.shutdown.send_replace(true);
        assert_eq!(task.await.unwrap(), StopReason::Shutdown);
    }

    #[tokio::test]
    async fn test_manual_ack_discards_unroutable() {
        let f = fixture(false).await;
        let task = tokio::spawn(f.consumer.run());

        f.channel
            .publish("", "q", message(Some("svc:nobody"), "nobody", "x"))
            .await
            .unwrap();
        f.channel
            .publish(
                "",
                "q",
                OutboundMessage {
                    body: bytes::Bytes::from_static(b"not json"),
                    kind: Some("svc:created".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        while f.broker.rejected() < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(f.broker.queue_depth("q"), 0);

        f.shutdown.send_replace(true);
        task.await.unwrap();
    }
}
