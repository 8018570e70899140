//! In-process transport.
//!
//! [`MemoryBroker`] emulates the subset of AMQP 0-9-1 the core relies on:
//! topic exchanges, the default exchange, queue bindings, round-robin
//! consumers, auto/manual acknowledgement and requeue. Connections created by
//! [`MemoryConnector`] share one broker, so a publisher and a subscriber in
//! the same test see each other's traffic exactly as they would on RabbitMQ.

use async_trait::async_trait;
use burrow_protocol::HeaderMap;
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::traits::{
    redact_endpoint, Acker, Channel, ConnectParams, Connector, DeliveryStream, InboundMessage,
    OutboundMessage, QueueOptions, TransportError,
};

type DeliverySender = mpsc::UnboundedSender<Result<InboundMessage, TransportError>>;

/// A connection as seen by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// The `connection_name` client property.
    pub name: String,
    /// Whether a TLS identity was presented.
    pub tls: bool,
    /// Last `basic.qos` applied (prefetch count, global).
    pub prefetch: Option<(u16, bool)>,
    /// Whether the connection is still open.
    pub open: bool,
}

struct ConnectionRecord {
    info: ConnectionInfo,
    open: Arc<AtomicBool>,
}

struct Binding {
    queue: String,
    key: String,
    arguments: HeaderMap,
}

struct ExchangeState {
    durable: bool,
    bindings: Vec<Binding>,
}

#[derive(Clone)]
struct Stored {
    message: OutboundMessage,
    redelivered: bool,
}

struct ConsumerSlot {
    tag: String,
    connection: u64,
    auto_ack: bool,
    tx: DeliverySender,
}

struct QueueState {
    options: QueueOptions,
    owner: u64,
    messages: VecDeque<Stored>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    connections: HashMap<u64, ConnectionRecord>,
    next_connection: u64,
    next_queue: u64,
    unreachable: bool,
    paused: bool,
    failing: HashSet<&'static str>,
    acked: u64,
    rejected: u64,
}

/// Topic-exchange pattern match: `*` is one word, `#` is zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn go(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => go(&pattern[1..], key) || (!key.is_empty() && go(pattern, &key[1..])),
            (Some(&"*"), Some(_)) => go(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => go(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    go(&pattern, &key)
}

impl State {
    fn check(&self, op: &'static str) -> Result<(), TransportError> {
        if self.failing.contains(op) {
            return Err(TransportError::operation(op, "injected failure"));
        }
        Ok(())
    }

    fn enqueue(&mut self, handle: &MemoryBroker, queue: &str, stored: Stored, front: bool) {
        if let Some(q) = self.queues.get_mut(queue) {
            if front {
                q.messages.push_front(stored);
            } else {
                q.messages.push_back(stored);
            }
            self.pump(handle, queue);
        }
    }

    /// Hand queued messages to consumers, round-robin.
    fn pump(&mut self, handle: &MemoryBroker, name: &str) {
        if self.paused {
            return;
        }
        let queue = match self.queues.get_mut(name) {
            Some(queue) => queue,
            None => return,
        };

        while !queue.messages.is_empty() {
            queue.consumers.retain(|c| !c.tx.is_closed());
            if queue.consumers.is_empty() {
                break;
            }

            let idx = queue.next_consumer % queue.consumers.len();
            queue.next_consumer = idx + 1;

            let stored = match queue.messages.pop_front() {
                Some(stored) => stored,
                None => break,
            };
            let consumer = &queue.consumers[idx];

            let acker: Option<Arc<dyn Acker>> = if consumer.auto_ack {
                None
            } else {
                Some(Arc::new(MemoryAcker {
                    broker: handle.clone(),
                    queue: name.to_string(),
                    stored: stored.clone(),
                    settled: AtomicBool::new(false),
                }))
            };

            let inbound = InboundMessage {
                body: stored.message.body.clone(),
                kind: stored.message.kind.clone(),
                headers: stored.message.headers.clone(),
                correlation_id: stored.message.correlation_id.clone(),
                reply_to: stored.message.reply_to.clone(),
                redelivered: stored.redelivered,
                acker,
            };

            if consumer.tx.send(Ok(inbound)).is_err() {
                queue.messages.push_front(stored);
                continue;
            }
            trace!(queue = %name, consumer = %consumer.tag, "Delivered message");
            if consumer.auto_ack {
                self.acked += 1;
            }
        }
    }

    fn remove_consumers(&mut self, mut predicate: impl FnMut(&ConsumerSlot) -> bool) {
        let mut emptied = Vec::new();
        for (name, queue) in &mut self.queues {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| !predicate(c));
            if before > 0 && queue.consumers.is_empty() && queue.options.auto_delete {
                emptied.push(name.clone());
            }
        }
        for name in emptied {
            debug!(queue = %name, "Auto-deleting queue");
            self.delete_queue(&name);
        }
    }

    fn delete_queue(&mut self, name: &str) {
        self.queues.remove(name);
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|b| b.queue != name);
        }
    }

    fn close_connection(&mut self, id: u64) {
        if let Some(record) = self.connections.get_mut(&id) {
            record.open.store(false, Ordering::SeqCst);
            record.info.open = false;
        }
        self.remove_consumers(|c| c.connection == id);

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.options.exclusive && q.owner == id)
            .map(|(name, _)| name.clone())
            .collect();
        for name in exclusive {
            self.delete_queue(&name);
        }
    }
}

/// An in-process AMQP-like broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a connector dialing this broker.
    #[must_use]
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
        }
    }

    /// Refuse new connections when `false`.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    /// Hold routed messages in their queues instead of delivering them.
    pub fn set_paused(&self, paused: bool) {
        let mut state = self.lock();
        state.paused = paused;
        if !paused {
            let names: Vec<String> = state.queues.keys().cloned().collect();
            for name in names {
                state.pump(self, &name);
            }
        }
    }

    /// Make every call of the AMQP operation `op` fail until cleared.
    pub fn fail_on(&self, op: &'static str, failing: bool) {
        let mut state = self.lock();
        if failing {
            state.failing.insert(op);
        } else {
            state.failing.remove(op);
        }
    }

    /// Close every open connection, as a broker restart would.
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.close_connection(id);
        }
    }

    /// Connections seen so far, in dial order.
    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let state = self.lock();
        let mut ids: Vec<&u64> = state.connections.keys().collect();
        ids.sort();
        ids.into_iter()
            .map(|id| state.connections[id].info.clone())
            .collect()
    }

    /// Check if an exchange exists, returning its durability.
    #[must_use]
    pub fn exchange_durable(&self, name: &str) -> Option<bool> {
        self.lock().exchanges.get(name).map(|e| e.durable)
    }

    /// Check if a queue exists.
    #[must_use]
    pub fn queue_exists(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    /// Names of every queue, sorted.
    #[must_use]
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Declaration flags of a queue.
    #[must_use]
    pub fn queue_options(&self, name: &str) -> Option<QueueOptions> {
        self.lock().queues.get(name).map(|q| q.options)
    }

    /// Messages waiting in a queue.
    #[must_use]
    pub fn queue_depth(&self, name: &str) -> usize {
        self.lock()
            .queues
            .get(name)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Consumers attached to a queue.
    #[must_use]
    pub fn consumer_count(&self, name: &str) -> usize {
        self.lock()
            .queues
            .get(name)
            .map(|q| q.consumers.iter().filter(|c| !c.tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Binding arguments of `queue` on `exchange`.
    #[must_use]
    pub fn binding_arguments(&self, exchange: &str, queue: &str) -> Option<HeaderMap> {
        self.lock().exchanges.get(exchange).and_then(|e| {
            e.bindings
                .iter()
                .find(|b| b.queue == queue)
                .map(|b| b.arguments.clone())
        })
    }

    /// Number of acknowledged deliveries (auto-ack included).
    #[must_use]
    pub fn acked(&self) -> u64 {
        self.lock().acked
    }

    /// Number of deliveries rejected without requeue.
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.lock().rejected
    }
}

/// Dials a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        endpoint: &str,
        params: &ConnectParams,
    ) -> Result<Arc<dyn Channel>, TransportError> {
        let mut state = self.broker.lock();
        if state.unreachable {
            return Err(TransportError::Connect {
                endpoint: redact_endpoint(endpoint),
                reason: "connection refused".into(),
            });
        }

        let id = state.next_connection;
        state.next_connection += 1;

        let open = Arc::new(AtomicBool::new(true));
        state.connections.insert(
            id,
            ConnectionRecord {
                info: ConnectionInfo {
                    name: params.connection_name.clone(),
                    tls: params.tls.is_some(),
                    prefetch: None,
                    open: true,
                },
                open: Arc::clone(&open),
            },
        );

        debug!(connection = id, name = %params.connection_name, "Memory connection opened");

        Ok(Arc::new(MemoryChannel {
            id,
            broker: self.broker.clone(),
            open,
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// A channel on a [`MemoryBroker`] connection.
pub struct MemoryChannel {
    id: u64,
    broker: MemoryBroker,
    open: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn state(&self) -> Result<MutexGuard<'_, State>, TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        Ok(self.broker.lock())
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn qos(&self, prefetch_count: u16, global: bool) -> Result<(), TransportError> {
        let mut state = self.state()?;
        state.check("basic.qos")?;
        if let Some(record) = state.connections.get_mut(&self.id) {
            record.info.prefetch = Some((prefetch_count, global));
        }
        Ok(())
    }

    async fn declare_exchange(&self, name: &str, durable: bool) -> Result<(), TransportError> {
        let mut state = self.state()?;
        state.check("exchange.declare")?;
        match state.exchanges.get(name).map(|e| e.durable) {
            Some(existing) if existing != durable => Err(TransportError::operation(
                "exchange.declare",
                format!("PRECONDITION_FAILED - inequivalent arg 'durable' for exchange '{name}'"),
            )),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        durable,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, TransportError> {
        let mut state = self.state()?;
        state.check("queue.declare")?;

        let name = if name.is_empty() {
            state.next_queue += 1;
            format!("amq.gen-{}", state.next_queue)
        } else {
            name.to_string()
        };

        let existing = state
            .queues
            .get(&name)
            .map(|q| (q.options.exclusive, q.owner));
        match existing {
            Some((exclusive, owner)) if exclusive && owner != self.id => {
                Err(TransportError::operation(
                    "queue.declare",
                    format!("RESOURCE_LOCKED - cannot obtain exclusive access to queue '{name}'"),
                ))
            }
            Some(_) => Ok(name),
            None => {
                state.queues.insert(
                    name.clone(),
                    QueueState {
                        options,
                        owner: self.id,
                        messages: VecDeque::new(),
                        consumers: Vec::new(),
                        next_consumer: 0,
                    },
                );
                Ok(name)
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        binding_key: &str,
        arguments: &HeaderMap,
    ) -> Result<(), TransportError> {
        let mut state = self.state()?;
        state.check("queue.bind")?;

        if !state.queues.contains_key(queue) {
            return Err(TransportError::operation(
                "queue.bind",
                format!("NOT_FOUND - no queue '{queue}'"),
            ));
        }
        let ex = state.exchanges.get_mut(exchange).ok_or_else(|| {
            TransportError::operation("queue.bind", format!("NOT_FOUND - no exchange '{exchange}'"))
        })?;

        let exists = ex
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.key == binding_key && &b.arguments == arguments);
        if !exists {
            ex.bindings.push(Binding {
                queue: queue.to_string(),
                key: binding_key.to_string(),
                arguments: arguments.clone(),
            });
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), TransportError> {
        let mut state = self.state()?;
        state.check("basic.publish")?;

        let targets: Vec<String> = if exchange.is_empty() {
            if state.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            let ex = state.exchanges.get(exchange).ok_or_else(|| {
                TransportError::operation(
                    "basic.publish",
                    format!("NOT_FOUND - no exchange '{exchange}'"),
                )
            })?;
            let mut targets: Vec<String> = Vec::new();
            for binding in &ex.bindings {
                if topic_matches(&binding.key, routing_key) && !targets.contains(&binding.queue) {
                    targets.push(binding.queue.clone());
                }
            }
            targets
        };

        trace!(exchange = %exchange, routing_key = %routing_key, queues = targets.len(), "Routed message");

        for queue in targets {
            let stored = Stored {
                message: message.clone(),
                redelivered: false,
            };
            state.enqueue(&self.broker, &queue, stored, false);
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, TransportError> {
        let mut state = self.state()?;
        state.check("basic.consume")?;

        let (tx, rx) = mpsc::unbounded_channel();
        let q = state.queues.get_mut(queue).ok_or_else(|| {
            TransportError::operation("basic.consume", format!("NOT_FOUND - no queue '{queue}'"))
        })?;
        q.consumers.push(ConsumerSlot {
            tag: consumer_tag.to_string(),
            connection: self.id,
            auto_ack,
            tx,
        });
        state.pump(&self.broker, queue);

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        let mut state = self.state()?;
        state.check("basic.cancel")?;
        let id = self.id;
        state.remove_consumers(|c| c.connection == id && c.tag == consumer_tag);
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), TransportError> {
        let mut state = self.state()?;
        state.check("queue.delete")?;
        state.delete_queue(name);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        self.broker.lock().close_connection(self.id);
        debug!(connection = self.id, "Memory connection closed");
        Ok(())
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    queue: String,
    stored: Stored,
    settled: AtomicBool,
}

impl MemoryAcker {
    fn settle(&self, op: &'static str) -> Result<(), TransportError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(TransportError::operation(
                op,
                "PRECONDITION_FAILED - unknown delivery tag",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.settle("basic.ack")?;
        self.broker.lock().acked += 1;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        self.settle("basic.reject")?;
        let mut state = self.broker.lock();
        if requeue {
            let stored = Stored {
                message: self.stored.message.clone(),
                redelivered: true,
            };
            state.enqueue(&self.broker, &self.queue, stored, true);
        } else {
            state.rejected += 1;
        }
        Ok(())
    }
}
