//! Service-scoped broker.
//!
//! A [`Service`] binds a [`Broker`] to one service name: it publishes on the
//! exchange named after the service, consumes from `"<service>:events"`
//! queues, and exposes the readiness and liveness checks a service host
//! wires into its health endpoints.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use burrow_transport::Connector;

use crate::broker::{Broker, Subscription};
use crate::config::{BrokerConfig, Exchange};
use crate::connection::ConnectionSettings;
use crate::error::BrokerError;
use crate::options::{PublishOptions, SubscribeOptions};
use crate::registry::Handler;

/// Timeout of the liveness check.
pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Queue a service's events are consumed from.
#[must_use]
pub fn events_queue(service: &str) -> String {
    format!("{service}:events")
}

/// A broker bound to a service name.
pub struct Service {
    name: String,
    broker: Arc<Broker>,
}

impl Service {
    /// Resolve the configuration, build the broker and connect.
    ///
    /// The default exchange is `{ name, durable: true }` unless the
    /// configuration names one.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Config`] if neither a DSN nor a host is
    /// configured, or the connection error.
    pub async fn start(
        name: impl Into<String>,
        config: &BrokerConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, BrokerError> {
        let service = Self::new(name, config, connector)?;
        service.broker.connect().await?;
        service.declare_service_exchange().await?;
        info!(service = %service.name, "Broker service started");
        Ok(service)
    }

    /// Events are always published on the exchange named after the service,
    /// which connect only declares when no other default is configured.
    async fn declare_service_exchange(&self) -> Result<(), BrokerError> {
        if self.broker.connection().settings().exchange.name == self.name {
            return Ok(());
        }
        self.broker
            .channel()?
            .declare_exchange(&self.name, true)
            .await
            .map_err(BrokerError::transport("exchange.declare"))
    }

    /// Build the service without connecting.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Config`] for an unusable configuration.
    pub fn new(
        name: impl Into<String>,
        config: &BrokerConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, BrokerError> {
        let name = name.into();
        let settings =
            ConnectionSettings::from_config(config, name.clone(), Exchange::new(name.clone(), true))?;
        Ok(Self {
            name,
            broker: Arc::new(Broker::new(settings, connector)),
        })
    }

    /// Get the service name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the underlying broker.
    #[must_use]
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Publish an event on this service's exchange.
    ///
    /// # Errors
    ///
    /// See [`Broker::publish`].
    pub async fn publish(
        &self,
        event: &str,
        payload: impl Into<Bytes>,
        options: Option<PublishOptions>,
    ) -> Result<(), BrokerError> {
        self.broker.publish(&self.name, event, payload, options).await
    }

    /// Subscribe to `event` published by `service`.
    ///
    /// # Errors
    ///
    /// See [`Broker::subscribe`].
    pub async fn subscribe<H: Handler>(
        &self,
        service: &str,
        event: &str,
        handler: H,
        options: Option<SubscribeOptions>,
    ) -> Result<Subscription, BrokerError> {
        self.broker
            .subscribe(service, &events_queue(service), event, handler, options)
            .await
    }

    /// Readiness: the connection is up.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::NotConnected`] otherwise.
    pub fn readiness(&self) -> Result<(), BrokerError> {
        self.broker.connected()
    }

    /// Liveness: a probe round trip completes within [`HEALTH_PROBE_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// Returns the probe failure.
    pub async fn liveness(&self) -> Result<(), BrokerError> {
        self.liveness_within(HEALTH_PROBE_TIMEOUT).await.map(|_| ())
    }

    /// Liveness with a custom timeout, returning the round-trip time.
    ///
    /// # Errors
    ///
    /// Returns the probe failure.
    pub async fn liveness_within(&self, timeout: Duration) -> Result<Duration, BrokerError> {
        self.broker.liveness(timeout).await
    }

    /// Disconnect and wait for every consumer.
    ///
    /// # Errors
    ///
    /// See [`Broker::disconnect`].
    pub async fn stop(&self) -> Result<(), BrokerError> {
        self.broker.disconnect().await
    }
}
