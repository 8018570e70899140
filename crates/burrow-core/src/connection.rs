//! Connection manager.
//!
//! Owns the single transport connection and channel shared by publishers,
//! consumers and the liveness probe. Connecting is lazy and idempotent;
//! only the manager ever closes the channel.

use burrow_transport::traits::redact_endpoint;
use burrow_transport::{Channel, ConnectParams, Connector, TlsIdentity, TransportError};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{BrokerConfig, Exchange};
use crate::error::BrokerError;

/// PEM material for a client certificate.
#[derive(Clone, Default)]
pub struct TlsMaterial {
    /// Certificate chain.
    pub cert: String,
    /// PKCS#8 private key.
    pub key: String,
    /// Extra trust anchors.
    pub ca: Option<String>,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("cert_len", &self.cert.len())
            .field("key", &"<KEY>")
            .field("ca", &self.ca.is_some())
            .finish()
    }
}

/// Everything needed to open the broker connection.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Endpoints tried in order.
    pub endpoints: Vec<String>,
    /// `connection_name` client property.
    pub connection_name: String,
    /// Exchange declared on connect.
    pub exchange: Exchange,
    /// Prefetch count applied with `basic.qos`.
    pub prefetch_count: u16,
    /// Apply the prefetch limit to the whole channel.
    pub prefetch_global: bool,
    /// Client certificate, when TLS verification is on.
    pub tls: Option<TlsMaterial>,
}

impl ConnectionSettings {
    /// Settings for a single endpoint with defaults everywhere else.
    #[must_use]
    pub fn new(endpoint: impl Into<String>, connection_name: impl Into<String>) -> Self {
        Self {
            endpoints: vec![endpoint.into()],
            connection_name: connection_name.into(),
            exchange: Exchange::default(),
            prefetch_count: 0,
            prefetch_global: false,
            tls: None,
        }
    }

    /// Derive settings from a [`BrokerConfig`].
    ///
    /// `exchange` is used unless the configuration names its own default
    /// exchange.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Config`] if no endpoint can be resolved, or if
    /// TLS verification is on without a certificate and key.
    pub fn from_config(
        config: &BrokerConfig,
        connection_name: impl Into<String>,
        exchange: Exchange,
    ) -> Result<Self, BrokerError> {
        let tls = if config.tls_verify {
            match (&config.tls_cert, &config.tls_key) {
                (Some(cert), Some(key)) => Some(TlsMaterial {
                    cert: cert.clone(),
                    key: key.clone(),
                    ca: config.tls_ca.clone(),
                }),
                _ => {
                    return Err(BrokerError::Config(
                        "tls_cert and tls_key are required when tls_verify is set".into(),
                    ))
                }
            }
        } else {
            None
        };

        Ok(Self {
            endpoints: vec![config.resolve_dsn()?],
            connection_name: connection_name.into(),
            exchange: config.exchange_or(exchange),
            prefetch_count: config.prefetch_count,
            prefetch_global: config.prefetch_global,
            tls,
        })
    }
}

/// Owns the broker connection.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    settings: ConnectionSettings,
    channel: RwLock<Option<Arc<dyn Channel>>>,
    connecting: Mutex<()>,
}

impl ConnectionManager {
    /// Create a manager; nothing is dialed until [`connect`](Self::connect).
    #[must_use]
    pub fn new(settings: ConnectionSettings, connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            settings,
            channel: RwLock::new(None),
            connecting: Mutex::new(()),
        }
    }

    /// Get the settings.
    #[must_use]
    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    fn current(&self) -> Option<Arc<dyn Channel>> {
        self.channel
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn tls_identity(&self) -> Result<Option<TlsIdentity>, BrokerError> {
        self.settings
            .tls
            .as_ref()
            .map(|tls| {
                TlsIdentity::from_pem(&tls.cert, &tls.key, tls.ca.as_deref())
                    .map_err(|e| BrokerError::Config(e.to_string()))
            })
            .transpose()
    }

    /// Open the connection and channel.
    ///
    /// Returns immediately if the current channel is open. Otherwise dials
    /// each endpoint in order, applies the prefetch limit and declares the
    /// default exchange.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Config`] for unusable TLS material, or the
    /// transport error of the last failed step.
    pub async fn connect(&self) -> Result<(), BrokerError> {
        let _guard = self.connecting.lock().await;

        if self.current().is_some_and(|c| c.is_open()) {
            return Ok(());
        }

        let params = ConnectParams {
            connection_name: self.settings.connection_name.clone(),
            tls: self.tls_identity()?,
        };

        let mut last_error = TransportError::NoEndpoints;
        let mut opened = None;
        for endpoint in &self.settings.endpoints {
            match self.connector.connect(endpoint, &params).await {
                Ok(channel) => {
                    info!(
                        transport = self.connector.name(),
                        endpoint = %redact_endpoint(endpoint),
                        name = %self.settings.connection_name,
                        "Connected to broker"
                    );
                    opened = Some(channel);
                    break;
                }
                Err(e) => {
                    warn!(endpoint = %redact_endpoint(endpoint), error = %e, "Connection attempt failed");
                    last_error = e;
                }
            }
        }
        let channel = opened.ok_or_else(|| BrokerError::transport("connect")(last_error))?;

        if let Err(e) = self.prepare(channel.as_ref()).await {
            if let Err(close) = channel.close().await {
                debug!(error = %close, "Closing unprepared channel failed");
            }
            return Err(e);
        }

        *self.channel.write().unwrap_or_else(PoisonError::into_inner) = Some(channel);
        Ok(())
    }

    async fn prepare(&self, channel: &dyn Channel) -> Result<(), BrokerError> {
        channel
            .qos(self.settings.prefetch_count, self.settings.prefetch_global)
            .await
            .map_err(BrokerError::transport("basic.qos"))?;

        let exchange = &self.settings.exchange;
        channel
            .declare_exchange(&exchange.name, exchange.durable)
            .await
            .map_err(BrokerError::transport("exchange.declare"))?;

        debug!(
            exchange = %exchange.name,
            durable = exchange.durable,
            prefetch = self.settings.prefetch_count,
            "Channel ready"
        );
        Ok(())
    }

    /// Get the live channel.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::NotConnected`] if there is no open channel.
    pub fn channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        self.current()
            .filter(|c| c.is_open())
            .ok_or(BrokerError::NotConnected)
    }

    /// Check that the channel is open.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::NotConnected`] otherwise.
    pub fn connected(&self) -> Result<(), BrokerError> {
        self.channel().map(|_| ())
    }

    /// Close the connection.
    ///
    /// A connection the broker already dropped counts as closed.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::NotConnected`] if no connection was ever
    /// opened, or the transport error of the close.
    pub async fn close(&self) -> Result<(), BrokerError> {
        let channel = self
            .channel
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(BrokerError::NotConnected)?;

        match channel.close().await {
            Ok(()) | Err(TransportError::Closed) => {
                info!(name = %self.settings.connection_name, "Disconnected from broker");
                Ok(())
            }
            Err(e) => Err(BrokerError::transport("connection.close")(e)),
        }
    }
}
