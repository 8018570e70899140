//! AMQP 0-9-1 transport backed by `lapin`.

use async_trait::async_trait;
use burrow_protocol::{HeaderMap, HeaderValue};
use bytes::Bytes;
use futures_util::StreamExt;
use lapin::acker::Acker as LapinAcker;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::tcp::{OwnedIdentity, OwnedTLSConfig};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Connection, ConnectionProperties, ExchangeKind};
use std::sync::Arc;
use tracing::{debug, info};

use crate::traits::{
    redact_endpoint, Acker, Channel, ConnectParams, Connector, DeliveryStream, InboundMessage,
    OutboundMessage, QueueOptions, TransportError,
};

/// Reply code sent with `connection.close`.
const REPLY_SUCCESS: u16 = 200;

/// Password protecting the transient PKCS#12 identity handed to the TLS stack.
const IDENTITY_PASSWORD: &str = "burrow";

/// Connects to RabbitMQ (or any AMQP 0-9-1 broker).
#[derive(Debug, Clone, Default)]
pub struct AmqpConnector;

impl AmqpConnector {
    /// Create a new connector.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn tls_config(params: &ConnectParams) -> Result<OwnedTLSConfig, TransportError> {
    let Some(identity) = params.tls.as_ref() else {
        return Ok(OwnedTLSConfig::default());
    };

    Ok(OwnedTLSConfig {
        identity: Some(OwnedIdentity {
            der: identity.to_pkcs12(IDENTITY_PASSWORD)?,
            password: IDENTITY_PASSWORD.to_string(),
        }),
        cert_chain: identity.ca().map(str::to_string),
    })
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(
        &self,
        endpoint: &str,
        params: &ConnectParams,
    ) -> Result<Arc<dyn Channel>, TransportError> {
        let properties = ConnectionProperties::default()
            .with_connection_name(LongString::from(params.connection_name.clone()));

        let connect_error = |e: lapin::Error| TransportError::Connect {
            endpoint: redact_endpoint(endpoint),
            reason: e.to_string(),
        };

        let connection = Connection::connect_with_config(endpoint, properties, tls_config(params)?)
            .await
            .map_err(connect_error)?;
        let channel = connection.create_channel().await.map_err(connect_error)?;

        info!(
            endpoint = %redact_endpoint(endpoint),
            channel = channel.id(),
            "AMQP connection established"
        );

        Ok(Arc::new(AmqpChannel {
            connection,
            channel,
        }))
    }

    fn name(&self) -> &'static str {
        "amqp"
    }
}

/// A `lapin` connection and its single channel.
pub struct AmqpChannel {
    connection: Connection,
    channel: lapin::Channel,
}

fn op_error(op: &'static str) -> impl Fn(lapin::Error) -> TransportError {
    move |e| TransportError::operation(op, e)
}

fn to_amqp_value(value: &HeaderValue) -> AMQPValue {
    match value {
        HeaderValue::String(s) => AMQPValue::LongString(LongString::from(s.as_str())),
        HeaderValue::Int(i) => AMQPValue::LongLongInt(*i),
        HeaderValue::Float(x) => AMQPValue::Double(*x),
        HeaderValue::Bool(b) => AMQPValue::Boolean(*b),
        HeaderValue::Bytes(b) => AMQPValue::ByteArray(b.clone().into()),
        HeaderValue::Other => AMQPValue::Void,
    }
}

fn from_amqp_value(value: &AMQPValue) -> HeaderValue {
    match value {
        AMQPValue::LongString(s) => {
            HeaderValue::String(String::from_utf8_lossy(s.as_bytes()).into_owned())
        }
        AMQPValue::ShortString(s) => HeaderValue::String(s.as_str().to_string()),
        AMQPValue::Boolean(b) => HeaderValue::Bool(*b),
        AMQPValue::ShortShortInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::ShortShortUInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::ShortInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::ShortUInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::LongInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::LongUInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::LongLongInt(i) => HeaderValue::Int(*i),
        AMQPValue::Float(x) => HeaderValue::Float(f64::from(*x)),
        AMQPValue::Double(x) => HeaderValue::Float(*x),
        AMQPValue::ByteArray(b) => HeaderValue::Bytes(b.as_slice().to_vec()),
        _ => HeaderValue::Other,
    }
}

fn to_field_table(headers: &HeaderMap) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(ShortString::from(key.as_str()), to_amqp_value(value));
    }
    table
}

fn from_field_table(table: Option<&FieldTable>) -> HeaderMap {
    table
        .map(|t| {
            t.inner()
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), from_amqp_value(v)))
                .collect()
        })
        .unwrap_or_default()
}

fn to_properties(message: &OutboundMessage) -> BasicProperties {
    let mut properties = BasicProperties::default().with_headers(to_field_table(&message.headers));
    if let Some(kind) = &message.kind {
        properties = properties.with_type(ShortString::from(kind.as_str()));
    }
    if let Some(correlation_id) = &message.correlation_id {
        properties = properties.with_correlation_id(ShortString::from(correlation_id.as_str()));
    }
    if let Some(reply_to) = &message.reply_to {
        properties = properties.with_reply_to(ShortString::from(reply_to.as_str()));
    }
    properties
}

fn to_inbound(delivery: Delivery, auto_ack: bool) -> InboundMessage {
    let properties = &delivery.properties;
    let short = |s: &Option<ShortString>| s.as_ref().map(|s| s.as_str().to_string());

    let acker: Option<Arc<dyn Acker>> = if auto_ack {
        None
    } else {
        Some(Arc::new(AmqpAcker {
            acker: delivery.acker.clone(),
        }))
    };

    InboundMessage {
        kind: short(properties.kind()),
        headers: from_field_table(properties.headers().as_ref()),
        correlation_id: short(properties.correlation_id()),
        reply_to: short(properties.reply_to()),
        redelivered: delivery.redelivered,
        acker,
        body: Bytes::from(delivery.data),
    }
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn qos(&self, prefetch_count: u16, global: bool) -> Result<(), TransportError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global })
            .await
            .map_err(op_error("basic.qos"))
    }

    async fn declare_exchange(&self, name: &str, durable: bool) -> Result<(), TransportError> {
        let options = ExchangeDeclareOptions {
            durable,
            ..Default::default()
        };
        self.channel
            .exchange_declare(name, ExchangeKind::Topic, options, FieldTable::default())
            .await
            .map_err(op_error("exchange.declare"))
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, TransportError> {
        let options = QueueDeclareOptions {
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            ..Default::default()
        };
        let queue = self
            .channel
            .queue_declare(name, options, FieldTable::default())
            .await
            .map_err(op_error("queue.declare"))?;
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        binding_key: &str,
        arguments: &HeaderMap,
    ) -> Result<(), TransportError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                binding_key,
                QueueBindOptions::default(),
                to_field_table(arguments),
            )
            .await
            .map_err(op_error("queue.bind"))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), TransportError> {
        let properties = to_properties(&message);
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(op_error("basic.publish"))?
            .await
            .map_err(op_error("basic.publish"))?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, TransportError> {
        let options = BasicConsumeOptions {
            no_ack: auto_ack,
            ..Default::default()
        };
        let consumer = self
            .channel
            .basic_consume(queue, consumer_tag, options, FieldTable::default())
            .await
            .map_err(op_error("basic.consume"))?;

        debug!(queue = %queue, consumer = %consumer_tag, auto_ack, "AMQP consumer started");

        Ok(consumer
            .map(move |delivery| {
                delivery
                    .map(|d| to_inbound(d, auto_ack))
                    .map_err(|e| TransportError::operation("basic.deliver", e))
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(op_error("basic.cancel"))
    }

    async fn delete_queue(&self, name: &str) -> Result<(), TransportError> {
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map(|_| ())
            .map_err(op_error("queue.delete"))
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.connection.status().connected() {
            return Err(TransportError::Closed);
        }
        self.connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(op_error("connection.close"))
    }
}

struct AmqpAcker {
    acker: LapinAcker,
}

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(op_error("basic.ack"))
    }

    async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(op_error("basic.reject"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_conversion() {
        let mut headers = HeaderMap::new();
        headers.insert("tenant".into(), "acme".into());
        headers.insert("attempt".into(), HeaderValue::Int(2));

        let table = to_field_table(&headers);
        assert!(matches!(
            table.inner().get("tenant"),
            Some(AMQPValue::LongString(_))
        ));

        let back = from_field_table(Some(&table));
        assert_eq!(back, headers);
    }

    #[test]
    fn test_short_string_header_reads_as_string() {
        let mut table = FieldTable::default();
        table.insert("x".into(), AMQPValue::ShortString("v".into()));
        table.insert("n".into(), AMQPValue::ShortInt(7));

        let headers = from_field_table(Some(&table));
        assert_eq!(headers["x"], HeaderValue::String("v".into()));
        assert_eq!(headers["n"], HeaderValue::Int(7));
        assert!(from_field_table(None).is_empty());
    }

    #[test]
    fn test_properties_carry_routing_label() {
        let message = OutboundMessage {
            kind: Some("svc:created".into()),
            correlation_id: Some("corr-1".into()),
            reply_to: Some("q".into()),
            ..Default::default()
        };
        let properties = to_properties(&message);
        assert_eq!(
            properties.kind().as_ref().map(|s| s.as_str()),
            Some("svc:created")
        );
        assert_eq!(
            properties.correlation_id().as_ref().map(|s| s.as_str()),
            Some("corr-1")
        );
        assert_eq!(properties.reply_to().as_ref().map(|s| s.as_str()), Some("q"));
    }

    #[test]
    fn test_plain_connection_has_no_identity() {
        let config = tls_config(&ConnectParams::default()).unwrap();
        assert!(config.identity.is_none());
        assert!(config.cert_chain.is_none());
    }
}
