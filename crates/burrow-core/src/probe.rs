//! Liveness probe.
//!
//! Proves the broker round trip works end to end: declare a private queue,
//! consume from it, publish a correlated message to it through the default
//! exchange and wait for that message to come back.

use burrow_transport::{Channel, OutboundMessage, QueueOptions};
use bytes::Bytes;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace, warn};

use crate::error::{BrokerError, ProbeError};

/// Correlation id carried by every probe message.
pub const PROBE_CORRELATION_ID: &str = "burrow.liveness";

/// Upper bound on a probe, whatever timeout the caller asks for.
pub const PROBE_HARD_LIMIT: Duration = Duration::from_secs(10);

/// Prefix of probe queue names.
pub const PROBE_QUEUE_PREFIX: &str = "burrow.probe.";

static PROBE_SEQ: AtomicU64 = AtomicU64::new(0);

fn probe_queue_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!(
        "{PROBE_QUEUE_PREFIX}{}.{:x}.{}",
        std::process::id(),
        nanos,
        PROBE_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

/// Run one probe on `channel`, returning the round-trip time.
///
/// The probe runs on its own task, so the queue and its consumer are removed
/// on every exit path, including when the caller stops waiting.
///
/// # Errors
///
/// Returns a transport error if the queue cannot be set up, or
/// [`BrokerError::Probe`] if no matching reply arrives within
/// `min(timeout, PROBE_HARD_LIMIT)` or the queue cannot be removed.
pub async fn run(channel: Arc<dyn Channel>, timeout: Duration) -> Result<Duration, BrokerError> {
    match tokio::spawn(probe(channel, timeout)).await {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => Err(ProbeError::Interrupted.into()),
    }
}

async fn probe(channel: Arc<dyn Channel>, timeout: Duration) -> Result<Duration, BrokerError> {
    let options = QueueOptions {
        durable: false,
        exclusive: true,
        auto_delete: true,
    };
    let queue = channel
        .declare_queue(&probe_queue_name(), options)
        .await
        .map_err(BrokerError::transport("queue.declare"))?;
    let tag = format!("{queue}.consumer");

    let outcome = round_trip(channel.as_ref(), &queue, &tag, timeout).await;

    if let Err(e) = channel.cancel(&tag).await {
        debug!(queue = %queue, error = %e, "Probe consumer cancel failed");
    }
    let cleanup = channel.delete_queue(&queue).await;

    match (outcome, cleanup) {
        (Ok(elapsed), Ok(())) => {
            trace!(queue = %queue, ?elapsed, "Liveness probe succeeded");
            Ok(elapsed)
        }
        (Ok(_), Err(e)) => {
            warn!(queue = %queue, error = %e, "Probe queue cleanup failed");
            Err(ProbeError::Cleanup(e.to_string()).into())
        }
        (Err(e), cleanup) => {
            if let Err(cleanup) = cleanup {
                warn!(queue = %queue, error = %cleanup, "Probe queue cleanup failed");
            }
            debug!(queue = %queue, error = %e, "Liveness probe failed");
            Err(e)
        }
    }
}

async fn round_trip(
    channel: &dyn Channel,
    queue: &str,
    tag: &str,
    timeout: Duration,
) -> Result<Duration, BrokerError> {
    let mut replies = channel
        .consume(queue, tag, true)
        .await
        .map_err(BrokerError::transport("basic.consume"))?;

    let started = Instant::now();
    let message = OutboundMessage {
        body: Bytes::from_static(b"ping"),
        correlation_id: Some(PROBE_CORRELATION_ID.to_string()),
        reply_to: Some(queue.to_string()),
        ..Default::default()
    };
    channel
        .publish("", queue, message)
        .await
        .map_err(BrokerError::transport("basic.publish"))?;

    let limit = timeout.min(PROBE_HARD_LIMIT);
    let reply = tokio::time::timeout(limit, replies.next())
        .await
        .map_err(|_| ProbeError::Timeout(limit))?;

    match reply {
        Some(Ok(reply)) if reply.correlation_id.as_deref() == Some(PROBE_CORRELATION_ID) => {
            Ok(started.elapsed())
        }
        Some(Ok(reply)) => Err(ProbeError::CorrelationMismatch {
            expected: PROBE_CORRELATION_ID.to_string(),
            got: reply.correlation_id,
        }
        .into()),
        Some(Err(e)) => Err(BrokerError::transport("basic.deliver")(e)),
        None => Err(ProbeError::StreamClosed.into()),
    }
}
