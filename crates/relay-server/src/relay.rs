//! Broker handlers on the gateway side.

use async_trait::async_trait;
use relay_broker::{HandleError, Record, RecordHandler};
use relay_protocol::codec;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

use crate::gateway::Gateway;
use crate::metrics;

/// Delivers response and confirmation records to the addressed socket.
///
/// A record for a producer that is not connected here is handled and
/// dropped.
pub struct ResponseRelay {
    gateway: Arc<Gateway>,
}

impl ResponseRelay {
    #[must_use]
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl RecordHandler for ResponseRelay {
    async fn handle(&self, record: &Record) -> Result<(), HandleError> {
        let message = codec::decode_message(&record.value)
            .map_err(|e| HandleError::Malformed(e.to_string()))?;

        let delivered = self
            .gateway
            .send_message(&message)
            .await
            .map_err(HandleError::failed)?;

        if delivered {
            trace!(topic = %record.topic, producer = %message.producer, "Relayed to socket");
        } else {
            debug!(topic = %record.topic, producer = %message.producer, "No socket for producer");
        }
        Ok(())
    }
}

/// Records per-record outcome and latency around another handler.
pub struct Instrumented<H> {
    inner: H,
}

impl<H> Instrumented<H> {
    pub fn new(inner: H) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<H: RecordHandler> RecordHandler for Instrumented<H> {
    async fn handle(&self, record: &Record) -> Result<(), HandleError> {
        let started = Instant::now();
        let result = self.inner.handle(record).await;

        let outcome = match &result {
            Ok(()) => "ok",
            Err(HandleError::Malformed(_)) => "malformed",
            Err(HandleError::Failed(_)) => "failed",
        };
        metrics::record_record(&record.topic, outcome, started.elapsed().as_secs_f64());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayConfig;
    use bytes::Bytes;
    use relay_broker::{MemoryBroker, ProducerConfig, RetryingProducer};
    use relay_protocol::{Action, TransportMessage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    fn relay() -> ResponseRelay {
        let producer = RetryingProducer::new(
            Arc::new(MemoryBroker::new(1)),
            ProducerConfig::default(),
        );
        ResponseRelay::new(Arc::new(Gateway::new(
            Arc::new(producer),
            GatewayConfig::default(),
            CancellationToken::new(),
        )))
    }

    fn record(value: impl Into<Bytes>) -> Record {
        Record {
            topic: "rtc-response-topic".to_string(),
            partition: 0,
            offset: 0,
            key: None,
            value: value.into(),
        }
    }

    #[tokio::test]
    async fn test_undecodable_record_is_malformed() {
        let result = relay().handle(&record("not json")).await;
        assert!(matches!(result, Err(HandleError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_record_for_absent_producer_is_handled() {
        let message = TransportMessage::new("p1", "room-1", Action::Message, "hi");
        let value = codec::encode(&message).unwrap();
        assert!(relay().handle(&record(value)).await.is_ok());
    }

    struct Counting(AtomicUsize);

    #[async_trait]
    impl RecordHandler for Counting {
        async fn handle(&self, _record: &Record) -> Result<(), HandleError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(HandleError::Malformed("bad".into()))
        }
    }

    #[tokio::test]
    async fn test_instrumented_passes_result_through() {
        let handler = Instrumented::new(Counting(AtomicUsize::new(0)));
        let result = handler.handle(&record("x")).await;

        assert!(matches!(result, Err(HandleError::Malformed(_))));
        assert_eq!(handler.inner.0.load(Ordering::SeqCst), 1);
    }
}
