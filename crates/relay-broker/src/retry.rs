//! Retrying producer.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::traits::{BrokerError, Delivery, Producer};

/// Producer retry configuration.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Total attempts per record, including the first.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub retry_backoff: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

/// A producer that retries transient failures a bounded number of times.
///
/// Failure after the last attempt is returned as [`BrokerError::Exhausted`];
/// it is never swallowed.
pub struct RetryingProducer {
    inner: Arc<dyn Producer>,
    config: ProducerConfig,
    cancel: CancellationToken,
}

impl RetryingProducer {
    /// Wrap a producer.
    #[must_use]
    pub fn new(inner: Arc<dyn Producer>, config: ProducerConfig) -> Self {
        Self {
            inner,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort pending retries when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Publish a string value.
    ///
    /// # Errors
    ///
    /// Returns an error if every attempt failed or the error is not retryable.
    pub async fn produce(
        &self,
        topic: &str,
        key: Option<&str>,
        value: &str,
    ) -> Result<Delivery, BrokerError> {
        self.send(topic, key, value.as_bytes()).await
    }
}

#[async_trait]
impl Producer for RetryingProducer {
    async fn send(
        &self,
        topic: &str,
        key: Option<&str>,
        value: &[u8],
    ) -> Result<Delivery, BrokerError> {
        let attempts = self.config.max_attempts.max(1);
        let mut last_error = BrokerError::Closed;

        for attempt in 1..=attempts {
            match self.inner.send(topic, key, value).await {
                Ok(delivery) => {
                    trace!(
                        topic = %topic,
                        partition = delivery.partition,
                        offset = delivery.offset,
                        "Record published"
                    );
                    return Ok(delivery);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(topic = %topic, attempt, error = %e, "Publish attempt failed");
                    last_error = e;
                }
            }

            if attempt < attempts {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.retry_backoff) => {}
                    _ = self.cancel.cancelled() => return Err(BrokerError::Cancelled),
                }
            }
        }

        Err(BrokerError::Exhausted {
            topic: topic.to_string(),
            attempts,
            source: Box::new(last_error),
        })
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}
