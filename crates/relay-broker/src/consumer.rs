//! Consumer-group loop with explicit commit policy.
//!
//! [`ConsumerLoop::run`] joins the group, spawns one worker per claimed
//! partition and handles each partition's records sequentially. After every
//! record the [`AtLeastOnce`] policy decides whether its offset is committed.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::traits::{BrokerError, ConsumerGroup, PartitionClaim, Record};

/// Why a handler did not process a record.
#[derive(Debug, Error)]
pub enum HandleError {
    /// The record could not be decoded. Retrying cannot help.
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// Processing failed; the record may succeed if delivered again.
    #[error("Handler failed: {0}")]
    Failed(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl HandleError {
    /// Wrap any error as a processing failure.
    pub fn failed(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        HandleError::Failed(Box::new(error))
    }
}

/// Processes records delivered by a [`ConsumerLoop`].
#[async_trait]
pub trait RecordHandler: Send + Sync {
    /// Handle one record.
    async fn handle(&self, record: &Record) -> Result<(), HandleError>;
}

/// What to do with a record's offset after handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Commit; the record will not be delivered again.
    Commit,
    /// Leave uncommitted; the record is redelivered when the session restarts.
    Skip,
}

/// At-least-once delivery, no deduplication.
///
/// - success: commit
/// - malformed payload: commit (marked handled, dropped)
/// - handler failure: skip
#[derive(Debug, Clone, Copy, Default)]
pub struct AtLeastOnce;

impl AtLeastOnce {
    /// Decide the disposition of a handled record.
    #[must_use]
    pub fn disposition(&self, outcome: &Result<(), HandleError>) -> Disposition {
        match outcome {
            Ok(()) | Err(HandleError::Malformed(_)) => Disposition::Commit,
            Err(HandleError::Failed(_)) => Disposition::Skip,
        }
    }
}

/// Consumer loop configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Topics to subscribe to.
    pub topics: Vec<String>,
    /// Pause before rejoining after a failed join.
    pub rejoin_backoff: Duration,
}

impl ConsumerConfig {
    /// Configuration for the given topics with default backoff.
    #[must_use]
    pub fn new<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            topics: topics.into_iter().map(Into::into).collect(),
            rejoin_backoff: Duration::from_secs(1),
        }
    }
}

/// A consumer-group member driving a [`RecordHandler`].
pub struct ConsumerLoop {
    group: Arc<dyn ConsumerGroup>,
    handler: Arc<dyn RecordHandler>,
    policy: AtLeastOnce,
    config: ConsumerConfig,
}

impl ConsumerLoop {
    /// Create a consumer loop.
    #[must_use]
    pub fn new(
        group: Arc<dyn ConsumerGroup>,
        handler: Arc<dyn RecordHandler>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            group,
            handler,
            policy: AtLeastOnce,
            config,
        }
    }

    /// Consume until `cancel` fires or the group is closed.
    ///
    /// Each iteration is one session: join, drain every claim, rejoin. A new
    /// session resumes from the committed offsets, which is when skipped
    /// records are delivered again.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok`; join failures are logged and retried.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), BrokerError> {
        info!(
            group = %self.group.group_id(),
            topics = ?self.config.topics,
            "Consumer starting"
        );

        while !cancel.is_cancelled() {
            let session = cancel.child_token();
            let mut claims = match self.group.join(&self.config.topics, session.clone()).await {
                Ok(claims) => claims,
                Err(BrokerError::Closed) => break,
                Err(e) => {
                    error!(group = %self.group.group_id(), error = %e, "Failed to join group");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.rejoin_backoff) => continue,
                        _ = cancel.cancelled() => break,
                    }
                }
            };

            let mut workers = JoinSet::new();
            let mut accepting = true;
            let mut claimed = 0usize;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    claim = claims.recv(), if accepting => match claim {
                        Some(claim) => {
                            claimed += 1;
                            workers.spawn(drain_claim(
                                claim,
                                self.group.clone(),
                                self.handler.clone(),
                                self.policy,
                                cancel.clone(),
                            ));
                        }
                        None => accepting = false,
                    },
                    joined = workers.join_next(), if !workers.is_empty() => {
                        if let Some(Err(e)) = joined {
                            error!(group = %self.group.group_id(), error = %e, "Partition worker panicked");
                        }
                    }
                }

                if !accepting && workers.is_empty() {
                    break;
                }
            }

            session.cancel();
            workers.shutdown().await;
            debug!(group = %self.group.group_id(), claimed, "Consumer session ended");

            if claimed == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.rejoin_backoff) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }

        info!(group = %self.group.group_id(), "Consumer stopped");
        Ok(())
    }

    /// Leave the group.
    pub async fn close(&self) {
        if let Err(e) = self.group.close().await {
            error!(group = %self.group.group_id(), error = %e, "Error closing consumer");
        }
    }
}

/// Handle one partition's records in order until the claim ends.
async fn drain_claim(
    mut claim: PartitionClaim,
    group: Arc<dyn ConsumerGroup>,
    handler: Arc<dyn RecordHandler>,
    policy: AtLeastOnce,
    cancel: CancellationToken,
) {
    debug!(topic = %claim.topic, partition = claim.partition, "Partition claimed");

    loop {
        let record = tokio::select! {
            record = claim.next() => match record {
                Some(record) => record,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        trace!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            "Record received"
        );

        let outcome = handler.handle(&record).await;
        match &outcome {
            Ok(()) => {}
            Err(HandleError::Malformed(reason)) => {
                warn!(
                    topic = %record.topic,
                    offset = record.offset,
                    reason = %reason,
                    "Dropping malformed record"
                );
            }
            Err(e) => {
                error!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Failed to handle record, offset not committed"
                );
            }
        }

        if policy.disposition(&outcome) == Disposition::Commit {
            if let Err(e) = group.commit(&record).await {
                error!(
                    topic = %record.topic,
                    offset = record.offset,
                    error = %e,
                    "Failed to commit offset"
                );
            }
        }
    }

    debug!(topic = %claim.topic, partition = claim.partition, "Partition released");
}
