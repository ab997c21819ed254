//! Broker abstraction traits.
//!
//! These traits define the interface that broker backends must provide,
//! allowing the relay to be backend-agnostic.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A record read from a topic partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub value: Bytes,
}

/// Where a new group starts reading a partition it has never committed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InitialOffset {
    /// From the beginning of the partition.
    Earliest,
    /// Only records produced after the group joined.
    #[default]
    Latest,
}

/// Acknowledged position of a produced record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
}

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker or client has been closed.
    #[error("Broker closed")]
    Closed,

    /// The operation was cancelled by shutdown.
    #[error("Operation cancelled")]
    Cancelled,

    /// Failed to send a record.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to commit an offset.
    #[error("Commit failed: {0}")]
    CommitFailed(String),

    /// Failed to join the consumer group.
    #[error("Join failed: {0}")]
    JoinFailed(String),

    /// Publishing gave up after the configured number of attempts.
    #[error("Publish to {topic} failed after {attempts} attempts: {source}")]
    Exhausted {
        topic: String,
        attempts: u32,
        #[source]
        source: Box<BrokerError>,
    },
}

impl BrokerError {
    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::SendFailed(_) | BrokerError::CommitFailed(_) | BrokerError::JoinFailed(_)
        )
    }
}

/// One partition assigned to this member for the duration of a session.
///
/// The claim ends (yields `None`) when the session ends.
#[derive(Debug)]
pub struct PartitionClaim {
    pub topic: String,
    pub partition: i32,
    records: mpsc::Receiver<Record>,
}

impl PartitionClaim {
    /// Create a claim over a record stream.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: i32, records: mpsc::Receiver<Record>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            records,
        }
    }

    /// Next record in partition order.
    pub async fn next(&mut self) -> Option<Record> {
        self.records.recv().await
    }
}

/// A broker producer.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Publish `value` to `topic`.
    ///
    /// Records with the same key land on the same partition.
    async fn send(&self, topic: &str, key: Option<&str>, value: &[u8])
        -> Result<Delivery, BrokerError>;

    /// Flush and release the producer.
    async fn close(&self) {}
}

/// A member of a consumer group.
#[async_trait]
pub trait ConsumerGroup: Send + Sync {
    /// The group name.
    fn group_id(&self) -> &str;

    /// Join the group and start a consumption session over `topics`.
    ///
    /// Claims arrive on the returned channel as partitions are assigned.
    /// The session ends when the broker ends it (every claim yields `None`)
    /// or when `session` is cancelled.
    async fn join(
        &self,
        topics: &[String],
        session: CancellationToken,
    ) -> Result<mpsc::Receiver<PartitionClaim>, BrokerError>;

    /// Commit `record` as processed; the group resumes after it.
    async fn commit(&self, record: &Record) -> Result<(), BrokerError>;

    /// Leave the group.
    async fn close(&self) -> Result<(), BrokerError>;
}
