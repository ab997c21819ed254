//! Kafka backend on `rdkafka`.
//!
//! The producer requires acknowledgment from all in-sync replicas. The consumer
//! disables auto-commit; offsets move only through [`ConsumerGroup::commit`].
//! A partition revocation ends the running session so the loop rejoins and
//! Kafka resumes each partition from its committed offset.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::traits::{
    BrokerError, ConsumerGroup, Delivery, InitialOffset, PartitionClaim, Producer, Record,
};

const CLAIM_BUFFER: usize = 64;

/// Kafka connection settings.
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Comma-separated bootstrap servers.
    pub brokers: String,
    /// Consumer group id.
    pub group_id: String,
    /// Where a group without committed offsets starts.
    pub initial_offset: InitialOffset,
    /// Upper bound on a single delivery, including librdkafka's own retries.
    pub message_timeout: Duration,
}

impl KafkaConfig {
    /// Settings for `brokers` and `group_id` with defaults elsewhere.
    #[must_use]
    pub fn new(brokers: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            group_id: group_id.into(),
            initial_offset: InitialOffset::Latest,
            message_timeout: Duration::from_secs(5),
        }
    }
}

/// Kafka producer with `acks=all`.
pub struct KafkaProducer {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaProducer {
    /// Connect a producer.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be created.
    pub fn new(config: &KafkaConfig) -> Result<Self, BrokerError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("acks", "all")
            .set(
                "message.timeout.ms",
                config.message_timeout.as_millis().to_string(),
            )
            .create()
            .map_err(|e| BrokerError::SendFailed(e.to_string()))?;

        info!(brokers = %config.brokers, "Kafka producer created");
        Ok(Self {
            producer,
            timeout: config.message_timeout,
        })
    }
}

#[async_trait]
impl Producer for KafkaProducer {
    async fn send(
        &self,
        topic: &str,
        key: Option<&str>,
        value: &[u8],
    ) -> Result<Delivery, BrokerError> {
        let mut record = FutureRecord::<str, [u8]>::to(topic).payload(value);
        if let Some(key) = key {
            record = record.key(key);
        }

        match self.producer.send(record, Timeout::After(self.timeout)).await {
            Ok((partition, offset)) => Ok(Delivery { partition, offset }),
            Err((e, _)) => Err(BrokerError::SendFailed(e.to_string())),
        }
    }

    async fn close(&self) {
        if let Err(e) = self.producer.flush(Timeout::After(self.timeout)) {
            warn!(error = %e, "Kafka producer flush failed");
        }
    }
}

/// Ends the running session whenever partitions are revoked.
struct RevokeContext {
    generation: watch::Sender<u64>,
}

impl ClientContext for RevokeContext {}

impl ConsumerContext for RevokeContext {
    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(_) => {
                debug!("Kafka partitions revoked");
                self.generation.send_modify(|g| *g += 1);
            }
            Rebalance::Assign(partitions) => {
                debug!(count = partitions.count(), "Kafka partitions assigned");
            }
            Rebalance::Error(e) => warn!(error = %e, "Kafka rebalance error"),
        }
    }
}

/// Kafka consumer-group member with manual commits.
pub struct KafkaConsumerGroup {
    consumer: Arc<StreamConsumer<RevokeContext>>,
    group_id: String,
    subscribed: Mutex<Option<Vec<String>>>,
    generation: watch::Receiver<u64>,
}

impl KafkaConsumerGroup {
    /// Create a consumer in `config.group_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be created.
    pub fn new(config: &KafkaConfig) -> Result<Self, BrokerError> {
        let (generation_tx, generation) = watch::channel(0);
        let reset = match config.initial_offset {
            InitialOffset::Earliest => "earliest",
            InitialOffset::Latest => "latest",
        };

        let consumer: StreamConsumer<RevokeContext> = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", reset)
            .create_with_context(RevokeContext {
                generation: generation_tx,
            })
            .map_err(|e| BrokerError::JoinFailed(e.to_string()))?;

        Ok(Self {
            consumer: Arc::new(consumer),
            group_id: config.group_id.clone(),
            subscribed: Mutex::new(None),
            generation,
        })
    }

    fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError> {
        let mut subscribed = self.subscribed.lock();
        if subscribed.as_deref() == Some(topics) {
            return Ok(());
        }

        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&names)
            .map_err(|e| BrokerError::JoinFailed(e.to_string()))?;
        *subscribed = Some(topics.to_vec());

        info!(group = %self.group_id, topics = ?topics, "Kafka consumer subscribed");
        Ok(())
    }
}

#[async_trait]
impl ConsumerGroup for KafkaConsumerGroup {
    fn group_id(&self) -> &str {
        &self.group_id
    }

    async fn join(
        &self,
        topics: &[String],
        session: CancellationToken,
    ) -> Result<mpsc::Receiver<PartitionClaim>, BrokerError> {
        self.subscribe(topics)?;

        let (claims_tx, claims_rx) = mpsc::channel(CLAIM_BUFFER);
        let mut generation = self.generation.clone();
        generation.borrow_and_update();

        tokio::spawn(pump(self.consumer.clone(), claims_tx, generation, session));
        Ok(claims_rx)
    }

    async fn commit(&self, record: &Record) -> Result<(), BrokerError> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(&record.topic, record.partition, Offset::Offset(record.offset + 1))
            .map_err(|e| BrokerError::CommitFailed(e.to_string()))?;

        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| BrokerError::CommitFailed(e.to_string()))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.consumer.unsubscribe();
        *self.subscribed.lock() = None;
        Ok(())
    }
}

/// Route polled messages to one claim per partition until the session ends.
async fn pump(
    consumer: Arc<StreamConsumer<RevokeContext>>,
    claims: mpsc::Sender<PartitionClaim>,
    mut generation: watch::Receiver<u64>,
    session: CancellationToken,
) {
    let mut routes: HashMap<(String, i32), mpsc::Sender<Record>> = HashMap::new();

    loop {
        let record = tokio::select! {
            _ = session.cancelled() => break,
            _ = generation.changed() => break,
            polled = consumer.recv() => match polled {
                Ok(message) => Record {
                    topic: message.topic().to_string(),
                    partition: message.partition(),
                    offset: message.offset(),
                    key: message.key().map(|k| String::from_utf8_lossy(k).into_owned()),
                    value: Bytes::copy_from_slice(message.payload().unwrap_or_default()),
                },
                Err(e) => {
                    warn!(error = %e, "Kafka poll error");
                    continue;
                }
            },
        };

        let route = match routes.entry((record.topic.clone(), record.partition)) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let (tx, rx) = mpsc::channel(CLAIM_BUFFER);
                let claim = PartitionClaim::new(record.topic.clone(), record.partition, rx);
                if claims.send(claim).await.is_err() {
                    break;
                }
                entry.insert(tx)
            }
        };

        tokio::select! {
            sent = route.send(record) => {
                if sent.is_err() {
                    break;
                }
            }
            _ = session.cancelled() => break,
            _ = generation.changed() => break,
        }
    }

    debug!(partitions = routes.len(), "Kafka session ended");
}
