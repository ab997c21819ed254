//! In-process partitioned broker.
//!
//! Topics are created on first use with a fixed number of partitions. Each
//! partition is an append-only log; consumer groups track their committed
//! offset per partition and resume from it whenever a new session starts.
//! [`MemoryBroker::rebalance`] ends every running session, which is how
//! uncommitted records get delivered again.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::traits::{
    BrokerError, ConsumerGroup, Delivery, InitialOffset, PartitionClaim, Producer, Record,
};

/// Per-claim buffer between the partition feeder and its worker.
const CLAIM_BUFFER: usize = 64;

struct Partition {
    log: Mutex<Vec<Record>>,
    /// Log length, bumped on every append.
    len: watch::Sender<i64>,
}

impl Partition {
    fn new() -> Self {
        let (len, _) = watch::channel(0);
        Self {
            log: Mutex::new(Vec::new()),
            len,
        }
    }

    fn append(&self, topic: &str, partition: i32, key: Option<&str>, value: &[u8]) -> i64 {
        let mut log = self.log.lock();
        let offset = log.len() as i64;
        log.push(Record {
            topic: topic.to_string(),
            partition,
            offset,
            key: key.map(str::to_string),
            value: Bytes::copy_from_slice(value),
        });
        self.len.send_replace(offset + 1);
        offset
    }

    fn read_from(&self, offset: i64) -> Vec<Record> {
        let log = self.log.lock();
        let start = usize::try_from(offset).unwrap_or(0).min(log.len());
        log[start..].to_vec()
    }

    fn end(&self) -> i64 {
        self.log.lock().len() as i64
    }
}

struct Topic {
    partitions: Vec<Arc<Partition>>,
}

type CommitKey = (String, String, i32);

struct Inner {
    partitions: usize,
    topics: DashMap<String, Arc<Topic>>,
    /// Next offset to read, per (group, topic, partition).
    committed: DashMap<CommitKey, i64>,
    generation: watch::Sender<u64>,
    round_robin: AtomicUsize,
    shutdown: CancellationToken,
}

impl Inner {
    fn topic(&self, name: &str) -> Arc<Topic> {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(topic = %name, partitions = self.partitions, "Topic created");
                Arc::new(Topic {
                    partitions: (0..self.partitions).map(|_| Arc::new(Partition::new())).collect(),
                })
            })
            .clone()
    }

    fn select_partition(&self, key: Option<&str>) -> usize {
        match key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % self.partitions as u64) as usize
            }
            None => self.round_robin.fetch_add(1, Ordering::Relaxed) % self.partitions,
        }
    }
}

/// An in-process broker shared by producers and consumer groups.
///
/// Cloning is cheap; all clones share the same topics and offsets.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    /// Create a broker whose topics have `partitions` partitions (at least one).
    #[must_use]
    pub fn new(partitions: usize) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                partitions: partitions.max(1),
                topics: DashMap::new(),
                committed: DashMap::new(),
                generation,
                round_robin: AtomicUsize::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Create a member of consumer group `group_id`.
    #[must_use]
    pub fn consumer_group(
        &self,
        group_id: impl Into<String>,
        initial: InitialOffset,
    ) -> MemoryConsumerGroup {
        MemoryConsumerGroup {
            inner: self.inner.clone(),
            group_id: group_id.into(),
            initial,
        }
    }

    /// End every running consumption session.
    ///
    /// Members rejoin and resume from their committed offsets.
    pub fn rebalance(&self) {
        self.inner.generation.send_modify(|g| *g += 1);
        info!("Memory broker rebalance");
    }

    /// Committed position (next offset to read) of a group on a partition.
    #[must_use]
    pub fn committed(&self, group_id: &str, topic: &str, partition: i32) -> Option<i64> {
        self.inner
            .committed
            .get(&(group_id.to_string(), topic.to_string(), partition))
            .map(|offset| *offset)
    }

    /// Every record of `topic`, partition by partition.
    #[must_use]
    pub fn records(&self, topic: &str) -> Vec<Record> {
        match self.inner.topics.get(topic) {
            Some(topic) => topic
                .partitions
                .iter()
                .flat_map(|partition| partition.read_from(0))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Close the broker; sessions end and further calls fail with `Closed`.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }

    /// Check if the broker has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl Producer for MemoryBroker {
    async fn send(
        &self,
        topic: &str,
        key: Option<&str>,
        value: &[u8],
    ) -> Result<Delivery, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }

        let index = self.inner.select_partition(key);
        let partition = index as i32;
        let offset = self.inner.topic(topic).partitions[index].append(topic, partition, key, value);

        Ok(Delivery { partition, offset })
    }

    async fn close(&self) {}
}

/// A consumer-group member on a [`MemoryBroker`].
pub struct MemoryConsumerGroup {
    inner: Arc<Inner>,
    group_id: String,
    initial: InitialOffset,
}

impl MemoryConsumerGroup {
    /// Resolve the start offset, pinning it as committed on first join.
    fn start_offset(&self, topic: &str, index: usize, partition: &Partition) -> i64 {
        let key = (self.group_id.clone(), topic.to_string(), index as i32);
        *self
            .inner
            .committed
            .entry(key)
            .or_insert_with(|| match self.initial {
                InitialOffset::Earliest => 0,
                InitialOffset::Latest => partition.end(),
            })
    }
}

#[async_trait]
impl ConsumerGroup for MemoryConsumerGroup {
    fn group_id(&self) -> &str {
        &self.group_id
    }

    async fn join(
        &self,
        topics: &[String],
        session: CancellationToken,
    ) -> Result<mpsc::Receiver<PartitionClaim>, BrokerError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(BrokerError::Closed);
        }

        let (claims_tx, claims_rx) = mpsc::channel(topics.len() * self.inner.partitions + 1);

        for name in topics {
            let topic = self.inner.topic(name);
            for (index, partition) in topic.partitions.iter().enumerate() {
                let start = self.start_offset(name, index, partition);
                let (records_tx, records_rx) = mpsc::channel(CLAIM_BUFFER);

                claims_tx
                    .try_send(PartitionClaim::new(name.clone(), index as i32, records_rx))
                    .map_err(|e| BrokerError::JoinFailed(e.to_string()))?;

                tokio::spawn(feed_partition(
                    partition.clone(),
                    start,
                    records_tx,
                    self.inner.generation.subscribe(),
                    session.clone(),
                    self.inner.shutdown.clone(),
                ));
            }
        }

        debug!(group = %self.group_id, topics = ?topics, "Joined memory group");
        Ok(claims_rx)
    }

    async fn commit(&self, record: &Record) -> Result<(), BrokerError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(BrokerError::Closed);
        }
        self.inner.committed.insert(
            (self.group_id.clone(), record.topic.clone(), record.partition),
            record.offset + 1,
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

/// Push a partition's records into a claim until the session ends.
async fn feed_partition(
    partition: Arc<Partition>,
    mut next: i64,
    records: mpsc::Sender<Record>,
    mut generation: watch::Receiver<u64>,
    session: CancellationToken,
    shutdown: CancellationToken,
) {
    generation.borrow_and_update();
    let mut len = partition.len.subscribe();

    loop {
        for record in partition.read_from(next) {
            tokio::select! {
                sent = records.send(record) => {
                    if sent.is_err() {
                        return;
                    }
                    next += 1;
                }
                _ = generation.changed() => return,
                _ = session.cancelled() => return,
                _ = shutdown.cancelled() => return,
            }
        }

        tokio::select! {
            changed = len.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = generation.changed() => return,
            _ = session.cancelled() => return,
            _ = shutdown.cancelled() => return,
            _ = records.closed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{ConsumerConfig, ConsumerLoop, HandleError, RecordHandler};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next_record(claim: &mut PartitionClaim) -> Record {
        timeout(Duration::from_secs(1), claim.next())
            .await
            .expect("record not delivered")
            .expect("claim ended")
    }

    #[tokio::test]
    async fn test_same_key_same_partition() {
        let broker = MemoryBroker::new(8);
        let first = broker.send("signal", Some("s1"), b"a").await.unwrap();
        let second = broker.send("signal", Some("s1"), b"b").await.unwrap();

        assert_eq!(first.partition, second.partition);
        assert_eq!(second.offset, first.offset + 1);
        assert_eq!(broker.records("signal").len(), 2);
    }

    #[tokio::test]
    async fn test_earliest_delivers_existing_records() {
        let broker = MemoryBroker::new(1);
        broker.send("signal", None, b"one").await.unwrap();

        let group = broker.consumer_group("g", InitialOffset::Earliest);
        let mut claims = group
            .join(&["signal".to_string()], CancellationToken::new())
            .await
            .unwrap();
        let mut claim = claims.recv().await.unwrap();

        assert_eq!(next_record(&mut claim).await.value, Bytes::from_static(b"one"));

        broker.send("signal", None, b"two").await.unwrap();
        assert_eq!(next_record(&mut claim).await.offset, 1);
    }

    #[tokio::test]
    async fn test_latest_skips_existing_records() {
        let broker = MemoryBroker::new(1);
        broker.send("signal", None, b"old").await.unwrap();

        let group = broker.consumer_group("g", InitialOffset::Latest);
        let mut claims = group
            .join(&["signal".to_string()], CancellationToken::new())
            .await
            .unwrap();
        let mut claim = claims.recv().await.unwrap();
        assert_eq!(broker.committed("g", "signal", 0), Some(1));

        broker.send("signal", None, b"new").await.unwrap();
        assert_eq!(next_record(&mut claim).await.value, Bytes::from_static(b"new"));
    }

    #[tokio::test]
    async fn test_rebalance_resumes_from_commit() {
        let broker = MemoryBroker::new(1);
        for value in [b"a", b"b", b"c"] {
            broker.send("signal", None, value).await.unwrap();
        }

        let group = broker.consumer_group("g", InitialOffset::Earliest);
        let topics = vec!["signal".to_string()];

        let mut claims = group.join(&topics, CancellationToken::new()).await.unwrap();
        let mut claim = claims.recv().await.unwrap();
        let first = next_record(&mut claim).await;
        group.commit(&first).await.unwrap();
        let _uncommitted = next_record(&mut claim).await;

        broker.rebalance();
        // Drain whatever was buffered before the feeder stopped.
        while timeout(Duration::from_secs(1), claim.next())
            .await
            .expect("claim did not end")
            .is_some()
        {}

        let mut claims = group.join(&topics, CancellationToken::new()).await.unwrap();
        let mut claim = claims.recv().await.unwrap();
        assert_eq!(next_record(&mut claim).await.offset, 1);
    }

    #[tokio::test]
    async fn test_closed_broker_rejects() {
        let broker = MemoryBroker::new(1);
        broker.close();

        assert!(matches!(
            broker.send("signal", None, b"x").await,
            Err(BrokerError::Closed)
        ));
        let group = broker.consumer_group("g", InitialOffset::Earliest);
        assert!(matches!(
            group.join(&["signal".to_string()], CancellationToken::new()).await,
            Err(BrokerError::Closed)
        ));
    }

    /// Fails the first delivery of every offset, succeeds afterwards.
    struct FailFirst {
        seen: Mutex<Vec<i64>>,
        delivered: mpsc::UnboundedSender<i64>,
    }

    #[async_trait]
    impl RecordHandler for FailFirst {
        async fn handle(&self, record: &Record) -> Result<(), HandleError> {
            let first_time = {
                let mut seen = self.seen.lock();
                let first_time = !seen.contains(&record.offset);
                seen.push(record.offset);
                first_time
            };
            let _ = self.delivered.send(record.offset);
            if first_time {
                Err(HandleError::Failed("transient".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_failed_record_is_redelivered() {
        let broker = MemoryBroker::new(1);
        broker.send("signal", Some("s1"), b"candidate").await.unwrap();

        let (delivered_tx, mut delivered) = mpsc::unbounded_channel();
        let handler = Arc::new(FailFirst {
            seen: Mutex::new(Vec::new()),
            delivered: delivered_tx,
        });
        let group = Arc::new(broker.consumer_group("relay", InitialOffset::Earliest));
        let consumer = Arc::new(ConsumerLoop::new(
            group,
            handler,
            ConsumerConfig::new(["signal"]),
        ));

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let consumer = consumer.clone();
            let cancel = cancel.clone();
            async move { consumer.run(cancel).await }
        });

        let wait = Duration::from_secs(2);
        assert_eq!(timeout(wait, delivered.recv()).await.unwrap(), Some(0));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.committed("relay", "signal", 0), Some(0));

        broker.rebalance();
        assert_eq!(timeout(wait, delivered.recv()).await.unwrap(), Some(0));

        timeout(wait, async {
            while broker.committed("relay", "signal", 0) != Some(1) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    struct Malformed;

    #[async_trait]
    impl RecordHandler for Malformed {
        async fn handle(&self, _record: &Record) -> Result<(), HandleError> {
            Err(HandleError::Malformed("not json".into()))
        }
    }

    #[tokio::test]
    async fn test_malformed_record_is_committed() {
        let broker = MemoryBroker::new(1);
        broker.send("signal", None, b"{").await.unwrap();

        let group = Arc::new(broker.consumer_group("relay", InitialOffset::Earliest));
        let consumer = ConsumerLoop::new(group, Arc::new(Malformed), ConsumerConfig::new(["signal"]));
        let cancel = CancellationToken::new();

        let run = consumer.run(cancel.clone());
        let check = async {
            timeout(Duration::from_secs(2), async {
                while broker.committed("relay", "signal", 0) != Some(1) {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap();
            cancel.cancel();
        };

        let (result, ()) = tokio::join!(run, check);
        result.unwrap();
    }
}
