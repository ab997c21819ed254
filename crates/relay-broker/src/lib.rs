//! # relay-broker
//!
//! Broker abstraction layer for the signal relay.
//!
//! The relay talks to a topic-partitioned broker through two seams:
//!
//! - **Producer** - publish a value to a topic, optionally keyed
//! - **ConsumerGroup** - join a group and receive one claim per partition
//!
//! On top of those, this crate provides the delivery policy the relay relies on:
//!
//! - [`RetryingProducer`] - bounded retry; failure after the last attempt is
//!   returned to the caller
//! - [`ConsumerLoop`] - one worker per partition, offsets committed only as
//!   decided by [`AtLeastOnce`]
//!
//! ## Redelivery contract
//!
//! A record whose handler fails is not committed. When the consumption session
//! ends (rebalance, restart) the group resumes from the last committed offset,
//! so the record is delivered again. Commits are cumulative per partition: a
//! later record that succeeds in the same partition moves the offset past the
//! failed one. Handlers must therefore tolerate duplicates; nothing here
//! deduplicates.
//!
//! ```rust,ignore
//! use relay_broker::{ConsumerLoop, ConsumerConfig, MemoryBroker};
//!
//! let broker = MemoryBroker::new(4);
//! let group = broker.consumer_group("relay", InitialOffset::Earliest);
//! let consumer = ConsumerLoop::new(Arc::new(group), handler, ConsumerConfig::new(["rtc-signal-topic"]));
//! consumer.run(cancel).await?;
//! ```

pub mod consumer;
pub mod retry;
pub mod traits;

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "kafka")]
pub mod kafka;

pub use consumer::{
    AtLeastOnce, ConsumerConfig, ConsumerLoop, Disposition, HandleError, RecordHandler,
};
pub use retry::{ProducerConfig, RetryingProducer};
pub use traits::{BrokerError, ConsumerGroup, Delivery, InitialOffset, PartitionClaim, Producer, Record};

#[cfg(feature = "memory")]
pub use memory::{MemoryBroker, MemoryConsumerGroup};

#[cfg(feature = "kafka")]
pub use kafka::{KafkaConfig, KafkaConsumerGroup, KafkaProducer};
