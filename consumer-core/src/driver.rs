//! The native driver contract consumed by [`crate::client::Client`], modeled as the
//! [`KafkaDriver`] trait so the rest of the core never names `rdkafka` directly (and so
//! tests can swap in [`crate::testing::FakeDriver`]).

use std::collections::BTreeMap;
use std::time::Duration;

use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Headers};
use rdkafka::{ClientConfig, Message as _, Offset as RdOffset, TopicPartitionList};

use crate::error::DriverErrorKind;
use crate::rebalance::RebalanceContext;

/// One raw record handed back by [`KafkaDriver::poll`].
#[derive(Debug, Clone)]
pub struct DriverRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub headers: Vec<(String, Vec<u8>)>,
    pub timestamp_ms: Option<i64>,
}

impl From<&BorrowedMessage<'_>> for DriverRecord {
    fn from(msg: &BorrowedMessage<'_>) -> Self {
        let headers = msg
            .headers()
            .map(|hs| {
                hs.iter()
                    .map(|h| (h.key.to_string(), h.value.unwrap_or(&[]).to_vec()))
                    .collect()
            })
            .unwrap_or_default();
        DriverRecord {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key: msg.key().map(|k| k.to_vec()),
            payload: msg.payload().map(|p| p.to_vec()),
            headers,
            timestamp_ms: msg.timestamp().to_millis(),
        }
    }
}

/// A minimal, owned stand-in for the record the driver needs back to perform an
/// operation on (seek/store_offset) without re-borrowing the original `rdkafka` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// A requested seek target: an explicit offset or a timestamp to resolve via
/// `offsets_for_times`.
#[derive(Debug, Clone, Copy)]
pub enum SeekOffset {
    Exact(i64),
    /// Kafka's "latest" sentinel.
    Latest,
    Timestamp(i64),
}

/// Topic/partition pairs, independent of `rdkafka::TopicPartitionList` so the trait doesn't
/// leak the driver's own type into callers that don't otherwise need `rdkafka`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tpl(pub Vec<(String, i32)>);

impl Tpl {
    pub fn new() -> Self {
        Tpl(Vec::new())
    }

    pub fn push(&mut self, topic: impl Into<String>, partition: i32) {
        self.0.push((topic.into(), partition));
    }

    pub fn contains(&self, topic: &str, partition: i32) -> bool {
        self.0.iter().any(|(t, p)| t == topic && *p == partition)
    }
}

/// The contract the core requires of a Kafka driver: poll/pause/resume/seek/commit/
/// store_offset/assignment plus rebalance visibility. `RdKafkaDriver` is the production
/// implementation; `FakeDriver` (behind `test-util`) backs unit and scenario tests.
pub trait KafkaDriver: Send + Sync {
    fn subscribe(&self, topics: &[String]) -> Result<(), KafkaError>;

    /// Poll once for up to `timeout`. Returns `Ok(None)` on a timeout with nothing ready.
    fn poll(&self, timeout: Duration) -> Result<Option<DriverRecord>, KafkaError>;

    fn pause(&self, tpl: &Tpl) -> Result<(), KafkaError>;
    fn resume(&self, tpl: &Tpl) -> Result<(), KafkaError>;
    fn seek(&self, msg: &MessageRef, offset: SeekOffset) -> Result<(), KafkaError>;

    fn store_offset(&self, msg: &MessageRef) -> Result<(), KafkaError>;
    fn commit(&self, tpl: Option<&Tpl>, r#async: bool) -> Result<(), KafkaError>;

    fn assignment(&self) -> Tpl;
    fn assignment_lost(&self) -> bool;

    /// Resolve timestamps to offsets for each entry in `tpl`, bounded by `timeout`. Returns
    /// `None` for an entry with no resolvable offset.
    fn offsets_for_times(
        &self,
        tpl: &[(String, i32, i64)],
        timeout: Duration,
    ) -> Result<Vec<(String, i32, Option<i64>)>, KafkaError>;

    fn unsubscribe(&self);
    fn close(&self);
    fn name(&self) -> &str;

    /// Snapshot of rebalance state published by the driver's internal thread; `None` for
    /// drivers that never rebalance (e.g. a standalone `FakeDriver` in non-rebalance tests).
    fn rebalance_snapshot(&self) -> crate::rebalance::RebalanceSnapshot;

    /// Reset only the `changed` flag so the next `batch_poll` can detect a fresh rebalance;
    /// leaves the accumulated revoked/lost partitions untouched.
    fn clear_rebalance_changed(&self);

    /// Drop the revoked/lost partitions once the listener has turned them into revocation
    /// jobs. Must not be called until those jobs are built, or the revocation is lost.
    fn clear_rebalance_revocations(&self);
}

/// Translates an `rdkafka::error::KafkaError` into the core's [`DriverErrorKind`].
pub fn classify_kafka_error(err: &KafkaError) -> DriverErrorKind {
    use rdkafka::error::RDKafkaErrorCode as Code;
    let Some(code) = err.rdkafka_error_code() else {
        return DriverErrorKind::Other;
    };
    match code {
        Code::AssignmentLost => DriverErrorKind::AssignmentLost,
        Code::UnknownMemberId => DriverErrorKind::UnknownMemberId,
        Code::NoOffset => DriverErrorKind::NoOffset,
        Code::CoordinatorLoadInProgress => DriverErrorKind::CoordinatorLoadInProgress,
        Code::NetworkException => DriverErrorKind::NetworkException,
        Code::TransportError => DriverErrorKind::Transport,
        Code::MaxPollExceeded => DriverErrorKind::MaxPollExceeded,
        Code::UnknownTopicOrPartition => DriverErrorKind::UnknownTopicOrPart,
        _ => DriverErrorKind::Other,
    }
}

/// Production driver backed by `rdkafka::consumer::BaseConsumer`. `poll`/`pause`/etc. are
/// thin, synchronous translations; the rebalance callbacks are wired through
/// [`RebalanceContext`] at construction so the driver's internal thread never calls back
/// into user code directly.
pub struct RdKafkaDriver {
    consumer: BaseConsumer<RebalanceContext>,
    name: String,
}

impl RdKafkaDriver {
    pub fn new(
        kafka_config: &BTreeMap<String, String>,
        client_id: &str,
    ) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        for (k, v) in kafka_config {
            client_config.set(k, v);
        }
        client_config.set("client.id", client_id);
        let context = RebalanceContext::new();
        let consumer: BaseConsumer<RebalanceContext> =
            client_config.create_with_context(context)?;
        Ok(Self {
            consumer,
            name: client_id.to_string(),
        })
    }

    fn to_rd_tpl(tpl: &Tpl) -> TopicPartitionList {
        let mut out = TopicPartitionList::new();
        for (topic, partition) in &tpl.0 {
            out.add_partition(topic, *partition);
        }
        out
    }
}

impl KafkaDriver for RdKafkaDriver {
    fn subscribe(&self, topics: &[String]) -> Result<(), KafkaError> {
        let refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&refs)
    }

    fn poll(&self, timeout: Duration) -> Result<Option<DriverRecord>, KafkaError> {
        match self.consumer.poll(timeout) {
            None => Ok(None),
            Some(Ok(msg)) => Ok(Some(DriverRecord::from(&msg))),
            Some(Err(e)) => Err(e),
        }
    }

    fn pause(&self, tpl: &Tpl) -> Result<(), KafkaError> {
        self.consumer.pause(&Self::to_rd_tpl(tpl))
    }

    fn resume(&self, tpl: &Tpl) -> Result<(), KafkaError> {
        self.consumer.resume(&Self::to_rd_tpl(tpl))
    }

    fn seek(&self, msg: &MessageRef, offset: SeekOffset) -> Result<(), KafkaError> {
        let rd_offset = match offset {
            SeekOffset::Exact(o) => RdOffset::Offset(o),
            SeekOffset::Latest => RdOffset::End,
            SeekOffset::Timestamp(_) => {
                unreachable!("timestamp offsets are resolved before calling seek")
            }
        };
        self.consumer
            .seek(&msg.topic, msg.partition, rd_offset, Duration::from_secs(5))
    }

    fn store_offset(&self, msg: &MessageRef) -> Result<(), KafkaError> {
        self.consumer
            .store_offset(&msg.topic, msg.partition, msg.offset)
    }

    fn commit(&self, tpl: Option<&Tpl>, r#async: bool) -> Result<(), KafkaError> {
        use rdkafka::consumer::CommitMode;
        let mode = if r#async {
            CommitMode::Async
        } else {
            CommitMode::Sync
        };
        match tpl {
            Some(t) => self.consumer.commit(&Self::to_rd_tpl(t), mode),
            None => self.consumer.commit_consumer_state(mode),
        }
    }

    fn assignment(&self) -> Tpl {
        match self.consumer.assignment() {
            Ok(list) => Tpl(
                list.elements()
                    .iter()
                    .map(|e| (e.topic().to_string(), e.partition()))
                    .collect(),
            ),
            Err(_) => Tpl::new(),
        }
    }

    fn assignment_lost(&self) -> bool {
        self.consumer.assignment_lost()
    }

    fn offsets_for_times(
        &self,
        tpl: &[(String, i32, i64)],
        timeout: Duration,
    ) -> Result<Vec<(String, i32, Option<i64>)>, KafkaError> {
        let mut list = TopicPartitionList::new();
        for (topic, partition, ts) in tpl {
            let mut tple = list.add_partition(topic, *partition);
            tple.set_offset(RdOffset::Offset(*ts))
                .expect("millisecond timestamp fits in rdkafka's offset representation");
        }
        let resolved = self.consumer.offsets_for_times(list, timeout)?;
        Ok(resolved
            .elements()
            .iter()
            .map(|e| {
                let offset = match e.offset() {
                    RdOffset::Offset(o) if o >= 0 => Some(o),
                    _ => None,
                };
                (e.topic().to_string(), e.partition(), offset)
            })
            .collect())
    }

    fn unsubscribe(&self) {
        self.consumer.unsubscribe();
    }

    fn close(&self) {
        // BaseConsumer has no explicit close; dropping releases the underlying client.
        // We unsubscribe first so in-flight rebalance callbacks settle before the drop.
        self.consumer.unsubscribe();
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn rebalance_snapshot(&self) -> crate::rebalance::RebalanceSnapshot {
        self.consumer.context().manager().snapshot()
    }

    fn clear_rebalance_changed(&self) {
        self.consumer.context().manager().clear_changed();
    }

    fn clear_rebalance_revocations(&self) {
        self.consumer.context().manager().clear_revocations();
    }
}
