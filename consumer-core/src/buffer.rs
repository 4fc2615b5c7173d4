//! Staging buffers for one poll cycle: the raw driver records ([`RawMessagesBuffer`]) and
//! the deserialized, per-partition batches built from them ([`MessagesBuffer`]).

use std::collections::BTreeMap;

use crate::driver::DriverRecord;

/// A deserialized, user-facing record. `raw_payload` is kept alongside the deserialized
/// value so a DLQ dispatch can republish the original bytes even if deserialization of a
/// typed view failed upstream (the framework's deserializer is a collaborator; this crate
/// only carries whatever bytes/metadata it was handed).
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub raw_payload: Option<Vec<u8>>,
    pub headers: Vec<(String, Vec<u8>)>,
    pub timestamp_ms: Option<i64>,
}

impl Message {
    pub fn from_record(record: DriverRecord) -> Self {
        Message {
            topic: record.topic,
            partition: record.partition,
            offset: record.offset,
            key: record.key,
            raw_payload: record.payload,
            headers: record.headers,
            timestamp_ms: record.timestamp_ms,
        }
    }
}

/// Ordered, append-only staging area for raw driver records fetched during one poll cycle.
/// Cleared at the start of every cycle.
#[derive(Debug, Default)]
pub struct RawMessagesBuffer {
    records: Vec<DriverRecord>,
}

impl RawMessagesBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: DriverRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Drop every record for a (topic, partition), e.g. once it has been revoked mid-poll.
    pub fn remove_partition(&mut self, topic: &str, partition: i32) {
        self.records
            .retain(|r| !(r.topic == topic && r.partition == partition));
    }

    /// Drop all but the last occurrence of each (topic, partition, offset) triple, in
    /// insertion order. Used to collapse duplicates a rebalance can introduce when a
    /// partition is reassigned mid-poll and redelivered.
    pub fn dedup(&mut self) {
        let mut last_index: BTreeMap<(String, i32, i64), usize> = BTreeMap::new();
        for (i, r) in self.records.iter().enumerate() {
            last_index.insert((r.topic.clone(), r.partition, r.offset), i);
        }
        let mut i = 0;
        self.records.retain(|r| {
            let key = (r.topic.clone(), r.partition, r.offset);
            let keep = last_index.get(&key).copied() == Some(i);
            i += 1;
            keep
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &DriverRecord> {
        self.records.iter()
    }

    /// Consume the buffer into its records, clearing it.
    pub fn drain(&mut self) -> Vec<DriverRecord> {
        std::mem::take(&mut self.records)
    }
}

/// Deserialized message batches keyed by (topic, partition), built from a
/// [`RawMessagesBuffer`] for one poll cycle. Per-partition order is preserved.
#[derive(Debug, Default)]
pub struct MessagesBuffer {
    batches: BTreeMap<(String, i32), Vec<Message>>,
}

impl MessagesBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a raw buffer, draining it. Records already deduplicated by the caller
    /// (typically `Client::batch_poll` calling `RawMessagesBuffer::dedup`) land in the
    /// per-partition batch in the order they were appended.
    pub fn from_raw(raw: &mut RawMessagesBuffer) -> Self {
        let mut buffer = MessagesBuffer::new();
        for record in raw.drain() {
            let key = (record.topic.clone(), record.partition);
            buffer
                .batches
                .entry(key)
                .or_default()
                .push(Message::from_record(record));
        }
        buffer
    }

    pub fn is_empty(&self) -> bool {
        self.batches.values().all(Vec::is_empty)
    }

    pub fn len(&self) -> usize {
        self.batches.values().map(Vec::len).sum()
    }

    pub fn partitions(&self) -> impl Iterator<Item = (&str, i32)> {
        self.batches.keys().map(|(t, p)| (t.as_str(), *p))
    }

    pub fn batch(&self, topic: &str, partition: i32) -> Option<&[Message]> {
        self.batches
            .get(&(topic.to_string(), partition))
            .map(Vec::as_slice)
    }

    /// Iterate every non-empty (topic, partition, batch) in this buffer.
    pub fn iter(&self) -> impl Iterator<Item = (&str, i32, &[Message])> {
        self.batches
            .iter()
            .filter(|(_, msgs)| !msgs.is_empty())
            .map(|((t, p), msgs)| (t.as_str(), *p, msgs.as_slice()))
    }

    pub fn remove_partition(&mut self, topic: &str, partition: i32) -> Option<Vec<Message>> {
        self.batches.remove(&(topic.to_string(), partition))
    }

    pub fn clear(&mut self) {
        self.batches.clear();
    }
}
