//! Fan-out strategy mapping one (topic, partition) batch to one or more (virtual group,
//! sub-batch) pairs (§4.8 step 4, glossary "virtual partition"). Preserves per-partition
//! commit-boundary ordering: every message still belongs to exactly one Kafka partition, so
//! `mark_as_consumed` semantics are untouched by how a batch was fanned out in-process.

use crate::buffer::Message;
use crate::executor::VirtualGroupId;

/// One virtual sub-batch: a group id (`None` when virtual partitioning is off for the
/// topic) paired with the messages routed to it, in original order.
pub struct VirtualBatch {
    pub virtual_group: VirtualGroupId,
    pub messages: Vec<Message>,
}

/// Maps a partition's batch to one or more virtual sub-batches. Implementations must keep
/// every message's relative order intact within its sub-batch (no reordering a single
/// partition's per-offset delivery order).
pub trait VirtualPartitioner: Send + Sync {
    fn partition(&self, topic: &str, partition: i32, messages: &[Message]) -> Vec<VirtualBatch>;
}

/// No fan-out: the whole batch is one virtual group (`None`), i.e. plain Kafka-partition
/// granularity. Used for every topic without `virtual_partitions` set.
#[derive(Default)]
pub struct IdentityPartitioner;

impl IdentityPartitioner {
    pub fn new() -> Self {
        Self
    }
}

impl VirtualPartitioner for IdentityPartitioner {
    fn partition(&self, _topic: &str, _partition: i32, messages: &[Message]) -> Vec<VirtualBatch> {
        vec![VirtualBatch {
            virtual_group: None,
            messages: messages.to_vec(),
        }]
    }
}

/// Splits a batch into `n` virtual groups by hashing the message key (falling back to
/// round-robin by index when a message has no key), matching the common "fan out within a
/// partition while keeping same-key messages together" partitioner shape.
pub struct KeyHashPartitioner {
    groups: usize,
}

impl KeyHashPartitioner {
    pub fn new(groups: usize) -> Self {
        assert!(groups > 0, "virtual partition count must be > 0");
        KeyHashPartitioner { groups }
    }

    fn group_for(&self, index: usize, key: Option<&[u8]>) -> usize {
        match key {
            Some(k) if !k.is_empty() => {
                let mut hash: u64 = 0xcbf29ce484222325;
                for byte in k {
                    hash ^= u64::from(*byte);
                    hash = hash.wrapping_mul(0x100000001b3);
                }
                (hash as usize) % self.groups
            }
            _ => index % self.groups,
        }
    }
}

impl VirtualPartitioner for KeyHashPartitioner {
    fn partition(&self, _topic: &str, _partition: i32, messages: &[Message]) -> Vec<VirtualBatch> {
        let mut groups: Vec<Vec<Message>> = (0..self.groups).map(|_| Vec::new()).collect();
        for (i, msg) in messages.iter().enumerate() {
            let group = self.group_for(i, msg.key.as_deref());
            groups[group].push(msg.clone());
        }
        groups
            .into_iter()
            .enumerate()
            .filter(|(_, msgs)| !msgs.is_empty())
            .map(|(group, msgs)| VirtualBatch {
                virtual_group: Some(format!("vg{group}")),
                messages: msgs,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(offset: i64, key: Option<&[u8]>) -> Message {
        Message {
            topic: "t".into(),
            partition: 0,
            offset,
            key: key.map(|k| k.to_vec()),
            raw_payload: None,
            headers: Vec::new(),
            timestamp_ms: None,
        }
    }

    #[test]
    fn identity_partitioner_yields_one_batch() {
        let p = IdentityPartitioner::new();
        let messages = vec![msg(0, None), msg(1, None)];
        let batches = p.partition("t", 0, &messages);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].virtual_group, None);
        assert_eq!(batches[0].messages.len(), 2);
    }

    #[test]
    fn key_hash_partitioner_routes_same_key_to_same_group() {
        let p = KeyHashPartitioner::new(4);
        let messages = vec![
            msg(0, Some(b"a")),
            msg(1, Some(b"a")),
            msg(2, Some(b"a")),
        ];
        let batches = p.partition("t", 0, &messages);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].messages.len(), 3);
    }

    #[test]
    fn key_hash_partitioner_falls_back_to_round_robin_without_key() {
        let p = KeyHashPartitioner::new(2);
        let messages = vec![msg(0, None), msg(1, None)];
        let batches = p.partition("t", 0, &messages);
        let total: usize = batches.iter().map(|b| b.messages.len()).sum();
        assert_eq!(total, 2);
    }
}
