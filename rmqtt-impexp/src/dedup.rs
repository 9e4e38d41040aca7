//! Registry of messages already written by an export.
//!
//! Each distinct message is written once and the registry keeps exactly one hold on it until
//! [`MessageSet::release_all`]. Buckets are sorted vectors searched by binary search; the bucket
//! array grows through a fixed table of prime capacities once the load passes 1.2 entries per
//! bucket, and stops growing at the largest capacity.

use crate::broker::MessageRef;
use crate::types::DataId;

const CAPACITIES: [usize; 14] =
    [1_009, 2_003, 4_001, 8_009, 16_001, 32_003, 64_007, 128_021, 256_019, 512_009, 1_024_009, 2_048_003, 4_096_021, 8_192_003];

const LOAD_FACTOR: f64 = 1.2;

struct Entry {
    key: usize,
    data_id: DataId,
    msg: MessageRef,
}

pub(crate) struct MessageSet {
    buckets: Vec<Vec<Entry>>,
    cap_idx: usize,
    count: usize,
    hasher: ahash::RandomState,
}

impl MessageSet {
    pub(crate) fn new() -> Self {
        Self::with_capacity_index(0)
    }

    fn with_capacity_index(cap_idx: usize) -> Self {
        let mut buckets = Vec::with_capacity(CAPACITIES[cap_idx]);
        buckets.resize_with(CAPACITIES[cap_idx], Vec::new);
        MessageSet { buckets, cap_idx, count: 0, hasher: ahash::RandomState::new() }
    }

    #[inline]
    fn bucket_of(&self, key: usize) -> usize {
        (self.hasher.hash_one(key) % self.buckets.len() as u64) as usize
    }

    /// Looks `msg` up by identity. A new message is stored (keeping the hold passed in) and
    /// given a dataId from `next_id`; for a known message the passed hold is released.
    /// Returns the message's dataId and whether it was new.
    pub(crate) fn record_if_new<F>(&mut self, msg: MessageRef, next_id: F) -> (DataId, bool)
    where
        F: FnOnce() -> DataId,
    {
        let key = msg.identity();
        let b = self.bucket_of(key);
        let bucket = &mut self.buckets[b];
        match bucket.binary_search_by_key(&key, |e| e.key) {
            Ok(pos) => {
                let data_id = bucket[pos].data_id;
                msg.release();
                (data_id, false)
            }
            Err(pos) => {
                let data_id = next_id();
                bucket.insert(pos, Entry { key, data_id, msg });
                self.count += 1;
                self.maybe_grow();
                (data_id, true)
            }
        }
    }

    pub(crate) fn data_id(&self, msg: &MessageRef) -> Option<DataId> {
        let key = msg.identity();
        let bucket = &self.buckets[self.bucket_of(key)];
        bucket.binary_search_by_key(&key, |e| e.key).ok().map(|pos| bucket[pos].data_id)
    }

    fn maybe_grow(&mut self) {
        if self.cap_idx + 1 >= CAPACITIES.len() {
            return;
        }
        if (self.count as f64) <= self.buckets.len() as f64 * LOAD_FACTOR {
            return;
        }
        let mut next = Self::with_capacity_index(self.cap_idx + 1);
        next.hasher = self.hasher.clone();
        for entry in self.buckets.drain(..).flatten() {
            let b = next.bucket_of(entry.key);
            let bucket = &mut next.buckets[b];
            let pos = bucket.binary_search_by_key(&entry.key, |e| e.key).unwrap_or_else(|p| p);
            bucket.insert(pos, entry);
        }
        next.count = self.count;
        self.count = 0;
        *self = next;
    }

    #[cfg(test)]
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.buckets.len()
    }

    /// Gives back the hold taken on every registered message. Returns how many were released.
    pub(crate) fn release_all(&mut self) -> usize {
        let mut released = 0;
        for bucket in self.buckets.iter_mut() {
            for entry in bucket.drain(..) {
                entry.msg.release();
                released += 1;
            }
        }
        self.count = 0;
        released
    }
}

impl Drop for MessageSet {
    fn drop(&mut self) {
        if self.count > 0 {
            log::warn!("message set dropped with {} unreleased messages", self.count);
            self.release_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Message;
    use bytes::Bytes;

    fn msg(n: u32) -> MessageRef {
        MessageRef::new(Message {
            qos: 1,
            persistent: true,
            retain: false,
            expiry: 0,
            created: n as i64,
            properties: vec![],
            payload: Bytes::from(n.to_be_bytes().to_vec()),
        })
    }

    #[test]
    fn test_duplicate_releases_extra_hold() {
        let m = msg(1);
        let mut set = MessageSet::new();
        let mut next = 0;
        let (id1, new1) = set.record_if_new(m.acquire(), || {
            next += 1;
            next
        });
        assert!(new1);
        assert_eq!(m.holds(), 2);
        let (id2, new2) = set.record_if_new(m.acquire(), || unreachable!());
        assert!(!new2);
        assert_eq!(id1, id2);
        assert_eq!(m.holds(), 2);
        assert_eq!(set.data_id(&m), Some(id1));
        assert_eq!(set.release_all(), 1);
        assert_eq!(m.holds(), 1);
    }

    #[test]
    fn test_grows_through_primes() {
        let msgs: Vec<MessageRef> = (0..5_000).map(msg).collect();
        let mut set = MessageSet::new();
        let mut next = 0;
        for m in &msgs {
            let (_, new) = set.record_if_new(m.acquire(), || {
                next += 1;
                next
            });
            assert!(new);
        }
        assert_eq!(set.len(), 5_000);
        assert!(set.capacity() >= 4_001);
        assert!(set.len() as f64 <= set.capacity() as f64 * LOAD_FACTOR);
        //every entry still reachable after rehashing
        for (i, m) in msgs.iter().enumerate() {
            assert_eq!(set.data_id(m), Some(i as u64 + 1));
        }
        assert_eq!(set.release_all(), 5_000);
        assert!(msgs.iter().all(|m| m.holds() == 1));
    }

    #[test]
    fn test_capacity_table_ascending() {
        assert!(CAPACITIES.windows(2).all(|w| w[0] < w[1]));
    }
}
