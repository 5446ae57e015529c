use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rollup_common::UnixTimestamp;

use crate::ingest::{Batch, Ingest, IngestError, Receipt};
use crate::protocol::Sample;

/// Seconds a popped batch stays leased before it is handed out again.
pub const DEFAULT_LEASE: u64 = 300;

#[derive(Debug)]
struct Item {
    seq: u64,
    enqueued_at: UnixTimestamp,
    sample: Sample,
}

#[derive(Debug)]
struct Leased {
    popped_at: UnixTimestamp,
    item: Item,
}

#[derive(Debug, Default)]
struct Queue {
    next_seq: u64,
    items: VecDeque<Item>,
    in_flight: BTreeMap<u64, Leased>,
}

impl Queue {
    /// Moves leases that expired at `now` back to the front of the queue.
    fn requeue_expired(&mut self, now: UnixTimestamp, lease: u64) {
        let expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, leased)| leased.popped_at.add_secs(lease) <= now)
            .map(|(seq, _)| *seq)
            .collect();

        // Leased items are always older than queued ones, so pushing them to the front in
        // reverse keeps the queue ordered by sequence number.
        for seq in expired.into_iter().rev() {
            if let Some(leased) = self.in_flight.remove(&seq) {
                self.items.push_front(leased.item);
            }
        }
    }
}

/// An in-process FIFO queue.
///
/// Clones share the same queue, so a recorder and a digester in the same process can be handed
/// separate clones. Popped samples are leased to the popper: other pops skip them until the
/// lease expires, after which unacknowledged samples are delivered again.
#[derive(Clone, Debug)]
pub struct MemoryIngest {
    queue: Arc<Mutex<Queue>>,
    lease: u64,
}

impl Default for MemoryIngest {
    fn default() -> Self {
        Self::with_lease(DEFAULT_LEASE)
    }
}

impl MemoryIngest {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty queue whose leases last `lease` seconds.
    pub fn with_lease(lease: u64) -> Self {
        Self {
            queue: Arc::default(),
            lease,
        }
    }

    /// Returns the number of samples not yet acknowledged, including leased ones.
    pub fn len(&self) -> usize {
        let queue = self.queue.lock();
        queue.items.len() + queue.in_flight.len()
    }

    /// Returns `true` if all samples have been acknowledged.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push_at(&self, samples: Vec<Sample>, enqueued_at: UnixTimestamp) {
        let mut queue = self.queue.lock();

        for sample in samples {
            let seq = queue.next_seq;
            queue.next_seq += 1;
            queue.items.push_back(Item {
                seq,
                enqueued_at,
                sample,
            });
        }
    }

    fn pop_at(&self, max: usize, now: UnixTimestamp) -> Batch {
        let mut queue = self.queue.lock();
        queue.requeue_expired(now, self.lease);

        let count = max.min(queue.items.len());
        let mut seqs = Vec::with_capacity(count);
        let mut samples = Vec::with_capacity(count);

        for item in queue.items.drain(..count).collect::<Vec<_>>() {
            seqs.push(item.seq);
            samples.push(item.sample.clone());
            queue.in_flight.insert(
                item.seq,
                Leased {
                    popped_at: now,
                    item,
                },
            );
        }

        Batch {
            samples,
            receipt: Receipt::Memory(seqs),
        }
    }
}

#[async_trait]
impl Ingest for MemoryIngest {
    async fn push(&self, samples: Vec<Sample>) -> Result<(), IngestError> {
        self.push_at(samples, UnixTimestamp::now());
        Ok(())
    }

    async fn pop_batch(&self, max: usize) -> Result<Batch, IngestError> {
        Ok(self.pop_at(max, UnixTimestamp::now()))
    }

    async fn ack(&self, receipt: Receipt) -> Result<(), IngestError> {
        let Receipt::Memory(seqs) = receipt else {
            return Ok(());
        };

        let mut queue = self.queue.lock();
        for seq in &seqs {
            queue.in_flight.remove(seq);
        }

        // A late ack after the lease expired still removes the redelivered items.
        queue
            .items
            .retain(|item| seqs.binary_search(&item.seq).is_err());

        Ok(())
    }

    async fn trim(&self, older_than: UnixTimestamp) -> Result<u64, IngestError> {
        let mut queue = self.queue.lock();
        let before = queue.items.len() + queue.in_flight.len();

        queue.items.retain(|item| item.enqueued_at >= older_than);
        queue
            .in_flight
            .retain(|_, leased| leased.item.enqueued_at >= older_than);

        let after = queue.items.len() + queue.in_flight.len();
        Ok((before - after) as u64)
    }
}
