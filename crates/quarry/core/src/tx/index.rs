// Quarry
// Copyright (C) 2025 Quarry Contributors

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

// Transaction index
// Hash-bucketed pool of transaction statuses. Answers visibility queries,
// folds accumulator snapshots, and reclaims status records once the floor
// rises past them. Each bucket owns an arena of status slots and delta
// nodes; the intrusive lists link slots by index, so reclamation never
// frees memory a reader could still hold.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::tx::accumulator::{Accumulator, AccumulatorType};
use crate::tx::status::{DeltaNode, MVV_COUNT_UNKNOWN, SlotIndex, TransactionStatus, Visibility};
use crate::tx::timestamp::{ABORTED, Timestamp, TimestampAllocator, UNCOMMITTED, is_committing};

/// Number of buckets; a small power of two.
pub const BUCKET_COUNT: usize = 64;

const BUCKET_MASK: i64 = (BUCKET_COUNT as i64) - 1;

/// `current` length at which a completed commit triggers a reduce pass.
const REDUCE_TRIGGER: usize = 32;

/// Completed commits between refreshes of the active-transaction floor.
const FLOOR_REFRESH_INTERVAL: u64 = 32;

/// Wait quantum while an in-flight commit is resolved.
const VISIBILITY_WAIT: Duration = Duration::from_millis(50);

/// Bound on visibility wait quanta before reporting a timeout.
const VISIBILITY_RETRY_LIMIT: usize = 1200;

/// Identity of a registered transaction: its start timestamp plus the
/// bucket slot backing it. Handed back to every index operation so no
/// ambient state is needed.
#[derive(Debug, Clone, Copy)]
pub struct TxnRef {
    pub ts: Timestamp,
    bucket: u32,
    slot: SlotIndex,
}

/// One accumulator delta of a committing transaction, in journal form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccumulatorDelta {
    pub tree_handle: u32,
    pub index: u8,
    pub acc_type: AccumulatorType,
    pub value: i64,
}

/// Counters exposed for observability.
#[derive(Debug, Default)]
pub struct TransactionIndexStats {
    pub begun: AtomicU64,
    pub committed: AtomicU64,
    pub aborted: AtomicU64,
    pub visibility_retries: AtomicU64,
    pub snapshot_retries: AtomicU64,
    pub reclaimed: AtomicU64,
}

struct BucketInner {
    statuses: Vec<TransactionStatus>,
    deltas: Vec<DeltaNode>,
    current: Option<SlotIndex>,
    current_count: usize,
    aborted: Option<SlotIndex>,
    aborted_count: usize,
    long_running: Option<SlotIndex>,
    long_running_count: usize,
    free: Option<SlotIndex>,
    free_count: usize,
    free_delta: Option<SlotIndex>,
    free_delta_count: usize,
    /// Smallest start timestamp a status on `current` may carry. Statuses
    /// below it live only on `aborted` and `long_running`, or have been
    /// reclaimed (and are then committed by definition).
    floor: Timestamp,
}

impl BucketInner {
    fn new() -> Self {
        Self {
            statuses: Vec::new(),
            deltas: Vec::new(),
            current: None,
            current_count: 0,
            aborted: None,
            aborted_count: 0,
            long_running: None,
            long_running_count: 0,
            free: None,
            free_count: 0,
            free_delta: None,
            free_delta_count: 0,
            floor: UNCOMMITTED,
        }
    }

    fn find(&self, ts: Timestamp) -> Option<SlotIndex> {
        for head in [self.current, self.long_running, self.aborted] {
            let mut cursor = head;
            while let Some(idx) = cursor {
                let status = &self.statuses[idx as usize];
                if status.ts == ts {
                    return Some(idx);
                }
                cursor = status.next;
            }
        }
        None
    }

    /// Takes a slot from the free list or grows the arena.
    fn allocate_slot(&mut self, ts: Timestamp) -> SlotIndex {
        if let Some(idx) = self.free {
            self.free = self.statuses[idx as usize].next;
            self.free_count -= 1;
            self.statuses[idx as usize].reset(ts);
            idx
        } else {
            self.statuses.push(TransactionStatus::new(ts));
            (self.statuses.len() - 1) as SlotIndex
        }
    }

    fn push_current(&mut self, idx: SlotIndex) {
        self.statuses[idx as usize].next = self.current;
        self.current = Some(idx);
        self.current_count += 1;
    }

    /// Returns the slot to the free list, or shrinks the arena when the
    /// free list is at capacity and the slot happens to be the tail.
    fn release_slot(&mut self, idx: SlotIndex, max_free: usize) {
        if self.free_count >= max_free && idx as usize == self.statuses.len() - 1 {
            self.statuses.pop();
            return;
        }
        self.statuses[idx as usize].next = self.free;
        self.free = Some(idx);
        self.free_count += 1;
    }

    fn take_delta_node(&mut self) -> SlotIndex {
        if let Some(idx) = self.free_delta {
            self.free_delta = self.deltas[idx as usize].next;
            self.free_delta_count -= 1;
            idx
        } else {
            self.deltas.push(DeltaNode::vacant());
            (self.deltas.len() - 1) as SlotIndex
        }
    }

    /// Walks and recycles a status's delta chain. When `fold_bucket` is
    /// set the values are folded into each accumulator's slice for that
    /// bucket (commit outcome); otherwise they are discarded (abort).
    fn recycle_deltas(&mut self, head: Option<SlotIndex>, fold_bucket: Option<usize>, max_free_delta: usize) {
        let mut cursor = head;
        while let Some(idx) = cursor {
            let next = self.deltas[idx as usize].next;
            if let Some(bucket) = fold_bucket {
                if let Some(acc) = &self.deltas[idx as usize].accumulator {
                    acc.fold_into_bucket(bucket, self.deltas[idx as usize].value);
                }
            }
            self.deltas[idx as usize].clear();
            if self.free_delta_count >= max_free_delta && idx as usize == self.deltas.len() - 1 {
                self.deltas.pop();
            } else {
                self.deltas[idx as usize].next = self.free_delta;
                self.free_delta = Some(idx);
                self.free_delta_count += 1;
            }
            cursor = next;
        }
    }
}

struct Bucket {
    inner: Mutex<BucketInner>,
    /// Notified whenever a commit or abort outcome is published; readers
    /// blocked on an in-flight commit wait here briefly.
    commit_published: Condvar,
}

/// The transaction index.
pub struct TransactionIndex {
    allocator: Arc<TimestampAllocator>,
    buckets: Vec<Bucket>,
    /// Conservative lower bound on the smallest start timestamp of any
    /// active transaction; refreshed off the bucket locks.
    active_floor: AtomicI64,
    /// Pre-crash window `(window_low, window_high]`: a version timestamp
    /// in this range with no status belongs to a transaction that never
    /// reached its commit record.
    window_low: AtomicI64,
    window_high: AtomicI64,
    commits_since_refresh: AtomicU64,
    long_running_threshold: usize,
    max_free_list_size: usize,
    max_free_delta_list_size: usize,
    snapshot_retry_limit: usize,
    stats: TransactionIndexStats,
}

impl TransactionIndex {
    pub fn new(allocator: Arc<TimestampAllocator>, config: &EngineConfig) -> Self {
        Self {
            allocator,
            buckets: (0..BUCKET_COUNT)
                .map(|_| Bucket {
                    inner: Mutex::new(BucketInner::new()),
                    commit_published: Condvar::new(),
                })
                .collect(),
            active_floor: AtomicI64::new(0),
            window_low: AtomicI64::new(0),
            window_high: AtomicI64::new(0),
            commits_since_refresh: AtomicU64::new(0),
            long_running_threshold: config.long_running_threshold,
            max_free_list_size: config.max_free_list_size,
            max_free_delta_list_size: config.max_free_delta_list_size,
            snapshot_retry_limit: config.snapshot_retry_limit,
            stats: TransactionIndexStats::default(),
        }
    }

    pub fn stats(&self) -> &TransactionIndexStats {
        &self.stats
    }

    pub fn allocator(&self) -> &Arc<TimestampAllocator> {
        &self.allocator
    }

    #[inline]
    fn bucket_of(ts: Timestamp) -> usize {
        (ts & BUCKET_MASK) as usize
    }

    /// Registers a new transaction and returns its reference.
    pub fn begin(&self) -> TxnRef {
        let ts = self.allocator.next();
        let bucket_idx = Self::bucket_of(ts);
        let mut inner = self.buckets[bucket_idx].inner.lock();
        let slot = inner.allocate_slot(ts);
        inner.push_current(slot);
        if ts < inner.floor {
            inner.floor = ts;
        }
        drop(inner);
        self.stats.begun.fetch_add(1, Ordering::Relaxed);
        TxnRef {
            ts,
            bucket: bucket_idx as u32,
            slot,
        }
    }

    fn checked_slot<'a>(&self, inner: &'a mut BucketInner, txn: &TxnRef) -> EngineResult<&'a mut TransactionStatus> {
        let status = inner
            .statuses
            .get_mut(txn.slot as usize)
            .ok_or_else(|| EngineError::InvariantViolation(format!("status slot {} out of range", txn.slot)))?;
        if status.ts != txn.ts {
            return Err(EngineError::InvariantViolation(format!(
                "status for ts {} not found (slot holds ts {})",
                txn.ts, status.ts
            )));
        }
        Ok(status)
    }

    /// Marks the transaction as committing and returns the provisional
    /// commit timestamp. The caller journals the commit and then calls
    /// [`TransactionIndex::finish_commit`] (or [`TransactionIndex::abort`]
    /// if journaling failed).
    pub fn begin_commit(&self, txn: &TxnRef) -> EngineResult<Timestamp> {
        let tc = self.allocator.next();
        let mut inner = self.buckets[txn.bucket as usize].inner.lock();
        let status = self.checked_slot(&mut inner, txn)?;
        if status.tc != UNCOMMITTED {
            return Err(EngineError::InvariantViolation(format!(
                "commit of transaction {} in state tc={}",
                txn.ts, status.tc
            )));
        }
        status.tc = -tc;
        Ok(tc)
    }

    /// Publishes a commit outcome decided in `begin_commit`.
    pub fn finish_commit(&self, txn: &TxnRef, tc: Timestamp) -> EngineResult<()> {
        let bucket = &self.buckets[txn.bucket as usize];
        let current_count;
        {
            let mut inner = bucket.inner.lock();
            let status = self.checked_slot(&mut inner, txn)?;
            if status.tc != -tc {
                return Err(EngineError::InvariantViolation(format!(
                    "finish_commit of transaction {} expected provisional {} but found {}",
                    txn.ts, -tc, status.tc
                )));
            }
            status.tc = tc;
            status.ta = tc;
            status.notified = true;
            current_count = inner.current_count;
        }
        bucket.commit_published.notify_all();
        self.stats.committed.fetch_add(1, Ordering::Relaxed);
        self.maybe_refresh_floor();
        if current_count > REDUCE_TRIGGER {
            self.reduce(txn.bucket as usize);
        }
        Ok(())
    }

    /// Aborts a transaction. Valid both for active transactions and for
    /// commits whose journaling failed.
    pub fn abort(&self, txn: &TxnRef) -> EngineResult<()> {
        let ta = self.allocator.next();
        let bucket = &self.buckets[txn.bucket as usize];
        {
            let mut inner = bucket.inner.lock();
            let status = self.checked_slot(&mut inner, txn)?;
            if status.notified {
                return Err(EngineError::InvariantViolation(format!("abort of completed transaction {}", txn.ts)));
            }
            status.tc = ABORTED;
            status.ta = ta;
            status.notified = true;
        }
        bucket.commit_published.notify_all();
        self.stats.aborted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Resolves whether the version written at `version_ts` is visible to
    /// a reader that started at `reader_ts`. An in-flight commit below the
    /// reader is awaited briefly and re-checked; the retry never escapes.
    pub fn is_visible(&self, version_ts: Timestamp, reader_ts: Timestamp) -> EngineResult<bool> {
        if version_ts == reader_ts {
            return Ok(true);
        }
        let bucket = &self.buckets[Self::bucket_of(version_ts)];
        let mut attempts = 0usize;
        let mut inner = bucket.inner.lock();
        loop {
            let resolution = match inner.find(version_ts) {
                Some(idx) => inner.statuses[idx as usize].visibility(reader_ts),
                None => {
                    let low = self.window_low.load(Ordering::Acquire);
                    let high = self.window_high.load(Ordering::Acquire);
                    if version_ts > low && version_ts <= high {
                        // Pre-crash orphan: its producer never reached TC.
                        Visibility::NotVisible
                    } else if version_ts < inner.floor {
                        // Reclaimed long ago; reclamation implies the commit
                        // happened below every live reader.
                        Visibility::Visible
                    } else {
                        return Err(EngineError::InvariantViolation(format!(
                            "status for version ts {version_ts} not found above floor {}",
                            inner.floor
                        )));
                    }
                }
            };
            match resolution {
                Visibility::Visible => return Ok(true),
                Visibility::NotVisible => return Ok(false),
                Visibility::Retry => {
                    attempts += 1;
                    if attempts > VISIBILITY_RETRY_LIMIT {
                        return Err(EngineError::Timeout(
                            VISIBILITY_WAIT * VISIBILITY_RETRY_LIMIT as u32,
                            format!("commit of transaction {version_ts}"),
                        ));
                    }
                    self.stats.visibility_retries.fetch_add(1, Ordering::Relaxed);
                    bucket.commit_published.wait_for(&mut inner, VISIBILITY_WAIT);
                }
            }
        }
    }

    /// Records a multi-version value attributed to `version_ts`.
    pub fn register_mvv(&self, version_ts: Timestamp) -> EngineResult<()> {
        let mut inner = self.buckets[Self::bucket_of(version_ts)].inner.lock();
        match inner.find(version_ts) {
            Some(idx) => {
                let status = &mut inner.statuses[idx as usize];
                if status.mvv_count != MVV_COUNT_UNKNOWN {
                    status.mvv_count += 1;
                }
                Ok(())
            }
            None => Err(EngineError::InvariantViolation(format!(
                "register_mvv: status for ts {version_ts} not found"
            ))),
        }
    }

    /// Notes that pruning removed one multi-version value attributed to
    /// `version_ts`. Unknown timestamps are already reclaimed and ignored.
    pub fn prune_mvv(&self, version_ts: Timestamp) {
        let mut inner = self.buckets[Self::bucket_of(version_ts)].inner.lock();
        if let Some(idx) = inner.find(version_ts) {
            let status = &mut inner.statuses[idx as usize];
            if status.mvv_count != MVV_COUNT_UNKNOWN && status.mvv_count > 0 {
                status.mvv_count -= 1;
            }
        }
    }

    /// Declares that pruning has removed every version of `version_ts`;
    /// used for recovered statuses whose count was unknown.
    pub fn prune_all_mvv(&self, version_ts: Timestamp) {
        let mut inner = self.buckets[Self::bucket_of(version_ts)].inner.lock();
        if let Some(idx) = inner.find(version_ts) {
            inner.statuses[idx as usize].mvv_count = 0;
        }
    }

    /// Applies an accumulator update on behalf of `txn`: the live value
    /// moves immediately, and a delta is posted (or merged) on the
    /// transaction's status. Returns the updated live value.
    pub fn update_accumulator(&self, txn: &TxnRef, acc: &Arc<Accumulator>, value: i64, step: u32) -> EngineResult<i64> {
        let mut inner = self.buckets[txn.bucket as usize].inner.lock();
        let status = self.checked_slot(&mut inner, txn)?;
        if !status.is_active() || is_committing(status.tc) {
            return Err(EngineError::TransactionNotActive(format!("transaction {}", txn.ts)));
        }
        let updated = acc.update_live(value);
        let delta_value = acc.delta_value(value, updated);
        let head = status.delta;

        // Merge onto an existing delta for the same accumulator and step.
        let mut cursor = head;
        while let Some(idx) = cursor {
            let node = &inner.deltas[idx as usize];
            let same = node.step == step && node.accumulator.as_ref().is_some_and(|a| Arc::ptr_eq(a, acc));
            if same {
                let merged = acc.acc_type().apply(node.value, delta_value);
                inner.deltas[idx as usize].value = merged;
                return Ok(updated);
            }
            cursor = node.next;
        }

        let node_idx = inner.take_delta_node();
        {
            let node = &mut inner.deltas[node_idx as usize];
            node.accumulator = Some(acc.clone());
            node.step = step;
            node.value = delta_value;
            node.next = head;
        }
        let status = self.checked_slot(&mut inner, txn)?;
        status.delta = Some(node_idx);
        Ok(updated)
    }

    /// The transaction's accumulator deltas in journal form, for the
    /// commit path to append as TD records.
    pub fn collect_deltas(&self, txn: &TxnRef) -> EngineResult<Vec<AccumulatorDelta>> {
        let mut inner = self.buckets[txn.bucket as usize].inner.lock();
        let status = self.checked_slot(&mut inner, txn)?;
        let mut cursor = status.delta;
        let mut out = Vec::new();
        while let Some(idx) = cursor {
            let node = &inner.deltas[idx as usize];
            if let Some(acc) = &node.accumulator {
                out.push(AccumulatorDelta {
                    tree_handle: acc.tree_handle(),
                    index: acc.index(),
                    acc_type: acc.acc_type(),
                    value: node.value,
                });
            }
            cursor = node.next;
        }
        out.reverse(); // delta list is newest-first
        Ok(out)
    }

    /// Computes the snapshot value of `acc` at `(reader_ts, step)`.
    pub fn accumulator_snapshot(&self, acc: &Arc<Accumulator>, reader_ts: Timestamp, step: u32) -> EngineResult<i64> {
        let acc_type = acc.acc_type();
        let mut value = acc.base_value();
        for (bucket_idx, bucket) in self.buckets.iter().enumerate() {
            let mut attempts = 0usize;
            let mut inner = bucket.inner.lock();
            'bucket: loop {
                let mut contribution = acc.bucket_value(bucket_idx);
                for head in [inner.current, inner.long_running] {
                    let mut cursor = head;
                    while let Some(idx) = cursor {
                        let (next, delta_head, own, visibility) = {
                            let status = &inner.statuses[idx as usize];
                            (
                                status.next,
                                status.delta,
                                status.ts == reader_ts,
                                status.visibility(reader_ts),
                            )
                        };
                        cursor = next;
                        if delta_head.is_none() {
                            continue;
                        }
                        let include = if own {
                            true
                        } else {
                            match visibility {
                                Visibility::Visible => true,
                                Visibility::NotVisible => false,
                                Visibility::Retry => {
                                    attempts += 1;
                                    if attempts > self.snapshot_retry_limit {
                                        return Err(EngineError::Timeout(
                                            VISIBILITY_WAIT * self.snapshot_retry_limit as u32,
                                            format!("accumulator snapshot at ts {reader_ts}"),
                                        ));
                                    }
                                    self.stats.snapshot_retries.fetch_add(1, Ordering::Relaxed);
                                    bucket.commit_published.wait_for(&mut inner, VISIBILITY_WAIT);
                                    continue 'bucket;
                                }
                            }
                        };
                        if !include {
                            continue;
                        }
                        let mut delta_cursor = delta_head;
                        while let Some(delta_idx) = delta_cursor {
                            let node = &inner.deltas[delta_idx as usize];
                            delta_cursor = node.next;
                            let matches = node.accumulator.as_ref().is_some_and(|a| Arc::ptr_eq(a, acc));
                            if matches && (!own || node.step <= step) {
                                contribution = acc_type.apply(contribution, node.value);
                            }
                        }
                    }
                }
                value = acc_type.apply(value, contribution);
                break;
            }
        }
        Ok(value)
    }

    /// Moves completed statuses out of `current` and raises the bucket
    /// floor to the smallest start timestamp remaining there.
    ///
    /// Reclaimable committed statuses have their deltas folded into the
    /// accumulators' bucket slices; aborted statuses move to the `aborted`
    /// list until their version count drains; stragglers move to
    /// `long_running` when `current` outgrows the threshold.
    pub fn reduce(&self, bucket_idx: usize) {
        let active_floor = self.active_floor.load(Ordering::Acquire);
        let bucket = &self.buckets[bucket_idx];
        let mut inner = bucket.inner.lock();
        let previous_floor = inner.floor;

        let mut prev: Option<SlotIndex> = None;
        let mut cursor = inner.current;
        while let Some(idx) = cursor {
            let status = &inner.statuses[idx as usize];
            let next = status.next;
            let reclaim = status.is_committed() && status.notified && status.tc < active_floor && status.mvv_count == 0;
            let to_aborted = status.is_aborted() && status.notified;
            let to_long_running = !reclaim && !to_aborted && status.is_active() && inner.current_count > self.long_running_threshold;

            if reclaim {
                let delta_head = inner.statuses[idx as usize].delta;
                inner.recycle_deltas(delta_head, Some(bucket_idx), self.max_free_delta_list_size);
                inner.statuses[idx as usize].delta = None;
                Self::unlink_current(&mut inner, prev, next);
                inner.release_slot(idx, self.max_free_list_size);
                self.stats.reclaimed.fetch_add(1, Ordering::Relaxed);
            } else if to_aborted {
                // Destination link is set before the source list forgets
                // the slot, so a concurrent traversal always finds it.
                inner.statuses[idx as usize].next = inner.aborted;
                inner.aborted = Some(idx);
                inner.aborted_count += 1;
                Self::unlink_current(&mut inner, prev, next);
            } else if to_long_running {
                inner.statuses[idx as usize].next = inner.long_running;
                inner.long_running = Some(idx);
                inner.long_running_count += 1;
                Self::unlink_current(&mut inner, prev, next);
            } else {
                prev = Some(idx);
            }
            cursor = next;
        }

        // The floor rises to the smallest remaining start timestamp.
        let mut floor = UNCOMMITTED;
        let mut cursor = inner.current;
        while let Some(idx) = cursor {
            let status = &inner.statuses[idx as usize];
            if status.ts < floor {
                floor = status.ts;
            }
            cursor = status.next;
        }
        debug_assert!(floor >= previous_floor, "floor regression: {previous_floor} -> {floor}");
        inner.floor = floor;
    }

    fn unlink_current(inner: &mut BucketInner, prev: Option<SlotIndex>, next: Option<SlotIndex>) {
        match prev {
            Some(p) => inner.statuses[p as usize].next = next,
            None => inner.current = next,
        }
        inner.current_count -= 1;
    }

    /// Sweeps the `aborted` and `long_running` lists, freeing statuses no
    /// active transaction can still observe.
    pub fn cleanup(&self) {
        let active_floor = self.update_active_floor();
        for (bucket_idx, bucket) in self.buckets.iter().enumerate() {
            let mut inner = bucket.inner.lock();

            // Aborted statuses: free once every version is pruned and every
            // reader that could have seen the abort in flight is gone.
            let mut prev: Option<SlotIndex> = None;
            let mut cursor = inner.aborted;
            while let Some(idx) = cursor {
                let status = &inner.statuses[idx as usize];
                let next = status.next;
                if status.mvv_count == 0 && status.ta < active_floor {
                    let delta_head = status.delta;
                    inner.recycle_deltas(delta_head, None, self.max_free_delta_list_size);
                    inner.statuses[idx as usize].delta = None;
                    match prev {
                        Some(p) => inner.statuses[p as usize].next = next,
                        None => inner.aborted = next,
                    }
                    inner.aborted_count -= 1;
                    inner.release_slot(idx, self.max_free_list_size);
                    self.stats.reclaimed.fetch_add(1, Ordering::Relaxed);
                } else {
                    prev = Some(idx);
                }
                cursor = next;
            }

            // Long-running statuses that committed and became obsolete.
            let mut prev: Option<SlotIndex> = None;
            let mut cursor = inner.long_running;
            while let Some(idx) = cursor {
                let status = &inner.statuses[idx as usize];
                let next = status.next;
                if status.is_committed() && status.notified && status.tc < active_floor && status.mvv_count == 0 {
                    let delta_head = status.delta;
                    inner.recycle_deltas(delta_head, Some(bucket_idx), self.max_free_delta_list_size);
                    inner.statuses[idx as usize].delta = None;
                    match prev {
                        Some(p) => inner.statuses[p as usize].next = next,
                        None => inner.long_running = next,
                    }
                    inner.long_running_count -= 1;
                    inner.release_slot(idx, self.max_free_list_size);
                    self.stats.reclaimed.fetch_add(1, Ordering::Relaxed);
                } else {
                    prev = Some(idx);
                }
                cursor = next;
            }
        }
    }

    /// Recomputes the smallest start timestamp of any active transaction.
    /// The candidate is sampled before the scan so the result is always a
    /// valid lower bound even while transactions begin concurrently.
    pub fn update_active_floor(&self) -> Timestamp {
        let mut floor = self.allocator.now() + 1;
        for bucket in &self.buckets {
            let inner = bucket.inner.lock();
            for head in [inner.current, inner.long_running] {
                let mut cursor = head;
                while let Some(idx) = cursor {
                    let status = &inner.statuses[idx as usize];
                    if status.is_active() && status.ts < floor {
                        floor = status.ts;
                    }
                    cursor = status.next;
                }
            }
        }
        self.active_floor.store(floor, Ordering::Release);
        floor
    }

    /// Cached active-transaction floor.
    pub fn active_floor(&self) -> Timestamp {
        self.active_floor.load(Ordering::Acquire)
    }

    fn maybe_refresh_floor(&self) {
        let n = self.commits_since_refresh.fetch_add(1, Ordering::Relaxed) + 1;
        if n % FLOOR_REFRESH_INTERVAL == 0 {
            self.update_active_floor();
        }
    }

    /// Blocks until no commit with a provisional timestamp below `t` is in
    /// flight. Used by the checkpoint manager to fence its timestamp.
    pub fn wait_for_commits_below(&self, t: Timestamp, timeout: Duration) -> EngineResult<()> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let mut pending = None;
            for (bucket_idx, bucket) in self.buckets.iter().enumerate() {
                let inner = bucket.inner.lock();
                for head in [inner.current, inner.long_running] {
                    let mut cursor = head;
                    while let Some(idx) = cursor {
                        let status = &inner.statuses[idx as usize];
                        if is_committing(status.tc) && -status.tc < t {
                            pending = Some(bucket_idx);
                            break;
                        }
                        cursor = status.next;
                    }
                }
                if pending.is_some() {
                    break;
                }
            }
            let Some(bucket_idx) = pending else {
                return Ok(());
            };
            if std::time::Instant::now() >= deadline {
                return Err(EngineError::Timeout(timeout, format!("in-flight commits below {t}")));
            }
            let bucket = &self.buckets[bucket_idx];
            let mut inner = bucket.inner.lock();
            bucket.commit_published.wait_for(&mut inner, VISIBILITY_WAIT);
        }
    }

    /// Installs the post-recovery visibility window: version timestamps in
    /// `(checkpoint_ts, recovery_base]` without a status belong to
    /// transactions that never reached their commit record.
    pub fn set_recovery_window(&self, checkpoint_ts: Timestamp, recovery_base: Timestamp) {
        self.window_low.store(checkpoint_ts, Ordering::Release);
        self.window_high.store(recovery_base, Ordering::Release);
        for bucket in &self.buckets {
            let mut inner = bucket.inner.lock();
            if inner.current.is_none() {
                inner.floor = if checkpoint_ts > 0 { checkpoint_ts } else { UNCOMMITTED };
            }
        }
    }

    /// Injects a transaction recovered from the journal as committed. Its
    /// version count is unknown, so it is parked on `long_running` and is
    /// only reclaimed after pruning declares it fully drained.
    pub fn inject_recovered_commit(&self, ts: Timestamp, tc: Timestamp) {
        let bucket_idx = Self::bucket_of(ts);
        let mut inner = self.buckets[bucket_idx].inner.lock();
        if inner.find(ts).is_some() {
            return;
        }
        let slot = inner.allocate_slot(ts);
        let prev_long_running = inner.long_running;
        let status = &mut inner.statuses[slot as usize];
        status.tc = tc;
        status.ta = tc;
        status.mvv_count = MVV_COUNT_UNKNOWN;
        status.notified = true;
        status.next = prev_long_running;
        inner.long_running = Some(slot);
        inner.long_running_count += 1;
    }

    /// Bucket floor, exposed for invariants and tests.
    pub fn bucket_floor(&self, ts: Timestamp) -> Timestamp {
        self.buckets[Self::bucket_of(ts)].inner.lock().floor
    }

    /// Number of live (non-free) statuses across all buckets.
    pub fn live_status_count(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| {
                let inner = b.inner.lock();
                inner.current_count + inner.aborted_count + inner.long_running_count
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::timestamp::TimestampAllocator;
    use std::thread;

    fn index() -> (Arc<TimestampAllocator>, TransactionIndex) {
        let allocator = Arc::new(TimestampAllocator::new());
        let config = EngineConfig::default();
        let idx = TransactionIndex::new(allocator.clone(), &config);
        (allocator, idx)
    }

    fn commit(idx: &TransactionIndex, txn: &TxnRef) -> Timestamp {
        let tc = idx.begin_commit(txn).unwrap();
        idx.finish_commit(txn, tc).unwrap();
        tc
    }

    #[test]
    fn test_commit_visible_to_later_reader() {
        let (_allocator, idx) = index();
        let writer = idx.begin();
        let tc = commit(&idx, &writer);
        let reader = idx.begin();
        assert!(reader.ts > tc);
        assert!(idx.is_visible(writer.ts, reader.ts).unwrap());
    }

    #[test]
    fn test_uncommitted_invisible() {
        let (_allocator, idx) = index();
        let writer = idx.begin();
        let reader = idx.begin();
        assert!(!idx.is_visible(writer.ts, reader.ts).unwrap());
    }

    #[test]
    fn test_aborted_invisible() {
        let (_allocator, idx) = index();
        let writer = idx.begin();
        idx.abort(&writer).unwrap();
        let reader = idx.begin();
        assert!(!idx.is_visible(writer.ts, reader.ts).unwrap());
    }

    #[test]
    fn test_own_writes_visible() {
        let (_allocator, idx) = index();
        let txn = idx.begin();
        assert!(idx.is_visible(txn.ts, txn.ts).unwrap());
    }

    #[test]
    fn test_earlier_reader_never_sees_commit() {
        let (_allocator, idx) = index();
        let reader = idx.begin();
        let writer = idx.begin();
        commit(&idx, &writer);
        assert!(!idx.is_visible(writer.ts, reader.ts).unwrap());
    }

    #[test]
    fn test_in_flight_commit_resolves() {
        let (_allocator, idx) = index();
        let idx = Arc::new(idx);
        let writer = idx.begin();
        let tc = idx.begin_commit(&writer).unwrap();
        let reader = idx.begin();

        let idx2 = idx.clone();
        let handle = thread::spawn(move || idx2.is_visible(writer.ts, reader.ts).unwrap());
        thread::sleep(Duration::from_millis(20));
        idx.finish_commit(&writer, tc).unwrap();
        // tc < reader.ts, so after resolution the version is visible.
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_floor_progression_after_reduce() {
        let (_allocator, idx) = index();
        let txns: Vec<_> = (0..BUCKET_COUNT * 2).map(|_| idx.begin()).collect();
        let floor_before = idx.bucket_floor(txns[0].ts);
        for txn in &txns {
            commit(&idx, txn);
        }
        idx.update_active_floor();
        for b in 0..BUCKET_COUNT {
            idx.reduce(b);
        }
        let floor_after = idx.bucket_floor(txns[0].ts);
        assert!(floor_after >= floor_before);
        // Everything committed and no MVVs: all statuses reclaimed.
        assert_eq!(idx.live_status_count(), 0);
    }

    #[test]
    fn test_reduce_keeps_status_with_outstanding_mvv() {
        let (_allocator, idx) = index();
        let txn = idx.begin();
        idx.register_mvv(txn.ts).unwrap();
        commit(&idx, &txn);
        idx.update_active_floor();
        idx.reduce(TransactionIndex::bucket_of(txn.ts));
        assert_eq!(idx.live_status_count(), 1);
        // Once pruning drains the version the status is reclaimable.
        idx.prune_mvv(txn.ts);
        idx.update_active_floor();
        idx.reduce(TransactionIndex::bucket_of(txn.ts));
        assert_eq!(idx.live_status_count(), 0);
    }

    #[test]
    fn test_aborted_status_lifecycle() {
        let (_allocator, idx) = index();
        let txn = idx.begin();
        idx.register_mvv(txn.ts).unwrap();
        idx.abort(&txn).unwrap();

        // Move out of current to the aborted list.
        idx.update_active_floor();
        idx.reduce(TransactionIndex::bucket_of(txn.ts));
        assert_eq!(idx.live_status_count(), 1);

        // Still pinned: a version remains.
        idx.cleanup();
        assert_eq!(idx.live_status_count(), 1);

        idx.prune_mvv(txn.ts);
        // A later transaction raises the active floor past ta.
        let later = idx.begin();
        commit(&idx, &later);
        idx.cleanup();
        // Only the helper transaction remains, still on `current`.
        assert_eq!(idx.live_status_count(), 1);
    }

    #[test]
    fn test_reclaimed_status_reads_committed() {
        let (_allocator, idx) = index();
        let writer = idx.begin();
        commit(&idx, &writer);
        idx.update_active_floor();
        idx.reduce(TransactionIndex::bucket_of(writer.ts));
        assert_eq!(idx.live_status_count(), 0);
        let reader = idx.begin();
        assert!(idx.is_visible(writer.ts, reader.ts).unwrap());
    }

    #[test]
    fn test_recovery_window_hides_orphans() {
        let (allocator, idx) = index();
        allocator.update_if_greater(500);
        idx.set_recovery_window(450, 500);
        idx.inject_recovered_commit(460, 462);

        let reader = idx.begin();
        // Pre-checkpoint versions are committed by definition.
        assert!(idx.is_visible(401, reader.ts).unwrap());
        // Recovered commit is visible.
        assert!(idx.is_visible(460, reader.ts).unwrap());
        // Orphan in the pre-crash window never reached TC.
        assert!(!idx.is_visible(461, reader.ts).unwrap());
    }

    #[test]
    fn test_visibility_monotonicity_randomized() {
        use rand::Rng;
        let (_allocator, idx) = index();
        let idx = Arc::new(idx);
        let writers = 4;
        let per_writer = 200;

        let mut handles = Vec::new();
        for _ in 0..writers {
            let idx = idx.clone();
            handles.push(thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let mut committed = Vec::new();
                for _ in 0..per_writer {
                    let txn = idx.begin();
                    if rng.gen_bool(0.8) {
                        let tc = idx.begin_commit(&txn).unwrap();
                        idx.finish_commit(&txn, tc).unwrap();
                        committed.push((txn.ts, tc));
                    } else {
                        idx.abort(&txn).unwrap();
                    }
                }
                committed
            }));
        }
        let committed: Vec<(Timestamp, Timestamp)> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();

        // No ghost reads: whenever a version is visible, its commit
        // happened strictly before the reader started.
        let reader = idx.begin();
        for (ts, tc) in committed {
            let visible = idx.is_visible(ts, reader.ts).unwrap();
            assert_eq!(visible, tc > 0 && tc < reader.ts);
        }
    }

    #[test]
    fn test_wait_for_commits_below() {
        let (_allocator, idx) = index();
        let idx = Arc::new(idx);
        let txn = idx.begin();
        let tc = idx.begin_commit(&txn).unwrap();

        let idx2 = idx.clone();
        let handle = thread::spawn(move || idx2.wait_for_commits_below(tc + 10, Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        idx.finish_commit(&txn, tc).unwrap();
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn test_bucket_distribution() {
        assert_eq!(TransactionIndex::bucket_of(1), 1);
        assert_eq!(TransactionIndex::bucket_of(64), 0);
        assert_eq!(TransactionIndex::bucket_of(65), 1);
    }
}
