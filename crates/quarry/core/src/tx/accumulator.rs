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

// Accumulators
// Snapshot-consistent aggregates. Updates are recorded twice: immediately
// on the atomic live value, and as a per-transaction delta that commits or
// vanishes with its transaction. Snapshot values are folded on demand by
// the transaction index from the base value, the per-bucket folded values
// of reclaimed transactions, and the deltas still attached to statuses.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use crate::error::{EngineError, EngineResult};
use crate::tx::timestamp::Timestamp;

/// Aggregate kinds. `apply` is commutative for every kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorType {
    /// Running sum.
    Sum = 0,
    /// Running minimum.
    Min = 1,
    /// Running maximum.
    Max = 2,
    /// Sequence: updates add, snapshots take the largest issued value.
    Seq = 3,
}

impl AccumulatorType {
    /// Folds a delta into an aggregate. Commutative and associative.
    #[inline]
    pub fn apply(&self, a: i64, b: i64) -> i64 {
        match self {
            AccumulatorType::Sum => a.wrapping_add(b),
            AccumulatorType::Min => a.min(b),
            AccumulatorType::Max => a.max(b),
            AccumulatorType::Seq => a.max(b),
        }
    }

    /// Combines a proposed update into the live value. Identical to
    /// `apply` except for SEQ, where updates accumulate.
    #[inline]
    pub fn apply_update(&self, live: i64, v: i64) -> i64 {
        match self {
            AccumulatorType::Sum | AccumulatorType::Seq => live.wrapping_add(v),
            AccumulatorType::Min => live.min(v),
            AccumulatorType::Max => live.max(v),
        }
    }

    /// Neutral element of `apply`.
    #[inline]
    pub fn identity(&self) -> i64 {
        match self {
            AccumulatorType::Sum | AccumulatorType::Seq => 0,
            AccumulatorType::Min => i64::MAX,
            AccumulatorType::Max => i64::MIN,
        }
    }

    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn from_code(code: u8) -> EngineResult<Self> {
        match code {
            0 => Ok(AccumulatorType::Sum),
            1 => Ok(AccumulatorType::Min),
            2 => Ok(AccumulatorType::Max),
            3 => Ok(AccumulatorType::Seq),
            other => Err(EngineError::CorruptJournal(format!("unknown accumulator type code {other}"))),
        }
    }
}

/// A snapshot-consistent aggregate attached to a tree.
///
/// Identity is the allocation: deltas reference their accumulator by
/// `Arc` pointer. At most 64 accumulators exist per tree, addressed by
/// `index`.
#[derive(Debug)]
pub struct Accumulator {
    tree_handle: u32,
    index: u8,
    acc_type: AccumulatorType,
    /// Start point of every snapshot fold: the value as of the last
    /// checkpoint restore plus deltas of recovered transactions.
    base_value: AtomicI64,
    /// Reflects every update ever applied, committed or not.
    live_value: AtomicI64,
    /// Snapshot persisted by the most recent checkpoint.
    checkpoint_value: AtomicI64,
    checkpoint_timestamp: AtomicI64,
    /// Folded deltas of transactions already reclaimed from each bucket.
    /// `bucket_values[b]` is mutated only under bucket `b`'s lock.
    bucket_values: Vec<AtomicI64>,
    /// Set when an update has occurred since the last checkpoint save.
    has_pending_checkpoint: AtomicBool,
}

impl Accumulator {
    pub fn new(acc_type: AccumulatorType, tree_handle: u32, index: u8, bucket_count: usize) -> Self {
        let identity = acc_type.identity();
        Self {
            tree_handle,
            index,
            acc_type,
            base_value: AtomicI64::new(identity),
            live_value: AtomicI64::new(identity),
            checkpoint_value: AtomicI64::new(identity),
            checkpoint_timestamp: AtomicI64::new(0),
            bucket_values: (0..bucket_count).map(|_| AtomicI64::new(identity)).collect(),
            has_pending_checkpoint: AtomicBool::new(false),
        }
    }

    pub fn acc_type(&self) -> AccumulatorType {
        self.acc_type
    }

    pub fn tree_handle(&self) -> u32 {
        self.tree_handle
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    /// The live value: every `update` is reflected here regardless of the
    /// outcome of its transaction.
    pub fn live_value(&self) -> i64 {
        self.live_value.load(Ordering::Acquire)
    }

    pub fn base_value(&self) -> i64 {
        self.base_value.load(Ordering::Acquire)
    }

    pub fn checkpoint_value(&self) -> i64 {
        self.checkpoint_value.load(Ordering::Acquire)
    }

    pub fn checkpoint_timestamp(&self) -> Timestamp {
        self.checkpoint_timestamp.load(Ordering::Acquire)
    }

    /// Applies an update to the live value, returning the updated value.
    /// The matching delta must be posted on the updating transaction's
    /// status by the caller (the transaction index does both together).
    pub(crate) fn update_live(&self, v: i64) -> i64 {
        self.has_pending_checkpoint.store(true, Ordering::Release);
        match self.acc_type {
            AccumulatorType::Sum | AccumulatorType::Seq => self.live_value.fetch_add(v, Ordering::AcqRel).wrapping_add(v),
            AccumulatorType::Min => self.live_value.fetch_min(v, Ordering::AcqRel).min(v),
            AccumulatorType::Max => self.live_value.fetch_max(v, Ordering::AcqRel).max(v),
        }
    }

    /// The delta value to record for an update: the proposed value itself,
    /// except for SEQ where the post-update sum is what a snapshot must
    /// reproduce.
    pub(crate) fn delta_value(&self, proposed: i64, updated_live: i64) -> i64 {
        match self.acc_type {
            AccumulatorType::Seq => updated_live,
            _ => proposed,
        }
    }

    /// Folds a reclaimed transaction's delta into this accumulator's slice
    /// for `bucket`. Caller holds that bucket's lock.
    pub(crate) fn fold_into_bucket(&self, bucket: usize, value: i64) {
        let folded = self.acc_type.apply(self.bucket_values[bucket].load(Ordering::Acquire), value);
        self.bucket_values[bucket].store(folded, Ordering::Release);
    }

    /// This accumulator's folded slice for `bucket`. Callers traversing a
    /// bucket hold its lock.
    pub(crate) fn bucket_value(&self, bucket: usize) -> i64 {
        self.bucket_values[bucket].load(Ordering::Acquire)
    }

    /// True when an update occurred after the last checkpoint save.
    pub fn is_checkpoint_needed(&self) -> bool {
        self.has_pending_checkpoint.load(Ordering::Acquire)
    }

    /// Records the snapshot persisted by a checkpoint at `ts`.
    pub(crate) fn note_checkpoint(&self, value: i64, ts: Timestamp) {
        self.checkpoint_value.store(value, Ordering::Release);
        self.checkpoint_timestamp.store(ts, Ordering::Release);
        self.has_pending_checkpoint.store(false, Ordering::Release);
    }

    /// Restores the persisted checkpoint value during recovery. Live and
    /// base restart from it; committed post-checkpoint deltas are then
    /// re-applied via [`Accumulator::apply_recovered_delta`].
    pub(crate) fn restore(&self, value: i64, ts: Timestamp) {
        self.base_value.store(value, Ordering::Release);
        self.live_value.store(value, Ordering::Release);
        self.checkpoint_value.store(value, Ordering::Release);
        self.checkpoint_timestamp.store(ts, Ordering::Release);
        self.has_pending_checkpoint.store(false, Ordering::Release);
    }

    /// Re-applies a committed delta found in the post-checkpoint journal
    /// tail. Recovery runs single-threaded, so the read-modify-write on
    /// base is unobserved.
    pub(crate) fn apply_recovered_delta(&self, value: i64) {
        let base = self.acc_type.apply(self.base_value.load(Ordering::Acquire), value);
        self.base_value.store(base, Ordering::Release);
        let live = self.acc_type.apply_update(self.live_value.load(Ordering::Acquire), value);
        // SEQ deltas carry the post-update sum, not an increment: the base
        // fold above (max) is already the restored value.
        let live = match self.acc_type {
            AccumulatorType::Seq => base,
            _ => live,
        };
        self.live_value.store(live, Ordering::Release);
        self.has_pending_checkpoint.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn acc(acc_type: AccumulatorType) -> Accumulator {
        Accumulator::new(acc_type, 1, 0, 8)
    }

    #[test]
    fn test_sum_live_updates() {
        let a = acc(AccumulatorType::Sum);
        assert_eq!(a.update_live(5), 5);
        assert_eq!(a.update_live(7), 12);
        assert_eq!(a.live_value(), 12);
    }

    #[test]
    fn test_min_max_live_updates() {
        let min = acc(AccumulatorType::Min);
        assert_eq!(min.update_live(9), 9);
        assert_eq!(min.update_live(3), 3);
        assert_eq!(min.update_live(5), 3);

        let max = acc(AccumulatorType::Max);
        assert_eq!(max.update_live(9), 9);
        assert_eq!(max.update_live(3), 9);
        assert_eq!(max.update_live(11), 11);
    }

    #[test]
    fn test_seq_delta_carries_post_update_sum() {
        let a = acc(AccumulatorType::Seq);
        let first = a.update_live(1);
        let second = a.update_live(1);
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(a.delta_value(1, second), 2);
        // SEQ snapshots fold by max, so the merged delta of the two
        // allocations is the larger post-update sum.
        assert_eq!(AccumulatorType::Seq.apply(first, second), 2);
    }

    #[test]
    fn test_bucket_fold() {
        let a = acc(AccumulatorType::Sum);
        a.fold_into_bucket(2, 10);
        a.fold_into_bucket(2, 5);
        assert_eq!(a.bucket_value(2), 15);
        assert_eq!(a.bucket_value(0), 0);
    }

    #[test]
    fn test_checkpoint_flags() {
        let a = acc(AccumulatorType::Sum);
        assert!(!a.is_checkpoint_needed());
        a.update_live(1);
        assert!(a.is_checkpoint_needed());
        a.note_checkpoint(1, 42);
        assert!(!a.is_checkpoint_needed());
        assert_eq!(a.checkpoint_value(), 1);
        assert_eq!(a.checkpoint_timestamp(), 42);
    }

    #[test]
    fn test_restore_and_recovered_deltas() {
        let a = acc(AccumulatorType::Sum);
        a.restore(100, 50);
        assert_eq!(a.base_value(), 100);
        assert_eq!(a.live_value(), 100);
        a.apply_recovered_delta(7);
        assert_eq!(a.base_value(), 107);
        assert_eq!(a.live_value(), 107);

        let s = acc(AccumulatorType::Seq);
        s.restore(40, 50);
        s.apply_recovered_delta(44);
        assert_eq!(s.base_value(), 44);
        assert_eq!(s.live_value(), 44);
    }

    proptest! {
        #[test]
        fn prop_apply_commutative(a in any::<i64>(), b in any::<i64>()) {
            for acc_type in [AccumulatorType::Sum, AccumulatorType::Min, AccumulatorType::Max, AccumulatorType::Seq] {
                prop_assert_eq!(acc_type.apply(a, b), acc_type.apply(b, a));
            }
        }

        #[test]
        fn prop_identity_neutral(a in any::<i64>()) {
            for acc_type in [AccumulatorType::Sum, AccumulatorType::Min, AccumulatorType::Max, AccumulatorType::Seq] {
                prop_assert_eq!(acc_type.apply(a, acc_type.identity()), a);
            }
        }
    }
}
