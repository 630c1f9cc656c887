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

// Transaction status records
// One record per transaction, held in a per-bucket arena and linked into
// the bucket's intrusive lists by slot index. Every field is mutated only
// under the owning bucket's lock.

use std::sync::Arc;

use crate::tx::accumulator::Accumulator;
use crate::tx::timestamp::{ABORTED, Timestamp, UNCOMMITTED, is_committing};

/// Slot index into a bucket arena.
pub type SlotIndex = u32;

/// MVV count marker for statuses recovered from the journal, where the
/// number of versions left in the database is unknown. Such statuses are
/// only reclaimed once pruning has walked their versions down to zero.
pub const MVV_COUNT_UNKNOWN: u32 = u32::MAX;

/// Outcome of a visibility check against one status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// The version produced by this transaction is visible to the reader.
    Visible,
    /// The version is not visible (uncommitted, aborted, or committed at
    /// or after the reader's start timestamp).
    NotVisible,
    /// A commit is in flight with a provisional timestamp below the
    /// reader; the caller must wait briefly and re-check.
    Retry,
}

/// Per-transaction record in the transaction index.
#[derive(Debug)]
pub struct TransactionStatus {
    /// Start timestamp; immutable once assigned.
    pub ts: Timestamp,
    /// Commit timestamp. `UNCOMMITTED` while active, `-provisional`
    /// during commit, final positive value or `ABORTED` afterwards.
    pub tc: Timestamp,
    /// Finalisation timestamp, used to order cleanup of aborted statuses.
    pub ta: Timestamp,
    /// Number of multi-version values in the database attributed to this
    /// transaction; decremented by pruning.
    pub mvv_count: u32,
    /// Head of this transaction's delta list in the bucket's delta arena.
    pub delta: Option<SlotIndex>,
    /// Set once the commit or abort outcome is fully published.
    pub notified: bool,
    /// Intrusive link to the next status in whichever bucket list holds
    /// this slot.
    pub next: Option<SlotIndex>,
}

impl TransactionStatus {
    pub fn new(ts: Timestamp) -> Self {
        Self {
            ts,
            tc: UNCOMMITTED,
            ta: 0,
            mvv_count: 0,
            delta: None,
            notified: false,
            next: None,
        }
    }

    /// Re-initialise a recycled slot for a new transaction.
    pub fn reset(&mut self, ts: Timestamp) {
        self.ts = ts;
        self.tc = UNCOMMITTED;
        self.ta = 0;
        self.mvv_count = 0;
        self.delta = None;
        self.notified = false;
        self.next = None;
    }

    pub fn is_aborted(&self) -> bool {
        self.tc == ABORTED
    }

    pub fn is_committed(&self) -> bool {
        self.tc > 0 && self.tc != UNCOMMITTED
    }

    pub fn is_active(&self) -> bool {
        self.tc == UNCOMMITTED || is_committing(self.tc)
    }

    /// Visibility of this transaction's versions to a reader that started
    /// at `reader_ts`.
    pub fn visibility(&self, reader_ts: Timestamp) -> Visibility {
        // A transaction always sees its own writes.
        if self.ts == reader_ts {
            return Visibility::Visible;
        }
        if self.tc == ABORTED {
            return Visibility::NotVisible;
        }
        if is_committing(self.tc) {
            // Provisional commit below the reader: the outcome decides, so
            // the reader must wait for it.
            return if -self.tc < reader_ts { Visibility::Retry } else { Visibility::NotVisible };
        }
        if self.tc == UNCOMMITTED {
            return Visibility::NotVisible;
        }
        if self.tc < reader_ts { Visibility::Visible } else { Visibility::NotVisible }
    }
}

/// One per-transaction contribution to an accumulator.
///
/// Nodes live in a per-bucket arena with a free list; a vacant node keeps
/// `accumulator` as `None`.
#[derive(Debug)]
pub struct DeltaNode {
    pub accumulator: Option<Arc<Accumulator>>,
    /// Intra-transaction ordering index.
    pub step: u32,
    pub value: i64,
    pub next: Option<SlotIndex>,
}

impl DeltaNode {
    pub fn vacant() -> Self {
        Self {
            accumulator: None,
            step: 0,
            value: 0,
            next: None,
        }
    }

    pub fn clear(&mut self) {
        self.accumulator = None;
        self.step = 0;
        self.value = 0;
        self.next = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_timestamp_always_visible() {
        let status = TransactionStatus::new(100);
        assert_eq!(status.visibility(100), Visibility::Visible);
    }

    #[test]
    fn test_uncommitted_not_visible() {
        let status = TransactionStatus::new(200);
        assert_eq!(status.visibility(201), Visibility::NotVisible);
    }

    #[test]
    fn test_committed_visible_to_later_reader_only() {
        let mut status = TransactionStatus::new(100);
        status.tc = 101;
        status.notified = true;
        assert_eq!(status.visibility(102), Visibility::Visible);
        // A reader that started at or before the commit does not see it.
        assert_eq!(status.visibility(101), Visibility::NotVisible);
        assert_eq!(status.visibility(99), Visibility::NotVisible);
    }

    #[test]
    fn test_aborted_not_visible() {
        let mut status = TransactionStatus::new(300);
        status.tc = ABORTED;
        status.notified = true;
        assert_eq!(status.visibility(301), Visibility::NotVisible);
    }

    #[test]
    fn test_commit_in_progress_retry() {
        let mut status = TransactionStatus::new(100);
        status.tc = -101;
        assert_eq!(status.visibility(102), Visibility::Retry);
        // Provisional timestamp at or above the reader can never become
        // visible, so there is nothing to wait for.
        assert_eq!(status.visibility(101), Visibility::NotVisible);
        assert_eq!(status.visibility(100), Visibility::Visible); // own writes
    }

    #[test]
    fn test_reset_recycles_slot() {
        let mut status = TransactionStatus::new(100);
        status.tc = 101;
        status.mvv_count = 7;
        status.notified = true;
        status.next = Some(3);
        status.reset(500);
        assert_eq!(status.ts, 500);
        assert_eq!(status.tc, UNCOMMITTED);
        assert_eq!(status.mvv_count, 0);
        assert!(!status.notified);
        assert!(status.next.is_none());
        assert!(status.is_active());
    }
}
