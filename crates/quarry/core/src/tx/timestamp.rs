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

// Timestamp allocation
// The sole source of logical timestamps for the whole engine: transaction
// starts and commits, page modifications and checkpoints all draw from one
// monotone counter.

use std::sync::atomic::{AtomicI64, Ordering};

/// Logical timestamp. Positive for every issued value; the negative range
/// is reserved for the commit-in-progress encoding and the transient-page
/// marker.
pub type Timestamp = i64;

/// Sentinel commit timestamp of a transaction that has not committed.
pub const UNCOMMITTED: Timestamp = i64::MAX;

/// Sentinel commit timestamp of an aborted transaction.
pub const ABORTED: Timestamp = i64::MIN;

/// Modification timestamp stamped on transient buffer-pool pages. Pages
/// carrying it are never written to the journal.
pub const TRANSIENT: Timestamp = -1;

/// True if `tc` encodes a commit in progress; the provisional commit
/// timestamp is `-tc`.
#[inline]
pub fn is_committing(tc: Timestamp) -> bool {
    tc < 0 && tc != ABORTED
}

/// Monotone 64-bit logical clock.
///
/// Concurrent `next()` calls never observe equal values. Overflow is not
/// expected within the 64-bit range and is not handled.
#[derive(Debug)]
pub struct TimestampAllocator {
    counter: AtomicI64,
}

impl TimestampAllocator {
    /// Starts the clock at zero; the first `next()` returns 1.
    pub fn new() -> Self {
        Self { counter: AtomicI64::new(0) }
    }

    /// Current value; the largest timestamp issued so far.
    #[inline]
    pub fn now(&self) -> Timestamp {
        self.counter.load(Ordering::Acquire)
    }

    /// Issues a fresh timestamp strictly greater than every previous one.
    #[inline]
    pub fn next(&self) -> Timestamp {
        self.counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Raises the clock to at least `t`. Used by recovery so that newly
    /// issued timestamps exceed everything found in the journal.
    pub fn update_if_greater(&self, t: Timestamp) {
        let mut current = self.counter.load(Ordering::Acquire);
        while t > current {
            match self
                .counter
                .compare_exchange_weak(current, t, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

impl Default for TimestampAllocator {
    fn default() -> Self {
        Self::new()
    }
}
