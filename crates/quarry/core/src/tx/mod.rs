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

// Transaction Module
// Timestamps, transaction statuses, the bucketed transaction index,
// accumulators and the client transaction handle

pub mod accumulator;
pub mod index;
pub mod status;
pub mod timestamp;
pub mod transaction;

// Public exports
pub use accumulator::{Accumulator, AccumulatorType};
pub use index::{AccumulatorDelta, BUCKET_COUNT, TransactionIndex, TransactionIndexStats, TxnRef};
pub use status::{MVV_COUNT_UNKNOWN, TransactionStatus, Visibility};
pub use timestamp::{ABORTED, TRANSIENT, Timestamp, TimestampAllocator, UNCOMMITTED};
pub use transaction::{CommitPolicy, Transaction};
