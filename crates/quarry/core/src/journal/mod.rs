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

// Journal Module
// The write-ahead journal: record formats, the serialised writer with its
// page and transaction maps, the background copier, and recovery

pub mod copier;
pub mod manager;
pub mod page_map;
pub mod record;
pub mod recovery;

// Public exports
pub use copier::{CopierStats, JournalCopier};
pub use manager::{CheckpointInfo, JournalManager, LiveTransaction, TransactionUpdate, TreeIdent, VolumeIdent};
pub use page_map::{CopyCandidate, PageKey, PageMap, PageNode};
pub use record::{JournalRecord, PageMapEntry, RecordHeader, RecordType, TransactionMapEntry};
pub use recovery::{RecoveryManager, RecoverySummary};
