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

//! Quarry storage engine core
//!
//! An embedded, transactional, page-oriented storage engine: clients open
//! volumes containing named trees and read and write under
//! snapshot-isolation MVCC. Durability and crash recovery come from an
//! append-only journal with periodic checkpoints; a background copier
//! migrates journaled pages back to their home volumes.

pub mod buffer;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod journal;
pub mod tx;
pub mod volume;

// Public exports
pub use buffer::{BufferFrame, BufferPool, BufferStats};
pub use checkpoint::{Checkpoint, CheckpointManager};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use tx::{Accumulator, AccumulatorType, CommitPolicy, Timestamp, TimestampAllocator, Transaction, TransactionIndex};
pub use volume::{Tree, Volume, VolumeRegistry};
