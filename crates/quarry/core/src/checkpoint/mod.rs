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

// Checkpoint manager
// Establishes globally consistent recovery points. A checkpoint at `t` is
// complete once the accumulator snapshots at `t` are persisted, every page
// modified before `t` is journaled, and the CP record itself is durable,
// in that order. Proposals come from a polled timer; the operation itself
// never runs concurrently with itself.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::buffer::BufferPool;
use crate::config::{EngineConfig, SHORT_DELAY};
use crate::error::{EngineError, EngineResult};
use crate::journal::manager::JournalManager;
use crate::tx::index::TransactionIndex;
use crate::tx::timestamp::Timestamp;
use crate::tx::transaction::{CommitPolicy, Transaction};
use crate::volume::{DIRECTORY_TREE_NAME, VolumeRegistry, accumulator_key};

/// A proposed or completed recovery point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub timestamp: Timestamp,
    pub system_time_millis: u64,
    /// True once the CP record is durable and every page modified before
    /// `timestamp` has been journaled.
    pub completed: bool,
}

pub struct CheckpointManager {
    index: Arc<TransactionIndex>,
    journal: Arc<JournalManager>,
    pool: Arc<BufferPool>,
    registry: Arc<VolumeRegistry>,
    /// Proposed checkpoints whose page flushes are still catching up.
    outstanding: Mutex<VecDeque<Checkpoint>>,
    /// Serialises `create_checkpoint` against itself.
    serial: Mutex<()>,
    closed: Arc<AtomicBool>,
    fast_close: AtomicBool,
    close_timeout: Duration,
    interval: Duration,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CheckpointManager {
    pub fn new(
        index: Arc<TransactionIndex>,
        journal: Arc<JournalManager>,
        pool: Arc<BufferPool>,
        registry: Arc<VolumeRegistry>,
        closed: Arc<AtomicBool>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            index,
            journal,
            pool,
            registry,
            outstanding: Mutex::new(VecDeque::new()),
            serial: Mutex::new(()),
            closed,
            fast_close: AtomicBool::new(false),
            close_timeout: config.close_timeout,
            interval: config.checkpoint_interval,
            worker: Mutex::new(None),
        }
    }

    /// Requests that the next checkpoint wait loop exit without waiting
    /// for completion.
    pub fn set_fast_close(&self) {
        self.fast_close.store(true, Ordering::Release);
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.lock().len()
    }

    /// Creates a checkpoint and drives it to completion (unless a fast
    /// close interrupts the wait). Returns it with its final state.
    pub fn create_checkpoint(&self) -> EngineResult<Checkpoint> {
        let _serial = self.serial.lock();

        let t = self.index.allocator().next();
        // Drain commits racing below the checkpoint timestamp so that
        // "committed before t" is a stable set.
        self.index.wait_for_commits_below(t, self.close_timeout)?;

        self.save_accumulator_snapshots(t)?;

        let mut checkpoint = Checkpoint {
            timestamp: t,
            system_time_millis: SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64,
            completed: false,
        };
        self.outstanding.lock().push_back(checkpoint);

        // Every page modified before t must reach the journal before the
        // CP record may be written.
        self.pool.flush_buffers(t)?;

        let deadline = Instant::now() + self.close_timeout;
        loop {
            let earliest = self.pool.earliest_dirty_timestamp();
            {
                let mut outstanding = self.outstanding.lock();
                while let Some(front) = outstanding.front().copied() {
                    if front.timestamp > earliest {
                        break;
                    }
                    self.journal.write_checkpoint(front.timestamp, front.system_time_millis)?;
                    outstanding.pop_front();
                    if front.timestamp == t {
                        checkpoint.completed = true;
                    }
                    info!(timestamp = front.timestamp, "checkpoint completed");
                }
                if outstanding.is_empty() {
                    return Ok(checkpoint);
                }
            }
            if self.fast_close.load(Ordering::Acquire) {
                return Ok(checkpoint);
            }
            if self.closed.load(Ordering::Acquire) {
                return Err(EngineError::Interrupted(format!("checkpoint at {t}")));
            }
            if Instant::now() >= deadline {
                return Err(EngineError::Timeout(self.close_timeout, format!("checkpoint at {t}")));
            }
            std::thread::sleep(SHORT_DELAY);
        }
    }

    /// Persists every accumulator's snapshot at `t` into its volume's
    /// directory tree, through an internal hard-committed transaction.
    fn save_accumulator_snapshots(&self, t: Timestamp) -> EngineResult<()> {
        let mut txn = Transaction::begin(self.index.clone(), self.journal.clone(), self.registry.clone(), true);
        let mut saved = Vec::new();
        for tree in self.registry.trees() {
            if tree.name() == DIRECTORY_TREE_NAME {
                continue;
            }
            for acc in tree.accumulators() {
                let value = self.index.accumulator_snapshot(&acc, t, u32::MAX)?;
                let directory = self
                    .registry
                    .tree_by_name(tree.volume_handle(), DIRECTORY_TREE_NAME)
                    .ok_or_else(|| {
                        EngineError::InvariantViolation(format!(
                            "volume {} has no directory tree",
                            tree.volume_handle()
                        ))
                    })?;
                let mut bytes = [0u8; 9];
                bytes[0] = acc.acc_type().code();
                bytes[1..9].copy_from_slice(&value.to_be_bytes());
                txn.store(&directory, &accumulator_key(tree.name(), acc.index()), &bytes)?;
                saved.push((acc, value));
            }
        }
        if saved.is_empty() {
            txn.abort()?;
            return Ok(());
        }
        txn.commit(CommitPolicy::Hard)?;
        for (acc, value) in saved {
            acc.note_checkpoint(value, t);
        }
        Ok(())
    }

    /// Spawns the periodic proposal worker.
    pub fn start_worker(self: &Arc<Self>) {
        let manager = self.clone();
        let handle = std::thread::Builder::new()
            .name("quarry-checkpoint".to_string())
            .spawn(move || manager.run())
            .expect("spawn checkpoint thread");
        *self.worker.lock() = Some(handle);
    }

    fn run(&self) {
        let mut last = Instant::now();
        while !self.closed.load(Ordering::Acquire) {
            std::thread::sleep(SHORT_DELAY.min(self.interval));
            if self.closed.load(Ordering::Acquire) {
                break;
            }
            if last.elapsed() < self.interval {
                continue;
            }
            match self.create_checkpoint() {
                Ok(cp) => {
                    last = Instant::now();
                    if !cp.completed {
                        warn!(timestamp = cp.timestamp, "checkpoint left incomplete");
                    }
                }
                Err(EngineError::Closed) | Err(EngineError::Interrupted(_)) => break,
                Err(err) => warn!(error = %err, "periodic checkpoint failed"),
            }
            // Opportunistic status reclamation rides the same cadence.
            self.index.cleanup();
        }
    }

    /// Joins the worker; the shared closed flag must already be set.
    pub fn stop_worker(&self) {
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::manager::JournalManager;
    use crate::tx::accumulator::AccumulatorType;
    use crate::tx::timestamp::TimestampAllocator;
    use crate::volume::{Tree, Volume};
    use tempfile::tempdir;

    struct Harness {
        index: Arc<TransactionIndex>,
        journal: Arc<JournalManager>,
        pool: Arc<BufferPool>,
        registry: Arc<VolumeRegistry>,
        manager: CheckpointManager,
        volume_handle: u32,
    }

    fn harness(dir: &std::path::Path) -> Harness {
        let config = EngineConfig {
            journal_path: dir.join("journal"),
            page_size: 256,
            ..Default::default()
        };
        let allocator = Arc::new(TimestampAllocator::new());
        let index = Arc::new(TransactionIndex::new(allocator, &config));
        let journal = Arc::new(JournalManager::new(&config));
        let registry = Arc::new(VolumeRegistry::new());
        let volume = Arc::new(Volume::create(dir.join("data.vol"), "data", 256).unwrap());
        let volume_handle = journal.assign_volume_handle("data", volume.id()).unwrap();
        registry.insert_volume(volume_handle, volume);
        let dir_handle = journal.assign_tree_handle(volume_handle, DIRECTORY_TREE_NAME).unwrap();
        registry.insert_tree(Arc::new(Tree::new(DIRECTORY_TREE_NAME, dir_handle, volume_handle)));
        let pool = Arc::new(BufferPool::new(journal.clone(), registry.clone(), 64, 256));
        let closed = Arc::new(AtomicBool::new(false));
        let manager = CheckpointManager::new(
            index.clone(),
            journal.clone(),
            pool.clone(),
            registry.clone(),
            closed,
            &config,
        );
        Harness {
            index,
            journal,
            pool,
            registry,
            manager,
            volume_handle,
        }
    }

    fn tree(h: &Harness, name: &str) -> Arc<Tree> {
        let handle = h.journal.assign_tree_handle(h.volume_handle, name).unwrap();
        let tree = Arc::new(Tree::new(name, handle, h.volume_handle));
        h.registry.insert_tree(tree.clone());
        tree
    }

    #[test]
    fn test_empty_checkpoint_completes() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path());
        let cp = h.manager.create_checkpoint().unwrap();
        assert!(cp.completed);
        assert_eq!(h.manager.outstanding_count(), 0);
        assert_eq!(h.journal.last_valid_checkpoint().unwrap().timestamp, cp.timestamp);
    }

    #[test]
    fn test_accumulator_snapshot_persisted() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path());
        let orders = tree(&h, "orders");
        let acc = orders.accumulator(AccumulatorType::Sum, 3).unwrap();

        let mut txn = Transaction::begin(h.index.clone(), h.journal.clone(), h.registry.clone(), false);
        txn.update_accumulator(&acc, 41).unwrap();
        txn.commit(CommitPolicy::Hard).unwrap();

        let cp = h.manager.create_checkpoint().unwrap();
        assert!(cp.completed);
        assert_eq!(acc.checkpoint_value(), 41);
        assert_eq!(acc.checkpoint_timestamp(), cp.timestamp);
        assert!(!acc.is_checkpoint_needed());

        let directory = h.registry.tree_by_name(h.volume_handle, DIRECTORY_TREE_NAME).unwrap();
        let value = directory.get(&accumulator_key("orders", 3)).unwrap();
        assert_eq!(value[0], AccumulatorType::Sum.code());
        assert_eq!(i64::from_be_bytes(value[1..9].try_into().unwrap()), 41);
    }

    #[test]
    fn test_uncommitted_updates_not_checkpointed() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path());
        let orders = tree(&h, "orders");
        let acc = orders.accumulator(AccumulatorType::Sum, 0).unwrap();

        let txn = Transaction::begin(h.index.clone(), h.journal.clone(), h.registry.clone(), false);
        txn.update_accumulator(&acc, 7).unwrap();
        // Not committed: the snapshot at the checkpoint timestamp is base.
        let cp = h.manager.create_checkpoint().unwrap();
        assert!(cp.completed);
        assert_eq!(acc.checkpoint_value(), 0);
        drop(txn);
    }

    #[test]
    fn test_dirty_pages_fence_checkpoint() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path());

        let frame = h.pool.get(h.volume_handle, 5, false).unwrap();
        frame.data_mut()[0] = 9;
        h.pool.dirty(&frame, h.index.allocator().next());

        let cp = h.manager.create_checkpoint().unwrap();
        assert!(cp.completed);
        // The page modified before t was journaled by the flush.
        assert!(h.pool.earliest_dirty_timestamp() > cp.timestamp);
        assert_eq!(h.journal.page_map_len(), 1);
    }

    #[test]
    fn test_transient_pages_do_not_fence() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path());

        let frame = h.pool.get(h.volume_handle, 6, false).unwrap();
        h.pool.set_transient(&frame);

        let cp = h.manager.create_checkpoint().unwrap();
        assert!(cp.completed);
        assert_eq!(h.journal.page_map_len(), 0);
    }
}
