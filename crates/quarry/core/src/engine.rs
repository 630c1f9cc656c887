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

// Engine
// The single handle owning every subsystem: timestamp allocator,
// transaction index, journal, buffer pool, volumes and the background
// workers. There are no ambient singletons; everything reaches its
// collaborators through this handle.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::buffer::BufferPool;
use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::config::{EngineConfig, SHORT_DELAY};
use crate::error::{EngineError, EngineResult};
use crate::journal::copier::JournalCopier;
use crate::journal::manager::JournalManager;
use crate::journal::recovery::{RecoveryManager, RecoverySummary};
use crate::tx::index::TransactionIndex;
use crate::tx::timestamp::TimestampAllocator;
use crate::tx::transaction::Transaction;
use crate::volume::{DIRECTORY_TREE_NAME, Tree, Volume, VolumeRegistry};

pub struct Engine {
    config: EngineConfig,
    allocator: Arc<TimestampAllocator>,
    index: Arc<TransactionIndex>,
    journal: Arc<JournalManager>,
    registry: Arc<VolumeRegistry>,
    pool: Arc<BufferPool>,
    copier: Arc<JournalCopier>,
    checkpoints: Arc<CheckpointManager>,
    /// Signals every background worker to wind down.
    closed: Arc<AtomicBool>,
    /// Cleared first during close so no new client transactions start.
    accepting: AtomicBool,
    flusher: Mutex<Option<JoinHandle<()>>>,
    recovery: Option<RecoverySummary>,
}

impl Engine {
    /// Opens the engine: recovers the journal if one exists, then starts
    /// the checkpoint, copier and flusher workers.
    pub fn open(config: EngineConfig) -> EngineResult<Engine> {
        let config = config.normalized();
        let allocator = Arc::new(TimestampAllocator::new());
        let index = Arc::new(TransactionIndex::new(allocator.clone(), &config));
        let journal = Arc::new(JournalManager::new(&config));
        let registry = Arc::new(VolumeRegistry::new());

        let recovery = RecoveryManager::new(&config, &journal, &registry, &index, &allocator).recover()?;
        if let Some(summary) = &recovery {
            info!(
                keystone = summary.keystone_generation,
                committed = summary.committed_replayed,
                uncommitted = summary.uncommitted.len(),
                "journal recovered"
            );
        }

        let pool = Arc::new(BufferPool::new(
            journal.clone(),
            registry.clone(),
            config.buffer_pool_size,
            config.page_size,
        ));
        let closed = Arc::new(AtomicBool::new(false));
        let copier = Arc::new(JournalCopier::new(journal.clone(), registry.clone(), closed.clone(), &config));
        let checkpoints = Arc::new(CheckpointManager::new(
            index.clone(),
            journal.clone(),
            pool.clone(),
            registry.clone(),
            closed.clone(),
            &config,
        ));

        copier.start();
        checkpoints.start_worker();
        let flusher = Self::start_flusher(journal.clone(), closed.clone(), &config);

        Ok(Engine {
            config,
            allocator,
            index,
            journal,
            registry,
            pool,
            copier,
            checkpoints,
            closed,
            accepting: AtomicBool::new(true),
            flusher: Mutex::new(Some(flusher)),
            recovery,
        })
    }

    fn start_flusher(journal: Arc<JournalManager>, closed: Arc<AtomicBool>, config: &EngineConfig) -> JoinHandle<()> {
        let interval = config.flush_interval;
        std::thread::Builder::new()
            .name("quarry-flusher".to_string())
            .spawn(move || {
                let mut elapsed = std::time::Duration::ZERO;
                while !closed.load(Ordering::Acquire) {
                    std::thread::sleep(SHORT_DELAY.min(interval));
                    elapsed += SHORT_DELAY.min(interval);
                    if elapsed < interval {
                        continue;
                    }
                    elapsed = std::time::Duration::ZERO;
                    match journal.flush() {
                        Ok(()) | Err(EngineError::Closed) => {}
                        Err(err) => warn!(error = %err, "periodic journal flush failed"),
                    }
                }
            })
            .expect("spawn flusher thread")
    }

    fn check_accepting(&self) -> EngineResult<()> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    /// Begins a client transaction.
    pub fn begin(&self) -> EngineResult<Transaction> {
        self.check_accepting()?;
        Ok(Transaction::begin(
            self.index.clone(),
            self.journal.clone(),
            self.registry.clone(),
            false,
        ))
    }

    /// Begins an internal bookkeeping session, distinct from any client
    /// transaction.
    pub fn begin_internal(&self) -> EngineResult<Transaction> {
        self.check_accepting()?;
        Ok(Transaction::begin(
            self.index.clone(),
            self.journal.clone(),
            self.registry.clone(),
            true,
        ))
    }

    /// Opens (or creates) a volume file and registers it with the
    /// journal. The volume's directory tree is created alongside.
    pub fn open_volume<P: AsRef<Path>>(&self, path: P, name: &str) -> EngineResult<(u32, Arc<Volume>)> {
        self.check_accepting()?;
        if let Some((handle, volume)) = self.registry.volume_by_name(name) {
            return Ok((handle, volume));
        }
        let volume = if path.as_ref().exists() {
            Volume::open(path)?
        } else {
            Volume::create(path, name, self.config.page_size)?
        };
        let volume = Arc::new(volume);
        let handle = self.journal.assign_volume_handle(name, volume.id())?;
        self.registry.insert_volume(handle, volume.clone());
        self.tree(handle, DIRECTORY_TREE_NAME)?;
        Ok((handle, volume))
    }

    /// Returns the named tree of a volume, creating it on first use.
    pub fn tree(&self, volume_handle: u32, name: &str) -> EngineResult<Arc<Tree>> {
        if let Some(tree) = self.registry.tree_by_name(volume_handle, name) {
            return Ok(tree);
        }
        let handle = self.journal.assign_tree_handle(volume_handle, name)?;
        let tree = Arc::new(Tree::new(name, handle, volume_handle));
        self.registry.insert_tree(tree.clone());
        Ok(tree)
    }

    /// Creates a checkpoint now, regardless of the polled timer.
    pub fn checkpoint(&self) -> EngineResult<Checkpoint> {
        self.check_accepting()?;
        self.checkpoints.create_checkpoint()
    }

    pub fn allocator(&self) -> &Arc<TimestampAllocator> {
        &self.allocator
    }

    pub fn transaction_index(&self) -> &Arc<TransactionIndex> {
        &self.index
    }

    pub fn journal(&self) -> &Arc<JournalManager> {
        &self.journal
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn copier(&self) -> &Arc<JournalCopier> {
        &self.copier
    }

    pub fn registry(&self) -> &Arc<VolumeRegistry> {
        &self.registry
    }

    /// Recovery outcome of this open, if a journal existed.
    pub fn recovery_summary(&self) -> Option<&RecoverySummary> {
        self.recovery.as_ref()
    }

    /// Closes the engine. With `flush` a final checkpoint fences all
    /// state and the journal ends with a JE record; without it the
    /// checkpoint loop is cut short and shutdown is immediate.
    pub fn close(&self, flush: bool) -> EngineResult<()> {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        info!(flush, "closing engine");
        if flush {
            match self.checkpoints.create_checkpoint() {
                Ok(cp) if cp.completed => {}
                Ok(cp) => warn!(timestamp = cp.timestamp, "final checkpoint incomplete"),
                Err(err) => warn!(error = %err, "final checkpoint failed"),
            }
        } else {
            self.checkpoints.set_fast_close();
        }
        self.closed.store(true, Ordering::Release);
        self.checkpoints.stop_worker();
        self.copier.stop();
        if let Some(handle) = self.flusher.lock().take() {
            let _ = handle.join();
        }
        self.journal.close(flush)?;
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.close(false);
    }
}
