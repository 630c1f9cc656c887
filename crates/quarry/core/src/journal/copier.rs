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

// Journal copier
// The single background thread that migrates checkpointed page images
// from the journal back to their home volumes, prunes the page map, and
// deletes journal files nothing references any more. Its pace follows a
// self-assessed urgency in [0, 10].

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::journal::manager::JournalManager;
use crate::tx::timestamp::Timestamp;
use crate::volume::VolumeRegistry;

/// Maximum urgency.
const URGENT: u64 = 10;

/// Page-map size that contributes one full urgency point.
const PAGE_MAP_SIZE_BASE: usize = 10_000;

/// Copier counters.
#[derive(Debug, Default)]
pub struct CopierStats {
    pub cycles: AtomicU64,
    pub pages_copied: AtomicU64,
    pub files_deleted: AtomicU64,
    pub last_urgency: AtomicU64,
}

pub struct JournalCopier {
    journal: Arc<JournalManager>,
    registry: Arc<VolumeRegistry>,
    closed: Arc<AtomicBool>,
    copies_per_cycle: usize,
    timestamp_limit: Timestamp,
    append_only: bool,
    copy_fast: bool,
    kick: Mutex<bool>,
    kicked: Condvar,
    handle: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<CopierStats>,
}

impl JournalCopier {
    pub fn new(
        journal: Arc<JournalManager>,
        registry: Arc<VolumeRegistry>,
        closed: Arc<AtomicBool>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            journal,
            registry,
            closed,
            copies_per_cycle: config.copies_per_cycle,
            timestamp_limit: config.copier_timestamp_limit,
            append_only: config.append_only,
            copy_fast: config.copy_fast,
            kick: Mutex::new(false),
            kicked: Condvar::new(),
            handle: Mutex::new(None),
            stats: Arc::new(CopierStats::default()),
        }
    }

    pub fn stats(&self) -> &CopierStats {
        &self.stats
    }

    /// Current copier pressure in [0, 10]: page-map growth plus journal
    /// file count, saturated by `copy_fast`.
    pub fn urgency(&self) -> u64 {
        if self.copy_fast {
            return URGENT;
        }
        let from_map = (self.journal.page_map_len() / PAGE_MAP_SIZE_BASE) as u64;
        let from_files = self.journal.file_count().map(|n| n.saturating_sub(1) as u64).unwrap_or(0);
        (from_map + from_files).min(URGENT)
    }

    /// One copy cycle: collect, copy, fsync volumes, prune, delete files.
    /// Returns the number of pages migrated.
    pub fn run_cycle(&self) -> EngineResult<usize> {
        if self.append_only {
            return Ok(0);
        }
        let candidates = self
            .journal
            .copy_candidates(self.timestamp_limit, self.copies_per_cycle, self.copy_fast);
        if candidates.is_empty() {
            // Still advance the base address past pruned chains.
            self.journal.note_copied(&[]);
            let deleted = self.journal.delete_obsolete_files()?;
            self.stats.files_deleted.fetch_add(deleted as u64, Ordering::Relaxed);
            return Ok(0);
        }

        let mut copied = Vec::with_capacity(candidates.len());
        let mut touched = HashSet::new();
        for candidate in candidates {
            let Some(volume) = self.registry.volume(candidate.key.volume_handle) else {
                warn!(handle = candidate.key.volume_handle, "page for unknown volume left in journal");
                continue;
            };
            let (_, _, image) = self.journal.read_page_at(candidate.journal_address)?;
            volume.write_page(candidate.key.page_address, &image)?;
            touched.insert(candidate.key.volume_handle);
            copied.push(candidate);
        }
        for handle in touched {
            if let Some(volume) = self.registry.volume(handle) {
                volume.sync()?;
            }
        }

        let base = self.journal.note_copied(&copied);
        let deleted = self.journal.delete_obsolete_files()?;
        self.stats.pages_copied.fetch_add(copied.len() as u64, Ordering::Relaxed);
        self.stats.files_deleted.fetch_add(deleted as u64, Ordering::Relaxed);
        debug!(copied = copied.len(), deleted, base, "copier cycle");
        Ok(copied.len())
    }

    /// Wakes the copier before its next scheduled cycle.
    pub fn kick(&self) {
        let mut kicked = self.kick.lock();
        *kicked = true;
        self.kicked.notify_all();
    }

    /// Spawns the background thread.
    pub fn start(self: &Arc<Self>) {
        let copier = self.clone();
        let handle = std::thread::Builder::new()
            .name("quarry-copier".to_string())
            .spawn(move || copier.run())
            .expect("spawn copier thread");
        *self.handle.lock() = Some(handle);
    }

    fn run(&self) {
        while !self.closed.load(Ordering::Acquire) {
            match self.run_cycle() {
                Ok(_) => {}
                Err(err) => warn!(error = %err, "copier cycle failed"),
            }
            self.stats.cycles.fetch_add(1, Ordering::Relaxed);
            let urgency = self.urgency();
            self.stats.last_urgency.store(urgency, Ordering::Relaxed);
            let sleep = if urgency >= URGENT / 2 {
                Duration::from_millis(10)
            } else {
                Duration::from_millis((URGENT - urgency) * 250)
            };
            let mut kicked = self.kick.lock();
            if !*kicked {
                self.kicked.wait_for(&mut kicked, sleep);
            }
            *kicked = false;
        }
        debug!("copier stopped");
    }

    /// Joins the background thread; the shared closed flag must already
    /// be set.
    pub fn stop(&self) {
        self.kick();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::Volume;
    use tempfile::tempdir;

    fn harness(dir: &std::path::Path, block_size: u64, copy_fast: bool) -> (Arc<JournalManager>, Arc<VolumeRegistry>, JournalCopier, u32) {
        let config = EngineConfig {
            journal_path: dir.join("journal"),
            journal_block_size: block_size,
            copies_per_cycle: 1000,
            copy_fast,
            page_size: 256,
            ..Default::default()
        };
        let journal = Arc::new(JournalManager::new(&config));
        let registry = Arc::new(VolumeRegistry::new());
        let volume = Arc::new(Volume::create(dir.join("data.vol"), "data", 256).unwrap());
        let handle = journal.assign_volume_handle("data", volume.id()).unwrap();
        registry.insert_volume(handle, volume);
        let closed = Arc::new(AtomicBool::new(false));
        let copier = JournalCopier::new(journal.clone(), registry.clone(), closed, &config);
        (journal, registry, copier, handle)
    }

    #[test]
    fn test_copy_fast_drains_page_map() {
        let dir = tempdir().unwrap();
        let (journal, registry, copier, vh) = harness(dir.path(), 1 << 20, true);

        let mut image = vec![0u8; 256];
        for page in 1..=5u64 {
            image[0] = page as u8;
            journal.write_page(vh, page, 10 + page as Timestamp, &image).unwrap();
        }
        journal.write_checkpoint(100, 1).unwrap();

        let copied = copier.run_cycle().unwrap();
        assert_eq!(copied, 5);
        assert_eq!(journal.page_map_len(), 0);
        assert_eq!(journal.base_address(), journal.current_address());

        // The images landed in the volume.
        let volume = registry.volume(vh).unwrap();
        for page in 1..=5u64 {
            assert_eq!(volume.read_page(page).unwrap()[0], page as u8);
        }
    }

    #[test]
    fn test_nothing_copied_above_checkpoint() {
        let dir = tempdir().unwrap();
        let (journal, _registry, copier, vh) = harness(dir.path(), 1 << 20, true);

        journal.write_checkpoint(10, 1).unwrap();
        journal.write_page(vh, 1, 50, &[1u8; 256]).unwrap();
        let copied = copier.run_cycle().unwrap();
        assert_eq!(copied, 0);
        assert_eq!(journal.page_map_len(), 1);
    }

    #[test]
    fn test_rollover_and_file_deletion() {
        let dir = tempdir().unwrap();
        // Small blocks force several files.
        let (journal, _registry, copier, vh) = harness(dir.path(), 4096, true);

        let image = vec![3u8; 256];
        for page in 1..=30u64 {
            journal.write_page(vh, page, 10 + page as Timestamp, &image).unwrap();
        }
        let files_before = journal.file_count().unwrap();
        assert!(files_before >= 3, "expected several journal files, got {files_before}");

        journal.write_checkpoint(100, 1).unwrap();
        copier.run_cycle().unwrap();
        assert_eq!(journal.page_map_len(), 0);
        assert_eq!(journal.base_address(), journal.current_address());

        // File deletion is fenced by the checkpointed base address, so it
        // takes effect once the next checkpoint records the advance.
        journal.write_checkpoint(200, 2).unwrap();
        copier.run_cycle().unwrap();
        let files_after = journal.file_count().unwrap();
        assert_eq!(files_after, 1);
    }

    #[test]
    fn test_append_only_suppresses_copier() {
        let dir = tempdir().unwrap();
        let config = EngineConfig {
            journal_path: dir.path().join("journal"),
            append_only: true,
            copy_fast: true,
            page_size: 256,
            ..Default::default()
        };
        let journal = Arc::new(JournalManager::new(&config));
        let registry = Arc::new(VolumeRegistry::new());
        let volume = Arc::new(Volume::create(dir.path().join("data.vol"), "data", 256).unwrap());
        let vh = journal.assign_volume_handle("data", volume.id()).unwrap();
        registry.insert_volume(vh, volume);
        let copier = JournalCopier::new(journal.clone(), registry, Arc::new(AtomicBool::new(false)), &config);

        journal.write_page(vh, 1, 10, &[1u8; 256]).unwrap();
        journal.write_checkpoint(100, 1).unwrap();
        assert_eq!(copier.run_cycle().unwrap(), 0);
        assert_eq!(journal.page_map_len(), 1);
    }

    #[test]
    fn test_urgency_saturates_with_copy_fast() {
        let dir = tempdir().unwrap();
        let (_journal, _registry, copier, _vh) = harness(dir.path(), 1 << 20, true);
        assert_eq!(copier.urgency(), URGENT);
    }
}
