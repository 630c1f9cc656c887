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

// Buffer pool
// In-memory page frames with dirty tracking. The checkpoint manager and
// journal depend on three guarantees: `flush_buffers(t)` journals every
// dirty page modified before `t`; `earliest_dirty_timestamp` reports the
// oldest unflushed modification; transient frames (timestamp -1) are never
// journaled. Replacement policy beyond a simple clean-frame eviction is
// deliberately out of scope.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{EngineError, EngineResult};
use crate::journal::manager::JournalManager;
use crate::journal::page_map::PageKey;
use crate::tx::timestamp::{TRANSIENT, Timestamp};
use crate::volume::VolumeRegistry;

/// Buffer pool statistics
#[derive(Debug, Default)]
pub struct BufferStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub flushes: AtomicU64,
    pub evictions: AtomicU64,
}

impl BufferStats {
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 { 0.0 } else { hits as f64 / total as f64 }
    }
}

/// One cached page.
#[derive(Debug)]
pub struct BufferFrame {
    key: PageKey,
    data: RwLock<Vec<u8>>,
    /// Timestamp of the last modification; `TRANSIENT` marks frames that
    /// must never reach the journal.
    timestamp: AtomicI64,
    dirty: AtomicBool,
}

impl BufferFrame {
    pub fn key(&self) -> PageKey {
        self.key
    }

    pub fn data(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read()
    }

    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.data.write()
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn is_transient(&self) -> bool {
        self.timestamp() == TRANSIENT
    }
}

/// The pool.
pub struct BufferPool {
    journal: Arc<JournalManager>,
    registry: Arc<VolumeRegistry>,
    frames: Mutex<HashMap<PageKey, Arc<BufferFrame>>>,
    capacity: usize,
    page_size: usize,
    stats: BufferStats,
}

impl BufferPool {
    pub fn new(journal: Arc<JournalManager>, registry: Arc<VolumeRegistry>, capacity: usize, page_size: usize) -> Self {
        Self {
            journal,
            registry,
            frames: Mutex::new(HashMap::new()),
            capacity,
            page_size,
            stats: BufferStats::default(),
        }
    }

    pub fn stats(&self) -> &BufferStats {
        &self.stats
    }

    /// Fetches a page frame. On a miss the page is read through the page
    /// map (the journal holds images the copier has not yet migrated) and
    /// otherwise from the home volume; with `must_read` false a missing
    /// page materialises zeroed.
    pub fn get(&self, volume_handle: u32, page_address: u64, must_read: bool) -> EngineResult<Arc<BufferFrame>> {
        let key = PageKey {
            volume_handle,
            page_address,
        };
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        {
            let frames = self.frames.lock();
            if let Some(frame) = frames.get(&key) {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(frame.clone());
            }
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        let (timestamp, image) = if !must_read {
            // The caller will overwrite the whole page; skip the read.
            (0, vec![0u8; self.page_size])
        } else {
            match self.journal.read_page_image(volume_handle, page_address)? {
                Some((ts, image)) => (ts, image),
                None => {
                    let volume = self
                        .registry
                        .volume(volume_handle)
                        .ok_or_else(|| EngineError::InvariantViolation(format!("unknown volume handle {volume_handle}")))?;
                    (0, volume.read_page(page_address)?)
                }
            }
        };
        let frame = Arc::new(BufferFrame {
            key,
            data: RwLock::new(image),
            timestamp: AtomicI64::new(timestamp),
            dirty: AtomicBool::new(false),
        });

        let mut frames = self.frames.lock();
        if let Some(existing) = frames.get(&key) {
            // Raced with another reader; keep the first frame.
            return Ok(existing.clone());
        }
        if frames.len() >= self.capacity {
            self.evict_one_clean(&mut frames);
        }
        frames.insert(key, frame.clone());
        Ok(frame)
    }

    fn evict_one_clean(&self, frames: &mut HashMap<PageKey, Arc<BufferFrame>>) {
        let victim = frames.iter().find(|(_, f)| !f.is_dirty()).map(|(k, _)| *k);
        if let Some(key) = victim {
            frames.remove(&key);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Marks a frame dirty at modification timestamp `ts`.
    pub fn dirty(&self, frame: &BufferFrame, ts: Timestamp) {
        frame.timestamp.store(ts, Ordering::Release);
        frame.dirty.store(true, Ordering::Release);
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Marks a frame transient: it will never be journaled.
    pub fn set_transient(&self, frame: &BufferFrame) {
        frame.timestamp.store(TRANSIENT, Ordering::Release);
        frame.dirty.store(true, Ordering::Release);
    }

    /// Synchronously journals every dirty page whose modification
    /// timestamp is below `upto_ts`. Transient frames are skipped.
    pub fn flush_buffers(&self, upto_ts: Timestamp) -> EngineResult<()> {
        let snapshot: Vec<Arc<BufferFrame>> = self.frames.lock().values().cloned().collect();
        for frame in snapshot {
            let ts = frame.timestamp();
            if !frame.is_dirty() || ts == TRANSIENT || ts >= upto_ts {
                continue;
            }
            let image = frame.data().clone();
            self.journal.write_page(frame.key.volume_handle, frame.key.page_address, ts, &image)?;
            // A concurrent modification bumped the timestamp; leave the
            // frame dirty so the newer image is flushed later.
            if frame.timestamp() == ts {
                frame.dirty.store(false, Ordering::Release);
            }
            self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Smallest modification timestamp over all dirty, non-transient
    /// frames, or `Timestamp::MAX` when none are dirty.
    pub fn earliest_dirty_timestamp(&self) -> Timestamp {
        let frames = self.frames.lock();
        frames
            .values()
            .filter(|f| f.is_dirty() && !f.is_transient())
            .map(|f| f.timestamp())
            .min()
            .unwrap_or(Timestamp::MAX)
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// Drops every clean frame; used by tests to force read-through.
    pub fn invalidate_clean(&self) {
        let mut frames = self.frames.lock();
        frames.retain(|_, f| f.is_dirty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::volume::Volume;
    use tempfile::tempdir;

    fn pool(dir: &std::path::Path) -> (Arc<JournalManager>, Arc<VolumeRegistry>, BufferPool, u32) {
        let config = EngineConfig {
            journal_path: dir.join("journal"),
            journal_block_size: 1 << 20,
            ..Default::default()
        };
        let journal = Arc::new(JournalManager::new(&config));
        let registry = Arc::new(VolumeRegistry::new());
        let volume = Arc::new(Volume::create(dir.join("data.vol"), "data", 512).unwrap());
        let handle = journal.assign_volume_handle("data", volume.id()).unwrap();
        registry.insert_volume(handle, volume);
        let pool = BufferPool::new(journal.clone(), registry.clone(), 64, 512);
        (journal, registry, pool, handle)
    }

    #[test]
    fn test_dirty_tracking_and_earliest() {
        let dir = tempdir().unwrap();
        let (_journal, _registry, pool, vh) = pool(dir.path());

        assert_eq!(pool.earliest_dirty_timestamp(), Timestamp::MAX);

        let a = pool.get(vh, 1, false).unwrap();
        let b = pool.get(vh, 2, false).unwrap();
        pool.dirty(&a, 30);
        pool.dirty(&b, 20);
        assert_eq!(pool.earliest_dirty_timestamp(), 20);
    }

    #[test]
    fn test_flush_buffers_journals_below_limit() {
        let dir = tempdir().unwrap();
        let (journal, _registry, pool, vh) = pool(dir.path());

        let a = pool.get(vh, 1, false).unwrap();
        a.data_mut()[0] = 0xAA;
        pool.dirty(&a, 10);
        let b = pool.get(vh, 2, false).unwrap();
        pool.dirty(&b, 50);

        pool.flush_buffers(30).unwrap();
        // Only the older page reached the journal.
        assert_eq!(journal.page_map_len(), 1);
        assert!(!a.is_dirty());
        assert!(b.is_dirty());
        assert_eq!(pool.earliest_dirty_timestamp(), 50);

        pool.flush_buffers(Timestamp::MAX).unwrap();
        assert_eq!(journal.page_map_len(), 2);
        assert_eq!(pool.earliest_dirty_timestamp(), Timestamp::MAX);
    }

    #[test]
    fn test_transient_pages_never_journaled() {
        let dir = tempdir().unwrap();
        let (journal, _registry, pool, vh) = pool(dir.path());

        let frame = pool.get(vh, 3, false).unwrap();
        pool.set_transient(&frame);
        assert!(frame.is_transient());
        pool.flush_buffers(Timestamp::MAX).unwrap();
        assert_eq!(journal.page_map_len(), 0);
        assert_eq!(pool.earliest_dirty_timestamp(), Timestamp::MAX);
    }

    #[test]
    fn test_read_through_journal_after_drop() {
        let dir = tempdir().unwrap();
        let (_journal, _registry, pool, vh) = pool(dir.path());

        let frame = pool.get(vh, 4, false).unwrap();
        frame.data_mut()[7] = 0x77;
        pool.dirty(&frame, 11);
        pool.flush_buffers(Timestamp::MAX).unwrap();

        // Evict everything clean, then fault the page back in: the image
        // must come from the journal because the copier has not run.
        pool.invalidate_clean();
        let frame = pool.get(vh, 4, true).unwrap();
        assert_eq!(frame.data()[7], 0x77);
        assert_eq!(frame.timestamp(), 11);
    }

    #[test]
    fn test_read_from_volume_when_not_journaled() {
        let dir = tempdir().unwrap();
        let (_journal, registry, pool, vh) = pool(dir.path());

        let volume = registry.volume(vh).unwrap();
        let mut image = vec![0u8; 512];
        image[0] = 0x42;
        volume.write_page(6, &image).unwrap();

        let frame = pool.get(vh, 6, true).unwrap();
        assert_eq!(frame.data()[0], 0x42);
    }
}
