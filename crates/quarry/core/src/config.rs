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

// Engine configuration
// Plain data; loading from files or the environment is a client concern.

use std::path::PathBuf;
use std::time::Duration;

use crate::tx::timestamp::Timestamp;

/// Lower bound for the checkpoint proposal interval.
pub const MIN_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(10);
/// Upper bound for the checkpoint proposal interval.
pub const MAX_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(1800);
/// Delay between polls while waiting on dirty pages or worker wake-ups.
pub const SHORT_DELAY: Duration = Duration::from_millis(500);

/// Configuration options consumed by the engine core.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base path of the journal; files are named `<path>.<16-digit generation>`.
    pub journal_path: PathBuf,
    /// Bytes per journal file. Default 1 GiB; sensible range 16 MiB..64 GiB.
    pub journal_block_size: u64,
    /// Size of the in-memory journal staging buffer.
    pub write_buffer_size: usize,
    /// Interval between checkpoint proposals. Clamped to [10s, 1800s].
    pub checkpoint_interval: Duration,
    /// Active statuses above which a bucket moves stragglers to `long_running`.
    pub long_running_threshold: usize,
    /// Maximum recycled transaction-status slots kept per bucket.
    pub max_free_list_size: usize,
    /// Maximum recycled delta nodes kept per bucket.
    pub max_free_delta_list_size: usize,
    /// Page copies attempted per copier cycle.
    pub copies_per_cycle: usize,
    /// Advanced: caps the timestamp below which the copier will migrate pages.
    pub copier_timestamp_limit: Timestamp,
    /// When true, the copier neither writes pages back nor deletes files.
    pub append_only: bool,
    /// When true, copier urgency is pinned to maximum and the current file
    /// boundary is ignored, draining the page map as fast as possible.
    pub copy_fast: bool,
    /// Volume page size in bytes.
    pub page_size: usize,
    /// Maximum frames held by the buffer pool.
    pub buffer_pool_size: usize,
    /// Period of the background journal flusher.
    pub flush_interval: Duration,
    /// Bound on waits during `close`.
    pub close_timeout: Duration,
    /// Attempts an accumulator snapshot makes before reporting a timeout.
    pub snapshot_retry_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            journal_path: PathBuf::from("./quarry_journal"),
            journal_block_size: 1024 * 1024 * 1024, // 1 GiB
            write_buffer_size: 4 * 1024 * 1024,     // 4 MiB
            checkpoint_interval: Duration::from_secs(120),
            long_running_threshold: 10_000,
            max_free_list_size: 512,
            max_free_delta_list_size: 4096,
            copies_per_cycle: 1000,
            copier_timestamp_limit: Timestamp::MAX,
            append_only: false,
            copy_fast: false,
            page_size: 16 * 1024,
            buffer_pool_size: 4096,
            flush_interval: Duration::from_secs(5),
            close_timeout: Duration::from_secs(60),
            snapshot_retry_limit: 10,
        }
    }
}

impl EngineConfig {
    /// Returns a copy with out-of-range intervals clamped to their
    /// documented bounds. Sizes are left untouched so embedders (and the
    /// test suite) can shrink the journal block for fast rollover.
    pub fn normalized(mut self) -> Self {
        if self.checkpoint_interval < MIN_CHECKPOINT_INTERVAL {
            self.checkpoint_interval = MIN_CHECKPOINT_INTERVAL;
        }
        if self.checkpoint_interval > MAX_CHECKPOINT_INTERVAL {
            self.checkpoint_interval = MAX_CHECKPOINT_INTERVAL;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.journal_block_size, 1024 * 1024 * 1024);
        assert_eq!(config.write_buffer_size, 4 * 1024 * 1024);
        assert_eq!(config.checkpoint_interval, Duration::from_secs(120));
        assert_eq!(config.long_running_threshold, 10_000);
        assert_eq!(config.copies_per_cycle, 1000);
        assert!(!config.append_only);
        assert!(!config.copy_fast);
    }

    #[test]
    fn test_checkpoint_interval_clamped() {
        let config = EngineConfig {
            checkpoint_interval: Duration::from_secs(1),
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.checkpoint_interval, MIN_CHECKPOINT_INTERVAL);

        let config = EngineConfig {
            checkpoint_interval: Duration::from_secs(10_000),
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.checkpoint_interval, MAX_CHECKPOINT_INTERVAL);
    }

    #[test]
    fn test_block_size_not_clamped() {
        // Embedders may shrink the block below the documented minimum, e.g.
        // to exercise rollover quickly.
        let config = EngineConfig {
            journal_block_size: 1024 * 1024,
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.journal_block_size, 1024 * 1024);
    }
}
