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

// Recovery
// Replays the journal tail starting at the keystone (the newest file with
// an intact CP record), rebuilding the page map, the handle maps, the
// live-transaction map and the accumulator state, and seeding the
// transaction index so pre-crash versions resolve correctly. Scanning
// stops cleanly at the dirty tail of an unclean shutdown.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::journal::manager::{
    CheckpointInfo, JournalManager, LiveTransaction, TreeIdent, VolumeIdent, generation_path, journal_generations,
};
use crate::journal::page_map::{PageKey, PageMap};
use crate::journal::record::{JournalRecord, RECORD_HEADER_SIZE, RecordHeader, RecordType};
use crate::tx::accumulator::AccumulatorType;
use crate::tx::index::TransactionIndex;
use crate::tx::timestamp::{Timestamp, TimestampAllocator};
use crate::volume::{DIRECTORY_TREE_NAME, Tree, VolumeRegistry, parse_accumulator_key};

/// Outcome of a recovery pass.
#[derive(Debug)]
pub struct RecoverySummary {
    pub keystone_generation: u64,
    pub checkpoint: Option<CheckpointInfo>,
    pub committed_replayed: usize,
    pub uncommitted: Vec<Timestamp>,
    pub max_timestamp: Timestamp,
}

/// A transaction reassembled from its TS..TC bracket.
#[derive(Debug)]
struct RecoveredTransaction {
    start_ts: Timestamp,
    commit_ts: Timestamp,
    start_address: u64,
    committed: bool,
    ops: Vec<JournalRecord>,
}

pub struct RecoveryManager<'a> {
    config: &'a EngineConfig,
    journal: &'a JournalManager,
    registry: &'a VolumeRegistry,
    index: &'a TransactionIndex,
    allocator: &'a TimestampAllocator,
}

impl<'a> RecoveryManager<'a> {
    pub fn new(
        config: &'a EngineConfig,
        journal: &'a JournalManager,
        registry: &'a VolumeRegistry,
        index: &'a TransactionIndex,
        allocator: &'a TimestampAllocator,
    ) -> Self {
        Self {
            config,
            journal,
            registry,
            index,
            allocator,
        }
    }

    /// Runs recovery. Returns `None` when no journal exists (fresh start).
    pub fn recover(&self) -> EngineResult<Option<RecoverySummary>> {
        let generations = journal_generations(&self.config.journal_path)?;
        let Some(&last_generation) = generations.last() else {
            return Ok(None);
        };

        let keystone = self
            .find_keystone(&generations)?
            .unwrap_or_else(|| generations[0]);
        info!(keystone, last_generation, "recovering journal");

        let mut scan = Scan::new(self.config.journal_block_size);
        for &generation in generations.iter().filter(|g| **g >= keystone) {
            let path = generation_path(&self.config.journal_path, generation);
            let bytes = std::fs::read(&path)?;
            let keep_going = scan.scan_file(generation, &bytes, generation == keystone, generation == last_generation)?;
            if !keep_going {
                break;
            }
        }

        let checkpoint = scan.last_checkpoint;
        let checkpoint_ts = checkpoint.map(|cp| cp.timestamp).unwrap_or(0);

        // Transactions listed by the keystone TM whose records live in
        // earlier files are reassembled by seeking back to their start.
        let mut transactions = std::mem::take(&mut scan.completed);
        for (start_ts, live) in scan.keystone_transaction_map.clone() {
            if transactions.iter().any(|t| t.start_ts == start_ts) {
                continue;
            }
            if live.committed {
                let ops = self.read_transaction_ops(live.start_address, live.commit_ts)?;
                transactions.push(RecoveredTransaction {
                    start_ts,
                    commit_ts: live.commit_ts,
                    start_address: live.start_address,
                    committed: true,
                    ops,
                });
            } else {
                transactions.push(RecoveredTransaction {
                    start_ts,
                    commit_ts: 0,
                    start_address: live.start_address,
                    committed: false,
                    ops: Vec::new(),
                });
            }
        }
        // A TS without its TC: the commit never completed.
        for (_, pending) in std::mem::take(&mut scan.pending) {
            transactions.push(pending);
        }

        // Create tree objects for every identified tree.
        for (handle, ident) in &scan.tree_handles {
            if self.registry.tree(*handle).is_none() {
                self.registry
                    .insert_tree(Arc::new(Tree::new(&ident.name, *handle, ident.volume_handle)));
            }
        }

        // Replay committed tree updates in commit order. Store and delete
        // operations are applied for every committed transaction the scan
        // can still see (the in-memory maps start empty each open);
        // accumulator deltas are fenced by the checkpoint because the
        // restored base value already folds everything at or below it.
        transactions.sort_by_key(|t| t.commit_ts);
        let mut committed_replayed = 0;
        let mut deltas: Vec<(u32, u8, u8, i64)> = Vec::new();
        for txn in transactions.iter().filter(|t| t.committed) {
            committed_replayed += 1;
            for op in &txn.ops {
                match op {
                    JournalRecord::StoreRecord { tree_handle, key, value } => {
                        if let Some(tree) = self.registry.tree(*tree_handle) {
                            tree.apply_store(key.clone(), value.clone());
                        }
                    }
                    JournalRecord::DeleteRange { tree_handle, key1, key2 } => {
                        if let Some(tree) = self.registry.tree(*tree_handle) {
                            tree.apply_delete_range(key1, key2);
                        }
                    }
                    JournalRecord::DeleteTree { tree_handle } => {
                        if let Some(tree) = self.registry.tree(*tree_handle) {
                            tree.apply_delete_all();
                        }
                    }
                    JournalRecord::TransactionDelta {
                        tree_handle,
                        index,
                        acc_type,
                        value,
                    } => {
                        if txn.commit_ts > checkpoint_ts {
                            deltas.push((*tree_handle, *index, *acc_type, *value));
                        }
                    }
                    _ => {}
                }
            }
        }

        // Accumulators: base values from the directory trees, then the
        // committed post-checkpoint deltas on top.
        self.restore_accumulators(checkpoint_ts)?;
        for (tree_handle, index, acc_type, value) in deltas {
            let Some(tree) = self.registry.tree(tree_handle) else {
                continue;
            };
            let acc_type = AccumulatorType::from_code(acc_type)?;
            let acc = tree.accumulator(acc_type, index)?;
            acc.apply_recovered_delta(value);
        }

        // Seed the transaction index.
        self.allocator.update_if_greater(scan.max_timestamp);
        let recovery_base = self.allocator.now();
        self.index.set_recovery_window(checkpoint_ts, recovery_base);
        let mut uncommitted = Vec::new();
        for txn in &transactions {
            if txn.committed {
                if txn.commit_ts > checkpoint_ts {
                    self.index.inject_recovered_commit(txn.start_ts, txn.commit_ts);
                }
            } else {
                uncommitted.push(txn.start_ts);
            }
        }

        // Install the journal manager's state; appending resumes in a new
        // generation.
        let mut live_transactions: BTreeMap<Timestamp, LiveTransaction> = BTreeMap::new();
        for txn in &transactions {
            if txn.committed && txn.commit_ts <= checkpoint_ts {
                continue;
            }
            live_transactions.insert(
                txn.start_ts,
                LiveTransaction {
                    commit_ts: txn.commit_ts,
                    start_address: txn.start_address,
                    committed: txn.committed,
                },
            );
        }
        let (page_map, branch_map) = scan.into_page_maps(checkpoint_ts);
        self.journal.install_recovered_state(
            scan_journal_created_time(&scan.keystone_header),
            scan_base_address(&scan.keystone_header, &checkpoint),
            last_generation + 1,
            scan.volume_handles,
            scan.tree_handles,
            page_map,
            branch_map,
            live_transactions,
            checkpoint,
        );

        info!(
            committed_replayed,
            uncommitted = uncommitted.len(),
            checkpoint_ts,
            recovery_base,
            "recovery complete"
        );
        Ok(Some(RecoverySummary {
            keystone_generation: keystone,
            checkpoint,
            committed_replayed,
            uncommitted,
            max_timestamp: scan.max_timestamp,
        }))
    }

    /// Newest generation containing a valid CP record.
    fn find_keystone(&self, generations: &[u64]) -> EngineResult<Option<u64>> {
        for &generation in generations.iter().rev() {
            let path = generation_path(&self.config.journal_path, generation);
            let bytes = std::fs::read(&path)?;
            if file_has_checkpoint(&bytes) {
                return Ok(Some(generation));
            }
        }
        Ok(None)
    }

    /// Reads the SR/DR/DT/TD records of one committed transaction by
    /// scanning forward from its TS record. The bracket may straddle a
    /// rollover, so the scan follows into subsequent files.
    fn read_transaction_ops(&self, start_address: u64, commit_ts: Timestamp) -> EngineResult<Vec<JournalRecord>> {
        let block_size = self.config.journal_block_size;
        let mut generation = start_address / block_size;
        let mut offset = (start_address - generation * block_size) as usize;
        let mut ops = Vec::new();
        loop {
            let path = generation_path(&self.config.journal_path, generation);
            if !path.exists() {
                break;
            }
            let bytes = std::fs::read(&path)?;
            while offset + RECORD_HEADER_SIZE <= bytes.len() {
                let Some(header) = RecordHeader::probe(&bytes[offset..]) else {
                    return Err(EngineError::CorruptJournal(format!(
                        "transaction committed at {commit_ts} has no TC record after {start_address}"
                    )));
                };
                let end = offset + header.length as usize;
                if end > bytes.len() {
                    break;
                }
                if header.timestamp == commit_ts {
                    let record = JournalRecord::decode(&header, &bytes[offset + RECORD_HEADER_SIZE..end])?;
                    match record {
                        JournalRecord::TransactionCommit => return Ok(ops),
                        JournalRecord::TransactionStart { .. } => {}
                        other => ops.push(other),
                    }
                }
                offset = end;
            }
            generation += 1;
            offset = 0;
        }
        Err(EngineError::CorruptJournal(format!(
            "transaction committed at {commit_ts} has no TC record after {start_address}"
        )))
    }

    /// Applies persisted checkpoint values from every directory tree to
    /// their accumulators.
    fn restore_accumulators(&self, checkpoint_ts: Timestamp) -> EngineResult<()> {
        for directory in self.registry.trees() {
            if directory.name() != DIRECTORY_TREE_NAME {
                continue;
            }
            for (key, value) in directory.entries() {
                let Some((tree_name, index)) = parse_accumulator_key(&key) else {
                    continue;
                };
                if value.len() != 9 {
                    warn!(tree = %tree_name, index, "malformed accumulator checkpoint value");
                    continue;
                }
                let acc_type = AccumulatorType::from_code(value[0])?;
                let saved = i64::from_be_bytes(value[1..9].try_into().expect("length checked"));
                let Some(tree) = self.registry.tree_by_name(directory.volume_handle(), &tree_name) else {
                    continue;
                };
                let acc = tree.accumulator(acc_type, index)?;
                acc.restore(saved, checkpoint_ts);
            }
        }
        Ok(())
    }
}

fn scan_journal_created_time(header: &Option<JournalRecord>) -> u64 {
    match header {
        Some(JournalRecord::JournalHeader { journal_created_time, .. }) => *journal_created_time,
        _ => 0,
    }
}

fn scan_base_address(header: &Option<JournalRecord>, checkpoint: &Option<CheckpointInfo>) -> u64 {
    if let Some(cp) = checkpoint {
        return cp.base_address;
    }
    match header {
        Some(JournalRecord::JournalHeader { base_address, .. }) => *base_address,
        _ => 0,
    }
}

fn file_has_checkpoint(bytes: &[u8]) -> bool {
    let mut offset = 0;
    while offset + RECORD_HEADER_SIZE <= bytes.len() {
        let Some(header) = RecordHeader::probe(&bytes[offset..]) else {
            return false;
        };
        let end = offset + header.length as usize;
        if end > bytes.len() {
            return false;
        }
        if header.record_type == RecordType::Checkpoint {
            return true;
        }
        offset = end;
    }
    false
}

/// Accumulated scan state across the keystone file and its successors.
struct Scan {
    block_size: u64,
    volume_handles: HashMap<u32, VolumeIdent>,
    tree_handles: HashMap<u32, TreeIdent>,
    page_entries: Vec<(PageKey, u64, Timestamp)>,
    keystone_transaction_map: Vec<(Timestamp, LiveTransaction)>,
    keystone_header: Option<JournalRecord>,
    last_checkpoint: Option<CheckpointInfo>,
    pending: HashMap<Timestamp, RecoveredTransaction>,
    completed: Vec<RecoveredTransaction>,
    max_timestamp: Timestamp,
}

impl Scan {
    fn new(block_size: u64) -> Self {
        Self {
            block_size,
            volume_handles: HashMap::new(),
            tree_handles: HashMap::new(),
            page_entries: Vec::new(),
            keystone_transaction_map: Vec::new(),
            keystone_header: None,
            last_checkpoint: None,
            pending: HashMap::new(),
            completed: Vec::new(),
            max_timestamp: 0,
        }
    }

    /// Scans one file. Returns false when the dirty tail ends recovery.
    fn scan_file(&mut self, generation: u64, bytes: &[u8], is_keystone: bool, is_last: bool) -> EngineResult<bool> {
        let mut offset = 0usize;
        loop {
            if offset + RECORD_HEADER_SIZE > bytes.len() {
                return Ok(!is_last || offset == bytes.len());
            }
            let Some(header) = RecordHeader::probe(&bytes[offset..]) else {
                // Dirty tail: an unclean shutdown left a partial record.
                if is_last {
                    info!(generation, offset, "journal scan stopped at dirty tail");
                }
                return Ok(!is_last);
            };
            let end = offset + header.length as usize;
            if end > bytes.len() {
                if is_last {
                    info!(generation, offset, "journal scan stopped at truncated record");
                }
                return Ok(!is_last);
            }
            let address = generation * self.block_size + offset as u64;
            let record = match JournalRecord::decode(&header, &bytes[offset + RECORD_HEADER_SIZE..end]) {
                Ok(record) => record,
                Err(err) => {
                    if is_last {
                        warn!(generation, offset, error = %err, "journal scan stopped at undecodable record");
                        return Ok(false);
                    }
                    return Err(err);
                }
            };
            if header.timestamp > self.max_timestamp {
                self.max_timestamp = header.timestamp;
            }
            match record {
                JournalRecord::JournalHeader { .. } => {
                    if is_keystone && offset == 0 {
                        self.keystone_header = Some(record);
                    }
                }
                JournalRecord::JournalEnd { .. } => return Ok(true),
                JournalRecord::IdentifyVolume { handle, volume_id, name } => {
                    self.volume_handles.insert(handle, VolumeIdent { id: volume_id, name });
                }
                JournalRecord::IdentifyTree {
                    handle,
                    volume_handle,
                    name,
                } => {
                    self.tree_handles.insert(handle, TreeIdent { volume_handle, name });
                }
                JournalRecord::PageImage {
                    volume_handle,
                    page_address,
                    ..
                } => {
                    self.page_entries.push((
                        PageKey {
                            volume_handle,
                            page_address,
                        },
                        address,
                        header.timestamp,
                    ));
                }
                JournalRecord::PageMap { entries } => {
                    if is_keystone {
                        for entry in entries {
                            if entry.timestamp > self.max_timestamp {
                                self.max_timestamp = entry.timestamp;
                            }
                            self.page_entries.push((
                                PageKey {
                                    volume_handle: entry.volume_handle,
                                    page_address: entry.page_address,
                                },
                                entry.journal_address,
                                entry.timestamp,
                            ));
                        }
                    }
                }
                JournalRecord::TransactionMap { entries } => {
                    if is_keystone {
                        for entry in entries {
                            if entry.commit_ts > self.max_timestamp {
                                self.max_timestamp = entry.commit_ts;
                            }
                            if entry.start_ts > self.max_timestamp {
                                self.max_timestamp = entry.start_ts;
                            }
                            self.keystone_transaction_map.push((
                                entry.start_ts,
                                LiveTransaction {
                                    commit_ts: entry.commit_ts,
                                    start_address: entry.start_address,
                                    committed: entry.committed,
                                },
                            ));
                        }
                    }
                }
                JournalRecord::TransactionStart { start_ts } => {
                    if start_ts > self.max_timestamp {
                        self.max_timestamp = start_ts;
                    }
                    self.pending.insert(
                        header.timestamp,
                        RecoveredTransaction {
                            start_ts,
                            commit_ts: header.timestamp,
                            start_address: address,
                            committed: false,
                            ops: Vec::new(),
                        },
                    );
                }
                JournalRecord::TransactionCommit => {
                    if let Some(mut txn) = self.pending.remove(&header.timestamp) {
                        txn.committed = true;
                        self.completed.push(txn);
                    }
                }
                JournalRecord::StoreRecord { .. }
                | JournalRecord::DeleteRange { .. }
                | JournalRecord::DeleteTree { .. }
                | JournalRecord::TransactionDelta { .. } => {
                    if let Some(txn) = self.pending.get_mut(&header.timestamp) {
                        txn.ops.push(record);
                    }
                }
                JournalRecord::Checkpoint {
                    system_time_millis,
                    base_address,
                } => {
                    self.last_checkpoint = Some(CheckpointInfo {
                        timestamp: header.timestamp,
                        system_time_millis,
                        base_address,
                    });
                }
            }
            offset = end;
        }
    }

    /// Builds the page map and the branch map. Every version chains into
    /// the page map; versions at or below the checkpoint that have newer
    /// successors are additionally preserved in the branch map for
    /// checkpoint-bounded reads.
    fn into_page_maps(&mut self, checkpoint_ts: Timestamp) -> (PageMap, PageMap) {
        let mut entries = std::mem::take(&mut self.page_entries);
        entries.sort_by_key(|(key, address, _)| (*key, *address));
        entries.dedup_by_key(|(key, address, _)| (*key, *address));
        let mut page_map = PageMap::new();
        let mut branch_map = PageMap::new();
        for (key, address, timestamp) in &entries {
            page_map.put(*key, *address, *timestamp);
        }
        for (key, address, timestamp) in &entries {
            if *timestamp <= checkpoint_ts && page_map.resolve(key) != Some(*address) {
                branch_map.put(*key, *address, *timestamp);
            }
        }
        (page_map, branch_map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::manager::TransactionUpdate;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> EngineConfig {
        EngineConfig {
            journal_path: dir.join("journal"),
            journal_block_size: 1 << 20,
            ..Default::default()
        }
    }

    fn fresh(config: &EngineConfig) -> (Arc<TimestampAllocator>, Arc<TransactionIndex>, Arc<JournalManager>, Arc<VolumeRegistry>) {
        let allocator = Arc::new(TimestampAllocator::new());
        let index = Arc::new(TransactionIndex::new(allocator.clone(), config));
        let journal = Arc::new(JournalManager::new(config));
        let registry = Arc::new(VolumeRegistry::new());
        (allocator, index, journal, registry)
    }

    #[test]
    fn test_fresh_directory_recovers_none() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let (allocator, index, journal, registry) = fresh(&config);
        let recovery = RecoveryManager::new(&config, &journal, &registry, &index, &allocator);
        assert!(recovery.recover().unwrap().is_none());
    }

    #[test]
    fn test_checkpoint_then_crash_recovery() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());

        // First life: a committed transaction, a journaled page, a
        // checkpoint, then an uncommitted page image before the "crash".
        {
            let (_allocator, _index, journal, _registry) = fresh(&config);
            let vh = journal.assign_volume_handle("data", 7).unwrap();
            let th = journal.assign_tree_handle(vh, "orders").unwrap();

            journal
                .write_transaction(
                    400,
                    401,
                    &[TransactionUpdate::Store {
                        tree_handle: th,
                        key: b"k1".to_vec(),
                        value: b"v1".to_vec(),
                    }],
                )
                .unwrap();
            journal.write_page(vh, 1, 401, &[0xAA; 64]).unwrap();
            journal.write_checkpoint(450, 123).unwrap();

            // Post-checkpoint work that never commits: a page image only.
            journal.write_page(vh, 2, 461, &[0xBB; 64]).unwrap();
            journal.flush().unwrap();
            // No clean close: this is the crash.
        }

        // Second life.
        let (allocator, index, journal, registry) = fresh(&config);
        let recovery = RecoveryManager::new(&config, &journal, &registry, &index, &allocator);
        let summary = recovery.recover().unwrap().unwrap();

        let cp = summary.checkpoint.unwrap();
        assert_eq!(cp.timestamp, 450);

        // Both page images are recoverable.
        let (ts, image) = journal.read_page_image(1, 1).unwrap().unwrap();
        assert_eq!(ts, 401);
        assert_eq!(image, vec![0xAA; 64]);
        let (ts, image) = journal.read_page_image(1, 2).unwrap().unwrap();
        assert_eq!(ts, 461);
        assert_eq!(image, vec![0xBB; 64]);

        // Pre-checkpoint version is visible; the orphan post-checkpoint
        // version is not.
        let reader = allocator.now() + 1;
        assert!(index.is_visible(401, reader).unwrap());
        assert!(!index.is_visible(461, reader).unwrap());
    }

    #[test]
    fn test_committed_tail_replayed_into_trees() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());

        {
            let (_allocator, _index, journal, _registry) = fresh(&config);
            let vh = journal.assign_volume_handle("data", 7).unwrap();
            let th = journal.assign_tree_handle(vh, "orders").unwrap();
            journal.write_checkpoint(100, 1).unwrap();
            journal
                .write_transaction(
                    200,
                    201,
                    &[
                        TransactionUpdate::Store {
                            tree_handle: th,
                            key: b"a".to_vec(),
                            value: b"1".to_vec(),
                        },
                        TransactionUpdate::Store {
                            tree_handle: th,
                            key: b"b".to_vec(),
                            value: b"2".to_vec(),
                        },
                    ],
                )
                .unwrap();
            journal
                .write_transaction(
                    210,
                    211,
                    &[TransactionUpdate::DeleteRange {
                        tree_handle: th,
                        key1: b"a".to_vec(),
                        key2: b"b".to_vec(),
                    }],
                )
                .unwrap();
            journal.flush().unwrap();
        }

        let (allocator, index, journal, registry) = fresh(&config);
        let recovery = RecoveryManager::new(&config, &journal, &registry, &index, &allocator);
        let summary = recovery.recover().unwrap().unwrap();
        assert_eq!(summary.committed_replayed, 2);
        assert!(summary.uncommitted.is_empty());

        let tree = registry.tree_by_name(1, "orders").unwrap();
        assert!(tree.get(b"a").is_none());
        assert_eq!(tree.get(b"b"), Some(b"2".to_vec()));

        // The clock resumes above everything in the journal.
        assert!(allocator.now() >= 211);
    }

    #[test]
    fn test_torn_commit_is_uncommitted() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());

        {
            let (_allocator, _index, journal, _registry) = fresh(&config);
            let vh = journal.assign_volume_handle("data", 7).unwrap();
            let th = journal.assign_tree_handle(vh, "orders").unwrap();
            journal.write_checkpoint(100, 1).unwrap();
            journal
                .write_transaction(
                    200,
                    201,
                    &[TransactionUpdate::Store {
                        tree_handle: th,
                        key: b"k".to_vec(),
                        value: b"v".to_vec(),
                    }],
                )
                .unwrap();
            journal.flush().unwrap();
        }

        // Chop the TC record off the end of the last file.
        let generations = journal_generations(&config.journal_path).unwrap();
        let path = generation_path(&config.journal_path, *generations.last().unwrap());
        let bytes = std::fs::read(&path).unwrap();
        let tc_len = JournalRecord::TransactionCommit.encode(0).unwrap().len();
        std::fs::write(&path, &bytes[..bytes.len() - tc_len]).unwrap();

        let (allocator, index, journal, registry) = fresh(&config);
        let recovery = RecoveryManager::new(&config, &journal, &registry, &index, &allocator);
        let summary = recovery.recover().unwrap().unwrap();
        assert_eq!(summary.committed_replayed, 0);
        assert_eq!(summary.uncommitted, vec![200]);

        // The torn store never reaches the tree.
        let tree = registry.tree_by_name(1, "orders").unwrap();
        assert!(tree.get(b"k").is_none());
    }

    #[test]
    fn test_transaction_map_seek_back_across_rollover() {
        let dir = tempdir().unwrap();
        let config = EngineConfig {
            journal_path: dir.path().join("journal"),
            journal_block_size: 4096,
            ..Default::default()
        };

        {
            let (_allocator, _index, journal, _registry) = fresh(&config);
            let vh = journal.assign_volume_handle("data", 7).unwrap();
            let th = journal.assign_tree_handle(vh, "orders").unwrap();
            journal.write_checkpoint(100, 1).unwrap();
            // Commits after the checkpoint, in generation 0.
            journal
                .write_transaction(
                    200,
                    201,
                    &[TransactionUpdate::Store {
                        tree_handle: th,
                        key: b"k".to_vec(),
                        value: b"v".to_vec(),
                    }],
                )
                .unwrap();
            // Page traffic forces rollovers; the new files carry a CP
            // copy and a TM snapshot listing the retained transaction.
            for page in 1..=20u64 {
                journal.write_page(vh, page, 300 + page as Timestamp, &[0u8; 512]).unwrap();
            }
            journal.flush().unwrap();
            assert!(journal_generations(&config.journal_path).unwrap().len() >= 2);
        }

        let (allocator, index, journal, registry) = fresh(&config);
        let recovery = RecoveryManager::new(&config, &journal, &registry, &index, &allocator);
        let summary = recovery.recover().unwrap().unwrap();
        // The keystone is a later file than the transaction's records.
        assert!(summary.keystone_generation >= 1);
        assert!(summary.committed_replayed >= 1);

        let tree = registry.tree_by_name(1, "orders").unwrap();
        assert_eq!(tree.get(b"k"), Some(b"v".to_vec()));
    }

    #[test]
    fn test_recovery_idempotence() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());

        {
            let (_allocator, _index, journal, _registry) = fresh(&config);
            let vh = journal.assign_volume_handle("data", 7).unwrap();
            let th = journal.assign_tree_handle(vh, "orders").unwrap();
            journal.write_page(vh, 1, 90, &[1u8; 32]).unwrap();
            journal.write_checkpoint(100, 1).unwrap();
            journal
                .write_transaction(
                    200,
                    201,
                    &[TransactionUpdate::Store {
                        tree_handle: th,
                        key: b"k".to_vec(),
                        value: b"v".to_vec(),
                    }],
                )
                .unwrap();
            journal.write_page(vh, 2, 202, &[2u8; 32]).unwrap();
            journal.flush().unwrap();
        }

        let run = || {
            let (allocator, index, journal, registry) = fresh(&config);
            let recovery = RecoveryManager::new(&config, &journal, &registry, &index, &allocator);
            let summary = recovery.recover().unwrap().unwrap();
            let tree = registry.tree_by_name(1, "orders").unwrap();
            (
                summary.checkpoint,
                summary.committed_replayed,
                summary.max_timestamp,
                journal.page_map_len(),
                journal.base_address(),
                tree.get(b"k"),
            )
        };
        assert_eq!(run(), run());
    }
}
