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

// Journal manager
// Owns the append point of the journal: a staging write buffer, the
// current block file, the handle maps, the page map and the live
// transaction map. Appends, rollovers and checkpoint emission are all
// serialised on one mutex (the "journal mutex"); readers of the maps take
// the same mutex.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::journal::page_map::{CopyCandidate, PageKey, PageMap};
use crate::journal::record::{
    JE_OVERHEAD, JOURNAL_VERSION, JournalRecord, PageMapEntry, RECORD_HEADER_SIZE, RecordHeader, RecordType,
    TransactionMapEntry, reassemble_page,
};
use crate::tx::timestamp::Timestamp;

/// Width of the generation suffix in journal file names.
const GENERATION_DIGITS: usize = 16;

/// Identity of a volume as the journal knows it.
#[derive(Debug, Clone)]
pub struct VolumeIdent {
    pub id: u64,
    pub name: String,
}

/// Identity of a tree as the journal knows it.
#[derive(Debug, Clone)]
pub struct TreeIdent {
    pub volume_handle: u32,
    pub name: String,
}

/// A transaction present in the journal.
#[derive(Debug, Clone, Copy)]
pub struct LiveTransaction {
    pub commit_ts: Timestamp,
    pub start_address: u64,
    pub committed: bool,
}

/// The last durably written checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointInfo {
    pub timestamp: Timestamp,
    pub system_time_millis: u64,
    pub base_address: u64,
}

/// One buffered update of a committing transaction.
#[derive(Debug, Clone)]
pub enum TransactionUpdate {
    Store { tree_handle: u32, key: Vec<u8>, value: Vec<u8> },
    DeleteRange { tree_handle: u32, key1: Vec<u8>, key2: Vec<u8> },
    DeleteTree { tree_handle: u32 },
    Delta { tree_handle: u32, index: u8, acc_type: u8, value: i64 },
}

impl TransactionUpdate {
    fn tree_handle(&self) -> u32 {
        match self {
            TransactionUpdate::Store { tree_handle, .. }
            | TransactionUpdate::DeleteRange { tree_handle, .. }
            | TransactionUpdate::DeleteTree { tree_handle }
            | TransactionUpdate::Delta { tree_handle, .. } => *tree_handle,
        }
    }
}

/// Journal file path for a generation: `<path>.<16-digit generation>`.
pub fn generation_path(base: &Path, generation: u64) -> PathBuf {
    let mut name = base.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    name.push('.');
    name.push_str(&format!("{generation:016}"));
    base.with_file_name(name)
}

/// Generations present in the journal directory, sorted ascending. Only
/// file names matching `<base>.<16 decimal digits>` participate.
pub fn journal_generations(base: &Path) -> EngineResult<Vec<u64>> {
    let dir = base.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    let stem = base
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| EngineError::InvariantViolation("journal path has no file name".to_string()))?;
    let mut generations = Vec::new();
    if !dir.exists() {
        return Ok(generations);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(suffix) = name.strip_prefix(&stem).and_then(|rest| rest.strip_prefix('.')) else {
            continue;
        };
        if suffix.len() == GENERATION_DIGITS && suffix.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(generation) = suffix.parse::<u64>() {
                generations.push(generation);
            }
        }
    }
    generations.sort_unstable();
    Ok(generations)
}

fn system_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

pub(crate) struct JournalState {
    /// Millisecond wall clock of journal creation, carried through JH/JE.
    pub journal_created_time: u64,
    /// Journal address below which no record is needed any more.
    pub base_address: u64,
    /// Journal address of the next byte to be appended.
    pub current_address: u64,
    /// Staged bytes `[write_buffer_address, current_address)`.
    pub write_buffer: Vec<u8>,
    pub write_buffer_address: u64,
    pub current_file: Option<File>,
    pub current_generation: u64,
    /// Handles already announced with IV/IT in the current file.
    announced_volumes: HashSet<u32>,
    announced_trees: HashSet<u32>,
    pub volume_handles: HashMap<u32, VolumeIdent>,
    pub tree_handles: HashMap<u32, TreeIdent>,
    pub handle_counter: u32,
    pub page_map: PageMap,
    /// Pre-checkpoint page versions preserved by recovery.
    pub branch_map: PageMap,
    pub live_transactions: BTreeMap<Timestamp, LiveTransaction>,
    pub last_valid_checkpoint: Option<CheckpointInfo>,
    pub last_valid_checkpoint_base_address: u64,
    /// Set after a failed journal write; all further mutations fail.
    io_failed: bool,
}

impl JournalState {
    fn new() -> Self {
        Self {
            journal_created_time: system_millis(),
            base_address: 0,
            current_address: 0,
            write_buffer: Vec::new(),
            write_buffer_address: 0,
            current_file: None,
            current_generation: 0,
            announced_volumes: HashSet::new(),
            announced_trees: HashSet::new(),
            volume_handles: HashMap::new(),
            tree_handles: HashMap::new(),
            handle_counter: 0,
            page_map: PageMap::new(),
            branch_map: PageMap::new(),
            live_transactions: BTreeMap::new(),
            last_valid_checkpoint: None,
            last_valid_checkpoint_base_address: 0,
            io_failed: false,
        }
    }
}

/// The serialised journal writer and its recovery-driven maps.
pub struct JournalManager {
    path: PathBuf,
    block_size: u64,
    write_buffer_size: usize,
    append_only: bool,
    state: Mutex<JournalState>,
    closed: AtomicBool,
}

impl JournalManager {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            path: config.journal_path.clone(),
            block_size: config.journal_block_size,
            write_buffer_size: config.write_buffer_size,
            append_only: config.append_only,
            state: Mutex::new(JournalState::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    fn guard(&self) -> EngineResult<parking_lot::MutexGuard<'_, JournalState>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Closed);
        }
        let state = self.state.lock();
        if state.io_failed {
            return Err(EngineError::Io(io::Error::other("journal is in a write-error state")));
        }
        Ok(state)
    }

    // ----- handle assignment ------------------------------------------------

    /// Registers a volume with the journal, returning its handle.
    pub fn assign_volume_handle(&self, name: &str, id: u64) -> EngineResult<u32> {
        let mut state = self.guard()?;
        if let Some((handle, _)) = state.volume_handles.iter().find(|(_, v)| v.name == name) {
            return Ok(*handle);
        }
        state.handle_counter += 1;
        let handle = state.handle_counter;
        state.volume_handles.insert(handle, VolumeIdent { id, name: name.to_string() });
        Ok(handle)
    }

    /// Registers a tree with the journal, returning its handle.
    pub fn assign_tree_handle(&self, volume_handle: u32, name: &str) -> EngineResult<u32> {
        let mut state = self.guard()?;
        if !state.volume_handles.contains_key(&volume_handle) {
            return Err(EngineError::InvariantViolation(format!("unknown volume handle {volume_handle}")));
        }
        if let Some((handle, _)) = state
            .tree_handles
            .iter()
            .find(|(_, t)| t.volume_handle == volume_handle && t.name == name)
        {
            return Ok(*handle);
        }
        state.handle_counter += 1;
        let handle = state.handle_counter;
        state.tree_handles.insert(
            handle,
            TreeIdent {
                volume_handle,
                name: name.to_string(),
            },
        );
        Ok(handle)
    }

    pub fn volume_ident(&self, handle: u32) -> Option<VolumeIdent> {
        self.state.lock().volume_handles.get(&handle).cloned()
    }

    pub fn tree_ident(&self, handle: u32) -> Option<TreeIdent> {
        self.state.lock().tree_handles.get(&handle).cloned()
    }

    // ----- low-level append path -------------------------------------------

    fn file_offset(&self, state: &JournalState, address: u64) -> u64 {
        address - state.current_generation * self.block_size
    }

    /// Opens the next block file and writes its preamble: JH, the IV/IT
    /// map, PM and TM snapshots, and a copy of the last valid CP.
    fn start_new_file_locked(&self, state: &mut JournalState) -> EngineResult<()> {
        let generation = state.current_address / self.block_size;
        let path = generation_path(&self.path, generation);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&path)?;
        debug!(generation, path = %path.display(), "starting journal file");
        state.current_generation = generation;
        state.current_file = Some(file);
        state.write_buffer.clear();
        state.write_buffer_address = state.current_address;
        state.announced_volumes.clear();
        state.announced_trees.clear();

        let header = JournalRecord::JournalHeader {
            version: JOURNAL_VERSION,
            block_size: self.block_size,
            base_address: state.base_address,
            current_address: state.current_address,
            journal_created_time: state.journal_created_time,
            file_created_time: system_millis(),
            path: self.path.to_string_lossy().into_owned(),
        };
        self.append_locked(state, &header, 0)?;

        let volumes: Vec<(u32, VolumeIdent)> = state.volume_handles.iter().map(|(h, v)| (*h, v.clone())).collect();
        for (handle, ident) in volumes {
            self.announce_volume_locked(state, handle, &ident)?;
        }
        let trees: Vec<(u32, TreeIdent)> = state.tree_handles.iter().map(|(h, t)| (*h, t.clone())).collect();
        for (handle, ident) in trees {
            self.announce_tree_locked(state, handle, &ident)?;
        }

        let mut entries: Vec<PageMapEntry> = Vec::new();
        for (key, address, timestamp) in state.page_map.all_entries().into_iter().chain(state.branch_map.all_entries()) {
            entries.push(PageMapEntry {
                timestamp,
                journal_address: address,
                volume_handle: key.volume_handle,
                page_address: key.page_address,
            });
        }
        self.append_locked(state, &JournalRecord::PageMap { entries }, 0)?;

        let entries: Vec<TransactionMapEntry> = state
            .live_transactions
            .iter()
            .map(|(start_ts, live)| TransactionMapEntry {
                start_ts: *start_ts,
                commit_ts: live.commit_ts,
                start_address: live.start_address,
                committed: live.committed,
            })
            .collect();
        self.append_locked(state, &JournalRecord::TransactionMap { entries }, 0)?;

        if let Some(cp) = state.last_valid_checkpoint {
            let record = JournalRecord::Checkpoint {
                system_time_millis: cp.system_time_millis,
                base_address: cp.base_address,
            };
            self.append_locked(state, &record, cp.timestamp)?;
        }
        Ok(())
    }

    /// Guarantees `size + JE_OVERHEAD` bytes fit before the next block
    /// boundary, rolling the file over if they do not, and drains the
    /// staging buffer when it is full.
    fn prepare_write_buffer_locked(&self, state: &mut JournalState, size: usize) -> EngineResult<()> {
        if state.current_file.is_none() {
            self.start_new_file_locked(state)?;
        }
        let boundary = (state.current_generation + 1) * self.block_size;
        if state.current_address + (size + JE_OVERHEAD) as u64 > boundary {
            self.rollover_locked(state)?;
        }
        if state.write_buffer.len() + size > self.write_buffer_size {
            self.flush_locked(state)?;
        }
        Ok(())
    }

    /// Closes the current file with a JE record and opens the next one.
    fn rollover_locked(&self, state: &mut JournalState) -> EngineResult<()> {
        self.append_journal_end_locked(state)?;
        self.flush_locked(state)?;
        let length = self.file_offset(state, state.current_address);
        if let Some(file) = &state.current_file {
            file.set_len(length)?;
            file.sync_all()?;
        }
        info!(
            generation = state.current_generation,
            length, "journal file rolled over"
        );
        state.current_file = None;
        state.current_address = (state.current_generation + 1) * self.block_size;
        self.start_new_file_locked(state)
    }

    /// Appends a JE record directly, bypassing `prepare_write_buffer`;
    /// every prior append reserved room for it.
    fn append_journal_end_locked(&self, state: &mut JournalState) -> EngineResult<u64> {
        let record = JournalRecord::JournalEnd {
            current_address: state.current_address + JE_OVERHEAD as u64,
            base_address: state.base_address,
            journal_created_time: state.journal_created_time,
        };
        let bytes = record.encode(0)?;
        let address = state.current_address;
        state.write_buffer.extend_from_slice(&bytes);
        state.current_address += bytes.len() as u64;
        Ok(address)
    }

    /// Appends an encoded record, returning its journal address.
    fn append_locked(&self, state: &mut JournalState, record: &JournalRecord, timestamp: Timestamp) -> EngineResult<u64> {
        let bytes = record.encode(timestamp)?;
        if (bytes.len() + JE_OVERHEAD) as u64 > self.block_size {
            return Err(EngineError::InvariantViolation(format!(
                "record of {} bytes cannot fit a {}-byte journal block",
                bytes.len(),
                self.block_size
            )));
        }
        self.prepare_write_buffer_locked(state, bytes.len())?;
        let address = state.current_address;
        state.write_buffer.extend_from_slice(&bytes);
        state.current_address += bytes.len() as u64;
        Ok(address)
    }

    fn announce_volume_locked(&self, state: &mut JournalState, handle: u32, ident: &VolumeIdent) -> EngineResult<()> {
        if state.announced_volumes.contains(&handle) {
            return Ok(());
        }
        let record = JournalRecord::IdentifyVolume {
            handle,
            volume_id: ident.id,
            name: ident.name.clone(),
        };
        self.append_locked(state, &record, 0)?;
        state.announced_volumes.insert(handle);
        Ok(())
    }

    fn announce_tree_locked(&self, state: &mut JournalState, handle: u32, ident: &TreeIdent) -> EngineResult<()> {
        if state.announced_trees.contains(&handle) {
            return Ok(());
        }
        if let Some(volume) = state.volume_handles.get(&ident.volume_handle).cloned() {
            self.announce_volume_locked(state, ident.volume_handle, &volume)?;
        }
        let record = JournalRecord::IdentifyTree {
            handle,
            volume_handle: ident.volume_handle,
            name: ident.name.clone(),
        };
        self.append_locked(state, &record, 0)?;
        state.announced_trees.insert(handle);
        Ok(())
    }

    fn ensure_volume_announced(&self, state: &mut JournalState, handle: u32) -> EngineResult<()> {
        let ident = state
            .volume_handles
            .get(&handle)
            .cloned()
            .ok_or_else(|| EngineError::InvariantViolation(format!("unknown volume handle {handle}")))?;
        self.announce_volume_locked(state, handle, &ident)
    }

    fn ensure_tree_announced(&self, state: &mut JournalState, handle: u32) -> EngineResult<()> {
        let ident = state
            .tree_handles
            .get(&handle)
            .cloned()
            .ok_or_else(|| EngineError::InvariantViolation(format!("unknown tree handle {handle}")))?;
        self.announce_tree_locked(state, handle, &ident)
    }

    /// Copies the staging buffer to the current file.
    fn flush_locked(&self, state: &mut JournalState) -> EngineResult<()> {
        if state.write_buffer.is_empty() {
            return Ok(());
        }
        let offset = self.file_offset(state, state.write_buffer_address);
        let result = (|| -> io::Result<()> {
            let file = state
                .current_file
                .as_mut()
                .ok_or_else(|| io::Error::other("no current journal file"))?;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&state.write_buffer)?;
            Ok(())
        })();
        if let Err(err) = result {
            state.io_failed = true;
            warn!(error = %err, "journal write failed; mutations halted");
            return Err(err.into());
        }
        state.write_buffer_address = state.current_address;
        state.write_buffer.clear();
        Ok(())
    }

    fn force_locked(&self, state: &mut JournalState) -> EngineResult<()> {
        self.flush_locked(state)?;
        if let Some(file) = &state.current_file {
            if let Err(err) = file.sync_all() {
                state.io_failed = true;
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Copies staged bytes to the file channel.
    pub fn flush(&self) -> EngineResult<()> {
        let mut state = self.guard()?;
        self.flush_locked(&mut state)
    }

    /// Flushes and then fsyncs the current file.
    pub fn force(&self) -> EngineResult<()> {
        let mut state = self.guard()?;
        self.force_locked(&mut state)
    }

    // ----- record writers ---------------------------------------------------

    /// Journals a page image and publishes it as the new chain head.
    /// Returns the record's journal address.
    pub fn write_page(&self, volume_handle: u32, page_address: u64, timestamp: Timestamp, image: &[u8]) -> EngineResult<u64> {
        let mut state = self.guard()?;
        self.ensure_volume_announced(&mut state, volume_handle)?;
        let record = JournalRecord::PageImage {
            volume_handle,
            left_size: image.len() as u32,
            buffer_size: image.len() as u32,
            page_address,
            bytes: image.to_vec(),
        };
        let address = self.append_locked(&mut state, &record, timestamp)?;
        state.page_map.put(
            PageKey {
                volume_handle,
                page_address,
            },
            address,
            timestamp,
        );
        Ok(address)
    }

    /// Journals a committing transaction: TS, its updates, then TC, all
    /// stamped with the commit timestamp. Returns the TS address.
    pub fn write_transaction(
        &self,
        start_ts: Timestamp,
        commit_ts: Timestamp,
        updates: &[TransactionUpdate],
    ) -> EngineResult<u64> {
        let mut state = self.guard()?;
        for update in updates {
            self.ensure_tree_announced(&mut state, update.tree_handle())?;
        }
        let start_address = self.append_locked(&mut state, &JournalRecord::TransactionStart { start_ts }, commit_ts)?;
        for update in updates {
            let record = match update {
                TransactionUpdate::Store { tree_handle, key, value } => JournalRecord::StoreRecord {
                    tree_handle: *tree_handle,
                    key: key.clone(),
                    value: value.clone(),
                },
                TransactionUpdate::DeleteRange { tree_handle, key1, key2 } => JournalRecord::DeleteRange {
                    tree_handle: *tree_handle,
                    key1: key1.clone(),
                    key2: key2.clone(),
                },
                TransactionUpdate::DeleteTree { tree_handle } => JournalRecord::DeleteTree { tree_handle: *tree_handle },
                TransactionUpdate::Delta {
                    tree_handle,
                    index,
                    acc_type,
                    value,
                } => JournalRecord::TransactionDelta {
                    tree_handle: *tree_handle,
                    index: *index,
                    acc_type: *acc_type,
                    value: *value,
                },
            };
            self.append_locked(&mut state, &record, commit_ts)?;
        }
        self.append_locked(&mut state, &JournalRecord::TransactionCommit, commit_ts)?;
        state.live_transactions.insert(
            start_ts,
            LiveTransaction {
                commit_ts,
                start_address,
                committed: true,
            },
        );
        Ok(start_address)
    }

    /// Durably writes a checkpoint record. Everything with a timestamp at
    /// or below the checkpoint's is forced to disk first, then the CP
    /// record itself is forced.
    pub fn write_checkpoint(&self, timestamp: Timestamp, system_time_millis: u64) -> EngineResult<()> {
        let mut state = self.guard()?;
        if state.current_file.is_none() {
            self.start_new_file_locked(&mut state)?;
        }
        self.force_locked(&mut state)?;
        let base_address = state.base_address;
        let record = JournalRecord::Checkpoint {
            system_time_millis,
            base_address,
        };
        self.append_locked(&mut state, &record, timestamp)?;
        self.force_locked(&mut state)?;
        state.last_valid_checkpoint = Some(CheckpointInfo {
            timestamp,
            system_time_millis,
            base_address,
        });
        state.last_valid_checkpoint_base_address = base_address;
        // Committed transactions at or below the checkpoint are folded
        // into checkpointed state and need no replay. Branch-map versions
        // were kept for replay from the previous checkpoint and are now
        // unreachable.
        state.live_transactions.retain(|_, live| !(live.committed && live.commit_ts <= timestamp));
        state.branch_map.clear();
        info!(timestamp, base_address, "checkpoint written");
        Ok(())
    }

    pub fn last_valid_checkpoint(&self) -> Option<CheckpointInfo> {
        self.state.lock().last_valid_checkpoint
    }

    // ----- record readers ---------------------------------------------------

    fn read_record_at_locked(&self, state: &mut JournalState, address: u64) -> EngineResult<(RecordHeader, Vec<u8>)> {
        if address >= state.write_buffer_address && !state.write_buffer.is_empty() {
            let offset = (address - state.write_buffer_address) as usize;
            if offset >= state.write_buffer.len() {
                return Err(EngineError::CorruptJournal(format!("journal address {address} beyond append point")));
            }
            let header = RecordHeader::read(&state.write_buffer[offset..])?;
            let end = offset + header.length as usize;
            if end > state.write_buffer.len() {
                return Err(EngineError::CorruptJournal(format!("record at {address} exceeds staged bytes")));
            }
            return Ok((header, state.write_buffer[offset + RECORD_HEADER_SIZE..end].to_vec()));
        }

        let generation = address / self.block_size;
        let path = generation_path(&self.path, generation);
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(address - generation * self.block_size))?;
        let mut header_bytes = [0u8; RECORD_HEADER_SIZE];
        file.read_exact(&mut header_bytes)?;
        let header = RecordHeader::read(&header_bytes)?;
        let mut payload = vec![0u8; header.payload_len()];
        file.read_exact(&mut payload)?;
        Ok((header, payload))
    }

    /// Reads the page image stored at `journal_address`.
    pub fn read_page_at(&self, journal_address: u64) -> EngineResult<(PageKey, Timestamp, Vec<u8>)> {
        let mut state = self.state.lock();
        let (header, payload) = self.read_record_at_locked(&mut state, journal_address)?;
        if header.record_type != RecordType::PageImage {
            return Err(EngineError::CorruptJournal(format!(
                "expected page image at {journal_address}, found {:?}",
                header.record_type
            )));
        }
        match JournalRecord::decode(&header, &payload)? {
            JournalRecord::PageImage {
                volume_handle,
                left_size,
                buffer_size,
                page_address,
                bytes,
            } => Ok((
                PageKey {
                    volume_handle,
                    page_address,
                },
                header.timestamp,
                reassemble_page(left_size, buffer_size, &bytes)?,
            )),
            _ => unreachable!("record type checked above"),
        }
    }

    /// Resolves and reads the newest journaled image of a page, if any.
    pub fn read_page_image(&self, volume_handle: u32, page_address: u64) -> EngineResult<Option<(Timestamp, Vec<u8>)>> {
        let address = {
            let state = self.state.lock();
            let key = PageKey {
                volume_handle,
                page_address,
            };
            state.page_map.resolve(&key).or_else(|| state.branch_map.resolve(&key))
        };
        match address {
            Some(address) => {
                let (_, timestamp, image) = self.read_page_at(address)?;
                Ok(Some((timestamp, image)))
            }
            None => Ok(None),
        }
    }

    // ----- copier support ---------------------------------------------------

    /// Pages currently eligible for migration to their home volumes.
    pub fn copy_candidates(&self, timestamp_cap: Timestamp, max: usize, copy_fast: bool) -> Vec<CopyCandidate> {
        let state = self.state.lock();
        let Some(cp) = state.last_valid_checkpoint else {
            return Vec::new();
        };
        let ts_limit = cp.timestamp.min(timestamp_cap);
        let address_limit = if copy_fast {
            u64::MAX
        } else {
            state.current_generation * self.block_size
        };
        state.page_map.copy_candidates(ts_limit, address_limit, max)
    }

    /// Marks candidates as copied, pruning their chains and advancing the
    /// base address. Returns the new base address.
    pub fn note_copied(&self, copied: &[CopyCandidate]) -> u64 {
        let mut state = self.state.lock();
        for candidate in copied {
            state.page_map.note_copied(&candidate.key, candidate.journal_address);
            state.branch_map.remove(&candidate.key);
        }
        let mut base = state.current_address;
        for pin in [state.page_map.min_journal_address(), state.branch_map.min_journal_address()] {
            if let Some(address) = pin {
                base = base.min(address);
            }
        }
        if let Some(address) = state.live_transactions.values().map(|t| t.start_address).min() {
            base = base.min(address);
        }
        if base > state.base_address {
            state.base_address = base;
        }
        state.base_address
    }

    /// Deletes journal files whose entire content lies below both the
    /// base address and the last valid checkpoint's base address.
    pub fn delete_obsolete_files(&self) -> EngineResult<usize> {
        if self.append_only {
            return Ok(0);
        }
        let (limit, current_generation) = {
            let state = self.state.lock();
            (
                state.base_address.min(state.last_valid_checkpoint_base_address),
                state.current_generation,
            )
        };
        let mut deleted = 0;
        for generation in journal_generations(&self.path)? {
            if generation >= current_generation {
                continue;
            }
            if (generation + 1) * self.block_size <= limit {
                let path = generation_path(&self.path, generation);
                std::fs::remove_file(&path)?;
                info!(path = %path.display(), "deleted obsolete journal file");
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    // ----- introspection ----------------------------------------------------

    pub fn page_map_len(&self) -> usize {
        self.state.lock().page_map.len()
    }

    pub fn base_address(&self) -> u64 {
        self.state.lock().base_address
    }

    pub fn current_address(&self) -> u64 {
        self.state.lock().current_address
    }

    pub fn file_count(&self) -> EngineResult<usize> {
        Ok(journal_generations(&self.path)?.len())
    }

    pub fn live_transaction_count(&self) -> usize {
        self.state.lock().live_transactions.len()
    }

    // ----- recovery and shutdown -------------------------------------------

    /// Installs state rebuilt by recovery. Appending resumes in a fresh
    /// block file, leaving the torn tail untouched on disk.
    pub(crate) fn install_recovered_state(
        &self,
        journal_created_time: u64,
        base_address: u64,
        next_generation: u64,
        volume_handles: HashMap<u32, VolumeIdent>,
        tree_handles: HashMap<u32, TreeIdent>,
        page_map: PageMap,
        branch_map: PageMap,
        live_transactions: BTreeMap<Timestamp, LiveTransaction>,
        last_valid_checkpoint: Option<CheckpointInfo>,
    ) {
        let mut state = self.state.lock();
        state.journal_created_time = journal_created_time;
        state.base_address = base_address;
        state.current_address = next_generation * self.block_size;
        state.current_file = None;
        state.current_generation = next_generation;
        state.write_buffer.clear();
        state.write_buffer_address = state.current_address;
        state.handle_counter = volume_handles.keys().chain(tree_handles.keys()).copied().max().unwrap_or(0);
        state.volume_handles = volume_handles;
        state.tree_handles = tree_handles;
        state.page_map = page_map;
        state.branch_map = branch_map;
        state.live_transactions = live_transactions;
        state.last_valid_checkpoint_base_address = last_valid_checkpoint.map(|cp| cp.base_address).unwrap_or(base_address);
        state.last_valid_checkpoint = last_valid_checkpoint;
    }

    /// Closes the journal. A clean close ends the current file with a JE
    /// record and truncates it to its exact length.
    pub fn close(&self, clean: bool) -> EngineResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut state = self.state.lock();
        if state.io_failed {
            return Ok(());
        }
        if clean && state.current_file.is_some() {
            self.append_journal_end_locked(&mut state)?;
            self.flush_locked(&mut state)?;
            let length = self.file_offset(&state, state.current_address);
            if let Some(file) = &state.current_file {
                file.set_len(length)?;
                file.sync_all()?;
            }
        }
        state.current_file = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(dir: &Path, block_size: u64) -> EngineConfig {
        EngineConfig {
            journal_path: dir.join("journal"),
            journal_block_size: block_size,
            write_buffer_size: 64 * 1024,
            ..Default::default()
        }
    }

    #[test]
    fn test_generation_path_format() {
        let path = generation_path(Path::new("/var/db/myjournal"), 7);
        assert_eq!(path, PathBuf::from("/var/db/myjournal.0000000000000007"));
    }

    #[test]
    fn test_page_write_and_read_back() {
        let dir = tempdir().unwrap();
        let manager = JournalManager::new(&config(dir.path(), 1 << 20));
        let vh = manager.assign_volume_handle("data", 99).unwrap();

        let image = vec![7u8; 256];
        let address = manager.write_page(vh, 12, 401, &image).unwrap();

        // Served from the staging buffer before any flush.
        let (key, ts, read) = manager.read_page_at(address).unwrap();
        assert_eq!(key, PageKey { volume_handle: vh, page_address: 12 });
        assert_eq!(ts, 401);
        assert_eq!(read, image);

        // And from the file after a flush.
        manager.flush().unwrap();
        let (_, _, read) = manager.read_page_at(address).unwrap();
        assert_eq!(read, image);

        let (ts, read) = manager.read_page_image(vh, 12).unwrap().unwrap();
        assert_eq!(ts, 401);
        assert_eq!(read, image);
        assert_eq!(manager.page_map_len(), 1);
    }

    #[test]
    fn test_rollover_crosses_files() {
        let dir = tempdir().unwrap();
        let manager = JournalManager::new(&config(dir.path(), 4096));
        let vh = manager.assign_volume_handle("data", 1).unwrap();

        let image = vec![1u8; 512];
        for page in 0..32u64 {
            manager.write_page(vh, page, 100 + page as Timestamp, &image).unwrap();
        }
        manager.flush().unwrap();

        let generations = journal_generations(manager.path()).unwrap();
        assert!(generations.len() >= 4, "expected several files, got {generations:?}");
        // Contiguous generations from zero.
        assert_eq!(generations[0], 0);
        for window in generations.windows(2) {
            assert_eq!(window[1], window[0] + 1);
        }

        // Rolled files end with a JE record; files begin with JH.
        let first = std::fs::read(generation_path(manager.path(), 0)).unwrap();
        let header = RecordHeader::probe(&first).unwrap();
        assert_eq!(header.record_type, RecordType::JournalHeader);
        let je_at = first.len() - JE_OVERHEAD;
        let je = RecordHeader::probe(&first[je_at..]).unwrap();
        assert_eq!(je.record_type, RecordType::JournalEnd);

        // Every page is still readable across files.
        for page in 0..32u64 {
            let (_, image_read) = manager.read_page_image(vh, page).unwrap().unwrap();
            assert_eq!(image_read, image);
        }
    }

    #[test]
    fn test_transaction_record_stream() {
        let dir = tempdir().unwrap();
        let manager = JournalManager::new(&config(dir.path(), 1 << 20));
        let vh = manager.assign_volume_handle("data", 1).unwrap();
        let th = manager.assign_tree_handle(vh, "orders").unwrap();

        let updates = vec![
            TransactionUpdate::Store {
                tree_handle: th,
                key: b"k".to_vec(),
                value: b"v".to_vec(),
            },
            TransactionUpdate::Delta {
                tree_handle: th,
                index: 0,
                acc_type: 0,
                value: 5,
            },
        ];
        let start_address = manager.write_transaction(100, 101, &updates).unwrap();
        manager.flush().unwrap();

        assert_eq!(manager.live_transaction_count(), 1);

        // The TS record carries the start ts as payload and the commit ts
        // in its header.
        let mut state = manager.state.lock();
        let (header, payload) = manager.read_record_at_locked(&mut state, start_address).unwrap();
        assert_eq!(header.record_type, RecordType::TransactionStart);
        assert_eq!(header.timestamp, 101);
        match JournalRecord::decode(&header, &payload).unwrap() {
            JournalRecord::TransactionStart { start_ts } => assert_eq!(start_ts, 100),
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn test_checkpoint_prunes_live_map() {
        let dir = tempdir().unwrap();
        let manager = JournalManager::new(&config(dir.path(), 1 << 20));
        let vh = manager.assign_volume_handle("data", 1).unwrap();
        let th = manager.assign_tree_handle(vh, "t").unwrap();
        let update = vec![TransactionUpdate::DeleteTree { tree_handle: th }];

        manager.write_transaction(100, 101, &update).unwrap();
        manager.write_transaction(200, 201, &update).unwrap();
        assert_eq!(manager.live_transaction_count(), 2);

        manager.write_checkpoint(150, 1234).unwrap();
        // The transaction committed below the checkpoint is pruned; the
        // later one is retained for replay.
        assert_eq!(manager.live_transaction_count(), 1);
        let cp = manager.last_valid_checkpoint().unwrap();
        assert_eq!(cp.timestamp, 150);
    }

    #[test]
    fn test_copier_flow_drains_page_map() {
        let dir = tempdir().unwrap();
        let manager = JournalManager::new(&config(dir.path(), 1 << 20));
        let vh = manager.assign_volume_handle("data", 1).unwrap();

        let image = vec![9u8; 128];
        manager.write_page(vh, 1, 10, &image).unwrap();
        manager.write_page(vh, 2, 20, &image).unwrap();

        // No checkpoint yet: nothing is eligible.
        assert!(manager.copy_candidates(Timestamp::MAX, 100, true).is_empty());

        manager.write_checkpoint(100, 1).unwrap();
        let candidates = manager.copy_candidates(Timestamp::MAX, 100, true);
        assert_eq!(candidates.len(), 2);

        let base = manager.note_copied(&candidates);
        assert_eq!(manager.page_map_len(), 0);
        assert_eq!(base, manager.current_address());
    }

    #[test]
    fn test_clean_close_ends_with_je() {
        let dir = tempdir().unwrap();
        let manager = JournalManager::new(&config(dir.path(), 1 << 20));
        let vh = manager.assign_volume_handle("data", 1).unwrap();
        manager.write_page(vh, 1, 10, &[1u8; 64]).unwrap();
        manager.close(true).unwrap();

        let bytes = std::fs::read(generation_path(manager.path(), 0)).unwrap();
        let je = RecordHeader::probe(&bytes[bytes.len() - JE_OVERHEAD..]).unwrap();
        assert_eq!(je.record_type, RecordType::JournalEnd);

        // Everything fails after close.
        assert!(matches!(manager.flush(), Err(EngineError::Closed)));
    }
}
