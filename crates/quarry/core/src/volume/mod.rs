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

// Volumes and trees
// A volume is a page-addressed file holding named trees. The core keeps
// trees thin: a handle, the 64 accumulator slots, and the journal-replayed
// ordered map backing the volume's directory tree. Page-structured user
// data belongs to the B-tree layer above.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ByteOrder};
use parking_lot::{Mutex, RwLock};

use crate::error::{EngineError, EngineResult};
use crate::tx::accumulator::{Accumulator, AccumulatorType};
use crate::tx::index::BUCKET_COUNT;

/// Magic number identifying a volume file (QRYV).
const VOLUME_MAGIC: [u8; 4] = [0x51, 0x52, 0x59, 0x56];
/// Current volume format version.
const VOLUME_VERSION: u32 = 1;
/// Fixed part of the header: magic, version, page size, id, created time,
/// checksum, name length.
const VOLUME_HEADER_FIXED: usize = 34;

/// Directory-tree key prefix segments.
const DIRECTORY_PREFIX: &[u8] = b"_dir";
const ACCUMULATOR_PREFIX: &[u8] = b"_acc";

/// Accumulator slots per tree.
pub const ACCUMULATORS_PER_TREE: usize = 64;

/// Name of the per-volume directory tree holding engine metadata such as
/// accumulator checkpoint values.
pub const DIRECTORY_TREE_NAME: &str = "_directory";

/// Key in the volume directory tree for an accumulator checkpoint value:
/// `"_dir" | "_acc" | tree_name | index(u32 BE)`.
pub fn accumulator_key(tree_name: &str, index: u8) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + tree_name.len() + 4);
    key.extend_from_slice(DIRECTORY_PREFIX);
    key.extend_from_slice(ACCUMULATOR_PREFIX);
    key.extend_from_slice(tree_name.as_bytes());
    let mut idx = [0u8; 4];
    BigEndian::write_u32(&mut idx, index as u32);
    key.extend_from_slice(&idx);
    key
}

/// Parses an accumulator directory key back into `(tree_name, index)`.
pub fn parse_accumulator_key(key: &[u8]) -> Option<(String, u8)> {
    let prefix_len = DIRECTORY_PREFIX.len() + ACCUMULATOR_PREFIX.len();
    if key.len() < prefix_len + 4 || &key[..DIRECTORY_PREFIX.len()] != DIRECTORY_PREFIX {
        return None;
    }
    if &key[DIRECTORY_PREFIX.len()..prefix_len] != ACCUMULATOR_PREFIX {
        return None;
    }
    let name = String::from_utf8(key[prefix_len..key.len() - 4].to_vec()).ok()?;
    let index = BigEndian::read_u32(&key[key.len() - 4..]);
    if index >= ACCUMULATORS_PER_TREE as u32 {
        return None;
    }
    Some((name, index as u8))
}

/// A page-addressed storage file. Page 0 holds the volume header; data
/// pages start at address 1.
pub struct Volume {
    path: PathBuf,
    name: String,
    id: u64,
    page_size: usize,
    file: Mutex<File>,
}

impl Volume {
    /// Creates a volume file, writing its header page.
    pub fn create<P: AsRef<Path>>(path: P, name: &str, page_size: usize) -> EngineResult<Self> {
        let id = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64;
        let file = OpenOptions::new().read(true).write(true).create_new(true).open(path.as_ref())?;
        let volume = Self {
            path: path.as_ref().to_path_buf(),
            name: name.to_string(),
            id,
            page_size,
            file: Mutex::new(file),
        };
        volume.write_header()?;
        Ok(volume)
    }

    /// Opens an existing volume and validates its header.
    pub fn open<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        let mut fixed = [0u8; VOLUME_HEADER_FIXED];
        file.read_exact(&mut fixed)?;
        if fixed[0..4] != VOLUME_MAGIC {
            return Err(EngineError::CorruptJournal(format!(
                "{} is not a volume file",
                path.as_ref().display()
            )));
        }
        let version = BigEndian::read_u32(&fixed[4..8]);
        if version > VOLUME_VERSION {
            return Err(EngineError::CorruptJournal(format!("unsupported volume version {version}")));
        }
        let page_size = BigEndian::read_u32(&fixed[8..12]) as usize;
        let id = BigEndian::read_u64(&fixed[12..20]);
        let stored_checksum = BigEndian::read_u32(&fixed[28..32]);
        let name_len = BigEndian::read_u16(&fixed[32..34]) as usize;
        let mut name_bytes = vec![0u8; name_len];
        file.read_exact(&mut name_bytes)?;

        let mut check = fixed;
        check[28..32].fill(0);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&check);
        hasher.update(&name_bytes);
        if hasher.finalize() != stored_checksum {
            return Err(EngineError::CorruptJournal(format!(
                "volume header checksum mismatch in {}",
                path.as_ref().display()
            )));
        }

        let name = String::from_utf8(name_bytes)
            .map_err(|_| EngineError::CorruptJournal("volume name is not utf-8".to_string()))?;
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            name,
            id,
            page_size,
            file: Mutex::new(file),
        })
    }

    fn write_header(&self) -> EngineResult<()> {
        let name_bytes = self.name.as_bytes();
        let mut header = vec![0u8; VOLUME_HEADER_FIXED + name_bytes.len()];
        header[0..4].copy_from_slice(&VOLUME_MAGIC);
        BigEndian::write_u32(&mut header[4..8], VOLUME_VERSION);
        BigEndian::write_u32(&mut header[8..12], self.page_size as u32);
        BigEndian::write_u64(&mut header[12..20], self.id);
        let created = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64;
        BigEndian::write_u64(&mut header[20..28], created);
        BigEndian::write_u16(&mut header[32..34], name_bytes.len() as u16);
        header[VOLUME_HEADER_FIXED..].copy_from_slice(name_bytes);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header);
        let checksum = hasher.finalize();
        BigEndian::write_u32(&mut header[28..32], checksum);

        let mut page = vec![0u8; self.page_size];
        if header.len() > self.page_size {
            return Err(EngineError::InvariantViolation(format!(
                "volume name of {} bytes does not fit the header page",
                name_bytes.len()
            )));
        }
        page[..header.len()].copy_from_slice(&header);

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&page)?;
        file.sync_all()?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Reads the page at `page_address`. Pages never written read back as
    /// zeros, matching sparse-file semantics.
    pub fn read_page(&self, page_address: u64) -> EngineResult<Vec<u8>> {
        if page_address == 0 {
            return Err(EngineError::InvariantViolation("page 0 is the volume header".to_string()));
        }
        let offset = page_address * self.page_size as u64;
        let mut out = vec![0u8; self.page_size];
        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        if offset >= len {
            return Ok(out);
        }
        file.seek(SeekFrom::Start(offset))?;
        let available = ((len - offset) as usize).min(self.page_size);
        file.read_exact(&mut out[..available])?;
        Ok(out)
    }

    /// Writes a full page image at `page_address`.
    pub fn write_page(&self, page_address: u64, bytes: &[u8]) -> EngineResult<()> {
        if page_address == 0 {
            return Err(EngineError::InvariantViolation("page 0 is the volume header".to_string()));
        }
        if bytes.len() != self.page_size {
            return Err(EngineError::InvariantViolation(format!(
                "page image of {} bytes does not match page size {}",
                bytes.len(),
                self.page_size
            )));
        }
        let offset = page_address * self.page_size as u64;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        Ok(())
    }

    pub fn sync(&self) -> EngineResult<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

/// A named ordered map inside a volume, with its accumulator slots.
pub struct Tree {
    name: String,
    handle: u32,
    volume_handle: u32,
    accumulators: Mutex<HashMap<u8, Arc<Accumulator>>>,
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl Tree {
    pub fn new(name: &str, handle: u32, volume_handle: u32) -> Self {
        Self {
            name: name.to_string(),
            handle,
            volume_handle,
            accumulators: Mutex::new(HashMap::new()),
            data: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn volume_handle(&self) -> u32 {
        self.volume_handle
    }

    /// Returns the accumulator at `index`, creating it on first use. The
    /// type is fixed by the first caller.
    pub fn accumulator(&self, acc_type: AccumulatorType, index: u8) -> EngineResult<Arc<Accumulator>> {
        if index as usize >= ACCUMULATORS_PER_TREE {
            return Err(EngineError::InvariantViolation(format!(
                "accumulator index {index} out of range"
            )));
        }
        let mut slots = self.accumulators.lock();
        if let Some(existing) = slots.get(&index) {
            if existing.acc_type() != acc_type {
                return Err(EngineError::InvariantViolation(format!(
                    "accumulator {index} of tree {:?} is {:?}, requested {:?}",
                    self.name,
                    existing.acc_type(),
                    acc_type
                )));
            }
            return Ok(existing.clone());
        }
        let acc = Arc::new(Accumulator::new(acc_type, self.handle, index, BUCKET_COUNT));
        slots.insert(index, acc.clone());
        Ok(acc)
    }

    /// All accumulators currently materialised on this tree.
    pub fn accumulators(&self) -> Vec<Arc<Accumulator>> {
        self.accumulators.lock().values().cloned().collect()
    }

    /// Latest committed value for `key`.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.read().get(key).cloned()
    }

    /// Number of committed keys.
    pub fn key_count(&self) -> usize {
        self.data.read().len()
    }

    /// Snapshot of every committed entry, in key order.
    pub fn entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.data.read().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Applies a committed store.
    pub fn apply_store(&self, key: Vec<u8>, value: Vec<u8>) {
        self.data.write().insert(key, value);
    }

    /// Applies a committed delete of the half-open range `[key1, key2)`.
    pub fn apply_delete_range(&self, key1: &[u8], key2: &[u8]) {
        let mut data = self.data.write();
        let doomed: Vec<Vec<u8>> = data.range(key1.to_vec()..key2.to_vec()).map(|(k, _)| k.clone()).collect();
        for key in doomed {
            data.remove(&key);
        }
    }

    /// Applies a committed delete of the whole tree content.
    pub fn apply_delete_all(&self) {
        self.data.write().clear();
    }
}

/// The engine's set of open volumes and trees, shared with the copier and
/// recovery. Handles are assigned by the journal manager.
#[derive(Default)]
pub struct VolumeRegistry {
    volumes: RwLock<HashMap<u32, Arc<Volume>>>,
    trees: RwLock<HashMap<u32, Arc<Tree>>>,
}

impl VolumeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_volume(&self, handle: u32, volume: Arc<Volume>) {
        self.volumes.write().insert(handle, volume);
    }

    pub fn volume(&self, handle: u32) -> Option<Arc<Volume>> {
        self.volumes.read().get(&handle).cloned()
    }

    pub fn volume_by_name(&self, name: &str) -> Option<(u32, Arc<Volume>)> {
        self.volumes
            .read()
            .iter()
            .find(|(_, v)| v.name() == name)
            .map(|(h, v)| (*h, v.clone()))
    }

    pub fn insert_tree(&self, tree: Arc<Tree>) {
        self.trees.write().insert(tree.handle(), tree);
    }

    pub fn tree(&self, handle: u32) -> Option<Arc<Tree>> {
        self.trees.read().get(&handle).cloned()
    }

    pub fn tree_by_name(&self, volume_handle: u32, name: &str) -> Option<Arc<Tree>> {
        self.trees
            .read()
            .values()
            .find(|t| t.volume_handle() == volume_handle && t.name() == name)
            .cloned()
    }

    pub fn trees(&self) -> Vec<Arc<Tree>> {
        self.trees.read().values().cloned().collect()
    }

    pub fn volumes(&self) -> Vec<(u32, Arc<Volume>)> {
        self.volumes.read().iter().map(|(h, v)| (*h, v.clone())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_volume_create_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.vol");
        let volume = Volume::create(&path, "data", 4096).unwrap();
        let id = volume.id();
        drop(volume);

        let volume = Volume::open(&path).unwrap();
        assert_eq!(volume.name(), "data");
        assert_eq!(volume.id(), id);
        assert_eq!(volume.page_size(), 4096);
    }

    #[test]
    fn test_corrupt_header_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.vol");
        Volume::create(&path, "data", 4096).unwrap();
        // Flip a byte inside the named part of the header.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[35] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(Volume::open(&path), Err(EngineError::CorruptJournal(_))));
    }

    #[test]
    fn test_page_round_trip_and_sparse_reads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.vol");
        let volume = Volume::create(&path, "data", 512).unwrap();

        // Unwritten pages read as zeros.
        assert_eq!(volume.read_page(9).unwrap(), vec![0u8; 512]);

        let mut image = vec![0u8; 512];
        image[0] = 0xAB;
        image[511] = 0xCD;
        volume.write_page(3, &image).unwrap();
        volume.sync().unwrap();
        assert_eq!(volume.read_page(3).unwrap(), image);

        // The header page is fenced off.
        assert!(volume.write_page(0, &image).is_err());
        assert!(volume.read_page(0).is_err());
    }

    #[test]
    fn test_tree_range_delete() {
        let tree = Tree::new("t", 5, 1);
        tree.apply_store(b"a".to_vec(), b"1".to_vec());
        tree.apply_store(b"b".to_vec(), b"2".to_vec());
        tree.apply_store(b"c".to_vec(), b"3".to_vec());
        tree.apply_delete_range(b"a", b"c");
        assert!(tree.get(b"a").is_none());
        assert!(tree.get(b"b").is_none());
        assert_eq!(tree.get(b"c"), Some(b"3".to_vec()));
    }

    #[test]
    fn test_accumulator_slots() {
        let tree = Tree::new("t", 5, 1);
        let acc = tree.accumulator(AccumulatorType::Sum, 2).unwrap();
        let again = tree.accumulator(AccumulatorType::Sum, 2).unwrap();
        assert!(Arc::ptr_eq(&acc, &again));
        // Slot type is fixed by first use.
        assert!(tree.accumulator(AccumulatorType::Seq, 2).is_err());
        assert!(tree.accumulator(AccumulatorType::Sum, 64).is_err());
    }

    #[test]
    fn test_accumulator_key_round_trip() {
        let key = accumulator_key("orders", 7);
        assert!(key.starts_with(b"_dir_acc"));
        let (name, index) = parse_accumulator_key(&key).unwrap();
        assert_eq!(name, "orders");
        assert_eq!(index, 7);
        assert!(parse_accumulator_key(b"_dirother").is_none());
    }
}
