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

// Journal record formats
// Every record starts with a fixed 16-byte header followed by a typed
// payload; all multi-byte integers are big-endian.

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use crate::error::{EngineError, EngineResult};
use crate::tx::timestamp::Timestamp;

/// Bytes in every record header.
pub const RECORD_HEADER_SIZE: usize = 16;

/// Full encoded size of a journal-end record; rollover reserves this much
/// before every block boundary.
pub const JE_OVERHEAD: usize = RECORD_HEADER_SIZE + 24;

/// Journal format version written into JH records.
pub const JOURNAL_VERSION: u64 = 1;

/// Record kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// Journal file header
    JournalHeader = 1,
    /// Journal end (clean close)
    JournalEnd = 2,
    /// Identify volume handle
    IdentifyVolume = 3,
    /// Identify tree handle
    IdentifyTree = 4,
    /// Page image
    PageImage = 5,
    /// Page map snapshot
    PageMap = 6,
    /// Live transaction map snapshot
    TransactionMap = 7,
    /// Store a key/value in a tree
    StoreRecord = 8,
    /// Delete a key range from a tree
    DeleteRange = 9,
    /// Delete a whole tree
    DeleteTree = 10,
    /// Transaction start
    TransactionStart = 11,
    /// Transaction commit
    TransactionCommit = 12,
    /// Accumulator delta inside a transaction
    TransactionDelta = 13,
    /// Checkpoint
    Checkpoint = 14,
}

impl RecordType {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(RecordType::JournalHeader),
            2 => Some(RecordType::JournalEnd),
            3 => Some(RecordType::IdentifyVolume),
            4 => Some(RecordType::IdentifyTree),
            5 => Some(RecordType::PageImage),
            6 => Some(RecordType::PageMap),
            7 => Some(RecordType::TransactionMap),
            8 => Some(RecordType::StoreRecord),
            9 => Some(RecordType::DeleteRange),
            10 => Some(RecordType::DeleteTree),
            11 => Some(RecordType::TransactionStart),
            12 => Some(RecordType::TransactionCommit),
            13 => Some(RecordType::TransactionDelta),
            14 => Some(RecordType::Checkpoint),
            _ => None,
        }
    }
}

/// Decoded record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Total record bytes including this header.
    pub length: u32,
    pub record_type: RecordType,
    pub timestamp: Timestamp,
}

impl RecordHeader {
    /// Writes the header for a record of `payload_len` payload bytes.
    pub fn write(out: &mut Vec<u8>, record_type: RecordType, timestamp: Timestamp, payload_len: usize) {
        let length = (RECORD_HEADER_SIZE + payload_len) as u32;
        out.write_u32::<BigEndian>(length).expect("vec write");
        out.write_u8(record_type as u8).expect("vec write");
        out.write_u8(0).expect("vec write");
        out.write_u16::<BigEndian>(0).expect("vec write");
        out.write_u64::<BigEndian>(timestamp as u64).expect("vec write");
    }

    /// Strict decode; any malformation is a corruption error.
    pub fn read(buf: &[u8]) -> EngineResult<Self> {
        Self::probe(buf).ok_or_else(|| EngineError::CorruptJournal("invalid record header".to_string()))
    }

    /// Lenient decode used while scanning: `None` marks the dirty tail of
    /// an uncleanly closed journal (zero length, truncated header, or an
    /// unknown tag) and the scan stops there.
    pub fn probe(buf: &[u8]) -> Option<Self> {
        if buf.len() < RECORD_HEADER_SIZE {
            return None;
        }
        let length = BigEndian::read_u32(&buf[0..4]);
        if (length as usize) < RECORD_HEADER_SIZE {
            return None;
        }
        let record_type = RecordType::from_code(buf[4])?;
        let timestamp = BigEndian::read_u64(&buf[8..16]) as Timestamp;
        Some(Self {
            length,
            record_type,
            timestamp,
        })
    }

    pub fn payload_len(&self) -> usize {
        self.length as usize - RECORD_HEADER_SIZE
    }
}

/// One page-map snapshot entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageMapEntry {
    pub timestamp: Timestamp,
    pub journal_address: u64,
    pub volume_handle: u32,
    pub page_address: u64,
}

const PAGE_MAP_ENTRY_SIZE: usize = 28;

/// One live-transaction-map snapshot entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionMapEntry {
    pub start_ts: Timestamp,
    pub commit_ts: Timestamp,
    pub start_address: u64,
    pub committed: bool,
}

const TRANSACTION_MAP_ENTRY_SIZE: usize = 25;

/// A decoded journal record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalRecord {
    JournalHeader {
        version: u64,
        block_size: u64,
        base_address: u64,
        current_address: u64,
        journal_created_time: u64,
        file_created_time: u64,
        path: String,
    },
    JournalEnd {
        current_address: u64,
        base_address: u64,
        journal_created_time: u64,
    },
    IdentifyVolume {
        handle: u32,
        volume_id: u64,
        name: String,
    },
    IdentifyTree {
        handle: u32,
        volume_handle: u32,
        name: String,
    },
    PageImage {
        volume_handle: u32,
        left_size: u32,
        buffer_size: u32,
        page_address: u64,
        bytes: Vec<u8>,
    },
    PageMap {
        entries: Vec<PageMapEntry>,
    },
    TransactionMap {
        entries: Vec<TransactionMapEntry>,
    },
    StoreRecord {
        tree_handle: u32,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    DeleteRange {
        tree_handle: u32,
        key1: Vec<u8>,
        key2: Vec<u8>,
    },
    DeleteTree {
        tree_handle: u32,
    },
    TransactionStart {
        start_ts: Timestamp,
    },
    TransactionCommit,
    TransactionDelta {
        tree_handle: u32,
        index: u8,
        acc_type: u8,
        value: i64,
    },
    Checkpoint {
        system_time_millis: u64,
        base_address: u64,
    },
}

impl JournalRecord {
    pub fn record_type(&self) -> RecordType {
        match self {
            JournalRecord::JournalHeader { .. } => RecordType::JournalHeader,
            JournalRecord::JournalEnd { .. } => RecordType::JournalEnd,
            JournalRecord::IdentifyVolume { .. } => RecordType::IdentifyVolume,
            JournalRecord::IdentifyTree { .. } => RecordType::IdentifyTree,
            JournalRecord::PageImage { .. } => RecordType::PageImage,
            JournalRecord::PageMap { .. } => RecordType::PageMap,
            JournalRecord::TransactionMap { .. } => RecordType::TransactionMap,
            JournalRecord::StoreRecord { .. } => RecordType::StoreRecord,
            JournalRecord::DeleteRange { .. } => RecordType::DeleteRange,
            JournalRecord::DeleteTree { .. } => RecordType::DeleteTree,
            JournalRecord::TransactionStart { .. } => RecordType::TransactionStart,
            JournalRecord::TransactionCommit => RecordType::TransactionCommit,
            JournalRecord::TransactionDelta { .. } => RecordType::TransactionDelta,
            JournalRecord::Checkpoint { .. } => RecordType::Checkpoint,
        }
    }

    /// Encodes the full record (header plus payload).
    pub fn encode(&self, timestamp: Timestamp) -> EngineResult<Vec<u8>> {
        let payload = self.encode_payload()?;
        let mut out = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
        RecordHeader::write(&mut out, self.record_type(), timestamp, payload.len());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    fn encode_payload(&self) -> EngineResult<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            JournalRecord::JournalHeader {
                version,
                block_size,
                base_address,
                current_address,
                journal_created_time,
                file_created_time,
                path,
            } => {
                out.write_u64::<BigEndian>(*version).expect("vec write");
                out.write_u64::<BigEndian>(*block_size).expect("vec write");
                out.write_u64::<BigEndian>(*base_address).expect("vec write");
                out.write_u64::<BigEndian>(*current_address).expect("vec write");
                out.write_u64::<BigEndian>(*journal_created_time).expect("vec write");
                out.write_u64::<BigEndian>(*file_created_time).expect("vec write");
                out.extend_from_slice(path.as_bytes());
            }
            JournalRecord::JournalEnd {
                current_address,
                base_address,
                journal_created_time,
            } => {
                out.write_u64::<BigEndian>(*current_address).expect("vec write");
                out.write_u64::<BigEndian>(*base_address).expect("vec write");
                out.write_u64::<BigEndian>(*journal_created_time).expect("vec write");
            }
            JournalRecord::IdentifyVolume { handle, volume_id, name } => {
                out.write_u32::<BigEndian>(*handle).expect("vec write");
                out.write_u64::<BigEndian>(*volume_id).expect("vec write");
                out.extend_from_slice(name.as_bytes());
            }
            JournalRecord::IdentifyTree { handle, volume_handle, name } => {
                out.write_u32::<BigEndian>(*handle).expect("vec write");
                out.write_u32::<BigEndian>(*volume_handle).expect("vec write");
                out.extend_from_slice(name.as_bytes());
            }
            JournalRecord::PageImage {
                volume_handle,
                left_size,
                buffer_size,
                page_address,
                bytes,
            } => {
                out.write_u32::<BigEndian>(*volume_handle).expect("vec write");
                out.write_u32::<BigEndian>(*left_size).expect("vec write");
                out.write_u32::<BigEndian>(*buffer_size).expect("vec write");
                out.write_u64::<BigEndian>(*page_address).expect("vec write");
                out.extend_from_slice(bytes);
            }
            JournalRecord::PageMap { entries } => {
                out.write_u32::<BigEndian>(entries.len() as u32).expect("vec write");
                for entry in entries {
                    out.write_u64::<BigEndian>(entry.timestamp as u64).expect("vec write");
                    out.write_u64::<BigEndian>(entry.journal_address).expect("vec write");
                    out.write_u32::<BigEndian>(entry.volume_handle).expect("vec write");
                    out.write_u64::<BigEndian>(entry.page_address).expect("vec write");
                }
            }
            JournalRecord::TransactionMap { entries } => {
                out.write_u32::<BigEndian>(entries.len() as u32).expect("vec write");
                for entry in entries {
                    out.write_u64::<BigEndian>(entry.start_ts as u64).expect("vec write");
                    out.write_u64::<BigEndian>(entry.commit_ts as u64).expect("vec write");
                    out.write_u64::<BigEndian>(entry.start_address).expect("vec write");
                    out.write_u8(entry.committed as u8).expect("vec write");
                }
            }
            JournalRecord::StoreRecord { tree_handle, key, value } => {
                let key_size = u16::try_from(key.len())
                    .map_err(|_| EngineError::InvariantViolation(format!("key of {} bytes exceeds journal limit", key.len())))?;
                out.write_u32::<BigEndian>(*tree_handle).expect("vec write");
                out.write_u16::<BigEndian>(key_size).expect("vec write");
                out.extend_from_slice(key);
                out.extend_from_slice(value);
            }
            JournalRecord::DeleteRange { tree_handle, key1, key2 } => {
                let key1_size = u16::try_from(key1.len())
                    .map_err(|_| EngineError::InvariantViolation(format!("key of {} bytes exceeds journal limit", key1.len())))?;
                out.write_u32::<BigEndian>(*tree_handle).expect("vec write");
                out.write_u16::<BigEndian>(key1_size).expect("vec write");
                out.extend_from_slice(key1);
                out.extend_from_slice(key2);
            }
            JournalRecord::DeleteTree { tree_handle } => {
                out.write_u32::<BigEndian>(*tree_handle).expect("vec write");
            }
            JournalRecord::TransactionStart { start_ts } => {
                out.write_u64::<BigEndian>(*start_ts as u64).expect("vec write");
            }
            JournalRecord::TransactionCommit => {}
            JournalRecord::TransactionDelta {
                tree_handle,
                index,
                acc_type,
                value,
            } => {
                out.write_u32::<BigEndian>(*tree_handle).expect("vec write");
                out.write_u8(*index).expect("vec write");
                out.write_u8(*acc_type).expect("vec write");
                out.write_i64::<BigEndian>(*value).expect("vec write");
            }
            JournalRecord::Checkpoint {
                system_time_millis,
                base_address,
            } => {
                out.write_u64::<BigEndian>(*system_time_millis).expect("vec write");
                out.write_u64::<BigEndian>(*base_address).expect("vec write");
            }
        }
        Ok(out)
    }

    /// Decodes a payload previously encoded for `header`.
    pub fn decode(header: &RecordHeader, payload: &[u8]) -> EngineResult<Self> {
        if payload.len() != header.payload_len() {
            return Err(EngineError::CorruptJournal(format!(
                "payload of {} bytes does not match header length {}",
                payload.len(),
                header.length
            )));
        }
        let need = |n: usize| -> EngineResult<()> {
            if payload.len() < n {
                Err(EngineError::CorruptJournal(format!(
                    "{:?} payload truncated: {} < {}",
                    header.record_type,
                    payload.len(),
                    n
                )))
            } else {
                Ok(())
            }
        };
        match header.record_type {
            RecordType::JournalHeader => {
                need(48)?;
                Ok(JournalRecord::JournalHeader {
                    version: BigEndian::read_u64(&payload[0..8]),
                    block_size: BigEndian::read_u64(&payload[8..16]),
                    base_address: BigEndian::read_u64(&payload[16..24]),
                    current_address: BigEndian::read_u64(&payload[24..32]),
                    journal_created_time: BigEndian::read_u64(&payload[32..40]),
                    file_created_time: BigEndian::read_u64(&payload[40..48]),
                    path: String::from_utf8_lossy(&payload[48..]).into_owned(),
                })
            }
            RecordType::JournalEnd => {
                need(24)?;
                Ok(JournalRecord::JournalEnd {
                    current_address: BigEndian::read_u64(&payload[0..8]),
                    base_address: BigEndian::read_u64(&payload[8..16]),
                    journal_created_time: BigEndian::read_u64(&payload[16..24]),
                })
            }
            RecordType::IdentifyVolume => {
                need(12)?;
                Ok(JournalRecord::IdentifyVolume {
                    handle: BigEndian::read_u32(&payload[0..4]),
                    volume_id: BigEndian::read_u64(&payload[4..12]),
                    name: String::from_utf8_lossy(&payload[12..]).into_owned(),
                })
            }
            RecordType::IdentifyTree => {
                need(8)?;
                Ok(JournalRecord::IdentifyTree {
                    handle: BigEndian::read_u32(&payload[0..4]),
                    volume_handle: BigEndian::read_u32(&payload[4..8]),
                    name: String::from_utf8_lossy(&payload[8..]).into_owned(),
                })
            }
            RecordType::PageImage => {
                need(20)?;
                Ok(JournalRecord::PageImage {
                    volume_handle: BigEndian::read_u32(&payload[0..4]),
                    left_size: BigEndian::read_u32(&payload[4..8]),
                    buffer_size: BigEndian::read_u32(&payload[8..12]),
                    page_address: BigEndian::read_u64(&payload[12..20]),
                    bytes: payload[20..].to_vec(),
                })
            }
            RecordType::PageMap => {
                need(4)?;
                let count = BigEndian::read_u32(&payload[0..4]) as usize;
                need(4 + count * PAGE_MAP_ENTRY_SIZE)?;
                let mut entries = Vec::with_capacity(count);
                let mut at = 4;
                for _ in 0..count {
                    entries.push(PageMapEntry {
                        timestamp: BigEndian::read_u64(&payload[at..at + 8]) as Timestamp,
                        journal_address: BigEndian::read_u64(&payload[at + 8..at + 16]),
                        volume_handle: BigEndian::read_u32(&payload[at + 16..at + 20]),
                        page_address: BigEndian::read_u64(&payload[at + 20..at + 28]),
                    });
                    at += PAGE_MAP_ENTRY_SIZE;
                }
                Ok(JournalRecord::PageMap { entries })
            }
            RecordType::TransactionMap => {
                need(4)?;
                let count = BigEndian::read_u32(&payload[0..4]) as usize;
                need(4 + count * TRANSACTION_MAP_ENTRY_SIZE)?;
                let mut entries = Vec::with_capacity(count);
                let mut at = 4;
                for _ in 0..count {
                    entries.push(TransactionMapEntry {
                        start_ts: BigEndian::read_u64(&payload[at..at + 8]) as Timestamp,
                        commit_ts: BigEndian::read_u64(&payload[at + 8..at + 16]) as Timestamp,
                        start_address: BigEndian::read_u64(&payload[at + 16..at + 24]),
                        committed: payload[at + 24] != 0,
                    });
                    at += TRANSACTION_MAP_ENTRY_SIZE;
                }
                Ok(JournalRecord::TransactionMap { entries })
            }
            RecordType::StoreRecord => {
                need(6)?;
                let tree_handle = BigEndian::read_u32(&payload[0..4]);
                let key_size = BigEndian::read_u16(&payload[4..6]) as usize;
                need(6 + key_size)?;
                Ok(JournalRecord::StoreRecord {
                    tree_handle,
                    key: payload[6..6 + key_size].to_vec(),
                    value: payload[6 + key_size..].to_vec(),
                })
            }
            RecordType::DeleteRange => {
                need(6)?;
                let tree_handle = BigEndian::read_u32(&payload[0..4]);
                let key1_size = BigEndian::read_u16(&payload[4..6]) as usize;
                need(6 + key1_size)?;
                Ok(JournalRecord::DeleteRange {
                    tree_handle,
                    key1: payload[6..6 + key1_size].to_vec(),
                    key2: payload[6 + key1_size..].to_vec(),
                })
            }
            RecordType::DeleteTree => {
                need(4)?;
                Ok(JournalRecord::DeleteTree {
                    tree_handle: BigEndian::read_u32(&payload[0..4]),
                })
            }
            RecordType::TransactionStart => {
                need(8)?;
                Ok(JournalRecord::TransactionStart {
                    start_ts: BigEndian::read_u64(&payload[0..8]) as Timestamp,
                })
            }
            RecordType::TransactionCommit => Ok(JournalRecord::TransactionCommit),
            RecordType::TransactionDelta => {
                need(14)?;
                Ok(JournalRecord::TransactionDelta {
                    tree_handle: BigEndian::read_u32(&payload[0..4]),
                    index: payload[4],
                    acc_type: payload[5],
                    value: BigEndian::read_i64(&payload[6..14]),
                })
            }
            RecordType::Checkpoint => {
                need(16)?;
                Ok(JournalRecord::Checkpoint {
                    system_time_millis: BigEndian::read_u64(&payload[0..8]),
                    base_address: BigEndian::read_u64(&payload[8..16]),
                })
            }
        }
    }
}

/// Reassembles the full page image carried by a PA record: the payload
/// holds `left_size` leading bytes and the trailing remainder, with the
/// hole between them zero-filled to `buffer_size`.
pub fn reassemble_page(left_size: u32, buffer_size: u32, bytes: &[u8]) -> EngineResult<Vec<u8>> {
    let left = left_size as usize;
    let total = buffer_size as usize;
    if left > bytes.len() || bytes.len() > total {
        return Err(EngineError::CorruptJournal(format!(
            "page image of {} bytes with left {} does not fit buffer {}",
            bytes.len(),
            left,
            total
        )));
    }
    let mut out = vec![0u8; total];
    out[..left].copy_from_slice(&bytes[..left]);
    let right = &bytes[left..];
    out[total - right.len()..].copy_from_slice(right);
    Ok(out)
}
