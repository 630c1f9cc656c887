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

// Page map
// Maps (volume handle, page address) to the chain of journal addresses
// holding successively newer images of that page. The newest image is the
// chain head; `prev` walks towards older versions. The whole structure is
// guarded by the journal mutex in the manager.

use std::collections::HashMap;

use crate::tx::timestamp::Timestamp;

/// Identity of a page. Equality ignores versions; those live on the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageKey {
    pub volume_handle: u32,
    pub page_address: u64,
}

/// One journaled image of a page.
#[derive(Debug)]
pub struct PageNode {
    pub journal_address: u64,
    pub timestamp: Timestamp,
    /// Older image of the same page, if still needed.
    pub prev: Option<Box<PageNode>>,
}

/// A page eligible for migration back to its home volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyCandidate {
    pub key: PageKey,
    pub journal_address: u64,
    pub timestamp: Timestamp,
}

/// Mapping from page identity to its version chain.
#[derive(Debug, Default)]
pub struct PageMap {
    map: HashMap<PageKey, PageNode>,
}

impl PageMap {
    pub fn new() -> Self {
        Self { map: HashMap::new() }
    }

    /// Publishes a new image as the chain head.
    pub fn put(&mut self, key: PageKey, journal_address: u64, timestamp: Timestamp) {
        let prev = self.map.remove(&key).map(Box::new);
        self.map.insert(
            key,
            PageNode {
                journal_address,
                timestamp,
                prev,
            },
        );
    }

    /// Journal address of the newest image of `key`.
    pub fn resolve(&self, key: &PageKey) -> Option<u64> {
        self.map.get(key).map(|node| node.journal_address)
    }

    /// Journal address of the newest image with timestamp at or below
    /// `ts_limit`.
    pub fn resolve_at(&self, key: &PageKey, ts_limit: Timestamp) -> Option<u64> {
        let mut node = self.map.get(key)?;
        loop {
            if node.timestamp <= ts_limit {
                return Some(node.journal_address);
            }
            node = node.prev.as_deref()?;
        }
    }

    pub fn contains(&self, key: &PageKey) -> bool {
        self.map.contains_key(key)
    }

    /// Number of distinct pages with journaled images.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Collects up to `max` pages whose newest eligible image has
    /// timestamp below `ts_limit` and journal address below
    /// `address_limit`, sorted by (volume, page) so volume writes are as
    /// sequential as possible.
    pub fn copy_candidates(&self, ts_limit: Timestamp, address_limit: u64, max: usize) -> Vec<CopyCandidate> {
        let mut out = Vec::new();
        for (key, head) in &self.map {
            let mut node = Some(head);
            while let Some(n) = node {
                if n.timestamp < ts_limit && n.journal_address < address_limit {
                    out.push(CopyCandidate {
                        key: *key,
                        journal_address: n.journal_address,
                        timestamp: n.timestamp,
                    });
                    break;
                }
                node = n.prev.as_deref();
            }
        }
        out.sort_by_key(|c| c.key);
        out.truncate(max);
        out
    }

    /// Drops the copied image (and everything older) from `key`'s chain.
    /// If the copied image was the head the whole entry goes away.
    pub fn note_copied(&mut self, key: &PageKey, journal_address: u64) {
        let Some(head) = self.map.get_mut(key) else {
            return;
        };
        if head.journal_address == journal_address {
            self.map.remove(key);
            return;
        }
        let mut node = head;
        loop {
            match &node.prev {
                Some(prev) if prev.journal_address == journal_address => {
                    node.prev = None;
                    return;
                }
                Some(_) => {
                    node = node.prev.as_mut().expect("prev checked above");
                }
                None => return,
            }
        }
    }

    /// Smallest journal address still referenced by any chain.
    pub fn min_journal_address(&self) -> Option<u64> {
        let mut min = None;
        for head in self.map.values() {
            let mut node = Some(head);
            while let Some(n) = node {
                min = Some(match min {
                    Some(m) if m <= n.journal_address => m,
                    _ => n.journal_address,
                });
                node = n.prev.as_deref();
            }
        }
        min
    }

    /// Every (key, address, timestamp) triple in every chain, newest
    /// first per page. This is what a PM snapshot persists.
    pub fn all_entries(&self) -> Vec<(PageKey, u64, Timestamp)> {
        let mut out = Vec::new();
        for (key, head) in &self.map {
            let mut node = Some(head);
            while let Some(n) = node {
                out.push((*key, n.journal_address, n.timestamp));
                node = n.prev.as_deref();
            }
        }
        out.sort_by_key(|(key, address, _)| (*key, std::cmp::Reverse(*address)));
        out
    }

    pub fn remove(&mut self, key: &PageKey) {
        self.map.remove(key);
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}
