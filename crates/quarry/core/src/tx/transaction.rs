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

// Transactions
// The client-facing transaction handle. Tree updates are buffered on the
// handle and reach the journal in one contiguous TS..TC bracket at commit;
// accumulator updates post deltas on the status immediately. Dropping an
// active transaction aborts it.

use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::journal::manager::{JournalManager, TransactionUpdate};
use crate::tx::accumulator::{Accumulator, AccumulatorType};
use crate::tx::index::{TransactionIndex, TxnRef};
use crate::tx::timestamp::Timestamp;
use crate::volume::{Tree, VolumeRegistry};

/// Durability demanded by a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPolicy {
    /// The commit is durable once the periodic flusher catches up.
    Soft,
    /// The journal is forced to disk before the commit is published.
    Hard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Active,
    Committed,
    Aborted,
}

/// A transaction under snapshot isolation.
pub struct Transaction {
    index: Arc<TransactionIndex>,
    journal: Arc<JournalManager>,
    registry: Arc<VolumeRegistry>,
    txn: TxnRef,
    step: u32,
    updates: Vec<TransactionUpdate>,
    state: TxnState,
    internal: bool,
}

impl Transaction {
    pub(crate) fn begin(
        index: Arc<TransactionIndex>,
        journal: Arc<JournalManager>,
        registry: Arc<VolumeRegistry>,
        internal: bool,
    ) -> Self {
        let txn = index.begin();
        Self {
            index,
            journal,
            registry,
            txn,
            step: 0,
            updates: Vec::new(),
            state: TxnState::Active,
            internal,
        }
    }

    /// Start timestamp; doubles as the snapshot the transaction reads at.
    pub fn ts(&self) -> Timestamp {
        self.txn.ts
    }

    /// Current intra-transaction step.
    pub fn step(&self) -> u32 {
        self.step
    }

    /// Advances the step so later reads observe earlier same-transaction
    /// accumulator updates.
    pub fn increment_step(&mut self) -> u32 {
        self.step += 1;
        self.step
    }

    /// True for the engine's own bookkeeping sessions (checkpoints).
    pub fn is_internal(&self) -> bool {
        self.internal
    }

    pub fn is_active(&self) -> bool {
        self.state == TxnState::Active
    }

    fn check_active(&self) -> EngineResult<()> {
        if self.state != TxnState::Active {
            return Err(EngineError::TransactionNotActive(format!(
                "transaction {} is {:?}",
                self.txn.ts, self.state
            )));
        }
        Ok(())
    }

    /// Resolves whether a version written at `version_ts` is visible to
    /// this transaction.
    pub fn is_visible(&self, version_ts: Timestamp) -> EngineResult<bool> {
        self.index.is_visible(version_ts, self.txn.ts)
    }

    /// Buffers a key/value store into `tree`.
    pub fn store(&mut self, tree: &Tree, key: &[u8], value: &[u8]) -> EngineResult<()> {
        self.check_active()?;
        self.updates.push(TransactionUpdate::Store {
            tree_handle: tree.handle(),
            key: key.to_vec(),
            value: value.to_vec(),
        });
        Ok(())
    }

    /// Buffers a delete of the half-open key range `[key1, key2)`.
    pub fn delete_range(&mut self, tree: &Tree, key1: &[u8], key2: &[u8]) -> EngineResult<()> {
        self.check_active()?;
        self.updates.push(TransactionUpdate::DeleteRange {
            tree_handle: tree.handle(),
            key1: key1.to_vec(),
            key2: key2.to_vec(),
        });
        Ok(())
    }

    /// Buffers a delete of the whole content of `tree`.
    pub fn delete_tree(&mut self, tree: &Tree) -> EngineResult<()> {
        self.check_active()?;
        self.updates.push(TransactionUpdate::DeleteTree { tree_handle: tree.handle() });
        Ok(())
    }

    /// Applies an accumulator update, returning the updated live value.
    pub fn update_accumulator(&self, acc: &Arc<Accumulator>, value: i64) -> EngineResult<i64> {
        self.check_active()?;
        self.index.update_accumulator(&self.txn, acc, value, self.step)
    }

    /// Allocates the next value of a SEQ accumulator.
    pub fn allocate(&self, acc: &Arc<Accumulator>) -> EngineResult<i64> {
        if acc.acc_type() != AccumulatorType::Seq {
            return Err(EngineError::InvariantViolation(format!(
                "allocate on a {:?} accumulator",
                acc.acc_type()
            )));
        }
        self.update_accumulator(acc, 1)
    }

    /// Snapshot value of `acc` at this transaction's timestamp and step.
    pub fn snapshot(&self, acc: &Arc<Accumulator>) -> EngineResult<i64> {
        self.index.accumulator_snapshot(acc, self.txn.ts, self.step)
    }

    /// Commits the transaction and returns its commit timestamp.
    pub fn commit(&mut self, policy: CommitPolicy) -> EngineResult<Timestamp> {
        self.check_active()?;
        let deltas = self.index.collect_deltas(&self.txn)?;
        let read_only = self.updates.is_empty() && deltas.is_empty();

        let tc = self.index.begin_commit(&self.txn)?;
        if !read_only {
            let mut updates = self.updates.clone();
            updates.extend(deltas.into_iter().map(|d| TransactionUpdate::Delta {
                tree_handle: d.tree_handle,
                index: d.index,
                acc_type: d.acc_type.code(),
                value: d.value,
            }));
            let journaled = self
                .journal
                .write_transaction(self.txn.ts, tc, &updates)
                .and_then(|_| match policy {
                    CommitPolicy::Hard => self.journal.force(),
                    CommitPolicy::Soft => Ok(()),
                });
            if let Err(err) = journaled {
                self.index.abort(&self.txn)?;
                self.state = TxnState::Aborted;
                return Err(err);
            }
        }
        self.index.finish_commit(&self.txn, tc)?;
        self.state = TxnState::Committed;
        self.apply_updates();
        Ok(tc)
    }

    fn apply_updates(&mut self) {
        for update in self.updates.drain(..) {
            match update {
                TransactionUpdate::Store { tree_handle, key, value } => {
                    if let Some(tree) = self.registry.tree(tree_handle) {
                        tree.apply_store(key, value);
                    }
                }
                TransactionUpdate::DeleteRange { tree_handle, key1, key2 } => {
                    if let Some(tree) = self.registry.tree(tree_handle) {
                        tree.apply_delete_range(&key1, &key2);
                    }
                }
                TransactionUpdate::DeleteTree { tree_handle } => {
                    if let Some(tree) = self.registry.tree(tree_handle) {
                        tree.apply_delete_all();
                    }
                }
                TransactionUpdate::Delta { .. } => {}
            }
        }
    }

    /// Aborts the transaction; its buffered updates are discarded and its
    /// accumulator deltas die with the status.
    pub fn abort(&mut self) -> EngineResult<()> {
        self.check_active()?;
        self.index.abort(&self.txn)?;
        self.state = TxnState::Aborted;
        self.updates.clear();
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TxnState::Active {
            let _ = self.index.abort(&self.txn);
        }
    }
}
