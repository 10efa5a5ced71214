// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! In-process ledger backend.
//!
//! Every unit of work takes one async mutex over the whole ledger for its
//! lifetime, so units of work are serialisable. Mutations are recorded in an
//! undo log that is replayed when the unit of work is rolled back or dropped
//! uncommitted. Operation ids are never reused, even after a rollback, the
//! same way a database sequence leaves gaps.
//!
//! Advisory locks live in a [`DashMap`] shared by every clone of the store,
//! so clones behave like separate service replicas pointed at one database.

use super::{AdvisoryLock, Candidate, LedgerStore, LedgerTx};
use crate::account::Account;
use crate::base::{AccountId, OperationId, TxId};
use crate::clock::{Clock, SystemClock};
use crate::error::{StoreError, StoreResult};
use crate::operation::{Operation, OperationDraft};
use crate::selection::select_candidates;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Points at which the store can be told to fail, to exercise the
/// storage-failure paths of its callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Failpoint {
    Begin,
    InsertOperation,
    AdjustBalance,
    MarkApplied,
    /// Loading one specific operation inside a unit of work.
    LoadOperation(OperationId),
    MarkCanceled,
    Commit,
    Candidates,
    AdvisoryLock,
    HealthCheck,
}

#[derive(Debug, Default, Clone)]
struct Faults(Arc<Mutex<HashSet<Failpoint>>>);

impl Faults {
    fn trip(&self, point: Failpoint) -> StoreResult<()> {
        if self.0.lock().contains(&point) {
            return Err(StoreError::Unavailable(format!("simulated failure at {point:?}")));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    accounts: HashMap<AccountId, Account>,
    operations: BTreeMap<OperationId, Operation>,
    tx_index: HashMap<TxId, OperationId>,
    last_id: i64,
}

/// In-memory [`LedgerStore`]. Cloning shares the underlying ledger.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<AsyncMutex<LedgerState>>,
    locks: Arc<DashMap<i64, ()>>,
    clock: Arc<dyn Clock>,
    faults: Faults,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        MemoryStore {
            state: Arc::new(AsyncMutex::new(LedgerState::default())),
            locks: Arc::new(DashMap::new()),
            clock,
            faults: Faults::default(),
        }
    }

    /// Makes every subsequent call reaching `point` fail until cleared.
    pub fn fail_at(&self, point: Failpoint) {
        self.faults.0.lock().insert(point);
    }

    pub fn clear_failures(&self) {
        self.faults.0.lock().clear();
    }

    /// All operation rows in id order.
    pub async fn operations(&self) -> Vec<Operation> {
        self.state.lock().await.operations.values().cloned().collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    type Tx = MemoryTx;
    type Lock = MemoryLock;

    async fn begin(&self) -> StoreResult<MemoryTx> {
        self.faults.trip(Failpoint::Begin)?;
        let state = Arc::clone(&self.state).lock_owned().await;
        Ok(MemoryTx {
            state,
            undo: Vec::new(),
            clock: Arc::clone(&self.clock),
            faults: self.faults.clone(),
            finished: false,
        })
    }

    async fn account(&self, id: AccountId) -> StoreResult<Option<Account>> {
        Ok(self.state.lock().await.accounts.get(&id).cloned())
    }

    async fn operation_by_tx_id(&self, tx_id: &TxId) -> StoreResult<Option<Operation>> {
        let state = self.state.lock().await;
        Ok(state
            .tx_index
            .get(tx_id)
            .and_then(|id| state.operations.get(id))
            .cloned())
    }

    async fn reconciliation_candidates(&self, limit: usize) -> StoreResult<Vec<Candidate>> {
        self.faults.trip(Failpoint::Candidates)?;
        let state = self.state.lock().await;
        Ok(select_candidates(state.operations.values(), limit))
    }

    async fn try_advisory_lock(&self, key: i64) -> StoreResult<Option<MemoryLock>> {
        self.faults.trip(Failpoint::AdvisoryLock)?;
        match self.locks.entry(key) {
            Entry::Occupied(_) => Ok(None),
            Entry::Vacant(entry) => {
                entry.insert(());
                Ok(Some(MemoryLock {
                    locks: Arc::clone(&self.locks),
                    key,
                }))
            }
        }
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.faults.trip(Failpoint::HealthCheck)
    }
}

enum Undo {
    AccountCreated(AccountId),
    AccountChanged(Account),
    OperationInserted(OperationId),
    OperationChanged(Operation),
}

/// Unit of work over a [`MemoryStore`].
pub struct MemoryTx {
    state: OwnedMutexGuard<LedgerState>,
    undo: Vec<Undo>,
    clock: Arc<dyn Clock>,
    faults: Faults,
    finished: bool,
}

impl MemoryTx {
    fn undo_all(&mut self) {
        while let Some(step) = self.undo.pop() {
            match step {
                Undo::AccountCreated(id) => {
                    self.state.accounts.remove(&id);
                }
                Undo::AccountChanged(previous) => {
                    self.state.accounts.insert(previous.id, previous);
                }
                Undo::OperationInserted(id) => {
                    if let Some(op) = self.state.operations.remove(&id) {
                        self.state.tx_index.remove(&op.tx_id);
                    }
                }
                Undo::OperationChanged(previous) => {
                    self.state.operations.insert(previous.id, previous);
                }
            }
        }
    }

    /// Updates a row in place; a missing row is a no-op, like an `UPDATE`
    /// matching nothing.
    fn update_operation(&mut self, id: OperationId, change: impl FnOnce(&mut Operation)) {
        if let Some(op) = self.state.operations.get_mut(&id) {
            self.undo.push(Undo::OperationChanged(op.clone()));
            change(op);
        }
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if !self.finished {
            self.undo_all();
        }
    }
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn ensure_account(&mut self, id: AccountId) -> StoreResult<()> {
        if !self.state.accounts.contains_key(&id) {
            let now = self.clock.now();
            self.state.accounts.insert(id, Account::empty(id, now));
            self.undo.push(Undo::AccountCreated(id));
        }
        Ok(())
    }

    async fn insert_operation(
        &mut self,
        draft: &OperationDraft,
    ) -> StoreResult<Option<OperationId>> {
        self.faults.trip(Failpoint::InsertOperation)?;
        if self.state.tx_index.contains_key(&draft.tx_id) {
            return Ok(None);
        }

        self.state.last_id += 1;
        let id = OperationId(self.state.last_id);
        let op = Operation {
            id,
            tx_id: draft.tx_id.clone(),
            account_id: draft.account_id,
            source: draft.source,
            direction: draft.direction,
            amount: draft.amount,
            created_at: self.clock.now(),
            applied: draft.applied,
            canceled_at: None,
            cancel_note: draft.note.map(str::to_owned),
        };
        self.state.tx_index.insert(op.tx_id.clone(), id);
        self.state.operations.insert(id, op);
        self.undo.push(Undo::OperationInserted(id));
        Ok(Some(id))
    }

    async fn adjust_balance(
        &mut self,
        id: AccountId,
        delta: Decimal,
    ) -> StoreResult<Option<Account>> {
        self.faults.trip(Failpoint::AdjustBalance)?;
        let now = self.clock.now();
        let Some(account) = self.state.accounts.get_mut(&id) else {
            return Ok(None);
        };
        let Some(balance) = account.checked_apply(delta)? else {
            return Ok(None);
        };

        self.undo.push(Undo::AccountChanged(account.clone()));
        account.balance = balance;
        account.updated_at = now;
        Ok(Some(account.clone()))
    }

    async fn mark_applied(&mut self, id: OperationId) -> StoreResult<()> {
        self.faults.trip(Failpoint::MarkApplied)?;
        self.update_operation(id, |op| op.applied = true);
        Ok(())
    }

    async fn account(&mut self, id: AccountId) -> StoreResult<Option<Account>> {
        Ok(self.state.accounts.get(&id).cloned())
    }

    async fn operation(&mut self, id: OperationId) -> StoreResult<Option<Operation>> {
        self.faults.trip(Failpoint::LoadOperation(id))?;
        Ok(self.state.operations.get(&id).cloned())
    }

    async fn mark_canceled(&mut self, id: OperationId, note: &str) -> StoreResult<()> {
        self.faults.trip(Failpoint::MarkCanceled)?;
        let now = self.clock.now();
        self.update_operation(id, |op| {
            op.canceled_at = Some(now);
            op.cancel_note = Some(note.to_owned());
        });
        Ok(())
    }

    async fn annotate(&mut self, id: OperationId, note: &str) -> StoreResult<()> {
        self.update_operation(id, |op| op.cancel_note = Some(note.to_owned()));
        Ok(())
    }

    async fn commit(mut self) -> StoreResult<()> {
        // on failure `self` drops unfinished and rolls back
        self.faults.trip(Failpoint::Commit)?;
        self.finished = true;
        Ok(())
    }

    async fn rollback(mut self) -> StoreResult<()> {
        self.undo_all();
        self.finished = true;
        Ok(())
    }
}

/// Advisory lock held in a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryLock {
    locks: Arc<DashMap<i64, ()>>,
    key: i64,
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        self.locks.remove(&self.key);
    }
}

#[async_trait]
impl AdvisoryLock for MemoryLock {
    async fn release(self) -> StoreResult<()> {
        drop(self);
        Ok(())
    }
}
