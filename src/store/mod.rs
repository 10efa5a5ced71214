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

//! Ledger storage.
//!
//! The engine and the compensation procedure are written once against these
//! traits; a backend only has to provide the primitives of a transactional
//! relational store:
//!
//! - units of work that either commit as a whole or leave no trace,
//! - insert-if-absent keyed by `tx_id`,
//! - a single-statement conditional balance update that refuses to go
//!   below zero, evaluated against the live row,
//! - a non-blocking, named, process-wide exclusive lock.
//!
//! Two backends ship with the crate: [`postgres::PgStore`] for production and
//! [`memory::MemoryStore`] for tests, benchmarks and CSV replay.

use crate::account::Account;
use crate::base::{AccountId, OperationId, TxId};
use crate::error::StoreResult;
use crate::operation::{Operation, OperationDraft};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;

pub mod memory;
pub mod postgres;

pub use memory::{Failpoint, MemoryStore};
pub use postgres::PgStore;

/// An operation picked for reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub id: OperationId,
    pub tx_id: TxId,
}

/// Shared ledger storage.
#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    type Tx: LedgerTx;
    type Lock: AdvisoryLock;

    /// Opens a unit of work. Dropping it without [`LedgerTx::commit`] rolls
    /// it back.
    async fn begin(&self) -> StoreResult<Self::Tx>;

    async fn account(&self, id: AccountId) -> StoreResult<Option<Account>>;

    async fn operation_by_tx_id(&self, tx_id: &TxId) -> StoreResult<Option<Operation>>;

    /// Applied, uncanceled operations ranked newest first (`created_at`, then
    /// `id`), keeping only odd ranks, at most `limit` of them.
    async fn reconciliation_candidates(&self, limit: usize) -> StoreResult<Vec<Candidate>>;

    /// Tries to take the exclusive lock `key` without waiting.
    ///
    /// `Ok(None)` means somebody else holds it, which is not an error.
    async fn try_advisory_lock(&self, key: i64) -> StoreResult<Option<Self::Lock>>;

    async fn health_check(&self) -> StoreResult<()>;
}

/// One open unit of work.
#[async_trait]
pub trait LedgerTx: Send {
    /// Creates the account with a zero balance unless it already exists.
    async fn ensure_account(&mut self, id: AccountId) -> StoreResult<()>;

    /// Inserts `draft` unless its `tx_id` is taken.
    ///
    /// Returns the new row's id, or `None` when the key already exists, in
    /// which case nothing was written.
    async fn insert_operation(&mut self, draft: &OperationDraft)
    -> StoreResult<Option<OperationId>>;

    /// Adds `delta` to the balance only if the result stays `>= 0`.
    ///
    /// Returns the updated snapshot, or `None` when the guard refused the
    /// update (or the account does not exist).
    async fn adjust_balance(&mut self, id: AccountId, delta: Decimal)
    -> StoreResult<Option<Account>>;

    async fn mark_applied(&mut self, id: OperationId) -> StoreResult<()>;

    async fn account(&mut self, id: AccountId) -> StoreResult<Option<Account>>;

    /// Fresh read of an operation, holding it against concurrent writers
    /// until the unit of work ends.
    async fn operation(&mut self, id: OperationId) -> StoreResult<Option<Operation>>;

    /// Sets `canceled_at` to now and replaces the note.
    async fn mark_canceled(&mut self, id: OperationId, note: &str) -> StoreResult<()>;

    /// Replaces the note without touching anything else.
    async fn annotate(&mut self, id: OperationId, note: &str) -> StoreResult<()>;

    async fn commit(self) -> StoreResult<()>;

    async fn rollback(self) -> StoreResult<()>;
}

/// Held exclusive lock. Dropping it releases the lock as well, but
/// [`AdvisoryLock::release`] reports failures.
#[async_trait]
pub trait AdvisoryLock: Send {
    async fn release(self) -> StoreResult<()>;
}
