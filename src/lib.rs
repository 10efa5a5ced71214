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

//! # Balance Ledger
//!
//! A balance ledger that records deposits and withdrawals against accounts,
//! guarantees that a retried request is applied at most once, and never lets a
//! balance drop below zero. A background scheduler periodically reverses a
//! sample of applied operations with compensating entries, guarded by a
//! cluster-wide advisory lock so that only one replica reconciles at a time.
//!
//! ## Core Components
//!
//! - [`Engine`]: applies one operation per unit of work, idempotent on `tx_id`
//! - [`Compensator`]: reverses one applied operation, idempotently
//! - [`CancelScheduler`]: periodic, lock-guarded reconciliation cycles
//! - [`LedgerStore`]: storage seam, backed by [`PgStore`] or [`MemoryStore`]
//! - [`LedgerError`]: error taxonomy surfaced to callers
//!
//! ## Example
//!
//! ```
//! use balance_ledger::{AccountId, Engine, MemoryStore, NewOperation, ProcessOutcome};
//! use rust_decimal_macros::dec;
//! use std::sync::Arc;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let engine = Engine::new(Arc::new(MemoryStore::new()));
//! let account_id = AccountId::new_v4();
//!
//! let outcome = engine
//!     .process(NewOperation::deposit(account_id, "t1", dec!(50.00)))
//!     .await
//!     .unwrap();
//! assert!(matches!(outcome, ProcessOutcome::Applied(_)));
//!
//! // a retry with the same key changes nothing
//! let retry = engine
//!     .process(NewOperation::deposit(account_id, "t1", dec!(50.00)))
//!     .await
//!     .unwrap();
//! assert!(matches!(retry, ProcessOutcome::AlreadyProcessed(_)));
//!
//! assert_eq!(engine.balance(account_id).await.unwrap().balance, dec!(50.00));
//! # });
//! ```
//!
//! ## Concurrency
//!
//! Correctness is delegated to the store: every mutation happens inside one
//! unit of work, and the non-negative guard is part of the balance update
//! statement itself rather than a read followed by a write.

pub mod account;
pub mod api;
mod base;
pub mod clock;
pub mod compensation;
pub mod config;
mod engine;
pub mod error;
pub mod operation;
pub mod scheduler;
pub mod selection;
pub mod store;
pub mod telemetry;

pub use account::Account;
pub use base::{AccountId, CANCEL_PREFIX, OperationId, TxId};
pub use compensation::{CompensationOutcome, Compensator, SkipReason};
pub use engine::{Engine, ProcessOutcome, ProcessStatus, Receipt};
pub use error::{LedgerError, StoreError};
pub use operation::{Direction, NewOperation, Operation, Source};
pub use scheduler::{CancelScheduler, CycleOutcome, CycleSummary, SchedulerSettings};
pub use store::{LedgerStore, MemoryStore, PgStore};
