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

//! Account snapshots.
//!
//! The balance is a materialised projection of the applied operations,
//! maintained incrementally by conditional updates and never recomputed from
//! history on read.
//!
//! # Example
//!
//! ```
//! use balance_ledger::{Account, AccountId};
//! use rust_decimal::Decimal;
//!
//! let account = Account::empty(AccountId::new_v4(), chrono::Utc::now());
//! assert_eq!(account.balance, Decimal::ZERO);
//! ```

use crate::base::AccountId;
use crate::error::{StoreError, StoreResult};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Largest balance the `NUMERIC(20, 2)` column holds: 18 integer digits.
pub const MAX_BALANCE: Decimal = Decimal::from_parts(0x630F_FFFF, 0x6BC7_5E2D, 0x5, false, 2);

/// Point-in-time view of an account row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub id: AccountId,
    pub balance: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// A freshly upserted account.
    pub fn empty(id: AccountId, now: DateTime<Utc>) -> Self {
        Account {
            id,
            balance: Decimal::ZERO,
            updated_at: now,
        }
    }

    /// Balance after applying `delta`, or `None` if it would go negative.
    ///
    /// This is the guard every mutation goes through; the PostgreSQL backend
    /// evaluates the same predicate inside its `UPDATE ... WHERE`. A result
    /// above [`MAX_BALANCE`] is an error, as the column overflow is there.
    pub fn checked_apply(&self, delta: Decimal) -> StoreResult<Option<Decimal>> {
        let next = self
            .balance
            .checked_add(delta)
            .filter(|next| *next <= MAX_BALANCE)
            .ok_or(StoreError::BalanceOutOfRange)?;
        Ok((next >= Decimal::ZERO).then_some(next))
    }
}
