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

//! Reconciliation candidate policy.
//!
//! Among applied, uncanceled operations ranked newest first, only the odd
//! ranks (1, 3, 5, ...) are reconciled, at most [`CANDIDATE_LIMIT`] per cycle.
//! Even ranks are never picked, so this is not "the N most recent".

use crate::operation::Operation;
use crate::store::Candidate;
use std::cmp::Reverse;

/// Upper bound on candidates handled by one cycle.
pub const CANDIDATE_LIMIT: usize = 10;

/// Keeps ranks 1, 3, 5, ... of an already ranked sequence, up to `limit`.
pub fn odd_ranks<T>(ranked: impl IntoIterator<Item = T>, limit: usize) -> Vec<T> {
    ranked.into_iter().step_by(2).take(limit).collect()
}

/// Applies the full policy to unordered operation rows.
///
/// Used by backends that cannot push the ranking down into a query.
pub fn select_candidates<'a>(
    operations: impl IntoIterator<Item = &'a Operation>,
    limit: usize,
) -> Vec<Candidate> {
    let mut eligible: Vec<&Operation> = operations
        .into_iter()
        .filter(|op| op.is_cancelable())
        .collect();
    eligible.sort_by_key(|op| Reverse((op.created_at, op.id)));

    odd_ranks(eligible, limit)
        .into_iter()
        .map(|op| Candidate {
            id: op.id,
            tx_id: op.tx_id.clone(),
        })
        .collect()
}
