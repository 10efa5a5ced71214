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

//! Request validation shared by the HTTP API and CSV replay.

use crate::account::MAX_BALANCE;
use crate::base::{AccountId, CANCEL_PREFIX, TxId};
use crate::operation::{Direction, NewOperation, Source};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Longest accepted idempotency key, in bytes.
pub const MAX_TX_ID_LEN: usize = 128;
/// Minor-unit precision of amounts.
pub const MAX_AMOUNT_SCALE: u32 = 2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("invalid account_id format: must be valid UUID")]
    AccountId,

    #[error("invalid amount format: must be valid decimal")]
    AmountFormat,

    #[error("amount must be positive")]
    AmountNotPositive,

    #[error("amount must have at most 2 decimal places")]
    AmountScale,

    #[error("amount must have at most 18 integer digits")]
    AmountTooLarge,

    #[error("tx_id must be at most 128 characters")]
    TxIdTooLong,

    /// Keys under this prefix belong to compensating entries.
    #[error("tx_id must not start with \"cancel::\"")]
    TxIdReserved,

    #[error("invalid source value")]
    Source,

    #[error("invalid state value")]
    State,
}

/// Untrusted operation as it arrives on the wire. Every field is a string so
/// that a missing or malformed one yields a precise message.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ProcessRequest {
    pub account_id: Option<String>,
    pub source: Option<String>,
    pub state: Option<String>,
    pub amount: Option<String>,
    pub tx_id: Option<String>,
}

impl ProcessRequest {
    pub fn validate(self) -> Result<NewOperation, ValidationError> {
        let account_id = parse_account_id(&required(self.account_id, "account_id")?)?;
        let tx_id = parse_tx_id(&required(self.tx_id, "tx_id")?)?;
        let amount = parse_amount(&required(self.amount, "amount")?)?;
        let source = required(self.source, "source")?
            .parse::<Source>()
            .map_err(|()| ValidationError::Source)?;
        let direction = required(self.state, "state")?
            .parse::<Direction>()
            .map_err(|()| ValidationError::State)?;

        Ok(NewOperation {
            tx_id,
            account_id,
            source,
            direction,
            amount,
        })
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ValidationError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or(ValidationError::Missing(field))
}

pub fn parse_account_id(raw: &str) -> Result<AccountId, ValidationError> {
    if raw.is_empty() {
        return Err(ValidationError::Missing("account_id"));
    }
    Uuid::parse_str(raw)
        .map(AccountId)
        .map_err(|_| ValidationError::AccountId)
}

pub fn parse_amount(raw: &str) -> Result<Decimal, ValidationError> {
    let amount = Decimal::from_str(raw).map_err(|_| ValidationError::AmountFormat)?;
    if amount <= Decimal::ZERO {
        return Err(ValidationError::AmountNotPositive);
    }
    if amount.scale() > MAX_AMOUNT_SCALE {
        return Err(ValidationError::AmountScale);
    }
    if amount > MAX_BALANCE {
        return Err(ValidationError::AmountTooLarge);
    }
    Ok(amount)
}

pub fn parse_tx_id(raw: &str) -> Result<TxId, ValidationError> {
    if raw.is_empty() {
        return Err(ValidationError::Missing("tx_id"));
    }
    if raw.len() > MAX_TX_ID_LEN {
        return Err(ValidationError::TxIdTooLong);
    }
    if raw.starts_with(CANCEL_PREFIX) {
        return Err(ValidationError::TxIdReserved);
    }
    Ok(TxId::new(raw))
}
