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

//! HTTP API.
//!
//! # Endpoints
//!
//! ```bash
//! # Process an operation
//! curl -X POST http://localhost:8080/v1/operations \
//!   -H "Content-Type: application/json" \
//!   -d '{"account_id": "3f1c6a1e-8a8f-4c55-9d1e-2b8c9f0a7b11", "source": "game",
//!        "state": "deposit", "amount": "50.00", "tx_id": "t1"}'
//!
//! # Current balance
//! curl http://localhost:8080/v1/accounts/3f1c6a1e-8a8f-4c55-9d1e-2b8c9f0a7b11/balance
//!
//! # Audit row of an operation
//! curl http://localhost:8080/v1/operations/t1
//!
//! # Store connectivity
//! curl http://localhost:8080/health
//! ```
//!
//! A processed request always answers `200` with a status of `OK`,
//! `ALREADY_PROCESSED` or `REJECTED_NEGATIVE`; those are outcomes, not errors.

pub mod validation;

use crate::base::{AccountId, TxId};
use crate::engine::{Engine, Receipt};
use crate::error::LedgerError;
use crate::operation::Operation;
use crate::store::LedgerStore;
use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};
use validation::{ProcessRequest, ValidationError, parse_account_id};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub account_id: AccountId,
    pub balance: Decimal,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Shared handler state.
pub struct AppState<S> {
    pub engine: Arc<Engine<S>>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        AppState {
            engine: Arc::clone(&self.engine),
        }
    }
}

/// Error half of every handler.
#[derive(Debug)]
pub enum ApiError {
    InvalidArgument(String),
    NotFound(String),
    /// Details are logged, never returned.
    Internal,
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::InvalidArgument(err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::InvalidArgument(rejection.body_text())
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match &err {
            LedgerError::AccountNotFound(_) => ApiError::NotFound("account not found".into()),
            LedgerError::OperationNotFound(_) => ApiError::NotFound("operation not found".into()),
            LedgerError::InvalidAmount => ApiError::InvalidArgument(err.to_string()),
            _ => {
                error!(error = %err, "request failed");
                ApiError::Internal
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::InvalidArgument(message) => {
                (StatusCode::BAD_REQUEST, "INVALID_ARGUMENT", message)
            }
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, "NOT_FOUND", message),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL",
                "internal server error".to_string(),
            ),
        };

        (
            status,
            Json(ErrorResponse {
                error: message,
                code,
            }),
        )
            .into_response()
    }
}

/// POST /v1/operations
async fn process_operation<S: LedgerStore>(
    State(state): State<AppState<S>>,
    body: Result<Json<ProcessRequest>, JsonRejection>,
) -> Result<Json<Receipt>, ApiError> {
    let Json(request) = body?;
    let op = request.validate()?;
    let tx_id = op.tx_id.clone();

    let outcome = state.engine.process(op).await?;
    Ok(Json(outcome.receipt(tx_id)))
}

/// GET /v1/accounts/{account_id}/balance
async fn get_balance<S: LedgerStore>(
    State(state): State<AppState<S>>,
    Path(account_id): Path<String>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let account_id = parse_account_id(&account_id)?;
    let account = state.engine.balance(account_id).await?;

    Ok(Json(BalanceResponse {
        account_id: account.id,
        balance: account.balance,
        updated_at: account.updated_at,
    }))
}

/// GET /v1/operations/{tx_id}
async fn get_operation<S: LedgerStore>(
    State(state): State<AppState<S>>,
    Path(tx_id): Path<String>,
) -> Result<Json<Operation>, ApiError> {
    let op = state.engine.operation(&TxId::new(tx_id)).await?;
    Ok(Json(op))
}

/// GET /health
async fn health<S: LedgerStore>(State(state): State<AppState<S>>) -> Response {
    let check = tokio::time::timeout(HEALTH_TIMEOUT, state.engine.store().health_check()).await;
    match check {
        Ok(Ok(())) => (StatusCode::OK, Json(HealthResponse { status: "ok" })).into_response(),
        Ok(Err(err)) => {
            warn!(error = %err, "health check failed");
            unavailable()
        }
        Err(_) => {
            warn!("health check timed out");
            unavailable()
        }
    }
}

fn unavailable() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(HealthResponse {
            status: "unavailable",
        }),
    )
        .into_response()
}

pub fn router<S: LedgerStore>(engine: Arc<Engine<S>>) -> Router {
    Router::new()
        .route("/v1/operations", post(process_operation::<S>))
        .route("/v1/operations/{tx_id}", get(get_operation::<S>))
        .route("/v1/accounts/{account_id}/balance", get(get_balance::<S>))
        .route("/health", get(health::<S>))
        .with_state(AppState { engine })
}
