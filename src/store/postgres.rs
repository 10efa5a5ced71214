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

//! PostgreSQL ledger backend.
//!
//! Every guard is pushed down into SQL: idempotency is `ON CONFLICT (tx_id)
//! DO NOTHING`, the non-negative invariant is the `WHERE` clause of the
//! balance `UPDATE`, and cycle exclusivity is a session-level advisory lock.

use super::{AdvisoryLock, Candidate, LedgerStore, LedgerTx};
use crate::account::Account;
use crate::base::{AccountId, OperationId, TxId};
use crate::config::DatabaseConfig;
use crate::error::{StoreError, StoreResult};
use crate::operation::{Operation, OperationDraft};
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::migrate::Migrator;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use tracing::{debug, warn};

/// Schema migrations embedded at build time.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// SQLSTATE raised when a balance leaves the `NUMERIC(20, 2)` range.
const NUMERIC_VALUE_OUT_OF_RANGE: &str = "22003";

const OPERATION_COLUMNS: &str = "id, tx_id, account_id, source, state, amount, \
     created_at, applied, canceled_at, cancel_note";

/// [`LedgerStore`] over a PostgreSQL connection pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Opens a pool sized and bounded by `config`.
    pub async fn connect(config: &DatabaseConfig) -> StoreResult<Self> {
        let options = config
            .url
            .parse::<PgConnectOptions>()?
            .options([(
                "statement_timeout",
                config.statement_timeout.as_millis().to_string(),
            )]);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .max_lifetime(config.max_lifetime)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await?;

        debug!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "database pool ready"
        );
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        PgStore { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies pending schema migrations.
    pub async fn migrate(&self) -> StoreResult<()> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    type Tx = PgTx;
    type Lock = PgAdvisoryLock;

    async fn begin(&self) -> StoreResult<PgTx> {
        Ok(PgTx {
            tx: self.pool.begin().await?,
        })
    }

    async fn account(&self, id: AccountId) -> StoreResult<Option<Account>> {
        let account =
            sqlx::query_as::<_, Account>("SELECT id, balance, updated_at FROM accounts WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(account)
    }

    async fn operation_by_tx_id(&self, tx_id: &TxId) -> StoreResult<Option<Operation>> {
        let query = format!("SELECT {OPERATION_COLUMNS} FROM operations WHERE tx_id = $1");
        let op = sqlx::query_as::<_, Operation>(&query)
            .bind(tx_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(op)
    }

    async fn reconciliation_candidates(&self, limit: usize) -> StoreResult<Vec<Candidate>> {
        let rows = sqlx::query_as::<_, (OperationId, TxId)>(
            r#"
            WITH ranked AS (
                SELECT id, tx_id,
                       ROW_NUMBER() OVER (ORDER BY created_at DESC, id DESC) AS rn
                  FROM operations
                 WHERE applied AND canceled_at IS NULL
            )
            SELECT id, tx_id
              FROM ranked
             WHERE rn % 2 = 1
             ORDER BY rn
             LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, tx_id)| Candidate { id, tx_id })
            .collect())
    }

    async fn try_advisory_lock(&self, key: i64) -> StoreResult<Option<PgAdvisoryLock>> {
        // the lock belongs to the session, so it has to stay on this connection
        let mut lock = PgAdvisoryLock {
            conn: Some(self.pool.acquire().await?),
            key,
        };
        // pinned before the query: an error or a dropped future detaches it
        if lock.call("SELECT pg_try_advisory_lock($1)").await? {
            return Ok(Some(lock));
        }
        // not granted, so the session holds nothing and may be pooled again
        drop(lock.conn.take());
        Ok(None)
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Unit of work over one pooled connection. Dropped uncommitted, sqlx
/// rolls it back.
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTx for PgTx {
    async fn ensure_account(&mut self, id: AccountId) -> StoreResult<()> {
        sqlx::query("INSERT INTO accounts (id, balance) VALUES ($1, 0) ON CONFLICT (id) DO NOTHING")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn insert_operation(
        &mut self,
        draft: &OperationDraft,
    ) -> StoreResult<Option<OperationId>> {
        let id = sqlx::query_scalar::<_, OperationId>(
            r#"
            INSERT INTO operations (tx_id, account_id, source, state, amount, applied, cancel_note)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (tx_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&draft.tx_id)
        .bind(draft.account_id)
        .bind(draft.source)
        .bind(draft.direction)
        .bind(draft.amount)
        .bind(draft.applied)
        .bind(draft.note)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn adjust_balance(
        &mut self,
        id: AccountId,
        delta: Decimal,
    ) -> StoreResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(
            r#"
            UPDATE accounts
               SET balance = balance + $1,
                   updated_at = now()
             WHERE id = $2
               AND balance + $1 >= 0
            RETURNING id, balance, updated_at
            "#,
        )
        .bind(delta)
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|err| {
            let overflow = err
                .as_database_error()
                .and_then(|db| db.code())
                .is_some_and(|code| code == NUMERIC_VALUE_OUT_OF_RANGE);
            if overflow {
                StoreError::BalanceOutOfRange
            } else {
                StoreError::Database(err)
            }
        })?;
        Ok(account)
    }

    async fn mark_applied(&mut self, id: OperationId) -> StoreResult<()> {
        sqlx::query("UPDATE operations SET applied = true WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn account(&mut self, id: AccountId) -> StoreResult<Option<Account>> {
        let account =
            sqlx::query_as::<_, Account>("SELECT id, balance, updated_at FROM accounts WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *self.tx)
                .await?;
        Ok(account)
    }

    async fn operation(&mut self, id: OperationId) -> StoreResult<Option<Operation>> {
        let query = format!("SELECT {OPERATION_COLUMNS} FROM operations WHERE id = $1 FOR UPDATE");
        let op = sqlx::query_as::<_, Operation>(&query)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(op)
    }

    async fn mark_canceled(&mut self, id: OperationId, note: &str) -> StoreResult<()> {
        sqlx::query("UPDATE operations SET canceled_at = now(), cancel_note = $2 WHERE id = $1")
            .bind(id)
            .bind(note)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn annotate(&mut self, id: OperationId, note: &str) -> StoreResult<()> {
        sqlx::query("UPDATE operations SET cancel_note = $2 WHERE id = $1")
            .bind(id)
            .bind(note)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit(self) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> StoreResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

/// Session-level advisory lock pinned to one pooled connection.
#[derive(Debug)]
pub struct PgAdvisoryLock {
    conn: Option<PoolConnection<Postgres>>,
    key: i64,
}

impl PgAdvisoryLock {
    async fn call(&mut self, sql: &'static str) -> StoreResult<bool> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(false);
        };
        Ok(sqlx::query_scalar::<_, bool>(sql)
            .bind(self.key)
            .fetch_one(&mut **conn)
            .await?)
    }
}

#[async_trait]
impl AdvisoryLock for PgAdvisoryLock {
    async fn release(mut self) -> StoreResult<()> {
        if self.conn.is_none() {
            return Ok(());
        }
        // the connection stays inside `self` until the unlock went through,
        // so a failed or abandoned release ends in `Drop`
        let released = self.call("SELECT pg_advisory_unlock($1)").await?;
        if !released {
            warn!(key = self.key, "advisory lock was not held at release");
        }
        drop(self.conn.take());
        Ok(())
    }
}

impl Drop for PgAdvisoryLock {
    fn drop(&mut self) {
        // Never hand a connection that may still own the lock back to the
        // pool. Closing the session makes the server drop the lock.
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }
}
