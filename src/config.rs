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

//! Command line and environment configuration.
//!
//! Every setting can come from a flag or from the environment (a `.env` file
//! is loaded first by the binary). The parsed [`Cli`] is validated once at
//! startup and its parts are handed to the components that need them.

use crate::scheduler::SchedulerSettings;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Balance ledger service
///
/// Records deposits and withdrawals against accounts, refuses anything that
/// would drive a balance negative, and periodically reverses a sample of
/// applied operations with compensating entries.
#[derive(Parser, Debug)]
#[command(name = "balance-ledger", version)]
#[command(about = "Balance ledger with scheduled compensating reconciliation", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub log: LogArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the HTTP API and run the cancellation scheduler
    Serve(ServeArgs),
    /// Apply database migrations and exit
    Migrate,
    /// Push a CSV of operations through the engine and print balances
    ///
    /// Expected format: account_id,source,state,amount,tx_id
    Replay {
        #[arg(value_name = "FILE")]
        input: PathBuf,
    },
    /// Run exactly one cancellation cycle and print its summary
    Reconcile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreKind {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Args, Debug)]
pub struct StoreArgs {
    /// Ledger backend
    #[arg(long = "store", env = "LEDGER_STORE", value_enum, default_value_t = StoreKind::Postgres, global = true)]
    pub kind: StoreKind,

    #[arg(long, env = "DATABASE_URL", hide_env_values = true, global = true)]
    pub database_url: Option<String>,

    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value_t = 25, global = true)]
    pub db_max_connections: u32,

    #[arg(long, env = "DB_MIN_CONNECTIONS", default_value_t = 5, global = true)]
    pub db_min_connections: u32,

    #[arg(long, env = "DB_MAX_LIFETIME_SECS", default_value_t = 300, global = true)]
    pub db_max_lifetime_secs: u64,

    #[arg(long, env = "DB_ACQUIRE_TIMEOUT_SECS", default_value_t = 5, global = true)]
    pub db_acquire_timeout_secs: u64,

    /// Server-side bound on every statement
    #[arg(long, env = "DB_STATEMENT_TIMEOUT_MS", default_value_t = 5000, global = true)]
    pub db_statement_timeout_ms: u64,
}

#[derive(Args, Debug)]
pub struct LogArgs {
    /// Default filter, overridden by RUST_LOG
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json, global = true)]
    pub log_format: LogFormat,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:8080")]
    pub http_addr: SocketAddr,

    /// Minutes between cancellation cycles
    #[arg(long, env = "CANCEL_PERIOD_MIN", default_value_t = 5)]
    pub cancel_period_min: u64,

    #[arg(long, env = "CANCEL_SCHEDULER_ENABLED", default_value_t = true, action = ArgAction::Set)]
    pub cancel_scheduler_enabled: bool,

    /// Apply migrations before serving
    #[arg(long = "migrate", env = "RUN_MIGRATIONS")]
    pub run_migrations: bool,
}

/// Connection settings for the PostgreSQL backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub max_lifetime: Duration,
    pub acquire_timeout: Duration,
    pub statement_timeout: Duration,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("DATABASE_URL is required for the postgres store")]
    MissingDatabaseUrl,

    #[error("DB_MAX_CONNECTIONS must be greater than zero")]
    ZeroConnections,

    #[error("DB_MIN_CONNECTIONS ({min}) exceeds DB_MAX_CONNECTIONS ({max})")]
    PoolBounds { min: u32, max: u32 },

    #[error("CANCEL_PERIOD_MIN must be greater than zero")]
    ZeroPeriod,
}

impl Cli {
    /// Checks settings that clap cannot express on its own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.kind == StoreKind::Postgres {
            self.store.database()?;
        }
        if let Command::Serve(serve) = &self.command {
            if serve.cancel_period_min == 0 {
                return Err(ConfigError::ZeroPeriod);
            }
        }
        Ok(())
    }
}

impl StoreArgs {
    pub fn database(&self) -> Result<DatabaseConfig, ConfigError> {
        let url = self
            .database_url
            .clone()
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::MissingDatabaseUrl)?;
        if self.db_max_connections == 0 {
            return Err(ConfigError::ZeroConnections);
        }
        if self.db_min_connections > self.db_max_connections {
            return Err(ConfigError::PoolBounds {
                min: self.db_min_connections,
                max: self.db_max_connections,
            });
        }

        Ok(DatabaseConfig {
            url,
            max_connections: self.db_max_connections,
            min_connections: self.db_min_connections,
            max_lifetime: Duration::from_secs(self.db_max_lifetime_secs),
            acquire_timeout: Duration::from_secs(self.db_acquire_timeout_secs),
            statement_timeout: Duration::from_millis(self.db_statement_timeout_ms),
        })
    }
}

impl ServeArgs {
    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            period: Duration::from_secs(self.cancel_period_min * 60),
            ..SchedulerSettings::default()
        }
    }
}
