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

use anyhow::{Context, Result};
use balance_ledger::api::{self, validation::ProcessRequest};
use balance_ledger::config::{Cli, Command, ServeArgs, StoreKind};
use balance_ledger::scheduler::IntervalTicker;
use balance_ledger::{
    AccountId, CancelScheduler, CycleOutcome, Engine, LedgerError, LedgerStore, MemoryStore,
    PgStore, ProcessOutcome, SchedulerSettings, telemetry,
};
use chrono::{DateTime, Utc};
use clap::Parser;
use csv::{ReaderBuilder, Trim, Writer};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // a missing .env is fine
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    telemetry::init(&cli.log)?;
    cli.validate()?;

    match cli.store.kind {
        StoreKind::Memory => run(Arc::new(MemoryStore::new()), cli.command).await,
        StoreKind::Postgres => {
            let config = cli.store.database()?;
            let store = PgStore::connect(&config)
                .await
                .context("failed to connect to database")?;

            let migrate = match &cli.command {
                Command::Migrate => true,
                Command::Serve(args) => args.run_migrations,
                _ => false,
            };
            if migrate {
                store.migrate().await.context("failed to apply migrations")?;
                info!("migrations applied");
            }
            run(Arc::new(store), cli.command).await
        }
    }
}

async fn run<S: LedgerStore>(store: Arc<S>, command: Command) -> Result<()> {
    match command {
        Command::Serve(args) => serve(store, args).await,
        Command::Migrate => Ok(()),
        Command::Replay { input } => {
            let file = File::open(&input)
                .with_context(|| format!("failed to open '{}'", input.display()))?;
            let engine = Engine::new(store);
            let touched = process_operations(&engine, BufReader::new(file)).await?;
            write_balances(&engine, &touched, std::io::stdout()).await?;
            Ok(())
        }
        Command::Reconcile => {
            let scheduler = CancelScheduler::new(store, SchedulerSettings::default());
            match scheduler.run_cycle().await {
                CycleOutcome::Completed(summary) => {
                    println!("{}", serde_json::to_string(&summary)?);
                    Ok(())
                }
                CycleOutcome::Skipped => {
                    warn!("another instance holds the reconciliation lock");
                    Ok(())
                }
                CycleOutcome::Failed(err) => Err(err).context("reconciliation cycle failed"),
            }
        }
    }
}

async fn serve<S: LedgerStore>(store: Arc<S>, args: ServeArgs) -> Result<()> {
    let shutdown = CancellationToken::new();

    let scheduler = if args.cancel_scheduler_enabled {
        let settings = args.scheduler_settings();
        let ticker = IntervalTicker::new(settings.period);
        Some(CancelScheduler::new(Arc::clone(&store), settings).spawn(ticker, shutdown.clone()))
    } else {
        info!("cancel scheduler disabled");
        None
    };

    let engine = Arc::new(Engine::new(store));
    let listener = TcpListener::bind(args.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", args.http_addr))?;
    info!(addr = %args.http_addr, "ledger API listening");

    let stop = shutdown.clone();
    axum::serve(listener, api::router(engine))
        .with_graceful_shutdown(async move {
            wait_for_signal().await;
            info!("shutting down");
            stop.cancel();
        })
        .await
        .context("server error")?;

    shutdown.cancel();
    if let Some(handle) = scheduler {
        handle.await.context("cancel scheduler task failed")?;
    }
    Ok(())
}

async fn wait_for_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

/// Streams operations from a CSV reader through the engine.
///
/// Rows are validated with the same rules as the HTTP API. Malformed rows,
/// duplicates and rejections are logged and skipped; a storage failure stops
/// the replay.
///
/// # CSV Format
///
/// ```csv
/// account_id,source,state,amount,tx_id
/// 3f1c6a1e-8a8f-4c55-9d1e-2b8c9f0a7b11,payment,deposit,50.00,t1
/// 3f1c6a1e-8a8f-4c55-9d1e-2b8c9f0a7b11,game,withdraw,30.00,t2
/// ```
///
/// Returns the accounts that at least one valid row referred to.
async fn process_operations<S: LedgerStore, R: Read>(
    engine: &Engine<S>,
    reader: R,
) -> Result<BTreeSet<AccountId>> {
    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .has_headers(true)
        .from_reader(reader);

    let mut touched = BTreeSet::new();
    for (line, result) in rdr.deserialize::<ProcessRequest>().enumerate() {
        let op = match result.map_err(anyhow::Error::from).and_then(|request| {
            request.validate().map_err(anyhow::Error::from)
        }) {
            Ok(op) => op,
            Err(err) => {
                warn!(line = line + 2, error = %err, "skipping invalid row");
                continue;
            }
        };

        touched.insert(op.account_id);
        let tx_id = op.tx_id.clone();
        match engine.process(op).await.and_then(ProcessOutcome::into_result) {
            Ok(account) => debug!(%tx_id, balance = %account.balance, "applied"),
            Err(LedgerError::Storage(err)) => {
                return Err(err).with_context(|| format!("storage failure at tx {tx_id}"));
            }
            Err(err) => info!(%tx_id, error = %err, "skipping operation"),
        }
    }

    Ok(touched)
}

#[derive(Debug, Serialize)]
struct BalanceRow {
    account_id: AccountId,
    balance: Decimal,
    updated_at: DateTime<Utc>,
}

/// Writes the balances of `accounts` as CSV.
///
/// Columns: `account_id, balance, updated_at`
async fn write_balances<S: LedgerStore, W: Write>(
    engine: &Engine<S>,
    accounts: &BTreeSet<AccountId>,
    writer: W,
) -> Result<()> {
    let mut rows = Vec::with_capacity(accounts.len());
    for &id in accounts {
        let account = engine.balance(id).await?;
        rows.push(BalanceRow {
            account_id: account.id,
            balance: account.balance,
            updated_at: account.updated_at,
        });
    }

    let mut wtr = Writer::from_writer(writer);
    for row in &rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}
