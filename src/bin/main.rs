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
use clap::{Args, Parser, Subcommand};
use csv::Writer;
use payment_settlement_rs::api::{self, AppState};
use payment_settlement_rs::observability::{LogFormat, init_logging};
use payment_settlement_rs::sweeper::TimeoutSweeper;
use payment_settlement_rs::{AdapterRegistry, Config, Orchestrator};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Payment settlement service
///
/// Runs the settlement API, or uploads a provider statement to a running
/// instance and prints the per-line reconciliation outcome as CSV.
#[derive(Parser, Debug)]
#[command(name = "payment-settlement-rs")]
#[command(about = "Settles mobile-money and bank-transfer payments", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API (configuration from the environment and `.env`)
    Serve(ServeArgs),
    /// Reconcile a statement CSV against a running instance
    Reconcile(ReconcileArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Overrides SETTLEMENT_HOST
    #[arg(long)]
    host: Option<String>,
    /// Overrides SETTLEMENT_PORT
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Args, Debug)]
struct ReconcileArgs {
    /// Statement file with columns: reference,amount,date
    #[arg(value_name = "FILE")]
    input: PathBuf,
    /// MTN, AIRTEL or BANK
    #[arg(long)]
    provider: String,
    /// First day of the statement period (YYYY-MM-DD)
    #[arg(long)]
    period_start: String,
    /// Last day of the statement period (YYYY-MM-DD)
    #[arg(long)]
    period_end: String,
    /// Base URL of the settlement API
    #[arg(long, default_value = "http://127.0.0.1:3000")]
    server: String,
}

fn main() {
    let cli = Cli::parse();
    init_logging(LogFormat::from_env());

    let result = match cli.command {
        Command::Serve(args) => serve(args),
        Command::Reconcile(args) => reconcile(args, std::io::stdout()),
    };
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn serve(args: ServeArgs) -> Result<(), Box<dyn Error>> {
    let mut config = Config::from_env()?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    // Blocking HTTP clients must be built outside the async runtime.
    let adapters = AdapterRegistry::from_config(&config)?;
    if adapters.providers().is_empty() {
        tracing::warn!("no payment provider configured; every payment will be rejected");
    }
    let orchestrator = Arc::new(Orchestrator::new(adapters, &config));
    let sweeper = TimeoutSweeper::spawn(Arc::clone(&orchestrator), config.sweep_interval)?;
    let state = AppState::new(orchestrator, config.reconciliation_tolerance);

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let addr = config.addr();
    let app = api::router(state.clone());
    runtime.block_on(async move {
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, environment = %config.environment, "settlement API listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                tokio::signal::ctrl_c().await.ok();
                tracing::info!("shutdown requested");
            })
            .await
    })?;

    // The runtime goes first so the adapters are released outside it.
    drop(runtime);
    sweeper.stop();
    drop(state);
    Ok(())
}

/// Subset of a reconciliation run the CLI reports.
#[derive(Debug, Deserialize)]
struct RunResponse {
    id: u64,
    status: String,
    total_lines: usize,
    matched_count: usize,
    unmatched_count: usize,
    discrepancy_count: usize,
    discrepancy_amount: Decimal,
    lines: Vec<LineRow>,
}

/// One output row: `reference,amount,date,payment_id,outcome,expected,actual`.
#[derive(Debug, Deserialize, Serialize)]
struct LineRow {
    reference: String,
    amount: Decimal,
    date: String,
    payment_id: Option<u64>,
    outcome: String,
    expected: Option<Decimal>,
    actual: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

fn reconcile<W: Write>(args: ReconcileArgs, writer: W) -> Result<(), Box<dyn Error>> {
    let body = fs::read(&args.input)
        .map_err(|e| format!("cannot open '{}': {}", args.input.display(), e))?;
    let file_name = args
        .input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "statement.csv".to_string());

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()?;
    let response = client
        .post(format!("{}/reconciliations/csv", args.server.trim_end_matches('/')))
        .query(&[
            ("provider", args.provider.as_str()),
            ("file_name", file_name.as_str()),
            ("period_start", args.period_start.as_str()),
            ("period_end", args.period_end.as_str()),
        ])
        .header("content-type", "text/csv")
        .body(body)
        .send()?;

    if !response.status().is_success() {
        let status = response.status();
        let message = response
            .json::<ErrorBody>()
            .map(|b| b.error)
            .unwrap_or_else(|_| status.to_string());
        return Err(format!("reconciliation rejected ({status}): {message}").into());
    }
    let run: RunResponse = response.json()?;
    write_lines(&run.lines, writer)?;

    tracing::info!(
        run_id = run.id,
        status = %run.status,
        lines = run.total_lines,
        matched = run.matched_count,
        unmatched = run.unmatched_count,
        discrepancies = run.discrepancy_count,
        discrepancy_amount = %run.discrepancy_amount,
        "reconciliation run recorded"
    );
    Ok(())
}

/// Writes line outcomes as CSV.
fn write_lines<W: Write>(lines: &[LineRow], writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);
    for line in lines {
        wtr.serialize(line)?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_run_response() {
        let json = r#"{
            "id": 1, "status": "DISCREPANCY", "total_lines": 2,
            "matched_count": 1, "unmatched_count": 0, "discrepancy_count": 1,
            "discrepancy_amount": "500",
            "lines": [
                {"reference": "X123", "amount": "5000", "date": "2025-03-14",
                 "payment_id": 1, "outcome": "MATCHED"},
                {"reference": "X124", "amount": "4500", "date": "2025-03-14",
                 "payment_id": 2, "outcome": "DISCREPANCY",
                 "expected": "5000", "actual": "4500"}
            ]
        }"#;
        let run: RunResponse = serde_json::from_str(json).unwrap();
        assert_eq!(run.lines.len(), 2);
        assert_eq!(run.lines[0].expected, None);
        assert_eq!(run.lines[1].expected, Some(dec!(5000)));
        assert_eq!(run.discrepancy_amount, dec!(500));
    }

    #[test]
    fn writes_line_csv() {
        let lines = vec![LineRow {
            reference: "X123".into(),
            amount: dec!(5000),
            date: "2025-03-14".into(),
            payment_id: Some(1),
            outcome: "MATCHED".into(),
            expected: None,
            actual: None,
        }];
        let mut output = Vec::new();
        write_lines(&lines, &mut output).unwrap();
        let output = String::from_utf8(output).unwrap();
        assert!(output.starts_with("reference,amount,date,payment_id,outcome,expected,actual\n"));
        assert!(output.contains("X123,5000,2025-03-14,1,MATCHED,,"));
    }
}
