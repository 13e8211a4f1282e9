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

//! Statement reconciliation.
//!
//! A run walks the statement once. Each line is matched against the payment
//! holding the same `(provider, reference)`; the payment's own
//! "already reconciled" check makes repeated runs idempotent, so a second
//! run over an identical statement reports zero new matches.
//!
//! | Line                                   | Outcome             | Counted as  |
//! |----------------------------------------|---------------------|-------------|
//! | date outside the statement period      | `OutOfPeriod`       | unmatched   |
//! | no payment with the reference          | `Unmatched`         | unmatched   |
//! | payment not CONFIRMED                  | `NotSettled`        | unmatched   |
//! | payment already reconciled             | `AlreadyReconciled` | neither     |
//! | amount within tolerance                | `Matched`           | matched     |
//! | amount differs                         | `Discrepancy`       | discrepancy |

use crate::PaymentError;
use crate::base::{ExternalRef, PaymentId, Provider, RunId};
use crate::orchestrator::Orchestrator;
use crate::payment::{LineMatch, TransactionStatus};
use chrono::{DateTime, NaiveDate, Utc};
use csv::{ReaderBuilder, Trim};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// One row of a provider or bank statement.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StatementLine {
    pub reference: String,
    pub amount: Decimal,
    pub date: NaiveDate,
}

/// An uploaded statement for one provider and period.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Statement {
    pub provider: Provider,
    pub file_name: String,
    pub statement_date: NaiveDate,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub lines: Vec<StatementLine>,
}

impl Statement {
    /// Statement dated at the end of its period.
    pub fn new(
        provider: Provider,
        file_name: impl Into<String>,
        period_start: NaiveDate,
        period_end: NaiveDate,
        lines: Vec<StatementLine>,
    ) -> Result<Self, PaymentError> {
        let statement = Self {
            provider,
            file_name: file_name.into(),
            statement_date: period_end,
            period_start,
            period_end,
            lines,
        };
        statement.validate()?;
        Ok(statement)
    }

    /// Parses `reference,amount,date` rows (with header, dates as `YYYY-MM-DD`).
    ///
    /// # Errors
    ///
    /// [`PaymentError::Validation`] naming the first malformed row; a
    /// statement is never reconciled with rows silently dropped.
    pub fn from_csv<R: Read>(
        reader: R,
        provider: Provider,
        file_name: impl Into<String>,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<Self, PaymentError> {
        let mut rdr = ReaderBuilder::new()
            .trim(Trim::All)
            .has_headers(true)
            .from_reader(reader);

        let mut lines = Vec::new();
        for (index, result) in rdr.deserialize::<StatementLine>().enumerate() {
            let line = result.map_err(|e| {
                PaymentError::Validation(format!("statement row {}: {e}", index + 2))
            })?;
            lines.push(line);
        }
        Self::new(provider, file_name, period_start, period_end, lines)
    }

    pub fn validate(&self) -> Result<(), PaymentError> {
        if self.period_start > self.period_end {
            return Err(PaymentError::Validation(format!(
                "statement period starts {} after it ends {}",
                self.period_start, self.period_end
            )));
        }
        if let Some(line) = self.lines.iter().find(|l| l.reference.trim().is_empty()) {
            return Err(PaymentError::Validation(format!(
                "statement line dated {} has no reference",
                line.date
            )));
        }
        Ok(())
    }

    pub fn total_amount(&self) -> Decimal {
        self.lines.iter().map(|l| l.amount).sum()
    }

    fn in_period(&self, date: NaiveDate) -> bool {
        (self.period_start..=self.period_end).contains(&date)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LineOutcome {
    Matched,
    AlreadyReconciled,
    Unmatched,
    OutOfPeriod,
    NotSettled { status: TransactionStatus },
    Discrepancy { expected: Decimal, actual: Decimal },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineResult {
    pub reference: String,
    pub amount: Decimal,
    pub date: NaiveDate,
    pub payment_id: Option<PaymentId>,
    #[serde(flatten)]
    pub outcome: LineOutcome,
}

impl LineResult {
    /// The discrepancy as an error value, for reporting.
    pub fn discrepancy(&self) -> Option<PaymentError> {
        match self.outcome {
            LineOutcome::Discrepancy { expected, actual } => Some(PaymentError::ReconciliationDiscrepancy {
                reference: self.reference.clone(),
                expected,
                actual,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Every line matched or was already reconciled.
    Complete,
    /// At least one line needs staff review.
    Discrepancy,
}

/// Result of one pass over one statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationRun {
    pub id: RunId,
    pub provider: Provider,
    pub file_name: String,
    pub statement_date: NaiveDate,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub total_lines: usize,
    pub total_amount: Decimal,
    /// Lines newly matched by this run.
    pub matched_count: usize,
    pub unmatched_count: usize,
    pub discrepancy_count: usize,
    pub already_reconciled_count: usize,
    /// Sum of absolute differences over discrepancy lines.
    pub discrepancy_amount: Decimal,
    pub status: RunStatus,
    pub lines: Vec<LineResult>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

pub struct ReconciliationEngine {
    orchestrator: Arc<Orchestrator>,
    tolerance: Decimal,
    runs: DashMap<RunId, ReconciliationRun>,
    next_id: AtomicU64,
}

impl ReconciliationEngine {
    pub fn new(orchestrator: Arc<Orchestrator>, tolerance: Decimal) -> Self {
        Self {
            orchestrator,
            tolerance,
            runs: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn run(&self, statement: &Statement) -> Result<ReconciliationRun, PaymentError> {
        self.run_at(statement, Utc::now())
    }

    /// Reconciles `statement` and records the run.
    pub fn run_at(
        &self,
        statement: &Statement,
        now: DateTime<Utc>,
    ) -> Result<ReconciliationRun, PaymentError> {
        statement.validate()?;
        let id = RunId(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::info!(
            run_id = %id,
            provider = %statement.provider,
            file_name = %statement.file_name,
            lines = statement.lines.len(),
            "reconciliation started"
        );

        let lines: Vec<LineResult> = statement
            .lines
            .iter()
            .map(|line| self.reconcile_line(statement, line, now))
            .collect();

        let count = |f: fn(&LineOutcome) -> bool| lines.iter().filter(|l| f(&l.outcome)).count();
        let matched_count = count(|o| matches!(o, LineOutcome::Matched));
        let unmatched_count = count(|o| {
            matches!(
                o,
                LineOutcome::Unmatched | LineOutcome::OutOfPeriod | LineOutcome::NotSettled { .. }
            )
        });
        let discrepancy_count = count(|o| matches!(o, LineOutcome::Discrepancy { .. }));
        let already_reconciled_count = count(|o| matches!(o, LineOutcome::AlreadyReconciled));
        let discrepancy_amount: Decimal = lines
            .iter()
            .filter_map(|l| match l.outcome {
                LineOutcome::Discrepancy { expected, actual } => Some((actual - expected).abs()),
                _ => None,
            })
            .sum();

        let run = ReconciliationRun {
            id,
            provider: statement.provider,
            file_name: statement.file_name.clone(),
            statement_date: statement.statement_date,
            period_start: statement.period_start,
            period_end: statement.period_end,
            total_lines: lines.len(),
            total_amount: statement.total_amount(),
            matched_count,
            unmatched_count,
            discrepancy_count,
            already_reconciled_count,
            discrepancy_amount,
            status: if unmatched_count + discrepancy_count == 0 {
                RunStatus::Complete
            } else {
                RunStatus::Discrepancy
            },
            lines,
            started_at: now,
            completed_at: Utc::now().max(now),
        };
        tracing::info!(
            run_id = %id,
            matched = run.matched_count,
            unmatched = run.unmatched_count,
            discrepancies = run.discrepancy_count,
            discrepancy_amount = %run.discrepancy_amount,
            status = ?run.status,
            "reconciliation finished"
        );
        self.runs.insert(id, run.clone());
        Ok(run)
    }

    fn reconcile_line(&self, statement: &Statement, line: &StatementLine, now: DateTime<Utc>) -> LineResult {
        let mut result = LineResult {
            reference: line.reference.clone(),
            amount: line.amount,
            date: line.date,
            payment_id: None,
            outcome: LineOutcome::Unmatched,
        };
        if !statement.in_period(line.date) {
            result.outcome = LineOutcome::OutOfPeriod;
            return result;
        }
        let reference = ExternalRef::new(line.reference.trim());
        let Some(payment) = self.orchestrator.find_by_reference(statement.provider, &reference) else {
            return result;
        };
        result.payment_id = Some(payment.id());

        let status = payment.status();
        if status != TransactionStatus::Confirmed {
            result.outcome = if payment.is_reconciled() {
                LineOutcome::AlreadyReconciled
            } else {
                LineOutcome::NotSettled { status }
            };
            return result;
        }

        result.outcome = match payment.reconcile(line.amount, self.tolerance, now) {
            LineMatch::Matched => LineOutcome::Matched,
            LineMatch::AlreadyReconciled => LineOutcome::AlreadyReconciled,
            LineMatch::Discrepancy { expected } => LineOutcome::Discrepancy {
                expected,
                actual: line.amount,
            },
        };
        if let Some(error) = result.discrepancy() {
            tracing::warn!(payment_id = %payment.id(), error = %error, "reconciliation discrepancy");
        }
        result
    }

    pub fn get(&self, id: RunId) -> Option<ReconciliationRun> {
        self.runs.get(&id).map(|r| r.clone())
    }

    /// Run history, oldest first.
    pub fn runs(&self) -> Vec<ReconciliationRun> {
        let mut runs: Vec<_> = self.runs.iter().map(|r| r.value().clone()).collect();
        runs.sort_by_key(|r| r.id);
        runs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn parses_csv_statement() {
        let csv = "reference,amount,date\nX123, 5000 ,2025-03-14\nX124,1500.50,2025-03-15\n";
        let statement = Statement::from_csv(
            Cursor::new(csv),
            Provider::MtnMomo,
            "mtn-march.csv",
            date("2025-03-01"),
            date("2025-03-31"),
        )
        .unwrap();
        assert_eq!(statement.lines.len(), 2);
        assert_eq!(statement.lines[0].reference, "X123");
        assert_eq!(statement.total_amount(), Decimal::new(650050, 2));
        assert_eq!(statement.statement_date, date("2025-03-31"));
    }

    #[test]
    fn malformed_row_is_reported() {
        let csv = "reference,amount,date\nX123,5000,2025-03-14\nX124,lots,2025-03-15\n";
        let result = Statement::from_csv(
            Cursor::new(csv),
            Provider::MtnMomo,
            "bad.csv",
            date("2025-03-01"),
            date("2025-03-31"),
        );
        assert!(matches!(result, Err(PaymentError::Validation(m)) if m.contains("row 3")));
    }

    #[test]
    fn inverted_period_is_rejected() {
        let result = Statement::new(Provider::BankTransfer, "x.csv", date("2025-03-31"), date("2025-03-01"), vec![]);
        assert!(matches!(result, Err(PaymentError::Validation(_))));
    }

    #[test]
    fn discrepancy_line_reports_error() {
        let line = LineResult {
            reference: "X9".into(),
            amount: Decimal::new(4000, 0),
            date: date("2025-03-14"),
            payment_id: Some(PaymentId(1)),
            outcome: LineOutcome::Discrepancy {
                expected: Decimal::new(5000, 0),
                actual: Decimal::new(4000, 0),
            },
        };
        assert_eq!(
            line.discrepancy().map(|e| e.to_string()),
            Some("statement line X9 shows 4000, payment recorded 5000".to_string())
        );
    }
}
