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

//! Payment records and their status graph.
//!
//! ```text
//! INITIATED ─► SENT_TO_GATEWAY ─► GATEWAY_ACCEPTED ─► AWAITING_CONFIRMATION ─┬─► CONFIRMED
//!                     │                                                      ├─► TIMEOUT
//!                     └─────────────────► FAILED ◄───────────────────────────┘
//! ```
//!
//! All mutation happens under the payment's own mutex. The audit entry for a
//! transition is pushed while the lock is held and before the status field
//! changes, so a reader never sees a status without its log entry.
//!
//! # Example
//!
//! ```
//! use payment_settlement_rs::TransactionStatus;
//!
//! assert!(TransactionStatus::Initiated.can_transition_to(TransactionStatus::SentToGateway));
//! assert!(!TransactionStatus::Confirmed.can_transition_to(TransactionStatus::Failed));
//! ```

use crate::PaymentError;
use crate::base::{Currency, ExternalRef, IdempotencyKey, Payable, PaymentId, PaymentMethod, Provider};
use crate::transaction::{LogEntry, Payload, PaymentTransaction, RequestKind};
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Initiated,
    SentToGateway,
    GatewayAccepted,
    AwaitingConfirmation,
    Confirmed,
    Timeout,
    Failed,
}

impl TransactionStatus {
    /// CONFIRMED, FAILED and TIMEOUT accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Timeout | Self::Failed)
    }

    /// Whether `next` is an edge of the status graph.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Initiated, SentToGateway)
                | (SentToGateway, GatewayAccepted)
                | (SentToGateway, Failed)
                | (GatewayAccepted, AwaitingConfirmation)
                | (AwaitingConfirmation, Confirmed)
                | (AwaitingConfirmation, Timeout)
                | (AwaitingConfirmation, Failed)
        )
    }

    /// Distance from INITIATED along the graph; terminal states share the top rank.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Initiated => 0,
            Self::SentToGateway => 1,
            Self::GatewayAccepted => 2,
            Self::AwaitingConfirmation => 3,
            Self::Confirmed | Self::Timeout | Self::Failed => 4,
        }
    }
}

/// Payment creation request from the order/subscription collaborator.
#[derive(Debug, Clone, Deserialize)]
pub struct NewPayment {
    pub idempotency_key: IdempotencyKey,
    pub amount: Decimal,
    pub currency: Currency,
    pub provider: Provider,
    pub method: PaymentMethod,
    pub payable: Payable,
    /// MSISDN for mobile money, account number for bank transfer, e-mail for card.
    pub payer: String,
    #[serde(default)]
    pub notes: Option<String>,
}

impl NewPayment {
    const MAX_AMOUNT_SCALE: u32 = 2;

    /// Checks the request and normalises the payer identifier.
    pub fn validate(mut self) -> Result<Self, PaymentError> {
        if self.idempotency_key.as_str().trim().is_empty() {
            return Err(PaymentError::Validation("idempotency key is required".into()));
        }
        if self.amount <= Decimal::ZERO {
            return Err(PaymentError::Validation("amount must be positive".into()));
        }
        if self.amount.normalize().scale() > Self::MAX_AMOUNT_SCALE {
            return Err(PaymentError::Validation(
                "amount has more than 2 decimal places".into(),
            ));
        }
        if self.payable.reference().trim().is_empty() {
            return Err(PaymentError::Validation("payable reference is required".into()));
        }
        if !self.method.supported_by(self.provider) {
            return Err(PaymentError::Validation(format!(
                "{:?} is not supported by {}",
                self.method, self.provider
            )));
        }

        let payer: String = self.payer.chars().filter(|c| !c.is_whitespace()).collect();
        match self.method {
            PaymentMethod::MobileMoney => {
                let digits = payer.strip_prefix('+').unwrap_or(&payer);
                if !(9..=15).contains(&digits.len()) || !digits.chars().all(|c| c.is_ascii_digit()) {
                    return Err(PaymentError::Validation("invalid phone number".into()));
                }
                self.payer = digits.to_string();
            }
            PaymentMethod::BankTransfer => {
                if payer.is_empty() {
                    return Err(PaymentError::Validation(
                        "account number is required for bank transfer".into(),
                    ));
                }
                self.payer = payer;
            }
            PaymentMethod::Card => {
                if !payer.contains('@') {
                    return Err(PaymentError::Validation(
                        "customer e-mail is required for card payments".into(),
                    ));
                }
                self.payer = payer;
            }
        }
        Ok(self)
    }
}

/// Point-in-time copy of a payment.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PaymentSnapshot {
    pub id: PaymentId,
    pub idempotency_key: IdempotencyKey,
    pub payable: Payable,
    pub amount: Decimal,
    pub currency: Currency,
    pub provider: Provider,
    pub method: PaymentMethod,
    pub payer: String,
    pub notes: Option<String>,
    pub status: TransactionStatus,
    pub external_ref: Option<ExternalRef>,
    pub invoice_number: Option<String>,
    pub reconciled: bool,
    pub reconciled_at: Option<DateTime<Utc>>,
    pub requires_review: bool,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A confirmation or status report from a webhook or a polling query.
#[derive(Debug, Clone)]
pub struct Signal {
    pub kind: RequestKind,
    /// `Confirmed` or `Failed`; `None` while the provider still reports pending.
    pub reported: Option<TransactionStatus>,
    /// Provider delivery identifier used for duplicate suppression.
    pub delivery_id: Option<String>,
    pub reason: Option<String>,
    pub inbound: Option<Payload>,
    pub latency: Option<Duration>,
}

/// Result of applying a [`Signal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalOutcome {
    /// The payment moved to the contained terminal status.
    Transitioned(TransactionStatus),
    /// Provider still reports the payment as pending.
    StillPending,
    /// Already applied; nothing changed.
    Duplicate,
    /// Conflicts with the terminal status already recorded; flagged for staff.
    ReviewRequired(TransactionStatus),
}

/// Outcome of checking a statement line against a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineMatch {
    AlreadyReconciled,
    Matched,
    Discrepancy { expected: Decimal },
}

#[derive(Debug)]
struct PaymentData {
    id: PaymentId,
    request: NewPayment,
    status: TransactionStatus,
    external_ref: Option<ExternalRef>,
    invoice_number: Option<String>,
    reconciled: bool,
    reconciled_at: Option<DateTime<Utc>>,
    requires_review: bool,
    created_at: DateTime<Utc>,
    processing_started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    log: Vec<PaymentTransaction>,
    /// Deliveries already applied, keyed with the status they reported;
    /// providers reuse one transaction id across pending and final callbacks.
    deliveries: HashSet<(String, Option<TransactionStatus>)>,
}

impl PaymentData {
    fn assert_invariants(&self) {
        debug_assert!(
            self.request.amount > Decimal::ZERO,
            "Invariant violated: payment amount not positive: {}",
            self.request.amount
        );
        debug_assert!(
            self.status == TransactionStatus::Initiated || !self.log.is_empty(),
            "Invariant violated: status {:?} without audit entry",
            self.status
        );
        debug_assert!(
            !self.status.is_terminal() || self.completed_at.is_some(),
            "Invariant violated: terminal status without completion time"
        );
    }

    fn append(&mut self, entry: LogEntry, status: TransactionStatus, now: DateTime<Utc>) {
        let sequence = u32::try_from(self.log.len() + 1).unwrap_or(u32::MAX);
        self.log.push(PaymentTransaction::record(
            entry,
            sequence,
            self.id,
            self.request.provider,
            status,
            now,
        ));
    }

    /// Records `entry` and then moves to `to`, if `to` is an edge from `expected`.
    fn transition(
        &mut self,
        expected: TransactionStatus,
        to: TransactionStatus,
        entry: LogEntry,
        now: DateTime<Utc>,
    ) -> Result<(), PaymentError> {
        if self.status != expected {
            if self.status.is_terminal() {
                return Err(PaymentError::PaymentTerminal(self.status));
            }
            return Err(PaymentError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        if !self.status.can_transition_to(to) {
            return Err(PaymentError::InvalidTransition {
                from: self.status,
                to,
            });
        }

        self.append(entry, to, now);
        self.status = to;
        match to {
            TransactionStatus::SentToGateway => self.processing_started_at = Some(now),
            s if s.is_terminal() => self.completed_at = Some(now),
            _ => {}
        }
        self.assert_invariants();
        Ok(())
    }

    fn snapshot(&self) -> PaymentSnapshot {
        PaymentSnapshot {
            id: self.id,
            idempotency_key: self.request.idempotency_key.clone(),
            payable: self.request.payable.clone(),
            amount: self.request.amount,
            currency: self.request.currency.clone(),
            provider: self.request.provider,
            method: self.request.method,
            payer: self.request.payer.clone(),
            notes: self.request.notes.clone(),
            status: self.status,
            external_ref: self.external_ref.clone(),
            invoice_number: self.invoice_number.clone(),
            reconciled: self.reconciled,
            reconciled_at: self.reconciled_at,
            requires_review: self.requires_review,
            created_at: self.created_at,
            processing_started_at: self.processing_started_at,
            completed_at: self.completed_at,
        }
    }
}

/// A payment record guarded by its own mutex.
#[derive(Debug)]
pub struct Payment {
    inner: Mutex<PaymentData>,
    invoice_generated: AtomicBool,
}

impl Payment {
    /// Creates a payment in `INITIATED`. The request must already be validated.
    pub fn new(id: PaymentId, request: NewPayment, now: DateTime<Utc>) -> Self {
        Self {
            inner: Mutex::new(PaymentData {
                id,
                request,
                status: TransactionStatus::Initiated,
                external_ref: None,
                invoice_number: None,
                reconciled: false,
                reconciled_at: None,
                requires_review: false,
                created_at: now,
                processing_started_at: None,
                completed_at: None,
                log: Vec::new(),
                deliveries: HashSet::new(),
            }),
            invoice_generated: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> PaymentId {
        self.inner.lock().id
    }

    pub fn status(&self) -> TransactionStatus {
        self.inner.lock().status
    }

    pub fn provider(&self) -> Provider {
        self.inner.lock().request.provider
    }

    pub fn amount(&self) -> Decimal {
        self.inner.lock().request.amount
    }

    pub fn external_ref(&self) -> Option<ExternalRef> {
        self.inner.lock().external_ref.clone()
    }

    pub fn is_reconciled(&self) -> bool {
        self.inner.lock().reconciled
    }

    pub fn requires_review(&self) -> bool {
        self.inner.lock().requires_review
    }

    pub fn snapshot(&self) -> PaymentSnapshot {
        self.inner.lock().snapshot()
    }

    /// Copy of the audit log, oldest first.
    pub fn transactions(&self) -> Vec<PaymentTransaction> {
        self.inner.lock().log.clone()
    }

    /// Compare-and-swap transition from `expected` to `to`.
    pub fn transition(
        &self,
        expected: TransactionStatus,
        to: TransactionStatus,
        entry: LogEntry,
        now: DateTime<Utc>,
    ) -> Result<PaymentSnapshot, PaymentError> {
        let mut data = self.inner.lock();
        data.transition(expected, to, entry, now)?;
        Ok(data.snapshot())
    }

    /// `SENT_TO_GATEWAY → GATEWAY_ACCEPTED`, recording the provider reference.
    pub fn accept(
        &self,
        external_ref: ExternalRef,
        entry: LogEntry,
        now: DateTime<Utc>,
    ) -> Result<PaymentSnapshot, PaymentError> {
        let mut data = self.inner.lock();
        data.transition(
            TransactionStatus::SentToGateway,
            TransactionStatus::GatewayAccepted,
            entry,
            now,
        )?;
        data.external_ref = Some(external_ref);
        Ok(data.snapshot())
    }

    /// Applies a webhook or polling report under the payment lock.
    ///
    /// # Errors
    ///
    /// [`PaymentError::NotAwaitingConfirmation`] when the report arrives before
    /// the gateway acceptance was recorded.
    pub fn apply_signal(
        &self,
        signal: Signal,
        now: DateTime<Utc>,
    ) -> Result<SignalOutcome, PaymentError> {
        let mut data = self.inner.lock();

        let delivery = signal.delivery_id.clone().map(|id| (id, signal.reported));
        if let Some(delivery) = &delivery {
            if data.deliveries.contains(delivery) {
                return Ok(SignalOutcome::Duplicate);
            }
        }

        let mut entry = LogEntry::new(signal.kind).inbound(signal.inbound);
        if let Some(latency) = signal.latency {
            entry = entry.latency(latency);
        }

        let outcome = match (data.status, signal.reported) {
            (TransactionStatus::AwaitingConfirmation, Some(reported)) => {
                if reported == TransactionStatus::Failed {
                    entry = entry.error(
                        "GATEWAY_REJECTED",
                        signal.reason.unwrap_or_else(|| "provider reported failure".into()),
                    );
                }
                data.transition(TransactionStatus::AwaitingConfirmation, reported, entry, now)?;
                SignalOutcome::Transitioned(reported)
            }
            (TransactionStatus::AwaitingConfirmation, None) => {
                data.append(entry, TransactionStatus::AwaitingConfirmation, now);
                SignalOutcome::StillPending
            }
            (current, reported) if current.is_terminal() => match reported {
                Some(reported) if reported != current => {
                    let code = if current == TransactionStatus::Timeout
                        && reported == TransactionStatus::Confirmed
                    {
                        "LATE_CONFIRMATION"
                    } else {
                        "CONFLICTING_SIGNAL"
                    };
                    entry = entry.error(
                        code,
                        format!("provider reported {reported:?} after {current:?}"),
                    );
                    data.append(entry, current, now);
                    data.requires_review = true;
                    SignalOutcome::ReviewRequired(current)
                }
                _ => SignalOutcome::Duplicate,
            },
            (current, _) => return Err(PaymentError::NotAwaitingConfirmation(current)),
        };

        if let Some(delivery) = delivery {
            data.deliveries.insert(delivery);
        }
        data.assert_invariants();
        Ok(outcome)
    }

    /// Moves an `AWAITING_CONFIRMATION` payment older than `window` to `TIMEOUT`.
    ///
    /// Returns `false` if the payment is in any other state or still within
    /// the window, so a confirmation that won the lock first is kept.
    pub fn expire(&self, window: TimeDelta, now: DateTime<Utc>) -> bool {
        let mut data = self.inner.lock();
        if data.status != TransactionStatus::AwaitingConfirmation {
            return false;
        }
        let started = data.processing_started_at.unwrap_or(data.created_at);
        if now - started < window {
            return false;
        }
        let entry = LogEntry::new(RequestKind::Expire).error(
            PaymentError::GatewayTimeout.code(),
            format!("no confirmation within {}s", window.num_seconds()),
        );
        data.transition(
            TransactionStatus::AwaitingConfirmation,
            TransactionStatus::Timeout,
            entry,
            now,
        )
        .is_ok()
    }

    /// Whether the payment is awaiting confirmation since before `cutoff`.
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        let data = self.inner.lock();
        data.status == TransactionStatus::AwaitingConfirmation
            && data.processing_started_at.unwrap_or(data.created_at) <= cutoff
    }

    /// Checks a statement amount and marks the payment reconciled on a match.
    pub fn reconcile(
        &self,
        statement_amount: Decimal,
        tolerance: Decimal,
        now: DateTime<Utc>,
    ) -> LineMatch {
        let mut data = self.inner.lock();
        if data.reconciled {
            return LineMatch::AlreadyReconciled;
        }
        if (data.request.amount - statement_amount).abs() <= tolerance {
            data.reconciled = true;
            data.reconciled_at = Some(now);
            LineMatch::Matched
        } else {
            LineMatch::Discrepancy {
                expected: data.request.amount,
            }
        }
    }

    /// Appends an audit entry without changing status (refund calls).
    pub fn record_interaction(&self, entry: LogEntry, now: DateTime<Utc>) {
        let mut data = self.inner.lock();
        let status = data.status;
        data.append(entry, status, now);
    }

    /// Atomically claims the right to issue this payment's invoice.
    ///
    /// Only the first caller after confirmation gets `true`.
    pub fn claim_invoice(&self) -> bool {
        self.status() == TransactionStatus::Confirmed
            && self
                .invoice_generated
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    pub fn invoice_generated(&self) -> bool {
        self.invoice_generated.load(Ordering::Acquire)
    }

    pub(crate) fn set_invoice_number(&self, number: String) {
        self.inner.lock().invoice_number = Some(number);
    }
}

impl Serialize for Payment {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.snapshot().serialize(serializer)
    }
}
