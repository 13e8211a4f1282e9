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

//! Transaction orchestrator.
//!
//! The [`Orchestrator`] is the only component that mutates payments. It drives
//! each payment through its status graph, calls the provider adapters, and
//! publishes events once a transition has been committed.
//!
//! # Locking
//!
//! - Adapter calls run with no payment lock held.
//! - Every state change is a compare-and-swap under the payment's own mutex,
//!   so a webhook, a poll and the timeout sweep racing on one payment produce
//!   exactly one winner.
//! - The `INITIATED → SENT_TO_GATEWAY` swap elects the single caller allowed
//!   to issue the `initiate` call; duplicate submissions observe the
//!   existing record instead.

use crate::PaymentError;
use crate::adapter::{AdapterRegistry, GatewayResponse, GatewayStatus, InitiateRequest, ProviderAdapter};
use crate::base::{ExternalRef, PaymentId, Provider};
use crate::config::Config;
use crate::events::{EventBus, SettlementEvent};
use crate::invoice::{Invoice, InvoiceGenerator};
use crate::payment::{NewPayment, Payment, PaymentSnapshot, Signal, SignalOutcome, TransactionStatus};
use crate::payment_index::PaymentIndex;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::transaction::{LogEntry, Payload, PaymentTransaction, RequestKind};
use chrono::{DateTime, TimeDelta, Utc};
use crossbeam::channel::Receiver;
use std::sync::Arc;
use uuid::Uuid;

/// Audit code for a provider reference already held by another payment.
const REFERENCE_CONFLICT: &str = "REFERENCE_CONFLICT";

/// Payment state machine driver.
///
/// # Invariants
///
/// - Idempotency keys are unique for the lifetime of the orchestrator.
/// - Status moves only forward: `INITIATED → SENT_TO_GATEWAY → GATEWAY_ACCEPTED
///   → AWAITING_CONFIRMATION → {CONFIRMED | TIMEOUT | FAILED}`, with
///   `SENT_TO_GATEWAY → FAILED` on rejection.
/// - No adapter call is made for a payment in a terminal state.
/// - At most one invoice exists per payment, and only once it is CONFIRMED.
pub struct Orchestrator {
    payments: PaymentIndex,
    adapters: AdapterRegistry,
    invoices: InvoiceGenerator,
    events: EventBus,
    retry: RetryPolicy,
    confirmation_window: TimeDelta,
}

impl Orchestrator {
    pub fn new(adapters: AdapterRegistry, config: &Config) -> Self {
        Self {
            payments: PaymentIndex::new(),
            adapters,
            invoices: InvoiceGenerator::new(config.invoice_tax_rate, config.invoice_due_days),
            events: EventBus::new(),
            retry: config.retry.clone(),
            confirmation_window: TimeDelta::from_std(config.confirmation_window)
                .unwrap_or_else(|_| TimeDelta::days(1)),
        }
    }

    /// Records a new payment in `INITIATED`, or returns the one already
    /// created with the same idempotency key.
    ///
    /// # Errors
    ///
    /// - [`PaymentError::Validation`] - malformed request or unconfigured provider.
    pub fn create_payment(&self, request: NewPayment) -> Result<PaymentSnapshot, PaymentError> {
        let request = request.validate()?;
        if !self.adapters.contains(request.provider) {
            return Err(PaymentError::Validation(format!(
                "provider {} is not configured",
                request.provider
            )));
        }

        let insertion = self.payments.insert_or_get(request, Utc::now())?;
        let snapshot = insertion.payment().snapshot();
        if insertion.is_created() {
            tracing::info!(
                payment_id = %snapshot.id,
                idempotency_key = %snapshot.idempotency_key,
                provider = %snapshot.provider,
                amount = %snapshot.amount,
                currency = %snapshot.currency,
                "payment created"
            );
        } else {
            tracing::info!(
                payment_id = %snapshot.id,
                idempotency_key = %snapshot.idempotency_key,
                status = ?snapshot.status,
                "duplicate idempotency key, returning existing payment"
            );
        }
        Ok(snapshot)
    }

    /// Creates the payment if needed and submits it to its gateway.
    ///
    /// A repeated call with the same idempotency key returns the existing
    /// payment without a second `initiate` call.
    pub fn pay(&self, request: NewPayment) -> Result<PaymentSnapshot, PaymentError> {
        let created = self.create_payment(request)?;
        if created.status != TransactionStatus::Initiated {
            return Ok(created);
        }
        match self.submit(created.id) {
            Err(PaymentError::InvalidTransition { .. }) | Err(PaymentError::PaymentTerminal(_)) => {
                self.payment(created.id)
            }
            other => other,
        }
    }

    /// Issues the gateway `initiate` call for an `INITIATED` payment.
    ///
    /// # Errors
    ///
    /// - [`PaymentError::PaymentNotFound`] - unknown id.
    /// - [`PaymentError::InvalidTransition`] - the payment was already submitted.
    /// - [`PaymentError::UnknownProvider`] - its provider has no adapter.
    pub fn submit(&self, id: PaymentId) -> Result<PaymentSnapshot, PaymentError> {
        let payment = self.handle(id)?;
        let snapshot = payment.snapshot();
        let adapter = self.adapters.get(snapshot.provider)?;

        let request = InitiateRequest {
            reference: ExternalRef::new(Uuid::new_v4().to_string()),
            amount: snapshot.amount,
            currency: snapshot.currency.clone(),
            method: snapshot.method,
            payer: snapshot.payer.clone(),
            payable: snapshot.payable.clone(),
        };
        let outbound = Payload::new(serde_json::to_vec(&request).unwrap_or_default());
        payment.transition(
            TransactionStatus::Initiated,
            TransactionStatus::SentToGateway,
            LogEntry::new(RequestKind::Initiate).outbound(outbound),
            Utc::now(),
        )?;
        tracing::info!(payment_id = %id, reference = %request.reference, "payment sent to gateway");

        // Bound before the call so an early webhook finds the payment.
        if let Err(e) = self
            .payments
            .bind_reference(snapshot.provider, request.reference.clone(), id)
        {
            return self.fail_submitted(&payment, LogEntry::new(RequestKind::Initiate).failure(&e), &e);
        }

        let response = self.call_with_retry(&payment, RequestKind::Initiate, || {
            adapter.initiate(&request)
        });
        self.handle_initiate_response(&payment, adapter.as_ref(), request.reference, response)
    }

    fn handle_initiate_response(
        &self,
        payment: &Arc<Payment>,
        adapter: &dyn ProviderAdapter,
        reference: ExternalRef,
        response: GatewayResponse,
    ) -> Result<PaymentSnapshot, PaymentError> {
        let id = payment.id();
        match response.status {
            GatewayStatus::Rejected | GatewayStatus::Unavailable => {
                tracing::warn!(
                    payment_id = %id,
                    provider = %adapter.provider(),
                    status = ?response.status,
                    code = response.provider_code.as_deref().unwrap_or(""),
                    "gateway did not accept payment"
                );
                let snapshot = payment.transition(
                    TransactionStatus::SentToGateway,
                    TransactionStatus::Failed,
                    response.log_entry(RequestKind::Initiate),
                    Utc::now(),
                )?;
                self.settled(id, TransactionStatus::Failed);
                Ok(snapshot)
            }
            GatewayStatus::Accepted | GatewayStatus::Pending | GatewayStatus::Confirmed => {
                let external_ref = response.external_ref.clone().unwrap_or(reference);
                if let Err(e) = self
                    .payments
                    .bind_reference(adapter.provider(), external_ref.clone(), id)
                {
                    let entry = response
                        .log_entry(RequestKind::Initiate)
                        .error(REFERENCE_CONFLICT, e.to_string());
                    return self.fail_submitted(payment, entry, &e);
                }
                payment.accept(external_ref, response.log_entry(RequestKind::Initiate), Utc::now())?;
                let snapshot = payment.transition(
                    TransactionStatus::GatewayAccepted,
                    TransactionStatus::AwaitingConfirmation,
                    LogEntry::new(RequestKind::Initiate),
                    Utc::now(),
                )?;
                tracing::info!(payment_id = %id, "awaiting confirmation");

                if response.status != GatewayStatus::Confirmed {
                    return Ok(snapshot);
                }
                self.apply_signal(
                    payment,
                    Signal {
                        kind: RequestKind::Confirm,
                        reported: Some(TransactionStatus::Confirmed),
                        delivery_id: None,
                        reason: None,
                        inbound: None,
                        latency: None,
                    },
                )?;
                Ok(payment.snapshot())
            }
        }
    }

    /// Queries the gateway for an `AWAITING_CONFIRMATION` payment and applies the answer.
    ///
    /// # Errors
    ///
    /// [`PaymentError::PaymentTerminal`] once the payment is settled; no call is made.
    pub fn poll(&self, id: PaymentId) -> Result<PaymentSnapshot, PaymentError> {
        let payment = self.handle(id)?;
        let snapshot = payment.snapshot();
        if snapshot.status.is_terminal() {
            return Err(PaymentError::PaymentTerminal(snapshot.status));
        }
        if snapshot.status != TransactionStatus::AwaitingConfirmation {
            return Err(PaymentError::NotAwaitingConfirmation(snapshot.status));
        }
        let external_ref = snapshot
            .external_ref
            .ok_or_else(|| PaymentError::NotAwaitingConfirmation(snapshot.status))?;
        let adapter = self.adapters.get(snapshot.provider)?;

        let response = self.call_with_retry(&payment, RequestKind::Query, || adapter.query(&external_ref));
        if response.status == GatewayStatus::Unavailable {
            payment.record_interaction(response.log_entry(RequestKind::Query), Utc::now());
            return Ok(payment.snapshot());
        }

        let signal = Signal {
            kind: RequestKind::Query,
            reported: response.status.reported(),
            delivery_id: None,
            reason: response.message.clone().or(response.provider_code.clone()),
            inbound: response.inbound.clone(),
            latency: Some(response.latency),
        };
        match self.apply_signal(&payment, signal) {
            Ok(_) => Ok(payment.snapshot()),
            // A webhook or the sweep settled it while the query was in flight.
            Err(PaymentError::PaymentTerminal(_)) => Ok(payment.snapshot()),
            Err(e) => Err(e),
        }
    }

    /// Applies a confirmation signal and runs the post-commit side effects.
    pub fn apply_signal(
        &self,
        payment: &Arc<Payment>,
        signal: Signal,
    ) -> Result<SignalOutcome, PaymentError> {
        let id = payment.id();
        let reported = signal.reported;
        let outcome = payment.apply_signal(signal, Utc::now())?;

        match outcome {
            SignalOutcome::Transitioned(status) => {
                tracing::info!(payment_id = %id, status = ?status, "payment settled");
                self.settled(id, status);
                if status == TransactionStatus::Confirmed {
                    self.issue_invoice(payment);
                }
            }
            SignalOutcome::ReviewRequired(status) => {
                tracing::warn!(
                    payment_id = %id,
                    status = ?status,
                    reported = ?reported,
                    "conflicting provider report on settled payment, flagged for review"
                );
                self.events.publish(SettlementEvent::ManualReviewRequired {
                    payment_id: id,
                    reason: format!("provider reported {reported:?} after {status:?}"),
                });
            }
            SignalOutcome::Duplicate => {
                tracing::debug!(payment_id = %id, "duplicate confirmation ignored");
            }
            SignalOutcome::StillPending => {
                tracing::debug!(payment_id = %id, "provider reports payment pending");
            }
        }
        Ok(outcome)
    }

    /// Times out every payment awaiting confirmation longer than the window.
    pub fn sweep_timeouts(&self) -> Vec<PaymentId> {
        self.sweep_timeouts_at(Utc::now())
    }

    /// [`Self::sweep_timeouts`] against an explicit clock.
    pub fn sweep_timeouts_at(&self, now: DateTime<Utc>) -> Vec<PaymentId> {
        let cutoff = now - self.confirmation_window;
        let mut expired = Vec::new();
        for payment in self.payments.with_status(TransactionStatus::AwaitingConfirmation) {
            if !payment.is_stale(cutoff) {
                continue;
            }
            // The CAS inside `expire` loses to a confirmation that got the lock first.
            if payment.expire(self.confirmation_window, now) {
                let id = payment.id();
                tracing::warn!(payment_id = %id, "confirmation window elapsed, payment timed out");
                self.settled(id, TransactionStatus::Timeout);
                expired.push(id);
            }
        }
        expired
    }

    /// Runs `call` with capped backoff, auditing each abandoned attempt.
    pub(crate) fn call_with_retry(
        &self,
        payment: &Payment,
        kind: RequestKind,
        call: impl Fn() -> GatewayResponse,
    ) -> GatewayResponse {
        let attempts = self.retry.max_attempts.max(1);
        retry_with_backoff(
            &self.retry,
            |attempt| {
                let response = call();
                if response.status == GatewayStatus::Unavailable && attempt + 1 < attempts {
                    payment.record_interaction(response.log_entry(kind), Utc::now());
                }
                response
            },
            |response| response.status == GatewayStatus::Unavailable,
        )
    }

    fn issue_invoice(&self, payment: &Payment) {
        if !payment.claim_invoice() {
            return;
        }
        match self.invoices.issue(&payment.snapshot(), Utc::now()) {
            Ok(invoice) => {
                payment.set_invoice_number(invoice.invoice_number.clone());
                self.events.publish(SettlementEvent::InvoiceIssued {
                    payment_id: invoice.payment_id,
                    invoice_number: invoice.invoice_number,
                });
            }
            Err(e) => {
                tracing::error!(payment_id = %payment.id(), error = %e, "invoice generation failed");
            }
        }
    }

    /// Ends a `SENT_TO_GATEWAY` payment whose gateway exchange cannot be
    /// completed locally, so it never waits for a confirmation that cannot arrive.
    fn fail_submitted(
        &self,
        payment: &Payment,
        entry: LogEntry,
        cause: &PaymentError,
    ) -> Result<PaymentSnapshot, PaymentError> {
        tracing::error!(payment_id = %payment.id(), error = %cause, "payment submission failed");
        let snapshot = payment.transition(
            TransactionStatus::SentToGateway,
            TransactionStatus::Failed,
            entry,
            Utc::now(),
        )?;
        self.settled(payment.id(), TransactionStatus::Failed);
        Ok(snapshot)
    }

    fn settled(&self, payment_id: PaymentId, status: TransactionStatus) {
        self.events
            .publish(SettlementEvent::PaymentSettled { payment_id, status });
    }

    pub(crate) fn publish(&self, event: SettlementEvent) {
        self.events.publish(event);
    }

    /// Shared handle to a payment.
    pub fn handle(&self, id: PaymentId) -> Result<Arc<Payment>, PaymentError> {
        self.payments.get(id).ok_or(PaymentError::PaymentNotFound(id))
    }

    pub fn payment(&self, id: PaymentId) -> Result<PaymentSnapshot, PaymentError> {
        Ok(self.handle(id)?.snapshot())
    }

    /// Audit log of a payment, oldest first.
    pub fn transactions(&self, id: PaymentId) -> Result<Vec<PaymentTransaction>, PaymentError> {
        Ok(self.handle(id)?.transactions())
    }

    /// Payments in creation order, optionally filtered by status.
    pub fn payments(&self, status: Option<TransactionStatus>) -> Vec<PaymentSnapshot> {
        let payments = match status {
            Some(status) => self.payments.with_status(status),
            None => self.payments.all(),
        };
        payments.iter().map(|p| p.snapshot()).collect()
    }

    pub fn find_by_reference(&self, provider: Provider, external_ref: &ExternalRef) -> Option<Arc<Payment>> {
        self.payments.by_reference(provider, external_ref)
    }

    pub fn invoice(&self, id: PaymentId) -> Result<Invoice, PaymentError> {
        self.invoices.get(id).ok_or(PaymentError::InvoiceNotFound(id))
    }

    pub fn mark_invoice_sent(&self, id: PaymentId) -> Result<Invoice, PaymentError> {
        self.invoices.mark_sent(id, Utc::now())
    }

    pub fn invoice_count(&self) -> usize {
        self.invoices.len()
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    pub fn subscribe(&self) -> Receiver<SettlementEvent> {
        self.events.subscribe()
    }
}
