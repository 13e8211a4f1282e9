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

//! Refund workflow.
//!
//! ```text
//! REQUESTED ──approve──► APPROVED ──execute──► PROCESSING ──► COMPLETED
//!     │                   ▲    │                   │
//!     └──reject──► REJECTED ◄──┘                   │ gateway failure
//!                         └────────────────────────┘
//! ```
//!
//! All refunds of one payment share a ledger behind a single mutex. The
//! amount bound is checked and the request moved to PROCESSING under that
//! lock, counting refunds already PROCESSING as spent, so concurrent
//! executions can never jointly exceed the confirmed amount. The gateway call
//! itself runs with no lock held.

use crate::PaymentError;
use crate::adapter::{GatewayStatus, RefundCall};
use crate::base::{Currency, ExternalRef, PaymentId, RefundId};
use crate::events::SettlementEvent;
use crate::orchestrator::Orchestrator;
use crate::payment::TransactionStatus;
use crate::transaction::RequestKind;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundStatus {
    Requested,
    Approved,
    Processing,
    Completed,
    Rejected,
}

impl RefundStatus {
    /// Whether the amount counts against the payment's refundable balance.
    fn is_committed(&self) -> bool {
        matches!(self, Self::Processing | Self::Completed)
    }
}

/// Staff request to return part or all of a confirmed payment.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewRefund {
    pub payment_id: PaymentId,
    pub amount: Decimal,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefundRequest {
    pub id: RefundId,
    pub payment_id: PaymentId,
    pub amount: Decimal,
    pub currency: Currency,
    pub reason: String,
    pub status: RefundStatus,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub response_notes: Option<String>,
    /// Provider reference of the refund once completed.
    pub external_ref: Option<ExternalRef>,
    /// Most recent execution failure; cleared on completion.
    pub last_error: Option<String>,
    pub attempts: u32,
    pub requested_at: DateTime<Utc>,
    pub refund_completed_at: Option<DateTime<Utc>>,
}

/// Refund requests of one payment.
#[derive(Debug)]
struct RefundLedger {
    confirmed: Decimal,
    requests: Vec<RefundRequest>,
}

impl RefundLedger {
    fn committed(&self, excluding: Option<RefundId>) -> Decimal {
        self.requests
            .iter()
            .filter(|r| r.status.is_committed() && Some(r.id) != excluding)
            .map(|r| r.amount)
            .sum()
    }

    fn completed(&self) -> Decimal {
        self.requests
            .iter()
            .filter(|r| r.status == RefundStatus::Completed)
            .map(|r| r.amount)
            .sum()
    }

    fn check_bound(&self, amount: Decimal, excluding: Option<RefundId>) -> Result<(), PaymentError> {
        let already_refunded = self.committed(excluding);
        if amount + already_refunded > self.confirmed {
            return Err(PaymentError::RefundAmountExceeded {
                requested: amount,
                already_refunded,
                confirmed: self.confirmed,
            });
        }
        Ok(())
    }

    fn request_mut(&mut self, id: RefundId) -> Result<&mut RefundRequest, PaymentError> {
        self.requests
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(PaymentError::RefundNotFound(id))
    }

    fn assert_invariants(&self) {
        debug_assert!(
            self.committed(None) <= self.confirmed,
            "refunds {} exceed confirmed amount {}",
            self.committed(None),
            self.confirmed
        );
    }
}

fn require(request: &RefundRequest, allowed: &[RefundStatus], operation: &str) -> Result<(), PaymentError> {
    if allowed.contains(&request.status) {
        Ok(())
    } else {
        Err(PaymentError::InvalidRefundState(format!(
            "cannot {operation} refund {} in {:?}",
            request.id, request.status
        )))
    }
}

pub struct RefundWorkflow {
    orchestrator: Arc<Orchestrator>,
    ledgers: DashMap<PaymentId, Arc<Mutex<RefundLedger>>>,
    owners: DashMap<RefundId, PaymentId>,
    next_id: AtomicU64,
}

impl RefundWorkflow {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            ledgers: DashMap::new(),
            owners: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Files a refund request in `REQUESTED`.
    ///
    /// # Errors
    ///
    /// - [`PaymentError::Validation`] - non-positive amount, blank reason, or
    ///   the payment is not CONFIRMED.
    /// - [`PaymentError::RefundAmountExceeded`] - larger than what is left to refund.
    pub fn request(&self, refund: NewRefund) -> Result<RefundRequest, PaymentError> {
        if refund.amount <= Decimal::ZERO {
            return Err(PaymentError::Validation("refund amount must be positive".into()));
        }
        if refund.reason.trim().is_empty() {
            return Err(PaymentError::Validation("refund reason is required".into()));
        }
        let payment = self.orchestrator.payment(refund.payment_id)?;
        if payment.status != TransactionStatus::Confirmed {
            return Err(PaymentError::Validation(format!(
                "payment {} is {:?}, only CONFIRMED payments can be refunded",
                payment.id, payment.status
            )));
        }

        let ledger = self
            .ledgers
            .entry(payment.id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(RefundLedger {
                    confirmed: payment.amount,
                    requests: Vec::new(),
                }))
            })
            .clone();
        let mut ledger = ledger.lock();
        ledger.check_bound(refund.amount, None)?;

        let id = RefundId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let request = RefundRequest {
            id,
            payment_id: payment.id,
            amount: refund.amount,
            currency: payment.currency.clone(),
            reason: refund.reason,
            status: RefundStatus::Requested,
            approved_by: None,
            approved_at: None,
            response_notes: None,
            external_ref: None,
            last_error: None,
            attempts: 0,
            requested_at: Utc::now(),
            refund_completed_at: None,
        };
        ledger.requests.push(request.clone());
        self.owners.insert(id, payment.id);
        tracing::info!(refund_id = %id, payment_id = %payment.id, amount = %request.amount, "refund requested");
        Ok(request)
    }

    /// Staff approval, `REQUESTED → APPROVED`.
    pub fn approve(
        &self,
        id: RefundId,
        approver: &str,
        notes: Option<String>,
    ) -> Result<RefundRequest, PaymentError> {
        self.decide(id, approver, notes, RefundStatus::Approved, &[RefundStatus::Requested])
    }

    /// Staff rejection from `REQUESTED`, or abandonment of an `APPROVED`
    /// refund whose execution keeps failing.
    pub fn reject(
        &self,
        id: RefundId,
        approver: &str,
        notes: Option<String>,
    ) -> Result<RefundRequest, PaymentError> {
        self.decide(
            id,
            approver,
            notes,
            RefundStatus::Rejected,
            &[RefundStatus::Requested, RefundStatus::Approved],
        )
    }

    fn decide(
        &self,
        id: RefundId,
        approver: &str,
        notes: Option<String>,
        to: RefundStatus,
        allowed: &[RefundStatus],
    ) -> Result<RefundRequest, PaymentError> {
        if approver.trim().is_empty() {
            return Err(PaymentError::Validation("approver is required".into()));
        }
        let ledger = self.ledger(id)?;
        let mut ledger = ledger.lock();
        let request = ledger.request_mut(id)?;
        require(request, allowed, if to == RefundStatus::Approved { "approve" } else { "reject" })?;

        request.status = to;
        request.approved_by = Some(approver.to_string());
        request.approved_at = Some(Utc::now());
        request.response_notes = notes;
        tracing::info!(refund_id = %id, approver = %approver, status = ?to, "refund decided");
        Ok(request.clone())
    }

    /// Sends an `APPROVED` refund to the payment's gateway.
    ///
    /// On gateway failure the request returns to `APPROVED` with
    /// `last_error` set and the failure is returned; re-triggering is left to
    /// staff.
    ///
    /// # Errors
    ///
    /// - [`PaymentError::InvalidRefundState`] - not `APPROVED`.
    /// - [`PaymentError::RefundAmountExceeded`] - the bound no longer holds;
    ///   the request stays `APPROVED`.
    /// - [`PaymentError::GatewayRejected`] / [`PaymentError::GatewayUnavailable`].
    pub fn execute(&self, id: RefundId) -> Result<RefundRequest, PaymentError> {
        let ledger = self.ledger(id)?;
        let request = {
            let mut guard = ledger.lock();
            let request = guard.request_mut(id)?.clone();
            require(&request, &[RefundStatus::Approved], "execute")?;
            if let Err(e) = guard.check_bound(request.amount, Some(id)) {
                guard.request_mut(id)?.last_error = Some(e.to_string());
                tracing::warn!(refund_id = %id, error = %e, "refund exceeds refundable balance");
                return Err(e);
            }
            let entry = guard.request_mut(id)?;
            entry.status = RefundStatus::Processing;
            entry.attempts += 1;
            let request = entry.clone();
            guard.assert_invariants();
            request
        };

        let result = self.call_gateway(&request);

        let mut guard = ledger.lock();
        let entry = guard.request_mut(id)?;
        match result {
            Ok(external_ref) => {
                entry.status = RefundStatus::Completed;
                entry.external_ref = Some(external_ref);
                entry.last_error = None;
                entry.refund_completed_at = Some(Utc::now());
                let completed = entry.clone();
                guard.assert_invariants();
                drop(guard);

                tracing::info!(refund_id = %id, payment_id = %completed.payment_id, "refund completed");
                self.orchestrator.publish(SettlementEvent::RefundCompleted {
                    payment_id: completed.payment_id,
                    refund_id: id,
                    amount: completed.amount,
                });
                Ok(completed)
            }
            Err(e) => {
                entry.status = RefundStatus::Approved;
                entry.last_error = Some(e.to_string());
                tracing::warn!(refund_id = %id, error = %e, "refund failed, back to approved");
                Err(e)
            }
        }
    }

    fn call_gateway(&self, request: &RefundRequest) -> Result<ExternalRef, PaymentError> {
        let payment = self.orchestrator.handle(request.payment_id)?;
        let adapter = self.orchestrator.adapters().get(payment.provider())?;
        let payment_ref = payment.external_ref().ok_or_else(|| {
            PaymentError::Validation(format!("payment {} has no provider reference", request.payment_id))
        })?;
        let call = RefundCall {
            payment_ref,
            refund_reference: ExternalRef::new(Uuid::new_v4().to_string()),
            amount: request.amount,
            currency: request.currency.clone(),
            reason: request.reason.clone(),
        };

        let response = self
            .orchestrator
            .call_with_retry(&payment, RequestKind::Refund, || adapter.refund(&call));
        payment.record_interaction(response.log_entry(RequestKind::Refund), Utc::now());
        match response.status {
            GatewayStatus::Accepted | GatewayStatus::Pending | GatewayStatus::Confirmed => {
                Ok(response.external_ref.unwrap_or(call.refund_reference))
            }
            GatewayStatus::Rejected | GatewayStatus::Unavailable => Err(response
                .error()
                .unwrap_or_else(|| PaymentError::GatewayUnavailable("refund failed".into()))),
        }
    }

    fn ledger(&self, id: RefundId) -> Result<Arc<Mutex<RefundLedger>>, PaymentError> {
        let payment_id = *self.owners.get(&id).ok_or(PaymentError::RefundNotFound(id))?;
        self.ledgers
            .get(&payment_id)
            .map(|l| Arc::clone(&l))
            .ok_or(PaymentError::RefundNotFound(id))
    }

    pub fn get(&self, id: RefundId) -> Result<RefundRequest, PaymentError> {
        let ledger = self.ledger(id)?;
        let mut ledger = ledger.lock();
        ledger.request_mut(id).map(|r| r.clone())
    }

    /// Refund requests of a payment, oldest first.
    pub fn for_payment(&self, payment_id: PaymentId) -> Vec<RefundRequest> {
        self.ledgers
            .get(&payment_id)
            .map(|l| l.lock().requests.clone())
            .unwrap_or_default()
    }

    /// Sum of completed refunds of a payment.
    pub fn refunded_total(&self, payment_id: PaymentId) -> Decimal {
        self.ledgers
            .get(&payment_id)
            .map(|l| l.lock().completed())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ledger(confirmed: Decimal) -> RefundLedger {
        RefundLedger {
            confirmed,
            requests: Vec::new(),
        }
    }

    fn refund(id: u64, amount: Decimal, status: RefundStatus) -> RefundRequest {
        RefundRequest {
            id: RefundId(id),
            payment_id: PaymentId(1),
            amount,
            currency: Currency::rwf(),
            reason: "duplicate charge".into(),
            status,
            approved_by: None,
            approved_at: None,
            response_notes: None,
            external_ref: None,
            last_error: None,
            attempts: 0,
            requested_at: Utc::now(),
            refund_completed_at: None,
        }
    }

    #[test]
    fn bound_counts_processing_and_completed() {
        let mut ledger = ledger(dec!(5000));
        ledger.requests.push(refund(1, dec!(2000), RefundStatus::Completed));
        ledger.requests.push(refund(2, dec!(2000), RefundStatus::Processing));
        ledger.requests.push(refund(3, dec!(4000), RefundStatus::Rejected));
        ledger.requests.push(refund(4, dec!(4000), RefundStatus::Approved));

        assert_eq!(ledger.committed(None), dec!(4000));
        assert_eq!(ledger.completed(), dec!(2000));
        assert!(ledger.check_bound(dec!(1000), None).is_ok());
        assert_eq!(
            ledger.check_bound(dec!(1000.01), None),
            Err(PaymentError::RefundAmountExceeded {
                requested: dec!(1000.01),
                already_refunded: dec!(4000),
                confirmed: dec!(5000),
            })
        );
    }

    #[test]
    fn bound_excludes_the_request_itself() {
        let mut ledger = ledger(dec!(5000));
        ledger.requests.push(refund(1, dec!(5000), RefundStatus::Processing));
        assert!(ledger.check_bound(dec!(5000), Some(RefundId(1))).is_ok());
        assert!(ledger.check_bound(dec!(1), None).is_err());
    }

    #[test]
    fn state_guard_names_operation() {
        let request = refund(7, dec!(10), RefundStatus::Completed);
        let err = require(&request, &[RefundStatus::Approved], "execute").unwrap_err();
        assert_eq!(
            err,
            PaymentError::InvalidRefundState("cannot execute refund 7 in Completed".into())
        );
    }

    #[test]
    fn unknown_refund_in_ledger() {
        let mut ledger = ledger(dec!(1));
        assert_eq!(
            ledger.request_mut(RefundId(9)).map(|r| r.id),
            Err(PaymentError::RefundNotFound(RefundId(9)))
        );
    }
}
