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
//! Webhook ingestion: authentication, deduplication and ordering.

mod common;

use common::{awaiting, harness, webhook};
use parking_lot::Mutex;
use payment_settlement_rs::{
    PaymentError, Provider, SignalOutcome, TransactionStatus, WebhookReceiver,
};
use rust_decimal_macros::dec;
use std::sync::Arc;

fn receiver(h: &common::Harness) -> WebhookReceiver {
    WebhookReceiver::new(Arc::clone(&h.orchestrator))
}

#[test]
fn signed_confirmation_settles_payment() {
    let h = harness();
    let payment = awaiting(&h, "order-1", dec!(5000));
    let reference = payment.external_ref.unwrap();
    let (body, signature) = webhook(reference.as_str(), "SUCCESSFUL", Some("d-1"));

    let outcome = receiver(&h)
        .receive(Provider::MtnMomo, &body, Some(&signature))
        .unwrap();

    assert_eq!(outcome, SignalOutcome::Transitioned(TransactionStatus::Confirmed));
    assert_eq!(h.orchestrator.invoice_count(), 1);
    let log = h.orchestrator.transactions(payment.id).unwrap();
    let last = log.last().unwrap();
    assert_eq!(last.inbound.as_ref().map(|p| p.as_bytes()), Some(body.as_slice()));
}

#[test]
fn duplicate_delivery_is_ignored() {
    let h = harness();
    let payment = awaiting(&h, "order-2", dec!(5000));
    let (body, signature) = webhook(payment.external_ref.unwrap().as_str(), "SUCCESSFUL", Some("d-2"));
    let receiver = receiver(&h);

    receiver.receive(Provider::MtnMomo, &body, Some(&signature)).unwrap();
    let log_len = h.orchestrator.transactions(payment.id).unwrap().len();
    let again = receiver.receive(Provider::MtnMomo, &body, Some(&signature)).unwrap();

    assert_eq!(again, SignalOutcome::Duplicate);
    assert_eq!(h.orchestrator.invoice_count(), 1);
    assert_eq!(h.orchestrator.transactions(payment.id).unwrap().len(), log_len);
}

#[test]
fn pending_then_final_callback_for_same_transaction_settles() {
    let h = harness();
    let payment = awaiting(&h, "order-2b", dec!(5000));
    let reference = payment.external_ref.unwrap();
    let receiver = receiver(&h);

    let (pending, pending_sig) = webhook(reference.as_str(), "PENDING", Some("TXN-1"));
    let (success, success_sig) = webhook(reference.as_str(), "SUCCESSFUL", Some("TXN-1"));

    assert_eq!(
        receiver.receive(Provider::MtnMomo, &pending, Some(&pending_sig)),
        Ok(SignalOutcome::StillPending)
    );
    assert_eq!(
        receiver.receive(Provider::MtnMomo, &success, Some(&success_sig)),
        Ok(SignalOutcome::Transitioned(TransactionStatus::Confirmed))
    );
    assert_eq!(
        receiver.receive(Provider::MtnMomo, &success, Some(&success_sig)),
        Ok(SignalOutcome::Duplicate)
    );

    assert_eq!(
        h.orchestrator.payment(payment.id).unwrap().status,
        TransactionStatus::Confirmed
    );
    assert_eq!(h.orchestrator.invoice_count(), 1);
}

#[test]
fn final_callback_after_timeout_is_flagged_even_after_pending() {
    let h = harness();
    let payment = awaiting(&h, "order-2c", dec!(5000));
    let reference = payment.external_ref.unwrap();
    let receiver = receiver(&h);

    let (pending, pending_sig) = webhook(reference.as_str(), "PENDING", Some("TXN-2"));
    receiver.receive(Provider::MtnMomo, &pending, Some(&pending_sig)).unwrap();
    h.orchestrator
        .sweep_timeouts_at(chrono::Utc::now() + chrono::Duration::seconds(121));

    let (success, success_sig) = webhook(reference.as_str(), "SUCCESSFUL", Some("TXN-2"));
    assert_eq!(
        receiver.receive(Provider::MtnMomo, &success, Some(&success_sig)),
        Ok(SignalOutcome::ReviewRequired(TransactionStatus::Timeout))
    );
    let snapshot = h.orchestrator.payment(payment.id).unwrap();
    assert_eq!(snapshot.status, TransactionStatus::Timeout);
    assert!(snapshot.requires_review);
    let log = h.orchestrator.transactions(payment.id).unwrap();
    assert_eq!(log.last().unwrap().error_code.as_deref(), Some("LATE_CONFIRMATION"));
}

#[test]
fn redelivery_without_id_is_deduplicated_by_body() {
    let h = harness();
    let payment = awaiting(&h, "order-3", dec!(5000));
    let (body, signature) = webhook(payment.external_ref.unwrap().as_str(), "SUCCESSFUL", None);
    let receiver = receiver(&h);

    receiver.receive(Provider::MtnMomo, &body, Some(&signature)).unwrap();
    assert_eq!(
        receiver.receive(Provider::MtnMomo, &body, Some(&signature)),
        Ok(SignalOutcome::Duplicate)
    );
}

#[test]
fn bad_signature_changes_nothing() {
    let h = harness();
    let payment = awaiting(&h, "order-4", dec!(5000));
    let (body, _) = webhook(payment.external_ref.unwrap().as_str(), "SUCCESSFUL", Some("d-4"));
    let log_len = h.orchestrator.transactions(payment.id).unwrap().len();

    let receiver = receiver(&h);
    assert_eq!(
        receiver.receive(Provider::MtnMomo, &body, Some("forged")),
        Err(PaymentError::WebhookAuthentication)
    );
    assert_eq!(
        receiver.receive(Provider::MtnMomo, &body, None),
        Err(PaymentError::WebhookAuthentication)
    );

    let snapshot = h.orchestrator.payment(payment.id).unwrap();
    assert_eq!(snapshot.status, TransactionStatus::AwaitingConfirmation);
    assert_eq!(h.orchestrator.transactions(payment.id).unwrap().len(), log_len);
}

#[test]
fn unknown_reference_is_reported() {
    let h = harness();
    let (body, signature) = webhook("no-such-ref", "SUCCESSFUL", None);
    assert_eq!(
        receiver(&h).receive(Provider::MtnMomo, &body, Some(&signature)),
        Err(PaymentError::ReferenceNotFound("no-such-ref".into()))
    );
}

#[test]
fn unconfigured_provider_is_unknown() {
    let h = harness();
    let (body, signature) = webhook("x", "SUCCESSFUL", None);
    assert!(matches!(
        receiver(&h).receive(Provider::BankTransfer, &body, Some(&signature)),
        Err(PaymentError::UnknownProvider(_))
    ));
}

#[test]
fn failure_report_fails_payment() {
    let h = harness();
    let payment = awaiting(&h, "order-5", dec!(5000));
    let (body, signature) = webhook(payment.external_ref.unwrap().as_str(), "FAILED", Some("d-5"));

    let outcome = receiver(&h)
        .receive(Provider::MtnMomo, &body, Some(&signature))
        .unwrap();
    assert_eq!(outcome, SignalOutcome::Transitioned(TransactionStatus::Failed));
    assert_eq!(h.orchestrator.invoice_count(), 0);
}

#[test]
fn pending_report_keeps_waiting() {
    let h = harness();
    let payment = awaiting(&h, "order-6", dec!(5000));
    let (body, signature) = webhook(payment.external_ref.unwrap().as_str(), "PENDING", Some("d-6"));

    assert_eq!(
        receiver(&h).receive(Provider::MtnMomo, &body, Some(&signature)),
        Ok(SignalOutcome::StillPending)
    );
    assert_eq!(
        h.orchestrator.payment(payment.id).unwrap().status,
        TransactionStatus::AwaitingConfirmation
    );
}

#[test]
fn conflicting_report_after_confirmation_requires_review() {
    let h = harness();
    let payment = awaiting(&h, "order-7", dec!(5000));
    let reference = payment.external_ref.unwrap();
    let receiver = receiver(&h);

    let (body, signature) = webhook(reference.as_str(), "SUCCESSFUL", Some("d-7a"));
    receiver.receive(Provider::MtnMomo, &body, Some(&signature)).unwrap();
    let (body, signature) = webhook(reference.as_str(), "FAILED", Some("d-7b"));
    let outcome = receiver.receive(Provider::MtnMomo, &body, Some(&signature)).unwrap();

    assert_eq!(outcome, SignalOutcome::ReviewRequired(TransactionStatus::Confirmed));
    let snapshot = h.orchestrator.payment(payment.id).unwrap();
    assert_eq!(snapshot.status, TransactionStatus::Confirmed);
    assert!(snapshot.requires_review);
}

#[test]
fn malformed_body_is_rejected() {
    let h = harness();
    let body = b"{not json".to_vec();
    let signature = payment_settlement_rs::adapter::sign_hex(common::SECRET, &body).unwrap();
    assert!(matches!(
        receiver(&h).receive(Provider::MtnMomo, &body, Some(&signature)),
        Err(PaymentError::Validation(_))
    ));
}

#[test]
fn webhook_before_acceptance_asks_for_redelivery() {
    let h = harness();
    let receiver = Arc::new(receiver(&h));
    let early = Arc::new(Mutex::new(None));
    {
        let receiver = Arc::clone(&receiver);
        let early = Arc::clone(&early);
        h.adapter.on_initiate(move |reference| {
            let (body, signature) = webhook(reference.as_str(), "SUCCESSFUL", Some("early"));
            *early.lock() = Some(receiver.receive(Provider::MtnMomo, &body, Some(&signature)));
        });
    }

    let payment = h.orchestrator.pay(common::new_payment("order-8", dec!(5000))).unwrap();
    assert_eq!(
        early.lock().clone(),
        Some(Err(PaymentError::NotAwaitingConfirmation(TransactionStatus::SentToGateway)))
    );
    assert_eq!(payment.status, TransactionStatus::AwaitingConfirmation);

    // The same delivery retried later is applied.
    let (body, signature) = webhook(payment.external_ref.unwrap().as_str(), "SUCCESSFUL", Some("early"));
    assert_eq!(
        receiver.receive(Provider::MtnMomo, &body, Some(&signature)),
        Ok(SignalOutcome::Transitioned(TransactionStatus::Confirmed))
    );
}
