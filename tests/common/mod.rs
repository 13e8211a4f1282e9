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
//! Shared fixtures: a scripted in-process provider and payment builders.

#![allow(dead_code)]

use parking_lot::Mutex;
use payment_settlement_rs::adapter::mtn::MtnCallback;
use payment_settlement_rs::adapter::sign_hex;
use payment_settlement_rs::payment::Signal;
use payment_settlement_rs::transaction::Payload;
use payment_settlement_rs::{
    AdapterRegistry, Config, Currency, ExternalRef, GatewayResponse, GatewayStatus, IdempotencyKey,
    InitiateRequest, NewPayment, Orchestrator, Payable, PaymentError, PaymentMethod, PaymentSnapshot,
    Provider, ProviderAdapter, ProviderPayload, RefundCall, RequestKind, RetryPolicy, TransactionStatus,
    WebhookNotification,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const SECRET: &str = "test-webhook-secret";
pub const SIGNATURE_HEADER: &str = "X-Test-Signature";

/// Runs inside `initiate`, before the answer is returned.
pub type InitiateHook = Box<dyn Fn(&ExternalRef) + Send + Sync>;

/// Provider whose answers are queued by the test.
///
/// Unscripted calls answer `Accepted` (initiate, refund) or `Pending` (query).
pub struct ScriptedAdapter {
    provider: Provider,
    initiate: Mutex<VecDeque<GatewayStatus>>,
    query: Mutex<VecDeque<GatewayStatus>>,
    refund: Mutex<VecDeque<GatewayStatus>>,
    hook: Mutex<Option<InitiateHook>>,
    references: Mutex<VecDeque<String>>,
    pub initiate_calls: AtomicUsize,
    pub query_calls: AtomicUsize,
    pub refund_calls: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            initiate: Mutex::new(VecDeque::new()),
            query: Mutex::new(VecDeque::new()),
            refund: Mutex::new(VecDeque::new()),
            hook: Mutex::new(None),
            references: Mutex::new(VecDeque::new()),
            initiate_calls: AtomicUsize::new(0),
            query_calls: AtomicUsize::new(0),
            refund_calls: AtomicUsize::new(0),
        }
    }

    pub fn script_initiate(&self, statuses: &[GatewayStatus]) {
        self.initiate.lock().extend(statuses.iter().copied());
    }

    pub fn script_query(&self, statuses: &[GatewayStatus]) {
        self.query.lock().extend(statuses.iter().copied());
    }

    pub fn script_refund(&self, statuses: &[GatewayStatus]) {
        self.refund.lock().extend(statuses.iter().copied());
    }

    /// Provider-side references for the next accepted collections.
    pub fn assign_references(&self, references: &[&str]) {
        self.references
            .lock()
            .extend(references.iter().map(|r| r.to_string()));
    }

    pub fn on_initiate(&self, hook: impl Fn(&ExternalRef) + Send + Sync + 'static) {
        *self.hook.lock() = Some(Box::new(hook));
    }

    fn answer(queue: &Mutex<VecDeque<GatewayStatus>>, default: GatewayStatus, what: &str) -> GatewayResponse {
        let status = queue.lock().pop_front().unwrap_or(default);
        let response = GatewayResponse::new(status, Payload::from(what));
        match status {
            GatewayStatus::Rejected => response.provider_code("PAYER_NOT_FOUND"),
            GatewayStatus::Unavailable => response.provider_code("HTTP_503"),
            _ => response,
        }
    }
}

impl ProviderAdapter for ScriptedAdapter {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn initiate(&self, request: &InitiateRequest) -> GatewayResponse {
        self.initiate_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = self.hook.lock().as_ref() {
            hook(&request.reference);
        }
        let reference = self
            .references
            .lock()
            .pop_front()
            .map(ExternalRef::new)
            .unwrap_or_else(|| request.reference.clone());
        Self::answer(&self.initiate, GatewayStatus::Accepted, "initiate").external_ref(reference)
    }

    fn query(&self, _external_ref: &ExternalRef) -> GatewayResponse {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        Self::answer(&self.query, GatewayStatus::Pending, "query")
    }

    fn refund(&self, request: &RefundCall) -> GatewayResponse {
        self.refund_calls.fetch_add(1, Ordering::SeqCst);
        Self::answer(&self.refund, GatewayStatus::Accepted, "refund").external_ref(request.refund_reference.clone())
    }

    fn signature_header(&self) -> &'static str {
        SIGNATURE_HEADER
    }

    fn authenticate(&self, body: &[u8], signature: Option<&str>) -> bool {
        matches!((signature, sign_hex(SECRET, body)), (Some(s), Some(expected)) if s == expected)
    }

    fn parse_notification(&self, body: &[u8]) -> Result<WebhookNotification, PaymentError> {
        let callback: TestCallback =
            serde_json::from_slice(body).map_err(|e| PaymentError::Validation(e.to_string()))?;
        let status = match callback.status.as_str() {
            "SUCCESSFUL" => GatewayStatus::Confirmed,
            "FAILED" => GatewayStatus::Rejected,
            _ => GatewayStatus::Pending,
        };
        Ok(WebhookNotification {
            external_ref: ExternalRef::new(callback.reference.clone()),
            status,
            delivery_id: callback.delivery_id.clone(),
            reason: None,
            payload: ProviderPayload::MtnMomo(MtnCallback {
                reference_id: Some(callback.reference),
                external_id: None,
                financial_transaction_id: callback.delivery_id,
                status: callback.status,
                amount: None,
                currency: None,
                reason: None,
            }),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TestCallback {
    pub reference: String,
    pub status: String,
    #[serde(default)]
    pub delivery_id: Option<String>,
}

/// Signed webhook body for `reference`.
pub fn webhook(reference: &str, status: &str, delivery_id: Option<&str>) -> (Vec<u8>, String) {
    let body = serde_json::to_vec(&TestCallback {
        reference: reference.to_string(),
        status: status.to_string(),
        delivery_id: delivery_id.map(str::to_string),
    })
    .unwrap();
    let signature = sign_hex(SECRET, &body).unwrap();
    (body, signature)
}

/// Configuration with immediate retries.
pub fn config() -> Config {
    Config {
        retry: RetryPolicy::immediate(3),
        confirmation_window: Duration::from_secs(120),
        ..Config::default()
    }
}

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub adapter: Arc<ScriptedAdapter>,
}

pub fn harness() -> Harness {
    harness_with(config())
}

pub fn harness_with(config: Config) -> Harness {
    let adapter = Arc::new(ScriptedAdapter::new(Provider::MtnMomo));
    let registry = AdapterRegistry::new().with(adapter.clone());
    Harness {
        orchestrator: Arc::new(Orchestrator::new(registry, &config)),
        adapter,
    }
}

pub fn new_payment(key: &str, amount: Decimal) -> NewPayment {
    NewPayment {
        idempotency_key: IdempotencyKey::new(key),
        amount,
        currency: Currency::rwf(),
        provider: Provider::MtnMomo,
        method: PaymentMethod::MobileMoney,
        payable: Payable::Order("1042".into()),
        payer: "+250 781 234 567".into(),
        notes: None,
    }
}

/// Confirmed payment carrying the provider reference `reference`.
pub fn confirmed_as(harness: &Harness, key: &str, reference: &str, amount: Decimal) -> PaymentSnapshot {
    harness.adapter.assign_references(&[reference]);
    confirmed(harness, key, amount)
}

/// Submits a payment and leaves it awaiting confirmation.
pub fn awaiting(harness: &Harness, key: &str, amount: Decimal) -> PaymentSnapshot {
    harness.orchestrator.pay(new_payment(key, amount)).unwrap()
}

/// Submits a payment and confirms it with a provider report.
pub fn confirmed(harness: &Harness, key: &str, amount: Decimal) -> PaymentSnapshot {
    let payment = awaiting(harness, key, amount);
    let handle = harness.orchestrator.handle(payment.id).unwrap();
    harness
        .orchestrator
        .apply_signal(&handle, report(TransactionStatus::Confirmed, Some(&format!("confirm-{}", payment.id))))
        .unwrap();
    harness.orchestrator.payment(payment.id).unwrap()
}

/// Provider report as a webhook would deliver it.
pub fn report(status: TransactionStatus, delivery_id: Option<&str>) -> Signal {
    Signal {
        kind: RequestKind::Confirm,
        reported: Some(status),
        delivery_id: delivery_id.map(str::to_string),
        reason: None,
        inbound: None,
        latency: None,
    }
}
