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

//! Bank transfer and card collections through Flutterwave v3.

use super::http::{self, Call, Exchange, scalar, with_status};
use super::{
    GatewayResponse, GatewayStatus, InitiateRequest, ProviderAdapter, ProviderPayload, RefundCall,
    WebhookNotification, parse_json, secure_eq,
};
use crate::PaymentError;
use crate::base::{ExternalRef, PaymentMethod, Provider};
use crate::config::BankTransferConfig;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;

const CHARGE_COMPLETED: &str = "charge.completed";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FlutterwaveCharge {
    pub id: u64,
    pub tx_ref: String,
    pub status: String,
    #[serde(default)]
    pub flw_ref: Option<String>,
    #[serde(default)]
    pub amount: Option<Value>,
    #[serde(default)]
    pub currency: Option<String>,
}

/// Webhook event body; the `verif-hash` header authenticates it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FlutterwaveEvent {
    pub event: String,
    pub data: FlutterwaveCharge,
}

/// Maps a Flutterwave charge status onto the generic vocabulary.
pub fn map_status(status: &str) -> GatewayStatus {
    match status.to_ascii_lowercase().as_str() {
        "successful" => GatewayStatus::Confirmed,
        "failed" | "cancelled" => GatewayStatus::Rejected,
        _ => GatewayStatus::Pending,
    }
}

/// Flutterwave signals business errors with `"status": "error"` in the envelope.
fn envelope_rejection(exchange: &Exchange) -> Option<GatewayResponse> {
    let body = exchange.json();
    if body.get("status").and_then(Value::as_str) != Some("error") {
        return None;
    }
    let mut response = with_status(
        GatewayStatus::Rejected,
        Some(body.get("code").and_then(scalar).unwrap_or_else(|| "REJECTED".into())),
    );
    response.message = body.get("message").and_then(scalar);
    Some(response)
}

#[derive(Debug)]
pub struct BankTransferAdapter {
    config: BankTransferConfig,
    client: Client,
}

impl BankTransferAdapter {
    pub fn new(config: BankTransferConfig, timeout: Duration) -> Result<Self, PaymentError> {
        Ok(Self {
            config,
            client: http::client(timeout)?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Flutterwave's numeric transaction id for a `tx_ref`; refunds are keyed by it.
    fn transaction_id(&self, tx_ref: &ExternalRef) -> Result<String, PaymentError> {
        let response = self
            .client
            .get(self.url("/transactions/verify_by_reference"))
            .bearer_auth(&self.config.secret_key)
            .query(&[("tx_ref", tx_ref.as_str())])
            .send()
            .map_err(|e| PaymentError::GatewayUnavailable(e.to_string()))?;
        let status = response.status();
        if status.is_server_error() {
            return Err(PaymentError::GatewayUnavailable(format!("verify HTTP {status}")));
        }
        if !status.is_success() {
            return Err(PaymentError::GatewayRejected {
                code: "TRANSACTION_NOT_FOUND".into(),
                message: format!("verify {tx_ref} HTTP {status}"),
            });
        }
        let body: Value = response
            .json()
            .map_err(|e| PaymentError::GatewayUnavailable(format!("verify response: {e}")))?;
        body.pointer("/data/id")
            .and_then(scalar)
            .ok_or_else(|| PaymentError::GatewayRejected {
                code: "TRANSACTION_NOT_FOUND".into(),
                message: format!("no transaction for {tx_ref}"),
            })
    }
}

impl ProviderAdapter for BankTransferAdapter {
    fn provider(&self) -> Provider {
        Provider::BankTransfer
    }

    fn initiate(&self, request: &InitiateRequest) -> GatewayResponse {
        let (options, customer) = match request.method {
            PaymentMethod::Card => ("card", json!({ "email": request.payer })),
            _ => ("banktransfer", json!({ "name": request.payer })),
        };
        let body = json!({
            "tx_ref": request.reference.as_str(),
            "amount": request.amount.to_string(),
            "currency": request.currency.as_str(),
            "redirect_url": self.config.redirect_url,
            "payment_options": options,
            "customer": customer,
            "meta": { "payable": request.payable.to_string() },
        });
        let call = Call::start(http::payload_of(&body));
        let builder = self
            .client
            .post(self.url("/payments"))
            .bearer_auth(&self.config.secret_key)
            .json(&body);
        let reference = request.reference.clone();
        call.send(builder, move |exchange| {
            envelope_rejection(exchange)
                .unwrap_or_else(|| with_status(GatewayStatus::Accepted, None))
                .external_ref(reference)
        })
    }

    fn query(&self, external_ref: &ExternalRef) -> GatewayResponse {
        let call = Call::start(format!("tx_ref={external_ref}").as_str().into());
        let builder = self
            .client
            .get(self.url("/transactions/verify_by_reference"))
            .bearer_auth(&self.config.secret_key)
            .query(&[("tx_ref", external_ref.as_str())]);
        let reference = external_ref.clone();
        call.send(builder, move |exchange| {
            if let Some(rejected) = envelope_rejection(exchange) {
                return rejected;
            }
            let status = exchange
                .json()
                .pointer("/data/status")
                .and_then(scalar)
                .unwrap_or_default();
            with_status(map_status(&status), Some(status)).external_ref(reference)
        })
    }

    fn refund(&self, request: &RefundCall) -> GatewayResponse {
        let body = json!({ "amount": request.amount.to_string(), "comments": request.reason });
        let call = Call::start(http::payload_of(&body));
        let id = match self.transaction_id(&request.payment_ref) {
            Ok(id) => id,
            Err(e) => return call.abort(&e),
        };

        let builder = self
            .client
            .post(self.url(&format!("/transactions/{id}/refund")))
            .bearer_auth(&self.config.secret_key)
            .json(&body);
        let fallback = request.refund_reference.clone();
        call.send(builder, move |exchange| {
            if let Some(rejected) = envelope_rejection(exchange) {
                return rejected;
            }
            let reference = exchange
                .json()
                .pointer("/data/id")
                .and_then(scalar)
                .map(ExternalRef::new)
                .unwrap_or(fallback);
            with_status(GatewayStatus::Accepted, None).external_ref(reference)
        })
    }

    fn signature_header(&self) -> &'static str {
        "verif-hash"
    }

    fn authenticate(&self, _body: &[u8], signature: Option<&str>) -> bool {
        signature.is_some_and(|provided| secure_eq(&self.config.webhook_hash, provided))
    }

    fn parse_notification(&self, body: &[u8]) -> Result<WebhookNotification, PaymentError> {
        let event: FlutterwaveEvent = parse_json(Provider::BankTransfer, body)?;
        if event.event != CHARGE_COMPLETED {
            return Err(PaymentError::Validation(format!(
                "unsupported Flutterwave event {}",
                event.event
            )));
        }
        let status = map_status(&event.data.status);
        Ok(WebhookNotification {
            external_ref: ExternalRef::new(event.data.tx_ref.clone()),
            status,
            delivery_id: Some(event.data.id.to_string()),
            reason: match status {
                GatewayStatus::Rejected => Some(event.data.status.clone()),
                _ => None,
            },
            payload: ProviderPayload::BankTransfer(event),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> BankTransferAdapter {
        BankTransferAdapter::new(
            BankTransferConfig {
                base_url: "http://127.0.0.1:9".into(),
                secret_key: "FLWSECK_TEST".into(),
                webhook_hash: "my-hash".into(),
                redirect_url: "https://example.test/callback".into(),
            },
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[test]
    fn status_mapping() {
        assert_eq!(map_status("successful"), GatewayStatus::Confirmed);
        assert_eq!(map_status("failed"), GatewayStatus::Rejected);
        assert_eq!(map_status("pending"), GatewayStatus::Pending);
    }

    #[test]
    fn verif_hash_must_match() {
        let adapter = adapter();
        assert!(adapter.authenticate(b"{}", Some("my-hash")));
        assert!(!adapter.authenticate(b"{}", Some("my-hasH")));
        assert!(!adapter.authenticate(b"{}", None));
    }

    #[test]
    fn parses_charge_completed() {
        let body = br#"{"event":"charge.completed","data":{"id":285959875,"tx_ref":"X123","flw_ref":"FLW-1","amount":5000,"currency":"RWF","status":"successful"}}"#;
        let notification = adapter().parse_notification(body).unwrap();
        assert_eq!(notification.external_ref, ExternalRef::new("X123"));
        assert_eq!(notification.status, GatewayStatus::Confirmed);
        assert_eq!(notification.delivery_id.as_deref(), Some("285959875"));
    }

    #[test]
    fn ignores_other_events() {
        let body = br#"{"event":"transfer.completed","data":{"id":1,"tx_ref":"X","status":"successful"}}"#;
        assert!(matches!(
            adapter().parse_notification(body),
            Err(PaymentError::Validation(_))
        ));
    }
}
